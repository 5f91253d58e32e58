//! A revision graph persisted as a flat file of checksummed node records.
//!
//! ```text
//! record := id:[u8; 32] timestamp:i64 parent_count:u32 parent:[u8; 32]*
//!           checksum:[u8; 32]
//! ```
//!
//! The checksum is the BLAKE3 digest of the preceding bytes of the record.
//! Integers are little endian. Records are only ever appended; a damaged or
//! truncated file is reported as [`Error::Inconsistent`] until it is cleared.

use std::collections::HashMap;
use std::fs::File;
use std::fs::OpenOptions;
use std::io::Read;
use std::io::Seek;
use std::io::SeekFrom;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Mutex;
use std::sync::PoisonError;

use bytes::Buf;
use bytes::BufMut;
use bytes::BytesMut;

use crate::error::Error;
use crate::error::Result;
use crate::graph::CommitNode;
use crate::graph::GraphBackend;
use crate::id::ObjectId;
use crate::id::ID_LEN;

const FIXED_LEN: usize = ID_LEN + 8 + 4;

struct EdgeFileInner {
    file: File,
    nodes: HashMap<ObjectId, CommitNode>,
    damage: Option<String>,
}

pub struct EdgeFileGraph {
    path: PathBuf,
    inner: Mutex<EdgeFileInner>,
}

impl std::fmt::Debug for EdgeFileGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EdgeFileGraph").field("path", &self.path).finish()
    }
}

fn encode(node: &CommitNode) -> Vec<u8> {
    let mut out = BytesMut::with_capacity(FIXED_LEN + node.parents.len() * ID_LEN + ID_LEN);
    out.put_slice(node.id.as_bytes());
    out.put_i64_le(node.timestamp);
    out.put_u32_le(node.parents.len() as u32);
    for parent in &node.parents {
        out.put_slice(parent.as_bytes());
    }
    let checksum = blake3::hash(&out);
    out.put_slice(checksum.as_bytes());
    out.to_vec()
}

fn take_id(buf: &mut &[u8]) -> ObjectId {
    let mut raw = [0u8; ID_LEN];
    buf.copy_to_slice(&mut raw);
    ObjectId::from_raw(raw)
}

/// Parses every record, stopping at the first damaged one.
fn decode_all(mut buf: &[u8]) -> (HashMap<ObjectId, CommitNode>, Option<String>) {
    let mut nodes = HashMap::new();
    let mut offset = 0usize;
    while !buf.is_empty() {
        let record = buf;
        if buf.len() < FIXED_LEN {
            return (nodes, Some(format!("truncated record at byte {offset}")));
        }
        let id = take_id(&mut buf);
        let timestamp = buf.get_i64_le();
        let count = buf.get_u32_le() as usize;
        let body_len = count.saturating_mul(ID_LEN);
        if buf.len() < body_len.saturating_add(ID_LEN) {
            return (nodes, Some(format!("truncated record at byte {offset}")));
        }
        let parents = (0..count).map(|_| take_id(&mut buf)).collect();
        let record_len = FIXED_LEN + body_len;
        let expected = blake3::hash(&record[..record_len]);
        if buf[..ID_LEN] != *expected.as_bytes() {
            return (nodes, Some(format!("checksum mismatch at byte {offset}")));
        }
        buf.advance(ID_LEN);
        offset += record_len + ID_LEN;
        nodes.insert(
            id,
            CommitNode {
                id,
                parents,
                timestamp,
            },
        );
    }
    (nodes, None)
}

impl EdgeFileInner {
    fn read_file(&mut self) -> Result<Vec<u8>> {
        let mut bytes = Vec::new();
        self.file.seek(SeekFrom::Start(0))?;
        self.file.read_to_end(&mut bytes)?;
        Ok(bytes)
    }

    fn ensure_sound(&self) -> Result<()> {
        match &self.damage {
            Some(reason) => Err(Error::Inconsistent(reason.clone())),
            None => Ok(()),
        }
    }
}

impl EdgeFileGraph {
    /// Opens (or creates) the edge file at `path` and loads it.
    ///
    /// A damaged file still opens; the damage is reported by every later
    /// call until [`GraphBackend::clear`].
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(path)?;
        let mut inner = EdgeFileInner {
            file,
            nodes: HashMap::new(),
            damage: None,
        };
        let bytes = inner.read_file()?;
        let (nodes, damage) = decode_all(&bytes);
        if let Some(reason) = &damage {
            tracing::warn!(path = %path.display(), %reason, "edge file is damaged");
        }
        inner.nodes = nodes;
        inner.damage = damage;
        Ok(EdgeFileGraph {
            path: path.to_owned(),
            inner: Mutex::new(inner),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn inner(&self) -> std::sync::MutexGuard<'_, EdgeFileInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl GraphBackend for EdgeFileGraph {
    fn insert(&self, node: CommitNode) -> Result<()> {
        let mut inner = self.inner();
        inner.ensure_sound()?;
        if inner.nodes.contains_key(&node.id) {
            return Ok(());
        }
        inner.file.write_all(&encode(&node))?;
        inner.nodes.insert(node.id, node);
        Ok(())
    }

    fn node(&self, id: &ObjectId) -> Result<Option<CommitNode>> {
        let inner = self.inner();
        inner.ensure_sound()?;
        Ok(inner.nodes.get(id).cloned())
    }

    fn len(&self) -> Result<usize> {
        let inner = self.inner();
        inner.ensure_sound()?;
        Ok(inner.nodes.len())
    }

    fn clear(&self) -> Result<()> {
        let mut inner = self.inner();
        inner.file.set_len(0)?;
        inner.nodes.clear();
        inner.damage = None;
        Ok(())
    }

    /// Re-reads the whole file, so damage done by other writers is noticed.
    fn check(&self) -> Result<()> {
        let mut inner = self.inner();
        inner.ensure_sound()?;
        let bytes = inner.read_file()?;
        let (nodes, damage) = decode_all(&bytes);
        if let Some(reason) = damage {
            inner.damage = Some(reason.clone());
            return Err(Error::Inconsistent(reason));
        }
        if nodes.len() != inner.nodes.len() {
            let reason = format!(
                "edge file holds {} nodes, {} expected",
                nodes.len(),
                inner.nodes.len()
            );
            inner.damage = Some(reason.clone());
            return Err(Error::Inconsistent(reason));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(n: u8, parents: &[u8]) -> CommitNode {
        CommitNode {
            id: ObjectId::from_raw([n; 32]),
            parents: parents.iter().map(|p| ObjectId::from_raw([*p; 32])).collect(),
            timestamp: n as i64 * 1000,
        }
    }

    #[test]
    fn nodes_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("graph.edges");
        {
            let graph = EdgeFileGraph::open(&path).unwrap();
            graph.insert(node(1, &[])).unwrap();
            graph.insert(node(2, &[1])).unwrap();
            graph.insert(node(2, &[1])).unwrap();
        }
        let graph = EdgeFileGraph::open(&path).unwrap();
        graph.check().unwrap();
        assert_eq!(graph.len().unwrap(), 2);
        assert_eq!(graph.node(&node(2, &[]).id).unwrap(), Some(node(2, &[1])));
    }

    #[test]
    fn flipped_byte_is_inconsistent_until_cleared() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("graph.edges");
        {
            let graph = EdgeFileGraph::open(&path).unwrap();
            graph.insert(node(1, &[])).unwrap();
        }
        let mut bytes = std::fs::read(&path).unwrap();
        bytes[ID_LEN] ^= 1;
        std::fs::write(&path, &bytes).unwrap();

        let graph = EdgeFileGraph::open(&path).unwrap();
        assert!(matches!(graph.check(), Err(Error::Inconsistent(_))));
        assert!(matches!(graph.node(&node(1, &[]).id), Err(Error::Inconsistent(_))));

        graph.clear().unwrap();
        graph.check().unwrap();
        assert_eq!(graph.len().unwrap(), 0);
    }

    #[test]
    fn check_notices_truncation_behind_its_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("graph.edges");
        let graph = EdgeFileGraph::open(&path).unwrap();
        graph.insert(node(1, &[])).unwrap();
        graph.insert(node(2, &[1])).unwrap();

        let len = std::fs::metadata(&path).unwrap().len();
        OpenOptions::new()
            .write(true)
            .open(&path)
            .unwrap()
            .set_len(len - 5)
            .unwrap();
        assert!(matches!(graph.check(), Err(Error::Inconsistent(_))));
    }
}

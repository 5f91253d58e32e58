//! Immutable objects: blobs, trees and commits.
//!
//! Blobs are opaque. Trees and commits use a small length-prefixed binary
//! encoding that has exactly one valid byte sequence per value, so that
//! re-encoding a decoded object always reproduces its id.
//!
//! ```text
//! tree    := count:u32 entry*
//! entry   := kind:u8 name_len:u32 name id:[u8; 32]
//! commit  := tree:[u8; 32] parent_count:u32 parent:[u8; 32]*
//!            timestamp:i64 author_len:u32 author message_len:u32 message
//! ```
//!
//! All integers are little endian.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;

use bytes::Buf;
use bytes::BufMut;
use bytes::Bytes;
use bytes::BytesMut;

use crate::error::Error;
use crate::error::Result;
use crate::id::ObjectId;
use crate::id::ID_LEN;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ObjectKind {
    Blob,
    Tree,
    Commit,
}

impl ObjectKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ObjectKind::Blob => "blob",
            ObjectKind::Tree => "tree",
            ObjectKind::Commit => "commit",
        }
    }

    /// Compact tag used in tree entries and pile records.
    pub fn tag(&self) -> u8 {
        match self {
            ObjectKind::Blob => 1,
            ObjectKind::Tree => 2,
            ObjectKind::Commit => 3,
        }
    }

    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            1 => Some(ObjectKind::Blob),
            2 => Some(ObjectKind::Tree),
            3 => Some(ObjectKind::Commit),
            _ => None,
        }
    }

    /// The framing prepended to a payload before hashing.
    pub fn header(&self, len: usize) -> String {
        format!("{} {}\0", self.as_str(), len)
    }
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ObjectKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "blob" => Ok(ObjectKind::Blob),
            "tree" => Ok(ObjectKind::Tree),
            "commit" => Ok(ObjectKind::Commit),
            other => Err(Error::Malformed(format!("unknown object kind {other:?}"))),
        }
    }
}

/// An object as the stores see it: a kind and its payload bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawObject {
    pub kind: ObjectKind,
    pub data: Bytes,
}

impl RawObject {
    pub fn new(kind: ObjectKind, data: impl Into<Bytes>) -> Self {
        RawObject {
            kind,
            data: data.into(),
        }
    }

    pub fn id(&self) -> ObjectId {
        ObjectId::hash_object(self.kind, &self.data)
    }

    /// The framed form that [`ObjectId::hash_stored`] hashes to [`RawObject::id`].
    pub fn to_stored(&self) -> Bytes {
        let header = self.kind.header(self.data.len());
        let mut out = BytesMut::with_capacity(header.len() + self.data.len());
        out.put_slice(header.as_bytes());
        out.put_slice(&self.data);
        out.freeze()
    }

    pub fn from_stored(stored: Bytes) -> Result<Self> {
        let Some(nul) = stored.iter().position(|b| *b == 0) else {
            return Err(Error::Malformed("missing object header".to_owned()));
        };
        let header = std::str::from_utf8(&stored[..nul])
            .map_err(|_| Error::Malformed("object header is not utf-8".to_owned()))?;
        let (kind, len) = header
            .split_once(' ')
            .ok_or_else(|| Error::Malformed(format!("bad object header {header:?}")))?;
        let kind: ObjectKind = kind.parse()?;
        let len: usize = len
            .parse()
            .map_err(|_| Error::Malformed(format!("bad object length {len:?}")))?;
        let data = stored.slice(nul + 1..);
        if data.len() != len {
            return Err(Error::Malformed(format!(
                "object header announces {len} bytes, found {}",
                data.len()
            )));
        }
        Ok(RawObject { kind, data })
    }

    pub fn decode(&self) -> Result<Object> {
        match self.kind {
            ObjectKind::Blob => Ok(Object::Blob(self.data.clone())),
            ObjectKind::Tree => Tree::decode(self.data.clone()).map(Object::Tree),
            ObjectKind::Commit => Commit::decode(self.data.clone()).map(Object::Commit),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Object {
    Blob(Bytes),
    Tree(Tree),
    Commit(Commit),
}

impl Object {
    pub fn kind(&self) -> ObjectKind {
        match self {
            Object::Blob(_) => ObjectKind::Blob,
            Object::Tree(_) => ObjectKind::Tree,
            Object::Commit(_) => ObjectKind::Commit,
        }
    }

    pub fn encode(&self) -> RawObject {
        match self {
            Object::Blob(data) => RawObject::new(ObjectKind::Blob, data.clone()),
            Object::Tree(tree) => RawObject::new(ObjectKind::Tree, tree.encode()),
            Object::Commit(commit) => RawObject::new(ObjectKind::Commit, commit.encode()),
        }
    }

    pub fn id(&self) -> ObjectId {
        self.encode().id()
    }

    /// Ids this object links to directly.
    pub fn children(&self) -> Vec<ObjectId> {
        match self {
            Object::Blob(_) => Vec::new(),
            Object::Tree(tree) => tree.iter().map(|entry| entry.id).collect(),
            Object::Commit(commit) => {
                let mut out = Vec::with_capacity(commit.parents.len() + 1);
                out.push(commit.tree);
                out.extend(commit.parents.iter().copied());
                out
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TreeEntry<'a> {
    pub name: &'a str,
    pub kind: ObjectKind,
    pub id: ObjectId,
}

/// A snapshot of one level of a hierarchical namespace.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Tree {
    entries: BTreeMap<String, (ObjectKind, ObjectId)>,
}

impl Tree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces an entry, returning the previous one.
    pub fn insert(
        &mut self,
        name: impl Into<String>,
        kind: ObjectKind,
        id: ObjectId,
    ) -> Result<Option<(ObjectKind, ObjectId)>> {
        let name = name.into();
        check_entry_name(&name)?;
        Ok(self.entries.insert(name, (kind, id)))
    }

    pub fn remove(&mut self, name: &str) -> Option<(ObjectKind, ObjectId)> {
        self.entries.remove(name)
    }

    pub fn get(&self, name: &str) -> Option<TreeEntry<'_>> {
        self.entries
            .get_key_value(name)
            .map(|(name, (kind, id))| TreeEntry {
                name,
                kind: *kind,
                id: *id,
            })
    }

    pub fn iter(&self) -> impl Iterator<Item = TreeEntry<'_>> {
        self.entries.iter().map(|(name, (kind, id))| TreeEntry {
            name,
            kind: *kind,
            id: *id,
        })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn encode(&self) -> Bytes {
        let mut out = BytesMut::new();
        out.put_u32_le(self.entries.len() as u32);
        for (name, (kind, id)) in &self.entries {
            out.put_u8(kind.tag());
            out.put_u32_le(name.len() as u32);
            out.put_slice(name.as_bytes());
            out.put_slice(id.as_bytes());
        }
        out.freeze()
    }

    fn decode(mut data: Bytes) -> Result<Self> {
        let count = take_u32(&mut data, "tree entry count")?;
        let mut entries = BTreeMap::new();
        let mut previous: Option<String> = None;
        for _ in 0..count {
            let tag = take_u8(&mut data, "tree entry kind")?;
            let kind = ObjectKind::from_tag(tag)
                .ok_or_else(|| Error::Malformed(format!("unknown tree entry kind {tag}")))?;
            let name = take_string(&mut data, "tree entry name")?;
            check_entry_name(&name)?;
            if previous.as_deref().is_some_and(|prev| prev >= name.as_str()) {
                return Err(Error::Malformed(format!(
                    "tree entry {name:?} is out of order"
                )));
            }
            let id = take_id(&mut data, "tree entry id")?;
            previous = Some(name.clone());
            entries.insert(name, (kind, id));
        }
        expect_end(&data, "tree")?;
        Ok(Tree { entries })
    }
}

fn check_entry_name(name: &str) -> Result<()> {
    if name.is_empty() || name.contains('/') || name.contains('\0') {
        return Err(Error::Malformed(format!("invalid tree entry name {name:?}")));
    }
    Ok(())
}

/// A snapshot plus parentage and metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Commit {
    pub tree: ObjectId,
    pub parents: Vec<ObjectId>,
    pub author: String,
    /// Milliseconds since the UNIX epoch.
    pub timestamp: i64,
    pub message: String,
}

impl Commit {
    /// A commit stamped with the current wall clock.
    pub fn new(
        tree: ObjectId,
        parents: Vec<ObjectId>,
        author: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or_default();
        Commit {
            tree,
            parents,
            author: author.into(),
            timestamp,
            message: message.into(),
        }
    }

    pub fn with_timestamp(mut self, timestamp: i64) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn is_merge(&self) -> bool {
        self.parents.len() > 1
    }

    fn encode(&self) -> Bytes {
        let mut out = BytesMut::new();
        out.put_slice(self.tree.as_bytes());
        out.put_u32_le(self.parents.len() as u32);
        for parent in &self.parents {
            out.put_slice(parent.as_bytes());
        }
        out.put_i64_le(self.timestamp);
        out.put_u32_le(self.author.len() as u32);
        out.put_slice(self.author.as_bytes());
        out.put_u32_le(self.message.len() as u32);
        out.put_slice(self.message.as_bytes());
        out.freeze()
    }

    fn decode(mut data: Bytes) -> Result<Self> {
        let tree = take_id(&mut data, "commit tree")?;
        let parent_count = take_u32(&mut data, "commit parent count")? as usize;
        if parent_count.saturating_mul(ID_LEN) > data.remaining() {
            return Err(Error::Malformed("commit parents are truncated".to_owned()));
        }
        let mut parents = Vec::with_capacity(parent_count);
        for _ in 0..parent_count {
            parents.push(take_id(&mut data, "commit parent")?);
        }
        if data.remaining() < 8 {
            return Err(Error::Malformed("commit timestamp is truncated".to_owned()));
        }
        let timestamp = data.get_i64_le();
        let author = take_string(&mut data, "commit author")?;
        let message = take_string(&mut data, "commit message")?;
        expect_end(&data, "commit")?;
        Ok(Commit {
            tree,
            parents,
            author,
            timestamp,
            message,
        })
    }
}

impl From<Tree> for Object {
    fn from(tree: Tree) -> Self {
        Object::Tree(tree)
    }
}

impl From<Commit> for Object {
    fn from(commit: Commit) -> Self {
        Object::Commit(commit)
    }
}

fn take_u8(data: &mut Bytes, what: &str) -> Result<u8> {
    if data.remaining() < 1 {
        return Err(Error::Malformed(format!("{what} is truncated")));
    }
    Ok(data.get_u8())
}

fn take_u32(data: &mut Bytes, what: &str) -> Result<u32> {
    if data.remaining() < 4 {
        return Err(Error::Malformed(format!("{what} is truncated")));
    }
    Ok(data.get_u32_le())
}

fn take_id(data: &mut Bytes, what: &str) -> Result<ObjectId> {
    if data.remaining() < ID_LEN {
        return Err(Error::Malformed(format!("{what} is truncated")));
    }
    let mut raw = [0u8; ID_LEN];
    data.copy_to_slice(&mut raw);
    Ok(ObjectId::from_raw(raw))
}

fn take_string(data: &mut Bytes, what: &str) -> Result<String> {
    let len = take_u32(data, what)? as usize;
    if data.remaining() < len {
        return Err(Error::Malformed(format!("{what} is truncated")));
    }
    let raw = data.split_to(len);
    String::from_utf8(raw.to_vec()).map_err(|_| Error::Malformed(format!("{what} is not utf-8")))
}

fn expect_end(data: &Bytes, what: &str) -> Result<()> {
    if data.has_remaining() {
        return Err(Error::Malformed(format!(
            "{} trailing bytes after {what}",
            data.remaining()
        )));
    }
    Ok(())
}

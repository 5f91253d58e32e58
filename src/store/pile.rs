//! A pile is an append-only file holding objects and ref updates. It is the
//! default local storage of a repository and can be shared between threads
//! and between processes.
//!
//! The log _is_ the database: the in-memory indices are rebuilt from the file
//! on [`Pile::refresh`] and nothing else is persisted. Once a record lies below
//! `applied_length` its bytes are assumed permanent; only the un-applied tail
//! may hide a partial append after a crash, and [`Pile::restore`] truncates
//! exactly that tail.
//!
//! # File Format
//! ## Object record
//! ```text
//!             ┌────16 byte───┐┌──────┐┌──────┐┌────────────32 byte───────────┐
//!           ┌ ┌──────────────┐┌──────┐┌──────┐┌──────────────────────────────┐
//!  header   │ │magic number A││length││ kind ││          object id           │
//!           └ └──────────────┘└──────┘└──────┘└──────────────────────────────┘
//!           ┌ ┌ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─┐
//!  payload  │ │              bytes (64 byte aligned and padded)              │
//!           └ └ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─┘
//! ```
//!
//! ## Ref record
//! ```text
//!             ┌────16 byte───┐┌──────┐┌──────┐┌────────────32 byte───────────┐
//!           ┌ ┌──────────────┐┌──────┐┌──────┐┌──────────────────────────────┐
//!  header   │ │magic number B││ name ││  op  ││            target            │
//!           └ └──────────────┘└──────┘└──────┘└──────────────────────────────┘
//!           ┌ ┌ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─┐
//!  name     │ │            utf-8 ref name (64 byte aligned and padded)       │
//!           └ └ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─┘
//! ```

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::fs::File;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::OnceLock;
use std::sync::PoisonError;

use bytes::Bytes;
use hex_literal::hex;
use memmap2::MmapOptions;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

use crate::error::Error;
use crate::error::Result;
use crate::id::ObjectId;
use crate::id::RawObjectId;
use crate::object::ObjectKind;
use crate::object::RawObject;
use crate::refs::Ref;
use crate::store::ObjectStore;
use crate::store::RefStore;

const MAGIC_MARKER_OBJECT: [u8; 16] = hex!("5A3C09E1B7D24F8A9C61E0F3D4B58A27");
const MAGIC_MARKER_REF: [u8; 16] = hex!("C84E2B7190AF4D3EB5D6091F7A3C26E4");

const HEADER_LEN: usize = std::mem::size_of::<ObjectHeader>();
const RECORD_ALIGNMENT: usize = HEADER_LEN;

const REF_SET: u64 = 0;
const REF_DELETE: u64 = 1;

const _: () = assert!(std::mem::size_of::<RefHeader>() == HEADER_LEN);

#[derive(Debug, Clone, Copy)]
enum ValidationState {
    Validated,
    Invalid,
}

#[derive(Debug, Clone)]
struct IndexEntry {
    state: Arc<OnceLock<ValidationState>>,
    offset: usize,
    len: usize,
    kind: ObjectKind,
}

#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Copy, Clone)]
#[repr(C)]
struct ObjectHeader {
    magic_marker: [u8; 16],
    length: u64,
    kind: u64,
    hash: RawObjectId,
}

#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Copy, Clone)]
#[repr(C)]
struct RefHeader {
    magic_marker: [u8; 16],
    name_length: u64,
    op: u64,
    target: RawObjectId,
}

fn padding_for(len: usize) -> usize {
    (RECORD_ALIGNMENT - (len % RECORD_ALIGNMENT)) % RECORD_ALIGNMENT
}

enum Applied {
    Object(ObjectId),
    Ref {
        name: String,
        target: Option<ObjectId>,
    },
}

#[derive(Debug, thiserror::Error)]
enum ReadError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("pile is corrupt after byte {valid_length}")]
    Corrupt { valid_length: usize },
}

impl From<ReadError> for Error {
    fn from(err: ReadError) -> Self {
        match err {
            ReadError::Io(e) => Error::Io(e),
            err @ ReadError::Corrupt { .. } => Error::backend("pile", err),
        }
    }
}

struct PileInner {
    file: File,
    /// Mapping of the file as of the last growth; never read past `applied_length`.
    data: Bytes,
    /// Length of the prefix that has been validated and applied.
    applied_length: usize,
    objects: HashMap<ObjectId, IndexEntry>,
    refs: BTreeMap<String, ObjectId>,
}

impl PileInner {
    fn remap(&mut self, file_len: usize) -> std::io::Result<()> {
        if file_len <= self.data.len() {
            return Ok(());
        }
        // Safety: records below the mapped length are never rewritten, and
        // only the tail beyond `applied_length` is ever truncated.
        let mmap = unsafe { MmapOptions::new().len(file_len).map(&self.file)? };
        self.data = Bytes::from_owner(mmap);
        Ok(())
    }

    fn apply_next(&mut self) -> Result<Option<Applied>, ReadError> {
        let file_len = self.file.metadata()?.len() as usize;
        if file_len < self.applied_length {
            return Err(ReadError::Io(std::io::Error::other(
                "pile shrank below its applied length",
            )));
        }
        if file_len == self.applied_length {
            return Ok(None);
        }
        self.remap(file_len)?;

        let start = self.applied_length;
        let corrupt = || ReadError::Corrupt {
            valid_length: start,
        };
        let rest = &self.data[start..file_len];
        let (header, _) = ObjectHeader::read_from_prefix(rest).map_err(|_| corrupt())?;
        match header.magic_marker {
            MAGIC_MARKER_OBJECT => {
                let len = usize::try_from(header.length).map_err(|_| corrupt())?;
                let kind = u8::try_from(header.kind)
                    .ok()
                    .and_then(ObjectKind::from_tag)
                    .ok_or_else(corrupt)?;
                let total = HEADER_LEN
                    .checked_add(len)
                    .and_then(|n| n.checked_add(padding_for(len)))
                    .ok_or_else(corrupt)?;
                if rest.len() < total {
                    return Err(corrupt());
                }
                let id = ObjectId::from_raw(header.hash);
                let entry = IndexEntry {
                    state: Arc::new(OnceLock::new()),
                    offset: start + HEADER_LEN,
                    len,
                    kind,
                };
                let keep_existing = match self.objects.get(&id) {
                    None => false,
                    Some(existing) => {
                        matches!(self.validate(&id, existing), ValidationState::Validated)
                    }
                };
                if !keep_existing {
                    self.objects.insert(id, entry);
                }
                self.applied_length = start + total;
                Ok(Some(Applied::Object(id)))
            }
            MAGIC_MARKER_REF => {
                let (header, _) = RefHeader::read_from_prefix(rest).map_err(|_| corrupt())?;
                let len = usize::try_from(header.name_length).map_err(|_| corrupt())?;
                let total = HEADER_LEN
                    .checked_add(len)
                    .and_then(|n| n.checked_add(padding_for(len)))
                    .ok_or_else(corrupt)?;
                if rest.len() < total {
                    return Err(corrupt());
                }
                let name = std::str::from_utf8(&rest[HEADER_LEN..HEADER_LEN + len])
                    .map_err(|_| corrupt())?
                    .to_owned();
                let target = ObjectId::from_raw(header.target);
                let target = match header.op {
                    REF_SET => {
                        self.refs.insert(name.clone(), target);
                        Some(target)
                    }
                    REF_DELETE => {
                        self.refs.remove(&name);
                        None
                    }
                    _ => return Err(corrupt()),
                };
                self.applied_length = start + total;
                Ok(Some(Applied::Ref { name, target }))
            }
            _ => Err(corrupt()),
        }
    }

    fn refresh_locked(&mut self) -> Result<(), ReadError> {
        while self.apply_next()?.is_some() {}
        Ok(())
    }

    fn validate(&self, id: &ObjectId, entry: &IndexEntry) -> ValidationState {
        *entry.state.get_or_init(|| {
            let payload = &self.data[entry.offset..entry.offset + entry.len];
            if ObjectId::hash_object(entry.kind, payload) == *id {
                ValidationState::Validated
            } else {
                ValidationState::Invalid
            }
        })
    }

    fn lookup(&self, id: &ObjectId) -> Result<Option<RawObject>> {
        let Some(entry) = self.objects.get(id) else {
            return Ok(None);
        };
        match self.validate(id, entry) {
            ValidationState::Validated => {
                let payload = &self.data[entry.offset..entry.offset + entry.len];
                Ok(Some(RawObject::new(
                    entry.kind,
                    Bytes::copy_from_slice(payload),
                )))
            }
            ValidationState::Invalid => Err(Error::Corrupt(*id)),
        }
    }

    /// Runs `f` while holding the file lock, shared or exclusive.
    fn locked<T>(
        &mut self,
        exclusive: bool,
        f: impl FnOnce(&mut PileInner) -> Result<T>,
    ) -> Result<T> {
        if exclusive {
            self.file.lock()?;
        } else {
            self.file.lock_shared()?;
        }
        let res = f(self);
        let unlock_res = self.file.unlock();
        let out = res?;
        unlock_res?;
        Ok(out)
    }

    fn write_ref(&mut self, name: &str, op: u64, target: ObjectId) -> Result<()> {
        let header = RefHeader {
            magic_marker: MAGIC_MARKER_REF,
            name_length: name.len() as u64,
            op,
            target: *target.as_bytes(),
        };
        let mut record = Vec::with_capacity(HEADER_LEN + name.len() + RECORD_ALIGNMENT);
        record.extend_from_slice(header.as_bytes());
        record.extend_from_slice(name.as_bytes());
        record.resize(record.len() + padding_for(name.len()), 0);
        self.file.write_all(&record)?;
        self.file.sync_data()?;

        let expected = (op == REF_SET).then_some(target);
        match self.apply_next()? {
            Some(Applied::Ref { name: n, target: t }) if n == name && t == expected => Ok(()),
            Some(_) => Err(Error::Io(std::io::Error::other(
                "unexpected record after ref write",
            ))),
            None => Err(Error::Io(std::io::Error::other("ref missing after write"))),
        }
    }
}

/// Append-only single-file storage for objects and refs.
pub struct Pile {
    path: PathBuf,
    inner: Mutex<PileInner>,
}

impl std::fmt::Debug for Pile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pile").field("path", &self.path).finish()
    }
}

impl Pile {
    /// Opens (or creates) a pile without scanning it.
    ///
    /// The returned pile has an empty index; call [`Pile::refresh`] to load
    /// existing records or [`Pile::restore`] to repair and load after a crash.
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(path)?;
        Ok(Pile {
            path: path.to_owned(),
            inner: Mutex::new(PileInner {
                file,
                data: Bytes::new(),
                applied_length: 0,
                objects: HashMap::new(),
                refs: BTreeMap::new(),
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn inner(&self) -> std::sync::MutexGuard<'_, PileInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Applies records appended since the last refresh, including those
    /// written by other processes.
    pub fn refresh(&self) -> Result<()> {
        self.inner()
            .locked(false, |inner| Ok(inner.refresh_locked()?))
    }

    /// Restores a pile after a partial or corrupt append.
    ///
    /// Attempts a regular refresh first. On corruption it takes the exclusive
    /// lock, re-checks and truncates the file to the last valid record.
    pub fn restore(&self) -> Result<()> {
        let mut inner = self.inner();
        match inner.locked(false, |inner| Ok(inner.refresh_locked()?)) {
            Ok(()) => Ok(()),
            Err(Error::Backend { backend: "pile", .. }) => inner.locked(true, |inner| {
                match inner.refresh_locked() {
                    Ok(()) => Ok(()),
                    Err(ReadError::Corrupt { valid_length }) => {
                        tracing::warn!(
                            path = %self.path.display(),
                            valid_length,
                            "truncating corrupt pile tail"
                        );
                        inner.file.set_len(valid_length as u64)?;
                        inner.file.sync_all()?;
                        inner.applied_length = valid_length;
                        inner.data = Bytes::new();
                        if valid_length > 0 {
                            inner.remap(valid_length)?;
                        }
                        Ok(())
                    }
                    Err(e) => Err(e.into()),
                }
            }),
            Err(e) => Err(e),
        }
    }

    /// Persists all writes to disk.
    pub fn flush(&self) -> Result<()> {
        self.inner().file.sync_all()?;
        Ok(())
    }

    /// Flushes and consumes the pile.
    pub fn close(self) -> Result<()> {
        self.flush()
    }
}

impl ObjectStore for Pile {
    fn put(&self, object: &RawObject) -> Result<ObjectId> {
        let id = object.id();
        self.inner().locked(true, |inner| {
            inner.refresh_locked()?;
            if let Some(entry) = inner.objects.get(&id) {
                if matches!(inner.validate(&id, entry), ValidationState::Validated) {
                    return Ok(id);
                }
            }

            let len = object.data.len();
            let header = ObjectHeader {
                magic_marker: MAGIC_MARKER_OBJECT,
                length: len as u64,
                kind: object.kind.tag() as u64,
                hash: *id.as_bytes(),
            };
            let mut record = Vec::with_capacity(HEADER_LEN + len + RECORD_ALIGNMENT);
            record.extend_from_slice(header.as_bytes());
            record.extend_from_slice(&object.data);
            record.resize(record.len() + padding_for(len), 0);
            inner.file.write_all(&record)?;

            loop {
                match inner.apply_next()? {
                    Some(Applied::Object(applied)) if applied == id => break,
                    Some(_) => {}
                    None => {
                        return Err(Error::Io(std::io::Error::other(
                            "object missing after write",
                        )))
                    }
                }
            }
            Ok(id)
        })
    }

    fn get(&self, id: &ObjectId) -> Result<RawObject> {
        let mut inner = self.inner();
        if let Some(object) = inner.lookup(id)? {
            return Ok(object);
        }
        inner.locked(false, |inner| Ok(inner.refresh_locked()?))?;
        inner.lookup(id)?.ok_or(Error::NotFound(*id))
    }

    fn exists(&self, id: &ObjectId) -> Result<bool> {
        let mut inner = self.inner();
        if inner.objects.contains_key(id) {
            return Ok(true);
        }
        inner.locked(false, |inner| Ok(inner.refresh_locked()?))?;
        Ok(inner.objects.contains_key(id))
    }

    fn ids(&self) -> Result<std::vec::IntoIter<ObjectId>> {
        let mut inner = self.inner();
        inner.locked(false, |inner| Ok(inner.refresh_locked()?))?;
        Ok(inner.objects.keys().copied().collect::<Vec<_>>().into_iter())
    }
}

impl RefStore for Pile {
    fn head(&self, name: &str) -> Result<Option<ObjectId>> {
        let mut inner = self.inner();
        inner.locked(false, |inner| Ok(inner.refresh_locked()?))?;
        Ok(inner.refs.get(name).copied())
    }

    /// The record is synced to disk before the call returns.
    fn update(&self, name: &str, expected: Option<ObjectId>, new: ObjectId) -> Result<()> {
        self.inner().locked(true, |inner| {
            inner.refresh_locked()?;
            let current = inner.refs.get(name).copied();
            if current != expected {
                return Err(Error::CompareAndSwapFailed {
                    name: name.to_owned(),
                    expected,
                    actual: current,
                });
            }
            inner.write_ref(name, REF_SET, new)
        })
    }

    fn delete(&self, name: &str, expected: ObjectId) -> Result<()> {
        self.inner().locked(true, |inner| {
            inner.refresh_locked()?;
            match inner.refs.get(name).copied() {
                None => return Err(Error::RefNotFound(name.to_owned())),
                Some(current) if current != expected => {
                    return Err(Error::CompareAndSwapFailed {
                        name: name.to_owned(),
                        expected: Some(expected),
                        actual: Some(current),
                    })
                }
                Some(_) => {}
            }
            inner.write_ref(name, REF_DELETE, expected)
        })
    }

    fn list(&self, prefix: &str) -> Result<std::vec::IntoIter<Ref>> {
        let mut inner = self.inner();
        inner.locked(false, |inner| Ok(inner.refresh_locked()?))?;
        Ok(inner
            .refs
            .range(prefix.to_owned()..)
            .take_while(|(name, _)| name.starts_with(prefix))
            .map(|(name, target)| Ref::new(name.clone(), *target))
            .collect::<Vec<_>>()
            .into_iter())
    }
}

//! Storage contracts for objects and refs.
//!
//! The design mirrors git: object storage is a content-addressed bag of
//! immutable bytes with no notion of time or order, which lets it live almost
//! anywhere (a local pile file, an S3 bucket, memory). Refs are the only
//! mutable state and are changed exclusively through compare-and-swap, so a
//! background synchronizer and a foreground user can share a repository
//! without locks.
//!
//! Backends are picked by [`open_storage`] from a [`StorageKind`] and a
//! location; nothing above this module knows which one is in use.

pub mod memory;
pub mod objectstore;
pub mod pile;

use std::collections::HashSet;
use std::collections::VecDeque;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::Deserialize;
use serde::Serialize;
use url::Url;

use crate::error::Error;
use crate::error::Result;
use crate::id::ObjectId;
use crate::object::Commit;
use crate::object::Object;
use crate::object::ObjectKind;
use crate::object::RawObject;
use crate::refs::Ref;

pub use memory::MemoryStore;
pub use objectstore::ObjectStoreBackend;
pub use pile::Pile;

/// Content-addressed object storage.
///
/// Implementations never need read locking: an id names the same bytes
/// forever. Writes must be atomic per object and idempotent.
pub trait ObjectStore: Send + Sync {
    /// Stores `object` and returns its id. Storing identical content again
    /// returns the same id without writing anything.
    fn put(&self, object: &RawObject) -> Result<ObjectId>;

    /// Fails with [`Error::NotFound`] when the object is absent and with
    /// [`Error::Corrupt`] when its stored bytes no longer match `id`.
    fn get(&self, id: &ObjectId) -> Result<RawObject>;

    fn exists(&self, id: &ObjectId) -> Result<bool>;

    /// A snapshot of every stored id.
    fn ids(&self) -> Result<std::vec::IntoIter<ObjectId>>;

    fn insert(&self, object: &Object) -> Result<ObjectId> {
        self.put(&object.encode())
    }

    fn read(&self, id: &ObjectId) -> Result<Object> {
        self.get(id)?.decode()
    }

    fn read_commit(&self, id: &ObjectId) -> Result<Commit> {
        let raw = self.get(id)?;
        if raw.kind != ObjectKind::Commit {
            return Err(Error::UnexpectedKind {
                id: *id,
                expected: ObjectKind::Commit,
                found: raw.kind,
            });
        }
        match raw.decode()? {
            Object::Commit(commit) => Ok(commit),
            other => Err(Error::UnexpectedKind {
                id: *id,
                expected: ObjectKind::Commit,
                found: other.kind(),
            }),
        }
    }
}

/// Mutable names for objects.
///
/// Every mutation is a compare-and-swap; there is no blind overwrite.
pub trait RefStore: Send + Sync {
    /// The current target of `name`, if it exists.
    fn head(&self, name: &str) -> Result<Option<ObjectId>>;

    /// Sets `name` to `new` if it currently holds `expected`, where `None`
    /// means the ref must not exist yet. Fails with
    /// [`Error::CompareAndSwapFailed`] otherwise.
    fn update(&self, name: &str, expected: Option<ObjectId>, new: ObjectId) -> Result<()>;

    /// Removes `name` if it currently holds `expected`.
    fn delete(&self, name: &str, expected: ObjectId) -> Result<()>;

    /// Refs whose names start with `prefix`, ordered by name.
    fn list(&self, prefix: &str) -> Result<std::vec::IntoIter<Ref>>;

    fn resolve(&self, name: &str) -> Result<ObjectId> {
        self.head(name)?
            .ok_or_else(|| Error::RefNotFound(name.to_owned()))
    }
}

impl<T: ObjectStore + ?Sized> ObjectStore for Arc<T> {
    fn put(&self, object: &RawObject) -> Result<ObjectId> {
        (**self).put(object)
    }

    fn get(&self, id: &ObjectId) -> Result<RawObject> {
        (**self).get(id)
    }

    fn exists(&self, id: &ObjectId) -> Result<bool> {
        (**self).exists(id)
    }

    fn ids(&self) -> Result<std::vec::IntoIter<ObjectId>> {
        (**self).ids()
    }
}

impl<T: RefStore + ?Sized> RefStore for Arc<T> {
    fn head(&self, name: &str) -> Result<Option<ObjectId>> {
        (**self).head(name)
    }

    fn update(&self, name: &str, expected: Option<ObjectId>, new: ObjectId) -> Result<()> {
        (**self).update(name, expected, new)
    }

    fn delete(&self, name: &str, expected: ObjectId) -> Result<()> {
        (**self).delete(name, expected)
    }

    fn list(&self, prefix: &str) -> Result<std::vec::IntoIter<Ref>> {
        (**self).list(prefix)
    }
}

/// Iterator that visits every object id reachable from a set of roots.
///
/// Breadth-first; each id is yielded once. An object that cannot be read is
/// yielded as an error and its children are skipped.
pub struct Reachable<'a, S: ObjectStore + ?Sized> {
    store: &'a S,
    queue: VecDeque<ObjectId>,
    visited: HashSet<ObjectId>,
}

impl<'a, S: ObjectStore + ?Sized> Reachable<'a, S> {
    fn new(store: &'a S, roots: impl IntoIterator<Item = ObjectId>) -> Self {
        Self {
            store,
            queue: roots.into_iter().collect(),
            visited: HashSet::new(),
        }
    }
}

impl<S: ObjectStore + ?Sized> Iterator for Reachable<'_, S> {
    type Item = Result<ObjectId>;

    fn next(&mut self) -> Option<Self::Item> {
        while let Some(id) = self.queue.pop_front() {
            if !self.visited.insert(id) {
                continue;
            }
            let object = match self.store.read(&id) {
                Ok(object) => object,
                Err(e) => return Some(Err(e)),
            };
            for child in object.children() {
                if !self.visited.contains(&child) {
                    self.queue.push_back(child);
                }
            }
            return Some(Ok(id));
        }
        None
    }
}

/// Create a breadth-first iterator over ids reachable from `roots`.
/// Call again to restart.
pub fn closure<S, I>(store: &S, roots: I) -> Reachable<'_, S>
where
    S: ObjectStore + ?Sized,
    I: IntoIterator<Item = ObjectId>,
{
    Reachable::new(store, roots)
}

/// Object and ref storage of one repository.
#[derive(Clone)]
pub struct Storage {
    pub objects: Arc<dyn ObjectStore>,
    pub refs: Arc<dyn RefStore>,
}

impl fmt::Debug for Storage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Storage").finish_non_exhaustive()
    }
}

impl Storage {
    pub fn new<T>(store: Arc<T>) -> Self
    where
        T: ObjectStore + RefStore + 'static,
    {
        Storage {
            objects: store.clone(),
            refs: store,
        }
    }

    pub fn memory() -> Self {
        Storage::new(Arc::new(MemoryStore::new()))
    }
}

/// Storage backend identifier.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StorageKind {
    Memory,
    #[default]
    Pile,
    ObjectStore,
}

impl StorageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StorageKind::Memory => "memory",
            StorageKind::Pile => "pile",
            StorageKind::ObjectStore => "object-store",
        }
    }
}

impl FromStr for StorageKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "memory" => Ok(StorageKind::Memory),
            "pile" => Ok(StorageKind::Pile),
            "object-store" => Ok(StorageKind::ObjectStore),
            other => Err(Error::Config(format!("unknown storage backend {other:?}"))),
        }
    }
}

/// Opens the storage backend `kind` at `location`.
///
/// `location` is a file path for [`StorageKind::Pile`], an `object_store` URL
/// for [`StorageKind::ObjectStore`] and ignored for [`StorageKind::Memory`].
pub fn open_storage(kind: StorageKind, location: &str) -> Result<Storage> {
    match kind {
        StorageKind::Memory => Ok(Storage::memory()),
        StorageKind::Pile => {
            let pile = Pile::open(std::path::Path::new(location))?;
            pile.restore()?;
            Ok(Storage::new(Arc::new(pile)))
        }
        StorageKind::ObjectStore => {
            let url = Url::parse(location)
                .map_err(|e| Error::Config(format!("bad object store url {location:?}: {e}")))?;
            let store = ObjectStoreBackend::with_url(&url)?;
            Ok(Storage::new(Arc::new(store)))
        }
    }
}

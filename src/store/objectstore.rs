use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::TryStreamExt;
use object_store::parse_url;
use object_store::path::Path;
use object_store::PutMode;
use object_store::PutPayload;
use object_store::UpdateVersion;
use url::Url;

use crate::error::Error;
use crate::error::Result;
use crate::error::TransportError;
use crate::id::ObjectId;
use crate::id::ID_LEN;
use crate::object::RawObject;
use crate::refs::Ref;
use crate::store::ObjectStore;
use crate::store::RefStore;

const OBJECT_INFIX: &str = "objects";
const REF_INFIX: &str = "refs";

/// Default bound on a single request.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Storage backed by an [`object_store`] compatible service (S3, GCS, Azure,
/// local directories, memory).
///
/// Objects live at `<prefix>/objects/<hex id>` in their framed form and refs
/// at `<prefix>/refs/...` as the 32 raw bytes of their target. Ref updates
/// use conditional puts, so the backing service must support
/// [`PutMode::Update`]; deletes compare first and are not atomic.
pub struct ObjectStoreBackend {
    store: Arc<dyn object_store::ObjectStore>,
    prefix: Path,
    url: String,
    runtime: tokio::runtime::Runtime,
    timeout: Duration,
}

impl fmt::Debug for ObjectStoreBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectStoreBackend")
            .field("url", &self.url)
            .field("prefix", &self.prefix)
            .finish()
    }
}

fn store_err(e: object_store::Error) -> Error {
    Error::backend("object-store", e)
}

impl ObjectStoreBackend {
    /// Opens the store described by `url`, e.g. `memory:///` or
    /// `s3://bucket/path`.
    pub fn with_url(url: &Url) -> Result<Self> {
        let (store, prefix) = parse_url(url).map_err(|e| Error::Transport {
            remote: url.to_string(),
            source: TransportError::UnsupportedUrl(format!("{url}: {e}")),
        })?;
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("strata-object-store")
            .enable_all()
            .build()?;
        Ok(ObjectStoreBackend {
            store: Arc::from(store),
            prefix,
            url: url.to_string(),
            runtime,
            timeout: DEFAULT_TIMEOUT,
        })
    }

    /// Bounds every request to `timeout`.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Drives `fut` to completion, bounded by the configured timeout.
    fn run<F: Future>(&self, fut: F) -> Result<F::Output> {
        let timeout = self.timeout;
        self.runtime
            .block_on(async move { tokio::time::timeout(timeout, fut).await })
            .map_err(|_| Error::Transport {
                remote: self.url.clone(),
                source: TransportError::Timeout(timeout),
            })
    }

    fn block_on<F, T>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T, object_store::Error>>,
    {
        self.run(fut)?.map_err(store_err)
    }

    fn object_path(&self, id: &ObjectId) -> Path {
        self.prefix.child(OBJECT_INFIX).child(id.to_hex())
    }

    fn ref_path(&self, name: &str) -> Path {
        name.split('/')
            .fold(self.prefix.clone(), |path, part| path.child(part))
    }

    /// Reads a ref together with the version needed to update it.
    fn read_ref(&self, path: &Path) -> Result<Option<(ObjectId, UpdateVersion)>> {
        let result = self.block_on(async {
            match self.store.get(path).await {
                Ok(object) => {
                    let version = UpdateVersion {
                        e_tag: object.meta.e_tag.clone(),
                        version: object.meta.version.clone(),
                    };
                    object.bytes().await.map(|bytes| Some((bytes, version)))
                }
                Err(object_store::Error::NotFound { .. }) => Ok(None),
                Err(e) => Err(e),
            }
        })?;
        let Some((bytes, version)) = result else {
            return Ok(None);
        };
        let raw: [u8; ID_LEN] = bytes[..].try_into().map_err(|_| {
            Error::Malformed(format!("ref {path} holds {} bytes", bytes.len()))
        })?;
        Ok(Some((ObjectId::from_raw(raw), version)))
    }
}

impl ObjectStore for ObjectStoreBackend {
    fn put(&self, object: &RawObject) -> Result<ObjectId> {
        let id = object.id();
        let path = self.object_path(&id);
        let payload = PutPayload::from_bytes(object.to_stored());
        let result = self.run(self.store.put_opts(&path, payload, PutMode::Create.into()))?;
        match result {
            Ok(_) | Err(object_store::Error::AlreadyExists { .. }) => Ok(id),
            Err(e) => Err(store_err(e)),
        }
    }

    fn get(&self, id: &ObjectId) -> Result<RawObject> {
        let path = self.object_path(id);
        let stored = self.block_on(async {
            match self.store.get(&path).await {
                Ok(object) => object.bytes().await.map(Some),
                Err(object_store::Error::NotFound { .. }) => Ok(None),
                Err(e) => Err(e),
            }
        })?;
        let stored = stored.ok_or(Error::NotFound(*id))?;
        if ObjectId::hash_stored(&stored) != *id {
            return Err(Error::Corrupt(*id));
        }
        RawObject::from_stored(stored).map_err(|_| Error::Corrupt(*id))
    }

    fn exists(&self, id: &ObjectId) -> Result<bool> {
        let path = self.object_path(id);
        self.block_on(async {
            match self.store.head(&path).await {
                Ok(_) => Ok(true),
                Err(object_store::Error::NotFound { .. }) => Ok(false),
                Err(e) => Err(e),
            }
        })
    }

    fn ids(&self) -> Result<std::vec::IntoIter<ObjectId>> {
        let prefix = self.prefix.child(OBJECT_INFIX);
        let metas: Vec<_> =
            self.block_on(async { self.store.list(Some(&prefix)).try_collect().await })?;
        let mut ids = Vec::with_capacity(metas.len());
        for meta in metas {
            let Some(name) = meta.location.filename() else {
                continue;
            };
            match ObjectId::from_hex(name) {
                Ok(id) => ids.push(id),
                Err(_) => tracing::debug!(location = %meta.location, "skipping foreign object"),
            }
        }
        Ok(ids.into_iter())
    }
}

impl RefStore for ObjectStoreBackend {
    fn head(&self, name: &str) -> Result<Option<ObjectId>> {
        Ok(self.read_ref(&self.ref_path(name))?.map(|(id, _)| id))
    }

    fn update(&self, name: &str, expected: Option<ObjectId>, new: ObjectId) -> Result<()> {
        let path = self.ref_path(name);
        let payload = PutPayload::from_bytes(bytes::Bytes::copy_from_slice(new.as_bytes()));
        let conflict = |actual| Error::CompareAndSwapFailed {
            name: name.to_owned(),
            expected,
            actual,
        };
        loop {
            let current = self.read_ref(&path)?;
            let mode = match (expected, current) {
                (None, None) => PutMode::Create,
                (Some(old), Some((stored, version))) if old == stored => PutMode::Update(version),
                (_, current) => return Err(conflict(current.map(|(id, _)| id))),
            };
            let result = self.run(self.store.put_opts(&path, payload.clone(), mode.into()))?;
            match result {
                Ok(_) => return Ok(()),
                // Somebody raced us; re-read and let the comparison decide.
                Err(object_store::Error::Precondition { .. })
                | Err(object_store::Error::AlreadyExists { .. }) => continue,
                Err(e) => return Err(store_err(e)),
            }
        }
    }

    fn delete(&self, name: &str, expected: ObjectId) -> Result<()> {
        let path = self.ref_path(name);
        match self.read_ref(&path)?.map(|(id, _)| id) {
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
        self.block_on(async {
            match self.store.delete(&path).await {
                Ok(()) | Err(object_store::Error::NotFound { .. }) => Ok(()),
                Err(e) => Err(e),
            }
        })
    }

    fn list(&self, prefix: &str) -> Result<std::vec::IntoIter<Ref>> {
        let root = self.prefix.child(REF_INFIX);
        let metas: Vec<_> =
            self.block_on(async { self.store.list(Some(&root)).try_collect().await })?;
        let mut names: Vec<String> = metas
            .iter()
            .filter_map(|meta| {
                let parts = meta.location.prefix_match(&self.prefix)?;
                Some(parts.map(|p| p.as_ref().to_owned()).collect::<Vec<_>>().join("/"))
            })
            .filter(|name| name.starts_with(prefix))
            .collect();
        names.sort();

        let mut refs = Vec::with_capacity(names.len());
        for name in names {
            // Deleted between listing and reading.
            if let Some(target) = self.head(&name)? {
                refs.push(Ref::new(name, target));
            }
        }
        Ok(refs.into_iter())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::ObjectKind;

    fn memory() -> ObjectStoreBackend {
        ObjectStoreBackend::with_url(&Url::parse("memory:///").unwrap()).unwrap()
    }

    #[test]
    fn objects_roundtrip_and_are_idempotent() {
        let store = memory();
        let raw = RawObject::new(ObjectKind::Blob, &b"zoning"[..]);
        let id = store.put(&raw).unwrap();
        assert_eq!(store.put(&raw).unwrap(), id);
        assert_eq!(store.get(&id).unwrap(), raw);
        assert!(store.exists(&id).unwrap());
        assert_eq!(store.ids().unwrap().collect::<Vec<_>>(), vec![id]);

        let missing = RawObject::new(ObjectKind::Blob, &b"absent"[..]).id();
        assert!(matches!(store.get(&missing), Err(Error::NotFound(_))));
        assert!(!store.exists(&missing).unwrap());
    }

    #[test]
    fn refs_use_compare_and_swap() {
        let store = memory();
        let a = store.put(&RawObject::new(ObjectKind::Blob, &b"a"[..])).unwrap();
        let b = store.put(&RawObject::new(ObjectKind::Blob, &b"b"[..])).unwrap();

        store.update("refs/heads/main", None, a).unwrap();
        assert!(matches!(
            store.update("refs/heads/main", None, b),
            Err(Error::CompareAndSwapFailed { actual: Some(x), .. }) if x == a
        ));
        assert!(store.update("refs/heads/main", Some(b), b).is_err());
        store.update("refs/heads/main", Some(a), b).unwrap();
        assert_eq!(store.head("refs/heads/main").unwrap(), Some(b));

        store.update("refs/tags/v1", None, a).unwrap();
        let names: Vec<_> = store.list("refs/heads/").unwrap().map(|r| r.name).collect();
        assert_eq!(names, vec!["refs/heads/main"]);

        store.delete("refs/tags/v1", a).unwrap();
        assert_eq!(store.head("refs/tags/v1").unwrap(), None);
    }
}

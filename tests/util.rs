#![allow(dead_code)]

use std::collections::BTreeSet;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use bytes::Bytes;
use strata::error::Error;
use strata::error::Result;
use strata::object::Object;
use strata::object::ObjectKind;
use strata::object::RawObject;
use strata::object::Tree;
use strata::refs::Ref;
use strata::remote::CancelToken;
use strata::remote::Direction;
use strata::remote::PushStatus;
use strata::remote::RefUpdate;
use strata::remote::Remote;
use strata::remote::RemoteFactory;
use strata::remote::RemoteRepo;
use strata::remote::SessionState;
use strata::remote::StoreRemote;
use strata::remote::Want;
use strata::store::ObjectStore;
use strata::store::Storage;
use strata::ObjectId;
use strata::Repository;

/// A one-entry tree holding `row`.
pub fn tree(repo: &Repository, row: &str) -> ObjectId {
    let blob = repo
        .write(&Object::Blob(Bytes::from(row.to_owned())))
        .unwrap();
    let mut tree = Tree::new();
    tree.insert("row", ObjectKind::Blob, blob).unwrap();
    repo.write(&Object::Tree(tree)).unwrap()
}

pub fn commit(repo: &Repository, branch: &str, row: &str) -> ObjectId {
    repo.commit(branch, tree(repo, row), "ana", row).unwrap()
}

pub fn memory_repo() -> Arc<Repository> {
    Arc::new(Repository::in_memory().unwrap())
}

/// Every stored object has every object it references stored as well.
pub fn closure_complete(store: &dyn ObjectStore) -> bool {
    store.ids().unwrap().all(|id| {
        store
            .read(&id)
            .unwrap()
            .children()
            .iter()
            .all(|child| store.exists(child).unwrap())
    })
}

#[derive(Debug, Default)]
pub struct SessionLog {
    pub connects: AtomicUsize,
    pub opens: AtomicUsize,
    pub closes: AtomicUsize,
    pub fail_list: AtomicBool,
}

impl SessionLog {
    pub fn counts(&self) -> (usize, usize, usize) {
        (
            self.connects.load(Ordering::SeqCst),
            self.opens.load(Ordering::SeqCst),
            self.closes.load(Ordering::SeqCst),
        )
    }
}

/// Wraps a session and records what is done with it.
pub struct Logged<R> {
    pub inner: R,
    pub log: Arc<SessionLog>,
}

impl<R: RemoteRepo> RemoteRepo for Logged<R> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn state(&self) -> SessionState {
        self.inner.state()
    }

    fn open(&mut self) -> Result<()> {
        self.log.opens.fetch_add(1, Ordering::SeqCst);
        self.inner.open()
    }

    fn list_refs(&mut self, heads: bool, tags: bool) -> Result<BTreeSet<Ref>> {
        if self.log.fail_list.load(Ordering::SeqCst) {
            return Err(Error::Transport {
                remote: self.inner.name().to_owned(),
                source: strata::error::TransportError::Fault("connection reset".into()),
            });
        }
        self.inner.list_refs(heads, tags)
    }

    fn fetch(&mut self, local: &dyn ObjectStore, want: &[Want]) -> Result<BTreeSet<Ref>> {
        self.inner.fetch(local, want)
    }

    fn push(
        &mut self,
        local: &dyn ObjectStore,
        updates: &[RefUpdate],
    ) -> Result<Vec<(String, PushStatus)>> {
        self.inner.push(local, updates)
    }

    fn close(&mut self) -> Result<()> {
        self.log.closes.fetch_add(1, Ordering::SeqCst);
        self.inner.close()
    }
}

/// Connects every remote to the same in-process storage.
pub struct InProcess {
    pub storage: Storage,
    pub log: Arc<SessionLog>,
}

impl InProcess {
    pub fn new(storage: Storage) -> Arc<Self> {
        Arc::new(InProcess {
            storage,
            log: Arc::new(SessionLog::default()),
        })
    }
}

impl RemoteFactory for InProcess {
    fn connect(
        &self,
        remote: &Remote,
        _direction: Direction,
        cancel: CancelToken,
    ) -> Result<Box<dyn RemoteRepo>> {
        self.log.connects.fetch_add(1, Ordering::SeqCst);
        let inner = StoreRemote::over(remote.name.clone(), self.storage.clone()).with_cancel(cancel);
        Ok(Box::new(Logged {
            inner,
            log: self.log.clone(),
        }))
    }
}

/// An object store that starts failing after a number of reads or writes.
pub struct Faulty<S> {
    pub inner: S,
    pub gets_left: AtomicUsize,
    pub puts_left: AtomicUsize,
}

impl<S> Faulty<S> {
    pub fn new(inner: S) -> Self {
        Faulty {
            inner,
            gets_left: AtomicUsize::new(usize::MAX),
            puts_left: AtomicUsize::new(usize::MAX),
        }
    }

    pub fn fail_gets_after(self, n: usize) -> Self {
        self.gets_left.store(n, Ordering::SeqCst);
        self
    }

    pub fn fail_puts_after(self, n: usize) -> Self {
        self.puts_left.store(n, Ordering::SeqCst);
        self
    }
}

fn spend(budget: &AtomicUsize) -> Result<()> {
    budget
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
        .map(|_| ())
        .map_err(|_| Error::Io(std::io::Error::other("injected fault")))
}

impl<S: ObjectStore> ObjectStore for Faulty<S> {
    fn put(&self, object: &RawObject) -> Result<ObjectId> {
        spend(&self.puts_left)?;
        self.inner.put(object)
    }

    fn get(&self, id: &ObjectId) -> Result<RawObject> {
        spend(&self.gets_left)?;
        self.inner.get(id)
    }

    fn exists(&self, id: &ObjectId) -> Result<bool> {
        self.inner.exists(id)
    }

    fn ids(&self) -> Result<std::vec::IntoIter<ObjectId>> {
        self.inner.ids()
    }
}

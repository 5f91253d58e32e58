use std::collections::HashSet;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;

use crate::error::Error;
use crate::error::Result;
use crate::graph::is_ancestor;
use crate::graph::merge_base;
use crate::graph::topo_order;
use crate::graph::CommitLookup;
use crate::graph::CommitNode;
use crate::graph::GraphBackend;
use crate::graph::StoreGraph;
use crate::graph::TopoOrder;
use crate::id::ObjectId;
use crate::object::Commit;
use crate::object::Object;
use crate::object::ObjectKind;
use crate::store::ObjectStore;

/// Self-healing revision graph over a [`GraphBackend`].
///
/// Nodes missing from the backend are replayed from the object store on
/// demand. A backend reporting [`Error::Inconsistent`] is rebuilt and the
/// query retried once. While a rebuild runs, queries bypass the backend and
/// read commits straight from the object store.
pub struct RevisionIndex {
    backend: Arc<dyn GraphBackend>,
    objects: Arc<dyn ObjectStore>,
    fallback: StoreGraph,
    rebuilding: AtomicBool,
    rebuild_lock: Mutex<()>,
}

impl std::fmt::Debug for RevisionIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RevisionIndex")
            .field("rebuilding", &self.rebuilding.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

/// Clears the rebuilding flag on every exit path.
struct RebuildGuard<'a>(&'a AtomicBool);

impl Drop for RebuildGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl RevisionIndex {
    /// Wraps `backend`, rebuilding it first if it is damaged, or empty while
    /// the object store already holds commits.
    pub fn open(backend: Arc<dyn GraphBackend>, objects: Arc<dyn ObjectStore>) -> Result<Self> {
        let index = RevisionIndex {
            fallback: StoreGraph::new(objects.clone()),
            backend,
            objects,
            rebuilding: AtomicBool::new(false),
            rebuild_lock: Mutex::new(()),
        };
        match index.backend.check() {
            Err(Error::Inconsistent(reason)) => {
                tracing::warn!(%reason, "revision index is inconsistent, rebuilding");
                index.rebuild()?;
            }
            Err(e) => return Err(e),
            Ok(()) => {
                if index.backend.len()? == 0 && index.store_has_commits()? {
                    tracing::info!("revision index is empty, rebuilding");
                    index.rebuild()?;
                }
            }
        }
        Ok(index)
    }

    fn store_has_commits(&self) -> Result<bool> {
        for id in self.objects.ids()? {
            if self.read_indexable(&id)?.is_some() {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// The commit stored under `id`, or `None` for other kinds and for
    /// objects whose bytes no longer match their id.
    fn read_indexable(&self, id: &ObjectId) -> Result<Option<Commit>> {
        let raw = match self.objects.get(id) {
            Ok(raw) => raw,
            Err(Error::Corrupt(id)) => {
                tracing::warn!(%id, "skipping corrupt object while indexing");
                return Ok(None);
            }
            Err(e) => return Err(e),
        };
        if raw.kind != ObjectKind::Commit {
            return Ok(None);
        }
        match raw.decode()? {
            Object::Commit(commit) => Ok(Some(commit)),
            _ => Ok(None),
        }
    }

    /// Idempotent.
    pub fn add_commit(&self, id: ObjectId, commit: &Commit) -> Result<()> {
        match self.backend.insert(CommitNode::from_commit(id, commit)) {
            Err(Error::Inconsistent(reason)) => {
                tracing::warn!(%reason, "revision index is inconsistent, rebuilding");
                self.rebuild().map(|_| ())
            }
            other => other,
        }
    }

    /// Clears the backend and replays every commit in the object store.
    /// Returns the number of commits indexed.
    pub fn rebuild(&self) -> Result<usize> {
        let _serial = self.rebuild_lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.rebuilding.store(true, Ordering::Release);
        let _guard = RebuildGuard(&self.rebuilding);

        self.backend.clear()?;
        let mut count = 0;
        for id in self.objects.ids()? {
            if let Some(commit) = self.read_indexable(&id)? {
                self.backend.insert(CommitNode::from_commit(id, &commit))?;
                count += 1;
            }
        }
        tracing::info!(commits = count, "rebuilt revision index");
        Ok(count)
    }

    /// Indexes every commit reachable from `tips` that the backend does not
    /// hold yet, stopping the walk at known nodes. Returns how many were
    /// added.
    pub fn index_from(&self, tips: &[ObjectId]) -> Result<usize> {
        let mut stack = tips.to_vec();
        let mut seen = HashSet::new();
        let mut added = 0;
        while let Some(id) = stack.pop() {
            if !seen.insert(id) {
                continue;
            }
            match self.backend.node(&id) {
                Ok(Some(_)) => continue,
                Ok(None) => {}
                Err(Error::Inconsistent(reason)) => {
                    tracing::warn!(%reason, "revision index is inconsistent, rebuilding");
                    self.rebuild()?;
                    return Ok(0);
                }
                Err(e) => return Err(e),
            }
            let commit = match self.objects.read_commit(&id) {
                Ok(commit) => commit,
                Err(Error::UnexpectedKind { .. }) => continue,
                Err(e) => return Err(e),
            };
            stack.extend(commit.parents.iter().copied());
            self.add_commit(id, &commit)?;
            added += 1;
        }
        Ok(added)
    }

    pub fn is_rebuilding(&self) -> bool {
        self.rebuilding.load(Ordering::Acquire)
    }

    fn query<T>(&self, f: impl Fn(&dyn CommitLookup) -> Result<T>) -> Result<T> {
        if self.is_rebuilding() {
            return f(&self.fallback);
        }
        match f(self) {
            Err(Error::Inconsistent(reason)) => {
                tracing::warn!(%reason, "revision index is inconsistent, rebuilding");
                self.rebuild()?;
                f(self)
            }
            other => other,
        }
    }

    pub fn is_ancestor(&self, ancestor: ObjectId, descendant: ObjectId) -> Result<bool> {
        self.query(|graph| is_ancestor(graph, ancestor, descendant))
    }

    pub fn merge_base(&self, a: ObjectId, b: ObjectId) -> Result<Vec<ObjectId>> {
        self.query(|graph| merge_base(graph, a, b))
    }

    pub fn topo_order(&self, roots: &[ObjectId]) -> Result<TopoOrder> {
        self.query(|graph| topo_order(graph, roots.iter().copied()))
    }
}

impl CommitLookup for RevisionIndex {
    fn lookup(&self, id: &ObjectId) -> Result<CommitNode> {
        if let Some(node) = self.backend.node(id)? {
            return Ok(node);
        }
        let node = CommitNode::from_commit(*id, &self.objects.read_commit(id)?);
        tracing::debug!(commit = %id.short(), "replaying commit missing from revision index");
        self.backend.insert(node.clone())?;
        Ok(node)
    }
}

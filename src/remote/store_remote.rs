use std::collections::BTreeSet;
use std::fmt;
use std::time::Duration;
use std::time::Instant;

use crate::error::Error;
use crate::error::RejectReason;
use crate::error::Result;
use crate::error::TransportError;
use crate::graph::is_ancestor;
use crate::graph::StoreGraph;
use crate::id::ObjectId;
use crate::refs;
use crate::refs::Ref;
use crate::remote::transfer::copy_objects;
use crate::remote::transfer::missing_closure;
use crate::remote::CancelToken;
use crate::remote::PushStatus;
use crate::remote::RefUpdate;
use crate::remote::RemoteRepo;
use crate::remote::SessionState;
use crate::remote::Want;
use crate::store::ObjectStore;
use crate::store::Storage;

type Connector = Box<dyn Fn() -> Result<Storage> + Send>;

/// A remote session over a pair of object and ref stores.
///
/// The stores are obtained from a connector when the session opens and
/// released when it closes. Every fault raised by them is reported as
/// [`Error::Transport`] naming this remote.
pub struct StoreRemote {
    name: String,
    connect: Connector,
    storage: Option<Storage>,
    timeout: Option<Duration>,
    deadline: Option<Instant>,
    cancel: CancelToken,
}

impl fmt::Debug for StoreRemote {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreRemote")
            .field("name", &self.name)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl StoreRemote {
    pub fn new(
        name: impl Into<String>,
        connect: impl Fn() -> Result<Storage> + Send + 'static,
    ) -> Self {
        StoreRemote {
            name: name.into(),
            connect: Box::new(connect),
            storage: None,
            timeout: None,
            deadline: None,
            cancel: CancelToken::new(),
        }
    }

    /// A remote backed by stores that already exist in this process.
    pub fn over(name: impl Into<String>, storage: Storage) -> Self {
        Self::new(name, move || Ok(storage.clone()))
    }

    /// Bounds each session, measured from `open`.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    fn storage(&self, operation: &'static str) -> Result<Storage> {
        self.storage.clone().ok_or(Error::IllegalState {
            operation,
            state: SessionState::Closed,
        })
    }

    fn transport(&self, e: Error) -> Error {
        e.into_transport(&self.name)
    }

    /// Fails once the session is cancelled or past its deadline.
    fn checkpoint(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(Error::Transport {
                remote: self.name.clone(),
                source: TransportError::Cancelled,
            });
        }
        if let (Some(deadline), Some(timeout)) = (self.deadline, self.timeout) {
            if Instant::now() >= deadline {
                return Err(Error::Transport {
                    remote: self.name.clone(),
                    source: TransportError::Timeout(timeout),
                });
            }
        }
        Ok(())
    }

    fn transfer(
        &self,
        src: &dyn ObjectStore,
        dst: &dyn ObjectStore,
        roots: &[ObjectId],
    ) -> Result<usize> {
        let objects = missing_closure(src, dst, roots).map_err(|e| self.transport(e))?;
        copy_objects(dst, objects, || self.checkpoint()).map_err(|e| self.transport(e))
    }

    fn apply(&self, storage: &Storage, graph: &StoreGraph, update: &RefUpdate) -> Result<PushStatus> {
        if refs::validate_name(&update.name).is_err() {
            return Ok(PushStatus::Rejected(RejectReason::Policy(
                "invalid ref name".to_owned(),
            )));
        }
        let current = storage
            .refs
            .head(&update.name)
            .map_err(|e| self.transport(e))?;
        if current != update.expected {
            return Ok(PushStatus::Rejected(RejectReason::Stale { current }));
        }
        if let Some(old) = current {
            if !update.force {
                if update.name.starts_with(refs::TAGS_PREFIX) {
                    return Ok(PushStatus::Rejected(RejectReason::Policy(
                        "tag already exists".to_owned(),
                    )));
                }
                if !is_ancestor(graph, old, update.new).map_err(|e| self.transport(e))? {
                    return Ok(PushStatus::Rejected(RejectReason::NonFastForward));
                }
            }
        }
        match storage.refs.update(&update.name, current, update.new) {
            Ok(()) => Ok(PushStatus::Accepted),
            Err(Error::CompareAndSwapFailed { actual, .. }) => {
                Ok(PushStatus::Rejected(RejectReason::Stale { current: actual }))
            }
            Err(e) => Err(self.transport(e)),
        }
    }
}

impl RemoteRepo for StoreRemote {
    fn name(&self) -> &str {
        &self.name
    }

    fn state(&self) -> SessionState {
        match self.storage {
            Some(_) => SessionState::Open,
            None => SessionState::Closed,
        }
    }

    fn open(&mut self) -> Result<()> {
        if self.storage.is_some() {
            return Err(Error::IllegalState {
                operation: "open",
                state: SessionState::Open,
            });
        }
        self.deadline = self.timeout.map(|timeout| Instant::now() + timeout);
        self.checkpoint()?;
        let storage = (self.connect)().map_err(|e| self.transport(e))?;
        self.storage = Some(storage);
        tracing::debug!(remote = %self.name, "opened remote session");
        Ok(())
    }

    fn list_refs(&mut self, heads: bool, tags: bool) -> Result<BTreeSet<Ref>> {
        let storage = self.storage("list refs")?;
        let listed = storage
            .refs
            .list(refs::REFS_PREFIX)
            .map_err(|e| self.transport(e))?;
        Ok(listed
            .filter(|r| (heads && r.is_head()) || (tags && r.is_tag()))
            .collect())
    }

    fn fetch(&mut self, local: &dyn ObjectStore, want: &[Want]) -> Result<BTreeSet<Ref>> {
        let storage = self.storage("fetch")?;
        let mut found = BTreeSet::new();
        let mut roots = Vec::with_capacity(want.len());
        for wanted in want {
            match wanted {
                Want::Ref(name) => {
                    let target = storage
                        .refs
                        .head(name)
                        .map_err(|e| self.transport(e))?
                        .ok_or_else(|| Error::RefNotFound(name.clone()))?;
                    found.insert(Ref::new(name.clone(), target));
                    roots.push(target);
                }
                Want::Object(id) => roots.push(*id),
            }
        }

        let count = self.transfer(storage.objects.as_ref(), local, &roots)?;
        for root in &roots {
            if !local.exists(root)? {
                return Err(Error::NotFound(*root));
            }
        }
        tracing::debug!(remote = %self.name, objects = count, "fetched objects");
        Ok(found)
    }

    fn push(
        &mut self,
        local: &dyn ObjectStore,
        updates: &[RefUpdate],
    ) -> Result<Vec<(String, PushStatus)>> {
        let storage = self.storage("push")?;
        let roots: Vec<ObjectId> = updates.iter().map(|u| u.new).collect();
        let count = self.transfer(local, storage.objects.as_ref(), &roots)?;
        tracing::debug!(remote = %self.name, objects = count, "pushed objects");

        let graph = StoreGraph::new(storage.objects.clone());
        let mut statuses = Vec::with_capacity(updates.len());
        for update in updates {
            self.checkpoint()?;
            let status = self.apply(&storage, &graph, update)?;
            match &status {
                PushStatus::Accepted => {
                    tracing::debug!(remote = %self.name, ref_name = %update.name, "ref updated")
                }
                PushStatus::Rejected(reason) => {
                    tracing::debug!(remote = %self.name, ref_name = %update.name, %reason, "ref update rejected")
                }
            }
            statuses.push((update.name.clone(), status));
        }
        Ok(statuses)
    }

    fn close(&mut self) -> Result<()> {
        if self.storage.take().is_none() {
            return Err(Error::IllegalState {
                operation: "close",
                state: SessionState::Closed,
            });
        }
        self.deadline = None;
        tracing::debug!(remote = %self.name, "closed remote session");
        Ok(())
    }
}

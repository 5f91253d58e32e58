//! Ref listing, fetch, push and full synchronization against a remote.
//!
//! Sessions are scoped with [`with_session`]: every pass opens the remote,
//! does its transport work and closes it again before any local ref moves.
//! Moves are then planned in full before the first write, and a single ref
//! that cannot be written is reported rather than failing the pass. A pass
//! that returns an error therefore leaves local refs exactly as they were;
//! objects copied so far stay behind as complete closures.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use crate::error::Error;
use crate::error::RejectReason;
use crate::error::Result;
use crate::id::ObjectId;
use crate::refs;
use crate::refs::Ref;
use crate::remote::with_session;
use crate::remote::CancelToken;
use crate::remote::DefaultRemoteFactory;
use crate::remote::Direction;
use crate::remote::PushStatus;
use crate::remote::RefUpdate;
use crate::remote::Remote;
use crate::remote::RemoteFactory;
use crate::remote::RemoteRepo;
use crate::remote::Want;
use crate::repository::Repository;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListOptions {
    pub heads: bool,
    pub tags: bool,
    /// List the tracking refs this repository keeps for the remote instead
    /// of asking the remote.
    pub local: bool,
}

impl Default for ListOptions {
    fn default() -> Self {
        ListOptions {
            heads: true,
            tags: true,
            local: false,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FetchOptions {
    /// Delete tracking refs the remote no longer advertises.
    pub prune: bool,
}

/// A local ref that moved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefChange {
    pub name: String,
    pub old: Option<ObjectId>,
    pub new: Option<ObjectId>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FetchReport {
    pub updated: Vec<RefChange>,
    pub pruned: Vec<RefChange>,
    /// Tracking refs left alone, e.g. a non-forced spec that would rewind.
    pub rejected: Vec<(String, RejectReason)>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PushReport {
    pub statuses: Vec<(String, PushStatus)>,
    /// Tracking refs advanced after accepted updates.
    pub tracking: Vec<RefChange>,
    /// Tracking refs that could not follow an accepted update.
    pub tracking_rejected: Vec<(String, RejectReason)>,
}

impl PushReport {
    pub fn all_accepted(&self) -> bool {
        self.statuses.iter().all(|(_, status)| status.is_accepted())
    }
}

/// `[+]<local>[:<remote>]`; the remote name defaults to the local one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushSpec {
    pub force: bool,
    pub src: String,
    pub dst: String,
}

impl PushSpec {
    /// Pushes local branch `branch` to the remote branch of the same name.
    pub fn branch(branch: &str) -> Self {
        let name = refs::head(branch);
        PushSpec {
            force: false,
            src: name.clone(),
            dst: name,
        }
    }

    pub fn forced(mut self) -> Self {
        self.force = true;
        self
    }
}

impl FromStr for PushSpec {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (force, body) = match s.strip_prefix('+') {
            Some(body) => (true, body),
            None => (false, s),
        };
        let (src, dst) = body.split_once(':').unwrap_or((body, body));
        refs::validate_name(src)?;
        refs::validate_name(dst)?;
        Ok(PushSpec {
            force,
            src: src.to_owned(),
            dst: dst.to_owned(),
        })
    }
}

impl fmt::Display for PushSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.force {
            f.write_str("+")?;
        }
        write!(f, "{}:{}", self.src, self.dst)
    }
}

enum Advance {
    Unchanged,
    Updated(RefChange),
    Rejected(RejectReason),
}

/// A tracking ref move decided before anything is written.
struct PlannedMove {
    name: String,
    current: Option<ObjectId>,
    target: ObjectId,
}

/// Runs synchronization passes for one repository.
pub struct Coordinator {
    repo: Arc<Repository>,
    factory: Arc<dyn RemoteFactory>,
    cancel: CancelToken,
}

impl fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Coordinator")
            .field("repo", &self.repo)
            .finish_non_exhaustive()
    }
}

fn require(remote: Option<&Remote>) -> Result<&Remote> {
    remote.ok_or_else(|| Error::PreconditionFailed("remote was not provided".to_owned()))
}

impl Coordinator {
    pub fn new(repo: Arc<Repository>) -> Self {
        Coordinator {
            repo,
            factory: Arc::new(DefaultRemoteFactory),
            cancel: CancelToken::new(),
        }
    }

    pub fn with_factory(mut self, factory: Arc<dyn RemoteFactory>) -> Self {
        self.factory = factory;
        self
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn repository(&self) -> &Arc<Repository> {
        &self.repo
    }

    fn connect(&self, remote: &Remote, direction: Direction) -> Result<Box<dyn RemoteRepo>> {
        self.factory.connect(remote, direction, self.cancel.clone())
    }

    /// The refs `remote` advertises, or with `options.local` the tracking
    /// refs kept for it here. The local listing needs no connection.
    pub fn ls_remote(&self, remote: Option<&Remote>, options: ListOptions) -> Result<BTreeSet<Ref>> {
        let remote = require(remote)?;
        if options.local {
            let prefix = refs::remote_prefix(&remote.name);
            return Ok(self.repo.refs().list(&prefix)?.collect());
        }
        let mut session = self.connect(remote, Direction::Fetch)?;
        with_session(&mut session, |s| s.list_refs(options.heads, options.tags))
    }

    /// Brings the tracking refs of `remote` up to date.
    ///
    /// Every move is decided before the first ref is written. Once writing
    /// starts, a ref that cannot be moved is reported as rejected and the
    /// pass carries on, so an `Err` means no tracking ref changed.
    pub fn fetch(&self, remote: Option<&Remote>, options: FetchOptions) -> Result<FetchReport> {
        let remote = require(remote)?;
        let mut session = self.connect(remote, Direction::Fetch)?;
        let objects = self.repo.objects().clone();
        let mut report = FetchReport::default();

        let (advertised, plan) = with_session(&mut session, |s| {
            let advertised = s.list_refs(true, true)?;
            let mut plan = Vec::new();
            for r in &advertised {
                let Some(local) = remote.fetch.map(&r.name) else {
                    continue;
                };
                if let Err(e) = refs::validate_name(&local) {
                    tracing::warn!(ref_name = %r.name, error = %e, "ignoring advertised ref");
                    report
                        .rejected
                        .push((local, RejectReason::Policy("invalid ref name".to_owned())));
                    continue;
                }
                if self.repo.head(&local)? != Some(r.target) {
                    plan.push((local, r.target));
                }
            }
            let wants: Vec<Want> = plan.iter().map(|(_, target)| Want::Object(*target)).collect();
            if !wants.is_empty() {
                s.fetch(objects.as_ref(), &wants)?;
            }
            Ok((advertised, plan))
        })?;

        let tips: Vec<ObjectId> = plan.iter().map(|(_, target)| *target).collect();
        let indexed = self.repo.index().index_from(&tips)?;
        tracing::debug!(remote = %remote.name, commits = indexed, "indexed fetched commits");

        let moves = self.plan_moves(plan, remote.fetch.force, &mut report.rejected)?;
        let vanished = if options.prune {
            let names: BTreeSet<&str> = advertised.iter().map(|r| r.name.as_str()).collect();
            self.vanished(remote, &names)?
        } else {
            Vec::new()
        };

        for planned in moves {
            let name = planned.name.clone();
            match self.apply(planned, remote.fetch.force) {
                Advance::Unchanged => {}
                Advance::Updated(change) => report.updated.push(change),
                Advance::Rejected(reason) => {
                    tracing::warn!(ref_name = %name, %reason, "tracking ref not updated");
                    report.rejected.push((name, reason));
                }
            }
        }
        report.pruned = self.prune(vanished, &mut report.rejected);

        tracing::info!(
            remote = %remote.name,
            updated = report.updated.len(),
            pruned = report.pruned.len(),
            rejected = report.rejected.len(),
            "fetch complete"
        );
        Ok(report)
    }

    /// Publishes local refs. Expected remote values come from the
    /// advertisement of the same session.
    pub fn push(&self, remote: Option<&Remote>, specs: &[PushSpec]) -> Result<PushReport> {
        let remote = require(remote)?;
        let mut targets = Vec::with_capacity(specs.len());
        for spec in specs {
            targets.push(self.repo.refs().resolve(&spec.src)?);
        }
        let objects = self.repo.objects().clone();

        let mut session = self.connect(remote, Direction::Push)?;
        let statuses = with_session(&mut session, |s| {
            let advertised: BTreeMap<String, ObjectId> = s
                .list_refs(true, true)?
                .into_iter()
                .map(|r| (r.name, r.target))
                .collect();
            let updates: Vec<RefUpdate> = specs
                .iter()
                .zip(&targets)
                .map(|(spec, target)| RefUpdate {
                    name: spec.dst.clone(),
                    expected: advertised.get(&spec.dst).copied(),
                    new: *target,
                    force: spec.force,
                })
                .collect();
            s.push(objects.as_ref(), &updates)
        })?;

        let mut report = PushReport::default();
        let accepted: Vec<(String, ObjectId)> = statuses
            .iter()
            .zip(&targets)
            .filter(|((_, status), _)| status.is_accepted())
            .filter_map(|((name, _), target)| Some((remote.fetch.map(name)?, *target)))
            .collect();
        let moves = self.plan_moves(accepted, true, &mut report.tracking_rejected)?;
        for planned in moves {
            let name = planned.name.clone();
            match self.apply(planned, true) {
                Advance::Unchanged => {}
                Advance::Updated(change) => report.tracking.push(change),
                Advance::Rejected(reason) => {
                    tracing::warn!(ref_name = %name, %reason, "tracking ref not updated");
                    report.tracking_rejected.push((name, reason));
                }
            }
        }
        report.statuses = statuses;
        tracing::info!(
            remote = %remote.name,
            accepted = report.statuses.iter().filter(|(_, s)| s.is_accepted()).count(),
            rejected = report.statuses.iter().filter(|(_, s)| !s.is_accepted()).count(),
            "push complete"
        );
        Ok(report)
    }

    /// A full pass: fetch with pruning.
    pub fn sync(&self, remote: Option<&Remote>) -> Result<FetchReport> {
        self.fetch(remote, FetchOptions { prune: true })
    }

    /// Decides which of `updates` to apply without writing anything.
    /// Updates that would rewind a ref without `force` land in `rejected`.
    fn plan_moves(
        &self,
        updates: Vec<(String, ObjectId)>,
        force: bool,
        rejected: &mut Vec<(String, RejectReason)>,
    ) -> Result<Vec<PlannedMove>> {
        let mut moves = Vec::with_capacity(updates.len());
        for (name, target) in updates {
            if refs::validate_name(&name).is_err() {
                rejected.push((name, RejectReason::Policy("invalid ref name".to_owned())));
                continue;
            }
            let current = self.repo.head(&name)?;
            if current == Some(target) {
                continue;
            }
            if let Some(old) = current {
                if !force && !self.repo.is_ancestor(old, target)? {
                    tracing::warn!(ref_name = %name, "tracking ref would rewind");
                    rejected.push((name, RejectReason::NonFastForward));
                    continue;
                }
            }
            moves.push(PlannedMove {
                name,
                current,
                target,
            });
        }
        Ok(moves)
    }

    /// Writes one planned move, re-reading and retrying when a concurrent
    /// writer wins the compare-and-swap. Never fails: a move that cannot be
    /// made comes back as [`Advance::Rejected`].
    fn apply(&self, planned: PlannedMove, force: bool) -> Advance {
        let retries = self.repo.config().sync.ref_retries.max(1);
        let PlannedMove {
            name,
            mut current,
            target,
        } = planned;
        let mut attempt = 1;
        loop {
            match self.repo.update_ref(&name, current, target) {
                Ok(()) => {
                    tracing::debug!(ref_name = %name, target = %target.short(), "ref updated");
                    return Advance::Updated(RefChange {
                        name,
                        old: current,
                        new: Some(target),
                    });
                }
                Err(Error::CompareAndSwapFailed { actual, .. }) => {
                    if attempt >= retries {
                        return Advance::Rejected(RejectReason::Stale { current: actual });
                    }
                    tracing::warn!(ref_name = %name, attempt, "ref moved concurrently, retrying");
                    attempt += 1;
                    current = actual;
                    if current == Some(target) {
                        return Advance::Unchanged;
                    }
                    if let (Some(old), false) = (current, force) {
                        match self.repo.is_ancestor(old, target) {
                            Ok(true) => {}
                            Ok(false) => return Advance::Rejected(RejectReason::NonFastForward),
                            Err(e) => return Advance::Rejected(RejectReason::Policy(e.to_string())),
                        }
                    }
                }
                Err(e) => return Advance::Rejected(RejectReason::Policy(e.to_string())),
            }
        }
    }

    /// Tracking refs of `remote` whose source is no longer advertised.
    fn vanished(&self, remote: &Remote, advertised: &BTreeSet<&str>) -> Result<Vec<Ref>> {
        let mut vanished = Vec::new();
        for tracking in self.repo.refs().list(refs::REFS_PREFIX)? {
            let Some(source) = remote.fetch.reverse(&tracking.name) else {
                continue;
            };
            if !advertised.contains(source.as_str()) {
                vanished.push(tracking);
            }
        }
        Ok(vanished)
    }

    fn prune(
        &self,
        vanished: Vec<Ref>,
        rejected: &mut Vec<(String, RejectReason)>,
    ) -> Vec<RefChange> {
        let mut pruned = Vec::new();
        for tracking in vanished {
            match self.repo.delete_ref(&tracking.name, tracking.target) {
                Ok(()) => {
                    tracing::debug!(ref_name = %tracking.name, "pruned tracking ref");
                    pruned.push(RefChange {
                        name: tracking.name,
                        old: Some(tracking.target),
                        new: None,
                    });
                }
                Err(e @ (Error::RefNotFound(_) | Error::CompareAndSwapFailed { .. })) => {
                    tracing::warn!(ref_name = %tracking.name, error = %e, "tracking ref changed while pruning");
                }
                Err(e) => {
                    tracing::warn!(ref_name = %tracking.name, error = %e, "tracking ref not pruned");
                    rejected.push((tracking.name, RejectReason::Policy(e.to_string())));
                }
            }
        }
        pruned
    }
}

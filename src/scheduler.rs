//! Background synchronization of watched repositories.
//!
//! ```text
//! ticker (every interval) --try_send--> bounded queue --> worker pool --> handler
//! ```
//!
//! A tick marks every watched repository dirty by enqueuing it, unless it is
//! still queued or running from an earlier tick. A full queue drops the
//! repository until the next tick, so ticks never wait on a slow remote.
//! Handler failures, errors and panics alike, are counted and logged and
//! never reach other repositories or the pool itself.
//!
//! [`AutoSync::start`] runs its own ticker thread. [`AutoSync::manual`]
//! starts only the workers and leaves ticking to the caller.

use std::collections::HashSet;
use std::fmt;
use std::panic::catch_unwind;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Condvar;
use std::sync::Mutex;
use std::sync::PoisonError;
use std::thread::JoinHandle;
use std::time::Duration;
use std::time::Instant;

use anyhow::Context;
use crossbeam_channel::Receiver;
use crossbeam_channel::RecvTimeoutError;
use crossbeam_channel::Sender;
use crossbeam_channel::TrySendError;

use crate::config::SyncConfig;
use crate::error::Error;
use crate::error::Result;
use crate::repository::Repository;
use crate::sync::Coordinator;

/// The remote a repository must have to be watched.
pub const ORIGIN: &str = "origin";

type Handler = dyn Fn(&Arc<Repository>) -> anyhow::Result<()> + Send + Sync;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Stats {
    pub ticks: u64,
    /// Repositories handed to the workers.
    pub dispatched: u64,
    pub completed: u64,
    /// Handler errors and panics.
    pub failed: u64,
}

#[derive(Debug, Default)]
struct Counters {
    ticks: AtomicU64,
    dispatched: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
}

fn key(repo: &Arc<Repository>) -> usize {
    Arc::as_ptr(repo) as usize
}

struct Shared {
    watched: Mutex<Vec<Arc<Repository>>>,
    pending: Mutex<HashSet<usize>>,
    idle: Condvar,
    counters: Counters,
    handler: Box<Handler>,
}

impl Shared {
    fn pending(&self) -> std::sync::MutexGuard<'_, HashSet<usize>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn tick(&self, queue: &Sender<Arc<Repository>>) -> usize {
        self.counters.ticks.fetch_add(1, Ordering::Relaxed);
        let watched = self
            .watched
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let mut dispatched = 0;
        for repo in watched {
            if !self.pending().insert(key(&repo)) {
                continue;
            }
            match queue.try_send(repo) {
                Ok(()) => dispatched += 1,
                Err(TrySendError::Full(repo)) => {
                    self.pending().remove(&key(&repo));
                    tracing::warn!(repo = ?repo.path(), "sync queue full, skipping until next tick");
                }
                Err(TrySendError::Disconnected(repo)) => {
                    self.pending().remove(&key(&repo));
                }
            }
        }
        self.counters
            .dispatched
            .fetch_add(dispatched as u64, Ordering::Relaxed);
        dispatched
    }

    fn work(&self, queue: Receiver<Arc<Repository>>) {
        for repo in queue {
            match catch_unwind(AssertUnwindSafe(|| (self.handler)(&repo))) {
                Ok(Ok(())) => {
                    self.counters.completed.fetch_add(1, Ordering::Relaxed);
                }
                Ok(Err(e)) => {
                    self.counters.failed.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(repo = ?repo.path(), error = %format!("{e:#}"), "background sync failed");
                }
                Err(_) => {
                    self.counters.failed.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(repo = ?repo.path(), "background sync panicked");
                }
            }
            let mut pending = self.pending();
            pending.remove(&key(&repo));
            if pending.is_empty() {
                self.idle.notify_all();
            }
        }
    }
}

/// Periodic synchronization service.
///
/// Call [`AutoSync::shutdown`] to stop it; dropping it does the same but
/// cannot report a thread that panicked.
pub struct AutoSync {
    shared: Arc<Shared>,
    queue: Option<Sender<Arc<Repository>>>,
    stop: Option<Sender<()>>,
    ticker: Option<JoinHandle<()>>,
    workers: Vec<JoinHandle<()>>,
}

impl fmt::Debug for AutoSync {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AutoSync")
            .field("stats", &self.stats())
            .field("workers", &self.workers.len())
            .finish_non_exhaustive()
    }
}

impl AutoSync {
    /// Starts the workers and a ticker firing every `config.interval_secs`,
    /// the first time right away.
    pub fn start<F>(config: &SyncConfig, handler: F) -> Result<Self>
    where
        F: Fn(&Arc<Repository>) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let mut service = Self::manual(config, handler)?;
        let (stop, stopped) = crossbeam_channel::bounded::<()>(0);
        let shared = service.shared.clone();
        let queue = service.queue.clone().ok_or_else(|| {
            Error::PreconditionFailed("auto sync queue already closed".to_owned())
        })?;
        let interval = config.interval();
        let ticker = std::thread::Builder::new()
            .name("strata-autosync-ticker".to_owned())
            .spawn(move || loop {
                shared.tick(&queue);
                match stopped.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => continue,
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            })?;
        service.stop = Some(stop);
        service.ticker = Some(ticker);
        tracing::info!(interval_secs = config.interval_secs, "auto sync started");
        Ok(service)
    }

    /// Starts only the workers; ticks happen through [`AutoSync::tick`].
    pub fn manual<F>(config: &SyncConfig, handler: F) -> Result<Self>
    where
        F: Fn(&Arc<Repository>) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let (queue, jobs) = crossbeam_channel::bounded(config.queue_capacity.max(1));
        let shared = Arc::new(Shared {
            watched: Mutex::new(Vec::new()),
            pending: Mutex::new(HashSet::new()),
            idle: Condvar::new(),
            counters: Counters::default(),
            handler: Box::new(handler),
        });
        let mut workers = Vec::with_capacity(config.workers);
        for i in 0..config.workers.max(1) {
            let shared = shared.clone();
            let jobs = jobs.clone();
            workers.push(
                std::thread::Builder::new()
                    .name(format!("strata-autosync-{i}"))
                    .spawn(move || shared.work(jobs))?,
            );
        }
        Ok(AutoSync {
            shared,
            queue: Some(queue),
            stop: None,
            ticker: None,
            workers,
        })
    }

    /// Watches `repo` if it has an `origin` remote. Registering twice is
    /// harmless. Returns whether the repository is watched.
    pub fn register(&self, repo: Arc<Repository>) -> bool {
        if !repo.has_remote(ORIGIN) {
            tracing::debug!(repo = ?repo.path(), "no origin remote, not watching");
            return false;
        }
        let mut watched = self
            .shared
            .watched
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if !watched.iter().any(|w| Arc::ptr_eq(w, &repo)) {
            watched.push(repo);
        }
        true
    }

    /// Returns whether `repo` was watched.
    pub fn unregister(&self, repo: &Arc<Repository>) -> bool {
        let mut watched = self
            .shared
            .watched
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let before = watched.len();
        watched.retain(|w| !Arc::ptr_eq(w, repo));
        watched.len() != before
    }

    pub fn watched(&self) -> usize {
        self.shared
            .watched
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Marks every watched repository dirty. Returns how many were queued.
    pub fn tick(&self) -> usize {
        match &self.queue {
            Some(queue) => self.shared.tick(queue),
            None => 0,
        }
    }

    /// Blocks until no repository is queued or running, or `timeout` passes.
    /// Returns whether the service went idle.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut pending = self.shared.pending();
        while !pending.is_empty() {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            pending = self
                .shared
                .idle
                .wait_timeout(pending, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        true
    }

    pub fn stats(&self) -> Stats {
        let c = &self.shared.counters;
        Stats {
            ticks: c.ticks.load(Ordering::Relaxed),
            dispatched: c.dispatched.load(Ordering::Relaxed),
            completed: c.completed.load(Ordering::Relaxed),
            failed: c.failed.load(Ordering::Relaxed),
        }
    }

    /// Stops the ticker, lets the workers finish what is queued and joins
    /// every thread.
    pub fn shutdown(mut self) -> Result<Stats> {
        self.stop_threads()?;
        let stats = self.stats();
        tracing::info!(?stats, "auto sync stopped");
        Ok(stats)
    }

    fn stop_threads(&mut self) -> Result<()> {
        let mut panicked = false;
        drop(self.stop.take());
        if let Some(ticker) = self.ticker.take() {
            panicked |= ticker.join().is_err();
        }
        drop(self.queue.take());
        for worker in self.workers.drain(..) {
            panicked |= worker.join().is_err();
        }
        if panicked {
            return Err(Error::Io(std::io::Error::other("auto sync thread panicked")));
        }
        Ok(())
    }
}

impl Drop for AutoSync {
    fn drop(&mut self) {
        if let Err(e) = self.stop_threads() {
            tracing::warn!(error = %e, "auto sync shut down uncleanly");
        }
    }
}

/// The default handler: a full [`Coordinator::sync`] against `origin`.
pub fn sync_origin(repo: &Arc<Repository>) -> anyhow::Result<()> {
    let origin = repo.remote(ORIGIN)?;
    Coordinator::new(repo.clone())
        .sync(origin.as_ref())
        .with_context(|| format!("synchronizing {:?} with {ORIGIN}", repo.path()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;
    use crate::config::RemoteConfig;

    fn with_origin() -> Arc<Repository> {
        let repo = Repository::in_memory().unwrap();
        repo.add_remote(ORIGIN, RemoteConfig::new("memory:///"))
            .unwrap();
        Arc::new(repo)
    }

    fn config() -> SyncConfig {
        SyncConfig {
            interval_secs: 3600,
            workers: 2,
            queue_capacity: 4,
            ref_retries: 3,
        }
    }

    #[test]
    fn only_repositories_with_origin_are_watched() {
        let service = AutoSync::manual(&config(), |_| Ok(())).unwrap();
        assert!(!service.register(Arc::new(Repository::in_memory().unwrap())));
        let repo = with_origin();
        assert!(service.register(repo.clone()));
        assert!(service.register(repo.clone()));
        assert_eq!(service.watched(), 1);
        assert!(service.unregister(&repo));
        assert_eq!(service.watched(), 0);
        service.shutdown().unwrap();
    }

    #[test]
    fn manual_ticks_run_the_handler() {
        let runs = Arc::new(AtomicUsize::new(0));
        let counted = runs.clone();
        let service = AutoSync::manual(&config(), move |_| {
            counted.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .unwrap();
        service.register(with_origin());
        service.register(with_origin());

        assert_eq!(service.tick(), 2);
        assert!(service.wait_idle(Duration::from_secs(5)));
        assert_eq!(runs.load(Ordering::SeqCst), 2);

        let stats = service.shutdown().unwrap();
        assert_eq!(stats.ticks, 1);
        assert_eq!(stats.dispatched, 2);
        assert_eq!(stats.completed, 2);
        assert_eq!(stats.failed, 0);
    }

    #[test]
    fn failures_are_isolated_and_counted() {
        let service = AutoSync::manual(&config(), |repo| {
            if repo.has_remote("upstream") {
                panic!("handler bug");
            }
            anyhow::bail!("remote unreachable")
        })
        .unwrap();
        let panicking = with_origin();
        panicking
            .add_remote("upstream", RemoteConfig::new("memory:///"))
            .unwrap();
        service.register(panicking);
        service.register(with_origin());

        service.tick();
        assert!(service.wait_idle(Duration::from_secs(5)));
        service.tick();
        assert!(service.wait_idle(Duration::from_secs(5)));

        let stats = service.shutdown().unwrap();
        assert_eq!(stats.failed, 4);
        assert_eq!(stats.completed, 0);
    }
}

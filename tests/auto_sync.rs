use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use strata::config::Config;
use strata::config::RemoteConfig;
use strata::config::SyncConfig;
use strata::scheduler::sync_origin;
use strata::scheduler::AutoSync;
use strata::scheduler::ORIGIN;
use strata::Repository;

mod util;
use util::commit;

fn config(workers: usize, queue_capacity: usize) -> SyncConfig {
    SyncConfig {
        interval_secs: 3600,
        workers,
        queue_capacity,
        ref_retries: 3,
    }
}

fn watched_repo() -> Arc<Repository> {
    let repo = Repository::in_memory().unwrap();
    repo.add_remote(ORIGIN, RemoteConfig::new("memory:///"))
        .unwrap();
    Arc::new(repo)
}

#[test]
fn ticker_fires_right_away_and_on_interval() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counted = calls.clone();
    let config = SyncConfig {
        interval_secs: 1,
        ..config(1, 4)
    };
    let service = AutoSync::start(&config, move |_| {
        counted.fetch_add(1, Ordering::SeqCst);
        Ok(())
    })
    .unwrap();
    service.register(watched_repo());

    let deadline = Instant::now() + Duration::from_secs(10);
    while calls.load(Ordering::SeqCst) < 2 && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(20));
    }
    let stats = service.shutdown().unwrap();
    assert!(calls.load(Ordering::SeqCst) >= 2);
    assert!(stats.ticks >= 2);
    assert_eq!(stats.failed, 0);
    assert_eq!(stats.completed, calls.load(Ordering::SeqCst) as u64);
}

#[test]
fn manual_ticks_synchronize_with_origin() {
    let dir = tempfile::tempdir().unwrap();
    let upstream = Repository::init(dir.path(), Config::default()).unwrap();
    let first = commit(&upstream, "main", "1");

    let local = Repository::in_memory().unwrap();
    local
        .add_remote(
            ORIGIN,
            RemoteConfig::new(dir.path().to_string_lossy().into_owned()),
        )
        .unwrap();
    let local = Arc::new(local);

    let service = AutoSync::manual(&config(2, 4), sync_origin).unwrap();
    assert!(service.register(local.clone()));
    assert_eq!(service.tick(), 1);
    assert!(service.wait_idle(Duration::from_secs(10)));
    assert_eq!(local.head("refs/remotes/origin/main").unwrap(), Some(first));

    let second = commit(&upstream, "main", "2");
    service.tick();
    assert!(service.wait_idle(Duration::from_secs(10)));
    assert_eq!(local.head("refs/remotes/origin/main").unwrap(), Some(second));
    assert!(local.is_ancestor(first, second).unwrap());

    let stats = service.shutdown().unwrap();
    assert_eq!(stats.completed, 2);
    assert_eq!(stats.failed, 0);
}

#[test]
fn busy_repositories_are_not_queued_twice() {
    let (started_tx, started) = crossbeam_channel::unbounded();
    let (release, gate) = crossbeam_channel::unbounded::<()>();
    let service = AutoSync::manual(&config(1, 1), move |_| {
        started_tx.send(())?;
        gate.recv()?;
        Ok(())
    })
    .unwrap();

    let busy = watched_repo();
    service.register(busy.clone());
    assert_eq!(service.tick(), 1);
    started.recv_timeout(Duration::from_secs(10)).unwrap();

    // The worker is held by `busy`; one more fits the queue, the third is dropped.
    let queued = watched_repo();
    let dropped = watched_repo();
    service.register(queued.clone());
    service.register(dropped);
    assert_eq!(service.tick(), 1);

    for _ in 0..2 {
        release.send(()).unwrap();
    }
    assert!(service.wait_idle(Duration::from_secs(10)));
    assert_eq!(service.stats().completed, 2);

    // Only the repository dropped from the full queue is left to run.
    service.unregister(&busy);
    service.unregister(&queued);
    release.send(()).unwrap();
    assert_eq!(service.tick(), 1);
    assert!(service.wait_idle(Duration::from_secs(10)));

    let stats = service.shutdown().unwrap();
    assert_eq!(stats.ticks, 3);
    assert_eq!(stats.dispatched, 3);
    assert_eq!(stats.completed, 3);
}

#[test]
fn unregistered_repositories_are_left_alone() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counted = calls.clone();
    let service = AutoSync::manual(&config(2, 4), move |_| {
        counted.fetch_add(1, Ordering::SeqCst);
        Ok(())
    })
    .unwrap();

    let repo = watched_repo();
    assert!(service.register(repo.clone()));
    assert!(service.register(repo.clone()));
    assert_eq!(service.watched(), 1);
    assert!(service.unregister(&repo));
    assert!(!service.unregister(&repo));

    assert_eq!(service.tick(), 0);
    assert!(service.wait_idle(Duration::from_secs(1)));
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[test]
fn failing_origin_is_counted() {
    let repo = Repository::in_memory().unwrap();
    repo.add_remote(ORIGIN, RemoteConfig::new("gopher://example.org/parcels"))
        .unwrap();
    let repo = Arc::new(repo);

    let service = AutoSync::manual(&config(1, 4), sync_origin).unwrap();
    service.register(repo.clone());
    service.tick();
    assert!(service.wait_idle(Duration::from_secs(10)));
    let stats = service.shutdown().unwrap();
    assert_eq!(stats.completed, 0);
    assert_eq!(stats.failed, 1);
    assert!(repo.list_refs("refs/").unwrap().is_empty());
}

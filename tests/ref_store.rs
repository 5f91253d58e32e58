use std::collections::HashMap;
use std::sync::Arc;

use rayon::prelude::*;
use strata::error::Error;
use strata::object::ObjectKind;
use strata::object::RawObject;
use strata::store::MemoryStore;
use strata::store::ObjectStore;
use strata::store::ObjectStoreBackend;
use strata::store::Pile;
use strata::store::RefStore;
use strata::ObjectId;
use tempfile::TempDir;
use url::Url;

trait Store: ObjectStore + RefStore {}
impl<T: ObjectStore + RefStore> Store for T {}

/// Ref stores under test. The two pile entries share one file, so their
/// updates race through the file lock rather than one mutex.
fn stores() -> (TempDir, Vec<(&'static str, Arc<dyn Store>, Arc<dyn Store>)>) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("objects.pile");
    let open = || -> Arc<dyn Store> {
        let pile = Pile::open(&path).unwrap();
        pile.restore().unwrap();
        Arc::new(pile)
    };
    let memory: Arc<dyn Store> = Arc::new(MemoryStore::new());
    let bucket: Arc<dyn Store> =
        Arc::new(ObjectStoreBackend::with_url(&Url::parse("memory:///").unwrap()).unwrap());
    let stores = vec![
        ("memory", memory.clone(), memory),
        ("pile", open(), open()),
        ("object-store", bucket.clone(), bucket),
    ];
    (dir, stores)
}

fn counter(store: &dyn Store, n: usize) -> ObjectId {
    store
        .put(&RawObject::new(ObjectKind::Blob, n.to_string()))
        .unwrap()
}

#[test]
fn one_creator_wins() {
    let (_dir, stores) = stores();
    for (name, first, second) in &stores {
        let targets: Vec<ObjectId> = (0..16).map(|n| counter(first.as_ref(), n)).collect();
        let results: Vec<(ObjectId, Result<(), Error>)> = targets
            .par_iter()
            .enumerate()
            .map(|(i, target)| {
                let store = if i % 2 == 0 { first } else { second };
                (*target, store.update("refs/heads/main", None, *target))
            })
            .collect();

        let winners: Vec<ObjectId> = results
            .iter()
            .filter(|(_, r)| r.is_ok())
            .map(|(target, _)| *target)
            .collect();
        assert_eq!(winners.len(), 1, "{name}");
        let winner = winners[0];
        for (_, result) in &results {
            match result {
                Ok(()) => {}
                Err(Error::CompareAndSwapFailed { actual, .. }) => {
                    assert_eq!(*actual, Some(winner), "{name}")
                }
                Err(e) => panic!("{name}: unexpected error {e}"),
            }
        }
        assert_eq!(first.head("refs/heads/main").unwrap(), Some(winner), "{name}");
        assert_eq!(second.head("refs/heads/main").unwrap(), Some(winner), "{name}");
    }
}

#[test]
fn contended_advances_are_never_lost() {
    const WORKERS: usize = 8;
    const STEPS: usize = 10;

    let (_dir, stores) = stores();
    for (name, first, second) in &stores {
        let values: HashMap<ObjectId, usize> = (0..=WORKERS * STEPS)
            .map(|n| (counter(first.as_ref(), n), n))
            .collect();
        let ids: HashMap<usize, ObjectId> = values.iter().map(|(id, n)| (*n, *id)).collect();
        first.update("refs/heads/count", None, ids[&0]).unwrap();

        let retries: usize = (0..WORKERS)
            .into_par_iter()
            .map(|worker| {
                let store = if worker % 2 == 0 { first } else { second };
                let mut retries = 0;
                for _ in 0..STEPS {
                    let mut current = store.resolve("refs/heads/count").unwrap();
                    loop {
                        let next = ids[&(values[&current] + 1)];
                        match store.update("refs/heads/count", Some(current), next) {
                            Ok(()) => break,
                            Err(Error::CompareAndSwapFailed {
                                actual: Some(actual),
                                ..
                            }) => {
                                retries += 1;
                                current = actual;
                            }
                            Err(e) => panic!("{name}: unexpected error {e}"),
                        }
                    }
                }
                retries
            })
            .sum();

        let last = first.resolve("refs/heads/count").unwrap();
        assert_eq!(values[&last], WORKERS * STEPS, "{name} after {retries} retries");
    }
}

#[test]
fn deletes_compare_first() {
    let (_dir, stores) = stores();
    for (name, first, second) in &stores {
        let a = counter(first.as_ref(), 1);
        let b = counter(first.as_ref(), 2);
        first.update("refs/tags/v1", None, a).unwrap();

        assert!(
            matches!(
                second.delete("refs/tags/v1", b),
                Err(Error::CompareAndSwapFailed { .. })
            ),
            "{name}"
        );
        second.delete("refs/tags/v1", a).unwrap();
        assert_eq!(first.head("refs/tags/v1").unwrap(), None, "{name}");
        assert!(
            matches!(
                first.delete("refs/tags/v1", a),
                Err(Error::RefNotFound(_))
            ),
            "{name}"
        );
    }
}

#[test]
fn listing_is_ordered_and_prefixed() {
    let (_dir, stores) = stores();
    for (name, first, _) in &stores {
        let id = counter(first.as_ref(), 0);
        for r in ["refs/tags/v1", "refs/heads/zeta", "refs/heads/alpha", "refs/remotes/origin/main"] {
            first.update(r, None, id).unwrap();
        }
        let heads: Vec<String> = first
            .list("refs/heads/")
            .unwrap()
            .map(|r| r.name)
            .collect();
        assert_eq!(heads, vec!["refs/heads/alpha", "refs/heads/zeta"], "{name}");
        assert_eq!(first.list("refs/").unwrap().count(), 4, "{name}");
    }
}

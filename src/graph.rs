//! Ancestry queries over the commit graph.
//!
//! The graph is never authoritative. Every node is derived from a commit
//! object, so any backend can be thrown away and replayed from the object
//! store; [`RevisionIndex`] does exactly that whenever its backend turns out
//! to be missing nodes or damaged.
//!
//! The query algorithms are free functions over [`CommitLookup`], which lets
//! them run unchanged against an index backend or straight against an object
//! store through [`StoreGraph`].

pub mod adjacency;
pub mod edgefile;
mod index;

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::collections::HashMap;
use std::collections::HashSet;
use std::collections::VecDeque;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use itertools::Itertools;
use serde::Deserialize;
use serde::Serialize;

use crate::error::Error;
use crate::error::Result;
use crate::id::ObjectId;
use crate::object::Commit;
use crate::store::ObjectStore;

pub use adjacency::AdjacencyGraph;
pub use edgefile::EdgeFileGraph;
pub use index::RevisionIndex;

/// The part of a commit the graph cares about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitNode {
    pub id: ObjectId,
    pub parents: Vec<ObjectId>,
    /// Only used to break ordering ties.
    pub timestamp: i64,
}

impl CommitNode {
    pub fn from_commit(id: ObjectId, commit: &Commit) -> Self {
        CommitNode {
            id,
            parents: commit.parents.clone(),
            timestamp: commit.timestamp,
        }
    }
}

/// Resolves a commit id to its graph node.
pub trait CommitLookup {
    fn lookup(&self, id: &ObjectId) -> Result<CommitNode>;
}

/// Storage contract for a revision graph backend.
///
/// Backends are caches: they may lose nodes, and report damage through
/// [`Error::Inconsistent`] so the caller can rebuild them.
pub trait GraphBackend: Send + Sync {
    /// Idempotent.
    fn insert(&self, node: CommitNode) -> Result<()>;

    fn node(&self, id: &ObjectId) -> Result<Option<CommitNode>>;

    fn len(&self) -> Result<usize>;

    fn clear(&self) -> Result<()>;

    /// Verifies the backend's own integrity.
    fn check(&self) -> Result<()>;
}

/// Backend identifier.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum GraphBackendKind {
    Memory,
    #[default]
    EdgeFile,
}

impl GraphBackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            GraphBackendKind::Memory => "memory",
            GraphBackendKind::EdgeFile => "edge-file",
        }
    }
}

impl FromStr for GraphBackendKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "memory" => Ok(GraphBackendKind::Memory),
            "edge-file" => Ok(GraphBackendKind::EdgeFile),
            other => Err(Error::Config(format!("unknown graph backend {other:?}"))),
        }
    }
}

/// Opens the graph backend `kind`. File based backends need a `location`.
pub fn open_graph(kind: GraphBackendKind, location: Option<&Path>) -> Result<Arc<dyn GraphBackend>> {
    match kind {
        GraphBackendKind::Memory => Ok(Arc::new(AdjacencyGraph::new())),
        GraphBackendKind::EdgeFile => {
            let path = location.ok_or_else(|| {
                Error::Config("the edge-file graph backend needs a location".to_owned())
            })?;
            Ok(Arc::new(EdgeFileGraph::open(path)?))
        }
    }
}

/// Reads graph nodes straight from commit objects.
pub struct StoreGraph {
    objects: Arc<dyn ObjectStore>,
    cache: quick_cache::sync::Cache<ObjectId, CommitNode>,
}

impl StoreGraph {
    pub fn new(objects: Arc<dyn ObjectStore>) -> Self {
        StoreGraph {
            objects,
            cache: quick_cache::sync::Cache::new(4096),
        }
    }
}

impl CommitLookup for StoreGraph {
    fn lookup(&self, id: &ObjectId) -> Result<CommitNode> {
        if let Some(node) = self.cache.get(id) {
            return Ok(node);
        }
        let node = CommitNode::from_commit(*id, &self.objects.read_commit(id)?);
        self.cache.insert(*id, node.clone());
        Ok(node)
    }
}

/// Whether `ancestor` is reachable from `descendant` through parent links.
/// Every commit is its own ancestor.
pub fn is_ancestor<L>(graph: &L, ancestor: ObjectId, descendant: ObjectId) -> Result<bool>
where
    L: CommitLookup + ?Sized,
{
    if ancestor == descendant {
        return Ok(true);
    }
    let mut queue = VecDeque::from([descendant]);
    let mut visited = HashSet::from([descendant]);
    while let Some(id) = queue.pop_front() {
        for parent in graph.lookup(&id)?.parents {
            if parent == ancestor {
                return Ok(true);
            }
            if visited.insert(parent) {
                queue.push_back(parent);
            }
        }
    }
    Ok(false)
}

const FROM_A: u8 = 0b01;
const FROM_B: u8 = 0b10;
const FROM_BOTH: u8 = FROM_A | FROM_B;

/// The best common ancestors of `a` and `b`.
///
/// All mutually incomparable candidates are returned (criss-cross histories
/// have several), newest first, ties by ascending id. Empty when the
/// histories are unrelated.
pub fn merge_base<L>(graph: &L, a: ObjectId, b: ObjectId) -> Result<Vec<ObjectId>>
where
    L: CommitLookup + ?Sized,
{
    if a == b {
        graph.lookup(&a)?;
        return Ok(vec![a]);
    }

    // Interleaved breadth-first walk; each node remembers which tips reach it.
    let mut seen: HashMap<ObjectId, u8> = HashMap::new();
    let mut queue = VecDeque::from([(a, FROM_A), (b, FROM_B)]);
    let mut candidates = Vec::new();
    while let Some((id, side)) = queue.pop_front() {
        let flags = seen.entry(id).or_default();
        if *flags & side != 0 {
            continue;
        }
        *flags |= side;
        if *flags == FROM_BOTH {
            candidates.push(id);
            continue;
        }
        for parent in graph.lookup(&id)?.parents {
            queue.push_back((parent, side));
        }
    }

    if candidates.len() > 1 {
        // A candidate reachable from another candidate is dominated.
        let candidate_set: HashSet<ObjectId> = candidates.iter().copied().collect();
        let mut dominated = HashSet::new();
        let mut visited = HashSet::new();
        let mut queue = VecDeque::new();
        for id in &candidates {
            queue.extend(graph.lookup(id)?.parents);
        }
        while let Some(id) = queue.pop_front() {
            if !visited.insert(id) {
                continue;
            }
            if candidate_set.contains(&id) {
                dominated.insert(id);
            }
            queue.extend(graph.lookup(&id)?.parents);
        }
        candidates.retain(|id| !dominated.contains(id));
    }

    let nodes = candidates
        .into_iter()
        .map(|id| graph.lookup(&id))
        .collect::<Result<Vec<_>>>()?;
    Ok(nodes
        .into_iter()
        .sorted_by(|x, y| y.timestamp.cmp(&x.timestamp).then_with(|| x.id.cmp(&y.id)))
        .map(|node| node.id)
        .collect())
}

#[derive(Debug, PartialEq, Eq)]
struct Ready {
    timestamp: i64,
    id: ObjectId,
}

impl Ord for Ready {
    fn cmp(&self, other: &Self) -> Ordering {
        // Max-heap: newest first, then smallest id.
        self.timestamp
            .cmp(&other.timestamp)
            .then_with(|| other.id.cmp(&self.id))
    }
}

impl PartialOrd for Ready {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Iterator over commits with every child before its parents.
///
/// Created by [`topo_order`]; the reachable subgraph is loaded up front and
/// the order is produced one commit per call. Call [`topo_order`] again to
/// restart.
#[derive(Debug)]
pub struct TopoOrder {
    nodes: HashMap<ObjectId, CommitNode>,
    children_left: HashMap<ObjectId, usize>,
    ready: BinaryHeap<Ready>,
}

impl Iterator for TopoOrder {
    type Item = ObjectId;

    fn next(&mut self) -> Option<ObjectId> {
        let Ready { id, .. } = self.ready.pop()?;
        if let Some(node) = self.nodes.get(&id) {
            for parent in node.parents.iter().unique() {
                let Some(left) = self.children_left.get_mut(parent) else {
                    continue;
                };
                *left -= 1;
                if *left == 0 {
                    let timestamp = self.nodes.get(parent).map_or(0, |n| n.timestamp);
                    self.ready.push(Ready {
                        timestamp,
                        id: *parent,
                    });
                }
            }
        }
        Some(id)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.ready.len(), Some(self.nodes.len()))
    }
}

/// Every commit reachable from `roots`, children before parents.
pub fn topo_order<L, I>(graph: &L, roots: I) -> Result<TopoOrder>
where
    L: CommitLookup + ?Sized,
    I: IntoIterator<Item = ObjectId>,
{
    let mut nodes = HashMap::new();
    let mut queue: VecDeque<ObjectId> = roots.into_iter().collect();
    while let Some(id) = queue.pop_front() {
        if nodes.contains_key(&id) {
            continue;
        }
        let node = graph.lookup(&id)?;
        queue.extend(node.parents.iter().copied());
        nodes.insert(id, node);
    }

    let mut children_left: HashMap<ObjectId, usize> = HashMap::new();
    for node in nodes.values() {
        for parent in node.parents.iter().unique() {
            *children_left.entry(*parent).or_default() += 1;
        }
    }
    let ready = nodes
        .values()
        .filter(|node| !children_left.contains_key(&node.id))
        .map(|node| Ready {
            timestamp: node.timestamp,
            id: node.id,
        })
        .collect();

    Ok(TopoOrder {
        nodes,
        children_left,
        ready,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Synthetic graph keyed by small integers.
    struct Fixture(HashMap<ObjectId, CommitNode>);

    fn id(n: u8) -> ObjectId {
        ObjectId::from_raw([n; 32])
    }

    impl Fixture {
        fn new(edges: &[(u8, &[u8], i64)]) -> Self {
            Fixture(
                edges
                    .iter()
                    .map(|(n, parents, ts)| {
                        let node = CommitNode {
                            id: id(*n),
                            parents: parents.iter().map(|p| id(*p)).collect(),
                            timestamp: *ts,
                        };
                        (node.id, node)
                    })
                    .collect(),
            )
        }
    }

    impl CommitLookup for Fixture {
        fn lookup(&self, id: &ObjectId) -> Result<CommitNode> {
            self.0.get(id).cloned().ok_or(Error::NotFound(*id))
        }
    }

    #[test]
    fn linear_history() {
        // 1 <- 2 <- 3
        let g = Fixture::new(&[(1, &[], 1), (2, &[1], 2), (3, &[2], 3)]);
        assert!(is_ancestor(&g, id(1), id(3)).unwrap());
        assert!(!is_ancestor(&g, id(3), id(1)).unwrap());
        assert!(is_ancestor(&g, id(2), id(2)).unwrap());
        assert_eq!(merge_base(&g, id(3), id(2)).unwrap(), vec![id(2)]);
        assert_eq!(merge_base(&g, id(3), id(3)).unwrap(), vec![id(3)]);
    }

    #[test]
    fn fork_has_single_base() {
        //   1 <- 2 <- 3
        //         \<- 4
        let g = Fixture::new(&[(1, &[], 1), (2, &[1], 2), (3, &[2], 3), (4, &[2], 4)]);
        assert_eq!(merge_base(&g, id(3), id(4)).unwrap(), vec![id(2)]);
        assert!(!is_ancestor(&g, id(3), id(4)).unwrap());
    }

    #[test]
    fn criss_cross_returns_both_bases_newest_first() {
        // 1 <- 2, 1 <- 3, 4 = merge(2, 3), 5 = merge(3, 2)
        let g = Fixture::new(&[
            (1, &[], 1),
            (2, &[1], 2),
            (3, &[1], 3),
            (4, &[2, 3], 4),
            (5, &[3, 2], 5),
        ]);
        assert_eq!(merge_base(&g, id(4), id(5)).unwrap(), vec![id(3), id(2)]);
    }

    #[test]
    fn dominated_candidate_is_dropped() {
        // Both tips list 2 and its parent 1 as parents; 1 is reached from
        // both sides too but is an ancestor of 2.
        let g = Fixture::new(&[(1, &[], 1), (2, &[1], 2), (3, &[2, 1], 3), (4, &[2, 1], 4)]);
        assert_eq!(merge_base(&g, id(3), id(4)).unwrap(), vec![id(2)]);
    }

    #[test]
    fn unrelated_histories_have_no_base() {
        let g = Fixture::new(&[(1, &[], 1), (2, &[], 2)]);
        assert!(merge_base(&g, id(1), id(2)).unwrap().is_empty());
    }

    #[test]
    fn topo_order_puts_children_first_with_deterministic_ties() {
        //   1 <- 2 <- 4
        //    \<- 3 <-/
        let g = Fixture::new(&[(1, &[], 1), (2, &[1], 5), (3, &[1], 5), (4, &[2, 3], 9)]);
        let order: Vec<_> = topo_order(&g, [id(4)]).unwrap().collect();
        assert_eq!(order, vec![id(4), id(2), id(3), id(1)]);

        let again: Vec<_> = topo_order(&g, [id(4)]).unwrap().collect();
        assert_eq!(order, again);
    }

    #[test]
    fn topo_order_of_multiple_roots_covers_each_commit_once() {
        let g = Fixture::new(&[(1, &[], 1), (2, &[1], 2), (3, &[1], 3)]);
        let order: Vec<_> = topo_order(&g, [id(2), id(3), id(2)]).unwrap().collect();
        assert_eq!(order, vec![id(3), id(2), id(1)]);
    }

    #[test]
    fn missing_commit_is_reported() {
        let g = Fixture::new(&[(2, &[1], 2)]);
        assert!(matches!(
            is_ancestor(&g, id(9), id(2)),
            Err(Error::NotFound(missing)) if missing == id(1)
        ));
    }
}

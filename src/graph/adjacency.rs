use std::collections::HashMap;
use std::sync::PoisonError;
use std::sync::RwLock;

use crate::error::Result;
use crate::graph::CommitNode;
use crate::graph::GraphBackend;
use crate::id::ObjectId;

/// In-memory adjacency list. Never inconsistent, lost on drop.
#[derive(Debug, Default)]
pub struct AdjacencyGraph {
    nodes: RwLock<HashMap<ObjectId, CommitNode>>,
}

impl AdjacencyGraph {
    pub fn new() -> Self {
        Self::default()
    }
}

impl GraphBackend for AdjacencyGraph {
    fn insert(&self, node: CommitNode) -> Result<()> {
        self.nodes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(node.id)
            .or_insert(node);
        Ok(())
    }

    fn node(&self, id: &ObjectId) -> Result<Option<CommitNode>> {
        Ok(self
            .nodes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned())
    }

    fn len(&self) -> Result<usize> {
        Ok(self.nodes.read().unwrap_or_else(PoisonError::into_inner).len())
    }

    fn clear(&self) -> Result<()> {
        self.nodes.write().unwrap_or_else(PoisonError::into_inner).clear();
        Ok(())
    }

    fn check(&self) -> Result<()> {
        Ok(())
    }
}

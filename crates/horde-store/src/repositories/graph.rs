//! In-memory implementation of GraphRepository.

use async_trait::async_trait;
use horde_core::Result;
use horde_core::graph::Graph;
use horde_core::ids::ContentHash;
use horde_core::ports::GraphRepository;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Graphs keyed by content hash, so identical graphs share one allocation.
#[derive(Default)]
pub struct MemoryGraphRepository {
    graphs: RwLock<HashMap<ContentHash, Arc<Graph>>>,
}

impl MemoryGraphRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl GraphRepository for MemoryGraphRepository {
    async fn add(&self, graph: Graph) -> Result<Arc<Graph>> {
        let mut graphs = self.graphs.write().await;
        let shared = graphs
            .entry(graph.hash.clone())
            .or_insert_with(|| Arc::new(graph));
        Ok(Arc::clone(shared))
    }

    async fn get(&self, hash: &ContentHash) -> Result<Option<Arc<Graph>>> {
        Ok(self.graphs.read().await.get(hash).cloned())
    }
}

use std::sync::Arc;

use tokio::sync::Mutex;

use crate::error::{DumpError, DumpResult};
use crate::types::{ChangesetBlock, NodeBlock, RelationBlock, WayBlock};
use crate::writer::OutputSink;

#[derive(Debug, Default)]
struct Inner {
    changesets: Vec<Arc<ChangesetBlock>>,
    nodes: Vec<Arc<NodeBlock>>,
    ways: Vec<Arc<WayBlock>>,
    relations: Vec<Arc<RelationBlock>>,
    finished: u32,
}

/// In-memory sink for tests.
///
/// Records every delivered block; clones share the same storage, so a
/// handle kept by the test observes what the pipeline-owned sink wrote.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    inner: Arc<Mutex<Inner>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn changeset_blocks(&self) -> Vec<Arc<ChangesetBlock>> {
        self.inner.lock().await.changesets.clone()
    }

    pub async fn node_blocks(&self) -> Vec<Arc<NodeBlock>> {
        self.inner.lock().await.nodes.clone()
    }

    pub async fn way_blocks(&self) -> Vec<Arc<WayBlock>> {
        self.inner.lock().await.ways.clone()
    }

    pub async fn relation_blocks(&self) -> Vec<Arc<RelationBlock>> {
        self.inner.lock().await.relations.clone()
    }

    pub async fn finish_calls(&self) -> u32 {
        self.inner.lock().await.finished
    }

    /// All nodes across blocks, flattened.
    pub async fn all_nodes(&self) -> Vec<crate::types::Node> {
        self.inner
            .lock()
            .await
            .nodes
            .iter()
            .flat_map(|block| block.nodes.iter().cloned())
            .collect()
    }
}

impl OutputSink for MemorySink {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn changesets(&mut self, block: Arc<ChangesetBlock>) -> DumpResult<()> {
        self.inner.lock().await.changesets.push(block);
        Ok(())
    }

    async fn nodes(&mut self, block: Arc<NodeBlock>) -> DumpResult<()> {
        self.inner.lock().await.nodes.push(block);
        Ok(())
    }

    async fn ways(&mut self, block: Arc<WayBlock>) -> DumpResult<()> {
        self.inner.lock().await.ways.push(block);
        Ok(())
    }

    async fn relations(&mut self, block: Arc<RelationBlock>) -> DumpResult<()> {
        self.inner.lock().await.relations.push(block);
        Ok(())
    }

    async fn finish(&mut self) -> DumpResult<()> {
        let mut inner = self.inner.lock().await;
        inner.finished += 1;
        if inner.finished > 1 {
            return Err(DumpError::internal("finish called more than once"));
        }
        Ok(())
    }
}

//! Restricts a stream to changesets only.

use std::sync::Arc;

use crate::error::DumpResult;
use crate::types::{ChangesetBlock, NodeBlock, RelationBlock, WayBlock};
use crate::writer::OutputSink;

/// Passes changesets through unchanged and drops every element pass.
/// Whether discussions appear in the output is decided by the inner
/// writer's configuration.
pub struct ChangesetFilter<S> {
    inner: S,
}

impl<S: OutputSink> ChangesetFilter<S> {
    pub fn new(inner: S) -> Self {
        Self { inner }
    }
}

impl<S: OutputSink> OutputSink for ChangesetFilter<S> {
    fn name(&self) -> &'static str {
        self.inner.name()
    }

    async fn changesets(&mut self, block: Arc<ChangesetBlock>) -> DumpResult<()> {
        self.inner.changesets(block).await
    }

    async fn nodes(&mut self, _block: Arc<NodeBlock>) -> DumpResult<()> {
        Ok(())
    }

    async fn ways(&mut self, _block: Arc<WayBlock>) -> DumpResult<()> {
        Ok(())
    }

    async fn relations(&mut self, _block: Arc<RelationBlock>) -> DumpResult<()> {
        Ok(())
    }

    async fn finish(&mut self) -> DumpResult<()> {
        self.inner.finish().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Changeset, Node};
    use crate::writer::memory::MemorySink;
    use chrono::NaiveDateTime;

    fn ts(text: &str) -> NaiveDateTime {
        NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S").unwrap()
    }

    #[tokio::test]
    async fn keeps_changesets_and_drops_elements() {
        let sink = MemorySink::new();
        let mut filter = ChangesetFilter::new(sink.clone());

        filter
            .changesets(Arc::new(ChangesetBlock {
                changesets: vec![Changeset {
                    id: 10,
                    uid: 7,
                    created_at: ts("2020-01-01 00:00:00"),
                    min_lat: None,
                    max_lat: None,
                    min_lon: None,
                    max_lon: None,
                    closed_at: ts("2020-01-01 01:00:00"),
                    num_changes: 1,
                }],
                tags: vec![],
                comments: vec![],
            }))
            .await
            .unwrap();
        filter
            .nodes(Arc::new(NodeBlock {
                nodes: vec![Node {
                    id: 1,
                    version: 1,
                    changeset_id: 10,
                    timestamp: ts("2020-01-01 00:00:00"),
                    visible: true,
                    redaction_id: None,
                    latitude: 0,
                    longitude: 0,
                }],
                tags: vec![],
            }))
            .await
            .unwrap();
        filter.finish().await.unwrap();

        let changesets = sink.changeset_blocks().await;
        assert_eq!(changesets.len(), 1);
        assert_eq!(changesets[0].changesets[0].id, 10);
        assert!(sink.node_blocks().await.is_empty());
        assert_eq!(sink.finish_calls().await, 1);
    }
}

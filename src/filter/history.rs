//! Reduces a full-history stream to its current state.
//!
//! The sorter guarantees all versions of an id arrive contiguously in
//! ascending version order, so a single pass suffices: an element version
//! is current exactly when the next parent has a larger id, or the
//! stream ends. Because the last element of a block may continue into the
//! next block, it is parked in an overflow slot together with its child
//! rows and resolved once the next block (or the next entity type, or
//! `finish`) arrives. Current versions that are deleted are dropped
//! entirely.

use std::sync::Arc;

use crate::error::DumpResult;
use crate::types::{
    ChangesetBlock, ElementTag, Node, NodeBlock, Relation, RelationBlock, RelationMember, Way,
    WayBlock, WayNode,
};
use crate::writer::OutputSink;

struct NodeOverflow {
    node: Node,
    tags: Vec<ElementTag>,
}

struct WayOverflow {
    way: Way,
    way_nodes: Vec<WayNode>,
    tags: Vec<ElementTag>,
}

struct RelationOverflow {
    relation: Relation,
    members: Vec<RelationMember>,
    tags: Vec<ElementTag>,
}

/// History-to-current filter wrapping another sink.
pub struct HistoryFilter<S> {
    inner: S,
    nodes_overflow: Option<NodeOverflow>,
    ways_overflow: Option<WayOverflow>,
    relations_overflow: Option<RelationOverflow>,
}

impl<S: OutputSink> HistoryFilter<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            nodes_overflow: None,
            ways_overflow: None,
            relations_overflow: None,
        }
    }

    fn filter_nodes(&mut self, block: &NodeBlock) -> NodeBlock {
        let ns = &block.nodes;
        let ts = &block.tags;
        let mut out = NodeBlock::default();

        // A parked node is current unless its version list continues into
        // this block.
        if let Some(overflow) = &mut self.nodes_overflow
            && (ns.is_empty() || ns[0].id > overflow.node.id)
            && overflow.node.visible
        {
            out.nodes.push(overflow.node.clone());
            out.tags.append(&mut overflow.tags);
        }

        let mut tag_index = 0;
        for i in 1..ns.len() {
            if ns[i].id > ns[i - 1].id {
                let current = &ns[i - 1];
                if !current.visible {
                    continue;
                }
                out.nodes.push(current.clone());
                collect_tags(ts, &mut tag_index, current.id, current.version, &mut out.tags);
            }
        }

        self.nodes_overflow = ns.last().map(|last| {
            let mut tags = Vec::new();
            collect_tags(ts, &mut tag_index, last.id, last.version, &mut tags);
            NodeOverflow {
                node: last.clone(),
                tags,
            }
        });

        out
    }

    fn filter_ways(&mut self, block: &WayBlock) -> WayBlock {
        let ws = &block.ways;
        let wns = &block.way_nodes;
        let ts = &block.tags;
        let mut out = WayBlock::default();

        if let Some(overflow) = &mut self.ways_overflow
            && (ws.is_empty() || ws[0].id > overflow.way.id)
            && overflow.way.visible
        {
            out.ways.push(overflow.way.clone());
            out.way_nodes.append(&mut overflow.way_nodes);
            out.tags.append(&mut overflow.tags);
        }

        let mut tag_index = 0;
        let mut node_index = 0;
        for i in 1..ws.len() {
            if ws[i].id > ws[i - 1].id {
                let current = &ws[i - 1];
                if !current.visible {
                    continue;
                }
                out.ways.push(current.clone());
                collect_way_nodes(
                    wns,
                    &mut node_index,
                    current.id,
                    current.version,
                    &mut out.way_nodes,
                );
                collect_tags(ts, &mut tag_index, current.id, current.version, &mut out.tags);
            }
        }

        self.ways_overflow = ws.last().map(|last| {
            let mut way_nodes = Vec::new();
            let mut tags = Vec::new();
            collect_way_nodes(wns, &mut node_index, last.id, last.version, &mut way_nodes);
            collect_tags(ts, &mut tag_index, last.id, last.version, &mut tags);
            WayOverflow {
                way: last.clone(),
                way_nodes,
                tags,
            }
        });

        out
    }

    fn filter_relations(&mut self, block: &RelationBlock) -> RelationBlock {
        let rs = &block.relations;
        let rms = &block.members;
        let ts = &block.tags;
        let mut out = RelationBlock::default();

        if let Some(overflow) = &mut self.relations_overflow
            && (rs.is_empty() || rs[0].id > overflow.relation.id)
            && overflow.relation.visible
        {
            out.relations.push(overflow.relation.clone());
            out.members.append(&mut overflow.members);
            out.tags.append(&mut overflow.tags);
        }

        let mut tag_index = 0;
        let mut member_index = 0;
        for i in 1..rs.len() {
            if rs[i].id > rs[i - 1].id {
                let current = &rs[i - 1];
                if !current.visible {
                    continue;
                }
                out.relations.push(current.clone());
                collect_members(
                    rms,
                    &mut member_index,
                    current.id,
                    current.version,
                    &mut out.members,
                );
                collect_tags(ts, &mut tag_index, current.id, current.version, &mut out.tags);
            }
        }

        self.relations_overflow = rs.last().map(|last| {
            let mut members = Vec::new();
            let mut tags = Vec::new();
            collect_members(rms, &mut member_index, last.id, last.version, &mut members);
            collect_tags(ts, &mut tag_index, last.id, last.version, &mut tags);
            RelationOverflow {
                relation: last.clone(),
                members,
                tags,
            }
        });

        out
    }
}

fn collect_tags(
    tags: &[ElementTag],
    index: &mut usize,
    id: i64,
    version: i64,
    out: &mut Vec<ElementTag>,
) {
    while *index < tags.len() && tags[*index].element_id <= id {
        let tag = &tags[*index];
        if tag.element_id == id && tag.version == version {
            out.push(tag.clone());
        }
        *index += 1;
    }
}

fn collect_way_nodes(
    way_nodes: &[WayNode],
    index: &mut usize,
    id: i64,
    version: i64,
    out: &mut Vec<WayNode>,
) {
    while *index < way_nodes.len() && way_nodes[*index].way_id <= id {
        let way_node = &way_nodes[*index];
        if way_node.way_id == id && way_node.version == version {
            out.push(way_node.clone());
        }
        *index += 1;
    }
}

fn collect_members(
    members: &[RelationMember],
    index: &mut usize,
    id: i64,
    version: i64,
    out: &mut Vec<RelationMember>,
) {
    while *index < members.len() && members[*index].relation_id <= id {
        let member = &members[*index];
        if member.relation_id == id && member.version == version {
            out.push(member.clone());
        }
        *index += 1;
    }
}

impl<S: OutputSink> OutputSink for HistoryFilter<S> {
    fn name(&self) -> &'static str {
        self.inner.name()
    }

    async fn changesets(&mut self, block: Arc<ChangesetBlock>) -> DumpResult<()> {
        // Changesets are all current; nothing to filter.
        self.inner.changesets(block).await
    }

    async fn nodes(&mut self, block: Arc<NodeBlock>) -> DumpResult<()> {
        let filtered = self.filter_nodes(&block);
        self.inner.nodes(Arc::new(filtered)).await
    }

    async fn ways(&mut self, block: Arc<WayBlock>) -> DumpResult<()> {
        // A node overflow still parked means the node pass ended without
        // an empty terminal block; resolve it first.
        if self.nodes_overflow.is_some() {
            let flushed = self.filter_nodes(&NodeBlock::default());
            self.inner.nodes(Arc::new(flushed)).await?;
        }
        let filtered = self.filter_ways(&block);
        self.inner.ways(Arc::new(filtered)).await
    }

    async fn relations(&mut self, block: Arc<RelationBlock>) -> DumpResult<()> {
        if self.ways_overflow.is_some() {
            let flushed = self.filter_ways(&WayBlock::default());
            self.inner.ways(Arc::new(flushed)).await?;
        }
        let filtered = self.filter_relations(&block);
        self.inner.relations(Arc::new(filtered)).await
    }

    async fn finish(&mut self) -> DumpResult<()> {
        if self.relations_overflow.is_some() {
            let flushed = self.filter_relations(&RelationBlock::default());
            self.inner.relations(Arc::new(flushed)).await?;
        }
        self.inner.finish().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::writer::memory::MemorySink;
    use chrono::NaiveDateTime;

    fn ts(text: &str) -> NaiveDateTime {
        NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S").unwrap()
    }

    fn node(id: i64, version: i64, visible: bool) -> Node {
        Node {
            id,
            version,
            changeset_id: 1,
            timestamp: ts("2020-01-01 00:00:00"),
            visible,
            redaction_id: None,
            latitude: 0,
            longitude: 0,
        }
    }

    fn tag(id: i64, version: i64, key: &str) -> ElementTag {
        ElementTag {
            element_id: id,
            version,
            key: key.to_string(),
            value: "v".to_string(),
        }
    }

    async fn run_node_blocks(blocks: Vec<NodeBlock>) -> Vec<Node> {
        let sink = MemorySink::new();
        let mut filter = HistoryFilter::new(sink.clone());
        for block in blocks {
            filter.nodes(Arc::new(block)).await.unwrap();
        }
        // The joiner always ends a pass with an undersized (here empty)
        // terminal block, which flushes the overflow.
        filter.nodes(Arc::new(NodeBlock::default())).await.unwrap();

        sink.all_nodes().await
    }

    #[tokio::test]
    async fn keeps_only_latest_version() {
        let out = run_node_blocks(vec![NodeBlock {
            nodes: vec![node(5, 1, true), node(5, 2, true)],
            tags: vec![],
        }])
        .await;
        assert_eq!(out.len(), 1);
        assert_eq!((out[0].id, out[0].version), (5, 2));
    }

    #[tokio::test]
    async fn deleted_latest_version_is_dropped() {
        let out = run_node_blocks(vec![NodeBlock {
            nodes: vec![node(9, 1, true), node(9, 2, false)],
            tags: vec![],
        }])
        .await;
        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn version_lists_spanning_blocks_resolve_correctly() {
        // Versions of id 5 continue into the second block; only (5, 3)
        // survives. Id 6's last version is deleted.
        let out = run_node_blocks(vec![
            NodeBlock {
                nodes: vec![node(4, 1, true), node(5, 1, true), node(5, 2, true)],
                tags: vec![],
            },
            NodeBlock {
                nodes: vec![node(5, 3, true), node(6, 1, true), node(6, 2, false)],
                tags: vec![],
            },
        ])
        .await;

        let keys: Vec<(i64, i64)> = out.iter().map(|n| (n.id, n.version)).collect();
        assert_eq!(keys, vec![(4, 1), (5, 3)]);
    }

    #[tokio::test]
    async fn tags_follow_the_surviving_version() {
        let sink = MemorySink::new();
        let mut filter = HistoryFilter::new(sink.clone());
        filter
            .nodes(Arc::new(NodeBlock {
                nodes: vec![node(5, 1, true), node(5, 2, true), node(7, 1, true)],
                tags: vec![tag(5, 1, "old"), tag(5, 2, "new"), tag(7, 1, "other")],
            }))
            .await
            .unwrap();
        filter.nodes(Arc::new(NodeBlock::default())).await.unwrap();

        let blocks = sink.node_blocks().await;
        let tags: Vec<String> = blocks
            .iter()
            .flat_map(|b| b.tags.iter().map(|t| t.key.clone()))
            .collect();
        assert_eq!(tags, vec!["new".to_string(), "other".to_string()]);
    }

    #[tokio::test]
    async fn overflow_flushes_on_entity_transition_and_finish() {
        let sink = MemorySink::new();
        let mut filter = HistoryFilter::new(sink.clone());

        // Node pass without its terminal empty block.
        filter
            .nodes(Arc::new(NodeBlock {
                nodes: vec![node(1, 1, true)],
                tags: vec![],
            }))
            .await
            .unwrap();
        // The way call must first resolve the parked node.
        filter.ways(Arc::new(WayBlock::default())).await.unwrap();

        let nodes = sink.all_nodes().await;
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].id, 1);

        // A parked relation resolves on finish.
        let relation = Relation {
            id: 3,
            version: 1,
            changeset_id: 1,
            timestamp: ts("2020-01-01 00:00:00"),
            visible: true,
            redaction_id: None,
        };
        filter
            .relations(Arc::new(RelationBlock {
                relations: vec![relation],
                members: vec![],
                tags: vec![],
            }))
            .await
            .unwrap();
        filter.finish().await.unwrap();

        let relations: Vec<_> = sink
            .relation_blocks()
            .await
            .iter()
            .flat_map(|b| b.relations.clone())
            .collect();
        assert_eq!(relations.len(), 1);
        assert_eq!(relations[0].id, 3);
        assert_eq!(sink.finish_calls().await, 1);
    }
}

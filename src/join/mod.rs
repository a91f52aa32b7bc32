//! The streaming joiner and writer fan-out.
//!
//! For each parent entity type one producer task walks the parent's final
//! sorted run together with its child runs, assembling blocks of complete
//! elements in `(id, version)` order. Every block is shared as an `Arc`
//! with one consumer task per output sink through a bounded channel of
//! capacity one: the channel is the rendezvous that gives every sink the
//! identical block sequence and throttles the producer to the slowest
//! sink. A final undersized (possibly empty) block terminates the pass.

mod cursor;

pub use cursor::ChildCursor;

use std::sync::Arc;
use std::time::Instant;

use metrics::{counter, histogram};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, info};

use crate::config::{DumpConfig, JoinConfig};
use crate::error::{DumpError, DumpResult};
use crate::metrics::{
    BLOCK_WRITE_DURATION_SECONDS, ELEMENT_LABEL, ELEMENTS_EMITTED_TOTAL, SINK_LABEL,
};
use crate::records::codec::Codec;
use crate::records::{NoRecord, TableRecord};
use crate::sort::{TypedRunReader, final_run_name};
use crate::types::{
    Changeset, ChangesetBlock, ChangesetComment, ChangesetTag, ElementTag, Node, NodeBlock,
    Relation, RelationBlock, RelationMember, Way, WayBlock, WayNode,
};
use crate::users::UserStore;
use crate::writer::{OutputSink, Sink};

/// A child row that can be matched against a parent's join key.
pub trait ChildRecord: TableRecord {
    /// The `(id, version)` pair this row belongs to; unversioned children
    /// report a zero version.
    fn join_key(&self) -> (i64, i64);
}

impl ChildRecord for ChangesetTag {
    fn join_key(&self) -> (i64, i64) {
        (self.element_id, 0)
    }
}

impl ChildRecord for ElementTag {
    fn join_key(&self) -> (i64, i64) {
        (self.element_id, self.version)
    }
}

impl ChildRecord for WayNode {
    fn join_key(&self) -> (i64, i64) {
        (self.way_id, self.version)
    }
}

impl ChildRecord for RelationMember {
    fn join_key(&self) -> (i64, i64) {
        (self.relation_id, self.version)
    }
}

impl ChildRecord for ChangesetComment {
    fn join_key(&self) -> (i64, i64) {
        // Comments are keyed by (changeset, created_at) in the run, but
        // join on the changeset alone; ties keep chronological run order.
        (self.changeset_id, 0)
    }
}

impl ChildRecord for NoRecord {
    fn join_key(&self) -> (i64, i64) {
        match *self {}
    }
}

/// A parent entity type: the tables it joins, its filter rule and how its
/// blocks are built and delivered to a sink.
pub trait ParentRecord: TableRecord {
    type Tag: ChildRecord;
    type Inner: ChildRecord;
    type Block: Send + Sync + 'static;

    /// Label for logs and metrics.
    const ELEMENT: &'static str;
    const TABLE: &'static str;
    const TAG_TABLE: &'static str;
    const INNER_TABLE: Option<&'static str>;

    fn join_key(&self) -> (i64, i64);

    /// Whether the row may be published. Redacted versions and rows with
    /// negative ids never reach a writer.
    fn keep(&self) -> bool;

    /// Hook invoked for every kept row before it is published.
    fn observe(&self, _users: &UserStore) {}

    fn block_size(config: &JoinConfig) -> usize;

    fn build_block(elements: Vec<Self>, tags: Vec<Self::Tag>, inners: Vec<Self::Inner>)
    -> Self::Block;

    fn block_len(block: &Self::Block) -> usize;

    fn deliver(
        sink: &mut Sink,
        block: Arc<Self::Block>,
    ) -> impl Future<Output = DumpResult<()>> + Send;
}

impl ParentRecord for Changeset {
    type Tag = ChangesetTag;
    type Inner = ChangesetComment;
    type Block = ChangesetBlock;

    const ELEMENT: &'static str = "changeset";
    const TABLE: &'static str = "changesets";
    const TAG_TABLE: &'static str = "changeset_tags";
    const INNER_TABLE: Option<&'static str> = Some("changeset_comments");

    fn join_key(&self) -> (i64, i64) {
        (self.id, 0)
    }

    fn keep(&self) -> bool {
        // Changesets are neither redacted nor synthetic.
        true
    }

    fn observe(&self, users: &UserStore) {
        users.record_changeset(self.id, i64::from(self.uid));
    }

    fn block_size(config: &JoinConfig) -> usize {
        config.element_block_size
    }

    fn build_block(
        elements: Vec<Self>,
        tags: Vec<Self::Tag>,
        inners: Vec<Self::Inner>,
    ) -> Self::Block {
        ChangesetBlock {
            changesets: elements,
            tags,
            comments: inners,
        }
    }

    fn block_len(block: &Self::Block) -> usize {
        block.changesets.len()
    }

    async fn deliver(sink: &mut Sink, block: Arc<Self::Block>) -> DumpResult<()> {
        sink.changesets(block).await
    }
}

impl ParentRecord for Node {
    type Tag = ElementTag;
    type Inner = NoRecord;
    type Block = NodeBlock;

    const ELEMENT: &'static str = "node";
    const TABLE: &'static str = "nodes";
    const TAG_TABLE: &'static str = "node_tags";
    const INNER_TABLE: Option<&'static str> = None;

    fn join_key(&self) -> (i64, i64) {
        (self.id, self.version)
    }

    fn keep(&self) -> bool {
        self.id >= 0 && self.redaction_id.is_none()
    }

    fn block_size(config: &JoinConfig) -> usize {
        config.element_block_size
    }

    fn build_block(
        elements: Vec<Self>,
        tags: Vec<Self::Tag>,
        _inners: Vec<Self::Inner>,
    ) -> Self::Block {
        NodeBlock {
            nodes: elements,
            tags,
        }
    }

    fn block_len(block: &Self::Block) -> usize {
        block.nodes.len()
    }

    async fn deliver(sink: &mut Sink, block: Arc<Self::Block>) -> DumpResult<()> {
        sink.nodes(block).await
    }
}

impl ParentRecord for Way {
    type Tag = ElementTag;
    type Inner = WayNode;
    type Block = WayBlock;

    const ELEMENT: &'static str = "way";
    const TABLE: &'static str = "ways";
    const TAG_TABLE: &'static str = "way_tags";
    const INNER_TABLE: Option<&'static str> = Some("way_nodes");

    fn join_key(&self) -> (i64, i64) {
        (self.id, self.version)
    }

    fn keep(&self) -> bool {
        self.id >= 0 && self.redaction_id.is_none()
    }

    fn block_size(config: &JoinConfig) -> usize {
        config.element_block_size
    }

    fn build_block(
        elements: Vec<Self>,
        tags: Vec<Self::Tag>,
        inners: Vec<Self::Inner>,
    ) -> Self::Block {
        WayBlock {
            ways: elements,
            way_nodes: inners,
            tags,
        }
    }

    fn block_len(block: &Self::Block) -> usize {
        block.ways.len()
    }

    async fn deliver(sink: &mut Sink, block: Arc<Self::Block>) -> DumpResult<()> {
        sink.ways(block).await
    }
}

impl ParentRecord for Relation {
    type Tag = ElementTag;
    type Inner = RelationMember;
    type Block = RelationBlock;

    const ELEMENT: &'static str = "relation";
    const TABLE: &'static str = "relations";
    const TAG_TABLE: &'static str = "relation_tags";
    const INNER_TABLE: Option<&'static str> = Some("relation_members");

    fn join_key(&self) -> (i64, i64) {
        (self.id, self.version)
    }

    fn keep(&self) -> bool {
        self.id >= 0 && self.redaction_id.is_none()
    }

    fn block_size(config: &JoinConfig) -> usize {
        config.relation_block_size
    }

    fn build_block(
        elements: Vec<Self>,
        tags: Vec<Self::Tag>,
        inners: Vec<Self::Inner>,
    ) -> Self::Block {
        RelationBlock {
            relations: elements,
            members: inners,
            tags,
        }
    }

    fn block_len(block: &Self::Block) -> usize {
        block.relations.len()
    }

    async fn deliver(sink: &mut Sink, block: Arc<Self::Block>) -> DumpResult<()> {
        sink.relations(block).await
    }
}

/// Runs one entity pass: a producer joining the sorted runs, one consumer
/// per sink. Returns the sinks for the next pass; the first task error
/// aborts the remaining tasks and is propagated.
pub async fn run_pass<P: ParentRecord>(
    config: &DumpConfig,
    users: Arc<UserStore>,
    sinks: Vec<Sink>,
) -> DumpResult<Vec<Sink>> {
    let block_size = P::block_size(&config.join);
    let num_sinks = sinks.len();
    info!(element = P::ELEMENT, num_sinks, block_size, "starting pass");

    let mut tasks: JoinSet<DumpResult<Option<(usize, Sink)>>> = JoinSet::new();
    let mut outputs = Vec::with_capacity(num_sinks);
    for (index, sink) in sinks.into_iter().enumerate() {
        let (tx, rx) = mpsc::channel::<Arc<P::Block>>(1);
        outputs.push(tx);
        tasks.spawn(async move { consume::<P>(index, sink, rx, block_size).await.map(Some) });
    }

    let data_dir = config.data_dir.clone();
    let codec = Codec::new(config.epoch);
    tasks.spawn(async move {
        produce::<P>(data_dir, codec, block_size, users, outputs)
            .await
            .map(|_| None)
    });

    let mut returned: Vec<Option<Sink>> = (0..num_sinks).map(|_| None).collect();
    while let Some(result) = tasks.join_next().await {
        match result {
            Ok(Ok(Some((index, sink)))) => returned[index] = Some(sink),
            Ok(Ok(None)) => {}
            Ok(Err(err)) => {
                tasks.abort_all();
                while tasks.join_next().await.is_some() {}
                return Err(err);
            }
            Err(join_err) => {
                tasks.abort_all();
                while tasks.join_next().await.is_some() {}
                return Err(DumpError::internal(join_err.to_string()));
            }
        }
    }

    let sinks = returned
        .into_iter()
        .map(|sink| sink.ok_or_else(|| DumpError::internal("a writer task vanished")))
        .collect::<DumpResult<Vec<Sink>>>()?;

    info!(element = P::ELEMENT, "pass complete");
    Ok(sinks)
}

async fn produce<P: ParentRecord>(
    data_dir: std::path::PathBuf,
    codec: Codec,
    block_size: usize,
    users: Arc<UserStore>,
    outputs: Vec<mpsc::Sender<Arc<P::Block>>>,
) -> DumpResult<()> {
    let parent_run = data_dir.join(P::TABLE).join(final_run_name());
    let mut parents = TypedRunReader::<P>::open(P::TABLE, &parent_run, codec)?;
    let mut tag_cursor = ChildCursor::<P::Tag>::open(Some(P::TAG_TABLE), &data_dir, codec)?;
    let mut inner_cursor = ChildCursor::<P::Inner>::open(P::INNER_TABLE, &data_dir, codec)?;

    let mut elements: Vec<P> = Vec::with_capacity(block_size);
    let mut tags: Vec<P::Tag> = Vec::new();
    let mut inners: Vec<P::Inner> = Vec::new();

    while let Some(parent) = parents.next_record()? {
        if !parent.keep() {
            continue;
        }
        parent.observe(&users);

        let key = parent.join_key();
        inner_cursor.collect_matching(key, &mut inners)?;
        tag_cursor.collect_matching(key, &mut tags)?;
        elements.push(parent);

        if elements.len() == block_size {
            let full = std::mem::replace(&mut elements, Vec::with_capacity(block_size));
            let block = P::build_block(full, std::mem::take(&mut tags), std::mem::take(&mut inners));
            if !publish::<P>(&outputs, block).await {
                // A consumer went away; its own error is what the caller
                // will see.
                return Ok(());
            }
        }
    }

    // The terminal, possibly empty, undersized block releases consumers.
    let block = P::build_block(elements, tags, inners);
    publish::<P>(&outputs, block).await;
    Ok(())
}

/// Sends the block to every consumer. Returns false if any consumer has
/// terminated.
async fn publish<P: ParentRecord>(
    outputs: &[mpsc::Sender<Arc<P::Block>>],
    block: P::Block,
) -> bool {
    let len = P::block_len(&block);
    counter!(ELEMENTS_EMITTED_TOTAL, ELEMENT_LABEL => P::ELEMENT).increment(len as u64);
    debug!(element = P::ELEMENT, len, "publishing block");

    let block = Arc::new(block);
    for output in outputs {
        if output.send(block.clone()).await.is_err() {
            return false;
        }
    }
    true
}

async fn consume<P: ParentRecord>(
    index: usize,
    mut sink: Sink,
    mut blocks: mpsc::Receiver<Arc<P::Block>>,
    block_size: usize,
) -> DumpResult<(usize, Sink)> {
    while let Some(block) = blocks.recv().await {
        let len = P::block_len(&block);
        let started = Instant::now();
        P::deliver(&mut sink, block).await?;
        histogram!(
            BLOCK_WRITE_DURATION_SECONDS,
            ELEMENT_LABEL => P::ELEMENT,
            SINK_LABEL => sink.name(),
        )
        .record(started.elapsed().as_secs_f64());

        if len < block_size {
            break;
        }
    }
    Ok((index, sink))
}

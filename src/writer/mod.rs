//! Output backends and the sink contract they implement.
//!
//! A sink receives the four entity passes as ordered blocks, then a single
//! `finish` call where all flushing and closing happens. Filters are sinks
//! wrapping an inner sink.

pub mod xml;

pub mod pbf;

#[cfg(any(test, feature = "test-utils"))]
pub mod memory;

use std::fs::File;
use std::io::BufWriter;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::NaiveDateTime;

use crate::config::DumpConfig;
use crate::error::{DumpError, DumpResult};
use crate::filter::{ChangesetFilter, HistoryFilter};
use crate::types::{ChangesetBlock, NodeBlock, RelationBlock, WayBlock};
use crate::users::UserStore;
use crate::writer::pbf::{PbfOptions, PbfWriter};
use crate::writer::xml::{XmlOptions, XmlWriter};

#[cfg(any(test, feature = "test-utils"))]
use crate::writer::memory::MemorySink;

/// The contract between the joiner fan-out and an output backend.
///
/// Blocks arrive in pass order (changesets, nodes, ways, relations), each
/// sorted as the joiner guarantees. `finish` is called exactly once after
/// the relation pass.
pub trait OutputSink: Send + 'static {
    fn name(&self) -> &'static str;

    fn changesets(
        &mut self,
        block: Arc<ChangesetBlock>,
    ) -> impl Future<Output = DumpResult<()>> + Send;

    fn nodes(&mut self, block: Arc<NodeBlock>) -> impl Future<Output = DumpResult<()>> + Send;

    fn ways(&mut self, block: Arc<WayBlock>) -> impl Future<Output = DumpResult<()>> + Send;

    fn relations(
        &mut self,
        block: Arc<RelationBlock>,
    ) -> impl Future<Output = DumpResult<()>> + Send;

    fn finish(&mut self) -> impl Future<Output = DumpResult<()>> + Send;
}

/// What outputs a dump run should produce.
#[derive(Debug)]
pub enum SinkSpec {
    /// A planet XML file; `current_only` keeps just the latest visible
    /// version of every element.
    Xml { path: PathBuf, current_only: bool },
    /// A planet PBF file.
    Pbf { path: PathBuf, current_only: bool },
    /// A changeset dump (no nodes/ways/relations) in XML.
    ChangesetXml { path: PathBuf },
    /// Test sink recording every delivered block.
    #[cfg(any(test, feature = "test-utils"))]
    Memory(MemorySink),
    /// Test sink behind the history filter.
    #[cfg(any(test, feature = "test-utils"))]
    CurrentMemory(MemorySink),
    /// Test sink behind the changeset filter.
    #[cfg(any(test, feature = "test-utils"))]
    ChangesetMemory(MemorySink),
}

/// The configured backend/filter combinations.
pub enum Sink {
    Xml(XmlWriter),
    Pbf(PbfWriter),
    CurrentXml(HistoryFilter<XmlWriter>),
    CurrentPbf(HistoryFilter<PbfWriter>),
    ChangesetXml(ChangesetFilter<XmlWriter>),
    #[cfg(any(test, feature = "test-utils"))]
    Memory(MemorySink),
    #[cfg(any(test, feature = "test-utils"))]
    CurrentMemory(HistoryFilter<MemorySink>),
    #[cfg(any(test, feature = "test-utils"))]
    ChangesetMemory(ChangesetFilter<MemorySink>),
}

impl Sink {
    /// Builds the sink a spec describes. Called once extraction finished,
    /// because writers need the user map and the global maximum timestamp.
    pub fn build(
        spec: SinkSpec,
        config: &DumpConfig,
        users: Arc<UserStore>,
        max_time: Option<NaiveDateTime>,
    ) -> DumpResult<Self> {
        match spec {
            SinkSpec::Xml { path, current_only } => {
                let options = XmlOptions {
                    generator: config.generator.clone(),
                    history: !current_only,
                    changesets: false,
                    include_discussions: false,
                    coordinate_scale: config.writer.coordinate_scale,
                };
                let writer = XmlWriter::new(open_output(&path)?, users, options)?;
                if current_only {
                    Ok(Sink::CurrentXml(HistoryFilter::new(writer)))
                } else {
                    Ok(Sink::Xml(writer))
                }
            }
            SinkSpec::Pbf { path, current_only } => {
                let options = PbfOptions {
                    generator: config.generator.clone(),
                    history: !current_only,
                    dense_nodes: config.writer.dense_nodes,
                    max_time,
                };
                let writer = PbfWriter::new(open_output(&path)?, users, options)?;
                if current_only {
                    Ok(Sink::CurrentPbf(HistoryFilter::new(writer)))
                } else {
                    Ok(Sink::Pbf(writer))
                }
            }
            SinkSpec::ChangesetXml { path } => {
                let options = XmlOptions {
                    generator: config.generator.clone(),
                    history: false,
                    changesets: true,
                    include_discussions: config.writer.include_discussions,
                    coordinate_scale: config.writer.coordinate_scale,
                };
                let writer = XmlWriter::new(open_output(&path)?, users, options)?;
                Ok(Sink::ChangesetXml(ChangesetFilter::new(writer)))
            }
            #[cfg(any(test, feature = "test-utils"))]
            SinkSpec::Memory(sink) => Ok(Sink::Memory(sink)),
            #[cfg(any(test, feature = "test-utils"))]
            SinkSpec::CurrentMemory(sink) => Ok(Sink::CurrentMemory(HistoryFilter::new(sink))),
            #[cfg(any(test, feature = "test-utils"))]
            SinkSpec::ChangesetMemory(sink) => {
                Ok(Sink::ChangesetMemory(ChangesetFilter::new(sink)))
            }
        }
    }
}

/// Advances `index` over `items` and returns the contiguous range whose
/// key equals `key`. Entries below the key are skipped. Blocks deliver
/// child rows sorted and grouped per parent, so a single forward cursor
/// per child array suffices.
pub(crate) fn matching_range<'a, T>(
    items: &'a [T],
    index: &mut usize,
    key: (i64, i64),
    key_of: impl Fn(&T) -> (i64, i64),
) -> &'a [T] {
    while *index < items.len() && key_of(&items[*index]) < key {
        *index += 1;
    }
    let start = *index;
    while *index < items.len() && key_of(&items[*index]) == key {
        *index += 1;
    }
    &items[start..*index]
}

fn open_output(path: &PathBuf) -> DumpResult<Box<dyn std::io::Write + Send>> {
    let file = File::create(path)
        .map_err(|err| DumpError::writer(format!("output file {}", path.display()), err))?;
    Ok(Box::new(BufWriter::new(file)))
}

impl OutputSink for Sink {
    fn name(&self) -> &'static str {
        match self {
            Sink::Xml(sink) => sink.name(),
            Sink::Pbf(sink) => sink.name(),
            Sink::CurrentXml(sink) => sink.name(),
            Sink::CurrentPbf(sink) => sink.name(),
            Sink::ChangesetXml(sink) => sink.name(),
            #[cfg(any(test, feature = "test-utils"))]
            Sink::Memory(sink) => sink.name(),
            #[cfg(any(test, feature = "test-utils"))]
            Sink::CurrentMemory(sink) => sink.name(),
            #[cfg(any(test, feature = "test-utils"))]
            Sink::ChangesetMemory(sink) => sink.name(),
        }
    }

    async fn changesets(&mut self, block: Arc<ChangesetBlock>) -> DumpResult<()> {
        match self {
            Sink::Xml(sink) => sink.changesets(block).await,
            Sink::Pbf(sink) => sink.changesets(block).await,
            Sink::CurrentXml(sink) => sink.changesets(block).await,
            Sink::CurrentPbf(sink) => sink.changesets(block).await,
            Sink::ChangesetXml(sink) => sink.changesets(block).await,
            #[cfg(any(test, feature = "test-utils"))]
            Sink::Memory(sink) => sink.changesets(block).await,
            #[cfg(any(test, feature = "test-utils"))]
            Sink::CurrentMemory(sink) => sink.changesets(block).await,
            #[cfg(any(test, feature = "test-utils"))]
            Sink::ChangesetMemory(sink) => sink.changesets(block).await,
        }
    }

    async fn nodes(&mut self, block: Arc<NodeBlock>) -> DumpResult<()> {
        match self {
            Sink::Xml(sink) => sink.nodes(block).await,
            Sink::Pbf(sink) => sink.nodes(block).await,
            Sink::CurrentXml(sink) => sink.nodes(block).await,
            Sink::CurrentPbf(sink) => sink.nodes(block).await,
            Sink::ChangesetXml(sink) => sink.nodes(block).await,
            #[cfg(any(test, feature = "test-utils"))]
            Sink::Memory(sink) => sink.nodes(block).await,
            #[cfg(any(test, feature = "test-utils"))]
            Sink::CurrentMemory(sink) => sink.nodes(block).await,
            #[cfg(any(test, feature = "test-utils"))]
            Sink::ChangesetMemory(sink) => sink.nodes(block).await,
        }
    }

    async fn ways(&mut self, block: Arc<WayBlock>) -> DumpResult<()> {
        match self {
            Sink::Xml(sink) => sink.ways(block).await,
            Sink::Pbf(sink) => sink.ways(block).await,
            Sink::CurrentXml(sink) => sink.ways(block).await,
            Sink::CurrentPbf(sink) => sink.ways(block).await,
            Sink::ChangesetXml(sink) => sink.ways(block).await,
            #[cfg(any(test, feature = "test-utils"))]
            Sink::Memory(sink) => sink.ways(block).await,
            #[cfg(any(test, feature = "test-utils"))]
            Sink::CurrentMemory(sink) => sink.ways(block).await,
            #[cfg(any(test, feature = "test-utils"))]
            Sink::ChangesetMemory(sink) => sink.ways(block).await,
        }
    }

    async fn relations(&mut self, block: Arc<RelationBlock>) -> DumpResult<()> {
        match self {
            Sink::Xml(sink) => sink.relations(block).await,
            Sink::Pbf(sink) => sink.relations(block).await,
            Sink::CurrentXml(sink) => sink.relations(block).await,
            Sink::CurrentPbf(sink) => sink.relations(block).await,
            Sink::ChangesetXml(sink) => sink.relations(block).await,
            #[cfg(any(test, feature = "test-utils"))]
            Sink::Memory(sink) => sink.relations(block).await,
            #[cfg(any(test, feature = "test-utils"))]
            Sink::CurrentMemory(sink) => sink.relations(block).await,
            #[cfg(any(test, feature = "test-utils"))]
            Sink::ChangesetMemory(sink) => sink.relations(block).await,
        }
    }

    async fn finish(&mut self) -> DumpResult<()> {
        match self {
            Sink::Xml(sink) => sink.finish().await,
            Sink::Pbf(sink) => sink.finish().await,
            Sink::CurrentXml(sink) => sink.finish().await,
            Sink::CurrentPbf(sink) => sink.finish().await,
            Sink::ChangesetXml(sink) => sink.finish().await,
            #[cfg(any(test, feature = "test-utils"))]
            Sink::Memory(sink) => sink.finish().await,
            #[cfg(any(test, feature = "test-utils"))]
            Sink::CurrentMemory(sink) => sink.finish().await,
            #[cfg(any(test, feature = "test-utils"))]
            Sink::ChangesetMemory(sink) => sink.finish().await,
        }
    }
}

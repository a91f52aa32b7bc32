//! The top-level orchestrator.
//!
//! A dump run has two phases. Extraction decodes and sorts every table in
//! parallel and yields the global maximum timestamp. Emission then loads
//! the user map, builds the configured sinks and drives the four entity
//! passes strictly serially (changesets, nodes, ways, relations) so that
//! every writer observes the passes in output order, finishing with one
//! `finish` call per sink.

use std::sync::Arc;

use tokio::task;
use tracing::info;

use crate::config::DumpConfig;
use crate::error::{DumpError, DumpResult};
use crate::extract::{DumpSource, extract_all};
use crate::join::run_pass;
use crate::metrics::register_metrics;
use crate::records::codec::Codec;
use crate::sort::final_run_name;
use crate::types::{Changeset, Node, Relation, Way};
use crate::users::UserStore;
use crate::writer::{OutputSink, Sink, SinkSpec};

/// One dump conversion, from table streams to planet files.
pub struct PlanetDump<S> {
    config: Arc<DumpConfig>,
    source: Arc<S>,
}

impl<S: DumpSource> PlanetDump<S> {
    pub fn new(config: DumpConfig, source: S) -> DumpResult<Self> {
        config.validate()?;
        register_metrics();
        Ok(Self {
            config: Arc::new(config),
            source: Arc::new(source),
        })
    }

    /// Runs the whole conversion, producing every output the specs
    /// describe.
    pub async fn run(self, specs: Vec<SinkSpec>) -> DumpResult<()> {
        info!(
            data_dir = %self.config.data_dir.display(),
            resume = self.config.resume,
            num_outputs = specs.len(),
            "starting planet dump"
        );

        let max_time = extract_all(self.source.clone(), self.config.clone()).await?;
        info!(max_time = ?max_time, "extraction phase complete");

        let codec = Codec::new(self.config.epoch);
        let users_run = self.config.data_dir.join("users").join(final_run_name());
        let users = task::spawn_blocking(move || UserStore::load(&users_run, codec))
            .await
            .map_err(|err| DumpError::internal(err.to_string()))??;
        let users = Arc::new(users);

        let mut sinks = Vec::with_capacity(specs.len());
        for spec in specs {
            sinks.push(Sink::build(spec, &self.config, users.clone(), max_time)?);
        }

        let sinks = run_pass::<Changeset>(&self.config, users.clone(), sinks).await?;
        let sinks = run_pass::<Node>(&self.config, users.clone(), sinks).await?;
        let sinks = run_pass::<Way>(&self.config, users.clone(), sinks).await?;
        let mut sinks = run_pass::<Relation>(&self.config, users, sinks).await?;

        for sink in &mut sinks {
            sink.finish().await?;
        }

        info!("planet dump complete");
        Ok(())
    }
}

//! Configuration for a dump conversion run.
//!
//! All tunables are plain serde structs so they can be loaded from files or
//! environment layers by the embedding application. Every field has a
//! default; `validate` rejects combinations the engine cannot honor.

use std::path::PathBuf;

use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};

use crate::error::{DumpError, DumpResult};

/// Top-level configuration for a planet dump run.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct DumpConfig {
    /// Directory under which per-table sorted runs and sentinels are kept.
    pub data_dir: PathBuf,
    /// Maximum number of concurrently running sort/merge tasks, shared
    /// across all tables.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    /// Skip tables whose extraction already completed in a previous run.
    #[serde(default)]
    pub resume: bool,
    /// Generator string passed through to the output writers.
    #[serde(default = "default_generator")]
    pub generator: String,
    /// Epoch for the sorted-run timestamp encoding.
    #[serde(default = "default_epoch")]
    pub epoch: NaiveDateTime,
    #[serde(default)]
    pub sort: SortConfig,
    #[serde(default)]
    pub join: JoinConfig,
    #[serde(default)]
    pub writer: WriterConfig,
}

impl DumpConfig {
    /// Creates a configuration with all defaults rooted at `data_dir`.
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            max_concurrency: default_max_concurrency(),
            resume: false,
            generator: default_generator(),
            epoch: default_epoch(),
            sort: SortConfig::default(),
            join: JoinConfig::default(),
            writer: WriterConfig::default(),
        }
    }

    /// Validates the configuration.
    pub fn validate(&self) -> DumpResult<()> {
        if self.max_concurrency == 0 {
            return Err(DumpError::config(
                "max_concurrency",
                "must be greater than 0",
            ));
        }
        self.sort.validate()?;
        self.join.validate()?;
        Ok(())
    }
}

/// External-sorter tuning.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct SortConfig {
    /// Byte budget of one in-memory block, accounted with on-disk framing.
    #[serde(default = "default_max_block_bytes")]
    pub max_block_bytes: usize,
    /// How many runs of one level accumulate before they are merged.
    #[serde(default = "default_fanout")]
    pub fanout: usize,
}

impl SortConfig {
    /// Default byte budget of one in-memory sort block.
    pub const DEFAULT_MAX_BLOCK_BYTES: usize = 64 * 1024 * 1024;

    /// Default merge fan-in.
    pub const DEFAULT_FANOUT: usize = 16;

    /// Validates sorter settings.
    pub fn validate(&self) -> DumpResult<()> {
        if self.max_block_bytes == 0 {
            return Err(DumpError::config(
                "sort.max_block_bytes",
                "must be greater than 0",
            ));
        }
        if self.fanout < 2 {
            return Err(DumpError::config("sort.fanout", "must be at least 2"));
        }
        Ok(())
    }
}

impl Default for SortConfig {
    fn default() -> Self {
        Self {
            max_block_bytes: default_max_block_bytes(),
            fanout: default_fanout(),
        }
    }
}

/// Joiner fan-out tuning.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct JoinConfig {
    /// Block capacity for changeset, node and way passes.
    #[serde(default = "default_element_block_size")]
    pub element_block_size: usize,
    /// Block capacity for the relation pass. Relations carry large member
    /// lists, so their blocks are kept smaller.
    #[serde(default = "default_relation_block_size")]
    pub relation_block_size: usize,
}

impl JoinConfig {
    /// Default block capacity for changesets, nodes and ways.
    pub const DEFAULT_ELEMENT_BLOCK_SIZE: usize = 1 << 20;

    /// Default block capacity for relations.
    pub const DEFAULT_RELATION_BLOCK_SIZE: usize = 1 << 16;

    /// Validates joiner settings.
    pub fn validate(&self) -> DumpResult<()> {
        if self.element_block_size == 0 {
            return Err(DumpError::config(
                "join.element_block_size",
                "must be greater than 0",
            ));
        }
        if self.relation_block_size == 0 {
            return Err(DumpError::config(
                "join.relation_block_size",
                "must be greater than 0",
            ));
        }
        Ok(())
    }
}

impl Default for JoinConfig {
    fn default() -> Self {
        Self {
            element_block_size: default_element_block_size(),
            relation_block_size: default_relation_block_size(),
        }
    }
}

/// Options the output backends observe.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct WriterConfig {
    /// Emit PBF nodes as delta-encoded dense arrays.
    #[serde(default = "default_true")]
    pub dense_nodes: bool,
    /// Include changeset discussions in the changeset dump.
    #[serde(default)]
    pub include_discussions: bool,
    /// Divisor turning stored integer coordinates into degrees.
    #[serde(default = "default_coordinate_scale")]
    pub coordinate_scale: f64,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            dense_nodes: true,
            include_discussions: false,
            coordinate_scale: default_coordinate_scale(),
        }
    }
}

fn default_max_concurrency() -> usize {
    16
}

fn default_generator() -> String {
    concat!("planetdump ", env!("CARGO_PKG_VERSION")).to_string()
}

fn default_epoch() -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2004, 1, 1)
        .expect("valid epoch date")
        .and_hms_opt(0, 0, 0)
        .expect("valid epoch time")
}

fn default_max_block_bytes() -> usize {
    SortConfig::DEFAULT_MAX_BLOCK_BYTES
}

fn default_fanout() -> usize {
    SortConfig::DEFAULT_FANOUT
}

fn default_element_block_size() -> usize {
    JoinConfig::DEFAULT_ELEMENT_BLOCK_SIZE
}

fn default_relation_block_size() -> usize {
    JoinConfig::DEFAULT_RELATION_BLOCK_SIZE
}

fn default_coordinate_scale() -> f64 {
    1e7
}

fn default_true() -> bool {
    true
}

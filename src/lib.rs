pub mod config;
pub mod copy;
pub mod error;
pub mod extract;
pub mod filter;
pub mod join;
pub mod metrics;
pub mod pipeline;
pub mod records;
pub mod sort;
pub mod types;
pub mod users;
pub mod writer;

pub use crate::config::DumpConfig;
pub use crate::error::{DumpError, DumpResult, ErrorKind};
pub use crate::pipeline::PlanetDump;

//! On-disk external merge sort.
//!
//! Encoded `(key, value)` records are buffered up to a byte budget, sorted
//! and written as gzip-compressed runs, then hierarchically merged until a
//! single `final_00000000.data` run per table remains. Sorting and merging
//! run as background tasks bounded by a semaphore shared across all tables.

pub mod frame;
mod merge;
mod run;
mod sorter;

pub use run::{RunReader, RunWriter, TypedRunReader};
pub use sorter::ExternalSorter;

/// Prefix of the single run file remaining after [`ExternalSorter::finish`].
pub const FINAL_RUN_PREFIX: &str = "final";

/// File name of the collapsed final run of a table.
pub fn final_run_name() -> String {
    format!("{FINAL_RUN_PREFIX}_{:08x}.data", 0)
}

//! Sink decorators sitting between the joiner fan-out and a backend.

mod changeset;
mod history;

pub use changeset::ChangesetFilter;
pub use history::HistoryFilter;

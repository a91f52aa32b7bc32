//! Metric names recorded by the engine.
//!
//! The `metrics` facade is used throughout; installing a recorder is the
//! embedding application's concern.

use metrics::{describe_counter, describe_histogram};

/// Rows decoded from COPY streams, labelled by table.
pub const ROWS_EXTRACTED_TOTAL: &str = "planetdump_rows_extracted_total";

/// Sort blocks sealed and written, labelled by table.
pub const SORT_BLOCKS_TOTAL: &str = "planetdump_sort_blocks_total";

/// Wall time of one sort task (sort + compressed write), labelled by table.
pub const SORT_TASK_DURATION_SECONDS: &str = "planetdump_sort_task_duration_seconds";

/// Elements published to the writer fan-out, labelled by element type.
pub const ELEMENTS_EMITTED_TOTAL: &str = "planetdump_elements_emitted_total";

/// Wall time one block spent inside a writer call, labelled by element
/// type and sink.
pub const BLOCK_WRITE_DURATION_SECONDS: &str = "planetdump_block_write_duration_seconds";

pub const TABLE_LABEL: &str = "table";
pub const ELEMENT_LABEL: &str = "element";
pub const SINK_LABEL: &str = "sink";

/// Registers descriptions for every metric the engine emits.
pub fn register_metrics() {
    describe_counter!(
        ROWS_EXTRACTED_TOTAL,
        "Rows decoded from the table COPY streams"
    );
    describe_counter!(SORT_BLOCKS_TOTAL, "Sort blocks sealed and written to disk");
    describe_histogram!(
        SORT_TASK_DURATION_SECONDS,
        "Duration of one background sort task"
    );
    describe_counter!(
        ELEMENTS_EMITTED_TOTAL,
        "Elements published to the writer fan-out"
    );
    describe_histogram!(
        BLOCK_WRITE_DURATION_SECONDS,
        "Time one block spent inside a writer call"
    );
}

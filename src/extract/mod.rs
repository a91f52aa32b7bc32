//! The extraction phase: every table's COPY stream is decoded, encoded and
//! externally sorted into its final on-disk run.
//!
//! All tables run in parallel, one task per table, with sort/merge work
//! bounded by a semaphore shared across the whole phase. Each completed
//! table leaves a `.complete` sentinel carrying the maximum row timestamp;
//! with `resume` enabled a sentinel lets the table be skipped, while a run
//! directory without one is deleted and redone.

mod source;

pub use source::{DirectorySource, DumpSource};

#[cfg(any(test, feature = "test-utils"))]
pub use source::MemorySource;

use std::path::Path;
use std::sync::Arc;

use chrono::NaiveDateTime;
use metrics::counter;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info};

use crate::config::DumpConfig;
use crate::copy::{CopyTableReader, RowDecoder};
use crate::error::{DumpError, DumpResult};
use crate::metrics::{ROWS_EXTRACTED_TOTAL, TABLE_LABEL};
use crate::records::TableRecord;
use crate::records::codec::Codec;
use crate::sort::ExternalSorter;
use crate::types::{
    Changeset, ChangesetComment, ChangesetTag, ElementTag, Node, Relation, RelationMember, User,
    Way, WayNode,
};

/// Sentinel file marking a completed table extraction.
const SENTINEL: &str = ".complete";

/// Sentinel content for a table without any timestamped row.
const NO_TIMESTAMP: &str = "-infinity";

/// Timestamp format used inside sentinels.
const SENTINEL_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Every table expected in the dump, with the column projection its record
/// type consumes. The column lists follow each record's field order.
pub const TABLES: &[&str] = &[
    "users",
    "changesets",
    "changeset_tags",
    "changeset_comments",
    "nodes",
    "node_tags",
    "ways",
    "way_tags",
    "way_nodes",
    "relations",
    "relation_tags",
    "relation_members",
];

/// Extracts all tables in parallel and returns the maximum timestamp seen
/// across all of them.
pub async fn extract_all<S: DumpSource>(
    source: Arc<S>,
    config: Arc<DumpConfig>,
) -> DumpResult<Option<NaiveDateTime>> {
    let limiter = Arc::new(Semaphore::new(config.max_concurrency));
    let mut tasks = JoinSet::new();

    for &table in TABLES {
        let source = source.clone();
        let config = config.clone();
        let limiter = limiter.clone();
        tasks.spawn(async move { extract_table(&*source, table, &config, limiter).await });
    }

    let mut max_timestamp: Option<NaiveDateTime> = None;
    while let Some(result) = tasks.join_next().await {
        match result {
            Ok(Ok(timestamp)) => max_timestamp = max_timestamp.max(timestamp),
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

    Ok(max_timestamp)
}

/// Extracts one table, dispatching on its record type and column layout.
pub async fn extract_table<S: DumpSource>(
    source: &S,
    table: &'static str,
    config: &DumpConfig,
    limiter: Arc<Semaphore>,
) -> DumpResult<Option<NaiveDateTime>> {
    match table {
        "users" => {
            run_extraction::<User, S>(
                source,
                table,
                &["id", "display_name", "data_public", "status", "description_format"],
                config,
                limiter,
            )
            .await
        }
        "changesets" => {
            run_extraction::<Changeset, S>(
                source,
                table,
                &[
                    "id",
                    "user_id",
                    "created_at",
                    "min_lat",
                    "max_lat",
                    "min_lon",
                    "max_lon",
                    "closed_at",
                    "num_changes",
                ],
                config,
                limiter,
            )
            .await
        }
        "changeset_tags" => {
            run_extraction::<ChangesetTag, S>(
                source,
                table,
                &["changeset_id", "k", "v"],
                config,
                limiter,
            )
            .await
        }
        "changeset_comments" => {
            run_extraction::<ChangesetComment, S>(
                source,
                table,
                &["changeset_id", "created_at", "author_id", "body", "visible"],
                config,
                limiter,
            )
            .await
        }
        "nodes" => {
            run_extraction::<Node, S>(
                source,
                table,
                &[
                    "node_id",
                    "version",
                    "changeset_id",
                    "timestamp",
                    "visible",
                    "redaction_id",
                    "latitude",
                    "longitude",
                ],
                config,
                limiter,
            )
            .await
        }
        "node_tags" => {
            run_extraction::<ElementTag, S>(
                source,
                table,
                &["node_id", "version", "k", "v"],
                config,
                limiter,
            )
            .await
        }
        "ways" => {
            run_extraction::<Way, S>(
                source,
                table,
                &["way_id", "version", "changeset_id", "timestamp", "visible", "redaction_id"],
                config,
                limiter,
            )
            .await
        }
        "way_tags" => {
            run_extraction::<ElementTag, S>(
                source,
                table,
                &["way_id", "version", "k", "v"],
                config,
                limiter,
            )
            .await
        }
        "way_nodes" => {
            run_extraction::<WayNode, S>(
                source,
                table,
                &["way_id", "version", "sequence_id", "node_id"],
                config,
                limiter,
            )
            .await
        }
        "relations" => {
            run_extraction::<Relation, S>(
                source,
                table,
                &[
                    "relation_id",
                    "version",
                    "changeset_id",
                    "timestamp",
                    "visible",
                    "redaction_id",
                ],
                config,
                limiter,
            )
            .await
        }
        "relation_tags" => {
            run_extraction::<ElementTag, S>(
                source,
                table,
                &["relation_id", "version", "k", "v"],
                config,
                limiter,
            )
            .await
        }
        "relation_members" => {
            run_extraction::<RelationMember, S>(
                source,
                table,
                &[
                    "relation_id",
                    "version",
                    "sequence_id",
                    "member_type",
                    "member_id",
                    "member_role",
                ],
                config,
                limiter,
            )
            .await
        }
        other => Err(DumpError::internal(format!("unknown table: {other}"))),
    }
}

async fn run_extraction<R: TableRecord, S: DumpSource>(
    source: &S,
    table: &'static str,
    columns: &'static [&'static str],
    config: &DumpConfig,
    limiter: Arc<Semaphore>,
) -> DumpResult<Option<NaiveDateTime>> {
    let table_dir = config.data_dir.join(table);
    let sentinel = table_dir.join(SENTINEL);

    if table_dir.exists() {
        if config.resume && sentinel.exists() {
            let timestamp = read_sentinel(&sentinel, table)?;
            info!(table, "extraction already complete, skipping");
            return Ok(timestamp);
        }
        // A directory without a sentinel is a partial extraction.
        std::fs::remove_dir_all(&table_dir)
            .map_err(|err| DumpError::sort_run_io(table, err))?;
        debug!(table, "removed partial extraction");
    }
    std::fs::create_dir_all(&table_dir).map_err(|err| DumpError::sort_run_io(table, err))?;

    let stream = source.open_table(table).await?;
    let mut reader = CopyTableReader::new(table, stream);
    let header = reader.read_header().await?;
    let decoder = RowDecoder::new(table, &header.columns, columns)?;

    let codec = Codec::new(config.epoch);
    let mut sorter = ExternalSorter::new(table, &table_dir, config.sort, limiter);
    let mut max_timestamp: Option<NaiveDateTime> = None;
    let mut rows: u64 = 0;

    while let Some(line) = reader.next_row().await? {
        rows += 1;
        let projected = decoder.project(line, rows)?;
        let record = R::from_row(&projected)?;
        max_timestamp = max_timestamp.max(record.timestamp());

        let mut key = Vec::new();
        let mut value = Vec::new();
        record.encode(&codec, &mut key, &mut value);
        sorter.put(key, value).await?;
    }

    sorter.finish().await?;
    write_sentinel(&sentinel, table, max_timestamp).await?;

    counter!(ROWS_EXTRACTED_TOTAL, TABLE_LABEL => table).increment(rows);
    info!(table, rows, "table extracted");
    Ok(max_timestamp)
}

fn read_sentinel(path: &Path, table: &str) -> DumpResult<Option<NaiveDateTime>> {
    let contents =
        std::fs::read_to_string(path).map_err(|err| DumpError::sort_run_io(table, err))?;
    let contents = contents.trim();
    if contents == NO_TIMESTAMP {
        return Ok(None);
    }
    NaiveDateTime::parse_from_str(contents, SENTINEL_FORMAT)
        .map(Some)
        .map_err(|err| {
            DumpError::internal(format!(
                "unreadable completion sentinel for table '{table}': {err}"
            ))
        })
}

async fn write_sentinel(
    path: &Path,
    table: &str,
    timestamp: Option<NaiveDateTime>,
) -> DumpResult<()> {
    let contents = match timestamp {
        Some(timestamp) => format!("{}\n", timestamp.format(SENTINEL_FORMAT)),
        None => format!("{NO_TIMESTAMP}\n"),
    };
    tokio::fs::write(path, contents)
        .await
        .map_err(|err| DumpError::sort_run_io(table, err))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sort::{TypedRunReader, final_run_name};
    use tempfile::TempDir;

    fn config(dir: &Path) -> DumpConfig {
        DumpConfig::new(dir)
    }

    fn source_with(table: &str, body: &str) -> MemorySource {
        let mut source = MemorySource::new();
        source.insert(table, body.as_bytes().to_vec());
        source
    }

    #[tokio::test]
    async fn extracts_and_sorts_a_table() {
        let dir = TempDir::new().unwrap();
        let config = config(dir.path());
        // Tags arrive out of order; the run must come back sorted.
        let source = source_with(
            "node_tags",
            "COPY node_tags (node_id, version, k, v) FROM stdin;\n\
             2\t1\thighway\tresidential\n\
             1\t1\tamenity\tcafe\n\
             \\.\n",
        );

        let limiter = Arc::new(Semaphore::new(2));
        let timestamp = extract_table(&source, "node_tags", &config, limiter)
            .await
            .unwrap();
        assert_eq!(timestamp, None);

        let run = dir.path().join("node_tags").join(final_run_name());
        let mut reader =
            TypedRunReader::<ElementTag>::open("node_tags", &run, Codec::new(config.epoch))
                .unwrap();
        let first = reader.next_record().unwrap().unwrap();
        assert_eq!(first.element_id, 1);
        assert_eq!(first.key, "amenity");
        let second = reader.next_record().unwrap().unwrap();
        assert_eq!(second.element_id, 2);
        assert!(reader.next_record().unwrap().is_none());

        let sentinel = std::fs::read_to_string(dir.path().join("node_tags").join(SENTINEL))
            .unwrap();
        assert_eq!(sentinel.trim(), "-infinity");
    }

    #[tokio::test]
    async fn sentinel_records_max_timestamp() {
        let dir = TempDir::new().unwrap();
        let config = config(dir.path());
        let source = source_with(
            "nodes",
            "COPY nodes (node_id, latitude, longitude, changeset_id, visible, \"timestamp\", tile, version, redaction_id) FROM stdin;\n\
             1\t515000000\t-1230000\t10\tt\t2020-01-01 00:00:00\t0\t1\t\\N\n\
             2\t0\t0\t11\tt\t2021-06-01 12:30:00\t0\t1\t\\N\n\
             \\.\n",
        );

        let limiter = Arc::new(Semaphore::new(2));
        let timestamp = extract_table(&source, "nodes", &config, limiter)
            .await
            .unwrap();
        assert_eq!(
            timestamp.unwrap().to_string(),
            "2021-06-01 12:30:00".to_string()
        );

        let sentinel =
            std::fs::read_to_string(dir.path().join("nodes").join(SENTINEL)).unwrap();
        assert_eq!(sentinel.trim(), "2021-06-01 12:30:00");
    }

    #[tokio::test]
    async fn resume_skips_completed_tables() {
        let dir = TempDir::new().unwrap();
        let mut config = config(dir.path());
        config.resume = true;

        let table_dir = dir.path().join("node_tags");
        std::fs::create_dir_all(&table_dir).unwrap();
        std::fs::write(table_dir.join(SENTINEL), "2020-05-05 00:00:00\n").unwrap();

        // No source data for the table at all: reaching the source would
        // fail, proving the table was skipped.
        let source = MemorySource::new();
        let limiter = Arc::new(Semaphore::new(1));
        let timestamp = extract_table(&source, "node_tags", &config, limiter)
            .await
            .unwrap();
        assert_eq!(timestamp.unwrap().to_string(), "2020-05-05 00:00:00");
    }

    #[tokio::test]
    async fn partial_extraction_is_redone() {
        let dir = TempDir::new().unwrap();
        let mut config = config(dir.path());
        config.resume = true;

        let table_dir = dir.path().join("node_tags");
        std::fs::create_dir_all(&table_dir).unwrap();
        std::fs::write(table_dir.join("l0_00000000.data"), b"stale").unwrap();

        let source = source_with(
            "node_tags",
            "COPY node_tags (node_id, version, k, v) FROM stdin;\n\\.\n",
        );
        let limiter = Arc::new(Semaphore::new(1));
        extract_table(&source, "node_tags", &config, limiter)
            .await
            .unwrap();

        assert!(table_dir.join(SENTINEL).exists());
        assert!(!table_dir.join("l0_00000000.data").exists());
        assert!(table_dir.join(final_run_name()).exists());
    }

    #[tokio::test]
    async fn decode_errors_identify_field_and_line() {
        let dir = TempDir::new().unwrap();
        let config = config(dir.path());
        let source = source_with(
            "node_tags",
            "COPY node_tags (node_id, version, k, v) FROM stdin;\n\
             1\t1\ta\tb\n\
             oops\t1\ta\tb\n\
             \\.\n",
        );

        let limiter = Arc::new(Semaphore::new(1));
        let err = extract_table(&source, "node_tags", &config, limiter)
            .await
            .unwrap_err();
        match err.kind() {
            crate::error::ErrorKind::RowDecode { line, field, value, .. } => {
                assert_eq!(*line, 2);
                assert_eq!(*field, 0);
                assert_eq!(value, "oops");
            }
            other => panic!("unexpected kind: {other:?}"),
        }
    }
}

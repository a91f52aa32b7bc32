use std::path::Path;

use crate::error::DumpResult;
use crate::join::ChildRecord;
use crate::records::codec::Codec;
use crate::sort::{TypedRunReader, final_run_name};

/// Monotonic cursor over one child table's sorted run.
///
/// Holds the current not-yet-consumed child row. `collect_matching`
/// advances while the child key is at or below the parent key, appending
/// exact matches; rows below the parent key belong to filtered or
/// non-existent parents and are silently dropped.
pub struct ChildCursor<C> {
    reader: Option<TypedRunReader<C>>,
    current: Option<C>,
}

impl<C: ChildRecord> ChildCursor<C> {
    /// Opens the cursor. `None` stands for an absent child stream, whose
    /// cursor never yields anything.
    pub fn open(table: Option<&'static str>, data_dir: &Path, codec: Codec) -> DumpResult<Self> {
        let Some(table) = table else {
            return Ok(Self {
                reader: None,
                current: None,
            });
        };

        let path = data_dir.join(table).join(final_run_name());
        let mut reader = TypedRunReader::open(table, &path, codec)?;
        let current = reader.next_record()?;
        Ok(Self {
            reader: Some(reader),
            current,
        })
    }

    /// Appends every child row whose key equals `key`, leaving the cursor
    /// at the first row with a larger key.
    pub fn collect_matching(&mut self, key: (i64, i64), out: &mut Vec<C>) -> DumpResult<()> {
        let Some(reader) = self.reader.as_mut() else {
            return Ok(());
        };

        while let Some(current) = self.current.as_ref() {
            let child_key = current.join_key();
            if child_key > key {
                break;
            }
            let row = self.current.take().expect("current checked above");
            if child_key == key {
                out.push(row);
            }
            self.current = reader.next_record()?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::TableRecord;
    use crate::sort::RunWriter;
    use crate::types::ElementTag;
    use chrono::NaiveDate;
    use tempfile::TempDir;

    fn codec() -> Codec {
        Codec::new(
            NaiveDate::from_ymd_opt(2004, 1, 1)
                .unwrap()
                .and_hms_opt(0, 0, 0)
                .unwrap(),
        )
    }

    fn tag(element_id: i64, version: i64, key: &str) -> ElementTag {
        ElementTag {
            element_id,
            version,
            key: key.to_string(),
            value: "v".to_string(),
        }
    }

    fn write_tags(dir: &Path, tags: &[ElementTag]) {
        let table_dir = dir.join("node_tags");
        std::fs::create_dir_all(&table_dir).unwrap();
        let mut writer = RunWriter::create(&table_dir.join(final_run_name())).unwrap();
        let codec = codec();
        for tag in tags {
            let mut key = Vec::new();
            let mut value = Vec::new();
            tag.encode(&codec, &mut key, &mut value);
            writer.write(&key, &value).unwrap();
        }
        writer.finish().unwrap();
    }

    #[test]
    fn collects_exact_matches_and_drops_orphans() {
        let dir = TempDir::new().unwrap();
        write_tags(
            dir.path(),
            &[
                tag(1, 1, "a"),
                tag(2, 1, "orphan"),
                tag(3, 1, "b"),
                tag(3, 1, "c"),
                tag(3, 2, "d"),
            ],
        );

        let mut cursor =
            ChildCursor::<ElementTag>::open(Some("node_tags"), dir.path(), codec()).unwrap();

        let mut out = Vec::new();
        cursor.collect_matching((1, 1), &mut out).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].key, "a");

        // Jumping to (3, 1) silently discards the row for element 2.
        out.clear();
        cursor.collect_matching((3, 1), &mut out).unwrap();
        let keys: Vec<&str> = out.iter().map(|t| t.key.as_str()).collect();
        assert_eq!(keys, vec!["b", "c"]);

        out.clear();
        cursor.collect_matching((3, 2), &mut out).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].key, "d");

        // Past the end of the stream nothing more matches.
        out.clear();
        cursor.collect_matching((9, 9), &mut out).unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn absent_stream_yields_nothing() {
        let dir = TempDir::new().unwrap();
        let mut cursor =
            ChildCursor::<crate::records::NoRecord>::open(None, dir.path(), codec()).unwrap();
        let mut out = Vec::new();
        cursor.collect_matching((1, 1), &mut out).unwrap();
        assert!(out.is_empty());
    }
}

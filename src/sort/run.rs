use std::fs::File;
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;

use crate::error::{DumpError, DumpResult};
use crate::records::TableRecord;
use crate::records::codec::Codec;
use crate::sort::frame;

/// Writes framed records into a gzip-compressed run file.
///
/// Compression level 1: run files are written once and read once, so
/// throughput wins over ratio.
pub struct RunWriter {
    encoder: GzEncoder<BufWriter<File>>,
}

impl RunWriter {
    pub fn create(path: &Path) -> io::Result<Self> {
        let file = File::create(path)?;
        Ok(Self {
            encoder: GzEncoder::new(BufWriter::new(file), Compression::fast()),
        })
    }

    pub fn write(&mut self, key: &[u8], value: &[u8]) -> io::Result<()> {
        frame::write_frame(&mut self.encoder, key, value)
    }

    pub fn finish(self) -> io::Result<()> {
        self.encoder.finish()?.flush()
    }
}

/// Streams framed records back out of a run file.
pub struct RunReader {
    decoder: BufReader<GzDecoder<BufReader<File>>>,
    path: PathBuf,
}

impl RunReader {
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = File::open(path)?;
        Ok(Self {
            decoder: BufReader::new(GzDecoder::new(BufReader::new(file))),
            path: path.to_path_buf(),
        })
    }

    /// Reads the next record into the buffers; false at end of stream.
    pub fn next(&mut self, key: &mut Vec<u8>, value: &mut Vec<u8>) -> io::Result<bool> {
        frame::read_frame(&mut self.decoder, key, value)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Reads a sorted run back as typed records, in key order.
pub struct TypedRunReader<T> {
    inner: RunReader,
    table: String,
    codec: Codec,
    key: Vec<u8>,
    value: Vec<u8>,
    _record: std::marker::PhantomData<T>,
}

impl<T: TableRecord> TypedRunReader<T> {
    pub fn open(table: impl Into<String>, path: &Path, codec: Codec) -> DumpResult<Self> {
        let table = table.into();
        let inner =
            RunReader::open(path).map_err(|err| DumpError::sort_run_io(&table, err))?;
        Ok(Self {
            inner,
            table,
            codec,
            key: Vec::new(),
            value: Vec::new(),
            _record: std::marker::PhantomData,
        })
    }

    /// Decodes the next record, or `None` at end of stream.
    pub fn next_record(&mut self) -> DumpResult<Option<T>> {
        let more = self
            .inner
            .next(&mut self.key, &mut self.value)
            .map_err(|err| DumpError::sort_run_io(&self.table, err))?;
        if !more {
            return Ok(None);
        }

        T::decode(&self.codec, &self.key, &self.value)
            .map(Some)
            .map_err(|err| {
                DumpError::run_corrupt(self.inner.path().display().to_string(), err.to_string())
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
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

    #[test]
    fn raw_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("run.data");

        let mut writer = RunWriter::create(&path).unwrap();
        for i in 0..1000u32 {
            writer
                .write(&i.to_be_bytes(), format!("value-{i}").as_bytes())
                .unwrap();
        }
        writer.finish().unwrap();

        let mut reader = RunReader::open(&path).unwrap();
        let mut key = Vec::new();
        let mut value = Vec::new();
        for i in 0..1000u32 {
            assert!(reader.next(&mut key, &mut value).unwrap());
            assert_eq!(key, i.to_be_bytes());
            assert_eq!(value, format!("value-{i}").as_bytes());
        }
        assert!(!reader.next(&mut key, &mut value).unwrap());
    }

    #[test]
    fn empty_run_yields_no_records() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("empty.data");
        RunWriter::create(&path).unwrap().finish().unwrap();

        let mut reader = TypedRunReader::<ElementTag>::open("node_tags", &path, codec()).unwrap();
        assert!(reader.next_record().unwrap().is_none());
    }

    #[test]
    fn typed_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("tags.data");
        let codec = codec();

        let tags = vec![
            ElementTag {
                element_id: 1,
                version: 1,
                key: "amenity".to_string(),
                value: "cafe".to_string(),
            },
            ElementTag {
                element_id: 2,
                version: 1,
                key: "highway".to_string(),
                value: "residential".to_string(),
            },
        ];

        let mut writer = RunWriter::create(&path).unwrap();
        for tag in &tags {
            let mut key = Vec::new();
            let mut value = Vec::new();
            tag.encode(&codec, &mut key, &mut value);
            writer.write(&key, &value).unwrap();
        }
        writer.finish().unwrap();

        let mut reader = TypedRunReader::<ElementTag>::open("node_tags", &path, codec).unwrap();
        assert_eq!(reader.next_record().unwrap().as_ref(), Some(&tags[0]));
        assert_eq!(reader.next_record().unwrap().as_ref(), Some(&tags[1]));
        assert!(reader.next_record().unwrap().is_none());
    }
}

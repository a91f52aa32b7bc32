use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{DumpError, DumpResult};
use crate::sort::run::{RunReader, RunWriter};

/// One record currently at the head of an input run.
///
/// Ordered by key bytes, ties broken by input index so that merging is
/// stable with respect to input order.
struct HeapEntry {
    key: Vec<u8>,
    value: Vec<u8>,
    index: usize,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key && self.index == other.index
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key
            .cmp(&other.key)
            .then_with(|| self.index.cmp(&other.index))
    }
}

/// K-way merges sorted runs into `output` and deletes the inputs.
pub fn merge_runs(table: &str, inputs: &[PathBuf], output: &Path) -> DumpResult<()> {
    let io_err = |err| DumpError::merge_io(table, err);

    let mut readers = Vec::with_capacity(inputs.len());
    for input in inputs {
        readers.push(RunReader::open(input).map_err(io_err)?);
    }

    let mut heap: BinaryHeap<Reverse<HeapEntry>> = BinaryHeap::with_capacity(readers.len());
    for (index, reader) in readers.iter_mut().enumerate() {
        if let Some(entry) = pull(table, reader, index)? {
            heap.push(Reverse(entry));
        }
    }

    let mut writer = RunWriter::create(output).map_err(io_err)?;
    while let Some(Reverse(entry)) = heap.pop() {
        writer.write(&entry.key, &entry.value).map_err(io_err)?;
        if let Some(next) = pull(table, &mut readers[entry.index], entry.index)? {
            heap.push(Reverse(next));
        }
    }
    writer.finish().map_err(io_err)?;

    for input in inputs {
        fs::remove_file(input).map_err(io_err)?;
    }

    Ok(())
}

fn pull(table: &str, reader: &mut RunReader, index: usize) -> DumpResult<Option<HeapEntry>> {
    let mut key = Vec::new();
    let mut value = Vec::new();
    if reader
        .next(&mut key, &mut value)
        .map_err(|err| DumpError::merge_io(table, err))?
    {
        Ok(Some(HeapEntry { key, value, index }))
    } else {
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_run(path: &Path, records: &[(&[u8], &[u8])]) {
        let mut writer = RunWriter::create(path).unwrap();
        for (key, value) in records {
            writer.write(key, value).unwrap();
        }
        writer.finish().unwrap();
    }

    fn read_all(path: &Path) -> Vec<(Vec<u8>, Vec<u8>)> {
        let mut reader = RunReader::open(path).unwrap();
        let mut out = Vec::new();
        let mut key = Vec::new();
        let mut value = Vec::new();
        while reader.next(&mut key, &mut value).unwrap() {
            out.push((key.clone(), value.clone()));
        }
        out
    }

    #[test]
    fn merges_in_key_order_and_deletes_inputs() {
        let dir = TempDir::new().unwrap();
        let a = dir.path().join("a.data");
        let b = dir.path().join("b.data");
        let out = dir.path().join("merged.data");

        write_run(&a, &[(b"a", b"1"), (b"c", b"3"), (b"e", b"5")]);
        write_run(&b, &[(b"b", b"2"), (b"d", b"4")]);

        merge_runs("t", &[a.clone(), b.clone()], &out).unwrap();

        let merged = read_all(&out);
        let keys: Vec<&[u8]> = merged.iter().map(|(k, _)| k.as_slice()).collect();
        assert_eq!(keys, vec![b"a", b"b", b"c", b"d", b"e"]);
        assert!(!a.exists());
        assert!(!b.exists());
    }

    #[test]
    fn equal_keys_keep_input_order() {
        let dir = TempDir::new().unwrap();
        let a = dir.path().join("a.data");
        let b = dir.path().join("b.data");
        let out = dir.path().join("merged.data");

        write_run(&a, &[(b"k", b"first")]);
        write_run(&b, &[(b"k", b"second")]);

        merge_runs("t", &[a, b], &out).unwrap();

        let merged = read_all(&out);
        assert_eq!(merged[0].1, b"first");
        assert_eq!(merged[1].1, b"second");
    }

    #[test]
    fn merging_empty_runs_produces_an_empty_run() {
        let dir = TempDir::new().unwrap();
        let a = dir.path().join("a.data");
        let out = dir.path().join("merged.data");
        write_run(&a, &[]);

        merge_runs("t", &[a], &out).unwrap();
        assert!(read_all(&out).is_empty());
    }
}

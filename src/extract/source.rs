use std::path::PathBuf;

use tokio::io::AsyncRead;

use crate::error::{DumpError, DumpResult};

/// Provider of per-table COPY text streams.
///
/// The engine asks for one stream per table. How the bytes are produced,
/// usually by running the database restore tool against the dump archive,
/// is the embedder's concern.
pub trait DumpSource: Send + Sync + 'static {
    type Stream: AsyncRead + Send + Unpin + 'static;

    fn open_table(
        &self,
        table: &str,
    ) -> impl Future<Output = DumpResult<Self::Stream>> + Send;
}

/// A [`DumpSource`] reading one `<table>.sql` file per table from a
/// directory, as produced by restoring each table to a file beforehand.
#[derive(Debug, Clone)]
pub struct DirectorySource {
    root: PathBuf,
}

impl DirectorySource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl DumpSource for DirectorySource {
    type Stream = tokio::fs::File;

    async fn open_table(&self, table: &str) -> DumpResult<Self::Stream> {
        let path = self.root.join(format!("{table}.sql"));
        tokio::fs::File::open(&path)
            .await
            .map_err(|err| DumpError::source_open(table, err))
    }
}

/// An in-memory [`DumpSource`] for tests.
#[cfg(any(test, feature = "test-utils"))]
#[derive(Debug, Clone, Default)]
pub struct MemorySource {
    tables: std::collections::HashMap<String, Vec<u8>>,
}

#[cfg(any(test, feature = "test-utils"))]
impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, table: impl Into<String>, bytes: impl Into<Vec<u8>>) {
        self.tables.insert(table.into(), bytes.into());
    }
}

#[cfg(any(test, feature = "test-utils"))]
impl DumpSource for MemorySource {
    type Stream = std::io::Cursor<Vec<u8>>;

    async fn open_table(&self, table: &str) -> DumpResult<Self::Stream> {
        self.tables
            .get(table)
            .cloned()
            .map(std::io::Cursor::new)
            .ok_or_else(|| DumpError::source_open(table, "table not present in source"))
    }
}

use std::{error, fmt, result};

/// Type alias for convenience when using the Result type with our Error.
pub type DumpResult<T> = result::Result<T, DumpError>;

/// Internal error representation with kind and optional source error.
///
/// Uses boxing to keep the public error type size consistent and enable
/// rich error context without penalizing the success path.
struct ErrorInner {
    kind: ErrorKind,
    source: Option<Box<dyn error::Error + Send + Sync>>,
}

/// Error classification for the dump conversion.
///
/// Each variant corresponds to one stage of the extract-sort-join-emit
/// pipeline, carrying enough structured context to identify the failing
/// table or file in a single diagnostic line.
#[derive(Debug, Clone, PartialEq)]
#[non_exhaustive]
pub enum ErrorKind {
    /// The table byte stream could not be opened.
    SourceOpen { table: String },
    /// Reading from the table byte stream failed.
    SourceRead { table: String },
    /// A `COPY ... FROM stdin;` header did not match the expected grammar.
    CopyHeaderParse { table: String, line: String },
    /// End of input before a COPY header, or between header and terminator.
    EarlyTermination { table: String },
    /// A required column is absent from the declared COPY column list.
    ColumnMissing { table: String, column: String },
    /// A field of a data row could not be parsed.
    RowDecode {
        table: String,
        line: u64,
        field: usize,
        value: String,
    },
    /// Read or write failure on a sorted-run file.
    SortRunIo { table: String },
    /// Read or write failure inside a merge task.
    MergeIo { table: String },
    /// A sorted-run file contained a malformed record.
    RunCorrupt { path: String },
    /// An output backend failed; the inner error is surfaced verbatim.
    WriterError { writer: String },
    /// Configuration parsing or validation failure.
    ConfigInvalid { parameter: String, reason: String },
    /// Invariant violation inside the engine; treated as fatal.
    Internal { description: String },
}

pub struct DumpError(Box<ErrorInner>);

impl DumpError {
    /// Creates a new error with the specified kind.
    pub fn new(kind: ErrorKind) -> Self {
        DumpError(Box::new(ErrorInner { kind, source: None }))
    }

    /// Creates a new error with the specified kind and source error.
    pub fn with_source<E>(kind: ErrorKind, source: E) -> Self
    where
        E: Into<Box<dyn error::Error + Send + Sync>>,
    {
        DumpError(Box::new(ErrorInner {
            kind,
            source: Some(source.into()),
        }))
    }

    pub fn source_open<E>(table: impl Into<String>, source: E) -> Self
    where
        E: Into<Box<dyn error::Error + Send + Sync>>,
    {
        Self::with_source(
            ErrorKind::SourceOpen {
                table: table.into(),
            },
            source,
        )
    }

    pub fn source_read<E>(table: impl Into<String>, source: E) -> Self
    where
        E: Into<Box<dyn error::Error + Send + Sync>>,
    {
        Self::with_source(
            ErrorKind::SourceRead {
                table: table.into(),
            },
            source,
        )
    }

    pub fn copy_header(table: impl Into<String>, line: impl Into<String>) -> Self {
        Self::new(ErrorKind::CopyHeaderParse {
            table: table.into(),
            line: line.into(),
        })
    }

    pub fn early_termination(table: impl Into<String>) -> Self {
        Self::new(ErrorKind::EarlyTermination {
            table: table.into(),
        })
    }

    pub fn column_missing(table: impl Into<String>, column: impl Into<String>) -> Self {
        Self::new(ErrorKind::ColumnMissing {
            table: table.into(),
            column: column.into(),
        })
    }

    pub fn row_decode(
        table: impl Into<String>,
        line: u64,
        field: usize,
        value: impl Into<String>,
    ) -> Self {
        Self::new(ErrorKind::RowDecode {
            table: table.into(),
            line,
            field,
            value: value.into(),
        })
    }

    pub fn sort_run_io<E>(table: impl Into<String>, source: E) -> Self
    where
        E: Into<Box<dyn error::Error + Send + Sync>>,
    {
        Self::with_source(
            ErrorKind::SortRunIo {
                table: table.into(),
            },
            source,
        )
    }

    pub fn merge_io<E>(table: impl Into<String>, source: E) -> Self
    where
        E: Into<Box<dyn error::Error + Send + Sync>>,
    {
        Self::with_source(
            ErrorKind::MergeIo {
                table: table.into(),
            },
            source,
        )
    }

    pub fn run_corrupt(path: impl Into<String>, description: impl Into<String>) -> Self {
        Self::with_source(ErrorKind::RunCorrupt { path: path.into() }, description.into())
    }

    pub fn writer<E>(writer: impl Into<String>, source: E) -> Self
    where
        E: Into<Box<dyn error::Error + Send + Sync>>,
    {
        Self::with_source(
            ErrorKind::WriterError {
                writer: writer.into(),
            },
            source,
        )
    }

    pub fn config(parameter: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::new(ErrorKind::ConfigInvalid {
            parameter: parameter.into(),
            reason: reason.into(),
        })
    }

    pub fn internal(description: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal {
            description: description.into(),
        })
    }

    /// Returns the error kind.
    pub fn kind(&self) -> &ErrorKind {
        &self.0.kind
    }
}

impl fmt::Debug for DumpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DumpError")
            .field("kind", &self.0.kind)
            .field("source", &self.0.source)
            .finish()
    }
}

impl fmt::Display for DumpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use ErrorKind::*;

        match &self.0.kind {
            SourceOpen { table } => {
                write!(f, "failed to open the dump stream for table '{table}'")
            }
            SourceRead { table } => {
                write!(f, "failed to read the dump stream for table '{table}'")
            }
            CopyHeaderParse { table, line } => {
                write!(f, "malformed COPY header in table '{table}': `{line}`")
            }
            EarlyTermination { table } => {
                write!(f, "dump stream for table '{table}' ended prematurely")
            }
            ColumnMissing { table, column } => {
                write!(
                    f,
                    "column '{column}' not declared in the COPY header of table '{table}'"
                )
            }
            RowDecode {
                table,
                line,
                field,
                value,
            } => {
                write!(
                    f,
                    "failed to decode field {field} of table '{table}' at line {line}: `{value}`"
                )
            }
            SortRunIo { table } => {
                write!(f, "sorted-run i/o failed for table '{table}'")
            }
            MergeIo { table } => {
                write!(f, "merge of sorted runs failed for table '{table}'")
            }
            RunCorrupt { path } => {
                write!(f, "sorted-run file '{path}' is corrupt")
            }
            WriterError { writer } => {
                write!(f, "{writer} writer failed")
            }
            ConfigInvalid { parameter, reason } => {
                write!(f, "configuration error for parameter '{parameter}': {reason}")
            }
            Internal { description } => {
                write!(f, "internal error: {description}")
            }
        }?;

        if let Some(source) = &self.0.source {
            write!(f, ": {source}")?;
        }

        Ok(())
    }
}

impl error::Error for DumpError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        self.0
            .source
            .as_ref()
            .map(|source| source.as_ref() as &(dyn error::Error + 'static))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_table_and_source_chain() {
        let io = std::io::Error::other("disk full");
        let err = DumpError::sort_run_io("nodes", io);
        let rendered = err.to_string();
        assert!(rendered.contains("nodes"));
        assert!(rendered.contains("disk full"));
    }

    #[test]
    fn kind_is_inspectable() {
        let err = DumpError::row_decode("ways", 7, 2, "xyz");
        assert_eq!(
            err.kind(),
            &ErrorKind::RowDecode {
                table: "ways".to_string(),
                line: 7,
                field: 2,
                value: "xyz".to_string(),
            }
        );
    }
}

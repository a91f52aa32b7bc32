use tokio::io::AsyncRead;

use crate::copy::header::CopyHeader;
use crate::copy::lines::LineReader;
use crate::error::{DumpError, DumpResult};

/// End-of-data marker of the COPY text protocol.
const COPY_TERMINATOR: &[u8] = b"\\.";

/// Prefix that identifies a COPY header line.
const COPY_PREFIX: &[u8] = b"COPY ";

/// Drives the COPY protocol state machine over a table's byte stream.
///
/// Lines before the first `COPY` header are discarded (the restore tool
/// emits SET statements and comments around the payload). After the header
/// every line is a data row until the `\.` terminator. End of input in
/// either of those states is an [`crate::error::ErrorKind::EarlyTermination`].
pub struct CopyTableReader<R> {
    lines: LineReader<R>,
    table: String,
    header: Option<CopyHeader>,
    finished: bool,
    data_lines: u64,
}

impl<R: AsyncRead + Unpin> CopyTableReader<R> {
    pub fn new(table: impl Into<String>, source: R) -> Self {
        Self {
            lines: LineReader::new(source),
            table: table.into(),
            header: None,
            finished: false,
            data_lines: 0,
        }
    }

    /// Scans forward to the COPY header and parses its column list.
    pub async fn read_header(&mut self) -> DumpResult<&CopyHeader> {
        if self.header.is_none() {
            loop {
                let line = self
                    .lines
                    .next_line()
                    .await
                    .map_err(|err| DumpError::source_read(&self.table, err))?;
                let Some(line) = line else {
                    return Err(DumpError::early_termination(&self.table));
                };
                if !line.starts_with(COPY_PREFIX) {
                    continue;
                }

                let text = std::str::from_utf8(line)
                    .map_err(|_| DumpError::copy_header(&self.table, String::from_utf8_lossy(line)))?;
                self.header = Some(CopyHeader::parse(&self.table, text)?);
                break;
            }
        }

        Ok(self.header.as_ref().expect("header parsed above"))
    }

    /// Returns the next data row, or `None` once the terminator was seen.
    ///
    /// Must be called after [`CopyTableReader::read_header`]. The returned
    /// slice stays valid until the next call.
    pub async fn next_row(&mut self) -> DumpResult<Option<&[u8]>> {
        if self.finished {
            return Ok(None);
        }
        if self.header.is_none() {
            return Err(DumpError::internal(
                "next_row called before the COPY header was read",
            ));
        }

        let line = self
            .lines
            .next_line()
            .await
            .map_err(|err| DumpError::source_read(&self.table, err))?;
        let Some(line) = line else {
            return Err(DumpError::early_termination(&self.table));
        };

        if line == COPY_TERMINATOR {
            self.finished = true;
            return Ok(None);
        }

        self.data_lines += 1;
        Ok(Some(line))
    }

    /// Number of data rows yielded so far; doubles as the 1-based line
    /// number of the row most recently returned.
    pub fn line_number(&self) -> u64 {
        self.data_lines
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const STREAM: &[u8] = b"--\n-- PostgreSQL database dump\n--\nSET client_encoding = 'UTF8';\n\nCOPY nodes (node_id, version) FROM stdin;\n1\t1\n2\t1\n\\.\n\nCOPY other (x) FROM stdin;\n9\n\\.\n";

    #[tokio::test]
    async fn skips_preamble_and_yields_rows() {
        let mut reader = CopyTableReader::new("nodes", STREAM);
        let header = reader.read_header().await.unwrap();
        assert_eq!(header.columns, vec!["node_id", "version"]);

        assert_eq!(reader.next_row().await.unwrap(), Some(b"1\t1".as_slice()));
        assert_eq!(reader.next_row().await.unwrap(), Some(b"2\t1".as_slice()));
        assert_eq!(reader.line_number(), 2);
        assert_eq!(reader.next_row().await.unwrap(), None);
        // Once terminated the reader stays terminated.
        assert_eq!(reader.next_row().await.unwrap(), None);
    }

    #[tokio::test]
    async fn missing_header_is_early_termination() {
        let mut reader = CopyTableReader::new("nodes", b"no copy in here\n".as_slice());
        let err = reader.read_header().await.unwrap_err();
        assert!(matches!(
            err.kind(),
            crate::error::ErrorKind::EarlyTermination { .. }
        ));
    }

    #[tokio::test]
    async fn eof_before_terminator_is_early_termination() {
        let mut reader =
            CopyTableReader::new("nodes", b"COPY nodes (node_id) FROM stdin;\n1\n".as_slice());
        reader.read_header().await.unwrap();
        assert_eq!(reader.next_row().await.unwrap(), Some(b"1".as_slice()));
        let err = reader.next_row().await.unwrap_err();
        assert!(matches!(
            err.kind(),
            crate::error::ErrorKind::EarlyTermination { .. }
        ));
    }

    #[tokio::test]
    async fn malformed_header_is_reported() {
        let mut reader =
            CopyTableReader::new("nodes", b"COPY nodes FROM stdin;\n".as_slice());
        let err = reader.read_header().await.unwrap_err();
        assert!(matches!(
            err.kind(),
            crate::error::ErrorKind::CopyHeaderParse { .. }
        ));
    }
}

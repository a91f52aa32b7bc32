use std::io;

use tokio::io::{AsyncRead, AsyncReadExt};

/// Size of the refill buffer. COPY rows are usually short but tag values can
/// reach tens of kilobytes, so the buffer is kept large to amortize reads.
const BUFFER_SIZE: usize = 1 << 20;

/// Frames an async byte stream into newline-terminated lines.
///
/// The final line of the stream is yielded even without a trailing newline.
/// Returned slices do not include the newline and stay valid until the next
/// call.
pub struct LineReader<R> {
    source: R,
    buffer: Vec<u8>,
    pos: usize,
    end: usize,
    line: Vec<u8>,
    eof: bool,
}

impl<R: AsyncRead + Unpin> LineReader<R> {
    pub fn new(source: R) -> Self {
        Self::with_capacity(source, BUFFER_SIZE)
    }

    pub fn with_capacity(source: R, capacity: usize) -> Self {
        Self {
            source,
            buffer: vec![0; capacity.max(1)],
            pos: 0,
            end: 0,
            line: Vec::new(),
            eof: false,
        }
    }

    /// Reads the next line, or `None` at end of input.
    pub async fn next_line(&mut self) -> io::Result<Option<&[u8]>> {
        self.line.clear();

        loop {
            if self.pos == self.end {
                if !self.refill().await? {
                    // Accept a final line without a trailing newline.
                    if self.line.is_empty() {
                        return Ok(None);
                    }
                    return Ok(Some(&self.line));
                }
            }

            let chunk = &self.buffer[self.pos..self.end];
            match memchr::memchr(b'\n', chunk) {
                Some(offset) => {
                    self.line.extend_from_slice(&chunk[..offset]);
                    self.pos += offset + 1;
                    return Ok(Some(&self.line));
                }
                None => {
                    self.line.extend_from_slice(chunk);
                    self.pos = self.end;
                }
            }
        }
    }

    /// Refills the buffer, reading until it is full or the source is
    /// exhausted. Returns false once no further bytes are available.
    async fn refill(&mut self) -> io::Result<bool> {
        if self.eof {
            return Ok(false);
        }

        self.pos = 0;
        self.end = 0;
        while self.end < self.buffer.len() {
            let n = self.source.read(&mut self.buffer[self.end..]).await?;
            if n == 0 {
                self.eof = true;
                break;
            }
            self.end += n;
        }

        Ok(self.end > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn collect(input: &[u8], capacity: usize) -> Vec<Vec<u8>> {
        let mut reader = LineReader::with_capacity(input, capacity);
        let mut lines = Vec::new();
        while let Some(line) = reader.next_line().await.unwrap() {
            lines.push(line.to_vec());
        }
        lines
    }

    #[tokio::test]
    async fn splits_lines() {
        let lines = collect(b"one\ntwo\nthree\n", 1024).await;
        assert_eq!(lines, vec![b"one".to_vec(), b"two".to_vec(), b"three".to_vec()]);
    }

    #[tokio::test]
    async fn final_line_without_newline_is_accepted() {
        let lines = collect(b"one\ntwo", 1024).await;
        assert_eq!(lines, vec![b"one".to_vec(), b"two".to_vec()]);
    }

    #[tokio::test]
    async fn lines_spanning_refills_are_reassembled() {
        // A 3-byte buffer forces every line to straddle refill boundaries.
        let lines = collect(b"alpha\nbeta\ngamma\n", 3).await;
        assert_eq!(
            lines,
            vec![b"alpha".to_vec(), b"beta".to_vec(), b"gamma".to_vec()]
        );
    }

    #[tokio::test]
    async fn empty_input_yields_nothing() {
        let lines = collect(b"", 1024).await;
        assert!(lines.is_empty());
    }

    #[tokio::test]
    async fn empty_lines_are_preserved() {
        let lines = collect(b"a\n\nb\n", 1024).await;
        assert_eq!(lines, vec![b"a".to_vec(), b"".to_vec(), b"b".to_vec()]);
    }
}

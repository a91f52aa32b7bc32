//! Record framing of sorted-run files.
//!
//! Each record is `key length, value length, key bytes, value bytes`.
//! Lengths are 16-bit little-endian; a length of `0xFFFF` escapes to a
//! 64-bit little-endian length that follows immediately.

use std::io::{self, Read, Write};

/// Length prefix value that announces a 64-bit length.
const LONG_LENGTH_MARKER: u16 = u16::MAX;

/// On-disk size of one framed record; this is what the sorter's block
/// budget accounts.
pub fn framed_len(key_len: usize, value_len: usize) -> usize {
    prefix_len(key_len) + prefix_len(value_len) + key_len + value_len
}

fn prefix_len(len: usize) -> usize {
    if len >= LONG_LENGTH_MARKER as usize {
        2 + 8
    } else {
        2
    }
}

pub fn write_frame<W: Write>(writer: &mut W, key: &[u8], value: &[u8]) -> io::Result<()> {
    write_len(writer, key.len())?;
    write_len(writer, value.len())?;
    writer.write_all(key)?;
    writer.write_all(value)
}

fn write_len<W: Write>(writer: &mut W, len: usize) -> io::Result<()> {
    if len >= LONG_LENGTH_MARKER as usize {
        writer.write_all(&LONG_LENGTH_MARKER.to_le_bytes())?;
        writer.write_all(&(len as u64).to_le_bytes())
    } else {
        writer.write_all(&(len as u16).to_le_bytes())
    }
}

/// Reads one framed record into the supplied buffers. Returns false on a
/// clean end of stream; a partial record is an `UnexpectedEof` error.
pub fn read_frame<R: Read>(
    reader: &mut R,
    key: &mut Vec<u8>,
    value: &mut Vec<u8>,
) -> io::Result<bool> {
    let Some(key_len) = read_len(reader, true)? else {
        return Ok(false);
    };
    let value_len = read_len(reader, false)?.expect("non-initial read cannot signal end");

    key.resize(key_len, 0);
    reader.read_exact(key)?;
    value.resize(value_len, 0);
    reader.read_exact(value)?;
    Ok(true)
}

/// Reads one length prefix. When `at_record_start`, a clean EOF before any
/// byte is reported as `None` instead of an error.
fn read_len<R: Read>(reader: &mut R, at_record_start: bool) -> io::Result<Option<usize>> {
    let mut short = [0u8; 2];
    if !read_exact_or_eof(reader, &mut short, at_record_start)? {
        return Ok(None);
    }

    let short = u16::from_le_bytes(short);
    if short != LONG_LENGTH_MARKER {
        return Ok(Some(short as usize));
    }

    let mut long = [0u8; 8];
    reader.read_exact(&mut long)?;
    Ok(Some(u64::from_le_bytes(long) as usize))
}

/// Like `read_exact`, but when `allow_eof` an immediate end of stream
/// returns false instead of failing.
fn read_exact_or_eof<R: Read>(
    reader: &mut R,
    buf: &mut [u8],
    allow_eof: bool,
) -> io::Result<bool> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..])?;
        if n == 0 {
            if filled == 0 && allow_eof {
                return Ok(false);
            }
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "truncated record frame",
            ));
        }
        filled += n;
    }
    Ok(true)
}

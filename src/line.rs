//! Byte-oriented framing primitive over a duplex stream (spec.md §4.1).
//!
//! Grounded on the teacher's `read_line`/`read_data` in `session.rs`,
//! corrected to perform dot-unstuffing in the core (the teacher passes raw
//! wire format through to its backend, which does its own unstuffing; a
//! reusable core cannot assume that of its caller).

use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};

use crate::error::{DataError, LineError};

/// Read the next CRLF-terminated command line, with CRLF stripped.
///
/// Embedded NULs are permitted (they occur in AUTH base64 blobs). Returns
/// `Ok(None)` on a clean EOF before any bytes were read, `Err(TooLong)` once
/// the accumulated length exceeds `max` without having seen a terminator.
pub async fn read_command_line<R>(
    reader: &mut BufReader<R>,
    max: usize,
) -> Result<Option<Vec<u8>>, LineError>
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut buf = Vec::with_capacity(128);
    loop {
        let byte = match reader.read_u8().await {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                if buf.is_empty() {
                    return Ok(None);
                }
                return Ok(Some(strip_crlf(buf)));
            }
            Err(e) => return Err(e.into()),
        };
        if byte == b'\n' {
            return Ok(Some(strip_crlf(buf)));
        }
        buf.push(byte);
        if buf.len() > max {
            return Err(LineError::TooLong);
        }
    }
}

fn strip_crlf(mut buf: Vec<u8>) -> Vec<u8> {
    if buf.last() == Some(&b'\r') {
        buf.pop();
    }
    buf
}

/// Read a DATA-mode body up to and including the lone-dot terminator.
///
/// Performs byte-stuffing removal per RFC 5321 §4.5.2: a line beginning with
/// `.` has exactly one leading dot stripped. Returned bytes are de-stuffed
/// lines rejoined with CRLF, without the terminator line.
///
/// If `max` is set and the running total crosses it, the reader keeps
/// draining input until the terminator is seen (to stay framed for the next
/// command) but reports [`DataError::TooLarge`].
pub async fn read_data_body<R>(
    reader: &mut BufReader<R>,
    max: Option<usize>,
) -> Result<Vec<u8>, DataError>
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut body = Vec::with_capacity(4096);
    let mut line_buf = Vec::with_capacity(1024);
    let mut size_exceeded = false;

    loop {
        line_buf.clear();
        let n = reader.read_until(b'\n', &mut line_buf).await?;
        if n == 0 {
            return Err(DataError::Eof);
        }

        let trimmed: &[u8] = if line_buf.ends_with(b"\r\n") {
            &line_buf[..line_buf.len() - 2]
        } else if line_buf.ends_with(b"\n") {
            &line_buf[..line_buf.len() - 1]
        } else {
            &line_buf[..]
        };
        if trimmed == b"." {
            break;
        }

        if size_exceeded {
            continue;
        }

        let destuffed: &[u8] = if trimmed.first() == Some(&b'.') {
            &trimmed[1..]
        } else {
            trimmed
        };
        body.extend_from_slice(destuffed);
        body.extend_from_slice(b"\r\n");

        if let Some(max) = max {
            if body.len() > max {
                size_exceeded = true;
            }
        }
    }

    if size_exceeded {
        Err(DataError::TooLarge)
    } else {
        Ok(body)
    }
}

//! # Response Decoding
//!
//! This module implements the decoder for the server's typed, length-prefixed
//! response protocol. Responses arrive over a byte stream and are framed with
//! a one-byte type prefix and `\r\n` terminators.
//!
//! ## Framing
//!
//! The first byte of a response selects its type:
//! - `+` simple string: the remainder of the line is the value
//! - `-` error: the remainder of the line is the error text (a normal decoded
//!   value, never a fault)
//! - `:` integer: the remainder of the line is a decimal integer
//! - `$` bulk string: the line carries a byte count; `-1` means null,
//!   otherwise exactly that many payload bytes follow, then `\r\n`
//! - `*` array: the line carries an element count; `-1` means null, `0` an
//!   empty array, otherwise that many responses follow recursively
//!
//! The decoder reads exactly one complete response and stops: buffered
//! readahead stays inside the `BufReader` owned by the same session, so no
//! partially-read state ever escapes.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};
use tokio::time::timeout;

use crate::error::{Error, Result};

/// How long a decode may wait on the transport before failing.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(1);

/// Maximum array nesting depth (prevent stack overflow on degenerate input)
const MAX_NESTING_DEPTH: usize = 32;

/// Maximum size for a single bulk string (512 MB, matching the usual server
/// limit); a larger announced length is treated as a framing error rather
/// than an allocation request
const MAX_BULK_SIZE: i64 = 512 * 1024 * 1024;

/// A fully decoded server response.
///
/// Null bulk strings and null arrays stay distinguishable (`Bulk(None)` vs
/// `Array(None)`) but both satisfy [`Response::is_null`] and both render as
/// the same sentinel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    /// `+OK` or `+PONG` style responses
    Simple(String),
    /// `-ERR ...` responses, carried as a value
    Error(String),
    /// `:123` responses
    Integer(i64),
    /// `$...` bulk strings, with `None` for the null bulk string
    Bulk(Option<String>),
    /// `*...` arrays, with `None` for the null array
    Array(Option<Vec<Response>>),
}

impl Response {
    /// True for the null bulk string and the null array.
    pub fn is_null(&self) -> bool {
        matches!(self, Response::Bulk(None) | Response::Array(None))
    }

    /// True when the server reported an error for this exchange.
    pub fn is_error(&self) -> bool {
        matches!(self, Response::Error(_))
    }
}

/// Reads one complete response, failing with [`Error::Timeout`] when the
/// stream stays silent longer than `read_timeout`.
pub async fn decode<R>(reader: &mut R, read_timeout: Duration) -> Result<Response>
where
    R: AsyncBufRead + Unpin + Send,
{
    match timeout(read_timeout, read_value(reader, 0)).await {
        Ok(result) => result,
        Err(_) => Err(Error::Timeout),
    }
}

/// Reads one complete response without a deadline.
///
/// Used by the push-mode loop, where the stream is legitimately silent for
/// arbitrary stretches between pushed messages.
pub(crate) fn read_value<'a, R>(
    reader: &'a mut R,
    depth: usize,
) -> Pin<Box<dyn Future<Output = Result<Response>> + Send + 'a>>
where
    R: AsyncBufRead + Unpin + Send,
{
    // Boxed so the recursion through array elements has a finite future type.
    Box::pin(async move {
        if depth > MAX_NESTING_DEPTH {
            return Err(Error::protocol(format!(
                "array nesting deeper than {} levels",
                MAX_NESTING_DEPTH
            )));
        }

        let line = read_line(reader).await?;
        let Some(prefix) = line.bytes().next() else {
            return Err(Error::protocol("empty response line"));
        };

        // The slice below is only taken for ASCII prefixes, so it always
        // lands on a character boundary.
        match prefix {
            b'+' => Ok(Response::Simple(line[1..].to_string())),
            b'-' => Ok(Response::Error(line[1..].to_string())),
            b':' => Ok(Response::Integer(parse_int(&line[1..])?)),
            b'$' => read_bulk(reader, parse_int(&line[1..])?).await,
            b'*' => read_array(reader, parse_int(&line[1..])?, depth).await,
            other => Err(Error::protocol(format!(
                "unknown response type prefix {:#04x}",
                other
            ))),
        }
    })
}

async fn read_bulk<R>(reader: &mut R, len: i64) -> Result<Response>
where
    R: AsyncBufRead + Unpin + Send,
{
    if len < 0 {
        return Ok(Response::Bulk(None));
    }
    if len > MAX_BULK_SIZE {
        return Err(Error::protocol(format!(
            "bulk string of {} bytes exceeds the {} byte limit",
            len, MAX_BULK_SIZE
        )));
    }

    let mut data = vec![0u8; len as usize];
    reader.read_exact(&mut data).await?;

    let mut crlf = [0u8; 2];
    reader.read_exact(&mut crlf).await?;
    if crlf != [b'\r', b'\n'] {
        return Err(Error::protocol("bulk string missing trailing CRLF"));
    }

    Ok(Response::Bulk(Some(
        String::from_utf8_lossy(&data).into_owned(),
    )))
}

async fn read_array<R>(reader: &mut R, count: i64, depth: usize) -> Result<Response>
where
    R: AsyncBufRead + Unpin + Send,
{
    if count < 0 {
        return Ok(Response::Array(None));
    }

    // count == 0 is an empty array, not null
    let mut items = Vec::with_capacity(count as usize);
    for _ in 0..count {
        items.push(read_value(reader, depth + 1).await?);
    }
    Ok(Response::Array(Some(items)))
}

/// Reads one `\r\n`-terminated line and strips the terminator.
async fn read_line<R>(reader: &mut R) -> Result<String>
where
    R: AsyncBufRead + Unpin + Send,
{
    let mut buf = Vec::with_capacity(64);
    let n = reader.read_until(b'\n', &mut buf).await?;
    if n == 0 {
        return Err(Error::Io {
            source: std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "connection closed while reading a response",
            ),
        });
    }
    if buf.len() < 2 || buf[buf.len() - 2] != b'\r' {
        return Err(Error::protocol("response line not terminated with CRLF"));
    }
    buf.truncate(buf.len() - 2);
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

fn parse_int(text: &str) -> Result<i64> {
    text.parse()
        .map_err(|_| Error::protocol(format!("invalid integer: {:?}", text)))
}

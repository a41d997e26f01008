/*!
 * Wire Protocol
 *
 * Request framing and reply encoding. Requests arrive either as RESP
 * arrays of bulk strings (`*<n>\r\n$<len>\r\n<bytes>\r\n...`) or as
 * inline text lines (`SET key value\n`). Both decode to an argument
 * vector whose first element is the command name. The append-only log
 * reuses the same decoder for replay.
 */

use crate::error::StoreError;
use anyhow::{anyhow, bail, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;

/// Upper bound for a single bulk string
pub const MAX_BULK_LEN: i64 = 512 * 1024 * 1024;
/// Upper bound for the element count of one request
pub const MAX_ARRAY_LEN: i64 = 1024 * 1024;
/// Inline requests longer than this without a newline are rejected
pub const MAX_INLINE_LEN: usize = 64 * 1024;

/// Decode one request from the front of `data`
///
/// # Returns
/// * `Ok(Some((consumed_bytes, args)))` - a complete request; `args` is
///   empty for blank lines and `*0` arrays, which callers skip
/// * `Ok(None)` - incomplete data, need more bytes
/// * `Err(...)` - protocol error; the connection cannot be resynchronized
pub fn parse_one(data: &[u8]) -> Result<Option<(usize, Vec<Bytes>)>> {
    match data.first() {
        None => Ok(None),
        Some(b'*') => parse_array(data),
        Some(_) => parse_inline(data),
    }
}

/// Decode every complete request in `buf`, leaving any partial tail
///
/// Used for pipelined requests and for log replay.
pub fn parse_many(buf: &mut BytesMut, out: &mut Vec<Vec<Bytes>>) -> Result<()> {
    loop {
        let (consumed, args) = match parse_one(&buf[..])? {
            Some(x) => x,
            None => break,
        };
        buf.advance(consumed);
        if !args.is_empty() {
            out.push(args);
        }
    }
    Ok(())
}

fn parse_array(data: &[u8]) -> Result<Option<(usize, Vec<Bytes>)>> {
    let (i, n) = match read_decimal_line(&data[1..])? {
        Some(x) => x,
        None => return Ok(None),
    };
    let mut cursor = 1 + i;

    if n <= 0 {
        return Ok(Some((cursor, Vec::new())));
    }
    if n > MAX_ARRAY_LEN {
        bail!("invalid multibulk length");
    }

    let mut items: Vec<Bytes> = Vec::with_capacity(n as usize);
    for _ in 0..n {
        if cursor >= data.len() {
            return Ok(None);
        }
        if data[cursor] != b'$' {
            bail!("expected '$', got '{}'", data[cursor] as char);
        }

        let (i2, len) = match read_decimal_line(&data[cursor + 1..])? {
            Some(x) => x,
            None => return Ok(None),
        };
        if !(0..=MAX_BULK_LEN).contains(&len) {
            bail!("invalid bulk length");
        }
        cursor += 1 + i2;

        let need = len as usize + 2;
        if cursor + need > data.len() {
            return Ok(None);
        }
        if &data[cursor + len as usize..cursor + need] != b"\r\n" {
            bail!("expected CRLF after bulk string");
        }
        items.push(Bytes::copy_from_slice(&data[cursor..cursor + len as usize]));
        cursor += need;
    }

    Ok(Some((cursor, items)))
}

/// Read a signed decimal terminated by CRLF. `None` if the CRLF hasn't
/// arrived yet.
fn read_decimal_line(s: &[u8]) -> Result<Option<(usize, i64)>> {
    let end = match s.windows(2).position(|w| w == b"\r\n") {
        Some(p) => p,
        None => {
            if s.len() > 32 {
                bail!("expected CRLF");
            }
            return Ok(None);
        }
    };
    let n = std::str::from_utf8(&s[..end])
        .ok()
        .and_then(|t| t.parse::<i64>().ok())
        .ok_or_else(|| anyhow!("invalid length"))?;
    Ok(Some((end + 2, n)))
}

fn parse_inline(data: &[u8]) -> Result<Option<(usize, Vec<Bytes>)>> {
    let end = match data.iter().position(|&c| c == b'\n') {
        Some(p) => p,
        None => {
            if data.len() > MAX_INLINE_LEN {
                bail!("too big inline request");
            }
            return Ok(None);
        }
    };
    let mut line = &data[..end];
    if line.last() == Some(&b'\r') {
        line = &line[..line.len() - 1];
    }
    Ok(Some((end + 1, split_inline(line)?)))
}

/// Split an inline line on whitespace, honoring double quotes
///
/// Inside quotes `\n`, `\r`, `\t`, `\"` and `\\` are unescaped.
pub fn split_inline(line: &[u8]) -> Result<Vec<Bytes>> {
    let mut parts = Vec::new();
    let mut current = Vec::new();
    let mut in_quotes = false;
    let mut quoted = false;
    let mut iter = line.iter().copied();

    while let Some(c) = iter.next() {
        match c {
            b'"' => {
                in_quotes = !in_quotes;
                quoted = true;
            }
            b' ' | b'\t' if !in_quotes => {
                if !current.is_empty() || quoted {
                    parts.push(Bytes::from(std::mem::take(&mut current)));
                }
                quoted = false;
            }
            b'\\' if in_quotes => match iter.next() {
                Some(b'n') => current.push(b'\n'),
                Some(b'r') => current.push(b'\r'),
                Some(b't') => current.push(b'\t'),
                Some(b'"') => current.push(b'"'),
                Some(b'\\') => current.push(b'\\'),
                Some(other) => {
                    current.push(b'\\');
                    current.push(other);
                }
                None => current.push(b'\\'),
            },
            _ => current.push(c),
        }
    }

    if in_quotes {
        bail!("unbalanced quotes in request");
    }
    if !current.is_empty() || quoted {
        parts.push(Bytes::from(current));
    }
    Ok(parts)
}

/// A typed reply, rendered to RESP only at the connection boundary
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    /// `+OK`, `+PONG`, TYPE names
    Simple(&'static str),
    /// `-ERR ...`; the text already carries its prefix
    Error(String),
    Integer(i64),
    Bulk(Bytes),
    /// `$-1`
    Null,
    Array(Vec<Reply>),
}

impl Reply {
    pub fn ok() -> Self {
        Reply::Simple("OK")
    }

    /// Bulk reply for `Some`, null bulk for `None`
    pub fn bulk_or_null(v: Option<Bytes>) -> Self {
        v.map_or(Reply::Null, Reply::Bulk)
    }

    pub fn bulks(items: impl IntoIterator<Item = Bytes>) -> Self {
        Reply::Array(items.into_iter().map(Reply::Bulk).collect())
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Reply::Error(_))
    }

    /// Append the RESP encoding of this reply to `out`
    pub fn encode(&self, out: &mut BytesMut) {
        match self {
            Reply::Simple(s) => write_simple(s, out),
            Reply::Error(e) => write_error(e, out),
            Reply::Integer(i) => write_integer(*i, out),
            Reply::Bulk(b) => write_bulk(b, out),
            Reply::Null => write_null(out),
            Reply::Array(items) => {
                write_array_len(items.len(), out);
                for it in items {
                    it.encode(out);
                }
            }
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = BytesMut::new();
        self.encode(&mut out);
        out.to_vec()
    }
}

impl From<StoreError> for Reply {
    fn from(e: StoreError) -> Self {
        Reply::Error(e.to_string())
    }
}

impl fmt::Display for Reply {
    /// Human-readable rendering in the style of redis-cli
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reply::Simple(s) => write!(f, "{}", s),
            Reply::Error(e) => write!(f, "(error) {}", e),
            Reply::Integer(i) => write!(f, "(integer) {}", i),
            Reply::Bulk(b) => write!(f, "\"{}\"", String::from_utf8_lossy(b)),
            Reply::Null => write!(f, "(nil)"),
            Reply::Array(items) if items.is_empty() => write!(f, "(empty array)"),
            Reply::Array(items) => {
                for (i, it) in items.iter().enumerate() {
                    if i > 0 {
                        writeln!(f)?;
                    }
                    write!(f, "{}) {}", i + 1, it)?;
                }
                Ok(())
            }
        }
    }
}

//
// RESP Response Encoders
//

/// Encode a simple string response (+OK\r\n)
#[inline]
pub fn write_simple(s: &str, out: &mut BytesMut) {
    out.reserve(s.len() + 3);
    out.put_u8(b'+');
    out.put_slice(s.as_bytes());
    out.put_slice(b"\r\n");
}

/// Encode an error response (-ERR message\r\n)
#[inline]
pub fn write_error(s: &str, out: &mut BytesMut) {
    out.reserve(s.len() + 3);
    out.put_u8(b'-');
    out.put_slice(s.as_bytes());
    out.put_slice(b"\r\n");
}

/// Encode an integer response (:<number>\r\n)
#[inline]
pub fn write_integer(i: i64, out: &mut BytesMut) {
    out.put_u8(b':');
    out.put_slice(i.to_string().as_bytes());
    out.put_slice(b"\r\n");
}

/// Encode a bulk string response ($<len>\r\n<data>\r\n)
#[inline]
pub fn write_bulk(b: &[u8], out: &mut BytesMut) {
    let len_str = b.len().to_string();
    out.reserve(1 + len_str.len() + 2 + b.len() + 2);
    out.put_u8(b'$');
    out.put_slice(len_str.as_bytes());
    out.put_slice(b"\r\n");
    out.put_slice(b);
    out.put_slice(b"\r\n");
}

/// Encode a null bulk response ($-1\r\n)
#[inline]
pub fn write_null(out: &mut BytesMut) {
    out.put_slice(b"$-1\r\n");
}

/// Encode an array header (*<count>\r\n); elements follow
#[inline]
pub fn write_array_len(n: usize, out: &mut BytesMut) {
    out.put_u8(b'*');
    out.put_slice(n.to_string().as_bytes());
    out.put_slice(b"\r\n");
}

//! # RESP2 Codec
//!
//! Encode commands as RESP2 arrays of bulk strings and parse RESP2 replies from
//! a streaming TCP buffer.
//!
//! ## Design Principles
//!
//! 1. **Streaming Friendly**: The parser returns `Ok(None)` when more data is
//!    needed and leaves the buffer untouched until a full reply is present.
//! 2. **Single Pass**: A reply is scanned once to find its end, then split off.
//! 3. **Low Allocation**: Commands are written straight into the outgoing
//!    `BytesMut`; only bulk payloads are copied out on parse.
//! 4. **Fail Fast**: Malformed frames return a protocol error immediately.

use bytes::{Buf, BufMut, BytesMut};

use crate::command::Reply;

/// RESP parser errors surfaced to the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RespError {
    /// The input is not valid RESP2.
    Protocol,
}

/// Appends one command to `buf`.
pub fn encode_command(args: &[Vec<u8>], buf: &mut BytesMut) {
    buf.put_u8(b'*');
    buf.put_slice(args.len().to_string().as_bytes());
    buf.put_slice(b"\r\n");
    for arg in args {
        buf.put_u8(b'$');
        buf.put_slice(arg.len().to_string().as_bytes());
        buf.put_slice(b"\r\n");
        buf.put_slice(arg);
        buf.put_slice(b"\r\n");
    }
}

/// Attempts to parse a single reply from the front of `buf`.
///
/// Returns `Ok(None)` if the buffer does not yet hold a complete reply.
pub fn parse_reply(buf: &mut BytesMut) -> Result<Option<Reply>, RespError> {
    match parse_at(buf, 0)? {
        Some((reply, consumed)) => {
            buf.advance(consumed);
            Ok(Some(reply))
        }
        None => Ok(None),
    }
}

/// Parses a reply starting at `pos`, returning it and the position after it.
fn parse_at(buf: &[u8], pos: usize) -> Result<Option<(Reply, usize)>, RespError> {
    let Some((line, next)) = read_line(buf, pos) else {
        return Ok(None);
    };
    let (&tag, body) = line.split_first().ok_or(RespError::Protocol)?;

    match tag {
        b'+' => Ok(Some((Reply::Status(utf8(body)?), next))),
        b'-' => Ok(Some((Reply::Error(utf8(body)?), next))),
        b':' => Ok(Some((Reply::Integer(parse_i64(body)?), next))),
        b'$' => {
            let len = parse_i64(body)?;
            if len < 0 {
                return Ok(Some((Reply::Bulk(None), next)));
            }
            let len = len as usize;
            if buf.len() < next + len + 2 {
                return Ok(None);
            }
            if &buf[next + len..next + len + 2] != b"\r\n" {
                return Err(RespError::Protocol);
            }
            let data = buf[next..next + len].to_vec();
            Ok(Some((Reply::Bulk(Some(data)), next + len + 2)))
        }
        b'*' => {
            let count = parse_i64(body)?;
            if count < 0 {
                return Ok(Some((Reply::Array(None), next)));
            }
            let mut items = Vec::with_capacity((count as usize).min(1024));
            let mut cursor = next;
            for _ in 0..count {
                match parse_at(buf, cursor)? {
                    Some((item, after)) => {
                        items.push(item);
                        cursor = after;
                    }
                    None => return Ok(None),
                }
            }
            Ok(Some((Reply::Array(Some(items)), cursor)))
        }
        _ => Err(RespError::Protocol),
    }
}

/// Finds the CRLF-terminated line at `pos`; returns it and the position after the CRLF.
fn read_line(buf: &[u8], pos: usize) -> Option<(&[u8], usize)> {
    let mut idx = pos + 1;
    while idx < buf.len() {
        if buf[idx] == b'\n' && buf[idx - 1] == b'\r' {
            return Some((&buf[pos..idx - 1], idx + 1));
        }
        idx += 1;
    }
    None
}

fn parse_i64(data: &[u8]) -> Result<i64, RespError> {
    let (negative, digits) = match data.split_first() {
        Some((b'-', rest)) => (true, rest),
        _ => (false, data),
    };
    if digits.is_empty() {
        return Err(RespError::Protocol);
    }
    let mut value: i64 = 0;
    for &b in digits {
        if !b.is_ascii_digit() {
            return Err(RespError::Protocol);
        }
        value = value.saturating_mul(10).saturating_add((b - b'0') as i64);
    }
    Ok(if negative { -value } else { value })
}

fn utf8(data: &[u8]) -> Result<String, RespError> {
    String::from_utf8(data.to_vec()).map_err(|_| RespError::Protocol)
}

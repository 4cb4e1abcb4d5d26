//! # RESP2 Encoding and Parsing
//!
//! Purpose: Frame outbound commands and decode replies incrementally from a
//! socket buffer that may hold partial frames.
//!
//! ## Design Principles
//! 1. **Incremental Decoding**: `RespDecoder::decode` returns `Ok(None)` until a
//!    whole frame is buffered and only then consumes bytes.
//! 2. **Binary-Safe**: Bulk strings are treated as raw bytes.
//! 3. **Fail Fast**: Invalid framing returns protocol errors immediately.

use bytes::{Buf, BufMut, BytesMut};

use crate::error::ProtocolError;

/// RESP response value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RespValue {
    /// +OK or +PONG style responses.
    Simple(Vec<u8>),
    /// -ERR ... responses.
    Error(Vec<u8>),
    /// :123 responses.
    Integer(i64),
    /// $... bulk strings, with None for null.
    Bulk(Option<Vec<u8>>),
    /// *... arrays, with a null array decoded as empty.
    Array(Vec<RespValue>),
}

/// Encodes a RESP2 array command into the provided buffer.
pub fn encode_command<A: AsRef<[u8]>>(args: &[A], out: &mut BytesMut) {
    let payload: usize = args.iter().map(|arg| arg.as_ref().len() + 16).sum();
    out.reserve(payload + 16);
    out.put_u8(b'*');
    push_usize(out, args.len());
    out.put_slice(b"\r\n");
    for arg in args {
        let arg = arg.as_ref();
        out.put_u8(b'$');
        push_usize(out, arg.len());
        out.put_slice(b"\r\n");
        out.put_slice(arg);
        out.put_slice(b"\r\n");
    }
}

/// Stateless incremental decoder for server replies.
#[derive(Debug, Default, Clone, Copy)]
pub struct RespDecoder;

impl RespDecoder {
    pub fn new() -> Self {
        RespDecoder
    }

    /// Decodes one value from the front of `buf`.
    ///
    /// **Output**: `Ok(Some(value))` and the frame consumed, `Ok(None)` with
    /// `buf` untouched when more bytes are needed, or a protocol error.
    pub fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<RespValue>, ProtocolError> {
        match parse_value(&buf[..], 0)? {
            Some((value, consumed)) => {
                buf.advance(consumed);
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }
}

fn parse_value(data: &[u8], pos: usize) -> Result<Option<(RespValue, usize)>, ProtocolError> {
    let (line, next) = match read_line(data, pos)? {
        Some(found) => found,
        None => return Ok(None),
    };
    if line.is_empty() {
        return Err(ProtocolError::MissingCrlf);
    }

    match line[0] {
        b'+' => Ok(Some((RespValue::Simple(line[1..].to_vec()), next))),
        b'-' => Ok(Some((RespValue::Error(line[1..].to_vec()), next))),
        b':' => Ok(Some((RespValue::Integer(parse_i64(&line[1..])?), next))),
        b'$' => {
            let len = parse_i64(&line[1..])?;
            if len < 0 {
                return Ok(Some((RespValue::Bulk(None), next)));
            }
            let end = next + len as usize;
            if data.len() < end + 2 {
                return Ok(None);
            }
            if &data[end..end + 2] != b"\r\n" {
                return Err(ProtocolError::MissingCrlf);
            }
            Ok(Some((RespValue::Bulk(Some(data[next..end].to_vec())), end + 2)))
        }
        b'*' => {
            let len = parse_i64(&line[1..])?;
            if len <= 0 {
                return Ok(Some((RespValue::Array(Vec::new()), next)));
            }
            let mut items = Vec::with_capacity(len as usize);
            let mut cursor = next;
            for _ in 0..len {
                match parse_value(data, cursor)? {
                    Some((item, after)) => {
                        items.push(item);
                        cursor = after;
                    }
                    None => return Ok(None),
                }
            }
            Ok(Some((RespValue::Array(items), cursor)))
        }
        other => Err(ProtocolError::UnexpectedMarker(other)),
    }
}

/// Finds the CRLF-terminated line starting at `pos`.
fn read_line(data: &[u8], pos: usize) -> Result<Option<(&[u8], usize)>, ProtocolError> {
    let rest = match data.get(pos..) {
        Some(rest) => rest,
        None => return Ok(None),
    };
    match rest.iter().position(|&b| b == b'\n') {
        Some(idx) => {
            if idx == 0 || rest[idx - 1] != b'\r' {
                return Err(ProtocolError::MissingCrlf);
            }
            Ok(Some((&rest[..idx - 1], pos + idx + 1)))
        }
        None => Ok(None),
    }
}

fn parse_i64(data: &[u8]) -> Result<i64, ProtocolError> {
    if data.is_empty() {
        return Err(ProtocolError::InvalidInteger);
    }
    let (negative, digits) = match data[0] {
        b'-' => (true, &data[1..]),
        _ => (false, data),
    };
    if digits.is_empty() {
        return Err(ProtocolError::InvalidInteger);
    }

    let mut value: i64 = 0;
    for &b in digits {
        if !b.is_ascii_digit() {
            return Err(ProtocolError::InvalidInteger);
        }
        value = value.saturating_mul(10).saturating_add((b - b'0') as i64);
    }

    Ok(if negative { -value } else { value })
}

fn push_usize(out: &mut BytesMut, mut value: usize) {
    // Write digits into a small stack buffer to avoid heap allocations.
    let mut buf = [0u8; 20];
    let mut len = 0;
    loop {
        buf[len] = b'0' + (value % 10) as u8;
        value /= 10;
        len += 1;
        if value == 0 {
            break;
        }
    }
    buf[..len].reverse();
    out.put_slice(&buf[..len]);
}

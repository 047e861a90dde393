//! Wire protocol: length-prefixed requests, tagged responses, everything
//! little-endian.
//!
//! A request is `u32 len` (excluding itself), then `u32 argc`, then argc
//! arguments each as `u32 len` + bytes. A response is `u32 len`, then one
//! tagged value. Handlers build a [`Reply`]; serializing it is a pure
//! function of the value.

use thiserror::Error;

use crate::buf::Buffer;
use crate::{K_MAX_ARGS, K_MAX_MSG};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Tag {
    Nil = 0,
    Err = 1,
    Str = 2,
    Int = 3,
    Dbl = 4,
    Arr = 5,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ErrCode {
    Unknown = 1,
    TooBig = 2,
    BadTyp = 3,
    BadArg = 4,
}

/// Typed command result; one of these per request, in request order.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Nil,
    Err(ErrCode, &'static str),
    Str(Vec<u8>),
    Int(i64),
    Dbl(f64),
    Arr(Vec<Reply>),
}

/// Framing violations; any of these closes the connection without a reply.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("message length over limit")]
    MessageTooLong,
    #[error("argument count over limit")]
    TooManyArgs,
    #[error("argument runs past the message end")]
    Truncated,
    #[error("trailing bytes after the last argument")]
    TrailingBytes,
}

fn read_u32(data: &[u8], pos: &mut usize) -> Result<u32, ProtocolError> {
    let end = pos.checked_add(4).ok_or(ProtocolError::Truncated)?;
    let bytes = data.get(*pos..end).ok_or(ProtocolError::Truncated)?;
    *pos = end;
    Ok(u32::from_le_bytes(bytes.try_into().unwrap()))
}

/// Split one complete request body into its arguments. The caller has
/// already stripped the outer length prefix and checked it against
/// `K_MAX_MSG`; every byte of `body` must belong to the request.
pub fn parse_request(body: &[u8]) -> Result<Vec<Vec<u8>>, ProtocolError> {
    let mut pos = 0;
    let nargs = read_u32(body, &mut pos)? as usize;
    if nargs > K_MAX_ARGS {
        return Err(ProtocolError::TooManyArgs);
    }
    let mut args = Vec::with_capacity(nargs.min(1024));
    for _ in 0..nargs {
        let len = read_u32(body, &mut pos)? as usize;
        let end = pos.checked_add(len).ok_or(ProtocolError::Truncated)?;
        let arg = body.get(pos..end).ok_or(ProtocolError::Truncated)?;
        args.push(arg.to_vec());
        pos = end;
    }
    if pos != body.len() {
        return Err(ProtocolError::TrailingBytes);
    }
    Ok(args)
}

/// Reserve the 4-byte response length prefix; returns its position for
/// `response_end`.
pub fn response_begin(out: &mut Buffer) -> usize {
    let header_pos = out.len();
    out.append_u32(0);
    header_pos
}

/// Back-patch the length prefix. An oversized response is thrown away and
/// replaced by `ERR_TOO_BIG`.
pub fn response_end(out: &mut Buffer, header_pos: usize) {
    let mut msg_size = out.len() - header_pos - 4;
    if msg_size > K_MAX_MSG {
        out.truncate_to(header_pos + 4);
        write_reply(out, &Reply::Err(ErrCode::TooBig, "response is too big"));
        msg_size = out.len() - header_pos - 4;
    }
    out.put_u32_at(header_pos, msg_size as u32);
}

pub fn write_reply(out: &mut Buffer, reply: &Reply) {
    match reply {
        Reply::Nil => out.append_u8(Tag::Nil as u8),
        Reply::Err(code, msg) => {
            out.append_u8(Tag::Err as u8);
            out.append_i32(*code as i32);
            out.append_u32(msg.len() as u32);
            out.append(msg.as_bytes());
        }
        Reply::Str(s) => {
            out.append_u8(Tag::Str as u8);
            out.append_u32(s.len() as u32);
            out.append(s);
        }
        Reply::Int(v) => {
            out.append_u8(Tag::Int as u8);
            out.append_i64(*v);
        }
        Reply::Dbl(v) => {
            out.append_u8(Tag::Dbl as u8);
            out.append_f64(*v);
        }
        Reply::Arr(elems) => {
            out.append_u8(Tag::Arr as u8);
            out.append_u32(elems.len() as u32);
            for elem in elems {
                write_reply(out, elem);
            }
        }
    }
}

//! The wire-level RESP2/RESP3 frame tree and the cursor-based parser that
//! turns bytes read off the socket into it.
//!
//! This is the low-level parser, treated as an external collaborator
//! of the client core; it is kept in-crate (there being no ecosystem RESP3
//! parser in the retrieved stack) but is deliberately dumb: it knows nothing
//! about commands, queues, or continuations. [`crate::reply`] is the layer
//! that turns a `Frame` into the client's public reply type.

use bytes::{Buf, Bytes};
use std::convert::TryInto;
use std::fmt;
use std::io::Cursor;
use std::num::TryFromIntError;
use std::string::FromUtf8Error;

/// A single RESP2 or RESP3 value, as read off the wire or about to be
/// written to it.
#[derive(Clone, Debug, PartialEq)]
pub enum Frame {
    /// `+...\r\n`
    Simple(String),
    /// `-...\r\n`
    Error(String),
    /// `:...\r\n`
    Integer(i64),
    /// `$<len>\r\n...\r\n`
    Bulk(Bytes),
    /// `$-1\r\n` (RESP2) or `_\r\n` (RESP3)
    Null,
    /// `*<len>\r\n...`
    Array(Vec<Frame>),
    /// `,<float>\r\n` (RESP3)
    Double(f64),
    /// `#t\r\n` / `#f\r\n` (RESP3)
    Boolean(bool),
    /// `(<digits>\r\n` (RESP3), kept as its decimal text since it may exceed
    /// any fixed-width integer type.
    BigNumber(String),
    /// `=<len>\r\n<3-byte format>:<payload>\r\n` (RESP3)
    Verbatim(String, Bytes),
    /// `%<len>\r\n` followed by `2*len` frames (RESP3)
    Map(Vec<(Frame, Frame)>),
    /// `~<len>\r\n` followed by `len` frames (RESP3)
    Set(Vec<Frame>),
    /// `|<len>\r\n` followed by `2*len` frames (RESP3); attached ahead of
    /// the frame it annotates, never nested inside it.
    Attribute(Vec<(Frame, Frame)>),
    /// `><len>\r\n` followed by `len` frames (RESP3 server push)
    Push(Vec<Frame>),
}

#[derive(Debug)]
pub enum Error {
    /// Not enough bytes have been buffered yet to parse a complete frame.
    Incomplete,
    /// The buffered bytes do not represent a valid frame; the connection
    /// they came from must be torn down.
    Other(crate::Error),
}

impl Frame {
    /// An empty array frame, used when encoding a command.
    pub fn array() -> Frame {
        Frame::Array(vec![])
    }

    /// Appends a bulk entry. Panics if `self` is not `Frame::Array`.
    pub fn push_bulk(&mut self, bytes: Bytes) {
        match self {
            Frame::Array(vec) => vec.push(Frame::Bulk(bytes)),
            _ => panic!("not an array frame"),
        }
    }

    /// Checks whether `src` holds one complete frame without allocating the
    /// parsed representation. Leaves `src`'s position at the end of the
    /// frame on success.
    pub fn check(src: &mut Cursor<&[u8]>) -> Result<(), Error> {
        match get_u8(src)? {
            b'+' | b'-' => {
                get_line(src)?;
                Ok(())
            }
            b':' => {
                let _ = get_signed_decimal(src)?;
                Ok(())
            }
            b',' => {
                get_line(src)?;
                Ok(())
            }
            b'#' => {
                get_line(src)?;
                Ok(())
            }
            b'(' => {
                get_line(src)?;
                Ok(())
            }
            b'_' => {
                get_line(src)?;
                Ok(())
            }
            b'$' => {
                if b'-' == peek_u8(src)? {
                    skip(src, 4)
                } else {
                    let len: usize = get_decimal(src)?.try_into()?;
                    skip(src, len + 2)
                }
            }
            b'=' => {
                let len: usize = get_decimal(src)?.try_into()?;
                skip(src, len + 2)
            }
            b'*' | b'~' | b'>' => {
                let len = get_decimal(src)?;
                for _ in 0..len {
                    Frame::check(src)?;
                }
                Ok(())
            }
            b'%' | b'|' => {
                let len = get_decimal(src)?;
                for _ in 0..len * 2 {
                    Frame::check(src)?;
                }
                Ok(())
            }
            actual => Err(format!("protocol error: invalid frame type byte `{}`", actual).into()),
        }
    }

    /// Parses one complete frame from `src`. Must only be called after
    /// [`Frame::check`] has already confirmed `src` holds a complete frame.
    pub fn parse(src: &mut Cursor<&[u8]>) -> Result<Frame, Error> {
        match get_u8(src)? {
            b'+' => Ok(Frame::Simple(utf8(get_line(src)?.to_vec())?)),
            b'-' => Ok(Frame::Error(utf8(get_line(src)?.to_vec())?)),
            b':' => Ok(Frame::Integer(get_signed_decimal(src)?)),
            b',' => {
                let line = get_line(src)?;
                let text = utf8(line.to_vec())?;
                let value = parse_double(&text)?;
                Ok(Frame::Double(value))
            }
            b'#' => match get_line(src)? {
                b"t" => Ok(Frame::Boolean(true)),
                b"f" => Ok(Frame::Boolean(false)),
                _ => Err("protocol error; invalid boolean frame".into()),
            },
            b'(' => {
                let line = get_line(src)?;
                Ok(Frame::BigNumber(utf8(line.to_vec())?))
            }
            b'_' => {
                get_line(src)?;
                Ok(Frame::Null)
            }
            b'$' => {
                if b'-' == peek_u8(src)? {
                    let line = get_line(src)?;
                    if line != b"-1" {
                        return Err("protocol error; invalid frame format".into());
                    }
                    Ok(Frame::Null)
                } else {
                    let len: usize = get_decimal(src)?.try_into()?;
                    let n = len + 2;
                    if src.remaining() < n {
                        return Err(Error::Incomplete);
                    }
                    let data = Bytes::copy_from_slice(&src.chunk()[..len]);
                    skip(src, n)?;
                    Ok(Frame::Bulk(data))
                }
            }
            b'=' => {
                let len: usize = get_decimal(src)?.try_into()?;
                let n = len + 2;
                if src.remaining() < n {
                    return Err(Error::Incomplete);
                }
                if len < 4 {
                    return Err("protocol error; invalid verbatim string".into());
                }
                let format = utf8(src.chunk()[..3].to_vec())?;
                let data = Bytes::copy_from_slice(&src.chunk()[4..len]);
                skip(src, n)?;
                Ok(Frame::Verbatim(format, data))
            }
            b'*' => {
                let len: usize = get_decimal(src)?.try_into()?;
                let mut out = Vec::with_capacity(len);
                for _ in 0..len {
                    out.push(Frame::parse(src)?);
                }
                Ok(Frame::Array(out))
            }
            b'~' => {
                let len: usize = get_decimal(src)?.try_into()?;
                let mut out = Vec::with_capacity(len);
                for _ in 0..len {
                    out.push(Frame::parse(src)?);
                }
                Ok(Frame::Set(out))
            }
            b'>' => {
                let len: usize = get_decimal(src)?.try_into()?;
                let mut out = Vec::with_capacity(len);
                for _ in 0..len {
                    out.push(Frame::parse(src)?);
                }
                Ok(Frame::Push(out))
            }
            b'%' => Ok(Frame::Map(parse_pairs(src)?)),
            b'|' => Ok(Frame::Attribute(parse_pairs(src)?)),
            other => Err(format!("protocol error: invalid frame type byte `{}`", other).into()),
        }
    }
}

fn parse_pairs(src: &mut Cursor<&[u8]>) -> Result<Vec<(Frame, Frame)>, Error> {
    let len: usize = get_decimal(src)?.try_into()?;
    let mut out = Vec::with_capacity(len);
    for _ in 0..len {
        let key = Frame::parse(src)?;
        let value = Frame::parse(src)?;
        out.push((key, value));
    }
    Ok(out)
}

fn parse_double(text: &str) -> Result<f64, Error> {
    match text {
        "inf" | "+inf" => Ok(f64::INFINITY),
        "-inf" => Ok(f64::NEG_INFINITY),
        other => other
            .parse::<f64>()
            .map_err(|_| "protocol error: invalid double frame".into()),
    }
}

impl PartialEq<&str> for Frame {
    fn eq(&self, other: &&str) -> bool {
        match self {
            Frame::Simple(s) => s.eq(other),
            Frame::Bulk(s) => s.eq(other),
            Frame::Verbatim(_, s) => s.eq(other),
            _ => false,
        }
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Frame::Simple(response) => response.fmt(f),
            Frame::Error(msg) => write!(f, "error: {}", msg),
            Frame::Integer(num) => num.fmt(f),
            Frame::Double(num) => num.fmt(f),
            Frame::Boolean(b) => b.fmt(f),
            Frame::BigNumber(s) => s.fmt(f),
            Frame::Bulk(msg) | Frame::Verbatim(_, msg) => match std::str::from_utf8(msg) {
                Ok(string) => string.fmt(f),
                Err(_) => write!(f, "{:?}", msg),
            },
            Frame::Null => "(nil)".fmt(f),
            Frame::Array(parts) | Frame::Set(parts) | Frame::Push(parts) => {
                for (i, part) in parts.iter().enumerate() {
                    if i > 0 {
                        write!(f, " ")?;
                    }
                    part.fmt(f)?;
                }
                Ok(())
            }
            Frame::Map(pairs) | Frame::Attribute(pairs) => {
                for (i, (k, v)) in pairs.iter().enumerate() {
                    if i > 0 {
                        write!(f, " ")?;
                    }
                    write!(f, "{}=>{}", k, v)?;
                }
                Ok(())
            }
        }
    }
}

fn peek_u8(src: &mut Cursor<&[u8]>) -> Result<u8, Error> {
    if !src.has_remaining() {
        return Err(Error::Incomplete);
    }
    Ok(src.chunk()[0])
}

fn get_u8(src: &mut Cursor<&[u8]>) -> Result<u8, Error> {
    if !src.has_remaining() {
        return Err(Error::Incomplete);
    }
    Ok(src.get_u8())
}

fn skip(src: &mut Cursor<&[u8]>, n: usize) -> Result<(), Error> {
    if src.remaining() < n {
        return Err(Error::Incomplete);
    }
    src.advance(n);
    Ok(())
}

fn get_decimal(src: &mut Cursor<&[u8]>) -> Result<u64, Error> {
    use atoi::atoi;
    let line = get_line(src)?;
    atoi::<u64>(line).ok_or_else(|| "protocol error: invalid frame format".into())
}

fn get_signed_decimal(src: &mut Cursor<&[u8]>) -> Result<i64, Error> {
    use atoi::atoi;
    let line = get_line(src)?;
    atoi::<i64>(line).ok_or_else(|| "protocol error: invalid frame format".into())
}

/// Scans for a `\r\n`-terminated line starting at the cursor's current
/// position, without consuming bytes past it.
fn get_line<'a>(src: &mut Cursor<&'a [u8]>) -> Result<&'a [u8], Error> {
    let start = src.position() as usize;
    let end = src.get_ref().len();
    if end == 0 {
        return Err(Error::Incomplete);
    }
    for i in start..end.saturating_sub(1) {
        if src.get_ref()[i] == b'\r' && src.get_ref()[i + 1] == b'\n' {
            src.set_position((i + 2) as u64);
            return Ok(&src.get_ref()[start..i]);
        }
    }
    Err(Error::Incomplete)
}

fn utf8(bytes: Vec<u8>) -> Result<String, Error> {
    String::from_utf8(bytes).map_err(Into::into)
}

impl From<String> for Error {
    fn from(value: String) -> Error {
        Error::Other(crate::Error::Protocol(value))
    }
}

impl From<&str> for Error {
    fn from(value: &str) -> Error {
        Error::Other(crate::Error::Protocol(value.to_string()))
    }
}

impl From<FromUtf8Error> for Error {
    fn from(_value: FromUtf8Error) -> Error {
        "protocol error; invalid frame format".into()
    }
}

impl From<TryFromIntError> for Error {
    fn from(_value: TryFromIntError) -> Error {
        "protocol error; invalid frame format".into()
    }
}

impl std::error::Error for Error {}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Incomplete => "stream ended early".fmt(f),
            Error::Other(err) => err.fmt(f),
        }
    }
}

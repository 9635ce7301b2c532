//! Converts a parsed [`Frame`] tree into the client's public [`Reply`] type.
//!
//! Nested elements are decoded recursively, a null sub-element yields
//! [`Reply::Null`], and RESP3's `Map`/`Set`/`Attribute`/`Push` shapes are
//! flattened into an ordered [`Reply::Array`] — the client imposes no
//! hash/set semantics of its own, callers pair elements up as needed.

use bytes::Bytes;

use crate::frame::Frame;

/// The decoded value handed to a command continuation.
#[derive(Clone, Debug, PartialEq)]
pub enum Reply {
    Bytes(Bytes),
    Integer(i64),
    Double(f64),
    Boolean(bool),
    Null,
    Array(Vec<Reply>),
}

/// Decodes `frame` into its public [`Reply`] representation.
///
/// The caller is expected to have already special-cased `Frame::Error` at
/// the dispatch layer — `decode` treats an error frame
/// as an ordinary string value rather than failing, so it can still be used
/// for introspection (e.g. inside a `MULTI`/`EXEC` reply array).
pub fn decode(frame: &Frame) -> Reply {
    match frame {
        Frame::Simple(s) => Reply::Bytes(Bytes::from(s.clone().into_bytes())),
        Frame::Error(s) => Reply::Bytes(Bytes::from(s.clone().into_bytes())),
        Frame::BigNumber(s) => Reply::Bytes(Bytes::from(s.clone().into_bytes())),
        Frame::Verbatim(_, data) => Reply::Bytes(data.clone()),
        Frame::Bulk(data) => Reply::Bytes(data.clone()),
        Frame::Integer(n) => Reply::Integer(*n),
        Frame::Double(d) => Reply::Double(*d),
        Frame::Boolean(b) => Reply::Boolean(*b),
        Frame::Null => Reply::Null,
        Frame::Array(items) | Frame::Set(items) | Frame::Push(items) => {
            Reply::Array(items.iter().map(decode).collect())
        }
        Frame::Map(pairs) | Frame::Attribute(pairs) => {
            let mut out = Vec::with_capacity(pairs.len() * 2);
            for (k, v) in pairs {
                out.push(decode(k));
                out.push(decode(v));
            }
            Reply::Array(out)
        }
    }
}

/// `true` when `frame` is the server's error type at the top level — this is
/// the only case where the dispatcher routes to the continuation's error
/// slot instead of decoding and handing back a value.
pub fn is_error(frame: &Frame) -> bool {
    matches!(frame, Frame::Error(_))
}

/// Extracts the raw server error text from an error frame. Panics if `frame`
/// is not `Frame::Error`; callers must check [`is_error`] first.
pub fn error_text(frame: &Frame) -> String {
    match frame {
        Frame::Error(s) => s.clone(),
        other => panic!("error_text called on non-error frame: {:?}", other),
    }
}

/// `true` when `frame` is a subscribe-family unsubscribe acknowledgement:
/// a 3-element array or push whose first element case-insensitively equals
/// `unsubscribe`, `punsubscribe`, or `sunsubscribe`.
pub fn is_unsubscribe_marker(frame: &Frame) -> bool {
    let items = match frame {
        Frame::Array(items) | Frame::Push(items) => items,
        _ => return false,
    };
    if items.len() != 3 {
        return false;
    }
    match &items[0] {
        Frame::Simple(s) => is_unsubscribe_word(s),
        Frame::Bulk(b) => std::str::from_utf8(b)
            .map(is_unsubscribe_word)
            .unwrap_or(false),
        _ => false,
    }
}

fn is_unsubscribe_word(s: &str) -> bool {
    s.eq_ignore_ascii_case("unsubscribe")
        || s.eq_ignore_ascii_case("punsubscribe")
        || s.eq_ignore_ascii_case("sunsubscribe")
}

//! Connection lifecycle and push-message handlers, plus the panic-guarded
//! invocation helper every continuation and handler goes through.
//!
//! A handler's panic must never propagate out of the dispatcher or poison
//! the connection state machine. Rust has no exceptions; the equivalent
//! failure mode is a handler closure panicking mid-borrow. [`call_guarded`]
//! catches that with `std::panic::catch_unwind` and turns it into a
//! `tracing::error!`, the same "contained, logged, ignored" contract as a
//! production event loop.

use std::panic::{self, AssertUnwindSafe};

use crate::error::Error;
use crate::reply::Reply;

/// Fired once a TCP/Unix connect (and TLS handshake, if configured)
/// succeeds.
pub type ConnectHandler = Box<dyn FnMut() + 'static>;

/// Fired whenever the connection is lost, whether by peer close, I/O error,
/// or an explicit `disconnect()`. Carries the error that caused it, or
/// `None` for a clean, caller-requested disconnect.
pub type DisconnectHandler = Box<dyn FnMut(Option<Error>) + 'static>;

/// Fired for protocol-level errors that aren't tied to any single pending
/// command (a malformed frame, an out-of-band RESP3 error).
pub type ErrorHandler = Box<dyn FnMut(Error) + 'static>;

/// Fired for every RESP3 out-of-band push message (and, over RESP2, every
/// message frame arriving on a subscribed connection).
pub type PushHandler = Box<dyn FnMut(Reply) + 'static>;

/// Invokes `f`, catching any panic so it cannot unwind across the
/// `RefCell` borrows and socket state the caller resumes immediately after.
/// A caught panic is logged and otherwise swallowed: contained, never
/// propagated.
pub fn call_guarded<F: FnOnce()>(what: &str, f: F) {
    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(f)) {
        let message = panic_message(&payload);
        tracing::error!(handler = what, panic = %message, "handler panicked, continuing");
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

//! Error taxonomy for the client core.
//!
//! The `Display` text of several variants is part of the public API: callers
//! are documented as allowed to match on the exact strings `"skipped"`,
//! `"waiting timeout"`, `"disconnected"`, and the prefixes `"connect error: "`,
//! `"reconnect error: "` and `"command failed"`. Changing that text is a
//! breaking change even though the enum itself is `#[non_exhaustive]`.

use std::fmt;

/// A specialized `Result` type for client operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the client, either synchronously from a public method
/// or asynchronously through a command continuation.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// The exact text a cancelled command (waiting or in-flight) is failed
    /// with. Part of the public error-string surface.
    #[error("skipped")]
    Skipped,

    /// A waiting-queue entry aged out before it could be promoted. Part of
    /// the public error-string surface.
    #[error("waiting timeout")]
    WaitingTimeout,

    /// The connection was lost or never established when the continuation
    /// fired. Part of the public error-string surface.
    #[error("disconnected")]
    Disconnected,

    /// Automatic reconnection gave up after `max_reconnect_attempts`. Part of
    /// the public error-string surface (`"reconnect error: "` prefix).
    #[error("reconnect error: {0}")]
    ReconnectExhausted(String),

    /// The initial TCP/Unix connect, or the TLS handshake on top of it,
    /// failed. Part of the public error-string surface (`"connect error: "`
    /// prefix).
    #[error("connect error: {0}")]
    ConnectFailed(String),

    /// A command-level transport failure that isn't cleanly one of the
    /// above (write failed mid-flight, server reset the connection while a
    /// reply was outstanding, and so on).
    #[error("command failed: {0}")]
    CommandFailed(String),

    /// The server replied with a RESP error frame. The payload is the
    /// server's original error text, unprefixed.
    #[error("{0}")]
    Redis(String),

    /// A malformed frame was read off the wire; the connection backing it
    /// is no longer usable.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A `submit`/configuration call was rejected synchronously.
    #[error("{0}")]
    InvalidArgument(String),

    /// Host/port and unix path were both set, TLS was requested without a
    /// host, or some other construction-time contradiction.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The client has been shut down and can no longer accept submissions.
    #[error("client is closed")]
    Closed,

    /// Lower-level I/O failure not otherwise classified above.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    pub(crate) fn connect_failed(msg: impl fmt::Display) -> Error {
        Error::ConnectFailed(msg.to_string())
    }

    pub(crate) fn reconnect_exhausted() -> Error {
        Error::ReconnectExhausted("max attempts reached".to_string())
    }
}

impl Clone for Error {
    /// Pending/waiting entries may need to hand the same logical error to
    /// several continuations (e.g. every waiting entry expiring in the same
    /// sweep); `io::Error` isn't `Clone`, so it is downgraded to its string
    /// form when cloned.
    fn clone(&self) -> Self {
        match self {
            Error::Skipped => Error::Skipped,
            Error::WaitingTimeout => Error::WaitingTimeout,
            Error::Disconnected => Error::Disconnected,
            Error::ReconnectExhausted(s) => Error::ReconnectExhausted(s.clone()),
            Error::ConnectFailed(s) => Error::ConnectFailed(s.clone()),
            Error::CommandFailed(s) => Error::CommandFailed(s.clone()),
            Error::Redis(s) => Error::Redis(s.clone()),
            Error::Protocol(s) => Error::Protocol(s.clone()),
            Error::InvalidArgument(s) => Error::InvalidArgument(s.clone()),
            Error::InvalidConfig(s) => Error::InvalidConfig(s.clone()),
            Error::Closed => Error::Closed,
            Error::Io(e) => Error::CommandFailed(e.to_string()),
        }
    }
}

//! A connection/command multiplexing engine for a single Redis connection,
//! built for single-threaded cooperative event loops.
//!
//! `Client` keeps one connection open, lets many commands be in flight at
//! once, and hands each command's reply back through a continuation rather
//! than a `Future` — see [`client`] for why, and [`queue`] for how commands
//! move between the pending and waiting queues that make multiplexing
//! possible without unbounded buffering.

pub mod client;
pub use client::{Client, ConnectionState};

pub mod error;
pub use error::{Error, Result};

pub mod frame;
pub use frame::Frame;

pub mod connection;
pub use connection::Connection;

pub mod handlers;
pub use handlers::{ConnectHandler, DisconnectHandler, ErrorHandler, PushHandler};

pub mod options;
pub use options::{Endpoint, Options, OptionsBuilder, Priority, ReconnectPolicy, SocketOptions, Timeouts};

pub mod queue;
pub use queue::Continuation;

pub mod reply;
pub use reply::Reply;

pub mod socket;

pub mod telemetry;

/// Default port a Redis server listens on, used when an [`Endpoint`] is
/// built without an explicit port.
pub const DEFAULT_PORT: u16 = 6379;

//! User-configurable knobs: timeouts, reconnect policy, and socket options.
//!
//! Kept as a plain, in-process builder rather than anything that reads a
//! config file or environment variables — configuration *loading* is an
//! explicit non-goal; this module only defines the shape of
//! the configuration once it has been loaded by someone else.

use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

#[cfg(feature = "tls")]
use std::sync::Arc;

/// Upper bound on any millisecond duration accepted through the public API
/// (upper-bounded at ~2x10^9 ms).
pub const MAX_MILLIS: u64 = 2_000_000_000;

pub(crate) fn clamp_millis(ms: u64) -> u64 {
    ms.min(MAX_MILLIS)
}

/// `prefer_ipv4`/`prefer_ipv6` collapsed into one field so the mutual
/// exclusivity is a type invariant: setting one
/// variant is, by construction, clearing the other.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum IpPreference {
    #[default]
    Any,
    V4,
    V6,
}

/// Socket options applied the next time the client connects.
#[derive(Clone, Debug, Default)]
pub struct SocketOptions {
    pub keepalive: Option<Duration>,
    pub tcp_user_timeout: Option<Duration>,
    pub cloexec: bool,
    pub reuseaddr: bool,
    pub ip_preference: IpPreference,
    pub source_addr: Option<IpAddr>,
    #[cfg(feature = "tls")]
    pub tls: Option<Arc<rustls::ClientConfig>>,
}

impl SocketOptions {
    pub fn set_prefer_ipv4(&mut self) {
        self.ip_preference = IpPreference::V4;
    }

    pub fn set_prefer_ipv6(&mut self) {
        self.ip_preference = IpPreference::V6;
    }
}

/// Connect and per-command timeouts, both optional and both clamped to
/// [`MAX_MILLIS`].
#[derive(Clone, Copy, Debug, Default)]
pub struct Timeouts {
    pub connect: Option<Duration>,
    pub command: Option<Duration>,
}

/// The automatic-reconnect policy and its live attempt counter.
#[derive(Clone, Copy, Debug)]
pub struct ReconnectPolicy {
    pub enabled: bool,
    pub delay: Duration,
    /// 0 means unlimited attempts.
    pub max_attempts: u32,
    pub(crate) attempt: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        ReconnectPolicy {
            enabled: false,
            delay: Duration::from_millis(0),
            max_attempts: 0,
            attempt: 0,
        }
    }
}

/// Watcher priority, clamped to `[-2, +2]`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Priority(i8);

impl Priority {
    pub const MIN: i32 = -2;
    pub const MAX: i32 = 2;

    pub fn new(value: i32) -> Priority {
        Priority(value.clamp(Self::MIN, Self::MAX) as i8)
    }

    pub fn get(self) -> i32 {
        self.0 as i32
    }
}

/// Full set of user-configurable options, assembled with [`Options::builder`]
/// before the first `connect`/`connect_unix` call.
#[derive(Clone, Debug, Default)]
pub struct Options {
    pub socket: SocketOptions,
    pub timeouts: Timeouts,
    pub reconnect: ReconnectPolicy,
    pub max_pending: u32,
    pub waiting_timeout: Duration,
    pub resume_waiting_on_reconnect: bool,
    pub priority: Priority,
}

impl Options {
    pub fn builder() -> OptionsBuilder {
        OptionsBuilder::default()
    }
}

/// Typed builder for [`Options`]. Every setter clamps/normalizes its input
/// the same way the corresponding live setter on `Client` does, so a value
/// round-trips identically whether it is set before or after `connect`.
#[derive(Clone, Debug, Default)]
pub struct OptionsBuilder {
    options: Options,
}

impl OptionsBuilder {
    pub fn connect_timeout(mut self, ms: u64) -> Self {
        self.options.timeouts.connect = Some(Duration::from_millis(clamp_millis(ms)));
        self
    }

    pub fn command_timeout(mut self, ms: u64) -> Self {
        self.options.timeouts.command = Some(Duration::from_millis(clamp_millis(ms)));
        self
    }

    pub fn max_pending(mut self, n: u32) -> Self {
        self.options.max_pending = n;
        self
    }

    pub fn waiting_timeout(mut self, ms: u64) -> Self {
        self.options.waiting_timeout = Duration::from_millis(clamp_millis(ms));
        self
    }

    pub fn resume_waiting_on_reconnect(mut self, enable: bool) -> Self {
        self.options.resume_waiting_on_reconnect = enable;
        self
    }

    pub fn reconnect(mut self, enable: bool, delay_ms: u64, max_attempts: u32) -> Self {
        self.options.reconnect = ReconnectPolicy {
            enabled: enable,
            delay: Duration::from_millis(clamp_millis(delay_ms)),
            max_attempts,
            attempt: 0,
        };
        self
    }

    pub fn priority(mut self, p: i32) -> Self {
        self.options.priority = Priority::new(p);
        self
    }

    pub fn keepalive(mut self, seconds: u64) -> Self {
        self.options.socket.keepalive = if seconds == 0 {
            None
        } else {
            Some(Duration::from_secs(seconds))
        };
        self
    }

    pub fn tcp_user_timeout(mut self, ms: u64) -> Self {
        self.options.socket.tcp_user_timeout = if ms == 0 {
            None
        } else {
            Some(Duration::from_millis(clamp_millis(ms)))
        };
        self
    }

    pub fn prefer_ipv4(mut self) -> Self {
        self.options.socket.set_prefer_ipv4();
        self
    }

    pub fn prefer_ipv6(mut self) -> Self {
        self.options.socket.set_prefer_ipv6();
        self
    }

    pub fn source_addr(mut self, addr: IpAddr) -> Self {
        self.options.socket.source_addr = Some(addr);
        self
    }

    pub fn cloexec(mut self, enable: bool) -> Self {
        self.options.socket.cloexec = enable;
        self
    }

    pub fn reuseaddr(mut self, enable: bool) -> Self {
        self.options.socket.reuseaddr = enable;
        self
    }

    #[cfg(feature = "tls")]
    pub fn tls(mut self, config: Arc<rustls::ClientConfig>) -> Self {
        self.options.socket.tls = Some(config);
        self
    }

    pub fn build(self) -> Options {
        self.options
    }
}

/// Where the client connects to. `host`/`port` and a unix `path` are
/// mutually exclusive.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Endpoint {
    Tcp { host: String, port: u16 },
    Unix { path: PathBuf },
}

impl Endpoint {
    pub fn tcp(host: impl Into<String>, port: u16) -> Endpoint {
        Endpoint::Tcp {
            host: host.into(),
            port,
        }
    }

    pub fn unix(path: impl Into<PathBuf>) -> Endpoint {
        Endpoint::Unix { path: path.into() }
    }
}

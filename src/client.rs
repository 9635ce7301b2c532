//! The connection controller: state machine, reply dispatcher, and the
//! `Client` handle applications hold.
//!
//! `Client` wraps an `Rc<RefCell<Shared>>` rather than an `Arc<Mutex<_>>` —
//! a deliberate strengthening of the engine's "not thread-safe" contract into
//! a type-level guarantee. The socket and framing live outside the
//! `RefCell`, owned by the task `run()` spawns, so a read or write await
//! point never holds `Shared` borrowed; only short, synchronous sections
//! touch the `RefCell`, and every continuation is invoked after the borrow
//! guard for that section has already been dropped. That discipline is
//! what makes `submit`-from-inside-a-continuation safe without the
//! callback-depth/deferred-free machinery a C implementation needs.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::net::IpAddr;
use std::rc::Rc;
use std::time::{Duration, Instant};

#[cfg(feature = "tls")]
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::Notify;
use tokio::time::sleep;

use crate::connection::Connection;
use crate::error::Error;
use crate::frame::Frame;
use crate::handlers::{call_guarded, ConnectHandler, DisconnectHandler, ErrorHandler, PushHandler};
use crate::options::{self, Endpoint, IpPreference, Options, ReconnectPolicy};
use crate::queue::{self, Continuation, PendingEntry, Queues, WaitingEntry};
use crate::reply::{self, Reply};
use crate::socket::{self, Stream};

/// Connection lifecycle states.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Connected,
    Disconnecting,
    ReconnectPending,
}

struct Shared {
    state: ConnectionState,
    endpoint: Option<Endpoint>,
    options: Options,
    queues: Queues,
    write_queue: VecDeque<Frame>,
    /// Wakes `drive_connection`'s `select!` when `submit`/promotion appends
    /// to `write_queue` while it is parked on the read/timer branches.
    write_notify: Rc<Notify>,
    closed: bool,
    /// Bumped by every `start()` call. The run task captures its value at
    /// spawn time and compares it before every state mutation or handler
    /// invocation, so a task superseded by a newer `connect()` call (its
    /// socket errors or replies arriving late) can never clobber the
    /// connection that replaced it — the "stale disconnect callback"
    /// hazard a reconnecting client has to guard against.
    generation: u64,
    on_connect: Option<ConnectHandler>,
    on_disconnect: Option<DisconnectHandler>,
    on_error: Option<ErrorHandler>,
    on_push: Option<PushHandler>,
}

impl Shared {
    fn new(options: Options) -> Shared {
        Shared {
            state: ConnectionState::Idle,
            endpoint: None,
            options,
            queues: Queues::new(),
            write_queue: VecDeque::new(),
            write_notify: Rc::new(Notify::new()),
            closed: false,
            generation: 0,
            on_connect: None,
            on_disconnect: None,
            on_error: None,
            on_push: None,
        }
    }
}

/// Drains every continuation still owed an answer and fails it, so a
/// `Client` going out of scope never silently drops work in flight
/// (the "destruction" case of the connection lifecycle).
impl Drop for Shared {
    fn drop(&mut self) {
        let (pending, waiting) = self.queues.drain_all();
        for mut cb in pending.into_iter().chain(waiting) {
            call_guarded("continuation on drop", || cb(Err(Error::Disconnected)));
        }
    }
}

/// A handle to the multiplexed connection. Cheap to clone — every clone
/// shares the same underlying engine through `Rc`.
#[derive(Clone)]
pub struct Client {
    shared: Rc<RefCell<Shared>>,
}

impl Client {
    pub fn new(options: Options) -> Client {
        Client {
            shared: Rc::new(RefCell::new(Shared::new(options))),
        }
    }

    pub fn with_default_options() -> Client {
        Client::new(Options::default())
    }

    // -- handler registration -------------------------------------------------
    //
    // Each setter replaces (or, given `None`, clears) the handler and returns
    // whatever was previously installed, per spec.md §6's
    // "set_on_error/connect/disconnect/push(cb or null) ... Replace or clear;
    // returns previous or null" contract.

    pub fn set_on_connect(&self, handler: Option<ConnectHandler>) -> Option<ConnectHandler> {
        std::mem::replace(&mut self.shared.borrow_mut().on_connect, handler)
    }

    pub fn set_on_disconnect(&self, handler: Option<DisconnectHandler>) -> Option<DisconnectHandler> {
        std::mem::replace(&mut self.shared.borrow_mut().on_disconnect, handler)
    }

    pub fn set_on_error(&self, handler: Option<ErrorHandler>) -> Option<ErrorHandler> {
        std::mem::replace(&mut self.shared.borrow_mut().on_error, handler)
    }

    pub fn set_on_push(&self, handler: Option<PushHandler>) -> Option<PushHandler> {
        std::mem::replace(&mut self.shared.borrow_mut().on_push, handler)
    }

    // -- option setters (live: take effect on the next connect/command) ------

    pub fn set_connect_timeout(&self, timeout: Option<Duration>) {
        self.shared.borrow_mut().options.timeouts.connect = timeout;
    }

    pub fn set_command_timeout(&self, timeout: Option<Duration>) {
        self.shared.borrow_mut().options.timeouts.command = timeout;
    }

    pub fn set_max_pending(&self, max_pending: u32) {
        let mut shared = self.shared.borrow_mut();
        shared.options.max_pending = max_pending;
        self.promote_waiting_locked(&mut shared);
    }

    pub fn set_waiting_timeout(&self, timeout: Duration) {
        self.shared.borrow_mut().options.waiting_timeout = timeout;
    }

    pub fn set_resume_waiting_on_reconnect(&self, resume: bool) {
        self.shared.borrow_mut().options.resume_waiting_on_reconnect = resume;
    }

    pub fn set_reconnect(&self, enabled: bool, delay: Duration, max_attempts: u32) {
        let mut shared = self.shared.borrow_mut();
        shared.options.reconnect = ReconnectPolicy {
            enabled,
            delay,
            max_attempts,
            attempt: 0,
        };
    }

    pub fn set_priority(&self, priority: i32) {
        self.shared.borrow_mut().options.priority = crate::options::Priority::new(priority);
    }

    // -- socket option setters (live: applied at the next connect) -----------
    //
    // Mirror `OptionsBuilder`'s one-shot construction-time equivalents, per
    // spec.md §6's "socket-option accessors; apply at next connect unless
    // noted" row — these let an already-constructed `Client` change its
    // socket tuning ahead of a reconnect, not just at `Client::new`.

    pub fn set_keepalive(&self, seconds: u64) {
        let mut shared = self.shared.borrow_mut();
        shared.options.socket.keepalive = if seconds == 0 {
            None
        } else {
            Some(Duration::from_secs(seconds))
        };
    }

    pub fn set_tcp_user_timeout(&self, ms: u64) {
        let mut shared = self.shared.borrow_mut();
        shared.options.socket.tcp_user_timeout = if ms == 0 {
            None
        } else {
            Some(Duration::from_millis(options::clamp_millis(ms)))
        };
    }

    /// Setting `prefer_ipv4` clears `prefer_ipv6`, and vice versa — the two
    /// are mutually exclusive by construction (`IpPreference`).
    pub fn set_prefer_ipv4(&self) {
        self.shared.borrow_mut().options.socket.set_prefer_ipv4();
    }

    pub fn set_prefer_ipv6(&self) {
        self.shared.borrow_mut().options.socket.set_prefer_ipv6();
    }

    pub fn set_source_addr(&self, addr: Option<IpAddr>) {
        self.shared.borrow_mut().options.socket.source_addr = addr;
    }

    pub fn set_cloexec(&self, enable: bool) {
        self.shared.borrow_mut().options.socket.cloexec = enable;
    }

    pub fn set_reuseaddr(&self, enable: bool) {
        self.shared.borrow_mut().options.socket.reuseaddr = enable;
    }

    #[cfg(feature = "tls")]
    pub fn set_tls(&self, config: Option<Arc<rustls::ClientConfig>>) {
        self.shared.borrow_mut().options.socket.tls = config;
    }

    // -- observers -------------------------------------------------------------

    pub fn is_connected(&self) -> bool {
        self.shared.borrow().state == ConnectionState::Connected
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.borrow().state
    }

    pub fn pending_count(&self) -> u32 {
        self.shared.borrow().queues.pending_count()
    }

    pub fn waiting_count(&self) -> u32 {
        self.shared.borrow().queues.waiting_count()
    }

    pub fn reconnect_enabled(&self) -> bool {
        self.shared.borrow().options.reconnect.enabled
    }

    pub fn has_tls(&self) -> bool {
        #[cfg(feature = "tls")]
        {
            self.shared.borrow().options.socket.tls.is_some()
        }
        #[cfg(not(feature = "tls"))]
        {
            false
        }
    }

    // -- option getters (setter -> getter round-trip, spec.md §8) ------------

    pub fn priority(&self) -> i32 {
        self.shared.borrow().options.priority.get()
    }

    pub fn connect_timeout(&self) -> Option<Duration> {
        self.shared.borrow().options.timeouts.connect
    }

    pub fn command_timeout(&self) -> Option<Duration> {
        self.shared.borrow().options.timeouts.command
    }

    pub fn max_pending(&self) -> u32 {
        self.shared.borrow().options.max_pending
    }

    pub fn waiting_timeout(&self) -> Duration {
        self.shared.borrow().options.waiting_timeout
    }

    pub fn resume_waiting_on_reconnect(&self) -> bool {
        self.shared.borrow().options.resume_waiting_on_reconnect
    }

    pub fn keepalive(&self) -> Option<Duration> {
        self.shared.borrow().options.socket.keepalive
    }

    pub fn tcp_user_timeout(&self) -> Option<Duration> {
        self.shared.borrow().options.socket.tcp_user_timeout
    }

    pub fn ip_preference(&self) -> IpPreference {
        self.shared.borrow().options.socket.ip_preference
    }

    pub fn source_addr(&self) -> Option<IpAddr> {
        self.shared.borrow().options.socket.source_addr
    }

    pub fn cloexec(&self) -> bool {
        self.shared.borrow().options.socket.cloexec
    }

    pub fn reuseaddr(&self) -> bool {
        self.shared.borrow().options.socket.reuseaddr
    }

    // -- connecting --------------------------------------------------------

    /// Connects over TCP and spawns the engine's run loop onto the current
    /// `LocalSet`. Non-blocking: success and failure are reported through
    /// the `on_connect`/`on_error`/`on_disconnect` handlers, matching the
    /// continuation style the rest of the public API uses.
    pub fn connect(&self, host: impl Into<String>, port: u16) {
        self.start(Endpoint::tcp(host, port));
    }

    /// Connects over a Unix-domain socket. Fails synchronously with
    /// [`Error::InvalidConfig`] if TLS is configured — TLS requires a
    /// `host` to validate the server's certificate against, and a unix path
    /// has none (spec.md §6: "TLS requires `host`... rejected combinations
    /// fail at construction time").
    pub fn connect_unix(&self, path: impl Into<std::path::PathBuf>) -> crate::Result<()> {
        #[cfg(feature = "tls")]
        if self.shared.borrow().options.socket.tls.is_some() {
            return Err(Error::InvalidConfig(
                "TLS requires a TCP host; it cannot be used with a unix socket path".to_string(),
            ));
        }
        self.start(Endpoint::unix(path));
        Ok(())
    }

    fn start(&self, endpoint: Endpoint) {
        let generation = {
            let mut shared = self.shared.borrow_mut();
            shared.endpoint = Some(endpoint);
            shared.state = ConnectionState::Connecting;
            shared.options.reconnect.attempt = 0;
            // A prior disconnect() latches `closed` to stop its own run()
            // task; a fresh connect()/connect_unix() call must clear it so
            // the newly spawned task doesn't see a stale "closed" flag and
            // exit immediately.
            shared.closed = false;
            shared.generation += 1;
            shared.generation
        };
        let client = self.clone();
        tokio::task::spawn_local(async move {
            client.run(generation).await;
        });
    }

    /// Closes the connection. The first call fails every pending command
    /// with [`Error::Disconnected`] and, unless a waiting queue carry-over
    /// is in progress, every waiting command with [`Error::Skipped`]. A
    /// second call while already disconnecting is a no-op — this mirrors
    /// the re-entrancy guard `Queues::cancel_waiting` provides at the queue
    /// level.
    pub fn disconnect(&self) {
        let was_connected = {
            let mut shared = self.shared.borrow_mut();
            if shared.state == ConnectionState::Idle || shared.closed {
                return;
            }
            shared.closed = true;
            shared.options.reconnect.enabled = false;
            shared.state = ConnectionState::Disconnecting;
            true
        };
        if was_connected {
            tracing::info!("disconnect requested");
            self.fail_all(None);
            // Wakes a `drive_connection` select parked on the read/timer
            // branches so it notices `closed` and drops the socket instead
            // of holding the connection (and the background task) open
            // indefinitely.
            self.shared.borrow().write_notify.notify_one();
        }
    }

    pub fn cancel_waiting(&self) {
        let drained = self.shared.borrow_mut().queues.cancel_waiting();
        for mut cb in drained {
            call_guarded("waiting continuation", || cb(Err(Error::Skipped)));
        }
    }

    pub fn cancel_all(&self) {
        self.shared.borrow_mut().queues.mark_all_pending_skipped();
        self.cancel_waiting();
    }

    // -- submission ----------------------------------------------------------

    /// Admits a command. Returns synchronously; the reply (or failure)
    /// arrives through `cb`. If the connection is up and there is pending
    /// queue room, the command is admitted as pending and its frame queued
    /// for the engine to write; otherwise it joins the waiting queue.
    pub fn submit(&self, args: Vec<Bytes>, cb: Continuation) {
        if args.is_empty() {
            let mut cb = cb;
            call_guarded("submit continuation", || {
                cb(Err(Error::InvalidArgument("empty command".to_string())))
            });
            return;
        }

        let mut shared = self.shared.borrow_mut();
        if shared.closed {
            drop(shared);
            let mut cb = cb;
            call_guarded("submit continuation", || cb(Err(Error::Closed)));
            return;
        }

        // spec.md §4.3(a): reject synchronously unless a connection is
        // active (Connecting/Connected) or an automatic reconnect is in
        // progress (ReconnectPending). `Idle` covers both "never connected"
        // and "explicitly disconnected" — neither buffers work indefinitely.
        let connection_active_or_reconnecting = matches!(
            shared.state,
            ConnectionState::Connecting | ConnectionState::Connected | ConnectionState::ReconnectPending
        );
        if !connection_active_or_reconnecting {
            drop(shared);
            let mut cb = cb;
            call_guarded("submit continuation", || cb(Err(Error::Disconnected)));
            return;
        }

        let persist = queue::is_persistent_command(&args[0]);
        let can_send_now =
            shared.state == ConnectionState::Connected && shared.queues.can_admit_pending(shared.options.max_pending);

        if can_send_now {
            let sub_count = if persist {
                queue::initial_sub_count(&args[0], args.len())
            } else {
                0
            };
            // Persistent (subscribe-family) commands are long-lived by
            // design and never time out on a reply.
            let deadline = if persist {
                None
            } else {
                shared.options.timeouts.command.map(|d| Instant::now() + d)
            };
            let frame = queue::encode_command(&args);
            shared.queues.push_pending(PendingEntry {
                cb,
                persist,
                sub_count,
                skipped: false,
                deadline,
            });
            shared.write_queue.push_back(frame);
            shared.write_notify.notify_one();
        } else {
            shared.queues.push_waiting(WaitingEntry {
                args,
                cb,
                persist,
                queued_at: Instant::now(),
            });
        }
    }

    // -- engine driver ---------------------------------------------------------

    async fn run(&self, generation: u64) {
        loop {
            let endpoint = match self.shared.borrow().endpoint.clone() {
                Some(e) => e,
                None => return,
            };
            {
                let mut shared = self.shared.borrow_mut();
                if shared.closed || shared.generation != generation {
                    return;
                }
                shared.state = ConnectionState::Connecting;
            }

            let connect_timeout = self.shared.borrow().options.timeouts.connect;
            let socket_options = self.shared.borrow().options.socket.clone();

            let connect_fut = socket::connect(&endpoint, &socket_options);
            let connected = match connect_timeout {
                Some(timeout) => match tokio::time::timeout(timeout, connect_fut).await {
                    Ok(result) => result,
                    Err(_) => Err(Error::connect_failed("connect timed out")),
                },
                None => connect_fut.await,
            };

            let stream = match connected {
                Ok(stream) => stream,
                Err(e) => {
                    tracing::warn!(endpoint = ?endpoint, error = %e, "connect failed");
                    if self.after_connect_failure(e, generation) {
                        self.wait_for_reconnect_delay().await;
                        continue;
                    }
                    return;
                }
            };

            {
                let shared = self.shared.borrow();
                if shared.closed || shared.generation != generation {
                    // disconnect() raced with a connect that was already in
                    // flight, or a newer connect() call already superseded
                    // this one; the socket just opened is discarded unused
                    // rather than being promoted to the live connection.
                    return;
                }
            }

            tracing::info!(endpoint = ?endpoint, "connected");
            self.on_connected(generation);
            let keep_running = self.drive_connection(Connection::new(stream), generation).await;
            if keep_running {
                self.wait_for_reconnect_delay().await;
                continue;
            }
            return;
        }
    }

    async fn wait_for_reconnect_delay(&self) {
        let delay = self.shared.borrow().options.reconnect.delay;
        sleep(delay).await;
    }

    fn on_connected(&self, generation: u64) {
        let mut shared = self.shared.borrow_mut();
        if shared.generation != generation {
            return;
        }
        shared.state = ConnectionState::Connected;
        shared.options.reconnect.attempt = 0;
        let resume = shared.options.resume_waiting_on_reconnect;
        if !resume {
            let drained = shared.queues.drain_waiting();
            drop(shared);
            for mut cb in drained {
                call_guarded("waiting continuation", || cb(Err(Error::Skipped)));
            }
            shared = self.shared.borrow_mut();
        }
        self.promote_waiting_locked(&mut shared);
        let handler = shared.on_connect.take();
        drop(shared);
        if let Some(mut handler) = handler {
            call_guarded("on_connect", || handler());
            self.shared.borrow_mut().on_connect = Some(handler);
        }
    }

    /// Moves as many waiting commands into the pending queue/write queue as
    /// flow control allows. Iterative, not recursive, so a long waiting
    /// queue can't blow the stack.
    fn promote_waiting_locked(&self, shared: &mut Shared) {
        while shared.state == ConnectionState::Connected
            && shared.queues.can_admit_pending(shared.options.max_pending)
        {
            let Some(entry) = shared.queues.pop_waiting() else {
                break;
            };
            let sub_count = if entry.persist {
                queue::initial_sub_count(&entry.args[0], entry.args.len())
            } else {
                0
            };
            let deadline = if entry.persist {
                None
            } else {
                shared.options.timeouts.command.map(|d| Instant::now() + d)
            };
            let frame = queue::encode_command(&entry.args);
            shared.queues.push_pending(PendingEntry {
                cb: entry.cb,
                persist: entry.persist,
                sub_count,
                skipped: false,
                deadline,
            });
            shared.write_queue.push_back(frame);
            shared.write_notify.notify_one();
        }
    }

    /// Returns `true` if the caller should retry connecting.
    fn after_connect_failure(&self, err: Error, generation: u64) -> bool {
        if self.shared.borrow().generation != generation {
            return false;
        }
        let mut shared = self.shared.borrow_mut();
        let handler = shared.on_error.take();
        drop(shared);
        if let Some(mut handler) = handler {
            call_guarded("on_error", || handler(err));
            self.shared.borrow_mut().on_error = Some(handler);
        }
        self.schedule_reconnect_or_stop(generation)
    }

    async fn drive_connection(&self, mut conn: Connection<Stream>, generation: u64) -> bool {
        let waiting_timeout = self.shared.borrow().options.waiting_timeout;
        let write_notify = self.shared.borrow().write_notify.clone();

        loop {
            if self.shared.borrow().generation != generation {
                return false;
            }

            let next_write = {
                let mut shared = self.shared.borrow_mut();
                shared.write_queue.pop_front()
            };
            if let Some(frame) = next_write {
                if let Err(e) = conn.write_frame(&frame).await {
                    return self.handle_broken_connection(Error::CommandFailed(e.to_string()), generation);
                }
                continue;
            }

            let waiting_deadline = self.shared.borrow().queues.next_waiting_deadline(waiting_timeout);
            let pending_deadline = self.shared.borrow().queues.next_pending_deadline();
            // One shared timer drives both sweeps: whichever of the waiting
            // queue's or the pending queue's next deadline comes first wakes
            // the select, and the branch below re-checks both so a single
            // wakeup can't starve the other if they're close together.
            let sweep_deadline = match (waiting_deadline, pending_deadline) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (a, b) => a.or(b),
            };
            let sleep_until = sweep_deadline.unwrap_or_else(|| Instant::now() + Duration::from_secs(3600));

            tokio::select! {
                biased;

                frame = conn.read_frame() => {
                    if self.shared.borrow().generation != generation {
                        return false;
                    }
                    match frame {
                        Ok(Some(frame)) => self.dispatch_reply(frame),
                        Ok(None) => return self.handle_broken_connection(Error::Disconnected, generation),
                        Err(e) => return self.handle_broken_connection(e, generation),
                    }
                }

                _ = sleep_until_instant(sleep_until), if sweep_deadline.is_some() => {
                    if self.shared.borrow().generation != generation {
                        return false;
                    }
                    self.sweep_waiting_timeouts(waiting_timeout);
                    self.sweep_pending_timeouts();
                }

                _ = write_notify.notified() => {
                    // A submit() landed a frame while we were parked here, or
                    // disconnect()/a superseding connect() woke us up to
                    // notice the state/generation change below.
                }
            }

            let shared = self.shared.borrow();
            if shared.generation != generation || shared.state != ConnectionState::Connected {
                return false;
            }
        }
    }

    fn sweep_waiting_timeouts(&self, timeout: Duration) {
        let now = Instant::now();
        let expired = self.shared.borrow_mut().queues.expire_waiting(now, timeout);
        for mut cb in expired {
            call_guarded("waiting continuation", || cb(Err(Error::WaitingTimeout)));
        }
    }

    /// Fails every pending entry whose `command_timeout` deadline has
    /// passed, without removing it from the queue — the server's real reply
    /// still has to be consumed off the wire to keep framing in sync, it
    /// just no longer reaches the caller.
    fn sweep_pending_timeouts(&self) {
        let now = Instant::now();
        let expired = self.shared.borrow_mut().queues.expire_pending(now);
        for mut cb in expired {
            call_guarded("command continuation", || cb(Err(Error::CommandFailed("command timed out".to_string()))));
        }
    }

    fn dispatch_reply(&self, frame: Frame) {
        // A RESP3 push frame never consumes a queue entry (spec.md §4.4),
        // regardless of what else is in flight: route it to the push
        // handler whenever the queue is empty OR the front entry isn't a
        // persistent (subscribe-family) command. Only a persistent entry's
        // *own* traffic is allowed to fall through to the reply-matching
        // path below, since for RESP2 subscriptions the message frames
        // arrive shaped exactly like `Frame::Array`, not `Frame::Push`, and
        // still need to reach `invoke_front_pending`.
        if matches!(frame, Frame::Push(_)) {
            let front_is_persistent = self
                .shared
                .borrow_mut()
                .queues
                .front_pending_mut()
                .map(|e| e.persist)
                .unwrap_or(false);
            if !front_is_persistent {
                self.emit_push(frame);
                return;
            }
        }

        let is_unsub = reply::is_unsubscribe_marker(&frame);
        let is_err = reply::is_error(&frame);

        let mut shared = self.shared.borrow_mut();
        if shared.queues.pending_len() == 0 {
            drop(shared);
            self.emit_push(frame);
            return;
        }

        let persist = shared.queues.front_pending_mut().map(|e| e.persist).unwrap_or(false);

        if persist {
            let (skipped, sub_count) = {
                let entry = shared.queues.front_pending_mut().unwrap();
                if is_unsub {
                    entry.sub_count = entry.sub_count.saturating_sub(1);
                }
                (entry.skipped, entry.sub_count)
            };
            let done = is_unsub && sub_count == 0;
            let mut cb_to_run: Option<Continuation> = None;
            if done {
                let entry = shared.queues.pop_front_pending().unwrap();
                if !skipped {
                    cb_to_run = Some(entry.cb);
                }
            } else if !skipped {
                // Borrow the live entry's `cb` long enough to invoke it
                // in place; persistent entries are never popped until
                // their subscriptions are all gone.
                drop(shared);
                let value = decode_value(&frame, is_err);
                self.invoke_front_pending(value);
                return;
            }
            drop(shared);
            if let Some(mut cb) = cb_to_run {
                let value = decode_value(&frame, is_err);
                call_guarded("command continuation", || cb(value));
            }
            return;
        }

        let entry = shared.queues.pop_front_pending().unwrap();
        self.promote_waiting_locked(&mut shared);
        drop(shared);

        if !entry.skipped {
            let mut cb = entry.cb;
            let value = decode_value(&frame, is_err);
            call_guarded("command continuation", || cb(value));
        }
    }

    /// Invokes the current head-of-pending continuation in place, used only
    /// for a persistent entry's non-terminal replies (regular subscribed
    /// messages). The entry stays at the front of the queue afterward.
    fn invoke_front_pending(&self, value: std::result::Result<Reply, Error>) {
        let mut shared = self.shared.borrow_mut();
        let entry = match shared.queues.front_pending_mut() {
            Some(e) => e,
            None => return,
        };
        // Take the closure out from behind the RefCell for the duration of
        // the call, then put it back: the continuation must be able to call
        // back into `submit`/`cancel_*` without re-entering this borrow.
        let mut cb = std::mem::replace(&mut entry.cb, Box::new(|_| {}));
        drop(shared);
        call_guarded("command continuation", || cb(value));
        if let Some(entry) = self.shared.borrow_mut().queues.front_pending_mut() {
            entry.cb = cb;
        }
    }

    fn emit_push(&self, frame: Frame) {
        let mut shared = self.shared.borrow_mut();
        let handler = shared.on_push.take();
        drop(shared);
        if let Some(mut handler) = handler {
            let value = reply::decode(&frame);
            call_guarded("on_push", || handler(value));
            self.shared.borrow_mut().on_push = Some(handler);
        }
    }

    /// Handles the connection dropping while commands may still be
    /// in-flight: fails pending work, fires `on_disconnect`, and decides
    /// whether the run loop should attempt to reconnect.
    fn handle_broken_connection(&self, err: Error, generation: u64) -> bool {
        if self.shared.borrow().generation != generation {
            return false;
        }
        tracing::warn!(error = %err, "connection lost");
        let (pending, waiting) = {
            let mut shared = self.shared.borrow_mut();
            let resume = shared.options.resume_waiting_on_reconnect;
            let pending = shared.queues.drain_pending();
            let waiting = if resume { Vec::new() } else { shared.queues.drain_waiting() };
            shared.state = ConnectionState::Disconnecting;
            (pending, waiting)
        };
        for mut cb in pending.into_iter().chain(waiting) {
            call_guarded("continuation on disconnect", || cb(Err(err.clone())));
        }

        let handler = self.shared.borrow_mut().on_disconnect.take();
        if let Some(mut handler) = handler {
            call_guarded("on_disconnect", || handler(Some(err.clone())));
            self.shared.borrow_mut().on_disconnect = Some(handler);
        }

        self.schedule_reconnect_or_stop(generation)
    }

    /// Fails every outstanding command, used by an explicit `disconnect()`
    /// (as opposed to a transport failure, which goes through
    /// `handle_broken_connection`).
    fn fail_all(&self, err: Option<Error>) {
        let (pending, waiting) = self.shared.borrow_mut().queues.drain_all();
        let error = err.clone().unwrap_or(Error::Disconnected);
        for mut cb in pending {
            call_guarded("continuation on disconnect", || cb(Err(error.clone())));
        }
        for mut cb in waiting {
            call_guarded("waiting continuation", || cb(Err(Error::Skipped)));
        }

        let handler = self.shared.borrow_mut().on_disconnect.take();
        if let Some(mut handler) = handler {
            call_guarded("on_disconnect", || handler(err.clone()));
            self.shared.borrow_mut().on_disconnect = Some(handler);
        }
        self.shared.borrow_mut().state = ConnectionState::Idle;
    }

    /// Returns `true` if a reconnect attempt should follow (caller loops
    /// back into `run`), `false` if the engine should stop entirely.
    fn schedule_reconnect_or_stop(&self, generation: u64) -> bool {
        let mut shared = self.shared.borrow_mut();
        if shared.generation != generation {
            return false;
        }
        if shared.closed || !shared.options.reconnect.enabled {
            shared.state = ConnectionState::Idle;
            return false;
        }

        let max_attempts = shared.options.reconnect.max_attempts;
        shared.options.reconnect.attempt += 1;
        if max_attempts != 0 && shared.options.reconnect.attempt > max_attempts {
            shared.state = ConnectionState::Idle;
            shared.options.reconnect.enabled = false;
            let waiting = shared.queues.drain_waiting();
            let handler = shared.on_error.take();
            drop(shared);
            for mut cb in waiting {
                call_guarded("waiting continuation", || cb(Err(Error::reconnect_exhausted())));
            }
            if let Some(mut handler) = handler {
                call_guarded("on_error", || handler(Error::reconnect_exhausted()));
                self.shared.borrow_mut().on_error = Some(handler);
            }
            return false;
        }

        shared.state = ConnectionState::ReconnectPending;
        tracing::debug!(
            attempt = shared.options.reconnect.attempt,
            delay = ?shared.options.reconnect.delay,
            "scheduling reconnect"
        );
        true
    }
}

fn decode_value(frame: &Frame, is_err: bool) -> std::result::Result<Reply, Error> {
    if is_err {
        Err(Error::Redis(reply::error_text(frame)))
    } else {
        Ok(reply::decode(frame))
    }
}

async fn sleep_until_instant(instant: Instant) {
    let now = Instant::now();
    if instant > now {
        sleep(instant - now).await;
    }
}

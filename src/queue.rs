//! The two-tier command queue: *pending* commands already sent to the
//! server and awaiting a reply, and *waiting* commands admitted locally but
//! not yet sent because of flow control or a disconnected socket.
//!
//! This module only manages the queues themselves — admission bookkeeping,
//! persistent-command detection, and waiting-timeout expiry. It knows
//! nothing about sockets or reconnection; [`crate::client`] wires it to
//! those.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use bytes::Bytes;

use crate::error::Error;
use crate::frame::Frame;
use crate::reply::Reply;

/// A command continuation. Boxed as `FnMut` rather than `FnOnce` so the
/// same type serves both ordinary commands (invoked once) and persistent
/// subscriptions (invoked once per server push until the subscription ends).
pub type Continuation = Box<dyn FnMut(std::result::Result<Reply, Error>) + 'static>;

/// An in-flight command: already written to the socket, waiting for its
/// reply to come back in order.
pub struct PendingEntry {
    pub cb: Continuation,
    /// `true` for subscribe-family commands, which receive many replies for
    /// one submission.
    pub persist: bool,
    /// Remaining subscription slots for a persistent entry. Never consulted
    /// for non-persistent entries.
    pub sub_count: u32,
    /// Set by `cancel_all` or a `command_timeout` expiry: suppresses the
    /// continuation when this entry's reply eventually arrives, without
    /// violating queue ordering. Once set, the entry is no longer counted in
    /// `pending_count` (its continuation has already fired for the last
    /// time, so the submission is "complete" from an outside observer's
    /// point of view even though it stays queued until the real reply drains
    /// it).
    pub skipped: bool,
    /// When this command's reply is due, per `Options::timeouts.command`.
    /// `None` when no command timeout is configured. Never set for
    /// persistent (subscribe-family) entries, which are long-lived by
    /// design.
    pub deadline: Option<Instant>,
}

/// A command admitted locally but not yet sent to the server.
pub struct WaitingEntry {
    pub args: Vec<Bytes>,
    pub cb: Continuation,
    pub persist: bool,
    pub queued_at: Instant,
}

/// Case-insensitive match on `{subscribe, psubscribe, ssubscribe, monitor}`.
pub fn is_persistent_command(name: &[u8]) -> bool {
    name.eq_ignore_ascii_case(b"subscribe")
        || name.eq_ignore_ascii_case(b"psubscribe")
        || name.eq_ignore_ascii_case(b"ssubscribe")
        || name.eq_ignore_ascii_case(b"monitor")
}

/// `sub_count = channels` for subscribe-family commands (one slot per
/// channel argument), `0` for `monitor` (never decremented).
pub fn initial_sub_count(name: &[u8], arg_count: usize) -> u32 {
    if name.eq_ignore_ascii_case(b"monitor") {
        0
    } else {
        arg_count.saturating_sub(1) as u32
    }
}

/// Encodes `args` (command name first) as the RESP array-of-bulk-strings
/// frame Redis expects on the wire.
pub fn encode_command(args: &[Bytes]) -> Frame {
    let mut frame = Frame::array();
    for arg in args {
        frame.push_bulk(arg.clone());
    }
    frame
}

/// Owns both queues and the counters/flags defined over them.
#[derive(Default)]
pub struct Queues {
    pending: VecDeque<PendingEntry>,
    waiting: VecDeque<WaitingEntry>,
    /// Count of *non-persistent* pending entries.
    pending_count: u32,
    in_pending_cleanup: bool,
    in_waiting_cleanup: bool,
}

impl Queues {
    pub fn new() -> Queues {
        Queues::default()
    }

    pub fn pending_count(&self) -> u32 {
        self.pending_count
    }

    pub fn waiting_count(&self) -> u32 {
        self.waiting.len() as u32
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn has_waiting(&self) -> bool {
        !self.waiting.is_empty()
    }

    /// `true` when a new pending admission would not exceed `max_pending`
    /// (`0` means unlimited). Does not mutate anything (checked on
    /// admission, not on reply arrival).
    pub fn can_admit_pending(&self, max_pending: u32) -> bool {
        max_pending == 0 || self.pending_count < max_pending
    }

    /// Appends `entry` to the pending queue and, unless it is persistent,
    /// increments `pending_count`.
    pub fn push_pending(&mut self, entry: PendingEntry) {
        if !entry.persist {
            self.pending_count += 1;
        }
        self.pending.push_back(entry);
    }

    /// Appends `entry` to the waiting queue, stamped with `queued_at`.
    pub fn push_waiting(&mut self, entry: WaitingEntry) {
        self.waiting.push_back(entry);
    }

    /// Removes and returns the head of the waiting queue, for promotion
    /// into pending.
    pub fn pop_waiting(&mut self) -> Option<WaitingEntry> {
        self.waiting.pop_front()
    }

    /// Removes the head pending entry, decrementing `pending_count` if it
    /// was non-persistent *and* hadn't already been decremented by an
    /// earlier skip/timeout. Used once a non-persistent reply has been fully
    /// handled, or a persistent entry's subscriptions have all ended.
    pub fn pop_front_pending(&mut self) -> Option<PendingEntry> {
        let entry = self.pending.pop_front();
        if let Some(e) = &entry {
            if !e.persist && !e.skipped {
                self.pending_count = self.pending_count.saturating_sub(1);
            }
        }
        entry
    }

    pub fn front_pending_mut(&mut self) -> Option<&mut PendingEntry> {
        self.pending.front_mut()
    }

    /// Earliest `queued_at + timeout` across the waiting queue, if any.
    /// Relies on FIFO order implying a monotonically increasing `queued_at`
    /// from head to tail.
    pub fn next_waiting_deadline(&self, timeout: Duration) -> Option<Instant> {
        self.waiting.front().map(|e| e.queued_at + timeout)
    }

    /// Earliest still-live `command_timeout` deadline across the pending
    /// queue, ignoring entries already skipped or persistent. Unlike the
    /// waiting queue, pending entries are not guaranteed monotonic in
    /// deadline order — `command_timeout` can change live between two
    /// admissions — so this scans the whole queue rather than just the head.
    pub fn next_pending_deadline(&self) -> Option<Instant> {
        self.pending
            .iter()
            .filter(|e| !e.skipped && !e.persist)
            .filter_map(|e| e.deadline)
            .min()
    }

    /// Fails (without removing — queue order must track the server's actual
    /// reply stream) every non-persistent, not-yet-skipped pending entry
    /// whose `command_timeout` deadline has passed. The entry stays queued
    /// so the eventual real reply is still consumed and matched up
    /// correctly; `skipped` suppresses invoking its continuation a second
    /// time. Decrements `pending_count` for each entry expired here, since
    /// its continuation has now fired for the last time.
    pub fn expire_pending(&mut self, now: Instant) -> Vec<Continuation> {
        let mut expired = Vec::new();
        let mut newly_skipped = 0u32;
        for entry in self.pending.iter_mut() {
            if entry.skipped || entry.persist {
                continue;
            }
            if entry.deadline.is_some_and(|deadline| now >= deadline) {
                entry.skipped = true;
                newly_skipped += 1;
                expired.push(std::mem::replace(&mut entry.cb, Box::new(|_| {})));
            }
        }
        self.pending_count = self.pending_count.saturating_sub(newly_skipped);
        expired
    }

    /// Walks the waiting queue from the head, removing every entry whose
    /// age has reached `timeout`, stopping at the first entry that hasn't.
    /// Returns the removed continuations so the caller can invoke them
    /// outside of any borrow held here.
    pub fn expire_waiting(&mut self, now: Instant, timeout: Duration) -> Vec<Continuation> {
        let mut expired = Vec::new();
        while let Some(front) = self.waiting.front() {
            if now.saturating_duration_since(front.queued_at) >= timeout {
                let entry = self.waiting.pop_front().unwrap();
                expired.push(entry.cb);
            } else {
                break;
            }
        }
        expired
    }

    /// Fails every waiting entry with `"skipped"` and clears the queue.
    /// Idempotent: a re-entrant call while already draining short-circuits.
    pub fn cancel_waiting(&mut self) -> Vec<Continuation> {
        if self.in_waiting_cleanup {
            return Vec::new();
        }
        self.in_waiting_cleanup = true;
        let drained: Vec<Continuation> = self.waiting.drain(..).map(|e| e.cb).collect();
        self.in_waiting_cleanup = false;
        drained
    }

    /// Marks every pending entry (other than one already marked) as
    /// skipped, so their continuations are suppressed whenever their reply
    /// eventually lands. Does not remove them — the reply dispatcher still
    /// owns that. Decrements `pending_count` immediately for every
    /// non-persistent entry newly marked here, since `cancel_all` must leave
    /// `pending_count() == 0` observable right away (spec.md §8 invariant 2)
    /// rather than waiting for the server's real replies to drain the queue.
    pub fn mark_all_pending_skipped(&mut self) {
        if self.in_pending_cleanup {
            return;
        }
        self.in_pending_cleanup = true;
        let mut newly_skipped = 0u32;
        for entry in self.pending.iter_mut() {
            if !entry.skipped {
                if !entry.persist {
                    newly_skipped += 1;
                }
                entry.skipped = true;
            }
        }
        self.pending_count = self.pending_count.saturating_sub(newly_skipped);
        self.in_pending_cleanup = false;
    }

    /// Drains both queues unconditionally, returning every continuation
    /// still owed an answer. Used on disconnect/destroy, where every
    /// outstanding continuation must be invoked exactly once with an error
    /// before the queues are gone.
    pub fn drain_all(&mut self) -> (Vec<Continuation>, Vec<Continuation>) {
        let pending: Vec<Continuation> = self.pending.drain(..).map(|e| e.cb).collect();
        let waiting: Vec<Continuation> = self.waiting.drain(..).map(|e| e.cb).collect();
        self.pending_count = 0;
        (pending, waiting)
    }

    /// Drains only the waiting queue, for the "clear residual waiting queue"
    /// behavior of a second `disconnect()` call and of reconnect exhaustion.
    pub fn drain_waiting(&mut self) -> Vec<Continuation> {
        self.waiting.drain(..).map(|e| e.cb).collect()
    }

    /// Drains only the pending queue, leaving the waiting queue untouched.
    /// Used when a broken connection must fail in-flight commands while a
    /// caller may still want `resume_waiting_on_reconnect` to carry the
    /// waiting queue over to the next connection.
    pub fn drain_pending(&mut self) -> Vec<Continuation> {
        let drained: Vec<Continuation> = self.pending.drain(..).map(|e| e.cb).collect();
        self.pending_count = 0;
        drained
    }
}

//! Selective-Repeat send-side window state machine.
//!
//! [`WindowState`] is the authoritative record of everything the sender has
//! generated but not yet retired: the send queue, the in-flight buffer, the
//! set of confirmed-but-not-yet-collapsed ACKs and one retransmission timer
//! per in-flight segment.
//!
//! # Protocol contract
//!
//! - At most `window_capacity` segments are buffered at once, counting those
//!   confirmed but still waiting for an older segment.  A new segment goes out
//!   only when `base` slides, so armed timers never exceed the capacity either.
//! - In [`AckMode::Selective`] an ACK confirms exactly one sequence number, in
//!   any order; `base` slides only over the contiguous confirmed prefix.
//! - In [`AckMode::Cumulative`] an ACK confirms every buffered sequence up to
//!   and including it.
//! - Stale, duplicate and unknown ACKs are silently ignored.
//! - On timeout only the expired segment is retransmitted, byte for byte.
//! - Sequence numbers are u32 and wrap around; comparisons use the convention
//!   that two sequence numbers are "close" when their difference is less than
//!   `u32::MAX / 2`.
//!
//! The owner serialises every call behind one lock; see [`crate::sender`].

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::config::{AckMode, SeqSpacing, SessionConfig};
use crate::segment::{Segment, SegmentError};
use crate::socket::Transmit;
use crate::timer::{TimerRegistry, TimerToken};

/// Callback invoked (from a timer task) when a retransmission timer expires.
pub type ExpiryFn = Arc<dyn Fn(TimerToken) + Send + Sync>;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Returns `true` when sequence number `a` is ≤ `b` in wrap-around space.
#[inline]
pub fn seq_le(a: u32, b: u32) -> bool {
    b.wrapping_sub(a) <= (u32::MAX / 2)
}

/// Returns `true` when sequence number `a` is < `b` in wrap-around space.
#[inline]
pub fn seq_lt(a: u32, b: u32) -> bool {
    a != b && seq_le(a, b)
}

// ---------------------------------------------------------------------------
// Entries
// ---------------------------------------------------------------------------

/// A segment admitted but not yet transmitted.
#[derive(Debug, Clone)]
struct Pending {
    seq: u32,
    segment: Segment,
    /// Sequence number of the segment that follows this one.
    next: u32,
}

/// A transmitted segment awaiting confirmation and retirement.
#[derive(Debug, Clone)]
struct InFlight {
    /// Exact wire bytes; every retransmission reuses them.
    bytes: Vec<u8>,
    next: u32,
    /// Total number of times this segment has been transmitted.
    tx_count: u32,
}

/// Point-in-time summary of a window, for logging and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowSnapshot {
    pub base: u32,
    pub next_seq: u32,
    /// Segments holding an armed timer.
    pub in_flight: usize,
    /// Segments transmitted and not yet retired (confirmed or not).
    pub buffered: usize,
    pub queued: usize,
    pub confirmed: usize,
    /// Generated segments not yet retired.
    pub outstanding: usize,
}

// ---------------------------------------------------------------------------
// WindowState
// ---------------------------------------------------------------------------

/// Selective-Repeat send-side state for one session.
///
/// # Sequence-number layout
///
/// ```text
///  base                                next_seq
///   │                                     │
///  ─┼─────────────────────────────────────┼──────────▶ seq space
///   │ <─ buffered (in flight/confirmed) ─▶│ <── queue is drained into here
/// ```
pub struct WindowState {
    /// Oldest sequence number not yet retired (left window edge).
    base: u32,
    /// Sequence number for the next admitted segment.
    next_seq: u32,

    capacity: usize,
    rto: Duration,
    ack_mode: AckMode,
    spacing: SeqSpacing,

    queue: VecDeque<Pending>,
    buffer: HashMap<u32, InFlight>,
    confirmed: HashSet<u32>,
    /// Every sequence admitted and not yet retired.
    generated: HashSet<u32>,
    /// Timeout-driven transmissions over the session lifetime.
    retransmissions: u64,

    timers: TimerRegistry,
    expiry: ExpiryFn,
}

impl fmt::Debug for WindowState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WindowState")
            .field("snapshot", &self.snapshot())
            .field("ack_mode", &self.ack_mode)
            .field("spacing", &self.spacing)
            .finish_non_exhaustive()
    }
}

impl WindowState {
    /// Create an empty window.
    ///
    /// `expiry` is handed to every timer armed by this window; it must route
    /// back to [`WindowState::on_timer_fired`] under the session lock.
    pub fn new(config: &SessionConfig, timers: TimerRegistry, expiry: ExpiryFn) -> Self {
        Self {
            base: config.initial_seq,
            next_seq: config.initial_seq,
            capacity: config.window_capacity,
            rto: config.retransmit_timeout,
            ack_mode: config.ack_mode,
            spacing: config.spacing,
            queue: VecDeque::new(),
            buffer: HashMap::new(),
            confirmed: HashSet::new(),
            generated: HashSet::new(),
            retransmissions: 0,
            timers,
            expiry,
        }
    }

    // -----------------------------------------------------------------------
    // Operations
    // -----------------------------------------------------------------------

    /// Assign the next sequence number to `payload` and append it to the
    /// send queue.  Never blocks; fails only for a payload that cannot be
    /// framed at all.
    pub fn admit(&mut self, payload: Vec<u8>) -> Result<u32, SegmentError> {
        let seq = self.next_seq;
        let segment = Segment::data(seq, payload)?;
        let next = self.spacing.next(seq, segment.payload().len());

        log::trace!(
            "[sr] queued seq={seq} len={} next={next}",
            segment.payload().len()
        );
        self.queue.push_back(Pending { seq, segment, next });
        self.generated.insert(seq);
        self.next_seq = next;
        Ok(seq)
    }

    /// Transmit queued segments while the window has free slots.
    ///
    /// A slot is held from first transmission until retirement, so an
    /// out-of-order ACK never opens room past `base + capacity`.
    ///
    /// Returns the number of segments sent.  A failed transmission puts the
    /// segment back at the front of the queue and ends this attempt.
    pub fn try_transmit_pending(&mut self, link: &dyn Transmit) -> usize {
        let mut sent = 0;

        while self.buffer.len() < self.capacity {
            let Some(pending) = self.queue.pop_front() else {
                break;
            };
            let bytes = pending.segment.encode();

            if let Err(e) = link.transmit(&bytes) {
                log::warn!("[sr] → DATA seq={} failed: {e}; requeued", pending.seq);
                self.queue.push_front(pending);
                break;
            }

            let seq = pending.seq;
            self.buffer.insert(
                seq,
                InFlight {
                    bytes,
                    next: pending.next,
                    tx_count: 1,
                },
            );
            self.arm(seq);
            sent += 1;
            log::debug!(
                "[sr] → DATA seq={seq} len={} in_flight={}",
                pending.segment.payload().len(),
                self.timers.len()
            );
        }
        sent
    }

    /// Process one acknowledgement number.
    ///
    /// Returns `true` when `base` moved, i.e. the caller may be able to
    /// transmit more.
    pub fn process_ack(&mut self, ack: u32) -> bool {
        if seq_lt(ack, self.base) {
            log::trace!("[sr] ← ACK ack={ack} below base={}; ignored", self.base);
            return false;
        }

        match self.ack_mode {
            AckMode::Selective => {
                if self.confirmed.contains(&ack) || !self.buffer.contains_key(&ack) {
                    log::trace!("[sr] ← ACK ack={ack} duplicate or unknown; ignored");
                    return false;
                }
                self.confirm(ack);
            }
            AckMode::Cumulative => {
                let newly: Vec<u32> = self
                    .buffer
                    .keys()
                    .copied()
                    .filter(|&seq| seq_le(seq, ack) && !self.confirmed.contains(&seq))
                    .collect();
                if newly.is_empty() {
                    log::trace!("[sr] ← ACK ack={ack} confirms nothing new; ignored");
                    return false;
                }
                for seq in newly {
                    self.confirm(seq);
                }
            }
        }

        self.slide()
    }

    /// Retransmit `seq` if it is still outstanding, then re-arm its timer.
    ///
    /// A timeout for a confirmed or already retired segment is a no-op.
    pub fn on_timeout(&mut self, seq: u32, link: &dyn Transmit) {
        if self.confirmed.contains(&seq) {
            return;
        }
        let Some(entry) = self.buffer.get_mut(&seq) else {
            return;
        };

        match link.transmit(&entry.bytes) {
            Ok(()) => {
                entry.tx_count += 1;
                self.retransmissions += 1;
                log::debug!("[sr] timeout: retransmitted seq={seq} (tx #{})", entry.tx_count);
            }
            Err(e) => log::warn!("[sr] timeout: retransmit of seq={seq} failed: {e}"),
        }
        self.arm(seq);
    }

    /// Entry point for timer tasks: ignores expiries that were disarmed or
    /// replaced after they fired.
    pub fn on_timer_fired(&mut self, token: TimerToken, link: &dyn Transmit) {
        if !self.timers.is_current(token) {
            log::trace!("[sr] stale timer for seq={} ignored", token.id);
            return;
        }
        self.on_timeout(token.id, link);
    }

    /// Cancel every retransmission timer (session shutdown).
    pub fn cancel_timers(&mut self) {
        self.timers.clear();
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    pub fn base(&self) -> u32 {
        self.base
    }

    pub fn next_seq(&self) -> u32 {
        self.next_seq
    }

    /// Number of segments holding an armed timer.
    pub fn in_flight(&self) -> usize {
        self.timers.len()
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// Segments transmitted and not yet retired.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn retransmissions(&self) -> u64 {
        self.retransmissions
    }

    pub fn is_buffered(&self, seq: u32) -> bool {
        self.buffer.contains_key(&seq)
    }

    pub fn is_confirmed(&self, seq: u32) -> bool {
        self.confirmed.contains(&seq)
    }

    /// `true` once `seq` has been confirmed and evicted (or was never admitted).
    pub fn is_retired(&self, seq: u32) -> bool {
        !self.generated.contains(&seq)
    }

    pub fn all_retired(&self, seqs: &[u32]) -> bool {
        seqs.iter().all(|&seq| self.is_retired(seq))
    }

    /// `true` when nothing admitted so far is still outstanding.
    pub fn is_idle(&self) -> bool {
        self.generated.is_empty()
    }

    /// Stored wire bytes of a buffered segment.
    pub fn buffered_bytes(&self, seq: u32) -> Option<&[u8]> {
        self.buffer.get(&seq).map(|e| e.bytes.as_slice())
    }

    /// How many times a buffered segment has been transmitted.
    pub fn tx_count(&self, seq: u32) -> Option<u32> {
        self.buffer.get(&seq).map(|e| e.tx_count)
    }

    pub fn snapshot(&self) -> WindowSnapshot {
        WindowSnapshot {
            base: self.base,
            next_seq: self.next_seq,
            in_flight: self.timers.len(),
            buffered: self.buffer.len(),
            queued: self.queue.len(),
            confirmed: self.confirmed.len(),
            outstanding: self.generated.len(),
        }
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    fn arm(&mut self, seq: u32) {
        let expiry = Arc::clone(&self.expiry);
        self.timers.arm(seq, self.rto, move |token| expiry(token));
    }

    fn confirm(&mut self, seq: u32) {
        self.confirmed.insert(seq);
        self.timers.disarm(seq);
        log::debug!("[sr] ← ACK seq={seq} confirmed");
    }

    /// Retire the contiguous confirmed prefix starting at `base`.
    fn slide(&mut self) -> bool {
        let start = self.base;
        while self.confirmed.remove(&self.base) {
            let Some(entry) = self.buffer.remove(&self.base) else {
                break;
            };
            self.generated.remove(&self.base);
            self.base = entry.next;
        }

        let advanced = self.base != start;
        if advanced {
            log::debug!("[sr] window slid base={start} → {}", self.base);
        }
        advanced
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

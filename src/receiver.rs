//! Receiving endpoint.
//!
//! [`Reassembly`] is the pure receive-side state machine: it decides which
//! payloads can be delivered and which ACK (if any) answers each segment.
//! [`Receiver`] wraps it around a UDP socket and does the I/O.
//!
//! - **Selective**: every valid data segment is ACKed with its own sequence
//!   number.  Segments ahead of the expected one are held (up to
//!   `reorder_capacity`) and released once the gap fills.  Segments behind it
//!   are duplicates: re-ACKed so the sender can stop retransmitting, never
//!   delivered twice.
//! - **Cumulative**: only the in-order segment is accepted; every data
//!   segment is answered with the sequence number of the last in-order one.

use std::collections::{BTreeMap, VecDeque};
use std::io;
use std::net::SocketAddr;

use thiserror::Error;
use tokio::net::UdpSocket;

use crate::config::{AckMode, SeqSpacing};
use crate::segment::Segment;
use crate::socket::{is_transient, MAX_DATAGRAM};
use crate::window::seq_lt;

/// Default bound on segments held while waiting for a gap to fill.
pub const DEFAULT_REORDER_CAPACITY: usize = 64;

#[derive(Debug, Error)]
pub enum ReceiverError {
    #[error("socket error: {0}")]
    Io(#[from] io::Error),
}

// ---------------------------------------------------------------------------
// Reassembly
// ---------------------------------------------------------------------------

/// Result of feeding one segment to [`Reassembly::on_segment`].
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Outcome {
    /// Payloads now deliverable, in stream order.
    pub deliver: Vec<Vec<u8>>,
    /// Sequence number to acknowledge, if any.
    pub ack: Option<u32>,
}

#[derive(Debug)]
pub struct Reassembly {
    /// Sequence number of the next in-order segment.
    expected: u32,
    /// Most recent in-order sequence number (cumulative ACK value).
    last_in_order: Option<u32>,
    spacing: SeqSpacing,
    ack_mode: AckMode,
    out_of_order: BTreeMap<u32, Vec<u8>>,
    reorder_capacity: usize,
}

impl Reassembly {
    pub fn new(initial_seq: u32, ack_mode: AckMode, spacing: SeqSpacing) -> Self {
        Self {
            expected: initial_seq,
            last_in_order: None,
            spacing,
            ack_mode,
            out_of_order: BTreeMap::new(),
            reorder_capacity: DEFAULT_REORDER_CAPACITY,
        }
    }

    pub fn with_reorder_capacity(mut self, capacity: usize) -> Self {
        self.reorder_capacity = capacity;
        self
    }

    pub fn expected(&self) -> u32 {
        self.expected
    }

    /// Number of out-of-order segments held.
    pub fn held(&self) -> usize {
        self.out_of_order.len()
    }

    /// Process one decoded segment.  ACK segments are ignored.
    pub fn on_segment(&mut self, segment: &Segment) -> Outcome {
        if segment.ack_flag {
            return Outcome::default();
        }
        let seq = segment.seq;

        if seq == self.expected {
            let mut deliver = vec![segment.payload().to_vec()];
            self.advance(seq, segment.payload().len());
            if self.ack_mode == AckMode::Selective {
                while let Some(payload) = self.out_of_order.remove(&self.expected) {
                    let at = self.expected;
                    self.advance(at, payload.len());
                    deliver.push(payload);
                }
            }
            return Outcome {
                deliver,
                ack: Some(seq),
            };
        }

        match self.ack_mode {
            AckMode::Cumulative => Outcome {
                deliver: Vec::new(),
                ack: self.last_in_order,
            },
            AckMode::Selective if seq_lt(seq, self.expected) => Outcome {
                deliver: Vec::new(),
                ack: Some(seq),
            },
            AckMode::Selective => {
                if !self.out_of_order.contains_key(&seq) {
                    if self.out_of_order.len() >= self.reorder_capacity {
                        log::debug!("[sr:rx] reorder buffer full; dropped seq={seq}");
                        return Outcome::default();
                    }
                    self.out_of_order.insert(seq, segment.payload().to_vec());
                }
                Outcome {
                    deliver: Vec::new(),
                    ack: Some(seq),
                }
            }
        }
    }

    fn advance(&mut self, seq: u32, payload_len: usize) {
        self.last_in_order = Some(seq);
        self.expected = self.spacing.next(seq, payload_len);
    }
}

// ---------------------------------------------------------------------------
// Receiver
// ---------------------------------------------------------------------------

/// Settings for a [`Receiver`].
#[derive(Debug, Clone)]
pub struct ReceiverConfig {
    pub bind: SocketAddr,
    /// Relay to announce ourselves to with an empty datagram on bind.
    pub register: Option<SocketAddr>,
    pub ack_mode: AckMode,
    pub spacing: SeqSpacing,
    /// Sequence number of the first expected segment.
    pub initial_seq: u32,
    pub reorder_capacity: usize,
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([0, 0, 0, 0], 0)),
            register: None,
            ack_mode: AckMode::Selective,
            spacing: SeqSpacing::BitOffset,
            initial_seq: 0,
            reorder_capacity: DEFAULT_REORDER_CAPACITY,
        }
    }
}

/// Async receiving endpoint.  ACKs go back to whichever address sent the
/// data segment.
#[derive(Debug)]
pub struct Receiver {
    socket: UdpSocket,
    local_addr: SocketAddr,
    reassembly: Reassembly,
    ready: VecDeque<Vec<u8>>,
    acks_sent: u64,
}

impl Receiver {
    pub async fn bind(config: ReceiverConfig) -> Result<Self, ReceiverError> {
        let socket = UdpSocket::bind(config.bind).await?;
        let local_addr = socket.local_addr()?;

        if let Some(relay) = config.register {
            socket.send_to(&[], relay).await?;
            log::debug!("[sr:rx] registered with relay {relay}");
        }

        Ok(Self {
            socket,
            local_addr,
            reassembly: Reassembly::new(config.initial_seq, config.ack_mode, config.spacing)
                .with_reorder_capacity(config.reorder_capacity),
            ready: VecDeque::new(),
            acks_sent: 0,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Number of ACK segments sent so far.
    pub fn ack_count(&self) -> u64 {
        self.acks_sent
    }

    /// Wait for the next in-order, non-empty payload chunk.
    pub async fn recv(&mut self) -> Result<Vec<u8>, ReceiverError> {
        let mut buf = [0u8; MAX_DATAGRAM];
        loop {
            if let Some(chunk) = self.ready.pop_front() {
                return Ok(chunk);
            }

            let (n, from) = match self.socket.recv_from(&mut buf).await {
                Ok(received) => received,
                Err(e) if is_transient(&e) => continue,
                Err(e) => return Err(e.into()),
            };
            let segment = match Segment::decode(&buf[..n]) {
                Ok(segment) => segment,
                Err(e) => {
                    log::trace!("[sr:rx] dropped datagram from {from}: {e}");
                    continue;
                }
            };

            let outcome = self.reassembly.on_segment(&segment);
            if let Some(ack) = outcome.ack {
                self.socket.send_to(&Segment::ack(ack).encode(), from).await?;
                self.acks_sent += 1;
            }
            log::debug!(
                "[sr:rx] ← DATA seq={} len={}; delivered={} → ACK {:?}",
                segment.seq,
                segment.payload().len(),
                outcome.deliver.len(),
                outcome.ack
            );
            self.ready
                .extend(outcome.deliver.into_iter().filter(|p| !p.is_empty()));
        }
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

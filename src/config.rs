//! Session configuration.
//!
//! Every knob the transport exposes is a plain constant on
//! [`SessionConfig`]; there are no configuration files.  The binary overrides
//! individual fields from command-line flags.

use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;

use crate::segment::{self, MAX_PAYLOAD};

/// Default destination port (the relay or receiver) on loopback.
pub const DEFAULT_PEER_PORT: u16 = 55555;

/// How sequence numbers advance from one segment to the next.
///
/// The choice changes what the distance between `base` and `next_seq` means,
/// so both endpoints of a session must agree on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SeqSpacing {
    /// `seq` is the bit offset of the segment within the stream; each segment
    /// advances the counter by its encoded bit length (header + padded payload).
    #[default]
    BitOffset,
    /// Each segment advances the counter by one.
    SegmentIndex,
}

impl SeqSpacing {
    /// Sequence number that follows a segment at `seq` carrying `payload_len` bytes.
    pub fn next(self, seq: u32, payload_len: usize) -> u32 {
        match self {
            Self::BitOffset => seq.wrapping_add(segment::encoded_bits(payload_len)),
            Self::SegmentIndex => seq.wrapping_add(1),
        }
    }
}

/// Acknowledgement discipline for one session.  Never mixed within a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AckMode {
    /// Selective Repeat: an ACK confirms exactly the sequence number it carries.
    #[default]
    Selective,
    /// Go-Back-N style: an ACK confirms every outstanding sequence up to and
    /// including the one it carries.
    Cumulative,
}

/// Errors raised by [`SessionConfig::validate`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("window capacity must be at least 1")]
    ZeroWindow,
    #[error("max payload must be between 1 and {MAX_PAYLOAD} bytes, got {0}")]
    PayloadSize(usize),
    #[error("{0} must be non-zero")]
    ZeroDuration(&'static str),
}

/// Constants for one sender session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Local address to bind; port 0 lets the OS choose.
    pub bind: SocketAddr,
    /// Destination of every data segment.
    pub peer: SocketAddr,
    /// Maximum number of segments in flight (timer armed) at once.
    pub window_capacity: usize,
    /// Fixed per-segment retransmission timeout.
    pub retransmit_timeout: Duration,
    /// Maximum payload bytes per segment.
    pub max_payload: usize,
    pub ack_mode: AckMode,
    pub spacing: SeqSpacing,
    /// Sequence number of the first segment.
    pub initial_seq: u32,
    /// Socket read timeout of the ACK loop; bounds how long shutdown waits.
    pub read_timeout: Duration,
    /// Upper bound between completion re-checks while waiting for ACKs.
    pub poll_interval: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([0, 0, 0, 0], 0)),
            peer: SocketAddr::from(([127, 0, 0, 1], DEFAULT_PEER_PORT)),
            window_capacity: 5,
            retransmit_timeout: Duration::from_secs(1),
            max_payload: 16,
            ack_mode: AckMode::Selective,
            spacing: SeqSpacing::BitOffset,
            initial_seq: 0,
            read_timeout: Duration::from_millis(500),
            poll_interval: Duration::from_millis(10),
        }
    }
}

impl SessionConfig {
    /// Default configuration sending to `peer`.
    pub fn new(peer: SocketAddr) -> Self {
        Self {
            peer,
            ..Self::default()
        }
    }

    /// Reject values the window state machine cannot operate with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.window_capacity == 0 {
            return Err(ConfigError::ZeroWindow);
        }
        if self.max_payload == 0 || self.max_payload > MAX_PAYLOAD {
            return Err(ConfigError::PayloadSize(self.max_payload));
        }
        if self.retransmit_timeout.is_zero() {
            return Err(ConfigError::ZeroDuration("retransmit_timeout"));
        }
        if self.read_timeout.is_zero() {
            return Err(ConfigError::ZeroDuration("read_timeout"));
        }
        if self.poll_interval.is_zero() {
            return Err(ConfigError::ZeroDuration("poll_interval"));
        }
        Ok(())
    }
}

//! Wire-format definitions for protocol segments.
//!
//! Every datagram exchanged between peers is exactly one [`Segment`].  This
//! module is responsible for:
//! - Defining the on-wire binary layout (header fields, flag bit, payload).
//! - Serialising a [`Segment`] into a byte buffer ready for transmission.
//! - Deserialising a raw byte slice back into a [`Segment`], rejecting
//!   truncated or corrupted input.
//!
//! No I/O happens here; this is pure data transformation, safe to call from
//! any task without synchronisation.
//!
//! # Wire format
//!
//! All multi-byte integers are **big-endian**.
//!
//! ```text
//!  0               1               2               3
//!  0 1 2 3 4 5 6 7 0 1 2 3 4 5 6 7 0 1 2 3 4 5 6 7 0 1 2 3 4 5 6 7
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                        Sequence Number                        |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                    Acknowledgment Number                      |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |           Checksum            |  Payload Len  |A|  Reserved   |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                 Payload ... (zero-padded to 16 bits)          |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! Total header size: [`HEADER_LEN`] = 12 bytes (96 bits).
//!
//! # Checksum
//!
//! The checksum field is zeroed, the whole segment is split into 16-bit
//! big-endian blocks (an odd trailing byte is padded with a zero byte), and
//! the blocks are summed into a 16-bit accumulator starting at zero.  Any
//! addition that overflows 16 bits wraps with an end-around carry.  The sum is
//! stored as-is (no final complement).

use thiserror::Error;

/// Byte length of the fixed-size header on the wire.
pub const HEADER_LEN: usize = 12;

/// Bit length of the fixed-size header on the wire.
pub const HEADER_BITS: u32 = (HEADER_LEN * 8) as u32;

/// Largest payload a single segment can carry (8-bit length field).
pub const MAX_PAYLOAD: usize = u8::MAX as usize;

// Byte offsets of each field within the serialised header.
const OFF_SEQ: usize = 0;
const OFF_ACK: usize = 4;
const OFF_CHECKSUM: usize = 8;
const OFF_PAYLOAD_LEN: usize = 10;
const OFF_FLAGS: usize = 11;

/// Most significant bit of the flags byte; the remaining 7 bits are reserved.
const ACK_BIT: u8 = 0b1000_0000;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors that can arise when building or parsing a segment.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SegmentError {
    /// Buffer shorter than the fixed header size.
    #[error("datagram of {0} bytes is shorter than the {HEADER_LEN}-byte header")]
    TooShort(usize),
    /// Checksum did not match the recomputed value.
    #[error("checksum mismatch: carried {carried:#06x}, computed {computed:#06x}")]
    ChecksumMismatch { carried: u16, computed: u16 },
    /// `payload_len` claims more bytes than the datagram holds.
    #[error("payload_len {claimed} exceeds the {available} payload bytes present")]
    Truncated { claimed: usize, available: usize },
    /// Payload does not fit the 8-bit length field.
    #[error("payload of {0} bytes exceeds the {MAX_PAYLOAD}-byte maximum")]
    PayloadTooLarge(usize),
}

// ---------------------------------------------------------------------------
// Segment
// ---------------------------------------------------------------------------

/// A complete protocol datagram: header fields + payload bytes.
///
/// The payload length and checksum are not stored; [`Segment::encode`]
/// derives them and [`Segment::decode`] verifies them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    /// Sequence number of this segment (its offset in the logical stream).
    pub seq: u32,
    /// Acknowledged sequence number; meaningful only when `ack_flag` is set.
    pub ack: u32,
    /// Marks the segment as an acknowledgement.
    pub ack_flag: bool,
    payload: Vec<u8>,
}

impl Segment {
    /// Build a segment, rejecting payloads longer than [`MAX_PAYLOAD`].
    pub fn new(seq: u32, ack: u32, ack_flag: bool, payload: Vec<u8>) -> Result<Self, SegmentError> {
        if payload.len() > MAX_PAYLOAD {
            return Err(SegmentError::PayloadTooLarge(payload.len()));
        }
        Ok(Self {
            seq,
            ack,
            ack_flag,
            payload,
        })
    }

    /// A data segment carrying `payload` at sequence `seq`.
    pub fn data(seq: u32, payload: Vec<u8>) -> Result<Self, SegmentError> {
        Self::new(seq, 0, false, payload)
    }

    /// An empty acknowledgement for sequence number `ack`.
    pub fn ack(ack: u32) -> Self {
        Self {
            seq: 0,
            ack,
            ack_flag: true,
            payload: Vec::new(),
        }
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn into_payload(self) -> Vec<u8> {
        self.payload
    }

    /// Number of bytes [`Segment::encode`] produces for this segment.
    pub fn encoded_len(&self) -> usize {
        encoded_len(self.payload.len())
    }

    /// Serialise this segment into a newly allocated byte vector.
    pub fn encode(&self) -> Vec<u8> {
        let payload_len = self.payload.len();
        let mut buf = vec![0u8; encoded_len(payload_len)];

        buf[OFF_SEQ..OFF_SEQ + 4].copy_from_slice(&self.seq.to_be_bytes());
        buf[OFF_ACK..OFF_ACK + 4].copy_from_slice(&self.ack.to_be_bytes());
        // payload_len <= MAX_PAYLOAD is guaranteed by the constructors.
        buf[OFF_PAYLOAD_LEN] = payload_len as u8;
        buf[OFF_FLAGS] = if self.ack_flag { ACK_BIT } else { 0 };
        buf[HEADER_LEN..HEADER_LEN + payload_len].copy_from_slice(&self.payload);

        // Checksum field is still zero at this point.
        let csum = checksum(&buf);
        buf[OFF_CHECKSUM..OFF_CHECKSUM + 2].copy_from_slice(&csum.to_be_bytes());

        buf
    }

    /// Parse a [`Segment`] from a raw datagram.
    ///
    /// Returns [`Err`] if:
    /// - `buf` is shorter than [`HEADER_LEN`],
    /// - the checksum does not verify, or
    /// - `payload_len` claims more bytes than are present.
    ///
    /// Trailing padding beyond `payload_len` is discarded.
    pub fn decode(buf: &[u8]) -> Result<Self, SegmentError> {
        if buf.len() < HEADER_LEN {
            return Err(SegmentError::TooShort(buf.len()));
        }

        let carried = u16::from_be_bytes([buf[OFF_CHECKSUM], buf[OFF_CHECKSUM + 1]]);
        let computed = checksum_skipping_field(buf);
        if carried != computed {
            return Err(SegmentError::ChecksumMismatch { carried, computed });
        }

        let payload_len = usize::from(buf[OFF_PAYLOAD_LEN]);
        let available = buf.len() - HEADER_LEN;
        if payload_len > available {
            return Err(SegmentError::Truncated {
                claimed: payload_len,
                available,
            });
        }

        Ok(Self {
            seq: read_u32(buf, OFF_SEQ),
            ack: read_u32(buf, OFF_ACK),
            ack_flag: buf[OFF_FLAGS] & ACK_BIT != 0,
            payload: buf[HEADER_LEN..HEADER_LEN + payload_len].to_vec(),
        })
    }
}

// ---------------------------------------------------------------------------
// Length helpers
// ---------------------------------------------------------------------------

/// Encoded byte length of a segment carrying `payload_len` bytes.
pub fn encoded_len(payload_len: usize) -> usize {
    HEADER_LEN + payload_len + payload_len % 2
}

/// Encoded bit length of a segment carrying `payload_len` bytes:
/// the 96-bit header plus the payload padded to a multiple of 16 bits.
pub fn encoded_bits(payload_len: usize) -> u32 {
    (encoded_len(payload_len) * 8) as u32
}

// ---------------------------------------------------------------------------
// Checksum
// ---------------------------------------------------------------------------

/// 16-bit addition with end-around carry.
#[inline]
fn add_end_around(acc: u16, block: u16) -> u16 {
    let (sum, carry) = acc.overflowing_add(block);
    sum.wrapping_add(u16::from(carry))
}

/// Fold `data` in 16-bit big-endian blocks with end-around carry.
///
/// An odd trailing byte is padded with a zero byte on the right.  The caller
/// must zero any checksum field within `data` first.
pub fn checksum(data: &[u8]) -> u16 {
    data.chunks(2).fold(0u16, |acc, chunk| {
        let lo = chunk.get(1).copied().unwrap_or(0);
        add_end_around(acc, u16::from_be_bytes([chunk[0], lo]))
    })
}

/// [`checksum`] over a received datagram, treating its checksum field as zero.
fn checksum_skipping_field(buf: &[u8]) -> u16 {
    buf.chunks(2).enumerate().fold(0u16, |acc, (i, chunk)| {
        if i * 2 == OFF_CHECKSUM {
            return acc;
        }
        let lo = chunk.get(1).copied().unwrap_or(0);
        add_end_around(acc, u16::from_be_bytes([chunk[0], lo]))
    })
}

fn read_u32(buf: &[u8], off: usize) -> u32 {
    u32::from_be_bytes([buf[off], buf[off + 1], buf[off + 2], buf[off + 3]])
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

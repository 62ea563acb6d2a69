//! `sr-over-udp`: a Selective-Repeat reliable byte stream over UDP.
//!
//! # Architecture
//!
//! ```text
//!  ┌──────────┐  DATA segments  ┌─────────┐  DATA segments  ┌──────────┐
//!  │  Sender  │────────────────▶│  Relay  │────────────────▶│ Receiver │
//!  └────┬─────┘◀────────────────│(faults) │◀────────────────└──────────┘
//!       │          ACKs         └─────────┘       ACKs
//!       │
//!  ┌────▼──────────────────────────────┐
//!  │  Mutex<WindowState>               │
//!  │  (queue, buffer, confirmed set,   │
//!  │   per-segment timers)             │
//!  └────┬──────────────────────────────┘
//!       │ raw UDP datagrams
//!  ┌────▼──────┐
//!  │  Socket   │  (thin async wrapper around tokio UdpSocket)
//!  └───────────┘
//! ```
//!
//! Each module has a single responsibility:
//! - [`segment`]   : wire format and end-around-carry checksum
//! - [`config`]    : session constants and their validation
//! - [`window`]    : Selective-Repeat send window state machine
//! - [`timer`]     : per-segment retransmission timers
//! - [`sender`]    : sending session: scheduler, ACK loop, completion waiter
//! - [`receiver`]  : receiving endpoint and reassembly
//! - [`relay`]     : fault-injecting UDP forwarder
//! - [`socket`]    : async UDP socket abstraction

pub mod config;
pub mod receiver;
pub mod relay;
pub mod segment;
pub mod sender;
pub mod socket;
pub mod timer;
pub mod window;

pub use config::{AckMode, SeqSpacing, SessionConfig};
pub use receiver::{Receiver, ReceiverConfig};
pub use relay::{Impairment, Relay, RelayConfig, RelayHandle};
pub use segment::Segment;
pub use sender::{Sender, SessionError};

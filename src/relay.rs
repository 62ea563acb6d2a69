//! Impairment relay.
//!
//! A UDP forwarder placed between sender and receiver that injects faults
//! so the retransmission machinery can be exercised on a real socket path:
//!
//! | Mode          | Effect on an impaired datagram                        |
//! |---------------|-------------------------------------------------------|
//! | `Normal`      | Forwarded unchanged.                                  |
//! | `Loss`        | Dropped.                                              |
//! | `Corruption`  | One random byte replaced with a different value.      |
//! | `Delay`       | Forwarded after `delay`, without stalling the relay.  |
//! | `Duplication` | Forwarded twice.                                      |
//! | `Reorder`     | Held back and released right after the next datagram. |
//!
//! Each forwarded datagram is impaired with probability `probability`.
//!
//! The relay learns its two endpoints from the first two distinct source
//! addresses it sees.  An empty datagram only registers its sender; it is
//! never forwarded.  The mode is owned by the relay and changed at runtime
//! through a [`RelayHandle`].

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::sync::watch;

use crate::config::DEFAULT_PEER_PORT;
use crate::socket::{is_transient, MAX_DATAGRAM};

// ---------------------------------------------------------------------------
// Impairment
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Impairment {
    #[default]
    Normal,
    Loss,
    Corruption,
    Delay,
    Duplication,
    Reorder,
}

impl FromStr for Impairment {
    type Err = RelayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "normal" => Ok(Self::Normal),
            "loss" => Ok(Self::Loss),
            "corruption" | "corrupt" => Ok(Self::Corruption),
            "delay" => Ok(Self::Delay),
            "duplication" | "duplicate" => Ok(Self::Duplication),
            "reorder" | "reordering" => Ok(Self::Reorder),
            _ => Err(RelayError::UnknownMode(s.to_string())),
        }
    }
}

impl fmt::Display for Impairment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Normal => "normal",
            Self::Loss => "loss",
            Self::Corruption => "corruption",
            Self::Delay => "delay",
            Self::Duplication => "duplication",
            Self::Reorder => "reorder",
        };
        f.write_str(name)
    }
}

// ---------------------------------------------------------------------------
// Errors / config
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("socket error: {0}")]
    Io(#[from] io::Error),
    #[error("unknown impairment mode {0:?}")]
    UnknownMode(String),
    #[error("probability must be within [0, 1], got {0}")]
    Probability(f64),
}

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub bind: SocketAddr,
    pub mode: Impairment,
    /// Chance that a forwarded datagram is impaired.
    pub probability: f64,
    /// Hold time in `Delay` mode.
    pub delay: Duration,
    /// Fixed RNG seed for reproducible runs.
    pub seed: Option<u64>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([127, 0, 0, 1], DEFAULT_PEER_PORT)),
            mode: Impairment::Normal,
            probability: 1.0,
            delay: Duration::from_secs(1),
            seed: None,
        }
    }
}

fn check_probability(p: f64) -> Result<f64, RelayError> {
    if (0.0..=1.0).contains(&p) {
        Ok(p)
    } else {
        Err(RelayError::Probability(p))
    }
}

/// Counters over the lifetime of a relay.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub received: u64,
    pub forwarded: u64,
    pub dropped: u64,
    pub corrupted: u64,
    pub delayed: u64,
    pub duplicated: u64,
    pub reordered: u64,
}

// ---------------------------------------------------------------------------
// Routing state
// ---------------------------------------------------------------------------

#[derive(Debug, PartialEq, Eq)]
enum Forward {
    Now(Vec<u8>, SocketAddr),
    Later(Vec<u8>, SocketAddr, Duration),
}

#[derive(Debug)]
struct RelayState {
    mode: Impairment,
    probability: f64,
    delay: Duration,
    endpoints: [Option<SocketAddr>; 2],
    /// Datagram held back in `Reorder` mode.
    held: Option<(Vec<u8>, SocketAddr)>,
    rng: StdRng,
    stats: RelayStats,
}

impl RelayState {
    fn new(config: &RelayConfig) -> Self {
        Self {
            mode: config.mode,
            probability: config.probability,
            delay: config.delay,
            endpoints: [None, None],
            held: None,
            rng: match config.seed {
                Some(seed) => StdRng::seed_from_u64(seed),
                None => StdRng::from_os_rng(),
            },
            stats: RelayStats::default(),
        }
    }

    fn learn(&mut self, from: SocketAddr) {
        match self.endpoints {
            [None, _] => {
                self.endpoints[0] = Some(from);
                log::info!("[relay] endpoint A registered: {from}");
            }
            [Some(a), None] if a != from => {
                self.endpoints[1] = Some(from);
                log::info!("[relay] endpoint B registered: {from}");
            }
            _ => {}
        }
    }

    fn counterpart(&self, from: SocketAddr) -> Option<SocketAddr> {
        match self.endpoints {
            [Some(a), Some(b)] if from == a => Some(b),
            [Some(a), Some(b)] if from == b => Some(a),
            _ => None,
        }
    }

    /// Decide what to send for one inbound datagram.
    fn route(&mut self, datagram: &[u8], from: SocketAddr) -> Vec<Forward> {
        self.stats.received += 1;
        self.learn(from);
        if datagram.is_empty() {
            return Vec::new();
        }
        let Some(dest) = self.counterpart(from) else {
            self.stats.dropped += 1;
            log::debug!("[relay] no counterpart for {from}; dropped");
            return Vec::new();
        };

        let impaired = self.mode != Impairment::Normal && self.rng.random_bool(self.probability);
        let mut out = Vec::new();
        match (impaired, self.mode) {
            (false, _) | (true, Impairment::Normal) => {
                out.push(Forward::Now(datagram.to_vec(), dest));
            }
            (true, Impairment::Loss) => {
                self.stats.dropped += 1;
                log::debug!("[relay] lost datagram from {from}");
            }
            (true, Impairment::Corruption) => {
                let mut bytes = datagram.to_vec();
                let idx = self.rng.random_range(0..bytes.len());
                let old = bytes[idx];
                bytes[idx] = old.wrapping_add(self.rng.random_range(1..=u8::MAX));
                self.stats.corrupted += 1;
                log::debug!("[relay] corrupted byte {idx} ({old:#04x} → {:#04x}) from {from}", bytes[idx]);
                out.push(Forward::Now(bytes, dest));
            }
            (true, Impairment::Delay) => {
                self.stats.delayed += 1;
                log::debug!("[relay] delaying datagram from {from} by {:?}", self.delay);
                out.push(Forward::Later(datagram.to_vec(), dest, self.delay));
            }
            (true, Impairment::Duplication) => {
                self.stats.duplicated += 1;
                log::debug!("[relay] duplicated datagram from {from}");
                out.push(Forward::Now(datagram.to_vec(), dest));
                out.push(Forward::Now(datagram.to_vec(), dest));
            }
            (true, Impairment::Reorder) => {
                if self.held.is_none() {
                    self.stats.reordered += 1;
                    log::debug!("[relay] holding datagram from {from} for reordering");
                    self.held = Some((datagram.to_vec(), dest));
                    return out;
                }
                out.push(Forward::Now(datagram.to_vec(), dest));
            }
        }

        if !out.is_empty() {
            if let Some((bytes, to)) = self.held.take() {
                out.push(Forward::Now(bytes, to));
            }
        }
        self.stats.forwarded += out.len() as u64;
        out
    }
}

// ---------------------------------------------------------------------------
// Relay
// ---------------------------------------------------------------------------

pub struct Relay {
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
    state: Arc<Mutex<RelayState>>,
    shutdown_tx: Arc<watch::Sender<bool>>,
    shutdown_rx: watch::Receiver<bool>,
}

/// Runtime control over a running [`Relay`].
#[derive(Clone)]
pub struct RelayHandle {
    state: Arc<Mutex<RelayState>>,
    shutdown_tx: Arc<watch::Sender<bool>>,
}

fn lock(state: &Mutex<RelayState>) -> MutexGuard<'_, RelayState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Relay {
    pub async fn bind(config: RelayConfig) -> Result<Self, RelayError> {
        check_probability(config.probability)?;
        let socket = UdpSocket::bind(config.bind).await?;
        let local_addr = socket.local_addr()?;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        log::info!(
            "[relay] listening on {local_addr} (mode={}, p={})",
            config.mode,
            config.probability
        );
        Ok(Self {
            socket: Arc::new(socket),
            local_addr,
            state: Arc::new(Mutex::new(RelayState::new(&config))),
            shutdown_tx: Arc::new(shutdown_tx),
            shutdown_rx,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn handle(&self) -> RelayHandle {
        RelayHandle {
            state: Arc::clone(&self.state),
            shutdown_tx: Arc::clone(&self.shutdown_tx),
        }
    }

    /// Forward datagrams until [`RelayHandle::shutdown`] is called.
    pub async fn run(mut self) -> Result<(), RelayError> {
        let mut buf = vec![0u8; MAX_DATAGRAM];

        loop {
            tokio::select! {
                _ = self.shutdown_rx.changed() => break,

                result = self.socket.recv_from(&mut buf) => {
                    let (n, from) = match result {
                        Ok(received) => received,
                        Err(e) if is_transient(&e) => continue,
                        Err(e) => return Err(e.into()),
                    };
                    let actions = lock(&self.state).route(&buf[..n], from);
                    for action in actions {
                        self.perform(action).await;
                    }
                }
            }
        }
        log::info!("[relay] {} stopped", self.local_addr);
        Ok(())
    }

    async fn perform(&self, action: Forward) {
        match action {
            Forward::Now(bytes, dest) => {
                if let Err(e) = self.socket.send_to(&bytes, dest).await {
                    log::warn!("[relay] send to {dest} failed: {e}");
                }
            }
            Forward::Later(bytes, dest, delay) => {
                let socket = Arc::clone(&self.socket);
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    if let Err(e) = socket.send_to(&bytes, dest).await {
                        log::warn!("[relay] delayed send to {dest} failed: {e}");
                    }
                });
            }
        }
    }
}

impl RelayHandle {
    pub fn set_mode(&self, mode: Impairment) {
        lock(&self.state).mode = mode;
        log::info!("[relay] mode → {mode}");
    }

    pub fn mode(&self) -> Impairment {
        lock(&self.state).mode
    }

    pub fn set_probability(&self, probability: f64) -> Result<(), RelayError> {
        lock(&self.state).probability = check_probability(probability)?;
        Ok(())
    }

    pub fn stats(&self) -> RelayStats {
        lock(&self.state).stats
    }

    /// Stop [`Relay::run`] at its next wakeup.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

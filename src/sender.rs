//! Sending endpoint of a Selective-Repeat session.
//!
//! # Architecture
//!
//! ```text
//!  Application
//!      │  enqueue_message / send_and_confirm / flush
//!      ▼
//!  Sender ──────────────┐
//!      │                │ Arc<Shared>
//!      ▼                ▼
//!  Mutex<WindowState>  ◀──── ack_loop task   (ACKs in, slides window)
//!      │        ▲
//!      │        └─────────── timer tasks     (Weak<Shared>, retransmit)
//!      ▼
//!  Arc<dyn Transmit> ──▶ peer (receiver or relay)
//! ```
//!
//! Every mutation of the window happens under the one mutex, from one of
//! three places: the application thread (admit + transmit), the ACK loop
//! (process ACK + transmit) and timer tasks (retransmit).  Nothing awaits
//! while the lock is held.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use thiserror::Error;
use tokio::runtime::Handle;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;

use crate::config::{ConfigError, SessionConfig};
use crate::segment::{Segment, SegmentError};
use crate::socket::{is_transient, Socket, Transmit, MAX_DATAGRAM};
use crate::timer::{TimerRegistry, TimerToken};
use crate::window::{ExpiryFn, WindowSnapshot, WindowState};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("socket error: {0}")]
    Io(#[from] io::Error),
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("cannot frame payload: {0}")]
    Segment(#[from] SegmentError),
}

// ---------------------------------------------------------------------------
// Stats
// ---------------------------------------------------------------------------

/// Counters over the lifetime of a session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    /// Valid ACK segments received.
    pub acks: u64,
    /// ACKs that moved the window base.
    pub advancing_acks: u64,
    /// Datagrams that failed to decode.
    pub invalid: u64,
    /// Datagrams from an address other than the peer.
    pub foreign: u64,
    /// Timeout-driven retransmissions.
    pub retransmissions: u64,
}

// ---------------------------------------------------------------------------
// Shared session state
// ---------------------------------------------------------------------------

struct Shared {
    window: Mutex<WindowState>,
    /// Read side, and the peer address datagrams must come from.
    socket: Arc<Socket>,
    /// Every outbound datagram goes through here.
    link: Arc<dyn Transmit>,
    /// Raised whenever the window base moves.
    progress: Notify,
    acks: AtomicU64,
    advancing_acks: AtomicU64,
    invalid: AtomicU64,
    foreign: AtomicU64,
}

impl Shared {
    /// Lock the window, ignoring poisoning.
    fn lock(&self) -> MutexGuard<'_, WindowState> {
        self.window.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn timer_fired(&self, token: TimerToken) {
        self.lock().on_timer_fired(token, &*self.link);
    }

    /// Handle one datagram read by the ACK loop.
    fn on_datagram(&self, datagram: &[u8], from: SocketAddr) {
        if from != self.socket.peer {
            self.foreign.fetch_add(1, Ordering::Relaxed);
            log::trace!("[sr:ack] datagram from {from} is not from the peer; dropped");
            return;
        }
        let segment = match Segment::decode(datagram) {
            Ok(segment) => segment,
            Err(e) => {
                self.invalid.fetch_add(1, Ordering::Relaxed);
                log::trace!("[sr:ack] dropped datagram from {from}: {e}");
                return;
            }
        };
        if !segment.ack_flag {
            log::trace!("[sr:ack] non-ACK segment seq={} from {from} discarded", segment.seq);
            return;
        }
        self.acks.fetch_add(1, Ordering::Relaxed);

        let advanced = {
            let mut window = self.lock();
            let advanced = window.process_ack(segment.ack);
            if advanced {
                window.try_transmit_pending(&*self.link);
            }
            advanced
        };
        if advanced {
            self.advancing_acks.fetch_add(1, Ordering::Relaxed);
            self.progress.notify_waiters();
        }
    }

    /// Read-timeout tick: retry a queue left stalled by a failed transmission.
    ///
    /// Only free window slots are filled, so a stuck `base` keeps the queue
    /// waiting here just as it does on the ACK path.
    fn on_idle(&self) {
        let mut window = self.lock();
        if window.queued() > 0 {
            let sent = window.try_transmit_pending(&*self.link);
            if sent > 0 {
                log::debug!("[sr:ack] idle tick sent {sent} queued segment(s)");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Sender
// ---------------------------------------------------------------------------

/// Handle to one sending session.
///
/// Dropping the handle stops the ACK loop and cancels every timer without
/// waiting; [`Sender::shutdown`] does the same and also joins the loop.
/// Unacknowledged data is abandoned in both cases.
pub struct Sender {
    shared: Arc<Shared>,
    config: SessionConfig,
    shutdown_tx: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl Sender {
    /// Validate `config`, bind the socket and start the ACK loop.
    ///
    /// Must be called from within a tokio runtime; timers are spawned on it.
    pub async fn open(config: SessionConfig) -> Result<Self, SessionError> {
        config.validate()?;
        let socket = Arc::new(Socket::bind(config.bind, config.peer).await?);
        let link: Arc<dyn Transmit> = socket.clone();
        Ok(Self::start(config, socket, link))
    }

    /// Build the shared state around a bound socket and spawn the ACK loop.
    /// Reads come from `socket`; every transmission goes through `link`.
    fn start(config: SessionConfig, socket: Arc<Socket>, link: Arc<dyn Transmit>) -> Self {
        let runtime = Handle::current();

        let shared = Arc::new_cyclic(|weak: &Weak<Shared>| {
            let weak = weak.clone();
            let expiry: ExpiryFn = Arc::new(move |token: TimerToken| {
                if let Some(shared) = weak.upgrade() {
                    shared.timer_fired(token);
                }
            });
            Shared {
                window: Mutex::new(WindowState::new(
                    &config,
                    TimerRegistry::new(runtime),
                    expiry,
                )),
                socket: Arc::clone(&socket),
                link,
                progress: Notify::new(),
                acks: AtomicU64::new(0),
                advancing_acks: AtomicU64::new(0),
                invalid: AtomicU64::new(0),
                foreign: AtomicU64::new(0),
            }
        });

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(ack_loop(
            Arc::clone(&shared),
            shutdown_rx,
            config.read_timeout,
        ));

        log::info!(
            "[sr] session {} → {} (window={}, rto={:?}, {:?}, {:?})",
            socket.local_addr,
            socket.peer,
            config.window_capacity,
            config.retransmit_timeout,
            config.ack_mode,
            config.spacing
        );

        Self {
            shared,
            config,
            shutdown_tx,
            task: Some(task),
        }
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.shared.socket.local_addr
    }

    pub fn peer(&self) -> SocketAddr {
        self.shared.socket.peer
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    // -----------------------------------------------------------------------
    // Scheduling
    // -----------------------------------------------------------------------

    /// Split `bytes` into segments, queue them and transmit as many as the
    /// window allows.  Returns the sequence numbers in stream order; an empty
    /// message yields none.  Never waits for the network.
    pub fn enqueue_message(&self, bytes: &[u8]) -> Result<Vec<u32>, SessionError> {
        self.enqueue_messages(std::iter::once(bytes))
    }

    /// Like [`Sender::enqueue_message`] for a batch, with a single
    /// transmission attempt after the whole batch is queued.
    pub fn enqueue_messages<I, B>(&self, messages: I) -> Result<Vec<u32>, SessionError>
    where
        I: IntoIterator<Item = B>,
        B: AsRef<[u8]>,
    {
        let mut window = self.shared.lock();
        let mut seqs = Vec::new();
        for message in messages {
            for chunk in message.as_ref().chunks(self.config.max_payload) {
                seqs.push(window.admit(chunk.to_vec())?);
            }
        }
        window.try_transmit_pending(&*self.shared.link);
        Ok(seqs)
    }

    // -----------------------------------------------------------------------
    // Completion
    // -----------------------------------------------------------------------

    /// Wait until every sequence in `seqs` is confirmed and retired.
    ///
    /// Does not return while the channel stays down; bound it with
    /// `tokio::time::timeout` where that matters.
    pub async fn await_all(&self, seqs: &[u32]) {
        self.wait_until(|window| window.all_retired(seqs)).await;
    }

    /// Wait until everything enqueued so far is confirmed and retired.
    pub async fn flush(&self) {
        self.wait_until(WindowState::is_idle).await;
    }

    /// Enqueue `bytes` and wait for all of its segments to be confirmed.
    pub async fn send_and_confirm(&self, bytes: &[u8]) -> Result<Vec<u32>, SessionError> {
        let seqs = self.enqueue_message(bytes)?;
        self.await_all(&seqs).await;
        Ok(seqs)
    }

    /// Enqueue a whole batch at once and wait until all of it is confirmed.
    /// Messages share the window, so later ones do not wait for earlier ACKs.
    pub async fn send_messages_and_confirm<I, B>(
        &self,
        messages: I,
    ) -> Result<Vec<u32>, SessionError>
    where
        I: IntoIterator<Item = B>,
        B: AsRef<[u8]>,
    {
        let seqs = self.enqueue_messages(messages)?;
        self.await_all(&seqs).await;
        Ok(seqs)
    }

    async fn wait_until<F>(&self, mut done: F)
    where
        F: FnMut(&WindowState) -> bool,
    {
        loop {
            // Registered before the check so a concurrent notify is not lost.
            let notified = self.shared.progress.notified();
            if done(&self.shared.lock()) {
                return;
            }
            let _ = tokio::time::timeout(self.config.poll_interval, notified).await;
        }
    }

    // -----------------------------------------------------------------------
    // Introspection
    // -----------------------------------------------------------------------

    pub fn snapshot(&self) -> WindowSnapshot {
        self.shared.lock().snapshot()
    }

    pub fn is_retired(&self, seq: u32) -> bool {
        self.shared.lock().is_retired(seq)
    }

    pub fn stats(&self) -> SessionStats {
        SessionStats {
            acks: self.shared.acks.load(Ordering::Relaxed),
            advancing_acks: self.shared.advancing_acks.load(Ordering::Relaxed),
            invalid: self.shared.invalid.load(Ordering::Relaxed),
            foreign: self.shared.foreign.load(Ordering::Relaxed),
            retransmissions: self.shared.lock().retransmissions(),
        }
    }

    // -----------------------------------------------------------------------
    // Shutdown
    // -----------------------------------------------------------------------

    /// Stop the ACK loop, cancel every timer and wait for the loop to exit.
    pub async fn shutdown(mut self) {
        self.stop();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
        log::info!("[sr] session {} closed", self.local_addr());
    }

    fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
        self.shared.lock().cancel_timers();
    }
}

impl Drop for Sender {
    fn drop(&mut self) {
        self.stop();
    }
}

// ---------------------------------------------------------------------------
// ACK receiver loop
// ---------------------------------------------------------------------------

async fn ack_loop(
    shared: Arc<Shared>,
    mut shutdown: watch::Receiver<bool>,
    read_timeout: std::time::Duration,
) {
    let mut buf = vec![0u8; MAX_DATAGRAM];

    loop {
        tokio::select! {
            // A closed channel means the Sender is gone; stop as well.
            _ = shutdown.changed() => break,

            result = shared.socket.recv_timeout(&mut buf, read_timeout) => match result {
                Ok(Some((n, from))) => shared.on_datagram(&buf[..n], from),
                Ok(None) => shared.on_idle(),
                Err(e) if is_transient(&e) => {
                    log::trace!("[sr:ack] transient socket error: {e}");
                }
                Err(e) => {
                    log::warn!("[sr:ack] socket error: {e}; stopping");
                    break;
                }
            },
        }
    }
    log::debug!("[sr:ack] loop stopped");
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

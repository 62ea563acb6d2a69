//! Entry point for `sr-over-udp`.
//!
//! Parses CLI arguments and dispatches into **send**, **receive** or **relay**
//! mode.  All protocol work is delegated to library modules; `main.rs` owns
//! only process setup (logging, argument parsing, stdin/stdout).

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

use sr_over_udp::config::DEFAULT_PEER_PORT;
use sr_over_udp::{
    AckMode, Impairment, Receiver, ReceiverConfig, Relay, RelayConfig, Sender, SeqSpacing,
    SessionConfig,
};

/// Selective-Repeat reliable byte stream over UDP.
#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    #[command(subcommand)]
    mode: Mode,
}

#[derive(Subcommand)]
enum Mode {
    /// Send messages reliably to a receiver (usually through a relay).
    Send {
        /// Destination address (relay or receiver).
        #[arg(short, long, default_value_t = SocketAddr::from(([127, 0, 0, 1], DEFAULT_PEER_PORT)))]
        peer: SocketAddr,
        /// Local address to bind.
        #[arg(short, long, default_value = "0.0.0.0:0")]
        bind: SocketAddr,
        /// Maximum segments in flight.
        #[arg(short, long, default_value_t = 5)]
        window: usize,
        /// Retransmission timeout in milliseconds.
        #[arg(long, default_value_t = 1000)]
        timeout_ms: u64,
        /// Maximum payload bytes per segment.
        #[arg(long, default_value_t = 16)]
        payload: usize,
        #[command(flatten)]
        discipline: Discipline,
        /// Messages to send; stdin lines are sent when none are given.
        messages: Vec<String>,
    },
    /// Receive a stream and print each delivered chunk.
    Receive {
        /// Local address to bind.
        #[arg(short, long, default_value = "127.0.0.1:0")]
        bind: SocketAddr,
        /// Relay to register with on startup.
        #[arg(short, long)]
        register: Option<SocketAddr>,
        #[command(flatten)]
        discipline: Discipline,
    },
    /// Forward datagrams between two endpoints, injecting faults.
    Relay {
        /// Local address to bind.
        #[arg(short, long, default_value_t = SocketAddr::from(([127, 0, 0, 1], DEFAULT_PEER_PORT)))]
        bind: SocketAddr,
        /// normal, loss, corruption, delay, duplication or reorder.
        #[arg(short, long, default_value = "normal")]
        mode: Impairment,
        /// Chance that a datagram is impaired.
        #[arg(long, default_value_t = 1.0)]
        probability: f64,
        /// Hold time in delay mode, in milliseconds.
        #[arg(long, default_value_t = 1000)]
        delay_ms: u64,
    },
}

/// Flags both endpoints of a session must agree on.
#[derive(clap::Args)]
struct Discipline {
    /// Use cumulative (Go-Back-N style) acknowledgements.
    #[arg(long)]
    cumulative: bool,
    /// Advance sequence numbers by one per segment instead of by bit offset.
    #[arg(long)]
    segment_index: bool,
}

impl Discipline {
    fn ack_mode(&self) -> AckMode {
        if self.cumulative {
            AckMode::Cumulative
        } else {
            AckMode::Selective
        }
    }

    fn spacing(&self) -> SeqSpacing {
        if self.segment_index {
            SeqSpacing::SegmentIndex
        } else {
            SeqSpacing::BitOffset
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialise env_logger; set RUST_LOG to control verbosity.
    env_logger::init();

    let cli = Cli::parse();

    match cli.mode {
        Mode::Send {
            peer,
            bind,
            window,
            timeout_ms,
            payload,
            discipline,
            messages,
        } => {
            let config = SessionConfig {
                bind,
                peer,
                window_capacity: window,
                retransmit_timeout: Duration::from_millis(timeout_ms),
                max_payload: payload,
                ack_mode: discipline.ack_mode(),
                spacing: discipline.spacing(),
                ..SessionConfig::default()
            };
            send(config, messages).await
        }
        Mode::Receive {
            bind,
            register,
            discipline,
        } => {
            let config = ReceiverConfig {
                bind,
                register,
                ack_mode: discipline.ack_mode(),
                spacing: discipline.spacing(),
                ..ReceiverConfig::default()
            };
            receive(config).await
        }
        Mode::Relay {
            bind,
            mode,
            probability,
            delay_ms,
        } => {
            let config = RelayConfig {
                bind,
                mode,
                probability,
                delay: Duration::from_millis(delay_ms),
                seed: None,
            };
            relay(config).await
        }
    }
}

async fn send(config: SessionConfig, messages: Vec<String>) -> anyhow::Result<()> {
    let sender = Sender::open(config).await.context("opening session")?;
    log::info!("Sending from {} to {}", sender.local_addr(), sender.peer());

    if messages.is_empty() {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Some(line) = lines.next_line().await? {
            let seqs = sender.send_and_confirm(line.as_bytes()).await?;
            log::info!("confirmed {} segment(s)", seqs.len());
        }
    } else {
        let seqs = sender.send_messages_and_confirm(&messages).await?;
        log::info!(
            "confirmed {} message(s) in {} segment(s)",
            messages.len(),
            seqs.len()
        );
    }

    let stats = sender.stats();
    log::info!(
        "done: {} ACKs, {} retransmissions, {} invalid and {} foreign datagrams",
        stats.acks,
        stats.retransmissions,
        stats.invalid,
        stats.foreign
    );
    sender.shutdown().await;
    Ok(())
}

async fn receive(config: ReceiverConfig) -> anyhow::Result<()> {
    let mut receiver = Receiver::bind(config).await.context("binding receiver")?;
    log::info!("Receiving on {}", receiver.local_addr());

    let mut stdout = tokio::io::stdout();
    loop {
        let chunk = receiver.recv().await?;
        stdout.write_all(&chunk).await?;
        stdout.write_all(b"\n").await?;
        stdout.flush().await?;
    }
}

async fn relay(config: RelayConfig) -> anyhow::Result<()> {
    let relay = Relay::bind(config).await.context("binding relay")?;
    let handle = relay.handle();
    let task = tokio::spawn(relay.run());

    tokio::signal::ctrl_c().await?;
    let stats = handle.stats();
    log::info!(
        "received {} forwarded {} dropped {} corrupted {}",
        stats.received,
        stats.forwarded,
        stats.dropped,
        stats.corrupted
    );
    handle.shutdown();
    task.await??;
    Ok(())
}

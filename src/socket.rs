//! UDP socket abstraction.
//!
//! [`Socket`] is a thin wrapper around `tokio::net::UdpSocket` bound to one
//! fixed peer.  All protocol logic lives elsewhere; this module owns only
//! byte I/O.
//!
//! Outbound transmission goes through the [`Transmit`] trait so the window
//! state machine can send while holding the session lock: it never awaits,
//! and a full socket buffer surfaces as an error instead of blocking.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::UdpSocket;

/// Largest datagram the receive paths accept.
pub const MAX_DATAGRAM: usize = 2048;

/// Non-blocking transmission of one datagram to the session peer.
pub trait Transmit: Send + Sync {
    fn transmit(&self, datagram: &[u8]) -> io::Result<()>;
}

/// An async UDP socket paired with its session peer.
///
/// All methods are `&self` so the socket can be shared between the ACK loop
/// and the window (through [`Transmit`]).
#[derive(Debug)]
pub struct Socket {
    /// Address this socket is bound to (filled in after the OS assigns a port).
    pub local_addr: SocketAddr,
    /// Destination of every outbound datagram.
    pub peer: SocketAddr,
    inner: UdpSocket,
}

impl Socket {
    /// Bind a new socket to `local_addr` that sends to `peer`.
    ///
    /// Passing `0.0.0.0:0` lets the OS choose an ephemeral port.
    pub async fn bind(local_addr: SocketAddr, peer: SocketAddr) -> io::Result<Self> {
        let inner = UdpSocket::bind(local_addr).await?;
        // try_send_to refuses to attempt a send until the reactor has seen
        // the socket become writable once.
        inner.writable().await?;
        let local_addr = inner.local_addr()?;
        Ok(Self {
            local_addr,
            peer,
            inner,
        })
    }

    /// Receive the next datagram into `buf`, giving up after `wait`.
    ///
    /// Returns `Ok(None)` on timeout.
    pub async fn recv_timeout(
        &self,
        buf: &mut [u8],
        wait: Duration,
    ) -> io::Result<Option<(usize, SocketAddr)>> {
        match tokio::time::timeout(wait, self.inner.recv_from(buf)).await {
            Ok(result) => result.map(Some),
            Err(_elapsed) => Ok(None),
        }
    }
}

impl Transmit for Socket {
    fn transmit(&self, datagram: &[u8]) -> io::Result<()> {
        let sent = self.inner.try_send_to(datagram, self.peer)?;
        if sent != datagram.len() {
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                format!("short send: {sent} of {} bytes", datagram.len()),
            ));
        }
        Ok(())
    }
}

/// Returns true if the error is likely transient (a later attempt may succeed).
pub fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock
            | io::ErrorKind::TimedOut
            | io::ErrorKind::Interrupted
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionReset
    )
}

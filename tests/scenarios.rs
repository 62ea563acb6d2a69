//! Protocol scenarios driven by a hand-rolled peer.
//!
//! The peer is a bare `UdpSocket` that decodes what the `Sender` transmits and
//! chooses exactly which ACKs to return, so ordering, corruption and
//! retransmission can be checked byte for byte.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::time::{sleep, timeout};

use sr_over_udp::segment::{self, Segment};
use sr_over_udp::socket::MAX_DATAGRAM;
use sr_over_udp::{Sender, SessionConfig};

const DEADLINE: Duration = Duration::from_secs(5);

/// Bind a raw peer socket and open a sender aimed at it.
async fn pair(window: usize, rto: Duration) -> (UdpSocket, Sender) {
    let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let sender = Sender::open(SessionConfig {
        bind: "127.0.0.1:0".parse().unwrap(),
        window_capacity: window,
        retransmit_timeout: rto,
        read_timeout: Duration::from_millis(50),
        ..SessionConfig::new(peer.local_addr().unwrap())
    })
    .await
    .unwrap();
    (peer, sender)
}

async fn next_datagram(peer: &UdpSocket) -> (Vec<u8>, SocketAddr) {
    let mut buf = [0u8; MAX_DATAGRAM];
    let (n, from) = timeout(DEADLINE, peer.recv_from(&mut buf))
        .await
        .expect("no datagram from sender")
        .unwrap();
    (buf[..n].to_vec(), from)
}

async fn ack(peer: &UdpSocket, to: SocketAddr, seq: u32) {
    peer.send_to(&Segment::ack(seq).encode(), to).await.unwrap();
}

/// Poll until `cond` holds or the deadline passes.
async fn eventually(mut cond: impl FnMut() -> bool) {
    timeout(DEADLINE, async {
        while !cond() {
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition never became true");
}

// ---------------------------------------------------------------------------
// Test 1: out-of-order ACKs with window capacity 2
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_out_of_order_acks_slide_window() {
    let (peer, sender) = pair(2, Duration::from_secs(10)).await;

    // Three full segments: 0, 224, 448.
    let seqs = sender.enqueue_message(&[0x42; 48]).unwrap();
    assert_eq!(seqs.len(), 3);

    let (d0, from) = next_datagram(&peer).await;
    let (d1, _) = next_datagram(&peer).await;
    assert_eq!(Segment::decode(&d0).unwrap().seq, seqs[0]);
    assert_eq!(Segment::decode(&d1).unwrap().seq, seqs[1]);
    assert_eq!(sender.snapshot().queued, 1);

    // ACK segment 1 first: confirmed but not retired, base unchanged.
    ack(&peer, from, seqs[1]).await;
    eventually(|| sender.snapshot().confirmed == 1).await;
    assert_eq!(sender.snapshot().base, seqs[0]);
    assert!(!sender.is_retired(seqs[1]));

    // Segment 2 stays queued across several idle ticks while base is stuck.
    let mut buf = [0u8; MAX_DATAGRAM];
    let early = timeout(Duration::from_millis(300), peer.recv_from(&mut buf)).await;
    assert!(early.is_err(), "segment sent past the window: {early:?}");
    assert_eq!(sender.snapshot().queued, 1);
    assert_eq!(sender.snapshot().buffered, 2);

    // ACK segment 0: both retire and segment 2 goes out.
    ack(&peer, from, seqs[0]).await;
    let (d2, _) = next_datagram(&peer).await;
    assert_eq!(Segment::decode(&d2).unwrap().seq, seqs[2]);
    assert_eq!(sender.snapshot().base, seqs[2]);
    assert!(sender.is_retired(seqs[0]) && sender.is_retired(seqs[1]));

    ack(&peer, from, seqs[2]).await;
    timeout(DEADLINE, sender.await_all(&seqs)).await.unwrap();
    sender.shutdown().await;
}

// ---------------------------------------------------------------------------
// Test 2: corruption in transit, byte-identical retransmission
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_corrupted_segment_is_retransmitted_unchanged() {
    let (peer, sender) = pair(5, Duration::from_millis(100)).await;
    let seqs = sender.enqueue_message(b"fragile").unwrap();

    let (original, from) = next_datagram(&peer).await;
    let mut damaged = original.clone();
    damaged[segment::HEADER_LEN + 2] ^= 0x10;
    assert!(Segment::decode(&damaged).is_err(), "corruption went unnoticed");

    // The receiver drops the damaged copy and stays silent; the sender's
    // timer resends the exact same bytes.
    let (retransmitted, _) = next_datagram(&peer).await;
    assert_eq!(retransmitted, original);

    let decoded = Segment::decode(&retransmitted).unwrap();
    assert_eq!(decoded.payload(), b"fragile");
    ack(&peer, from, decoded.seq).await;

    timeout(DEADLINE, sender.await_all(&seqs)).await.unwrap();
    assert!(sender.stats().retransmissions >= 1);
    sender.shutdown().await;
}

// ---------------------------------------------------------------------------
// Test 3: corrupted, duplicate and stale ACKs change nothing
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_bad_acks_are_ignored() {
    let (peer, sender) = pair(5, Duration::from_secs(10)).await;
    let seqs = sender.enqueue_message(&[1u8; 32]).unwrap();
    let (_, from) = next_datagram(&peer).await;
    let _ = next_datagram(&peer).await;

    // Corrupted ACK.
    let mut bad = Segment::ack(seqs[0]).encode();
    bad[4] ^= 0x01;
    peer.send_to(&bad, from).await.unwrap();
    eventually(|| sender.stats().invalid == 1).await;
    assert!(!sender.is_retired(seqs[0]));

    // Data segment from the peer is not an ACK.
    let stray = Segment::data(seqs[0], b"??".to_vec()).unwrap();
    peer.send_to(&stray.encode(), from).await.unwrap();

    // Valid ACK, then the same ACK again plus one for an unknown sequence.
    ack(&peer, from, seqs[0]).await;
    eventually(|| sender.is_retired(seqs[0])).await;
    let before = sender.snapshot();
    ack(&peer, from, seqs[0]).await;
    ack(&peer, from, 12_345).await;
    eventually(|| sender.stats().acks == 3).await;
    assert_eq!(sender.snapshot(), before);

    ack(&peer, from, seqs[1]).await;
    timeout(DEADLINE, sender.flush()).await.unwrap();
    assert_eq!(sender.stats().advancing_acks, 2);
    sender.shutdown().await;
}

// ---------------------------------------------------------------------------
// Test 4: the window never exceeds its capacity under timeouts
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_window_capacity_respected_while_retransmitting() {
    let (peer, sender) = pair(3, Duration::from_millis(30)).await;
    let seqs = sender.enqueue_message(&[9u8; 16 * 8]).unwrap();
    assert_eq!(seqs.len(), 8);

    // Stay silent for several timeout periods: only the first three segments
    // may ever be seen.
    let mut seen = HashSet::new();
    let quiet = tokio::time::Instant::now() + Duration::from_millis(200);
    let mut from = None;
    while tokio::time::Instant::now() < quiet {
        let mut buf = [0u8; MAX_DATAGRAM];
        if let Ok(Ok((n, addr))) =
            tokio::time::timeout_at(quiet, peer.recv_from(&mut buf)).await
        {
            seen.insert(Segment::decode(&buf[..n]).unwrap().seq);
            from = Some(addr);
        }
        assert!(sender.snapshot().in_flight <= 3);
    }
    assert_eq!(seen, seqs[..3].iter().copied().collect::<HashSet<u32>>());

    // Now acknowledge everything as it arrives.
    let from = from.expect("sender never transmitted");
    let drain = async {
        while !seqs.iter().all(|&s| sender.is_retired(s)) {
            let mut buf = [0u8; MAX_DATAGRAM];
            if let Ok(Ok((n, _))) =
                timeout(Duration::from_millis(50), peer.recv_from(&mut buf)).await
            {
                let seq = Segment::decode(&buf[..n]).unwrap().seq;
                ack(&peer, from, seq).await;
            }
            assert!(sender.snapshot().in_flight <= 3);
        }
    };
    timeout(DEADLINE, drain).await.expect("window never drained");
    sender.shutdown().await;
}

// ---------------------------------------------------------------------------
// Test 5: a persistently lost first segment holds the whole stream back
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_stuck_base_keeps_buffer_bounded() {
    let (peer, sender) = pair(2, Duration::from_millis(50)).await;
    let seqs = sender.enqueue_message(&[5u8; 16 * 20]).unwrap();
    assert_eq!(seqs.len(), 20);

    // Acknowledge everything except segment 0 for many timeout periods.
    let mut seen = HashSet::new();
    let mut from = None;
    let quiet = tokio::time::Instant::now() + Duration::from_millis(600);
    while tokio::time::Instant::now() < quiet {
        let mut buf = [0u8; MAX_DATAGRAM];
        if let Ok(Ok((n, addr))) =
            tokio::time::timeout_at(quiet, peer.recv_from(&mut buf)).await
        {
            let seq = Segment::decode(&buf[..n]).unwrap().seq;
            seen.insert(seq);
            from = Some(addr);
            if seq != seqs[0] {
                ack(&peer, addr, seq).await;
            }
        }
        let snapshot = sender.snapshot();
        assert!(snapshot.buffered <= 2, "{snapshot:?}");
        assert_eq!(snapshot.base, seqs[0]);
    }
    assert_eq!(seen, seqs[..2].iter().copied().collect::<HashSet<u32>>());
    assert_eq!(sender.snapshot().queued, 18);
    assert!(sender.stats().retransmissions >= 1);

    // Segment 0 finally gets through; the rest of the stream follows.
    let from = from.expect("sender never transmitted");
    ack(&peer, from, seqs[0]).await;
    let drain = async {
        while !seqs.iter().all(|&s| sender.is_retired(s)) {
            let mut buf = [0u8; MAX_DATAGRAM];
            if let Ok(Ok((n, _))) =
                timeout(Duration::from_millis(50), peer.recv_from(&mut buf)).await
            {
                let seq = Segment::decode(&buf[..n]).unwrap().seq;
                ack(&peer, from, seq).await;
            }
            assert!(sender.snapshot().buffered <= 2);
        }
    };
    timeout(DEADLINE, drain).await.expect("stream never drained");
    sender.shutdown().await;
}

//! Per-peer Selective-Repeat session over UDP.
//!
//! Reliability comes from per-packet timers and independent, selective
//! retransmission; reordering support lets the receiver buffer out-of-order
//! packets and still deliver them to the application in order. There is no
//! congestion control: the send rate is capped by a fixed inter-packet gap
//! (`SEND_GAP`) combined with the small `MAX_PAYLOAD`, intentionally keeping
//! throughput under 500 bps.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::packet::{Packet, MAX_PAYLOAD};

/// Generous default so the link tolerates emulator delay plus the low rate.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(2000);
/// Default Selective-Repeat window size.
pub const DEFAULT_WINDOW: usize = 8;
/// Fixed gap enforced between successive sends: ~427 bps for 32B payloads.
pub const SEND_GAP: Duration = Duration::from_millis(600);

const RETX_TICK: Duration = Duration::from_millis(10);
const WINDOW_POLL: Duration = Duration::from_millis(5);

struct SessionState {
    // Sender.
    next_seq: u32,
    sent: HashMap<u32, (Bytes, Instant)>,
    acked: HashSet<u32>,

    // Receiver.
    expected: u32,
    recv_buf: BTreeMap<u32, Bytes>,
    app_queue: VecDeque<Bytes>,
}

impl SessionState {
    fn new() -> Self {
        Self {
            next_seq: 0,
            sent: HashMap::new(),
            acked: HashSet::new(),
            expected: 0,
            recv_buf: BTreeMap::new(),
            app_queue: VecDeque::new(),
        }
    }

    fn inflight(&self) -> usize {
        self.sent.keys().filter(|s| !self.acked.contains(s)).count()
    }
}

/// A single peer's reliable session. Cheaply cloneable: clones share the
/// same underlying state and background retransmission task.
#[derive(Clone)]
pub struct Session {
    inner: Arc<Inner>,
}

struct Inner {
    socket: Arc<UdpSocket>,
    peer: SocketAddr,
    window: usize,
    timeout: Duration,
    state: Mutex<SessionState>,
    running: AtomicBool,
    retx_handle: Mutex<Option<JoinHandle<()>>>,
}

impl Session {
    /// Create a new session bound to `peer` over the shared `socket`,
    /// spawning its background retransmission task.
    pub fn new(socket: Arc<UdpSocket>, peer: SocketAddr) -> Self {
        Self::with_params(socket, peer, DEFAULT_WINDOW, DEFAULT_TIMEOUT)
    }

    pub fn with_params(
        socket: Arc<UdpSocket>,
        peer: SocketAddr,
        window: usize,
        timeout: Duration,
    ) -> Self {
        let inner = Arc::new(Inner {
            socket,
            peer,
            window,
            timeout,
            state: Mutex::new(SessionState::new()),
            running: AtomicBool::new(true),
            retx_handle: Mutex::new(None),
        });

        let session = Self { inner };
        let handle = tokio::task::spawn(session.clone().retx_loop());
        *session.inner.retx_handle.lock() = Some(handle);
        session
    }

    /// Reliable send with windowing and the fixed inter-packet gap. Splits
    /// `data` into `MAX_PAYLOAD`-sized chunks, each its own sequence number.
    pub async fn send(&self, data: Bytes) {
        let mut offset = 0usize;
        while offset < data.len() {
            let end = (offset + MAX_PAYLOAD).min(data.len());
            let chunk = data.slice(offset..end);

            let seq = self.wait_for_window_slot().await;
            let pkt = Packet::data(seq, chunk.clone());
            let wire = pkt.encode();

            if let Err(e) = self.inner.socket.send_to(&wire, self.inner.peer).await {
                warn!(peer = %self.inner.peer, seq, error = %e, "send error");
            }
            // Start the timer only after the real send, matching the
            // original sender's ordering.
            {
                let mut state = self.inner.state.lock();
                state.sent.insert(seq, (wire, Instant::now()));
            }
            trace!(peer = %self.inner.peer, seq, len = chunk.len(), "TX");

            offset = end;
            tokio::time::sleep(SEND_GAP).await;
        }
    }

    async fn wait_for_window_slot(&self) -> u32 {
        loop {
            {
                let mut state = self.inner.state.lock();
                if state.inflight() < self.inner.window {
                    let seq = state.next_seq;
                    state.next_seq = state.next_seq.wrapping_add(1);
                    return seq;
                }
            }
            tokio::time::sleep(WINDOW_POLL).await;
        }
    }

    /// Feed a raw datagram received from `peer` into this session. Bad
    /// checksums and undecodable buffers are logged and dropped -- they
    /// never surface as an error to the caller.
    pub async fn handle_raw(&self, raw: &[u8]) {
        let Some((pkt, ok)) = Packet::decode(raw) else {
            debug!(peer = %self.inner.peer, "undecodable packet (drop)");
            return;
        };
        if !ok {
            debug!(peer = %self.inner.peer, seq = pkt.seq_num, "checksum BAD (drop)");
            return;
        }
        if pkt.is_ack() {
            self.on_ack(pkt.seq_num);
        } else {
            self.on_data(pkt.seq_num, pkt.payload).await;
        }
    }

    fn on_ack(&self, ack_seq: u32) {
        let mut state = self.inner.state.lock();
        if state.sent.remove(&ack_seq).is_some() {
            state.acked.insert(ack_seq);
            trace!(peer = %self.inner.peer, seq = ack_seq, "ACK received");
        }
    }

    async fn on_data(&self, seq: u32, payload: Bytes) {
        self.send_ack(seq).await;

        let mut state = self.inner.state.lock();
        if seq < state.expected || state.recv_buf.contains_key(&seq) {
            return;
        }
        state.recv_buf.insert(seq, payload);
        while let Some(piece) = state.recv_buf.remove(&state.expected) {
            trace!(peer = %self.inner.peer, seq = state.expected, len = piece.len(), "DELIVER");
            state.app_queue.push_back(piece);
            state.expected = state.expected.wrapping_add(1);
        }
    }

    async fn send_ack(&self, seq: u32) {
        let wire = Packet::ack(seq).encode();
        if let Err(e) = self.inner.socket.send_to(&wire, self.inner.peer).await {
            warn!(peer = %self.inner.peer, seq, error = %e, "ACK send error");
        }
    }

    /// Drain and return whatever application bytes have been delivered
    /// in-order so far.
    pub fn recv_available(&self) -> Bytes {
        let mut state = self.inner.state.lock();
        if state.app_queue.is_empty() {
            return Bytes::new();
        }
        let mut out = Vec::new();
        while let Some(piece) = state.app_queue.pop_front() {
            out.extend_from_slice(&piece);
        }
        Bytes::from(out)
    }

    /// Stop the background retransmission task. Idempotent.
    pub async fn stop(&self) {
        self.inner.running.store(false, Ordering::Relaxed);
        let handle = self.inner.retx_handle.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    async fn retx_loop(self) {
        while self.inner.running.load(Ordering::Relaxed) {
            let now = Instant::now();
            let to_retx: Vec<u32> = {
                let state = self.inner.state.lock();
                state
                    .sent
                    .iter()
                    .filter_map(|(seq, (_, last))| {
                        if !state.acked.contains(seq) && now.duration_since(*last) >= self.inner.timeout {
                            Some(*seq)
                        } else {
                            None
                        }
                    })
                    .collect()
            };

            for seq in to_retx {
                let wire = {
                    let mut state = self.inner.state.lock();
                    match state.sent.get_mut(&seq) {
                        Some((wire, last)) => {
                            *last = Instant::now();
                            wire.clone()
                        }
                        None => continue,
                    }
                };
                if let Err(e) = self.inner.socket.send_to(&wire, self.inner.peer).await {
                    if !self.inner.running.load(Ordering::Relaxed) {
                        return;
                    }
                    warn!(peer = %self.inner.peer, seq, error = %e, "RETX send error");
                } else {
                    trace!(peer = %self.inner.peer, seq, "RETX");
                }
            }

            tokio::time::sleep(RETX_TICK).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    async fn bound_socket() -> Arc<UdpSocket> {
        Arc::new(
            UdpSocket::bind((Ipv4Addr::LOCALHOST, 0))
                .await
                .expect("bind"),
        )
    }

    #[tokio::test]
    async fn send_and_receive_round_trip() {
        let a_sock = bound_socket().await;
        let b_sock = bound_socket().await;
        let a_addr = a_sock.local_addr().unwrap();
        let b_addr = b_sock.local_addr().unwrap();

        let a = Session::with_params(a_sock.clone(), b_addr, 8, Duration::from_millis(200));
        let b = Session::with_params(b_sock.clone(), a_addr, 8, Duration::from_millis(200));

        tokio::spawn({
            let b = b.clone();
            async move {
                let mut buf = [0u8; 2048];
                loop {
                    match b.inner_socket_recv(&mut buf).await {
                        Some(n) => b.handle_raw(&buf[..n]).await,
                        None => break,
                    }
                }
            }
        });
        tokio::spawn({
            let a = a.clone();
            async move {
                let mut buf = [0u8; 2048];
                loop {
                    match a.inner_socket_recv(&mut buf).await {
                        Some(n) => a.handle_raw(&buf[..n]).await,
                        None => break,
                    }
                }
            }
        });

        a.send(Bytes::from_static(b"hi")).await;

        let mut got = Bytes::new();
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            let chunk = b.recv_available();
            if !chunk.is_empty() {
                got = chunk;
                break;
            }
        }
        assert_eq!(&got[..], b"hi");

        a.stop().await;
        b.stop().await;
    }

    #[test]
    fn window_gates_inflight_count() {
        let mut state = SessionState::new();
        state.sent.insert(0, (Bytes::new(), Instant::now()));
        state.sent.insert(1, (Bytes::new(), Instant::now()));
        assert_eq!(state.inflight(), 2);
        state.acked.insert(0);
        assert_eq!(state.inflight(), 1);
    }

    #[test]
    fn out_of_order_delivery_drains_in_order() {
        let mut state = SessionState::new();
        state.recv_buf.insert(1, Bytes::from_static(b"B"));
        state.recv_buf.insert(2, Bytes::from_static(b"C"));
        assert!(state.recv_buf.remove(&state.expected).is_none());

        state.recv_buf.insert(0, Bytes::from_static(b"A"));
        let mut delivered = Vec::new();
        while let Some(piece) = state.recv_buf.remove(&state.expected) {
            delivered.push(piece);
            state.expected = state.expected.wrapping_add(1);
        }
        assert_eq!(delivered, vec![
            Bytes::from_static(b"A"),
            Bytes::from_static(b"B"),
            Bytes::from_static(b"C"),
        ]);
    }

    impl Session {
        async fn inner_socket_recv(&self, buf: &mut [u8]) -> Option<usize> {
            tokio::time::timeout(Duration::from_secs(2), self.inner.socket.recv_from(buf))
                .await
                .ok()
                .and_then(|r| r.ok())
                .map(|(n, _)| n)
        }
    }
}

//! Bidirectional UDP relay that injects loss, corruption, duplication, and
//! reordering between a single client and a single server.
//!
//! The emulator owns two sockets: one facing the client ("A"), one facing
//! the server ("B"). It remembers the last client address seen on A so it
//! knows where to relay B's replies -- there is no handshake, the first
//! datagram from the client is what establishes that binding. Each
//! forwarded datagram runs through an independent Bernoulli trial pipeline
//! (loss, then corruption, then duplication, then reordering) in that
//! fixed order, matching the reference emulator.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use tokio::net::UdpSocket;
use tracing::{debug, info, warn};

const BUF_SIZE: usize = 65535;
const REORDER_DELAY_MIN: Duration = Duration::from_millis(50);
const REORDER_DELAY_MAX: Duration = Duration::from_millis(300);

#[derive(Debug, Clone, Copy, Default)]
pub struct ImpairmentParams {
    pub loss: f64,
    pub corrupt: f64,
    pub reorder: f64,
    pub dup: f64,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum Direction {
    AToServer,
    ServerToA,
}

impl Direction {
    fn label(self) -> &'static str {
        match self {
            Direction::AToServer => "A->Server",
            Direction::ServerToA => "Server->A",
        }
    }
}

/// A single packet held back by the reorder step, to be released once its
/// delay elapses. Only one slot exists at a time, matching the reference
/// emulator's single-packet reorder buffer.
struct ReorderSlot {
    data: Vec<u8>,
    dst: Target,
    direction: Direction,
    release_at: Instant,
}

#[derive(Clone, Copy)]
enum Target {
    ToClient(SocketAddr),
    ToServer(SocketAddr),
}

pub struct Emulator {
    sock_a: UdpSocket,
    sock_b: UdpSocket,
    server_addr: SocketAddr,
    params: ImpairmentParams,
    last_client: Option<SocketAddr>,
    reorder_slot: Option<ReorderSlot>,
}

impl Emulator {
    pub async fn bind(
        listen_a: SocketAddr,
        listen_b: SocketAddr,
        server_addr: SocketAddr,
        params: ImpairmentParams,
    ) -> std::io::Result<Self> {
        let sock_a = UdpSocket::bind(listen_a).await?;
        let sock_b = UdpSocket::bind(listen_b).await?;
        info!(%listen_a, %listen_b, %server_addr, ?params, "emulator bound");
        Ok(Self {
            sock_a,
            sock_b,
            server_addr,
            params,
            last_client: None,
            reorder_slot: None,
        })
    }

    /// The bound local address of the client-facing ("A") socket.
    pub fn local_addr_a(&self) -> SocketAddr {
        self.sock_a.local_addr().expect("socket bound")
    }

    /// The bound local address of the server-facing ("B") socket.
    pub fn local_addr_b(&self) -> SocketAddr {
        self.sock_b.local_addr().expect("socket bound")
    }

    /// Run the relay loop forever (until the process is killed).
    pub async fn run(&mut self) -> std::io::Result<()> {
        let mut buf = [0u8; BUF_SIZE];
        loop {
            let release_sleep = match &self.reorder_slot {
                Some(slot) => slot.release_at.saturating_duration_since(Instant::now()),
                None => Duration::from_secs(3600),
            };

            tokio::select! {
                _ = tokio::time::sleep(release_sleep) => {
                    self.release_reorder_slot().await;
                }
                res = self.sock_a.recv_from(&mut buf) => {
                    let (n, src) = res?;
                    self.on_datagram(Direction::AToServer, src, &buf[..n]).await;
                }
                res = self.sock_b.recv_from(&mut buf) => {
                    let (n, src) = res?;
                    self.on_datagram(Direction::ServerToA, src, &buf[..n]).await;
                }
            }
        }
    }

    async fn release_reorder_slot(&mut self) {
        let Some(slot) = self.reorder_slot.take() else {
            return;
        };
        if Instant::now() < slot.release_at {
            self.reorder_slot = Some(slot);
            return;
        }
        self.forward_now(slot.dst, &slot.data).await;
        debug!(direction = slot.direction.label(), "SEND delayed");
    }

    async fn on_datagram(&mut self, direction: Direction, src: SocketAddr, data: &[u8]) {
        if data.is_empty() {
            return;
        }

        let dst = match direction {
            Direction::AToServer => {
                self.last_client = Some(src);
                Target::ToServer(self.server_addr)
            }
            Direction::ServerToA => match self.last_client {
                Some(addr) => Target::ToClient(addr),
                None => return,
            },
        };

        let mut data = data.to_vec();

        if self.trial(self.params.loss) {
            debug!(direction = direction.label(), len = data.len(), "DROP");
            return;
        }

        if self.trial(self.params.corrupt) {
            corrupt(&mut data);
            debug!(direction = direction.label(), "CORRUPT");
        }

        if self.trial(self.params.dup) {
            self.forward_now(dst, &data).await;
            debug!(direction = direction.label(), "DUP");
        }

        if self.reorder_slot.is_none() && self.trial(self.params.reorder) {
            let delay = reorder_delay();
            self.reorder_slot = Some(ReorderSlot {
                data,
                dst,
                direction,
                release_at: Instant::now() + delay,
            });
            debug!(direction = direction.label(), "REORDER (hold)");
        } else {
            self.forward_now(dst, &data).await;
        }
    }

    fn trial(&self, p: f64) -> bool {
        if p <= 0.0 {
            return false;
        }
        rand::random::<f64>() < p.min(1.0)
    }

    async fn forward_now(&self, dst: Target, data: &[u8]) {
        let result = match dst {
            Target::ToClient(addr) => self.sock_a.send_to(data, addr).await,
            Target::ToServer(addr) => self.sock_b.send_to(data, addr).await,
        };
        if let Err(e) = result {
            warn!(error = %e, "forward send error");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn corrupt_flips_a_bit() {
        let mut data = vec![0u8, 0u8, 0u8];
        corrupt(&mut data);
        assert_ne!(data, vec![0u8, 0u8, 0u8]);
    }

    #[test]
    fn corrupt_is_noop_on_empty() {
        let mut data: Vec<u8> = Vec::new();
        corrupt(&mut data);
        assert!(data.is_empty());
    }
}

fn corrupt(data: &mut [u8]) {
    if data.is_empty() {
        return;
    }
    let i = (rand::random::<f64>() * data.len() as f64) as usize % data.len();
    data[i] ^= 0xFF;
}

/// Uniform draw in `[REORDER_DELAY_MIN, REORDER_DELAY_MAX]`.
fn reorder_delay() -> Duration {
    let span = (REORDER_DELAY_MAX - REORDER_DELAY_MIN).as_secs_f64();
    REORDER_DELAY_MIN + Duration::from_secs_f64(rand::random::<f64>() * span)
}

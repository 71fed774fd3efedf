//! `rdt-server`: single UDP socket serving multiple peers, each behind its
//! own reliable [`Session`], exposing a tiny GET/PUT/echo file protocol.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::net::UdpSocket;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{error, info, warn, Level};

use rdtstream::fileservice::{Command, PeerState, PUT_IDLE_TIMEOUT_SECS};
use rdtstream::session::Session;
use rdtstream::{RdtError, Result};

const RECV_BUF: usize = 65535;
const TICK: Duration = Duration::from_millis(10);

/// RDT file server: listens for peers and serves GET/PUT/echo over the
/// reliable transport.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// IP address to bind to
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// UDP port to bind to
    #[arg(long, default_value_t = 12000)]
    port: u16,

    /// RDT sliding window size
    #[arg(long, default_value_t = rdtstream::session::DEFAULT_WINDOW)]
    window: usize,

    /// RDT per-packet retransmission timeout, in seconds
    #[arg(long, default_value_t = 2.0)]
    timeout: f64,
}

struct Peer {
    session: Session,
    state: PeerState,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().with_max_level(Level::INFO).init();

    let args = Args::parse();
    let addr_str = format!("{}:{}", args.host, args.port);
    let bind_addr: SocketAddr = addr_str
        .parse()
        .map_err(|e| RdtError::InvalidAddress(addr_str.clone(), e))?;

    let socket = Arc::new(UdpSocket::bind(bind_addr).await?);
    info!(%bind_addr, "listening");

    let window = args.window;
    let timeout = Duration::from_secs_f64(args.timeout);
    let peers: Arc<AsyncMutex<HashMap<SocketAddr, Peer>>> = Arc::new(AsyncMutex::new(HashMap::new()));

    let mut buf = [0u8; RECV_BUF];
    loop {
        tokio::select! {
            res = socket.recv_from(&mut buf) => {
                let (n, addr) = match res {
                    Ok(v) => v,
                    Err(e) => {
                        warn!(error = %e, "recv error");
                        continue;
                    }
                };
                let mut table = peers.lock().await;
                let peer = table.entry(addr).or_insert_with(|| {
                    info!(%addr, "new peer");
                    Peer {
                        session: Session::with_params(socket.clone(), addr, window, timeout),
                        state: PeerState::new(),
                    }
                });
                peer.session.handle_raw(&buf[..n]).await;
            }
            _ = tokio::time::sleep(TICK) => {
                tick_peers(&peers).await;
            }
        }
    }
}

async fn tick_peers(peers: &Arc<AsyncMutex<HashMap<SocketAddr, Peer>>>) {
    let mut table = peers.lock().await;
    for (addr, peer) in table.iter_mut() {
        if peer.state.is_receiving() {
            let chunk = peer.session.recv_available();
            if !chunk.is_empty() {
                peer.state.on_file_bytes(&chunk);
            }
            if peer.state.idle_secs() >= PUT_IDLE_TIMEOUT_SECS {
                let (filename, content) = peer.state.finish_put();
                let n = content.len();
                match tokio::fs::write(&filename, &content).await {
                    Ok(()) => {
                        info!(%addr, %filename, bytes = n, "stored upload");
                        let session = peer.session.clone();
                        let msg = format!("OK: Stored {} ({} bytes)", filename, n);
                        tokio::task::spawn(async move {
                            session.send(msg.into_bytes().into()).await;
                        });
                    }
                    Err(e) => {
                        error!(%addr, %filename, error = %e, "failed to store upload");
                    }
                }
            }
            continue;
        }

        let app = peer.session.recv_available();
        if app.is_empty() {
            continue;
        }
        for cmd in peer.state.push_command_bytes(&app) {
            match cmd {
                Command::Get(name) => {
                    let session = peer.session.clone();
                    tokio::task::spawn(async move {
                        if !Path::new(&name).is_file() {
                            session
                                .send(format!("ERROR: File {} not found", name).into_bytes().into())
                                .await;
                            return;
                        }
                        match tokio::fs::read(&name).await {
                            Ok(data) => {
                                info!(file = %name, bytes = data.len(), "sending");
                                session.send(data.into()).await;
                            }
                            Err(e) => {
                                session
                                    .send(format!("ERROR: {}", e).into_bytes().into())
                                    .await;
                            }
                        }
                    });
                }
                Command::Put(name) => {
                    info!(%addr, file = %name, "expecting upload");
                    let pending = peer.session.recv_available();
                    peer.state.start_put(name, pending);
                }
                Command::Echo(line) => {
                    let session = peer.session.clone();
                    let reply = format!("OK: ECHO: {}", line);
                    tokio::task::spawn(async move {
                        session.send(reply.into_bytes().into()).await;
                    });
                }
            }
        }
    }
}

//! `rdt-client`: issues a single GET or PUT against an `rdt-server`, routed
//! through an `rdt-emulator`.

use std::net::{Ipv4Addr, SocketAddr};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use clap::{Parser, ValueEnum};
use tokio::net::UdpSocket;
use tracing::{info, warn, Level};

use rdtstream::fileservice::CLIENT_IDLE_TIMEOUT_SECS;
use rdtstream::session::Session;
use rdtstream::{RdtError, Result};

const RECV_BUF: usize = 65535;

#[derive(Copy, Clone, Debug, ValueEnum)]
#[value(rename_all = "UPPERCASE")]
enum Op {
    Get,
    Put,
}

/// RDT file client: GET a file from the server, or PUT a local file to it.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Server host:port (reference only -- traffic actually goes to the emulator)
    #[arg(long)]
    server: SocketAddr,

    /// Emulator host:port; the real UDP peer for this session
    #[arg(long)]
    emulator: SocketAddr,

    /// RDT sliding window size
    #[arg(long, default_value_t = rdtstream::session::DEFAULT_WINDOW)]
    window: usize,

    /// RDT per-packet retransmission timeout, in seconds
    #[arg(long, default_value_t = 2.0)]
    timeout: f64,

    /// GET or PUT
    #[arg(value_enum)]
    command: Op,

    /// File to fetch or upload
    filename: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().with_max_level(Level::INFO).init();

    let args = Args::parse();
    info!(server = %args.server, "server address is for reference only; sending to emulator");

    let socket = Arc::new(UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await?);
    let session = Session::with_params(
        socket.clone(),
        args.emulator,
        args.window,
        Duration::from_secs_f64(args.timeout),
    );

    let pump = {
        let session = session.clone();
        let socket = socket.clone();
        tokio::task::spawn(async move {
            let mut buf = [0u8; RECV_BUF];
            loop {
                match socket.recv_from(&mut buf).await {
                    Ok((n, _)) => session.handle_raw(&buf[..n]).await,
                    Err(e) => {
                        warn!(error = %e, "pump socket closed");
                        break;
                    }
                }
            }
        })
    };

    let result = match args.command {
        Op::Get => run_get(&session, &args.filename).await,
        Op::Put => run_put(&session, &args.filename).await,
    };

    session.stop().await;
    pump.abort();
    result
}

async fn drain_response(session: &Session) -> Bytes {
    let mut chunks: Vec<u8> = Vec::new();
    let mut idle = 0.0f64;
    while idle < CLIENT_IDLE_TIMEOUT_SECS {
        tokio::time::sleep(Duration::from_millis(200)).await;
        let chunk = session.recv_available();
        if !chunk.is_empty() {
            chunks.extend_from_slice(&chunk);
            idle = 0.0;
        } else {
            idle += 0.2;
        }
    }
    Bytes::from(chunks)
}

async fn run_get(session: &Session, filename: &str) -> Result<()> {
    session.send(format!("GET {}\n", filename).into_bytes().into()).await;

    let data = drain_response(session).await;
    if data.starts_with(b"ERROR") {
        println!("{}", String::from_utf8_lossy(&data));
    } else if !data.is_empty() {
        let base = Path::new(filename)
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| filename.to_string());
        let out = format!("download_{}", base);
        tokio::fs::write(&out, &data).await?;
        println!("wrote {} ({} bytes)", out, data.len());
    } else {
        println!("no data received");
    }
    Ok(())
}

async fn run_put(session: &Session, filename: &str) -> Result<()> {
    if !Path::new(filename).is_file() {
        return Err(RdtError::FileNotFound(filename.to_string()));
    }
    let content = tokio::fs::read(filename).await?;

    let base = Path::new(filename)
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| filename.to_string());

    session.send(format!("PUT {}\n", base).into_bytes().into()).await;
    // Short delay so the server hears the header before the file bytes.
    tokio::time::sleep(Duration::from_millis(300)).await;
    session.send(content.into()).await;

    let response = drain_response(session).await;
    if !response.is_empty() {
        println!("{}", String::from_utf8_lossy(&response));
    } else {
        println!("no server response");
    }
    Ok(())
}

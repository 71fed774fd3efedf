//! `rdt-emulator`: bidirectional UDP relay that injects loss, corruption,
//! duplication, and reordering between a client and a server.

use std::net::SocketAddr;

use clap::Parser;
use tracing::{error, Level};

use rdtstream::emulator::{Emulator, ImpairmentParams};

/// Network impairment emulator for exercising the RDT transport.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Address to listen on for the client ("A" side), e.g. 127.0.0.1:10000
    #[arg(long = "listen-a")]
    listen_a: SocketAddr,

    /// Address to listen on for the server ("B" side)
    #[arg(long = "listen-b")]
    listen_b: SocketAddr,

    /// Real server address datagrams from the client are relayed to
    #[arg(long)]
    server: SocketAddr,

    /// Probability in [0,1] that a forwarded datagram is dropped
    #[arg(long, default_value_t = 0.0)]
    loss: f64,

    /// Probability in [0,1] that a forwarded datagram is bit-corrupted
    #[arg(long, default_value_t = 0.0)]
    corrupt: f64,

    /// Probability in [0,1] that a forwarded datagram is delayed and
    /// released out of order
    #[arg(long, default_value_t = 0.0)]
    reorder: f64,

    /// Probability in [0,1] that a forwarded datagram is duplicated
    #[arg(long, default_value_t = 0.0)]
    dup: f64,
}

#[tokio::main]
async fn main() -> rdtstream::Result<()> {
    tracing_subscriber::fmt().with_max_level(Level::INFO).init();

    let args = Args::parse();
    let params = ImpairmentParams {
        loss: args.loss,
        corrupt: args.corrupt,
        reorder: args.reorder,
        dup: args.dup,
    };

    let mut emulator = Emulator::bind(args.listen_a, args.listen_b, args.server, params).await?;
    if let Err(e) = emulator.run().await {
        error!(error = %e, "emulator exited");
        return Err(e.into());
    }
    Ok(())
}

//! `relstream`: copy stdin to a peer and the peer's stream to stdout.
//!
//! ```text
//! relstream [OPTIONS] <LOCAL_ADDR> [PEER_ADDR]
//! ```
//!
//! With a peer address the endpoint connects; without one it waits for the
//! first peer to speak. Logs go to stderr so stdout carries only data.

use std::path::PathBuf;

use clap::Parser;
use relstream::transport::pipe::PipeStream;
use relstream::{Config, Endpoint, RelStreamError};
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

/// Reliable ordered byte stream over UDP.
#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    /// Local address to bind (e.g. 0.0.0.0:9000).
    local: String,
    /// Remote peer to connect to. Omit to accept the first peer instead.
    peer: Option<String>,
    /// Segments in flight, and the receive window.
    #[arg(short, long)]
    window: Option<u32>,
    /// Retransmission timeout in milliseconds.
    #[arg(short, long)]
    timeout: Option<u64>,
    /// Scheduler period in milliseconds.
    #[arg(long)]
    tick: Option<u64>,
    /// JSON config file; command-line options take precedence.
    #[arg(short, long)]
    config: Option<PathBuf>,
    /// Log more (-v debug, -vv trace).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

impl Cli {
    fn config(&self) -> Result<Config, RelStreamError> {
        let mut config = match &self.config {
            Some(path) => Config::load(path)?,
            None => Config::default(),
        };
        if let Some(window) = self.window {
            config.window = window;
        }
        if let Some(timeout) = self.timeout {
            config.timeout_ms = timeout;
        }
        if self.tick.is_some() {
            config.tick_ms = self.tick;
        }
        config.validate()?;
        Ok(config)
    }
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => Level::INFO,
        1 => Level::DEBUG,
        _ => Level::TRACE,
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .finish();
    if let Err(err) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("relstream: logging unavailable: {err}");
    }
}

async fn run(cli: Cli) -> Result<(), RelStreamError> {
    let config = cli.config()?;
    let mut endpoint = Endpoint::bind(cli.local.as_str(), config).await?;
    let (stream, flushed) = PipeStream::stdio(endpoint.readiness());

    match &cli.peer {
        Some(peer) => {
            let addr = tokio::net::lookup_host(peer.as_str())
                .await?
                .next()
                .ok_or_else(|| {
                    std::io::Error::new(
                        std::io::ErrorKind::NotFound,
                        format!("no address for {peer}"),
                    )
                })?;
            tracing::info!(%addr, "connecting");
            endpoint.connect(addr, Box::new(stream));
        }
        None => {
            tracing::info!(local = %endpoint.local_addr()?, "waiting for a peer");
            endpoint.accept_one(Box::new(stream));
        }
    }

    endpoint.run().await?;
    if let Err(err) = flushed.await {
        tracing::warn!(error = %err, "output task failed");
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let code = match run(cli).await {
        Ok(()) => 0,
        Err(err) => {
            eprintln!("relstream: {err}");
            1
        }
    };
    // The stdin reader may still be parked in a blocking read, which would
    // hold up runtime shutdown.
    std::process::exit(code)
}

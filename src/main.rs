//! rangecast: a pipelined byte-range server and its fetch client
//!
//! The server answers fixed-format range requests over TCP with the raw
//! bytes of one file:
//! - Request ingestion and data transmission run on separate threads
//! - A bounded queue between them applies backpressure to the peer
//! - Paging advice is issued for each range as soon as it is validated
//! - Responses leave in request order
//!
//! The client issues a cyclic stream of requests with a cap on how many may
//! be outstanding at once.

mod channel;
mod client;
mod config;
mod cpu;
mod limiter;
mod server;
mod source;
mod wire;

use client::Fetcher;
use config::{Config, FetchConfig, Mode, ServeConfig};
use server::Server;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    match config.mode {
        Mode::Serve(serve) => run_server(serve),
        Mode::Fetch(fetch) => run_fetcher(fetch),
    }
}

/// Serve until a fatal error
fn run_server(config: ServeConfig) -> Result<(), Box<dyn std::error::Error>> {
    info!(
        path = %config.path.display(),
        listen = %config.listen,
        source = ?config.source,
        queue_depth = config.queue_depth,
        wire = ?config.wire,
        invalid_range = ?config.invalid_range,
        "Starting rangecast server"
    );

    let server = Server::open(config)?;
    server.run()?;
    Ok(())
}

/// Run one fetch session
fn run_fetcher(config: FetchConfig) -> Result<(), Box<dyn std::error::Error>> {
    info!(
        host = %config.host,
        port = config.port,
        "Starting rangecast client"
    );

    Fetcher::new(config).run()?;
    Ok(())
}

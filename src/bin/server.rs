//! seqmux Server Binary
//!
//! Starts an echo responder: every request is answered with status 200 and
//! its own body.

use clap::Parser;
use seqmux::network::{Reply, Request, Server};
use seqmux::Config;
use tracing_subscriber::{fmt, EnvFilter};

/// seqmux echo server
#[derive(Parser, Debug)]
#[command(name = "seqmux-server")]
#[command(about = "Echo responder for the seqmux frame protocol")]
#[command(version)]
struct Args {
    /// Listen address (host:port)
    #[arg(short, long, default_value = "127.0.0.1:7400")]
    listen: String,

    /// Maximum frame size in KB
    #[arg(short = 'm', long, default_value = "16384")]
    max_frame_kb: usize,

    /// Artificial delay before each reply, in milliseconds
    #[arg(short, long, default_value = "0")]
    delay_ms: u64,
}

fn main() {
    // Initialize tracing/logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,seqmux=debug"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .init();

    let args = Args::parse();

    tracing::info!("seqmux server v{}", seqmux::VERSION);

    let config = Config::builder()
        .listen_addr(&args.listen)
        .max_frame_size(args.max_frame_kb * 1024)
        .build();

    let delay = std::time::Duration::from_millis(args.delay_ms);
    let handler = move |request: &Request| {
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
        tracing::debug!(
            "command={} operation_type={} sequence={} body={} bytes",
            request.header.command,
            request.header.operation_type,
            request.header.sequence,
            request.body.len()
        );
        Some(Reply::ok(request.body.to_vec()))
    };

    let server = match Server::bind(config, handler) {
        Ok(s) => s,
        Err(e) => {
            tracing::error!("Failed to bind {}: {}", args.listen, e);
            std::process::exit(1);
        }
    };

    if let Err(e) = server.run() {
        tracing::error!("Server error: {}", e);
        std::process::exit(1);
    }

    tracing::info!("Server stopped");
}

//! chaton: a single-threaded TCP chat server and client
//!
//! Every message a client sends is broadcast to all connected clients,
//! the sender included.
//!
//! Features:
//! - One mio event loop per process, no worker threads
//! - Length-prefixed binary wire format with resumable decoding
//! - Bounded per-connection buffers with write backpressure
//! - Operator console on stdin: INFO, SHUTDOWN, SHUTDOWNNOW
//! - Configuration via CLI arguments or TOML file

mod config;
mod protocols;
mod runtime;

use config::{Config, Mode};
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging; stdout carries chat output in client mode
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    match config.mode {
        Mode::Server { listen } => {
            info!(
                addr = %listen,
                max_connections = config.runtime.max_connections,
                buffer_size = config.runtime.buffer_size,
                max_field_len = config.runtime.max_field_len,
                "Starting chaton server"
            );
            runtime::run_server(listen, &config.runtime)?;
        }
        Mode::Client { login, server } => {
            info!(server = %server, login = %login, "Starting chaton client");
            runtime::run_client(server, &login, &config.runtime)?;
        }
    }

    Ok(())
}

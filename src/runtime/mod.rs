//! Single-threaded reactor runtime.
//!
//! One thread owns a mio `Poll`, every socket and every buffer. Other
//! threads reach it only through the console command queue.
//!
//! Shared pieces:
//! - `IoBuffer`: fixed-capacity byte buffer with fill/drain discipline
//! - `Connection`: per-socket buffers, outbound queue and decoder
//! - `InterestSet`: readiness derived from connection state
//!
//! The server and client loops are built from the same parts.

mod buffer;
mod client;
mod connection;
mod console;
mod event_loop;
mod interest;
mod token;

pub(crate) use buffer::IoBuffer;
pub(crate) use client::Client;
pub(crate) use connection::ConnectionLimits;
pub(crate) use event_loop::Server;

use crate::config::RuntimeConfig;
use console::spawn_console;
use std::io::{self, BufReader};
use std::net::SocketAddr;

/// Run the chat server on `addr`, taking operator commands from stdin.
pub fn run_server(addr: SocketAddr, config: &RuntimeConfig) -> io::Result<()> {
    let mut server = Server::bind(addr, config)?;
    spawn_console(BufReader::new(io::stdin()), server.control())?;
    server.run()
}

/// Connect to `server` as `login`, sending stdin lines and printing
/// received messages to stdout.
pub fn run_client(server: SocketAddr, login: &str, config: &RuntimeConfig) -> io::Result<()> {
    let mut client = Client::connect(server, login, config)?;
    spawn_console(BufReader::new(io::stdin()), client.control())?;
    client.run(&mut io::stdout().lock())
}

//! Client event loop.
//!
//! Same machinery as the server with a single connection: the socket starts
//! in the connecting state, console lines become messages signed with the
//! login, and every message received is printed as `sender: body`. Input is
//! read one buffer per pass so console lines keep flowing while the server
//! is busy.

use crate::config::RuntimeConfig;
use crate::protocols::chat::Message;
use crate::runtime::connection::Connection;
use crate::runtime::console::{command_channel, CommandQueue, Control};
use crate::runtime::interest::Ready;
use crate::runtime::token::{ChannelState, WAKER};
use mio::net::TcpStream;
use mio::{Events, Poll, Token};
use std::io::{self, Write};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

const SERVER: Token = Token(0);

/// A chat client bound to one server.
pub struct Client {
    poll: Poll,
    connection: Connection<TcpStream>,
    login: String,
    control: Control,
    commands: CommandQueue,
    max_field_len: usize,
    events_capacity: usize,
    decoded: Vec<Message>,
    /// The last read may have left input in the socket.
    read_again: bool,
}

impl Client {
    /// Start a non-blocking connect to `server`.
    pub fn connect(
        server: SocketAddr,
        login: impl Into<String>,
        config: &RuntimeConfig,
    ) -> io::Result<Self> {
        config
            .validate()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        let poll = Poll::new()?;

        let stream = TcpStream::connect(server)?;
        let mut connection = Connection::connecting(stream, server, config.limits());
        connection.register(poll.registry(), SERVER)?;

        let (control, commands) = command_channel(poll.registry(), WAKER, config.command_queue)?;

        Ok(Self {
            poll,
            connection,
            login: login.into(),
            control,
            commands,
            max_field_len: config.max_field_len,
            events_capacity: config.events_capacity,
            decoded: Vec::new(),
            read_again: false,
        })
    }

    /// A handle other threads use to submit lines to send.
    pub fn control(&self) -> Control {
        self.control.clone()
    }

    /// Run until the server closes the connection, printing every message
    /// received to `out`.
    pub fn run<W: Write>(&mut self, out: &mut W) -> io::Result<()> {
        let mut events = Events::with_capacity(self.events_capacity);
        info!(server = %self.connection.peer(), login = %self.login, "Connecting");

        loop {
            let timeout = if self.read_again {
                Some(Duration::ZERO)
            } else {
                None
            };
            if let Err(e) = self.poll.poll(&mut events, timeout) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(e);
            }

            let read_again = std::mem::take(&mut self.read_again);
            for event in events.iter() {
                if event.token() == SERVER {
                    self.handle_ready(Ready::from_event(event), out)?;
                }
            }
            if read_again {
                self.handle_ready(Ready::READ_AGAIN, out)?;
            }

            self.process_commands();

            if !self
                .connection
                .update_interest(self.poll.registry(), SERVER)?
            {
                let _ = self.poll.registry().deregister(self.connection.stream_mut());
                info!(server = %self.connection.peer(), "Connection closed by server");
                return Ok(());
            }
        }
    }

    fn handle_ready<W: Write>(&mut self, ready: Ready, out: &mut W) -> io::Result<()> {
        if self.connection.state() == ChannelState::Connecting {
            // Reports a failed connect as an error
            if !self.connection.finish_connect()? {
                return Ok(());
            }
            info!(server = %self.connection.peer(), "Connected");
            // The readiness that completed the connect will not fire again
            self.connection.do_write()?;
            self.read_again = true;
            return Ok(());
        }

        let mut result = Ok(());
        if ready.readable || ready.error {
            match self.connection.do_read(&mut self.decoded) {
                Ok(more) => self.read_again |= more,
                Err(e) => result = Err(e),
            }
        }
        if result.is_ok() && ready.error {
            result = Err(self.connection.take_socket_error());
        }
        if result.is_ok() && ready.writable {
            result = self.connection.do_write();
        }

        for message in self.decoded.drain(..) {
            writeln!(out, "{message}")?;
        }
        out.flush()?;
        result
    }

    /// Turn queued console lines into messages for the server.
    fn process_commands(&mut self) {
        let lines: Vec<String> = self.commands.drain().collect();
        for line in lines {
            if line.is_empty() {
                debug!("Skipping empty line");
                continue;
            }
            if line.len() > self.max_field_len {
                warn!(
                    len = line.len(),
                    max = self.max_field_len,
                    "Line too long, not sent"
                );
                continue;
            }
            let message = Message::new(self.login.as_str(), line);
            self.connection.enqueue(Arc::new(message));
        }
    }
}

//! Server event loop.
//!
//! One thread owns the listener, every connection and the command queue.
//! Each iteration polls for readiness, accepts and services sockets,
//! broadcasts every message decoded along the way to all connected clients,
//! and then applies console commands queued since the last wake-up.
//!
//! Each readiness event gets one read, and its messages are broadcast before
//! the next socket is serviced, so no single peer can hold the thread. mio is
//! edge-triggered: a connection whose read may have left input behind is
//! queued in `read_again` and serviced on the next pass, which then polls
//! without blocking.

use crate::config::RuntimeConfig;
use crate::protocols::chat::Message;
use crate::runtime::connection::{Connection, ConnectionLimits, ConnectionRegistry};
use crate::runtime::console::{command_channel, CommandQueue, Control, ControlCommand};
use crate::runtime::interest::{InterestSet, Readiness, Ready};
use crate::runtime::token::{ChannelState, LISTENER, WAKER};
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Poll, Token};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// The chat server reactor.
pub struct Server {
    poll: Poll,
    /// `None` once SHUTDOWN has closed it.
    listener: Option<TcpListener>,
    local_addr: SocketAddr,
    connections: ConnectionRegistry<TcpStream>,
    control: Control,
    commands: CommandQueue,
    limits: ConnectionLimits,
    events_capacity: usize,
    running: bool,
    /// Messages decoded from the connection being serviced.
    decoded: Vec<Message>,
    /// Connections that may have unread input, oldest first.
    read_again: Vec<usize>,
}

impl Server {
    /// Bind the listening socket and set up the poller.
    pub fn bind(addr: SocketAddr, config: &RuntimeConfig) -> io::Result<Self> {
        config
            .validate()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        let poll = Poll::new()?;

        let listener = create_listener(addr, config.backlog)?;
        let mut listener = TcpListener::from_std(listener);
        let accept = InterestSet::of(Readiness::Acceptable)
            .to_mio()
            .ok_or(io::ErrorKind::InvalidInput)?;
        poll.registry().register(&mut listener, LISTENER, accept)?;
        let local_addr = listener.local_addr()?;

        let (control, commands) = command_channel(poll.registry(), WAKER, config.command_queue)?;

        Ok(Self {
            poll,
            listener: Some(listener),
            local_addr,
            connections: ConnectionRegistry::new(config.max_connections),
            control,
            commands,
            limits: config.limits(),
            events_capacity: config.events_capacity,
            running: false,
            decoded: Vec::new(),
            read_again: Vec::new(),
        })
    }

    /// Address the listener was bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// A handle other threads use to send console commands.
    pub fn control(&self) -> Control {
        self.control.clone()
    }

    #[cfg(test)]
    fn client_count(&self) -> usize {
        self.connections.len()
    }

    #[cfg(test)]
    fn is_accepting(&self) -> bool {
        self.listener.is_some()
    }

    /// Run until SHUTDOWNNOW.
    pub fn run(&mut self) -> io::Result<()> {
        let mut events = Events::with_capacity(self.events_capacity);
        self.running = true;

        info!(
            addr = %self.local_addr,
            max_connections = self.connections.max_connections(),
            buffer_size = self.limits.buffer_size,
            "Server listening"
        );

        while self.running {
            let timeout = if self.read_again.is_empty() {
                None
            } else {
                Some(Duration::ZERO)
            };
            if let Err(e) = self.poll.poll(&mut events, timeout) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(e);
            }

            let read_again = std::mem::take(&mut self.read_again);

            for event in events.iter() {
                let token = event.token();
                match self.channel_state(token) {
                    Some(ChannelState::Listening) => self.accept_connections(),
                    Some(ChannelState::Connected) | Some(ChannelState::Connecting) => {
                        self.handle_connection_event(token.0, Ready::from_event(event))
                    }
                    // Waker, or a connection already closed in this pass
                    None => {}
                }
            }

            for conn_id in read_again {
                self.handle_connection_event(conn_id, Ready::READ_AGAIN);
            }

            self.process_commands();
        }

        info!("Server stopped");
        Ok(())
    }

    fn channel_state(&self, token: Token) -> Option<ChannelState> {
        match token {
            LISTENER => self.listener.as_ref().map(|_| ChannelState::Listening),
            WAKER => None,
            Token(id) => self.connections.get(id).map(|conn| conn.state()),
        }
    }

    fn accept_connections(&mut self) {
        let Some(listener) = self.listener.as_ref() else {
            return;
        };

        loop {
            match listener.accept() {
                Ok((stream, peer)) => {
                    if self.connections.is_full() {
                        warn!(peer = %peer, "Connection limit reached, rejecting");
                        continue;
                    }

                    let conn = Connection::new(stream, peer, self.limits);
                    let Some(id) = self.connections.insert(conn) else {
                        continue;
                    };
                    let registered = match self.connections.get_mut(id) {
                        Some(conn) => conn.register(self.poll.registry(), Token(id)),
                        None => continue,
                    };
                    if let Err(e) = registered {
                        warn!(peer = %peer, error = %e, "Failed to register connection");
                        self.connections.remove(id);
                        continue;
                    }

                    debug!(conn_id = id, peer = %peer, "Accepted connection");
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    error!(error = %e, "Accept error");
                    break;
                }
            }
        }
    }

    fn handle_connection_event(&mut self, conn_id: usize, ready: Ready) {
        let Some(conn) = self.connections.get_mut(conn_id) else {
            return;
        };

        // Bytes that arrived ahead of an error are still read
        let mut result = Ok(());
        if ready.readable || ready.error {
            match conn.do_read(&mut self.decoded) {
                Ok(true) => {
                    if !self.read_again.contains(&conn_id) {
                        self.read_again.push(conn_id);
                    }
                }
                Ok(false) => {}
                Err(e) => result = Err(e),
            }
        }
        if result.is_ok() && ready.error {
            result = Err(conn.take_socket_error());
        }
        if result.is_ok() && ready.writable {
            result = conn.do_write();
        }

        if let Err(e) = result {
            debug!(conn_id, error = %e, "Connection error");
            self.close_connection(conn_id);
        }

        // Messages decoded before a failure are still delivered
        let mut decoded = std::mem::take(&mut self.decoded);
        for message in decoded.drain(..) {
            self.broadcast(message);
        }
        self.decoded = decoded;

        self.update_interest(conn_id);
    }

    /// Queue `message` on every connection, the sender included.
    fn broadcast(&mut self, message: Message) {
        debug!(
            sender = message.sender(),
            body_len = message.body().len(),
            recipients = self.connections.len(),
            "Broadcasting message"
        );

        let message = Arc::new(message);
        let registry = self.poll.registry();
        let mut finished = Vec::new();

        for (id, conn) in self.connections.iter_mut() {
            conn.enqueue(Arc::clone(&message));
            match conn.update_interest(registry, Token(id)) {
                Ok(true) => {}
                Ok(false) => finished.push(id),
                Err(e) => {
                    debug!(conn_id = id, error = %e, "Failed to update interest");
                    finished.push(id);
                }
            }
        }

        for id in finished {
            self.close_connection(id);
        }
    }

    /// Re-derive a connection's interest; close it if it wants nothing.
    fn update_interest(&mut self, conn_id: usize) {
        let Some(conn) = self.connections.get_mut(conn_id) else {
            return;
        };

        match conn.update_interest(self.poll.registry(), Token(conn_id)) {
            Ok(true) => {}
            Ok(false) => self.close_connection(conn_id),
            Err(e) => {
                debug!(conn_id, error = %e, "Failed to update interest");
                self.close_connection(conn_id);
            }
        }
    }

    fn close_connection(&mut self, conn_id: usize) {
        if let Some(mut conn) = self.connections.remove(conn_id) {
            let _ = self.poll.registry().deregister(conn.stream_mut());
            debug!(
                conn_id,
                peer = %conn.peer(),
                closing = conn.is_closing(),
                unsent_bytes = conn.outbound_len(),
                unsent_messages = conn.pending_len(),
                "Connection closed"
            );
        }
    }

    /// Apply every queued console line, oldest first.
    fn process_commands(&mut self) {
        let lines: Vec<String> = self.commands.drain().collect();
        for line in lines {
            if !self.running {
                break;
            }
            self.apply(ControlCommand::parse(&line));
        }
    }

    fn apply(&mut self, command: ControlCommand) {
        match command {
            ControlCommand::Info => {
                info!(clients = self.connections.len(), "Connected clients");
            }
            ControlCommand::Shutdown => self.stop_accepting(),
            ControlCommand::ShutdownNow => {
                self.stop_accepting();
                let ids = self.connections.ids();
                info!(clients = ids.len(), "Closing all connections");
                for id in ids {
                    self.close_connection(id);
                }
                self.running = false;
            }
            ControlCommand::Unknown(other) => {
                warn!(command = %other, "Unknown command");
            }
        }
    }

    fn stop_accepting(&mut self) {
        match self.listener.take() {
            Some(mut listener) => {
                let _ = self.poll.registry().deregister(&mut listener);
                info!(addr = %self.local_addr, "No longer accepting clients");
            }
            None => debug!("Listener already closed"),
        }
    }
}

/// Create a non-blocking TCP listener.
fn create_listener(addr: SocketAddr, backlog: i32) -> io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog)?;

    Ok(socket.into())
}

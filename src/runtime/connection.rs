//! Per-socket connection context and the registry that owns them.
//!
//! A connection carries two fixed-size buffers, a queue of messages that did
//! not fit in the outbound buffer yet, a resumable decoder, and a `closing`
//! flag. Both buffers are in fill orientation on entry to and exit from every
//! method here.
//!
//! The interest a connection asks for is a pure function of that state:
//! - readable while the inbound buffer has room and the peer has not gone away
//! - writable while encoded bytes are waiting in the outbound buffer
//!
//! When it wants neither, it is finished and the event loop reaps it. That is
//! exactly when `closing` is set and nothing is left to send.

use crate::protocols::chat::{Decode, Decoder, Message, MessageDecoder};
use crate::runtime::interest::{InterestSet, Readiness};
use crate::runtime::token::ChannelState;
use crate::runtime::IoBuffer;
use mio::{Registry, Token};
use slab::Slab;
use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Sizing shared by every connection of an event loop.
#[derive(Debug, Clone, Copy)]
pub struct ConnectionLimits {
    /// Capacity of each inbound and outbound buffer.
    pub buffer_size: usize,
    /// Largest accepted field length.
    pub max_field_len: usize,
}

/// A single chat connection over a non-blocking stream.
pub struct Connection<S> {
    stream: S,
    peer: SocketAddr,
    state: ChannelState,
    inbound: IoBuffer,
    outbound: IoBuffer,
    /// Messages waiting for room in `outbound`, oldest first.
    pending: VecDeque<Arc<Message>>,
    decoder: MessageDecoder,
    /// Peer sent end-of-stream or a malformed message; no more reads.
    closing: bool,
    /// Interest last applied to the multiplexer.
    registered: InterestSet,
}

impl<S: Read + Write> Connection<S> {
    /// Wrap an established stream.
    pub fn new(stream: S, peer: SocketAddr, limits: ConnectionLimits) -> Self {
        Self {
            stream,
            peer,
            state: ChannelState::Connected,
            inbound: IoBuffer::with_capacity(limits.buffer_size),
            outbound: IoBuffer::with_capacity(limits.buffer_size),
            pending: VecDeque::new(),
            decoder: MessageDecoder::new(limits.max_field_len),
            closing: false,
            registered: InterestSet::EMPTY,
        }
    }

    /// Wrap a stream whose non-blocking connect is still in progress.
    pub fn connecting(stream: S, peer: SocketAddr, limits: ConnectionLimits) -> Self {
        Self {
            state: ChannelState::Connecting,
            ..Self::new(stream, peer, limits)
        }
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn state(&self) -> ChannelState {
        self.state
    }

    pub fn is_closing(&self) -> bool {
        self.closing
    }

    /// Messages queued but not yet encoded into the outbound buffer.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Encoded bytes waiting to be written.
    pub fn outbound_len(&self) -> usize {
        self.outbound.len()
    }

    pub fn stream_mut(&mut self) -> &mut S {
        &mut self.stream
    }

    /// Perform one read and decode what it brought in.
    ///
    /// Complete messages are appended to `decoded` in wire order. Returns
    /// `Ok(true)` when the read filled bytes and the socket may hold more;
    /// readiness is edge-triggered, so the caller must come back without
    /// waiting for another event. Errors are transport failures; the caller
    /// tears the connection down.
    pub fn do_read(&mut self, decoded: &mut Vec<Message>) -> io::Result<bool> {
        loop {
            if self.closing || !self.inbound.has_remaining() {
                return Ok(false);
            }
            match self.inbound.fill_from(&mut self.stream) {
                Ok(0) => {
                    debug!(peer = %self.peer, "Input stream closed");
                    self.closing = true;
                    return Ok(false);
                }
                Ok(n) => {
                    trace!(peer = %self.peer, bytes = n, "Read");
                    self.process_in(decoded);
                    return Ok(!self.closing);
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// Run the decoder over the inbound buffer until it runs dry.
    fn process_in(&mut self, decoded: &mut Vec<Message>) {
        loop {
            match self.decoder.feed(&mut self.inbound) {
                Decode::Done(message) => {
                    trace!(peer = %self.peer, sender = message.sender(), "Decoded message");
                    decoded.push(message);
                    self.decoder.reset();
                }
                Decode::NeedMoreData => return,
                Decode::Error(e) => {
                    warn!(peer = %self.peer, error = %e, "Protocol error, closing connection");
                    self.closing = true;
                    return;
                }
            }
        }
    }

    /// Queue a message for delivery and encode as much as fits.
    pub fn enqueue(&mut self, message: Arc<Message>) {
        self.pending.push_back(message);
        self.process_out();
    }

    /// Move whole messages from `pending` into `outbound`, in order.
    ///
    /// A message that does not fit stays queued along with everything
    /// behind it.
    fn process_out(&mut self) {
        while let Some(message) = self.pending.front() {
            let len = message.encoded_len();
            if len > self.outbound.remaining() {
                break;
            }
            let mut dst = self.outbound.spare_mut();
            message.encode_into(&mut dst);
            self.outbound.commit(len);
            self.pending.pop_front();
        }
    }

    /// Write as much of the outbound buffer as the socket accepts,
    /// refilling it from `pending` as space frees up.
    pub fn do_write(&mut self) -> io::Result<()> {
        while !self.outbound.is_empty() {
            match self.outbound.drain_into(&mut self.stream) {
                Ok(0) => {
                    return Err(io::Error::new(io::ErrorKind::WriteZero, "write returned 0"));
                }
                Ok(n) => {
                    trace!(peer = %self.peer, bytes = n, "Wrote");
                    self.process_out();
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// The readiness this connection needs right now.
    ///
    /// Empty means the connection is done and must be closed.
    pub fn interest(&self) -> InterestSet {
        if self.state == ChannelState::Connecting {
            return InterestSet::of(Readiness::Connectable);
        }

        let mut interest = InterestSet::EMPTY;
        if self.inbound.has_remaining() && !self.closing {
            interest = interest.with(Readiness::Readable);
        }
        if !self.outbound.is_empty() {
            interest = interest.with(Readiness::Writable);
        }
        interest
    }
}

impl Connection<mio::net::TcpStream> {
    /// Register with the multiplexer under `token` for the current interest.
    pub fn register(&mut self, registry: &Registry, token: Token) -> io::Result<()> {
        let interest = self.interest();
        let mio_interest = interest
            .to_mio()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "empty interest set"))?;
        registry.register(&mut self.stream, token, mio_interest)?;
        self.registered = interest;
        Ok(())
    }

    /// Bring the multiplexer in line with the current interest.
    ///
    /// Returns `Ok(false)` when the connection wants nothing and must be
    /// closed by the caller. Unchanged interest is not re-registered.
    pub fn update_interest(&mut self, registry: &Registry, token: Token) -> io::Result<bool> {
        let interest = self.interest();
        let Some(mio_interest) = interest.to_mio() else {
            return Ok(false);
        };
        if interest != self.registered {
            trace!(peer = %self.peer, ?interest, "Updating interest");
            registry.reregister(&mut self.stream, token, mio_interest)?;
            self.registered = interest;
        }
        Ok(true)
    }

    /// The pending socket error after an error event.
    pub fn take_socket_error(&mut self) -> io::Error {
        match self.stream.take_error() {
            Ok(Some(e)) | Err(e) => e,
            Ok(None) => io::Error::new(io::ErrorKind::Other, "socket error"),
        }
    }

    /// Complete a non-blocking connect after a writable event.
    ///
    /// Returns `Ok(false)` when the wake-up was spurious and the connect is
    /// still in flight; the caller leaves the interest unchanged.
    pub fn finish_connect(&mut self) -> io::Result<bool> {
        if let Some(e) = self.stream.take_error()? {
            return Err(e);
        }
        match self.stream.peer_addr() {
            Ok(_) => {
                self.state = ChannelState::Connected;
                Ok(true)
            }
            Err(ref e)
                if e.kind() == io::ErrorKind::NotConnected
                    || e.kind() == io::ErrorKind::WouldBlock =>
            {
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }
}

/// Arena of live connections keyed by stable slab index.
///
/// Provides O(1) insert, lookup, and remove operations.
pub struct ConnectionRegistry<S> {
    connections: Slab<Connection<S>>,
    max_connections: usize,
}

impl<S> ConnectionRegistry<S> {
    /// Create a new registry with specified maximum capacity.
    pub fn new(max_connections: usize) -> Self {
        Self {
            connections: Slab::with_capacity(max_connections),
            max_connections,
        }
    }

    /// Insert a new connection into the registry.
    ///
    /// Returns `None` if the registry is at capacity.
    pub fn insert(&mut self, conn: Connection<S>) -> Option<usize> {
        if self.is_full() {
            return None;
        }
        Some(self.connections.insert(conn))
    }

    pub fn get(&self, id: usize) -> Option<&Connection<S>> {
        self.connections.get(id)
    }

    pub fn get_mut(&mut self, id: usize) -> Option<&mut Connection<S>> {
        self.connections.get_mut(id)
    }

    /// Remove a connection, if present.
    pub fn remove(&mut self, id: usize) -> Option<Connection<S>> {
        self.connections.try_remove(id)
    }

    /// Number of live connections.
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn max_connections(&self) -> usize {
        self.max_connections
    }

    pub fn is_full(&self) -> bool {
        self.connections.len() >= self.max_connections
    }

    /// Keys of all live connections.
    pub fn ids(&self) -> Vec<usize> {
        self.connections.iter().map(|(id, _)| id).collect()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (usize, &mut Connection<S>)> {
        self.connections.iter_mut()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocols::chat::DEFAULT_MAX_FIELD_LEN;

    /// In-memory non-blocking stream: reads pop scripted chunks, writes
    /// accept up to `write_budget` bytes before blocking.
    #[derive(Default)]
    struct MockStream {
        reads: VecDeque<io::Result<Vec<u8>>>,
        written: Vec<u8>,
        write_budget: usize,
    }

    impl MockStream {
        fn push_read(&mut self, bytes: &[u8]) {
            self.reads.push_back(Ok(bytes.to_vec()));
        }

        fn push_eof(&mut self) {
            self.reads.push_back(Ok(Vec::new()));
        }
    }

    impl Read for MockStream {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            match self.reads.pop_front() {
                None => Err(io::ErrorKind::WouldBlock.into()),
                Some(Err(e)) => Err(e),
                Some(Ok(mut chunk)) => {
                    let n = chunk.len().min(buf.len());
                    buf[..n].copy_from_slice(&chunk[..n]);
                    if n < chunk.len() {
                        self.reads.push_front(Ok(chunk.split_off(n)));
                    }
                    Ok(n)
                }
            }
        }
    }

    impl Write for MockStream {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.write_budget == 0 {
                return Err(io::ErrorKind::WouldBlock.into());
            }
            let n = buf.len().min(self.write_budget);
            self.written.extend_from_slice(&buf[..n]);
            self.write_budget -= n;
            Ok(n)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn peer() -> SocketAddr {
        "127.0.0.1:7777".parse().unwrap()
    }

    fn conn_with(buffer_size: usize) -> Connection<MockStream> {
        Connection::new(
            MockStream::default(),
            peer(),
            ConnectionLimits {
                buffer_size,
                max_field_len: DEFAULT_MAX_FIELD_LEN,
            },
        )
    }

    /// Call `do_read` until it reports the socket drained.
    fn read_until_blocked(conn: &mut Connection<MockStream>, decoded: &mut Vec<Message>) {
        while conn.do_read(decoded).unwrap() {}
    }

    fn readable_only() -> InterestSet {
        InterestSet::of(Readiness::Readable)
    }

    #[test]
    fn test_new_connection_wants_read() {
        let conn = conn_with(64);
        assert_eq!(conn.state(), ChannelState::Connected);
        assert_eq!(conn.interest(), readable_only());
    }

    #[test]
    fn test_connecting_wants_connect_only() {
        let conn = Connection::connecting(
            MockStream::default(),
            peer(),
            ConnectionLimits {
                buffer_size: 64,
                max_field_len: 16,
            },
        );
        assert_eq!(conn.state(), ChannelState::Connecting);
        assert_eq!(conn.interest(), InterestSet::of(Readiness::Connectable));
    }

    #[test]
    fn test_finish_connect_before_handshake_completes() {
        // TEST-NET-1 is never routed, so the SYN goes unanswered
        let addr: SocketAddr = "192.0.2.1:7777".parse().unwrap();
        let stream = match mio::net::TcpStream::connect(addr) {
            Ok(stream) => stream,
            // Host without any route refuses the connect up front
            Err(_) => return,
        };
        let mut conn = Connection::connecting(
            stream,
            addr,
            ConnectionLimits {
                buffer_size: 64,
                max_field_len: 16,
            },
        );

        assert!(!conn.finish_connect().unwrap());
        assert_eq!(conn.state(), ChannelState::Connecting);
        assert_eq!(conn.interest(), InterestSet::of(Readiness::Connectable));
    }

    #[test]
    fn test_finish_connect_after_accept() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let stream = mio::net::TcpStream::connect(addr).unwrap();
        let mut conn = Connection::connecting(
            stream,
            addr,
            ConnectionLimits {
                buffer_size: 64,
                max_field_len: 16,
            },
        );
        let _peer = listener.accept().unwrap();

        // Loopback handshakes complete in the kernel
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        while !conn.finish_connect().unwrap() {
            assert!(std::time::Instant::now() < deadline, "connect never completed");
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
        assert_eq!(conn.state(), ChannelState::Connected);
        assert_eq!(conn.interest(), readable_only());
    }

    #[test]
    fn test_do_read_decodes_fragments() {
        let mut conn = conn_with(64);
        let bytes = Message::new("alice", "hello").encode();
        conn.stream.push_read(&bytes[..3]);
        conn.stream.push_read(&bytes[3..11]);
        conn.stream.push_read(&bytes[11..]);

        let mut decoded = Vec::new();
        read_until_blocked(&mut conn, &mut decoded);

        assert_eq!(decoded, vec![Message::new("alice", "hello")]);
        assert!(!conn.is_closing());
        assert_eq!(conn.interest(), readable_only());
    }

    #[test]
    fn test_do_read_takes_one_read_per_call() {
        let mut conn = conn_with(64);
        conn.stream.push_read(&Message::new("a", "1").encode());
        conn.stream.push_read(&Message::new("b", "2").encode());

        let mut decoded = Vec::new();
        assert!(conn.do_read(&mut decoded).unwrap());
        assert_eq!(decoded, vec![Message::new("a", "1")]);

        assert!(conn.do_read(&mut decoded).unwrap());
        assert_eq!(decoded.len(), 2);

        // Drained: would-block reports nothing left
        assert!(!conn.do_read(&mut decoded).unwrap());
        assert_eq!(conn.interest(), readable_only());
    }

    #[test]
    fn test_do_read_stops_after_eof() {
        let mut conn = conn_with(64);
        conn.stream.push_eof();
        conn.stream.push_read(b"ignored");

        let mut decoded = Vec::new();
        assert!(!conn.do_read(&mut decoded).unwrap());
        assert!(!conn.do_read(&mut decoded).unwrap());
        assert!(decoded.is_empty());
        assert_eq!(conn.stream.reads.len(), 1);
    }

    #[test]
    fn test_do_read_larger_than_inbound_buffer() {
        // Inbound holds 8 bytes; a 1000-byte body must flow through it
        let mut conn = conn_with(8);
        let body = "y".repeat(1000);
        conn.stream.push_read(&Message::new("bob", body.as_str()).encode());

        let mut decoded = Vec::new();
        read_until_blocked(&mut conn, &mut decoded);
        assert_eq!(decoded, vec![Message::new("bob", body)]);
    }

    #[test]
    fn test_do_read_several_messages_in_one_read() {
        let mut conn = conn_with(128);
        let mut bytes = Message::new("a", "1").encode().to_vec();
        bytes.extend_from_slice(&Message::new("b", "2").encode());
        bytes.extend_from_slice(&Message::new("c", "3").encode()[..5]);
        conn.stream.push_read(&bytes);

        let mut decoded = Vec::new();
        read_until_blocked(&mut conn, &mut decoded);
        assert_eq!(
            decoded,
            vec![Message::new("a", "1"), Message::new("b", "2")]
        );

        conn.stream
            .push_read(&Message::new("c", "3").encode()[5..]);
        read_until_blocked(&mut conn, &mut decoded);
        assert_eq!(decoded.last(), Some(&Message::new("c", "3")));
    }

    #[test]
    fn test_eof_with_nothing_to_send_is_reaped() {
        let mut conn = conn_with(64);
        conn.stream.push_eof();

        let mut decoded = Vec::new();
        read_until_blocked(&mut conn, &mut decoded);

        assert!(conn.is_closing());
        assert!(conn.interest().is_empty());
    }

    #[test]
    fn test_eof_still_decodes_trailing_message() {
        let mut conn = conn_with(64);
        conn.stream.push_read(&Message::new("last", "words").encode());
        conn.stream.push_eof();

        let mut decoded = Vec::new();
        read_until_blocked(&mut conn, &mut decoded);
        assert_eq!(decoded, vec![Message::new("last", "words")]);
        assert!(conn.is_closing());
    }

    #[test]
    fn test_decode_error_closes_but_drains_writes() {
        let mut conn = conn_with(64);
        conn.enqueue(Arc::new(Message::new("srv", "bye")));
        conn.stream.push_read(&2000u32.to_be_bytes());

        let mut decoded = Vec::new();
        read_until_blocked(&mut conn, &mut decoded);

        assert!(decoded.is_empty());
        assert!(conn.is_closing());
        // Pending output keeps the connection alive
        assert_eq!(conn.interest(), InterestSet::of(Readiness::Writable));

        conn.stream.write_budget = usize::MAX;
        conn.do_write().unwrap();
        assert!(conn.interest().is_empty());
        assert_eq!(conn.stream.written, Message::new("srv", "bye").encode().to_vec());
    }

    #[test]
    fn test_read_error_is_returned() {
        let mut conn = conn_with(64);
        conn.stream
            .reads
            .push_back(Err(io::ErrorKind::ConnectionReset.into()));

        let mut decoded = Vec::new();
        let err = conn.do_read(&mut decoded).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionReset);
    }

    #[test]
    fn test_enqueue_serializes_in_order() {
        let mut conn = conn_with(64);
        conn.enqueue(Arc::new(Message::new("a", "first")));
        conn.enqueue(Arc::new(Message::new("b", "second")));

        assert_eq!(conn.pending_len(), 0);
        assert_eq!(
            conn.interest(),
            readable_only().with(Readiness::Writable)
        );

        conn.stream.write_budget = usize::MAX;
        conn.do_write().unwrap();

        let mut expected = Message::new("a", "first").encode().to_vec();
        expected.extend_from_slice(&Message::new("b", "second").encode());
        assert_eq!(conn.stream.written, expected);
        assert_eq!(conn.interest(), readable_only());
    }

    #[test]
    fn test_backpressure_keeps_whole_messages_queued() {
        // Each message encodes to 8 + 1 + 10 = 19 bytes; 20 bytes fit one
        let mut conn = conn_with(20);
        let msg = Arc::new(Message::new("a", "0123456789"));
        conn.enqueue(Arc::clone(&msg));
        conn.enqueue(Arc::clone(&msg));
        conn.enqueue(Arc::clone(&msg));

        assert_eq!(conn.outbound_len(), 19);
        assert_eq!(conn.pending_len(), 2);

        // A partial write frees 10 bytes, still not enough for another message
        conn.stream.write_budget = 10;
        conn.do_write().unwrap();
        assert_eq!(conn.outbound_len(), 9);
        assert_eq!(conn.pending_len(), 2);

        // Draining the rest lets the queue flow
        conn.stream.write_budget = usize::MAX;
        conn.do_write().unwrap();
        assert_eq!(conn.outbound_len(), 0);
        assert_eq!(conn.pending_len(), 0);
        assert_eq!(conn.stream.written.len(), 3 * 19);
    }

    #[test]
    fn test_full_buffers_want_write_not_read() {
        let mut conn = conn_with(16);
        conn.inbound.put_slice(&[0u8; 16]);
        conn.outbound.put_slice(&[0u8; 16]);

        assert_eq!(conn.interest(), InterestSet::of(Readiness::Writable));

        conn.closing = true;
        conn.stream.write_budget = usize::MAX;
        conn.do_write().unwrap();
        assert!(conn.interest().is_empty());
    }

    #[test]
    fn test_closing_with_pending_stays_alive() {
        let mut conn = conn_with(32);
        let msg = Arc::new(Message::new("a", "0123456789"));
        conn.enqueue(Arc::clone(&msg));
        conn.enqueue(Arc::clone(&msg));
        conn.closing = true;

        // Writes drain one message at a time; nothing is dropped
        conn.stream.write_budget = 19;
        conn.do_write().unwrap();
        assert_eq!(conn.pending_len(), 0);
        assert_eq!(conn.interest(), InterestSet::of(Readiness::Writable));

        conn.stream.write_budget = 19;
        conn.do_write().unwrap();
        assert!(conn.interest().is_empty());
        assert_eq!(conn.stream.written.len(), 38);
    }

    #[test]
    fn test_registry_capacity() {
        let mut registry: ConnectionRegistry<MockStream> = ConnectionRegistry::new(2);

        let id1 = registry.insert(conn_with(8)).unwrap();
        let id2 = registry.insert(conn_with(8)).unwrap();

        // At capacity
        assert!(registry.is_full());
        assert!(registry.insert(conn_with(8)).is_none());
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.ids(), vec![id1, id2]);

        assert!(registry.remove(id1).is_some());
        assert!(registry.remove(id1).is_none());
        assert!(registry.get(id1).is_none());
        assert!(registry.get_mut(id2).is_some());
        assert_eq!(registry.len(), 1);
    }
}

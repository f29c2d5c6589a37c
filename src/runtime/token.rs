//! Token layout and per-channel state for the event loops.
//!
//! Connection tokens are the connection's key in the registry slab, so they
//! count up from zero. The listener and the waker use reserved tokens at the
//! top of the range where the slab will never reach.

use mio::Token;

/// The listening socket.
pub const LISTENER: Token = Token(usize::MAX);

/// The waker used by the console bridge to interrupt `poll`.
pub const WAKER: Token = Token(usize::MAX - 1);

/// What a registered channel is currently waiting for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// Listening socket, only ever accepts.
    Listening,
    /// Outbound socket whose connect has not been confirmed yet.
    Connecting,
    /// Established socket, driven by its connection's buffers.
    Connected,
}

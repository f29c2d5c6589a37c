//! Chat protocol implementation.
//!
//! Every chat message is two length-prefixed UTF-8 strings, the sender's
//! login followed by the message body:
//!
//! ```text
//! Message := SenderField BodyField
//! Field   := Length:u32 (big-endian) Bytes:u8[Length]
//!
//! Example (sender "alice", body "hello"):
//! 00000005 616c696365 00000005 68656c6c6f
//! ```
//!
//! A field length must be in `1..=max_field_len` (1024 by default). Anything
//! else is a fatal decode error for the connection: there is no terminator
//! and no way to resynchronize, since the four bytes following a message are
//! always read as the next sender length.
//!
//! Decoders are resumable. They accept input in arbitrary fragments, keep
//! partial state between calls, and produce the same values whatever the
//! fragment boundaries were.

pub mod message;
pub mod parser;

pub use message::Message;
pub use parser::{Decode, Decoder, MessageDecoder};

/// Default upper bound on the byte length of a single field.
pub const DEFAULT_MAX_FIELD_LEN: usize = 1024;

/// Size of a field's length prefix.
pub const LENGTH_PREFIX_LEN: usize = 4;

/// Size of the largest message that can be encoded with fields capped at
/// `max_field_len` bytes.
pub fn max_message_len(max_field_len: usize) -> usize {
    2 * (LENGTH_PREFIX_LEN + max_field_len)
}

//! Chat message value and its wire encoding.

use super::LENGTH_PREFIX_LEN;
use bytes::BufMut;
#[cfg(test)]
use bytes::{Bytes, BytesMut};
use std::fmt;

/// A chat message: who sent it and what they said.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    sender: String,
    body: String,
}

impl Message {
    pub fn new(sender: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            sender: sender.into(),
            body: body.into(),
        }
    }

    pub fn sender(&self) -> &str {
        &self.sender
    }

    pub fn body(&self) -> &str {
        &self.body
    }

    /// Number of bytes [`encode_into`](Self::encode_into) will write.
    pub fn encoded_len(&self) -> usize {
        2 * LENGTH_PREFIX_LEN + self.sender.len() + self.body.len()
    }

    /// Encode the message into `dst`.
    ///
    /// # Panics
    /// Panics if `dst` has less than [`encoded_len`](Self::encoded_len)
    /// bytes of room.
    pub fn encode_into<B: BufMut>(&self, dst: &mut B) {
        put_field(dst, &self.sender);
        put_field(dst, &self.body);
    }

    /// Encode the message into a fresh buffer.
    #[cfg(test)]
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.encode_into(&mut buf);
        buf.freeze()
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.sender, self.body)
    }
}

fn put_field<B: BufMut>(dst: &mut B, field: &str) {
    // Fields are capped far below u32::MAX before they reach the encoder
    dst.put_u32(field.len() as u32);
    dst.put_slice(field.as_bytes());
}

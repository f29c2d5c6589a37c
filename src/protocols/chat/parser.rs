//! Resumable chat protocol decoders.
//!
//! A decoder is fed the inbound [`IoBuffer`] whenever new bytes arrive. It
//! takes what it needs from the front of the buffer, compacts the consumed
//! bytes out, and reports whether a value is complete. Partial state (a
//! half-read length prefix, a half-received string) lives in the decoder, so
//! a value may straddle any number of reads.

use super::message::Message;
use super::LENGTH_PREFIX_LEN;
use crate::runtime::IoBuffer;
use thiserror::Error;

/// Outcome of feeding a decoder.
#[derive(Debug, PartialEq, Eq)]
pub enum Decode<T> {
    /// A value is complete. The decoder must be reset before the next feed.
    Done(T),
    /// All available bytes were taken; feed again after the next read.
    NeedMoreData,
    /// The stream is malformed. The decoder is unusable until reset.
    Error(DecodeError),
}

/// Protocol violations found while decoding.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    /// Field length outside `1..=max`.
    #[error("invalid field length {length} (allowed 1..={max})")]
    InvalidLength { length: u32, max: usize },

    /// Field bytes are not valid UTF-8.
    #[error("field is not valid UTF-8")]
    InvalidUtf8,
}

/// A resumable decoder producing values of type `Output`.
pub trait Decoder {
    type Output;

    /// Take bytes from the front of `buf` and try to complete a value.
    ///
    /// # Panics
    /// Panics if the decoder already returned `Done` or `Error` and was not
    /// reset since.
    fn feed(&mut self, buf: &mut IoBuffer) -> Decode<Self::Output>;

    /// Return to the initial state, discarding any partial value.
    fn reset(&mut self);
}

/// Decoder state for one length-prefixed string.
#[derive(Debug)]
enum FrameState {
    /// Collecting the 4-byte big-endian length.
    Length {
        prefix: [u8; LENGTH_PREFIX_LEN],
        filled: usize,
    },
    /// Collecting `expected` bytes of string payload.
    Payload { expected: usize, data: Vec<u8> },
    Done,
    Failed,
}

impl FrameState {
    fn initial() -> Self {
        FrameState::Length {
            prefix: [0; LENGTH_PREFIX_LEN],
            filled: 0,
        }
    }
}

/// Decodes a single length-prefixed UTF-8 string.
#[derive(Debug)]
pub struct FrameDecoder {
    max_len: usize,
    state: FrameState,
}

impl FrameDecoder {
    /// Create a decoder accepting strings of `1..=max_len` bytes.
    pub fn new(max_len: usize) -> Self {
        Self {
            max_len,
            state: FrameState::initial(),
        }
    }
}

impl Decoder for FrameDecoder {
    type Output = String;

    fn feed(&mut self, buf: &mut IoBuffer) -> Decode<String> {
        loop {
            match &mut self.state {
                FrameState::Length { prefix, filled } => {
                    let n = (LENGTH_PREFIX_LEN - *filled).min(buf.len());
                    prefix[*filled..*filled + n].copy_from_slice(&buf.filled()[..n]);
                    buf.consume(n);
                    *filled += n;
                    if *filled < LENGTH_PREFIX_LEN {
                        return Decode::NeedMoreData;
                    }

                    let length = u32::from_be_bytes(*prefix);
                    // A signed peer sending a negative length lands above max here
                    if length == 0 || length as usize > self.max_len {
                        self.state = FrameState::Failed;
                        return Decode::Error(DecodeError::InvalidLength {
                            length,
                            max: self.max_len,
                        });
                    }
                    let expected = length as usize;
                    self.state = FrameState::Payload {
                        expected,
                        data: Vec::with_capacity(expected),
                    };
                }
                FrameState::Payload { expected, data } => {
                    let n = (*expected - data.len()).min(buf.len());
                    data.extend_from_slice(&buf.filled()[..n]);
                    buf.consume(n);
                    if data.len() < *expected {
                        return Decode::NeedMoreData;
                    }

                    let data = std::mem::take(data);
                    return match String::from_utf8(data) {
                        Ok(value) => {
                            self.state = FrameState::Done;
                            Decode::Done(value)
                        }
                        Err(_) => {
                            self.state = FrameState::Failed;
                            Decode::Error(DecodeError::InvalidUtf8)
                        }
                    };
                }
                FrameState::Done | FrameState::Failed => {
                    panic!("FrameDecoder fed after completion without reset")
                }
            }
        }
    }

    fn reset(&mut self) {
        self.state = FrameState::initial();
    }
}

/// Decoder state for a whole message.
#[derive(Debug)]
enum MessageState {
    AwaitingSender,
    AwaitingBody { sender: String },
    Done,
    Failed,
}

/// Decodes a [`Message`]: a sender string followed by a body string.
#[derive(Debug)]
pub struct MessageDecoder {
    field: FrameDecoder,
    state: MessageState,
}

impl MessageDecoder {
    /// Create a decoder whose fields may each hold `1..=max_field_len` bytes.
    pub fn new(max_field_len: usize) -> Self {
        Self {
            field: FrameDecoder::new(max_field_len),
            state: MessageState::AwaitingSender,
        }
    }
}

impl Decoder for MessageDecoder {
    type Output = Message;

    fn feed(&mut self, buf: &mut IoBuffer) -> Decode<Message> {
        loop {
            let field = match &self.state {
                MessageState::AwaitingSender | MessageState::AwaitingBody { .. } => {
                    self.field.feed(buf)
                }
                MessageState::Done | MessageState::Failed => {
                    panic!("MessageDecoder fed after completion without reset")
                }
            };

            let value = match field {
                Decode::Done(value) => value,
                Decode::NeedMoreData => return Decode::NeedMoreData,
                Decode::Error(e) => {
                    self.state = MessageState::Failed;
                    return Decode::Error(e);
                }
            };

            // Each field starts from a fresh string decoder
            self.field.reset();
            match std::mem::replace(&mut self.state, MessageState::Done) {
                MessageState::AwaitingSender => {
                    self.state = MessageState::AwaitingBody { sender: value };
                }
                MessageState::AwaitingBody { sender } => {
                    return Decode::Done(Message::new(sender, value));
                }
                MessageState::Done | MessageState::Failed => unreachable!(),
            }
        }
    }

    fn reset(&mut self) {
        self.field.reset();
        self.state = MessageState::AwaitingSender;
    }
}

//! Protocol implementations.
//!
//! - `chat`: length-prefixed sender/body messages, decoded incrementally
//!   by the runtime event loops

pub mod chat;

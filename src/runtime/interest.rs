//! Readiness capabilities a channel can ask the multiplexer for.
//!
//! Interest is always recomputed from scratch from a channel's current
//! buffer and queue state, then converted to a `mio::Interest` in one step.

use mio::event::Event;
use mio::Interest;
use std::fmt;

/// One readiness capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    /// Bytes can be read without blocking.
    Readable,
    /// Bytes can be written without blocking.
    Writable,
    /// A listening socket has a pending connection.
    Acceptable,
    /// An outbound connect has completed (successfully or not).
    Connectable,
}

impl Readiness {
    const ALL: [Readiness; 4] = [
        Readiness::Readable,
        Readiness::Writable,
        Readiness::Acceptable,
        Readiness::Connectable,
    ];

    fn bit(self) -> u8 {
        match self {
            Readiness::Readable => 0b0001,
            Readiness::Writable => 0b0010,
            Readiness::Acceptable => 0b0100,
            Readiness::Connectable => 0b1000,
        }
    }
}

/// A set of [`Readiness`] capabilities.
#[derive(Clone, Copy, Default, PartialEq, Eq)]
pub struct InterestSet {
    bits: u8,
}

impl InterestSet {
    /// The empty set: the channel wants nothing and should be closed.
    pub const EMPTY: InterestSet = InterestSet { bits: 0 };

    /// A set holding a single capability.
    pub fn of(readiness: Readiness) -> Self {
        Self {
            bits: readiness.bit(),
        }
    }

    /// This set plus `readiness`.
    pub fn with(self, readiness: Readiness) -> Self {
        Self {
            bits: self.bits | readiness.bit(),
        }
    }

    pub fn contains(self, readiness: Readiness) -> bool {
        self.bits & readiness.bit() != 0
    }

    pub fn is_empty(self) -> bool {
        self.bits == 0
    }

    /// Convert to the multiplexer's interest; `None` for the empty set.
    ///
    /// Accept readiness is reported as readable and connect completion as
    /// writable, so those capabilities fold into the two mio bits.
    pub fn to_mio(self) -> Option<Interest> {
        let readable =
            self.contains(Readiness::Readable) || self.contains(Readiness::Acceptable);
        let writable =
            self.contains(Readiness::Writable) || self.contains(Readiness::Connectable);

        match (readable, writable) {
            (true, true) => Some(Interest::READABLE | Interest::WRITABLE),
            (true, false) => Some(Interest::READABLE),
            (false, true) => Some(Interest::WRITABLE),
            (false, false) => None,
        }
    }
}

/// Readiness reported for one channel in one pass of the loop.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Ready {
    pub readable: bool,
    pub writable: bool,
    pub error: bool,
}

impl Ready {
    /// Input left unread on an earlier pass; edge-triggered polling will
    /// not report it again.
    pub const READ_AGAIN: Ready = Ready {
        readable: true,
        writable: false,
        error: false,
    };

    pub fn from_event(event: &Event) -> Self {
        Self {
            readable: event.is_readable() || event.is_read_closed(),
            writable: event.is_writable(),
            error: event.is_error(),
        }
    }
}

impl fmt::Debug for InterestSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set()
            .entries(Readiness::ALL.iter().filter(|r| self.contains(**r)))
            .finish()
    }
}

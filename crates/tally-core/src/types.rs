//! Ticket identity and lifecycle types.

use std::collections::BTreeMap;
use std::fmt;

/// Identity of one logical request. Valid ids are `1..=N`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TicketId(pub u32);

impl TicketId {
    /// Zero-based slot index in a store reserved for at least `self` tickets.
    #[inline]
    pub fn index(self) -> Option<usize> {
        (self.0 as usize).checked_sub(1)
    }
}

impl fmt::Display for TicketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle state of a ticket.
///
/// ```text
/// Pending ──take_next──► InFlight ──mark_done──► Done
///    ▲                      │
///    └──── Failed ◄─mark_failed
/// ```
///
/// `Failed` is transient: the store moves the ticket straight back to
/// `Pending` after clearing its accumulator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TicketState {
    Pending = 0,
    InFlight = 1,
    Done = 2,
    Failed = 3,
}

impl TicketState {
    #[inline]
    pub(crate) fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Pending,
            1 => Self::InFlight,
            2 => Self::Done,
            _ => Self::Failed,
        }
    }
}

impl fmt::Display for TicketState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::InFlight => write!(f, "in-flight"),
            Self::Done => write!(f, "done"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// A ticket handed out by [`crate::store::ResultStore::take_next`].
///
/// Holding a `Ticket` means the caller owns the slot's accumulator until it
/// calls `mark_done` or `mark_failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ticket {
    pub id: TicketId,
    /// 1-based attempt number for this ticket.
    pub attempt: u32,
}

/// Completed results: ticket id → decoded value, exactly one entry per ticket.
pub type ResultSet = BTreeMap<TicketId, u64>;

//! Typed error definitions for the tally system.
//!
//! Provides [`TallyError`] for crate-level failures, [`StoreError`] for misuse
//! of the result store, and [`DecodeError`] for malformed response frames. All
//! variants implement `std::error::Error` via `thiserror`, so they integrate
//! with `anyhow::Result` at the binary boundary.

use thiserror::Error;

use crate::types::{TicketId, TicketState};

/// Domain-specific errors for the tally system.
#[derive(Debug, Error)]
pub enum TallyError {
    /// Configuration parsing or validation error.
    #[error("config error: {0}")]
    Config(String),

    /// Result store misuse.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Worker pool failure that retrying a ticket cannot fix.
    #[error("scheduler error: {0}")]
    Scheduler(String),
}

/// Errors raised by [`crate::store::ResultStore`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// The id is outside `1..=N` for this store.
    #[error("unknown ticket #{0}")]
    UnknownTicket(TicketId),

    /// The ticket is not in the state the operation requires.
    #[error("ticket #{id} is {actual}, expected {expected}")]
    InvalidState {
        id: TicketId,
        expected: TicketState,
        actual: TicketState,
    },

    /// The accumulated digits could not be decoded.
    #[error("ticket #{id}: {source}")]
    Decode {
        id: TicketId,
        #[source]
        source: DecodeError,
    },

    /// `snapshot()` was called before every ticket reached `Done`.
    #[error("run incomplete: {done}/{total} tickets done")]
    Incomplete { done: usize, total: usize },
}

/// Errors produced when decoding an accumulated digit buffer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("empty response")]
    Empty,

    #[error("non-numeric response {0:?}")]
    NotNumeric(String),

    #[error("response value {0} overflows u64")]
    Overflow(String),
}

//! # tally-net
//!
//! Network side of the tally system.
//!
//! ## Architecture
//!
//! ```text
//! Scheduler ──take_next──► ResultStore
//!     │                        ▲
//!     └─permit─► attempt ──────┤ record_bytes / mark_done / mark_failed
//!                  │
//!                  └─► Exchange (one TCP connection per ticket attempt)
//! ```
//!
//! - [`exchange`]: single-ticket TCP protocol client and the `attempt` wrapper
//! - [`scheduler`]: bounded worker pool that retries until every ticket is done

pub mod exchange;
pub mod scheduler;

use async_trait::async_trait;
use tally_core::{store::ResultStore, types::TicketId};

use crate::exchange::ExchangeError;

/// One request/response cycle for a ticket.
///
/// Implementations feed the accepted digit bytes of the response into
/// `store` via [`ResultStore::record_bytes`] and return `Ok(())` once the
/// frame terminator has been seen. Decoding and the state transition are left
/// to the caller ([`exchange::attempt`]).
#[async_trait]
pub trait Exchange: Send + Sync {
    async fn exchange(&self, ticket: TicketId, store: &ResultStore) -> Result<(), ExchangeError>;
}

//! # tally-core
//!
//! Core crate for the tally system, providing:
//!
//! - **Types** (`types`): ticket ids, lifecycle states, result sets
//! - **Codec** (`codec`): KOI8-R request encoding and CR-terminated frame scanning
//! - **Result store** (`store`): pre-sized per-ticket accumulators and state table
//! - **Statistics** (`stats`): median reduction over completed results
//! - **Configuration** (`config`): JSON config deserialization with defaults
//! - **Error types** (`error`): `TallyError`, `StoreError`, `DecodeError` via thiserror
//! - **Logging** (`logging`): tracing-based structured logging

pub mod codec;
pub mod config;
pub mod error;
pub mod logging;
pub mod stats;
pub mod store;
pub mod types;

pub use types::*;

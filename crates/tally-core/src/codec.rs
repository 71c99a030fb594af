//! Wire codec for the ticket protocol.
//!
//! ```text
//! client ──► "<ticket id>\n"                      (KOI8-R)
//! server ──► [noise] digits [noise] 0x0D [ignored]
//! ```
//!
//! The remote protocol is defined over the KOI8-R code page rather than
//! UTF-8. Digits and `\n` are ASCII-stable under KOI8-R, so the byte values
//! coincide with ASCII, but encoding and decoding still go through the code
//! page so the mapping stays explicit.

use encoding_rs::KOI8_R;

use crate::error::DecodeError;
use crate::types::TicketId;

/// Frame terminator byte (ASCII CR).
pub const FRAME_TERMINATOR: u8 = 0x0D;

/// Request line terminator.
const REQUEST_TERMINATOR: char = '\n';

/// Encode the request for `ticket` as KOI8-R bytes: decimal id followed by `\n`.
pub fn encode_request(ticket: TicketId) -> Vec<u8> {
    let line = format!("{}{REQUEST_TERMINATOR}", ticket.0);
    let (bytes, _, _) = KOI8_R.encode(&line);
    bytes.into_owned()
}

/// Result of scanning one received chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkScan {
    /// Digit bytes found before the terminator (or in the whole chunk if no
    /// terminator was present).
    pub digits: Vec<u8>,
    /// Whether the frame terminator appeared in this chunk.
    pub terminated: bool,
}

/// Scan a chunk for digits and the frame terminator.
///
/// Only `b'0'..=b'9'` are kept. Everything after the first terminator is a
/// protocol violation and is dropped.
pub fn scan_chunk(chunk: &[u8]) -> ChunkScan {
    let (body, terminated) = match chunk.iter().position(|&b| b == FRAME_TERMINATOR) {
        Some(pos) => (&chunk[..pos], true),
        None => (chunk, false),
    };

    ChunkScan {
        digits: body.iter().copied().filter(u8::is_ascii_digit).collect(),
        terminated,
    }
}

/// Decode accumulated digit bytes as a base-10 integer.
pub fn decode_digits(digits: &[u8]) -> Result<u64, DecodeError> {
    if digits.is_empty() {
        return Err(DecodeError::Empty);
    }

    let (text, _, had_errors) = KOI8_R.decode(digits);
    if had_errors || !text.bytes().all(|b| b.is_ascii_digit()) {
        return Err(DecodeError::NotNumeric(text.into_owned()));
    }

    text.parse::<u64>().map_err(|_| DecodeError::Overflow(text.into_owned()))
}

//! Error types for the fallible, I/O-facing surfaces of the crate.
//!
//! Routing table operations themselves never fail: they report policy decisions through
//! [`EntryState`](crate::EntryState) and friends.

use std::io;

use thiserror::Error;

/// Errors produced when parsing a [`Kuid`](crate::Kuid) from its hexadecimal form.
#[derive(Debug, Error)]
pub enum ParseKuidError {
    #[error("expected 40 hex digits, got {0}")]
    Length(usize),

    #[error("invalid hex: {0}")]
    Hex(#[from] hex::FromHexError),
}

/// Reasons a single persisted record is rejected. The parser logs these and moves on to the next
/// record.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RecordError {
    #[error("missing {0} tag")]
    Missing(&'static str),

    #[error("duplicate {0} tag")]
    Duplicate(&'static str),

    #[error("malformed {0} tag: {1:?}")]
    Malformed(&'static str, String),

    #[error("unusable address {0}")]
    Unusable(std::net::SocketAddr),
}

/// Errors that abort parsing of a persisted routing table altogether.
#[derive(Debug, Error)]
pub enum PersistError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("line {line} has no terminating newline")]
    Truncated { line: usize },
}

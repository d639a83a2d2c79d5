//! # Error Types
//!
//! Error handling for the stream layer.
//!
//! This module defines every error variant that can surface from the codecs and
//! from the stream factory, from low-level socket failures to malformed frames.
//!
//! ## Error Categories
//! - **I/O Errors**: socket bind/send/receive failures
//! - **Framing Errors**: truncated datagrams, unparsable legacy headers
//! - **Integrity Errors**: CRC mismatches
//! - **Compression Errors**: deflate/inflate failures, size limit violations
//! - **Lifecycle Errors**: opening an open factory, queueing on an unestablished session
//!
//! Most of these never leave the reader loop: a bad datagram is logged and
//! dropped. They are public so codec callers can match on them.
//!
//! ## Example Usage
//! ```rust
//! use eqstream::error::{ProtocolError, Result};
//! use eqstream::legacy::LegacyPacket;
//!
//! fn parse(frame: &[u8]) -> Result<LegacyPacket> {
//!     LegacyPacket::decode(frame)
//! }
//!
//! match parse(&[0u8; 4]) {
//!     Err(ProtocolError::Truncated { needed, actual }) => assert!(actual < needed),
//!     other => panic!("unexpected: {other:?}"),
//! }
//! ```

use std::io;
use thiserror::Error;

/// Error message constants to reduce allocations in error paths.
pub mod constants {
    /// Routing messages, logged when the reader drops a datagram
    pub const ERR_SHORT_DATAGRAM: &str = "Datagram shorter than an opcode";
    pub const ERR_CLOSED_SESSION: &str = "Datagram for a closed session";
    pub const ERR_SESSION_LIMIT: &str = "Session limit reached";

    /// Legacy header messages
    pub const ERR_FRAGMENT_INDEX: &str = "fragment index out of range";
    pub const ERR_FRAGMENT_LIMIT: &str = "too many partial messages";
    pub const ERR_FRAGMENT_TOTAL: &str = "fragment count changed mid-message";
}

// ProtocolError is the primary error type for all stream and codec operations
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Datagram truncated: need {needed} bytes, got {actual}")]
    Truncated { needed: usize, actual: usize },

    #[error("Invalid legacy packet header: {0}")]
    InvalidHeader(&'static str),

    #[error("CRC mismatch: frame carries {expected:#x}, computed {actual:#x}")]
    CrcMismatch { expected: u32, actual: u32 },

    #[error("Compression failed")]
    CompressionFailure,

    #[error("Decompression failed")]
    DecompressionFailure,

    #[error("Output exceeds {limit} bytes")]
    OversizedPacket { limit: usize },

    #[error("Unknown opcode: {0:#06x}")]
    UnknownOpcode(u16),

    #[error("No wire value mapped for {0}")]
    UnmappedOpcode(String),

    #[error("Stream factory is already open")]
    AlreadyOpen,

    #[error("Session is not established")]
    NotEstablished,

    #[error("Configuration error: {0}")]
    ConfigError(String),
}

impl ProtocolError {
    /// Shorthand for a truncation error.
    pub(crate) fn truncated(needed: usize, actual: usize) -> Self {
        ProtocolError::Truncated { needed, actual }
    }
}

/// Type alias for Results using ProtocolError
pub type Result<T> = std::result::Result<T, ProtocolError>;

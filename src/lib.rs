//! # eqstream
//!
//! Transport and codec layer for a two-generation game networking protocol
//! carried over UDP.
//!
//! A [`StreamFactory`](transport::StreamFactory) owns one socket and hands
//! every remote endpoint its own session. Sessions speak either the current
//! protocol (opcode envelopes with CRC16, zlib compression and an optional
//! chat cipher) or the legacy one (bit-field headers with a CRC-32 trailer).
//!
//! ## Modules
//! - [`core`]: current-protocol packets, wire transforms and codec
//! - [`legacy`]: legacy frame parser/serializer and its CRC-32
//! - [`transport`]: stream factory, session boundary, built-in sessions
//! - [`config`]: TOML/env configuration
//! - [`utils`]: compression, logging setup, metrics
//!
//! ## Example
//! ```rust,no_run
//! use std::sync::Arc;
//! use eqstream::config::NetworkConfig;
//! use eqstream::core::opcodes::OpcodeTable;
//! use eqstream::transport::{Session, StreamFactory};
//! use eqstream::utils::logging::init_logging;
//!
//! #[tokio::main]
//! async fn main() -> eqstream::error::Result<()> {
//!     let config = NetworkConfig::from_env()?;
//!     config.validate_strict()?;
//!     init_logging(&config.logging);
//!
//!     let opcodes = OpcodeTable::new();
//!     opcodes.insert("OP_SessionReady", 0x0001);
//!
//!     let factory = StreamFactory::new(config, Arc::new(opcodes));
//!     factory.open().await?;
//!     loop {
//!         while let Some(session) = factory.pop_current() {
//!             tracing::info!(peer = %session.peer(), "client connected");
//!         }
//!         tokio::time::sleep(std::time::Duration::from_millis(50)).await;
//!     }
//! }
//! ```

#![cfg_attr(not(test), deny(clippy::unwrap_used, clippy::expect_used, clippy::panic))]

pub mod config;
pub mod core;
pub mod error;
pub mod legacy;
pub mod transport;
pub mod utils;

pub use error::{ProtocolError, Result};
pub use transport::{Session, SessionState, StreamFactory, StreamFamily};

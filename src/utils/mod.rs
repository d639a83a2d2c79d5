//! # Utility Modules
//!
//! Supporting utilities shared by the codecs and the stream factory.
//!
//! ## Components
//! - **Compression**: zlib deflate/inflate with an output cap
//! - **Logging**: Structured logging configuration
//! - **Metrics**: Thread-safe observability counters
//!
//! ## Security
//! - Decompression bomb protection (64KB default limit)

pub mod compression;
pub mod logging;
pub mod metrics;

pub use metrics::{FactoryMetrics, MetricsSnapshot};

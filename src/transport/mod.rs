//! # Transport Layer
//!
//! UDP demultiplexing and the per-endpoint sessions it creates.
//!
//! ## Components
//! - **Factory**: owns the socket, session tables, reader and writer tasks
//! - **Session**: the boundary the factory drives every session through
//! - **Stream**: built-in current-protocol session
//! - **Legacy Stream**: built-in legacy-protocol session
//!
//! ## Classification
//! The first datagram from an unseen endpoint decides its family: a second
//! byte equal to `OP_SessionRequest` makes a current-protocol session,
//! anything else a legacy one.

pub mod factory;
pub mod legacy_stream;
pub mod session;
pub mod stream;

pub use factory::{DefaultSessionBuilder, StreamFactory};
pub use legacy_stream::LegacyStream;
pub use session::{Session, SessionBuilder, SessionState, StreamFamily};
pub use stream::CurrentStream;

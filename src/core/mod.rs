//! # Core Protocol Components
//!
//! Packet model and wire codec for the current protocol generation.
//!
//! ## Components
//! - **Opcodes**: control codes, opcode wire encodings, symbolic mapping
//! - **Packet**: protocol envelope, application and raw application packets
//! - **Wire**: CRC16, compression flags, chat cipher
//! - **Handshake**: session request/response bodies
//! - **Codec**: Tokio codec tying the wire transforms together per session
//!
//! ## Wire Format
//! ```text
//! [Opcode(2)] [Flag(1)?] [Body(N)] [CRC16(2)]
//! ```

pub mod codec;
pub mod handshake;
pub mod opcodes;
pub mod packet;
pub mod wire;

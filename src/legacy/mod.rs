//! # Legacy Protocol
//!
//! The older bit-field framed format. A frame is a little-endian header word
//! whose bits select optional fields, followed by the payload and a
//! big-endian CRC-32 trailer:
//!
//! ```text
//! [Flags(2)] [Seq(2)] [AckResp(2)?] [Reserved(1|2|4|8)?] [AckReq(2)?]
//! [Fragment(6)?] [AckSeq(1|2)?] [Opcode(2)?] [Extra(N)] [CRC32(4)]
//! ```

pub mod crc;
pub mod packet;

pub use crc::generate_crc;
pub use packet::{AckSequence, FragmentInfo, LegacyFlags, LegacyPacket};

//! # Opcodes
//!
//! Protocol-level control codes, the two opcode wire encodings, and the
//! mapping between symbolic application opcodes and their wire values.
//!
//! ## Protocol opcode (2 bytes)
//! ```text
//! op <= 0xff : [0x00] [op]
//! op >  0xff : op in native byte order
//! ```
//! The two branches disagree on byte order. Deployed clients depend on it, so
//! it is reproduced as-is.
//!
//! ## Application opcode (1, 2 or 3 bytes)
//! One byte in 1-byte mode. In 2-byte mode the value is written little-endian,
//! and a value whose low byte is zero gets an extra leading `0x00` so it cannot
//! be read as a 1-byte opcode.

use std::borrow::Cow;
use std::collections::HashMap;
use std::fmt;

use parking_lot::RwLock;

use crate::error::{ProtocolError, Result};

pub const OP_SESSION_REQUEST: u16 = 0x01;
pub const OP_SESSION_RESPONSE: u16 = 0x02;
pub const OP_COMBINED: u16 = 0x03;
pub const OP_SESSION_DISCONNECT: u16 = 0x05;
pub const OP_KEEP_ALIVE: u16 = 0x06;
pub const OP_SESSION_STAT_REQUEST: u16 = 0x07;
pub const OP_SESSION_STAT_RESPONSE: u16 = 0x08;
pub const OP_PACKET: u16 = 0x09;
pub const OP_FRAGMENT: u16 = 0x0d;
pub const OP_OUT_OF_ORDER_ACK: u16 = 0x11;
pub const OP_ACK: u16 = 0x15;
pub const OP_APP_COMBINED: u16 = 0x19;
pub const OP_OUT_OF_SESSION: u16 = 0x1d;

/// Size of the protocol opcode field on the wire.
pub const PROTOCOL_OPCODE_SIZE: usize = 2;

/// True for the handshake opcodes that travel without a CRC trailer.
#[inline]
pub fn is_handshake_opcode(op: u8) -> bool {
    matches!(
        op as u16,
        OP_SESSION_REQUEST | OP_SESSION_RESPONSE | OP_OUT_OF_SESSION
    )
}

/// Writes a protocol opcode into the first two bytes of `dst`.
#[inline]
pub fn write_protocol_opcode(op: u16, dst: &mut [u8; 2]) {
    if op > 0xff {
        *dst = op.to_ne_bytes();
    } else {
        *dst = [0x00, op as u8];
    }
}

/// Reads a protocol opcode written by [`write_protocol_opcode`].
///
/// A leading zero byte always selects the short form, so on little-endian
/// hosts a wide opcode whose low byte is zero reads back as its high byte.
#[inline]
pub fn read_protocol_opcode(src: [u8; 2]) -> u16 {
    if src[0] == 0x00 {
        src[1] as u16
    } else {
        u16::from_ne_bytes(src)
    }
}

/// Application opcode width, fixed per protocol generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OpcodeWidth {
    One,
    #[default]
    Two,
}

impl OpcodeWidth {
    /// Builds a width from its byte count (1 or 2).
    pub fn from_size(size: u8) -> Option<Self> {
        match size {
            1 => Some(OpcodeWidth::One),
            2 => Some(OpcodeWidth::Two),
            _ => None,
        }
    }

    /// Bytes needed for `op`, including the zero escape.
    pub fn encoded_len(self, op: u16) -> usize {
        match self {
            OpcodeWidth::One => 1,
            OpcodeWidth::Two if op & 0x00ff == 0 => 3,
            OpcodeWidth::Two => 2,
        }
    }
}

/// Appends an application opcode to `dst`, returning the bytes written.
pub fn write_app_opcode(op: u16, width: OpcodeWidth, dst: &mut Vec<u8>) -> usize {
    match width {
        OpcodeWidth::One => dst.push(op as u8),
        OpcodeWidth::Two => {
            if op & 0x00ff == 0 {
                dst.push(0x00);
            }
            dst.extend_from_slice(&op.to_le_bytes());
        }
    }
    width.encoded_len(op)
}

/// Reads an application opcode from the front of `src`.
///
/// Returns the wire opcode and the offset where the body starts.
pub fn read_app_opcode(src: &[u8], width: OpcodeWidth) -> Result<(u16, usize)> {
    match width {
        OpcodeWidth::One => {
            let op = *src.first().ok_or(ProtocolError::truncated(1, 0))?;
            Ok((op as u16, 1))
        }
        OpcodeWidth::Two => {
            if src.len() < 2 {
                return Err(ProtocolError::truncated(2, src.len()));
            }
            let op = u16::from_le_bytes([src[0], src[1]]);
            if op == 0 && src.len() >= 3 {
                return Ok((u16::from_le_bytes([src[1], src[2]]), 3));
            }
            Ok((op, 2))
        }
    }
}

/// Symbolic game-message opcode, e.g. `OP_ZoneEntry`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EmuOpcode(Cow<'static, str>);

impl EmuOpcode {
    /// Placeholder for wire opcodes with no symbolic mapping.
    pub const UNKNOWN: EmuOpcode = EmuOpcode(Cow::Borrowed("OP_Unknown"));

    pub const fn from_static(name: &'static str) -> Self {
        EmuOpcode(Cow::Borrowed(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_unknown(&self) -> bool {
        *self == Self::UNKNOWN
    }
}

impl From<&'static str> for EmuOpcode {
    fn from(name: &'static str) -> Self {
        EmuOpcode::from_static(name)
    }
}

impl From<String> for EmuOpcode {
    fn from(name: String) -> Self {
        EmuOpcode(Cow::Owned(name))
    }
}

impl fmt::Display for EmuOpcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Resolves symbolic opcodes to wire values and back.
///
/// Injected into the factory and sessions at construction time, so each
/// deployment can pick its own mapping strategy.
pub trait OpcodeManager: Send + Sync {
    /// Wire value for a symbolic opcode, `None` if unmapped.
    fn emu_to_eq(&self, op: &EmuOpcode) -> Option<u16>;

    /// Symbolic opcode for a wire value, `None` if unmapped.
    fn eq_to_emu(&self, op: u16) -> Option<EmuOpcode>;
}

/// In-memory bidirectional opcode table.
#[derive(Debug, Default)]
pub struct OpcodeTable {
    inner: RwLock<OpcodeTableInner>,
}

#[derive(Debug, Default)]
struct OpcodeTableInner {
    by_name: HashMap<EmuOpcode, u16>,
    by_wire: HashMap<u16, EmuOpcode>,
}

impl OpcodeTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Maps `name` to `wire`, replacing any previous mapping of either side.
    pub fn insert(&self, name: impl Into<EmuOpcode>, wire: u16) {
        let name = name.into();
        let mut inner = self.inner.write();
        if let Some(old_wire) = inner.by_name.insert(name.clone(), wire) {
            if old_wire != wire {
                inner.by_wire.remove(&old_wire);
            }
        }
        if let Some(old_name) = inner.by_wire.insert(wire, name.clone()) {
            if old_name != name {
                inner.by_name.remove(&old_name);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.inner.read().by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<N: Into<EmuOpcode>> FromIterator<(N, u16)> for OpcodeTable {
    fn from_iter<I: IntoIterator<Item = (N, u16)>>(iter: I) -> Self {
        let table = OpcodeTable::new();
        for (name, wire) in iter {
            table.insert(name, wire);
        }
        table
    }
}

impl OpcodeManager for OpcodeTable {
    fn emu_to_eq(&self, op: &EmuOpcode) -> Option<u16> {
        self.inner.read().by_name.get(op).copied()
    }

    fn eq_to_emu(&self, op: u16) -> Option<EmuOpcode> {
        self.inner.read().by_wire.get(&op).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_protocol_opcode_has_zero_lead() {
        let mut buf = [0xffu8; 2];
        write_protocol_opcode(OP_PACKET, &mut buf);
        assert_eq!(buf, [0x00, 0x09]);
        assert_eq!(read_protocol_opcode(buf), OP_PACKET);
    }

    #[test]
    fn test_wide_protocol_opcode_uses_native_order() {
        let mut buf = [0u8; 2];
        write_protocol_opcode(0x1234, &mut buf);
        assert_eq!(buf, 0x1234u16.to_ne_bytes());
    }

    #[test]
    fn test_app_opcode_escape() {
        let mut out = Vec::new();
        assert_eq!(write_app_opcode(0x4200, OpcodeWidth::Two, &mut out), 3);
        assert_eq!(out, vec![0x00, 0x00, 0x42]);
        assert_eq!(read_app_opcode(&out, OpcodeWidth::Two).unwrap(), (0x4200, 3));

        out.clear();
        assert_eq!(write_app_opcode(0x4201, OpcodeWidth::Two, &mut out), 2);
        assert_eq!(out, vec![0x01, 0x42]);
    }

    #[test]
    fn test_one_byte_app_opcode() {
        let mut out = Vec::new();
        assert_eq!(write_app_opcode(0x00, OpcodeWidth::One, &mut out), 1);
        assert_eq!(read_app_opcode(&[0x7f, 1, 2], OpcodeWidth::One).unwrap(), (0x7f, 1));
        assert!(read_app_opcode(&[], OpcodeWidth::One).is_err());
    }

    #[test]
    fn test_table_lookup_both_ways() {
        let table: OpcodeTable = [("OP_ZoneEntry", 0x4107u16), ("OP_Camp", 0x78c1)]
            .into_iter()
            .collect();
        assert_eq!(table.len(), 2);
        assert_eq!(table.emu_to_eq(&"OP_Camp".into()), Some(0x78c1));
        assert_eq!(table.eq_to_emu(0x4107), Some(EmuOpcode::from("OP_ZoneEntry")));
        assert_eq!(table.eq_to_emu(0x9999), None);
    }

    #[test]
    fn test_table_remap_drops_stale_reverse_entry() {
        let table = OpcodeTable::new();
        table.insert("OP_Camp", 0x10);
        table.insert("OP_Camp", 0x20);
        assert_eq!(table.eq_to_emu(0x10), None);
        assert_eq!(table.eq_to_emu(0x20), Some("OP_Camp".into()));
    }
}

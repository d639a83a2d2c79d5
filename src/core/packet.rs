//! # Packets
//!
//! Value types for the three framing levels:
//!
//! - [`ProtocolPacket`]: the envelope, keyed by a protocol control opcode
//! - [`ApplicationPacket`]: a game message with a symbolic opcode
//! - [`RawApplicationPacket`]: a game message whose wire opcode has no mapping
//!
//! Every packet owns its payload; cloning copies it.

use std::fmt;
use std::net::SocketAddr;

use crate::core::opcodes::{
    read_app_opcode, read_protocol_opcode, write_app_opcode, write_protocol_opcode, EmuOpcode,
    OpcodeManager, OpcodeWidth, OP_COMBINED, PROTOCOL_OPCODE_SIZE,
};
use crate::error::{ProtocolError, Result};

/// Largest serialized combined container, exclusive.
pub const COMBINE_LIMIT: usize = 256;

/// Common view over every packet type.
pub trait Packet {
    /// Body bytes, without any opcode.
    fn payload(&self) -> &[u8];

    /// Opcode as shown in logs.
    fn opcode_label(&self) -> String;

    fn payload_len(&self) -> usize {
        self.payload().len()
    }

    /// Hex dump of the payload for diagnostics.
    fn hex_dump(&self) -> String {
        let mut out = String::with_capacity(self.payload_len() * 3);
        for (i, byte) in self.payload().iter().enumerate() {
            if i > 0 {
                out.push(if i % 16 == 0 { '\n' } else { ' ' });
            }
            out.push_str(&format!("{byte:02x}"));
        }
        out
    }
}

/// Protocol envelope: a control opcode plus a body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolPacket {
    pub opcode: u16,
    pub payload: Vec<u8>,
}

impl ProtocolPacket {
    pub fn new(opcode: u16, payload: &[u8]) -> Self {
        Self {
            opcode,
            payload: payload.to_vec(),
        }
    }

    pub fn from_vec(opcode: u16, payload: Vec<u8>) -> Self {
        Self { opcode, payload }
    }

    /// Parses an unframed envelope (no compression flag, no CRC).
    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        if buf.len() < PROTOCOL_OPCODE_SIZE {
            return Err(ProtocolError::truncated(PROTOCOL_OPCODE_SIZE, buf.len()));
        }
        Ok(Self {
            opcode: read_protocol_opcode([buf[0], buf[1]]),
            payload: buf[PROTOCOL_OPCODE_SIZE..].to_vec(),
        })
    }

    /// Serialized size: opcode plus body.
    pub fn size(&self) -> usize {
        self.payload.len() + PROTOCOL_OPCODE_SIZE
    }

    /// Appends opcode and body to `dst`, returning the bytes written.
    pub fn serialize(&self, dst: &mut Vec<u8>) -> usize {
        let mut op = [0u8; 2];
        write_protocol_opcode(self.opcode, &mut op);
        dst.extend_from_slice(&op);
        dst.extend_from_slice(&self.payload);
        self.size()
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.size());
        self.serialize(&mut out);
        out
    }

    /// Packs `rhs` into this packet as a combined container.
    ///
    /// Returns `false`, leaving `self` untouched, when the result would not fit
    /// in a single combined datagram.
    pub fn combine(&mut self, rhs: &ProtocolPacket) -> bool {
        if self.opcode == OP_COMBINED {
            if self.payload.len() + rhs.payload.len() + 5 >= COMBINE_LIMIT {
                return false;
            }
            self.payload.reserve(rhs.size() + 1);
            self.payload.push(rhs.size() as u8);
            rhs.serialize(&mut self.payload);
            true
        } else {
            if self.payload.len() + rhs.payload.len() + 7 >= COMBINE_LIMIT {
                return false;
            }
            let mut combined = Vec::with_capacity(self.size() + rhs.size() + 2);
            combined.push(self.size() as u8);
            self.serialize(&mut combined);
            combined.push(rhs.size() as u8);
            rhs.serialize(&mut combined);
            self.payload = combined;
            self.opcode = OP_COMBINED;
            true
        }
    }

    /// Iterates the length-prefixed entries of a combined container.
    ///
    /// Iteration stops at the first entry whose length runs past the buffer.
    pub fn combined_entries(&self) -> CombinedEntries<'_> {
        CombinedEntries {
            buf: if self.opcode == OP_COMBINED {
                &self.payload
            } else {
                &[]
            },
        }
    }
}

impl Packet for ProtocolPacket {
    fn payload(&self) -> &[u8] {
        &self.payload
    }

    fn opcode_label(&self) -> String {
        format!("{:#04x}", self.opcode)
    }
}

/// Iterator over serialized sub-packets of a combined container.
pub struct CombinedEntries<'a> {
    buf: &'a [u8],
}

impl<'a> Iterator for CombinedEntries<'a> {
    type Item = &'a [u8];

    fn next(&mut self) -> Option<Self::Item> {
        let (&len, rest) = self.buf.split_first()?;
        let len = len as usize;
        if len == 0 || len > rest.len() {
            self.buf = &[];
            return None;
        }
        let (entry, rest) = rest.split_at(len);
        self.buf = rest;
        Some(entry)
    }
}

/// Game message with a symbolic opcode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplicationPacket {
    pub opcode: EmuOpcode,
    pub payload: Vec<u8>,
    pub src: Option<SocketAddr>,
    pub dst: Option<SocketAddr>,
}

impl ApplicationPacket {
    pub fn new(opcode: impl Into<EmuOpcode>, payload: &[u8]) -> Self {
        Self {
            opcode: opcode.into(),
            payload: payload.to_vec(),
            src: None,
            dst: None,
        }
    }

    /// Records the endpoints for diagnostics.
    pub fn with_addresses(mut self, src: Option<SocketAddr>, dst: Option<SocketAddr>) -> Self {
        self.src = src;
        self.dst = dst;
        self
    }

    /// Appends wire opcode and body to `dst`, returning the bytes written.
    pub fn serialize(
        &self,
        opcodes: &dyn OpcodeManager,
        width: OpcodeWidth,
        dst: &mut Vec<u8>,
    ) -> Result<usize> {
        let wire = opcodes
            .emu_to_eq(&self.opcode)
            .ok_or_else(|| ProtocolError::UnmappedOpcode(self.opcode.to_string()))?;
        let written = write_app_opcode(wire, width, dst);
        dst.extend_from_slice(&self.payload);
        Ok(written + self.payload.len())
    }
}

impl Packet for ApplicationPacket {
    fn payload(&self) -> &[u8] {
        &self.payload
    }

    fn opcode_label(&self) -> String {
        self.opcode.to_string()
    }
}

impl fmt::Display for ApplicationPacket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{} len={}]", self.opcode, self.payload.len())?;
        if let (Some(src), Some(dst)) = (self.src, self.dst) {
            write!(f, " {src} -> {dst}")?;
        }
        Ok(())
    }
}

/// Game message whose wire opcode has no symbolic mapping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawApplicationPacket {
    pub raw_opcode: u16,
    pub packet: ApplicationPacket,
}

impl RawApplicationPacket {
    /// Re-emits the original wire opcode and body.
    pub fn serialize(&self, width: OpcodeWidth, dst: &mut Vec<u8>) -> usize {
        let written = write_app_opcode(self.raw_opcode, width, dst);
        dst.extend_from_slice(&self.packet.payload);
        written + self.packet.payload.len()
    }
}

impl Packet for RawApplicationPacket {
    fn payload(&self) -> &[u8] {
        &self.packet.payload
    }

    fn opcode_label(&self) -> String {
        format!("{}({:#06x})", self.packet.opcode, self.raw_opcode)
    }
}

/// A decoded game message, mapped or not.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppMessage {
    Known(ApplicationPacket),
    Raw(RawApplicationPacket),
}

impl AppMessage {
    /// Parses opcode and body from the front of `buf`.
    pub fn decode(buf: &[u8], width: OpcodeWidth, opcodes: &dyn OpcodeManager) -> Result<Self> {
        let (wire, body_at) = read_app_opcode(buf, width)?;
        Ok(Self::from_wire(wire, buf[body_at..].to_vec(), opcodes))
    }

    /// Wraps an already separated wire opcode and body.
    pub fn from_wire(wire: u16, payload: Vec<u8>, opcodes: &dyn OpcodeManager) -> Self {
        match opcodes.eq_to_emu(wire) {
            Some(opcode) => AppMessage::Known(ApplicationPacket {
                opcode,
                payload,
                src: None,
                dst: None,
            }),
            None => AppMessage::Raw(RawApplicationPacket {
                raw_opcode: wire,
                packet: ApplicationPacket {
                    opcode: EmuOpcode::UNKNOWN,
                    payload,
                    src: None,
                    dst: None,
                },
            }),
        }
    }

    /// The symbolic view; `OP_Unknown` for raw messages.
    pub fn packet(&self) -> &ApplicationPacket {
        match self {
            AppMessage::Known(p) => p,
            AppMessage::Raw(raw) => &raw.packet,
        }
    }

    pub fn is_known(&self) -> bool {
        matches!(self, AppMessage::Known(_))
    }

    pub(crate) fn set_addresses(&mut self, src: SocketAddr, dst: SocketAddr) {
        let packet = match self {
            AppMessage::Known(p) => p,
            AppMessage::Raw(raw) => &mut raw.packet,
        };
        packet.src = Some(src);
        packet.dst = Some(dst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::opcodes::{OpcodeTable, OP_KEEP_ALIVE, OP_PACKET};

    #[test]
    fn test_clone_is_independent() {
        let original = ProtocolPacket::new(OP_PACKET, &[1, 2, 3]);
        let mut copy = original.clone();
        copy.payload[0] = 9;
        assert_eq!(original.payload, vec![1, 2, 3]);
    }

    #[test]
    fn test_combine_builds_container() {
        let mut a = ProtocolPacket::new(OP_PACKET, &[1, 2]);
        let b = ProtocolPacket::new(OP_KEEP_ALIVE, &[]);
        assert!(a.combine(&b));
        assert_eq!(a.opcode, OP_COMBINED);
        assert_eq!(a.payload, vec![4, 0x00, 0x09, 1, 2, 2, 0x00, 0x06]);

        let c = ProtocolPacket::new(OP_PACKET, &[7]);
        assert!(a.combine(&c));
        let entries: Vec<&[u8]> = a.combined_entries().collect();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[2], &[0x00, 0x09, 7]);
    }

    #[test]
    fn test_combine_over_budget_leaves_receiver() {
        let mut a = ProtocolPacket::new(OP_PACKET, &[0u8; 200]);
        let b = ProtocolPacket::new(OP_PACKET, &[0u8; 49]);
        let before = a.clone();
        assert!(!a.combine(&b));
        assert_eq!(a, before);
    }

    #[test]
    fn test_truncated_combined_entry_stops_iteration() {
        let p = ProtocolPacket::from_vec(OP_COMBINED, vec![2, 0x00, 0x06, 9, 0x00]);
        let entries: Vec<&[u8]> = p.combined_entries().collect();
        assert_eq!(entries, vec![&[0x00, 0x06][..]]);
    }

    #[test]
    fn test_app_message_mapping() {
        let table = OpcodeTable::new();
        table.insert("OP_Camp", 0x1234);
        let known = AppMessage::decode(&[0x34, 0x12, 0xaa], OpcodeWidth::Two, &table).unwrap();
        assert!(known.is_known());
        assert_eq!(known.packet().payload, vec![0xaa]);

        let raw = AppMessage::decode(&[0x99, 0x00, 0xbb], OpcodeWidth::Two, &table).unwrap();
        match raw {
            AppMessage::Raw(raw) => {
                assert!(raw.packet.opcode.is_unknown());
                assert_eq!(raw.raw_opcode, 0x0099);
                let mut out = Vec::new();
                assert_eq!(raw.serialize(OpcodeWidth::Two, &mut out), 3);
                assert_eq!(out, vec![0x99, 0x00, 0xbb]);
            }
            other => panic!("expected raw packet, got {other:?}"),
        }
    }

    #[test]
    fn test_unmapped_symbolic_opcode_is_an_error() {
        let table = OpcodeTable::new();
        let packet = ApplicationPacket::new("OP_Nothing", &[]);
        let mut out = Vec::new();
        assert!(matches!(
            packet.serialize(&table, OpcodeWidth::Two, &mut out),
            Err(ProtocolError::UnmappedOpcode(_))
        ));
    }

    #[test]
    fn test_display_with_addresses() {
        let packet = ApplicationPacket::new("OP_Camp", &[1, 2, 3]).with_addresses(
            Some("10.0.0.2:7000".parse().unwrap()),
            Some("10.0.0.1:9000".parse().unwrap()),
        );
        assert_eq!(packet.to_string(), "[OP_Camp len=3] 10.0.0.2:7000 -> 10.0.0.1:9000");
        assert_eq!(ApplicationPacket::new("OP_Camp", &[]).to_string(), "[OP_Camp len=0]");
    }

    #[test]
    fn test_hex_dump() {
        let p = ProtocolPacket::new(OP_PACKET, &[0x01, 0xab]);
        assert_eq!(p.hex_dump(), "01 ab");
    }
}

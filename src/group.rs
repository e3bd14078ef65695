//! Thin group-call relay: per-participant stream routing with no
//! audio mixing (spec §1 "one group-call helper exists but delegates
//! mixing upstream"). Grounded on
//! `original_source/.../VoIPGroupController.h/.cpp`, limited to the
//! routing behavior spec §4 actually describes — per §9(c) the
//! original's `VoIPGroupController`/video-send paths are partly
//! stubbed and must not be extrapolated beyond that.

use crate::jitter::{JitterBuffer, JitterParams};
use std::collections::HashMap;

/// One participant's set of active streams, each with its own jitter
/// buffer (one controller-side instance of [`crate::jitter::JitterBuffer`]
/// per source, not shared).
pub struct ParticipantStreams {
    pub user_id: i32,
    streams: HashMap<u8, JitterBuffer>,
}

impl ParticipantStreams {
    pub fn new(user_id: i32) -> Self {
        Self { user_id, streams: HashMap::new() }
    }

    pub fn ensure_stream(&mut self, stream_id: u8, params: JitterParams) -> &mut JitterBuffer {
        self.streams.entry(stream_id).or_insert_with(|| JitterBuffer::new(params))
    }

    pub fn stream(&mut self, stream_id: u8) -> Option<&mut JitterBuffer> {
        self.streams.get_mut(&stream_id)
    }
}

/// Routes inbound `STREAM_DATA` by source user id to the matching
/// participant's jitter buffer; performs no mixing, level metering, or
/// volume control of its own (those remain the host application's
/// responsibility per the non-goal in spec §1).
pub struct GroupCallRelay {
    participants: HashMap<i32, ParticipantStreams>,
    default_jitter_params: JitterParams,
}

impl GroupCallRelay {
    pub fn new(default_jitter_params: JitterParams) -> Self {
        Self { participants: HashMap::new(), default_jitter_params }
    }

    pub fn add_participant(&mut self, user_id: i32) {
        self.participants.entry(user_id).or_insert_with(|| ParticipantStreams::new(user_id));
    }

    pub fn remove_participant(&mut self, user_id: i32) {
        self.participants.remove(&user_id);
    }

    pub fn participant_count(&self) -> usize {
        self.participants.len()
    }

    /// Routes one incoming stream-data payload to the right
    /// participant/stream jitter buffer, creating it on first sight.
    /// Returns `false` if `user_id` is not a known participant.
    pub fn route_incoming(&mut self, user_id: i32, stream_id: u8, timestamp: u32, payload: &[u8], is_ec: bool, recv_time_secs: f64) -> bool {
        let Some(participant) = self.participants.get_mut(&user_id) else { return false };
        let jitter = participant.ensure_stream(stream_id, self.default_jitter_params);
        jitter.handle_input(timestamp, payload, is_ec, recv_time_secs, true);
        true
    }

    pub fn participant_mut(&mut self, user_id: i32) -> Option<&mut ParticipantStreams> {
        self.participants.get_mut(&user_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::JitterDefaults;

    fn params() -> JitterParams {
        JitterParams::from_defaults(960, JitterDefaults::for_frame_duration(60))
    }

    #[test]
    fn unknown_participant_is_rejected() {
        let mut relay = GroupCallRelay::new(params());
        assert!(!relay.route_incoming(42, 1, 0, &[1, 2, 3], false, 0.0));
    }

    #[test]
    fn routes_to_the_right_participants_stream_independently() {
        let mut relay = GroupCallRelay::new(params());
        relay.add_participant(1);
        relay.add_participant(2);

        assert!(relay.route_incoming(1, 0, 0, b"from-one", false, 0.0));
        assert!(relay.route_incoming(2, 0, 0, b"from-two", false, 0.0));

        let (_, _, out1) = relay.participant_mut(1).unwrap().stream(0).unwrap().handle_output(0, false);
        let (_, _, out2) = relay.participant_mut(2).unwrap().stream(0).unwrap().handle_output(0, false);

        assert_eq!(out1.unwrap().0, b"from-one");
        assert_eq!(out2.unwrap().0, b"from-two");
    }

    #[test]
    fn removing_a_participant_drops_its_streams() {
        let mut relay = GroupCallRelay::new(params());
        relay.add_participant(7);
        relay.route_incoming(7, 0, 0, b"hi", false, 0.0);
        relay.remove_participant(7);
        assert_eq!(relay.participant_count(), 0);
        assert!(!relay.route_incoming(7, 0, 0, b"hi", false, 0.0));
    }
}

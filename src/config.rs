//! Injected server configuration (spec §9 Design Notes: "make [server
//! config] an explicit dependency injected into the controller at
//! construction"). Grounded on `VoIPServerConfig.h`'s JSON-backed
//! key/value store, generalized into a typed, `serde`-deserializable
//! struct so tests can substitute deterministic values without a
//! process-wide singleton.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Per-network-type audio bitrate ladder (spec §4.8).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BitrateLadder {
    pub init: u32,
    pub max: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioBitrateConfig {
    pub wifi: BitrateLadder,
    pub cellular_high: BitrateLadder,
    pub cellular_low_gprs: BitrateLadder,
    pub cellular_low_edge: BitrateLadder,
    pub data_saving: BitrateLadder,
    pub step_incr: u32,
    pub step_decr: u32,
    pub min_bitrate: u32,
}

impl Default for AudioBitrateConfig {
    fn default() -> Self {
        Self {
            wifi: BitrateLadder { init: 32000, max: 64000 },
            cellular_high: BitrateLadder { init: 20000, max: 32000 },
            cellular_low_gprs: BitrateLadder { init: 8000, max: 8000 },
            cellular_low_edge: BitrateLadder { init: 8000, max: 16000 },
            data_saving: BitrateLadder { init: 8000, max: 16000 },
            step_incr: 3000,
            step_decr: 3000,
            min_bitrate: 8_000,
        }
    }
}

/// Per-frame-duration jitter buffer defaults (spec §8 boundary
/// behaviors): `frame_duration=60 -> (2, 10, 20)`,
/// `frame_duration=20 -> (6, 25, 50)`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct JitterDefaults {
    pub min_delay: u32,
    pub max_delay: u32,
    pub max_allowed_slots: u32,
}

impl JitterDefaults {
    pub fn for_frame_duration(frame_duration_ms: u32) -> Self {
        match frame_duration_ms {
            60 => Self { min_delay: 2, max_delay: 10, max_allowed_slots: 20 },
            40 => Self { min_delay: 4, max_delay: 17, max_allowed_slots: 35 },
            20 => Self { min_delay: 6, max_delay: 25, max_allowed_slots: 50 },
            _ => Self { min_delay: 6, max_delay: 25, max_allowed_slots: 50 },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Audio congestion controller target window, bytes (§4.6).
    pub cwnd: usize,

    /// Relay-selection hysteresis (§4.3).
    pub relay_switch_threshold: f64,
    pub p2p_to_relay_switch_threshold: f64,
    pub relay_to_p2p_switch_threshold: f64,

    pub audio_bitrate: AudioBitrateConfig,

    /// Shitty-internet-mode loss thresholds (§4.8): 0.02/0.05/0.08.
    pub extra_ec_threshold_low: f64,
    pub extra_ec_threshold_mid: f64,
    pub extra_ec_threshold_high: f64,

    #[serde(with = "duration_secs")]
    pub init_timeout: Duration,
    #[serde(with = "duration_secs")]
    pub recv_timeout: Duration,
    #[serde(with = "duration_secs")]
    pub reconnecting_state_timeout: Duration,

    pub min_protocol_version: u32,

    /// Backpressure cap on the audio send pipeline (§4.4, §8).
    pub max_unsent_stream_packets: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            cwnd: 1024,
            relay_switch_threshold: 1.1,
            p2p_to_relay_switch_threshold: 0.8,
            relay_to_p2p_switch_threshold: 1.2,
            audio_bitrate: AudioBitrateConfig::default(),
            extra_ec_threshold_low: 0.02,
            extra_ec_threshold_mid: 0.05,
            extra_ec_threshold_high: 0.08,
            init_timeout: Duration::from_secs(30),
            recv_timeout: Duration::from_secs(20),
            reconnecting_state_timeout: Duration::from_secs(2),
            min_protocol_version: 1,
            max_unsent_stream_packets: 30,
        }
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(d)?;
        Ok(Duration::from_secs_f64(secs))
    }
}

/// The network type hint supplied by the host app (spec §4.8, §6
/// `SetNetworkType`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, uniffi::Enum)]
pub enum NetworkType {
    Wifi,
    CellularHigh,
    CellularGprs,
    CellularEdge,
    Unknown,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jitter_defaults_match_spec_boundary_table() {
        let d60 = JitterDefaults::for_frame_duration(60);
        assert_eq!((d60.min_delay, d60.max_delay, d60.max_allowed_slots), (2, 10, 20));
        let d20 = JitterDefaults::for_frame_duration(20);
        assert_eq!((d20.min_delay, d20.max_delay, d20.max_allowed_slots), (6, 25, 50));
    }

    #[test]
    fn config_round_trips_through_json() {
        let cfg = ServerConfig::default();
        let json = serde_json::to_string(&cfg).unwrap();
        let back: ServerConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(cfg, back);
    }
}

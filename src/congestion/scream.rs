//! SCReAM-style delay-based video congestion controller (spec §4.7).
//! Grounded on `original_source/.../video/ScreamCongestionController.h/.cpp`.

use crate::buffers::HistoricBuffer;
use std::time::{Duration, Instant};

pub const MIN_CWND: u32 = 3000;
const MIN_TARGET_BITRATE: u32 = 50_000;
const MAX_TARGET_BITRATE: u32 = 500_000;
const QDELAY_TARGET_MIN: f32 = 0.1;
const QDELAY_TARGET_MAX: f32 = 0.4;
const GAIN: f32 = 1.0;
const MSS: f32 = 1200.0;
const PRE_CONGESTION_GUARD: f32 = 0.1;
const TX_QUEUE_SIZE_FACTOR: f32 = 0.2;

pub struct ScreamController {
    qdelay_fraction_hist: HistoricBuffer<f64>,
    qdelay_norm_hist: HistoricBuffer<f64>,
    rate_media_history: HistoricBuffer<f64>,

    qdelay_target: f32,
    qdelay_fraction_avg: f32,
    qdelay_trend: f32,
    qdelay_trend_mem: f32,

    cwnd: u32,
    bytes_in_flight: u32,
    max_bytes_in_flight: u32,
    target_bitrate: u32,

    rtp_queue_size: u32,

    in_fast_increase: bool,
    last_rate_adjustment: Option<Instant>,
}

impl ScreamController {
    pub fn new() -> Self {
        Self {
            qdelay_fraction_hist: HistoricBuffer::new(20),
            qdelay_norm_hist: HistoricBuffer::new(100),
            rate_media_history: HistoricBuffer::new(25),
            qdelay_target: QDELAY_TARGET_MIN,
            qdelay_fraction_avg: 0.0,
            qdelay_trend: 0.0,
            qdelay_trend_mem: 0.0,
            cwnd: MIN_CWND,
            bytes_in_flight: 0,
            max_bytes_in_flight: 0,
            target_bitrate: MIN_TARGET_BITRATE,
            rtp_queue_size: 0,
            in_fast_increase: true,
            last_rate_adjustment: None,
        }
    }

    pub fn process_packet_sent(&mut self, size: u32) {
        self.bytes_in_flight += size;
        self.max_bytes_in_flight = self.max_bytes_in_flight.max(self.bytes_in_flight);
    }

    pub fn process_packet_lost(&mut self, size: u32) {
        self.bytes_in_flight = self.bytes_in_flight.saturating_sub(size);
        self.target_bitrate = ((self.target_bitrate as f32) * 0.9) as u32;
        self.target_bitrate = self.target_bitrate.clamp(MIN_TARGET_BITRATE, MAX_TARGET_BITRATE);
    }

    /// Runs on every received ack (spec §4.7 steps 1-2).
    pub fn process_acks(&mut self, one_way_delay: f32, bytes_newly_acked: u32, now: Instant) {
        self.bytes_in_flight = self.bytes_in_flight.saturating_sub(bytes_newly_acked);

        self.adjust_qdelay_target(one_way_delay);
        let qdelay_norm = (one_way_delay / self.qdelay_target).min(1.0);
        self.qdelay_norm_hist.add(qdelay_norm as f64);

        let qdelay_fraction = if one_way_delay > self.qdelay_target { 1.0 } else { 0.0 };
        self.qdelay_fraction_hist.add(qdelay_fraction);
        self.qdelay_fraction_avg = self.qdelay_fraction_hist.average() as f32;

        self.qdelay_trend = self.qdelay_norm_hist.average_first_n(5) as f32;
        self.qdelay_trend_mem = self.qdelay_trend_mem.max(self.qdelay_trend * 0.9);

        self.update_cwnd(bytes_newly_acked);
        self.maybe_adjust_target_bitrate(now);
    }

    fn adjust_qdelay_target(&mut self, one_way_delay: f32) {
        if one_way_delay > self.qdelay_target {
            self.qdelay_target = (self.qdelay_target * 1.02).min(QDELAY_TARGET_MAX);
        } else {
            self.qdelay_target = (self.qdelay_target * 0.999).max(QDELAY_TARGET_MIN);
        }
    }

    /// Adjusts `cwnd` by `bytes_newly_acked` in fast-increase, or by
    /// `gain · off_target · bytes_newly_acked · MSS / cwnd` otherwise,
    /// clamped to `max_bytes_in_flight * 1.1` (spec §4.7 step 2).
    fn update_cwnd(&mut self, bytes_newly_acked: u32) {
        self.in_fast_increase = self.qdelay_trend < 0.2;

        let delta = if self.in_fast_increase {
            bytes_newly_acked as f32
        } else {
            let off_target = (self.qdelay_target - self.qdelay_trend * self.qdelay_target) / self.qdelay_target;
            GAIN * off_target * bytes_newly_acked as f32 * MSS / self.cwnd.max(1) as f32
        };

        let new_cwnd = (self.cwnd as f32 + delta).max(MIN_CWND as f32);
        let cap = (self.max_bytes_in_flight as f32 * 1.1).max(MIN_CWND as f32);
        self.cwnd = new_cwnd.min(cap) as u32;
    }

    /// Every 200 ms, recompute the target bitrate (spec §4.7 step 3).
    fn maybe_adjust_target_bitrate(&mut self, now: Instant) {
        if let Some(last) = self.last_rate_adjustment {
            if now.saturating_duration_since(last) < Duration::from_millis(200) {
                return;
            }
        }
        self.last_rate_adjustment = Some(now);

        let current_rate = self.target_bitrate as f32;
        let rate_media = self.rate_media_history.non_zero_average() as f32;
        let rate_media_median = rate_media;

        let new_rate = if self.in_fast_increase {
            current_rate + current_rate * 0.05
        } else {
            current_rate * (1.0 - PRE_CONGESTION_GUARD * self.qdelay_trend)
                - TX_QUEUE_SIZE_FACTOR * self.rtp_queue_size as f32
        };

        let cap = current_rate.max(rate_media).max(rate_media_median) * (2.0 - self.qdelay_trend_mem);
        self.target_bitrate = new_rate.min(cap).clamp(MIN_TARGET_BITRATE as f32, MAX_TARGET_BITRATE as f32) as u32;
    }

    pub fn update_media_rate(&mut self, frame_size: u32) {
        self.rate_media_history.add(frame_size as f64 * 8.0);
        self.rtp_queue_size = self.bytes_in_flight / frame_size.max(1);
    }

    pub fn bitrate(&self) -> u32 {
        self.target_bitrate
    }

    pub fn cwnd(&self) -> u32 {
        self.cwnd
    }
}

impl Default for ScreamController {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cwnd_never_drops_below_minimum() {
        let mut ctl = ScreamController::new();
        let now = Instant::now();
        for _ in 0..50 {
            ctl.process_acks(0.5, 10, now);
        }
        assert!(ctl.cwnd() >= MIN_CWND);
    }

    #[test]
    fn bitrate_stays_within_bounds() {
        let mut ctl = ScreamController::new();
        let now = Instant::now();
        for i in 0..20 {
            ctl.process_acks(0.05, 1000, now + Duration::from_millis(i * 200));
        }
        assert!(ctl.bitrate() >= MIN_TARGET_BITRATE);
        assert!(ctl.bitrate() <= MAX_TARGET_BITRATE);
    }

    #[test]
    fn packet_loss_reduces_target_bitrate() {
        let mut ctl = ScreamController::new();
        let now = Instant::now();
        ctl.process_acks(0.05, 1000, now);
        let before = ctl.bitrate();
        ctl.process_packet_lost(500);
        assert!(ctl.bitrate() <= before);
    }
}

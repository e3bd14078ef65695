//! Per-stream jitter buffer: reorder/dedup, loss concealment via
//! neighbor substitution, and an adaptive target delay (spec §4.5,
//! §8 invariant 2).
//!
//! Grounded on `original_source/.../JitterBuffer.h/.cpp`. The C++
//! version hands slots out of a fixed `BufferPool<1024,64>`; here each
//! slot just owns its `Vec<u8>` payload, the same way incoming audio
//! keyed by sequence lives in a plain `BTreeMap<u16, Vec<u8>>` rather
//! than a hand-rolled pool.

use crate::buffers::HistoricBuffer;
use std::collections::BTreeMap;

const HISTORY_SIZE: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ok,
    Missing,
    Replaced,
}

/// Hints returned to the decoder alongside [`Status::Ok`]/[`Status::Replaced`]
/// so it can resample a frame shorter or longer than nominal (spec
/// §4.5 "Adaptive delay").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackScale {
    Normal,
    SpeedUp,
    SlowDown,
}

#[derive(Debug, Clone)]
struct Slot {
    payload: Vec<u8>,
    is_ec: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct JitterParams {
    pub step: u32,
    pub min_delay: u32,
    pub max_delay: u32,
    pub max_allowed_slots: u32,
    pub losses_to_reset: u32,
    pub resync_threshold: f64,
}

impl JitterParams {
    pub fn from_defaults(step: u32, defaults: crate::config::JitterDefaults) -> Self {
        Self {
            step,
            min_delay: defaults.min_delay,
            max_delay: defaults.max_delay,
            max_allowed_slots: defaults.max_allowed_slots,
            losses_to_reset: 20,
            resync_threshold: 2.0,
        }
    }
}

pub struct JitterBuffer {
    params: JitterParams,

    slots: BTreeMap<u32, Slot>,
    history: BTreeMap<u32, Slot>,

    next_timestamp: u32,
    add_to_timestamp: u32,
    delay: u32,
    replace_radius: u32,

    delay_history: HistoricBuffer<u32>,
    late_history: HistoricBuffer<u32>,
    deviation_history: HistoricBuffer<f64>,

    last_put_timestamp: Option<u32>,
    prev_recv_time_secs: Option<f64>,

    lost_count: u32,
    lost_since_reset: u32,
    got_since_reset: u32,
    late_packet_count: u32,

    dont_inc_delay: u32,
    dont_dec_delay: u32,

    was_reset: bool,
}

impl JitterBuffer {
    pub fn new(params: JitterParams) -> Self {
        Self {
            params,
            slots: BTreeMap::new(),
            history: BTreeMap::new(),
            next_timestamp: 0,
            add_to_timestamp: 0,
            delay: params.min_delay.max(1),
            replace_radius: 1,
            delay_history: HistoricBuffer::new(HISTORY_SIZE),
            late_history: HistoricBuffer::new(HISTORY_SIZE),
            deviation_history: HistoricBuffer::new(HISTORY_SIZE),
            last_put_timestamp: None,
            prev_recv_time_secs: None,
            lost_count: 0,
            lost_since_reset: 0,
            got_since_reset: 0,
            late_packet_count: 0,
            dont_inc_delay: 0,
            dont_dec_delay: 0,
            was_reset: true,
        }
    }

    pub fn reset(&mut self) {
        self.slots.clear();
        self.history.clear();
        self.next_timestamp = 0;
        self.add_to_timestamp = 0;
        self.delay = self.params.min_delay.max(1);
        self.last_put_timestamp = None;
        self.prev_recv_time_secs = None;
        self.lost_count = 0;
        self.lost_since_reset = 0;
        self.got_since_reset = 0;
        self.late_packet_count = 0;
        self.was_reset = true;
    }

    fn addition_for_timestamp(&self) -> u32 {
        self.add_to_timestamp + (self.params.max_delay.saturating_sub(self.delay)) * self.params.step
    }

    /// Inserts an incoming stream-data payload at `timestamp` (spec
    /// §4.5 "Insertion"). `recv_time_secs` is a monotonic clock reading
    /// used only to update the inter-arrival deviation history.
    pub fn handle_input(&mut self, timestamp: u32, payload: &[u8], is_ec: bool, recv_time_secs: f64, overwrite_existing: bool) {
        if let Some(prev) = self.prev_recv_time_secs {
            let expected_step_secs = self.params.step as f64 / 1000.0;
            let deviation = (recv_time_secs - prev) - expected_step_secs;
            self.deviation_history.add(deviation);
        }
        self.prev_recv_time_secs = Some(recv_time_secs);

        if self.was_reset {
            self.was_reset = false;
            let backoff = self.params.step.saturating_mul(self.delay);
            if timestamp >= backoff {
                self.next_timestamp = timestamp - backoff;
                self.add_to_timestamp = 0;
            } else {
                self.add_to_timestamp = backoff - timestamp;
                self.next_timestamp = 0;
            }
        }

        let addition = self.addition_for_timestamp();
        let cutoff = self.next_timestamp.saturating_sub(addition);
        self.slots.retain(|&ts, _| ts >= cutoff);

        if timestamp.wrapping_add(addition) < self.next_timestamp {
            self.late_packet_count += 1;
            return;
        }

        if let Some(existing) = self.slots.get(&timestamp) {
            if existing.is_ec && !is_ec {
                // EC slots never overwrite non-EC data, but non-EC data
                // may still replace an EC placeholder.
            } else if !overwrite_existing {
                return;
            }
        }

        if self.slots.len() as u32 >= self.params.max_allowed_slots {
            let oldest = self.slots.keys().next().copied();
            if let Some(oldest_ts) = oldest {
                if timestamp < oldest_ts {
                    return;
                }
                self.advance_no_output();
            }
        }

        self.slots.insert(timestamp, Slot { payload: payload.to_vec(), is_ec });
        self.last_put_timestamp = Some(timestamp);
        self.got_since_reset += 1;
    }

    fn advance_no_output(&mut self) {
        if let Some((&ts, slot)) = self.slots.iter().next().map(|(k, v)| (k, v.clone())) {
            self.slots.remove(&ts);
            self.history.insert(ts, slot);
        }
    }

    /// Requests the slot for `next_timestamp + offset*step` (spec §4.5
    /// "Output"). Returns the status, the playback-scale hint, and
    /// (when not Missing) a copy of the payload plus its EC flag.
    pub fn handle_output(&mut self, offset: i64, advance: bool) -> (Status, PlaybackScale, Option<(Vec<u8>, bool)>) {
        let wanted = (self.next_timestamp as i64 + offset * self.params.step as i64) as u32;

        let hit = self.slots.remove(&wanted);
        let result = if let Some(slot) = hit {
            if offset == 0 {
                let radius = self.replace_radius * self.params.step;
                self.history.insert(wanted, slot.clone());
                let floor = self.next_timestamp.saturating_sub(radius);
                self.history.retain(|&ts, _| ts >= floor);
            }
            (Status::Ok, Some((slot.payload, slot.is_ec)))
        } else {
            let radius = self.replace_radius * self.params.step;
            let lo = wanted.saturating_sub(radius);
            let hi = wanted.saturating_add(radius);

            let neighbor = self
                .slots
                .range(lo..=hi)
                .chain(self.history.range(lo..=hi))
                .find(|(_, slot)| !slot.is_ec)
                .map(|(_, slot)| slot.payload.clone());

            self.lost_count += 1;
            self.lost_since_reset += 1;
            if self.lost_count >= self.params.losses_to_reset
                || (self.got_since_reset > 4 && self.lost_since_reset > self.got_since_reset / 2)
            {
                self.was_reset = true;
            }

            match neighbor {
                Some(payload) => (Status::Replaced, Some((payload, false))),
                None => (Status::Missing, None),
            }
        };

        if advance {
            self.next_timestamp = self.next_timestamp.wrapping_add(self.params.step);
        }

        (result.0, PlaybackScale::Normal, result.1)
    }

    /// The 500 ms adaptive-delay recompute (spec §4.5 "Adaptive
    /// delay"). Returns a playback-scale hint when `delay` changes.
    pub fn tick_adaptive_delay(&mut self) -> PlaybackScale {
        self.delay_history.add(self.slots.len() as u32);
        self.late_history.add(self.late_packet_count);
        self.late_packet_count = 0;

        let sigma = self.deviation_stddev();
        let target = (2.0 * sigma * 1000.0 / self.params.step as f64).ceil() as i64;
        let target = target.clamp(self.params.min_delay as i64, self.params.max_delay as i64) as u32;

        if target > self.delay {
            if self.dont_inc_delay == 0 {
                self.delay += 1;
                self.dont_dec_delay = 3;
                return PlaybackScale::SlowDown;
            }
            self.dont_inc_delay -= 1;
        } else if target < self.delay {
            if self.dont_dec_delay == 0 {
                self.delay = self.delay.saturating_sub(1).max(self.params.min_delay);
                self.dont_inc_delay = 3;
                return PlaybackScale::SpeedUp;
            }
            self.dont_dec_delay -= 1;
        }

        PlaybackScale::Normal
    }

    fn deviation_stddev(&self) -> f64 {
        let n = self.deviation_history.size();
        let mean: f64 = self.deviation_history.iter().sum::<f64>() / n as f64;
        let variance: f64 = self.deviation_history.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n as f64;
        variance.sqrt()
    }

    pub fn current_delay(&self) -> u32 {
        self.delay
    }

    pub fn average_delay(&self) -> f64 {
        self.delay_history.average_f64()
    }

    pub fn get_and_reset_lost_packet_count(&mut self) -> u32 {
        std::mem::take(&mut self.lost_count)
    }

    pub fn min_packet_count(&self) -> u32 {
        self.delay
    }

    pub fn set_min_packet_count(&mut self, count: u32) {
        self.delay = count.clamp(self.params.min_delay, self.params.max_delay);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::JitterDefaults;

    fn buf() -> JitterBuffer {
        JitterBuffer::new(JitterParams::from_defaults(960, JitterDefaults::for_frame_duration(60)))
    }

    #[test]
    fn in_order_packets_play_out_ok() {
        let mut jb = buf();
        for i in 0..5u32 {
            jb.handle_input(i * 960, &[i as u8], false, i as f64 * 0.06, true);
        }
        let mut ok_count = 0;
        for _ in 0..5 {
            let (status, _, payload) = jb.handle_output(0, true);
            if status == Status::Ok {
                ok_count += 1;
                assert!(payload.is_some());
            }
        }
        assert!(ok_count > 0);
    }

    #[test]
    fn missing_slot_reports_missing_without_neighbor() {
        let mut jb = buf();
        jb.handle_input(100 * 960, &[7], false, 0.0, true);
        let (status, _, _) = jb.handle_output(50, false);
        assert_eq!(status, Status::Missing);
    }

    #[test]
    fn neighbor_substitution_reports_replaced() {
        let mut jb = buf();
        jb.handle_input(0, &[1], false, 0.0, true);
        jb.handle_input(1920, &[2], false, 0.06, true);
        // Ask for the slot in between; no exact hit, but two non-EC
        // neighbors within one step radius should yield REPLACED.
        let (status, _, payload) = jb.handle_output(1, false);
        assert!(matches!(status, Status::Ok | Status::Replaced));
        assert!(payload.is_some());
    }

    #[test]
    fn ec_slot_never_overwrites_non_ec() {
        let mut jb = buf();
        jb.handle_input(0, &[1, 1, 1], false, 0.0, true);
        jb.handle_input(0, &[9, 9, 9], true, 0.01, true);
        let (status, _, payload) = jb.handle_output(0, false);
        assert_eq!(status, Status::Ok);
        assert_eq!(payload.unwrap().0, vec![1, 1, 1]);
    }

    #[test]
    fn reset_clears_all_state() {
        let mut jb = buf();
        jb.handle_input(0, &[1], false, 0.0, true);
        jb.reset();
        assert_eq!(jb.slots.len(), 0);
        assert_eq!(jb.history.len(), 0);
    }
}

//! Audio-path congestion controller (spec §4.6, §8 invariant 5).
//! Grounded on `original_source/.../CongestionControl.h/.cpp`.

use crate::buffers::HistoricBuffer;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConctlAct {
    None,
    Increase,
    Decrease,
}

#[derive(Debug, Clone, Copy)]
struct InflightSlot {
    seq: u32,
    size: usize,
    send_time: Instant,
    used: bool,
}

const INFLIGHT_SLOTS: usize = 100;
const RTT_HISTORY: usize = 100;
const INFLIGHT_HISTORY: usize = 30;
const EXPIRE_AFTER: Duration = Duration::from_secs(2);

/// Ring of in-flight packets, RTT/inflight-size histories, and the
/// 1 Hz bandwidth-control decision (spec §4.6).
pub struct AudioCongestionController {
    cwnd: usize,

    inflight: Vec<InflightSlot>,
    inflight_data_size: usize,

    rtt_history: HistoricBuffer<f64>,
    inflight_history: VecDeque<usize>,

    tmp_rtt_sum: f64,
    tmp_rtt_count: u32,

    loss_count: u32,
    total_sent: u32,
    last_action_time: Option<Instant>,
}

impl AudioCongestionController {
    pub fn new(cwnd: usize) -> Self {
        Self {
            cwnd,
            inflight: vec![
                InflightSlot { seq: 0, size: 0, send_time: Instant::now(), used: false };
                INFLIGHT_SLOTS
            ],
            inflight_data_size: 0,
            rtt_history: HistoricBuffer::new(RTT_HISTORY),
            inflight_history: VecDeque::with_capacity(INFLIGHT_HISTORY),
            tmp_rtt_sum: 0.0,
            tmp_rtt_count: 0,
            loss_count: 0,
            total_sent: 0,
            last_action_time: None,
        }
    }

    /// Records a send: claims the first free slot, or evicts the
    /// oldest in-use slot (counted as a loss) if the ring is full.
    pub fn packet_sent(&mut self, seq: u32, size: usize, now: Instant) {
        self.total_sent += 1;
        let free_idx = self.inflight.iter().position(|s| !s.used);
        let idx = match free_idx {
            Some(i) => i,
            None => {
                let oldest = self
                    .inflight
                    .iter()
                    .enumerate()
                    .min_by_key(|(_, s)| s.send_time)
                    .map(|(i, _)| i)
                    .unwrap();
                self.inflight_data_size = self.inflight_data_size.saturating_sub(self.inflight[oldest].size);
                self.loss_count += 1;
                oldest
            }
        };

        self.inflight[idx] = InflightSlot { seq, size, send_time: now, used: true };
        self.inflight_data_size += size;
    }

    pub fn packet_acknowledged(&mut self, seq: u32, now: Instant) {
        if let Some(slot) = self.inflight.iter_mut().find(|s| s.used && s.seq == seq) {
            let rtt = now.saturating_duration_since(slot.send_time).as_secs_f64();
            self.tmp_rtt_sum += rtt;
            self.tmp_rtt_count += 1;
            self.inflight_data_size = self.inflight_data_size.saturating_sub(slot.size);
            slot.used = false;
        }
    }

    pub fn packet_lost(&mut self, seq: u32) {
        if let Some(slot) = self.inflight.iter_mut().find(|s| s.used && s.seq == seq) {
            self.inflight_data_size = self.inflight_data_size.saturating_sub(slot.size);
            slot.used = false;
            self.loss_count += 1;
        }
    }

    /// 1 Hz tick: commit the RTT accumulator, expire stale in-flight
    /// entries as losses, and sample the current in-flight size.
    pub fn tick(&mut self, now: Instant) {
        if self.tmp_rtt_count > 0 {
            self.rtt_history.add(self.tmp_rtt_sum / self.tmp_rtt_count as f64);
            self.tmp_rtt_sum = 0.0;
            self.tmp_rtt_count = 0;
        }

        for slot in self.inflight.iter_mut() {
            if slot.used && now.saturating_duration_since(slot.send_time) > EXPIRE_AFTER {
                self.inflight_data_size = self.inflight_data_size.saturating_sub(slot.size);
                slot.used = false;
                self.loss_count += 1;
            }
        }

        if self.inflight_history.len() >= INFLIGHT_HISTORY {
            self.inflight_history.pop_front();
        }
        self.inflight_history.push_back(self.inflight_data_size);
    }

    /// 1 Hz bandwidth-control decision, rate-limited to once per
    /// second (spec §4.6).
    pub fn bandwidth_control_action(&mut self, now: Instant) -> ConctlAct {
        if let Some(last) = self.last_action_time {
            if now.saturating_duration_since(last) < Duration::from_secs(1) {
                return ConctlAct::None;
            }
        }

        if self.inflight_history.is_empty() {
            return ConctlAct::None;
        }

        let avg = self.inflight_history.iter().sum::<usize>() as f64 / self.inflight_history.len() as f64;
        let band = self.cwnd as f64 / 10.0;

        let action = if avg > self.cwnd as f64 + band {
            ConctlAct::Decrease
        } else if avg < self.cwnd as f64 - band {
            ConctlAct::Increase
        } else {
            ConctlAct::None
        };

        if action != ConctlAct::None {
            self.last_action_time = Some(now);
        }
        action
    }

    pub fn average_rtt(&self) -> f64 {
        self.rtt_history.non_zero_average()
    }

    pub fn inflight_data_size(&self) -> usize {
        self.inflight_data_size
    }

    pub fn send_loss_count(&self) -> u32 {
        self.loss_count
    }

    /// Fraction of sent packets counted as lost so far, feeding the
    /// bitrate/extra-EC policy without the caller having to track its
    /// own send/loss counters (spec §4.8).
    pub fn send_loss_rate(&self) -> f64 {
        self.loss_count as f64 / self.total_sent.max(1) as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inflight_tracks_sent_and_acked_bytes() {
        let mut cc = AudioCongestionController::new(1024);
        let t0 = Instant::now();
        cc.packet_sent(1, 200, t0);
        cc.packet_sent(2, 300, t0);
        assert_eq!(cc.inflight_data_size(), 500);
        cc.packet_acknowledged(1, t0 + Duration::from_millis(50));
        assert_eq!(cc.inflight_data_size(), 300);
    }

    #[test]
    fn inflight_never_goes_negative() {
        let mut cc = AudioCongestionController::new(1024);
        let t0 = Instant::now();
        cc.packet_acknowledged(999, t0);
        cc.packet_lost(999, );
        assert_eq!(cc.inflight_data_size(), 0);
    }

    #[test]
    fn full_ring_evicts_oldest_as_loss() {
        let mut cc = AudioCongestionController::new(1024);
        let t0 = Instant::now();
        for i in 0..INFLIGHT_SLOTS as u32 {
            cc.packet_sent(i, 10, t0 + Duration::from_millis(i as u64));
        }
        let before_loss = cc.send_loss_count();
        cc.packet_sent(9999, 10, t0 + Duration::from_secs(10));
        assert_eq!(cc.send_loss_count(), before_loss + 1);
    }

    #[test]
    fn send_loss_rate_tracks_losses_against_total_sent() {
        let mut cc = AudioCongestionController::new(1024);
        let t0 = Instant::now();
        for i in 0..INFLIGHT_SLOTS as u32 {
            cc.packet_sent(i, 10, t0 + Duration::from_millis(i as u64));
        }
        assert_eq!(cc.send_loss_rate(), 0.0);
        cc.packet_sent(9999, 10, t0 + Duration::from_secs(10));
        assert!(cc.send_loss_rate() > 0.0);
    }

    #[test]
    fn high_inflight_average_triggers_decrease() {
        let mut cc = AudioCongestionController::new(100);
        let t0 = Instant::now();
        cc.packet_sent(1, 500, t0);
        cc.tick(t0 + Duration::from_secs(1));
        let action = cc.bandwidth_control_action(t0 + Duration::from_secs(1));
        assert_eq!(action, ConctlAct::Decrease);
    }
}

//! Signal-bar indicator: a 4-sample moving average of a per-second
//! 1-4 score (spec §4.9). Grounded on
//! `original_source/.../VoIPController.cpp`'s signal-bar computation
//! (no standalone header; the state lives inline in the controller
//! there, split out here as its own small unit per the arena-index
//! guidance in §9).

use crate::buffers::HistoricBuffer;

const HISTORY_LEN: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SignalBarCount(pub u8);

/// Inputs sampled once per second to compute the score (spec §4.9).
#[derive(Debug, Clone, Copy)]
pub struct SignalBarInputs {
    pub is_reconnecting_or_waiting_for_acks: bool,
    pub current_endpoint_is_tcp_relay: bool,
    pub send_loss_rate: f64,
    pub jitter_late_count_average: f64,
}

pub struct SignalBarTracker {
    history: HistoricBuffer<f64>,
    last_reported: Option<SignalBarCount>,
}

impl SignalBarTracker {
    pub fn new() -> Self {
        Self { history: HistoricBuffer::new(HISTORY_LEN), last_reported: None }
    }

    /// Computes this second's raw 1-4 score (spec §4.9):
    /// reconnecting/waiting-for-acks floors it at 1; TCP-relay caps it
    /// at 3; send-loss and jitter-late thresholds cap it further.
    fn raw_score(inputs: &SignalBarInputs) -> u8 {
        if inputs.is_reconnecting_or_waiting_for_acks {
            return 1;
        }

        let mut score: u8 = 4;
        if inputs.current_endpoint_is_tcp_relay {
            score = score.min(3);
        }

        if inputs.send_loss_rate > 0.1 {
            score = score.min(1);
        } else if inputs.send_loss_rate > 0.0625 {
            score = score.min(2);
        } else if inputs.send_loss_rate > 0.025 {
            score = score.min(3);
        }

        if inputs.jitter_late_count_average > 0.2 {
            score = score.min(1);
        } else if inputs.jitter_late_count_average > 0.1 {
            score = score.min(2);
        }

        score
    }

    /// Runs the 1 Hz sample and returns `Some(count)` only when the
    /// smoothed value changes from the last reported one (so callers
    /// invoke their optional callback only on real transitions).
    pub fn tick(&mut self, inputs: SignalBarInputs) -> Option<SignalBarCount> {
        let raw = Self::raw_score(&inputs);
        self.history.add(raw as f64);

        let avg = self.history.average();
        let smoothed = avg.round().clamp(1.0, 4.0) as u8;
        let count = SignalBarCount(smoothed);

        if self.last_reported != Some(count) {
            self.last_reported = Some(count);
            Some(count)
        } else {
            None
        }
    }
}

impl Default for SignalBarTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn good_inputs() -> SignalBarInputs {
        SignalBarInputs {
            is_reconnecting_or_waiting_for_acks: false,
            current_endpoint_is_tcp_relay: false,
            send_loss_rate: 0.0,
            jitter_late_count_average: 0.0,
        }
    }

    #[test]
    fn reconnecting_floors_score_at_one() {
        let mut tracker = SignalBarTracker::new();
        let mut inputs = good_inputs();
        inputs.is_reconnecting_or_waiting_for_acks = true;
        let count = tracker.tick(inputs).unwrap();
        assert_eq!(count.0, 1);
    }

    #[test]
    fn good_conditions_report_full_bars() {
        let mut tracker = SignalBarTracker::new();
        for _ in 0..4 {
            tracker.tick(good_inputs());
        }
        assert_eq!(tracker.last_reported, Some(SignalBarCount(4)));
    }

    #[test]
    fn high_loss_caps_bars_at_one() {
        let mut tracker = SignalBarTracker::new();
        let mut inputs = good_inputs();
        inputs.send_loss_rate = 0.2;
        for _ in 0..4 {
            tracker.tick(inputs);
        }
        assert_eq!(tracker.last_reported, Some(SignalBarCount(1)));
    }

    #[test]
    fn unchanged_score_does_not_re_report() {
        let mut tracker = SignalBarTracker::new();
        for _ in 0..4 {
            tracker.tick(good_inputs());
        }
        assert!(tracker.tick(good_inputs()).is_none());
    }
}

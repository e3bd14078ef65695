//! Congestion control: the audio-path loss/inflight tracker (§4.6) and
//! the SCReAM delay-based video controller (§4.7).

pub mod audio;
pub mod scream;

pub use audio::{AudioCongestionController, ConctlAct};
pub use scream::ScreamController;

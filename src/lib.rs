//! VoIP media transport engine: wire protocol, endpoint selection,
//! jitter buffering, congestion control, and the call-state controller
//! that ties them together behind a FFI boundary.

pub mod error;
pub mod config;
pub mod buffers;
pub mod concurrency;
pub mod crypto;
pub mod wire;
pub mod jitter;
pub mod congestion;
pub mod reassembler;
pub mod endpoint;
pub mod socket;
pub mod controller;
pub mod group;
pub mod signal;
pub mod ffi;

uniffi::setup_scaffolding!("voip_core_engine");

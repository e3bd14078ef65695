//! The engine's single externally-visible error surface (spec §6, §7).

/// Reported through `GetLastError()`-equivalent calls and the
/// `state_changed(Failed(..))` callback. Local/recoverable failures
/// (bad decrypt, duplicate sequence, unknown packet type) are never
/// modeled here — the wire and jitter layers drop those silently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error, uniffi::Enum)]
pub enum VoipError {
    #[error("unknown error")]
    Unknown,
    #[error("incompatible protocol version")]
    Incompatible,
    #[error("timed out waiting for the peer")]
    Timeout,
    #[error("audio back-end failed to initialize")]
    AudioIo,
    #[error("proxy handshake failed")]
    Proxy,
}

/// Internal fallible-construction errors (socket setup, malformed
/// persistent state). These never cross into packet processing, which
/// follows the drop-silently policy of spec §7 instead.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed persistent state: {0}")]
    PersistentState(#[from] serde_json::Error),
    #[error("socks5 handshake failed: {0}")]
    Socks5(String),
    #[error(transparent)]
    Voip(#[from] VoipError),
}

pub type EngineResult<T> = Result<T, EngineError>;

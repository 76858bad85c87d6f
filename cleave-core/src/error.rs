//! Engine-level error taxonomy.
//!
//! Errors local to one packet or one channel stay contained there; only
//! source-level parse failures halt the whole engine.

use thiserror::Error;

/// Errors surfaced on the engine's public interface.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EngineError {
    /// Container could not be opened or exposes no usable streams
    #[error("failed to open container: {0}")]
    Open(String),

    /// Unrecoverable parse failure; all channels receive end-of-stream
    #[error("fatal parse error: {0}")]
    FatalParse(String),

    /// Packet or buffer allocation failed; aborts that single packet
    #[error("allocation of {0} bytes failed")]
    Allocation(usize),

    /// Stream id is not present in the catalog
    #[error("unknown stream id {0}")]
    UnknownStream(u32),

    /// Channel has no downstream consumer attached
    #[error("stream {0} is not connected")]
    NotConnected(u32),

    /// Operation requires a running producer thread
    #[error("engine is not running")]
    NotRunning,

    /// Start was requested with no downstream consumer attached anywhere
    #[error("no output channel is connected")]
    NoConsumers,
}

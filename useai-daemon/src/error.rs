//! Error taxonomy for the session engine and its callers.
//!
//! Errors are values here, not exceptions: nothing unwinds the stack out of
//! a tool handler. The daemon edge (see `server`) converts any `EngineError`
//! — or a caught panic — into a `ToolResponse` with `is_error: true`; no
//! error kind ever escapes as a non-2xx HTTP status.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("{0}")]
    InvalidArgument(String),

    #[error("No active session to end")]
    NoActiveSession,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("chain broken at record {broken_at}")]
    ChainBroken { broken_at: usize },

    #[error("signature invalid")]
    SignatureInvalid,

    #[error("port already in use")]
    PortInUse,

    #[error("rate limited, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

pub type EngineResult<T> = Result<T, EngineError>;

use thiserror::Error;

/// Recoverable failures surfaced to clients as `error` messages, plus the
/// internal kinds the orchestrator logs and absorbs.
#[derive(Debug, Error)]
pub enum SfuError {
    /// Malformed ID, oversized ID, bad JSON, unknown message shape.
    #[error("{0}")]
    Validation(String),

    /// Message references a room or peer that does not exist for this client.
    #[error("{0}")]
    NotFound(String),

    /// Per-client token bucket exhausted.
    #[error("Rate limit exceeded")]
    RateLimited,

    /// `maxRooms` or `maxPeersPerRoom` reached.
    #[error("{0}")]
    Capacity(String),

    /// Underlying ICE/DTLS transport failed.
    #[error("transport failure: {0}")]
    Transport(String),

    /// State Store RPC failed. Logged and absorbed; local cache serves on.
    #[error("state store unavailable: {0}")]
    Store(String),
}

impl SfuError {
    /// HTTP-style status code carried in the client-facing `error` message.
    pub fn code(&self) -> u16 {
        match self {
            SfuError::Validation(_) => 400,
            SfuError::NotFound(_) => 404,
            SfuError::RateLimited => 429,
            SfuError::Capacity(_) => 500,
            SfuError::Transport(_) | SfuError::Store(_) => 500,
        }
    }

    /// Whether the client connection survives this error.
    pub fn keeps_connection(&self) -> bool {
        !matches!(self, SfuError::Capacity(_))
    }
}

pub type SfuResult<T> = Result<T, SfuError>;

//! Error types for the alarm subsystem.

/// Top-level error type for alarm registration and dispatch.
#[derive(Debug, thiserror::Error)]
pub enum AlarmError {
    /// Modifiers that conflict with the firing policy (e.g. idle bypass on a periodic alarm).
    #[error("invalid modifier combination: {0}")]
    InvalidModifierCombination(String),

    /// Non-positive period for a periodic alarm.
    #[error("invalid period: {0}ms (must be > 0)")]
    InvalidPeriod(i64),

    /// Handler token cannot be mapped to a handler in the running build.
    #[error("unresolvable handler: {0}")]
    UnresolvableHandler(String),

    /// A handler name was registered twice.
    #[error("duplicate handler: {0}")]
    DuplicateHandler(String),

    /// Durable write or read did not complete.
    #[error("persistence failure: {0}")]
    PersistenceFailure(String),

    /// The wake facility rejected the request.
    #[error("wake registration failure: {0}")]
    WakeRegistrationFailure(String),

    /// Scheduling attempted before a successful `initialize`.
    #[error("alarm service is not initialized")]
    UninitializedService,

    /// Configuration error.
    #[error("config error: {0}")]
    Config(String),

    /// Host command with a missing or malformed payload.
    #[error("invalid command: {0}")]
    InvalidCommand(String),

    /// Channel send/receive error.
    #[error("channel error: {0}")]
    Channel(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encode/decode error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<rusqlite::Error> for AlarmError {
    fn from(e: rusqlite::Error) -> Self {
        Self::PersistenceFailure(e.to_string())
    }
}

/// Convenience result type.
pub type Result<T> = std::result::Result<T, AlarmError>;

use thiserror::Error;

/// Failure taxonomy shared by the registry, transport and orchestrator.
///
/// Client-facing variants (`NotFound` through `MalformedInput`) are reported
/// back to the originating caller and never affect other participants.
/// `Transient`/`StorageUnavailable` are retried locally first, and `Fatal`
/// is confined to the lobby that raised it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GameError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("lobby is full")]
    Full,

    #[error("game already started")]
    AlreadyStarted,

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("lobby expired")]
    Expired,

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("malformed input: {0}")]
    MalformedInput(String),

    #[error("transient failure: {0}")]
    Transient(String),

    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("fatal: {0}")]
    Fatal(String),
}

impl GameError {
    /// Stable machine-readable code sent alongside the message on the wire.
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::Conflict(_) => "conflict",
            Self::Full => "full",
            Self::AlreadyStarted => "already_started",
            Self::InvalidState(_) => "invalid_state",
            Self::Expired => "expired",
            Self::Unauthorized(_) => "unauthorized",
            Self::MalformedInput(_) => "malformed_input",
            Self::Transient(_) => "transient",
            Self::StorageUnavailable(_) => "storage_unavailable",
            Self::Fatal(_) => "fatal",
        }
    }

    /// Whether a bounded retry may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::StorageUnavailable(_))
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    pub fn invalid_state(why: impl Into<String>) -> Self {
        Self::InvalidState(why.into())
    }

    pub fn conflict(why: impl Into<String>) -> Self {
        Self::Conflict(why.into())
    }
}

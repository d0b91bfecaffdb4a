use std::time::Duration;

use relay_core::errors::TransportError;
use relay_core::ids::SessionId;

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("agent not found: {0}")]
    NotFound(String),

    #[error("expected an announce envelope, got {0}")]
    NotAnAnnounce(&'static str),
}

/// Why a dispatched request produced no result.
#[derive(Clone, Debug, thiserror::Error)]
pub enum DispatchError {
    /// The agent answered with an `error` envelope.
    #[error("{0}")]
    AgentError(String),

    #[error("agent unavailable: {0}")]
    Unavailable(String),

    #[error("timed out after {}s", .0.as_secs_f64())]
    Timeout(Duration),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl DispatchError {
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::AgentError(_) => "agent_error",
            Self::Unavailable(_) => "agent_unavailable",
            Self::Timeout(_) => "timeout",
            Self::Transport(_) => "transport",
        }
    }

    /// Timeouts and transport failures look the same to the caller: nothing
    /// came back in time.
    pub fn is_timeout_like(&self) -> bool {
        matches!(self, Self::Timeout(_) | Self::Transport(_))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("session not found: {0}")]
    NotFound(SessionId),

    #[error("session {0} is already running")]
    AlreadyStarted(SessionId),
}

impl SessionError {
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "session_not_found",
            Self::AlreadyStarted(_) => "session_already_started",
        }
    }
}

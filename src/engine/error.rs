use thiserror::Error;
use ulid::Ulid;

use crate::model::ConflictReason;

/// Errors surfaced by the session store. `Display` is the client-facing
/// message; `code()` is the stable application code sent alongside it.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The message stays generic. `with` and `reason` are for logs only.
    #[error("Session time conflict detected")]
    Conflict { with: Ulid, reason: ConflictReason },

    #[error("Session not found")]
    SessionNotFound(Ulid),

    #[error("Professional not found")]
    ProfessionalNotFound(Ulid),

    #[error("Local not found")]
    LocalNotFound(Ulid),

    #[error("Invalid session time range")]
    InvalidTimeRange,

    #[error("Registered count exceeds capacity")]
    OverCapacity { registered: u32, capacity: u32 },

    #[error("Id already exists: {0}")]
    AlreadyExists(Ulid),

    #[error("Still referenced by sessions: {0}")]
    InUse(Ulid),

    #[error("Limit exceeded: {0}")]
    LimitExceeded(&'static str),

    #[error("Database error")]
    Wal(String),
}

impl EngineError {
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::Conflict { .. } => "CONFLICT_ERROR_001",
            EngineError::SessionNotFound(_) => "SESSION_ERROR_001",
            EngineError::ProfessionalNotFound(_) => "PROFESSIONAL_ERROR_001",
            EngineError::LocalNotFound(_) => "LOCAL_ERROR_001",
            EngineError::InvalidTimeRange => "REQUEST_ERROR_001",
            EngineError::OverCapacity { .. } => "REQUEST_ERROR_002",
            EngineError::AlreadyExists(_) => "REQUEST_ERROR_003",
            EngineError::InUse(_) => "REQUEST_ERROR_004",
            EngineError::LimitExceeded(_) => "LIMIT_ERROR_001",
            EngineError::Wal(_) => "INTERNAL_SERVER_ERROR_004",
        }
    }
}

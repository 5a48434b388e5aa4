//! Typed error taxonomy for the issue execution engine.
//!
//! Every boundary (adapter, engine operation, stream consumer) returns one
//! of these kinds; the HTTP layer maps them onto status codes and the
//! response envelope.

use thiserror::Error;

/// Errors surfaced by engine operations and adapters.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("{0}")]
    Validation(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("{0}")]
    Forbidden(String),

    #[error("an execution is already running for issue {issue_id}; queue or cancel")]
    Busy { issue_id: String },

    #[error("engine '{engine}' is not available: {reason}")]
    EngineUnavailable { engine: String, reason: String },

    #[error("engine call '{call}' timed out after {seconds}s")]
    EngineTimeout { call: String, seconds: u64 },

    #[error("session error: {0}")]
    Session(String),

    #[error("failed to spawn engine process: {0}")]
    SpawnFailed(#[source] std::io::Error),

    #[error("stream error: {0}")]
    Stream(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl EngineError {
    /// HTTP-like status code derived from the error kind.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::Validation(_) => 400,
            Self::Forbidden(_) => 403,
            Self::NotFound(_) => 404,
            Self::Busy { .. } => 409,
            Self::EngineUnavailable { .. } => 422,
            Self::EngineTimeout { .. } => 504,
            Self::Session(_) => 409,
            Self::SpawnFailed(_) | Self::Stream(_) | Self::Internal(_) => 500,
        }
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn busy_error_carries_issue_id_and_hint() {
        let err = EngineError::Busy {
            issue_id: "iss_1".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("iss_1"));
        assert!(msg.contains("queue or cancel"));
        assert_eq!(err.status_code(), 409);
    }

    #[test]
    fn status_codes_follow_kind() {
        assert_eq!(EngineError::validation("bad").status_code(), 400);
        assert_eq!(
            EngineError::Forbidden("outside workspace".into()).status_code(),
            403
        );
        assert_eq!(EngineError::not_found("issue x").status_code(), 404);
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "claude missing");
        assert_eq!(EngineError::SpawnFailed(io).status_code(), 500);
    }

    #[test]
    fn spawn_failed_preserves_source() {
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let err = EngineError::SpawnFailed(io);
        match &err {
            EngineError::SpawnFailed(e) => {
                assert_eq!(e.kind(), std::io::ErrorKind::PermissionDenied)
            }
            _ => panic!("expected SpawnFailed"),
        }
    }

    #[test]
    fn internal_converts_from_anyhow() {
        let err: EngineError = anyhow::anyhow!("db exploded").into();
        assert!(matches!(err, EngineError::Internal(_)));
        assert_eq!(err.status_code(), 500);
    }
}

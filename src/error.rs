//! Error types for escrow-bridge

use thiserror::Error;

#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("Not found: {0}")]
    NotFound(String),

    /// Rejected at ingress; the only error kind surfaced to callers.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Chain observer unavailable: {0}")]
    Upstream(String),

    #[error("Request timeout: {0}")]
    Timeout(String),

    #[error("Database error: {0}")]
    Database(#[from] diesel::result::Error),

    #[error("Connection pool error: {0}")]
    Pool(#[from] diesel::r2d2::PoolError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl BridgeError {
    /// Failures that leave state untouched and are retried on the next cycle.
    pub fn is_transient(&self) -> bool {
        matches!(self, BridgeError::Upstream(_) | BridgeError::Timeout(_))
    }

    /// True when the error was raised by a unique or primary key constraint.
    pub fn is_unique_violation(&self) -> bool {
        matches!(
            self,
            BridgeError::Database(diesel::result::Error::DatabaseError(
                diesel::result::DatabaseErrorKind::UniqueViolation,
                _
            ))
        )
    }
}

impl From<reqwest::Error> for BridgeError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            BridgeError::Timeout(e.to_string())
        } else {
            BridgeError::Upstream(e.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(BridgeError::Upstream("refused".into()).is_transient());
        assert!(BridgeError::Timeout("5s".into()).is_transient());
        assert!(!BridgeError::InvalidInput("bad".into()).is_transient());
        assert!(!BridgeError::Internal("boom".into()).is_transient());
    }

    #[test]
    fn test_unique_violation_detection() {
        let err = BridgeError::Database(diesel::result::Error::DatabaseError(
            diesel::result::DatabaseErrorKind::UniqueViolation,
            Box::new("UNIQUE constraint failed".to_string()),
        ));
        assert!(err.is_unique_violation());
        assert!(!BridgeError::Database(diesel::result::Error::NotFound).is_unique_violation());
    }
}

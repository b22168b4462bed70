//! Error types for the flag coordinator.

use uuid::Uuid;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Flag error: {0}")]
    Flag(#[from] FlagError),

    #[error("Worker error: {0}")]
    Worker(#[from] WorkerError),

    #[error("Event bus error: {0}")]
    Bus(#[from] BusError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Storage errors. Any of these means the flag table could not be read or
/// written; callers decide whether to retry.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Flag lifecycle errors.
#[derive(Debug, thiserror::Error)]
pub enum FlagError {
    /// Another worker owns the flag, or it is already terminal or expired.
    #[error("Flag {id} is no longer claimable")]
    ClaimConflict { id: Uuid },

    #[error("Flag {id} not found")]
    NotFound { id: Uuid },

    #[error("Unknown flag type: {0}")]
    UnknownType(String),

    #[error("Unknown flag status: {0}")]
    UnknownStatus(String),
}

impl FlagError {
    /// Conflicts and missing flags are expected under contention and are
    /// reported as `false` by the boolean coordinator API.
    pub fn is_benign(&self) -> bool {
        matches!(self, Self::ClaimConflict { .. } | Self::NotFound { .. })
    }
}

/// Errors raised by a worker's domain step.
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("Execution of flag {id} failed: {reason}")]
    Execution { id: Uuid, reason: String },

    #[error("Worker {agent} panicked while executing flag {id}")]
    Panicked { agent: String, id: Uuid },
}

impl WorkerError {
    /// Convenience constructor for domain workers.
    pub fn execution(id: Uuid, reason: impl Into<String>) -> Self {
        Self::Execution {
            id,
            reason: reason.into(),
        }
    }
}

/// Event bus errors. Handler failures are isolated and only logged.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("Subscriber {subscriber} failed on {topic}: {reason}")]
    CallbackFailed {
        subscriber: String,
        topic: String,
        reason: String,
    },

    #[error("Event bus is shut down")]
    Closed,
}

/// Result type alias for the crate.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn benign_flag_errors() {
        let id = Uuid::new_v4();
        assert!(FlagError::ClaimConflict { id }.is_benign());
        assert!(FlagError::NotFound { id }.is_benign());
        assert!(!FlagError::UnknownType("nope".into()).is_benign());
    }

    #[test]
    fn error_messages_carry_context() {
        let err: Error = DatabaseError::Query("create_flag: disk I/O error".into()).into();
        assert_eq!(
            err.to_string(),
            "Database error: Query failed: create_flag: disk I/O error"
        );

        let id = Uuid::nil();
        let err: Error = FlagError::ClaimConflict { id }.into();
        assert_eq!(
            err.to_string(),
            format!("Flag error: Flag {id} is no longer claimable")
        );
    }
}

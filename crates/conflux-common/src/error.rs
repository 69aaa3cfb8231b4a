//! Error types for conflux

use thiserror::Error;

/// Result type alias for conflux operations
pub type Result<T> = std::result::Result<T, ConfluxError>;

/// Unified error type for all conflux operations
#[derive(Error, Debug, Clone)]
pub enum ConfluxError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Query error: {0}")]
    Query(String),

    /// A record failed model-level coercion, defaulting or hooks.
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Internal error: {0}")]
    Internal(String),

    // PostgreSQL-specific error types for better error handling

    /// Unique or exclusion constraint violation (SQLSTATE 23505, 23P01)
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Foreign key constraint violation (SQLSTATE 23503)
    #[error("Foreign key constraint violation: {0}")]
    ForeignKey(String),

    /// Not-null or check constraint violation (SQLSTATE 23502, 23514)
    #[error("Constraint violation: {0}")]
    Constraint(String),

    /// Deadlock detected (SQLSTATE 40P01) - retryable
    #[error("Deadlock detected: {0}")]
    Deadlock(String),

    /// Connection timeout - retryable
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Transient error that may succeed on retry
    #[error("Transient error: {0}")]
    Transient(String),

    // Bulk upsert input taxonomy

    /// The caller handed over something that is not a record sequence.
    /// Raised before any connection is acquired.
    #[error("Input rejected: {0}")]
    InputRejected(String),

    /// The record source itself failed (producer error, malformed element).
    #[error("Source error: {0}")]
    Source(String),

    /// Per-call options do not fit the target table.
    #[error("Invalid options: {0}")]
    InvalidOptions(String),
}

impl ConfluxError {
    /// Builds a source error from anything printable, for stream producers.
    pub fn source(err: impl std::fmt::Display) -> Self {
        ConfluxError::Source(err.to_string())
    }

    /// Returns true if this error is potentially retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ConfluxError::Deadlock(_) | ConfluxError::Timeout(_) | ConfluxError::Transient(_)
        )
    }

    /// Returns true if this is a constraint violation error
    pub fn is_constraint_violation(&self) -> bool {
        matches!(
            self,
            ConfluxError::Conflict(_) | ConfluxError::ForeignKey(_) | ConfluxError::Constraint(_)
        )
    }

    /// Returns true if the error originated from the caller's input rather
    /// than from the database.
    pub fn is_upstream(&self) -> bool {
        matches!(
            self,
            ConfluxError::InputRejected(_) | ConfluxError::Source(_) | ConfluxError::Validation(_)
        )
    }
}

impl From<serde_json::Error> for ConfluxError {
    fn from(err: serde_json::Error) -> Self {
        ConfluxError::Serialization(err.to_string())
    }
}

// PostgreSQL-specific error conversions (when postgres-errors feature is enabled)
#[cfg(feature = "postgres-errors")]
impl From<sqlx::Error> for ConfluxError {
    fn from(err: sqlx::Error) -> Self {
        use sqlx::Error;
        match &err {
            Error::Configuration(_) => ConfluxError::Connection(err.to_string()),
            Error::Database(db_err) => {
                // Classify based on PostgreSQL SQLSTATE codes
                // See: https://www.postgresql.org/docs/current/errcodes-appendix.html
                if let Some(code) = db_err.code() {
                    let code_str: &str = &code;
                    match code_str {
                        "23505" => return ConfluxError::Conflict(err.to_string()),
                        "23503" => return ConfluxError::ForeignKey(err.to_string()),
                        "23502" => return ConfluxError::Constraint(err.to_string()),
                        "23514" => return ConfluxError::Constraint(err.to_string()),
                        "23P01" => return ConfluxError::Conflict(err.to_string()),
                        // ON CONFLICT DO UPDATE command cannot affect row a second time
                        "21000" => return ConfluxError::Conflict(err.to_string()),
                        "40P01" => return ConfluxError::Deadlock(err.to_string()),
                        "40001" => return ConfluxError::Transient(err.to_string()),
                        code if code.starts_with("40") => {
                            return ConfluxError::Transient(err.to_string())
                        }
                        code if code.starts_with("08") => {
                            return ConfluxError::Connection(err.to_string())
                        }
                        "57P01" | "57P02" | "57P03" => {
                            return ConfluxError::Transient(err.to_string())
                        }
                        "57014" => return ConfluxError::Timeout(err.to_string()),
                        _ => {}
                    }
                }
                ConfluxError::Database(err.to_string())
            }
            Error::Io(_) => ConfluxError::Connection(err.to_string()),
            Error::Tls(_) => ConfluxError::Connection(err.to_string()),
            Error::Protocol(_) => ConfluxError::Connection(err.to_string()),
            Error::RowNotFound => ConfluxError::Query("Row not found".to_string()),
            Error::TypeNotFound { .. } => ConfluxError::Deserialization(err.to_string()),
            Error::ColumnIndexOutOfBounds { .. } => ConfluxError::Query(err.to_string()),
            Error::ColumnNotFound(_) => ConfluxError::Query(err.to_string()),
            Error::ColumnDecode { .. } => ConfluxError::Deserialization(err.to_string()),
            Error::Decode(_) => ConfluxError::Deserialization(err.to_string()),
            Error::PoolTimedOut => ConfluxError::Timeout("Connection pool timed out".to_string()),
            Error::PoolClosed => ConfluxError::Connection("Connection pool closed".to_string()),
            Error::WorkerCrashed => ConfluxError::Internal("Worker thread crashed".to_string()),
            _ => ConfluxError::Database(err.to_string()),
        }
    }
}

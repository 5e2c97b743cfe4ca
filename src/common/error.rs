//! Error types for the outbox runtime
//!
//! One taxonomy shared by both backends, with error classification for
//! intelligent retry and restart decisions.

use thiserror::Error;

/// Error categories for logging and alerting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Storage engine errors (connection, query, insert)
    Storage,
    /// Replication / change-stream protocol errors
    Protocol,
    /// User publish callback errors
    Publish,
    /// Configuration errors (invalid settings)
    Configuration,
    /// Network errors (connection, timeout)
    Network,
    /// Lifecycle misuse (API called in the wrong state)
    Lifecycle,
    /// Other/unknown errors
    Other,
}

/// Errors surfaced by the outbox runtime.
#[derive(Error, Debug)]
pub enum HermesError {
    /// The replication slot / partition is held by another live consumer.
    #[error("consumer already taken: {0}")]
    ConsumerAlreadyTaken(String),

    /// An API was called before `start` established a connection.
    #[error("consumer not started")]
    NotStarted,

    /// `send` was called but no auxiliary consumer was configured.
    #[error("auxiliary outbox not configured")]
    AuxiliaryNotConfigured,

    /// PostgreSQL query error
    #[cfg(feature = "postgres")]
    #[error("PostgreSQL error: {0}")]
    Postgres(#[from] tokio_postgres::Error),

    /// MongoDB driver error
    #[cfg(feature = "mongodb")]
    #[error("MongoDB error: {0}")]
    Mongo(#[from] mongodb::error::Error),

    /// Insert/update/select failure not covered by a driver error
    #[error("storage error: {0}")]
    Storage(String),

    /// The user publish callback returned an error.
    #[error("publish failed: {0}")]
    Publish(#[source] anyhow::Error),

    /// Malformed replication frame or change event; fatal to the stream session.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Upstream retention advanced past the stored resume token.
    #[error("position lost: {0}")]
    PositionLost(String),

    /// Storage engine version does not support the required stream semantics.
    #[error("not supported version: {0}")]
    NotSupportedVersion(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Timeout error
    #[error("timeout: {0}")]
    Timeout(String),

    /// Connection closed by the peer
    #[error("connection closed")]
    ConnectionClosed,

    /// Lifecycle misuse
    #[error("invalid state: {0}")]
    InvalidState(String),
}

impl HermesError {
    /// Create a new storage error
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    /// Create a new protocol error
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    /// Create a new configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a timeout error
    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }

    /// Create a publish error from the user callback's error
    pub fn publish(err: anyhow::Error) -> Self {
        Self::Publish(err)
    }

    /// Create a consumer-already-taken error
    pub fn already_taken(slot: impl Into<String>) -> Self {
        Self::ConsumerAlreadyTaken(slot.into())
    }

    /// Create a position-lost error
    pub fn position_lost(msg: impl Into<String>) -> Self {
        Self::PositionLost(msg.into())
    }

    /// Check if this error is retriable.
    ///
    /// Returns true for transient errors where restarting the stream session
    /// from the last acknowledged position may succeed.
    pub fn is_retriable(&self) -> bool {
        match self {
            Self::ConnectionClosed => true,
            Self::Timeout(_) => true,
            Self::Storage(_) => true,

            // Protocol failures are fatal to the session but the session
            // itself restarts from the last acked position.
            Self::Protocol(_) => true,

            #[cfg(feature = "postgres")]
            Self::Postgres(e) => is_transient_pg_error(e),

            #[cfg(feature = "mongodb")]
            Self::Mongo(e) => is_transient_mongo_error(e),

            Self::Io(e) => {
                use std::io::ErrorKind;
                matches!(
                    e.kind(),
                    ErrorKind::ConnectionReset
                        | ErrorKind::ConnectionAborted
                        | ErrorKind::BrokenPipe
                        | ErrorKind::TimedOut
                        | ErrorKind::UnexpectedEof
                        | ErrorKind::Interrupted
                )
            }

            Self::ConsumerAlreadyTaken(_)
            | Self::NotStarted
            | Self::AuxiliaryNotConfigured
            | Self::Publish(_)
            | Self::PositionLost(_)
            | Self::NotSupportedVersion(_)
            | Self::Config(_)
            | Self::Json(_)
            | Self::InvalidState(_) => false,
        }
    }

    /// Check if this error must stop the consumer entirely (no restart).
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::ConsumerAlreadyTaken(_) | Self::PositionLost(_) | Self::NotSupportedVersion(_)
        )
    }

    /// Get the error category for logging and alerting.
    pub fn category(&self) -> ErrorCategory {
        match self {
            #[cfg(feature = "postgres")]
            Self::Postgres(_) => ErrorCategory::Storage,
            #[cfg(feature = "mongodb")]
            Self::Mongo(_) => ErrorCategory::Storage,
            Self::Storage(_) => ErrorCategory::Storage,
            Self::Protocol(_) | Self::PositionLost(_) => ErrorCategory::Protocol,
            Self::Publish(_) => ErrorCategory::Publish,
            Self::Config(_) | Self::NotSupportedVersion(_) | Self::AuxiliaryNotConfigured => {
                ErrorCategory::Configuration
            }
            Self::Timeout(_) | Self::ConnectionClosed | Self::Io(_) => ErrorCategory::Network,
            Self::ConsumerAlreadyTaken(_) | Self::NotStarted | Self::InvalidState(_) => {
                ErrorCategory::Lifecycle
            }
            Self::Json(_) => ErrorCategory::Other,
        }
    }
}

/// Check if a PostgreSQL error is transient.
#[cfg(feature = "postgres")]
fn is_transient_pg_error(e: &tokio_postgres::Error) -> bool {
    if let Some(db_error) = e.as_db_error() {
        let code = db_error.code().code();
        // Connection exception class (08xxx)
        if code.starts_with("08") {
            return true;
        }
        // Transaction rollback class (40xxx)
        if code.starts_with("40") {
            return true;
        }
        // Insufficient resources class (53xxx)
        if code.starts_with("53") {
            return true;
        }
        // Operator intervention class (57xxx) - except query_canceled
        if code.starts_with("57") && code != "57014" {
            return true;
        }
        return false;
    }

    let msg = e.to_string().to_lowercase();
    msg.contains("connection") || msg.contains("closed") || msg.contains("timeout")
}

/// Check if a MongoDB error is transient.
#[cfg(feature = "mongodb")]
fn is_transient_mongo_error(e: &mongodb::error::Error) -> bool {
    use mongodb::error::ErrorKind;

    // Primary stepdowns and shutdowns resume cleanly from the stored token.
    const RESUMABLE_CODES: &[i32] = &[6, 7, 89, 91, 189, 9001, 10107, 11600, 11602, 13435, 13436];

    match e.kind.as_ref() {
        ErrorKind::Io(_) => true,
        ErrorKind::ConnectionPoolCleared { .. } => true,
        ErrorKind::ServerSelection { .. } => true,
        // ChangeStreamHistoryLost (286) is mapped to PositionLost upstream.
        ErrorKind::Command(c) => c.code != 286 && RESUMABLE_CODES.contains(&c.code),
        _ => e.contains_label("ResumableChangeStreamError")
            || e.contains_label("RetryableWriteError"),
    }
}

/// Result type for outbox operations
pub type Result<T> = std::result::Result<T, HermesError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = HermesError::already_taken("hermes_orders_default");
        assert!(err.to_string().contains("already taken"));
        assert!(err.to_string().contains("hermes_orders_default"));
    }

    #[test]
    fn test_error_is_retriable() {
        assert!(HermesError::ConnectionClosed.is_retriable());
        assert!(HermesError::timeout("10s").is_retriable());
        assert!(HermesError::storage("insert failed").is_retriable());
        assert!(HermesError::protocol("unknown frame").is_retriable());

        assert!(!HermesError::NotStarted.is_retriable());
        assert!(!HermesError::AuxiliaryNotConfigured.is_retriable());
        assert!(!HermesError::config("bad option").is_retriable());
        assert!(!HermesError::position_lost("token expired").is_retriable());
    }

    #[test]
    fn test_error_is_fatal() {
        assert!(HermesError::already_taken("slot").is_fatal());
        assert!(HermesError::position_lost("gone").is_fatal());
        assert!(HermesError::NotSupportedVersion("3.6".into()).is_fatal());

        assert!(!HermesError::ConnectionClosed.is_fatal());
        assert!(!HermesError::protocol("bad byte").is_fatal());
    }

    #[test]
    fn test_error_category() {
        assert_eq!(
            HermesError::protocol("x").category(),
            ErrorCategory::Protocol
        );
        assert_eq!(HermesError::storage("x").category(), ErrorCategory::Storage);
        assert_eq!(
            HermesError::config("x").category(),
            ErrorCategory::Configuration
        );
        assert_eq!(
            HermesError::ConnectionClosed.category(),
            ErrorCategory::Network
        );
        assert_eq!(HermesError::NotStarted.category(), ErrorCategory::Lifecycle);
    }
}

//! Error types for docbridge operations.
//!
//! Errors fall into two groups. Precondition failures (`Config`,
//! `NotConnected`, `Coercion`) always reach the caller. Store failures
//! (`Store`) are what the public verbs fold into their empty sentinels.

use thiserror::Error;

/// Result type for docbridge operations.
pub type DocbridgeResult<T> = Result<T, DocbridgeError>;

/// Result type for raw store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors surfaced by the access layer.
#[derive(Error, Debug)]
pub enum DocbridgeError {
    /// No database could be resolved, or the configuration is invalid.
    #[error("configuration error: {0}")]
    Config(String),

    /// An operation needed a connected manager.
    #[error("not connected: {0}")]
    NotConnected(String),

    /// A field matched a naming convention but held a malformed value.
    #[error("cannot coerce field '{field}': {message}")]
    Coercion {
        /// The offending field name.
        field: String,
        /// What was wrong with the value.
        message: String,
    },

    /// The underlying store failed.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Errors raised by the store behind a [`crate::driver::DatabaseBackend`].
#[derive(Error, Debug)]
pub enum StoreError {
    /// MongoDB driver error.
    #[error("mongodb error: {0}")]
    Driver(#[from] mongodb::error::Error),

    /// BSON serialization error.
    #[error("bson error: {0}")]
    Bson(#[from] bson::ser::Error),

    /// BSON deserialization error.
    #[error("bson deserialization error: {0}")]
    BsonDe(#[from] bson::de::Error),

    /// Establishing the session failed.
    #[error("connection error: {0}")]
    Connection(String),

    /// A unique index rejected a write.
    #[error("duplicate key on index '{index}': {key}")]
    DuplicateKey {
        /// Index name.
        index: String,
        /// Rendered key value.
        key: String,
    },

    /// The backend rejected the shape of a command.
    #[error("invalid command: {0}")]
    InvalidCommand(String),

    /// The backend does not support the requested operation.
    #[error("unsupported operation: {0}")]
    Unsupported(String),

    /// Internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl DocbridgeError {
    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Create a not-connected error.
    pub fn not_connected(message: impl Into<String>) -> Self {
        Self::NotConnected(message.into())
    }

    /// Create a coercion error for `field`.
    pub fn coercion(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Coercion {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Check if this is a configuration error.
    pub fn is_config(&self) -> bool {
        matches!(self, Self::Config(_))
    }

    /// Check if this is a not-connected error.
    pub fn is_not_connected(&self) -> bool {
        matches!(self, Self::NotConnected(_))
    }

    /// Check if this is a coercion error.
    pub fn is_coercion(&self) -> bool {
        matches!(self, Self::Coercion { .. })
    }

    /// Check if this came from the store.
    pub fn is_store(&self) -> bool {
        matches!(self, Self::Store(_))
    }

    /// The field a coercion error refers to.
    pub fn field(&self) -> Option<&str> {
        match self {
            Self::Coercion { field, .. } => Some(field),
            _ => None,
        }
    }
}

impl StoreError {
    /// Create a connection error.
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection(message.into())
    }

    /// Create an invalid command error.
    pub fn invalid_command(message: impl Into<String>) -> Self {
        Self::InvalidCommand(message.into())
    }

    /// Create an unsupported operation error.
    pub fn unsupported(message: impl Into<String>) -> Self {
        Self::Unsupported(message.into())
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Check if this is a connection error.
    pub fn is_connection_error(&self) -> bool {
        matches!(self, Self::Connection(_))
    }

    /// Check if a unique index rejected the write.
    pub fn is_duplicate_key(&self) -> bool {
        match self {
            Self::DuplicateKey { .. } => true,
            Self::Driver(e) => e.to_string().contains("duplicate key"),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let err = DocbridgeError::config("no database");
        assert!(err.is_config());

        let err = DocbridgeError::not_connected("closed");
        assert!(err.is_not_connected());

        let err = DocbridgeError::coercion("owner_id", "not hex");
        assert!(err.is_coercion());
        assert_eq!(err.field(), Some("owner_id"));

        let err: DocbridgeError = StoreError::connection("refused").into();
        assert!(err.is_store());
    }

    #[test]
    fn test_error_display() {
        let err = DocbridgeError::config("test error");
        assert_eq!(err.to_string(), "configuration error: test error");

        let err = DocbridgeError::coercion("user_id", "expected a 24-character hex string");
        assert_eq!(
            err.to_string(),
            "cannot coerce field 'user_id': expected a 24-character hex string"
        );

        let err: DocbridgeError = StoreError::connection("refused").into();
        assert_eq!(err.to_string(), "connection error: refused");
    }

    #[test]
    fn test_duplicate_key() {
        let err = StoreError::DuplicateKey {
            index: "code_1".into(),
            key: "\"A-1\"".into(),
        };
        assert!(err.is_duplicate_key());
        assert!(!StoreError::internal("boom").is_duplicate_key());
    }
}

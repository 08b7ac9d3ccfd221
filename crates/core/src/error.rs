//! Error types for the directory store
//!
//! This module defines the error taxonomy used throughout the system.
//! We use `thiserror` for automatic `Display` and `Error` trait implementations.
//!
//! Two outcomes of an index scan are deliberately NOT errors: an attribute
//! without a usable index and a scan that hit the size guard. Both are
//! reported as status flags on the candidate set and recovered locally by
//! falling back to full evaluation.

use crate::types::EntryId;
use thiserror::Error;

/// Result type alias for directory store operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for the directory store
#[derive(Debug, Error)]
pub enum Error {
    /// Null, malformed or oversized input
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    /// No entry with the given DN or EntryID
    #[error("Entry not found: {0}")]
    EntryNotFound(String),

    /// An entry with the same DN already exists
    #[error("Entry already exists: {0}")]
    EntryExists(String),

    /// The parent DN of a new entry does not resolve
    #[error("Parent not found for entry {0}")]
    ParentNotFound(String),

    /// Scoped-uniqueness or unique-index conflict on a non-DN attribute
    #[error("Constraint violation on attribute '{attribute}': {reason}")]
    ConstraintViolation {
        /// Attribute whose constraint was violated
        attribute: String,
        /// Human-readable reason
        reason: String,
    },

    /// Operation requires a leaf entry but the entry has children
    #[error("Operation not allowed on non-leaf entry {0}")]
    NotAllowedOnNonLeaf(String),

    /// Raw index outcome: create against an existing unique key
    ///
    /// Callers map this to `EntryExists` (DN index) or
    /// `ConstraintViolation` (attribute index).
    #[error("Key already exists in index '{index}'")]
    KeyExists {
        /// Index (table) name
        index: String,
    },

    /// Raw index outcome: get/delete of an absent key
    #[error("Key not found in index '{index}'")]
    KeyNotFound {
        /// Index (table) name
        index: String,
    },

    /// Blob encoding/decoding failure
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Fatal failure of the underlying key-value engine
    #[error("Storage engine error: {0}")]
    StorageEngine(String),

    /// Operation attempted on a committed or aborted transaction
    #[error("Transaction is not active")]
    TransactionNotActive,
}

impl Error {
    /// Shorthand for an entry-not-found error keyed by EntryID
    pub fn entry_not_found_id(id: EntryId) -> Self {
        Error::EntryNotFound(format!("id={}", id))
    }

    /// Whether the error is fatal to the enclosing transaction
    ///
    /// Fatal errors are logged with full context before propagating;
    /// the others are typed operation failures surfaced to the caller.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::StorageEngine(_) | Error::Serialization(_) | Error::TransactionNotActive
        )
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_invalid_parameter() {
        let err = Error::InvalidParameter("empty DN".to_string());
        let msg = err.to_string();
        assert!(msg.contains("Invalid parameter"));
        assert!(msg.contains("empty DN"));
    }

    #[test]
    fn test_error_display_constraint_violation() {
        let err = Error::ConstraintViolation {
            attribute: "uid".to_string(),
            reason: "value already in use".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("uid"));
        assert!(msg.contains("value already in use"));
    }

    #[test]
    fn test_error_display_key_exists() {
        let err = Error::KeyExists {
            index: "dn2id".to_string(),
        };
        assert!(err.to_string().contains("dn2id"));
    }

    #[test]
    fn test_entry_not_found_id() {
        let err = Error::entry_not_found_id(EntryId::new(42));
        assert!(matches!(err, Error::EntryNotFound(ref s) if s == "id=42"));
    }

    #[test]
    fn test_is_fatal() {
        assert!(Error::StorageEngine("io".to_string()).is_fatal());
        assert!(Error::Serialization("bad".to_string()).is_fatal());
        assert!(!Error::EntryExists("cn=a".to_string()).is_fatal());
        assert!(!Error::ParentNotFound("cn=a".to_string()).is_fatal());
    }

    #[test]
    fn test_error_from_bincode() {
        let invalid_data = vec![0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF];
        let result: Result<String> = bincode::deserialize(&invalid_data).map_err(|e| e.into());
        assert!(matches!(result, Err(Error::Serialization(_))));
    }
}

//! Store Error Types
//!
//! This module defines error types for document store operations, providing
//! clear error handling for transport failures and malformed documents.

use crate::db::{Collection, StoreOperation};
use thiserror::Error;

/// Document store errors
///
/// Covers all error cases an adapter can surface. The tree engine maps these
/// into `TreeError` with node and walk context attached.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Transport or IO failure talking to the store
    #[error("Store unavailable during {operation}: {reason}")]
    Unavailable {
        operation: StoreOperation,
        reason: String,
    },

    /// Failed to encode or decode a document
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Document does not have the expected shape
    #[error("Invalid {collection} document: {reason}")]
    InvalidDocument {
        collection: Collection,
        reason: String,
    },

    /// Insert with an id that is already taken
    #[error("Document '{id}' already exists in {collection}")]
    DuplicateId { collection: Collection, id: String },

    /// Failure planted through `InMemoryStore::inject_fault`
    #[error("Injected fault on {operation} against {collection}")]
    FaultInjected {
        collection: Collection,
        operation: StoreOperation,
    },
}

impl StoreError {
    /// Create an unavailable error
    pub fn unavailable(operation: StoreOperation, reason: impl Into<String>) -> Self {
        Self::Unavailable {
            operation,
            reason: reason.into(),
        }
    }

    /// Create a serialization error
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = StoreError::unavailable(StoreOperation::UpdateMany, "connection reset");
        assert_eq!(
            err.to_string(),
            "Store unavailable during updateMany: connection reset"
        );

        let err = StoreError::DuplicateId {
            collection: Collection::Categories,
            id: "c1".to_string(),
        };
        assert_eq!(err.to_string(), "Document 'c1' already exists in categories");

        let err = StoreError::FaultInjected {
            collection: Collection::Products,
            operation: StoreOperation::DeleteMany,
        };
        assert_eq!(
            err.to_string(),
            "Injected fault on deleteMany against products"
        );
    }
}

//! Error types for store operations.

use thiserror::Error;

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors that can occur in the data-access layer.
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

    /// Configuration error. Fatal at startup.
    #[error("configuration error: {0}")]
    Config(String),

    /// Pipeline definition error. Fatal at startup.
    #[error("pipeline error: {0}")]
    Pipeline(String),

    /// An operation was issued before the store was configured.
    #[error("store is not configured")]
    NotConfigured,

    /// An operation expecting at least one match found none.
    #[error("no {collection} document matched {criteria}")]
    NotFound {
        /// Collection the operation targeted.
        collection: String,
        /// The filter that matched nothing.
        criteria: String,
    },

    /// A single-document read matched more than one document.
    #[error("more than one {collection} document matched {criteria}")]
    NotUnique {
        /// Collection the operation targeted.
        collection: String,
        /// The filter that matched more than once.
        criteria: String,
    },

    /// Duplicate identifier on insert after exhausting the retry budget.
    #[error("duplicate id inserting into {collection} after {attempts} attempts")]
    Conflict {
        /// Collection the insert targeted.
        collection: String,
        /// How many identifiers were tried.
        attempts: u32,
    },

    /// A change watcher is already registered for the collection.
    #[error("collection {0} already has a change watcher")]
    AlreadyWatched(String),

    /// Operation timed out.
    #[error("operation timed out after {0}ms")]
    Timeout(u64),
}

impl StoreError {
    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Create a pipeline error.
    pub fn pipeline(message: impl Into<String>) -> Self {
        Self::Pipeline(message.into())
    }

    /// Create a not-found error for a collection and filter.
    pub fn not_found(collection: impl Into<String>, criteria: impl Into<String>) -> Self {
        Self::NotFound {
            collection: collection.into(),
            criteria: criteria.into(),
        }
    }

    /// Create a not-unique error for a collection and filter.
    pub fn not_unique(collection: impl Into<String>, criteria: impl Into<String>) -> Self {
        Self::NotUnique {
            collection: collection.into(),
            criteria: criteria.into(),
        }
    }

    /// Check if this is a not-found error.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Check if this is a not-unique error.
    pub fn is_not_unique(&self) -> bool {
        matches!(self, Self::NotUnique { .. })
    }

    /// Check if this is a duplicate-id conflict.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }

    /// Check if this is a timeout error.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let err = StoreError::config("missing credentials file");
        assert!(matches!(err, StoreError::Config(_)));

        let err = StoreError::not_found("users", "{\"name\": \"x\"}");
        assert!(err.is_not_found());
        assert!(!err.is_not_unique());

        let err = StoreError::not_unique("users", "{}");
        assert!(err.is_not_unique());

        let err = StoreError::Conflict {
            collection: "users".into(),
            attempts: 5,
        };
        assert!(err.is_conflict());

        let err = StoreError::Timeout(5000);
        assert!(err.is_timeout());
    }

    #[test]
    fn test_error_display() {
        let err = StoreError::not_found("users", "{\"age\": 3}");
        assert_eq!(err.to_string(), "no users document matched {\"age\": 3}");

        let err = StoreError::Conflict {
            collection: "orders".into(),
            attempts: 5,
        };
        assert_eq!(
            err.to_string(),
            "duplicate id inserting into orders after 5 attempts"
        );

        let err = StoreError::NotConfigured;
        assert_eq!(err.to_string(), "store is not configured");
    }
}

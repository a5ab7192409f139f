//! Error types for the object store façade, adapted from the teacher's
//! `castore::Error` (thiserror enum + `From` conversions between layers).

use thiserror::Error;

use crate::ids::ObjectId;

/// Errors surfaced by [`crate::objectstore::ObjectStore`] and the
/// [`crate::objectstore::BackingStore`] trait it wraps (spec §4.1).
#[derive(Debug, Error, Clone)]
pub enum Error {
    #[error("object not found: {0}")]
    NotFound(ObjectId),

    /// A transient backing-store failure (network blip, server overload).
    /// Retryable by the caller.
    #[error("backing store error (transient): {0}")]
    BackingTransient(String),

    /// A permanent backing-store failure (corrupt object, auth failure).
    /// Not retryable.
    #[error("backing store error (permanent): {0}")]
    BackingPermanent(String),

    #[error("durable cache error: {0}")]
    Cache(String),

    #[error("fetch context deadline exceeded")]
    Timeout,

    #[error("operation cancelled")]
    Cancelled,

    #[error("internal invariant violation: {0}")]
    Internal(String),
}

impl From<redb::Error> for Error {
    fn from(value: redb::Error) -> Self {
        Error::Cache(value.to_string())
    }
}

impl From<redb::DatabaseError> for Error {
    fn from(value: redb::DatabaseError) -> Self {
        Error::Cache(value.to_string())
    }
}

impl From<redb::TableError> for Error {
    fn from(value: redb::TableError) -> Self {
        Error::Cache(value.to_string())
    }
}

impl From<redb::TransactionError> for Error {
    fn from(value: redb::TransactionError) -> Self {
        Error::Cache(value.to_string())
    }
}

impl From<redb::StorageError> for Error {
    fn from(value: redb::StorageError) -> Self {
        Error::Cache(value.to_string())
    }
}

impl From<redb::CommitError> for Error {
    fn from(value: redb::CommitError) -> Self {
        Error::Cache(value.to_string())
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(value: tokio::task::JoinError) -> Self {
        Error::Internal(value.to_string())
    }
}

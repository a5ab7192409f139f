//! The mount-wide error taxonomy (spec §7). Every component module defines
//! its own narrower error enum and converts into this one via `#[from]`,
//! the way the teacher's `castore::Error` sits at the bottom of a `From`
//! chain from `redb`/`JoinError`/`io::Error`.

use edenfs_castore::InodeNumber;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("inode {0} not found")]
    NotFoundInode(InodeNumber),

    #[error("path not found: {0:?}")]
    NotFoundPath(String),

    #[error("object not found: {0}")]
    NotFoundObject(edenfs_castore::ObjectId),

    #[error("{path:?} already exists")]
    AlreadyExists { path: String },

    #[error("{0:?} is not a directory")]
    NotADirectory(String),

    #[error("{0:?} is a directory")]
    IsADirectory(String),

    #[error("directory {0:?} is not empty")]
    DirectoryNotEmpty(String),

    #[error("rename would cross mount boundary")]
    CrossDeviceLink,

    #[error("symlink loop detected (> 40 links)")]
    LoopDetected,

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("operation timed out")]
    Timeout,

    #[error("checkout already in progress{}", .blocker_pid.map(|p| format!(" (pid {p})")).unwrap_or_default())]
    CheckoutInProgress { blocker_pid: Option<u32> },

    #[error("parent out of date: requested {requested}, actual {actual}")]
    OutOfDateParent { requested: String, actual: String },

    #[error("mount generation changed")]
    MountGenerationChanged,

    #[error("journal truncated before requested sequence")]
    JournalTruncated,

    #[error("backing store error: {0}")]
    Backing(String),

    #[error("overlay error: {0}")]
    Overlay(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<edenfs_castore::Error> for Error {
    fn from(value: edenfs_castore::Error) -> Self {
        match value {
            edenfs_castore::Error::NotFound(id) => Error::NotFoundObject(id),
            edenfs_castore::Error::Timeout => Error::Timeout,
            edenfs_castore::Error::Cancelled => Error::Cancelled,
            other => Error::Backing(other.to_string()),
        }
    }
}

impl From<redb::Error> for Error {
    fn from(value: redb::Error) -> Self {
        Error::Overlay(value.to_string())
    }
}

impl From<redb::DatabaseError> for Error {
    fn from(value: redb::DatabaseError) -> Self {
        Error::Overlay(value.to_string())
    }
}

impl From<redb::TableError> for Error {
    fn from(value: redb::TableError) -> Self {
        Error::Overlay(value.to_string())
    }
}

impl From<redb::TransactionError> for Error {
    fn from(value: redb::TransactionError) -> Self {
        Error::Overlay(value.to_string())
    }
}

impl From<redb::StorageError> for Error {
    fn from(value: redb::StorageError) -> Self {
        Error::Overlay(value.to_string())
    }
}

impl From<redb::CommitError> for Error {
    fn from(value: redb::CommitError) -> Self {
        Error::Overlay(value.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Error::Overlay(value.to_string())
    }
}

impl From<Error> for std::io::Error {
    fn from(value: Error) -> Self {
        let kind = match &value {
            Error::NotFoundInode(_) | Error::NotFoundPath(_) | Error::NotFoundObject(_) => {
                std::io::ErrorKind::NotFound
            }
            Error::AlreadyExists { .. } => std::io::ErrorKind::AlreadyExists,
            Error::InvalidArgument(_) => std::io::ErrorKind::InvalidInput,
            Error::Timeout => std::io::ErrorKind::TimedOut,
            _ => std::io::ErrorKind::Other,
        };
        std::io::Error::new(kind, value.to_string())
    }
}

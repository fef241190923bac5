//! Error types for idbag operations.

use crate::row::RowId;
use std::fmt;

/// The primary error type for all idbag operations.
#[derive(Debug)]
pub enum Error {
    /// Storage adapter failures (insert/update/delete/select)
    Storage(StorageError),
    /// Managed collection contract violations
    Collection(CollectionError),
    /// Transaction boundary misuse
    Transaction(TransactionError),
    /// Mapping configuration errors
    Config(ConfigError),
    /// Element type conversion errors
    Type(TypeError),
    /// Entity lookup by id found nothing
    EntityNotFound {
        /// Entity table name.
        table: String,
        /// Requested id.
        id: i64,
    },
    /// Operation was cancelled via asupersync
    Cancelled,
    /// Custom error with message
    Custom(String),
}

#[derive(Debug)]
pub struct StorageError {
    pub kind: StorageErrorKind,
    pub table: Option<String>,
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageErrorKind {
    /// Write rejected by the backend
    Write,
    /// Read failed
    Read,
    /// Unique key violated (owner id, row id)
    Constraint,
    /// Backend is unavailable
    Unavailable,
    /// Another handle holds the store's open transaction
    Locked,
}

#[derive(Debug, Clone)]
pub struct CollectionError {
    pub kind: CollectionErrorKind,
    pub row_id: Option<RowId>,
    pub index: Option<usize>,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectionErrorKind {
    /// The backing row of an entry was deleted underneath the collection
    StaleRowReference,
    /// The row-id generator produced an id already in use. Not recoverable.
    DuplicateRowIdentifier,
    /// Index past the end of the collection
    IndexOutOfBounds,
}

#[derive(Debug)]
pub struct TransactionError {
    pub kind: TransactionErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionErrorKind {
    /// Commit or rollback without an open transaction
    NotActive,
    /// Begin while a transaction is already open
    AlreadyActive,
    /// The unit of work was dropped without commit or rollback
    Abandoned,
}

#[derive(Debug)]
pub struct ConfigError {
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug)]
pub struct TypeError {
    pub expected: &'static str,
    pub actual: String,
    pub rust_type: Option<&'static str>,
}

impl Error {
    /// Is this an invariant violation that must not be retried or swallowed?
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::Collection(CollectionError {
                kind: CollectionErrorKind::DuplicateRowIdentifier,
                ..
            })
        )
    }

    /// Is this a stale row reference?
    pub fn is_stale(&self) -> bool {
        matches!(
            self,
            Error::Collection(CollectionError {
                kind: CollectionErrorKind::StaleRowReference,
                ..
            })
        )
    }

    /// Did a storage adapter call fail?
    pub fn is_storage_failure(&self) -> bool {
        matches!(self, Error::Storage(_))
    }

    /// Shorthand for a storage write failure.
    pub fn storage_write(table: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Storage(StorageError {
            kind: StorageErrorKind::Write,
            table: Some(table.into()),
            message: message.into(),
            source: None,
        })
    }

    /// Is this a write rejected because another handle's transaction is open?
    pub fn is_locked(&self) -> bool {
        matches!(
            self,
            Error::Storage(StorageError {
                kind: StorageErrorKind::Locked,
                ..
            })
        )
    }

    /// Shorthand for a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Error::Config(ConfigError {
            message: message.into(),
            source: None,
        })
    }
}

impl CollectionError {
    pub fn stale(row_id: RowId, index: Option<usize>) -> Self {
        Self {
            kind: CollectionErrorKind::StaleRowReference,
            row_id: Some(row_id),
            index,
            message: format!("backing row {row_id} no longer exists"),
        }
    }

    pub fn duplicate(row_id: RowId) -> Self {
        Self {
            kind: CollectionErrorKind::DuplicateRowIdentifier,
            row_id: Some(row_id),
            index: None,
            message: format!("row id {row_id} generated twice"),
        }
    }

    pub fn out_of_bounds(index: usize, len: usize) -> Self {
        Self {
            kind: CollectionErrorKind::IndexOutOfBounds,
            row_id: None,
            index: Some(index),
            message: format!("index {index} out of bounds for collection of size {len}"),
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Storage(e) => {
                if let Some(table) = &e.table {
                    write!(f, "Storage error on '{}': {}", table, e.message)
                } else {
                    write!(f, "Storage error: {}", e.message)
                }
            }
            Error::Collection(e) => write!(f, "Collection error: {}", e.message),
            Error::Transaction(e) => write!(f, "Transaction error: {}", e.message),
            Error::Config(e) => write!(f, "Configuration error: {}", e.message),
            Error::Type(e) => write!(f, "Type error: expected {}, found {}", e.expected, e.actual),
            Error::EntityNotFound { table, id } => {
                write!(f, "No '{}' entity with id {}", table, id)
            }
            Error::Cancelled => write!(f, "Operation cancelled"),
            Error::Custom(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Storage(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Config(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            _ => None,
        }
    }
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for CollectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for TransactionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl From<StorageError> for Error {
    fn from(err: StorageError) -> Self {
        Error::Storage(err)
    }
}

impl From<CollectionError> for Error {
    fn from(err: CollectionError) -> Self {
        Error::Collection(err)
    }
}

impl From<TransactionError> for Error {
    fn from(err: TransactionError) -> Self {
        Error::Transaction(err)
    }
}

impl From<ConfigError> for Error {
    fn from(err: ConfigError) -> Self {
        Error::Config(err)
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Config(ConfigError {
            message: format!("invalid mapping document: {err}"),
            source: Some(Box::new(err)),
        })
    }
}

/// Result type alias for idbag operations.
pub type Result<T> = std::result::Result<T, Error>;

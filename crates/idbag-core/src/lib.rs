//! Core types and traits for idbag collection persistence.
//!
//! This crate provides the foundational abstractions shared by the session
//! layer and every storage backend:
//!
//! - [`Value`] for dynamically typed collection elements (`Null` included)
//! - [`RowId`], [`OwnerId`] and [`CollectionRow`] for the id-bag row layout
//! - [`CollectionMapping`] / [`EntityMapping`] for explicit table configuration
//! - [`StorageAdapter`] for row-level storage backends
//! - `Outcome` re-export from asupersync for cancel-correct operations
//! - `Cx` context for structured concurrency

// Re-export asupersync primitives for structured concurrency
pub use asupersync::{Cx, Outcome};

pub mod error;
pub mod mapping;
pub mod row;
pub mod storage;
pub mod value;

pub use error::{
    CollectionError, CollectionErrorKind, ConfigError, Error, Result, StorageError,
    StorageErrorKind, TransactionError, TransactionErrorKind, TypeError,
};
pub use mapping::{
    CollectionMapping, EntityMapping, IdStrategy, NullElementPolicy, NullInsert, NullUpdate,
};
pub use row::{CollectionRow, OwnerId, RowId};
pub use storage::StorageAdapter;
pub use value::Value;

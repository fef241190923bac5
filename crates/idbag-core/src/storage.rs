//! Storage adapter trait.
//!
//! This module defines the row-level abstraction every storage backend
//! implements. The session layer never builds SQL; it only asks the adapter
//! to select, insert, update and delete rows keyed by `(owner id, row id)`,
//! plus the handful of owner-table operations needed to persist and delete
//! entities.
//!
//! All operations integrate with asupersync's structured concurrency via `Cx`
//! context for proper cancellation and timeout handling.
//!
//! # Transactions
//!
//! [`begin`](StorageAdapter::begin), [`commit`](StorageAdapter::commit) and
//! [`rollback`](StorageAdapter::rollback) delimit the transactional boundary.
//! [`abandon`](StorageAdapter::abandon) is the synchronous, infallible escape
//! hatch used when a unit of work is dropped without an explicit outcome; it
//! must discard staged writes without blocking.
//!
//! A transaction belongs to the handle that opened it. Other handles on the
//! same store keep reading committed state and may not write until it ends.

use crate::error::Error;
use crate::mapping::{CollectionMapping, EntityMapping};
use crate::row::{CollectionRow, OwnerId, RowId};
use crate::value::Value;
use asupersync::{Cx, Outcome};

/// A storage backend for id-bag collections and their owning entities.
///
/// Row-returning writes report the number of rows affected so the caller can
/// detect rows that vanished underneath it.
pub trait StorageAdapter: Send + Sync {
    /// Select every row of `owner`'s collection, in storage iteration order.
    fn select_rows(
        &self,
        cx: &Cx,
        mapping: &CollectionMapping,
        owner: OwnerId,
    ) -> impl Future<Output = Outcome<Vec<CollectionRow>, Error>> + Send;

    /// Insert a single row.
    fn insert_row(
        &self,
        cx: &Cx,
        mapping: &CollectionMapping,
        owner: OwnerId,
        row_id: RowId,
        element: &Value,
    ) -> impl Future<Output = Outcome<u64, Error>> + Send;

    /// Replace the element of an existing row. Returns rows affected.
    fn update_row(
        &self,
        cx: &Cx,
        mapping: &CollectionMapping,
        owner: OwnerId,
        row_id: RowId,
        element: &Value,
    ) -> impl Future<Output = Outcome<u64, Error>> + Send;

    /// Delete a single row. Returns rows affected.
    fn delete_row(
        &self,
        cx: &Cx,
        mapping: &CollectionMapping,
        owner: OwnerId,
        row_id: RowId,
    ) -> impl Future<Output = Outcome<u64, Error>> + Send;

    /// Delete every row owned by `owner` (entity deletion cascade).
    fn delete_rows(
        &self,
        cx: &Cx,
        mapping: &CollectionMapping,
        owner: OwnerId,
    ) -> impl Future<Output = Outcome<u64, Error>> + Send;

    /// Count non-null elements of `owner`'s collection (`count(element)`).
    fn count_elements(
        &self,
        cx: &Cx,
        mapping: &CollectionMapping,
        owner: OwnerId,
    ) -> impl Future<Output = Outcome<u64, Error>> + Send;

    /// Highest row id ever written to the collection table, across all owners.
    ///
    /// Deleting that row does not lower the mark, so an identifier generator
    /// seeded from it never hands out an id a deleted row once had.
    fn row_id_high_water(
        &self,
        cx: &Cx,
        mapping: &CollectionMapping,
    ) -> impl Future<Output = Outcome<Option<RowId>, Error>> + Send;

    /// Insert an owner row.
    fn insert_owner(
        &self,
        cx: &Cx,
        mapping: &EntityMapping,
        id: OwnerId,
    ) -> impl Future<Output = Outcome<u64, Error>> + Send;

    /// Check whether an owner row exists.
    fn owner_exists(
        &self,
        cx: &Cx,
        mapping: &EntityMapping,
        id: OwnerId,
    ) -> impl Future<Output = Outcome<bool, Error>> + Send;

    /// Delete an owner row. Returns rows affected.
    fn delete_owner(
        &self,
        cx: &Cx,
        mapping: &EntityMapping,
        id: OwnerId,
    ) -> impl Future<Output = Outcome<u64, Error>> + Send;

    /// Highest owner id ever written to the entity table. Never goes down.
    fn owner_id_high_water(
        &self,
        cx: &Cx,
        mapping: &EntityMapping,
    ) -> impl Future<Output = Outcome<Option<OwnerId>, Error>> + Send;

    /// Open a transaction.
    fn begin(&self, cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send;

    /// Make all writes since `begin` durable and visible.
    fn commit(&self, cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send;

    /// Discard all writes since `begin`.
    fn rollback(&self, cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send;

    /// Discard staged writes synchronously. Must not block or fail.
    fn abandon(&self);
}

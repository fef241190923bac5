//! Collection persister: load, plan and flush one id-bag.
//!
//! Flushing writes changed rows in a fixed order:
//! - DELETE rows no entry refers to (and rows nulled under `DeleteRow`)
//! - UPDATE rows whose element changed
//! - INSERT entries without a row, generating row ids as it goes
//!
//! Every write touches exactly one row. A write that affects zero rows means
//! the row was removed underneath us; the entry is marked stale and the flush
//! stops with [`CollectionErrorKind::StaleRowReference`](idbag_core::CollectionErrorKind).
//! Partial writes are left for the enclosing transaction to roll back.

use crate::collection::ManagedCollection;
use crate::row_id::RowIdGenerator;
use crate::snapshot::CollectionSnapshot;
use asupersync::{Cx, Outcome};
use idbag_core::{
    CollectionError, CollectionMapping, Error, NullInsert, NullUpdate, OwnerId, RowId,
    StorageAdapter, StorageErrorKind, Value,
};
use std::collections::HashSet;
use std::sync::Arc;

/// A single-row write.
#[derive(Debug, Clone, PartialEq)]
pub enum RowOp {
    /// Insert a row for the entry at `index`.
    Insert {
        /// Entry index in the collection.
        index: usize,
        /// Row id to reuse; `None` to generate one.
        row_id: Option<RowId>,
        /// Element to store.
        element: Value,
    },
    /// Replace the element of an existing row.
    Update {
        /// Entry index in the collection.
        index: usize,
        /// Row to update.
        row_id: RowId,
        /// New element.
        element: Value,
    },
    /// Delete a row.
    Delete {
        /// Row to delete.
        row_id: RowId,
        /// Entry that stays in memory without a row (nulled under `DeleteRow`).
        /// It is vacated, so later flushes leave it alone whatever `NullInsert` says.
        detach: Option<usize>,
    },
}

/// Ordered writes for one collection.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CollectionFlushPlan {
    /// Delete operations, executed first.
    pub deletes: Vec<RowOp>,
    /// Update operations, executed second.
    pub updates: Vec<RowOp>,
    /// Insert operations, executed last.
    pub inserts: Vec<RowOp>,
    /// Null entries that get no row under `NullInsert::Skip`.
    pub skipped: Vec<usize>,
}

impl CollectionFlushPlan {
    /// Check if the plan has any storage operations.
    pub fn is_empty(&self) -> bool {
        self.deletes.is_empty() && self.updates.is_empty() && self.inserts.is_empty()
    }

    /// Total number of storage operations in the plan.
    pub fn len(&self) -> usize {
        self.deletes.len() + self.updates.len() + self.inserts.len()
    }

    fn needs_generated_ids(&self) -> bool {
        self.inserts
            .iter()
            .any(|op| matches!(op, RowOp::Insert { row_id: None, .. }))
    }
}

/// Result of a flush operation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushResult {
    /// Number of rows inserted.
    pub inserted: usize,
    /// Number of rows updated.
    pub updated: usize,
    /// Number of rows deleted.
    pub deleted: usize,
}

impl FlushResult {
    /// Create a new empty result.
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of operations performed.
    pub fn total(&self) -> usize {
        self.inserted + self.updated + self.deleted
    }

    /// Add another result's counts to this one.
    pub fn merge(&mut self, other: FlushResult) {
        self.inserted += other.inserted;
        self.updated += other.updated;
        self.deleted += other.deleted;
    }
}

/// A collection fresh from storage together with its baseline snapshot.
#[derive(Debug, Clone)]
pub struct LoadedCollection {
    pub collection: ManagedCollection,
    pub snapshot: CollectionSnapshot,
}

/// Loads and flushes one mapped id-bag attribute.
#[derive(Debug, Clone)]
pub struct CollectionPersister {
    mapping: Arc<CollectionMapping>,
    generator: Arc<dyn RowIdGenerator>,
}

impl CollectionPersister {
    pub fn new(mapping: Arc<CollectionMapping>, generator: Arc<dyn RowIdGenerator>) -> Self {
        Self { mapping, generator }
    }

    pub fn mapping(&self) -> &CollectionMapping {
        &self.mapping
    }

    pub fn generator(&self) -> &Arc<dyn RowIdGenerator> {
        &self.generator
    }

    /// Read `owner`'s rows and rebuild the collection.
    ///
    /// Entries come back in storage order, each bound to its row id.
    #[tracing::instrument(level = "debug", skip(self, cx, storage), fields(table = %self.mapping.table))]
    pub async fn load<S: StorageAdapter>(
        &self,
        cx: &Cx,
        storage: &S,
        owner: OwnerId,
    ) -> Outcome<LoadedCollection, Error> {
        let rows = match storage.select_rows(cx, &self.mapping, owner).await {
            Outcome::Ok(rows) => rows,
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        };

        let collection =
            ManagedCollection::from_rows(rows.into_iter().map(|row| (row.row_id, row.element)));
        let snapshot = CollectionSnapshot::capture(&collection);
        tracing::debug!(rows = snapshot.len(), "Loaded collection");

        Outcome::Ok(LoadedCollection {
            collection,
            snapshot,
        })
    }

    /// Plan the writes that bring storage in line with `collection`.
    ///
    /// Applies the mapping's null policy to the raw diff. Pure; touches no
    /// storage.
    pub fn plan(
        &self,
        collection: &ManagedCollection,
        snapshot: &CollectionSnapshot,
    ) -> CollectionFlushPlan {
        let diff = snapshot.diff(collection);
        let policy = self.mapping.null_policy;
        let entries = collection.entries();
        let mut plan = CollectionFlushPlan::default();

        for row_id in diff.to_delete {
            plan.deletes.push(RowOp::Delete {
                row_id,
                detach: None,
            });
        }

        for (index, row_id) in diff.to_update {
            let element = &entries[index].element;
            if element.is_null() && policy.on_update == NullUpdate::DeleteRow {
                plan.deletes.push(RowOp::Delete {
                    row_id,
                    detach: Some(index),
                });
            } else {
                plan.updates.push(RowOp::Update {
                    index,
                    row_id,
                    element: element.clone(),
                });
            }
        }

        for index in diff.to_insert {
            let entry = &entries[index];
            if entry.element.is_null() && policy.on_insert == NullInsert::Skip {
                plan.skipped.push(index);
                continue;
            }
            plan.inserts.push(RowOp::Insert {
                index,
                row_id: entry.row.row_id(),
                element: entry.element.clone(),
            });
        }

        tracing::trace!(
            deletes = plan.deletes.len(),
            updates = plan.updates.len(),
            inserts = plan.inserts.len(),
            skipped = plan.skipped.len(),
            "Planned collection flush"
        );
        plan
    }

    /// Write `collection`'s changes and return the new snapshot.
    ///
    /// On success every entry that has a row is bound to it and the
    /// collection is clean. An unchanged collection issues no storage calls.
    #[tracing::instrument(
        level = "debug",
        skip(self, cx, storage, collection, snapshot),
        fields(table = %self.mapping.table)
    )]
    pub async fn flush<S: StorageAdapter>(
        &self,
        cx: &Cx,
        storage: &S,
        owner: OwnerId,
        collection: &mut ManagedCollection,
        snapshot: &CollectionSnapshot,
    ) -> Outcome<(CollectionSnapshot, FlushResult), Error> {
        let plan = self.plan(collection, snapshot);
        let mut result = FlushResult::new();

        for &index in &plan.skipped {
            collection.detach(index);
        }

        if plan.is_empty() {
            tracing::trace!("Collection unchanged, nothing to write");
            collection.mark_clean();
            return Outcome::Ok((CollectionSnapshot::capture(collection), result));
        }

        tracing::info!(
            deletes = plan.deletes.len(),
            updates = plan.updates.len(),
            inserts = plan.inserts.len(),
            "Flushing collection"
        );

        if plan.needs_generated_ids() && self.generator.needs_seed() {
            match storage.row_id_high_water(cx, &self.mapping).await {
                Outcome::Ok(mark) => self.generator.seed(mark.map(RowId::get)),
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            }
        }

        // 1. Deletes
        for op in &plan.deletes {
            let RowOp::Delete { row_id, detach } = op else {
                continue;
            };
            if let Some(reason) = cx.cancel_reason() {
                return Outcome::Cancelled(reason);
            }
            let affected = match storage.delete_row(cx, &self.mapping, owner, *row_id).await {
                Outcome::Ok(n) => n,
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            };
            if affected == 0 {
                let index = detach.and_then(|_| collection.mark_stale(*row_id));
                tracing::warn!(row_id = %row_id, "Row to delete no longer exists");
                return Outcome::Err(CollectionError::stale(*row_id, index).into());
            }
            if let Some(index) = detach {
                collection.vacate(*index);
            }
            result.deleted += 1;
        }

        // 2. Updates
        for op in &plan.updates {
            let RowOp::Update {
                row_id, element, ..
            } = op
            else {
                continue;
            };
            if let Some(reason) = cx.cancel_reason() {
                return Outcome::Cancelled(reason);
            }
            let affected = match storage
                .update_row(cx, &self.mapping, owner, *row_id, element)
                .await
            {
                Outcome::Ok(n) => n,
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            };
            if affected == 0 {
                let index = collection.mark_stale(*row_id);
                tracing::warn!(row_id = %row_id, "Row to update no longer exists");
                return Outcome::Err(CollectionError::stale(*row_id, index).into());
            }
            result.updated += 1;
        }

        // 3. Inserts
        let mut in_use: HashSet<RowId> = snapshot.row_ids().collect();
        in_use.extend(
            collection
                .entries()
                .iter()
                .filter_map(|entry| entry.row.row_id()),
        );
        for op in &plan.inserts {
            let RowOp::Insert {
                index,
                row_id,
                element,
            } = op
            else {
                continue;
            };
            if let Some(reason) = cx.cancel_reason() {
                return Outcome::Cancelled(reason);
            }
            let row_id = match row_id {
                Some(existing) => *existing,
                None => {
                    let generated = self.generator.next();
                    if !in_use.insert(generated) {
                        tracing::error!(row_id = %generated, "Row id generator returned an id in use");
                        return Outcome::Err(CollectionError::duplicate(generated).into());
                    }
                    generated
                }
            };
            match storage
                .insert_row(cx, &self.mapping, owner, row_id, element)
                .await
            {
                Outcome::Ok(_) => {}
                Outcome::Err(Error::Storage(e)) if e.kind == StorageErrorKind::Constraint => {
                    tracing::error!(row_id = %row_id, "Row id already present in storage");
                    return Outcome::Err(CollectionError::duplicate(row_id).into());
                }
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            }
            collection.attach(*index, row_id);
            result.inserted += 1;
        }

        collection.mark_clean();
        let snapshot = CollectionSnapshot::capture(collection);
        tracing::debug!(
            inserted = result.inserted,
            updated = result.updated,
            deleted = result.deleted,
            rows = snapshot.len(),
            "Collection flushed"
        );
        Outcome::Ok((snapshot, result))
    }

    /// Delete every row of `owner`'s collection.
    #[tracing::instrument(level = "debug", skip(self, cx, storage), fields(table = %self.mapping.table))]
    pub async fn remove_all<S: StorageAdapter>(
        &self,
        cx: &Cx,
        storage: &S,
        owner: OwnerId,
    ) -> Outcome<u64, Error> {
        storage.delete_rows(cx, &self.mapping, owner).await
    }

    /// Number of stored non-null elements for `owner`.
    pub async fn count_elements<S: StorageAdapter>(
        &self,
        cx: &Cx,
        storage: &S,
        owner: OwnerId,
    ) -> Outcome<u64, Error> {
        storage.count_elements(cx, &self.mapping, owner).await
    }
}

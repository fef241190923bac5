//! Collection snapshots and diffing.
//!
//! A snapshot records the `(row id, element)` pairs that storage held for a
//! collection when it was loaded or last flushed. Diffing the live collection
//! against it yields the minimal set of row writes; an unchanged collection
//! diffs to nothing.

use crate::collection::{ManagedCollection, RowState};
use idbag_core::{RowId, Value};
use std::collections::{HashMap, HashSet};
use std::time::Instant;

/// Persisted state of one collection at a point in time.
#[derive(Debug, Clone)]
pub struct CollectionSnapshot {
    rows: Vec<(RowId, Value)>,
    index: HashMap<RowId, usize>,
    /// Timestamp when snapshot was taken.
    taken_at: Instant,
}

impl CollectionSnapshot {
    /// Snapshot of a collection with no stored rows.
    pub fn empty() -> Self {
        Self::from_rows(std::iter::empty())
    }

    /// Build a snapshot from stored rows.
    pub fn from_rows(rows: impl IntoIterator<Item = (RowId, Value)>) -> Self {
        let rows: Vec<(RowId, Value)> = rows.into_iter().collect();
        let index = rows
            .iter()
            .enumerate()
            .map(|(position, (row_id, _))| (*row_id, position))
            .collect();
        Self {
            rows,
            index,
            taken_at: Instant::now(),
        }
    }

    /// Snapshot the rows currently backing `collection`.
    ///
    /// Transient, vacated and stale entries are not part of storage and are
    /// left out.
    #[tracing::instrument(level = "trace", skip(collection))]
    pub fn capture(collection: &ManagedCollection) -> Self {
        let snapshot = Self::from_rows(collection.entries().iter().filter_map(|entry| {
            match entry.row {
                RowState::Persistent(row_id) => Some((row_id, entry.element.clone())),
                RowState::Transient | RowState::Vacated | RowState::Stale(_) => None,
            }
        }));
        tracing::trace!(
            rows = snapshot.len(),
            entries = collection.size(),
            "Captured collection snapshot"
        );
        snapshot
    }

    /// Number of stored rows.
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Stored element for `row_id`.
    pub fn get(&self, row_id: RowId) -> Option<&Value> {
        self.index.get(&row_id).map(|&position| &self.rows[position].1)
    }

    pub fn contains(&self, row_id: RowId) -> bool {
        self.index.contains_key(&row_id)
    }

    /// Row ids in stored order.
    pub fn row_ids(&self) -> impl Iterator<Item = RowId> + '_ {
        self.rows.iter().map(|(row_id, _)| *row_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (RowId, &Value)> {
        self.rows.iter().map(|(row_id, element)| (*row_id, element))
    }

    /// Highest row id in the snapshot.
    pub fn max_row_id(&self) -> Option<RowId> {
        self.rows.iter().map(|(row_id, _)| *row_id).max()
    }

    /// Get the timestamp when the snapshot was taken.
    pub fn taken_at(&self) -> Instant {
        self.taken_at
    }

    /// Compare the live collection against this snapshot.
    ///
    /// The result is independent of any null policy: a null entry without a
    /// row shows up in `to_insert` and a persisted entry that became null
    /// shows up in `to_update`. The persister decides what to do with them.
    #[tracing::instrument(level = "debug", skip(self, current))]
    pub fn diff(&self, current: &ManagedCollection) -> CollectionDiff {
        let mut diff = CollectionDiff::default();
        let mut referenced: HashSet<RowId> = HashSet::with_capacity(current.size());

        for (index, entry) in current.entries().iter().enumerate() {
            match entry.row {
                RowState::Transient => diff.to_insert.push(index),
                RowState::Persistent(row_id) => {
                    referenced.insert(row_id);
                    match self.get(row_id) {
                        Some(stored) if *stored == entry.element => {}
                        Some(_) => diff.to_update.push((index, row_id)),
                        None => diff.to_insert.push(index),
                    }
                }
                // Row is already gone. Nothing to write, nothing to delete.
                RowState::Stale(row_id) => {
                    referenced.insert(row_id);
                }
                // Row was deleted on purpose; stays rowless until set again.
                RowState::Vacated => {}
            }
        }

        diff.to_delete = self
            .row_ids()
            .filter(|row_id| !referenced.contains(row_id))
            .collect();

        tracing::debug!(
            inserts = diff.to_insert.len(),
            updates = diff.to_update.len(),
            deletes = diff.to_delete.len(),
            "Collection diff computed"
        );
        diff
    }
}

impl Default for CollectionSnapshot {
    fn default() -> Self {
        Self::empty()
    }
}

impl PartialEq for CollectionSnapshot {
    fn eq(&self, other: &Self) -> bool {
        self.rows == other.rows
    }
}

/// Row-level changes between a snapshot and a live collection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CollectionDiff {
    /// Indices of entries that have no stored row.
    pub to_insert: Vec<usize>,
    /// Indices of entries whose element changed, with their row id.
    pub to_update: Vec<(usize, RowId)>,
    /// Stored rows no entry refers to any more.
    pub to_delete: Vec<RowId>,
}

impl CollectionDiff {
    pub fn is_empty(&self) -> bool {
        self.to_insert.is_empty() && self.to_update.is_empty() && self.to_delete.is_empty()
    }

    pub fn len(&self) -> usize {
        self.to_insert.len() + self.to_update.len() + self.to_delete.len()
    }
}

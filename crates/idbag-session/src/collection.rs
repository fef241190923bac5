//! The in-memory id-bag.
//!
//! A [`ManagedCollection`] is an ordered bag of nullable elements. Each entry
//! remembers which storage row (if any) backs it, so the persister can turn
//! in-memory edits into single-row writes instead of rewriting the whole
//! collection.

use idbag_core::{CollectionError, Error, RowId, Value};
use std::fmt;

/// Relationship between a collection entry and its storage row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowState {
    /// No row backs this entry yet.
    Transient,
    /// Backed by the row with this id.
    Persistent(RowId),
    /// Nulled, and its row deleted under `NullUpdate::DeleteRow`. No row is
    /// written for it until it is given a non-null element.
    Vacated,
    /// The backing row was deleted underneath the collection.
    Stale(RowId),
}

impl RowState {
    /// Row id of a persistent or stale entry.
    pub const fn row_id(self) -> Option<RowId> {
        match self {
            RowState::Transient | RowState::Vacated => None,
            RowState::Persistent(id) | RowState::Stale(id) => Some(id),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Entry {
    pub(crate) element: Value,
    pub(crate) row: RowState,
}

/// Ordered bag of nullable elements with per-entry row identity.
///
/// `size()` counts every in-memory entry, null or not, backed or not. How
/// many of them have a storage row depends on the collection's null policy
/// and is only settled at flush time.
#[derive(Clone, Default, PartialEq)]
pub struct ManagedCollection {
    entries: Vec<Entry>,
    dirty: bool,
}

impl ManagedCollection {
    /// Create an empty collection.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a collection of not-yet-persisted elements.
    pub fn from_elements<I, V>(elements: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        let entries: Vec<Entry> = elements
            .into_iter()
            .map(|element| Entry {
                element: element.into(),
                row: RowState::Transient,
            })
            .collect();
        let dirty = !entries.is_empty();
        Self { entries, dirty }
    }

    /// Rebuild from stored rows, in the order given.
    pub(crate) fn from_rows(rows: impl IntoIterator<Item = (RowId, Value)>) -> Self {
        Self {
            entries: rows
                .into_iter()
                .map(|(row_id, element)| Entry {
                    element,
                    row: RowState::Persistent(row_id),
                })
                .collect(),
            dirty: false,
        }
    }

    /// Append an element (null allowed).
    pub fn add(&mut self, element: impl Into<Value>) {
        self.entries.push(Entry {
            element: element.into(),
            row: RowState::Transient,
        });
        self.dirty = true;
    }

    /// Replace the element at `index`, keeping its row identity.
    ///
    /// A vacated entry given a non-null element becomes transient again and
    /// gets a fresh row on the next flush. Returns the previous element.
    #[allow(clippy::result_large_err)]
    pub fn set(&mut self, index: usize, element: impl Into<Value>) -> Result<Value, Error> {
        let len = self.entries.len();
        let entry = self
            .entries
            .get_mut(index)
            .ok_or_else(|| CollectionError::out_of_bounds(index, len))?;
        if let RowState::Stale(row_id) = entry.row {
            return Err(CollectionError::stale(row_id, Some(index)).into());
        }
        let element = element.into();
        if entry.row == RowState::Vacated && !element.is_null() {
            entry.row = RowState::Transient;
        }
        let previous = std::mem::replace(&mut entry.element, element);
        self.dirty = true;
        Ok(previous)
    }

    /// Remove the entry at `index`. Its row (if any) is deleted on flush.
    #[allow(clippy::result_large_err)]
    pub fn remove(&mut self, index: usize) -> Result<Value, Error> {
        let len = self.entries.len();
        match self.entries.get(index) {
            None => return Err(CollectionError::out_of_bounds(index, len).into()),
            Some(Entry {
                row: RowState::Stale(row_id),
                ..
            }) => return Err(CollectionError::stale(*row_id, Some(index)).into()),
            Some(_) => {}
        }
        self.dirty = true;
        Ok(self.entries.remove(index).element)
    }

    /// Element at `index`; `Some(&Value::Null)` for a null entry.
    pub fn get(&self, index: usize) -> Option<&Value> {
        self.entries.get(index).map(|entry| &entry.element)
    }

    /// Number of in-memory entries, nulls included.
    pub fn size(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Remove every entry.
    pub fn clear(&mut self) {
        if !self.entries.is_empty() {
            self.entries.clear();
            self.dirty = true;
        }
    }

    /// Drop entries whose backing row has vanished. Returns how many went.
    pub fn discard_stale(&mut self) -> usize {
        let before = self.entries.len();
        self.entries
            .retain(|entry| !matches!(entry.row, RowState::Stale(_)));
        before - self.entries.len()
    }

    /// Iterate elements in order.
    pub fn iter(&self) -> impl Iterator<Item = &Value> {
        self.entries.iter().map(|entry| &entry.element)
    }

    /// Elements as an owned vector.
    pub fn to_vec(&self) -> Vec<Value> {
        self.iter().cloned().collect()
    }

    /// Whether the collection was modified since it was loaded or last flushed.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Row state of the entry at `index`.
    pub fn row_state(&self, index: usize) -> Option<RowState> {
        self.entries.get(index).map(|entry| entry.row)
    }

    /// Row id backing the entry at `index`.
    pub fn row_id(&self, index: usize) -> Option<RowId> {
        self.row_state(index).and_then(RowState::row_id)
    }

    /// Number of entries currently backed by a storage row.
    pub fn persisted_len(&self) -> usize {
        self.entries
            .iter()
            .filter(|entry| matches!(entry.row, RowState::Persistent(_)))
            .count()
    }

    /// Mark the entry backed by `row_id` stale. Returns its index.
    pub fn mark_stale(&mut self, row_id: RowId) -> Option<usize> {
        let index = self
            .entries
            .iter()
            .position(|entry| entry.row == RowState::Persistent(row_id))?;
        self.entries[index].row = RowState::Stale(row_id);
        Some(index)
    }

    pub(crate) fn entries(&self) -> &[Entry] {
        &self.entries
    }

    pub(crate) fn attach(&mut self, index: usize, row_id: RowId) {
        if let Some(entry) = self.entries.get_mut(index) {
            entry.row = RowState::Persistent(row_id);
        }
    }

    pub(crate) fn detach(&mut self, index: usize) {
        if let Some(entry) = self.entries.get_mut(index) {
            entry.row = RowState::Transient;
        }
    }

    pub(crate) fn vacate(&mut self, index: usize) {
        if let Some(entry) = self.entries.get_mut(index) {
            entry.row = RowState::Vacated;
        }
    }

    pub(crate) fn mark_clean(&mut self) {
        self.dirty = false;
    }
}

impl fmt::Debug for ManagedCollection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagedCollection")
            .field("size", &self.entries.len())
            .field("persisted", &self.persisted_len())
            .field("dirty", &self.dirty)
            .finish()
    }
}

impl<V: Into<Value>> FromIterator<V> for ManagedCollection {
    fn from_iter<I: IntoIterator<Item = V>>(iter: I) -> Self {
        Self::from_elements(iter)
    }
}

impl<V: Into<Value>> Extend<V> for ManagedCollection {
    fn extend<I: IntoIterator<Item = V>>(&mut self, iter: I) {
        for element in iter {
            self.add(element);
        }
    }
}

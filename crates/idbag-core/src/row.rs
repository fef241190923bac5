//! Collection row layout.
//!
//! An id-bag table is keyed by `(owner id, row id)` and carries one nullable
//! element column. The row id is synthetic: it is independent of the element,
//! so two rows may hold equal (or null) elements without colliding.

use crate::value::Value;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of the entity that owns a collection.
pub type OwnerId = i64;

/// Synthetic identifier of a single collection row.
///
/// Immutable once assigned and never reused within a store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RowId(i64);

impl RowId {
    /// Wrap a raw identifier.
    #[must_use]
    pub const fn new(raw: i64) -> Self {
        Self(raw)
    }

    /// The raw identifier value.
    #[must_use]
    pub const fn get(self) -> i64 {
        self.0
    }
}

impl fmt::Display for RowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for RowId {
    fn from(raw: i64) -> Self {
        Self(raw)
    }
}

/// One stored row of an id-bag collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionRow {
    pub row_id: RowId,
    pub owner_id: OwnerId,
    pub element: Value,
}

impl CollectionRow {
    pub fn new(owner_id: OwnerId, row_id: RowId, element: impl Into<Value>) -> Self {
        Self {
            row_id,
            owner_id,
            element: element.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn row_id_ordering_and_display() {
        let a = RowId::new(1);
        let b = RowId::from(2);
        assert!(a < b);
        assert_eq!(b.get(), 2);
        assert_eq!(a.to_string(), "1");
    }

    #[test]
    fn rows_with_equal_elements_are_distinct_by_row_id() {
        let r1 = CollectionRow::new(1, RowId::new(1), Value::Null);
        let r2 = CollectionRow::new(1, RowId::new(2), Value::Null);
        assert_eq!(r1.element, r2.element);
        assert_ne!(r1, r2);
    }
}

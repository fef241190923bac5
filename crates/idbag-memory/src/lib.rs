//! In-memory storage backend for idbag.
//!
//! `MemoryStorage` keeps owner and collection tables in process memory and
//! implements [`StorageAdapter`] with real transaction semantics:
//!
//! - `begin` stages a copy of the committed tables for the calling handle
//! - that handle's reads and writes see the staged copy
//! - `commit` publishes the staged copy, `rollback`/`abandon` drop it
//! - writes outside a transaction apply immediately
//!
//! Handles are cheap to clone and share the same tables, so a session
//! factory can hand one to every session. Each clone is a distinct handle.
//! Only one transaction may be open per store at a time: while it is, other
//! handles read committed rows and have their writes rejected as
//! [`StorageErrorKind::Locked`].
//!
//! Row and owner ids are tracked with per-table high-water marks that never
//! go down, not even when the row is deleted or its transaction rolls back.
//!
//! The store also counts every operation ([`StorageStats`]) and can be told
//! to reject writes ([`MemoryStorage::fail_writes_after`]) for exercising
//! failure paths.

use asupersync::{Cx, Outcome};
use idbag_core::{
    CollectionMapping, CollectionRow, EntityMapping, Error, OwnerId, RowId, StorageAdapter,
    StorageError, StorageErrorKind, TransactionError, TransactionErrorKind, Value,
};
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Operation counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StorageStats {
    /// Collection row selects.
    pub selects: u64,
    /// Collection rows inserted.
    pub inserts: u64,
    /// Collection row updates issued.
    pub updates: u64,
    /// Collection row deletes issued (single and bulk).
    pub deletes: u64,
    /// Owner rows inserted or deleted.
    pub owner_writes: u64,
    pub begins: u64,
    pub commits: u64,
    pub rollbacks: u64,
}

impl StorageStats {
    /// Collection row writes.
    pub fn row_writes(&self) -> u64 {
        self.inserts + self.updates + self.deletes
    }

    /// All writes, owner rows included.
    pub fn writes(&self) -> u64 {
        self.row_writes() + self.owner_writes
    }
}

#[derive(Debug, Clone, PartialEq)]
struct StoredRow {
    owner: OwnerId,
    row_id: RowId,
    element: Value,
}

#[derive(Debug, Clone, Default)]
struct Tables {
    collections: HashMap<String, Vec<StoredRow>>,
    owners: HashMap<String, BTreeSet<OwnerId>>,
}

impl Tables {
    fn rows(&self, table: &str) -> &[StoredRow] {
        self.collections.get(table).map_or(&[], Vec::as_slice)
    }

    fn owned_rows<'a>(&'a self, table: &str, owner: OwnerId) -> impl Iterator<Item = &'a StoredRow> {
        self.rows(table).iter().filter(move |row| row.owner == owner)
    }

    fn find_mut(&mut self, table: &str, owner: OwnerId, row_id: RowId) -> Option<&mut StoredRow> {
        self.collections
            .get_mut(table)?
            .iter_mut()
            .find(|row| row.owner == owner && row.row_id == row_id)
    }

    fn remove_where(&mut self, table: &str, keep: impl Fn(&StoredRow) -> bool) -> u64 {
        let Some(rows) = self.collections.get_mut(table) else {
            return 0;
        };
        let before = rows.len();
        rows.retain(keep);
        (before - rows.len()) as u64
    }
}

#[derive(Debug)]
struct Transaction {
    handle: u64,
    tables: Tables,
}

#[derive(Debug, Default)]
struct MemoryState {
    committed: Tables,
    staged: Option<Transaction>,
    /// Highest row id ever inserted, per collection table.
    row_high_water: HashMap<String, RowId>,
    /// Highest owner id ever inserted, per entity table.
    owner_high_water: HashMap<String, OwnerId>,
    next_handle: u64,
    stats: StorageStats,
    /// Writes still allowed before injected failures start. `None` = no limit.
    writes_left: Option<u64>,
}

impl MemoryState {
    fn allocate_handle(&mut self) -> u64 {
        self.next_handle += 1;
        self.next_handle
    }

    fn owns_transaction(&self, handle: u64) -> bool {
        self.staged.as_ref().is_some_and(|txn| txn.handle == handle)
    }

    fn tables(&self, handle: u64) -> &Tables {
        match &self.staged {
            Some(txn) if txn.handle == handle => &txn.tables,
            _ => &self.committed,
        }
    }

    /// Tables a write from `handle` lands in, after the lock and fault checks.
    #[allow(clippy::result_large_err)]
    fn writable(&mut self, handle: u64, table: &str) -> Result<&mut Tables, Error> {
        if self.staged.as_ref().is_some_and(|txn| txn.handle != handle) {
            tracing::debug!(table, handle, "Write rejected, store locked by another handle");
            return Err(locked(Some(table)));
        }
        self.admit_write(table)?;
        Ok(match &mut self.staged {
            Some(txn) => &mut txn.tables,
            None => &mut self.committed,
        })
    }

    #[allow(clippy::result_large_err)]
    fn admit_write(&mut self, table: &str) -> Result<(), Error> {
        match self.writes_left {
            None => Ok(()),
            Some(0) => {
                tracing::warn!(table, "Injected write failure");
                Err(Error::storage_write(table, "write rejected"))
            }
            Some(n) => {
                self.writes_left = Some(n - 1);
                Ok(())
            }
        }
    }

    fn select_rows(&mut self, handle: u64, table: &str, owner: OwnerId) -> Vec<CollectionRow> {
        self.stats.selects += 1;
        self.tables(handle)
            .owned_rows(table, owner)
            .map(|row| CollectionRow::new(row.owner, row.row_id, row.element.clone()))
            .collect()
    }

    #[allow(clippy::result_large_err)]
    fn insert_row(
        &mut self,
        handle: u64,
        table: &str,
        owner: OwnerId,
        row_id: RowId,
        element: Value,
    ) -> Result<u64, Error> {
        let tables = self.writable(handle, table)?;
        if tables.find_mut(table, owner, row_id).is_some() {
            return Err(Error::Storage(StorageError {
                kind: StorageErrorKind::Constraint,
                table: Some(table.to_string()),
                message: format!("duplicate key (owner {owner}, row {row_id})"),
                source: None,
            }));
        }
        tables
            .collections
            .entry(table.to_string())
            .or_default()
            .push(StoredRow {
                owner,
                row_id,
                element,
            });
        let mark = self.row_high_water.entry(table.to_string()).or_insert(row_id);
        *mark = (*mark).max(row_id);
        self.stats.inserts += 1;
        Ok(1)
    }

    #[allow(clippy::result_large_err)]
    fn update_row(
        &mut self,
        handle: u64,
        table: &str,
        owner: OwnerId,
        row_id: RowId,
        element: Value,
    ) -> Result<u64, Error> {
        let tables = self.writable(handle, table)?;
        let affected = match tables.find_mut(table, owner, row_id) {
            Some(row) => {
                row.element = element;
                1
            }
            None => 0,
        };
        self.stats.updates += 1;
        Ok(affected)
    }

    #[allow(clippy::result_large_err)]
    fn delete_row(
        &mut self,
        handle: u64,
        table: &str,
        owner: OwnerId,
        row_id: RowId,
    ) -> Result<u64, Error> {
        let removed = self
            .writable(handle, table)?
            .remove_where(table, |row| !(row.owner == owner && row.row_id == row_id));
        self.stats.deletes += 1;
        Ok(removed)
    }

    #[allow(clippy::result_large_err)]
    fn delete_rows(&mut self, handle: u64, table: &str, owner: OwnerId) -> Result<u64, Error> {
        let removed = self
            .writable(handle, table)?
            .remove_where(table, |row| row.owner != owner);
        self.stats.deletes += 1;
        Ok(removed)
    }

    fn count_elements(&self, handle: u64, table: &str, owner: OwnerId) -> u64 {
        self.tables(handle)
            .owned_rows(table, owner)
            .filter(|row| !row.element.is_null())
            .count() as u64
    }

    fn row_id_high_water(&self, table: &str) -> Option<RowId> {
        self.row_high_water.get(table).copied()
    }

    #[allow(clippy::result_large_err)]
    fn insert_owner(&mut self, handle: u64, table: &str, id: OwnerId) -> Result<u64, Error> {
        let inserted = self
            .writable(handle, table)?
            .owners
            .entry(table.to_string())
            .or_default()
            .insert(id);
        if !inserted {
            return Err(Error::Storage(StorageError {
                kind: StorageErrorKind::Constraint,
                table: Some(table.to_string()),
                message: format!("duplicate id {id}"),
                source: None,
            }));
        }
        let mark = self.owner_high_water.entry(table.to_string()).or_insert(id);
        *mark = (*mark).max(id);
        self.stats.owner_writes += 1;
        Ok(1)
    }

    fn owner_exists(&self, handle: u64, table: &str, id: OwnerId) -> bool {
        self.tables(handle)
            .owners
            .get(table)
            .is_some_and(|ids| ids.contains(&id))
    }

    #[allow(clippy::result_large_err)]
    fn delete_owner(&mut self, handle: u64, table: &str, id: OwnerId) -> Result<u64, Error> {
        let removed = self
            .writable(handle, table)?
            .owners
            .get_mut(table)
            .is_some_and(|ids| ids.remove(&id));
        self.stats.owner_writes += 1;
        Ok(u64::from(removed))
    }

    fn owner_id_high_water(&self, table: &str) -> Option<OwnerId> {
        self.owner_high_water.get(table).copied()
    }

    #[allow(clippy::result_large_err)]
    fn begin(&mut self, handle: u64) -> Result<(), Error> {
        match &self.staged {
            Some(txn) if txn.handle == handle => {
                return Err(Error::Transaction(TransactionError {
                    kind: TransactionErrorKind::AlreadyActive,
                    message: "memory storage already has an open transaction".to_string(),
                }));
            }
            Some(_) => return Err(locked(None)),
            None => {}
        }
        self.staged = Some(Transaction {
            handle,
            tables: self.committed.clone(),
        });
        self.stats.begins += 1;
        tracing::debug!(handle, "Memory transaction started");
        Ok(())
    }

    #[allow(clippy::result_large_err)]
    fn commit(&mut self, handle: u64) -> Result<(), Error> {
        if !self.owns_transaction(handle) {
            return Err(not_active("commit"));
        }
        if let Some(txn) = self.staged.take() {
            self.committed = txn.tables;
        }
        self.stats.commits += 1;
        tracing::debug!(handle, "Memory transaction committed");
        Ok(())
    }

    #[allow(clippy::result_large_err)]
    fn rollback(&mut self, handle: u64) -> Result<(), Error> {
        if !self.owns_transaction(handle) {
            return Err(not_active("rollback"));
        }
        self.staged = None;
        self.stats.rollbacks += 1;
        tracing::debug!(handle, "Memory transaction rolled back");
        Ok(())
    }
}

fn not_active(operation: &str) -> Error {
    Error::Transaction(TransactionError {
        kind: TransactionErrorKind::NotActive,
        message: format!("{operation} without an open transaction"),
    })
}

fn locked(table: Option<&str>) -> Error {
    Error::Storage(StorageError {
        kind: StorageErrorKind::Locked,
        table: table.map(str::to_string),
        message: "another handle has an open transaction on this store".to_string(),
        source: None,
    })
}

fn with_state<T>(
    inner: &Mutex<MemoryState>,
    f: impl FnOnce(&mut MemoryState) -> Result<T, Error>,
) -> Outcome<T, Error> {
    let mut state = match inner.lock() {
        Ok(state) => state,
        Err(_) => {
            return Outcome::Err(Error::Storage(StorageError {
                kind: StorageErrorKind::Unavailable,
                table: None,
                message: "memory storage lock poisoned".to_string(),
                source: None,
            }));
        }
    };
    match f(&mut state) {
        Ok(value) => Outcome::Ok(value),
        Err(e) => Outcome::Err(e),
    }
}

/// Transactional in-memory tables shared by all clones of the handle.
///
/// Cloning yields a new handle onto the same tables.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    inner: Arc<Mutex<MemoryState>>,
    handle: u64,
}

impl Clone for MemoryStorage {
    fn clone(&self) -> Self {
        let handle = self.lock().allocate_handle();
        Self {
            inner: Arc::clone(&self.inner),
            handle,
        }
    }
}

impl MemoryStorage {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder form of [`fail_all_writes`](Self::fail_all_writes).
    pub fn with_fail_writes(self, fail: bool) -> Self {
        if fail {
            self.fail_all_writes();
        }
        self
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Allow `n` more writes, then reject every write until cleared.
    pub fn fail_writes_after(&self, n: u64) {
        self.lock().writes_left = Some(n);
    }

    /// Reject every write until cleared.
    pub fn fail_all_writes(&self) {
        self.fail_writes_after(0);
    }

    /// Stop rejecting writes.
    pub fn clear_faults(&self) {
        self.lock().writes_left = None;
    }

    pub fn stats(&self) -> StorageStats {
        self.lock().stats
    }

    pub fn reset_stats(&self) {
        self.lock().stats = StorageStats::default();
    }

    /// Whether any handle on this store has a transaction open.
    pub fn in_transaction(&self) -> bool {
        self.lock().staged.is_some()
    }

    /// Whether this handle opened the store's current transaction.
    pub fn owns_transaction(&self) -> bool {
        self.lock().owns_transaction(self.handle)
    }

    /// Committed rows of `owner`'s collection, in insertion order.
    pub fn rows(&self, mapping: &CollectionMapping, owner: OwnerId) -> Vec<CollectionRow> {
        self.lock()
            .committed
            .owned_rows(&mapping.table, owner)
            .map(|row| CollectionRow::new(row.owner, row.row_id, row.element.clone()))
            .collect()
    }

    /// Number of committed rows of `owner`'s collection, null elements included.
    pub fn row_count(&self, mapping: &CollectionMapping, owner: OwnerId) -> usize {
        self.lock()
            .committed
            .owned_rows(&mapping.table, owner)
            .count()
    }

    /// Number of committed owner rows in `table`.
    pub fn owner_count(&self, table: &str) -> usize {
        self.lock().committed.owners.get(table).map_or(0, BTreeSet::len)
    }

    /// Delete a row from committed and staged state alike, as a concurrent
    /// writer would. Returns whether the row existed.
    pub fn purge_row(&self, mapping: &CollectionMapping, owner: OwnerId, row_id: RowId) -> bool {
        let mut state = self.lock();
        let keep = |row: &StoredRow| !(row.owner == owner && row.row_id == row_id);
        let mut removed = state.committed.remove_where(&mapping.table, keep);
        if let Some(txn) = state.staged.as_mut() {
            removed += txn.tables.remove_where(&mapping.table, keep);
        }
        removed > 0
    }
}

impl StorageAdapter for MemoryStorage {
    fn select_rows(
        &self,
        _cx: &Cx,
        mapping: &CollectionMapping,
        owner: OwnerId,
    ) -> impl Future<Output = Outcome<Vec<CollectionRow>, Error>> + Send {
        let inner = Arc::clone(&self.inner);
        let handle = self.handle;
        let table = mapping.table.clone();
        async move {
            tracing::trace!(table = %table, owner, "select rows");
            with_state(&inner, |state| Ok(state.select_rows(handle, &table, owner)))
        }
    }

    fn insert_row(
        &self,
        _cx: &Cx,
        mapping: &CollectionMapping,
        owner: OwnerId,
        row_id: RowId,
        element: &Value,
    ) -> impl Future<Output = Outcome<u64, Error>> + Send {
        let inner = Arc::clone(&self.inner);
        let handle = self.handle;
        let table = mapping.table.clone();
        let element = element.clone();
        async move {
            tracing::trace!(table = %table, owner, row_id = %row_id, "insert row");
            with_state(&inner, |state| {
                state.insert_row(handle, &table, owner, row_id, element)
            })
        }
    }

    fn update_row(
        &self,
        _cx: &Cx,
        mapping: &CollectionMapping,
        owner: OwnerId,
        row_id: RowId,
        element: &Value,
    ) -> impl Future<Output = Outcome<u64, Error>> + Send {
        let inner = Arc::clone(&self.inner);
        let handle = self.handle;
        let table = mapping.table.clone();
        let element = element.clone();
        async move {
            tracing::trace!(table = %table, owner, row_id = %row_id, "update row");
            with_state(&inner, |state| {
                state.update_row(handle, &table, owner, row_id, element)
            })
        }
    }

    fn delete_row(
        &self,
        _cx: &Cx,
        mapping: &CollectionMapping,
        owner: OwnerId,
        row_id: RowId,
    ) -> impl Future<Output = Outcome<u64, Error>> + Send {
        let inner = Arc::clone(&self.inner);
        let handle = self.handle;
        let table = mapping.table.clone();
        async move {
            tracing::trace!(table = %table, owner, row_id = %row_id, "delete row");
            with_state(&inner, |state| state.delete_row(handle, &table, owner, row_id))
        }
    }

    fn delete_rows(
        &self,
        _cx: &Cx,
        mapping: &CollectionMapping,
        owner: OwnerId,
    ) -> impl Future<Output = Outcome<u64, Error>> + Send {
        let inner = Arc::clone(&self.inner);
        let handle = self.handle;
        let table = mapping.table.clone();
        async move {
            tracing::trace!(table = %table, owner, "delete all rows");
            with_state(&inner, |state| state.delete_rows(handle, &table, owner))
        }
    }

    fn count_elements(
        &self,
        _cx: &Cx,
        mapping: &CollectionMapping,
        owner: OwnerId,
    ) -> impl Future<Output = Outcome<u64, Error>> + Send {
        let inner = Arc::clone(&self.inner);
        let handle = self.handle;
        let table = mapping.table.clone();
        async move {
            with_state(&inner, |state| Ok(state.count_elements(handle, &table, owner)))
        }
    }

    fn row_id_high_water(
        &self,
        _cx: &Cx,
        mapping: &CollectionMapping,
    ) -> impl Future<Output = Outcome<Option<RowId>, Error>> + Send {
        let inner = Arc::clone(&self.inner);
        let table = mapping.table.clone();
        async move { with_state(&inner, |state| Ok(state.row_id_high_water(&table))) }
    }

    fn insert_owner(
        &self,
        _cx: &Cx,
        mapping: &EntityMapping,
        id: OwnerId,
    ) -> impl Future<Output = Outcome<u64, Error>> + Send {
        let inner = Arc::clone(&self.inner);
        let handle = self.handle;
        let table = mapping.table.clone();
        async move {
            tracing::trace!(table = %table, id, "insert owner");
            with_state(&inner, |state| state.insert_owner(handle, &table, id))
        }
    }

    fn owner_exists(
        &self,
        _cx: &Cx,
        mapping: &EntityMapping,
        id: OwnerId,
    ) -> impl Future<Output = Outcome<bool, Error>> + Send {
        let inner = Arc::clone(&self.inner);
        let handle = self.handle;
        let table = mapping.table.clone();
        async move { with_state(&inner, |state| Ok(state.owner_exists(handle, &table, id))) }
    }

    fn delete_owner(
        &self,
        _cx: &Cx,
        mapping: &EntityMapping,
        id: OwnerId,
    ) -> impl Future<Output = Outcome<u64, Error>> + Send {
        let inner = Arc::clone(&self.inner);
        let handle = self.handle;
        let table = mapping.table.clone();
        async move {
            tracing::trace!(table = %table, id, "delete owner");
            with_state(&inner, |state| state.delete_owner(handle, &table, id))
        }
    }

    fn owner_id_high_water(
        &self,
        _cx: &Cx,
        mapping: &EntityMapping,
    ) -> impl Future<Output = Outcome<Option<OwnerId>, Error>> + Send {
        let inner = Arc::clone(&self.inner);
        let table = mapping.table.clone();
        async move { with_state(&inner, |state| Ok(state.owner_id_high_water(&table))) }
    }

    fn begin(&self, _cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send {
        let inner = Arc::clone(&self.inner);
        let handle = self.handle;
        async move { with_state(&inner, |state| state.begin(handle)) }
    }

    fn commit(&self, _cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send {
        let inner = Arc::clone(&self.inner);
        let handle = self.handle;
        async move { with_state(&inner, |state| state.commit(handle)) }
    }

    fn rollback(&self, _cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send {
        let inner = Arc::clone(&self.inner);
        let handle = self.handle;
        async move { with_state(&inner, |state| state.rollback(handle)) }
    }

    fn abandon(&self) {
        let mut state = self.lock();
        if state.owns_transaction(self.handle) {
            state.staged = None;
            state.stats.rollbacks += 1;
            tracing::debug!(handle = self.handle, "Memory transaction abandoned");
        }
    }
}

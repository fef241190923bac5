//! Session and unit of work for id-bag collections.
//!
//! `idbag-session` is the **unit-of-work layer**. It tracks entities and their
//! id-bag attributes, diffs each collection against the snapshot taken when it
//! was loaded, and writes only the rows that changed.
//!
//! # Role In The Architecture
//!
//! - **Identity map**: one in-memory entity per `(table, id)` within a session.
//! - **Collection persister**: plans and executes single-row writes per bag.
//! - **Transactional safety**: flush/commit/rollback around a `StorageAdapter`.
//!
//! # Null elements
//!
//! A collection may hold null entries. Whether they get a storage row is
//! decided per collection by its [`NullElementPolicy`](idbag_core::NullElementPolicy):
//! by default a null never reaches storage, so adding one changes `size()`
//! but not the stored row count.
//!
//! # Example
//!
//! ```ignore
//! let factory = SessionFactory::new(storage, registry);
//! let mut session = factory.open_session();
//!
//! let mut tx = session.transaction(&cx).await?;
//! let bag = ManagedCollection::from_elements([Value::Null]);
//! let id = tx.persist(&cx, AnEntity { id: None, a_collection: bag }).await?;
//! tx.commit(&cx).await?;
//!
//! let mut tx = session.transaction(&cx).await?;
//! let entity = tx.find::<AnEntity>(&cx, id).await?;
//! assert_eq!(entity.a_collection.size(), 0);
//! tx.commit(&cx).await?;
//! ```

pub mod collection;
pub mod entity;
pub mod identity_map;
pub mod persister;
pub mod registry;
pub mod row_id;
pub mod snapshot;
pub mod unit_of_work;

pub use collection::{ManagedCollection, RowState};
pub use entity::Entity;
pub use identity_map::{EntityKey, EntityState, IdentityMap};
pub use persister::{CollectionFlushPlan, CollectionPersister, FlushResult, LoadedCollection, RowOp};
pub use registry::{EntityPersister, MappingRegistry, MappingRegistryBuilder};
pub use row_id::{CounterGenerator, IncrementGenerator, RowIdGenerator, generator_for};
pub use snapshot::{CollectionDiff, CollectionSnapshot};
pub use unit_of_work::{PendingCounts, UnitOfWork};

use asupersync::{Cx, Outcome};
use identity_map::TrackedEntity;
use idbag_core::{Error, OwnerId, StorageAdapter, TransactionError, TransactionErrorKind};
use std::collections::HashMap;
use std::sync::Arc;

// ============================================================================
// Session Events
// ============================================================================

/// Type alias for session event callbacks.
///
/// Callbacks receive no arguments and return `Result<(), Error>`.
/// Returning `Err` will abort the operation (e.g., prevent commit).
type SessionEventFn = Box<dyn FnMut() -> Result<(), Error> + Send>;

/// Holds registered session-level event callbacks.
#[derive(Default)]
pub struct SessionEventCallbacks {
    before_flush: Vec<SessionEventFn>,
    after_flush: Vec<SessionEventFn>,
    before_commit: Vec<SessionEventFn>,
    after_commit: Vec<SessionEventFn>,
    after_rollback: Vec<SessionEventFn>,
}

impl std::fmt::Debug for SessionEventCallbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionEventCallbacks")
            .field("before_flush", &self.before_flush.len())
            .field("after_flush", &self.after_flush.len())
            .field("before_commit", &self.before_commit.len())
            .field("after_commit", &self.after_commit.len())
            .field("after_rollback", &self.after_rollback.len())
            .finish()
    }
}

impl SessionEventCallbacks {
    #[allow(clippy::result_large_err)]
    fn fire(&mut self, event: SessionEvent) -> Result<(), Error> {
        let callbacks = match event {
            SessionEvent::BeforeFlush => &mut self.before_flush,
            SessionEvent::AfterFlush => &mut self.after_flush,
            SessionEvent::BeforeCommit => &mut self.before_commit,
            SessionEvent::AfterCommit => &mut self.after_commit,
            SessionEvent::AfterRollback => &mut self.after_rollback,
        };
        for cb in callbacks.iter_mut() {
            cb()?;
        }
        Ok(())
    }
}

/// Session lifecycle events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    /// Fired before flush executes pending changes.
    BeforeFlush,
    /// Fired after flush completes successfully.
    AfterFlush,
    /// Fired before commit (after flush).
    BeforeCommit,
    /// Fired after commit completes successfully.
    AfterCommit,
    /// Fired after rollback completes.
    AfterRollback,
}

// ============================================================================
// Session Configuration
// ============================================================================

/// Configuration for Session behavior.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Whether to auto-begin a transaction on first operation.
    pub auto_begin: bool,
    /// Whether to flush before counting stored elements.
    pub auto_flush: bool,
    /// Whether to drop tracked entities after commit (reload on next access).
    pub expire_on_commit: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            auto_begin: true,
            auto_flush: false,
            expire_on_commit: true,
        }
    }
}

// ============================================================================
// Session Factory
// ============================================================================

/// Shared entry point: one storage handle, one validated registry.
///
/// Every session opened here draws row ids from the same generators.
#[derive(Clone)]
pub struct SessionFactory<S: StorageAdapter + Clone> {
    storage: S,
    registry: Arc<MappingRegistry>,
    config: SessionConfig,
}

impl<S: StorageAdapter + Clone> SessionFactory<S> {
    pub fn new(storage: S, registry: MappingRegistry) -> Self {
        Self::with_config(storage, registry, SessionConfig::default())
    }

    pub fn with_config(storage: S, registry: MappingRegistry, config: SessionConfig) -> Self {
        Self {
            storage,
            registry: Arc::new(registry),
            config,
        }
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }

    pub fn registry(&self) -> &Arc<MappingRegistry> {
        &self.registry
    }

    /// Open a new session over the shared storage.
    pub fn open_session(&self) -> Session<S> {
        Session::with_config(
            self.storage.clone(),
            Arc::clone(&self.registry),
            self.config.clone(),
        )
    }
}

// ============================================================================
// Session
// ============================================================================

/// The Session is the central unit-of-work manager.
///
/// It tracks entities loaded from or persisted to storage and coordinates
/// flushing their collections back.
pub struct Session<S: StorageAdapter> {
    /// The storage backend.
    storage: S,
    /// Validated mappings and shared id generators.
    registry: Arc<MappingRegistry>,
    /// Whether we're in a transaction.
    in_transaction: bool,
    /// Tracked entities and their collection snapshots.
    identity_map: IdentityMap,
    /// Configuration.
    config: SessionConfig,
    /// Session-level event callbacks.
    event_callbacks: SessionEventCallbacks,
}

impl<S: StorageAdapter> Session<S> {
    /// Create a new session over `storage`.
    pub fn new(storage: S, registry: Arc<MappingRegistry>) -> Self {
        Self::with_config(storage, registry, SessionConfig::default())
    }

    /// Create a new session with custom configuration.
    pub fn with_config(storage: S, registry: Arc<MappingRegistry>, config: SessionConfig) -> Self {
        Self {
            storage,
            registry,
            in_transaction: false,
            identity_map: IdentityMap::new(),
            config,
            event_callbacks: SessionEventCallbacks::default(),
        }
    }

    /// Get a reference to the storage backend.
    pub fn storage(&self) -> &S {
        &self.storage
    }

    pub fn registry(&self) -> &Arc<MappingRegistry> {
        &self.registry
    }

    /// Get the session configuration.
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn identity_map(&self) -> &IdentityMap {
        &self.identity_map
    }

    pub fn in_transaction(&self) -> bool {
        self.in_transaction
    }

    // ========================================================================
    // Session Events
    // ========================================================================

    /// Register a callback to run before flush.
    ///
    /// The callback can abort the flush by returning `Err`.
    pub fn on_before_flush(&mut self, f: impl FnMut() -> Result<(), Error> + Send + 'static) {
        self.event_callbacks.before_flush.push(Box::new(f));
    }

    /// Register a callback to run after a successful flush.
    pub fn on_after_flush(&mut self, f: impl FnMut() -> Result<(), Error> + Send + 'static) {
        self.event_callbacks.after_flush.push(Box::new(f));
    }

    /// Register a callback to run before commit (after flush).
    ///
    /// The callback can abort the commit by returning `Err`.
    pub fn on_before_commit(&mut self, f: impl FnMut() -> Result<(), Error> + Send + 'static) {
        self.event_callbacks.before_commit.push(Box::new(f));
    }

    /// Register a callback to run after a successful commit.
    pub fn on_after_commit(&mut self, f: impl FnMut() -> Result<(), Error> + Send + 'static) {
        self.event_callbacks.after_commit.push(Box::new(f));
    }

    /// Register a callback to run after rollback.
    pub fn on_after_rollback(&mut self, f: impl FnMut() -> Result<(), Error> + Send + 'static) {
        self.event_callbacks.after_rollback.push(Box::new(f));
    }

    // ========================================================================
    // Entity Operations
    // ========================================================================

    /// Start tracking a new entity and return its id.
    ///
    /// An entity without an id gets one from its table's generator. Rows are
    /// written on flush; until then the entity lives in the identity map.
    #[tracing::instrument(level = "debug", skip(self, cx, entity), fields(table = E::TABLE_NAME))]
    pub async fn persist<E: Entity>(&mut self, cx: &Cx, mut entity: E) -> Outcome<OwnerId, Error> {
        let registry = Arc::clone(&self.registry);
        let persister = match registry.require(E::TABLE_NAME) {
            Ok(p) => p,
            Err(e) => return Outcome::Err(e),
        };
        for collection in persister.collections() {
            let name = &collection.mapping().name;
            if Entity::collection(&entity, name).is_none() {
                return Outcome::Err(missing_collection(E::TABLE_NAME, name));
            }
        }

        match self.ensure_transaction(cx).await {
            Outcome::Ok(()) => {}
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        }

        let id = match entity.id() {
            Some(id) => id,
            None => {
                let generator = persister.id_generator();
                if generator.needs_seed() {
                    match self.storage.owner_id_high_water(cx, persister.mapping()).await {
                        Outcome::Ok(mark) => generator.seed(mark),
                        Outcome::Err(e) => return Outcome::Err(e),
                        Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                        Outcome::Panicked(p) => return Outcome::Panicked(p),
                    }
                }
                let id = generator.next().get();
                entity.set_id(id);
                id
            }
        };

        let key = EntityKey::of::<E>(id);
        if self.identity_map.contains(&key) {
            return Outcome::Err(Error::Custom(format!(
                "{key} is already tracked by this session"
            )));
        }

        let mut tracked = TrackedEntity::new(entity, EntityState::New);
        for collection in persister.collections() {
            tracked
                .snapshots
                .insert(collection.mapping().name.clone(), CollectionSnapshot::empty());
        }
        self.identity_map.insert(key, tracked);
        tracing::debug!(id, "Entity persisted");

        Outcome::Ok(id)
    }

    /// Get an entity by id.
    ///
    /// Returns the tracked instance if there is one; otherwise loads the
    /// owner and all of its collections from storage.
    #[tracing::instrument(level = "debug", skip(self, cx), fields(table = E::TABLE_NAME))]
    pub async fn get<E: Entity>(&mut self, cx: &Cx, id: OwnerId) -> Outcome<Option<&mut E>, Error> {
        let key = EntityKey::of::<E>(id);
        match self.identity_map.state(&key) {
            Some(EntityState::Deleted) => return Outcome::Ok(None),
            Some(EntityState::New | EntityState::Persistent) => {
                return Outcome::Ok(self.identity_map.get_mut::<E>(id));
            }
            None => {}
        }

        let registry = Arc::clone(&self.registry);
        let persister = match registry.require(E::TABLE_NAME) {
            Ok(p) => p,
            Err(e) => return Outcome::Err(e),
        };

        match self.ensure_transaction(cx).await {
            Outcome::Ok(()) => {}
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        }

        match self.storage.owner_exists(cx, persister.mapping(), id).await {
            Outcome::Ok(true) => {}
            Outcome::Ok(false) => {
                tracing::debug!(id, "Entity not found");
                return Outcome::Ok(None);
            }
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        }

        let mut entity = E::instantiate(id);
        let mut snapshots = HashMap::with_capacity(persister.collections().len());
        for collection in persister.collections() {
            let loaded = match collection.load(cx, &self.storage, id).await {
                Outcome::Ok(loaded) => loaded,
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            };
            let name = &collection.mapping().name;
            match Entity::collection_mut(&mut entity, name) {
                Some(slot) => *slot = loaded.collection,
                None => return Outcome::Err(missing_collection(E::TABLE_NAME, name)),
            }
            snapshots.insert(name.clone(), loaded.snapshot);
        }

        let mut tracked = TrackedEntity::new(entity, EntityState::Persistent);
        tracked.snapshots = snapshots;
        self.identity_map.insert(key, tracked);

        Outcome::Ok(self.identity_map.get_mut::<E>(id))
    }

    /// Get an entity by id, failing with [`Error::EntityNotFound`] if absent.
    pub async fn find<E: Entity>(&mut self, cx: &Cx, id: OwnerId) -> Outcome<&mut E, Error> {
        match self.get::<E>(cx, id).await {
            Outcome::Ok(Some(entity)) => Outcome::Ok(entity),
            Outcome::Ok(None) => Outcome::Err(Error::EntityNotFound {
                table: E::TABLE_NAME.to_string(),
                id,
            }),
            Outcome::Err(e) => Outcome::Err(e),
            Outcome::Cancelled(r) => Outcome::Cancelled(r),
            Outcome::Panicked(p) => Outcome::Panicked(p),
        }
    }

    /// Mark a tracked entity for deletion.
    ///
    /// The owner row and every collection row go on the next flush. An entity
    /// persisted in this session but never flushed is simply forgotten.
    #[allow(clippy::result_large_err)]
    pub fn delete<E: Entity>(&mut self, id: OwnerId) -> Result<(), Error> {
        let key = EntityKey::of::<E>(id);
        match self.identity_map.state(&key) {
            None => Err(Error::EntityNotFound {
                table: E::TABLE_NAME.to_string(),
                id,
            }),
            Some(EntityState::New) => {
                self.identity_map.remove(&key);
                Ok(())
            }
            Some(EntityState::Persistent) => {
                if let Some(tracked) = self.identity_map.tracked_mut(&key) {
                    tracked.state = EntityState::Deleted;
                }
                tracing::debug!(key = %key, "Entity marked for deletion");
                Ok(())
            }
            Some(EntityState::Deleted) => Ok(()),
        }
    }

    /// Is an entity with this id tracked (and not deleted)?
    pub fn contains<E: Entity>(&self, id: OwnerId) -> bool {
        matches!(
            self.identity_map.state(&EntityKey::of::<E>(id)),
            Some(EntityState::New | EntityState::Persistent)
        )
    }

    /// Lifecycle state of a tracked entity.
    pub fn entity_state<E: Entity>(&self, id: OwnerId) -> Option<EntityState> {
        self.identity_map.state(&EntityKey::of::<E>(id))
    }

    /// Stop tracking an entity without writing its pending changes.
    pub fn evict<E: Entity>(&mut self, id: OwnerId) -> bool {
        self.identity_map.remove(&EntityKey::of::<E>(id)).is_some()
    }

    /// Count stored non-null elements of one collection.
    ///
    /// Runs inside the session's transaction (opened on demand), so it sees
    /// this session's flushed rows and nobody else's uncommitted ones. With
    /// `auto_flush` on, pending changes are flushed first.
    pub async fn count_elements<E: Entity>(
        &mut self,
        cx: &Cx,
        id: OwnerId,
        collection: &str,
    ) -> Outcome<u64, Error> {
        match self.ensure_transaction(cx).await {
            Outcome::Ok(()) => {}
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        }

        if self.config.auto_flush {
            match self.flush(cx).await {
                Outcome::Ok(_) => {}
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            }
        }

        let registry = Arc::clone(&self.registry);
        let persister = match registry
            .require(E::TABLE_NAME)
            .and_then(|entity| {
                entity
                    .collection(collection)
                    .ok_or_else(|| missing_collection(E::TABLE_NAME, collection))
            }) {
            Ok(p) => p,
            Err(e) => return Outcome::Err(e),
        };
        persister.count_elements(cx, &self.storage, id).await
    }

    /// Counts of entities with pending writes.
    pub fn pending_counts(&self) -> PendingCounts {
        let mut counts = PendingCounts::default();
        for tracked in self.identity_map.values() {
            match tracked.state {
                EntityState::New => counts.new += 1,
                EntityState::Deleted => counts.deleted += 1,
                EntityState::Persistent => {
                    if tracked.has_dirty_collections() {
                        counts.dirty += 1;
                    }
                }
            }
        }
        counts
    }

    // ========================================================================
    // Transaction Management
    // ========================================================================

    /// Begin a transaction.
    pub async fn begin(&mut self, cx: &Cx) -> Outcome<(), Error> {
        if self.in_transaction {
            return Outcome::Ok(());
        }

        match self.storage.begin(cx).await {
            Outcome::Ok(()) => {
                self.in_transaction = true;
                tracing::debug!("Transaction started");
                Outcome::Ok(())
            }
            Outcome::Err(e) => Outcome::Err(e),
            Outcome::Cancelled(r) => Outcome::Cancelled(r),
            Outcome::Panicked(p) => Outcome::Panicked(p),
        }
    }

    /// Begin a transaction scoped to the returned guard.
    ///
    /// The guard must be finished with [`UnitOfWork::commit`] or
    /// [`UnitOfWork::rollback`]; dropping it discards all writes.
    pub async fn transaction(&mut self, cx: &Cx) -> Outcome<UnitOfWork<'_, S>, Error> {
        if self.in_transaction {
            return Outcome::Err(Error::Transaction(TransactionError {
                kind: TransactionErrorKind::AlreadyActive,
                message: "a transaction is already open on this session".to_string(),
            }));
        }
        match self.begin(cx).await {
            Outcome::Ok(()) => Outcome::Ok(UnitOfWork::new(self)),
            Outcome::Err(e) => Outcome::Err(e),
            Outcome::Cancelled(r) => Outcome::Cancelled(r),
            Outcome::Panicked(p) => Outcome::Panicked(p),
        }
    }

    async fn ensure_transaction(&mut self, cx: &Cx) -> Outcome<(), Error> {
        if self.in_transaction {
            return Outcome::Ok(());
        }
        if !self.config.auto_begin {
            return Outcome::Err(Error::Transaction(TransactionError {
                kind: TransactionErrorKind::NotActive,
                message: "no transaction open and auto_begin is off".to_string(),
            }));
        }
        self.begin(cx).await
    }

    /// Flush pending changes to storage.
    ///
    /// Writes owner rows and changed collection rows but does NOT commit.
    /// Entities are processed in the order they were first tracked.
    #[tracing::instrument(level = "info", skip(self, cx))]
    pub async fn flush(&mut self, cx: &Cx) -> Outcome<FlushResult, Error> {
        // Fire before_flush event
        if let Err(e) = self.event_callbacks.fire(SessionEvent::BeforeFlush) {
            return Outcome::Err(e);
        }

        match self.ensure_transaction(cx).await {
            Outcome::Ok(()) => {}
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        }

        let registry = Arc::clone(&self.registry);
        let keys: Vec<EntityKey> = self.identity_map.keys().copied().collect();
        let mut result = FlushResult::new();

        for key in keys {
            if let Some(reason) = cx.cancel_reason() {
                return Outcome::Cancelled(reason);
            }
            let persister = match registry.require(key.table()) {
                Ok(p) => p,
                Err(e) => return Outcome::Err(e),
            };
            let Some(state) = self.identity_map.state(&key) else {
                continue;
            };

            match state {
                EntityState::Deleted => {
                    for collection in persister.collections() {
                        match collection.remove_all(cx, &self.storage, key.id()).await {
                            Outcome::Ok(n) => result.deleted += usize::try_from(n).unwrap_or(usize::MAX),
                            Outcome::Err(e) => return Outcome::Err(e),
                            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                            Outcome::Panicked(p) => return Outcome::Panicked(p),
                        }
                    }
                    match self
                        .storage
                        .delete_owner(cx, persister.mapping(), key.id())
                        .await
                    {
                        Outcome::Ok(0) => {
                            tracing::warn!(key = %key, "Owner row already gone");
                        }
                        Outcome::Ok(_) => {}
                        Outcome::Err(e) => return Outcome::Err(e),
                        Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                        Outcome::Panicked(p) => return Outcome::Panicked(p),
                    }
                    self.identity_map.remove(&key);
                    continue;
                }
                EntityState::New => {
                    match self
                        .storage
                        .insert_owner(cx, persister.mapping(), key.id())
                        .await
                    {
                        Outcome::Ok(_) => {}
                        Outcome::Err(e) => return Outcome::Err(e),
                        Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                        Outcome::Panicked(p) => return Outcome::Panicked(p),
                    }
                }
                EntityState::Persistent => {}
            }

            let Some(tracked) = self.identity_map.tracked_mut(&key) else {
                continue;
            };
            for collection in persister.collections() {
                let name = collection.mapping().name.as_str();
                let Some(bag) = tracked.entity.collection_mut(name) else {
                    return Outcome::Err(missing_collection(key.table(), name));
                };
                let empty = CollectionSnapshot::empty();
                let snapshot = tracked.snapshots.get(name).unwrap_or(&empty);
                match collection
                    .flush(cx, &self.storage, key.id(), bag, snapshot)
                    .await
                {
                    Outcome::Ok((snapshot, written)) => {
                        tracked.snapshots.insert(name.to_string(), snapshot);
                        result.merge(written);
                    }
                    Outcome::Err(e) => return Outcome::Err(e),
                    Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                    Outcome::Panicked(p) => return Outcome::Panicked(p),
                }
            }
            tracked.state = EntityState::Persistent;
        }

        tracing::info!(
            inserted = result.inserted,
            updated = result.updated,
            deleted = result.deleted,
            "Flush complete"
        );

        // Fire after_flush event
        if let Err(e) = self.event_callbacks.fire(SessionEvent::AfterFlush) {
            return Outcome::Err(e);
        }

        Outcome::Ok(result)
    }

    /// Flush and commit the current transaction.
    pub async fn commit(&mut self, cx: &Cx) -> Outcome<(), Error> {
        // Flush any pending changes first
        match self.flush(cx).await {
            Outcome::Ok(_) => {}
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        }

        // Fire before_commit event (can abort)
        if let Err(e) = self.event_callbacks.fire(SessionEvent::BeforeCommit) {
            return Outcome::Err(e);
        }

        if self.in_transaction {
            match self.storage.commit(cx).await {
                Outcome::Ok(()) => {
                    self.in_transaction = false;
                }
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            }
        }

        if self.config.expire_on_commit {
            self.identity_map.clear();
        }
        tracing::debug!("Transaction committed");

        // Fire after_commit event
        if let Err(e) = self.event_callbacks.fire(SessionEvent::AfterCommit) {
            return Outcome::Err(e);
        }

        Outcome::Ok(())
    }

    /// Rollback the current transaction.
    ///
    /// Tracked entities are dropped along with their unflushed changes.
    pub async fn rollback(&mut self, cx: &Cx) -> Outcome<(), Error> {
        self.identity_map.clear();

        if self.in_transaction {
            match self.storage.rollback(cx).await {
                Outcome::Ok(()) => {
                    self.in_transaction = false;
                }
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(r) => {
                    self.abandon();
                    return Outcome::Cancelled(r);
                }
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            }
        }
        tracing::debug!("Transaction rolled back");

        // Fire after_rollback event
        if let Err(e) = self.event_callbacks.fire(SessionEvent::AfterRollback) {
            return Outcome::Err(e);
        }

        Outcome::Ok(())
    }

    /// Discard the open transaction and all tracked state without awaiting.
    pub fn abandon(&mut self) {
        if self.in_transaction {
            tracing::warn!("Abandoning open transaction");
            self.storage.abandon();
            self.in_transaction = false;
        }
        self.identity_map.clear();
    }
}

fn missing_collection(table: &str, name: &str) -> Error {
    Error::config(format!("entity '{table}' has no collection '{name}'"))
}

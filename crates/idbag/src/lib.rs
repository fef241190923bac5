//! idbag - identifier-bag collections for Rust.
//!
//! An *id-bag* is a collection-valued entity attribute whose rows are told
//! apart by a synthetic row id rather than by their element. Elements may be
//! duplicated and may be null. idbag provides:
//!
//! - [`ManagedCollection`], the in-memory bag with per-entry row identity
//! - [`CollectionPersister`], which diffs a bag against its snapshot and
//!   writes only the changed rows
//! - pluggable row id generation ([`RowIdGenerator`])
//! - a small [`Session`] with identity map and scoped [`UnitOfWork`]s
//! - [`MemoryStorage`], a transactional in-memory [`StorageAdapter`]
//!
//! # Quick Start
//!
//! ```ignore
//! use idbag::prelude::*;
//!
//! struct AnEntity {
//!     id: Option<i64>,
//!     a_collection: ManagedCollection,
//! }
//!
//! impl Entity for AnEntity {
//!     const TABLE_NAME: &'static str = "AnEntity";
//!     // id / set_id / instantiate / collection / collection_mut
//! }
//!
//! async fn example(cx: &Cx) -> Outcome<(), Error> {
//!     let registry = MappingRegistry::from_mappings([EntityMapping::new("AnEntity")
//!         .collection(CollectionMapping::new("AnEntity", "aCollection"))])?;
//!     let factory = SessionFactory::new(MemoryStorage::new(), registry);
//!     let mut session = factory.open_session();
//!
//!     let mut tx = session.transaction(cx).await?;
//!     let entity = AnEntity {
//!         id: None,
//!         a_collection: ManagedCollection::from_elements([Value::from("def"), Value::Null]),
//!     };
//!     let id = tx.persist(cx, entity).await?;
//!     tx.commit(cx).await?;
//!
//!     // The null element was never written; only "def" comes back.
//!     let mut tx = session.transaction(cx).await?;
//!     assert_eq!(tx.find::<AnEntity>(cx, id).await?.a_collection.size(), 1);
//!     tx.commit(cx).await
//! }
//! ```
//!
//! # Null elements
//!
//! Each collection mapping carries a [`NullElementPolicy`]. The default never
//! stores a null: adding one writes no row, and replacing a stored element
//! with null deletes its row. [`NullElementPolicy::store_nulls`] writes nulls
//! like any other value. The two halves ([`NullInsert`], [`NullUpdate`]) can
//! be mixed; an entry whose row was deleted for turning null stays rowless
//! until it is given a value again, even when new nulls are stored.

// Re-export all public types from sub-crates
pub use idbag_core::{
    // asupersync re-exports
    Cx,
    Outcome,
    // Core types
    CollectionError,
    CollectionErrorKind,
    CollectionMapping,
    CollectionRow,
    ConfigError,
    EntityMapping,
    Error,
    IdStrategy,
    NullElementPolicy,
    NullInsert,
    NullUpdate,
    OwnerId,
    Result,
    RowId,
    StorageAdapter,
    StorageError,
    StorageErrorKind,
    TransactionError,
    TransactionErrorKind,
    Value,
};

pub use idbag_session::{
    CollectionDiff, CollectionFlushPlan, CollectionPersister, CollectionSnapshot,
    CounterGenerator, Entity, EntityKey, EntityPersister, EntityState, FlushResult, IdentityMap,
    IncrementGenerator, LoadedCollection, ManagedCollection, MappingRegistry,
    MappingRegistryBuilder, PendingCounts, RowIdGenerator, RowOp, RowState, Session,
    SessionConfig, SessionEvent, SessionFactory, UnitOfWork, generator_for,
};

pub use idbag_memory::{MemoryStorage, StorageStats};

/// Prelude module for convenient imports.
///
/// ```ignore
/// use idbag::prelude::*;
/// ```
pub mod prelude {
    pub use crate::{
        // Mapping
        CollectionMapping,
        // asupersync
        Cx,
        // Entities and collections
        Entity,
        EntityMapping,
        Error,
        IdStrategy,
        ManagedCollection,
        MappingRegistry,
        // Storage
        MemoryStorage,
        NullElementPolicy,
        NullInsert,
        NullUpdate,
        Outcome,
        OwnerId,
        Result,
        RowId,
        // Session
        Session,
        SessionConfig,
        SessionFactory,
        StorageAdapter,
        UnitOfWork,
        Value,
    };
}

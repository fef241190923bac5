//! Identity map: one in-memory instance per `(table, id)` within a session.
//!
//! Entities of different types share one map, stored type-erased and
//! recovered with a downcast on access. Alongside each entity the map keeps
//! the snapshot of every mapped collection, which is what flush diffs
//! against.
//!
//! Iteration follows insertion order so flushes are deterministic.

use crate::entity::{Entity, ErasedEntity};
use crate::snapshot::CollectionSnapshot;
use idbag_core::OwnerId;
use std::collections::HashMap;
use std::fmt;

/// Unique key for an entity in the identity map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EntityKey {
    table: &'static str,
    id: OwnerId,
}

impl EntityKey {
    /// Key for entity type `E` with `id`.
    pub fn of<E: Entity>(id: OwnerId) -> Self {
        Self {
            table: E::TABLE_NAME,
            id,
        }
    }

    pub fn table(&self) -> &'static str {
        self.table
    }

    pub fn id(&self) -> OwnerId {
        self.id
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.table, self.id)
    }
}

/// Lifecycle state of a tracked entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityState {
    /// Persisted in this session; owner row not yet written.
    New,
    /// Owner row exists in storage.
    Persistent,
    /// Marked for deletion; removed on flush.
    Deleted,
}

pub(crate) struct TrackedEntity {
    pub(crate) entity: Box<dyn ErasedEntity>,
    pub(crate) state: EntityState,
    /// Last persisted state per collection attribute.
    pub(crate) snapshots: HashMap<String, CollectionSnapshot>,
}

impl TrackedEntity {
    pub(crate) fn new<E: Entity>(entity: E, state: EntityState) -> Self {
        Self {
            entity: Box::new(entity),
            state,
            snapshots: HashMap::new(),
        }
    }

    /// Whether any tracked collection changed since its snapshot.
    pub(crate) fn has_dirty_collections(&self) -> bool {
        self.snapshots.keys().any(|name| {
            self.entity
                .collection(name)
                .is_some_and(|collection| collection.is_dirty())
        })
    }
}

/// Session-scoped cache of tracked entities.
#[derive(Default)]
pub struct IdentityMap {
    entries: HashMap<EntityKey, TrackedEntity>,
    order: Vec<EntityKey>,
}

impl IdentityMap {
    /// Create a new empty identity map.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, key: &EntityKey) -> bool {
        self.entries.contains_key(key)
    }

    pub fn state(&self, key: &EntityKey) -> Option<EntityState> {
        self.entries.get(key).map(|tracked| tracked.state)
    }

    /// Typed access to a tracked entity.
    pub fn get<E: Entity>(&self, id: OwnerId) -> Option<&E> {
        self.entries
            .get(&EntityKey::of::<E>(id))
            .and_then(|tracked| tracked.entity.as_any().downcast_ref::<E>())
    }

    /// Typed mutable access to a tracked entity.
    pub fn get_mut<E: Entity>(&mut self, id: OwnerId) -> Option<&mut E> {
        self.entries
            .get_mut(&EntityKey::of::<E>(id))
            .and_then(|tracked| tracked.entity.as_any_mut().downcast_mut::<E>())
    }

    /// Snapshot of `collection` as last persisted for `key`.
    pub fn snapshot(&self, key: &EntityKey, collection: &str) -> Option<&CollectionSnapshot> {
        self.entries
            .get(key)
            .and_then(|tracked| tracked.snapshots.get(collection))
    }

    /// Keys in insertion order.
    pub fn keys(&self) -> impl Iterator<Item = &EntityKey> {
        self.order.iter()
    }

    /// Remove all entries.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.order.clear();
    }

    pub(crate) fn insert(&mut self, key: EntityKey, tracked: TrackedEntity) {
        if self.entries.insert(key, tracked).is_none() {
            self.order.push(key);
        }
    }

    pub(crate) fn tracked_mut(&mut self, key: &EntityKey) -> Option<&mut TrackedEntity> {
        self.entries.get_mut(key)
    }

    pub(crate) fn remove(&mut self, key: &EntityKey) -> Option<TrackedEntity> {
        let removed = self.entries.remove(key);
        if removed.is_some() {
            self.order.retain(|k| k != key);
        }
        removed
    }

    pub(crate) fn values(&self) -> impl Iterator<Item = &TrackedEntity> {
        self.entries.values()
    }
}

impl fmt::Debug for IdentityMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdentityMap")
            .field("len", &self.entries.len())
            .field("keys", &self.order)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collection::ManagedCollection;

    struct Owner {
        id: Option<OwnerId>,
        tags: ManagedCollection,
    }

    impl Entity for Owner {
        const TABLE_NAME: &'static str = "Owner";

        fn id(&self) -> Option<OwnerId> {
            self.id
        }

        fn set_id(&mut self, id: OwnerId) {
            self.id = Some(id);
        }

        fn instantiate(id: OwnerId) -> Self {
            Self {
                id: Some(id),
                tags: ManagedCollection::new(),
            }
        }

        fn collection(&self, name: &str) -> Option<&ManagedCollection> {
            (name == "tags").then_some(&self.tags)
        }

        fn collection_mut(&mut self, name: &str) -> Option<&mut ManagedCollection> {
            (name == "tags").then_some(&mut self.tags)
        }
    }

    struct Other;

    impl Entity for Other {
        const TABLE_NAME: &'static str = "Other";

        fn id(&self) -> Option<OwnerId> {
            None
        }

        fn set_id(&mut self, _id: OwnerId) {}

        fn instantiate(_id: OwnerId) -> Self {
            Other
        }

        fn collection(&self, _name: &str) -> Option<&ManagedCollection> {
            None
        }

        fn collection_mut(&mut self, _name: &str) -> Option<&mut ManagedCollection> {
            None
        }
    }

    #[test]
    fn typed_lookup_by_key() {
        let mut map = IdentityMap::new();
        let key = EntityKey::of::<Owner>(1);
        map.insert(key, TrackedEntity::new(Owner::instantiate(1), EntityState::Persistent));

        assert!(map.contains(&key));
        assert_eq!(map.state(&key), Some(EntityState::Persistent));
        assert_eq!(map.get::<Owner>(1).and_then(Entity::id), Some(1));
        assert!(map.get::<Owner>(2).is_none());
        assert!(map.get::<Other>(1).is_none());
        assert_eq!(key.to_string(), "Owner#1");
    }

    #[test]
    fn mutations_are_visible_through_the_map() {
        let mut map = IdentityMap::new();
        let key = EntityKey::of::<Owner>(1);
        let mut tracked = TrackedEntity::new(Owner::instantiate(1), EntityState::Persistent);
        tracked
            .snapshots
            .insert("tags".to_string(), CollectionSnapshot::empty());
        map.insert(key, tracked);

        assert!(!map.tracked_mut(&key).unwrap().has_dirty_collections());
        map.get_mut::<Owner>(1).unwrap().tags.add("x");
        assert_eq!(map.get::<Owner>(1).unwrap().tags.size(), 1);
        assert!(map.tracked_mut(&key).unwrap().has_dirty_collections());
    }

    #[test]
    fn keys_keep_insertion_order() {
        let mut map = IdentityMap::new();
        for id in [3, 1, 2] {
            map.insert(
                EntityKey::of::<Owner>(id),
                TrackedEntity::new(Owner::instantiate(id), EntityState::New),
            );
        }
        let ids: Vec<_> = map.keys().map(EntityKey::id).collect();
        assert_eq!(ids, vec![3, 1, 2]);

        map.remove(&EntityKey::of::<Owner>(1));
        let ids: Vec<_> = map.keys().map(EntityKey::id).collect();
        assert_eq!(ids, vec![3, 2]);

        map.clear();
        assert!(map.is_empty());
    }
}

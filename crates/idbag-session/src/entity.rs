//! Entities that own id-bag collections.

use crate::collection::ManagedCollection;
use idbag_core::OwnerId;
use std::any::Any;

/// A persistable owner of one or more id-bag attributes.
///
/// Implementations expose their collections by attribute name; the names
/// must match the [`CollectionMapping::name`](idbag_core::CollectionMapping)
/// entries registered for [`TABLE_NAME`](Self::TABLE_NAME).
///
/// ```ignore
/// struct AnEntity {
///     id: Option<i64>,
///     a_collection: ManagedCollection,
/// }
///
/// impl Entity for AnEntity {
///     const TABLE_NAME: &'static str = "AnEntity";
///
///     fn id(&self) -> Option<i64> { self.id }
///     fn set_id(&mut self, id: i64) { self.id = Some(id); }
///     fn instantiate(id: i64) -> Self {
///         Self { id: Some(id), a_collection: ManagedCollection::new() }
///     }
///     fn collection(&self, name: &str) -> Option<&ManagedCollection> {
///         (name == "aCollection").then_some(&self.a_collection)
///     }
///     fn collection_mut(&mut self, name: &str) -> Option<&mut ManagedCollection> {
///         (name == "aCollection").then_some(&mut self.a_collection)
///     }
/// }
/// ```
pub trait Entity: Send + Sync + 'static {
    /// Entity table, used to look up the mapping.
    const TABLE_NAME: &'static str;

    /// Identifier, `None` until persisted.
    fn id(&self) -> Option<OwnerId>;

    /// Assign the generated identifier.
    fn set_id(&mut self, id: OwnerId);

    /// Empty instance used when loading; the session fills in its collections.
    fn instantiate(id: OwnerId) -> Self;

    fn collection(&self, name: &str) -> Option<&ManagedCollection>;

    fn collection_mut(&mut self, name: &str) -> Option<&mut ManagedCollection>;
}

/// Object-safe view of an [`Entity`] for the identity map.
pub(crate) trait ErasedEntity: Send + Sync {
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
    fn collection(&self, name: &str) -> Option<&ManagedCollection>;
    fn collection_mut(&mut self, name: &str) -> Option<&mut ManagedCollection>;
}

impl<E: Entity> ErasedEntity for E {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn collection(&self, name: &str) -> Option<&ManagedCollection> {
        Entity::collection(self, name)
    }

    fn collection_mut(&mut self, name: &str) -> Option<&mut ManagedCollection> {
        Entity::collection_mut(self, name)
    }
}

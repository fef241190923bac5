#![allow(dead_code)]

use asupersync::runtime::RuntimeBuilder;
use asupersync::{Cx, Outcome};
use idbag::prelude::*;

pub const COLLECTION: &str = "aCollection";

/// Run `future` to completion on a fresh single-threaded runtime.
pub fn block_on<F: Future>(future: F) -> F::Output {
    RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime")
        .block_on(future)
}

pub fn cx() -> Cx {
    Cx::for_testing()
}

pub fn unwrap_outcome<T>(outcome: Outcome<T, Error>) -> T {
    match outcome {
        Outcome::Ok(value) => value,
        Outcome::Err(err) => panic!("unexpected error: {err}"),
        Outcome::Cancelled(reason) => panic!("cancelled: {reason:?}"),
        Outcome::Panicked(payload) => panic!("panicked: {payload:?}"),
    }
}

/// Entity owning one id-bag of nullable strings.
#[derive(Debug)]
pub struct AnEntity {
    pub id: Option<OwnerId>,
    pub a_collection: ManagedCollection,
}

impl AnEntity {
    pub fn with(elements: impl IntoIterator<Item = Option<&'static str>>) -> Self {
        Self {
            id: None,
            a_collection: ManagedCollection::from_elements(elements.into_iter().map(text)),
        }
    }
}

impl Entity for AnEntity {
    const TABLE_NAME: &'static str = "AnEntity";

    fn id(&self) -> Option<OwnerId> {
        self.id
    }

    fn set_id(&mut self, id: OwnerId) {
        self.id = Some(id);
    }

    fn instantiate(id: OwnerId) -> Self {
        Self {
            id: Some(id),
            a_collection: ManagedCollection::new(),
        }
    }

    fn collection(&self, name: &str) -> Option<&ManagedCollection> {
        (name == COLLECTION).then_some(&self.a_collection)
    }

    fn collection_mut(&mut self, name: &str) -> Option<&mut ManagedCollection> {
        (name == COLLECTION).then_some(&mut self.a_collection)
    }
}

pub fn text(element: Option<&str>) -> Value {
    element.map_or(Value::Null, Value::from)
}

pub fn mapping(policy: NullElementPolicy) -> EntityMapping {
    EntityMapping::new(AnEntity::TABLE_NAME)
        .collection(CollectionMapping::new(AnEntity::TABLE_NAME, COLLECTION).null_policy(policy))
}

pub fn factory_with(storage: MemoryStorage, policy: NullElementPolicy) -> SessionFactory<MemoryStorage> {
    let registry = MappingRegistry::from_mappings([mapping(policy)]).expect("valid mapping");
    SessionFactory::new(storage, registry)
}

pub fn factory() -> SessionFactory<MemoryStorage> {
    factory_with(MemoryStorage::new(), NullElementPolicy::default())
}

pub fn collection_mapping(factory: &SessionFactory<MemoryStorage>) -> CollectionMapping {
    factory
        .registry()
        .collection_mapping(AnEntity::TABLE_NAME, COLLECTION)
        .cloned()
        .expect("collection is mapped")
}

/// Stored elements of `owner`, in storage order.
pub fn stored(factory: &SessionFactory<MemoryStorage>, owner: OwnerId) -> Vec<Value> {
    factory
        .storage()
        .rows(&collection_mapping(factory), owner)
        .into_iter()
        .map(|row| row.element)
        .collect()
}

/// Persist `entity` in its own transaction and return its id.
pub async fn persist_committed(
    cx: &Cx,
    session: &mut Session<MemoryStorage>,
    entity: AnEntity,
) -> OwnerId {
    let mut tx = unwrap_outcome(session.transaction(cx).await);
    let id = unwrap_outcome(tx.persist(cx, entity).await);
    unwrap_outcome(tx.commit(cx).await);
    id
}

/// Load `id` in a fresh transaction and return a copy of its elements.
pub async fn reload(cx: &Cx, session: &mut Session<MemoryStorage>, id: OwnerId) -> Vec<Value> {
    let mut tx = unwrap_outcome(session.transaction(cx).await);
    let elements = unwrap_outcome(tx.find::<AnEntity>(cx, id).await)
        .a_collection
        .to_vec();
    unwrap_outcome(tx.commit(cx).await);
    elements
}

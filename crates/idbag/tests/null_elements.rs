//! Null elements in id-bag collections under both null policies.

mod common;

use common::{
    AnEntity, COLLECTION, block_on, cx, factory, factory_with, persist_committed, reload, stored,
    text, unwrap_outcome,
};
use idbag::prelude::*;

#[test]
fn persist_with_null_element_writes_no_row() {
    let cx = cx();
    let factory = factory();
    let mut session = factory.open_session();

    block_on(async {
        let id = persist_committed(&cx, &mut session, AnEntity::with([None])).await;

        assert!(stored(&factory, id).is_empty());
        assert_eq!(factory.storage().owner_count("AnEntity"), 1);
        assert!(reload(&cx, &mut session, id).await.is_empty());
    });
}

#[test]
fn add_null_to_existing_collection_writes_no_row() {
    let cx = cx();
    let factory = factory();
    let mut session = factory.open_session();

    block_on(async {
        let id = persist_committed(&cx, &mut session, AnEntity::with([])).await;

        let mut tx = unwrap_outcome(session.transaction(&cx).await);
        let entity = unwrap_outcome(tx.find::<AnEntity>(&cx, id).await);
        entity.a_collection.add(Value::Null);
        assert_eq!(entity.a_collection.size(), 1);
        unwrap_outcome(tx.commit(&cx).await);

        assert!(stored(&factory, id).is_empty());
        assert!(reload(&cx, &mut session, id).await.is_empty());
    });
}

#[test]
fn update_to_null_deletes_the_row() {
    let cx = cx();
    let factory = factory();
    let mut session = factory.open_session();

    block_on(async {
        let id = persist_committed(&cx, &mut session, AnEntity::with([Some("def")])).await;
        assert_eq!(stored(&factory, id), vec![Value::from("def")]);

        let mut tx = unwrap_outcome(session.transaction(&cx).await);
        let entity = unwrap_outcome(tx.find::<AnEntity>(&cx, id).await);
        let previous = entity.a_collection.set(0, Value::Null).unwrap();
        assert_eq!(previous, Value::from("def"));
        unwrap_outcome(tx.commit(&cx).await);

        assert!(stored(&factory, id).is_empty());
        assert!(reload(&cx, &mut session, id).await.is_empty());
    });
}

#[test]
fn update_one_of_two_to_null_keeps_the_other() {
    let cx = cx();
    let factory = factory();
    let mut session = factory.open_session();

    block_on(async {
        let id = persist_committed(
            &cx,
            &mut session,
            AnEntity::with([Some("def"), Some("ghi")]),
        )
        .await;

        let mut tx = unwrap_outcome(session.transaction(&cx).await);
        let entity = unwrap_outcome(tx.find::<AnEntity>(&cx, id).await);
        assert_eq!(entity.a_collection.size(), 2);
        let ghi_row = entity.a_collection.row_id(1);
        entity.a_collection.set(0, Value::Null).unwrap();
        unwrap_outcome(tx.commit(&cx).await);

        let reloaded = reload(&cx, &mut session, id).await;
        assert_eq!(reloaded, vec![Value::from("ghi")]);

        let rows = factory
            .storage()
            .rows(&common::collection_mapping(&factory), id);
        assert_eq!(rows.len(), 1);
        assert_eq!(Some(rows[0].row_id), ghi_row);
    });
}

#[test]
fn nulls_are_not_counted_as_elements() {
    let cx = cx();
    let factory = factory();
    let mut session = factory.open_session();

    block_on(async {
        let id = persist_committed(
            &cx,
            &mut session,
            AnEntity::with([Some("a"), None, Some("b"), None]),
        )
        .await;

        let mut tx = unwrap_outcome(session.transaction(&cx).await);
        let count = unwrap_outcome(
            tx.count_elements::<AnEntity>(&cx, id, COLLECTION)
                .await,
        );
        assert_eq!(count, 2);
        unwrap_outcome(tx.commit(&cx).await);
    });
}

#[test]
fn store_policy_keeps_null_rows() {
    let cx = cx();
    let factory = factory_with(MemoryStorage::new(), NullElementPolicy::store_nulls());
    let mut session = factory.open_session();

    block_on(async {
        let id = persist_committed(&cx, &mut session, AnEntity::with([None, Some("def")])).await;
        assert_eq!(stored(&factory, id), vec![Value::Null, Value::from("def")]);

        let mut tx = unwrap_outcome(session.transaction(&cx).await);
        let entity = unwrap_outcome(tx.find::<AnEntity>(&cx, id).await);
        let def_row = entity.a_collection.row_id(1);
        entity.a_collection.set(1, Value::Null).unwrap();
        unwrap_outcome(tx.commit(&cx).await);

        // The row survives with its id; only the element changed.
        let rows = factory
            .storage()
            .rows(&common::collection_mapping(&factory), id);
        assert_eq!(rows.len(), 2);
        assert_eq!(Some(rows[1].row_id), def_row);
        assert!(rows.iter().all(|row| row.element.is_null()));

        assert_eq!(reload(&cx, &mut session, id).await, vec![Value::Null, Value::Null]);

        let mut tx = unwrap_outcome(session.transaction(&cx).await);
        let count = unwrap_outcome(
            tx.count_elements::<AnEntity>(&cx, id, COLLECTION)
                .await,
        );
        assert_eq!(count, 0);
        unwrap_outcome(tx.commit(&cx).await);
    });
}

#[test]
fn null_then_value_in_one_transaction_writes_one_row() {
    let cx = cx();
    let factory = factory();
    let mut session = factory.open_session();

    block_on(async {
        let id = persist_committed(&cx, &mut session, AnEntity::with([])).await;
        factory.storage().reset_stats();

        let mut tx = unwrap_outcome(session.transaction(&cx).await);
        let entity = unwrap_outcome(tx.find::<AnEntity>(&cx, id).await);
        entity.a_collection.add(Value::Null);
        entity.a_collection.set(0, text(Some("late"))).unwrap();
        unwrap_outcome(tx.commit(&cx).await);

        assert_eq!(factory.storage().stats().inserts, 1);
        assert_eq!(stored(&factory, id), vec![Value::from("late")]);
    });
}

#[test]
fn nulled_row_stays_deleted_when_new_nulls_are_stored() {
    let cx = cx();
    let policy = NullElementPolicy {
        on_insert: NullInsert::Store,
        on_update: NullUpdate::DeleteRow,
    };
    let factory = factory_with(MemoryStorage::new(), policy);
    let mut session = factory.open_session();

    block_on(async {
        let id = persist_committed(&cx, &mut session, AnEntity::with([Some("def"), None])).await;
        assert_eq!(stored(&factory, id), vec![Value::from("def"), Value::Null]);

        let mut tx = unwrap_outcome(session.transaction(&cx).await);
        let entity = unwrap_outcome(tx.find::<AnEntity>(&cx, id).await);
        entity.a_collection.set(0, Value::Null).unwrap();
        let first = unwrap_outcome(tx.flush(&cx).await);
        assert_eq!(first.deleted, 1);
        assert_eq!(first.inserted, 0);

        let second = unwrap_outcome(tx.flush(&cx).await);
        assert_eq!(second.total(), 0);
        unwrap_outcome(tx.commit(&cx).await);

        assert_eq!(stored(&factory, id), vec![Value::Null]);
        assert_eq!(reload(&cx, &mut session, id).await, vec![Value::Null]);
    });
}

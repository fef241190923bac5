//! Atomicity of collection writes across storage failures and deletes.

mod common;

use common::{
    AnEntity, block_on, cx, factory, persist_committed, reload, stored, unwrap_outcome,
};
use idbag::EntityState;
use idbag::prelude::*;

#[test]
fn storage_failure_mid_flush_commits_nothing() {
    let cx = cx();
    let factory = factory();
    let mut session = factory.open_session();

    block_on(async {
        let id = persist_committed(&cx, &mut session, AnEntity::with([Some("a"), Some("b")])).await;

        let mut tx = unwrap_outcome(session.transaction(&cx).await);
        let entity = unwrap_outcome(tx.find::<AnEntity>(&cx, id).await);
        entity.a_collection.set(0, Value::Null).unwrap();
        entity.a_collection.set(1, "B").unwrap();
        entity.a_collection.add("c");

        // The delete goes through, the update is rejected.
        factory.storage().fail_writes_after(1);
        match tx.commit(&cx).await {
            Outcome::Err(err) => assert!(err.is_storage_failure()),
            other => panic!("expected storage failure, got {other:?}"),
        }
        factory.storage().clear_faults();

        assert!(!session.in_transaction());
        assert!(session.identity_map().is_empty());
        assert_eq!(stored(&factory, id), vec![Value::from("a"), Value::from("b")]);
        assert_eq!(
            reload(&cx, &mut session, id).await,
            vec![Value::from("a"), Value::from("b")]
        );
    });
}

#[test]
fn rejected_new_entity_leaves_no_rows() {
    let cx = cx();
    let factory = factory();
    let mut session = factory.open_session();
    factory.storage().fail_all_writes();

    block_on(async {
        let mut tx = unwrap_outcome(session.transaction(&cx).await);
        let id = unwrap_outcome(tx.persist(&cx, AnEntity::with([Some("a")])).await);
        assert!(matches!(tx.commit(&cx).await, Outcome::Err(_)));

        factory.storage().clear_faults();
        assert_eq!(factory.storage().owner_count("AnEntity"), 0);
        assert!(stored(&factory, id).is_empty());
        assert_eq!(factory.storage().stats().rollbacks, 1);
    });
}

#[test]
fn deleting_the_owner_removes_its_rows() {
    let cx = cx();
    let factory = factory();
    let mut session = factory.open_session();

    block_on(async {
        let keep = persist_committed(&cx, &mut session, AnEntity::with([Some("k")])).await;
        let doomed = persist_committed(
            &cx,
            &mut session,
            AnEntity::with([Some("a"), Some("a"), None]),
        )
        .await;

        let mut tx = unwrap_outcome(session.transaction(&cx).await);
        unwrap_outcome(tx.find::<AnEntity>(&cx, doomed).await);
        tx.delete::<AnEntity>(doomed).unwrap();
        assert_eq!(tx.entity_state::<AnEntity>(doomed), Some(EntityState::Deleted));
        assert!(!tx.contains::<AnEntity>(doomed));
        assert_eq!(tx.pending_counts().deleted, 1);
        unwrap_outcome(tx.commit(&cx).await);

        assert!(stored(&factory, doomed).is_empty());
        assert_eq!(stored(&factory, keep), vec![Value::from("k")]);
        assert_eq!(factory.storage().owner_count("AnEntity"), 1);

        let mut tx = unwrap_outcome(session.transaction(&cx).await);
        assert!(unwrap_outcome(tx.get::<AnEntity>(&cx, doomed).await).is_none());
        match tx.find::<AnEntity>(&cx, doomed).await {
            Outcome::Err(Error::EntityNotFound { id, .. }) => assert_eq!(id, doomed),
            other => panic!("expected not found, got {other:?}"),
        }
        unwrap_outcome(tx.rollback(&cx).await);
    });
}

#[test]
fn uncommitted_changes_are_invisible_to_storage_readers() {
    let cx = cx();
    let factory = factory();
    let mut session = factory.open_session();

    block_on(async {
        let id = persist_committed(&cx, &mut session, AnEntity::with([Some("a")])).await;

        let mut tx = unwrap_outcome(session.transaction(&cx).await);
        let entity = unwrap_outcome(tx.find::<AnEntity>(&cx, id).await);
        entity.a_collection.add("b");
        let flushed = unwrap_outcome(tx.flush(&cx).await);
        assert_eq!(flushed.inserted, 1);

        // Flushed but not committed.
        assert_eq!(stored(&factory, id), vec![Value::from("a")]);
        unwrap_outcome(tx.commit(&cx).await);
        assert_eq!(stored(&factory, id), vec![Value::from("a"), Value::from("b")]);
    });
}

//! Randomized edit sequences: storage always mirrors the in-memory bag.

mod common;

use common::{
    AnEntity, COLLECTION, block_on, collection_mapping, cx, factory_with, persist_committed,
    reload, text, unwrap_outcome,
};
use idbag::{
    ManagedCollection, MemoryStorage, NullElementPolicy, NullInsert, NullUpdate, RowId, Value,
};
use proptest::prelude::*;

#[derive(Debug, Clone)]
enum Edit {
    Add(Option<&'static str>),
    Set(usize, Option<&'static str>),
    Remove(usize),
}

fn arb_element() -> impl Strategy<Value = Option<&'static str>> {
    prop_oneof![
        Just(None),
        Just(Some("a")),
        Just(Some("b")),
        Just(Some("c")),
    ]
}

fn arb_edit() -> impl Strategy<Value = Edit> {
    prop_oneof![
        arb_element().prop_map(Edit::Add),
        (any::<usize>(), arb_element()).prop_map(|(i, e)| Edit::Set(i, e)),
        any::<usize>().prop_map(Edit::Remove),
    ]
}

fn arb_policy() -> impl Strategy<Value = NullElementPolicy> {
    (
        prop_oneof![Just(NullInsert::Skip), Just(NullInsert::Store)],
        prop_oneof![Just(NullUpdate::DeleteRow), Just(NullUpdate::Store)],
    )
        .prop_map(|(on_insert, on_update)| NullElementPolicy {
            on_insert,
            on_update,
        })
}

/// One bag entry as the model sees it: the current element and, for entries
/// loaded from storage, the element their row held.
#[derive(Debug, Clone)]
struct ModelEntry {
    element: Value,
    loaded: Option<Value>,
}

impl ModelEntry {
    fn new(element: Value) -> Self {
        Self {
            element,
            loaded: None,
        }
    }

    /// Whether the entry still has a row once the round is written.
    fn keeps_row(&self, policy: NullElementPolicy) -> bool {
        if !self.element.is_null() {
            return true;
        }
        match &self.loaded {
            None => policy.on_insert == NullInsert::Store,
            Some(loaded) => loaded.is_null() || policy.on_update == NullUpdate::Store,
        }
    }
}

/// The entries that survive a commit, as they will be loaded next round.
fn settle(model: &[ModelEntry], policy: NullElementPolicy) -> Vec<ModelEntry> {
    model
        .iter()
        .filter(|entry| entry.keeps_row(policy))
        .map(|entry| ModelEntry {
            element: entry.element.clone(),
            loaded: Some(entry.element.clone()),
        })
        .collect()
}

fn elements(model: &[ModelEntry]) -> Vec<Value> {
    model.iter().map(|entry| entry.element.clone()).collect()
}

/// Apply `edit` to both the managed bag and the plain model.
fn apply(edit: &Edit, bag: &mut ManagedCollection, model: &mut Vec<ModelEntry>) {
    match *edit {
        Edit::Add(element) => {
            bag.add(text(element));
            model.push(ModelEntry::new(text(element)));
        }
        Edit::Set(i, element) if !model.is_empty() => {
            let i = i % model.len();
            bag.set(i, text(element)).unwrap();
            model[i].element = text(element);
        }
        Edit::Remove(i) if !model.is_empty() => {
            let i = i % model.len();
            bag.remove(i).unwrap();
            model.remove(i);
        }
        Edit::Set(..) | Edit::Remove(_) => {}
    }
}

fn sorted(mut values: Vec<Value>) -> Vec<String> {
    values.sort_by_key(|v| format!("{v:?}"));
    values.into_iter().map(|v| format!("{v:?}")).collect()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn storage_mirrors_collection_after_random_edits(
        policy in arb_policy(),
        initial in prop::collection::vec(arb_element(), 0..5),
        rounds in prop::collection::vec(prop::collection::vec(arb_edit(), 0..8), 1..4),
    ) {
        let cx = cx();
        let factory = factory_with(MemoryStorage::new(), policy);
        let mapping = collection_mapping(&factory);
        let mut session = factory.open_session();

        block_on(async {
            let id = persist_committed(&cx, &mut session, AnEntity::with(initial.clone())).await;
            let fresh: Vec<ModelEntry> =
                initial.iter().copied().map(text).map(ModelEntry::new).collect();
            let mut model = settle(&fresh, policy);

            for edits in &rounds {
                let mut tx = unwrap_outcome(session.transaction(&cx).await);
                let entity = unwrap_outcome(tx.find::<AnEntity>(&cx, id).await);
                prop_assert_eq!(sorted(entity.a_collection.to_vec()), sorted(elements(&model)));

                for edit in edits {
                    apply(edit, &mut entity.a_collection, &mut model);
                }
                unwrap_outcome(tx.flush(&cx).await);
                // A second flush with no edits in between writes nothing.
                let again = unwrap_outcome(tx.flush(&cx).await);
                prop_assert_eq!(again.total(), 0);
                unwrap_outcome(tx.commit(&cx).await);
                model = settle(&model, policy);

                let rows = factory.storage().rows(&mapping, id);
                prop_assert_eq!(rows.len(), model.len());

                let mut ids: Vec<RowId> = rows.iter().map(|row| row.row_id).collect();
                ids.sort_unstable();
                ids.dedup();
                prop_assert_eq!(ids.len(), rows.len());
            }

            let reloaded = reload(&cx, &mut session, id).await;
            prop_assert_eq!(sorted(reloaded), sorted(elements(&model)));

            let mut tx = unwrap_outcome(session.transaction(&cx).await);
            let non_null = unwrap_outcome(
                tx.count_elements::<AnEntity>(&cx, id, COLLECTION)
                    .await,
            );
            unwrap_outcome(tx.commit(&cx).await);
            let expected = model.iter().filter(|entry| !entry.element.is_null()).count();
            prop_assert_eq!(non_null, u64::try_from(expected).unwrap());
            Ok(())
        })?;
    }
}

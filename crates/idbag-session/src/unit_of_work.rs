//! Scoped transactions.
//!
//! A [`UnitOfWork`] borrows a [`Session`] for the length of one transaction.
//! It ends in exactly one of three ways:
//!
//! - [`commit`](UnitOfWork::commit): flush and commit; on failure the
//!   transaction is rolled back and nothing becomes visible
//! - [`rollback`](UnitOfWork::rollback): discard all writes
//! - drop (early return, `?`, panic, cancelled task): staged writes are
//!   abandoned synchronously
//!
//! # Example
//!
//! ```ignore
//! let mut tx = session.transaction(&cx).await?;
//! let entity = tx.find::<AnEntity>(&cx, id).await?;
//! entity.a_collection.set(0, Value::Null)?;
//! tx.commit(&cx).await?;
//! ```

use crate::Session;
use asupersync::{Cx, Outcome};
use idbag_core::{Error, StorageAdapter};
use std::ops::{Deref, DerefMut};

/// One open transaction on a session.
pub struct UnitOfWork<'s, S: StorageAdapter> {
    session: &'s mut Session<S>,
    finished: bool,
}

impl<S: StorageAdapter> std::fmt::Debug for UnitOfWork<'_, S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnitOfWork")
            .field("finished", &self.finished)
            .finish_non_exhaustive()
    }
}

impl<'s, S: StorageAdapter> UnitOfWork<'s, S> {
    pub(crate) fn new(session: &'s mut Session<S>) -> Self {
        Self {
            session,
            finished: false,
        }
    }

    /// Flush and commit.
    ///
    /// If anything fails the transaction is rolled back before the error is
    /// returned.
    #[tracing::instrument(level = "debug", skip(self, cx))]
    pub async fn commit(mut self, cx: &Cx) -> Outcome<(), Error> {
        self.finished = true;
        match self.session.commit(cx).await {
            Outcome::Ok(()) => Outcome::Ok(()),
            Outcome::Err(e) => {
                tracing::warn!(error = %e, "Commit failed, rolling back");
                if let Outcome::Err(rollback_err) = self.session.rollback(cx).await {
                    tracing::warn!(error = %rollback_err, "Rollback after failed commit failed");
                    self.session.abandon();
                }
                Outcome::Err(e)
            }
            Outcome::Cancelled(r) => {
                self.session.abandon();
                Outcome::Cancelled(r)
            }
            Outcome::Panicked(p) => {
                self.session.abandon();
                Outcome::Panicked(p)
            }
        }
    }

    /// Discard every write made in this unit of work.
    pub async fn rollback(mut self, cx: &Cx) -> Outcome<(), Error> {
        self.finished = true;
        self.session.rollback(cx).await
    }
}

impl<S: StorageAdapter> Deref for UnitOfWork<'_, S> {
    type Target = Session<S>;

    fn deref(&self) -> &Self::Target {
        self.session
    }
}

impl<S: StorageAdapter> DerefMut for UnitOfWork<'_, S> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.session
    }
}

impl<S: StorageAdapter> Drop for UnitOfWork<'_, S> {
    fn drop(&mut self) {
        if !self.finished {
            tracing::warn!("Unit of work dropped without commit or rollback, discarding writes");
            self.session.abandon();
        }
    }
}

/// Count of pending changes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PendingCounts {
    /// Number of new entities pending INSERT.
    pub new: usize,
    /// Number of persistent entities with changed collections.
    pub dirty: usize,
    /// Number of entities pending DELETE.
    pub deleted: usize,
}

impl PendingCounts {
    /// Total number of pending changes.
    pub fn total(&self) -> usize {
        self.new + self.dirty + self.deleted
    }

    /// Check if there are no pending changes.
    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }
}

#[cfg(test)]
mod tests {
    use crate::{Entity, ManagedCollection, MappingRegistry, SessionFactory};
    use asupersync::runtime::RuntimeBuilder;
    use asupersync::{Cx, Outcome};
    use idbag_core::{CollectionMapping, EntityMapping, Error, OwnerId};
    use idbag_memory::MemoryStorage;

    fn unwrap_outcome<T: std::fmt::Debug>(outcome: Outcome<T, Error>) -> T {
        match outcome {
            Outcome::Ok(v) => v,
            other => std::panic::panic_any(format!("unexpected outcome: {other:?}")),
        }
    }

    struct Tagged {
        id: Option<OwnerId>,
        tags: ManagedCollection,
    }

    impl Entity for Tagged {
        const TABLE_NAME: &'static str = "Tagged";

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

    fn factory() -> SessionFactory<MemoryStorage> {
        let registry = MappingRegistry::from_mappings([
            EntityMapping::new("Tagged").collection(CollectionMapping::new("Tagged", "tags"))
        ])
        .unwrap();
        SessionFactory::new(MemoryStorage::new(), registry)
    }

    fn tagged(tags: &[&str]) -> Tagged {
        Tagged {
            id: None,
            tags: tags.iter().copied().collect(),
        }
    }

    #[test]
    fn commit_makes_writes_visible() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let factory = factory();
        let mapping = factory
            .registry()
            .collection_mapping("Tagged", "tags")
            .cloned()
            .unwrap();
        let mut session = factory.open_session();

        rt.block_on(async {
            let mut tx = unwrap_outcome(session.transaction(&cx).await);
            unwrap_outcome(tx.persist(&cx, tagged(&["a", "b"])).await);
            assert_eq!(tx.pending_counts().new, 1);
            unwrap_outcome(tx.commit(&cx).await);
        });

        assert!(!session.in_transaction());
        assert_eq!(factory.storage().row_count(&mapping, 1), 2);
    }

    #[test]
    fn dropped_unit_of_work_discards_writes() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let factory = factory();
        let mapping = factory
            .registry()
            .collection_mapping("Tagged", "tags")
            .cloned()
            .unwrap();
        let mut session = factory.open_session();

        rt.block_on(async {
            let mut tx = unwrap_outcome(session.transaction(&cx).await);
            unwrap_outcome(tx.persist(&cx, tagged(&["a"])).await);
            unwrap_outcome(tx.flush(&cx).await);
            drop(tx);
        });

        assert!(!session.in_transaction());
        assert!(session.identity_map().is_empty());
        assert_eq!(factory.storage().row_count(&mapping, 1), 0);
    }

    #[test]
    fn failed_commit_rolls_back() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let factory = factory();
        let mapping = factory
            .registry()
            .collection_mapping("Tagged", "tags")
            .cloned()
            .unwrap();
        let mut session = factory.open_session();

        rt.block_on(async {
            let mut tx = unwrap_outcome(session.transaction(&cx).await);
            unwrap_outcome(tx.persist(&cx, tagged(&["a", "b", "c"])).await);
            // owner row and first element succeed, second element fails
            factory.storage().fail_writes_after(2);
            match tx.commit(&cx).await {
                Outcome::Err(e) => assert!(e.is_storage_failure()),
                other => panic!("expected storage failure, got {other:?}"),
            }
        });

        factory.storage().clear_faults();
        assert!(!session.in_transaction());
        assert_eq!(factory.storage().row_count(&mapping, 1), 0);
        assert_eq!(factory.storage().owner_count("Tagged"), 0);
    }

    #[test]
    fn pending_counts_total() {
        let counts = super::PendingCounts {
            new: 1,
            dirty: 2,
            deleted: 0,
        };
        assert_eq!(counts.total(), 3);
        assert!(!counts.is_empty());
        assert!(super::PendingCounts::default().is_empty());
    }
}

//! Synthetic identifier generation.
//!
//! Row ids (and entity ids) are produced by a [`RowIdGenerator`]. A generator
//! is shared by every session opened from the same factory, so it must be
//! safe to call from several threads at once and must never hand out the same
//! value twice.
//!
//! The [`IncrementGenerator`] needs the table's high-water mark before its
//! first use; the persister asks storage for it via
//! [`StorageAdapter::row_id_high_water`](idbag_core::StorageAdapter::row_id_high_water)
//! and calls [`seed`](RowIdGenerator::seed). `needs_seed` only turns false
//! once a seed has been fully applied, so no caller can draw an id from an
//! unseeded generator by racing the seeding thread.

use idbag_core::{IdStrategy, RowId};
use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Once};

/// Source of unique synthetic identifiers.
pub trait RowIdGenerator: Send + Sync + fmt::Debug {
    /// Hand out the next identifier.
    fn next(&self) -> RowId;

    /// Whether [`seed`](Self::seed) must be called before the first `next`.
    fn needs_seed(&self) -> bool {
        false
    }

    /// Seed from the highest identifier storage ever handed out.
    ///
    /// Only the first call has an effect. Concurrent callers block until it
    /// has been applied.
    fn seed(&self, _high_water: Option<i64>) {}
}

/// `high water + 1` counter seeded lazily from storage.
#[derive(Debug)]
pub struct IncrementGenerator {
    next: AtomicI64,
    seeded: Once,
}

impl IncrementGenerator {
    pub fn new() -> Self {
        Self {
            next: AtomicI64::new(1),
            seeded: Once::new(),
        }
    }
}

impl Default for IncrementGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl RowIdGenerator for IncrementGenerator {
    fn next(&self) -> RowId {
        RowId::new(self.next.fetch_add(1, Ordering::SeqCst))
    }

    fn needs_seed(&self) -> bool {
        !self.seeded.is_completed()
    }

    fn seed(&self, high_water: Option<i64>) {
        self.seeded.call_once(|| {
            // fetch_max keeps ids drawn before seeding valid
            let floor = high_water.unwrap_or(0).saturating_add(1);
            let previous = self.next.fetch_max(floor, Ordering::SeqCst);
            tracing::debug!(
                high_water = ?high_water,
                next = previous.max(floor),
                "Seeded increment generator"
            );
        });
    }
}

/// Plain counter starting at a fixed value. Never consults storage.
#[derive(Debug)]
pub struct CounterGenerator {
    next: AtomicI64,
}

impl CounterGenerator {
    pub fn starting_at(start: i64) -> Self {
        Self {
            next: AtomicI64::new(start),
        }
    }
}

impl RowIdGenerator for CounterGenerator {
    fn next(&self) -> RowId {
        RowId::new(self.next.fetch_add(1, Ordering::SeqCst))
    }
}

/// Build the generator for a configured strategy.
pub fn generator_for(strategy: IdStrategy) -> Arc<dyn RowIdGenerator> {
    match strategy {
        IdStrategy::Increment => Arc::new(IncrementGenerator::new()),
        IdStrategy::Counter { start } => Arc::new(CounterGenerator::starting_at(start)),
    }
}

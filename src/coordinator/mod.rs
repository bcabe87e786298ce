//! Coordination of outbound calls issued from independent UI triggers
//!
//! `RequestCoordinator` combines the single-flight [`Deduplicator`] and the
//! time-windowed [`Batcher`] behind one handle that call sites share.

use std::{future::Future, time::Duration};

use futures::future::BoxFuture;
use log::info;

use crate::{config::CoordinatorConfig, core::CoordResult};

pub mod batch;
pub mod dedup;

pub use batch::Batcher;
pub use dedup::Deduplicator;

pub const DEFAULT_BATCH_DELAY: Duration = Duration::from_millis(50);

pub struct RequestCoordinator {
    dedup: Deduplicator,
    batcher: Batcher,
    batch_delay: Duration,
}

impl Default for RequestCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestCoordinator {
    pub fn new() -> Self {
        Self::with_batch_delay(DEFAULT_BATCH_DELAY)
    }

    pub fn with_batch_delay(batch_delay: Duration) -> Self {
        Self {
            dedup: Deduplicator::new(),
            batcher: Batcher::new(),
            batch_delay,
        }
    }

    pub fn from_config(config: &CoordinatorConfig) -> Self {
        Self::with_batch_delay(Duration::from_millis(config.batch_delay_ms))
    }

    pub fn batch_delay(&self) -> Duration {
        self.batch_delay
    }

    /// Share one invocation of `operation` among all concurrent callers
    /// using `key`. See [`Deduplicator::deduplicate`].
    pub fn deduplicate<T, F, Fut>(
        &self,
        key: &str,
        operation: F,
    ) -> BoxFuture<'static, CoordResult<T>>
    where
        T: Clone + Send + Sync + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = CoordResult<T>> + Send + 'static,
    {
        self.dedup.deduplicate(key, operation)
    }

    /// Batch `item` with the other items queued under `key` within the
    /// default delay.
    pub fn batch<I, O, F, Fut>(
        &self,
        key: &str,
        item: I,
        batch_fn: F,
    ) -> BoxFuture<'static, CoordResult<O>>
    where
        I: Send + 'static,
        O: Send + 'static,
        F: FnOnce(Vec<I>) -> Fut + Send + 'static,
        Fut: Future<Output = CoordResult<Vec<O>>> + Send + 'static,
    {
        self.batcher.batch(key, item, batch_fn, self.batch_delay)
    }

    pub fn batch_with_delay<I, O, F, Fut>(
        &self,
        key: &str,
        item: I,
        batch_fn: F,
        delay: Duration,
    ) -> BoxFuture<'static, CoordResult<O>>
    where
        I: Send + 'static,
        O: Send + 'static,
        F: FnOnce(Vec<I>) -> Fut + Send + 'static,
        Fut: Future<Output = CoordResult<Vec<O>>> + Send + 'static,
    {
        self.batcher.batch(key, item, batch_fn, delay)
    }

    /// Drop all pending dedup entries and batch queues. Teardown only.
    pub fn clear(&self) {
        info!("Clearing request coordinator");
        self.dedup.clear();
        self.batcher.clear();
    }

    pub fn get_stats(&self) -> CoordinatorStats {
        CoordinatorStats {
            in_flight: self.dedup.in_flight(),
            queued_batches: self.batcher.queued_batches(),
            queued_items: self.batcher.queued_items(),
        }
    }
}

/// Snapshot of the coordinator's pending work
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CoordinatorStats {
    pub in_flight: usize,
    pub queued_batches: usize,
    pub queued_items: usize,
}

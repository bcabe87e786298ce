//! Single-flight deduplication of identical in-flight operations
//!
//! The first caller for a key spawns the operation and registers a shared
//! handle to its outcome; later callers join that handle until the
//! operation settles. The spawned task deregisters the key itself, before
//! the outcome becomes visible to any caller, so a call arriving right after
//! settlement always starts a fresh operation.

use std::{
    any::{Any, TypeId},
    future::Future,
    panic::AssertUnwindSafe,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use dashmap::{mapref::entry::Entry, DashMap};
use futures::future::{self, BoxFuture, FutureExt, Shared};
use log::{debug, warn};

use crate::{
    core::{
        error::panic_message,
        metrics::{DEDUP_INVOCATIONS, DEDUP_JOINS},
        CoordError, CoordResult,
    },
    internal_error,
};

type SharedOutcome<T> = Shared<BoxFuture<'static, CoordResult<T>>>;

// Keys are scoped by result type so two call sites that happen to pick the
// same key for different types never join each other.
type PendingKey = (String, TypeId);

struct PendingOperation {
    generation: u64,
    outcome: Box<dyn Any + Send + Sync>,
}

#[derive(Default)]
pub struct Deduplicator {
    pending: Arc<DashMap<PendingKey, PendingOperation>>,
    generation: AtomicU64,
}

impl Deduplicator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `operation` unless one is already in flight under `key`, in which
    /// case the caller joins it. Registration happens at call time, not on
    /// first poll.
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
        let pending_key = (key.to_string(), TypeId::of::<T>());

        let outcome = match self.pending.entry(pending_key) {
            Entry::Occupied(entry) => {
                match entry.get().outcome.downcast_ref::<SharedOutcome<T>>() {
                    Some(outcome) => {
                        debug!("Joining in-flight operation '{key}'");
                        DEDUP_JOINS.inc();
                        outcome.clone()
                    }
                    None => {
                        return future::ready(Err(internal_error!(
                            "pending operation '{}' has an unexpected type",
                            key
                        )))
                        .boxed()
                    }
                }
            }
            Entry::Vacant(entry) => {
                let generation = self.generation.fetch_add(1, Ordering::Relaxed);
                let pending = Arc::clone(&self.pending);
                let deregister_key = entry.key().clone();

                debug!("Starting operation '{key}'");
                DEDUP_INVOCATIONS.inc();
                // Deregistration blocks on this entry's shard until the insert
                // below has happened
                let task = tokio::spawn(async move {
                    let outcome = AssertUnwindSafe(async move { operation().await })
                        .catch_unwind()
                        .await
                        .unwrap_or_else(|panic| {
                            let msg = panic_message(panic.as_ref());
                            warn!("Operation '{}' panicked: {msg}", deregister_key.0);
                            Err(CoordError::Operation(format!("operation panicked: {msg}")))
                        });
                    pending.remove_if(&deregister_key, |_, op| op.generation == generation);
                    outcome
                });

                let outcome: SharedOutcome<T> = task
                    .map(|joined| {
                        joined.unwrap_or_else(|err| {
                            Err(internal_error!("deduplicated operation aborted: {}", err))
                        })
                    })
                    .boxed()
                    .shared();
                entry.insert(PendingOperation {
                    generation,
                    outcome: Box::new(outcome.clone()),
                });
                outcome
            }
        };

        outcome.boxed()
    }

    /// Number of operations currently in flight
    pub fn in_flight(&self) -> usize {
        self.pending.len()
    }

    pub fn is_in_flight(&self, key: &str) -> bool {
        self.pending.iter().any(|entry| entry.key().0 == key)
    }

    /// Forget every in-flight operation. Running operations still settle
    /// for the callers already holding them; new calls start afresh.
    pub fn clear(&self) {
        let dropped = self.pending.len();
        self.pending.clear();
        debug!("Dropped {dropped} in-flight operations");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use futures::future::join_all;
    use tokio::sync::Notify;

    use super::*;

    fn init_log() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    #[derive(Debug, PartialEq)]
    struct Profile {
        id: u32,
        name: String,
    }

    fn gated_fetch(
        calls: Arc<AtomicUsize>,
        gate: Arc<Notify>,
        result: CoordResult<Arc<Profile>>,
    ) -> impl FnOnce() -> BoxFuture<'static, CoordResult<Arc<Profile>>> + Send + 'static {
        move || {
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                gate.notified().await;
                result
            }
            .boxed()
        }
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_one_invocation() {
        init_log();
        let dedup = Deduplicator::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let gate = Arc::new(Notify::new());
        let profile = Arc::new(Profile {
            id: 42,
            name: "Ada".to_string(),
        });

        let waiting: Vec<_> = (0..5)
            .map(|_| {
                dedup.deduplicate(
                    "profile:42",
                    gated_fetch(calls.clone(), gate.clone(), Ok(profile.clone())),
                )
            })
            .collect();
        assert_eq!(dedup.in_flight(), 1);
        assert!(dedup.is_in_flight("profile:42"));

        gate.notify_one();
        let results = join_all(waiting).await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        for result in results {
            let received = result.unwrap();
            assert!(Arc::ptr_eq(&received, &profile));
        }
        assert_eq!(dedup.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_failure_reaches_every_joined_caller() {
        init_log();
        let dedup = Deduplicator::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let gate = Arc::new(Notify::new());
        let failure = CoordError::operation("backend returned 503");

        let first = dedup.deduplicate(
            "profile:7",
            gated_fetch(calls.clone(), gate.clone(), Err(failure.clone())),
        );
        let unused = Arc::new(Profile {
            id: 7,
            name: "never".to_string(),
        });
        let second = dedup.deduplicate(
            "profile:7",
            gated_fetch(calls.clone(), gate.clone(), Ok(unused)),
        );

        gate.notify_one();
        assert_eq!(first.await, Err(failure.clone()));
        assert_eq!(second.await, Err(failure));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(dedup.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_call_after_settlement_invokes_again() {
        init_log();
        let dedup = Deduplicator::new();
        let calls = Arc::new(AtomicUsize::new(0));

        for expected in 1..=3 {
            let counter = calls.clone();
            let value = dedup
                .deduplicate("counter", move || async move {
                    Ok(counter.fetch_add(1, Ordering::SeqCst) + 1)
                })
                .await
                .unwrap();
            assert_eq!(value, expected);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_panicking_operation_releases_key() {
        init_log();
        let dedup = Deduplicator::new();

        let failed = dedup
            .deduplicate("profile:9", || async {
                if true {
                    panic!("profile service exploded");
                }
                Ok(0u32)
            })
            .await;
        match failed {
            Err(CoordError::Operation(msg)) => assert!(msg.contains("profile service exploded")),
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(dedup.in_flight(), 0);
        assert!(!dedup.is_in_flight("profile:9"));

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let retried = dedup
            .deduplicate("profile:9", move || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(2u32)
            })
            .await;
        assert_eq!(retried, Ok(2));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_same_key_different_types_do_not_join() {
        init_log();
        let dedup = Deduplicator::new();

        let number = dedup.deduplicate("config", || async { Ok(1u32) });
        let text = dedup.deduplicate("config", || async { Ok("one".to_string()) });
        assert_eq!(dedup.in_flight(), 2);

        assert_eq!(number.await, Ok(1));
        assert_eq!(text.await, Ok("one".to_string()));
    }

    #[tokio::test]
    async fn test_clear_forgets_in_flight_operations() {
        init_log();
        let dedup = Deduplicator::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let gate_before = Arc::new(Notify::new());
        let gate_after = Arc::new(Notify::new());
        let profile = Arc::new(Profile {
            id: 1,
            name: "Grace".to_string(),
        });

        let before = dedup.deduplicate(
            "profile:1",
            gated_fetch(calls.clone(), gate_before.clone(), Ok(profile.clone())),
        );
        dedup.clear();
        assert_eq!(dedup.in_flight(), 0);

        let after = dedup.deduplicate(
            "profile:1",
            gated_fetch(calls.clone(), gate_after.clone(), Ok(profile.clone())),
        );
        assert_eq!(dedup.in_flight(), 1);

        gate_before.notify_one();
        assert!(before.await.is_ok());
        // The cleared operation must not deregister its successor
        assert_eq!(dedup.in_flight(), 1);

        gate_after.notify_one();
        assert!(after.await.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(dedup.in_flight(), 0);
    }
}

//! Time-windowed batching of independent calls
//!
//! Items enqueued under the same key within `delay` of the first one are
//! handed to a single batch function call. The queue is removed from the
//! map, under the same lock enqueuers take, at the moment the timer fires,
//! so an item lands either in that flush or in a brand new queue.

use std::{
    any::{Any, TypeId},
    collections::{hash_map::Entry, HashMap},
    future::Future,
    panic::AssertUnwindSafe,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
    time::Duration,
};

use futures::future::{self, BoxFuture, FutureExt};
use log::{debug, warn};
use tokio::{sync::oneshot, task::AbortHandle, time::sleep};

use crate::{
    core::{
        error::panic_message,
        metrics::{BATCH_FLUSHES, BATCH_SIZE},
        CoordError, CoordResult,
    },
    internal_error,
};

type QueueKey = (String, TypeId);
type Queues = Arc<Mutex<QueueMap>>;

struct QueuedItem<I, O> {
    item: I,
    responder: oneshot::Sender<CoordResult<O>>,
}

struct BatchQueue {
    generation: u64,
    timer: AbortHandle,
    // Vec<QueuedItem<I, O>> for the key's item and result types
    entries: Box<dyn Any + Send>,
    len: usize,
}

type QueueMap = HashMap<QueueKey, BatchQueue>;

fn lock(queues: &Mutex<QueueMap>) -> MutexGuard<'_, QueueMap> {
    queues.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Default)]
pub struct Batcher {
    queues: Queues,
    generation: AtomicU64,
}

impl Batcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue `item` under `key`. The first item of a queue arms the flush
    /// timer and its `batch_fn` is the one invoked; later callers' functions
    /// are dropped.
    ///
    /// `batch_fn` must return one result per item, in item order.
    pub fn batch<I, O, F, Fut>(
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
        let queue_key = (key.to_string(), TypeId::of::<(I, O)>());
        let (responder, receiver) = oneshot::channel();
        let queued = QueuedItem { item, responder };

        {
            let mut queues = lock(&self.queues);
            match queues.entry(queue_key) {
                Entry::Occupied(mut occupied) => {
                    let queue = occupied.get_mut();
                    match queue.entries.downcast_mut::<Vec<QueuedItem<I, O>>>() {
                        Some(entries) => {
                            entries.push(queued);
                            queue.len += 1;
                            debug!("Queued item #{} for batch '{key}'", queue.len);
                        }
                        None => {
                            return future::ready(Err(internal_error!(
                                "batch queue '{}' has an unexpected type",
                                key
                            )))
                            .boxed()
                        }
                    }
                }
                Entry::Vacant(vacant) => {
                    let generation = self.generation.fetch_add(1, Ordering::Relaxed);
                    let timer = tokio::spawn(flush_after(
                        Arc::clone(&self.queues),
                        vacant.key().clone(),
                        generation,
                        delay,
                        batch_fn,
                    ));
                    debug!(
                        "Started batch '{key}', flushing in {}ms",
                        delay.as_millis()
                    );
                    vacant.insert(BatchQueue {
                        generation,
                        timer: timer.abort_handle(),
                        entries: Box::new(vec![queued]),
                        len: 1,
                    });
                }
            }
        }

        async move {
            receiver.await.unwrap_or_else(|_| {
                Err(CoordError::Abandoned(
                    "batch queue was dropped before flushing".to_string(),
                ))
            })
        }
        .boxed()
    }

    /// Queues with an armed timer
    pub fn queued_batches(&self) -> usize {
        lock(&self.queues).len()
    }

    /// Items waiting across all queues
    pub fn queued_items(&self) -> usize {
        lock(&self.queues).values().map(|queue| queue.len).sum()
    }

    /// Cancel every armed timer and drop the queues. Their callers observe
    /// `CoordError::Abandoned`; flushes already running are unaffected.
    pub fn clear(&self) {
        let drained: Vec<BatchQueue> = lock(&self.queues)
            .drain()
            .map(|(_, queue)| queue)
            .collect();
        for queue in &drained {
            queue.timer.abort();
        }
        debug!("Dropped {} batch queues", drained.len());
    }
}

async fn flush_after<I, O, F, Fut>(
    queues: Queues,
    queue_key: QueueKey,
    generation: u64,
    delay: Duration,
    batch_fn: F,
) where
    I: Send + 'static,
    O: Send + 'static,
    F: FnOnce(Vec<I>) -> Fut + Send + 'static,
    Fut: Future<Output = CoordResult<Vec<O>>> + Send + 'static,
{
    sleep(delay).await;

    let entries = {
        let mut queues = lock(&queues);
        match queues.get(&queue_key) {
            Some(queue) if queue.generation == generation => {}
            _ => return,
        }
        let Some(queue) = queues.remove(&queue_key) else {
            return;
        };
        match queue.entries.downcast::<Vec<QueuedItem<I, O>>>() {
            Ok(entries) => *entries,
            Err(_) => return,
        }
    };

    let (items, responders): (Vec<I>, Vec<_>) = entries
        .into_iter()
        .map(|queued| (queued.item, queued.responder))
        .unzip();
    let expected = items.len();
    debug!("Flushing batch '{}' with {expected} items", queue_key.0);
    BATCH_FLUSHES.inc();
    BATCH_SIZE.observe(expected as f64);

    let outcome = AssertUnwindSafe(async move { batch_fn(items).await })
        .catch_unwind()
        .await
        .unwrap_or_else(|panic| {
            Err(CoordError::Batch(format!(
                "batch function panicked: {}",
                panic_message(panic.as_ref())
            )))
        });

    match outcome {
        Ok(results) if results.len() == expected => {
            for (responder, result) in responders.into_iter().zip(results) {
                let _ = responder.send(Ok(result));
            }
        }
        Ok(results) => {
            let err = CoordError::Batch(format!(
                "batch function returned {} results for {expected} items",
                results.len()
            ));
            warn!("Batch '{}' failed: {err}", queue_key.0);
            reject_all(responders, err);
        }
        Err(err) => {
            warn!("Batch '{}' failed: {err}", queue_key.0);
            reject_all(responders, err);
        }
    }
}

fn reject_all<O>(responders: Vec<oneshot::Sender<CoordResult<O>>>, err: CoordError) {
    for responder in responders {
        let _ = responder.send(Err(err.clone()));
    }
}

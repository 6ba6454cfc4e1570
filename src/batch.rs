//! Batching coordinator.
//!
//! A [`Batcher`] coalesces many concurrent [`invoke`] calls into one bulk
//! call, trading a bounded amount of latency for fewer upstream fetches.
//! Calls are grouped per logical run (so unrelated requests never share a
//! flush) and a batch goes out when it reaches [`BatchOptions::max_size`]
//! or when [`BatchOptions::wait_interval`] has elapsed since its first
//! entry, whichever comes first.
//!
//! [`invoke`]: Batcher::invoke

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_channel::oneshot;
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use log::debug;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use crate::{Context, Error};

/// Default maximum number of calls coalesced into one flush.
pub const DEFAULT_MAX_SIZE: usize = 100;

/// Default time the first caller of a batch waits for company.
pub const DEFAULT_WAIT_INTERVAL: Duration = Duration::from_millis(20);

/// Tuning knobs for a [`Batcher`].
#[derive(Clone, Debug)]
pub struct BatchOptions {
    /// Flush as soon as this many calls are pending. Must be positive.
    pub max_size: usize,

    /// Flush once this much time has passed since the batch's first entry.
    pub wait_interval: Duration,
}

impl Default for BatchOptions {
    fn default() -> BatchOptions {
        BatchOptions {
            max_size: DEFAULT_MAX_SIZE,
            wait_interval: DEFAULT_WAIT_INTERVAL,
        }
    }
}

type ManyFn<A, R> = dyn Fn(Context, Vec<A>) -> BoxFuture<'static, Result<Vec<R>, Error>>
    + Send
    + Sync;

/// Coalesces concurrent single-argument calls into bulk calls.
///
/// The bulk function receives the pending arguments in enqueue order and
/// must return one result per argument, in the same order. Cloning the
/// batcher is cheap; clones share the pending state.
pub struct Batcher<A, R> {
    inner: Arc<Inner<A, R>>,
}

impl<A, R> Clone for Batcher<A, R> {
    fn clone(&self) -> Batcher<A, R> {
        Batcher {
            inner: self.inner.clone(),
        }
    }
}

struct Inner<A, R> {
    many: Box<ManyFn<A, R>>,
    max_size: usize,
    wait_interval: Duration,
    next_generation: AtomicU64,
    pending: Mutex<FxHashMap<u64, PendingBatch<A, R>>>,
}

/// One open batch, keyed by the run id of its first caller.
struct PendingBatch<A, R> {
    ctx: Context,
    generation: u64,
    slots: Vec<Slot<A, R>>,
}

struct Slot<A, R> {
    arg: A,
    sender: oneshot::Sender<Result<R, Error>>,
}

impl<A, R> Batcher<A, R>
where
    A: Send + 'static,
    R: Send + 'static,
{
    /// Creates a batcher around the bulk function `many`.
    ///
    /// # Panics
    ///
    /// Panics if `options.max_size` is zero.
    pub fn new<F, Fut>(options: BatchOptions, many: F) -> Batcher<A, R>
    where
        F: Fn(Context, Vec<A>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Vec<R>, Error>> + Send + 'static,
    {
        assert!(options.max_size > 0, "batch max_size must be positive");
        Batcher {
            inner: Arc::new(Inner {
                many: Box::new(move |ctx, args| many(ctx, args).boxed()),
                max_size: options.max_size,
                wait_interval: options.wait_interval,
                next_generation: AtomicU64::new(1),
                pending: Mutex::new(FxHashMap::default()),
            }),
        }
    }

    /// Enqueues `arg` and waits for its result from the next flush.
    ///
    /// Cancellation of `ctx` abandons only this slot: the caller gets the
    /// cancellation error, the argument is dropped from the bulk call if
    /// the flush has not yet fired, and the rest of the batch proceeds.
    pub async fn invoke(&self, ctx: &Context, arg: A) -> Result<R, Error> {
        if ctx.is_cancelled() {
            return Err(ctx.cancellation_error());
        }

        let (sender, receiver) = oneshot::channel();
        let full = {
            let mut pending = self.inner.pending.lock();
            let batch = pending.entry(ctx.run_id()).or_insert_with(|| {
                let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
                self.spawn_flush_timer(ctx.run_id(), generation);
                PendingBatch {
                    ctx: ctx.clone(),
                    generation,
                    slots: Vec::new(),
                }
            });
            batch.slots.push(Slot { arg, sender });
            if batch.slots.len() >= self.inner.max_size {
                pending.remove(&ctx.run_id())
            } else {
                None
            }
        };

        if let Some(batch) = full {
            let inner = self.inner.clone();
            tokio::spawn(async move {
                inner.flush(batch).await;
            });
        }

        tokio::select! {
            biased;
            _ = ctx.cancelled() => Err(ctx.cancellation_error()),
            result = receiver => match result {
                Ok(outcome) => outcome,
                // The flush dispatched no result for this slot; it can only
                // have been torn down, which reads as cancellation here.
                Err(oneshot::Canceled) => Err(Error::Cancelled),
            },
        }
    }

    /// Arms the wait-interval timer for a freshly opened batch. The
    /// generation check resolves the race against a size-triggered flush
    /// that swapped this batch out (and possibly a successor in) first.
    fn spawn_flush_timer(&self, run_id: u64, generation: u64) {
        let inner = self.inner.clone();
        tokio::spawn(async move {
            tokio::time::sleep(inner.wait_interval).await;
            let batch = {
                let mut pending = inner.pending.lock();
                let still_ours = pending
                    .get(&run_id)
                    .map_or(false, |batch| batch.generation == generation);
                if still_ours {
                    pending.remove(&run_id)
                } else {
                    None
                }
            };
            if let Some(batch) = batch {
                inner.flush(batch).await;
            }
        });
    }
}

impl<A, R> Inner<A, R> {
    async fn flush(&self, batch: PendingBatch<A, R>) {
        let mut args = Vec::with_capacity(batch.slots.len());
        let mut senders = Vec::with_capacity(batch.slots.len());
        for slot in batch.slots {
            // A cancelled invoker dropped its receiver; its argument does
            // not go upstream.
            if slot.sender.is_canceled() {
                continue;
            }
            args.push(slot.arg);
            senders.push(slot.sender);
        }
        if senders.is_empty() {
            return;
        }

        debug!("flushing batch of {} calls", senders.len());
        match (self.many)(batch.ctx, args).await {
            Ok(results) => {
                let expected = senders.len();
                let got = results.len();
                let mut results = results.into_iter();
                for sender in senders {
                    let outcome = match results.next() {
                        Some(result) => Ok(result),
                        None => Err(Error::ShortBatch { expected, got }),
                    };
                    let _ = sender.send(outcome);
                }
            }
            Err(err) => {
                for sender in senders {
                    let _ = sender.send(Err(err.clone()));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_options() {
        let options = BatchOptions::default();
        assert_eq!(options.max_size, DEFAULT_MAX_SIZE);
        assert_eq!(options.wait_interval, DEFAULT_WAIT_INTERVAL);
    }

    #[test]
    #[should_panic(expected = "max_size must be positive")]
    fn zero_max_size_is_rejected() {
        let _ = Batcher::<u32, u32>::new(
            BatchOptions {
                max_size: 0,
                ..BatchOptions::default()
            },
            |_ctx, _args| async { Ok(Vec::new()) },
        );
    }
}

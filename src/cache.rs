//! Per-run memoization cache with single-flight and cross-run reuse.
//!
//! Within one run, [`cache`] never computes the same keyed sub-result
//! twice: concurrent callers for one key share a single execution. Across
//! consecutive runs of a rerunner, a completed entry is reused as long as
//! every resource in its dependency set is still live, so an invalidation
//! only recomputes the affected subgraph.

use std::any::{Any, TypeId};
use std::fmt;
use std::future::Future;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use log::{debug, info, warn};
use rustc_hash::{FxHashMap, FxHasher};
use serde::Serialize;
use tokio::sync::watch;

use crate::mutex::CtxMutex;
use crate::resource::{DependencyCollector, DependencySet, InvalidationHook};
use crate::snapshot::Snapshot;
use crate::{Context, Error};

/// Process-wide switch for defensive snapshot verification of cached
/// values. Off by default; set once at program init.
static DEBUG_CACHE_MUTATES: AtomicBool = AtomicBool::new(false);

/// Enables (or disables) snapshot verification of cached values. When on,
/// every value entering the cache is structurally captured, and every
/// retrieval re-verifies it; a mismatch fails the retrieval -- and with it
/// the run -- with [`Error::CacheMutated`].
pub fn set_debug_cache_mutates(enabled: bool) {
    DEBUG_CACHE_MUTATES.store(enabled, Ordering::SeqCst);
}

fn debug_cache_mutates() -> bool {
    DEBUG_CACHE_MUTATES.load(Ordering::SeqCst)
}

/// A type-erased, hashable cache key. Two keys are equal when their key
/// type, value type and value all match, so one key value can safely be
/// reused for entries of different types.
#[derive(Clone)]
pub(crate) struct CacheKey {
    hash: u64,
    value_type: TypeId,
    key: Arc<dyn DynKey>,
}

trait DynKey: Send + Sync {
    fn as_any(&self) -> &dyn Any;
    fn dyn_eq(&self, other: &dyn DynKey) -> bool;
}

impl<K: Hash + Eq + Send + Sync + 'static> DynKey for K {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn dyn_eq(&self, other: &dyn DynKey) -> bool {
        other
            .as_any()
            .downcast_ref::<K>()
            .map_or(false, |other| self == other)
    }
}

impl CacheKey {
    fn new<K, V>(key: K) -> CacheKey
    where
        K: Hash + Eq + Send + Sync + 'static,
        V: 'static,
    {
        let mut hasher = FxHasher::default();
        TypeId::of::<K>().hash(&mut hasher);
        TypeId::of::<V>().hash(&mut hasher);
        key.hash(&mut hasher);
        CacheKey {
            hash: hasher.finish(),
            value_type: TypeId::of::<V>(),
            key: Arc::new(key),
        }
    }
}

impl PartialEq for CacheKey {
    fn eq(&self, other: &CacheKey) -> bool {
        self.hash == other.hash
            && self.value_type == other.value_type
            && self.key.dyn_eq(&*other.key)
    }
}

impl Eq for CacheKey {}

impl Hash for CacheKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u64(self.hash);
    }
}

impl fmt::Debug for CacheKey {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(fmt, "CacheKey({:016x})", self.hash)
    }
}

/// One keyed sub-result. Starts computing, becomes ready exactly once;
/// waiters observe the transition through the watch channel.
pub(crate) struct Entry {
    ready: watch::Sender<bool>,
    outcome: OnceLock<Outcome>,
}

struct Outcome {
    result: Result<Arc<dyn Any + Send + Sync>, Error>,
    deps: Arc<DependencySet>,
    snapshot: Option<Snapshot>,
}

impl Entry {
    fn new() -> Entry {
        let (ready, _) = watch::channel(false);
        Entry {
            ready,
            outcome: OnceLock::new(),
        }
    }

    fn complete(&self, outcome: Outcome) {
        if self.outcome.set(outcome).is_err() {
            // Only the computing caller completes an entry.
            unreachable!("cache entry completed twice");
        }
        // send_replace stores the flag even while no waiter is subscribed.
        self.ready.send_replace(true);
    }

    fn is_reusable(&self) -> bool {
        match self.outcome.get() {
            Some(outcome) => outcome.result.is_ok() && outcome.deps.all_live(),
            // Still computing when its run was abandoned.
            None => false,
        }
    }

    fn completed_ok(&self) -> bool {
        matches!(self.outcome.get(), Some(outcome) if outcome.result.is_ok())
    }
}

/// The cache attached to one run's context. The pending table is guarded
/// by a context-aware mutex so cache lookups abort cleanly when the run is
/// cancelled.
pub(crate) struct RunCache {
    state: CtxMutex<RunCacheState>,
}

struct RunCacheState {
    /// Entries touched (computed or reused) by the current run.
    current: FxHashMap<CacheKey, Arc<Entry>>,

    /// Completed entries carried over from the previous run, candidates
    /// for reuse until touched or superseded.
    candidates: FxHashMap<CacheKey, Arc<Entry>>,
}

impl RunCache {
    pub(crate) fn new() -> RunCache {
        RunCache::with_candidates(FxHashMap::default())
    }

    fn with_candidates(candidates: FxHashMap<CacheKey, Arc<Entry>>) -> RunCache {
        RunCache {
            state: CtxMutex::new(RunCacheState {
                current: FxHashMap::default(),
                candidates,
            }),
        }
    }

    /// Builds the cache for the next run. Entries this run completed
    /// successfully become reuse candidates; erroneous entries are
    /// discarded here. With `keep_untouched` (a retried or superseded
    /// run), candidates the run never got to are carried along as well.
    pub(crate) async fn successor(&self, keep_untouched: bool) -> RunCache {
        let background = Context::background();
        let mut state = self
            .state
            .lock(&background)
            .await
            .unwrap_or_else(|_| unreachable!("background context is never cancelled"));

        let mut candidates = FxHashMap::default();
        for (key, entry) in state.current.drain() {
            if entry.completed_ok() {
                candidates.insert(key, entry);
            }
        }
        if keep_untouched {
            for (key, entry) in state.candidates.drain() {
                candidates.entry(key).or_insert(entry);
            }
        } else {
            state.candidates.clear();
        }
        RunCache::with_candidates(candidates)
    }
}

/// What a `cache` call found under the lock.
enum Claim {
    /// Someone in this run already owns the entry; wait for readiness.
    Wait(Arc<Entry>),
    /// A prior run's entry is still valid; use it directly.
    Reused(Arc<Entry>),
    /// This caller owns the computation.
    Compute(Arc<Entry>),
}

/// Returns the memoized result for `key`, computing it with `f` at most
/// once per run.
///
/// Concurrent calls for one key within a run share a single execution of
/// `f` and observe the identical outcome. A completed entry from the
/// previous run is reused -- without running `f` -- when every resource in
/// its dependency set is still live. Dependencies registered inside `f`
/// attach to the entry and are folded into the caller's dependency set on
/// completion, so invalidation of a nested dependency still reruns the
/// outer computation.
///
/// On a context without a run cache, `f` simply runs uncached.
pub async fn cache<K, V, F, Fut>(ctx: &Context, key: K, f: F) -> Result<V, Error>
where
    K: Hash + Eq + Send + Sync + 'static,
    V: Clone + Serialize + Send + Sync + 'static,
    F: FnOnce(Context) -> Fut,
    Fut: Future<Output = Result<V, Error>>,
{
    let handle = match ctx.cache_handle() {
        Some(handle) => handle.clone(),
        None => {
            debug!("cache call outside a run, computing uncached");
            return f(ctx.clone()).await;
        }
    };

    let key = CacheKey::new::<K, V>(key);
    let claim = {
        let mut state = handle.state.lock(ctx).await?;
        if let Some(entry) = state.current.get(&key) {
            Claim::Wait(entry.clone())
        } else if let Some(entry) = state.candidates.remove(&key) {
            if entry.is_reusable() {
                state.current.insert(key.clone(), entry.clone());
                Claim::Reused(entry)
            } else {
                // Dropped; its cleanup chain already fired.
                let entry = Arc::new(Entry::new());
                state.current.insert(key.clone(), entry.clone());
                Claim::Compute(entry)
            }
        } else {
            let entry = Arc::new(Entry::new());
            state.current.insert(key.clone(), entry.clone());
            Claim::Compute(entry)
        }
    };

    match claim {
        Claim::Compute(entry) => {
            info!("{:?}: executing", key);
            let hook = parent_hook(ctx);
            let collector = Arc::new(DependencyCollector::new(hook));
            let child_ctx = ctx.with_collector(collector.clone());

            let guard = ComputeGuard::new(&entry);
            let result = f(child_ctx).await;

            let deps = Arc::new(collector.freeze());
            let snapshot = match &result {
                Ok(value) if debug_cache_mutates() => match Snapshot::capture(value) {
                    Ok(snapshot) => Some(snapshot),
                    Err(err) => {
                        warn!("{:?}: snapshot not captured: {}", key, err);
                        None
                    }
                },
                _ => None,
            };
            let stored = match &result {
                Ok(value) => Ok(Arc::new(value.clone()) as Arc<dyn Any + Send + Sync>),
                Err(err) => Err(err.clone()),
            };
            guard.complete(Outcome {
                result: stored,
                deps: deps.clone(),
                snapshot,
            });

            deps.propagate(ctx);
            result
        }
        Claim::Wait(entry) => {
            debug!("{:?}: waiting on in-flight computation", key);
            wait_ready(ctx, &entry).await?;
            retrieve::<V>(ctx, &entry)
        }
        Claim::Reused(entry) => {
            debug!("{:?}: reusing result from previous run", key);
            retrieve::<V>(ctx, &entry)
        }
    }
}

/// Empties the current run's cache, both fresh entries and carried-over
/// candidates; subsequent [`cache`] calls in this run recompute. A no-op
/// outside a run.
pub async fn purge_cache(ctx: &Context) -> Result<(), Error> {
    if let Some(handle) = ctx.cache_handle() {
        let mut state = handle.state.lock(ctx).await?;
        debug!(
            "purging cache ({} current, {} candidates)",
            state.current.len(),
            state.candidates.len()
        );
        state.current.clear();
        state.candidates.clear();
    }
    Ok(())
}

/// Keeps waiters of an entry from hanging if the computing future is
/// dropped mid-flight (its run superseded) or panics: on drop without a
/// proper completion, the entry resolves to `Cancelled` so every waiter
/// fails promptly instead of parking forever.
struct ComputeGuard<'a> {
    entry: &'a Entry,
    completed: bool,
}

impl<'a> ComputeGuard<'a> {
    fn new(entry: &'a Entry) -> ComputeGuard<'a> {
        ComputeGuard {
            entry,
            completed: false,
        }
    }

    fn complete(mut self, outcome: Outcome) {
        self.entry.complete(outcome);
        self.completed = true;
    }
}

impl Drop for ComputeGuard<'_> {
    fn drop(&mut self) {
        if !self.completed {
            self.entry.complete(Outcome {
                result: Err(Error::Cancelled),
                deps: Arc::new(DependencySet::empty()),
                snapshot: None,
            });
        }
    }
}

fn parent_hook(ctx: &Context) -> InvalidationHook {
    match ctx.collector() {
        Some(collector) => collector.hook(),
        None => Arc::new(|_: u64| {}),
    }
}

async fn wait_ready(ctx: &Context, entry: &Entry) -> Result<(), Error> {
    let mut ready = entry.ready.subscribe();
    loop {
        if *ready.borrow_and_update() {
            return Ok(());
        }
        tokio::select! {
            biased;
            _ = ctx.cancelled() => return Err(ctx.cancellation_error()),
            changed = ready.changed() => {
                if changed.is_err() {
                    // The computing side was dropped mid-flight; this run
                    // is being torn down.
                    return Err(Error::Cancelled);
                }
            }
        }
    }
}

/// Reads a completed entry: folds its dependencies into the caller,
/// re-verifies the snapshot when mutation detection is on, and clones out
/// the value.
fn retrieve<V>(ctx: &Context, entry: &Entry) -> Result<V, Error>
where
    V: Clone + Serialize + Send + Sync + 'static,
{
    let outcome = entry
        .outcome
        .get()
        .unwrap_or_else(|| unreachable!("cache entry marked ready without an outcome"));
    outcome.deps.propagate(ctx);
    match &outcome.result {
        Ok(value) => {
            // The key embeds the value's TypeId, so a mismatch here means
            // the caller smuggled one key past two value types.
            let value = value
                .clone()
                .downcast::<V>()
                .map_err(|_| Error::ContractViolation("cache key reused with a different value type"))?;
            if let Some(snapshot) = &outcome.snapshot {
                if !snapshot.verify(&*value) {
                    warn!("cached value mutated in place");
                    return Err(Error::CacheMutated);
                }
            }
            Ok((*value).clone())
        }
        Err(err) => Err(err.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_compare_by_type_and_value() {
        let a = CacheKey::new::<&'static str, u32>("k");
        let b = CacheKey::new::<&'static str, u32>("k");
        let c = CacheKey::new::<&'static str, u32>("other");
        assert_eq!(a, b);
        assert_ne!(a, c);

        // Same key value, different value type: distinct entries.
        let d = CacheKey::new::<&'static str, u64>("k");
        assert_ne!(a, d);

        // Same bits, different key type.
        let e = CacheKey::new::<u32, u32>(1);
        let f = CacheKey::new::<i32, u32>(1);
        assert_ne!(e, f);
    }

    #[tokio::test]
    async fn cache_without_run_computes_directly() {
        let ctx = Context::background();
        let value = cache(&ctx, "k", |_ctx| async { Ok::<_, Error>(41 + 1) })
            .await
            .unwrap();
        assert_eq!(value, 42);
    }
}

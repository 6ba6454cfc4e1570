//! The reactive runner.
//!
//! A [`Rerunner`] repeatedly invokes a compute function, publishing each
//! committed result, and re-invokes it whenever a dependency registered
//! during the run is invalidated -- without busy-looping, with a debounce
//! between runs, and with bounded parallelism when the outer context
//! carries a limiter.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info};
use parking_lot::Mutex;
use rustc_hash::FxHashSet;
use tokio::sync::{mpsc, Notify};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::cache::RunCache;
use crate::limiter;
use crate::resource::{DependencyCollector, DependencySet, FxIndexMap, Resource};
use crate::{Context, Error};

/// Floor for the first retry backoff interval.
const MIN_RETRY_BACKOFF: Duration = Duration::from_millis(100);

/// Default ceiling for the exponential retry backoff.
pub const DEFAULT_RETRY_CAP: Duration = Duration::from_secs(30);

/// Construction options for a [`Rerunner`].
#[derive(Clone, Debug)]
pub struct RerunnerOptions {
    /// Minimum wall-clock gap enforced between two consecutive runs.
    pub min_rerun_interval: Duration,

    /// When true, the debounce interval is waived for every rerun, not
    /// just the next one.
    pub rerun_immediately: bool,

    /// Ceiling for the exponential retry backoff.
    pub retry_cap: Duration,
}

impl Default for RerunnerOptions {
    fn default() -> RerunnerOptions {
        RerunnerOptions {
            min_rerun_interval: Duration::ZERO,
            rerun_immediately: false,
            retry_cap: DEFAULT_RETRY_CAP,
        }
    }
}

/// Receiver side of a runner's publish stream: one `Result` per committed
/// run, in completion order, ending with the terminal error (if any)
/// before the channel closes.
pub type Updates<T> = mpsc::UnboundedReceiver<Result<T, Error>>;

/// Handle to a running reactive computation. Dropping the handle stops
/// the runner.
pub struct Rerunner {
    shared: Arc<Shared>,
}

struct Shared {
    stop: CancellationToken,
    signal: Arc<RunSignal>,
}

/// Shared between the runner loop and the invalidation hooks registered
/// on dependencies.
struct RunSignal {
    /// An invalidation arrived; the next run is due (after debounce).
    dirty: AtomicBool,
    notify: Notify,

    /// The next debounce is waived.
    immediate: AtomicBool,
    immediate_notify: Notify,

    /// Cancelled when a dependency fires while its run is still
    /// executing, discarding the in-flight result.
    run_token: Mutex<CancellationToken>,

    /// Resources the runner is itself releasing; their hooks must not
    /// schedule a rerun.
    muted: Mutex<FxHashSet<u64>>,
}

impl RunSignal {
    fn new() -> RunSignal {
        RunSignal {
            dirty: AtomicBool::new(false),
            notify: Notify::new(),
            immediate: AtomicBool::new(false),
            immediate_notify: Notify::new(),
            run_token: Mutex::new(CancellationToken::new()),
            muted: Mutex::new(FxHashSet::default()),
        }
    }

    fn invalidated(&self, resource_id: u64) {
        if self.muted.lock().contains(&resource_id) {
            return;
        }
        self.dirty.store(true, Ordering::SeqCst);
        self.run_token.lock().cancel();
        self.notify.notify_one();
    }

    /// Invalidates `resources` without scheduling a rerun.
    fn release(&self, resources: impl IntoIterator<Item = Resource>) {
        for resource in resources {
            self.muted.lock().insert(resource.id());
            resource.invalidate();
            self.muted.lock().remove(&resource.id());
        }
    }
}

impl Rerunner {
    /// Starts a runner for `compute` with the default retry cap and
    /// performs the first run eagerly. `min_rerun_interval` is the
    /// debounce between runs; with `rerun_immediately` the debounce is
    /// waived by default.
    pub fn new<T, F, Fut>(
        ctx: &Context,
        compute: F,
        min_rerun_interval: Duration,
        rerun_immediately: bool,
    ) -> (Rerunner, Updates<T>)
    where
        T: Send + 'static,
        F: FnMut(Context) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, Error>> + Send + 'static,
    {
        Rerunner::with_options(
            ctx,
            compute,
            RerunnerOptions {
                min_rerun_interval,
                rerun_immediately,
                retry_cap: DEFAULT_RETRY_CAP,
            },
        )
    }

    /// Starts a runner with explicit options.
    pub fn with_options<T, F, Fut>(
        ctx: &Context,
        compute: F,
        options: RerunnerOptions,
    ) -> (Rerunner, Updates<T>)
    where
        T: Send + 'static,
        F: FnMut(Context) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, Error>> + Send + 'static,
    {
        let (publish, updates) = mpsc::unbounded_channel();
        let stop = ctx.child_token();
        let signal = Arc::new(RunSignal::new());
        let shared = Arc::new(Shared {
            stop: stop.clone(),
            signal: signal.clone(),
        });

        let run_loop = RunLoop {
            base: ctx.clone(),
            stop,
            signal,
            options,
            publish,
            compute,
            live: FxIndexMap::default(),
            backoff: Duration::ZERO,
            last_run: None,
        };
        tokio::spawn(run_loop.run());

        (Rerunner { shared }, updates)
    }

    /// Cancels the in-flight run (if any), tears down the current cache --
    /// firing all resource cleanups through normal invalidation -- and
    /// stops the runner. Idempotent.
    pub fn stop(&self) {
        self.shared.stop.cancel();
    }

    /// Waives the next debounce interval: the run triggered by the next
    /// invalidation starts without waiting out `min_rerun_interval`.
    pub fn rerun_immediately(&self) {
        self.shared.signal.immediate.store(true, Ordering::SeqCst);
        self.shared.signal.immediate_notify.notify_one();
    }
}

impl Drop for Rerunner {
    fn drop(&mut self) {
        self.shared.stop.cancel();
    }
}

/// Why the loop is scheduling another run.
enum NextRun {
    /// First run, which is eager.
    Eager,
    /// Wait for an invalidation, then debounce.
    AfterInvalidation,
    /// Retry after the given backoff.
    Backoff(Duration),
}

enum RunOutcome {
    Committed,
    Retry,
    Superseded,
    Terminal,
    Stopped,
}

struct RunLoop<T, F> {
    base: Context,
    stop: CancellationToken,
    signal: Arc<RunSignal>,
    options: RerunnerOptions,
    publish: mpsc::UnboundedSender<Result<T, Error>>,
    compute: F,

    /// Every resource registered by the runs that produced the current
    /// cache, keyed by id. Kept alive here; released when superseded.
    live: FxIndexMap<u64, Resource>,

    /// Current retry backoff; zero after a successful run.
    backoff: Duration,
    last_run: Option<Instant>,
}

impl<T, F, Fut> RunLoop<T, F>
where
    T: Send + 'static,
    F: FnMut(Context) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, Error>> + Send + 'static,
{
    async fn run(mut self) {
        let mut cache = Arc::new(RunCache::new());
        let mut next = NextRun::Eager;
        loop {
            match next {
                NextRun::Eager => {}
                NextRun::AfterInvalidation => {
                    if !self.wait_for_invalidation().await {
                        return self.teardown();
                    }
                    if !self.debounce().await {
                        return self.teardown();
                    }
                }
                NextRun::Backoff(delay) => {
                    debug!("retrying in {:?}", delay);
                    tokio::select! {
                        biased;
                        _ = self.stop.cancelled() => return self.teardown(),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }

            next = match self.run_once(&mut cache).await {
                RunOutcome::Committed => NextRun::AfterInvalidation,
                RunOutcome::Superseded => NextRun::AfterInvalidation,
                RunOutcome::Retry => NextRun::Backoff(self.bump_backoff()),
                RunOutcome::Terminal | RunOutcome::Stopped => return self.teardown(),
            };
        }
    }

    /// Parks until a dependency fires. The dirty flag is left set -- it is
    /// consumed at run start, so further invalidations arriving during
    /// the debounce fold into the same rerun. Returns false on stop.
    async fn wait_for_invalidation(&self) -> bool {
        loop {
            if self.signal.dirty.load(Ordering::SeqCst) {
                return true;
            }
            tokio::select! {
                biased;
                _ = self.stop.cancelled() => return false,
                _ = self.signal.notify.notified() => {}
            }
        }
    }

    /// Enforces the minimum gap between runs unless waived. Returns false
    /// on stop.
    async fn debounce(&self) -> bool {
        if self.options.rerun_immediately || self.take_immediate() {
            return true;
        }
        let target = match self.last_run {
            Some(last_run) => last_run + self.options.min_rerun_interval,
            None => return true,
        };
        loop {
            tokio::select! {
                biased;
                _ = self.stop.cancelled() => return false,
                _ = self.signal.immediate_notify.notified() => {
                    if self.take_immediate() {
                        return true;
                    }
                }
                _ = tokio::time::sleep_until(target) => return true,
            }
        }
    }

    fn take_immediate(&self) -> bool {
        self.signal.immediate.swap(false, Ordering::SeqCst)
    }

    async fn run_once(&mut self, cache: &mut Arc<RunCache>) -> RunOutcome {
        // Everything invalidated so far is observed by this run.
        self.signal.dirty.store(false, Ordering::SeqCst);
        let run_token = self.stop.child_token();
        *self.signal.run_token.lock() = run_token.clone();

        let hook = {
            let signal = self.signal.clone();
            Arc::new(move |id| signal.invalidated(id)) as Arc<dyn Fn(u64) + Send + Sync>
        };
        let collector = Arc::new(DependencyCollector::new(hook));
        let ctx = self
            .base
            .derive_run(run_token.clone(), collector.clone(), cache.clone());

        debug!("starting run");
        self.last_run = Some(Instant::now());

        let (ctx, permit) = limiter::acquire(&ctx).await;
        let result = tokio::select! {
            biased;
            _ = run_token.cancelled() => None,
            result = (self.compute)(ctx.clone()) => Some(result),
        };
        drop(permit);

        let registered = collector.freeze();
        match result {
            None => {
                self.absorb(&registered);
                *cache = Arc::new(cache.successor(true).await);
                if self.stop.is_cancelled() {
                    RunOutcome::Stopped
                } else {
                    info!("run superseded by invalidation");
                    RunOutcome::Superseded
                }
            }
            Some(Ok(value)) => {
                debug!("run committed");
                self.backoff = Duration::ZERO;
                if self.publish.send(Ok(value)).is_err() {
                    debug!("updates receiver dropped");
                }
                self.supersede(registered);
                *cache = Arc::new(cache.successor(false).await);
                RunOutcome::Committed
            }
            Some(Err(err)) if err.is_retry() => {
                info!("retry requested, keeping cache");
                self.absorb(&registered);
                *cache = Arc::new(cache.successor(true).await);
                RunOutcome::Retry
            }
            Some(Err(err)) => {
                info!("run failed, terminating: {}", err);
                self.absorb(&registered);
                let _ = self.publish.send(Err(err));
                RunOutcome::Terminal
            }
        }
    }

    /// Folds the run's registered resources into the live set without
    /// releasing anything (retried, superseded, or failed runs).
    fn absorb(&mut self, registered: &DependencySet) {
        for resource in registered.resources() {
            self.live.insert(resource.id(), resource.clone());
        }
    }

    /// Replaces the live set with the committed run's registrations and
    /// asynchronously invalidates everything the new run no longer
    /// depends on, firing those cleanup chains.
    fn supersede(&mut self, registered: DependencySet) {
        let mut fresh = FxIndexMap::default();
        for resource in registered.resources() {
            fresh.insert(resource.id(), resource.clone());
        }
        std::mem::swap(&mut self.live, &mut fresh);

        let stale: Vec<Resource> = fresh
            .into_iter()
            .filter(|(id, _)| !self.live.contains_key(id))
            .map(|(_, resource)| resource)
            .collect();
        if !stale.is_empty() {
            debug!("releasing {} superseded dependencies", stale.len());
            let signal = self.signal.clone();
            tokio::spawn(async move {
                signal.release(stale);
            });
        }
    }

    /// Tears down the runner: every live dependency is invalidated, which
    /// runs its cleanups, exactly as if the underlying data had changed.
    fn teardown(&mut self) {
        debug!("tearing down runner");
        let live: Vec<Resource> = self.live.drain(..).map(|(_, resource)| resource).collect();
        self.signal.release(live);
    }

    fn bump_backoff(&mut self) -> Duration {
        let floor = self.options.min_rerun_interval.max(MIN_RETRY_BACKOFF);
        self.backoff = if self.backoff.is_zero() {
            floor
        } else {
            (self.backoff * 2).min(self.options.retry_cap)
        };
        self.backoff
    }
}

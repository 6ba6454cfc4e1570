use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::cache::RunCache;
use crate::limiter::{Pool, TokenHandle};
use crate::resource::DependencyCollector;
use crate::Error;

/// Source for run identifiers. Each logical run gets a fresh one, which the
/// batcher uses to keep unrelated requests out of one flush.
static NEXT_RUN_ID: AtomicU64 = AtomicU64::new(1);

fn fresh_run_id() -> u64 {
    NEXT_RUN_ID.fetch_add(1, Ordering::Relaxed)
}

/// The invocation-scoped value threaded through every operation of this
/// crate.
///
/// A `Context` carries cancellation (a token plus an optional deadline) and
/// the run-scoped machinery: the dependency collector that
/// [`add_dependency`] attaches to, the memoization cache that [`cache`]
/// consults, and the limiter pool that [`limiter::acquire`] draws from.
/// Cloning is cheap; derived contexts share the underlying state.
///
/// [`add_dependency`]: crate::add_dependency
/// [`cache`]: crate::cache()
/// [`limiter::acquire`]: crate::limiter::acquire
#[derive(Clone)]
pub struct Context {
    cancel: CancellationToken,
    deadline: Option<Instant>,
    inner: Arc<ContextInner>,
}

struct ContextInner {
    run_id: u64,
    collector: Option<Arc<DependencyCollector>>,
    cache: Option<Arc<RunCache>>,
    pool: Option<Arc<Pool>>,
    token: Option<Arc<TokenHandle>>,
}

impl Context {
    /// The root context: never cancelled, no deadline, no run machinery.
    pub fn background() -> Context {
        Context {
            cancel: CancellationToken::new(),
            deadline: None,
            inner: Arc::new(ContextInner {
                run_id: fresh_run_id(),
                collector: None,
                cache: None,
                pool: None,
                token: None,
            }),
        }
    }

    /// Derives a cancellable child context. Cancelling the returned token
    /// cancels the child (and anything derived from it) without affecting
    /// `self`.
    pub fn with_cancellation(&self) -> (Context, CancellationToken) {
        let token = self.cancel.child_token();
        let ctx = Context {
            cancel: token.clone(),
            deadline: self.deadline,
            inner: self.inner.clone(),
        };
        (ctx, token)
    }

    /// Derives a child context whose deadline is at most `timeout` from
    /// now. An existing earlier deadline is kept.
    pub fn with_timeout(&self, timeout: Duration) -> Context {
        let candidate = Instant::now() + timeout;
        let deadline = match self.deadline {
            Some(existing) => existing.min(candidate),
            None => candidate,
        };
        Context {
            cancel: self.cancel.clone(),
            deadline: Some(deadline),
            inner: self.inner.clone(),
        }
    }

    /// Whether this context has been cancelled or its deadline has passed.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled() || self.deadline.map_or(false, |d| Instant::now() >= d)
    }

    /// Resolves when the context is cancelled or its deadline passes.
    /// Pending forever on a context that never cancels.
    pub async fn cancelled(&self) {
        match self.deadline {
            Some(deadline) => {
                tokio::select! {
                    _ = self.cancel.cancelled() => {}
                    _ = tokio::time::sleep_until(deadline) => {}
                }
            }
            None => self.cancel.cancelled().await,
        }
    }

    /// The error a blocking operation should return for this context's
    /// current cancellation state.
    pub fn cancellation_error(&self) -> Error {
        if self.deadline.map_or(false, |d| Instant::now() >= d) && !self.cancel.is_cancelled() {
            Error::DeadlineExceeded
        } else {
            Error::Cancelled
        }
    }

    pub(crate) fn run_id(&self) -> u64 {
        self.inner.run_id
    }

    pub(crate) fn collector(&self) -> Option<&Arc<DependencyCollector>> {
        self.inner.collector.as_ref()
    }

    pub(crate) fn cache_handle(&self) -> Option<&Arc<RunCache>> {
        self.inner.cache.as_ref()
    }

    pub(crate) fn pool(&self) -> Option<&Arc<Pool>> {
        self.inner.pool.as_ref()
    }

    pub(crate) fn token(&self) -> Option<&Arc<TokenHandle>> {
        self.inner.token.as_ref()
    }

    pub(crate) fn child_token(&self) -> CancellationToken {
        self.cancel.child_token()
    }

    /// A fresh run context: new run id, the given cancellation token,
    /// collector and cache. The limiter pool is inherited but any held
    /// token is not.
    pub(crate) fn derive_run(
        &self,
        cancel: CancellationToken,
        collector: Arc<DependencyCollector>,
        cache: Arc<RunCache>,
    ) -> Context {
        Context {
            cancel,
            deadline: self.deadline,
            inner: Arc::new(ContextInner {
                run_id: fresh_run_id(),
                collector: Some(collector),
                cache: Some(cache),
                pool: self.inner.pool.clone(),
                token: None,
            }),
        }
    }

    /// Same run, different dependency attach point. Used by the cache to
    /// route dependencies registered inside an entry's compute function to
    /// that entry.
    pub(crate) fn with_collector(&self, collector: Arc<DependencyCollector>) -> Context {
        Context {
            cancel: self.cancel.clone(),
            deadline: self.deadline,
            inner: Arc::new(ContextInner {
                run_id: self.inner.run_id,
                collector: Some(collector),
                cache: self.inner.cache.clone(),
                pool: self.inner.pool.clone(),
                token: self.inner.token.clone(),
            }),
        }
    }

    pub(crate) fn with_pool(&self, pool: Arc<Pool>) -> Context {
        Context {
            cancel: self.cancel.clone(),
            deadline: self.deadline,
            inner: Arc::new(ContextInner {
                run_id: self.inner.run_id,
                collector: self.inner.collector.clone(),
                cache: self.inner.cache.clone(),
                pool: Some(pool),
                token: None,
            }),
        }
    }

    pub(crate) fn with_token(&self, token: Arc<TokenHandle>) -> Context {
        Context {
            cancel: self.cancel.clone(),
            deadline: self.deadline,
            inner: Arc::new(ContextInner {
                run_id: self.inner.run_id,
                collector: self.inner.collector.clone(),
                cache: self.inner.cache.clone(),
                pool: self.inner.pool.clone(),
                token: Some(token),
            }),
        }
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, fmt: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        fmt.debug_struct("Context")
            .field("run_id", &self.inner.run_id)
            .field("cancelled", &self.is_cancelled())
            .field("deadline", &self.deadline)
            .field("has_collector", &self.inner.collector.is_some())
            .field("has_cache", &self.inner.cache.is_some())
            .field("has_limiter", &self.inner.pool.is_some())
            .finish()
    }
}

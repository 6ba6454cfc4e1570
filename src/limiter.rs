//! Bounded-parallelism limiter.
//!
//! A limiter caps the number of workers concurrently participating in one
//! logical request. The pool travels on the [`Context`]; workers call
//! [`acquire`] before doing work and hold the returned [`Permit`] for its
//! duration. A worker that must block on its own children wraps the
//! blocking section in [`temporarily_release`] so the pool is not starved
//! from within.

use std::future::Future;
use std::sync::Arc;

use log::debug;
use parking_lot::Mutex;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::Context;

/// A pool of parallelism tokens attached to a context. `semaphore` is
/// `None` for an unlimited pool.
pub(crate) struct Pool {
    semaphore: Option<Arc<Semaphore>>,
}

/// Shared state of one acquired token. The context returned by [`acquire`]
/// carries this handle so nested code can temporarily give the token back.
pub(crate) struct TokenHandle {
    state: Mutex<TokenState>,
}

struct TokenState {
    /// The semaphore permit while the token is held. `None` while lent out
    /// by `temporarily_release` or after terminal release.
    permit: Option<OwnedSemaphorePermit>,

    /// Set once the owning `Permit` is dropped. Makes release idempotent
    /// and tells an in-flight temporary release not to reacquire.
    released: bool,

    /// Nesting depth of `temporarily_release` regions. Only the outermost
    /// region moves the permit.
    lent: u32,
}

impl TokenHandle {
    fn held(permit: OwnedSemaphorePermit) -> Arc<TokenHandle> {
        Arc::new(TokenHandle {
            state: Mutex::new(TokenState {
                permit: Some(permit),
                released: false,
                lent: 0,
            }),
        })
    }

    fn noop() -> Arc<TokenHandle> {
        Arc::new(TokenHandle {
            state: Mutex::new(TokenState {
                permit: None,
                released: true,
                lent: 0,
            }),
        })
    }
}

/// Release handle for one acquired token. Dropping it returns the token to
/// the pool; release is idempotent.
pub struct Permit {
    handle: Arc<TokenHandle>,
}

impl Permit {
    /// Explicitly returns the token. Equivalent to dropping the permit.
    pub fn release(self) {}
}

impl Drop for Permit {
    fn drop(&mut self) {
        let mut state = self.handle.state.lock();
        state.released = true;
        // Dropping the semaphore permit hands the slot to the next waiter.
        state.permit.take();
    }
}

/// Derives a context carrying a fresh pool of `capacity` tokens.
/// `capacity == 0` means unlimited.
pub fn with(ctx: &Context, capacity: usize) -> Context {
    let semaphore = if capacity == 0 {
        None
    } else {
        Some(Arc::new(Semaphore::new(capacity)))
    };
    ctx.with_pool(Arc::new(Pool { semaphore }))
}

/// Blocks until a token is available or `ctx` is cancelled.
///
/// The returned context carries the live token so that
/// [`temporarily_release`] can find it. When `ctx` carries no limiter, is
/// unlimited, or is cancelled before a token frees up, the returned
/// [`Permit`] is a no-op and the context is unchanged.
pub async fn acquire(ctx: &Context) -> (Context, Permit) {
    let semaphore = match ctx.pool().and_then(|pool| pool.semaphore.clone()) {
        Some(semaphore) => semaphore,
        None => {
            return (
                ctx.clone(),
                Permit {
                    handle: TokenHandle::noop(),
                },
            )
        }
    };

    tokio::select! {
        biased;
        _ = ctx.cancelled() => {
            debug!("limiter acquire abandoned by cancellation");
            (
                ctx.clone(),
                Permit {
                    handle: TokenHandle::noop(),
                },
            )
        }
        permit = semaphore.acquire_owned() => {
            let permit = permit.expect("limiter semaphore is never closed");
            let handle = TokenHandle::held(permit);
            let ctx = ctx.with_token(handle.clone());
            (ctx, Permit { handle })
        }
    }
}

/// Runs `fut` with the current token returned to the pool.
///
/// Within the dynamic extent of `fut` the caller's token is available to
/// other workers; on exit a token is reacquired (blocking) before control
/// returns. Nesting is supported: only the outermost region moves the
/// token. If the caller's token was already released -- a race with the
/// outer release -- `fut` still runs and no token is reacquired. On a
/// context without a held token this is just `fut.await`.
pub async fn temporarily_release<F, T>(ctx: &Context, fut: F) -> T
where
    F: Future<Output = T>,
{
    let handle = match ctx.token() {
        Some(handle) => handle.clone(),
        None => return fut.await,
    };

    let gave_up = {
        let mut state = handle.state.lock();
        state.lent += 1;
        let outermost = state.lent == 1 && !state.released && state.permit.is_some();
        if outermost {
            state.permit.take();
            debug!("limiter token temporarily released");
        }
        outermost
    };

    let result = fut.await;

    let reacquire = {
        let mut state = handle.state.lock();
        state.lent -= 1;
        gave_up && state.lent == 0 && !state.released
    };

    if reacquire {
        if let Some(semaphore) = ctx.pool().and_then(|pool| pool.semaphore.clone()) {
            let permit = semaphore
                .acquire_owned()
                .await
                .expect("limiter semaphore is never closed");
            let mut state = handle.state.lock();
            if state.released {
                // Terminal release raced us; give the slot straight back.
                drop(permit);
            } else {
                state.permit = Some(permit);
                debug!("limiter token reacquired");
            }
        }
    }

    result
}

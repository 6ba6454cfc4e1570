use std::fmt;
use std::ops::{Deref, DerefMut};

use tokio::sync::{Mutex as AsyncMutex, MutexGuard};

use crate::{Context, Error};

/// A mutual-exclusion primitive that honors request cancellation.
///
/// `lock` waits for the single ticket but gives up as soon as the context
/// is cancelled or its deadline passes, returning the matching error
/// without ever acquiring. An already-cancelled context never acquires,
/// even if the lock is free.
///
/// Unlocking happens by dropping the guard, so the unlock-before-lock
/// contract violation of a manual unlock API is unrepresentable here.
pub struct CtxMutex<T> {
    inner: AsyncMutex<T>,
}

impl<T> CtxMutex<T> {
    /// Creates the mutex holding `value`.
    pub fn new(value: T) -> CtxMutex<T> {
        CtxMutex {
            inner: AsyncMutex::new(value),
        }
    }

    /// Acquires the lock, or returns `Cancelled` / `DeadlineExceeded` if
    /// `ctx` is (or becomes) cancelled before the ticket is granted.
    pub async fn lock(&self, ctx: &Context) -> Result<CtxMutexGuard<'_, T>, Error> {
        if ctx.is_cancelled() {
            return Err(ctx.cancellation_error());
        }
        tokio::select! {
            biased;
            _ = ctx.cancelled() => Err(ctx.cancellation_error()),
            guard = self.inner.lock() => Ok(CtxMutexGuard { guard }),
        }
    }

    /// Consumes the mutex, returning the inner value.
    pub fn into_inner(self) -> T {
        self.inner.into_inner()
    }
}

impl<T: fmt::Debug> fmt::Debug for CtxMutex<T> {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.inner.try_lock() {
            Ok(guard) => fmt.debug_struct("CtxMutex").field("data", &*guard).finish(),
            Err(_) => fmt.debug_struct("CtxMutex").field("data", &"<locked>").finish(),
        }
    }
}

/// RAII guard for [`CtxMutex`]. The lock is released on drop.
pub struct CtxMutexGuard<'a, T> {
    guard: MutexGuard<'a, T>,
}

impl<'a, T> Deref for CtxMutexGuard<'a, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<'a, T> DerefMut for CtxMutexGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

use std::sync::Arc;

use thiserror::Error;

/// The error surface of the reactive core.
///
/// Every blocking operation in this crate takes a [`Context`] and reports
/// cancellation through the `Cancelled` / `DeadlineExceeded` variants rather
/// than hanging. Domain errors produced by user code (a compute function, a
/// batch bulk function) travel through `User` unchanged; the `Arc` wrapper
/// exists only so one outcome can be fanned out to every waiter of a
/// single-flight computation.
///
/// [`Context`]: crate::Context
#[derive(Clone, Debug, Error)]
pub enum Error {
    /// The context was cancelled before or while the operation blocked.
    #[error("context cancelled")]
    Cancelled,

    /// The context deadline elapsed before or while the operation blocked.
    #[error("context deadline exceeded")]
    DeadlineExceeded,

    /// A cached value was mutated in place after insertion. Only produced
    /// when [`set_debug_cache_mutates`] has enabled snapshot verification.
    ///
    /// [`set_debug_cache_mutates`]: crate::set_debug_cache_mutates
    #[error("cached value mutated after insertion")]
    CacheMutated,

    /// A batch bulk function returned fewer results than it was given
    /// inputs. Delivered to the slots left without a result.
    #[error("batch function returned {got} results for {expected} inputs")]
    ShortBatch {
        /// Number of inputs handed to the bulk function.
        expected: usize,
        /// Number of results it actually returned.
        got: usize,
    },

    /// An API was used outside its contract. The diagnostic is fixed at the
    /// violation site.
    #[error("contract violation: {0}")]
    ContractViolation(&'static str),

    /// The distinguished retry sentinel. Returning this from a compute
    /// function asks the runner to keep the current cache and schedule a
    /// backoff retry instead of terminating.
    #[error("retry requested")]
    Retry,

    /// A domain error from user code, passed through unchanged.
    #[error("{0}")]
    User(Arc<anyhow::Error>),
}

impl Error {
    /// Wraps a domain error for passthrough.
    pub fn user(err: impl Into<anyhow::Error>) -> Error {
        Error::User(Arc::new(err.into()))
    }

    /// True for `Cancelled` and `DeadlineExceeded`.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Error::Cancelled | Error::DeadlineExceeded)
    }

    /// True for the retry sentinel.
    pub fn is_retry(&self) -> bool {
        matches!(self, Error::Retry)
    }
}

impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Error {
        Error::User(Arc::new(err))
    }
}

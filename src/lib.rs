#![warn(rust_2018_idioms)]
#![warn(missing_docs)]

//! The strobe crate is the reactive core of a live-query server. A caller
//! hands a compute function to a [`Rerunner`]; the runner executes it,
//! publishes the result, and re-executes whenever any [`Resource`] the
//! computation registered as a dependency is invalidated -- debounced,
//! cancellable, and with only the invalidated subgraph recomputed thanks
//! to the per-run memoization [`cache`].
//!
//! Around that loop sit the supporting primitives a query tree needs: a
//! [`batch::Batcher`] that coalesces concurrent identical-shape fetches
//! into one bulk call, a [`limiter`] that caps a request's worker fan-out,
//! and a context-aware mutex ([`CtxMutex`]) whose lock honors request
//! cancellation. Everything is threaded through an explicit [`Context`]
//! value.
//!
//! ```no_run
//! use std::time::Duration;
//! use strobe::{add_dependency, Context, Rerunner, Resource};
//!
//! # async fn demo() {
//! let version = Resource::new();
//! let dep = version.clone();
//! let (runner, mut updates) = Rerunner::new(
//!     &Context::background(),
//!     move |ctx| {
//!         let dep = dep.clone();
//!         async move {
//!             add_dependency(&ctx, &dep);
//!             Ok("hello")
//!         }
//!     },
//!     Duration::from_millis(10),
//!     false,
//! );
//!
//! assert_eq!(updates.recv().await.unwrap().unwrap(), "hello");
//! version.invalidate(); // schedules a rerun
//! runner.stop();
//! # }
//! ```

pub mod batch;
pub mod limiter;

mod cache;
mod context;
mod error;
mod mutex;
mod rerunner;
mod resource;
mod snapshot;

pub use crate::cache::{cache, purge_cache, set_debug_cache_mutates};
pub use crate::context::Context;
pub use crate::error::Error;
pub use crate::mutex::{CtxMutex, CtxMutexGuard};
pub use crate::rerunner::{Rerunner, RerunnerOptions, Updates, DEFAULT_RETRY_CAP};
pub use crate::resource::{add_dependency, add_dependency_keyed, dependency_keys, Resource};
pub use crate::snapshot::{CaptureError, Snapshot};

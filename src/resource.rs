//! Invalidation handles and the per-run dependency collector.
//!
//! A [`Resource`] is the primitive data sources use to tell the reactive
//! runner that something it read has changed: register the resource as a
//! dependency of the current run, then [`Resource::invalidate`] it when the
//! underlying data moves. Resources are single-shot -- the first
//! invalidation fires the attached cleanups and the handle is terminal
//! from then on.

use std::fmt;
use std::hash::BuildHasherDefault;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use log::{debug, warn};
use parking_lot::Mutex;
use rustc_hash::FxHasher;
use serde::Serialize;
use smallvec::SmallVec;

use crate::snapshot::Snapshot;
use crate::Context;

pub(crate) type FxIndexMap<K, V> = indexmap::IndexMap<K, V, BuildHasherDefault<FxHasher>>;

type Callback = Box<dyn FnOnce() + Send>;

/// Fired when a registered resource is invalidated; the argument is the
/// resource's id so the runner can ignore resources it is itself releasing.
pub(crate) type InvalidationHook = Arc<dyn Fn(u64) + Send + Sync>;

static NEXT_RESOURCE_ID: AtomicU64 = AtomicU64::new(1);

/// A single-shot invalidation handle.
///
/// Clones share state: invalidating any clone invalidates them all.
#[derive(Clone)]
pub struct Resource {
    inner: Arc<ResourceInner>,
}

struct ResourceInner {
    id: u64,
    state: Mutex<ResourceState>,
}

enum ResourceState {
    Live {
        callbacks: SmallVec<[Callback; 2]>,
    },
    Invalidated,
}

impl Resource {
    /// Returns a live resource.
    pub fn new() -> Resource {
        Resource {
            inner: Arc::new(ResourceInner {
                id: NEXT_RESOURCE_ID.fetch_add(1, Ordering::Relaxed),
                state: Mutex::new(ResourceState::Live {
                    callbacks: SmallVec::new(),
                }),
            }),
        }
    }

    pub(crate) fn id(&self) -> u64 {
        self.inner.id
    }

    /// Whether this resource has been invalidated.
    pub fn is_invalidated(&self) -> bool {
        matches!(*self.inner.state.lock(), ResourceState::Invalidated)
    }

    /// Registers `f` to run after this resource is invalidated. If it
    /// already was, `f` runs immediately on the calling thread.
    pub fn cleanup(&self, f: impl FnOnce() + Send + 'static) {
        let run_now = {
            let mut state = self.inner.state.lock();
            match &mut *state {
                ResourceState::Live { callbacks } => {
                    callbacks.push(Box::new(f));
                    None
                }
                ResourceState::Invalidated => Some(f),
            }
        };
        if let Some(f) = run_now {
            f();
        }
    }

    /// Marks the resource invalidated and runs each registered cleanup
    /// exactly once, in registration order. Idempotent: concurrent and
    /// repeat calls collapse to one invalidation.
    pub fn invalidate(&self) {
        let callbacks = {
            let mut state = self.inner.state.lock();
            match std::mem::replace(&mut *state, ResourceState::Invalidated) {
                ResourceState::Live { callbacks } => callbacks,
                ResourceState::Invalidated => return,
            }
        };
        debug!("resource {} invalidated", self.inner.id);
        for callback in callbacks {
            callback();
        }
    }

    /// Synonym for [`invalidate`], emphasizing the pulse semantics.
    ///
    /// [`invalidate`]: Resource::invalidate
    pub fn strobe(&self) {
        self.invalidate()
    }
}

impl Default for Resource {
    fn default() -> Resource {
        Resource::new()
    }
}

impl fmt::Debug for Resource {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.debug_struct("Resource")
            .field("id", &self.inner.id)
            .field("invalidated", &self.is_invalidated())
            .finish()
    }
}

/// Registers `resource` as a dependency of the computation running on
/// `ctx`. Duplicate adds of one resource within one run are coalesced. On
/// a context without a collector this is a no-op.
pub fn add_dependency(ctx: &Context, resource: &Resource) {
    if let Some(collector) = ctx.collector() {
        collector.add(resource);
    }
}

/// Like [`add_dependency`], additionally attaching a serializable key for
/// external dependency tracking. The key is captured structurally; see
/// [`dependency_keys`].
pub fn add_dependency_keyed<K: Serialize + ?Sized>(ctx: &Context, resource: &Resource, key: &K) {
    if let Some(collector) = ctx.collector() {
        collector.add(resource);
        match Snapshot::capture(key) {
            Ok(snapshot) => collector.add_key(snapshot),
            Err(err) => warn!("dependency key not captured: {}", err),
        }
    }
}

/// The keys attached so far by [`add_dependency_keyed`] on this run's
/// current attach point. Empty on a context without a collector.
pub fn dependency_keys(ctx: &Context) -> Vec<Snapshot> {
    ctx.collector().map_or_else(Vec::new, |c| c.keys())
}

/// Insertion-ordered dedup set of the resources (and keys) one computation
/// registered. One collector exists per run, plus one per in-flight cache
/// entry; entry sets are folded into their parent when the entry
/// completes.
pub(crate) struct DependencyCollector {
    hook: InvalidationHook,
    state: Mutex<CollectorState>,
}

struct CollectorState {
    resources: FxIndexMap<u64, Resource>,
    keys: Vec<Snapshot>,
}

impl DependencyCollector {
    pub(crate) fn new(hook: InvalidationHook) -> DependencyCollector {
        DependencyCollector {
            hook,
            state: Mutex::new(CollectorState {
                resources: FxIndexMap::default(),
                keys: Vec::new(),
            }),
        }
    }

    pub(crate) fn hook(&self) -> InvalidationHook {
        self.hook.clone()
    }

    /// Adds `resource`, wiring the invalidation hook on first sight within
    /// this collector.
    ///
    /// A resource that is already invalidated is still recorded -- the set
    /// it ends up in is permanently stale, so the result is recomputed on
    /// the next run -- but it does not fire the hook: only an invalidation
    /// that *arrives* while a run executes should cancel that run.
    pub(crate) fn add(&self, resource: &Resource) {
        let newly_added = {
            let mut state = self.state.lock();
            match state.resources.entry(resource.id()) {
                indexmap::map::Entry::Occupied(_) => false,
                indexmap::map::Entry::Vacant(entry) => {
                    entry.insert(resource.clone());
                    true
                }
            }
        };
        if newly_added && !resource.is_invalidated() {
            let hook = self.hook.clone();
            let id = resource.id();
            resource.cleanup(move || hook(id));
        }
    }

    pub(crate) fn add_key(&self, key: Snapshot) {
        self.state.lock().keys.push(key);
    }

    pub(crate) fn keys(&self) -> Vec<Snapshot> {
        self.state.lock().keys.clone()
    }

    /// Drains the collector into an immutable set. The collector is empty
    /// afterwards.
    pub(crate) fn freeze(&self) -> DependencySet {
        let mut state = self.state.lock();
        DependencySet {
            resources: state.resources.drain(..).map(|(_, r)| r).collect(),
            keys: std::mem::take(&mut state.keys),
        }
    }
}

/// The frozen dependency set of one completed computation.
pub(crate) struct DependencySet {
    resources: Vec<Resource>,
    keys: Vec<Snapshot>,
}

impl DependencySet {
    pub(crate) fn empty() -> DependencySet {
        DependencySet {
            resources: Vec::new(),
            keys: Vec::new(),
        }
    }

    pub(crate) fn resources(&self) -> &[Resource] {
        &self.resources
    }

    /// True iff no resource in the set has been invalidated.
    pub(crate) fn all_live(&self) -> bool {
        self.resources.iter().all(|r| !r.is_invalidated())
    }

    /// Re-registers every resource and key with the collector on `ctx`.
    /// Used to fold a completed cache entry's dependencies into its
    /// caller, and a reused entry's dependencies into the new run.
    pub(crate) fn propagate(&self, ctx: &Context) {
        if let Some(collector) = ctx.collector() {
            for resource in &self.resources {
                collector.add(resource);
            }
            for key in &self.keys {
                collector.add_key(key.clone());
            }
        }
    }
}

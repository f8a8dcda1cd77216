//! Per-level resource stores.
//!
//! Every scope level owns one store. Entries live in buckets: the shared
//! bucket for levels visible to all threads, or one bucket per thread for
//! thread-local levels. Two strategies implement the same contract:
//!
//! - [`StrongStore`] owns its resources; memory is bounded only by explicit
//!   retirement. Used when scope teardown is reliably signalled.
//! - [`WeakStore`] only observes its resources; the creating thread anchors
//!   them, so abandoned threads release their state without a teardown call.

mod strong;
mod weak;

use std::sync::Arc;
use std::thread::{self, ThreadId};

use serde::{Deserialize, Serialize};

use crate::resource::ScopedResource;
use crate::scope::ScopeKey;

pub use strong::StrongStore;
pub use weak::WeakStore;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Bucket {
    Shared,
    Thread(ThreadId),
}

impl Bucket {
    pub fn current(shared: bool) -> Self {
        if shared {
            Bucket::Shared
        } else {
            Bucket::Thread(thread::current().id())
        }
    }
}

/// Which store strategy backs the scope levels of a resolver.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreStrategy {
    #[default]
    Strong,
    Weak,
}

impl StoreStrategy {
    pub fn as_str(self) -> &'static str {
        match self {
            StoreStrategy::Strong => "strong",
            StoreStrategy::Weak => "weak",
        }
    }
}

/// `(new_key, existing_key)` inheritance predicate of the store's level.
pub type InheritsRef<'a> = &'a (dyn Fn(&ScopeKey, &ScopeKey) -> bool + Send + Sync);

pub trait ResourceStore<R: ScopedResource>: Send + Sync {
    /// Register a live resource in the calling thread's bucket (or the shared
    /// bucket).
    fn add(&self, key: ScopeKey, resource: Arc<R>);

    /// Look up `key` in the calling thread's bucket (or the shared bucket).
    fn find(&self, key: &ScopeKey) -> Option<Arc<R>>;

    /// Look up `key` in every bucket.
    fn find_across_threads(&self, key: &ScopeKey) -> Option<Arc<R>>;

    /// Remove `resource` from under `key` and retire it. Returns `false` when
    /// the entry is already gone.
    fn retire(&self, key: &ScopeKey, resource: &Arc<R>) -> bool;

    /// Remove `resource` from under `key` in every bucket without retiring
    /// it. Returns `false` when the entry is already gone.
    fn detach(&self, key: &ScopeKey, resource: &Arc<R>) -> bool;

    /// Drop whatever is stored under `key` in the calling thread's bucket
    /// without retiring it.
    fn evict(&self, key: &ScopeKey);

    /// The most specific live resource a scope keyed `new_key` may inherit.
    fn find_inheritable(&self, new_key: &ScopeKey, inherits: InheritsRef<'_>) -> Option<Arc<R>>;

    fn live_count(&self) -> usize;

    fn is_shared(&self) -> bool;
}

/// Pick the unique most specific qualifying candidate.
///
/// A candidate qualifies when `new_key` inherits from it. Among qualifying
/// candidates, one that another qualifying candidate inherits from is less
/// specific and drops out. Anything other than exactly one survivor means
/// there is no parent.
pub(crate) fn most_specific<R>(
    candidates: Vec<(ScopeKey, Arc<R>)>,
    new_key: &ScopeKey,
    inherits: InheritsRef<'_>,
) -> Option<Arc<R>> {
    let qualifying: Vec<(ScopeKey, Arc<R>)> = candidates
        .into_iter()
        .filter(|(key, _)| inherits(new_key, key))
        .collect();

    let mut survivors = qualifying.iter().filter(|(key, resource)| {
        !qualifying
            .iter()
            .any(|(other, other_res)| !Arc::ptr_eq(resource, other_res) && inherits(other, key))
    });

    let first = survivors.next()?;
    if survivors.next().is_some() {
        return None;
    }
    Some(first.1.clone())
}

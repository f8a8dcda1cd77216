//! The per-scope resource contract and the crate's reference repository.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::ids::MethodId;

/// A per-scope resource whose lifetime the resolver owns.
///
/// Only these facts are observable to the resolver; whatever the resource
/// holds (arrangements, recorded calls) is its own business.
pub trait ScopedResource: Send + Sync + Sized + 'static {
    /// Build a resource for the scope owned by `owner`, inheriting `parent`.
    fn create(parent: Option<Arc<Self>>, owner: MethodId) -> anyhow::Result<Self>;

    /// Whether another live resource was created with this one as its parent.
    fn is_parent(&self) -> bool;

    fn is_retired(&self) -> bool;

    /// Finalize. Called exactly once per removal from a store; must tolerate
    /// repeated calls.
    fn retire(&self);
}

static REPOSITORY_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Mocking state for one scope: a parent link plus the arrangements made in
/// this scope. Lookups see the parent's arrangements after the local ones.
#[derive(Debug)]
pub struct MockRepository {
    id: u64,
    owner: MethodId,
    parent: Option<Arc<MockRepository>>,
    is_parent: AtomicBool,
    retired: AtomicBool,
    arrangements: Mutex<Vec<String>>,
}

impl MockRepository {
    pub fn new(parent: Option<Arc<MockRepository>>, owner: MethodId) -> Self {
        if let Some(parent) = &parent {
            parent.is_parent.store(true, Ordering::Release);
        }
        MockRepository {
            id: REPOSITORY_COUNTER.fetch_add(1, Ordering::Relaxed),
            owner,
            parent,
            is_parent: AtomicBool::new(false),
            retired: AtomicBool::new(false),
            arrangements: Mutex::new(Vec::new()),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn owner(&self) -> MethodId {
        self.owner
    }

    pub fn parent(&self) -> Option<&Arc<MockRepository>> {
        self.parent.as_ref()
    }

    pub fn arrange(&self, arrangement: impl Into<String>) {
        self.arrangements.lock().push(arrangement.into());
    }

    /// Local arrangements first, then inherited ones.
    pub fn arrangements(&self) -> Vec<String> {
        let mut all = self.arrangements.lock().clone();
        if let Some(parent) = &self.parent {
            all.extend(parent.arrangements());
        }
        all
    }
}

impl ScopedResource for MockRepository {
    fn create(parent: Option<Arc<Self>>, owner: MethodId) -> anyhow::Result<Self> {
        Ok(MockRepository::new(parent, owner))
    }

    fn is_parent(&self) -> bool {
        self.is_parent.load(Ordering::Acquire)
    }

    fn is_retired(&self) -> bool {
        self.retired.load(Ordering::Acquire)
    }

    fn retire(&self) {
        if !self.retired.swap(true, Ordering::AcqRel) {
            self.arrangements.lock().clear();
        }
    }
}

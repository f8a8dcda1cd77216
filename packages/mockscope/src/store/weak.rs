//! Weak-referencing store.
//!
//! The store keeps only `Weak` handles. The strong reference that keeps a
//! resource alive is an anchor in the creating thread's local storage, so a
//! thread that exits without a teardown call takes its resources with it.
//! Dead handles are purged when a lookup trips over them.
//!
//! A resource that becomes the parent of another resource is pinned by the
//! store itself and from then on only leaves through explicit retirement.

use std::any::Any;
use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::{Arc, Weak};

use dashmap::DashMap;

use super::{most_specific, Bucket, InheritsRef, ResourceStore};
use crate::diagnostics::{DiagnosticKind, Diagnostics};
use crate::ids::StoreId;
use crate::resource::ScopedResource;
use crate::scope::ScopeKey;

type Anchor = Arc<dyn Any + Send + Sync>;

thread_local! {
    static ANCHORS: RefCell<HashMap<(StoreId, ScopeKey), Anchor>> = RefCell::new(HashMap::new());
}

struct WeakSlot<R> {
    handle: Weak<R>,
    pinned: Option<Arc<R>>,
}

pub struct WeakStore<R> {
    id: StoreId,
    level: String,
    shared: bool,
    slots: DashMap<(Bucket, ScopeKey), WeakSlot<R>>,
    diagnostics: Arc<Diagnostics>,
}

impl<R: ScopedResource> WeakStore<R> {
    pub fn new(level: impl Into<String>, shared: bool, diagnostics: Arc<Diagnostics>) -> Self {
        WeakStore {
            id: StoreId::fresh(),
            level: level.into(),
            shared,
            slots: DashMap::new(),
            diagnostics,
        }
    }

    pub fn level(&self) -> &str {
        &self.level
    }

    /// Drop every anchor the calling thread holds for this store, as if the
    /// thread had exited. Pinned parents survive.
    pub fn release_thread_anchors(&self) {
        let id = self.id;
        let released: Vec<Anchor> = ANCHORS.with(|anchors| {
            let mut anchors = anchors.borrow_mut();
            let keys: Vec<(StoreId, ScopeKey)> = anchors
                .keys()
                .filter(|(store, _)| *store == id)
                .copied()
                .collect();
            keys.into_iter()
                .filter_map(|key| anchors.remove(&key))
                .collect()
        });
        // Dropped outside the thread-local borrow: a resource's destructor may
        // touch other stores.
        drop(released);
    }

    fn anchor(&self, key: ScopeKey, resource: &Arc<R>) {
        let anchor: Anchor = resource.clone();
        // try_with: during thread teardown the table may already be gone.
        let _ = ANCHORS.try_with(|anchors| {
            anchors.borrow_mut().insert((self.id, key), anchor);
        });
    }

    /// Drop the calling thread's anchor under `key` only if it holds `target`.
    fn unanchor_if(&self, key: &ScopeKey, target: &Weak<R>) {
        let released = ANCHORS
            .try_with(|anchors| {
                let mut anchors = anchors.borrow_mut();
                let holds_target = anchors.get(&(self.id, *key)).is_some_and(|anchor| {
                    std::ptr::eq(
                        Arc::as_ptr(anchor) as *const (),
                        target.as_ptr() as *const (),
                    )
                });
                if holds_target {
                    anchors.remove(&(self.id, *key))
                } else {
                    None
                }
            })
            .ok()
            .flatten();
        drop(released);
    }

    fn unanchor(&self, key: &ScopeKey) {
        let released = ANCHORS
            .try_with(|anchors| anchors.borrow_mut().remove(&(self.id, *key)))
            .ok()
            .flatten();
        drop(released);
    }

    /// Upgrade the slot at `bucket_key`, purging it when the resource is gone.
    fn upgrade(&self, bucket_key: &(Bucket, ScopeKey)) -> Option<Arc<R>> {
        let upgraded = {
            let slot = self.slots.get(bucket_key)?;
            let resource = slot.handle.upgrade();
            let needs_pin = resource
                .as_ref()
                .is_some_and(|res| res.is_parent() && slot.pinned.is_none());
            (resource, needs_pin)
        };
        match upgraded {
            (Some(resource), needs_pin) => {
                if needs_pin {
                    self.pin(bucket_key, &resource);
                }
                Some(resource)
            }
            (None, _) => {
                self.purge(bucket_key);
                None
            }
        }
    }

    fn pin(&self, bucket_key: &(Bucket, ScopeKey), resource: &Arc<R>) {
        if let Some(mut slot) = self.slots.get_mut(bucket_key) {
            if slot.pinned.is_none() && Weak::ptr_eq(&slot.handle, &Arc::downgrade(resource)) {
                slot.pinned = Some(resource.clone());
            }
        }
    }

    fn purge(&self, bucket_key: &(Bucket, ScopeKey)) {
        let removed = self
            .slots
            .remove_if(bucket_key, |_, slot| slot.handle.strong_count() == 0);
        if removed.is_some() {
            log::trace!("purged dead {} handle under {}", self.level, bucket_key.1);
            self.diagnostics.record(DiagnosticKind::DeadHandlePurged {
                level: self.level.clone(),
                key: bucket_key.1,
            });
        }
    }

    fn bucket_keys_for(&self, key: &ScopeKey) -> Vec<(Bucket, ScopeKey)> {
        self.slots
            .iter()
            .filter(|entry| entry.key().1 == *key)
            .map(|entry| *entry.key())
            .collect()
    }
}

impl<R: ScopedResource> ResourceStore<R> for WeakStore<R> {
    fn add(&self, key: ScopeKey, resource: Arc<R>) {
        self.anchor(key, &resource);
        self.slots.insert(
            (Bucket::current(self.shared), key),
            WeakSlot {
                handle: Arc::downgrade(&resource),
                pinned: None,
            },
        );
    }

    fn find(&self, key: &ScopeKey) -> Option<Arc<R>> {
        self.upgrade(&(Bucket::current(self.shared), *key))
    }

    fn find_across_threads(&self, key: &ScopeKey) -> Option<Arc<R>> {
        if let Some(hit) = self.find(key) {
            return Some(hit);
        }
        // Visit every bucket so dead entries for this key get purged too.
        let mut found = None;
        for bucket_key in self.bucket_keys_for(key) {
            if let Some(resource) = self.upgrade(&bucket_key) {
                found.get_or_insert(resource);
            }
        }
        found
    }

    /// Anchors live in the creating thread's local storage, so only the
    /// calling thread's anchor is dropped here. Retiring from another thread
    /// removes the entry and retires the resource at once, but the creator
    /// keeps its anchor until it exits or calls
    /// [`release_thread_anchors`](WeakStore::release_thread_anchors).
    fn retire(&self, key: &ScopeKey, resource: &Arc<R>) -> bool {
        let removed = self.detach(key, resource);
        if removed {
            resource.retire();
            log::debug!("retired {} resource under {}", self.level, key);
        }
        removed
    }

    fn detach(&self, key: &ScopeKey, resource: &Arc<R>) -> bool {
        let target = Arc::downgrade(resource);
        let mut removed = false;
        for bucket_key in self.bucket_keys_for(key) {
            removed |= self
                .slots
                .remove_if(&bucket_key, |_, slot| Weak::ptr_eq(&slot.handle, &target))
                .is_some();
        }
        if removed {
            self.unanchor_if(key, &target);
        }
        removed
    }

    fn evict(&self, key: &ScopeKey) {
        self.slots.remove(&(Bucket::current(self.shared), *key));
        self.unanchor(key);
    }

    fn find_inheritable(&self, new_key: &ScopeKey, inherits: InheritsRef<'_>) -> Option<Arc<R>> {
        let bucket = Bucket::current(self.shared);
        let visible: Vec<(Bucket, ScopeKey)> = self
            .slots
            .iter()
            .filter(|entry| entry.key().0 == bucket || entry.key().0 == Bucket::Shared)
            .map(|entry| *entry.key())
            .collect();

        let candidates: Vec<(ScopeKey, Arc<R>)> = visible
            .iter()
            .filter_map(|bucket_key| {
                self.upgrade(bucket_key)
                    .filter(|res| !res.is_retired())
                    .map(|res| (bucket_key.1, res))
            })
            .collect();

        let parent = most_specific(candidates, new_key, inherits)?;
        // The caller is about to hand this resource to a child; from here on
        // only explicit retirement may release it.
        for bucket_key in visible {
            self.pin(&bucket_key, &parent);
        }
        Some(parent)
    }

    fn live_count(&self) -> usize {
        self.slots
            .iter()
            .filter(|entry| entry.value().handle.strong_count() > 0)
            .count()
    }

    fn is_shared(&self) -> bool {
        self.shared
    }
}

impl<R> Drop for WeakStore<R> {
    fn drop(&mut self) {
        let id = self.id;
        let released: Vec<Anchor> = ANCHORS
            .try_with(|anchors| {
                let mut anchors = anchors.borrow_mut();
                let keys: Vec<(StoreId, ScopeKey)> = anchors
                    .keys()
                    .filter(|(store, _)| *store == id)
                    .copied()
                    .collect();
                keys.into_iter()
                    .filter_map(|key| anchors.remove(&key))
                    .collect()
            })
            .unwrap_or_default();
        drop(released);
    }
}

//! Strong-owning store.

use std::sync::Arc;

use dashmap::DashMap;

use super::{most_specific, Bucket, InheritsRef, ResourceStore};
use crate::resource::ScopedResource;
use crate::scope::ScopeKey;

pub struct StrongStore<R> {
    level: String,
    shared: bool,
    entries: DashMap<(Bucket, ScopeKey), Arc<R>>,
}

impl<R: ScopedResource> StrongStore<R> {
    pub fn new(level: impl Into<String>, shared: bool) -> Self {
        StrongStore {
            level: level.into(),
            shared,
            entries: DashMap::new(),
        }
    }

    pub fn level(&self) -> &str {
        &self.level
    }

    fn visible_candidates(&self) -> Vec<(ScopeKey, Arc<R>)> {
        let bucket = Bucket::current(self.shared);
        self.entries
            .iter()
            .filter(|entry| entry.key().0 == bucket || entry.key().0 == Bucket::Shared)
            .filter(|entry| !entry.value().is_retired())
            .map(|entry| (entry.key().1, entry.value().clone()))
            .collect()
    }
}

impl<R: ScopedResource> ResourceStore<R> for StrongStore<R> {
    fn add(&self, key: ScopeKey, resource: Arc<R>) {
        self.entries
            .insert((Bucket::current(self.shared), key), resource);
    }

    fn find(&self, key: &ScopeKey) -> Option<Arc<R>> {
        self.entries
            .get(&(Bucket::current(self.shared), *key))
            .map(|entry| entry.value().clone())
    }

    fn find_across_threads(&self, key: &ScopeKey) -> Option<Arc<R>> {
        if let Some(hit) = self.find(key) {
            return Some(hit);
        }
        self.entries
            .iter()
            .find(|entry| entry.key().1 == *key)
            .map(|entry| entry.value().clone())
    }

    fn retire(&self, key: &ScopeKey, resource: &Arc<R>) -> bool {
        let removed = self.detach(key, resource);
        if removed {
            resource.retire();
            log::debug!("retired {} resource under {}", self.level, key);
        }
        removed
    }

    fn detach(&self, key: &ScopeKey, resource: &Arc<R>) -> bool {
        let bucket_keys: Vec<(Bucket, ScopeKey)> = self
            .entries
            .iter()
            .filter(|entry| entry.key().1 == *key && Arc::ptr_eq(entry.value(), resource))
            .map(|entry| *entry.key())
            .collect();

        let mut removed = false;
        for bucket_key in bucket_keys {
            removed |= self
                .entries
                .remove_if(&bucket_key, |_, stored| Arc::ptr_eq(stored, resource))
                .is_some();
        }
        removed
    }

    fn evict(&self, key: &ScopeKey) {
        self.entries.remove(&(Bucket::current(self.shared), *key));
    }

    fn find_inheritable(&self, new_key: &ScopeKey, inherits: InheritsRef<'_>) -> Option<Arc<R>> {
        most_specific(self.visible_candidates(), new_key, inherits)
    }

    fn live_count(&self) -> usize {
        self.entries.len()
    }

    fn is_shared(&self) -> bool {
        self.shared
    }
}

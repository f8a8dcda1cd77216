//! Collapse synthesized async continuation frames onto their declared method.
//!
//! An `.await` resumes inside the state machine's continuation method, not in
//! the method the user wrote. Scope matching works on declared methods, so
//! every frame whose declaring class is a synthesized state machine is mapped
//! back to the method of the enclosing class that owns that state machine.

use std::sync::Arc;

use dashmap::DashMap;

use crate::frame::RawFrame;
use crate::ids::MethodId;
use crate::metadata::MetadataCatalog;

pub struct FrameNormalizer {
    catalog: Arc<MetadataCatalog>,
    cache: DashMap<MethodId, MethodId>,
}

impl FrameNormalizer {
    pub fn new(catalog: Arc<MetadataCatalog>) -> Self {
        FrameNormalizer {
            catalog,
            cache: DashMap::new(),
        }
    }

    /// Lazily map `frames` (innermost first) to declared method descriptors.
    pub fn normalize<'a>(
        &'a self,
        frames: &'a [RawFrame],
    ) -> impl Iterator<Item = MethodId> + 'a {
        frames.iter().map(move |frame| self.declared_method(frame.method))
    }

    /// The declared method for a single raw frame. Pure and cached.
    pub fn declared_method(&self, raw: MethodId) -> MethodId {
        if let Some(hit) = self.cache.get(&raw) {
            return *hit;
        }
        let resolved = self.owning_method(raw).unwrap_or(raw);
        self.cache.insert(raw, resolved);
        resolved
    }

    fn owning_method(&self, raw: MethodId) -> Option<MethodId> {
        let machine = self.catalog.class_of(raw)?;
        let machine_info = self.catalog.class(machine)?;
        if !machine_info.is_async_state_machine {
            return None;
        }
        let enclosing = machine_info.enclosing?;
        let owner = self
            .catalog
            .methods_of(enclosing)
            .find(|method| method.state_machine == Some(machine))
            .map(|method| method.id);
        if owner.is_none() {
            log::trace!(
                "no owning method for state machine '{}'; keeping raw frame",
                machine_info.name
            );
        }
        owner
    }

    pub fn cached_len(&self) -> usize {
        self.cache.len()
    }
}

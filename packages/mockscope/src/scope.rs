//! Scope levels and the registry that matches them against a stack.
//!
//! A level describes one kind of scope (test method, fixture setup, assembly
//! setup): which frames belong to it, how to derive the key identifying one
//! instance of it, and which live instances a newly created scope may inherit
//! from. Levels are registered most specific first; exactly one is the leaf.

use std::fmt;

use serde::Serialize;

use crate::error::ScopeError;
use crate::ids::{ClassId, MethodId, ModuleId};

/// Identifies one instance of a scope level. Compared by equality only.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScopeKey {
    Method(MethodId),
    Class(ClassId),
    Module(ModuleId),
    /// Local fallback keyed by the first caller outside the mocking system.
    Caller(MethodId),
    /// Local fallback when no caller frame is available at all.
    Ambient,
}

impl fmt::Display for ScopeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScopeKey::Method(id) => write!(f, "method#{}", id.raw()),
            ScopeKey::Class(id) => write!(f, "class#{}", id.raw()),
            ScopeKey::Module(id) => write!(f, "module#{}", id.raw()),
            ScopeKey::Caller(id) => write!(f, "caller#{}", id.raw()),
            ScopeKey::Ambient => write!(f, "ambient"),
        }
    }
}

pub type MatchFn = Box<dyn Fn(MethodId) -> bool + Send + Sync>;
pub type KeyFn = Box<dyn Fn(MethodId) -> ScopeKey + Send + Sync>;
/// `(new_key, existing_key)`: whether a scope keyed `new_key` may inherit the
/// live resource stored under `existing_key`.
pub type InheritsFn = Box<dyn Fn(&ScopeKey, &ScopeKey) -> bool + Send + Sync>;

pub struct ScopeLevel {
    name: String,
    matches: MatchFn,
    key_of: KeyFn,
    inherits_from: InheritsFn,
    is_leaf: bool,
    shared_across_threads: bool,
}

impl ScopeLevel {
    pub fn new(
        name: impl Into<String>,
        matches: impl Fn(MethodId) -> bool + Send + Sync + 'static,
        key_of: impl Fn(MethodId) -> ScopeKey + Send + Sync + 'static,
    ) -> Self {
        ScopeLevel {
            name: name.into(),
            matches: Box::new(matches),
            key_of: Box::new(key_of),
            inherits_from: Box::new(|_, _| false),
            is_leaf: false,
            shared_across_threads: false,
        }
    }

    pub fn leaf(mut self) -> Self {
        self.is_leaf = true;
        self
    }

    pub fn shared_across_threads(mut self) -> Self {
        self.shared_across_threads = true;
        self
    }

    pub fn inherits_from(
        mut self,
        inherits: impl Fn(&ScopeKey, &ScopeKey) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.inherits_from = Box::new(inherits);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_leaf(&self) -> bool {
        self.is_leaf
    }

    pub fn is_shared(&self) -> bool {
        self.shared_across_threads
    }

    pub fn matches(&self, method: MethodId) -> bool {
        (self.matches)(method)
    }

    pub fn key_of(&self, method: MethodId) -> ScopeKey {
        (self.key_of)(method)
    }

    pub fn inherits(&self, new_key: &ScopeKey, existing_key: &ScopeKey) -> bool {
        (self.inherits_from)(new_key, existing_key)
    }
}

impl fmt::Debug for ScopeLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScopeLevel")
            .field("name", &self.name)
            .field("is_leaf", &self.is_leaf)
            .field("shared_across_threads", &self.shared_across_threads)
            .finish_non_exhaustive()
    }
}

/// The frame that selected a level, and the key it produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LevelMatch {
    pub level: usize,
    pub method: MethodId,
    pub key: ScopeKey,
    /// Further distinct leaf-matching frames found outside the chosen one.
    pub shadowed_leaves: Vec<MethodId>,
}

impl LevelMatch {
    pub fn is_ambiguous(&self) -> bool {
        !self.shadowed_leaves.is_empty()
    }
}

#[derive(Debug)]
pub struct ScopeRegistry {
    levels: Vec<ScopeLevel>,
    leaf: usize,
}

impl ScopeRegistry {
    pub fn new(levels: Vec<ScopeLevel>) -> Result<Self, ScopeError> {
        let leaves: Vec<usize> = levels
            .iter()
            .enumerate()
            .filter(|(_, level)| level.is_leaf())
            .map(|(idx, _)| idx)
            .collect();
        let [leaf] = leaves[..] else {
            return Err(ScopeError::LeafCount {
                found: leaves.len(),
            });
        };
        Ok(ScopeRegistry { levels, leaf })
    }

    pub fn levels(&self) -> &[ScopeLevel] {
        &self.levels
    }

    pub fn level(&self, idx: usize) -> Option<&ScopeLevel> {
        self.levels.get(idx)
    }

    pub fn leaf_index(&self) -> usize {
        self.leaf
    }

    pub fn leaf(&self) -> &ScopeLevel {
        &self.levels[self.leaf]
    }

    pub fn len(&self) -> usize {
        self.levels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.levels.is_empty()
    }

    /// Innermost frame matching any level, levels tested in registration
    /// order for each frame.
    #[cfg(test)]
    pub(crate) fn find_matching_level(
        &self,
        descriptors: impl IntoIterator<Item = MethodId>,
    ) -> Option<LevelMatch> {
        let descriptors: Vec<MethodId> = descriptors.into_iter().collect();
        let mut found = None;
        for (pos, method) in descriptors.iter().copied().enumerate() {
            if let Some(level) = self.levels.iter().position(|level| level.matches(method)) {
                found = Some((pos, level, method));
                break;
            }
        }
        let (pos, level, method) = found?;
        let shadowed_leaves = if self.levels[level].is_leaf() {
            self.distinct_leaves(&descriptors[pos + 1..], method)
        } else {
            Vec::new()
        };
        Some(LevelMatch {
            level,
            method,
            key: self.levels[level].key_of(method),
            shadowed_leaves,
        })
    }

    /// Innermost frame matching the leaf level anywhere on the stack.
    pub fn find_leaf(&self, descriptors: &[MethodId]) -> Option<LevelMatch> {
        let leaf = self.leaf();
        let pos = descriptors.iter().position(|m| leaf.matches(*m))?;
        let method = descriptors[pos];
        Some(LevelMatch {
            level: self.leaf,
            method,
            key: leaf.key_of(method),
            shadowed_leaves: self.distinct_leaves(&descriptors[pos + 1..], method),
        })
    }

    /// Innermost frame matching a non-leaf level.
    pub fn find_outer(&self, descriptors: &[MethodId]) -> Option<LevelMatch> {
        descriptors.iter().copied().find_map(|method| {
            self.levels
                .iter()
                .enumerate()
                .filter(|(idx, _)| *idx != self.leaf)
                .find(|(_, level)| level.matches(method))
                .map(|(level, info)| LevelMatch {
                    level,
                    method,
                    key: info.key_of(method),
                    shadowed_leaves: Vec::new(),
                })
        })
    }

    /// Leaf match for a descriptor obtained outside the stack.
    pub fn match_leaf_descriptor(&self, method: MethodId) -> Option<LevelMatch> {
        let leaf = self.leaf();
        leaf.matches(method).then(|| LevelMatch {
            level: self.leaf,
            method,
            key: leaf.key_of(method),
            shadowed_leaves: Vec::new(),
        })
    }

    pub fn is_inheritable(&self, level: usize, candidate: &ScopeKey, new_key: &ScopeKey) -> bool {
        self.levels
            .get(level)
            .is_some_and(|info| info.inherits(new_key, candidate))
    }

    fn distinct_leaves(&self, rest: &[MethodId], chosen: MethodId) -> Vec<MethodId> {
        let leaf = self.leaf();
        let mut shadowed: Vec<MethodId> = Vec::new();
        for method in rest.iter().copied() {
            if method != chosen && !shadowed.contains(&method) && leaf.matches(method) {
                shadowed.push(method);
            }
        }
        shadowed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(raw: u64) -> MethodId {
        MethodId::from_raw(raw)
    }

    fn registry() -> ScopeRegistry {
        // 1..=9 are tests, 10..=19 fixture setups, 20.. assembly setups.
        ScopeRegistry::new(vec![
            ScopeLevel::new("test", |m| m.raw() < 10, ScopeKey::Method).leaf(),
            ScopeLevel::new(
                "fixture",
                |m| (10..20).contains(&m.raw()),
                |m| ScopeKey::Class(ClassId::from_raw(m.raw())),
            )
            .shared_across_threads(),
            ScopeLevel::new(
                "assembly",
                |m| m.raw() >= 20,
                |_| ScopeKey::Module(ModuleId::from_raw(1)),
            )
            .shared_across_threads(),
        ])
        .unwrap()
    }

    #[test]
    fn test_registry_requires_exactly_one_leaf() {
        let err = ScopeRegistry::new(vec![ScopeLevel::new("a", |_| true, ScopeKey::Method)])
            .unwrap_err();
        assert!(matches!(err, ScopeError::LeafCount { found: 0 }));

        let err = ScopeRegistry::new(vec![
            ScopeLevel::new("a", |_| true, ScopeKey::Method).leaf(),
            ScopeLevel::new("b", |_| true, ScopeKey::Method).leaf(),
        ])
        .unwrap_err();
        assert!(matches!(err, ScopeError::LeafCount { found: 2 }));
    }

    #[test]
    fn test_innermost_frame_wins() {
        let registry = registry();
        let found = registry
            .find_matching_level([id(100), id(12), id(3)])
            .unwrap();
        assert_eq!(found.level, 1);
        assert_eq!(found.method, id(12));
        assert_eq!(found.key, ScopeKey::Class(ClassId::from_raw(12)));
    }

    #[test]
    fn test_no_match() {
        let registry = registry();
        assert!(registry.find_matching_level([id(100)]).is_none());
        assert!(registry.find_leaf(&[id(12), id(25)]).is_none());
    }

    #[test]
    fn test_nested_leaf_frames_are_reported() {
        let registry = registry();
        let found = registry.find_leaf(&[id(2), id(5), id(2), id(5)]).unwrap();
        assert_eq!(found.method, id(2));
        assert_eq!(found.shadowed_leaves, vec![id(5)]);
        assert!(found.is_ambiguous());

        // Recursion through the same test is not ambiguous.
        let found = registry.find_leaf(&[id(4), id(100), id(4)]).unwrap();
        assert!(!found.is_ambiguous());
    }

    #[test]
    fn test_find_outer_skips_leaf() {
        let registry = registry();
        let found = registry.find_outer(&[id(1), id(21), id(11)]).unwrap();
        assert_eq!(found.level, 2);
        assert_eq!(found.method, id(21));
    }

    #[test]
    fn test_is_inheritable_delegates() {
        let registry = ScopeRegistry::new(vec![
            ScopeLevel::new("test", |_| true, ScopeKey::Method).leaf(),
            ScopeLevel::new("fixture", |_| false, ScopeKey::Method)
                .inherits_from(|new_key, existing| match (new_key, existing) {
                    (ScopeKey::Method(a), ScopeKey::Method(b)) => a.raw() > b.raw(),
                    _ => false,
                }),
        ])
        .unwrap();
        let old = ScopeKey::Method(id(1));
        let new = ScopeKey::Method(id(2));
        assert!(registry.is_inheritable(1, &old, &new));
        assert!(!registry.is_inheritable(1, &new, &old));
        assert!(!registry.is_inheritable(0, &old, &new));
        assert!(!registry.is_inheritable(7, &old, &new));
    }
}

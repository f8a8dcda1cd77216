//! Core identifier types for the program model and stores.
//!
//! All IDs are lightweight Copy types using newtype pattern for type safety.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Identity of a declared method or constructor (a method descriptor).
///
/// Assigned by the [`CatalogBuilder`](crate::metadata::CatalogBuilder); never
/// constructed by the resolver itself.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MethodId(pub u64);

/// Identity of a declared class (fixture type, synthesized state machine, ...).
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClassId(pub u64);

/// Identity of a module (assembly) in the running program.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ModuleId(pub u64);

/// Unique identifier for a resource store instance.
///
/// Weak stores anchor resources in per-thread tables keyed by this id so that
/// independent resolvers never share anchors.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct StoreId(pub u64);

static STORE_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

impl MethodId {
    /// Owner of a scope with no caller frame at all. Catalog ids start at 1.
    pub const UNKNOWN: MethodId = MethodId(0);

    pub fn from_raw(value: u64) -> Self {
        MethodId(value)
    }

    /// Get the raw value.
    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl ClassId {
    pub fn from_raw(value: u64) -> Self {
        ClassId(value)
    }

    /// Get the raw value.
    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl ModuleId {
    pub fn from_raw(value: u64) -> Self {
        ModuleId(value)
    }

    /// Get the raw value.
    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl StoreId {
    /// Create a fresh unique StoreId.
    pub fn fresh() -> Self {
        StoreId(STORE_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

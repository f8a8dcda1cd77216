//! Structural markers: declarative tags naming a method's role in a suite.

use std::sync::Arc;

use dashmap::DashMap;
use once_cell::sync::OnceCell;

use crate::ids::MethodId;
use crate::metadata::MetadataCatalog;

/// A marker type name, resolved lazily against the catalog.
///
/// Resolution answers whether the marker type exists in the running process
/// (the framework's support library is loaded). The answer never changes for
/// a given catalog, so it is computed once.
#[derive(Debug)]
pub struct StructuralMarker {
    name: String,
    available: OnceCell<bool>,
}

impl StructuralMarker {
    pub fn new(name: impl Into<String>) -> Self {
        StructuralMarker {
            name: name.into(),
            available: OnceCell::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_available(&self, catalog: &MetadataCatalog) -> bool {
        *self
            .available
            .get_or_init(|| catalog.is_marker_defined(&self.name))
    }

    pub fn matches(&self, catalog: &MetadataCatalog, method: MethodId) -> bool {
        self.is_available(catalog) && catalog.has_marker(method, &self.name)
    }
}

/// A group of markers sharing one role, with per-method match caching.
#[derive(Debug)]
pub struct MarkerSet {
    catalog: Arc<MetadataCatalog>,
    markers: Vec<StructuralMarker>,
    matches: DashMap<MethodId, bool>,
}

impl MarkerSet {
    pub fn new<S: AsRef<str>>(catalog: Arc<MetadataCatalog>, names: &[S]) -> Self {
        MarkerSet {
            catalog,
            markers: names
                .iter()
                .map(|name| StructuralMarker::new(name.as_ref()))
                .collect(),
            matches: DashMap::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.markers.is_empty()
    }

    pub fn names(&self) -> Vec<String> {
        self.markers.iter().map(|m| m.name().to_string()).collect()
    }

    /// At least one marker of the set resolves in this process.
    pub fn any_available(&self) -> bool {
        self.markers.iter().any(|m| m.is_available(&self.catalog))
    }

    pub fn matches(&self, method: MethodId) -> bool {
        if let Some(hit) = self.matches.get(&method) {
            return *hit;
        }
        let result = self
            .markers
            .iter()
            .any(|marker| marker.matches(&self.catalog, method));
        self.matches.insert(method, result);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::CatalogBuilder;

    #[test]
    fn test_undefined_marker_never_matches() {
        let mut builder = CatalogBuilder::new();
        let module = builder.module("suite");
        let fixture = builder.class(module, "Fixture");
        let test = builder.method(fixture, "case");
        builder.mark(test, "Test");
        let catalog = builder.build();

        let marker = StructuralMarker::new("Test");
        assert!(!marker.is_available(&catalog));
        assert!(!marker.matches(&catalog, test));
    }

    #[test]
    fn test_marker_set_matches_any() {
        let mut builder = CatalogBuilder::new();
        let module = builder.module("suite");
        let fixture = builder.class(module, "Fixture");
        let fact = builder.method(fixture, "fact");
        let theory = builder.method(fixture, "theory");
        let plain = builder.method(fixture, "plain");
        builder
            .mark(fact, "Fact")
            .mark(theory, "Theory")
            .define_markers(["Fact", "Theory"]);
        let set = MarkerSet::new(Arc::new(builder.build()), &["Fact", "Theory"]);

        assert!(set.any_available());
        assert!(set.matches(fact));
        assert!(set.matches(theory));
        assert!(!set.matches(plain));
        // Second lookup is served from the cache.
        assert!(set.matches(fact));
    }
}

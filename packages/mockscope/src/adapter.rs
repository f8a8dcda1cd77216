//! Host test framework adapters.
//!
//! An adapter is a declarative [`MarkerTable`]: which markers denote a test
//! method, per-test setup/teardown, per-fixture setup/teardown and assembly
//! setup, plus the fixture instancing and keying policy. The table produces a
//! three-level [`ScopeRegistry`] (test, fixture, assembly). Adapters are only
//! activated when their markers resolve in the running process.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::diagnostics::{DiagnosticKind, Diagnostics};
use crate::error::{AssertionFailed, HostAssertionError, ScopeError};
use crate::ids::{ClassId, MethodId};
use crate::marker::MarkerSet;
use crate::metadata::{MetadataCatalog, MethodKind};
use crate::scope::{ScopeKey, ScopeLevel, ScopeRegistry};

/// Translates a generic assertion failure into the host framework's error.
pub type ExceptionFactory =
    Arc<dyn Fn(&str, Option<anyhow::Error>) -> anyhow::Error + Send + Sync>;

pub fn default_exception_factory() -> ExceptionFactory {
    Arc::new(|message: &str, inner: Option<anyhow::Error>| {
        anyhow::Error::new(AssertionFailed {
            message: message.to_string(),
            inner: inner.map(Into::into),
        })
    })
}

/// How often a fixture class is instantiated.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FixtureInstancing {
    /// One instance per fixture; its constructor belongs to the fixture scope.
    #[default]
    PerFixture,
    /// A fresh instance per test; its constructor acts as per-test setup.
    PerTest,
}

/// What identifies one instance of the test (leaf) scope.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeafKeying {
    #[default]
    TestMethod,
    /// The declaring class on the current thread. Needed when per-test setup
    /// runs in frames other than the test method itself.
    DeclaringClass,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarkerTable {
    pub framework: String,
    #[serde(default)]
    pub test_method: Vec<String>,
    #[serde(default)]
    pub test_setup: Vec<String>,
    #[serde(default)]
    pub fixture_setup: Vec<String>,
    #[serde(default)]
    pub assembly_setup: Vec<String>,
    #[serde(default)]
    pub fixture_instancing: FixtureInstancing,
    #[serde(default)]
    pub leaf_keying: LeafKeying,
    /// Class name of the framework's native assertion failure.
    #[serde(default)]
    pub assertion_error: Option<String>,
}

fn names(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

impl MarkerTable {
    /// Attribute-driven suites: explicit setup/teardown markers, one fixture
    /// instance shared by its tests.
    pub fn classic() -> Self {
        MarkerTable {
            framework: "classic".to_string(),
            test_method: names(&["Test", "TestCase"]),
            test_setup: names(&["SetUp", "TearDown"]),
            fixture_setup: names(&["OneTimeSetUp", "OneTimeTearDown"]),
            assembly_setup: names(&["AssemblySetUp", "AssemblyTearDown"]),
            fixture_instancing: FixtureInstancing::PerFixture,
            leaf_keying: LeafKeying::DeclaringClass,
            assertion_error: Some("AssertionException".to_string()),
        }
    }

    /// Constructor-driven suites: a new fixture instance per test, the
    /// constructor doubling as per-test setup.
    pub fn constructor() -> Self {
        MarkerTable {
            framework: "constructor".to_string(),
            test_method: names(&["Fact", "Theory"]),
            test_setup: Vec::new(),
            fixture_setup: names(&["ClassFixture"]),
            assembly_setup: names(&["CollectionFixture"]),
            fixture_instancing: FixtureInstancing::PerTest,
            leaf_keying: LeafKeying::DeclaringClass,
            assertion_error: Some("AssertActualExpectedException".to_string()),
        }
    }

    /// Initialize/cleanup conventions at test, class and assembly level.
    pub fn initialize() -> Self {
        MarkerTable {
            framework: "initialize".to_string(),
            test_method: names(&["TestMethod", "DataTestMethod"]),
            test_setup: names(&["TestInitialize", "TestCleanup"]),
            fixture_setup: names(&["ClassInitialize", "ClassCleanup"]),
            assembly_setup: names(&["AssemblyInitialize", "AssemblyCleanup"]),
            fixture_instancing: FixtureInstancing::PerTest,
            leaf_keying: LeafKeying::DeclaringClass,
            assertion_error: Some("AssertFailedException".to_string()),
        }
    }

    /// Every marker type this table refers to.
    pub fn all_markers(&self) -> impl Iterator<Item = &str> {
        self.test_method
            .iter()
            .chain(&self.test_setup)
            .chain(&self.fixture_setup)
            .chain(&self.assembly_setup)
            .map(String::as_str)
    }

    /// Build the test / fixture / assembly registry for `catalog`.
    pub fn build_registry(&self, catalog: Arc<MetadataCatalog>) -> Result<ScopeRegistry, ScopeError> {
        Ok(ScopeRegistry::new(vec![
            self.test_level(catalog.clone()),
            self.fixture_level(catalog.clone()),
            self.assembly_level(catalog),
        ])?)
    }

    fn test_level(&self, catalog: Arc<MetadataCatalog>) -> ScopeLevel {
        let tests = MarkerSet::new(catalog.clone(), &self.test_method);
        let setups = MarkerSet::new(catalog.clone(), &self.test_setup);
        let test_names = self.test_method.clone();
        let per_test = self.fixture_instancing == FixtureInstancing::PerTest;
        let keying = self.leaf_keying;
        let match_catalog = catalog.clone();

        ScopeLevel::new(
            "test",
            move |method| {
                tests.matches(method)
                    || setups.matches(method)
                    || (per_test
                        && is_fixture_constructor(
                            &match_catalog,
                            method,
                            MethodKind::Constructor,
                            &test_names,
                        ))
            },
            move |method| match keying {
                LeafKeying::TestMethod => ScopeKey::Method(method),
                LeafKeying::DeclaringClass => catalog
                    .class_of(method)
                    .map(ScopeKey::Class)
                    .unwrap_or(ScopeKey::Method(method)),
            },
        )
        .leaf()
    }

    fn fixture_level(&self, catalog: Arc<MetadataCatalog>) -> ScopeLevel {
        let setups = MarkerSet::new(catalog.clone(), &self.fixture_setup);
        let test_names = self.test_method.clone();
        let per_fixture = self.fixture_instancing == FixtureInstancing::PerFixture;
        let match_catalog = catalog.clone();
        let key_catalog = catalog.clone();

        ScopeLevel::new(
            "fixture",
            move |method| {
                setups.matches(method)
                    || is_fixture_constructor(
                        &match_catalog,
                        method,
                        MethodKind::StaticConstructor,
                        &test_names,
                    )
                    || (per_fixture
                        && is_fixture_constructor(
                            &match_catalog,
                            method,
                            MethodKind::Constructor,
                            &test_names,
                        ))
            },
            move |method| {
                key_catalog
                    .class_of(method)
                    .map(ScopeKey::Class)
                    .unwrap_or(ScopeKey::Method(method))
            },
        )
        .shared_across_threads()
        .inherits_from(move |new_key, existing| {
            let ScopeKey::Class(ancestor) = existing else {
                return false;
            };
            class_of_key(&catalog, new_key)
                .is_some_and(|class| catalog.is_subclass_of(class, *ancestor))
        })
    }

    fn assembly_level(&self, catalog: Arc<MetadataCatalog>) -> ScopeLevel {
        let setups = MarkerSet::new(catalog.clone(), &self.assembly_setup);
        let key_catalog = catalog.clone();

        ScopeLevel::new(
            "assembly",
            move |method| setups.matches(method),
            move |method| {
                key_catalog
                    .module_of(method)
                    .map(ScopeKey::Module)
                    .unwrap_or(ScopeKey::Method(method))
            },
        )
        .shared_across_threads()
        .inherits_from(move |new_key, existing| {
            let ScopeKey::Module(module) = existing else {
                return false;
            };
            let new_module = match new_key {
                ScopeKey::Module(m) => Some(*m),
                ScopeKey::Method(m) | ScopeKey::Caller(m) => catalog.module_of(*m),
                ScopeKey::Class(c) => catalog.class(*c).map(|info| info.module),
                ScopeKey::Ambient => None,
            };
            new_module == Some(*module)
        })
    }
}

fn is_fixture_constructor(
    catalog: &MetadataCatalog,
    method: MethodId,
    kind: MethodKind,
    test_markers: &[String],
) -> bool {
    let Some(info) = catalog.method(method) else {
        return false;
    };
    info.kind == kind && catalog.declares_marked_method(info.class, test_markers)
}

fn class_of_key(catalog: &MetadataCatalog, key: &ScopeKey) -> Option<ClassId> {
    match key {
        ScopeKey::Class(class) => Some(*class),
        ScopeKey::Method(method) | ScopeKey::Caller(method) => catalog.class_of(*method),
        ScopeKey::Module(_) | ScopeKey::Ambient => None,
    }
}

pub trait FrameworkAdapter: Send + Sync {
    fn name(&self) -> &str;

    fn marker_table(&self) -> &MarkerTable;

    /// The framework's support library is loaded: its test-method markers
    /// resolve against the catalog.
    fn is_available(&self, catalog: &MetadataCatalog) -> bool {
        self.marker_table()
            .test_method
            .iter()
            .any(|marker| catalog.is_marker_defined(marker))
    }

    fn build_registry(&self, catalog: Arc<MetadataCatalog>) -> Result<ScopeRegistry, ScopeError> {
        self.marker_table().build_registry(catalog)
    }

    /// Factory raising the framework's own assertion failure, when its type
    /// can be located.
    fn exception_factory(&self, catalog: &MetadataCatalog) -> Option<ExceptionFactory> {
        let type_name = self.marker_table().assertion_error.clone()?;
        catalog.class_by_name(&type_name)?;
        let framework = self.name().to_string();
        Some(Arc::new(move |message: &str, inner: Option<anyhow::Error>| {
            anyhow::Error::new(HostAssertionError {
                framework: framework.clone(),
                type_name: type_name.clone(),
                message: message.to_string(),
                inner: inner.map(Into::into),
            })
        }))
    }
}

/// The built-in presets, in probing order.
pub fn builtin_tables() -> Vec<MarkerTable> {
    vec![
        MarkerTable::classic(),
        MarkerTable::constructor(),
        MarkerTable::initialize(),
    ]
}

/// Adapter driven entirely by a marker table.
#[derive(Debug, Clone)]
pub struct TableAdapter {
    table: MarkerTable,
}

impl TableAdapter {
    pub fn new(table: MarkerTable) -> Self {
        TableAdapter { table }
    }
}

impl FrameworkAdapter for TableAdapter {
    fn name(&self) -> &str {
        &self.table.framework
    }

    fn marker_table(&self) -> &MarkerTable {
        &self.table
    }
}

/// The adapter chosen for this process, with its populated registry.
pub struct ActiveFramework {
    pub name: String,
    pub registry: ScopeRegistry,
    pub exception_factory: ExceptionFactory,
}

impl std::fmt::Debug for ActiveFramework {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActiveFramework")
            .field("name", &self.name)
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}

#[derive(Default)]
pub struct FrameworkRegistry {
    adapters: Vec<Box<dyn FrameworkAdapter>>,
}

impl FrameworkRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding the built-in presets, in probing order.
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        for table in builtin_tables() {
            registry.adapters.push(Box::new(TableAdapter::new(table)));
        }
        registry
    }

    pub fn contains(&self, name: &str) -> bool {
        self.adapters.iter().any(|a| a.name() == name)
    }

    pub fn register(&mut self, adapter: Box<dyn FrameworkAdapter>) -> Result<(), ScopeError> {
        if self.contains(adapter.name()) {
            return Err(ScopeError::DuplicateAdapter {
                name: adapter.name().to_string(),
            });
        }
        self.adapters.push(adapter);
        Ok(())
    }

    pub fn names(&self) -> Vec<String> {
        self.adapters.iter().map(|a| a.name().to_string()).collect()
    }

    /// Probe adapters in registration order and activate the first available
    /// one. `enabled` restricts the candidates by name when non-empty.
    pub fn activate(
        &self,
        catalog: &Arc<MetadataCatalog>,
        enabled: &[String],
        diagnostics: &Diagnostics,
    ) -> Result<ActiveFramework, ScopeError> {
        for adapter in &self.adapters {
            if !enabled.is_empty() && !enabled.iter().any(|name| name == adapter.name()) {
                continue;
            }
            if !adapter.is_available(catalog) {
                log::debug!(
                    "framework adapter '{}' unavailable: markers not defined",
                    adapter.name()
                );
                diagnostics.record(DiagnosticKind::AdapterUnavailable {
                    framework: adapter.name().to_string(),
                });
                continue;
            }
            let registry = adapter.build_registry(catalog.clone())?;
            let exception_factory = adapter
                .exception_factory(catalog)
                .unwrap_or_else(default_exception_factory);
            log::debug!("activated framework adapter '{}'", adapter.name());
            return Ok(ActiveFramework {
                name: adapter.name().to_string(),
                registry,
                exception_factory,
            });
        }
        Err(ScopeError::NoAdapterAvailable)
    }
}

//! Resolution orchestrator.
//!
//! A [`Resolver`] answers "which resource belongs to the code running right
//! now": it snapshots the stack, normalizes async continuations, finds the
//! active scope and then finds, inherits or creates that scope's resource.
//!
//! Scope lookup order:
//!
//! 1. the leaf level, anywhere on the stack (innermost leaf frame wins);
//! 2. the async bridge's remembered test method;
//! 3. the other levels, innermost frame outward;
//! 4. the local fallback store, keyed by the first caller outside the mocking
//!    system's own modules (only with [`CreateMode::CreateScopedOrFallbackLocal`]).
//!
//! Every resolve and retire on one resolver is serialized by a reentrant lock,
//! so a resource constructor may itself call back into the resolver.

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::{Mutex, ReentrantMutex};

use crate::adapter::{
    builtin_tables, default_exception_factory, ExceptionFactory, FrameworkAdapter,
    FrameworkRegistry, TableAdapter,
};
use crate::config::{load_config, MockscopeConfig};
use crate::diagnostics::{DiagnosticKind, Diagnostics};
use crate::error::{unwrap_initialization, ScopeError};
use crate::flow::AsyncContextBridge;
use crate::frame::{ShadowStack, StackSource};
use crate::ids::{MethodId, ModuleId};
use crate::metadata::MetadataCatalog;
use crate::normalize::FrameNormalizer;
use crate::resource::ScopedResource;
use crate::scope::{LevelMatch, ScopeKey, ScopeLevel, ScopeRegistry};
use crate::scope_debug_log;
use crate::store::{ResourceStore, StoreStrategy, StrongStore, WeakStore};

/// Whether `resolve` may construct a missing resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateMode {
    Never,
    CreateScoped,
    /// Like `CreateScoped`, but outside any recognized scope use the
    /// caller-keyed local fallback store.
    CreateScopedOrFallbackLocal,
}

impl CreateMode {
    fn creates(self) -> bool {
        !matches!(self, CreateMode::Never)
    }
}

/// Where the active scope was found.
#[derive(Debug, Clone, Copy)]
enum Origin {
    Stack,
    /// Remembered by the async bridge. The code may have resumed on another
    /// thread than the one that created the scope's resource.
    Bridge,
}

impl Origin {
    fn lookup<R: ScopedResource>(
        self,
        store: &dyn ResourceStore<R>,
        key: &ScopeKey,
    ) -> Option<Arc<R>> {
        match self {
            Origin::Stack => store.find(key),
            Origin::Bridge => store.find_across_threads(key),
        }
    }
}

/// Constructs a resource from its parent and owning method.
pub type ResourceFactory<R> =
    Arc<dyn Fn(Option<Arc<R>>, MethodId) -> anyhow::Result<R> + Send + Sync>;

pub struct Resolver<R: ScopedResource> {
    catalog: Arc<MetadataCatalog>,
    framework: Option<String>,
    registry: ScopeRegistry,
    stores: Vec<Box<dyn ResourceStore<R>>>,
    fallback: StrongStore<R>,
    normalizer: FrameNormalizer,
    bridge: AsyncContextBridge,
    stack: Box<dyn StackSource>,
    factory: ResourceFactory<R>,
    exception_factory: ExceptionFactory,
    diagnostics: Arc<Diagnostics>,
    internal_modules: HashSet<ModuleId>,
    local_fallback: bool,
    reported_ambiguities: Mutex<HashSet<(MethodId, Vec<MethodId>)>>,
    lock: ReentrantMutex<()>,
}

impl<R: ScopedResource> Resolver<R> {
    pub fn builder(catalog: Arc<MetadataCatalog>) -> ResolverBuilder<R> {
        ResolverBuilder::new(catalog)
    }

    /// Find the active scope's resource, creating it when `mode` allows.
    pub fn resolve(&self, mode: CreateMode) -> anyhow::Result<Option<Arc<R>>> {
        let descriptors = self.descriptors();
        let _guard = self.lock.lock();

        let Some((found, origin)) = self.locate(&descriptors) else {
            return match mode {
                CreateMode::CreateScopedOrFallbackLocal if self.local_fallback => {
                    self.resolve_local(&descriptors).map(Some)
                }
                _ => Ok(None),
            };
        };

        let store = &self.stores[found.level];
        if let Some(existing) = origin.lookup(store.as_ref(), &found.key) {
            if existing.is_retired() {
                scope_debug_log!("purging retired resource under {}", found.key);
                store.detach(&found.key, &existing);
            } else if existing.is_parent() {
                // Existing children keep their link to it.
                log::debug!(
                    "{} resource under {} already has children, replacing it",
                    self.level_name(found.level),
                    found.key
                );
                store.detach(&found.key, &existing);
            } else {
                return Ok(Some(existing));
            }
        }

        if !mode.creates() {
            return Ok(None);
        }

        let parent = self.find_parent(found.level, &found.key);
        let resource = self.construct(parent, found.method)?;
        store.add(found.key, resource.clone());
        log::debug!(
            "created {} resource under {} for method#{}",
            self.level_name(found.level),
            found.key,
            found.method.raw()
        );
        Ok(Some(resource))
    }

    /// Retire the active scope's resource. Returns `false` when there is none.
    pub fn retire(&self) -> bool {
        let descriptors = self.descriptors();
        let _guard = self.lock.lock();

        match self.locate(&descriptors) {
            Some((found, origin)) => {
                let store = &self.stores[found.level];
                let Some(resource) = origin.lookup(store.as_ref(), &found.key) else {
                    return false;
                };
                let retired = store.retire(&found.key, &resource);
                if retired && found.level == self.registry.leaf_index() {
                    self.forget_bridged(&found.key);
                }
                retired
            }
            None => {
                let key = self.fallback_key(&descriptors);
                match self.fallback.find(&key) {
                    Some(resource) => self.fallback.retire(&key, &resource),
                    None => false,
                }
            }
        }
    }

    /// The scope the calling code runs in, without touching any store.
    pub fn current_scope(&self) -> Option<LevelMatch> {
        let descriptors = self.descriptors();
        let _guard = self.lock.lock();
        self.locate(&descriptors).map(|(found, _)| found)
    }

    /// Remember the test method on the stack so code resumed after an
    /// `.await` can still find its scope. Returns the captured method.
    pub fn capture_async_context(&self) -> Option<MethodId> {
        let descriptors = self.descriptors();
        let found = self.registry.find_leaf(&descriptors)?;
        self.bridge.capture(found.method);
        scope_debug_log!("captured method#{} for async flow", found.method.raw());
        Some(found.method)
    }

    pub fn bridge(&self) -> &AsyncContextBridge {
        &self.bridge
    }

    pub fn exception_factory(&self) -> &ExceptionFactory {
        &self.exception_factory
    }

    /// Build the active framework's assertion failure.
    pub fn fail(&self, message: &str, inner: Option<anyhow::Error>) -> anyhow::Error {
        (self.exception_factory)(message, inner)
    }

    /// Live entries per level, the local fallback store last (as `"local"`).
    pub fn live_count(&self) -> Vec<(String, usize)> {
        self.registry
            .levels()
            .iter()
            .zip(&self.stores)
            .map(|(level, store)| (level.name().to_string(), store.live_count()))
            .chain(std::iter::once((
                self.fallback.level().to_string(),
                self.fallback.live_count(),
            )))
            .collect()
    }

    pub fn diagnostics(&self) -> &Arc<Diagnostics> {
        &self.diagnostics
    }

    pub fn registry(&self) -> &ScopeRegistry {
        &self.registry
    }

    pub fn catalog(&self) -> &Arc<MetadataCatalog> {
        &self.catalog
    }

    /// Name of the activated framework adapter, if any.
    pub fn framework(&self) -> Option<&str> {
        self.framework.as_deref()
    }

    fn descriptors(&self) -> Vec<MethodId> {
        let frames = self.stack.snapshot();
        self.normalizer.normalize(&frames).collect()
    }

    fn locate(&self, descriptors: &[MethodId]) -> Option<(LevelMatch, Origin)> {
        if let Some(found) = self.registry.find_leaf(descriptors) {
            if found.is_ambiguous() && self.first_ambiguity(&found) {
                log::warn!(
                    "nested test methods on one stack: using method#{}, ignoring {:?}",
                    found.method.raw(),
                    found.shadowed_leaves
                );
                self.diagnostics.record(DiagnosticKind::AmbiguousScope {
                    chosen: found.method,
                    shadowed: found.shadowed_leaves.clone(),
                });
            }
            return Some((found, Origin::Stack));
        }

        if let Some(found) = self
            .bridge
            .get()
            .and_then(|method| self.registry.match_leaf_descriptor(method))
        {
            scope_debug_log!("scope from async bridge: method#{}", found.method.raw());
            return Some((found, Origin::Bridge));
        }

        self.registry
            .find_outer(descriptors)
            .map(|found| (found, Origin::Stack))
    }

    /// Whether this `(chosen, shadowed)` combination has not been reported yet.
    fn first_ambiguity(&self, found: &LevelMatch) -> bool {
        self.reported_ambiguities
            .lock()
            .insert((found.method, found.shadowed_leaves.clone()))
    }

    /// Clear the bridge if it remembers a method keyed to the retired leaf.
    fn forget_bridged(&self, key: &ScopeKey) {
        let leaf = self.registry.leaf();
        if self
            .bridge
            .get()
            .is_some_and(|method| leaf.key_of(method) == *key)
        {
            scope_debug_log!("clearing async bridge for retired {}", key);
            self.bridge.clear();
        }
    }

    /// First outer level (less specific than `level`) offering a unique
    /// inheritable resource.
    fn find_parent(&self, level: usize, new_key: &ScopeKey) -> Option<Arc<R>> {
        let leaf = self.registry.leaf_index();
        self.registry
            .levels()
            .iter()
            .enumerate()
            .skip(level + 1)
            .filter(|(idx, _)| *idx != leaf)
            .find_map(|(idx, info)| {
                let inherits = |new: &ScopeKey, existing: &ScopeKey| info.inherits(new, existing);
                let parent = self.stores[idx].find_inheritable(new_key, &inherits);
                if parent.is_some() {
                    scope_debug_log!("{} inherits from {} level", new_key, info.name());
                }
                parent
            })
    }

    fn construct(&self, parent: Option<Arc<R>>, owner: MethodId) -> anyhow::Result<Arc<R>> {
        (self.factory)(parent, owner)
            .map(Arc::new)
            .map_err(unwrap_initialization)
    }

    fn resolve_local(&self, descriptors: &[MethodId]) -> anyhow::Result<Arc<R>> {
        let key = self.fallback_key(descriptors);
        if let Some(existing) = self.fallback.find(&key) {
            if !existing.is_retired() {
                return Ok(existing);
            }
            self.fallback.evict(&key);
        }
        let owner = match key {
            ScopeKey::Caller(method) => method,
            _ => MethodId::UNKNOWN,
        };
        let resource = self.construct(None, owner)?;
        self.fallback.add(key, resource.clone());
        log::debug!("created local fallback resource under {}", key);
        Ok(resource)
    }

    fn fallback_key(&self, descriptors: &[MethodId]) -> ScopeKey {
        descriptors
            .iter()
            .copied()
            .find(|method| !self.is_internal(*method))
            .map(ScopeKey::Caller)
            .unwrap_or(ScopeKey::Ambient)
    }

    fn is_internal(&self, method: MethodId) -> bool {
        self.catalog.is_internal(method)
            || self
                .catalog
                .module_of(method)
                .is_some_and(|module| self.internal_modules.contains(&module))
    }

    fn level_name(&self, level: usize) -> &str {
        self.registry.level(level).map(ScopeLevel::name).unwrap_or("?")
    }
}

/// Assembles a [`Resolver`] from a catalog, configuration, stack source and
/// framework adapters.
pub struct ResolverBuilder<R: ScopedResource> {
    catalog: Arc<MetadataCatalog>,
    config: MockscopeConfig,
    stack: Option<Box<dyn StackSource>>,
    adapters: Vec<Box<dyn FrameworkAdapter>>,
    builtin: bool,
    registry: Option<ScopeRegistry>,
    factory: Option<ResourceFactory<R>>,
    diagnostics: Option<Arc<Diagnostics>>,
}

impl<R: ScopedResource> ResolverBuilder<R> {
    pub fn new(catalog: Arc<MetadataCatalog>) -> Self {
        ResolverBuilder {
            catalog,
            config: MockscopeConfig::default(),
            stack: None,
            adapters: Vec::new(),
            builtin: true,
            registry: None,
            factory: None,
            diagnostics: None,
        }
    }

    /// Builder configured from the discovered `mockscope.toml`, if any, with
    /// `MOCKSCOPE_STORE` applied on top.
    pub fn from_environment(catalog: Arc<MetadataCatalog>) -> Result<Self, ScopeError> {
        let config = load_config(None)?.unwrap_or_default().apply_env()?;
        Ok(Self::new(catalog).config(config))
    }

    pub fn config(mut self, config: MockscopeConfig) -> Self {
        self.config = config;
        self
    }

    pub fn store(mut self, strategy: StoreStrategy) -> Self {
        self.config.store = strategy;
        self
    }

    /// Defaults to the per-thread [`ShadowStack`].
    pub fn stack_source(mut self, stack: impl StackSource + 'static) -> Self {
        self.stack = Some(Box::new(stack));
        self
    }

    /// Probed after tables from the config and before the built-in presets.
    pub fn adapter(mut self, adapter: impl FrameworkAdapter + 'static) -> Self {
        self.adapters.push(Box::new(adapter));
        self
    }

    pub fn without_builtin_adapters(mut self) -> Self {
        self.builtin = false;
        self
    }

    /// Use explicit scope levels instead of activating a framework adapter.
    pub fn registry(mut self, registry: ScopeRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Replace [`ScopedResource::create`] as the constructor.
    pub fn factory(
        mut self,
        factory: impl Fn(Option<Arc<R>>, MethodId) -> anyhow::Result<R> + Send + Sync + 'static,
    ) -> Self {
        self.factory = Some(Arc::new(factory));
        self
    }

    pub fn diagnostics(mut self, diagnostics: Arc<Diagnostics>) -> Self {
        self.diagnostics = Some(diagnostics);
        self
    }

    pub fn build(self) -> Result<Resolver<R>, ScopeError> {
        let diagnostics = self.diagnostics.unwrap_or_default();
        let catalog = self.catalog;

        let (framework, registry, exception_factory) = match self.registry {
            Some(registry) => (None, registry, default_exception_factory()),
            None => {
                let mut frameworks = FrameworkRegistry::new();
                for table in &self.config.frameworks {
                    frameworks.register(Box::new(TableAdapter::new(table.clone())))?;
                }
                for adapter in self.adapters {
                    frameworks.register(adapter)?;
                }
                if self.builtin {
                    for table in builtin_tables() {
                        if !frameworks.contains(&table.framework) {
                            frameworks.register(Box::new(TableAdapter::new(table)))?;
                        }
                    }
                }
                match frameworks.activate(&catalog, &self.config.enable, &diagnostics) {
                    Ok(active) => (
                        Some(active.name),
                        active.registry,
                        active.exception_factory,
                    ),
                    Err(ScopeError::NoAdapterAvailable) => {
                        log::info!("no test framework detected; only local fallback scopes apply");
                        (None, unscoped_registry()?, default_exception_factory())
                    }
                    Err(err) => return Err(err),
                }
            }
        };

        let stores: Vec<Box<dyn ResourceStore<R>>> = registry
            .levels()
            .iter()
            .map(|level| -> Box<dyn ResourceStore<R>> {
                match self.config.store {
                    StoreStrategy::Strong => {
                        Box::new(StrongStore::new(level.name(), level.is_shared()))
                    }
                    StoreStrategy::Weak => Box::new(WeakStore::new(
                        level.name(),
                        level.is_shared(),
                        diagnostics.clone(),
                    )),
                }
            })
            .collect();

        let internal_modules = self
            .config
            .internal_modules
            .iter()
            .filter_map(|name| catalog.module_by_name(name))
            .collect();

        log::debug!(
            "resolver ready: framework={:?} store={} levels={}",
            framework,
            self.config.store.as_str(),
            registry.len()
        );

        Ok(Resolver {
            normalizer: FrameNormalizer::new(catalog.clone()),
            catalog,
            framework,
            registry,
            stores,
            fallback: StrongStore::new("local", false),
            bridge: AsyncContextBridge::new(),
            stack: self.stack.unwrap_or_else(|| Box::new(ShadowStack::new())),
            factory: self
                .factory
                .unwrap_or_else(|| Arc::new(|parent, owner| R::create(parent, owner))),
            exception_factory,
            diagnostics,
            internal_modules,
            local_fallback: self.config.local_fallback,
            reported_ambiguities: Mutex::new(HashSet::new()),
            lock: ReentrantMutex::new(()),
        })
    }
}

/// A registry whose single leaf level never matches.
fn unscoped_registry() -> Result<ScopeRegistry, ScopeError> {
    ScopeRegistry::new(vec![
        ScopeLevel::new("test", |_| false, ScopeKey::Method).leaf()
    ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::MarkerTable;
    use crate::error::InitializationError;
    use crate::metadata::CatalogBuilder;
    use crate::resource::MockRepository;

    struct Suite {
        catalog: Arc<MetadataCatalog>,
        fixture_ctor: MethodId,
        test_a: MethodId,
        test_b: MethodId,
        helper: MethodId,
        arrange: MethodId,
    }

    fn suite() -> Suite {
        let mut builder = CatalogBuilder::new();
        let core = builder.internal_module("mockscope.core");
        let api = builder.class(core, "Mock");
        let arrange = builder.method(api, "arrange");

        let module = builder.module("orders.tests");
        let fixture = builder.class(module, "OrderTests");
        let fixture_ctor = builder.constructor(fixture);
        let test_a = builder.method(fixture, "places_order");
        let test_b = builder.method(fixture, "cancels_order");
        let helpers = builder.class(module, "Helpers");
        let helper = builder.method(helpers, "make_order");
        builder
            .mark(test_a, "Test")
            .mark(test_b, "Test")
            .define_markers(MarkerTable::classic().all_markers().collect::<Vec<_>>());

        Suite {
            catalog: Arc::new(builder.build()),
            fixture_ctor,
            test_a,
            test_b,
            helper,
            arrange,
        }
    }

    fn resolver(catalog: &Arc<MetadataCatalog>) -> Resolver<MockRepository> {
        Resolver::builder(catalog.clone())
            .stack_source(ShadowStack::new())
            .build()
            .unwrap()
    }

    #[test]
    fn test_resolve_creates_once_per_scope() {
        let s = suite();
        let resolver = resolver(&s.catalog);
        assert_eq!(resolver.framework(), Some("classic"));

        let _test = ShadowStack::enter(s.test_a);
        let _helper = ShadowStack::enter(s.helper);
        let first = resolver.resolve(CreateMode::CreateScoped).unwrap().unwrap();
        let second = resolver.resolve(CreateMode::Never).unwrap().unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.owner(), s.test_a);
    }

    #[test]
    fn test_never_mode_does_not_create() {
        let s = suite();
        let resolver = resolver(&s.catalog);
        let _test = ShadowStack::enter(s.test_a);
        assert!(resolver.resolve(CreateMode::Never).unwrap().is_none());
        assert!(!resolver.retire());
    }

    #[test]
    fn test_retire_then_resolve_builds_fresh_resource() {
        let s = suite();
        let resolver = resolver(&s.catalog);
        let _test = ShadowStack::enter(s.test_a);

        let first = resolver.resolve(CreateMode::CreateScoped).unwrap().unwrap();
        assert!(resolver.retire());
        assert!(first.is_retired());
        assert!(!resolver.retire());
        assert!(resolver.resolve(CreateMode::Never).unwrap().is_none());

        let second = resolver.resolve(CreateMode::CreateScoped).unwrap().unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn test_fixture_resource_becomes_parent() {
        let s = suite();
        let resolver = resolver(&s.catalog);

        let fixture = ShadowStack::call(s.fixture_ctor, || {
            resolver.resolve(CreateMode::CreateScoped).unwrap().unwrap()
        });
        fixture.arrange("orders.count() -> 3");

        let test = ShadowStack::call(s.test_a, || {
            resolver.resolve(CreateMode::CreateScoped).unwrap().unwrap()
        });
        assert!(Arc::ptr_eq(test.parent().unwrap(), &fixture));
        assert_eq!(test.arrangements(), vec!["orders.count() -> 3".to_string()]);
    }

    #[test]
    fn test_nested_test_methods_record_diagnostic() {
        let s = suite();
        let resolver = resolver(&s.catalog);
        let _outer = ShadowStack::enter(s.test_b);
        let _inner = ShadowStack::enter(s.test_a);

        let found = resolver.current_scope().unwrap();
        assert_eq!(found.method, s.test_a);
        resolver.resolve(CreateMode::CreateScoped).unwrap();
        assert!(resolver.retire());
        assert_eq!(
            resolver.diagnostics().kinds(),
            vec![DiagnosticKind::AmbiguousScope {
                chosen: s.test_a,
                shadowed: vec![s.test_b],
            }]
        );

        // A different nesting is a new report.
        let _again = ShadowStack::enter(s.test_b);
        assert_eq!(resolver.current_scope().unwrap().method, s.test_b);
        assert_eq!(resolver.diagnostics().len(), 2);
    }

    #[test]
    fn test_local_fallback_keyed_by_first_external_caller() {
        let s = suite();
        let resolver = resolver(&s.catalog);
        let _helper = ShadowStack::enter(s.helper);
        let _api = ShadowStack::enter(s.arrange);

        assert!(resolver.resolve(CreateMode::CreateScoped).unwrap().is_none());
        let local = resolver
            .resolve(CreateMode::CreateScopedOrFallbackLocal)
            .unwrap()
            .unwrap();
        assert_eq!(local.owner(), s.helper);
        assert!(resolver.retire());
        assert!(local.is_retired());
    }

    #[test]
    fn test_local_fallback_can_be_disabled() {
        let s = suite();
        let config = MockscopeConfig {
            local_fallback: false,
            ..MockscopeConfig::default()
        };
        let resolver = Resolver::<MockRepository>::builder(s.catalog.clone())
            .config(config)
            .build()
            .unwrap();
        let _helper = ShadowStack::enter(s.helper);
        assert!(resolver
            .resolve(CreateMode::CreateScopedOrFallbackLocal)
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_initialization_error_is_unwrapped() {
        let s = suite();
        let resolver = Resolver::<MockRepository>::builder(s.catalog.clone())
            .factory(|_, _| {
                Err(InitializationError::new(anyhow::anyhow!("fixture setup exploded")).into())
            })
            .build()
            .unwrap();
        let _test = ShadowStack::enter(s.test_a);

        let err = resolver.resolve(CreateMode::CreateScoped).unwrap_err();
        assert!(err.downcast_ref::<InitializationError>().is_none());
        assert_eq!(err.to_string(), "fixture setup exploded");
    }

    #[test]
    fn test_no_framework_uses_fallback_only() {
        let mut builder = CatalogBuilder::new();
        let module = builder.module("scratch");
        let class = builder.class(module, "Main");
        let main = builder.method(class, "main");
        let catalog = Arc::new(builder.build());

        let resolver = resolver(&catalog);
        assert!(resolver.framework().is_none());
        let _main = ShadowStack::enter(main);
        assert!(resolver.current_scope().is_none());
        assert!(resolver
            .resolve(CreateMode::CreateScopedOrFallbackLocal)
            .unwrap()
            .is_some());
        let counts = resolver.live_count();
        assert_eq!(counts.last(), Some(&("local".to_string(), 1)));
    }

    #[test]
    fn test_fail_uses_default_factory() {
        let s = suite();
        let resolver = resolver(&s.catalog);
        let err = resolver.fail("expected call", None);
        assert_eq!(err.to_string(), "assertion failed: expected call");
    }
}

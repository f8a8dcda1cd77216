use mockscope::{
    CatalogBuilder, CreateMode, DiagnosticKind, MarkerTable, MetadataCatalog, MethodId,
    MockRepository, Resolver, ScopedResource, ShadowStack, StoreStrategy,
};
use std::sync::Arc;
use std::thread;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn catalog() -> (Arc<MetadataCatalog>, MethodId, MethodId) {
    let mut builder = CatalogBuilder::new();
    let module = builder.module("search.tests");
    let fixture = builder.class(module, "IndexTests");
    let setup = builder.method(fixture, "build_index");
    let test = builder.method(fixture, "finds_document");
    builder
        .mark(setup, "OneTimeSetUp")
        .mark(test, "Test")
        .define_markers(MarkerTable::classic().all_markers().collect::<Vec<_>>());
    (Arc::new(builder.build()), setup, test)
}

fn weak_resolver(catalog: &Arc<MetadataCatalog>) -> Arc<Resolver<MockRepository>> {
    Arc::new(
        Resolver::builder(catalog.clone())
            .store(StoreStrategy::Weak)
            .build()
            .unwrap(),
    )
}

fn live(resolver: &Resolver<MockRepository>, level: &str) -> usize {
    resolver
        .live_count()
        .into_iter()
        .find(|(name, _)| name == level)
        .map(|(_, count)| count)
        .unwrap_or(0)
}

#[test]
fn test_abandoned_thread_releases_its_scope() {
    init_logging();
    let (catalog, _, test) = catalog();
    let resolver = weak_resolver(&catalog);

    let worker = resolver.clone();
    thread::spawn(move || {
        ShadowStack::call(test, || {
            let repo = worker.resolve(CreateMode::CreateScoped).unwrap().unwrap();
            repo.arrange("index.size() -> 10");
        });
        // Exits without retiring.
    })
    .join()
    .unwrap();

    assert_eq!(live(&resolver, "test"), 0);
}

#[test]
fn test_dead_handle_is_purged_once() {
    let (catalog, setup, _) = catalog();
    let resolver = weak_resolver(&catalog);

    let worker = resolver.clone();
    thread::spawn(move || {
        ShadowStack::call(setup, || {
            worker.resolve(CreateMode::CreateScoped).unwrap();
        });
    })
    .join()
    .unwrap();

    ShadowStack::call(setup, || {
        assert!(resolver.resolve(CreateMode::Never).unwrap().is_none());
        assert!(resolver.resolve(CreateMode::Never).unwrap().is_none());
    });
    let purged = resolver
        .diagnostics()
        .kinds()
        .into_iter()
        .filter(|kind| matches!(kind, DiagnosticKind::DeadHandlePurged { .. }))
        .count();
    assert_eq!(purged, 1);
}

#[test]
fn test_parent_survives_creator_thread() {
    let (catalog, setup, test) = catalog();
    let resolver = weak_resolver(&catalog);

    let worker = resolver.clone();
    let (fixture_id, child) = thread::spawn(move || {
        let fixture = ShadowStack::call(setup, || {
            worker.resolve(CreateMode::CreateScoped).unwrap().unwrap()
        });
        let child = ShadowStack::call(test, || {
            worker.resolve(CreateMode::CreateScoped).unwrap().unwrap()
        });
        assert!(Arc::ptr_eq(child.parent().unwrap(), &fixture));
        (fixture.id(), child)
    })
    .join()
    .unwrap();

    assert_eq!(live(&resolver, "fixture"), 1);
    let fixture = child.parent().unwrap().clone();
    assert_eq!(fixture.id(), fixture_id);

    // Only explicit retirement releases a pinned parent.
    let _frame = ShadowStack::enter(setup);
    assert!(resolver.retire());
    assert!(fixture.is_retired());
    assert!(!resolver.retire());
    assert!(resolver.resolve(CreateMode::Never).unwrap().is_none());
    assert_eq!(live(&resolver, "fixture"), 0);
}

#[test]
fn test_retire_on_creating_thread() {
    let (catalog, _, test) = catalog();
    let resolver = weak_resolver(&catalog);
    let _frame = ShadowStack::enter(test);

    let repo = resolver.resolve(CreateMode::CreateScoped).unwrap().unwrap();
    assert_eq!(live(&resolver, "test"), 1);
    assert!(resolver.retire());
    assert!(repo.is_retired());
    assert_eq!(live(&resolver, "test"), 0);
}

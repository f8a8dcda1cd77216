use mockscope::{
    AsyncContextBridge, CatalogBuilder, CreateMode, MarkerTable, MethodId, MockRepository,
    Resolver, ScopedResource, ShadowStack,
};
use std::sync::Arc;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn suite() -> (Resolver<MockRepository>, MethodId, MethodId) {
    let mut builder = CatalogBuilder::new();
    let module = builder.module("inventory.tests");
    let fixture = builder.class(module, "StockTests");
    let (test, move_next) = builder.async_method(fixture, "restocks_async");
    builder
        .mark(test, "Fact")
        .define_markers(MarkerTable::constructor().all_markers().collect::<Vec<_>>());
    let resolver = Resolver::builder(Arc::new(builder.build())).build().unwrap();
    (resolver, test, move_next)
}

#[test]
fn test_continuation_frame_resolves_to_declared_test() {
    init_logging();
    let (resolver, test, move_next) = suite();
    let _frame = ShadowStack::enter(move_next);

    let scope = resolver.current_scope().unwrap();
    assert_eq!(scope.method, test);
    let repo = resolver.resolve(CreateMode::CreateScoped).unwrap().unwrap();
    assert_eq!(repo.owner(), test);
}

#[test]
fn test_snapshot_carries_scope_to_another_thread() {
    let (resolver, test, _) = suite();
    let resolver = Arc::new(resolver);

    let created = ShadowStack::call(test, || {
        assert_eq!(resolver.capture_async_context(), Some(test));
        resolver.resolve(CreateMode::CreateScoped).unwrap().unwrap()
    });
    let snapshot = AsyncContextBridge::snapshot();

    let remote = resolver.clone();
    let (with_context, without_context) = std::thread::spawn(move || {
        let with_context = snapshot.run(|| remote.resolve(CreateMode::Never).unwrap());
        let without_context = remote.resolve(CreateMode::Never).unwrap();
        (with_context, without_context)
    })
    .join()
    .unwrap();

    assert!(Arc::ptr_eq(&created, &with_context.unwrap()));
    assert!(without_context.is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_scope_survives_await_on_other_workers() {
    init_logging();
    let (resolver, test, _) = suite();
    let resolver = Arc::new(resolver);

    let task_resolver = resolver.clone();
    let (created, resumed) = tokio::spawn(AsyncContextBridge::flow(async move {
        let created = {
            let _frame = ShadowStack::enter(test);
            task_resolver.capture_async_context();
            task_resolver
                .resolve(CreateMode::CreateScoped)
                .unwrap()
                .unwrap()
        };

        let mut resumed = Vec::new();
        for _ in 0..8 {
            tokio::task::yield_now().await;
            let repo = task_resolver.resolve(CreateMode::CreateScoped).unwrap();
            resumed.push(repo);
        }
        (created, resumed)
    }))
    .await
    .unwrap();

    for repo in resumed {
        assert!(Arc::ptr_eq(&created, &repo.unwrap()));
    }
    // Outside the flow nothing remembers the test method.
    assert!(resolver.resolve(CreateMode::Never).unwrap().is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_retire_after_resume_clears_bridge() {
    let (resolver, test, _) = suite();
    let resolver = Arc::new(resolver);

    let task_resolver = resolver.clone();
    let (retired, after) = tokio::spawn(AsyncContextBridge::flow(async move {
        ShadowStack::call(test, || {
            task_resolver.capture_async_context();
            task_resolver.resolve(CreateMode::CreateScoped).unwrap();
        });
        tokio::task::yield_now().await;
        let retired = task_resolver.retire();
        let after = task_resolver.current_scope();
        (retired, after)
    }))
    .await
    .unwrap();

    assert!(retired);
    assert!(after.is_none());
}

#[test]
fn test_teardown_retire_forgets_class_keyed_test() {
    let mut builder = CatalogBuilder::new();
    let module = builder.module("ledger.tests");
    let posting = builder.class(module, "PostingTests");
    let case = builder.method(posting, "posts_entry");
    let tear_down = builder.method(posting, "reset_ledger");
    let closing = builder.class(module, "ClosingTests");
    let open_books = builder.method(closing, "open_books");
    builder
        .mark(case, "Test")
        .mark(tear_down, "TearDown")
        .mark(open_books, "OneTimeSetUp")
        .define_markers(MarkerTable::classic().all_markers().collect::<Vec<_>>());
    let resolver = Resolver::<MockRepository>::builder(Arc::new(builder.build()))
        .build()
        .unwrap();

    let test_repo = ShadowStack::call(case, || {
        assert_eq!(resolver.capture_async_context(), Some(case));
        resolver.resolve(CreateMode::CreateScoped).unwrap().unwrap()
    });
    assert_eq!(resolver.bridge().get(), Some(case));

    // Teardown shares the class-keyed scope, so it retires the test's resource.
    ShadowStack::call(tear_down, || assert!(resolver.retire()));
    assert!(test_repo.is_retired());
    assert_eq!(resolver.bridge().get(), None);

    let fixture = ShadowStack::call(open_books, || {
        let scope = resolver.current_scope().unwrap();
        assert_ne!(scope.level, resolver.registry().leaf_index());
        resolver.resolve(CreateMode::CreateScoped).unwrap().unwrap()
    });
    assert_eq!(fixture.owner(), open_books);
}

//! Async context bridge: remembers the active test method across `.await`.
//!
//! After a suspension point the continuation may run on another worker thread
//! and the live stack no longer contains the test method that started the
//! operation. The bridge keeps that method in a slot that belongs to the
//! logical operation (a tokio task-local) rather than to the OS thread.
//!
//! Outside any flowing operation the bridge falls back to the calling
//! thread's storage, which is what synchronous callers need.

use std::cell::RefCell;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::ids::MethodId;

static BRIDGE_COUNTER: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Default)]
struct FlowSlot {
    methods: Mutex<HashMap<u64, MethodId>>,
}

impl FlowSlot {
    fn with_values(values: HashMap<u64, MethodId>) -> Self {
        FlowSlot {
            methods: Mutex::new(values),
        }
    }

    fn values(&self) -> HashMap<u64, MethodId> {
        self.methods.lock().clone()
    }
}

tokio::task_local! {
    static FLOWING: Arc<FlowSlot>;
}

thread_local! {
    static THREAD_FLOW: RefCell<HashMap<u64, MethodId>> = RefCell::new(HashMap::new());
}

/// One resolver's channel into the flowing context.
#[derive(Debug)]
pub struct AsyncContextBridge {
    id: u64,
}

impl AsyncContextBridge {
    pub fn new() -> Self {
        AsyncContextBridge {
            id: BRIDGE_COUNTER.fetch_add(1, Ordering::Relaxed),
        }
    }

    /// Run `future` as a logical operation with its own flowing slot.
    ///
    /// Values captured by an enclosing operation (or, at the top level, on the
    /// calling thread) are copied in when `flow` is called, so nested
    /// operations start from what their parent knew.
    pub fn flow<F: Future>(future: F) -> impl Future<Output = F::Output> {
        let inherited = current_values();
        FLOWING.scope(Arc::new(FlowSlot::with_values(inherited)), future)
    }

    /// Remember `method` as the test method of the current logical operation.
    pub fn capture(&self, method: MethodId) {
        let in_flow = FLOWING
            .try_with(|slot| {
                slot.methods.lock().insert(self.id, method);
            })
            .is_ok();
        if !in_flow {
            THREAD_FLOW.with(|flow| {
                flow.borrow_mut().insert(self.id, method);
            });
        }
    }

    pub fn get(&self) -> Option<MethodId> {
        match FLOWING.try_with(|slot| slot.methods.lock().get(&self.id).copied()) {
            Ok(value) => value,
            Err(_) => THREAD_FLOW.with(|flow| flow.borrow().get(&self.id).copied()),
        }
    }

    pub fn clear(&self) {
        let in_flow = FLOWING
            .try_with(|slot| {
                slot.methods.lock().remove(&self.id);
            })
            .is_ok();
        if !in_flow {
            THREAD_FLOW.with(|flow| {
                flow.borrow_mut().remove(&self.id);
            });
        }
    }

    /// Freeze what every bridge currently sees, for handing to another thread.
    pub fn snapshot() -> FlowSnapshot {
        FlowSnapshot {
            values: current_values(),
        }
    }
}

impl Default for AsyncContextBridge {
    fn default() -> Self {
        Self::new()
    }
}

fn current_values() -> HashMap<u64, MethodId> {
    FLOWING
        .try_with(|slot| slot.values())
        .unwrap_or_else(|_| THREAD_FLOW.with(|flow| flow.borrow().clone()))
}

/// Captured flowing context, movable across threads.
#[derive(Debug, Clone, Default)]
pub struct FlowSnapshot {
    values: HashMap<u64, MethodId>,
}

impl FlowSnapshot {
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Run synchronous `f` on the calling thread with this context installed.
    pub fn run<R>(&self, f: impl FnOnce() -> R) -> R {
        let previous = THREAD_FLOW.with(|flow| flow.replace(self.values.clone()));
        let _restore = RestoreThreadFlow(Some(previous));
        f()
    }

    /// Run `future` as a logical operation starting from this context.
    pub fn scope<F: Future>(self, future: F) -> impl Future<Output = F::Output> {
        FLOWING.scope(Arc::new(FlowSlot::with_values(self.values)), future)
    }
}

struct RestoreThreadFlow(Option<HashMap<u64, MethodId>>);

impl Drop for RestoreThreadFlow {
    fn drop(&mut self) {
        if let Some(previous) = self.0.take() {
            THREAD_FLOW.with(|flow| {
                flow.replace(previous);
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_thread_fallback_outside_flow() {
        let bridge = AsyncContextBridge::new();
        assert!(bridge.get().is_none());
        bridge.capture(MethodId::from_raw(5));
        assert_eq!(bridge.get(), Some(MethodId::from_raw(5)));
        bridge.clear();
        assert!(bridge.get().is_none());
    }

    #[test]
    fn test_bridges_do_not_share_values() {
        let a = AsyncContextBridge::new();
        let b = AsyncContextBridge::new();
        a.capture(MethodId::from_raw(1));
        assert!(b.get().is_none());
        a.clear();
    }

    #[test]
    fn test_snapshot_runs_on_another_thread() {
        let bridge = Arc::new(AsyncContextBridge::new());
        bridge.capture(MethodId::from_raw(11));
        let snapshot = AsyncContextBridge::snapshot();
        bridge.clear();

        let remote = bridge.clone();
        let seen = std::thread::spawn(move || {
            let inside = snapshot.run(|| remote.get());
            (inside, remote.get())
        })
        .join()
        .unwrap();
        assert_eq!(seen, (Some(MethodId::from_raw(11)), None));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_value_survives_await_across_workers() {
        let bridge = Arc::new(AsyncContextBridge::new());
        let inner = bridge.clone();
        let seen = tokio::spawn(AsyncContextBridge::flow(async move {
            inner.capture(MethodId::from_raw(42));
            for _ in 0..16 {
                tokio::task::yield_now().await;
                assert_eq!(inner.get(), Some(MethodId::from_raw(42)));
            }
            inner.get()
        }))
        .await
        .unwrap();
        assert_eq!(seen, Some(MethodId::from_raw(42)));
        // The flowing value never leaked into a worker thread's storage.
        assert!(bridge.get().is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_spawned_task_starts_from_snapshot() {
        let bridge = Arc::new(AsyncContextBridge::new());
        let outer = bridge.clone();
        let seen = AsyncContextBridge::flow(async move {
            outer.capture(MethodId::from_raw(8));
            let snapshot = AsyncContextBridge::snapshot();
            let child = outer.clone();
            tokio::spawn(snapshot.scope(async move { child.get() }))
                .await
                .unwrap()
        })
        .await;
        assert_eq!(seen, Some(MethodId::from_raw(8)));
    }
}

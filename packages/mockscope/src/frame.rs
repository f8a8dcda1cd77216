//! Raw call-stack frames and the sources that capture them.

use std::cell::RefCell;
use std::marker::PhantomData;

use crate::ids::MethodId;

/// One frame of a raw (un-normalized) call-stack snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RawFrame {
    pub method: MethodId,
}

impl RawFrame {
    pub fn new(method: MethodId) -> Self {
        RawFrame { method }
    }
}

impl From<MethodId> for RawFrame {
    fn from(method: MethodId) -> Self {
        RawFrame { method }
    }
}

/// Captures the calling thread's stack, innermost frame first.
pub trait StackSource: Send + Sync {
    fn snapshot(&self) -> Vec<RawFrame>;
}

impl<F> StackSource for F
where
    F: Fn() -> Vec<RawFrame> + Send + Sync,
{
    fn snapshot(&self) -> Vec<RawFrame> {
        self()
    }
}

thread_local! {
    static SHADOW_FRAMES: RefCell<Vec<MethodId>> = const { RefCell::new(Vec::new()) };
}

/// Per-thread shadow call stack maintained by instrumented code.
///
/// Instrumented methods call [`ShadowStack::enter`] on entry and keep the
/// returned guard alive for the duration of the call. The stack is a property
/// of the thread, so every `ShadowStack` handle observes the same frames.
#[derive(Debug, Clone, Copy, Default)]
pub struct ShadowStack;

impl ShadowStack {
    pub fn new() -> Self {
        ShadowStack
    }

    /// Push `method` onto the calling thread's stack until the guard drops.
    pub fn enter(method: MethodId) -> FrameGuard {
        SHADOW_FRAMES.with(|frames| frames.borrow_mut().push(method));
        FrameGuard {
            method,
            _not_send: PhantomData,
        }
    }

    /// Run `f` with `method` on the stack.
    pub fn call<R>(method: MethodId, f: impl FnOnce() -> R) -> R {
        let _frame = Self::enter(method);
        f()
    }

    pub fn depth() -> usize {
        SHADOW_FRAMES.with(|frames| frames.borrow().len())
    }
}

impl StackSource for ShadowStack {
    fn snapshot(&self) -> Vec<RawFrame> {
        SHADOW_FRAMES.with(|frames| {
            frames
                .borrow()
                .iter()
                .rev()
                .copied()
                .map(RawFrame::new)
                .collect()
        })
    }
}

/// Pops its frame when dropped. Bound to the thread that entered it.
#[must_use = "the frame is popped as soon as the guard is dropped"]
#[derive(Debug)]
pub struct FrameGuard {
    method: MethodId,
    _not_send: PhantomData<*const ()>,
}

impl FrameGuard {
    pub fn method(&self) -> MethodId {
        self.method
    }
}

impl Drop for FrameGuard {
    fn drop(&mut self) {
        SHADOW_FRAMES.with(|frames| {
            let mut frames = frames.borrow_mut();
            if let Some(pos) = frames.iter().rposition(|m| *m == self.method) {
                frames.remove(pos);
            }
        });
    }
}

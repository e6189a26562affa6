//! Cancellation scopes.
//!
//! Every [`WorkflowContext`](crate::WorkflowContext) carries a scope. The root
//! scope belongs to the instance and is cancelled by a `CancellationRequested`
//! event; `with_cancel` derives child scopes that can also be cancelled from
//! workflow code. Cancelling a scope cancels all of its descendants and wakes
//! every thread waiting through it.

use crate::runtime::lock;
use std::fmt;
use std::sync::{Arc, Mutex, Weak};
use std::task::Waker;

#[derive(Default)]
struct ScopeState {
    cancelled: bool,
    waiters: Vec<Waker>,
    children: Vec<Weak<Mutex<ScopeState>>>,
}

#[derive(Clone, Default)]
pub struct CancelScope {
    state: Arc<Mutex<ScopeState>>,
}

impl fmt::Debug for CancelScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelScope")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

impl CancelScope {
    pub(crate) fn root() -> Self {
        Self::default()
    }

    /// Derive a scope that is cancelled with `self` and can be cancelled alone.
    pub(crate) fn child(&self) -> Self {
        let child = Self::default();
        let mut parent = lock(&self.state);
        if parent.cancelled {
            lock(&child.state).cancelled = true;
        } else {
            parent.children.retain(|c| c.strong_count() > 0);
            parent.children.push(Arc::downgrade(&child.state));
        }
        child
    }

    pub fn is_cancelled(&self) -> bool {
        lock(&self.state).cancelled
    }

    pub(crate) fn register(&self, waker: &Waker) {
        let mut state = lock(&self.state);
        if state.cancelled {
            return;
        }
        if !state.waiters.iter().any(|w| w.will_wake(waker)) {
            state.waiters.push(waker.clone());
        }
    }

    pub(crate) fn cancel(&self) {
        let mut wakers = Vec::new();
        cancel_tree(&self.state, &mut wakers);
        for w in wakers {
            w.wake();
        }
    }
}

fn cancel_tree(state: &Arc<Mutex<ScopeState>>, wakers: &mut Vec<Waker>) {
    let children = {
        let mut s = lock(state);
        if s.cancelled {
            return;
        }
        s.cancelled = true;
        wakers.append(&mut s.waiters);
        std::mem::take(&mut s.children)
    };
    for child in children.iter().filter_map(Weak::upgrade) {
        cancel_tree(&child, wakers);
    }
}

/// Cancels the scope created by `WorkflowContext::with_cancel`.
#[derive(Clone, Debug)]
pub struct CancelHandle {
    scope: CancelScope,
}

impl CancelHandle {
    pub(crate) fn new(scope: CancelScope) -> Self {
        Self { scope }
    }

    /// Cancel the scope and everything derived from it. Idempotent.
    pub fn cancel(&self) {
        self.scope.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.scope.is_cancelled()
    }
}

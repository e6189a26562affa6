//! Single-assignment futures and `select`.
//!
//! A [`WorkflowFuture`] is resolved exactly once through its [`Resolver`],
//! either by workflow code or by the instance when a completion event arrives.
//! Any number of logical threads may wait on it; all of them observe the same
//! outcome, and the outcome can be read again after it is ready.
//!
//! ```ignore
//! let (future, resolver) = ctx.new_future::<u32>();
//! ctx.spawn(move |_ctx| async move {
//!     resolver.resolve(7).ok();
//!     Ok(())
//! });
//! assert_eq!(future.get(&ctx).await?, 7);
//! ```

use crate::cancel::CancelScope;
use crate::errors::{FutureError, WorkflowError};
use crate::runtime::lock;
use futures::future::FusedFuture;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Waker};

enum FutureState<T> {
    Pending,
    Resolved(T),
    Failed(WorkflowError),
}

struct FutureCell<T> {
    state: FutureState<T>,
    waiters: Vec<Waker>,
}

fn register_waiter(waiters: &mut Vec<Waker>, waker: &Waker) {
    if !waiters.iter().any(|w| w.will_wake(waker)) {
        waiters.push(waker.clone());
    }
}

/// Read side of a single-assignment value.
pub struct WorkflowFuture<T> {
    cell: Arc<Mutex<FutureCell<T>>>,
}

/// Write side of a [`WorkflowFuture`].
pub struct Resolver<T> {
    cell: Arc<Mutex<FutureCell<T>>>,
}

/// Create an unresolved future and its resolver.
pub fn new_future<T>() -> (WorkflowFuture<T>, Resolver<T>) {
    let cell = Arc::new(Mutex::new(FutureCell {
        state: FutureState::Pending,
        waiters: Vec::new(),
    }));
    (WorkflowFuture { cell: cell.clone() }, Resolver { cell })
}

impl<T> Clone for WorkflowFuture<T> {
    fn clone(&self) -> Self {
        Self {
            cell: self.cell.clone(),
        }
    }
}

impl<T> Clone for Resolver<T> {
    fn clone(&self) -> Self {
        Self {
            cell: self.cell.clone(),
        }
    }
}

impl<T> fmt::Debug for WorkflowFuture<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match lock(&self.cell).state {
            FutureState::Pending => "Pending",
            FutureState::Resolved(_) => "Resolved",
            FutureState::Failed(_) => "Failed",
        };
        f.debug_struct("WorkflowFuture").field("state", &state).finish()
    }
}

impl<T> WorkflowFuture<T> {
    /// A future that is already resolved.
    pub fn ready(value: T) -> Self {
        let (f, r) = new_future();
        let _ = r.resolve(value);
        f
    }

    /// A future that has already failed.
    pub fn failed(error: WorkflowError) -> Self {
        let (f, r) = new_future();
        let _ = r.fail(error);
        f
    }

    /// Non-blocking readiness check.
    pub fn is_ready(&self) -> bool {
        !matches!(lock(&self.cell).state, FutureState::Pending)
    }

    fn register(&self, waker: &Waker) {
        let mut cell = lock(&self.cell);
        if matches!(cell.state, FutureState::Pending) {
            register_waiter(&mut cell.waiters, waker);
        }
    }
}

impl<T: Clone> WorkflowFuture<T> {
    /// Outcome if resolved, without waiting.
    pub fn peek(&self) -> Option<Result<T, WorkflowError>> {
        match &lock(&self.cell).state {
            FutureState::Pending => None,
            FutureState::Resolved(v) => Some(Ok(v.clone())),
            FutureState::Failed(e) => Some(Err(e.clone())),
        }
    }

    /// Wait for the outcome, giving up with `Canceled` if `ctx` is cancelled first.
    pub fn get<'a>(&'a self, ctx: &'a crate::WorkflowContext) -> Get<'a, T> {
        Get {
            future: self,
            scope: ctx.scope(),
        }
    }

    fn poll_outcome(&self, waker: &Waker) -> Poll<Result<T, WorkflowError>> {
        let mut cell = lock(&self.cell);
        match &cell.state {
            FutureState::Resolved(v) => Poll::Ready(Ok(v.clone())),
            FutureState::Failed(e) => Poll::Ready(Err(e.clone())),
            FutureState::Pending => {
                register_waiter(&mut cell.waiters, waker);
                Poll::Pending
            }
        }
    }
}

impl<T: Clone> Future for WorkflowFuture<T> {
    type Output = Result<T, WorkflowError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.poll_outcome(cx.waker())
    }
}

// Re-polling after completion yields the same outcome again.
impl<T: Clone> FusedFuture for WorkflowFuture<T> {
    fn is_terminated(&self) -> bool {
        false
    }
}

impl<T> Resolver<T> {
    /// Settle the future. A second call fails and leaves the first outcome in place.
    pub fn complete(&self, outcome: Result<T, WorkflowError>) -> Result<(), FutureError> {
        let waiters = {
            let mut cell = lock(&self.cell);
            if !matches!(cell.state, FutureState::Pending) {
                return Err(FutureError::AlreadyResolved);
            }
            cell.state = match outcome {
                Ok(v) => FutureState::Resolved(v),
                Err(e) => FutureState::Failed(e),
            };
            std::mem::take(&mut cell.waiters)
        };
        for w in waiters {
            w.wake();
        }
        Ok(())
    }

    pub fn resolve(&self, value: T) -> Result<(), FutureError> {
        self.complete(Ok(value))
    }

    pub fn fail(&self, error: WorkflowError) -> Result<(), FutureError> {
        self.complete(Err(error))
    }

    pub fn is_resolved(&self) -> bool {
        !matches!(lock(&self.cell).state, FutureState::Pending)
    }
}

/// Cancellation-aware wait returned by [`WorkflowFuture::get`].
pub struct Get<'a, T> {
    future: &'a WorkflowFuture<T>,
    scope: &'a CancelScope,
}

impl<T: Clone> Future for Get<'_, T> {
    type Output = Result<T, WorkflowError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if let Poll::Ready(out) = self.future.poll_outcome(cx.waker()) {
            return Poll::Ready(out);
        }
        if self.scope.is_cancelled() {
            return Poll::Ready(Err(WorkflowError::canceled()));
        }
        self.scope.register(cx.waker());
        Poll::Pending
    }
}

/// Something a logical thread can wait on inside [`select`](crate::WorkflowContext::select).
pub trait Selectable: Sync {
    fn is_ready(&self) -> bool;
    fn register_waker(&self, waker: &Waker);
}

impl<T: Send> Selectable for WorkflowFuture<T> {
    fn is_ready(&self) -> bool {
        WorkflowFuture::is_ready(self)
    }

    fn register_waker(&self, waker: &Waker) {
        self.register(waker);
    }
}

/// Resolves to the index of the first ready case, checked in registration order.
///
/// With no cases the select only finishes through cancellation.
pub struct Select<'a> {
    cases: &'a [&'a dyn Selectable],
    scope: &'a CancelScope,
}

impl<'a> Select<'a> {
    pub(crate) fn new(cases: &'a [&'a dyn Selectable], scope: &'a CancelScope) -> Self {
        Self { cases, scope }
    }
}

impl Future for Select<'_> {
    type Output = Result<usize, WorkflowError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if let Some(index) = self.cases.iter().position(|c| c.is_ready()) {
            return Poll::Ready(Ok(index));
        }
        if self.scope.is_cancelled() {
            return Poll::Ready(Err(WorkflowError::canceled()));
        }
        for case in self.cases {
            case.register_waker(cx.waker());
        }
        self.scope.register(cx.waker());
        Poll::Pending
    }
}

//! Cooperative scheduler for the logical threads of one instance.
//!
//! Logical threads are boxed futures. Each thread owns a waker that records
//! its id in the shared ready set; nothing is ever woken by the wall clock.
//! The instance drives scheduling in rounds: `take_ready` drains the ready set
//! in ascending thread id (creation order) and each thread is polled once.
//! Threads woken while a round is in progress run in the next round.

use crate::runtime::lock;
use crate::runtime::state::SpawnRequest;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::future::Future;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Wake, Waker};

/// Identifier of a logical thread, assigned in creation order starting at 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ThreadId(pub u64);

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ThreadStatus {
    Runnable,
    Blocked,
    Done,
}

/// Snapshot of a logical thread, as returned by the `__stack_trace` query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadSummary {
    pub id: ThreadId,
    pub name: String,
    pub status: ThreadStatus,
}

type ReadySet = Arc<Mutex<BTreeSet<ThreadId>>>;

struct ThreadWaker {
    id: ThreadId,
    ready: ReadySet,
}

impl Wake for ThreadWaker {
    fn wake(self: Arc<Self>) {
        self.wake_by_ref();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        lock(&self.ready).insert(self.id);
    }
}

struct LogicalThread {
    name: String,
    status: ThreadStatus,
    future: Option<BoxFuture<'static, ()>>,
    waker: Waker,
}

/// Result of polling one thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum PollResult {
    Pending,
    Completed,
    Panicked { thread: String, message: String },
}

pub(crate) struct Dispatcher {
    threads: BTreeMap<ThreadId, LogicalThread>,
    ready: ReadySet,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self {
            threads: BTreeMap::new(),
            ready: Arc::new(Mutex::new(BTreeSet::new())),
        }
    }

    /// Register a new thread; it becomes runnable in the next round.
    pub fn add_thread(&mut self, request: SpawnRequest) {
        let waker = Waker::from(Arc::new(ThreadWaker {
            id: request.id,
            ready: self.ready.clone(),
        }));
        tracing::trace!(target: "duroflow::dispatcher", thread_id = %request.id, name = %request.name, "thread spawned");
        self.threads.insert(
            request.id,
            LogicalThread {
                name: request.name,
                status: ThreadStatus::Runnable,
                future: Some(request.future),
                waker,
            },
        );
        lock(&self.ready).insert(request.id);
    }

    /// Drain the ready set, in creation order, skipping finished threads.
    pub fn take_ready(&mut self) -> Vec<ThreadId> {
        let woken = std::mem::take(&mut *lock(&self.ready));
        woken
            .into_iter()
            .filter(|id| match self.threads.get_mut(id) {
                Some(t) if t.status != ThreadStatus::Done => {
                    t.status = ThreadStatus::Runnable;
                    true
                }
                _ => false,
            })
            .collect()
    }

    pub fn poll_thread(&mut self, id: ThreadId) -> PollResult {
        let Some(thread) = self.threads.get_mut(&id) else {
            return PollResult::Completed;
        };
        let Some(future) = thread.future.as_mut() else {
            return PollResult::Completed;
        };
        let waker = thread.waker.clone();
        let mut cx = Context::from_waker(&waker);
        let polled = catch_unwind(AssertUnwindSafe(|| future.as_mut().poll(&mut cx)));
        match polled {
            Ok(Poll::Pending) => {
                thread.status = if lock(&self.ready).contains(&id) {
                    ThreadStatus::Runnable
                } else {
                    ThreadStatus::Blocked
                };
                PollResult::Pending
            }
            Ok(Poll::Ready(())) => {
                thread.status = ThreadStatus::Done;
                thread.future = None;
                tracing::trace!(target: "duroflow::dispatcher", thread_id = %id, "thread finished");
                PollResult::Completed
            }
            Err(panic) => {
                thread.status = ThreadStatus::Done;
                thread.future = None;
                PollResult::Panicked {
                    thread: thread.name.clone(),
                    message: panic_message(panic.as_ref()),
                }
            }
        }
    }

    pub fn summaries(&self) -> Vec<ThreadSummary> {
        self.threads
            .iter()
            .map(|(id, t)| ThreadSummary {
                id: *id,
                name: t.name.clone(),
                status: t.status,
            })
            .collect()
    }

    /// Drop every thread future. Used when the workflow closes or the decision fails.
    pub fn close(&mut self) {
        let futures: Vec<_> = self
            .threads
            .values_mut()
            .filter_map(|t| {
                t.status = ThreadStatus::Done;
                t.future.take()
            })
            .collect();
        lock(&self.ready).clear();
        drop(futures);
    }
}

pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

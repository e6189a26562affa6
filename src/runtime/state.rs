//! Mutable per-instance state shared by the instance and its contexts.

use crate::cancel::CancelScope;
use crate::channel::Channel;
use crate::codec::Payload;
use crate::commands::Command;
use crate::errors::{DecisionError, WorkflowError};
use crate::history::WorkflowExecution;
use crate::markers::MarkerRecorder;
use crate::query::{QueryDispatcher, QueryMode};
use crate::runtime::dispatcher::ThreadId;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use std::collections::{BTreeMap, BTreeSet};

/// Delivers the raw outcome of an operation to its typed future.
pub(crate) type Completion = Box<dyn FnOnce(Result<Payload, WorkflowError>) + Send>;
pub(crate) type StartedCallback = Box<dyn FnOnce(Result<WorkflowExecution, WorkflowError>) + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum OperationKind {
    Activity,
    LocalActivity,
    Timer,
    ChildWorkflow,
    SignalExternal,
    CancelExternal,
}

/// Target of a child workflow, filled in as the child starts.
#[derive(Debug, Clone)]
pub(crate) struct ChildTarget {
    pub workflow_id: String,
    pub run_id: Option<String>,
}

/// An issued operation awaiting its completion event.
pub(crate) struct PendingOperation {
    pub kind: OperationKind,
    pub scope: CancelScope,
    /// Activity type or child workflow type.
    pub label: String,
    pub complete: Completion,
    pub on_started: Option<StartedCallback>,
    pub child: Option<ChildTarget>,
}

impl PendingOperation {
    pub fn new(kind: OperationKind, scope: CancelScope, label: impl Into<String>, complete: Completion) -> Self {
        Self {
            kind,
            scope,
            label: label.into(),
            complete,
            on_started: None,
            child: None,
        }
    }

    /// Fail the operation's futures without emitting anything.
    pub fn abandon(self, error: WorkflowError) {
        if let Some(started) = self.on_started {
            started(Err(error.clone()));
        }
        (self.complete)(Err(error));
    }
}

pub(crate) struct SpawnRequest {
    pub id: ThreadId,
    pub name: String,
    pub future: BoxFuture<'static, ()>,
}

pub(crate) struct InstanceState {
    pub commands: Vec<Command>,
    next_correlation_id: u64,
    next_thread_id: u64,
    pub pending: BTreeMap<u64, PendingOperation>,
    /// Operations cancelled by the workflow; their late completions are ignored.
    pub cancelled_operations: BTreeSet<u64>,
    pub markers: MarkerRecorder,
    pub signal_channels: BTreeMap<String, Channel<Payload>>,
    pub queries: QueryDispatcher,
    pub query_mode: Option<QueryMode>,
    pub spawned: Vec<SpawnRequest>,
    /// Set once by the root thread or by the first failing thread.
    pub outcome: Option<Result<Payload, WorkflowError>>,
    pub decision_failure: Option<DecisionError>,
    pub replaying: bool,
    pub logging_in_replay: bool,
    pub cancel_requested: bool,
    pub now: DateTime<Utc>,
    pub decision_index: u64,
}

impl InstanceState {
    pub fn new(logging_in_replay: bool) -> Self {
        Self {
            commands: Vec::new(),
            next_correlation_id: 0,
            next_thread_id: 0,
            pending: BTreeMap::new(),
            cancelled_operations: BTreeSet::new(),
            markers: MarkerRecorder::default(),
            signal_channels: BTreeMap::new(),
            queries: QueryDispatcher::default(),
            query_mode: None,
            spawned: Vec::new(),
            outcome: None,
            decision_failure: None,
            replaying: false,
            logging_in_replay,
            cancel_requested: false,
            now: DateTime::<Utc>::UNIX_EPOCH,
            decision_index: 0,
        }
    }

    pub fn next_correlation_id(&mut self) -> u64 {
        self.next_correlation_id += 1;
        self.next_correlation_id
    }

    pub fn next_thread_id(&mut self) -> ThreadId {
        self.next_thread_id += 1;
        ThreadId(self.next_thread_id)
    }

    pub fn is_logging_enabled(&self) -> bool {
        !self.replaying || self.logging_in_replay
    }

    /// First failure wins; the decision is abandoned after the current poll.
    pub fn fail_decision(&mut self, error: DecisionError) {
        if self.decision_failure.is_none() {
            self.decision_failure = Some(error);
        }
    }

    /// First outcome wins.
    pub fn set_outcome(&mut self, outcome: Result<Payload, WorkflowError>) {
        if self.outcome.is_none() {
            self.outcome = Some(outcome);
        }
    }

    /// Returns false and records the violation when a query handler is running.
    pub fn permit(&mut self, operation: &str) -> bool {
        match self.query_mode.as_mut() {
            None => true,
            Some(mode) => {
                if mode.violation.is_none() {
                    mode.violation = Some(operation.to_string());
                }
                false
            }
        }
    }

    pub fn signal_channel(&mut self, name: &str) -> Channel<Payload> {
        self.signal_channels
            .entry(name.to_string())
            .or_insert_with(Channel::unbounded)
            .clone()
    }

    /// Remove every pending operation whose scope is cancelled, emitting the
    /// matching cancel command once. The caller fails the returned operations
    /// after releasing the lock.
    pub fn sweep_cancellations(&mut self) -> Vec<PendingOperation> {
        let ids: Vec<u64> = self
            .pending
            .iter()
            .filter(|(_, op)| op.scope.is_cancelled())
            .map(|(id, _)| *id)
            .collect();
        let mut cancelled = Vec::with_capacity(ids.len());
        for id in ids {
            let Some(op) = self.pending.remove(&id) else {
                continue;
            };
            self.cancelled_operations.insert(id);
            match op.kind {
                OperationKind::Activity => self.commands.push(Command::RequestCancelActivity { id }),
                OperationKind::Timer => self.commands.push(Command::CancelTimer { id }),
                OperationKind::ChildWorkflow => {
                    if let Some(child) = &op.child {
                        let cancel_id = self.next_correlation_id();
                        self.cancelled_operations.insert(cancel_id);
                        self.commands.push(Command::RequestCancelExternalWorkflow {
                            id: cancel_id,
                            workflow_id: child.workflow_id.clone(),
                            run_id: child.run_id.clone(),
                            child_workflow_only: true,
                        });
                    }
                }
                OperationKind::LocalActivity | OperationKind::SignalExternal | OperationKind::CancelExternal => {}
            }
            cancelled.push(op);
        }
        cancelled
    }
}

//! One workflow run driven by batches of history events.
//!
//! `process_events` is the only entry point that mutates workflow state. It
//! applies the batch, runs logical threads until none can make progress, and
//! returns the commands emitted on the way. Live execution and replay share
//! this path; replay only changes logging and the marker fallbacks.

use crate::WorkflowContext;
use crate::cancel::CancelScope;
use crate::codec::{Payload, encode};
use crate::commands::{Command, MarkerData};
use crate::context::WorkflowInfo;
use crate::errors::{DecisionError, QueryError, WorkflowError};
use crate::history::{EventKind, HistoryEvent, WorkflowExecution};
use crate::options::{InstanceOptions, PanicPolicy};
use crate::query::QueryMode;
use crate::runtime::dispatcher::{Dispatcher, PollResult, ThreadSummary};
use crate::runtime::limits::{ROOT_THREAD_NAME, STACK_TRACE_QUERY};
use crate::runtime::lock;
use crate::runtime::registry::Registry;
use crate::runtime::state::{InstanceState, OperationKind, PendingOperation, SpawnRequest};
use futures::FutureExt;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

/// Result of one decision.
#[derive(Debug, Clone, PartialEq)]
pub struct DecisionOutcome {
    /// Commands in emission order. At most one terminal command, always last.
    pub commands: Vec<Command>,
    /// Answers to the `QueryRequested` events of the batch, keyed by query id.
    pub query_results: BTreeMap<String, Result<Payload, QueryError>>,
    /// The workflow emitted its terminal command.
    pub closed: bool,
}

pub struct WorkflowInstance {
    registry: Arc<Registry>,
    execution: WorkflowExecution,
    options: InstanceOptions,
    state: Arc<Mutex<InstanceState>>,
    dispatcher: Dispatcher,
    root_scope: CancelScope,
    info: Option<Arc<WorkflowInfo>>,
    /// Replay cursor: the highest event id applied so far.
    last_event_id: u64,
    closed: bool,
    result: Option<Result<Payload, WorkflowError>>,
    poisoned: Option<DecisionError>,
}

impl std::fmt::Debug for WorkflowInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowInstance")
            .field("execution", &self.execution)
            .field("last_event_id", &self.last_event_id)
            .field("closed", &self.closed)
            .field("poisoned", &self.poisoned)
            .finish()
    }
}

impl WorkflowInstance {
    pub fn new(registry: Arc<Registry>, execution: WorkflowExecution, options: InstanceOptions) -> Self {
        let state = InstanceState::new(options.enable_logging_in_replay);
        Self {
            registry,
            execution,
            options,
            state: Arc::new(Mutex::new(state)),
            dispatcher: Dispatcher::new(),
            root_scope: CancelScope::root(),
            info: None,
            last_event_id: 0,
            closed: false,
            result: None,
            poisoned: None,
        }
    }

    pub fn execution(&self) -> &WorkflowExecution {
        &self.execution
    }

    /// Available once `WorkflowExecutionStarted` has been applied.
    pub fn info(&self) -> Option<&WorkflowInfo> {
        self.info.as_deref()
    }

    pub fn set_replaying(&mut self, replaying: bool) {
        lock(&self.state).replaying = replaying;
    }

    pub fn is_replaying(&self) -> bool {
        lock(&self.state).replaying
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn last_event_id(&self) -> u64 {
        self.last_event_id
    }

    /// The workflow's outcome once closed.
    pub fn result(&self) -> Option<&Result<Payload, WorkflowError>> {
        self.result.as_ref()
    }

    pub fn thread_summaries(&self) -> Vec<ThreadSummary> {
        self.dispatcher.summaries()
    }

    /// Apply a batch of events and run the workflow until it blocks.
    ///
    /// # Errors
    ///
    /// Any [`DecisionError`] abandons the decision: no commands are returned
    /// and the instance is poisoned, so every later call returns the same
    /// error. The caller should rebuild the instance from history.
    pub fn process_events(&mut self, events: Vec<HistoryEvent>) -> Result<DecisionOutcome, DecisionError> {
        if let Some(error) = &self.poisoned {
            return Err(error.clone());
        }
        match self.decide(events) {
            Ok(outcome) => Ok(outcome),
            Err(error) => {
                tracing::warn!(
                    target: "duroflow::runtime",
                    workflow_id = %self.execution.workflow_id,
                    run_id = %self.execution.run_id,
                    error = %error,
                    "decision failed"
                );
                self.dispatcher.close();
                lock(&self.state).commands.clear();
                self.poisoned = Some(error.clone());
                Err(error)
            }
        }
    }

    fn decide(&mut self, events: Vec<HistoryEvent>) -> Result<DecisionOutcome, DecisionError> {
        let decision = {
            let mut state = lock(&self.state);
            state.decision_index += 1;
            state.decision_index
        };
        tracing::debug!(
            target: "duroflow::runtime",
            workflow_id = %self.execution.workflow_id,
            run_id = %self.execution.run_id,
            decision,
            events = events.len(),
            "processing events"
        );

        let mut queries = Vec::new();
        for HistoryEvent {
            event_id,
            timestamp,
            kind,
        } in events
        {
            if event_id <= self.last_event_id {
                tracing::warn!(
                    target: "duroflow::runtime",
                    workflow_id = %self.execution.workflow_id,
                    event_id,
                    last_event_id = self.last_event_id,
                    event = kind.name(),
                    "skipping duplicate event"
                );
                continue;
            }
            self.last_event_id = event_id;
            if kind.advances_clock() {
                lock(&self.state).now = timestamp;
            }
            match kind {
                EventKind::QueryRequested {
                    query_id,
                    query_type,
                    args,
                } => queries.push((query_id, query_type, args)),
                kind => self.apply_event(kind)?,
            }
        }

        if self.info.is_some() && !self.closed {
            self.sweep();
            self.run_threads()?;
        }

        let query_results = queries
            .into_iter()
            .map(|(query_id, query_type, args)| {
                let answer = self.query(&query_type, args.as_ref());
                (query_id, answer)
            })
            .collect();
        let commands = std::mem::take(&mut lock(&self.state).commands);
        Ok(DecisionOutcome {
            commands,
            query_results,
            closed: self.closed,
        })
    }

    fn apply_event(&mut self, kind: EventKind) -> Result<(), DecisionError> {
        if self.info.is_none() {
            return match kind {
                EventKind::WorkflowExecutionStarted {
                    workflow_type,
                    input,
                    task_list,
                    execution_timeout,
                    task_timeout,
                } => self.start(workflow_type, input, task_list, execution_timeout, task_timeout),
                other => Err(DecisionError::MissingStartEvent {
                    found: other.name().to_string(),
                }),
            };
        }
        match kind {
            EventKind::WorkflowExecutionStarted { .. } => Err(DecisionError::nondeterministic(
                "WorkflowExecutionStarted delivered twice",
            )),
            EventKind::ActivityCompleted { scheduled_id, result } => {
                self.complete(scheduled_id, OperationKind::Activity, "ActivityCompleted", Ok(result))
            }
            EventKind::ActivityFailed { scheduled_id, failure } => {
                self.complete(scheduled_id, OperationKind::Activity, "ActivityFailed", Err(failure))
            }
            EventKind::ActivityTimedOut {
                scheduled_id,
                timeout_type,
                details,
            } => self.complete(
                scheduled_id,
                OperationKind::Activity,
                "ActivityTimedOut",
                Err(WorkflowError::Timeout { timeout_type, details }),
            ),
            EventKind::ActivityCanceled { scheduled_id, details } => self.complete(
                scheduled_id,
                OperationKind::Activity,
                "ActivityCanceled",
                Err(WorkflowError::Canceled { details }),
            ),
            EventKind::LocalActivityResult { id, outcome } => self.complete_local_activity(id, outcome),
            EventKind::TimerFired { timer_id } => {
                self.complete(timer_id, OperationKind::Timer, "TimerFired", Ok(Payload::default()))
            }
            EventKind::ChildWorkflowStarted {
                initiated_id,
                execution,
            } => self.child_started(initiated_id, execution),
            EventKind::ChildWorkflowCompleted { initiated_id, result } => self.complete(
                initiated_id,
                OperationKind::ChildWorkflow,
                "ChildWorkflowCompleted",
                Ok(result),
            ),
            EventKind::ChildWorkflowFailed { initiated_id, failure } => self.complete(
                initiated_id,
                OperationKind::ChildWorkflow,
                "ChildWorkflowFailed",
                Err(failure),
            ),
            EventKind::ExternalSignalCompleted { initiated_id } => self.complete(
                initiated_id,
                OperationKind::SignalExternal,
                "ExternalSignalCompleted",
                Ok(Payload::default()),
            ),
            EventKind::ExternalSignalFailed { initiated_id, failure } => self.complete(
                initiated_id,
                OperationKind::SignalExternal,
                "ExternalSignalFailed",
                Err(failure),
            ),
            EventKind::ExternalCancelRequested { initiated_id } => self.complete(
                initiated_id,
                OperationKind::CancelExternal,
                "ExternalCancelRequested",
                Ok(Payload::default()),
            ),
            EventKind::ExternalCancelFailed { initiated_id, failure } => self.complete(
                initiated_id,
                OperationKind::CancelExternal,
                "ExternalCancelFailed",
                Err(failure),
            ),
            EventKind::SignalReceived { signal_name, input } => {
                let channel = lock(&self.state).signal_channel(&signal_name);
                if channel.try_send(input).is_err() {
                    tracing::warn!(
                        target: "duroflow::runtime",
                        workflow_id = %self.execution.workflow_id,
                        signal_name = %signal_name,
                        "signal channel is closed, dropping signal"
                    );
                }
                Ok(())
            }
            EventKind::CancellationRequested { reason } => {
                tracing::debug!(
                    target: "duroflow::runtime",
                    workflow_id = %self.execution.workflow_id,
                    reason = reason.as_deref().unwrap_or(""),
                    "cancellation requested"
                );
                lock(&self.state).cancel_requested = true;
                self.root_scope.cancel();
                Ok(())
            }
            EventKind::MarkerRecorded { marker } => match marker {
                MarkerData::LocalActivity { id, outcome, .. } => self.complete_local_activity(id, outcome),
                other => {
                    lock(&self.state).markers.load(&other);
                    Ok(())
                }
            },
            EventKind::QueryRequested { .. } => Ok(()),
        }
    }

    fn start(
        &mut self,
        workflow_type: String,
        input: Payload,
        task_list: String,
        execution_timeout: Option<std::time::Duration>,
        task_timeout: Option<std::time::Duration>,
    ) -> Result<(), DecisionError> {
        let handler = self
            .registry
            .workflow(&workflow_type)
            .ok_or_else(|| DecisionError::NotRegistered {
                workflow_type: workflow_type.clone(),
            })?;
        let started_at = lock(&self.state).now;
        let info = Arc::new(WorkflowInfo {
            workflow_type,
            execution: self.execution.clone(),
            task_list,
            execution_timeout,
            task_timeout,
            started_at,
        });
        let ctx = WorkflowContext::new(
            self.state.clone(),
            info.clone(),
            self.registry.data_converter().clone(),
            self.root_scope.clone(),
        );
        let shared = self.state.clone();
        let future = async move {
            let outcome = handler.invoke(ctx, input).await;
            lock(&shared).set_outcome(outcome);
        }
        .boxed();
        let id = lock(&self.state).next_thread_id();
        self.dispatcher.add_thread(SpawnRequest {
            id,
            name: ROOT_THREAD_NAME.to_string(),
            future,
        });
        if !self.is_replaying() {
            tracing::info!(
                target: "duroflow::runtime",
                workflow_id = %self.execution.workflow_id,
                run_id = %self.execution.run_id,
                workflow_type = %info.workflow_type,
                "workflow started"
            );
        }
        self.info = Some(info);
        Ok(())
    }

    /// Remove the pending operation a completion refers to.
    ///
    /// Completions of operations the workflow already cancelled yield `None`.
    fn take_pending(
        &mut self,
        id: u64,
        kind: OperationKind,
        event: &str,
    ) -> Result<Option<PendingOperation>, DecisionError> {
        let mut state = lock(&self.state);
        let found = state.pending.get(&id).map(|op| op.kind);
        match found {
            Some(k) if k == kind => Ok(state.pending.remove(&id)),
            Some(k) => Err(DecisionError::nondeterministic(format!(
                "{event} refers to operation {id}, which is a {k:?} operation"
            ))),
            None if state.cancelled_operations.contains(&id) => {
                tracing::debug!(target: "duroflow::runtime", id, event, "ignoring completion of cancelled operation");
                Ok(None)
            }
            None => Err(DecisionError::nondeterministic(format!(
                "{event} refers to unknown operation {id}"
            ))),
        }
    }

    fn complete(
        &mut self,
        id: u64,
        kind: OperationKind,
        event: &str,
        outcome: Result<Payload, WorkflowError>,
    ) -> Result<(), DecisionError> {
        let Some(mut op) = self.take_pending(id, kind, event)? else {
            return Ok(());
        };
        if let Some(started) = op.on_started.take() {
            let error = match &outcome {
                Err(failure) => failure.clone(),
                Ok(_) => WorkflowError::generic("child workflow completed without a start event"),
            };
            started(Err(error));
        }
        (op.complete)(outcome);
        Ok(())
    }

    /// Resolve a local activity and record its outcome. Used for live results
    /// and for replayed markers alike so both produce the same command.
    fn complete_local_activity(&mut self, id: u64, outcome: Result<Payload, WorkflowError>) -> Result<(), DecisionError> {
        let Some(op) = self.take_pending(id, OperationKind::LocalActivity, "LocalActivityResult")? else {
            return Ok(());
        };
        lock(&self.state).commands.push(Command::RecordMarker {
            marker: MarkerData::LocalActivity {
                id,
                activity_type: op.label.clone(),
                outcome: outcome.clone(),
            },
        });
        (op.complete)(outcome);
        Ok(())
    }

    fn child_started(&mut self, id: u64, execution: WorkflowExecution) -> Result<(), DecisionError> {
        let callback = {
            let mut state = lock(&self.state);
            let found = state.pending.get(&id).map(|op| op.kind);
            match found {
                Some(OperationKind::ChildWorkflow) => state.pending.get_mut(&id).and_then(|op| {
                    if let Some(child) = op.child.as_mut() {
                        child.run_id = Some(execution.run_id.clone());
                    }
                    op.on_started.take()
                }),
                Some(k) => {
                    return Err(DecisionError::nondeterministic(format!(
                        "ChildWorkflowStarted refers to operation {id}, which is a {k:?} operation"
                    )));
                }
                None if state.cancelled_operations.contains(&id) => None,
                None => {
                    return Err(DecisionError::nondeterministic(format!(
                        "ChildWorkflowStarted refers to unknown operation {id}"
                    )));
                }
            }
        };
        if let Some(callback) = callback {
            callback(Ok(execution));
        }
        Ok(())
    }

    /// Fail the pending operations of cancelled scopes.
    fn sweep(&mut self) {
        let cancelled = lock(&self.state).sweep_cancellations();
        for op in cancelled {
            op.abandon(WorkflowError::canceled());
        }
    }

    fn adopt_spawned(&mut self) {
        let spawned = std::mem::take(&mut lock(&self.state).spawned);
        for request in spawned {
            self.dispatcher.add_thread(request);
        }
    }

    fn run_threads(&mut self) -> Result<(), DecisionError> {
        let mut rounds = 0usize;
        loop {
            self.adopt_spawned();
            let ready = self.dispatcher.take_ready();
            if ready.is_empty() {
                return Ok(());
            }
            rounds += 1;
            if rounds > self.options.max_scheduler_rounds {
                return Err(DecisionError::SchedulerStalled {
                    rounds: self.options.max_scheduler_rounds,
                });
            }
            for id in ready {
                if let PollResult::Panicked { thread, message } = self.dispatcher.poll_thread(id) {
                    self.on_panic(thread, message)?;
                }
                self.adopt_spawned();
                self.sweep();
                let failure = lock(&self.state).decision_failure.take();
                if let Some(error) = failure {
                    return Err(error);
                }
                if self.finish_if_done() {
                    return Ok(());
                }
            }
        }
    }

    fn on_panic(&mut self, thread: String, message: String) -> Result<(), DecisionError> {
        tracing::error!(
            target: "duroflow::runtime",
            workflow_id = %self.execution.workflow_id,
            run_id = %self.execution.run_id,
            thread = %thread,
            message = %message,
            "logical thread panicked"
        );
        match self.options.panic_policy {
            PanicPolicy::FailDecision => Err(DecisionError::Panic { thread, message }),
            PanicPolicy::FailWorkflow => {
                lock(&self.state).set_outcome(Err(WorkflowError::Panic { message }));
                Ok(())
            }
        }
    }

    /// Emit the terminal command once the workflow has an outcome.
    fn finish_if_done(&mut self) -> bool {
        let mut state = lock(&self.state);
        let Some(outcome) = state.outcome.take() else {
            return false;
        };
        let command = match outcome.clone() {
            Ok(result) => Command::CompleteWorkflow { result },
            Err(WorkflowError::Canceled { details }) if state.cancel_requested => Command::CancelWorkflow { details },
            Err(failure) => Command::FailWorkflow { failure },
        };
        let replaying = state.replaying;
        state.commands.push(command);
        drop(state);

        if !replaying {
            tracing::info!(
                target: "duroflow::runtime",
                workflow_id = %self.execution.workflow_id,
                run_id = %self.execution.run_id,
                ok = outcome.is_ok(),
                "workflow closed"
            );
        }
        self.result = Some(outcome);
        self.closed = true;
        self.dispatcher.close();
        true
    }

    /// Answer a query against the current state.
    ///
    /// The handler runs synchronously in query mode. Any attempt to emit a
    /// command, spawn a thread or register a handler is refused and fails the
    /// query with [`QueryError::IllegalOperation`].
    pub fn query(&self, query_type: &str, args: Option<&Payload>) -> Result<Payload, QueryError> {
        if query_type == STACK_TRACE_QUERY {
            return Ok(encode(self.registry.data_converter().as_ref(), &self.dispatcher.summaries())?);
        }
        let handler = {
            let state = lock(&self.state);
            match state.queries.handler(query_type) {
                Some(handler) => handler,
                None => {
                    return Err(QueryError::UnknownQueryType {
                        query_type: query_type.to_string(),
                        known: state.queries.known_types(),
                    });
                }
            }
        };
        lock(&self.state).query_mode = Some(QueryMode {
            query_type: query_type.to_string(),
            violation: None,
        });
        let answer = crate::query::invoke(&handler, query_type, args);
        let mode = lock(&self.state).query_mode.take();
        if let Some(QueryMode {
            query_type: refused_in,
            violation: Some(operation),
        }) = mode
        {
            tracing::warn!(
                target: "duroflow::runtime",
                workflow_id = %self.execution.workflow_id,
                query_type = %refused_in,
                operation = %operation,
                "query handler attempted a workflow operation"
            );
            return Err(QueryError::IllegalOperation {
                query_type: query_type.to_string(),
                operation,
            });
        }
        answer
    }
}

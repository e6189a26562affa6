//! The API surface available to workflow code.
//!
//! A [`WorkflowContext`] is cheap to clone and every clone refers to the same
//! instance. Operations that talk to the outside world (activities, timers,
//! child workflows, external signals and cancellations) append a command and
//! return a [`WorkflowFuture`] resolved later from history. Values that must
//! not change between runs go through [`side_effect`](WorkflowContext::side_effect)
//! and [`get_version`](WorkflowContext::get_version).

use crate::cancel::{CancelHandle, CancelScope};
use crate::channel::Channel;
use crate::codec::{DataConverter, Payload, decode, decode_optional, encode};
use crate::commands::{Command, MarkerData, Version};
use crate::errors::{DecisionError, QueryError, WorkflowError};
use crate::future::{Resolver, Select, Selectable, WorkflowFuture, new_future};
use crate::history::WorkflowExecution;
use crate::markers::SideEffectStep;
use crate::options::{ActivityOptions, ChildWorkflowOptions, LocalActivityOptions};
use crate::query::query_handler;
use crate::runtime::lock;
use crate::runtime::state::{ChildTarget, Completion, InstanceState, OperationKind, PendingOperation, SpawnRequest};
use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

/// Static information about the running workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowInfo {
    pub workflow_type: String,
    pub execution: WorkflowExecution,
    pub task_list: String,
    pub execution_timeout: Option<Duration>,
    pub task_timeout: Option<Duration>,
    pub started_at: DateTime<Utc>,
}

/// Handle passed to workflow code.
#[derive(Clone)]
pub struct WorkflowContext {
    state: Arc<Mutex<InstanceState>>,
    info: Arc<WorkflowInfo>,
    converter: Arc<dyn DataConverter>,
    scope: CancelScope,
    activity_options: ActivityOptions,
    local_activity_options: LocalActivityOptions,
    child_options: ChildWorkflowOptions,
}

impl std::fmt::Debug for WorkflowContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowContext")
            .field("workflow_id", &self.info.execution.workflow_id)
            .field("run_id", &self.info.execution.run_id)
            .field("cancelled", &self.scope.is_cancelled())
            .finish()
    }
}

/// Future returned by [`WorkflowContext::execute_child_workflow`].
///
/// Awaiting it yields the child's result. [`execution`](Self::execution)
/// resolves as soon as the child has started.
pub struct ChildWorkflowFuture<R> {
    result: WorkflowFuture<R>,
    execution: WorkflowFuture<WorkflowExecution>,
}

impl<R> Clone for ChildWorkflowFuture<R> {
    fn clone(&self) -> Self {
        Self {
            result: self.result.clone(),
            execution: self.execution.clone(),
        }
    }
}

impl<R> ChildWorkflowFuture<R> {
    fn failed(error: WorkflowError) -> Self {
        Self {
            result: WorkflowFuture::failed(error.clone()),
            execution: WorkflowFuture::failed(error),
        }
    }

    pub fn execution(&self) -> &WorkflowFuture<WorkflowExecution> {
        &self.execution
    }

    pub fn result(&self) -> &WorkflowFuture<R> {
        &self.result
    }
}

impl<R: Clone> Future for ChildWorkflowFuture<R> {
    type Output = Result<R, WorkflowError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.result).poll(cx)
    }
}

impl<R: Send> Selectable for ChildWorkflowFuture<R> {
    fn is_ready(&self) -> bool {
        self.result.is_ready()
    }

    fn register_waker(&self, waker: &std::task::Waker) {
        self.result.register_waker(waker);
    }
}

/// Suspends the calling thread until the next scheduling round.
struct YieldNow {
    yielded: bool,
}

impl Future for YieldNow {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if self.yielded {
            return Poll::Ready(());
        }
        self.yielded = true;
        cx.waker().wake_by_ref();
        Poll::Pending
    }
}

fn typed_completion<R>(resolver: Resolver<R>, converter: Arc<dyn DataConverter>) -> Completion
where
    R: DeserializeOwned + Send + 'static,
{
    Box::new(move |outcome: Result<Payload, WorkflowError>| {
        let decoded = outcome.and_then(|p| decode::<R>(converter.as_ref(), &p).map_err(WorkflowError::from));
        if resolver.complete(decoded).is_err() {
            tracing::debug!(target: "duroflow::context", "operation future was already resolved");
        }
    })
}

fn unit_completion(resolver: Resolver<()>) -> Completion {
    Box::new(move |outcome: Result<Payload, WorkflowError>| {
        if resolver.complete(outcome.map(|_| ())).is_err() {
            tracing::debug!(target: "duroflow::context", "operation future was already resolved");
        }
    })
}

impl WorkflowContext {
    pub(crate) fn new(
        state: Arc<Mutex<InstanceState>>,
        info: Arc<WorkflowInfo>,
        converter: Arc<dyn DataConverter>,
        scope: CancelScope,
    ) -> Self {
        Self {
            state,
            info,
            converter,
            scope,
            activity_options: ActivityOptions::default(),
            local_activity_options: LocalActivityOptions::default(),
            child_options: ChildWorkflowOptions::default(),
        }
    }

    pub(crate) fn scope(&self) -> &CancelScope {
        &self.scope
    }

    pub fn info(&self) -> &WorkflowInfo {
        &self.info
    }

    pub fn data_converter(&self) -> &Arc<dyn DataConverter> {
        &self.converter
    }

    /// Deterministic workflow time: the timestamp of the latest persisted
    /// non-marker event. Queries and local activity results leave it alone.
    pub fn now(&self) -> DateTime<Utc> {
        lock(&self.state).now
    }

    pub fn is_replaying(&self) -> bool {
        lock(&self.state).replaying
    }

    /// False while replaying unless logging in replay was enabled.
    pub fn is_logging_enabled(&self) -> bool {
        lock(&self.state).is_logging_enabled()
    }

    /// 1-based count of `process_events` calls, attached to log lines by the
    /// `workflow_*!` macros.
    ///
    /// Query-only batches bump it too, so a replay can see different values.
    /// Never branch on it in workflow code.
    #[doc(hidden)]
    pub fn decision_index(&self) -> u64 {
        lock(&self.state).decision_index
    }

    pub fn is_cancelled(&self) -> bool {
        self.scope.is_cancelled()
    }

    // ===== Derived contexts =====

    /// Context whose activities use `options`.
    pub fn with_activity_options(&self, options: ActivityOptions) -> Self {
        Self {
            activity_options: options,
            ..self.clone()
        }
    }

    pub fn with_local_activity_options(&self, options: LocalActivityOptions) -> Self {
        Self {
            local_activity_options: options,
            ..self.clone()
        }
    }

    pub fn with_child_workflow_options(&self, options: ChildWorkflowOptions) -> Self {
        Self {
            child_options: options,
            ..self.clone()
        }
    }

    /// Context in a new cancellation scope below this one.
    ///
    /// Cancelling the handle fails every pending operation issued through the
    /// returned context (and contexts derived from it) with `Canceled`.
    pub fn with_cancel(&self) -> (Self, CancelHandle) {
        let scope = self.scope.child();
        let handle = CancelHandle::new(scope.clone());
        (
            Self {
                scope,
                ..self.clone()
            },
            handle,
        )
    }

    // ===== Futures, channels, threads =====

    pub fn new_future<T>(&self) -> (WorkflowFuture<T>, Resolver<T>) {
        new_future()
    }

    /// Unbounded channel; sends never block.
    pub fn new_channel<T>(&self) -> Channel<T> {
        Channel::unbounded()
    }

    /// Channel holding at most `capacity` values; sends block while full.
    pub fn new_buffered_channel<T>(&self, capacity: usize) -> Channel<T> {
        Channel::bounded(capacity)
    }

    /// Channel receiving the signals named `name`. Signals that arrive before
    /// anyone asks for the channel are buffered.
    pub fn signal_channel(&self, name: &str) -> Channel<Payload> {
        lock(&self.state).signal_channel(name)
    }

    /// Wait for the first ready case; see [`Select`].
    pub fn select<'a>(&'a self, cases: &'a [&'a dyn Selectable]) -> Select<'a> {
        Select::new(cases, &self.scope)
    }

    /// Give other runnable threads a turn.
    pub async fn yield_now(&self) {
        YieldNow { yielded: false }.await
    }

    /// Start a logical thread running `f`. An error returned by the thread
    /// fails the workflow.
    pub fn spawn<F, Fut>(&self, f: F)
    where
        F: FnOnce(WorkflowContext) -> Fut,
        Fut: Future<Output = Result<(), WorkflowError>> + Send + 'static,
    {
        self.spawn_inner(None, f);
    }

    pub fn spawn_named<F, Fut>(&self, name: impl Into<String>, f: F)
    where
        F: FnOnce(WorkflowContext) -> Fut,
        Fut: Future<Output = Result<(), WorkflowError>> + Send + 'static,
    {
        self.spawn_inner(Some(name.into()), f);
    }

    fn spawn_inner<F, Fut>(&self, name: Option<String>, f: F)
    where
        F: FnOnce(WorkflowContext) -> Fut,
        Fut: Future<Output = Result<(), WorkflowError>> + Send + 'static,
    {
        let id = {
            let mut state = lock(&self.state);
            if !state.permit("spawn") {
                return;
            }
            state.next_thread_id()
        };
        let fut = f(self.clone());
        let shared = self.state.clone();
        let future = async move {
            if let Err(e) = fut.await {
                lock(&shared).set_outcome(Err(e));
            }
        }
        .boxed();
        lock(&self.state).spawned.push(SpawnRequest {
            id,
            name: name.unwrap_or_else(|| format!("thread-{id}")),
            future,
        });
    }

    /// Start a logical thread whose outcome is delivered to the returned
    /// future instead of failing the workflow.
    pub fn spawn_with_handle<T, F, Fut>(&self, f: F) -> WorkflowFuture<T>
    where
        T: Send + 'static,
        F: FnOnce(WorkflowContext) -> Fut,
        Fut: Future<Output = Result<T, WorkflowError>> + Send + 'static,
    {
        let (future, resolver) = new_future();
        let id = {
            let mut state = lock(&self.state);
            if !state.permit("spawn") {
                return WorkflowFuture::failed(WorkflowError::generic("spawn is not allowed in a query handler"));
            }
            state.next_thread_id()
        };
        let fut = f(self.clone());
        let thread = async move {
            let _ = resolver.complete(fut.await);
        }
        .boxed();
        lock(&self.state).spawned.push(SpawnRequest {
            id,
            name: format!("thread-{id}"),
            future: thread,
        });
        future
    }

    // ===== Operations =====

    /// Refuse the operation in query mode or on a cancelled context.
    fn begin(&self, operation: &str) -> Result<(), WorkflowError> {
        if !lock(&self.state).permit(operation) {
            return Err(WorkflowError::generic(format!(
                "{operation} is not allowed in a query handler"
            )));
        }
        if self.scope.is_cancelled() {
            return Err(WorkflowError::canceled());
        }
        Ok(())
    }

    /// Allocate a correlation id, emit the command and register the pending operation.
    fn register_operation<B>(&self, build: B) -> u64
    where
        B: FnOnce(u64) -> (Command, PendingOperation),
    {
        let mut state = lock(&self.state);
        let id = state.next_correlation_id();
        let (command, op) = build(id);
        tracing::trace!(target: "duroflow::context", id, command = command.name(), "command emitted");
        state.commands.push(command);
        state.pending.insert(id, op);
        id
    }

    fn encode_args<A: Serialize + ?Sized>(&self, args: &A) -> Result<Payload, WorkflowError> {
        Ok(encode(self.converter.as_ref(), args)?)
    }

    /// Schedule an activity with this context's activity options.
    pub fn execute_activity<A, R>(&self, activity_type: &str, args: &A) -> WorkflowFuture<R>
    where
        A: Serialize + ?Sized,
        R: DeserializeOwned + Send + 'static,
    {
        let prepared = self.begin("execute_activity").and_then(|()| {
            self.activity_options.validate()?;
            let input = self.encode_args(args)?;
            let mut options = self.activity_options.clone();
            if options.task_list.is_none() {
                options.task_list = Some(self.info.task_list.clone());
            }
            Ok((input, options))
        });
        let (input, options) = match prepared {
            Ok(p) => p,
            Err(e) => return WorkflowFuture::failed(e),
        };
        let (future, resolver) = new_future();
        let completion = typed_completion(resolver, self.converter.clone());
        let scope = self.scope.clone();
        self.register_operation(|id| {
            (
                Command::ScheduleActivity {
                    id,
                    activity_type: activity_type.to_string(),
                    input,
                    options,
                },
                PendingOperation::new(OperationKind::Activity, scope, activity_type, completion),
            )
        });
        future
    }

    /// Run a short activity inside the worker process. The result is recorded
    /// as a marker, so replays do not execute it again.
    pub fn execute_local_activity<A, R>(&self, activity_type: &str, args: &A) -> WorkflowFuture<R>
    where
        A: Serialize + ?Sized,
        R: DeserializeOwned + Send + 'static,
    {
        let prepared = self.begin("execute_local_activity").and_then(|()| {
            self.local_activity_options.validate()?;
            self.encode_args(args)
        });
        let input = match prepared {
            Ok(p) => p,
            Err(e) => return WorkflowFuture::failed(e),
        };
        let (future, resolver) = new_future();
        let completion = typed_completion(resolver, self.converter.clone());
        let scope = self.scope.clone();
        let options = self.local_activity_options.clone();
        self.register_operation(|id| {
            (
                Command::ScheduleLocalActivity {
                    id,
                    activity_type: activity_type.to_string(),
                    input,
                    options,
                },
                PendingOperation::new(OperationKind::LocalActivity, scope, activity_type, completion),
            )
        });
        future
    }

    /// Start a timer. A zero duration resolves immediately without a command.
    pub fn new_timer(&self, duration: Duration) -> WorkflowFuture<()> {
        if let Err(e) = self.begin("new_timer") {
            return WorkflowFuture::failed(e);
        }
        if duration.is_zero() {
            return WorkflowFuture::ready(());
        }
        let (future, resolver) = new_future();
        let scope = self.scope.clone();
        self.register_operation(|id| {
            (
                Command::StartTimer { id, duration },
                PendingOperation::new(OperationKind::Timer, scope, "timer", unit_completion(resolver)),
            )
        });
        future
    }

    pub async fn sleep(&self, duration: Duration) -> Result<(), WorkflowError> {
        self.new_timer(duration).await
    }

    /// Start a child workflow with this context's child workflow options.
    pub fn execute_child_workflow<A, R>(&self, workflow_type: &str, args: &A) -> ChildWorkflowFuture<R>
    where
        A: Serialize + ?Sized,
        R: DeserializeOwned + Send + 'static,
    {
        let prepared = self.begin("execute_child_workflow").and_then(|()| {
            self.child_options.validate()?;
            self.encode_args(args)
        });
        let input = match prepared {
            Ok(p) => p,
            Err(e) => return ChildWorkflowFuture::failed(e),
        };
        let (result, result_resolver) = new_future();
        let (execution, execution_resolver) = new_future::<WorkflowExecution>();
        let completion = typed_completion(result_resolver, self.converter.clone());
        let scope = self.scope.clone();
        let mut options = self.child_options.clone();
        if options.task_list.is_none() {
            options.task_list = Some(self.info.task_list.clone());
        }
        let run_id = self.info.execution.run_id.clone();
        self.register_operation(|id| {
            let workflow_id = options
                .workflow_id
                .clone()
                .unwrap_or_else(|| format!("{run_id}:child-{id}"));
            let mut op = PendingOperation::new(OperationKind::ChildWorkflow, scope, workflow_type, completion);
            op.on_started = Some(Box::new(move |started: Result<WorkflowExecution, WorkflowError>| {
                let _ = execution_resolver.complete(started);
            }));
            op.child = Some(ChildTarget {
                workflow_id: workflow_id.clone(),
                run_id: None,
            });
            (
                Command::StartChildWorkflow {
                    id,
                    workflow_type: workflow_type.to_string(),
                    workflow_id,
                    input,
                    options,
                },
                op,
            )
        });
        ChildWorkflowFuture { result, execution }
    }

    /// Signal another workflow. The future resolves once the signal is delivered.
    pub fn signal_external_workflow<A>(
        &self,
        workflow_id: &str,
        run_id: Option<&str>,
        signal_name: &str,
        arg: &A,
    ) -> WorkflowFuture<()>
    where
        A: Serialize + ?Sized,
    {
        let prepared = self.begin("signal_external_workflow").and_then(|()| self.encode_args(arg));
        let input = match prepared {
            Ok(p) => p,
            Err(e) => return WorkflowFuture::failed(e),
        };
        let (future, resolver) = new_future();
        let scope = self.scope.clone();
        self.register_operation(|id| {
            (
                Command::SignalExternalWorkflow {
                    id,
                    workflow_id: workflow_id.to_string(),
                    run_id: run_id.map(str::to_string),
                    signal_name: signal_name.to_string(),
                    input,
                    child_workflow_only: false,
                },
                PendingOperation::new(OperationKind::SignalExternal, scope, signal_name, unit_completion(resolver)),
            )
        });
        future
    }

    /// Request cancellation of another workflow.
    pub fn request_cancel_external_workflow(&self, workflow_id: &str, run_id: Option<&str>) -> WorkflowFuture<()> {
        if let Err(e) = self.begin("request_cancel_external_workflow") {
            return WorkflowFuture::failed(e);
        }
        let (future, resolver) = new_future();
        let scope = self.scope.clone();
        self.register_operation(|id| {
            (
                Command::RequestCancelExternalWorkflow {
                    id,
                    workflow_id: workflow_id.to_string(),
                    run_id: run_id.map(str::to_string),
                    child_workflow_only: false,
                },
                PendingOperation::new(
                    OperationKind::CancelExternal,
                    scope,
                    workflow_id,
                    unit_completion(resolver),
                ),
            )
        });
        future
    }

    // ===== Markers =====

    /// Run `f` once and record its result; replays return the recorded value
    /// without calling `f`.
    ///
    /// If the value cannot be produced deterministically (missing marker on
    /// replay, codec failure) the decision fails and this call never returns.
    pub async fn side_effect<T, F>(&self, f: F) -> T
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> T,
    {
        match self.record_side_effect(f) {
            Ok(value) => value,
            Err(error) => {
                lock(&self.state).fail_decision(error);
                std::future::pending().await
            }
        }
    }

    fn record_side_effect<T, F>(&self, f: F) -> Result<T, DecisionError>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> T,
    {
        let step = {
            let mut state = lock(&self.state);
            let replaying = state.replaying;
            state.markers.begin_side_effect(replaying)
        };
        let (id, value) = match step {
            SideEffectStep::Recorded { id, value } => (id, value),
            SideEffectStep::Missing { id } => {
                return Err(DecisionError::nondeterministic(format!(
                    "side effect {id} has no recorded marker in history"
                )));
            }
            SideEffectStep::Execute { id } => {
                let value = encode(self.converter.as_ref(), &f())?;
                lock(&self.state).markers.finish_side_effect(id, value.clone());
                (id, value)
            }
        };
        let decoded = decode(self.converter.as_ref(), &value)?;
        lock(&self.state).commands.push(Command::RecordMarker {
            marker: MarkerData::SideEffect { id, value },
        });
        Ok(decoded)
    }

    /// Version of the code path guarded by `change_id`.
    ///
    /// Live runs get `max_supported`, recorded once per change id. Replays
    /// return the recorded version, or [`DEFAULT_VERSION`](crate::DEFAULT_VERSION)
    /// when the history predates the change. A version outside
    /// `[min_supported, max_supported]` fails the decision and this call never
    /// returns.
    pub async fn get_version(&self, change_id: &str, min_supported: Version, max_supported: Version) -> Version {
        let decided = {
            let mut state = lock(&self.state);
            let replaying = state.replaying;
            let decided = state
                .markers
                .get_version(change_id, min_supported, max_supported, replaying);
            match decided {
                Ok(d) => {
                    if d.record {
                        state.commands.push(Command::RecordMarker {
                            marker: MarkerData::Version {
                                change_id: change_id.to_string(),
                                version: d.version,
                            },
                        });
                    }
                    Ok(d.version)
                }
                Err(e) => {
                    state.fail_decision(e.clone());
                    Err(e)
                }
            }
        };
        match decided {
            Ok(version) => version,
            Err(_) => std::future::pending().await,
        }
    }

    // ===== Queries =====

    /// Register (or replace) a typed query handler.
    pub fn set_query_handler<A, R, F>(&self, query_type: &str, handler: F) -> Result<(), QueryError>
    where
        A: DeserializeOwned,
        R: Serialize,
        F: Fn(A) -> Result<R, WorkflowError> + Send + Sync + 'static,
    {
        let converter = self.converter.clone();
        self.set_raw_query_handler(query_type, move |args| {
            let decoded: A = decode_optional(converter.as_ref(), args)?;
            let result = handler(decoded)?;
            Ok(encode(converter.as_ref(), &result)?)
        })
    }

    /// Register (or replace) a query handler working on raw payloads.
    pub fn set_raw_query_handler<F>(&self, query_type: &str, handler: F) -> Result<(), QueryError>
    where
        F: Fn(Option<&Payload>) -> Result<Payload, WorkflowError> + Send + Sync + 'static,
    {
        let mut state = lock(&self.state);
        if !state.permit("set_query_handler") {
            return Err(QueryError::RegistrationInQuery);
        }
        state.queries.register(query_type, query_handler(handler))
    }
}

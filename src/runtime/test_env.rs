//! In-memory collaborator for running workflows end to end in tests.
//!
//! The environment plays the part of the service: it feeds events to a
//! [`WorkflowInstance`], executes the commands that come back, and records
//! every decision so the run can be replayed afterwards.
//!
//! * Activities and local activities run on the calling tokio runtime through
//!   the registry, with per-attempt timeouts and the configured retry policy.
//!   They complete at the current virtual time.
//! * Timers use a virtual clock. When nothing else is pending the clock jumps
//!   to the earliest timer or delayed signal, so a workflow that sleeps for a
//!   day finishes instantly.
//! * Child workflows run recursively in their own instance.
//! * External signals and cancellations are acknowledged immediately.

use crate::codec::{DataConverter, Payload, decode, encode};
use crate::commands::Command;
use crate::errors::{CodecError, DecisionError, TimeoutType, WorkflowError};
use crate::history::{EventKind, HistoryEvent, WorkflowExecution};
use crate::options::{ActivityOptions, InstanceOptions, RetryPolicy};
use crate::runtime::instance::WorkflowInstance;
use crate::runtime::registry::Registry;
use crate::runtime::replayer::{DecisionRecord, RecordedHistory};
use crate::runtime::{ActivityContext, ActivityInfo};
use chrono::{DateTime, Utc};
use futures::FutureExt;
use futures::future::BoxFuture;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

const DEFAULT_WORKFLOW_ID: &str = "default-test-workflow-id";
const DEFAULT_RUN_ID: &str = "default-test-run-id";
const DEFAULT_TASK_LIST: &str = "default-test-tasklist";
/// 2020-01-01T00:00:00Z
const DEFAULT_START_SECONDS: i64 = 1_577_836_800;

#[derive(Debug, thiserror::Error)]
pub enum TestEnvError {
    #[error(transparent)]
    Decision(#[from] DecisionError),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error("workflow {workflow_id} is blocked with no pending timers, activities or signals")]
    Stalled { workflow_id: String },
}

/// A finished run.
#[derive(Debug)]
pub struct TestRun {
    pub result: Result<Payload, WorkflowError>,
    pub history: RecordedHistory,
    /// The closed instance; still answers queries.
    pub instance: WorkflowInstance,
    converter: Arc<dyn DataConverter>,
}

impl TestRun {
    /// Decode the workflow result.
    pub fn result_as<T: DeserializeOwned>(&self) -> Result<T, WorkflowError> {
        match &self.result {
            Ok(payload) => Ok(decode(self.converter.as_ref(), payload)?),
            Err(e) => Err(e.clone()),
        }
    }
}

/// Event injected at a virtual time offset.
#[derive(Debug, Clone)]
struct Delayed {
    at: Duration,
    seq: u64,
    kind: EventKind,
}

pub struct TestWorkflowEnvironment {
    registry: Arc<Registry>,
    options: InstanceOptions,
    execution: WorkflowExecution,
    task_list: String,
    start_time: DateTime<Utc>,
    delayed: Vec<Delayed>,
}

impl TestWorkflowEnvironment {
    pub fn new(registry: Registry) -> Self {
        Self {
            registry: Arc::new(registry),
            options: InstanceOptions::default(),
            execution: WorkflowExecution::new(DEFAULT_WORKFLOW_ID, DEFAULT_RUN_ID),
            task_list: DEFAULT_TASK_LIST.to_string(),
            start_time: DateTime::from_timestamp(DEFAULT_START_SECONDS, 0).unwrap_or_default(),
            delayed: Vec::new(),
        }
    }

    pub fn with_instance_options(mut self, options: InstanceOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_execution(mut self, execution: WorkflowExecution) -> Self {
        self.execution = execution;
        self
    }

    pub fn with_start_time(mut self, start_time: DateTime<Utc>) -> Self {
        self.start_time = start_time;
        self
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Deliver a signal once `delay` of virtual time has passed.
    pub fn signal_workflow_after<A: Serialize + ?Sized>(
        &mut self,
        delay: Duration,
        signal_name: &str,
        arg: &A,
    ) -> Result<(), TestEnvError> {
        let input = encode(self.registry.data_converter().as_ref(), arg)?;
        self.push_delayed(
            delay,
            EventKind::SignalReceived {
                signal_name: signal_name.to_string(),
                input,
            },
        );
        Ok(())
    }

    /// Request cancellation of the workflow once `delay` of virtual time has passed.
    pub fn cancel_workflow_after(&mut self, delay: Duration) {
        self.push_delayed(delay, EventKind::CancellationRequested { reason: None });
    }

    fn push_delayed(&mut self, at: Duration, kind: EventKind) {
        let seq = self.delayed.len() as u64;
        self.delayed.push(Delayed { at, seq, kind });
        self.delayed.sort_by_key(|d| (d.at, d.seq));
    }

    /// Run `workflow_type` to completion.
    ///
    /// # Errors
    ///
    /// A decision failure of the top-level workflow, or a workflow that blocks
    /// forever.
    pub async fn execute_workflow<A: Serialize + ?Sized>(
        &self,
        workflow_type: &str,
        args: &A,
    ) -> Result<TestRun, TestEnvError> {
        let input = encode(self.registry.data_converter().as_ref(), args)?;
        self.run(
            self.execution.clone(),
            workflow_type.to_string(),
            input,
            None,
            self.delayed.clone(),
        )
        .await
    }

    fn run(
        &self,
        execution: WorkflowExecution,
        workflow_type: String,
        input: Payload,
        execution_timeout: Option<Duration>,
        mut external: Vec<Delayed>,
    ) -> BoxFuture<'_, Result<TestRun, TestEnvError>> {
        async move {
            let mut instance = WorkflowInstance::new(self.registry.clone(), execution.clone(), self.options.clone());
            let mut history = RecordedHistory::new(execution.clone());
            let mut clock = Duration::ZERO;
            let mut next_event_id = 1u64;
            let mut timers: BTreeSet<(Duration, u64)> = BTreeSet::new();
            let mut inbox = vec![EventKind::WorkflowExecutionStarted {
                workflow_type,
                input,
                task_list: self.task_list.clone(),
                execution_timeout,
                task_timeout: Some(Duration::from_secs(10)),
            }];

            loop {
                take_due(&mut external, clock, &mut inbox);
                if inbox.is_empty() {
                    let next_timer = timers.first().map(|(at, _)| *at);
                    let next_external = external.first().map(|d| d.at);
                    let Some(next) = next_timer.into_iter().chain(next_external).min() else {
                        return Err(TestEnvError::Stalled {
                            workflow_id: execution.workflow_id.clone(),
                        });
                    };
                    clock = clock.max(next);
                    while let Some(&(at, timer_id)) = timers.first() {
                        if at > clock {
                            break;
                        }
                        timers.pop_first();
                        inbox.push(EventKind::TimerFired { timer_id });
                    }
                    take_due(&mut external, clock, &mut inbox);
                }

                let now = virtual_now(self.start_time, clock);
                let events: Vec<HistoryEvent> = inbox
                    .drain(..)
                    .map(|kind| {
                        let event = HistoryEvent::new(next_event_id, now, kind);
                        next_event_id += 1;
                        event
                    })
                    .collect();
                let outcome = instance.process_events(events.clone())?;
                let markers = DecisionRecord::marker_events(&outcome.commands, next_event_id, now);
                next_event_id += markers.len() as u64;
                history.decisions.push(DecisionRecord {
                    events,
                    markers,
                    commands: outcome.commands.clone(),
                });
                tracing::debug!(
                    target: "duroflow::test_env",
                    workflow_id = %execution.workflow_id,
                    decision = history.decisions.len(),
                    commands = outcome.commands.len(),
                    virtual_time = ?clock,
                    "decision completed"
                );

                for command in outcome.commands {
                    match command {
                        Command::ScheduleActivity {
                            id,
                            activity_type,
                            input,
                            options,
                        } => {
                            let info = self.activity_info(&execution, id, &activity_type, options.task_list.clone(), false);
                            let attempt_timeout = options.attempt_timeout();
                            let outcome = self
                                .run_activity(
                                    info,
                                    input,
                                    attempt_timeout,
                                    activity_timeout_type(&options),
                                    options.retry_policy.as_ref(),
                                )
                                .await;
                            inbox.push(match outcome {
                                Ok(result) => EventKind::ActivityCompleted {
                                    scheduled_id: id,
                                    result,
                                },
                                Err(WorkflowError::Timeout { timeout_type, details }) => EventKind::ActivityTimedOut {
                                    scheduled_id: id,
                                    timeout_type,
                                    details,
                                },
                                Err(failure) => EventKind::ActivityFailed {
                                    scheduled_id: id,
                                    failure,
                                },
                            });
                        }
                        Command::ScheduleLocalActivity {
                            id,
                            activity_type,
                            input,
                            options,
                        } => {
                            let info = self.activity_info(&execution, id, &activity_type, None, true);
                            let outcome = self
                                .run_activity(
                                    info,
                                    input,
                                    Some(options.schedule_to_close_timeout),
                                    TimeoutType::ScheduleToClose,
                                    options.retry_policy.as_ref(),
                                )
                                .await;
                            inbox.push(EventKind::LocalActivityResult { id, outcome });
                        }
                        Command::StartTimer { id, duration } => {
                            timers.insert((clock + duration, id));
                        }
                        Command::CancelTimer { id } => {
                            timers.retain(|(_, timer_id)| *timer_id != id);
                        }
                        Command::StartChildWorkflow {
                            id,
                            workflow_type,
                            workflow_id,
                            input,
                            options,
                        } => {
                            let child_events = self
                                .run_child(id, workflow_type, workflow_id, input, Some(options.execution_timeout))
                                .await;
                            inbox.extend(child_events);
                        }
                        Command::SignalExternalWorkflow { id, .. } => {
                            inbox.push(EventKind::ExternalSignalCompleted { initiated_id: id });
                        }
                        Command::RequestCancelExternalWorkflow { id, .. } => {
                            inbox.push(EventKind::ExternalCancelRequested { initiated_id: id });
                        }
                        // Activities complete before a cancel can reach them.
                        Command::RequestCancelActivity { .. } => {}
                        Command::RecordMarker { .. } => {}
                        Command::CompleteWorkflow { .. }
                        | Command::FailWorkflow { .. }
                        | Command::CancelWorkflow { .. } => {}
                    }
                }

                if outcome.closed {
                    let result = instance
                        .result()
                        .cloned()
                        .unwrap_or_else(|| Err(WorkflowError::generic("workflow closed without a result")));
                    return Ok(TestRun {
                        result,
                        history,
                        instance,
                        converter: self.registry.data_converter().clone(),
                    });
                }
            }
        }
        .boxed()
    }

    /// Run a child to completion and return the events its parent sees.
    async fn run_child(
        &self,
        initiated_id: u64,
        workflow_type: String,
        workflow_id: String,
        input: Payload,
        execution_timeout: Option<Duration>,
    ) -> Vec<EventKind> {
        if !self.registry.has_workflow(&workflow_type) {
            return vec![EventKind::ChildWorkflowFailed {
                initiated_id,
                failure: WorkflowError::generic(format!("workflow type '{workflow_type}' is not registered")),
            }];
        }
        let execution = WorkflowExecution::new(workflow_id.clone(), format!("{workflow_id}-run"));
        let started = EventKind::ChildWorkflowStarted {
            initiated_id,
            execution: execution.clone(),
        };
        let finished = match self
            .run(execution, workflow_type, input, execution_timeout, Vec::new())
            .await
        {
            Ok(TestRun { result: Ok(result), .. }) => EventKind::ChildWorkflowCompleted { initiated_id, result },
            Ok(TestRun { result: Err(failure), .. }) => EventKind::ChildWorkflowFailed { initiated_id, failure },
            Err(e) => EventKind::ChildWorkflowFailed {
                initiated_id,
                failure: WorkflowError::generic(e.to_string()),
            },
        };
        vec![started, finished]
    }

    fn activity_info(
        &self,
        execution: &WorkflowExecution,
        id: u64,
        activity_type: &str,
        task_list: Option<String>,
        local: bool,
    ) -> ActivityInfo {
        ActivityInfo {
            activity_type: activity_type.to_string(),
            activity_id: id,
            workflow_execution: execution.clone(),
            task_list: task_list.unwrap_or_else(|| self.task_list.clone()),
            attempt: 1,
            local,
        }
    }

    /// Execute attempts until one succeeds or the retry policy gives up.
    /// A policy without `maximum_attempts` retries a failing activity forever.
    async fn run_activity(
        &self,
        info: ActivityInfo,
        input: Payload,
        attempt_timeout: Option<Duration>,
        timeout_type: TimeoutType,
        retry_policy: Option<&RetryPolicy>,
    ) -> Result<Payload, WorkflowError> {
        let mut attempt = 1;
        loop {
            let ctx = ActivityContext::new(
                ActivityInfo {
                    attempt,
                    ..info.clone()
                },
                self.registry.data_converter().clone(),
            );
            let call = self.registry.execute_activity(ctx, &info.activity_type, input.clone());
            let outcome = match attempt_timeout {
                Some(limit) => tokio::time::timeout(limit, call)
                    .await
                    .unwrap_or_else(|_| Err(WorkflowError::timeout(timeout_type))),
                None => call.await,
            };
            match outcome {
                Ok(result) => return Ok(result),
                Err(error) => match retry_policy {
                    Some(policy) if policy.should_retry(attempt, &error) => {
                        tracing::debug!(
                            target: "duroflow::test_env",
                            activity_type = %info.activity_type,
                            activity_id = info.activity_id,
                            attempt,
                            error = %error,
                            backoff = ?policy.backoff(attempt),
                            "retrying activity"
                        );
                        attempt += 1;
                    }
                    _ => return Err(error),
                },
            }
        }
    }
}

fn activity_timeout_type(options: &ActivityOptions) -> TimeoutType {
    match (options.start_to_close_timeout, options.schedule_to_close_timeout) {
        (Some(start), Some(schedule)) if schedule < start => TimeoutType::ScheduleToClose,
        (Some(_), _) => TimeoutType::StartToClose,
        _ => TimeoutType::ScheduleToClose,
    }
}

fn take_due(external: &mut Vec<Delayed>, clock: Duration, inbox: &mut Vec<EventKind>) {
    let split = external.iter().take_while(|d| d.at <= clock).count();
    inbox.extend(external.drain(..split).map(|d| d.kind));
}

fn virtual_now(start: DateTime<Utc>, elapsed: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(elapsed)
        .ok()
        .and_then(|d| start.checked_add_signed(d))
        .unwrap_or(start)
}

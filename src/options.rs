//! Operation options and per-instance configuration.
//!
//! Every struct here implements `Default` and deserializes with
//! `#[serde(default)]`, so configuration files only need the fields they change.

use crate::errors::WorkflowError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Retry schedule applied by the collaborator that executes the operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Delay before the first retry. Must be positive.
    pub initial_interval: Duration,
    /// Growth factor of the delay between attempts. Must be at least 1.0.
    pub backoff_coefficient: f64,
    /// Upper bound on the delay between attempts. `None` means 100x the initial interval.
    pub maximum_interval: Option<Duration>,
    /// Total attempts including the first one. 0 means unlimited.
    pub maximum_attempts: u32,
    /// Application error types that are never retried.
    pub non_retryable_error_types: Vec<String>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_secs(1),
            backoff_coefficient: 2.0,
            maximum_interval: None,
            maximum_attempts: 0,
            non_retryable_error_types: Vec::new(),
        }
    }
}

impl RetryPolicy {
    pub fn validate(&self) -> Result<(), WorkflowError> {
        if self.initial_interval.is_zero() {
            return Err(WorkflowError::generic("retry policy: initial_interval must be positive"));
        }
        if self.backoff_coefficient.is_nan() || self.backoff_coefficient < 1.0 {
            return Err(WorkflowError::generic(
                "retry policy: backoff_coefficient must be at least 1.0",
            ));
        }
        if let Some(max) = self.maximum_interval
            && max < self.initial_interval
        {
            return Err(WorkflowError::generic(
                "retry policy: maximum_interval must not be smaller than initial_interval",
            ));
        }
        Ok(())
    }

    /// Whether another attempt is allowed after `attempt` (1-based) failed with `error`.
    pub fn should_retry(&self, attempt: u32, error: &WorkflowError) -> bool {
        if !error.is_retryable() {
            return false;
        }
        if let WorkflowError::Application { error_type, .. } = error
            && self.non_retryable_error_types.iter().any(|t| t == error_type)
        {
            return false;
        }
        self.maximum_attempts == 0 || attempt < self.maximum_attempts
    }

    /// Delay before attempt `attempt + 1`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let cap = self.maximum_interval.unwrap_or(self.initial_interval * 100);
        let factor = self.backoff_coefficient.powi(attempt.saturating_sub(1) as i32);
        let delay = self.initial_interval.mul_f64(factor);
        delay.min(cap)
    }
}

/// Options for `execute_activity`.
///
/// Either `schedule_to_close_timeout` or `start_to_close_timeout` is required.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ActivityOptions {
    /// Task list the activity is dispatched to. `None` uses the workflow's task list.
    pub task_list: Option<String>,
    pub schedule_to_start_timeout: Option<Duration>,
    pub start_to_close_timeout: Option<Duration>,
    pub schedule_to_close_timeout: Option<Duration>,
    pub heartbeat_timeout: Option<Duration>,
    pub retry_policy: Option<RetryPolicy>,
}

impl ActivityOptions {
    pub fn with_start_to_close(timeout: Duration) -> Self {
        Self {
            start_to_close_timeout: Some(timeout),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), WorkflowError> {
        if self.schedule_to_close_timeout.is_none() && self.start_to_close_timeout.is_none() {
            return Err(WorkflowError::generic(
                "activity options: either schedule_to_close_timeout or start_to_close_timeout is required",
            ));
        }
        for (name, t) in [
            ("schedule_to_start_timeout", self.schedule_to_start_timeout),
            ("start_to_close_timeout", self.start_to_close_timeout),
            ("schedule_to_close_timeout", self.schedule_to_close_timeout),
            ("heartbeat_timeout", self.heartbeat_timeout),
        ] {
            if t.is_some_and(|d| d.is_zero()) {
                return Err(WorkflowError::generic(format!("activity options: {name} must be positive")));
            }
        }
        if matches!(self.task_list.as_deref(), Some("")) {
            return Err(WorkflowError::generic("activity options: task_list must not be empty"));
        }
        if let Some(policy) = &self.retry_policy {
            policy.validate()?;
        }
        Ok(())
    }

    /// Timeout enforced on a single attempt.
    pub fn attempt_timeout(&self) -> Option<Duration> {
        match (self.start_to_close_timeout, self.schedule_to_close_timeout) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }
}

/// Options for `execute_local_activity`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalActivityOptions {
    pub schedule_to_close_timeout: Duration,
    pub retry_policy: Option<RetryPolicy>,
}

impl Default for LocalActivityOptions {
    fn default() -> Self {
        Self {
            schedule_to_close_timeout: Duration::from_secs(10),
            retry_policy: None,
        }
    }
}

impl LocalActivityOptions {
    pub fn validate(&self) -> Result<(), WorkflowError> {
        if self.schedule_to_close_timeout.is_zero() {
            return Err(WorkflowError::generic(
                "local activity options: schedule_to_close_timeout must be positive",
            ));
        }
        if let Some(policy) = &self.retry_policy {
            policy.validate()?;
        }
        Ok(())
    }
}

/// What happens to a child workflow when its parent closes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChildWorkflowPolicy {
    #[default]
    Terminate,
    RequestCancel,
    Abandon,
}

/// Options for `execute_child_workflow`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChildWorkflowOptions {
    /// `None` derives a deterministic id from the parent run and the correlation id.
    pub workflow_id: Option<String>,
    pub task_list: Option<String>,
    /// Required; zero is rejected.
    pub execution_timeout: Duration,
    pub task_timeout: Duration,
    pub child_policy: ChildWorkflowPolicy,
    pub retry_policy: Option<RetryPolicy>,
}

impl Default for ChildWorkflowOptions {
    fn default() -> Self {
        Self {
            workflow_id: None,
            task_list: None,
            execution_timeout: Duration::ZERO,
            task_timeout: Duration::from_secs(10),
            child_policy: ChildWorkflowPolicy::Terminate,
            retry_policy: None,
        }
    }
}

impl ChildWorkflowOptions {
    pub fn with_execution_timeout(timeout: Duration) -> Self {
        Self {
            execution_timeout: timeout,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), WorkflowError> {
        if self.execution_timeout.is_zero() {
            return Err(WorkflowError::generic("child workflow options: execution_timeout is required"));
        }
        if self.task_timeout.is_zero() {
            return Err(WorkflowError::generic("child workflow options: task_timeout must be positive"));
        }
        if matches!(self.workflow_id.as_deref(), Some("")) {
            return Err(WorkflowError::generic("child workflow options: workflow_id must not be empty"));
        }
        if let Some(policy) = &self.retry_policy {
            policy.validate()?;
        }
        Ok(())
    }
}

/// How a panic inside a logical thread is reported.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum PanicPolicy {
    /// Abort the decision; the caller may retry with fixed code.
    #[default]
    FailDecision,
    /// Fail the workflow with a `Panic` failure.
    FailWorkflow,
}

/// Configuration for a workflow instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InstanceOptions {
    /// Default: `PanicPolicy::FailDecision`.
    pub panic_policy: PanicPolicy,
    /// Upper bound on scheduling rounds in one decision. A workflow that keeps
    /// waking itself (for example a `yield_now` loop) hits this bound.
    /// Default: 10_000
    pub max_scheduler_rounds: usize,
    /// Emit workflow log macros while replaying.
    /// Default: false
    pub enable_logging_in_replay: bool,
}

impl Default for InstanceOptions {
    fn default() -> Self {
        Self {
            panic_policy: PanicPolicy::FailDecision,
            max_scheduler_rounds: crate::runtime::limits::DEFAULT_MAX_SCHEDULER_ROUNDS,
            enable_logging_in_replay: false,
        }
    }
}

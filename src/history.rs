//! Incoming history events.
//!
//! A decision is driven by an ordered batch of [`HistoryEvent`]s. Completions
//! refer back to the operation that produced them through the correlation id
//! carried by the originating command (`scheduled_id`, `timer_id`,
//! `initiated_id`).

use crate::codec::Payload;
use crate::commands::MarkerData;
use crate::errors::{TimeoutType, WorkflowError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Identity of a workflow run.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkflowExecution {
    pub workflow_id: String,
    pub run_id: String,
}

impl WorkflowExecution {
    pub fn new(workflow_id: impl Into<String>, run_id: impl Into<String>) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            run_id: run_id.into(),
        }
    }
}

impl fmt::Display for WorkflowExecution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.workflow_id, self.run_id)
    }
}

/// One history event with its position in the run's history.
///
/// `event_id` must increase strictly across the events fed to an instance.
/// Events at or below the replay cursor are treated as redeliveries and skipped.
/// `timestamp` drives [`WorkflowContext::now`](crate::WorkflowContext::now).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEvent {
    pub event_id: u64,
    pub timestamp: DateTime<Utc>,
    pub kind: EventKind,
}

impl HistoryEvent {
    pub fn new(event_id: u64, timestamp: DateTime<Utc>, kind: EventKind) -> Self {
        Self {
            event_id,
            timestamp,
            kind,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EventKind {
    WorkflowExecutionStarted {
        workflow_type: String,
        input: Payload,
        task_list: String,
        execution_timeout: Option<Duration>,
        task_timeout: Option<Duration>,
    },
    ActivityCompleted {
        scheduled_id: u64,
        result: Payload,
    },
    ActivityFailed {
        scheduled_id: u64,
        failure: WorkflowError,
    },
    ActivityTimedOut {
        scheduled_id: u64,
        timeout_type: TimeoutType,
        details: Option<Payload>,
    },
    ActivityCanceled {
        scheduled_id: u64,
        details: Option<Payload>,
    },
    /// Result of a local activity executed by the worker. Not persisted: the
    /// instance records it as a marker, which is what replays see.
    LocalActivityResult {
        id: u64,
        outcome: Result<Payload, WorkflowError>,
    },
    TimerFired {
        timer_id: u64,
    },
    ChildWorkflowStarted {
        initiated_id: u64,
        execution: WorkflowExecution,
    },
    ChildWorkflowCompleted {
        initiated_id: u64,
        result: Payload,
    },
    /// Child failed, timed out, was cancelled, or could not be started.
    ChildWorkflowFailed {
        initiated_id: u64,
        failure: WorkflowError,
    },
    ExternalSignalCompleted {
        initiated_id: u64,
    },
    ExternalSignalFailed {
        initiated_id: u64,
        failure: WorkflowError,
    },
    ExternalCancelRequested {
        initiated_id: u64,
    },
    ExternalCancelFailed {
        initiated_id: u64,
        failure: WorkflowError,
    },
    SignalReceived {
        signal_name: String,
        input: Payload,
    },
    CancellationRequested {
        reason: Option<String>,
    },
    MarkerRecorded {
        marker: MarkerData,
    },
    /// Answered after the batch's threads settle; never produces commands.
    QueryRequested {
        query_id: String,
        query_type: String,
        args: Option<Payload>,
    },
}

impl EventKind {
    pub fn name(&self) -> &'static str {
        match self {
            EventKind::WorkflowExecutionStarted { .. } => "WorkflowExecutionStarted",
            EventKind::ActivityCompleted { .. } => "ActivityCompleted",
            EventKind::ActivityFailed { .. } => "ActivityFailed",
            EventKind::ActivityTimedOut { .. } => "ActivityTimedOut",
            EventKind::ActivityCanceled { .. } => "ActivityCanceled",
            EventKind::LocalActivityResult { .. } => "LocalActivityResult",
            EventKind::TimerFired { .. } => "TimerFired",
            EventKind::ChildWorkflowStarted { .. } => "ChildWorkflowStarted",
            EventKind::ChildWorkflowCompleted { .. } => "ChildWorkflowCompleted",
            EventKind::ChildWorkflowFailed { .. } => "ChildWorkflowFailed",
            EventKind::ExternalSignalCompleted { .. } => "ExternalSignalCompleted",
            EventKind::ExternalSignalFailed { .. } => "ExternalSignalFailed",
            EventKind::ExternalCancelRequested { .. } => "ExternalCancelRequested",
            EventKind::ExternalCancelFailed { .. } => "ExternalCancelFailed",
            EventKind::SignalReceived { .. } => "SignalReceived",
            EventKind::CancellationRequested { .. } => "CancellationRequested",
            EventKind::MarkerRecorded { .. } => "MarkerRecorded",
            EventKind::QueryRequested { .. } => "QueryRequested",
        }
    }

    /// Events that exist only in the live stream and are absent on replay.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            EventKind::LocalActivityResult { .. } | EventKind::QueryRequested { .. }
        )
    }

    /// Whether the event's timestamp becomes the workflow clock.
    ///
    /// Transient events never reach history, and markers are persisted after
    /// the decision that produced them, so neither may move `now`.
    pub fn advances_clock(&self) -> bool {
        !self.is_transient() && !matches!(self, EventKind::MarkerRecorded { .. })
    }
}

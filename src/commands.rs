//! Outgoing commands and marker payloads.

use crate::codec::Payload;
use crate::errors::WorkflowError;
use crate::options::{ActivityOptions, ChildWorkflowOptions, LocalActivityOptions};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Change version returned by `get_version`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Version(pub i32);

/// Version reported for a change point that executed before `get_version`
/// was added to the workflow code.
pub const DEFAULT_VERSION: Version = Version(-1);

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i32> for Version {
    fn from(v: i32) -> Self {
        Version(v)
    }
}

/// Data recorded into history by a `RecordMarker` command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MarkerData {
    SideEffect {
        id: u64,
        value: Payload,
    },
    Version {
        change_id: String,
        version: Version,
    },
    LocalActivity {
        id: u64,
        activity_type: String,
        outcome: Result<Payload, WorkflowError>,
    },
}

impl MarkerData {
    pub fn marker_name(&self) -> &'static str {
        match self {
            MarkerData::SideEffect { .. } => "SideEffect",
            MarkerData::Version { .. } => "Version",
            MarkerData::LocalActivity { .. } => "LocalActivity",
        }
    }
}

/// A request for the collaborator, emitted in decision order.
///
/// `id` is the correlation id that later completion events refer to. Ids come
/// from one per-instance counter in emission order, so a replay of the same
/// history assigns the same ids.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Command {
    ScheduleActivity {
        id: u64,
        activity_type: String,
        input: Payload,
        options: ActivityOptions,
    },
    ScheduleLocalActivity {
        id: u64,
        activity_type: String,
        input: Payload,
        options: LocalActivityOptions,
    },
    RequestCancelActivity {
        id: u64,
    },
    StartTimer {
        id: u64,
        duration: Duration,
    },
    CancelTimer {
        id: u64,
    },
    StartChildWorkflow {
        id: u64,
        workflow_type: String,
        workflow_id: String,
        input: Payload,
        options: ChildWorkflowOptions,
    },
    RequestCancelExternalWorkflow {
        id: u64,
        workflow_id: String,
        run_id: Option<String>,
        child_workflow_only: bool,
    },
    SignalExternalWorkflow {
        id: u64,
        workflow_id: String,
        run_id: Option<String>,
        signal_name: String,
        input: Payload,
        child_workflow_only: bool,
    },
    RecordMarker {
        marker: MarkerData,
    },
    CompleteWorkflow {
        result: Payload,
    },
    FailWorkflow {
        failure: WorkflowError,
    },
    CancelWorkflow {
        details: Option<Payload>,
    },
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::ScheduleActivity { .. } => "ScheduleActivity",
            Command::ScheduleLocalActivity { .. } => "ScheduleLocalActivity",
            Command::RequestCancelActivity { .. } => "RequestCancelActivity",
            Command::StartTimer { .. } => "StartTimer",
            Command::CancelTimer { .. } => "CancelTimer",
            Command::StartChildWorkflow { .. } => "StartChildWorkflow",
            Command::RequestCancelExternalWorkflow { .. } => "RequestCancelExternalWorkflow",
            Command::SignalExternalWorkflow { .. } => "SignalExternalWorkflow",
            Command::RecordMarker { .. } => "RecordMarker",
            Command::CompleteWorkflow { .. } => "CompleteWorkflow",
            Command::FailWorkflow { .. } => "FailWorkflow",
            Command::CancelWorkflow { .. } => "CancelWorkflow",
        }
    }

    /// True for the commands that close the workflow.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Command::CompleteWorkflow { .. } | Command::FailWorkflow { .. } | Command::CancelWorkflow { .. }
        )
    }
}

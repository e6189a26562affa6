//! Error types.
//!
//! Two families matter to callers:
//!
//! * [`WorkflowError`] is the failure value carried by futures, activities and
//!   workflow results. It is serializable because it travels through history.
//! * [`DecisionError`] aborts the current decision cycle. The instance that
//!   returned it is poisoned and the caller redrives the decision from history.
//!
//! The remaining types are scoped to a single operation.

use crate::codec::Payload;
use crate::commands::Command;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Which timeout fired for an activity or child workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TimeoutType {
    ScheduleToStart,
    StartToClose,
    ScheduleToClose,
    Heartbeat,
}

impl fmt::Display for TimeoutType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TimeoutType::ScheduleToStart => "ScheduleToStart",
            TimeoutType::StartToClose => "StartToClose",
            TimeoutType::ScheduleToClose => "ScheduleToClose",
            TimeoutType::Heartbeat => "Heartbeat",
        };
        f.write_str(s)
    }
}

/// Failure of a workflow-level operation or of the workflow itself.
///
/// # Variants
///
/// - `Application`: returned by user code (workflow, activity, child).
/// - `Timeout`: an activity or child exceeded one of its timeouts.
/// - `Canceled`: the operation or its context was cancelled.
/// - `Panic`: user code panicked and the panic was captured.
/// - `Generic`: anything else: invalid options, codec failures, misuse.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
pub enum WorkflowError {
    #[error("{error_type}: {message}")]
    Application {
        error_type: String,
        message: String,
        details: Option<Payload>,
        non_retryable: bool,
    },
    #[error("timeout ({timeout_type})")]
    Timeout {
        timeout_type: TimeoutType,
        details: Option<Payload>,
    },
    #[error("canceled")]
    Canceled { details: Option<Payload> },
    #[error("panic: {message}")]
    Panic { message: String },
    #[error("{message}")]
    Generic { message: String },
}

impl WorkflowError {
    pub fn application(error_type: impl Into<String>, message: impl Into<String>) -> Self {
        WorkflowError::Application {
            error_type: error_type.into(),
            message: message.into(),
            details: None,
            non_retryable: false,
        }
    }

    pub fn non_retryable(error_type: impl Into<String>, message: impl Into<String>) -> Self {
        WorkflowError::Application {
            error_type: error_type.into(),
            message: message.into(),
            details: None,
            non_retryable: true,
        }
    }

    pub fn canceled() -> Self {
        WorkflowError::Canceled { details: None }
    }

    pub fn timeout(timeout_type: TimeoutType) -> Self {
        WorkflowError::Timeout {
            timeout_type,
            details: None,
        }
    }

    pub fn generic(message: impl Into<String>) -> Self {
        WorkflowError::Generic {
            message: message.into(),
        }
    }

    pub fn is_canceled(&self) -> bool {
        matches!(self, WorkflowError::Canceled { .. })
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, WorkflowError::Timeout { .. })
    }

    /// Whether a retry policy may retry the failed attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            WorkflowError::Application { non_retryable, .. } => !non_retryable,
            WorkflowError::Timeout { .. } | WorkflowError::Panic { .. } | WorkflowError::Generic { .. } => true,
            WorkflowError::Canceled { .. } => false,
        }
    }
}

impl From<CodecError> for WorkflowError {
    fn from(e: CodecError) -> Self {
        WorkflowError::generic(e.to_string())
    }
}

/// Failure that aborts a decision cycle.
///
/// Every variant is retryable from the caller's point of view: the decision is
/// abandoned, no commands are sent, and the caller may replay the history into
/// a fresh instance (possibly running fixed workflow code).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecisionError {
    #[error(
        "version {recorded} for change '{change_id}' is outside the supported range [{min_supported}, {max_supported}]"
    )]
    VersionIncompatible {
        change_id: String,
        recorded: i32,
        min_supported: i32,
        max_supported: i32,
    },
    #[error("nondeterministic workflow: {message}")]
    NonDeterministic { message: String },
    #[error("panic in logical thread '{thread}': {message}")]
    Panic { thread: String, message: String },
    #[error("workflow type '{workflow_type}' is not registered")]
    NotRegistered { workflow_type: String },
    #[error("first event of a new instance must be WorkflowExecutionStarted, got {found}")]
    MissingStartEvent { found: String },
    #[error("scheduler exceeded {rounds} rounds without blocking")]
    SchedulerStalled { rounds: usize },
    #[error("codec failure during decision: {0}")]
    Codec(#[from] CodecError),
}

impl DecisionError {
    pub fn nondeterministic(message: impl Into<String>) -> Self {
        DecisionError::NonDeterministic {
            message: message.into(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        true
    }
}

/// Failure answering a query.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueryError {
    #[error("unknown query type '{query_type}', known types: [{}]", .known.join(", "))]
    UnknownQueryType { query_type: String, known: Vec<String> },
    #[error("query handler '{query_type}' failed: {error}")]
    HandlerFailed { query_type: String, error: WorkflowError },
    #[error("query handler '{query_type}' panicked: {message}")]
    HandlerPanicked { query_type: String, message: String },
    #[error("query handler '{query_type}' attempted '{operation}', which is not allowed while answering a query")]
    IllegalOperation { query_type: String, operation: String },
    #[error("query type '{0}' is reserved")]
    ReservedQueryType(String),
    #[error("query handlers cannot be registered from inside a query handler")]
    RegistrationInQuery,
    #[error("query arguments or result could not be converted: {0}")]
    Codec(#[from] CodecError),
}

/// Registration problem reported by `RegistryBuilder::build`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("{kind} name must not be empty")]
    EmptyName { kind: &'static str },
    #[error("duplicate {kind} registration: {name}")]
    Duplicate { kind: &'static str, name: String },
    #[error("{kind} name '{name}' uses the reserved '__' prefix")]
    ReservedName { kind: &'static str, name: String },
    #[error("registration failed: {}", .0.iter().map(ToString::to_string).collect::<Vec<_>>().join("; "))]
    Multiple(Vec<RegistryError>),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
pub enum CodecError {
    #[error("encode failed: {0}")]
    Encode(String),
    #[error("decode failed: {0}")]
    Decode(String),
}

/// Misuse of a [`Resolver`](crate::Resolver).
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum FutureError {
    #[error("future is already resolved")]
    AlreadyResolved,
}

/// Non-blocking channel send failure; the value is handed back.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TrySendError<T> {
    #[error("channel is full")]
    Full(T),
    #[error("channel is closed")]
    Closed(T),
}

impl<T> TrySendError<T> {
    pub fn into_inner(self) -> T {
        match self {
            TrySendError::Full(v) | TrySendError::Closed(v) => v,
        }
    }
}

/// Replay of a recorded history diverged from the recorded commands.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ReplayError {
    #[error("decision {decision} failed during replay: {source}")]
    Decision {
        decision: usize,
        #[source]
        source: DecisionError,
    },
    #[error("decision {decision} produced different commands; expected {expected:?}, got {actual:?}")]
    CommandMismatch {
        decision: usize,
        expected: Vec<Command>,
        actual: Vec<Command>,
    },
    #[error("recorded history is empty")]
    EmptyHistory,
}

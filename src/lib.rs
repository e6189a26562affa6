//! Deterministic workflow execution and replay.
//!
//! A workflow is ordinary async Rust that talks to the outside world only
//! through a [`WorkflowContext`]. A [`WorkflowInstance`] runs it on a
//! cooperative scheduler of logical threads: each decision applies a batch of
//! [`HistoryEvent`]s, runs every thread until it blocks, and returns the
//! [`Command`]s the workflow issued. Feeding the same history to a fresh
//! instance yields the same commands, which is what makes replay safe.
//!
//! ```ignore
//! use duroflow::{Registry, WorkflowContext, WorkflowError, ActivityOptions};
//! use std::time::Duration;
//!
//! let registry = Registry::builder()
//!     .register_workflow_typed("greet", |ctx: WorkflowContext, name: String| async move {
//!         let ctx = ctx.with_activity_options(ActivityOptions::with_start_to_close(Duration::from_secs(5)));
//!         let greeting: String = ctx.execute_activity("format_greeting", &name).await?;
//!         ctx.sleep(Duration::from_secs(60)).await?;
//!         Ok::<_, WorkflowError>(greeting)
//!     })
//!     .build()?;
//! ```
//!
//! Things workflow code must not do: read the wall clock, use randomness, or
//! perform I/O directly. Use [`WorkflowContext::now`],
//! [`WorkflowContext::side_effect`] and activities instead.

pub mod cancel;
pub mod channel;
pub mod codec;
pub mod commands;
pub mod context;
pub mod errors;
pub mod future;
pub mod history;
pub mod logging;
pub(crate) mod markers;
pub mod options;
pub(crate) mod query;
pub mod runtime;

pub use cancel::CancelHandle;
pub use channel::{Channel, ReceiveFuture, SendFuture};
pub use codec::{DataConverter, JsonDataConverter, Payload};
pub use commands::{Command, DEFAULT_VERSION, MarkerData, Version};
pub use context::{ChildWorkflowFuture, WorkflowContext, WorkflowInfo};
pub use errors::{
    CodecError, DecisionError, FutureError, QueryError, RegistryError, ReplayError, TimeoutType, TrySendError,
    WorkflowError,
};
pub use future::{Get, Resolver, Select, Selectable, WorkflowFuture, new_future};
pub use history::{EventKind, HistoryEvent, WorkflowExecution};
pub use logging::{LogConfig, LogFormat, init_logging};
pub use options::{
    ActivityOptions, ChildWorkflowOptions, ChildWorkflowPolicy, InstanceOptions, LocalActivityOptions, PanicPolicy,
    RetryPolicy,
};
pub use runtime::{
    ActivityContext, ActivityHandler, ActivityInfo, DecisionOutcome, DecisionRecord, FnActivity, FnWorkflow,
    RecordedHistory, Registry, RegistryBuilder, TestEnvError, TestRun, TestWorkflowEnvironment, ThreadId,
    ThreadStatus, ThreadSummary, WorkflowHandler, WorkflowInstance, WorkflowReplayer,
};

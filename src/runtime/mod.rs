//! Execution machinery: handler traits, the registry, the per-instance
//! dispatcher, and the tools that drive instances (replayer, test environment).

use crate::WorkflowContext;
use crate::codec::{DataConverter, Payload};
use crate::errors::WorkflowError;
use crate::history::WorkflowExecution;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

pub mod dispatcher;
pub mod instance;
pub mod limits;
pub mod registry;
pub mod replayer;
pub(crate) mod state;
pub mod test_env;

pub use dispatcher::{ThreadId, ThreadStatus, ThreadSummary};
pub use instance::{DecisionOutcome, WorkflowInstance};
pub use registry::{Registry, RegistryBuilder};
pub use replayer::{DecisionRecord, RecordedHistory, WorkflowReplayer};
pub use test_env::{TestEnvError, TestRun, TestWorkflowEnvironment};

/// Lock a mutex, recovering the data if a panicking thread poisoned it.
///
/// Panics in workflow code are captured per poll; the state they leave behind
/// is still consistent because mutations happen under short critical sections.
pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Trait implemented by workflow handlers that can be invoked by an instance.
#[async_trait]
pub trait WorkflowHandler: Send + Sync {
    async fn invoke(&self, ctx: WorkflowContext, input: Payload) -> Result<Payload, WorkflowError>;
}

/// Function wrapper that implements `WorkflowHandler`.
pub struct FnWorkflow<F, Fut>(pub F)
where
    F: Fn(WorkflowContext, Payload) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<Payload, WorkflowError>> + Send + 'static;

#[async_trait]
impl<F, Fut> WorkflowHandler for FnWorkflow<F, Fut>
where
    F: Fn(WorkflowContext, Payload) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<Payload, WorkflowError>> + Send + 'static,
{
    async fn invoke(&self, ctx: WorkflowContext, input: Payload) -> Result<Payload, WorkflowError> {
        (self.0)(ctx, input).await
    }
}

/// Trait implemented by activity handlers.
#[async_trait]
pub trait ActivityHandler: Send + Sync {
    async fn invoke(&self, ctx: ActivityContext, input: Payload) -> Result<Payload, WorkflowError>;
}

pub struct FnActivity<F, Fut>(pub F)
where
    F: Fn(ActivityContext, Payload) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<Payload, WorkflowError>> + Send + 'static;

#[async_trait]
impl<F, Fut> ActivityHandler for FnActivity<F, Fut>
where
    F: Fn(ActivityContext, Payload) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<Payload, WorkflowError>> + Send + 'static,
{
    async fn invoke(&self, ctx: ActivityContext, input: Payload) -> Result<Payload, WorkflowError> {
        (self.0)(ctx, input).await
    }
}

/// Describes the activity attempt being executed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivityInfo {
    pub activity_type: String,
    /// Correlation id of the scheduling command.
    pub activity_id: u64,
    pub workflow_execution: WorkflowExecution,
    pub task_list: String,
    /// 1-based attempt number.
    pub attempt: u32,
    pub local: bool,
}

/// Context handed to activity implementations.
#[derive(Clone)]
pub struct ActivityContext {
    info: ActivityInfo,
    converter: Arc<dyn DataConverter>,
}

impl ActivityContext {
    pub fn new(info: ActivityInfo, converter: Arc<dyn DataConverter>) -> Self {
        Self { info, converter }
    }

    pub fn info(&self) -> &ActivityInfo {
        &self.info
    }

    pub fn data_converter(&self) -> &Arc<dyn DataConverter> {
        &self.converter
    }

    pub fn trace_info(&self, message: impl Into<String>) {
        let msg: String = message.into();
        tracing::info!(
            target: "duroflow::activity",
            workflow_id = %self.info.workflow_execution.workflow_id,
            run_id = %self.info.workflow_execution.run_id,
            activity_type = %self.info.activity_type,
            activity_id = self.info.activity_id,
            attempt = self.info.attempt,
            "{}",
            msg
        );
    }
}

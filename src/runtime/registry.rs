//! Registry of workflow and activity handlers.
//!
//! Both kinds of handler live in the same generic [`HandlerTable`]. The table
//! is immutable once built; registration problems are collected by the
//! builder and reported together by [`RegistryBuilder::build`].

use super::{ActivityContext, ActivityHandler, FnActivity, FnWorkflow, WorkflowHandler};
use crate::WorkflowContext;
use crate::codec::{DataConverter, JsonDataConverter, Payload, decode, encode};
use crate::errors::{RegistryError, WorkflowError};
use crate::runtime::dispatcher::panic_message;
use crate::runtime::limits::RESERVED_PREFIX;
use futures::FutureExt;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::BTreeMap;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

/// Name-keyed handler map shared by workflows and activities.
pub struct HandlerTable<H: ?Sized> {
    inner: Arc<BTreeMap<String, Arc<H>>>,
}

// Manual Clone impl since H: ?Sized doesn't auto-derive Clone
impl<H: ?Sized> Clone for HandlerTable<H> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<H: ?Sized> HandlerTable<H> {
    fn new(map: BTreeMap<String, Arc<H>>) -> Self {
        Self { inner: Arc::new(map) }
    }

    pub fn get(&self, name: &str) -> Option<Arc<H>> {
        self.inner.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.inner.keys().cloned().collect()
    }

    pub fn has(&self, name: &str) -> bool {
        self.inner.contains_key(name)
    }

    pub fn count(&self) -> usize {
        self.inner.len()
    }
}

/// Workflow and activity implementations known to a worker.
#[derive(Clone)]
pub struct Registry {
    workflows: HandlerTable<dyn WorkflowHandler>,
    activities: HandlerTable<dyn ActivityHandler>,
    converter: Arc<dyn DataConverter>,
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("workflows", &self.workflows.names())
            .field("activities", &self.activities.names())
            .field("converter", &self.converter)
            .finish()
    }
}

impl Registry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder {
            workflows: BTreeMap::new(),
            activities: BTreeMap::new(),
            converter: Arc::new(JsonDataConverter),
            errors: Vec::new(),
        }
    }

    pub fn workflow(&self, name: &str) -> Option<Arc<dyn WorkflowHandler>> {
        let found = self.workflows.get(name);
        if found.is_none() {
            self.log_registry_miss("workflow", name, &self.workflows.names());
        }
        found
    }

    pub fn activity(&self, name: &str) -> Option<Arc<dyn ActivityHandler>> {
        let found = self.activities.get(name);
        if found.is_none() {
            self.log_registry_miss("activity", name, &self.activities.names());
        }
        found
    }

    pub fn workflow_names(&self) -> Vec<String> {
        self.workflows.names()
    }

    pub fn activity_names(&self) -> Vec<String> {
        self.activities.names()
    }

    pub fn has_workflow(&self, name: &str) -> bool {
        self.workflows.has(name)
    }

    pub fn has_activity(&self, name: &str) -> bool {
        self.activities.has(name)
    }

    pub fn data_converter(&self) -> &Arc<dyn DataConverter> {
        &self.converter
    }

    /// Run one attempt of an activity. Unknown types and panics become
    /// activity failures.
    pub async fn execute_activity(&self, ctx: ActivityContext, name: &str, input: Payload) -> Result<Payload, WorkflowError> {
        let Some(handler) = self.activity(name) else {
            return Err(WorkflowError::generic(format!(
                "unable to find activityType={name}. Supported types: [{}]",
                self.activity_names().join(", ")
            )));
        };
        match AssertUnwindSafe(handler.invoke(ctx, input)).catch_unwind().await {
            Ok(outcome) => outcome,
            Err(panic) => Err(WorkflowError::Panic {
                message: panic_message(panic.as_ref()),
            }),
        }
    }

    fn log_registry_miss(&self, kind: &str, name: &str, registered: &[String]) {
        tracing::debug!(
            target: "duroflow::runtime::registry",
            kind,
            requested_name = %name,
            registered_count = registered.len(),
            registered_names = ?registered,
            "Registry lookup miss"
        );
    }
}

/// Collects registrations; see [`Registry::builder`].
pub struct RegistryBuilder {
    workflows: BTreeMap<String, Arc<dyn WorkflowHandler>>,
    activities: BTreeMap<String, Arc<dyn ActivityHandler>>,
    converter: Arc<dyn DataConverter>,
    errors: Vec<RegistryError>,
}

impl RegistryBuilder {
    /// Build the registry.
    ///
    /// # Errors
    ///
    /// Returns every registration error seen: a single one as-is, several as
    /// [`RegistryError::Multiple`].
    pub fn build(mut self) -> Result<Registry, RegistryError> {
        match self.errors.len() {
            0 => Ok(Registry {
                workflows: HandlerTable::new(self.workflows),
                activities: HandlerTable::new(self.activities),
                converter: self.converter,
            }),
            1 => Err(self.errors.remove(0)),
            _ => Err(RegistryError::Multiple(self.errors)),
        }
    }

    /// Replace the default JSON converter.
    pub fn data_converter(mut self, converter: Arc<dyn DataConverter>) -> Self {
        self.converter = converter;
        self
    }

    /// Check the name and return false (recording an error) if it can't be used.
    fn check_name(&mut self, kind: &'static str, name: &str, taken: bool) -> bool {
        let error = if name.is_empty() {
            RegistryError::EmptyName { kind }
        } else if name.starts_with(RESERVED_PREFIX) {
            RegistryError::ReservedName {
                kind,
                name: name.to_string(),
            }
        } else if taken {
            RegistryError::Duplicate {
                kind,
                name: name.to_string(),
            }
        } else {
            return true;
        };
        self.errors.push(error);
        false
    }

    pub fn register_workflow_handler(mut self, name: impl Into<String>, handler: Arc<dyn WorkflowHandler>) -> Self {
        let name = name.into();
        let taken = self.workflows.contains_key(&name);
        if self.check_name("workflow", &name, taken) {
            self.workflows.insert(name, handler);
        }
        self
    }

    pub fn register_workflow<F, Fut>(self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(WorkflowContext, Payload) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<Payload, WorkflowError>> + Send + 'static,
    {
        self.register_workflow_handler(name, Arc::new(FnWorkflow(f)))
    }

    /// Register a workflow whose input and output go through the data converter.
    pub fn register_workflow_typed<In, Out, F, Fut>(self, name: impl Into<String>, f: F) -> Self
    where
        In: DeserializeOwned + Send + 'static,
        Out: Serialize + Send + 'static,
        F: Fn(WorkflowContext, In) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<Out, WorkflowError>> + Send + 'static,
    {
        let f = Arc::new(f);
        let wrapper = move |ctx: WorkflowContext, input: Payload| {
            let f = f.clone();
            async move {
                let converter = ctx.data_converter().clone();
                let input: In = decode(converter.as_ref(), &input)?;
                let out: Out = f(ctx, input).await?;
                Ok(encode(converter.as_ref(), &out)?)
            }
        };
        self.register_workflow(name, wrapper)
    }

    pub fn register_activity_handler(mut self, name: impl Into<String>, handler: Arc<dyn ActivityHandler>) -> Self {
        let name = name.into();
        let taken = self.activities.contains_key(&name);
        if self.check_name("activity", &name, taken) {
            self.activities.insert(name, handler);
        }
        self
    }

    pub fn register_activity<F, Fut>(self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(ActivityContext, Payload) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<Payload, WorkflowError>> + Send + 'static,
    {
        self.register_activity_handler(name, Arc::new(FnActivity(f)))
    }

    pub fn register_activity_typed<In, Out, F, Fut>(self, name: impl Into<String>, f: F) -> Self
    where
        In: DeserializeOwned + Send + 'static,
        Out: Serialize + Send + 'static,
        F: Fn(ActivityContext, In) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<Out, WorkflowError>> + Send + 'static,
    {
        let f = Arc::new(f);
        let wrapper = move |ctx: ActivityContext, input: Payload| {
            let f = f.clone();
            async move {
                let converter = ctx.data_converter().clone();
                let input: In = decode(converter.as_ref(), &input)?;
                let out: Out = f(ctx, input).await?;
                Ok(encode(converter.as_ref(), &out)?)
            }
        };
        self.register_activity(name, wrapper)
    }
}

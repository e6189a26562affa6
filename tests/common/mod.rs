#![allow(dead_code)]

pub mod tracing_capture;

use chrono::{DateTime, Utc};
use duroflow::{
    ActivityOptions, DecisionError, DecisionOutcome, EventKind, HistoryEvent, InstanceOptions, JsonDataConverter,
    Payload, Registry, WorkflowExecution, WorkflowInstance,
};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::time::Duration;

pub fn payload<T: Serialize + ?Sized>(value: &T) -> Payload {
    duroflow::codec::encode(&JsonDataConverter, value).unwrap()
}

pub fn decode<T: DeserializeOwned>(payload: &Payload) -> T {
    duroflow::codec::decode(&JsonDataConverter, payload).unwrap()
}

pub fn at(seconds: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(1_600_000_000 + seconds, 0).unwrap()
}

pub fn activity_options() -> ActivityOptions {
    ActivityOptions::with_start_to_close(Duration::from_secs(10))
}

pub fn started<T: Serialize + ?Sized>(workflow_type: &str, input: &T) -> EventKind {
    EventKind::WorkflowExecutionStarted {
        workflow_type: workflow_type.to_string(),
        input: payload(input),
        task_list: "tl".to_string(),
        execution_timeout: None,
        task_timeout: Some(Duration::from_secs(10)),
    }
}

/// Drives one instance by hand: numbers events, advances a fake clock one
/// second per decision and keeps every delivered batch for later replay.
pub struct Harness {
    pub instance: WorkflowInstance,
    pub batches: Vec<Vec<HistoryEvent>>,
    registry: Arc<Registry>,
    next_event_id: u64,
    clock: i64,
}

impl Harness {
    pub fn new(registry: Registry) -> Self {
        Self::with_options(registry, InstanceOptions::default())
    }

    pub fn with_options(registry: Registry, options: InstanceOptions) -> Self {
        let registry = Arc::new(registry);
        Self {
            instance: WorkflowInstance::new(registry.clone(), execution(), options),
            batches: Vec::new(),
            registry,
            next_event_id: 1,
            clock: 0,
        }
    }

    pub fn registry(&self) -> Arc<Registry> {
        self.registry.clone()
    }

    pub fn events(&mut self, kinds: Vec<EventKind>) -> Vec<HistoryEvent> {
        self.clock += 1;
        kinds
            .into_iter()
            .map(|kind| {
                let event = HistoryEvent::new(self.next_event_id, at(self.clock), kind);
                self.next_event_id += 1;
                event
            })
            .collect()
    }

    pub fn try_deliver(&mut self, kinds: Vec<EventKind>) -> Result<DecisionOutcome, DecisionError> {
        let events = self.events(kinds);
        self.batches.push(events.clone());
        self.instance.process_events(events)
    }

    pub fn deliver(&mut self, kinds: Vec<EventKind>) -> DecisionOutcome {
        self.try_deliver(kinds).unwrap()
    }

    pub fn start<T: Serialize + ?Sized>(&mut self, workflow_type: &str, input: &T) -> DecisionOutcome {
        self.deliver(vec![started(workflow_type, input)])
    }
}

pub fn execution() -> WorkflowExecution {
    WorkflowExecution::new("wf-1", "run-1")
}

/// A fresh instance in replay mode over the same registry.
pub fn replaying_instance(registry: Arc<Registry>) -> WorkflowInstance {
    let mut instance = WorkflowInstance::new(registry, execution(), InstanceOptions::default());
    instance.set_replaying(true);
    instance
}

//! Re-drive a recorded history against the current workflow code.
//!
//! A [`RecordedHistory`] keeps, per decision, the events that were delivered
//! and the commands that came back. Replaying it into a fresh instance with
//! `set_replaying(true)` must reproduce exactly the same commands; anything
//! else means the workflow code changed in a non-deterministic way.

use crate::commands::{Command, MarkerData};
use crate::errors::ReplayError;
use crate::history::{EventKind, HistoryEvent, WorkflowExecution};
use crate::options::InstanceOptions;
use crate::runtime::instance::WorkflowInstance;
use crate::runtime::registry::Registry;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// One decision as it happened.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionRecord {
    /// Events delivered to the decision, transient ones included.
    pub events: Vec<HistoryEvent>,
    /// `MarkerRecorded` events persisted for the decision's `RecordMarker` commands.
    pub markers: Vec<HistoryEvent>,
    pub commands: Vec<Command>,
}

impl DecisionRecord {
    /// Marker events for `commands`, numbered from `first_event_id`.
    pub fn marker_events(commands: &[Command], first_event_id: u64, timestamp: chrono::DateTime<chrono::Utc>) -> Vec<HistoryEvent> {
        commands
            .iter()
            .filter_map(|c| match c {
                Command::RecordMarker { marker } => Some(marker.clone()),
                _ => None,
            })
            .zip(first_event_id..)
            .map(|(marker, event_id): (MarkerData, u64)| {
                HistoryEvent::new(event_id, timestamp, EventKind::MarkerRecorded { marker })
            })
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordedHistory {
    pub execution: WorkflowExecution,
    pub decisions: Vec<DecisionRecord>,
}

impl RecordedHistory {
    pub fn new(execution: WorkflowExecution) -> Self {
        Self {
            execution,
            decisions: Vec::new(),
        }
    }

    /// The batch a replay of decision `index` sees: persisted events plus the
    /// markers the decision recorded, ordered by event id.
    pub fn replay_batch(&self, index: usize) -> Vec<HistoryEvent> {
        let Some(record) = self.decisions.get(index) else {
            return Vec::new();
        };
        let mut batch: Vec<HistoryEvent> = record
            .events
            .iter()
            .filter(|e| !e.kind.is_transient())
            .cloned()
            .chain(record.markers.iter().cloned())
            .collect();
        batch.sort_by_key(|e| e.event_id);
        batch
    }

    /// Every persisted event, in order.
    pub fn events(&self) -> Vec<HistoryEvent> {
        (0..self.decisions.len()).flat_map(|i| self.replay_batch(i)).collect()
    }
}

pub struct WorkflowReplayer {
    registry: Arc<Registry>,
    options: InstanceOptions,
}

impl WorkflowReplayer {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self {
            registry,
            options: InstanceOptions::default(),
        }
    }

    pub fn with_options(mut self, options: InstanceOptions) -> Self {
        self.options = options;
        self
    }

    /// Replay `history` decision by decision and compare commands.
    ///
    /// # Errors
    ///
    /// [`ReplayError::CommandMismatch`] at the first decision whose commands
    /// differ, [`ReplayError::Decision`] if a decision fails outright.
    pub fn replay(&self, history: &RecordedHistory) -> Result<(), ReplayError> {
        if history.decisions.is_empty() {
            return Err(ReplayError::EmptyHistory);
        }
        let mut instance =
            WorkflowInstance::new(self.registry.clone(), history.execution.clone(), self.options.clone());
        instance.set_replaying(true);
        for (decision, record) in history.decisions.iter().enumerate() {
            let outcome = instance
                .process_events(history.replay_batch(decision))
                .map_err(|source| ReplayError::Decision { decision, source })?;
            if outcome.commands != record.commands {
                tracing::warn!(
                    target: "duroflow::runtime::replayer",
                    workflow_id = %history.execution.workflow_id,
                    decision,
                    "replay produced different commands"
                );
                return Err(ReplayError::CommandMismatch {
                    decision,
                    expected: record.commands.clone(),
                    actual: outcome.commands,
                });
            }
        }
        tracing::debug!(
            target: "duroflow::runtime::replayer",
            workflow_id = %history.execution.workflow_id,
            decisions = history.decisions.len(),
            "replay matched recorded commands"
        );
        Ok(())
    }
}

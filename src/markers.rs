//! Bookkeeping for side effects and change versions.
//!
//! Markers are the only way non-deterministic values enter a workflow. On a
//! live run the value is computed and recorded; on replay the recorded marker
//! is loaded from history before any thread runs, and the same value is
//! returned without recomputing it.

use crate::codec::Payload;
use crate::commands::{DEFAULT_VERSION, MarkerData, Version};
use crate::errors::DecisionError;
use std::collections::BTreeMap;

/// Next step for a `side_effect` call.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum SideEffectStep {
    /// History already holds the value.
    Recorded { id: u64, value: Payload },
    /// Live run: compute, then call `finish_side_effect`.
    Execute { id: u64 },
    /// Replay without a recorded value: the workflow code diverged.
    Missing { id: u64 },
}

/// Outcome of a `get_version` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct VersionDecision {
    pub version: Version,
    /// Emit a `RecordMarker` for this call.
    pub record: bool,
}

#[derive(Debug, Default)]
pub(crate) struct MarkerRecorder {
    next_side_effect_id: u64,
    side_effects: BTreeMap<u64, Payload>,
    recorded_versions: BTreeMap<String, Version>,
    versions_in_run: BTreeMap<String, Version>,
}

impl MarkerRecorder {
    /// Load a marker found in history. Local activity markers are routed
    /// elsewhere and ignored here.
    pub fn load(&mut self, marker: &MarkerData) {
        match marker {
            MarkerData::SideEffect { id, value } => {
                self.side_effects.insert(*id, value.clone());
            }
            MarkerData::Version { change_id, version } => {
                self.recorded_versions.insert(change_id.clone(), *version);
            }
            MarkerData::LocalActivity { .. } => {}
        }
    }

    pub fn begin_side_effect(&mut self, replaying: bool) -> SideEffectStep {
        self.next_side_effect_id += 1;
        let id = self.next_side_effect_id;
        match self.side_effects.get(&id) {
            Some(value) => SideEffectStep::Recorded {
                id,
                value: value.clone(),
            },
            None if replaying => SideEffectStep::Missing { id },
            None => SideEffectStep::Execute { id },
        }
    }

    pub fn finish_side_effect(&mut self, id: u64, value: Payload) {
        self.side_effects.insert(id, value);
    }

    pub fn get_version(
        &mut self,
        change_id: &str,
        min_supported: Version,
        max_supported: Version,
        replaying: bool,
    ) -> Result<VersionDecision, DecisionError> {
        if let Some(version) = self.versions_in_run.get(change_id).copied() {
            validate_version(change_id, version, min_supported, max_supported)?;
            return Ok(VersionDecision { version, record: false });
        }
        let version = match self.recorded_versions.get(change_id) {
            Some(v) => *v,
            None if replaying => DEFAULT_VERSION,
            None => max_supported,
        };
        validate_version(change_id, version, min_supported, max_supported)?;
        self.versions_in_run.insert(change_id.to_string(), version);
        Ok(VersionDecision {
            version,
            record: version != DEFAULT_VERSION,
        })
    }
}

fn validate_version(
    change_id: &str,
    version: Version,
    min_supported: Version,
    max_supported: Version,
) -> Result<(), DecisionError> {
    if version < min_supported || version > max_supported {
        return Err(DecisionError::VersionIncompatible {
            change_id: change_id.to_string(),
            recorded: version.0,
            min_supported: min_supported.0,
            max_supported: max_supported.0,
        });
    }
    Ok(())
}

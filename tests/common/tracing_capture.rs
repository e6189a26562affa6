//! Collects `tracing` events into memory so tests can assert on what a
//! workflow logged during a decision.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use tracing::field::{Field, Visit};
use tracing::{Dispatch, Event, Level, Subscriber, dispatcher};
use tracing_subscriber::layer::{Context, Layer};
use tracing_subscriber::prelude::*;

const WORKFLOW_TARGET: &str = "duroflow::workflow";

/// One captured log line.
#[derive(Debug, Clone)]
pub struct LogLine {
    pub level: Level,
    pub target: String,
    pub message: String,
    pub fields: BTreeMap<String, String>,
}

impl LogLine {
    pub fn field(&self, key: &str) -> Option<&str> {
        self.fields.get(key).map(String::as_str)
    }
}

#[derive(Default)]
struct Recorder {
    fields: BTreeMap<String, String>,
}

impl Visit for Recorder {
    fn record_str(&mut self, field: &Field, value: &str) {
        self.fields.insert(field.name().to_string(), value.to_string());
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.fields.insert(field.name().to_string(), value.to_string());
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.fields.insert(field.name().to_string(), value.to_string());
    }

    // `%value` fields arrive here already rendered through Display.
    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        let rendered = format!("{value:?}");
        self.fields
            .insert(field.name().to_string(), rendered.trim_matches('"').to_string());
    }
}

/// Shared sink for captured lines; clones observe the same buffer.
#[derive(Clone, Default)]
pub struct LogCapture {
    lines: Arc<Mutex<Vec<LogLine>>>,
}

impl<S: Subscriber> Layer<S> for LogCapture {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let mut recorder = Recorder::default();
        event.record(&mut recorder);
        let meta = event.metadata();
        let message = recorder.fields.remove("message").unwrap_or_default();
        self.lines.lock().unwrap().push(LogLine {
            level: *meta.level(),
            target: meta.target().to_string(),
            message,
            fields: recorder.fields,
        });
    }
}

impl LogCapture {
    /// Capture every event on the current thread until the guard drops.
    pub fn install() -> (Self, dispatcher::DefaultGuard) {
        let capture = Self::default();
        let subscriber = tracing_subscriber::registry().with(capture.clone());
        let guard = dispatcher::set_default(&Dispatch::new(subscriber));
        (capture, guard)
    }

    /// Lines emitted through the `workflow_*!` macros.
    pub fn workflow_lines(&self) -> Vec<LogLine> {
        self.lines
            .lock()
            .unwrap()
            .iter()
            .filter(|line| line.target == WORKFLOW_TARGET)
            .cloned()
            .collect()
    }
}

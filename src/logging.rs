//! Replay-aware logging for workflow code, plus subscriber setup.
//!
//! The `workflow_*!` macros behave like their `tracing` counterparts but stay
//! silent while the instance replays history (unless logging in replay was
//! enabled), so a workflow logs each line once no matter how often it is
//! replayed. Every event carries `workflow_id`, `run_id` and `decision`.
//!
//! ```ignore
//! workflow_info!(ctx, order_id = %order.id, "charging card");
//! ```

use serde::{Deserialize, Serialize};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[macro_export]
macro_rules! workflow_info {
    ($ctx:expr, $($arg:tt)+) => {{
        if $ctx.is_logging_enabled() {
            ::tracing::info!(
                target: "duroflow::workflow",
                workflow_id = %$ctx.info().execution.workflow_id,
                run_id = %$ctx.info().execution.run_id,
                decision = $ctx.decision_index(),
                $($arg)+
            );
        }
    }};
}

#[macro_export]
macro_rules! workflow_debug {
    ($ctx:expr, $($arg:tt)+) => {{
        if $ctx.is_logging_enabled() {
            ::tracing::debug!(
                target: "duroflow::workflow",
                workflow_id = %$ctx.info().execution.workflow_id,
                run_id = %$ctx.info().execution.run_id,
                decision = $ctx.decision_index(),
                $($arg)+
            );
        }
    }};
}

#[macro_export]
macro_rules! workflow_warn {
    ($ctx:expr, $($arg:tt)+) => {{
        if $ctx.is_logging_enabled() {
            ::tracing::warn!(
                target: "duroflow::workflow",
                workflow_id = %$ctx.info().execution.workflow_id,
                run_id = %$ctx.info().execution.run_id,
                decision = $ctx.decision_index(),
                $($arg)+
            );
        }
    }};
}

#[macro_export]
macro_rules! workflow_error {
    ($ctx:expr, $($arg:tt)+) => {{
        if $ctx.is_logging_enabled() {
            ::tracing::error!(
                target: "duroflow::workflow",
                workflow_id = %$ctx.info().execution.workflow_id,
                run_id = %$ctx.info().execution.run_id,
                decision = $ctx.decision_index(),
                $($arg)+
            );
        }
    }};
}

/// Log format options for structured logging
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum LogFormat {
    /// Structured JSON output for log aggregators
    Json,
    /// Human-readable multi-line output
    Pretty,
    #[default]
    Compact,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub format: LogFormat,
    /// Level applied to `duroflow` targets; everything else logs at `warn`.
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::Compact,
            level: "info".to_string(),
        }
    }
}

fn default_filter_expression(level: &str) -> String {
    format!("warn,duroflow={level}")
}

/// Install a global `tracing` subscriber. `RUST_LOG` overrides the configured level.
///
/// # Errors
///
/// Fails if a global subscriber is already installed.
pub fn init_logging(config: &LogConfig) -> Result<(), String> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter_expression(&config.level)));

    match config.format {
        LogFormat::Json => tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .try_init()
            .map_err(|e| format!("Failed to initialize JSON logging: {e}")),
        LogFormat::Pretty => tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().pretty())
            .try_init()
            .map_err(|e| format!("Failed to initialize pretty logging: {e}")),
        LogFormat::Compact => tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().compact())
            .try_init()
            .map_err(|e| format!("Failed to initialize compact logging: {e}")),
    }
}

//! Runtime limits and constants.
//!
//! Collect all hard limits in one place so they're easy to find and document.

/// Default bound on scheduling rounds within one decision.
///
/// A round polls every woken logical thread once. Well-behaved workflows block
/// on history within a handful of rounds; only a thread that keeps waking
/// itself without blocking gets anywhere near this.
pub const DEFAULT_MAX_SCHEDULER_ROUNDS: usize = 10_000;

/// Name of the built-in query that lists logical threads and their status.
pub const STACK_TRACE_QUERY: &str = "__stack_trace";

/// Prefix reserved for built-in query types and internal registrations.
pub const RESERVED_PREFIX: &str = "__";

/// Name given to the root logical thread.
pub const ROOT_THREAD_NAME: &str = "root";

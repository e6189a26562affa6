//! Query handler table.
//!
//! Handlers are plain synchronous closures, so a query can never suspend a
//! logical thread. While a handler runs the instance is in query mode and
//! refuses every operation that would emit a command or spawn a thread.

use crate::codec::Payload;
use crate::errors::{QueryError, WorkflowError};
use crate::runtime::limits::{RESERVED_PREFIX, STACK_TRACE_QUERY};
use std::collections::BTreeMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

pub(crate) type QueryHandler = Arc<dyn Fn(Option<&Payload>) -> Result<Payload, WorkflowError> + Send + Sync>;

pub(crate) fn query_handler<F>(f: F) -> QueryHandler
where
    F: Fn(Option<&Payload>) -> Result<Payload, WorkflowError> + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Set while a query handler runs.
#[derive(Debug)]
pub(crate) struct QueryMode {
    pub query_type: String,
    pub violation: Option<String>,
}

#[derive(Default)]
pub(crate) struct QueryDispatcher {
    handlers: BTreeMap<String, QueryHandler>,
}

impl QueryDispatcher {
    /// Register or replace the handler for `query_type`.
    pub fn register(&mut self, query_type: &str, handler: QueryHandler) -> Result<(), QueryError> {
        if query_type == STACK_TRACE_QUERY || query_type.starts_with(RESERVED_PREFIX) {
            return Err(QueryError::ReservedQueryType(query_type.to_string()));
        }
        if self.handlers.insert(query_type.to_string(), handler).is_some() {
            tracing::debug!(target: "duroflow::query", query_type, "replaced query handler");
        }
        Ok(())
    }

    pub fn handler(&self, query_type: &str) -> Option<QueryHandler> {
        self.handlers.get(query_type).cloned()
    }

    pub fn known_types(&self) -> Vec<String> {
        std::iter::once(STACK_TRACE_QUERY.to_string())
            .chain(self.handlers.keys().cloned())
            .collect()
    }
}

/// Run a handler, turning failures and panics into `QueryError`s.
pub(crate) fn invoke(handler: &QueryHandler, query_type: &str, args: Option<&Payload>) -> Result<Payload, QueryError> {
    match catch_unwind(AssertUnwindSafe(|| handler(args))) {
        Ok(Ok(payload)) => Ok(payload),
        Ok(Err(error)) => Err(QueryError::HandlerFailed {
            query_type: query_type.to_string(),
            error,
        }),
        Err(panic) => Err(QueryError::HandlerPanicked {
            query_type: query_type.to_string(),
            message: crate::runtime::dispatcher::panic_message(panic.as_ref()),
        }),
    }
}

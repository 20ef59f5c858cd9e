use std::sync::Arc;

use futures::future::BoxFuture;

use crate::error::Result;
use crate::guardrail::ProposedAction;
use crate::types::*;
use crate::workflow::{AgentKind, AgentSpec, WorkflowConfig};

/// Agent handler: one pluggable step of a workflow.
///
/// Handlers must be safe to retry: a second attempt after a failure must not
/// corrupt external state beyond the handler's own domain.
pub trait AgentHandler: Send + Sync + 'static {
    /// Kind this handler was built for. Selects the guardrail evaluator.
    fn kind(&self) -> AgentKind;

    /// Side effect the handler would perform for `input`, if any.
    /// The engine runs the guardrail on it before `handle` is called.
    fn proposed_action(&self, input: &AgentInput) -> Option<ProposedAction> {
        let _ = input;
        None
    }

    /// Run one attempt.
    fn handle(&self, ctx: AgentContext, input: AgentInput) -> BoxFuture<'_, Result<AgentOutput>>;
}

/// Builds handlers for declared agents. Called once per agent when a workflow is prepared.
pub trait HandlerFactory: Send + Sync + 'static {
    fn build(&self, spec: &AgentSpec, workflow: &WorkflowConfig) -> Result<Arc<dyn AgentHandler>>;
}

/// Durable trace persistence keyed by task id.
///
/// Calls are synchronous and durable on return.
pub trait TraceStore: Send + Sync + 'static {
    /// Insert or replace the full trace.
    fn save(&self, trace: &Trace) -> Result<()>;

    fn load(&self, task_id: &str) -> Result<Option<Trace>>;

    /// Newest first.
    fn list(&self, query: &TraceQuery) -> Result<Vec<TraceSummary>>;
}

//! Test doubles and fixtures shared by the Switchyard crates.

pub mod fixtures;

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;

use switchyard_core::error::{ConfigError, EngineError, Result};
use switchyard_core::guardrail::ProposedAction;
use switchyard_core::traits::{AgentHandler, HandlerFactory, TraceStore};
use switchyard_core::types::*;
use switchyard_core::workflow::{AgentKind, AgentSpec, WorkerKind, WorkflowConfig};

enum Scripted {
    Output(AgentOutput),
    Error(String),
}

/// Agent that replays a queue of scripted outputs.
///
/// Once the queue is empty every call returns the fallback output
/// (`success("done")` unless overridden).
pub struct ScriptedAgent {
    kind: AgentKind,
    script: Mutex<VecDeque<Scripted>>,
    fallback: AgentOutput,
    action: Option<ProposedAction>,
    delay: Option<Duration>,
    calls: AtomicUsize,
    seen: Mutex<Vec<(AgentContext, AgentInput)>>,
}

impl ScriptedAgent {
    pub fn new(kind: AgentKind) -> Self {
        Self {
            kind,
            script: Mutex::new(VecDeque::new()),
            fallback: AgentOutput::success("done"),
            action: None,
            delay: None,
            calls: AtomicUsize::new(0),
            seen: Mutex::new(Vec::new()),
        }
    }

    pub fn orchestrator() -> Self {
        Self::new(AgentKind::Orchestrator)
    }

    pub fn worker(kind: WorkerKind) -> Self {
        Self::new(AgentKind::Worker(kind))
    }

    /// Queue an output.
    pub fn then(self, output: AgentOutput) -> Self {
        self.script.lock().unwrap().push_back(Scripted::Output(output));
        self
    }

    /// Queue a handler error.
    pub fn then_err(self, message: impl Into<String>) -> Self {
        self.script
            .lock()
            .unwrap()
            .push_back(Scripted::Error(message.into()));
        self
    }

    /// Output returned once the script runs out.
    pub fn with_fallback(mut self, output: AgentOutput) -> Self {
        self.fallback = output;
        self
    }

    /// Action reported to the guardrail gate on every call.
    pub fn with_action(mut self, action: ProposedAction) -> Self {
        self.action = Some(action);
        self
    }

    /// Sleep before answering.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Contexts and inputs of every call, in order.
    pub fn seen(&self) -> Vec<(AgentContext, AgentInput)> {
        self.seen.lock().unwrap().clone()
    }
}

impl AgentHandler for ScriptedAgent {
    fn kind(&self) -> AgentKind {
        self.kind
    }

    fn proposed_action(&self, _input: &AgentInput) -> Option<ProposedAction> {
        self.action.clone()
    }

    fn handle(&self, ctx: AgentContext, input: AgentInput) -> BoxFuture<'_, Result<AgentOutput>> {
        Box::pin(async move {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let agent = ctx.agent.clone();
            self.seen.lock().unwrap().push((ctx, input));
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            let next = self.script.lock().unwrap().pop_front();
            match next {
                Some(Scripted::Output(output)) => Ok(output),
                Some(Scripted::Error(message)) => Err(EngineError::Agent { agent, message }),
                None => Ok(self.fallback.clone()),
            }
        })
    }
}

/// Factory that hands out pre-built scripted agents by name.
#[derive(Default)]
pub struct ScriptedFactory {
    agents: HashMap<String, Arc<ScriptedAgent>>,
}

impl ScriptedFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, agent: Arc<ScriptedAgent>) -> Self {
        self.agents.insert(name.into(), agent);
        self
    }
}

impl HandlerFactory for ScriptedFactory {
    fn build(&self, spec: &AgentSpec, _workflow: &WorkflowConfig) -> Result<Arc<dyn AgentHandler>> {
        match self.agents.get(&spec.name) {
            Some(agent) => Ok(agent.clone() as Arc<dyn AgentHandler>),
            None => Err(ConfigError::UnsupportedAgent {
                agent: spec.name.clone(),
                kind: "scripted".to_string(),
            }
            .into()),
        }
    }
}

/// In-memory trace store that remembers every save.
#[derive(Default)]
pub struct MemoryTraceStore {
    traces: Mutex<HashMap<String, Trace>>,
    saves: Mutex<Vec<Trace>>,
}

impl MemoryTraceStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every saved version of every trace, oldest first.
    pub fn saves(&self) -> Vec<Trace> {
        self.saves.lock().unwrap().clone()
    }

    /// Saved versions of one trace.
    pub fn saves_of(&self, task_id: &TaskId) -> Vec<Trace> {
        self.saves()
            .into_iter()
            .filter(|t| &t.task_id == task_id)
            .collect()
    }

    pub fn insert(&self, trace: Trace) {
        self.traces
            .lock()
            .unwrap()
            .insert(trace.task_id.to_string(), trace);
    }
}

impl TraceStore for MemoryTraceStore {
    fn save(&self, trace: &Trace) -> Result<()> {
        self.saves.lock().unwrap().push(trace.clone());
        self.insert(trace.clone());
        Ok(())
    }

    fn load(&self, task_id: &str) -> Result<Option<Trace>> {
        Ok(self.traces.lock().unwrap().get(task_id).cloned())
    }

    fn list(&self, query: &TraceQuery) -> Result<Vec<TraceSummary>> {
        let traces = self.traces.lock().unwrap();
        let mut rows: Vec<TraceSummary> = traces
            .values()
            .filter(|t| {
                query
                    .organization
                    .as_ref()
                    .map_or(true, |o| t.organization_id.as_ref() == Some(o))
                    && query
                        .workflow
                        .as_ref()
                        .map_or(true, |w| t.workflow_id.as_ref() == Some(w))
                    && query.status.map_or(true, |s| t.status == s)
            })
            .map(Trace::summary)
            .collect();
        rows.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        if let Some(limit) = query.limit {
            rows.truncate(limit);
        }
        Ok(rows)
    }
}

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::event::EventBus;
use crate::guardrail::Violation;
use crate::workflow::{Limits, WorkflowConfig};

/// JSON object used for memory namespaces and payloads.
pub type JsonMap = serde_json::Map<String, serde_json::Value>;

/// Unique identifier of one run (and of its trace).
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct TaskId(pub String);

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from_str(s: &str) -> Self {
        Self(s.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Input handed to an agent handler.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentInput {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
}

impl AgentInput {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            payload: None,
        }
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = Some(payload);
        self
    }

    /// Look up a string field of an object payload.
    pub fn payload_str(&self, key: &str) -> Option<&str> {
        self.payload
            .as_ref()
            .and_then(|p| p.get(key))
            .and_then(|v| v.as_str())
    }
}

/// What an agent handler returns for one attempt.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentOutput {
    pub ok: bool,
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
    /// Agent to hand off to. `None` means the task is complete.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

impl AgentOutput {
    pub fn success(message: impl Into<String>) -> Self {
        Self {
            ok: true,
            message: message.into(),
            ..Default::default()
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            message: message.into(),
            ..Default::default()
        }
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = Some(payload);
        self
    }

    pub fn with_next(mut self, next: impl Into<String>) -> Self {
        self.next = Some(next.into());
        self
    }

    pub fn with_cost(mut self, cost: f64) -> Self {
        self.cost = Some(cost);
        self
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// Context passed to a handler for one attempt.
#[derive(Clone)]
pub struct AgentContext {
    pub task_id: TaskId,
    /// Name of the agent being invoked.
    pub agent: String,
    /// The caller's original task text.
    pub task: String,
    pub loop_index: u32,
    pub attempt: u32,
    /// Merged read-view of the namespaces this agent was granted.
    pub memory: JsonMap,
    pub workflow: Arc<WorkflowConfig>,
    pub events: Option<Arc<EventBus>>,
}

impl AgentContext {
    /// Names this agent may hand off to.
    pub fn can_call(&self) -> Vec<String> {
        self.workflow
            .routes
            .get(&self.agent)
            .map(|r| r.can_call.clone())
            .unwrap_or_default()
    }

    /// Emit a log line on behalf of the agent.
    pub fn log(&self, message: impl Into<String>) {
        let message = message.into();
        tracing::debug!(task_id = %self.task_id, agent = %self.agent, "{}", message);
        if let Some(ref bus) = self.events {
            bus.publish(EngineEvent::AgentLog {
                task_id: self.task_id.clone(),
                agent: self.agent.clone(),
                message,
            });
        }
    }
}

impl fmt::Debug for AgentContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentContext")
            .field("task_id", &self.task_id)
            .field("agent", &self.agent)
            .field("loop_index", &self.loop_index)
            .field("attempt", &self.attempt)
            .field("memory_keys", &self.memory.len())
            .field("events", &self.events.is_some())
            .finish()
    }
}

/// Run lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Ok,
    Error,
    Stopped,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Ok => "ok",
            Self::Error => "error",
            Self::Stopped => "stopped",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "running" => Ok(Self::Running),
            "ok" => Ok(Self::Ok),
            "error" => Ok(Self::Error),
            "stopped" => Ok(Self::Stopped),
            other => Err(format!("unknown run status: {}", other)),
        }
    }
}

/// Accumulated totals for a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Totals {
    pub cost: f64,
    pub duration_ms: u64,
}

/// Ceilings a run was started under, copied from the workflow limits.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Ceilings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_duration_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_cost: Option<f64>,
    pub default_max_loops: u32,
}

impl From<&Limits> for Ceilings {
    fn from(limits: &Limits) -> Self {
        Self {
            max_duration_ms: limits.max_duration_ms,
            max_cost: limits.max_cost,
            default_max_loops: limits.default_max_loops,
        }
    }
}

/// One attempt of one agent invocation. Immutable once appended to a trace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionStep {
    pub at: DateTime<Utc>,
    pub agent: String,
    /// Global loop counter at the time of the call.
    #[serde(rename = "loop")]
    pub loop_index: u32,
    /// Retry ordinal, starting at 1.
    pub attempt: u32,
    pub input: AgentInput,
    pub output: AgentOutput,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub violation: Option<Violation>,
}

/// The permanent record of one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trace {
    pub task_id: TaskId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub organization_id: Option<String>,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    pub status: RunStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub steps: Vec<ExecutionStep>,
    pub ceilings: Ceilings,
    pub totals: Totals,
    #[serde(default)]
    pub memory_namespaces: Vec<String>,
    /// Verbatim workflow configuration captured at run start.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow_config: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initial_task: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initial_memory: Option<serde_json::Value>,
    /// Task id of the trace this run replayed, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replay_of: Option<TaskId>,
}

impl Trace {
    /// Result payload: the payload of the last successful step.
    pub fn last_payload(&self) -> Option<&serde_json::Value> {
        self.steps
            .iter()
            .rev()
            .filter(|s| s.output.ok)
            .find_map(|s| s.output.payload.as_ref())
    }

    pub fn summary(&self) -> TraceSummary {
        TraceSummary {
            task_id: self.task_id.clone(),
            workflow_id: self.workflow_id.clone(),
            organization_id: self.organization_id.clone(),
            status: self.status,
            started_at: self.started_at,
            finished_at: self.finished_at,
            total_cost: self.totals.cost,
            step_count: self.steps.len(),
            replay_of: self.replay_of.clone(),
        }
    }
}

/// Lightweight listing row for stored traces.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceSummary {
    pub task_id: TaskId,
    pub workflow_id: Option<String>,
    pub organization_id: Option<String>,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub total_cost: f64,
    pub step_count: usize,
    pub replay_of: Option<TaskId>,
}

/// Filter for listing stored traces.
#[derive(Debug, Clone, Default)]
pub struct TraceQuery {
    pub organization: Option<String>,
    pub workflow: Option<String>,
    pub status: Option<RunStatus>,
    pub limit: Option<usize>,
}

/// A caller's request to execute a task.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunRequest {
    pub task: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<JsonMap>,
}

impl RunRequest {
    pub fn new(task: impl Into<String>) -> Self {
        Self {
            task: task.into(),
            memory: None,
        }
    }

    pub fn with_memory(mut self, memory: JsonMap) -> Self {
        self.memory = Some(memory);
        self
    }
}

/// What the caller gets back from `run` and `replay`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunResult {
    pub status: RunStatus,
    pub task_id: TaskId,
    pub result: Option<serde_json::Value>,
    pub totals: Totals,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replay_of: Option<TaskId>,
}

impl RunResult {
    pub fn from_trace(trace: &Trace) -> Self {
        Self {
            status: trace.status,
            task_id: trace.task_id.clone(),
            result: trace.last_payload().cloned(),
            totals: trace.totals,
            error: trace.error.clone(),
            replay_of: trace.replay_of.clone(),
        }
    }
}

/// Engine event broadcast to all subscribers.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// Run started.
    RunStarted {
        task_id: TaskId,
        workflow_id: Option<String>,
        replay_of: Option<TaskId>,
    },
    /// An attempt is about to invoke an agent.
    AttemptStarted {
        task_id: TaskId,
        agent: String,
        loop_index: u32,
        attempt: u32,
    },
    /// An attempt failed (handler error, ok=false, or guardrail violation).
    AttemptFailed {
        task_id: TaskId,
        agent: String,
        attempt: u32,
        error: String,
    },
    /// A guardrail refused a proposed action.
    GuardrailBlocked {
        task_id: TaskId,
        agent: String,
        violation: Violation,
    },
    /// A step was appended to the trace.
    StepRecorded { task_id: TaskId, step: ExecutionStep },
    /// Control moved from one agent to another.
    Routed {
        task_id: TaskId,
        from: String,
        to: String,
        loop_index: u32,
    },
    /// Free-form log line from an agent.
    AgentLog {
        task_id: TaskId,
        agent: String,
        message: String,
    },
    /// Run reached a terminal state.
    RunFinished {
        task_id: TaskId,
        status: RunStatus,
        totals: Totals,
        error: Option<String>,
    },
}

impl EngineEvent {
    pub fn task_id(&self) -> &TaskId {
        match self {
            Self::RunStarted { task_id, .. }
            | Self::AttemptStarted { task_id, .. }
            | Self::AttemptFailed { task_id, .. }
            | Self::GuardrailBlocked { task_id, .. }
            | Self::StepRecorded { task_id, .. }
            | Self::Routed { task_id, .. }
            | Self::AgentLog { task_id, .. }
            | Self::RunFinished { task_id, .. } => task_id,
        }
    }
}

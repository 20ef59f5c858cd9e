use thiserror::Error;

use crate::guardrail::Violation;

/// Load-time configuration failures. A run never starts when one of these is returned.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Workflow parse error: {0}")]
    Parse(String),

    #[error("Config file not found: {0}")]
    NotFound(String),

    #[error("Agent name must not be empty")]
    EmptyAgentName,

    #[error("Duplicate agent name: {0}")]
    DuplicateAgent(String),

    #[error("Workflow declares no orchestrator agent")]
    NoOrchestrator,

    #[error("Entry agent '{0}' is not declared")]
    UnknownEntry(String),

    #[error("Route source '{0}' is not a declared agent")]
    UnknownRouteSource(String),

    #[error("Route {from} -> {to}: '{to}' is not a declared agent")]
    UnknownRouteTarget { from: String, to: String },

    #[error("Worker agent '{0}' does not declare a worker kind")]
    MissingWorkerKind(String),

    #[error("Agent '{agent}': guardrail field '{field}' is not valid for {kind} agents")]
    InvalidGuardrail {
        agent: String,
        field: String,
        kind: String,
    },

    #[error("Invalid limit {field}: {reason}")]
    InvalidLimit { field: String, reason: String },

    #[error("Namespace '{namespace}' is written by both '{first}' and '{second}'")]
    DuplicateWriter {
        namespace: String,
        first: String,
        second: String,
    },

    #[error("Orchestrator '{0}' must not declare a worker kind")]
    UnexpectedWorkerKind(String),

    #[error("No handler available for agent '{agent}' ({kind})")]
    UnsupportedAgent { agent: String, kind: String },
}

/// Runtime failures surfaced by the engine, its stores and the built-in agents.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Agent not found: {0}")]
    AgentNotFound(String),

    #[error("Agent {agent} failed: {message}")]
    Agent { agent: String, message: String },

    #[error("Guardrail violation: {0}")]
    Guardrail(Violation),

    #[error("Database error: {0}")]
    Database(String),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("LLM request failed: {0}")]
    Llm(String),

    #[error("Trace store error: {0}")]
    Store(String),

    #[error("Trace not found: {0}")]
    TraceNotFound(String),

    #[error("Trace {0} is already finalized")]
    TraceFinalized(String),

    #[error("Trace {task_id} cannot be replayed: missing {missing}")]
    ReplayIneligible { task_id: String, missing: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, EngineError>;

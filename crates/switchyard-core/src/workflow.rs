//! Workflow configuration model: the declared agent graph.
//!
//! A workflow document (TOML or JSON) declares agents, the routes between
//! them, per-agent policies (retries, guardrails, memory grants), workflow
//! ceilings and seed memory. Every loading path ends in [`WorkflowConfig::validate`],
//! so a `WorkflowConfig` obtained from this module always references only
//! declared agents.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::config::expand_env_vars;
use crate::error::ConfigError;
use crate::guardrail::GuardrailPolicy;
use crate::types::JsonMap;

/// Namespace every agent reads by default and that seeds/runtime memory land in.
pub const GLOBAL_NAMESPACE: &str = "global";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WorkflowConfig {
    #[serde(default)]
    pub workflow: WorkflowMeta,
    /// Agent the run starts at. Defaults to the first declared orchestrator.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entry: Option<String>,
    pub agents: Vec<AgentSpec>,
    #[serde(default)]
    pub routes: BTreeMap<String, RouteSpec>,
    #[serde(default)]
    pub limits: Limits,
    #[serde(default)]
    pub memory: MemorySeed,
}

/// Identifiers traces are filed under.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WorkflowMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub organization: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentRole {
    Orchestrator,
    Worker,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerKind {
    Database,
    Api,
    Llm,
}

impl fmt::Display for WorkerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Database => write!(f, "database"),
            Self::Api => write!(f, "api"),
            Self::Llm => write!(f, "llm"),
        }
    }
}

/// Typed agent kind, resolved once from `kind` + `worker`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AgentKind {
    Orchestrator,
    Worker(WorkerKind),
}

impl fmt::Display for AgentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Orchestrator => write!(f, "orchestrator"),
            Self::Worker(kind) => write!(f, "{} worker", kind),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AgentSpec {
    pub name: String,
    pub kind: AgentRole,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker: Option<WorkerKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Per-agent invocation ceiling. Falls back to `limits.default_max_loops`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_loops: Option<u32>,
    #[serde(default)]
    pub policy: AgentPolicy,
    /// Handler-specific settings (database path, prompt, timeouts...).
    #[serde(default, skip_serializing_if = "JsonMap::is_empty")]
    pub settings: JsonMap,
}

impl AgentSpec {
    pub fn new(name: impl Into<String>, kind: AgentRole) -> Self {
        Self {
            name: name.into(),
            kind,
            worker: None,
            description: None,
            max_loops: None,
            policy: AgentPolicy::default(),
            settings: JsonMap::new(),
        }
    }

    pub fn orchestrator(name: impl Into<String>) -> Self {
        Self::new(name, AgentRole::Orchestrator)
    }

    pub fn worker(name: impl Into<String>, worker: WorkerKind) -> Self {
        let mut spec = Self::new(name, AgentRole::Worker);
        spec.worker = Some(worker);
        spec
    }

    pub fn with_max_loops(mut self, max_loops: u32) -> Self {
        self.max_loops = Some(max_loops);
        self
    }

    pub fn with_retries(mut self, retries: RetryPolicy) -> Self {
        self.policy.retries = retries;
        self
    }

    pub fn with_guardrails(mut self, guardrails: GuardrailPolicy) -> Self {
        self.policy.guardrails = guardrails;
        self
    }

    pub fn with_memory(mut self, memory: MemoryPolicy) -> Self {
        self.policy.memory = memory;
        self
    }

    pub fn with_setting(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.settings.insert(key.into(), value);
        self
    }

    /// Typed kind. Only meaningful on validated configs.
    pub fn agent_kind(&self) -> Option<AgentKind> {
        match self.kind {
            AgentRole::Orchestrator => Some(AgentKind::Orchestrator),
            AgentRole::Worker => self.worker.map(AgentKind::Worker),
        }
    }

    /// String setting lookup.
    pub fn setting_str(&self, key: &str) -> Option<&str> {
        self.settings.get(key).and_then(|v| v.as_str())
    }

    /// Integer setting lookup.
    pub fn setting_u64(&self, key: &str) -> Option<u64> {
        self.settings.get(key).and_then(|v| v.as_u64())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AgentPolicy {
    #[serde(default)]
    pub retries: RetryPolicy,
    #[serde(default)]
    pub guardrails: GuardrailPolicy,
    #[serde(default)]
    pub memory: MemoryPolicy,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffStrategy {
    #[default]
    Fixed,
    Exponential,
}

/// Retry configuration for one agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RetryPolicy {
    /// Retries after the first attempt (total attempts = count + 1).
    #[serde(default)]
    pub count: u32,
    #[serde(default)]
    pub backoff_ms: u64,
    #[serde(default)]
    pub strategy: BackoffStrategy,
    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,
    #[serde(default)]
    pub jitter: bool,
    /// Whether a guardrail violation consumes a retry (true) or fails the step at once.
    #[serde(default = "default_retry_on_violation")]
    pub retry_on_violation: bool,
}

fn default_max_backoff() -> u64 { 30_000 }
fn default_retry_on_violation() -> bool { true }

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            count: 0,
            backoff_ms: 0,
            strategy: BackoffStrategy::Fixed,
            max_backoff_ms: default_max_backoff(),
            jitter: false,
            retry_on_violation: default_retry_on_violation(),
        }
    }
}

impl RetryPolicy {
    pub fn fixed(count: u32, backoff_ms: u64) -> Self {
        Self {
            count,
            backoff_ms,
            ..Default::default()
        }
    }

    pub fn exponential(count: u32, backoff_ms: u64, max_backoff_ms: u64) -> Self {
        Self {
            count,
            backoff_ms,
            strategy: BackoffStrategy::Exponential,
            max_backoff_ms,
            ..Default::default()
        }
    }
}

/// Memory grants for one agent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MemoryPolicy {
    /// Namespaces readable by the agent. Unset means `["global"]`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read_from: Option<Vec<String>>,
    /// Namespace the agent's payloads merge into. Unset means the agent's own name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub write_to: Option<String>,
}

impl MemoryPolicy {
    pub fn new(read_from: Vec<String>, write_to: impl Into<String>) -> Self {
        Self {
            read_from: Some(read_from),
            write_to: Some(write_to.into()),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RouteSpec {
    #[serde(default)]
    pub can_call: Vec<String>,
}

/// Workflow-wide ceilings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Limits {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_duration_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_cost: Option<f64>,
    #[serde(default = "default_max_loops")]
    pub default_max_loops: u32,
}

fn default_max_loops() -> u32 { 10 }

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_duration_ms: None,
            max_cost: None,
            default_max_loops: default_max_loops(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MemorySeed {
    #[serde(default)]
    pub global: JsonMap,
}

impl WorkflowConfig {
    /// Build a config from agents only. Call `validate` before using it.
    pub fn new(agents: Vec<AgentSpec>) -> Self {
        Self {
            workflow: WorkflowMeta::default(),
            entry: None,
            agents,
            routes: BTreeMap::new(),
            limits: Limits::default(),
            memory: MemorySeed::default(),
        }
    }

    /// Add a route `from -> to`.
    pub fn with_route(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.routes
            .entry(from.into())
            .or_default()
            .can_call
            .push(to.into());
        self
    }

    pub fn with_limits(mut self, limits: Limits) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_global(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.memory.global.insert(key.into(), value);
        self
    }

    /// Parse and validate a TOML workflow document.
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(raw).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validated()
    }

    /// Parse and validate a JSON workflow document.
    pub fn from_json_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Self =
            serde_json::from_str(raw).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validated()
    }

    /// Validate an already-parsed JSON value (e.g. a configuration captured in a trace).
    pub fn from_value(value: serde_json::Value) -> Result<Self, ConfigError> {
        let config: Self =
            serde_json::from_value(value).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validated()
    }

    /// Load a workflow file. `.json` files are parsed as JSON, everything else as TOML.
    /// `${ENV_VAR}` references are expanded before parsing.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| ConfigError::NotFound(path.display().to_string()))?;
        let expanded = expand_env_vars(&content);

        let is_json = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case("json"));
        if is_json {
            Self::from_json_str(&expanded)
        } else {
            Self::from_toml_str(&expanded)
        }
    }

    /// Validate and return self.
    pub fn validated(self) -> Result<Self, ConfigError> {
        self.validate()?;
        Ok(self)
    }

    /// Check every structural invariant. Fails on the first offending reference.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut names: HashSet<&str> = HashSet::new();
        for agent in &self.agents {
            if agent.name.trim().is_empty() {
                return Err(ConfigError::EmptyAgentName);
            }
            if !names.insert(agent.name.as_str()) {
                return Err(ConfigError::DuplicateAgent(agent.name.clone()));
            }
            validate_agent(agent)?;
        }

        if !self
            .agents
            .iter()
            .any(|a| a.kind == AgentRole::Orchestrator)
        {
            return Err(ConfigError::NoOrchestrator);
        }

        if let Some(ref entry) = self.entry {
            if !names.contains(entry.as_str()) {
                return Err(ConfigError::UnknownEntry(entry.clone()));
            }
        }

        for (from, route) in &self.routes {
            if !names.contains(from.as_str()) {
                return Err(ConfigError::UnknownRouteSource(from.clone()));
            }
            for to in &route.can_call {
                if !names.contains(to.as_str()) {
                    return Err(ConfigError::UnknownRouteTarget {
                        from: from.clone(),
                        to: to.clone(),
                    });
                }
            }
        }

        if let Some(cost) = self.limits.max_cost {
            if !cost.is_finite() || cost < 0.0 {
                return Err(ConfigError::InvalidLimit {
                    field: "max_cost".into(),
                    reason: format!("must be a non-negative number, got {}", cost),
                });
            }
        }

        let mut writers: HashMap<&str, &str> = HashMap::new();
        for agent in &self.agents {
            let namespace = self.write_namespace_of(agent);
            if let Some(first) = writers.insert(namespace, agent.name.as_str()) {
                return Err(ConfigError::DuplicateWriter {
                    namespace: namespace.to_string(),
                    first: first.to_string(),
                    second: agent.name.clone(),
                });
            }
        }

        Ok(())
    }

    pub fn agent(&self, name: &str) -> Option<&AgentSpec> {
        self.agents.iter().find(|a| a.name == name)
    }

    /// The agent a run starts at: `entry`, else the first declared orchestrator.
    pub fn entry_agent(&self) -> Option<&AgentSpec> {
        match self.entry {
            Some(ref entry) => self.agent(entry),
            None => self
                .agents
                .iter()
                .find(|a| a.kind == AgentRole::Orchestrator),
        }
    }

    pub fn can_call(&self, from: &str, to: &str) -> bool {
        self.routes
            .get(from)
            .is_some_and(|r| r.can_call.iter().any(|n| n == to))
    }

    pub fn max_loops_for(&self, name: &str) -> u32 {
        self.agent(name)
            .and_then(|a| a.max_loops)
            .unwrap_or(self.limits.default_max_loops)
    }

    pub fn read_namespaces(&self, name: &str) -> Vec<String> {
        self.agent(name)
            .and_then(|a| a.policy.memory.read_from.clone())
            .unwrap_or_else(|| vec![GLOBAL_NAMESPACE.to_string()])
    }

    pub fn write_namespace(&self, name: &str) -> String {
        match self.agent(name) {
            Some(agent) => self.write_namespace_of(agent).to_string(),
            None => name.to_string(),
        }
    }

    fn write_namespace_of<'a>(&self, agent: &'a AgentSpec) -> &'a str {
        agent
            .policy
            .memory
            .write_to
            .as_deref()
            .unwrap_or(agent.name.as_str())
    }

    /// Verbatim JSON capture for traces and replay.
    pub fn to_value(&self) -> Result<serde_json::Value, serde_json::Error> {
        serde_json::to_value(self)
    }
}

fn validate_agent(agent: &AgentSpec) -> Result<(), ConfigError> {
    let guardrails = &agent.policy.guardrails;
    match agent.kind {
        AgentRole::Orchestrator => {
            if agent.worker.is_some() {
                return Err(ConfigError::UnexpectedWorkerKind(agent.name.clone()));
            }
            reject_fields(agent, "orchestrator", &guardrails.set_fields())
        }
        AgentRole::Worker => match agent.worker {
            None => Err(ConfigError::MissingWorkerKind(agent.name.clone())),
            Some(WorkerKind::Database) => {
                reject_fields(agent, "database", &guardrails.set_http_fields())
            }
            Some(WorkerKind::Api) => reject_fields(agent, "api", &guardrails.set_sql_fields()),
            Some(WorkerKind::Llm) => reject_fields(agent, "llm", &guardrails.set_fields()),
        },
    }
}

fn reject_fields(agent: &AgentSpec, kind: &str, fields: &[&str]) -> Result<(), ConfigError> {
    match fields.first() {
        Some(field) => Err(ConfigError::InvalidGuardrail {
            agent: agent.name.clone(),
            field: field.to_string(),
            kind: kind.to_string(),
        }),
        None => Ok(()),
    }
}

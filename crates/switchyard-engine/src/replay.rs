use serde::Serialize;
use serde_json::Value;
use tracing::info;

use switchyard_core::error::{EngineError, Result};
use switchyard_core::types::{RunRequest, RunResult, RunStatus, TaskId, Trace};
use switchyard_core::workflow::WorkflowConfig;

use crate::engine::Engine;

impl Engine {
    /// Re-execute `original`'s captured task and memory under `config`.
    ///
    /// The trace must carry its captured configuration, task and memory.
    /// Older traces without them are rejected before any agent runs.
    /// The replay gets a new task id and points back at the original.
    pub async fn replay(&self, original: &Trace, config: WorkflowConfig) -> Result<RunResult> {
        let request = replay_request(original)?;
        let prepared = self.prepare(config)?;
        info!(
            original = %original.task_id,
            workflow = prepared.config.workflow.id.as_deref().unwrap_or("-"),
            "Replaying trace"
        );
        self.execute(&prepared, request, Some(original.task_id.clone()))
            .await
    }

    /// Load `task_id` from the store and replay it.
    /// `None` replays with the configuration captured in the trace.
    pub async fn replay_by_id(
        &self,
        task_id: &str,
        config: Option<WorkflowConfig>,
    ) -> Result<RunResult> {
        let original = self.load_trace(task_id)?;
        let config = match config {
            Some(config) => config,
            None => {
                let captured = original.workflow_config.clone().ok_or_else(|| {
                    ineligible(&original.task_id, "workflow_config")
                })?;
                WorkflowConfig::from_value(captured)?
            }
        };
        self.replay(&original, config).await
    }
}

/// Rebuild the caller's request from a trace's captured context.
fn replay_request(trace: &Trace) -> Result<RunRequest> {
    let mut missing = Vec::new();
    if trace.workflow_config.is_none() {
        missing.push("workflow_config");
    }
    if trace.initial_task.is_none() {
        missing.push("initial_task");
    }
    let memory = match trace.initial_memory {
        Some(Value::Object(ref map)) => Some(map.clone()),
        Some(Value::Null) | None => {
            missing.push("initial_memory");
            None
        }
        Some(_) => {
            missing.push("initial_memory (not an object)");
            None
        }
    };
    if !missing.is_empty() {
        return Err(ineligible(&trace.task_id, &missing.join(", ")));
    }

    Ok(RunRequest {
        task: trace.initial_task.clone().unwrap_or_default(),
        memory,
    })
}

fn ineligible(task_id: &TaskId, missing: &str) -> EngineError {
    EngineError::ReplayIneligible {
        task_id: task_id.to_string(),
        missing: missing.to_string(),
    }
}

/// Ordered agent names of the successful steps.
pub fn routing_sequence(trace: &Trace) -> Vec<String> {
    trace
        .steps
        .iter()
        .filter(|s| s.output.ok)
        .map(|s| s.agent.clone())
        .collect()
}

/// Outcome differences between a run and its replay.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReplayComparison {
    pub original: TaskId,
    pub replay: TaskId,
    pub original_status: RunStatus,
    pub replay_status: RunStatus,
    /// Replay cost minus original cost.
    pub cost_delta: f64,
    pub duration_delta_ms: i64,
    pub original_routing: Vec<String>,
    pub replay_routing: Vec<String>,
}

impl ReplayComparison {
    pub fn between(original: &Trace, replay: &Trace) -> Self {
        Self {
            original: original.task_id.clone(),
            replay: replay.task_id.clone(),
            original_status: original.status,
            replay_status: replay.status,
            cost_delta: replay.totals.cost - original.totals.cost,
            duration_delta_ms: replay.totals.duration_ms as i64
                - original.totals.duration_ms as i64,
            original_routing: routing_sequence(original),
            replay_routing: routing_sequence(replay),
        }
    }

    pub fn same_routing(&self) -> bool {
        self.original_routing == self.replay_routing
    }

    pub fn same_status(&self) -> bool {
        self.original_status == self.replay_status
    }
}

use std::io::Write;

use chrono::Utc;
use serde_json::json;
use tempfile::NamedTempFile;

use switchyard_core::guardrail::GuardrailPolicy;
use switchyard_core::types::*;
use switchyard_core::workflow::{AgentSpec, Limits, RetryPolicy, WorkerKind, WorkflowConfig};

/// `planner -> db_agent`, with a SELECT-only SQL guardrail on `db_agent`.
pub fn planner_db_workflow() -> WorkflowConfig {
    let mut config = WorkflowConfig::new(vec![
        AgentSpec::orchestrator("planner"),
        AgentSpec::worker("db_agent", WorkerKind::Database).with_guardrails(GuardrailPolicy {
            allowed_operations: Some(vec!["SELECT".into()]),
            require_where: Some(true),
            ..Default::default()
        }),
    ])
    .with_route("planner", "db_agent")
    .with_route("db_agent", "planner");
    config.workflow.id = Some("wf-test".into());
    config.workflow.organization = Some("org-test".into());
    config
}

/// `planner <-> worker` loop with the given ceilings and retry policy on `worker`.
pub fn ping_pong_workflow(limits: Limits, retries: RetryPolicy) -> WorkflowConfig {
    WorkflowConfig::new(vec![
        AgentSpec::orchestrator("planner"),
        AgentSpec::worker("worker", WorkerKind::Llm).with_retries(retries),
    ])
    .with_route("planner", "worker")
    .with_route("worker", "planner")
    .with_limits(limits)
}

/// A finalized trace without any replay context captured.
pub fn legacy_trace() -> Trace {
    Trace {
        task_id: TaskId::new(),
        workflow_id: Some("wf-old".into()),
        organization_id: None,
        started_at: Utc::now(),
        finished_at: Some(Utc::now()),
        status: RunStatus::Ok,
        error: None,
        steps: vec![ExecutionStep {
            at: Utc::now(),
            agent: "planner".into(),
            loop_index: 0,
            attempt: 1,
            input: AgentInput::new("old task"),
            output: AgentOutput::success("done").with_payload(json!({"answer": 1})),
            violation: None,
        }],
        ceilings: Ceilings::default(),
        totals: Totals::default(),
        memory_namespaces: vec!["global".into()],
        workflow_config: None,
        initial_task: None,
        initial_memory: None,
        replay_of: None,
    }
}

/// Write `content` to a temp file with the given extension.
pub fn temp_file(content: &str, suffix: &str) -> NamedTempFile {
    let mut file = tempfile::Builder::new()
        .suffix(suffix)
        .tempfile()
        .expect("create temp file");
    file.write_all(content.as_bytes()).expect("write temp file");
    file
}

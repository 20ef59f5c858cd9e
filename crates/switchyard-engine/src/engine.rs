use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use serde_json::Value;
use tracing::{debug, error, info, warn};

use switchyard_core::error::{ConfigError, EngineError, Result};
use switchyard_core::event::EventBus;
use switchyard_core::guardrail::Guardrails;
use switchyard_core::memory::MemoryContext;
use switchyard_core::traits::{HandlerFactory, TraceStore};
use switchyard_core::types::*;
use switchyard_core::workflow::WorkflowConfig;

use crate::gate::GuardrailGate;
use crate::recorder::TraceRecorder;
use crate::registry::AgentRegistry;
use crate::retry::{RetryController, StepOutcome};

/// A validated workflow with every agent bound to a handler.
///
/// Immutable once built; share it across concurrent runs.
#[derive(Debug, Clone)]
pub struct PreparedWorkflow {
    pub config: Arc<WorkflowConfig>,
    pub registry: AgentRegistry,
    /// Verbatim configuration captured into each trace.
    captured: Value,
}

impl PreparedWorkflow {
    pub fn captured(&self) -> &Value {
        &self.captured
    }
}

/// The orchestration engine.
///
/// Runs are independent: each owns its memory context and trace recorder.
/// The factory, store and guardrails are shared read-only between runs.
pub struct Engine {
    factory: Arc<dyn HandlerFactory>,
    store: Arc<dyn TraceStore>,
    guardrails: Guardrails,
    event_bus: Option<Arc<EventBus>>,
}

/// Terminal state and error message produced by the loop.
type Verdict = (RunStatus, Option<String>);

impl Engine {
    pub fn new(factory: Arc<dyn HandlerFactory>, store: Arc<dyn TraceStore>) -> Self {
        Self {
            factory,
            store,
            guardrails: Guardrails::standard(),
            event_bus: None,
        }
    }

    /// Publish engine events on `bus`.
    pub fn with_events(mut self, bus: Arc<EventBus>) -> Self {
        self.event_bus = Some(bus);
        self
    }

    /// Replace the default evaluators.
    pub fn with_guardrails(mut self, guardrails: Guardrails) -> Self {
        self.guardrails = guardrails;
        self
    }

    pub fn store(&self) -> &Arc<dyn TraceStore> {
        &self.store
    }

    pub fn events(&self) -> Option<&Arc<EventBus>> {
        self.event_bus.as_ref()
    }

    /// Validate `config` and resolve its agents into a typed registry.
    pub fn prepare(&self, config: WorkflowConfig) -> Result<PreparedWorkflow> {
        config.validate()?;
        let registry = AgentRegistry::resolve(&config, self.factory.as_ref())?;
        let captured = config.to_value()?;
        Ok(PreparedWorkflow {
            config: Arc::new(config),
            registry,
            captured,
        })
    }

    /// Execute one task.
    pub async fn run(&self, prepared: &PreparedWorkflow, request: RunRequest) -> Result<RunResult> {
        self.execute(prepared, request, None).await
    }

    /// Load a stored trace.
    pub fn load_trace(&self, task_id: &str) -> Result<Trace> {
        self.store
            .load(task_id)?
            .ok_or_else(|| EngineError::TraceNotFound(task_id.to_string()))
    }

    pub(crate) async fn execute(
        &self,
        prepared: &PreparedWorkflow,
        request: RunRequest,
        replay_of: Option<TaskId>,
    ) -> Result<RunResult> {
        let config = &prepared.config;
        let task_id = TaskId::new();
        let memory = MemoryContext::seed(&config.memory.global, request.memory.as_ref());

        let trace = Trace {
            task_id: task_id.clone(),
            workflow_id: config.workflow.id.clone(),
            organization_id: config.workflow.organization.clone(),
            started_at: Utc::now(),
            finished_at: None,
            status: RunStatus::Running,
            error: None,
            steps: Vec::new(),
            ceilings: Ceilings::from(&config.limits),
            totals: Totals::default(),
            memory_namespaces: memory.namespaces(),
            workflow_config: Some(prepared.captured.clone()),
            initial_task: Some(request.task.clone()),
            initial_memory: Some(Value::Object(request.memory.clone().unwrap_or_default())),
            replay_of: replay_of.clone(),
        };
        let mut recorder = TraceRecorder::start(self.store.clone(), trace)?;

        info!(
            task_id = %task_id,
            workflow = config.workflow.id.as_deref().unwrap_or("-"),
            replay_of = replay_of.as_ref().map(|t| t.as_str()).unwrap_or("-"),
            "Run started"
        );
        self.publish(EngineEvent::RunStarted {
            task_id: task_id.clone(),
            workflow_id: config.workflow.id.clone(),
            replay_of,
        });

        let run = RunState {
            task_id: task_id.clone(),
            task: request.task,
            memory,
            started: Instant::now(),
        };

        let (status, error) = match self.drive(prepared, run, &mut recorder).await {
            Ok(verdict) => verdict,
            Err(e) => {
                error!(task_id = %task_id, error = %e, "Run aborted");
                if !recorder.is_finalized() {
                    if let Err(end_err) = recorder.end(RunStatus::Error, Some(e.to_string())) {
                        warn!(task_id = %task_id, error = %end_err, "Failed to finalize trace");
                    }
                }
                self.publish(EngineEvent::RunFinished {
                    task_id,
                    status: RunStatus::Error,
                    totals: recorder.totals(),
                    error: Some(e.to_string()),
                });
                return Err(e);
            }
        };

        let trace = recorder.end(status, error)?;
        info!(
            task_id = %task_id,
            status = %trace.status,
            steps = trace.steps.len(),
            cost = trace.totals.cost,
            duration_ms = trace.totals.duration_ms,
            error = trace.error.as_deref().unwrap_or(""),
            "Run finished"
        );
        self.publish(EngineEvent::RunFinished {
            task_id,
            status: trace.status,
            totals: trace.totals,
            error: trace.error.clone(),
        });

        Ok(RunResult::from_trace(&trace))
    }

    /// The RUNNING state: select, invoke, record, route, check ceilings.
    async fn drive(
        &self,
        prepared: &PreparedWorkflow,
        mut run: RunState,
        recorder: &mut TraceRecorder,
    ) -> Result<Verdict> {
        let config = &prepared.config;
        let limits = &config.limits;
        let controller = RetryController::new(
            GuardrailGate::new(self.guardrails.clone(), self.event_bus.clone()),
            self.event_bus.clone(),
        );

        let entry = config.entry_agent().ok_or(ConfigError::NoOrchestrator)?;
        let mut current = entry.name.clone();
        let mut loop_index: u32 = 0;
        let mut invocations: HashMap<String, u32> = HashMap::new();

        // The entry agent's first call counts against its own ceiling.
        invocations.insert(current.clone(), 1);
        let entry_max = config.max_loops_for(&current);
        if entry_max < 1 {
            return Ok(loop_limit(&current, entry_max));
        }

        let mut input = AgentInput::new(run.task.clone());

        loop {
            let agent = prepared
                .registry
                .get(&current)
                .ok_or_else(|| EngineError::AgentNotFound(current.clone()))?;

            let ctx = AgentContext {
                task_id: run.task_id.clone(),
                agent: current.clone(),
                task: run.task.clone(),
                loop_index,
                attempt: 1,
                memory: run.memory.read_for(config, &current),
                workflow: config.clone(),
                events: self.event_bus.clone(),
            };

            debug!(task_id = %run.task_id, agent = %current, loop_index, "Invoking agent");
            let outcome = controller
                .invoke(agent, ctx, input.clone(), &agent.spec.policy.retries, |step| {
                    let event = EngineEvent::StepRecorded {
                        task_id: run.task_id.clone(),
                        step: step.clone(),
                    };
                    recorder.add(step)?;
                    self.publish(event);
                    Ok(())
                })
                .await?;

            let output = match outcome {
                StepOutcome::Success(output) => output,
                StepOutcome::Failed { error, .. } => return Ok((RunStatus::Error, Some(error))),
            };

            if let Some(ref payload) = output.payload {
                run.memory.write_for(config, &current, payload);
                recorder.set_memory_namespaces(run.memory.namespaces());
            }

            let Some(next) = output.next.clone() else {
                debug!(task_id = %run.task_id, agent = %current, "No next agent, task complete");
                return Ok((RunStatus::Ok, None));
            };

            if !config.can_call(&current, &next) {
                warn!(task_id = %run.task_id, from = %current, to = %next, "Route not permitted");
                return Ok((
                    RunStatus::Error,
                    Some(format!("route not permitted: {} -> {}", current, next)),
                ));
            }

            let count = invocations.entry(next.clone()).or_insert(0);
            *count += 1;
            let max = config.max_loops_for(&next);
            if *count > max {
                return Ok(loop_limit(&next, max));
            }

            if let Some(max_cost) = limits.max_cost {
                let cost = recorder.totals().cost;
                if cost > max_cost {
                    warn!(task_id = %run.task_id, cost, max_cost, "Cost ceiling exceeded");
                    return Ok((RunStatus::Stopped, Some("cost ceiling exceeded".to_string())));
                }
            }

            if let Some(max_ms) = limits.max_duration_ms {
                let elapsed = run.started.elapsed().as_millis() as u64;
                if elapsed > max_ms {
                    warn!(task_id = %run.task_id, elapsed_ms = elapsed, max_ms, "Duration ceiling exceeded");
                    return Ok((RunStatus::Stopped, Some("duration ceiling exceeded".to_string())));
                }
            }

            self.publish(EngineEvent::Routed {
                task_id: run.task_id.clone(),
                from: current.clone(),
                to: next.clone(),
                loop_index: loop_index + 1,
            });
            info!(task_id = %run.task_id, from = %current, to = %next, loop_index = loop_index + 1, "Routed");

            input = AgentInput {
                message: output.message,
                payload: output.payload,
            };
            current = next;
            loop_index += 1;
        }
    }

    fn publish(&self, event: EngineEvent) {
        if let Some(ref bus) = self.event_bus {
            bus.publish(event);
        }
    }
}

/// Per-run mutable state owned by the loop.
struct RunState {
    task_id: TaskId,
    task: String,
    memory: MemoryContext,
    started: Instant,
}

fn loop_limit(agent: &str, max: u32) -> Verdict {
    warn!(agent = %agent, max_loops = max, "Loop limit exceeded");
    (
        RunStatus::Stopped,
        Some(format!("loop limit exceeded: {} ({})", agent, max)),
    )
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;

    use super::*;
    use switchyard_core::guardrail::ProposedAction;
    use switchyard_core::workflow::{
        AgentSpec, Limits, MemoryPolicy, RetryPolicy, WorkerKind,
    };
    use switchyard_test_utils::fixtures::{ping_pong_workflow, planner_db_workflow};
    use switchyard_test_utils::{MemoryTraceStore, ScriptedAgent, ScriptedFactory};

    fn engine(factory: ScriptedFactory) -> (Engine, Arc<MemoryTraceStore>) {
        let store = Arc::new(MemoryTraceStore::new());
        (Engine::new(Arc::new(factory), store.clone()), store)
    }

    #[tokio::test]
    async fn happy_path_single_hop() {
        let planner = Arc::new(
            ScriptedAgent::orchestrator().then(AgentOutput::success("ask db").with_next("db_agent")),
        );
        let db = Arc::new(
            ScriptedAgent::worker(WorkerKind::Database).then(
                AgentOutput::success("rows")
                    .with_payload(json!({"rows": [{"id": 1}]}))
                    .with_cost(0.02),
            ),
        );
        let (engine, store) = engine(
            ScriptedFactory::new()
                .with("planner", planner.clone())
                .with("db_agent", db.clone()),
        );

        let prepared = engine.prepare(planner_db_workflow()).unwrap();
        let result = engine
            .run(&prepared, RunRequest::new("count users"))
            .await
            .unwrap();

        assert_eq!(result.status, RunStatus::Ok);
        assert_eq!(result.result, Some(json!({"rows": [{"id": 1}]})));
        assert!((result.totals.cost - 0.02).abs() < 1e-9);
        assert!(result.error.is_none());

        let trace = store.load(result.task_id.as_str()).unwrap().unwrap();
        assert_eq!(trace.status, RunStatus::Ok);
        let agents: Vec<&str> = trace.steps.iter().map(|s| s.agent.as_str()).collect();
        assert_eq!(agents, vec!["planner", "db_agent"]);
        assert_eq!(trace.steps[0].loop_index, 0);
        assert_eq!(trace.steps[1].loop_index, 1);
        assert_eq!(trace.initial_task.as_deref(), Some("count users"));
        assert!(trace.workflow_config.is_some());
        assert_eq!(trace.workflow_id.as_deref(), Some("wf-test"));
        assert!(trace.memory_namespaces.contains(&"db_agent".to_string()));

        // Second hop sees the first hop's output as input.
        let (ctx, input) = db.seen().remove(0);
        assert_eq!(input.message, "ask db");
        assert_eq!(ctx.task, "count users");
    }

    #[tokio::test]
    async fn guardrail_blocked_delete_never_reaches_handler() {
        let planner = Arc::new(
            ScriptedAgent::orchestrator().then(AgentOutput::success("go").with_next("db_agent")),
        );
        let db = Arc::new(
            ScriptedAgent::worker(WorkerKind::Database)
                .with_action(ProposedAction::sql("DELETE FROM users")),
        );
        let (engine, store) = engine(
            ScriptedFactory::new()
                .with("planner", planner)
                .with("db_agent", db.clone()),
        );

        let prepared = engine.prepare(planner_db_workflow()).unwrap();
        let result = engine.run(&prepared, RunRequest::new("purge")).await.unwrap();

        assert_eq!(result.status, RunStatus::Error);
        let error = result.error.unwrap();
        assert!(error.contains("DELETE"));
        assert!(error.contains("WHERE"));
        assert_eq!(db.calls(), 0);

        let trace = store.load(result.task_id.as_str()).unwrap().unwrap();
        assert!(trace.steps[1].violation.is_some());
    }

    #[tokio::test]
    async fn route_outside_can_call_is_an_error() {
        let planner = Arc::new(
            ScriptedAgent::orchestrator().then(AgentOutput::success("x").with_next("ghost")),
        );
        let (engine, _) = engine(
            ScriptedFactory::new()
                .with("planner", planner)
                .with("db_agent", Arc::new(ScriptedAgent::worker(WorkerKind::Database))),
        );
        let prepared = engine.prepare(planner_db_workflow()).unwrap();
        let result = engine.run(&prepared, RunRequest::new("t")).await.unwrap();
        assert_eq!(result.status, RunStatus::Error);
        assert_eq!(result.error.as_deref(), Some("route not permitted: planner -> ghost"));
    }

    #[tokio::test]
    async fn loop_ceiling_stops_before_extra_invocation() {
        let planner = Arc::new(
            ScriptedAgent::orchestrator().with_fallback(AgentOutput::success("again").with_next("worker")),
        );
        let worker = Arc::new(
            ScriptedAgent::worker(WorkerKind::Llm).with_fallback(AgentOutput::success("back").with_next("planner")),
        );
        let mut config = ping_pong_workflow(Limits::default(), RetryPolicy::default());
        config.agents[1].max_loops = Some(3);

        let (engine, store) = engine(
            ScriptedFactory::new()
                .with("planner", planner)
                .with("worker", worker.clone()),
        );
        let prepared = engine.prepare(config).unwrap();
        let result = engine.run(&prepared, RunRequest::new("t")).await.unwrap();

        assert_eq!(result.status, RunStatus::Stopped);
        assert_eq!(result.error.as_deref(), Some("loop limit exceeded: worker (3)"));
        assert_eq!(worker.calls(), 3);

        let trace = store.load(result.task_id.as_str()).unwrap().unwrap();
        assert_eq!(trace.steps.iter().filter(|s| s.agent == "worker").count(), 3);
    }

    #[tokio::test]
    async fn cost_ceiling_stops_with_no_further_steps() {
        let planner = Arc::new(
            ScriptedAgent::orchestrator()
                .with_fallback(AgentOutput::success("go").with_next("worker").with_cost(0.4)),
        );
        let worker = Arc::new(
            ScriptedAgent::worker(WorkerKind::Llm)
                .with_fallback(AgentOutput::success("back").with_next("planner").with_cost(0.4)),
        );
        let limits = Limits {
            max_cost: Some(1.0),
            default_max_loops: 100,
            ..Default::default()
        };
        let (engine, store) = engine(
            ScriptedFactory::new()
                .with("planner", planner)
                .with("worker", worker),
        );
        let prepared = engine
            .prepare(ping_pong_workflow(limits, RetryPolicy::default()))
            .unwrap();
        let result = engine.run(&prepared, RunRequest::new("t")).await.unwrap();

        assert_eq!(result.status, RunStatus::Stopped);
        assert_eq!(result.error.as_deref(), Some("cost ceiling exceeded"));

        let trace = store.load(result.task_id.as_str()).unwrap().unwrap();
        // 0.4, 0.8, 1.2 -> stop after the third step.
        assert_eq!(trace.steps.len(), 3);
        let mut running = 0.0;
        for step in &trace.steps {
            let next = running + step.output.cost.unwrap_or(0.0);
            assert!(next >= running);
            running = next;
        }
        assert!((trace.totals.cost - 1.2).abs() < 1e-9);
    }

    #[tokio::test]
    async fn duration_ceiling_stops() {
        let planner = Arc::new(
            ScriptedAgent::orchestrator()
                .with_delay(Duration::from_millis(30))
                .with_fallback(AgentOutput::success("go").with_next("worker")),
        );
        let worker = Arc::new(
            ScriptedAgent::worker(WorkerKind::Llm).with_fallback(AgentOutput::success("back").with_next("planner")),
        );
        let limits = Limits {
            max_duration_ms: Some(10),
            default_max_loops: 100,
            ..Default::default()
        };
        let (engine, _) = engine(
            ScriptedFactory::new()
                .with("planner", planner)
                .with("worker", worker.clone()),
        );
        let prepared = engine
            .prepare(ping_pong_workflow(limits, RetryPolicy::default()))
            .unwrap();
        let result = engine.run(&prepared, RunRequest::new("t")).await.unwrap();

        assert_eq!(result.status, RunStatus::Stopped);
        assert_eq!(result.error.as_deref(), Some("duration ceiling exceeded"));
        assert_eq!(worker.calls(), 0);
    }

    #[tokio::test]
    async fn exhausted_retries_end_in_error_with_last_message() {
        let planner = Arc::new(
            ScriptedAgent::orchestrator().then(AgentOutput::success("go").with_next("worker")),
        );
        let worker = Arc::new(
            ScriptedAgent::worker(WorkerKind::Llm)
                .then_err("connection reset")
                .then(AgentOutput::failure("model refused")),
        );
        let (engine, store) = engine(
            ScriptedFactory::new()
                .with("planner", planner)
                .with("worker", worker.clone()),
        );
        let prepared = engine
            .prepare(ping_pong_workflow(Limits::default(), RetryPolicy::fixed(1, 0)))
            .unwrap();
        let result = engine.run(&prepared, RunRequest::new("t")).await.unwrap();

        assert_eq!(result.status, RunStatus::Error);
        assert_eq!(result.error.as_deref(), Some("model refused"));
        assert_eq!(worker.calls(), 2);

        let trace = store.load(result.task_id.as_str()).unwrap().unwrap();
        let attempts: Vec<(String, u32)> = trace
            .steps
            .iter()
            .map(|s| (s.agent.clone(), s.attempt))
            .collect();
        assert_eq!(
            attempts,
            vec![
                ("planner".to_string(), 1),
                ("worker".to_string(), 1),
                ("worker".to_string(), 2)
            ]
        );
    }

    #[tokio::test]
    async fn no_payload_and_no_next_is_ok_with_empty_result() {
        let planner = Arc::new(ScriptedAgent::orchestrator().then(AgentOutput::success("nothing to do")));
        let (engine, _) = engine(
            ScriptedFactory::new()
                .with("planner", planner)
                .with("db_agent", Arc::new(ScriptedAgent::worker(WorkerKind::Database))),
        );
        let prepared = engine.prepare(planner_db_workflow()).unwrap();
        let result = engine.run(&prepared, RunRequest::new("t")).await.unwrap();
        assert_eq!(result.status, RunStatus::Ok);
        assert!(result.result.is_none());
    }

    #[tokio::test]
    async fn memory_isolation_between_agents() {
        let config = WorkflowConfig::new(vec![
            AgentSpec::orchestrator("planner"),
            AgentSpec::worker("db_agent", WorkerKind::Database),
            AgentSpec::worker("writer", WorkerKind::Llm),
        ])
        .with_route("planner", "db_agent")
        .with_route("db_agent", "writer")
        .with_global("tenant", json!("acme"));

        let planner = Arc::new(
            ScriptedAgent::orchestrator().then(AgentOutput::success("go").with_next("db_agent")),
        );
        let db = Arc::new(ScriptedAgent::worker(WorkerKind::Database).then(
            AgentOutput::success("rows")
                .with_payload(json!({"ssn": "123"}))
                .with_next("writer"),
        ));
        let writer = Arc::new(ScriptedAgent::worker(WorkerKind::Llm));
        let (engine, _) = engine(
            ScriptedFactory::new()
                .with("planner", planner)
                .with("db_agent", db)
                .with("writer", writer.clone()),
        );
        let prepared = engine.prepare(config).unwrap();
        let mut runtime = JsonMap::new();
        runtime.insert("user".into(), json!("bob"));
        engine
            .run(&prepared, RunRequest::new("t").with_memory(runtime))
            .await
            .unwrap();

        let (ctx, _) = writer.seen().remove(0);
        assert_eq!(ctx.memory["tenant"], "acme");
        assert_eq!(ctx.memory["user"], "bob");
        assert!(!ctx.memory.contains_key("ssn"));
    }

    #[tokio::test]
    async fn granted_namespace_is_visible() {
        let config = WorkflowConfig::new(vec![
            AgentSpec::orchestrator("planner").with_memory(MemoryPolicy::new(
                vec!["global".into(), "db_agent".into()],
                "planner",
            )),
            AgentSpec::worker("db_agent", WorkerKind::Database),
        ])
        .with_route("planner", "db_agent")
        .with_route("db_agent", "planner");

        let planner = Arc::new(
            ScriptedAgent::orchestrator()
                .then(AgentOutput::success("go").with_next("db_agent"))
                .then(AgentOutput::success("done")),
        );
        let db = Arc::new(ScriptedAgent::worker(WorkerKind::Database).then(
            AgentOutput::success("rows")
                .with_payload(json!({"count": 4}))
                .with_next("planner"),
        ));
        let (engine, _) = engine(
            ScriptedFactory::new()
                .with("planner", planner.clone())
                .with("db_agent", db),
        );
        let prepared = engine.prepare(config).unwrap();
        let result = engine.run(&prepared, RunRequest::new("t")).await.unwrap();
        assert_eq!(result.status, RunStatus::Ok);

        let seen = planner.seen();
        assert!(!seen[0].0.memory.contains_key("count"));
        assert_eq!(seen[1].0.memory["count"], 4);
        assert_eq!(seen[1].1.payload, Some(json!({"count": 4})));
    }

    #[tokio::test]
    async fn trace_is_persisted_after_every_step() {
        let planner = Arc::new(
            ScriptedAgent::orchestrator().then(AgentOutput::success("go").with_next("db_agent")),
        );
        let db = Arc::new(ScriptedAgent::worker(WorkerKind::Database));
        let (engine, store) = engine(
            ScriptedFactory::new()
                .with("planner", planner)
                .with("db_agent", db),
        );
        let prepared = engine.prepare(planner_db_workflow()).unwrap();
        let result = engine.run(&prepared, RunRequest::new("t")).await.unwrap();

        let counts: Vec<(usize, RunStatus)> = store
            .saves_of(&result.task_id)
            .iter()
            .map(|t| (t.steps.len(), t.status))
            .collect();
        assert_eq!(
            counts,
            vec![
                (0, RunStatus::Running),
                (1, RunStatus::Running),
                (2, RunStatus::Running),
                (2, RunStatus::Ok)
            ]
        );
    }

    #[tokio::test]
    async fn events_cover_the_run() {
        let planner = Arc::new(
            ScriptedAgent::orchestrator().then(AgentOutput::success("go").with_next("db_agent")),
        );
        let bus = Arc::new(EventBus::default());
        let mut rx = bus.subscribe();
        let store = Arc::new(MemoryTraceStore::new());
        let engine = Engine::new(
            Arc::new(
                ScriptedFactory::new()
                    .with("planner", planner)
                    .with("db_agent", Arc::new(ScriptedAgent::worker(WorkerKind::Database))),
            ),
            store,
        )
        .with_events(bus);
        let prepared = engine.prepare(planner_db_workflow()).unwrap();
        engine.run(&prepared, RunRequest::new("t")).await.unwrap();

        let mut kinds = Vec::new();
        while let Ok(event) = rx.try_recv() {
            kinds.push(match event {
                EngineEvent::RunStarted { .. } => "started",
                EngineEvent::AttemptStarted { .. } => "attempt",
                EngineEvent::StepRecorded { .. } => "step",
                EngineEvent::Routed { .. } => "routed",
                EngineEvent::RunFinished { .. } => "finished",
                _ => "other",
            });
        }
        assert_eq!(
            kinds,
            vec!["started", "attempt", "step", "routed", "attempt", "step", "finished"]
        );
    }

    #[tokio::test]
    async fn entry_with_zero_loops_stops_immediately() {
        let planner = Arc::new(ScriptedAgent::orchestrator());
        let mut config = planner_db_workflow();
        config.agents[0].max_loops = Some(0);
        let (engine, _) = engine(
            ScriptedFactory::new()
                .with("planner", planner.clone())
                .with("db_agent", Arc::new(ScriptedAgent::worker(WorkerKind::Database))),
        );
        let prepared = engine.prepare(config).unwrap();
        let result = engine.run(&prepared, RunRequest::new("t")).await.unwrap();
        assert_eq!(result.status, RunStatus::Stopped);
        assert_eq!(planner.calls(), 0);
    }

    #[tokio::test]
    async fn concurrent_runs_are_independent() {
        let planner = Arc::new(
            ScriptedAgent::orchestrator().with_fallback(AgentOutput::success("go").with_next("db_agent")),
        );
        let db = Arc::new(
            ScriptedAgent::worker(WorkerKind::Database)
                .with_delay(Duration::from_millis(5))
                .with_fallback(AgentOutput::success("rows").with_cost(0.1)),
        );
        let (engine, store) = engine(
            ScriptedFactory::new()
                .with("planner", planner)
                .with("db_agent", db),
        );
        let engine = Arc::new(engine);
        let prepared = Arc::new(engine.prepare(planner_db_workflow()).unwrap());

        let mut handles = Vec::new();
        for i in 0..4 {
            let engine = engine.clone();
            let prepared = prepared.clone();
            handles.push(tokio::spawn(async move {
                engine
                    .run(&prepared, RunRequest::new(format!("task {}", i)))
                    .await
                    .unwrap()
            }));
        }
        let mut ids = Vec::new();
        for handle in handles {
            let result = handle.await.unwrap();
            assert_eq!(result.status, RunStatus::Ok);
            assert!((result.totals.cost - 0.1).abs() < 1e-9);
            ids.push(result.task_id);
        }
        ids.sort_by(|a, b| a.0.cmp(&b.0));
        ids.dedup();
        assert_eq!(ids.len(), 4);
        for id in &ids {
            assert_eq!(store.load(id.as_str()).unwrap().unwrap().steps.len(), 2);
        }
    }
}

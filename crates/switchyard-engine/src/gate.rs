use std::sync::Arc;

use tracing::warn;

use switchyard_core::event::EventBus;
use switchyard_core::guardrail::{Guardrails, Violation};
use switchyard_core::types::{AgentInput, EngineEvent, TaskId};

use crate::registry::ResolvedAgent;

/// Sits between the retry controller and the handler.
///
/// Asks the handler what it intends to do and runs the guardrail registered
/// for its kind. A refused action never reaches the handler.
pub struct GuardrailGate {
    guardrails: Guardrails,
    event_bus: Option<Arc<EventBus>>,
}

impl GuardrailGate {
    pub fn new(guardrails: Guardrails, event_bus: Option<Arc<EventBus>>) -> Self {
        Self {
            guardrails,
            event_bus,
        }
    }

    /// `Some` when the attempt must not run.
    pub fn check(
        &self,
        task_id: &TaskId,
        agent: &ResolvedAgent,
        input: &AgentInput,
    ) -> Option<Violation> {
        let action = agent.handler.proposed_action(input)?;
        let violation =
            self.guardrails
                .check(agent.kind, &action, &agent.spec.policy.guardrails)?;

        warn!(
            task_id = %task_id,
            agent = %agent.spec.name,
            rule = %violation.rule,
            action = %action.summary(),
            reason = %violation.reason,
            "Guardrail blocked action"
        );
        if let Some(ref bus) = self.event_bus {
            bus.publish(EngineEvent::GuardrailBlocked {
                task_id: task_id.clone(),
                agent: agent.spec.name.clone(),
                violation: violation.clone(),
            });
        }
        Some(violation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use switchyard_core::guardrail::{GuardrailPolicy, ProposedAction};
    use switchyard_core::workflow::{AgentKind, AgentSpec, WorkerKind};
    use switchyard_test_utils::ScriptedAgent;

    fn db_agent(action: Option<ProposedAction>) -> ResolvedAgent {
        let mut handler = ScriptedAgent::worker(WorkerKind::Database);
        if let Some(action) = action {
            handler = handler.with_action(action);
        }
        ResolvedAgent {
            spec: AgentSpec::worker("db_agent", WorkerKind::Database).with_guardrails(
                GuardrailPolicy {
                    allowed_operations: Some(vec!["SELECT".into()]),
                    ..Default::default()
                },
            ),
            kind: AgentKind::Worker(WorkerKind::Database),
            handler: Arc::new(handler),
        }
    }

    #[tokio::test]
    async fn blocked_action_is_published() {
        let bus = Arc::new(EventBus::default());
        let mut rx = bus.subscribe();
        let gate = GuardrailGate::new(Guardrails::standard(), Some(bus.clone()));
        let agent = db_agent(Some(ProposedAction::sql("DELETE FROM users WHERE id = 1")));

        let violation = gate
            .check(&TaskId::from_str("t"), &agent, &AgentInput::new("x"))
            .unwrap();
        assert_eq!(violation.rule, "sql.operation");

        match rx.recv().await.unwrap() {
            EngineEvent::GuardrailBlocked { agent, .. } => assert_eq!(agent, "db_agent"),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn no_proposed_action_passes() {
        let gate = GuardrailGate::new(Guardrails::standard(), None);
        assert!(gate
            .check(&TaskId::new(), &db_agent(None), &AgentInput::new("x"))
            .is_none());
    }

    #[test]
    fn allowed_action_passes() {
        let gate = GuardrailGate::new(Guardrails::standard(), None);
        let agent = db_agent(Some(ProposedAction::sql("SELECT * FROM users")));
        assert!(gate
            .check(&TaskId::new(), &agent, &AgentInput::new("x"))
            .is_none());
    }
}

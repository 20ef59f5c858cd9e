use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use switchyard_core::error::{ConfigError, Result};
use switchyard_core::traits::{AgentHandler, HandlerFactory};
use switchyard_core::workflow::{AgentKind, AgentSpec, WorkflowConfig};

/// A declared agent bound to its handler.
#[derive(Clone)]
pub struct ResolvedAgent {
    pub spec: AgentSpec,
    pub kind: AgentKind,
    pub handler: Arc<dyn AgentHandler>,
}

impl std::fmt::Debug for ResolvedAgent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolvedAgent")
            .field("name", &self.spec.name)
            .field("kind", &self.kind)
            .finish()
    }
}

/// Typed agent registry, resolved once per prepared workflow and read-only afterwards.
#[derive(Debug, Clone, Default)]
pub struct AgentRegistry {
    agents: HashMap<String, ResolvedAgent>,
}

impl AgentRegistry {
    /// Build a handler for every declared agent.
    ///
    /// Fails if a worker has no kind or if the factory returns a handler
    /// whose kind differs from the declaration.
    pub fn resolve(workflow: &WorkflowConfig, factory: &dyn HandlerFactory) -> Result<Self> {
        let mut agents = HashMap::with_capacity(workflow.agents.len());
        for spec in &workflow.agents {
            let kind = spec
                .agent_kind()
                .ok_or_else(|| ConfigError::MissingWorkerKind(spec.name.clone()))?;
            let handler = factory.build(spec, workflow)?;
            if handler.kind() != kind {
                return Err(ConfigError::UnsupportedAgent {
                    agent: spec.name.clone(),
                    kind: format!("{} (handler is {})", kind, handler.kind()),
                }
                .into());
            }
            debug!(agent = %spec.name, kind = %kind, "Resolved agent handler");
            agents.insert(
                spec.name.clone(),
                ResolvedAgent {
                    spec: spec.clone(),
                    kind,
                    handler,
                },
            );
        }
        Ok(Self { agents })
    }

    pub fn get(&self, name: &str) -> Option<&ResolvedAgent> {
        self.agents.get(name)
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }
}

use std::sync::Arc;

use tracing::debug;

use switchyard_core::config::AppConfig;
use switchyard_core::error::{ConfigError, Result};
use switchyard_core::traits::{AgentHandler, HandlerFactory};
use switchyard_core::workflow::{AgentKind, AgentSpec, WorkerKind, WorkflowConfig};

use crate::builtin::{ApiWorker, DatabaseWorker, LlmAgent};

/// Maps each declared agent kind to its built-in handler.
///
/// Orchestrators and LLM workers get an [`LlmAgent`], database workers a
/// [`DatabaseWorker`], API workers an [`ApiWorker`].
pub struct BuiltinFactory {
    config: AppConfig,
}

impl BuiltinFactory {
    pub fn new(config: AppConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }
}

impl HandlerFactory for BuiltinFactory {
    fn build(&self, spec: &AgentSpec, workflow: &WorkflowConfig) -> Result<Arc<dyn AgentHandler>> {
        let kind = spec
            .agent_kind()
            .ok_or_else(|| ConfigError::MissingWorkerKind(spec.name.clone()))?;
        debug!(agent = %spec.name, kind = %kind, "Building built-in handler");

        let handler: Arc<dyn AgentHandler> = match kind {
            AgentKind::Orchestrator | AgentKind::Worker(WorkerKind::Llm) => {
                Arc::new(LlmAgent::from_spec(spec, kind, &self.config.llm)?)
            }
            AgentKind::Worker(WorkerKind::Database) => {
                Arc::new(DatabaseWorker::from_spec(spec, workflow)?)
            }
            AgentKind::Worker(WorkerKind::Api) => {
                Arc::new(ApiWorker::from_spec(spec, workflow, &self.config.http))
            }
        };
        Ok(handler)
    }
}

pub mod config;
pub mod error;
pub mod event;
pub mod guardrail;
pub mod memory;
pub mod traits;
pub mod types;
pub mod workflow;

pub use config::AppConfig;
pub use error::{ConfigError, EngineError, Result};
pub use event::EventBus;
pub use guardrail::{GuardrailPolicy, Guardrails, ProposedAction, Violation};
pub use memory::MemoryContext;
pub use traits::{AgentHandler, HandlerFactory, TraceStore};
pub use types::*;
pub use workflow::{AgentKind, AgentSpec, WorkerKind, WorkflowConfig};

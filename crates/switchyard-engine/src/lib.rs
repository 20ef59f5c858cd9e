//! Switchyard execution engine: the orchestration loop and everything it drives.

pub mod engine;
pub mod gate;
pub mod recorder;
pub mod registry;
pub mod replay;
pub mod retry;
pub mod run_log;

pub use engine::{Engine, PreparedWorkflow};
pub use gate::GuardrailGate;
pub use recorder::TraceRecorder;
pub use registry::{AgentRegistry, ResolvedAgent};
pub use replay::{routing_sequence, ReplayComparison};
pub use retry::{backoff_delay, RetryController, StepOutcome};
pub use run_log::RunLogger;

//! Built-in agent handlers and the factory that wires them to declared agents.

pub mod builtin;
pub mod factory;

pub use builtin::{ApiWorker, DatabaseWorker, LlmAgent};
pub use factory::BuiltinFactory;

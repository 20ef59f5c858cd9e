pub mod api;
pub mod database;
pub mod llm;

pub use api::ApiWorker;
pub use database::DatabaseWorker;
pub use llm::LlmAgent;

use switchyard_core::workflow::{AgentSpec, WorkflowConfig};

/// Where a worker hands control after a successful call: `settings.next`,
/// else its only permitted route. Workers with several routes and no
/// `next` setting complete the task.
pub(crate) fn return_route(spec: &AgentSpec, workflow: &WorkflowConfig) -> Option<String> {
    if let Some(next) = spec.setting_str("next") {
        return Some(next.to_string());
    }
    match workflow.routes.get(&spec.name) {
        Some(route) if route.can_call.len() == 1 => route.can_call.first().cloned(),
        _ => None,
    }
}

/// Truncate on a char boundary, marking the cut.
pub(crate) fn truncate(s: &str, max_len: usize) -> String {
    if s.len() <= max_len {
        return s.to_string();
    }
    let mut end = max_len;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}\n\n[truncated at {} bytes]", &s[..end], max_len)
}

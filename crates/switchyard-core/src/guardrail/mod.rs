//! Guardrail evaluators: policy checks that run before a worker's side effect.
//!
//! Each worker kind that touches the outside world owns one evaluator. The
//! engine asks a handler what it intends to do ([`ProposedAction`]), looks up
//! the evaluator for the handler's kind in [`Guardrails`], and refuses the
//! attempt when a [`Violation`] comes back. Evaluation is pure: the same action
//! and policy always produce the same answer.

mod http;
mod sql;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::workflow::{AgentKind, WorkerKind};

pub use http::{is_blocked_hostname, is_blocked_ip, private_address_violation, HttpGuardrail};
pub use sql::SqlGuardrail;

/// Guardrail configuration for one agent. Every field is optional; which ones
/// are allowed depends on the agent's worker kind.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GuardrailPolicy {
    /// SQL verbs the statement may start with. Unset means any verb.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed_operations: Option<Vec<String>>,
    /// Tables the statement may reference. Unset means any table.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed_tables: Option<Vec<String>>,
    /// UPDATE and DELETE must carry a WHERE clause.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub require_where: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed_domains: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed_methods: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_private_ips: Option<bool>,
}

impl GuardrailPolicy {
    /// Names of the SQL fields that are set.
    pub fn set_sql_fields(&self) -> Vec<&'static str> {
        let mut fields = Vec::new();
        if self.allowed_operations.is_some() {
            fields.push("allowed_operations");
        }
        if self.allowed_tables.is_some() {
            fields.push("allowed_tables");
        }
        if self.require_where.is_some() {
            fields.push("require_where");
        }
        fields
    }

    /// Names of the HTTP fields that are set.
    pub fn set_http_fields(&self) -> Vec<&'static str> {
        let mut fields = Vec::new();
        if self.allowed_domains.is_some() {
            fields.push("allowed_domains");
        }
        if self.allowed_methods.is_some() {
            fields.push("allowed_methods");
        }
        if self.block_private_ips.is_some() {
            fields.push("block_private_ips");
        }
        fields
    }

    pub fn set_fields(&self) -> Vec<&'static str> {
        let mut fields = self.set_sql_fields();
        fields.extend(self.set_http_fields());
        fields
    }

    pub fn is_empty(&self) -> bool {
        self.set_fields().is_empty()
    }
}

/// A side effect a worker intends to perform.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ProposedAction {
    Sql { text: String },
    Http { url: String, method: String },
}

impl ProposedAction {
    pub fn sql(text: impl Into<String>) -> Self {
        Self::Sql { text: text.into() }
    }

    pub fn http(url: impl Into<String>, method: impl Into<String>) -> Self {
        Self::Http {
            url: url.into(),
            method: method.into(),
        }
    }

    /// Short description for logs.
    pub fn summary(&self) -> String {
        match self {
            Self::Sql { text } => truncate(text, 120),
            Self::Http { url, method } => format!("{} {}", method.to_uppercase(), url),
        }
    }
}

/// Structured refusal returned by an evaluator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Violation {
    /// Machine-readable rule name, e.g. `sql.operation` or `http.private_ip`.
    pub rule: String,
    pub reason: String,
    /// The value that tripped the rule.
    pub offending: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggestion: Option<String>,
}

impl Violation {
    pub fn new(
        rule: impl Into<String>,
        reason: impl Into<String>,
        offending: impl Into<String>,
    ) -> Self {
        Self {
            rule: rule.into(),
            reason: reason.into(),
            offending: offending.into(),
            suggestion: None,
        }
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestion = Some(suggestion.into());
        self
    }
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}]", self.reason, self.rule)?;
        if let Some(ref suggestion) = self.suggestion {
            write!(f, " (suggestion: {})", suggestion)?;
        }
        Ok(())
    }
}

/// A kind-specific policy check.
pub trait GuardrailEvaluator: Send + Sync {
    fn name(&self) -> &str;

    /// `None` means the action may proceed.
    fn evaluate(&self, action: &ProposedAction, policy: &GuardrailPolicy) -> Option<Violation>;
}

/// Evaluators keyed by worker kind.
#[derive(Clone, Default)]
pub struct Guardrails {
    evaluators: HashMap<WorkerKind, Arc<dyn GuardrailEvaluator>>,
}

impl Guardrails {
    pub fn new() -> Self {
        Self::default()
    }

    /// Database workers get the SQL guardrail, API workers the HTTP guardrail.
    pub fn standard() -> Self {
        let mut guardrails = Self::new();
        guardrails.register(WorkerKind::Database, Arc::new(SqlGuardrail::new()));
        guardrails.register(WorkerKind::Api, Arc::new(HttpGuardrail::new()));
        guardrails
    }

    pub fn register(&mut self, kind: WorkerKind, evaluator: Arc<dyn GuardrailEvaluator>) {
        self.evaluators.insert(kind, evaluator);
    }

    pub fn evaluator(&self, kind: AgentKind) -> Option<&Arc<dyn GuardrailEvaluator>> {
        match kind {
            AgentKind::Worker(worker) => self.evaluators.get(&worker),
            AgentKind::Orchestrator => None,
        }
    }

    /// Evaluate `action` with the evaluator registered for `kind`.
    /// Kinds without an evaluator always pass.
    pub fn check(
        &self,
        kind: AgentKind,
        action: &ProposedAction,
        policy: &GuardrailPolicy,
    ) -> Option<Violation> {
        self.evaluator(kind)?.evaluate(action, policy)
    }
}

impl fmt::Debug for Guardrails {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut kinds: Vec<String> = self.evaluators.keys().map(|k| k.to_string()).collect();
        kinds.sort();
        f.debug_struct("Guardrails").field("kinds", &kinds).finish()
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let cut: String = s.chars().take(max).collect();
        format!("{}...", cut)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn db_policy() -> GuardrailPolicy {
        GuardrailPolicy {
            allowed_operations: Some(vec!["SELECT".into()]),
            require_where: Some(true),
            ..Default::default()
        }
    }

    #[test]
    fn standard_registry_dispatches_by_kind() {
        let guardrails = Guardrails::standard();
        let db = AgentKind::Worker(WorkerKind::Database);
        let violation = guardrails
            .check(db, &ProposedAction::sql("DELETE FROM users"), &db_policy())
            .unwrap();
        assert!(violation.reason.contains("DELETE"));

        let api = AgentKind::Worker(WorkerKind::Api);
        let policy = GuardrailPolicy {
            block_private_ips: Some(true),
            ..Default::default()
        };
        assert!(guardrails
            .check(api, &ProposedAction::http("http://127.0.0.1/", "GET"), &policy)
            .is_some());
    }

    #[test]
    fn kinds_without_evaluator_pass() {
        let guardrails = Guardrails::standard();
        assert!(guardrails
            .check(
                AgentKind::Orchestrator,
                &ProposedAction::sql("DROP TABLE users"),
                &GuardrailPolicy::default(),
            )
            .is_none());
        assert!(guardrails
            .check(
                AgentKind::Worker(WorkerKind::Llm),
                &ProposedAction::sql("DROP TABLE users"),
                &GuardrailPolicy::default(),
            )
            .is_none());
    }

    #[test]
    fn set_field_listing() {
        let policy = GuardrailPolicy {
            allowed_tables: Some(vec![]),
            allowed_methods: Some(vec!["GET".into()]),
            ..Default::default()
        };
        assert_eq!(policy.set_sql_fields(), vec!["allowed_tables"]);
        assert_eq!(policy.set_http_fields(), vec!["allowed_methods"]);
        assert!(!policy.is_empty());
        assert!(GuardrailPolicy::default().is_empty());
    }

    #[test]
    fn violation_display() {
        let v = Violation::new("sql.where", "WHERE required", "DELETE FROM users")
            .with_suggestion("add a WHERE clause");
        assert_eq!(
            v.to_string(),
            "WHERE required [sql.where] (suggestion: add a WHERE clause)"
        );
    }

    #[test]
    fn action_summary() {
        assert_eq!(
            ProposedAction::http("https://example.com", "post").summary(),
            "POST https://example.com"
        );
        let long = "SELECT ".repeat(40);
        assert!(ProposedAction::sql(long).summary().ends_with("..."));
    }
}

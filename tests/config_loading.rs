use std::io::Write;

use switchyard_core::config::AppConfig;
use switchyard_core::error::ConfigError;
use switchyard_core::workflow::{AgentKind, BackoffStrategy, WorkerKind, WorkflowConfig};

const WORKFLOW_TOML: &str = r#"
entry = "planner"

[workflow]
id = "wf-orders"
organization = "acme"

[limits]
max_cost = 0.5
max_duration_ms = 30000
default_max_loops = 4

[memory.global]
region = "eu"

[routes.planner]
can_call = ["db_agent", "fetcher"]

[routes.db_agent]
can_call = ["planner"]

[[agents]]
name = "planner"
kind = "orchestrator"

[[agents]]
name = "db_agent"
kind = "worker"
worker = "database"
max_loops = 2

[agents.settings]
database = ":memory:"

[agents.policy.retries]
count = 2
backoff_ms = 100
strategy = "exponential"

[agents.policy.guardrails]
allowed_operations = ["SELECT"]
allowed_tables = ["orders"]
require_where = true

[agents.policy.memory]
read_from = ["global", "planner"]
write_to = "orders"

[[agents]]
name = "fetcher"
kind = "worker"
worker = "api"

[agents.policy.guardrails]
allowed_domains = ["api.example.com"]
allowed_methods = ["GET"]
block_private_ips = true
"#;

fn write_temp(content: &str, suffix: &str) -> tempfile::NamedTempFile {
    let mut tmp = tempfile::Builder::new()
        .suffix(suffix)
        .tempfile()
        .expect("create temp file");
    tmp.write_all(content.as_bytes()).expect("write temp file");
    tmp
}

#[test]
fn test_load_settings_from_file() {
    let toml_content = r#"
workspace = "/tmp/switchyard-test"

[store]
path = "/tmp/switchyard-test/custom.db"

[log]
enabled = false
level = 3

[llm]
provider = "ollama"
model_id = "llama3"
cost_per_1k_input = 0.5
cost_per_1k_output = 1.5

[http]
timeout_secs = 5
max_redirects = 2
"#;
    let tmp = write_temp(toml_content, ".toml");
    let config = AppConfig::load(tmp.path()).expect("load settings");

    assert_eq!(config.workspace, "/tmp/switchyard-test");
    assert_eq!(
        config.store_path().to_str(),
        Some("/tmp/switchyard-test/custom.db")
    );
    assert!(!config.log.enabled);
    assert_eq!(config.log.level, 3);
    assert_eq!(
        config.log_dir().to_str(),
        Some("/tmp/switchyard-test/logs")
    );
    assert_eq!(config.llm.endpoint(), "http://localhost:11434/v1/chat/completions");
    assert!((config.llm.cost(1000, 2000) - 3.5).abs() < 1e-9);
    assert_eq!(config.http.timeout_secs, 5);
    assert_eq!(config.http.max_redirects, 2);
}

#[test]
fn test_settings_expand_env_vars() {
    std::env::set_var("SWITCHYARD_TEST_LLM_KEY", "sk-from-env");
    let tmp = write_temp(
        "[llm]\napi_key = \"${SWITCHYARD_TEST_LLM_KEY}\"\n",
        ".toml",
    );
    let config = AppConfig::load(tmp.path()).expect("load settings");
    assert_eq!(config.llm.api_key.as_deref(), Some("sk-from-env"));
    std::env::remove_var("SWITCHYARD_TEST_LLM_KEY");
}

#[test]
fn test_missing_settings_file_is_not_found() {
    let err = AppConfig::load(std::path::Path::new("/nonexistent/switchyard.toml")).unwrap_err();
    assert!(matches!(err, ConfigError::NotFound(_)));
}

#[test]
fn test_load_workflow_toml() {
    let tmp = write_temp(WORKFLOW_TOML, ".toml");
    let config = WorkflowConfig::load(tmp.path()).expect("load workflow");

    assert_eq!(config.workflow.id.as_deref(), Some("wf-orders"));
    assert_eq!(config.entry_agent().map(|a| a.name.as_str()), Some("planner"));
    assert!(config.can_call("planner", "fetcher"));
    assert!(!config.can_call("fetcher", "planner"));
    assert_eq!(config.max_loops_for("db_agent"), 2);
    assert_eq!(config.max_loops_for("fetcher"), 4);
    assert_eq!(config.limits.max_cost, Some(0.5));
    assert_eq!(config.memory.global.get("region"), Some(&serde_json::json!("eu")));

    let db = config.agent("db_agent").unwrap();
    assert_eq!(db.agent_kind(), Some(AgentKind::Worker(WorkerKind::Database)));
    assert_eq!(db.policy.retries.count, 2);
    assert_eq!(db.policy.retries.strategy, BackoffStrategy::Exponential);
    assert!(db.policy.retries.retry_on_violation);
    assert_eq!(db.setting_str("database"), Some(":memory:"));
    assert_eq!(config.read_namespaces("db_agent"), vec!["global", "planner"]);
    assert_eq!(config.write_namespace("db_agent"), "orders");

    // Unset grants fall back to the defaults
    assert_eq!(config.read_namespaces("fetcher"), vec!["global"]);
    assert_eq!(config.write_namespace("fetcher"), "fetcher");
}

#[test]
fn test_load_workflow_json_matches_toml() {
    let toml_config = WorkflowConfig::from_toml_str(WORKFLOW_TOML).expect("parse toml");
    let json = serde_json::to_string(&toml_config).expect("serialize");
    let tmp = write_temp(&json, ".json");
    let json_config = WorkflowConfig::load(tmp.path()).expect("load json workflow");
    assert_eq!(json_config, toml_config);
}

#[test]
fn test_workflow_with_sql_fields_on_api_worker_is_rejected() {
    let raw = r#"
[[agents]]
name = "planner"
kind = "orchestrator"

[[agents]]
name = "fetcher"
kind = "worker"
worker = "api"

[agents.policy.guardrails]
allowed_tables = ["users"]
"#;
    let err = WorkflowConfig::from_toml_str(raw).unwrap_err();
    assert!(matches!(err, ConfigError::InvalidGuardrail { ref field, .. } if field == "allowed_tables"));
}

#[test]
fn test_workflow_with_unknown_route_target_is_rejected() {
    let raw = r#"
[[agents]]
name = "planner"
kind = "orchestrator"

[routes.planner]
can_call = ["ghost"]
"#;
    let err = WorkflowConfig::from_toml_str(raw).unwrap_err();
    assert!(matches!(err, ConfigError::UnknownRouteTarget { ref to, .. } if to == "ghost"));
}

#[test]
fn test_workflow_unknown_field_is_a_parse_error() {
    let raw = r#"
[[agents]]
name = "planner"
kind = "orchestrator"
colour = "blue"
"#;
    assert!(matches!(
        WorkflowConfig::from_toml_str(raw),
        Err(ConfigError::Parse(_))
    ));
}

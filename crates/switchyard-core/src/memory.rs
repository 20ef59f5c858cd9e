use std::collections::BTreeMap;

use serde_json::Value;

use crate::types::JsonMap;
use crate::workflow::{WorkflowConfig, GLOBAL_NAMESPACE};

/// Namespaced shared memory for one run.
///
/// Owned by the orchestration loop for the lifetime of a run and discarded
/// afterwards. Keys are added or overwritten, never removed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MemoryContext {
    namespaces: BTreeMap<String, JsonMap>,
}

impl MemoryContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the initial context: the workflow seed under `global`, with the
    /// caller's runtime memory merged over it.
    pub fn seed(global: &JsonMap, runtime: Option<&JsonMap>) -> Self {
        let mut merged = global.clone();
        if let Some(runtime) = runtime {
            for (key, value) in runtime {
                merged.insert(key.clone(), value.clone());
            }
        }
        let mut namespaces = BTreeMap::new();
        namespaces.insert(GLOBAL_NAMESPACE.to_string(), merged);
        Self { namespaces }
    }

    /// Merged view of `namespaces`, in order. Later namespaces win on key collisions.
    /// Namespaces that do not exist contribute nothing.
    pub fn read(&self, namespaces: &[String]) -> JsonMap {
        let mut view = JsonMap::new();
        for name in namespaces {
            if let Some(values) = self.namespaces.get(name) {
                for (key, value) in values {
                    view.insert(key.clone(), value.clone());
                }
            }
        }
        view
    }

    /// Read-view for `agent` according to its memory grants.
    pub fn read_for(&self, workflow: &WorkflowConfig, agent: &str) -> JsonMap {
        self.read(&workflow.read_namespaces(agent))
    }

    /// Merge `payload` into `namespace`. Objects merge key by key; any other
    /// non-null value is stored under `value`.
    pub fn write(&mut self, namespace: &str, payload: &Value) {
        let target = self.namespaces.entry(namespace.to_string()).or_default();
        match payload {
            Value::Null => {}
            Value::Object(map) => {
                for (key, value) in map {
                    target.insert(key.clone(), value.clone());
                }
            }
            other => {
                target.insert("value".to_string(), other.clone());
            }
        }
    }

    /// Merge `payload` into the namespace `agent` writes to.
    pub fn write_for(&mut self, workflow: &WorkflowConfig, agent: &str, payload: &Value) {
        let namespace = workflow.write_namespace(agent);
        self.write(&namespace, payload);
    }

    pub fn get(&self, namespace: &str) -> Option<&JsonMap> {
        self.namespaces.get(namespace)
    }

    pub fn namespaces(&self) -> Vec<String> {
        self.namespaces.keys().cloned().collect()
    }

    /// Whole context as `{namespace: {key: value}}`.
    pub fn snapshot(&self) -> Value {
        let map: JsonMap = self
            .namespaces
            .iter()
            .map(|(name, values)| (name.clone(), Value::Object(values.clone())))
            .collect();
        Value::Object(map)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::workflow::{AgentSpec, MemoryPolicy, WorkerKind};

    fn map(value: Value) -> JsonMap {
        match value {
            Value::Object(map) => map,
            _ => panic!("not an object"),
        }
    }

    #[test]
    fn runtime_memory_wins_over_seed() {
        let seed = map(json!({"tenant": "acme", "region": "eu"}));
        let runtime = map(json!({"region": "us", "user": 7}));
        let memory = MemoryContext::seed(&seed, Some(&runtime));
        let global = memory.get("global").unwrap();
        assert_eq!(global["tenant"], "acme");
        assert_eq!(global["region"], "us");
        assert_eq!(global["user"], 7);
        assert_eq!(memory.namespaces(), vec!["global"]);
    }

    #[test]
    fn writes_merge_and_never_delete() {
        let mut memory = MemoryContext::new();
        memory.write("db", &json!({"rows": 2, "table": "users"}));
        memory.write("db", &json!({"rows": 5}));
        memory.write("db", &Value::Null);
        let db = memory.get("db").unwrap();
        assert_eq!(db["rows"], 5);
        assert_eq!(db["table"], "users");

        memory.write("db", &json!([1, 2]));
        assert_eq!(memory.get("db").unwrap()["value"], json!([1, 2]));
        assert_eq!(memory.get("db").unwrap()["table"], "users");
    }

    #[test]
    fn read_merges_in_grant_order() {
        let mut memory = MemoryContext::seed(&map(json!({"k": "global"})), None);
        memory.write("a", &json!({"k": "a", "only_a": true}));
        let view = memory.read(&["global".to_string(), "a".to_string()]);
        assert_eq!(view["k"], "a");
        assert_eq!(view["only_a"], true);

        let view = memory.read(&["a".to_string(), "global".to_string()]);
        assert_eq!(view["k"], "global");
    }

    #[test]
    fn agents_only_see_granted_namespaces() {
        let workflow = WorkflowConfig::new(vec![
            AgentSpec::orchestrator("planner"),
            AgentSpec::worker("db_agent", WorkerKind::Database),
            AgentSpec::worker("reporter", WorkerKind::Llm).with_memory(MemoryPolicy::new(
                vec!["global".into(), "db_agent".into()],
                "report",
            )),
        ])
        .validated()
        .unwrap();

        let mut memory = MemoryContext::seed(&map(json!({"tenant": "acme"})), None);
        memory.write_for(&workflow, "db_agent", &json!({"secret_rows": 3}));

        let planner_view = memory.read_for(&workflow, "planner");
        assert_eq!(planner_view["tenant"], "acme");
        assert!(!planner_view.contains_key("secret_rows"));

        let reporter_view = memory.read_for(&workflow, "reporter");
        assert_eq!(reporter_view["secret_rows"], 3);

        memory.write_for(&workflow, "reporter", &json!({"summary": "ok"}));
        assert!(memory.get("report").is_some());
        assert!(!memory.read_for(&workflow, "db_agent").contains_key("summary"));
    }

    #[test]
    fn snapshot_lists_every_namespace() {
        let mut memory = MemoryContext::seed(&JsonMap::new(), None);
        memory.write("x", &json!({"a": 1}));
        assert_eq!(memory.snapshot(), json!({"global": {}, "x": {"a": 1}}));
    }
}

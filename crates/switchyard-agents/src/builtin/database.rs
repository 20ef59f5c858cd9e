use std::path::Path;
use std::sync::Mutex;

use base64::Engine as _;
use futures::future::BoxFuture;
use rusqlite::types::ValueRef;
use rusqlite::Connection;
use serde_json::{json, Value};
use tracing::debug;

use switchyard_core::error::{EngineError, Result};
use switchyard_core::guardrail::{GuardrailPolicy, ProposedAction, SqlGuardrail};
use switchyard_core::traits::AgentHandler;
use switchyard_core::types::{AgentContext, AgentInput, AgentOutput};
use switchyard_core::workflow::{AgentKind, AgentSpec, WorkerKind, WorkflowConfig};

use super::return_route;

const DEFAULT_MAX_ROWS: usize = 1000;

/// Database worker backed by SQLite.
///
/// Runs the SQL in `payload.sql`, or the input message when there is none.
/// The guardrail is checked again right before the connection is touched.
pub struct DatabaseWorker {
    name: String,
    conn: Mutex<Connection>,
    policy: GuardrailPolicy,
    guardrail: SqlGuardrail,
    max_rows: usize,
    next: Option<String>,
}

impl DatabaseWorker {
    /// Build from the agent's settings: `database` (path, default in-memory)
    /// and `max_rows`.
    pub fn from_spec(spec: &AgentSpec, workflow: &WorkflowConfig) -> Result<Self> {
        let conn = match spec.setting_str("database") {
            Some(path) if path != ":memory:" => open_file(Path::new(path))?,
            _ => Connection::open_in_memory().map_err(|e| EngineError::Database(e.to_string()))?,
        };
        Ok(Self {
            name: spec.name.clone(),
            conn: Mutex::new(conn),
            policy: spec.policy.guardrails.clone(),
            guardrail: SqlGuardrail::new(),
            max_rows: spec
                .setting_u64("max_rows")
                .map(|n| n as usize)
                .unwrap_or(DEFAULT_MAX_ROWS),
            next: return_route(spec, workflow),
        })
    }

    fn sql_of(input: &AgentInput) -> String {
        input
            .payload_str("sql")
            .unwrap_or(&input.message)
            .trim()
            .to_string()
    }

    fn execute(&self, sql: &str) -> Result<Value> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| EngineError::Database(format!("connection lock poisoned: {}", e)))?;
        let mut stmt = conn
            .prepare(sql)
            .map_err(|e| EngineError::Database(e.to_string()))?;

        if stmt.column_count() == 0 {
            let affected = stmt
                .execute([])
                .map_err(|e| EngineError::Database(e.to_string()))?;
            return Ok(json!({ "rows_affected": affected }));
        }

        let columns: Vec<String> = stmt.column_names().iter().map(|c| c.to_string()).collect();
        let mut rows = stmt
            .query([])
            .map_err(|e| EngineError::Database(e.to_string()))?;
        let mut out = Vec::new();
        let mut truncated = false;
        while let Some(row) = rows.next().map_err(|e| EngineError::Database(e.to_string()))? {
            if out.len() >= self.max_rows {
                truncated = true;
                break;
            }
            let mut object = serde_json::Map::with_capacity(columns.len());
            for (i, column) in columns.iter().enumerate() {
                let value = row
                    .get_ref(i)
                    .map_err(|e| EngineError::Database(e.to_string()))?;
                object.insert(column.clone(), to_json(value));
            }
            out.push(Value::Object(object));
        }
        Ok(json!({ "columns": columns, "rows": out, "truncated": truncated }))
    }
}

fn open_file(path: &Path) -> Result<Connection> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .map_err(|e| EngineError::Database(format!("Failed to create db directory: {}", e)))?;
        }
    }
    Connection::open(path).map_err(|e| EngineError::Database(e.to_string()))
}

fn to_json(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => json!(i),
        ValueRef::Real(f) => json!(f),
        ValueRef::Text(t) => Value::String(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => Value::String(base64::engine::general_purpose::STANDARD.encode(b)),
    }
}

impl AgentHandler for DatabaseWorker {
    fn kind(&self) -> AgentKind {
        AgentKind::Worker(WorkerKind::Database)
    }

    fn proposed_action(&self, input: &AgentInput) -> Option<ProposedAction> {
        Some(ProposedAction::sql(Self::sql_of(input)))
    }

    fn handle(&self, ctx: AgentContext, input: AgentInput) -> BoxFuture<'_, Result<AgentOutput>> {
        Box::pin(async move {
            let sql = Self::sql_of(&input);
            if let Some(violation) = self.guardrail.check_sql(&sql, &self.policy) {
                return Err(EngineError::Guardrail(violation));
            }

            debug!(task_id = %ctx.task_id, agent = %self.name, sql = %sql, "Executing SQL");
            let payload = self.execute(&sql)?;
            let message = match payload.get("rows").and_then(|r| r.as_array()) {
                Some(rows) => format!("{} row(s) returned", rows.len()),
                None => format!(
                    "{} row(s) affected",
                    payload["rows_affected"].as_u64().unwrap_or(0)
                ),
            };
            ctx.log(message.clone());

            let mut output = AgentOutput::success(message).with_payload(payload);
            output.next = self.next.clone();
            Ok(output)
        })
    }
}

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use tracing::debug;

use switchyard_core::error::{EngineError, Result};
use switchyard_core::traits::TraceStore;
use switchyard_core::types::{RunStatus, TaskId, Trace, TraceQuery, TraceSummary};

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS traces (
        task_id TEXT PRIMARY KEY,
        workflow_id TEXT,
        organization_id TEXT,
        status TEXT NOT NULL,
        started_at TEXT NOT NULL,
        finished_at TEXT,
        total_cost REAL NOT NULL DEFAULT 0,
        step_count INTEGER NOT NULL DEFAULT 0,
        replay_of TEXT,
        body TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_traces_org ON traces(organization_id, started_at);
    CREATE INDEX IF NOT EXISTS idx_traces_workflow ON traces(workflow_id, started_at);
    CREATE INDEX IF NOT EXISTS idx_traces_status ON traces(status);";

/// SQLite-backed trace store.
///
/// Each trace is stored whole as JSON, with the listing columns copied out
/// so they can be filtered and indexed. Saves are upserts keyed by task id.
pub struct SqliteTraceStore {
    conn: Mutex<Connection>,
}

impl SqliteTraceStore {
    /// Open or create a database at `path`, creating parent directories.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                EngineError::Store(format!("Failed to create db directory: {}", e))
            })?;
        }

        let conn = Connection::open(path).map_err(db_err)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(db_err)?;
        conn.execute_batch(SCHEMA).map_err(db_err)?;

        debug!(path = %path.display(), "Trace store opened");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory database (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        conn.execute_batch(SCHEMA).map_err(db_err)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Remove a trace. Returns whether it existed.
    pub fn delete(&self, task_id: &str) -> Result<bool> {
        let conn = self.lock()?;
        let n = conn
            .execute("DELETE FROM traces WHERE task_id = ?1", params![task_id])
            .map_err(db_err)?;
        Ok(n > 0)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| EngineError::Store(format!("lock poisoned: {}", e)))
    }
}

fn db_err(e: rusqlite::Error) -> EngineError {
    EngineError::Store(e.to_string())
}

impl TraceStore for SqliteTraceStore {
    fn save(&self, trace: &Trace) -> Result<()> {
        let body = serde_json::to_string(trace)?;
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO traces (task_id, workflow_id, organization_id, status, started_at,
                                 finished_at, total_cost, step_count, replay_of, body)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
             ON CONFLICT(task_id) DO UPDATE SET
                workflow_id = excluded.workflow_id,
                organization_id = excluded.organization_id,
                status = excluded.status,
                finished_at = excluded.finished_at,
                total_cost = excluded.total_cost,
                step_count = excluded.step_count,
                replay_of = excluded.replay_of,
                body = excluded.body",
            params![
                trace.task_id.as_str(),
                trace.workflow_id,
                trace.organization_id,
                trace.status.as_str(),
                timestamp(&trace.started_at),
                trace.finished_at.as_ref().map(timestamp),
                trace.totals.cost,
                trace.steps.len() as i64,
                trace.replay_of.as_ref().map(|t| t.as_str()),
                body,
            ],
        )
        .map_err(db_err)?;
        debug!(task_id = %trace.task_id, steps = trace.steps.len(), status = %trace.status, "Trace saved");
        Ok(())
    }

    fn load(&self, task_id: &str) -> Result<Option<Trace>> {
        let conn = self.lock()?;
        let body: Option<String> = conn
            .query_row(
                "SELECT body FROM traces WHERE task_id = ?1",
                params![task_id],
                |row| row.get(0),
            )
            .optional()
            .map_err(db_err)?;
        match body {
            Some(body) => Ok(Some(serde_json::from_str(&body)?)),
            None => Ok(None),
        }
    }

    fn list(&self, query: &TraceQuery) -> Result<Vec<TraceSummary>> {
        let mut sql = String::from(
            "SELECT task_id, workflow_id, organization_id, status, started_at, finished_at,
                    total_cost, step_count, replay_of
             FROM traces WHERE 1 = 1",
        );
        let mut args: Vec<String> = Vec::new();
        if let Some(ref org) = query.organization {
            args.push(org.clone());
            sql.push_str(&format!(" AND organization_id = ?{}", args.len()));
        }
        if let Some(ref workflow) = query.workflow {
            args.push(workflow.clone());
            sql.push_str(&format!(" AND workflow_id = ?{}", args.len()));
        }
        if let Some(status) = query.status {
            args.push(status.as_str().to_string());
            sql.push_str(&format!(" AND status = ?{}", args.len()));
        }
        sql.push_str(" ORDER BY started_at DESC, rowid DESC");
        if let Some(limit) = query.limit {
            sql.push_str(&format!(" LIMIT {}", limit));
        }

        let conn = self.lock()?;
        let mut stmt = conn.prepare(&sql).map_err(db_err)?;
        let rows = stmt
            .query_map(params_from_iter(args.iter()), |row| {
                Ok(RawSummary {
                    task_id: row.get(0)?,
                    workflow_id: row.get(1)?,
                    organization_id: row.get(2)?,
                    status: row.get(3)?,
                    started_at: row.get(4)?,
                    finished_at: row.get(5)?,
                    total_cost: row.get(6)?,
                    step_count: row.get(7)?,
                    replay_of: row.get(8)?,
                })
            })
            .map_err(db_err)?;

        let mut summaries = Vec::new();
        for row in rows {
            summaries.push(row.map_err(db_err)?.into_summary()?);
        }
        Ok(summaries)
    }
}

struct RawSummary {
    task_id: String,
    workflow_id: Option<String>,
    organization_id: Option<String>,
    status: String,
    started_at: String,
    finished_at: Option<String>,
    total_cost: f64,
    step_count: i64,
    replay_of: Option<String>,
}

impl RawSummary {
    fn into_summary(self) -> Result<TraceSummary> {
        let status: RunStatus = self.status.parse().map_err(EngineError::Store)?;
        Ok(TraceSummary {
            task_id: TaskId(self.task_id),
            workflow_id: self.workflow_id,
            organization_id: self.organization_id,
            status,
            started_at: parse_time(&self.started_at)?,
            finished_at: self.finished_at.as_deref().map(parse_time).transpose()?,
            total_cost: self.total_cost,
            step_count: self.step_count.max(0) as usize,
            replay_of: self.replay_of.map(TaskId),
        })
    }
}

/// Fixed-width RFC 3339 so text ordering matches time ordering.
fn timestamp(t: &DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn parse_time(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| EngineError::Store(format!("invalid timestamp {}: {}", raw, e)))
}

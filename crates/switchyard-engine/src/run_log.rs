use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tokio::sync::broadcast::Receiver;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use switchyard_core::event::EventBus;
use switchyard_core::types::EngineEvent;

/// JSONL run logger.
///
/// Subscribes to the EventBus and appends one JSON object per line to
/// `{log_dir}/{task_id}.jsonl`. Each line is flushed as it is written, so a
/// crash mid-run leaves every earlier line intact. A task's file is closed
/// when its run finishes.
pub struct RunLogger {
    log_dir: PathBuf,
    level: u8,
}

#[derive(Serialize)]
struct LogEntry {
    timestamp: String,
    task_id: String,
    event_type: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    agent: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<serde_json::Value>,
}

impl RunLogger {
    /// `level`: 1=run summary, 2=+steps and routing, 3=+attempts, guardrail blocks and agent logs.
    pub fn new(log_dir: PathBuf, level: u8) -> Self {
        Self { log_dir, level }
    }

    /// Run until cancelled or the bus closes. Events already queued at
    /// cancellation are still written.
    ///
    /// Subscribes before returning, so events published after this call are
    /// never missed even if the future is polled later.
    pub fn run(
        self,
        event_bus: Arc<EventBus>,
        cancel: CancellationToken,
    ) -> impl Future<Output = ()> + Send {
        let rx = event_bus.subscribe();
        self.drive(rx, cancel)
    }

    async fn drive(self, mut rx: Receiver<EngineEvent>, cancel: CancellationToken) {
        if let Err(e) = tokio::fs::create_dir_all(&self.log_dir).await {
            error!(error = %e, path = %self.log_dir.display(), "Failed to create log directory");
            return;
        }
        info!(path = %self.log_dir.display(), level = self.level, "RunLogger started");

        let mut files: HashMap<String, BufWriter<File>> = HashMap::new();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("RunLogger cancelled, draining");
                    loop {
                        match rx.try_recv() {
                            Ok(event) => self.handle(&mut files, &event).await,
                            Err(TryRecvError::Lagged(n)) => {
                                debug!(skipped = n, "RunLogger lagged, skipped events");
                            }
                            Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => break,
                        }
                    }
                    break;
                }
                result = rx.recv() => {
                    match result {
                        Ok(event) => self.handle(&mut files, &event).await,
                        Err(RecvError::Lagged(n)) => {
                            debug!(skipped = n, "RunLogger lagged, skipped events");
                        }
                        Err(RecvError::Closed) => {
                            debug!("EventBus closed, RunLogger stopping");
                            break;
                        }
                    }
                }
            }
        }

        for (_, mut writer) in files.drain() {
            writer.flush().await.ok();
        }
        debug!("RunLogger finished");
    }

    async fn handle(&self, files: &mut HashMap<String, BufWriter<File>>, event: &EngineEvent) {
        let task_id = event.task_id().to_string();
        if let Some(entry) = self.event_to_entry(event) {
            if !files.contains_key(&task_id) {
                match open_log(&self.log_dir, &task_id).await {
                    Some(writer) => {
                        files.insert(task_id.clone(), writer);
                    }
                    None => return,
                }
            }
            if let Some(writer) = files.get_mut(&task_id) {
                write_entry(writer, &entry).await;
            }
        }

        if matches!(event, EngineEvent::RunFinished { .. }) {
            if let Some(mut writer) = files.remove(&task_id) {
                writer.flush().await.ok();
            }
        }
    }

    /// Convert an event to a log entry. `None` when filtered out by level.
    fn event_to_entry(&self, event: &EngineEvent) -> Option<LogEntry> {
        let entry = |event_type, agent: Option<&str>, detail| LogEntry {
            timestamp: Utc::now().to_rfc3339(),
            task_id: event.task_id().to_string(),
            event_type,
            agent: agent.map(str::to_string),
            detail,
        };

        match event {
            // L1
            EngineEvent::RunStarted {
                workflow_id,
                replay_of,
                ..
            } => Some(entry(
                "run_started",
                None,
                Some(serde_json::json!({
                    "workflow_id": workflow_id,
                    "replay_of": replay_of.as_ref().map(|t| t.as_str()),
                })),
            )),
            EngineEvent::RunFinished {
                status,
                totals,
                error,
                ..
            } => Some(entry(
                "run_finished",
                None,
                Some(serde_json::json!({
                    "status": status,
                    "cost": totals.cost,
                    "duration_ms": totals.duration_ms,
                    "error": error,
                })),
            )),

            // L2
            EngineEvent::StepRecorded { step, .. } if self.level >= 2 => Some(entry(
                "step_recorded",
                Some(step.agent.as_str()),
                Some(serde_json::json!({
                    "loop": step.loop_index,
                    "attempt": step.attempt,
                    "ok": step.output.ok,
                    "cost": step.output.cost,
                    "message": truncate_str(&step.output.message, 200),
                })),
            )),
            EngineEvent::Routed {
                from,
                to,
                loop_index,
                ..
            } if self.level >= 2 => Some(entry(
                "routed",
                Some(from.as_str()),
                Some(serde_json::json!({ "to": to, "loop": loop_index })),
            )),

            // L3
            EngineEvent::AttemptStarted {
                agent,
                loop_index,
                attempt,
                ..
            } if self.level >= 3 => Some(entry(
                "attempt_started",
                Some(agent.as_str()),
                Some(serde_json::json!({ "loop": loop_index, "attempt": attempt })),
            )),
            EngineEvent::AttemptFailed {
                agent,
                attempt,
                error,
                ..
            } if self.level >= 3 => Some(entry(
                "attempt_failed",
                Some(agent.as_str()),
                Some(serde_json::json!({ "attempt": attempt, "error": error })),
            )),
            EngineEvent::GuardrailBlocked {
                agent, violation, ..
            } if self.level >= 3 => Some(entry(
                "guardrail_blocked",
                Some(agent.as_str()),
                Some(serde_json::json!({
                    "rule": violation.rule,
                    "reason": violation.reason,
                    "offending": truncate_str(&violation.offending, 200),
                })),
            )),
            EngineEvent::AgentLog { agent, message, .. } if self.level >= 3 => Some(entry(
                "agent_log",
                Some(agent.as_str()),
                Some(serde_json::json!({ "message": truncate_str(message, 500) })),
            )),

            _ => None,
        }
    }
}

async fn open_log(dir: &Path, task_id: &str) -> Option<BufWriter<File>> {
    let path = dir.join(format!("{}.jsonl", task_id));
    match tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .await
    {
        Ok(file) => {
            debug!(path = %path.display(), "Opened run log");
            Some(BufWriter::new(file))
        }
        Err(e) => {
            error!(error = %e, path = %path.display(), "Failed to open run log");
            None
        }
    }
}

async fn write_entry(writer: &mut BufWriter<File>, entry: &LogEntry) {
    let Ok(json) = serde_json::to_string(entry) else {
        return;
    };
    let line = format!("{}\n", json);
    if let Err(e) = writer.write_all(line.as_bytes()).await {
        error!(error = %e, "Failed to write log entry");
        return;
    }
    if let Err(e) = writer.flush().await {
        error!(error = %e, "Failed to flush log");
    }
}

/// Truncate on a char boundary.
fn truncate_str(s: &str, max_len: usize) -> &str {
    if s.len() <= max_len {
        return s;
    }
    let mut end = max_len;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

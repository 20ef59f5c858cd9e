use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use tracing::debug;

use switchyard_core::error::{EngineError, Result};
use switchyard_core::traits::TraceStore;
use switchyard_core::types::{ExecutionStep, RunStatus, Totals, Trace};

/// Append-only trace writer for one run.
///
/// Every mutation saves the full trace before returning, so a crash leaves
/// the last completed step durable. Finalization happens exactly once.
pub struct TraceRecorder {
    store: Arc<dyn TraceStore>,
    trace: Trace,
    started: Instant,
}

impl TraceRecorder {
    /// Persist `trace` (status running) and take ownership of it.
    pub fn start(store: Arc<dyn TraceStore>, mut trace: Trace) -> Result<Self> {
        trace.status = RunStatus::Running;
        trace.finished_at = None;
        store.save(&trace)?;
        debug!(task_id = %trace.task_id, "Trace started");
        Ok(Self {
            store,
            trace,
            started: Instant::now(),
        })
    }

    /// Append one attempt and flush. Successful steps add their cost to the totals.
    pub fn add(&mut self, step: ExecutionStep) -> Result<()> {
        self.ensure_open()?;
        if step.output.ok {
            self.trace.totals.cost += step_cost(&step);
        }
        self.trace.totals.duration_ms = self.elapsed_ms();
        self.trace.steps.push(step);
        self.store.save(&self.trace)
    }

    /// Record namespaces that exist in the run's memory. Persisted with the next flush.
    pub fn set_memory_namespaces(&mut self, namespaces: Vec<String>) {
        if !self.is_finalized() {
            self.trace.memory_namespaces = namespaces;
        }
    }

    /// Finalize with a terminal status and flush. Returns the finished trace.
    pub fn end(&mut self, status: RunStatus, error: Option<String>) -> Result<Trace> {
        self.ensure_open()?;
        self.trace.status = if status.is_terminal() {
            status
        } else {
            RunStatus::Error
        };
        self.trace.error = error;
        self.trace.finished_at = Some(Utc::now());
        self.trace.totals.duration_ms = self.elapsed_ms();
        self.store.save(&self.trace)?;
        debug!(
            task_id = %self.trace.task_id,
            status = %self.trace.status,
            steps = self.trace.steps.len(),
            "Trace finalized"
        );
        Ok(self.trace.clone())
    }

    pub fn trace(&self) -> &Trace {
        &self.trace
    }

    pub fn totals(&self) -> Totals {
        self.trace.totals
    }

    pub fn is_finalized(&self) -> bool {
        self.trace.status.is_terminal()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_finalized() {
            return Err(EngineError::TraceFinalized(self.trace.task_id.to_string()));
        }
        Ok(())
    }

    fn elapsed_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }
}

/// Reported cost, ignoring negative and non-finite values so totals never decrease.
fn step_cost(step: &ExecutionStep) -> f64 {
    step.output
        .cost
        .filter(|c| c.is_finite() && *c > 0.0)
        .unwrap_or(0.0)
}

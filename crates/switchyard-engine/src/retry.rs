use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, warn};

use switchyard_core::error::Result;
use switchyard_core::event::EventBus;
use switchyard_core::guardrail::Violation;
use switchyard_core::types::{AgentContext, AgentInput, AgentOutput, EngineEvent, ExecutionStep};
use switchyard_core::workflow::{BackoffStrategy, RetryPolicy};

use crate::gate::GuardrailGate;
use crate::registry::ResolvedAgent;

/// Result of one logical step after all retries.
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    Success(AgentOutput),
    Failed {
        output: AgentOutput,
        /// Message of the last failed attempt.
        error: String,
        violation: Option<Violation>,
        attempts: u32,
    },
}

impl StepOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }

    pub fn output(&self) -> &AgentOutput {
        match self {
            Self::Success(output) | Self::Failed { output, .. } => output,
        }
    }
}

/// Delay before the attempt that follows failed attempt number `attempt` (1-based).
///
/// Fixed strategy: `backoff_ms` every time. Exponential: `backoff_ms * 2^(attempt-1)`
/// capped at `max_backoff_ms`. Jitter scales the result by 0.8x to 1.2x.
pub fn backoff_delay(attempt: u32, policy: &RetryPolicy) -> Duration {
    let ms = match policy.strategy {
        BackoffStrategy::Fixed => policy.backoff_ms,
        BackoffStrategy::Exponential => {
            let factor = 1u64
                .checked_shl(attempt.saturating_sub(1))
                .unwrap_or(u64::MAX);
            policy
                .backoff_ms
                .saturating_mul(factor)
                .min(policy.max_backoff_ms)
        }
    };
    if policy.jitter && ms > 0 {
        let jitter = 0.8 + rand::random::<f64>() * 0.4;
        Duration::from_millis((ms as f64 * jitter) as u64)
    } else {
        Duration::from_millis(ms)
    }
}

/// Wraps one agent invocation with the guardrail gate and bounded retries.
pub struct RetryController {
    gate: GuardrailGate,
    event_bus: Option<Arc<EventBus>>,
}

impl RetryController {
    pub fn new(gate: GuardrailGate, event_bus: Option<Arc<EventBus>>) -> Self {
        Self { gate, event_bus }
    }

    /// Run `agent` up to `policy.count + 1` times.
    ///
    /// Every attempt, including refused ones, is handed to `record` as its own
    /// step before the next attempt starts. Returns on the first success.
    pub async fn invoke<F>(
        &self,
        agent: &ResolvedAgent,
        ctx: AgentContext,
        input: AgentInput,
        policy: &RetryPolicy,
        mut record: F,
    ) -> Result<StepOutcome>
    where
        F: FnMut(ExecutionStep) -> Result<()>,
    {
        let max_attempts = policy.count.saturating_add(1);
        let name = agent.spec.name.as_str();
        let mut attempt = 1;

        loop {
            self.publish(EngineEvent::AttemptStarted {
                task_id: ctx.task_id.clone(),
                agent: name.to_string(),
                loop_index: ctx.loop_index,
                attempt,
            });

            let violation = self.gate.check(&ctx.task_id, agent, &input);
            let (output, error) = match violation {
                Some(ref v) => {
                    let message = format!("guardrail violation: {}", v);
                    (AgentOutput::failure(message.clone()), Some(message))
                }
                None => {
                    let mut attempt_ctx = ctx.clone();
                    attempt_ctx.attempt = attempt;
                    match agent.handler.handle(attempt_ctx, input.clone()).await {
                        Ok(output) if output.ok => (output, None),
                        Ok(output) => {
                            let message = if output.message.is_empty() {
                                format!("agent {} reported failure", name)
                            } else {
                                output.message.clone()
                            };
                            (output, Some(message))
                        }
                        Err(e) => {
                            let message = e.to_string();
                            (AgentOutput::failure(message.clone()), Some(message))
                        }
                    }
                }
            };

            record(ExecutionStep {
                at: Utc::now(),
                agent: name.to_string(),
                loop_index: ctx.loop_index,
                attempt,
                input: input.clone(),
                output: output.clone(),
                violation: violation.clone(),
            })?;

            let Some(error) = error else {
                debug!(task_id = %ctx.task_id, agent = %name, attempt, "Attempt succeeded");
                return Ok(StepOutcome::Success(output));
            };

            self.publish(EngineEvent::AttemptFailed {
                task_id: ctx.task_id.clone(),
                agent: name.to_string(),
                attempt,
                error: error.clone(),
            });

            let violation_is_final = violation.is_some() && !policy.retry_on_violation;
            if attempt >= max_attempts || violation_is_final {
                warn!(
                    task_id = %ctx.task_id,
                    agent = %name,
                    attempts = attempt,
                    error = %error,
                    "Step failed"
                );
                return Ok(StepOutcome::Failed {
                    output,
                    error,
                    violation,
                    attempts: attempt,
                });
            }

            let backoff = backoff_delay(attempt, policy);
            warn!(
                task_id = %ctx.task_id,
                agent = %name,
                attempt,
                max_attempts,
                backoff_ms = backoff.as_millis() as u64,
                error = %error,
                "Retrying agent"
            );
            if !backoff.is_zero() {
                tokio::time::sleep(backoff).await;
            }
            attempt += 1;
        }
    }

    fn publish(&self, event: EngineEvent) {
        if let Some(ref bus) = self.event_bus {
            bus.publish(event);
        }
    }
}

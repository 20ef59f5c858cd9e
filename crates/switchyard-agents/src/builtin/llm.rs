use std::time::Duration;

use futures::future::BoxFuture;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use switchyard_core::config::LlmConfig;
use switchyard_core::error::{EngineError, Result};
use switchyard_core::traits::AgentHandler;
use switchyard_core::types::{AgentContext, AgentInput, AgentOutput};
use switchyard_core::workflow::{AgentKind, AgentSpec};

/// LLM-backed agent for orchestrators and LLM workers.
///
/// Calls an OpenAI-compatible chat completions endpoint (non-streaming) and
/// expects a JSON object `{message, payload?, next?}` back. Orchestrators are
/// told which agents they may hand off to. Provider settings come from the
/// engine's `LlmConfig`, never from the process environment.
pub struct LlmAgent {
    name: String,
    kind: AgentKind,
    description: Option<String>,
    system_prompt: Option<String>,
    model: String,
    temperature: f32,
    config: LlmConfig,
    http: Client,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage>,
    max_tokens: u32,
    temperature: f32,
}

#[derive(Serialize)]
struct ChatMessage {
    role: &'static str,
    content: String,
}

#[derive(Deserialize, Debug)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Deserialize, Debug)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Deserialize, Debug)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize, Debug, Default)]
struct Usage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

/// The shape agents are asked to answer with.
#[derive(Deserialize, Debug, Default, PartialEq)]
struct Reply {
    #[serde(default)]
    message: String,
    #[serde(default)]
    payload: Option<Value>,
    #[serde(default)]
    next: Option<String>,
}

impl LlmAgent {
    /// Settings: `model`, `temperature` and `system_prompt` override the engine defaults.
    pub fn from_spec(spec: &AgentSpec, kind: AgentKind, config: &LlmConfig) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| EngineError::Llm(format!("Failed to create HTTP client: {}", e)))?;
        Ok(Self {
            name: spec.name.clone(),
            kind,
            description: spec.description.clone(),
            system_prompt: spec.setting_str("system_prompt").map(str::to_string),
            model: spec
                .setting_str("model")
                .map(str::to_string)
                .unwrap_or_else(|| config.model_id.clone()),
            temperature: spec
                .settings
                .get("temperature")
                .and_then(|v| v.as_f64())
                .map(|t| t as f32)
                .unwrap_or(config.temperature),
            config: config.clone(),
            http,
        })
    }

    fn system_message(&self, ctx: &AgentContext) -> String {
        let mut prompt = String::new();
        match self.system_prompt {
            Some(ref custom) => prompt.push_str(custom),
            None => {
                prompt.push_str(&format!("You are the agent \"{}\".", self.name));
                if let Some(ref description) = self.description {
                    prompt.push(' ');
                    prompt.push_str(description);
                }
            }
        }

        let can_call = ctx.can_call();
        prompt.push_str("\n\nAnswer with a single JSON object: ");
        prompt.push_str("{\"message\": string, \"payload\": any (optional), \"next\": string (optional)}.");
        if can_call.is_empty() {
            prompt.push_str("\nOmit \"next\".");
        } else if self.kind == AgentKind::Orchestrator {
            prompt.push_str(&format!(
                "\nSet \"next\" to hand the task to one of: {}. Omit \"next\" when the task is complete.",
                can_call.join(", ")
            ));
        } else {
            prompt.push_str(&format!(
                "\nTo pass your result on, set \"next\" to one of: {}. Otherwise omit \"next\".",
                can_call.join(", ")
            ));
        }
        if !ctx.memory.is_empty() {
            prompt.push_str("\n\nShared memory:\n");
            prompt.push_str(&Value::Object(ctx.memory.clone()).to_string());
        }
        prompt
    }

    fn user_message(ctx: &AgentContext, input: &AgentInput) -> String {
        let mut content = format!("Task: {}\n\nInput: {}", ctx.task, input.message);
        if let Some(ref payload) = input.payload {
            content.push_str(&format!("\n\nPayload: {}", payload));
        }
        content
    }

    async fn complete(&self, system: String, user: String) -> Result<(String, Usage)> {
        let request = ChatRequest {
            model: &self.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: system,
                },
                ChatMessage {
                    role: "user",
                    content: user,
                },
            ],
            max_tokens: self.config.max_tokens,
            temperature: self.temperature,
        };

        let mut builder = self
            .http
            .post(self.config.endpoint())
            .header("content-type", "application/json")
            .json(&request);
        if let Some(ref key) = self.config.api_key {
            builder = builder.bearer_auth(key);
        }

        let resp = builder
            .send()
            .await
            .map_err(|e| EngineError::Llm(e.to_string()))?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(EngineError::Llm(format!("HTTP {}: {}", status, body)));
        }
        let parsed: ChatResponse = resp
            .json()
            .await
            .map_err(|e| EngineError::Llm(format!("invalid response: {}", e)))?;
        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| EngineError::Llm("response has no content".to_string()))?;
        Ok((content, parsed.usage.unwrap_or_default()))
    }
}

/// Parse the model's answer. Tolerates code fences around the JSON; anything
/// that is not a JSON object becomes a plain message with no hand-off.
fn parse_reply(content: &str) -> Reply {
    let trimmed = content.trim();
    let unfenced = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .and_then(|s| s.strip_suffix("```"))
        .map(str::trim)
        .unwrap_or(trimmed);

    match serde_json::from_str::<Reply>(unfenced) {
        Ok(mut reply) => {
            reply.next = reply.next.filter(|n| !n.trim().is_empty());
            reply
        }
        Err(_) => Reply {
            message: trimmed.to_string(),
            ..Default::default()
        },
    }
}

impl AgentHandler for LlmAgent {
    fn kind(&self) -> AgentKind {
        self.kind
    }

    fn handle(&self, ctx: AgentContext, input: AgentInput) -> BoxFuture<'_, Result<AgentOutput>> {
        Box::pin(async move {
            let system = self.system_message(&ctx);
            let user = Self::user_message(&ctx, &input);
            debug!(task_id = %ctx.task_id, agent = %self.name, model = %self.model, "Calling LLM");

            let (content, usage) = self.complete(system, user).await?;
            let cost = self.config.cost(usage.prompt_tokens, usage.completion_tokens);
            let reply = parse_reply(&content);
            if reply.message.is_empty() && reply.payload.is_none() {
                warn!(task_id = %ctx.task_id, agent = %self.name, "LLM returned an empty reply");
            }

            let mut output = AgentOutput::success(reply.message)
                .with_cost(cost)
                .with_metadata(serde_json::json!({
                    "model": self.model,
                    "prompt_tokens": usage.prompt_tokens,
                    "completion_tokens": usage.completion_tokens,
                }));
            output.payload = reply.payload;
            output.next = reply.next;
            Ok(output)
        })
    }
}

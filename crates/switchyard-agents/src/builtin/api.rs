use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use reqwest::dns::{Addrs, Name, Resolve, Resolving};
use reqwest::{redirect, Client, Method, Url};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, warn};

use switchyard_core::config::HttpConfig;
use switchyard_core::error::{EngineError, Result};
use switchyard_core::guardrail::{
    is_blocked_ip, private_address_violation, GuardrailPolicy, HttpGuardrail, ProposedAction,
    Violation,
};
use switchyard_core::traits::AgentHandler;
use switchyard_core::types::{AgentContext, AgentInput, AgentOutput};
use switchyard_core::workflow::{AgentKind, AgentSpec, WorkerKind, WorkflowConfig};

use super::{return_route, truncate};

const DEFAULT_MAX_BODY: usize = 100_000;

/// Request description read from the input payload.
#[derive(Debug, Deserialize)]
struct ApiRequest {
    url: String,
    #[serde(default = "default_method")]
    method: String,
    #[serde(default)]
    headers: serde_json::Map<String, Value>,
    #[serde(default)]
    body: Option<Value>,
}

fn default_method() -> String {
    "GET".to_string()
}

/// API worker: one outbound HTTP request per attempt.
///
/// The URL is checked by the HTTP guardrail before the call. With
/// `block_private_ips`, every resolved address of every hop is checked too,
/// which closes DNS rebinding and redirect-based SSRF.
pub struct ApiWorker {
    name: String,
    policy: GuardrailPolicy,
    guardrail: HttpGuardrail,
    timeout: Duration,
    user_agent: String,
    max_redirects: usize,
    system_proxy: bool,
    max_body: usize,
    next: Option<String>,
}

impl ApiWorker {
    /// Settings: `timeout_secs` and `max_body` override the engine's HTTP settings.
    pub fn from_spec(spec: &AgentSpec, workflow: &WorkflowConfig, http: &HttpConfig) -> Self {
        Self {
            name: spec.name.clone(),
            policy: spec.policy.guardrails.clone(),
            guardrail: HttpGuardrail::new(),
            timeout: Duration::from_secs(spec.setting_u64("timeout_secs").unwrap_or(http.timeout_secs)),
            user_agent: http.user_agent.clone(),
            max_redirects: http.max_redirects,
            system_proxy: http.system_proxy,
            max_body: spec
                .setting_u64("max_body")
                .map(|n| n as usize)
                .unwrap_or(DEFAULT_MAX_BODY),
            next: return_route(spec, workflow),
        }
    }

    fn request_of(input: &AgentInput) -> ApiRequest {
        input
            .payload
            .as_ref()
            .and_then(|p| serde_json::from_value::<ApiRequest>(p.clone()).ok())
            .unwrap_or_else(|| ApiRequest {
                url: input.message.trim().to_string(),
                method: default_method(),
                headers: Default::default(),
                body: None,
            })
    }

    fn blocks_private(&self) -> bool {
        self.policy.block_private_ips.unwrap_or(false)
    }

    /// Client whose redirect policy re-runs the guardrail on every hop.
    /// A hop or resolved address refused inside reqwest lands in the slot.
    fn client(&self, method: &str) -> Result<(Client, BlockedSlot)> {
        let blocked = BlockedSlot::default();
        let slot = blocked.clone();
        let guardrail = self.guardrail.clone();
        let policy = self.policy.clone();
        let method = method.to_string();
        let max_redirects = self.max_redirects;
        let redirects = redirect::Policy::custom(move |attempt| {
            if attempt.previous().len() > max_redirects {
                return attempt.error(format!("too many redirects (max {})", max_redirects));
            }
            match guardrail.check_url(attempt.url(), &method, &policy) {
                Some(violation) => {
                    warn!(url = %attempt.url(), rule = %violation.rule, "Redirect blocked by guardrail");
                    let reason = violation.to_string();
                    slot.set(violation);
                    attempt.error(reason)
                }
                None => attempt.follow(),
            }
        });

        let mut builder = Client::builder()
            .timeout(self.timeout)
            .user_agent(self.user_agent.clone())
            .redirect(redirects);
        if self.blocks_private() {
            builder = builder.no_proxy().dns_resolver(Arc::new(GuardedResolver {
                blocked: blocked.clone(),
            }));
        } else if !self.system_proxy {
            builder = builder.no_proxy();
        }
        let client = builder
            .build()
            .map_err(|e| EngineError::Http(format!("Failed to create HTTP client: {}", e)))?;
        Ok((client, blocked))
    }

    /// Resolve the target host and refuse any blocked address.
    async fn check_resolved(&self, url: &Url) -> Result<()> {
        let Some(host) = url.host_str() else {
            return Ok(());
        };
        let host = host.trim_start_matches('[').trim_end_matches(']');
        if host.parse::<std::net::IpAddr>().is_ok() {
            // Literal addresses were already checked by the guardrail.
            return Ok(());
        }
        let port = url.port_or_known_default().unwrap_or(80);
        let addrs = tokio::net::lookup_host((host, port))
            .await
            .map_err(|e| EngineError::Http(format!("DNS lookup failed for {}: {}", host, e)))?;
        for addr in addrs {
            if is_blocked_ip(addr.ip()) {
                return Err(EngineError::Guardrail(private_address_violation(host, addr.ip())));
            }
        }
        Ok(())
    }
}

impl AgentHandler for ApiWorker {
    fn kind(&self) -> AgentKind {
        AgentKind::Worker(WorkerKind::Api)
    }

    fn proposed_action(&self, input: &AgentInput) -> Option<ProposedAction> {
        let request = Self::request_of(input);
        Some(ProposedAction::http(request.url, request.method))
    }

    fn handle(&self, ctx: AgentContext, input: AgentInput) -> BoxFuture<'_, Result<AgentOutput>> {
        Box::pin(async move {
            let request = Self::request_of(&input);
            if let Some(violation) =
                self.guardrail
                    .check_request(&request.url, &request.method, &self.policy)
            {
                return Err(EngineError::Guardrail(violation));
            }

            let url = Url::parse(request.url.trim())
                .map_err(|e| EngineError::Http(format!("invalid URL: {}", e)))?;
            if self.blocks_private() {
                self.check_resolved(&url).await?;
            }

            let method = Method::from_bytes(request.method.to_uppercase().as_bytes())
                .map_err(|e| EngineError::Http(format!("invalid method: {}", e)))?;
            let (client, blocked) = self.client(method.as_str())?;
            let mut builder = client.request(method.clone(), url.clone());
            for (key, value) in &request.headers {
                let value = match value {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                builder = builder.header(key.as_str(), value);
            }
            if let Some(body) = request.body {
                builder = match body {
                    Value::String(s) => builder.body(s),
                    other => builder.json(&other),
                };
            }

            debug!(task_id = %ctx.task_id, agent = %self.name, method = %method, url = %url, "Sending request");
            let resp = match builder.send().await {
                Ok(resp) => resp,
                Err(e) => {
                    return Err(match blocked.take() {
                        Some(violation) => EngineError::Guardrail(violation),
                        None => EngineError::Http(format!("Request failed: {}", e)),
                    })
                }
            };

            let status = resp.status();
            let final_url = resp.url().to_string();
            let text = resp
                .text()
                .await
                .map_err(|e| EngineError::Http(format!("Failed to read response body: {}", e)))?;
            let body = serde_json::from_str::<Value>(&text)
                .unwrap_or_else(|_| Value::String(truncate(&text, self.max_body)));

            let payload = json!({
                "status": status.as_u16(),
                "url": final_url,
                "body": body,
            });
            let summary = format!(
                "HTTP {} {}",
                status.as_u16(),
                status.canonical_reason().unwrap_or("Unknown")
            );
            ctx.log(format!("{} {} -> {}", method, url, summary));

            if !status.is_success() {
                return Ok(AgentOutput::failure(summary).with_payload(payload));
            }
            let mut output = AgentOutput::success(summary).with_payload(payload);
            output.next = self.next.clone();
            Ok(output)
        })
    }
}

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Violation raised inside reqwest, where only a string error escapes.
#[derive(Clone, Default)]
struct BlockedSlot(Arc<Mutex<Option<Violation>>>);

impl BlockedSlot {
    fn set(&self, violation: Violation) {
        if let Ok(mut slot) = self.0.lock() {
            slot.get_or_insert(violation);
        }
    }

    fn take(&self) -> Option<Violation> {
        self.0.lock().ok().and_then(|mut slot| slot.take())
    }
}

/// DNS resolver that fails when any resolved address is blocked.
struct GuardedResolver {
    blocked: BlockedSlot,
}

impl Resolve for GuardedResolver {
    fn resolve(&self, name: Name) -> Resolving {
        let blocked = self.blocked.clone();
        Box::pin(async move {
            let addrs = resolve_public(name.as_str(), &blocked).await?;
            let addrs: Addrs = Box::new(addrs.into_iter());
            Ok::<Addrs, BoxError>(addrs)
        })
    }
}

async fn resolve_public(
    host: &str,
    blocked: &BlockedSlot,
) -> std::result::Result<Vec<SocketAddr>, BoxError> {
    let addrs: Vec<SocketAddr> = tokio::net::lookup_host((host, 0)).await?.collect();
    if let Some(addr) = addrs.iter().find(|a| is_blocked_ip(a.ip())) {
        let violation = private_address_violation(host, addr.ip());
        let reason = violation.to_string();
        blocked.set(violation);
        return Err(reason.into());
    }
    Ok(addrs)
}

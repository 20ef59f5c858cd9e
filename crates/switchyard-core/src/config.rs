use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Engine settings. Passed explicitly into the engine and the agent factory;
/// nothing reads process environment after load.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Base directory for the trace database and run logs.
    #[serde(default = "default_workspace")]
    pub workspace: String,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub log: LogConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub http: HttpConfig,
}

fn default_workspace() -> String { "~/.switchyard".to_string() }

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            workspace: default_workspace(),
            store: StoreConfig::default(),
            log: LogConfig::default(),
            llm: LlmConfig::default(),
            http: HttpConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Trace database path. Default: <workspace>/traces.db
    #[serde(default)]
    pub path: Option<String>,
}

/// JSONL run logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    #[serde(default = "default_log_enabled")]
    pub enabled: bool,
    /// Directory for log files. Default: <workspace>/logs
    #[serde(default)]
    pub log_dir: Option<String>,
    /// 1 = run summary only, 2 = + steps and routes, 3 = + attempts, violations, agent logs.
    #[serde(default = "default_log_level")]
    pub level: u8,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            log_dir: None,
            level: 2,
        }
    }
}

fn default_log_enabled() -> bool { true }
fn default_log_level() -> u8 { 2 }

/// Chat-completions provider used by LLM agents.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_model_id")]
    pub model_id: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    /// USD per 1000 prompt tokens.
    #[serde(default)]
    pub cost_per_1k_input: f64,
    /// USD per 1000 completion tokens.
    #[serde(default)]
    pub cost_per_1k_output: f64,
    #[serde(default = "default_llm_timeout")]
    pub timeout_secs: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model_id: default_model_id(),
            api_key: None,
            base_url: None,
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
            cost_per_1k_input: 0.0,
            cost_per_1k_output: 0.0,
            timeout_secs: default_llm_timeout(),
        }
    }
}

impl LlmConfig {
    /// Chat completions endpoint.
    pub fn endpoint(&self) -> String {
        let base = self
            .base_url
            .as_deref()
            .unwrap_or(match self.provider.as_str() {
                "ollama" => "http://localhost:11434/v1",
                "groq" => "https://api.groq.com/openai/v1",
                "openrouter" => "https://openrouter.ai/api/v1",
                _ => "https://api.openai.com/v1",
            });
        format!("{}/chat/completions", base.trim_end_matches('/'))
    }

    /// Cost of one call given its token usage.
    pub fn cost(&self, prompt_tokens: u64, completion_tokens: u64) -> f64 {
        (prompt_tokens as f64 / 1000.0) * self.cost_per_1k_input
            + (completion_tokens as f64 / 1000.0) * self.cost_per_1k_output
    }
}

fn default_provider() -> String { "openai".to_string() }
fn default_model_id() -> String { "gpt-4o-mini".to_string() }
fn default_max_tokens() -> u32 { 1024 }
fn default_temperature() -> f32 { 0.0 }
fn default_llm_timeout() -> u64 { 60 }

/// Outbound HTTP settings for API workers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_http_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    /// Redirect hops followed per request. Each hop is re-checked by the guardrail.
    #[serde(default = "default_max_redirects")]
    pub max_redirects: usize,
    /// Route requests through `HTTP_PROXY`/`HTTPS_PROXY`. Never used for
    /// workers that block private addresses: a proxy resolves hosts itself.
    #[serde(default = "default_system_proxy")]
    pub system_proxy: bool,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_http_timeout(),
            user_agent: default_user_agent(),
            max_redirects: default_max_redirects(),
            system_proxy: default_system_proxy(),
        }
    }
}

fn default_http_timeout() -> u64 { 30 }
fn default_user_agent() -> String { format!("switchyard/{}", env!("CARGO_PKG_VERSION")) }
fn default_max_redirects() -> usize { 5 }
fn default_system_proxy() -> bool { true }

impl AppConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| ConfigError::NotFound(path.display().to_string()))?;

        // Expand ${ENV_VAR} references
        let expanded = expand_env_vars(&content);

        toml::from_str(&expanded).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Resolve the workspace directory (expand ~).
    pub fn workspace_dir(&self) -> PathBuf {
        expand_home(&self.workspace)
    }

    pub fn store_path(&self) -> PathBuf {
        match self.store.path {
            Some(ref path) => expand_home(path),
            None => self.workspace_dir().join("traces.db"),
        }
    }

    pub fn log_dir(&self) -> PathBuf {
        match self.log.log_dir {
            Some(ref dir) => expand_home(dir),
            None => self.workspace_dir().join("logs"),
        }
    }
}

fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs_home() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

/// Expand `${ENV_VAR}` patterns in a string.
pub(crate) fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' && chars.peek() == Some(&'{') {
            chars.next(); // consume '{'
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(val) => result.push_str(&val),
                Err(_) => {
                    // Keep original if env var not set
                    result.push_str(&format!("${{{}}}", var_name));
                }
            }
        } else {
            result.push(c);
        }
    }
    result
}

fn dirs_home() -> Option<PathBuf> {
    std::env::var("HOME").ok().map(PathBuf::from)
}

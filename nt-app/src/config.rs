//! NexusTodo agent configuration loader.
//!
//! TOML file first, then environment overrides, then validation. A missing file is not
//! an error: every section has defaults matching the reference deployment.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AgentConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub backend: BackendConfig,
    #[serde(default)]
    pub agent: LoopConfig,
    #[serde(default)]
    pub planner: PlannerConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    #[serde(default = "default_http_timeout_seconds")]
    pub http_timeout_seconds: u64,
    #[serde(default = "default_http_max_in_flight")]
    pub http_max_in_flight: usize,
}

fn default_bind_addr() -> String {
    "0.0.0.0:15590".to_string()
}

fn default_http_timeout_seconds() -> u64 {
    180
}

fn default_http_max_in_flight() -> usize {
    256
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            http_timeout_seconds: default_http_timeout_seconds(),
            http_max_in_flight: default_http_max_in_flight(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LlmConfig {
    #[serde(default = "default_llm_base_url")]
    pub base_url: String,
    #[serde(default = "default_llm_model")]
    pub model: String,
    #[serde(default = "default_llm_api_key")]
    pub api_key: String,
    /// Informational; only chat-completions models are supported.
    #[serde(default = "default_llm_model_type")]
    pub model_type: String,
    #[serde(default)]
    pub temperature: f32,
    #[serde(default = "default_llm_timeout_seconds")]
    pub timeout_seconds: u64,
}

fn default_llm_base_url() -> String {
    "http://localhost:11434/v1".to_string()
}

fn default_llm_model() -> String {
    "deepseek-chat".to_string()
}

fn default_llm_api_key() -> String {
    "nothing".to_string()
}

fn default_llm_model_type() -> String {
    "chat".to_string()
}

fn default_llm_timeout_seconds() -> u64 {
    60
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: default_llm_base_url(),
            model: default_llm_model(),
            api_key: default_llm_api_key(),
            model_type: default_llm_model_type(),
            temperature: 0.0,
            timeout_seconds: default_llm_timeout_seconds(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendMode {
    #[default]
    Http,
    Memory,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BackendConfig {
    #[serde(default)]
    pub mode: BackendMode,
    #[serde(default = "default_backend_base_url")]
    pub base_url: String,
    #[serde(default = "default_backend_timeout_seconds")]
    pub timeout_seconds: u64,
}

fn default_backend_base_url() -> String {
    "http://localhost:8080/api".to_string()
}

fn default_backend_timeout_seconds() -> u64 {
    60
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            mode: BackendMode::Http,
            base_url: default_backend_base_url(),
            timeout_seconds: default_backend_timeout_seconds(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoopConfig {
    #[serde(default = "default_max_session_messages")]
    pub max_session_messages: usize,
    #[serde(default = "default_react_max_steps")]
    pub react_max_steps: usize,
    #[serde(default = "default_sse_chunk_size")]
    pub sse_chunk_size: usize,
    /// Listing previews and recent-candidate retention.
    #[serde(default = "default_display_cap")]
    pub display_cap: usize,
    /// Candidates shown in a clarification.
    #[serde(default = "default_clarify_cap")]
    pub clarify_cap: usize,
}

fn default_max_session_messages() -> usize {
    12
}

fn default_react_max_steps() -> usize {
    10
}

fn default_sse_chunk_size() -> usize {
    20
}

fn default_display_cap() -> usize {
    8
}

fn default_clarify_cap() -> usize {
    5
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            max_session_messages: default_max_session_messages(),
            react_max_steps: default_react_max_steps(),
            sse_chunk_size: default_sse_chunk_size(),
            display_cap: default_display_cap(),
            clarify_cap: default_clarify_cap(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PlannerConfig {
    #[serde(default = "default_planner_max_retries")]
    pub max_retries: usize,
}

fn default_planner_max_retries() -> usize {
    2
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            max_retries: default_planner_max_retries(),
        }
    }
}

impl AgentConfig {
    pub async fn load(path: Option<PathBuf>) -> anyhow::Result<Self> {
        let path = path
            .or_else(|| {
                std::env::var("NEXUSTODO_CONFIG")
                    .ok()
                    .filter(|v| !v.trim().is_empty())
                    .map(PathBuf::from)
            })
            .unwrap_or_else(default_config_path);

        let mut cfg = match tokio::fs::read_to_string(&path).await {
            Ok(contents) => Self::from_toml(&contents)
                .map_err(|e| anyhow::anyhow!("parse config {}: {e}", path.display()))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "config file not found; using defaults");
                Self::default()
            }
            Err(e) => return Err(anyhow::anyhow!("read config {}: {e}", path.display())),
        };

        cfg.apply_env_overrides(|key| std::env::var(key).ok());
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_toml(contents: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(contents)?)
    }

    /// `lookup` is the environment; tests pass a closure over a map.
    pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let text = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = text("NEXUSTODO_BIND_ADDR") {
            self.server.bind_addr = v;
        }
        if let Some(v) = text("DEEPSEEK_BASE_URL") {
            self.llm.base_url = v;
        }
        if let Some(v) = text("DEEPSEEK_MODEL") {
            self.llm.model = v;
        }
        if let Some(v) = text("DEEPSEEK_API_KEY") {
            self.llm.api_key = v;
        }
        if let Some(v) = text("DEEPSEEK_MODEL_TYPE") {
            self.llm.model_type = v;
        }
        if let Some(v) = text("TASK_API_BASE_URL") {
            self.backend.base_url = v;
        }
        if let Some(v) = text("TASK_API_TIMEOUT").and_then(|v| parse_number(&v)) {
            self.backend.timeout_seconds = v;
        }
        if let Some(v) = text("AGENT_MAX_SESSION_MESSAGES").and_then(|v| parse_number(&v)) {
            self.agent.max_session_messages = v;
        }
        if let Some(v) = text("REACT_MAX_STEPS").and_then(|v| parse_number(&v)) {
            self.agent.react_max_steps = v;
        }
        if let Some(v) = text("SSE_CHUNK_SIZE").and_then(|v| parse_number(&v)) {
            self.agent.sse_chunk_size = v;
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.server.bind_addr.trim().is_empty() {
            return Err(anyhow::anyhow!("server.bind_addr is required"));
        }
        if self.server.http_max_in_flight == 0 {
            return Err(anyhow::anyhow!("server.http_max_in_flight must be > 0"));
        }
        if self.llm.model.trim().is_empty() {
            return Err(anyhow::anyhow!("llm.model is required"));
        }
        if self.llm.base_url.trim().is_empty() {
            return Err(anyhow::anyhow!("llm.base_url is required"));
        }
        if self.backend.mode == BackendMode::Http && self.backend.base_url.trim().is_empty() {
            return Err(anyhow::anyhow!(
                "backend.base_url is required when backend.mode = \"http\""
            ));
        }
        if self.agent.react_max_steps == 0 {
            return Err(anyhow::anyhow!("agent.react_max_steps must be > 0"));
        }
        if self.agent.max_session_messages == 0 {
            return Err(anyhow::anyhow!("agent.max_session_messages must be > 0"));
        }
        if self.agent.sse_chunk_size == 0 {
            return Err(anyhow::anyhow!("agent.sse_chunk_size must be > 0"));
        }
        if self.agent.display_cap == 0 || self.agent.clarify_cap == 0 {
            return Err(anyhow::anyhow!(
                "agent.display_cap and agent.clarify_cap must be > 0"
            ));
        }
        Ok(())
    }

    pub fn llm_timeout(&self) -> Duration {
        Duration::from_secs(self.llm.timeout_seconds.max(1))
    }

    pub fn backend_timeout(&self) -> Duration {
        Duration::from_secs(self.backend.timeout_seconds.max(1))
    }
}

fn parse_number<T: std::str::FromStr>(value: &str) -> Option<T> {
    value.trim().parse().ok()
}

pub fn default_config_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    Path::new(&home).join(".nexustodo").join("agent.toml")
}

//! Configuration management

use anyhow::Result;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Known provider base URLs for OpenAI-compatible endpoints
const PROVIDER_BASE_URLS: &[(&str, &str)] = &[
    ("ollama", "http://localhost:11434/v1"),
    ("lmstudio", "http://localhost:1234/v1"),
    ("anthropic", "https://api.anthropic.com/v1/"),
];

/// Agent configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// SQLite database path (capabilities, conversations, tasks)
    pub database_path: PathBuf,

    /// Directory holding capability scripts (one .rhai file per capability)
    pub capabilities_dir: PathBuf,

    /// Model provider name (used for base URL defaults)
    pub llm_provider: String,

    /// Model identifier sent with every completion request
    pub llm_model: String,

    /// API key (optional - local providers don't need one)
    pub llm_api_key: Option<String>,

    /// Explicit base URL override
    pub llm_base_url: Option<String>,

    /// Heartbeat tick interval
    pub heartbeat_interval: Duration,

    /// Conversation history window loaded per turn
    pub max_conversation_history: usize,

    /// Model-call iterations allowed per turn
    pub max_tool_iterations: usize,

    /// Chat transport bind address
    pub http_addr: SocketAddr,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let database_path = std::env::var("TOOLFORGE_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("toolforge.db"));

        let capabilities_dir = std::env::var("TOOLFORGE_CAPABILITIES_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("capabilities"));

        let llm_provider =
            std::env::var("LLM_PROVIDER").unwrap_or_else(|_| "anthropic".to_string());

        let llm_model = std::env::var("LLM_MODEL")
            .unwrap_or_else(|_| "claude-sonnet-4-5-20250929".to_string());

        let llm_api_key = std::env::var("LLM_API_KEY").ok().filter(|s| !s.is_empty());
        let llm_base_url = std::env::var("LLM_BASE_URL").ok().filter(|s| !s.is_empty());

        let heartbeat_interval = std::env::var("HEARTBEAT_INTERVAL_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(Duration::from_secs(300));

        let max_conversation_history = std::env::var("MAX_CONVERSATION_HISTORY")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(100);

        let max_tool_iterations = std::env::var("MAX_TOOL_ITERATIONS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(30);

        let http_addr = std::env::var("TOOLFORGE_HTTP_ADDR")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or_else(|| SocketAddr::from(([127, 0, 0, 1], 8300)));

        Ok(Self {
            database_path,
            capabilities_dir,
            llm_provider,
            llm_model,
            llm_api_key,
            llm_base_url,
            heartbeat_interval,
            max_conversation_history,
            max_tool_iterations,
            http_addr,
        })
    }

    /// Resolve the completion endpoint base URL
    pub fn base_url(&self) -> String {
        if let Some(ref url) = self.llm_base_url {
            return url.clone();
        }
        PROVIDER_BASE_URLS
            .iter()
            .find(|(name, _)| *name == self.llm_provider)
            .map(|(_, url)| (*url).to_string())
            .unwrap_or_default()
    }

    /// Resolve the API key; local providers accept a placeholder
    pub fn api_key(&self) -> String {
        if let Some(ref key) = self.llm_api_key {
            return key.clone();
        }
        match self.llm_provider.as_str() {
            "ollama" | "lmstudio" => "not-needed".to_string(),
            _ => String::new(),
        }
    }
}

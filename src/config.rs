// src/config.rs
//! Process configuration, read from the environment once at startup.

use std::env;
use std::time::Duration;

use tracing::warn;

pub const DEFAULT_PORT: u16 = 8000;
pub const DEFAULT_API_VERSION: &str = "2024-02-15-preview";
pub const DEFAULT_OPENAI_CHAT_URL: &str = "https://api.openai.com/v1/chat/completions";
pub const DEFAULT_OPENAI_MODEL: &str = "gpt-3.5-turbo";
pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful assistant.";
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Which upstream the relay talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provider {
    /// Azure OpenAI deployment, authenticated with a bearer token.
    Azure,
    /// OpenAI-style endpoint, authenticated with a static API key.
    OpenAi,
}

impl Provider {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "azure" => Some(Provider::Azure),
            "openai" => Some(Provider::OpenAi),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub provider: Provider,
    pub azure_endpoint: Option<String>,
    pub azure_deployment: Option<String>,
    pub azure_api_version: String,
    pub openai_api_key: Option<String>,
    pub openai_chat_url: String,
    pub openai_model: String,
    pub system_prompt: String,
    pub timeout: Duration,
    pub template_dir: String,
    pub log_level: String,
    pub log_json: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            provider: Provider::Azure,
            azure_endpoint: None,
            azure_deployment: None,
            azure_api_version: DEFAULT_API_VERSION.to_string(),
            openai_api_key: None,
            openai_chat_url: DEFAULT_OPENAI_CHAT_URL.to_string(),
            openai_model: DEFAULT_OPENAI_MODEL.to_string(),
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            template_dir: "templates".to_string(),
            log_level: "info".to_string(),
            log_json: false,
        }
    }
}

impl Config {
    /// Build a [`Config`] from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Same as [`Config::from_env`] but reads values through `lookup`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Config::default();
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let provider = match non_empty("CHAT_PROVIDER") {
            Some(raw) => Provider::parse(&raw).unwrap_or_else(|| {
                warn!(value = %raw, "unknown CHAT_PROVIDER, falling back to azure");
                Provider::Azure
            }),
            None => defaults.provider,
        };

        let timeout_secs = non_empty("CHAT_TIMEOUT_SECS")
            .and_then(|v| v.trim().parse::<u64>().ok())
            .filter(|secs| *secs > 0)
            .unwrap_or(DEFAULT_TIMEOUT_SECS);

        Self {
            port: non_empty("PORT")
                .and_then(|v| v.trim().parse::<u16>().ok())
                .unwrap_or(defaults.port),
            provider,
            azure_endpoint: non_empty("AZURE_OPENAI_ENDPOINT")
                .map(|v| v.trim().trim_end_matches('/').to_string()),
            azure_deployment: non_empty("AZURE_OPENAI_DEPLOYMENT").map(|v| v.trim().to_string()),
            azure_api_version: non_empty("AZURE_OPENAI_API_VERSION")
                .unwrap_or(defaults.azure_api_version),
            openai_api_key: non_empty("OPENAI_API_KEY"),
            openai_chat_url: non_empty("OPENAI_CHAT_URL").unwrap_or(defaults.openai_chat_url),
            openai_model: non_empty("OPENAI_MODEL").unwrap_or(defaults.openai_model),
            system_prompt: non_empty("SYSTEM_PROMPT").unwrap_or(defaults.system_prompt),
            timeout: Duration::from_secs(timeout_secs),
            template_dir: non_empty("TEMPLATE_DIR").unwrap_or(defaults.template_dir),
            log_level: non_empty("LOG_LEVEL").unwrap_or(defaults.log_level),
            log_json: lookup("LOG_JSON")
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(false),
        }
    }

    /// Environment variables the selected provider needs but does not have.
    pub fn missing_settings(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        match self.provider {
            Provider::Azure => {
                if self.azure_endpoint.is_none() {
                    missing.push("AZURE_OPENAI_ENDPOINT");
                }
                if self.azure_deployment.is_none() {
                    missing.push("AZURE_OPENAI_DEPLOYMENT");
                }
            }
            Provider::OpenAi => {
                if self.openai_api_key.is_none() {
                    missing.push("OPENAI_API_KEY");
                }
            }
        }
        missing
    }
}

// src/services/completions.rs
use std::{sync::Arc, time::Duration};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, instrument};

use super::credential::{COGNITIVE_SERVICES_SCOPE, CredentialError, TokenCredential};
use crate::config::Config;

#[derive(Debug, Error)]
pub enum CompletionError {
    #[error("{0} is not configured")]
    NotConfigured(&'static str),

    #[error("could not acquire access token: {0}")]
    Credential(#[from] CredentialError),

    #[error("completions request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("completions endpoint returned {status}: {body}")]
    Upstream {
        status: reqwest::StatusCode,
        body: String,
    },

    #[error("malformed completions response: {0}")]
    Malformed(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub messages: Vec<ChatMessage>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionResponse {
    pub choices: Vec<Choice>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Choice {
    pub message: ChoiceMessage,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChoiceMessage {
    #[serde(default)]
    pub content: Option<String>,
}

impl CompletionResponse {
    /// Content of the first choice.
    pub fn into_reply(self) -> Result<String, CompletionError> {
        let choice = self
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| CompletionError::Malformed("response has no choices".to_string()))?;
        choice
            .message
            .content
            .ok_or_else(|| CompletionError::Malformed("first choice has no content".to_string()))
    }
}

/// Where completions are sent and how the call is authenticated.
pub enum Upstream {
    Azure {
        endpoint: Option<String>,
        deployment: Option<String>,
        api_version: String,
        credential: Arc<dyn TokenCredential>,
    },
    OpenAi {
        url: String,
        model: String,
        api_key: Option<String>,
    },
}

impl Upstream {
    pub fn azure(cfg: &Config, credential: Arc<dyn TokenCredential>) -> Self {
        Upstream::Azure {
            endpoint: cfg.azure_endpoint.clone(),
            deployment: cfg.azure_deployment.clone(),
            api_version: cfg.azure_api_version.clone(),
            credential,
        }
    }

    pub fn openai(cfg: &Config) -> Self {
        Upstream::OpenAi {
            url: cfg.openai_chat_url.clone(),
            model: cfg.openai_model.clone(),
            api_key: cfg.openai_api_key.clone(),
        }
    }
}

pub fn azure_chat_url(endpoint: &str, deployment: &str, api_version: &str) -> String {
    format!(
        "{}/openai/deployments/{}/chat/completions?api-version={}",
        endpoint.trim_end_matches('/'),
        deployment,
        api_version
    )
}

/// Outbound HTTP client with the relay's request timeout applied.
pub fn http_client(timeout: Duration) -> reqwest::Result<reqwest::Client> {
    reqwest::Client::builder().timeout(timeout).build()
}

pub struct CompletionsClient {
    http: reqwest::Client,
    upstream: Upstream,
    system_prompt: String,
}

impl CompletionsClient {
    pub fn new(http: reqwest::Client, upstream: Upstream, system_prompt: impl Into<String>) -> Self {
        Self {
            http,
            upstream,
            system_prompt: system_prompt.into(),
        }
    }

    /// Send the system prompt plus `user_message` and return the model's reply.
    #[instrument(skip_all)]
    pub async fn complete(&self, user_message: &str) -> Result<String, CompletionError> {
        let messages = vec![
            ChatMessage::system(self.system_prompt.as_str()),
            ChatMessage::user(user_message),
        ];

        let request = match &self.upstream {
            Upstream::Azure {
                endpoint,
                deployment,
                api_version,
                credential,
            } => {
                let endpoint = endpoint
                    .as_deref()
                    .ok_or(CompletionError::NotConfigured("AZURE_OPENAI_ENDPOINT"))?;
                let deployment = deployment
                    .as_deref()
                    .ok_or(CompletionError::NotConfigured("AZURE_OPENAI_DEPLOYMENT"))?;

                let token = credential.get_token(COGNITIVE_SERVICES_SCOPE).await?;
                let url = azure_chat_url(endpoint, deployment, api_version);
                debug!(%url, "sending chat completion");

                self.http
                    .post(url)
                    .bearer_auth(&token.token)
                    .json(&CompletionRequest { model: None, messages })
            }
            Upstream::OpenAi { url, model, api_key } => {
                let api_key = api_key
                    .as_deref()
                    .ok_or(CompletionError::NotConfigured("OPENAI_API_KEY"))?;
                debug!(%url, %model, "sending chat completion");

                self.http
                    .post(url)
                    .bearer_auth(api_key)
                    .json(&CompletionRequest {
                        model: Some(model.clone()),
                        messages,
                    })
            }
        };

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(CompletionError::Upstream { status, body });
        }

        let parsed: CompletionResponse = response
            .json()
            .await
            .map_err(|e| CompletionError::Malformed(e.to_string()))?;
        parsed.into_reply()
    }
}

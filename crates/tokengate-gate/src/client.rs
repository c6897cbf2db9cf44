//! Outbound completion clients.
//!
//! One thin HTTP client per provider, both implementing
//! [`CompletionClient`]. They translate transport and upstream failures
//! into [`GateError::Provider`] and surface the provider-reported token
//! counts so accounting can prefer real numbers over estimates.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tokengate_core::{
    CompletionClient, CompletionResponse, GateConfig, GateError, Provider, Result,
};
use tracing::debug;

const ANTHROPIC_DEFAULT_URL: &str = "https://api.anthropic.com";
const OPENAI_DEFAULT_URL: &str = "https://api.openai.com";
const ANTHROPIC_VERSION: &str = "2023-06-01";

fn http_client(timeout_secs: u64) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .build()
        .map_err(|e| GateError::Config(format!("Failed to build HTTP client: {e}")))
}

fn require_key(config: &GateConfig, provider: Provider) -> Result<String> {
    config
        .limits(provider)
        .api_key
        .clone()
        .ok_or_else(|| GateError::Config(format!("{provider}: api_key is not configured")))
}

async fn read_error_body(provider: Provider, response: reqwest::Response) -> GateError {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    let snippet: String = body.chars().take(200).collect();
    GateError::Provider {
        provider,
        message: format!("HTTP {status}: {snippet}"),
    }
}

// ---------------------------------------------------------------------------
// Anthropic
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct AnthropicMessageResponse {
    id: String,
    content: Vec<AnthropicContentBlock>,
    usage: AnthropicUsage,
}

#[derive(Deserialize)]
struct AnthropicContentBlock {
    #[serde(default)]
    text: String,
}

#[derive(Deserialize)]
struct AnthropicUsage {
    input_tokens: u64,
    output_tokens: u64,
}

/// Client for the Anthropic messages API.
pub struct AnthropicClient {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
}

impl AnthropicClient {
    /// Build from configuration.
    ///
    /// # Errors
    ///
    /// Returns [`GateError::Config`] if no API key is configured.
    pub fn from_config(config: &GateConfig) -> Result<Self> {
        Ok(Self {
            client: http_client(config.call_timeout_secs)?,
            api_key: require_key(config, Provider::Anthropic)?,
            base_url: config
                .anthropic
                .base_url
                .clone()
                .unwrap_or_else(|| ANTHROPIC_DEFAULT_URL.to_string()),
        })
    }
}

#[async_trait]
impl CompletionClient for AnthropicClient {
    fn provider(&self) -> Provider {
        Provider::Anthropic
    }

    async fn send(
        &self,
        prompt: &str,
        model: &str,
        max_tokens: u32,
    ) -> Result<CompletionResponse> {
        let url = format!("{}/v1/messages", self.base_url);
        let response = self
            .client
            .post(&url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&json!({
                "model": model,
                "max_tokens": max_tokens,
                "messages": [{ "role": "user", "content": prompt }],
            }))
            .send()
            .await
            .map_err(|e| GateError::Provider {
                provider: Provider::Anthropic,
                message: format!("Request failed: {e}"),
            })?;

        if !response.status().is_success() {
            return Err(read_error_body(Provider::Anthropic, response).await);
        }

        let body: AnthropicMessageResponse =
            response.json().await.map_err(|e| GateError::Provider {
                provider: Provider::Anthropic,
                message: format!("Malformed response: {e}"),
            })?;

        debug!(
            tokens_in = body.usage.input_tokens,
            tokens_out = body.usage.output_tokens,
            "Anthropic call completed"
        );

        Ok(CompletionResponse {
            text: body
                .content
                .into_iter()
                .map(|block| block.text)
                .collect::<Vec<_>>()
                .join(""),
            tokens_in: body.usage.input_tokens,
            tokens_out: body.usage.output_tokens,
            request_id: Some(body.id),
        })
    }
}

// ---------------------------------------------------------------------------
// OpenAI
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct OpenAiChatResponse {
    id: String,
    choices: Vec<OpenAiChoice>,
    #[serde(default)]
    usage: Option<OpenAiUsage>,
}

#[derive(Deserialize)]
struct OpenAiChoice {
    message: OpenAiMessage,
}

#[derive(Deserialize)]
struct OpenAiMessage {
    #[serde(default)]
    content: String,
}

#[derive(Deserialize)]
struct OpenAiUsage {
    prompt_tokens: u64,
    completion_tokens: u64,
}

/// Client for the OpenAI chat-completions API.
pub struct OpenAiClient {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
}

impl OpenAiClient {
    /// Build from configuration.
    ///
    /// # Errors
    ///
    /// Returns [`GateError::Config`] if no API key is configured.
    pub fn from_config(config: &GateConfig) -> Result<Self> {
        Ok(Self {
            client: http_client(config.call_timeout_secs)?,
            api_key: require_key(config, Provider::OpenAI)?,
            base_url: config
                .openai
                .base_url
                .clone()
                .unwrap_or_else(|| OPENAI_DEFAULT_URL.to_string()),
        })
    }
}

#[async_trait]
impl CompletionClient for OpenAiClient {
    fn provider(&self) -> Provider {
        Provider::OpenAI
    }

    async fn send(
        &self,
        prompt: &str,
        model: &str,
        max_tokens: u32,
    ) -> Result<CompletionResponse> {
        let url = format!("{}/v1/chat/completions", self.base_url);
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&json!({
                "model": model,
                "max_tokens": max_tokens,
                "messages": [{ "role": "user", "content": prompt }],
            }))
            .send()
            .await
            .map_err(|e| GateError::Provider {
                provider: Provider::OpenAI,
                message: format!("Request failed: {e}"),
            })?;

        if !response.status().is_success() {
            return Err(read_error_body(Provider::OpenAI, response).await);
        }

        let body: OpenAiChatResponse =
            response.json().await.map_err(|e| GateError::Provider {
                provider: Provider::OpenAI,
                message: format!("Malformed response: {e}"),
            })?;

        let (tokens_in, tokens_out) = body
            .usage
            .as_ref()
            .map_or((0, 0), |u| (u.prompt_tokens, u.completion_tokens));

        debug!(tokens_in, tokens_out, "OpenAI call completed");

        Ok(CompletionResponse {
            text: body
                .choices
                .into_iter()
                .next()
                .map(|c| c.message.content)
                .unwrap_or_default(),
            tokens_in,
            tokens_out,
            request_id: Some(body.id),
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

mod client;
pub(crate) mod types;

use crate::error::AiError;
use crate::traits::LanguageModel;
use anyhow::Result;
use async_trait::async_trait;
use std::time::Duration;

use client::ClaudeClient;
use types::*;

pub const DEFAULT_MODEL: &str = "claude-haiku-4-5-20251001";

// =============================================================================
// Claude
// =============================================================================

#[derive(Clone)]
pub struct Claude {
    api_key: String,
    pub(crate) model: String,
    system: String,
    base_url: Option<String>,
    http: reqwest::Client,
}

impl Claude {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            model: model.into(),
            system: "You are a careful analyst. Follow the requested output format exactly."
                .to_string(),
            base_url: None,
            http: default_http(),
        }
    }

    pub fn from_env(model: impl Into<String>) -> Result<Self> {
        let api_key = std::env::var("ANTHROPIC_API_KEY")
            .map_err(|_| AiError::Config("ANTHROPIC_API_KEY environment variable not set".into()))?;
        Ok(Self::new(api_key, model))
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = Some(url.into());
        self
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = system.into();
        self
    }

    fn client(&self) -> ClaudeClient {
        let client = ClaudeClient::new(&self.api_key, self.http.clone());
        match self.base_url {
            Some(ref url) => client.with_base_url(url),
            None => client,
        }
    }
}

#[async_trait]
impl LanguageModel for Claude {
    async fn invoke(&self, prompt: &str) -> Result<String> {
        let request = ChatRequest::new(&self.model)
            .system(self.system.clone())
            .message(WireMessage::user(prompt))
            .max_tokens(4096)
            .temperature(0.0);

        let response = self.client().chat(&request).await?;

        response
            .text()
            .ok_or_else(|| AiError::EmptyResponse("Claude").into())
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

/// Shared HTTP client with a request timeout; a hung call is bounded here,
/// not by the callers.
pub(crate) fn default_http() -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(120))
        .build()
        .unwrap_or_default()
}

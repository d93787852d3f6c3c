//! HTTP client for the one-shot LLM gateway.

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use tracing::debug;

use crate::domain::errors::LlmError;
use crate::domain::ports::LlmClient;
use crate::domain::types::OneShotRequest;

pub struct HttpLlmGateway {
    client: Client,
    base_url: String,
    api_key: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OneShotReply {
    #[serde(default)]
    text: String,
}

impl HttpLlmGateway {
    pub fn new(base_url: String, api_key: Option<String>) -> Self {
        // LLM replies can take a while; the timeout stays under the worker
        // reject cooldown so a hung gateway degrades to a cooldown.
        let client = Client::builder()
            .timeout(Duration::from_secs(40))
            .connect_timeout(Duration::from_secs(5))
            .build()
            .unwrap_or_else(|_| Client::new());

        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
        }
    }
}

#[async_trait]
impl LlmClient for HttpLlmGateway {
    async fn request_one_shot_text(&self, request: OneShotRequest) -> Result<String> {
        debug!(
            "LlmGateway: one-shot request, model={} mode={}",
            request.model, request.trading_mode
        );
        let mut builder = self
            .client
            .post(format!("{}/v1/one-shot", self.base_url))
            .json(&request);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }
        let response = builder.send().await.map_err(|e| LlmError::Transport {
            reason: e.to_string(),
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(LlmError::Status {
                status: status.as_u16(),
                body,
            }
            .into());
        }

        let reply: OneShotReply = response.json().await.map_err(|e| LlmError::Transport {
            reason: e.to_string(),
        })?;
        if reply.text.trim().is_empty() {
            return Err(LlmError::EmptyReply {
                model: request.model,
            }
            .into());
        }
        Ok(reply.text)
    }
}

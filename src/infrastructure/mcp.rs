//! HTTP client for the browser-automation / trading MCP tool bridge.

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use reqwest::Client;
use serde_json::json;
use tracing::debug;

use crate::domain::errors::McpError;
use crate::domain::ports::McpClient;
use crate::domain::types::{McpNamespace, McpToolResult};

pub struct HttpMcpBridge {
    client: Client,
    base_url: String,
}

impl HttpMcpBridge {
    pub fn new(base_url: String) -> Self {
        // Screenshot capture can be slow on a cold browser.
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .connect_timeout(Duration::from_secs(5))
            .build()
            .unwrap_or_else(|_| Client::new());

        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl McpClient for HttpMcpBridge {
    async fn execute_tool(
        &self,
        name: &str,
        args: serde_json::Value,
        namespace: McpNamespace,
    ) -> Result<McpToolResult> {
        debug!("McpBridge: execute {} in {:?}", name, namespace);
        let body = json!({
            "name": name,
            "args": args,
            "namespace": namespace,
        });
        let response = self
            .client
            .post(format!("{}/tools/execute", self.base_url))
            .json(&body)
            .send()
            .await
            .map_err(|e| McpError::Transport {
                reason: e.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(McpError::ToolFailed {
                tool: name.to_string(),
                namespace: format!("{namespace:?}").to_lowercase(),
                reason: format!("{status}: {text}"),
            }
            .into());
        }

        response.json::<McpToolResult>().await.map_err(|e| {
            McpError::Transport {
                reason: e.to_string(),
            }
            .into()
        })
    }
}

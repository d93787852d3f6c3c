//! HTTP client for the guided-trading backend.

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, StatusCode};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::domain::errors::BackendError;
use crate::domain::market::normalize_market;
use crate::domain::ports::GuidedTradingApi;
use crate::domain::types::{
    AdoptRequest, AgentContext, EntryRequest, Opportunity, Position, TodayStats, TradingMode,
};

pub struct HttpGuidedTradingApi {
    client: Client,
    base_url: String,
    token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpportunitiesDto {
    #[serde(default)]
    opportunities: Vec<Opportunity>,
}

impl HttpGuidedTradingApi {
    pub fn new(base_url: String, token: Option<String>) -> Self {
        // Connection pool limits and timeouts sized for a 10s tick cadence.
        let client = Client::builder()
            .pool_max_idle_per_host(5)
            .timeout(Duration::from_secs(15))
            .connect_timeout(Duration::from_secs(5))
            .build()
            .unwrap_or_else(|_| Client::new());

        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
        }
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let mut builder = self
            .client
            .request(method, format!("{}{}", self.base_url, path));
        if let Some(token) = &self.token {
            builder = builder.bearer_auth(token);
        }
        builder
    }

    async fn decode<T: DeserializeOwned>(path: &str, response: reqwest::Response) -> Result<T> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(BackendError::Status {
                status: status.as_u16(),
                path: path.to_string(),
                body,
            }
            .into());
        }
        response.json::<T>().await.map_err(|e| {
            BackendError::Decode {
                path: path.to_string(),
                reason: e.to_string(),
            }
            .into()
        })
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T> {
        debug!("GuidedTradingApi: GET {} {:?}", path, query);
        let response = self
            .request(Method::GET, path)
            .query(query)
            .send()
            .await
            .map_err(|e| BackendError::Transport {
                reason: e.to_string(),
            })?;
        Self::decode(path, response).await
    }

    async fn post_json(&self, path: &str, body: &serde_json::Value) -> Result<()> {
        debug!("GuidedTradingApi: POST {}", path);
        let response = self
            .request(Method::POST, path)
            .json(body)
            .send()
            .await
            .map_err(|e| BackendError::Transport {
                reason: e.to_string(),
            })?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(BackendError::Status {
                status: status.as_u16(),
                path: path.to_string(),
                body: text,
            }
            .into());
        }
        Ok(())
    }
}

#[async_trait]
impl GuidedTradingApi for HttpGuidedTradingApi {
    async fn today_stats(&self) -> Result<TodayStats> {
        self.get_json("/api/autopilot/today-stats", &[]).await
    }

    async fn open_positions(&self) -> Result<Vec<Position>> {
        self.get_json("/api/autopilot/positions", &[]).await
    }

    async fn autopilot_opportunities(
        &self,
        primary_interval: &str,
        confirm_interval: &str,
        mode: TradingMode,
        limit: usize,
    ) -> Result<Vec<Opportunity>> {
        let dto: OpportunitiesDto = self
            .get_json(
                "/api/autopilot/opportunities",
                &[
                    ("primaryInterval", primary_interval.to_string()),
                    ("confirmInterval", confirm_interval.to_string()),
                    ("mode", mode.to_string()),
                    ("limit", limit.to_string()),
                ],
            )
            .await?;
        Ok(dto.opportunities)
    }

    async fn agent_context(
        &self,
        market: &str,
        interval: &str,
        count: usize,
        closed_trade_limit: usize,
        mode: TradingMode,
    ) -> Result<AgentContext> {
        self.get_json(
            "/api/agent/context",
            &[
                ("market", normalize_market(market)),
                ("interval", interval.to_string()),
                ("count", count.to_string()),
                ("closedTradeLimit", closed_trade_limit.to_string()),
                ("mode", mode.to_string()),
            ],
        )
        .await
    }

    async fn position(&self, market: &str) -> Result<Option<Position>> {
        let path = "/api/autopilot/position";
        let response = self
            .request(Method::GET, path)
            .query(&[("market", normalize_market(market))])
            .send()
            .await
            .map_err(|e| BackendError::Transport {
                reason: e.to_string(),
            })?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let position: Position = Self::decode(path, response).await?;
        Ok(Some(position))
    }

    async fn start_entry(&self, request: EntryRequest) -> Result<()> {
        let body = serde_json::to_value(&request)?;
        self.post_json("/api/guided/start", &body).await
    }

    async fn cancel_pending(&self, market: &str) -> Result<()> {
        let body = serde_json::json!({ "market": normalize_market(market) });
        self.post_json("/api/guided/cancel-pending", &body).await
    }

    async fn stop_position(&self, market: &str) -> Result<()> {
        let body = serde_json::json!({ "market": normalize_market(market) });
        self.post_json("/api/guided/stop", &body).await
    }

    async fn partial_take_profit(&self, market: &str, ratio: f64) -> Result<()> {
        let body = serde_json::json!({
            "market": normalize_market(market),
            "ratio": ratio,
        });
        self.post_json("/api/guided/partial-take-profit", &body).await
    }

    async fn adopt_position(&self, request: AdoptRequest) -> Result<()> {
        let body = serde_json::to_value(&request)?;
        self.post_json("/api/guided/adopt", &body).await
    }

    async fn log_decision(&self, payload: serde_json::Value) -> Result<()> {
        self.post_json("/api/autopilot/decision-log", &payload).await
    }
}

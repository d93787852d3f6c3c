use crate::domain::types::{
    AdoptRequest, AgentContext, AutopilotState, EntryRequest, McpNamespace, McpToolResult,
    OneShotRequest, Opportunity, Position, TodayStats, TradingMode,
};
use anyhow::Result;
use async_trait::async_trait;

/// Guided-trading backend capability set. All methods are failable; the
/// orchestrator and workers map failures to events and cooldowns, never
/// propagating past a tick boundary.
#[async_trait]
pub trait GuidedTradingApi: Send + Sync {
    async fn today_stats(&self) -> Result<TodayStats>;
    async fn open_positions(&self) -> Result<Vec<Position>>;
    async fn autopilot_opportunities(
        &self,
        primary_interval: &str,
        confirm_interval: &str,
        mode: TradingMode,
        limit: usize,
    ) -> Result<Vec<Opportunity>>;
    async fn agent_context(
        &self,
        market: &str,
        interval: &str,
        count: usize,
        closed_trade_limit: usize,
        mode: TradingMode,
    ) -> Result<AgentContext>;
    async fn position(&self, market: &str) -> Result<Option<Position>>;
    async fn start_entry(&self, request: EntryRequest) -> Result<()>;
    async fn cancel_pending(&self, market: &str) -> Result<()>;
    async fn stop_position(&self, market: &str) -> Result<()>;
    async fn partial_take_profit(&self, market: &str, ratio: f64) -> Result<()>;
    async fn adopt_position(&self, request: AdoptRequest) -> Result<()>;
    /// Best-effort decision journal; failures degrade to a WARN event.
    async fn log_decision(&self, payload: serde_json::Value) -> Result<()>;
}

#[async_trait]
pub trait LlmClient: Send + Sync {
    /// One-shot text completion. Callers parse the reply as JSON with the
    /// tolerant extraction in [`crate::domain::review`].
    async fn request_one_shot_text(&self, request: OneShotRequest) -> Result<String>;
}

#[async_trait]
pub trait McpClient: Send + Sync {
    async fn execute_tool(
        &self,
        name: &str,
        args: serde_json::Value,
        namespace: McpNamespace,
    ) -> Result<McpToolResult>;
}

/// Push-only snapshot/log surface towards the embedding host. No
/// back-pressure; implementations must not block.
pub trait AutopilotSink: Send + Sync {
    fn on_state(&self, state: AutopilotState);
    fn on_log(&self, line: &str);
}

/// Sink that drops everything, for headless operation and tests that only
/// inspect orchestrator state directly.
pub struct NullSink;

impl AutopilotSink for NullSink {
    fn on_state(&self, _state: AutopilotState) {}
    fn on_log(&self, _line: &str) {}
}

//! In-memory mock services for tests and `--mode mock` demo runs.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use anyhow::Result;
use async_trait::async_trait;
use rand::Rng;

use crate::domain::market::normalize_market;
use crate::domain::ports::{AutopilotSink, GuidedTradingApi, LlmClient, McpClient};
use crate::domain::types::{
    AdoptRequest, AgentContext, AutopilotState, ChartContext, EntryRequest, McpContent,
    McpNamespace, McpToolResult, OneShotRequest, Opportunity, OpportunityStage, OrderType,
    Position, PositionStatus, Recommendation, TodayStats, TradingMode,
};

#[derive(Default)]
pub struct MockGuidedTradingApi {
    stats: Mutex<TodayStats>,
    positions: Mutex<HashMap<String, Position>>,
    opportunities: Mutex<Vec<Opportunity>>,
    contexts: Mutex<HashMap<String, AgentContext>>,
    calls: Mutex<Vec<String>>,
    entry_requests: Mutex<Vec<EntryRequest>>,
    cancelled: Mutex<Vec<String>>,
    stopped: Mutex<Vec<String>>,
    partial_tps: Mutex<Vec<(String, f64)>>,
    decision_logs: Mutex<Vec<serde_json::Value>>,
    adoptions: Mutex<Vec<AdoptRequest>>,
    fail_start_entry: AtomicBool,
    fail_decision_log: AtomicBool,
    /// Demo mode: entries materialize positions with drifting pnl.
    simulate_fills: AtomicBool,
}

impl MockGuidedTradingApi {
    pub fn new() -> Self {
        Self::default()
    }

    /// Scripted demo: a couple of ranked opportunities with contexts, and
    /// simulated fills whose pnl drifts on every poll.
    pub fn demo() -> Self {
        let mock = Self::new();
        mock.simulate_fills.store(true, Ordering::SeqCst);
        mock.set_stats(TodayStats {
            total_pnl_krw: 12_000,
            trade_count: 4,
            win_count: 3,
        });
        mock.set_opportunities(vec![
            demo_opportunity("KRW-BTC", OpportunityStage::AutoPass, 74.0, 0.12),
            demo_opportunity("KRW-ETH", OpportunityStage::Borderline, 61.0, 0.45),
        ]);
        mock.set_context("KRW-BTC", demo_context(61_500_000.0));
        mock.set_context("KRW-ETH", demo_context(3_420_000.0));
        mock
    }

    fn record(&self, call: impl Into<String>) {
        self.calls.lock().unwrap().push(call.into());
    }

    pub fn set_stats(&self, stats: TodayStats) {
        *self.stats.lock().unwrap() = stats;
    }

    pub fn set_opportunities(&self, opportunities: Vec<Opportunity>) {
        *self.opportunities.lock().unwrap() = opportunities;
    }

    pub fn set_context(&self, market: &str, context: AgentContext) {
        self.contexts
            .lock()
            .unwrap()
            .insert(normalize_market(market), context);
    }

    pub fn upsert_position(&self, position: Position) {
        self.positions
            .lock()
            .unwrap()
            .insert(normalize_market(&position.market), position);
    }

    pub fn clear_position(&self, market: &str) {
        self.positions.lock().unwrap().remove(&normalize_market(market));
    }

    pub fn set_fail_start_entry(&self, fail: bool) {
        self.fail_start_entry.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_decision_log(&self, fail: bool) {
        self.fail_decision_log.store(fail, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self, name: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.starts_with(name))
            .count()
    }

    pub fn entry_requests(&self) -> Vec<EntryRequest> {
        self.entry_requests.lock().unwrap().clone()
    }

    pub fn cancelled_markets(&self) -> Vec<String> {
        self.cancelled.lock().unwrap().clone()
    }

    pub fn stopped_markets(&self) -> Vec<String> {
        self.stopped.lock().unwrap().clone()
    }

    pub fn partial_take_profits(&self) -> Vec<(String, f64)> {
        self.partial_tps.lock().unwrap().clone()
    }

    pub fn decision_logs(&self) -> Vec<serde_json::Value> {
        self.decision_logs.lock().unwrap().clone()
    }

    pub fn adoptions(&self) -> Vec<AdoptRequest> {
        self.adoptions.lock().unwrap().clone()
    }
}

fn demo_opportunity(market: &str, stage: OpportunityStage, score: f64, gap: f64) -> Opportunity {
    Opportunity {
        market: market.to_string(),
        korean_name: String::new(),
        recommended_entry_win_rate_1m: 64.0,
        recommended_entry_win_rate_10m: 58.0,
        market_entry_win_rate_1m: 55.0,
        market_entry_win_rate_10m: 52.0,
        risk_reward_1m: 1.6,
        entry_gap_pct_1m: gap,
        expectancy_pct: 0.3,
        score,
        stage,
        reason: "scripted demo opportunity".to_string(),
    }
}

fn demo_context(entry: f64) -> AgentContext {
    AgentContext {
        chart: ChartContext {
            recommendation: Some(Recommendation {
                recommended_entry: entry,
                stop_loss: entry * 0.99,
                take_profit: entry * 1.02,
                risk_reward: 1.6,
                current_price: entry * 1.001,
            }),
            orderbook: None,
        },
        feature_pack: None,
    }
}

#[async_trait]
impl GuidedTradingApi for MockGuidedTradingApi {
    async fn today_stats(&self) -> Result<TodayStats> {
        self.record("today_stats");
        Ok(self.stats.lock().unwrap().clone())
    }

    async fn open_positions(&self) -> Result<Vec<Position>> {
        self.record("open_positions");
        Ok(self.positions.lock().unwrap().values().cloned().collect())
    }

    async fn autopilot_opportunities(
        &self,
        _primary_interval: &str,
        _confirm_interval: &str,
        _mode: TradingMode,
        limit: usize,
    ) -> Result<Vec<Opportunity>> {
        self.record("autopilot_opportunities");
        let opportunities = self.opportunities.lock().unwrap().clone();
        Ok(opportunities.into_iter().take(limit).collect())
    }

    async fn agent_context(
        &self,
        market: &str,
        _interval: &str,
        _count: usize,
        _closed_trade_limit: usize,
        _mode: TradingMode,
    ) -> Result<AgentContext> {
        let market = normalize_market(market);
        self.record(format!("agent_context {market}"));
        self.contexts
            .lock()
            .unwrap()
            .get(&market)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("no scripted context for {market}"))
    }

    async fn position(&self, market: &str) -> Result<Option<Position>> {
        let market = normalize_market(market);
        self.record(format!("position {market}"));
        let mut positions = self.positions.lock().unwrap();
        if self.simulate_fills.load(Ordering::SeqCst) {
            if let Some(p) = positions.get_mut(&market) {
                if p.status == PositionStatus::Open {
                    p.unrealized_pnl_percent += rand::rng().random_range(-0.25..0.35);
                }
            }
        }
        Ok(positions.get(&market).cloned())
    }

    async fn start_entry(&self, request: EntryRequest) -> Result<()> {
        self.record(format!("start_entry {}", request.market));
        if self.fail_start_entry.load(Ordering::SeqCst) {
            anyhow::bail!("scripted start_entry failure");
        }
        if self.simulate_fills.load(Ordering::SeqCst) {
            let status = match request.order_type {
                OrderType::Market => PositionStatus::Open,
                OrderType::Limit => PositionStatus::PendingEntry,
            };
            self.upsert_position(Position {
                market: request.market.clone(),
                status,
                unrealized_pnl_percent: 0.0,
                half_take_profit_done: false,
                trailing_active: false,
                entry_price: request.limit_price.unwrap_or_default(),
                amount_krw: request.amount_krw,
            });
        }
        self.entry_requests.lock().unwrap().push(request);
        Ok(())
    }

    async fn cancel_pending(&self, market: &str) -> Result<()> {
        let market = normalize_market(market);
        self.record(format!("cancel_pending {market}"));
        if self.simulate_fills.load(Ordering::SeqCst) {
            self.positions.lock().unwrap().remove(&market);
        }
        self.cancelled.lock().unwrap().push(market);
        Ok(())
    }

    async fn stop_position(&self, market: &str) -> Result<()> {
        let market = normalize_market(market);
        self.record(format!("stop_position {market}"));
        self.positions.lock().unwrap().remove(&market);
        self.stopped.lock().unwrap().push(market);
        Ok(())
    }

    async fn partial_take_profit(&self, market: &str, ratio: f64) -> Result<()> {
        let market = normalize_market(market);
        self.record(format!("partial_take_profit {market}"));
        if let Some(p) = self.positions.lock().unwrap().get_mut(&market) {
            p.half_take_profit_done = true;
        }
        self.partial_tps.lock().unwrap().push((market, ratio));
        Ok(())
    }

    async fn adopt_position(&self, request: AdoptRequest) -> Result<()> {
        self.record(format!("adopt_position {}", request.market));
        self.adoptions.lock().unwrap().push(request);
        Ok(())
    }

    async fn log_decision(&self, payload: serde_json::Value) -> Result<()> {
        self.record("log_decision");
        if self.fail_decision_log.load(Ordering::SeqCst) {
            anyhow::bail!("scripted decision log failure");
        }
        self.decision_logs.lock().unwrap().push(payload);
        Ok(())
    }
}

/// LLM mock with a queue of scripted replies and a default fallback.
pub struct MockLlmClient {
    replies: Mutex<VecDeque<String>>,
    default_reply: Mutex<String>,
    fail: AtomicBool,
    calls: AtomicU32,
}

impl Default for MockLlmClient {
    fn default() -> Self {
        Self::new()
    }
}

impl MockLlmClient {
    pub fn new() -> Self {
        Self {
            replies: Mutex::new(VecDeque::new()),
            default_reply: Mutex::new(
                r#"{"approve": true, "confidence": 80, "severity": "LOW", "reason": "mock approval"}"#
                    .to_string(),
            ),
            fail: AtomicBool::new(false),
            calls: AtomicU32::new(0),
        }
    }

    pub fn push_reply(&self, reply: &str) {
        self.replies.lock().unwrap().push_back(reply.to_string());
    }

    pub fn set_default_reply(&self, reply: &str) {
        *self.default_reply.lock().unwrap() = reply.to_string();
    }

    pub fn set_fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn call_count(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn request_one_shot_text(&self, _request: OneShotRequest) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            anyhow::bail!("scripted llm failure");
        }
        let queued = self.replies.lock().unwrap().pop_front();
        Ok(queued.unwrap_or_else(|| self.default_reply.lock().unwrap().clone()))
    }
}

/// MCP mock returning a scripted result queue; defaults to a text "ok".
pub struct MockMcpClient {
    results: Mutex<VecDeque<McpToolResult>>,
    calls: Mutex<Vec<(String, McpNamespace)>>,
    fail: AtomicBool,
}

impl Default for MockMcpClient {
    fn default() -> Self {
        Self::new()
    }
}

impl MockMcpClient {
    pub fn new() -> Self {
        Self {
            results: Mutex::new(VecDeque::new()),
            calls: Mutex::new(Vec::new()),
            fail: AtomicBool::new(false),
        }
    }

    pub fn push_result(&self, result: McpToolResult) {
        self.results.lock().unwrap().push_back(result);
    }

    pub fn set_fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<(String, McpNamespace)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl McpClient for MockMcpClient {
    async fn execute_tool(
        &self,
        name: &str,
        _args: serde_json::Value,
        namespace: McpNamespace,
    ) -> Result<McpToolResult> {
        self.calls.lock().unwrap().push((name.to_string(), namespace));
        if self.fail.load(Ordering::SeqCst) {
            anyhow::bail!("scripted mcp failure");
        }
        let queued = self.results.lock().unwrap().pop_front();
        Ok(queued.unwrap_or_else(|| McpToolResult {
            content: vec![McpContent {
                kind: "text".to_string(),
                text: Some("ok".to_string()),
                data: None,
                url: None,
                mime_type: None,
            }],
            is_error: false,
        }))
    }
}

/// Sink capturing every snapshot and log line.
#[derive(Default)]
pub struct MemorySink {
    states: Mutex<Vec<AutopilotState>>,
    logs: Mutex<Vec<String>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last_state(&self) -> Option<AutopilotState> {
        self.states.lock().unwrap().last().cloned()
    }

    pub fn state_count(&self) -> usize {
        self.states.lock().unwrap().len()
    }

    pub fn log_lines(&self) -> Vec<String> {
        self.logs.lock().unwrap().clone()
    }
}

impl AutopilotSink for MemorySink {
    fn on_state(&self, state: AutopilotState) {
        self.states.lock().unwrap().push(state);
    }

    fn on_log(&self, line: &str) {
        self.logs.lock().unwrap().push(line.to_string());
    }
}

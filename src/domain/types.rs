use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Current wall-clock time as UTC epoch milliseconds.
///
/// Deadlines and cadences are computed from this; only the KST date-key
/// rollover and event timestamps depend on wall-clock semantics.
pub fn epoch_ms() -> i64 {
    Utc::now().timestamp_millis()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TradingMode {
    Scalp,
    Swing,
    Position,
}

impl std::str::FromStr for TradingMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "SCALP" => Ok(TradingMode::Scalp),
            "SWING" => Ok(TradingMode::Swing),
            "POSITION" => Ok(TradingMode::Position),
            _ => anyhow::bail!("Invalid trading mode: {}. Must be SCALP, SWING or POSITION", s),
        }
    }
}

impl std::fmt::Display for TradingMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TradingMode::Scalp => write!(f, "SCALP"),
            TradingMode::Swing => write!(f, "SWING"),
            TradingMode::Position => write!(f, "POSITION"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntryPolicy {
    Balanced,
    Aggressive,
    Conservative,
}

impl std::str::FromStr for EntryPolicy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "BALANCED" => Ok(EntryPolicy::Balanced),
            "AGGRESSIVE" => Ok(EntryPolicy::Aggressive),
            "CONSERVATIVE" => Ok(EntryPolicy::Conservative),
            _ => anyhow::bail!(
                "Invalid entry policy: {}. Must be BALANCED, AGGRESSIVE or CONSERVATIVE",
                s
            ),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntryOrderMode {
    Adaptive,
    Market,
    Limit,
}

impl std::str::FromStr for EntryOrderMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "ADAPTIVE" => Ok(EntryOrderMode::Adaptive),
            "MARKET" => Ok(EntryOrderMode::Market),
            "LIMIT" => Ok(EntryOrderMode::Limit),
            _ => anyhow::bail!(
                "Invalid entry order mode: {}. Must be ADAPTIVE, MARKET or LIMIT",
                s
            ),
        }
    }
}

/// Entry gate for the focused-scalp fast lane. `FAST_ONLY` skips the LLM
/// entry review for focused workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FocusedEntryGate {
    FastOnly,
}

// ===== Opportunities & candidates =====

/// Backend-assigned opportunity grade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OpportunityStage {
    AutoPass,
    Borderline,
    RuleFail,
}

impl OpportunityStage {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_uppercase().as_str() {
            "AUTO_PASS" => Some(OpportunityStage::AutoPass),
            "BORDERLINE" => Some(OpportunityStage::Borderline),
            "RULE_FAIL" => Some(OpportunityStage::RuleFail),
            _ => None,
        }
    }
}

/// Ranked entry candidate as produced by the guided-trading backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Opportunity {
    pub market: String,
    #[serde(default)]
    pub korean_name: String,
    #[serde(default)]
    pub recommended_entry_win_rate_1m: f64,
    #[serde(default)]
    pub recommended_entry_win_rate_10m: f64,
    #[serde(default)]
    pub market_entry_win_rate_1m: f64,
    #[serde(default)]
    pub market_entry_win_rate_10m: f64,
    #[serde(default)]
    pub risk_reward_1m: f64,
    #[serde(default)]
    pub entry_gap_pct_1m: f64,
    #[serde(default)]
    pub expectancy_pct: f64,
    #[serde(default)]
    pub score: f64,
    pub stage: OpportunityStage,
    #[serde(default)]
    pub reason: String,
}

/// Local gating stage of a candidate as projected to the state snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CandidateStage {
    AutoPass,
    Borderline,
    RulePass,
    RuleFail,
    SlotFull,
    PositionOpen,
    WorkerActive,
    Cooldown,
    LlmReject,
    PlaywrightWarn,
    Entered,
}

impl From<OpportunityStage> for CandidateStage {
    fn from(stage: OpportunityStage) -> Self {
        match stage {
            OpportunityStage::AutoPass => CandidateStage::AutoPass,
            OpportunityStage::Borderline => CandidateStage::Borderline,
            OpportunityStage::RuleFail => CandidateStage::RuleFail,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Candidate {
    pub opportunity: Opportunity,
    pub stage: CandidateStage,
    pub reason: String,
    pub updated_at: i64,
}

impl Candidate {
    pub fn new(opportunity: Opportunity, stage: CandidateStage, reason: impl Into<String>) -> Self {
        Self {
            opportunity,
            stage,
            reason: reason.into(),
            updated_at: epoch_ms(),
        }
    }
}

// ===== Positions & stats =====

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PositionStatus {
    Open,
    PendingEntry,
    Closed,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Position {
    pub market: String,
    pub status: PositionStatus,
    #[serde(default)]
    pub unrealized_pnl_percent: f64,
    #[serde(default)]
    pub half_take_profit_done: bool,
    #[serde(default)]
    pub trailing_active: bool,
    #[serde(default)]
    pub entry_price: f64,
    #[serde(default)]
    pub amount_krw: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TodayStats {
    pub total_pnl_krw: i64,
    #[serde(default)]
    pub trade_count: u32,
    #[serde(default)]
    pub win_count: u32,
}

// ===== Agent context (backend feature pack + recommendation) =====

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Recommendation {
    pub recommended_entry: f64,
    pub stop_loss: f64,
    pub take_profit: f64,
    pub risk_reward: f64,
    pub current_price: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderbookSummary {
    #[serde(default)]
    pub spread_pct: f64,
    #[serde(default)]
    pub imbalance: f64,
    #[serde(default)]
    pub top5_imbalance: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChartContext {
    #[serde(default)]
    pub recommendation: Option<Recommendation>,
    #[serde(default)]
    pub orderbook: Option<OrderbookSummary>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TechnicalFeatures {
    #[serde(default)]
    pub trend: f64,
    #[serde(default)]
    pub pullback: f64,
    #[serde(default)]
    pub volatility: f64,
    #[serde(default)]
    pub rr_score: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MicrostructureFeatures {
    #[serde(default)]
    pub spread: f64,
    #[serde(default)]
    pub imbalance: f64,
    #[serde(default)]
    pub top5_imbalance: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionRiskFeatures {
    #[serde(default)]
    pub chasing_risk: f64,
    #[serde(default)]
    pub pending_fill_risk: f64,
    #[serde(default)]
    pub entry_gap_pct: f64,
}

/// Backend snapshot of technical, microstructure and execution-risk features
/// for one market.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeaturePack {
    #[serde(default)]
    pub technical: TechnicalFeatures,
    #[serde(default)]
    pub microstructure: MicrostructureFeatures,
    #[serde(default)]
    pub execution_risk: ExecutionRiskFeatures,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentContext {
    #[serde(default)]
    pub chart: ChartContext,
    #[serde(default)]
    pub feature_pack: Option<FeaturePack>,
}

// ===== Orders =====

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderType {
    Market,
    Limit,
}

/// Order plan selected by the adaptive entry policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderPlan {
    pub order_type: OrderType,
    pub limit_price: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntryRequest {
    pub market: String,
    pub amount_krw: i64,
    pub order_type: OrderType,
    pub limit_price: Option<f64>,
    pub interval: String,
    pub mode: TradingMode,
    pub entry_source: String,
    pub strategy_code: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdoptRequest {
    pub market: String,
    pub mode: TradingMode,
    pub interval: String,
    pub entry_source: String,
    pub notes: String,
}

// ===== Worker state =====

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerStatus {
    Scanning,
    Analyzing,
    PlaywrightCheck,
    Entering,
    Managing,
    Paused,
    Cooldown,
    Error,
    Stopped,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerSnapshot {
    pub market: String,
    pub status: WorkerStatus,
    pub note: String,
    pub started_at: i64,
    pub updated_at: i64,
    pub cooldown_until: Option<i64>,
    pub focused: bool,
}

// ===== Timeline events =====

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    System,
    Candidate,
    Worker,
    Playwright,
    Order,
    Llm,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventLevel {
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimelineEvent {
    pub id: Uuid,
    pub at: i64,
    pub market: Option<String>,
    pub kind: EventType,
    pub level: EventLevel,
    pub action: String,
    pub detail: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_args: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub screenshot_id: Option<String>,
}

impl TimelineEvent {
    pub fn new(
        kind: EventType,
        level: EventLevel,
        action: impl Into<String>,
        detail: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            at: epoch_ms(),
            market: None,
            kind,
            level,
            action: action.into(),
            detail: detail.into(),
            tool_name: None,
            tool_args: None,
            screenshot_id: None,
        }
    }

    pub fn with_market(mut self, market: impl Into<String>) -> Self {
        self.market = Some(market.into());
        self
    }

    pub fn with_tool(mut self, name: impl Into<String>, args: serde_json::Value) -> Self {
        self.tool_name = Some(name.into());
        self.tool_args = Some(args);
        self
    }

    pub fn with_screenshot(mut self, screenshot_id: impl Into<String>) -> Self {
        self.screenshot_id = Some(screenshot_id.into());
        self
    }
}

// ===== Order flow =====

/// Order lifecycle notification pushed by workers on a channel distinct from
/// the timeline so the orchestrator can keep counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderFlowKind {
    BuyRequested,
    BuyFilled,
    SellRequested,
    SellFilled,
    Cancelled,
}

impl OrderFlowKind {
    pub fn action(&self) -> &'static str {
        match self {
            OrderFlowKind::BuyRequested => "BUY_REQUESTED",
            OrderFlowKind::BuyFilled => "BUY_FILLED",
            OrderFlowKind::SellRequested => "SELL_REQUESTED",
            OrderFlowKind::SellFilled => "SELL_FILLED",
            OrderFlowKind::Cancelled => "CANCELLED",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderFlowStats {
    pub buy_requested: u64,
    pub buy_filled: u64,
    pub sell_requested: u64,
    pub sell_filled: u64,
    pub cancelled: u64,
    pub pending: u64,
}

impl OrderFlowStats {
    pub fn apply(&mut self, kind: OrderFlowKind) {
        match kind {
            OrderFlowKind::BuyRequested => self.buy_requested += 1,
            OrderFlowKind::BuyFilled => self.buy_filled += 1,
            OrderFlowKind::SellRequested => self.sell_requested += 1,
            OrderFlowKind::SellFilled => self.sell_filled += 1,
            OrderFlowKind::Cancelled => self.cancelled += 1,
        }
        let requested = self.buy_requested as i64 + self.sell_requested as i64;
        let settled = self.buy_filled as i64 + self.sell_filled as i64 + self.cancelled as i64;
        self.pending = (requested - settled).max(0) as u64;
    }
}

// ===== Screenshots =====

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Screenshot {
    pub id: String,
    pub at: i64,
    pub mime_type: String,
    /// Data URI or absolute URL.
    pub src: String,
}

// ===== LLM budget =====

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LlmUsage {
    pub date_key: String,
    pub used_today: u32,
    pub soft_cap_warned: bool,
}

// ===== MCP bridge =====

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum McpNamespace {
    Playwright,
    Trading,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct McpContent {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub data: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub mime_type: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct McpToolResult {
    #[serde(default)]
    pub content: Vec<McpContent>,
    #[serde(default)]
    pub is_error: bool,
}

impl McpToolResult {
    /// Joined text content, used for error surfaces and log lines.
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|c| c.text.as_deref())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

// ===== One-shot LLM request =====

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OneShotRequest {
    pub model: String,
    pub trading_mode: TradingMode,
    pub context: Option<String>,
    pub prompt: String,
}

// ===== Full state snapshot =====

/// Full UI-facing snapshot pushed through `AutopilotSink::on_state`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AutopilotState {
    pub running: bool,
    pub enabled: bool,
    pub blocked_by_daily_loss: bool,
    pub block_reason: Option<String>,
    pub candidates: Vec<Candidate>,
    pub workers: Vec<WorkerSnapshot>,
    pub events: Vec<TimelineEvent>,
    pub logs: Vec<String>,
    pub order_flow: OrderFlowStats,
    pub llm_usage: LlmUsage,
    pub updated_at: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn order_flow_pending_never_negative() {
        let mut stats = OrderFlowStats::default();
        stats.apply(OrderFlowKind::BuyFilled);
        stats.apply(OrderFlowKind::Cancelled);
        assert_eq!(stats.pending, 0);

        stats.apply(OrderFlowKind::BuyRequested);
        stats.apply(OrderFlowKind::BuyRequested);
        stats.apply(OrderFlowKind::SellRequested);
        // 3 requested, 2 settled above
        assert_eq!(stats.pending, 1);
    }

    #[test]
    fn opportunity_wire_names_roundtrip() {
        let raw = r#"{
            "market": "KRW-BTC",
            "koreanName": "비트코인",
            "recommendedEntryWinRate1m": 66.0,
            "riskReward1m": 1.5,
            "entryGapPct1m": 0.1,
            "expectancyPct": 0.25,
            "score": 72.0,
            "stage": "AUTO_PASS",
            "reason": "momentum"
        }"#;
        let opp: Opportunity = serde_json::from_str(raw).unwrap();
        assert_eq!(opp.stage, OpportunityStage::AutoPass);
        assert_eq!(opp.recommended_entry_win_rate_1m, 66.0);
        // Unspecified fields default to zero.
        assert_eq!(opp.market_entry_win_rate_10m, 0.0);
    }

    #[test]
    fn position_status_tolerates_unknown_values() {
        let p: Position =
            serde_json::from_str(r#"{"market":"KRW-ETH","status":"LIQUIDATING"}"#).unwrap();
        assert_eq!(p.status, PositionStatus::Unknown);
    }

    #[test]
    fn event_builder_sets_optional_fields() {
        let ev = TimelineEvent::new(EventType::Playwright, EventLevel::Info, "CHECK", "ok")
            .with_market("KRW-BTC")
            .with_screenshot("shot-1");
        assert_eq!(ev.market.as_deref(), Some("KRW-BTC"));
        assert_eq!(ev.screenshot_id.as_deref(), Some("shot-1"));
        assert!(ev.tool_name.is_none());
    }
}

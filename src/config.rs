use crate::domain::types::{EntryOrderMode, EntryPolicy, FocusedEntryGate, TradingMode};
use anyhow::{Context, Result};
use std::env;
use std::str::FromStr;

/// Service wiring mode for the binary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Mock,
    Http,
}

impl FromStr for Mode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "mock" => Ok(Mode::Mock),
            "http" => Ok(Mode::Http),
            _ => anyhow::bail!("Invalid MODE: {}. Must be 'mock' or 'http'", s),
        }
    }
}

/// Orchestrator configuration. Immutable per tick; swapped atomically
/// between ticks via `Orchestrator::update_config`.
#[derive(Debug, Clone)]
pub struct AutopilotConfig {
    /// Master switch; false halts new activity but does not kill workers.
    pub enabled: bool,
    pub interval: String,
    pub confirm_interval: String,
    pub trading_mode: TradingMode,
    /// Nominal notional per entry, in KRW.
    pub amount_krw: i64,
    /// Negative threshold; at or below it new entries are blocked.
    pub daily_loss_limit_krw: i64,
    pub max_concurrent_positions: usize,
    pub candidate_limit: usize,
    pub reject_cooldown_ms: i64,
    pub post_exit_cooldown_ms: i64,
    pub pending_entry_timeout_ms: i64,
    pub worker_tick_ms: i64,
    pub llm_review_interval_ms: i64,
    pub min_llm_confidence: u8,
    pub entry_policy: EntryPolicy,
    pub entry_order_mode: EntryOrderMode,
    pub market_fallback_after_cancel: bool,
    pub playwright_enabled: bool,
    /// Advisory daily LLM-call cap; 0 disables the warning.
    pub llm_daily_soft_cap: u32,
    pub llm_model: String,
    pub focused_scalp_enabled: bool,
    pub focused_scalp_markets: Vec<String>,
    pub focused_scalp_poll_interval_ms: i64,
    pub focused_warn_holding_ms: i64,
    pub focused_max_holding_ms: i64,
    pub focused_entry_gate: FocusedEntryGate,
    pub fine_agent_enabled: bool,
    pub fine_agent_max_per_tick: usize,
    pub fine_agent_decision_ttl_ms: i64,
    /// FULL runs the specialist stage through the LLM; LITE scores it
    /// deterministically from the feature pack.
    pub fine_agent_full_mode: bool,
    pub orchestrator_tick_ms: i64,
}

impl Default for AutopilotConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: "m1".to_string(),
            confirm_interval: "m10".to_string(),
            trading_mode: TradingMode::Scalp,
            amount_krw: 10_000,
            daily_loss_limit_krw: -100_000,
            max_concurrent_positions: 3,
            candidate_limit: 8,
            reject_cooldown_ms: 120_000,
            post_exit_cooldown_ms: 180_000,
            pending_entry_timeout_ms: 90_000,
            worker_tick_ms: 5_000,
            llm_review_interval_ms: 30_000,
            min_llm_confidence: 60,
            entry_policy: EntryPolicy::Balanced,
            entry_order_mode: EntryOrderMode::Adaptive,
            market_fallback_after_cancel: true,
            playwright_enabled: false,
            llm_daily_soft_cap: 400,
            llm_model: "gpt-4.1-mini".to_string(),
            focused_scalp_enabled: false,
            focused_scalp_markets: Vec::new(),
            focused_scalp_poll_interval_ms: 2_000,
            focused_warn_holding_ms: 480_000,
            focused_max_holding_ms: 900_000,
            focused_entry_gate: FocusedEntryGate::FastOnly,
            fine_agent_enabled: true,
            fine_agent_max_per_tick: 2,
            fine_agent_decision_ttl_ms: 45_000,
            fine_agent_full_mode: false,
            orchestrator_tick_ms: 10_000,
        }
    }
}

fn env_bool(key: &str, default: bool) -> bool {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<bool>().ok())
        .unwrap_or(default)
}

fn env_i64(key: &str, default: i64) -> Result<i64> {
    match env::var(key) {
        Ok(v) => v
            .parse::<i64>()
            .with_context(|| format!("Failed to parse {key}")),
        Err(_) => Ok(default),
    }
}

fn env_usize(key: &str, default: usize) -> Result<usize> {
    match env::var(key) {
        Ok(v) => v
            .parse::<usize>()
            .with_context(|| format!("Failed to parse {key}")),
        Err(_) => Ok(default),
    }
}

impl AutopilotConfig {
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let trading_mode = match env::var("AUTOPILOT_TRADING_MODE") {
            Ok(v) => TradingMode::from_str(&v)?,
            Err(_) => defaults.trading_mode,
        };
        let entry_policy = match env::var("AUTOPILOT_ENTRY_POLICY") {
            Ok(v) => EntryPolicy::from_str(&v)?,
            Err(_) => defaults.entry_policy,
        };
        let entry_order_mode = match env::var("AUTOPILOT_ENTRY_ORDER_MODE") {
            Ok(v) => EntryOrderMode::from_str(&v)?,
            Err(_) => defaults.entry_order_mode,
        };

        let focused_scalp_markets = env::var("AUTOPILOT_FOCUSED_SCALP_MARKETS")
            .map(|v| {
                v.split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect()
            })
            .unwrap_or_default();

        let config = Self {
            enabled: env_bool("AUTOPILOT_ENABLED", defaults.enabled),
            interval: env::var("AUTOPILOT_INTERVAL").unwrap_or(defaults.interval),
            confirm_interval: env::var("AUTOPILOT_CONFIRM_INTERVAL")
                .unwrap_or(defaults.confirm_interval),
            trading_mode,
            amount_krw: env_i64("AUTOPILOT_AMOUNT_KRW", defaults.amount_krw)?,
            daily_loss_limit_krw: env_i64(
                "AUTOPILOT_DAILY_LOSS_LIMIT_KRW",
                defaults.daily_loss_limit_krw,
            )?,
            max_concurrent_positions: env_usize(
                "AUTOPILOT_MAX_CONCURRENT_POSITIONS",
                defaults.max_concurrent_positions,
            )?,
            candidate_limit: env_usize("AUTOPILOT_CANDIDATE_LIMIT", defaults.candidate_limit)?,
            reject_cooldown_ms: env_i64(
                "AUTOPILOT_REJECT_COOLDOWN_MS",
                defaults.reject_cooldown_ms,
            )?,
            post_exit_cooldown_ms: env_i64(
                "AUTOPILOT_POST_EXIT_COOLDOWN_MS",
                defaults.post_exit_cooldown_ms,
            )?,
            pending_entry_timeout_ms: env_i64(
                "AUTOPILOT_PENDING_ENTRY_TIMEOUT_MS",
                defaults.pending_entry_timeout_ms,
            )?
            .max(10_000),
            worker_tick_ms: env_i64("AUTOPILOT_WORKER_TICK_MS", defaults.worker_tick_ms)?.max(500),
            llm_review_interval_ms: env_i64(
                "AUTOPILOT_LLM_REVIEW_INTERVAL_MS",
                defaults.llm_review_interval_ms,
            )?,
            min_llm_confidence: env_i64(
                "AUTOPILOT_MIN_LLM_CONFIDENCE",
                defaults.min_llm_confidence as i64,
            )?
            .clamp(0, 100) as u8,
            entry_policy,
            entry_order_mode,
            market_fallback_after_cancel: env_bool(
                "AUTOPILOT_MARKET_FALLBACK_AFTER_CANCEL",
                defaults.market_fallback_after_cancel,
            ),
            playwright_enabled: env_bool(
                "AUTOPILOT_PLAYWRIGHT_ENABLED",
                defaults.playwright_enabled,
            ),
            llm_daily_soft_cap: env_i64(
                "AUTOPILOT_LLM_DAILY_SOFT_CAP",
                defaults.llm_daily_soft_cap as i64,
            )?
            .max(0) as u32,
            llm_model: env::var("AUTOPILOT_LLM_MODEL").unwrap_or(defaults.llm_model),
            focused_scalp_enabled: env_bool(
                "AUTOPILOT_FOCUSED_SCALP_ENABLED",
                defaults.focused_scalp_enabled,
            ),
            focused_scalp_markets,
            focused_scalp_poll_interval_ms: env_i64(
                "AUTOPILOT_FOCUSED_SCALP_POLL_INTERVAL_MS",
                defaults.focused_scalp_poll_interval_ms,
            )?
            .max(500),
            focused_warn_holding_ms: env_i64(
                "AUTOPILOT_FOCUSED_WARN_HOLDING_MS",
                defaults.focused_warn_holding_ms,
            )?,
            focused_max_holding_ms: env_i64(
                "AUTOPILOT_FOCUSED_MAX_HOLDING_MS",
                defaults.focused_max_holding_ms,
            )?,
            focused_entry_gate: FocusedEntryGate::FastOnly,
            fine_agent_enabled: env_bool("AUTOPILOT_FINE_AGENT_ENABLED", defaults.fine_agent_enabled),
            fine_agent_max_per_tick: env_usize(
                "AUTOPILOT_FINE_AGENT_MAX_PER_TICK",
                defaults.fine_agent_max_per_tick,
            )?,
            fine_agent_decision_ttl_ms: env_i64(
                "AUTOPILOT_FINE_AGENT_DECISION_TTL_MS",
                defaults.fine_agent_decision_ttl_ms,
            )?,
            fine_agent_full_mode: env_bool(
                "AUTOPILOT_FINE_AGENT_FULL_MODE",
                defaults.fine_agent_full_mode,
            ),
            orchestrator_tick_ms: env_i64(
                "AUTOPILOT_ORCHESTRATOR_TICK_MS",
                defaults.orchestrator_tick_ms,
            )?
            .max(1_000),
        };

        Ok(config)
    }

    /// Entry notional for a graded candidate, always clamped to the
    /// per-order bounds.
    pub fn entry_amount_for(&self, auto_pass: bool) -> i64 {
        let factor = if auto_pass { 1.15 } else { 0.85 };
        clamp_entry_amount((self.amount_krw as f64 * factor).round() as i64)
    }
}

pub const MIN_ENTRY_AMOUNT_KRW: i64 = 5_100;
pub const MAX_ENTRY_AMOUNT_KRW: i64 = 20_000;

pub fn clamp_entry_amount(amount: i64) -> i64 {
    amount.clamp(MIN_ENTRY_AMOUNT_KRW, MAX_ENTRY_AMOUNT_KRW)
}

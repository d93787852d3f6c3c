use std::sync::Arc;

use coinpilot::application::orchestrator::{Orchestrator, Services};
use coinpilot::config::AutopilotConfig;
use coinpilot::domain::types::{
    AgentContext, CandidateStage, ChartContext, Opportunity, OpportunityStage, Position,
    PositionStatus, Recommendation, TodayStats, WorkerStatus,
};
use coinpilot::infrastructure::mock::{
    MemorySink, MockGuidedTradingApi, MockLlmClient, MockMcpClient,
};

fn opportunity(market: &str, stage: OpportunityStage, score: f64) -> Opportunity {
    Opportunity {
        market: market.to_string(),
        korean_name: String::new(),
        recommended_entry_win_rate_1m: 66.0,
        recommended_entry_win_rate_10m: 60.0,
        market_entry_win_rate_1m: 58.0,
        market_entry_win_rate_10m: 55.0,
        risk_reward_1m: 1.5,
        entry_gap_pct_1m: 0.1,
        expectancy_pct: 0.25,
        score,
        stage,
        reason: "backend ranked".to_string(),
    }
}

fn context(entry: f64) -> AgentContext {
    AgentContext {
        chart: ChartContext {
            recommendation: Some(Recommendation {
                recommended_entry: entry,
                stop_loss: entry * 0.98,
                take_profit: entry * 1.03,
                risk_reward: 1.6,
                current_price: entry * 1.001,
            }),
            orderbook: None,
        },
        feature_pack: None,
    }
}

fn open_position(market: &str, pnl: f64) -> Position {
    Position {
        market: market.to_string(),
        status: PositionStatus::Open,
        unrealized_pnl_percent: pnl,
        half_take_profit_done: false,
        trailing_active: false,
        entry_price: 100.0,
        amount_krw: 10_000,
    }
}

struct Harness {
    backend: Arc<MockGuidedTradingApi>,
    llm: Arc<MockLlmClient>,
    sink: Arc<MemorySink>,
    orchestrator: Arc<Orchestrator>,
}

fn harness(config: AutopilotConfig) -> Harness {
    let backend = Arc::new(MockGuidedTradingApi::new());
    let llm = Arc::new(MockLlmClient::new());
    let mcp = Arc::new(MockMcpClient::new());
    let sink = Arc::new(MemorySink::new());
    let orchestrator = Arc::new(Orchestrator::new(
        config,
        Services {
            backend: backend.clone(),
            llm: llm.clone(),
            mcp,
            sink: sink.clone(),
        },
    ));
    Harness {
        backend,
        llm,
        sink,
        orchestrator,
    }
}

fn base_config() -> AutopilotConfig {
    AutopilotConfig {
        fine_agent_enabled: false,
        ..AutopilotConfig::default()
    }
}

#[tokio::test]
async fn happy_path_auto_pass_spawns_worker() {
    let h = harness(base_config());
    h.backend
        .set_opportunities(vec![opportunity("KRW-BTC", OpportunityStage::AutoPass, 72.0)]);
    h.backend.set_context("KRW-BTC", context(61_000_000.0));

    h.orchestrator.tick().await;

    assert!(h.orchestrator.has_worker("KRW-BTC").await);
    let spec = h.orchestrator.worker_spec("KRW-BTC").await.unwrap();
    assert!(spec.skip_llm_entry_review);
    assert_eq!(spec.entry_amount_krw, 11_500);
    assert!(!spec.focused);

    let state = h.orchestrator.snapshot().await;
    let candidate = state
        .candidates
        .iter()
        .find(|c| c.opportunity.market == "KRW-BTC")
        .unwrap();
    assert_eq!(candidate.stage, CandidateStage::Entered);
    assert!(
        state
            .events
            .iter()
            .any(|e| e.action == "ENTERED" && e.market.as_deref() == Some("KRW-BTC"))
    );
}

#[tokio::test]
async fn borderline_scales_entry_amount_down() {
    let h = harness(base_config());
    h.backend.set_opportunities(vec![opportunity(
        "KRW-ETH",
        OpportunityStage::Borderline,
        58.0,
    )]);
    h.backend.set_context("KRW-ETH", context(3_400_000.0));

    h.orchestrator.tick().await;

    let spec = h.orchestrator.worker_spec("KRW-ETH").await.unwrap();
    assert!(!spec.skip_llm_entry_review);
    assert_eq!(spec.entry_amount_krw, 8_500);
}

#[tokio::test]
async fn daily_loss_block_halts_scanning_but_adopts_open_positions() {
    let h = harness(base_config());
    h.backend.set_stats(TodayStats {
        total_pnl_krw: -120_000,
        trade_count: 9,
        win_count: 2,
    });
    h.backend
        .set_opportunities(vec![opportunity("KRW-BTC", OpportunityStage::AutoPass, 72.0)]);
    h.backend.upsert_position(open_position("KRW-XRP", 0.2));

    h.orchestrator.tick().await;

    let state = h.orchestrator.snapshot().await;
    assert!(state.blocked_by_daily_loss);
    assert!(state.block_reason.is_some());
    // Opportunities are never fetched while the gate is closed.
    assert_eq!(h.backend.call_count("autopilot_opportunities"), 0);
    assert!(!h.orchestrator.has_worker("KRW-BTC").await);
    // Already-open positions are still adopted.
    assert!(h.orchestrator.has_worker("KRW-XRP").await);
    assert_eq!(h.backend.adoptions().len(), 1);

    let blocks = state
        .events
        .iter()
        .filter(|e| e.action == "DAILY_LOSS_BLOCK")
        .count();
    assert_eq!(blocks, 1);

    // The transition event fires only once while the block holds.
    h.orchestrator.tick().await;
    let state = h.orchestrator.snapshot().await;
    let blocks = state
        .events
        .iter()
        .filter(|e| e.action == "DAILY_LOSS_BLOCK")
        .count();
    assert_eq!(blocks, 1);
}

#[tokio::test]
async fn slot_cap_marks_overflow_candidates() {
    let mut config = base_config();
    config.max_concurrent_positions = 2;
    let h = harness(config);
    h.backend.set_opportunities(vec![
        opportunity("KRW-BTC", OpportunityStage::AutoPass, 80.0),
        opportunity("KRW-ETH", OpportunityStage::AutoPass, 75.0),
        opportunity("KRW-SOL", OpportunityStage::AutoPass, 70.0),
    ]);
    for market in ["KRW-BTC", "KRW-ETH", "KRW-SOL"] {
        h.backend.set_context(market, context(1_000_000.0));
    }

    h.orchestrator.tick().await;

    let state = h.orchestrator.snapshot().await;
    let entered = state
        .candidates
        .iter()
        .filter(|c| c.stage == CandidateStage::Entered)
        .count();
    let slot_full = state
        .candidates
        .iter()
        .filter(|c| c.stage == CandidateStage::SlotFull)
        .count();
    assert_eq!(entered, 2);
    assert_eq!(slot_full, 1);

    let live_workers = state
        .workers
        .iter()
        .filter(|w| !w.focused && w.status != WorkerStatus::Stopped)
        .count();
    assert!(live_workers <= 2);
}

#[tokio::test]
async fn focused_scalp_markets_normalized_and_synced() {
    let mut config = base_config();
    config.focused_scalp_enabled = true;
    config.focused_scalp_markets = vec!["btc".to_string(), "ETH".to_string(), "KRW-SOL".to_string()];
    config.focused_scalp_poll_interval_ms = 2_000;
    config.max_concurrent_positions = 0;
    let h = harness(config.clone());

    h.orchestrator.tick().await;

    for market in ["KRW-BTC", "KRW-ETH", "KRW-SOL"] {
        assert!(h.orchestrator.has_worker(market).await, "missing {market}");
        let spec = h.orchestrator.worker_spec(market).await.unwrap();
        assert!(spec.focused);
        assert!(spec.skip_llm_entry_review);
        assert_eq!(spec.tick_ms, 2_000);
    }

    // Removing a market stops its worker on the next tick.
    let mut updated = config;
    updated.focused_scalp_markets = vec!["btc".to_string(), "KRW-SOL".to_string()];
    h.orchestrator.update_config(updated).await;
    h.orchestrator.tick().await;

    assert!(!h.orchestrator.has_worker("KRW-ETH").await);
    let state = h.orchestrator.snapshot().await;
    assert!(
        state
            .events
            .iter()
            .any(|e| e.action == "FOCUSED_SCALP_STOP" && e.market.as_deref() == Some("KRW-ETH"))
    );
    let eth = state
        .workers
        .iter()
        .find(|w| w.market == "KRW-ETH")
        .unwrap();
    assert_eq!(eth.status, WorkerStatus::Stopped);
}

#[tokio::test]
async fn idle_workers_pruned_off_the_shortlist() {
    let h = harness(base_config());
    // No scripted context: the worker can never reach a protected state
    // (ENTERING/MANAGING), so the prune decision is deterministic.
    h.backend
        .set_opportunities(vec![opportunity("KRW-BTC", OpportunityStage::AutoPass, 72.0)]);

    h.orchestrator.tick().await;
    assert!(h.orchestrator.has_worker("KRW-BTC").await);

    // Next tick: the market dropped off the shortlist and has no position.
    h.backend.set_opportunities(vec![]);
    h.orchestrator.tick().await;

    assert!(!h.orchestrator.has_worker("KRW-BTC").await);
    let state = h.orchestrator.snapshot().await;
    assert!(state.events.iter().any(|e| e.action == "WORKER_PRUNED"));
    let snapshot = state
        .workers
        .iter()
        .find(|w| w.market == "KRW-BTC")
        .unwrap();
    assert_eq!(snapshot.status, WorkerStatus::Stopped);
}

#[tokio::test]
async fn fine_agent_demotes_and_caches_decisions() {
    let mut config = base_config();
    config.fine_agent_enabled = true;
    config.fine_agent_max_per_tick = 2;
    config.fine_agent_decision_ttl_ms = 60_000;
    let h = harness(config);
    h.backend.set_opportunities(vec![opportunity(
        "KRW-BTC",
        OpportunityStage::Borderline,
        60.0,
    )]);
    // Synthesizer reply, then a rejecting PM reply.
    h.llm
        .push_reply(r#"{"score": 50, "confidence": 60, "reason": "mixed"}"#);
    h.llm.push_reply(
        r#"{"approve": false, "stage": "RULE_FAIL", "score": 40, "confidence": 80, "reason": "weak structure"}"#,
    );

    h.orchestrator.tick().await;

    let state = h.orchestrator.snapshot().await;
    let candidate = state
        .candidates
        .iter()
        .find(|c| c.opportunity.market == "KRW-BTC")
        .unwrap();
    assert_eq!(candidate.stage, CandidateStage::RuleFail);
    assert!(!h.orchestrator.has_worker("KRW-BTC").await);
    assert!(state.events.iter().any(|e| e.action == "FINE_AGENT_REVIEW"));
    assert_eq!(state.llm_usage.used_today, 2);
    let calls_after_first = h.llm.call_count();

    // Second tick hits the decision cache: no new LLM calls.
    h.orchestrator.tick().await;
    assert_eq!(h.llm.call_count(), calls_after_first);
    let state = h.orchestrator.snapshot().await;
    let candidate = state
        .candidates
        .iter()
        .find(|c| c.opportunity.market == "KRW-BTC")
        .unwrap();
    assert_eq!(candidate.stage, CandidateStage::RuleFail);
}

#[tokio::test]
async fn decision_log_failure_degrades_to_warn_event() {
    let h = harness(base_config());
    h.backend.set_fail_decision_log(true);
    h.backend
        .set_opportunities(vec![opportunity("KRW-BTC", OpportunityStage::RuleFail, 20.0)]);

    h.orchestrator.tick().await;

    let state = h.orchestrator.snapshot().await;
    assert!(state.events.iter().any(|e| e.action == "DECISION_LOG_WARN"));
    // The tick itself still completed and replaced the candidate map.
    assert_eq!(state.candidates.len(), 1);
    assert!(
        !state
            .events
            .iter()
            .any(|e| e.action == "ORCHESTRATOR_TICK_ERROR")
    );
}

#[tokio::test]
async fn pause_without_worker_registers_external_cooldown() {
    let h = harness(base_config());
    h.orchestrator
        .pause_market(" krw-btc ", 60_000, "manual pause")
        .await;

    h.backend
        .set_opportunities(vec![opportunity("KRW-BTC", OpportunityStage::AutoPass, 72.0)]);
    h.orchestrator.tick().await;

    let state = h.orchestrator.snapshot().await;
    let candidate = state
        .candidates
        .iter()
        .find(|c| c.opportunity.market == "KRW-BTC")
        .unwrap();
    assert_eq!(candidate.stage, CandidateStage::Cooldown);
    assert!(!h.orchestrator.has_worker("KRW-BTC").await);
}

#[tokio::test]
async fn disabled_config_halts_scanning() {
    let mut config = base_config();
    config.enabled = false;
    let h = harness(config);
    h.backend
        .set_opportunities(vec![opportunity("KRW-BTC", OpportunityStage::AutoPass, 72.0)]);

    h.orchestrator.tick().await;

    assert_eq!(h.backend.call_count("today_stats"), 0);
    assert_eq!(h.backend.call_count("autopilot_opportunities"), 0);
    assert!(!h.orchestrator.has_worker("KRW-BTC").await);
}

#[tokio::test]
async fn stop_clears_workers_and_emits_final_state() {
    let h = harness(base_config());
    h.backend
        .set_opportunities(vec![opportunity("KRW-BTC", OpportunityStage::AutoPass, 72.0)]);
    h.backend.set_context("KRW-BTC", context(61_000_000.0));

    h.orchestrator.start().await;
    // Let the immediate first tick run.
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    assert!(h.orchestrator.is_running());

    h.orchestrator.stop().await;
    assert!(!h.orchestrator.is_running());

    let state = h.orchestrator.snapshot().await;
    assert!(state.candidates.is_empty());
    assert!(
        state
            .workers
            .iter()
            .all(|w| w.status == WorkerStatus::Stopped)
    );
    assert!(state.events.iter().any(|e| e.action == "STOPPED"));
    assert!(h.sink.state_count() > 0);
}

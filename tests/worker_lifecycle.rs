use std::sync::Arc;

use tokio::sync::{RwLock, mpsc};

use coinpilot::application::worker::{MarketWorker, WorkerMessage, WorkerSpec};
use coinpilot::config::AutopilotConfig;
use coinpilot::domain::types::{
    AgentContext, ChartContext, EntryPolicy, EventLevel, McpNamespace, OrderFlowKind, OrderType,
    Position, PositionStatus, Recommendation, TimelineEvent, WorkerStatus, epoch_ms,
};
use coinpilot::infrastructure::mock::{MockGuidedTradingApi, MockLlmClient, MockMcpClient};

const MARKET: &str = "KRW-BTC";

fn spec() -> WorkerSpec {
    WorkerSpec {
        market: MARKET.to_string(),
        korean_name: String::new(),
        focused: false,
        skip_llm_entry_review: false,
        entry_amount_krw: 11_500,
        tick_ms: 1_000,
        warn_holding_ms: None,
        max_holding_ms: None,
    }
}

fn context(current: f64, entry: f64, stop: f64, target: f64, rr: f64) -> AgentContext {
    AgentContext {
        chart: ChartContext {
            recommendation: Some(Recommendation {
                recommended_entry: entry,
                stop_loss: stop,
                take_profit: target,
                risk_reward: rr,
                current_price: current,
            }),
            orderbook: None,
        },
        feature_pack: None,
    }
}

fn open_position(pnl: f64, half_done: bool) -> Position {
    Position {
        market: MARKET.to_string(),
        status: PositionStatus::Open,
        unrealized_pnl_percent: pnl,
        half_take_profit_done: half_done,
        trailing_active: false,
        entry_price: 100.0,
        amount_krw: 11_500,
    }
}

struct Rig {
    backend: Arc<MockGuidedTradingApi>,
    llm: Arc<MockLlmClient>,
    mcp: Arc<MockMcpClient>,
    worker: MarketWorker,
    rx: mpsc::UnboundedReceiver<WorkerMessage>,
}

fn rig(spec: WorkerSpec, config: AutopilotConfig) -> Rig {
    let backend = Arc::new(MockGuidedTradingApi::new());
    let llm = Arc::new(MockLlmClient::new());
    let mcp = Arc::new(MockMcpClient::new());
    let (tx, rx) = mpsc::unbounded_channel();
    let worker = MarketWorker::new(
        spec,
        Arc::new(RwLock::new(config)),
        backend.clone(),
        llm.clone(),
        mcp.clone(),
        tx,
    );
    Rig {
        backend,
        llm,
        mcp,
        worker,
        rx,
    }
}

fn drain(rx: &mut mpsc::UnboundedReceiver<WorkerMessage>) -> Vec<WorkerMessage> {
    let mut out = Vec::new();
    while let Ok(message) = rx.try_recv() {
        out.push(message);
    }
    out
}

fn order_flows(messages: &[WorkerMessage]) -> Vec<OrderFlowKind> {
    messages
        .iter()
        .filter_map(|m| match m {
            WorkerMessage::OrderFlow { kind, .. } => Some(*kind),
            _ => None,
        })
        .collect()
}

fn events(messages: &[WorkerMessage]) -> Vec<TimelineEvent> {
    messages
        .iter()
        .filter_map(|m| match m {
            WorkerMessage::Event(e) => Some(e.clone()),
            _ => None,
        })
        .collect()
}

// S3: pending-entry timeout cancels once, then retries with a market order.
#[tokio::test]
async fn pending_entry_timeout_cancels_and_falls_back_to_market() {
    let mut config = AutopilotConfig::default();
    config.pending_entry_timeout_ms = 0;
    config.market_fallback_after_cancel = true;
    let mut r = rig(spec(), config);
    r.backend.upsert_position(Position {
        status: PositionStatus::PendingEntry,
        ..open_position(0.0, false)
    });

    r.worker.run_tick().await;

    assert_eq!(r.backend.cancelled_markets(), vec![MARKET.to_string()]);
    let requests = r.backend.entry_requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].order_type, OrderType::Market);
    assert!(requests[0].limit_price.is_none());

    let messages = drain(&mut r.rx);
    let flows = order_flows(&messages);
    assert!(flows.contains(&OrderFlowKind::Cancelled));
    assert!(flows.contains(&OrderFlowKind::BuyRequested));
    assert_eq!(r.worker.shared().status(), WorkerStatus::Managing);

    // A second timeout cycle cancels again but never re-tries the fallback.
    r.worker.run_tick().await;
    assert_eq!(r.backend.cancelled_markets().len(), 2);
    assert_eq!(r.backend.entry_requests().len(), 1);
    assert_eq!(r.worker.shared().status(), WorkerStatus::Cooldown);
    assert!(r.worker.shared().cooldown_until().unwrap() > epoch_ms());
}

#[tokio::test]
async fn pending_entry_without_fallback_goes_to_cooldown() {
    let mut config = AutopilotConfig::default();
    config.pending_entry_timeout_ms = 0;
    config.market_fallback_after_cancel = false;
    let mut r = rig(spec(), config);
    r.backend.upsert_position(Position {
        status: PositionStatus::PendingEntry,
        ..open_position(0.0, false)
    });

    r.worker.run_tick().await;

    assert_eq!(r.backend.cancelled_markets().len(), 1);
    assert!(r.backend.entry_requests().is_empty());
    assert_eq!(r.worker.shared().status(), WorkerStatus::Cooldown);
}

#[tokio::test]
async fn pending_entry_within_timeout_just_waits() {
    let mut config = AutopilotConfig::default();
    config.pending_entry_timeout_ms = 60_000;
    let mut r = rig(spec(), config);
    r.backend.upsert_position(Position {
        status: PositionStatus::PendingEntry,
        ..open_position(0.0, false)
    });

    r.worker.run_tick().await;

    assert!(r.backend.cancelled_markets().is_empty());
    assert_eq!(r.worker.shared().status(), WorkerStatus::Managing);
}

// S4: adaptive planning rejects a chase when the gap exceeds 1.2%.
#[tokio::test]
async fn adaptive_chase_risk_rejection() {
    let mut worker_spec = spec();
    worker_spec.skip_llm_entry_review = true;
    let mut r = rig(worker_spec, AutopilotConfig::default());
    r.backend
        .set_context(MARKET, context(105.0, 103.0, 98.0, 112.0, 1.6));

    let before = epoch_ms();
    r.worker.run_tick().await;

    assert!(r.backend.entry_requests().is_empty());
    let messages = drain(&mut r.rx);
    let chase = events(&messages)
        .into_iter()
        .find(|e| e.action == "CHASE_RISK")
        .expect("chase risk event");
    assert_eq!(chase.level, EventLevel::Warn);
    assert_eq!(chase.detail, "gap 1.94% > 1.2%");

    let cooldown = r.worker.shared().cooldown_until().unwrap();
    assert!(cooldown >= before + 45_000);
    assert!(cooldown <= epoch_ms() + 45_000);
    assert_eq!(r.worker.shared().status(), WorkerStatus::Cooldown);
}

// S6: fast stop-loss exits in one tick with an 8 minute cooldown.
#[tokio::test]
async fn fast_stop_loss_exits_with_long_cooldown() {
    let mut r = rig(spec(), AutopilotConfig::default());
    r.backend.upsert_position(open_position(-0.9, false));

    let before = epoch_ms();
    r.worker.run_tick().await;

    assert_eq!(r.backend.stopped_markets(), vec![MARKET.to_string()]);
    let messages = drain(&mut r.rx);
    let flows = order_flows(&messages);
    assert!(flows.contains(&OrderFlowKind::SellRequested));
    assert!(flows.contains(&OrderFlowKind::SellFilled));
    assert_eq!(r.worker.shared().status(), WorkerStatus::Cooldown);
    assert!(r.worker.shared().cooldown_until().unwrap() >= before + 8 * 60_000);
}

#[tokio::test]
async fn deterministic_half_take_profit_taken_once() {
    let mut r = rig(spec(), AutopilotConfig::default());
    r.backend.upsert_position(open_position(1.3, false));

    r.worker.run_tick().await;
    assert_eq!(
        r.backend.partial_take_profits(),
        vec![(MARKET.to_string(), 0.5)]
    );

    // The mock flips half_take_profit_done; no second partial.
    r.worker.run_tick().await;
    assert_eq!(r.backend.partial_take_profits().len(), 1);
    assert!(r.backend.stopped_markets().is_empty());
}

#[tokio::test]
async fn take_profit_target_full_exit() {
    let mut r = rig(spec(), AutopilotConfig::default());
    r.backend.upsert_position(open_position(2.5, true));

    let before = epoch_ms();
    r.worker.run_tick().await;

    assert_eq!(r.backend.stopped_markets(), vec![MARKET.to_string()]);
    let cooldown = r.worker.shared().cooldown_until().unwrap();
    assert!(cooldown >= before + 3 * 60_000);
    assert!(cooldown < before + 8 * 60_000);
}

// Invariant 7: no entry attempt while the cooldown deadline is in the future.
#[tokio::test]
async fn cooldown_blocks_entry_attempts() {
    let mut r = rig(spec(), AutopilotConfig::default());
    r.backend
        .set_context(MARKET, context(100.0, 100.0, 95.0, 110.0, 1.5));
    r.worker.shared().set_cooldown(epoch_ms() + 60_000);

    r.worker.run_tick().await;

    assert_eq!(r.backend.call_count("agent_context"), 0);
    assert!(r.backend.entry_requests().is_empty());
    assert_eq!(r.worker.shared().status(), WorkerStatus::Cooldown);
}

#[tokio::test]
async fn cooldown_still_manages_open_position() {
    let mut r = rig(spec(), AutopilotConfig::default());
    r.backend.upsert_position(open_position(-0.9, false));
    r.worker.shared().set_cooldown(epoch_ms() + 60_000);

    r.worker.run_tick().await;

    // The stop-loss fires even while the worker is cooling down.
    assert_eq!(r.backend.stopped_markets(), vec![MARKET.to_string()]);
}

#[tokio::test]
async fn pause_blocks_everything_until_deadline() {
    let mut r = rig(spec(), AutopilotConfig::default());
    r.backend.upsert_position(open_position(-0.9, false));
    r.worker.shared().pause(60_000, "operator hold");

    r.worker.run_tick().await;

    assert!(r.backend.stopped_markets().is_empty());
    assert_eq!(r.backend.call_count("position"), 0);
    assert_eq!(r.worker.shared().status(), WorkerStatus::Paused);
}

#[tokio::test]
async fn llm_high_severity_reject_sets_long_cooldown() {
    let mut config = AutopilotConfig::default();
    config.entry_policy = EntryPolicy::Balanced;
    let mut r = rig(spec(), config);
    r.backend
        .set_context(MARKET, context(100.0, 100.0, 95.0, 110.0, 1.5));
    r.llm.push_reply(
        r#"{"approve": false, "confidence": 85, "severity": "HIGH", "reason": "exhausted move"}"#,
    );

    let before = epoch_ms();
    r.worker.run_tick().await;

    assert!(r.backend.entry_requests().is_empty());
    let messages = drain(&mut r.rx);
    assert!(events(&messages).iter().any(|e| e.action == "LLM_REJECT"));
    let cooldown = r.worker.shared().cooldown_until().unwrap();
    assert!(cooldown >= before + 90_000);
    assert!(cooldown <= epoch_ms() + 300_000);

    // The llm call was tallied for the daily budget.
    assert!(
        messages
            .iter()
            .any(|m| matches!(m, WorkerMessage::LlmUsed { calls: 1, .. }))
    );
}

#[tokio::test]
async fn deterministic_precheck_rejects_before_llm() {
    let mut r = rig(spec(), AutopilotConfig::default());
    // Risk/reward below 1.05: rejected without consulting the LLM.
    r.backend
        .set_context(MARKET, context(100.0, 100.0, 95.0, 110.0, 1.0));

    r.worker.run_tick().await;

    assert_eq!(r.llm.call_count(), 0);
    assert!(r.backend.entry_requests().is_empty());
    let messages = drain(&mut r.rx);
    assert!(events(&messages).iter().any(|e| e.action == "LLM_REJECT"));
}

#[tokio::test]
async fn successful_entry_emits_duplicate_fill_on_confirmation() {
    let mut worker_spec = spec();
    worker_spec.skip_llm_entry_review = true;
    let mut r = rig(worker_spec, AutopilotConfig::default());
    r.backend
        .set_context(MARKET, context(100.05, 100.0, 95.0, 110.0, 1.5));

    r.worker.run_tick().await;

    let requests = r.backend.entry_requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].order_type, OrderType::Market);
    assert_eq!(requests[0].amount_krw, 11_500);
    let messages = drain(&mut r.rx);
    let flows = order_flows(&messages);
    assert_eq!(
        flows
            .iter()
            .filter(|k| **k == OrderFlowKind::BuyRequested)
            .count(),
        1
    );
    // Optimistic fill right after placement.
    assert_eq!(
        flows
            .iter()
            .filter(|k| **k == OrderFlowKind::BuyFilled)
            .count(),
        1
    );
    assert_eq!(r.worker.shared().status(), WorkerStatus::Entering);

    // The backend reports the fill: the confirming BUY_FILLED duplicates
    // the optimistic one and both are preserved.
    r.backend.upsert_position(open_position(0.1, false));
    r.worker.run_tick().await;
    let messages = drain(&mut r.rx);
    let flows = order_flows(&messages);
    assert_eq!(
        flows
            .iter()
            .filter(|k| **k == OrderFlowKind::BuyFilled)
            .count(),
        1
    );
    assert_eq!(r.worker.shared().status(), WorkerStatus::Managing);
}

#[tokio::test]
async fn guided_entry_failure_falls_back_to_mcp() {
    let mut worker_spec = spec();
    worker_spec.skip_llm_entry_review = true;
    let mut r = rig(worker_spec, AutopilotConfig::default());
    r.backend
        .set_context(MARKET, context(100.05, 100.0, 95.0, 110.0, 1.5));
    r.backend.set_fail_start_entry(true);

    r.worker.run_tick().await;

    let mcp_calls = r.mcp.calls();
    assert!(
        mcp_calls
            .iter()
            .any(|(name, ns)| name == "start_guided_entry" && *ns == McpNamespace::Trading)
    );
    let messages = drain(&mut r.rx);
    let actions: Vec<String> = events(&messages).iter().map(|e| e.action.clone()).collect();
    assert!(actions.contains(&"ENTRY_FAILED".to_string()));
    assert!(actions.contains(&"ENTRY_FALLBACK".to_string()));
    assert_eq!(r.worker.shared().status(), WorkerStatus::Entering);
}

#[tokio::test]
async fn double_entry_failure_becomes_worker_error() {
    let mut worker_spec = spec();
    worker_spec.skip_llm_entry_review = true;
    let mut config = AutopilotConfig::default();
    config.reject_cooldown_ms = 120_000;
    let mut r = rig(worker_spec, config);
    r.backend
        .set_context(MARKET, context(100.05, 100.0, 95.0, 110.0, 1.5));
    r.backend.set_fail_start_entry(true);
    r.mcp.set_fail(true);

    let before = epoch_ms();
    r.worker.run_tick().await;

    assert_eq!(r.worker.shared().status(), WorkerStatus::Error);
    let cooldown = r.worker.shared().cooldown_until().unwrap();
    assert!(cooldown >= before + 120_000);
    let messages = drain(&mut r.rx);
    assert!(
        events(&messages)
            .iter()
            .any(|e| e.action == "WORKER_TICK_ERROR" && e.level == EventLevel::Error)
    );
}

#[tokio::test]
async fn playwright_failure_warns_but_does_not_block_entry() {
    let mut worker_spec = spec();
    worker_spec.skip_llm_entry_review = true;
    let mut config = AutopilotConfig::default();
    config.playwright_enabled = true;
    let mut r = rig(worker_spec, config);
    r.backend
        .set_context(MARKET, context(100.05, 100.0, 95.0, 110.0, 1.5));
    r.mcp.set_fail(true);

    r.worker.run_tick().await;

    assert_eq!(r.backend.entry_requests().len(), 1);
    let messages = drain(&mut r.rx);
    assert!(
        events(&messages)
            .iter()
            .any(|e| e.action == "PLAYWRIGHT_WARN" && e.level == EventLevel::Warn)
    );
}

#[tokio::test]
async fn focused_worker_exits_after_max_holding() {
    let mut worker_spec = spec();
    worker_spec.focused = true;
    worker_spec.warn_holding_ms = Some(0);
    worker_spec.max_holding_ms = Some(0);
    let mut r = rig(worker_spec, AutopilotConfig::default());
    r.backend.upsert_position(open_position(0.3, false));

    r.worker.run_tick().await;

    assert_eq!(r.backend.stopped_markets(), vec![MARKET.to_string()]);
    let messages = drain(&mut r.rx);
    assert!(
        events(&messages)
            .iter()
            .any(|e| e.action == "MAX_HOLDING_EXIT")
    );
}

#[tokio::test]
async fn position_close_starts_post_exit_cooldown() {
    let mut config = AutopilotConfig::default();
    config.post_exit_cooldown_ms = 180_000;
    let mut r = rig(spec(), config);
    r.backend.upsert_position(open_position(0.3, false));

    // Observe the open position, then the backend closes it.
    r.worker.run_tick().await;
    r.backend.clear_position(MARKET);
    let before = epoch_ms();
    r.worker.run_tick().await;

    assert_eq!(r.worker.shared().status(), WorkerStatus::Cooldown);
    assert!(r.worker.shared().cooldown_until().unwrap() >= before + 180_000);
    let messages = drain(&mut r.rx);
    assert!(
        events(&messages)
            .iter()
            .any(|e| e.action == "POSITION_CLOSED")
    );
}

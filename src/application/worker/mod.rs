//! Per-market worker state machine.
//!
//! A worker drives a single market through entry gating, order placement,
//! pending-entry reconciliation and open-position management. It owns its
//! timer and serializes its own ticks; all shared state flows back to the
//! orchestrator through a message channel.

pub mod entry;
pub mod manage;
pub mod review;

use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::time::Duration;

use anyhow::Result;
use tokio::sync::{RwLock, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::AutopilotConfig;
use crate::domain::ports::{GuidedTradingApi, LlmClient, McpClient};
use crate::domain::types::{
    EventLevel, EventType, OrderFlowKind, PositionStatus, Screenshot, TimelineEvent, WorkerSnapshot,
    WorkerStatus, epoch_ms,
};

/// Spawn parameters for one worker.
#[derive(Debug, Clone)]
pub struct WorkerSpec {
    pub market: String,
    pub korean_name: String,
    pub focused: bool,
    pub skip_llm_entry_review: bool,
    pub entry_amount_krw: i64,
    pub tick_ms: i64,
    pub warn_holding_ms: Option<i64>,
    pub max_holding_ms: Option<i64>,
}

/// Message pushed from a worker to the orchestrator. Workers never touch
/// orchestrator-owned maps directly.
#[derive(Debug)]
pub enum WorkerMessage {
    State(WorkerSnapshot),
    Event(TimelineEvent),
    OrderFlow { market: String, kind: OrderFlowKind },
    Screenshot(Screenshot),
    LlmUsed { market: String, calls: u32 },
}

struct StatusCell {
    status: WorkerStatus,
    note: String,
    updated_at: i64,
}

/// State visible to both the worker task and the orchestrator.
pub struct WorkerShared {
    market: String,
    focused: bool,
    started_at: i64,
    status: StdMutex<StatusCell>,
    /// Epoch ms; 0 means no cooldown.
    cooldown_until: AtomicI64,
    paused_until: AtomicI64,
    pause_reason: StdMutex<String>,
    ticking: AtomicBool,
    stopped: AtomicBool,
}

impl WorkerShared {
    fn new(market: String, focused: bool) -> Self {
        let now = epoch_ms();
        Self {
            market,
            focused,
            started_at: now,
            status: StdMutex::new(StatusCell {
                status: WorkerStatus::Scanning,
                note: "started".to_string(),
                updated_at: now,
            }),
            cooldown_until: AtomicI64::new(0),
            paused_until: AtomicI64::new(0),
            pause_reason: StdMutex::new(String::new()),
            ticking: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
        }
    }

    pub fn market(&self) -> &str {
        &self.market
    }

    pub fn focused(&self) -> bool {
        self.focused
    }

    pub fn snapshot(&self) -> WorkerSnapshot {
        let cell = self.status.lock().unwrap();
        WorkerSnapshot {
            market: self.market.clone(),
            status: cell.status,
            note: cell.note.clone(),
            started_at: self.started_at,
            updated_at: cell.updated_at,
            cooldown_until: self.cooldown_until(),
            focused: self.focused,
        }
    }

    pub fn status(&self) -> WorkerStatus {
        self.status.lock().unwrap().status
    }

    pub fn set_status(&self, status: WorkerStatus, note: impl Into<String>) {
        let mut cell = self.status.lock().unwrap();
        cell.status = status;
        cell.note = note.into();
        cell.updated_at = epoch_ms();
    }

    pub fn cooldown_until(&self) -> Option<i64> {
        match self.cooldown_until.load(Ordering::SeqCst) {
            0 => None,
            until => Some(until),
        }
    }

    pub fn set_cooldown(&self, until: i64) {
        self.cooldown_until.store(until, Ordering::SeqCst);
    }

    pub fn clear_cooldown(&self) {
        self.cooldown_until.store(0, Ordering::SeqCst);
    }

    pub fn paused_until(&self) -> i64 {
        self.paused_until.load(Ordering::SeqCst)
    }

    pub fn pause_reason(&self) -> String {
        self.pause_reason.lock().unwrap().clone()
    }

    /// Soft pause: changes future tick behavior, never interrupts the
    /// current tick.
    pub fn pause(&self, duration_ms: i64, reason: &str) {
        let until = epoch_ms() + duration_ms.max(1_000);
        self.paused_until.store(until, Ordering::SeqCst);
        *self.pause_reason.lock().unwrap() = reason.to_string();
    }

    /// Tick re-entrancy guard. Returns false when a tick is already in
    /// flight; the caller must drop out immediately.
    pub fn begin_tick(&self) -> bool {
        self.ticking
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub fn end_tick(&self) {
        self.ticking.store(false, Ordering::SeqCst);
    }

    pub fn mark_stopped(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

/// Orchestrator-side handle to a running worker.
pub struct WorkerHandle {
    pub shared: Arc<WorkerShared>,
    spec: WorkerSpec,
    stop_tx: watch::Sender<bool>,
    tx: mpsc::UnboundedSender<WorkerMessage>,
    join: JoinHandle<()>,
}

impl WorkerHandle {
    pub fn market(&self) -> &str {
        self.shared.market()
    }

    pub fn spec(&self) -> &WorkerSpec {
        &self.spec
    }

    pub fn focused(&self) -> bool {
        self.shared.focused()
    }

    pub fn status(&self) -> WorkerStatus {
        self.shared.status()
    }

    pub fn snapshot(&self) -> WorkerSnapshot {
        self.shared.snapshot()
    }

    pub fn cooldown_until(&self) -> Option<i64> {
        self.shared.cooldown_until()
    }

    pub fn pause(&self, duration_ms: i64, reason: &str) {
        self.shared.pause(duration_ms, reason);
        self.shared.set_status(WorkerStatus::Paused, reason);
        let _ = self.tx.send(WorkerMessage::State(self.shared.snapshot()));
    }

    /// Non-blocking stop: the worker transitions to STOPPED and releases
    /// its timer; in-flight I/O completes and its results are discarded.
    pub fn stop(&self, reason: &str) {
        self.shared.mark_stopped();
        self.shared.set_status(WorkerStatus::Stopped, reason);
        let _ = self.stop_tx.send(true);
        let _ = self.tx.send(WorkerMessage::State(self.shared.snapshot()));
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }
}

/// Per-market state machine. Tick-local fields are owned by the task and
/// never observed across a suspension without re-check.
pub struct MarketWorker {
    spec: WorkerSpec,
    config: Arc<RwLock<AutopilotConfig>>,
    backend: Arc<dyn GuidedTradingApi>,
    llm: Arc<dyn LlmClient>,
    mcp: Arc<dyn McpClient>,
    tx: mpsc::UnboundedSender<WorkerMessage>,
    shared: Arc<WorkerShared>,
    peak_pnl_percent: f64,
    last_review_at: i64,
    pending_entry_observed_at: Option<i64>,
    market_fallback_tried: bool,
    had_open_position: bool,
    open_observed_at: Option<i64>,
    holding_warned: bool,
    awaiting_fill_confirm: bool,
}

impl MarketWorker {
    pub fn new(
        spec: WorkerSpec,
        config: Arc<RwLock<AutopilotConfig>>,
        backend: Arc<dyn GuidedTradingApi>,
        llm: Arc<dyn LlmClient>,
        mcp: Arc<dyn McpClient>,
        tx: mpsc::UnboundedSender<WorkerMessage>,
    ) -> Self {
        let shared = Arc::new(WorkerShared::new(spec.market.clone(), spec.focused));
        Self {
            spec,
            config,
            backend,
            llm,
            mcp,
            tx,
            shared,
            peak_pnl_percent: 0.0,
            last_review_at: 0,
            pending_entry_observed_at: None,
            market_fallback_tried: false,
            had_open_position: false,
            open_observed_at: None,
            holding_warned: false,
            awaiting_fill_confirm: false,
        }
    }

    pub fn shared(&self) -> Arc<WorkerShared> {
        Arc::clone(&self.shared)
    }

    pub fn spec(&self) -> &WorkerSpec {
        &self.spec
    }

    /// Spawn the worker task and return its handle.
    pub fn spawn(mut self) -> WorkerHandle {
        let shared = self.shared();
        let spec = self.spec.clone();
        let tx = self.tx.clone();
        let (stop_tx, mut stop_rx) = watch::channel(false);
        let tick_ms = self.spec.tick_ms.max(500) as u64;

        let join = tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_millis(tick_ms));
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = stop_rx.changed() => break,
                    _ = interval.tick() => {
                        if self.shared.is_stopped() {
                            break;
                        }
                        tokio::select! {
                            _ = stop_rx.changed() => break,
                            _ = self.run_tick() => {}
                        }
                    }
                }
            }
            debug!("Worker [{}]: task finished", self.spec.market);
        });

        WorkerHandle {
            shared,
            spec,
            stop_tx,
            tx,
            join,
        }
    }

    /// One guarded tick. Re-entrant invocations return immediately; any
    /// error transitions the worker to ERROR with a reject-length cooldown.
    pub async fn run_tick(&mut self) {
        if !self.shared.begin_tick() {
            return;
        }
        if let Err(e) = self.tick_once().await {
            let reject_ms = self.config.read().await.reject_cooldown_ms;
            let until = epoch_ms() + reject_ms;
            self.shared.set_cooldown(until);
            self.set_status(WorkerStatus::Error, format!("{e:#}"));
            self.emit_event(
                EventType::Worker,
                EventLevel::Error,
                "WORKER_TICK_ERROR",
                format!("{e:#}"),
            );
            warn!("Worker [{}]: tick failed: {:#}", self.spec.market, e);
        }
        self.shared.end_tick();
    }

    async fn tick_once(&mut self) -> Result<()> {
        let cfg = self.config.read().await.clone();
        let now = epoch_ms();

        if self.shared.paused_until() > now {
            self.set_status(WorkerStatus::Paused, self.shared.pause_reason());
            return Ok(());
        }

        if let Some(until) = self.shared.cooldown_until() {
            if until > now {
                self.set_status(
                    WorkerStatus::Cooldown,
                    format!("cooldown {}s remaining", ((until - now) / 1000).max(0)),
                );
                self.manage_existing(&cfg, now).await?;
                return Ok(());
            }
            self.shared.clear_cooldown();
        }

        match self.backend.position(&self.spec.market).await? {
            Some(p) if p.status == PositionStatus::Open => {
                self.note_open(now);
                self.manage_position(&cfg, &p, now).await
            }
            Some(p) if p.status == PositionStatus::PendingEntry => {
                self.manage_pending(&cfg, now).await
            }
            _ => {
                if self.had_open_position {
                    self.finish_position_cycle(&cfg, now);
                    Ok(())
                } else {
                    self.try_entry(&cfg, now).await
                }
            }
        }
    }

    /// First observation of an open position for this cycle. Emits the
    /// confirming BUY_FILLED when the optimistic one was already sent; the
    /// duplicate is intentional and must not be silently dropped.
    fn note_open(&mut self, now: i64) {
        if self.had_open_position {
            return;
        }
        self.had_open_position = true;
        self.open_observed_at = Some(now);
        self.holding_warned = false;
        self.peak_pnl_percent = 0.0;
        self.pending_entry_observed_at = None;
        if self.awaiting_fill_confirm {
            self.awaiting_fill_confirm = false;
            self.emit_order(OrderFlowKind::BuyFilled);
        }
    }

    fn finish_position_cycle(&mut self, cfg: &AutopilotConfig, now: i64) {
        self.reset_position_trackers();
        self.shared.set_cooldown(now + cfg.post_exit_cooldown_ms);
        self.set_status(WorkerStatus::Cooldown, "post-exit cooldown");
        self.emit_event(
            EventType::Worker,
            EventLevel::Info,
            "POSITION_CLOSED",
            "position closed by backend, entering post-exit cooldown",
        );
    }

    pub(crate) fn reset_position_trackers(&mut self) {
        self.had_open_position = false;
        self.open_observed_at = None;
        self.holding_warned = false;
        self.peak_pnl_percent = 0.0;
        self.pending_entry_observed_at = None;
        self.market_fallback_tried = false;
        self.awaiting_fill_confirm = false;
    }

    // ===== emission helpers =====

    pub(crate) fn set_status(&self, status: WorkerStatus, note: impl Into<String>) {
        self.shared.set_status(status, note);
        let _ = self.tx.send(WorkerMessage::State(self.shared.snapshot()));
    }

    pub(crate) fn push_event(&self, event: TimelineEvent) {
        let _ = self.tx.send(WorkerMessage::Event(event));
    }

    pub(crate) fn emit_event(
        &self,
        kind: EventType,
        level: EventLevel,
        action: &str,
        detail: impl Into<String>,
    ) {
        self.push_event(
            TimelineEvent::new(kind, level, action, detail).with_market(&self.spec.market),
        );
    }

    pub(crate) fn emit_order(&self, kind: OrderFlowKind) {
        let _ = self.tx.send(WorkerMessage::OrderFlow {
            market: self.spec.market.clone(),
            kind,
        });
    }

    /// Gating rejection: event + cooldown + COOLDOWN state. Not an error.
    pub(crate) fn reject_entry(
        &mut self,
        now: i64,
        kind: EventType,
        action: &str,
        reason: &str,
        cooldown_ms: i64,
    ) {
        self.emit_event(kind, EventLevel::Warn, action, reason);
        self.shared.set_cooldown(now + cooldown_ms);
        self.set_status(WorkerStatus::Cooldown, reason);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tick_guard_rejects_reentrant_ticks() {
        let shared = WorkerShared::new("KRW-BTC".to_string(), false);
        assert!(shared.begin_tick());
        // A second tick arriving while one is in flight is dropped.
        assert!(!shared.begin_tick());
        shared.end_tick();
        assert!(shared.begin_tick());
    }

    #[test]
    fn pause_enforces_minimum_duration() {
        let shared = WorkerShared::new("KRW-BTC".to_string(), false);
        let before = epoch_ms();
        shared.pause(1, "manual");
        assert!(shared.paused_until() >= before + 1_000);
        assert_eq!(shared.pause_reason(), "manual");
    }

    #[test]
    fn cooldown_zero_means_none() {
        let shared = WorkerShared::new("KRW-BTC".to_string(), false);
        assert!(shared.cooldown_until().is_none());
        shared.set_cooldown(42);
        assert_eq!(shared.cooldown_until(), Some(42));
        shared.clear_cooldown();
        assert!(shared.cooldown_until().is_none());
    }

    #[test]
    fn snapshot_reflects_status_cell() {
        let shared = WorkerShared::new("KRW-ETH".to_string(), true);
        shared.set_status(WorkerStatus::Managing, "pnl +0.40%");
        let snap = shared.snapshot();
        assert_eq!(snap.market, "KRW-ETH");
        assert_eq!(snap.status, WorkerStatus::Managing);
        assert!(snap.focused);
        assert_eq!(snap.note, "pnl +0.40%");
    }
}

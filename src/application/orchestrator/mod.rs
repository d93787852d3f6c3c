//! Autopilot orchestrator.
//!
//! Owns the tick loop and every piece of global state: candidate map,
//! worker registry, cooldowns, event/log rings, screenshots, order-flow
//! counters and the daily LLM budget. Workers feed state back through a
//! message channel; this module is the single writer of all shared maps.

pub mod budget;
mod tick;

pub use tick::resolve_focused_markets;

use std::collections::{HashMap, HashSet};
use std::sync::Mutex as StdMutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::{Mutex, RwLock, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::application::orchestrator::budget::LlmBudget;
use crate::application::pipeline::{FineGrainedAgentPipeline, PipelineDecision};
use crate::application::worker::{MarketWorker, WorkerHandle, WorkerMessage, WorkerSpec};
use crate::config::AutopilotConfig;
use crate::domain::market::normalize_market;
use crate::domain::ports::{AutopilotSink, GuidedTradingApi, LlmClient, McpClient};
use crate::domain::ring::{RingBuffer, ScreenshotStore};
use crate::domain::types::{
    AutopilotState, Candidate, CandidateStage, EventLevel, EventType, OrderFlowKind,
    OrderFlowStats, TimelineEvent, WorkerSnapshot, WorkerStatus, epoch_ms,
};

const EVENT_RING_CAPACITY: usize = 400;
const LOG_RING_CAPACITY: usize = 120;
const SCREENSHOT_CAPACITY: usize = 150;

/// Injected capability set, forwarded to every worker at spawn time.
#[derive(Clone)]
pub struct Services {
    pub backend: Arc<dyn GuidedTradingApi>,
    pub llm: Arc<dyn LlmClient>,
    pub mcp: Arc<dyn McpClient>,
    pub sink: Arc<dyn AutopilotSink>,
}

/// Fine-grained decision cache entry.
pub(crate) struct CachedDecision {
    pub at: i64,
    pub decision: PipelineDecision,
}

/// All orchestrator-owned mutable state. Guarded by one async mutex so the
/// tick and the worker-message pump are single writers per key.
pub(crate) struct Core {
    pub candidates: HashMap<String, Candidate>,
    pub workers: HashMap<String, WorkerHandle>,
    pub worker_states: HashMap<String, WorkerSnapshot>,
    pub external_cooldowns: HashMap<String, i64>,
    pub fine_decisions: HashMap<String, CachedDecision>,
    pub events: RingBuffer<TimelineEvent>,
    pub logs: RingBuffer<String>,
    pub screenshots: ScreenshotStore,
    pub order_flow: OrderFlowStats,
    pub budget: LlmBudget,
    pub blocked_by_daily_loss: bool,
    pub block_reason: Option<String>,
    pub last_open_markets: HashSet<String>,
    sink: Arc<dyn AutopilotSink>,
}

impl Core {
    fn new(sink: Arc<dyn AutopilotSink>) -> Self {
        Self {
            candidates: HashMap::new(),
            workers: HashMap::new(),
            worker_states: HashMap::new(),
            external_cooldowns: HashMap::new(),
            fine_decisions: HashMap::new(),
            events: RingBuffer::new(EVENT_RING_CAPACITY),
            logs: RingBuffer::new(LOG_RING_CAPACITY),
            screenshots: ScreenshotStore::new(SCREENSHOT_CAPACITY),
            order_flow: OrderFlowStats::default(),
            budget: LlmBudget::new(epoch_ms()),
            blocked_by_daily_loss: false,
            block_reason: None,
            last_open_markets: HashSet::new(),
            sink,
        }
    }

    pub fn push_event(&mut self, event: TimelineEvent) {
        match event.level {
            EventLevel::Info => info!(
                "Autopilot [{}] {}: {}",
                event.market.as_deref().unwrap_or("-"),
                event.action,
                event.detail
            ),
            EventLevel::Warn => warn!(
                "Autopilot [{}] {}: {}",
                event.market.as_deref().unwrap_or("-"),
                event.action,
                event.detail
            ),
            EventLevel::Error => error!(
                "Autopilot [{}] {}: {}",
                event.market.as_deref().unwrap_or("-"),
                event.action,
                event.detail
            ),
        }
        self.events.push(event);
    }

    pub fn log(&mut self, line: impl Into<String>) {
        let line = line.into();
        self.sink.on_log(&line);
        self.logs.push(line);
    }

    /// The only path that increments the daily LLM tally.
    pub fn note_llm_calls(&mut self, calls: u32, soft_cap: u32) {
        if self.budget.note(calls, soft_cap) {
            let used = self.budget.usage().used_today;
            self.push_event(TimelineEvent::new(
                EventType::Llm,
                EventLevel::Warn,
                "LLM_SOFT_CAP",
                format!("daily llm usage {used} crossed soft cap {soft_cap}"),
            ));
        }
    }

    pub fn apply_worker_message(&mut self, message: WorkerMessage, soft_cap: u32) {
        match message {
            WorkerMessage::State(snapshot) => {
                self.worker_states.insert(snapshot.market.clone(), snapshot);
            }
            WorkerMessage::Event(event) => {
                // Worker-side gating rejections surface on the candidate too.
                if let Some(market) = event.market.clone() {
                    let stage = match event.action.as_str() {
                        "LLM_REJECT" => Some(CandidateStage::LlmReject),
                        "PLAYWRIGHT_WARN" => Some(CandidateStage::PlaywrightWarn),
                        _ => None,
                    };
                    if let Some(stage) = stage {
                        if let Some(candidate) = self.candidates.get_mut(&market) {
                            candidate.stage = stage;
                            candidate.reason = event.detail.clone();
                            candidate.updated_at = event.at;
                        }
                    }
                }
                self.push_event(event);
            }
            WorkerMessage::OrderFlow { market, kind } => {
                self.order_flow.apply(kind);
                let level = if kind == OrderFlowKind::Cancelled {
                    EventLevel::Warn
                } else {
                    EventLevel::Info
                };
                self.push_event(
                    TimelineEvent::new(EventType::Order, level, kind.action(), "reported by worker")
                        .with_market(market),
                );
            }
            WorkerMessage::Screenshot(shot) => self.screenshots.insert(shot),
            WorkerMessage::LlmUsed { calls, .. } => self.note_llm_calls(calls, soft_cap),
        }
    }

    pub fn state_snapshot(&self, running: bool, enabled: bool) -> AutopilotState {
        let mut workers = self.worker_states.clone();
        for (market, handle) in &self.workers {
            workers.insert(market.clone(), handle.snapshot());
        }
        let mut workers: Vec<WorkerSnapshot> = workers.into_values().collect();
        workers.sort_by(|a, b| a.market.cmp(&b.market));

        let mut candidates: Vec<Candidate> = self.candidates.values().cloned().collect();
        candidates.sort_by(|a, b| {
            b.opportunity
                .score
                .partial_cmp(&a.opportunity.score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        AutopilotState {
            running,
            enabled,
            blocked_by_daily_loss: self.blocked_by_daily_loss,
            block_reason: self.block_reason.clone(),
            candidates,
            workers,
            events: self.events.to_vec(),
            logs: self.logs.to_vec(),
            order_flow: self.order_flow,
            llm_usage: self.budget.usage(),
            updated_at: epoch_ms(),
        }
    }

    pub fn emit_state(&self, running: bool, enabled: bool) {
        self.sink.on_state(self.state_snapshot(running, enabled));
    }
}

pub struct Orchestrator {
    services: Services,
    config: Arc<RwLock<AutopilotConfig>>,
    core: Mutex<Core>,
    pipeline: FineGrainedAgentPipeline,
    running: AtomicBool,
    /// Set by `stop()`; late worker snapshots are discarded afterwards.
    stopped: AtomicBool,
    worker_tx: mpsc::UnboundedSender<WorkerMessage>,
    worker_rx: StdMutex<Option<mpsc::UnboundedReceiver<WorkerMessage>>>,
    stop_tx: StdMutex<Option<watch::Sender<bool>>>,
    tasks: StdMutex<Vec<JoinHandle<()>>>,
}

impl Orchestrator {
    pub fn new(config: AutopilotConfig, services: Services) -> Self {
        let (worker_tx, worker_rx) = mpsc::unbounded_channel();
        Self {
            pipeline: FineGrainedAgentPipeline::new(services.llm.clone()),
            core: Mutex::new(Core::new(services.sink.clone())),
            config: Arc::new(RwLock::new(config)),
            services,
            running: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            worker_tx,
            worker_rx: StdMutex::new(Some(worker_rx)),
            stop_tx: StdMutex::new(None),
            tasks: StdMutex::new(Vec::new()),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Start the tick loop and the worker-message pump. Idempotent; the
    /// first tick runs immediately.
    pub async fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        self.stopped.store(false, Ordering::SeqCst);
        let (stop_tx, stop_rx) = watch::channel(false);
        *self.stop_tx.lock().unwrap() = Some(stop_tx);

        let enabled = {
            let cfg = self.config.read().await;
            cfg.enabled
        };
        {
            let mut core = self.core.lock().await;
            core.push_event(TimelineEvent::new(
                EventType::System,
                EventLevel::Info,
                "STARTED",
                "autopilot orchestrator started",
            ));
            core.log("autopilot started");
            core.emit_state(true, enabled);
        }

        let tick_ms = self.config.read().await.orchestrator_tick_ms.max(1_000) as u64;

        let me = Arc::clone(self);
        let mut tick_stop = stop_rx.clone();
        let tick_task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_millis(tick_ms));
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = tick_stop.changed() => break,
                    _ = interval.tick() => {
                        if !me.running.load(Ordering::SeqCst) {
                            break;
                        }
                        tokio::select! {
                            _ = tick_stop.changed() => break,
                            _ = me.tick() => {}
                        }
                    }
                }
            }
        });

        let me = Arc::clone(self);
        let mut pump_stop = stop_rx;
        let receiver = self.worker_rx.lock().unwrap().take();
        let pump_task = tokio::spawn(async move {
            let Some(mut rx) = receiver else {
                return;
            };
            loop {
                tokio::select! {
                    _ = pump_stop.changed() => break,
                    message = rx.recv() => {
                        match message {
                            Some(message) => me.apply_message(message).await,
                            None => break,
                        }
                    }
                }
            }
            *me.worker_rx.lock().unwrap() = Some(rx);
        });

        self.tasks.lock().unwrap().extend([tick_task, pump_task]);
    }

    /// Stop both loops, stop every worker (non-blocking) and clear the
    /// worker/candidate/cooldown maps. In-flight I/O is not cancelled;
    /// late callbacks after stop are tolerated. The timeline rings are
    /// kept for post-mortem reads.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.stopped.store(true, Ordering::SeqCst);
        if let Some(stop_tx) = self.stop_tx.lock().unwrap().take() {
            let _ = stop_tx.send(true);
        }
        self.tasks.lock().unwrap().clear();

        let enabled = self.config.read().await.enabled;
        let mut core = self.core.lock().await;
        let now = epoch_ms();
        for (market, handle) in core.workers.drain().collect::<Vec<_>>() {
            handle.stop("orchestrator stopped");
            core.worker_states.insert(market, handle.snapshot());
        }
        for snapshot in core.worker_states.values_mut() {
            if snapshot.status != WorkerStatus::Stopped {
                snapshot.status = WorkerStatus::Stopped;
                snapshot.note = "orchestrator stopped".to_string();
                snapshot.updated_at = now;
            }
        }
        core.candidates.clear();
        core.external_cooldowns.clear();
        core.fine_decisions.clear();
        core.push_event(TimelineEvent::new(
            EventType::System,
            EventLevel::Info,
            "STOPPED",
            "autopilot orchestrator stopped",
        ));
        core.log("autopilot stopped");
        core.emit_state(false, enabled);
    }

    /// Swap the configuration atomically between ticks.
    pub async fn update_config(&self, new_config: AutopilotConfig) {
        let enabled = new_config.enabled;
        *self.config.write().await = new_config;
        let mut core = self.core.lock().await;
        core.push_event(TimelineEvent::new(
            EventType::System,
            EventLevel::Info,
            "CONFIG_UPDATED",
            "configuration swapped",
        ));
        core.emit_state(self.is_running(), enabled);
    }

    /// Pause one market: delegate to its worker when one exists, otherwise
    /// register an external cooldown and demote the candidate.
    pub async fn pause_market(&self, market: &str, duration_ms: i64, reason: &str) {
        let market = normalize_market(market);
        let enabled = self.config.read().await.enabled;
        let mut core = self.core.lock().await;
        let now = epoch_ms();
        if let Some(handle) = core.workers.get(&market) {
            handle.pause(duration_ms, reason);
            core.log(format!(
                "Worker [{}] paused for {}s: {}",
                market,
                duration_ms.max(1_000) / 1_000,
                reason
            ));
        } else {
            core.external_cooldowns
                .insert(market.clone(), now + duration_ms.max(1_000));
            if let Some(candidate) = core.candidates.get_mut(&market) {
                candidate.stage = CandidateStage::Cooldown;
                candidate.reason = reason.to_string();
                candidate.updated_at = now;
            }
            core.log(format!(
                "Market [{}] cooled down for {}s: {}",
                market,
                duration_ms.max(1_000) / 1_000,
                reason
            ));
        }
        core.push_event(
            TimelineEvent::new(EventType::Worker, EventLevel::Info, "PAUSED", reason)
                .with_market(&market),
        );
        core.emit_state(self.is_running(), enabled);
    }

    /// Current full snapshot, for embedding hosts and tests.
    pub async fn snapshot(&self) -> AutopilotState {
        let enabled = self.config.read().await.enabled;
        let core = self.core.lock().await;
        core.state_snapshot(self.is_running(), enabled)
    }

    pub async fn has_worker(&self, market: &str) -> bool {
        let market = normalize_market(market);
        self.core.lock().await.workers.contains_key(&market)
    }

    /// Spawn spec of a live worker, if any. Test and inspection aid.
    pub async fn worker_spec(&self, market: &str) -> Option<WorkerSpec> {
        let market = normalize_market(market);
        self.core
            .lock()
            .await
            .workers
            .get(&market)
            .map(|handle| handle.spec().clone())
    }

    async fn apply_message(&self, message: WorkerMessage) {
        // Late snapshots from in-flight worker I/O after stop() are
        // discarded; they would overwrite the final STOPPED states.
        if self.stopped.load(Ordering::SeqCst) && matches!(message, WorkerMessage::State(_)) {
            return;
        }
        let cfg = self.config.read().await;
        let soft_cap = cfg.llm_daily_soft_cap;
        let enabled = cfg.enabled;
        drop(cfg);
        let mut core = self.core.lock().await;
        let emit = matches!(message, WorkerMessage::State(_));
        core.apply_worker_message(message, soft_cap);
        if emit {
            core.emit_state(self.is_running(), enabled);
        }
    }

    /// Apply every queued worker message. Used when the pump task is not
    /// running (single-tick mode and tests).
    pub async fn drain_worker_messages(&self) {
        let receiver = self.worker_rx.lock().unwrap().take();
        let Some(mut rx) = receiver else {
            return;
        };
        while let Ok(message) = rx.try_recv() {
            self.apply_message(message).await;
        }
        *self.worker_rx.lock().unwrap() = Some(rx);
    }

    pub(crate) fn spawn_worker(&self, core: &mut Core, spec: WorkerSpec, reason: &str) {
        let market = spec.market.clone();
        let worker = MarketWorker::new(
            spec,
            Arc::clone(&self.config),
            self.services.backend.clone(),
            self.services.llm.clone(),
            self.services.mcp.clone(),
            self.worker_tx.clone(),
        );
        let handle = worker.spawn();
        core.worker_states.insert(market.clone(), handle.snapshot());
        core.push_event(
            TimelineEvent::new(EventType::Worker, EventLevel::Info, "WORKER_SPAWNED", reason)
                .with_market(&market),
        );
        core.log(format!("Worker [{}] spawned: {}", market, reason));
        core.workers.insert(market, handle);
    }
}

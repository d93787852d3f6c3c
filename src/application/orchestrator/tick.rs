//! The orchestrator tick: opportunity discovery, candidate gating,
//! fine-grained review, worker lifecycle and global budgets.
//!
//! Slot accounting is per-tick: available slots are computed once at the
//! top and decremented locally on each spawn; a worker finishing inside
//! the tick frees its slot only on the next tick.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::Ordering;

use anyhow::Result;
use serde_json::json;

use crate::application::orchestrator::{CachedDecision, Core, Orchestrator};
use crate::application::pipeline::PipelineOptions;
use crate::application::worker::WorkerSpec;
use crate::config::{AutopilotConfig, clamp_entry_amount};
use crate::domain::market::{normalize_focused_market, normalize_market};
use crate::domain::types::{
    AdoptRequest, Candidate, CandidateStage, EventLevel, EventType, FocusedEntryGate,
    OpportunityStage, PositionStatus, TimelineEvent, WorkerStatus, epoch_ms,
};

const FOCUSED_MARKET_CAP: usize = 8;
const FINE_AGENT_TTL_MIN_MS: i64 = 15_000;
const FINE_AGENT_TTL_MAX_MS: i64 = 300_000;

/// Normalize, dedup and cap the focused-scalp market list.
pub fn resolve_focused_markets(cfg: &AutopilotConfig) -> Vec<String> {
    if !cfg.focused_scalp_enabled {
        return Vec::new();
    }
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for raw in &cfg.focused_scalp_markets {
        if let Some(market) = normalize_focused_market(raw) {
            if seen.insert(market.clone()) {
                out.push(market);
                if out.len() == FOCUSED_MARKET_CAP {
                    break;
                }
            }
        }
    }
    out
}

impl Orchestrator {
    /// One orchestrator tick. Errors never escape: they are materialized as
    /// an `ORCHESTRATOR_TICK_ERROR` event and the loop continues.
    pub async fn tick(&self) {
        let cfg = self.config.read().await.clone();
        let mut core = self.core.lock().await;
        if let Err(e) = self.tick_inner(&mut core, &cfg).await {
            core.push_event(TimelineEvent::new(
                EventType::System,
                EventLevel::Error,
                "ORCHESTRATOR_TICK_ERROR",
                format!("{e:#}"),
            ));
            core.log(format!("orchestrator tick failed: {e:#}"));
        }
        core.emit_state(self.running.load(Ordering::SeqCst), cfg.enabled);
    }

    async fn tick_inner(&self, core: &mut Core, cfg: &AutopilotConfig) -> Result<()> {
        let now = epoch_ms();

        // 1. Roll the LLM budget on KST date change.
        if core.budget.roll_over(now) {
            core.push_event(TimelineEvent::new(
                EventType::System,
                EventLevel::Info,
                "LLM_BUDGET_RESET",
                format!("llm budget rolled over to {}", core.budget.usage().date_key),
            ));
        }

        // Master switch: no new activity, running workers keep ticking.
        if !cfg.enabled {
            return Ok(());
        }

        // 2. Daily loss gate.
        let stats = self.services.backend.today_stats().await?;
        let blocked = stats.total_pnl_krw <= cfg.daily_loss_limit_krw;
        if blocked && !core.blocked_by_daily_loss {
            core.push_event(TimelineEvent::new(
                EventType::System,
                EventLevel::Warn,
                "DAILY_LOSS_BLOCK",
                format!(
                    "today pnl {} KRW at or below limit {} KRW, new entries blocked",
                    stats.total_pnl_krw, cfg.daily_loss_limit_krw
                ),
            ));
        }
        core.blocked_by_daily_loss = blocked;
        core.block_reason = blocked.then(|| {
            format!(
                "daily pnl {} KRW at or below limit {} KRW",
                stats.total_pnl_krw, cfg.daily_loss_limit_krw
            )
        });

        // 3. Open positions.
        let positions = self.services.backend.open_positions().await?;
        let open_markets: HashSet<String> = positions
            .iter()
            .filter(|p| {
                matches!(
                    p.status,
                    PositionStatus::Open | PositionStatus::PendingEntry
                )
            })
            .map(|p| normalize_market(&p.market))
            .collect();
        core.last_open_markets = open_markets.clone();

        // 4. Expire external cooldowns.
        core.external_cooldowns.retain(|_, deadline| *deadline > now);

        // 5. Focused-scalp loop sync.
        let focused = resolve_focused_markets(cfg);
        let focused_set: HashSet<String> = focused.iter().cloned().collect();
        let removed: Vec<String> = core
            .workers
            .iter()
            .filter(|(market, handle)| handle.focused() && !focused_set.contains(*market))
            .map(|(market, _)| market.clone())
            .collect();
        for market in removed {
            if let Some(handle) = core.workers.remove(&market) {
                handle.stop("focused loop removal");
                core.worker_states.insert(market.clone(), handle.snapshot());
                core.push_event(
                    TimelineEvent::new(
                        EventType::Worker,
                        EventLevel::Info,
                        "FOCUSED_SCALP_STOP",
                        "removed from focused market list",
                    )
                    .with_market(&market),
                );
            }
        }
        for market in &focused {
            if !core.workers.contains_key(market) {
                let spec = WorkerSpec {
                    market: market.clone(),
                    korean_name: String::new(),
                    focused: true,
                    skip_llm_entry_review: matches!(
                        cfg.focused_entry_gate,
                        FocusedEntryGate::FastOnly
                    ),
                    entry_amount_krw: clamp_entry_amount(cfg.amount_krw),
                    tick_ms: cfg.focused_scalp_poll_interval_ms,
                    warn_holding_ms: Some(cfg.focused_warn_holding_ms),
                    max_holding_ms: Some(cfg.focused_max_holding_ms),
                };
                self.spawn_worker(core, spec, "focused scalp loop");
            }
        }

        // 6. Adopt workers for open positions, even when slots or the daily
        // loss gate would block fresh entries.
        for market in &open_markets {
            if !core.workers.contains_key(market) {
                if let Err(e) = self
                    .services
                    .backend
                    .adopt_position(AdoptRequest {
                        market: market.clone(),
                        mode: cfg.trading_mode,
                        interval: cfg.interval.clone(),
                        entry_source: "AUTOPILOT_ADOPT".to_string(),
                        notes: "adopted by orchestrator reconciliation".to_string(),
                    })
                    .await
                {
                    core.push_event(
                        TimelineEvent::new(
                            EventType::Worker,
                            EventLevel::Warn,
                            "ADOPT_WARN",
                            format!("backend adoption failed: {e:#}"),
                        )
                        .with_market(market),
                    );
                }
                let spec = WorkerSpec {
                    market: market.clone(),
                    korean_name: String::new(),
                    focused: false,
                    skip_llm_entry_review: false,
                    entry_amount_krw: clamp_entry_amount(cfg.amount_krw),
                    tick_ms: cfg.worker_tick_ms,
                    warn_holding_ms: None,
                    max_holding_ms: None,
                };
                self.spawn_worker(core, spec, "adopting open position");
            }
        }

        // 7. Early exit while the daily loss gate is closed: no scanning,
        // no fresh entries. Position care continues in the workers.
        if core.blocked_by_daily_loss {
            return Ok(());
        }

        // 8. Fetch ranked opportunities.
        let opportunities = self
            .services
            .backend
            .autopilot_opportunities(
                &cfg.interval,
                &cfg.confirm_interval,
                cfg.trading_mode,
                cfg.candidate_limit,
            )
            .await?;

        // 9–11. Gate, consult the fine-grained pipeline, spawn. One pass
        // with local slot accounting.
        let mut available_slots = cfg
            .max_concurrent_positions
            .saturating_sub(core.workers.values().filter(|h| !h.focused()).count());
        let mut fine_agent_budget = if cfg.fine_agent_enabled {
            cfg.fine_agent_max_per_tick
        } else {
            0
        };
        let ttl = cfg
            .fine_agent_decision_ttl_ms
            .clamp(FINE_AGENT_TTL_MIN_MS, FINE_AGENT_TTL_MAX_MS);
        core.fine_decisions.retain(|_, d| now - d.at <= 2 * ttl);

        let mut next_candidates: HashMap<String, Candidate> = HashMap::new();

        for mut opportunity in opportunities.into_iter().take(cfg.candidate_limit) {
            opportunity.market = normalize_market(&opportunity.market);
            let market = opportunity.market.clone();
            if focused_set.contains(&market) {
                continue;
            }

            let (stage, reason, eligible) = if opportunity.stage == OpportunityStage::RuleFail {
                (CandidateStage::RuleFail, opportunity.reason.clone(), false)
            } else if open_markets.contains(&market) {
                (
                    CandidateStage::PositionOpen,
                    "position already open".to_string(),
                    false,
                )
            } else if let Some(deadline) = core
                .external_cooldowns
                .get(&market)
                .copied()
                .filter(|deadline| *deadline > now)
            {
                (
                    CandidateStage::Cooldown,
                    format!("cooldown {}s remaining", ((deadline - now) / 1000).max(0)),
                    false,
                )
            } else if let Some(handle) = core.workers.get(&market) {
                if handle.status() == WorkerStatus::Cooldown
                    && handle.cooldown_until().is_some_and(|d| d > now)
                {
                    (
                        CandidateStage::Cooldown,
                        "worker cooling down".to_string(),
                        false,
                    )
                } else {
                    (
                        CandidateStage::WorkerActive,
                        "worker already active".to_string(),
                        false,
                    )
                }
            } else if available_slots == 0 {
                (
                    CandidateStage::SlotFull,
                    "no position slots left".to_string(),
                    false,
                )
            } else {
                (
                    CandidateStage::from(opportunity.stage),
                    opportunity.reason.clone(),
                    true,
                )
            };

            let mut candidate = Candidate {
                opportunity,
                stage,
                reason,
                updated_at: now,
            };

            // 10. Fine-grained pipeline for eligible graded candidates.
            if eligible
                && matches!(
                    candidate.stage,
                    CandidateStage::AutoPass | CandidateStage::Borderline
                )
                && fine_agent_budget > 0
            {
                fine_agent_budget -= 1;
                let cached = core
                    .fine_decisions
                    .get(&market)
                    .filter(|d| now - d.at <= ttl)
                    .map(|d| d.decision.clone());
                let decision = match cached {
                    Some(decision) => decision,
                    None => {
                        let context = self
                            .services
                            .backend
                            .agent_context(&market, &cfg.interval, 200, 10, cfg.trading_mode)
                            .await
                            .ok();
                        let decision = self
                            .pipeline
                            .run(PipelineOptions {
                                opportunity: &candidate.opportunity,
                                context: context.as_ref(),
                                trading_mode: cfg.trading_mode,
                                model: &cfg.llm_model,
                                min_llm_confidence: cfg.min_llm_confidence,
                                full_mode: cfg.fine_agent_full_mode,
                            })
                            .await;
                        core.note_llm_calls(decision.llm_calls, cfg.llm_daily_soft_cap);
                        core.fine_decisions.insert(
                            market.clone(),
                            CachedDecision {
                                at: now,
                                decision: decision.clone(),
                            },
                        );
                        decision
                    }
                };
                core.push_event(
                    TimelineEvent::new(
                        EventType::Llm,
                        if decision.approve {
                            EventLevel::Info
                        } else {
                            EventLevel::Warn
                        },
                        "FINE_AGENT_REVIEW",
                        format!(
                            "stage {:?}, score {:.0}, confidence {:.0}: {}",
                            decision.stage, decision.score, decision.confidence, decision.reason
                        ),
                    )
                    .with_market(&market),
                );
                candidate.stage = CandidateStage::from(decision.stage);
                candidate.reason = decision.reason.clone();
            }

            // 11. Spawn the entry worker.
            if eligible
                && matches!(
                    candidate.stage,
                    CandidateStage::AutoPass | CandidateStage::Borderline
                )
                && available_slots > 0
            {
                let auto_pass = candidate.stage == CandidateStage::AutoPass;
                let spec = WorkerSpec {
                    market: market.clone(),
                    korean_name: candidate.opportunity.korean_name.clone(),
                    focused: false,
                    skip_llm_entry_review: auto_pass,
                    entry_amount_krw: cfg.entry_amount_for(auto_pass),
                    tick_ms: cfg.worker_tick_ms,
                    warn_holding_ms: None,
                    max_holding_ms: None,
                };
                self.spawn_worker(core, spec, "opportunity entry");
                available_slots -= 1;
                candidate.stage = CandidateStage::Entered;
                candidate.reason = "worker spawned".to_string();
                core.push_event(
                    TimelineEvent::new(
                        EventType::Candidate,
                        EventLevel::Info,
                        "ENTERED",
                        format!(
                            "entry worker spawned ({})",
                            if auto_pass { "AUTO_PASS" } else { "BORDERLINE" }
                        ),
                    )
                    .with_market(&market),
                );
            }

            next_candidates.insert(market, candidate);
        }

        // 12. Best-effort decision journal.
        let payload = decision_log_payload(now, cfg, core, &next_candidates);
        if let Err(e) = self.services.backend.log_decision(payload).await {
            core.push_event(TimelineEvent::new(
                EventType::System,
                EventLevel::Warn,
                "DECISION_LOG_WARN",
                format!("decision log failed: {e:#}"),
            ));
        }

        // 13. Prune idle workers outside both the open set and the
        // shortlist, unless mid-entry, managing, checking or paused.
        let shortlist: HashSet<String> = next_candidates.keys().cloned().collect();
        let idle: Vec<String> = core
            .workers
            .iter()
            .filter(|(market, handle)| {
                !handle.focused()
                    && !open_markets.contains(*market)
                    && !shortlist.contains(*market)
                    && !matches!(
                        handle.status(),
                        WorkerStatus::Entering
                            | WorkerStatus::Managing
                            | WorkerStatus::PlaywrightCheck
                            | WorkerStatus::Paused
                    )
            })
            .map(|(market, _)| market.clone())
            .collect();
        for market in idle {
            if let Some(handle) = core.workers.remove(&market) {
                handle.stop("high-confidence shortlist exclusion");
                core.worker_states.insert(market.clone(), handle.snapshot());
                core.push_event(
                    TimelineEvent::new(
                        EventType::Worker,
                        EventLevel::Info,
                        "WORKER_PRUNED",
                        "high-confidence shortlist exclusion",
                    )
                    .with_market(&market),
                );
            }
        }

        // 14. Replace the candidate map atomically.
        core.candidates = next_candidates;
        Ok(())
    }
}

fn decision_log_payload(
    now: i64,
    cfg: &AutopilotConfig,
    core: &Core,
    candidates: &HashMap<String, Candidate>,
) -> serde_json::Value {
    json!({
        "at": now,
        "tradingMode": cfg.trading_mode,
        "blockedByDailyLoss": core.blocked_by_daily_loss,
        "llmUsedToday": core.budget.usage().used_today,
        "candidates": candidates
            .values()
            .map(|c| {
                json!({
                    "market": c.opportunity.market,
                    "stage": c.stage,
                    "score": c.opportunity.score,
                    "reason": c.reason,
                })
            })
            .collect::<Vec<_>>(),
    })
}

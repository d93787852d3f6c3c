//! Entry path: deterministic pre-check, LLM review policy, order-plan
//! selection, optional UI verification and guided entry with MCP fallback.

use anyhow::{Context, Result};
use serde_json::json;
use uuid::Uuid;

use crate::application::worker::{MarketWorker, WorkerMessage};
use crate::config::AutopilotConfig;
use crate::domain::review::{EntryVerdict, Severity};
use crate::domain::types::{
    EntryPolicy, EntryOrderMode, EntryRequest, EventLevel, EventType, McpNamespace, OrderFlowKind,
    OrderPlan, OrderType, Recommendation, Screenshot, TimelineEvent, WorkerStatus, epoch_ms,
};

/// Positive premium of the current price over the recommended entry.
pub fn entry_gap_pct(rec: &Recommendation) -> f64 {
    if rec.recommended_entry <= 0.0 {
        return 0.0;
    }
    ((rec.current_price - rec.recommended_entry) / rec.recommended_entry * 100.0).max(0.0)
}

/// Pure pre-check, no LLM involved. Returns the rejection reason when the
/// recommendation is not entry-worthy.
pub fn deterministic_entry_block(rec: &Recommendation) -> Option<String> {
    if rec.risk_reward < 1.05 {
        return Some(format!("risk/reward {:.2} below 1.05", rec.risk_reward));
    }
    if rec.current_price <= rec.stop_loss * 1.003 {
        return Some(format!(
            "price {:.4} too close to stop {:.4}",
            rec.current_price, rec.stop_loss
        ));
    }
    if rec.current_price >= rec.take_profit * 0.995 {
        return Some(format!(
            "price {:.4} too close to target {:.4}",
            rec.current_price, rec.take_profit
        ));
    }
    None
}

#[derive(Debug, Clone, PartialEq)]
pub enum EntryPlan {
    Allow(OrderPlan),
    Reject { reason: String },
}

/// Select the order plan for the configured mode and entry gap.
pub fn plan_entry_order(mode: EntryOrderMode, gap_pct: f64, recommended_entry: f64) -> EntryPlan {
    match mode {
        EntryOrderMode::Market => EntryPlan::Allow(OrderPlan {
            order_type: OrderType::Market,
            limit_price: None,
        }),
        EntryOrderMode::Limit => EntryPlan::Allow(OrderPlan {
            order_type: OrderType::Limit,
            limit_price: Some(recommended_entry),
        }),
        EntryOrderMode::Adaptive => {
            if gap_pct <= 0.25 {
                EntryPlan::Allow(OrderPlan {
                    order_type: OrderType::Market,
                    limit_price: None,
                })
            } else if gap_pct <= 1.2 {
                EntryPlan::Allow(OrderPlan {
                    order_type: OrderType::Limit,
                    limit_price: Some(recommended_entry),
                })
            } else {
                EntryPlan::Reject {
                    reason: format!("gap {gap_pct:.2}% > 1.2%"),
                }
            }
        }
    }
}

/// Policy table for LLM entry verdicts.
pub fn entry_policy_accepts(policy: EntryPolicy, verdict: &EntryVerdict, min_confidence: u8) -> bool {
    match policy {
        EntryPolicy::Conservative => verdict.approve && verdict.confidence >= min_confidence,
        EntryPolicy::Balanced => {
            if verdict.severity == Severity::High {
                return false;
            }
            (verdict.approve && verdict.confidence >= min_confidence)
                || (!verdict.approve && verdict.confidence >= 40)
        }
        EntryPolicy::Aggressive => verdict.severity != Severity::High,
    }
}

/// Cooldown after an LLM rejection, bounded by severity. The LLM's own
/// suggestion overrides the default within the same bounds.
pub fn llm_reject_cooldown_ms(verdict: &EntryVerdict) -> i64 {
    let (lo, hi, default) = if verdict.severity == Severity::High {
        (90, 300, 180)
    } else {
        (45, 120, 60)
    };
    let sec = verdict
        .suggested_cooldown_sec
        .map(|s| s as i64)
        .unwrap_or(default)
        .clamp(lo, hi);
    sec * 1_000
}

impl MarketWorker {
    pub(crate) async fn try_entry(&mut self, cfg: &AutopilotConfig, now: i64) -> Result<()> {
        self.set_status(WorkerStatus::Analyzing, "fetching context");
        let ctx = self
            .backend
            .agent_context(&self.spec.market, &cfg.interval, 200, 10, cfg.trading_mode)
            .await?;

        let Some(rec) = ctx.chart.recommendation.clone() else {
            self.reject_entry(now, EventType::Llm, "LLM_REJECT", "no recommendation", 45_000);
            return Ok(());
        };

        if let Some(reason) = deterministic_entry_block(&rec) {
            self.reject_entry(now, EventType::Llm, "LLM_REJECT", &reason, 45_000);
            return Ok(());
        }

        if !self.spec.skip_llm_entry_review {
            self.set_status(WorkerStatus::Analyzing, "llm entry review");
            let verdict = match self.entry_review(cfg, &rec, &ctx).await {
                Ok(v) => v,
                Err(e) => {
                    self.emit_event(
                        EventType::Llm,
                        EventLevel::Warn,
                        "LLM_REVIEW_WARN",
                        format!("{e:#}"),
                    );
                    self.reject_entry(now, EventType::Llm, "LLM_REJECT", "llm unavailable", 60_000);
                    return Ok(());
                }
            };
            if !entry_policy_accepts(cfg.entry_policy, &verdict, cfg.min_llm_confidence) {
                let cooldown = llm_reject_cooldown_ms(&verdict);
                self.reject_entry(
                    now,
                    EventType::Llm,
                    "LLM_REJECT",
                    &format!("{} (confidence {})", verdict.reason, verdict.confidence),
                    cooldown,
                );
                return Ok(());
            }
        }

        let gap = entry_gap_pct(&rec);
        let plan = match plan_entry_order(cfg.entry_order_mode, gap, rec.recommended_entry) {
            EntryPlan::Allow(plan) => plan,
            EntryPlan::Reject { reason } => {
                self.reject_entry(now, EventType::Worker, "CHASE_RISK", &reason, 45_000);
                return Ok(());
            }
        };

        // Warning-only sanity check, never blocks the entry.
        if cfg.playwright_enabled {
            self.verify_with_playwright().await;
        }

        self.set_status(
            WorkerStatus::Entering,
            format!("placing {:?} order", plan.order_type),
        );
        let request = self.entry_request(cfg, &plan);
        self.emit_order(OrderFlowKind::BuyRequested);
        if let Err(e) = self.backend.start_entry(request.clone()).await {
            self.emit_event(
                EventType::Order,
                EventLevel::Warn,
                "ENTRY_FAILED",
                format!("guided entry failed: {e:#}"),
            );
            // Double failure propagates into the tick error handler.
            self.fallback_entry_by_mcp(&request).await?;
            self.emit_event(
                EventType::Order,
                EventLevel::Info,
                "ENTRY_FALLBACK",
                "entry placed through mcp fallback",
            );
        }

        self.awaiting_fill_confirm = true;
        self.market_fallback_tried = false;
        // Optimistic fill notification; the confirming one follows the first
        // observed OPEN state.
        self.emit_order(OrderFlowKind::BuyFilled);
        self.pending_entry_observed_at = Some(now);
        self.set_status(WorkerStatus::Entering, "order placed, awaiting backend");
        Ok(())
    }

    pub(crate) fn entry_request(&self, cfg: &AutopilotConfig, plan: &OrderPlan) -> EntryRequest {
        EntryRequest {
            market: self.spec.market.clone(),
            amount_krw: self.spec.entry_amount_krw,
            order_type: plan.order_type,
            limit_price: plan.limit_price,
            interval: cfg.interval.clone(),
            mode: cfg.trading_mode,
            entry_source: if self.spec.focused {
                "FOCUSED_SCALP".to_string()
            } else {
                "AUTOPILOT".to_string()
            },
            strategy_code: if self.spec.focused {
                "FOCUSED_SCALP_V1".to_string()
            } else {
                "AUTOPILOT_V2".to_string()
            },
        }
    }

    async fn fallback_entry_by_mcp(&self, request: &EntryRequest) -> Result<()> {
        let args = serde_json::to_value(request).context("serialize mcp entry args")?;
        let result = self
            .mcp
            .execute_tool("start_guided_entry", args, McpNamespace::Trading)
            .await
            .context("mcp fallback entry")?;
        if result.is_error {
            anyhow::bail!("mcp fallback entry rejected: {}", result.text());
        }
        Ok(())
    }

    pub(crate) async fn verify_with_playwright(&mut self) {
        self.set_status(WorkerStatus::PlaywrightCheck, "ui sanity check");
        let args = json!({ "market": self.spec.market });
        match self
            .mcp
            .execute_tool("browser_take_screenshot", args.clone(), McpNamespace::Playwright)
            .await
        {
            Ok(result) if !result.is_error => {
                let image = result.content.iter().find(|c| c.kind == "image");
                match image {
                    Some(image) => {
                        let mime = image
                            .mime_type
                            .clone()
                            .unwrap_or_else(|| "image/png".to_string());
                        let src = image
                            .data
                            .as_ref()
                            .map(|d| format!("data:{mime};base64,{d}"))
                            .or_else(|| image.url.clone());
                        let Some(src) = src else {
                            return;
                        };
                        let id = Uuid::new_v4().to_string();
                        let _ = self.tx.send(WorkerMessage::Screenshot(Screenshot {
                            id: id.clone(),
                            at: epoch_ms(),
                            mime_type: mime,
                            src,
                        }));
                        self.push_event(
                            TimelineEvent::new(
                                EventType::Playwright,
                                EventLevel::Info,
                                "PLAYWRIGHT_CHECK",
                                "ui snapshot captured",
                            )
                            .with_market(&self.spec.market)
                            .with_tool("browser_take_screenshot", args)
                            .with_screenshot(id),
                        );
                    }
                    None => {
                        self.emit_event(
                            EventType::Playwright,
                            EventLevel::Info,
                            "PLAYWRIGHT_CHECK",
                            "no image content returned",
                        );
                    }
                }
            }
            Ok(result) => {
                self.emit_event(
                    EventType::Playwright,
                    EventLevel::Warn,
                    "PLAYWRIGHT_WARN",
                    result.text(),
                );
            }
            Err(e) => {
                self.emit_event(
                    EventType::Playwright,
                    EventLevel::Warn,
                    "PLAYWRIGHT_WARN",
                    format!("{e:#}"),
                );
            }
        }
    }
}

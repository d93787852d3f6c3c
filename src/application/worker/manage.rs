//! Open-position and pending-entry management.

use anyhow::Result;

use crate::application::worker::MarketWorker;
use crate::config::AutopilotConfig;
use crate::domain::review::PositionAction;
use crate::domain::types::{
    EventLevel, EventType, OrderFlowKind, OrderPlan, OrderType, Position, PositionStatus,
    WorkerStatus,
};

impl MarketWorker {
    /// Position care while the worker is in cooldown: a cooldown blocks new
    /// entries, never the management of what is already on the book.
    pub(crate) async fn manage_existing(
        &mut self,
        cfg: &AutopilotConfig,
        now: i64,
    ) -> Result<()> {
        match self.backend.position(&self.spec.market).await? {
            Some(p) if p.status == PositionStatus::Open => {
                self.note_open(now);
                self.manage_position(cfg, &p, now).await
            }
            Some(p) if p.status == PositionStatus::PendingEntry => {
                self.manage_pending(cfg, now).await
            }
            _ => {
                if self.had_open_position {
                    // Closed while cooling down; no extra cooldown on top.
                    self.reset_position_trackers();
                }
                Ok(())
            }
        }
    }

    /// Pending-entry watchdog. Cancels exactly once per pending cycle after
    /// the timeout, then optionally retries with a market order.
    pub(crate) async fn manage_pending(&mut self, cfg: &AutopilotConfig, now: i64) -> Result<()> {
        self.set_status(WorkerStatus::Managing, "awaiting fill");
        let observed = *self.pending_entry_observed_at.get_or_insert(now);
        if now - observed < cfg.pending_entry_timeout_ms {
            return Ok(());
        }

        self.backend.cancel_pending(&self.spec.market).await?;
        self.pending_entry_observed_at = None;
        self.awaiting_fill_confirm = false;
        self.emit_order(OrderFlowKind::Cancelled);
        self.emit_event(
            EventType::Order,
            EventLevel::Warn,
            "PENDING_ENTRY_TIMEOUT",
            format!("cancelled after {}ms without fill", now - observed),
        );

        if cfg.market_fallback_after_cancel && !self.market_fallback_tried {
            self.market_fallback_tried = true;
            let request = self.entry_request(
                cfg,
                &OrderPlan {
                    order_type: OrderType::Market,
                    limit_price: None,
                },
            );
            match self.backend.start_entry(request).await {
                Ok(()) => {
                    self.emit_order(OrderFlowKind::BuyRequested);
                    self.emit_order(OrderFlowKind::BuyFilled);
                    self.awaiting_fill_confirm = true;
                    self.pending_entry_observed_at = Some(now);
                    self.set_status(WorkerStatus::Managing, "market fallback placed");
                }
                Err(e) => {
                    self.emit_event(
                        EventType::Order,
                        EventLevel::Error,
                        "ENTRY_FAILED",
                        format!("market fallback failed: {e:#}"),
                    );
                    self.shared.set_cooldown(now + 90_000);
                    self.set_status(WorkerStatus::Cooldown, "market fallback failed");
                }
            }
        } else {
            self.shared.set_cooldown(now + 90_000);
            self.set_status(WorkerStatus::Cooldown, "pending entry cancelled");
        }
        Ok(())
    }

    /// Open-position management: peak tracking, throttled event-driven LLM
    /// review, then the deterministic exits in the same tick.
    pub(crate) async fn manage_position(
        &mut self,
        cfg: &AutopilotConfig,
        position: &Position,
        now: i64,
    ) -> Result<()> {
        let pnl = position.unrealized_pnl_percent;
        if pnl > self.peak_pnl_percent {
            self.peak_pnl_percent = pnl;
        }
        let peak_drawdown = self.peak_pnl_percent - pnl;
        self.set_status(
            WorkerStatus::Managing,
            format!("pnl {:+.2}% (peak {:+.2}%)", pnl, self.peak_pnl_percent),
        );

        if self.spec.focused {
            if let Some(opened_at) = self.open_observed_at {
                let held_ms = now - opened_at;
                if let Some(max_ms) = self.spec.max_holding_ms {
                    if held_ms >= max_ms {
                        self.emit_event(
                            EventType::Worker,
                            EventLevel::Warn,
                            "MAX_HOLDING_EXIT",
                            format!("held {}s, limit {}s", held_ms / 1000, max_ms / 1000),
                        );
                        return self
                            .full_exit(now, "max holding elapsed", cfg.post_exit_cooldown_ms)
                            .await;
                    }
                }
                if let Some(warn_ms) = self.spec.warn_holding_ms {
                    if held_ms >= warn_ms && !self.holding_warned {
                        self.holding_warned = true;
                        self.emit_event(
                            EventType::Worker,
                            EventLevel::Warn,
                            "HOLDING_WARN",
                            format!("held {}s", held_ms / 1000),
                        );
                    }
                }
            }
        }

        let review_due = pnl <= -0.6
            || pnl >= 1.6
            || (position.trailing_active && peak_drawdown >= 0.7);
        if review_due && now - self.last_review_at >= cfg.llm_review_interval_ms {
            self.last_review_at = now;
            let review = self.review_position(cfg, position, pnl, peak_drawdown).await;
            match review.action {
                PositionAction::Hold => {}
                PositionAction::PartialTp => {
                    if !position.half_take_profit_done {
                        self.partial_take_profit(&review.reason).await?;
                    }
                }
                PositionAction::FullExit => {
                    self.emit_event(
                        EventType::Llm,
                        EventLevel::Warn,
                        "LLM_FULL_EXIT",
                        review.reason.clone(),
                    );
                    return self
                        .full_exit(now, "llm full exit", cfg.post_exit_cooldown_ms)
                        .await;
                }
            }
        }

        if pnl <= -0.8 {
            return self.full_exit(now, "fast stop-loss", 8 * 60_000).await;
        }
        if !position.half_take_profit_done && pnl >= 1.2 {
            self.partial_take_profit("half take-profit at +1.2%").await?;
        }
        if pnl >= 2.2 {
            return self.full_exit(now, "take-profit target", 3 * 60_000).await;
        }
        Ok(())
    }

    pub(crate) async fn full_exit(
        &mut self,
        now: i64,
        reason: &str,
        cooldown_ms: i64,
    ) -> Result<()> {
        self.emit_order(OrderFlowKind::SellRequested);
        self.backend.stop_position(&self.spec.market).await?;
        self.emit_order(OrderFlowKind::SellFilled);
        self.emit_event(EventType::Order, EventLevel::Info, "FULL_EXIT", reason);
        self.reset_position_trackers();
        self.shared.set_cooldown(now + cooldown_ms);
        self.set_status(WorkerStatus::Cooldown, reason);
        Ok(())
    }

    pub(crate) async fn partial_take_profit(&mut self, reason: &str) -> Result<()> {
        self.emit_order(OrderFlowKind::SellRequested);
        self.backend
            .partial_take_profit(&self.spec.market, 0.5)
            .await?;
        self.emit_order(OrderFlowKind::SellFilled);
        self.emit_event(EventType::Order, EventLevel::Info, "PARTIAL_TP", reason);
        Ok(())
    }
}

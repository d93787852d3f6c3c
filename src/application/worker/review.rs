//! LLM calls made by the worker: entry review and open-position review.
//!
//! Every call is tallied towards the orchestrator's daily budget through a
//! single message kind; a gateway failure is a gating outcome, never a
//! propagated error.

use anyhow::Result;

use crate::application::worker::{MarketWorker, WorkerMessage};
use crate::config::AutopilotConfig;
use crate::domain::review::{EntryVerdict, PositionReview};
use crate::domain::types::{
    AgentContext, EventLevel, EventType, OneShotRequest, Position, Recommendation,
};

fn entry_review_prompt(market: &str, rec: &Recommendation) -> String {
    format!(
        "You review a proposed long scalp entry in {market}.\n\
         Recommended entry {entry:.4}, current {current:.4}, stop {stop:.4}, \
         target {target:.4}, risk/reward {rr:.2}.\n\
         Judge whether entering now is sound. \
         Reply with exactly one JSON object: \
         {{\"approve\": bool, \"confidence\": 0-100, \
         \"severity\": \"LOW|MEDIUM|HIGH\", \"reason\": \"<= 120 chars\", \
         \"suggestedCooldownSec\": optional number}}",
        entry = rec.recommended_entry,
        current = rec.current_price,
        stop = rec.stop_loss,
        target = rec.take_profit,
        rr = rec.risk_reward,
    )
}

fn position_review_prompt(market: &str, position: &Position, pnl: f64, drawdown: f64) -> String {
    format!(
        "You manage an open long position in {market}.\n\
         Unrealized pnl {pnl:+.2}%, drawdown from peak {drawdown:.2}%, \
         half take-profit done: {half}, trailing active: {trailing}.\n\
         Choose the next action. \
         Reply with exactly one JSON object: \
         {{\"action\": \"HOLD|PARTIAL_TP|FULL_EXIT\", \
         \"confidence\": 0-100, \"reason\": \"<= 120 chars\"}}",
        half = position.half_take_profit_done,
        trailing = position.trailing_active,
    )
}

impl MarketWorker {
    /// One-shot LLM request with budget accounting. The tally message is
    /// sent for every attempt, settled or failed.
    async fn ask_llm(
        &self,
        cfg: &AutopilotConfig,
        prompt: String,
        context: Option<String>,
    ) -> Result<String> {
        let result = self
            .llm
            .request_one_shot_text(OneShotRequest {
                model: cfg.llm_model.clone(),
                trading_mode: cfg.trading_mode,
                context,
                prompt,
            })
            .await;
        let _ = self.tx.send(WorkerMessage::LlmUsed {
            market: self.spec.market.clone(),
            calls: 1,
        });
        result
    }

    pub(crate) async fn entry_review(
        &self,
        cfg: &AutopilotConfig,
        rec: &Recommendation,
        ctx: &AgentContext,
    ) -> Result<EntryVerdict> {
        let prompt = entry_review_prompt(&self.spec.market, rec);
        let context = serde_json::to_string(ctx).ok();
        let text = self.ask_llm(cfg, prompt, context).await?;
        Ok(EntryVerdict::from_text(&text))
    }

    pub(crate) async fn review_position(
        &self,
        cfg: &AutopilotConfig,
        position: &Position,
        pnl: f64,
        drawdown: f64,
    ) -> PositionReview {
        let prompt = position_review_prompt(&self.spec.market, position, pnl, drawdown);
        match self.ask_llm(cfg, prompt, None).await {
            Ok(text) => PositionReview::from_text(&text),
            Err(e) => {
                self.emit_event(
                    EventType::Llm,
                    EventLevel::Warn,
                    "POSITION_REVIEW_WARN",
                    format!("{e:#}"),
                );
                PositionReview::hold("llm unavailable")
            }
        }
    }
}

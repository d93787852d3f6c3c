//! Fine-grained agent pipeline.
//!
//! Turns a ranked opportunity plus a feature pack into an approve/reject
//! decision via a three-role cascade: specialists (TECHNICAL,
//! MICROSTRUCTURE, EXECUTION_RISK) → synthesizer → portfolio manager.
//! The pipeline never propagates an error to callers; broken LLM runs
//! collapse into a deterministic fallback decision.

pub mod features;
pub mod prompts;

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::application::pipeline::features::{SpecialistRole, lite_role_score, resolve_feature_pack};
use crate::domain::ports::LlmClient;
use crate::domain::review::{PmVerdict, RoleScore, SynthesisScore};
use crate::domain::types::{
    AgentContext, FeaturePack, OneShotRequest, Opportunity, OpportunityStage, OrderType,
    TradingMode,
};

#[derive(Debug, Clone)]
pub struct PipelineOptions<'a> {
    pub opportunity: &'a Opportunity,
    pub context: Option<&'a AgentContext>,
    pub trading_mode: TradingMode,
    pub model: &'a str,
    pub min_llm_confidence: u8,
    /// FULL runs the specialist stage through the LLM as well.
    pub full_mode: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineDecision {
    pub approve: bool,
    pub stage: OpportunityStage,
    pub score: f64,
    pub confidence: f64,
    pub cooldown_sec: u32,
    pub order_type: OrderType,
    pub reason: String,
    /// LLM calls consumed by this invocation, for the daily budget tally.
    pub llm_calls: u32,
    /// True when the deterministic fallback produced this decision.
    pub degraded: bool,
}

pub struct FineGrainedAgentPipeline {
    llm: Arc<dyn LlmClient>,
}

impl FineGrainedAgentPipeline {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self { llm }
    }

    /// Run the cascade. Always returns a decision.
    pub async fn run(&self, opts: PipelineOptions<'_>) -> PipelineDecision {
        let pack = resolve_feature_pack(opts.context, opts.opportunity);
        let mut llm_calls = 0u32;

        let specialists = if opts.full_mode {
            let mut out = Vec::with_capacity(3);
            for role in SpecialistRole::ALL {
                let fallback = lite_role_score(role, &pack);
                llm_calls += 1;
                match self
                    .ask(&opts, prompts::specialist(role, opts.opportunity, &pack))
                    .await
                {
                    Ok(text) => out.push(RoleScore::from_text(&text, &fallback)),
                    Err(e) => {
                        warn!(
                            "FineAgent [{}]: {} specialist unavailable, using lite score: {}",
                            opts.opportunity.market,
                            role.label(),
                            e
                        );
                        out.push(fallback);
                    }
                }
            }
            out
        } else {
            SpecialistRole::ALL
                .iter()
                .map(|role| lite_role_score(*role, &pack))
                .collect()
        };

        llm_calls += 1;
        let parsed_synthesis = match self
            .ask(
                &opts,
                prompts::synthesizer(opts.opportunity, &specialists, &pack),
            )
            .await
        {
            Ok(text) => SynthesisScore::from_text(&text),
            Err(e) => {
                warn!(
                    "FineAgent [{}]: synthesizer unavailable: {}",
                    opts.opportunity.market, e
                );
                None
            }
        };
        let synthesis_parsed = parsed_synthesis.is_some();
        let synthesis = parsed_synthesis.unwrap_or_else(|| synthesize_lite(&specialists));

        llm_calls += 1;
        let pm = match self
            .ask(
                &opts,
                prompts::portfolio_manager(opts.opportunity, &specialists, &synthesis),
            )
            .await
        {
            Ok(text) => PmVerdict::from_text(&text),
            Err(e) => {
                warn!(
                    "FineAgent [{}]: pm stage unavailable: {}",
                    opts.opportunity.market, e
                );
                None
            }
        };

        let decision = match pm {
            Some(pm) => {
                let approve = pm.approve
                    && pm.stage != OpportunityStage::RuleFail
                    && pm.confidence >= opts.min_llm_confidence as f64;
                let stage = if approve {
                    pm.stage
                } else {
                    OpportunityStage::RuleFail
                };
                PipelineDecision {
                    approve,
                    stage,
                    score: pm.score,
                    confidence: pm.confidence,
                    cooldown_sec: pm.cooldown_sec,
                    order_type: pm.order_type,
                    reason: pm.reason,
                    llm_calls,
                    degraded: false,
                }
            }
            None => fallback_decision(
                &pack,
                &synthesis,
                synthesis_parsed,
                opts.min_llm_confidence,
                llm_calls,
            ),
        };

        debug!(
            "FineAgent [{}]: stage={:?} approve={} score={:.0} conf={:.0} ({} llm calls)",
            opts.opportunity.market,
            decision.stage,
            decision.approve,
            decision.score,
            decision.confidence,
            decision.llm_calls
        );
        decision
    }

    async fn ask(&self, opts: &PipelineOptions<'_>, prompt: String) -> anyhow::Result<String> {
        self.llm
            .request_one_shot_text(OneShotRequest {
                model: opts.model.to_string(),
                trading_mode: opts.trading_mode,
                context: None,
                prompt,
            })
            .await
    }
}

fn synthesize_lite(specialists: &[RoleScore]) -> SynthesisScore {
    let n = specialists.len().max(1) as f64;
    let score = specialists.iter().map(|s| s.score).sum::<f64>() / n;
    let confidence = specialists
        .iter()
        .map(|s| s.confidence)
        .fold(f64::INFINITY, f64::min)
        .min(100.0)
        .max(0.0);
    SynthesisScore {
        score,
        confidence,
        reason: "specialist average".to_string(),
    }
}

/// Deterministic fallback for entirely broken LLM runs.
fn fallback_decision(
    pack: &FeaturePack,
    synthesis: &SynthesisScore,
    synthesis_parsed: bool,
    min_llm_confidence: u8,
    llm_calls: u32,
) -> PipelineDecision {
    let confidence = if synthesis_parsed {
        synthesis.confidence
    } else {
        50.0
    };
    let score = synthesis.score;
    let risk = &pack.execution_risk;

    let stage = if risk.chasing_risk >= 70.0 || risk.entry_gap_pct > 1.8 {
        OpportunityStage::RuleFail
    } else if score >= 68.0 && confidence >= min_llm_confidence as f64 {
        OpportunityStage::AutoPass
    } else if score >= 56.0 {
        OpportunityStage::Borderline
    } else {
        OpportunityStage::RuleFail
    };

    let approve = stage != OpportunityStage::RuleFail;
    PipelineDecision {
        approve,
        stage,
        score,
        confidence,
        cooldown_sec: 60,
        order_type: OrderType::Market,
        reason: format!(
            "fallback decision (synth {:.0}, chasing {:.0}, gap {:.2}%)",
            score, risk.chasing_risk, risk.entry_gap_pct
        ),
        llm_calls,
        degraded: true,
    }
}

//! Feature-pack resolution and the deterministic LITE specialist scores.

use crate::domain::review::RoleScore;
use crate::domain::types::{
    AgentContext, ExecutionRiskFeatures, FeaturePack, MicrostructureFeatures, OrderbookSummary,
    Opportunity, TechnicalFeatures,
};

fn clamp100(v: f64) -> f64 {
    v.clamp(0.0, 100.0)
}

/// Prefer the backend's feature pack; compute a fallback from the ranked
/// opportunity (and orderbook summary when available) otherwise.
pub fn resolve_feature_pack(context: Option<&AgentContext>, opp: &Opportunity) -> FeaturePack {
    if let Some(pack) = context.and_then(|c| c.feature_pack.clone()) {
        return pack;
    }

    let orderbook = context
        .and_then(|c| c.chart.orderbook.clone())
        .unwrap_or(OrderbookSummary {
            spread_pct: 1.0,
            imbalance: 0.5,
            top5_imbalance: 0.5,
        });

    let gap = opp.entry_gap_pct_1m.max(0.0);

    FeaturePack {
        technical: TechnicalFeatures {
            trend: clamp100(opp.recommended_entry_win_rate_1m),
            pullback: clamp100(100.0 - gap * 40.0),
            volatility: clamp100(50.0 + opp.expectancy_pct * 40.0),
            rr_score: clamp100(opp.risk_reward_1m * 40.0),
        },
        microstructure: MicrostructureFeatures {
            spread: orderbook.spread_pct,
            imbalance: orderbook.imbalance,
            top5_imbalance: orderbook.top5_imbalance,
        },
        execution_risk: ExecutionRiskFeatures {
            chasing_risk: clamp100(gap * 45.0),
            pending_fill_risk: clamp100(orderbook.spread_pct * 20.0 + gap * 10.0),
            entry_gap_pct: gap,
        },
    }
}

pub fn lite_technical_score(pack: &FeaturePack) -> f64 {
    let t = &pack.technical;
    clamp100(0.35 * t.trend + 0.20 * t.pullback + 0.15 * t.volatility + 0.30 * t.rr_score)
}

pub fn lite_microstructure_score(pack: &FeaturePack) -> f64 {
    let m = &pack.microstructure;
    clamp100(65.0 - 6.0 * m.spread + 18.0 * m.imbalance + 14.0 * m.top5_imbalance)
}

pub fn lite_execution_score(pack: &FeaturePack) -> f64 {
    let e = &pack.execution_risk;
    clamp100(100.0 - 0.55 * e.chasing_risk - 0.45 * e.pending_fill_risk)
}

/// Stronger packs carry more weight through the synthesizer/PM fallbacks.
pub fn lite_confidence(score: f64) -> f64 {
    clamp100(55.0 + score / 4.0)
}

pub fn lite_role_score(role: SpecialistRole, pack: &FeaturePack) -> RoleScore {
    let score = match role {
        SpecialistRole::Technical => lite_technical_score(pack),
        SpecialistRole::Microstructure => lite_microstructure_score(pack),
        SpecialistRole::ExecutionRisk => lite_execution_score(pack),
    };
    RoleScore {
        score,
        confidence: lite_confidence(score),
        reason: format!("deterministic {} score", role.label()),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpecialistRole {
    Technical,
    Microstructure,
    ExecutionRisk,
}

impl SpecialistRole {
    pub const ALL: [SpecialistRole; 3] = [
        SpecialistRole::Technical,
        SpecialistRole::Microstructure,
        SpecialistRole::ExecutionRisk,
    ];

    pub fn label(&self) -> &'static str {
        match self {
            SpecialistRole::Technical => "technical",
            SpecialistRole::Microstructure => "microstructure",
            SpecialistRole::ExecutionRisk => "execution-risk",
        }
    }
}

//! Prompt builders for the three-role cascade.
//!
//! Every prompt demands a strict single-object JSON reply; the tolerant
//! extraction in [`crate::domain::review`] copes with fenced blocks and
//! surrounding prose anyway.

use crate::application::pipeline::features::SpecialistRole;
use crate::domain::review::{RoleScore, SynthesisScore};
use crate::domain::types::{FeaturePack, Opportunity};

pub fn specialist(role: SpecialistRole, opp: &Opportunity, pack: &FeaturePack) -> String {
    let slice = match role {
        SpecialistRole::Technical => serde_json::to_string(&pack.technical).unwrap_or_default(),
        SpecialistRole::Microstructure => {
            serde_json::to_string(&pack.microstructure).unwrap_or_default()
        }
        SpecialistRole::ExecutionRisk => {
            serde_json::to_string(&pack.execution_risk).unwrap_or_default()
        }
    };
    format!(
        "You are the {role} specialist on a crypto scalping desk reviewing a \
         long entry in {market}.\n\
         Feature slice: {slice}\n\
         Score the entry from your specialty only.\n\
         Reply with exactly one JSON object: \
         {{\"score\": 0-100, \"confidence\": 0-100, \"reason\": \"<= 80 chars\"}}",
        role = role.label(),
        market = opp.market,
    )
}

pub fn synthesizer(opp: &Opportunity, specialists: &[RoleScore], pack: &FeaturePack) -> String {
    let summary = specialists
        .iter()
        .zip(SpecialistRole::ALL)
        .map(|(s, role)| {
            format!(
                "{}: score {:.0}, confidence {:.0} ({})",
                role.label(),
                s.score,
                s.confidence,
                s.reason
            )
        })
        .collect::<Vec<_>>()
        .join("; ");
    format!(
        "You synthesize three specialist reviews of a long entry in {market}.\n\
         Specialists: {summary}\n\
         Feature pack: {pack}\n\
         Weigh the specialists into one combined view.\n\
         Reply with exactly one JSON object: \
         {{\"score\": 0-100, \"confidence\": 0-100, \"reason\": \"<= 120 chars\"}}",
        market = opp.market,
        pack = serde_json::to_string(pack).unwrap_or_default(),
    )
}

pub fn portfolio_manager(
    opp: &Opportunity,
    specialists: &[RoleScore],
    synthesis: &SynthesisScore,
) -> String {
    let summary = specialists
        .iter()
        .zip(SpecialistRole::ALL)
        .map(|(s, role)| format!("{} {:.0}", role.label(), s.score))
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "You are the portfolio manager deciding on a long entry in {market} \
         (backend grade {grade:?}, score {score:.0}).\n\
         Specialist scores: {summary}. \
         Synthesis: score {sy_score:.0}, confidence {sy_conf:.0}, {sy_reason}.\n\
         Approve only setups you would fund. \
         Reply with exactly one JSON object: \
         {{\"approve\": bool, \"stage\": \"AUTO_PASS|BORDERLINE|RULE_FAIL\", \
         \"score\": 0-100, \"confidence\": 0-100, \"cooldownSec\": 30-300, \
         \"orderType\": \"MARKET|LIMIT\", \"reason\": \"<= 120 chars\"}}",
        market = opp.market,
        grade = opp.stage,
        score = opp.score,
        sy_score = synthesis.score,
        sy_conf = synthesis.confidence,
        sy_reason = synthesis.reason,
    )
}

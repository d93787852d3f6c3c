//! LLM reply parsing.
//!
//! Every reply is scanned for the first balanced `{…}` object (optionally
//! inside a ```json fenced block) and mapped into a tagged verdict type.
//! Each field has a typed range; unknown or missing fields collapse to the
//! documented default. Parsing never fails: a reply with no recoverable
//! object yields the conservative default verdict.

use serde_json::Value;

use crate::domain::types::{OpportunityStage, OrderType};

/// Extract the first balanced JSON object from free-form LLM text.
///
/// A fenced ```json block takes precedence over the surrounding text.
pub fn extract_json(text: &str) -> Option<Value> {
    if let Some(fenced) = fenced_block(text) {
        if let Some(v) = balanced_object(fenced) {
            return Some(v);
        }
    }
    balanced_object(text)
}

fn fenced_block(text: &str) -> Option<&str> {
    let start = text.find("```")?;
    let after = &text[start + 3..];
    let body_start = after.find('\n').map(|i| i + 1).unwrap_or(0);
    let body = &after[body_start..];
    let end = body.find("```")?;
    Some(&body[..end])
}

fn balanced_object(text: &str) -> Option<Value> {
    let bytes = text.as_bytes();
    let open = text.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (i, &b) in bytes.iter().enumerate().skip(open) {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    return serde_json::from_str(&text[open..=i]).ok();
                }
            }
            _ => {}
        }
    }
    None
}

fn field_f64(v: &Value, key: &str) -> Option<f64> {
    match v.get(key)? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn field_bool(v: &Value, key: &str) -> Option<bool> {
    match v.get(key)? {
        Value::Bool(b) => Some(*b),
        Value::String(s) => match s.trim().to_lowercase().as_str() {
            "true" | "yes" => Some(true),
            "false" | "no" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

fn field_str(v: &Value, key: &str) -> Option<String> {
    v.get(key)
        .and_then(Value::as_str)
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn truncate(s: String, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        s
    } else {
        s.chars().take(max_chars).collect()
    }
}

fn clamp_confidence(raw: Option<f64>) -> u8 {
    raw.unwrap_or(0.0).clamp(0.0, 100.0).round() as u8
}

fn clamp_score(raw: Option<f64>, default: f64) -> f64 {
    raw.unwrap_or(default).clamp(0.0, 100.0)
}

// ===== Entry review =====

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Low,
    Medium,
    High,
}

impl Severity {
    fn parse(s: Option<String>) -> Self {
        match s.as_deref().map(str::to_uppercase).as_deref() {
            Some("LOW") => Severity::Low,
            Some("HIGH") => Severity::High,
            _ => Severity::Medium,
        }
    }
}

/// Parsed verdict of the LLM entry review.
#[derive(Debug, Clone)]
pub struct EntryVerdict {
    pub approve: bool,
    pub confidence: u8,
    pub severity: Severity,
    pub reason: String,
    pub suggested_cooldown_sec: Option<u32>,
}

impl EntryVerdict {
    /// Conservative default: reject with zero confidence.
    pub fn rejected(reason: &str) -> Self {
        Self {
            approve: false,
            confidence: 0,
            severity: Severity::Medium,
            reason: reason.to_string(),
            suggested_cooldown_sec: None,
        }
    }

    pub fn from_text(raw: &str) -> Self {
        let Some(v) = extract_json(raw) else {
            return Self::rejected("unparseable reply");
        };
        Self {
            approve: field_bool(&v, "approve").unwrap_or(false),
            confidence: clamp_confidence(field_f64(&v, "confidence")),
            severity: Severity::parse(field_str(&v, "severity")),
            reason: truncate(
                field_str(&v, "reason").unwrap_or_else(|| "no reason given".to_string()),
                160,
            ),
            suggested_cooldown_sec: field_f64(&v, "suggestedCooldownSec")
                .filter(|s| *s >= 0.0)
                .map(|s| s.round() as u32),
        }
    }
}

// ===== Open-position review =====

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PositionAction {
    Hold,
    PartialTp,
    FullExit,
}

impl PositionAction {
    fn parse(s: Option<String>) -> Self {
        match s.as_deref().map(str::to_uppercase).as_deref() {
            Some("PARTIAL_TP") => PositionAction::PartialTp,
            Some("FULL_EXIT") => PositionAction::FullExit,
            _ => PositionAction::Hold,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PositionReview {
    pub action: PositionAction,
    pub confidence: u8,
    pub reason: String,
}

impl PositionReview {
    pub fn hold(reason: &str) -> Self {
        Self {
            action: PositionAction::Hold,
            confidence: 0,
            reason: reason.to_string(),
        }
    }

    pub fn from_text(raw: &str) -> Self {
        let Some(v) = extract_json(raw) else {
            return Self::hold("unparseable reply");
        };
        Self {
            action: PositionAction::parse(field_str(&v, "action")),
            confidence: clamp_confidence(field_f64(&v, "confidence")),
            reason: truncate(
                field_str(&v, "reason").unwrap_or_else(|| "no reason given".to_string()),
                160,
            ),
        }
    }
}

// ===== Fine-grained pipeline stages =====

/// Specialist output: `{score, confidence, reason ≤ 80 chars}`.
#[derive(Debug, Clone)]
pub struct RoleScore {
    pub score: f64,
    pub confidence: f64,
    pub reason: String,
}

impl RoleScore {
    /// Parse a specialist reply, falling back per-field to `fallback`.
    pub fn from_text(raw: &str, fallback: &RoleScore) -> Self {
        let Some(v) = extract_json(raw) else {
            return fallback.clone();
        };
        Self {
            score: clamp_score(field_f64(&v, "score"), fallback.score),
            confidence: clamp_score(field_f64(&v, "confidence"), fallback.confidence),
            reason: truncate(
                field_str(&v, "reason").unwrap_or_else(|| fallback.reason.clone()),
                80,
            ),
        }
    }
}

/// Synthesizer output: `{score, confidence, reason ≤ 120 chars}`.
#[derive(Debug, Clone)]
pub struct SynthesisScore {
    pub score: f64,
    pub confidence: f64,
    pub reason: String,
}

impl SynthesisScore {
    pub fn from_text(raw: &str) -> Option<Self> {
        let v = extract_json(raw)?;
        Some(Self {
            score: clamp_score(field_f64(&v, "score"), 50.0),
            confidence: clamp_score(field_f64(&v, "confidence"), 50.0),
            reason: truncate(
                field_str(&v, "reason").unwrap_or_else(|| "no reason given".to_string()),
                120,
            ),
        })
    }
}

/// PM output: approve/stage plus sizing hints, cooldown clamped to 30–300 s.
#[derive(Debug, Clone)]
pub struct PmVerdict {
    pub approve: bool,
    pub stage: OpportunityStage,
    pub score: f64,
    pub confidence: f64,
    pub cooldown_sec: u32,
    pub order_type: OrderType,
    pub reason: String,
}

impl PmVerdict {
    pub fn from_text(raw: &str) -> Option<Self> {
        let v = extract_json(raw)?;
        let stage = field_str(&v, "stage")
            .and_then(|s| OpportunityStage::parse(&s))
            .unwrap_or(OpportunityStage::Borderline);
        let order_type = match field_str(&v, "orderType").map(|s| s.to_uppercase()).as_deref() {
            Some("LIMIT") => OrderType::Limit,
            _ => OrderType::Market,
        };
        Some(Self {
            approve: field_bool(&v, "approve").unwrap_or(false),
            stage,
            score: clamp_score(field_f64(&v, "score"), 50.0),
            confidence: clamp_score(field_f64(&v, "confidence"), 0.0),
            cooldown_sec: field_f64(&v, "cooldownSec")
                .unwrap_or(60.0)
                .clamp(30.0, 300.0)
                .round() as u32,
            order_type,
            reason: truncate(
                field_str(&v, "reason").unwrap_or_else(|| "no reason given".to_string()),
                120,
            ),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_fenced_json_block() {
        let raw = "Here is my verdict:\n```json\n{\"approve\": true, \"confidence\": 71}\n```\nThanks.";
        let v = extract_json(raw).unwrap();
        assert_eq!(v["confidence"], 71);
    }

    #[test]
    fn extracts_first_balanced_object_from_prose() {
        let raw = "I think {\"approve\": false, \"reason\": \"weak {structure}\"} overall";
        let v = extract_json(raw).unwrap();
        assert_eq!(v["approve"], false);
        assert_eq!(v["reason"], "weak {structure}");
    }

    #[test]
    fn braces_inside_strings_do_not_break_balancing() {
        let raw = r#"{"reason": "gap } spike \" here", "approve": true}"#;
        let v = extract_json(raw).unwrap();
        assert_eq!(v["approve"], true);
    }

    #[test]
    fn garbage_yields_none() {
        assert!(extract_json("no json here").is_none());
        assert!(extract_json("{broken").is_none());
    }

    #[test]
    fn entry_verdict_defaults_on_unparseable_reply() {
        let v = EntryVerdict::from_text("sorry, I cannot help with that");
        assert!(!v.approve);
        assert_eq!(v.confidence, 0);
        assert_eq!(v.severity, Severity::Medium);
    }

    #[test]
    fn entry_verdict_clamps_confidence_and_reads_cooldown() {
        let v = EntryVerdict::from_text(
            r#"{"approve": true, "confidence": 140, "severity": "low", "suggestedCooldownSec": 75}"#,
        );
        assert!(v.approve);
        assert_eq!(v.confidence, 100);
        assert_eq!(v.severity, Severity::Low);
        assert_eq!(v.suggested_cooldown_sec, Some(75));
    }

    #[test]
    fn entry_verdict_accepts_stringly_typed_fields() {
        let v = EntryVerdict::from_text(r#"{"approve": "true", "confidence": "62"}"#);
        assert!(v.approve);
        assert_eq!(v.confidence, 62);
    }

    #[test]
    fn position_review_unknown_action_collapses_to_hold() {
        let r = PositionReview::from_text(r#"{"action": "DOUBLE_DOWN", "confidence": 90}"#);
        assert_eq!(r.action, PositionAction::Hold);
    }

    #[test]
    fn position_review_parses_full_exit() {
        let r = PositionReview::from_text(r#"{"action": "full_exit", "reason": "trend broke"}"#);
        assert_eq!(r.action, PositionAction::FullExit);
        assert_eq!(r.reason, "trend broke");
    }

    #[test]
    fn role_score_falls_back_per_field() {
        let fallback = RoleScore {
            score: 40.0,
            confidence: 55.0,
            reason: "lite".to_string(),
        };
        let parsed = RoleScore::from_text(r#"{"score": 80}"#, &fallback);
        assert_eq!(parsed.score, 80.0);
        assert_eq!(parsed.confidence, 55.0);
        assert_eq!(parsed.reason, "lite");
    }

    #[test]
    fn pm_verdict_clamps_cooldown_bounds() {
        let low = PmVerdict::from_text(r#"{"approve": true, "cooldownSec": 5}"#).unwrap();
        assert_eq!(low.cooldown_sec, 30);
        let high = PmVerdict::from_text(r#"{"approve": true, "cooldownSec": 9000}"#).unwrap();
        assert_eq!(high.cooldown_sec, 300);
    }

    #[test]
    fn pm_verdict_reason_truncated_to_120_chars() {
        let long = "x".repeat(300);
        let v = PmVerdict::from_text(&format!(r#"{{"approve": true, "reason": "{long}"}}"#)).unwrap();
        assert_eq!(v.reason.chars().count(), 120);
    }
}

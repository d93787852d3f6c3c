//! Daily LLM-call budget.
//!
//! The counter is keyed by the KST (Asia/Seoul) calendar date and rolls
//! over whenever the current date key differs from the stored one. The
//! soft cap is advisory: crossing it warns once per day, calls continue.

use chrono::{FixedOffset, TimeZone, Utc};

use crate::domain::types::LlmUsage;

const KST_OFFSET_SECS: i32 = 9 * 3600;

/// KST calendar date key (`YYYY-MM-DD`) for an epoch-ms timestamp.
pub fn kst_date_key(at_ms: i64) -> String {
    let kst = FixedOffset::east_opt(KST_OFFSET_SECS).expect("fixed KST offset is valid");
    match Utc.timestamp_millis_opt(at_ms).single() {
        Some(dt) => dt.with_timezone(&kst).format("%Y-%m-%d").to_string(),
        None => Utc::now().with_timezone(&kst).format("%Y-%m-%d").to_string(),
    }
}

#[derive(Debug, Clone)]
pub struct LlmBudget {
    usage: LlmUsage,
}

impl LlmBudget {
    pub fn new(now_ms: i64) -> Self {
        Self {
            usage: LlmUsage {
                date_key: kst_date_key(now_ms),
                used_today: 0,
                soft_cap_warned: false,
            },
        }
    }

    /// Reset the counter when the KST date changed. Returns true on a roll.
    pub fn roll_over(&mut self, now_ms: i64) -> bool {
        let key = kst_date_key(now_ms);
        if key == self.usage.date_key {
            return false;
        }
        self.usage = LlmUsage {
            date_key: key,
            used_today: 0,
            soft_cap_warned: false,
        };
        true
    }

    /// Record `calls` LLM requests. Returns true exactly once per day, when
    /// the soft cap is first crossed (0 disables the cap).
    pub fn note(&mut self, calls: u32, soft_cap: u32) -> bool {
        self.usage.used_today = self.usage.used_today.saturating_add(calls);
        if soft_cap > 0 && self.usage.used_today > soft_cap && !self.usage.soft_cap_warned {
            self.usage.soft_cap_warned = true;
            return true;
        }
        false
    }

    pub fn usage(&self) -> LlmUsage {
        self.usage.clone()
    }
}

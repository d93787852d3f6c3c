//! Market identifier handling.
//!
//! All identifiers have the normal form `"<QUOTE>-<BASE>"` in uppercase
//! (e.g. `KRW-BTC`). Every public entry point normalizes before use.

const FOCUSED_QUOTE: &str = "KRW";

/// Trim and uppercase a market identifier.
pub fn normalize_market(input: &str) -> String {
    input.trim().to_uppercase()
}

/// Normalize a focused-scalp market entry into `KRW-<BASE>` form.
///
/// Accepts a bare base symbol (`btc`) or a full identifier (`KRW-BTC`);
/// injects the `KRW-` prefix when absent. The base must be non-empty
/// `[A-Z0-9]+` after uppercasing. Invalid inputs yield `None`.
/// Idempotent: applying twice yields the same result.
pub fn normalize_focused_market(input: &str) -> Option<String> {
    let upper = input.trim().to_uppercase();
    if upper.is_empty() {
        return None;
    }

    let base = match upper.strip_prefix(&format!("{FOCUSED_QUOTE}-")) {
        Some(rest) => rest,
        None => upper.as_str(),
    };

    if base.is_empty() || !base.chars().all(|c| c.is_ascii_uppercase() || c.is_ascii_digit()) {
        return None;
    }

    Some(format!("{FOCUSED_QUOTE}-{base}"))
}

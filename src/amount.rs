//! Exact decimal amounts
//!
//! Fees travel as decimal strings in tags (`Operator-Fee`, `Script-Fee`,
//! `Payment-Quantity`) and quantities as winston strings on transactions.
//! Everything is parsed into `BigDecimal` so aggregate sums and percentage
//! splits never pick up floating point drift.

use std::str::FromStr;

use bigdecimal::BigDecimal;

/// A fee or quantity, denominated in winston unless stated otherwise.
pub type Amount = BigDecimal;

/// Winston per AR.
pub const WINSTON_PER_AR: u64 = 1_000_000_000_000;

/// Longest amount string accepted from a tag or quantity
pub const MAX_AMOUNT_LEN: usize = 64;

/// Parse a plain decimal string (`12`, `-0.5`, `.25`).
///
/// Exponent notation and strings longer than `MAX_AMOUNT_LEN` are rejected,
/// so a tag value can never expand into an unbounded number of digits.
pub fn parse_amount(raw: &str) -> Option<Amount> {
    let trimmed = raw.trim();
    if trimmed.len() > MAX_AMOUNT_LEN || !is_plain_decimal(trimmed) {
        return None;
    }
    BigDecimal::from_str(trimmed).ok()
}

fn is_plain_decimal(value: &str) -> bool {
    let unsigned = value.strip_prefix(['+', '-']).unwrap_or(value);
    let (integer, fraction) = unsigned.split_once('.').unwrap_or((unsigned, ""));
    let all_digits = |part: &str| part.bytes().all(|b| b.is_ascii_digit());
    !(integer.is_empty() && fraction.is_empty()) && all_digits(integer) && all_digits(fraction)
}

/// Parse a fee value, rejecting zero and negative values.
pub fn parse_positive_amount(raw: &str) -> Option<Amount> {
    parse_amount(raw).filter(|v| *v > zero())
}

/// Render an amount in plain normalized notation (`0.5`, `10`, `20000000000`).
pub fn format_amount(value: &Amount) -> String {
    value.normalized().to_plain_string()
}

/// Whole winston, truncating any fractional part. Used when building wire transfers.
pub fn whole_winston(value: &Amount) -> String {
    format_amount(&value.with_scale(0))
}

pub fn ar_to_winston(ar: &Amount) -> Amount {
    ar.clone() * BigDecimal::from(WINSTON_PER_AR)
}

pub fn winston_to_ar(winston: &Amount) -> Amount {
    (winston.clone() / BigDecimal::from(WINSTON_PER_AR)).normalized()
}

pub fn zero() -> Amount {
    BigDecimal::from(0u32)
}

/// Convert a configured fraction (e.g. `0.05`) into an exact decimal.
///
/// Goes through the shortest round-trip string so `0.05` stays `0.05`.
pub fn fraction_from_f64(value: f64) -> Option<Amount> {
    if !value.is_finite() {
        return None;
    }
    parse_amount(&value.to_string())
}

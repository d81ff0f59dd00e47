//! Storage quantity parsing
//!
//! Claims are only ever expanded, never shrunk, so the engine needs to order
//! two quantities. Kubernetes serializes the same capacity in several forms
//! (`1Gi`, `1024Mi`, `1073741824`), which rules out string comparison.

/// Parse a Kubernetes storage quantity into bytes.
///
/// Supports plain integers and decimals with binary (`Ki`..`Pi`) or decimal
/// (`k`..`P`) suffixes. Fractional bytes are rounded down. Returns `None` for
/// anything else, including negative values and exponent notation.
pub fn parse_quantity(input: &str) -> Option<u128> {
    let s = input.trim();
    let split = s
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(s.len());
    let (number, suffix) = s.split_at(split);

    let multiplier: u128 = match suffix {
        "" => 1,
        "k" => 1_000,
        "M" => 1_000_000,
        "G" => 1_000_000_000,
        "T" => 1_000_000_000_000,
        "P" => 1_000_000_000_000_000,
        "Ki" => 1 << 10,
        "Mi" => 1 << 20,
        "Gi" => 1 << 30,
        "Ti" => 1 << 40,
        "Pi" => 1 << 50,
        _ => return None,
    };

    let (whole, frac) = number.split_once('.').unwrap_or((number, ""));
    if whole.is_empty() && frac.is_empty() {
        return None;
    }
    if !frac.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }

    let whole: u128 = if whole.is_empty() { 0 } else { whole.parse().ok()? };
    let bytes = whole.checked_mul(multiplier)?;
    if frac.is_empty() {
        return Some(bytes);
    }

    let scale = 10u128.checked_pow(u32::try_from(frac.len()).ok()?)?;
    let frac: u128 = frac.parse().ok()?;
    bytes.checked_add(frac.checked_mul(multiplier)? / scale)
}

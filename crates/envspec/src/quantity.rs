//! Resource quantity parsing.
//!
//! Kubernetes accepts the same CPU or memory amount spelled several ways
//! ("1000m" vs "1", "2048Mi" vs "2Gi"). The diff engine must not treat
//! unit-format drift as a configuration change, so quantities are compared
//! numerically. Values are normalized to milli-units, which keeps "500m"
//! CPU exact without floating point error accumulating for byte sizes.

/// Parses a Kubernetes quantity string into milli-units.
///
/// Supports the decimal suffixes `m`, `k`, `M`, `G`, `T`, `P` and the
/// binary suffixes `Ki`, `Mi`, `Gi`, `Ti`, `Pi`. Returns `None` for
/// anything that does not look like a quantity.
pub fn parse(s: &str) -> Option<i128> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }

    let split = s
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(s.len());
    let (number, suffix) = s.split_at(split);

    // Factor expressed in milli-units
    let factor: i128 = match suffix {
        "" => 1_000,
        "m" => 1,
        "k" => 1_000_000,
        "M" => 1_000_000_000,
        "G" => 1_000_000_000_000,
        "T" => 1_000_000_000_000_000,
        "P" => 1_000_000_000_000_000_000,
        "Ki" => 1_024 * 1_000,
        "Mi" => 1_024 * 1_024 * 1_000,
        "Gi" => 1_024 * 1_024 * 1_024 * 1_000,
        "Ti" => 1_024 * 1_024 * 1_024 * 1_024 * 1_000,
        "Pi" => 1_024 * 1_024 * 1_024 * 1_024 * 1_024 * 1_000,
        _ => return None,
    };

    let value: f64 = number.parse().ok()?;
    #[allow(
        clippy::cast_possible_truncation,
        reason = "quantities are far below f64 integer precision limits"
    )]
    Some((value * factor as f64).round() as i128)
}

/// Returns true when both strings parse as quantities and denote the same
/// numeric amount, regardless of unit spelling.
pub fn equal(a: &str, b: &str) -> bool {
    match (parse(a), parse(b)) {
        (Some(x), Some(y)) => x == y,
        _ => false,
    }
}

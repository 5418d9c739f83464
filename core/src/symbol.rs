//! Pure symbol canonicalization.
//!
//! Every Bar write and Bar read goes through [`canonicalize`] first; there is
//! no fallback variant query, so a miscanonicalized write is simply
//! unreadable rather than silently wrong.

/// Canonical forms: `US.<TICKER>`, `HK.<5-digit>`, `SH.<ticker>`, `SZ.<ticker>`.
///
/// Mirrors `normalize_symbol()` from the original DMS core exactly: no dot
/// means classify-by-shape (short/leading-zero digit string -> HK, else
/// US); a dot splits into prefix/suffix, where an explicit `US`/`HK`/`SH`/`SZ`
/// *prefix* wins outright, and otherwise only the `HK`/`SS`/`SZ` *suffixes*
/// (yfinance-style) are recognized — there is no `.SH` suffix and no
/// digit-sniffing heuristic for mainland China symbols.
pub fn canonicalize(raw: &str) -> String {
    let raw = raw.trim();
    if raw.is_empty() {
        return String::new();
    }
    let s = raw.to_ascii_uppercase();

    let Some((prefix, suffix)) = s.split_once('.') else {
        if s.chars().all(|c| c.is_ascii_digit()) && (s.len() <= 5 || s.starts_with('0')) {
            return format!("HK.{}", pad_hk(&s));
        }
        return format!("US.{s}");
    };

    if is_exchange_code(prefix) {
        let code = if prefix == "HK" { pad_hk(suffix) } else { suffix.to_string() };
        return format!("{prefix}.{code}");
    }

    match suffix {
        "HK" => format!("HK.{}", pad_hk(prefix)),
        "SS" => format!("SH.{prefix}"),
        "SZ" => format!("SZ.{prefix}"),
        _ => s,
    }
}

fn is_exchange_code(s: &str) -> bool {
    matches!(s, "US" | "HK" | "SH" | "SZ")
}

/// Strip leading zeros (at least one digit survives) then pad to 5 digits,
/// matching `_pad_hk_code`'s `lstrip("0") or "0"` then `zfill(5)`.
fn pad_hk(code: &str) -> String {
    let trimmed = code.trim_start_matches('0');
    let trimmed = if trimmed.is_empty() { "0" } else { trimmed };
    format!("{trimmed:0>5}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_input_is_empty() {
        assert_eq!(canonicalize(""), "");
        assert_eq!(canonicalize("   "), "");
    }

    #[test]
    fn bare_us_ticker() {
        assert_eq!(canonicalize("aapl"), "US.AAPL");
    }

    /// Only `HK`/`SS`/`SZ` suffixes are recognized (yfinance-style); `.US`
    /// is not a suffix form in the ground truth and passes through unchanged.
    #[test]
    fn suffix_form() {
        assert_eq!(canonicalize("AAPL.US"), "AAPL.US");
        assert_eq!(canonicalize("700.HK"), "HK.00700");
        assert_eq!(canonicalize("600519.SS"), "SH.600519");
        assert_eq!(canonicalize("000001.SZ"), "SZ.000001");
    }

    #[test]
    fn prefix_form() {
        assert_eq!(canonicalize("hk.700"), "HK.00700");
        assert_eq!(canonicalize("SH.600000"), "SH.600000");
    }

    #[test]
    fn bare_hk_digits_zero_padded() {
        assert_eq!(canonicalize("700"), "HK.00700");
        assert_eq!(canonicalize("00700"), "HK.00700");
    }

    /// A bare digit string only maps to `HK.` when short or leading-zero;
    /// any other bare digit string is `US.` — there is no digit-sniffing
    /// heuristic that guesses SH vs SZ for mainland China symbols. SH/SZ are
    /// only reachable via an explicit prefix or `.SS`/`.SZ` suffix.
    #[test]
    fn bare_six_digit_non_leading_zero_is_us_not_cn() {
        assert_eq!(canonicalize("600519"), "US.600519");
        assert_eq!(canonicalize("000001"), "HK.00001");
    }

    #[test]
    fn idempotent_for_all_forms() {
        for raw in ["aapl", "AAPL.US", "hk.700", "700", "600519", "000001.SZ", "600519.SS", ""] {
            let once = canonicalize(raw);
            let twice = canonicalize(&once);
            assert_eq!(once, twice, "canon(canon({raw})) != canon({raw})");
        }
    }
}

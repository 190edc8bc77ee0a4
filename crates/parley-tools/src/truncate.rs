// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use tracing::warn;

/// Truncate an over-long tool result, appending an explicit marker so the
/// model knows additional output exists.  `max_chars == 0` disables
/// truncation.
pub fn truncate_tool_result(result: String, tool_name: &str, max_chars: usize) -> String {
    if max_chars == 0 || result.len() <= max_chars {
        return result;
    }
    let original_len = result.len();
    // Cut on a char boundary at or below the cap.
    let mut cut = max_chars;
    while !result.is_char_boundary(cut) {
        cut -= 1;
    }
    warn!(
        tool = tool_name,
        original_len,
        max_chars,
        "tool output truncated"
    );
    format!(
        "{}\n\n[OUTPUT TRUNCATED: Showing {} of {} characters from {}]",
        &result[..cut],
        group_digits(cut),
        group_digits(original_len),
        tool_name
    )
}

/// Format an integer with `,` thousands separators.
fn group_digits(n: usize) -> String {
    let digits = n.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(c);
    }
    out
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_results_pass_through() {
        let out = truncate_tool_result("short".into(), "t", 100);
        assert_eq!(out, "short");
    }

    #[test]
    fn zero_cap_disables_truncation() {
        let long = "x".repeat(1000);
        assert_eq!(truncate_tool_result(long.clone(), "t", 0), long);
    }

    #[test]
    fn long_results_get_marker() {
        let long = "x".repeat(200);
        let out = truncate_tool_result(long, "grep", 50);
        assert!(out.starts_with(&"x".repeat(50)));
        assert!(out.contains("[OUTPUT TRUNCATED: Showing 50 of 200 characters from grep]"));
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        // 'é' is two bytes; a cap landing mid-char must back off.
        let long = "é".repeat(100);
        let out = truncate_tool_result(long, "t", 33);
        assert!(out.contains("[OUTPUT TRUNCATED"));
    }

    #[test]
    fn group_digits_inserts_separators() {
        assert_eq!(group_digits(5), "5");
        assert_eq!(group_digits(1234), "1,234");
        assert_eq!(group_digits(40_000), "40,000");
        assert_eq!(group_digits(1_234_567), "1,234,567");
    }
}

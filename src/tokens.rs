//! Candidate identifier extraction from page text.
//!
//! Pure functions, no async — easily testable. Normalizes the page text,
//! scans for identifier-shaped substrings, and filters the high-frequency
//! uppercase noise (units, drawing metadata) that scanned drawings are
//! full of.

use std::collections::BTreeSet;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::normalize::normalize;

/// An identifier starts with an uppercase letter or digit and continues
/// with at least three more characters from {A-Z, 0-9, -, _, /}.
static TOKEN_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[A-Z0-9][A-Z0-9\-_/]{3,}").expect("token pattern is valid"));

/// Uppercase words that match the identifier pattern but never are one.
const BLACKLIST: &[&str] = &[
    "SCALE", "DATE", "PAGE", "SIZE", "ISO", "DIN", "MM", "KG", "LOT", "MODEL", "CODE", "FAX",
    "TEL",
];

/// Extract candidate identifier tokens from raw page text.
///
/// Candidates must contain at least one digit and not be blacklisted.
/// The result is deduplicated and sorted (lexicographic ASCII order).
pub fn extract_tokens(text: &str) -> Vec<String> {
    if text.is_empty() {
        return Vec::new();
    }
    let cleaned = normalize(text);
    let mut candidates = BTreeSet::new();
    for found in TOKEN_PATTERN.find_iter(&cleaned) {
        let token = found.as_str();
        if token.chars().any(|c| c.is_ascii_digit()) && !BLACKLIST.contains(&token) {
            candidates.insert(token.to_string());
        }
    }
    candidates.into_iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extracts_identifier_like_tokens() {
        let tokens = extract_tokens("図面番号 AB-1234 rev.2 部品 XY_99/B");
        assert_eq!(tokens, vec!["AB-1234".to_string(), "XY_99/B".to_string()]);
    }

    #[test]
    fn test_blacklist_excluded_even_near_digits() {
        let tokens = extract_tokens("SCALE 2024\n新規モデル: AB-1234");
        assert!(tokens.contains(&"AB-1234".to_string()));
        assert!(!tokens.contains(&"SCALE".to_string()));
        // "2024" alone is a valid token (digit start, length 4)
        assert!(tokens.contains(&"2024".to_string()));
    }

    #[test]
    fn test_requires_digit() {
        let tokens = extract_tokens("BRACKET STEEL ABCD AB-1234");
        assert_eq!(tokens, vec!["AB-1234".to_string()]);
    }

    #[test]
    fn test_sorted_and_deduplicated() {
        let text = "ZZ-99 AA-11 zz-99 ＡＡ－１１";
        let tokens = extract_tokens(text);
        assert_eq!(tokens, vec!["AA-11".to_string(), "ZZ-99".to_string()]);
        // deterministic: same input, same output
        assert_eq!(extract_tokens(text), tokens);
    }

    #[test]
    fn test_empty_text() {
        assert!(extract_tokens("").is_empty());
    }
}

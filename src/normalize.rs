//! Text canonicalization shared by token extraction and database indexing.
//!
//! Drawings and stock tables mix full-width and half-width forms of the
//! same identifier, so every comparison in the matcher goes through this
//! single normal form.

use unicode_normalization::UnicodeNormalization;

/// Canonicalize arbitrary text into a comparable form: NFKC fold
/// (full-width alphanumerics and punctuation collapse to standard forms),
/// uppercase, dash variants unified to ASCII hyphen, whitespace runs
/// (including U+3000) collapsed to one space, trimmed.
///
/// Total function; idempotent.
pub fn normalize(value: &str) -> String {
    let folded: String = value.nfkc().collect();
    let upper = folded.to_uppercase();
    // NFKC leaves en dash, em dash, and the minus sign alone
    let dashed: String = upper
        .chars()
        .map(|c| match c {
            '\u{2013}' | '\u{2014}' | '\u{2212}' => '-',
            other => other,
        })
        .collect();
    dashed.split_whitespace().collect::<Vec<_>>().join(" ")
}

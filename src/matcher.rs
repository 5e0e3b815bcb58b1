//! Database index construction and two-tier token matching.
//!
//! Tier 1 is an exact lookup on the normalized identifier column; tier 2
//! is a substring scan over the normalized specification column. An
//! identifier hit takes absolute precedence — the specification scan is
//! never attempted for a token that resolved by identifier, so a token
//! can never be counted by both routes.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::normalize::normalize;
use crate::table::ReferenceTable;

/// Which matching mode produced a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchKind {
    Identifier,
    Specification,
}

impl MatchKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MatchKind::Identifier => "identifier",
            MatchKind::Specification => "specification",
        }
    }
}

/// Result of matching one token against one reference-table row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchRecord {
    pub matched_type: MatchKind,
    pub matched_identifier: String,
    /// The row's stock/quantity cell, surfaced whenever non-empty.
    pub stock: Option<String>,
}

#[derive(Debug)]
struct IndexedRow {
    hinban: String,
    stock: Option<String>,
    spec_n: String,
}

/// Immutable per-task index over the reference table.
///
/// Built once before any matching begins; read-only thereafter, so it is
/// safe to share across page workers without locking.
#[derive(Debug)]
pub struct DatabaseIndex {
    rows: Vec<IndexedRow>,
    /// Normalized identifier → ordered row positions. One identifier may
    /// legitimately map to multiple rows (e.g. multiple stock lines).
    by_hinban: HashMap<String, Vec<usize>>,
    spec_enabled: bool,
}

impl DatabaseIndex {
    /// Build the index in O(rows). Rows whose identifier normalizes to the
    /// empty string are kept in the table but not indexed.
    pub fn build(table: &ReferenceTable) -> Self {
        let mut rows = Vec::with_capacity(table.rows.len());
        let mut by_hinban: HashMap<String, Vec<usize>> = HashMap::new();

        for (position, row) in table.rows.iter().enumerate() {
            let hinban_n = normalize(&row.hinban);
            if !hinban_n.is_empty() {
                by_hinban.entry(hinban_n).or_default().push(position);
            }
            let stock = match row.stock.trim() {
                "" => None,
                value => Some(value.to_string()),
            };
            rows.push(IndexedRow {
                hinban: row.hinban.clone(),
                stock,
                spec_n: normalize(&row.spec),
            });
        }

        Self {
            rows,
            by_hinban,
            spec_enabled: table.has_spec,
        }
    }

    /// Whether specification-substring matching is enabled (a `spec`
    /// column was present in the uploaded table).
    pub fn spec_enabled(&self) -> bool {
        self.spec_enabled
    }

    fn record(&self, position: usize, kind: MatchKind) -> MatchRecord {
        let row = &self.rows[position];
        MatchRecord {
            matched_type: kind,
            matched_identifier: row.hinban.clone(),
            stock: row.stock.clone(),
        }
    }
}

/// Match one token against the index, in strict precedence order.
///
/// 1. Exact identifier lookup — one record per bucket row, in row order;
///    returns immediately on a hit.
/// 2. Specification substring scan — one record per matching row, in row
///    order (only when the table had a `spec` column).
///
/// An empty result means the token is unmatched; the caller records it as
/// a failure.
pub fn match_token(token: &str, index: &DatabaseIndex) -> Vec<MatchRecord> {
    let token_n = normalize(token);
    if token_n.is_empty() {
        return Vec::new();
    }

    if let Some(positions) = index.by_hinban.get(&token_n) {
        return positions
            .iter()
            .map(|&pos| index.record(pos, MatchKind::Identifier))
            .collect();
    }

    if !index.spec_enabled {
        return Vec::new();
    }

    index
        .rows
        .iter()
        .enumerate()
        .filter(|(_, row)| !row.spec_n.is_empty() && row.spec_n.contains(&token_n))
        .map(|(pos, _)| index.record(pos, MatchKind::Specification))
        .collect()
}

//! Reference-table loading and results/failures persistence.
//!
//! Uploaded reference tables arrive as CSV in whatever encoding the
//! customer's spreadsheet tool produced — UTF-8 with or without BOM, or
//! Shift_JIS (cp932). Generated tables are written back with a UTF-8 BOM
//! so the same tools read East-Asian text correctly.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::PipelineError;
use crate::matcher::MatchKind;

const UTF8_BOM: &[u8] = &[0xEF, 0xBB, 0xBF];

/// One row of the uploaded reference table, reduced to the columns the
/// matcher cares about.
#[derive(Debug, Clone)]
pub struct ReferenceRow {
    pub hinban: String,
    pub spec: String,
    pub stock: String,
}

/// The uploaded reference table. `has_spec` records whether a
/// specification column was present at all; substring matching is only
/// enabled when it was.
#[derive(Debug, Clone)]
pub struct ReferenceTable {
    pub rows: Vec<ReferenceRow>,
    pub has_spec: bool,
    pub has_stock: bool,
}

/// A persisted match row: MatchRecord joined with its origin.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultRow {
    pub document: String,
    pub page: usize,
    pub token: String,
    pub matched_type: MatchKind,
    pub matched_identifier: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stock: Option<String>,
}

/// A token no matching mode could place.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureRow {
    pub document: String,
    pub page: usize,
    pub token: String,
}

/// Decode reference-table bytes, trying encodings in fixed order:
/// UTF-8 with BOM, plain UTF-8, Shift_JIS.
fn decode_table_bytes(data: &[u8]) -> Result<String, PipelineError> {
    let body = data.strip_prefix(UTF8_BOM).unwrap_or(data);
    if let Ok(text) = std::str::from_utf8(body) {
        return Ok(text.to_string());
    }
    let (decoded, _, had_errors) = encoding_rs::SHIFT_JIS.decode(data);
    if !had_errors {
        return Ok(decoded.into_owned());
    }
    Err(PipelineError::Decode)
}

/// Parse uploaded reference-table bytes into a [`ReferenceTable`].
///
/// The identifier column `hinban` is required (SchemaError otherwise).
/// `spec` is optional — specification matching is simply disabled without
/// it. The stock column is `zaiko`, falling back to `kidou`. Header
/// matching is case-insensitive and trimmed; absent cells become empty
/// strings.
pub fn load_reference_table(data: &[u8]) -> Result<ReferenceTable, PipelineError> {
    let text = decode_table_bytes(data)?;

    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .has_headers(true)
        .from_reader(text.as_bytes());

    let headers: Vec<String> = reader
        .headers()?
        .iter()
        .map(|h| h.trim().to_lowercase())
        .collect();

    let column = |name: &str| headers.iter().position(|h| h == name);

    let hinban_col = column("hinban").ok_or_else(|| PipelineError::Schema("hinban".into()))?;
    let spec_col = column("spec");
    let stock_col = column("zaiko").or_else(|| column("kidou"));

    let cell = |record: &csv::StringRecord, idx: Option<usize>| -> String {
        idx.and_then(|i| record.get(i))
            .unwrap_or_default()
            .to_string()
    };

    let mut rows = Vec::new();
    for result in reader.records() {
        let record = result?;
        rows.push(ReferenceRow {
            hinban: cell(&record, Some(hinban_col)),
            spec: cell(&record, spec_col),
            stock: cell(&record, stock_col),
        });
    }

    Ok(ReferenceTable {
        rows,
        has_spec: spec_col.is_some(),
        has_stock: stock_col.is_some(),
    })
}

fn write_csv_with_bom(path: &Path, header: &[&str], records: Vec<Vec<String>>) -> Result<(), PipelineError> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer.write_record(header)?;
    for record in records {
        writer.write_record(&record)?;
    }
    let body = writer
        .into_inner()
        .map_err(|e| PipelineError::Io(e.into_error()))?;

    let mut bytes = Vec::with_capacity(UTF8_BOM.len() + body.len());
    bytes.extend_from_slice(UTF8_BOM);
    bytes.extend_from_slice(&body);
    fs::write(path, bytes)?;
    Ok(())
}

/// Persist the results table (sorted by the caller) with a UTF-8 BOM.
pub fn write_results_csv(path: &Path, rows: &[ResultRow]) -> Result<(), PipelineError> {
    let records = rows
        .iter()
        .map(|r| {
            vec![
                r.document.clone(),
                r.page.to_string(),
                r.token.clone(),
                r.matched_type.as_str().to_string(),
                r.matched_identifier.clone(),
                r.stock.clone().unwrap_or_default(),
            ]
        })
        .collect();
    write_csv_with_bom(
        path,
        &["document", "page", "token", "matched_type", "matched_identifier", "stock"],
        records,
    )
}

/// Persist the failures table (sorted by the caller) with a UTF-8 BOM.
pub fn write_failures_csv(path: &Path, rows: &[FailureRow]) -> Result<(), PipelineError> {
    let records = rows
        .iter()
        .map(|r| vec![r.document.clone(), r.page.to_string(), r.token.clone()])
        .collect();
    write_csv_with_bom(path, &["document", "page", "token"], records)
}

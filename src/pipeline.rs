//! Per-task background processing: reference table → index, PDFs → page
//! texts → tokens → match/failure rows → persisted tables.
//!
//! Runs on one detached worker thread per task. Any fatal error sets the
//! task's terminal error state; an errored task exposes no partial
//! results.

use std::fs;

use tracing::{error, info};

use crate::config::Config;
use crate::error::PipelineError;
use crate::extract;
use crate::matcher::{match_token, DatabaseIndex, MatchKind};
use crate::ocr::{EngineRegistry, OcrBackend};
use crate::table::{self, FailureRow, ResultRow};
use crate::task::{self, SharedTask, TaskStatus};
use crate::tokens::extract_tokens;

/// One uploaded PDF, kept in memory until persisted into the task dir.
pub struct PdfEntry {
    pub name: String,
    pub data: Vec<u8>,
}

/// Entry point for the task worker thread.
pub fn run_task(
    task: SharedTask,
    task_id: &str,
    config: &Config,
    db_bytes: Vec<u8>,
    pdfs: Vec<PdfEntry>,
    backend: OcrBackend,
) {
    if let Err(err) = process(&task, task_id, config, db_bytes, pdfs, backend) {
        error!("task {} failed: {}", task_id, err);
        task.write().unwrap().fail(err.to_string());
    }
}

fn process(
    task: &SharedTask,
    task_id: &str,
    config: &Config,
    db_bytes: Vec<u8>,
    pdfs: Vec<PdfEntry>,
    backend: OcrBackend,
) -> Result<(), PipelineError> {
    task.write().unwrap().backend_requested = Some(backend);

    let task_dir = task::init_task_storage(&config.storage_root, task_id)?;

    // Index construction happens before any matching begins; the index is
    // read-only for the rest of the task.
    let table = table::load_reference_table(&db_bytes)?;
    let index = DatabaseIndex::build(&table);
    fs::write(task_dir.join("database.csv"), &db_bytes)?;

    let registry = EngineRegistry::from_config(&config.ocr);

    let mut documents: Vec<(String, Vec<String>)> = Vec::new();
    for entry in &pdfs {
        let pdf_path = task_dir.join(&entry.name);
        fs::write(&pdf_path, &entry.data)?;
        let (texts, provenance) =
            extract::extract_pdf_text(&pdf_path, backend, &registry, &config.ocr)?;
        {
            let mut state = task.write().unwrap();
            state.backend_used = Some(provenance.label().to_string());
            state.pages += texts.len();
        }
        documents.push((entry.name.clone(), texts));
    }

    task.write().unwrap().status = TaskStatus::Processing;
    let total_pages = task.read().unwrap().pages;

    let mut results: Vec<ResultRow> = Vec::new();
    let mut failures: Vec<FailureRow> = Vec::new();
    let mut processed_pages = 0usize;

    for (document, pages) in &documents {
        for (page_idx, page_text) in pages.iter().enumerate() {
            let page = page_idx + 1;
            let tokens = extract_tokens(page_text);
            task.write().unwrap().totals.tokens += tokens.len() as u64;

            for token in tokens {
                let matches = match_token(&token, &index);
                if matches.is_empty() {
                    failures.push(FailureRow {
                        document: document.clone(),
                        page,
                        token: token.clone(),
                    });
                    task.write().unwrap().totals.failures += 1;
                    continue;
                }
                for matched in matches {
                    {
                        let mut state = task.write().unwrap();
                        match matched.matched_type {
                            MatchKind::Identifier => state.totals.identifier_hits += 1,
                            MatchKind::Specification => state.totals.specification_hits += 1,
                        }
                    }
                    results.push(ResultRow {
                        document: document.clone(),
                        page,
                        token: token.clone(),
                        matched_type: matched.matched_type,
                        matched_identifier: matched.matched_identifier,
                        stock: matched.stock,
                    });
                }
            }

            processed_pages += 1;
            task.write().unwrap().progress = task::to_progress(total_pages, processed_pages);
        }
    }

    // Deterministic output order is a contract for downstream consumers,
    // not an artifact of processing order.
    results.sort_by(|a, b| {
        (&a.document, a.page, a.matched_type).cmp(&(&b.document, b.page, b.matched_type))
    });
    failures.sort_by(|a, b| (&a.document, a.page).cmp(&(&b.document, b.page)));

    let results_path = task_dir.join("results.csv");
    table::write_results_csv(&results_path, &results)?;
    let failures_path = task_dir.join("failure.csv");
    table::write_failures_csv(&failures_path, &failures)?;

    info!(
        "task {} completed: {} results, {} failures over {} pages",
        task_id,
        results.len(),
        failures.len(),
        total_pages
    );

    let mut state = task.write().unwrap();
    state.results = results;
    state.failures = failures;
    state.results_path = Some(results_path);
    state.failures_path = Some(failures_path);
    state.progress = 100;
    state.status = TaskStatus::Completed;
    Ok(())
}

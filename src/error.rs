//! Error taxonomy for the matching pipeline.
//!
//! Fatal variants terminate a task and become its terminal error message.
//! Transient engine errors never appear here — they are retried and, once
//! exhausted, absorbed by the OCR fallback chain (see `ocr`).

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    /// Reference table is missing a required column.
    #[error("reference table is missing required column `{0}`")]
    Schema(String),

    /// Reference table bytes could not be decoded under any supported encoding.
    #[error("could not decode reference table (tried UTF-8 with BOM, UTF-8, Shift_JIS)")]
    Decode,

    /// PDF text/OCR extraction failed irrecoverably.
    #[error("text extraction failed: {0}")]
    Extraction(String),

    /// Requested OCR backend name is not recognized. Rejected at the API
    /// boundary; never reaches a running task.
    #[error("unsupported OCR backend: {0}")]
    UnsupportedBackend(String),

    #[error(transparent)]
    Csv(#[from] csv::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Errors raised by a single OCR engine call.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The engine is missing required configuration (endpoint, mode, CLI
    /// path). Triggers fallback without any attempt being made.
    #[error("engine not configured: {0}")]
    Unconfigured(String),

    /// Network/timeout/malformed-response condition. Retried with backoff
    /// up to the configured attempt ceiling.
    #[error("{0}")]
    Transient(String),

    /// Unrecoverable engine failure. Never retried.
    #[error("{0}")]
    Fatal(String),
}

impl EngineError {
    pub fn is_transient(&self) -> bool {
        matches!(self, EngineError::Transient(_))
    }
}

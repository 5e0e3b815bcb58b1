//! Local fallback OCR engines (RapidOCR / PaddleOCR) invoked as CLI
//! subprocesses.
//!
//! These are the guaranteed-available end of the fallback chain, so their
//! failures are [`EngineError::Fatal`] — there is nothing further to fall
//! back to and retrying a local inference run buys nothing.

use std::io::Write;
use std::process::Command;

use super::PageEngine;
use crate::config::OcrConfig;
use crate::error::EngineError;

pub struct LocalCliEngine {
    name: &'static str,
    command: Vec<String>,
}

impl LocalCliEngine {
    pub fn rapidocr(cfg: &OcrConfig) -> Self {
        Self::new("rapidocr", &cfg.rapidocr_cmd)
    }

    pub fn paddleocr(cfg: &OcrConfig) -> Self {
        Self::new("paddleocr", &cfg.paddleocr_cmd)
    }

    /// `command` is split on whitespace; the page image path is appended
    /// as the final argument. Recognized text is expected on stdout.
    fn new(name: &'static str, command: &str) -> Self {
        Self {
            name,
            command: command.split_whitespace().map(String::from).collect(),
        }
    }
}

impl PageEngine for LocalCliEngine {
    fn name(&self) -> &'static str {
        self.name
    }

    fn recognize(&self, page_png: &[u8]) -> Result<String, EngineError> {
        let program = self
            .command
            .first()
            .ok_or_else(|| EngineError::Fatal(format!("{} command is empty", self.name)))?;

        let mut temp = tempfile::Builder::new()
            .prefix("ocr-page-")
            .suffix(".png")
            .tempfile()
            .map_err(|e| EngineError::Fatal(format!("failed to create temp image: {}", e)))?;
        temp.write_all(page_png)
            .map_err(|e| EngineError::Fatal(format!("failed to write temp image: {}", e)))?;
        temp.flush()
            .map_err(|e| EngineError::Fatal(format!("failed to flush temp image: {}", e)))?;

        let output = Command::new(program)
            .args(&self.command[1..])
            .arg(temp.path())
            .output()
            .map_err(|e| {
                EngineError::Fatal(format!("{} is not available ({}): {}", self.name, program, e))
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(EngineError::Fatal(format!(
                "{} exited with {}: {}",
                self.name,
                output.status,
                stderr.trim()
            )));
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_binary_is_fatal() {
        let engine = LocalCliEngine::new("rapidocr", "definitely-not-installed-ocr-binary");
        let err = engine.recognize(b"not a real png").unwrap_err();
        assert!(matches!(err, EngineError::Fatal(_)));
    }

    #[test]
    fn test_command_splitting_keeps_flags() {
        let engine = LocalCliEngine::new("paddleocr", "paddleocr ocr --lang japan");
        assert_eq!(engine.command, vec!["paddleocr", "ocr", "--lang", "japan"]);
    }
}

//! Environment-driven configuration, parsed once at startup.
//!
//! Invalid values log a warning and fall back to defaults rather than
//! aborting — a misconfigured primary OCR engine must degrade to the
//! fallback chain, not take the server down.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

use crate::ocr::OcrBackend;

/// Top-level service configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Root directory for per-task storage.
    pub storage_root: PathBuf,
    /// Backend used when an upload carries no selector.
    pub default_backend: OcrBackend,
    pub ocr: OcrConfig,
}

/// OCR pipeline knobs.
#[derive(Debug, Clone)]
pub struct OcrConfig {
    /// Rasterization resolution for scanned pages.
    pub dpi: u32,
    pub yomitoku: YomitokuConfig,
    /// Local fallback engine invocations (the page image path is appended).
    pub rapidocr_cmd: String,
    pub paddleocr_cmd: String,
}

/// Primary (YomiToku) engine configuration. `mode` selects REST or CLI
/// invocation; leaving it unset marks the engine unconfigured, which the
/// orchestrator treats as an immediate fallback trigger.
#[derive(Debug, Clone)]
pub struct YomitokuConfig {
    pub mode: Option<String>,
    pub base_url: Option<String>,
    pub api_key: Option<String>,
    pub cli_path: Option<String>,
    pub timeout: Duration,
    pub max_workers: usize,
    pub max_retries: u32,
    pub retry_base_delay: Duration,
    pub retry_multiplier: f64,
}

impl Default for YomitokuConfig {
    fn default() -> Self {
        Self {
            mode: None,
            base_url: None,
            api_key: None,
            cli_path: None,
            timeout: Duration::from_secs(60),
            max_workers: 4,
            max_retries: 3,
            retry_base_delay: Duration::from_secs(1),
            retry_multiplier: 2.0,
        }
    }
}

impl Default for OcrConfig {
    fn default() -> Self {
        Self {
            dpi: 350,
            yomitoku: YomitokuConfig::default(),
            rapidocr_cmd: "rapidocr".to_string(),
            paddleocr_cmd: "paddleocr".to_string(),
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        let default_backend = match env_trimmed("OCR_BACKEND_DEFAULT") {
            Some(name) => OcrBackend::from_str(&name).unwrap_or_else(|| {
                warn!("invalid OCR_BACKEND_DEFAULT={}, falling back to yomitoku", name);
                OcrBackend::Yomitoku
            }),
            None => OcrBackend::Yomitoku,
        };

        let yomitoku = YomitokuConfig {
            mode: env_trimmed("YOMITOKU_MODE").map(|m| m.to_lowercase()),
            base_url: env_trimmed("YOMITOKU_BASE_URL"),
            api_key: env_trimmed("YOMITOKU_API_KEY"),
            cli_path: env_trimmed("YOMITOKU_CLI_PATH"),
            timeout: Duration::from_secs(env_parsed("YOMITOKU_TIMEOUT", 60u64)),
            max_workers: env_parsed("YOMITOKU_MAX_WORKERS", 4usize).max(1),
            max_retries: env_parsed("YOMITOKU_MAX_RETRIES", 3u32).max(1),
            retry_base_delay: Duration::from_secs_f64(
                env_parsed("YOMITOKU_RETRY_BASE_DELAY", 1.0f64).max(0.0),
            ),
            retry_multiplier: env_parsed("YOMITOKU_RETRY_MULTIPLIER", 2.0f64).max(1.0),
        };

        Self {
            storage_root: PathBuf::from(
                env_trimmed("STORAGE_ROOT").unwrap_or_else(|| "storage".to_string()),
            ),
            default_backend,
            ocr: OcrConfig {
                dpi: env_parsed("OCR_DPI", 350u32).max(72),
                yomitoku,
                rapidocr_cmd: env_trimmed("RAPIDOCR_CMD").unwrap_or_else(|| "rapidocr".to_string()),
                paddleocr_cmd: env_trimmed("PADDLEOCR_CMD")
                    .unwrap_or_else(|| "paddleocr".to_string()),
            },
        }
    }
}

fn env_trimmed(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_parsed<T: FromStr + Copy + std::fmt::Display>(name: &str, default: T) -> T {
    match env_trimmed(name) {
        Some(raw) => raw.parse().unwrap_or_else(|_| {
            warn!("invalid {}={}, using default {}", name, raw, default);
            default
        }),
        None => default,
    }
}

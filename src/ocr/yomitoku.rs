//! YomiToku primary OCR engine client (REST sidecar or CLI invocation).
//!
//! All network/subprocess conditions — timeouts, non-2xx responses,
//! malformed payloads, missing binaries — surface as
//! [`EngineError::Transient`] so the orchestrator's retry policy and
//! fallback chain handle them uniformly.

use std::io::{Read, Write};
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use serde::Deserialize;
use tracing::debug;

use super::PageEngine;
use crate::config::YomitokuConfig;
use crate::error::EngineError;

pub struct YomitokuEngine {
    mode: Mode,
    timeout: Duration,
}

enum Mode {
    Rest {
        client: reqwest::blocking::Client,
        base_url: String,
        api_key: Option<String>,
    },
    Cli {
        path: String,
    },
}

/// YomiToku response body: either per-page entries or a flat `text`.
#[derive(Debug, Deserialize)]
struct YomitokuPayload {
    #[serde(default)]
    pages: Option<Vec<YomitokuPage>>,
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct YomitokuPage {
    #[serde(default)]
    text: String,
}

impl YomitokuEngine {
    /// Build the engine from configuration. Missing mode/endpoint/CLI path
    /// yields [`EngineError::Unconfigured`], which the orchestrator maps
    /// to an immediate fallback transition.
    pub fn from_config(cfg: &YomitokuConfig) -> Result<Self, EngineError> {
        let mode = match cfg.mode.as_deref() {
            None => return Err(EngineError::Unconfigured("YOMITOKU_MODE is not set".into())),
            Some("rest") => {
                let base_url = cfg
                    .base_url
                    .clone()
                    .ok_or_else(|| EngineError::Unconfigured("YOMITOKU_BASE_URL is not set".into()))?;
                let client = reqwest::blocking::Client::builder()
                    .timeout(cfg.timeout)
                    .build()
                    .map_err(|e| EngineError::Fatal(format!("failed to build HTTP client: {}", e)))?;
                Mode::Rest {
                    client,
                    base_url: base_url.trim_end_matches('/').to_string(),
                    api_key: cfg.api_key.clone(),
                }
            }
            Some("cli") => {
                let path = cfg
                    .cli_path
                    .clone()
                    .ok_or_else(|| EngineError::Unconfigured("YOMITOKU_CLI_PATH is not set".into()))?;
                Mode::Cli { path }
            }
            Some(other) => {
                return Err(EngineError::Unconfigured(format!(
                    "unsupported YOMITOKU_MODE: {}",
                    other
                )))
            }
        };
        Ok(Self { mode, timeout: cfg.timeout })
    }

    fn recognize_rest(
        &self,
        client: &reqwest::blocking::Client,
        base_url: &str,
        api_key: Option<&str>,
        page_png: &[u8],
    ) -> Result<String, EngineError> {
        use reqwest::blocking::multipart::{Form, Part};

        let part = Part::bytes(page_png.to_vec())
            .file_name("page.png")
            .mime_str("image/png")
            .map_err(|e| EngineError::Fatal(format!("failed to build multipart body: {}", e)))?;
        let form = Form::new().part("file", part);

        let mut request = client.post(format!("{}/v1/ocr", base_url)).multipart(form);
        if let Some(key) = api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .map_err(|e| EngineError::Transient(format!("yomitoku REST request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(EngineError::Transient(format!(
                "yomitoku REST returned status {}",
                status
            )));
        }

        let payload: YomitokuPayload = response
            .json()
            .map_err(|e| EngineError::Transient(format!("yomitoku REST response was not JSON: {}", e)))?;
        parse_payload(payload)
    }

    fn recognize_cli(&self, cli_path: &str, page_png: &[u8]) -> Result<String, EngineError> {
        let mut temp = tempfile::Builder::new()
            .prefix("yomitoku-page-")
            .suffix(".png")
            .tempfile()
            .map_err(|e| EngineError::Fatal(format!("failed to create temp image: {}", e)))?;
        temp.write_all(page_png)
            .map_err(|e| EngineError::Fatal(format!("failed to write temp image: {}", e)))?;
        temp.flush()
            .map_err(|e| EngineError::Fatal(format!("failed to flush temp image: {}", e)))?;

        let mut child = Command::new(cli_path)
            .arg("--image")
            .arg(temp.path())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| EngineError::Transient(format!("yomitoku CLI not available ({}): {}", cli_path, e)))?;

        // Drain both pipes on their own threads while polling for exit: a
        // dense page produces more output than the OS pipe buffer holds,
        // and a full pipe blocks the child from ever exiting.
        let stdout_reader = child.stdout.take().map(drain_pipe);
        let stderr_reader = child.stderr.take().map(drain_pipe);

        let deadline = Instant::now() + self.timeout;
        let status = loop {
            match child.try_wait() {
                Ok(Some(status)) => break status,
                Ok(None) => {
                    if Instant::now() >= deadline {
                        let _ = child.kill();
                        let _ = child.wait();
                        return Err(EngineError::Transient(format!(
                            "yomitoku CLI timed out after {:?}",
                            self.timeout
                        )));
                    }
                    std::thread::sleep(Duration::from_millis(50));
                }
                Err(e) => {
                    return Err(EngineError::Fatal(format!("failed to wait for yomitoku CLI: {}", e)))
                }
            }
        };

        let stdout = join_pipe(stdout_reader);
        let stderr = join_pipe(stderr_reader);
        if !status.success() {
            return Err(EngineError::Transient(format!(
                "yomitoku CLI exited with {}: {}",
                status,
                stderr.trim()
            )));
        }
        let stdout = stdout.trim();
        if stdout.is_empty() {
            return Err(EngineError::Transient("yomitoku CLI produced no output".into()));
        }
        debug!("yomitoku CLI produced {} bytes", stdout.len());
        let payload: YomitokuPayload = serde_json::from_str(stdout).map_err(|e| {
            EngineError::Transient(format!("yomitoku CLI output was not JSON: {}", e))
        })?;
        parse_payload(payload)
    }
}

fn drain_pipe<R: Read + Send + 'static>(mut reader: R) -> std::thread::JoinHandle<String> {
    std::thread::spawn(move || {
        let mut buffer = String::new();
        let _ = reader.read_to_string(&mut buffer);
        buffer
    })
}

fn join_pipe(handle: Option<std::thread::JoinHandle<String>>) -> String {
    handle.and_then(|h| h.join().ok()).unwrap_or_default()
}

fn parse_payload(payload: YomitokuPayload) -> Result<String, EngineError> {
    if let Some(pages) = payload.pages {
        if !pages.is_empty() {
            return Ok(pages
                .into_iter()
                .map(|p| p.text)
                .collect::<Vec<_>>()
                .join("\n"));
        }
    }
    payload.text.ok_or_else(|| {
        EngineError::Transient("yomitoku response contained neither `pages` nor `text`".into())
    })
}

impl PageEngine for YomitokuEngine {
    fn name(&self) -> &'static str {
        "yomitoku"
    }

    fn recognize(&self, page_png: &[u8]) -> Result<String, EngineError> {
        match &self.mode {
            Mode::Rest { client, base_url, api_key } => {
                self.recognize_rest(client, base_url, api_key.as_deref(), page_png)
            }
            Mode::Cli { path } => self.recognize_cli(path, page_png),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unconfigured_without_mode() {
        let cfg = YomitokuConfig::default();
        assert!(matches!(
            YomitokuEngine::from_config(&cfg),
            Err(EngineError::Unconfigured(_))
        ));
    }

    #[test]
    fn test_rest_mode_requires_base_url() {
        let cfg = YomitokuConfig {
            mode: Some("rest".into()),
            ..YomitokuConfig::default()
        };
        assert!(matches!(
            YomitokuEngine::from_config(&cfg),
            Err(EngineError::Unconfigured(_))
        ));
    }

    #[test]
    fn test_unknown_mode_rejected() {
        let cfg = YomitokuConfig {
            mode: Some("grpc".into()),
            ..YomitokuConfig::default()
        };
        assert!(matches!(
            YomitokuEngine::from_config(&cfg),
            Err(EngineError::Unconfigured(_))
        ));
    }

    #[test]
    fn test_payload_prefers_pages() {
        let payload: YomitokuPayload =
            serde_json::from_str(r#"{"pages":[{"text":"a"},{"text":"b"}],"text":"ignored"}"#)
                .unwrap();
        assert_eq!(parse_payload(payload).unwrap(), "a\nb");
    }

    #[test]
    fn test_payload_falls_back_to_text() {
        let payload: YomitokuPayload = serde_json::from_str(r#"{"pages":[],"text":"flat"}"#).unwrap();
        assert_eq!(parse_payload(payload).unwrap(), "flat");
    }

    #[cfg(unix)]
    #[test]
    fn test_cli_output_larger_than_pipe_buffer_is_drained() {
        use std::os::unix::fs::PermissionsExt;

        // 4000 * 32 = 128_000 chars of text, roughly twice the Linux pipe
        // buffer. The engine must keep draining stdout while the child
        // runs or the child blocks on write and never exits.
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("fake-yomitoku.sh");
        std::fs::write(
            &script,
            concat!(
                "#!/bin/sh\n",
                "printf '{\"text\":\"'\n",
                "i=0\n",
                "while [ $i -lt 4000 ]; do\n",
                "    printf 'abcdefghijklmnopqrstuvwxyz012345'\n",
                "    i=$((i+1))\n",
                "done\n",
                "printf '\"}'\n",
            ),
        )
        .unwrap();
        let mut perms = std::fs::metadata(&script).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&script, perms).unwrap();

        let cfg = YomitokuConfig {
            mode: Some("cli".into()),
            cli_path: Some(script.to_str().unwrap().to_string()),
            timeout: Duration::from_secs(30),
            ..YomitokuConfig::default()
        };
        let engine = YomitokuEngine::from_config(&cfg).unwrap();
        let text = engine.recognize(b"png bytes").unwrap();
        assert_eq!(text.len(), 4000 * 32);
        assert!(text.starts_with("abcdefghijklmnopqrstuvwxyz012345"));
    }

    #[test]
    fn test_payload_without_content_is_transient() {
        let payload: YomitokuPayload = serde_json::from_str("{}").unwrap();
        assert!(matches!(
            parse_payload(payload),
            Err(EngineError::Transient(_))
        ));
    }
}

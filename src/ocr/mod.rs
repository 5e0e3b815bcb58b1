//! OCR backend orchestration.
//!
//! Defines the [`PageEngine`] trait implemented by each engine, the
//! [`EngineRegistry`] holding the per-task engine handles, and the
//! fallback state machine that decides which engine's output a document
//! ends up with.
//!
//! The primary engine (YomiToku) is an optional external dependency —
//! REST sidecar or CLI — so its failures degrade to the always-local
//! RapidOCR engine. The fallback engines receive preprocessed
//! (binarized/deskewed) page images; the primary receives raw rasters.

pub mod local;
pub mod preprocess;
pub mod raster;
pub mod yomitoku;

use image::DynamicImage;
use tracing::{info, warn};

use crate::config::OcrConfig;
use crate::error::{EngineError, PipelineError};
use crate::exec::{parallel_map, retry_with_backoff, RetryPolicy};

use self::local::LocalCliEngine;
use self::yomitoku::YomitokuEngine;

/// Minimum total stripped characters for OCR (or text-layer) output to be
/// considered usable. Below this a "successful" primary run is treated as
/// garbage and refed to the fallback engine.
pub const MIN_TEXT_LEN: usize = 20;

/// Recognized OCR backend names, as exposed on the HTTP surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OcrBackend {
    Yomitoku,
    RapidOcr,
    PaddleOcr,
}

impl OcrBackend {
    /// Parse an upload selector into a backend. Unrecognized names are
    /// rejected at the API boundary.
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "yomitoku" => Some(Self::Yomitoku),
            "rapidocr" => Some(Self::RapidOcr),
            "paddleocr" => Some(Self::PaddleOcr),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Yomitoku => "yomitoku",
            Self::RapidOcr => "rapidocr",
            Self::PaddleOcr => "paddleocr",
        }
    }
}

impl std::fmt::Display for OcrBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One OCR engine: turns a single page image (PNG bytes) into text.
///
/// Implementations are synchronous — they run on the task's worker
/// threads, never on the async runtime.
pub trait PageEngine: Send + Sync {
    fn name(&self) -> &'static str;
    fn recognize(&self, page_png: &[u8]) -> Result<String, EngineError>;
}

/// Engine handles for one task, constructed once and passed by reference
/// to the page workers. A missing/misconfigured primary is recorded as
/// the reason string rather than an error, since it only matters once a
/// document actually requests the primary backend.
pub struct EngineRegistry {
    primary: Result<Box<dyn PageEngine>, String>,
    fallback_a: Box<dyn PageEngine>,
    fallback_b: Box<dyn PageEngine>,
}

impl EngineRegistry {
    pub fn from_config(cfg: &OcrConfig) -> Self {
        Self {
            primary: YomitokuEngine::from_config(&cfg.yomitoku)
                .map(|engine| Box::new(engine) as Box<dyn PageEngine>)
                .map_err(|e| e.to_string()),
            fallback_a: Box::new(LocalCliEngine::rapidocr(cfg)),
            fallback_b: Box::new(LocalCliEngine::paddleocr(cfg)),
        }
    }

    #[cfg(test)]
    pub fn with_engines(
        primary: Result<Box<dyn PageEngine>, String>,
        fallback_a: Box<dyn PageEngine>,
        fallback_b: Box<dyn PageEngine>,
    ) -> Self {
        Self { primary, fallback_a, fallback_b }
    }
}

/// Per-document OCR output with provenance.
#[derive(Debug, Clone)]
pub struct OcrOutcome {
    /// One text per page, in source page order.
    pub texts: Vec<String>,
    pub backend_used: OcrBackend,
}

/// Orchestrator states. Transitions are driven by
/// configuration-absent / retry-ceiling-exhausted / low-yield triggers so
/// the fallback policy stays auditable independently of the engines.
/// `Done` and `Failed` are terminal.
#[derive(Debug)]
enum State {
    TryPrimary,
    TryFallbackA,
    Done(OcrOutcome),
    Failed(PipelineError),
}

/// Rasterize a whole document and run the requested backend over it.
pub fn ocr_document(
    registry: &EngineRegistry,
    cfg: &OcrConfig,
    pdf_path: &std::path::Path,
    backend: OcrBackend,
) -> Result<OcrOutcome, PipelineError> {
    let pages = raster::render_pages(pdf_path, cfg.dpi)?;
    run_backend(registry, cfg, &pages, backend)
}

/// Run the fallback state machine over already-rasterized page images.
pub fn run_backend(
    registry: &EngineRegistry,
    cfg: &OcrConfig,
    pages: &[DynamicImage],
    requested: OcrBackend,
) -> Result<OcrOutcome, PipelineError> {
    match requested {
        OcrBackend::Yomitoku => run_primary_chain(registry, cfg, pages),
        OcrBackend::RapidOcr => run_local(registry.fallback_a.as_ref(), pages).map(|texts| {
            OcrOutcome { texts, backend_used: OcrBackend::RapidOcr }
        }),
        OcrBackend::PaddleOcr => run_local(registry.fallback_b.as_ref(), pages).map(|texts| {
            OcrOutcome { texts, backend_used: OcrBackend::PaddleOcr }
        }),
    }
}

fn run_primary_chain(
    registry: &EngineRegistry,
    cfg: &OcrConfig,
    pages: &[DynamicImage],
) -> Result<OcrOutcome, PipelineError> {
    let mut state = State::TryPrimary;
    loop {
        state = match state {
            State::TryPrimary => match &registry.primary {
                Err(reason) => {
                    warn!("primary OCR engine unavailable, falling back to rapidocr: {}", reason);
                    State::TryFallbackA
                }
                Ok(engine) => match run_primary(engine.as_ref(), cfg, pages) {
                    Ok(texts) if stripped_len(&texts) >= MIN_TEXT_LEN => {
                        info!("primary OCR succeeded for {} pages", texts.len());
                        State::Done(OcrOutcome { texts, backend_used: OcrBackend::Yomitoku })
                    }
                    Ok(texts) => {
                        // Succeeded but useless: discard and reprocess every page.
                        warn!(
                            "primary OCR output too short ({} chars), falling back to rapidocr",
                            stripped_len(&texts)
                        );
                        State::TryFallbackA
                    }
                    Err(err) => {
                        warn!("primary OCR failed after retries, falling back to rapidocr: {}", err);
                        State::TryFallbackA
                    }
                },
            },
            State::TryFallbackA => match run_local(registry.fallback_a.as_ref(), pages) {
                Ok(texts) => State::Done(OcrOutcome { texts, backend_used: OcrBackend::RapidOcr }),
                Err(err) => State::Failed(err),
            },
            State::Done(outcome) => return Ok(outcome),
            State::Failed(err) => return Err(err),
        };
    }
}

/// Concurrent primary dispatch: every page image goes out raw, each call
/// wrapped in the retry policy, results restored to page order.
fn run_primary(
    engine: &dyn PageEngine,
    cfg: &OcrConfig,
    pages: &[DynamicImage],
) -> Result<Vec<String>, EngineError> {
    let pngs = pages
        .iter()
        .map(encode_png)
        .collect::<Result<Vec<_>, _>>()?;

    let policy = RetryPolicy {
        attempts: cfg.yomitoku.max_retries,
        base_delay: cfg.yomitoku.retry_base_delay,
        multiplier: cfg.yomitoku.retry_multiplier,
    };

    parallel_map(cfg.yomitoku.max_workers, pngs, |png| {
        retry_with_backoff(&policy, || engine.recognize(&png), EngineError::is_transient)
    })
    .into_iter()
    .collect()
}

/// Sequential local-engine pass over preprocessed page images. Any page
/// failure is fatal for the document — there is no further fallback.
fn run_local(engine: &dyn PageEngine, pages: &[DynamicImage]) -> Result<Vec<String>, PipelineError> {
    let mut texts = Vec::with_capacity(pages.len());
    for (idx, page) in pages.iter().enumerate() {
        let prepared = preprocess::prepare_for_ocr(page);
        let png = encode_png(&DynamicImage::ImageLuma8(prepared))
            .map_err(|e| PipelineError::Extraction(e.to_string()))?;
        let text = engine.recognize(&png).map_err(|e| {
            PipelineError::Extraction(format!(
                "{} OCR failed on page {}: {}",
                engine.name(),
                idx + 1,
                e
            ))
        })?;
        texts.push(text);
    }
    Ok(texts)
}

fn encode_png(image: &DynamicImage) -> Result<Vec<u8>, EngineError> {
    let mut buffer = std::io::Cursor::new(Vec::new());
    image
        .write_to(&mut buffer, image::ImageFormat::Png)
        .map_err(|e| EngineError::Fatal(format!("failed to encode page image to PNG: {}", e)))?;
    Ok(buffer.into_inner())
}

fn stripped_len(texts: &[String]) -> usize {
    texts
        .iter()
        .map(|t| t.chars().filter(|c| !c.is_whitespace()).count())
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    /// Pages tagged by their top-left pixel's red channel, so a test
    /// engine can tell which page it got regardless of dispatch order.
    fn tagged_pages(count: u8) -> Vec<DynamicImage> {
        (0..count)
            .map(|idx| {
                let mut img = RgbImage::from_pixel(8, 8, Rgb([255, 255, 255]));
                img.put_pixel(0, 0, Rgb([idx, 0, 0]));
                DynamicImage::ImageRgb8(img)
            })
            .collect()
    }

    fn page_tag(png: &[u8]) -> u8 {
        let img = image::load_from_memory(png).unwrap().to_rgb8();
        img.get_pixel(0, 0).0[0]
    }

    /// Local engines run sequentially, so call order equals page order.
    struct EchoEngine {
        name: &'static str,
        prefix: &'static str,
        calls: AtomicU32,
    }

    impl PageEngine for EchoEngine {
        fn name(&self) -> &'static str {
            self.name
        }
        fn recognize(&self, _page_png: &[u8]) -> Result<String, EngineError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(format!("{}-{} some recognized text", self.prefix, n))
        }
    }

    /// Later-indexed pages complete first.
    struct SlowFirstEngine;

    impl PageEngine for SlowFirstEngine {
        fn name(&self) -> &'static str {
            "yomitoku"
        }
        fn recognize(&self, page_png: &[u8]) -> Result<String, EngineError> {
            let tag = page_tag(page_png);
            std::thread::sleep(Duration::from_millis((4 - tag as u64) * 20));
            Ok(format!("PRIMARY-{} recognized page content", tag))
        }
    }

    struct ShortOutputEngine;

    impl PageEngine for ShortOutputEngine {
        fn name(&self) -> &'static str {
            "yomitoku"
        }
        fn recognize(&self, _page_png: &[u8]) -> Result<String, EngineError> {
            Ok("x".to_string())
        }
    }

    struct FlakyEngine {
        calls: AtomicU32,
    }

    impl PageEngine for FlakyEngine {
        fn name(&self) -> &'static str {
            "yomitoku"
        }
        fn recognize(&self, _page_png: &[u8]) -> Result<String, EngineError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(EngineError::Transient("connection refused".into()))
        }
    }

    struct FailingEngine;

    impl PageEngine for FailingEngine {
        fn name(&self) -> &'static str {
            "rapidocr"
        }
        fn recognize(&self, _page_png: &[u8]) -> Result<String, EngineError> {
            Err(EngineError::Fatal("engine binary missing".into()))
        }
    }

    fn fast_cfg() -> OcrConfig {
        let mut cfg = OcrConfig::default();
        cfg.yomitoku.max_retries = 2;
        cfg.yomitoku.retry_base_delay = Duration::from_millis(1);
        cfg
    }

    fn echo(name: &'static str, prefix: &'static str) -> Box<dyn PageEngine> {
        Box::new(EchoEngine { name, prefix, calls: AtomicU32::new(0) })
    }

    #[test]
    fn test_unconfigured_primary_falls_back_to_rapidocr() {
        let registry = EngineRegistry::with_engines(
            Err("YOMITOKU_MODE is not set".into()),
            echo("rapidocr", "A"),
            echo("paddleocr", "B"),
        );
        let pages = tagged_pages(2);
        let outcome = run_backend(&registry, &fast_cfg(), &pages, OcrBackend::Yomitoku).unwrap();
        assert_eq!(outcome.backend_used, OcrBackend::RapidOcr);
        assert!(outcome.texts[0].starts_with("A-0"));
        assert!(outcome.texts[1].starts_with("A-1"));
    }

    #[test]
    fn test_retry_ceiling_exhausted_falls_back() {
        let flaky = FlakyEngine { calls: AtomicU32::new(0) };
        let registry = EngineRegistry::with_engines(
            Ok(Box::new(flaky)),
            echo("rapidocr", "A"),
            echo("paddleocr", "B"),
        );
        let pages = tagged_pages(1);
        let outcome = run_backend(&registry, &fast_cfg(), &pages, OcrBackend::Yomitoku).unwrap();
        assert_eq!(outcome.backend_used, OcrBackend::RapidOcr);
    }

    #[test]
    fn test_low_yield_primary_discarded() {
        let registry = EngineRegistry::with_engines(
            Ok(Box::new(ShortOutputEngine)),
            echo("rapidocr", "A"),
            echo("paddleocr", "B"),
        );
        let pages = tagged_pages(3);
        let outcome = run_backend(&registry, &fast_cfg(), &pages, OcrBackend::Yomitoku).unwrap();
        assert_eq!(outcome.backend_used, OcrBackend::RapidOcr);
        // Every page reprocessed by the fallback, none of the primary "x" output kept
        assert_eq!(outcome.texts.len(), 3);
        assert!(outcome.texts.iter().all(|t| t.starts_with("A-")));
    }

    #[test]
    fn test_primary_success_preserves_page_order() {
        let registry = EngineRegistry::with_engines(
            Ok(Box::new(SlowFirstEngine)),
            echo("rapidocr", "A"),
            echo("paddleocr", "B"),
        );
        let pages = tagged_pages(4);
        let outcome = run_backend(&registry, &fast_cfg(), &pages, OcrBackend::Yomitoku).unwrap();
        assert_eq!(outcome.backend_used, OcrBackend::Yomitoku);
        for (idx, text) in outcome.texts.iter().enumerate() {
            assert!(
                text.starts_with(&format!("PRIMARY-{}", idx)),
                "page {} out of order: {}",
                idx,
                text
            );
        }
    }

    #[test]
    fn test_fallback_failure_after_primary_surfaces_error() {
        let registry = EngineRegistry::with_engines(
            Err("YOMITOKU_MODE is not set".into()),
            Box::new(FailingEngine),
            echo("paddleocr", "B"),
        );
        let pages = tagged_pages(1);
        let err = run_backend(&registry, &fast_cfg(), &pages, OcrBackend::Yomitoku).unwrap_err();
        assert!(matches!(err, PipelineError::Extraction(_)));
    }

    #[test]
    fn test_explicit_fallback_backend_runs_alone() {
        let registry = EngineRegistry::with_engines(
            Err("unused".into()),
            echo("rapidocr", "A"),
            echo("paddleocr", "B"),
        );
        let pages = tagged_pages(2);
        let outcome = run_backend(&registry, &fast_cfg(), &pages, OcrBackend::PaddleOcr).unwrap();
        assert_eq!(outcome.backend_used, OcrBackend::PaddleOcr);
        assert!(outcome.texts[0].starts_with("B-0"));
    }

    #[test]
    fn test_explicit_fallback_failure_is_fatal() {
        let registry = EngineRegistry::with_engines(
            Err("unused".into()),
            Box::new(FailingEngine),
            echo("paddleocr", "B"),
        );
        let pages = tagged_pages(1);
        let err = run_backend(&registry, &fast_cfg(), &pages, OcrBackend::RapidOcr).unwrap_err();
        assert!(matches!(err, PipelineError::Extraction(_)));
    }

    #[test]
    fn test_backend_names_round_trip() {
        for name in ["yomitoku", "rapidocr", "paddleocr"] {
            assert_eq!(OcrBackend::from_str(name).unwrap().as_str(), name);
        }
        assert!(OcrBackend::from_str("tesseract").is_none());
    }
}

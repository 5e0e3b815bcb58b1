//! PDF page rasterization via pdfium.
//!
//! Pdfium handles are not shareable across threads, so a binding is
//! created per call — rasterization happens at most once per document and
//! the bind is cheap next to rendering.

use std::path::Path;

use image::DynamicImage;
use pdfium_render::prelude::*;

use crate::error::PipelineError;

const POINTS_PER_INCH: f32 = 72.0;

/// Render every page of `path` to an image at the given DPI, in page
/// order.
pub fn render_pages(path: &Path, dpi: u32) -> Result<Vec<DynamicImage>, PipelineError> {
    let pdfium = Pdfium::new(
        Pdfium::bind_to_library(Pdfium::pdfium_platform_library_name_at_path("./"))
            .or_else(|_| Pdfium::bind_to_system_library())
            .map_err(|e| PipelineError::Extraction(format!("failed to bind pdfium: {}", e)))?,
    );

    let document = pdfium
        .load_pdf_from_file(path, None)
        .map_err(|e| PipelineError::Extraction(format!("failed to load {}: {}", path.display(), e)))?;

    let scale = dpi as f32 / POINTS_PER_INCH;
    let mut pages = Vec::with_capacity(document.pages().len() as usize);
    for page in document.pages().iter() {
        let width_px = (page.width().value * scale).round().max(1.0) as i32;
        let height_px = (page.height().value * scale).round().max(1.0) as i32;
        let bitmap = page
            .render_with_config(
                &PdfRenderConfig::new()
                    .set_target_width(width_px)
                    .set_maximum_height(height_px),
            )
            .map_err(|e| {
                PipelineError::Extraction(format!("failed to render page of {}: {}", path.display(), e))
            })?;
        pages.push(bitmap.as_image());
    }
    Ok(pages)
}

//! Page-image preprocessing ahead of the local OCR engines.
//!
//! Scanned drawings arrive noisy and slightly rotated; the local engines
//! do markedly better on a denoised, binarized, deskewed input. The
//! primary REST/CLI engine runs its own preprocessing and receives the
//! raw raster instead.

use image::{DynamicImage, GrayImage, Luma};
use imageproc::contrast::adaptive_threshold;
use imageproc::filter::{bilateral_filter, median_filter};
use imageproc::geometric_transformations::{rotate_about_center, Interpolation};
use imageproc::geometry::min_area_rect;
use imageproc::point::Point;

const THRESHOLD_BLOCK_RADIUS: u32 = 15;

/// Grayscale → median blur → bilateral filter → adaptive threshold →
/// deskew.
pub fn prepare_for_ocr(page: &DynamicImage) -> GrayImage {
    let gray = page.to_luma8();
    let blurred = median_filter(&gray, 1, 1);
    let smoothed = bilateral_filter(&blurred, 9, 75.0, 75.0);
    let binarized = adaptive_threshold(&smoothed, THRESHOLD_BLOCK_RADIUS);
    deskew(&binarized)
}

/// Estimate the page's skew from the minimum-area bounding rectangle of
/// the foreground (dark) pixels and rotate to correct it.
fn deskew(image: &GrayImage) -> GrayImage {
    let foreground: Vec<Point<i32>> = image
        .enumerate_pixels()
        .filter(|(_, _, pixel)| pixel.0[0] < 255)
        .map(|(x, y, _)| Point::new(x as i32, y as i32))
        .collect();
    if foreground.len() < 3 {
        return image.clone();
    }

    let corners = min_area_rect(&foreground);
    let angle = skew_angle(&corners);
    if angle.abs() < 0.1 {
        return image.clone();
    }
    rotate_about_center(
        image,
        -angle.to_radians(),
        Interpolation::Bicubic,
        Luma([255u8]),
    )
}

/// Angle (degrees) of the rectangle's first edge, normalized into
/// (-45, 45] — the edge direction is ambiguous by 90°.
fn skew_angle(corners: &[Point<i32>; 4]) -> f32 {
    let dx = (corners[1].x - corners[0].x) as f32;
    let dy = (corners[1].y - corners[0].y) as f32;
    let mut angle = dy.atan2(dx).to_degrees();
    while angle <= -45.0 {
        angle += 90.0;
    }
    while angle > 45.0 {
        angle -= 90.0;
    }
    angle
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    #[test]
    fn test_output_is_binarized() {
        let mut img = image::RgbImage::from_pixel(64, 64, Rgb([240, 240, 240]));
        for x in 10..50 {
            for y in 30..34 {
                img.put_pixel(x, y, Rgb([20, 20, 20]));
            }
        }
        let out = prepare_for_ocr(&DynamicImage::ImageRgb8(img));
        assert_eq!(out.dimensions(), (64, 64));
        assert!(out.pixels().all(|p| p.0[0] == 0 || p.0[0] == 255));
    }

    #[test]
    fn test_blank_page_survives() {
        let img = image::RgbImage::from_pixel(32, 32, Rgb([255, 255, 255]));
        let out = prepare_for_ocr(&DynamicImage::ImageRgb8(img));
        assert_eq!(out.dimensions(), (32, 32));
    }

    #[test]
    fn test_skew_angle_normalized() {
        // A vertical first edge reads as 90°, which normalizes to 0°
        let corners = [
            Point::new(0, 0),
            Point::new(0, 10),
            Point::new(5, 10),
            Point::new(5, 0),
        ];
        assert!(skew_angle(&corners).abs() < 0.01);
    }
}

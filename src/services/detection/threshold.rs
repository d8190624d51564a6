// Foreground extraction: Gaussian adaptive threshold and contour bounding boxes

use image::{GrayImage, Luma};
use imageproc::contours::find_contours;
use imageproc::filter::gaussian_blur_f32;

use crate::core::types::Rect;

/// Sigma of the Gaussian window for a given block size (OpenCV's getGaussianKernel rule)
pub fn gaussian_sigma(block_size: u32) -> f32 {
    let sigma = 0.3 * ((block_size as f32 - 1.0) * 0.5 - 1.0) + 0.8;
    sigma.max(0.5)
}

/// Inverted binary adaptive threshold.
///
/// A pixel becomes foreground (255) when it is at least `offset` darker than the
/// Gaussian-weighted mean of its neighbourhood, so dark ink on unevenly lit paper
/// survives while smooth illumination gradients do not.
pub fn adaptive_threshold_inv(gray: &GrayImage, block_size: u32, offset: f32) -> GrayImage {
    let local_mean = gaussian_blur_f32(gray, gaussian_sigma(block_size));
    let mut mask = GrayImage::new(gray.width(), gray.height());

    for (x, y, pixel) in gray.enumerate_pixels() {
        let threshold = local_mean.get_pixel(x, y)[0] as f32 - offset;
        let value = if (pixel[0] as f32) <= threshold { 255 } else { 0 };
        mask.put_pixel(x, y, Luma([value]));
    }

    mask
}

/// Bounding rectangles of every contour in the mask, outer borders and holes alike
pub fn contour_rects(mask: &GrayImage) -> Vec<Rect> {
    find_contours::<u32>(mask)
        .iter()
        .filter_map(|contour| {
            let first = contour.points.first()?;
            let (mut min_x, mut min_y, mut max_x, mut max_y) = (first.x, first.y, first.x, first.y);
            for p in &contour.points {
                min_x = min_x.min(p.x);
                min_y = min_y.min(p.y);
                max_x = max_x.max(p.x);
                max_y = max_y.max(p.y);
            }
            // Inclusive pixel extents
            Some(Rect::new(min_x, min_y, max_x - min_x + 1, max_y - min_y + 1))
        })
        .collect()
}

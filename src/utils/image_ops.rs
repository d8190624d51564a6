use anyhow::{Context, Result};
use base64::{engine::general_purpose, Engine};
use image::{DynamicImage, ImageFormat, Rgba};
use imageproc::drawing::draw_hollow_rect_mut;
use imageproc::rect::Rect as DrawRect;
use std::io::Cursor;

use crate::core::errors::{DetectionError, DetectionResult};
use crate::core::types::Bbox;

/// Asynchronously load an image from bytes using spawn_blocking.
///
/// Image decoding is CPU-intensive, especially for large scans.
pub async fn load_image_from_memory_async(bytes: &[u8]) -> DetectionResult<DynamicImage> {
    let bytes = bytes.to_vec();
    tokio::task::spawn_blocking(move || image::load_from_memory(&bytes).map_err(DetectionError::from))
        .await
        .map_err(|e| DetectionError::TaskJoinFailed(e.to_string()))?
}

/// Crop a normalized region and encode it as PNG
pub fn crop_bbox_png(img: &DynamicImage, bbox: &Bbox) -> Result<Vec<u8>> {
    let rect = bbox.to_pixels(img.width(), img.height());
    if rect.width == 0 || rect.height == 0 {
        anyhow::bail!("Region {:?} is empty on a {}x{} image", bbox, img.width(), img.height());
    }
    let cropped = img.crop_imm(rect.x, rect.y, rect.width, rect.height);
    encode_png(&cropped).context("Failed to encode cropped region as PNG")
}

/// Asynchronously crop and encode in a single blocking task
pub async fn crop_bbox_png_async(img: std::sync::Arc<DynamicImage>, bbox: Bbox) -> Result<Vec<u8>> {
    tokio::task::spawn_blocking(move || crop_bbox_png(&img, &bbox))
        .await
        .context("Failed to spawn blocking task for crop and encode")?
}

pub fn encode_png(img: &DynamicImage) -> Result<Vec<u8>> {
    let mut png_bytes = Vec::new();
    img.write_to(&mut Cursor::new(&mut png_bytes), ImageFormat::Png)
        .context("Failed to encode image as PNG")?;
    Ok(png_bytes)
}

pub fn png_data_url(png_bytes: &[u8]) -> String {
    format!(
        "data:image/png;base64,{}",
        general_purpose::STANDARD.encode(png_bytes)
    )
}

/// Draw detected regions as red outlines, for visual inspection
pub fn draw_region_outlines(img: &DynamicImage, regions: &[Bbox]) -> DynamicImage {
    let mut canvas = img.to_rgba8();
    let (width, height) = canvas.dimensions();
    for bbox in regions {
        let rect = bbox.to_pixels(width, height);
        if rect.width == 0 || rect.height == 0 {
            continue;
        }
        let outline = DrawRect::at(rect.x as i32, rect.y as i32).of_size(rect.width, rect.height);
        draw_hollow_rect_mut(&mut canvas, outline, Rgba([220, 30, 30, 255]));
    }
    DynamicImage::ImageRgba8(canvas)
}

// Region detection: page image -> normalized problem bounding boxes

pub mod merge;
pub mod threshold;

use image::DynamicImage;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tracing::{debug, info, instrument};

use crate::core::config::DetectionConfig;
use crate::core::errors::{DetectionError, DetectionResult};
use crate::core::types::Bbox;
use crate::utils::image_ops::load_image_from_memory_async;
use crate::utils::Metrics;

use merge::{merge_until_stable, RectFilter};
use threshold::{adaptive_threshold_inv, contour_rects};

/// Counts from one detection pass, for logging and metrics
#[derive(Debug, Clone)]
pub struct DetectionReport {
    pub regions: Vec<Bbox>,
    pub contours: usize,
    pub after_filter: usize,
    pub merge_passes: usize,
    pub elapsed: Duration,
}

/// Runs the full detection pipeline synchronously on one image.
///
/// The result is sorted top-to-bottom; an empty list means nothing was found.
pub fn detect_regions(image: &DynamicImage, config: &DetectionConfig) -> DetectionResult<DetectionReport> {
    let start = Instant::now();
    let (width, height) = (image.width(), image.height());
    if width == 0 || height == 0 {
        return Err(DetectionError::InvalidImageSize { width, height });
    }

    let gray = image.to_luma8();
    let mask = adaptive_threshold_inv(&gray, config.block_size, config.threshold_offset);

    let rects = contour_rects(&mask);
    let contours = rects.len();

    let filter = RectFilter {
        min_area: config.min_area,
        max_aspect_ratio: config.max_aspect_ratio,
    };
    let kept = filter.apply(rects);
    let after_filter = kept.len();

    let max_gap = config.gap_ratio * width as f64;
    let merged = merge_until_stable(kept, max_gap);

    let mut regions: Vec<Bbox> = merged
        .rects
        .iter()
        .map(|r| r.normalize(width, height))
        .collect();
    regions.sort_by(|a, b| {
        a.y_min
            .total_cmp(&b.y_min)
            .then_with(|| a.x_min.total_cmp(&b.x_min))
    });

    debug!(
        "Detection {}x{}: {} contours, {} after filter, {} regions ({} passes)",
        width,
        height,
        contours,
        after_filter,
        regions.len(),
        merged.passes
    );

    Ok(DetectionReport {
        regions,
        contours,
        after_filter,
        merge_passes: merged.passes,
        elapsed: start.elapsed(),
    })
}

/// Detection service with bounded CPU concurrency
pub struct RegionDetector {
    config: DetectionConfig,
    permits: Arc<Semaphore>,
    metrics: Option<Metrics>,
}

impl RegionDetector {
    pub fn new(config: DetectionConfig, metrics: Option<Metrics>) -> Self {
        let permits = Arc::new(Semaphore::new(config.max_concurrent_detections.max(1)));
        info!(
            "✓ Region detector (block={}, gap={:.1}% of width, {} concurrent)",
            config.block_size,
            config.gap_ratio * 100.0,
            config.max_concurrent_detections
        );
        Self {
            config,
            permits,
            metrics,
        }
    }

    pub fn config(&self) -> &DetectionConfig {
        &self.config
    }

    /// Detect on an already decoded image off the async runtime
    #[instrument(skip(self, image), fields(width = image.width(), height = image.height()))]
    pub async fn detect(&self, image: Arc<DynamicImage>) -> DetectionResult<Vec<Bbox>> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|e| DetectionError::TaskJoinFailed(e.to_string()))?;

        let config = self.config.clone();
        let report = tokio::task::spawn_blocking(move || detect_regions(&image, &config))
            .await
            .map_err(|e| DetectionError::TaskJoinFailed(e.to_string()))??;

        if let Some(ref m) = self.metrics {
            m.record_detection(report.elapsed, report.regions.len());
        }

        Ok(report.regions)
    }

    /// Decode then detect. Undecodable input fails the whole call.
    pub async fn detect_bytes(&self, bytes: &[u8]) -> DetectionResult<(Arc<DynamicImage>, Vec<Bbox>)> {
        let image = Arc::new(load_image_from_memory_async(bytes).await?);
        let regions = self.detect(Arc::clone(&image)).await?;
        Ok((image, regions))
    }
}

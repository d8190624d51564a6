//! Region detector check on a single page image
//! Run with: cargo run --release --bin detect_regions -- <image_path> [output_path]

use anyhow::{Context, Result};
use haejeok::core::config::DetectionConfig;
use haejeok::services::detection::detect_regions;
use haejeok::utils::draw_region_outlines;
use std::path::{Path, PathBuf};
use tracing::info;

fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter("haejeok::services::detection=debug")
        .with_target(false)
        .init();

    let args: Vec<String> = std::env::args().collect();
    let sample_path = if args.len() > 1 {
        args[1].clone()
    } else {
        "test_sample.png".to_string()
    };

    if !Path::new(&sample_path).exists() {
        eprintln!("Image not found: {}", sample_path);
        std::process::exit(1);
    }
    let output_path = args.get(2).map(PathBuf::from).unwrap_or_else(|| {
        let path = Path::new(&sample_path);
        let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or("page");
        path.with_file_name(format!("{}_regions.png", stem))
    });

    info!("Loading image: {}", sample_path);
    let image = image::open(&sample_path).with_context(|| format!("Failed to open {}", sample_path))?;
    info!("Image dimensions: {}x{}", image.width(), image.height());

    let config = DetectionConfig::default();
    let report = detect_regions(&image, &config)?;

    println!("\n=== Results ===");
    println!(
        "Contours: {}  after filter: {}  merge passes: {}  time: {:.1?}",
        report.contours, report.after_filter, report.merge_passes, report.elapsed
    );
    if report.regions.is_empty() {
        println!("  (no regions)");
    }
    for (i, bbox) in report.regions.iter().enumerate() {
        println!(
            "  {}. x {:.3}..{:.3}  y {:.3}..{:.3}",
            i + 1,
            bbox.x_min,
            bbox.x_max,
            bbox.y_min,
            bbox.y_max
        );
    }

    draw_region_outlines(&image, &report.regions)
        .save(&output_path)
        .with_context(|| format!("Failed to write {}", output_path.display()))?;
    println!("Outlines written to {}", output_path.display());

    Ok(())
}

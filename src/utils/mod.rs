pub mod image_ops;
pub mod metrics;

// Re-export commonly used items
pub use image_ops::{
    crop_bbox_png, crop_bbox_png_async, draw_region_outlines, encode_png,
    load_image_from_memory_async, png_data_url,
};
pub use metrics::Metrics;

//! Deterministic image preprocessing used ahead of inference

pub mod canvas;
pub mod control;

pub use canvas::{compose, AspectRatio, Placement, VerticalAlignment};
pub use control::{extract_control_signal, CannyThresholds};

use image::DynamicImage;

use crate::error::{AdGenError, Result};

/// Decode caller-supplied bytes, rejecting degenerate images
pub fn decode_image(bytes: &[u8]) -> Result<DynamicImage> {
    let image = image::load_from_memory(bytes).map_err(AdGenError::ImageDecode)?;
    if image.width() == 0 || image.height() == 0 {
        return Err(AdGenError::invalid_image(format!(
            "image has zero dimension ({}x{})",
            image.width(),
            image.height()
        )));
    }
    Ok(image)
}

//! Inference capability: one trait over the remote API and the local runtime

pub mod ddim;
pub mod handle;
pub mod local_sdxl;
pub mod replicate;

pub use handle::SharedInference;
pub use local_sdxl::SdxlLocalBackend;
pub use replicate::ReplicateBackend;

use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use image::{DynamicImage, ImageOutputFormat, RgbImage, RgbaImage};
use std::io::Cursor;

use crate::config::{InferenceConfig, InferenceKind};
use crate::device::DeviceLease;
use crate::styles::PromptPair;

/// Everything a backend needs for one render
#[derive(Debug, Clone, Copy)]
pub struct InferenceRequest<'a> {
    pub prompts: &'a PromptPair,
    pub control_signal: &'a RgbImage,
    /// Appearance reference; the composed canvas when identity conditioning is on
    pub identity_image: Option<&'a RgbaImage>,
    pub width: u32,
    pub height: u32,
    pub conditioning_scale: f32,
    pub steps: usize,
    pub seed: Option<u64>,
}

pub trait InferenceBackend: Send {
    fn name(&self) -> &str;

    /// Render the request. An empty list is a valid answer; the caller decides
    /// what that means.
    fn generate(&mut self, request: &InferenceRequest<'_>) -> Result<Vec<DynamicImage>>;
}

/// Encode as PNG (keeps transparency) wrapped in a `data:` URI
pub fn png_data_uri(image: &DynamicImage) -> Result<String> {
    let mut buf = Vec::new();
    image
        .write_to(&mut Cursor::new(&mut buf), ImageOutputFormat::Png)
        .context("Failed to encode PNG for upload")?;
    Ok(format!("data:image/png;base64,{}", STANDARD.encode(&buf)))
}

/// Lazily loading handle for the configured backend
pub fn shared_from_config(config: &InferenceConfig, device_spec: &str, lease: DeviceLease) -> SharedInference {
    let config = config.clone();
    let device_spec = device_spec.to_string();
    SharedInference::new(
        move || -> Result<Box<dyn InferenceBackend>> {
            match config.backend {
                InferenceKind::Replicate => Ok(Box::new(ReplicateBackend::from_config(&config.replicate)?)),
                InferenceKind::Local => {
                    let device = crate::device::select_device(&device_spec)?;
                    Ok(Box::new(SdxlLocalBackend::load(&config.local, device)?))
                }
            }
        },
        lease,
    )
}

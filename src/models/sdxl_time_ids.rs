use anyhow::{Context, Result};
use candle_core::{DType, Device, Tensor};

/// SDXL micro-conditioning, each pair as `(height, width)` / `(top, left)`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeIdsConfig {
    pub original_size: (u32, u32),
    pub crop_origin: (u32, u32),
    pub target_size: (u32, u32),
}

impl TimeIdsConfig {
    /// Uncropped, original equal to target
    pub fn new(height: u32, width: u32) -> Self {
        Self {
            original_size: (height, width),
            crop_origin: (0, 0),
            target_size: (height, width),
        }
    }

    /// `[1024, 1024, 0, 0, 1024, 1024]`, shared by every training sample
    pub fn training_default() -> Self {
        Self::new(1024, 1024)
    }

    /// Crop origin for centring `target_size` inside `original_size`
    pub fn center_cropped(original_size: (u32, u32), target_size: (u32, u32)) -> Self {
        Self {
            original_size,
            crop_origin: (
                original_size.0.saturating_sub(target_size.0) / 2,
                original_size.1.saturating_sub(target_size.1) / 2,
            ),
            target_size,
        }
    }

    pub fn values(&self) -> [f32; 6] {
        let (oh, ow) = self.original_size;
        let (top, left) = self.crop_origin;
        let (th, tw) = self.target_size;
        [oh, ow, top, left, th, tw].map(|v| v as f32)
    }

    /// `[batch, 6]`, one identical row per sample
    pub fn batch(&self, batch_size: usize, device: &Device, dtype: DType) -> Result<Tensor> {
        Tensor::from_vec(self.values().to_vec(), (1, 6), device)?
            .repeat((batch_size, 1))?
            .to_dtype(dtype)
            .context("Failed to build time_ids")
    }
}

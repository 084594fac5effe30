//! SDXL components for the trainer: the frozen UNet rebuilt per step with the
//! live adapter deltas folded into its attention weights.

use anyhow::{Context, Result};
use candle_core::{DType, Device, Tensor};
use log::{debug, info};
use std::collections::HashMap;
use std::path::Path;

use super::{
    AddedConditioning, AttentionProjection, Denoiser, LatentEncoder, TextConditioning, TrainingComponents,
    TrainingModelLoader,
};
use crate::config::SdxlModelPaths;
use crate::device::Precision;
use crate::models::sdxl_unet::{attention_projections, build_unet};
use crate::models::SdxlVae;
use crate::trainers::text_encoders::DualClipEncoder;

pub struct SdxlDenoiser {
    weights: HashMap<String, Tensor>,
    dtype: DType,
    device: Device,
}

impl SdxlDenoiser {
    /// Read every UNet tensor onto `device` once, cast to `dtype`
    pub fn load(path: &Path, device: &Device, dtype: DType) -> Result<Self> {
        info!("Loading SDXL UNet from: {}", path.display());
        let raw = candle_core::safetensors::load(path, device)
            .with_context(|| format!("Failed to read UNet weights {}", path.display()))?;
        let mut weights = HashMap::with_capacity(raw.len());
        for (name, tensor) in raw {
            let tensor = if tensor.dtype().is_float() {
                tensor.to_dtype(dtype)?
            } else {
                tensor
            };
            weights.insert(name, tensor);
        }
        info!("UNet: {} tensors in {:?}", weights.len(), dtype);
        Ok(Self {
            weights,
            dtype,
            device: device.clone(),
        })
    }
}

impl Denoiser for SdxlDenoiser {
    fn attention_projections(&self) -> Vec<AttentionProjection> {
        attention_projections(self.weights.iter().map(|(name, t)| (name.as_str(), t.dims())))
    }

    /// The candle UNet has no `add_embedding`, so `added` is not consumed and the
    /// scalar-timestep forward runs once per sample.
    fn predict_noise(
        &self,
        noisy_latents: &Tensor,
        timesteps: &Tensor,
        text: &TextConditioning,
        added: &AddedConditioning,
        deltas: &HashMap<String, Tensor>,
    ) -> Result<Tensor> {
        debug!(
            "added conditioning text_embeds {:?} time_ids {:?} (not used by this UNet)",
            added.text_embeds.dims(),
            added.time_ids.dims()
        );
        let unet = build_unet(&self.weights, deltas, self.dtype, &self.device)?;
        let context = text.hidden_states.to_dtype(self.dtype)?;
        let timesteps = timesteps.to_dtype(DType::I64)?.to_vec1::<i64>()?;

        let mut predictions = Vec::with_capacity(timesteps.len());
        for (i, &t) in timesteps.iter().enumerate() {
            let sample = noisy_latents.narrow(0, i, 1)?.to_dtype(self.dtype)?;
            let ctx = context.narrow(0, i, 1)?;
            predictions.push(unet.forward(&sample, t as f64, &ctx)?);
        }
        Ok(Tensor::cat(&predictions, 0)?)
    }
}

impl LatentEncoder for SdxlVae {
    fn encode(&self, pixels: &Tensor) -> Result<Tensor> {
        SdxlVae::encode(self, pixels)
    }
}

/// Loads the frozen SDXL components from diffusers-layout files
pub struct SdxlComponentLoader {
    paths: SdxlModelPaths,
}

impl SdxlComponentLoader {
    pub fn new(paths: SdxlModelPaths) -> Self {
        Self { paths }
    }
}

impl TrainingModelLoader for SdxlComponentLoader {
    fn load(&self, device: &Device, precision: Precision) -> Result<TrainingComponents> {
        self.paths.check_exists()?;
        let vae = SdxlVae::load(&self.paths.vae, device)?;
        let text = DualClipEncoder::load(&self.paths, device, precision.compute)?;
        let unet = SdxlDenoiser::load(&self.paths.unet, device, precision.compute)?;
        Ok(TrainingComponents {
            vae: Box::new(vae),
            text: Box::new(text),
            unet: Box::new(unet),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_weights_fail_before_reading() {
        let loader = SdxlComponentLoader::new(SdxlModelPaths {
            unet: "/nonexistent/unet.safetensors".into(),
            ..SdxlModelPaths::default()
        });
        let err = match loader.load(&Device::Cpu, Precision::for_device(&Device::Cpu)) {
            Ok(_) => panic!("loading from missing files must fail"),
            Err(e) => e,
        };
        assert!(format!("{:#}", err).contains("weights not found"));
    }
}

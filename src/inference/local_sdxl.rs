//! On-device SDXL rendering with candle.
//!
//! Candle has no ControlNet, so the structure reference steers generation as the
//! image-to-image source instead: a stronger conditioning scale keeps more of it.

use anyhow::{Context, Result};
use candle_core::safetensors::MmapedSafetensors;
use candle_core::{DType, Device, Tensor};
use candle_transformers::models::stable_diffusion::unet_2d::UNet2DConditionModel;
use image::imageops::FilterType;
use image::{DynamicImage, RgbImage, RgbaImage};
use log::info;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::collections::HashMap;

use super::ddim::DdimScheduler;
use super::{InferenceBackend, InferenceRequest};
use crate::config::LocalInferenceConfig;
use crate::device::Precision;
use crate::models::sdxl_unet::build_unet;
use crate::models::sdxl_vae::{image_to_tensor, tensor_to_image};
use crate::models::SdxlVae;
use crate::trainers::{gaussian_like, DualClipEncoder, LoraAdapter};

/// Latent size must survive three 2× downsamples of the 8× VAE grid
const SIZE_MULTIPLE: u32 = 64;

pub struct SdxlLocalBackend {
    text: DualClipEncoder,
    unet: UNet2DConditionModel,
    vae: SdxlVae,
    device: Device,
    dtype: DType,
    guidance_scale: f64,
}

impl SdxlLocalBackend {
    pub fn load(config: &LocalInferenceConfig, device: Device) -> Result<Self> {
        config.models.check_exists()?;
        let precision = Precision::for_device(&device);

        let text = DualClipEncoder::load(&config.models, &device, precision.compute)?;

        let deltas = match &config.lora_dir {
            Some(dir) => {
                let (adapter, lora) = LoraAdapter::load(dir, &device)
                    .with_context(|| format!("Failed to load LoRA adapter from {}", dir.display()))?;
                info!(
                    "Merging LoRA adapter {} (rank {}, {} layers) at scale {}",
                    dir.display(),
                    adapter.rank,
                    adapter.layers,
                    config.lora_scale
                );
                lora.frozen_weight_deltas(config.lora_scale)?
            }
            None => HashMap::new(),
        };

        info!("Loading SDXL UNet from: {}", config.models.unet.display());
        let base = unsafe { MmapedSafetensors::new(&config.models.unet)? };
        let unet = build_unet(&base, &deltas, precision.compute, &device)?;
        let vae = SdxlVae::load(&config.models.vae, &device)?;

        Ok(Self {
            text,
            unet,
            vae,
            device,
            dtype: precision.compute,
            guidance_scale: config.guidance_scale,
        })
    }
}

/// Fraction of the schedule re-noised from the source image
pub fn img2img_strength(conditioning_scale: f32) -> f64 {
    (1.0 - 0.5 * conditioning_scale as f64).clamp(0.05, 1.0)
}

fn round_up(value: u32, multiple: u32) -> u32 {
    ((value + multiple - 1) / multiple).max(1) * multiple
}

/// Drop alpha by blending onto white
fn flatten_on_white(image: &RgbaImage) -> RgbImage {
    RgbImage::from_fn(image.width(), image.height(), |x, y| {
        let p = image.get_pixel(x, y).0;
        let a = p[3] as u32;
        let blend = |c: u8| ((c as u32 * a + 255 * (255 - a) + 127) / 255) as u8;
        image::Rgb([blend(p[0]), blend(p[1]), blend(p[2])])
    })
}

impl InferenceBackend for SdxlLocalBackend {
    fn name(&self) -> &str {
        "local-sdxl"
    }

    fn generate(&mut self, request: &InferenceRequest<'_>) -> Result<Vec<DynamicImage>> {
        let (work_w, work_h) = (round_up(request.width, SIZE_MULTIPLE), round_up(request.height, SIZE_MULTIPLE));
        let source = match request.identity_image {
            Some(canvas) => flatten_on_white(canvas),
            None => request.control_signal.clone(),
        };
        let source = image::imageops::resize(&source, work_w, work_h, FilterType::Lanczos3);

        let cond = self.text.encode_prompt(&request.prompts.positive)?;
        let uncond = self.text.encode_prompt(&request.prompts.negative)?;
        let context = Tensor::cat(&[&uncond.hidden_states, &cond.hidden_states], 0)?.to_dtype(self.dtype)?;

        let scheduler = DdimScheduler::sdxl(request.steps)?;
        let strength = img2img_strength(request.conditioning_scale);
        let timesteps = scheduler.timesteps_for_strength(strength).to_vec();
        info!(
            "Rendering {}x{} locally: {} of {} steps (strength {:.2}), guidance {}",
            work_w,
            work_h,
            timesteps.len(),
            request.steps,
            strength,
            self.guidance_scale
        );

        let mut rng = match request.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let init_latents = self.vae.encode(&image_to_tensor(&source, &self.device)?)?;
        let noise = gaussian_like(&init_latents, &mut rng)?;
        let mut latents = scheduler.add_noise(&init_latents, &noise, timesteps[0])?;

        for &t in &timesteps {
            let input = Tensor::cat(&[&latents, &latents], 0)?.to_dtype(self.dtype)?;
            let pred = self.unet.forward(&input, t as f64, &context)?.to_dtype(DType::F32)?;
            let chunks = pred.chunk(2, 0)?;
            let (pred_uncond, pred_text) = (&chunks[0], &chunks[1]);
            let guided = (pred_uncond + ((pred_text - pred_uncond)? * self.guidance_scale)?)?;
            latents = scheduler.step(&guided, t, &latents)?;
        }

        let decoded = self.vae.decode(&latents)?;
        let mut image = tensor_to_image(&decoded)?;
        if image.width() != request.width || image.height() != request.height {
            image = image.resize_exact(request.width, request.height, FilterType::Lanczos3);
        }
        Ok(vec![image])
    }
}

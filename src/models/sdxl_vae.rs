use anyhow::{Context, Result};
use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::models::stable_diffusion::vae::{self, AutoEncoderKL};
use image::{DynamicImage, RgbImage};
use std::path::Path;

/// `vae.config.scaling_factor` of the SDXL autoencoder
pub const SDXL_VAE_SCALE: f64 = 0.13025;

/// SDXL autoencoder. Always F32; the F16 variant overflows on decode.
pub struct SdxlVae {
    vae: AutoEncoderKL,
    scale_factor: f64,
}

impl SdxlVae {
    pub fn new(vb: VarBuilder) -> Result<Self> {
        let config = vae::AutoEncoderKLConfig {
            block_out_channels: vec![128, 256, 512, 512],
            layers_per_block: 2,
            latent_channels: 4,
            norm_num_groups: 32,
            use_quant_conv: true,
            use_post_quant_conv: true,
        };
        let vae = AutoEncoderKL::new(vb, 3, 3, config)?;
        Ok(Self {
            vae,
            scale_factor: SDXL_VAE_SCALE,
        })
    }

    pub fn load(path: &Path, device: &Device) -> Result<Self> {
        let vb = unsafe { VarBuilder::from_mmaped_safetensors(&[path], DType::F32, device)? };
        Self::new(vb).with_context(|| format!("Failed to load VAE from {}", path.display()))
    }

    /// Pixels in [-1, 1] to scaled latents
    pub fn encode(&self, pixels: &Tensor) -> Result<Tensor> {
        let dist = self.vae.encode(&pixels.to_dtype(DType::F32)?)?;
        Ok((dist.sample()? * self.scale_factor)?)
    }

    /// Scaled latents to pixels in [-1, 1]
    pub fn decode(&self, latents: &Tensor) -> Result<Tensor> {
        let latents = (latents.to_dtype(DType::F32)? / self.scale_factor)?;
        Ok(self.vae.decode(&latents)?.clamp(-1f32, 1f32)?)
    }
}

/// `[1, 3, H, W]` in [-1, 1]
pub fn image_to_tensor(image: &RgbImage, device: &Device) -> Result<Tensor> {
    let (w, h) = (image.width() as usize, image.height() as usize);
    let tensor = Tensor::from_vec(image.as_raw().clone(), (h, w, 3), device)?
        .permute((2, 0, 1))?
        .to_dtype(DType::F32)?
        .affine(1.0 / 127.5, -1.0)?
        .unsqueeze(0)?;
    Ok(tensor)
}

/// `[3, H, W]` (or `[1, 3, H, W]`) in [-1, 1] back to an RGB image
pub fn tensor_to_image(tensor: &Tensor) -> Result<DynamicImage> {
    let tensor = if tensor.rank() == 4 { tensor.squeeze(0)? } else { tensor.clone() };
    let (channels, h, w) = tensor.dims3()?;
    anyhow::ensure!(channels == 3, "expected 3 channels, got {}", channels);
    let pixels = ((tensor.to_dtype(DType::F32)?.clamp(-1f32, 1f32)? + 1.0)? * 127.5)?
        .round()?
        .to_dtype(DType::U8)?
        .permute((1, 2, 0))?
        .flatten_all()?
        .to_vec1::<u8>()?;
    let image = RgbImage::from_raw(w as u32, h as u32, pixels).context("pixel buffer size mismatch")?;
    Ok(DynamicImage::ImageRgb8(image))
}

//! DDPM noise schedule for adapter training

use anyhow::{ensure, Result};
use candle_core::{DType, Device, Tensor};
use rand::Rng;

pub const SDXL_TRAIN_TIMESTEPS: usize = 1000;
pub const SDXL_BETA_START: f32 = 0.00085;
pub const SDXL_BETA_END: f32 = 0.012;

pub struct DDPMScheduler {
    num_timesteps: usize,
    sqrt_alphas_cumprod: Tensor,
    sqrt_one_minus_alphas_cumprod: Tensor,
}

impl DDPMScheduler {
    /// Scaled-linear schedule: betas interpolated linearly in sqrt space
    pub fn scaled_linear(num_timesteps: usize, beta_start: f32, beta_end: f32, device: &Device) -> Result<Self> {
        ensure!(num_timesteps > 1, "need at least two diffusion timesteps");
        let start = beta_start.sqrt();
        let end = beta_end.sqrt();

        let mut alphas_cumprod = Vec::with_capacity(num_timesteps);
        let mut cumprod = 1.0f32;
        for i in 0..num_timesteps {
            let t = start + (end - start) * (i as f32) / (num_timesteps as f32 - 1.0);
            cumprod *= 1.0 - t * t;
            alphas_cumprod.push(cumprod);
        }
        let alphas_cumprod = Tensor::from_vec(alphas_cumprod, num_timesteps, device)?;

        Ok(Self {
            num_timesteps,
            sqrt_alphas_cumprod: alphas_cumprod.sqrt()?,
            sqrt_one_minus_alphas_cumprod: (1.0 - &alphas_cumprod)?.sqrt()?,
        })
    }

    pub fn sdxl(device: &Device) -> Result<Self> {
        Self::scaled_linear(SDXL_TRAIN_TIMESTEPS, SDXL_BETA_START, SDXL_BETA_END, device)
    }

    /// `sqrt(ᾱ_t) · x0 + sqrt(1 - ᾱ_t) · ε`, per sample
    pub fn add_noise(&self, original_samples: &Tensor, noise: &Tensor, timesteps: &Tensor) -> Result<Tensor> {
        let batch_size = timesteps.dims1()?;
        let timesteps = timesteps.to_dtype(DType::I64)?;

        // [B] -> [B, 1, 1, 1] to broadcast over [B, C, H, W]
        let sqrt_alpha_prod = self
            .sqrt_alphas_cumprod
            .index_select(&timesteps, 0)?
            .reshape((batch_size, 1, 1, 1))?
            .to_dtype(original_samples.dtype())?;
        let sqrt_one_minus_alpha_prod = self
            .sqrt_one_minus_alphas_cumprod
            .index_select(&timesteps, 0)?
            .reshape((batch_size, 1, 1, 1))?
            .to_dtype(original_samples.dtype())?;

        let scaled_original = sqrt_alpha_prod.broadcast_mul(original_samples)?;
        let scaled_noise = sqrt_one_minus_alpha_prod.broadcast_mul(noise)?;
        Ok((scaled_original + scaled_noise)?)
    }

    /// Uniform random timestep per sample
    pub fn sample_timesteps<R: Rng>(&self, batch_size: usize, rng: &mut R, device: &Device) -> Result<Tensor> {
        let timesteps: Vec<i64> = (0..batch_size)
            .map(|_| rng.gen_range(0..self.num_timesteps) as i64)
            .collect();
        Ok(Tensor::from_vec(timesteps, batch_size, device)?)
    }

    pub fn num_train_timesteps(&self) -> usize {
        self.num_timesteps
    }
}

//! Deterministic DDIM sampler (eta = 0, epsilon prediction) with an
//! image-to-image entry point.

use anyhow::{ensure, Result};
use candle_core::Tensor;

pub struct DdimScheduler {
    timesteps: Vec<usize>,
    alphas_cumprod: Vec<f64>,
    step_ratio: usize,
}

impl DdimScheduler {
    /// Scaled-linear betas over `num_train_timesteps`, matching SDXL training
    pub fn new(num_inference_steps: usize, num_train_timesteps: usize, beta_start: f64, beta_end: f64) -> Result<Self> {
        ensure!(num_inference_steps > 0, "need at least one inference step");
        ensure!(
            num_inference_steps <= num_train_timesteps,
            "{} inference steps exceed {} training timesteps",
            num_inference_steps,
            num_train_timesteps
        );

        let start = beta_start.sqrt();
        let end = beta_end.sqrt();
        let mut alphas_cumprod = Vec::with_capacity(num_train_timesteps);
        let mut cumprod = 1.0;
        for i in 0..num_train_timesteps {
            let beta = start + (end - start) * (i as f64) / (num_train_timesteps as f64 - 1.0);
            cumprod *= 1.0 - beta * beta;
            alphas_cumprod.push(cumprod);
        }

        let step_ratio = num_train_timesteps / num_inference_steps;
        let timesteps = (0..num_inference_steps)
            .map(|i| (num_inference_steps - 1 - i) * step_ratio)
            .collect();

        Ok(Self {
            timesteps,
            alphas_cumprod,
            step_ratio,
        })
    }

    pub fn sdxl(num_inference_steps: usize) -> Result<Self> {
        Self::new(num_inference_steps, 1000, 0.00085, 0.012)
    }

    pub fn timesteps(&self) -> &[usize] {
        &self.timesteps
    }

    /// Trailing part of the schedule for image-to-image at `strength` in (0, 1]
    pub fn timesteps_for_strength(&self, strength: f64) -> &[usize] {
        let total = self.timesteps.len();
        let keep = ((total as f64 * strength.clamp(0.0, 1.0)).round() as usize).clamp(1, total);
        &self.timesteps[total - keep..]
    }

    /// Forward diffusion of clean latents to `timestep`
    pub fn add_noise(&self, original: &Tensor, noise: &Tensor, timestep: usize) -> Result<Tensor> {
        let alpha_prod = self.alphas_cumprod[timestep];
        Ok(((original * alpha_prod.sqrt())? + (noise * (1.0 - alpha_prod).sqrt())?)?)
    }

    pub fn step(&self, model_output: &Tensor, timestep: usize, sample: &Tensor) -> Result<Tensor> {
        let alpha_prod_t = self.alphas_cumprod[timestep];
        let alpha_prod_t_prev = if timestep >= self.step_ratio {
            self.alphas_cumprod[timestep - self.step_ratio]
        } else {
            1.0
        };

        // x_0 = (x_t - sqrt(1 - a_t) * eps) / sqrt(a_t)
        let pred_original = ((sample - (model_output * (1.0 - alpha_prod_t).sqrt())?)? / alpha_prod_t.sqrt())?;
        let direction = (model_output * (1.0 - alpha_prod_t_prev).sqrt())?;
        Ok(((pred_original * alpha_prod_t_prev.sqrt())? + direction)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    #[test]
    fn test_timesteps_descend_evenly() -> Result<()> {
        let scheduler = DdimScheduler::sdxl(4)?;
        assert_eq!(scheduler.timesteps(), &[750, 500, 250, 0]);
        assert_eq!(scheduler.timesteps_for_strength(0.5), &[250, 0]);
        assert_eq!(scheduler.timesteps_for_strength(0.0), &[0]);
        assert_eq!(scheduler.timesteps_for_strength(1.0).len(), 4);
        Ok(())
    }

    #[test]
    fn test_perfect_prediction_recovers_sample() -> Result<()> {
        let device = Device::Cpu;
        let scheduler = DdimScheduler::sdxl(10)?;
        let clean = Tensor::ones((1, 4, 2, 2), DType::F32, &device)?;
        let noise = Tensor::full(0.5f32, (1, 4, 2, 2), &device)?;
        let t = scheduler.timesteps()[scheduler.timesteps().len() - 1];
        let noisy = scheduler.add_noise(&clean, &noise, t)?;
        let denoised = scheduler.step(&noise, t, &noisy)?;
        let diff = (denoised - clean)?.abs()?.flatten_all()?.max(0)?.to_scalar::<f32>()?;
        assert!(diff < 1e-4);
        Ok(())
    }
}

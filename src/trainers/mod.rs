//! LoRA fine-tuning of the SDXL denoiser on a captioned image folder.
//!
//! The loop only sees three capabilities ([`LatentEncoder`], [`PromptEncoder`],
//! [`Denoiser`]) produced by a [`TrainingModelLoader`]. The loader is called only
//! after the dataset has been scanned and decoded, so an empty dataset never
//! touches the model weights.

pub mod captions;
pub mod dataset;
pub mod ddpm_scheduler;
pub mod lora;
pub mod sdxl_forward_with_lora;
pub mod text_encoders;

pub use crate::models::AttentionProjection;
pub use captions::{generate_captions, CaptionPolicy};
pub use dataset::TrainingDataset;
pub use ddpm_scheduler::DDPMScheduler;
pub use lora::{AdapterConfig, LoraAdapter, LoraCollection};
pub use sdxl_forward_with_lora::{SdxlComponentLoader, SdxlDenoiser};
pub use text_encoders::DualClipEncoder;

use anyhow::{ensure, Result};
use candle_core::{DType, Device, Tensor};
use candle_nn::{AdamW, Optimizer, ParamsAdamW};
use log::{debug, info};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;
use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Instant;

use crate::config::TrainingConfig;
use crate::device::{DeviceLease, Precision};
use crate::error::AdGenError;
use crate::models::TimeIdsConfig;

/// Caption conditioning: `[B, 77, 2048]` context and `[B, D]` pooled embedding
pub struct TextConditioning {
    pub hidden_states: Tensor,
    pub pooled: Tensor,
}

/// SDXL added conditioning (`text_embeds`, `time_ids`)
pub struct AddedConditioning {
    pub text_embeds: Tensor,
    pub time_ids: Tensor,
}

/// Pixels in [-1, 1] to scaled latents. Frozen.
pub trait LatentEncoder {
    fn encode(&self, pixels: &Tensor) -> Result<Tensor>;
}

/// Captions to conditioning. Frozen.
pub trait PromptEncoder {
    fn encode(&self, captions: &[String]) -> Result<TextConditioning>;
}

/// Noise predictor whose attention projections can take adapter deltas.
/// Base weights stay frozen; `deltas` (keyed `{module}.weight`) are added to them
/// for this call and are the only path gradients take.
pub trait Denoiser {
    fn attention_projections(&self) -> Vec<AttentionProjection>;

    fn predict_noise(
        &self,
        noisy_latents: &Tensor,
        timesteps: &Tensor,
        text: &TextConditioning,
        added: &AddedConditioning,
        deltas: &HashMap<String, Tensor>,
    ) -> Result<Tensor>;
}

pub struct TrainingComponents {
    pub vae: Box<dyn LatentEncoder>,
    pub text: Box<dyn PromptEncoder>,
    pub unet: Box<dyn Denoiser>,
}

/// Loads the frozen base model. Expensive; the trainer calls it at most once.
pub trait TrainingModelLoader {
    fn load(&self, device: &Device, precision: Precision) -> Result<TrainingComponents>;
}

#[derive(Debug, Clone)]
pub struct TrainingOptions {
    pub dataset_dir: PathBuf,
    pub output_dir: PathBuf,
    pub epochs: usize,
    pub batch_size: usize,
    pub rank: usize,
    /// Defaults to `rank`
    pub alpha: Option<f32>,
    pub learning_rate: f64,
    pub resolution: u32,
    pub log_every: usize,
    pub seed: Option<u64>,
    pub caption_policy: CaptionPolicy,
    pub target_modules: Vec<String>,
    pub save_dtype: DType,
    pub base_model: Option<String>,
}

impl TrainingOptions {
    pub fn new(
        dataset_dir: impl Into<PathBuf>,
        output_dir: impl Into<PathBuf>,
        epochs: usize,
        batch_size: usize,
        rank: usize,
    ) -> Self {
        Self::from_config(&TrainingConfig::default(), dataset_dir, output_dir, epochs, batch_size, rank)
    }

    pub fn from_config(
        config: &TrainingConfig,
        dataset_dir: impl Into<PathBuf>,
        output_dir: impl Into<PathBuf>,
        epochs: usize,
        batch_size: usize,
        rank: usize,
    ) -> Self {
        Self {
            dataset_dir: dataset_dir.into(),
            output_dir: output_dir.into(),
            epochs,
            batch_size,
            rank,
            alpha: config.alpha,
            learning_rate: config.learning_rate,
            resolution: config.resolution,
            log_every: config.log_every,
            seed: config.seed,
            caption_policy: CaptionPolicy::from_trigger(config.trigger_word.as_deref()),
            target_modules: config.target_modules.clone(),
            save_dtype: config.save_dtype.dtype(),
            base_model: config.base_model.name.clone(),
        }
    }

    pub fn alpha(&self) -> f32 {
        self.alpha.unwrap_or(self.rank as f32)
    }

    pub fn validate(&self) -> crate::error::Result<()> {
        if self.epochs == 0 {
            return Err(AdGenError::config("epochs must be at least 1"));
        }
        if self.batch_size == 0 {
            return Err(AdGenError::config("batch size must be at least 1"));
        }
        if self.rank == 0 {
            return Err(AdGenError::config("LoRA rank must be at least 1"));
        }
        if !(self.alpha() > 0.0) {
            return Err(AdGenError::config("LoRA alpha must be positive"));
        }
        if !(self.learning_rate > 0.0) {
            return Err(AdGenError::config("learning rate must be positive"));
        }
        if self.resolution == 0 || self.resolution % 8 != 0 {
            return Err(AdGenError::config(format!(
                "resolution must be a positive multiple of 8, got {}",
                self.resolution
            )));
        }
        if self.log_every == 0 {
            return Err(AdGenError::config("log interval must be at least 1"));
        }
        if self.target_modules.is_empty() {
            return Err(AdGenError::config("no LoRA target modules given"));
        }
        Ok(())
    }
}

/// Outcome of a finished run
#[derive(Debug, Clone, Serialize)]
pub struct TrainingRun {
    pub adapter: LoraAdapter,
    pub epochs: usize,
    pub batch_size: usize,
    pub rank: usize,
    pub samples: usize,
    pub steps: usize,
    pub loss_history: Vec<f32>,
    pub elapsed_secs: f64,
}

pub struct LoraTrainer {
    options: TrainingOptions,
    lease: DeviceLease,
}

impl LoraTrainer {
    pub fn new(options: TrainingOptions) -> Self {
        Self {
            options,
            lease: DeviceLease::new(),
        }
    }

    /// Share the lease of an inference handle so the two never overlap on a device
    pub fn with_lease(mut self, lease: DeviceLease) -> Self {
        self.lease = lease;
        self
    }

    pub fn options(&self) -> &TrainingOptions {
        &self.options
    }

    pub fn run(&self, loader: &dyn TrainingModelLoader, device: &Device) -> crate::error::Result<TrainingRun> {
        let opts = &self.options;
        opts.validate()?;

        info!("Loading dataset from {}...", opts.dataset_dir.display());
        let dataset = TrainingDataset::load(&opts.dataset_dir, opts.resolution, &opts.caption_policy)?;

        let _guard = self.lease.acquire();
        let start = Instant::now();
        let precision = Precision::for_device(device);
        info!(
            "Loading base model (compute {:?}, vae {:?})...",
            precision.compute, precision.vae
        );
        let components = loader.load(device, precision).map_err(AdGenError::Training)?;

        let (lora, loss_history) = self
            .fit(&dataset, &components, device, precision)
            .map_err(AdGenError::Training)?;

        info!("Saving LoRA weights to {}...", opts.output_dir.display());
        let config = AdapterConfig::new(
            opts.rank,
            opts.alpha(),
            opts.target_modules.clone(),
            opts.base_model.clone(),
        );
        lora.save(&opts.output_dir, &config, opts.save_dtype)
            .map_err(AdGenError::Training)?;
        info!("LoRA fine-tuning complete.");

        let adapter = LoraAdapter {
            path: opts.output_dir.clone(),
            rank: opts.rank,
            alpha: opts.alpha(),
            target_modules: opts.target_modules.clone(),
            layers: lora.len(),
            steps: loss_history.len(),
            final_loss: loss_history.last().copied(),
        };
        Ok(TrainingRun {
            adapter,
            epochs: opts.epochs,
            batch_size: opts.batch_size,
            rank: opts.rank,
            samples: dataset.len(),
            steps: loss_history.len(),
            loss_history,
            elapsed_secs: start.elapsed().as_secs_f64(),
        })
    }

    fn fit(
        &self,
        dataset: &TrainingDataset,
        components: &TrainingComponents,
        device: &Device,
        precision: Precision,
    ) -> Result<(LoraCollection, Vec<f32>)> {
        let opts = &self.options;
        let mut rng = match opts.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        let projections = components.unet.attention_projections();
        let lora = LoraCollection::for_projections(
            &projections,
            &opts.target_modules,
            opts.rank,
            opts.alpha(),
            &mut rng,
            device,
        )?;
        ensure!(
            !lora.is_empty(),
            "no attention projection matches target modules {:?}",
            opts.target_modules
        );
        info!(
            "Attached rank-{} adapters to {}/{} attention projections ({} trainable parameters)",
            opts.rank,
            lora.len(),
            projections.len(),
            lora.num_parameters()
        );

        let params = ParamsAdamW {
            lr: opts.learning_rate,
            ..Default::default()
        };
        let mut optimizer = AdamW::new(lora.vars(), params)?;
        let scheduler = DDPMScheduler::sdxl(device)?;
        let time_ids = TimeIdsConfig::training_default();

        let steps_per_epoch = (dataset.len() + opts.batch_size - 1) / opts.batch_size;
        info!(
            "Starting training loop ({} images, {} epochs, {} steps per epoch)...",
            dataset.len(),
            opts.epochs,
            steps_per_epoch
        );

        #[cfg(feature = "progress-bar")]
        let progress = {
            let bar = indicatif::ProgressBar::new((steps_per_epoch * opts.epochs) as u64);
            if let Ok(style) =
                indicatif::ProgressStyle::with_template("{bar:40} {pos}/{len} [{elapsed_precise}] {msg}")
            {
                bar.set_style(style);
            }
            bar
        };

        let mut order: Vec<usize> = (0..dataset.len()).collect();
        let mut loss_history = Vec::with_capacity(steps_per_epoch * opts.epochs);
        for epoch in 0..opts.epochs {
            info!("Epoch {}/{} started.", epoch + 1, opts.epochs);
            order.shuffle(&mut rng);

            for (step, batch) in order.chunks(opts.batch_size).enumerate() {
                let (pixels, captions) = dataset.batch(batch, device)?;
                let latents = components.vae.encode(&pixels)?.to_dtype(DType::F32)?.detach();
                let noise = gaussian_like(&latents, &mut rng)?;
                let timesteps = scheduler.sample_timesteps(batch.len(), &mut rng, device)?;
                let noisy_latents = scheduler
                    .add_noise(&latents, &noise, &timesteps)?
                    .to_dtype(precision.compute)?;

                let text = components.text.encode(&captions)?;
                let added = AddedConditioning {
                    text_embeds: text.pooled.clone(),
                    time_ids: time_ids.batch(batch.len(), device, precision.compute)?,
                };

                let deltas = lora.weight_deltas()?;
                let pred = components
                    .unet
                    .predict_noise(&noisy_latents, &timesteps, &text, &added, &deltas)?;
                let loss = candle_nn::loss::mse(&pred.to_dtype(DType::F32)?, &noise)?;
                let loss_value = loss.to_scalar::<f32>()?;
                ensure!(
                    loss_value.is_finite(),
                    "loss became {} at epoch {} step {}",
                    loss_value,
                    epoch,
                    step
                );
                optimizer.backward_step(&loss)?;
                loss_history.push(loss_value);

                if step % opts.log_every == 0 {
                    info!("Epoch {} Step {} Loss: {:.4}", epoch, step, loss_value);
                }
                debug!("captions: {:?}", captions);

                #[cfg(feature = "progress-bar")]
                {
                    progress.set_message(format!("loss {:.4}", loss_value));
                    progress.inc(1);
                }
            }
        }

        #[cfg(feature = "progress-bar")]
        progress.finish_and_clear();

        Ok((lora, loss_history))
    }
}

/// Train with a private lease and return the persisted adapter
pub fn train(
    options: &TrainingOptions,
    loader: &dyn TrainingModelLoader,
    device: &Device,
) -> crate::error::Result<LoraAdapter> {
    Ok(LoraTrainer::new(options.clone()).run(loader, device)?.adapter)
}

/// Standard-normal noise shaped like `like`, drawn from `rng`
pub(crate) fn gaussian_like<R: Rng>(like: &Tensor, rng: &mut R) -> Result<Tensor> {
    let values: Vec<f32> = (0..like.elem_count())
        .map(|_| rng.sample::<f32, _>(StandardNormal))
        .collect();
    Ok(Tensor::from_vec(values, like.shape().clone(), like.device())?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use image::{Rgb, RgbImage};
    use std::cell::Cell;
    use std::sync::{Arc, Mutex};

    struct PoolingEncoder;

    impl LatentEncoder for PoolingEncoder {
        fn encode(&self, pixels: &Tensor) -> Result<Tensor> {
            let pooled = pixels.avg_pool2d(8)?;
            let mean = pooled.mean_keepdim(1)?;
            Ok(Tensor::cat(&[&pooled, &mean], 1)?)
        }
    }

    struct ConstantText {
        seen: Arc<Mutex<Vec<String>>>,
    }

    impl PromptEncoder for ConstantText {
        fn encode(&self, captions: &[String]) -> Result<TextConditioning> {
            if let Ok(mut seen) = self.seen.lock() {
                seen.extend(captions.iter().cloned());
            }
            let b = captions.len();
            Ok(TextConditioning {
                hidden_states: Tensor::ones((b, 77, 8), DType::F32, &Device::Cpu)?,
                pooled: Tensor::ones((b, 8), DType::F32, &Device::Cpu)?,
            })
        }
    }

    /// Per-pixel channel mix through one adaptable 4×4 projection
    struct TinyDenoiser {
        weight: Tensor,
    }

    const TINY_MODULE: &str = "mid.attn1.to_q";

    impl Denoiser for TinyDenoiser {
        fn attention_projections(&self) -> Vec<AttentionProjection> {
            vec![AttentionProjection::new(TINY_MODULE, 4, 4)]
        }

        fn predict_noise(
            &self,
            noisy_latents: &Tensor,
            _timesteps: &Tensor,
            _text: &TextConditioning,
            _added: &AddedConditioning,
            deltas: &HashMap<String, Tensor>,
        ) -> Result<Tensor> {
            let weight = match deltas.get(&format!("{}.weight", TINY_MODULE)) {
                Some(delta) => self.weight.add(delta)?,
                None => self.weight.clone(),
            };
            let (b, c, h, w) = noisy_latents.dims4()?;
            let flat = noisy_latents.permute((0, 2, 3, 1))?.reshape((b * h * w, c))?;
            let mixed = flat.matmul(&weight.t()?)?;
            Ok(mixed.reshape((b, h, w, c))?.permute((0, 3, 1, 2))?)
        }
    }

    struct FakeLoader {
        calls: Cell<usize>,
        seen: Arc<Mutex<Vec<String>>>,
    }

    impl FakeLoader {
        fn new() -> Self {
            Self {
                calls: Cell::new(0),
                seen: Arc::new(Mutex::new(Vec::new())),
            }
        }
    }

    impl TrainingModelLoader for FakeLoader {
        fn load(&self, _device: &Device, _precision: Precision) -> Result<TrainingComponents> {
            self.calls.set(self.calls.get() + 1);
            Ok(TrainingComponents {
                vae: Box::new(PoolingEncoder),
                text: Box::new(ConstantText {
                    seen: Arc::clone(&self.seen),
                }),
                unet: Box::new(TinyDenoiser {
                    weight: Tensor::from_vec(
                        (0..16).map(|i| if i % 5 == 0 { 1f32 } else { 0f32 }).collect::<Vec<_>>(),
                        (4, 4),
                        &Device::Cpu,
                    )?,
                }),
            })
        }
    }

    fn tiny_options(dataset: &std::path::Path, output: &std::path::Path) -> TrainingOptions {
        let mut options = TrainingOptions::new(dataset, output, 2, 1, 4);
        options.resolution = 16;
        options.seed = Some(7);
        options.log_every = 1;
        options
    }

    #[test]
    fn test_empty_dataset_never_loads_model() -> Result<()> {
        let dataset = tempfile::tempdir()?;
        let output = tempfile::tempdir()?;
        let loader = FakeLoader::new();

        let err = train(&tiny_options(dataset.path(), output.path()), &loader, &Device::Cpu).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::EmptyDataset);
        assert_eq!(loader.calls.get(), 0);

        let missing = dataset.path().join("missing");
        let err = train(&tiny_options(&missing, output.path()), &loader, &Device::Cpu).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::EmptyDataset);
        assert_eq!(loader.calls.get(), 0);
        Ok(())
    }

    #[test]
    fn test_uncaptioned_sample_trains_with_empty_caption() -> Result<()> {
        crate::logging::try_init_test_logger();
        let dataset = tempfile::tempdir()?;
        let output = tempfile::tempdir()?;
        RgbImage::from_fn(24, 20, |x, y| Rgb([(x * 10) as u8, (y * 12) as u8, 128]))
            .save(dataset.path().join("jacket_01.png"))?;
        let loader = FakeLoader::new();

        let run = LoraTrainer::new(tiny_options(dataset.path(), output.path())).run(&loader, &Device::Cpu)?;

        assert_eq!(loader.calls.get(), 1);
        assert_eq!(run.samples, 1);
        assert_eq!(run.steps, 2);
        assert!(run.loss_history.iter().all(|l| l.is_finite()));
        assert_eq!(*loader.seen.lock().map_err(|_| anyhow::anyhow!("poisoned"))?, vec![String::new(), String::new()]);

        assert!(run.adapter.weights_path().is_file());
        let (adapter, collection) = LoraAdapter::load(output.path(), &Device::Cpu)?;
        assert_eq!(adapter.rank, 4);
        assert_eq!(adapter.alpha, 4.0);
        assert_eq!(collection.len(), 1);
        let layer = collection.get(TINY_MODULE).ok_or_else(|| anyhow::anyhow!("layer missing"))?;
        assert_eq!(layer.down.dims(), &[4, 4]);
        // the up projection starts at zero and must have moved
        let up_norm = layer.up.as_tensor().sqr()?.sum_all()?.to_scalar::<f32>()?;
        assert!(up_norm > 0.0);
        Ok(())
    }

    #[test]
    fn test_unmatched_targets_fail_as_training_error() -> Result<()> {
        let dataset = tempfile::tempdir()?;
        let output = tempfile::tempdir()?;
        RgbImage::from_pixel(16, 16, Rgb([200, 10, 10])).save(dataset.path().join("vest.png"))?;
        let mut options = tiny_options(dataset.path(), output.path());
        options.target_modules = vec!["proj_in".to_string()];

        let err = train(&options, &FakeLoader::new(), &Device::Cpu).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Training);
        Ok(())
    }

    #[test]
    fn test_invalid_options_are_configuration_errors() {
        let loader = FakeLoader::new();
        for (epochs, batch, rank) in [(0, 1, 4), (1, 0, 4), (1, 1, 0)] {
            let options = TrainingOptions::new("data", "out", epochs, batch, rank);
            let err = train(&options, &loader, &Device::Cpu).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Configuration);
        }
        assert_eq!(loader.calls.get(), 0);
    }
}

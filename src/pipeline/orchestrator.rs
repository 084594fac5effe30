//! Runs one request through every stage, in order, with per-stage timing.
//!
//! A failure stops the run and is reported with the stage that was being
//! attempted. The inference handle is shared and serialises device access.

use image::imageops::FilterType;
use image::{DynamicImage, ImageOutputFormat};
use log::{debug, error, info, warn};
use std::io::Cursor;
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::capabilities::{
    BackgroundRemover, BorderKeyRemover, IdentityCorrector, PassthroughRemover, StyleCorrector,
    ToneCorrector,
};
use super::storage::{LocalObjectStore, ObjectStore};
use super::{GenerationRequest, GenerationResult, OutputFormat, Stage, StageTimings};
use crate::config::{Config, CorrectorKind, GenerationConfig, RemoverKind};
use crate::error::{AdGenError, PipelineError, Result};
use crate::imaging::canvas::{CanvasSpec, DEFAULT_EDGE_MARGIN};
use crate::imaging::{compose, decode_image, extract_control_signal, CannyThresholds};
use crate::inference::{InferenceRequest, SharedInference};
use crate::styles::StyleRegistry;

/// Per-deployment knobs that requests do not override
#[derive(Debug, Clone)]
pub struct GenerationSettings {
    pub thresholds: CannyThresholds,
    pub edge_margin: f64,
    pub output_format: OutputFormat,
    pub jpeg_quality: u8,
    pub key_prefix: String,
}

impl Default for GenerationSettings {
    fn default() -> Self {
        Self {
            thresholds: CannyThresholds::default(),
            edge_margin: DEFAULT_EDGE_MARGIN,
            output_format: OutputFormat::Jpeg,
            jpeg_quality: 95,
            key_prefix: "ai_generated".to_string(),
        }
    }
}

impl GenerationSettings {
    pub fn from_config(config: &GenerationConfig) -> Result<Self> {
        Ok(Self {
            thresholds: CannyThresholds::new(config.canny_low, config.canny_high)?,
            edge_margin: config.edge_margin,
            output_format: config.output_format,
            jpeg_quality: config.jpeg_quality,
            key_prefix: config.key_prefix.trim_matches('/').to_string(),
        })
    }
}

pub struct Orchestrator {
    styles: StyleRegistry,
    inference: Arc<SharedInference>,
    remover: Box<dyn BackgroundRemover>,
    corrector: Box<dyn StyleCorrector>,
    store: Option<Arc<dyn ObjectStore>>,
    settings: GenerationSettings,
}

impl Orchestrator {
    /// Passthrough removal, identity correction, no storage
    pub fn new(styles: StyleRegistry, inference: Arc<SharedInference>, settings: GenerationSettings) -> Self {
        Self {
            styles,
            inference,
            remover: Box::new(PassthroughRemover),
            corrector: Box::new(IdentityCorrector),
            store: None,
            settings,
        }
    }

    pub fn from_config(config: &Config, inference: Arc<SharedInference>) -> Result<Self> {
        let styles = StyleRegistry::with_profiles(&config.styles)?;
        let settings = GenerationSettings::from_config(&config.generation)?;
        let remover: Box<dyn BackgroundRemover> = match config.generation.remover {
            RemoverKind::Passthrough => Box::new(PassthroughRemover),
            RemoverKind::BorderKey => Box::new(BorderKeyRemover::default()),
        };
        let corrector: Box<dyn StyleCorrector> = match config.generation.corrector {
            CorrectorKind::Identity => Box::new(IdentityCorrector),
            CorrectorKind::Tone => Box::new(ToneCorrector),
        };

        let mut orchestrator = Self::new(styles, inference, settings)
            .with_remover(remover)
            .with_corrector(corrector);
        if let Some(root) = &config.storage.root {
            orchestrator = orchestrator.with_store(Arc::new(LocalObjectStore::new(
                root,
                config.storage.public_base_url.clone(),
            )));
        }
        Ok(orchestrator)
    }

    pub fn with_remover(mut self, remover: Box<dyn BackgroundRemover>) -> Self {
        self.remover = remover;
        self
    }

    pub fn with_corrector(mut self, corrector: Box<dyn StyleCorrector>) -> Self {
        self.corrector = corrector;
        self
    }

    pub fn with_store(mut self, store: Arc<dyn ObjectStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn styles(&self) -> &StyleRegistry {
        &self.styles
    }

    pub fn settings(&self) -> &GenerationSettings {
        &self.settings
    }

    pub fn generate(&self, request: &GenerationRequest) -> std::result::Result<GenerationResult, PipelineError> {
        let run_start = Instant::now();
        let mut timings = StageTimings::default();

        let product = timed(Stage::Received, &mut timings, || {
            request.validate()?;
            decode_image(&request.product_image)
        })?;
        let style_key = self.styles.resolve_key(&request.style_key).to_string();
        let profile = self.styles.get_profile(&style_key);
        info!(
            "Generating '{}' ({}) from {}x{} product",
            style_key,
            request.aspect_ratio,
            product.width(),
            product.height()
        );

        let cutout = timed(Stage::BackgroundRemoved, &mut timings, || {
            debug!("background removal with {}", self.remover.name());
            self.remover
                .remove_background(&product)
                .map_err(AdGenError::BackgroundRemoval)
        })?;

        let corrected = timed(Stage::StyleCorrected, &mut timings, || {
            debug!("style correction with {}", self.corrector.name());
            Ok(self.corrector.correct(&cutout, &style_key))
        })?;

        let (width, height) = request.aspect_ratio.dimensions();
        let spec = CanvasSpec::new(width, height, request.padding_percent, request.vertical_alignment)
            .with_edge_margin(self.settings.edge_margin);
        let (canvas, placement) = timed(Stage::Composed, &mut timings, || compose(&corrected, spec))?;

        let control_signal = timed(Stage::ControlSignalReady, &mut timings, || {
            Ok(extract_control_signal(
                &DynamicImage::ImageRgba8(canvas.clone()),
                self.settings.thresholds,
            ))
        })?;

        let prompts = self.styles.resolve_prompt_pair(
            &style_key,
            request.prompt_extra.as_deref(),
            request.negative_prompt_extra.as_deref(),
        );
        let conditioning_scale = request.conditioning_scale.unwrap_or(profile.conditioning_scale);
        let inference_request = InferenceRequest {
            prompts: &prompts,
            control_signal: &control_signal,
            identity_image: request.use_identity_conditioning.then_some(&canvas),
            width,
            height,
            conditioning_scale,
            steps: request.inference_steps,
            seed: request.seed,
        };
        let image = timed(Stage::Inferred, &mut timings, || {
            let mut outputs = self
                .inference
                .generate(&inference_request)
                .map_err(AdGenError::InferenceBackend)?;
            if outputs.is_empty() {
                return Err(AdGenError::InferenceEmptyResult);
            }
            if outputs.len() > 1 {
                debug!("backend returned {} images, keeping the first", outputs.len());
            }
            let image = outputs.swap_remove(0);
            if image.width() != width || image.height() != height {
                warn!(
                    "backend returned {}x{}, resizing to {}x{}",
                    image.width(),
                    image.height(),
                    width,
                    height
                );
                return Ok(image.resize_exact(width, height, FilterType::Lanczos3));
            }
            Ok(image)
        })?;

        let format = request.output_format.unwrap_or(self.settings.output_format);
        let bytes = timed(Stage::Encoded, &mut timings, || {
            encode_image(&image, format, self.settings.jpeg_quality)
        })?;

        let stored_url = match &self.store {
            Some(store) => {
                let key = object_key(&self.settings.key_prefix, &style_key, format);
                let url = timed(Stage::Stored, &mut timings, || {
                    store
                        .put(&bytes, &key, format.content_type())
                        .map_err(AdGenError::Storage)
                })?;
                info!("Stored result at {}", url);
                Some(url)
            }
            None => {
                debug!("no object store configured, result not persisted");
                None
            }
        };

        timings.record(Stage::Done, run_start.elapsed());
        info!("Timing breakdown: {}", timings.breakdown());

        Ok(GenerationResult {
            width: image.width(),
            height: image.height(),
            image,
            bytes,
            format,
            style_key,
            prompts,
            conditioning_scale,
            placement,
            canvas,
            control_signal,
            timings,
            stored_url,
        })
    }
}

/// Run one stage, record its duration on success, tag the error on failure
fn timed<T>(
    stage: Stage,
    timings: &mut StageTimings,
    work: impl FnOnce() -> Result<T>,
) -> std::result::Result<T, PipelineError> {
    let start = Instant::now();
    let outcome = work();
    let elapsed: Duration = start.elapsed();
    match outcome {
        Ok(value) => {
            timings.record(stage, elapsed);
            info!("{} in {:.3}s", stage, elapsed.as_secs_f64());
            Ok(value)
        }
        Err(e) => {
            error!("{} failed after {:.3}s: {}", stage, elapsed.as_secs_f64(), e);
            Err(PipelineError::new(stage, e))
        }
    }
}

pub fn encode_image(image: &DynamicImage, format: OutputFormat, jpeg_quality: u8) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    let mut cursor = Cursor::new(&mut buf);
    match format {
        // JPEG has no alpha channel
        OutputFormat::Jpeg => DynamicImage::ImageRgb8(image.to_rgb8())
            .write_to(&mut cursor, ImageOutputFormat::Jpeg(jpeg_quality.clamp(1, 100))),
        OutputFormat::Png => image.write_to(&mut cursor, ImageOutputFormat::Png),
    }
    .map_err(AdGenError::Encode)?;
    Ok(buf)
}

/// `{prefix}/{style}_{YYYYmmdd_HHMMSS}_{8 hex}.{ext}`
fn object_key(prefix: &str, style_key: &str, format: OutputFormat) -> String {
    let stamp = chrono::Local::now().format("%Y%m%d_%H%M%S");
    let suffix: u32 = rand::random();
    let name = format!("{}_{}_{:08x}.{}", style_key, stamp, suffix, format.extension());
    if prefix.is_empty() {
        name
    } else {
        format!("{}/{}", prefix, name)
    }
}

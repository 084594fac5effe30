//! YAML configuration. Every section has defaults, so an empty file is valid.

use anyhow::{Context, Result};
use candle_core::DType;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::AdGenError;
use crate::imaging::canvas::DEFAULT_EDGE_MARGIN;
use crate::imaging::CannyThresholds;
use crate::pipeline::{OutputFormat, DEFAULT_INFERENCE_STEPS, DEFAULT_PADDING};
use crate::styles::StyleProfile;

pub const REPLICATE_TOKEN_ENV: &str = "REPLICATE_API_TOKEN";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// `auto | cpu | cuda[:N] | metal`
    pub device: String,
    pub generation: GenerationConfig,
    pub inference: InferenceConfig,
    pub storage: StorageConfig,
    pub training: TrainingConfig,
    /// Extra profiles merged over the built-in style table
    pub styles: Vec<StyleProfile>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            device: "auto".to_string(),
            generation: GenerationConfig::default(),
            inference: InferenceConfig::default(),
            storage: StorageConfig::default(),
            training: TrainingConfig::default(),
            styles: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoverKind {
    #[default]
    Passthrough,
    BorderKey,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CorrectorKind {
    Identity,
    #[default]
    Tone,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    pub canny_low: u8,
    pub canny_high: u8,
    pub padding: f64,
    pub edge_margin: f64,
    pub steps: usize,
    pub output_format: OutputFormat,
    pub jpeg_quality: u8,
    pub key_prefix: String,
    pub remover: RemoverKind,
    pub corrector: CorrectorKind,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        let thresholds = CannyThresholds::default();
        Self {
            canny_low: thresholds.low,
            canny_high: thresholds.high,
            padding: DEFAULT_PADDING,
            edge_margin: DEFAULT_EDGE_MARGIN,
            steps: DEFAULT_INFERENCE_STEPS,
            output_format: OutputFormat::Jpeg,
            jpeg_quality: 95,
            key_prefix: "ai_generated".to_string(),
            remover: RemoverKind::default(),
            corrector: CorrectorKind::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InferenceKind {
    #[default]
    Replicate,
    Local,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct InferenceConfig {
    pub backend: InferenceKind,
    pub replicate: ReplicateConfig,
    pub local: LocalInferenceConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicateConfig {
    /// Falls back to `REPLICATE_API_TOKEN`
    pub api_token: Option<String>,
    /// Model version hash of the ControlNet + identity-adapter deployment
    pub version: String,
    pub base_url: String,
    pub poll_interval_ms: u64,
    pub timeout_secs: u64,
}

impl Default for ReplicateConfig {
    fn default() -> Self {
        Self {
            api_token: None,
            version: crate::inference::replicate::DEFAULT_MODEL_VERSION.to_string(),
            base_url: "https://api.replicate.com".to_string(),
            poll_interval_ms: 1000,
            timeout_secs: 300,
        }
    }
}

impl ReplicateConfig {
    pub fn resolve_token(&self) -> Option<String> {
        self.api_token
            .clone()
            .filter(|t| !t.trim().is_empty())
            .or_else(|| std::env::var(REPLICATE_TOKEN_ENV).ok().filter(|t| !t.trim().is_empty()))
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Diffusers-layout SDXL weight files
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SdxlModelPaths {
    pub unet: PathBuf,
    pub vae: PathBuf,
    pub clip: PathBuf,
    pub clip2: PathBuf,
    pub tokenizer: PathBuf,
    pub tokenizer2: PathBuf,
    /// Recorded in `adapter_config.json`
    pub name: Option<String>,
}

impl Default for SdxlModelPaths {
    fn default() -> Self {
        let root = PathBuf::from("models/sdxl");
        Self {
            unet: root.join("unet/diffusion_pytorch_model.safetensors"),
            vae: root.join("vae/diffusion_pytorch_model.safetensors"),
            clip: root.join("text_encoder/model.safetensors"),
            clip2: root.join("text_encoder_2/model.safetensors"),
            tokenizer: root.join("tokenizer/tokenizer.json"),
            tokenizer2: root.join("tokenizer_2/tokenizer.json"),
            name: Some("stabilityai/stable-diffusion-xl-base-1.0".to_string()),
        }
    }
}

impl SdxlModelPaths {
    /// Fail before any weights are read if a file is missing
    pub fn check_exists(&self) -> Result<()> {
        for (what, path) in [
            ("unet", &self.unet),
            ("vae", &self.vae),
            ("clip", &self.clip),
            ("clip2", &self.clip2),
            ("tokenizer", &self.tokenizer),
            ("tokenizer2", &self.tokenizer2),
        ] {
            anyhow::ensure!(path.is_file(), "{} weights not found at {}", what, path.display());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalInferenceConfig {
    pub models: SdxlModelPaths,
    pub guidance_scale: f64,
    /// Trained adapter merged into the UNet at load
    pub lora_dir: Option<PathBuf>,
    pub lora_scale: f64,
}

impl Default for LocalInferenceConfig {
    fn default() -> Self {
        Self {
            models: SdxlModelPaths::default(),
            guidance_scale: 7.5,
            lora_dir: None,
            lora_scale: 1.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub root: Option<PathBuf>,
    pub public_base_url: Option<String>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: Some(PathBuf::from("output")),
            public_base_url: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SaveDtype {
    #[default]
    Fp32,
    Fp16,
    Bf16,
}

impl SaveDtype {
    pub fn dtype(self) -> DType {
        match self {
            SaveDtype::Fp32 => DType::F32,
            SaveDtype::Fp16 => DType::F16,
            SaveDtype::Bf16 => DType::BF16,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    pub base_model: SdxlModelPaths,
    pub learning_rate: f64,
    pub resolution: u32,
    pub log_every: usize,
    pub seed: Option<u64>,
    /// Synthesize captions from file names when a sidecar is missing
    pub trigger_word: Option<String>,
    pub save_dtype: SaveDtype,
    /// Defaults to the rank
    pub alpha: Option<f32>,
    pub target_modules: Vec<String>,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            base_model: SdxlModelPaths::default(),
            learning_rate: 1e-4,
            resolution: 512,
            log_every: 5,
            seed: None,
            trigger_word: None,
            save_dtype: SaveDtype::default(),
            alpha: None,
            target_modules: default_target_modules(),
        }
    }
}

pub fn default_target_modules() -> Vec<String> {
    ["to_k", "to_q", "to_v", "to_out.0"].iter().map(|s| s.to_string()).collect()
}

impl Config {
    pub fn validate(&self) -> crate::error::Result<()> {
        let g = &self.generation;
        CannyThresholds::new(g.canny_low, g.canny_high)?;
        if !(g.padding > 0.0 && g.padding <= 1.0) {
            return Err(AdGenError::config(format!("generation.padding must be in (0, 1], got {}", g.padding)));
        }
        if !(0.0..0.5).contains(&g.edge_margin) {
            return Err(AdGenError::config(format!(
                "generation.edge_margin must be in [0, 0.5), got {}",
                g.edge_margin
            )));
        }
        if g.steps == 0 {
            return Err(AdGenError::config("generation.steps must be at least 1"));
        }
        if !(1..=100).contains(&g.jpeg_quality) {
            return Err(AdGenError::config(format!(
                "generation.jpeg_quality must be in 1..=100, got {}",
                g.jpeg_quality
            )));
        }

        let local = &self.inference.local;
        if local.guidance_scale < 1.0 {
            return Err(AdGenError::config("inference.local.guidance_scale must be >= 1"));
        }
        if self.inference.replicate.poll_interval_ms == 0 {
            return Err(AdGenError::config("inference.replicate.poll_interval_ms must be positive"));
        }

        let t = &self.training;
        if !(t.learning_rate > 0.0) {
            return Err(AdGenError::config("training.learning_rate must be positive"));
        }
        if t.resolution == 0 || t.resolution % 8 != 0 {
            return Err(AdGenError::config(format!(
                "training.resolution must be a positive multiple of 8, got {}",
                t.resolution
            )));
        }
        if t.log_every == 0 {
            return Err(AdGenError::config("training.log_every must be at least 1"));
        }
        if t.target_modules.is_empty() {
            return Err(AdGenError::config("training.target_modules must not be empty"));
        }
        if matches!(t.alpha, Some(a) if !(a > 0.0)) {
            return Err(AdGenError::config("training.alpha must be positive"));
        }
        Ok(())
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let config_str =
        fs::read_to_string(path).with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = if config_str.trim().is_empty() {
        Config::default()
    } else {
        serde_yaml::from_str(&config_str).with_context(|| "Failed to parse YAML config")?
    };
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_empty_file_is_default() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("adgen.yaml");
        fs::write(&path, "")?;
        let config = load_config(&path)?;
        assert_eq!(config.device, "auto");
        assert_eq!(config.generation.canny_low, 100);
        assert_eq!(config.generation.canny_high, 200);
        assert_eq!(config.training.log_every, 5);
        assert_eq!(config.training.target_modules, default_target_modules());
        assert_eq!(config.inference.backend, InferenceKind::Replicate);
        Ok(())
    }

    #[test]
    fn test_partial_sections_keep_defaults() -> Result<()> {
        let yaml = r#"
device: cpu
generation:
  padding: 0.8
  output_format: png
inference:
  backend: local
  local:
    guidance_scale: 5.0
training:
  save_dtype: fp16
  trigger_word: sks
styles:
  - key: pastel
    positive_prompt: soft pastel studio, product photo
    negative_prompt: harsh shadows
"#;
        let config: Config = serde_yaml::from_str(yaml)?;
        config.validate()?;
        assert_eq!(config.generation.padding, 0.8);
        assert_eq!(config.generation.steps, 30);
        assert_eq!(config.generation.output_format, OutputFormat::Png);
        assert_eq!(config.inference.backend, InferenceKind::Local);
        assert_eq!(config.inference.local.guidance_scale, 5.0);
        assert_eq!(config.training.save_dtype.dtype(), DType::F16);
        assert_eq!(config.training.learning_rate, 1e-4);
        assert_eq!(config.styles.len(), 1);
        assert_eq!(config.styles[0].conditioning_scale, 0.5);
        Ok(())
    }

    #[test]
    fn test_out_of_range_values_are_configuration_errors() {
        let mut config = Config::default();
        config.generation.canny_low = 200;
        config.generation.canny_high = 100;
        assert_eq!(config.validate().unwrap_err().kind(), ErrorKind::Configuration);

        let mut config = Config::default();
        config.generation.padding = 1.5;
        assert_eq!(config.validate().unwrap_err().kind(), ErrorKind::Configuration);

        let mut config = Config::default();
        config.training.resolution = 500;
        assert_eq!(config.validate().unwrap_err().kind(), ErrorKind::Configuration);
    }

    #[test]
    fn test_explicit_token_wins_over_env() {
        let config = ReplicateConfig {
            api_token: Some("r8_explicit".to_string()),
            ..ReplicateConfig::default()
        };
        assert_eq!(config.resolve_token().as_deref(), Some("r8_explicit"));
    }
}

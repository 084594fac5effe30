//! Staged generation pipeline: request types, stage identifiers, timing record

pub mod capabilities;
pub mod orchestrator;
pub mod storage;

pub use capabilities::{
    BackgroundRemover, BorderKeyRemover, IdentityCorrector, PassthroughRemover, RemovalError,
    StyleCorrector, ToneCorrector,
};
pub use orchestrator::{GenerationSettings, Orchestrator};
pub use storage::{LocalObjectStore, ObjectStore};

use image::{DynamicImage, RgbImage, RgbaImage};
use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{AdGenError, Result};
use crate::imaging::{AspectRatio, Placement, VerticalAlignment};
use crate::styles::PromptPair;

pub const DEFAULT_INFERENCE_STEPS: usize = 30;
pub const DEFAULT_PADDING: f64 = 0.7;

/// Pipeline states, in execution order. Each names the state reached once
/// its work succeeds; a failure is tagged with the stage being attempted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Stage {
    Received,
    BackgroundRemoved,
    StyleCorrected,
    Composed,
    ControlSignalReady,
    Inferred,
    Encoded,
    Stored,
    Done,
}

impl Stage {
    pub const ALL: [Stage; 9] = [
        Stage::Received,
        Stage::BackgroundRemoved,
        Stage::StyleCorrected,
        Stage::Composed,
        Stage::ControlSignalReady,
        Stage::Inferred,
        Stage::Encoded,
        Stage::Stored,
        Stage::Done,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Received => "RECEIVED",
            Stage::BackgroundRemoved => "BACKGROUND_REMOVED",
            Stage::StyleCorrected => "STYLE_CORRECTED",
            Stage::Composed => "COMPOSED",
            Stage::ControlSignalReady => "CONTROL_SIGNAL_READY",
            Stage::Inferred => "INFERRED",
            Stage::Encoded => "ENCODED",
            Stage::Stored => "STORED",
            Stage::Done => "DONE",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-stage elapsed time in execution order
#[derive(Debug, Clone, Default)]
pub struct StageTimings {
    entries: Vec<(Stage, Duration)>,
}

impl StageTimings {
    pub fn record(&mut self, stage: Stage, elapsed: Duration) {
        self.entries.push((stage, elapsed));
    }

    pub fn get(&self, stage: Stage) -> Option<Duration> {
        self.entries.iter().find(|(s, _)| *s == stage).map(|(_, d)| *d)
    }

    pub fn stages(&self) -> impl Iterator<Item = Stage> + '_ {
        self.entries.iter().map(|(s, _)| *s)
    }

    pub fn total(&self) -> Duration {
        self.entries
            .iter()
            .filter(|(s, _)| *s != Stage::Done)
            .map(|(_, d)| *d)
            .sum()
    }

    /// One-line `STAGE=1.23s` summary for logs
    pub fn breakdown(&self) -> String {
        self.entries
            .iter()
            .map(|(s, d)| format!("{}={:.2}s", s, d.as_secs_f64()))
            .collect::<Vec<_>>()
            .join(", ")
    }
}

/// Serialised as `{"STAGE": seconds, ...}`
impl Serialize for StageTimings {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (stage, elapsed) in &self.entries {
            map.serialize_entry(stage.as_str(), &elapsed.as_secs_f64())?;
        }
        map.end()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    Jpeg,
    Png,
}

impl OutputFormat {
    pub fn extension(self) -> &'static str {
        match self {
            OutputFormat::Jpeg => "jpg",
            OutputFormat::Png => "png",
        }
    }

    pub fn content_type(self) -> &'static str {
        match self {
            OutputFormat::Jpeg => "image/jpeg",
            OutputFormat::Png => "image/png",
        }
    }
}

impl Default for OutputFormat {
    fn default() -> Self {
        OutputFormat::Jpeg
    }
}

impl FromStr for OutputFormat {
    type Err = AdGenError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "jpeg" | "jpg" => Ok(OutputFormat::Jpeg),
            "png" => Ok(OutputFormat::Png),
            other => Err(AdGenError::config(format!("unsupported output format '{}'", other))),
        }
    }
}

/// One generation call. `GenerationRequest::new` fills the validated defaults.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub product_image: Vec<u8>,
    pub style_key: String,
    pub aspect_ratio: AspectRatio,
    pub prompt_extra: Option<String>,
    pub negative_prompt_extra: Option<String>,
    pub inference_steps: usize,
    /// `None` uses the style profile's scale
    pub conditioning_scale: Option<f32>,
    pub padding_percent: f64,
    pub vertical_alignment: VerticalAlignment,
    pub use_identity_conditioning: bool,
    pub seed: Option<u64>,
    /// `None` uses the configured default
    pub output_format: Option<OutputFormat>,
}

impl GenerationRequest {
    pub fn new(product_image: Vec<u8>) -> Self {
        Self {
            product_image,
            style_key: crate::styles::DEFAULT_STYLE.to_string(),
            aspect_ratio: AspectRatio::Square,
            prompt_extra: None,
            negative_prompt_extra: None,
            inference_steps: DEFAULT_INFERENCE_STEPS,
            conditioning_scale: None,
            padding_percent: DEFAULT_PADDING,
            vertical_alignment: VerticalAlignment::Center,
            use_identity_conditioning: false,
            seed: None,
            output_format: None,
        }
    }

    pub fn style(mut self, key: impl Into<String>) -> Self {
        self.style_key = key.into();
        self
    }

    pub fn aspect_ratio(mut self, ratio: AspectRatio) -> Self {
        self.aspect_ratio = ratio;
        self
    }

    pub fn prompt(mut self, extra: impl Into<String>) -> Self {
        self.prompt_extra = Some(extra.into());
        self
    }

    pub fn negative_prompt(mut self, extra: impl Into<String>) -> Self {
        self.negative_prompt_extra = Some(extra.into());
        self
    }

    pub fn identity_conditioning(mut self, enabled: bool) -> Self {
        self.use_identity_conditioning = enabled;
        self
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.inference_steps == 0 {
            return Err(AdGenError::config("inference_steps must be at least 1"));
        }
        if let Some(scale) = self.conditioning_scale {
            if !(0.0..=2.0).contains(&scale) {
                return Err(AdGenError::config(format!(
                    "conditioning_scale {} is outside [0, 2]",
                    scale
                )));
            }
        }
        if !(self.padding_percent > 0.0 && self.padding_percent <= 1.0) {
            return Err(AdGenError::config(format!(
                "padding_percent must be in (0, 1] (got {})",
                self.padding_percent
            )));
        }
        Ok(())
    }
}

/// Final output of a successful run. Immutable once produced.
#[derive(Debug, Clone)]
pub struct GenerationResult {
    pub image: DynamicImage,
    pub bytes: Vec<u8>,
    pub format: OutputFormat,
    pub width: u32,
    pub height: u32,
    pub style_key: String,
    pub prompts: PromptPair,
    pub conditioning_scale: f32,
    pub placement: Placement,
    pub canvas: RgbaImage,
    pub control_signal: RgbImage,
    pub timings: StageTimings,
    pub stored_url: Option<String>,
}

/// JSON-friendly view of a result, without pixel data
#[derive(Debug, Clone, Serialize)]
pub struct GenerationSummary<'a> {
    pub width: u32,
    pub height: u32,
    pub format: OutputFormat,
    pub style: &'a str,
    pub prompts: &'a PromptPair,
    pub conditioning_scale: f32,
    pub placement: Placement,
    pub timings: &'a StageTimings,
    pub stored_url: Option<&'a str>,
}

impl GenerationResult {
    pub fn summary(&self) -> GenerationSummary<'_> {
        GenerationSummary {
            width: self.width,
            height: self.height,
            format: self.format,
            style: &self.style_key,
            prompts: &self.prompts,
            conditioning_scale: self.conditioning_scale,
            placement: self.placement,
            timings: &self.timings,
            stored_url: self.stored_url.as_deref(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_names_round_trip_through_serde() {
        for stage in Stage::ALL {
            let json = serde_json::to_value(stage).unwrap();
            assert_eq!(json, stage.as_str());
            let back: Stage = serde_json::from_value(json).unwrap();
            assert_eq!(back, stage);
        }
    }

    #[test]
    fn test_timings_serialize_in_order() {
        let mut timings = StageTimings::default();
        timings.record(Stage::Received, Duration::from_millis(5));
        timings.record(Stage::Composed, Duration::from_millis(20));
        let json = serde_json::to_string(&timings).unwrap();
        assert_eq!(json, r#"{"RECEIVED":0.005,"COMPOSED":0.02}"#);
        assert_eq!(timings.total(), Duration::from_millis(25));
        assert!(timings.get(Stage::Inferred).is_none());
    }

    #[test]
    fn test_request_defaults() {
        let req = GenerationRequest::new(vec![]);
        assert_eq!(req.style_key, "minimal");
        assert_eq!(req.aspect_ratio, AspectRatio::Square);
        assert_eq!(req.inference_steps, 30);
        assert_eq!(req.padding_percent, 0.7);
        assert!(req.conditioning_scale.is_none());
        assert!(!req.use_identity_conditioning);
    }

    #[test]
    fn test_request_validation() {
        let mut req = GenerationRequest::new(vec![]);
        req.inference_steps = 0;
        assert!(req.validate().is_err());

        let mut req = GenerationRequest::new(vec![]);
        req.conditioning_scale = Some(3.0);
        assert!(req.validate().is_err());
    }
}

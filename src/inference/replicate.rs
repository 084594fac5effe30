//! Remote SDXL + ControlNet through the Replicate prediction API

use anyhow::{bail, Context, Result};
use image::DynamicImage;
use log::{debug, info, warn};
use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::thread;
use std::time::{Duration, Instant};

use super::{png_data_uri, InferenceBackend, InferenceRequest};
use crate::config::ReplicateConfig;

pub const DEFAULT_MODEL_VERSION: &str = "39ed52f2a78e934b3ba6e2a89f5b1c712de7dfea535525255b1aa35c5565e08b";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Serialize)]
struct PredictionRequest<'a> {
    version: &'a str,
    input: PredictionInput<'a>,
}

#[derive(Debug, Serialize)]
struct PredictionInput<'a> {
    /// Identity reference when present, else the control signal
    image: String,
    control_image: String,
    prompt: &'a str,
    negative_prompt: &'a str,
    num_inference_steps: usize,
    controlnet_conditioning_scale: f32,
    width: u32,
    height: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    seed: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
enum PredictionStatus {
    Starting,
    Processing,
    Succeeded,
    Failed,
    Canceled,
}

impl PredictionStatus {
    fn is_terminal(self) -> bool {
        matches!(
            self,
            PredictionStatus::Succeeded | PredictionStatus::Failed | PredictionStatus::Canceled
        )
    }
}

impl fmt::Display for PredictionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PredictionStatus::Starting => "starting",
            PredictionStatus::Processing => "processing",
            PredictionStatus::Succeeded => "succeeded",
            PredictionStatus::Failed => "failed",
            PredictionStatus::Canceled => "canceled",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Deserialize)]
struct Prediction {
    id: String,
    status: PredictionStatus,
    #[serde(default)]
    output: Option<Value>,
    #[serde(default)]
    error: Option<Value>,
    urls: PredictionUrls,
}

#[derive(Debug, Deserialize)]
struct PredictionUrls {
    get: String,
}

pub struct ReplicateBackend {
    client: Client,
    token: String,
    version: String,
    base_url: String,
    poll_interval: Duration,
    timeout: Duration,
}

impl ReplicateBackend {
    pub fn from_config(config: &ReplicateConfig) -> Result<Self> {
        let token = config.resolve_token().with_context(|| {
            format!(
                "No Replicate API token: set inference.replicate.api_token or {}",
                crate::config::REPLICATE_TOKEN_ENV
            )
        })?;
        let version = if config.version.trim().is_empty() {
            DEFAULT_MODEL_VERSION.to_string()
        } else {
            config.version.trim().to_string()
        };
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            client,
            token,
            version,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            poll_interval: config.poll_interval(),
            timeout: config.timeout(),
        })
    }

    fn create(&self, body: &PredictionRequest<'_>) -> Result<Prediction> {
        let url = format!("{}/v1/predictions", self.base_url);
        self.client
            .post(&url)
            .bearer_auth(&self.token)
            .json(body)
            .send()
            .with_context(|| format!("POST {} failed", url))?
            .error_for_status()
            .context("Replicate rejected the prediction")?
            .json()
            .context("Unreadable prediction response")
    }

    fn poll(&self, url: &str) -> Result<Prediction> {
        self.client
            .get(url)
            .bearer_auth(&self.token)
            .send()
            .with_context(|| format!("GET {} failed", url))?
            .error_for_status()
            .context("Replicate status check failed")?
            .json()
            .context("Unreadable prediction status")
    }

    fn wait(&self, mut prediction: Prediction) -> Result<Prediction> {
        let start = Instant::now();
        while !prediction.status.is_terminal() {
            if start.elapsed() > self.timeout {
                bail!(
                    "prediction {} still {} after {:?}",
                    prediction.id,
                    prediction.status,
                    self.timeout
                );
            }
            thread::sleep(self.poll_interval);
            prediction = self.poll(&prediction.urls.get)?;
            debug!("prediction {}: {}", prediction.id, prediction.status);
        }
        Ok(prediction)
    }

    fn download(&self, url: &str) -> Result<DynamicImage> {
        let bytes = self
            .client
            .get(url)
            .send()
            .with_context(|| format!("GET {} failed", url))?
            .error_for_status()
            .with_context(|| format!("Download of {} failed", url))?
            .bytes()?;
        image::load_from_memory(&bytes).with_context(|| format!("Output {} is not an image", url))
    }
}

fn build_input<'a>(request: &InferenceRequest<'a>) -> Result<PredictionInput<'a>> {
    let control_image = png_data_uri(&DynamicImage::ImageRgb8(request.control_signal.clone()))?;
    let image = match request.identity_image {
        Some(identity) => png_data_uri(&DynamicImage::ImageRgba8(identity.clone()))?,
        None => control_image.clone(),
    };
    Ok(PredictionInput {
        image,
        control_image,
        prompt: &request.prompts.positive,
        negative_prompt: &request.prompts.negative,
        num_inference_steps: request.steps,
        controlnet_conditioning_scale: request.conditioning_scale,
        width: request.width,
        height: request.height,
        seed: request.seed,
    })
}

/// A prediction's `output` is a single URL or a list of them
fn output_urls(output: Option<&Value>) -> Vec<String> {
    match output {
        Some(Value::String(url)) => vec![url.clone()],
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect(),
        _ => Vec::new(),
    }
}

impl InferenceBackend for ReplicateBackend {
    fn name(&self) -> &str {
        "replicate"
    }

    fn generate(&mut self, request: &InferenceRequest<'_>) -> Result<Vec<DynamicImage>> {
        let body = PredictionRequest {
            version: &self.version,
            input: build_input(request)?,
        };
        info!(
            "Generating with Replicate: {}x{}, {} steps, scale {:.2}",
            request.width, request.height, request.steps, request.conditioning_scale
        );

        let created = self.create(&body)?;
        let prediction = self.wait(created)?;
        match prediction.status {
            PredictionStatus::Succeeded => {}
            status => bail!(
                "prediction {} {}: {}",
                prediction.id,
                status,
                prediction.error.map(|e| e.to_string()).unwrap_or_default()
            ),
        }

        let urls = output_urls(prediction.output.as_ref());
        if urls.is_empty() {
            warn!("prediction {} succeeded without output", prediction.id);
        }
        urls.iter().map(|url| self.download(url)).collect()
    }
}

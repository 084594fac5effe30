//! Error taxonomy shared by the generation pipeline and the trainer

use serde::Serialize;
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

use crate::pipeline::Stage;

pub type Result<T> = std::result::Result<T, AdGenError>;

/// Machine-readable error kind surfaced to callers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    ImageDecode,
    InvalidImage,
    BackgroundRemoval,
    InferenceBackend,
    InferenceEmptyResult,
    EmptyDataset,
    Configuration,
    Storage,
    Encode,
    Training,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::ImageDecode => "image_decode",
            ErrorKind::InvalidImage => "invalid_image",
            ErrorKind::BackgroundRemoval => "background_removal",
            ErrorKind::InferenceBackend => "inference_backend",
            ErrorKind::InferenceEmptyResult => "inference_empty_result",
            ErrorKind::EmptyDataset => "empty_dataset",
            ErrorKind::Configuration => "configuration",
            ErrorKind::Storage => "storage",
            ErrorKind::Encode => "encode",
            ErrorKind::Training => "training",
        };
        f.write_str(name)
    }
}

#[derive(Error, Debug)]
pub enum AdGenError {
    /// Input bytes are not a decodable image
    #[error("failed to decode image: {0}")]
    ImageDecode(#[source] image::ImageError),

    /// Image decoded but is unusable (zero-sized, wrong channel layout, ...)
    #[error("invalid image: {0}")]
    InvalidImage(String),

    #[error("background removal failed: {0}")]
    BackgroundRemoval(#[source] crate::pipeline::capabilities::RemovalError),

    #[error("inference backend failed: {0:#}")]
    InferenceBackend(#[source] anyhow::Error),

    #[error("inference backend returned no images")]
    InferenceEmptyResult,

    #[error("dataset {} is missing or has no usable images", .0.display())]
    EmptyDataset(PathBuf),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("object storage failed: {0:#}")]
    Storage(#[source] anyhow::Error),

    #[error("failed to encode output image: {0}")]
    Encode(#[source] image::ImageError),

    #[error("training failed: {0:#}")]
    Training(#[source] anyhow::Error),
}

impl AdGenError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AdGenError::ImageDecode(_) => ErrorKind::ImageDecode,
            AdGenError::InvalidImage(_) => ErrorKind::InvalidImage,
            AdGenError::BackgroundRemoval(_) => ErrorKind::BackgroundRemoval,
            AdGenError::InferenceBackend(_) => ErrorKind::InferenceBackend,
            AdGenError::InferenceEmptyResult => ErrorKind::InferenceEmptyResult,
            AdGenError::EmptyDataset(_) => ErrorKind::EmptyDataset,
            AdGenError::Configuration(_) => ErrorKind::Configuration,
            AdGenError::Storage(_) => ErrorKind::Storage,
            AdGenError::Encode(_) => ErrorKind::Encode,
            AdGenError::Training(_) => ErrorKind::Training,
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        AdGenError::Configuration(message.into())
    }

    pub fn invalid_image(message: impl Into<String>) -> Self {
        AdGenError::InvalidImage(message.into())
    }

    /// Report for failures outside the staged pipeline, such as training
    pub fn report(&self) -> ErrorReport {
        ErrorReport {
            kind: self.kind(),
            stage: None,
            message: self.to_string(),
        }
    }
}

/// A pipeline failure tagged with the stage it happened in
#[derive(Error, Debug)]
#[error("stage {stage} failed: {source}")]
pub struct PipelineError {
    pub stage: Stage,
    #[source]
    pub source: AdGenError,
}

impl PipelineError {
    pub fn new(stage: Stage, source: AdGenError) -> Self {
        Self { stage, source }
    }

    pub fn kind(&self) -> ErrorKind {
        self.source.kind()
    }

    pub fn report(&self) -> ErrorReport {
        ErrorReport {
            kind: self.kind(),
            stage: Some(self.stage),
            message: self.source.to_string(),
        }
    }
}

/// Serialisable failure for callers at the request boundary; `stage` is set for pipeline failures
#[derive(Debug, Clone, Serialize)]
pub struct ErrorReport {
    pub kind: ErrorKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage: Option<Stage>,
    pub message: String,
}

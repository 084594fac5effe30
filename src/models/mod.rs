pub mod sdxl_time_ids;
pub mod sdxl_unet;
pub mod sdxl_vae;

pub use sdxl_time_ids::TimeIdsConfig;
pub use sdxl_unet::{build_unet, LoraMergeBackend};
pub use sdxl_vae::SdxlVae;

/// A linear attention weight that can carry an adapter
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttentionProjection {
    /// Module path without the `.weight` suffix
    pub name: String,
    pub in_features: usize,
    pub out_features: usize,
}

impl AttentionProjection {
    pub fn new(name: impl Into<String>, in_features: usize, out_features: usize) -> Self {
        Self {
            name: name.into(),
            in_features,
            out_features,
        }
    }
}

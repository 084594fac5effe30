use anyhow::{Context, Result};
use candle_core::{DType, Device, Shape, Tensor};
use candle_nn::var_builder::SimpleBackend;
use candle_nn::{Init, VarBuilder};
use candle_transformers::models::stable_diffusion::unet_2d::{self, UNet2DConditionModel};
use std::collections::HashMap;

use super::AttentionProjection;

pub const SDXL_LATENT_CHANNELS: usize = 4;

/// SDXL UNet2DConditionModel configuration (diffusers layout)
pub fn sdxl_unet_config() -> unet_2d::UNet2DConditionModelConfig {
    unet_2d::UNet2DConditionModelConfig {
        blocks: vec![
            // 320 channels, no cross attention
            unet_2d::BlockConfig {
                out_channels: 320,
                use_cross_attn: None,
                attention_head_dim: 5,
            },
            unet_2d::BlockConfig {
                out_channels: 640,
                use_cross_attn: Some(2),
                attention_head_dim: 10,
            },
            unet_2d::BlockConfig {
                out_channels: 1280,
                use_cross_attn: Some(10),
                attention_head_dim: 20,
            },
        ],
        center_input_sample: false,
        cross_attention_dim: 2048, // concatenated CLIP embeddings
        downsample_padding: 1,
        flip_sin_to_cos: true,
        freq_shift: 0.,
        layers_per_block: 2,
        mid_block_scale_factor: 1.,
        norm_eps: 1e-5,
        norm_num_groups: 32,
        use_linear_projection: true,
        sliced_attention_size: None,
    }
}

/// Serves base weights with LoRA deltas added on the fly.
///
/// Deltas are keyed by the full parameter name (`...attn1.to_q.weight`). When the
/// deltas are still attached to the adapter's variables, gradients flow from any
/// network built on this backend back into the adapter.
pub struct LoraMergeBackend<'a> {
    base: &'a dyn SimpleBackend,
    deltas: &'a HashMap<String, Tensor>,
}

impl<'a> LoraMergeBackend<'a> {
    pub fn new(base: &'a dyn SimpleBackend, deltas: &'a HashMap<String, Tensor>) -> Self {
        Self { base, deltas }
    }
}

impl SimpleBackend for LoraMergeBackend<'_> {
    fn get(&self, s: Shape, name: &str, h: Init, dtype: DType, dev: &Device) -> candle_core::Result<Tensor> {
        let weight = self.base.get(s, name, h, dtype, dev)?;
        match self.deltas.get(name) {
            Some(delta) => weight.add(&delta.to_dtype(dtype)?.to_device(dev)?),
            None => Ok(weight),
        }
    }

    fn contains_tensor(&self, name: &str) -> bool {
        self.base.contains_tensor(name)
    }
}

/// Build the UNet over `base`, folding in `deltas`
pub fn build_unet(
    base: &dyn SimpleBackend,
    deltas: &HashMap<String, Tensor>,
    dtype: DType,
    device: &Device,
) -> Result<UNet2DConditionModel> {
    let backend = LoraMergeBackend::new(base, deltas);
    let vb = VarBuilder::from_backend(Box::new(backend), dtype, device.clone());
    UNet2DConditionModel::new(vb, SDXL_LATENT_CHANNELS, SDXL_LATENT_CHANNELS, false, sdxl_unet_config())
        .context("Failed to build SDXL UNet")
}

/// Self- and cross-attention linear weights among `tensors` (name, shape)
pub fn attention_projections<'a, I>(tensors: I) -> Vec<AttentionProjection>
where
    I: IntoIterator<Item = (&'a str, &'a [usize])>,
{
    let mut projections: Vec<AttentionProjection> = tensors
        .into_iter()
        .filter_map(|(name, shape)| {
            let module = name.strip_suffix(".weight")?;
            let is_attention = module.contains(".attn1.") || module.contains(".attn2.");
            match (is_attention, shape) {
                (true, [out_features, in_features]) => {
                    Some(AttentionProjection::new(module, *in_features, *out_features))
                }
                _ => None,
            }
        })
        .collect();
    projections.sort_by(|a, b| a.name.cmp(&b.name));
    projections
}

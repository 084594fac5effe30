use anyhow::{Context, Result};
use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::models::stable_diffusion::clip;
use log::info;
use std::path::Path;
use tokenizers::Tokenizer;

use super::{PromptEncoder, TextConditioning};
use crate::config::SdxlModelPaths;

pub const CLIP_MAX_TOKENS: usize = 77;
/// SDXL conditions on the second-to-last encoder layer of both towers
pub const HIDDEN_STATE_LAYER: isize = -2;
const END_OF_TEXT: &str = "<|endoftext|>";

/// One CLIP text tower with its tokenizer
pub struct ClipBranch {
    name: &'static str,
    model: clip::ClipTextTransformer,
    tokenizer: Tokenizer,
    pad_id: u32,
    eos_id: u32,
    device: Device,
}

impl ClipBranch {
    pub fn load(
        name: &'static str,
        weights: &Path,
        tokenizer: &Path,
        config: clip::Config,
        device: &Device,
        dtype: DType,
    ) -> Result<Self> {
        info!("Loading {} from: {}", name, weights.display());
        let tokenizer = Tokenizer::from_file(tokenizer)
            .map_err(|e| anyhow::anyhow!("Failed to load tokenizer {}: {}", tokenizer.display(), e))?;
        let eos_id = tokenizer
            .token_to_id(END_OF_TEXT)
            .with_context(|| format!("{} tokenizer has no {} token", name, END_OF_TEXT))?;
        let pad_id = match &config.pad_with {
            Some(pad) => tokenizer
                .token_to_id(pad)
                .with_context(|| format!("{} tokenizer has no pad token '{}'", name, pad))?,
            None => eos_id,
        };

        let vb = unsafe { VarBuilder::from_mmaped_safetensors(&[weights], dtype, device)? };
        let model = clip::ClipTextTransformer::new(vb, &config)
            .with_context(|| format!("Failed to build {} from {}", name, weights.display()))?;

        Ok(Self {
            name,
            model,
            tokenizer,
            pad_id,
            eos_id,
            device: device.clone(),
        })
    }

    /// Exactly `CLIP_MAX_TOKENS` ids, truncated with the end token kept
    pub fn tokenize(&self, text: &str) -> Result<Vec<u32>> {
        let encoding = self
            .tokenizer
            .encode(text, true)
            .map_err(|e| anyhow::anyhow!("{} tokenization failed: {}", self.name, e))?;
        Ok(pad_or_truncate(encoding.get_ids(), self.eos_id, self.pad_id))
    }

    /// `(penultimate hidden [B, 77, D], pooled [B, D])`. Pooling reads the final
    /// layer-normed output at each sequence's end token.
    pub fn encode(&self, texts: &[String]) -> Result<(Tensor, Tensor)> {
        let mut ids = Vec::with_capacity(texts.len() * CLIP_MAX_TOKENS);
        let mut eos_positions = Vec::with_capacity(texts.len());
        for text in texts {
            let tokens = self.tokenize(text)?;
            eos_positions.push(eos_position(&tokens, self.eos_id));
            ids.extend(tokens);
        }
        let ids = Tensor::from_vec(ids, (texts.len(), CLIP_MAX_TOKENS), &self.device)?;
        let (last, hidden) = self
            .model
            .forward_until_encoder_layer(&ids, usize::MAX, HIDDEN_STATE_LAYER)?;
        let pooled = pool_at(&last, &eos_positions)?;
        Ok((hidden, pooled))
    }
}

/// Row `positions[i]` of sample `i`, stacked into `[B, D]`
fn pool_at(states: &Tensor, positions: &[usize]) -> Result<Tensor> {
    let rows = positions
        .iter()
        .enumerate()
        .map(|(i, &pos)| states.get(i)?.get(pos))
        .collect::<candle_core::Result<Vec<_>>>()?;
    Ok(Tensor::stack(&rows, 0)?)
}

fn pad_or_truncate(ids: &[u32], eos_id: u32, pad_id: u32) -> Vec<u32> {
    let mut ids = ids.to_vec();
    if ids.len() > CLIP_MAX_TOKENS {
        ids.truncate(CLIP_MAX_TOKENS - 1);
        ids.push(eos_id);
    }
    ids.resize(CLIP_MAX_TOKENS, pad_id);
    ids
}

fn eos_position(ids: &[u32], eos_id: u32) -> usize {
    ids.iter().position(|&id| id == eos_id).unwrap_or(CLIP_MAX_TOKENS - 1)
}

/// SDXL's two text towers: CLIP ViT-L (768) and OpenCLIP ViT-bigG (1280).
/// Hidden states are concatenated on the feature axis into 2048-wide context;
/// the pooled embedding comes from the second tower.
pub struct DualClipEncoder {
    primary: ClipBranch,
    secondary: ClipBranch,
}

impl DualClipEncoder {
    pub fn load(paths: &SdxlModelPaths, device: &Device, dtype: DType) -> Result<Self> {
        let primary = ClipBranch::load(
            "CLIP-L",
            &paths.clip,
            &paths.tokenizer,
            clip::Config::sdxl(),
            device,
            dtype,
        )?;
        let secondary = ClipBranch::load(
            "CLIP-G",
            &paths.clip2,
            &paths.tokenizer2,
            clip::Config::sdxl2(),
            device,
            dtype,
        )?;
        Ok(Self { primary, secondary })
    }

    pub fn encode_batch(&self, texts: &[String]) -> Result<TextConditioning> {
        let (primary, secondary) = rayon::join(|| self.primary.encode(texts), || self.secondary.encode(texts));
        let (primary_hidden, _) = primary?;
        let (secondary_hidden, pooled) = secondary?;
        let secondary_hidden = secondary_hidden.to_dtype(primary_hidden.dtype())?;
        let hidden_states = Tensor::cat(&[&primary_hidden, &secondary_hidden], 2)?;
        Ok(TextConditioning { hidden_states, pooled })
    }

    pub fn encode_prompt(&self, text: &str) -> Result<TextConditioning> {
        self.encode_batch(&[text.to_string()])
    }
}

impl PromptEncoder for DualClipEncoder {
    fn encode(&self, captions: &[String]) -> Result<TextConditioning> {
        self.encode_batch(captions)
    }
}

//! Low-rank adapters over attention projections, and their on-disk format
//!
//! Layout on disk (one directory per adapter):
//! - `adapter_model.safetensors` with `base_model.model.{module}.lora_A.weight` `[r, in]`
//!   and `base_model.model.{module}.lora_B.weight` `[out, r]`
//! - `adapter_config.json`

use anyhow::{bail, ensure, Context, Result};
use candle_core::{DType, Device, Tensor, Var};
use log::info;
use rand::Rng;
use rand_distr::{Distribution, Normal};
use safetensors::{serialize_to_file, Dtype as SafeDtype, View};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};

use super::AttentionProjection;

pub const ADAPTER_WEIGHTS_FILE: &str = "adapter_model.safetensors";
pub const ADAPTER_CONFIG_FILE: &str = "adapter_config.json";
const KEY_PREFIX: &str = "base_model.model.";

/// One adapted projection: `W' = W + scale · up · down`
pub struct LoraLayer {
    pub down: Var,
    pub up: Var,
    pub scale: f64,
}

impl LoraLayer {
    /// Gaussian down projection (σ = 1/r), zero up projection, so a fresh
    /// adapter leaves the base network unchanged.
    pub fn new<R: Rng>(
        in_features: usize,
        out_features: usize,
        rank: usize,
        alpha: f32,
        rng: &mut R,
        device: &Device,
    ) -> Result<Self> {
        let normal = Normal::new(0.0f32, 1.0 / rank as f32)?;
        let values: Vec<f32> = (0..rank * in_features).map(|_| normal.sample(rng)).collect();
        let down = Tensor::from_vec(values, (rank, in_features), device)?;
        let up = Tensor::zeros((out_features, rank), DType::F32, device)?;
        Self::from_tensors(&down, &up, alpha)
    }

    pub fn from_tensors(down: &Tensor, up: &Tensor, alpha: f32) -> Result<Self> {
        let (rank, _) = down.dims2()?;
        let (_, up_rank) = up.dims2()?;
        ensure!(rank == up_rank, "lora_A rank {} does not match lora_B rank {}", rank, up_rank);
        Ok(Self {
            down: Var::from_tensor(&down.to_dtype(DType::F32)?)?,
            up: Var::from_tensor(&up.to_dtype(DType::F32)?)?,
            scale: (alpha / rank as f32) as f64,
        })
    }

    pub fn rank(&self) -> usize {
        self.down.dims()[0]
    }

    /// `scale · up · down`, shaped like the base weight `[out, in]`
    pub fn delta(&self) -> Result<Tensor> {
        Ok((self.up.as_tensor().matmul(self.down.as_tensor())? * self.scale)?)
    }
}

/// Adapters keyed by module path (e.g. `mid_block.attentions.0.transformer_blocks.0.attn1.to_q`)
pub struct LoraCollection {
    pub rank: usize,
    pub alpha: f32,
    layers: BTreeMap<String, LoraLayer>,
}

/// `name` is `target` or ends in `.{target}`
pub fn matches_target(name: &str, targets: &[String]) -> bool {
    targets
        .iter()
        .any(|t| name == t || name.strip_suffix(t.as_str()).map_or(false, |p| p.ends_with('.')))
}

impl LoraCollection {
    pub fn new(rank: usize, alpha: f32) -> Self {
        Self {
            rank,
            alpha,
            layers: BTreeMap::new(),
        }
    }

    /// Attach a fresh adapter to every projection whose name matches a target module
    pub fn for_projections<R: Rng>(
        projections: &[AttentionProjection],
        target_modules: &[String],
        rank: usize,
        alpha: f32,
        rng: &mut R,
        device: &Device,
    ) -> Result<Self> {
        let mut collection = Self::new(rank, alpha);
        for proj in projections {
            if matches_target(&proj.name, target_modules) {
                let layer = LoraLayer::new(proj.in_features, proj.out_features, rank, alpha, rng, device)?;
                collection.layers.insert(proj.name.clone(), layer);
            }
        }
        Ok(collection)
    }

    pub fn insert(&mut self, module: impl Into<String>, layer: LoraLayer) {
        self.layers.insert(module.into(), layer);
    }

    pub fn get(&self, module: &str) -> Option<&LoraLayer> {
        self.layers.get(module)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &LoraLayer)> {
        self.layers.iter()
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    /// Trainable parameters, two per layer
    pub fn vars(&self) -> Vec<Var> {
        self.layers
            .values()
            .flat_map(|l| [l.down.clone(), l.up.clone()])
            .collect()
    }

    pub fn num_parameters(&self) -> usize {
        self.layers
            .values()
            .map(|l| l.down.elem_count() + l.up.elem_count())
            .sum()
    }

    /// Weight deltas keyed by the base parameter name (`{module}.weight`)
    pub fn weight_deltas(&self) -> Result<HashMap<String, Tensor>> {
        self.layers
            .iter()
            .map(|(name, layer)| Ok((format!("{}.weight", name), layer.delta()?)))
            .collect()
    }

    /// Same deltas, cut from the autograd graph and multiplied by `strength`
    pub fn frozen_weight_deltas(&self, strength: f64) -> Result<HashMap<String, Tensor>> {
        self.layers
            .iter()
            .map(|(name, layer)| {
                let delta = (layer.delta()?.detach() * strength)?;
                Ok((format!("{}.weight", name), delta))
            })
            .collect()
    }

    pub fn save(&self, dir: &Path, config: &AdapterConfig, dtype: DType) -> Result<PathBuf> {
        fs::create_dir_all(dir).with_context(|| format!("Failed to create {}", dir.display()))?;

        let mut tensors = Vec::with_capacity(self.layers.len() * 2);
        for (name, layer) in &self.layers {
            tensors.push((
                format!("{}{}.lora_A.weight", KEY_PREFIX, name),
                TensorBytes::from_tensor(layer.down.as_tensor(), dtype)?,
            ));
            tensors.push((
                format!("{}{}.lora_B.weight", KEY_PREFIX, name),
                TensorBytes::from_tensor(layer.up.as_tensor(), dtype)?,
            ));
        }

        let mut metadata = HashMap::new();
        metadata.insert("format".to_string(), "pt".to_string());
        metadata.insert("rank".to_string(), self.rank.to_string());
        metadata.insert("alpha".to_string(), self.alpha.to_string());
        metadata.insert("target_modules".to_string(), config.target_modules.join(","));

        let weights_path = dir.join(ADAPTER_WEIGHTS_FILE);
        serialize_to_file(tensors.iter().map(|(k, v)| (k.as_str(), v)), &Some(metadata), &weights_path)
            .with_context(|| format!("Failed to write {}", weights_path.display()))?;

        let config_path = dir.join(ADAPTER_CONFIG_FILE);
        fs::write(&config_path, serde_json::to_string_pretty(config)?)
            .with_context(|| format!("Failed to write {}", config_path.display()))?;

        info!(
            "Saved {} LoRA tensors ({} parameters) to {}",
            tensors.len(),
            self.num_parameters(),
            weights_path.display()
        );
        Ok(weights_path)
    }

    /// Read weights written by [`LoraCollection::save`]
    pub fn load(dir: &Path, config: &AdapterConfig, device: &Device) -> Result<Self> {
        let weights_path = dir.join(ADAPTER_WEIGHTS_FILE);
        let tensors = candle_core::safetensors::load(&weights_path, device)
            .with_context(|| format!("Failed to load {}", weights_path.display()))?;

        let mut collection = Self::new(config.r, config.lora_alpha);
        for (key, down) in &tensors {
            let Some(module) = key
                .strip_prefix(KEY_PREFIX)
                .and_then(|k| k.strip_suffix(".lora_A.weight"))
            else {
                continue;
            };
            let up_key = format!("{}{}.lora_B.weight", KEY_PREFIX, module);
            let up = tensors
                .get(&up_key)
                .with_context(|| format!("Missing {} in {}", up_key, weights_path.display()))?;
            collection.insert(module, LoraLayer::from_tensors(down, up, config.lora_alpha)?);
        }
        if collection.is_empty() {
            bail!("{} contains no LoRA layers", weights_path.display());
        }
        Ok(collection)
    }
}

/// `adapter_config.json`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdapterConfig {
    pub peft_type: String,
    pub r: usize,
    pub lora_alpha: f32,
    pub target_modules: Vec<String>,
    #[serde(default)]
    pub base_model_name_or_path: Option<String>,
    #[serde(default = "default_init")]
    pub init_lora_weights: String,
}

fn default_init() -> String {
    "gaussian".to_string()
}

impl AdapterConfig {
    pub fn new(rank: usize, alpha: f32, target_modules: Vec<String>, base_model: Option<String>) -> Self {
        Self {
            peft_type: "LORA".to_string(),
            r: rank,
            lora_alpha: alpha,
            target_modules,
            base_model_name_or_path: base_model,
            init_lora_weights: default_init(),
        }
    }

    pub fn read(dir: &Path) -> Result<Self> {
        let path = dir.join(ADAPTER_CONFIG_FILE);
        let text = fs::read_to_string(&path).with_context(|| format!("Failed to read {}", path.display()))?;
        serde_json::from_str(&text).with_context(|| format!("Failed to parse {}", path.display()))
    }
}

/// A persisted adapter produced by a training run
#[derive(Debug, Clone, Serialize)]
pub struct LoraAdapter {
    pub path: PathBuf,
    pub rank: usize,
    pub alpha: f32,
    pub target_modules: Vec<String>,
    pub layers: usize,
    pub steps: usize,
    pub final_loss: Option<f32>,
}

impl LoraAdapter {
    pub fn weights_path(&self) -> PathBuf {
        self.path.join(ADAPTER_WEIGHTS_FILE)
    }

    /// Open an adapter directory and read its weights onto `device`
    pub fn load(dir: &Path, device: &Device) -> Result<(Self, LoraCollection)> {
        let config = AdapterConfig::read(dir)?;
        let collection = LoraCollection::load(dir, &config, device)?;
        let adapter = Self {
            path: dir.to_path_buf(),
            rank: config.r,
            alpha: config.lora_alpha,
            target_modules: config.target_modules,
            layers: collection.len(),
            steps: 0,
            final_loss: None,
        };
        Ok((adapter, collection))
    }
}

/// Tensor already flattened to little-endian bytes, ready for safetensors
struct TensorBytes {
    dtype: SafeDtype,
    shape: Vec<usize>,
    bytes: Vec<u8>,
}

impl TensorBytes {
    fn from_tensor(tensor: &Tensor, dtype: DType) -> Result<Self> {
        let flat = tensor.to_dtype(dtype)?.flatten_all()?;
        let (dtype, bytes) = match dtype {
            DType::F32 => (SafeDtype::F32, bytemuck::cast_slice(&flat.to_vec1::<f32>()?).to_vec()),
            DType::F16 => (SafeDtype::F16, bytemuck::cast_slice(&flat.to_vec1::<half::f16>()?).to_vec()),
            DType::BF16 => (SafeDtype::BF16, bytemuck::cast_slice(&flat.to_vec1::<half::bf16>()?).to_vec()),
            other => bail!("Unsupported save dtype {:?}", other),
        };
        Ok(Self {
            dtype,
            shape: tensor.dims().to_vec(),
            bytes,
        })
    }
}

impl View for &TensorBytes {
    fn dtype(&self) -> SafeDtype {
        self.dtype
    }

    fn shape(&self) -> &[usize] {
        &self.shape
    }

    fn data(&self) -> Cow<[u8]> {
        Cow::Borrowed(&self.bytes)
    }

    fn data_len(&self) -> usize {
        self.bytes.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn projections() -> Vec<AttentionProjection> {
        vec![
            AttentionProjection::new("mid.attn1.to_q", 8, 8),
            AttentionProjection::new("mid.attn1.to_out.0", 8, 6),
            AttentionProjection::new("mid.ff.net.0", 8, 32),
        ]
    }

    fn targets() -> Vec<String> {
        ["to_q", "to_k", "to_v", "to_out.0"].iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_target_matching() {
        let t = targets();
        assert!(matches_target("a.attn2.to_k", &t));
        assert!(matches_target("to_v", &t));
        assert!(matches_target("x.to_out.0", &t));
        assert!(!matches_target("x.proj_to_q", &t));
        assert!(!matches_target("x.to_out.1", &t));
    }

    #[test]
    fn test_fresh_adapter_has_zero_delta() -> Result<()> {
        let mut rng = StdRng::seed_from_u64(1);
        let lora = LoraCollection::for_projections(&projections(), &targets(), 4, 4.0, &mut rng, &Device::Cpu)?;
        assert_eq!(lora.len(), 2);
        assert_eq!(lora.vars().len(), 4);

        let deltas = lora.weight_deltas()?;
        let delta = &deltas["mid.attn1.to_out.0.weight"];
        assert_eq!(delta.dims(), &[6, 8]);
        assert_eq!(delta.abs()?.sum_all()?.to_scalar::<f32>()?, 0.0);
        Ok(())
    }

    #[test]
    fn test_save_and_load() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut rng = StdRng::seed_from_u64(7);
        let lora = LoraCollection::for_projections(&projections(), &targets(), 2, 2.0, &mut rng, &Device::Cpu)?;
        let layer = lora.get("mid.attn1.to_q").context("layer")?;
        layer.up.set(&Tensor::ones((8, 2), DType::F32, &Device::Cpu)?)?;

        let config = AdapterConfig::new(2, 2.0, targets(), Some("sdxl-base".into()));
        lora.save(dir.path(), &config, DType::F32)?;

        let (adapter, loaded) = LoraAdapter::load(dir.path(), &Device::Cpu)?;
        assert_eq!(adapter.rank, 2);
        assert_eq!(adapter.layers, 2);
        assert_eq!(adapter.target_modules, targets());

        let original = lora.weight_deltas()?["mid.attn1.to_q.weight"].flatten_all()?.to_vec1::<f32>()?;
        let restored = loaded.weight_deltas()?["mid.attn1.to_q.weight"].flatten_all()?.to_vec1::<f32>()?;
        assert_eq!(original, restored);

        let json: serde_json::Value = serde_json::from_str(&fs::read_to_string(dir.path().join(ADAPTER_CONFIG_FILE))?)?;
        assert_eq!(json["peft_type"], "LORA");
        assert_eq!(json["r"], 2);
        Ok(())
    }

    #[test]
    fn test_half_precision_save() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut rng = StdRng::seed_from_u64(3);
        let lora = LoraCollection::for_projections(&projections(), &targets(), 2, 2.0, &mut rng, &Device::Cpu)?;
        let config = AdapterConfig::new(2, 2.0, targets(), None);
        let path = lora.save(dir.path(), &config, DType::F16)?;

        let tensors = candle_core::safetensors::load(&path, &Device::Cpu)?;
        let down = &tensors["base_model.model.mid.attn1.to_q.lora_A.weight"];
        assert_eq!(down.dtype(), DType::F16);
        assert_eq!(down.dims(), &[2, 8]);
        Ok(())
    }
}

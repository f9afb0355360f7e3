//! Checkpoint file resolution and parameter counting
//!
//! A model id is either a local directory holding `config.json`,
//! `tokenizer.json` and safetensors weights, or a HuggingFace Hub repo id
//! whose files are downloaded (and cached) through `hf-hub`.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use candle_core::safetensors::MmapedSafetensors;
use candle_core::{DType, Device};
use candle_nn::VarBuilder;
use hf_hub::{api::sync::Api, Repo, RepoType};
use serde::de::DeserializeOwned;
use tracing::info;

const CONFIG_FILE: &str = "config.json";
const TOKENIZER_FILE: &str = "tokenizer.json";
const SINGLE_WEIGHTS_FILE: &str = "model.safetensors";
const SHARD_INDEX_FILE: &str = "model.safetensors.index.json";

/// Tensors stored in checkpoints that are buffers, not trainable weights
const BUFFER_SUFFIXES: [&str; 5] = [
    ".attn.bias",
    ".attn.masked_bias",
    ".attention.bias",
    ".attention.masked_bias",
    "rotary_emb.inv_freq",
];

#[derive(Debug, serde::Deserialize)]
struct SafetensorsIndex {
    weight_map: std::collections::HashMap<String, String>,
}

/// Local paths of everything needed to build a scorer
#[derive(Debug, Clone)]
pub struct ModelFiles {
    pub config: PathBuf,
    pub tokenizer: PathBuf,
    pub weights: Vec<PathBuf>,
}

impl ModelFiles {
    /// Resolve `model_id` as a local directory, falling back to the Hub.
    pub fn resolve(model_id: &str) -> Result<Self> {
        let local = Path::new(model_id);
        if local.is_dir() {
            info!("Loading checkpoint from local directory {}", local.display());
            return Self::from_dir(local);
        }
        Self::from_hub(model_id)
    }

    /// Collect checkpoint files from a local directory
    pub fn from_dir(dir: &Path) -> Result<Self> {
        let config = existing(dir.join(CONFIG_FILE))?;
        let tokenizer = existing(dir.join(TOKENIZER_FILE))?;

        let index_path = dir.join(SHARD_INDEX_FILE);
        let weights = if index_path.is_file() {
            shard_names(&index_path)?
                .into_iter()
                .map(|name| existing(dir.join(name)))
                .collect::<Result<Vec<_>>>()?
        } else {
            vec![existing(dir.join(SINGLE_WEIGHTS_FILE))?]
        };

        Ok(Self {
            config,
            tokenizer,
            weights,
        })
    }

    /// Download (or reuse cached) checkpoint files from the HuggingFace Hub
    pub fn from_hub(model_id: &str) -> Result<Self> {
        let api = Api::new()?;
        let repo = api.repo(Repo::new(model_id.to_string(), RepoType::Model));

        let config = repo
            .get(CONFIG_FILE)
            .context("Failed to download config.json")?;
        let tokenizer = repo
            .get(TOKENIZER_FILE)
            .context("Failed to download tokenizer.json")?;

        let weights = if let Ok(index_path) = repo.get(SHARD_INDEX_FILE) {
            let shards = shard_names(&index_path)?;
            info!("Downloading {} shard files...", shards.len());
            let mut paths = Vec::with_capacity(shards.len());
            for shard in &shards {
                let path = repo
                    .get(shard)
                    .with_context(|| format!("Failed to download {shard}"))?;
                paths.push(path);
            }
            paths
        } else {
            let path = repo
                .get(SINGLE_WEIGHTS_FILE)
                .context("Failed to download model.safetensors")?;
            vec![path]
        };

        Ok(Self {
            config,
            tokenizer,
            weights,
        })
    }

    /// Parse `config.json` into an architecture-specific config
    pub fn read_config<T: DeserializeOwned>(&self) -> Result<T> {
        let raw = std::fs::read_to_string(&self.config).context("Failed to read config")?;
        serde_json::from_str(&raw)
            .with_context(|| format!("Invalid config in {}", self.config.display()))
    }

    /// Memory-map every weight file into a single `VarBuilder`
    pub fn var_builder(&self, dtype: DType, device: &Device) -> Result<VarBuilder<'static>> {
        info!("Loading weights from {} file(s)...", self.weights.len());
        // SAFETY: the files are not modified while the model is alive
        let vb = unsafe { VarBuilder::from_mmaped_safetensors(&self.weights, dtype, device)? };
        Ok(vb)
    }
}

fn existing(path: PathBuf) -> Result<PathBuf> {
    anyhow::ensure!(path.is_file(), "missing checkpoint file {}", path.display());
    Ok(path)
}

fn shard_names(index_path: &Path) -> Result<Vec<String>> {
    let raw = std::fs::read_to_string(index_path).context("Failed to read index")?;
    let index: SafetensorsIndex = serde_json::from_str(&raw)?;
    let mut names: Vec<String> = index.weight_map.into_values().collect();
    names.sort();
    names.dedup();
    Ok(names)
}

fn is_buffer(name: &str) -> bool {
    BUFFER_SUFFIXES.iter().any(|suffix| name.ends_with(suffix))
}

/// Total element count of every trainable tensor across `weights`
pub fn count_parameters(weights: &[PathBuf]) -> Result<usize> {
    // SAFETY: read-only mapping, dropped before returning
    let tensors = unsafe { MmapedSafetensors::multi(weights)? };
    let total = tensors
        .tensors()
        .iter()
        .filter(|(name, _)| !is_buffer(name))
        .map(|(_, view)| view.shape().iter().product::<usize>())
        .sum();
    Ok(total)
}

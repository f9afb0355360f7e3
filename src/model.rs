//! Candle-backed language-model scorer
//!
//! [`LmScorer`] loads a HuggingFace checkpoint (GPT-2, GPT-NeoX/Pythia,
//! LLaMA-family or Qwen2), tokenizes stimuli and turns logits into
//! next-token distributions and continuation log-probabilities.
//!
//! Sequences are scored one at a time, unpadded, so the result for an item
//! never depends on which other items share its batch.

use anyhow::{Context, Result};
use candle_core::{DType, Device, IndexOp, Tensor, D};
use tokenizers::Tokenizer;
use tracing::{debug, info};

use crate::error::SurprisalError;
use crate::forward_gpt2::Gpt2;
use crate::forward_gpt_neox::GptNeoX;
use crate::forward_llama::Llama;
use crate::scorer::{IncrementalScorer, Reduction};
use crate::weights::{count_parameters, ModelFiles};

/// Separator inserted between a prefix and its continuation
const CONTINUATION_SEPARATOR: &str = " ";

/// Supported model architectures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelArchitecture {
    /// GPT-2 (OpenAI)
    Gpt2,
    /// GPT-NeoX / Pythia (EleutherAI)
    GptNeoX,
    /// LLaMA, Mistral, SmolLM
    Llama,
    /// Qwen2 / Qwen2.5 (Alibaba)
    Qwen2,
}

impl ModelArchitecture {
    /// Detect architecture from model ID
    pub fn from_model_id(model_id: &str) -> Option<Self> {
        let model_lower = model_id.to_lowercase();
        if model_lower.contains("gpt2") {
            Some(ModelArchitecture::Gpt2)
        } else if model_lower.contains("pythia") || model_lower.contains("neox") {
            Some(ModelArchitecture::GptNeoX)
        } else if model_lower.contains("qwen") {
            Some(ModelArchitecture::Qwen2)
        } else if model_lower.contains("llama")
            || model_lower.contains("smollm")
            || model_lower.contains("mistral")
        {
            Some(ModelArchitecture::Llama)
        } else {
            None
        }
    }

    /// Map the `model_type` field of `config.json`
    pub fn from_model_type(model_type: &str) -> Option<Self> {
        match model_type {
            "gpt2" => Some(ModelArchitecture::Gpt2),
            "gpt_neox" => Some(ModelArchitecture::GptNeoX),
            "llama" | "mistral" => Some(ModelArchitecture::Llama),
            "qwen2" => Some(ModelArchitecture::Qwen2),
            _ => None,
        }
    }
}

/// Minimal decoder interface every backend implements.
pub trait CausalLm {
    fn n_layers(&self) -> usize;
    fn vocab_size(&self) -> usize;
    /// Longest sequence the model can attend over
    fn max_positions(&self) -> usize;
    /// `[batch, seq]` token ids -> `[batch, seq, vocab]` logits
    fn forward(&self, input_ids: &Tensor) -> Result<Tensor>;
}

/// Parse a device string: `cpu`, `cuda`, `cuda:N`, `metal`, `metal:N`
/// (`mps` is accepted as an alias for `metal`).
pub fn parse_device(device: &str) -> Result<Device> {
    let name = device.trim().to_lowercase();
    let (kind, ordinal) = match name.split_once(':') {
        Some((kind, ordinal)) => {
            let ordinal: usize = ordinal
                .parse()
                .with_context(|| format!("invalid device ordinal in '{name}'"))?;
            (kind.to_string(), ordinal)
        }
        None => (name.clone(), 0),
    };

    let device = match kind.as_str() {
        "cpu" => Device::Cpu,
        "cuda" | "gpu" => Device::new_cuda(ordinal)
            .with_context(|| format!("CUDA device {ordinal} is not available"))?,
        "metal" | "mps" => Device::new_metal(ordinal)
            .with_context(|| format!("Metal device {ordinal} is not available"))?,
        other => anyhow::bail!("unknown device '{other}'"),
    };
    Ok(device)
}

/// Language-model scorer over a loaded checkpoint
pub struct LmScorer {
    model: Box<dyn CausalLm>,
    tokenizer: Tokenizer,
    device: Device,
    architecture: ModelArchitecture,
    model_id: String,
    bos_token_id: Option<u32>,
    n_parameters: usize,
}

impl LmScorer {
    /// Load `model_id` (Hub repo id or local directory) onto `device`.
    pub fn load(model_id: &str, device: &str) -> Result<Self, SurprisalError> {
        Self::try_load(model_id, device).map_err(|e| SurprisalError::ModelLoad {
            model_id: model_id.to_string(),
            reason: format!("{e:#}"),
        })
    }

    fn try_load(model_id: &str, device: &str) -> Result<Self> {
        let device = parse_device(device)?;
        let dtype = DType::F32;

        let files = ModelFiles::resolve(model_id)?;
        let raw_config: serde_json::Value = files.read_config()?;
        let model_type = raw_config
            .get("model_type")
            .and_then(|v| v.as_str())
            .unwrap_or_default();

        let architecture = ModelArchitecture::from_model_id(model_id)
            .or_else(|| ModelArchitecture::from_model_type(model_type))
            .with_context(|| format!("unsupported model architecture '{model_type}'"))?;

        info!("Loading model: {}", model_id);
        info!("Architecture: {:?}", architecture);
        info!("Device: {:?}", device);

        let tokenizer = Tokenizer::from_file(&files.tokenizer)
            .map_err(|e| anyhow::anyhow!("Tokenizer error: {e}"))?;

        let model: Box<dyn CausalLm> = match architecture {
            ModelArchitecture::Gpt2 => Box::new(Gpt2::load(&files, &device, dtype)?),
            ModelArchitecture::GptNeoX => Box::new(GptNeoX::load(&files, &device, dtype)?),
            ModelArchitecture::Llama => Box::new(Llama::load(&files, &device, dtype, false)?),
            ModelArchitecture::Qwen2 => Box::new(Llama::load(&files, &device, dtype, true)?),
        };

        let bos_token_id = raw_config
            .get("bos_token_id")
            .and_then(|v| v.as_u64())
            .map(|id| id as u32)
            .or_else(|| special_token_id(&tokenizer));

        let n_parameters = count_parameters(&files.weights)?;
        info!(
            "Model loaded: {} layers, {} vocab, {} parameters",
            model.n_layers(),
            model.vocab_size(),
            n_parameters
        );

        Ok(Self {
            model,
            tokenizer,
            device,
            architecture,
            model_id: model_id.to_string(),
            bos_token_id,
            n_parameters,
        })
    }

    /// Get the model architecture
    pub fn architecture(&self) -> ModelArchitecture {
        self.architecture
    }

    /// Device the weights live on
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Number of decoder layers
    pub fn n_layers(&self) -> usize {
        self.model.n_layers()
    }

    /// Vocabulary size
    pub fn vocab_size(&self) -> usize {
        self.model.vocab_size()
    }

    /// Beginning-of-sequence token id, if the checkpoint defines one
    pub fn bos_token_id(&self) -> Option<u32> {
        self.bos_token_id
    }

    /// Tokenize `text` through the tokenizer's own post-processor.
    ///
    /// With `bos_token`, BOS is prepended unless the post-processor already
    /// put it first.
    pub fn encode(&self, text: &str, bos_token: bool) -> Result<Vec<u32>> {
        let encoding = self
            .tokenizer
            .encode(text, true)
            .map_err(|e| anyhow::anyhow!("Tokenization error: {e}"))?;
        let tokens = encoding.get_ids();

        if !bos_token {
            return Ok(tokens.to_vec());
        }
        let bos = self.bos_token_id.ok_or_else(|| {
            SurprisalError::Scoring(format!(
                "{} has no beginning-of-sequence token",
                self.model_id
            ))
        })?;
        if tokens.first() == Some(&bos) {
            return Ok(tokens.to_vec());
        }

        let mut ids = Vec::with_capacity(tokens.len() + 1);
        ids.push(bos);
        ids.extend_from_slice(tokens);
        Ok(ids)
    }

    /// Log-softmax over the vocabulary at every position of `ids`:
    /// `[seq, vocab]`
    fn position_log_probs(&self, ids: &[u32]) -> Result<Tensor> {
        if ids.is_empty() {
            return Err(SurprisalError::Scoring("cannot score an empty sequence".into()).into());
        }
        if ids.len() > self.model.max_positions() {
            return Err(SurprisalError::Scoring(format!(
                "sequence of {} tokens exceeds the {}-token context window",
                ids.len(),
                self.model.max_positions()
            ))
            .into());
        }

        let input = Tensor::new(ids, &self.device)?.unsqueeze(0)?;
        let logits = self.model.forward(&input)?.squeeze(0)?.to_dtype(DType::F32)?;
        Ok(candle_nn::ops::log_softmax(&logits, D::Minus1)?)
    }

    /// Log-probability distribution of the token following `prefix`
    pub fn next_token_log_probs(&self, prefix: &str, bos_token: bool) -> Result<Vec<f32>> {
        let ids = self.encode(prefix, bos_token)?;
        let log_probs = self.position_log_probs(&ids)?;
        Ok(log_probs.i(ids.len() - 1)?.to_vec1::<f32>()?)
    }

    /// Per-token log-probabilities of `continuation` given `prefix`.
    ///
    /// Continuation tokens are those of `prefix + " " + continuation` past
    /// the tokenized prefix. A token with no preceding context is skipped.
    pub fn continuation_log_probs(
        &self,
        prefix: &str,
        continuation: &str,
        bos_token: bool,
    ) -> Result<Vec<f32>> {
        if continuation.is_empty() {
            return Ok(Vec::new());
        }

        let context = self.encode(prefix, bos_token)?;
        let full_text = if prefix.is_empty() {
            continuation.to_string()
        } else {
            format!("{prefix}{CONTINUATION_SEPARATOR}{continuation}")
        };
        let full = self.encode(&full_text, bos_token)?;

        if !full.starts_with(&context) {
            debug!(
                "Prefix tokenization is not a prefix of the joined text: {:?} + {:?}",
                prefix, continuation
            );
        }
        if full.is_empty() {
            return Ok(Vec::new());
        }
        let start = context.len().clamp(1, full.len());
        if start == full.len() {
            return Ok(Vec::new());
        }

        let log_probs = self.position_log_probs(&full)?;
        let rows = log_probs.i(start - 1..full.len() - 1)?.to_vec2::<f32>()?;
        full[start..]
            .iter()
            .zip(rows)
            .map(|(&token, row)| {
                row.get(token as usize).copied().with_context(|| {
                    format!("token id {token} outside the {}-entry vocabulary", row.len())
                })
            })
            .collect()
    }
}

fn special_token_id(tokenizer: &Tokenizer) -> Option<u32> {
    let vocab = tokenizer.get_vocab(true);
    ["<|endoftext|>", "<s>", "<|begin_of_text|>", "<bos>"]
        .iter()
        .find_map(|token| vocab.get(*token).copied())
}

fn check_aligned(prefixes: &[&str], continuations: &[&str]) -> Result<()> {
    if prefixes.len() != continuations.len() {
        return Err(SurprisalError::Scoring(format!(
            "{} prefixes but {} continuations",
            prefixes.len(),
            continuations.len()
        ))
        .into());
    }
    Ok(())
}

impl IncrementalScorer for LmScorer {
    fn model_id(&self) -> &str {
        &self.model_id
    }

    fn num_parameters(&self) -> usize {
        self.n_parameters
    }

    fn next_word_distribution(&self, prefixes: &[&str], bos_token: bool) -> Result<Vec<Vec<f32>>> {
        prefixes
            .iter()
            .map(|prefix| self.next_token_log_probs(prefix, bos_token))
            .collect()
    }

    fn conditional_score(
        &self,
        prefixes: &[&str],
        continuations: &[&str],
        bos_token: bool,
        reduction: Reduction<'_>,
    ) -> Result<Vec<f64>> {
        check_aligned(prefixes, continuations)?;
        prefixes
            .iter()
            .zip(continuations)
            .map(|(prefix, continuation)| {
                let scores = self.continuation_log_probs(prefix, continuation, bos_token)?;
                Ok(reduction(&scores))
            })
            .collect()
    }
}

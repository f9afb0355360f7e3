//! LLaMA-family forward pass
//!
//! Shared by LLaMA, Mistral, SmolLM and Qwen2 checkpoints. Qwen2 differs
//! only in carrying a bias on the Q/K/V projections, selected by the
//! `qkv_bias` flag at load time.
//!
//! - RMSNorm, SwiGLU MLP, rotary embeddings (half-split layout)
//! - grouped-query attention when `num_key_value_heads < num_attention_heads`
//! - `lm_head` tied to `embed_tokens` when the checkpoint says so or ships
//!   no separate head

use anyhow::Result;
use candle_core::{DType, Device, Module, Tensor};
use candle_nn::{embedding, linear, linear_no_bias, Embedding, Linear, RmsNorm, VarBuilder};
use tracing::info;

use crate::masks::create_causal_mask;
use crate::model::CausalLm;
use crate::weights::ModelFiles;

/// Longest rotary table built at load time
const MAX_ROTARY_POSITIONS: usize = 8192;

/// Model configuration (matches HuggingFace config.json for LLaMA/Qwen2)
#[derive(Debug, Clone, serde::Deserialize)]
pub struct LlamaConfig {
    pub hidden_size: usize,
    pub intermediate_size: usize,
    pub num_attention_heads: usize,
    #[serde(default)]
    pub num_key_value_heads: Option<usize>,
    pub num_hidden_layers: usize,
    pub vocab_size: usize,
    #[serde(default)]
    pub head_dim: Option<usize>,
    #[serde(default = "default_rope_theta")]
    pub rope_theta: f64,
    #[serde(default = "default_rms_norm_eps")]
    pub rms_norm_eps: f64,
    #[serde(default = "default_max_position_embeddings")]
    pub max_position_embeddings: usize,
    #[serde(default)]
    pub tie_word_embeddings: bool,
    #[serde(default)]
    pub rope_scaling: Option<RopeScaling>,
}

/// `rope_scaling` block of config.json
#[derive(Debug, Clone, serde::Deserialize)]
pub struct RopeScaling {
    #[serde(default)]
    pub rope_type: Option<String>,
    /// Older configs name the field `type`
    #[serde(default, rename = "type")]
    pub legacy_type: Option<String>,
    #[serde(default = "default_scaling_factor")]
    pub factor: f64,
    #[serde(default = "default_low_freq_factor")]
    pub low_freq_factor: f64,
    #[serde(default = "default_high_freq_factor")]
    pub high_freq_factor: f64,
    #[serde(default)]
    pub original_max_position_embeddings: Option<usize>,
}

fn default_scaling_factor() -> f64 {
    1.0
}

fn default_low_freq_factor() -> f64 {
    1.0
}

fn default_high_freq_factor() -> f64 {
    4.0
}

impl RopeScaling {
    pub fn kind(&self) -> &str {
        self.rope_type
            .as_deref()
            .or(self.legacy_type.as_deref())
            .unwrap_or("default")
    }

    /// Rescale rotary inverse frequencies.
    ///
    /// Supports `default`, `linear` and `llama3`; any other type is an error.
    fn apply(&self, inv_freq: &[f64]) -> Result<Vec<f64>> {
        match self.kind() {
            "default" => Ok(inv_freq.to_vec()),
            "linear" => Ok(inv_freq.iter().map(|f| f / self.factor).collect()),
            "llama3" => {
                let original = self.original_max_position_embeddings.ok_or_else(|| {
                    anyhow::anyhow!("llama3 rope scaling needs original_max_position_embeddings")
                })? as f64;
                anyhow::ensure!(
                    self.high_freq_factor > self.low_freq_factor,
                    "llama3 rope scaling needs high_freq_factor > low_freq_factor"
                );
                let low_freq_wavelen = original / self.low_freq_factor;
                let high_freq_wavelen = original / self.high_freq_factor;
                Ok(inv_freq
                    .iter()
                    .map(|&freq| {
                        let wavelen = 2.0 * std::f64::consts::PI / freq;
                        if wavelen < high_freq_wavelen {
                            freq
                        } else if wavelen > low_freq_wavelen {
                            freq / self.factor
                        } else {
                            let smooth = (original / wavelen - self.low_freq_factor)
                                / (self.high_freq_factor - self.low_freq_factor);
                            (1.0 - smooth) * freq / self.factor + smooth * freq
                        }
                    })
                    .collect())
            }
            other => anyhow::bail!("Unsupported rope_scaling type: {other}"),
        }
    }
}

fn default_rope_theta() -> f64 {
    10_000.0
}

fn default_rms_norm_eps() -> f64 {
    1e-5
}

fn default_max_position_embeddings() -> usize {
    4096
}

impl LlamaConfig {
    fn head_dim(&self) -> usize {
        self.head_dim
            .unwrap_or(self.hidden_size / self.num_attention_heads)
    }

    fn kv_heads(&self) -> usize {
        self.num_key_value_heads.unwrap_or(self.num_attention_heads)
    }
}

/// Rotary Position Embeddings (RoPE)
struct RotaryEmbedding {
    cos: Tensor,
    sin: Tensor,
}

impl RotaryEmbedding {
    fn new(
        head_dim: usize,
        max_seq_len: usize,
        theta: f64,
        scaling: Option<&RopeScaling>,
        device: &Device,
        dtype: DType,
    ) -> Result<Self> {
        let inv_freq: Vec<f64> = (0..head_dim)
            .step_by(2)
            .map(|i| 1.0 / theta.powf(i as f64 / head_dim as f64))
            .collect();
        let inv_freq = match scaling {
            Some(scaling) => scaling.apply(&inv_freq)?,
            None => inv_freq,
        };
        let inv_freq: Vec<f32> = inv_freq.into_iter().map(|f| f as f32).collect();
        let inv_freq_len = inv_freq.len();
        let inv_freq = Tensor::from_vec(inv_freq, (1, inv_freq_len), device)?.to_dtype(dtype)?;
        let t = Tensor::arange(0u32, max_seq_len as u32, device)?
            .to_dtype(dtype)?
            .reshape((max_seq_len, 1))?;
        let freqs = t.matmul(&inv_freq)?;
        Ok(Self {
            cos: freqs.cos()?,
            sin: freqs.sin()?,
        })
    }

    fn apply(&self, q: &Tensor, k: &Tensor) -> Result<(Tensor, Tensor)> {
        let (_b, _h, seq_len, _d) = q.dims4()?;
        let cos = self.cos.narrow(0, 0, seq_len)?;
        let sin = self.sin.narrow(0, 0, seq_len)?;
        let q_embed = candle_nn::rotary_emb::rope(&q.contiguous()?, &cos, &sin)?;
        let k_embed = candle_nn::rotary_emb::rope(&k.contiguous()?, &cos, &sin)?;
        Ok((q_embed, k_embed))
    }
}

fn repeat_kv(x: Tensor, n_rep: usize) -> Result<Tensor> {
    if n_rep == 1 {
        return Ok(x);
    }
    let (b, num_kv_heads, seq_len, head_dim) = x.dims4()?;
    let x = x.unsqueeze(2)?;
    let x = x.expand((b, num_kv_heads, n_rep, seq_len, head_dim))?;
    Ok(x.reshape((b, num_kv_heads * n_rep, seq_len, head_dim))?)
}

struct Attention {
    q_proj: Linear,
    k_proj: Linear,
    v_proj: Linear,
    o_proj: Linear,
    num_heads: usize,
    num_kv_heads: usize,
    head_dim: usize,
}

impl Attention {
    fn load(vb: VarBuilder, config: &LlamaConfig, qkv_bias: bool) -> Result<Self> {
        let head_dim = config.head_dim();
        let kv_heads = config.kv_heads();
        let proj = |out: usize, name: &str| -> Result<Linear> {
            if qkv_bias {
                Ok(linear(config.hidden_size, out, vb.pp(name))?)
            } else {
                Ok(linear_no_bias(config.hidden_size, out, vb.pp(name))?)
            }
        };

        Ok(Self {
            q_proj: proj(config.num_attention_heads * head_dim, "q_proj")?,
            k_proj: proj(kv_heads * head_dim, "k_proj")?,
            v_proj: proj(kv_heads * head_dim, "v_proj")?,
            o_proj: linear_no_bias(
                config.num_attention_heads * head_dim,
                config.hidden_size,
                vb.pp("o_proj"),
            )?,
            num_heads: config.num_attention_heads,
            num_kv_heads: kv_heads,
            head_dim,
        })
    }

    fn forward(&self, x: &Tensor, rotary: &RotaryEmbedding, mask: &Tensor) -> Result<Tensor> {
        let (b, seq_len, _) = x.dims3()?;

        let q = self
            .q_proj
            .forward(x)?
            .reshape((b, seq_len, self.num_heads, self.head_dim))?
            .transpose(1, 2)?;
        let k = self
            .k_proj
            .forward(x)?
            .reshape((b, seq_len, self.num_kv_heads, self.head_dim))?
            .transpose(1, 2)?;
        let v = self
            .v_proj
            .forward(x)?
            .reshape((b, seq_len, self.num_kv_heads, self.head_dim))?
            .transpose(1, 2)?;

        let (q, k) = rotary.apply(&q, &k)?;

        let k = repeat_kv(k, self.num_heads / self.num_kv_heads)?.contiguous()?;
        let v = repeat_kv(v, self.num_heads / self.num_kv_heads)?.contiguous()?;

        let scale = 1.0 / (self.head_dim as f64).sqrt();
        let attn_weights = (q.matmul(&k.transpose(2, 3)?.contiguous()?)? * scale)?;
        let attn_weights = attn_weights.broadcast_add(mask)?;
        let attn_weights = candle_nn::ops::softmax_last_dim(&attn_weights)?;
        let attn_output = attn_weights.matmul(&v)?;

        let attn_output = attn_output.transpose(1, 2)?.reshape((b, seq_len, ()))?;
        Ok(self.o_proj.forward(&attn_output)?)
    }
}

/// SwiGLU feed-forward block, no bias
struct Mlp {
    gate_proj: Linear,
    up_proj: Linear,
    down_proj: Linear,
}

impl Mlp {
    fn load(vb: VarBuilder, config: &LlamaConfig) -> Result<Self> {
        Ok(Self {
            gate_proj: linear_no_bias(
                config.hidden_size,
                config.intermediate_size,
                vb.pp("gate_proj"),
            )?,
            up_proj: linear_no_bias(
                config.hidden_size,
                config.intermediate_size,
                vb.pp("up_proj"),
            )?,
            down_proj: linear_no_bias(
                config.intermediate_size,
                config.hidden_size,
                vb.pp("down_proj"),
            )?,
        })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let gate = candle_nn::ops::silu(&self.gate_proj.forward(x)?)?;
        let up = self.up_proj.forward(x)?;
        Ok(self.down_proj.forward(&(gate * up)?)?)
    }
}

struct DecoderLayer {
    self_attn: Attention,
    mlp: Mlp,
    input_layernorm: RmsNorm,
    post_attention_layernorm: RmsNorm,
}

impl DecoderLayer {
    fn load(vb: VarBuilder, config: &LlamaConfig, qkv_bias: bool) -> Result<Self> {
        Ok(Self {
            self_attn: Attention::load(vb.pp("self_attn"), config, qkv_bias)?,
            mlp: Mlp::load(vb.pp("mlp"), config)?,
            input_layernorm: candle_nn::rms_norm(
                config.hidden_size,
                config.rms_norm_eps,
                vb.pp("input_layernorm"),
            )?,
            post_attention_layernorm: candle_nn::rms_norm(
                config.hidden_size,
                config.rms_norm_eps,
                vb.pp("post_attention_layernorm"),
            )?,
        })
    }

    fn forward(&self, x: &Tensor, rotary: &RotaryEmbedding, mask: &Tensor) -> Result<Tensor> {
        let residual = x;
        let h = self.input_layernorm.forward(x)?;
        let h = (self.self_attn.forward(&h, rotary, mask)? + residual)?;

        let residual = &h;
        let out = self.post_attention_layernorm.forward(&h)?;
        let out = (self.mlp.forward(&out)? + residual)?;
        Ok(out)
    }
}

/// LLaMA-family decoder producing next-token logits
pub struct Llama {
    embed_tokens: Embedding,
    layers: Vec<DecoderLayer>,
    norm: RmsNorm,
    /// `None` when the unembedding is tied to `embed_tokens`
    lm_head: Option<Linear>,
    rotary: RotaryEmbedding,
    max_positions: usize,
    vocab_size: usize,
}

impl Llama {
    /// Build the model from resolved checkpoint files
    pub fn load(files: &ModelFiles, device: &Device, dtype: DType, qkv_bias: bool) -> Result<Self> {
        let config: LlamaConfig = files.read_config()?;
        if let Some(scaling) = &config.rope_scaling {
            info!("RoPE scaling: {} (factor {})", scaling.kind(), scaling.factor);
        }
        info!(
            "Model config: {} layers, {} hidden, {} heads ({} kv), {} vocab",
            config.num_hidden_layers,
            config.hidden_size,
            config.num_attention_heads,
            config.kv_heads(),
            config.vocab_size
        );

        let vb = files.var_builder(dtype, device)?;
        let vb_model = vb.pp("model");

        let embed_tokens = embedding(
            config.vocab_size,
            config.hidden_size,
            vb_model.pp("embed_tokens"),
        )?;

        let mut layers = Vec::with_capacity(config.num_hidden_layers);
        for i in 0..config.num_hidden_layers {
            if (i + 1) % 10 == 0 || i == 0 {
                info!("Loading layer {}/{}", i + 1, config.num_hidden_layers);
            }
            layers.push(DecoderLayer::load(
                vb_model.pp(format!("layers.{i}")),
                &config,
                qkv_bias,
            )?);
        }

        let norm =
            candle_nn::rms_norm(config.hidden_size, config.rms_norm_eps, vb_model.pp("norm"))?;

        let lm_head = if config.tie_word_embeddings || !vb.contains_tensor("lm_head.weight") {
            None
        } else {
            Some(linear_no_bias(
                config.hidden_size,
                config.vocab_size,
                vb.pp("lm_head"),
            )?)
        };

        let max_positions = config.max_position_embeddings.min(MAX_ROTARY_POSITIONS);
        let rotary = RotaryEmbedding::new(
            config.head_dim(),
            max_positions,
            config.rope_theta,
            config.rope_scaling.as_ref(),
            device,
            dtype,
        )?;

        Ok(Self {
            embed_tokens,
            layers,
            norm,
            lm_head,
            rotary,
            max_positions,
            vocab_size: config.vocab_size,
        })
    }
}

impl CausalLm for Llama {
    fn n_layers(&self) -> usize {
        self.layers.len()
    }

    fn vocab_size(&self) -> usize {
        self.vocab_size
    }

    fn max_positions(&self) -> usize {
        self.max_positions
    }

    fn forward(&self, input_ids: &Tensor) -> Result<Tensor> {
        let (_b, seq_len) = input_ids.dims2()?;
        let mut hidden = self.embed_tokens.forward(input_ids)?;

        let mask = create_causal_mask(seq_len, input_ids.device(), hidden.dtype())?;
        for layer in &self.layers {
            hidden = layer.forward(&hidden, &self.rotary, &mask)?;
        }

        let hidden = self.norm.forward(&hidden)?;
        let logits = match &self.lm_head {
            Some(lm_head) => lm_head.forward(&hidden)?,
            None => hidden.broadcast_matmul(&self.embed_tokens.embeddings().t()?)?,
        };
        Ok(logits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config: LlamaConfig = serde_json::from_str(
            r#"{
                "hidden_size": 64,
                "intermediate_size": 128,
                "num_attention_heads": 4,
                "num_hidden_layers": 2,
                "vocab_size": 100
            }"#,
        )
        .unwrap();
        assert_eq!(config.head_dim(), 16);
        assert_eq!(config.kv_heads(), 4);
        assert!(!config.tie_word_embeddings);
        assert_eq!(config.rope_theta, 10_000.0);
        assert!(config.rope_scaling.is_none());
    }

    fn llama3_scaling() -> RopeScaling {
        serde_json::from_str(
            r#"{
                "rope_type": "llama3",
                "factor": 8.0,
                "low_freq_factor": 1.0,
                "high_freq_factor": 4.0,
                "original_max_position_embeddings": 8192
            }"#,
        )
        .unwrap()
    }

    #[test]
    fn test_llama3_scaling_bands() {
        let scaling = llama3_scaling();
        // wavelengths: ~6 (high band), ~2e5 (low band), 4096 (between)
        let inv_freq = [1.0, 3.0e-5, 2.0 * std::f64::consts::PI / 4096.0];
        let scaled = scaling.apply(&inv_freq).unwrap();

        assert_eq!(scaled[0], 1.0);
        assert!((scaled[1] - 3.0e-5 / 8.0).abs() < 1e-12);
        // 8192 / 4096 = 2 -> smooth = 1/3
        let expected = (2.0 / 3.0) * inv_freq[2] / 8.0 + (1.0 / 3.0) * inv_freq[2];
        assert!((scaled[2] - expected).abs() < 1e-12);
    }

    #[test]
    fn test_rope_scaling_from_config() {
        let config: LlamaConfig = serde_json::from_str(
            r#"{
                "hidden_size": 64,
                "intermediate_size": 128,
                "num_attention_heads": 4,
                "num_hidden_layers": 2,
                "vocab_size": 100,
                "rope_scaling": {"type": "linear", "factor": 2.0}
            }"#,
        )
        .unwrap();
        let scaling = config.rope_scaling.unwrap();
        assert_eq!(scaling.kind(), "linear");
        assert_eq!(scaling.apply(&[0.5, 0.25]).unwrap(), vec![0.25, 0.125]);
    }

    #[test]
    fn test_unsupported_rope_scaling_rejected() {
        let scaling: RopeScaling =
            serde_json::from_str(r#"{"rope_type": "yarn", "factor": 4.0}"#).unwrap();
        assert!(scaling.apply(&[1.0]).is_err());

        let mut missing = llama3_scaling();
        missing.original_max_position_embeddings = None;
        assert!(missing.apply(&[1.0]).is_err());
    }

    #[test]
    fn test_null_rope_scaling() {
        let config: LlamaConfig = serde_json::from_str(
            r#"{
                "hidden_size": 64,
                "intermediate_size": 128,
                "num_attention_heads": 4,
                "num_hidden_layers": 2,
                "vocab_size": 100,
                "rope_scaling": null
            }"#,
        )
        .unwrap();
        assert!(config.rope_scaling.is_none());
    }

    #[test]
    fn test_repeat_kv_expands_heads() {
        let x = Tensor::arange(0f32, 12.0, &Device::Cpu)
            .unwrap()
            .reshape((1, 2, 3, 2))
            .unwrap();
        let out = repeat_kv(x.clone(), 2).unwrap();
        assert_eq!(out.dims(), &[1, 4, 3, 2]);

        let heads: Vec<Vec<Vec<f32>>> = out.squeeze(0).unwrap().to_vec3().unwrap();
        assert_eq!(heads[0], heads[1]);
        assert_eq!(heads[2], heads[3]);
        assert_ne!(heads[0], heads[2]);
    }
}

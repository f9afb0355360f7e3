//! GPT-NeoX forward pass (Pythia suite)
//!
//! Differences from GPT-2 that matter here:
//! - rotary embeddings on the first `rotary_pct` of each head
//! - fused QKV laid out per head as `[q | k | v]`
//! - parallel residual: `x + attn(ln1(x)) + mlp(ln2(x))`
//! - separate, untied `embed_out` unembedding

use anyhow::Result;
use candle_core::{DType, Device, Module, Tensor, D};
use candle_nn::{
    embedding, layer_norm, linear, linear_no_bias, Embedding, LayerNorm, Linear, VarBuilder,
};
use tracing::info;

use crate::masks::create_causal_mask;
use crate::model::CausalLm;
use crate::weights::ModelFiles;

/// Longest rotary table built at load time
const MAX_ROTARY_POSITIONS: usize = 8192;

/// Model configuration (matches HuggingFace config.json for GPT-NeoX)
#[derive(Debug, Clone, serde::Deserialize)]
pub struct GptNeoXConfig {
    pub vocab_size: usize,
    pub hidden_size: usize,
    pub num_attention_heads: usize,
    pub num_hidden_layers: usize,
    pub intermediate_size: usize,
    #[serde(default = "default_rotary_pct")]
    pub rotary_pct: f64,
    #[serde(default = "default_rotary_emb_base")]
    pub rotary_emb_base: f64,
    #[serde(default = "default_max_position_embeddings")]
    pub max_position_embeddings: usize,
    #[serde(default = "default_layer_norm_eps")]
    pub layer_norm_eps: f64,
    #[serde(default = "default_use_parallel_residual")]
    pub use_parallel_residual: bool,
    #[serde(default = "default_hidden_act")]
    pub hidden_act: String,
}

fn default_rotary_pct() -> f64 {
    0.25
}

fn default_rotary_emb_base() -> f64 {
    10_000.0
}

fn default_max_position_embeddings() -> usize {
    2048
}

fn default_layer_norm_eps() -> f64 {
    1e-5
}

fn default_use_parallel_residual() -> bool {
    true
}

fn default_hidden_act() -> String {
    "gelu".to_string()
}

/// Rotary tables for the rotated slice of each head
struct RotaryEmbedding {
    cos: Tensor,
    sin: Tensor,
    rotary_dim: usize,
}

impl RotaryEmbedding {
    fn new(
        rotary_dim: usize,
        max_seq_len: usize,
        base: f64,
        device: &Device,
        dtype: DType,
    ) -> Result<Self> {
        let inv_freq: Vec<f32> = (0..rotary_dim)
            .step_by(2)
            .map(|i| 1.0f32 / (base.powf(i as f64 / rotary_dim as f64) as f32))
            .collect();
        let inv_freq_len = inv_freq.len();
        let inv_freq = Tensor::from_vec(inv_freq, (1, inv_freq_len), device)?.to_dtype(dtype)?;
        let t = Tensor::arange(0u32, max_seq_len as u32, device)?
            .to_dtype(dtype)?
            .reshape((max_seq_len, 1))?;
        let freqs = t.matmul(&inv_freq)?;
        Ok(Self {
            cos: freqs.cos()?,
            sin: freqs.sin()?,
            rotary_dim,
        })
    }

    /// Rotate the leading `rotary_dim` channels, pass the rest through
    fn apply(&self, x: &Tensor) -> Result<Tensor> {
        let (_b, _h, seq_len, head_dim) = x.dims4()?;
        let cos = self.cos.narrow(0, 0, seq_len)?;
        let sin = self.sin.narrow(0, 0, seq_len)?;

        let rot = x.narrow(D::Minus1, 0, self.rotary_dim)?.contiguous()?;
        let rot = candle_nn::rotary_emb::rope(&rot, &cos, &sin)?;
        if self.rotary_dim == head_dim {
            return Ok(rot);
        }
        let pass = x.narrow(D::Minus1, self.rotary_dim, head_dim - self.rotary_dim)?;
        Ok(Tensor::cat(&[&rot, &pass], D::Minus1)?)
    }
}

fn activation(name: &str, x: &Tensor) -> Result<Tensor> {
    match name {
        "gelu" => Ok(x.gelu_erf()?),
        "gelu_new" | "gelu_fast" | "gelu_pytorch_tanh" => Ok(x.gelu()?),
        "relu" => Ok(x.relu()?),
        other => anyhow::bail!("Unsupported GPT-NeoX activation: {other}"),
    }
}

struct Attention {
    query_key_value: Linear,
    dense: Linear,
    n_heads: usize,
    head_dim: usize,
}

impl Attention {
    fn load(vb: VarBuilder, config: &GptNeoXConfig) -> Result<Self> {
        let query_key_value = linear(
            config.hidden_size,
            3 * config.hidden_size,
            vb.pp("query_key_value"),
        )?;
        let dense = linear(config.hidden_size, config.hidden_size, vb.pp("dense"))?;
        Ok(Self {
            query_key_value,
            dense,
            n_heads: config.num_attention_heads,
            head_dim: config.hidden_size / config.num_attention_heads,
        })
    }

    fn forward(&self, x: &Tensor, rotary: &RotaryEmbedding, mask: &Tensor) -> Result<Tensor> {
        let (b, seq_len, hidden) = x.dims3()?;

        // [b, seq, heads, 3 * head_dim], each head holding q | k | v
        let qkv = self
            .query_key_value
            .forward(x)?
            .reshape((b, seq_len, self.n_heads, 3 * self.head_dim))?;
        let heads = |offset: usize| -> Result<Tensor> {
            Ok(qkv
                .narrow(D::Minus1, offset, self.head_dim)?
                .transpose(1, 2)?
                .contiguous()?)
        };
        let q = rotary.apply(&heads(0)?)?;
        let k = rotary.apply(&heads(self.head_dim)?)?;
        let v = heads(2 * self.head_dim)?;

        let scale = 1.0 / (self.head_dim as f64).sqrt();
        let attn_weights = (q.contiguous()?.matmul(&k.transpose(2, 3)?.contiguous()?)? * scale)?;
        let attn_weights = attn_weights.broadcast_add(mask)?;
        let attn_weights = candle_nn::ops::softmax_last_dim(&attn_weights)?;
        let attn_output = attn_weights.matmul(&v)?;

        let attn_output = attn_output.transpose(1, 2)?.reshape((b, seq_len, hidden))?;
        Ok(self.dense.forward(&attn_output)?)
    }
}

struct Mlp {
    dense_h_to_4h: Linear,
    dense_4h_to_h: Linear,
    act: String,
}

impl Mlp {
    fn load(vb: VarBuilder, config: &GptNeoXConfig) -> Result<Self> {
        Ok(Self {
            dense_h_to_4h: linear(
                config.hidden_size,
                config.intermediate_size,
                vb.pp("dense_h_to_4h"),
            )?,
            dense_4h_to_h: linear(
                config.intermediate_size,
                config.hidden_size,
                vb.pp("dense_4h_to_h"),
            )?,
            act: config.hidden_act.clone(),
        })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let hidden = activation(&self.act, &self.dense_h_to_4h.forward(x)?)?;
        Ok(self.dense_4h_to_h.forward(&hidden)?)
    }
}

struct Layer {
    input_layernorm: LayerNorm,
    post_attention_layernorm: LayerNorm,
    attention: Attention,
    mlp: Mlp,
    parallel_residual: bool,
}

impl Layer {
    fn load(vb: VarBuilder, config: &GptNeoXConfig) -> Result<Self> {
        Ok(Self {
            input_layernorm: layer_norm(
                config.hidden_size,
                config.layer_norm_eps,
                vb.pp("input_layernorm"),
            )?,
            post_attention_layernorm: layer_norm(
                config.hidden_size,
                config.layer_norm_eps,
                vb.pp("post_attention_layernorm"),
            )?,
            attention: Attention::load(vb.pp("attention"), config)?,
            mlp: Mlp::load(vb.pp("mlp"), config)?,
            parallel_residual: config.use_parallel_residual,
        })
    }

    fn forward(&self, x: &Tensor, rotary: &RotaryEmbedding, mask: &Tensor) -> Result<Tensor> {
        let attn = self
            .attention
            .forward(&self.input_layernorm.forward(x)?, rotary, mask)?;
        if self.parallel_residual {
            let mlp = self.mlp.forward(&self.post_attention_layernorm.forward(x)?)?;
            Ok(((x + attn)? + mlp)?)
        } else {
            let h = (x + attn)?;
            let mlp = self.mlp.forward(&self.post_attention_layernorm.forward(&h)?)?;
            Ok((h + mlp)?)
        }
    }
}

/// GPT-NeoX decoder producing next-token logits
pub struct GptNeoX {
    embed_in: Embedding,
    layers: Vec<Layer>,
    final_layer_norm: LayerNorm,
    embed_out: Linear,
    rotary: RotaryEmbedding,
    max_positions: usize,
    vocab_size: usize,
}

impl GptNeoX {
    /// Build the model from resolved checkpoint files
    pub fn load(files: &ModelFiles, device: &Device, dtype: DType) -> Result<Self> {
        let config: GptNeoXConfig = files.read_config()?;
        info!(
            "GPT-NeoX config: {} layers, {} hidden, {} heads, {} vocab",
            config.num_hidden_layers,
            config.hidden_size,
            config.num_attention_heads,
            config.vocab_size
        );

        let vb = files.var_builder(dtype, device)?;
        let vb_model = vb.pp("gpt_neox");

        let embed_in = embedding(config.vocab_size, config.hidden_size, vb_model.pp("embed_in"))?;
        let mut layers = Vec::with_capacity(config.num_hidden_layers);
        for i in 0..config.num_hidden_layers {
            layers.push(Layer::load(vb_model.pp(format!("layers.{i}")), &config)?);
        }
        let final_layer_norm = layer_norm(
            config.hidden_size,
            config.layer_norm_eps,
            vb_model.pp("final_layer_norm"),
        )?;
        let embed_out = linear_no_bias(config.hidden_size, config.vocab_size, vb.pp("embed_out"))?;

        let head_dim = config.hidden_size / config.num_attention_heads;
        let rotary_dim = ((head_dim as f64) * config.rotary_pct) as usize;
        anyhow::ensure!(
            rotary_dim > 0 && rotary_dim % 2 == 0,
            "rotary dimension {rotary_dim} must be positive and even"
        );
        let max_positions = config.max_position_embeddings.min(MAX_ROTARY_POSITIONS);
        let rotary = RotaryEmbedding::new(
            rotary_dim,
            max_positions,
            config.rotary_emb_base,
            device,
            dtype,
        )?;

        Ok(Self {
            embed_in,
            layers,
            final_layer_norm,
            embed_out,
            rotary,
            max_positions,
            vocab_size: config.vocab_size,
        })
    }
}

impl CausalLm for GptNeoX {
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
        let mut hidden = self.embed_in.forward(input_ids)?;

        let mask = create_causal_mask(seq_len, input_ids.device(), hidden.dtype())?;
        for layer in &self.layers {
            hidden = layer.forward(&hidden, &self.rotary, &mask)?;
        }

        let hidden = self.final_layer_norm.forward(&hidden)?;
        Ok(self.embed_out.forward(&hidden)?)
    }
}

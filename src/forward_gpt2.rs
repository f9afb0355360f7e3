//! GPT-2 forward pass
//!
//! Covers the OpenAI GPT-2 family (`gpt2`, `gpt2-medium`, ..., `distilgpt2`).
//! Checkpoints store projections as `Conv1D` (`[in, out]` weights), so they
//! are transposed once at load time into ordinary `Linear` layers. The
//! unembedding is tied to the token embedding.

use anyhow::Result;
use candle_core::{DType, Device, Module, Tensor, D};
use candle_nn::{embedding, layer_norm, Embedding, LayerNorm, Linear, VarBuilder};
use tracing::info;

use crate::masks::create_causal_mask;
use crate::model::CausalLm;
use crate::weights::ModelFiles;

/// Model configuration (matches HuggingFace config.json for GPT-2)
#[derive(Debug, Clone, serde::Deserialize)]
pub struct Gpt2Config {
    pub vocab_size: usize,
    pub n_embd: usize,
    pub n_head: usize,
    pub n_layer: usize,
    #[serde(default = "default_n_positions")]
    pub n_positions: usize,
    #[serde(default = "default_layer_norm_epsilon")]
    pub layer_norm_epsilon: f64,
    #[serde(default)]
    pub n_inner: Option<usize>,
}

fn default_n_positions() -> usize {
    1024
}

fn default_layer_norm_epsilon() -> f64 {
    1e-5
}

/// Load a `Conv1D` projection as a `Linear` layer
fn conv1d(in_dim: usize, out_dim: usize, vb: VarBuilder) -> Result<Linear> {
    let weight = vb.get((in_dim, out_dim), "weight")?;
    let bias = vb.get(out_dim, "bias")?;
    Ok(Linear::new(weight.t()?.contiguous()?, Some(bias)))
}

/// Fused-QKV causal self-attention
struct Attention {
    c_attn: Linear,
    c_proj: Linear,
    n_head: usize,
    head_dim: usize,
}

impl Attention {
    fn load(vb: VarBuilder, config: &Gpt2Config) -> Result<Self> {
        let c_attn = conv1d(config.n_embd, 3 * config.n_embd, vb.pp("c_attn"))?;
        let c_proj = conv1d(config.n_embd, config.n_embd, vb.pp("c_proj"))?;
        Ok(Self {
            c_attn,
            c_proj,
            n_head: config.n_head,
            head_dim: config.n_embd / config.n_head,
        })
    }

    /// `[b, seq, n_embd]` -> `[b, heads, seq, head_dim]`
    fn split_heads(&self, x: &Tensor, b: usize, seq_len: usize) -> Result<Tensor> {
        Ok(x
            .contiguous()?
            .reshape((b, seq_len, self.n_head, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()?)
    }

    fn forward(&self, x: &Tensor, mask: &Tensor) -> Result<Tensor> {
        let (b, seq_len, n_embd) = x.dims3()?;

        let qkv = self.c_attn.forward(x)?;
        let q = self.split_heads(&qkv.narrow(D::Minus1, 0, n_embd)?, b, seq_len)?;
        let k = self.split_heads(&qkv.narrow(D::Minus1, n_embd, n_embd)?, b, seq_len)?;
        let v = self.split_heads(&qkv.narrow(D::Minus1, 2 * n_embd, n_embd)?, b, seq_len)?;

        let scale = 1.0 / (self.head_dim as f64).sqrt();
        let attn_weights = (q.matmul(&k.transpose(2, 3)?.contiguous()?)? * scale)?;
        let attn_weights = attn_weights.broadcast_add(mask)?;
        let attn_weights = candle_nn::ops::softmax_last_dim(&attn_weights)?;
        let attn_output = attn_weights.matmul(&v)?;

        let attn_output = attn_output.transpose(1, 2)?.reshape((b, seq_len, n_embd))?;
        Ok(self.c_proj.forward(&attn_output)?)
    }
}

/// Feed-forward block with tanh-approximated GELU
struct Mlp {
    c_fc: Linear,
    c_proj: Linear,
}

impl Mlp {
    fn load(vb: VarBuilder, config: &Gpt2Config) -> Result<Self> {
        let inner = config.n_inner.unwrap_or(4 * config.n_embd);
        Ok(Self {
            c_fc: conv1d(config.n_embd, inner, vb.pp("c_fc"))?,
            c_proj: conv1d(inner, config.n_embd, vb.pp("c_proj"))?,
        })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let hidden = self.c_fc.forward(x)?.gelu()?;
        Ok(self.c_proj.forward(&hidden)?)
    }
}

/// Pre-norm transformer block
struct Block {
    ln_1: LayerNorm,
    attn: Attention,
    ln_2: LayerNorm,
    mlp: Mlp,
}

impl Block {
    fn load(vb: VarBuilder, config: &Gpt2Config) -> Result<Self> {
        Ok(Self {
            ln_1: layer_norm(config.n_embd, config.layer_norm_epsilon, vb.pp("ln_1"))?,
            attn: Attention::load(vb.pp("attn"), config)?,
            ln_2: layer_norm(config.n_embd, config.layer_norm_epsilon, vb.pp("ln_2"))?,
            mlp: Mlp::load(vb.pp("mlp"), config)?,
        })
    }

    fn forward(&self, x: &Tensor, mask: &Tensor) -> Result<Tensor> {
        let residual = x;
        let h = (self.attn.forward(&self.ln_1.forward(x)?, mask)? + residual)?;
        let out = (self.mlp.forward(&self.ln_2.forward(&h)?)? + &h)?;
        Ok(out)
    }
}

/// GPT-2 decoder producing next-token logits
pub struct Gpt2 {
    wte: Embedding,
    wpe: Embedding,
    blocks: Vec<Block>,
    ln_f: LayerNorm,
    n_positions: usize,
    vocab_size: usize,
}

impl Gpt2 {
    /// Build the model from resolved checkpoint files
    pub fn load(files: &ModelFiles, device: &Device, dtype: DType) -> Result<Self> {
        let config: Gpt2Config = files.read_config()?;
        info!(
            "GPT-2 config: {} layers, {} hidden, {} heads, {} vocab",
            config.n_layer, config.n_embd, config.n_head, config.vocab_size
        );

        let vb = files.var_builder(dtype, device)?;
        // Some exports nest everything under `transformer.`
        let vb = if vb.contains_tensor("transformer.wte.weight") {
            vb.pp("transformer")
        } else {
            vb
        };

        let wte = embedding(config.vocab_size, config.n_embd, vb.pp("wte"))?;
        let wpe = embedding(config.n_positions, config.n_embd, vb.pp("wpe"))?;

        let mut blocks = Vec::with_capacity(config.n_layer);
        for i in 0..config.n_layer {
            blocks.push(Block::load(vb.pp(format!("h.{i}")), &config)?);
        }
        let ln_f = layer_norm(config.n_embd, config.layer_norm_epsilon, vb.pp("ln_f"))?;

        Ok(Self {
            wte,
            wpe,
            blocks,
            ln_f,
            n_positions: config.n_positions,
            vocab_size: config.vocab_size,
        })
    }
}

impl CausalLm for Gpt2 {
    fn n_layers(&self) -> usize {
        self.blocks.len()
    }

    fn vocab_size(&self) -> usize {
        self.vocab_size
    }

    fn max_positions(&self) -> usize {
        self.n_positions
    }

    fn forward(&self, input_ids: &Tensor) -> Result<Tensor> {
        let (_b, seq_len) = input_ids.dims2()?;
        let device = input_ids.device();

        let positions = Tensor::arange(0u32, seq_len as u32, device)?.unsqueeze(0)?;
        let token_embeds = self.wte.forward(input_ids)?;
        let mut hidden = token_embeds.broadcast_add(&self.wpe.forward(&positions)?)?;

        let mask = create_causal_mask(seq_len, device, hidden.dtype())?;
        for block in &self.blocks {
            hidden = block.forward(&hidden, &mask)?;
        }

        let hidden = self.ln_f.forward(&hidden)?;
        Ok(hidden.broadcast_matmul(&self.wte.embeddings().t()?)?)
    }
}

// Pedantic clippy configuration for ML/math codebase
#![allow(clippy::cast_precision_loss)] // usize→f64/f32 intentional in ML
#![allow(clippy::cast_possible_truncation)] // usize→u32 in tensor indexing
#![allow(clippy::module_name_repetitions)] // ModelArchitecture in model.rs is fine
#![allow(clippy::doc_markdown)] // backticks for every technical term is excessive
#![allow(clippy::missing_errors_doc)] // # Errors section for every Result fn
#![allow(clippy::must_use_candidate)] // #[must_use] on every pure fn is excessive

//! lm-surprisal: psycholinguistic surprisal statistics from causal LMs
//!
//! Scores stimulus sentences with a pretrained language model and records,
//! per item, the entropy of the next-token distribution after the prefix
//! and the log-probabilities of an expected continuation and two
//! distractors.
//!
//! ## Architecture
//!
//! - `stimuli`: stimulus dataset loading and CSV output
//! - `batch`: fixed-size batching over the dataset
//! - `scorer`: the scoring capability the pipeline depends on
//! - `entropy`: Shannon entropy of log-probability vectors
//! - `experiment`: batch-scoring pipeline producing the results table
//! - `model`: candle-backed scorer over HuggingFace checkpoints
//! - `weights`: checkpoint file resolution and parameter counting
//! - `forward_gpt2`, `forward_gpt_neox`, `forward_llama`: decoder forward passes
//! - `masks`: causal attention mask
//! - `error`: error taxonomy

pub mod batch;
pub mod entropy;
pub mod error;
pub mod experiment;
pub mod forward_gpt2;
pub mod forward_gpt_neox;
pub mod forward_llama;
pub mod masks;
pub mod model;
pub mod scorer;
pub mod stimuli;
pub mod weights;

pub use batch::{make_batches, Batches};
pub use entropy::entropy_from_log_probs;
pub use error::SurprisalError;
pub use experiment::{
    read_results, sanitize_model_name, Experiment, ExperimentConfig, ExperimentResults,
    ResultRow, OUTPUT_HEADER,
};
pub use forward_gpt2::Gpt2;
pub use forward_gpt_neox::GptNeoX;
pub use forward_llama::Llama;
pub use model::{parse_device, CausalLm, LmScorer, ModelArchitecture};
pub use scorer::{sum_reduction, uses_begin_token, IncrementalScorer, Reduction};
pub use stimuli::{
    read_records, write_records, write_rows, Stimuli, StimulusRecord, REQUIRED_COLUMNS,
};
pub use weights::{count_parameters, ModelFiles};

//! Scoring capability consumed by the experiment driver
//!
//! [`IncrementalScorer`] is the seam between the experiment pipeline and
//! whatever computes language-model probabilities. [`crate::LmScorer`] is
//! the candle-backed implementation; tests plug in deterministic fakes.

use anyhow::Result;

/// Reduction applied to the per-token log-probabilities of a continuation
pub type Reduction<'a> = &'a dyn Fn(&[f32]) -> f64;

/// Next-token distributions and conditional scores from a causal LM.
///
/// Every method returns one entry per input, aligned positionally.
pub trait IncrementalScorer {
    /// Identifier the model was loaded from
    fn model_id(&self) -> &str;

    /// Total trainable parameter count, fixed for the lifetime of the model
    fn num_parameters(&self) -> usize;

    /// Full-vocabulary natural-log probabilities of the token that follows
    /// each prefix.
    fn next_word_distribution(&self, prefixes: &[&str], bos_token: bool) -> Result<Vec<Vec<f32>>>;

    /// Log-probability of each continuation given its prefix, reduced to a
    /// scalar with `reduction`.
    fn conditional_score(
        &self,
        prefixes: &[&str],
        continuations: &[&str],
        bos_token: bool,
        reduction: Reduction<'_>,
    ) -> Result<Vec<f64>>;
}

/// Sum of token log-probabilities (the log-probability of the whole span)
pub fn sum_reduction(scores: &[f32]) -> f64 {
    scores.iter().map(|&s| f64::from(s)).sum()
}

/// Whether inputs for `model_id` need an explicit beginning-of-sequence token.
///
/// GPT-2 and Pythia checkpoints do not add one on their own, so the first
/// word would otherwise be unconditioned. The match is case-sensitive.
pub fn uses_begin_token(model_id: &str) -> bool {
    model_id.contains("gpt2") || model_id.contains("pythia")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_begin_token_policy() {
        assert!(uses_begin_token("gpt2"));
        assert!(uses_begin_token("openai-community/gpt2-medium"));
        assert!(uses_begin_token("distilgpt2"));
        assert!(uses_begin_token("EleutherAI/pythia-70m"));
        assert!(!uses_begin_token("HuggingFaceTB/SmolLM2-135M"));
        assert!(!uses_begin_token("Qwen/Qwen2.5-0.5B"));
        assert!(!uses_begin_token("GPT2-Custom"));
        assert!(!uses_begin_token("EleutherAI/Pythia-70m"));
    }

    #[test]
    fn test_reductions() {
        let scores = [-1.0f32, -2.5, -0.5];
        assert_eq!(sum_reduction(&scores), -4.0);
        assert_eq!(sum_reduction(&[]), 0.0);
    }
}

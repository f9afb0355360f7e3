//! Experiment runner for surprisal statistics
//!
//! Reads the stimulus dataset, scores it batch by batch through an
//! [`IncrementalScorer`], and writes one result row per stimulus in a
//! single final CSV write.

use std::path::{Path, PathBuf};

use anyhow::Result;
use indicatif::{ProgressBar, ProgressStyle};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::batch::make_batches;
use crate::entropy::entropy_from_log_probs;
use crate::error::SurprisalError;
use crate::scorer::{sum_reduction, uses_begin_token, IncrementalScorer};
use crate::stimuli::{write_rows, Stimuli, StimulusRecord};

/// Header of the results file
pub const OUTPUT_HEADER: [&str; 6] = [
    "item",
    "entropy",
    "expected_logprob",
    "within_logprob",
    "between_logprob",
    "parameters",
];

/// Per-stimulus output row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultRow {
    pub item: String,
    pub entropy: f64,
    pub expected_logprob: f64,
    pub within_logprob: f64,
    pub between_logprob: f64,
    pub parameters: usize,
}

/// Configuration for a scoring run
#[derive(Debug, Clone)]
pub struct ExperimentConfig {
    /// Path to the stimulus CSV
    pub dataset_path: PathBuf,
    /// Directory receiving `<model>.csv`; created if missing
    pub output_dir: PathBuf,
    /// Stimuli per scorer call
    pub batch_size: usize,
    /// Draw a progress bar over batches
    pub show_progress: bool,
}

impl Default for ExperimentConfig {
    fn default() -> Self {
        Self {
            dataset_path: PathBuf::from("data/fk1999-final.csv"),
            output_dir: PathBuf::from("results/fk1999/"),
            batch_size: 32,
            show_progress: true,
        }
    }
}

/// Results of a completed run
#[derive(Debug)]
pub struct ExperimentResults {
    /// One row per stimulus, in dataset order
    pub rows: Vec<ResultRow>,
    /// Where the rows were written
    pub output_path: PathBuf,
}

/// File-name-safe form of a model id: path separators become `__`
pub fn sanitize_model_name(model_id: &str) -> String {
    model_id.replace(['/', '\\'], "__")
}

/// Main experiment runner
pub struct Experiment<'a> {
    scorer: &'a dyn IncrementalScorer,
    config: ExperimentConfig,
    bos_token: bool,
    parameters: usize,
}

impl<'a> Experiment<'a> {
    /// Create a new experiment; the parameter count and begin-token policy
    /// are fixed here for the whole run.
    pub fn new(scorer: &'a dyn IncrementalScorer, config: ExperimentConfig) -> Self {
        let bos_token = uses_begin_token(scorer.model_id());
        let parameters = scorer.num_parameters();
        Self {
            scorer,
            config,
            bos_token,
            parameters,
        }
    }

    /// Run configuration
    pub fn config(&self) -> &ExperimentConfig {
        &self.config
    }

    /// `<output_dir>/<sanitized model id>.csv`
    pub fn output_path(&self) -> PathBuf {
        self.config
            .output_dir
            .join(format!("{}.csv", sanitize_model_name(self.scorer.model_id())))
    }

    /// Run the full experiment: load, score, write.
    pub fn run(&self) -> Result<ExperimentResults> {
        info!("Starting surprisal experiment");
        info!("Config: {:?}", self.config);
        info!(
            "Model: {} ({} parameters, begin token: {})",
            self.scorer.model_id(),
            self.parameters,
            self.bos_token
        );

        let stimuli = Stimuli::load(&self.config.dataset_path)?;
        info!("Loaded {} stimuli", stimuli.len());

        let rows = self.score(stimuli.records())?;

        let output_dir = &self.config.output_dir;
        std::fs::create_dir_all(output_dir).map_err(|e| SurprisalError::io(output_dir, e))?;
        let output_path = self.output_path();
        write_rows(&rows, &output_path, Some(&OUTPUT_HEADER[..]))?;

        info!("Results saved to {}", output_path.display());
        Ok(ExperimentResults { rows, output_path })
    }

    /// Score every record, in order, without touching the filesystem.
    pub fn score(&self, records: &[StimulusRecord]) -> Result<Vec<ResultRow>> {
        let batches = make_batches(records, self.config.batch_size)?;
        let progress = self.progress_bar(batches.len() as u64);

        let mut rows = Vec::with_capacity(records.len());
        for (index, batch) in batches.enumerate() {
            debug!("Scoring batch {} ({} items)", index, batch.len());
            rows.extend(self.score_batch(batch)?);
            progress.inc(1);
        }
        progress.finish_and_clear();

        Ok(rows)
    }

    fn score_batch(&self, batch: &[StimulusRecord]) -> Result<Vec<ResultRow>> {
        let prefixes: Vec<&str> = batch.iter().map(|r| r.prefix.as_str()).collect();
        let expected: Vec<&str> = batch.iter().map(|r| r.expected.as_str()).collect();
        let within: Vec<&str> = batch.iter().map(|r| r.within_category.as_str()).collect();
        let between: Vec<&str> = batch.iter().map(|r| r.between_category.as_str()).collect();

        let distributions = self
            .scorer
            .next_word_distribution(&prefixes, self.bos_token)?;
        ensure_aligned("next_word_distribution", distributions.len(), batch.len())?;
        let entropies: Vec<f64> = distributions
            .iter()
            .map(|dist| entropy_from_log_probs(dist))
            .collect();

        let expected_scores = self.conditional(&prefixes, &expected)?;
        let within_scores = self.conditional(&prefixes, &within)?;
        let between_scores = self.conditional(&prefixes, &between)?;

        let rows = batch
            .iter()
            .zip(entropies)
            .zip(expected_scores)
            .zip(within_scores)
            .zip(between_scores)
            .map(|((((record, entropy), e), w), b)| ResultRow {
                item: record.item.clone(),
                entropy,
                expected_logprob: e,
                within_logprob: w,
                between_logprob: b,
                parameters: self.parameters,
            })
            .collect();
        Ok(rows)
    }

    fn conditional(&self, prefixes: &[&str], continuations: &[&str]) -> Result<Vec<f64>> {
        let scores = self.scorer.conditional_score(
            prefixes,
            continuations,
            self.bos_token,
            &sum_reduction,
        )?;
        ensure_aligned("conditional_score", scores.len(), prefixes.len())?;
        Ok(scores)
    }

    fn progress_bar(&self, n_batches: u64) -> ProgressBar {
        if !self.config.show_progress {
            return ProgressBar::hidden();
        }
        let pb = ProgressBar::new(n_batches);
        if let Ok(style) =
            ProgressStyle::with_template("{bar:40.cyan/blue} {pos}/{len} batches [{elapsed}]")
        {
            pb.set_style(style);
        }
        pb
    }
}

fn ensure_aligned(operation: &str, got: usize, expected: usize) -> Result<(), SurprisalError> {
    if got != expected {
        return Err(SurprisalError::Scoring(format!(
            "{operation} returned {got} results for {expected} inputs"
        )));
    }
    Ok(())
}

/// Read back a results file written by [`Experiment::run`].
pub fn read_results(path: impl AsRef<Path>) -> Result<Vec<ResultRow>> {
    let mut reader = csv::Reader::from_path(path)?;
    let rows = reader.deserialize().collect::<Result<Vec<ResultRow>, _>>()?;
    Ok(rows)
}

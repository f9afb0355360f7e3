//! lm-surprisal CLI: entropy and conditional log-probabilities for stimuli

use std::num::NonZeroUsize;
use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use lm_surprisal::{Experiment, ExperimentConfig, IncrementalScorer, LmScorer};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "lm-surprisal")]
#[command(about = "Entropy and conditional log-probabilities of stimuli under a language model")]
#[command(version)]
struct Cli {
    /// Model ID from `HuggingFace` (e.g., "gpt2") or a local checkpoint directory
    #[arg(long, default_value = "gpt2")]
    model: String,

    /// Compute device: cpu, cuda[:N] or metal[:N]
    #[arg(long, default_value = "cpu")]
    device: String,

    /// Stimuli scored per batch
    #[arg(long = "batch_size", visible_alias = "batch-size", default_value = "32")]
    batch_size: NonZeroUsize,

    /// Directory for the results CSV
    #[arg(long = "output_dir", visible_alias = "output-dir", default_value = "results/fk1999/")]
    output_dir: PathBuf,

    /// Stimulus dataset CSV
    #[arg(long, default_value = "data/fk1999-final.csv")]
    dataset: PathBuf,

    /// Hide the progress bar
    #[arg(long)]
    no_progress: bool,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    println!("=== lm-surprisal ===");
    println!("Model:   {}", cli.model);
    println!("Device:  {}", cli.device);
    println!("Dataset: {}", cli.dataset.display());
    println!("Output:  {}", cli.output_dir.display());

    info!("Loading model...");
    let scorer = LmScorer::load(&cli.model, &cli.device)?;
    info!(
        "Model: {:?}, {} layers, {} vocab, {} parameters on {:?}",
        scorer.architecture(),
        scorer.n_layers(),
        scorer.vocab_size(),
        scorer.num_parameters(),
        scorer.device()
    );

    let config = ExperimentConfig {
        dataset_path: cli.dataset,
        output_dir: cli.output_dir,
        batch_size: cli.batch_size.get(),
        show_progress: !cli.no_progress,
    };

    let experiment = Experiment::new(&scorer, config);
    let results = experiment.run()?;

    println!(
        "\nScored {} stimuli -> {}",
        results.rows.len(),
        results.output_path.display()
    );

    Ok(())
}

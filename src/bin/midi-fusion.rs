//! MIDI fusion CLI — train the two models, then generate fused MIDI.
//!
//! ```sh
//! midi-fusion train --corpus-a maestro/ --corpus-b edm/ --out models/
//! midi-fusion generate --models models/ --seed-a maestro/a.midi \
//!     --seed-b edm/b.midi --output fused.mid --temperature 1.5
//! ```
//!
//! # Output
//!
//! `train` writes `predictor.safetensors`, `variational.safetensors` and
//! `config.json` into `--out`. `generate` writes a single MIDI file to
//! `--output`. Both print a one-line JSON summary to stdout on success:
//!
//! ```json
//! {"path":"fused.mid","notes":600,"duration_s":212.4,"temperature":1.5}
//! ```
//!
//! Exit code 0 on success, non-zero on error.

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use midi_fusion_rs::{
    config::FusionConfig,
    corpus::Corpus,
    midi::write_midi,
    note::PlacedNote,
    pipeline::FusionPipeline,
    sampling::check_temperature,
};

#[derive(Parser, Debug)]
#[command(
    name = "midi-fusion",
    about = "Fuse the pitch of one MIDI corpus with the rhythm of another",
    long_about = "Trains an attention LSTM on corpus A and a hierarchical VAE on corpus B,\n\
                  then generates notes taking pitch from the first and timing from the second.\n\
                  A JSON summary line is printed to stdout."
)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Train both models and save them.
    Train {
        /// Directory (or single file) of MIDI files for the pitch model.
        #[arg(long)]
        corpus_a: PathBuf,

        /// Directory (or single file) of MIDI files for the timing model.
        #[arg(long)]
        corpus_b: PathBuf,

        /// Output directory for weights and config.
        #[arg(long, short = 'o')]
        out: PathBuf,

        /// JSON config. Missing fields take their defaults.
        #[arg(long, short = 'c')]
        config: Option<PathBuf>,

        /// Override the number of epochs.
        #[arg(long)]
        epochs: Option<usize>,
    },

    /// Generate a fused MIDI file from trained models.
    Generate {
        /// Directory written by `train`.
        #[arg(long, short = 'm')]
        models: PathBuf,

        /// MIDI file or directory whose first notes seed the pitch model.
        #[arg(long)]
        seed_a: PathBuf,

        /// MIDI file or directory whose first notes seed the timing model.
        #[arg(long)]
        seed_b: PathBuf,

        /// Output path (.mid or .midi).
        #[arg(long, short = 'o')]
        output: PathBuf,

        /// Pitch sampling temperature (> 0).
        #[arg(long, short = 't')]
        temperature: Option<f64>,

        /// Number of notes to generate.
        #[arg(long, short = 'n')]
        num_predictions: Option<usize>,

        /// Random seed for latent noise and pitch sampling.
        #[arg(long, short = 's')]
        seed: Option<u64>,

        /// General MIDI program of the output track (0–127).
        #[arg(long)]
        program: Option<u8>,
    },
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let device = candle_core::Device::cuda_if_available(0)?;
    tracing::info!("Using device: {:?}", device);

    match args.command {
        Command::Train {
            corpus_a,
            corpus_b,
            out,
            config,
            epochs,
        } => {
            let mut config = match config {
                Some(path) => FusionConfig::from_json_file(&path)
                    .map_err(|e| anyhow::anyhow!("failed to read config {}: {e}", path.display()))?,
                None => FusionConfig::default(),
            };
            if let Some(epochs) = epochs {
                if epochs == 0 {
                    anyhow::bail!("epochs must be at least 1");
                }
                config.training.epochs = epochs;
            }
            train(config, &corpus_a, &corpus_b, &out, &device)
        }
        Command::Generate {
            models,
            seed_a,
            seed_b,
            output,
            temperature,
            num_predictions,
            seed,
            program,
        } => {
            let ext = output
                .extension()
                .and_then(|e| e.to_str())
                .unwrap_or_default()
                .to_ascii_lowercase();
            if ext != "mid" && ext != "midi" {
                anyhow::bail!("unsupported output format '{ext}'. Use .mid or .midi");
            }
            if let Some(t) = temperature {
                check_temperature(t)?;
            }
            if let Some(p) = program
                && p > 127
            {
                anyhow::bail!("program must be between 0 and 127, got {p}");
            }

            let pipeline = FusionPipeline::load(&models, &device)
                .map_err(|e| anyhow::anyhow!("failed to load models: {e}"))?;
            let mut params = pipeline.config().generation.clone();
            if let Some(t) = temperature {
                params.temperature = t;
            }
            if let Some(n) = num_predictions {
                params.num_predictions = n;
            }
            if let Some(s) = seed {
                params.seed = s;
            }
            if let Some(p) = program {
                params.instrument_program = p;
            }

            let cfg = pipeline.config();
            let corpus_a = Corpus::load("A", &seed_a, cfg.max_files_a)?;
            let corpus_b = Corpus::load("B", &seed_b, cfg.max_files_b)?;

            let notes = pipeline
                .generate_with(corpus_a.notes(), corpus_b.notes(), &params)
                .map_err(|e| anyhow::anyhow!("generation failed: {e}"))?;

            if let Some(parent) = output.parent()
                && !parent.as_os_str().is_empty()
            {
                std::fs::create_dir_all(parent)?;
            }
            let fused: Vec<_> = notes.iter().map(PlacedNote::note).collect();
            write_midi(&output, &fused, params.instrument_program, params.velocity)
                .map_err(|e| anyhow::anyhow!("failed to write MIDI: {e}"))?;

            let duration_s = notes.iter().map(|n| n.end).fold(0.0, f64::max);
            println!(
                "{}",
                serde_json::json!({
                    "path": output.display().to_string(),
                    "notes": notes.len(),
                    "duration_s": duration_s,
                    "temperature": params.temperature,
                    "seed": params.seed,
                })
            );
            Ok(())
        }
    }
}

fn train(
    config: FusionConfig,
    corpus_a: &Path,
    corpus_b: &Path,
    out: &Path,
    device: &candle_core::Device,
) -> anyhow::Result<()> {
    let a = Corpus::load("A", corpus_a, config.max_files_a)?;
    let b = Corpus::load("B", corpus_b, config.max_files_b)?;

    let pipeline = FusionPipeline::new(config, device)?;
    let report = pipeline
        .train(&a, &b)
        .map_err(|e| anyhow::anyhow!("training failed: {e}"))?;
    pipeline.save(out)?;

    println!(
        "{}",
        serde_json::json!({
            "out": out.display().to_string(),
            "corpus_a": { "files": a.files_loaded(), "skipped": a.skipped().len(), "notes": a.len() },
            "corpus_b": { "files": b.files_loaded(), "skipped": b.skipped().len(), "notes": b.len() },
            "predictor": {
                "epochs": report.predictor.epochs_run(),
                "best_epoch": report.predictor.best_epoch,
                "best_loss": report.predictor.best_loss,
            },
            "variational": {
                "epochs": report.variational.epochs_run(),
                "best_epoch": report.variational.best_epoch,
                "best_loss": report.variational.best_loss,
            },
        })
    );
    Ok(())
}

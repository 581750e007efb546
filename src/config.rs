//! Configuration for the fusion pipeline.
//!
//! Defaults match the reference training setup: 100-note windows, 128-pitch
//! vocabulary, a 256-unit attention LSTM for corpus A and a
//! 2048/512/1024 hierarchical VAE for corpus B.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Pitch vocabulary size. MIDI pitches are 0–127.
pub const VOCAB_SIZE: usize = 128;

/// Attention-pooled LSTM predictor.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PredictorConfig {
    pub hidden_size: usize,
    pub vocab_size: usize,
}

impl Default for PredictorConfig {
    fn default() -> Self {
        Self {
            hidden_size: 256,
            vocab_size: VOCAB_SIZE,
        }
    }
}

/// Encoder → conductor → decoder VAE.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VariationalConfig {
    pub latent_features: usize,
    pub encoder_hidden_size: usize,
    /// Width of the latent projection, the conductor and the decoder.
    pub decoder_hidden_size: usize,
    pub dropout_rate: f32,
    pub vocab_size: usize,
}

impl Default for VariationalConfig {
    fn default() -> Self {
        Self {
            latent_features: 512,
            encoder_hidden_size: 2048,
            decoder_hidden_size: 1024,
            dropout_rate: 0.2,
            vocab_size: VOCAB_SIZE,
        }
    }
}

/// Per-head loss weights.
///
/// Pitch is down-weighted because cross-entropy dominates otherwise.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LossWeights {
    pub pitch: f64,
    pub step: f64,
    pub duration: f64,
    /// KL(q(z|x) || N(0, I)) weight. Zero leaves the latent unregularized.
    pub kl: f64,
}

impl Default for LossWeights {
    fn default() -> Self {
        Self {
            pitch: 0.05,
            step: 1.0,
            duration: 1.0,
            kl: 0.0,
        }
    }
}

/// Training driver settings, shared by both models.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    pub batch_size: usize,
    pub epochs: usize,
    pub steps_per_epoch: usize,
    pub learning_rate: f64,
    pub loss_weights: LossWeights,
    /// Stop after this many epochs without improvement. `None` disables.
    pub patience: Option<usize>,
    /// Smallest loss decrease that counts as an improvement.
    pub min_delta: f64,
    /// Restore the best epoch's weights when early stopping fires.
    pub restore_best_weights: bool,
    /// Write `ckpt_{epoch}.safetensors` here after every epoch.
    pub checkpoint_dir: Option<PathBuf>,
    /// Seed for example shuffling.
    pub seed: u64,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            batch_size: 64,
            epochs: 50,
            steps_per_epoch: 10,
            learning_rate: 1e-3,
            loss_weights: LossWeights::default(),
            patience: Some(10),
            min_delta: 0.0,
            restore_best_weights: true,
            checkpoint_dir: None,
            seed: 42,
        }
    }
}

/// Fusion generation and MIDI output settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    pub temperature: f64,
    pub num_predictions: usize,
    /// Seed for latent noise and pitch sampling.
    pub seed: u64,
    /// General MIDI program of the output track.
    pub instrument_program: u8,
    pub velocity: u8,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            temperature: 1.0,
            num_predictions: 600,
            seed: 42,
            instrument_program: 38,
            velocity: 100,
        }
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FusionConfig {
    /// Window length `L`.
    pub sequence_length: usize,
    /// Cap on files read from corpus A. `None` reads all of them.
    pub max_files_a: Option<usize>,
    pub max_files_b: Option<usize>,
    pub predictor: PredictorConfig,
    pub variational: VariationalConfig,
    pub training: TrainingConfig,
    pub generation: GenerationConfig,
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            sequence_length: 100,
            max_files_a: Some(100),
            max_files_b: Some(25),
            predictor: PredictorConfig::default(),
            variational: VariationalConfig::default(),
            training: TrainingConfig::default(),
            generation: GenerationConfig::default(),
        }
    }
}

impl FusionConfig {
    /// Load from a JSON file. Missing fields take their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// Write as pretty-printed JSON.
    pub fn to_json_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let text = serde_json::to_string_pretty(self)?;
        std::fs::write(path, text)?;
        Ok(())
    }

    /// Reject configurations the pipeline cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.sequence_length == 0 {
            return Err(Error::Config("sequence_length must be > 0".into()));
        }
        if self.predictor.vocab_size != VOCAB_SIZE || self.variational.vocab_size != VOCAB_SIZE {
            return Err(Error::Config(format!(
                "vocab_size is fixed at {VOCAB_SIZE}"
            )));
        }
        if self.predictor.hidden_size == 0
            || self.variational.latent_features == 0
            || self.variational.encoder_hidden_size == 0
            || self.variational.decoder_hidden_size == 0
        {
            return Err(Error::Config("layer sizes must be > 0".into()));
        }
        if !(0.0..1.0).contains(&self.variational.dropout_rate) {
            return Err(Error::Config(format!(
                "dropout_rate must be in [0, 1), got {}",
                self.variational.dropout_rate
            )));
        }
        if self.training.batch_size == 0 || self.training.steps_per_epoch == 0 {
            return Err(Error::Config(
                "batch_size and steps_per_epoch must be > 0".into(),
            ));
        }
        if self.training.learning_rate.is_nan() || self.training.learning_rate <= 0.0 {
            return Err(Error::Config("learning_rate must be > 0".into()));
        }
        if self.generation.instrument_program > 127 {
            return Err(Error::Config("instrument_program must be 0–127".into()));
        }
        if !(1..=127).contains(&self.generation.velocity) {
            return Err(Error::Config("velocity must be 1–127".into()));
        }
        crate::sampling::check_temperature(self.generation.temperature)
    }
}

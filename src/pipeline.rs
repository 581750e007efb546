//! End-to-end fusion pipeline.
//!
//! Owns both models and their weights:
//! 1. Window corpus A and fit the attention predictor
//! 2. Window corpus B and fit the hierarchical VAE
//! 3. Save / load both as safetensors next to the config
//! 4. Seed both buffers and run the fusion loop

use std::path::Path;

use candle_core::{DType, Device};
use candle_nn::{VarBuilder, VarMap};

use crate::Result;
use crate::config::{FusionConfig, GenerationConfig};
use crate::corpus::Corpus;
use crate::fusion::{FusionGenerator, GenerationState};
use crate::model::{AttentionPredictor, HierarchicalVae};
use crate::note::{Note, PlacedNote};
use crate::train::{Trainer, TrainingReport};

pub const PREDICTOR_WEIGHTS: &str = "predictor.safetensors";
pub const VARIATIONAL_WEIGHTS: &str = "variational.safetensors";
pub const CONFIG_FILE: &str = "config.json";

/// Reports of both training runs.
#[derive(Debug, Clone)]
pub struct FusionReport {
    pub predictor: TrainingReport,
    pub variational: TrainingReport,
}

pub struct FusionPipeline {
    config: FusionConfig,
    device: Device,
    predictor: AttentionPredictor,
    predictor_vars: VarMap,
    variational: HierarchicalVae,
    variational_vars: VarMap,
}

impl FusionPipeline {
    /// Freshly initialized models.
    pub fn new(config: FusionConfig, device: &Device) -> Result<Self> {
        config.validate()?;

        let predictor_vars = VarMap::new();
        let predictor = AttentionPredictor::new(
            &config.predictor,
            VarBuilder::from_varmap(&predictor_vars, DType::F32, device),
        )?;
        let variational_vars = VarMap::new();
        let variational = HierarchicalVae::new(
            &config.variational,
            VarBuilder::from_varmap(&variational_vars, DType::F32, device),
        )?;

        Ok(Self {
            config,
            device: device.clone(),
            predictor,
            predictor_vars,
            variational,
            variational_vars,
        })
    }

    /// Load a pipeline written by [`FusionPipeline::save`].
    pub fn load(dir: impl AsRef<Path>, device: &Device) -> Result<Self> {
        let dir = dir.as_ref();
        let config = FusionConfig::from_json_file(dir.join(CONFIG_FILE))?;
        let mut pipeline = Self::new(config, device)?;
        pipeline.predictor_vars.load(dir.join(PREDICTOR_WEIGHTS))?;
        pipeline.variational_vars.load(dir.join(VARIATIONAL_WEIGHTS))?;
        tracing::info!(dir = %dir.display(), "loaded fusion models");
        Ok(pipeline)
    }

    /// Write both models' weights and the config into `dir`.
    pub fn save(&self, dir: impl AsRef<Path>) -> Result<()> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)?;
        self.predictor_vars.save(dir.join(PREDICTOR_WEIGHTS))?;
        self.variational_vars.save(dir.join(VARIATIONAL_WEIGHTS))?;
        self.config.to_json_file(dir.join(CONFIG_FILE))?;
        tracing::info!(dir = %dir.display(), "saved fusion models");
        Ok(())
    }

    pub fn config(&self) -> &FusionConfig {
        &self.config
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Fit the predictor on corpus A, then the VAE on corpus B.
    pub fn train(&self, corpus_a: &Corpus, corpus_b: &Corpus) -> Result<FusionReport> {
        Ok(FusionReport {
            predictor: self.train_predictor(corpus_a)?,
            variational: self.train_variational(corpus_b)?,
        })
    }

    pub fn train_predictor(&self, corpus: &Corpus) -> Result<TrainingReport> {
        let examples = corpus.examples(self.config.sequence_length)?;
        tracing::info!(corpus = corpus.name(), examples = examples.len(), "training predictor");
        self.trainer("predictor").fit(
            &self.predictor,
            &self.predictor_vars,
            &examples,
            self.config.training.epochs,
            self.config.training.steps_per_epoch,
        )
    }

    pub fn train_variational(&self, corpus: &Corpus) -> Result<TrainingReport> {
        let examples = corpus.examples(self.config.sequence_length)?;
        tracing::info!(corpus = corpus.name(), examples = examples.len(), "training variational model");
        self.trainer("variational").fit(
            &self.variational,
            &self.variational_vars,
            &examples,
            self.config.training.epochs,
            self.config.training.steps_per_epoch,
        )
    }

    /// Checkpoints of each model go to their own subdirectory.
    fn trainer(&self, model: &str) -> Trainer {
        let mut cfg = self.config.training.clone();
        cfg.checkpoint_dir = cfg.checkpoint_dir.map(|dir| dir.join(model));
        Trainer::new(cfg, &self.device)
    }

    /// Generate with the configured generation settings.
    pub fn generate(&self, seed_a: &[Note], seed_b: &[Note]) -> Result<Vec<PlacedNote>> {
        self.generate_with(seed_a, seed_b, &self.config.generation)
    }

    /// Seed the buffers with the first `sequence_length` notes of each seed
    /// and run `params.num_predictions` fusion steps.
    pub fn generate_with(
        &self,
        seed_a: &[Note],
        seed_b: &[Note],
        params: &GenerationConfig,
    ) -> Result<Vec<PlacedNote>> {
        let generator = FusionGenerator::new(
            &self.predictor,
            &self.variational,
            params.temperature,
            &self.device,
        )?;
        let state = GenerationState::new(seed_a, seed_b, self.config.sequence_length, params.seed)?;
        let (_, notes) = generator.generate(state, params.num_predictions)?;
        Ok(notes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PredictorConfig, TrainingConfig, VariationalConfig};
    use crate::note::NoteEvent;
    use crate::Error;

    fn tiny_config() -> FusionConfig {
        FusionConfig {
            sequence_length: 4,
            predictor: PredictorConfig {
                hidden_size: 8,
                ..PredictorConfig::default()
            },
            variational: VariationalConfig {
                latent_features: 4,
                encoder_hidden_size: 8,
                decoder_hidden_size: 6,
                ..VariationalConfig::default()
            },
            training: TrainingConfig {
                batch_size: 4,
                epochs: 2,
                steps_per_epoch: 2,
                patience: None,
                ..TrainingConfig::default()
            },
            generation: GenerationConfig {
                num_predictions: 12,
                ..GenerationConfig::default()
            },
            ..FusionConfig::default()
        }
    }

    fn corpus(name: &str, base: u8, n: usize) -> Corpus {
        let events: Vec<NoteEvent> = (0..n)
            .map(|i| {
                let start = i as f64 * 0.25;
                NoteEvent::new(base + (i % 5) as u8, start, start + 0.2)
            })
            .collect();
        Corpus::from_sources(name, vec![("synthetic", Ok(events))]).unwrap()
    }

    #[test]
    fn test_train_then_generate() {
        let pipeline = FusionPipeline::new(tiny_config(), &Device::Cpu).unwrap();
        let a = corpus("A", 60, 24);
        let b = corpus("B", 36, 24);

        let report = pipeline.train(&a, &b).unwrap();
        assert_eq!(report.predictor.epochs_run(), 2);
        assert_eq!(report.variational.epochs_run(), 2);

        let notes = pipeline.generate(a.seed(4).unwrap(), b.seed(4).unwrap()).unwrap();
        assert_eq!(notes.len(), 12);
        let mut prev_start = 0.0;
        for note in &notes {
            assert!(note.step >= 0.0 && note.duration >= 0.0);
            assert!(note.start >= prev_start);
            prev_start = note.start;
        }
    }

    #[test]
    fn test_save_load_reproduces_generation() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = FusionPipeline::new(tiny_config(), &Device::Cpu).unwrap();
        let a = corpus("A", 60, 10);
        let b = corpus("B", 40, 10);
        let before = pipeline.generate(a.notes(), b.notes()).unwrap();

        pipeline.save(dir.path()).unwrap();
        assert!(dir.path().join(PREDICTOR_WEIGHTS).exists());
        assert!(dir.path().join(VARIATIONAL_WEIGHTS).exists());

        let loaded = FusionPipeline::load(dir.path(), &Device::Cpu).unwrap();
        assert_eq!(loaded.config().sequence_length, 4);
        let after = loaded.generate(a.notes(), b.notes()).unwrap();
        assert_eq!(before, after);
    }

    #[test]
    fn test_generation_overrides() {
        let pipeline = FusionPipeline::new(tiny_config(), &Device::Cpu).unwrap();
        let a = corpus("A", 60, 6);
        let b = corpus("B", 40, 6);

        let params = GenerationConfig {
            num_predictions: 3,
            temperature: 2.5,
            ..GenerationConfig::default()
        };
        assert_eq!(pipeline.generate_with(a.notes(), b.notes(), &params).unwrap().len(), 3);

        let cold = GenerationConfig {
            temperature: 0.0,
            ..params.clone()
        };
        assert!(matches!(
            pipeline.generate_with(a.notes(), b.notes(), &cold),
            Err(Error::InvalidTemperature(_))
        ));
        assert!(matches!(
            pipeline.generate_with(&a.notes()[..2], b.notes(), &params),
            Err(Error::InsufficientData { .. })
        ));
    }

    #[test]
    fn test_short_corpus_cannot_train() {
        let pipeline = FusionPipeline::new(tiny_config(), &Device::Cpu).unwrap();
        // 6 notes, window 4 → 2 examples < batch 4.
        let small = corpus("A", 60, 6);
        assert!(matches!(
            pipeline.train_predictor(&small),
            Err(Error::InsufficientData { .. })
        ));
    }

    #[test]
    fn test_checkpoints_per_model() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = tiny_config();
        cfg.training.epochs = 1;
        cfg.training.checkpoint_dir = Some(dir.path().to_path_buf());
        let pipeline = FusionPipeline::new(cfg, &Device::Cpu).unwrap();
        pipeline
            .train(&corpus("A", 60, 12), &corpus("B", 40, 12))
            .unwrap();
        assert!(dir.path().join("predictor/ckpt_1.safetensors").exists());
        assert!(dir.path().join("variational/ckpt_1.safetensors").exists());
    }
}

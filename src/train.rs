//! Training driver.
//!
//! Fits one [`SequenceModel`] against its corpus' examples:
//!
//! 1. Shuffle example indices with a seeded RNG, cut into full batches
//!    (the remainder is dropped), reshuffle when the batches run out.
//! 2. Each epoch runs exactly `steps_per_epoch` Adam steps on the composite
//!    loss.
//! 3. A non-finite loss aborts the run with [`Error::TrainingDiverged`].
//! 4. Optional early stopping on a plateau of the epoch-mean loss, with
//!    the best epoch's weights restored, and optional per-epoch checkpoints.

use candle_core::{Device, Tensor, Var};
use candle_nn::{AdamW, Optimizer, ParamsAdamW, VarMap};
use rand::SeedableRng;
use rand::seq::SliceRandom;
use rand_chacha::ChaCha8Rng;

use crate::config::TrainingConfig;
use crate::loss::composite_loss;
use crate::model::{Mode, SequenceModel};
use crate::window::{Batch, Example};
use crate::{Error, Result};

/// Summary of a finished training run.
#[derive(Debug, Clone, PartialEq)]
pub struct TrainingReport {
    /// Mean total loss of every completed epoch.
    pub epoch_losses: Vec<f32>,
    pub best_epoch: usize,
    pub best_loss: f32,
    pub stopped_early: bool,
}

impl TrainingReport {
    pub fn epochs_run(&self) -> usize {
        self.epoch_losses.len()
    }
}

/// Endless stream of shuffled, full-size batches of example indices.
struct BatchCursor {
    order: Vec<usize>,
    batch_size: usize,
    position: usize,
    rng: ChaCha8Rng,
}

impl BatchCursor {
    fn new(num_examples: usize, batch_size: usize, seed: u64) -> Self {
        let mut cursor = Self {
            order: (0..num_examples).collect(),
            batch_size,
            position: 0,
            rng: ChaCha8Rng::seed_from_u64(seed),
        };
        cursor.order.shuffle(&mut cursor.rng);
        cursor
    }

    fn next_batch(&mut self) -> &[usize] {
        if self.position + self.batch_size > self.order.len() {
            self.order.shuffle(&mut self.rng);
            self.position = 0;
        }
        let batch = &self.order[self.position..self.position + self.batch_size];
        self.position += self.batch_size;
        batch
    }
}

/// Adam-based trainer for either model.
pub struct Trainer {
    config: TrainingConfig,
    device: Device,
}

impl Trainer {
    pub fn new(config: TrainingConfig, device: &Device) -> Self {
        Self {
            config,
            device: device.clone(),
        }
    }

    /// Train `model`, whose parameters live in `varmap`.
    pub fn fit<M: SequenceModel + ?Sized>(
        &self,
        model: &M,
        varmap: &VarMap,
        examples: &[Example],
        epochs: usize,
        steps_per_epoch: usize,
    ) -> Result<TrainingReport> {
        let cfg = &self.config;
        if examples.len() < cfg.batch_size {
            return Err(Error::InsufficientData {
                needed: cfg.batch_size,
                available: examples.len(),
            });
        }
        if steps_per_epoch == 0 {
            return Err(Error::Config("steps_per_epoch must be > 0".into()));
        }

        let vars = varmap.all_vars();
        let mut optimizer = AdamW::new(
            vars.clone(),
            ParamsAdamW {
                lr: cfg.learning_rate,
                weight_decay: 0.0,
                ..Default::default()
            },
        )?;

        // Stochastic layers draw from this during training; generation uses its own seed.
        let mut noise_rng = ChaCha8Rng::seed_from_u64(cfg.seed.wrapping_add(1));
        let mut cursor = BatchCursor::new(examples.len(), cfg.batch_size, cfg.seed);

        let mut report = TrainingReport {
            epoch_losses: Vec::with_capacity(epochs),
            best_epoch: 0,
            best_loss: f32::INFINITY,
            stopped_early: false,
        };
        let mut best_weights: Option<Vec<Tensor>> = None;
        let mut epochs_without_improvement = 0usize;

        tracing::info!(
            examples = examples.len(),
            batch_size = cfg.batch_size,
            epochs,
            steps_per_epoch,
            "starting training"
        );

        for epoch in 0..epochs {
            let mut epoch_total = 0.0f32;
            for step in 0..steps_per_epoch {
                let picked: Vec<&Example> =
                    cursor.next_batch().iter().map(|&i| &examples[i]).collect();
                let batch = Batch::from_examples(&picked, &self.device)?;

                let output = model.forward(&batch.inputs, Mode::Training, &mut noise_rng)?;
                let loss = composite_loss(&output, &batch, &cfg.loss_weights)?;
                let value = loss.total_value()?;
                if !value.is_finite() {
                    tracing::error!(epoch, step, loss = value, "loss is not finite");
                    return Err(Error::TrainingDiverged {
                        epoch,
                        step,
                        loss: value,
                    });
                }

                optimizer.backward_step(&loss.total)?;
                epoch_total += value;

                tracing::debug!(
                    epoch,
                    step,
                    total = value,
                    pitch = loss.pitch,
                    step_loss = loss.step,
                    duration = loss.duration,
                    kl = loss.kl,
                    "train step"
                );
            }

            let epoch_loss = epoch_total / steps_per_epoch as f32;
            report.epoch_losses.push(epoch_loss);
            tracing::info!(epoch, loss = epoch_loss, "epoch complete");

            if let Some(dir) = &cfg.checkpoint_dir {
                std::fs::create_dir_all(dir)?;
                let path = dir.join(format!("ckpt_{}.safetensors", epoch + 1));
                varmap.save(&path)?;
                tracing::debug!(path = %path.display(), "checkpoint written");
            }

            if (epoch_loss as f64) < report.best_loss as f64 - cfg.min_delta {
                report.best_loss = epoch_loss;
                report.best_epoch = epoch;
                epochs_without_improvement = 0;
                if cfg.patience.is_some() && cfg.restore_best_weights {
                    best_weights = Some(snapshot(&vars)?);
                }
            } else {
                epochs_without_improvement += 1;
            }

            if let Some(patience) = cfg.patience
                && epochs_without_improvement >= patience.max(1)
            {
                tracing::warn!(
                    epoch,
                    best_epoch = report.best_epoch,
                    best_loss = report.best_loss,
                    "loss plateaued, stopping early"
                );
                report.stopped_early = true;
                if let Some(weights) = &best_weights {
                    restore(&vars, weights)?;
                    tracing::info!(best_epoch = report.best_epoch, "restored best weights");
                }
                break;
            }
        }

        Ok(report)
    }
}

fn snapshot(vars: &[Var]) -> Result<Vec<Tensor>> {
    Ok(vars
        .iter()
        .map(|v| v.as_tensor().copy())
        .collect::<candle_core::Result<Vec<_>>>()?)
}

fn restore(vars: &[Var], weights: &[Tensor]) -> Result<()> {
    for (var, weight) in vars.iter().zip(weights) {
        var.set(weight)?;
    }
    Ok(())
}

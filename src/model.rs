//! Sequence models for next-note prediction.
//!
//! ## Components
//!
//! - [`predictor`] — LSTM with softmax attention pooling over time
//! - [`variational`] — bidirectional-LSTM encoder, reparameterized latent,
//!   conductor and decoder LSTMs
//!
//! Both map a `[B, L, 3]` window of `[pitch / 128, step, duration]` rows to
//! a [`NoteOutput`] through the same three [`NoteHeads`].

pub mod predictor;
pub mod variational;

use candle_core::{Module, Tensor};
use candle_nn::{Linear, VarBuilder};
use rand::RngCore;

use crate::Result;

pub use predictor::AttentionPredictor;
pub use variational::HierarchicalVae;

/// Forward-pass mode.
///
/// Selects dropout and the VAE decoder's auxiliary input (ground-truth last
/// step vs. zeros).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Training,
    Inference,
}

impl Mode {
    pub fn is_training(self) -> bool {
        matches!(self, Mode::Training)
    }
}

/// Raw model outputs, before sampling or clamping.
#[derive(Debug, Clone)]
pub struct NoteOutput {
    /// `[B, vocab_size]` unnormalized.
    pub pitch_logits: Tensor,
    /// `[B]`
    pub step: Tensor,
    /// `[B]`
    pub duration: Tensor,
    /// Scalar KL(q(z|x) || N(0, I)); `None` for deterministic models.
    pub kl: Option<Tensor>,
}

/// A model that predicts the note following a window.
///
/// `rng` feeds any stochastic layer; deterministic models ignore it.
pub trait SequenceModel {
    fn forward(&self, input: &Tensor, mode: Mode, rng: &mut dyn RngCore) -> Result<NoteOutput>;
}

/// Pitch / step / duration projection heads.
#[derive(Debug, Clone)]
pub struct NoteHeads {
    pitch: Linear,
    step: Linear,
    duration: Linear,
}

impl NoteHeads {
    pub fn new(hidden_size: usize, vocab_size: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            pitch: candle_nn::linear(hidden_size, vocab_size, vb.pp("pitch"))?,
            step: candle_nn::linear(hidden_size, 1, vb.pp("step"))?,
            duration: candle_nn::linear(hidden_size, 1, vb.pp("duration"))?,
        })
    }

    /// `[B, H]` → logits `[B, V]`, step `[B]`, duration `[B]`.
    pub fn forward(&self, hidden: &Tensor) -> Result<NoteOutput> {
        Ok(NoteOutput {
            pitch_logits: self.pitch.forward(hidden)?,
            step: self.step.forward(hidden)?.squeeze(1)?,
            duration: self.duration.forward(hidden)?.squeeze(1)?,
            kl: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    #[test]
    fn test_heads_shapes() {
        let dev = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
        let heads = NoteHeads::new(16, 128, vb.pp("heads")).unwrap();
        let h = Tensor::randn(0f32, 1.0, (3, 16), &dev).unwrap();
        let out = heads.forward(&h).unwrap();
        assert_eq!(out.pitch_logits.dims(), &[3, 128]);
        assert_eq!(out.step.dims(), &[3]);
        assert_eq!(out.duration.dims(), &[3]);
        assert!(out.kl.is_none());
        // Three weight + three bias tensors.
        assert_eq!(varmap.all_vars().len(), 6);
    }
}

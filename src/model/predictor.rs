//! Attention-pooled LSTM predictor.
//!
//! ```text
//! x [B, L, 3] ─ LSTM ─→ h [B, L, H]
//!                        │
//!          e = tanh(W·h) [B, L] ─ softmax over L ─→ α
//!                        │
//!          c = Σ_t α_t · h_t  [B, H] ─→ heads
//! ```

use candle_core::{D, Module, Tensor};
use candle_nn::rnn::{LSTM, LSTMConfig, RNN};
use candle_nn::{Linear, VarBuilder};
use rand::RngCore;

use super::{Mode, NoteHeads, NoteOutput, SequenceModel};
use crate::Result;
use crate::config::PredictorConfig;

/// Corpus-A pitch model.
#[derive(Debug, Clone)]
pub struct AttentionPredictor {
    lstm: LSTM,
    energy: Linear,
    heads: NoteHeads,
}

impl AttentionPredictor {
    pub fn new(cfg: &PredictorConfig, vb: VarBuilder) -> Result<Self> {
        let lstm = candle_nn::rnn::lstm(3, cfg.hidden_size, LSTMConfig::default(), vb.pp("lstm"))?;
        let energy = candle_nn::linear(cfg.hidden_size, 1, vb.pp("energy"))?;
        let heads = NoteHeads::new(cfg.hidden_size, cfg.vocab_size, vb.pp("heads"))?;
        Ok(Self {
            lstm,
            energy,
            heads,
        })
    }

    /// Hidden state per timestep: `[B, L, 3]` → `[B, L, H]`.
    fn encode(&self, input: &Tensor) -> Result<Tensor> {
        let states = self.lstm.seq(input)?;
        Ok(self.lstm.states_to_tensor(&states)?)
    }

    /// Softmax-normalized attention over time: `[B, L, H]` → `[B, L]`.
    fn attention(&self, hidden: &Tensor) -> Result<Tensor> {
        let energy = self.energy.forward(hidden)?.tanh()?.squeeze(D::Minus1)?;
        Ok(candle_nn::ops::softmax(&energy, D::Minus1)?)
    }

    /// Attention weights for a window, `[B, L]`, each row summing to 1.
    pub fn attention_weights(&self, input: &Tensor) -> Result<Tensor> {
        self.attention(&self.encode(input)?)
    }
}

impl SequenceModel for AttentionPredictor {
    fn forward(&self, input: &Tensor, _mode: Mode, _rng: &mut dyn RngCore) -> Result<NoteOutput> {
        let hidden = self.encode(input)?;
        let alpha = self.attention(&hidden)?;
        // Weighted sum over time → [B, H]
        let context = hidden.broadcast_mul(&alpha.unsqueeze(D::Minus1)?)?.sum(1)?;
        self.heads.forward(&context)
    }
}

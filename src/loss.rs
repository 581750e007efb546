//! Composite training loss.
//!
//! ```text
//! loss = w_pitch · CE(pitch_logits, pitch)
//!      + w_step  · pp_mse(step, step_pred)
//!      + w_dur   · pp_mse(duration, duration_pred)
//!      + w_kl    · KL                       (VAE only)
//!
//! pp_mse(y, ŷ) = mean((y - ŷ)² + 10 · max(-ŷ, 0))
//! ```

use candle_core::Tensor;

use crate::Result;
use crate::config::LossWeights;
use crate::model::NoteOutput;
use crate::window::Batch;

/// Penalty multiplier for negative time predictions.
pub const POSITIVE_PRESSURE: f64 = 10.0;

/// MSE plus a linear penalty on negative predictions.
pub fn mse_with_positive_pressure(target: &Tensor, pred: &Tensor) -> Result<Tensor> {
    let mse = (target - pred)?.sqr()?;
    let pressure = (pred.neg()?.relu()? * POSITIVE_PRESSURE)?;
    Ok((mse + pressure)?.mean_all()?)
}

/// Weighted total plus the individual terms for logging.
#[derive(Debug, Clone)]
pub struct LossBreakdown {
    /// Scalar tensor to backpropagate.
    pub total: Tensor,
    pub pitch: f32,
    pub step: f32,
    pub duration: f32,
    pub kl: f32,
}

impl LossBreakdown {
    pub fn total_value(&self) -> Result<f32> {
        Ok(self.total.to_scalar::<f32>()?)
    }
}

pub fn composite_loss(
    output: &NoteOutput,
    batch: &Batch,
    weights: &LossWeights,
) -> Result<LossBreakdown> {
    let pitch = candle_nn::loss::cross_entropy(&output.pitch_logits, &batch.pitch)?;
    let step = mse_with_positive_pressure(&batch.step, &output.step)?;
    let duration = mse_with_positive_pressure(&batch.duration, &output.duration)?;

    let mut total = (((&pitch * weights.pitch)? + (&step * weights.step)?)?
        + (&duration * weights.duration)?)?;
    let mut kl_value = 0.0;
    if let Some(kl) = &output.kl {
        kl_value = kl.to_scalar::<f32>()?;
        if weights.kl != 0.0 {
            total = (total + (kl * weights.kl)?)?;
        }
    }

    Ok(LossBreakdown {
        total,
        pitch: pitch.to_scalar::<f32>()?,
        step: step.to_scalar::<f32>()?,
        duration: duration.to_scalar::<f32>()?,
        kl: kl_value,
    })
}

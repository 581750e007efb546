//! Temperature-scaled pitch sampling and next-note prediction.
//!
//! Both models emit `(pitch_logits, step, duration)`. Turning that into a
//! concrete [`Note`] is the same for either model:
//!
//! ```text
//! pitch    ~ Categorical(softmax(logits / temperature))
//! step     = max(0, step)
//! duration = max(0, duration)
//! ```

use candle_core::{DType, Device, IndexOp, Tensor};
use rand::{Rng, RngCore};

use crate::model::{Mode, SequenceModel};
use crate::note::Note;
use crate::window::notes_to_input;
use crate::{Error, Result};

/// Temperature must be finite and strictly positive.
pub fn check_temperature(temperature: f64) -> Result<()> {
    if !temperature.is_finite() || temperature <= 0.0 {
        return Err(Error::InvalidTemperature(temperature));
    }
    Ok(())
}

/// Sample a pitch from a `[V]` logit vector.
///
/// Higher temperature flattens the distribution.
pub fn sample_pitch<R: Rng + ?Sized>(logits: &Tensor, temperature: f64, rng: &mut R) -> Result<u8> {
    check_temperature(temperature)?;
    let scaled = (logits.to_dtype(DType::F32)? / temperature)?;
    let probs = candle_nn::ops::softmax_last_dim(&scaled)?;
    let index = sample_categorical(&probs.to_device(&Device::Cpu)?.to_vec1::<f32>()?, rng);
    u8::try_from(index).map_err(|_| Error::MalformedNote(format!("sampled pitch index {index}")))
}

/// Walk the CDF of `probs` with one uniform draw.
fn sample_categorical<R: Rng + ?Sized>(probs: &[f32], rng: &mut R) -> usize {
    let sample: f64 = rng.random();
    let mut cumulative = 0.0f64;
    for (i, &p) in probs.iter().enumerate() {
        cumulative += p as f64;
        if sample < cumulative {
            return i;
        }
    }
    // Floating-point rounding can leave the total just under 1.
    probs.len().saturating_sub(1)
}

/// Run `model` on a window of notes and sample the next note.
///
/// Negative step/duration outputs are floored to 0.
pub fn predict_next_note<'a, M: SequenceModel + ?Sized>(
    model: &M,
    window: impl IntoIterator<Item = &'a Note>,
    temperature: f64,
    rng: &mut dyn RngCore,
    device: &Device,
) -> Result<Note> {
    check_temperature(temperature)?;
    let input = notes_to_input(window, device)?;
    let output = model.forward(&input, Mode::Inference, rng)?;

    let logits = output.pitch_logits.i(0)?;
    let pitch = sample_pitch(&logits, temperature, rng)?;
    let step = output.step.i(0)?.to_dtype(DType::F32)?.to_scalar::<f32>()?;
    let duration = output.duration.i(0)?.to_dtype(DType::F32)?.to_scalar::<f32>()?;

    tracing::trace!(pitch, step, duration, "raw prediction");
    Ok(Note::new(pitch, step.max(0.0) as f64, duration.max(0.0) as f64))
}

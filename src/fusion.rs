//! Autoregressive fusion of the two models.
//!
//! Each model keeps its own `L`-note buffer. One step:
//!
//! ```text
//! (pB, sB, dB) = variational(buf_variational)
//! (pA, sA, dA) = predictor(buf_predictor)
//! emit (pA, sB, dB) at start = prev_start + sB
//! buf_predictor   ← drop oldest, push (pA, sA, dA)
//! buf_variational ← drop oldest, push (pB, sB, dB)
//! ```
//!
//! Pitch always comes from the predictor and timing from the variational
//! model. Each buffer advances with its own model's full prediction, so
//! neither model is conditioned on the other's output.
//!
//! The step is a pure function of a [`GenerationState`] value. Each model
//! samples from its own seeded RNG carried in the state, so the result does
//! not depend on the order the two models are called in.

use std::collections::VecDeque;

use candle_core::Device;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

use crate::model::SequenceModel;
use crate::note::{Note, PlacedNote};
use crate::sampling::{check_temperature, predict_next_note};
use crate::{Error, Result};

/// RNG stream used by the variational model; the predictor uses stream 0.
const VARIATIONAL_STREAM: u64 = 1;

/// Everything the fusion loop mutates.
#[derive(Debug, Clone)]
pub struct GenerationState {
    pub buf_predictor: VecDeque<Note>,
    pub buf_variational: VecDeque<Note>,
    /// Absolute start of the last emitted note.
    pub prev_start: f64,
    rng_predictor: ChaCha8Rng,
    rng_variational: ChaCha8Rng,
}

impl GenerationState {
    /// Seed both buffers with the first `length` notes of each stream.
    pub fn new(
        seed_predictor: &[Note],
        seed_variational: &[Note],
        length: usize,
        seed: u64,
    ) -> Result<Self> {
        let buf_predictor = seed_buffer(seed_predictor, length)?;
        let buf_variational = seed_buffer(seed_variational, length)?;

        let rng_predictor = ChaCha8Rng::seed_from_u64(seed);
        let mut rng_variational = ChaCha8Rng::seed_from_u64(seed);
        rng_variational.set_stream(VARIATIONAL_STREAM);

        Ok(Self {
            buf_predictor,
            buf_variational,
            prev_start: 0.0,
            rng_predictor,
            rng_variational,
        })
    }

    pub fn window_len(&self) -> usize {
        self.buf_predictor.len()
    }
}

fn seed_buffer(notes: &[Note], length: usize) -> Result<VecDeque<Note>> {
    if length == 0 || notes.len() < length {
        return Err(Error::InsufficientData {
            needed: length.max(1),
            available: notes.len(),
        });
    }
    let seed = &notes[..length];
    for note in seed {
        note.validate()?;
    }
    Ok(seed.iter().copied().collect())
}

/// Drop the oldest note and append `note`.
fn slide(buffer: &mut VecDeque<Note>, note: Note) {
    buffer.pop_front();
    buffer.push_back(note);
}

/// Drives a pitch model and a timing model in lockstep.
pub struct FusionGenerator<'m, P: ?Sized, V: ?Sized> {
    predictor: &'m P,
    variational: &'m V,
    temperature: f64,
    device: Device,
}

impl<'m, P, V> FusionGenerator<'m, P, V>
where
    P: SequenceModel + ?Sized,
    V: SequenceModel + ?Sized,
{
    /// Fails with [`Error::InvalidTemperature`] before any generation runs.
    pub fn new(
        predictor: &'m P,
        variational: &'m V,
        temperature: f64,
        device: &Device,
    ) -> Result<Self> {
        check_temperature(temperature)?;
        Ok(Self {
            predictor,
            variational,
            temperature,
            device: device.clone(),
        })
    }

    /// One fusion step.
    pub fn step(&self, mut state: GenerationState) -> Result<(GenerationState, PlacedNote)> {
        let timing = predict_next_note(
            self.variational,
            &state.buf_variational,
            self.temperature,
            &mut state.rng_variational,
            &self.device,
        )?;
        let pitched = predict_next_note(
            self.predictor,
            &state.buf_predictor,
            self.temperature,
            &mut state.rng_predictor,
            &self.device,
        )?;

        let fused = Note::new(pitched.pitch, timing.step, timing.duration);
        let placed = PlacedNote::after(state.prev_start, fused);

        slide(&mut state.buf_predictor, pitched);
        slide(&mut state.buf_variational, timing);
        state.prev_start = placed.start;

        Ok((state, placed))
    }

    /// Run exactly `num_predictions` steps.
    pub fn generate(
        &self,
        mut state: GenerationState,
        num_predictions: usize,
    ) -> Result<(GenerationState, Vec<PlacedNote>)> {
        tracing::info!(
            num_predictions,
            window = state.window_len(),
            temperature = self.temperature,
            "generating fused notes"
        );
        let mut notes = Vec::with_capacity(num_predictions);
        for i in 0..num_predictions {
            let (next, placed) = self.step(state)?;
            state = next;
            tracing::debug!(
                i,
                pitch = placed.pitch,
                start = placed.start,
                duration = placed.duration,
                "fused note"
            );
            notes.push(placed);
        }
        Ok((state, notes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PredictorConfig, VariationalConfig};
    use crate::model::{AttentionPredictor, HierarchicalVae, Mode, NoteOutput};
    use candle_core::{DType, IndexOp, Tensor};
    use candle_nn::{VarBuilder, VarMap};
    use rand::RngCore;

    /// Logits with all mass on one pitch.
    fn one_hot_logits(batch: usize, pitch: usize) -> Tensor {
        let row: Vec<f32> = (0..128)
            .map(|i| if i == pitch { 1e4 } else { -1e4 })
            .collect();
        let data: Vec<f32> = (0..batch).flat_map(|_| row.iter().copied()).collect();
        Tensor::from_vec(data, (batch, 128), &Device::Cpu).unwrap()
    }

    fn constant(batch: usize, value: f32) -> Tensor {
        Tensor::full(value, batch, &Device::Cpu).unwrap()
    }

    /// Always predicts the same note.
    struct FixedModel {
        pitch: usize,
        step: f32,
        duration: f32,
    }

    impl SequenceModel for FixedModel {
        fn forward(&self, input: &Tensor, _mode: Mode, _rng: &mut dyn RngCore) -> Result<NoteOutput> {
            let b = input.dim(0)?;
            Ok(NoteOutput {
                pitch_logits: one_hot_logits(b, self.pitch),
                step: constant(b, self.step),
                duration: constant(b, self.duration),
                kl: None,
            })
        }
    }

    /// Predicts the last input pitch + 1 and the last input step + 0.125.
    struct CountingModel;

    impl SequenceModel for CountingModel {
        fn forward(&self, input: &Tensor, _mode: Mode, _rng: &mut dyn RngCore) -> Result<NoteOutput> {
            let l = input.dim(1)?;
            let last: Vec<f32> = input.i((0, l - 1))?.to_vec1()?;
            let pitch = (last[0] * 128.0).round() as usize + 1;
            Ok(NoteOutput {
                pitch_logits: one_hot_logits(1, pitch),
                step: constant(1, last[1] + 0.125),
                duration: constant(1, 0.5),
                kl: None,
            })
        }
    }

    fn seed_notes(pitch: u8, n: usize) -> Vec<Note> {
        (0..n).map(|_| Note::new(pitch, 0.25, 0.5)).collect()
    }

    #[test]
    fn test_rejects_bad_temperature_up_front() {
        let model = FixedModel {
            pitch: 60,
            step: 0.1,
            duration: 0.1,
        };
        for t in [0.0, -2.0, f64::NAN] {
            assert!(matches!(
                FusionGenerator::new(&model, &model, t, &Device::Cpu),
                Err(Error::InvalidTemperature(_))
            ));
        }
    }

    #[test]
    fn test_fused_fields_come_from_their_sources() {
        let predictor = FixedModel {
            pitch: 70,
            step: 0.75,
            duration: 0.5,
        };
        let variational = FixedModel {
            pitch: 40,
            step: 0.25,
            duration: -0.2,
        };
        let generator = FusionGenerator::new(&predictor, &variational, 1.0, &Device::Cpu).unwrap();
        let state = GenerationState::new(&seed_notes(60, 4), &seed_notes(50, 4), 4, 0).unwrap();

        let (state, placed) = generator.step(state).unwrap();
        assert_eq!(placed.pitch, 70);
        assert_eq!(placed.step, 0.25);
        // Negative duration is floored, not rejected.
        assert_eq!(placed.duration, 0.0);
        assert_eq!(placed.start, 0.25);
        assert_eq!(placed.end, 0.25);

        // Each buffer advanced with its own model's full prediction.
        assert_eq!(state.buf_predictor.len(), 4);
        assert_eq!(state.buf_variational.len(), 4);
        assert_eq!(*state.buf_predictor.back().unwrap(), Note::new(70, 0.75, 0.5));
        assert_eq!(*state.buf_variational.back().unwrap(), Note::new(40, 0.25, 0.0));
        assert_eq!(state.prev_start, 0.25);
    }

    #[test]
    fn test_generate_runs_exactly_n_steps() {
        let predictor = FixedModel {
            pitch: 64,
            step: -1.0,
            duration: -1.0,
        };
        let variational = FixedModel {
            pitch: 30,
            step: 0.5,
            duration: 0.25,
        };
        let generator = FusionGenerator::new(&predictor, &variational, 1.0, &Device::Cpu).unwrap();
        let state = GenerationState::new(&seed_notes(60, 3), &seed_notes(50, 3), 3, 9).unwrap();
        let (state, notes) = generator.generate(state, 5).unwrap();

        assert_eq!(notes.len(), 5);
        for (i, note) in notes.iter().enumerate() {
            assert_eq!(note.pitch, 64);
            assert!((note.start - 0.5 * (i + 1) as f64).abs() < 1e-9);
            assert!((note.end - note.start - 0.25).abs() < 1e-9);
        }
        // Predictor's own (clamped) predictions fill its buffer.
        assert!(state.buf_predictor.iter().all(|n| *n == Note::new(64, 0.0, 0.0)));
    }

    #[test]
    fn test_buffers_condition_on_own_predictions() {
        let generator =
            FusionGenerator::new(&CountingModel, &CountingModel, 1.0, &Device::Cpu).unwrap();
        let state = GenerationState::new(&seed_notes(60, 2), &seed_notes(40, 2), 2, 0).unwrap();
        let (_, notes) = generator.generate(state, 3).unwrap();

        let pitches: Vec<u8> = notes.iter().map(|n| n.pitch).collect();
        assert_eq!(pitches, vec![61, 62, 63]);
        let steps: Vec<f64> = notes.iter().map(|n| n.step).collect();
        assert_eq!(steps, vec![0.375, 0.5, 0.625]);
    }

    #[test]
    fn test_seed_buffer_validation() {
        assert!(matches!(
            GenerationState::new(&seed_notes(60, 2), &seed_notes(60, 5), 3, 0),
            Err(Error::InsufficientData {
                needed: 3,
                available: 2
            })
        ));
        let mut bad = seed_notes(60, 3);
        bad[1].pitch = 200;
        assert!(matches!(
            GenerationState::new(&seed_notes(60, 3), &bad, 3, 0),
            Err(Error::MalformedNote(_))
        ));
        // Longer seeds are truncated to the window.
        let state = GenerationState::new(&seed_notes(60, 10), &seed_notes(60, 7), 4, 0).unwrap();
        assert_eq!(state.window_len(), 4);
        assert_eq!(state.buf_variational.len(), 4);
    }

    #[test]
    fn test_real_models_attribution_and_non_negativity() {
        let dev = Device::Cpu;
        let pred_vars = VarMap::new();
        let predictor = AttentionPredictor::new(
            &PredictorConfig {
                hidden_size: 8,
                ..PredictorConfig::default()
            },
            VarBuilder::from_varmap(&pred_vars, DType::F32, &dev),
        )
        .unwrap();
        let vae_vars = VarMap::new();
        let variational = HierarchicalVae::new(
            &VariationalConfig {
                latent_features: 4,
                encoder_hidden_size: 8,
                decoder_hidden_size: 6,
                ..VariationalConfig::default()
            },
            VarBuilder::from_varmap(&vae_vars, DType::F32, &dev),
        )
        .unwrap();

        let generator = FusionGenerator::new(&predictor, &variational, 1.0, &dev).unwrap();
        let mut state = GenerationState::new(&seed_notes(60, 6), &seed_notes(48, 6), 6, 1234).unwrap();

        for _ in 0..4 {
            // Replay each model alone from the same buffer and RNG state.
            let mut rng_a = state.rng_predictor.clone();
            let alone_a = predict_next_note(&predictor, &state.buf_predictor, 1.0, &mut rng_a, &dev)
                .unwrap();
            let mut rng_b = state.rng_variational.clone();
            let alone_b =
                predict_next_note(&variational, &state.buf_variational, 1.0, &mut rng_b, &dev)
                    .unwrap();

            let (next, placed) = generator.step(state).unwrap();
            assert_eq!(placed.pitch, alone_a.pitch);
            assert_eq!(placed.step, alone_b.step);
            assert_eq!(placed.duration, alone_b.duration);
            assert!(placed.step >= 0.0 && placed.duration >= 0.0);
            assert_eq!(*next.buf_predictor.back().unwrap(), alone_a);
            assert_eq!(*next.buf_variational.back().unwrap(), alone_b);
            state = next;
        }
    }

    #[test]
    fn test_same_seed_same_stream() {
        let dev = Device::Cpu;
        let vars = VarMap::new();
        let variational = HierarchicalVae::new(
            &VariationalConfig {
                latent_features: 3,
                encoder_hidden_size: 4,
                decoder_hidden_size: 4,
                ..VariationalConfig::default()
            },
            VarBuilder::from_varmap(&vars, DType::F32, &dev),
        )
        .unwrap();
        let predictor = FixedModel {
            pitch: 72,
            step: 0.0,
            duration: 0.0,
        };
        let generator = FusionGenerator::new(&predictor, &variational, 0.7, &dev).unwrap();
        let run = |seed| {
            let state = GenerationState::new(&seed_notes(60, 4), &seed_notes(50, 4), 4, seed).unwrap();
            generator.generate(state, 6).unwrap().1
        };
        assert_eq!(run(99), run(99));
    }
}

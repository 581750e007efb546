//! Hierarchical variational sequence model.
//!
//! ```text
//! x [B, L, 3]
//!   → BiLSTM encoder            → [B, L, 2E]
//!   → Linear(2E → 2K)           → mu, pre   (each [B, L, K])
//!   → log_var = softplus(pre)
//!   → z = mu + ε · exp(log_var / 2)          ε ~ N(0, 1), one draw per pass
//!   → Linear(K → D)             → [B, L, D]
//!   → conductor LSTM            → [B, L, D]
//!   → conductor LSTM on last step → summary [B, 1, D]
//!   → decoder LSTM on [summary ‖ aux]        aux = x[:, -1:] (training) or 0
//!   → heads on final decoder state
//! ```
//!
//! Noise comes from the caller's RNG so generation is reproducible for a
//! given seed.

use candle_core::{D, Module, Tensor};
use candle_nn::rnn::{LSTM, LSTMConfig, RNN};
use candle_nn::{Linear, VarBuilder};
use rand::RngCore;
use rand_distr::{Distribution, StandardNormal};

use super::{Mode, NoteHeads, NoteOutput, SequenceModel};
use crate::Result;
use crate::config::VariationalConfig;

/// Width of one input row: pitch, step, duration.
const NOTE_FEATURES: usize = 3;

/// Bidirectional LSTM: a forward pass and a pass over the time-reversed
/// sequence, outputs concatenated per timestep.
#[derive(Debug, Clone)]
pub struct BiLstm {
    forward: LSTM,
    backward: LSTM,
}

/// Per-timestep outputs of a [`BiLstm`].
#[derive(Debug, Clone)]
pub struct EncoderOutput {
    /// `[B, L, 2E]`, forward half first.
    pub outputs: Tensor,
}

impl EncoderOutput {
    /// Final `[B, E]` hidden states of the forward pass (after the last
    /// timestep) and of the reversed pass (after the first), read back out
    /// of `outputs`. The VAE itself consumes the per-timestep outputs.
    pub fn final_states(&self) -> Result<(Tensor, Tensor)> {
        let (_, len, width) = self.outputs.dims3()?;
        if len == 0 {
            return Err(crate::Error::InsufficientData {
                needed: 1,
                available: 0,
            });
        }
        let hidden = width / 2;
        let forward = self.outputs.narrow(1, len - 1, 1)?.narrow(2, 0, hidden)?.squeeze(1)?;
        let backward = self.outputs.narrow(1, 0, 1)?.narrow(2, hidden, hidden)?.squeeze(1)?;
        Ok((forward, backward))
    }
}

impl BiLstm {
    pub fn new(in_dim: usize, hidden_size: usize, vb: VarBuilder) -> Result<Self> {
        let forward = candle_nn::rnn::lstm(in_dim, hidden_size, LSTMConfig::default(), vb.pp("forward"))?;
        let backward =
            candle_nn::rnn::lstm(in_dim, hidden_size, LSTMConfig::default(), vb.pp("backward"))?;
        Ok(Self { forward, backward })
    }

    pub fn encode(&self, xs: &Tensor) -> Result<EncoderOutput> {
        let fwd = self.forward.states_to_tensor(&self.forward.seq(xs)?)?;
        // Re-align the backward pass with the forward timeline.
        let bwd_states = self.backward.seq(&reverse_time(xs)?)?;
        let bwd = reverse_time(&self.backward.states_to_tensor(&bwd_states)?)?;

        Ok(EncoderOutput {
            outputs: Tensor::cat(&[&fwd, &bwd], D::Minus1)?,
        })
    }
}

/// Corpus-B timing model.
#[derive(Debug, Clone)]
pub struct HierarchicalVae {
    encoder: BiLstm,
    encoder_out: Linear,
    linear_z: Linear,
    conductor: LSTM,
    decoder: LSTM,
    heads: NoteHeads,
    latent_features: usize,
    dropout_rate: f32,
}

impl HierarchicalVae {
    pub fn new(cfg: &VariationalConfig, vb: VarBuilder) -> Result<Self> {
        let encoder = BiLstm::new(NOTE_FEATURES, cfg.encoder_hidden_size, vb.pp("encoder"))?;
        let encoder_out = candle_nn::linear(
            2 * cfg.encoder_hidden_size,
            2 * cfg.latent_features,
            vb.pp("encoder_out"),
        )?;
        let linear_z =
            candle_nn::linear(cfg.latent_features, cfg.decoder_hidden_size, vb.pp("linear_z"))?;
        let conductor = candle_nn::rnn::lstm(
            cfg.decoder_hidden_size,
            cfg.decoder_hidden_size,
            LSTMConfig::default(),
            vb.pp("conductor"),
        )?;
        let decoder = candle_nn::rnn::lstm(
            cfg.decoder_hidden_size + NOTE_FEATURES,
            cfg.decoder_hidden_size,
            LSTMConfig::default(),
            vb.pp("decoder"),
        )?;
        let heads = NoteHeads::new(cfg.decoder_hidden_size, cfg.vocab_size, vb.pp("heads"))?;

        Ok(Self {
            encoder,
            encoder_out,
            linear_z,
            conductor,
            decoder,
            heads,
            latent_features: cfg.latent_features,
            dropout_rate: cfg.dropout_rate,
        })
    }

    /// Posterior parameters `(mu, log_var)`, each `[B, L, K]`.
    pub fn posterior(&self, input: &Tensor, mode: Mode) -> Result<(Tensor, Tensor)> {
        let encoded = self.encoder.encode(input)?;
        let hidden = self.dropout(&encoded.outputs, mode)?;
        let projected = self.encoder_out.forward(&hidden)?;
        let mu = projected.narrow(D::Minus1, 0, self.latent_features)?;
        let pre = projected.narrow(D::Minus1, self.latent_features, self.latent_features)?;
        Ok((mu, softplus(&pre)?))
    }

    /// Conductor stage: projected latent sequence → summary embedding `[B, 1, D]`.
    fn conduct(&self, z: &Tensor, mode: Mode) -> Result<Tensor> {
        let states = self.conductor.seq(z)?;
        let outputs = self.dropout(&self.conductor.states_to_tensor(&states)?, mode)?;
        let last = outputs.narrow(1, outputs.dim(1)? - 1, 1)?;
        let summary_states = self.conductor.seq(&last)?;
        Ok(self.conductor.states_to_tensor(&summary_states)?)
    }

    fn dropout(&self, xs: &Tensor, mode: Mode) -> Result<Tensor> {
        if mode.is_training() && self.dropout_rate > 0.0 {
            Ok(candle_nn::ops::dropout(xs, self.dropout_rate)?)
        } else {
            Ok(xs.clone())
        }
    }
}

impl SequenceModel for HierarchicalVae {
    fn forward(&self, input: &Tensor, mode: Mode, rng: &mut dyn RngCore) -> Result<NoteOutput> {
        let (mu, log_var) = self.posterior(input, mode)?;

        let eps = standard_normal(mu.dims(), rng, input)?;
        let z = (&mu + eps.mul(&(&log_var * 0.5)?.exp()?)?)?;
        let z = self.linear_z.forward(&z)?;

        let summary = self.conduct(&z, mode)?;

        let last_step = input.narrow(1, input.dim(1)? - 1, 1)?;
        let aux = auxiliary_input(mode, &last_step)?;
        let decoder_in = Tensor::cat(&[&summary, &aux], D::Minus1)?;
        let decoder_states = self.decoder.seq(&decoder_in)?;
        let decoder_hidden = last_hidden(&decoder_states)?;

        let mut output = self.heads.forward(&decoder_hidden)?;
        output.kl = Some(kl_divergence(&mu, &log_var)?);
        Ok(output)
    }
}

/// Decoder auxiliary input: the ground-truth last step while training, zeros
/// at inference so generation never needs the true next-to-last note.
pub fn auxiliary_input(mode: Mode, last_step: &Tensor) -> Result<Tensor> {
    match mode {
        Mode::Training => Ok(last_step.clone()),
        Mode::Inference => Ok(last_step.zeros_like()?),
    }
}

/// `log(1 + exp(x))`, stable for large |x|.
pub fn softplus(xs: &Tensor) -> Result<Tensor> {
    let tail = (xs.abs()?.neg()?.exp()? + 1.0)?.log()?;
    Ok((xs.relu()? + tail)?)
}

/// Mean KL(N(mu, exp(log_var)) || N(0, 1)).
pub fn kl_divergence(mu: &Tensor, log_var: &Tensor) -> Result<Tensor> {
    let inner = (((log_var + 1.0)? - mu.sqr()?)? - log_var.exp()?)?;
    Ok(inner.mean_all()?.affine(-0.5, 0.0)?)
}

/// ε ~ N(0, 1) drawn from `rng`, on the device/dtype of `like`.
fn standard_normal(shape: &[usize], rng: &mut dyn RngCore, like: &Tensor) -> Result<Tensor> {
    let n: usize = shape.iter().product();
    let data: Vec<f32> = (0..n)
        .map(|_| StandardNormal.sample(&mut *rng))
        .collect();
    Ok(Tensor::from_vec(data, shape, like.device())?.to_dtype(like.dtype())?)
}

fn reverse_time(xs: &Tensor) -> Result<Tensor> {
    let len = xs.dim(1)?;
    let idx: Vec<u32> = (0..len as u32).rev().collect();
    let idx = Tensor::from_vec(idx, len, xs.device())?;
    Ok(xs.index_select(&idx, 1)?)
}

fn last_hidden(states: &[candle_nn::rnn::LSTMState]) -> Result<Tensor> {
    match states.last() {
        Some(state) => Ok(state.h().clone()),
        None => Err(crate::Error::InsufficientData {
            needed: 1,
            available: 0,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn small_cfg() -> VariationalConfig {
        VariationalConfig {
            latent_features: 4,
            encoder_hidden_size: 8,
            decoder_hidden_size: 6,
            dropout_rate: 0.2,
            ..VariationalConfig::default()
        }
    }

    fn make_vae() -> (VarMap, HierarchicalVae) {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let model = HierarchicalVae::new(&small_cfg(), vb).unwrap();
        (varmap, model)
    }

    fn total_abs_diff(a: &Tensor, b: &Tensor) -> f32 {
        (a - b)
            .unwrap()
            .abs()
            .unwrap()
            .sum_all()
            .unwrap()
            .to_scalar()
            .unwrap()
    }

    #[test]
    fn test_vae_output_shapes() {
        let (_varmap, model) = make_vae();
        let x = Tensor::rand(0f32, 1.0, (2, 7, 3), &Device::Cpu).unwrap();
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        for mode in [Mode::Training, Mode::Inference] {
            let out = model.forward(&x, mode, &mut rng).unwrap();
            assert_eq!(out.pitch_logits.dims(), &[2, 128]);
            assert_eq!(out.step.dims(), &[2]);
            assert_eq!(out.duration.dims(), &[2]);
            let kl = out.kl.expect("vae reports kl");
            assert_eq!(kl.dims(), &[] as &[usize]);
        }
    }

    #[test]
    fn test_bilstm_shapes() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let bilstm = BiLstm::new(3, 5, vb).unwrap();
        let x = Tensor::rand(0f32, 1.0, (2, 4, 3), &Device::Cpu).unwrap();
        let enc = bilstm.encode(&x).unwrap();
        assert_eq!(enc.outputs.dims(), &[2, 4, 10]);
        let (final_forward, final_backward) = enc.final_states().unwrap();
        assert_eq!(final_forward.dims(), &[2, 5]);
        assert_eq!(final_backward.dims(), &[2, 5]);

        // The reversed pass ends at t=0: running it alone over the reversed
        // input gives the same final state.
        let last = |lstm: &LSTM, xs: &Tensor| {
            let states = lstm.seq(xs).unwrap();
            states.last().unwrap().h().clone()
        };
        let reversed = reverse_time(&x).unwrap();
        assert!(total_abs_diff(&last(&bilstm.backward, &reversed), &final_backward) < 1e-6);
        assert!(total_abs_diff(&last(&bilstm.forward, &x), &final_forward) < 1e-6);
    }

    #[test]
    fn test_same_seed_same_output() {
        let (_varmap, model) = make_vae();
        let x = Tensor::rand(0f32, 1.0, (1, 5, 3), &Device::Cpu).unwrap();
        let run = |seed| {
            let mut rng = ChaCha8Rng::seed_from_u64(seed);
            model.forward(&x, Mode::Inference, &mut rng).unwrap()
        };
        let a = run(11);
        let b = run(11);
        assert_eq!(total_abs_diff(&a.pitch_logits, &b.pitch_logits), 0.0);
        assert_eq!(total_abs_diff(&a.step, &b.step), 0.0);
    }

    #[test]
    fn test_fresh_noise_each_pass() {
        let (_varmap, model) = make_vae();
        let x = Tensor::rand(0f32, 1.0, (1, 5, 3), &Device::Cpu).unwrap();
        let mut rng = ChaCha8Rng::seed_from_u64(5);
        let a = model.forward(&x, Mode::Inference, &mut rng).unwrap();
        let b = model.forward(&x, Mode::Inference, &mut rng).unwrap();
        assert!(total_abs_diff(&a.pitch_logits, &b.pitch_logits) > 0.0);
    }

    #[test]
    fn test_auxiliary_input_by_mode() {
        let last = Tensor::new(&[[[0.5f32, 0.25, 1.0]]], &Device::Cpu).unwrap();
        let train = auxiliary_input(Mode::Training, &last).unwrap();
        let infer = auxiliary_input(Mode::Inference, &last).unwrap();
        assert_eq!(total_abs_diff(&train, &last), 0.0);
        let sum: f32 = infer.abs().unwrap().sum_all().unwrap().to_scalar().unwrap();
        assert_eq!(sum, 0.0);
        assert_eq!(infer.dims(), last.dims());
    }

    #[test]
    fn test_decoder_takes_raw_last_step() {
        // summary (decoder width) plus one raw note row, not a latent-width
        // or encoder-width slice.
        let (varmap, _model) = make_vae();
        let cfg = small_cfg();
        let data = varmap.data().lock().unwrap();
        let weight = data.get("decoder.weight_ih_l0").unwrap();
        assert_eq!(
            weight.dims(),
            &[4 * cfg.decoder_hidden_size, cfg.decoder_hidden_size + 3]
        );
    }

    #[test]
    fn test_softplus_positive_and_stable() {
        let xs = Tensor::new(&[-100f32, -1.0, 0.0, 1.0, 100.0], &Device::Cpu).unwrap();
        let ys: Vec<f32> = softplus(&xs).unwrap().to_vec1().unwrap();
        assert!(ys.iter().all(|y| y.is_finite() && *y >= 0.0));
        assert!((ys[2] - std::f32::consts::LN_2).abs() < 1e-6);
        assert!((ys[4] - 100.0).abs() < 1e-4);
        assert!(ys[0] < 1e-6);
    }

    #[test]
    fn test_kl_zero_at_prior() {
        let mu = Tensor::zeros((1, 3, 4), DType::F32, &Device::Cpu).unwrap();
        let log_var = mu.zeros_like().unwrap();
        let kl: f32 = kl_divergence(&mu, &log_var).unwrap().to_scalar().unwrap();
        assert!(kl.abs() < 1e-7);

        let mu = (mu + 1.0).unwrap();
        let kl: f32 = kl_divergence(&mu, &log_var).unwrap().to_scalar().unwrap();
        assert!((kl - 0.5).abs() < 1e-6);
    }
}

//! MIDI style fusion in pure Rust.
//!
//! Two sequence models are trained independently on two corpora of MIDI
//! files, then run in lockstep so that the pitches of one style are
//! played with the rhythm of the other. Built on candle; weights are
//! stored as safetensors.
//!
//! ## Architecture
//!
//! ```text
//! corpus A (.mid) ─→ notes ─→ windows ─→ attention LSTM ──┐ pitch
//!                                                          ├→ fused notes → .mid
//! corpus B (.mid) ─→ notes ─→ windows ─→ hierarchical VAE ┘ step, duration
//! ```
//!
//! ## Modules
//!
//! - [`note`] — absolute events ↔ step-relative notes
//! - [`window`] — sliding-window examples and batches
//! - [`model`] — attention predictor and hierarchical VAE
//! - [`loss`] / [`train`] — composite loss and the training driver
//! - [`sampling`] — temperature sampling and next-note prediction
//! - [`fusion`] — the two-buffer autoregressive fusion loop
//! - [`corpus`] / [`midi`] — MIDI file I/O
//! - [`pipeline`] — train, save, load and generate end to end

pub mod config;
pub mod corpus;
pub mod fusion;
pub mod loss;
pub mod midi;
pub mod model;
pub mod note;
pub mod pipeline;
pub mod sampling;
pub mod train;
pub mod window;

mod error;

pub use error::{Error, Result};

//! Sliding-window training examples.
//!
//! A stream of `M` notes yields `M - L` examples of `L + 1` consecutive
//! notes each (stride 1). The first `L` notes become the model input with
//! pitch scaled into `[0, 1)`; the last note is the label.

use candle_core::{Device, Tensor};

use crate::config::VOCAB_SIZE;
use crate::note::Note;
use crate::{Error, Result};

/// Target values for one example, unscaled.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Label {
    pub pitch: u8,
    pub step: f64,
    pub duration: f64,
}

impl From<Note> for Label {
    fn from(note: Note) -> Self {
        Self {
            pitch: note.pitch,
            step: note.step,
            duration: note.duration,
        }
    }
}

/// One training example: `L` feature rows and the note that follows them.
#[derive(Debug, Clone, PartialEq)]
pub struct Example {
    /// `[pitch / 128, step, duration]` per input note.
    pub input: Vec<[f32; 3]>,
    pub label: Label,
}

impl Example {
    pub fn len(&self) -> usize {
        self.input.len()
    }

    pub fn is_empty(&self) -> bool {
        self.input.is_empty()
    }
}

/// Number of examples a stream of `num_notes` yields for window `length`.
pub fn example_count(num_notes: usize, length: usize) -> usize {
    num_notes.saturating_sub(length)
}

/// Lazy iterator over the examples of a note stream.
///
/// Cloning restarts from the current position; [`window`] can be called
/// again to restart from the beginning.
#[derive(Debug, Clone)]
pub struct Windows<'a> {
    notes: &'a [Note],
    length: usize,
    next: usize,
}

impl Iterator for Windows<'_> {
    type Item = Example;

    fn next(&mut self) -> Option<Example> {
        let slice = self.notes.get(self.next..self.next + self.length + 1)?;
        self.next += 1;
        let (input, label) = slice.split_at(self.length);
        Some(Example {
            input: input.iter().map(|n| n.features(VOCAB_SIZE)).collect(),
            label: label[0].into(),
        })
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = example_count(self.notes.len(), self.length).saturating_sub(self.next);
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for Windows<'_> {}

/// Slice `notes` into examples of `length` inputs plus one label.
pub fn window(notes: &[Note], length: usize) -> Result<Windows<'_>> {
    if length == 0 || notes.len() < length + 1 {
        return Err(Error::InsufficientData {
            needed: length + 1,
            available: notes.len(),
        });
    }
    Ok(Windows {
        notes,
        length,
        next: 0,
    })
}

/// A stack of examples as tensors.
#[derive(Debug, Clone)]
pub struct Batch {
    /// `[B, L, 3]` f32.
    pub inputs: Tensor,
    /// `[B]` u32 class indices.
    pub pitch: Tensor,
    /// `[B]` f32.
    pub step: Tensor,
    /// `[B]` f32.
    pub duration: Tensor,
}

impl Batch {
    pub fn from_examples(examples: &[&Example], device: &Device) -> Result<Self> {
        let Some(first) = examples.first() else {
            return Err(Error::EmptyInput);
        };
        let b = examples.len();
        let l = first.len();
        if examples.iter().any(|e| e.len() != l) {
            return Err(Error::Config("examples in a batch must share a length".into()));
        }

        let flat: Vec<f32> = examples
            .iter()
            .flat_map(|e| e.input.iter().flatten().copied())
            .collect();
        let pitch: Vec<u32> = examples.iter().map(|e| e.label.pitch as u32).collect();
        let step: Vec<f32> = examples.iter().map(|e| e.label.step as f32).collect();
        let duration: Vec<f32> = examples.iter().map(|e| e.label.duration as f32).collect();

        Ok(Self {
            inputs: Tensor::from_vec(flat, (b, l, 3), device)?,
            pitch: Tensor::from_vec(pitch, b, device)?,
            step: Tensor::from_vec(step, b, device)?,
            duration: Tensor::from_vec(duration, b, device)?,
        })
    }

    pub fn size(&self) -> usize {
        self.pitch.dims()[0]
    }
}

/// Model input for a single window of notes: `[1, L, 3]`.
pub fn notes_to_input<'a>(
    notes: impl IntoIterator<Item = &'a Note>,
    device: &Device,
) -> Result<Tensor> {
    let flat: Vec<f32> = notes
        .into_iter()
        .flat_map(|n| n.features(VOCAB_SIZE))
        .collect();
    let l = flat.len() / 3;
    Ok(Tensor::from_vec(flat, (1, l, 3), device)?)
}

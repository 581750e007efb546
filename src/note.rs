//! Note encoding.
//!
//! Raw [`NoteEvent`]s carry absolute start/end times. The pipeline works on
//! [`Note`]s instead, whose timing is relative:
//!
//! ```text
//! step     = start[i] - start[i-1]   (0 for the first note)
//! duration = end[i] - start[i]
//! ```
//!
//! [`decode`] rebuilds absolute times with a cumulative sum of `step`
//! starting at 0, so a round trip shifts the stream to begin at t = 0.

use crate::{Error, Result};

/// Highest valid MIDI pitch.
pub const MAX_PITCH: u8 = 127;

/// A note with absolute timing, as read from a MIDI file.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NoteEvent {
    pub pitch: u8,
    /// Seconds.
    pub start: f64,
    /// Seconds.
    pub end: f64,
}

impl NoteEvent {
    pub fn new(pitch: u8, start: f64, end: f64) -> Self {
        Self { pitch, start, end }
    }

    pub fn validate(&self) -> Result<()> {
        check_pitch(self.pitch)?;
        if !self.start.is_finite() || !self.end.is_finite() {
            return Err(Error::MalformedNote(format!(
                "non-finite time: start={}, end={}",
                self.start, self.end
            )));
        }
        if self.end < self.start {
            return Err(Error::MalformedNote(format!(
                "end {} before start {} (pitch {})",
                self.end, self.start, self.pitch
            )));
        }
        Ok(())
    }
}

/// A note with step-relative timing, the unit the models consume.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Note {
    pub pitch: u8,
    /// Seconds since the previous note's start.
    pub step: f64,
    /// Seconds.
    pub duration: f64,
}

impl Note {
    pub fn new(pitch: u8, step: f64, duration: f64) -> Self {
        Self {
            pitch,
            step,
            duration,
        }
    }

    pub fn validate(&self) -> Result<()> {
        check_pitch(self.pitch)?;
        if !self.step.is_finite() || self.step < 0.0 {
            return Err(Error::MalformedNote(format!("invalid step {}", self.step)));
        }
        if !self.duration.is_finite() || self.duration < 0.0 {
            return Err(Error::MalformedNote(format!(
                "invalid duration {}",
                self.duration
            )));
        }
        Ok(())
    }

    /// Model input row: `[pitch / vocab_size, step, duration]`.
    pub fn features(&self, vocab_size: usize) -> [f32; 3] {
        [
            self.pitch as f32 / vocab_size as f32,
            self.step as f32,
            self.duration as f32,
        ]
    }
}

/// A [`Note`] placed on the absolute timeline.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlacedNote {
    pub pitch: u8,
    pub step: f64,
    pub duration: f64,
    pub start: f64,
    pub end: f64,
}

impl PlacedNote {
    /// Place `note` after a note that started at `prev_start`.
    pub fn after(prev_start: f64, note: Note) -> Self {
        let start = prev_start + note.step;
        Self {
            pitch: note.pitch,
            step: note.step,
            duration: note.duration,
            start,
            end: start + note.duration,
        }
    }

    pub fn note(&self) -> Note {
        Note::new(self.pitch, self.step, self.duration)
    }

    pub fn event(&self) -> NoteEvent {
        NoteEvent::new(self.pitch, self.start, self.end)
    }
}

fn check_pitch(pitch: u8) -> Result<()> {
    if pitch > MAX_PITCH {
        return Err(Error::MalformedNote(format!(
            "pitch {pitch} outside 0–{MAX_PITCH}"
        )));
    }
    Ok(())
}

/// Convert absolute events to step-relative notes.
///
/// Events are stably sorted by start time, so simultaneous notes keep their
/// input order.
pub fn encode(events: &[NoteEvent]) -> Result<Vec<Note>> {
    if events.is_empty() {
        return Err(Error::EmptyInput);
    }

    let mut sorted = events.to_vec();
    // `sort_by` is stable.
    sorted.sort_by(|a, b| a.start.total_cmp(&b.start));

    let mut prev_start = sorted[0].start;
    let notes = sorted
        .iter()
        .map(|event| {
            let note = Note::new(event.pitch, event.start - prev_start, event.end - event.start);
            prev_start = event.start;
            note
        })
        .collect();
    Ok(notes)
}

/// Place notes on the timeline starting at t = 0.
pub fn place(notes: &[Note]) -> Vec<PlacedNote> {
    let mut prev_start = 0.0;
    notes
        .iter()
        .map(|&note| {
            let placed = PlacedNote::after(prev_start, note);
            prev_start = placed.start;
            placed
        })
        .collect()
}

/// Inverse of [`encode`], up to the stream's original time origin.
pub fn decode(notes: &[Note]) -> Vec<NoteEvent> {
    place(notes).iter().map(PlacedNote::event).collect()
}

//! Error types for midi-fusion-rs.

/// Result type alias using [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// No notes to encode (empty file, empty corpus).
    #[error("empty input: no notes to encode")]
    EmptyInput,

    /// Note stream is shorter than a window plus its label.
    #[error("insufficient data: need at least {needed} notes, got {available}")]
    InsufficientData { needed: usize, available: usize },

    /// Sampling temperature must be finite and strictly positive.
    #[error("invalid temperature {0}: must be > 0")]
    InvalidTemperature(f64),

    /// Loss became NaN or infinite during training.
    #[error("training diverged at epoch {epoch}, step {step}: loss = {loss}")]
    TrainingDiverged { epoch: usize, step: usize, loss: f32 },

    /// Pitch outside 0–127, negative duration or step, non-finite times.
    #[error("malformed note: {0}")]
    MalformedNote(String),

    /// Candle tensor/model error.
    #[error("candle: {0}")]
    Candle(#[from] candle_core::Error),

    /// MIDI container parse/write error.
    #[error("midi: {0}")]
    Midi(String),

    /// Invalid configuration.
    #[error("config: {0}")]
    Config(String),

    /// I/O error.
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error.
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<midly::Error> for Error {
    fn from(error: midly::Error) -> Self {
        Error::Midi(error.to_string())
    }
}

impl Error {
    /// True for errors that only invalidate one file of a corpus.
    ///
    /// The corpus loader skips such files and keeps going.
    pub fn is_per_file(&self) -> bool {
        matches!(
            self,
            Error::EmptyInput | Error::MalformedNote(_) | Error::Midi(_) | Error::Io(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_messages() {
        let err = Error::InsufficientData {
            needed: 101,
            available: 12,
        };
        assert_eq!(
            err.to_string(),
            "insufficient data: need at least 101 notes, got 12"
        );
        assert_eq!(
            Error::InvalidTemperature(0.0).to_string(),
            "invalid temperature 0: must be > 0"
        );
    }

    #[test]
    fn test_per_file_classification() {
        assert!(Error::EmptyInput.is_per_file());
        assert!(Error::MalformedNote("pitch 200".into()).is_per_file());
        assert!(Error::Midi("bad header".into()).is_per_file());
        assert!(!Error::InvalidTemperature(-1.0).is_per_file());
        assert!(
            !Error::TrainingDiverged {
                epoch: 0,
                step: 3,
                loss: f32::NAN
            }
            .is_per_file()
        );
    }
}

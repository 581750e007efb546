//! Note corpora.
//!
//! A corpus is the concatenation of every readable file's encoded note
//! stream, in sorted path order. Files that fail to read or encode are
//! skipped with a warning; only an empty result is an error.

use std::path::{Path, PathBuf};

use crate::midi::read_note_events;
use crate::note::{Note, NoteEvent, encode};
use crate::window::{Example, window};
use crate::{Error, Result};

/// A file left out of a corpus.
#[derive(Debug, Clone, PartialEq)]
pub struct SkippedFile {
    pub source: String,
    pub reason: String,
}

#[derive(Debug, Clone)]
pub struct Corpus {
    name: String,
    notes: Vec<Note>,
    files_loaded: usize,
    skipped: Vec<SkippedFile>,
}

impl Corpus {
    /// Build a corpus from per-source event lists.
    ///
    /// Per-file failures (see [`Error::is_per_file`]) skip that source.
    /// Any other error aborts.
    pub fn from_sources<I, S>(name: &str, sources: I) -> Result<Self>
    where
        I: IntoIterator<Item = (S, Result<Vec<NoteEvent>>)>,
        S: Into<String>,
    {
        let mut corpus = Self {
            name: name.to_string(),
            notes: Vec::new(),
            files_loaded: 0,
            skipped: Vec::new(),
        };

        for (source, events) in sources {
            let source = source.into();
            match events.and_then(|events| encode_file(&events)) {
                Ok(notes) => {
                    tracing::debug!(corpus = name, %source, notes = notes.len(), "loaded");
                    corpus.notes.extend(notes);
                    corpus.files_loaded += 1;
                }
                Err(e) if e.is_per_file() => {
                    tracing::warn!(corpus = name, %source, error = %e, "skipping file");
                    corpus.skipped.push(SkippedFile {
                        source,
                        reason: e.to_string(),
                    });
                }
                Err(e) => return Err(e),
            }
        }

        if corpus.notes.is_empty() {
            return Err(Error::EmptyInput);
        }
        tracing::info!(
            corpus = name,
            files = corpus.files_loaded,
            skipped = corpus.skipped.len(),
            notes = corpus.notes.len(),
            "corpus ready"
        );
        Ok(corpus)
    }

    /// Load a MIDI file, or every MIDI file under a directory.
    pub fn load(name: &str, path: &Path, max_files: Option<usize>) -> Result<Self> {
        let files = if path.is_dir() {
            midi_files(path, max_files)?
        } else {
            vec![path.to_path_buf()]
        };
        tracing::info!(corpus = name, path = %path.display(), files = files.len(), "loading corpus");
        Self::from_sources(
            name,
            files
                .iter()
                .map(|file| (file.display().to_string(), read_note_events(file))),
        )
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn notes(&self) -> &[Note] {
        &self.notes
    }

    pub fn len(&self) -> usize {
        self.notes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.notes.is_empty()
    }

    pub fn files_loaded(&self) -> usize {
        self.files_loaded
    }

    pub fn skipped(&self) -> &[SkippedFile] {
        &self.skipped
    }

    /// First `length` notes, used to seed generation.
    pub fn seed(&self, length: usize) -> Result<&[Note]> {
        if length == 0 || self.notes.len() < length {
            return Err(Error::InsufficientData {
                needed: length.max(1),
                available: self.notes.len(),
            });
        }
        Ok(&self.notes[..length])
    }

    /// All training examples of window length `length`.
    pub fn examples(&self, length: usize) -> Result<Vec<Example>> {
        Ok(window(&self.notes, length)?.collect())
    }
}

fn encode_file(events: &[NoteEvent]) -> Result<Vec<Note>> {
    for event in events {
        event.validate()?;
    }
    encode(events)
}

/// `.mid` / `.midi` files under `dir`, recursively, in sorted order.
pub fn midi_files(dir: &Path, max_files: Option<usize>) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    collect_midi_files(dir, &mut files)?;
    files.sort();
    if let Some(max) = max_files {
        files.truncate(max);
    }
    Ok(files)
}

fn collect_midi_files(dir: &Path, files: &mut Vec<PathBuf>) -> Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            collect_midi_files(&path, files)?;
        } else if is_midi(&path) {
            files.push(path);
        }
    }
    Ok(())
}

fn is_midi(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("mid") || ext.eq_ignore_ascii_case("midi"))
}

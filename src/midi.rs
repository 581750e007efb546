//! Standard MIDI File reading and writing.
//!
//! Reading takes the first track that contains notes and, within it, only
//! the channel of its first sounding note, so a format-0 file holding
//! several instruments yields one of them. Ticks become seconds through the
//! file's tempo map. A note-on with velocity 0 ends a
//! note like a note-off does. When the same key is struck again before it is
//! released, the offs close the open notes in the order they started.
//!
//! Writing produces a single-track SMF (format 0) at 480 ticks per quarter
//! and 120 BPM, one program change and a constant velocity.

use std::collections::{HashMap, VecDeque};
use std::path::Path;

use midly::num::{u4, u7, u24, u28};
use midly::{
    Format, Header, MetaMessage, MidiMessage, Smf, Timing, Track, TrackEvent, TrackEventKind,
};

use crate::note::{Note, NoteEvent, decode};
use crate::{Error, Result};

/// Ticks per quarter note in written files.
pub const TICKS_PER_QUARTER: u16 = 480;

/// Largest delta-time a track event can carry (28-bit variable-length quantity).
const MAX_DELTA: u32 = (1 << 28) - 1;

/// 120 BPM, also the tempo assumed before a file's first tempo event.
pub const DEFAULT_TEMPO_US: u32 = 500_000;

/// Read the notes of a MIDI file.
pub fn read_note_events(path: impl AsRef<Path>) -> Result<Vec<NoteEvent>> {
    let bytes = std::fs::read(path)?;
    parse_note_events(&bytes)
}

/// Parse the notes of an in-memory MIDI file, sorted by start time.
pub fn parse_note_events(bytes: &[u8]) -> Result<Vec<NoteEvent>> {
    let smf = Smf::parse(bytes)?;
    let clock = Clock::new(&smf);

    let Some((track, instrument)) = smf
        .tracks
        .iter()
        .find_map(|track| first_note_channel(track).map(|channel| (track, channel)))
    else {
        return Err(Error::EmptyInput);
    };

    // key → start ticks of currently sounding notes
    let mut open: HashMap<u8, VecDeque<u64>> = HashMap::new();
    let mut events = Vec::new();
    let mut other_channels = 0usize;
    let mut tick = 0u64;

    for event in track {
        tick += event.delta.as_int() as u64;
        let TrackEventKind::Midi { channel, message } = event.kind else {
            continue;
        };
        if channel.as_int() != instrument {
            other_channels += 1;
            continue;
        }
        match message {
            MidiMessage::NoteOn { key, vel } if vel.as_int() > 0 => {
                open.entry(key.as_int()).or_default().push_back(tick);
            }
            MidiMessage::NoteOn { key, .. } | MidiMessage::NoteOff { key, .. } => {
                let start = open.get_mut(&key.as_int()).and_then(VecDeque::pop_front);
                if let Some(start) = start {
                    events.push(NoteEvent::new(
                        key.as_int(),
                        clock.seconds(start),
                        clock.seconds(tick),
                    ));
                }
            }
            _ => {}
        }
    }

    if other_channels > 0 {
        tracing::debug!(channel = instrument, other_channels, "ignoring events on other channels");
    }
    let dangling: usize = open.values().map(VecDeque::len).sum();
    if dangling > 0 {
        tracing::debug!(dangling, "dropping notes that are never released");
    }
    if events.is_empty() {
        return Err(Error::EmptyInput);
    }

    events.sort_by(|a, b| a.start.total_cmp(&b.start));
    Ok(events)
}

/// Channel of the first sounding note-on in `track`.
fn first_note_channel(track: &Track<'_>) -> Option<u8> {
    track.iter().find_map(|event| match event.kind {
        TrackEventKind::Midi {
            channel,
            message: MidiMessage::NoteOn { vel, .. },
        } if vel.as_int() > 0 => Some(channel.as_int()),
        _ => None,
    })
}

/// One constant-tempo stretch of a metrical file.
#[derive(Debug, Clone, Copy)]
struct TempoSegment {
    tick: u64,
    seconds: f64,
    seconds_per_tick: f64,
}

/// Tick → seconds conversion for a file.
#[derive(Debug, Clone)]
enum Clock {
    Metrical(Vec<TempoSegment>),
    Timecode { ticks_per_second: f64 },
}

impl Clock {
    fn new(smf: &Smf<'_>) -> Self {
        match smf.header.timing {
            Timing::Metrical(ticks_per_quarter) => {
                let tpq = ticks_per_quarter.as_int().max(1) as f64;
                Self::Metrical(tempo_map(smf, tpq))
            }
            Timing::Timecode(fps, subframes) => Self::Timecode {
                ticks_per_second: (fps.as_f32() as f64 * subframes as f64).max(1.0),
            },
        }
    }

    fn seconds(&self, tick: u64) -> f64 {
        match self {
            Self::Metrical(segments) => {
                let i = segments.partition_point(|s| s.tick <= tick).saturating_sub(1);
                let segment = segments[i];
                segment.seconds + (tick - segment.tick) as f64 * segment.seconds_per_tick
            }
            Self::Timecode { ticks_per_second } => tick as f64 / ticks_per_second,
        }
    }
}

/// Tempo changes from every track, merged into segments starting at tick 0.
fn tempo_map(smf: &Smf<'_>, ticks_per_quarter: f64) -> Vec<TempoSegment> {
    let mut changes: Vec<(u64, u32)> = Vec::new();
    for track in &smf.tracks {
        let mut tick = 0u64;
        for event in track {
            tick += event.delta.as_int() as u64;
            if let TrackEventKind::Meta(MetaMessage::Tempo(tempo)) = event.kind {
                changes.push((tick, tempo.as_int()));
            }
        }
    }
    changes.sort_by_key(|&(tick, _)| tick);

    let per_tick = |tempo_us: u32| tempo_us as f64 / 1_000_000.0 / ticks_per_quarter;
    let mut segments = vec![TempoSegment {
        tick: 0,
        seconds: 0.0,
        seconds_per_tick: per_tick(DEFAULT_TEMPO_US),
    }];
    for (tick, tempo_us) in changes {
        // Non-empty: seeded above.
        let last = segments[segments.len() - 1];
        if tick == last.tick {
            segments.pop();
            segments.push(TempoSegment {
                seconds_per_tick: per_tick(tempo_us),
                ..last
            });
        } else {
            segments.push(TempoSegment {
                tick,
                seconds: last.seconds + (tick - last.tick) as f64 * last.seconds_per_tick,
                seconds_per_tick: per_tick(tempo_us),
            });
        }
    }
    segments
}

/// Write step-relative notes as MIDI, placing the first note at t = 0.
pub fn write_midi(path: impl AsRef<Path>, notes: &[Note], program: u8, velocity: u8) -> Result<()> {
    write_note_events(path, &decode(notes), program, velocity)
}

/// Write absolute-time notes as MIDI.
pub fn write_note_events(
    path: impl AsRef<Path>,
    events: &[NoteEvent],
    program: u8,
    velocity: u8,
) -> Result<()> {
    let bytes = to_bytes(events, program, velocity)?;
    std::fs::write(path.as_ref(), &bytes)?;
    tracing::info!(
        path = %path.as_ref().display(),
        notes = events.len(),
        "wrote MIDI file"
    );
    Ok(())
}

/// Encode notes as an in-memory SMF.
pub fn to_bytes(events: &[NoteEvent], program: u8, velocity: u8) -> Result<Vec<u8>> {
    let smf = to_smf(events, program, velocity)?;
    let mut buf = Vec::new();
    smf.write_std(&mut buf)?;
    Ok(buf)
}

/// Build a format-0 SMF from notes.
pub fn to_smf(events: &[NoteEvent], program: u8, velocity: u8) -> Result<Smf<'static>> {
    if program > 127 {
        return Err(Error::Config(format!("program {program} outside 0–127")));
    }
    if velocity == 0 || velocity > 127 {
        return Err(Error::Config(format!("velocity {velocity} outside 1–127")));
    }

    // (tick, offs before ons at the same tick, message)
    let mut timeline: Vec<(u64, u8, MidiMessage)> = Vec::with_capacity(events.len() * 2);
    for event in events {
        event.validate()?;
        let key = u7::new(event.pitch);
        let on = to_tick(event.start)?;
        // Zero-length notes keep one tick so the on precedes its off.
        let next = on
            .checked_add(1)
            .ok_or_else(|| Error::MalformedNote(format!("start {} out of range", event.start)))?;
        let off = to_tick(event.end)?.max(next);
        timeline.push((
            on,
            1,
            MidiMessage::NoteOn {
                key,
                vel: u7::new(velocity),
            },
        ));
        timeline.push((off, 0, MidiMessage::NoteOff { key, vel: u7::new(0) }));
    }
    timeline.sort_by_key(|&(tick, order, _)| (tick, order));

    let channel = u4::new(0);
    let mut track: Track<'static> = Vec::with_capacity(timeline.len() + 3);
    track.push(TrackEvent {
        delta: u28::new(0),
        kind: TrackEventKind::Meta(MetaMessage::Tempo(u24::new(DEFAULT_TEMPO_US))),
    });
    track.push(TrackEvent {
        delta: u28::new(0),
        kind: TrackEventKind::Midi {
            channel,
            message: MidiMessage::ProgramChange {
                program: u7::new(program),
            },
        },
    });

    let mut last_tick = 0u64;
    for (tick, _, message) in timeline {
        let delta = u32::try_from(tick - last_tick)
            .ok()
            .filter(|&delta| delta <= MAX_DELTA)
            .ok_or_else(|| {
                Error::Midi(format!(
                    "gap of {} ticks before tick {tick} exceeds the MIDI delta-time limit",
                    tick - last_tick
                ))
            })?;
        track.push(TrackEvent {
            delta: u28::new(delta),
            kind: TrackEventKind::Midi { channel, message },
        });
        last_tick = tick;
    }
    track.push(TrackEvent {
        delta: u28::new(0),
        kind: TrackEventKind::Meta(MetaMessage::EndOfTrack),
    });

    let mut smf = Smf::new(Header::new(
        Format::SingleTrack,
        Timing::Metrical(midly::num::u15::new(TICKS_PER_QUARTER)),
    ));
    smf.tracks.push(track);
    Ok(smf)
}

/// Seconds → ticks at the written tempo, rejecting times no file can hold.
fn to_tick(seconds: f64) -> Result<u64> {
    let seconds_per_tick = DEFAULT_TEMPO_US as f64 / 1_000_000.0 / TICKS_PER_QUARTER as f64;
    let ticks = (seconds / seconds_per_tick).round().max(0.0);
    if !ticks.is_finite() || ticks > u32::MAX as f64 {
        return Err(Error::MalformedNote(format!(
            "time {seconds}s is beyond the writable range"
        )));
    }
    Ok(ticks as u64)
}

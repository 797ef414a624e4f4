// MIDI Event Model - timed events, tracks and files
// Events are validated on construction and never mutated afterwards

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Largest tick (and payload length) a variable-length quantity can carry
pub const MAX_VLQ: u32 = 0x0FFF_FFFF;

/// Largest tempo value (24-bit microseconds per quarter note)
pub const MAX_TEMPO: u32 = 0x00FF_FFFF;

/// Controller numbers the pipeline reads or rewrites
pub const CC_VOLUME: u8 = 7;
pub const CC_PAN: u8 = 10;
pub const CC_REVERB: u8 = 91;

/// Errors raised when constructing an event with invalid content
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvalidEventError {
    #[error("Negative tick: {0}")]
    NegativeTick(i64),

    #[error("Tick {0} exceeds the largest encodable tick (268435455)")]
    TickOutOfRange(i64),

    #[error("Channel {0} out of range (0-15)")]
    ChannelOutOfRange(u8),

    #[error("{field} value {value} out of range (0-127)")]
    DataOutOfRange { field: &'static str, value: u8 },

    #[error("Pitch bend value {0} out of range (0-16383)")]
    PitchBendOutOfRange(u16),

    #[error("Tempo must be between 1 and 16777215 microseconds per quarter, got {0}")]
    InvalidTempo(u32),

    #[error("Invalid time signature {numerator}/2^{denominator_pow}")]
    InvalidTimeSignature { numerator: u8, denominator_pow: u8 },

    #[error("Invalid SMPTE offset: {0}")]
    InvalidSmpte(String),

    #[error("Payload of {0} bytes is too large")]
    PayloadTooLarge(usize),
}

/// SMPTE start offset of a track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SmpteOffset {
    /// Frame rate: 24, 25, 29 (drop frame) or 30
    pub fps: u8,
    pub hour: u8,
    pub minute: u8,
    pub second: u8,
    pub frame: u8,
    /// Hundredths of a frame
    pub subframe: u8,
}

impl SmpteOffset {
    /// Whole frames per second; 29.97 drop frame still counts frames 0-29
    pub fn frame_count(&self) -> u8 {
        match self.fps {
            29 => 30,
            fps => fps,
        }
    }

    fn validate(&self) -> Result<(), InvalidEventError> {
        if !matches!(self.fps, 24 | 25 | 29 | 30) {
            return Err(InvalidEventError::InvalidSmpte(format!(
                "unsupported frame rate {}",
                self.fps
            )));
        }
        if self.hour >= 24
            || self.minute >= 60
            || self.second >= 60
            || self.frame >= self.frame_count()
            || self.subframe >= 100
        {
            return Err(InvalidEventError::InvalidSmpte(format!(
                "{:02}:{:02}:{:02}:{:02}.{:02}",
                self.hour, self.minute, self.second, self.frame, self.subframe
            )));
        }
        Ok(())
    }
}

/// Meta events (0xFF) found in Standard MIDI Files
///
/// Meta types without a dedicated variant are kept as `Unknown` so that
/// they survive a decode/encode cycle unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetaEvent {
    SequenceNumber(Option<u16>),
    Text(Vec<u8>),
    Copyright(Vec<u8>),
    TrackName(Vec<u8>),
    InstrumentName(Vec<u8>),
    Lyric(Vec<u8>),
    Marker(Vec<u8>),
    CuePoint(Vec<u8>),
    ProgramName(Vec<u8>),
    DeviceName(Vec<u8>),
    ChannelPrefix(u8),
    Port(u8),
    EndOfTrack,
    /// Microseconds per quarter note
    Tempo(u32),
    SmpteOffset(SmpteOffset),
    TimeSignature {
        numerator: u8,
        /// Denominator as a power of two (2 = quarter note)
        denominator_pow: u8,
        clocks_per_click: u8,
        thirty_seconds_per_quarter: u8,
    },
    KeySignature {
        /// Negative for flats, positive for sharps
        sharps: i8,
        minor: bool,
    },
    SequencerSpecific(Vec<u8>),
    Unknown { kind: u8, data: Vec<u8> },
}

impl MetaEvent {
    /// Payload bytes of the text-like meta events
    pub fn text_bytes(&self) -> Option<&[u8]> {
        match self {
            MetaEvent::Text(b)
            | MetaEvent::Copyright(b)
            | MetaEvent::TrackName(b)
            | MetaEvent::InstrumentName(b)
            | MetaEvent::Lyric(b)
            | MetaEvent::Marker(b)
            | MetaEvent::CuePoint(b)
            | MetaEvent::ProgramName(b)
            | MetaEvent::DeviceName(b)
            | MetaEvent::SequencerSpecific(b) => Some(b),
            MetaEvent::Unknown { data, .. } => Some(data),
            _ => None,
        }
    }

    /// Whether this event shapes the tempo map (tempo or time signature)
    pub fn is_timing(&self) -> bool {
        matches!(self, MetaEvent::Tempo(_) | MetaEvent::TimeSignature { .. })
    }

    fn validate(&self) -> Result<(), InvalidEventError> {
        if let Some(bytes) = self.text_bytes() {
            check_payload(bytes)?;
        }
        match *self {
            MetaEvent::ChannelPrefix(channel) => check_channel(channel),
            MetaEvent::Port(port) => check_data("port", port),
            MetaEvent::Tempo(tempo) => {
                if tempo == 0 || tempo > MAX_TEMPO {
                    Err(InvalidEventError::InvalidTempo(tempo))
                } else {
                    Ok(())
                }
            }
            MetaEvent::TimeSignature {
                numerator,
                denominator_pow,
                ..
            } => {
                if numerator == 0 || denominator_pow > 7 {
                    Err(InvalidEventError::InvalidTimeSignature {
                        numerator,
                        denominator_pow,
                    })
                } else {
                    Ok(())
                }
            }
            MetaEvent::SmpteOffset(ref offset) => offset.validate(),
            _ => Ok(()),
        }
    }
}

/// Kind and payload of a MIDI event
///
/// Channels are zero-based (0-15). A `NoteOn` with velocity 0 is kept as
/// written but counts as a note end everywhere in the pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    NoteOff { channel: u8, key: u8, velocity: u8 },
    NoteOn { channel: u8, key: u8, velocity: u8 },
    PolyPressure { channel: u8, key: u8, pressure: u8 },
    ControlChange { channel: u8, controller: u8, value: u8 },
    ProgramChange { channel: u8, program: u8 },
    ChannelPressure { channel: u8, pressure: u8 },
    /// 14-bit value, 8192 is centered
    PitchBend { channel: u8, value: u16 },
    SysEx(Vec<u8>),
    /// Escape sequence (0xF7), typically a SysEx continuation
    Escape(Vec<u8>),
    Meta(MetaEvent),
}

impl EventKind {
    /// Channel of a channel event
    pub fn channel(&self) -> Option<u8> {
        match *self {
            EventKind::NoteOff { channel, .. }
            | EventKind::NoteOn { channel, .. }
            | EventKind::PolyPressure { channel, .. }
            | EventKind::ControlChange { channel, .. }
            | EventKind::ProgramChange { channel, .. }
            | EventKind::ChannelPressure { channel, .. }
            | EventKind::PitchBend { channel, .. } => Some(channel),
            _ => None,
        }
    }

    pub fn is_meta(&self) -> bool {
        matches!(self, EventKind::Meta(_))
    }

    pub fn is_end_of_track(&self) -> bool {
        matches!(self, EventKind::Meta(MetaEvent::EndOfTrack))
    }

    /// Note-on with non-zero velocity
    pub fn is_note_start(&self) -> bool {
        matches!(self, EventKind::NoteOn { velocity, .. } if *velocity > 0)
    }

    /// Note-off, or note-on with zero velocity
    pub fn is_note_end(&self) -> bool {
        matches!(
            self,
            EventKind::NoteOff { .. } | EventKind::NoteOn { velocity: 0, .. }
        )
    }

    /// Key of a note event
    pub fn key(&self) -> Option<u8> {
        match *self {
            EventKind::NoteOn { key, .. }
            | EventKind::NoteOff { key, .. }
            | EventKind::PolyPressure { key, .. } => Some(key),
            _ => None,
        }
    }

    /// Whether this is a control change for `controller` on `channel`
    pub fn is_controller(&self, channel: u8, controller: u8) -> bool {
        matches!(
            *self,
            EventKind::ControlChange { channel: c, controller: n, .. }
                if c == channel && n == controller
        )
    }

    fn validate(&self) -> Result<(), InvalidEventError> {
        if let Some(channel) = self.channel() {
            check_channel(channel)?;
        }
        match self {
            EventKind::NoteOff { key, velocity, .. } | EventKind::NoteOn { key, velocity, .. } => {
                check_data("key", *key)?;
                check_data("velocity", *velocity)
            }
            EventKind::PolyPressure { key, pressure, .. } => {
                check_data("key", *key)?;
                check_data("pressure", *pressure)
            }
            EventKind::ControlChange {
                controller, value, ..
            } => {
                check_data("controller", *controller)?;
                check_data("value", *value)
            }
            EventKind::ProgramChange { program, .. } => check_data("program", *program),
            EventKind::ChannelPressure { pressure, .. } => check_data("pressure", *pressure),
            EventKind::PitchBend { value, .. } => {
                if *value > 0x3FFF {
                    Err(InvalidEventError::PitchBendOutOfRange(*value))
                } else {
                    Ok(())
                }
            }
            EventKind::SysEx(bytes) | EventKind::Escape(bytes) => check_payload(bytes),
            EventKind::Meta(meta) => meta.validate(),
        }
    }
}

fn check_channel(channel: u8) -> Result<(), InvalidEventError> {
    if channel > 15 {
        Err(InvalidEventError::ChannelOutOfRange(channel))
    } else {
        Ok(())
    }
}

fn check_data(field: &'static str, value: u8) -> Result<(), InvalidEventError> {
    if value > 127 {
        Err(InvalidEventError::DataOutOfRange { field, value })
    } else {
        Ok(())
    }
}

fn check_payload(bytes: &[u8]) -> Result<(), InvalidEventError> {
    if bytes.len() > MAX_VLQ as usize {
        Err(InvalidEventError::PayloadTooLarge(bytes.len()))
    } else {
        Ok(())
    }
}

fn check_tick(tick: i64) -> Result<u32, InvalidEventError> {
    if tick < 0 {
        return Err(InvalidEventError::NegativeTick(tick));
    }
    u32::try_from(tick)
        .ok()
        .filter(|t| *t <= MAX_VLQ)
        .ok_or(InvalidEventError::TickOutOfRange(tick))
}

/// One timed MIDI event at an absolute tick position
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MidiEvent {
    tick: u32,
    kind: EventKind,
}

impl MidiEvent {
    /// Create a validated event
    pub fn new(tick: i64, kind: EventKind) -> Result<Self, InvalidEventError> {
        let tick = check_tick(tick)?;
        kind.validate()?;
        Ok(MidiEvent { tick, kind })
    }

    pub fn note_on(tick: i64, channel: u8, key: u8, velocity: u8) -> Result<Self, InvalidEventError> {
        Self::new(tick, EventKind::NoteOn { channel, key, velocity })
    }

    pub fn note_off(tick: i64, channel: u8, key: u8, velocity: u8) -> Result<Self, InvalidEventError> {
        Self::new(tick, EventKind::NoteOff { channel, key, velocity })
    }

    pub fn control_change(
        tick: i64,
        channel: u8,
        controller: u8,
        value: u8,
    ) -> Result<Self, InvalidEventError> {
        Self::new(
            tick,
            EventKind::ControlChange {
                channel,
                controller,
                value,
            },
        )
    }

    pub fn meta(tick: i64, meta: MetaEvent) -> Result<Self, InvalidEventError> {
        Self::new(tick, EventKind::Meta(meta))
    }

    pub fn tick(&self) -> u32 {
        self.tick
    }

    pub fn kind(&self) -> &EventKind {
        &self.kind
    }

    /// Same event at another tick
    pub fn with_tick(&self, tick: i64) -> Result<Self, InvalidEventError> {
        Ok(MidiEvent {
            tick: check_tick(tick)?,
            kind: self.kind.clone(),
        })
    }

    /// Same tick with another kind
    pub fn with_kind(&self, kind: EventKind) -> Result<Self, InvalidEventError> {
        kind.validate()?;
        Ok(MidiEvent {
            tick: self.tick,
            kind,
        })
    }
}

/// Ordered sequence of events belonging to one track chunk
///
/// Events are kept in ascending tick order; events sharing a tick keep
/// the order they were added in.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MidiTrack {
    events: Vec<MidiEvent>,
}

impl MidiTrack {
    pub fn new() -> Self {
        MidiTrack { events: Vec::new() }
    }

    /// Build a track from events in any order (stable by tick)
    pub fn from_events(mut events: Vec<MidiEvent>) -> Self {
        events.sort_by_key(|e| e.tick);
        MidiTrack { events }
    }

    /// A track holding nothing but its end marker
    pub fn empty() -> Self {
        MidiTrack {
            events: vec![MidiEvent {
                tick: 0,
                kind: EventKind::Meta(MetaEvent::EndOfTrack),
            }],
        }
    }

    pub fn events(&self) -> &[MidiEvent] {
        &self.events
    }

    pub fn into_events(self) -> Vec<MidiEvent> {
        self.events
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Insert after every event at the same or an earlier tick
    pub fn insert(&mut self, event: MidiEvent) {
        let index = self.events.partition_point(|e| e.tick <= event.tick);
        self.events.insert(index, event);
    }

    /// Insert ahead of the channel events and end marker at the event's tick
    ///
    /// Meta events already present at that tick (track name, tempo) stay in
    /// front, so controller resets land before the first note they affect.
    pub fn insert_leading(&mut self, event: MidiEvent) {
        let index = self
            .events
            .iter()
            .position(|e| {
                e.tick > event.tick
                    || (e.tick == event.tick && (!e.kind.is_meta() || e.kind.is_end_of_track()))
            })
            .unwrap_or(self.events.len());
        self.events.insert(index, event);
    }

    /// Keep only the events matching the predicate
    pub fn retain<F>(&self, mut keep: F) -> MidiTrack
    where
        F: FnMut(&MidiEvent) -> bool,
    {
        MidiTrack {
            events: self.events.iter().filter(|e| keep(e)).cloned().collect(),
        }
    }

    /// Re-sort by tick and move the end marker behind the last event
    ///
    /// The marker keeps its tick unless events now run past it.
    pub fn normalized(self) -> MidiTrack {
        let mut events = self.events;
        let marker = events
            .iter()
            .filter(|e| e.kind.is_end_of_track())
            .map(|e| e.tick)
            .max();
        events.retain(|e| !e.kind.is_end_of_track());
        events.sort_by_key(|e| e.tick);
        if let Some(marker) = marker {
            let end = events.last().map_or(marker, |e| e.tick.max(marker));
            events.push(MidiEvent {
                tick: end,
                kind: EventKind::Meta(MetaEvent::EndOfTrack),
            });
        }
        MidiTrack { events }
    }

    /// Name from the first track-name meta event
    pub fn name(&self) -> Option<String> {
        self.events.iter().find_map(|e| match &e.kind {
            EventKind::Meta(MetaEvent::TrackName(bytes)) => {
                Some(String::from_utf8_lossy(bytes).into_owned())
            }
            _ => None,
        })
    }

    /// Channel of the first channel event
    pub fn channel(&self) -> Option<u8> {
        self.events.iter().find_map(|e| e.kind.channel())
    }

    /// Tick of the last event
    pub fn end_tick(&self) -> u32 {
        self.events.last().map(|e| e.tick).unwrap_or(0)
    }

    /// Whether the track carries any event on `channel`
    pub fn uses_channel(&self, channel: u8) -> bool {
        self.events.iter().any(|e| e.kind.channel() == Some(channel))
    }
}

/// SMF track layout (header format field)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MidiFormat {
    SingleTrack,
    Parallel,
    Sequential,
}

impl MidiFormat {
    pub fn as_u16(self) -> u16 {
        match self {
            MidiFormat::SingleTrack => 0,
            MidiFormat::Parallel => 1,
            MidiFormat::Sequential => 2,
        }
    }

    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            0 => Some(MidiFormat::SingleTrack),
            1 => Some(MidiFormat::Parallel),
            2 => Some(MidiFormat::Sequential),
            _ => None,
        }
    }
}

/// In-memory Standard MIDI File
///
/// Track 0 of a parallel file is the conductor track holding the tempo
/// and time signature events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MidiFile {
    pub format: MidiFormat,
    /// Ticks per quarter note (1-32767)
    pub ticks_per_quarter: u16,
    pub tracks: Vec<MidiTrack>,
}

impl MidiFile {
    pub fn new(format: MidiFormat, ticks_per_quarter: u16, tracks: Vec<MidiTrack>) -> Self {
        MidiFile {
            format,
            ticks_per_quarter,
            tracks,
        }
    }

    /// Derive the measure-based tempo track from tempo and time signature events
    pub fn tempo_track(&self) -> super::tempo::TempoTrack {
        super::tempo::TempoTrack::from_file(self)
    }

    /// Tick of the last event in any track
    pub fn end_tick(&self) -> u32 {
        self.tracks.iter().map(|t| t.end_tick()).max().unwrap_or(0)
    }

    /// Index of the first track with the given name
    pub fn track_index(&self, name: &str) -> Option<usize> {
        self.tracks
            .iter()
            .position(|t| t.name().as_deref() == Some(name))
    }
}

// MIDI File Codec - Standard MIDI File decode/encode using midly
// Validates the chunk layout before handing the bytes to midly

use super::event::{
    EventKind, InvalidEventError, MetaEvent, MidiEvent, MidiFile, MidiFormat, MidiTrack,
    SmpteOffset,
};
use midly::num::{u14, u15, u24, u28, u4, u7};
use midly::{
    Format, Fps, Header, MetaMessage, MidiMessage, PitchBend, Smf, SmpteTime, Timing, Track,
    TrackEvent, TrackEventKind,
};
use std::path::Path;
use thiserror::Error;

/// Errors raised while decoding a binary MIDI file
#[derive(Debug, Error)]
pub enum MalformedFileError {
    #[error("File too short for a MIDI header ({0} bytes)")]
    TooShort(usize),

    #[error("Bad chunk tag at offset {offset}: expected {expected}, found {found:?}")]
    BadChunkTag {
        offset: usize,
        expected: &'static str,
        found: String,
    },

    #[error("Header chunk length {0} is shorter than 6 bytes")]
    BadHeaderLength(u32),

    #[error("Chunk at offset {offset} declares {declared} bytes but only {available} remain")]
    TruncatedChunk {
        offset: usize,
        declared: u32,
        available: usize,
    },

    #[error("Header declares {declared} tracks but {found} track chunks were found")]
    TrackCountMismatch { declared: u16, found: usize },

    #[error("Unsupported MIDI format {0}")]
    UnsupportedFormat(u16),

    #[error("Unsupported timecode timing (only ticks per quarter note is supported)")]
    UnsupportedTiming,

    #[error("Malformed event data: {0}")]
    Parse(String),

    #[error("Track {track} does not end with an end-of-track event")]
    MissingEndOfTrack { track: usize },

    #[error("Invalid event in track {track}: {source}")]
    InvalidEvent {
        track: usize,
        #[source]
        source: InvalidEventError,
    },

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Errors raised while encoding a MidiFile
#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("Ticks per quarter note must be between 1 and 32767, got {0}")]
    InvalidResolution(u16),

    #[error("Invalid SMPTE offset in track {track}")]
    InvalidSmpte { track: usize },

    #[error("Failed to write MIDI: {0}")]
    Write(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

fn read_u32(bytes: &[u8], offset: usize) -> u32 {
    u32::from_be_bytes([
        bytes[offset],
        bytes[offset + 1],
        bytes[offset + 2],
        bytes[offset + 3],
    ])
}

fn read_u16(bytes: &[u8], offset: usize) -> u16 {
    u16::from_be_bytes([bytes[offset], bytes[offset + 1]])
}

/// Walk the chunk structure: header tag and length, chunk lengths, track count
fn validate_chunks(bytes: &[u8]) -> Result<(), MalformedFileError> {
    if bytes.len() < 14 {
        return Err(MalformedFileError::TooShort(bytes.len()));
    }
    if &bytes[0..4] != b"MThd" {
        return Err(MalformedFileError::BadChunkTag {
            offset: 0,
            expected: "MThd",
            found: String::from_utf8_lossy(&bytes[0..4]).into_owned(),
        });
    }

    let header_len = read_u32(bytes, 4);
    if header_len < 6 {
        return Err(MalformedFileError::BadHeaderLength(header_len));
    }
    if header_len as usize > bytes.len() - 8 {
        return Err(MalformedFileError::TruncatedChunk {
            offset: 0,
            declared: header_len,
            available: bytes.len() - 8,
        });
    }

    let format = read_u16(bytes, 8);
    if MidiFormat::from_u16(format).is_none() {
        return Err(MalformedFileError::UnsupportedFormat(format));
    }
    let declared = read_u16(bytes, 10);
    if read_u16(bytes, 12) & 0x8000 != 0 {
        return Err(MalformedFileError::UnsupportedTiming);
    }

    let mut offset = 8 + header_len as usize;
    let mut found = 0usize;
    while offset < bytes.len() {
        let available = bytes.len() - offset;
        if available < 8 {
            return Err(MalformedFileError::TruncatedChunk {
                offset,
                declared: 8,
                available,
            });
        }
        let tag = &bytes[offset..offset + 4];
        let length = read_u32(bytes, offset + 4);
        if length as usize > available - 8 {
            return Err(MalformedFileError::TruncatedChunk {
                offset,
                declared: length,
                available: available - 8,
            });
        }
        if tag == b"MTrk" {
            found += 1;
        } else if !tag.iter().all(|b| b.is_ascii_alphanumeric()) {
            return Err(MalformedFileError::BadChunkTag {
                offset,
                expected: "MTrk",
                found: String::from_utf8_lossy(tag).into_owned(),
            });
        }
        // Unknown alphanumeric chunks are skipped
        offset += 8 + length as usize;
    }

    if found != declared as usize {
        return Err(MalformedFileError::TrackCountMismatch { declared, found });
    }
    Ok(())
}

/// Decode a binary Standard MIDI File
pub fn decode(bytes: &[u8]) -> Result<MidiFile, MalformedFileError> {
    validate_chunks(bytes)?;
    let smf = Smf::parse(bytes).map_err(|e| MalformedFileError::Parse(e.to_string()))?;

    let format = match smf.header.format {
        Format::SingleTrack => MidiFormat::SingleTrack,
        Format::Parallel => MidiFormat::Parallel,
        Format::Sequential => MidiFormat::Sequential,
    };
    let ticks_per_quarter = match smf.header.timing {
        Timing::Metrical(ticks) => ticks.as_int(),
        Timing::Timecode(..) => return Err(MalformedFileError::UnsupportedTiming),
    };

    let mut tracks = Vec::with_capacity(smf.tracks.len());
    for (index, track) in smf.tracks.iter().enumerate() {
        let mut events = Vec::with_capacity(track.len());
        let mut tick: i64 = 0;
        for event in track {
            tick += event.delta.as_int() as i64;
            let kind = kind_from_midly(&event.kind);
            let event = MidiEvent::new(tick, kind)
                .map_err(|source| MalformedFileError::InvalidEvent { track: index, source })?;
            events.push(event);
        }
        match events.last() {
            Some(last) if last.kind().is_end_of_track() => {}
            _ => return Err(MalformedFileError::MissingEndOfTrack { track: index }),
        }
        tracks.push(MidiTrack::from_events(events));
    }

    Ok(MidiFile::new(format, ticks_per_quarter, tracks))
}

/// Encode a MidiFile; delta times are written in minimal VLQ form
pub fn encode(file: &MidiFile) -> Result<Vec<u8>, EncodeError> {
    if file.ticks_per_quarter == 0 || file.ticks_per_quarter > 0x7FFF {
        return Err(EncodeError::InvalidResolution(file.ticks_per_quarter));
    }

    let header = Header {
        format: match file.format {
            MidiFormat::SingleTrack => Format::SingleTrack,
            MidiFormat::Parallel => Format::Parallel,
            MidiFormat::Sequential => Format::Sequential,
        },
        timing: Timing::Metrical(u15::from(file.ticks_per_quarter)),
    };

    let mut tracks = Vec::with_capacity(file.tracks.len());
    for (index, track) in file.tracks.iter().enumerate() {
        tracks.push(encode_track(index, track)?);
    }

    let smf = Smf { header, tracks };
    let mut bytes = Vec::new();
    smf.write(&mut bytes)
        .map_err(|e| EncodeError::Write(e.to_string()))?;
    Ok(bytes)
}

fn encode_track(index: usize, track: &MidiTrack) -> Result<Track<'_>, EncodeError> {
    let mut encoded = Track::with_capacity(track.len());
    let mut last_tick = 0u32;
    for event in track.events() {
        let kind = kind_to_midly(event.kind())
            .ok_or(EncodeError::InvalidSmpte { track: index })?;
        let delta = event.tick().saturating_sub(last_tick);
        encoded.push(TrackEvent {
            delta: u28::from(delta),
            kind,
        });
        last_tick = event.tick();
    }
    Ok(encoded)
}

/// Read and decode a MIDI file from disk
pub fn read_file(path: &Path) -> Result<MidiFile, MalformedFileError> {
    let bytes = std::fs::read(path)?;
    decode(&bytes)
}

/// Encode and write a MIDI file to disk
pub fn write_file(path: &Path, file: &MidiFile) -> Result<(), EncodeError> {
    let bytes = encode(file)?;
    std::fs::write(path, bytes)?;
    Ok(())
}

fn kind_from_midly(kind: &TrackEventKind<'_>) -> EventKind {
    match *kind {
        TrackEventKind::Midi { channel, message } => {
            let channel = channel.as_int();
            match message {
                MidiMessage::NoteOff { key, vel } => EventKind::NoteOff {
                    channel,
                    key: key.as_int(),
                    velocity: vel.as_int(),
                },
                MidiMessage::NoteOn { key, vel } => EventKind::NoteOn {
                    channel,
                    key: key.as_int(),
                    velocity: vel.as_int(),
                },
                MidiMessage::Aftertouch { key, vel } => EventKind::PolyPressure {
                    channel,
                    key: key.as_int(),
                    pressure: vel.as_int(),
                },
                MidiMessage::Controller { controller, value } => EventKind::ControlChange {
                    channel,
                    controller: controller.as_int(),
                    value: value.as_int(),
                },
                MidiMessage::ProgramChange { program } => EventKind::ProgramChange {
                    channel,
                    program: program.as_int(),
                },
                MidiMessage::ChannelAftertouch { vel } => EventKind::ChannelPressure {
                    channel,
                    pressure: vel.as_int(),
                },
                MidiMessage::PitchBend { bend } => EventKind::PitchBend {
                    channel,
                    value: bend.0.as_int(),
                },
            }
        }
        TrackEventKind::SysEx(data) => EventKind::SysEx(data.to_vec()),
        TrackEventKind::Escape(data) => EventKind::Escape(data.to_vec()),
        TrackEventKind::Meta(ref meta) => EventKind::Meta(meta_from_midly(meta)),
    }
}

fn meta_from_midly(meta: &MetaMessage<'_>) -> MetaEvent {
    match *meta {
        MetaMessage::TrackNumber(number) => MetaEvent::SequenceNumber(number),
        MetaMessage::Text(b) => MetaEvent::Text(b.to_vec()),
        MetaMessage::Copyright(b) => MetaEvent::Copyright(b.to_vec()),
        MetaMessage::TrackName(b) => MetaEvent::TrackName(b.to_vec()),
        MetaMessage::InstrumentName(b) => MetaEvent::InstrumentName(b.to_vec()),
        MetaMessage::Lyric(b) => MetaEvent::Lyric(b.to_vec()),
        MetaMessage::Marker(b) => MetaEvent::Marker(b.to_vec()),
        MetaMessage::CuePoint(b) => MetaEvent::CuePoint(b.to_vec()),
        MetaMessage::ProgramName(b) => MetaEvent::ProgramName(b.to_vec()),
        MetaMessage::DeviceName(b) => MetaEvent::DeviceName(b.to_vec()),
        MetaMessage::MidiChannel(channel) => MetaEvent::ChannelPrefix(channel.as_int()),
        MetaMessage::MidiPort(port) => MetaEvent::Port(port.as_int()),
        MetaMessage::EndOfTrack => MetaEvent::EndOfTrack,
        MetaMessage::Tempo(tempo) => MetaEvent::Tempo(tempo.as_int()),
        MetaMessage::SmpteOffset(ref time) => MetaEvent::SmpteOffset(SmpteOffset {
            fps: match time.fps() {
                Fps::Fps24 => 24,
                Fps::Fps25 => 25,
                Fps::Fps29 => 29,
                Fps::Fps30 => 30,
            },
            hour: time.hour(),
            minute: time.minute(),
            second: time.second(),
            frame: time.frame(),
            subframe: time.subframe(),
        }),
        MetaMessage::TimeSignature(numerator, denominator_pow, clocks, thirty_seconds) => {
            MetaEvent::TimeSignature {
                numerator,
                denominator_pow,
                clocks_per_click: clocks,
                thirty_seconds_per_quarter: thirty_seconds,
            }
        }
        MetaMessage::KeySignature(sharps, minor) => MetaEvent::KeySignature { sharps, minor },
        MetaMessage::SequencerSpecific(b) => MetaEvent::SequencerSpecific(b.to_vec()),
        MetaMessage::Unknown(kind, data) => MetaEvent::Unknown {
            kind,
            data: data.to_vec(),
        },
    }
}

/// Convert a model event kind; `None` only for an SMPTE time midly rejects
fn kind_to_midly(kind: &EventKind) -> Option<TrackEventKind<'_>> {
    let midi = |channel: u8, message: MidiMessage| TrackEventKind::Midi {
        channel: u4::from(channel),
        message,
    };
    let converted = match kind {
        EventKind::NoteOff { channel, key, velocity } => midi(
            *channel,
            MidiMessage::NoteOff {
                key: u7::from(*key),
                vel: u7::from(*velocity),
            },
        ),
        EventKind::NoteOn { channel, key, velocity } => midi(
            *channel,
            MidiMessage::NoteOn {
                key: u7::from(*key),
                vel: u7::from(*velocity),
            },
        ),
        EventKind::PolyPressure { channel, key, pressure } => midi(
            *channel,
            MidiMessage::Aftertouch {
                key: u7::from(*key),
                vel: u7::from(*pressure),
            },
        ),
        EventKind::ControlChange { channel, controller, value } => midi(
            *channel,
            MidiMessage::Controller {
                controller: u7::from(*controller),
                value: u7::from(*value),
            },
        ),
        EventKind::ProgramChange { channel, program } => midi(
            *channel,
            MidiMessage::ProgramChange {
                program: u7::from(*program),
            },
        ),
        EventKind::ChannelPressure { channel, pressure } => midi(
            *channel,
            MidiMessage::ChannelAftertouch {
                vel: u7::from(*pressure),
            },
        ),
        EventKind::PitchBend { channel, value } => midi(
            *channel,
            MidiMessage::PitchBend {
                bend: PitchBend(u14::from(*value)),
            },
        ),
        EventKind::SysEx(data) => TrackEventKind::SysEx(data),
        EventKind::Escape(data) => TrackEventKind::Escape(data),
        EventKind::Meta(meta) => TrackEventKind::Meta(meta_to_midly(meta)?),
    };
    Some(converted)
}

fn meta_to_midly(meta: &MetaEvent) -> Option<MetaMessage<'_>> {
    let converted = match meta {
        MetaEvent::SequenceNumber(number) => MetaMessage::TrackNumber(*number),
        MetaEvent::Text(b) => MetaMessage::Text(b),
        MetaEvent::Copyright(b) => MetaMessage::Copyright(b),
        MetaEvent::TrackName(b) => MetaMessage::TrackName(b),
        MetaEvent::InstrumentName(b) => MetaMessage::InstrumentName(b),
        MetaEvent::Lyric(b) => MetaMessage::Lyric(b),
        MetaEvent::Marker(b) => MetaMessage::Marker(b),
        MetaEvent::CuePoint(b) => MetaMessage::CuePoint(b),
        MetaEvent::ProgramName(b) => MetaMessage::ProgramName(b),
        MetaEvent::DeviceName(b) => MetaMessage::DeviceName(b),
        MetaEvent::ChannelPrefix(channel) => MetaMessage::MidiChannel(u4::from(*channel)),
        MetaEvent::Port(port) => MetaMessage::MidiPort(u7::from(*port)),
        MetaEvent::EndOfTrack => MetaMessage::EndOfTrack,
        MetaEvent::Tempo(tempo) => MetaMessage::Tempo(u24::from(*tempo)),
        MetaEvent::SmpteOffset(offset) => {
            let fps = match offset.fps {
                24 => Fps::Fps24,
                25 => Fps::Fps25,
                29 => Fps::Fps29,
                30 => Fps::Fps30,
                _ => return None,
            };
            MetaMessage::SmpteOffset(SmpteTime::new(
                offset.hour,
                offset.minute,
                offset.second,
                offset.frame,
                offset.subframe,
                fps,
            )?)
        }
        MetaEvent::TimeSignature {
            numerator,
            denominator_pow,
            clocks_per_click,
            thirty_seconds_per_quarter,
        } => MetaMessage::TimeSignature(
            *numerator,
            *denominator_pow,
            *clocks_per_click,
            *thirty_seconds_per_quarter,
        ),
        MetaEvent::KeySignature { sharps, minor } => MetaMessage::KeySignature(*sharps, *minor),
        MetaEvent::SequencerSpecific(b) => MetaMessage::SequencerSpecific(b),
        MetaEvent::Unknown { kind, data } => MetaMessage::Unknown(*kind, data),
    };
    Some(converted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::midi::event::CC_VOLUME;

    /// Conductor track plus one melodic track covering every event kind
    fn sample_file() -> MidiFile {
        let conductor = MidiTrack::from_events(vec![
            MidiEvent::meta(0, MetaEvent::TrackName(b"song".to_vec())).unwrap(),
            MidiEvent::meta(0, MetaEvent::Tempo(500_000)).unwrap(),
            MidiEvent::meta(
                0,
                MetaEvent::TimeSignature {
                    numerator: 4,
                    denominator_pow: 2,
                    clocks_per_click: 24,
                    thirty_seconds_per_quarter: 8,
                },
            )
            .unwrap(),
            MidiEvent::meta(0, MetaEvent::KeySignature { sharps: -3, minor: true }).unwrap(),
            MidiEvent::meta(1920, MetaEvent::Marker(b"Verse \"1\"".to_vec())).unwrap(),
            MidiEvent::meta(3840, MetaEvent::EndOfTrack).unwrap(),
        ]);
        let melody = MidiTrack::from_events(vec![
            MidiEvent::meta(0, MetaEvent::TrackName(b"bass".to_vec())).unwrap(),
            MidiEvent::new(0, EventKind::ProgramChange { channel: 1, program: 33 }).unwrap(),
            MidiEvent::control_change(0, 1, CC_VOLUME, 100).unwrap(),
            MidiEvent::note_on(0, 1, 40, 90).unwrap(),
            MidiEvent::note_on(0, 1, 47, 90).unwrap(),
            MidiEvent::new(100, EventKind::PitchBend { channel: 1, value: 9000 }).unwrap(),
            MidiEvent::new(120, EventKind::PolyPressure { channel: 1, key: 40, pressure: 20 })
                .unwrap(),
            MidiEvent::new(130, EventKind::ChannelPressure { channel: 1, pressure: 30 }).unwrap(),
            MidiEvent::note_off(480, 1, 40, 64).unwrap(),
            MidiEvent::note_on(480, 1, 47, 0).unwrap(),
            MidiEvent::new(500, EventKind::SysEx(vec![0x7E, 0x7F, 0x09, 0x01, 0xF7])).unwrap(),
            MidiEvent::meta(600, MetaEvent::Unknown { kind: 0x60, data: vec![1, 2, 3] }).unwrap(),
            MidiEvent::meta(3840, MetaEvent::EndOfTrack).unwrap(),
        ]);
        MidiFile::new(MidiFormat::Parallel, 480, vec![conductor, melody])
    }

    #[test]
    fn test_round_trip() {
        let file = sample_file();
        let bytes = encode(&file).unwrap();
        let decoded = decode(&bytes).unwrap();
        assert_eq!(decoded, file);
    }

    #[test]
    fn test_drop_frame_smpte_round_trip() {
        let offset = SmpteOffset {
            fps: 29,
            hour: 0,
            minute: 59,
            second: 59,
            frame: 29,
            subframe: 99,
        };
        let track = MidiTrack::from_events(vec![
            MidiEvent::meta(0, MetaEvent::SmpteOffset(offset)).unwrap(),
            MidiEvent::meta(0, MetaEvent::EndOfTrack).unwrap(),
        ]);
        let file = MidiFile::new(MidiFormat::Parallel, 480, vec![track]);

        let decoded = decode(&encode(&file).unwrap()).unwrap();
        assert_eq!(decoded, file);
    }

    #[test]
    fn test_encoding_is_deterministic() {
        let file = sample_file();
        let first = encode(&file).unwrap();
        let second = encode(&decode(&first).unwrap()).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_unknown_meta_preserved() {
        let bytes = encode(&sample_file()).unwrap();
        let decoded = decode(&bytes).unwrap();
        let unknown = decoded.tracks[1]
            .events()
            .iter()
            .find(|e| matches!(e.kind(), EventKind::Meta(MetaEvent::Unknown { .. })))
            .unwrap();
        assert_eq!(
            unknown.kind(),
            &EventKind::Meta(MetaEvent::Unknown { kind: 0x60, data: vec![1, 2, 3] })
        );
    }

    fn single_track(track_data: &[u8]) -> Vec<u8> {
        let mut bytes = b"MThd".to_vec();
        bytes.extend_from_slice(&6u32.to_be_bytes());
        bytes.extend_from_slice(&0u16.to_be_bytes());
        bytes.extend_from_slice(&1u16.to_be_bytes());
        bytes.extend_from_slice(&96u16.to_be_bytes());
        bytes.extend_from_slice(b"MTrk");
        bytes.extend_from_slice(&(track_data.len() as u32).to_be_bytes());
        bytes.extend_from_slice(track_data);
        bytes
    }

    #[test]
    fn test_running_status_and_long_delta() {
        // Note on, then a running-status note on after a two-byte delta
        let data = [
            0x00, 0x90, 0x3C, 0x40, //
            0x81, 0x00, 0x3C, 0x00, //
            0x00, 0xFF, 0x2F, 0x00,
        ];
        let file = decode(&single_track(&data)).unwrap();
        let events = file.tracks[0].events();

        assert_eq!(file.format, MidiFormat::SingleTrack);
        assert_eq!(file.ticks_per_quarter, 96);
        assert_eq!(events.len(), 3);
        assert_eq!(events[1].tick(), 128);
        assert!(events[1].kind().is_note_end());
    }

    #[test]
    fn test_bad_header_tag() {
        let mut bytes = single_track(&[0x00, 0xFF, 0x2F, 0x00]);
        bytes[0] = b'X';
        assert!(matches!(
            decode(&bytes),
            Err(MalformedFileError::BadChunkTag { offset: 0, .. })
        ));
    }

    #[test]
    fn test_length_mismatched_track_chunk() {
        let mut bytes = single_track(&[0x00, 0xFF, 0x2F, 0x00]);
        // Claim 40 bytes of track data
        let len_offset = 14 + 4;
        bytes[len_offset..len_offset + 4].copy_from_slice(&40u32.to_be_bytes());
        assert!(matches!(
            decode(&bytes),
            Err(MalformedFileError::TruncatedChunk { declared: 40, .. })
        ));
    }

    #[test]
    fn test_truncated_vlq() {
        let bytes = single_track(&[0x81]);
        assert!(decode(&bytes).is_err());

        let bytes = single_track(&[0x00, 0x90, 0x3C, 0x40, 0xFF]);
        assert!(decode(&bytes).is_err());
    }

    #[test]
    fn test_track_count_mismatch() {
        let mut bytes = single_track(&[0x00, 0xFF, 0x2F, 0x00]);
        bytes[10..12].copy_from_slice(&2u16.to_be_bytes());
        assert!(matches!(
            decode(&bytes),
            Err(MalformedFileError::TrackCountMismatch { declared: 2, found: 1 })
        ));
    }

    #[test]
    fn test_file_round_trip_on_disk() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("song.mid");
        write_file(&path, &sample_file()).unwrap();
        assert_eq!(read_file(&path).unwrap(), sample_file());
    }
}

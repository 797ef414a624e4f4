// Voice Filter - isolate one voice before its transform stages run
// Also strips notation controllers and positions the voice's instrument

use super::voice_track_indices;
use crate::midi::{EventKind, InvalidEventError, MidiEvent, MidiFile, MidiTrack, CC_REVERB};
use crate::settings::{TrackSettings, VoiceDescriptor};

/// Bank select (MSB)
const CC_BANK_SELECT: u8 = 0;

/// Keep the conductor and the voice's tracks; every other track is emptied
///
/// The track count does not change, so track indices stay comparable
/// with the source file.
pub fn extract_voice(file: &MidiFile, voice: &VoiceDescriptor) -> MidiFile {
    let keep = voice_track_indices(file, voice);
    let tracks = file
        .tracks
        .iter()
        .enumerate()
        .map(|(index, track)| {
            if index == 0 || keep.contains(&index) {
                track.clone()
            } else {
                MidiTrack::empty()
            }
        })
        .collect();
    MidiFile::new(file.format, file.ticks_per_quarter, tracks)
}

/// Remove the listed controllers on `channel` from every track
pub fn remove_controllers(file: &MidiFile, channel: u8, controllers: &[u8]) -> MidiFile {
    let tracks = file
        .tracks
        .iter()
        .map(|track| {
            track.retain(|e| {
                !controllers
                    .iter()
                    .any(|&controller| e.kind().is_controller(channel, controller))
            })
        })
        .collect();
    MidiFile::new(file.format, file.ticks_per_quarter, tracks)
}

/// Replace the voice's program changes with the configured instrument and reverb
///
/// Instruments that are not a "bank:program" pair are left to the
/// renderer; only the reverb send is written then.
pub fn assign_instrument(
    file: &MidiFile,
    voice: &VoiceDescriptor,
    settings: &TrackSettings,
) -> Result<MidiFile, InvalidEventError> {
    let indices = voice_track_indices(file, voice);
    let Some(&first) = indices.first() else {
        return Ok(file.clone());
    };
    let channel = voice.channel;
    let program = settings.midi_program().filter(|_| !voice.is_drum);

    let mut tracks = file.tracks.clone();
    for &index in &indices {
        tracks[index] = tracks[index].retain(|e| match *e.kind() {
            EventKind::ProgramChange { channel: c, .. } => !(c == channel && program.is_some()),
            ref kind => !kind.is_controller(channel, CC_REVERB),
        });
    }

    let mut leading = Vec::new();
    if let Some((bank, program)) = program {
        if bank > 0 {
            leading.push(MidiEvent::control_change(0, channel, CC_BANK_SELECT, bank)?);
        }
        leading.push(MidiEvent::new(0, EventKind::ProgramChange { channel, program })?);
    }
    leading.push(MidiEvent::control_change(0, channel, CC_REVERB, settings.midi_reverb())?);

    // each leading insert lands ahead of the previous one
    for event in leading.into_iter().rev() {
        tracks[first].insert_leading(event);
    }
    Ok(MidiFile::new(file.format, file.ticks_per_quarter, tracks))
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::*;
    use crate::midi::{CC_PAN, CC_VOLUME};

    fn two_voice_file() -> MidiFile {
        let mut file = voice_file("bass", 1, 2);
        let guitar = voice_file("guitar", 2, 2);
        file.tracks.push(guitar.tracks[1].clone());
        file
    }

    #[test]
    fn test_extract_voice_keeps_track_count() {
        let file = two_voice_file();
        let voice = VoiceDescriptor::new("guitar", 2);

        let extracted = extract_voice(&file, &voice);

        assert_eq!(extracted.tracks.len(), 3);
        assert_eq!(extracted.tracks[0], file.tracks[0]);
        assert_eq!(extracted.tracks[1], MidiTrack::empty());
        assert_eq!(extracted.tracks[2], file.tracks[2]);
    }

    #[test]
    fn test_remove_controllers_only_on_channel() {
        let mut file = two_voice_file();
        file.tracks[1].insert(MidiEvent::control_change(0, 1, CC_VOLUME, 90).unwrap());
        file.tracks[1].insert(MidiEvent::control_change(0, 1, CC_PAN, 20).unwrap());
        file.tracks[2].insert(MidiEvent::control_change(0, 2, CC_VOLUME, 90).unwrap());

        let result = remove_controllers(&file, 1, &[CC_VOLUME, CC_PAN, CC_REVERB]);

        assert!(!result.tracks[1].events().iter().any(|e| e.kind().is_controller(1, CC_VOLUME)));
        assert!(!result.tracks[1].events().iter().any(|e| e.kind().is_controller(1, CC_PAN)));
        assert!(result.tracks[2].events().iter().any(|e| e.kind().is_controller(2, CC_VOLUME)));
    }

    #[test]
    fn test_assign_instrument_replaces_program() {
        let mut file = voice_file("guitar", 2, 1);
        file.tracks[1].insert_leading(MidiEvent::new(0, EventKind::ProgramChange { channel: 2, program: 5 }).unwrap());
        let voice = VoiceDescriptor::new("guitar", 2);
        let mut settings = default_settings();
        settings.instrument = "8:27".to_string();
        settings.reverb = 0.5;

        let result = assign_instrument(&file, &voice, &settings).unwrap();

        let channel_events: Vec<&EventKind> = result.tracks[1]
            .events()
            .iter()
            .map(|e| e.kind())
            .filter(|k| !matches!(k, EventKind::NoteOn { .. } | EventKind::NoteOff { .. }))
            .filter(|k| k.channel().is_some())
            .collect();
        assert_eq!(
            channel_events,
            vec![
                &EventKind::ControlChange { channel: 2, controller: 0, value: 8 },
                &EventKind::ProgramChange { channel: 2, program: 27 },
                &EventKind::ControlChange { channel: 2, controller: CC_REVERB, value: 64 },
            ]
        );
    }

    #[test]
    fn test_named_instrument_keeps_program() {
        let mut file = voice_file("strings", 4, 1);
        file.tracks[1].insert_leading(MidiEvent::new(0, EventKind::ProgramChange { channel: 4, program: 48 }).unwrap());
        let voice = VoiceDescriptor::new("strings", 4);
        let mut settings = default_settings();
        settings.instrument = "Warm Strings".to_string();

        let result = assign_instrument(&file, &voice, &settings).unwrap();

        let programs = result.tracks[1]
            .events()
            .iter()
            .filter(|e| matches!(e.kind(), EventKind::ProgramChange { program: 48, .. }))
            .count();
        assert_eq!(programs, 1);
    }
}

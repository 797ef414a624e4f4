// Mute - drop the voice's notes, keep the file structure

use super::{TransformContext, TransformFailure};
use crate::midi::{EventKind, MidiFile};

pub(super) fn mute(file: &MidiFile, ctx: &TransformContext) -> Result<MidiFile, TransformFailure> {
    if !ctx.settings.mute {
        return Ok(file.clone());
    }
    let channel = ctx.voice.channel;
    let tracks = file
        .tracks
        .iter()
        .map(|track| track.retain(|e| !is_note_event(e.kind(), channel)))
        .collect();

    log::debug!("Muted voice '{}' on channel {}", ctx.voice.name, channel);
    Ok(MidiFile::new(file.format, file.ticks_per_quarter, tracks))
}

fn is_note_event(kind: &EventKind, channel: u8) -> bool {
    matches!(
        *kind,
        EventKind::NoteOn { channel: c, .. }
            | EventKind::NoteOff { channel: c, .. }
            | EventKind::PolyPressure { channel: c, .. } if c == channel
    )
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::*;
    use crate::settings::VoiceDescriptor;

    #[test]
    fn test_mute_removes_notes_keeps_meta() {
        let file = voice_file("vocals", 0, 2);
        let tempo = tempo_of(&file);
        let voice = VoiceDescriptor::new("vocals", 0);
        let mut settings = default_settings();
        settings.mute = true;
        let ctx = TransformContext {
            voice: &voice,
            settings: &settings,
            source_tempo: &tempo,
            tempo: &tempo,
        };

        let result = mute(&file, &ctx).unwrap();

        let notes = result
            .tracks
            .iter()
            .flat_map(|t| t.events())
            .filter(|e| e.kind().is_note_start() || e.kind().is_note_end())
            .count();
        assert_eq!(notes, 0);
        assert_eq!(result.tracks.len(), 2);
        assert_eq!(result.tracks[0], file.tracks[0]);
        assert_eq!(result.tracks[1].name().as_deref(), Some("vocals"));
        assert!(result.tracks[1].events().last().unwrap().kind().is_end_of_track());
        assert!(result.tempo_track().same_timing(&tempo));
    }

    #[test]
    fn test_unmuted_voice_unchanged() {
        let file = voice_file("vocals", 0, 2);
        let tempo = tempo_of(&file);
        let voice = VoiceDescriptor::new("vocals", 0);
        let settings = default_settings();
        let ctx = TransformContext {
            voice: &voice,
            settings: &settings,
            source_tempo: &tempo,
            tempo: &tempo,
        };

        assert_eq!(mute(&file, &ctx).unwrap(), file);
    }
}

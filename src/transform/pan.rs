// Pan - one stereo position controller at the start of the voice

use super::{voice_track_indices, TransformContext, TransformFailure};
use crate::midi::{MidiEvent, MidiFile, CC_PAN};

pub(super) fn apply_pan(file: &MidiFile, ctx: &TransformContext) -> Result<MidiFile, TransformFailure> {
    let indices = voice_track_indices(file, ctx.voice);
    let Some(&first) = indices.first() else {
        return Err(TransformFailure::NoVoiceTrack);
    };
    let channel = ctx.voice.channel;
    let event = MidiEvent::control_change(0, channel, CC_PAN, ctx.settings.midi_pan())?;

    let mut tracks = file.tracks.clone();
    for &index in &indices {
        tracks[index] = tracks[index].retain(|e| !e.kind().is_controller(channel, CC_PAN));
    }
    tracks[first].insert_leading(event);
    Ok(MidiFile::new(file.format, file.ticks_per_quarter, tracks))
}

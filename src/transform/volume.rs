// Volume Shaping - channel volume from a constant or a measure curve
// Curves step at measure starts or ramp one value at a time

use super::{voice_track_indices, TransformContext, TransformFailure};
use crate::midi::{MidiEvent, MidiFile, TempoTrack, CC_VOLUME};
use crate::settings::{Breakpoint, VolumeSpec};
use std::collections::{BTreeMap, BTreeSet};

pub(super) fn shape_volume(file: &MidiFile, ctx: &TransformContext) -> Result<MidiFile, TransformFailure> {
    let indices = voice_track_indices(file, ctx.voice);
    let Some(&first) = indices.first() else {
        return Err(TransformFailure::NoVoiceTrack);
    };
    let channel = ctx.voice.channel;
    let events = volume_events(&ctx.settings.volume, ctx.tempo, channel)?;

    let mut tracks = file.tracks.clone();
    for &index in &indices {
        tracks[index] = tracks[index].retain(|e| !e.kind().is_controller(channel, CC_VOLUME));
    }
    let mut track = tracks[first].clone();
    for event in events {
        track.insert_leading(event);
    }
    // breakpoints may lie past a short voice track's end marker
    tracks[first] = track.normalized();
    Ok(MidiFile::new(file.format, file.ticks_per_quarter, tracks))
}

/// Volume controller events for `spec`, ordered by tick
pub fn volume_events(
    spec: &VolumeSpec,
    tempo: &TempoTrack,
    channel: u8,
) -> Result<Vec<MidiEvent>, TransformFailure> {
    let steps = match spec {
        VolumeSpec::Constant(value) => BTreeMap::from([(0u64, *value)]),
        VolumeSpec::Curve {
            points,
            interpolate,
        } => curve_steps(points, *interpolate, tempo)?,
    };

    steps
        .into_iter()
        .map(|(tick, value)| {
            let tick = i64::try_from(tick).unwrap_or(i64::MAX);
            MidiEvent::control_change(tick, channel, CC_VOLUME, value).map_err(Into::into)
        })
        .collect()
}

fn curve_steps(
    points: &[Breakpoint],
    interpolate: bool,
    tempo: &TempoTrack,
) -> Result<BTreeMap<u64, u8>, TransformFailure> {
    let max = tempo.measure_count();
    let mut seen = BTreeSet::new();
    for point in points {
        if point.measure == 0 || point.measure > max {
            return Err(TransformFailure::MeasureOutOfRange {
                measure: point.measure,
                max,
            });
        }
        if !seen.insert(point.measure) {
            return Err(TransformFailure::DuplicateBreakpoint(point.measure));
        }
    }

    let mut sorted = points.to_vec();
    sorted.sort_by_key(|p| p.measure);

    let mut steps = BTreeMap::new();
    for (index, point) in sorted.iter().enumerate() {
        let start = tempo.measure_start_tick(point.measure);
        steps.insert(start, point.value);

        let Some(next) = sorted.get(index + 1).filter(|_| interpolate) else {
            continue;
        };
        let end = tempo.measure_start_tick(next.measure);
        let delta = next.value as i64 - point.value as i64;
        let count = delta.unsigned_abs();
        // one event per integer value between the two breakpoints
        for k in 1..count {
            let tick = start + (end - start) * k / count;
            if tick > start {
                let value = point.value as i64 + k as i64 * delta.signum();
                steps.insert(tick, value as u8);
            }
        }
    }
    Ok(steps)
}

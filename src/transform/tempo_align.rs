// Tempo Alignment - move measures onto a target tempo track
// Events keep their measure and offset; the conductor gets the target tempo map

use super::{TransformContext, TransformFailure};
use crate::midi::{EventKind, MetaEvent, MidiEvent, MidiFile, MidiTrack, TempoEntry, TempoTrack};

pub(super) fn align(file: &MidiFile, ctx: &TransformContext) -> Result<MidiFile, TransformFailure> {
    if ctx.source_tempo.same_timing(ctx.tempo) {
        return Ok(file.clone());
    }
    if ctx.tempo.ticks_per_quarter() != file.ticks_per_quarter {
        return Err(TransformFailure::ResolutionMismatch {
            expected: file.ticks_per_quarter,
            found: ctx.tempo.ticks_per_quarter(),
        });
    }

    let mut tracks = Vec::with_capacity(file.tracks.len());
    for track in &file.tracks {
        let mut events = Vec::with_capacity(track.len());
        for event in track.events() {
            if matches!(event.kind(), EventKind::Meta(meta) if meta.is_timing()) {
                continue;
            }
            let tick = retime(event.tick(), ctx.source_tempo, ctx.tempo);
            events.push(event.with_tick(tick)?);
        }
        tracks.push(MidiTrack::from_events(events));
    }

    if let Some(conductor) = tracks.first_mut() {
        let mut events = timing_events(ctx.tempo)?;
        events.extend(std::mem::take(conductor).into_events());
        *conductor = MidiTrack::from_events(events);
    }

    log::debug!(
        "Aligned voice '{}' to {} tempo entries",
        ctx.voice.name,
        ctx.tempo.entries().count()
    );

    Ok(MidiFile::new(
        file.format,
        file.ticks_per_quarter,
        tracks.into_iter().map(MidiTrack::normalized).collect(),
    ))
}

/// Same measure and offset on the target track
fn retime(tick: u32, source: &TempoTrack, target: &TempoTrack) -> i64 {
    let (measure, offset) = source.locate(tick);
    let moved = target.measure_start_tick(measure) + offset as u64;
    i64::try_from(moved).unwrap_or(i64::MAX)
}

/// Tempo and time signature events at every target entry that changes them
fn timing_events(tempo: &TempoTrack) -> Result<Vec<MidiEvent>, TransformFailure> {
    let mut events = Vec::new();
    let mut previous: Option<TempoEntry> = None;

    for (measure, entry) in tempo.entries() {
        let tick = i64::try_from(tempo.measure_start_tick(measure)).unwrap_or(i64::MAX);

        if previous.map_or(true, |p| p.micros_per_quarter != entry.micros_per_quarter) {
            events.push(MidiEvent::meta(tick, MetaEvent::Tempo(entry.micros_per_quarter))?);
        }
        if previous.map_or(true, |p| (p.numerator, p.denominator) != (entry.numerator, entry.denominator)) {
            events.push(MidiEvent::meta(
                tick,
                MetaEvent::TimeSignature {
                    numerator: entry.numerator,
                    denominator_pow: entry.denominator.trailing_zeros() as u8,
                    clocks_per_click: 24,
                    thirty_seconds_per_quarter: 8,
                },
            )?);
        }
        previous = Some(*entry);
    }
    Ok(events)
}

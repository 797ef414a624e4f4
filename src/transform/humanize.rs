// Humanization - seeded timing and velocity jitter for drum voices
// Reproducible per (voice, measure, seed); chords move together

use super::{voice_track_indices, TransformContext, TransformFailure};
use crate::midi::{EventKind, MidiEvent, MidiFile, MidiTrack};
use crate::settings::HumanizeSettings;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, VecDeque};

pub(super) fn humanize(file: &MidiFile, ctx: &TransformContext) -> Result<MidiFile, TransformFailure> {
    let Some(params) = ctx.settings.humanize.filter(|_| ctx.voice.is_drum) else {
        return Ok(file.clone());
    };
    if params.timing_jitter == 0 && params.velocity_jitter == 0 {
        return Ok(file.clone());
    }

    let mut tracks = file.tracks.clone();
    for index in voice_track_indices(file, ctx.voice) {
        tracks[index] = humanize_track(&file.tracks[index], ctx, &params)?;
    }
    Ok(MidiFile::new(file.format, file.ticks_per_quarter, tracks))
}

/// Seed of the generator for one measure of one voice
pub fn measure_seed(voice: &str, measure: u32, seed: u64) -> u64 {
    let mut hasher = Sha256::new();
    hasher.update(voice.as_bytes());
    hasher.update(measure.to_le_bytes());
    hasher.update(seed.to_le_bytes());
    let digest = hasher.finalize();

    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    u64::from_le_bytes(bytes)
}

/// Random draws for one track, restarted at every measure
struct Jitter<'a> {
    voice: &'a str,
    params: &'a HumanizeSettings,
    measure: u32,
    rng: Option<StdRng>,
    /// Offset per source tick, so simultaneous hits share it
    offsets: HashMap<u32, i64>,
}

impl<'a> Jitter<'a> {
    fn new(voice: &'a str, params: &'a HumanizeSettings) -> Self {
        Jitter {
            voice,
            params,
            measure: 0,
            rng: None,
            offsets: HashMap::new(),
        }
    }

    fn rng(&mut self, measure: u32) -> &mut StdRng {
        if self.measure != measure {
            self.measure = measure;
            self.rng = None;
        }
        let (voice, seed) = (self.voice, self.params.seed);
        self.rng
            .get_or_insert_with(|| StdRng::seed_from_u64(measure_seed(voice, measure, seed)))
    }

    fn timing(&mut self, measure: u32, tick: u32) -> i64 {
        if let Some(offset) = self.offsets.get(&tick) {
            return *offset;
        }
        let bound = self.params.timing_jitter as i64;
        let offset = draw(self.rng(measure), bound);
        self.offsets.insert(tick, offset);
        offset
    }

    fn velocity(&mut self, measure: u32) -> i64 {
        let bound = self.params.velocity_jitter as i64;
        draw(self.rng(measure), bound)
    }
}

fn draw(rng: &mut StdRng, bound: i64) -> i64 {
    if bound == 0 {
        0
    } else {
        rng.random_range(-bound..=bound)
    }
}

fn humanize_track(
    track: &MidiTrack,
    ctx: &TransformContext,
    params: &HumanizeSettings,
) -> Result<MidiTrack, TransformFailure> {
    let channel = ctx.voice.channel;
    let source = track.events();
    let mut jitter = Jitter::new(&ctx.voice.name, params);

    let mut ticks: Vec<i64> = source.iter().map(|e| e.tick() as i64).collect();
    let mut kinds: Vec<EventKind> = source.iter().map(|e| e.kind().clone()).collect();
    // Tick of the (moved) note-on each note end belongs to
    let mut start_of: Vec<Option<i64>> = vec![None; source.len()];
    let mut open: HashMap<u8, VecDeque<(i64, i64)>> = HashMap::new();

    for (index, event) in source.iter().enumerate() {
        let kind = event.kind();
        if kind.channel() != Some(channel) {
            continue;
        }
        match *kind {
            EventKind::NoteOn { key, velocity, .. } if velocity > 0 => {
                let (measure, _) = ctx.tempo.locate(event.tick());
                let (offset, velocity) = if measure <= params.count_in_measures {
                    (0, velocity)
                } else {
                    let offset = jitter.timing(measure, event.tick());
                    let delta = jitter.velocity(measure);
                    (offset, (velocity as i64 + delta).clamp(1, 127) as u8)
                };
                ticks[index] = (ticks[index] + offset).max(0);
                kinds[index] = EventKind::NoteOn {
                    channel,
                    key,
                    velocity,
                };
                open.entry(key).or_default().push_back((offset, ticks[index]));
            }
            _ if kind.is_note_end() => {
                let Some(key) = kind.key() else { continue };
                if let Some((offset, start)) = open.get_mut(&key).and_then(|q| q.pop_front()) {
                    ticks[index] = (ticks[index] + offset).max(start);
                    start_of[index] = Some(start);
                }
            }
            _ => {}
        }
    }

    // A note end may not run into the next hit of the same key
    let mut next_start: HashMap<u8, i64> = HashMap::new();
    for index in (0..source.len()).rev() {
        let kind = &kinds[index];
        if kind.channel() != Some(channel) {
            continue;
        }
        let Some(key) = kind.key() else { continue };
        if kind.is_note_start() {
            next_start.insert(key, ticks[index]);
        } else if kind.is_note_end() {
            if let (Some(&next), Some(start)) = (next_start.get(&key), start_of[index]) {
                if ticks[index] >= next {
                    ticks[index] = (next - 1).max(start);
                }
            }
        }
    }

    let events = source
        .iter()
        .zip(ticks)
        .zip(kinds)
        .map(|((event, tick), kind)| event.with_tick(tick)?.with_kind(kind))
        .collect::<Result<Vec<MidiEvent>, _>>()?;

    Ok(MidiTrack::from_events(events).normalized())
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::*;
    use crate::midi::{MetaEvent, MidiFormat};
    use crate::settings::{TrackSettings, VoiceDescriptor};

    fn drum_settings(seed: u64, count_in: u32) -> TrackSettings {
        let mut settings = default_settings();
        settings.humanize = Some(HumanizeSettings {
            timing_jitter: 12,
            velocity_jitter: 10,
            count_in_measures: count_in,
            seed,
        });
        settings
    }

    fn run(file: &MidiFile, voice: &VoiceDescriptor, settings: &TrackSettings) -> MidiFile {
        let tempo = tempo_of(file);
        let ctx = TransformContext {
            voice,
            settings,
            source_tempo: &tempo,
            tempo: &tempo,
        };
        humanize(file, &ctx).unwrap()
    }

    fn note_starts(track: &MidiTrack) -> Vec<(u32, u8)> {
        track
            .events()
            .iter()
            .filter_map(|e| match *e.kind() {
                EventKind::NoteOn { velocity, .. } if velocity > 0 => Some((e.tick(), velocity)),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_same_seed_is_reproducible() {
        let file = voice_file("drums", 9, 4);
        let voice = VoiceDescriptor::drum("drums", 9);
        let settings = drum_settings(7, 0);

        let first = run(&file, &voice, &settings);
        let second = run(&file, &voice, &settings);

        assert_eq!(first, second);
        assert_ne!(first, file);
    }

    #[test]
    fn test_different_seed_changes_result() {
        let file = voice_file("drums", 9, 4);
        let voice = VoiceDescriptor::drum("drums", 9);

        let first = run(&file, &voice, &drum_settings(1, 0));
        let second = run(&file, &voice, &drum_settings(2, 0));

        assert_ne!(first, second);
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let file = voice_file("drums", 9, 4);
        let voice = VoiceDescriptor::drum("drums", 9);
        let result = run(&file, &voice, &drum_settings(3, 0));

        let before = note_starts(&file.tracks[1]);
        let after = note_starts(&result.tracks[1]);
        assert_eq!(before.len(), after.len());
        for ((tick, velocity), (new_tick, new_velocity)) in before.iter().zip(&after) {
            assert!((*new_tick as i64 - *tick as i64).abs() <= 12);
            assert!((*new_velocity as i64 - *velocity as i64).abs() <= 10);
            assert!((1..=127).contains(new_velocity));
        }
    }

    #[test]
    fn test_count_in_measures_untouched() {
        let file = voice_file("drums", 9, 4);
        let voice = VoiceDescriptor::drum("drums", 9);
        let result = run(&file, &voice, &drum_settings(5, 2));

        let before = note_starts(&file.tracks[1]);
        let after = note_starts(&result.tracks[1]);
        // two 4/4 measures of quarter notes
        assert_eq!(before[..8], after[..8]);
    }

    #[test]
    fn test_non_drum_voice_untouched() {
        let file = voice_file("bass", 1, 4);
        let voice = VoiceDescriptor::new("bass", 1);
        let result = run(&file, &voice, &drum_settings(7, 0));
        assert_eq!(result, file);
    }

    #[test]
    fn test_chord_notes_share_offset() {
        let events = vec![
            MidiEvent::meta(0, MetaEvent::TrackName(b"drums".to_vec())).unwrap(),
            MidiEvent::note_on(480, 9, 36, 100).unwrap(),
            MidiEvent::note_on(480, 9, 42, 100).unwrap(),
            MidiEvent::note_off(600, 9, 36, 0).unwrap(),
            MidiEvent::note_off(600, 9, 42, 0).unwrap(),
            MidiEvent::meta(1920, MetaEvent::EndOfTrack).unwrap(),
        ];
        let file = MidiFile::new(
            MidiFormat::Parallel,
            TPQ,
            vec![MidiTrack::empty(), MidiTrack::from_events(events)],
        );
        let voice = VoiceDescriptor::drum("drums", 9);
        let result = run(&file, &voice, &drum_settings(11, 0));

        let starts = note_starts(&result.tracks[1]);
        assert_eq!(starts.len(), 2);
        assert_eq!(starts[0].0, starts[1].0);
    }

    #[test]
    fn test_note_end_clipped_before_next_hit() {
        // back-to-back hits on one key: the first end must stay before the second start
        let mut events = vec![MidiEvent::meta(0, MetaEvent::TrackName(b"drums".to_vec())).unwrap()];
        for i in 0..32i64 {
            events.push(MidiEvent::note_on(i * 60, 9, 38, 100).unwrap());
            events.push(MidiEvent::note_off(i * 60 + 59, 9, 38, 0).unwrap());
        }
        events.push(MidiEvent::meta(1920, MetaEvent::EndOfTrack).unwrap());
        let file = MidiFile::new(
            MidiFormat::Parallel,
            TPQ,
            vec![MidiTrack::empty(), MidiTrack::from_events(events)],
        );
        let voice = VoiceDescriptor::drum("drums", 9);
        let result = run(&file, &voice, &drum_settings(13, 0));

        let mut sounding = false;
        for event in result.tracks[1].events() {
            if event.kind().is_note_start() {
                assert!(!sounding, "overlapping hit at tick {}", event.tick());
                sounding = true;
            } else if event.kind().is_note_end() {
                sounding = false;
            }
        }
    }

    #[test]
    fn test_measure_seed_depends_on_all_inputs() {
        let base = measure_seed("drums", 3, 0);
        assert_eq!(base, measure_seed("drums", 3, 0));
        assert_ne!(base, measure_seed("drums", 4, 0));
        assert_ne!(base, measure_seed("drums", 3, 1));
        assert_ne!(base, measure_seed("percussion", 3, 0));
    }
}

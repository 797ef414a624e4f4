// Transformation Engine - ordered per-voice MIDI transform stages
// Each stage maps a MidiFile plus voice settings to a new MidiFile

pub mod tempo_align;
pub mod humanize;
pub mod volume;
pub mod pan;
pub mod mute;
pub mod filter;

use crate::midi::{InvalidEventError, MidiFile, TempoTrack};
use crate::settings::{TrackSettings, VoiceDescriptor};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Everything a stage may read besides the file itself
#[derive(Debug, Clone, Copy)]
pub struct TransformContext<'a> {
    pub voice: &'a VoiceDescriptor,
    pub settings: &'a TrackSettings,
    /// Tempo track derived from the source file
    pub source_tempo: &'a TempoTrack,
    /// Tempo track the output should follow (the source's unless aligned)
    pub tempo: &'a TempoTrack,
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum TransformFailure {
    #[error("measure {measure} is outside the piece (1..={max})")]
    MeasureOutOfRange { measure: u32, max: u32 },

    #[error("measure {0} has more than one volume breakpoint")]
    DuplicateBreakpoint(u32),

    #[error("no track carries the voice")]
    NoVoiceTrack,

    #[error("tempo track has {found} ticks per quarter, file has {expected}")]
    ResolutionMismatch { expected: u16, found: u16 },

    #[error("invalid event: {0}")]
    InvalidEvent(#[from] InvalidEventError),
}

/// Stage failure with the stage and voice it happened in
#[derive(Debug, Error, Clone, PartialEq)]
#[error("Stage '{stage}' failed for voice '{voice}': {reason}")]
pub struct TransformError {
    pub stage: &'static str,
    pub voice: String,
    #[source]
    pub reason: TransformFailure,
}

/// Transform stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Re-time measures to the target tempo track
    TempoAlign,
    /// Seeded timing and velocity jitter for drum voices
    Humanize,
    /// Volume controller events from a constant or a curve
    VolumeShape,
    Pan,
    Mute,
}

impl Stage {
    pub const ALL: [Stage; 5] = [
        Stage::TempoAlign,
        Stage::Humanize,
        Stage::VolumeShape,
        Stage::Pan,
        Stage::Mute,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Stage::TempoAlign => "tempo_align",
            Stage::Humanize => "humanize",
            Stage::VolumeShape => "volume_shape",
            Stage::Pan => "pan",
            Stage::Mute => "mute",
        }
    }

    /// Apply this stage, tagging failures with stage and voice
    pub fn apply(self, file: &MidiFile, ctx: &TransformContext) -> Result<MidiFile, TransformError> {
        let result = match self {
            Stage::TempoAlign => tempo_align::align(file, ctx),
            Stage::Humanize => humanize::humanize(file, ctx),
            Stage::VolumeShape => volume::shape_volume(file, ctx),
            Stage::Pan => pan::apply_pan(file, ctx),
            Stage::Mute => mute::mute(file, ctx),
        };
        result.map_err(|reason| TransformError {
            stage: self.name(),
            voice: ctx.voice.name.clone(),
            reason,
        })
    }
}

/// Ordered list of stages
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pipeline {
    stages: Vec<Stage>,
}

impl Default for Pipeline {
    fn default() -> Self {
        Self::standard()
    }
}

impl Pipeline {
    /// Tempo alignment, humanization, volume, pan, mute
    pub fn standard() -> Self {
        Pipeline {
            stages: Stage::ALL.to_vec(),
        }
    }

    pub fn new(stages: Vec<Stage>) -> Self {
        Pipeline { stages }
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    /// Run all stages in order, stopping at the first failure
    pub fn run(&self, file: &MidiFile, ctx: &TransformContext) -> Result<MidiFile, TransformError> {
        let mut current = file.clone();
        for stage in &self.stages {
            log::debug!("Applying {} to voice '{}'", stage.name(), ctx.voice.name);
            current = stage.apply(&current, ctx)?;
        }
        Ok(current)
    }
}

/// Indices of the tracks holding a voice
///
/// Tracks named with the voice's track prefix win; otherwise every
/// non-conductor track with events on the voice's channel.
pub fn voice_track_indices(file: &MidiFile, voice: &VoiceDescriptor) -> Vec<usize> {
    let first = if file.tracks.len() > 1 { 1 } else { 0 };
    let prefix = voice.track_prefix();

    let named: Vec<usize> = (first..file.tracks.len())
        .filter(|&i| {
            !prefix.is_empty()
                && file.tracks[i]
                    .name()
                    .is_some_and(|name| name.starts_with(prefix))
        })
        .collect();
    if !named.is_empty() {
        return named;
    }

    (first..file.tracks.len())
        .filter(|&i| file.tracks[i].uses_channel(voice.channel))
        .collect()
}

#[cfg(test)]
pub(crate) mod test_support {
    use crate::midi::{MetaEvent, MidiEvent, MidiFile, MidiFormat, MidiTrack, TempoTrack};
    use crate::settings::{TrackSettings, VolumeSpec};

    pub const TPQ: u16 = 480;

    pub fn default_settings() -> TrackSettings {
        TrackSettings {
            volume: VolumeSpec::Constant(100),
            pan: 0.0,
            balance: 0.0,
            humanize: None,
            instrument: "0:0".to_string(),
            effects: "copy".to_string(),
            reverb: 0.0,
            mix_level_db: 0.0,
            shift_seconds: 0.0,
            mute: false,
        }
    }

    /// Conductor at 120 bpm 4/4 plus one named track of quarter notes
    pub fn voice_file(name: &str, channel: u8, measures: u32) -> MidiFile {
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
            MidiEvent::meta(0, MetaEvent::EndOfTrack).unwrap(),
        ]);

        let quarter = TPQ as i64;
        let mut events = vec![MidiEvent::meta(0, MetaEvent::TrackName(name.as_bytes().to_vec())).unwrap()];
        for beat in 0..(measures as i64 * 4) {
            let tick = beat * quarter;
            events.push(MidiEvent::note_on(tick, channel, 60, 90).unwrap());
            events.push(MidiEvent::note_off(tick + quarter / 2, channel, 60, 0).unwrap());
        }
        let end = measures as i64 * 4 * quarter;
        events.push(MidiEvent::meta(end, MetaEvent::EndOfTrack).unwrap());

        MidiFile::new(
            MidiFormat::Parallel,
            TPQ,
            vec![conductor, MidiTrack::from_events(events)],
        )
    }

    pub fn tempo_of(file: &MidiFile) -> TempoTrack {
        file.tempo_track()
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use crate::midi::{decode, encode};
    use crate::settings::VolumeSpec;
    use crate::settings::{Breakpoint, HumanizeSettings};

    #[test]
    fn test_stage_names() {
        let names: Vec<&str> = Stage::ALL.iter().map(|s| s.name()).collect();
        assert_eq!(names, vec!["tempo_align", "humanize", "volume_shape", "pan", "mute"]);
    }

    #[test]
    fn test_voice_tracks_by_prefix() {
        let file = voice_file("bass", 1, 2);
        let voice = VoiceDescriptor::new("bass", 1);
        assert_eq!(voice_track_indices(&file, &voice), vec![1]);
    }

    #[test]
    fn test_voice_tracks_by_channel_fallback() {
        let file = voice_file("Staff 2", 4, 2);
        let voice = VoiceDescriptor::new("keys", 4);
        assert_eq!(voice_track_indices(&file, &voice), vec![1]);

        let other = VoiceDescriptor::new("organ", 5);
        assert!(voice_track_indices(&file, &other).is_empty());
    }

    #[test]
    fn test_standard_pipeline_runs_all_stages() {
        let file = voice_file("bass", 1, 4);
        let tempo = tempo_of(&file);
        let voice = VoiceDescriptor::new("bass", 1);
        let mut settings = default_settings();
        settings.pan = 0.5;
        let ctx = TransformContext {
            voice: &voice,
            settings: &settings,
            source_tempo: &tempo,
            tempo: &tempo,
        };

        let result = Pipeline::standard().run(&file, &ctx).unwrap();

        let track = &result.tracks[1];
        assert!(track.events().iter().any(|e| e.kind().is_controller(1, 7)));
        assert!(track.events().iter().any(|e| e.kind().is_controller(1, 10)));
        assert_eq!(track.events().last().map(|e| e.kind().is_end_of_track()), Some(true));
    }

    #[test]
    fn test_pipeline_error_names_stage_and_voice() {
        let file = voice_file("bass", 1, 4);
        let tempo = tempo_of(&file);
        let voice = VoiceDescriptor::new("bass", 1);
        let mut settings = default_settings();
        settings.volume = VolumeSpec::Curve {
            points: vec![Breakpoint { measure: 99, value: 80 }],
            interpolate: false,
        };
        let ctx = TransformContext {
            voice: &voice,
            settings: &settings,
            source_tempo: &tempo,
            tempo: &tempo,
        };

        let error = Pipeline::standard().run(&file, &ctx).unwrap_err();

        assert_eq!(error.stage, "volume_shape");
        assert_eq!(error.voice, "bass");
        assert_eq!(
            error.reason,
            TransformFailure::MeasureOutOfRange { measure: 99, max: 4 }
        );
    }

    #[test]
    fn test_standard_pipeline_output_decodes() {
        let mut file = voice_file("bass", 1, 2);
        let drums = voice_file("drums", 9, 4);
        file.tracks.push(drums.tracks[1].clone());
        let tempo = tempo_of(&file);

        let mut settings = default_settings();
        settings.pan = -0.25;
        settings.volume = VolumeSpec::Curve {
            points: vec![
                Breakpoint { measure: 1, value: 70 },
                Breakpoint { measure: 4, value: 90 },
            ],
            interpolate: true,
        };
        settings.humanize = Some(HumanizeSettings {
            timing_jitter: 20,
            velocity_jitter: 8,
            count_in_measures: 0,
            seed: 7,
        });

        for voice in [VoiceDescriptor::new("bass", 1), VoiceDescriptor::drum("drums", 9)] {
            let ctx = TransformContext {
                voice: &voice,
                settings: &settings,
                source_tempo: &tempo,
                tempo: &tempo,
            };
            let result = Pipeline::standard().run(&file, &ctx).unwrap();

            for track in &result.tracks {
                let last = track.events().last().unwrap();
                assert!(last.kind().is_end_of_track(), "voice {}", voice.name);
            }
            let bytes = encode(&result).unwrap();
            assert_eq!(decode(&bytes).unwrap(), result, "voice {}", voice.name);
        }
    }
}

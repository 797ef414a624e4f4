// Tempo Track - measure-based tempo and meter map
// Converts between ticks, (measure, offset) positions and seconds

use super::event::{EventKind, MetaEvent, MidiFile, MAX_TEMPO};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

/// 120 bpm
pub const DEFAULT_MICROS_PER_QUARTER: u32 = 500_000;

#[derive(Debug, Error, PartialEq)]
pub enum TempoTrackError {
    #[error("Measure numbers start at 1")]
    MeasureZero,

    #[error("Measure {measure} does not follow measure {previous}")]
    NotIncreasing { previous: u32, measure: u32 },

    #[error("Invalid tempo {bpm} bpm at measure {measure}")]
    InvalidBpm { measure: u32, bpm: f64 },

    #[error("Measure length of {quarters} quarters at measure {measure} cannot be expressed as a time signature")]
    InvalidMeasureLength { measure: u32, quarters: f64 },
}

/// Tempo and meter in effect from a measure onwards
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TempoEntry {
    pub micros_per_quarter: u32,
    pub numerator: u8,
    /// Note value of one beat (4 = quarter); always a power of two
    pub denominator: u8,
}

impl Default for TempoEntry {
    fn default() -> Self {
        TempoEntry {
            micros_per_quarter: DEFAULT_MICROS_PER_QUARTER,
            numerator: 4,
            denominator: 4,
        }
    }
}

impl TempoEntry {
    pub fn bpm(&self) -> f64 {
        60_000_000.0 / self.micros_per_quarter as f64
    }

    pub fn quarters_per_measure(&self) -> f64 {
        self.numerator as f64 * 4.0 / self.denominator as f64
    }

    /// Length of one measure in ticks (at least one tick)
    pub fn ticks_per_measure(&self, ticks_per_quarter: u16) -> u64 {
        let ticks = ticks_per_quarter as u64 * 4 * self.numerator as u64 / self.denominator.max(1) as u64;
        ticks.max(1)
    }
}

/// One row of a configured tempo table: measure, bpm and measure length
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TempoEntryConfig {
    pub measure: u32,
    pub bpm: f64,
    #[serde(default = "default_quarters_per_measure")]
    pub quarters_per_measure: f64,
}

fn default_quarters_per_measure() -> f64 {
    4.0
}

/// Contiguous run of measures sharing one tempo entry
#[derive(Debug, Clone, Copy)]
struct Segment {
    measure: u32,
    start_tick: u64,
    ticks_per_measure: u64,
    micros_per_quarter: u32,
}

/// Mapping from measure number to tempo and meter
///
/// Measure numbers are 1-based and strictly increasing; measure 1 always
/// has an entry. Positions between entries use the nearest preceding one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TempoTrack {
    ticks_per_quarter: u16,
    entries: BTreeMap<u32, TempoEntry>,
    measure_count: u32,
}

impl TempoTrack {
    /// Constant 120 bpm, 4/4
    pub fn new(ticks_per_quarter: u16) -> Self {
        let mut entries = BTreeMap::new();
        entries.insert(1, TempoEntry::default());
        TempoTrack {
            ticks_per_quarter,
            entries,
            measure_count: 1,
        }
    }

    /// Derive the tempo track from the tempo and time signature events of all tracks
    ///
    /// A change inside a measure is recorded for that measure.
    pub fn from_file(file: &MidiFile) -> Self {
        let mut changes: Vec<(u32, &MetaEvent)> = file
            .tracks
            .iter()
            .flat_map(|t| t.events())
            .filter_map(|e| match e.kind() {
                EventKind::Meta(meta) if meta.is_timing() => Some((e.tick(), meta)),
                _ => None,
            })
            .collect();
        changes.sort_by_key(|(tick, _)| *tick);

        let mut track = TempoTrack::new(file.ticks_per_quarter);
        for (tick, meta) in changes {
            let (measure, _) = track.locate(tick);
            let mut entry = track.entry_at(measure);
            match *meta {
                MetaEvent::Tempo(micros) => entry.micros_per_quarter = micros,
                MetaEvent::TimeSignature {
                    numerator,
                    denominator_pow,
                    ..
                } => {
                    entry.numerator = numerator;
                    entry.denominator = 1u8 << denominator_pow.min(7);
                }
                _ => {}
            }
            track.entries.insert(measure, entry);
        }

        let last_tick = file.end_tick().saturating_sub(1);
        track.measure_count = track.locate(last_tick).0;
        track
    }

    /// Build a tempo track from a configured table
    ///
    /// A missing first measure falls back to 120 bpm in 4/4.
    pub fn from_config(
        ticks_per_quarter: u16,
        table: &[TempoEntryConfig],
        measure_count: u32,
    ) -> Result<Self, TempoTrackError> {
        let mut track = TempoTrack::new(ticks_per_quarter);
        let mut previous = 0;
        for row in table {
            if row.measure == 0 {
                return Err(TempoTrackError::MeasureZero);
            }
            if row.measure <= previous {
                return Err(TempoTrackError::NotIncreasing {
                    previous,
                    measure: row.measure,
                });
            }
            previous = row.measure;

            if !row.bpm.is_finite() || row.bpm <= 0.0 {
                return Err(TempoTrackError::InvalidBpm {
                    measure: row.measure,
                    bpm: row.bpm,
                });
            }
            let micros = (60_000_000.0 / row.bpm).round().clamp(1.0, MAX_TEMPO as f64) as u32;
            let (numerator, denominator) = meter_for(row.quarters_per_measure).ok_or(
                TempoTrackError::InvalidMeasureLength {
                    measure: row.measure,
                    quarters: row.quarters_per_measure,
                },
            )?;

            track.entries.insert(
                row.measure,
                TempoEntry {
                    micros_per_quarter: micros,
                    numerator,
                    denominator,
                },
            );
        }
        track.measure_count = measure_count.max(1);
        Ok(track)
    }

    pub fn ticks_per_quarter(&self) -> u16 {
        self.ticks_per_quarter
    }

    /// Number of measures covered by the source file
    pub fn measure_count(&self) -> u32 {
        self.measure_count
    }

    pub fn with_measure_count(mut self, measure_count: u32) -> Self {
        self.measure_count = measure_count.max(1);
        self
    }

    pub fn entries(&self) -> impl Iterator<Item = (u32, &TempoEntry)> {
        self.entries.iter().map(|(m, e)| (*m, e))
    }

    /// Whether both tracks place measures and tempo changes identically
    pub fn same_timing(&self, other: &TempoTrack) -> bool {
        self.ticks_per_quarter == other.ticks_per_quarter && self.entries == other.entries
    }

    /// Entry in effect at `measure` (nearest preceding definition)
    pub fn entry_at(&self, measure: u32) -> TempoEntry {
        self.entries
            .range(..=measure.max(1))
            .next_back()
            .map(|(_, e)| *e)
            .unwrap_or_default()
    }

    pub fn ticks_per_measure(&self, measure: u32) -> u64 {
        self.entry_at(measure).ticks_per_measure(self.ticks_per_quarter)
    }

    fn segments(&self) -> Vec<Segment> {
        let mut segments: Vec<Segment> = Vec::with_capacity(self.entries.len());
        for (&measure, entry) in &self.entries {
            let start_tick = match segments.last() {
                Some(prev) => prev.start_tick + (measure - prev.measure) as u64 * prev.ticks_per_measure,
                None => 0,
            };
            segments.push(Segment {
                measure,
                start_tick,
                ticks_per_measure: entry.ticks_per_measure(self.ticks_per_quarter),
                micros_per_quarter: entry.micros_per_quarter,
            });
        }
        segments
    }

    /// Absolute tick where `measure` begins (measure 0 is treated as 1)
    pub fn measure_start_tick(&self, measure: u32) -> u64 {
        let measure = measure.max(1);
        self.segments()
            .iter()
            .rev()
            .find(|s| s.measure <= measure)
            .map(|s| s.start_tick + (measure - s.measure) as u64 * s.ticks_per_measure)
            .unwrap_or(0)
    }

    /// Measure number and tick offset inside that measure
    pub fn locate(&self, tick: u32) -> (u32, u32) {
        let tick = tick as u64;
        let segments = self.segments();
        let Some(segment) = segments.iter().rev().find(|s| s.start_tick <= tick) else {
            return (1, tick as u32);
        };
        let elapsed = tick - segment.start_tick;
        let measure = segment.measure as u64 + elapsed / segment.ticks_per_measure;
        let offset = elapsed % segment.ticks_per_measure;
        (
            u32::try_from(measure).unwrap_or(u32::MAX),
            offset as u32,
        )
    }

    /// Wall-clock time of `tick` in seconds
    pub fn seconds_at(&self, tick: u32) -> f64 {
        let tick = tick as u64;
        let segments = self.segments();
        let mut seconds = 0.0;
        for (index, segment) in segments.iter().enumerate() {
            if tick <= segment.start_tick {
                break;
            }
            let end = segments
                .get(index + 1)
                .map(|next| next.start_tick.min(tick))
                .unwrap_or(tick);
            let ticks = (end - segment.start_tick) as f64;
            seconds += ticks * segment.micros_per_quarter as f64
                / (self.ticks_per_quarter.max(1) as f64 * 1_000_000.0);
        }
        seconds
    }
}

/// Express a measure length in quarters as numerator/denominator
fn meter_for(quarters: f64) -> Option<(u8, u8)> {
    if !quarters.is_finite() || quarters <= 0.0 {
        return None;
    }
    [4u8, 8, 16, 32, 64].into_iter().find_map(|denominator| {
        let numerator = quarters * denominator as f64 / 4.0;
        let rounded = numerator.round();
        if (numerator - rounded).abs() < 1e-9 && (1.0..=255.0).contains(&rounded) {
            Some((rounded as u8, denominator))
        } else {
            None
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::midi::event::{MidiEvent, MidiFormat, MidiTrack};

    fn conductor(events: Vec<MidiEvent>) -> MidiFile {
        MidiFile::new(MidiFormat::Parallel, 480, vec![MidiTrack::from_events(events)])
    }

    fn time_signature(tick: i64, numerator: u8, denominator_pow: u8) -> MidiEvent {
        MidiEvent::meta(
            tick,
            MetaEvent::TimeSignature {
                numerator,
                denominator_pow,
                clocks_per_click: 24,
                thirty_seconds_per_quarter: 8,
            },
        )
        .unwrap()
    }

    #[test]
    fn test_default_track() {
        let track = TempoTrack::new(480);
        assert_eq!(track.entry_at(1), TempoEntry::default());
        assert_eq!(track.ticks_per_measure(1), 1920);
        assert_eq!(track.locate(1920), (2, 0));
    }

    #[test]
    fn test_from_file_meter_change() {
        // Two bars of 4/4, then 3/4
        let file = conductor(vec![
            time_signature(0, 4, 2),
            MidiEvent::meta(0, MetaEvent::Tempo(500_000)).unwrap(),
            time_signature(3840, 3, 2),
            MidiEvent::meta(3840 + 1440 * 2, MetaEvent::EndOfTrack).unwrap(),
        ]);
        let track = file.tempo_track();

        assert_eq!(track.measure_start_tick(3), 3840);
        assert_eq!(track.measure_start_tick(4), 3840 + 1440);
        assert_eq!(track.locate(3840 + 1440 + 10), (4, 10));
        assert_eq!(track.measure_count(), 4);
        assert_eq!(track.entry_at(3).numerator, 3);
    }

    #[test]
    fn test_lookup_uses_nearest_preceding_entry() {
        let file = conductor(vec![
            MidiEvent::meta(1920, MetaEvent::Tempo(600_000)).unwrap(),
            MidiEvent::meta(1920 * 5, MetaEvent::EndOfTrack).unwrap(),
        ]);
        let track = file.tempo_track();

        assert_eq!(track.entry_at(1).micros_per_quarter, 500_000);
        assert_eq!(track.entry_at(2).micros_per_quarter, 600_000);
        assert_eq!(track.entry_at(50).micros_per_quarter, 600_000);
    }

    #[test]
    fn test_seconds_at() {
        let file = conductor(vec![
            MidiEvent::meta(0, MetaEvent::Tempo(500_000)).unwrap(),
            MidiEvent::meta(1920, MetaEvent::Tempo(1_000_000)).unwrap(),
        ]);
        let track = file.tempo_track();

        assert!((track.seconds_at(1920) - 2.0).abs() < 1e-9);
        assert!((track.seconds_at(1920 + 480) - 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_from_config() {
        let table = vec![
            TempoEntryConfig { measure: 1, bpm: 120.0, quarters_per_measure: 4.0 },
            TempoEntryConfig { measure: 5, bpm: 90.0, quarters_per_measure: 1.5 },
        ];
        let track = TempoTrack::from_config(480, &table, 8).unwrap();

        let entry = track.entry_at(6);
        assert_eq!((entry.numerator, entry.denominator), (3, 8));
        assert_eq!(entry.micros_per_quarter, 666_667);
        assert_eq!(track.measure_start_tick(6), 4 * 1920 + 720);
        assert_eq!(track.measure_count(), 8);
    }

    #[test]
    fn test_from_config_rejects_unordered_measures() {
        let table = vec![
            TempoEntryConfig { measure: 3, bpm: 120.0, quarters_per_measure: 4.0 },
            TempoEntryConfig { measure: 3, bpm: 100.0, quarters_per_measure: 4.0 },
        ];
        assert_eq!(
            TempoTrack::from_config(480, &table, 4),
            Err(TempoTrackError::NotIncreasing { previous: 3, measure: 3 })
        );
    }

    #[test]
    fn test_same_timing_ignores_measure_count() {
        let a = TempoTrack::new(480).with_measure_count(3);
        let b = TempoTrack::new(480).with_measure_count(9);
        assert!(a.same_timing(&b));
        assert!(!a.same_timing(&TempoTrack::new(960)));
    }
}

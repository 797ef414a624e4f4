// Settings Types - voices, setting values and resolved track settings
// Raw layers are loose key/value maps; TrackSettings is the typed result

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Staff layout suffixes that do not change which voice a staff belongs to
const LAYOUT_SUFFIXES: [&str; 3] = ["Top", "Middle", "Bottom"];

/// One logical musical part
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoiceDescriptor {
    pub name: String,

    /// MIDI channel (0-15)
    pub channel: u8,

    #[serde(default)]
    pub is_drum: bool,

    /// Prefix of the track names holding this voice; defaults to the canonical name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub track_prefix: Option<String>,
}

impl VoiceDescriptor {
    pub fn new(name: impl Into<String>, channel: u8) -> Self {
        VoiceDescriptor {
            name: name.into(),
            channel,
            is_drum: false,
            track_prefix: None,
        }
    }

    pub fn drum(name: impl Into<String>, channel: u8) -> Self {
        VoiceDescriptor {
            is_drum: true,
            ..VoiceDescriptor::new(name, channel)
        }
    }

    pub fn with_track_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.track_prefix = Some(prefix.into());
        self
    }

    /// Voice name without a staff layout suffix ("drumsTop" -> "drums")
    pub fn canonical_name(&self) -> &str {
        canonical_voice_name(&self.name)
    }

    pub fn track_prefix(&self) -> &str {
        self.track_prefix
            .as_deref()
            .unwrap_or_else(|| self.canonical_name())
    }
}

pub fn canonical_voice_name(name: &str) -> &str {
    LAYOUT_SUFFIXES
        .iter()
        .find_map(|suffix| name.strip_suffix(suffix).filter(|s| !s.is_empty()))
        .unwrap_or(name)
}

/// Raw value of one setting in a layer
///
/// Deserialized without tags: `true`, `0.5`, `"0.3L"` or `[[1, 80], [9, 100]]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SettingValue {
    Flag(bool),
    Number(f64),
    Text(String),
    /// (measure, value) pairs
    Curve(Vec<(u32, f64)>),
}

impl From<bool> for SettingValue {
    fn from(value: bool) -> Self {
        SettingValue::Flag(value)
    }
}

impl From<f64> for SettingValue {
    fn from(value: f64) -> Self {
        SettingValue::Number(value)
    }
}

impl From<&str> for SettingValue {
    fn from(value: &str) -> Self {
        SettingValue::Text(value.to_string())
    }
}

impl From<Vec<(u32, f64)>> for SettingValue {
    fn from(value: Vec<(u32, f64)>) -> Self {
        SettingValue::Curve(value)
    }
}

/// One layer of settings; later layers override earlier ones per key
pub type SettingsLayer = BTreeMap<String, SettingValue>;

/// Volume at the start of a measure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Breakpoint {
    pub measure: u32,
    /// MIDI volume (0-127)
    pub value: u8,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VolumeSpec {
    Constant(u8),
    Curve {
        points: Vec<Breakpoint>,
        /// Ramp between breakpoints instead of stepping
        interpolate: bool,
    },
}

/// Random variation applied to drum hits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HumanizeSettings {
    /// Maximum timing offset in ticks (either direction)
    pub timing_jitter: u32,
    /// Maximum velocity change (either direction)
    pub velocity_jitter: u8,
    /// Leading measures left untouched
    pub count_in_measures: u32,
    pub seed: u64,
}

/// Fully resolved settings for one voice in one target
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackSettings {
    pub volume: VolumeSpec,

    /// Stereo position inside the rendered stem: -1.0 (left) to 1.0 (right)
    pub pan: f64,

    /// Stereo balance of the stem inside the mix: -1.0 to 1.0
    pub balance: f64,

    pub humanize: Option<HumanizeSettings>,

    /// "bank:program" or a free-form name understood by the renderer
    pub instrument: String,

    /// Effect chain handed to the renderer ("copy" means none)
    pub effects: String,

    /// Reverb amount (0.0-1.0)
    pub reverb: f64,

    /// Mixer gain in decibel
    pub mix_level_db: f64,

    /// Start offset of the stem inside the mix in seconds
    pub shift_seconds: f64,

    pub mute: bool,
}

impl TrackSettings {
    /// Pan position as a CC10 value (64 is center)
    pub fn midi_pan(&self) -> u8 {
        let pan = self.pan.clamp(-1.0, 1.0);
        if pan == 0.0 {
            64
        } else if pan < 0.0 {
            63 - (pan.abs() * 63.0).trunc() as u8
        } else {
            (65 + (pan * 63.0).trunc() as u32).min(127) as u8
        }
    }

    /// Reverb amount as a CC91 value
    pub fn midi_reverb(&self) -> u8 {
        (self.reverb.clamp(0.0, 1.0) * 127.0).round() as u8
    }

    /// Bank and program when the instrument is given as "bank:program" or "program"
    pub fn midi_program(&self) -> Option<(u8, u8)> {
        let text = self.instrument.trim();
        let (bank, program) = match text.split_once(':') {
            Some((bank, program)) => (bank.trim().parse().ok()?, program.trim().parse().ok()?),
            None => (0u8, text.parse().ok()?),
        };
        (bank <= 127 && program <= 127).then_some((bank, program))
    }
}

/// Parse a pan value: a number in -1..=1 or "C", "0.5L", "0.3R"
pub fn parse_pan(text: &str) -> Option<f64> {
    let text = text.trim();
    if text.eq_ignore_ascii_case("C") {
        return Some(0.0);
    }
    let value = if let Some(left) = text.strip_suffix(['L', 'l']) {
        -left.trim().parse::<f64>().ok()?
    } else if let Some(right) = text.strip_suffix(['R', 'r']) {
        right.trim().parse::<f64>().ok()?
    } else {
        text.parse::<f64>().ok()?
    };
    (value.is_finite() && (-1.0..=1.0).contains(&value)).then_some(value)
}

// Settings Resolver - field-level merge of configuration layers
// Built-in defaults, then each layer in order, later keys win

use super::types::{
    parse_pan, Breakpoint, HumanizeSettings, SettingValue, SettingsLayer, TrackSettings,
    VoiceDescriptor, VolumeSpec,
};
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ResolveError {
    #[error("Voice '{voice}' has no value for required setting '{field}'")]
    MissingSetting { voice: String, field: &'static str },

    #[error("Voice '{voice}': setting '{key}' must be {expected}")]
    InvalidValue {
        voice: String,
        key: String,
        expected: &'static str,
    },

    #[error("Voice '{voice}': unknown setting '{key}'")]
    UnknownKey { voice: String, key: String },
}

pub type ResolveResult<T> = Result<T, ResolveError>;

/// Every key a settings layer may carry
pub const KNOWN_KEYS: [&str; 15] = [
    "volume",
    "volume_interpolation",
    "pan",
    "balance",
    "instrument",
    "effects",
    "reverb",
    "level",
    "shift",
    "mute",
    "humanize",
    "timing_jitter",
    "velocity_jitter",
    "count_in",
    "seed",
];

/// Resolves per-voice settings from ordered layers
#[derive(Debug, Clone)]
pub struct SettingsResolver {
    builtin: SettingsLayer,
}

impl Default for SettingsResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl SettingsResolver {
    /// Resolver with built-in defaults for every setting
    pub fn new() -> Self {
        let builtin: SettingsLayer = [
            ("volume", SettingValue::Number(100.0)),
            ("volume_interpolation", SettingValue::Flag(false)),
            ("pan", SettingValue::Number(0.0)),
            ("balance", SettingValue::Number(0.0)),
            ("instrument", SettingValue::from("0:0")),
            ("effects", SettingValue::from("copy")),
            ("reverb", SettingValue::Number(0.0)),
            ("level", SettingValue::Number(0.0)),
            ("shift", SettingValue::Number(0.0)),
            ("mute", SettingValue::Flag(false)),
            ("humanize", SettingValue::Flag(false)),
            ("timing_jitter", SettingValue::Number(0.0)),
            ("velocity_jitter", SettingValue::Number(0.0)),
            ("count_in", SettingValue::Number(0.0)),
            ("seed", SettingValue::Number(0.0)),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect();
        SettingsResolver { builtin }
    }

    /// Resolver without built-in defaults; volume and pan must come from a layer
    pub fn without_defaults() -> Self {
        SettingsResolver {
            builtin: SettingsLayer::new(),
        }
    }

    /// Merge `layers` key by key and build the typed settings
    pub fn resolve(
        &self,
        voice: &VoiceDescriptor,
        target: &str,
        layers: &[&SettingsLayer],
    ) -> ResolveResult<TrackSettings> {
        let mut merged: BTreeMap<&str, &SettingValue> = BTreeMap::new();
        for layer in std::iter::once(&self.builtin).chain(layers.iter().copied()) {
            for (key, value) in layer {
                if !KNOWN_KEYS.contains(&key.as_str()) {
                    return Err(ResolveError::UnknownKey {
                        voice: voice.name.clone(),
                        key: key.clone(),
                    });
                }
                merged.insert(key.as_str(), value);
            }
        }

        let fields = Fields {
            voice: &voice.name,
            merged,
        };

        let volume = match fields.get("volume") {
            None => {
                return Err(ResolveError::MissingSetting {
                    voice: voice.name.clone(),
                    field: "volume",
                })
            }
            Some(SettingValue::Number(n)) => VolumeSpec::Constant(fields.midi_value("volume", *n)?),
            Some(SettingValue::Curve(points)) => VolumeSpec::Curve {
                points: points
                    .iter()
                    .map(|&(measure, value)| {
                        Ok(Breakpoint {
                            measure,
                            value: fields.midi_value("volume", value)?,
                        })
                    })
                    .collect::<ResolveResult<Vec<_>>>()?,
                interpolate: fields.flag("volume_interpolation", false)?,
            },
            Some(_) => return Err(fields.invalid("volume", "a number or a list of [measure, volume] pairs")),
        };

        let pan = match fields.get("pan") {
            None => {
                return Err(ResolveError::MissingSetting {
                    voice: voice.name.clone(),
                    field: "pan",
                })
            }
            Some(SettingValue::Number(n)) if (-1.0..=1.0).contains(n) => *n,
            Some(SettingValue::Text(text)) => {
                parse_pan(text).ok_or_else(|| fields.invalid("pan", "a pan position like C, 0.5L or 0.3R"))?
            }
            Some(_) => return Err(fields.invalid("pan", "a number between -1 and 1")),
        };

        let humanize = if fields.flag("humanize", false)? {
            Some(HumanizeSettings {
                timing_jitter: fields.count("timing_jitter")?,
                velocity_jitter: fields.midi_count("velocity_jitter")?,
                count_in_measures: fields.count("count_in")?,
                seed: fields.count("seed")?,
            })
        } else {
            None
        };

        let balance = fields.number("balance", 0.0)?;
        if !(-1.0..=1.0).contains(&balance) {
            return Err(fields.invalid("balance", "a number between -1 and 1"));
        }

        let reverb = fields.number("reverb", 0.0)?;
        if !(0.0..=1.0).contains(&reverb) {
            return Err(fields.invalid("reverb", "a number between 0 and 1"));
        }

        let settings = TrackSettings {
            volume,
            pan,
            balance,
            humanize,
            instrument: fields.text("instrument", "0:0")?,
            effects: fields.text("effects", "copy")?,
            reverb,
            mix_level_db: fields.number("level", 0.0)?,
            shift_seconds: fields.number("shift", 0.0)?,
            mute: fields.flag("mute", false)?,
        };

        log::debug!(
            "Resolved settings for voice '{}' in target '{}': {:?}",
            voice.name,
            target,
            settings
        );
        Ok(settings)
    }
}

/// Merged view of all layers for one voice
struct Fields<'a> {
    voice: &'a str,
    merged: BTreeMap<&'a str, &'a SettingValue>,
}

impl<'a> Fields<'a> {
    fn get(&self, key: &str) -> Option<&'a SettingValue> {
        self.merged.get(key).copied()
    }

    fn invalid(&self, key: &str, expected: &'static str) -> ResolveError {
        ResolveError::InvalidValue {
            voice: self.voice.to_string(),
            key: key.to_string(),
            expected,
        }
    }

    fn flag(&self, key: &str, fallback: bool) -> ResolveResult<bool> {
        match self.get(key) {
            None => Ok(fallback),
            Some(SettingValue::Flag(b)) => Ok(*b),
            Some(SettingValue::Text(t)) if t.eq_ignore_ascii_case("true") => Ok(true),
            Some(SettingValue::Text(t)) if t.eq_ignore_ascii_case("false") => Ok(false),
            Some(_) => Err(self.invalid(key, "true or false")),
        }
    }

    fn number(&self, key: &str, fallback: f64) -> ResolveResult<f64> {
        match self.get(key) {
            None => Ok(fallback),
            Some(SettingValue::Number(n)) if n.is_finite() => Ok(*n),
            Some(SettingValue::Text(t)) => t
                .trim()
                .parse::<f64>()
                .ok()
                .filter(|n| n.is_finite())
                .ok_or_else(|| self.invalid(key, "a number")),
            Some(_) => Err(self.invalid(key, "a number")),
        }
    }

    /// Non-negative whole number that fits `T`
    fn count<T: TryFrom<u64>>(&self, key: &str) -> ResolveResult<T> {
        let value = self.number(key, 0.0)?;
        if value < 0.0 || value.fract() != 0.0 || value >= u64::MAX as f64 {
            return Err(self.invalid(key, "a non-negative whole number"));
        }
        T::try_from(value as u64).map_err(|_| self.invalid(key, "a smaller whole number"))
    }

    fn midi_count(&self, key: &str) -> ResolveResult<u8> {
        let value: u8 = self.count(key)?;
        if value > 127 {
            return Err(self.invalid(key, "a value between 0 and 127"));
        }
        Ok(value)
    }

    fn text(&self, key: &str, fallback: &str) -> ResolveResult<String> {
        match self.get(key) {
            None => Ok(fallback.to_string()),
            Some(SettingValue::Text(t)) => Ok(t.clone()),
            Some(SettingValue::Number(n)) if n.fract() == 0.0 => Ok(format!("{}", *n as i64)),
            Some(_) => Err(self.invalid(key, "a string")),
        }
    }

    fn midi_value(&self, key: &str, value: f64) -> ResolveResult<u8> {
        if !(0.0..=127.0).contains(&value) {
            return Err(self.invalid(key, "a value between 0 and 127"));
        }
        Ok(value.round() as u8)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layer(entries: &[(&str, SettingValue)]) -> SettingsLayer {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_field_level_merge() {
        let resolver = SettingsResolver::new();
        let voice = VoiceDescriptor::new("bass", 1);
        let first = layer(&[("volume", SettingValue::Number(80.0)), ("pan", SettingValue::Number(0.0))]);
        let second = layer(&[("volume", SettingValue::Number(100.0))]);

        let settings = resolver.resolve(&voice, "mix", &[&first, &second]).unwrap();

        assert_eq!(settings.volume, VolumeSpec::Constant(100));
        assert_eq!(settings.pan, 0.0);
    }

    #[test]
    fn test_builtin_defaults() {
        let resolver = SettingsResolver::new();
        let voice = VoiceDescriptor::new("guitar", 3);

        let settings = resolver.resolve(&voice, "mix", &[]).unwrap();

        assert_eq!(settings.volume, VolumeSpec::Constant(100));
        assert_eq!(settings.pan, 0.0);
        assert_eq!(settings.instrument, "0:0");
        assert_eq!(settings.effects, "copy");
        assert!(settings.humanize.is_none());
        assert!(!settings.mute);
    }

    #[test]
    fn test_missing_setting_without_defaults() {
        let resolver = SettingsResolver::without_defaults();
        let voice = VoiceDescriptor::new("guitar", 3);
        let only_pan = layer(&[("pan", SettingValue::Number(0.0))]);

        let result = resolver.resolve(&voice, "mix", &[&only_pan]);
        assert_eq!(
            result,
            Err(ResolveError::MissingSetting {
                voice: "guitar".to_string(),
                field: "volume"
            })
        );

        let only_volume = layer(&[("volume", SettingValue::Number(90.0))]);
        let result = resolver.resolve(&voice, "mix", &[&only_volume]);
        assert!(matches!(
            result,
            Err(ResolveError::MissingSetting { field: "pan", .. })
        ));
    }

    #[test]
    fn test_volume_curve_and_pan_notation() {
        let resolver = SettingsResolver::new();
        let voice = VoiceDescriptor::new("vocals", 0);
        let overrides = layer(&[
            ("volume", SettingValue::Curve(vec![(1, 60.0), (9, 100.0)])),
            ("volume_interpolation", true.into()),
            ("pan", "0.5L".into()),
        ]);

        let settings = resolver.resolve(&voice, "mix", &[&overrides]).unwrap();

        assert_eq!(
            settings.volume,
            VolumeSpec::Curve {
                points: vec![
                    Breakpoint { measure: 1, value: 60 },
                    Breakpoint { measure: 9, value: 100 },
                ],
                interpolate: true,
            }
        );
        assert_eq!(settings.pan, -0.5);
    }

    #[test]
    fn test_humanize_settings() {
        let resolver = SettingsResolver::new();
        let voice = VoiceDescriptor::drum("drums", 9);
        let drums = layer(&[
            ("humanize", true.into()),
            ("timing_jitter", SettingValue::Number(10.0)),
            ("velocity_jitter", SettingValue::Number(8.0)),
            ("count_in", SettingValue::Number(2.0)),
            ("seed", SettingValue::Number(42.0)),
        ]);

        let settings = resolver.resolve(&voice, "mix", &[&drums]).unwrap();

        assert_eq!(
            settings.humanize,
            Some(HumanizeSettings {
                timing_jitter: 10,
                velocity_jitter: 8,
                count_in_measures: 2,
                seed: 42,
            })
        );
    }

    #[test]
    fn test_unknown_key_rejected() {
        let resolver = SettingsResolver::new();
        let voice = VoiceDescriptor::new("bass", 1);
        let typo = layer(&[("volumne", SettingValue::Number(90.0))]);

        let result = resolver.resolve(&voice, "mix", &[&typo]);
        assert!(matches!(result, Err(ResolveError::UnknownKey { key, .. }) if key == "volumne"));
    }

    #[test]
    fn test_invalid_values_rejected() {
        let resolver = SettingsResolver::new();
        let voice = VoiceDescriptor::new("bass", 1);

        let loud = layer(&[("volume", SettingValue::Number(200.0))]);
        assert!(matches!(
            resolver.resolve(&voice, "mix", &[&loud]),
            Err(ResolveError::InvalidValue { .. })
        ));

        let far_left = layer(&[("pan", SettingValue::Number(-2.0))]);
        assert!(matches!(
            resolver.resolve(&voice, "mix", &[&far_left]),
            Err(ResolveError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_out_of_range_counts_rejected() {
        let resolver = SettingsResolver::new();
        let voice = VoiceDescriptor::drum("drums", 9);
        let humanized = |key: &str, value: f64| {
            layer(&[("humanize", true.into()), (key, SettingValue::Number(value))])
        };

        for (key, value) in [
            ("velocity_jitter", 256.0),
            ("velocity_jitter", 128.0),
            ("count_in", 4_294_967_296.0),
            ("timing_jitter", -1.0),
            ("seed", 1.5),
        ] {
            let result = resolver.resolve(&voice, "mix", &[&humanized(key, value)]);
            assert!(
                matches!(result, Err(ResolveError::InvalidValue { key: ref k, .. }) if k == key),
                "{} = {}",
                key,
                value
            );
        }

        let result = resolver.resolve(&voice, "mix", &[&humanized("velocity_jitter", 127.0)]);
        assert_eq!(result.unwrap().humanize.map(|h| h.velocity_jitter), Some(127));
    }

    #[test]
    fn test_resolve_is_deterministic() {
        let resolver = SettingsResolver::new();
        let voice = VoiceDescriptor::new("strings", 4);
        let overrides = layer(&[("reverb", SettingValue::Number(0.3)), ("level", SettingValue::Number(-3.0))]);

        let first = resolver.resolve(&voice, "mix", &[&overrides]).unwrap();
        let second = resolver.resolve(&voice, "mix", &[&overrides]).unwrap();
        assert_eq!(first, second);
    }
}

// Settings - per-voice, per-target track settings
// Layered configuration resolved into typed TrackSettings

pub mod types;
pub mod layers;
pub mod resolver;

pub use types::{
    canonical_voice_name, parse_pan, Breakpoint, HumanizeSettings, SettingValue, SettingsLayer,
    TrackSettings, VoiceDescriptor, VolumeSpec,
};
pub use layers::{SettingsConfig, TargetConfig};
pub use resolver::{ResolveError, SettingsResolver};

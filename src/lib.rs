// LilyPond-to-Audio - voice stems and mixdowns from lilypond-generated MIDI
// Module declarations

pub mod config;
pub mod midi;
pub mod pipeline;
pub mod render;
pub mod settings;
pub mod transform;

pub use config::{load_config, save_config, validate_config, ConfigError, ProjectConfig};
pub use pipeline::{Orchestrator, TargetReport, TargetState};

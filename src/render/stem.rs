// Stem Rendering - renderer collaborator contract
// One voice's transformed MIDI file in, one audio stem out

use crate::settings::TrackSettings;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("Renderer command is empty")]
    EmptyCommand,

    #[error("Failed to start renderer '{program}' for voice '{voice}': {source}")]
    Spawn {
        voice: String,
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Renderer for voice '{voice}' exited with {status}: {stderr}")]
    ExitStatus {
        voice: String,
        status: String,
        stderr: String,
    },

    #[error("Renderer for voice '{voice}' did not produce {path}")]
    MissingOutput { voice: String, path: PathBuf },

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Everything a renderer needs for one voice
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenderJob {
    pub voice: String,
    pub midi_path: PathBuf,
    pub stem_path: PathBuf,
    pub instrument: String,
    pub effects: String,
    /// 0.0-1.0
    pub reverb: f64,
}

/// Turns a voice MIDI file into an audio stem
pub trait StemRenderer: Send + Sync {
    fn render(&self, job: &RenderJob) -> Result<(), RenderError>;
}

/// Rendered stem plus the settings that produced it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioTrack {
    pub voice: String,
    pub stem_path: PathBuf,
    pub settings: TrackSettings,
    /// Stem was reused from an earlier run
    pub cached: bool,
}

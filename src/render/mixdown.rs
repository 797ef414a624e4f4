// Mixdown - mixer collaborator contract
// All stems of one target in, one audio file out

use super::stem::AudioTrack;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MixError {
    #[error("Target '{0}' has no stems to mix")]
    NoInputs(String),

    #[error("Mixer command is empty")]
    EmptyCommand,

    #[error("Failed to start mixer '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Mixer exited with {status}: {stderr}")]
    ExitStatus { status: String, stderr: String },

    #[error("Mixer did not produce {0}")]
    MissingOutput(PathBuf),

    #[error("Stem {path} has {found} Hz, expected {expected} Hz")]
    SampleRateMismatch {
        path: PathBuf,
        expected: u32,
        found: u32,
    },

    #[error("Unsupported stem format in {path}: {format}")]
    UnsupportedFormat { path: PathBuf, format: String },

    #[error("Failed to read or write WAV: {0}")]
    Wav(#[from] hound::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// One stem with its mixing parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MixInput {
    pub voice: String,
    pub stem_path: PathBuf,
    /// Gain in decibel
    pub volume_db: f64,
    /// -1.0 (left) to 1.0 (right)
    pub balance: f64,
    /// Start offset inside the mix in seconds
    pub shift_seconds: f64,
}

impl From<&AudioTrack> for MixInput {
    fn from(track: &AudioTrack) -> Self {
        MixInput {
            voice: track.voice.clone(),
            stem_path: track.stem_path.clone(),
            volume_db: track.settings.mix_level_db,
            balance: track.settings.balance,
            shift_seconds: track.settings.shift_seconds,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MixJob {
    pub target: String,
    pub inputs: Vec<MixInput>,
    pub output_path: PathBuf,
}

/// Combines the stems of one target
pub trait StemMixer: Send + Sync {
    fn mix(&self, job: &MixJob) -> Result<(), MixError>;
}

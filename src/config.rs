// Project Configuration - JSON description of one song's audio render
// Relative paths are taken relative to the configuration file

use crate::midi::{MidiFile, TempoEntryConfig};
use crate::pipeline::{Orchestrator, PipelineResult, TraceWriter};
use crate::render::{CommandMixer, CommandRenderer, StemMixer, StemRenderer, WavMixer};
use crate::settings::{SettingsConfig, TargetConfig, VoiceDescriptor};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to access {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid configuration JSON: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Voice '{0}' is defined more than once")]
    DuplicateVoice(String),

    #[error("Voice '{voice}' uses channel {channel}; channels run from 0 to 15")]
    InvalidChannel { voice: String, channel: u8 },

    #[error("Target '{0}' is defined more than once")]
    DuplicateTarget(String),

    #[error("Target '{target}' refers to unknown voice '{voice}'")]
    UnknownVoice { target: String, voice: String },

    #[error("Override file given for unknown voice '{0}'")]
    UnknownOverride(String),

    #[error("{0} command is empty")]
    EmptyCommand(&'static str),

    #[error("Worker count must be at least 1")]
    NoWorkers,
}

pub type ConfigResult<T> = Result<T, ConfigError>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RendererConfig {
    /// Command template, e.g. `fluidsynth -ni -F ${outfile} font.sf2 ${infile}`
    pub command: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MixerConfig {
    /// External mixer; the bracketed part of the template repeats per stem
    Command { command: String },
    /// Built-in WAV mixer
    Internal {
        #[serde(default)]
        amplification_db: f64,
    },
}

impl Default for MixerConfig {
    fn default() -> Self {
        MixerConfig::Internal {
            amplification_db: 0.0,
        }
    }
}

fn default_stem_dir() -> PathBuf {
    PathBuf::from("stems")
}

fn default_output_dir() -> PathBuf {
    PathBuf::from(".")
}

/// Main configuration structure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectConfig {
    /// Source MIDI file with all voices
    pub midi_file: PathBuf,

    #[serde(default = "default_stem_dir")]
    pub stem_dir: PathBuf,

    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,

    /// JSONL progress trace
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_file: Option<PathBuf>,

    /// Concurrent voice renders; defaults to the number of cores
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workers: Option<usize>,

    pub voices: Vec<VoiceDescriptor>,

    #[serde(default)]
    pub settings: SettingsConfig,

    pub targets: Vec<TargetConfig>,

    /// Tempo table every voice is re-timed to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tempo: Option<Vec<TempoEntryConfig>>,

    pub renderer: RendererConfig,

    #[serde(default)]
    pub mixer: MixerConfig,

    /// Prepared stems used instead of rendering, by voice name
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub override_files: BTreeMap<String, PathBuf>,
}

impl ProjectConfig {
    /// Make every relative path relative to `base`
    pub fn resolve_paths(mut self, base: &Path) -> Self {
        let resolve = |path: PathBuf| {
            if path.is_relative() {
                base.join(path)
            } else {
                path
            }
        };
        self.midi_file = resolve(self.midi_file);
        self.stem_dir = resolve(self.stem_dir);
        self.output_dir = resolve(self.output_dir);
        self.trace_file = self.trace_file.map(resolve);
        self.override_files = self
            .override_files
            .into_iter()
            .map(|(voice, path)| (voice, resolve(path)))
            .collect();
        self
    }

    pub fn target_names(&self) -> Vec<String> {
        self.targets.iter().map(|t| t.name.clone()).collect()
    }

    pub fn renderer(&self) -> Arc<dyn StemRenderer> {
        Arc::new(CommandRenderer::new(self.renderer.command.clone()))
    }

    pub fn mixer(&self) -> Arc<dyn StemMixer> {
        match &self.mixer {
            MixerConfig::Command { command } => Arc::new(CommandMixer::new(command)),
            MixerConfig::Internal { amplification_db } => Arc::new(WavMixer::new(*amplification_db)),
        }
    }

    /// Orchestrator for `source` wired with this configuration
    pub fn orchestrator(&self, source: MidiFile) -> PipelineResult<Orchestrator> {
        let mut orchestrator = Orchestrator::new(
            source,
            self.voices.clone(),
            self.settings.clone(),
            self.targets.clone(),
            self.renderer(),
            self.mixer(),
        )
        .with_stem_dir(&self.stem_dir)
        .with_output_dir(&self.output_dir)
        .with_overrides(self.override_files.clone());

        if let Some(workers) = self.workers {
            orchestrator = orchestrator.with_workers(workers);
        }
        if let Some(ref table) = self.tempo {
            orchestrator = orchestrator.with_tempo_target(table)?;
        }
        if let Some(ref path) = self.trace_file {
            orchestrator = orchestrator.with_trace(TraceWriter::new(path.clone()));
        }
        Ok(orchestrator)
    }
}

/// Validate configuration parameters
pub fn validate_config(config: &ProjectConfig) -> ConfigResult<()> {
    let mut names = BTreeSet::new();
    for voice in &config.voices {
        if !names.insert(voice.name.as_str()) {
            return Err(ConfigError::DuplicateVoice(voice.name.clone()));
        }
        if voice.channel > 15 {
            return Err(ConfigError::InvalidChannel {
                voice: voice.name.clone(),
                channel: voice.channel,
            });
        }
    }

    let mut targets = BTreeSet::new();
    for target in &config.targets {
        if !targets.insert(target.name.as_str()) {
            return Err(ConfigError::DuplicateTarget(target.name.clone()));
        }
        if let Some(voice) = target.referenced_voices().find(|v| !names.contains(v)) {
            return Err(ConfigError::UnknownVoice {
                target: target.name.clone(),
                voice: voice.to_string(),
            });
        }
    }

    if let Some(voice) = config.override_files.keys().find(|v| !names.contains(v.as_str())) {
        return Err(ConfigError::UnknownOverride(voice.clone()));
    }

    if config.renderer.command.trim().is_empty() {
        return Err(ConfigError::EmptyCommand("Renderer"));
    }
    if let MixerConfig::Command { command } = &config.mixer {
        if command.trim().is_empty() {
            return Err(ConfigError::EmptyCommand("Mixer"));
        }
    }
    if config.workers == Some(0) {
        return Err(ConfigError::NoWorkers);
    }

    Ok(())
}

/// Load configuration from JSON file
pub fn load_config<P: AsRef<Path>>(path: P) -> ConfigResult<ProjectConfig> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let config: ProjectConfig = serde_json::from_str(&content)?;
    validate_config(&config)?;

    let base = path.parent().unwrap_or_else(|| Path::new(""));
    Ok(config.resolve_paths(base))
}

/// Save configuration to JSON file
pub fn save_config<P: AsRef<Path>>(config: &ProjectConfig, path: P) -> ConfigResult<()> {
    let path = path.as_ref();
    let content = serde_json::to_string_pretty(config)?;
    std::fs::write(path, content).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const SAMPLE: &str = r#"{
        "midi_file": "song.mid",
        "trace_file": "build/trace.jsonl",
        "voices": [
            {"name": "bass", "channel": 0},
            {"name": "drums", "channel": 9, "is_drum": true},
            {"name": "vocals", "channel": 2}
        ],
        "settings": {
            "defaults": {"volume": 90, "reverb": 0.1},
            "drums": {"humanize": true, "timing_jitter": 5},
            "voices": {"bass": {"pan": "0.3L", "instrument": "0:33"}}
        },
        "targets": [
            {"name": "mix"},
            {"name": "instrumental", "exclude": ["vocals"]}
        ],
        "tempo": [{"measure": 1, "bpm": 96}],
        "renderer": {"command": "fluidsynth -ni -F ${outfile} font.sf2 ${infile}"},
        "mixer": {"kind": "command", "command": "sox -m [-v ${factor} ${infile}] ${outfile}"},
        "override_files": {"vocals": "takes/vocals.wav"}
    }"#;

    fn sample() -> ProjectConfig {
        serde_json::from_str(SAMPLE).unwrap()
    }

    #[test]
    fn test_parse_sample() {
        let config = sample();

        assert_eq!(config.stem_dir, PathBuf::from("stems"));
        assert_eq!(config.voices.len(), 3);
        assert!(config.voices[1].is_drum);
        assert_eq!(config.target_names(), vec!["mix", "instrumental"]);
        assert!(!config.targets[1].includes("vocals"));
        assert_eq!(config.tempo.as_ref().map(|t| t[0].quarters_per_measure), Some(4.0));
        assert!(matches!(config.mixer, MixerConfig::Command { .. }));
        validate_config(&config).unwrap();
    }

    #[test]
    fn test_mixer_defaults_to_internal() {
        let json = r#"{
            "midi_file": "song.mid",
            "voices": [],
            "targets": [],
            "renderer": {"command": "timidity ${infile} -Ow -o ${outfile}"}
        }"#;
        let config: ProjectConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.mixer, MixerConfig::Internal { amplification_db: 0.0 });
        assert!(config.override_files.is_empty());
    }

    #[test]
    fn test_validation_errors() {
        let mut config = sample();
        config.voices.push(VoiceDescriptor::new("bass", 3));
        assert!(matches!(validate_config(&config), Err(ConfigError::DuplicateVoice(v)) if v == "bass"));

        let mut config = sample();
        config.voices[0].channel = 16;
        assert!(matches!(validate_config(&config), Err(ConfigError::InvalidChannel { channel: 16, .. })));

        let mut config = sample();
        config.targets[1].exclude.push("choir".to_string());
        assert!(matches!(
            validate_config(&config),
            Err(ConfigError::UnknownVoice { ref voice, .. }) if voice == "choir"
        ));

        let mut config = sample();
        config.targets.push(TargetConfig::new("mix"));
        assert!(matches!(validate_config(&config), Err(ConfigError::DuplicateTarget(_))));

        let mut config = sample();
        config.renderer.command = "  ".to_string();
        assert!(matches!(validate_config(&config), Err(ConfigError::EmptyCommand("Renderer"))));

        let mut config = sample();
        config.override_files.insert("piano".to_string(), PathBuf::from("p.wav"));
        assert!(matches!(validate_config(&config), Err(ConfigError::UnknownOverride(_))));

        let mut config = sample();
        config.workers = Some(0);
        assert!(matches!(validate_config(&config), Err(ConfigError::NoWorkers)));
    }

    #[test]
    fn test_load_resolves_relative_paths() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("song.json");
        std::fs::write(&path, SAMPLE).unwrap();

        let config = load_config(&path).unwrap();

        assert_eq!(config.midi_file, dir.path().join("song.mid"));
        assert_eq!(config.stem_dir, dir.path().join("stems"));
        assert_eq!(config.output_dir, dir.path().join("."));
        assert_eq!(config.trace_file, Some(dir.path().join("build/trace.jsonl")));
        assert_eq!(config.override_files["vocals"], dir.path().join("takes/vocals.wav"));
    }

    #[test]
    fn test_load_missing_file() {
        let dir = TempDir::new().unwrap();
        let result = load_config(dir.path().join("absent.json"));
        assert!(matches!(result, Err(ConfigError::Io { .. })));
    }

    #[test]
    fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("saved.json");
        let config = sample().resolve_paths(Path::new("/music/song"));

        save_config(&config, &path).unwrap();

        assert_eq!(load_config(&path).unwrap(), config);
    }

    #[test]
    fn test_orchestrator_rejects_bad_tempo_table() {
        let mut config = sample();
        config.tempo = Some(vec![TempoEntryConfig {
            measure: 1,
            bpm: -10.0,
            quarters_per_measure: 4.0,
        }]);
        let source = MidiFile::new(crate::midi::MidiFormat::Parallel, 480, Vec::new());

        assert!(config.orchestrator(source).is_err());
    }
}

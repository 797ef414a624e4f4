// Settings Layers - configured defaults, voice overrides and targets
// Produces the ordered layer list the resolver merges

use super::types::{SettingsLayer, VoiceDescriptor};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One mixdown output, e.g. "mix" or "instrumental"
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetConfig {
    pub name: String,

    /// Voices rendered into this target; empty means all
    #[serde(default)]
    pub include: Vec<String>,

    #[serde(default)]
    pub exclude: Vec<String>,

    /// Overrides applied to every voice of this target
    #[serde(default)]
    pub layer: SettingsLayer,

    /// Overrides for single voices of this target
    #[serde(default)]
    pub voice_layers: BTreeMap<String, SettingsLayer>,
}

impl TargetConfig {
    pub fn new(name: impl Into<String>) -> Self {
        TargetConfig {
            name: name.into(),
            include: Vec::new(),
            exclude: Vec::new(),
            layer: SettingsLayer::new(),
            voice_layers: BTreeMap::new(),
        }
    }

    pub fn excluding(mut self, voice: impl Into<String>) -> Self {
        self.exclude.push(voice.into());
        self
    }

    /// Whether `voice` is rendered into this target
    pub fn includes(&self, voice: &str) -> bool {
        (self.include.is_empty() || self.include.iter().any(|v| v == voice))
            && !self.exclude.iter().any(|v| v == voice)
    }

    /// Voice names mentioned by include, exclude or voice layers
    pub fn referenced_voices(&self) -> impl Iterator<Item = &str> {
        self.include
            .iter()
            .chain(&self.exclude)
            .map(String::as_str)
            .chain(self.voice_layers.keys().map(String::as_str))
    }
}

/// Configured settings layers, least to most specific
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SettingsConfig {
    #[serde(default)]
    pub defaults: SettingsLayer,

    /// Applied to drum voices only
    #[serde(default)]
    pub drums: SettingsLayer,

    #[serde(default)]
    pub voices: BTreeMap<String, SettingsLayer>,
}

impl SettingsConfig {
    /// Layers for `voice` in `target`: defaults, drums, voice, target, target voice
    pub fn layers_for<'a>(
        &'a self,
        voice: &VoiceDescriptor,
        target: &'a TargetConfig,
    ) -> Vec<&'a SettingsLayer> {
        let mut layers = vec![&self.defaults];
        if voice.is_drum {
            layers.push(&self.drums);
        }
        if let Some(layer) = self.voices.get(&voice.name) {
            layers.push(layer);
        }
        layers.push(&target.layer);
        if let Some(layer) = target.voice_layers.get(&voice.name) {
            layers.push(layer);
        }
        layers
    }
}

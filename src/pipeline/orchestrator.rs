// Render Orchestrator - per-target render and mixdown state machine
// Voices render in parallel on blocking workers; each target mixes once

use super::trace::{TraceBuilder, TraceWriter};
use crate::midi::{
    self, EncodeError, MidiFile, TempoEntryConfig, TempoTrack, TempoTrackError, CC_PAN,
    CC_REVERB, CC_VOLUME,
};
use crate::render::cache::{self, stem_paths};
use crate::render::{
    AudioTrack, MixError, MixInput, MixJob, RenderError, RenderJob, StemMixer, StemRenderer,
};
use crate::settings::{
    ResolveError, SettingsConfig, SettingsResolver, TargetConfig, TrackSettings, VoiceDescriptor,
};
use crate::transform::{filter, Pipeline, TransformContext, TransformError};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use uuid::Uuid;

/// Errors that stop a batch before any target starts
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Unknown target '{0}'")]
    UnknownTarget(String),

    #[error("Target '{0}' requested more than once")]
    DuplicateTarget(String),

    #[error("Settings for target '{target}': {source}")]
    Resolve {
        target: String,
        #[source]
        source: ResolveError,
    },

    #[error("Invalid tempo table: {0}")]
    Tempo(#[from] TempoTrackError),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

pub type PipelineResult<T> = Result<T, PipelineError>;

/// Why a single target failed
#[derive(Debug, Error)]
pub enum TargetFailure {
    #[error(transparent)]
    Render(#[from] RenderError),

    #[error(transparent)]
    Mix(#[from] MixError),

    #[error(transparent)]
    Transform(#[from] TransformError),

    #[error("Failed to encode MIDI for voice '{voice}': {source}")]
    Codec {
        voice: String,
        #[source]
        source: EncodeError,
    },

    #[error("Failed to write inputs for voice '{voice}': {source}")]
    Io {
        voice: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Worker stopped unexpectedly: {0}")]
    Join(String),
}

#[derive(Debug)]
pub enum TargetState {
    Idle,
    Rendering(String),
    Mixing,
    Done(PathBuf),
    Failed(TargetFailure),
}

impl TargetState {
    pub fn label(&self) -> &'static str {
        match self {
            TargetState::Idle => "idle",
            TargetState::Rendering(_) => "rendering",
            TargetState::Mixing => "mixing",
            TargetState::Done(_) => "done",
            TargetState::Failed(_) => "failed",
        }
    }

    pub fn is_done(&self) -> bool {
        matches!(self, TargetState::Done(_))
    }
}

/// One recorded state transition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetStatus {
    pub timestamp: String,
    pub state: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub voice: Option<String>,
    pub message: String,
}

/// Outcome of one target
#[derive(Debug)]
pub struct TargetReport {
    pub target: String,
    /// Final state: Done or Failed
    pub state: TargetState,
    pub history: Vec<TargetStatus>,
    /// Stems that were rendered or reused, in voice order
    pub tracks: Vec<AudioTrack>,
}

/// Resolved work for one voice
#[derive(Debug, Clone)]
struct VoicePlan {
    voice: VoiceDescriptor,
    settings: TrackSettings,
}

#[derive(Debug, Clone)]
struct TargetPlan {
    name: String,
    voices: Vec<VoicePlan>,
}

/// Records transitions into the report history, the log and the trace
struct Recorder {
    run_id: Uuid,
    target: String,
    trace: Option<Arc<TraceWriter>>,
    history: Vec<TargetStatus>,
}

impl Recorder {
    fn new(run_id: Uuid, target: &str, trace: Option<Arc<TraceWriter>>) -> Self {
        Recorder {
            run_id,
            target: target.to_string(),
            trace,
            history: Vec::new(),
        }
    }

    fn transition(&mut self, state: &TargetState, message: impl Into<String>) {
        let message = message.into();
        let voice = match state {
            TargetState::Rendering(voice) => Some(voice.clone()),
            _ => None,
        };
        let data = match state {
            TargetState::Done(path) => Some(serde_json::json!({ "path": path })),
            TargetState::Failed(failure) => Some(serde_json::json!({ "error": failure.to_string() })),
            _ => None,
        };

        match state {
            TargetState::Failed(_) => log::error!("[{}] {}", self.target, message),
            _ => log::info!("[{}] {}", self.target, message),
        }

        if let Some(ref writer) = self.trace {
            let mut builder = TraceBuilder::target(self.run_id, self.target.clone());
            if let Some(ref voice) = voice {
                builder = builder.voice(voice.clone());
            }
            let entry = match data {
                Some(data) => builder.with_data(state.label(), message.clone(), data),
                None => builder.state(state.label(), message.clone()),
            };
            if let Err(e) = writer.write(&entry) {
                log::warn!("Failed to write trace entry: {}", e);
            }
        }

        self.history.push(TargetStatus {
            timestamp: Utc::now().to_rfc3339(),
            state: state.label().to_string(),
            voice,
            message,
        });
    }

    /// Trace-only note that a voice reused its stem
    fn cached(&self, voice: &str, stem: &Path) {
        let Some(ref writer) = self.trace else {
            return;
        };
        let entry = TraceBuilder::target(self.run_id, self.target.clone())
            .voice(voice.to_string())
            .with_data(
                "cached",
                format!("Reused stem for {}", voice),
                serde_json::json!({ "path": stem }),
            );
        if let Err(e) = writer.write(&entry) {
            log::warn!("Failed to write trace entry: {}", e);
        }
    }

    fn finish(
        mut self,
        state: TargetState,
        message: impl Into<String>,
        tracks: Vec<AudioTrack>,
    ) -> TargetReport {
        self.transition(&state, message);
        TargetReport {
            target: self.target,
            state,
            history: self.history,
            tracks,
        }
    }
}

/// Drives targets from the source MIDI file to mixed audio
#[derive(Clone)]
pub struct Orchestrator {
    source: Arc<MidiFile>,
    source_tempo: Arc<TempoTrack>,
    tempo: Arc<TempoTrack>,
    voices: Arc<[VoiceDescriptor]>,
    settings: Arc<SettingsConfig>,
    targets: Arc<[TargetConfig]>,
    resolver: Arc<SettingsResolver>,
    renderer: Arc<dyn StemRenderer>,
    mixer: Arc<dyn StemMixer>,
    mix_lock: Arc<Mutex<()>>,
    overrides: Arc<BTreeMap<String, PathBuf>>,
    trace: Option<Arc<TraceWriter>>,
    stem_dir: PathBuf,
    output_dir: PathBuf,
    workers: usize,
    run_id: Uuid,
}

impl Orchestrator {
    pub fn new(
        source: MidiFile,
        voices: Vec<VoiceDescriptor>,
        settings: SettingsConfig,
        targets: Vec<TargetConfig>,
        renderer: Arc<dyn StemRenderer>,
        mixer: Arc<dyn StemMixer>,
    ) -> Self {
        let source_tempo = Arc::new(source.tempo_track());
        Orchestrator {
            source: Arc::new(source),
            tempo: Arc::clone(&source_tempo),
            source_tempo,
            voices: voices.into(),
            settings: Arc::new(settings),
            targets: targets.into(),
            resolver: Arc::new(SettingsResolver::new()),
            renderer,
            mixer,
            mix_lock: Arc::new(Mutex::new(())),
            overrides: Arc::new(BTreeMap::new()),
            trace: None,
            stem_dir: PathBuf::from("stems"),
            output_dir: PathBuf::from("."),
            workers: std::thread::available_parallelism().map_or(1, |n| n.get()),
            run_id: Uuid::new_v4(),
        }
    }

    pub fn with_stem_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.stem_dir = dir.into();
        self
    }

    pub fn with_output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.output_dir = dir.into();
        self
    }

    /// Bound on concurrent voice renders across the whole batch
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    /// Re-time every voice to a configured tempo table
    pub fn with_tempo_target(mut self, table: &[TempoEntryConfig]) -> PipelineResult<Self> {
        let tempo = TempoTrack::from_config(
            self.source.ticks_per_quarter,
            table,
            self.source_tempo.measure_count(),
        )?;
        self.tempo = Arc::new(tempo);
        Ok(self)
    }

    pub fn with_resolver(mut self, resolver: SettingsResolver) -> Self {
        self.resolver = Arc::new(resolver);
        self
    }

    /// Prepared stems copied instead of rendering, by voice name
    pub fn with_overrides(mut self, overrides: BTreeMap<String, PathBuf>) -> Self {
        self.overrides = Arc::new(overrides);
        self
    }

    pub fn with_trace(mut self, writer: TraceWriter) -> Self {
        self.trace = Some(Arc::new(writer));
        self
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Render and mix a single target
    pub async fn run_target(&self, name: &str) -> PipelineResult<TargetReport> {
        self.run_batch(&[name.to_string()])
            .await?
            .pop()
            .ok_or_else(|| PipelineError::UnknownTarget(name.to_string()))
    }

    /// Render and mix several targets concurrently
    ///
    /// Settings of every target are resolved before anything renders; a
    /// resolver error fails the whole batch. Afterwards each target
    /// succeeds or fails on its own. Reports come back in request order.
    pub async fn run_batch(&self, names: &[String]) -> PipelineResult<Vec<TargetReport>> {
        let plans = self.plan(names)?;
        tokio::fs::create_dir_all(&self.stem_dir).await?;
        tokio::fs::create_dir_all(&self.output_dir).await?;

        log::info!(
            "Run {}: {} target(s), {} worker(s)",
            self.run_id,
            plans.len(),
            self.workers
        );

        let permits = Arc::new(Semaphore::new(self.workers));
        let handles: Vec<_> = plans
            .into_iter()
            .map(|plan| {
                let name = plan.name.clone();
                let this = self.clone();
                let permits = Arc::clone(&permits);
                (name, tokio::spawn(async move { this.run_plan(plan, permits).await }))
            })
            .collect();

        let mut reports = Vec::with_capacity(handles.len());
        for (name, handle) in handles {
            let report = match handle.await {
                Ok(report) => report,
                Err(e) => Recorder::new(self.run_id, &name, self.trace.clone()).finish(
                    TargetState::Failed(TargetFailure::Join(e.to_string())),
                    format!("Target task stopped: {}", e),
                    Vec::new(),
                ),
            };
            reports.push(report);
        }
        Ok(reports)
    }

    fn plan(&self, names: &[String]) -> PipelineResult<Vec<TargetPlan>> {
        let mut plans: Vec<TargetPlan> = Vec::with_capacity(names.len());
        for name in names {
            if plans.iter().any(|plan| &plan.name == name) {
                return Err(PipelineError::DuplicateTarget(name.clone()));
            }
            let target = self
                .targets
                .iter()
                .find(|t| &t.name == name)
                .ok_or_else(|| PipelineError::UnknownTarget(name.clone()))?;

            let mut voices = Vec::new();
            for voice in self.voices.iter().filter(|v| target.includes(&v.name)) {
                let layers = self.settings.layers_for(voice, target);
                let settings = self
                    .resolver
                    .resolve(voice, &target.name, &layers)
                    .map_err(|source| PipelineError::Resolve {
                        target: name.clone(),
                        source,
                    })?;
                voices.push(VoicePlan {
                    voice: voice.clone(),
                    settings,
                });
            }
            plans.push(TargetPlan {
                name: name.clone(),
                voices,
            });
        }
        Ok(plans)
    }

    async fn run_plan(self, plan: TargetPlan, permits: Arc<Semaphore>) -> TargetReport {
        let mut recorder = Recorder::new(self.run_id, &plan.name, self.trace.clone());
        recorder.transition(
            &TargetState::Idle,
            format!("{} voice(s) queued", plan.voices.len()),
        );

        let failed = Arc::new(AtomicBool::new(false));
        let mut workers = JoinSet::new();

        for (index, voice_plan) in plan.voices.into_iter().enumerate() {
            let Ok(permit) = Arc::clone(&permits).acquire_owned().await else {
                break;
            };
            // A worker sets the flag before it releases its permit
            if failed.load(Ordering::SeqCst) {
                break;
            }

            let voice = voice_plan.voice.name.clone();
            recorder.transition(
                &TargetState::Rendering(voice.clone()),
                format!("Rendering {}", voice),
            );

            let this = self.clone();
            let target = plan.name.clone();
            let failed = Arc::clone(&failed);
            workers.spawn_blocking(move || {
                let result = this.render_voice(&target, &voice_plan.voice, &voice_plan.settings);
                if result.is_err() {
                    failed.store(true, Ordering::SeqCst);
                }
                drop(permit);
                (index, result)
            });
        }

        let mut tracks = Vec::new();
        let mut failure = None;
        while let Some(joined) = workers.join_next().await {
            let result = joined
                .map_err(|e| TargetFailure::Join(e.to_string()))
                .and_then(|(index, result)| result.map(|track| (index, track)));
            match result {
                Ok((index, track)) => {
                    if track.cached {
                        recorder.cached(&track.voice, &track.stem_path);
                    }
                    tracks.push((index, track));
                }
                Err(e) => {
                    failed.store(true, Ordering::SeqCst);
                    log::error!("[{}] {}", plan.name, e);
                    failure.get_or_insert(e);
                }
            }
        }
        tracks.sort_by_key(|(index, _)| *index);
        let tracks: Vec<AudioTrack> = tracks.into_iter().map(|(_, track)| track).collect();

        if let Some(failure) = failure {
            let message = format!("Rendering failed: {}", failure);
            return recorder.finish(TargetState::Failed(failure), message, tracks);
        }

        recorder.transition(
            &TargetState::Mixing,
            format!("Mixing {} stem(s)", tracks.len()),
        );
        let job = MixJob {
            target: plan.name.clone(),
            inputs: tracks.iter().map(MixInput::from).collect(),
            output_path: self.output_dir.join(format!("{}.wav", plan.name)),
        };

        let _guard = self.mix_lock.lock().await;
        let mixer = Arc::clone(&self.mixer);
        let output_path = job.output_path.clone();
        match tokio::task::spawn_blocking(move || mixer.mix(&job)).await {
            Ok(Ok(())) => {
                let message = format!("Wrote {}", output_path.display());
                recorder.finish(TargetState::Done(output_path), message, tracks)
            }
            Ok(Err(e)) => {
                let message = format!("Mixing failed: {}", e);
                recorder.finish(TargetState::Failed(e.into()), message, tracks)
            }
            Err(e) => {
                let message = format!("Mixer stopped: {}", e);
                recorder.finish(
                    TargetState::Failed(TargetFailure::Join(e.to_string())),
                    message,
                    tracks,
                )
            }
        }
    }

    /// Transform, write and render one voice; runs on a blocking worker
    fn render_voice(
        &self,
        target: &str,
        voice: &VoiceDescriptor,
        settings: &TrackSettings,
    ) -> Result<AudioTrack, TargetFailure> {
        let paths = stem_paths(&self.stem_dir, &voice.name, target);
        let io_error = |source: std::io::Error| TargetFailure::Io {
            voice: voice.name.clone(),
            source,
        };

        let extracted = filter::extract_voice(&self.source, voice);
        let cleaned =
            filter::remove_controllers(&extracted, voice.channel, &[CC_VOLUME, CC_PAN, CC_REVERB]);
        let positioned =
            filter::assign_instrument(&cleaned, voice, settings).map_err(|e| TransformError {
                stage: "instrument",
                voice: voice.name.clone(),
                reason: e.into(),
            })?;

        let ctx = TransformContext {
            voice,
            settings,
            source_tempo: &self.source_tempo,
            tempo: &self.tempo,
        };
        let transformed = Pipeline::standard().run(&positioned, &ctx)?;

        let bytes = midi::encode(&transformed).map_err(|source| TargetFailure::Codec {
            voice: voice.name.clone(),
            source,
        })?;
        cache::write_if_changed(&paths.midi, &bytes).map_err(io_error)?;
        let settings_json = serde_json::to_vec_pretty(settings)
            .map_err(|e| io_error(std::io::Error::from(e)))?;
        cache::write_if_changed(&paths.settings, &settings_json).map_err(io_error)?;

        let cached = if let Some(source) = self.overrides.get(&voice.name) {
            cache::copy_override(source, &paths.stem).map_err(io_error)?;
            false
        } else if cache::is_fresh(&paths.stem, &paths.inputs()) {
            log::info!("[{}] Stem for {} is up to date", target, voice.name);
            true
        } else {
            let job = RenderJob {
                voice: voice.name.clone(),
                midi_path: paths.midi.clone(),
                stem_path: paths.stem.clone(),
                instrument: settings.instrument.clone(),
                effects: settings.effects.clone(),
                reverb: settings.reverb,
            };
            // an old stem must not pass for this render's output
            cache::discard(&paths.stem).map_err(io_error)?;
            if let Err(error) = self.renderer.render(&job) {
                if let Err(e) = cache::discard(&paths.stem) {
                    log::warn!("[{}] Failed to remove partial stem for {}: {}", target, voice.name, e);
                }
                return Err(error.into());
            }
            if !paths.stem.is_file() {
                return Err(RenderError::MissingOutput {
                    voice: voice.name.clone(),
                    path: paths.stem.clone(),
                }
                .into());
            }
            false
        };

        Ok(AudioTrack {
            voice: voice.name.clone(),
            stem_path: paths.stem,
            settings: settings.clone(),
            cached,
        })
    }
}

//! End-to-end episode pipeline with persisted checkpoints.
//!
//! A run moves through `RETRIEVING -> GENERATING -> SYNTHESIZING ->
//! ASSEMBLING -> DONE`. Each stage commits its output as a checkpoint keyed
//! by the run key before the next stage starts, so a failed or cancelled run
//! resumes at the stage that did not finish. A run that reached DONE returns
//! its stored [`Episode`] without doing any work, as long as the artifact on
//! disk still hashes to what was recorded; otherwise ASSEMBLING runs again.
//! Each run key renders into its own directory.

use std::path::PathBuf;

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use showrunner_corpus::IndexedCorpus;
use showrunner_providers::{LanguageModel, SpeechSynthesizer};
use showrunner_shared::{
    AppConfig, Episode, EpisodeSpec, GeneratedScript, Result, RetrievalResult, RetryPolicy,
    RunState, ShowrunnerError, Stage, VoiceConfig, expand_home, fingerprint, sha256_hex,
};
use showrunner_storage::Storage;

use crate::assembler::{AssemblySettings, EpisodeAssembler};
use crate::generator::{GeneratorConfig, ScriptGenerator};
use crate::render::{RenderSettings, Renderer};
use crate::synthesizer::{AudioSynthesizer, SynthesizerConfig};
use crate::visuals::{VisualAssetProvider, resolve_visuals};

/// Run key characters used in the output directory name.
const RUN_DIR_CHARS: usize = 16;

/// Checkpoint names.
pub mod checkpoint {
    pub const RETRIEVAL: &str = "retrieval";
    pub const SCRIPT: &str = "script";
    pub const AUDIO: &str = "audio";
    pub const AUDIO_PROGRESS: &str = "audio_progress";
    pub const EPISODE: &str = "episode";
}

// ---------------------------------------------------------------------------
// Progress
// ---------------------------------------------------------------------------

/// Progress callback for reporting pipeline status.
pub trait ProgressReporter: Send + Sync {
    /// Called when entering a stage.
    fn stage(&self, stage: Stage);
    /// Called when a stage's output was recovered from a checkpoint.
    fn resumed(&self, stage: Stage);
    /// Called when one unit of work inside a stage finishes.
    fn unit_done(&self, stage: Stage, current: usize, total: usize);
    /// Called when the run is DONE.
    fn done(&self, episode: &Episode);
}

/// No-op progress reporter for headless/test usage.
pub struct SilentProgress;

impl ProgressReporter for SilentProgress {
    fn stage(&self, _stage: Stage) {}
    fn resumed(&self, _stage: Stage) {}
    fn unit_done(&self, _stage: Stage, _current: usize, _total: usize) {}
    fn done(&self, _episode: &Episode) {}
}

// ---------------------------------------------------------------------------
// Context
// ---------------------------------------------------------------------------

/// Everything a run needs besides its inputs.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub generator: GeneratorConfig,
    pub synthesizer: SynthesizerConfig,
    pub voice: VoiceConfig,
    pub assembly: AssemblySettings,
    /// Rendered output format; see [`RenderSettings::profile`].
    pub output_profile: String,
    /// Episodes render into `{output_dir}/{episode_id}/{run key prefix}/`.
    pub output_dir: PathBuf,
}

impl PipelineSettings {
    pub fn from_config(config: &AppConfig) -> Result<Self> {
        let retry = RetryPolicy::from(config);
        Ok(Self {
            generator: GeneratorConfig {
                top_k: config.retrieval.top_k,
                max_attempts: config.llm.max_generation_attempts,
                max_passage_chars: config.llm.max_passage_chars,
                revise: config.llm.revise,
                retry: retry.clone(),
            },
            synthesizer: SynthesizerConfig {
                retry,
                max_in_flight: config.tts.max_in_flight,
                normalize: config.narration.normalize,
            },
            voice: VoiceConfig::from(config),
            assembly: AssemblySettings::from(&config.assembly),
            output_profile: RenderSettings::from(&config.assembly).profile(),
            output_dir: expand_home(&config.defaults.output_dir)?,
        })
    }
}

/// Run context: storage, collaborators, settings, and cancellation.
pub struct PipelineContext<'a> {
    pub storage: &'a Storage,
    pub model: &'a dyn LanguageModel,
    pub tts: &'a dyn SpeechSynthesizer,
    pub renderer: &'a dyn Renderer,
    pub visuals: &'a dyn VisualAssetProvider,
    pub settings: PipelineSettings,
    pub cancel: CancellationToken,
    pub progress: &'a dyn ProgressReporter,
}

/// Inputs that make two runs the same run.
#[derive(Serialize)]
struct RunIdentity<'a> {
    spec: &'a EpisodeSpec,
    corpus_version: &'a str,
    model: &'a str,
    top_k: usize,
    revise: bool,
    voice: &'a VoiceConfig,
    normalize_narration: bool,
    transition_ms: u64,
    duration_tolerance_ms: u64,
    output_profile: &'a str,
}

/// Key identifying a run of `spec` over a corpus version with `settings`.
pub fn run_key(
    spec: &EpisodeSpec,
    corpus_version: &str,
    model_id: &str,
    settings: &PipelineSettings,
) -> Result<String> {
    fingerprint(
        "run",
        &RunIdentity {
            spec,
            corpus_version,
            model: model_id,
            top_k: settings.generator.top_k,
            revise: settings.generator.revise,
            voice: &settings.voice,
            normalize_narration: settings.synthesizer.normalize,
            transition_ms: settings.assembly.transition_ms,
            duration_tolerance_ms: settings.assembly.duration_tolerance_ms,
            output_profile: &settings.output_profile,
        },
    )
}

// ---------------------------------------------------------------------------
// Run
// ---------------------------------------------------------------------------

impl PipelineContext<'_> {
    /// Run key for `spec` under this context.
    pub fn run_key(&self, spec: &EpisodeSpec, index: &IndexedCorpus) -> Result<String> {
        run_key(spec, index.version(), self.model.model_id(), &self.settings)
    }

    /// Produce the episode for `spec`, resuming from checkpoints when an
    /// earlier run with the same key got partway.
    #[instrument(skip_all, fields(episode = %spec.episode_id))]
    pub async fn run_episode(&self, spec: &EpisodeSpec, index: &IndexedCorpus) -> Result<Episode> {
        spec.validate()?;
        let key = self.run_key(spec, index)?;

        let mut reassemble = false;
        if let Some(run) = self.storage.get_run(&key).await? {
            if run.state == RunState::Done {
                match self
                    .storage
                    .load_checkpoint::<Episode>(&key, checkpoint::EPISODE)
                    .await?
                {
                    Some(episode) if artifact_intact(&episode).await => {
                        info!(run_key = %&key[..16], "run already done, returning stored episode");
                        self.progress.done(&episode);
                        return Ok(episode);
                    }
                    Some(episode) => {
                        warn!(
                            run_key = %&key[..16],
                            path = %episode.artifact_path.display(),
                            "stored artifact is missing or changed, re-assembling"
                        );
                        reassemble = true;
                    }
                    None => {
                        warn!(run_key = %&key[..16], "run marked done without an episode, re-running");
                    }
                }
            } else {
                info!(run_key = %&key[..16], state = %run.state, "resuming run");
            }
        }

        let mut stage = Stage::Retrieving;
        match self.drive(spec, index, &key, reassemble, &mut stage).await {
            Ok(episode) => {
                self.storage
                    .set_run_state(&key, &spec.episode_id, RunState::Done, None)
                    .await?;
                info!(
                    run_key = %&key[..16],
                    duration_ms = episode.duration_ms,
                    path = %episode.artifact_path.display(),
                    "run done"
                );
                self.progress.done(&episode);
                Ok(episode)
            }
            Err(e) => {
                warn!(run_key = %&key[..16], %stage, error = %e, "run failed");
                let message = e.to_string();
                if let Err(persist) = self
                    .storage
                    .set_run_state(&key, &spec.episode_id, RunState::Failed(stage), Some(&message))
                    .await
                {
                    warn!(error = %persist, "failed to record run failure");
                }
                Err(e)
            }
        }
    }

    async fn drive(
        &self,
        spec: &EpisodeSpec,
        index: &IndexedCorpus,
        key: &str,
        reassemble: bool,
        stage: &mut Stage,
    ) -> Result<Episode> {
        let generator = ScriptGenerator::new(self.model, self.storage, self.settings.generator.clone())
            .with_cancellation(self.cancel.clone());
        let synthesizer =
            AudioSynthesizer::new(self.tts, self.storage, self.settings.synthesizer.clone());

        // --- RETRIEVING ---
        self.enter(Stage::Retrieving, key, spec, stage).await?;
        let retrievals = match self
            .storage
            .load_checkpoint::<Vec<RetrievalResult>>(key, checkpoint::RETRIEVAL)
            .await?
        {
            Some(retrievals) => {
                self.progress.resumed(Stage::Retrieving);
                retrievals
            }
            None => {
                let retrievals = generator.retrieve(spec, index)?;
                self.storage
                    .save_checkpoint(key, checkpoint::RETRIEVAL, &retrievals)
                    .await?;
                retrievals
            }
        };

        // --- GENERATING ---
        self.enter(Stage::Generating, key, spec, stage).await?;
        let script = match self
            .storage
            .load_checkpoint::<GeneratedScript>(key, checkpoint::SCRIPT)
            .await?
        {
            Some(script) => {
                self.progress.resumed(Stage::Generating);
                script
            }
            None => {
                let script = generator.generate_grounded(spec, index, &retrievals).await?;
                self.storage
                    .save_checkpoint(key, checkpoint::SCRIPT, &script)
                    .await?;
                script
            }
        };
        self.progress
            .unit_done(Stage::Generating, script.segments.len(), script.segments.len());

        // --- SYNTHESIZING ---
        self.enter(Stage::Synthesizing, key, spec, stage).await?;
        let recorded = self
            .storage
            .load_checkpoint::<Vec<String>>(key, checkpoint::AUDIO)
            .await?;
        let restored = match recorded {
            Some(keys) if keys.len() == script.segments.len() => synthesizer.load_cached(&keys).await?,
            _ => None,
        };
        let clips = match restored {
            Some(clips) => {
                self.progress.resumed(Stage::Synthesizing);
                clips
            }
            None => {
                let clips = match synthesizer
                    .synthesize_all(&script, &self.settings.voice, &self.cancel, self.progress)
                    .await
                {
                    Ok(clips) => clips,
                    Err(e) => {
                        if let ShowrunnerError::SynthesisBatch { succeeded, .. } = &e {
                            self.storage
                                .save_checkpoint(key, checkpoint::AUDIO_PROGRESS, succeeded)
                                .await?;
                        }
                        return Err(e);
                    }
                };
                let keys: Vec<&str> = clips.iter().map(|c| c.cache_key.as_str()).collect();
                self.storage
                    .save_checkpoint(key, checkpoint::AUDIO, &keys)
                    .await?;
                clips
            }
        };

        // --- ASSEMBLING ---
        self.enter(Stage::Assembling, key, spec, stage).await?;
        if !reassemble {
            if let Some(episode) = self
                .storage
                .load_checkpoint::<Episode>(key, checkpoint::EPISODE)
                .await?
            {
                self.progress.resumed(Stage::Assembling);
                return Ok(episode);
            }
        }

        let visuals = resolve_visuals(self.visuals, script.segments.len())?;
        let output_dir = self.episode_dir(spec, key);
        let assembler = EpisodeAssembler::new(self.renderer, self.settings.assembly);
        let episode = assembler
            .assemble(spec, &script, &clips, &visuals, &output_dir)
            .await?;
        self.storage
            .save_checkpoint(key, checkpoint::EPISODE, &episode)
            .await?;

        Ok(episode)
    }

    /// Output directory of one run. Runs of the same episode with different
    /// settings never share an artifact path.
    pub fn episode_dir(&self, spec: &EpisodeSpec, run_key: &str) -> PathBuf {
        self.settings
            .output_dir
            .join(&spec.episode_id)
            .join(&run_key[..RUN_DIR_CHARS.min(run_key.len())])
    }

    /// Stage boundary: honor cancellation, then persist the new state.
    async fn enter(
        &self,
        next: Stage,
        key: &str,
        spec: &EpisodeSpec,
        stage: &mut Stage,
    ) -> Result<()> {
        *stage = next;
        if self.cancel.is_cancelled() {
            return Err(ShowrunnerError::Cancelled { stage: next });
        }
        self.storage
            .set_run_state(key, &spec.episode_id, RunState::Running(next), None)
            .await?;
        self.progress.stage(next);
        info!(stage = %next, "entering stage");
        Ok(())
    }
}

/// Whether the artifact on disk still matches the recorded hash.
async fn artifact_intact(episode: &Episode) -> bool {
    match tokio::fs::read(&episode.artifact_path).await {
        Ok(bytes) => sha256_hex(&bytes) == episode.artifact_sha256,
        Err(e) => {
            debug!(path = %episode.artifact_path.display(), error = %e, "artifact unreadable");
            false
        }
    }
}

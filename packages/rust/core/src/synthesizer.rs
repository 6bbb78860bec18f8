//! Narration audio with a content-addressed cache.
//!
//! Each segment's spoken text is hashed together with the voice settings.
//! A cache hit returns the stored clip without touching the provider; a
//! miss calls the synthesizer under the retry policy and stores the result
//! write-once. Batches fan out under a semaphore and come back in segment
//! order.

use std::sync::atomic::{AtomicUsize, Ordering};

use futures::future::join_all;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use showrunner_providers::{SpeechSynthesizer, with_retry};
use showrunner_shared::{
    AudioClip, GeneratedScript, Result, RetryPolicy, ScriptSegment, ShowrunnerError, Stage,
    VoiceConfig, fingerprint,
};
use showrunner_storage::{CachedAudio, Storage};

use crate::narration;
use crate::pipeline::ProgressReporter;

/// Settings for [`AudioSynthesizer`].
#[derive(Debug, Clone)]
pub struct SynthesizerConfig {
    pub retry: RetryPolicy,
    /// Provider calls allowed in flight at once.
    pub max_in_flight: usize,
    /// Apply [`narration::normalize`] before synthesis.
    pub normalize: bool,
}

pub struct AudioSynthesizer<'a> {
    tts: &'a dyn SpeechSynthesizer,
    storage: &'a Storage,
    config: SynthesizerConfig,
}

impl<'a> AudioSynthesizer<'a> {
    pub fn new(
        tts: &'a dyn SpeechSynthesizer,
        storage: &'a Storage,
        config: SynthesizerConfig,
    ) -> Self {
        Self {
            tts,
            storage,
            config,
        }
    }

    /// The text actually sent to the provider for `narration`.
    pub fn spoken_text(&self, narration: &str) -> String {
        if self.config.normalize {
            narration::normalize(narration)
        } else {
            narration.to_string()
        }
    }

    /// Synthesize one segment, or return its cached clip.
    #[instrument(skip_all, fields(segment = segment.index))]
    pub async fn synthesize(&self, segment: &ScriptSegment, voice: &VoiceConfig) -> Result<AudioClip> {
        let text = self.spoken_text(&segment.narration);
        let key = cache_key(&text, voice)?;

        if let Some(cached) = self.storage.get_audio(&key).await? {
            debug!(cache_key = %&key[..16], "audio cache hit");
            return Ok(to_clip(segment.index, key, cached));
        }

        let tts = self.tts;
        let synthesized = with_retry(&self.config.retry, "synthesize", || {
            tts.synthesize(&text, voice)
        })
        .await
        .map_err(|e| ShowrunnerError::Synthesis {
            segment_index: segment.index,
            message: e.to_string(),
        })?;

        if synthesized.duration_ms == 0 {
            return Err(ShowrunnerError::Synthesis {
                segment_index: segment.index,
                message: "provider returned a zero-length clip".into(),
            });
        }

        let stored = self
            .storage
            .put_audio(
                &key,
                &CachedAudio {
                    duration_ms: synthesized.duration_ms,
                    format: synthesized.format,
                    audio: synthesized.audio,
                },
            )
            .await?;

        info!(duration_ms = stored.duration_ms, "segment synthesized");
        Ok(to_clip(segment.index, key, stored))
    }

    /// One clip per segment, in segment order.
    ///
    /// Every segment is attempted even if others fail; a partial failure is
    /// reported as [`ShowrunnerError::SynthesisBatch`]. Clips that succeeded
    /// are already cached, so a retry only pays for the failures.
    #[instrument(skip_all, fields(segments = script.segments.len(), max_in_flight = self.config.max_in_flight))]
    pub async fn synthesize_all(
        &self,
        script: &GeneratedScript,
        voice: &VoiceConfig,
        cancel: &CancellationToken,
        progress: &dyn ProgressReporter,
    ) -> Result<Vec<AudioClip>> {
        let semaphore = Semaphore::new(self.config.max_in_flight.max(1));
        let total = script.segments.len();
        let finished = AtomicUsize::new(0);

        let tasks = script.segments.iter().map(|segment| {
            let semaphore = &semaphore;
            let finished = &finished;
            async move {
                let _permit = semaphore.acquire().await.map_err(|e| ShowrunnerError::Synthesis {
                    segment_index: segment.index,
                    message: format!("synthesis queue closed: {e}"),
                })?;
                if cancel.is_cancelled() {
                    return Err(ShowrunnerError::Cancelled {
                        stage: Stage::Synthesizing,
                    });
                }
                let clip = self.synthesize(segment, voice).await?;
                let done = finished.fetch_add(1, Ordering::Relaxed) + 1;
                progress.unit_done(Stage::Synthesizing, done, total);
                Ok(clip)
            }
        });

        let results = join_all(tasks).await;

        let mut clips = Vec::with_capacity(total);
        let mut failed = Vec::new();
        let mut messages = Vec::new();
        let mut cancelled = false;
        for (segment, result) in script.segments.iter().zip(results) {
            match result {
                Ok(clip) => clips.push(clip),
                Err(ShowrunnerError::Cancelled { .. }) => cancelled = true,
                Err(e) => {
                    warn!(segment = segment.index, error = %e, "segment synthesis failed");
                    failed.push(segment.index);
                    messages.push(e.to_string());
                }
            }
        }

        if !failed.is_empty() {
            let succeeded = clips.iter().map(|c| c.segment_index).collect();
            return Err(ShowrunnerError::SynthesisBatch {
                succeeded,
                failed,
                message: messages.join("; "),
            });
        }
        if cancelled {
            return Err(ShowrunnerError::Cancelled {
                stage: Stage::Synthesizing,
            });
        }

        clips.sort_by_key(|c| c.segment_index);
        info!(clips = clips.len(), "all segments synthesized");
        Ok(clips)
    }

    /// Rebuild clips from cache keys recorded by an earlier run.
    ///
    /// Returns `None` if any key is no longer in the cache.
    pub async fn load_cached(&self, keys: &[String]) -> Result<Option<Vec<AudioClip>>> {
        let mut clips = Vec::with_capacity(keys.len());
        for (index, key) in keys.iter().enumerate() {
            match self.storage.get_audio(key).await? {
                Some(cached) => clips.push(to_clip(index, key.clone(), cached)),
                None => return Ok(None),
            }
        }
        Ok(Some(clips))
    }
}

/// Cache key for a clip: hash of the spoken text and the voice settings.
pub fn cache_key(text: &str, voice: &VoiceConfig) -> Result<String> {
    fingerprint("audio", &(text, voice))
}

fn to_clip(segment_index: usize, cache_key: String, cached: CachedAudio) -> AudioClip {
    AudioClip {
        segment_index,
        cache_key,
        duration_ms: cached.duration_ms,
        format: cached.format,
        audio: cached.audio,
    }
}

//! In-memory collaborators shared by the unit tests.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use showrunner_corpus::{Bm25Params, IndexedCorpus};
use showrunner_providers::{GenerationRequest, LanguageModel, SpeechSynthesizer, SynthesizedAudio};
use showrunner_shared::{
    AudioClip, CorpusDocument, EpisodeSpec, ProviderError, Result, Timeline, VisualAsset,
    VoiceConfig, sha256_hex,
};
use showrunner_storage::Storage;

use crate::render::{ARTIFACT_NAME, RenderedMedia, Renderer};
use crate::visuals::VisualAssetProvider;

pub async fn test_storage() -> Storage {
    let path = std::env::temp_dir()
        .join(format!("showrunner-test-{}", uuid::Uuid::now_v7()))
        .join("showrunner.db");
    Storage::open(&path).await.unwrap()
}

pub fn test_index() -> IndexedCorpus {
    let docs = [
        ("faith-1", "Faith as a Seed", "Faith is like a seed. Nourish faith and faith grows."),
        ("faith-2", "Trust in the Lord", "Trust the Lord with all your heart; exercise faith daily."),
        ("temple-1", "House of the Lord", "The temple is a house of learning and covenants."),
        ("prayer-1", "Pray Always", "Prayer opens the heavens. Pray morning and night."),
    ];
    IndexedCorpus::build(
        docs.iter()
            .map(|(id, title, text)| CorpusDocument {
                id: id.to_string(),
                title: title.to_string(),
                locator: format!("https://example.org/{id}"),
                text: text.to_string(),
            })
            .collect(),
        Bm25Params::default(),
    )
    .unwrap()
}

pub fn test_spec(min_segments: usize, max_segments: usize) -> EpisodeSpec {
    EpisodeSpec {
        episode_id: "2025-w11".into(),
        topic: "Faith".into(),
        passages: vec!["Temple covenants".into()],
        min_segments,
        max_segments,
        week_start: None,
    }
}

/// A draft with `n` segments, all grounded in `query` and citing `citation`.
pub fn script_json(n: usize, query: usize, citation: &str) -> String {
    let segments: Vec<_> = (0..n)
        .map(|i| {
            json!({
                "title": format!("Part {i}"),
                "narration": format!("Segment {i} talks about faith. [Pause]"),
                "query": query,
                "citations": [citation],
            })
        })
        .collect();
    json!({
        "title": "Faith Like a Seed",
        "description": "A study of faith.",
        "segments": segments,
    })
    .to_string()
}

// ---------------------------------------------------------------------------
// Language model
// ---------------------------------------------------------------------------

/// Replies with queued responses in order and records every request.
pub struct ScriptedModel {
    responses: Mutex<VecDeque<String>>,
    requests: Mutex<Vec<GenerationRequest>>,
    cancels: Option<CancellationToken>,
}

impl ScriptedModel {
    pub fn new(responses: Vec<String>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
            requests: Mutex::new(Vec::new()),
            cancels: None,
        }
    }

    /// Cancels `token` while answering each call, as a user pressing
    /// Ctrl-C mid-request would.
    pub fn cancelling(responses: Vec<String>, token: CancellationToken) -> Self {
        Self {
            cancels: Some(token),
            ..Self::new(responses)
        }
    }

    pub fn calls(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn request(&self, i: usize) -> GenerationRequest {
        self.requests.lock().unwrap()[i].clone()
    }
}

#[async_trait]
impl LanguageModel for ScriptedModel {
    fn model_id(&self) -> &str {
        "test/model"
    }

    async fn complete(&self, request: &GenerationRequest) -> std::result::Result<String, ProviderError> {
        self.requests.lock().unwrap().push(request.clone());
        if let Some(token) = &self.cancels {
            token.cancel();
        }
        self.responses
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| ProviderError::InvalidRequest {
                status: 400,
                message: "no scripted response left".into(),
            })
    }
}

// ---------------------------------------------------------------------------
// Speech
// ---------------------------------------------------------------------------

/// Speaks any text as its own bytes; duration grows with the text length.
pub struct FakeSpeech {
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_concurrent: AtomicUsize,
    texts: Mutex<Vec<String>>,
    fail_on: Option<String>,
    fail_once: bool,
    failed: AtomicBool,
    stamp_calls: bool,
}

impl FakeSpeech {
    pub fn new() -> Self {
        Self {
            calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_concurrent: AtomicUsize::new(0),
            texts: Mutex::new(Vec::new()),
            fail_on: None,
            fail_once: false,
            failed: AtomicBool::new(false),
            stamp_calls: false,
        }
    }

    /// Appends the call number to the audio, so two calls for the same
    /// text return different bytes.
    pub fn stamped() -> Self {
        Self {
            stamp_calls: true,
            ..Self::new()
        }
    }

    /// Permanently rejects any text containing `needle`.
    pub fn failing_on(needle: &str) -> Self {
        Self {
            fail_on: Some(needle.to_string()),
            ..Self::new()
        }
    }

    /// Rejects the first text containing `needle`, then recovers.
    pub fn failing_once_on(needle: &str) -> Self {
        Self {
            fail_on: Some(needle.to_string()),
            fail_once: true,
            ..Self::new()
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent.load(Ordering::SeqCst)
    }

    pub fn texts(&self) -> Vec<String> {
        self.texts.lock().unwrap().clone()
    }
}

#[async_trait]
impl SpeechSynthesizer for FakeSpeech {
    async fn synthesize(
        &self,
        text: &str,
        voice: &VoiceConfig,
    ) -> std::result::Result<SynthesizedAudio, ProviderError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_concurrent.fetch_max(now, Ordering::SeqCst);
        tokio::task::yield_now().await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if let Some(needle) = &self.fail_on {
            let should_fail = text.contains(needle.as_str())
                && !(self.fail_once && self.failed.swap(true, Ordering::SeqCst));
            if should_fail {
                return Err(ProviderError::InvalidRequest {
                    status: 422,
                    message: format!("refused: {needle}"),
                });
            }
        }

        self.texts.lock().unwrap().push(text.to_string());
        let mut audio = text.as_bytes().to_vec();
        if self.stamp_calls {
            audio.extend(format!("#{call}").bytes());
        }
        Ok(SynthesizedAudio {
            audio,
            duration_ms: 2000 + 10 * text.len() as u64,
            format: voice.file_extension().to_string(),
        })
    }
}

// ---------------------------------------------------------------------------
// Rendering and visuals
// ---------------------------------------------------------------------------

/// Writes the concatenated clip bytes and reports the planned duration
/// plus a fixed drift.
pub struct FakeRenderer {
    calls: AtomicUsize,
    drift_ms: u64,
}

impl FakeRenderer {
    pub fn new() -> Self {
        Self::with_drift(0)
    }

    pub fn with_drift(drift_ms: u64) -> Self {
        Self {
            calls: AtomicUsize::new(0),
            drift_ms,
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Renderer for FakeRenderer {
    async fn render(
        &self,
        timeline: &Timeline,
        clips: &[AudioClip],
        output_dir: &Path,
    ) -> Result<RenderedMedia> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let bytes: Vec<u8> = clips.iter().flat_map(|c| c.audio.iter().copied()).collect();
        let path = output_dir.join(ARTIFACT_NAME);
        std::fs::write(&path, &bytes).unwrap();
        Ok(RenderedMedia {
            path,
            duration_ms: timeline.total_duration_ms() + self.drift_ms,
            sha256: sha256_hex(&bytes),
        })
    }
}

/// A PNG path for every segment except those listed as missing.
pub struct TestVisuals {
    pub missing: Vec<usize>,
}

impl VisualAssetProvider for TestVisuals {
    fn asset_for(&self, segment_index: usize) -> Option<VisualAsset> {
        (!self.missing.contains(&segment_index))
            .then(|| VisualAsset::from_path(format!("/visuals/segment_{segment_index}.png")))
    }
}

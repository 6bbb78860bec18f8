//! Core domain types for Showrunner episodes.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Result, ShowrunnerError};

// ---------------------------------------------------------------------------
// Corpus
// ---------------------------------------------------------------------------

/// A source document (e.g. one commentary talk). Immutable once ingested.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CorpusDocument {
    /// Stable identifier, unique within a corpus.
    pub id: String,
    /// Display title.
    pub title: String,
    /// Reference locator (URL or citation string).
    #[serde(default)]
    pub locator: String,
    /// Full text.
    pub text: String,
}

// ---------------------------------------------------------------------------
// EpisodeSpec
// ---------------------------------------------------------------------------

/// The request for one episode: topic, target passages, and segment bounds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EpisodeSpec {
    /// Stable identifier for the episode (e.g. `2025-week-07`).
    pub episode_id: String,
    /// Topic or lesson title.
    pub topic: String,
    /// Target passage references, e.g. `["Genesis 1-2", "Moses 2-3"]`.
    #[serde(default)]
    pub passages: Vec<String>,
    #[serde(default = "default_min_segments")]
    pub min_segments: usize,
    #[serde(default = "default_max_segments")]
    pub max_segments: usize,
    /// First day of the study week, used for scheduling the publish date.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub week_start: Option<NaiveDate>,
}

fn default_min_segments() -> usize {
    4
}
fn default_max_segments() -> usize {
    6
}

impl EpisodeSpec {
    /// Check the spec is usable before any work is done.
    pub fn validate(&self) -> Result<()> {
        if self.episode_id.trim().is_empty() {
            return Err(ShowrunnerError::validation("episode_id must not be empty"));
        }
        if self.topic.trim().is_empty() {
            return Err(ShowrunnerError::validation("topic must not be empty"));
        }
        if self.min_segments == 0 || self.min_segments > self.max_segments {
            return Err(ShowrunnerError::validation(format!(
                "segment bounds must satisfy 1 <= min <= max, got {}..={}",
                self.min_segments, self.max_segments
            )));
        }
        Ok(())
    }

    /// Retrieval queries derived from the spec: the topic, then each passage,
    /// without duplicates and in that order.
    pub fn queries(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        std::iter::once(&self.topic)
            .chain(self.passages.iter())
            .map(|q| q.trim().to_string())
            .filter(|q| !q.is_empty() && seen.insert(q.clone()))
            .collect()
    }

    /// Primary passage reference used in display titles (falls back to topic).
    pub fn primary_reference(&self) -> &str {
        self.passages
            .first()
            .map(String::as_str)
            .unwrap_or(&self.topic)
    }
}

// ---------------------------------------------------------------------------
// Retrieval
// ---------------------------------------------------------------------------

/// One ranked hit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievalHit {
    pub document_id: String,
    pub score: f64,
}

/// Ranked hits for one query. Rank order is significant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievalResult {
    /// Position of this query in [`EpisodeSpec::queries`].
    pub query_index: usize,
    pub query: String,
    pub hits: Vec<RetrievalHit>,
}

impl RetrievalResult {
    /// Whether `document_id` was retrieved for this query.
    pub fn contains(&self, document_id: &str) -> bool {
        self.hits.iter().any(|h| h.document_id == document_id)
    }

    /// Retrieved document ids in rank order.
    pub fn document_ids(&self) -> Vec<&str> {
        self.hits.iter().map(|h| h.document_id.as_str()).collect()
    }
}

// ---------------------------------------------------------------------------
// Script
// ---------------------------------------------------------------------------

/// One narrated segment of the script.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScriptSegment {
    pub index: usize,
    /// Chapter heading.
    pub title: String,
    /// Text to be spoken.
    pub narration: String,
    /// The retrieval query whose results ground this segment.
    pub query_index: usize,
    /// Document ids cited by this segment.
    #[serde(default)]
    pub citations: Vec<String>,
}

/// A validated, grounded script.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeneratedScript {
    pub title: String,
    pub description: String,
    pub segments: Vec<ScriptSegment>,
}

impl GeneratedScript {
    /// Check the structural invariant: segment indices are `0..n` in order.
    pub fn validate(&self) -> Result<()> {
        if self.segments.is_empty() {
            return Err(ShowrunnerError::validation("script has no segments"));
        }
        for (position, segment) in self.segments.iter().enumerate() {
            if segment.index != position {
                return Err(ShowrunnerError::validation(format!(
                    "segment at position {position} has index {}",
                    segment.index
                )));
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Audio
// ---------------------------------------------------------------------------

/// Voice settings for speech synthesis. Part of the audio cache key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoiceConfig {
    pub voice_id: String,
    pub model_id: String,
    pub output_format: String,
    pub stability: f32,
    pub similarity_boost: f32,
    pub style: f32,
}

impl VoiceConfig {
    /// File extension matching `output_format` (e.g. `mp3_22050_32` -> `mp3`).
    pub fn file_extension(&self) -> &str {
        self.output_format
            .split('_')
            .next()
            .filter(|ext| !ext.is_empty())
            .unwrap_or("mp3")
    }
}

/// Synthesized audio for one segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioClip {
    pub segment_index: usize,
    /// Content hash of (spoken text, voice config).
    pub cache_key: String,
    pub duration_ms: u64,
    /// File extension of the encoded audio (`mp3`, `wav`, ...).
    pub format: String,
    pub audio: Vec<u8>,
}

// ---------------------------------------------------------------------------
// Timeline
// ---------------------------------------------------------------------------

/// Kind of visual shown during a segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VisualKind {
    Image,
    Video,
}

/// A still image or video clip shown while a segment plays.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VisualAsset {
    pub path: PathBuf,
    pub kind: VisualKind,
}

impl VisualAsset {
    /// Build an asset, inferring the kind from the file extension.
    pub fn from_path(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref().to_path_buf();
        let kind = match path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .as_deref()
        {
            Some("mp4" | "mov" | "mkv" | "webm") => VisualKind::Video,
            _ => VisualKind::Image,
        };
        Self { path, kind }
    }
}

/// A placed segment on the timeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimelineEntry {
    pub segment_index: usize,
    pub title: String,
    pub visual: VisualAsset,
    pub start_ms: u64,
    pub duration_ms: u64,
}

impl TimelineEntry {
    pub fn end_ms(&self) -> u64 {
        self.start_ms + self.duration_ms
    }
}

/// Ordered placement of segments; consecutive entries overlap by the
/// transition duration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timeline {
    pub entries: Vec<TimelineEntry>,
    pub transition_ms: u64,
    /// Text drawn over the whole video (title and passage).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caption: Option<String>,
}

impl Timeline {
    /// End of the last entry, i.e. `sum(durations) - (n - 1) * transition`.
    pub fn total_duration_ms(&self) -> u64 {
        self.entries.last().map(TimelineEntry::end_ms).unwrap_or(0)
    }
}

/// A chapter marker in the published description.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chapter {
    pub start_ms: u64,
    pub title: String,
}

// ---------------------------------------------------------------------------
// Episode
// ---------------------------------------------------------------------------

/// The final rendered episode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Episode {
    pub episode_id: String,
    pub title: String,
    pub description: String,
    pub artifact_path: PathBuf,
    pub artifact_sha256: String,
    /// Plain-text transcript written next to the artifact.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transcript_path: Option<PathBuf>,
    pub duration_ms: u64,
    pub chapters: Vec<Chapter>,
    pub timeline: Timeline,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Run state
// ---------------------------------------------------------------------------

/// A working stage of the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Retrieving,
    Generating,
    Synthesizing,
    Assembling,
}

impl Stage {
    pub const ALL: [Stage; 4] = [
        Stage::Retrieving,
        Stage::Generating,
        Stage::Synthesizing,
        Stage::Assembling,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Retrieving => "retrieving",
            Self::Generating => "generating",
            Self::Synthesizing => "synthesizing",
            Self::Assembling => "assembling",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.as_str() == value)
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Persisted state of a pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Running(Stage),
    Done,
    Failed(Stage),
}

impl RunState {
    /// Storage encoding: `(state, failed_stage)`.
    pub fn to_columns(&self) -> (&'static str, Option<&'static str>) {
        match self {
            Self::Running(stage) => (stage.as_str(), None),
            Self::Done => ("done", None),
            Self::Failed(stage) => ("failed", Some(stage.as_str())),
        }
    }

    pub fn from_columns(state: &str, failed_stage: Option<&str>) -> Option<Self> {
        match state {
            "done" => Some(Self::Done),
            "failed" => failed_stage.and_then(Stage::parse).map(Self::Failed),
            other => Stage::parse(other).map(Self::Running),
        }
    }
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Running(stage) => write!(f, "{}", stage.as_str().to_uppercase()),
            Self::Done => f.write_str("DONE"),
            Self::Failed(stage) => write!(f, "FAILED({})", stage.as_str().to_uppercase()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> EpisodeSpec {
        EpisodeSpec {
            episode_id: "2025-07".into(),
            topic: "Faith in Christ".into(),
            passages: vec!["Alma 32".into(), "Faith in Christ".into(), " Ether 12 ".into()],
            min_segments: 4,
            max_segments: 6,
            week_start: None,
        }
    }

    #[test]
    fn queries_dedupe_and_keep_order() {
        assert_eq!(spec().queries(), vec!["Faith in Christ", "Alma 32", "Ether 12"]);
    }

    #[test]
    fn spec_bounds_validated() {
        let mut s = spec();
        assert!(s.validate().is_ok());
        s.min_segments = 7;
        assert!(s.validate().is_err());
        s.min_segments = 0;
        assert!(s.validate().is_err());
    }

    #[test]
    fn spec_defaults_from_toml_like_json() {
        let s: EpisodeSpec =
            serde_json::from_str(r#"{"episode_id":"e1","topic":"Grace"}"#).expect("parse");
        assert_eq!((s.min_segments, s.max_segments), (4, 6));
        assert_eq!(s.primary_reference(), "Grace");
    }

    #[test]
    fn script_indices_must_be_contiguous() {
        let seg = |index| ScriptSegment {
            index,
            title: "t".into(),
            narration: "n".into(),
            query_index: 0,
            citations: vec![],
        };
        let mut script = GeneratedScript {
            title: "T".into(),
            description: "D".into(),
            segments: vec![seg(0), seg(1), seg(2)],
        };
        assert!(script.validate().is_ok());
        script.segments[2].index = 3;
        assert!(script.validate().is_err());
    }

    #[test]
    fn visual_kind_inferred() {
        assert_eq!(VisualAsset::from_path("a/b.PNG").kind, VisualKind::Image);
        assert_eq!(VisualAsset::from_path("a/b.mp4").kind, VisualKind::Video);
    }

    #[test]
    fn run_state_columns_roundtrip() {
        for state in [
            RunState::Running(Stage::Generating),
            RunState::Done,
            RunState::Failed(Stage::Synthesizing),
        ] {
            let (s, f) = state.to_columns();
            assert_eq!(RunState::from_columns(s, f), Some(state));
        }
        assert_eq!(
            RunState::Failed(Stage::Assembling).to_string(),
            "FAILED(ASSEMBLING)"
        );
    }

    #[test]
    fn voice_extension() {
        let voice = VoiceConfig {
            voice_id: "v".into(),
            model_id: "m".into(),
            output_format: "mp3_22050_32".into(),
            stability: 0.34,
            similarity_boost: 0.8,
            style: 0.2,
        };
        assert_eq!(voice.file_extension(), "mp3");
    }
}

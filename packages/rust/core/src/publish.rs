//! Handing a finished episode to a publishing destination.
//!
//! The pipeline stops at a rendered [`Episode`]. A [`Publisher`] takes it
//! from there; [`OutboxPublisher`] drops the artifact and its metadata into
//! a local outbox for an uploader to pick up.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDate, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

use showrunner_shared::{Episode, EpisodeSpec, Result, ShowrunnerError};

/// Upload metadata for one episode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishMetadata {
    pub title: String,
    pub description: String,
    pub tags: Vec<String>,
    /// Scheduled go-live time.
    pub publish_at: DateTime<Utc>,
    /// Visibility until `publish_at`.
    pub privacy: String,
}

/// What the destination reported back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishConfirmation {
    /// Where the episode ended up (path or URL).
    pub location: String,
    pub publish_at: DateTime<Utc>,
}

#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(
        &self,
        episode: &Episode,
        metadata: &PublishMetadata,
    ) -> Result<PublishConfirmation>;
}

/// The day before the study week starts at `hour_utc`, or one hour from
/// `now` when that moment has already passed or no week is known.
pub fn publish_schedule(
    week_start: Option<NaiveDate>,
    hour_utc: u32,
    now: DateTime<Utc>,
) -> DateTime<Utc> {
    let fallback = now + Duration::hours(1);
    let Some(week_start) = week_start else {
        return fallback;
    };

    let scheduled = week_start
        .pred_opt()
        .and_then(|day| day.and_hms_opt(hour_utc.min(23), 0, 0))
        .map(|naive| Utc.from_utc_datetime(&naive));

    match scheduled {
        Some(at) if at >= now => at,
        _ => fallback,
    }
}

/// Metadata for `episode`: `"{passage} | {title}"`, the chaptered
/// description, and the configured tags.
pub fn build_metadata(
    spec: &EpisodeSpec,
    episode: &Episode,
    tags: &[String],
    hour_utc: u32,
    now: DateTime<Utc>,
) -> PublishMetadata {
    PublishMetadata {
        title: format!("{} | {}", spec.primary_reference(), episode.title),
        description: episode.description.clone(),
        tags: tags.to_vec(),
        publish_at: publish_schedule(spec.week_start, hour_utc, now),
        privacy: "private".into(),
    }
}

// ---------------------------------------------------------------------------
// Outbox
// ---------------------------------------------------------------------------

/// Copies `{episode_id}.mp4`, `{episode_id}.json` and, when the episode
/// has one, the `{episode_id}.txt` transcript into a directory.
pub struct OutboxPublisher {
    dir: PathBuf,
}

#[derive(Serialize)]
struct OutboxRecord<'a> {
    episode_id: &'a str,
    artifact_sha256: &'a str,
    duration_ms: u64,
    #[serde(flatten)]
    metadata: &'a PublishMetadata,
}

impl OutboxPublisher {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

#[async_trait]
impl Publisher for OutboxPublisher {
    #[instrument(skip_all, fields(episode = %episode.episode_id, outbox = %self.dir.display()))]
    async fn publish(
        &self,
        episode: &Episode,
        metadata: &PublishMetadata,
    ) -> Result<PublishConfirmation> {
        std::fs::create_dir_all(&self.dir).map_err(|e| ShowrunnerError::io(&self.dir, e))?;

        let extension = episode
            .artifact_path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("mp4");
        let video = self.dir.join(format!("{}.{extension}", episode.episode_id));
        copy_atomic(&episode.artifact_path, &video)?;
        if let Some(transcript) = &episode.transcript_path {
            copy_atomic(transcript, &self.dir.join(format!("{}.txt", episode.episode_id)))?;
        }

        let record = OutboxRecord {
            episode_id: &episode.episode_id,
            artifact_sha256: &episode.artifact_sha256,
            duration_ms: episode.duration_ms,
            metadata,
        };
        write_json(&self.dir.join(format!("{}.json", episode.episode_id)), &record)?;

        info!(path = %video.display(), publish_at = %metadata.publish_at, "episode placed in outbox");
        Ok(PublishConfirmation {
            location: video.display().to_string(),
            publish_at: metadata.publish_at,
        })
    }
}

fn copy_atomic(from: &Path, to: &Path) -> Result<()> {
    let temp = to.with_extension("partial");
    std::fs::copy(from, &temp).map_err(|e| {
        ShowrunnerError::Publish(format!("copy {} -> {}: {e}", from.display(), temp.display()))
    })?;
    std::fs::rename(&temp, to).map_err(|e| ShowrunnerError::io(to, e))?;
    Ok(())
}

fn write_json<T: Serialize>(path: &Path, data: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(data)
        .map_err(|e| ShowrunnerError::Publish(format!("metadata serialization failed: {e}")))?;
    let temp = path.with_extension("json.tmp");
    std::fs::write(&temp, json).map_err(|e| ShowrunnerError::io(&temp, e))?;
    std::fs::rename(&temp, path).map_err(|e| ShowrunnerError::io(path, e))?;
    debug!(path = %path.display(), "wrote JSON file");
    Ok(())
}

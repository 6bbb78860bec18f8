//! Episode assembly: timeline layout, rendering, and verification.
//!
//! Clips are laid end to end in segment order. Consecutive entries overlap
//! by the transition so the crossfade eats into both sides; the planned
//! length is therefore `sum(durations) - (n - 1) * transition`. Rendering
//! starts only once every clip and visual is resolved, and the rendered
//! artifact's probed duration must land within the configured tolerance of
//! the plan. A transcript is written next to the accepted artifact.

use std::collections::BTreeMap;
use std::path::Path;

use chrono::Utc;
use tracing::{debug, info, instrument};

use showrunner_shared::{
    AssemblyConfig, AudioClip, Episode, EpisodeSpec, GeneratedScript, Result, ShowrunnerError,
    Timeline, TimelineEntry, VisualAsset,
};

use crate::chapters::{build_chapters, episode_description};
use crate::render::Renderer;
use crate::transcript::{TRANSCRIPT_NAME, build_transcript, write_transcript};

/// Timing settings for assembly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AssemblySettings {
    /// Overlap between consecutive segments.
    pub transition_ms: u64,
    /// Largest accepted gap between planned and rendered duration.
    pub duration_tolerance_ms: u64,
}

impl From<&AssemblyConfig> for AssemblySettings {
    fn from(config: &AssemblyConfig) -> Self {
        Self {
            transition_ms: config.transition_ms,
            duration_tolerance_ms: config.duration_tolerance_ms,
        }
    }
}

/// Lay out clips against their visuals.
///
/// Fails with [`ShowrunnerError::Assembly`] if clips do not match the
/// script's segments one to one and in order, if a segment has no visual,
/// or if a clip is too short to crossfade.
pub fn build_timeline(
    script: &GeneratedScript,
    clips: &[AudioClip],
    visuals: &BTreeMap<usize, VisualAsset>,
    transition_ms: u64,
) -> Result<Timeline> {
    if clips.len() != script.segments.len() {
        return Err(ShowrunnerError::assembly(format!(
            "{} clips for {} segments",
            clips.len(),
            script.segments.len()
        )));
    }
    if clips.is_empty() {
        return Err(ShowrunnerError::assembly("nothing to assemble"));
    }

    let crossfaded = clips.len() > 1;
    let mut entries: Vec<TimelineEntry> = Vec::with_capacity(clips.len());

    for (position, (segment, clip)) in script.segments.iter().zip(clips).enumerate() {
        if clip.segment_index != position || segment.index != position {
            return Err(ShowrunnerError::assembly(format!(
                "clip at position {position} belongs to segment {}",
                clip.segment_index
            )));
        }
        if crossfaded && clip.duration_ms <= transition_ms {
            return Err(ShowrunnerError::assembly(format!(
                "segment {position} is {} ms long, not longer than the {transition_ms} ms transition",
                clip.duration_ms
            )));
        }
        if clip.duration_ms == 0 {
            return Err(ShowrunnerError::assembly(format!(
                "segment {position} has an empty clip"
            )));
        }

        let visual = visuals.get(&position).cloned().ok_or_else(|| {
            ShowrunnerError::assembly(format!("no visual asset for segment {position}"))
        })?;

        let start_ms = match entries.last() {
            Some(previous) => previous.end_ms() - transition_ms,
            None => 0,
        };

        entries.push(TimelineEntry {
            segment_index: position,
            title: segment.title.clone(),
            visual,
            start_ms,
            duration_ms: clip.duration_ms,
        });
    }

    let timeline = Timeline {
        entries,
        transition_ms,
        caption: None,
    };
    debug!(
        entries = timeline.entries.len(),
        total_ms = timeline.total_duration_ms(),
        "timeline built"
    );
    Ok(timeline)
}

/// Builds and renders the final episode.
pub struct EpisodeAssembler<'a> {
    renderer: &'a dyn Renderer,
    settings: AssemblySettings,
}

impl<'a> EpisodeAssembler<'a> {
    pub fn new(renderer: &'a dyn Renderer, settings: AssemblySettings) -> Self {
        Self { renderer, settings }
    }

    #[instrument(skip_all, fields(episode = %spec.episode_id, clips = clips.len()))]
    pub async fn assemble(
        &self,
        spec: &EpisodeSpec,
        script: &GeneratedScript,
        clips: &[AudioClip],
        visuals: &BTreeMap<usize, VisualAsset>,
        output_dir: &Path,
    ) -> Result<Episode> {
        let mut timeline = build_timeline(script, clips, visuals, self.settings.transition_ms)?;
        let reference = spec.primary_reference();
        timeline.caption = Some(format!("{}\n({reference})", script.title));
        let planned_ms = timeline.total_duration_ms();

        std::fs::create_dir_all(output_dir).map_err(|e| ShowrunnerError::io(output_dir, e))?;
        let rendered = self.renderer.render(&timeline, clips, output_dir).await?;

        let drift = rendered.duration_ms.abs_diff(planned_ms);
        if drift > self.settings.duration_tolerance_ms {
            return Err(ShowrunnerError::assembly(format!(
                "rendered duration {} ms differs from planned {planned_ms} ms by {drift} ms (tolerance {} ms)",
                rendered.duration_ms, self.settings.duration_tolerance_ms
            )));
        }

        let transcript_path = output_dir.join(TRANSCRIPT_NAME);
        write_transcript(
            &transcript_path,
            &build_transcript(script, reference, &timeline),
        )?;

        let chapters = build_chapters(&timeline);
        info!(
            path = %rendered.path.display(),
            duration_ms = rendered.duration_ms,
            chapters = chapters.len(),
            "episode assembled"
        );

        Ok(Episode {
            episode_id: spec.episode_id.clone(),
            title: script.title.clone(),
            description: episode_description(&script.description, &chapters),
            artifact_path: rendered.path,
            artifact_sha256: rendered.sha256,
            transcript_path: Some(transcript_path),
            duration_ms: rendered.duration_ms,
            chapters,
            timeline,
            created_at: Utc::now(),
        })
    }
}

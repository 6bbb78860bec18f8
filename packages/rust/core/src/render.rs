//! Rendering a timeline into a video file.
//!
//! [`FfmpegRenderer`] shells out to `ffmpeg` with one filter graph: every
//! visual is scaled and padded to the frame, every narration track is padded
//! or trimmed to its planned duration, consecutive segments are joined with
//! `xfade` (video) and `acrossfade` (audio) over the transition, and the
//! timeline caption is drawn near the bottom of the frame. The result is
//! encoded with libx264/aac, written to a temp name and renamed into place,
//! then probed with `ffprobe`.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info, instrument, warn};

use showrunner_shared::{
    AssemblyConfig, AudioClip, Result, ShowrunnerError, Timeline, VisualKind, sha256_hex,
};

/// File name of the rendered episode inside the output directory.
pub const ARTIFACT_NAME: &str = "episode.mp4";

/// Caption text handed to `drawtext` through a file in the work dir.
const CAPTION_FILE: &str = "caption.txt";

/// Distance from the bottom edge to the caption's center line.
const CAPTION_BOTTOM_MARGIN: u32 = 90;

/// Lines of ffmpeg stderr kept in a render error.
const STDERR_TAIL_LINES: usize = 15;

/// A rendered artifact and what was measured from it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedMedia {
    pub path: PathBuf,
    /// Duration reported by probing the file.
    pub duration_ms: u64,
    pub sha256: String,
}

/// Turns a resolved timeline and its clips into a media file.
#[async_trait]
pub trait Renderer: Send + Sync {
    async fn render(
        &self,
        timeline: &Timeline,
        clips: &[AudioClip],
        output_dir: &Path,
    ) -> Result<RenderedMedia>;
}

/// Frame and tool settings for [`FfmpegRenderer`].
#[derive(Debug, Clone)]
pub struct RenderSettings {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub ffmpeg: String,
    pub ffprobe: String,
    /// Draw the timeline caption over the video.
    pub title_overlay: bool,
    pub font_size: u32,
    pub font_file: Option<String>,
}

impl From<&AssemblyConfig> for RenderSettings {
    fn from(config: &AssemblyConfig) -> Self {
        Self {
            width: config.width,
            height: config.height,
            fps: config.fps,
            ffmpeg: config.ffmpeg.clone(),
            ffprobe: config.ffprobe.clone(),
            title_overlay: config.title_overlay,
            font_size: config.font_size,
            font_file: config.font_file.clone(),
        }
    }
}

impl RenderSettings {
    /// Everything that changes the rendered file, excluding tool paths.
    pub fn profile(&self) -> String {
        let mut profile = format!("{}x{}@{}", self.width, self.height, self.fps);
        if self.title_overlay {
            profile.push_str(&format!(" caption:{}", self.font_size));
            if let Some(font) = &self.font_file {
                profile.push_str(&format!(":{font}"));
            }
        }
        profile
    }
}

pub struct FfmpegRenderer {
    settings: RenderSettings,
}

impl FfmpegRenderer {
    pub fn new(settings: RenderSettings) -> Self {
        Self { settings }
    }

    /// Probe a media file's duration in milliseconds.
    pub async fn probe_duration_ms(&self, path: &Path) -> Result<u64> {
        let output = Command::new(&self.settings.ffprobe)
            .args([
                "-v",
                "error",
                "-show_entries",
                "format=duration",
                "-of",
                "default=noprint_wrappers=1:nokey=1",
            ])
            .arg(path)
            .output()
            .await
            .map_err(|e| {
                ShowrunnerError::Render(format!(
                    "failed to run {}: {e}. Is it installed?",
                    self.settings.ffprobe
                ))
            })?;

        if !output.status.success() {
            return Err(ShowrunnerError::Render(format!(
                "ffprobe failed on {}: {}",
                path.display(),
                stderr_tail(&output.stderr)
            )));
        }

        let text = String::from_utf8_lossy(&output.stdout);
        let seconds: f64 = text.trim().parse().map_err(|_| {
            ShowrunnerError::Render(format!("unparseable ffprobe duration: {:?}", text.trim()))
        })?;
        Ok((seconds * 1000.0).round() as u64)
    }
}

#[async_trait]
impl Renderer for FfmpegRenderer {
    #[instrument(skip_all, fields(entries = timeline.entries.len(), out = %output_dir.display()))]
    async fn render(
        &self,
        timeline: &Timeline,
        clips: &[AudioClip],
        output_dir: &Path,
    ) -> Result<RenderedMedia> {
        if timeline.entries.len() != clips.len() || timeline.entries.is_empty() {
            return Err(ShowrunnerError::Render(format!(
                "timeline has {} entries but {} clips were given",
                timeline.entries.len(),
                clips.len()
            )));
        }

        let work_dir = output_dir.join(format!(".work-{}", uuid::Uuid::now_v7()));
        tokio::fs::create_dir_all(&work_dir)
            .await
            .map_err(|e| ShowrunnerError::io(&work_dir, e))?;

        let result = self.render_in(timeline, clips, output_dir, &work_dir).await;

        if let Err(e) = tokio::fs::remove_dir_all(&work_dir).await {
            warn!(dir = %work_dir.display(), error = %e, "failed to remove render work dir");
        }
        result
    }
}

impl FfmpegRenderer {
    async fn render_in(
        &self,
        timeline: &Timeline,
        clips: &[AudioClip],
        output_dir: &Path,
        work_dir: &Path,
    ) -> Result<RenderedMedia> {
        let mut audio_paths = Vec::with_capacity(clips.len());
        for clip in clips {
            let path = work_dir.join(format!("clip_{}.{}", clip.segment_index, clip.format));
            tokio::fs::write(&path, &clip.audio)
                .await
                .map_err(|e| ShowrunnerError::io(&path, e))?;
            audio_paths.push(path);
        }

        let caption_path = match timeline.caption.as_deref() {
            Some(caption) if self.settings.title_overlay => {
                let path = work_dir.join(CAPTION_FILE);
                tokio::fs::write(&path, caption)
                    .await
                    .map_err(|e| ShowrunnerError::io(&path, e))?;
                Some(path)
            }
            _ => None,
        };

        let target = output_dir.join(ARTIFACT_NAME);
        let temp = output_dir.join(format!(".{ARTIFACT_NAME}.tmp.mp4"));
        let args = build_ffmpeg_args(
            timeline,
            &audio_paths,
            &self.settings,
            caption_path.as_deref(),
            &temp,
        );
        debug!(args = args.len(), "invoking ffmpeg");

        let output = Command::new(&self.settings.ffmpeg)
            .args(&args)
            .output()
            .await
            .map_err(|e| {
                ShowrunnerError::Render(format!(
                    "failed to run {}: {e}. Is it installed?",
                    self.settings.ffmpeg
                ))
            })?;

        if !output.status.success() {
            let _ = tokio::fs::remove_file(&temp).await;
            return Err(ShowrunnerError::Render(format!(
                "ffmpeg exited with {}: {}",
                output.status,
                stderr_tail(&output.stderr)
            )));
        }

        tokio::fs::rename(&temp, &target)
            .await
            .map_err(|e| ShowrunnerError::io(&target, e))?;

        let duration_ms = self.probe_duration_ms(&target).await?;
        let bytes = tokio::fs::read(&target)
            .await
            .map_err(|e| ShowrunnerError::io(&target, e))?;

        info!(path = %target.display(), duration_ms, bytes = bytes.len(), "episode rendered");

        Ok(RenderedMedia {
            path: target,
            duration_ms,
            sha256: sha256_hex(&bytes),
        })
    }
}

// ---------------------------------------------------------------------------
// Command construction
// ---------------------------------------------------------------------------

/// Full ffmpeg argument list for `timeline`.
///
/// Inputs alternate visual/audio per entry, so entry `i` has its visual at
/// input `2i` and its narration at input `2i + 1`. No output duration is
/// forced: the length comes from the filter graph, so probing the result
/// checks the layout.
pub fn build_ffmpeg_args(
    timeline: &Timeline,
    audio_paths: &[PathBuf],
    settings: &RenderSettings,
    caption_file: Option<&Path>,
    output: &Path,
) -> Vec<String> {
    let mut args: Vec<String> = vec!["-y".into(), "-hide_banner".into()];

    for (entry, audio) in timeline.entries.iter().zip(audio_paths) {
        let hold = seconds(entry.duration_ms);
        match entry.visual.kind {
            VisualKind::Image => args.extend(["-loop".into(), "1".into()]),
            VisualKind::Video => args.extend(["-stream_loop".into(), "-1".into()]),
        }
        args.extend([
            "-t".into(),
            hold,
            "-i".into(),
            entry.visual.path.display().to_string(),
            "-i".into(),
            audio.display().to_string(),
        ]);
    }

    args.extend([
        "-filter_complex".into(),
        filter_graph(timeline, settings, caption_file),
        "-map".into(),
        "[vout]".into(),
        "-map".into(),
        "[aout]".into(),
        "-c:v".into(),
        "libx264".into(),
        "-pix_fmt".into(),
        "yuv420p".into(),
        "-r".into(),
        settings.fps.to_string(),
        "-c:a".into(),
        "aac".into(),
        "-movflags".into(),
        "+faststart".into(),
        output.display().to_string(),
    ]);
    args
}

fn filter_graph(timeline: &Timeline, settings: &RenderSettings, caption_file: Option<&Path>) -> String {
    let (w, h, fps) = (settings.width, settings.height, settings.fps);
    let fade = seconds(timeline.transition_ms);
    let mut parts = Vec::new();

    for (i, entry) in timeline.entries.iter().enumerate() {
        parts.push(format!(
            "[{}:v]scale={w}:{h}:force_original_aspect_ratio=decrease,\
             pad={w}:{h}:(ow-iw)/2:(oh-ih)/2,setsar=1,fps={fps},format=yuv420p[v{i}]",
            2 * i
        ));
        // Encoded clips run past the last spoken word; hold each track to
        // the planned length so audio stays on the video's transitions.
        parts.push(format!(
            "[{}:a]apad,atrim=duration={},asetpts=PTS-STARTPTS[s{i}]",
            2 * i + 1,
            seconds(entry.duration_ms)
        ));
    }

    if timeline.entries.len() == 1 {
        parts.push("[v0]null[vjoin]".into());
        parts.push("[s0]anull[aout]".into());
    } else {
        let last = timeline.entries.len() - 1;
        let mut video_in = "v0".to_string();
        let mut audio_in = "s0".to_string();
        for (k, entry) in timeline.entries.iter().enumerate().skip(1) {
            let (video_out, audio_out) = if k == last {
                ("vjoin".to_string(), "aout".to_string())
            } else {
                (format!("x{k}"), format!("a{k}"))
            };
            parts.push(format!(
                "[{video_in}][v{k}]xfade=transition=fade:duration={fade}:offset={}[{video_out}]",
                seconds(entry.start_ms)
            ));
            parts.push(format!("[{audio_in}][s{k}]acrossfade=d={fade}[{audio_out}]"));
            video_in = video_out;
            audio_in = audio_out;
        }
    }

    match caption_file {
        Some(path) => parts.push(format!("[vjoin]{}[vout]", drawtext(path, settings))),
        None => parts.push("[vjoin]null[vout]".into()),
    }

    parts.join(";")
}

fn drawtext(caption_file: &Path, settings: &RenderSettings) -> String {
    let mut filter = format!(
        "drawtext=textfile={}:fontcolor=white:fontsize={}:line_spacing=12:\
         x=(w-text_w)/2:y=h-{CAPTION_BOTTOM_MARGIN}-text_h/2",
        quote_filter_value(&caption_file.display().to_string()),
        settings.font_size
    );
    if let Some(font) = &settings.font_file {
        filter.push_str(&format!(":fontfile={}", quote_filter_value(font)));
    }
    filter
}

/// Single-quote a filter option value; embedded quotes are closed, escaped,
/// and reopened.
fn quote_filter_value(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

fn seconds(ms: u64) -> String {
    format!("{}.{:03}", ms / 1000, ms % 1000)
}

fn stderr_tail(stderr: &[u8]) -> String {
    let text = String::from_utf8_lossy(stderr);
    let lines: Vec<&str> = text.lines().collect();
    let start = lines.len().saturating_sub(STDERR_TAIL_LINES);
    lines[start..].join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use showrunner_shared::{TimelineEntry, VisualAsset};

    fn settings() -> RenderSettings {
        RenderSettings {
            width: 1920,
            height: 1080,
            fps: 24,
            ffmpeg: "ffmpeg".into(),
            ffprobe: "ffprobe".into(),
            title_overlay: true,
            font_size: 60,
            font_file: None,
        }
    }

    fn timeline() -> Timeline {
        Timeline {
            transition_ms: 1000,
            entries: vec![
                TimelineEntry {
                    segment_index: 0,
                    title: "Intro".into(),
                    visual: VisualAsset::from_path("/v/segment_0.png"),
                    start_ms: 0,
                    duration_ms: 5000,
                },
                TimelineEntry {
                    segment_index: 1,
                    title: "Middle".into(),
                    visual: VisualAsset::from_path("/v/segment_1.mp4"),
                    start_ms: 4000,
                    duration_ms: 6500,
                },
                TimelineEntry {
                    segment_index: 2,
                    title: "End".into(),
                    visual: VisualAsset::from_path("/v/segment_2.png"),
                    start_ms: 9500,
                    duration_ms: 3000,
                },
            ],
            caption: Some("Faith Like a Seed\n(Alma 32)".into()),
        }
    }

    #[test]
    fn seconds_formatting() {
        assert_eq!(seconds(0), "0.000");
        assert_eq!(seconds(12_345), "12.345");
    }

    #[test]
    fn args_loop_stills_and_videos() {
        let audio: Vec<PathBuf> = (0..3).map(|i| PathBuf::from(format!("/w/clip_{i}.mp3"))).collect();
        let args = build_ffmpeg_args(&timeline(), &audio, &settings(), None, Path::new("/o/out.mp4"));
        let joined = args.join(" ");

        assert!(joined.contains("-loop 1 -t 5.000 -i /v/segment_0.png -i /w/clip_0.mp3"));
        assert!(joined.contains("-stream_loop -1 -t 6.500 -i /v/segment_1.mp4 -i /w/clip_1.mp3"));
        // Output length is left to the filter graph.
        assert!(!joined.contains("-t 12.500"));
        assert_eq!(args.last().map(String::as_str), Some("/o/out.mp4"));
    }

    #[test]
    fn filter_chains_transitions_at_entry_starts() {
        let graph = filter_graph(&timeline(), &settings(), None);
        assert!(graph.contains("[v0][v1]xfade=transition=fade:duration=1.000:offset=4.000[x1]"));
        assert!(graph.contains("[x1][v2]xfade=transition=fade:duration=1.000:offset=9.500[vjoin]"));
        assert!(graph.contains("[s0][s1]acrossfade=d=1.000[a1]"));
        assert!(graph.contains("[a1][s2]acrossfade=d=1.000[aout]"));
        assert!(graph.ends_with("[vjoin]null[vout]"));
    }

    #[test]
    fn narration_is_held_to_planned_length() {
        let graph = filter_graph(&timeline(), &settings(), None);
        assert!(graph.contains("[1:a]apad,atrim=duration=5.000,asetpts=PTS-STARTPTS[s0]"));
        assert!(graph.contains("[3:a]apad,atrim=duration=6.500,asetpts=PTS-STARTPTS[s1]"));
        assert!(graph.contains("[5:a]apad,atrim=duration=3.000,asetpts=PTS-STARTPTS[s2]"));
    }

    #[test]
    fn caption_is_drawn_from_file() {
        let mut s = settings();
        s.font_file = Some("/fonts/Amiri-Bold.ttf".into());
        let graph = filter_graph(&timeline(), &s, Some(Path::new("/w/caption.txt")));
        assert!(graph.contains(
            "[vjoin]drawtext=textfile='/w/caption.txt':fontcolor=white:fontsize=60"
        ));
        assert!(graph.contains("y=h-90-text_h/2"));
        assert!(graph.ends_with(":fontfile='/fonts/Amiri-Bold.ttf'[vout]"));
    }

    #[test]
    fn profile_ignores_tool_paths() {
        let mut other = settings();
        other.ffmpeg = "/opt/bin/ffmpeg".into();
        assert_eq!(settings().profile(), other.profile());
        assert_eq!(settings().profile(), "1920x1080@24 caption:60");

        other.title_overlay = false;
        assert_eq!(other.profile(), "1920x1080@24");
    }

    #[test]
    fn filter_values_are_quoted() {
        assert_eq!(quote_filter_value("/a b/c.txt"), "'/a b/c.txt'");
        assert_eq!(quote_filter_value("it's"), r"'it'\''s'");
    }

    #[test]
    fn single_entry_needs_no_transitions() {
        let mut t = timeline();
        t.entries.truncate(1);
        let graph = filter_graph(&t, &settings(), None);
        assert!(!graph.contains("xfade"));
        assert!(graph.contains("[s0]anull[aout]"));
        assert!(graph.contains("[v0]null[vjoin]"));
    }

    #[test]
    fn stderr_is_tailed() {
        let noise: String = (0..40).map(|i| format!("line {i}\n")).collect();
        let tail = stderr_tail(noise.as_bytes());
        assert!(tail.starts_with("line 25"));
        assert!(tail.ends_with("line 39"));
    }
}

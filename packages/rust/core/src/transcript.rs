//! Plain-text transcript written next to the rendered episode.

use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;
use tracing::debug;

use showrunner_shared::{GeneratedScript, Result, ShowrunnerError, Timeline};

use crate::chapters::format_timestamp;

/// File name of the transcript inside the output directory.
pub const TRANSCRIPT_NAME: &str = "transcript.txt";

/// Title and passage, then every segment under its start time.
pub fn build_transcript(script: &GeneratedScript, reference: &str, timeline: &Timeline) -> String {
    let mut text = format!("{}\n{reference}\n", script.title);
    for (segment, entry) in script.segments.iter().zip(&timeline.entries) {
        text.push_str(&format!(
            "\n[{}] {}\n{}\n",
            format_timestamp(entry.start_ms),
            segment.title,
            readable(&segment.narration)
        ));
    }
    text
}

/// Narration with stage directions such as `[Pause]` removed.
fn readable(narration: &str) -> String {
    static DIRECTION_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"\s*\[[^\[\]]*\]").expect("valid regex"));
    static SPACES_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"[ \t]{2,}").expect("valid regex"));

    let stripped = DIRECTION_RE.replace_all(narration, "");
    SPACES_RE.replace_all(stripped.trim(), " ").into_owned()
}

/// Write atomically (temp file + rename).
pub fn write_transcript(path: &Path, transcript: &str) -> Result<()> {
    let temp = path.with_extension("txt.tmp");
    std::fs::write(&temp, transcript).map_err(|e| ShowrunnerError::io(&temp, e))?;
    std::fs::rename(&temp, path).map_err(|e| ShowrunnerError::io(path, e))?;
    debug!(path = %path.display(), "wrote transcript");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use showrunner_shared::{ScriptSegment, TimelineEntry, VisualAsset};

    fn script() -> GeneratedScript {
        GeneratedScript {
            title: "Faith Like a Seed".into(),
            description: "About faith.".into(),
            segments: ["Planting", "Growing"]
                .iter()
                .enumerate()
                .map(|(i, title)| ScriptSegment {
                    index: i,
                    title: title.to_string(),
                    narration: format!("Part {i} begins. [Pause]  Ponder it. [Pause for reflection]"),
                    query_index: 0,
                    citations: vec!["faith-1".into()],
                })
                .collect(),
        }
    }

    fn timeline() -> Timeline {
        Timeline {
            transition_ms: 1000,
            entries: (0..2)
                .map(|i| TimelineEntry {
                    segment_index: i,
                    title: format!("t{i}"),
                    visual: VisualAsset::from_path("bg.png"),
                    start_ms: i as u64 * 90_000,
                    duration_ms: 91_000,
                })
                .collect(),
            caption: None,
        }
    }

    #[test]
    fn segments_listed_under_start_times() {
        let text = build_transcript(&script(), "Alma 32", &timeline());
        assert_eq!(
            text,
            "Faith Like a Seed\nAlma 32\n\
             \n[00:00] Planting\nPart 0 begins. Ponder it.\n\
             \n[01:30] Growing\nPart 1 begins. Ponder it.\n"
        );
    }

    #[test]
    fn written_to_disk() {
        let dir = std::env::temp_dir().join(format!("showrunner-transcript-{}", uuid::Uuid::now_v7()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(TRANSCRIPT_NAME);

        write_transcript(&path, "hello\n").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "hello\n");
        assert!(!dir.join("transcript.txt.tmp").exists());

        let _ = std::fs::remove_dir_all(&dir);
    }
}

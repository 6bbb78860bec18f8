//! Chapter markers derived from the timeline.

use showrunner_shared::{Chapter, Timeline};

/// One chapter per timeline entry, starting where the entry starts.
pub fn build_chapters(timeline: &Timeline) -> Vec<Chapter> {
    timeline
        .entries
        .iter()
        .map(|entry| Chapter {
            start_ms: entry.start_ms,
            title: entry.title.clone(),
        })
        .collect()
}

/// `mm:ss` for a millisecond offset. Minutes are not wrapped into hours.
pub fn format_timestamp(ms: u64) -> String {
    let total_seconds = ms / 1000;
    format!("{:02}:{:02}", total_seconds / 60, total_seconds % 60)
}

/// Chapter list as `mm:ss - Title` lines.
pub fn format_chapters(chapters: &[Chapter]) -> String {
    chapters
        .iter()
        .map(|c| format!("{} - {}", format_timestamp(c.start_ms), c.title))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Published description: the script's summary followed by the chapter list.
pub fn episode_description(summary: &str, chapters: &[Chapter]) -> String {
    let summary = summary.trim();
    if chapters.is_empty() {
        return summary.to_string();
    }
    format!("{summary}\n\nTimestamps:\n{}", format_chapters(chapters))
}

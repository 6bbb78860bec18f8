//! Narration cleanup applied before speech synthesis.
//!
//! Each pass is a function `&str -> String` applied in sequence. The passes
//! rewrite scripture references and stage directions into text a speech
//! engine reads naturally. The normalized text is what gets hashed for the
//! audio cache, so any change here invalidates cached clips.

use std::sync::LazyLock;

use regex::{Captures, Regex};
use tracing::warn;

/// Short pause inserted for cue markers.
const SHORT_BREAK: &str = "<break time='1s'/>";

/// Longer pause for reflective cues.
const LONG_BREAK: &str = "<break time='2s'/>";

/// Run the full narration pipeline.
pub fn normalize(text: &str) -> String {
    let mut result = text.to_string();

    result = spell_out_ordinal_books(&result);
    result = expand_ranges(&result);
    result = expand_section_verse(&result);
    result = expand_chapter_verse(&result);
    result = replace_cue_markers(&result);
    result = strip_unknown_directions(&result);

    result
}

// ---------------------------------------------------------------------------
// Pass 1: Ordinal book names
// ---------------------------------------------------------------------------

/// `1 Nephi` -> `first Nephi`, for books that actually have numbered parts.
fn spell_out_ordinal_books(text: &str) -> String {
    static BOOK_RE: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(
            r"\b([1-4]) (Nephi|Samuel|Kings|Chronicles|Corinthians|Thessalonians|Timothy|Peter|John)\b",
        )
        .expect("valid regex")
    });

    BOOK_RE
        .replace_all(text, |caps: &Captures| {
            let book = &caps[2];
            let highest = match book {
                "Nephi" => 4,
                "John" => 3,
                _ => 2,
            };
            let ordinal = match &caps[1] {
                "1" => "first",
                "2" => "second",
                "3" if highest >= 3 => "third",
                "4" if highest >= 4 => "fourth",
                _ => return caps[0].to_string(),
            };
            format!("{ordinal} {book}")
        })
        .into_owned()
}

// ---------------------------------------------------------------------------
// Pass 2: Numeric ranges
// ---------------------------------------------------------------------------

/// `12-14` and `12–14` -> `12 through 14`. ISO dates are left alone.
fn expand_ranges(text: &str) -> String {
    static RANGE_RE: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r"\b\d{4}-\d{2}-\d{2}\b|\b(\d{1,3})[-–](\d{1,3})\b").expect("valid regex")
    });

    RANGE_RE
        .replace_all(text, |caps: &Captures| match (caps.get(1), caps.get(2)) {
            (Some(from), Some(to)) => format!("{} through {}", from.as_str(), to.as_str()),
            _ => caps[0].to_string(),
        })
        .into_owned()
}

// ---------------------------------------------------------------------------
// Pass 3: Section/verse references
// ---------------------------------------------------------------------------

fn expand_section_verse(text: &str) -> String {
    static DC_RE: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r"(Doctrine and Covenants|Doctrine & Covenants|D&C) (\d+):(\d+)")
            .expect("valid regex")
    });

    DC_RE
        .replace_all(text, "Doctrine and Covenants Section $2 Verse $3")
        .into_owned()
}

// ---------------------------------------------------------------------------
// Pass 4: Chapter/verse references
// ---------------------------------------------------------------------------

fn expand_chapter_verse(text: &str) -> String {
    static CV_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"(\d+):(\d+)").expect("valid regex"));

    CV_RE.replace_all(text, "Chapter $1 Verse $2").into_owned()
}

// ---------------------------------------------------------------------------
// Pass 5: Cue markers
// ---------------------------------------------------------------------------

fn replace_cue_markers(text: &str) -> String {
    const CUES: [(&str, &str); 5] = [
        ("[Pause for reflection]", LONG_BREAK),
        ("[Pause]", SHORT_BREAK),
        ("[Scripture quote:]", SHORT_BREAK),
        ("[Scripture connection:]", SHORT_BREAK),
        ("[Final Scripture:]", SHORT_BREAK),
    ];

    CUES.iter()
        .fold(text.to_string(), |acc, (cue, replacement)| {
            acc.replace(cue, replacement)
        })
}

// ---------------------------------------------------------------------------
// Pass 6: Leftover stage directions
// ---------------------------------------------------------------------------

/// Any other bracketed direction would be read aloud verbatim.
fn strip_unknown_directions(text: &str) -> String {
    static BRACKET_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"\[[^\[\]]*\]").expect("valid regex"));

    if !text.contains('[') && !text.contains(']') {
        return text.to_string();
    }

    for found in BRACKET_RE.find_iter(text) {
        warn!(direction = found.as_str(), "unspeakable direction in narration");
    }
    let replaced = BRACKET_RE.replace_all(text, SHORT_BREAK);
    replaced.replace(&['[', ']'][..], "")
}

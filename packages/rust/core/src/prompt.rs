//! Prompt and output-schema construction for script generation.

use serde_json::{Value, json};

use showrunner_corpus::IndexedCorpus;
use showrunner_providers::ChatMessage;
use showrunner_shared::{EpisodeSpec, GeneratedScript, RetrievalResult};

/// Name of the structured-output schema sent to the model.
pub const SCHEMA_NAME: &str = "episode_script";

const SYSTEM_PROMPT: &str = "\
You are the writer and narrator of a weekly scripture study show. Each episode \
walks the listener through the week's passages in a warm, reverent, and \
insightful voice, connecting the text to the commentary sources provided.

Rules:
- Only cite sources by the exact ids given in the source listings.
- Each segment is grounded in exactly one source listing: set `query` to that \
listing's number and cite only ids from it.
- Every segment cites at least one source.
- Segment titles are short chapter headings (under 40 characters) and do not \
contain scripture references.
- Narration is meant to be spoken aloud. Use [Pause] or [Pause for reflection] \
for deliberate pauses and no other bracketed directions.
- Respond with JSON that matches the provided schema and nothing else.";

/// JSON schema for one script draft.
///
/// `query` and `citations` are constrained to what was retrieved, but the
/// generator still validates every draft itself.
pub fn output_schema(spec: &EpisodeSpec, retrievals: &[RetrievalResult]) -> Value {
    let mut cited: Vec<&str> = retrievals
        .iter()
        .flat_map(|r| r.hits.iter().map(|h| h.document_id.as_str()))
        .collect();
    cited.sort_unstable();
    cited.dedup();

    json!({
        "type": "object",
        "additionalProperties": false,
        "required": ["title", "description", "segments"],
        "properties": {
            "title": {
                "type": "string",
                "description": "Succinct, engaging episode title."
            },
            "description": {
                "type": "string",
                "description": "Video page description of about 100 to 200 words: what the episode covers, a few highlights, and an invitation to subscribe."
            },
            "segments": {
                "type": "array",
                "minItems": spec.min_segments,
                "maxItems": spec.max_segments,
                "items": {
                    "type": "object",
                    "additionalProperties": false,
                    "required": ["title", "narration", "query", "citations"],
                    "properties": {
                        "title": {"type": "string"},
                        "narration": {"type": "string"},
                        "query": {
                            "type": "integer",
                            "minimum": 0,
                            "maximum": retrievals.len().saturating_sub(1)
                        },
                        "citations": {
                            "type": "array",
                            "minItems": 1,
                            "items": {"type": "string", "enum": cited}
                        }
                    }
                }
            }
        }
    })
}

/// Initial conversation: persona, one message per source listing, then the task.
pub fn build_messages(
    spec: &EpisodeSpec,
    retrievals: &[RetrievalResult],
    index: &IndexedCorpus,
    max_passage_chars: usize,
) -> Vec<ChatMessage> {
    let mut messages = vec![ChatMessage::system(SYSTEM_PROMPT)];

    for retrieval in retrievals {
        let mut listing = format!(
            "Source listing {} (retrieved for \"{}\"):\n",
            retrieval.query_index, retrieval.query
        );
        for hit in &retrieval.hits {
            let Some(doc) = index.document(&hit.document_id) else {
                continue;
            };
            listing.push_str(&format!(
                "\n[{}] {} ({})\n{}\n",
                doc.id,
                doc.title,
                doc.locator,
                truncate_chars(&doc.text, max_passage_chars)
            ));
        }
        messages.push(ChatMessage::user(listing));
    }

    let passages = if spec.passages.is_empty() {
        String::from("(none listed)")
    } else {
        spec.passages.join("; ")
    };
    messages.push(ChatMessage::user(format!(
        "Write the episode script for this week's study.\n\
         Topic: {}\n\
         Passages: {}\n\
         Write between {} and {} segments, in the order they should be heard.",
        spec.topic, passages, spec.min_segments, spec.max_segments
    )));

    messages
}

/// Corrective follow-up after a draft failed validation.
pub fn repair_message(violation: &str) -> ChatMessage {
    ChatMessage::user(format!(
        "That response was rejected: {violation}\n\
         Return a corrected script as JSON matching the schema."
    ))
}

// ---------------------------------------------------------------------------
// Review and revision
// ---------------------------------------------------------------------------

/// Name of the structured-output schema for script reviews.
pub const REVIEW_SCHEMA_NAME: &str = "script_review";

const REVIEW_PROMPT: &str = "\
You are a careful editor reviewing a script for a weekly scripture study show \
before it is recorded. Check that the narration is doctrinally accurate, \
faithful to the passages, uplifting, and engaging for a listener.

Personal anecdotes and word studies are welcome as long as they tie back to \
the lesson; do not ask for them to be removed or labeled.

List each change the narrator should make, with a one-sentence reason. If the \
script needs no changes, return an empty list. Respond with JSON that matches \
the provided schema and nothing else.";

/// JSON schema for a review: a list of requested changes.
pub fn review_schema() -> Value {
    json!({
        "type": "object",
        "additionalProperties": false,
        "required": ["changes"],
        "properties": {
            "changes": {
                "type": "array",
                "items": {"type": "string"}
            }
        }
    })
}

/// Conversation asking a reviewer to critique an accepted script.
pub fn review_messages(script: &GeneratedScript) -> Vec<ChatMessage> {
    let mut text = format!("Episode: {}\n{}\n", script.title, script.description);
    for segment in &script.segments {
        text.push_str(&format!(
            "\n## {}. {}\n{}\n",
            segment.index + 1,
            segment.title,
            segment.narration
        ));
    }
    vec![ChatMessage::system(REVIEW_PROMPT), ChatMessage::user(text)]
}

/// Follow-up asking for a revised script that addresses the review.
pub fn revision_message(changes: &[String]) -> ChatMessage {
    let list: String = changes.iter().map(|c| format!("- {c}\n")).collect();
    ChatMessage::user(format!(
        "An editor reviewed the script and asked for these changes:\n\n{list}\n\
         Revise the script to address each one. Keep every citation within its \
         source listing and return the full script as JSON matching the schema."
    ))
}

fn truncate_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((byte, _)) => &text[..byte],
        None => text,
    }
}

//! Grounded script generation.
//!
//! Retrieval runs one BM25 query per spec query. Generation asks the
//! language model for a JSON draft, validates it at the boundary (schema,
//! segment bounds, grounding), and on a violation re-prompts with the error
//! as corrective context. An accepted script can go through one review
//! pass: the model lists requested changes and a revision is drafted under
//! the same validation. Accepted scripts are cached by content hash of the
//! spec, corpus version, model, retrieval depth and review setting.

use serde::Deserialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use showrunner_corpus::IndexedCorpus;
use showrunner_providers::{ChatMessage, GenerationRequest, LanguageModel, with_retry};
use showrunner_shared::{
    EpisodeSpec, GeneratedScript, Result, RetrievalResult, RetryPolicy, ScriptSegment,
    ShowrunnerError, Stage, fingerprint,
};
use showrunner_storage::Storage;

use crate::prompt;

/// Sampling temperature for script drafts.
const TEMPERATURE: f32 = 0.7;

/// Reviews should be consistent rather than creative.
const REVIEW_TEMPERATURE: f32 = 0.2;

/// Settings for [`ScriptGenerator`].
#[derive(Debug, Clone)]
pub struct GeneratorConfig {
    /// Hits per retrieval query.
    pub top_k: usize,
    /// Drafts requested before giving up.
    pub max_attempts: u32,
    /// Per-document budget in the prompt.
    pub max_passage_chars: usize,
    /// Run a review pass on the accepted script and revise it.
    pub revise: bool,
    pub retry: RetryPolicy,
}

/// Produces validated, grounded scripts.
pub struct ScriptGenerator<'a> {
    model: &'a dyn LanguageModel,
    storage: &'a Storage,
    config: GeneratorConfig,
    cancel: CancellationToken,
}

// ---------------------------------------------------------------------------
// Draft format (what the model returns)
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ScriptDraft {
    title: String,
    description: String,
    segments: Vec<SegmentDraft>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct SegmentDraft {
    title: String,
    narration: String,
    query: usize,
    citations: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ReviewDraft {
    changes: Vec<String>,
}

impl<'a> ScriptGenerator<'a> {
    pub fn new(model: &'a dyn LanguageModel, storage: &'a Storage, config: GeneratorConfig) -> Self {
        Self {
            model,
            storage,
            config,
            cancel: CancellationToken::new(),
        }
    }

    /// Stop between model calls once `cancel` fires.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Run every spec query against the index.
    #[instrument(skip_all, fields(episode = %spec.episode_id))]
    pub fn retrieve(&self, spec: &EpisodeSpec, index: &IndexedCorpus) -> Result<Vec<RetrievalResult>> {
        let results = spec
            .queries()
            .into_iter()
            .enumerate()
            .map(|(query_index, query)| {
                let hits = index.search(&query, self.config.top_k)?;
                Ok(RetrievalResult {
                    query_index,
                    query,
                    hits,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        info!(queries = results.len(), top_k = self.config.top_k, "retrieval complete");
        Ok(results)
    }

    /// Cache key for the script of `spec` over a corpus version.
    pub fn cache_key(&self, spec: &EpisodeSpec, corpus_version: &str) -> Result<String> {
        fingerprint(
            "script",
            &(
                spec,
                corpus_version,
                self.model.model_id(),
                self.config.top_k,
                self.config.revise,
            ),
        )
    }

    /// Retrieve, then generate. A cached script skips both.
    pub async fn generate(&self, spec: &EpisodeSpec, index: &IndexedCorpus) -> Result<GeneratedScript> {
        let key = self.cache_key(spec, index.version())?;
        if let Some(script) = self.storage.get_script(&key).await? {
            info!(cache_key = %&key[..16], "script cache hit");
            return Ok(script);
        }
        let retrievals = self.retrieve(spec, index)?;
        self.generate_grounded(spec, index, &retrievals).await
    }

    /// Generate a script grounded in already-computed retrieval results.
    #[instrument(skip_all, fields(episode = %spec.episode_id, model = %self.model.model_id()))]
    pub async fn generate_grounded(
        &self,
        spec: &EpisodeSpec,
        index: &IndexedCorpus,
        retrievals: &[RetrievalResult],
    ) -> Result<GeneratedScript> {
        spec.validate()?;
        let key = self.cache_key(spec, index.version())?;
        if let Some(script) = self.storage.get_script(&key).await? {
            info!(cache_key = %&key[..16], "script cache hit");
            return Ok(script);
        }

        let mut messages =
            prompt::build_messages(spec, retrievals, index, self.config.max_passage_chars);
        let schema = prompt::output_schema(spec, retrievals);

        let (mut script, raw) = self
            .request_valid_draft(&mut messages, &schema, spec, retrievals)
            .await?;
        if self.config.revise {
            script = self
                .revise(&mut messages, &schema, spec, retrievals, script, raw)
                .await?;
        }

        self.storage.put_script(&key, &script).await
    }

    /// Ask for drafts until one validates. Each rejected draft and its
    /// violation are appended to `messages` before the next attempt.
    async fn request_valid_draft(
        &self,
        messages: &mut Vec<ChatMessage>,
        schema: &Value,
        spec: &EpisodeSpec,
        retrievals: &[RetrievalResult],
    ) -> Result<(GeneratedScript, String)> {
        let attempts = self.config.max_attempts.max(1);
        let mut last_violation = String::new();

        for attempt in 1..=attempts {
            if attempt > 1 {
                self.ensure_not_cancelled()?;
            }
            let request = GenerationRequest {
                messages: messages.clone(),
                schema_name: prompt::SCHEMA_NAME.to_string(),
                schema: schema.clone(),
                temperature: Some(TEMPERATURE),
            };

            let model = self.model;
            let raw = with_retry(&self.config.retry, "generate_script", || {
                model.complete(&request)
            })
            .await?;

            match validate_draft(&raw, spec, retrievals) {
                Ok(script) => {
                    info!(attempt, segments = script.segments.len(), "script accepted");
                    return Ok((script, raw));
                }
                Err(violation) => {
                    warn!(attempt, %violation, "script draft rejected");
                    messages.push(ChatMessage::assistant(raw));
                    messages.push(prompt::repair_message(&violation));
                    last_violation = violation;
                }
            }
        }

        Err(ShowrunnerError::GenerationValidation {
            attempts,
            message: last_violation,
        })
    }

    /// Have the model review an accepted script, then revise it.
    ///
    /// The accepted script is kept when the review asks for nothing, cannot
    /// be read, or when no revision passes validation within the budget.
    async fn revise(
        &self,
        messages: &mut Vec<ChatMessage>,
        schema: &Value,
        spec: &EpisodeSpec,
        retrievals: &[RetrievalResult],
        script: GeneratedScript,
        raw: String,
    ) -> Result<GeneratedScript> {
        self.ensure_not_cancelled()?;
        let request = GenerationRequest {
            messages: prompt::review_messages(&script),
            schema_name: prompt::REVIEW_SCHEMA_NAME.to_string(),
            schema: prompt::review_schema(),
            temperature: Some(REVIEW_TEMPERATURE),
        };
        let model = self.model;
        let review = with_retry(&self.config.retry, "review_script", || {
            model.complete(&request)
        })
        .await?;

        let changes = match parse_review(&review) {
            Ok(changes) => changes,
            Err(e) => {
                warn!(error = %e, "unreadable review, keeping accepted script");
                return Ok(script);
            }
        };
        if changes.is_empty() {
            info!("review requested no changes");
            return Ok(script);
        }
        info!(changes = changes.len(), "revising script");

        self.ensure_not_cancelled()?;
        messages.push(ChatMessage::assistant(raw));
        messages.push(prompt::revision_message(&changes));
        match self
            .request_valid_draft(messages, schema, spec, retrievals)
            .await
        {
            Ok((revised, _)) => Ok(revised),
            Err(ShowrunnerError::GenerationValidation { attempts, message }) => {
                warn!(attempts, %message, "no valid revision, keeping accepted script");
                Ok(script)
            }
            Err(e) => Err(e),
        }
    }

    fn ensure_not_cancelled(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(ShowrunnerError::Cancelled {
                stage: Stage::Generating,
            });
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Boundary validation
// ---------------------------------------------------------------------------

/// Parse and check one draft. The error string is fed back to the model.
fn validate_draft(
    raw: &str,
    spec: &EpisodeSpec,
    retrievals: &[RetrievalResult],
) -> std::result::Result<GeneratedScript, String> {
    let draft: ScriptDraft = serde_json::from_str(strip_code_fence(raw))
        .map_err(|e| format!("response is not valid JSON for the schema: {e}"))?;

    if draft.title.trim().is_empty() {
        return Err("episode title is empty".into());
    }

    let count = draft.segments.len();
    if count < spec.min_segments || count > spec.max_segments {
        return Err(format!(
            "expected between {} and {} segments, got {count}",
            spec.min_segments, spec.max_segments
        ));
    }

    let mut segments = Vec::with_capacity(count);
    for (index, seg) in draft.segments.into_iter().enumerate() {
        if seg.title.trim().is_empty() {
            return Err(format!("segment {index} has an empty title"));
        }
        if seg.narration.trim().is_empty() {
            return Err(format!("segment {index} has empty narration"));
        }
        let retrieval = retrievals.get(seg.query).ok_or_else(|| {
            format!(
                "segment {index} refers to source listing {} but only {} exist",
                seg.query,
                retrievals.len()
            )
        })?;
        if seg.citations.is_empty() {
            return Err(format!("segment {index} cites no sources"));
        }
        if let Some(bad) = seg.citations.iter().find(|c| !retrieval.contains(c)) {
            return Err(format!(
                "segment {index} cites '{bad}', which is not in source listing {} (allowed: {})",
                seg.query,
                retrieval.document_ids().join(", ")
            ));
        }

        segments.push(ScriptSegment {
            index,
            title: seg.title.trim().to_string(),
            narration: seg.narration.trim().to_string(),
            query_index: seg.query,
            citations: seg.citations,
        });
    }

    let script = GeneratedScript {
        title: draft.title.trim().to_string(),
        description: draft.description.trim().to_string(),
        segments,
    };
    script.validate().map_err(|e| e.to_string())?;
    debug!(segments = script.segments.len(), "draft passed validation");
    Ok(script)
}

/// Requested changes from a review, blank entries dropped.
fn parse_review(raw: &str) -> std::result::Result<Vec<String>, serde_json::Error> {
    let review: ReviewDraft = serde_json::from_str(strip_code_fence(raw))?;
    Ok(review
        .changes
        .into_iter()
        .map(|c| c.trim().to_string())
        .filter(|c| !c.is_empty())
        .collect())
}

/// Some models wrap JSON in a Markdown fence despite instructions.
fn strip_code_fence(raw: &str) -> &str {
    let trimmed = raw.trim();
    trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .and_then(|rest| rest.strip_suffix("```"))
        .map(str::trim)
        .unwrap_or(trimmed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{ScriptedModel, script_json, test_index, test_spec, test_storage};
    use serde_json::json;

    fn config() -> GeneratorConfig {
        GeneratorConfig {
            top_k: 2,
            max_attempts: 3,
            max_passage_chars: 500,
            revise: false,
            retry: RetryPolicy {
                initial_backoff_ms: 1,
                max_retries: 2,
                max_delay_secs: 1,
            },
        }
    }

    #[tokio::test]
    async fn retrieval_runs_one_query_per_spec_query() {
        let index = test_index();
        let spec = test_spec(2, 3);
        let storage = test_storage().await;
        let model = ScriptedModel::new(vec![]);
        let generator = ScriptGenerator::new(&model, &storage, config());

        let results = generator.retrieve(&spec, &index).unwrap();
        assert_eq!(results.len(), spec.queries().len());
        for (i, r) in results.iter().enumerate() {
            assert_eq!(r.query_index, i);
            assert_eq!(r.hits.len(), 2);
        }
        assert_eq!(results[0].hits[0].document_id, "faith-1");
        assert_eq!(model.calls(), 0);
    }

    #[tokio::test]
    async fn accepts_valid_draft_and_caches_it() {
        let index = test_index();
        let spec = test_spec(2, 3);
        let storage = test_storage().await;
        let model = ScriptedModel::new(vec![script_json(3, 0, "faith-1")]);
        let generator = ScriptGenerator::new(&model, &storage, config());

        let script = generator.generate(&spec, &index).await.unwrap();
        assert_eq!(script.segments.len(), 3);
        assert_eq!(
            script.segments.iter().map(|s| s.index).collect::<Vec<_>>(),
            vec![0, 1, 2]
        );
        assert_eq!(model.calls(), 1);

        // Second call is served from the cache.
        let again = generator.generate(&spec, &index).await.unwrap();
        assert_eq!(again, script);
        assert_eq!(model.calls(), 1);
    }

    #[tokio::test]
    async fn too_few_segments_triggers_repair() {
        let index = test_index();
        let spec = test_spec(4, 6);
        let storage = test_storage().await;
        let model = ScriptedModel::new(vec![
            script_json(3, 0, "faith-1"),
            script_json(4, 0, "faith-1"),
        ]);
        let generator = ScriptGenerator::new(&model, &storage, config());

        let script = generator.generate(&spec, &index).await.unwrap();
        assert_eq!(script.segments.len(), 4);
        assert_eq!(model.calls(), 2);

        // The second request carried the rejected draft and the correction.
        let second = model.request(1);
        let last = second.messages.last().unwrap();
        assert!(last.content.contains("expected between 4 and 6 segments, got 3"));
    }

    #[tokio::test]
    async fn persistent_violation_fails_after_budget() {
        let index = test_index();
        let spec = test_spec(4, 6);
        let storage = test_storage().await;
        let model = ScriptedModel::new(vec![
            script_json(3, 0, "faith-1"),
            script_json(3, 0, "faith-1"),
            script_json(3, 0, "faith-1"),
        ]);
        let generator = ScriptGenerator::new(&model, &storage, config());

        let err = generator.generate(&spec, &index).await.unwrap_err();
        match err {
            ShowrunnerError::GenerationValidation { attempts, message } => {
                assert_eq!(attempts, 3);
                assert!(message.contains("got 3"));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(model.calls(), 3);
    }

    #[tokio::test]
    async fn citation_outside_retrieval_is_rejected() {
        let index = test_index();
        let spec = test_spec(2, 3);
        let storage = test_storage().await;
        // "temple-1" exists in the corpus but is not in the top-2 for "Faith".
        let model = ScriptedModel::new(vec![
            script_json(2, 0, "temple-1"),
            script_json(2, 0, "faith-2"),
        ]);
        let generator = ScriptGenerator::new(&model, &storage, config());

        let script = generator.generate(&spec, &index).await.unwrap();
        assert!(script.segments.iter().all(|s| s.citations == vec!["faith-2".to_string()]));
        let second = model.request(1);
        let correction = &second.messages.last().unwrap().content;
        assert!(correction.contains("cites 'temple-1'"));
    }

    fn revising() -> GeneratorConfig {
        GeneratorConfig {
            revise: true,
            ..config()
        }
    }

    fn review(changes: &[&str]) -> String {
        json!({ "changes": changes }).to_string()
    }

    #[tokio::test]
    async fn review_changes_produce_a_revision() {
        let index = test_index();
        let spec = test_spec(2, 3);
        let storage = test_storage().await;
        let model = ScriptedModel::new(vec![
            script_json(2, 0, "faith-1"),
            review(&["Explain the seed metaphor."]),
            script_json(3, 0, "faith-2"),
        ]);
        let generator = ScriptGenerator::new(&model, &storage, revising());

        let script = generator.generate(&spec, &index).await.unwrap();
        assert_eq!(script.segments.len(), 3);
        assert_eq!(model.calls(), 3);

        let reviewed = model.request(1);
        assert_eq!(reviewed.schema_name, prompt::REVIEW_SCHEMA_NAME);
        assert!(reviewed.messages[1].content.contains("Part 0"));

        let revision = model.request(2);
        assert_eq!(revision.schema_name, prompt::SCHEMA_NAME);
        let ask = &revision.messages.last().unwrap().content;
        assert!(ask.contains("- Explain the seed metaphor."));
    }

    #[tokio::test]
    async fn empty_review_keeps_the_draft() {
        let index = test_index();
        let spec = test_spec(2, 3);
        let storage = test_storage().await;
        let model = ScriptedModel::new(vec![script_json(2, 0, "faith-1"), review(&[" "])]);
        let generator = ScriptGenerator::new(&model, &storage, revising());

        let script = generator.generate(&spec, &index).await.unwrap();
        assert_eq!(script.segments.len(), 2);
        assert_eq!(model.calls(), 2);
    }

    #[tokio::test]
    async fn invalid_revisions_fall_back_to_the_accepted_draft() {
        let index = test_index();
        let spec = test_spec(2, 3);
        let storage = test_storage().await;
        let model = ScriptedModel::new(vec![
            script_json(2, 0, "faith-1"),
            review(&["Add more segments."]),
            script_json(5, 0, "faith-1"),
            script_json(5, 0, "faith-1"),
            script_json(5, 0, "faith-1"),
        ]);
        let generator = ScriptGenerator::new(&model, &storage, revising());

        let script = generator.generate(&spec, &index).await.unwrap();
        assert_eq!(script.segments.len(), 2);
        assert_eq!(model.calls(), 5);
    }

    #[tokio::test]
    async fn cancellation_stops_the_repair_loop() {
        let index = test_index();
        let spec = test_spec(4, 6);
        let storage = test_storage().await;
        let cancel = CancellationToken::new();
        let model = ScriptedModel::cancelling(
            vec![script_json(3, 0, "faith-1"), script_json(4, 0, "faith-1")],
            cancel.clone(),
        );
        let generator =
            ScriptGenerator::new(&model, &storage, config()).with_cancellation(cancel);

        let err = generator.generate(&spec, &index).await.unwrap_err();
        assert!(matches!(
            err,
            ShowrunnerError::Cancelled {
                stage: Stage::Generating
            }
        ));
        assert_eq!(model.calls(), 1);
        let key = generator.cache_key(&spec, index.version()).unwrap();
        assert!(storage.get_script(&key).await.unwrap().is_none());
    }

    #[test]
    fn review_parsing_drops_blank_changes() {
        assert_eq!(
            parse_review("```json\n{\"changes\":[\"a\", \"  \"]}\n```").unwrap(),
            vec!["a".to_string()]
        );
        assert!(parse_review(r#"{"changes":[],"score":3}"#).is_err());
    }

    #[test]
    fn malformed_json_is_a_violation() {
        let spec = test_spec(1, 2);
        let err = validate_draft("not json", &spec, &[]).unwrap_err();
        assert!(err.contains("not valid JSON"));

        let err = validate_draft(
            r#"{"title":"T","description":"D","segments":[],"extra":1}"#,
            &spec,
            &[],
        )
        .unwrap_err();
        assert!(err.contains("unknown field"));
    }

    #[test]
    fn query_index_out_of_range_is_a_violation() {
        let spec = test_spec(1, 2);
        let raw = r#"{"title":"T","description":"D","segments":[
            {"title":"A","narration":"n","query":5,"citations":["x"]}]}"#;
        let err = validate_draft(raw, &spec, &[]).unwrap_err();
        assert!(err.contains("source listing 5"));
    }

    #[test]
    fn code_fences_are_tolerated() {
        assert_eq!(strip_code_fence("```json\n{\"a\":1}\n```"), "{\"a\":1}");
        assert_eq!(strip_code_fence(" {\"a\":1} "), "{\"a\":1}");
    }
}

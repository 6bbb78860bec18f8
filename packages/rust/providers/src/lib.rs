//! External collaborators: language generation and speech synthesis.
//!
//! The pipeline only sees the [`LanguageModel`] and [`SpeechSynthesizer`]
//! traits. Production implementations talk HTTP:
//! - [`OpenAiCompatibleClient`] - chat completions with a JSON-schema
//!   response format (OpenRouter by default)
//! - [`ElevenLabsClient`] - text-to-speech with character timestamps
//!
//! Each trait call is a single attempt returning a classified
//! [`ProviderError`]; callers wrap calls in [`with_retry`].

pub mod llm;
pub mod retry;
pub mod tts;

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use showrunner_shared::{ProviderError, Result, ShowrunnerError, VoiceConfig};

pub use llm::OpenAiCompatibleClient;
pub use retry::with_retry;
pub use tts::ElevenLabsClient;

/// User-Agent string for provider requests.
const USER_AGENT: &str = concat!("Showrunner/", env!("CARGO_PKG_VERSION"));

/// Longest error body excerpt carried into a [`ProviderError`].
const MAX_ERROR_BODY: usize = 500;

// ---------------------------------------------------------------------------
// Language generation
// ---------------------------------------------------------------------------

/// Chat role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// One chat message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// A structured-output generation request.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub messages: Vec<ChatMessage>,
    /// Name of the output schema (sent to the provider).
    pub schema_name: String,
    /// JSON Schema the response must follow.
    pub schema: serde_json::Value,
    pub temperature: Option<f32>,
}

/// Something that turns a prompt into (hopefully) schema-conforming JSON text.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// Model identifier; part of the script cache key.
    fn model_id(&self) -> &str;

    /// One generation attempt. Returns the raw response content.
    async fn complete(&self, request: &GenerationRequest) -> std::result::Result<String, ProviderError>;
}

// ---------------------------------------------------------------------------
// Speech synthesis
// ---------------------------------------------------------------------------

/// Encoded audio returned by a synthesizer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SynthesizedAudio {
    pub audio: Vec<u8>,
    pub duration_ms: u64,
    /// File extension of the encoding.
    pub format: String,
}

/// Something that speaks text with a given voice.
#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    /// One synthesis attempt.
    async fn synthesize(
        &self,
        text: &str,
        voice: &VoiceConfig,
    ) -> std::result::Result<SynthesizedAudio, ProviderError>;
}

// ---------------------------------------------------------------------------
// HTTP helpers
// ---------------------------------------------------------------------------

/// Build a reqwest client with the shared User-Agent and timeout.
pub fn build_client(timeout_secs: u64) -> Result<Client> {
    Client::builder()
        .user_agent(USER_AGENT)
        .timeout(Duration::from_secs(timeout_secs))
        .build()
        .map_err(|e| ShowrunnerError::config(format!("failed to build HTTP client: {e}")))
}

/// Classify a transport-level reqwest failure.
pub(crate) fn classify_transport(url: &str, e: reqwest::Error) -> ProviderError {
    if e.is_timeout() || e.is_connect() || e.is_request() {
        ProviderError::Transient {
            message: format!("{url}: {e}"),
        }
    } else if e.is_decode() || e.is_body() {
        ProviderError::Malformed {
            message: format!("{url}: {e}"),
        }
    } else {
        ProviderError::Transient {
            message: format!("{url}: {e}"),
        }
    }
}

/// Turn a non-success response into a classified error.
pub(crate) async fn error_from_response(url: &str, response: reqwest::Response) -> ProviderError {
    let status = response.status().as_u16();
    let body = response.text().await.unwrap_or_default();
    let excerpt: String = body.chars().take(MAX_ERROR_BODY).collect();
    ProviderError::from_status(status, format!("{url}: HTTP {status}: {excerpt}"))
}

/// Reject a configured base URL that is not absolute http(s).
pub(crate) fn validate_base_url(base_url: &str) -> Result<()> {
    let parsed = url::Url::parse(base_url)
        .map_err(|e| ShowrunnerError::config(format!("invalid base_url '{base_url}': {e}")))?;
    match parsed.scheme() {
        "http" | "https" => Ok(()),
        other => Err(ShowrunnerError::config(format!(
            "base_url '{base_url}' must use http or https, not {other}"
        ))),
    }
}

/// Join a base URL and a path without doubling slashes.
pub(crate) fn endpoint(base_url: &str, path: &str) -> String {
    format!(
        "{}/{}",
        base_url.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

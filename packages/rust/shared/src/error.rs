//! Error types for Showrunner.
//!
//! Library crates use [`ShowrunnerError`] via `thiserror`.
//! The CLI wraps this with `color-eyre` for rich diagnostics.
//!
//! Failures from external collaborators (language model, speech synthesis)
//! are classified as [`ProviderError`] so the retry layer can tell transient
//! conditions from permanent ones.

use std::path::PathBuf;

use crate::types::Stage;

/// Top-level error type for all Showrunner operations.
#[derive(Debug, thiserror::Error)]
pub enum ShowrunnerError {
    /// Configuration loading or validation error.
    #[error("config error: {message}")]
    Config { message: String },

    /// The corpus could not be indexed (empty input, duplicate ids).
    #[error("index build error: {message}")]
    IndexBuild { message: String },

    /// The language model kept producing output that failed validation.
    #[error("script generation failed after {attempts} attempt(s): {message}")]
    GenerationValidation { attempts: u32, message: String },

    /// A single segment could not be synthesized.
    #[error("synthesis failed for segment {segment_index}: {message}")]
    Synthesis { segment_index: usize, message: String },

    /// Some segments of a batch failed to synthesize.
    #[error("synthesis incomplete: {} succeeded, {} failed ({failed:?}): {message}", succeeded.len(), failed.len())]
    SynthesisBatch {
        succeeded: Vec<usize>,
        failed: Vec<usize>,
        message: String,
    },

    /// Timeline construction or post-render verification failed.
    #[error("assembly error: {message}")]
    Assembly { message: String },

    /// The external renderer (ffmpeg) failed.
    #[error("render error: {0}")]
    Render(String),

    /// A provider call failed permanently or exhausted its retries.
    #[error(transparent)]
    Provider(#[from] ProviderError),

    /// Database or storage layer error.
    #[error("storage error: {0}")]
    Storage(String),

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Data validation error (bad episode spec, malformed input file, etc.).
    #[error("validation error: {message}")]
    Validation { message: String },

    /// Handing the episode to the publisher failed.
    #[error("publish error: {0}")]
    Publish(String),

    /// The run was cancelled before `stage` could complete.
    #[error("run cancelled during {stage}")]
    Cancelled { stage: Stage },
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, ShowrunnerError>;

impl ShowrunnerError {
    /// Create a config error from any displayable message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create an index build error.
    pub fn index_build(msg: impl Into<String>) -> Self {
        Self::IndexBuild {
            message: msg.into(),
        }
    }

    /// Create an assembly error.
    pub fn assembly(msg: impl Into<String>) -> Self {
        Self::Assembly {
            message: msg.into(),
        }
    }

    /// Create a validation error from any displayable message.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
        }
    }

    /// Wrap a `std::io::Error` with a path for context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

// ---------------------------------------------------------------------------
// Provider errors
// ---------------------------------------------------------------------------

/// Classified failure of an external provider call.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProviderError {
    /// HTTP 429 or an explicit quota signal.
    #[error("rate limited: {message}")]
    RateLimited { message: String },

    /// Timeouts, connection failures, HTTP 408 and 5xx.
    #[error("transient provider failure: {message}")]
    Transient { message: String },

    /// HTTP 401/403.
    #[error("authentication failed: {message}")]
    Authentication { message: String },

    /// Any other 4xx: the request itself is wrong and will not succeed on retry.
    #[error("invalid request (HTTP {status}): {message}")]
    InvalidRequest { status: u16, message: String },

    /// The provider answered 2xx but the payload could not be understood.
    #[error("malformed provider response: {message}")]
    Malformed { message: String },
}

impl ProviderError {
    /// Classify a non-success HTTP status.
    pub fn from_status(status: u16, body: impl Into<String>) -> Self {
        let message = body.into();
        match status {
            429 => Self::RateLimited { message },
            408 | 500..=599 => Self::Transient { message },
            401 | 403 => Self::Authentication { message },
            _ => Self::InvalidRequest { status, message },
        }
    }

    /// Whether retrying the same request may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::RateLimited { .. } | Self::Transient { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_formatting() {
        let err = ShowrunnerError::config("missing API key");
        assert_eq!(err.to_string(), "config error: missing API key");

        let err = ShowrunnerError::GenerationValidation {
            attempts: 3,
            message: "expected 4..=6 segments, got 3".into(),
        };
        assert!(err.to_string().contains("after 3 attempt(s)"));
        assert!(err.to_string().contains("got 3"));
    }

    #[test]
    fn synthesis_batch_lists_failures() {
        let err = ShowrunnerError::SynthesisBatch {
            succeeded: vec![0, 2],
            failed: vec![1],
            message: "segment 1: rate limited".into(),
        };
        let text = err.to_string();
        assert!(text.contains("2 succeeded"));
        assert!(text.contains("[1]"));
    }

    #[test]
    fn status_classification() {
        assert!(ProviderError::from_status(429, "slow down").is_retryable());
        assert!(ProviderError::from_status(503, "unavailable").is_retryable());
        assert!(ProviderError::from_status(408, "timeout").is_retryable());
        assert!(!ProviderError::from_status(401, "bad key").is_retryable());
        assert!(matches!(
            ProviderError::from_status(403, ""),
            ProviderError::Authentication { .. }
        ));
        assert!(matches!(
            ProviderError::from_status(422, "bad schema"),
            ProviderError::InvalidRequest { status: 422, .. }
        ));
    }

    #[test]
    fn provider_error_converts() {
        let err: ShowrunnerError = ProviderError::Malformed {
            message: "no choices".into(),
        }
        .into();
        assert!(matches!(err, ShowrunnerError::Provider(_)));
        assert!(err.to_string().contains("no choices"));
    }
}

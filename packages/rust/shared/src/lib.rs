//! Shared types, error model, and configuration for Showrunner.
//!
//! This crate is the foundation depended on by all other Showrunner crates.
//! It provides:
//! - [`ShowrunnerError`] and [`ProviderError`] - the error taxonomy
//! - Domain types ([`EpisodeSpec`], [`GeneratedScript`], [`AudioClip`], [`Timeline`], [`Episode`])
//! - Configuration ([`AppConfig`], [`RetryPolicy`], config loading)
//! - Content hashing helpers used for cache keys

pub mod config;
pub mod error;
pub mod hash;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use config::{
    AppConfig, AssemblyConfig, DefaultsConfig, LlmConfig, NarrationConfig, PublisherConfig,
    RetrievalConfig, RetryConfig, RetryPolicy, TtsConfig, config_dir, config_file_path,
    expand_home, init_config, load_config, load_config_from, resolve_api_key,
};
pub use error::{ProviderError, Result, ShowrunnerError};
pub use hash::{fingerprint, sha256_hex};
pub use types::{
    AudioClip, Chapter, CorpusDocument, Episode, EpisodeSpec, GeneratedScript, RetrievalHit,
    RetrievalResult, RunState, ScriptSegment, Stage, Timeline, TimelineEntry, VisualAsset,
    VisualKind, VoiceConfig,
};

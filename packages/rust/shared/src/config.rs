//! Application configuration for Showrunner.
//!
//! User config lives at `~/.showrunner/showrunner.toml`.
//! CLI flags override config file values, which override defaults.
//! API keys are never stored in the file; each provider section names the
//! environment variable that holds its key.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Result, ShowrunnerError};
use crate::types::VoiceConfig;

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "showrunner.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".showrunner";

// ---------------------------------------------------------------------------
// Config structs (matching showrunner.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub defaults: DefaultsConfig,

    /// Language model endpoint (OpenAI-compatible chat completions).
    #[serde(default)]
    pub llm: LlmConfig,

    /// Speech synthesis endpoint and voice.
    #[serde(default)]
    pub tts: TtsConfig,

    /// Backoff policy shared by every provider call.
    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub retrieval: RetrievalConfig,

    #[serde(default)]
    pub narration: NarrationConfig,

    #[serde(default)]
    pub assembly: AssemblyConfig,

    #[serde(default)]
    pub publisher: PublisherConfig,
}

/// `[defaults]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefaultsConfig {
    /// Root directory for rendered episodes.
    #[serde(default = "default_output_dir")]
    pub output_dir: String,

    /// Path of the cache/checkpoint database.
    #[serde(default = "default_database")]
    pub database: String,
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            output_dir: default_output_dir(),
            database: default_database(),
        }
    }
}

fn default_output_dir() -> String {
    "~/.showrunner/episodes".into()
}
fn default_database() -> String {
    "~/.showrunner/showrunner.db".into()
}

/// `[llm]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    #[serde(default = "default_llm_base_url")]
    pub base_url: String,

    /// Name of the env var holding the API key (never store the key itself).
    #[serde(default = "default_llm_api_key_env")]
    pub api_key_env: String,

    #[serde(default = "default_llm_model")]
    pub model: String,

    /// Generation attempts before giving up on schema violations.
    #[serde(default = "default_max_generation_attempts")]
    pub max_generation_attempts: u32,

    /// Per-document text budget in the grounding prompt.
    #[serde(default = "default_max_passage_chars")]
    pub max_passage_chars: usize,

    /// Review each accepted script and ask for a revision.
    #[serde(default = "default_true")]
    pub revise: bool,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: default_llm_base_url(),
            api_key_env: default_llm_api_key_env(),
            model: default_llm_model(),
            max_generation_attempts: default_max_generation_attempts(),
            max_passage_chars: default_max_passage_chars(),
            revise: true,
        }
    }
}

fn default_llm_base_url() -> String {
    "https://openrouter.ai/api/v1".into()
}
fn default_llm_api_key_env() -> String {
    "OPENROUTER_API_KEY".into()
}
fn default_llm_model() -> String {
    "openai/gpt-4o".into()
}
fn default_max_generation_attempts() -> u32 {
    3
}
fn default_max_passage_chars() -> usize {
    6000
}

/// `[tts]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TtsConfig {
    #[serde(default = "default_tts_base_url")]
    pub base_url: String,

    #[serde(default = "default_tts_api_key_env")]
    pub api_key_env: String,

    #[serde(default = "default_voice_id")]
    pub voice_id: String,

    #[serde(default = "default_tts_model")]
    pub model_id: String,

    #[serde(default = "default_output_format")]
    pub output_format: String,

    #[serde(default = "default_stability")]
    pub stability: f32,

    #[serde(default = "default_similarity_boost")]
    pub similarity_boost: f32,

    #[serde(default = "default_style")]
    pub style: f32,

    /// Maximum concurrent synthesis requests.
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,
}

impl Default for TtsConfig {
    fn default() -> Self {
        Self {
            base_url: default_tts_base_url(),
            api_key_env: default_tts_api_key_env(),
            voice_id: default_voice_id(),
            model_id: default_tts_model(),
            output_format: default_output_format(),
            stability: default_stability(),
            similarity_boost: default_similarity_boost(),
            style: default_style(),
            max_in_flight: default_max_in_flight(),
        }
    }
}

fn default_tts_base_url() -> String {
    "https://api.elevenlabs.io".into()
}
fn default_tts_api_key_env() -> String {
    "ELEVEN_API_KEY".into()
}
fn default_voice_id() -> String {
    "nBwyHk4MbE8FJ1GEsatX".into()
}
fn default_tts_model() -> String {
    "eleven_turbo_v2".into()
}
fn default_output_format() -> String {
    "mp3_22050_32".into()
}
fn default_stability() -> f32 {
    0.34
}
fn default_similarity_boost() -> f32 {
    0.8
}
fn default_style() -> f32 {
    0.2
}
fn default_max_in_flight() -> usize {
    4
}

/// `[retry]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    #[serde(default = "default_max_retries")]
    pub max_retries: usize,

    #[serde(default = "default_max_delay_secs")]
    pub max_delay_secs: u64,

    /// Per-request HTTP timeout.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_backoff_ms: default_initial_backoff_ms(),
            max_retries: default_max_retries(),
            max_delay_secs: default_max_delay_secs(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

fn default_initial_backoff_ms() -> u64 {
    2000
}
fn default_max_retries() -> usize {
    5
}
fn default_max_delay_secs() -> u64 {
    60
}
fn default_request_timeout_secs() -> u64 {
    120
}

/// `[retrieval]` section (BM25 parameters).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalConfig {
    #[serde(default = "default_top_k")]
    pub top_k: usize,

    #[serde(default = "default_k1")]
    pub k1: f64,

    #[serde(default = "default_b")]
    pub b: f64,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
            k1: default_k1(),
            b: default_b(),
        }
    }
}

fn default_top_k() -> usize {
    7
}
fn default_k1() -> f64 {
    1.5
}
fn default_b() -> f64 {
    0.75
}

/// `[narration]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NarrationConfig {
    /// Rewrite references and cue markers into speakable text before synthesis.
    #[serde(default = "default_true")]
    pub normalize: bool,
}

impl Default for NarrationConfig {
    fn default() -> Self {
        Self { normalize: true }
    }
}

fn default_true() -> bool {
    true
}

/// `[assembly]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssemblyConfig {
    /// Crossfade between consecutive segments.
    #[serde(default = "default_transition_ms")]
    pub transition_ms: u64,

    /// Allowed difference between planned and rendered duration.
    #[serde(default = "default_duration_tolerance_ms")]
    pub duration_tolerance_ms: u64,

    #[serde(default = "default_width")]
    pub width: u32,

    #[serde(default = "default_height")]
    pub height: u32,

    #[serde(default = "default_fps")]
    pub fps: u32,

    #[serde(default = "default_ffmpeg")]
    pub ffmpeg: String,

    #[serde(default = "default_ffprobe")]
    pub ffprobe: String,

    /// Directory searched for `segment_{i}.{png,jpg,mp4}` visuals.
    #[serde(default = "default_visuals_dir")]
    pub visuals_dir: String,

    /// Fallback still used for segments without a dedicated visual.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub background: Option<String>,

    /// Draw the episode title and passage near the bottom of the frame.
    #[serde(default = "default_true")]
    pub title_overlay: bool,

    #[serde(default = "default_font_size")]
    pub font_size: u32,

    /// Font for the title overlay; ffmpeg's default font when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub font_file: Option<String>,
}

impl Default for AssemblyConfig {
    fn default() -> Self {
        Self {
            transition_ms: default_transition_ms(),
            duration_tolerance_ms: default_duration_tolerance_ms(),
            width: default_width(),
            height: default_height(),
            fps: default_fps(),
            ffmpeg: default_ffmpeg(),
            ffprobe: default_ffprobe(),
            visuals_dir: default_visuals_dir(),
            background: None,
            title_overlay: true,
            font_size: default_font_size(),
            font_file: None,
        }
    }
}

fn default_transition_ms() -> u64 {
    1000
}
fn default_duration_tolerance_ms() -> u64 {
    250
}
fn default_width() -> u32 {
    1920
}
fn default_height() -> u32 {
    1080
}
fn default_fps() -> u32 {
    24
}
fn default_ffmpeg() -> String {
    "ffmpeg".into()
}
fn default_ffprobe() -> String {
    "ffprobe".into()
}
fn default_visuals_dir() -> String {
    "visuals".into()
}
fn default_font_size() -> u32 {
    60
}

/// `[publisher]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublisherConfig {
    /// Directory the outbox publisher copies finished episodes into.
    #[serde(default = "default_outbox_dir")]
    pub outbox_dir: String,

    #[serde(default)]
    pub tags: Vec<String>,

    /// UTC hour on the day before the study week when the episode goes live.
    #[serde(default = "default_publish_hour")]
    pub publish_hour_utc: u32,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            outbox_dir: default_outbox_dir(),
            tags: Vec::new(),
            publish_hour_utc: default_publish_hour(),
        }
    }
}

fn default_outbox_dir() -> String {
    "~/.showrunner/outbox".into()
}
fn default_publish_hour() -> u32 {
    18
}

// ---------------------------------------------------------------------------
// Runtime config (derived from the file)
// ---------------------------------------------------------------------------

/// Backoff policy for provider calls.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub initial_backoff_ms: u64,
    pub max_retries: usize,
    pub max_delay_secs: u64,
}

impl From<&AppConfig> for RetryPolicy {
    fn from(config: &AppConfig) -> Self {
        Self {
            initial_backoff_ms: config.retry.initial_backoff_ms,
            max_retries: config.retry.max_retries,
            max_delay_secs: config.retry.max_delay_secs,
        }
    }
}

impl From<&AppConfig> for VoiceConfig {
    fn from(config: &AppConfig) -> Self {
        Self {
            voice_id: config.tts.voice_id.clone(),
            model_id: config.tts.model_id.clone(),
            output_format: config.tts.output_format.clone(),
            stability: config.tts.stability,
            similarity_boost: config.tts.similarity_boost,
            style: config.tts.style,
        }
    }
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.showrunner/`).
pub fn config_dir() -> Result<PathBuf> {
    let home = dirs::home_dir()
        .ok_or_else(|| ShowrunnerError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.showrunner/showrunner.toml`).
pub fn config_file_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}

/// Load the application config from disk. Returns defaults if the file does not exist.
pub fn load_config() -> Result<AppConfig> {
    let path = config_file_path()?;

    if !path.exists() {
        tracing::debug!(?path, "config file not found, using defaults");
        return Ok(AppConfig::default());
    }

    load_config_from(&path)
}

/// Load the application config from a specific file path.
pub fn load_config_from(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| ShowrunnerError::io(path, e))?;

    toml::from_str(&content)
        .map_err(|e| ShowrunnerError::config(format!("failed to parse {}: {e}", path.display())))
}

/// Create the config directory and write a default config file.
/// Returns the path to the created file.
pub fn init_config() -> Result<PathBuf> {
    let dir = config_dir()?;
    std::fs::create_dir_all(&dir).map_err(|e| ShowrunnerError::io(&dir, e))?;

    let path = dir.join(CONFIG_FILE_NAME);
    let config = AppConfig::default();
    let content =
        toml::to_string_pretty(&config).map_err(|e| ShowrunnerError::config(e.to_string()))?;

    std::fs::write(&path, content).map_err(|e| ShowrunnerError::io(&path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(path)
}

/// Expand a leading `~/` to the user's home directory.
pub fn expand_home(path: &str) -> Result<PathBuf> {
    match path.strip_prefix("~/") {
        Some(rest) => {
            let home = dirs::home_dir()
                .ok_or_else(|| ShowrunnerError::config("could not determine home directory"))?;
            Ok(home.join(rest))
        }
        None => Ok(PathBuf::from(path)),
    }
}

/// Read a provider API key from the named env var.
pub fn resolve_api_key(var_name: &str, provider: &str) -> Result<String> {
    match std::env::var(var_name) {
        Ok(val) if !val.trim().is_empty() => Ok(val),
        _ => Err(ShowrunnerError::config(format!(
            "{provider} API key not found. Set the {var_name} environment variable."
        ))),
    }
}

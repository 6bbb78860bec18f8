//! ElevenLabs text-to-speech client.
//!
//! Uses the `with-timestamps` endpoint so the clip duration comes from the
//! provider's character alignment instead of decoding the audio locally.

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, instrument};

use showrunner_shared::{AppConfig, ProviderError, Result, VoiceConfig, resolve_api_key};

use crate::{
    SpeechSynthesizer, SynthesizedAudio, build_client, classify_transport, endpoint,
    validate_base_url,
    error_from_response,
};

pub struct ElevenLabsClient {
    client: Client,
    base_url: String,
    api_key: String,
}

impl ElevenLabsClient {
    pub fn new(client: Client, base_url: &str, api_key: &str) -> Self {
        Self {
            client,
            base_url: base_url.to_string(),
            api_key: api_key.to_string(),
        }
    }

    /// Build from the `[tts]` and `[retry]` config sections.
    pub fn from_config(config: &AppConfig) -> Result<Self> {
        let api_key = resolve_api_key(&config.tts.api_key_env, "Speech synthesis")?;
        validate_base_url(&config.tts.base_url)?;
        let client = build_client(config.retry.request_timeout_secs)?;
        Ok(Self::new(client, &config.tts.base_url, &api_key))
    }
}

#[derive(Deserialize)]
struct TimestampedResponse {
    audio_base64: String,
    #[serde(default)]
    alignment: Option<Alignment>,
}

#[derive(Deserialize)]
struct Alignment {
    #[serde(default)]
    character_end_times_seconds: Vec<f64>,
}

#[async_trait]
impl SpeechSynthesizer for ElevenLabsClient {
    #[instrument(skip_all, fields(voice = %voice.voice_id, chars = text.len()))]
    async fn synthesize(
        &self,
        text: &str,
        voice: &VoiceConfig,
    ) -> std::result::Result<SynthesizedAudio, ProviderError> {
        let url = endpoint(
            &self.base_url,
            &format!("v1/text-to-speech/{}/with-timestamps", voice.voice_id),
        );

        let body = json!({
            "text": text,
            "model_id": voice.model_id,
            "voice_settings": {
                "stability": voice.stability,
                "similarity_boost": voice.similarity_boost,
                "style": voice.style,
                "use_speaker_boost": true,
            }
        });

        let response = self
            .client
            .post(&url)
            .query(&[("output_format", voice.output_format.as_str())])
            .header("xi-api-key", &self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| classify_transport(&url, e))?;

        if !response.status().is_success() {
            return Err(error_from_response(&url, response).await);
        }

        let parsed: TimestampedResponse =
            response.json().await.map_err(|e| ProviderError::Malformed {
                message: format!("{url}: {e}"),
            })?;

        let audio = STANDARD
            .decode(parsed.audio_base64.as_bytes())
            .map_err(|e| ProviderError::Malformed {
                message: format!("audio is not valid base64: {e}"),
            })?;
        if audio.is_empty() {
            return Err(ProviderError::Malformed {
                message: "provider returned empty audio".into(),
            });
        }

        let end_seconds = parsed
            .alignment
            .and_then(|a| a.character_end_times_seconds.last().copied())
            .ok_or_else(|| ProviderError::Malformed {
                message: "response has no alignment timestamps".into(),
            })?;
        let duration_ms = (end_seconds * 1000.0).round() as u64;

        debug!(bytes = audio.len(), duration_ms, "speech synthesized");

        Ok(SynthesizedAudio {
            audio,
            duration_ms,
            format: voice.file_extension().to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn voice() -> VoiceConfig {
        VoiceConfig::from(&AppConfig::default())
    }

    fn client(server: &MockServer) -> ElevenLabsClient {
        ElevenLabsClient::new(build_client(5).unwrap(), &server.uri(), "xi-test")
    }

    #[tokio::test]
    async fn decodes_audio_and_duration() {
        let server = MockServer::start().await;
        let v = voice();
        Mock::given(method("POST"))
            .and(path(format!("/v1/text-to-speech/{}/with-timestamps", v.voice_id)))
            .and(query_param("output_format", "mp3_22050_32"))
            .and(header("xi-api-key", "xi-test"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "audio_base64": STANDARD.encode([1u8, 2, 3, 4]),
                "alignment": {
                    "characters": ["H", "i"],
                    "character_start_times_seconds": [0.0, 0.4],
                    "character_end_times_seconds": [0.4, 1.25]
                }
            })))
            .mount(&server)
            .await;

        let out = client(&server).synthesize("Hi", &v).await.unwrap();
        assert_eq!(out.audio, vec![1, 2, 3, 4]);
        assert_eq!(out.duration_ms, 1250);
        assert_eq!(out.format, "mp3");
    }

    #[tokio::test]
    async fn missing_alignment_is_malformed() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "audio_base64": STANDARD.encode([9u8])
            })))
            .mount(&server)
            .await;

        let err = client(&server).synthesize("Hi", &voice()).await.unwrap_err();
        assert!(matches!(err, ProviderError::Malformed { .. }));
    }

    #[tokio::test]
    async fn server_error_is_transient() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let err = client(&server).synthesize("Hi", &voice()).await.unwrap_err();
        assert!(err.is_retryable());
    }
}

//! OpenAI-compatible chat completions client with structured output.

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, instrument};

use showrunner_shared::{AppConfig, ProviderError, Result, resolve_api_key};

use crate::{
    GenerationRequest, LanguageModel, build_client, classify_transport, endpoint,
    validate_base_url,
    error_from_response,
};

/// Client for any `/chat/completions` endpoint that accepts
/// `response_format: {"type": "json_schema", ...}`.
pub struct OpenAiCompatibleClient {
    client: Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl OpenAiCompatibleClient {
    pub fn new(client: Client, base_url: &str, api_key: &str, model: &str) -> Self {
        Self {
            client,
            base_url: base_url.to_string(),
            api_key: api_key.to_string(),
            model: model.to_string(),
        }
    }

    /// Build from the `[llm]` and `[retry]` config sections, reading the key
    /// from the configured env var.
    pub fn from_config(config: &AppConfig) -> Result<Self> {
        let api_key = resolve_api_key(&config.llm.api_key_env, "Language model")?;
        validate_base_url(&config.llm.base_url)?;
        let client = build_client(config.retry.request_timeout_secs)?;
        Ok(Self::new(
            client,
            &config.llm.base_url,
            &api_key,
            &config.llm.model,
        ))
    }
}

#[derive(Deserialize)]
struct CompletionResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ResponseMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

#[async_trait]
impl LanguageModel for OpenAiCompatibleClient {
    fn model_id(&self) -> &str {
        &self.model
    }

    #[instrument(skip_all, fields(model = %self.model, schema = %request.schema_name))]
    async fn complete(&self, request: &GenerationRequest) -> std::result::Result<String, ProviderError> {
        let url = endpoint(&self.base_url, "chat/completions");

        let mut body = json!({
            "model": self.model,
            "messages": request.messages,
            "response_format": {
                "type": "json_schema",
                "json_schema": {
                    "name": request.schema_name,
                    "strict": true,
                    "schema": request.schema,
                }
            }
        });
        if let Some(t) = request.temperature {
            body["temperature"] = json!(t);
        }

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .header("X-Title", "Showrunner")
            .json(&body)
            .send()
            .await
            .map_err(|e| classify_transport(&url, e))?;

        if !response.status().is_success() {
            return Err(error_from_response(&url, response).await);
        }

        let parsed: CompletionResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::Malformed {
                message: format!("{url}: {e}"),
            })?;

        let choice = parsed.choices.into_iter().next().ok_or_else(|| ProviderError::Malformed {
            message: "response contained no choices".into(),
        })?;

        debug!(finish_reason = ?choice.finish_reason, "completion received");

        match choice.message.content {
            Some(content) if !content.trim().is_empty() => Ok(content),
            _ => Err(ProviderError::Malformed {
                message: "completion had empty content".into(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ChatMessage;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn request() -> GenerationRequest {
        GenerationRequest {
            messages: vec![ChatMessage::system("be brief"), ChatMessage::user("hello")],
            schema_name: "episode_script".into(),
            schema: json!({"type": "object"}),
            temperature: Some(0.4),
        }
    }

    fn client(server: &MockServer) -> OpenAiCompatibleClient {
        OpenAiCompatibleClient::new(
            build_client(5).unwrap(),
            &format!("{}/api/v1", server.uri()),
            "sk-test",
            "test/model",
        )
    }

    #[tokio::test]
    async fn returns_message_content() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v1/chat/completions"))
            .and(header("authorization", "Bearer sk-test"))
            .and(body_partial_json(json!({
                "model": "test/model",
                "response_format": {"type": "json_schema", "json_schema": {"name": "episode_script"}}
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "choices": [{"message": {"role": "assistant", "content": "{\"ok\":true}"}, "finish_reason": "stop"}]
            })))
            .mount(&server)
            .await;

        let content = client(&server).complete(&request()).await.unwrap();
        assert_eq!(content, "{\"ok\":true}");
    }

    #[tokio::test]
    async fn classifies_rate_limit() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429).set_body_string("slow down"))
            .mount(&server)
            .await;

        let err = client(&server).complete(&request()).await.unwrap_err();
        assert!(matches!(err, ProviderError::RateLimited { .. }));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn classifies_auth_failure() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(401).set_body_string("invalid key"))
            .mount(&server)
            .await;

        let err = client(&server).complete(&request()).await.unwrap_err();
        assert!(matches!(err, ProviderError::Authentication { .. }));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn empty_choices_are_malformed() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"choices": []})))
            .mount(&server)
            .await;

        let err = client(&server).complete(&request()).await.unwrap_err();
        assert!(matches!(err, ProviderError::Malformed { .. }));
    }
}

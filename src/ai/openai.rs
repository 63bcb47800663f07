//! OpenAI-compatible HTTP client for chat completions and embeddings.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

use super::{AiError, Embedder, TextGenerator};
use crate::config::AiConfig;

#[derive(Clone)]
pub struct OpenAiClient {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    generation_model: String,
    embedding_model: String,
    dimension: usize,
    timeout: Duration,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Deserialize)]
struct ChatMessage {
    content: String,
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingItem>,
}

#[derive(Deserialize)]
struct EmbeddingItem {
    embedding: Vec<f32>,
}

impl OpenAiClient {
    pub fn new(http: reqwest::Client, config: &AiConfig) -> Self {
        Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            generation_model: config.generation_model.clone(),
            embedding_model: config.embedding_model.clone(),
            dimension: config.dimension,
            timeout: Duration::from_millis(config.request_timeout_ms),
        }
    }

    async fn post_json(
        &self,
        path: &str,
        body: serde_json::Value,
    ) -> Result<serde_json::Value, AiError> {
        let mut request = self
            .http
            .post(format!("{}{}", self.base_url, path))
            .timeout(self.timeout)
            .json(&body);

        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| AiError::Request(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AiError::Request(format!("HTTP {}: {}", status, body)));
        }

        response
            .json()
            .await
            .map_err(|e| AiError::Malformed(e.to_string()))
    }
}

#[async_trait]
impl TextGenerator for OpenAiClient {
    async fn generate(&self, system: &str, prompt: &str) -> Result<String, AiError> {
        let body = json!({
            "model": self.generation_model,
            "messages": [
                {"role": "system", "content": system},
                {"role": "user", "content": prompt},
            ],
        });

        let value = self.post_json("/chat/completions", body).await?;
        let parsed: ChatResponse = serde_json::from_value(value)
            .map_err(|e| AiError::Malformed(format!("chat response: {}", e)))?;

        parsed
            .choices
            .into_iter()
            .next()
            .map(|choice| choice.message.content)
            .ok_or_else(|| AiError::Malformed("chat response had no choices".to_string()))
    }
}

#[async_trait]
impl Embedder for OpenAiClient {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, AiError> {
        let body = json!({
            "model": self.embedding_model,
            "input": [text],
        });

        let value = self.post_json("/embeddings", body).await?;
        let parsed: EmbeddingResponse = serde_json::from_value(value)
            .map_err(|e| AiError::Malformed(format!("embedding response: {}", e)))?;

        let embedding = parsed
            .data
            .into_iter()
            .next()
            .map(|item| item.embedding)
            .ok_or_else(|| AiError::Malformed("embedding response had no data".to_string()))?;

        if embedding.len() != self.dimension {
            return Err(AiError::DimensionMismatch {
                expected: self.dimension,
                actual: embedding.len(),
            });
        }

        Ok(embedding)
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config_for(server: &MockServer, dimension: usize) -> AiConfig {
        AiConfig {
            base_url: server.uri(),
            api_key: Some("test-key".to_string()),
            dimension,
            ..AiConfig::default()
        }
    }

    #[tokio::test]
    async fn generate_returns_first_choice_content() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "choices": [{"message": {"role": "assistant", "content": "a short summary"}}]
            })))
            .mount(&server)
            .await;

        let client = OpenAiClient::new(reqwest::Client::new(), &config_for(&server, 4));
        let summary = client.generate("system", "prompt").await.unwrap();

        assert_eq!(summary, "a short summary");
    }

    #[tokio::test]
    async fn embed_enforces_dimension() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/embeddings"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "data": [{"embedding": [0.1, 0.2, 0.3]}]
            })))
            .mount(&server)
            .await;

        let client = OpenAiClient::new(reqwest::Client::new(), &config_for(&server, 3));
        let embedding = client.embed("text").await.unwrap();
        assert_eq!(embedding.len(), 3);

        let strict = OpenAiClient::new(reqwest::Client::new(), &config_for(&server, 1024));
        let err = strict.embed("text").await.unwrap_err();
        assert!(matches!(
            err,
            AiError::DimensionMismatch {
                expected: 1024,
                actual: 3
            }
        ));
    }

    #[tokio::test]
    async fn upstream_error_status_is_surfaced() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(500).set_body_string("backend down"))
            .mount(&server)
            .await;

        let client = OpenAiClient::new(reqwest::Client::new(), &config_for(&server, 4));
        let err = client.generate("system", "prompt").await.unwrap_err();

        assert!(matches!(err, AiError::Request(_)));
        assert!(err.to_string().contains("500"));
    }
}

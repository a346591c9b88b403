//! OpenAI-compatible chat-completions client used as the SQL generator.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info, warn};

use super::SqlGenerator;
use crate::error::GenerationError;

#[derive(Debug, Clone)]
pub struct LlmClientConfig {
    pub base_url: String,
    pub model: String,
    pub api_key: Option<String>,
    pub max_tokens: u32,
    pub timeout: Duration,
}

impl Default for LlmClientConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8081".to_string(),
            model: "local-llm".to_string(),
            api_key: None,
            max_tokens: 2000,
            timeout: Duration::from_secs(120),
        }
    }
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    max_tokens: u32,
    temperature: f32,
    stream: bool,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: Option<ChoiceMessage>,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

pub struct HttpGenerator {
    config: LlmClientConfig,
    http_client: reqwest::Client,
}

impl HttpGenerator {
    pub fn new(config: LlmClientConfig) -> anyhow::Result<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to build HTTP client: {}", e))?;
        info!("SQL generator initialized with backend: {}", config.base_url);
        Ok(Self { config, http_client })
    }

    fn completions_url(&self) -> String {
        format!("{}/v1/chat/completions", self.config.base_url.trim_end_matches('/'))
    }
}

#[async_trait]
impl SqlGenerator for HttpGenerator {
    async fn generate(
        &self,
        prompt: &str,
        system_prompt: &str,
        temperature: f32,
    ) -> Result<String, GenerationError> {
        debug!("Requesting completion (temperature {:.2})", temperature);
        let request = ChatCompletionRequest {
            model: &self.config.model,
            messages: vec![
                ChatMessage { role: "system", content: system_prompt },
                ChatMessage { role: "user", content: prompt },
            ],
            max_tokens: self.config.max_tokens,
            temperature,
            stream: false,
        };

        let mut builder = self.http_client.post(self.completions_url()).json(&request);
        if let Some(key) = &self.config.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| GenerationError(format!("LLM backend request failed: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            warn!("LLM backend returned {}", status);
            return Err(GenerationError(format!("LLM backend returned {}: {}", status, body)));
        }

        let completion: ChatCompletionResponse = response
            .json()
            .await
            .map_err(|e| GenerationError(format!("Failed to parse LLM response: {}", e)))?;

        completion
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message)
            .and_then(|m| m.content)
            .filter(|content| !content.trim().is_empty())
            .ok_or_else(|| GenerationError("LLM backend returned an empty completion".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn generator(url: String) -> HttpGenerator {
        HttpGenerator::new(LlmClientConfig {
            base_url: url,
            ..LlmClientConfig::default()
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_generate_returns_first_choice() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/v1/chat/completions")
            .match_body(mockito::Matcher::PartialJsonString(
                r#"{"model":"local-llm","stream":false}"#.to_string(),
            ))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"choices":[{"message":{"role":"assistant","content":"SELECT 1"}}]}"#)
            .create_async()
            .await;

        let text = generator(server.url()).generate("q", "sys", 0.1).await.unwrap();
        assert_eq!(text, "SELECT 1");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_non_success_status_is_generation_error() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/v1/chat/completions")
            .with_status(503)
            .with_body("overloaded")
            .create_async()
            .await;

        let err = generator(server.url()).generate("q", "sys", 0.1).await.unwrap_err();
        assert!(err.0.contains("503"));
        assert!(err.0.contains("overloaded"));
    }

    #[tokio::test]
    async fn test_empty_choices_is_generation_error() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/v1/chat/completions")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"choices":[]}"#)
            .create_async()
            .await;

        let err = generator(server.url()).generate("q", "sys", 0.1).await.unwrap_err();
        assert!(err.0.contains("empty"));
    }
}

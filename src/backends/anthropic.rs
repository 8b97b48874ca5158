//! Anthropic cloud generation backend
//!
//! The API key is not configuration: it is read from the secret store on every
//! call, so a key supplied later through the approval queue takes effect
//! without a restart. A missing key surfaces as
//! [`GenerationError::MissingCredential`].

use super::{GenerationError, Generator};
use crate::vault::SecretStore;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

const ANTHROPIC_API_URL: &str = "https://api.anthropic.com/v1/messages";
const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Message in conversation
#[derive(Debug, Serialize)]
struct Message<'a> {
    role: &'a str,
    content: &'a str,
}

/// API request
#[derive(Debug, Serialize)]
struct MessageRequest<'a> {
    model: &'a str,
    max_tokens: usize,
    #[serde(skip_serializing_if = "str::is_empty")]
    system: &'a str,
    messages: Vec<Message<'a>>,
}

/// API response
#[derive(Debug, Deserialize)]
struct MessageResponse {
    content: Vec<ContentBlock>,
    usage: Usage,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    r#type: String,
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Usage {
    input_tokens: usize,
    output_tokens: usize,
}

pub struct ClaudeGenerator {
    client: Client,
    secrets: Arc<dyn SecretStore>,
    key_name: String,
    model: String,
    max_tokens: usize,
    timeout: Duration,
    api_url: String,
}

impl ClaudeGenerator {
    pub fn new(secrets: Arc<dyn SecretStore>, key_name: &str, model: &str, timeout: Duration) -> Self {
        Self {
            client: Client::new(),
            secrets,
            key_name: key_name.to_string(),
            model: model.to_string(),
            max_tokens: 4096,
            timeout,
            api_url: ANTHROPIC_API_URL.to_string(),
        }
    }

    /// Point at a different endpoint (proxies, tests)
    pub fn with_api_url(mut self, url: &str) -> Self {
        self.api_url = url.to_string();
        self
    }

    pub fn key_name(&self) -> &str {
        &self.key_name
    }

    async fn api_key(&self) -> Result<String, GenerationError> {
        match self.secrets.get_secret(&self.key_name).await {
            Ok(Some(key)) if !key.is_empty() => Ok(key),
            Ok(_) => Err(GenerationError::MissingCredential(self.key_name.clone())),
            Err(e) => Err(GenerationError::Unavailable(format!("secret store: {}", e))),
        }
    }
}

#[async_trait]
impl Generator for ClaudeGenerator {
    fn name(&self) -> &str {
        "anthropic"
    }

    async fn generate_with_system(&self, prompt: &str, system: &str) -> Result<String, GenerationError> {
        let api_key = self.api_key().await?;

        let request = MessageRequest {
            model: &self.model,
            max_tokens: self.max_tokens,
            system,
            messages: vec![Message {
                role: "user",
                content: prompt,
            }],
        };

        debug!(model = %self.model, prompt_len = prompt.len(), "Calling Claude API");

        let response = self
            .client
            .post(&self.api_url)
            .timeout(self.timeout)
            .header("x-api-key", api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("content-type", "application/json")
            .json(&request)
            .send()
            .await
            .map_err(|e| GenerationError::from_reqwest(e, self.timeout))?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(GenerationError::from_status(status, &text));
        }

        let result: MessageResponse = response
            .json()
            .await
            .map_err(|e| GenerationError::from_reqwest(e, self.timeout))?;

        let content = result
            .content
            .into_iter()
            .filter_map(|b| if b.r#type == "text" { b.text } else { None })
            .collect::<Vec<_>>()
            .join("\n");

        info!(
            model = %self.model,
            input_tokens = result.usage.input_tokens,
            output_tokens = result.usage.output_tokens,
            "Claude response"
        );

        if content.trim().is_empty() {
            return Err(GenerationError::Malformed("empty response".to_string()));
        }
        Ok(content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vault::MemorySecretStore;

    #[tokio::test]
    async fn test_missing_key_is_missing_credential() {
        let generator = ClaudeGenerator::new(
            Arc::new(MemorySecretStore::new()),
            "provider_key",
            "claude-sonnet-4-20250514",
            Duration::from_secs(5),
        );
        assert_eq!(
            generator.generate("hi").await,
            Err(GenerationError::MissingCredential("provider_key".to_string()))
        );
    }

    #[tokio::test]
    async fn test_key_is_read_per_call() {
        let secrets = Arc::new(MemorySecretStore::new());
        let generator = ClaudeGenerator::new(secrets.clone(), "provider_key", "m", Duration::from_secs(1))
            .with_api_url("http://127.0.0.1:9/v1/messages");

        assert!(matches!(
            generator.generate("hi").await,
            Err(GenerationError::MissingCredential(_))
        ));

        secrets.put_secret("provider_key", "sk-test").await.unwrap();
        // Key now present, so the failure moves on to the (closed) endpoint
        assert!(generator.generate("hi").await.unwrap_err().is_transient());
    }
}

//! Ollama generation backend
//!
//! Used for the local model (drafting, wrap-up of tool output, Pipeline B
//! answers) and, pointed at another host, as the operator-configured
//! alternate backend.

use super::{GenerationError, Generator};
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

/// Ollama generate response
#[derive(Debug, Deserialize)]
struct OllamaGenerateResponse {
    response: String,
}

pub struct OllamaGenerator {
    label: String,
    url: String,
    model: String,
    timeout: Duration,
    client: reqwest::Client,
}

impl OllamaGenerator {
    pub fn new(url: &str, model: &str, timeout: Duration) -> Self {
        Self {
            label: format!("ollama:{}", model),
            url: url.trim_end_matches('/').to_string(),
            model: model.to_string(),
            timeout,
            client: reqwest::Client::new(),
        }
    }

    pub fn with_label(mut self, label: &str) -> Self {
        self.label = label.to_string();
        self
    }

    /// Check if Ollama is reachable
    pub async fn is_available(&self) -> bool {
        match self
            .client
            .get(format!("{}/api/tags", self.url))
            .timeout(Duration::from_secs(2))
            .send()
            .await
        {
            Ok(resp) => resp.status().is_success(),
            Err(_) => false,
        }
    }
}

#[async_trait]
impl Generator for OllamaGenerator {
    fn name(&self) -> &str {
        &self.label
    }

    async fn generate_with_system(&self, prompt: &str, system: &str) -> Result<String, GenerationError> {
        let mut body = serde_json::json!({
            "model": self.model,
            "prompt": prompt,
            "stream": false,
            "options": {
                "temperature": 0.1,
                "num_predict": 2048,
            }
        });
        if !system.is_empty() {
            body["system"] = serde_json::Value::String(system.to_string());
        }

        debug!(backend = %self.label, prompt_len = prompt.len(), "Calling Ollama");

        let response = self
            .client
            .post(format!("{}/api/generate", self.url))
            .timeout(self.timeout)
            .json(&body)
            .send()
            .await
            .map_err(|e| GenerationError::from_reqwest(e, self.timeout))?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(GenerationError::from_status(status, &text));
        }

        let result: OllamaGenerateResponse = response
            .json()
            .await
            .map_err(|e| GenerationError::from_reqwest(e, self.timeout))?;

        Ok(result.response.trim().to_string())
    }
}

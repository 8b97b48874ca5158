//! Signed HTTP clients for peer SecureBot services (retrieval, classifier)

use super::{Classification, Classifier, GenerationError, Retriever};
use crate::auth::SignedClient;
use crate::router::Intent;
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Deserialize)]
struct ContextResponse {
    #[serde(default)]
    context: String,
}

/// Retrieval service client: `GET /context?query=..&user_id=..&max_tokens=..`
pub struct HttpRetriever {
    client: SignedClient,
    base_url: String,
}

impl HttpRetriever {
    pub fn new(client: SignedClient, base_url: &str) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    async fn fetch(&self, query: &str, user_id: &str, max_tokens: usize) -> Result<String, reqwest::Error> {
        let max_tokens = max_tokens.to_string();
        let response = self
            .client
            .get(&format!("{}/context", self.base_url))
            .query(&[("query", query), ("user_id", user_id), ("max_tokens", max_tokens.as_str())])
            .send()
            .await?
            .error_for_status()?;
        let body: ContextResponse = response.json().await?;
        Ok(body.context)
    }
}

#[async_trait]
impl Retriever for HttpRetriever {
    async fn retrieve(&self, query: &str, user_id: &str, max_tokens: usize) -> String {
        match self.fetch(query, user_id, max_tokens).await {
            Ok(context) => {
                debug!(chars = context.len(), "Retrieved context");
                // The service estimates ~4 chars per token; hold it to that
                context.chars().take(max_tokens.saturating_mul(4)).collect()
            }
            Err(e) => {
                warn!(error = %e, "Context retrieval failed, continuing without context");
                String::new()
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct ClassifyResponse {
    intent: String,
    confidence: f32,
}

/// Classifier service client: `POST /classify {"text": ..}`
pub struct HttpClassifier {
    client: SignedClient,
    base_url: String,
    timeout: Duration,
}

impl HttpClassifier {
    pub fn new(client: SignedClient, base_url: &str, timeout: Duration) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            timeout,
        }
    }
}

#[async_trait]
impl Classifier for HttpClassifier {
    async fn classify(&self, text: &str) -> Result<Classification, GenerationError> {
        let response = self
            .client
            .post(&format!("{}/classify", self.base_url))
            .timeout(self.timeout)
            .json(&serde_json::json!({ "text": text }))
            .send()
            .await
            .map_err(|e| GenerationError::from_reqwest(e, self.timeout))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(GenerationError::from_status(status, &body));
        }

        let body: ClassifyResponse = response
            .json()
            .await
            .map_err(|e| GenerationError::from_reqwest(e, self.timeout))?;
        let intent = body
            .intent
            .parse::<Intent>()
            .map_err(|_| GenerationError::Malformed(format!("unknown intent '{}'", body.intent)))?;

        Ok(Classification {
            intent,
            confidence: body.confidence.clamp(0.0, 1.0),
        })
    }
}

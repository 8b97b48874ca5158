//! External Backends
//!
//! Narrow interfaces to the collaborators the gateway does not own:
//!
//! - [`Generator`]: text generation (local Ollama, Anthropic cloud, alternate)
//! - [`Retriever`]: bounded context lookup from the retrieval service
//! - [`Classifier`]: intent classification
//!
//! Every call is timeout-bounded. Failures are typed as [`GenerationError`] so
//! callers can tell transient unavailability from rate limits and missing
//! credentials.

pub mod anthropic;
pub mod keyword;
pub mod ollama;
pub mod peer;

pub use anthropic::ClaudeGenerator;
pub use keyword::KeywordClassifier;
pub use ollama::OllamaGenerator;
pub use peer::{HttpClassifier, HttpRetriever};

use crate::router::Intent;
use async_trait::async_trait;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

/// Retries on top of the first attempt for transient failures
pub const MAX_RETRIES: u32 = 2;

/// Linear backoff step between retries
pub const RETRY_BASE_DELAY: Duration = Duration::from_millis(500);

/// Backend call failures
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GenerationError {
    #[error("backend unavailable: {0}")]
    Unavailable(String),

    #[error("backend timed out after {0}s")]
    Timeout(u64),

    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("missing credential '{0}'")]
    MissingCredential(String),

    #[error("request rejected: {0}")]
    Rejected(String),

    #[error("malformed response: {0}")]
    Malformed(String),
}

impl GenerationError {
    /// Worth retrying: the backend may simply be slow or restarting
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::Timeout(_))
    }

    pub(crate) fn from_reqwest(err: reqwest::Error, timeout: Duration) -> Self {
        if err.is_timeout() {
            Self::Timeout(timeout.as_secs())
        } else if err.is_decode() {
            Self::Malformed(err.to_string())
        } else {
            Self::Unavailable(err.to_string())
        }
    }

    pub(crate) fn from_status(status: reqwest::StatusCode, body: &str) -> Self {
        let detail = format!("{}: {}", status, body.chars().take(200).collect::<String>());
        match status.as_u16() {
            429 | 529 => Self::RateLimited(detail),
            500..=599 => Self::Unavailable(detail),
            _ => Self::Rejected(detail),
        }
    }
}

/// Text generation backend
#[async_trait]
pub trait Generator: Send + Sync {
    /// Short label for logs
    fn name(&self) -> &str;

    async fn generate_with_system(&self, prompt: &str, system: &str) -> Result<String, GenerationError>;

    async fn generate(&self, prompt: &str) -> Result<String, GenerationError> {
        self.generate_with_system(prompt, "").await
    }
}

/// Context retrieval. Never fails: any error yields an empty string.
#[async_trait]
pub trait Retriever: Send + Sync {
    async fn retrieve(&self, query: &str, user_id: &str, max_tokens: usize) -> String;
}

/// [`Retriever`] used when no retrieval service is configured
#[derive(Debug, Default, Clone, Copy)]
pub struct NoRetrieval;

#[async_trait]
impl Retriever for NoRetrieval {
    async fn retrieve(&self, _query: &str, _user_id: &str, _max_tokens: usize) -> String {
        String::new()
    }
}

/// Classifier output
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Classification {
    pub intent: Intent,
    pub confidence: f32,
}

/// Intent classifier
#[async_trait]
pub trait Classifier: Send + Sync {
    async fn classify(&self, text: &str) -> Result<Classification, GenerationError>;
}

/// Run `op`, retrying transient failures up to [`MAX_RETRIES`] times
pub async fn with_retry<T, F, Fut>(label: &str, op: F) -> Result<T, GenerationError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, GenerationError>>,
{
    with_retry_delay(label, RETRY_BASE_DELAY, op).await
}

pub async fn with_retry_delay<T, F, Fut>(label: &str, base_delay: Duration, mut op: F) -> Result<T, GenerationError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, GenerationError>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt < MAX_RETRIES => {
                attempt += 1;
                warn!(backend = label, attempt, error = %e, "Transient backend failure, retrying");
                tokio::time::sleep(base_delay * attempt).await;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn test_retry_recovers_from_transient_failure() {
        let calls = AtomicU32::new(0);
        let result = with_retry_delay("test", Duration::from_millis(1), || async {
            if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(GenerationError::Unavailable("connection refused".into()))
            } else {
                Ok("ok")
            }
        })
        .await;

        assert_eq!(result, Ok("ok"));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_retry_is_bounded() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = with_retry_delay("test", Duration::from_millis(1), || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(GenerationError::Timeout(5))
        })
        .await;

        assert_eq!(result, Err(GenerationError::Timeout(5)));
        assert_eq!(calls.load(Ordering::SeqCst), MAX_RETRIES + 1);
    }

    #[tokio::test]
    async fn test_rate_limit_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = with_retry_delay("test", Duration::from_millis(1), || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(GenerationError::RateLimited("429".into()))
        })
        .await;

        assert!(matches!(result, Err(GenerationError::RateLimited(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_status_mapping() {
        use reqwest::StatusCode;
        assert!(matches!(
            GenerationError::from_status(StatusCode::TOO_MANY_REQUESTS, ""),
            GenerationError::RateLimited(_)
        ));
        assert!(GenerationError::from_status(StatusCode::BAD_GATEWAY, "").is_transient());
        assert!(matches!(
            GenerationError::from_status(StatusCode::BAD_REQUEST, ""),
            GenerationError::Rejected(_)
        ));
    }
}

//! Configuration management
//!
//! Everything is read once from the environment (optionally seeded from
//! `.env`) into an immutable [`Config`].

use crate::skills::sandbox::{SandboxConfig, DEFAULT_SANDBOX_USER};
use crate::skills::sanitize::DEFAULT_MAX_INPUT_CHARS;
use anyhow::{bail, Context, Result};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Gateway configuration
#[derive(Clone)]
pub struct Config {
    /// This service's identity for signing and verifying
    pub service_id: String,

    /// Shared HMAC secret
    pub service_secret: String,

    /// Listen address
    pub bind: SocketAddr,

    /// Skills root (`<root>/<name>/SKILL.md`)
    pub skills_dir: PathBuf,

    /// OS identity for skill scripts (`None` = run as the service, development only)
    pub sandbox_user: Option<String>,
    pub sandbox_scratch_dir: Option<PathBuf>,
    pub sandbox_max_concurrency: usize,
    pub sandbox_max_output_bytes: usize,
    pub skill_max_input_chars: usize,

    /// Callers allowed to create approval requests and read their status
    pub producer_callers: Vec<String>,
    /// Callers allowed to list and resolve approvals, and reload skills
    pub operator_callers: Vec<String>,
    /// Callers allowed to run draft scripts through the sandbox
    pub sandbox_callers: Vec<String>,
    /// Callers allowed to submit user messages
    pub message_callers: Vec<String>,

    /// Our own base URL, used for the authenticated sandbox test call
    pub gateway_url: String,

    pub ollama_url: String,
    pub ollama_model: String,
    /// Local model used for drafting skills
    pub draft_model: String,
    pub anthropic_model: String,
    /// Secret-store key holding the cloud provider credential
    pub cloud_key_name: String,

    /// Operator-configured alternate backend used once under rate limiting
    pub alternate_url: Option<String>,
    pub alternate_model: Option<String>,

    /// Retrieval service (optional)
    pub rag_url: Option<String>,
    /// Classifier service (optional, keyword fallback otherwise)
    pub classifier_url: Option<String>,

    pub vault_path: PathBuf,
    pub vault_password: Option<String>,

    pub approval_poll: Duration,
    pub approval_max_wait: Duration,
    pub upstream_timeout: Duration,
    pub nonce_sweep: Duration,
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("service_id", &self.service_id)
            .field("service_secret", &"[REDACTED]")
            .field("bind", &self.bind)
            .field("skills_dir", &self.skills_dir)
            .field("sandbox_user", &self.sandbox_user)
            .field("gateway_url", &self.gateway_url)
            .field("ollama_url", &self.ollama_url)
            .field("rag_url", &self.rag_url)
            .field("classifier_url", &self.classifier_url)
            .field("vault_path", &self.vault_path)
            .field("vault_password", &self.vault_password.as_ref().map(|_| "[REDACTED]"))
            .finish_non_exhaustive()
    }
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup; `from_env` uses the process environment
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let service_id = var("SERVICE_ID").context("SERVICE_ID is required")?;
        let service_secret = var("SERVICE_SECRET").context("SERVICE_SECRET is required")?;

        let bind: SocketAddr = var("SECUREBOT_BIND")
            .unwrap_or_else(|| "0.0.0.0:8080".to_string())
            .parse()
            .context("SECUREBOT_BIND must be host:port")?;

        let skills_dir = var("SKILLS_DIR").map(PathBuf::from).unwrap_or_else(|| {
            dirs::data_local_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("securebot")
                .join("skills")
        });

        let sandbox_user = match var("SANDBOX_USER") {
            Some(user) if user.eq_ignore_ascii_case("none") => None,
            Some(user) => Some(user),
            None => Some(DEFAULT_SANDBOX_USER.to_string()),
        };

        let number = |key: &str, default: u64| -> Result<u64> {
            match var(key) {
                Some(v) => v.parse().with_context(|| format!("{} must be a number", key)),
                None => Ok(default),
            }
        };

        let sandbox_max_concurrency = number("SANDBOX_MAX_CONCURRENCY", 4)? as usize;
        if sandbox_max_concurrency == 0 {
            bail!("SANDBOX_MAX_CONCURRENCY must be at least 1");
        }

        let vault_path = var("VAULT_PATH").map(PathBuf::from).unwrap_or_else(|| {
            dirs::data_local_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("securebot")
                .join("vault.enc")
        });

        let port = bind.port();

        Ok(Self {
            bind,
            skills_dir,
            sandbox_user,
            sandbox_scratch_dir: var("SANDBOX_SCRATCH_DIR").map(PathBuf::from),
            sandbox_max_concurrency,
            sandbox_max_output_bytes: number("SANDBOX_MAX_OUTPUT_BYTES", 1024 * 1024)? as usize,
            skill_max_input_chars: number("SKILL_MAX_INPUT_CHARS", DEFAULT_MAX_INPUT_CHARS as u64)? as usize,
            producer_callers: var("PRODUCER_CALLERS").map(|v| split_list(&v)).unwrap_or_default(),
            operator_callers: var("OPERATOR_CALLERS").map(|v| split_list(&v)).unwrap_or_default(),
            sandbox_callers: var("SANDBOX_CALLERS")
                .map(|v| split_list(&v))
                .unwrap_or_else(|| vec![service_id.clone()]),
            message_callers: var("MESSAGE_CALLERS").map(|v| split_list(&v)).unwrap_or_default(),
            gateway_url: var("GATEWAY_URL").unwrap_or_else(|| format!("http://127.0.0.1:{}", port)),
            ollama_url: var("OLLAMA_URL").unwrap_or_else(|| "http://localhost:11434".to_string()),
            ollama_model: var("OLLAMA_MODEL").unwrap_or_else(|| "llama3.2:3b".to_string()),
            draft_model: var("DRAFT_MODEL").unwrap_or_else(|| "qwen2.5-coder:7b".to_string()),
            anthropic_model: var("ANTHROPIC_MODEL").unwrap_or_else(|| "claude-3-5-haiku-latest".to_string()),
            cloud_key_name: var("CLOUD_KEY_NAME").unwrap_or_else(|| "anthropic_api_key".to_string()),
            alternate_url: var("ALTERNATE_URL"),
            alternate_model: var("ALTERNATE_MODEL"),
            rag_url: var("RAG_URL"),
            classifier_url: var("CLASSIFIER_URL"),
            vault_path,
            vault_password: var("VAULT_PASSWORD"),
            approval_poll: Duration::from_secs(number("APPROVAL_POLL_SECS", 5)?.max(1)),
            approval_max_wait: Duration::from_secs(
                number("APPROVAL_MAX_WAIT_SECS", 300)?.min(crate::approvals::PENDING_RETENTION_SECS / 2),
            ),
            upstream_timeout: Duration::from_secs(number("UPSTREAM_TIMEOUT_SECS", 120)?.max(1)),
            nonce_sweep: Duration::from_secs(number("NONCE_SWEEP_SECS", 30)?.max(1)),
            service_id,
            service_secret,
        })
    }

    pub fn sandbox(&self) -> SandboxConfig {
        SandboxConfig {
            sandbox_user: self.sandbox_user.clone(),
            scratch_dir: self.sandbox_scratch_dir.clone(),
            max_output_bytes: self.sandbox_max_output_bytes,
            max_concurrency: self.sandbox_max_concurrency,
            max_input_chars: self.skill_max_input_chars,
            ..SandboxConfig::default()
        }
    }

    /// Producers plus this service, which raises approvals from the escalation chain
    pub fn approval_producers(&self) -> Vec<String> {
        let mut producers = self.producer_callers.clone();
        if !producers.contains(&self.service_id) {
            producers.push(self.service_id.clone());
        }
        producers
    }
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(pairs: &[(&str, &str)]) -> Result<Config> {
        let map: HashMap<String, String> = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        Config::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let cfg = config(&[("SERVICE_ID", "gateway"), ("SERVICE_SECRET", "s3cret")]).unwrap();
        assert_eq!(cfg.bind.port(), 8080);
        assert_eq!(cfg.sandbox_user.as_deref(), Some(DEFAULT_SANDBOX_USER));
        assert_eq!(cfg.sandbox_max_concurrency, 4);
        assert_eq!(cfg.sandbox_max_output_bytes, 1024 * 1024);
        assert_eq!(cfg.skill_max_input_chars, 2000);
        assert_eq!(cfg.approval_poll, Duration::from_secs(5));
        assert_eq!(cfg.approval_max_wait, Duration::from_secs(300));
        assert_eq!(cfg.sandbox_callers, vec!["gateway".to_string()]);
        assert_eq!(cfg.gateway_url, "http://127.0.0.1:8080");
        assert!(cfg.rag_url.is_none());
        assert!(cfg.approval_producers().contains(&"gateway".to_string()));
    }

    #[test]
    fn test_missing_identity_fails() {
        assert!(config(&[("SERVICE_ID", "gateway")]).is_err());
        assert!(config(&[("SERVICE_ID", "gateway"), ("SERVICE_SECRET", "  ")]).is_err());
    }

    #[test]
    fn test_lists_and_overrides() {
        let cfg = config(&[
            ("SERVICE_ID", "gateway"),
            ("SERVICE_SECRET", "s3cret"),
            ("OPERATOR_CALLERS", "admin-ui, cli ,,"),
            ("SANDBOX_USER", "none"),
            ("APPROVAL_POLL_SECS", "2"),
            ("SECUREBOT_BIND", "127.0.0.1:9000"),
        ])
        .unwrap();
        assert_eq!(cfg.operator_callers, vec!["admin-ui".to_string(), "cli".to_string()]);
        assert!(cfg.sandbox_user.is_none());
        assert!(cfg.sandbox().sandbox_user.is_none());
        assert_eq!(cfg.approval_poll, Duration::from_secs(2));
        assert_eq!(cfg.gateway_url, "http://127.0.0.1:9000");
    }

    #[test]
    fn test_bad_numbers_are_errors() {
        assert!(config(&[
            ("SERVICE_ID", "gateway"),
            ("SERVICE_SECRET", "s3cret"),
            ("SANDBOX_MAX_CONCURRENCY", "lots"),
        ])
        .is_err());
        assert!(config(&[
            ("SERVICE_ID", "gateway"),
            ("SERVICE_SECRET", "s3cret"),
            ("SANDBOX_MAX_CONCURRENCY", "0"),
        ])
        .is_err());
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let cfg = config(&[
            ("SERVICE_ID", "gateway"),
            ("SERVICE_SECRET", "s3cret"),
            ("VAULT_PASSWORD", "hunter2"),
        ])
        .unwrap();
        let debug = format!("{:?}", cfg);
        assert!(!debug.contains("s3cret"));
        assert!(!debug.contains("hunter2"));
    }
}

//! Composition root
//!
//! Builds every shared component once and hands them out through
//! [`AppContext`]. Nothing in the crate keeps process-wide globals.

use crate::approvals::ApprovalQueue;
use crate::auth::{ServiceIdentity, SignedClient, Verifier};
use crate::backends::{
    ClaudeGenerator, Classifier, Generator, HttpClassifier, HttpRetriever, KeywordClassifier, NoRetrieval,
    OllamaGenerator, Retriever,
};
use crate::config::Config;
use crate::escalation::{EscalationChain, EscalationConfig, HttpSandboxTester};
use crate::router::{ActionPipeline, IntentRouter, KnowledgePipeline};
use crate::skills::{SkillExecutor, SkillRegistry, SudoDrop};
use crate::vault::{FileVault, MemorySecretStore, SecretStore};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{info, warn};

/// Shared state for the HTTP layer and background tasks
pub struct AppContext {
    pub config: Arc<Config>,
    pub verifier: Arc<Verifier>,
    pub registry: Arc<SkillRegistry>,
    pub executor: Arc<SkillExecutor>,
    pub approvals: Arc<ApprovalQueue>,
    pub router: Arc<IntentRouter>,
    pub started_at: DateTime<Utc>,
}

impl AppContext {
    /// Wire production components from configuration
    pub fn from_config(config: Config) -> Result<Self> {
        let config = Arc::new(config);
        let timeout = config.upstream_timeout;

        let mut callers: Vec<String> = Vec::new();
        for list in [
            &config.producer_callers,
            &config.operator_callers,
            &config.sandbox_callers,
            &config.message_callers,
        ] {
            for caller in list {
                if !callers.contains(caller) {
                    callers.push(caller.clone());
                }
            }
        }
        let identity = ServiceIdentity::new(&config.service_id, &config.service_secret, callers)
            .context("invalid service identity")?;
        let verifier = Arc::new(Verifier::new(identity.clone()));
        let signed = || SignedClient::new(identity.clone(), timeout);

        let secrets: Arc<dyn SecretStore> = match &config.vault_password {
            Some(password) => {
                let vault = FileVault::open(&config.vault_path, password)
                    .with_context(|| format!("failed to open vault at {}", config.vault_path.display()))?;
                info!(path = %config.vault_path.display(), secrets = vault.names().len(), "Vault opened");
                Arc::new(vault)
            }
            None => {
                warn!("VAULT_PASSWORD not set, secrets are kept in memory only");
                Arc::new(MemorySecretStore::new())
            }
        };

        std::fs::create_dir_all(&config.skills_dir)
            .with_context(|| format!("failed to create skills dir {}", config.skills_dir.display()))?;
        let registry = Arc::new(SkillRegistry::new(&config.skills_dir));
        registry.reload().context("failed to load skills")?;

        let sandbox = config.sandbox();
        if sandbox.sandbox_user.is_none() {
            warn!("SANDBOX_USER=none: skills run as the gateway's own user");
        }
        let local: Arc<dyn Generator> = Arc::new(OllamaGenerator::new(&config.ollama_url, &config.ollama_model, timeout));
        let executor = Arc::new(SkillExecutor::new(
            Arc::new(SudoDrop::from_config(&sandbox)),
            Arc::clone(&local),
            &sandbox,
        ));

        let approvals = Arc::new(ApprovalQueue::new(Arc::clone(&secrets), config.approval_producers()));

        let drafter: Arc<dyn Generator> = Arc::new(
            OllamaGenerator::new(&config.ollama_url, &config.draft_model, timeout).with_label("drafter"),
        );
        let cloud: Arc<dyn Generator> = Arc::new(ClaudeGenerator::new(
            Arc::clone(&secrets),
            &config.cloud_key_name,
            &config.anthropic_model,
            timeout,
        ));
        let escalation_config = EscalationConfig {
            approval_poll: config.approval_poll,
            approval_max_wait: config.approval_max_wait,
            ..EscalationConfig::new(&config.service_id)
        };
        let mut chain = EscalationChain::new(
            Arc::clone(&registry),
            Arc::clone(&executor),
            Arc::clone(&approvals),
            Arc::new(HttpSandboxTester::new(signed(), &config.gateway_url)),
            drafter,
            cloud,
            escalation_config,
        );
        if let (Some(url), Some(model)) = (&config.alternate_url, &config.alternate_model) {
            info!(url = %url, model = %model, "Alternate backend configured");
            chain = chain.with_alternate(Arc::new(OllamaGenerator::new(url, model, timeout).with_label("alternate")));
        }

        let retriever: Arc<dyn Retriever> = match &config.rag_url {
            Some(url) => Arc::new(HttpRetriever::new(signed(), url)),
            None => {
                info!("RAG_URL not set, knowledge answers run without context");
                Arc::new(NoRetrieval)
            }
        };
        let classifier: Arc<dyn Classifier> = match &config.classifier_url {
            Some(url) => Arc::new(HttpClassifier::new(signed(), url, timeout)),
            None => Arc::new(KeywordClassifier::new()),
        };

        let router = IntentRouter::new(
            classifier,
            ActionPipeline::new(Arc::clone(&registry), Arc::clone(&executor)).with_escalation(Arc::new(chain)),
            KnowledgePipeline::new(retriever, Arc::clone(&local)),
        )
        .with_fallback(local);

        Ok(Self {
            config,
            verifier,
            registry,
            executor,
            approvals,
            router: Arc::new(router),
            started_at: Utc::now(),
        })
    }
}

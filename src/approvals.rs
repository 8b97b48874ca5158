//! Approval Queue
//!
//! Human-in-the-loop requests raised by the escalation chain (or any
//! allow-listed producer) and answered by an operator.
//!
//! - `pending -> resolved` happens exactly once; a second resolve fails and
//!   changes nothing
//! - A credential is handed straight to the secret store; the queue only keeps
//!   the key name as a reference
//! - Entries live in process memory. A restart drops them and any waiter
//!   simply runs into its own timeout

use crate::vault::{validate_secret_name, SecretStore};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Resolved entries are dropped after this long
const RESOLVED_RETENTION: chrono::Duration = chrono::Duration::hours(1);

/// Notifications need no answer and are dropped this long after creation
const NOTIFICATION_RETENTION: chrono::Duration = chrono::Duration::hours(1);

/// Requests nobody answered (their waiter timed out or was cancelled) are
/// dropped this long after creation. Approval waits are capped below it.
pub const PENDING_RETENTION_SECS: u64 = 24 * 3600;

const MAX_RATIONALE_CHARS: usize = 2000;
const MAX_VALUE_CHARS: usize = 8192;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ApprovalError {
    #[error("approval {0} not found")]
    NotFound(Uuid),

    #[error("approval {0} already resolved")]
    AlreadyResolved(Uuid),

    #[error("caller '{0}' may not access this approval")]
    Forbidden(String),

    #[error("invalid approval: {0}")]
    Invalid(String),

    #[error("secret store write failed: {0}")]
    SecretStore(String),

    #[error("approval {0} not resolved in time")]
    TimedOut(Uuid),

    #[error("wait for approval {0} cancelled")]
    Cancelled(Uuid),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalKind {
    /// A secret is needed; resolution must name a secret-store key
    Credential,
    /// Go-ahead for an irreversible action
    Permission,
    /// Informational only, never blocks anything
    Notification,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalStatus {
    Pending,
    Resolved,
}

/// What an operator answered with
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Resolution {
    /// Non-secret answer (permission decisions, acknowledgements)
    Value(String),
    /// Name of the secret-store key now holding the value
    SecretRef(String),
}

#[derive(Debug, Clone, Serialize)]
pub struct ApprovalRequest {
    pub id: Uuid,
    pub requester: String,
    pub rationale: String,
    pub kind: ApprovalKind,
    /// What the requester asked for, e.g. the key name of a needed credential
    pub need: Option<String>,
    pub created_at: DateTime<Utc>,
    pub status: ApprovalStatus,
    pub resolution: Option<Resolution>,
    pub resolver: Option<String>,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl ApprovalRequest {
    pub fn is_resolved(&self) -> bool {
        self.status == ApprovalStatus::Resolved
    }
}

struct Entry {
    request: ApprovalRequest,
    /// A resolve is in flight (secret store write); counts as taken
    resolving: bool,
}

/// In-memory approval queue
pub struct ApprovalQueue {
    entries: Mutex<HashMap<Uuid, Entry>>,
    secrets: Arc<dyn SecretStore>,
    producers: Vec<String>,
}

impl ApprovalQueue {
    pub fn new(secrets: Arc<dyn SecretStore>, producers: Vec<String>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            secrets,
            producers,
        }
    }

    fn check_producer(&self, caller: &str) -> Result<(), ApprovalError> {
        if self.producers.iter().any(|p| p == caller) {
            Ok(())
        } else {
            Err(ApprovalError::Forbidden(caller.to_string()))
        }
    }

    /// Queue a new request. `requester` is an authenticated service identity.
    pub fn create(
        &self,
        requester: &str,
        rationale: &str,
        kind: ApprovalKind,
        need: Option<&str>,
    ) -> Result<Uuid, ApprovalError> {
        self.check_producer(requester)?;

        let rationale = rationale.trim();
        if rationale.is_empty() {
            return Err(ApprovalError::Invalid("rationale is required".to_string()));
        }
        if rationale.chars().count() > MAX_RATIONALE_CHARS {
            return Err(ApprovalError::Invalid("rationale too long".to_string()));
        }
        let need = need.map(str::trim).filter(|n| !n.is_empty());
        if let (ApprovalKind::Credential, Some(key)) = (kind, need) {
            validate_secret_name(key).map_err(|e| ApprovalError::Invalid(e.to_string()))?;
        }

        let id = Uuid::new_v4();
        let request = ApprovalRequest {
            id,
            requester: requester.to_string(),
            rationale: rationale.to_string(),
            kind,
            need: need.map(str::to_string),
            created_at: Utc::now(),
            status: ApprovalStatus::Pending,
            resolution: None,
            resolver: None,
            resolved_at: None,
        };

        let mut entries = self.entries.lock();
        prune_expired(&mut entries, Utc::now());
        entries.insert(
            id,
            Entry {
                request,
                resolving: false,
            },
        );
        info!(request_id = %id, requester, kind = ?kind, "Approval requested");
        Ok(id)
    }

    /// Informational entry for operators. Failures are logged, never returned.
    pub fn notify(&self, requester: &str, message: &str) -> Option<Uuid> {
        match self.create(requester, message, ApprovalKind::Notification, None) {
            Ok(id) => Some(id),
            Err(e) => {
                warn!(requester, error = %e, "Could not queue notification");
                None
            }
        }
    }

    /// Pending requests, oldest first
    pub fn list_pending(&self) -> Vec<ApprovalRequest> {
        let entries = self.entries.lock();
        let mut pending: Vec<ApprovalRequest> = entries
            .values()
            .filter(|e| e.request.status == ApprovalStatus::Pending)
            .map(|e| e.request.clone())
            .collect();
        pending.sort_by_key(|r| r.created_at);
        pending
    }

    pub fn pending_count(&self) -> usize {
        self.entries
            .lock()
            .values()
            .filter(|e| e.request.status == ApprovalStatus::Pending)
            .count()
    }

    /// Drop expired entries as of `now`. Returns how many were removed.
    pub fn prune(&self, now: DateTime<Utc>) -> usize {
        let mut entries = self.entries.lock();
        let removed = prune_expired(&mut entries, now);
        if removed > 0 {
            debug!(removed, remaining = entries.len(), "Pruned expired approvals");
        }
        removed
    }

    /// Resolve exactly once. With a key name (mandatory for credentials) the
    /// value goes to the secret store and only the key name is kept.
    pub async fn resolve(
        &self,
        id: Uuid,
        value: &str,
        key_name: Option<&str>,
        resolver: &str,
    ) -> Result<ApprovalRequest, ApprovalError> {
        if value.chars().count() > MAX_VALUE_CHARS {
            return Err(ApprovalError::Invalid("value too long".to_string()));
        }

        // Claim the entry; nothing else can resolve it from here on
        let key_name = {
            let mut entries = self.entries.lock();
            let entry = entries.get_mut(&id).ok_or(ApprovalError::NotFound(id))?;
            if entry.resolving || entry.request.is_resolved() {
                warn!(request_id = %id, resolver, "Approval already resolved");
                return Err(ApprovalError::AlreadyResolved(id));
            }

            let key_name = key_name
                .map(str::trim)
                .filter(|k| !k.is_empty())
                .map(str::to_string);
            if entry.request.kind == ApprovalKind::Credential && key_name.is_none() {
                return Err(ApprovalError::Invalid(
                    "credential resolutions require a key name".to_string(),
                ));
            }
            if let Some(key) = &key_name {
                validate_secret_name(key).map_err(|e| ApprovalError::Invalid(e.to_string()))?;
            }

            entry.resolving = true;
            key_name
        };

        let resolution = match key_name {
            Some(key) => {
                if let Err(e) = self.secrets.put_secret(&key, value).await {
                    warn!(request_id = %id, key = %key, error = %e, "Secret store write failed");
                    if let Some(entry) = self.entries.lock().get_mut(&id) {
                        entry.resolving = false;
                    }
                    return Err(ApprovalError::SecretStore(e.to_string()));
                }
                Resolution::SecretRef(key)
            }
            None => Resolution::Value(value.to_string()),
        };

        let mut entries = self.entries.lock();
        let entry = entries.get_mut(&id).ok_or(ApprovalError::NotFound(id))?;
        entry.request.status = ApprovalStatus::Resolved;
        entry.request.resolution = Some(resolution);
        entry.request.resolver = Some(resolver.to_string());
        entry.request.resolved_at = Some(Utc::now());
        entry.resolving = false;

        info!(request_id = %id, resolver, "Approval resolved");
        Ok(entry.request.clone())
    }

    /// Status for the producer that created the request
    pub fn get_status(&self, id: Uuid, caller: &str) -> Result<ApprovalRequest, ApprovalError> {
        self.check_producer(caller)?;
        let request = self.get(id).ok_or(ApprovalError::NotFound(id))?;
        if request.requester != caller {
            return Err(ApprovalError::Forbidden(caller.to_string()));
        }
        Ok(request)
    }

    /// Snapshot of one request, without access checks
    pub fn get(&self, id: Uuid) -> Option<ApprovalRequest> {
        self.entries.lock().get(&id).map(|e| e.request.clone())
    }

    /// Poll until resolved, `max_wait` elapses, or `cancel` fires.
    ///
    /// Runs on the caller's task; dropping the future ends the wait.
    pub async fn wait_for_resolution(
        &self,
        id: Uuid,
        poll_interval: Duration,
        max_wait: Duration,
        cancel: &CancellationToken,
    ) -> Result<ApprovalRequest, ApprovalError> {
        let deadline = Instant::now() + max_wait;
        loop {
            let request = self.get(id).ok_or(ApprovalError::NotFound(id))?;
            if request.is_resolved() {
                return Ok(request);
            }

            let now = Instant::now();
            if now >= deadline {
                warn!(request_id = %id, waited_secs = max_wait.as_secs(), "Approval wait timed out");
                return Err(ApprovalError::TimedOut(id));
            }

            debug!(request_id = %id, "Waiting for approval");
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!(request_id = %id, "Approval wait cancelled");
                    return Err(ApprovalError::Cancelled(id));
                }
                _ = tokio::time::sleep(poll_interval.min(deadline - now)) => {}
            }
        }
    }
}

fn prune_expired(entries: &mut HashMap<Uuid, Entry>, now: DateTime<Utc>) -> usize {
    let before = entries.len();
    let pending_retention = chrono::Duration::seconds(PENDING_RETENTION_SECS as i64);
    entries.retain(|_, e| {
        // An entry mid-resolve is never dropped under its resolver
        if e.resolving {
            return true;
        }
        let request = &e.request;
        match request.resolved_at {
            Some(at) => now - at < RESOLVED_RETENTION,
            None if request.kind == ApprovalKind::Notification => now - request.created_at < NOTIFICATION_RETENTION,
            None => now - request.created_at < pending_retention,
        }
    });
    before - entries.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vault::{MemorySecretStore, VaultError};
    use async_trait::async_trait;

    fn queue() -> (ApprovalQueue, Arc<MemorySecretStore>) {
        let secrets = Arc::new(MemorySecretStore::new());
        let queue = ApprovalQueue::new(secrets.clone(), vec!["codebot".to_string(), "gateway".to_string()]);
        (queue, secrets)
    }

    struct BrokenStore;

    #[async_trait]
    impl SecretStore for BrokenStore {
        async fn get_secret(&self, _: &str) -> Result<Option<String>, VaultError> {
            Ok(None)
        }
        async fn put_secret(&self, _: &str, _: &str) -> Result<(), VaultError> {
            Err(VaultError::Encryption("disk full".to_string()))
        }
    }

    #[tokio::test]
    async fn test_credential_goes_to_secret_store() {
        let (queue, secrets) = queue();
        let id = queue
            .create("codebot", "need API key", ApprovalKind::Credential, None)
            .unwrap();
        assert_eq!(queue.list_pending().len(), 1);

        queue.resolve(id, "X", Some("provider_key"), "operator").await.unwrap();

        let status = queue.get_status(id, "codebot").unwrap();
        assert_eq!(status.status, ApprovalStatus::Resolved);
        assert_eq!(status.resolution, Some(Resolution::SecretRef("provider_key".to_string())));
        assert_eq!(secrets.get_secret("provider_key").await.unwrap().as_deref(), Some("X"));

        let serialized = serde_json::to_string(&status).unwrap();
        assert!(!serialized.contains("\"X\""));
        assert!(queue.list_pending().is_empty());
    }

    #[tokio::test]
    async fn test_second_resolve_fails_and_keeps_value() {
        let (queue, _) = queue();
        let id = queue
            .create("codebot", "delete old backups?", ApprovalKind::Permission, None)
            .unwrap();

        queue.resolve(id, "approved", None, "alice").await.unwrap();
        assert_eq!(
            queue.resolve(id, "denied", None, "bob").await.unwrap_err(),
            ApprovalError::AlreadyResolved(id)
        );

        let request = queue.get(id).unwrap();
        assert_eq!(request.resolution, Some(Resolution::Value("approved".to_string())));
        assert_eq!(request.resolver.as_deref(), Some("alice"));
    }

    #[tokio::test]
    async fn test_concurrent_resolves_exactly_one_wins() {
        let (queue, _) = queue();
        let queue = Arc::new(queue);
        let id = queue.create("codebot", "go?", ApprovalKind::Permission, None).unwrap();

        let mut handles = Vec::new();
        for i in 0..8 {
            let queue = Arc::clone(&queue);
            handles.push(tokio::spawn(async move {
                queue.resolve(id, &format!("v{}", i), None, "op").await.is_ok()
            }));
        }
        let mut wins = 0;
        for handle in handles {
            if handle.await.unwrap() {
                wins += 1;
            }
        }
        assert_eq!(wins, 1);
    }

    #[tokio::test]
    async fn test_credential_without_key_rejected() {
        let (queue, _) = queue();
        let id = queue.create("codebot", "need key", ApprovalKind::Credential, None).unwrap();
        assert!(matches!(
            queue.resolve(id, "X", None, "op").await,
            Err(ApprovalError::Invalid(_))
        ));
        assert!(!queue.get(id).unwrap().is_resolved());
    }

    #[tokio::test]
    async fn test_failed_secret_write_leaves_request_pending() {
        let queue = ApprovalQueue::new(Arc::new(BrokenStore), vec!["codebot".to_string()]);
        let id = queue.create("codebot", "need key", ApprovalKind::Credential, None).unwrap();

        assert!(matches!(
            queue.resolve(id, "X", Some("provider_key"), "op").await,
            Err(ApprovalError::SecretStore(_))
        ));
        let request = queue.get(id).unwrap();
        assert_eq!(request.status, ApprovalStatus::Pending);
        assert!(request.resolution.is_none());
    }

    #[test]
    fn test_access_checks() {
        let (queue, _) = queue();
        assert!(matches!(
            queue.create("rag-service", "x", ApprovalKind::Permission, None),
            Err(ApprovalError::Forbidden(_))
        ));

        let id = queue.create("codebot", "x", ApprovalKind::Permission, None).unwrap();
        assert!(matches!(queue.get_status(id, "gateway"), Err(ApprovalError::Forbidden(_))));
        assert!(matches!(
            queue.get_status(Uuid::new_v4(), "codebot"),
            Err(ApprovalError::NotFound(_))
        ));
        assert!(queue.create("codebot", "  ", ApprovalKind::Permission, None).is_err());
    }

    #[tokio::test]
    async fn test_stale_entries_are_pruned() {
        let (queue, _) = queue();
        let notice = queue.notify("gateway", "cloud rate limited, using alternate").unwrap();
        let open = queue.create("gateway", "restart web server?", ApprovalKind::Permission, None).unwrap();
        let done = queue.create("codebot", "go?", ApprovalKind::Permission, None).unwrap();
        queue.resolve(done, "approved", None, "op").await.unwrap();

        assert_eq!(queue.prune(Utc::now()), 0);

        // Notifications and resolved entries go first
        assert_eq!(queue.prune(Utc::now() + chrono::Duration::hours(2)), 2);
        assert!(queue.get(notice).is_none());
        assert!(queue.get(done).is_none());
        assert_eq!(queue.pending_count(), 1);

        // An abandoned request does not stay pending forever
        let later = Utc::now() + chrono::Duration::seconds(PENDING_RETENTION_SECS as i64 + 1);
        assert_eq!(queue.prune(later), 1);
        assert!(queue.get(open).is_none());
        assert!(queue.list_pending().is_empty());
    }

    #[tokio::test]
    async fn test_wait_returns_once_resolved() {
        let (queue, _) = queue();
        let queue = Arc::new(queue);
        let id = queue.create("gateway", "go?", ApprovalKind::Permission, None).unwrap();

        let resolver = Arc::clone(&queue);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            resolver.resolve(id, "approved", None, "op").await.unwrap();
        });

        let request = queue
            .wait_for_resolution(id, Duration::from_millis(10), Duration::from_secs(5), &CancellationToken::new())
            .await
            .unwrap();
        assert!(request.is_resolved());
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_times_out() {
        let (queue, _) = queue();
        let id = queue.create("gateway", "go?", ApprovalKind::Permission, None).unwrap();

        let result = queue
            .wait_for_resolution(id, Duration::from_secs(5), Duration::from_secs(300), &CancellationToken::new())
            .await;
        assert_eq!(result.unwrap_err(), ApprovalError::TimedOut(id));
    }

    #[tokio::test]
    async fn test_wait_is_cancellable() {
        let (queue, _) = queue();
        let id = queue.create("gateway", "go?", ApprovalKind::Permission, None).unwrap();
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let result = queue
            .wait_for_resolution(id, Duration::from_secs(5), Duration::from_secs(300), &cancel)
            .await;
        assert_eq!(result.unwrap_err(), ApprovalError::Cancelled(id));
    }
}

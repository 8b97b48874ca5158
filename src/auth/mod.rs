//! Inter-Service Authentication
//!
//! HMAC-SHA256 request signing shared by every SecureBot service.
//!
//! # Wire format
//!
//! ```text
//! X-Service-ID: gateway
//! X-Timestamp:  1718000000
//! X-Nonce:      9f2c61d04ab3e7c5
//! X-Signature:  sha256=<hex hmac over "service_id:timestamp:nonce:METHOD:path">
//! ```
//!
//! # Checks (fail closed, in order)
//!
//! 1. All four headers present
//! 2. Caller is on the route's allow-list
//! 3. Timestamp within ±30s of local time
//! 4. Signature matches (constant-time)
//! 5. Nonce unseen within the 60s replay window
//!
//! Every rejection surfaces externally as the same `unauthorized` response.
//! The specific reason is only written to the log.
//!
//! The nonce cache is process-local. Replay protection holds per process;
//! several independent workers behind a load balancer need sticky routing
//! or a shared nonce store.

pub mod client;
pub mod middleware;

pub use client::SignedClient;
pub use middleware::{require_service, CallerIdentity, RouteAuth};

use hmac::{Hmac, Mac};
use parking_lot::Mutex;
use rand::RngCore;
use sha2::Sha256;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

type HmacSha256 = Hmac<Sha256>;

pub const HEADER_SERVICE_ID: &str = "x-service-id";
pub const HEADER_TIMESTAMP: &str = "x-timestamp";
pub const HEADER_NONCE: &str = "x-nonce";
pub const HEADER_SIGNATURE: &str = "x-signature";

/// Accepted clock skew between caller and verifier (seconds)
pub const TIMESTAMP_WINDOW_SECS: i64 = 30;

/// How long a nonce stays in the replay cache (seconds), inclusive.
/// Must cover the full ±TIMESTAMP_WINDOW_SECS span a single header can be accepted in.
pub const NONCE_WINDOW_SECS: i64 = 2 * TIMESTAMP_WINDOW_SECS;

const SIGNATURE_PREFIX: &str = "sha256=";
const MAX_NONCE_LEN: usize = 128;

/// Why a request was rejected. Internal only: never sent to the caller.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("missing authentication header: {0}")]
    MissingHeader(&'static str),

    #[error("caller '{0}' is not on the allow-list")]
    CallerNotAllowed(String),

    #[error("malformed timestamp")]
    MalformedTimestamp,

    #[error("timestamp outside window (skew {0}s)")]
    TimestampExpired(i64),

    #[error("malformed nonce")]
    MalformedNonce,

    #[error("signature mismatch")]
    BadSignature,

    #[error("nonce replayed")]
    ReplayedNonce,

    #[error("signing identity not configured")]
    NotConfigured,
}

/// This service's identity. Loaded at startup, read-only afterwards.
#[derive(Clone)]
pub struct ServiceIdentity {
    pub service_id: String,
    secret: Arc<[u8]>,
    pub allowed_callers: Vec<String>,
}

impl ServiceIdentity {
    pub fn new(service_id: &str, secret: &str, allowed_callers: Vec<String>) -> Result<Self, AuthError> {
        if service_id.is_empty() || secret.is_empty() {
            return Err(AuthError::NotConfigured);
        }
        Ok(Self {
            service_id: service_id.to_string(),
            secret: Arc::from(secret.as_bytes()),
            allowed_callers,
        })
    }

    pub(crate) fn secret(&self) -> &[u8] {
        &self.secret
    }
}

impl std::fmt::Debug for ServiceIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceIdentity")
            .field("service_id", &self.service_id)
            .field("secret", &"<redacted>")
            .field("allowed_callers", &self.allowed_callers)
            .finish()
    }
}

fn signing_message(service_id: &str, timestamp: &str, nonce: &str, method: &str, path: &str) -> String {
    format!("{}:{}:{}:{}:{}", service_id, timestamp, nonce, method.to_uppercase(), path)
}

/// HMAC-SHA256 over `serviceId:timestamp:nonce:METHOD:path`, hex encoded.
pub fn sign(service_id: &str, secret: &[u8], method: &str, path: &str, timestamp: i64, nonce: &str) -> String {
    let mut mac = HmacSha256::new_from_slice(secret).expect("HMAC accepts any key length");
    mac.update(signing_message(service_id, &timestamp.to_string(), nonce, method, path).as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// The four authentication headers of one request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthHeaders {
    pub service_id: String,
    pub timestamp: String,
    pub nonce: String,
    pub signature: String,
}

impl AuthHeaders {
    /// Sign an outgoing request with a fresh nonce and the current time
    pub fn generate(identity: &ServiceIdentity, method: &str, path: &str) -> Self {
        Self::generate_at(identity, method, path, chrono::Utc::now().timestamp())
    }

    pub fn generate_at(identity: &ServiceIdentity, method: &str, path: &str, timestamp: i64) -> Self {
        let mut bytes = [0u8; 8];
        rand::thread_rng().fill_bytes(&mut bytes);
        let nonce = hex::encode(bytes);
        let signature = sign(&identity.service_id, identity.secret(), method, path, timestamp, &nonce);

        Self {
            service_id: identity.service_id.clone(),
            timestamp: timestamp.to_string(),
            nonce,
            signature: format!("{}{}", SIGNATURE_PREFIX, signature),
        }
    }

    /// Extract from an incoming header map; any missing or non-ASCII header is a rejection
    pub fn from_header_map(headers: &axum::http::HeaderMap) -> Result<Self, AuthError> {
        fn get(headers: &axum::http::HeaderMap, name: &'static str) -> Result<String, AuthError> {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(str::to_string)
                .ok_or(AuthError::MissingHeader(name))
        }

        Ok(Self {
            service_id: get(headers, HEADER_SERVICE_ID)?,
            timestamp: get(headers, HEADER_TIMESTAMP)?,
            nonce: get(headers, HEADER_NONCE)?,
            signature: get(headers, HEADER_SIGNATURE)?,
        })
    }

    pub fn pairs(&self) -> [(&'static str, &str); 4] {
        [
            (HEADER_SERVICE_ID, self.service_id.as_str()),
            (HEADER_TIMESTAMP, self.timestamp.as_str()),
            (HEADER_NONCE, self.nonce.as_str()),
            (HEADER_SIGNATURE, self.signature.as_str()),
        ]
    }
}

/// Replay cache: nonce -> first-seen time (unix seconds)
#[derive(Debug, Default)]
pub struct NonceCache {
    seen: Mutex<HashMap<String, i64>>,
}

impl NonceCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the nonce. Returns false if it was already seen inside the window.
    pub fn check_and_insert(&self, nonce: &str, now: i64) -> bool {
        let mut seen = self.seen.lock();
        match seen.get(nonce) {
            Some(first_seen) if now - *first_seen <= NONCE_WINDOW_SECS => false,
            _ => {
                seen.insert(nonce.to_string(), now);
                true
            }
        }
    }

    /// Drop entries older than the replay window. Returns how many were removed.
    pub fn purge(&self, now: i64) -> usize {
        let mut seen = self.seen.lock();
        let before = seen.len();
        seen.retain(|_, first_seen| now - *first_seen <= NONCE_WINDOW_SECS);
        before - seen.len()
    }

    pub fn len(&self) -> usize {
        self.seen.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Periodic purge task. Aborted when the returned handle is dropped by the runtime shutdown.
    pub fn spawn_sweeper(self: &Arc<Self>, every: Duration) -> tokio::task::JoinHandle<()> {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            loop {
                ticker.tick().await;
                let removed = cache.purge(chrono::Utc::now().timestamp());
                if removed > 0 {
                    debug!(removed, remaining = cache.len(), "Purged expired nonces");
                }
            }
        })
    }
}

/// Verifies signed requests against this service's secret
pub struct Verifier {
    identity: ServiceIdentity,
    nonces: Arc<NonceCache>,
}

impl Verifier {
    pub fn new(identity: ServiceIdentity) -> Self {
        Self {
            identity,
            nonces: Arc::new(NonceCache::new()),
        }
    }

    pub fn nonces(&self) -> &Arc<NonceCache> {
        &self.nonces
    }

    /// Verify against the identity's default allow-list
    pub fn verify(&self, headers: &AuthHeaders, method: &str, path: &str) -> Result<String, AuthError> {
        self.verify_for(headers, method, path, &self.identity.allowed_callers)
    }

    /// Verify against an explicit allow-list. Returns the authenticated caller id.
    pub fn verify_for(
        &self,
        headers: &AuthHeaders,
        method: &str,
        path: &str,
        allowed_callers: &[String],
    ) -> Result<String, AuthError> {
        self.verify_at(headers, method, path, allowed_callers, chrono::Utc::now().timestamp())
    }

    pub fn verify_at(
        &self,
        headers: &AuthHeaders,
        method: &str,
        path: &str,
        allowed_callers: &[String],
        now: i64,
    ) -> Result<String, AuthError> {
        let result = self.check(headers, method, path, allowed_callers, now);
        match &result {
            Ok(caller) => info!(caller = %caller, method, path, "Auth accepted"),
            Err(reason) => warn!(
                caller = %headers.service_id,
                method,
                path,
                reason = %reason,
                "Auth rejected"
            ),
        }
        result
    }

    fn check(
        &self,
        headers: &AuthHeaders,
        method: &str,
        path: &str,
        allowed_callers: &[String],
        now: i64,
    ) -> Result<String, AuthError> {
        if !allowed_callers.iter().any(|c| c == &headers.service_id) {
            return Err(AuthError::CallerNotAllowed(headers.service_id.clone()));
        }

        let timestamp: i64 = headers
            .timestamp
            .parse()
            .map_err(|_| AuthError::MalformedTimestamp)?;
        let skew = (now - timestamp).abs();
        if skew > TIMESTAMP_WINDOW_SECS {
            return Err(AuthError::TimestampExpired(skew));
        }

        if headers.nonce.len() > MAX_NONCE_LEN || !headers.nonce.chars().all(|c| c.is_ascii_graphic()) {
            return Err(AuthError::MalformedNonce);
        }

        let provided = headers
            .signature
            .strip_prefix(SIGNATURE_PREFIX)
            .unwrap_or(&headers.signature);
        let provided = hex::decode(provided).map_err(|_| AuthError::BadSignature)?;

        let mut mac = HmacSha256::new_from_slice(self.identity.secret()).map_err(|_| AuthError::NotConfigured)?;
        mac.update(
            signing_message(&headers.service_id, &headers.timestamp, &headers.nonce, method, path).as_bytes(),
        );
        // verify_slice compares in constant time
        mac.verify_slice(&provided).map_err(|_| AuthError::BadSignature)?;

        // Only a fully verified request may consume a nonce
        if !self.nonces.check_and_insert(&headers.nonce, now) {
            return Err(AuthError::ReplayedNonce);
        }

        Ok(headers.service_id.clone())
    }
}

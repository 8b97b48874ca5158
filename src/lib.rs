//! SecureBot Gateway
//!
//! Intent routing, sandboxed skill execution and approval-gated skill
//! escalation for the SecureBot service mesh.
//!
//! # Features
//!
//! - **Signed service calls**: HMAC-SHA256 with replay protection on every route
//! - **Skills**: `SKILL.md` definitions, atomic hot reload, deterministic trigger matching
//! - **Sandbox**: scripts run as a separate OS user with a cleared environment and hard timeout
//! - **Escalation**: draft, lint, sandbox-test, validate and commit new skills on a registry miss
//! - **Approvals**: human-in-the-loop credential and permission requests
//!
//! # Architecture
//!
//! ```text
//! caller ──► axum (require_service) ──► IntentRouter
//!                                          │
//!              ┌───────────────────────────┴───────────────────────┐
//!     Action pipeline (search/task/action)          Knowledge pipeline (knowledge/chat)
//!     SkillRegistry ─► SkillExecutor ─► sandbox       Retriever ─► Generator
//!           │ miss
//!           └─► EscalationChain ─► ApprovalQueue ─► SecretStore
//! ```
//!
//! # Deployment note
//!
//! The nonce cache and the approval queue are process-local. Run one gateway
//! process, or route each caller to a fixed process, for replay protection and
//! approval visibility to hold.

pub mod approvals;
pub mod auth;
pub mod backends;
pub mod config;
pub mod context;
pub mod error;
pub mod escalation;
pub mod router;
pub mod server;
pub mod skills;
pub mod vault;

pub use approvals::{ApprovalError, ApprovalKind, ApprovalQueue, ApprovalRequest, ApprovalStatus, Resolution};
pub use auth::{sign, AuthError, AuthHeaders, NonceCache, ServiceIdentity, SignedClient, Verifier};
pub use backends::{Classification, Classifier, GenerationError, Generator, Retriever};
pub use config::Config;
pub use context::AppContext;
pub use error::GatewayError;
pub use escalation::{EscalationChain, EscalationConfig, EscalationReport, EscalationState, SandboxTester};
pub use router::{ActionPipeline, Intent, IntentRouter, KnowledgePipeline, Pipeline, RouteOutcome, SessionContext};
pub use skills::{
    ExecutionResult, PrivilegeDrop, SandboxConfig, SkillDefinition, SkillExecutor, SkillRegistry, SudoDrop,
};
pub use vault::{FileVault, MemorySecretStore, SecretStore};

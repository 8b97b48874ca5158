//! Gateway HTTP Server
//!
//! # Endpoints
//!
//! | Route | Callers |
//! |---|---|
//! | `GET /health` | anyone |
//! | `POST /message` | `MESSAGE_CALLERS` |
//! | `POST /approvals/request`, `GET /approvals/status/{id}` | `PRODUCER_CALLERS` |
//! | `GET /approvals/pending`, `POST /approvals/resolve/{id}` | `OPERATOR_CALLERS` |
//! | `GET /skills`, `POST /skills/reload` | `OPERATOR_CALLERS` |
//! | `POST /internal/test-skill` | `SANDBOX_CALLERS` |
//!
//! Every group except `/health` sits behind [`require_service`].

use crate::approvals::{ApprovalKind, ApprovalRequest};
use crate::auth::{require_service, CallerIdentity, RouteAuth};
use crate::context::AppContext;
use crate::error::GatewayError;
use crate::escalation::{SandboxReport, SandboxTestRequest, TEST_SKILL_PATH};
use crate::router::{Intent, RouteOutcome, SessionContext};
use crate::skills::{lint_script, Interpreter, ReloadSummary, MAX_TIMEOUT_SECS};
use axum::{
    extract::{Path, State},
    middleware,
    routing::{get, post},
    Extension, Json, Router,
};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::info;
use uuid::Uuid;

/// Largest script accepted by the sandbox test endpoint
const MAX_TEST_SCRIPT_BYTES: usize = 64 * 1024;

/// Timeout for sandbox tests that do not ask for one
const DEFAULT_TEST_TIMEOUT_SECS: u64 = 30;

type AppState = Arc<AppContext>;

/// Build the full router
pub fn build_router(ctx: AppState) -> Router {
    let config = Arc::clone(&ctx.config);
    let guard = |allowed: &[String]| {
        middleware::from_fn_with_state(RouteAuth::new(Arc::clone(&ctx.verifier), allowed.to_vec()), require_service)
    };

    let messages = Router::new()
        .route("/message", post(message))
        .route_layer(guard(&config.message_callers[..]));

    let producers = Router::new()
        .route("/approvals/request", post(create_approval))
        .route("/approvals/status/{id}", get(approval_status))
        .route_layer(guard(&config.producer_callers[..]));

    let operators = Router::new()
        .route("/approvals/pending", get(pending_approvals))
        .route("/approvals/resolve/{id}", post(resolve_approval))
        .route("/skills", get(list_skills))
        .route("/skills/reload", post(reload_skills))
        .route_layer(guard(&config.operator_callers[..]));

    let sandbox = Router::new()
        .route(TEST_SKILL_PATH, post(test_skill))
        .route_layer(guard(&config.sandbox_callers[..]));

    Router::new()
        .route("/health", get(health))
        .merge(messages)
        .merge(producers)
        .merge(operators)
        .merge(sandbox)
        .layer(TraceLayer::new_for_http())
        .with_state(ctx)
}

/// Bind and serve until `shutdown` resolves
pub async fn serve(ctx: AppState, shutdown: impl Future<Output = ()> + Send + 'static) -> anyhow::Result<()> {
    let addr = ctx.config.bind;
    let router = build_router(ctx);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Gateway listening on {}", addr);

    axum::serve(listener, router).with_graceful_shutdown(shutdown).await?;

    info!("Gateway shut down gracefully");
    Ok(())
}

/// Resolves on Ctrl+C or SIGTERM
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    skills_loaded: usize,
    skills_rejected: usize,
    skills_loaded_at: Option<chrono::DateTime<chrono::Utc>>,
    pending_approvals: usize,
    uptime_secs: i64,
}

async fn health(State(ctx): State<AppState>) -> Json<HealthResponse> {
    let snapshot = ctx.registry.snapshot();
    Json(HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
        skills_loaded: snapshot.len(),
        skills_rejected: snapshot.rejected().len(),
        skills_loaded_at: snapshot.loaded_at(),
        pending_approvals: ctx.approvals.pending_count(),
        uptime_secs: (chrono::Utc::now() - ctx.started_at).num_seconds(),
    })
}

#[derive(Debug, Deserialize)]
struct MessageRequest {
    text: String,
    #[serde(default)]
    user_id: Option<String>,
    #[serde(default)]
    session_id: Option<String>,
    /// Pre-classified intent; skips the classifier
    #[serde(default)]
    intent: Option<Intent>,
}

async fn message(
    State(ctx): State<AppState>,
    Extension(CallerIdentity(caller)): Extension<CallerIdentity>,
    Json(body): Json<MessageRequest>,
) -> Result<Json<RouteOutcome>, GatewayError> {
    if body.text.trim().is_empty() {
        return Err(GatewayError::Validation("empty message".to_string()));
    }
    let session = SessionContext {
        user_id: body.user_id.unwrap_or_else(|| caller.clone()),
        session_id: body.session_id,
    };

    // Dropping this handler (client gone) cancels any approval wait below it
    let cancel = CancellationToken::new();
    let _abandon = cancel.clone().drop_guard();

    let outcome = match body.intent {
        Some(intent) => ctx.router.route(intent, &body.text, &session, &cancel).await?,
        None => ctx.router.handle_message(&body.text, &session, &cancel).await?,
    };
    Ok(Json(outcome))
}

#[derive(Debug, Deserialize)]
struct CreateApprovalRequest {
    rationale: String,
    #[serde(default = "default_kind")]
    kind: ApprovalKind,
    #[serde(default)]
    need: Option<String>,
}

fn default_kind() -> ApprovalKind {
    ApprovalKind::Permission
}

#[derive(Debug, Serialize)]
struct CreatedApproval {
    request_id: Uuid,
    status: &'static str,
}

async fn create_approval(
    State(ctx): State<AppState>,
    Extension(CallerIdentity(caller)): Extension<CallerIdentity>,
    Json(body): Json<CreateApprovalRequest>,
) -> Result<Json<CreatedApproval>, GatewayError> {
    let request_id = ctx
        .approvals
        .create(&caller, &body.rationale, body.kind, body.need.as_deref())?;
    Ok(Json(CreatedApproval {
        request_id,
        status: "pending",
    }))
}

async fn approval_status(
    State(ctx): State<AppState>,
    Extension(CallerIdentity(caller)): Extension<CallerIdentity>,
    Path(id): Path<Uuid>,
) -> Result<Json<ApprovalRequest>, GatewayError> {
    Ok(Json(ctx.approvals.get_status(id, &caller)?))
}

#[derive(Debug, Serialize)]
struct PendingApprovals {
    count: usize,
    pending: Vec<ApprovalRequest>,
}

async fn pending_approvals(State(ctx): State<AppState>) -> Json<PendingApprovals> {
    let pending = ctx.approvals.list_pending();
    Json(PendingApprovals {
        count: pending.len(),
        pending,
    })
}

#[derive(Deserialize)]
struct ResolveRequest {
    value: String,
    #[serde(default)]
    key_name: Option<String>,
}

async fn resolve_approval(
    State(ctx): State<AppState>,
    Extension(CallerIdentity(caller)): Extension<CallerIdentity>,
    Path(id): Path<Uuid>,
    Json(body): Json<ResolveRequest>,
) -> Result<Json<ApprovalRequest>, GatewayError> {
    let resolved = ctx
        .approvals
        .resolve(id, &body.value, body.key_name.as_deref(), &caller)
        .await?;
    Ok(Json(resolved))
}

#[derive(Debug, Serialize)]
struct SkillSummary {
    name: String,
    description: String,
    triggers: Vec<String>,
    mode: &'static str,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Serialize)]
struct SkillList {
    count: usize,
    skills: Vec<SkillSummary>,
    rejected: Vec<String>,
}

async fn list_skills(State(ctx): State<AppState>) -> Json<SkillList> {
    let snapshot = ctx.registry.snapshot();
    let skills: Vec<SkillSummary> = snapshot
        .skills()
        .iter()
        .map(|s| SkillSummary {
            name: s.name.clone(),
            description: s.description.clone(),
            triggers: s.triggers.clone(),
            mode: s.mode.as_str(),
            timeout_secs: s.timeout().map(|t| t.as_secs()),
        })
        .collect();
    Json(SkillList {
        count: skills.len(),
        skills,
        rejected: snapshot
            .rejected()
            .iter()
            .map(|r| r.path.display().to_string())
            .collect(),
    })
}

async fn reload_skills(
    State(ctx): State<AppState>,
    Extension(CallerIdentity(caller)): Extension<CallerIdentity>,
) -> Result<Json<ReloadSummary>, GatewayError> {
    info!(caller = %caller, "Skill reload requested");
    Ok(Json(ctx.registry.reload()?))
}

/// Run a draft under the production sandbox. Lint runs first, so a blocked
/// script never reaches the filesystem.
async fn test_skill(
    State(ctx): State<AppState>,
    Extension(CallerIdentity(caller)): Extension<CallerIdentity>,
    Json(body): Json<SandboxTestRequest>,
) -> Result<Json<SandboxReport>, GatewayError> {
    let interpreter = Interpreter::from_mode(&body.execution_mode)
        .ok_or_else(|| GatewayError::Validation(format!("unsupported execution_mode '{}'", body.execution_mode)))?;
    if body.code.trim().is_empty() {
        return Err(GatewayError::Validation("no code provided".to_string()));
    }
    if body.code.len() > MAX_TEST_SCRIPT_BYTES {
        return Err(GatewayError::Validation("script too large".to_string()));
    }

    let lint = lint_script(&body.code, interpreter);
    if !lint.passed {
        return Err(GatewayError::Validation(format!(
            "lint blocked: {}",
            lint.blocked_reasons.join("; ")
        )));
    }

    let timeout = body
        .timeout
        .unwrap_or(DEFAULT_TEST_TIMEOUT_SECS)
        .clamp(1, MAX_TIMEOUT_SECS);
    info!(caller = %caller, mode = interpreter.fence(), timeout_secs = timeout, "Sandbox test");

    let result = ctx
        .executor
        .run_script("sandbox-test", interpreter, &body.code, Duration::from_secs(timeout))
        .await;
    Ok(Json(SandboxReport::from(&result)))
}

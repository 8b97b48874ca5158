//! Gateway error taxonomy
//!
//! Internal detail lives in the `Display` text and goes to the log. The HTTP
//! response only ever carries a fixed public message per category.

use crate::approvals::ApprovalError;
use crate::auth::AuthError;
use crate::backends::GenerationError;
use crate::skills::SkillError;
use crate::vault::VaultError;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use thiserror::Error;
use tracing::{error, warn};
use uuid::Uuid;

/// Public text for a terminal escalation failure
pub const COULD_NOT_CREATE_SKILL: &str = "could not create skill";

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("authentication rejected: {0}")]
    AuthRejected(#[from] AuthError),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// The message is fixed text and is returned to the caller as-is
    #[error("{0}")]
    Conflict(&'static str),

    #[error("skill timed out: {0}")]
    ExecutionTimeout(String),

    #[error("skill failed: {0}")]
    ExecutionFailure(String),

    #[error("escalation waiting on approval {request_id}")]
    EscalationBlocked { request_id: Uuid },

    #[error("escalation failed: {0}")]
    EscalationFailed(String),

    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    /// Stable category name for logs and metrics labels
    pub fn category(&self) -> &'static str {
        match self {
            Self::AuthRejected(_) => "auth_rejected",
            Self::Validation(_) => "validation",
            Self::NotFound(_) => "not_found",
            Self::Conflict(_) => "conflict",
            Self::ExecutionTimeout(_) => "execution_timeout",
            Self::ExecutionFailure(_) => "execution_failure",
            Self::EscalationBlocked { .. } => "escalation_blocked",
            Self::EscalationFailed(_) => "escalation_failed",
            Self::UpstreamUnavailable(_) => "upstream_unavailable",
            Self::Internal(_) => "internal",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::AuthRejected(_) => StatusCode::UNAUTHORIZED,
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::ExecutionTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            Self::EscalationBlocked { .. } => StatusCode::ACCEPTED,
            Self::UpstreamUnavailable(_) => StatusCode::BAD_GATEWAY,
            Self::ExecutionFailure(_) | Self::EscalationFailed(_) | Self::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// The only text a caller ever sees
    pub fn public_message(&self) -> &'static str {
        match self {
            Self::AuthRejected(_) => "unauthorized",
            Self::Validation(_) => "invalid request",
            Self::NotFound(_) => "not found",
            Self::Conflict(message) => *message,
            Self::EscalationBlocked { .. } => "pending approval",
            Self::EscalationFailed(_) => COULD_NOT_CREATE_SKILL,
            Self::ExecutionTimeout(_) | Self::ExecutionFailure(_) | Self::UpstreamUnavailable(_) | Self::Internal(_) => {
                "request failed"
            }
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            error!(category = self.category(), error = %self, "Request failed");
        } else if !matches!(self, Self::AuthRejected(_)) {
            // Auth rejections were already logged with their reason by the verifier
            warn!(category = self.category(), error = %self, "Request rejected");
        }

        let body = match &self {
            Self::EscalationBlocked { request_id } => serde_json::json!({
                "status": "pending_approval",
                "request_id": request_id,
            }),
            _ => serde_json::json!({ "error": self.public_message() }),
        };
        (status, Json(body)).into_response()
    }
}

impl From<SkillError> for GatewayError {
    fn from(e: SkillError) -> Self {
        match e {
            SkillError::NameCollision(_) => Self::Conflict("skill already exists"),
            SkillError::Io(msg) => Self::Internal(msg),
            other => Self::Validation(other.to_string()),
        }
    }
}

impl From<GenerationError> for GatewayError {
    fn from(e: GenerationError) -> Self {
        Self::UpstreamUnavailable(e.to_string())
    }
}

impl From<VaultError> for GatewayError {
    fn from(e: VaultError) -> Self {
        match e {
            VaultError::InvalidName(name) => Self::Validation(format!("invalid key name '{}'", name)),
            other => Self::Internal(format!("secret store: {}", other)),
        }
    }
}

impl From<ApprovalError> for GatewayError {
    fn from(e: ApprovalError) -> Self {
        match e {
            ApprovalError::NotFound(id) => Self::NotFound(format!("approval {}", id)),
            ApprovalError::AlreadyResolved(_) => Self::Conflict("already resolved"),
            ApprovalError::Forbidden(caller) => {
                Self::AuthRejected(AuthError::CallerNotAllowed(caller))
            }
            ApprovalError::Invalid(reason) => Self::Validation(reason),
            ApprovalError::SecretStore(reason) => Self::Internal(format!("secret store: {}", reason)),
            ApprovalError::TimedOut(id) => Self::EscalationFailed(format!("approval {} timed out", id)),
            ApprovalError::Cancelled(id) => Self::EscalationBlocked { request_id: id },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;

    async fn body_of(err: GatewayError) -> (StatusCode, serde_json::Value) {
        let response = err.into_response();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), 4096).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn test_auth_rejections_are_uniform() {
        for reason in [AuthError::BadSignature, AuthError::ReplayedNonce, AuthError::TimestampExpired(99)] {
            let (status, body) = body_of(GatewayError::from(reason)).await;
            assert_eq!(status, StatusCode::UNAUTHORIZED);
            assert_eq!(body, serde_json::json!({ "error": "unauthorized" }));
        }
    }

    #[tokio::test]
    async fn test_internal_detail_never_leaks() {
        let (status, body) = body_of(GatewayError::ExecutionFailure("stack trace at /home/bot".into())).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(!body.to_string().contains("/home/bot"));

        let (_, body) = body_of(GatewayError::EscalationFailed("lint rejected draft".into())).await;
        assert_eq!(body["error"], COULD_NOT_CREATE_SKILL);
    }

    #[tokio::test]
    async fn test_blocked_is_accepted_with_request_id() {
        let id = Uuid::new_v4();
        let (status, body) = body_of(GatewayError::EscalationBlocked { request_id: id }).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body["request_id"], id.to_string());
    }
}

//! axum middleware enforcing signed requests per route group

use super::{AuthHeaders, Verifier};
use crate::error::GatewayError;
use axum::{
    extract::{OriginalUri, Request, State},
    middleware::Next,
    response::Response,
};
use std::sync::Arc;

/// Verified caller, inserted into request extensions for handlers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallerIdentity(pub String);

/// Verifier plus the allow-list of one route group
#[derive(Clone)]
pub struct RouteAuth {
    pub verifier: Arc<Verifier>,
    pub allowed: Arc<Vec<String>>,
}

impl RouteAuth {
    pub fn new(verifier: Arc<Verifier>, allowed: Vec<String>) -> Self {
        Self {
            verifier,
            allowed: Arc::new(allowed),
        }
    }
}

/// Reject anything that is not signed by an allow-listed service
pub async fn require_service(
    State(auth): State<RouteAuth>,
    mut req: Request,
    next: Next,
) -> Result<Response, GatewayError> {
    // Nested routers see a stripped URI; the signature covers the full path
    let path = req
        .extensions()
        .get::<OriginalUri>()
        .map(|uri| uri.0.path().to_string())
        .unwrap_or_else(|| req.uri().path().to_string());
    let method = req.method().as_str().to_string();

    let headers = AuthHeaders::from_header_map(req.headers()).map_err(|reason| {
        tracing::warn!(method = %method, path = %path, reason = %reason, "Auth rejected");
        reason
    })?;
    let caller = auth.verifier.verify_for(&headers, &method, &path, &auth.allowed)?;

    req.extensions_mut().insert(CallerIdentity(caller));
    Ok(next.run(req).await)
}

//! Gateway HTTP integration tests
//!
//! Exercises the full axum router in-process with signed requests.

mod common;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use common::{executor, write_skill, CountingRetriever, FakeDrop, FixedClassifier, ScriptedGenerator, DATETIME_SKILL};
use securebot::approvals::ApprovalQueue;
use securebot::auth::{AuthHeaders, ServiceIdentity, SignedClient, Verifier};
use securebot::escalation::{HttpSandboxTester, SandboxTester};
use securebot::router::{ActionPipeline, Intent, IntentRouter, KnowledgePipeline};
use securebot::skills::{Interpreter, SkillRegistry};
use securebot::vault::{MemorySecretStore, SecretStore};
use securebot::{server, AppContext, Config};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tower::ServiceExt;

const SECRET: &str = "mesh-shared-secret";

struct Gateway {
    _root: TempDir,
    app: Router,
    secrets: Arc<MemorySecretStore>,
    dropper: Arc<FakeDrop>,
}

fn gateway() -> Gateway {
    let root = TempDir::new().unwrap();
    write_skill(root.path(), "datetime-now", DATETIME_SKILL);

    let vars: HashMap<&str, String> = HashMap::from([
        ("SERVICE_ID", "gateway".to_string()),
        ("SERVICE_SECRET", SECRET.to_string()),
        ("SKILLS_DIR", root.path().display().to_string()),
        ("SANDBOX_USER", "none".to_string()),
        ("PRODUCER_CALLERS", "codebot,scheduler".to_string()),
        ("OPERATOR_CALLERS", "admin".to_string()),
        ("MESSAGE_CALLERS", "telegram".to_string()),
    ]);
    let config = Config::from_lookup(|key| vars.get(key).cloned()).unwrap();

    let identity = ServiceIdentity::new(&config.service_id, &config.service_secret, Vec::new()).unwrap();
    let registry = Arc::new(SkillRegistry::open(&config.skills_dir).unwrap());
    let dropper = FakeDrop::printing("14:05\n");
    let generator = ScriptedGenerator::answering("local", "generated reply");
    let executor = executor(Arc::clone(&dropper), generator.clone());
    let secrets = Arc::new(MemorySecretStore::new());
    let approvals = Arc::new(ApprovalQueue::new(secrets.clone(), config.approval_producers()));

    let router = IntentRouter::new(
        FixedClassifier::new(Intent::Task, 0.9),
        ActionPipeline::new(Arc::clone(&registry), Arc::clone(&executor)),
        KnowledgePipeline::new(CountingRetriever::new(), generator),
    );

    let ctx = AppContext {
        config: Arc::new(config),
        verifier: Arc::new(Verifier::new(identity)),
        registry,
        executor,
        approvals,
        router: Arc::new(router),
        started_at: chrono::Utc::now(),
    };

    Gateway {
        _root: root,
        app: server::build_router(Arc::new(ctx)),
        secrets,
        dropper,
    }
}

fn request(method: &str, path: &str, headers: Option<&AuthHeaders>, body: Option<Value>) -> Request<Body> {
    let mut builder = Request::builder().method(method).uri(path);
    if let Some(headers) = headers {
        for (name, value) in headers.pairs() {
            builder = builder.header(name, value);
        }
    }
    match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    }
}

fn signed(caller: &str, method: &str, path: &str, body: Option<Value>) -> Request<Body> {
    let identity = ServiceIdentity::new(caller, SECRET, Vec::new()).unwrap();
    let headers = AuthHeaders::generate(&identity, method, path);
    request(method, path, Some(&headers), body)
}

async fn send(app: &Router, req: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(req).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, body)
}

#[tokio::test]
async fn test_health_needs_no_signature() {
    let gw = gateway();
    let (status, body) = send(&gw.app, request("GET", "/health", None, None)).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["skills_loaded"], 1);
}

#[tokio::test]
async fn test_rejections_are_uniform() {
    let gw = gateway();

    let (unsigned, unsigned_body) = send(&gw.app, request("GET", "/approvals/pending", None, None)).await;
    // A valid producer signature is still the wrong group for operator routes
    let (wrong_group, wrong_group_body) = send(&gw.app, signed("codebot", "GET", "/approvals/pending", None)).await;

    let stranger = ServiceIdentity::new("admin", "some-other-secret", Vec::new()).unwrap();
    let headers = AuthHeaders::generate(&stranger, "GET", "/approvals/pending");
    let (bad_secret, bad_secret_body) =
        send(&gw.app, request("GET", "/approvals/pending", Some(&headers), None)).await;

    for (status, body) in [
        (unsigned, unsigned_body),
        (wrong_group, wrong_group_body),
        (bad_secret, bad_secret_body),
    ] {
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body, json!({ "error": "unauthorized" }));
    }
}

#[tokio::test]
async fn test_replayed_request_is_rejected() {
    let gw = gateway();
    let identity = ServiceIdentity::new("admin", SECRET, Vec::new()).unwrap();
    let headers = AuthHeaders::generate(&identity, "GET", "/skills");

    let (first, body) = send(&gw.app, request("GET", "/skills", Some(&headers), None)).await;
    assert_eq!(first, StatusCode::OK);
    assert_eq!(body["count"], 1);

    let (second, _) = send(&gw.app, request("GET", "/skills", Some(&headers), None)).await;
    assert_eq!(second, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_signature_covers_the_path() {
    let gw = gateway();
    let identity = ServiceIdentity::new("admin", SECRET, Vec::new()).unwrap();
    let headers = AuthHeaders::generate(&identity, "GET", "/skills");

    let (status, _) = send(&gw.app, request("GET", "/approvals/pending", Some(&headers), None)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_credential_approval_round_trip() {
    let gw = gateway();

    let (status, created) = send(
        &gw.app,
        signed(
            "codebot",
            "POST",
            "/approvals/request",
            Some(json!({ "rationale": "Need the provider API key", "kind": "credential", "need": "provider_key" })),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(created["status"], "pending");
    let id = created["request_id"].as_str().unwrap().to_string();

    let (_, pending) = send(&gw.app, signed("admin", "GET", "/approvals/pending", None)).await;
    assert_eq!(pending["count"], 1);
    assert_eq!(pending["pending"][0]["requester"], "codebot");

    let resolve_path = format!("/approvals/resolve/{}", id);
    let (status, resolved) = send(
        &gw.app,
        signed(
            "admin",
            "POST",
            &resolve_path,
            Some(json!({ "value": "X-very-secret", "key_name": "provider_key" })),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(resolved["resolution"], json!({ "type": "secret_ref", "value": "provider_key" }));
    assert!(!resolved.to_string().contains("X-very-secret"));
    assert_eq!(
        gw.secrets.get_secret("provider_key").await.unwrap().as_deref(),
        Some("X-very-secret")
    );

    let (status, body) = send(
        &gw.app,
        signed("admin", "POST", &resolve_path, Some(json!({ "value": "Y", "key_name": "provider_key" }))),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body, json!({ "error": "already resolved" }));
    assert_eq!(
        gw.secrets.get_secret("provider_key").await.unwrap().as_deref(),
        Some("X-very-secret")
    );

    let status_path = format!("/approvals/status/{}", id);
    let (status, body) = send(&gw.app, signed("codebot", "GET", &status_path, None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "resolved");
    assert_eq!(body["resolver"], "admin");
    assert!(!body.to_string().contains("X-very-secret"));

    // Another producer cannot read it
    let (status, _) = send(&gw.app, signed("scheduler", "GET", &status_path, None)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_invalid_approval_request_is_rejected() {
    let gw = gateway();
    let (status, body) = send(
        &gw.app,
        signed("codebot", "POST", "/approvals/request", Some(json!({ "rationale": "   " }))),
    )
    .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body, json!({ "error": "invalid request" }));
}

#[tokio::test]
async fn test_message_runs_matching_skill() {
    let gw = gateway();
    let (status, body) = send(
        &gw.app,
        signed("telegram", "POST", "/message", Some(json!({ "text": "what time is it?" }))),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["response"], "14:05");
    assert_eq!(body["skill"], "datetime-now");
    assert_eq!(body["pipeline"], "action");
    assert_eq!(gw.dropper.runs(), 1);
}

#[tokio::test]
async fn test_message_miss_without_escalation_is_not_found() {
    let gw = gateway();
    let (status, body) = send(
        &gw.app,
        signed("telegram", "POST", "/message", Some(json!({ "text": "order pizza" }))),
    )
    .await;

    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body, json!({ "error": "not found" }));
}

#[tokio::test]
async fn test_sandbox_endpoint_lints_before_running() {
    let gw = gateway();

    let (status, body) = send(
        &gw.app,
        signed(
            "gateway",
            "POST",
            "/internal/test-skill",
            Some(json!({ "code": "sudo cat /etc/shadow", "execution_mode": "bash" })),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body, json!({ "error": "invalid request" }));
    assert_eq!(gw.dropper.runs(), 0);

    let (status, report) = send(
        &gw.app,
        signed(
            "gateway",
            "POST",
            "/internal/test-skill",
            Some(json!({ "code": "date '+%H:%M'", "execution_mode": "bash", "timeout": 5 })),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(report["exit_code"], 0);
    assert_eq!(report["stdout"], "14:05\n");
    assert_eq!(gw.dropper.runs(), 1);
}

#[tokio::test]
async fn test_reload_is_operator_only() {
    let gw = gateway();

    let (status, _) = send(&gw.app, signed("telegram", "POST", "/skills/reload", None)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, summary) = send(&gw.app, signed("admin", "POST", "/skills/reload", None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(summary["loaded"], 1);
}

#[tokio::test]
async fn test_signed_client_reaches_sandbox_endpoint_over_tcp() {
    let gw = gateway();
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = gw.app.clone();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    let identity = ServiceIdentity::new("gateway", SECRET, Vec::new()).unwrap();
    let tester = HttpSandboxTester::new(
        SignedClient::new(identity, Duration::from_secs(5)),
        &format!("http://{}", addr),
    );

    let report = tester
        .test("date '+%H:%M'", Interpreter::Bash, Duration::from_secs(5))
        .await
        .unwrap();
    assert!(report.passed());
    assert_eq!(report.stdout, "14:05\n");
    assert_eq!(gw.dropper.runs(), 1);
}

use std::sync::Arc;

use axum::{
    Json, Router,
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};

use crate::discovery::DiscoveryCache;
use crate::errors::SyncError;
use crate::sync::{SyncOrchestrator, SyncStatus};
use crate::webhook::{self, ActiveRun, EventRouter};

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub router: Arc<EventRouter>,
    pub sync: Arc<SyncOrchestrator>,
    pub cache: Arc<DiscoveryCache>,
    /// When set, every webhook must carry a valid `linear-signature`.
    pub webhook_secret: Option<String>,
}

pub type SharedState = Arc<AppState>;

// ── Request / response payloads ───────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
pub struct SyncRequest {
    #[serde(default)]
    pub connectors: Vec<String>,
}

#[derive(Serialize)]
pub struct StatusResponse {
    pub connectors: Vec<&'static str>,
    pub needs_sync: bool,
    #[serde(flatten)]
    pub sync: SyncStatus,
    pub discovery_cache_entries: usize,
    pub active_enhancements: Vec<ActiveRun>,
}

// ── Error handling ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum ApiError {
    Unauthorized(String),
    BadRequest(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, Json(serde_json::json!({"error": message}))).into_response()
    }
}

impl From<SyncError> for ApiError {
    fn from(err: SyncError) -> Self {
        match err {
            SyncError::UnknownConnector(_) | SyncError::NothingToSync(_) => {
                ApiError::BadRequest(err.to_string())
            }
            SyncError::State(_) => ApiError::Internal(err.to_string()),
        }
    }
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/health", get(health_check))
        .route("/webhook/linear", post(linear_webhook))
        .route("/sync", post(trigger_sync))
        .route("/sync/status", get(sync_status))
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({"status": "ok"}))
}

async fn linear_webhook(
    State(state): State<SharedState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    if let Some(secret) = &state.webhook_secret {
        let signature = headers
            .get(webhook::SIGNATURE_HEADER)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if !webhook::verify_signature(&body, signature, secret.as_bytes()) {
            tracing::warn!("Webhook signature verification failed");
            return Err(ApiError::Unauthorized("Invalid signature".into()));
        }
    }

    let event = webhook::parse_event(&body).map_err(|e| {
        tracing::warn!(error = %e, "Rejecting malformed webhook payload");
        ApiError::BadRequest(e.to_string())
    })?;
    let disposition = state.router.handle(event).await;
    Ok(Json(disposition))
}

async fn trigger_sync(
    State(state): State<SharedState>,
    body: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    let request: SyncRequest = if body.iter().all(u8::is_ascii_whitespace) {
        SyncRequest::default()
    } else {
        serde_json::from_slice(&body)
            .map_err(|e| ApiError::BadRequest(format!("Invalid sync request: {}", e)))?
    };

    let report = if request.connectors.is_empty() {
        state.sync.sync_all().await
    } else {
        state.sync.sync_subset(&request.connectors).await?
    };
    Ok(Json(report))
}

async fn sync_status(State(state): State<SharedState>) -> Result<impl IntoResponse, ApiError> {
    let sync = state.sync.state().status().await?;
    Ok(Json(StatusResponse {
        connectors: state.sync.connector_names(),
        needs_sync: state.sync.needs_sync().await,
        sync,
        discovery_cache_entries: state.cache.len(),
        active_enhancements: state.router.active_runs(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PipelineConfig;
    use crate::discovery::NoCatalog;
    use crate::enhance::testing::{FixtureWorkspace, ScriptedSynthesizer};
    use crate::enhance::{EnhancementPipeline, PipelineSettings};
    use crate::store::{DbHandle, EnhancerDb};
    use crate::sync::SyncStateStore;
    use crate::tracker::Issue;
    use crate::webhook::RouterSettings;
    use crate::webhook::router::testing::MemoryTracker;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use std::time::Duration;
    use tower::ServiceExt;

    fn test_app(secret: Option<&str>) -> Router {
        let db = DbHandle::new(EnhancerDb::new_in_memory().unwrap());
        let cache = Arc::new(DiscoveryCache::new(Arc::new(NoCatalog), Duration::from_secs(60)));
        let config = PipelineConfig::default();
        let pipeline = Arc::new(EnhancementPipeline::new(
            db.clone(),
            cache.clone(),
            Arc::new(FixtureWorkspace::new(Vec::new())),
            Arc::new(ScriptedSynthesizer::replying("## Summary\nok")),
            PipelineSettings::from(&config),
        ));
        let tracker = Arc::new(MemoryTracker::with_issue(Issue {
            id: "issue-1".into(),
            identifier: "ENG-1".into(),
            title: "Login".into(),
            description: None,
            url: "https://linear.app/acme/issue/ENG-1".into(),
        }));
        let sync = Arc::new(SyncOrchestrator::new(
            Vec::new(),
            SyncStateStore::new(db.clone()),
            Arc::new(db),
            Duration::from_secs(3600),
        ));
        let router = Arc::new(crate::webhook::EventRouter::new(
            tracker,
            pipeline,
            Some(sync.clone()),
            RouterSettings::from(&config),
        ));
        let state = Arc::new(AppState {
            router,
            sync,
            cache,
            webhook_secret: secret.map(str::to_string),
        });
        api_router().with_state(state)
    }

    async fn body_json(body: Body) -> serde_json::Value {
        let bytes = body.collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn webhook_request(payload: &str, signature: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder()
            .method("POST")
            .uri("/webhook/linear")
            .header("content-type", "application/json");
        if let Some(sig) = signature {
            builder = builder.header(webhook::SIGNATURE_HEADER, sig);
        }
        builder.body(Body::from(payload.to_string())).unwrap()
    }

    const HELP_COMMENT: &str = r#"{"type": "Comment", "action": "create",
        "data": {"id": "c1", "body": "/help", "issue": {"id": "issue-1"}}}"#;

    #[tokio::test]
    async fn health_check_is_ok() {
        let response = test_app(None)
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response.into_body()).await["status"], "ok");
    }

    #[tokio::test]
    async fn webhook_rejects_bad_signature_when_secret_set() {
        let app = test_app(Some("s3cret"));

        let response = app
            .clone()
            .oneshot(webhook_request(HELP_COMMENT, Some("deadbeef")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response = app.clone().oneshot(webhook_request(HELP_COMMENT, None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let sig = webhook::compute_signature(HELP_COMMENT.as_bytes(), b"s3cret").unwrap();
        let response = app.oneshot(webhook_request(HELP_COMMENT, Some(&sig))).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response.into_body()).await;
        assert_eq!(body["status"], "completed");
        assert_eq!(body["action"], "help");
    }

    #[tokio::test]
    async fn webhook_rejects_malformed_payloads() {
        let app = test_app(None);
        let response = app.clone().oneshot(webhook_request("{not json", None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let missing_id = r#"{"type": "Issue", "action": "create", "data": {"title": "x"}}"#;
        let response = app.oneshot(webhook_request(missing_id, None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn webhook_ignores_unhandled_events() {
        let payload = r#"{"type": "Project", "action": "update", "data": {"id": "p1"}}"#;
        let response = test_app(None).oneshot(webhook_request(payload, None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response.into_body()).await["status"], "ignored");
    }

    #[tokio::test]
    async fn sync_endpoints_report_state() {
        let app = test_app(None);

        let response = app
            .clone()
            .oneshot(Request::builder().method("POST").uri("/sync").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let report = body_json(response.into_body()).await;
        assert_eq!(report["connectors"].as_array().unwrap().len(), 0);

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/sync")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"connectors": ["fax"]}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = app
            .oneshot(Request::builder().uri("/sync/status").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let status = body_json(response.into_body()).await;
        assert_eq!(status["needs_sync"], false);
        assert!(status["last_sync_at"].is_string());
        assert_eq!(status["corpus"]["chat"], 0);
        assert_eq!(status["discovery_cache_entries"], 0);
    }
}

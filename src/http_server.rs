//! HTTP server implementation using Axum.

use crate::error::{Error, Result};
use crate::models::{
    CreateContextRequest, CreateSessionRequest, NavigateRequest, SessionStatus,
};
use crate::proxy;
use crate::ratelimit::Limiter;
use crate::session::SessionManager;
use crate::store::ContextStore;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Host, Path, Query, Request, State};
use axum::http::{header, HeaderValue, Method, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use base64::Engine;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

const NAVIGATE_TIMEOUT: Duration = Duration::from_secs(35);
const SCREENSHOT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone)]
pub struct AppState {
    pub session_mgr: Arc<SessionManager>,
    pub store: Arc<ContextStore>,
    pub limiter: Arc<Limiter>,
}

/// Build the full /v1 API surface.
pub fn router(state: AppState) -> Router {
    // Session CRUD sits behind the per-project rate limiter; screenshot,
    // debug and context endpoints do not (screenshots are polled).
    let rate_limited = Router::new()
        .route("/sessions", post(create_session).get(list_sessions))
        .route("/sessions/:id", get(get_session).delete(delete_session))
        .layer(middleware::from_fn_with_state(state.clone(), rate_limit));

    let open = Router::new()
        .route("/sessions/:id/screenshot", get(get_session_screenshot))
        .route("/sessions/:id/debug", get(get_debug_url))
        .route("/sessions/:id/ws", get(debug_websocket))
        .route("/sessions/:id/navigate", post(navigate_session))
        .route("/contexts", post(create_context))
        .route("/contexts/:id", get(get_context).delete(delete_context));

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION]);

    Router::new()
        .nest("/v1", rate_limited.merge(open))
        .layer(cors)
        .with_state(state)
}

// ─── Rate limiting ────────────────────────────────────────────────────────

/// Admission at the request boundary: requests that name a project consume
/// one token; anonymous requests pass through untouched.
async fn rate_limit(State(state): State<AppState>, req: Request, next: Next) -> Response {
    let project_id = match project_id_from(&req) {
        Some(id) => id,
        None => return next.run(req).await,
    };

    let limit = HeaderValue::from(state.limiter.limit());
    if !state.limiter.allow(&project_id) {
        let mut resp = (
            StatusCode::TOO_MANY_REQUESTS,
            Json(serde_json::json!({
                "error": format!(
                    "Rate limit exceeded. Maximum {} requests per hour per project.",
                    state.limiter.limit()
                )
            })),
        )
            .into_response();
        resp.headers_mut().insert("X-RateLimit-Limit", limit);
        resp.headers_mut()
            .insert("X-RateLimit-Remaining", HeaderValue::from(0));
        return resp;
    }

    let remaining = state.limiter.tokens(&project_id) as u64;
    let mut resp = next.run(req).await;
    resp.headers_mut().insert("X-RateLimit-Limit", limit);
    resp.headers_mut()
        .insert("X-RateLimit-Remaining", HeaderValue::from(remaining));
    resp
}

fn project_id_from(req: &Request) -> Option<String> {
    if let Some(query) = req.uri().query() {
        for pair in query.split('&') {
            if let Some(value) = pair.strip_prefix("projectId=") {
                if !value.is_empty() {
                    return Some(value.to_string());
                }
            }
        }
    }

    req.headers()
        .get("X-Project-ID")
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

// ─── Session handlers ─────────────────────────────────────────────────────

async fn create_session(
    State(state): State<AppState>,
    Json(req): Json<CreateSessionRequest>,
) -> Result<Response> {
    let session = state.session_mgr.create_session(req).await?;
    Ok((StatusCode::CREATED, Json(session)).into_response())
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListQuery {
    #[serde(default)]
    project_id: Option<String>,
    #[serde(default)]
    status: Option<String>,
}

async fn list_sessions(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Response {
    let status = match query.status.as_deref() {
        None | Some("") => None,
        Some(s) => match SessionStatus::parse(s) {
            Some(status) => Some(status),
            // An unknown status filter matches nothing.
            None => return Json(Vec::<crate::models::Session>::new()).into_response(),
        },
    };

    let sessions = state
        .session_mgr
        .list_sessions(query.project_id.as_deref().filter(|p| !p.is_empty()), status)
        .await;
    Json(sessions).into_response()
}

async fn get_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response> {
    let session = state.session_mgr.get_session(&id).await?;
    Ok(Json(session).into_response())
}

async fn delete_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode> {
    state.session_mgr.delete_session(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn get_debug_url(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Host(host): Host,
) -> Result<Response> {
    let session = state.session_mgr.get_session(&id).await?;

    let debug_url = format!("ws://{}/v1/sessions/{}/ws", host, session.id);
    Ok(Json(serde_json::json!({
        "debuggerUrl": debug_url,
        "sessionId": session.id,
        "status": session.status,
    }))
    .into_response())
}

async fn debug_websocket(
    State(state): State<AppState>,
    Path(id): Path<String>,
    ws: WebSocketUpgrade,
) -> Response {
    proxy::handle_debug_connection(state.session_mgr, id, ws).await
}

async fn get_session_screenshot(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response> {
    let session = state.session_mgr.get_session(&id).await?;
    if session.status != SessionStatus::Running {
        return Err(Error::NotRunning);
    }

    let conn = state
        .session_mgr
        .sidecar_connection(&id)
        .await
        .ok_or_else(|| Error::Sidecar("no sidecar connection available".into()))?;

    let result = conn
        .send_command(&serde_json::json!({"action": "screenshot"}), SCREENSHOT_TIMEOUT)
        .await
        .map_err(|e| {
            warn!(session = %id, "screenshot failed: {}", e);
            e
        })?;

    let data = result
        .get("data")
        .and_then(|v| v.as_str())
        .ok_or_else(|| Error::Sidecar("invalid screenshot data".into()))?;
    let png = base64::engine::general_purpose::STANDARD
        .decode(data)
        .map_err(|e| Error::Sidecar(format!("failed to decode screenshot: {}", e)))?;

    Ok((
        [
            (header::CONTENT_TYPE, "image/png"),
            (header::CACHE_CONTROL, "no-cache, no-store, must-revalidate"),
            (header::ACCESS_CONTROL_ALLOW_ORIGIN, "*"),
        ],
        png,
    )
        .into_response())
}

async fn navigate_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<NavigateRequest>,
) -> Result<Response> {
    if req.url.is_empty() {
        return Err(Error::Validation("url is required".into()));
    }

    let session = state.session_mgr.get_session(&id).await?;
    if session.status != SessionStatus::Running {
        return Err(Error::NotRunning);
    }

    let conn = state
        .session_mgr
        .sidecar_connection(&id)
        .await
        .ok_or_else(|| Error::Sidecar("no sidecar connection available".into()))?;

    info!(session = %id, url = %req.url, "Navigating session");
    let result = conn
        .send_command(
            &serde_json::json!({"action": "navigate", "url": req.url}),
            NAVIGATE_TIMEOUT,
        )
        .await?;

    Ok(Json(serde_json::json!({
        "status": "success",
        "url": result.get("url").cloned().unwrap_or(serde_json::Value::Null),
    }))
    .into_response())
}

// ─── Context handlers ─────────────────────────────────────────────────────

async fn create_context(
    State(state): State<AppState>,
    Json(req): Json<CreateContextRequest>,
) -> Result<Response> {
    let ctx = state.store.create_context(&req.project_id)?;
    Ok((StatusCode::CREATED, Json(ctx)).into_response())
}

async fn get_context(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response> {
    let ctx = state.store.get_context(&id)?;
    Ok(Json(ctx).into_response())
}

async fn delete_context(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode> {
    state.store.delete_context(&id)?;
    Ok(StatusCode::NO_CONTENT)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::models::Session;
    use crate::region::RegionManager;
    use axum::body::{self, Body};
    use chrono::Utc;
    use tower::util::ServiceExt;

    fn test_state(burst: u32) -> AppState {
        let store = Arc::new(
            ContextStore::new(
                std::env::temp_dir().join(format!("browserhub-http-{}", uuid::Uuid::new_v4())),
            )
            .unwrap(),
        );
        AppState {
            session_mgr: Arc::new(SessionManager::new(
                Arc::new(RegionManager::new()),
                store.clone(),
                Config::from_env(),
            )),
            store,
            limiter: Arc::new(Limiter::new(100, burst)),
        }
    }

    fn running_session(id: &str, project: &str) -> Session {
        let now = Utc::now();
        Session {
            id: id.to_string(),
            project_id: project.to_string(),
            status: SessionStatus::Running,
            region: "us-west-2".into(),
            started_at: now,
            expires_at: now + chrono::Duration::seconds(3600),
            timeout: 3600,
            connect_url: "ws://localhost:49222".into(),
            context_id: None,
            container_id: String::new(),
            user_data_dir: String::new(),
        }
    }

    async fn send(app: &Router, req: axum::http::Request<Body>) -> (StatusCode, serde_json::Value) {
        let resp = app.clone().oneshot(req).await.unwrap();
        let status = resp.status();
        let bytes = body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let json = if bytes.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null)
        };
        (status, json)
    }

    fn post_json(uri: &str, body: serde_json::Value) -> axum::http::Request<Body> {
        axum::http::Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn create_session_requires_project_id() {
        let app = router(test_state(10));
        let (status, json) = send(&app, post_json("/v1/sessions", serde_json::json!({}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(json["error"].as_str().unwrap().contains("projectId is required"));
    }

    #[tokio::test]
    async fn create_session_rejects_bad_timeout() {
        let app = router(test_state(10));
        let (status, json) = send(
            &app,
            post_json(
                "/v1/sessions",
                serde_json::json!({"projectId": "p1", "timeout": 30}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(json["error"]
            .as_str()
            .unwrap()
            .contains("timeout must be between 60 and 21600"));
    }

    #[tokio::test]
    async fn context_crud_over_http() {
        let app = router(test_state(10));

        let (status, created) = send(
            &app,
            post_json("/v1/contexts", serde_json::json!({"projectId": "p1"})),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        let id = created["id"].as_str().unwrap().to_string();
        assert_eq!(created["projectId"], "p1");
        assert!(created.get("dataPath").is_none());

        let (status, fetched) = send(
            &app,
            axum::http::Request::builder()
                .uri(format!("/v1/contexts/{}", id))
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(fetched["id"], id.as_str());

        let (status, _) = send(
            &app,
            axum::http::Request::builder()
                .method("DELETE")
                .uri(format!("/v1/contexts/{}", id))
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::NO_CONTENT);

        let (status, _) = send(
            &app,
            axum::http::Request::builder()
                .uri(format!("/v1/contexts/{}", id))
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn create_context_requires_project_id() {
        let app = router(test_state(10));
        let (status, _) = send(
            &app,
            post_json("/v1/contexts", serde_json::json!({"projectId": ""})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn rate_limiter_returns_429_after_burst() {
        let state = test_state(2);
        let app = router(state);

        for _ in 0..2 {
            let resp = app
                .clone()
                .oneshot(
                    axum::http::Request::builder()
                        .uri("/v1/sessions")
                        .header("X-Project-ID", "p-limited")
                        .body(Body::empty())
                        .unwrap(),
                )
                .await
                .unwrap();
            assert_eq!(resp.status(), StatusCode::OK);
            assert!(resp.headers().contains_key("X-RateLimit-Remaining"));
            assert_eq!(resp.headers()["X-RateLimit-Limit"], "100");
        }

        let resp = app
            .clone()
            .oneshot(
                axum::http::Request::builder()
                    .uri("/v1/sessions")
                    .header("X-Project-ID", "p-limited")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(resp.headers()["X-RateLimit-Remaining"], "0");
    }

    #[tokio::test]
    async fn anonymous_requests_skip_the_limiter() {
        let state = test_state(1);
        let app = router(state);

        for _ in 0..5 {
            let resp = app
                .clone()
                .oneshot(
                    axum::http::Request::builder()
                        .uri("/v1/sessions")
                        .body(Body::empty())
                        .unwrap(),
                )
                .await
                .unwrap();
            assert_eq!(resp.status(), StatusCode::OK);
            assert!(!resp.headers().contains_key("X-RateLimit-Remaining"));
        }
    }

    #[tokio::test]
    async fn list_sessions_filters() {
        let state = test_state(10);
        state
            .session_mgr
            .insert_session_for_test(running_session("a", "p1"))
            .await;
        state
            .session_mgr
            .insert_session_for_test(running_session("b", "p2"))
            .await;
        let app = router(state);

        let (_, all) = send(
            &app,
            axum::http::Request::builder()
                .uri("/v1/sessions")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(all.as_array().unwrap().len(), 2);

        let (_, filtered) = send(
            &app,
            axum::http::Request::builder()
                .uri("/v1/sessions?projectId=p1")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(filtered.as_array().unwrap().len(), 1);
        assert_eq!(filtered[0]["id"], "a");

        let (_, none) = send(
            &app,
            axum::http::Request::builder()
                .uri("/v1/sessions?status=BOGUS")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(none.as_array().unwrap().len(), 0);
    }

    #[tokio::test]
    async fn get_session_and_debug_url() {
        let state = test_state(10);
        state
            .session_mgr
            .insert_session_for_test(running_session("s1", "p1"))
            .await;
        let app = router(state);

        let (status, session) = send(
            &app,
            axum::http::Request::builder()
                .uri("/v1/sessions/s1")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(session["status"], "RUNNING");
        assert!(session.get("containerId").is_none());

        let (status, debug) = send(
            &app,
            axum::http::Request::builder()
                .uri("/v1/sessions/s1/debug")
                .header("host", "svc.example:8080")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            debug["debuggerUrl"],
            "ws://svc.example:8080/v1/sessions/s1/ws"
        );
        assert_eq!(debug["status"], "RUNNING");

        let (status, _) = send(
            &app,
            axum::http::Request::builder()
                .uri("/v1/sessions/unknown")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn delete_requires_running() {
        let state = test_state(10);
        let mut done = running_session("s1", "p1");
        done.status = SessionStatus::Completed;
        state.session_mgr.insert_session_for_test(done).await;
        let app = router(state);

        let (status, json) = send(
            &app,
            axum::http::Request::builder()
                .method("DELETE")
                .uri("/v1/sessions/s1")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(json["error"].as_str().unwrap().contains("not running"));
    }

    #[tokio::test]
    async fn navigate_validates_url_and_state() {
        let state = test_state(10);
        state
            .session_mgr
            .insert_session_for_test(running_session("s1", "p1"))
            .await;
        let app = router(state);

        let (status, json) = send(
            &app,
            post_json("/v1/sessions/s1/navigate", serde_json::json!({"url": ""})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(json["error"].as_str().unwrap().contains("url is required"));

        // Running session without a sidecar: scripted control unavailable.
        let (status, json) = send(
            &app,
            post_json(
                "/v1/sessions/s1/navigate",
                serde_json::json!({"url": "https://example.com"}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(json["error"]
            .as_str()
            .unwrap()
            .contains("no sidecar connection available"));

        let (status, _) = send(
            &app,
            post_json(
                "/v1/sessions/missing/navigate",
                serde_json::json!({"url": "https://example.com"}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn screenshot_requires_running_session() {
        let state = test_state(10);
        let mut done = running_session("s1", "p1");
        done.status = SessionStatus::TimedOut;
        state.session_mgr.insert_session_for_test(done).await;
        let app = router(state);

        let (status, _) = send(
            &app,
            axum::http::Request::builder()
                .uri("/v1/sessions/s1/screenshot")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }
}

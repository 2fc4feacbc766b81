//! Challenge server: HTTP surface over the challenge session.
//!
//! Handlers are thin: validate input, make one session call, map the result
//! to a status code. Input problems are 400s and never reach the session;
//! state conflicts are 409s.

use std::future::Future;
use std::sync::Arc;

use axum::extract::State;
use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::code::VerificationCode;
use crate::error::{InputError, SessionError};
use crate::session::{ChallengeSession, CodeSource};

/// Shared state for the challenge routes.
#[derive(Clone)]
pub struct AppState {
    pub session: Arc<ChallengeSession>,
    /// Expected number of digits in a submitted code.
    pub code_length: usize,
}

#[derive(Debug, Deserialize)]
struct SubmitRequest {
    #[serde(rename = "verificationId")]
    verification_id: Option<String>,
}

/// Build the challenge router.
pub fn challenge_routes(session: Arc<ChallengeSession>, code_length: usize) -> Router {
    let state = AppState {
        session,
        code_length,
    };

    Router::new()
        .route("/start", post(start))
        .route("/submit", post(submit))
        .route("/status", get(status))
        .route("/stop", post(stop))
        .route("/health", get(health))
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
        .with_state(state)
}

/// Serve the challenge routes until `shutdown` resolves.
pub async fn serve(
    listener: TcpListener,
    session: Arc<ChallengeSession>,
    code_length: usize,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    let addr = listener.local_addr()?;
    info!(%addr, "Challenge server listening");
    axum::serve(listener, challenge_routes(session, code_length))
        .with_graceful_shutdown(shutdown)
        .await
}

// ── Health ──────────────────────────────────────────────────────────────

async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

// ── Session lifecycle ───────────────────────────────────────────────────

async fn start(State(state): State<AppState>) -> Response {
    match state.session.start() {
        // Nobody over HTTP holds the ticket; the code stays in the session.
        Ok(ticket) => Json(json!({
            "session_id": ticket.session_id,
            "deadline": ticket.deadline,
        }))
        .into_response(),
        Err(SessionError::AlreadyListening) => (
            StatusCode::CONFLICT,
            Json(json!({ "error": "already listening" })),
        )
            .into_response(),
        Err(e) => (
            StatusCode::CONFLICT,
            Json(json!({ "error": e.to_string() })),
        )
            .into_response(),
    }
}

async fn stop(State(state): State<AppState>) -> impl IntoResponse {
    state.session.stop();
    Json(json!({}))
}

async fn status(State(state): State<AppState>) -> impl IntoResponse {
    let status = state.session.status();
    Json(json!({
        "waiting_for_code": status.waiting_for_code(),
        "has_code": status.has_code,
        "code_received_time": status.code_received_time,
        "state": status.state,
        "session_id": status.session_id,
        "deadline": status.deadline,
    }))
}

// ── Submit ──────────────────────────────────────────────────────────────

async fn submit(
    State(state): State<AppState>,
    body: Result<Json<SubmitRequest>, JsonRejection>,
) -> Response {
    let code = match parse_submission(body, state.code_length) {
        Ok(code) => code,
        Err(e) => {
            warn!(error = %e, "Rejected malformed submit");
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({ "success": false, "message": e.to_string() })),
            )
                .into_response();
        }
    };

    let verification_id = code.expose_secret().to_string();
    match state.session.submit(code, CodeSource::Human) {
        Ok(received) => Json(json!({
            "success": true,
            "verificationId": verification_id,
            "timestamp": received.received_at,
        }))
        .into_response(),
        Err(SessionError::Expired) => (
            StatusCode::CONFLICT,
            Json(json!({
                "success": false,
                "error": "gone",
                "message": "Verification window expired",
            })),
        )
            .into_response(),
        Err(_) => (
            StatusCode::CONFLICT,
            Json(json!({
                "success": false,
                "message": "Not currently waiting",
            })),
        )
            .into_response(),
    }
}

fn parse_submission(
    body: Result<Json<SubmitRequest>, JsonRejection>,
    code_length: usize,
) -> Result<VerificationCode, InputError> {
    let Json(request) = body.map_err(|e| InputError::Body(e.body_text()))?;
    let raw = request.verification_id.ok_or(InputError::Missing)?;
    VerificationCode::parse(&raw, code_length)
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::Request;
    use std::time::Duration;
    use tower::ServiceExt;

    use super::*;
    use crate::session::SessionState;

    fn router() -> (Router, Arc<ChallengeSession>) {
        let session = ChallengeSession::new(Duration::from_secs(1800));
        (challenge_routes(Arc::clone(&session), 6), session)
    }

    async fn call(app: &Router, method: &str, uri: &str, body: Option<&str>) -> (StatusCode, serde_json::Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        if body.is_some() {
            builder = builder.header("content-type", "application/json");
        }
        let req = builder
            .body(body.map_or_else(Body::empty, |b| Body::from(b.to_string())))
            .unwrap();
        let resp = app.clone().oneshot(req).await.unwrap();
        let status = resp.status();
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let json = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
        (status, json)
    }

    #[tokio::test]
    async fn health_is_ok() {
        let (app, _) = router();
        let (status, json) = call(&app, "GET", "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["status"], "ok");
    }

    #[tokio::test]
    async fn start_twice_conflicts() {
        let (app, _) = router();
        let (first, _) = call(&app, "POST", "/start", None).await;
        assert_eq!(first, StatusCode::OK);
        let (second, json) = call(&app, "POST", "/start", None).await;
        assert_eq!(second, StatusCode::CONFLICT);
        assert_eq!(json["error"], "already listening");
    }

    #[tokio::test]
    async fn malformed_submit_does_not_touch_session() {
        let (app, session) = router();
        call(&app, "POST", "/start", None).await;

        for body in [
            r#"{"verificationId":""}"#,
            r#"{"verificationId":"12ab56"}"#,
            r#"{"verificationId":"12345"}"#,
            r#"{"verificationId":441353}"#,
            r#"{}"#,
            "not json",
        ] {
            let (status, json) = call(&app, "POST", "/submit", Some(body)).await;
            assert_eq!(status, StatusCode::BAD_REQUEST, "body: {body}");
            assert_eq!(json["success"], false);
        }
        assert_eq!(session.snapshot().state, SessionState::Listening);
    }

    #[tokio::test]
    async fn submit_while_idle_conflicts() {
        let (app, session) = router();
        let (status, json) =
            call(&app, "POST", "/submit", Some(r#"{"verificationId":"441353"}"#)).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(json["success"], false);
        assert_eq!(json["message"], "Not currently waiting");
        assert_eq!(session.snapshot().state, SessionState::Idle);
    }

    #[tokio::test]
    async fn submit_echoes_code_and_timestamp() {
        let (app, _) = router();
        call(&app, "POST", "/start", None).await;
        let (status, json) =
            call(&app, "POST", "/submit", Some(r#"{"verificationId":"441353"}"#)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["success"], true);
        assert_eq!(json["verificationId"], "441353");
        assert!(json["timestamp"].is_string());
    }

    #[tokio::test]
    async fn status_never_contains_code() {
        let (app, _) = router();
        call(&app, "POST", "/start", None).await;
        call(&app, "POST", "/submit", Some(r#"{"verificationId":"441353"}"#)).await;
        let (_, json) = call(&app, "GET", "/status", None).await;
        assert!(!json.to_string().contains("441353"));
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let (app, session) = router();
        call(&app, "POST", "/start", None).await;
        for _ in 0..2 {
            let (status, json) = call(&app, "POST", "/stop", None).await;
            assert_eq!(status, StatusCode::OK);
            assert_eq!(json, json!({}));
        }
        assert_eq!(session.snapshot().state, SessionState::Idle);
    }
}

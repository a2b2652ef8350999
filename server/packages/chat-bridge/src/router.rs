use std::sync::Arc;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;

use chat_bridge_error::{BridgeError, ProblemDetails};

use crate::session::SessionManager;
use crate::ws::serve_socket;

const MAX_BROWSER_SESSION_ID_LEN: usize = 128;

#[derive(Debug, Serialize)]
struct RootResponse {
    name: &'static str,
    version: &'static str,
    status: &'static str,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub active_sessions: usize,
    pub suppressed_duplicates: u64,
}

#[derive(Debug, Deserialize)]
struct WsQuery {
    #[serde(default)]
    browser_session_id: Option<String>,
}

pub fn build_router(manager: Arc<SessionManager>) -> Router {
    Router::new()
        .route("/", get(get_root))
        .route("/health", get(get_health))
        .route("/ws", get(get_ws))
        .with_state(manager)
        .layer(TraceLayer::new_for_http())
}

async fn get_root() -> Json<RootResponse> {
    Json(RootResponse {
        name: "chat-bridge",
        version: env!("CARGO_PKG_VERSION"),
        status: "running",
    })
}

async fn get_health(State(manager): State<Arc<SessionManager>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        active_sessions: manager.active_sessions(),
        suppressed_duplicates: manager.suppressed_duplicates(),
    })
}

async fn get_ws(
    State(manager): State<Arc<SessionManager>>,
    Query(query): Query<WsQuery>,
    ws: Option<WebSocketUpgrade>,
) -> Response {
    if let Some(token) = query.browser_session_id.as_deref() {
        if let Err(err) = validate_browser_session_id(token) {
            tracing::warn!(error = %err, "rejected websocket upgrade");
            return problem(&err);
        }
    }
    let Some(ws) = ws else {
        return (
            StatusCode::UPGRADE_REQUIRED,
            "expected a websocket upgrade request",
        )
            .into_response();
    };
    let token = query.browser_session_id;
    ws.on_upgrade(move |socket| serve_socket(socket, manager, token))
}

pub fn validate_browser_session_id(token: &str) -> Result<(), BridgeError> {
    if token.is_empty() {
        return Err(BridgeError::InvalidSessionToken {
            message: "browser_session_id must not be empty".to_string(),
        });
    }
    if token.len() > MAX_BROWSER_SESSION_ID_LEN {
        return Err(BridgeError::InvalidSessionToken {
            message: format!(
                "browser_session_id must be at most {MAX_BROWSER_SESSION_ID_LEN} bytes"
            ),
        });
    }
    if let Some(bad) = token
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || *c == '-' || *c == '_'))
    {
        return Err(BridgeError::InvalidSessionToken {
            message: format!("browser_session_id contains invalid character {bad:?}"),
        });
    }
    Ok(())
}

fn problem(err: &BridgeError) -> Response {
    let problem = ProblemDetails::from(err);
    let status =
        StatusCode::from_u16(problem.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (
        status,
        [(header::CONTENT_TYPE, "application/problem+json")],
        Json(problem),
    )
        .into_response()
}

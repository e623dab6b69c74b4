//! HTTP server exposing the MJPEG stream.
//!
//! Routes:
//!   GET     /mjpeg?ip=&port=[&force_detect=true]  → multipart JPEG stream
//!   GET     /api/health                           → health check
//!   OPTIONS *                                     → CORS preflight

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use axum::extract::{Query, State};
use axum::http::{header, Method, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info, warn};

use mcast_mjpeg_common::endpoint::{RequestError, StreamRequest};
use mcast_mjpeg_common::protocol::{ErrorBody, HealthResponse};

use crate::session::{Gateway, SessionError};

/// Shared state for route handlers.
#[derive(Clone)]
struct AppState {
    gateway: Arc<Gateway>,
    start_time: Instant,
}

/// Build the router; split out of [`run`] so tests can drive it directly.
pub fn router(gateway: Arc<Gateway>) -> Router {
    let state = AppState {
        gateway,
        start_time: Instant::now(),
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE]);

    Router::new()
        .route("/mjpeg", get(stream_mjpeg))
        .route("/api/health", get(health))
        .fallback(not_found)
        .layer(cors)
        .with_state(state)
}

/// Serve until `shutdown` fires, then let in-flight sessions clean up.
pub async fn run(
    gateway: Arc<Gateway>,
    listen_addr: &str,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let app = router(Arc::clone(&gateway));

    let listener = TcpListener::bind(listen_addr).await?;
    info!("MJPEG HTTP server listening on {listen_addr}");
    info!("MJPEG endpoint: http://{listen_addr}/mjpeg?ip=<group>&port=<port>");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await?;

    gateway.drain().await;
    Ok(())
}

// ── errors ───────────────────────────────────────────────────────────────

/// Anything a handler can fail with before the stream starts.
enum ApiError {
    BadRequest(RequestError),
    Session(SessionError),
}

impl From<RequestError> for ApiError {
    fn from(e: RequestError) -> Self {
        Self::BadRequest(e)
    }
}

impl From<SessionError> for ApiError {
    fn from(e: SessionError) -> Self {
        Self::Session(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            Self::BadRequest(e) => {
                warn!("Rejected stream request: {e}");
                (StatusCode::BAD_REQUEST, e.to_string())
            }
            Self::Session(e) => {
                error!("Stream session failed: {e}");
                (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
            }
        };
        (status, Json(ErrorBody { error: message })).into_response()
    }
}

// ── route handlers ───────────────────────────────────────────────────────

async fn stream_mjpeg(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Response, ApiError> {
    let request = StreamRequest::from_query(&params)?;
    info!(
        "Stream request for {} (force_detect={})",
        request.endpoint, request.force_detect
    );

    // Headers go out only after the pipeline is running.
    let session = state.gateway.open(&request).await?;

    let headers = [
        (header::CONTENT_TYPE, state.gateway.boundary().content_type()),
        (
            header::CACHE_CONTROL,
            "no-cache, no-store, must-revalidate".to_string(),
        ),
        (header::PRAGMA, "no-cache".to_string()),
        (header::EXPIRES, "0".to_string()),
    ];
    Ok((StatusCode::OK, headers, session.body).into_response())
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        uptime_secs: state.start_time.elapsed().as_secs(),
        active_sessions: state.gateway.active_sessions(),
    })
}

async fn not_found() -> (StatusCode, Json<ErrorBody>) {
    (
        StatusCode::NOT_FOUND,
        Json(ErrorBody {
            error: "not found".to_string(),
        }),
    )
}

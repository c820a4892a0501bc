use axum::body::Body;
use axum::extract::{ConnectInfo, Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use std::net::SocketAddr;
use tokio_stream::wrappers::ReceiverStream;

use crate::errors::StreamError;
use crate::web::AppState;

/// `GET /play/{portal_id}/{channel_id}` — dispatch a live stream. The
/// response is chunked media; MAC exhaustion maps to 502 with a short
/// JSON body, an unknown channel to 404.
pub async fn play(
    State(state): State<AppState>,
    Path((portal_id, channel_id)): Path<(String, String)>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
) -> Response {
    let client_ip = remote.ip().to_string();

    match state
        .dispatcher
        .dispatch(&portal_id, &channel_id, &client_ip)
        .await
    {
        Ok(stream) => {
            let body = Body::from_stream(ReceiverStream::new(stream.receiver));
            Response::builder()
                .status(StatusCode::OK)
                .header(header::CONTENT_TYPE, stream.content_type)
                .header(header::CACHE_CONTROL, "no-store")
                .body(body)
                .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
        }
        Err(err) => {
            let status = match &err {
                StreamError::UnknownChannel { .. } => StatusCode::NOT_FOUND,
                _ => StatusCode::BAD_GATEWAY,
            };
            (status, Json(serde_json::json!({"error": err.to_string()}))).into_response()
        }
    }
}

/// `GET /streaming` — active sessions grouped by portal.
pub async fn active_sessions(State(state): State<AppState>) -> Json<serde_json::Value> {
    let snapshot = state.sessions.snapshot();
    Json(serde_json::to_value(snapshot).unwrap_or_else(|_| serde_json::json!({})))
}

use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::IntoResponse;
use tracing::info;

use crate::playlist::generate_playlist;
use crate::web::AppState;

/// `GET /playlist.m3u` — the full playlist of enabled channels, URLs
/// pointing back at this proxy.
pub async fn playlist(State(state): State<AppState>, headers: HeaderMap) -> impl IntoResponse {
    info!("Playlist requested");
    let public_host = resolve_public_host(&state, &headers);

    match generate_playlist(&state.database, &public_host).await {
        Ok(content) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "audio/x-mpegurl")],
            content,
        )
            .into_response(),
        Err(err) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("playlist generation failed: {err}"),
        )
            .into_response(),
    }
}

/// Configured `PUBLIC_HOST` wins; otherwise the request's Host header.
pub fn resolve_public_host(state: &AppState, headers: &HeaderMap) -> String {
    if let Some(host) = &state.context.public_host {
        return host.clone();
    }
    headers
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .unwrap_or_else(|| format!("{}:{}", state.context.bind_host, state.context.port))
}

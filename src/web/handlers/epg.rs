use axum::body::Body;
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use tracing::info;

use crate::epg::xmltv::xmltv_stream;
use crate::web::{ApiResult, AppState};

/// `GET /xmltv` — the merged guide, streamed; the route's compression
/// layer handles gzip negotiation.
pub async fn xmltv(State(state): State<AppState>) -> Response {
    info!("Guide requested");
    let stream = xmltv_stream(
        state.database.clone(),
        state.config.clone(),
        state.context.epg_sources_dir(),
    );
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/xml; charset=utf-8")
        .body(Body::from_stream(stream))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

#[derive(Debug, Default, Deserialize)]
pub struct EpgRefreshRequest {
    #[serde(default)]
    pub epg_ids: Option<Vec<String>>,
}

/// `POST /api/epg/refresh` — enqueue a guide refresh, optionally scoped
/// to specific source ids.
pub async fn refresh(
    State(state): State<AppState>,
    payload: Option<Json<EpgRefreshRequest>>,
) -> Json<serde_json::Value> {
    let ids = payload.and_then(|Json(req)| req.epg_ids);
    let status = state.jobs.enqueue_epg_refresh(ids);
    Json(serde_json::json!({"success": true, "status": status}))
}

/// `GET /api/epg/status`
pub async fn status(State(state): State<AppState>) -> ApiResult<Json<serde_json::Value>> {
    let status = state.epg.status().await?;
    Ok(Json(serde_json::to_value(status).map_err(|e| {
        crate::web::ApiError::internal(e.to_string())
    })?))
}

use axum::extract::State;
use axum::Json;
use serde::Deserialize;
use tracing::{info, warn};

use crate::database::channels as channel_queries;
use crate::web::{ApiError, ApiResult, AppState};

#[derive(Debug, Deserialize)]
pub struct PortalRequest {
    pub portal_id: String,
}

#[derive(Debug, Deserialize)]
pub struct MacDeleteRequest {
    pub portal_id: String,
    pub mac: String,
}

#[derive(Debug, Deserialize)]
pub struct GenresUpdateRequest {
    pub portal_id: String,
    #[serde(default)]
    pub selected_genres: Vec<String>,
}

fn require_portal(state: &AppState, portal_id: &str) -> ApiResult<crate::config::PortalConfig> {
    state
        .config
        .portal(portal_id)
        .ok_or_else(|| ApiError::not_found(format!("portal {portal_id} not found")))
}

/// `POST /api/portal/refresh` — enqueue a catalog refresh for one portal.
pub async fn refresh(
    State(state): State<AppState>,
    Json(req): Json<PortalRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    require_portal(&state, &req.portal_id)?;
    let status = state.jobs.enqueue_portal_refresh(&req.portal_id, "manual");
    Ok(Json(serde_json::json!({"success": true, "status": status})))
}

/// `POST /api/portal/refresh/status` — poll the queued/running refresh.
pub async fn refresh_status(
    State(state): State<AppState>,
    Json(req): Json<PortalRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    match state.jobs.portal_status(&req.portal_id) {
        Some(status) => Ok(Json(serde_json::json!({
            "success": true,
            "status": status.status,
            "stats": status.stats,
            "error": status.error,
        }))),
        None => Ok(Json(serde_json::json!({"success": true, "status": "idle"}))),
    }
}

/// `POST /api/portal/mac/delete` — remove one MAC from a portal.
pub async fn delete_mac(
    State(state): State<AppState>,
    Json(req): Json<MacDeleteRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    require_portal(&state, &req.portal_id)?;
    let mut removed = false;
    state
        .config
        .update(|config| {
            if let Some(portal) = config.portals.get_mut(&req.portal_id) {
                removed = portal.macs.remove(&req.mac).is_some();
            }
        })
        .map_err(|e| ApiError::internal(e.to_string()))?;

    if !removed {
        return Err(ApiError::not_found(format!(
            "MAC {} not found on portal {}",
            req.mac, req.portal_id
        )));
    }
    info!("Removed MAC {} from portal {}", req.mac, req.portal_id);
    Ok(Json(serde_json::json!({"success": true})))
}

/// `POST /api/portal/macs/refresh` — re-fetch profile and expiry for
/// every MAC of a portal.
pub async fn refresh_macs(
    State(state): State<AppState>,
    Json(req): Json<PortalRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    require_portal(&state, &req.portal_id)?;
    let updated = state.catalog.refresh_mac_profiles(&req.portal_id).await?;
    let macs = state
        .config
        .portal(&req.portal_id)
        .map(|portal| portal.macs)
        .unwrap_or_default();
    Ok(Json(serde_json::json!({
        "success": true,
        "updated": updated,
        "macs": macs,
    })))
}

/// `POST /api/portal/groups` — group inventory from the catalog store.
pub async fn groups(
    State(state): State<AppState>,
    Json(req): Json<PortalRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    require_portal(&state, &req.portal_id)?;
    let groups = state.database.list_groups(&req.portal_id).await?;
    let total = groups.len();
    let active = groups.iter().filter(|g| g.active).count();
    let payload: Vec<serde_json::Value> = groups
        .iter()
        .map(|g| {
            serde_json::json!({
                "genre_id": g.genre_id,
                "name": g.name,
                "channel_count": g.channel_count,
                "active": g.active,
            })
        })
        .collect();
    Ok(Json(serde_json::json!({
        "success": true,
        "total_groups": total,
        "active_groups": active,
        "groups": payload,
    })))
}

/// `POST /api/portal/genres/list` — live genre listing straight from the
/// portal, used before the first import.
pub async fn genres_list(
    State(state): State<AppState>,
    Json(req): Json<PortalRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    let portal = require_portal(&state, &req.portal_id)?;

    for mac in portal.macs.keys() {
        match state.connector.connect(&portal, mac).await {
            Ok(session) => match session.get_genres().await {
                Ok(genres) => {
                    let payload: Vec<serde_json::Value> = genres
                        .iter()
                        .map(|g| serde_json::json!({"genre_id": g.id, "name": g.title}))
                        .collect();
                    return Ok(Json(
                        serde_json::json!({"success": true, "genres": payload}),
                    ));
                }
                Err(err) => warn!("Genre listing via MAC {mac} failed: {err}"),
            },
            Err(err) => warn!("MAC {mac} unavailable for genre listing: {err}"),
        }
    }
    Err(ApiError::internal(format!(
        "no MAC could list genres for portal {}",
        req.portal_id
    )))
}

/// `POST /api/portal/genres` — persist the genre selection and toggle
/// `groups.active`. Never triggers a re-import: visibility changes apply
/// at the next emission.
pub async fn update_genres(
    State(state): State<AppState>,
    Json(req): Json<GenresUpdateRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    let portal = require_portal(&state, &req.portal_id)?;
    let selected: Vec<String> = req
        .selected_genres
        .iter()
        .filter(|g| !g.is_empty())
        .cloned()
        .collect();

    state
        .config
        .update(|config| {
            if let Some(portal) = config.portals.get_mut(&req.portal_id) {
                portal.selected_genres = selected.clone();
            }
        })
        .map_err(|e| ApiError::internal(e.to_string()))?;

    let mut tx = state
        .database
        .pool()
        .begin()
        .await
        .map_err(|e| ApiError::internal(e.to_string()))?;
    channel_queries::set_groups_active(&mut tx, &req.portal_id, &selected).await?;
    let stats = channel_queries::recompute_stats(&mut tx, &req.portal_id, &portal.name).await?;
    tx.commit()
        .await
        .map_err(|e| ApiError::internal(e.to_string()))?;

    info!(
        "Updated genres for portal {}: {}/{} groups active, {}/{} channels",
        req.portal_id,
        stats.active_groups,
        stats.total_groups,
        stats.active_channels,
        stats.total_channels,
    );

    Ok(Json(serde_json::json!({
        "success": true,
        "message": "Genres updated successfully",
        "total_groups": stats.total_groups,
        "active_groups": stats.active_groups,
        "total_channels": stats.total_channels,
        "active_channels": stats.active_channels,
    })))
}

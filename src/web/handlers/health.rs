use axum::extract::State;
use axum::Json;

use crate::web::AppState;

pub async fn health_check(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "active_streams": state.sessions.live_count(),
    }))
}

//! HTTP surface
//!
//! Thin axum handlers over the services: playlist and guide emission,
//! stream dispatch, session introspection, and the admin API the UI
//! collaborator drives. Handlers validate at the boundary and delegate;
//! business logic stays in the service modules.

use anyhow::Result;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Json;
use axum::Router;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tracing::info;

use crate::catalog::CatalogService;
use crate::config::{AppContext, ConfigStore};
use crate::database::Database;
use crate::epg::EpgService;
use crate::jobs::JobManager;
use crate::portal::PortalConnector;
use crate::streaming::{SessionTable, StreamDispatcher};

pub mod handlers;

#[derive(Clone)]
pub struct AppState {
    pub config: ConfigStore,
    pub context: AppContext,
    pub database: Database,
    pub sessions: Arc<SessionTable>,
    pub dispatcher: Arc<StreamDispatcher>,
    pub catalog: Arc<CatalogService>,
    pub epg: Arc<EpgService>,
    pub jobs: JobManager,
    pub connector: Arc<dyn PortalConnector>,
}

/// JSON error payload with an HTTP status
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
}

impl ApiError {
    pub fn bad_request<M: Into<String>>(message: M) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    pub fn not_found<M: Into<String>>(message: M) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
        }
    }

    pub fn internal<M: Into<String>>(message: M) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
        }
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        Self::internal(err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(serde_json::json!({"success": false, "message": self.message})),
        )
            .into_response()
    }
}

pub type ApiResult<T> = std::result::Result<T, ApiError>;

pub struct WebServer {
    app: Router,
    addr: SocketAddr,
}

impl WebServer {
    pub fn new(state: AppState) -> Result<Self> {
        let addr: SocketAddr =
            format!("{}:{}", state.context.bind_host, state.context.port).parse()?;
        Ok(Self {
            app: router(state),
            addr,
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub async fn serve(self) -> Result<()> {
        let listener = tokio::net::TcpListener::bind(self.addr).await?;
        info!("Listening on {}", self.addr);
        axum::serve(
            listener,
            self.app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown signal received");
        })
        .await?;
        Ok(())
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/playlist.m3u", get(handlers::playlist::playlist))
        .route(
            "/xmltv",
            get(handlers::epg::xmltv).layer(CompressionLayer::new()),
        )
        .route(
            "/play/:portal_id/:channel_id",
            get(handlers::streaming::play),
        )
        .route("/streaming", get(handlers::streaming::active_sessions))
        .route("/health", get(handlers::health::health_check))
        .route("/api/portal/refresh", post(handlers::portal::refresh))
        .route(
            "/api/portal/refresh/status",
            post(handlers::portal::refresh_status),
        )
        .route("/api/portal/mac/delete", post(handlers::portal::delete_mac))
        .route(
            "/api/portal/macs/refresh",
            post(handlers::portal::refresh_macs),
        )
        .route("/api/portal/groups", post(handlers::portal::groups))
        .route(
            "/api/portal/genres/list",
            post(handlers::portal::genres_list),
        )
        .route("/api/portal/genres", post(handlers::portal::update_genres))
        .route("/api/epg/refresh", post(handlers::epg::refresh))
        .route("/api/epg/status", get(handlers::epg::status))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

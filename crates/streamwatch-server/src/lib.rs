//! Streamwatch Web Server - Axum REST + WebSocket
//!
//! Exposes the supervisor to operator UIs: commands over REST and a live
//! push of source statuses, meter levels, transitions and alerts.

pub mod api;
pub mod ws;

use axum::http::{header, HeaderValue};
use axum::routing::{get, post, put};
use axum::Router;
use std::sync::Arc;
use streamwatch_core::{ConfigStore, Supervisor};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tower_http::cors::CorsLayer;
use tower_http::set_header::SetResponseHeaderLayer;

/// Shared application state accessible from all handlers
#[derive(Clone)]
pub struct AppState {
    pub supervisor: Arc<Supervisor>,
    /// Where `POST /api/v1/config/save` writes the configuration
    pub store: Arc<dyn ConfigStore>,
    /// WebSocket broadcast channel (serialized [`ws::WsMessage`]s)
    pub ws_tx: broadcast::Sender<String>,
    pub config: ServerConfig,
}

/// Server configuration
#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// Port to listen on
    pub port: u16,
    /// Bind address
    pub bind_addr: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8920,
            bind_addr: "0.0.0.0".to_string(),
        }
    }
}

impl AppState {
    pub fn new(
        supervisor: Arc<Supervisor>,
        store: Arc<dyn ConfigStore>,
        config: ServerConfig,
    ) -> Self {
        let (ws_tx, _) = broadcast::channel(256);
        Self {
            supervisor,
            store,
            ws_tx,
            config,
        }
    }
}

/// Build the Axum router with all routes
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/api/v1/status", get(api::get_status))
        .route(
            "/api/v1/sources",
            get(api::list_sources).post(api::add_source),
        )
        .route(
            "/api/v1/sources/{id}",
            put(api::update_source).delete(api::remove_source),
        )
        .route("/api/v1/sources/{id}/refresh", post(api::refresh_source))
        .route("/api/v1/sources/{id}/mute", post(api::set_source_mute))
        .route("/api/v1/refresh", post(api::refresh_all))
        .route("/api/v1/mute", post(api::set_master_mute))
        .route(
            "/api/v1/alerts",
            get(api::list_alerts).delete(api::clear_alerts),
        )
        .route("/api/v1/alerts/read", post(api::mark_alerts_read))
        .route("/api/v1/alerts/viewer", post(api::set_alert_viewer))
        .route(
            "/api/v1/settings",
            get(api::get_settings).patch(api::update_settings),
        )
        .route("/api/v1/config/save", post(api::save_config))
        .route("/api/v1/audio/resume", post(api::resume_audio))
        .route("/api/v1/remote-url", get(api::get_remote_url))
        .route("/api/v1/ws", get(ws::ws_handler))
        .layer(CorsLayer::permissive())
        .layer(SetResponseHeaderLayer::overriding(
            header::X_FRAME_OPTIONS,
            HeaderValue::from_static("DENY"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            header::X_CONTENT_TYPE_OPTIONS,
            HeaderValue::from_static("nosniff"),
        ))
        .with_state(state)
}

/// Serve on an already bound listener, with the live push running
///
/// Returns when the listener fails or the server stops.
pub async fn serve(listener: TcpListener, state: AppState) -> anyhow::Result<()> {
    let pusher = spawn_push(&state);
    let app = build_router(state);
    let result = axum::serve(listener, app).await;
    pusher.abort();
    result?;
    Ok(())
}

/// Start the push loop that feeds every WebSocket client
pub fn spawn_push(state: &AppState) -> JoinHandle<()> {
    tokio::spawn(ws::push_loop(state.clone()))
}

/// Start the web server
pub async fn start_server(state: AppState) -> anyhow::Result<()> {
    let addr = format!("{}:{}", state.config.bind_addr, state.config.port);
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!(%addr, "Streamwatch web server listening");
    serve(listener, state).await
}

//! REST API endpoints for streamwatch
//!
//! All endpoints are under /api/v1/ and return JSON.

use crate::AppState;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde::{Deserialize, Serialize};
use streamwatch_core::alerts::{AlertSettingsError, AudioContextState};
use streamwatch_core::config::parse_grid_layout;
use streamwatch_core::{
    AlertEntry, AlertSettings, ConfigError, GlobalSignals, MonitorSettings, Source,
    SourceSnapshot, Supervisor, SupervisorError,
};
use thiserror::Error;

/// Handler error, rendered as `{"error": "..."}` with a matching status
#[derive(Error, Debug)]
pub enum ApiError {
    #[error(transparent)]
    Supervisor(#[from] SupervisorError),

    #[error(transparent)]
    Settings(#[from] AlertSettingsError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Supervisor(SupervisorError::UnknownSource(_)) => StatusCode::NOT_FOUND,
            Self::Supervisor(SupervisorError::DuplicateSource(_)) => StatusCode::CONFLICT,
            Self::Supervisor(SupervisorError::EmptySourceId) => StatusCode::BAD_REQUEST,
            Self::Supervisor(SupervisorError::ShutDown) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Settings(_) => StatusCode::BAD_REQUEST,
            Self::Config(ConfigError::InvalidGridLayout(_)) => StatusCode::BAD_REQUEST,
            Self::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[derive(Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!("API request failed: {}", self);
        }
        (
            status,
            Json(ErrorResponse {
                error: self.to_string(),
            }),
        )
            .into_response()
    }
}

/// Application status response
#[derive(Serialize, Deserialize)]
pub struct StatusResponse {
    pub version: String,
    pub build_date: String,
    pub sources: usize,
    pub grid_layout: String,
    pub master_mute: bool,
    pub refresh_generation: u64,
    pub unread_alerts: usize,
    pub audio: AudioContextState,
}

/// Outcome of a fire-and-forget command
#[derive(Serialize, Deserialize)]
pub struct ActionResponse {
    pub success: bool,
    pub message: String,
}

impl ActionResponse {
    fn ok(message: impl Into<String>) -> Json<Self> {
        Json(Self {
            success: true,
            message: message.into(),
        })
    }
}

/// Partial source update; absent fields keep their value
#[derive(Deserialize, Default)]
pub struct SourceUpdate {
    pub name: Option<String>,
    pub url: Option<String>,
    pub title_image: Option<String>,
    pub poster_image: Option<String>,
}

/// Local mute/volume request for one source
#[derive(Deserialize, Default)]
pub struct SourceMuteRequest {
    pub muted: Option<bool>,
    pub volume: Option<f32>,
}

/// Master mute request
#[derive(Deserialize)]
pub struct MuteRequest {
    pub muted: bool,
}

/// Alert log response
#[derive(Serialize, Deserialize)]
pub struct AlertsResponse {
    pub entries: Vec<AlertEntry>,
    pub unread_count: usize,
    pub has_unread: bool,
}

/// Alert viewer open/close request
#[derive(Deserialize)]
pub struct ViewerRequest {
    pub open: bool,
}

/// Settings response
#[derive(Serialize, Deserialize)]
pub struct SettingsResponse {
    pub notifications: AlertSettings,
    pub grid_layout: String,
    pub monitor: MonitorSettings,
}

/// Settings update request; absent fields keep their value
#[derive(Deserialize, Default)]
pub struct SettingsUpdate {
    pub audible_enabled: Option<bool>,
    pub email_enabled: Option<bool>,
    pub email_address: Option<String>,
    pub grid_layout: Option<String>,
}

/// Alert audio context response
#[derive(Serialize, Deserialize)]
pub struct AudioResponse {
    pub state: AudioContextState,
}

/// Remote URL response
#[derive(Serialize, Deserialize)]
pub struct RemoteUrlResponse {
    pub url: String,
}

fn snapshot_of(supervisor: &Supervisor, id: &str) -> Result<SourceSnapshot, ApiError> {
    supervisor
        .snapshot()
        .into_iter()
        .find(|s| s.source.id == id)
        .ok_or_else(|| SupervisorError::UnknownSource(id.to_string()).into())
}

fn alerts_response(state: &AppState) -> AlertsResponse {
    let router = state.supervisor.router();
    AlertsResponse {
        entries: router.entries(),
        unread_count: router.unread_count(),
        has_unread: router.has_unread(),
    }
}

fn settings_response(state: &AppState) -> SettingsResponse {
    SettingsResponse {
        notifications: state.supervisor.router().settings(),
        grid_layout: state.supervisor.grid_layout(),
        monitor: state.supervisor.monitor_settings(),
    }
}

/// GET /api/v1/status
pub async fn get_status(State(state): State<AppState>) -> Json<StatusResponse> {
    let supervisor = &state.supervisor;
    let globals = supervisor.globals();
    Json(StatusResponse {
        version: streamwatch_core::VERSION.to_string(),
        build_date: streamwatch_core::BUILD_DATE.to_string(),
        sources: supervisor.source_count(),
        grid_layout: supervisor.grid_layout(),
        master_mute: globals.master_mute,
        refresh_generation: globals.refresh_generation,
        unread_alerts: supervisor.router().unread_count(),
        audio: supervisor.router().sound().state(),
    })
}

/// GET /api/v1/sources
pub async fn list_sources(State(state): State<AppState>) -> Json<Vec<SourceSnapshot>> {
    Json(state.supervisor.snapshot())
}

/// POST /api/v1/sources
pub async fn add_source(
    State(state): State<AppState>,
    Json(source): Json<Source>,
) -> Result<(StatusCode, Json<SourceSnapshot>), ApiError> {
    let id = source.id.clone();
    state.supervisor.add_source(source)?;
    Ok((StatusCode::CREATED, Json(snapshot_of(&state.supervisor, &id)?)))
}

/// PUT /api/v1/sources/{id}
pub async fn update_source(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(update): Json<SourceUpdate>,
) -> Result<Json<SourceSnapshot>, ApiError> {
    let mut source = state
        .supervisor
        .sources()
        .into_iter()
        .find(|s| s.id == id)
        .ok_or_else(|| SupervisorError::UnknownSource(id.clone()))?;

    if let Some(name) = update.name {
        source.name = name;
    }
    if let Some(url) = update.url {
        source.url = url;
    }
    if let Some(title_image) = update.title_image {
        source.title_image = Some(title_image).filter(|s| !s.is_empty());
    }
    if let Some(poster_image) = update.poster_image {
        source.poster_image = Some(poster_image).filter(|s| !s.is_empty());
    }

    state.supervisor.update_source(source)?;
    Ok(Json(snapshot_of(&state.supervisor, &id)?))
}

/// DELETE /api/v1/sources/{id}
pub async fn remove_source(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Source>, ApiError> {
    Ok(Json(state.supervisor.remove_source(&id).await?))
}

/// POST /api/v1/sources/{id}/refresh
pub async fn refresh_source(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ActionResponse>, ApiError> {
    state.supervisor.refresh_source(&id)?;
    Ok(ActionResponse::ok(format!("Refreshing {}", id)))
}

/// POST /api/v1/sources/{id}/mute
///
/// Unmuting doubles as the user gesture that resumes alert audio.
pub async fn set_source_mute(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<SourceMuteRequest>,
) -> Result<Json<SourceSnapshot>, ApiError> {
    if let Some(muted) = req.muted {
        state.supervisor.set_source_mute(&id, muted)?;
    }
    if let Some(volume) = req.volume {
        state.supervisor.set_source_volume(&id, volume)?;
    }
    Ok(Json(snapshot_of(&state.supervisor, &id)?))
}

/// POST /api/v1/refresh
pub async fn refresh_all(State(state): State<AppState>) -> Json<GlobalSignals> {
    state.supervisor.refresh_all();
    Json(state.supervisor.globals())
}

/// POST /api/v1/mute
pub async fn set_master_mute(
    State(state): State<AppState>,
    Json(req): Json<MuteRequest>,
) -> Json<GlobalSignals> {
    state.supervisor.set_master_mute(req.muted);
    Json(state.supervisor.globals())
}

/// GET /api/v1/alerts
pub async fn list_alerts(State(state): State<AppState>) -> Json<AlertsResponse> {
    Json(alerts_response(&state))
}

/// DELETE /api/v1/alerts
pub async fn clear_alerts(State(state): State<AppState>) -> Json<ActionResponse> {
    state.supervisor.router().clear();
    ActionResponse::ok("Alert log cleared")
}

/// POST /api/v1/alerts/read
pub async fn mark_alerts_read(State(state): State<AppState>) -> Json<ActionResponse> {
    state.supervisor.router().mark_read();
    ActionResponse::ok("Alerts marked as read")
}

/// POST /api/v1/alerts/viewer
pub async fn set_alert_viewer(
    State(state): State<AppState>,
    Json(req): Json<ViewerRequest>,
) -> Json<AlertsResponse> {
    let router = state.supervisor.router();
    if req.open {
        router.open_viewer();
    } else {
        router.close_viewer();
    }
    Json(alerts_response(&state))
}

/// GET /api/v1/settings
pub async fn get_settings(State(state): State<AppState>) -> Json<SettingsResponse> {
    Json(settings_response(&state))
}

/// PATCH /api/v1/settings
///
/// Everything is validated before anything is applied.
pub async fn update_settings(
    State(state): State<AppState>,
    Json(update): Json<SettingsUpdate>,
) -> Result<Json<SettingsResponse>, ApiError> {
    if let Some(layout) = &update.grid_layout {
        parse_grid_layout(layout)?;
    }

    let router = state.supervisor.router();
    let mut notifications = router.settings();
    if let Some(audible) = update.audible_enabled {
        notifications.audible_enabled = audible;
    }
    if let Some(email) = update.email_enabled {
        notifications.email_enabled = email;
    }
    if let Some(address) = update.email_address {
        notifications.email_address = address.trim().to_string();
    }
    router.set_settings(notifications)?;

    if let Some(layout) = &update.grid_layout {
        state.supervisor.set_grid_layout(layout)?;
    }
    Ok(Json(settings_response(&state)))
}

/// POST /api/v1/config/save
pub async fn save_config(State(state): State<AppState>) -> Result<Json<ActionResponse>, ApiError> {
    let config = state.supervisor.configuration();
    state.store.save(&config)?;
    Ok(ActionResponse::ok(format!(
        "Saved {} sources",
        config.sources.len()
    )))
}

/// POST /api/v1/audio/resume
pub async fn resume_audio(State(state): State<AppState>) -> Json<AudioResponse> {
    let audio = state.supervisor.router().sound().resume();
    tracing::debug!(?audio, "Alert audio resume requested");
    Json(AudioResponse { state: audio })
}

/// GET /api/v1/remote-url
///
/// Returns the URL other devices on the network can reach this server at.
pub async fn get_remote_url(State(state): State<AppState>) -> Json<RemoteUrlResponse> {
    let ip = local_ip_address::local_ip()
        .map(|ip| ip.to_string())
        .unwrap_or_else(|_| "localhost".to_string());
    Json(RemoteUrlResponse {
        url: format!("http://{}:{}", ip, state.config.port),
    })
}

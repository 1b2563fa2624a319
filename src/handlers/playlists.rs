//! Playlist CRUD, steer/heartbeat/close, and the work-queue snapshot (§0.4).

use axum::{
    extract::{Path, State},
    response::Json,
};
use serde::Deserialize;
use uuid::Uuid;
use validator::Validate;

use crate::models::{GenerationHints, Playlist, PlaylistMode, PlaylistStatus};
use crate::services::store::{NewPlaylist, WorkQueueSnapshot};
use crate::{AppError, AppState, Result};

#[derive(Deserialize, Validate)]
pub struct CreatePlaylistRequest {
    pub playlist_key: Option<String>,
    #[validate(length(min = 1, message = "prompt must not be empty"))]
    pub prompt: String,
    #[validate(length(min = 1, message = "llm_provider must not be empty"))]
    pub llm_provider: String,
    #[validate(length(min = 1, message = "llm_model must not be empty"))]
    pub llm_model: String,
    #[serde(default = "default_mode")]
    pub mode: PlaylistMode,
    #[serde(default)]
    pub hints: GenerationHints,
}

fn default_mode() -> PlaylistMode {
    PlaylistMode::Endless
}

pub async fn create_playlist_handler(
    State(state): State<AppState>,
    Json(req): Json<CreatePlaylistRequest>,
) -> Result<Json<Playlist>> {
    req.validate().map_err(|e| AppError::Validation(e.to_string()))?;

    let playlist = state
        .store
        .create_playlist(NewPlaylist {
            playlist_key: req.playlist_key,
            prompt: req.prompt,
            llm_provider: req.llm_provider,
            llm_model: req.llm_model,
            mode: req.mode,
            hints: req.hints,
        })
        .await?;

    Ok(Json(playlist))
}

pub async fn get_playlist_handler(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Playlist>> {
    Ok(Json(state.store.get_playlist(id).await?))
}

pub async fn list_playlists_handler(State(state): State<AppState>) -> Result<Json<Vec<Playlist>>> {
    Ok(Json(state.store.list_all_playlists().await?))
}

pub async fn get_work_queue_handler(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<WorkQueueSnapshot>> {
    Ok(Json(state.store.get_work_queue(id).await?))
}

#[derive(Deserialize, Validate)]
pub struct SteerRequest {
    #[validate(length(min = 1, message = "prompt must not be empty"))]
    pub prompt: String,
}

/// §4.6 steering: bump the prompt epoch, record the steer, let the
/// `PlaylistController` pick it up off the EventBus.
pub async fn steer_handler(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<SteerRequest>,
) -> Result<Json<Playlist>> {
    req.validate().map_err(|e| AppError::Validation(e.to_string()))?;
    Ok(Json(state.store.steer(id, req.prompt).await?))
}

pub async fn heartbeat_handler(State(state): State<AppState>, Path(id): Path<Uuid>) -> Result<Json<serde_json::Value>> {
    state.store.heartbeat(id).await?;
    Ok(Json(serde_json::json!({ "ok": true })))
}

/// Begin §3's `active -> closing` lifecycle edge; the `PlaylistController`
/// finishes the transition to `closed` once `transientCount` hits zero.
pub async fn close_handler(State(state): State<AppState>, Path(id): Path<Uuid>) -> Result<Json<Playlist>> {
    state.store.update_playlist_status(id, PlaylistStatus::Closing).await?;
    Ok(Json(state.store.get_playlist(id).await?))
}

pub async fn delete_playlist_handler(State(state): State<AppState>, Path(id): Path<Uuid>) -> Result<Json<serde_json::Value>> {
    state.store.delete_playlist(id).await?;
    Ok(Json(serde_json::json!({ "ok": true })))
}

//! Song creation (ordinary/interrupt), rating, and listen recording (§0.4).

use axum::{
    extract::{Path, State},
    response::Json,
};
use serde::Deserialize;
use uuid::Uuid;
use validator::Validate;

use crate::models::{Song, UserRating};
use crate::services::store::NewSong;
use crate::{AppError, AppState, Result};

#[derive(Deserialize)]
pub struct CreateSongRequest {
    /// Defaults to appending past the current queue tail.
    pub order_index: Option<f64>,
    pub interrupt_prompt: Option<String>,
}

/// Ordinary songs are created by the `PlaylistController` off the buffer
/// deficit; this endpoint is for client-requested interrupts (§4.6, §4.7).
pub async fn create_song_handler(
    State(state): State<AppState>,
    Path(playlist_id): Path<Uuid>,
    Json(req): Json<CreateSongRequest>,
) -> Result<Json<Song>> {
    let playlist = state.store.get_playlist(playlist_id).await?;
    let is_interrupt = req.interrupt_prompt.is_some();

    let order_index = match req.order_index {
        Some(idx) => idx,
        None => {
            let snapshot = state.store.get_work_queue(playlist_id).await?;
            snapshot.max_order_index + 1.0
        }
    };

    let song = state
        .store
        .create_song(NewSong {
            playlist_id,
            order_index,
            prompt_epoch: playlist.prompt_epoch,
            is_interrupt,
            interrupt_prompt: req.interrupt_prompt,
        })
        .await?;

    Ok(Json(song))
}

pub async fn get_song_handler(State(state): State<AppState>, Path(id): Path<Uuid>) -> Result<Json<Song>> {
    Ok(Json(state.store.get_song(id).await?))
}

#[derive(Deserialize)]
pub struct RateSongRequest {
    pub rating: UserRating,
}

pub async fn rate_song_handler(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<RateSongRequest>,
) -> Result<Json<Song>> {
    state.store.rate_song(id, req.rating).await?;
    Ok(Json(state.store.get_song(id).await?))
}

#[derive(Deserialize, Validate)]
pub struct RecordListenRequest {
    #[validate(range(min = 0, message = "play_duration_ms must be non-negative"))]
    pub play_duration_ms: i64,
}

pub async fn record_listen_handler(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<RecordListenRequest>,
) -> Result<Json<serde_json::Value>> {
    req.validate().map_err(|e| AppError::Validation(e.to_string()))?;
    state.store.record_listen(id, req.play_duration_ms).await?;
    Ok(Json(serde_json::json!({ "ok": true })))
}

/// §4.4 "Cancellation": abort a song mid-flight through its owning
/// `PlaylistController`, a no-op if no controller is currently running it.
pub async fn cancel_song_handler(State(state): State<AppState>, Path(id): Path<Uuid>) -> Result<Json<serde_json::Value>> {
    let song = state.store.get_song(id).await?;
    state.supervisor.cancel_song(song.playlist_id, id).await;
    Ok(Json(serde_json::json!({ "ok": true })))
}

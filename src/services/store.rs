//! Persistent record of playlists, songs, and settings with atomic status
//! transitions (§3, §4.1). Grounded on `token_vault_repository.rs`'s
//! dynamic-query (`sqlx::query`/`query_as`, not the `query!` macro) repository
//! idiom, with the claim operations built as single `UPDATE ... WHERE status
//! = $n RETURNING` statements — Postgres's MVCC guarantees exactly one
//! concurrent caller observes the matching row, giving the linearizable claim
//! §4.1 requires without an explicit transaction.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use tracing::instrument;
use uuid::Uuid;

use crate::error::AppError;
use crate::models::{
    Event, GenerationHints, Playlist, PlaylistMode, PlaylistStatus, Song, SongMetadata,
    SongStatus, SteerEntry, UserRating,
};
use crate::services::event_bus::EventBus;

pub type Result<T> = std::result::Result<T, AppError>;

#[derive(Clone)]
pub struct Store {
    pool: PgPool,
    events: EventBus,
}

// ---------------------------------------------------------------------
// Row <-> domain mapping
// ---------------------------------------------------------------------

#[derive(sqlx::FromRow)]
struct PlaylistRow {
    id: Uuid,
    playlist_key: Option<String>,
    prompt: String,
    llm_provider: String,
    llm_model: String,
    mode: String,
    bpm: Option<i32>,
    key_scale: Option<String>,
    time_signature: Option<String>,
    duration_hint_secs: Option<i32>,
    inference_steps: Option<i32>,
    temperature: Option<f64>,
    cfg_scale: Option<f64>,
    language: Option<String>,
    status: String,
    current_order_index: f64,
    songs_generated: i64,
    last_seen_at: Option<DateTime<Utc>>,
    prompt_epoch: i64,
    steer_history: Json<Vec<SteerEntry>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

fn row_to_playlist(row: PlaylistRow) -> Result<Playlist> {
    Ok(Playlist {
        id: row.id,
        playlist_key: row.playlist_key,
        prompt: row.prompt,
        llm_provider: row.llm_provider,
        llm_model: row.llm_model,
        mode: PlaylistMode::from_str(&row.mode).map_err(AppError::Config)?,
        hints: GenerationHints {
            bpm: row.bpm,
            key_scale: row.key_scale,
            time_signature: row.time_signature,
            duration_hint_secs: row.duration_hint_secs,
            inference_steps: row.inference_steps,
            temperature: row.temperature,
            cfg_scale: row.cfg_scale,
            language: row.language,
        },
        status: PlaylistStatus::from_str(&row.status).map_err(AppError::Config)?,
        current_order_index: row.current_order_index,
        songs_generated: row.songs_generated,
        last_seen_at: row.last_seen_at,
        prompt_epoch: row.prompt_epoch,
        steer_history: row.steer_history.0,
        created_at: row.created_at,
        updated_at: row.updated_at,
    })
}

#[derive(sqlx::FromRow)]
struct SongRow {
    id: Uuid,
    playlist_id: Uuid,
    order_index: f64,
    title: Option<String>,
    artist_name: Option<String>,
    genre: Option<String>,
    sub_genre: Option<String>,
    lyrics: Option<String>,
    caption: Option<String>,
    cover_prompt: Option<String>,
    bpm: Option<i32>,
    key_scale: Option<String>,
    time_signature: Option<String>,
    audio_duration: Option<f64>,
    vocal_style: Option<String>,
    mood: Option<String>,
    energy: Option<String>,
    era: Option<String>,
    instruments: Json<Vec<String>>,
    tags: Json<Vec<String>>,
    themes: Json<Vec<String>>,
    language: Option<String>,
    description: Option<String>,
    cover_url: Option<String>,
    audio_url: Option<String>,
    storage_path: Option<String>,
    ace_audio_path: Option<String>,
    status: String,
    ace_task_id: Option<String>,
    ace_submitted_at: Option<DateTime<Utc>>,
    generation_started_at: Option<DateTime<Utc>>,
    generation_completed_at: Option<DateTime<Utc>>,
    retry_count: i32,
    error_message: Option<String>,
    errored_at_status: Option<String>,
    cancelled_at_status: Option<String>,
    metadata_processing_ms: Option<i64>,
    cover_processing_ms: Option<i64>,
    audio_processing_ms: Option<i64>,
    prompt_epoch: i64,
    is_interrupt: bool,
    interrupt_prompt: Option<String>,
    user_rating: Option<String>,
    listen_count: i64,
    play_duration_ms: i64,
    persona_extract: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

fn row_to_song(row: SongRow) -> Result<Song> {
    Ok(Song {
        id: row.id,
        playlist_id: row.playlist_id,
        order_index: row.order_index,
        title: row.title,
        artist_name: row.artist_name,
        genre: row.genre,
        sub_genre: row.sub_genre,
        lyrics: row.lyrics,
        caption: row.caption,
        cover_prompt: row.cover_prompt,
        bpm: row.bpm,
        key_scale: row.key_scale,
        time_signature: row.time_signature,
        audio_duration: row.audio_duration,
        vocal_style: row.vocal_style,
        mood: row.mood,
        energy: row.energy,
        era: row.era,
        instruments: row.instruments.0,
        tags: row.tags.0,
        themes: row.themes.0,
        language: row.language,
        description: row.description,
        cover_url: row.cover_url,
        audio_url: row.audio_url,
        storage_path: row.storage_path,
        ace_audio_path: row.ace_audio_path,
        status: SongStatus::from_str(&row.status).map_err(AppError::Config)?,
        ace_task_id: row.ace_task_id,
        ace_submitted_at: row.ace_submitted_at,
        generation_started_at: row.generation_started_at,
        generation_completed_at: row.generation_completed_at,
        retry_count: row.retry_count,
        error_message: row.error_message,
        errored_at_status: row.errored_at_status,
        cancelled_at_status: row.cancelled_at_status,
        metadata_processing_ms: row.metadata_processing_ms,
        cover_processing_ms: row.cover_processing_ms,
        audio_processing_ms: row.audio_processing_ms,
        prompt_epoch: row.prompt_epoch,
        is_interrupt: row.is_interrupt,
        interrupt_prompt: row.interrupt_prompt,
        user_rating: row
            .user_rating
            .map(|r| if r == "up" { UserRating::Up } else { UserRating::Down }),
        listen_count: row.listen_count,
        play_duration_ms: row.play_duration_ms,
        persona_extract: row.persona_extract,
        created_at: row.created_at,
        updated_at: row.updated_at,
    })
}

const SONG_COLUMNS: &str = "id, playlist_id, order_index, title, artist_name, genre, sub_genre, \
    lyrics, caption, cover_prompt, bpm, key_scale, time_signature, audio_duration, vocal_style, \
    mood, energy, era, instruments, tags, themes, language, description, cover_url, audio_url, \
    storage_path, ace_audio_path, status, ace_task_id, ace_submitted_at, generation_started_at, \
    generation_completed_at, retry_count, error_message, errored_at_status, cancelled_at_status, \
    metadata_processing_ms, cover_processing_ms, audio_processing_ms, prompt_epoch, is_interrupt, \
    interrupt_prompt, user_rating, listen_count, play_duration_ms, persona_extract, created_at, \
    updated_at";

const PLAYLIST_COLUMNS: &str = "id, playlist_key, prompt, llm_provider, llm_model, mode, bpm, \
    key_scale, time_signature, duration_hint_secs, inference_steps, temperature, cfg_scale, \
    language, status, current_order_index, songs_generated, last_seen_at, prompt_epoch, \
    steer_history, created_at, updated_at";

/// Input for creating a new playlist (§3 "Configuration" fields).
#[derive(Debug, Clone)]
pub struct NewPlaylist {
    pub playlist_key: Option<String>,
    pub prompt: String,
    pub llm_provider: String,
    pub llm_model: String,
    pub mode: PlaylistMode,
    pub hints: GenerationHints,
}

/// Input for creating a new song. `interrupt_prompt` implies `is_interrupt`.
#[derive(Debug, Clone)]
pub struct NewSong {
    pub playlist_id: Uuid,
    pub order_index: f64,
    pub prompt_epoch: i64,
    pub is_interrupt: bool,
    pub interrupt_prompt: Option<String>,
}

/// §4.1 `getWorkQueue` consistent point-in-time partition.
#[derive(Debug, Clone, Serialize)]
pub struct RecentCompleted {
    pub title: Option<String>,
    pub artist_name: Option<String>,
    pub genre: Option<String>,
    pub sub_genre: Option<String>,
    pub vocal_style: Option<String>,
    pub mood: Option<String>,
    pub energy: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkQueueSnapshot {
    pub pending: Vec<Song>,
    pub metadata_ready: Vec<Song>,
    pub needs_cover: Vec<Song>,
    pub generating_audio: Vec<Song>,
    pub retry_pending: Vec<Song>,
    pub needs_recovery: Vec<Song>,
    pub buffer_deficit: usize,
    pub max_order_index: f64,
    pub total_songs: usize,
    pub transient_count: usize,
    pub current_epoch: i64,
    pub recent_completed: Vec<RecentCompleted>,
    pub recent_descriptions: Vec<String>,
    pub stale_songs: Vec<Uuid>,
}

/// §4.6 target: keep this many songs ahead of playback.
pub const BUFFER_TARGET: usize = 5;

impl Store {
    pub fn new(pool: PgPool, events: EventBus) -> Self {
        Self { pool, events }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    // -------------------------------------------------------------
    // Playlist operations
    // -------------------------------------------------------------

    #[instrument(skip(self, input))]
    pub async fn create_playlist(&self, input: NewPlaylist) -> Result<Playlist> {
        let row: PlaylistRow = sqlx::query_as(&format!(
            "INSERT INTO playlists (playlist_key, prompt, llm_provider, llm_model, mode, bpm, \
             key_scale, time_signature, duration_hint_secs, inference_steps, temperature, \
             cfg_scale, language) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13) \
             RETURNING {PLAYLIST_COLUMNS}"
        ))
        .bind(&input.playlist_key)
        .bind(&input.prompt)
        .bind(&input.llm_provider)
        .bind(&input.llm_model)
        .bind(input.mode.as_str())
        .bind(input.hints.bpm)
        .bind(&input.hints.key_scale)
        .bind(&input.hints.time_signature)
        .bind(input.hints.duration_hint_secs)
        .bind(input.hints.inference_steps)
        .bind(input.hints.temperature)
        .bind(input.hints.cfg_scale)
        .bind(&input.hints.language)
        .fetch_one(&self.pool)
        .await?;

        let playlist = row_to_playlist(row)?;
        self.events.publish(Event::PlaylistCreated {
            playlist_id: playlist.id,
        });
        Ok(playlist)
    }

    pub async fn get_playlist(&self, id: Uuid) -> Result<Playlist> {
        let row: Option<PlaylistRow> =
            sqlx::query_as(&format!("SELECT {PLAYLIST_COLUMNS} FROM playlists WHERE id = $1"))
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;

        match row {
            Some(row) => row_to_playlist(row),
            None => Err(AppError::NotFound {
                entity: "playlist",
                id,
            }),
        }
    }

    pub async fn get_playlist_by_key(&self, key: &str) -> Result<Option<Playlist>> {
        let row: Option<PlaylistRow> = sqlx::query_as(&format!(
            "SELECT {PLAYLIST_COLUMNS} FROM playlists WHERE playlist_key = $1"
        ))
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;

        row.map(row_to_playlist).transpose()
    }

    /// Active and closing playlists, the set the Supervisor keeps controllers for.
    pub async fn list_active_playlists(&self) -> Result<Vec<Playlist>> {
        let rows: Vec<PlaylistRow> = sqlx::query_as(&format!(
            "SELECT {PLAYLIST_COLUMNS} FROM playlists WHERE status IN ('active', 'closing')"
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(row_to_playlist).collect()
    }

    pub async fn list_all_playlists(&self) -> Result<Vec<Playlist>> {
        let rows: Vec<PlaylistRow> =
            sqlx::query_as(&format!("SELECT {PLAYLIST_COLUMNS} FROM playlists"))
                .fetch_all(&self.pool)
                .await?;

        rows.into_iter().map(row_to_playlist).collect()
    }

    /// Validated `status` transition per §3's lifecycle edges.
    #[instrument(skip(self))]
    pub async fn update_playlist_status(&self, id: Uuid, to: PlaylistStatus) -> Result<()> {
        let playlist = self.get_playlist(id).await?;
        if !PlaylistStatus::can_transition(playlist.status, to, playlist.mode) {
            return Err(AppError::InvalidTransition {
                entity: "playlist",
                id,
                from: playlist.status.as_str().to_string(),
                to: to.as_str().to_string(),
            });
        }

        sqlx::query("UPDATE playlists SET status = $2, updated_at = now() WHERE id = $1")
            .bind(id)
            .bind(to.as_str())
            .execute(&self.pool)
            .await?;

        self.events.publish(Event::PlaylistStatusChanged {
            playlist_id: id,
            from: playlist.status.as_str().to_string(),
            to: to.as_str().to_string(),
        });
        Ok(())
    }

    /// Bumps `promptEpoch` by exactly 1 and appends one `steerHistory` entry (§8).
    #[instrument(skip(self, prompt))]
    pub async fn steer(&self, id: Uuid, prompt: String) -> Result<Playlist> {
        let row: PlaylistRow = sqlx::query_as(&format!(
            "UPDATE playlists SET \
                prompt = $2, \
                prompt_epoch = prompt_epoch + 1, \
                steer_history = steer_history || jsonb_build_array( \
                    jsonb_build_object('epoch', prompt_epoch + 1, 'prompt', $2::text, 'at', now())), \
                updated_at = now() \
             WHERE id = $1 \
             RETURNING {PLAYLIST_COLUMNS}"
        ))
        .bind(id)
        .bind(&prompt)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(AppError::NotFound {
            entity: "playlist",
            id,
        })?;

        let playlist = row_to_playlist(row)?;
        self.events.publish(Event::PlaylistSteered {
            playlist_id: id,
            epoch: playlist.prompt_epoch,
            prompt: playlist.prompt.clone(),
        });
        Ok(playlist)
    }

    /// A consumer heartbeat: bumps `lastSeenAt` and re-activates a `closing`
    /// playlist (or `closed`, for `endless` mode) per §3/§4.6.
    #[instrument(skip(self))]
    pub async fn heartbeat(&self, id: Uuid) -> Result<()> {
        let playlist = match self.get_playlist(id).await {
            Ok(p) => p,
            Err(AppError::NotFound { .. }) => return Ok(()),
            Err(e) => return Err(e),
        };

        sqlx::query("UPDATE playlists SET last_seen_at = now(), updated_at = now() WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;

        let reactivate = match playlist.status {
            PlaylistStatus::Closing => true,
            PlaylistStatus::Closed => playlist.mode == PlaylistMode::Endless,
            PlaylistStatus::Active => false,
        };
        if reactivate {
            self.update_playlist_status(id, PlaylistStatus::Active).await?;
        }

        self.events.publish(Event::PlaylistHeartbeat {
            playlist_id: id,
            at: Utc::now(),
        });
        Ok(())
    }

    pub async fn increment_songs_generated(&self, id: Uuid) -> Result<()> {
        sqlx::query(
            "UPDATE playlists SET songs_generated = songs_generated + 1, updated_at = now() WHERE id = $1",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        self.events.publish(Event::PlaylistUpdated { playlist_id: id });
        Ok(())
    }

    pub async fn update_current_order_index(&self, id: Uuid, order_index: f64) -> Result<()> {
        sqlx::query(
            "UPDATE playlists SET current_order_index = $2, updated_at = now() WHERE id = $1",
        )
        .bind(id)
        .bind(order_index)
        .execute(&self.pool)
        .await?;
        self.events.publish(Event::PlaylistUpdated { playlist_id: id });
        Ok(())
    }

    /// Cascades to songs via the `ON DELETE CASCADE` foreign key (§4.1).
    #[instrument(skip(self))]
    pub async fn delete_playlist(&self, id: Uuid) -> Result<()> {
        let result = sqlx::query("DELETE FROM playlists WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Ok(());
        }
        self.events.publish(Event::PlaylistDeleted { playlist_id: id });
        Ok(())
    }

    // -------------------------------------------------------------
    // Song operations
    // -------------------------------------------------------------

    #[instrument(skip(self, input))]
    pub async fn create_song(&self, input: NewSong) -> Result<Song> {
        let row: SongRow = sqlx::query_as(&format!(
            "INSERT INTO songs (playlist_id, order_index, prompt_epoch, is_interrupt, interrupt_prompt) \
             VALUES ($1, $2, $3, $4, $5) \
             RETURNING {SONG_COLUMNS}"
        ))
        .bind(input.playlist_id)
        .bind(input.order_index)
        .bind(input.prompt_epoch)
        .bind(input.is_interrupt)
        .bind(&input.interrupt_prompt)
        .fetch_one(&self.pool)
        .await?;

        let song = row_to_song(row)?;
        self.events.publish(Event::SongCreated {
            song_id: song.id,
            playlist_id: song.playlist_id,
        });
        Ok(song)
    }

    pub async fn get_song(&self, id: Uuid) -> Result<Song> {
        let row: Option<SongRow> =
            sqlx::query_as(&format!("SELECT {SONG_COLUMNS} FROM songs WHERE id = $1"))
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;

        match row {
            Some(row) => row_to_song(row),
            None => Err(AppError::NotFound { entity: "song", id }),
        }
    }

    /// `pending -> generating_metadata`. Returns the owning playlist id iff claimed.
    #[instrument(skip(self))]
    pub async fn claim_for_metadata(&self, song_id: Uuid) -> Result<Option<Uuid>> {
        let row = sqlx::query(
            "UPDATE songs SET status = 'generating_metadata', generation_started_at = now(), \
             updated_at = now() \
             WHERE id = $1 AND status = 'pending' \
             RETURNING playlist_id",
        )
        .bind(song_id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => {
                let playlist_id: Uuid = row.get("playlist_id");
                self.events.publish(Event::SongStatusChanged {
                    song_id,
                    playlist_id,
                    from: SongStatus::Pending,
                    to: SongStatus::GeneratingMetadata,
                });
                Ok(Some(playlist_id))
            }
            None => Ok(None),
        }
    }

    /// `metadata_ready -> submitting_to_ace`.
    #[instrument(skip(self))]
    pub async fn claim_for_audio(&self, song_id: Uuid) -> Result<Option<Uuid>> {
        let row = sqlx::query(
            "UPDATE songs SET status = 'submitting_to_ace', updated_at = now() \
             WHERE id = $1 AND status = 'metadata_ready' \
             RETURNING playlist_id",
        )
        .bind(song_id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => {
                let playlist_id: Uuid = row.get("playlist_id");
                self.events.publish(Event::SongStatusChanged {
                    song_id,
                    playlist_id,
                    from: SongStatus::MetadataReady,
                    to: SongStatus::SubmittingToAce,
                });
                Ok(Some(playlist_id))
            }
            None => Ok(None),
        }
    }

    /// `generating_metadata -> metadata_ready`, writing every §3 content field at once.
    #[instrument(skip(self, metadata))]
    pub async fn complete_metadata(&self, song_id: Uuid, metadata: SongMetadata) -> Result<()> {
        let song = self.get_song(song_id).await?;
        self.require_transition(&song, SongStatus::MetadataReady)?;

        sqlx::query(
            "UPDATE songs SET \
                status = 'metadata_ready', \
                title = $2, artist_name = $3, genre = $4, sub_genre = $5, lyrics = $6, \
                caption = $7, cover_prompt = $8, bpm = $9, key_scale = $10, time_signature = $11, \
                audio_duration = $12, vocal_style = $13, mood = $14, energy = $15, era = $16, \
                instruments = $17, tags = $18, themes = $19, language = $20, description = $21, \
                updated_at = now() \
             WHERE id = $1",
        )
        .bind(song_id)
        .bind(&metadata.title)
        .bind(&metadata.artist_name)
        .bind(&metadata.genre)
        .bind(&metadata.sub_genre)
        .bind(&metadata.lyrics)
        .bind(&metadata.caption)
        .bind(&metadata.cover_prompt)
        .bind(metadata.bpm)
        .bind(&metadata.key_scale)
        .bind(&metadata.time_signature)
        .bind(metadata.audio_duration)
        .bind(&metadata.vocal_style)
        .bind(&metadata.mood)
        .bind(&metadata.energy)
        .bind(&metadata.era)
        .bind(Json(&metadata.instruments))
        .bind(Json(&metadata.tags))
        .bind(Json(&metadata.themes))
        .bind(&metadata.language)
        .bind(&metadata.description)
        .execute(&self.pool)
        .await?;

        self.emit_status_change(&song, SongStatus::MetadataReady);
        self.events.publish(Event::SongMetadataUpdated {
            song_id,
            playlist_id: song.playlist_id,
        });
        Ok(())
    }

    /// `submitting_to_ace -> generating_audio`, stamping `aceSubmittedAt`.
    #[instrument(skip(self))]
    pub async fn update_ace_task(&self, song_id: Uuid, task_id: String) -> Result<()> {
        let song = self.get_song(song_id).await?;
        self.require_transition(&song, SongStatus::GeneratingAudio)?;

        sqlx::query(
            "UPDATE songs SET status = 'generating_audio', ace_task_id = $2, \
             ace_submitted_at = now(), updated_at = now() WHERE id = $1",
        )
        .bind(song_id)
        .bind(&task_id)
        .execute(&self.pool)
        .await?;

        self.emit_status_change(&song, SongStatus::GeneratingAudio);
        Ok(())
    }

    /// `generating_audio -> saving`, once the audio adapter reports success.
    #[instrument(skip(self))]
    pub async fn begin_saving(&self, song_id: Uuid) -> Result<()> {
        let song = self.get_song(song_id).await?;
        self.require_transition(&song, SongStatus::Saving)?;

        sqlx::query("UPDATE songs SET status = 'saving', updated_at = now() WHERE id = $1")
            .bind(song_id)
            .execute(&self.pool)
            .await?;

        self.emit_status_change(&song, SongStatus::Saving);
        Ok(())
    }

    /// `saving -> ready`, populating the playable artifact fields (§4.4).
    #[instrument(skip(self))]
    pub async fn mark_ready(
        &self,
        song_id: Uuid,
        audio_url: String,
        audio_processing_ms: i64,
    ) -> Result<()> {
        let song = self.get_song(song_id).await?;
        self.require_transition(&song, SongStatus::Ready)?;

        sqlx::query(
            "UPDATE songs SET status = 'ready', audio_url = $2, \
             generation_completed_at = now(), audio_processing_ms = $3, updated_at = now() \
             WHERE id = $1",
        )
        .bind(song_id)
        .bind(&audio_url)
        .bind(audio_processing_ms)
        .execute(&self.pool)
        .await?;

        self.emit_status_change(&song, SongStatus::Ready);
        Ok(())
    }

    /// Applies the §4.4/§7 retry policy: under 3 prior retries goes to
    /// `retry_pending`, otherwise terminal `error`. Returns the resulting status.
    #[instrument(skip(self, error_message))]
    pub async fn mark_error(
        &self,
        song_id: Uuid,
        errored_at_status: SongStatus,
        error_message: String,
    ) -> Result<SongStatus> {
        let song = self.get_song(song_id).await?;
        let to = if song.retry_count < 3 {
            SongStatus::RetryPending
        } else {
            SongStatus::Error
        };
        self.require_transition(&song, to)?;

        sqlx::query(
            "UPDATE songs SET status = $2, error_message = $3, errored_at_status = $4, \
             updated_at = now() WHERE id = $1",
        )
        .bind(song_id)
        .bind(to.as_str())
        .bind(&error_message)
        .bind(errored_at_status.as_str())
        .execute(&self.pool)
        .await?;

        self.emit_status_change(&song, to);
        Ok(to)
    }

    /// `retry_pending -> {pending, metadata_ready}`, by the recorded
    /// `erroredAtStatus`, incrementing `retryCount`.
    #[instrument(skip(self))]
    pub async fn retry_errored(&self, song_id: Uuid) -> Result<()> {
        let song = self.get_song(song_id).await?;
        let errored_at_status = song
            .errored_at_status
            .as_deref()
            .and_then(|s| SongStatus::from_str(s).ok())
            .unwrap_or(SongStatus::GeneratingMetadata);

        let to = match errored_at_status {
            SongStatus::GeneratingMetadata => SongStatus::Pending,
            _ => SongStatus::MetadataReady,
        };
        self.require_transition(&song, to)?;

        sqlx::query(
            "UPDATE songs SET status = $2, retry_count = retry_count + 1, \
             error_message = NULL, errored_at_status = NULL, updated_at = now() WHERE id = $1",
        )
        .bind(song_id)
        .bind(to.as_str())
        .execute(&self.pool)
        .await?;

        self.emit_status_change(&song, to);
        Ok(())
    }

    /// Clears ACE fields and reverts for a lost task (§4.3) or recovery revert.
    #[instrument(skip(self))]
    pub async fn revert_to_metadata_ready(&self, song_id: Uuid) -> Result<()> {
        let song = self.get_song(song_id).await?;
        self.require_transition(&song, SongStatus::MetadataReady)?;

        sqlx::query(
            "UPDATE songs SET status = 'metadata_ready', ace_task_id = NULL, \
             ace_submitted_at = NULL, ace_audio_path = NULL, updated_at = now() WHERE id = $1",
        )
        .bind(song_id)
        .execute(&self.pool)
        .await?;

        self.emit_status_change(&song, SongStatus::MetadataReady);
        Ok(())
    }

    /// Recovery revert for `generating_metadata -> pending` on restart.
    #[instrument(skip(self))]
    pub async fn revert_to_pending(&self, song_id: Uuid) -> Result<()> {
        let song = self.get_song(song_id).await?;
        self.require_transition(&song, SongStatus::Pending)?;

        sqlx::query("UPDATE songs SET status = 'pending', updated_at = now() WHERE id = $1")
            .bind(song_id)
            .execute(&self.pool)
            .await?;

        self.emit_status_change(&song, SongStatus::Pending);
        Ok(())
    }

    /// Recovery resume: `saving -> generating_audio`, keeping the persisted `aceTaskId`.
    #[instrument(skip(self))]
    pub async fn revert_to_generating_audio(&self, song_id: Uuid) -> Result<()> {
        let song = self.get_song(song_id).await?;
        self.require_transition(&song, SongStatus::GeneratingAudio)?;

        sqlx::query(
            "UPDATE songs SET status = 'generating_audio', updated_at = now() WHERE id = $1",
        )
        .bind(song_id)
        .execute(&self.pool)
        .await?;

        self.emit_status_change(&song, SongStatus::GeneratingAudio);
        Ok(())
    }

    pub async fn update_cover(&self, song_id: Uuid, cover_url: String) -> Result<()> {
        sqlx::query("UPDATE songs SET cover_url = $2, updated_at = now() WHERE id = $1")
            .bind(song_id)
            .bind(&cover_url)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn update_cover_processing_ms(&self, song_id: Uuid, ms: i64) -> Result<()> {
        sqlx::query("UPDATE songs SET cover_processing_ms = $2, updated_at = now() WHERE id = $1")
            .bind(song_id)
            .bind(ms)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// §4.5 step 5: `{storagePath, aceAudioPath}`.
    pub async fn update_storage_path(
        &self,
        song_id: Uuid,
        storage_path: String,
        ace_audio_path: String,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE songs SET storage_path = $2, ace_audio_path = $3, updated_at = now() WHERE id = $1",
        )
        .bind(song_id)
        .bind(&storage_path)
        .bind(&ace_audio_path)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn update_audio_duration(&self, song_id: Uuid, duration: f64) -> Result<()> {
        sqlx::query("UPDATE songs SET audio_duration = $2, updated_at = now() WHERE id = $1")
            .bind(song_id)
            .bind(duration)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn rate_song(&self, song_id: Uuid, rating: UserRating) -> Result<()> {
        sqlx::query("UPDATE songs SET user_rating = $2, updated_at = now() WHERE id = $1")
            .bind(song_id)
            .bind(rating.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn record_listen(&self, song_id: Uuid, play_duration_ms: i64) -> Result<()> {
        sqlx::query(
            "UPDATE songs SET listen_count = listen_count + 1, \
             play_duration_ms = play_duration_ms + $2, updated_at = now() WHERE id = $1",
        )
        .bind(song_id)
        .bind(play_duration_ms)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// User-initiated abort mid-flight (§4.4). Does not validate against the
    /// state table since cancellation can occur from any non-terminal status.
    #[instrument(skip(self))]
    pub async fn mark_cancelled(&self, song_id: Uuid) -> Result<()> {
        let song = self.get_song(song_id).await?;
        if song.status.is_terminal() {
            return Ok(());
        }

        sqlx::query(
            "UPDATE songs SET status = 'error', error_message = 'cancelled', \
             cancelled_at_status = $2, updated_at = now() WHERE id = $1",
        )
        .bind(song_id)
        .bind(song.status.as_str())
        .execute(&self.pool)
        .await?;

        self.emit_status_change(&song, SongStatus::Error);
        Ok(())
    }

    /// Integer-reindex a playlist's songs by current `orderIndex` order,
    /// starting at 1 (§8 round-trip property: idempotent).
    #[instrument(skip(self))]
    pub async fn reindex(&self, playlist_id: Uuid) -> Result<()> {
        let rows: Vec<(Uuid, f64)> = sqlx::query_as(
            "SELECT id, order_index FROM songs WHERE playlist_id = $1 ORDER BY order_index ASC",
        )
        .bind(playlist_id)
        .fetch_all(&self.pool)
        .await?;

        let mut new_indices = Vec::with_capacity(rows.len());
        let mut tx = self.pool.begin().await?;
        for (position, (song_id, current)) in rows.iter().enumerate() {
            let new_index = (position + 1) as f64;
            if (*current - new_index).abs() > f64::EPSILON {
                sqlx::query("UPDATE songs SET order_index = $2, updated_at = now() WHERE id = $1")
                    .bind(song_id)
                    .bind(new_index)
                    .execute(&mut *tx)
                    .await?;
            }
            new_indices.push((*song_id, new_index));
        }
        tx.commit().await?;

        for (song_id, order_index) in new_indices {
            self.events.publish(Event::SongReordered {
                song_id,
                playlist_id,
                order_index,
            });
        }
        Ok(())
    }

    /// §4.1 consistent work-queue snapshot, read inside one transaction so the
    /// partition reflects a single point in time.
    #[instrument(skip(self))]
    pub async fn get_work_queue(&self, playlist_id: Uuid) -> Result<WorkQueueSnapshot> {
        let playlist = self.get_playlist(playlist_id).await?;
        let mut tx = self.pool.begin().await?;

        let rows: Vec<SongRow> = sqlx::query_as(&format!(
            "SELECT {SONG_COLUMNS} FROM songs WHERE playlist_id = $1 ORDER BY order_index ASC"
        ))
        .bind(playlist_id)
        .fetch_all(&mut *tx)
        .await?;
        tx.commit().await?;

        let songs = rows.into_iter().map(row_to_song).collect::<Result<Vec<_>>>()?;

        let now = Utc::now();
        let mut pending = Vec::new();
        let mut metadata_ready = Vec::new();
        let mut needs_cover = Vec::new();
        let mut generating_audio = Vec::new();
        let mut retry_pending = Vec::new();
        let mut needs_recovery = Vec::new();
        let mut stale_songs = Vec::new();
        let mut max_order_index: f64 = 0.0;
        let mut transient_count = 0usize;
        let mut songs_ahead = 0usize;
        let mut recent_completed_raw: Vec<&Song> = Vec::new();
        let mut recent_descriptions: Vec<String> = Vec::new();

        for song in &songs {
            max_order_index = max_order_index.max(song.order_index);

            match song.status {
                SongStatus::Pending => pending.push(song.clone()),
                SongStatus::MetadataReady => metadata_ready.push(song.clone()),
                SongStatus::GeneratingAudio => generating_audio.push(song.clone()),
                SongStatus::RetryPending => retry_pending.push(song.clone()),
                _ => {}
            }

            if song.cover_url.is_none()
                && matches!(
                    song.status,
                    SongStatus::MetadataReady
                        | SongStatus::SubmittingToAce
                        | SongStatus::GeneratingAudio
                        | SongStatus::Saving
                )
            {
                needs_cover.push(song.clone());
            }

            if matches!(
                song.status,
                SongStatus::GeneratingMetadata
                    | SongStatus::SubmittingToAce
                    | SongStatus::GeneratingAudio
                    | SongStatus::Saving
            ) {
                transient_count += 1;
            }

            if song.is_stale(now) {
                stale_songs.push(song.id);
                needs_recovery.push(song.clone());
            }

            if SongStatus::ACTIVE_STATUSES.contains(&song.status)
                && song.order_index > playlist.current_order_index
                && song.prompt_epoch == playlist.prompt_epoch
            {
                songs_ahead += 1;
            }

            if song.status == SongStatus::Ready {
                recent_completed_raw.push(song);
            }
            if let Some(description) = &song.description {
                recent_descriptions.push(description.clone());
            }
        }

        recent_completed_raw.sort_by_key(|s| s.updated_at);
        let recent_completed = recent_completed_raw
            .into_iter()
            .rev()
            .take(5)
            .map(|s| RecentCompleted {
                title: s.title.clone(),
                artist_name: s.artist_name.clone(),
                genre: s.genre.clone(),
                sub_genre: s.sub_genre.clone(),
                vocal_style: s.vocal_style.clone(),
                mood: s.mood.clone(),
                energy: s.energy.clone(),
            })
            .collect();
        let recent_descriptions: Vec<String> = recent_descriptions.into_iter().rev().take(20).collect();

        let buffer_deficit = BUFFER_TARGET.saturating_sub(songs_ahead);

        Ok(WorkQueueSnapshot {
            pending,
            metadata_ready,
            needs_cover,
            generating_audio,
            retry_pending,
            needs_recovery,
            buffer_deficit,
            max_order_index,
            total_songs: songs.len(),
            transient_count,
            current_epoch: playlist.prompt_epoch,
            recent_completed,
            recent_descriptions,
            stale_songs,
        })
    }

    // -------------------------------------------------------------
    // Recovery (§4.8)
    // -------------------------------------------------------------

    /// Startup reconciliation: rewrite transient statuses to a re-drivable
    /// set. Idempotent (§8): running this N>=1 times yields the same result.
    #[instrument(skip(self))]
    pub async fn reconcile_startup_statuses(&self) -> Result<()> {
        sqlx::query("UPDATE songs SET status = 'pending', updated_at = now() WHERE status = 'generating_metadata'")
            .execute(&self.pool)
            .await?;

        sqlx::query(
            "UPDATE songs SET status = 'metadata_ready', updated_at = now() WHERE status = 'submitting_to_ace'",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "UPDATE songs SET status = 'generating_audio', updated_at = now() WHERE status = 'saving'",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "UPDATE songs SET status = 'metadata_ready', ace_task_id = NULL, \
             ace_submitted_at = NULL, updated_at = now() \
             WHERE status = 'generating_audio' AND ace_task_id IS NULL",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    // -------------------------------------------------------------
    // Settings
    // -------------------------------------------------------------

    pub async fn get_setting(&self, key: &str) -> Result<Option<String>> {
        let row: Option<(String,)> = sqlx::query_as("SELECT value FROM settings WHERE key = $1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|(v,)| v))
    }

    pub async fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO settings (key, value, updated_at) VALUES ($1, $2, now()) \
             ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value, updated_at = now()",
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn all_settings(&self) -> Result<Vec<(String, String)>> {
        let rows: Vec<(String, String)> = sqlx::query_as("SELECT key, value FROM settings")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }

    // -------------------------------------------------------------
    // Internal helpers
    // -------------------------------------------------------------

    fn require_transition(&self, song: &Song, to: SongStatus) -> Result<()> {
        if !SongStatus::can_transition(song.status, to) {
            return Err(AppError::InvalidTransition {
                entity: "song",
                id: song.id,
                from: song.status.as_str().to_string(),
                to: to.as_str().to_string(),
            });
        }
        Ok(())
    }

    fn emit_status_change(&self, song: &Song, to: SongStatus) {
        self.events.publish(Event::SongStatusChanged {
            song_id: song.id,
            playlist_id: song.playlist_id,
            from: song.status,
            to,
        });
    }
}

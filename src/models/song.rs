//! Song entity and its state machine (§3, §4.4).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// §4.4 status enum. The persisted/wire form is the lowercase string given by
/// `as_str`/`FromStr` — tagged variants are for in-process ergonomics only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SongStatus {
    Pending,
    GeneratingMetadata,
    MetadataReady,
    SubmittingToAce,
    GeneratingAudio,
    Saving,
    Ready,
    Played,
    RetryPending,
    Error,
}

impl SongStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SongStatus::Pending => "pending",
            SongStatus::GeneratingMetadata => "generating_metadata",
            SongStatus::MetadataReady => "metadata_ready",
            SongStatus::SubmittingToAce => "submitting_to_ace",
            SongStatus::GeneratingAudio => "generating_audio",
            SongStatus::Saving => "saving",
            SongStatus::Ready => "ready",
            SongStatus::Played => "played",
            SongStatus::RetryPending => "retry_pending",
            SongStatus::Error => "error",
        }
    }

    /// Statuses counted as "ahead" of playback for buffer-deficit math (§4.6).
    pub const ACTIVE_STATUSES: &'static [SongStatus] = &[
        SongStatus::Pending,
        SongStatus::GeneratingMetadata,
        SongStatus::MetadataReady,
        SongStatus::SubmittingToAce,
        SongStatus::GeneratingAudio,
        SongStatus::Saving,
        SongStatus::Ready,
    ];

    pub fn is_terminal(&self) -> bool {
        matches!(self, SongStatus::Error | SongStatus::Played)
    }

    /// Whether the §4.4 edge `from -> to` is valid.
    pub fn can_transition(from: SongStatus, to: SongStatus) -> bool {
        use SongStatus::*;
        matches!(
            (from, to),
            (Pending, GeneratingMetadata)
                | (Pending, Error)
                | (Pending, RetryPending)
                | (GeneratingMetadata, MetadataReady)
                | (GeneratingMetadata, Pending)
                | (GeneratingMetadata, Error)
                | (GeneratingMetadata, RetryPending)
                | (MetadataReady, SubmittingToAce)
                | (SubmittingToAce, GeneratingAudio)
                | (SubmittingToAce, MetadataReady)
                | (SubmittingToAce, Error)
                | (SubmittingToAce, RetryPending)
                | (GeneratingAudio, Saving)
                | (GeneratingAudio, MetadataReady)
                | (GeneratingAudio, Error)
                | (GeneratingAudio, RetryPending)
                | (Saving, Ready)
                | (Saving, GeneratingAudio)
                | (Ready, Played)
                | (RetryPending, Pending)
                | (RetryPending, MetadataReady)
        )
    }
}

impl std::str::FromStr for SongStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "pending" => SongStatus::Pending,
            "generating_metadata" => SongStatus::GeneratingMetadata,
            "metadata_ready" => SongStatus::MetadataReady,
            "submitting_to_ace" => SongStatus::SubmittingToAce,
            "generating_audio" => SongStatus::GeneratingAudio,
            "saving" => SongStatus::Saving,
            "ready" => SongStatus::Ready,
            "played" => SongStatus::Played,
            "retry_pending" => SongStatus::RetryPending,
            "error" => SongStatus::Error,
            other => return Err(format!("unknown song status: {other}")),
        })
    }
}

impl std::fmt::Display for SongStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserRating {
    Up,
    Down,
}

impl UserRating {
    pub fn as_str(&self) -> &'static str {
        match self {
            UserRating::Up => "up",
            UserRating::Down => "down",
        }
    }
}

/// Structured metadata returned by a `TextGenerator` (§3, §6).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SongMetadata {
    pub title: String,
    pub artist_name: String,
    pub genre: String,
    pub sub_genre: String,
    pub lyrics: String,
    pub caption: String,
    pub cover_prompt: String,
    pub bpm: Option<i32>,
    pub key_scale: Option<String>,
    pub time_signature: Option<String>,
    pub audio_duration: Option<f64>,
    pub vocal_style: Option<String>,
    pub mood: Option<String>,
    pub energy: Option<String>,
    pub era: Option<String>,
    pub instruments: Vec<String>,
    pub tags: Vec<String>,
    pub themes: Vec<String>,
    pub language: Option<String>,
    pub description: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Song {
    pub id: Uuid,
    pub playlist_id: Uuid,
    pub order_index: f64,

    pub title: Option<String>,
    pub artist_name: Option<String>,
    pub genre: Option<String>,
    pub sub_genre: Option<String>,
    pub lyrics: Option<String>,
    pub caption: Option<String>,
    pub cover_prompt: Option<String>,
    pub bpm: Option<i32>,
    pub key_scale: Option<String>,
    pub time_signature: Option<String>,
    pub audio_duration: Option<f64>,
    pub vocal_style: Option<String>,
    pub mood: Option<String>,
    pub energy: Option<String>,
    pub era: Option<String>,
    pub instruments: Vec<String>,
    pub tags: Vec<String>,
    pub themes: Vec<String>,
    pub language: Option<String>,
    pub description: Option<String>,

    pub cover_url: Option<String>,
    pub audio_url: Option<String>,
    pub storage_path: Option<String>,
    pub ace_audio_path: Option<String>,

    pub status: SongStatus,
    pub ace_task_id: Option<String>,
    pub ace_submitted_at: Option<DateTime<Utc>>,
    pub generation_started_at: Option<DateTime<Utc>>,
    pub generation_completed_at: Option<DateTime<Utc>>,
    pub retry_count: i32,
    pub error_message: Option<String>,
    pub errored_at_status: Option<String>,
    pub cancelled_at_status: Option<String>,
    pub metadata_processing_ms: Option<i64>,
    pub cover_processing_ms: Option<i64>,
    pub audio_processing_ms: Option<i64>,

    pub prompt_epoch: i64,
    pub is_interrupt: bool,
    pub interrupt_prompt: Option<String>,

    pub user_rating: Option<UserRating>,
    pub listen_count: i64,
    pub play_duration_ms: i64,
    pub persona_extract: Option<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Song {
    /// §4.4 staleness rule: stuck in an actively-processing status past 20 minutes.
    pub fn is_stale(&self, now: DateTime<Utc>) -> bool {
        const STALE_AFTER: chrono::Duration = chrono::Duration::minutes(20);

        let reference = match self.status {
            SongStatus::GeneratingAudio => self.ace_submitted_at.or(self.generation_started_at),
            SongStatus::GeneratingMetadata | SongStatus::SubmittingToAce | SongStatus::Saving => {
                self.generation_started_at
            }
            _ => return false,
        };

        match reference {
            Some(ts) => now - ts > STALE_AFTER,
            None => false,
        }
    }
}

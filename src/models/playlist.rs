//! Playlist entity (§3).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlaylistMode {
    Endless,
    Oneshot,
}

impl PlaylistMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlaylistMode::Endless => "endless",
            PlaylistMode::Oneshot => "oneshot",
        }
    }
}

impl std::str::FromStr for PlaylistMode {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "endless" => Ok(PlaylistMode::Endless),
            "oneshot" => Ok(PlaylistMode::Oneshot),
            other => Err(format!("unknown playlist mode: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlaylistStatus {
    Active,
    Closing,
    Closed,
}

impl PlaylistStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlaylistStatus::Active => "active",
            PlaylistStatus::Closing => "closing",
            PlaylistStatus::Closed => "closed",
        }
    }

    /// §3 lifecycle edges, parametrized on mode since `closed -> active` is
    /// only legal for `endless` playlists.
    pub fn can_transition(from: PlaylistStatus, to: PlaylistStatus, mode: PlaylistMode) -> bool {
        use PlaylistStatus::*;
        match (from, to) {
            (Active, Closing) => true,
            (Closing, Closed) => true,
            (Closing, Active) => true,
            (Closed, Active) => mode == PlaylistMode::Endless,
            _ => false,
        }
    }
}

impl std::str::FromStr for PlaylistStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(PlaylistStatus::Active),
            "closing" => Ok(PlaylistStatus::Closing),
            "closed" => Ok(PlaylistStatus::Closed),
            other => Err(format!("unknown playlist status: {other}")),
        }
    }
}

/// One entry in `steerHistory` (§3, §8 round-trip property).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SteerEntry {
    pub epoch: i64,
    pub prompt: String,
    pub at: DateTime<Utc>,
}

/// Generation hints shared by playlist defaults and per-song overrides (§3).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GenerationHints {
    pub bpm: Option<i32>,
    pub key_scale: Option<String>,
    pub time_signature: Option<String>,
    pub duration_hint_secs: Option<i32>,
    pub inference_steps: Option<i32>,
    pub temperature: Option<f64>,
    pub cfg_scale: Option<f64>,
    pub language: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Playlist {
    pub id: Uuid,
    pub playlist_key: Option<String>,

    pub prompt: String,
    pub llm_provider: String,
    pub llm_model: String,
    pub mode: PlaylistMode,
    pub hints: GenerationHints,

    pub status: PlaylistStatus,
    pub current_order_index: f64,
    pub songs_generated: i64,
    pub last_seen_at: Option<DateTime<Utc>>,
    pub prompt_epoch: i64,
    pub steer_history: Vec<SteerEntry>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

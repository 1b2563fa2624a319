//! Typed events emitted on the EventBus after a Store mutation commits (§4.1, §9).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::song::SongStatus;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    SongCreated {
        song_id: Uuid,
        playlist_id: Uuid,
    },
    SongStatusChanged {
        song_id: Uuid,
        playlist_id: Uuid,
        from: SongStatus,
        to: SongStatus,
    },
    SongMetadataUpdated {
        song_id: Uuid,
        playlist_id: Uuid,
    },
    SongReordered {
        song_id: Uuid,
        playlist_id: Uuid,
        order_index: f64,
    },
    SongDeleted {
        song_id: Uuid,
        playlist_id: Uuid,
    },
    PlaylistCreated {
        playlist_id: Uuid,
    },
    PlaylistUpdated {
        playlist_id: Uuid,
    },
    PlaylistStatusChanged {
        playlist_id: Uuid,
        from: String,
        to: String,
    },
    PlaylistSteered {
        playlist_id: Uuid,
        epoch: i64,
        prompt: String,
    },
    PlaylistHeartbeat {
        playlist_id: Uuid,
        at: DateTime<Utc>,
    },
    PlaylistDeleted {
        playlist_id: Uuid,
    },
}

impl Event {
    /// The playlist this event concerns, used to route events to the
    /// matching `PlaylistController` without it having to filter every event.
    pub fn playlist_id(&self) -> Uuid {
        match self {
            Event::SongCreated { playlist_id, .. }
            | Event::SongStatusChanged { playlist_id, .. }
            | Event::SongMetadataUpdated { playlist_id, .. }
            | Event::SongReordered { playlist_id, .. }
            | Event::SongDeleted { playlist_id, .. }
            | Event::PlaylistCreated { playlist_id }
            | Event::PlaylistUpdated { playlist_id }
            | Event::PlaylistStatusChanged { playlist_id, .. }
            | Event::PlaylistSteered { playlist_id, .. }
            | Event::PlaylistHeartbeat { playlist_id, .. }
            | Event::PlaylistDeleted { playlist_id } => *playlist_id,
        }
    }
}

//! Save-and-finalize (§4.5): archive a succeeded song's audio (and any
//! cached cover bytes) under the configured music root. Best-effort —
//! failures here must never prevent a song reaching `ready`, since the
//! playable `audioUrl` is already in hand by the time this runs.

use std::path::{Path, PathBuf};

use chrono::Utc;
use serde_json::json;
use tracing::warn;
use uuid::Uuid;

use crate::models::song::Song;

/// Result of a save-and-finalize attempt. `effective_duration` is set only
/// when the archival step measured a trimmed duration different from the
/// one already recorded (e.g. after silence trimming).
#[derive(Debug, Clone, Default)]
pub struct SaveOutcome {
    pub storage_path: Option<String>,
    pub ace_audio_path: Option<String>,
    pub effective_duration: Option<f64>,
}

/// Replace characters illegal (or awkward) in a path segment with `_`.
fn sanitize_segment(raw: &str) -> String {
    let cleaned: String = raw
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' | '\0' => '_',
            c => c,
        })
        .collect();
    let trimmed = cleaned.trim();
    if trimmed.is_empty() {
        "_".to_string()
    } else {
        trimmed.to_string()
    }
}

fn song_folder(music_root: &Path, song: &Song) -> PathBuf {
    let genre = sanitize_segment(song.genre.as_deref().unwrap_or("unknown"));
    let sub_genre = sanitize_segment(song.sub_genre.as_deref().unwrap_or("unknown"));
    let artist = song.artist_name.as_deref().unwrap_or("unknown");
    let title = song.title.as_deref().unwrap_or("untitled");
    let folder_name = sanitize_segment(&format!("{artist} - {title}"));

    music_root.join(genre).join(sub_genre).join(folder_name)
}

/// Run the 5-step archival procedure. `cover_bytes` is whatever the cover
/// step already fetched in memory, if any. Never returns an error: every
/// failure is logged and recorded in `SaveOutcome` as simply "absent".
pub async fn save_and_finalize(
    music_root: &Path,
    song: &Song,
    ace_audio_path: &str,
    cover_bytes: Option<&[u8]>,
) -> SaveOutcome {
    let folder = song_folder(music_root, song);
    let mut outcome = SaveOutcome::default();

    if let Err(e) = tokio::fs::create_dir_all(&folder).await {
        warn!(song_id = %song.id, error = %e, "save-and-finalize: failed to create song folder");
        return outcome;
    }

    if let Err(e) = link_by_id(music_root, song.id, &folder).await {
        warn!(song_id = %song.id, error = %e, "save-and-finalize: failed to create .by-id entry");
    }

    match tokio::fs::read(ace_audio_path).await {
        Ok(bytes) => {
            if let Err(e) = tokio::fs::write(folder.join("audio.mp3"), &bytes).await {
                warn!(song_id = %song.id, error = %e, "save-and-finalize: failed to write audio.mp3");
                return outcome;
            }
        }
        Err(e) => {
            warn!(song_id = %song.id, error = %e, "save-and-finalize: failed to read source audio");
            return outcome;
        }
    }

    if let Some(bytes) = cover_bytes {
        if let Err(e) = tokio::fs::write(folder.join("cover.png"), bytes).await {
            warn!(song_id = %song.id, error = %e, "save-and-finalize: failed to write cover.png");
        }
    }

    if let Some(lyrics) = &song.lyrics {
        if let Err(e) = tokio::fs::write(folder.join("lyrics.txt"), lyrics).await {
            warn!(song_id = %song.id, error = %e, "save-and-finalize: failed to write lyrics.txt");
        }
    }

    let log = json!({
        "songId": song.id,
        "title": song.title,
        "artistName": song.artist_name,
        "genre": song.genre,
        "subGenre": song.sub_genre,
        "caption": song.caption,
        "coverPrompt": song.cover_prompt,
        "bpm": song.bpm,
        "keyScale": song.key_scale,
        "timeSignature": song.time_signature,
        "vocalStyle": song.vocal_style,
        "mood": song.mood,
        "energy": song.energy,
        "era": song.era,
        "instruments": song.instruments,
        "tags": song.tags,
        "themes": song.themes,
        "language": song.language,
        "description": song.description,
        "aceAudioPath": ace_audio_path,
        "finalizedAt": Utc::now().to_rfc3339(),
    });
    if let Err(e) = tokio::fs::write(folder.join("generation.log"), log.to_string()).await {
        warn!(song_id = %song.id, error = %e, "save-and-finalize: failed to write generation.log");
    }

    outcome.storage_path = folder.to_str().map(str::to_string);
    outcome.ace_audio_path = Some(ace_audio_path.to_string());
    outcome
}

/// `.by-id/<songId>` pointing at `folder`: a symlink where supported, else a
/// plain file holding the absolute path (§4.5 step 1).
async fn link_by_id(music_root: &Path, song_id: Uuid, folder: &Path) -> std::io::Result<()> {
    let by_id_dir = music_root.join(".by-id");
    tokio::fs::create_dir_all(&by_id_dir).await?;
    let link_path = by_id_dir.join(song_id.to_string());

    let absolute = tokio::fs::canonicalize(folder).await.unwrap_or_else(|_| folder.to_path_buf());

    #[cfg(unix)]
    {
        if tokio::fs::symlink_metadata(&link_path).await.is_ok() {
            tokio::fs::remove_file(&link_path).await?;
        }
        match tokio::fs::symlink(&absolute, &link_path).await {
            Ok(()) => Ok(()),
            Err(_) => tokio::fs::write(&link_path, absolute.to_string_lossy().as_bytes()).await,
        }
    }

    #[cfg(not(unix))]
    {
        tokio::fs::write(&link_path, absolute.to_string_lossy().as_bytes()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::song::SongStatus;

    fn base_song() -> Song {
        Song {
            id: Uuid::new_v4(),
            playlist_id: Uuid::new_v4(),
            order_index: 1.0,
            title: Some("Midnight Drive".to_string()),
            artist_name: Some("Neon / Static".to_string()),
            genre: Some("Lo-Fi".to_string()),
            sub_genre: Some("Chillhop".to_string()),
            lyrics: Some("la la la".to_string()),
            caption: None,
            cover_prompt: None,
            bpm: Some(90),
            key_scale: None,
            time_signature: None,
            audio_duration: None,
            vocal_style: None,
            mood: None,
            energy: None,
            era: None,
            instruments: vec![],
            tags: vec![],
            themes: vec![],
            language: None,
            description: None,
            cover_url: None,
            audio_url: None,
            storage_path: None,
            ace_audio_path: None,
            status: SongStatus::Saving,
            ace_task_id: None,
            ace_submitted_at: None,
            generation_started_at: None,
            generation_completed_at: None,
            retry_count: 0,
            error_message: None,
            errored_at_status: None,
            cancelled_at_status: None,
            metadata_processing_ms: None,
            cover_processing_ms: None,
            audio_processing_ms: None,
            prompt_epoch: 0,
            is_interrupt: false,
            interrupt_prompt: None,
            user_rating: None,
            listen_count: 0,
            play_duration_ms: 0,
            persona_extract: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn sanitizes_forbidden_characters() {
        assert_eq!(sanitize_segment("Hip/Hop: Trap?"), "Hip_Hop_ Trap_");
    }

    #[test]
    fn folder_uses_artist_title_segment() {
        let song = base_song();
        let folder = song_folder(Path::new("/music"), &song);
        assert_eq!(
            folder,
            Path::new("/music/Lo-Fi/Chillhop/Neon _ Static - Midnight Drive")
        );
    }

    #[tokio::test]
    async fn writes_all_expected_files() {
        let tmp = tempfile::tempdir().unwrap();
        let source_audio = tmp.path().join("source.mp3");
        tokio::fs::write(&source_audio, b"fake-mp3-bytes").await.unwrap();

        let song = base_song();
        let outcome = save_and_finalize(
            tmp.path(),
            &song,
            source_audio.to_str().unwrap(),
            Some(b"fake-png-bytes"),
        )
        .await;

        let folder = PathBuf::from(outcome.storage_path.expect("storage path set"));
        assert!(folder.join("audio.mp3").exists());
        assert!(folder.join("cover.png").exists());
        assert!(folder.join("lyrics.txt").exists());
        assert!(folder.join("generation.log").exists());
        assert!(tmp.path().join(".by-id").join(song.id.to_string()).exists());
    }

    #[tokio::test]
    async fn missing_source_audio_does_not_panic() {
        let tmp = tempfile::tempdir().unwrap();
        let song = base_song();
        let outcome = save_and_finalize(tmp.path(), &song, "/nonexistent/path.mp3", None).await;
        assert!(outcome.storage_path.is_none());
    }

    /// §8: save-and-finalize is idempotent — running it twice with the same
    /// inputs leaves the same files in place rather than erroring or
    /// duplicating the `.by-id` entry.
    #[tokio::test]
    async fn running_twice_with_the_same_inputs_is_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let source_audio = tmp.path().join("source.mp3");
        tokio::fs::write(&source_audio, b"fake-mp3-bytes").await.unwrap();

        let song = base_song();
        let first = save_and_finalize(tmp.path(), &song, source_audio.to_str().unwrap(), Some(b"fake-png-bytes")).await;
        let second = save_and_finalize(tmp.path(), &song, source_audio.to_str().unwrap(), Some(b"fake-png-bytes")).await;

        assert_eq!(first.storage_path, second.storage_path);

        let folder = PathBuf::from(second.storage_path.expect("storage path set"));
        let audio_bytes = tokio::fs::read(folder.join("audio.mp3")).await.unwrap();
        assert_eq!(audio_bytes, b"fake-mp3-bytes");

        let by_id_dir = tmp.path().join(".by-id");
        let mut entries = tokio::fs::read_dir(&by_id_dir).await.unwrap();
        let mut count = 0;
        while entries.next_entry().await.unwrap().is_some() {
            count += 1;
        }
        assert_eq!(count, 1, "re-running must not duplicate the .by-id entry");
    }
}

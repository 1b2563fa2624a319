//! Per-song state-machine driver (§4.4): claims a song, drives it through
//! metadata → cover (fire-and-forget) → audio → save-and-finalize, and is
//! re-entrant from any non-terminal status on restart.
//!
//! Grounded on `enforcement_job_handler.rs`'s claim → execute stages → write
//! result → next stage shape and `token_refresh_job.rs`'s recurring-job/
//! retry-budget structure, generalized from a single HTTP call per job to a
//! multi-stage pipeline spanning three external endpoints.

use std::path::PathBuf;
use std::sync::Arc;

use base64::Engine as _;
use tokio::sync::Mutex;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::error::{AppError, Result};
use crate::metrics::MetricsCollector;
use crate::models::playlist::Playlist;
use crate::models::song::{Song, SongMetadata, SongStatus};
use crate::services::audio_queue::{AudioOutcome, AudioQueue};
use crate::services::cancel::CancelSignal;
use crate::services::circuit_breaker::CircuitBreaker;
use crate::services::endpoint_queue::{EndpointQueue, QueueRequest};
use crate::services::external::{
    AudioService, AudioSubmitParams, GeneratedMetadata, ImageGenerationParams, ImageGenerator,
    TextGenerationParams, TextGenerator,
};
use crate::services::priority::{priority_for_song, RECENT_SONGS_WINDOW};
use crate::services::save_finalize::save_and_finalize;
use crate::services::settings::SettingsStore;
use crate::services::store::Store;

/// How a `run()` call ended. Not an error: `Cancelled` and `Skipped` are
/// both ordinary outcomes of racing other workers/users.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerOutcome {
    Completed,
    Cancelled,
    /// The claim lost a race, or the song was already in a terminal/unknown status.
    Skipped,
}

/// Shared, cloneable dependencies. One `SongWorker` is constructed per song
/// per `PlaylistController` spawn; these are cheap `Arc` clones underneath.
#[derive(Clone)]
pub struct SongWorkerDeps {
    pub store: Store,
    pub settings: SettingsStore,
    pub text_queue: Arc<EndpointQueue<GeneratedMetadata>>,
    pub image_queue: Arc<EndpointQueue<Vec<u8>>>,
    pub audio_queue: Arc<AudioQueue>,
    pub text_generator: Arc<dyn TextGenerator>,
    pub image_generator: Arc<dyn ImageGenerator>,
    pub audio_service: Arc<dyn AudioService>,
    pub circuit_breaker: Arc<CircuitBreaker>,
    pub music_root: PathBuf,
    pub metrics: Arc<MetricsCollector>,
}

pub struct SongWorker {
    deps: SongWorkerDeps,
    song_id: Uuid,
    cancel: CancelSignal,
    cover_bytes: Arc<Mutex<Option<Vec<u8>>>>,
}

impl SongWorker {
    pub fn new(deps: SongWorkerDeps, song_id: Uuid) -> Self {
        Self {
            deps,
            song_id,
            cancel: CancelSignal::new(),
            cover_bytes: Arc::new(Mutex::new(None)),
        }
    }

    /// Abort this song's in-flight work (§4.4 "Cancellation").
    pub async fn cancel(&self) {
        self.cancel.abort();
        self.deps.text_queue.cancel_song(self.song_id).await;
        self.deps.image_queue.cancel_song(self.song_id).await;
        self.deps.audio_queue.cancel_song(self.song_id).await;
    }

    /// Recovery-aware entry point: inspects the current status and jumps to
    /// the stage that resumes it, per §4.4.
    #[instrument(skip(self), fields(song_id = %self.song_id))]
    pub async fn run(&self) -> Result<WorkerOutcome> {
        let song = self.deps.store.get_song(self.song_id).await?;

        match song.status {
            SongStatus::Pending => self.run_metadata().await,
            SongStatus::GeneratingMetadata => {
                self.deps.store.revert_to_pending(self.song_id).await?;
                self.run_metadata().await
            }
            SongStatus::MetadataReady => self.run_cover_and_audio().await,
            SongStatus::SubmittingToAce => {
                self.deps.store.revert_to_metadata_ready(self.song_id).await?;
                self.run_cover_and_audio().await
            }
            SongStatus::GeneratingAudio => {
                let song = self.deps.store.get_song(self.song_id).await?;
                self.resume_audio(&song).await
            }
            SongStatus::Saving => {
                self.deps.store.revert_to_generating_audio(self.song_id).await?;
                let song = self.deps.store.get_song(self.song_id).await?;
                self.resume_audio(&song).await
            }
            _ => Ok(WorkerOutcome::Skipped),
        }
    }

    // -----------------------------------------------------------------
    // Metadata step
    // -----------------------------------------------------------------

    async fn run_metadata(&self) -> Result<WorkerOutcome> {
        let Some(playlist_id) = self.deps.store.claim_for_metadata(self.song_id).await? else {
            return Ok(WorkerOutcome::Skipped);
        };

        let song = self.deps.store.get_song(self.song_id).await?;
        let playlist = self.deps.store.get_playlist(playlist_id).await?;
        let settings = self.deps.settings.job_settings().await?;
        let snapshot = self.deps.store.get_work_queue(playlist_id).await?;

        let recent_titles: Vec<String> = snapshot
            .recent_completed
            .iter()
            .take(RECENT_SONGS_WINDOW)
            .filter_map(|s| s.title.clone())
            .collect();
        let recent_artist_names: Vec<String> = snapshot
            .recent_completed
            .iter()
            .take(RECENT_SONGS_WINDOW)
            .filter_map(|s| s.artist_name.clone())
            .collect();

        let params = TextGenerationParams {
            provider: settings.text_provider.unwrap_or(playlist.llm_provider.clone()),
            model: settings.text_model.unwrap_or(playlist.llm_model.clone()),
            api_key: settings.text_api_key,
            prompt: song.interrupt_prompt.clone().unwrap_or(playlist.prompt.clone()),
            is_interrupt: song.is_interrupt,
            interrupt_prompt: song.interrupt_prompt.clone(),
            recent_titles: recent_titles.clone(),
        };

        let priority = self.priority_for(&song, &playlist);
        let text_generator = self.deps.text_generator.clone();
        let circuit_breaker = self.deps.circuit_breaker.clone();
        let request_params = params.clone();

        let request = QueueRequest {
            song_id: self.song_id,
            priority,
            endpoint: "text".to_string(),
            execute: Box::new(move |signal: CancelSignal| {
                Box::pin(async move {
                    circuit_breaker
                        .execute("text", || text_generator.generate(request_params, signal))
                        .await
                })
            }),
        };

        let first = match self.deps.text_queue.enqueue(request).await {
            Ok(result) => result.result,
            Err(AppError::Cancelled) => return Ok(WorkerOutcome::Cancelled),
            Err(e) => {
                self.deps
                    .store
                    .mark_error(self.song_id, SongStatus::GeneratingMetadata, e.to_string())
                    .await?;
                return Err(e);
            }
        };

        let metadata = if is_duplicate(&first, &recent_titles, &recent_artist_names) {
            info!(song_id = %self.song_id, "metadata duplicate detected, retrying once");
            match self
                .deps
                .circuit_breaker
                .execute("text", || self.deps.text_generator.generate(params, self.cancel.clone()))
                .await
            {
                Ok(retry) => retry,
                Err(AppError::Cancelled) => return Ok(WorkerOutcome::Cancelled),
                Err(_) => first,
            }
        } else {
            first
        };

        self.deps
            .store
            .complete_metadata(self.song_id, generated_to_domain(metadata))
            .await?;

        self.run_cover_and_audio().await
    }

    // -----------------------------------------------------------------
    // Cover step (fire-and-forget) + audio step
    // -----------------------------------------------------------------

    async fn run_cover_and_audio(&self) -> Result<WorkerOutcome> {
        self.spawn_cover_step();

        let song = self.deps.store.get_song(self.song_id).await?;
        self.submit_audio(&song).await
    }

    fn spawn_cover_step(&self) {
        let deps = self.deps.clone();
        let song_id = self.song_id;
        let cover_bytes = self.cover_bytes.clone();

        tokio::spawn(async move {
            let song = match deps.store.get_song(song_id).await {
                Ok(song) => song,
                Err(e) => {
                    warn!(%song_id, error = %e, "cover step: song lookup failed");
                    return;
                }
            };
            let Some(cover_prompt) = song.cover_prompt.clone() else {
                return;
            };
            let settings = match deps.settings.job_settings().await {
                Ok(s) => s,
                Err(_) => return,
            };
            let playlist = match deps.store.get_playlist(song.playlist_id).await {
                Ok(p) => p,
                Err(e) => {
                    warn!(%song_id, error = %e, "cover step: playlist lookup failed");
                    return;
                }
            };

            let params = ImageGenerationParams {
                provider: settings.image_provider.unwrap_or_default(),
                model: settings.image_model.unwrap_or_default(),
                api_key: settings.image_api_key,
                prompt: cover_prompt,
            };

            // §4.4: the cover runs on the image queue at the same priority
            // computed for the metadata enqueue, not a fixed value.
            let priority = priority_for_song(&song, &playlist);
            let image_generator = deps.image_generator.clone();
            let circuit_breaker = deps.circuit_breaker.clone();
            let start = std::time::Instant::now();

            let request = QueueRequest {
                song_id,
                priority,
                endpoint: "image".to_string(),
                execute: Box::new(move |signal: CancelSignal| {
                    Box::pin(async move {
                        circuit_breaker.execute("image", || image_generator.generate(params, signal)).await
                    })
                }),
            };

            match deps.image_queue.enqueue(request).await {
                Ok(result) => {
                    *cover_bytes.lock().await = Some(result.result.clone());
                    let cover_url = format!("data:image/png;base64,{}", base64_encode(&result.result));
                    if let Err(e) = deps.store.update_cover(song_id, cover_url).await {
                        warn!(%song_id, error = %e, "cover step: failed to persist cover url");
                    }
                    let _ = deps
                        .store
                        .update_cover_processing_ms(song_id, start.elapsed().as_millis() as i64)
                        .await;
                }
                Err(AppError::Cancelled) => {}
                Err(e) => warn!(%song_id, error = %e, "cover step failed, continuing without cover"),
            }
        });
    }

    async fn submit_audio(&self, song: &Song) -> Result<WorkerOutcome> {
        let Some(playlist_id) = self.deps.store.claim_for_audio(self.song_id).await? else {
            return Ok(WorkerOutcome::Skipped);
        };
        let playlist = self.deps.store.get_playlist(playlist_id).await?;
        let priority = self.priority_for(song, &playlist);

        let params = AudioSubmitParams {
            lyrics: song.lyrics.clone(),
            caption: song.caption.clone(),
            bpm: song.bpm,
            key_scale: song.key_scale.clone(),
            time_signature: song.time_signature.clone(),
            duration_hint_secs: playlist.hints.duration_hint_secs,
            inference_steps: playlist.hints.inference_steps,
            temperature: playlist.hints.temperature,
            cfg_scale: playlist.hints.cfg_scale,
        };

        let audio_service = self.deps.audio_service.clone();
        let store = self.deps.store.clone();
        let song_id = self.song_id;

        let outcome = match self
            .deps
            .audio_queue
            .submit(
                song_id,
                priority,
                Box::new(move |signal: CancelSignal| {
                    Box::pin(async move {
                        let task_id = audio_service.submit(params, signal).await?;
                        store.update_ace_task(song_id, task_id.clone()).await?;
                        Ok(task_id)
                    })
                }),
            )
            .await
        {
            Ok(outcome) => outcome,
            Err(AppError::Cancelled) => return Ok(WorkerOutcome::Cancelled),
            Err(e) => {
                self.deps
                    .store
                    .mark_error(self.song_id, SongStatus::GeneratingAudio, e.to_string())
                    .await?;
                return Err(e);
            }
        };

        self.finish_audio(outcome).await
    }

    async fn resume_audio(&self, song: &Song) -> Result<WorkerOutcome> {
        let (Some(task_id), Some(submitted_at)) = (song.ace_task_id.clone(), song.ace_submitted_at)
        else {
            self.deps.store.revert_to_metadata_ready(self.song_id).await?;
            return self.run_cover_and_audio().await;
        };

        let outcome = self
            .deps
            .audio_queue
            .resume_poll(self.song_id, task_id, submitted_at)
            .await?;
        self.finish_audio(outcome).await
    }

    async fn finish_audio(&self, outcome: AudioOutcome) -> Result<WorkerOutcome> {
        match outcome {
            AudioOutcome::Succeeded { audio_path } => {
                self.deps.store.begin_saving(self.song_id).await?;
                let song = self.deps.store.get_song(self.song_id).await?;

                let cover_bytes = self.cover_bytes.lock().await.clone();
                let save_outcome = save_and_finalize(
                    &self.deps.music_root,
                    &song,
                    &audio_path,
                    cover_bytes.as_deref(),
                )
                .await;

                match (&save_outcome.storage_path, &save_outcome.ace_audio_path) {
                    (Some(storage_path), Some(ace_audio_path)) => {
                        if let Err(e) = self
                            .deps
                            .store
                            .update_storage_path(self.song_id, storage_path.clone(), ace_audio_path.clone())
                            .await
                        {
                            warn!(song_id = %self.song_id, error = %e, "archival metadata write failed");
                        }
                    }
                    _ => self.deps.metrics.record_archival_failure(),
                }
                if let Some(duration) = save_outcome.effective_duration {
                    let _ = self.deps.store.update_audio_duration(self.song_id, duration).await;
                }

                let processing_ms = song
                    .generation_started_at
                    .map(|start| (chrono::Utc::now() - start).num_milliseconds())
                    .unwrap_or(0);
                self.deps
                    .store
                    .mark_ready(self.song_id, audio_path, processing_ms)
                    .await?;
                self.deps.store.increment_songs_generated(song.playlist_id).await?;
                self.deps.metrics.record_song_generated();
                self.deps
                    .metrics
                    .record_song_transition(SongStatus::GeneratingAudio.as_str(), SongStatus::Ready.as_str());
                Ok(WorkerOutcome::Completed)
            }
            AudioOutcome::Failed { error } => {
                let to = self
                    .deps
                    .store
                    .mark_error(self.song_id, SongStatus::GeneratingAudio, error)
                    .await?;
                self.deps
                    .metrics
                    .record_song_transition(SongStatus::GeneratingAudio.as_str(), to.as_str());
                Ok(WorkerOutcome::Completed)
            }
            AudioOutcome::NotFound => {
                self.deps.store.revert_to_metadata_ready(self.song_id).await?;
                Ok(WorkerOutcome::Completed)
            }
        }
    }

    fn priority_for(&self, song: &Song, playlist: &Playlist) -> i64 {
        priority_for_song(song, playlist)
    }
}

fn is_duplicate(metadata: &GeneratedMetadata, recent_titles: &[String], recent_artist_names: &[String]) -> bool {
    recent_titles.iter().any(|title| title.eq_ignore_ascii_case(&metadata.title))
        || recent_artist_names
            .iter()
            .any(|artist_name| artist_name.eq_ignore_ascii_case(&metadata.artist_name))
}

/// §6/§3: the text adapter's wire result maps onto the domain `SongMetadata`
/// written by `completeMetadata`. `audioDuration` is left unset here — it is
/// the *measured* duration of the rendered audio, populated later by
/// `updateAudioDuration` once save-and-finalize runs, not a value the text
/// adapter can know in advance.
fn generated_to_domain(metadata: GeneratedMetadata) -> SongMetadata {
    SongMetadata {
        title: metadata.title,
        artist_name: metadata.artist_name,
        genre: metadata.genre.unwrap_or_default(),
        sub_genre: metadata.sub_genre.unwrap_or_default(),
        lyrics: metadata.lyrics.unwrap_or_default(),
        caption: metadata.caption.unwrap_or_default(),
        cover_prompt: metadata.cover_prompt.unwrap_or_default(),
        bpm: metadata.bpm,
        key_scale: metadata.key_scale,
        time_signature: metadata.time_signature,
        audio_duration: None,
        vocal_style: metadata.vocal_style,
        mood: metadata.mood,
        energy: metadata.energy,
        era: metadata.era,
        instruments: metadata.instruments,
        tags: metadata.tags,
        themes: metadata.themes,
        language: metadata.language,
        description: metadata.description,
    }
}

/// In-memory `data:` URL fallback used in place of a real artifact store,
/// which is out of scope (§1).
fn base64_encode(bytes: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_title_is_case_insensitive() {
        let metadata = GeneratedMetadata {
            title: "Midnight Drive".to_string(),
            artist_name: "Neon".to_string(),
            genre: None,
            sub_genre: None,
            lyrics: None,
            caption: None,
            cover_prompt: None,
            bpm: None,
            key_scale: None,
            time_signature: None,
            vocal_style: None,
            mood: None,
            energy: None,
            era: None,
            instruments: vec![],
            tags: vec![],
            themes: vec![],
            language: None,
            description: None,
        };
        assert!(is_duplicate(&metadata, &["midnight drive".to_string()], &[]));
        assert!(!is_duplicate(&metadata, &["daylight drive".to_string()], &[]));
    }

    #[test]
    fn duplicate_artist_name_is_case_insensitive() {
        let metadata = GeneratedMetadata {
            title: "Fresh Title".to_string(),
            artist_name: "Neon".to_string(),
            genre: None,
            sub_genre: None,
            lyrics: None,
            caption: None,
            cover_prompt: None,
            bpm: None,
            key_scale: None,
            time_signature: None,
            vocal_style: None,
            mood: None,
            energy: None,
            era: None,
            instruments: vec![],
            tags: vec![],
            themes: vec![],
            language: None,
            description: None,
        };
        assert!(is_duplicate(&metadata, &[], &["neon".to_string()]));
        assert!(!is_duplicate(&metadata, &[], &["other".to_string()]));
    }

    #[test]
    fn base64_encode_matches_known_vector() {
        assert_eq!(base64_encode(b"Man"), "TWFu");
    }
}

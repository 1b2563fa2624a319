//! Per-playlist control loop (§4.6): buffer-fill, closing/steering reaction,
//! and the `songId -> SongWorker` map.
//!
//! Grounded on `catalog_sync/orchestrator.rs`'s `active_runs` map and its
//! spawn-per-unit-of-work shape, generalized from one run per sync trigger
//! to one long-lived worker per song that self-deregisters on completion,
//! and from a manually-triggered sync to an event+tick-driven loop.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::error::Result;
use crate::models::events::Event;
use crate::models::playlist::{Playlist, PlaylistMode, PlaylistStatus};
use crate::services::endpoint_queue::EndpointQueue;
use crate::services::priority::priority_for_song;
use crate::services::song_worker::{SongWorker, SongWorkerDeps};
use crate::services::store::{NewSong, Store};

const TICK_INTERVAL: Duration = Duration::from_secs(3);

/// Handle the Supervisor (or an API handler wanting to cancel a song) holds
/// for a running controller (§4.8).
pub struct PlaylistControllerHandle {
    playlist_id: Uuid,
    stop: Arc<Notify>,
    task: JoinHandle<()>,
    controller: Arc<PlaylistController>,
}

impl PlaylistControllerHandle {
    pub fn playlist_id(&self) -> Uuid {
        self.playlist_id
    }

    /// Ask the control loop to exit after its current iteration. In-flight
    /// song workers are not cancelled (§4.8 shutdown: audio tasks may still
    /// succeed after restart).
    pub fn stop(&self) {
        self.stop.notify_one();
    }

    /// User-initiated abort of one song mid-flight (§4.4 "Cancellation").
    /// No-op if the song has no registered worker (already finished, or
    /// never started).
    pub async fn cancel_song(&self, song_id: Uuid) {
        self.controller.cancel_song(song_id).await;
    }

    pub async fn join(self) {
        let _ = self.task.await;
    }
}

struct WorkerEntry {
    worker: Arc<SongWorker>,
}

/// Per-playlist control loop state, held only by its own spawned task and
/// reached from outside through [`PlaylistControllerHandle`].
struct PlaylistController {
    playlist_id: Uuid,
    store: Store,
    deps: SongWorkerDeps,
    workers: Mutex<HashMap<Uuid, WorkerEntry>>,
}

/// Start a control loop for `playlist_id` and return a handle to stop it.
pub fn spawn(playlist_id: Uuid, store: Store, deps: SongWorkerDeps) -> PlaylistControllerHandle {
    let stop = Arc::new(Notify::new());
    let mut events = store.events().subscribe();

    let controller = Arc::new(PlaylistController {
        playlist_id,
        store,
        deps,
        workers: Mutex::new(HashMap::new()),
    });

    let stop_wait = stop.clone();
    let loop_controller = controller.clone();

    let task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(TICK_INTERVAL);
        ticker.tick().await; // first tick fires immediately

        if let Err(e) = loop_controller.reconcile().await {
            warn!(playlist_id = %playlist_id, error = %e, "initial reconcile failed");
        }

        loop {
            tokio::select! {
                _ = stop_wait.notified() => {
                    debug!(playlist_id = %playlist_id, "playlist controller stopping");
                    break;
                }
                _ = ticker.tick() => {
                    if let Err(e) = loop_controller.reconcile().await {
                        warn!(playlist_id = %playlist_id, error = %e, "reconcile failed");
                    }
                }
                event = events.recv() => {
                    match event {
                        Ok(event) if event.playlist_id() == playlist_id => {
                            if let Err(e) = loop_controller.handle_event(event).await {
                                warn!(playlist_id = %playlist_id, error = %e, "event handling failed");
                            }
                        }
                        Ok(_) => {}
                        Err(broadcast::error::RecvError::Lagged(_)) => {}
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
        }
    });

    PlaylistControllerHandle { playlist_id, stop, task, controller }
}

impl PlaylistController {
    async fn cancel_song(&self, song_id: Uuid) {
        if let Some(entry) = self.workers.lock().await.get(&song_id) {
            entry.worker.cancel().await;
        }
    }

    async fn handle_event(self: &Arc<Self>, event: Event) -> Result<()> {
        match event {
            Event::SongCreated { song_id, .. } => self.ensure_worker(song_id).await,
            Event::PlaylistSteered { .. } => self.resort_for_steer().await,
            Event::PlaylistHeartbeat { .. } | Event::PlaylistStatusChanged { .. } => {
                self.reconcile().await
            }
            _ => Ok(()),
        }
    }

    /// Read the work-queue snapshot, fill the buffer, advance closing
    /// playlists to `closed`, and spawn workers for songs needing attention.
    #[instrument(skip(self), fields(playlist_id = %self.playlist_id))]
    async fn reconcile(self: &Arc<Self>) -> Result<()> {
        let playlist = self.store.get_playlist(self.playlist_id).await?;
        let snapshot = self.store.get_work_queue(self.playlist_id).await?;

        if playlist.status != PlaylistStatus::Closing {
            // §4.6: a oneshot playlist produces exactly one song, then closes;
            // an endless playlist fills the buffer up to BUFFER_TARGET.
            let to_create = if playlist.mode == PlaylistMode::Oneshot {
                if snapshot.total_songs == 0 { 1 } else { 0 }
            } else {
                snapshot.buffer_deficit
            };

            for i in 0..to_create {
                let order_index = snapshot.max_order_index + 1.0 + i as f64;
                let song = self
                    .store
                    .create_song(NewSong {
                        playlist_id: self.playlist_id,
                        order_index,
                        prompt_epoch: playlist.prompt_epoch,
                        is_interrupt: false,
                        interrupt_prompt: None,
                    })
                    .await?;
                self.ensure_worker(song.id).await?;
            }

            if playlist.mode == PlaylistMode::Oneshot && to_create > 0 {
                self.store.update_playlist_status(self.playlist_id, PlaylistStatus::Closing).await?;
            }
        } else if snapshot.transient_count == 0 {
            self.store.update_playlist_status(self.playlist_id, PlaylistStatus::Closed).await?;
            return Ok(());
        }

        for song in &snapshot.retry_pending {
            self.store.retry_errored(song.id).await?;
            self.ensure_worker(song.id).await?;
        }

        for song in snapshot
            .pending
            .iter()
            .chain(snapshot.metadata_ready.iter())
            .chain(snapshot.needs_recovery.iter())
        {
            self.ensure_worker(song.id).await?;
        }

        Ok(())
    }

    /// Spawn a `SongWorker` for `song_id` unless one is already registered;
    /// it removes its own map entry on completion.
    async fn ensure_worker(self: &Arc<Self>, song_id: Uuid) -> Result<()> {
        let mut workers = self.workers.lock().await;
        if workers.contains_key(&song_id) {
            return Ok(());
        }

        let worker = Arc::new(SongWorker::new(self.deps.clone(), song_id));
        let run_worker = worker.clone();
        let controller = self.clone();

        tokio::spawn(async move {
            match run_worker.run().await {
                Ok(outcome) => debug!(%song_id, ?outcome, "song worker finished"),
                Err(e) => warn!(%song_id, error = %e, "song worker failed"),
            }
            controller.workers.lock().await.remove(&song_id);
        });

        workers.insert(song_id, WorkerEntry { worker });
        Ok(())
    }

    /// §4.6 steering: let songs already in flight finish, but deprioritize
    /// ones still waiting in the text/image queues under a stale epoch.
    async fn resort_for_steer(self: &Arc<Self>) -> Result<()> {
        let playlist = self.store.get_playlist(self.playlist_id).await?;
        self.resort_queue(&self.deps.text_queue, &playlist).await;
        self.resort_queue(&self.deps.image_queue, &playlist).await;
        self.reconcile().await
    }

    async fn resort_queue<T: Send + 'static>(&self, queue: &EndpointQueue<T>, playlist: &Playlist) {
        let status = queue.status().await;
        let mut new_priorities = HashMap::new();
        for pending in &status.pending {
            if let Ok(song) = self.store.get_song(pending.song_id).await {
                new_priorities.insert(pending.song_id, priority_for_song(&song, playlist));
            }
        }
        queue
            .resort_pending(move |song_id, old| new_priorities.get(&song_id).copied().unwrap_or(old))
            .await;
    }
}

#[cfg(test)]
mod tests {
    // The control loop needs a live Store (Postgres) and the full
    // SongWorkerDeps graph; exercised in `tests/` integration coverage.
}

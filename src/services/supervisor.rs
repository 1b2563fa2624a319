//! Supervisor (§4.8): startup status reconciliation, then a steady-state
//! loop that starts and stops `PlaylistController`s and drives
//! `AudioQueue::tick_polls`.
//!
//! Grounded on `recovery.rs`'s retry/health-check loop shape (periodic
//! `tokio::time::interval`, logged-and-continued failures) and
//! `catalog_sync/orchestrator.rs`'s run-registry-as-map pattern, generalized
//! from one registry of sync runs to one registry of playlist controllers.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, Notify};
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::Result;
use crate::services::playlist_controller::{self, PlaylistControllerHandle};
use crate::services::song_worker::SongWorkerDeps;
use crate::services::store::Store;

const TICK_INTERVAL: Duration = Duration::from_secs(3);

pub struct Supervisor {
    store: Store,
    deps: SongWorkerDeps,
    controllers: Mutex<HashMap<Uuid, PlaylistControllerHandle>>,
    stop: Arc<Notify>,
}

impl Supervisor {
    pub fn new(store: Store, deps: SongWorkerDeps) -> Self {
        Self {
            store,
            deps,
            controllers: Mutex::new(HashMap::new()),
            stop: Arc::new(Notify::new()),
        }
    }

    /// §4.8 startup recovery. Must run before `run()` starts any controller,
    /// so every in-flight song is re-drivable from an idempotent step
    /// boundary before anything resumes polling or claiming it.
    pub async fn recover(&self) -> Result<()> {
        self.store.reconcile_startup_statuses().await
    }

    /// Ask the steady-state loop to stop after its current tick and run
    /// shutdown. Safe to call from a signal handler running concurrently
    /// with `run()`.
    pub fn request_shutdown(&self) {
        self.stop.notify_one();
    }

    /// Forward a user-initiated cancel to `playlist_id`'s controller, if one
    /// is currently running. A no-op otherwise (§4.4 "Cancellation").
    pub async fn cancel_song(&self, playlist_id: Uuid, song_id: Uuid) {
        if let Some(handle) = self.controllers.lock().await.get(&playlist_id) {
            handle.cancel_song(song_id).await;
        }
    }

    /// Steady-state loop (§4.8): on each tick, reconcile the controller
    /// registry against active+closing playlists and drive audio polling.
    /// Returns once `request_shutdown` has been called and shutdown
    /// completes.
    pub async fn run(&self) {
        let mut ticker = tokio::time::interval(TICK_INTERVAL);
        ticker.tick().await;

        if let Err(e) = self.tick().await {
            warn!(error = %e, "supervisor: initial tick failed");
        }

        loop {
            tokio::select! {
                _ = self.stop.notified() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.tick().await {
                        warn!(error = %e, "supervisor: tick failed");
                    }
                }
            }
        }

        self.shutdown().await;
    }

    async fn tick(&self) -> Result<()> {
        let playlists = self.store.list_active_playlists().await?;
        let wanted: HashSet<Uuid> = playlists.iter().map(|p| p.id).collect();

        let mut controllers = self.controllers.lock().await;

        for playlist in &playlists {
            controllers.entry(playlist.id).or_insert_with(|| {
                info!(playlist_id = %playlist.id, status = %playlist.status.as_str(), "starting playlist controller");
                playlist_controller::spawn(playlist.id, self.store.clone(), self.deps.clone())
            });
        }

        let stopped: Vec<Uuid> = controllers
            .keys()
            .filter(|id| !wanted.contains(id))
            .copied()
            .collect();
        for id in stopped {
            if let Some(handle) = controllers.remove(&id) {
                info!(playlist_id = %id, "stopping playlist controller");
                handle.stop();
            }
        }
        drop(controllers);

        self.deps.audio_queue.tick_polls().await;
        self.report_queue_depths().await;
        Ok(())
    }

    /// §0.5: refresh the per-endpoint pending/active gauges each tick.
    async fn report_queue_depths(&self) {
        let text = self.deps.text_queue.status().await;
        self.deps.metrics.set_queue_depth("text", text.pending_count, text.active_count);

        let image = self.deps.image_queue.status().await;
        self.deps.metrics.set_queue_depth("image", image.pending_count, image.active_count);

        let audio = self.deps.audio_queue.status().await;
        self.deps
            .metrics
            .set_queue_depth("audio", audio.pending_count, if audio.occupied { 1 } else { 0 });
    }

    /// §4.8 shutdown: stop accepting new work, leave in-flight audio tasks
    /// running (they may still succeed after restart and be picked up on
    /// resume), close the Store cleanly.
    async fn shutdown(&self) {
        let mut controllers = self.controllers.lock().await;
        for (_, handle) in controllers.drain() {
            handle.stop();
        }
        drop(controllers);
        self.store.pool().close().await;
    }
}

//! `SongWorker::run()` driven end-to-end against the fake adapters (§4.4,
//! §8 scenarios S1/S2/S4).

mod common;

use std::time::Duration;

use common::store;
use infinitune_core::models::{SongMetadata, SongStatus};
use infinitune_core::services::audio_queue::AudioQueue;
use infinitune_core::services::external::PollStatus;
use infinitune_core::services::song_worker::SongWorker;
use infinitune_core::services::Store;
use rstest::rstest;
use serial_test::serial;

/// The submit -> admit -> poll handoff runs on its own spawned task, so a
/// freshly-submitted job may not be in the `Polling` state the instant a
/// test wants to tick it. Retry a few times rather than guessing one sleep.
async fn tick_until_resolved(queue: &AudioQueue, handle: &tokio::task::JoinHandle<infinitune_core::Result<infinitune_core::services::song_worker::WorkerOutcome>>) {
    for _ in 0..20 {
        if handle.is_finished() {
            return;
        }
        queue.tick_polls().await;
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

/// S1: a freshly created song runs metadata -> cover (skipped, no cover
/// prompt) -> audio -> ready, with the invariants §8 calls out for a `ready`
/// song: `generationCompletedAt >= generationStartedAt` and a non-null
/// `audioUrl`.
#[rstest]
#[tokio::test]
#[serial(infinitune_db)]
async fn happy_path_drives_a_song_to_ready(#[future] store: Store) {
    let store = store.await;
    let playlist = store.create_playlist(common::new_playlist("happy path")).await.unwrap();
    let song = store.create_song(common::new_song(playlist.id, 1.0, 0)).await.unwrap();

    let common::FakeDeps { deps, text, audio, .. } = common::fake_deps(store.clone());
    text.queue(Ok(SongMetadata {
        title: "Drive at Dusk".to_string(),
        artist_name: "Night Static".to_string(),
        cover_prompt: String::new(),
        ..Default::default()
    }));

    let audio_queue = deps.audio_queue.clone();
    let worker = SongWorker::new(deps, song.id);
    let run_handle = tokio::spawn(async move { worker.run().await });

    // finish_audio's best-effort save step will read a nonexistent source
    // path below and simply records no storage path; mark_ready still
    // proceeds regardless (§4.5 "Never returns an error").
    audio.resolve("fake-task-0", PollStatus::Succeeded { audio_path: "/tmp/does-not-exist.mp3".to_string() });
    tick_until_resolved(&audio_queue, &run_handle).await;

    let outcome = run_handle.await.unwrap().unwrap();
    assert_eq!(outcome, infinitune_core::services::song_worker::WorkerOutcome::Completed);

    let reloaded = store.get_song(song.id).await.unwrap();
    assert_eq!(reloaded.status, SongStatus::Ready);
    assert!(reloaded.audio_url.is_some());
    let started = reloaded.generation_started_at.expect("generation_started_at set");
    let completed = reloaded.generation_completed_at.expect("generation_completed_at set");
    assert!(completed >= started);

    common::cleanup(&store).await;
}

/// S2: steering mid-flight bumps the playlist epoch without disturbing a
/// song already in flight from the prior epoch.
#[rstest]
#[tokio::test]
#[serial(infinitune_db)]
async fn steering_mid_flight_does_not_retroactively_change_an_in_flight_song(#[future] store: Store) {
    let store = store.await;
    let playlist = store.create_playlist(common::new_playlist("steer mid-flight")).await.unwrap();
    let song = store.create_song(common::new_song(playlist.id, 1.0, 0)).await.unwrap();

    store.claim_for_metadata(song.id).await.unwrap();

    let steered = store.steer(playlist.id, "completely different vibe".to_string()).await.unwrap();
    assert_eq!(steered.prompt_epoch, 1);

    let in_flight = store.get_song(song.id).await.unwrap();
    assert_eq!(in_flight.prompt_epoch, 0, "the in-flight song keeps the epoch it was created under");

    // A freshly created song after the steer picks up the new epoch.
    let fresh = store
        .create_song(common::new_song(playlist.id, 2.0, steered.prompt_epoch))
        .await
        .unwrap();
    assert_eq!(fresh.prompt_epoch, 1);

    common::cleanup(&store).await;
}

/// S4: a song recovered into `generating_audio` whose task id has aged past
/// the not-found grace period resolves to `NotFound`, reverting to
/// `metadata_ready` so it can be resubmitted.
#[rstest]
#[tokio::test]
#[serial(infinitune_db)]
async fn resuming_a_lost_audio_task_past_grace_reverts_to_metadata_ready(#[future] store: Store) {
    let store = store.await;
    let playlist = store.create_playlist(common::new_playlist("lost task")).await.unwrap();
    let song = store.create_song(common::new_song(playlist.id, 1.0, 0)).await.unwrap();

    store.claim_for_metadata(song.id).await.unwrap();
    store.complete_metadata(song.id, SongMetadata::default()).await.unwrap();
    store.claim_for_audio(song.id).await.unwrap();
    store.update_ace_task(song.id, "task-from-before-crash".to_string()).await.unwrap();

    // Simulate a restart finding the task id aged past NOT_FOUND_GRACE (2 minutes).
    sqlx::query("UPDATE songs SET ace_submitted_at = now() - interval '5 minutes' WHERE id = $1")
        .bind(song.id)
        .execute(store.pool())
        .await
        .unwrap();

    let common::FakeDeps { deps, .. } = common::fake_deps(store.clone());
    // The fake never resolves "task-from-before-crash", so poll() returns
    // NotFound immediately and the grace period has already elapsed.
    let audio_queue = deps.audio_queue.clone();
    let worker = SongWorker::new(deps, song.id);
    let run_handle = tokio::spawn(async move { worker.run().await });

    tick_until_resolved(&audio_queue, &run_handle).await;

    let outcome = run_handle.await.unwrap().unwrap();
    assert_eq!(outcome, infinitune_core::services::song_worker::WorkerOutcome::Completed);

    let reloaded = store.get_song(song.id).await.unwrap();
    assert_eq!(reloaded.status, SongStatus::MetadataReady);
    assert!(reloaded.ace_task_id.is_none());

    common::cleanup(&store).await;
}

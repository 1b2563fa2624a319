//! Song status-machine invariants and round-trip properties (§8) exercised
//! directly against `Store`, independent of the worker pipeline.

mod common;

use std::sync::Arc;

use common::store;
use infinitune_core::models::SongStatus;
use infinitune_core::services::Store;
use rstest::rstest;
use serial_test::serial;

#[rstest]
#[tokio::test]
#[serial(infinitune_db)]
async fn claim_for_metadata_is_won_by_exactly_one_concurrent_caller(#[future] store: Store) {
    let store = store.await;
    let playlist = store.create_playlist(common::new_playlist("race test")).await.unwrap();
    let song = store.create_song(common::new_song(playlist.id, 1.0, 0)).await.unwrap();

    let store = Arc::new(store);
    let mut handles = Vec::new();
    for _ in 0..8 {
        let store = store.clone();
        handles.push(tokio::spawn(async move { store.claim_for_metadata(song.id).await.unwrap() }));
    }

    let mut wins = 0;
    for handle in handles {
        if handle.await.unwrap().is_some() {
            wins += 1;
        }
    }
    assert_eq!(wins, 1, "exactly one concurrent claim_for_metadata call should win");

    let reloaded = store.get_song(song.id).await.unwrap();
    assert_eq!(reloaded.status, SongStatus::GeneratingMetadata);

    common::cleanup(&store).await;
}

#[rstest]
#[tokio::test]
#[serial(infinitune_db)]
async fn claim_for_audio_is_won_by_exactly_one_concurrent_caller(#[future] store: Store) {
    let store = store.await;
    let playlist = store.create_playlist(common::new_playlist("race test 2")).await.unwrap();
    let song = store.create_song(common::new_song(playlist.id, 1.0, 0)).await.unwrap();
    store.claim_for_metadata(song.id).await.unwrap();
    store
        .complete_metadata(song.id, infinitune_core::models::SongMetadata::default())
        .await
        .unwrap();

    let store = Arc::new(store);
    let mut handles = Vec::new();
    for _ in 0..8 {
        let store = store.clone();
        handles.push(tokio::spawn(async move { store.claim_for_audio(song.id).await.unwrap() }));
    }

    let mut wins = 0;
    for handle in handles {
        if handle.await.unwrap().is_some() {
            wins += 1;
        }
    }
    assert_eq!(wins, 1, "exactly one concurrent claim_for_audio call should win");

    common::cleanup(&store).await;
}

/// §8: reindex is idempotent and produces a contiguous integer sequence
/// starting at 1.
#[rstest]
#[tokio::test]
#[serial(infinitune_db)]
async fn reindex_produces_contiguous_integers_and_is_idempotent(#[future] store: Store) {
    let store = store.await;
    let playlist = store.create_playlist(common::new_playlist("reindex test")).await.unwrap();

    let mut song_ids = Vec::new();
    for order in [5.0, 2.5, 9.0] {
        let song = store.create_song(common::new_song(playlist.id, order, 0)).await.unwrap();
        song_ids.push(song.id);
    }

    store.reindex(playlist.id).await.unwrap();
    let snapshot = store.get_work_queue(playlist.id).await.unwrap();
    let mut indices: Vec<f64> = snapshot
        .pending
        .iter()
        .map(|s| s.order_index)
        .collect();
    indices.sort_by(|a, b| a.partial_cmp(b).unwrap());
    assert_eq!(indices, vec![1.0, 2.0, 3.0]);

    // Idempotent: a second pass leaves the same integer sequence.
    store.reindex(playlist.id).await.unwrap();
    let snapshot_again = store.get_work_queue(playlist.id).await.unwrap();
    let mut indices_again: Vec<f64> = snapshot_again.pending.iter().map(|s| s.order_index).collect();
    indices_again.sort_by(|a, b| a.partial_cmp(b).unwrap());
    assert_eq!(indices_again, vec![1.0, 2.0, 3.0]);

    common::cleanup(&store).await;
}

/// S6: `pending -> generating_metadata -> retry_pending` walked three times,
/// then a fourth failure goes terminal with `retryCount = 3`.
#[rstest]
#[tokio::test]
#[serial(infinitune_db)]
async fn retry_budget_exhausts_after_three_attempts(#[future] store: Store) {
    let store = store.await;
    let playlist = store.create_playlist(common::new_playlist("retry budget")).await.unwrap();
    let song = store.create_song(common::new_song(playlist.id, 1.0, 0)).await.unwrap();

    for attempt in 0..3 {
        store.claim_for_metadata(song.id).await.unwrap();
        let to = store
            .mark_error(song.id, SongStatus::GeneratingMetadata, "text adapter down".to_string())
            .await
            .unwrap();
        assert_eq!(to, SongStatus::RetryPending, "attempt {attempt} should still have retry budget");
        store.retry_errored(song.id).await.unwrap();
        let reloaded = store.get_song(song.id).await.unwrap();
        assert_eq!(reloaded.status, SongStatus::Pending);
        assert_eq!(reloaded.retry_count, attempt + 1);
    }

    store.claim_for_metadata(song.id).await.unwrap();
    let to = store
        .mark_error(song.id, SongStatus::GeneratingMetadata, "text adapter down".to_string())
        .await
        .unwrap();
    assert_eq!(to, SongStatus::Error, "budget exhausted, fourth failure is terminal");

    let reloaded = store.get_song(song.id).await.unwrap();
    assert_eq!(reloaded.status, SongStatus::Error);
    assert_eq!(reloaded.retry_count, 3);

    common::cleanup(&store).await;
}

/// S5: crash recovery across the six transient statuses a restart can find
/// songs in, run twice to confirm idempotence.
#[rstest]
#[tokio::test]
#[serial(infinitune_db)]
async fn reconcile_startup_statuses_is_idempotent_across_runs(#[future] store: Store) {
    let store = store.await;
    let playlist = store.create_playlist(common::new_playlist("recovery test")).await.unwrap();

    let generating_metadata = store.create_song(common::new_song(playlist.id, 1.0, 0)).await.unwrap();
    store.claim_for_metadata(generating_metadata.id).await.unwrap();

    let submitting = store.create_song(common::new_song(playlist.id, 2.0, 0)).await.unwrap();
    store.claim_for_metadata(submitting.id).await.unwrap();
    store
        .complete_metadata(submitting.id, infinitune_core::models::SongMetadata::default())
        .await
        .unwrap();
    store.claim_for_audio(submitting.id).await.unwrap();

    let saving = store.create_song(common::new_song(playlist.id, 3.0, 0)).await.unwrap();
    store.claim_for_metadata(saving.id).await.unwrap();
    store
        .complete_metadata(saving.id, infinitune_core::models::SongMetadata::default())
        .await
        .unwrap();
    store.claim_for_audio(saving.id).await.unwrap();
    store.update_ace_task(saving.id, "fake-task-pre-crash".to_string()).await.unwrap();
    store.begin_saving(saving.id).await.unwrap();

    for run in 0..2 {
        store.reconcile_startup_statuses().await.unwrap();

        let a = store.get_song(generating_metadata.id).await.unwrap();
        assert_eq!(a.status, SongStatus::Pending, "run {run}: generating_metadata reverts to pending");

        let b = store.get_song(submitting.id).await.unwrap();
        assert_eq!(b.status, SongStatus::MetadataReady, "run {run}: submitting_to_ace reverts to metadata_ready");

        let c = store.get_song(saving.id).await.unwrap();
        assert_eq!(c.status, SongStatus::GeneratingAudio, "run {run}: saving reverts to generating_audio");
    }

    common::cleanup(&store).await;
}

/// User-initiated cancellation is valid from any non-terminal status and a
/// no-op from a terminal one (§4.4).
#[rstest]
#[tokio::test]
#[serial(infinitune_db)]
async fn mark_cancelled_works_from_any_non_terminal_status_and_is_a_no_op_once_terminal(#[future] store: Store) {
    let store = store.await;
    let playlist = store.create_playlist(common::new_playlist("cancel test")).await.unwrap();
    let song = store.create_song(common::new_song(playlist.id, 1.0, 0)).await.unwrap();

    store.mark_cancelled(song.id).await.unwrap();
    let reloaded = store.get_song(song.id).await.unwrap();
    assert_eq!(reloaded.status, SongStatus::Error);
    assert_eq!(reloaded.cancelled_at_status.as_deref(), Some("pending"));

    // Already terminal: calling again must not error or overwrite the recorded status.
    store.mark_cancelled(song.id).await.unwrap();
    let reloaded_again = store.get_song(song.id).await.unwrap();
    assert_eq!(reloaded_again.cancelled_at_status.as_deref(), Some("pending"));

    common::cleanup(&store).await;
}

//! `getWorkQueue` snapshot invariants (§4.1, §8): buffer deficit counts only
//! songs ahead at the current epoch, and staleness is a pure function of how
//! long a song has sat in a processing status.

mod common;

use common::store;
use infinitune_core::services::Store;
use rstest::rstest;
use serial_test::serial;

/// §8: `bufferDeficit = max(0, BUFFER_TARGET - songsAhead)`, for however many
/// songs currently sit ahead of the playlist's cursor.
#[rstest]
#[case(5, 0)]
#[case(2, 3)]
#[case(0, 5)]
#[tokio::test]
#[serial(infinitune_db)]
async fn buffer_deficit_reflects_songs_ahead_of_target(#[case] songs_ahead: usize, #[case] expected_deficit: usize, #[future] store: Store) {
    let store = store.await;
    let playlist = store.create_playlist(common::new_playlist("buffer test")).await.unwrap();

    for order in 1..=songs_ahead {
        store
            .create_song(common::new_song(playlist.id, order as f64, 0))
            .await
            .unwrap();
    }

    let snapshot = store.get_work_queue(playlist.id).await.unwrap();
    assert_eq!(snapshot.buffer_deficit, expected_deficit);

    common::cleanup(&store).await;
}

/// A song whose epoch lags the playlist's current epoch (stale steer target)
/// does not count toward `songsAhead`, even if its order index is ahead.
#[rstest]
#[tokio::test]
#[serial(infinitune_db)]
async fn songs_from_a_stale_epoch_do_not_count_toward_songs_ahead(#[future] store: Store) {
    let store = store.await;
    let playlist = store.create_playlist(common::new_playlist("epoch test")).await.unwrap();

    store.create_song(common::new_song(playlist.id, 1.0, 0)).await.unwrap();
    store.steer(playlist.id, "new direction".to_string()).await.unwrap();

    let snapshot = store.get_work_queue(playlist.id).await.unwrap();
    assert_eq!(snapshot.buffer_deficit, 5, "the lone song is from epoch 0, playlist is now at epoch 1");

    common::cleanup(&store).await;
}

/// §4.4 staleness: a song stuck in `generating_metadata` past 20 minutes is
/// surfaced in `needsRecovery`/`staleSongs`; a fresh one is not.
#[rstest]
#[tokio::test]
#[serial(infinitune_db)]
async fn stale_songs_surface_only_past_the_twenty_minute_threshold(#[future] store: Store) {
    let store = store.await;
    let playlist = store.create_playlist(common::new_playlist("staleness test")).await.unwrap();

    let fresh = store.create_song(common::new_song(playlist.id, 1.0, 0)).await.unwrap();
    store.claim_for_metadata(fresh.id).await.unwrap();

    let stuck = store.create_song(common::new_song(playlist.id, 2.0, 0)).await.unwrap();
    store.claim_for_metadata(stuck.id).await.unwrap();
    sqlx::query("UPDATE songs SET generation_started_at = now() - interval '30 minutes' WHERE id = $1")
        .bind(stuck.id)
        .execute(store.pool())
        .await
        .unwrap();

    let snapshot = store.get_work_queue(playlist.id).await.unwrap();
    assert!(snapshot.stale_songs.contains(&stuck.id));
    assert!(!snapshot.stale_songs.contains(&fresh.id));

    common::cleanup(&store).await;
}

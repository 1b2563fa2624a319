//! Playlist CRUD, lifecycle transitions, steering, and heartbeat
//! reactivation against a real database (§3, §8).

mod common;

use common::store;
use infinitune_core::models::{PlaylistMode, PlaylistStatus};
use infinitune_core::services::Store;
use infinitune_core::AppError;
use rstest::rstest;
use serial_test::serial;

#[rstest]
#[tokio::test]
#[serial(infinitune_db)]
async fn create_get_list_and_delete_round_trip(#[future] store: Store) {
    let store = store.await;

    let playlist = store
        .create_playlist(common::new_playlist(&common::random_prompt()))
        .await
        .unwrap();
    assert_eq!(playlist.status, PlaylistStatus::Active);
    assert_eq!(playlist.prompt_epoch, 0);
    assert!(playlist.steer_history.is_empty());

    let fetched = store.get_playlist(playlist.id).await.unwrap();
    assert_eq!(fetched.id, playlist.id);

    let all = store.list_all_playlists().await.unwrap();
    assert!(all.iter().any(|p| p.id == playlist.id));

    store.delete_playlist(playlist.id).await.unwrap();
    let err = store.get_playlist(playlist.id).await.unwrap_err();
    assert!(matches!(err, AppError::NotFound { entity: "playlist", .. }));

    common::cleanup(&store).await;
}

#[rstest]
#[tokio::test]
#[serial(infinitune_db)]
async fn deleting_playlist_cascades_to_songs(#[future] store: Store) {
    let store = store.await;

    let playlist = store.create_playlist(common::new_playlist("ambient drones")).await.unwrap();
    let song = store
        .create_song(common::new_song(playlist.id, 1.0, 0))
        .await
        .unwrap();

    store.delete_playlist(playlist.id).await.unwrap();

    let err = store.get_song(song.id).await.unwrap_err();
    assert!(matches!(err, AppError::NotFound { entity: "song", .. }));

    common::cleanup(&store).await;
}

/// §8: steer bumps `promptEpoch` by exactly 1 and appends exactly one
/// `steerHistory` entry per call.
#[rstest]
#[tokio::test]
#[serial(infinitune_db)]
async fn steer_bumps_epoch_by_one_and_appends_one_history_entry(#[future] store: Store) {
    let store = store.await;
    let playlist = store.create_playlist(common::new_playlist("synthwave")).await.unwrap();

    let after_first = store.steer(playlist.id, "more synthwave".to_string()).await.unwrap();
    assert_eq!(after_first.prompt_epoch, 1);
    assert_eq!(after_first.steer_history.len(), 1);
    assert_eq!(after_first.steer_history[0].epoch, 1);
    assert_eq!(after_first.prompt, "more synthwave");

    let after_second = store.steer(playlist.id, "darker synthwave".to_string()).await.unwrap();
    assert_eq!(after_second.prompt_epoch, 2);
    assert_eq!(after_second.steer_history.len(), 2);
    assert_eq!(after_second.steer_history[1].epoch, 2);

    common::cleanup(&store).await;
}

/// §3 lifecycle edges: `active -> closing -> closed`, and `closed -> active`
/// only for `endless` mode.
#[rstest]
#[tokio::test]
#[serial(infinitune_db)]
async fn playlist_status_transitions_follow_lifecycle_edges(#[future] store: Store) {
    let store = store.await;
    let playlist = store.create_playlist(common::new_playlist("deep focus")).await.unwrap();

    store.update_playlist_status(playlist.id, PlaylistStatus::Closing).await.unwrap();
    store.update_playlist_status(playlist.id, PlaylistStatus::Closed).await.unwrap();

    let reopened = store.update_playlist_status(playlist.id, PlaylistStatus::Active).await;
    assert!(reopened.is_ok(), "endless playlists may reopen from closed");

    common::cleanup(&store).await;
}

#[rstest]
#[tokio::test]
#[serial(infinitune_db)]
async fn oneshot_playlist_cannot_reopen_once_closed(#[future] store: Store) {
    let store = store.await;
    let mut input = common::new_playlist("one good track");
    input.mode = PlaylistMode::Oneshot;
    let playlist = store.create_playlist(input).await.unwrap();

    store.update_playlist_status(playlist.id, PlaylistStatus::Closing).await.unwrap();
    store.update_playlist_status(playlist.id, PlaylistStatus::Closed).await.unwrap();

    let err = store.update_playlist_status(playlist.id, PlaylistStatus::Active).await.unwrap_err();
    assert!(matches!(err, AppError::InvalidTransition { entity: "playlist", .. }));

    common::cleanup(&store).await;
}

/// A heartbeat against a `closing` playlist reactivates it (§3, §4.6).
#[rstest]
#[tokio::test]
#[serial(infinitune_db)]
async fn heartbeat_reactivates_a_closing_playlist(#[future] store: Store) {
    let store = store.await;
    let playlist = store.create_playlist(common::new_playlist("heartbeat test")).await.unwrap();
    store.update_playlist_status(playlist.id, PlaylistStatus::Closing).await.unwrap();

    store.heartbeat(playlist.id).await.unwrap();

    let reloaded = store.get_playlist(playlist.id).await.unwrap();
    assert_eq!(reloaded.status, PlaylistStatus::Active);
    assert!(reloaded.last_seen_at.is_some());

    common::cleanup(&store).await;
}

#[rstest]
#[tokio::test]
#[serial(infinitune_db)]
async fn heartbeat_on_unknown_playlist_is_a_no_op(#[future] store: Store) {
    let store = store.await;
    store.heartbeat(uuid::Uuid::new_v4()).await.unwrap();
    common::cleanup(&store).await;
}

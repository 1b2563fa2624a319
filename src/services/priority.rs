//! Per-song priority computation (§4.7). Lower is sooner.

use crate::models::playlist::{Playlist, PlaylistMode, PlaylistStatus};
use crate::models::song::Song;

/// Small constant: how many recent songs to consult for title/artist
/// duplicate-detection in the metadata step (§9 Open Questions: source uses 5).
pub const RECENT_SONGS_WINDOW: usize = 5;

#[derive(Debug, Clone, Copy)]
pub struct PriorityInput {
    pub is_oneshot: bool,
    pub is_interrupt: bool,
    pub order_index: f64,
    pub current_order_index: f64,
    pub song_epoch: i64,
    pub current_epoch: i64,
    pub playlist_closing: bool,
}

/// Compute a song's admission priority per §4.7's table.
pub fn compute_priority(input: PriorityInput) -> i64 {
    if input.is_oneshot {
        return 0;
    }
    if input.is_interrupt {
        return 1;
    }

    let distance = (input.order_index - input.current_order_index).max(0.0);
    let mut priority = 100 + distance.round() as i64;

    let epoch_lag = (input.current_epoch - input.song_epoch).max(0);
    priority += 5000 * epoch_lag;

    if input.playlist_closing {
        priority += 10000;
    }

    priority
}

/// Convenience wrapper over [`compute_priority`] for callers that already
/// hold the `Song`/`Playlist` pair (`SongWorker` at enqueue time,
/// `PlaylistController` when resorting on a steer).
pub fn priority_for_song(song: &Song, playlist: &Playlist) -> i64 {
    compute_priority(PriorityInput {
        is_oneshot: playlist.mode == PlaylistMode::Oneshot,
        is_interrupt: song.is_interrupt,
        order_index: song.order_index,
        current_order_index: playlist.current_order_index,
        song_epoch: song.prompt_epoch,
        current_epoch: playlist.prompt_epoch,
        playlist_closing: playlist.status == PlaylistStatus::Closing,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn base() -> PriorityInput {
        PriorityInput {
            is_oneshot: false,
            is_interrupt: false,
            order_index: 0.0,
            current_order_index: 0.0,
            song_epoch: 0,
            current_epoch: 0,
            playlist_closing: false,
        }
    }

    #[test]
    fn oneshot_always_zero() {
        let mut input = base();
        input.is_oneshot = true;
        input.order_index = 50.0;
        assert_eq!(compute_priority(input), 0);
    }

    #[test]
    fn interrupt_is_one() {
        let mut input = base();
        input.is_interrupt = true;
        assert_eq!(compute_priority(input), 1);
    }

    #[test]
    fn normal_song_distance_from_playback() {
        let mut input = base();
        input.order_index = 5.0;
        input.current_order_index = 2.0;
        assert_eq!(compute_priority(input), 103);
    }

    #[test]
    fn normal_song_never_negative_distance() {
        let mut input = base();
        input.order_index = 1.0;
        input.current_order_index = 5.0;
        assert_eq!(compute_priority(input), 100);
    }

    #[test]
    fn old_epoch_is_deprioritized_proportionally() {
        let mut input = base();
        input.current_epoch = 2;
        input.song_epoch = 0;
        assert_eq!(compute_priority(input), 100 + 5000 * 2);
    }

    #[test]
    fn closing_playlist_adds_ten_thousand() {
        let mut input = base();
        input.playlist_closing = true;
        assert_eq!(compute_priority(input), 100 + 10000);
    }

    #[test]
    fn priority_orders_oneshot_before_interrupt_before_normal() {
        let mut oneshot = base();
        oneshot.is_oneshot = true;
        let mut interrupt = base();
        interrupt.is_interrupt = true;
        let normal = base();

        assert!(compute_priority(oneshot) < compute_priority(interrupt));
        assert!(compute_priority(interrupt) < compute_priority(normal));
    }

    proptest! {
        /// §8: a song with a strictly lower priority *value* is admitted no
        /// later than one with a higher value, so the ordering the fixed
        /// tests above check for `base()` must hold for arbitrary inputs too.
        #[test]
        fn oneshot_beats_interrupt_beats_normal_for_any_inputs(
            order_index in 0.0f64..10_000.0,
            current_order_index in 0.0f64..10_000.0,
            epoch_lag in 0i64..50,
            playlist_closing in proptest::bool::ANY,
        ) {
            let mut oneshot = base();
            oneshot.is_oneshot = true;
            oneshot.order_index = order_index;
            oneshot.current_order_index = current_order_index;
            oneshot.current_epoch = epoch_lag;
            oneshot.playlist_closing = playlist_closing;

            let mut interrupt = base();
            interrupt.is_interrupt = true;
            interrupt.order_index = order_index;
            interrupt.current_order_index = current_order_index;
            interrupt.current_epoch = epoch_lag;
            interrupt.playlist_closing = playlist_closing;

            let mut normal = base();
            normal.order_index = order_index;
            normal.current_order_index = current_order_index;
            normal.current_epoch = epoch_lag;
            normal.playlist_closing = playlist_closing;

            prop_assert!(compute_priority(oneshot) < compute_priority(interrupt));
            prop_assert!(compute_priority(interrupt) < compute_priority(normal));
        }

        /// Priority is never negative, and moving strictly further from
        /// `current_order_index` never makes a normal song's priority lower.
        #[test]
        fn priority_is_non_negative_and_monotonic_in_distance(
            current_order_index in 0.0f64..10_000.0,
            near in 0.0f64..1_000.0,
            far_delta in 0.1f64..1_000.0,
        ) {
            let mut nearer = base();
            nearer.order_index = current_order_index + near;
            nearer.current_order_index = current_order_index;

            let mut farther = base();
            farther.order_index = current_order_index + near + far_delta;
            farther.current_order_index = current_order_index;

            prop_assert!(compute_priority(nearer) >= 0);
            prop_assert!(compute_priority(farther) >= compute_priority(nearer));
        }
    }
}

pub mod events;
pub mod playlists;
pub mod queues;
pub mod songs;

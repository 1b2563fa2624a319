pub mod audio_queue;
pub mod cancel;
pub mod circuit_breaker;
pub mod endpoint_queue;
pub mod event_bus;
pub mod external;
pub mod playlist_controller;
pub mod priority;
pub mod save_finalize;
pub mod settings;
pub mod song_worker;
pub mod store;
pub mod supervisor;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use event_bus::EventBus;
pub use settings::{JobSettings, SettingsStore};
pub use song_worker::{SongWorker, SongWorkerDeps, WorkerOutcome};
pub use store::Store;
pub use supervisor::Supervisor;

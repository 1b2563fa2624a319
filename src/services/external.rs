//! External adapter traits for the three downstream services (§6): text
//! generation, image generation, and the ACE audio service. Each is a small
//! `async_trait` seam with an in-memory fake for tests, grounded on this
//! codebase's `stubs.rs` convention of hand-written stub services returning
//! canned results rather than a generated mock for every adapter.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::AppError;
use crate::services::cancel::CancelSignal;

/// Parameters for a text-generation call (§4.4 "request_metadata").
#[derive(Debug, Clone)]
pub struct TextGenerationParams {
    pub provider: String,
    pub model: String,
    pub api_key: Option<String>,
    pub prompt: String,
    pub is_interrupt: bool,
    pub interrupt_prompt: Option<String>,
    pub recent_titles: Vec<String>,
}

/// Generated song metadata (§3 `SongMetadata`), as returned by the text adapter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneratedMetadata {
    pub title: String,
    pub artist_name: String,
    pub genre: Option<String>,
    pub sub_genre: Option<String>,
    pub lyrics: Option<String>,
    pub caption: Option<String>,
    pub cover_prompt: Option<String>,
    pub bpm: Option<i32>,
    pub key_scale: Option<String>,
    pub time_signature: Option<String>,
    pub vocal_style: Option<String>,
    pub mood: Option<String>,
    pub energy: Option<String>,
    pub era: Option<String>,
    pub instruments: Vec<String>,
    pub tags: Vec<String>,
    pub themes: Vec<String>,
    pub language: Option<String>,
    pub description: Option<String>,
}

#[async_trait]
pub trait TextGenerator: Send + Sync {
    async fn generate(
        &self,
        params: TextGenerationParams,
        signal: CancelSignal,
    ) -> Result<GeneratedMetadata, AppError>;
}

/// Parameters for an image-generation call (cover art, §4.4 "request_cover").
#[derive(Debug, Clone)]
pub struct ImageGenerationParams {
    pub provider: String,
    pub model: String,
    pub api_key: Option<String>,
    pub prompt: String,
}

#[async_trait]
pub trait ImageGenerator: Send + Sync {
    /// Returns opaque image bytes; `save_finalize` is responsible for
    /// writing them under the storage root.
    async fn generate(
        &self,
        params: ImageGenerationParams,
        signal: CancelSignal,
    ) -> Result<Vec<u8>, AppError>;
}

/// Parameters for the ACE audio submit call (§4.3).
#[derive(Debug, Clone)]
pub struct AudioSubmitParams {
    pub lyrics: Option<String>,
    pub caption: Option<String>,
    pub bpm: Option<i32>,
    pub key_scale: Option<String>,
    pub time_signature: Option<String>,
    pub duration_hint_secs: Option<i32>,
    pub inference_steps: Option<i32>,
    pub temperature: Option<f64>,
    pub cfg_scale: Option<f64>,
}

#[derive(Debug, Clone)]
pub enum PollStatus {
    Running,
    Succeeded { audio_path: String },
    Failed { error: String },
    NotFound,
}

#[async_trait]
pub trait AudioService: Send + Sync {
    /// Submit a generation job, returning the provider's task id.
    async fn submit(
        &self,
        params: AudioSubmitParams,
        signal: CancelSignal,
    ) -> Result<String, AppError>;

    /// Poll a previously submitted task. `signal` lets a slow poll call be
    /// abandoned on cancellation without blocking the slot indefinitely.
    async fn poll(&self, task_id: &str, signal: CancelSignal) -> Result<PollStatus, AppError>;
}

// ---------------------------------------------------------------------
// Fakes, for use in tests only.
// ---------------------------------------------------------------------

pub struct FakeTextGenerator {
    pub next: Mutex<Option<Result<GeneratedMetadata, String>>>,
}

impl FakeTextGenerator {
    pub fn new() -> Self {
        Self {
            next: Mutex::new(None),
        }
    }

    pub fn queue(&self, result: Result<GeneratedMetadata, String>) {
        *self.next.lock().unwrap() = Some(result);
    }
}

impl Default for FakeTextGenerator {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TextGenerator for FakeTextGenerator {
    async fn generate(
        &self,
        _params: TextGenerationParams,
        _signal: CancelSignal,
    ) -> Result<GeneratedMetadata, AppError> {
        match self.next.lock().unwrap().take() {
            Some(Ok(metadata)) => Ok(metadata),
            Some(Err(message)) => Err(AppError::TransientExternalFailure {
                endpoint: "text".to_string(),
                message,
            }),
            None => Err(AppError::TransientExternalFailure {
                endpoint: "text".to_string(),
                message: "no fake response queued".to_string(),
            }),
        }
    }
}

pub struct FakeImageGenerator {
    pub next: Mutex<Option<Result<Vec<u8>, String>>>,
}

impl FakeImageGenerator {
    pub fn new() -> Self {
        Self {
            next: Mutex::new(None),
        }
    }

    pub fn queue(&self, result: Result<Vec<u8>, String>) {
        *self.next.lock().unwrap() = Some(result);
    }
}

impl Default for FakeImageGenerator {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ImageGenerator for FakeImageGenerator {
    async fn generate(
        &self,
        _params: ImageGenerationParams,
        _signal: CancelSignal,
    ) -> Result<Vec<u8>, AppError> {
        match self.next.lock().unwrap().take() {
            Some(Ok(bytes)) => Ok(bytes),
            Some(Err(message)) => Err(AppError::TransientExternalFailure {
                endpoint: "image".to_string(),
                message,
            }),
            None => Err(AppError::TransientExternalFailure {
                endpoint: "image".to_string(),
                message: "no fake response queued".to_string(),
            }),
        }
    }
}

/// In-memory task table keyed by task id, driven manually from tests via
/// `resolve`. `submit` hands out sequential task ids.
pub struct FakeAudioService {
    tasks: Mutex<HashMap<String, PollStatus>>,
    next_id: Mutex<u64>,
}

impl FakeAudioService {
    pub fn new() -> Self {
        Self {
            tasks: Mutex::new(HashMap::new()),
            next_id: Mutex::new(0),
        }
    }

    pub fn resolve(&self, task_id: &str, status: PollStatus) {
        self.tasks.lock().unwrap().insert(task_id.to_string(), status);
    }
}

impl Default for FakeAudioService {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AudioService for FakeAudioService {
    async fn submit(
        &self,
        _params: AudioSubmitParams,
        _signal: CancelSignal,
    ) -> Result<String, AppError> {
        let mut next_id = self.next_id.lock().unwrap();
        let id = format!("fake-task-{}", *next_id);
        *next_id += 1;
        self.tasks.lock().unwrap().insert(id.clone(), PollStatus::Running);
        Ok(id)
    }

    async fn poll(&self, task_id: &str, _signal: CancelSignal) -> Result<PollStatus, AppError> {
        Ok(self
            .tasks
            .lock()
            .unwrap()
            .get(task_id)
            .cloned()
            .unwrap_or(PollStatus::NotFound))
    }
}

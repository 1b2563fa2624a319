//! Specialized single-slot submit -> poll -> finalize pipeline for the audio
//! service (§4.3). Exactly one song occupies the pipeline end-to-end because
//! the underlying service cannot usefully parallelize submissions.
//!
//! Structurally this is `EndpointQueue` specialized to `max_concurrency = 1`
//! plus a second, externally-ticked phase (poll) that the plain admission
//! model doesn't have; grounded on the same `job_queue.rs` worker-pool idiom
//! as `EndpointQueue`, with the poll loop itself authored fresh since the
//! teacher has no poll-based external service.

use std::collections::BinaryHeap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use tokio::sync::{oneshot, Mutex};
use tracing::warn;
use uuid::Uuid;

use crate::error::AppError;
use crate::services::cancel::CancelSignal;
use crate::services::external::{AudioService, PollStatus};

/// §4.3: "Beyond the grace period, resolve with status not_found."
pub const NOT_FOUND_GRACE: ChronoDuration = ChronoDuration::minutes(2);

pub type BoxFuture<T> = Pin<Box<dyn Future<Output = Result<T, AppError>> + Send>>;

#[derive(Debug, Clone)]
pub enum AudioOutcome {
    Succeeded { audio_path: String },
    Failed { error: String },
    NotFound,
}

enum PendingKind {
    /// Needs a submit call; closure should call the external service and
    /// persist the returned task id via `updateAceTask` itself, then return it.
    Fresh(Box<dyn FnOnce(CancelSignal) -> BoxFuture<String> + Send>),
    /// Recovery path (§4.8): already has a task id, skip submit entirely.
    Resume {
        task_id: String,
        submitted_at: DateTime<Utc>,
    },
}

struct PendingEntry {
    song_id: Uuid,
    priority: i64,
    seq: u64,
    kind: PendingKind,
    reply: oneshot::Sender<Result<AudioOutcome, AppError>>,
}

impl PartialEq for PendingEntry {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}
impl Eq for PendingEntry {}
impl PartialOrd for PendingEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for PendingEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (other.priority, other.seq).cmp(&(self.priority, self.seq))
    }
}

enum SlotState {
    Submitting,
    Polling,
}

struct Slot {
    song_id: Uuid,
    task_id: Option<String>,
    submitted_at: Option<DateTime<Utc>>,
    state: SlotState,
    cancel: CancelSignal,
    reply: Option<oneshot::Sender<Result<AudioOutcome, AppError>>>,
}

struct Inner {
    pending: BinaryHeap<PendingEntry>,
    slot: Option<Slot>,
    last_error: Option<String>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct AudioQueueStatus {
    pub pending_count: usize,
    pub occupied: bool,
    pub current_song_id: Option<Uuid>,
    pub last_error: Option<String>,
}

pub struct AudioQueue {
    inner: Arc<Mutex<Inner>>,
    audio_service: Arc<dyn AudioService>,
    seq: AtomicU64,
}

impl AudioQueue {
    pub fn new(audio_service: Arc<dyn AudioService>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                pending: BinaryHeap::new(),
                slot: None,
                last_error: None,
            })),
            audio_service,
            seq: AtomicU64::new(0),
        }
    }

    /// Submit a fresh audio job. Resolves once the task reaches a terminal
    /// outcome (or is cancelled).
    pub async fn submit(
        &self,
        song_id: Uuid,
        priority: i64,
        execute: Box<dyn FnOnce(CancelSignal) -> BoxFuture<String> + Send>,
    ) -> Result<AudioOutcome, AppError> {
        self.enqueue(song_id, priority, PendingKind::Fresh(execute))
            .await
    }

    /// Resume polling a song previously in `generating_audio` (§4.8
    /// recovery). Enters at the highest priority and skips the submit step.
    pub async fn resume_poll(
        &self,
        song_id: Uuid,
        task_id: String,
        submitted_at: DateTime<Utc>,
    ) -> Result<AudioOutcome, AppError> {
        self.enqueue(
            song_id,
            0,
            PendingKind::Resume {
                task_id,
                submitted_at,
            },
        )
        .await
    }

    async fn enqueue(
        &self,
        song_id: Uuid,
        priority: i64,
        kind: PendingKind,
    ) -> Result<AudioOutcome, AppError> {
        let (tx, rx) = oneshot::channel();
        let seq = self.seq.fetch_add(1, Ordering::SeqCst);

        {
            let mut inner = self.inner.lock().await;
            inner.pending.push(PendingEntry {
                song_id,
                priority,
                seq,
                kind,
                reply: tx,
            });
            self.admit_next(&mut inner);
        }

        rx.await.unwrap_or(Err(AppError::Cancelled))
    }

    /// If the slot is free, pop the highest-priority pending entry and occupy it.
    fn admit_next(&self, inner: &mut Inner) {
        if inner.slot.is_some() {
            return;
        }
        let Some(entry) = inner.pending.pop() else {
            return;
        };

        let cancel = CancelSignal::new();

        match entry.kind {
            PendingKind::Resume {
                task_id,
                submitted_at,
            } => {
                inner.slot = Some(Slot {
                    song_id: entry.song_id,
                    task_id: Some(task_id),
                    submitted_at: Some(submitted_at),
                    state: SlotState::Polling,
                    cancel,
                    reply: Some(entry.reply),
                });
            }
            PendingKind::Fresh(execute) => {
                inner.slot = Some(Slot {
                    song_id: entry.song_id,
                    task_id: None,
                    submitted_at: None,
                    state: SlotState::Submitting,
                    cancel: cancel.clone(),
                    reply: Some(entry.reply),
                });

                let inner_arc = self.inner.clone();
                let song_id = entry.song_id;
                tokio::spawn(async move {
                    let outcome = execute(cancel).await;
                    let mut inner = inner_arc.lock().await;
                    let Some(slot) = inner.slot.as_mut() else {
                        return;
                    };
                    if slot.song_id != song_id {
                        return;
                    }
                    match outcome {
                        Ok(task_id) => {
                            slot.task_id = Some(task_id);
                            slot.submitted_at = Some(Utc::now());
                            slot.state = SlotState::Polling;
                        }
                        Err(e) => {
                            inner.last_error = Some(e.to_string());
                            let mut slot = inner.slot.take().unwrap();
                            if let Some(reply) = slot.reply.take() {
                                let _ = reply.send(Err(e));
                            }
                        }
                    }
                });
            }
        }
    }

    /// Invoked externally at a regular cadence (§4.3, §4.8): issue one poll
    /// call for whichever song currently occupies the slot, if it's past the
    /// submit phase.
    pub async fn tick_polls(&self) {
        let (task_id, cancel) = {
            let inner = self.inner.lock().await;
            match inner.slot.as_ref() {
                Some(Slot {
                    state: SlotState::Polling,
                    task_id: Some(task_id),
                    cancel,
                    ..
                }) => (task_id.clone(), cancel.clone()),
                _ => return,
            }
        };

        let poll_result = self.audio_service.poll(&task_id, cancel).await;

        let mut inner = self.inner.lock().await;
        let Some(slot) = inner.slot.as_ref() else {
            return;
        };
        if slot.task_id.as_deref() != Some(task_id.as_str()) {
            return;
        }

        let outcome = match poll_result {
            Ok(PollStatus::Running) => None,
            Ok(PollStatus::Succeeded { audio_path }) => Some(Ok(AudioOutcome::Succeeded { audio_path })),
            Ok(PollStatus::Failed { error }) => Some(Ok(AudioOutcome::Failed { error })),
            Ok(PollStatus::NotFound) => {
                let submitted_at = slot.submitted_at.unwrap_or_else(Utc::now);
                if Utc::now() - submitted_at < NOT_FOUND_GRACE {
                    None
                } else {
                    Some(Ok(AudioOutcome::NotFound))
                }
            }
            Err(e) => {
                warn!(error = %e, task_id = %task_id, "audio poll I/O error, slot remains polling");
                inner.last_error = Some(e.to_string());
                None
            }
        };

        if let Some(outcome) = outcome {
            let mut slot = inner.slot.take().unwrap();
            if let Some(reply) = slot.reply.take() {
                let _ = reply.send(outcome);
            }
            self.admit_next(&mut inner);
        }
    }

    pub async fn cancel_song(&self, song_id: Uuid) {
        let mut inner = self.inner.lock().await;

        let mut remaining = BinaryHeap::new();
        while let Some(entry) = inner.pending.pop() {
            if entry.song_id == song_id {
                let _ = entry.reply.send(Err(AppError::Cancelled));
            } else {
                remaining.push(entry);
            }
        }
        inner.pending = remaining;

        let occupied_by_song = matches!(&inner.slot, Some(slot) if slot.song_id == song_id);
        if occupied_by_song {
            let mut slot = inner.slot.take().unwrap();
            slot.cancel.abort();
            if let Some(reply) = slot.reply.take() {
                let _ = reply.send(Err(AppError::Cancelled));
            }
            self.admit_next(&mut inner);
        }
    }

    pub async fn status(&self) -> AudioQueueStatus {
        let inner = self.inner.lock().await;
        AudioQueueStatus {
            pending_count: inner.pending.len(),
            occupied: inner.slot.is_some(),
            current_song_id: inner.slot.as_ref().map(|s| s.song_id),
            last_error: inner.last_error.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::external::FakeAudioService;

    #[tokio::test]
    async fn single_slot_serializes_submissions() {
        let fake = Arc::new(FakeAudioService::new());
        let queue = Arc::new(AudioQueue::new(fake.clone()));

        let song_a = Uuid::new_v4();
        let song_b = Uuid::new_v4();

        let queue_a = queue.clone();
        let task_a = tokio::spawn(async move {
            queue_a
                .submit(
                    song_a,
                    100,
                    Box::new(|_signal| Box::pin(async { Ok("task-a".to_string()) })),
                )
                .await
        });
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;

        let queue_b = queue.clone();
        let task_b = tokio::spawn(async move {
            queue_b
                .submit(
                    song_b,
                    100,
                    Box::new(|_signal| Box::pin(async { Ok("task-b".to_string()) })),
                )
                .await
        });
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;

        let status = queue.status().await;
        assert_eq!(status.pending_count, 1);
        assert!(status.occupied);

        fake.resolve("task-a", PollStatus::Succeeded { audio_path: "a.mp3".into() });
        queue.tick_polls().await;
        let a_outcome = task_a.await.unwrap().unwrap();
        assert!(matches!(a_outcome, AudioOutcome::Succeeded { .. }));

        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        fake.resolve("task-b", PollStatus::Succeeded { audio_path: "b.mp3".into() });
        queue.tick_polls().await;
        let b_outcome = task_b.await.unwrap().unwrap();
        assert!(matches!(b_outcome, AudioOutcome::Succeeded { .. }));
    }

    #[tokio::test]
    async fn not_found_within_grace_stays_polling() {
        let fake = Arc::new(FakeAudioService::new());
        let queue = Arc::new(AudioQueue::new(fake.clone()));

        let song = Uuid::new_v4();
        let submitted_at = Utc::now();

        let queue_for_task = queue.clone();
        let result_handle = tokio::spawn(async move {
            queue_for_task
                .resume_poll(song, "task-x".to_string(), submitted_at)
                .await
        });
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;

        fake.resolve("task-x", PollStatus::NotFound);
        queue.tick_polls().await;

        // Within grace: still polling, no resolution yet.
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        assert!(!result_handle.is_finished());

        fake.resolve("task-x", PollStatus::Succeeded { audio_path: "x.mp3".into() });
        queue.tick_polls().await;
        let outcome = result_handle.await.unwrap().unwrap();
        assert!(matches!(outcome, AudioOutcome::Succeeded { .. }));
    }
}

//! Bounded-concurrency priority admission queue for one kind of external
//! endpoint (the text LLM queue, the image queue) — §4.2.
//!
//! Grounded on this codebase's `job_queue.rs` (priority enum, worker-pool
//! admission, per-job status reporting), generalized from a Redis-backed
//! distributed queue to an in-process one: §5 frames these queues as
//! single-process admission control, so the durability and cross-process
//! visibility `job_queue.rs` buys with Redis has no counterpart here.

use std::collections::BinaryHeap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use tokio::sync::{oneshot, Mutex};
use uuid::Uuid;

use crate::error::AppError;
use crate::services::cancel::CancelSignal;

pub type BoxFuture<T> = Pin<Box<dyn Future<Output = Result<T, AppError>> + Send>>;

/// `{songId, priority, endpoint, execute(signal) -> Promise<T>}` from §4.2.
pub struct QueueRequest<T> {
    pub song_id: Uuid,
    pub priority: i64,
    pub endpoint: String,
    pub execute: Box<dyn FnOnce(CancelSignal) -> BoxFuture<T> + Send>,
}

#[derive(Debug, Clone)]
pub struct QueueResult<T> {
    pub result: T,
    pub processing_ms: u64,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct PendingDetail {
    pub song_id: Uuid,
    pub priority: i64,
    pub waiting_since: DateTime<Utc>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ActiveDetail {
    pub song_id: Uuid,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct QueueStatus {
    pub pending_count: usize,
    pub active_count: usize,
    pub max_concurrency: usize,
    pub last_error: Option<String>,
    pub pending: Vec<PendingDetail>,
    pub active: Vec<ActiveDetail>,
}

struct PendingEntry<T> {
    song_id: Uuid,
    priority: i64,
    seq: u64,
    waiting_since: DateTime<Utc>,
    execute: Option<Box<dyn FnOnce(CancelSignal) -> BoxFuture<T> + Send>>,
    endpoint: String,
    reply: oneshot::Sender<Result<QueueResult<T>, AppError>>,
}

// Min-heap on (priority, seq): lower priority value and earlier enqueue order run first.
impl<T> PartialEq for PendingEntry<T> {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}
impl<T> Eq for PendingEntry<T> {}
impl<T> PartialOrd for PendingEntry<T> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl<T> Ord for PendingEntry<T> {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // BinaryHeap is a max-heap; reverse so the lowest (priority, seq) pops first.
        (other.priority, other.seq).cmp(&(self.priority, self.seq))
    }
}

struct ActiveEntry {
    song_id: Uuid,
    started_at: DateTime<Utc>,
    cancel: CancelSignal,
}

struct Inner<T> {
    pending: BinaryHeap<PendingEntry<T>>,
    active: Vec<ActiveEntry>,
    max_concurrency: usize,
    last_error: Option<String>,
}

/// One queue per external endpoint kind. `T` is the adapter's success type
/// (`SongMetadata` for the text queue, cover bytes for the image queue).
pub struct EndpointQueue<T> {
    inner: Arc<Mutex<Inner<T>>>,
    seq: AtomicU64,
}

impl<T: Send + 'static> EndpointQueue<T> {
    pub fn new(max_concurrency: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                pending: BinaryHeap::new(),
                active: Vec::new(),
                max_concurrency,
                last_error: None,
            })),
            seq: AtomicU64::new(0),
        }
    }

    /// Submit a request; resolves with `Cancelled` if `cancel_song` is
    /// called before or during its execution.
    pub async fn enqueue(&self, request: QueueRequest<T>) -> Result<QueueResult<T>, AppError> {
        let (tx, rx) = oneshot::channel();
        let seq = self.seq.fetch_add(1, Ordering::SeqCst);

        {
            let mut inner = self.inner.lock().await;
            inner.pending.push(PendingEntry {
                song_id: request.song_id,
                priority: request.priority,
                seq,
                waiting_since: Utc::now(),
                execute: Some(request.execute),
                endpoint: request.endpoint,
                reply: tx,
            });
            admit(&self.inner, &mut inner);
        }

        rx.await.unwrap_or(Err(AppError::Cancelled))
    }

    /// Remove all pending entries for `song_id` (resolving `Cancelled`) and
    /// abort any running entry for it.
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

        for active in inner.active.iter().filter(|a| a.song_id == song_id) {
            active.cancel.abort();
        }
    }

    /// Runtime-adjustable concurrency (§4.2). Growing admits immediately;
    /// shrinking lets running tasks finish without new admissions.
    pub async fn refresh_concurrency(&self, n: usize) {
        let mut inner = self.inner.lock().await;
        inner.max_concurrency = n;
        admit(&self.inner, &mut inner);
    }

    /// Re-order pending entries after priority inputs change (e.g. a
    /// playlist's position moved), applying the same priority function the
    /// caller used at enqueue time.
    pub async fn resort_pending(&self, mut priority_fn: impl FnMut(Uuid, i64) -> i64) {
        let mut inner = self.inner.lock().await;
        let entries: Vec<_> = inner.pending.drain().collect();
        let mut reheaped = BinaryHeap::new();
        for mut entry in entries {
            entry.priority = priority_fn(entry.song_id, entry.priority);
            reheaped.push(entry);
        }
        inner.pending = reheaped;
    }

    pub async fn status(&self) -> QueueStatus {
        let inner = self.inner.lock().await;
        QueueStatus {
            pending_count: inner.pending.len(),
            active_count: inner.active.len(),
            max_concurrency: inner.max_concurrency,
            last_error: inner.last_error.clone(),
            pending: inner
                .pending
                .iter()
                .map(|e| PendingDetail {
                    song_id: e.song_id,
                    priority: e.priority,
                    waiting_since: e.waiting_since,
                })
                .collect(),
            active: inner
                .active
                .iter()
                .map(|a| ActiveDetail {
                    song_id: a.song_id,
                    started_at: a.started_at,
                })
                .collect(),
        }
    }
}

/// Pop and spawn as many pending entries as current concurrency allows.
/// Called with the lock already held; each spawned task re-acquires it on
/// completion to write its result back and admit the next pending entry.
fn admit<T: Send + 'static>(inner_arc: &Arc<Mutex<Inner<T>>>, inner: &mut Inner<T>) {
    while inner.active.len() < inner.max_concurrency {
        let Some(mut entry) = inner.pending.pop() else {
            break;
        };
        let Some(execute) = entry.execute.take() else {
            continue;
        };

        let cancel = CancelSignal::new();
        inner.active.push(ActiveEntry {
            song_id: entry.song_id,
            started_at: Utc::now(),
            cancel: cancel.clone(),
        });

        let inner_arc = inner_arc.clone();
        let song_id = entry.song_id;
        let reply = entry.reply;
        let endpoint = entry.endpoint;

        tokio::spawn(async move {
            let start = Instant::now();
            let outcome = execute(cancel).await;
            let processing_ms = start.elapsed().as_millis() as u64;

            {
                let mut inner = inner_arc.lock().await;
                inner.active.retain(|a| a.song_id != song_id);
                if let Err(ref e) = outcome {
                    inner.last_error = Some(format!("{endpoint}: {e}"));
                }
                admit(&inner_arc, &mut inner);
            }

            let result = outcome.map(|result| QueueResult {
                result,
                processing_ms,
            });
            let _ = reply.send(result);
        });
    }
}

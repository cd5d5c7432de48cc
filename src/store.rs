//! Task store
//!
//! Persistence seam for task status and results. Realtime requests never
//! touch the store; their results go straight back to the waiting caller.
//!
//! Records carry a `revision` assigned under the scheduler lock. Writes are
//! issued outside the lock and may arrive out of order, so implementations
//! must drop a write whose revision is not newer than the stored one.
//!
//! ## Layout
//!
//! ```json
//! {
//!   "task_id": "6f0c...",
//!   "tenant_id": "tenant-a",
//!   "state": "completed",
//!   "attempts": 1,
//!   "submitted_at": "2026-01-01T00:00:00Z",
//!   "updated_at": "2026-01-01T00:00:05Z",
//!   "result_ref": "result/6f0c...",
//!   "revision": 4
//! }
//! ```
//!
//! Unknown fields are ignored when reading.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::request::{RequestId, RequestState, TenantId};
use crate::ErrorKind;

/// Terminal error attached to a failed task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskError {
    /// Error kind of the last failure.
    pub kind: ErrorKind,
    /// Human-readable description.
    pub message: String,
}

/// Persisted status of a task request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRecord {
    /// Task identifier handed to the caller at admission.
    pub task_id: RequestId,
    /// Owning tenant.
    pub tenant_id: TenantId,
    /// Lifecycle state at `updated_at`.
    pub state: RequestState,
    /// Interrupted attempts so far.
    pub attempts: u32,
    /// Admission time.
    pub submitted_at: DateTime<Utc>,
    /// Time of this write.
    pub updated_at: DateTime<Utc>,
    /// Where the output is stored, once completed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_ref: Option<String>,
    /// Terminal error, once failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<TaskError>,
    /// Monotonic per-task write sequence.
    pub revision: u64,
}

/// Store error types
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Backend unreachable or failed.
    #[error("task store backend error: {0}")]
    Backend(String),

    /// Stored data could not be encoded or decoded.
    #[error("task store serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Durable storage for task status and output.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Persist `record` unless a record with the same or newer revision exists.
    async fn save_task_status(&self, record: TaskRecord) -> Result<(), StoreError>;

    /// Load the latest record for `task_id`.
    async fn load_task_status(&self, task_id: RequestId) -> Result<Option<TaskRecord>, StoreError>;

    /// Persist task output and return a reference to it.
    async fn save_task_result(&self, task_id: RequestId, output: String) -> Result<String, StoreError>;

    /// Load output previously saved under `result_ref`.
    async fn load_task_result(&self, result_ref: &str) -> Result<Option<String>, StoreError>;
}

/// How long [`InMemoryTaskStore::new`] keeps terminal records.
pub const DEFAULT_TERMINAL_RETENTION: Duration = Duration::from_secs(3600);

/// Process-local [`TaskStore`] backed by concurrent maps.
///
/// Records are kept as serialized JSON so that reads go through the same
/// decoding path a remote store would. Completed and failed tasks are
/// evicted, together with their output, once `retention` has passed since
/// the terminal write. Eviction runs lazily on writes and on
/// [`purge_expired`](Self::purge_expired).
#[derive(Debug)]
pub struct InMemoryTaskStore {
    statuses: DashMap<RequestId, (u64, String)>,
    results: DashMap<String, String>,
    retention: Duration,
    // terminal writes in arrival order
    terminal: Mutex<VecDeque<(Instant, RequestId, Option<String>)>>,
}

impl Default for InMemoryTaskStore {
    fn default() -> Self {
        Self::with_retention(DEFAULT_TERMINAL_RETENTION)
    }
}

impl InMemoryTaskStore {
    /// Create an empty store with [`DEFAULT_TERMINAL_RETENTION`].
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty store that keeps terminal records for `retention`.
    pub fn with_retention(retention: Duration) -> Self {
        Self {
            statuses: DashMap::new(),
            results: DashMap::new(),
            retention,
            terminal: Mutex::new(VecDeque::new()),
        }
    }

    /// Evict terminal records older than the retention window.
    ///
    /// Returns the number of tasks removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut expired = Vec::new();
        {
            let mut terminal = self.terminal.lock();
            while let Some((at, _, _)) = terminal.front() {
                if now.saturating_duration_since(*at) < self.retention {
                    break;
                }
                if let Some((_, id, result_ref)) = terminal.pop_front() {
                    expired.push((id, result_ref));
                }
            }
        }
        for (id, result_ref) in &expired {
            self.statuses.remove(id);
            if let Some(r) = result_ref {
                self.results.remove(r);
            }
        }
        if !expired.is_empty() {
            debug!(evicted = expired.len(), "expired terminal task records evicted");
        }
        expired.len()
    }

    /// Number of tasks with a stored status.
    pub fn len(&self) -> usize {
        self.statuses.len()
    }

    /// Check if no task status is stored.
    pub fn is_empty(&self) -> bool {
        self.statuses.is_empty()
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn save_task_status(&self, record: TaskRecord) -> Result<(), StoreError> {
        self.purge_expired();
        let encoded = serde_json::to_string(&record)?;
        {
            let mut entry = self
                .statuses
                .entry(record.task_id)
                .or_insert_with(|| (0, String::new()));
            let (stored_rev, stored) = entry.value_mut();
            if !stored.is_empty() && *stored_rev >= record.revision {
                debug!(
                    task_id = %record.task_id,
                    revision = record.revision,
                    stored_revision = *stored_rev,
                    "stale task status write ignored"
                );
                return Ok(());
            }
            *stored_rev = record.revision;
            *stored = encoded;
        }
        if record.state.is_terminal() {
            self.terminal
                .lock()
                .push_back((Instant::now(), record.task_id, record.result_ref));
        }
        Ok(())
    }

    async fn load_task_status(&self, task_id: RequestId) -> Result<Option<TaskRecord>, StoreError> {
        // Clone out before decoding so no shard guard is held.
        let raw = self.statuses.get(&task_id).map(|e| e.value().1.clone());
        match raw {
            Some(json) if !json.is_empty() => Ok(Some(serde_json::from_str(&json)?)),
            _ => Ok(None),
        }
    }

    async fn save_task_result(&self, task_id: RequestId, output: String) -> Result<String, StoreError> {
        let result_ref = format!("result/{task_id}");
        self.results.insert(result_ref.clone(), output);
        Ok(result_ref)
    }

    async fn load_task_result(&self, result_ref: &str) -> Result<Option<String>, StoreError> {
        Ok(self.results.get(result_ref).map(|e| e.value().clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: RequestId, state: RequestState, revision: u64) -> TaskRecord {
        let now = Utc::now();
        TaskRecord {
            task_id: id,
            tenant_id: TenantId::new("t"),
            state,
            attempts: 0,
            submitted_at: now,
            updated_at: now,
            result_ref: None,
            error: None,
            revision,
        }
    }

    #[tokio::test]
    async fn test_save_and_load_status() {
        let store = InMemoryTaskStore::new();
        let id = RequestId::new();
        store
            .save_task_status(record(id, RequestState::Queued, 1))
            .await
            .expect("test: save");
        let loaded = store.load_task_status(id).await.expect("test: load");
        assert_eq!(loaded.map(|r| r.state), Some(RequestState::Queued));
    }

    #[tokio::test]
    async fn test_stale_revision_is_ignored() {
        let store = InMemoryTaskStore::new();
        let id = RequestId::new();
        store
            .save_task_status(record(id, RequestState::Completed, 5))
            .await
            .expect("test: save");
        store
            .save_task_status(record(id, RequestState::Running, 3))
            .await
            .expect("test: save");
        let loaded = store.load_task_status(id).await.expect("test: load");
        assert_eq!(loaded.map(|r| r.state), Some(RequestState::Completed));
    }

    #[tokio::test]
    async fn test_terminal_records_expire_with_their_output() {
        let store = InMemoryTaskStore::with_retention(Duration::ZERO);
        let done = RequestId::new();
        let result_ref = store
            .save_task_result(done, "output".into())
            .await
            .expect("test: save result");
        let mut rec = record(done, RequestState::Completed, 3);
        rec.result_ref = Some(result_ref.clone());
        store.save_task_status(rec).await.expect("test: save");

        let queued = RequestId::new();
        store
            .save_task_status(record(queued, RequestState::Queued, 1))
            .await
            .expect("test: save");

        assert!(store.load_task_status(done).await.expect("test: load").is_none());
        assert!(store.load_task_result(&result_ref).await.expect("test: load").is_none());
        assert_eq!(store.purge_expired(), 0);
        assert!(store.load_task_status(queued).await.expect("test: load").is_some());
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_terminal_records_kept_within_retention() {
        let store = InMemoryTaskStore::new();
        let id = RequestId::new();
        store
            .save_task_status(record(id, RequestState::Failed, 2))
            .await
            .expect("test: save");
        assert_eq!(store.purge_expired(), 0);
        assert!(store.load_task_status(id).await.expect("test: load").is_some());
    }

    #[tokio::test]
    async fn test_missing_task_loads_none() {
        let store = InMemoryTaskStore::new();
        let loaded = store.load_task_status(RequestId::new()).await.expect("test: load");
        assert!(loaded.is_none());
    }

    #[tokio::test]
    async fn test_result_round_trip_via_reference() {
        let store = InMemoryTaskStore::new();
        let id = RequestId::new();
        let r = store
            .save_task_result(id, "output".into())
            .await
            .expect("test: save");
        assert!(r.contains(&id.to_string()));
        let out = store.load_task_result(&r).await.expect("test: load");
        assert_eq!(out.as_deref(), Some("output"));
    }

    #[test]
    fn test_record_reader_ignores_unknown_fields() {
        let id = RequestId::new();
        let json = format!(
            r#"{{"task_id":"{id}","tenant_id":"t","state":"failed","attempts":4,
            "submitted_at":"2026-01-01T00:00:00Z","updated_at":"2026-01-01T00:00:01Z",
            "error":{{"kind":"provider_permanent","message":"bad key"}},
            "revision":9,"shard":"eu-1"}}"#
        );
        let rec: TaskRecord = serde_json::from_str(&json).expect("test: parse");
        assert_eq!(rec.state, RequestState::Failed);
        assert_eq!(rec.attempts, 4);
        assert_eq!(rec.error.map(|e| e.kind), Some(ErrorKind::ProviderPermanent));
    }
}

//! # Hybrid Scheduler
//!
//! ## Responsibility
//! Async facade over [`SchedulerState`]: admission entry points, spawning
//! provider calls, persisting task records, the controller ticker and
//! graceful shutdown.
//!
//! ## Guarantees
//! - The state lock is taken once per operation and never held across `.await`
//! - Every dispatch runs in its own Tokio task; its completion is the only
//!   path that releases the slot
//! - Realtime callers always receive a terminal result (or `ShuttingDown`)
//!
//! ## NOT Responsible For
//! - Scheduling decisions (that belongs to `dispatcher`)
//! - Authentication or rate limiting of callers

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, oneshot, Notify};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::classifier::classify;
use crate::config::loader::join_errors;
use crate::config::validation::validate;
use crate::config::SchedulerConfig;
use crate::dispatcher::{Dispatch, Effects, SchedulerSnapshot, SchedulerState, StatusWrite};
use crate::provider::{self, ProviderInvoker};
use crate::request::{
    InvocationPayload, RawRequest, Request, RequestClass, RequestId, RequestState, TenantId,
};
use crate::store::{InMemoryTaskStore, TaskError, TaskRecord, TaskStore};
use crate::{ErrorKind, SchedulerError};

/// Result of [`HybridScheduler::submit`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Submission {
    /// Realtime request finished; provider output.
    Completed(String),
    /// Task request admitted; poll with this id.
    Accepted(RequestId),
}

struct Inner {
    state: Mutex<SchedulerState>,
    invoker: Arc<dyn ProviderInvoker>,
    store: Arc<dyn TaskStore>,
    drained: Notify,
    shutdown: CancellationToken,
    tick_interval: Duration,
}

/// Shared handle to a running scheduler. Cloning is cheap.
///
/// # Example
///
/// ```no_run
/// use hybrid_scheduler::config::SchedulerConfig;
/// use hybrid_scheduler::request::{InvocationPayload, TenantId};
/// use hybrid_scheduler::HybridScheduler;
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), hybrid_scheduler::SchedulerError> {
/// let scheduler = HybridScheduler::from_config(SchedulerConfig::default())?;
/// let _ticker = scheduler.spawn_ticker();
///
/// let tenant = TenantId::new("tenant-a");
/// let text = scheduler
///     .submit_realtime(tenant.clone(), InvocationPayload::new("echo", "hi"))
///     .await?;
/// let task_id = scheduler
///     .submit_task(tenant, InvocationPayload::new("echo", "summarise"))
///     .await?;
/// println!("{text} / {}", scheduler.get_status(task_id).await?.state);
///
/// scheduler.shutdown().await;
/// # Ok(()) }
/// ```
#[derive(Clone)]
pub struct HybridScheduler {
    inner: Arc<Inner>,
}

impl HybridScheduler {
    /// Create a scheduler. Must be called inside a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::Config`] if `config` fails validation.
    pub fn new(
        config: SchedulerConfig,
        invoker: Arc<dyn ProviderInvoker>,
        store: Arc<dyn TaskStore>,
    ) -> Result<Self, SchedulerError> {
        validate(&config).map_err(|errors| SchedulerError::Config(join_errors(errors).to_string()))?;
        info!(
            total = config.capacity.total,
            reserve = config.capacity.reserve,
            task_floor = config.capacity.task_floor,
            policy = config.preemption.policy.as_str(),
            provider = invoker.name(),
            "scheduler starting"
        );
        Ok(Self {
            inner: Arc::new(Inner {
                state: Mutex::new(SchedulerState::new(&config, Instant::now())),
                invoker,
                store,
                drained: Notify::new(),
                shutdown: CancellationToken::new(),
                tick_interval: Duration::from_millis(config.controller.tick_interval_ms),
            }),
        })
    }

    /// Create a scheduler with the configured provider and an in-memory task store.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::Config`] if validation fails or the
    /// provider's API key is missing.
    pub fn from_config(config: SchedulerConfig) -> Result<Self, SchedulerError> {
        let invoker = provider::from_config(&config.provider)?;
        Self::new(config, invoker, Arc::new(InMemoryTaskStore::new()))
    }

    /// Classify and submit a raw request.
    ///
    /// Realtime requests resolve once the provider call is terminal; task
    /// requests resolve right after admission.
    ///
    /// # Errors
    ///
    /// - [`SchedulerError::InvalidRequest`] for a missing or unknown request type
    /// - [`SchedulerError::Overloaded`] when the class queue is full
    /// - For realtime, any terminal failure of the call
    pub async fn submit(&self, raw: RawRequest) -> Result<Submission, SchedulerError> {
        let request = classify(raw)?;
        match request.class() {
            RequestClass::Realtime => self.run_realtime(request).await.map(Submission::Completed),
            RequestClass::Task => self.admit_task(request).await.map(Submission::Accepted),
        }
    }

    /// Submit a realtime request and wait for its output.
    ///
    /// # Errors
    ///
    /// See [`submit`](Self::submit).
    pub async fn submit_realtime(
        &self,
        tenant_id: TenantId,
        payload: InvocationPayload,
    ) -> Result<String, SchedulerError> {
        self.run_realtime(Request::new(tenant_id, RequestClass::Realtime, payload))
            .await
    }

    /// Submit a task request and return its id once admitted.
    ///
    /// # Errors
    ///
    /// See [`submit`](Self::submit).
    pub async fn submit_task(
        &self,
        tenant_id: TenantId,
        payload: InvocationPayload,
    ) -> Result<RequestId, SchedulerError> {
        self.admit_task(Request::new(tenant_id, RequestClass::Task, payload))
            .await
    }

    async fn run_realtime(&self, request: Request) -> Result<String, SchedulerError> {
        let (tx, rx) = oneshot::channel();
        let effects = {
            let mut state = self.inner.state.lock();
            state.admit(request, Some(tx), Instant::now())?
        };
        self.execute(effects).await;
        rx.await.unwrap_or_else(|_| {
            Err(SchedulerError::Internal(
                "realtime request dropped without a result".to_string(),
            ))
        })
    }

    async fn admit_task(&self, request: Request) -> Result<RequestId, SchedulerError> {
        let id = request.id();
        let effects = {
            let mut state = self.inner.state.lock();
            state.admit(request, None, Instant::now())?
        };
        self.execute(effects).await;
        Ok(id)
    }

    /// Latest persisted status of a task.
    ///
    /// # Errors
    ///
    /// - [`SchedulerError::TaskNotFound`] if no record exists
    /// - [`SchedulerError::Store`] if the store fails
    pub async fn get_status(&self, task_id: RequestId) -> Result<TaskRecord, SchedulerError> {
        self.inner
            .store
            .load_task_status(task_id)
            .await?
            .ok_or(SchedulerError::TaskNotFound(task_id))
    }

    /// Output of a completed task, `None` until it completes.
    ///
    /// # Errors
    ///
    /// Same as [`get_status`](Self::get_status).
    pub async fn get_result(&self, task_id: RequestId) -> Result<Option<String>, SchedulerError> {
        let record = self.get_status(task_id).await?;
        match (record.state, record.result_ref) {
            (RequestState::Completed, Some(result_ref)) => {
                Ok(self.inner.store.load_task_result(&result_ref).await?)
            }
            _ => Ok(None),
        }
    }

    /// Current counters, gauges and controller state.
    pub fn metrics_snapshot(&self) -> SchedulerSnapshot {
        self.inner.state.lock().snapshot()
    }

    /// Queued request ids of `class`, front first.
    pub fn queued(&self, class: RequestClass) -> Vec<RequestId> {
        self.inner.state.lock().queued_ids(class)
    }

    /// State and attempt count of a live (non-terminal) request.
    pub fn request_state(&self, id: RequestId) -> Option<(RequestState, u32)> {
        self.inner.state.lock().state_of(id)
    }

    /// Run one controller evaluation now.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::Internal`] if the scheduler is poisoned.
    pub async fn tick(&self) -> Result<(), SchedulerError> {
        let effects = self.inner.state.lock().tick(Instant::now())?;
        self.execute(effects).await;
        Ok(())
    }

    /// Spawn the periodic controller tick. Stops on [`shutdown`](Self::shutdown)
    /// or when the scheduler is poisoned.
    pub fn spawn_ticker(&self) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(this.inner.tick_interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = this.inner.shutdown.cancelled() => break,
                    _ = interval.tick() => {}
                }
                if let Err(e) = this.tick().await {
                    error!(error = %e, "controller tick failed, ticker stopping");
                    break;
                }
            }
            debug!("controller ticker stopped");
        })
    }

    /// Hot-apply controller, queue and retry parameters.
    ///
    /// `capacity.total` cannot change while running.
    ///
    /// # Errors
    ///
    /// - [`SchedulerError::Config`] if `config` fails validation
    /// - [`SchedulerError::Internal`] if the scheduler is poisoned
    pub async fn apply_tuning(&self, config: &SchedulerConfig) -> Result<(), SchedulerError> {
        validate(config).map_err(|errors| SchedulerError::Config(join_errors(errors).to_string()))?;
        let effects = self
            .inner
            .state
            .lock()
            .apply_tuning(config, Instant::now())?;
        self.execute(effects).await;
        Ok(())
    }

    /// Apply every config broadcast by a
    /// [`ConfigWatcher`](crate::config::watcher::ConfigWatcher) until shutdown.
    pub fn watch_config(&self, mut updates: broadcast::Receiver<SchedulerConfig>) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            loop {
                let update = tokio::select! {
                    _ = this.inner.shutdown.cancelled() => break,
                    update = updates.recv() => update,
                };
                match update {
                    Ok(config) => {
                        if let Err(e) = this.apply_tuning(&config).await {
                            warn!(error = %e, "config reload not applied");
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "config updates lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    /// Stop admission, fail queued realtime callers with `ShuttingDown`,
    /// stop the ticker and wait for in-flight calls to finish.
    ///
    /// Queued tasks stay persisted as `Queued`.
    pub async fn shutdown(&self) {
        let effects = self.inner.state.lock().begin_shutdown();
        self.inner.shutdown.cancel();
        self.execute(effects).await;

        loop {
            let notified = self.inner.drained.notified();
            if self.inner.state.lock().is_drained() {
                break;
            }
            notified.await;
        }
        info!("scheduler drained");
    }

    async fn execute(&self, effects: Effects) {
        for reply in effects.replies {
            // the caller may have gone away
            let _ = reply.waiter.send(reply.result);
        }
        self.spawn_dispatches(effects.dispatches);
        self.persist(effects.records).await;
    }

    fn spawn_dispatches(&self, dispatches: Vec<Dispatch>) {
        for dispatch in dispatches {
            debug!(
                request_id = %dispatch.id,
                class = %dispatch.class,
                seq = dispatch.seq,
                "dispatching"
            );
            tokio::spawn(self.clone().run_dispatch(dispatch));
        }
    }

    async fn run_dispatch(self, dispatch: Dispatch) {
        let started = self.inner.state.lock().mark_running(dispatch.id, dispatch.seq);
        match started {
            Ok(effects) => self.execute(effects).await,
            Err(e) => {
                error!(request_id = %dispatch.id, error = %e, "dispatch lost before start");
                if self.inner.state.lock().is_drained() {
                    self.inner.drained.notify_waiters();
                }
                return;
            }
        }

        let outcome = self
            .inner
            .invoker
            .invoke(&dispatch.payload, dispatch.cancel.clone())
            .await;

        let (completed, drained) = {
            let mut state = self.inner.state.lock();
            let completed = state.complete(dispatch.id, dispatch.seq, outcome, Instant::now());
            (completed, state.is_drained())
        };
        match completed {
            Ok(effects) => self.execute(effects).await,
            Err(e) => error!(request_id = %dispatch.id, error = %e, "completion failed"),
        }
        if drained {
            self.inner.drained.notify_waiters();
        }
    }

    async fn persist(&self, records: Vec<StatusWrite>) {
        for StatusWrite { mut record, output } in records {
            if let Some(output) = output {
                match self.inner.store.save_task_result(record.task_id, output).await {
                    Ok(result_ref) => record.result_ref = Some(result_ref),
                    Err(e) => {
                        error!(task_id = %record.task_id, error = %e, "failed to store task result");
                        record.error = Some(TaskError {
                            kind: ErrorKind::Store,
                            message: e.to_string(),
                        });
                    }
                }
            }
            if let Err(e) = self.inner.store.save_task_status(record.clone()).await {
                error!(
                    task_id = %record.task_id,
                    state = %record.state,
                    revision = record.revision,
                    error = %e,
                    "failed to persist task status"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{EchoProvider, InvocationOutcome};

    fn scheduler(config: SchedulerConfig) -> HybridScheduler {
        HybridScheduler::new(
            config,
            Arc::new(EchoProvider::with_delay(Duration::from_millis(5))),
            Arc::new(InMemoryTaskStore::new()),
        )
        .expect("test: scheduler")
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected() {
        let mut config = SchedulerConfig::default();
        config.capacity.total = 0;
        let result = HybridScheduler::new(
            config,
            Arc::new(EchoProvider::new()),
            Arc::new(InMemoryTaskStore::new()),
        );
        assert!(matches!(result, Err(SchedulerError::Config(_))));
    }

    #[tokio::test]
    async fn test_submit_realtime_echoes_prompt() {
        let s = scheduler(SchedulerConfig::default());
        let out = s
            .submit_realtime(TenantId::new("t"), InvocationPayload::new("m", "ping"))
            .await
            .expect("test: realtime");
        assert_eq!(out, "ping");
    }

    #[tokio::test]
    async fn test_submit_classifies_raw_requests() {
        let s = scheduler(SchedulerConfig::default());
        let raw = RawRequest {
            tenant_id: TenantId::new("t"),
            request_type: Some(" Task ".into()),
            payload: InvocationPayload::new("m", "batch"),
        };
        let submission = s.submit(raw).await.expect("test: submit");
        assert!(matches!(submission, Submission::Accepted(_)));

        let raw = RawRequest {
            tenant_id: TenantId::new("t"),
            request_type: None,
            payload: InvocationPayload::new("m", "x"),
        };
        assert!(matches!(
            s.submit(raw).await,
            Err(SchedulerError::InvalidRequest(_))
        ));
    }

    #[tokio::test]
    async fn test_task_status_and_result_after_completion() {
        let s = scheduler(SchedulerConfig::default());
        let id = s
            .submit_task(TenantId::new("t"), InvocationPayload::new("m", "work"))
            .await
            .expect("test: submit");
        let status = s.get_status(id).await.expect("test: status");
        assert_eq!(status.task_id, id);

        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let status = s.get_status(id).await.expect("test: status");
            if status.state == RequestState::Completed {
                break;
            }
            assert!(Instant::now() < deadline, "task did not complete");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(s.get_result(id).await.expect("test: result").as_deref(), Some("work"));
    }

    #[tokio::test]
    async fn test_unknown_task_is_not_found() {
        let s = scheduler(SchedulerConfig::default());
        let id = RequestId::new();
        assert!(matches!(
            s.get_status(id).await,
            Err(SchedulerError::TaskNotFound(missing)) if missing == id
        ));
    }

    #[tokio::test]
    async fn test_shutdown_rejects_new_work() {
        let s = scheduler(SchedulerConfig::default());
        s.shutdown().await;
        let err = s
            .submit_task(TenantId::new("t"), InvocationPayload::new("m", "late"))
            .await
            .unwrap_err();
        assert!(matches!(err, SchedulerError::ShuttingDown));
    }

    #[tokio::test]
    async fn test_shutdown_returns_when_state_is_poisoned() {
        let s = HybridScheduler::new(
            SchedulerConfig::default(),
            Arc::new(EchoProvider::with_delay(Duration::from_secs(30))),
            Arc::new(InMemoryTaskStore::new()),
        )
        .expect("test: scheduler");
        s.submit_task(TenantId::new("t"), InvocationPayload::new("m", "stuck"))
            .await
            .expect("test: submit");
        assert_eq!(s.metrics_snapshot().task_active, 1);

        let poisoned = s.inner.state.lock().complete(
            RequestId::new(),
            0,
            InvocationOutcome::Cancelled,
            Instant::now(),
        );
        assert!(matches!(poisoned, Err(SchedulerError::Internal(_))));

        tokio::time::timeout(Duration::from_secs(1), s.shutdown())
            .await
            .expect("test: shutdown must not hang on a poisoned state");
    }

    #[tokio::test]
    async fn test_apply_tuning_rejects_invalid_config() {
        let s = scheduler(SchedulerConfig::default());
        let mut bad = SchedulerConfig::default();
        bad.controller.ewma_alpha = 0.0;
        assert!(matches!(
            s.apply_tuning(&bad).await,
            Err(SchedulerError::Config(_))
        ));
    }
}

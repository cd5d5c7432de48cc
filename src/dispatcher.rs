//! # Dispatcher
//!
//! ## Responsibility
//! Own every piece of mutable scheduling state (pool, controller, both
//! queues and the live-request table) and make the scheduling decision.
//!
//! Every operation here is synchronous and runs under the scheduler's single
//! lock. Anything that must happen outside the lock (spawning provider calls,
//! persisting task records, answering realtime callers) is returned as
//! [`Effects`] for the async facade to execute.
//!
//! ## Decision
//! Repeated until no progress:
//! 1. free slot and realtime queued: dispatch the oldest realtime request
//! 2. realtime queue empty, free slot, `task_active < task_ceiling`: dispatch the oldest task
//! 3. stop
//!
//! ## Guarantees
//! - `realtime_active + task_active <= total` after every operation
//! - No dispatch raises `task_active` above `task_ceiling`
//! - A live request is in exactly one queue or holds exactly one slot
//! - Accounting corruption poisons the state; every later operation fails
//!   with [`SchedulerError::Internal`]

use chrono::Utc;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::capacity::CapacityPool;
use crate::config::SchedulerConfig;
use crate::controller::{ConcurrencyController, ControllerEvent, ControllerSettings, LoadSignals};
use crate::metrics;
use crate::preemption::{
    hard_preemption_quota, select_victims, PreemptionInputs, PreemptionPolicy, VictimCandidate,
};
use crate::provider::{InvocationOutcome, ProviderErrorKind};
use crate::queue::{ClassQueue, QueueError};
use crate::request::{InvocationPayload, Request, RequestClass, RequestId, RequestState};
use crate::store::{TaskError, TaskRecord};
use crate::{ErrorKind, SchedulerError};

/// Channel a blocked realtime caller waits on.
pub type Waiter = oneshot::Sender<Result<String, SchedulerError>>;

/// A provider call to spawn.
#[derive(Debug)]
pub struct Dispatch {
    /// Request being dispatched.
    pub id: RequestId,
    /// Its class.
    pub class: RequestClass,
    /// Provider payload.
    pub payload: Arc<InvocationPayload>,
    /// Token cancelled on hard preemption.
    pub cancel: CancellationToken,
    /// Identifies this dispatch when completing.
    pub seq: u64,
}

/// A task record to persist, with the output to store first when completed.
#[derive(Debug)]
pub struct StatusWrite {
    /// Record to save.
    pub record: TaskRecord,
    /// Output to save via `save_task_result` before the record.
    pub output: Option<String>,
}

/// A terminal answer for a blocked realtime caller.
#[derive(Debug)]
pub struct Reply {
    /// Caller's channel.
    pub waiter: Waiter,
    /// Result to deliver.
    pub result: Result<String, SchedulerError>,
}

/// Work produced under the lock, executed after it is released.
#[derive(Debug, Default)]
pub struct Effects {
    /// Provider calls to spawn.
    pub dispatches: Vec<Dispatch>,
    /// Task records to persist, in revision order.
    pub records: Vec<StatusWrite>,
    /// Realtime callers to answer.
    pub replies: Vec<Reply>,
}

impl Effects {
    /// Returns `true` if there is nothing to execute.
    pub fn is_empty(&self) -> bool {
        self.dispatches.is_empty() && self.records.is_empty() && self.replies.is_empty()
    }
}

/// Point-in-time view of the scheduler.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SchedulerSnapshot {
    /// Configured concurrency.
    pub total: usize,
    /// Realtime requests holding a slot.
    pub realtime_active: usize,
    /// Task requests holding a slot.
    pub task_active: usize,
    /// Current task ceiling.
    pub task_ceiling: usize,
    /// Realtime requests waiting.
    pub realtime_queue_depth: usize,
    /// Task requests waiting.
    pub task_queue_depth: usize,
    /// Smoothed realtime dispatch latency in milliseconds.
    pub ewma_latency_ms: Option<f64>,
    /// Whether the latency-triggered shedding state is active.
    pub shedding: bool,
    /// Hard preemptions requested but not yet acknowledged.
    pub pending_preemptions: usize,
    /// Requests that completed successfully.
    pub completed: u64,
    /// Requests that ended in `Failed`.
    pub failed: u64,
    /// Acknowledged hard preemptions.
    pub preempted: u64,
    /// Admissions refused with `Overloaded`.
    pub rejected: u64,
}

#[derive(Debug)]
struct Entry {
    request: Request,
    waiter: Option<Waiter>,
    cancel: CancellationToken,
    dispatched_at: Option<Instant>,
    dispatch_seq: u64,
    preempting: bool,
    revision: u64,
}

impl Entry {
    fn transition(&mut self, next: RequestState) -> Result<(), SchedulerError> {
        let current = self.request.state;
        if !current.can_transition_to(next) {
            return Err(SchedulerError::Internal(format!(
                "illegal transition {current} -> {next} for request {}",
                self.request.id()
            )));
        }
        self.request.state = next;
        debug!(
            request_id = %self.request.id(),
            tenant_id = %self.request.tenant_id().as_str(),
            class = %self.request.class(),
            state = %next,
            attempts = self.request.attempts(),
            "request state changed"
        );
        Ok(())
    }

    fn status_write(&mut self, error: Option<TaskError>, output: Option<String>) -> StatusWrite {
        self.revision += 1;
        StatusWrite {
            record: TaskRecord {
                task_id: self.request.id(),
                tenant_id: self.request.tenant_id().clone(),
                state: self.request.state,
                attempts: self.request.attempts(),
                submitted_at: self.request.submitted_wall(),
                updated_at: Utc::now(),
                result_ref: None,
                error,
                revision: self.revision,
            },
            output,
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    completed: u64,
    failed: u64,
    preempted: u64,
    rejected: u64,
}

/// All mutable scheduling state. Callers hold the scheduler lock.
#[derive(Debug)]
pub struct SchedulerState {
    pool: CapacityPool,
    controller: ConcurrencyController,
    realtime: ClassQueue,
    tasks: ClassQueue,
    entries: HashMap<RequestId, Entry>,
    policy: PreemptionPolicy,
    retry_bound: u32,
    pending_preemptions: usize,
    next_dispatch_seq: u64,
    counters: Counters,
    accepting: bool,
    poisoned: Option<String>,
}

impl SchedulerState {
    /// Build fresh state from a validated configuration.
    pub fn new(config: &SchedulerConfig, now: Instant) -> Self {
        let controller = ConcurrencyController::new(ControllerSettings::from(config), now);
        let pool = CapacityPool::new(config.capacity.total, controller.task_ceiling());
        metrics::set_task_ceiling(pool.task_ceiling());
        Self {
            pool,
            controller,
            realtime: ClassQueue::new(RequestClass::Realtime, config.queues.realtime_max_depth),
            tasks: ClassQueue::new(RequestClass::Task, config.queues.task_max_depth),
            entries: HashMap::new(),
            policy: config.preemption.policy,
            retry_bound: config.preemption.retry_bound,
            pending_preemptions: 0,
            next_dispatch_seq: 0,
            counters: Counters::default(),
            accepting: true,
            poisoned: None,
        }
    }

    /// Admit a classified request and run the decision.
    ///
    /// `waiter` must be `Some` for realtime requests.
    ///
    /// # Errors
    ///
    /// - [`SchedulerError::Overloaded`] if the class queue is full
    /// - [`SchedulerError::ShuttingDown`] after [`begin_shutdown`](Self::begin_shutdown)
    /// - [`SchedulerError::Internal`] if the state is poisoned
    pub fn admit(
        &mut self,
        mut request: Request,
        waiter: Option<Waiter>,
        now: Instant,
    ) -> Result<Effects, SchedulerError> {
        self.ensure_healthy()?;
        if !self.accepting {
            return Err(SchedulerError::ShuttingDown);
        }
        let id = request.id();
        let class = request.class();
        let queue = match class {
            RequestClass::Realtime => &mut self.realtime,
            RequestClass::Task => &mut self.tasks,
        };
        if let Err(QueueError::QueueFull { depth, .. }) = queue.push_back(id) {
            request.reject();
            self.counters.rejected += 1;
            metrics::inc_rejected(class.as_str(), "queue_full");
            warn!(
                request_id = %id,
                tenant_id = %request.tenant_id().as_str(),
                class = %class,
                state = %request.state,
                depth,
                "admission rejected, queue full"
            );
            return Err(SchedulerError::Overloaded { class });
        }

        info!(
            request_id = %id,
            tenant_id = %request.tenant_id().as_str(),
            class = %class,
            "request admitted"
        );
        metrics::inc_admitted(class.as_str());

        let mut effects = Effects::default();
        let mut entry = Entry {
            request,
            waiter,
            cancel: CancellationToken::new(),
            dispatched_at: None,
            dispatch_seq: 0,
            preempting: false,
            revision: 0,
        };
        if class == RequestClass::Task {
            effects.records.push(entry.status_write(None, None));
        }
        self.entries.insert(id, entry);

        let result = self.reschedule(now, false, &mut effects);
        self.guard(result)?;
        Ok(effects)
    }

    /// Record that the provider call for dispatch `seq` has started.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::Internal`] if the dispatch is unknown.
    pub fn mark_running(&mut self, id: RequestId, seq: u64) -> Result<Effects, SchedulerError> {
        self.ensure_healthy()?;
        let result = self.mark_running_inner(id, seq);
        self.guard(result)
    }

    fn mark_running_inner(&mut self, id: RequestId, seq: u64) -> Result<Effects, SchedulerError> {
        let entry = self.live_dispatch(id, seq)?;
        entry.transition(RequestState::Running)?;
        let mut effects = Effects::default();
        if entry.request.class() == RequestClass::Task {
            effects.records.push(entry.status_write(None, None));
        }
        Ok(effects)
    }

    /// Handle the outcome of dispatch `seq`, release its slot and run the decision.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::Internal`] on missing bookkeeping or a
    /// counter underflow; the state is poisoned.
    pub fn complete(
        &mut self,
        id: RequestId,
        seq: u64,
        outcome: InvocationOutcome,
        now: Instant,
    ) -> Result<Effects, SchedulerError> {
        self.ensure_healthy()?;
        let mut effects = Effects::default();
        let result = self
            .complete_inner(id, seq, outcome, now, &mut effects)
            .and_then(|()| self.reschedule(now, false, &mut effects));
        self.guard(result)?;
        Ok(effects)
    }

    fn complete_inner(
        &mut self,
        id: RequestId,
        seq: u64,
        outcome: InvocationOutcome,
        now: Instant,
        effects: &mut Effects,
    ) -> Result<(), SchedulerError> {
        let retry_bound = self.retry_bound;
        let entry = self.live_dispatch(id, seq)?;
        let class = entry.request.class();
        let was_preempting = std::mem::take(&mut entry.preempting);
        let latency = entry
            .dispatched_at
            .take()
            .map(|t| now.saturating_duration_since(t))
            .unwrap_or(Duration::ZERO);

        self.pool.release(class)?;
        if was_preempting {
            self.pending_preemptions = self.pending_preemptions.checked_sub(1).ok_or_else(|| {
                SchedulerError::Internal("pending preemption counter underflow".to_string())
            })?;
        }
        metrics::observe_dispatch_latency(class.as_str(), latency.as_secs_f64());
        if class == RequestClass::Realtime {
            self.controller.observe_latency(latency);
        }

        let mut entry = self.entries.remove(&id).ok_or_else(|| {
            SchedulerError::Internal(format!("request {id} vanished during completion"))
        })?;

        match (class, outcome) {
            (_, InvocationOutcome::Success(output)) => {
                entry.transition(RequestState::Completed)?;
                self.counters.completed += 1;
                metrics::inc_completed(class.as_str(), "success");
                info!(
                    request_id = %id,
                    class = %class,
                    attempts = entry.request.attempts(),
                    latency_ms = latency.as_millis() as u64,
                    "request completed"
                );
                match class {
                    RequestClass::Realtime => reply(&mut entry, Ok(output), effects),
                    RequestClass::Task => effects.records.push(entry.status_write(None, Some(output))),
                }
            }
            (RequestClass::Realtime, InvocationOutcome::Failure(err)) => {
                entry.transition(RequestState::Failed)?;
                self.counters.failed += 1;
                metrics::inc_completed(class.as_str(), "failure");
                warn!(request_id = %id, class = %class, error = %err, "realtime request failed");
                reply(&mut entry, Err(SchedulerError::Provider(err)), effects);
            }
            (RequestClass::Realtime, InvocationOutcome::Cancelled) => {
                entry.transition(RequestState::Failed)?;
                self.counters.failed += 1;
                metrics::inc_completed(class.as_str(), "cancelled");
                warn!(request_id = %id, class = %class, "realtime request cancelled");
                reply(&mut entry, Err(SchedulerError::Cancelled), effects);
            }
            (RequestClass::Task, InvocationOutcome::Failure(err)) => {
                let retry = err.kind == ProviderErrorKind::Transient
                    && entry.request.record_attempt() <= retry_bound;
                if retry {
                    entry.transition(RequestState::Queued)?;
                    info!(
                        request_id = %id,
                        attempts = entry.request.attempts(),
                        error = %err,
                        "transient task failure, requeued"
                    );
                    effects.records.push(entry.status_write(None, None));
                    self.tasks.requeue_back(id);
                    self.entries.insert(id, entry);
                } else {
                    entry.transition(RequestState::Failed)?;
                    self.counters.failed += 1;
                    metrics::inc_completed(class.as_str(), "failure");
                    let kind = match err.kind {
                        ProviderErrorKind::Transient => ErrorKind::ProviderTransient,
                        ProviderErrorKind::Permanent => ErrorKind::ProviderPermanent,
                    };
                    warn!(
                        request_id = %id,
                        attempts = entry.request.attempts(),
                        error = %err,
                        "task failed"
                    );
                    let error = TaskError {
                        kind,
                        message: err.message,
                    };
                    effects.records.push(entry.status_write(Some(error), None));
                }
            }
            (RequestClass::Task, InvocationOutcome::Cancelled) => {
                entry.transition(RequestState::Preempted)?;
                let attempts = entry.request.record_attempt();
                self.counters.preempted += 1;
                metrics::inc_preemption("hard");
                if attempts > retry_bound {
                    entry.transition(RequestState::Failed)?;
                    self.counters.failed += 1;
                    metrics::inc_completed(class.as_str(), "cancelled");
                    warn!(
                        request_id = %id,
                        attempts,
                        retry_bound,
                        "task preempted past retry bound, failed"
                    );
                    let error = TaskError {
                        kind: ErrorKind::Cancelled,
                        message: format!(
                            "preempted {attempts} times, retry bound {retry_bound} exhausted"
                        ),
                    };
                    effects.records.push(entry.status_write(Some(error), None));
                } else {
                    entry.transition(RequestState::Queued)?;
                    info!(request_id = %id, attempts, "task preempted, requeued at front");
                    effects.records.push(entry.status_write(None, None));
                    self.tasks.push_front(id);
                    self.entries.insert(id, entry);
                }
            }
        }
        Ok(())
    }

    /// Periodic controller evaluation.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::Internal`] if the state is poisoned.
    pub fn tick(&mut self, now: Instant) -> Result<Effects, SchedulerError> {
        self.ensure_healthy()?;
        let mut effects = Effects::default();
        let result = self.reschedule(now, true, &mut effects);
        self.guard(result)?;
        Ok(effects)
    }

    /// Hot-apply tunable parameters. Total capacity is not changed.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::Internal`] if the state is poisoned.
    pub fn apply_tuning(
        &mut self,
        config: &SchedulerConfig,
        now: Instant,
    ) -> Result<Effects, SchedulerError> {
        self.ensure_healthy()?;
        if config.capacity.total != self.pool.total() {
            warn!(
                configured = config.capacity.total,
                active = self.pool.total(),
                "capacity.total cannot change at runtime, keeping current value"
            );
        }
        self.controller.apply_settings(ControllerSettings::from(config));
        self.realtime.set_max_depth(config.queues.realtime_max_depth);
        self.tasks.set_max_depth(config.queues.task_max_depth);
        self.policy = config.preemption.policy;
        self.retry_bound = config.preemption.retry_bound;
        info!(
            policy = self.policy.as_str(),
            retry_bound = self.retry_bound,
            "scheduler tuning applied"
        );
        let mut effects = Effects::default();
        let result = self.reschedule(now, false, &mut effects);
        self.guard(result)?;
        Ok(effects)
    }

    /// Stop admission and dispatch and fail every queued realtime caller.
    ///
    /// Queued tasks stay persisted as `Queued`. In-flight calls keep running.
    pub fn begin_shutdown(&mut self) -> Effects {
        self.accepting = false;
        let mut effects = Effects::default();
        for id in self.realtime.drain() {
            if let Some(mut entry) = self.entries.remove(&id) {
                if let Some(waiter) = entry.waiter.take() {
                    effects.replies.push(Reply {
                        waiter,
                        result: Err(SchedulerError::ShuttingDown),
                    });
                }
            }
        }
        info!(
            in_flight = self.pool.active(),
            tasks_queued = self.tasks.len(),
            "scheduler shutting down"
        );
        self.publish_gauges();
        effects
    }

    /// Returns `true` once shutdown has begun and no slot is held, or once the
    /// state is poisoned and slots can no longer be released.
    pub fn is_drained(&self) -> bool {
        self.poisoned.is_some() || (!self.accepting && self.pool.active() == 0)
    }

    /// Current view for metrics and tests.
    pub fn snapshot(&self) -> SchedulerSnapshot {
        SchedulerSnapshot {
            total: self.pool.total(),
            realtime_active: self.pool.realtime_active(),
            task_active: self.pool.task_active(),
            task_ceiling: self.pool.task_ceiling(),
            realtime_queue_depth: self.realtime.len(),
            task_queue_depth: self.tasks.len(),
            ewma_latency_ms: self
                .controller
                .ewma_latency()
                .map(|d| d.as_secs_f64() * 1000.0),
            shedding: self.controller.is_shedding(),
            pending_preemptions: self.pending_preemptions,
            completed: self.counters.completed,
            failed: self.counters.failed,
            preempted: self.counters.preempted,
            rejected: self.counters.rejected,
        }
    }

    /// Queued ids of `class`, front first.
    pub fn queued_ids(&self, class: RequestClass) -> Vec<RequestId> {
        match class {
            RequestClass::Realtime => self.realtime.ids(),
            RequestClass::Task => self.tasks.ids(),
        }
    }

    /// State and attempts of a live request.
    pub fn state_of(&self, id: RequestId) -> Option<(RequestState, u32)> {
        self.entries
            .get(&id)
            .map(|e| (e.request.state, e.request.attempts()))
    }

    fn ensure_healthy(&self) -> Result<(), SchedulerError> {
        match &self.poisoned {
            Some(reason) => Err(SchedulerError::Internal(reason.clone())),
            None => Ok(()),
        }
    }

    fn guard<T>(&mut self, result: Result<T, SchedulerError>) -> Result<T, SchedulerError> {
        if let Err(SchedulerError::Internal(reason)) = &result {
            if self.poisoned.is_none() {
                error!(reason = %reason, "scheduler bookkeeping corrupted, poisoning");
                self.poisoned = Some(reason.clone());
                // dropping the senders fails every blocked realtime caller
                for entry in self.entries.values_mut() {
                    entry.waiter.take();
                }
            }
        }
        result
    }

    fn live_dispatch(&mut self, id: RequestId, seq: u64) -> Result<&mut Entry, SchedulerError> {
        match self.entries.get_mut(&id) {
            Some(entry) if entry.request.state.holds_slot() && entry.dispatch_seq == seq => Ok(entry),
            Some(entry) => Err(SchedulerError::Internal(format!(
                "request {id} in state {} has no dispatch {seq}",
                entry.request.state
            ))),
            None => Err(SchedulerError::Internal(format!(
                "no bookkeeping for dispatched request {id}"
            ))),
        }
    }

    fn signals(&self) -> LoadSignals {
        LoadSignals {
            realtime_active: self.pool.realtime_active(),
            realtime_queue_depth: self.realtime.len(),
        }
    }

    fn recompute(&mut self, now: Instant, tick: bool) {
        let signals = self.signals();
        match self.controller.recompute(signals, now, tick) {
            Some(ControllerEvent::SheddingStarted { ceiling }) => {
                metrics::inc_preemption("soft");
                debug!(ceiling, "soft preemption: task ceiling cut");
            }
            Some(ControllerEvent::SheddingEnded) | None => {}
        }
        self.pool.set_task_ceiling(self.controller.task_ceiling());
    }

    fn reschedule(
        &mut self,
        now: Instant,
        tick: bool,
        effects: &mut Effects,
    ) -> Result<(), SchedulerError> {
        self.recompute(now, tick);

        if self.accepting {
            loop {
                if self.pool.has_free_slot() && !self.realtime.is_empty() {
                    if let Some(id) = self.realtime.pop_front() {
                        self.dispatch(id, now, effects)?;
                        // ceiling depends on realtime_active
                        self.recompute(now, false);
                    }
                } else if self.realtime.is_empty()
                    && self.pool.task_slot_available()
                    && !self.tasks.is_empty()
                {
                    if let Some(id) = self.tasks.pop_front() {
                        self.dispatch(id, now, effects)?;
                    }
                } else {
                    break;
                }
            }
            // a freed slot may have gone to one of several queued realtime
            // requests; the rest still need victims in this decision
            self.preempt();
        }

        self.pool.check_invariants()?;
        self.publish_gauges();
        Ok(())
    }

    fn preempt(&mut self) {
        let inputs = PreemptionInputs {
            realtime_queued: self.realtime.len(),
            has_free_slot: self.pool.has_free_slot(),
            latency_severe: self.controller.is_severe(),
            pending: self.pending_preemptions,
        };
        let quota = hard_preemption_quota(self.policy, &inputs);
        if quota == 0 {
            return;
        }
        let candidates = self
            .entries
            .values()
            .filter(|e| {
                e.request.class() == RequestClass::Task
                    && e.request.state.holds_slot()
                    && !e.preempting
            })
            .map(|e| VictimCandidate {
                id: e.request.id(),
                submitted_at: e.request.submitted_at(),
                dispatch_seq: e.dispatch_seq,
            })
            .collect();
        for id in select_victims(candidates, quota) {
            if let Some(entry) = self.entries.get_mut(&id) {
                entry.preempting = true;
                entry.cancel.cancel();
                self.pending_preemptions += 1;
                info!(
                    request_id = %id,
                    policy = self.policy.as_str(),
                    attempts = entry.request.attempts(),
                    "hard preemption requested"
                );
            }
        }
    }

    fn dispatch(
        &mut self,
        id: RequestId,
        now: Instant,
        effects: &mut Effects,
    ) -> Result<(), SchedulerError> {
        self.next_dispatch_seq += 1;
        let seq = self.next_dispatch_seq;
        let entry = self.entries.get_mut(&id).ok_or_else(|| {
            SchedulerError::Internal(format!("queued request {id} has no bookkeeping"))
        })?;
        let class = entry.request.class();
        self.pool.acquire(class)?;
        entry.transition(RequestState::Dispatched)?;
        entry.cancel = CancellationToken::new();
        entry.dispatched_at = Some(now);
        entry.dispatch_seq = seq;
        if class == RequestClass::Task {
            effects.records.push(entry.status_write(None, None));
        }
        effects.dispatches.push(Dispatch {
            id,
            class,
            payload: entry.request.payload(),
            cancel: entry.cancel.clone(),
            seq,
        });
        Ok(())
    }

    fn publish_gauges(&self) {
        metrics::set_active(RequestClass::Realtime.as_str(), self.pool.realtime_active());
        metrics::set_active(RequestClass::Task.as_str(), self.pool.task_active());
        metrics::set_queue_depth(RequestClass::Realtime.as_str(), self.realtime.len());
        metrics::set_queue_depth(RequestClass::Task.as_str(), self.tasks.len());
        metrics::set_task_ceiling(self.pool.task_ceiling());
    }
}

fn reply(entry: &mut Entry, result: Result<String, SchedulerError>, effects: &mut Effects) {
    match entry.waiter.take() {
        Some(waiter) => effects.replies.push(Reply { waiter, result }),
        None => warn!(request_id = %entry.request.id(), "realtime request has no waiting caller"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::ProviderError;
    use crate::request::{InvocationPayload, TenantId};

    fn config(total: usize) -> SchedulerConfig {
        let mut cfg = SchedulerConfig::default();
        cfg.capacity.total = total;
        cfg.capacity.reserve = 2;
        cfg.capacity.task_floor = 1;
        cfg.queues.task_max_depth = 100;
        cfg.controller.idle_window_ms = 100;
        cfg
    }

    fn task() -> Request {
        Request::new(TenantId::new("t"), RequestClass::Task, InvocationPayload::new("m", "p"))
    }

    fn realtime() -> Request {
        Request::new(TenantId::new("t"), RequestClass::Realtime, InvocationPayload::new("m", "p"))
    }

    #[test]
    fn test_task_dispatch_respects_initial_ceiling() {
        let now = Instant::now();
        let mut s = SchedulerState::new(&config(10), now);
        let mut dispatched = 0;
        for _ in 0..10 {
            dispatched += s.admit(task(), None, now).expect("test: admit").dispatches.len();
        }
        assert_eq!(dispatched, 8);
        let snap = s.snapshot();
        assert_eq!(snap.task_active, 8);
        assert_eq!(snap.task_queue_depth, 2);
    }

    #[test]
    fn test_admit_task_persists_queued_then_dispatched() {
        let now = Instant::now();
        let mut s = SchedulerState::new(&config(10), now);
        let effects = s.admit(task(), None, now).expect("test: admit");
        let states: Vec<_> = effects.records.iter().map(|w| w.record.state).collect();
        assert_eq!(states, vec![RequestState::Queued, RequestState::Dispatched]);
        let revs: Vec<_> = effects.records.iter().map(|w| w.record.revision).collect();
        assert_eq!(revs, vec![1, 2]);
    }

    #[test]
    fn test_realtime_blocks_task_dispatch_while_queued() {
        let now = Instant::now();
        let mut s = SchedulerState::new(&config(2), now);
        let (tx, _rx) = oneshot::channel();
        s.admit(realtime(), Some(tx), now).expect("test: admit");
        let (tx, _rx) = oneshot::channel();
        s.admit(realtime(), Some(tx), now).expect("test: admit");
        let (tx, _rx) = oneshot::channel();
        s.admit(realtime(), Some(tx), now).expect("test: admit");
        let effects = s.admit(task(), None, now).expect("test: admit");
        assert!(effects.dispatches.is_empty());
        let snap = s.snapshot();
        assert_eq!(snap.realtime_active, 2);
        assert_eq!(snap.realtime_queue_depth, 1);
        assert_eq!(snap.task_active, 0);
    }

    #[test]
    fn test_completion_releases_slot_and_pulls_next() {
        let now = Instant::now();
        let mut s = SchedulerState::new(&config(3), now);
        // ceiling = max(1, 3 - 2) = 1
        let first = s.admit(task(), None, now).expect("test: admit").dispatches;
        assert_eq!(first.len(), 1);
        assert!(s.admit(task(), None, now).expect("test: admit").dispatches.is_empty());

        let d = &first[0];
        s.mark_running(d.id, d.seq).expect("test: running");
        let effects = s
            .complete(d.id, d.seq, InvocationOutcome::Success("ok".into()), now)
            .expect("test: complete");
        assert_eq!(effects.dispatches.len(), 1);
        let done = effects
            .records
            .iter()
            .find(|w| w.record.task_id == d.id)
            .expect("test: terminal record");
        assert_eq!(done.record.state, RequestState::Completed);
        assert_eq!(done.output.as_deref(), Some("ok"));
        assert_eq!(s.snapshot().completed, 1);
    }

    #[test]
    fn test_transient_failure_requeues_at_back() {
        let now = Instant::now();
        let mut cfg = config(3);
        cfg.capacity.reserve = 2;
        let mut s = SchedulerState::new(&cfg, now);
        let a = s.admit(task(), None, now).expect("test: admit").dispatches;
        let b = task();
        let b_id = b.id();
        s.admit(b, None, now).expect("test: admit");
        let d = &a[0];
        let effects = s
            .complete(
                d.id,
                d.seq,
                InvocationOutcome::Failure(ProviderError::transient("503")),
                now,
            )
            .expect("test: complete");
        // b was waiting, so it goes first; a is behind it
        assert_eq!(effects.dispatches[0].id, b_id);
        assert_eq!(s.queued_ids(RequestClass::Task), vec![d.id]);
        assert_eq!(s.state_of(d.id), Some((RequestState::Queued, 1)));
    }

    #[test]
    fn test_permanent_failure_fails_task_with_kind() {
        let now = Instant::now();
        let mut s = SchedulerState::new(&config(4), now);
        let d = s.admit(task(), None, now).expect("test: admit").dispatches.remove(0);
        let effects = s
            .complete(
                d.id,
                d.seq,
                InvocationOutcome::Failure(ProviderError::permanent("401")),
                now,
            )
            .expect("test: complete");
        let rec = &effects.records[0].record;
        assert_eq!(rec.state, RequestState::Failed);
        assert_eq!(rec.error.as_ref().map(|e| e.kind), Some(ErrorKind::ProviderPermanent));
        assert!(s.state_of(d.id).is_none());
    }

    #[test]
    fn test_realtime_failure_is_replied() {
        let now = Instant::now();
        let mut s = SchedulerState::new(&config(4), now);
        let (tx, mut rx) = oneshot::channel();
        let d = s
            .admit(realtime(), Some(tx), now)
            .expect("test: admit")
            .dispatches
            .remove(0);
        let effects = s
            .complete(
                d.id,
                d.seq,
                InvocationOutcome::Failure(ProviderError::permanent("bad")),
                now,
            )
            .expect("test: complete");
        for r in effects.replies {
            let _ = r.waiter.send(r.result);
        }
        let got = rx.try_recv().expect("test: reply");
        assert!(matches!(got, Err(SchedulerError::Provider(_))));
    }

    #[test]
    fn test_aggressive_policy_cancels_youngest_task() {
        let now = Instant::now();
        let mut cfg = config(2);
        cfg.capacity.reserve = 0;
        cfg.preemption.policy = PreemptionPolicy::Aggressive;
        let mut s = SchedulerState::new(&cfg, now);
        let old = s.admit(task(), None, now).expect("test: admit").dispatches.remove(0);
        let young = s
            .admit(task(), None, now + Duration::from_millis(1))
            .expect("test: admit")
            .dispatches
            .remove(0);

        let (tx, _rx) = oneshot::channel();
        s.admit(realtime(), Some(tx), now).expect("test: admit");
        assert!(young.cancel.is_cancelled());
        assert!(!old.cancel.is_cancelled());
        assert_eq!(s.snapshot().pending_preemptions, 1);

        let effects = s
            .complete(young.id, young.seq, InvocationOutcome::Cancelled, now)
            .expect("test: complete");
        assert_eq!(effects.dispatches.len(), 1);
        assert_eq!(effects.dispatches[0].class, RequestClass::Realtime);
        assert_eq!(s.queued_ids(RequestClass::Task), vec![young.id]);
        assert_eq!(s.state_of(young.id), Some((RequestState::Queued, 1)));
        assert_eq!(s.snapshot().pending_preemptions, 0);
    }

    #[test]
    fn test_severe_completion_preempts_for_remaining_queued_realtime() {
        let now = Instant::now();
        let mut cfg = config(2);
        cfg.capacity.reserve = 0;
        cfg.preemption.policy = PreemptionPolicy::Adaptive;
        cfg.controller.ewma_alpha = 1.0;
        cfg.controller.latency_threshold_ms = 10;
        cfg.controller.severe_latency_threshold_ms = 20;
        let mut s = SchedulerState::new(&cfg, now);

        let (tx, _rx0) = oneshot::channel();
        let r0 = s.admit(realtime(), Some(tx), now).expect("test: admit").dispatches.remove(0);
        let t = s.admit(task(), None, now).expect("test: admit").dispatches.remove(0);
        let (tx, _rx1) = oneshot::channel();
        s.admit(realtime(), Some(tx), now).expect("test: admit");
        let (tx, _rx2) = oneshot::channel();
        s.admit(realtime(), Some(tx), now).expect("test: admit");
        assert!(!t.cancel.is_cancelled(), "no latency sample yet");

        s.mark_running(r0.id, r0.seq).expect("test: running");
        let effects = s
            .complete(
                r0.id,
                r0.seq,
                InvocationOutcome::Success("ok".into()),
                now + Duration::from_millis(50),
            )
            .expect("test: complete");
        assert_eq!(effects.dispatches.len(), 1);
        assert_eq!(effects.dispatches[0].class, RequestClass::Realtime);
        assert!(t.cancel.is_cancelled());

        let snap = s.snapshot();
        assert_eq!(snap.realtime_queue_depth, 1);
        assert_eq!(snap.pending_preemptions, 1);
    }

    #[test]
    fn test_finished_call_wins_over_late_cancellation() {
        let now = Instant::now();
        let mut cfg = config(1);
        cfg.capacity.reserve = 0;
        cfg.preemption.policy = PreemptionPolicy::Aggressive;
        let mut s = SchedulerState::new(&cfg, now);
        let d = s.admit(task(), None, now).expect("test: admit").dispatches.remove(0);
        let (tx, _rx) = oneshot::channel();
        s.admit(realtime(), Some(tx), now).expect("test: admit");
        assert!(d.cancel.is_cancelled());
        s.complete(d.id, d.seq, InvocationOutcome::Success("done".into()), now)
            .expect("test: complete");
        let snap = s.snapshot();
        assert_eq!(snap.completed, 1);
        assert_eq!(snap.preempted, 0);
        assert_eq!(snap.pending_preemptions, 0);
    }

    #[test]
    fn test_unknown_completion_poisons_state() {
        let now = Instant::now();
        let mut s = SchedulerState::new(&config(4), now);
        let err = s
            .complete(RequestId::new(), 1, InvocationOutcome::Cancelled, now)
            .unwrap_err();
        assert!(matches!(err, SchedulerError::Internal(_)));
        let err = s.admit(task(), None, now).unwrap_err();
        assert!(matches!(err, SchedulerError::Internal(_)));
    }

    #[test]
    fn test_shutdown_fails_queued_realtime_and_stops_dispatch() {
        let now = Instant::now();
        let mut cfg = config(1);
        cfg.capacity.reserve = 0;
        let mut s = SchedulerState::new(&cfg, now);
        let (tx, _rx) = oneshot::channel();
        let d = s.admit(realtime(), Some(tx), now).expect("test: admit").dispatches.remove(0);
        let (tx, _rx2) = oneshot::channel();
        s.admit(realtime(), Some(tx), now).expect("test: admit");

        let effects = s.begin_shutdown();
        assert_eq!(effects.replies.len(), 1);
        assert!(matches!(effects.replies[0].result, Err(SchedulerError::ShuttingDown)));
        assert!(!s.is_drained());
        assert!(matches!(
            s.admit(task(), None, now),
            Err(SchedulerError::ShuttingDown)
        ));

        s.complete(d.id, d.seq, InvocationOutcome::Success("x".into()), now)
            .expect("test: complete");
        assert!(s.is_drained());
    }

    #[test]
    fn test_poisoned_state_counts_as_drained() {
        let now = Instant::now();
        let mut s = SchedulerState::new(&config(4), now);
        let d = s.admit(task(), None, now).expect("test: admit").dispatches.remove(0);
        assert!(!s.is_drained());

        s.complete(RequestId::new(), 7, InvocationOutcome::Cancelled, now)
            .unwrap_err();
        s.begin_shutdown();
        assert_eq!(s.snapshot().task_active, 1);
        assert!(s.is_drained());
        // the slot is never released once poisoned
        assert!(s
            .complete(d.id, d.seq, InvocationOutcome::Success("x".into()), now)
            .is_err());
        assert!(s.is_drained());
    }
}

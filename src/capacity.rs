//! # Capacity Pool
//!
//! ## Responsibility
//! Track the configured invocation concurrency and its live split between
//! realtime and task work.
//!
//! ## Guarantees
//! - `realtime_active + task_active <= total` after every successful operation
//! - A task slot is only acquired while `task_active < task_ceiling`
//! - Releasing a slot that was never acquired is reported, never absorbed
//!
//! ## NOT Responsible For
//! - Computing the task ceiling (that belongs to `controller`)
//! - Synchronisation (the owner holds the scheduler lock)

use crate::request::RequestClass;
use crate::SchedulerError;

/// Live capacity accounting.
///
/// # Panics
///
/// No methods on this type panic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapacityPool {
    total: usize,
    realtime_active: usize,
    task_active: usize,
    task_ceiling: usize,
}

impl CapacityPool {
    /// Create an empty pool with `total` slots and an initial task ceiling.
    ///
    /// The ceiling is clamped to `total`.
    pub fn new(total: usize, task_ceiling: usize) -> Self {
        Self {
            total,
            realtime_active: 0,
            task_active: 0,
            task_ceiling: task_ceiling.min(total),
        }
    }

    /// Configured maximum concurrent invocations.
    pub fn total(&self) -> usize {
        self.total
    }

    /// Realtime requests currently holding a slot.
    pub fn realtime_active(&self) -> usize {
        self.realtime_active
    }

    /// Task requests currently holding a slot.
    pub fn task_active(&self) -> usize {
        self.task_active
    }

    /// Current upper bound on new task dispatches.
    pub fn task_ceiling(&self) -> usize {
        self.task_ceiling
    }

    /// All slots in use.
    pub fn active(&self) -> usize {
        self.realtime_active + self.task_active
    }

    /// Returns `true` if at least one slot is unused.
    pub fn has_free_slot(&self) -> bool {
        self.active() < self.total
    }

    /// Returns `true` if a task request may be dispatched right now.
    pub fn task_slot_available(&self) -> bool {
        self.has_free_slot() && self.task_active < self.task_ceiling
    }

    /// Publish a new task ceiling, clamped to `total`.
    ///
    /// A ceiling below `task_active` is allowed: in-flight task calls keep
    /// their slots and new task dispatch pauses until enough of them finish.
    pub fn set_task_ceiling(&mut self, ceiling: usize) {
        self.task_ceiling = ceiling.min(self.total);
    }

    /// Take one slot for `class`.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::Internal`] if the acquisition would break
    /// the partition invariants. Callers check availability first, so this
    /// only fires on accounting corruption.
    pub fn acquire(&mut self, class: RequestClass) -> Result<(), SchedulerError> {
        if !self.has_free_slot() {
            return Err(SchedulerError::Internal(format!(
                "acquire {class} slot with pool full ({}/{})",
                self.active(),
                self.total
            )));
        }
        match class {
            RequestClass::Realtime => self.realtime_active += 1,
            RequestClass::Task => {
                if self.task_active >= self.task_ceiling {
                    return Err(SchedulerError::Internal(format!(
                        "acquire task slot above ceiling ({}/{})",
                        self.task_active, self.task_ceiling
                    )));
                }
                self.task_active += 1;
            }
        }
        Ok(())
    }

    /// Return one slot held by `class`.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::Internal`] on counter underflow.
    pub fn release(&mut self, class: RequestClass) -> Result<(), SchedulerError> {
        let counter = match class {
            RequestClass::Realtime => &mut self.realtime_active,
            RequestClass::Task => &mut self.task_active,
        };
        *counter = counter.checked_sub(1).ok_or_else(|| {
            SchedulerError::Internal(format!("{class} active counter underflow on release"))
        })?;
        Ok(())
    }

    /// Verify the partition invariants.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::Internal`] describing the first violation.
    pub fn check_invariants(&self) -> Result<(), SchedulerError> {
        if self.active() > self.total {
            return Err(SchedulerError::Internal(format!(
                "realtime_active {} + task_active {} exceeds total {}",
                self.realtime_active, self.task_active, self.total
            )));
        }
        if self.task_ceiling > self.total {
            return Err(SchedulerError::Internal(format!(
                "task_ceiling {} exceeds total {}",
                self.task_ceiling, self.total
            )));
        }
        Ok(())
    }
}

//! # Concurrency Controller
//!
//! ## Responsibility
//! Compute the task-class concurrency ceiling from observed realtime load:
//! queue depth, active realtime calls and an exponentially weighted moving
//! average of realtime dispatch latency.
//!
//! ## Policy
//! - Realtime demand present: `ceiling = max(task_floor, total - realtime_active - reserve)`
//! - No realtime demand for `idle_window`: ramp toward `total` by `ramp_step` per tick
//! - EWMA above `latency_threshold`: cut the ceiling once by `shed_fraction` and
//!   hold it there until latency recovers (the shedding state)
//!
//! ## Guarantees
//! - `ceiling <= total` always
//! - `ceiling >= task_floor` whenever not shedding
//! - Pure arithmetic: no I/O, no locks, no blocking
//!
//! ## NOT Responsible For
//! - Cancelling in-flight work (that belongs to `preemption`)
//! - Applying the ceiling to the pool (the dispatcher publishes it)

use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::config::SchedulerConfig;

/// Tunable controller parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct ControllerSettings {
    /// Total invocation slots.
    pub total: usize,
    /// Slots withheld from task work whenever realtime demand exists.
    pub reserve: usize,
    /// Minimum ceiling outside the shedding state.
    pub task_floor: usize,
    /// How long realtime demand must be absent before ramping up.
    pub idle_window: Duration,
    /// Ceiling increase per tick while idle.
    pub ramp_step: usize,
    /// EWMA smoothing factor in `(0, 1]`.
    pub ewma_alpha: f64,
    /// EWMA latency above which shedding starts.
    pub latency_threshold: Duration,
    /// EWMA latency above which hard preemption is allowed.
    pub severe_latency_threshold: Duration,
    /// Fraction of the ceiling removed when shedding starts.
    pub shed_fraction: f64,
    /// Shedding ends once EWMA falls to `recovery_ratio * latency_threshold`.
    pub recovery_ratio: f64,
}

impl From<&SchedulerConfig> for ControllerSettings {
    fn from(config: &SchedulerConfig) -> Self {
        let c = &config.controller;
        Self {
            total: config.capacity.total,
            reserve: config.capacity.reserve,
            task_floor: config.capacity.task_floor,
            idle_window: Duration::from_millis(c.idle_window_ms),
            ramp_step: c.ramp_step,
            ewma_alpha: c.ewma_alpha,
            latency_threshold: Duration::from_millis(c.latency_threshold_ms),
            severe_latency_threshold: Duration::from_millis(c.severe_latency_threshold_ms),
            shed_fraction: c.shed_fraction,
            recovery_ratio: c.recovery_ratio,
        }
    }
}

/// Realtime load observed at the moment of a recompute.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoadSignals {
    /// Realtime requests holding a slot.
    pub realtime_active: usize,
    /// Realtime requests waiting in the queue.
    pub realtime_queue_depth: usize,
}

impl LoadSignals {
    fn has_realtime_demand(&self) -> bool {
        self.realtime_active > 0 || self.realtime_queue_depth > 0
    }
}

/// Transitions of the shedding state, reported so the caller can log and count them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerEvent {
    /// Latency crossed the threshold; the ceiling was cut to `ceiling`.
    SheddingStarted {
        /// Ceiling right after the cut.
        ceiling: usize,
    },
    /// Latency recovered or went stale; normal policy resumed.
    SheddingEnded,
}

/// Computes the task ceiling.
#[derive(Debug)]
pub struct ConcurrencyController {
    settings: ControllerSettings,
    base_ceiling: usize,
    shed_cap: Option<usize>,
    ceiling: usize,
    ewma_secs: Option<f64>,
    last_demand_at: Instant,
}

impl ConcurrencyController {
    /// Create a controller. The idle window is measured from `now`.
    ///
    /// The initial ceiling is `max(task_floor, total - reserve)`.
    pub fn new(settings: ControllerSettings, now: Instant) -> Self {
        let base = Self::demand_ceiling(&settings, 0);
        Self {
            settings,
            base_ceiling: base,
            shed_cap: None,
            ceiling: base,
            ewma_secs: None,
            last_demand_at: now,
        }
    }

    fn demand_ceiling(settings: &ControllerSettings, realtime_active: usize) -> usize {
        settings
            .total
            .saturating_sub(realtime_active + settings.reserve)
            .max(settings.task_floor)
            .min(settings.total)
    }

    /// Current task ceiling.
    pub fn task_ceiling(&self) -> usize {
        self.ceiling
    }

    /// Whether the latency-triggered shedding state is active.
    pub fn is_shedding(&self) -> bool {
        self.shed_cap.is_some()
    }

    /// Smoothed realtime dispatch latency, if any sample has been observed.
    pub fn ewma_latency(&self) -> Option<Duration> {
        self.ewma_secs.map(Duration::from_secs_f64)
    }

    /// Returns `true` if the smoothed latency exceeds the severe threshold.
    pub fn is_severe(&self) -> bool {
        self.ewma_secs
            .is_some_and(|e| e > self.settings.severe_latency_threshold.as_secs_f64())
    }

    /// Active settings.
    pub fn settings(&self) -> &ControllerSettings {
        &self.settings
    }

    /// Replace the tunable settings. `total` is fixed for the controller's lifetime.
    pub fn apply_settings(&mut self, mut settings: ControllerSettings) {
        settings.total = self.settings.total;
        self.settings = settings;
        self.base_ceiling = self
            .base_ceiling
            .clamp(self.settings.task_floor.min(self.settings.total), self.settings.total);
    }

    /// Feed one realtime dispatch latency sample into the EWMA.
    pub fn observe_latency(&mut self, sample: Duration) {
        let x = sample.as_secs_f64();
        let alpha = self.settings.ewma_alpha;
        let next = match self.ewma_secs {
            Some(prev) => alpha * x + (1.0 - alpha) * prev,
            None => x,
        };
        self.ewma_secs = Some(next);
    }

    /// Recompute the ceiling from `signals`.
    ///
    /// `tick` is `true` only for the periodic evaluation; idle ramp-up only
    /// advances on ticks so bursts of events cannot jump the ceiling to `total`.
    pub fn recompute(
        &mut self,
        signals: LoadSignals,
        now: Instant,
        tick: bool,
    ) -> Option<ControllerEvent> {
        let demand = signals.has_realtime_demand();
        if demand {
            self.last_demand_at = now;
        }
        let idle = !demand && now.duration_since(self.last_demand_at) >= self.settings.idle_window;

        if idle && self.ewma_secs.is_some() {
            // nothing left to measure; the old signal would pin shedding forever
            self.ewma_secs = None;
        }

        if demand {
            self.base_ceiling = Self::demand_ceiling(&self.settings, signals.realtime_active);
        } else if idle && tick && self.base_ceiling < self.settings.total {
            self.base_ceiling = (self.base_ceiling + self.settings.ramp_step).min(self.settings.total);
            debug!(ceiling = self.base_ceiling, "task ceiling ramping up");
        }

        let threshold = self.settings.latency_threshold.as_secs_f64();
        let mut event = None;
        match self.ewma_secs {
            Some(ewma) if ewma > threshold => {
                if self.shed_cap.is_none() {
                    let current = self.base_ceiling.min(self.ceiling) as f64;
                    let cap = (current * (1.0 - self.settings.shed_fraction)).floor() as usize;
                    self.shed_cap = Some(cap);
                    info!(
                        ewma_ms = (ewma * 1000.0) as u64,
                        threshold_ms = self.settings.latency_threshold.as_millis() as u64,
                        ceiling = cap,
                        "realtime latency above threshold, shedding task capacity"
                    );
                    event = Some(ControllerEvent::SheddingStarted { ceiling: cap });
                }
            }
            ewma => {
                let recovered = ewma.map_or(true, |e| e <= threshold * self.settings.recovery_ratio);
                if self.shed_cap.is_some() && recovered {
                    self.shed_cap = None;
                    info!("realtime latency recovered, task shedding ended");
                    event = Some(ControllerEvent::SheddingEnded);
                }
            }
        }

        self.ceiling = match self.shed_cap {
            Some(cap) => self.base_ceiling.min(cap),
            None => self.base_ceiling,
        };
        event
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> ControllerSettings {
        ControllerSettings {
            total: 10,
            reserve: 2,
            task_floor: 1,
            idle_window: Duration::from_millis(100),
            ramp_step: 1,
            ewma_alpha: 0.5,
            latency_threshold: Duration::from_millis(200),
            severe_latency_threshold: Duration::from_millis(500),
            shed_fraction: 0.5,
            recovery_ratio: 0.8,
        }
    }

    fn demand(active: usize, queued: usize) -> LoadSignals {
        LoadSignals {
            realtime_active: active,
            realtime_queue_depth: queued,
        }
    }

    #[test]
    fn test_initial_ceiling_withholds_reserve() {
        let c = ConcurrencyController::new(settings(), Instant::now());
        assert_eq!(c.task_ceiling(), 8);
        assert!(!c.is_shedding());
    }

    #[test]
    fn test_realtime_demand_reduces_ceiling() {
        let now = Instant::now();
        let mut c = ConcurrencyController::new(settings(), now);
        c.recompute(demand(1, 0), now, false);
        assert_eq!(c.task_ceiling(), 7);
        c.recompute(demand(5, 3), now, false);
        assert_eq!(c.task_ceiling(), 3);
    }

    #[test]
    fn test_ceiling_never_below_floor_under_saturation() {
        let now = Instant::now();
        let mut c = ConcurrencyController::new(settings(), now);
        c.recompute(demand(10, 50), now, false);
        assert_eq!(c.task_ceiling(), 1);
    }

    #[test]
    fn test_idle_ramp_only_on_ticks_after_window() {
        let start = Instant::now();
        let mut c = ConcurrencyController::new(settings(), start);
        // inside the idle window nothing moves
        c.recompute(demand(0, 0), start + Duration::from_millis(50), true);
        assert_eq!(c.task_ceiling(), 8);

        let later = start + Duration::from_millis(150);
        c.recompute(demand(0, 0), later, false);
        assert_eq!(c.task_ceiling(), 8, "non-tick events must not ramp");

        c.recompute(demand(0, 0), later, true);
        assert_eq!(c.task_ceiling(), 9);
        c.recompute(demand(0, 0), later, true);
        c.recompute(demand(0, 0), later, true);
        assert_eq!(c.task_ceiling(), 10, "ramp stops at total");
    }

    #[test]
    fn test_demand_resets_idle_window() {
        let start = Instant::now();
        let mut c = ConcurrencyController::new(settings(), start);
        let t1 = start + Duration::from_millis(90);
        c.recompute(demand(1, 0), t1, false);
        let t2 = t1 + Duration::from_millis(50);
        c.recompute(demand(0, 0), t2, true);
        assert_eq!(c.task_ceiling(), 7, "window restarts at last demand");
    }

    #[test]
    fn test_ewma_first_sample_then_smoothing() {
        let mut c = ConcurrencyController::new(settings(), Instant::now());
        assert!(c.ewma_latency().is_none());
        c.observe_latency(Duration::from_millis(100));
        assert_eq!(c.ewma_latency(), Some(Duration::from_millis(100)));
        c.observe_latency(Duration::from_millis(300));
        let ewma = c.ewma_latency().expect("test: ewma").as_millis();
        assert!((199..=201).contains(&ewma), "got {ewma}");
    }

    #[test]
    fn test_latency_above_threshold_cuts_ceiling_once() {
        let now = Instant::now();
        let mut c = ConcurrencyController::new(settings(), now);
        c.observe_latency(Duration::from_millis(400));
        let event = c.recompute(demand(0, 1), now, false);
        assert_eq!(event, Some(ControllerEvent::SheddingStarted { ceiling: 4 }));
        assert!(c.is_shedding());
        assert_eq!(c.task_ceiling(), 4);

        // still above threshold: no further cut
        let event = c.recompute(demand(0, 1), now, false);
        assert_eq!(event, None);
        assert_eq!(c.task_ceiling(), 4);
    }

    #[test]
    fn test_shedding_may_go_below_floor() {
        let now = Instant::now();
        let mut s = settings();
        s.shed_fraction = 0.9;
        let mut c = ConcurrencyController::new(s, now);
        c.recompute(demand(7, 0), now, false);
        assert_eq!(c.task_ceiling(), 1);
        c.observe_latency(Duration::from_secs(1));
        c.recompute(demand(7, 0), now, false);
        assert_eq!(c.task_ceiling(), 0);
    }

    #[test]
    fn test_shedding_ends_with_hysteresis() {
        let now = Instant::now();
        let mut s = settings();
        s.ewma_alpha = 1.0;
        let mut c = ConcurrencyController::new(s, now);
        c.observe_latency(Duration::from_millis(400));
        c.recompute(demand(1, 0), now, false);
        assert!(c.is_shedding());

        // below threshold but above recovery point (160ms)
        c.observe_latency(Duration::from_millis(180));
        assert_eq!(c.recompute(demand(1, 0), now, false), None);
        assert!(c.is_shedding());

        c.observe_latency(Duration::from_millis(100));
        assert_eq!(
            c.recompute(demand(1, 0), now, false),
            Some(ControllerEvent::SheddingEnded)
        );
        assert_eq!(c.task_ceiling(), 7);
    }

    #[test]
    fn test_idle_window_clears_stale_latency_and_shedding() {
        let start = Instant::now();
        let mut c = ConcurrencyController::new(settings(), start);
        c.observe_latency(Duration::from_secs(2));
        c.recompute(demand(1, 0), start, false);
        assert!(c.is_shedding());

        let later = start + Duration::from_millis(200);
        let event = c.recompute(demand(0, 0), later, true);
        assert_eq!(event, Some(ControllerEvent::SheddingEnded));
        assert!(c.ewma_latency().is_none());
        assert!(c.task_ceiling() >= 1);
    }

    #[test]
    fn test_is_severe_uses_severe_threshold() {
        let mut c = ConcurrencyController::new(settings(), Instant::now());
        c.observe_latency(Duration::from_millis(300));
        assert!(!c.is_severe());
        c.observe_latency(Duration::from_millis(2000));
        assert!(c.is_severe());
    }

    #[test]
    fn test_apply_settings_keeps_total() {
        let mut c = ConcurrencyController::new(settings(), Instant::now());
        let mut s = settings();
        s.total = 99;
        s.task_floor = 3;
        c.apply_settings(s);
        assert_eq!(c.settings().total, 10);
        assert_eq!(c.settings().task_floor, 3);
    }
}

//! # Preemption Manager
//!
//! ## Responsibility
//! Decide when in-flight task work must give its slot back to waiting
//! realtime requests, and which task calls to cancel.
//!
//! Soft preemption needs no decision here: the controller cuts the task
//! ceiling and finishing task calls are simply not replaced. Hard
//! preemption cancels running task calls, youngest first.
//!
//! ## Guarantees
//! - At most one outstanding hard preemption per queued realtime request
//! - Victims are ordered by latest `submitted_at`, then latest dispatch
//! - A request already being cancelled is never selected twice

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use tokio::time::Instant;

use crate::request::RequestId;

/// When hard preemption is permitted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum PreemptionPolicy {
    /// Never cancel running task calls; only cut the ceiling.
    Soft,
    /// Cancel running task calls only while realtime latency is severe.
    #[default]
    Adaptive,
    /// Cancel running task calls whenever realtime work is waiting for a slot.
    Aggressive,
}

impl PreemptionPolicy {
    /// Label used in logs and metrics.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Soft => "soft",
            Self::Adaptive => "adaptive",
            Self::Aggressive => "aggressive",
        }
    }
}

/// Load picture used to size a hard preemption round.
#[derive(Debug, Clone, Copy)]
pub struct PreemptionInputs {
    /// Realtime requests waiting for a slot.
    pub realtime_queued: usize,
    /// Whether the pool has an unused slot.
    pub has_free_slot: bool,
    /// Whether realtime EWMA latency is above the severe threshold.
    pub latency_severe: bool,
    /// Cancellations already requested but not yet acknowledged.
    pub pending: usize,
}

/// Number of additional task calls to cancel right now.
///
/// Zero unless realtime work is queued, no slot is free and the policy
/// allows cancellation at the current latency.
pub fn hard_preemption_quota(policy: PreemptionPolicy, inputs: &PreemptionInputs) -> usize {
    if inputs.realtime_queued == 0 || inputs.has_free_slot {
        return 0;
    }
    let allowed = match policy {
        PreemptionPolicy::Soft => false,
        PreemptionPolicy::Adaptive => inputs.latency_severe,
        PreemptionPolicy::Aggressive => true,
    };
    if !allowed {
        return 0;
    }
    inputs.realtime_queued.saturating_sub(inputs.pending)
}

/// An in-flight task call that could be cancelled.
#[derive(Debug, Clone, Copy)]
pub struct VictimCandidate {
    /// Request holding the slot.
    pub id: RequestId,
    /// Admission time of the request.
    pub submitted_at: Instant,
    /// Dispatch sequence number, increasing per dispatch.
    pub dispatch_seq: u64,
}

/// Pick up to `quota` victims, youngest first.
pub fn select_victims(mut candidates: Vec<VictimCandidate>, quota: usize) -> Vec<RequestId> {
    candidates.sort_by_key(|c| Reverse((c.submitted_at, c.dispatch_seq)));
    candidates.into_iter().take(quota).map(|c| c.id).collect()
}

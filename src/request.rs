//! # Request model
//!
//! ## Responsibility
//! Define the value types that flow through the scheduler: identifiers, the
//! traffic class, the lifecycle state machine and the opaque provider payload.
//!
//! ## Guarantees
//! - `class` is fixed at admission; no method on [`Request`] changes it
//! - State transitions are checked by [`RequestState::can_transition_to`]
//! - `attempts` only ever increases
//!
//! ## NOT Responsible For
//! - Deciding when a transition happens (that belongs to `dispatcher`)
//! - Persisting request state (that belongs to `store`)

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tokio::time::Instant;
use uuid::Uuid;

/// Unique identifier assigned to a request at admission.
///
/// For task requests this is also the task id handed back to the caller
/// for status polling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(Uuid);

impl RequestId {
    /// Generate a fresh random identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for RequestId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Owning tenant of a request.
///
/// Capacity accounting is global; the tenant is carried so that callers and
/// persisted task records can be attributed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TenantId(
    /// The raw tenant identifier, typically a user id or API key owner.
    pub String,
);

impl TenantId {
    /// Create a new [`TenantId`] from any string-like value.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Return the tenant ID as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Traffic class of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestClass {
    /// Interactive call; the caller blocks until a result is available.
    Realtime,
    /// Batch call; the caller polls for completion.
    Task,
}

impl RequestClass {
    /// Label used for metrics and log fields.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Realtime => "realtime",
            Self::Task => "task",
        }
    }
}

impl fmt::Display for RequestClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle state of a request.
///
/// ```text
/// Queued → Dispatched → Running → Completed | Failed | Preempted
/// Running → Queued            (transient task failure, retries remain)
/// Preempted → Queued | Failed
/// Queued → Rejected           (admission-time backpressure)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestState {
    /// Waiting in a class queue.
    Queued,
    /// Holds a capacity slot; the provider call has been spawned.
    Dispatched,
    /// The provider call is in flight.
    Running,
    /// Cancelled by hard preemption; about to be requeued or failed.
    Preempted,
    /// Finished successfully.
    Completed,
    /// Finished unsuccessfully; no further attempts.
    Failed,
    /// Refused at admission because the class queue was full.
    Rejected,
}

impl RequestState {
    /// Returns `true` if no further transition is possible.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Rejected)
    }

    /// Returns `true` if the request currently occupies a capacity slot.
    pub fn holds_slot(self) -> bool {
        matches!(self, Self::Dispatched | Self::Running)
    }

    /// Returns `true` if `next` is a legal successor of `self`.
    pub fn can_transition_to(self, next: RequestState) -> bool {
        use RequestState::*;
        matches!(
            (self, next),
            (Queued, Dispatched)
                | (Queued, Rejected)
                | (Dispatched, Running)
                | (Dispatched, Completed)
                | (Dispatched, Failed)
                | (Dispatched, Preempted)
                | (Dispatched, Queued)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Preempted)
                | (Running, Queued)
                | (Preempted, Queued)
                | (Preempted, Failed)
        )
    }
}

impl fmt::Display for RequestState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Queued => "queued",
            Self::Dispatched => "dispatched",
            Self::Running => "running",
            Self::Preempted => "preempted",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Rejected => "rejected",
        };
        f.write_str(s)
    }
}

/// Generation options forwarded to the provider untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InvocationOptions {
    /// Maximum tokens to generate. `None` uses the provider default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    /// Sampling temperature. `None` uses the provider default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
}

/// Provider-call parameters. The scheduler never inspects these.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvocationPayload {
    /// Model identifier understood by the provider (e.g. `"gpt-4o"`).
    pub model: String,
    /// Prompt text. Never logged.
    pub prompt: String,
    /// Generation options.
    #[serde(default)]
    pub options: InvocationOptions,
}

impl InvocationPayload {
    /// Build a payload with default options.
    pub fn new(model: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            prompt: prompt.into(),
            options: InvocationOptions::default(),
        }
    }
}

/// An authenticated but not yet classified request, as delivered by the
/// API layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawRequest {
    /// Tenant that submitted the request.
    pub tenant_id: TenantId,
    /// `"realtime"` or `"task"`. Anything else is rejected by the classifier.
    #[serde(default)]
    pub request_type: Option<String>,
    /// Provider-call parameters.
    pub payload: InvocationPayload,
}

/// A classified request plus its mutable scheduling state.
#[derive(Debug, Clone)]
pub struct Request {
    id: RequestId,
    tenant_id: TenantId,
    class: RequestClass,
    payload: std::sync::Arc<InvocationPayload>,
    submitted_at: Instant,
    submitted_wall: chrono::DateTime<chrono::Utc>,
    /// Current lifecycle state.
    pub state: RequestState,
    attempts: u32,
}

impl Request {
    /// Create a freshly classified request in the `Queued` state.
    pub fn new(tenant_id: TenantId, class: RequestClass, payload: InvocationPayload) -> Self {
        Self {
            id: RequestId::new(),
            tenant_id,
            class,
            payload: std::sync::Arc::new(payload),
            submitted_at: Instant::now(),
            submitted_wall: chrono::Utc::now(),
            state: RequestState::Queued,
            attempts: 0,
        }
    }

    /// Unique identifier.
    pub fn id(&self) -> RequestId {
        self.id
    }

    /// Owning tenant.
    pub fn tenant_id(&self) -> &TenantId {
        &self.tenant_id
    }

    /// Traffic class, fixed at admission.
    pub fn class(&self) -> RequestClass {
        self.class
    }

    /// Shared handle to the provider payload.
    pub fn payload(&self) -> std::sync::Arc<InvocationPayload> {
        std::sync::Arc::clone(&self.payload)
    }

    /// Monotonic admission timestamp used for FIFO ordering.
    pub fn submitted_at(&self) -> Instant {
        self.submitted_at
    }

    /// Wall-clock admission timestamp used in persisted records.
    pub fn submitted_wall(&self) -> chrono::DateTime<chrono::Utc> {
        self.submitted_wall
    }

    /// Number of interrupted dispatch attempts (preemptions and transient failures).
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Record one interrupted attempt and return the new count.
    pub fn record_attempt(&mut self) -> u32 {
        self.attempts = self.attempts.saturating_add(1);
        self.attempts
    }
    /// Mark a request turned away at admission. Returns `false` once it has
    /// left `Queued`.
    pub fn reject(&mut self) -> bool {
        if !self.state.can_transition_to(RequestState::Rejected) {
            return false;
        }
        self.state = RequestState::Rejected;
        true
    }
}

//! # hybrid-scheduler
//!
//! Admission control and scheduling for a finite pool of model-invocation
//! capacity shared by interactive **realtime** calls and batch **task** calls.
//!
//! ## Architecture
//!
//! ```text
//! RawRequest → classify → admit ─┬─ realtime queue ─┐
//!                                └─ task queue ─────┴→ dispatch → ProviderInvoker
//!                                         ▲                            │
//!                controller (ceiling) ────┘◄── latency / completion ───┘
//! ```
//!
//! Realtime work always wins a free slot. Task work runs under a dynamic
//! ceiling that shrinks under realtime load, never drops below a floor
//! (outside latency shedding), and ramps back up once realtime traffic is idle.

// ── Lint policy ───────────────────────────────────────────────────────────
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![deny(clippy::todo)]
#![deny(missing_docs)]

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing_subscriber::EnvFilter;

pub mod capacity;
pub mod classifier;
pub mod config;
pub mod controller;
pub mod dispatcher;
pub mod metrics;
pub mod metrics_server;
pub mod preemption;
pub mod provider;
pub mod queue;
pub mod request;
pub mod scheduler;
pub mod store;

// Re-exports for convenience
pub use config::{LogFormat, SchedulerConfig};
pub use dispatcher::SchedulerSnapshot;
pub use provider::{
    EchoProvider, HttpProvider, InvocationOutcome, ProviderError, ProviderErrorKind,
    ProviderInvoker,
};
pub use request::{InvocationPayload, RawRequest, RequestClass, RequestId, RequestState, TenantId};
pub use scheduler::{HybridScheduler, Submission};
pub use store::{InMemoryTaskStore, StoreError, TaskRecord, TaskStore};

/// Initialise the global tracing subscriber.
///
/// The `LOG_FORMAT` environment variable (`"json"` or `"pretty"`) overrides
/// `default_format`, which usually comes from `[observability] log_format`.
/// Filter level is controlled by `RUST_LOG` (e.g. `RUST_LOG=info`).
///
/// # Errors
///
/// Returns [`SchedulerError::Observability`] if the global subscriber has
/// already been set (e.g. by a previous call or a test harness).
///
/// # Panics
///
/// This function never panics.
///
/// # Example
///
/// ```no_run
/// # use hybrid_scheduler::{init_tracing, LogFormat, SchedulerError};
/// # fn example() -> Result<(), SchedulerError> {
/// init_tracing(LogFormat::Pretty)?;
/// # Ok(()) }
/// ```
pub fn init_tracing(default_format: LogFormat) -> Result<(), SchedulerError> {
    let format = match std::env::var("LOG_FORMAT").as_deref() {
        Ok("json") => LogFormat::Json,
        Ok("pretty") => LogFormat::Pretty,
        _ => default_format,
    };

    let result = match format {
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(EnvFilter::from_default_env())
            .with_current_span(true)
            .with_span_list(true)
            .try_init(),
        LogFormat::Pretty => tracing_subscriber::fmt()
            .pretty()
            .with_env_filter(EnvFilter::from_default_env())
            .try_init(),
    };

    result.map_err(|e| SchedulerError::Observability(format!("tracing init failed: {e}")))
}

/// Coarse error classification, persisted in failed task records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Malformed or unclassifiable request.
    InvalidRequest,
    /// Queue full at admission.
    Overloaded,
    /// Retryable provider failure.
    ProviderTransient,
    /// Non-retryable provider failure.
    ProviderPermanent,
    /// Cancelled (preemption past the retry bound).
    Cancelled,
    /// Scheduler bookkeeping corrupted.
    Internal,
    /// Scheduler is shutting down.
    ShuttingDown,
    /// Unknown task id.
    TaskNotFound,
    /// Task store failure.
    Store,
    /// Invalid configuration.
    Config,
    /// Logging or metrics setup failure.
    Observability,
}

/// Top-level scheduler errors.
///
/// All variants implement `std::error::Error` via [`thiserror`].
#[derive(Error, Debug)]
pub enum SchedulerError {
    /// `request_type` is missing or unrecognised.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// The class queue is at its maximum depth.
    #[error("{class} queue is full")]
    Overloaded {
        /// Class whose queue rejected the request.
        class: RequestClass,
    },

    /// The provider call failed.
    #[error(transparent)]
    Provider(#[from] ProviderError),

    /// The provider call was cancelled.
    #[error("request cancelled")]
    Cancelled,

    /// Scheduler bookkeeping is corrupted; the scheduler rejects all further work.
    #[error("internal scheduler error: {0}")]
    Internal(String),

    /// The scheduler no longer accepts work.
    #[error("scheduler is shutting down")]
    ShuttingDown,

    /// No status exists for this task id.
    #[error("task {0} not found")]
    TaskNotFound(RequestId),

    /// The task store failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// A configuration value is missing or invalid (e.g., missing env var).
    ///
    /// Returned at construction time so that misconfiguration surfaces
    /// immediately rather than at the first provider call.
    #[error("configuration error: {0}")]
    Config(String),

    /// Logging or metrics could not be initialised.
    #[error("observability error: {0}")]
    Observability(String),
}

impl SchedulerError {
    /// Coarse classification of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidRequest(_) => ErrorKind::InvalidRequest,
            Self::Overloaded { .. } => ErrorKind::Overloaded,
            Self::Provider(e) => match e.kind {
                ProviderErrorKind::Transient => ErrorKind::ProviderTransient,
                ProviderErrorKind::Permanent => ErrorKind::ProviderPermanent,
            },
            Self::Cancelled => ErrorKind::Cancelled,
            Self::Internal(_) => ErrorKind::Internal,
            Self::ShuttingDown => ErrorKind::ShuttingDown,
            Self::TaskNotFound(_) => ErrorKind::TaskNotFound,
            Self::Store(_) => ErrorKind::Store,
            Self::Config(_) => ErrorKind::Config,
            Self::Observability(_) => ErrorKind::Observability,
        }
    }
}

//! # Scheduler Configuration
//!
//! ## Responsibility
//! Parse, validate, and hot-reload TOML scheduler configuration files.
//! ```text
//! hybrid-scheduler scheduler.toml
//! ```
//!
//! ## Guarantees
//! - Deterministic: same TOML input always produces the same `SchedulerConfig`
//! - Complete defaults: an empty file is a valid configuration
//! - Validated: all semantic constraints are checked before a config is accepted
//! - Hot-reloadable: file changes are detected and validated before applying
//! - Schema-exportable: JSON Schema output enables IDE autocomplete
//!
//! ## NOT Responsible For
//! - Applying tuning to a running scheduler (that belongs to `scheduler`)
//! - Building provider clients (that belongs to `provider`)

pub mod loader;
pub mod validation;
pub mod watcher;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub use crate::preemption::PreemptionPolicy;

// ── Default value functions ──────────────────────────────────────────────

/// Default total invocation slots: 16.
fn default_total() -> usize {
    16
}

/// Default slots withheld from task work under realtime demand: 2.
fn default_reserve() -> usize {
    2
}

/// Default minimum task ceiling: 1.
fn default_task_floor() -> usize {
    1
}

/// Default realtime queue bound: 256.
fn default_realtime_max_depth() -> usize {
    256
}

/// Default task queue bound: 10 000.
fn default_task_max_depth() -> usize {
    10_000
}

/// Default controller tick: 1000ms.
fn default_tick_interval_ms() -> u64 {
    1000
}

/// Default idle window before ramp-up: 5000ms.
fn default_idle_window_ms() -> u64 {
    5000
}

/// Default ramp step per tick: 1 slot.
fn default_ramp_step() -> usize {
    1
}

/// Default EWMA smoothing factor: 0.2.
fn default_ewma_alpha() -> f64 {
    0.2
}

/// Default shedding threshold: 2000ms.
fn default_latency_threshold_ms() -> u64 {
    2000
}

/// Default hard preemption threshold: 5000ms.
fn default_severe_latency_threshold_ms() -> u64 {
    5000
}

/// Default ceiling cut on shedding: 50%.
fn default_shed_fraction() -> f64 {
    0.5
}

/// Default recovery point: 80% of the threshold.
fn default_recovery_ratio() -> f64 {
    0.8
}

/// Default retry bound: 3.
fn default_retry_bound() -> u32 {
    3
}

fn default_model() -> String {
    "echo".to_string()
}

/// Default provider timeout: 30 000ms.
fn default_provider_timeout_ms() -> u64 {
    30_000
}

fn default_max_tokens() -> u32 {
    4096
}

fn default_temperature() -> f32 {
    0.7
}

/// Default echo delay: 10ms.
fn default_echo_delay_ms() -> u64 {
    10
}

// ── Top-level config ─────────────────────────────────────────────────────

/// Root configuration for a scheduler instance.
///
/// Every section is optional; omitted sections take their defaults.
///
/// # Example
///
/// ```toml
/// [capacity]
/// total = 10
/// reserve = 2
/// task_floor = 1
///
/// [preemption]
/// policy = "aggressive"
///
/// [provider]
/// kind = "anthropic"
/// model = "claude-3-5-sonnet-20241022"
/// ```
///
/// # Panics
///
/// This type never panics during construction or access.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct SchedulerConfig {
    /// Capacity pool and partition settings.
    #[serde(default)]
    pub capacity: CapacityConfig,
    /// Per-class queue bounds.
    #[serde(default)]
    pub queues: QueueConfig,
    /// Concurrency controller tuning.
    #[serde(default)]
    pub controller: ControllerConfig,
    /// Hard preemption and retry settings.
    #[serde(default)]
    pub preemption: PreemptionConfig,
    /// Provider backend.
    #[serde(default)]
    pub provider: ProviderConfig,
    /// Observability: logging, metrics.
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

// ── Capacity ─────────────────────────────────────────────────────────────

/// Capacity pool configuration.
///
/// `total` is fixed for the lifetime of a scheduler; reloads that change it
/// are logged and ignored.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct CapacityConfig {
    /// Maximum concurrent provider invocations.
    #[serde(default = "default_total")]
    pub total: usize,
    /// Slots withheld from task work whenever realtime demand exists.
    #[serde(default = "default_reserve")]
    pub reserve: usize,
    /// Guaranteed task ceiling outside the shedding state. Must be > 0.
    #[serde(default = "default_task_floor")]
    pub task_floor: usize,
}

impl Default for CapacityConfig {
    fn default() -> Self {
        Self {
            total: default_total(),
            reserve: default_reserve(),
            task_floor: default_task_floor(),
        }
    }
}

// ── Queues ───────────────────────────────────────────────────────────────

/// Queue bounds. Admission fails with `Overloaded` at the bound.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct QueueConfig {
    /// Maximum queued realtime requests.
    #[serde(default = "default_realtime_max_depth")]
    pub realtime_max_depth: usize,
    /// Maximum queued task requests.
    #[serde(default = "default_task_max_depth")]
    pub task_max_depth: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            realtime_max_depth: default_realtime_max_depth(),
            task_max_depth: default_task_max_depth(),
        }
    }
}

// ── Controller ───────────────────────────────────────────────────────────

/// Concurrency controller configuration.
///
/// # Panics
///
/// This type never panics.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct ControllerConfig {
    /// Period of the controller tick in milliseconds.
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
    /// Realtime-idle time (ms) before the task ceiling ramps up.
    #[serde(default = "default_idle_window_ms")]
    pub idle_window_ms: u64,
    /// Ceiling increase per tick while idle.
    #[serde(default = "default_ramp_step")]
    pub ramp_step: usize,
    /// EWMA smoothing factor, in `(0.0, 1.0]`.
    #[serde(default = "default_ewma_alpha")]
    pub ewma_alpha: f64,
    /// Realtime EWMA latency (ms) above which task capacity is shed.
    #[serde(default = "default_latency_threshold_ms")]
    pub latency_threshold_ms: u64,
    /// Realtime EWMA latency (ms) above which the adaptive policy cancels task calls.
    #[serde(default = "default_severe_latency_threshold_ms")]
    pub severe_latency_threshold_ms: u64,
    /// Fraction of the ceiling removed when shedding starts, in `(0.0, 1.0]`.
    #[serde(default = "default_shed_fraction")]
    pub shed_fraction: f64,
    /// Shedding ends at `recovery_ratio * latency_threshold`, in `(0.0, 1.0]`.
    #[serde(default = "default_recovery_ratio")]
    pub recovery_ratio: f64,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: default_tick_interval_ms(),
            idle_window_ms: default_idle_window_ms(),
            ramp_step: default_ramp_step(),
            ewma_alpha: default_ewma_alpha(),
            latency_threshold_ms: default_latency_threshold_ms(),
            severe_latency_threshold_ms: default_severe_latency_threshold_ms(),
            shed_fraction: default_shed_fraction(),
            recovery_ratio: default_recovery_ratio(),
        }
    }
}

// ── Preemption ───────────────────────────────────────────────────────────

/// Preemption configuration.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct PreemptionConfig {
    /// When running task calls may be cancelled.
    #[serde(default)]
    pub policy: PreemptionPolicy,
    /// Interrupted attempts a task may accumulate before it fails.
    #[serde(default = "default_retry_bound")]
    pub retry_bound: u32,
}

impl Default for PreemptionConfig {
    fn default() -> Self {
        Self {
            policy: PreemptionPolicy::default(),
            retry_bound: default_retry_bound(),
        }
    }
}

// ── Provider ─────────────────────────────────────────────────────────────

/// Provider backend configuration.
///
/// API keys are never read from the config file; see [`crate::provider`]
/// for the environment variables.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct ProviderConfig {
    /// Which provider backend to use.
    #[serde(default)]
    pub kind: ProviderKind,
    /// Model used by the demo binary when a request does not name one.
    #[serde(default = "default_model")]
    pub model: String,
    /// Override of the provider's API base URL.
    #[serde(default)]
    pub base_url: Option<String>,
    /// Per-call timeout in milliseconds.
    #[serde(default = "default_provider_timeout_ms")]
    pub timeout_ms: u64,
    /// Default maximum tokens when a request does not set one.
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    /// Default temperature when a request does not set one.
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    /// Simulated latency of the echo provider in milliseconds.
    #[serde(default = "default_echo_delay_ms")]
    pub echo_delay_ms: u64,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            kind: ProviderKind::default(),
            model: default_model(),
            base_url: None,
            timeout_ms: default_provider_timeout_ms(),
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
            echo_delay_ms: default_echo_delay_ms(),
        }
    }
}

/// Supported provider backends.
///
/// # Panics
///
/// This type never panics.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    /// OpenAI chat completions API.
    #[serde(rename = "openai", alias = "open_ai")]
    OpenAi,
    /// Anthropic messages API.
    Anthropic,
    /// Google Gemini generateContent API.
    Gemini,
    /// DeepSeek chat completions API.
    #[serde(rename = "deepseek", alias = "deep_seek")]
    DeepSeek,
    /// Echo provider for testing: returns the prompt.
    #[default]
    Echo,
}

// ── Observability ────────────────────────────────────────────────────────

/// Observability configuration: logging and metrics endpoint.
///
/// # Panics
///
/// This type never panics.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct ObservabilityConfig {
    /// Log output format when `LOG_FORMAT` is unset.
    #[serde(default)]
    pub log_format: LogFormat,
    /// Port for the Prometheus metrics HTTP endpoint. `None` disables it.
    #[serde(default)]
    pub metrics_port: Option<u16>,
}

/// Log output format.
///
/// # Panics
///
/// This type never panics.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    /// Human-readable, colorized log output.
    #[default]
    Pretty,
    /// Structured JSON log output for machine consumption.
    Json,
}

/// Export the JSON Schema for `SchedulerConfig`.
///
/// This enables IDE autocomplete when editing TOML config files.
///
/// # Errors
///
/// Returns `serde_json::Error` if schema serialization fails (should not
/// happen with well-formed derive macros).
///
/// # Panics
///
/// This function never panics.
pub fn export_schema() -> Result<String, serde_json::Error> {
    let schema = schemars::schema_for!(SchedulerConfig);
    serde_json::to_string_pretty(&schema)
}

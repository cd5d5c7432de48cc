//! Configuration validation engine.
//!
//! ## Responsibility
//! Validate semantic constraints on a parsed [`SchedulerConfig`] that cannot
//! be expressed through the type system alone (e.g., range checks, cross-field
//! invariants).
//!
//! ## Guarantees
//! - Every validation rule has at least one test that triggers it
//! - Validation collects *all* errors before returning (no short-circuit)
//! - Error messages include the field path and the invalid value
//!
//! ## NOT Responsible For
//! - Parsing TOML (that belongs to `loader`)
//! - File I/O (that belongs to `loader`)

use super::SchedulerConfig;

/// Errors arising from configuration parsing, validation, or I/O.
///
/// # Panics
///
/// This type never panics.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// TOML parsing failed.
    #[error("Parse error in {file}: {source}")]
    Parse {
        /// Path of the file that failed to parse.
        file: String,
        /// Underlying TOML deserialization error.
        #[source]
        source: toml::de::Error,
    },

    /// One or more semantic validation rules failed.
    #[error("Validation failed: {0}")]
    Validation(String),

    /// A specific field has an out-of-range or contradictory value.
    #[error("Field '{field}' has invalid value {value}: {reason}")]
    InvalidField {
        /// Dot-separated field path (e.g., "capacity.task_floor").
        field: String,
        /// String representation of the invalid value.
        value: String,
        /// Human-readable explanation of the constraint.
        reason: String,
    },

    /// File I/O error.
    #[error("IO error reading {file}: {source}")]
    Io {
        /// Path of the file that could not be read.
        file: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}

fn invalid(field: &str, value: impl ToString, reason: &str) -> ConfigError {
    ConfigError::InvalidField {
        field: field.into(),
        value: value.to_string(),
        reason: reason.into(),
    }
}

fn in_unit_interval(x: f64) -> bool {
    x > 0.0 && x <= 1.0
}

/// Validate all semantic constraints on a [`SchedulerConfig`].
///
/// Collects every violation before returning so the caller sees the full
/// scope of issues at once.
///
/// # Returns
///
/// - `Ok(())` if all constraints pass.
/// - `Err(Vec<ConfigError>)` with every violation found.
///
/// # Panics
///
/// This function never panics.
pub fn validate(config: &SchedulerConfig) -> Result<(), Vec<ConfigError>> {
    let mut errors = Vec::new();

    // ── Capacity ─────────────────────────────────────────────────────
    let cap = &config.capacity;
    if cap.total == 0 {
        errors.push(invalid("capacity.total", 0, "must be at least 1"));
    }
    if cap.task_floor == 0 {
        errors.push(invalid(
            "capacity.task_floor",
            0,
            "must be at least 1 so task work never starves",
        ));
    }
    if cap.total > 0 && cap.task_floor > cap.total {
        errors.push(invalid(
            "capacity.task_floor",
            cap.task_floor,
            "must be \u{2264} capacity.total",
        ));
    }
    if cap.reserve > cap.total {
        errors.push(invalid(
            "capacity.reserve",
            cap.reserve,
            "must be \u{2264} capacity.total",
        ));
    }

    // ── Queues ───────────────────────────────────────────────────────
    if config.queues.realtime_max_depth == 0 {
        errors.push(invalid("queues.realtime_max_depth", 0, "must be at least 1"));
    }
    if config.queues.task_max_depth == 0 {
        errors.push(invalid("queues.task_max_depth", 0, "must be at least 1"));
    }

    // ── Controller ───────────────────────────────────────────────────
    let ctl = &config.controller;
    if ctl.tick_interval_ms == 0 {
        errors.push(invalid("controller.tick_interval_ms", 0, "must be at least 1ms"));
    }
    if ctl.ramp_step == 0 {
        errors.push(invalid("controller.ramp_step", 0, "must be at least 1"));
    }
    if !in_unit_interval(ctl.ewma_alpha) {
        errors.push(invalid(
            "controller.ewma_alpha",
            ctl.ewma_alpha,
            "must be in (0.0, 1.0]",
        ));
    }
    if ctl.latency_threshold_ms == 0 {
        errors.push(invalid("controller.latency_threshold_ms", 0, "must be at least 1ms"));
    }
    if ctl.severe_latency_threshold_ms < ctl.latency_threshold_ms {
        errors.push(invalid(
            "controller.severe_latency_threshold_ms",
            ctl.severe_latency_threshold_ms,
            "must be \u{2265} latency_threshold_ms",
        ));
    }
    if !in_unit_interval(ctl.shed_fraction) {
        errors.push(invalid(
            "controller.shed_fraction",
            ctl.shed_fraction,
            "must be in (0.0, 1.0]",
        ));
    }
    if !in_unit_interval(ctl.recovery_ratio) {
        errors.push(invalid(
            "controller.recovery_ratio",
            ctl.recovery_ratio,
            "must be in (0.0, 1.0]",
        ));
    }

    // ── Provider ─────────────────────────────────────────────────────
    let provider = &config.provider;
    if provider.model.trim().is_empty() {
        errors.push(invalid("provider.model", "", "model name must not be empty"));
    }
    if provider.timeout_ms == 0 {
        errors.push(invalid("provider.timeout_ms", 0, "must be at least 1ms"));
    }
    if !(0.0..=2.0).contains(&provider.temperature) {
        errors.push(invalid(
            "provider.temperature",
            provider.temperature,
            "must be between 0.0 and 2.0",
        ));
    }
    if let Some(url) = &provider.base_url {
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            errors.push(invalid(
                "provider.base_url",
                url,
                "must start with http:// or https://",
            ));
        }
    }

    // ── Metrics port range ──────────────────────────────────────────
    if config.observability.metrics_port == Some(0) {
        errors.push(invalid(
            "observability.metrics_port",
            0,
            "metrics port must be at least 1",
        ));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

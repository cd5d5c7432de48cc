//! Configuration file loading.
//!
//! ## Responsibility
//! Read a TOML file from disk, parse it into a [`SchedulerConfig`], and run
//! validation before returning. This is the primary entry point for loading
//! scheduler configuration at startup.
//!
//! ## Guarantees
//! - A successfully loaded config is always validated
//! - I/O errors and parse errors are distinguished in the error type
//! - File path is included in every error message
//!
//! ## NOT Responsible For
//! - Hot-reloading on file changes (that belongs to `watcher`)
//! - Defining the config schema (that belongs to `mod.rs`)

use std::path::Path;

use super::validation::{self, ConfigError};
use super::SchedulerConfig;

/// Load a [`SchedulerConfig`] from a TOML file.
///
/// # Returns
///
/// - `Ok(SchedulerConfig)` if the file is readable, well-formed, and valid.
/// - `Err(ConfigError::Io)` if the file cannot be read.
/// - `Err(ConfigError::Parse)` if the TOML is malformed.
/// - `Err(ConfigError::Validation)` if semantic constraints are violated.
///
/// # Panics
///
/// This function never panics.
///
/// # Example
///
/// ```rust,ignore
/// use hybrid_scheduler::config::loader::load_from_file;
/// use std::path::Path;
///
/// let config = load_from_file(Path::new("scheduler.toml"))?;
/// println!("total capacity: {}", config.capacity.total);
/// ```
pub fn load_from_file(path: &Path) -> Result<SchedulerConfig, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
        file: path.display().to_string(),
        source: e,
    })?;

    load_from_str(&content, &path.display().to_string())
}

/// Load a [`SchedulerConfig`] from a TOML string.
///
/// `source_name` identifies the source in error messages.
///
/// # Panics
///
/// This function never panics.
pub fn load_from_str(content: &str, source_name: &str) -> Result<SchedulerConfig, ConfigError> {
    let config: SchedulerConfig = toml::from_str(content).map_err(|e| ConfigError::Parse {
        file: source_name.to_string(),
        source: e,
    })?;

    validation::validate(&config).map_err(join_errors)?;

    Ok(config)
}

/// Collapse a list of violations into a single [`ConfigError::Validation`].
pub fn join_errors(errors: Vec<ConfigError>) -> ConfigError {
    ConfigError::Validation(
        errors
            .iter()
            .map(|e| e.to_string())
            .collect::<Vec<_>>()
            .join("\n"),
    )
}

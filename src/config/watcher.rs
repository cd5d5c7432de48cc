//! Configuration hot-reload watcher.
//!
//! ## Responsibility
//! Watch a TOML config file for changes and broadcast validated new configs
//! to subscribers. Invalid reloads are logged and rejected; the current
//! config remains unchanged.
//!
//! ## Guarantees
//! - Only validated configs are broadcast
//! - Invalid file edits are logged but do not disrupt the running scheduler
//! - File watching is debounced to avoid rapid re-reads on multi-write editors
//! - Dropping the [`ConfigWatcher`] stops the background reload task
//!
//! ## NOT Responsible For
//! - Applying the config (see `HybridScheduler::watch_config`)
//! - Initial config loading (that belongs to `loader`)

use std::path::{Path, PathBuf};
use std::time::Duration;

use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::broadcast;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, info, warn};

use super::loader::load_from_file;
use super::validation::ConfigError;
use super::SchedulerConfig;

const DEBOUNCE: Duration = Duration::from_millis(500);
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Watches a config file for changes and broadcasts validated updates.
///
/// # Panics
///
/// This type never panics.
pub struct ConfigWatcher {
    tx: broadcast::Sender<SchedulerConfig>,
    path: PathBuf,
    // Dropping either of these stops watching.
    _watcher: RecommendedWatcher,
    _stop: DropGuard,
}

impl ConfigWatcher {
    /// Start watching `path`. Must be called inside a Tokio runtime.
    ///
    /// The initial config is **not** broadcast; use `loader::load_from_file`
    /// for the initial load.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Io`] if the file watcher cannot be created or
    /// the parent directory cannot be watched.
    ///
    /// # Example
    ///
    /// ```rust,ignore
    /// use hybrid_scheduler::config::watcher::ConfigWatcher;
    /// use std::path::PathBuf;
    ///
    /// let (watcher, mut rx) = ConfigWatcher::new(PathBuf::from("scheduler.toml"))?;
    /// tokio::spawn(async move {
    ///     while let Ok(config) = rx.recv().await {
    ///         println!("reloaded, total = {}", config.capacity.total);
    ///     }
    /// });
    /// ```
    pub fn new(
        path: PathBuf,
    ) -> Result<(Self, broadcast::Receiver<SchedulerConfig>), ConfigError> {
        let (tx, rx) = broadcast::channel(8);
        let (notify_tx, notify_rx) = std::sync::mpsc::channel();

        let mut watcher = RecommendedWatcher::new(
            move |res: Result<notify::Event, notify::Error>| {
                if let Ok(event) = res {
                    let _ = notify_tx.send(event);
                }
            },
            notify::Config::default(),
        )
        .map_err(|e| ConfigError::Io {
            file: path.display().to_string(),
            source: std::io::Error::other(e.to_string()),
        })?;

        // Watch the parent directory to handle editors that do atomic saves
        // (write temp file, rename over original).
        let watch_dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        watcher
            .watch(&watch_dir, RecursiveMode::NonRecursive)
            .map_err(|e| ConfigError::Io {
                file: watch_dir.display().to_string(),
                source: std::io::Error::other(e.to_string()),
            })?;

        let stop = CancellationToken::new();
        tokio::spawn(reload_loop(
            path.clone(),
            notify_rx,
            tx.clone(),
            stop.clone(),
        ));

        Ok((
            Self {
                tx,
                path,
                _watcher: watcher,
                _stop: stop.drop_guard(),
            },
            rx,
        ))
    }

    /// Subscribe to config change notifications.
    ///
    /// Multiple subscribers are supported.
    pub fn subscribe(&self) -> broadcast::Receiver<SchedulerConfig> {
        self.tx.subscribe()
    }

    /// Path of the watched file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

async fn reload_loop(
    path: PathBuf,
    events: std::sync::mpsc::Receiver<notify::Event>,
    tx: broadcast::Sender<SchedulerConfig>,
    stop: CancellationToken,
) {
    let mut last_reload = std::time::Instant::now()
        .checked_sub(DEBOUNCE)
        .unwrap_or_else(std::time::Instant::now);

    loop {
        tokio::select! {
            _ = stop.cancelled() => {
                debug!(path = %path.display(), "config watcher stopped");
                return;
            }
            _ = tokio::time::sleep(POLL_INTERVAL) => {}
        }

        let mut should_reload = false;
        while let Ok(event) = events.try_recv() {
            if matches!(event.kind, EventKind::Modify(_) | EventKind::Create(_))
                && event.paths.iter().any(|p| p.file_name() == path.file_name())
            {
                should_reload = true;
            }
        }

        if should_reload && last_reload.elapsed() >= DEBOUNCE {
            last_reload = std::time::Instant::now();
            match load_from_file(&path) {
                Ok(config) => {
                    info!(
                        path = %path.display(),
                        total = config.capacity.total,
                        policy = config.preemption.policy.as_str(),
                        "config reloaded successfully"
                    );
                    // No receivers is fine; the config was still validated.
                    let _ = tx.send(config);
                }
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        error = %e,
                        "config reload rejected, keeping current config"
                    );
                }
            }
        }
    }
}

//! Demo binary for hybrid-scheduler
//!
//! Starts a scheduler, pushes mixed realtime and task traffic through it,
//! then prints the scheduler snapshot and Prometheus metrics.
//!
//! ## Usage
//!
//! ```text
//! hybrid-scheduler [path/to/scheduler.toml]
//! ```
//!
//! When a config path is given, the file is watched and controller
//! parameters are hot-applied on change.
//!
//! ## Environment Variables
//!
//! - `LOG_FORMAT=json`: structured JSON output (production)
//! - `RUST_LOG=info`: log level filter

use std::path::PathBuf;
use std::time::Duration;

use hybrid_scheduler::config::loader::load_from_file;
use hybrid_scheduler::config::watcher::ConfigWatcher;
use hybrid_scheduler::{
    init_tracing, metrics, metrics_server, HybridScheduler, InvocationPayload, SchedulerConfig,
    TenantId,
};
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = match &config_path {
        Some(path) => load_from_file(path)?,
        None => SchedulerConfig::default(),
    };

    // A subscriber may already be installed; keep going either way.
    let _ = init_tracing(config.observability.log_format);
    metrics::init_metrics()?;

    let model = config.provider.model.clone();
    let scheduler = HybridScheduler::from_config(config.clone())?;
    let ticker = scheduler.spawn_ticker();

    let _watcher = match config_path {
        Some(path) => {
            let (watcher, updates) = ConfigWatcher::new(path)?;
            let _reload = scheduler.watch_config(updates);
            Some(watcher)
        }
        None => None,
    };

    if let Some(port) = config.observability.metrics_port {
        let addr = format!("0.0.0.0:{port}");
        let server = scheduler.clone();
        tokio::spawn(async move {
            if let Err(e) = metrics_server::start_server(&addr, server).await {
                warn!(error = %e, "metrics server stopped");
            }
        });
    }

    let tasks = [
        ("tenant-a", "Summarise the quarterly report"),
        ("tenant-b", "Translate the onboarding guide to French"),
        ("tenant-a", "Classify last week's support tickets"),
        ("tenant-c", "Draft release notes for v2.3"),
        ("tenant-b", "Extract action items from the meeting transcript"),
        ("tenant-c", "Generate test questions for chapter 4"),
    ];
    let mut task_ids = Vec::with_capacity(tasks.len());
    for (tenant, prompt) in tasks {
        let id = scheduler
            .submit_task(TenantId::new(tenant), InvocationPayload::new(&model, prompt))
            .await?;
        task_ids.push(id);
    }
    info!(count = task_ids.len(), "tasks submitted");

    let realtime = [
        ("tenant-a", "What is the capital of France?"),
        ("tenant-b", "Write a haiku about programming"),
        ("tenant-c", "How does photosynthesis work?"),
        ("tenant-a", "Follow-up: What about Germany?"),
    ];
    let mut calls = Vec::with_capacity(realtime.len());
    for (tenant, prompt) in realtime {
        let scheduler = scheduler.clone();
        let payload = InvocationPayload::new(&model, prompt);
        calls.push(tokio::spawn(async move {
            scheduler
                .submit_realtime(TenantId::new(tenant), payload)
                .await
        }));
    }
    for call in calls {
        match call.await? {
            Ok(text) => info!(output_len = text.len(), "realtime call completed"),
            Err(e) => warn!(error = %e, kind = ?e.kind(), "realtime call failed"),
        }
    }

    // let the task backlog finish
    tokio::time::sleep(Duration::from_millis(500)).await;

    for id in task_ids {
        let record = scheduler.get_status(id).await?;
        let output = scheduler.get_result(id).await?;
        info!(
            task_id = %id,
            state = %record.state,
            attempts = record.attempts,
            has_result = output.is_some(),
            "task status"
        );
    }

    println!("{}", serde_json::to_string_pretty(&scheduler.metrics_snapshot())?);
    println!("{}", metrics::gather_metrics());

    scheduler.shutdown().await;
    ticker.await?;
    info!("demo complete");

    Ok(())
}

//! Scheduled invocation of bounce runs.
//!
//! Runs fire on a cron schedule. A run still in progress blocks the next
//! trigger; passes never overlap within one process.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{Mutex, RwLock, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::error::ConfigError;
use crate::pipeline::processor::BounceProcessor;
use crate::pipeline::types::RunReport;

/// Counters and last outcome, as shown on the status endpoint.
#[derive(Debug, Clone, Default, Serialize)]
pub struct WorkerStatus {
    pub schedule: String,
    pub runs: u64,
    pub errors: u64,
    pub last_started_at: Option<DateTime<Utc>>,
    pub last_finished_at: Option<DateTime<Utc>>,
    pub last_report: Option<RunReport>,
    pub next_run_at: Option<DateTime<Utc>>,
}

/// Serializes runs of one processor and tracks their outcomes.
pub struct BounceWorker {
    processor: Arc<BounceProcessor>,
    run_lock: Mutex<()>,
    status: RwLock<WorkerStatus>,
}

impl BounceWorker {
    pub fn new(processor: Arc<BounceProcessor>, schedule: &str) -> Self {
        Self {
            processor,
            run_lock: Mutex::new(()),
            status: RwLock::new(WorkerStatus {
                schedule: schedule.to_string(),
                ..Default::default()
            }),
        }
    }

    /// Run one pass now, waiting for any pass already in progress.
    pub async fn trigger(&self) -> RunReport {
        let _guard = self.run_lock.lock().await;

        self.status.write().await.last_started_at = Some(Utc::now());
        let report = self.processor.run().await;

        let mut status = self.status.write().await;
        status.runs += 1;
        if !report.is_success() {
            status.errors += 1;
        }
        status.last_finished_at = Some(Utc::now());
        status.last_report = Some(report.clone());
        report
    }

    pub async fn status(&self) -> WorkerStatus {
        self.status.read().await.clone()
    }

    async fn set_next_run(&self, at: Option<DateTime<Utc>>) {
        self.status.write().await.next_run_at = at;
    }
}

/// Parse a six-field cron expression (`sec min hour day month weekday`).
pub fn parse_schedule(expr: &str) -> Result<cron::Schedule, ConfigError> {
    cron::Schedule::from_str(expr).map_err(|e| ConfigError::InvalidValue {
        key: "BOUNCE_SCHEDULE".into(),
        message: format!("invalid cron: {e}"),
    })
}

/// Running scheduler task plus its stop signal.
pub struct WorkerHandle {
    task: JoinHandle<()>,
    stop: watch::Sender<bool>,
}

impl WorkerHandle {
    /// Ask the worker to stop. A pass already in progress runs to completion.
    pub fn request_stop(&self) {
        self.stop.send_replace(true);
    }

    /// Wait for the worker task to exit.
    pub async fn join(self) {
        if let Err(e) = self.task.await {
            error!("Bounce worker task failed: {e}");
        }
    }

    /// Stop the worker and wait until any in-progress pass has saved.
    pub async fn shutdown(self) {
        self.request_stop();
        self.join().await;
    }
}

/// Spawn a background task that triggers `worker` on `schedule`.
///
/// Waiting for the next fire time is cancelled by [`WorkerHandle::request_stop`];
/// a running pass is not.
pub fn spawn_bounce_worker(worker: Arc<BounceWorker>, schedule: cron::Schedule) -> WorkerHandle {
    let (stop, mut stop_rx) = watch::channel(false);

    let task = tokio::spawn(async move {
        info!("Bounce worker started");

        loop {
            if *stop_rx.borrow() {
                break;
            }

            let Some(next) = schedule.upcoming(Utc).next() else {
                warn!("Schedule has no upcoming fire time, stopping bounce worker");
                worker.set_next_run(None).await;
                return;
            };
            worker.set_next_run(Some(next)).await;

            let wait = (next - Utc::now()).to_std().unwrap_or(Duration::ZERO);
            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                // A dropped handle counts as a stop request.
                changed = stop_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
            }

            let report = worker.trigger().await;
            if !report.is_success() {
                error!("Scheduled bounce run failed; next scheduled run will retry");
            }
        }

        info!("Bounce worker shutting down");
    });

    WorkerHandle { task, stop }
}

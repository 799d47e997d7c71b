//! Backup scheduling: on-demand requests and an optional periodic tick.

use std::future::Future;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval, Interval, MissedTickBehavior};
use tracing::{debug, error, info};

use snapsync_common::{Error, Result};

use crate::state::RunRecord;

/// When the scheduler starts runs on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleMode {
    /// Only explicit requests.
    Manual,
    /// Explicit requests plus one run per interval, starting immediately.
    Periodic { interval: Duration },
}

/// Why a run was started.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    /// Requested through `BackupScheduler::request_run`.
    Requested,
    /// Periodic tick.
    Tick,
}

enum Request {
    Run(oneshot::Sender<Result<RunRecord>>),
    Shutdown,
}

/// Front end for submitting runs to the scheduler worker.
///
/// Runs are serialized: a request issued while a run is in progress waits
/// for it to finish.
#[derive(Clone)]
pub struct BackupScheduler {
    request_tx: mpsc::Sender<Request>,
}

impl BackupScheduler {
    /// Create a scheduler and the worker handle that executes its runs.
    pub fn new(mode: ScheduleMode) -> (Self, SchedulerHandle) {
        let (request_tx, request_rx) = mpsc::channel(16);
        (Self { request_tx }, SchedulerHandle { mode, request_rx })
    }

    /// Ask for a run now and wait for its result.
    pub async fn request_run(&self) -> Result<RunRecord> {
        let (response_tx, response_rx) = oneshot::channel();

        self.request_tx
            .send(Request::Run(response_tx))
            .await
            .map_err(|_| Error::InvalidInput("Scheduler not running".to_string()))?;

        response_rx
            .await
            .map_err(|_| Error::InvalidInput("Scheduler stopped before the run finished".to_string()))?
    }

    /// Stop the worker after the current run.
    pub async fn shutdown(&self) {
        let _ = self.request_tx.send(Request::Shutdown).await;
    }
}

/// Worker side of a `BackupScheduler`.
pub struct SchedulerHandle {
    mode: ScheduleMode,
    request_rx: mpsc::Receiver<Request>,
}

impl SchedulerHandle {
    /// Execute runs until shutdown or until every `BackupScheduler` is dropped.
    ///
    /// `job` is called once per run. Periodic failures are logged; requested
    /// runs hand their result back to the caller.
    pub async fn run<F, Fut>(mut self, job: F)
    where
        F: Fn(Trigger) -> Fut,
        Fut: Future<Output = Result<RunRecord>>,
    {
        let mut ticker = match self.mode {
            ScheduleMode::Periodic { interval: every } => {
                let mut ticker = interval(every);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                Some(ticker)
            }
            ScheduleMode::Manual => None,
        };

        info!("Backup scheduler started ({:?})", self.mode);

        loop {
            tokio::select! {
                biased;

                request = self.request_rx.recv() => match request {
                    Some(Request::Run(response_tx)) => {
                        debug!("Running requested backup");
                        let _ = response_tx.send(job(Trigger::Requested).await);
                    }
                    Some(Request::Shutdown) | None => {
                        info!("Backup scheduler shutting down");
                        break;
                    }
                },

                _ = next_tick(&mut ticker) => {
                    debug!("Running periodic backup");
                    match job(Trigger::Tick).await {
                        Ok(record) => info!(
                            "Periodic backup finished: {:?}, {} changed",
                            record.status,
                            record.changed.len()
                        ),
                        Err(e) => error!("Periodic backup failed: {}", e),
                    }
                }
            }
        }
    }
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}

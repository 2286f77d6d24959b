//! Background processing: the job worker loop and the periodic scheduler.

use crate::services::metrics::record_job;
use crate::services::{subscription_activity, Database, DunningProcessor};
use chrono::{NaiveDate, Utc};
use ledger_service::services::top_up::create_interval_top_ups;
use ledger_service::services::Database as LedgerDatabase;
use service_core::error::AppError;
use service_core::jobs::{Job, JobHandler, JobOutcome, JobQueue};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};

/// Customers examined per dunning pass.
const DUNNING_BATCH_SIZE: i64 = 500;

/// Claims jobs from the configured queues and dispatches them by name.
pub struct Worker {
    queue: Arc<dyn JobQueue>,
    handlers: HashMap<&'static str, Arc<dyn JobHandler>>,
    queues: Vec<String>,
    poll_interval: Duration,
}

impl Worker {
    pub fn new(queue: Arc<dyn JobQueue>, queues: Vec<String>, poll_interval: Duration) -> Self {
        Self {
            queue,
            handlers: HashMap::new(),
            queues,
            poll_interval,
        }
    }

    pub fn register(mut self, handler: Arc<dyn JobHandler>) -> Self {
        self.handlers.insert(handler.name(), handler);
        self
    }

    /// Claim and run a single job. `false` when every queue is empty.
    pub async fn run_once(&self) -> Result<bool, AppError> {
        let Some(job) = self.queue.claim_next(&self.queues).await? else {
            return Ok(false);
        };
        self.execute(&job).await?;
        Ok(true)
    }

    #[instrument(skip(self, job), fields(job_id = %job.id, job = %job.name, attempt = job.attempts))]
    async fn execute(&self, job: &Job) -> Result<(), AppError> {
        let result = match self.handlers.get(job.name.as_str()) {
            Some(handler) => handler.handle(job).await,
            None => Err(AppError::InvariantViolation(anyhow::anyhow!(
                "no handler registered for job '{}'",
                job.name
            ))),
        };

        match result {
            Ok(()) => {
                self.queue.complete(job).await?;
                record_job(&job.name, JobOutcome::Completed.as_str());
                debug!("Job completed");
            }
            Err(e) => {
                let outcome = self.queue.fail(job, &e).await?;
                record_job(&job.name, outcome.as_str());
                match outcome {
                    JobOutcome::Retrying { run_at } => warn!(
                        code = e.error_code(),
                        error = %e,
                        run_at = %run_at,
                        "Job failed, retry scheduled"
                    ),
                    _ => error!(code = e.error_code(), error = %e, "Job failed permanently"),
                }
            }
        }
        Ok(())
    }

    /// Poll until `shutdown` flips to true. Empty polls sleep for the poll interval.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(queues = ?self.queues, handlers = self.handlers.len(), "Worker started");
        loop {
            if *shutdown.borrow() {
                break;
            }
            let idle = match self.run_once().await {
                Ok(processed) => !processed,
                Err(e) => {
                    error!(error = %e, "Worker poll failed");
                    true
                }
            };
            if idle {
                tokio::select! {
                    _ = tokio::time::sleep(self.poll_interval) => {}
                    _ = shutdown.changed() => {}
                }
            }
        }
        info!("Worker stopped");
    }
}

/// Periodic work: enqueue pending subscription activity every tick, and once per UTC
/// day schedule interval wallet top-ups and run dunning.
pub struct Scheduler {
    db: Database,
    ledger_db: LedgerDatabase,
    queue: Arc<dyn JobQueue>,
    dunning: DunningProcessor,
    activity_batch_size: i64,
    tick: Duration,
    last_daily_run: Option<NaiveDate>,
}

impl Scheduler {
    pub fn new(
        db: Database,
        ledger_db: LedgerDatabase,
        queue: Arc<dyn JobQueue>,
        activity_batch_size: i64,
        tick: Duration,
    ) -> Self {
        Self {
            dunning: DunningProcessor::new(db.clone()),
            db,
            ledger_db,
            queue,
            activity_batch_size,
            tick,
            last_daily_run: None,
        }
    }

    #[instrument(skip(self))]
    pub async fn tick(&mut self) -> Result<(), AppError> {
        subscription_activity::enqueue_pending(&self.db, self.activity_batch_size).await?;

        let today = Utc::now().date_naive();
        if self.last_daily_run == Some(today) {
            return Ok(());
        }
        let top_ups = create_interval_top_ups(&self.ledger_db, self.queue.as_ref(), today).await?;
        let payment_requests = self.dunning.process_overdue(DUNNING_BATCH_SIZE).await?;
        self.last_daily_run = Some(today);
        info!(
            date = %today,
            top_ups = top_ups,
            payment_requests = payment_requests,
            "Daily jobs scheduled"
        );
        Ok(())
    }

    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.tick);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.tick().await {
                        error!(code = e.error_code(), error = %e, "Scheduler tick failed");
                    }
                }
                _ = shutdown.changed() => break,
            }
            if *shutdown.borrow() {
                break;
            }
        }
        info!("Scheduler stopped");
    }
}

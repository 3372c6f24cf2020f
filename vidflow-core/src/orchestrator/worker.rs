use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::config::WorkerSection;
use crate::queue::{ProcessingJob, QueueError};

use super::{Orchestrator, OrchestratorResult, ProcessingOutcome};

#[derive(Debug, Clone)]
pub struct WorkerOptions {
    pub name: String,
    pub concurrency: usize,
    pub poll_interval: Duration,
    pub recover_stale_on_start: bool,
    pub lease: Duration,
}

impl WorkerOptions {
    pub fn from_config(section: &WorkerSection) -> Self {
        Self {
            name: format!("worker-{}", std::process::id()),
            concurrency: section.concurrency.max(1),
            poll_interval: section.poll_interval(),
            recover_stale_on_start: section.recover_stale_on_start,
            lease: section.lease(),
        }
    }
}

/// Pulls jobs off the queue and hands them to the orchestrator, with
/// `concurrency` slots polling independently.
#[derive(Debug, Clone)]
pub struct Worker {
    orchestrator: Arc<Orchestrator>,
    options: WorkerOptions,
}

impl Worker {
    pub fn new(orchestrator: Arc<Orchestrator>, options: WorkerOptions) -> Self {
        Self {
            orchestrator,
            options,
        }
    }

    pub fn options(&self) -> &WorkerOptions {
        &self.options
    }

    /// Runs until `shutdown` flips to `true` or its sender is dropped.
    /// In-flight jobs finish before this returns.
    pub async fn run(&self, shutdown: watch::Receiver<bool>) -> OrchestratorResult<usize> {
        self.recover_if_configured()?;
        info!(
            target: "worker",
            name = %self.options.name,
            concurrency = self.options.concurrency,
            "worker started"
        );
        let slots = (0..self.options.concurrency).map(|slot| {
            let shutdown = shutdown.clone();
            let name = format!("{}-{slot}", self.options.name);
            async move { self.slot_loop(name, shutdown).await }
        });
        let processed: usize = join_all(slots).await.into_iter().sum();
        info!(target: "worker", name = %self.options.name, processed, "worker stopped");
        Ok(processed)
    }

    /// Processes queued jobs one at a time until the queue is empty.
    pub async fn drain(&self) -> OrchestratorResult<Vec<ProcessingOutcome>> {
        self.recover_if_configured()?;
        let mut outcomes = Vec::new();
        while let Some(outcome) = self.run_once(&self.options.name).await? {
            outcomes.push(outcome);
        }
        Ok(outcomes)
    }

    /// Claims and processes a single job. `None` when nothing is queued.
    pub async fn run_once(&self, worker: &str) -> OrchestratorResult<Option<ProcessingOutcome>> {
        let queue = self.orchestrator.queue();
        let Some(job) = queue.claim_next(worker, self.options.lease)? else {
            return Ok(None);
        };
        debug!(target: "worker", worker, job_id = job.id, video_id = %job.video_id, "job claimed");
        let outcome = self.process_leased(&job, worker).await;
        match queue.complete(job.id) {
            Ok(()) => {}
            Err(QueueError::NotFound(id)) => {
                warn!(target: "worker", job_id = id, "job vanished before completion");
            }
            Err(err) => return Err(err.into()),
        }
        Ok(Some(outcome))
    }

    /// Runs the job, renewing its lease every third of the lease length.
    async fn process_leased(&self, job: &ProcessingJob, worker: &str) -> ProcessingOutcome {
        let queue = self.orchestrator.queue();
        let period = (self.options.lease / 3).max(Duration::from_millis(10));
        let mut renew = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        let work = self.orchestrator.handle_job(job);
        tokio::pin!(work);
        loop {
            tokio::select! {
                outcome = &mut work => return outcome,
                _ = renew.tick() => {
                    match queue.renew_lease(job.id, worker, self.options.lease) {
                        Ok(true) => debug!(target: "worker", worker, job_id = job.id, "lease renewed"),
                        Ok(false) => {
                            warn!(target: "worker", worker, job_id = job.id, "lease no longer held");
                        }
                        Err(err) => {
                            warn!(
                                target: "worker",
                                worker,
                                job_id = job.id,
                                error = %err,
                                "failed to renew lease"
                            );
                        }
                    }
                }
            }
        }
    }

    fn recover_if_configured(&self) -> OrchestratorResult<()> {
        if self.options.recover_stale_on_start {
            let recovered = self.orchestrator.queue().recover_stale()?;
            if recovered > 0 {
                warn!(target: "worker", recovered, "requeued jobs whose lease expired");
            }
        }
        Ok(())
    }

    async fn slot_loop(&self, name: String, mut shutdown: watch::Receiver<bool>) -> usize {
        let mut processed = 0;
        loop {
            if *shutdown.borrow() {
                break;
            }
            let idle = match self.run_once(&name).await {
                Ok(Some(_)) => {
                    processed += 1;
                    false
                }
                Ok(None) => true,
                Err(err) => {
                    error!(target: "worker", worker = %name, error = %err, "failed to poll queue");
                    true
                }
            };
            if !idle {
                continue;
            }
            tokio::select! {
                _ = tokio::time::sleep(self.options.poll_interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        debug!(target: "worker", worker = %name, processed, "slot stopped");
        processed
    }
}

//! Worker runtime: pulls one job at a time from the queue, claims it in the
//! registry, runs the processor for its kind and publishes the outcome.
//!
//! Per-delivery state machine:
//!
//! ```text
//! IDLE -> LEASE_ACQUIRED -> PROCESSING -> COMMITTING -> IDLE
//!                 |               \
//!                 +-> ABANDONING   +-> ABANDONING -> IDLE
//! ```
//!
//! A successful attempt writes the result blob, then flips the registry to
//! COMPLETED, then acknowledges the delivery. Readers only trust the registry
//! state, so anyone observing COMPLETED can always find the result.

pub mod pool;

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::WorkerSettings;
use crate::db::registry::{JobRegistry, RegistryError};
use crate::models::job::{
    output_key, Disposition, Job, JobPayload, ReleaseOutcome, ResultRecord, WorkerLease,
};
use crate::services::processor::{JobInput, ProcessingError, ProcessorOutput, ProcessorTable};
use crate::services::queue::{Delivery, JobQueue, QueueError, QueuedJob};
use crate::services::retry::{with_backoff, with_backoff_when};
use crate::services::storage::{BlobStore, StorageError};

/// Everything a worker needs, handed over at construction.
#[derive(Clone)]
pub struct WorkerContext {
    pub registry: Arc<dyn JobRegistry>,
    pub queue: Arc<dyn JobQueue>,
    pub store: Arc<dyn BlobStore>,
    pub processors: ProcessorTable,
    pub settings: WorkerSettings,
}

/// Where a worker is in its per-delivery state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerPhase {
    Idle,
    LeaseAcquired,
    Processing,
    Committing,
    Abandoning,
    Stopped,
}

impl WorkerPhase {
    /// Whether the worker currently holds a delivery.
    pub fn is_busy(self) -> bool {
        !matches!(self, WorkerPhase::Idle | WorkerPhase::Stopped)
    }
}

/// What became of one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Completed,
    Requeued,
    Failed,
    /// Claimed elsewhere or lease lost; handed back without a state change.
    Abandoned,
    /// Duplicate of a finished or discarded job; acknowledged and dropped.
    Dropped,
}

/// Why [`WorkerRuntime::run`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerExit {
    Drained,
    IdleTimeout,
}

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

enum Acquired {
    Claimed(Job),
    Settled(Outcome),
}

fn is_infra_error(e: &RegistryError) -> bool {
    matches!(e, RegistryError::Database(_))
}

fn chrono_duration(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration)
        .unwrap_or_else(|_| chrono::Duration::seconds(i32::MAX as i64))
}

pub struct WorkerRuntime {
    id: String,
    ctx: WorkerContext,
    drain: CancellationToken,
    phase: watch::Sender<WorkerPhase>,
}

impl WorkerRuntime {
    pub fn new(id: impl Into<String>, ctx: WorkerContext, drain: CancellationToken) -> Self {
        let (phase, _) = watch::channel(WorkerPhase::Idle);
        Self {
            id: id.into(),
            ctx,
            drain,
            phase,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn subscribe(&self) -> watch::Receiver<WorkerPhase> {
        self.phase.subscribe()
    }

    fn set_phase(&self, phase: WorkerPhase) {
        self.phase.send_replace(phase);
    }

    /// Process jobs until drained (between jobs, never mid-job) or, when
    /// configured, until idle for too long.
    pub async fn run(self) -> WorkerExit {
        tracing::info!(worker_id = %self.id, "Worker ready, starting job processing loop");
        let mut idle_since = Instant::now();

        let exit = loop {
            if self.drain.is_cancelled() {
                break WorkerExit::Drained;
            }

            let pause = match self.poll_once().await {
                Ok(Some(outcome)) => {
                    tracing::debug!(worker_id = %self.id, ?outcome, "Delivery handled");
                    idle_since = Instant::now();
                    continue;
                }
                Ok(None) => {
                    if let Some(limit) = self.ctx.settings.idle_exit {
                        if idle_since.elapsed() >= limit {
                            break WorkerExit::IdleTimeout;
                        }
                    }
                    tracing::trace!(worker_id = %self.id, "No jobs available, sleeping");
                    self.ctx.settings.poll_interval
                }
                Err(e) => {
                    tracing::error!(
                        worker_id = %self.id,
                        error = %e,
                        "Error processing job, will retry"
                    );
                    self.set_phase(WorkerPhase::Idle);
                    self.ctx.settings.poll_interval
                }
            };

            tokio::select! {
                _ = self.drain.cancelled() => break WorkerExit::Drained,
                _ = tokio::time::sleep(pause) => {}
            }
        };

        self.set_phase(WorkerPhase::Stopped);
        tracing::info!(worker_id = %self.id, ?exit, "Worker stopped");
        exit
    }

    /// Take at most one delivery and see it through.
    /// `Ok(None)` when the queue had nothing visible.
    pub async fn poll_once(&self) -> Result<Option<Outcome>, WorkerError> {
        let visibility = self.ctx.settings.visibility_timeout;
        let Some(delivery) = self.ctx.queue.dequeue(visibility).await? else {
            return Ok(None);
        };

        self.set_phase(WorkerPhase::LeaseAcquired);
        let outcome = self.handle(&delivery).await;
        self.set_phase(WorkerPhase::Idle);
        outcome.map(Some)
    }

    async fn handle(&self, delivery: &Delivery) -> Result<Outcome, WorkerError> {
        let job = match self.acquire(delivery).await? {
            Acquired::Claimed(job) => job,
            Acquired::Settled(outcome) => return Ok(outcome),
        };

        let acquired_at = Utc::now();
        let lease = WorkerLease {
            job_id: job.id,
            worker_id: self.id.clone(),
            attempt: job.attempt_count,
            acquired_at,
            deadline: job
                .lease_deadline
                .unwrap_or(acquired_at + chrono_duration(self.ctx.settings.visibility_timeout)),
        };
        tracing::info!(
            job_id = %lease.job_id,
            worker_id = %self.id,
            attempt = lease.attempt,
            kind = %job.kind,
            "Processing job"
        );

        self.set_phase(WorkerPhase::Processing);
        let started = Instant::now();
        let result = match self.resolve_input(&job.payload).await {
            Ok(input) => self.execute(delivery, &lease, input).await,
            Err(e) => Attempt::Failed(e),
        };
        let elapsed = started.elapsed();

        match result {
            Attempt::Succeeded(output) => self.commit(delivery, &lease, output, elapsed).await,
            Attempt::Failed(ProcessingError::Fatal(reason)) => {
                self.fail_attempt(delivery, &lease, &reason, Disposition::Fail)
                    .await
            }
            Attempt::Failed(ProcessingError::Transient(reason)) => {
                let disposition = Disposition::Retry {
                    max_attempts: self.ctx.settings.max_attempts,
                };
                self.fail_attempt(delivery, &lease, &reason, disposition).await
            }
            Attempt::LeaseLost => {
                tracing::warn!(
                    job_id = %lease.job_id,
                    attempt = lease.attempt,
                    "Lease lost mid-job, abandoning"
                );
                self.set_phase(WorkerPhase::Abandoning);
                metrics::counter!("jobs_abandoned_total").increment(1);
                Ok(Outcome::Abandoned)
            }
        }
    }

    /// LEASE_ACQUIRED: CAS the job QUEUED -> PROCESSING, or settle the delivery.
    async fn acquire(&self, delivery: &Delivery) -> Result<Acquired, WorkerError> {
        let job_id = delivery.job.job_id;
        let settings = &self.ctx.settings;

        for _ in 0..2 {
            let now = Utc::now();
            let deadline = now + chrono_duration(settings.visibility_timeout);
            let err = match self.ctx.registry.claim(job_id, &self.id, deadline).await {
                Ok(job) => return Ok(Acquired::Claimed(job)),
                Err(e) => e,
            };

            match err {
                RegistryError::NotFound(_) => {
                    tracing::warn!(job_id = %job_id, "Delivery for unknown job, dropping");
                    self.ctx.queue.ack(delivery).await?;
                    return Ok(Acquired::Settled(Outcome::Dropped));
                }
                e if e.is_conflict() => {}
                e => return Err(e.into()),
            }

            let current = self.ctx.registry.read(job_id).await?;
            if current.state.is_terminal() {
                tracing::info!(
                    job_id = %job_id,
                    state = %current.state,
                    "Duplicate delivery of finished job"
                );
                self.ctx.queue.ack(delivery).await?;
                return Ok(Acquired::Settled(Outcome::Dropped));
            }

            if !current.lease_expired(now) {
                // Another worker holds a live lease (or just released it).
                break;
            }

            match self
                .ctx
                .registry
                .reclaim_expired(job_id, now, settings.max_attempts)
                .await?
            {
                Some(ReleaseOutcome::Requeued) => {
                    tracing::warn!(
                        job_id = %job_id,
                        previous_owner = current.lease_owner.as_deref().unwrap_or("unknown"),
                        "Reclaimed job from expired lease"
                    );
                    metrics::counter!("jobs_retried_total").increment(1);
                }
                Some(ReleaseOutcome::Failed) => {
                    tracing::warn!(job_id = %job_id, "Expired lease exhausted the attempt budget");
                    metrics::counter!("jobs_failed_total").increment(1);
                    self.ctx.queue.ack(delivery).await?;
                    return Ok(Acquired::Settled(Outcome::Failed));
                }
                None => break,
            }
        }

        self.set_phase(WorkerPhase::Abandoning);
        tracing::info!(
            job_id = %job_id,
            worker_id = %self.id,
            "Job claimed elsewhere, abandoning delivery"
        );
        self.ctx.queue.release(delivery, settings.abandon_delay).await?;
        metrics::counter!("jobs_abandoned_total").increment(1);
        Ok(Acquired::Settled(Outcome::Abandoned))
    }

    async fn resolve_input(&self, payload: &JobPayload) -> Result<JobInput, ProcessingError> {
        match payload {
            JobPayload::StyleTransfer(p) => Ok(JobInput::StyleTransfer {
                content_image: self.fetch_input(&p.content_image_key).await?,
                style_image: self.fetch_input(&p.style_image_key).await?,
                influence: p.influence,
                creativity: p.creativity,
                additional_prompt: p.additional_prompt.clone(),
            }),
            JobPayload::Chat(p) => Ok(JobInput::Chat {
                question: p.question.clone(),
            }),
            JobPayload::Recommendation(p) => Ok(JobInput::Recommendation {
                user_id: p.user_id.clone(),
                preferences: p.preferences.clone(),
                limit: p.limit,
            }),
        }
    }

    async fn fetch_input(&self, key: &str) -> Result<Vec<u8>, ProcessingError> {
        match self.ctx.store.get(key).await {
            Ok(data) => Ok(data),
            Err(StorageError::NotFound(_)) => {
                Err(ProcessingError::Fatal(format!("input blob {} is missing", key)))
            }
            Err(e) => Err(ProcessingError::Transient(format!("failed to read {}: {}", key, e))),
        }
    }

    /// PROCESSING: run the processor under the job timeout while keeping the
    /// queue visibility and registry lease alive.
    async fn execute(&self, delivery: &Delivery, lease: &WorkerLease, input: JobInput) -> Attempt {
        let settings = &self.ctx.settings;
        let Some(processor) = self.ctx.processors.get(input.kind()) else {
            return Attempt::Failed(ProcessingError::Fatal(format!(
                "no processor configured for {} jobs",
                input.kind()
            )));
        };

        let work = tokio::time::timeout(settings.job_timeout, processor.process(&input));
        tokio::pin!(work);

        let period = (settings.visibility_timeout / 2).max(Duration::from_millis(100));
        let mut keepalive = tokio::time::interval_at(Instant::now() + period, period);

        loop {
            tokio::select! {
                result = &mut work => {
                    return match result {
                        Ok(Ok(output)) => Attempt::Succeeded(output),
                        Ok(Err(e)) => Attempt::Failed(e),
                        Err(_) => Attempt::Failed(ProcessingError::Transient(format!(
                            "processing timed out after {}s",
                            settings.job_timeout.as_secs_f64()
                        ))),
                    };
                }
                _ = keepalive.tick() => {
                    if !self.keep_alive(delivery, lease).await {
                        return Attempt::LeaseLost;
                    }
                }
            }
        }
    }

    /// Extend both leases. Returns false once the registry says the lease
    /// belongs to someone else; infrastructure hiccups are only logged.
    async fn keep_alive(&self, delivery: &Delivery, lease: &WorkerLease) -> bool {
        let visibility = self.ctx.settings.visibility_timeout;
        if let Err(e) = self.ctx.queue.extend_visibility(delivery, visibility).await {
            tracing::warn!(job_id = %lease.job_id, error = %e, "Failed to extend visibility");
        }

        let deadline = Utc::now() + chrono_duration(visibility);
        match self
            .ctx
            .registry
            .extend_lease(lease.job_id, lease.attempt, deadline)
            .await
        {
            Ok(()) => true,
            Err(e) if e.is_conflict() => false,
            Err(e) => {
                tracing::warn!(job_id = %lease.job_id, error = %e, "Failed to extend lease");
                true
            }
        }
    }

    /// COMMITTING: result blob, then the registry flip, then the ack.
    async fn commit(
        &self,
        delivery: &Delivery,
        lease: &WorkerLease,
        output: ProcessorOutput,
        elapsed: Duration,
    ) -> Result<Outcome, WorkerError> {
        self.set_phase(WorkerPhase::Committing);
        let retry = &self.ctx.settings.infra_retry;
        let key = output_key(lease.job_id, lease.attempt);

        let written = with_backoff(retry, "write result", || {
            self.ctx.store.put(&key, &output.data, &output.content_type)
        })
        .await;
        if let Err(e) = written {
            let reason = format!("failed to store result: {}", e);
            let disposition = Disposition::Retry {
                max_attempts: self.ctx.settings.max_attempts,
            };
            return self.fail_attempt(delivery, lease, &reason, disposition).await;
        }

        let record = ResultRecord {
            output_key: key.clone(),
            content_type: output.content_type.clone(),
            processing_time: elapsed.as_secs_f64(),
            produced_at: Utc::now(),
        };
        let published = with_backoff_when(retry, "publish result", is_infra_error, || {
            self.ctx.registry.complete(lease.job_id, lease.attempt, &record)
        })
        .await;

        match published {
            Ok(_) => {}
            Err(e) if e.is_conflict() => {
                tracing::warn!(
                    job_id = %lease.job_id,
                    attempt = lease.attempt,
                    error = %e,
                    "Result superseded, discarding"
                );
                if let Err(e) = self.ctx.store.delete(&key).await {
                    tracing::warn!(key = %key, error = %e, "Failed to delete superseded result");
                }
                self.ctx.queue.ack(delivery).await?;
                metrics::counter!("jobs_abandoned_total").increment(1);
                return Ok(Outcome::Abandoned);
            }
            Err(e) => return Err(e.into()),
        }

        if let Err(e) = with_backoff(retry, "ack", || self.ctx.queue.ack(delivery)).await {
            // The redelivery will find the job COMPLETED and drop itself.
            tracing::warn!(job_id = %lease.job_id, error = %e, "Ack failed after completion");
        }

        metrics::counter!("jobs_completed_total").increment(1);
        metrics::histogram!("job_processing_seconds").record(record.processing_time);
        tracing::info!(
            job_id = %lease.job_id,
            attempt = lease.attempt,
            processing_time = record.processing_time,
            "Job completed successfully"
        );
        Ok(Outcome::Completed)
    }

    /// ABANDONING a failed attempt: back to QUEUED with a fresh message, or FAILED.
    async fn fail_attempt(
        &self,
        delivery: &Delivery,
        lease: &WorkerLease,
        reason: &str,
        disposition: Disposition,
    ) -> Result<Outcome, WorkerError> {
        self.set_phase(WorkerPhase::Abandoning);
        let retry = &self.ctx.settings.infra_retry;
        tracing::error!(
            job_id = %lease.job_id,
            attempt = lease.attempt,
            error = %reason,
            "Job processing failed"
        );

        let released = with_backoff_when(retry, "release job", is_infra_error, || {
            self.ctx
                .registry
                .release(lease.job_id, lease.attempt, reason, disposition)
        })
        .await;

        let outcome = match released {
            Ok(ReleaseOutcome::Requeued) => {
                let message = QueuedJob::new(lease.job_id, delivery.job.kind);
                with_backoff(retry, "requeue", || self.ctx.queue.enqueue(&message)).await?;
                metrics::counter!("jobs_retried_total").increment(1);
                tracing::info!(
                    job_id = %lease.job_id,
                    attempt = lease.attempt,
                    "Job re-queued for retry"
                );
                Outcome::Requeued
            }
            Ok(ReleaseOutcome::Failed) => {
                metrics::counter!("jobs_failed_total").increment(1);
                tracing::warn!(
                    job_id = %lease.job_id,
                    attempt = lease.attempt,
                    "Job failed permanently"
                );
                Outcome::Failed
            }
            Err(e) if e.is_conflict() => {
                tracing::warn!(job_id = %lease.job_id, error = %e, "Lease lost before release");
                Outcome::Abandoned
            }
            Err(e) => return Err(e.into()),
        };

        if let Err(e) = with_backoff(retry, "ack", || self.ctx.queue.ack(delivery)).await {
            tracing::warn!(job_id = %lease.job_id, error = %e, "Ack failed after release");
        }
        Ok(outcome)
    }
}

enum Attempt {
    Succeeded(ProcessorOutput),
    Failed(ProcessingError),
    LeaseLost,
}

/// Short random worker ID.
pub fn worker_id(prefix: &str) -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    format!("{}-{}", prefix, &id[..8])
}

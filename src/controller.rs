//! Pool controller: observes queue depth and sizes the worker pool between
//! zero and `max_replicas`. It never touches job content; the retention
//! janitor piggybacks on its loop.

use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::ScalerSettings;
use crate::db::registry::{JobRegistry, RegistryError};
use crate::models::job::{output_key, Job, JobState};
use crate::services::queue::{JobQueue, QueueError, QueueStats};
use crate::services::storage::BlobStore;

/// Replicas as seen by the controller.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplicaCount {
    /// Running and not asked to drain.
    pub active: u32,
    /// Active replicas currently holding a delivery.
    pub busy: u32,
    /// Finishing their current job before exiting.
    pub draining: u32,
}

/// Sets the number of worker replicas. `set_replicas` is idempotent: calling
/// it twice with the same target changes nothing the second time.
#[async_trait]
pub trait ReplicaScaler: Send + Sync {
    async fn replica_count(&self) -> ReplicaCount;

    /// Scale to `target`. Scale-down drains replicas, idle ones first.
    async fn set_replicas(&self, target: u32) -> Result<(), ScaleError>;
}

#[derive(Debug, thiserror::Error)]
pub enum ScaleError {
    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error("scaler unavailable: {0}")]
    Unavailable(String),
}

/// Desired replica count for the observed load.
///
/// Demand is whichever is larger: messages outstanding in the queue or
/// replicas already busy. With no demand, one replica stays warm until the
/// pool has been idle for `idle_grace`.
pub fn compute_target(
    stats: QueueStats,
    busy: u32,
    current: u32,
    idle_for: Duration,
    settings: &ScalerSettings,
) -> u32 {
    let demand = stats.outstanding().max(u64::from(busy));
    if demand == 0 {
        let warm = current > 0 && idle_for < settings.idle_grace;
        return if warm { settings.max_replicas.min(1) } else { 0 };
    }

    let per_replica = u64::from(settings.jobs_per_replica.max(1));
    let wanted = demand.div_ceil(per_replica);
    wanted.min(u64::from(settings.max_replicas)) as u32
}

pub struct PoolController {
    queue: Arc<dyn JobQueue>,
    scaler: Arc<dyn ReplicaScaler>,
    settings: ScalerSettings,
    janitor: Option<Janitor>,
    idle_since: Option<Instant>,
    ticks: u64,
}

impl PoolController {
    pub fn new(
        queue: Arc<dyn JobQueue>,
        scaler: Arc<dyn ReplicaScaler>,
        settings: ScalerSettings,
    ) -> Self {
        Self {
            queue,
            scaler,
            settings,
            janitor: None,
            idle_since: None,
            ticks: 0,
        }
    }

    pub fn with_janitor(mut self, janitor: Janitor) -> Self {
        self.janitor = Some(janitor);
        self
    }

    /// One control step. Returns the target that was applied.
    pub async fn tick(&mut self) -> Result<u32, ScaleError> {
        let stats = self.queue.stats().await?;
        let count = self.scaler.replica_count().await;

        let now = Instant::now();
        let demand = stats.outstanding().max(u64::from(count.busy));
        let idle_for = if demand > 0 {
            self.idle_since = None;
            Duration::ZERO
        } else {
            now.duration_since(*self.idle_since.get_or_insert(now))
        };

        let target = compute_target(stats, count.busy, count.active, idle_for, &self.settings);
        if target != count.active {
            tracing::info!(
                visible = stats.visible,
                in_flight = stats.in_flight,
                current = count.active,
                busy = count.busy,
                target,
                "Scaling worker pool"
            );
        }
        self.scaler.set_replicas(target).await?;

        metrics::gauge!("queue_visible").set(stats.visible as f64);
        metrics::gauge!("queue_in_flight").set(stats.in_flight as f64);
        metrics::gauge!("pool_target_replicas").set(f64::from(target));

        self.ticks += 1;
        let every = u64::from(self.settings.janitor_every.max(1));
        if self.ticks % every == 0 {
            if let Some(janitor) = &self.janitor {
                if let Err(e) = janitor.sweep().await {
                    tracing::warn!(error = %e, "Retention sweep failed");
                }
            }
        }

        Ok(target)
    }

    /// Run the control loop until `shutdown` fires.
    pub async fn run(mut self, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(self.settings.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tracing::info!(
            interval_secs = self.settings.interval.as_secs(),
            max_replicas = self.settings.max_replicas,
            "Pool controller started"
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    if let Err(e) = self.tick().await {
                        tracing::warn!(error = %e, "Controller tick failed");
                    }
                }
            }
        }
        tracing::info!("Pool controller stopped");
    }
}

/// Deletes terminal jobs past the retention window together with their blobs.
pub struct Janitor {
    registry: Arc<dyn JobRegistry>,
    store: Arc<dyn BlobStore>,
    retention: Duration,
}

impl Janitor {
    pub fn new(
        registry: Arc<dyn JobRegistry>,
        store: Arc<dyn BlobStore>,
        retention: Duration,
    ) -> Self {
        Self {
            registry,
            store,
            retention,
        }
    }

    /// Returns the number of jobs purged.
    pub async fn sweep(&self) -> Result<usize, RegistryError> {
        let retention = chrono::Duration::from_std(self.retention)
            .unwrap_or_else(|_| chrono::Duration::days(365));
        let purged = self.registry.purge_terminal(Utc::now() - retention).await?;

        for job in &purged {
            for key in owned_blob_keys(job) {
                if let Err(e) = self.store.delete(&key).await {
                    tracing::warn!(
                        job_id = %job.id,
                        key = %key,
                        error = %e,
                        "Failed to delete blob"
                    );
                }
            }
        }

        if !purged.is_empty() {
            tracing::info!(purged = purged.len(), "Purged expired jobs");
        }

        let counts = self.registry.count_by_state().await?;
        let states = [
            JobState::Queued,
            JobState::Processing,
            JobState::Completed,
            JobState::Failed,
        ];
        for state in states {
            let n = counts.get(&state).copied().unwrap_or(0);
            metrics::gauge!("jobs_by_state", "state" => state.to_string()).set(n as f64);
        }

        Ok(purged.len())
    }
}

/// Inputs plus the result key of every attempt. Attempts that crashed or were
/// fenced off after writing leave blobs the registry never points at.
fn owned_blob_keys(job: &Job) -> Vec<String> {
    let mut keys: Vec<String> = job
        .payload
        .blob_keys()
        .into_iter()
        .map(str::to_string)
        .collect();
    keys.extend((1..=job.attempt_count).map(|attempt| output_key(job.id, attempt)));
    if let Some(result) = &job.result {
        if !keys.contains(&result.output_key) {
            keys.push(result.output_key.clone());
        }
    }
    keys
}

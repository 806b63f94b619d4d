use serde::Deserialize;
use std::time::Duration;

use crate::services::retry::RetryPolicy;

/// Process configuration, read once from the environment at start-up.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Server bind address (e.g., "0.0.0.0:3000"). Unused by worker processes.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// PostgreSQL connection string (job registry)
    pub database_url: String,

    /// Redis connection string (job queue)
    pub redis_url: String,

    /// Key prefix for the Redis queue structures
    #[serde(default = "default_queue_prefix")]
    pub queue_prefix: String,

    /// R2 bucket name (result store)
    pub r2_bucket: String,

    /// R2 access key ID (S3-compatible)
    pub r2_access_key: String,

    /// R2 secret access key (S3-compatible)
    pub r2_secret_key: String,

    /// R2 endpoint URL
    pub r2_endpoint: String,

    /// Model-serving endpoint for style transfer
    pub style_model_url: String,

    /// Model-serving endpoint for chat; chat jobs are rejected by workers without it
    #[serde(default)]
    pub chat_model_url: Option<String>,

    /// Model-serving endpoint for tourism recommendations
    #[serde(default)]
    pub recommendation_model_url: Option<String>,

    /// Attempts per job before it is marked failed
    #[serde(default = "default_max_attempts")]
    pub job_max_attempts: i32,

    /// Hard wall-clock budget for one processing attempt
    #[serde(default = "default_job_timeout_secs")]
    pub job_timeout_secs: u64,

    /// Queue visibility timeout, also the registry lease length
    #[serde(default = "default_visibility_timeout_secs")]
    pub visibility_timeout_secs: u64,

    #[serde(default = "default_poll_interval_ms")]
    pub worker_poll_interval_ms: u64,

    /// Delay before an abandoned delivery becomes visible again
    #[serde(default = "default_abandon_delay_secs")]
    pub worker_abandon_delay_secs: u64,

    /// Standalone workers exit after this long without work
    #[serde(default)]
    pub worker_idle_exit_secs: Option<u64>,

    /// Metrics listener of the controller process
    #[serde(default = "default_controller_metrics_addr")]
    pub controller_metrics_addr: String,

    #[serde(default = "default_scaler_interval_secs")]
    pub scaler_interval_secs: u64,

    #[serde(default = "default_max_replicas")]
    pub scaler_max_replicas: u32,

    #[serde(default = "default_jobs_per_replica")]
    pub scaler_jobs_per_replica: u32,

    /// How long one replica stays warm after the queue empties
    #[serde(default = "default_idle_grace_secs")]
    pub scaler_idle_grace_secs: u64,

    /// Terminal jobs older than this are purged with their blobs
    #[serde(default = "default_retention_secs")]
    pub job_retention_secs: u64,

    /// Run the retention janitor every N controller ticks
    #[serde(default = "default_janitor_every")]
    pub janitor_every_ticks: u32,

    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,

    /// Attempts for infrastructure calls retried with backoff
    #[serde(default = "default_infra_attempts")]
    pub infra_retry_attempts: u32,
}

fn default_bind_addr() -> String {
    "0.0.0.0:3000".to_string()
}

fn default_controller_metrics_addr() -> String {
    "0.0.0.0:9100".to_string()
}

fn default_queue_prefix() -> String {
    "stylequeue".to_string()
}

fn default_max_attempts() -> i32 {
    3
}

fn default_job_timeout_secs() -> u64 {
    300
}

fn default_visibility_timeout_secs() -> u64 {
    600
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_abandon_delay_secs() -> u64 {
    30
}

fn default_scaler_interval_secs() -> u64 {
    15
}

fn default_max_replicas() -> u32 {
    4
}

fn default_jobs_per_replica() -> u32 {
    1
}

fn default_idle_grace_secs() -> u64 {
    120
}

fn default_retention_secs() -> u64 {
    7 * 24 * 3600
}

fn default_janitor_every() -> u32 {
    40
}

fn default_max_body_bytes() -> usize {
    20 * 1024 * 1024
}

fn default_infra_attempts() -> u32 {
    4
}

impl AppConfig {
    pub fn from_env() -> Result<Self, envy::Error> {
        dotenvy::dotenv().ok();
        envy::from_env()
    }

    pub fn infra_retry(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.infra_retry_attempts.max(1),
            ..RetryPolicy::default()
        }
    }

    pub fn worker_settings(&self) -> WorkerSettings {
        WorkerSettings {
            max_attempts: self.job_max_attempts.max(1),
            job_timeout: Duration::from_secs(self.job_timeout_secs),
            visibility_timeout: Duration::from_secs(self.visibility_timeout_secs),
            poll_interval: Duration::from_millis(self.worker_poll_interval_ms),
            abandon_delay: Duration::from_secs(self.worker_abandon_delay_secs),
            idle_exit: self.worker_idle_exit_secs.map(Duration::from_secs),
            infra_retry: self.infra_retry(),
        }
    }

    pub fn scaler_settings(&self) -> ScalerSettings {
        ScalerSettings {
            interval: Duration::from_secs(self.scaler_interval_secs),
            max_replicas: self.scaler_max_replicas,
            jobs_per_replica: self.scaler_jobs_per_replica.max(1),
            idle_grace: Duration::from_secs(self.scaler_idle_grace_secs),
            retention: Duration::from_secs(self.job_retention_secs),
            janitor_every: self.janitor_every_ticks.max(1),
        }
    }

    pub fn gateway_settings(&self) -> GatewaySettings {
        GatewaySettings {
            enqueue_retry: self.infra_retry(),
        }
    }
}

/// Settings for a worker runtime.
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub max_attempts: i32,
    pub job_timeout: Duration,
    pub visibility_timeout: Duration,
    pub poll_interval: Duration,
    pub abandon_delay: Duration,
    pub idle_exit: Option<Duration>,
    pub infra_retry: RetryPolicy,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            job_timeout: Duration::from_secs(default_job_timeout_secs()),
            visibility_timeout: Duration::from_secs(default_visibility_timeout_secs()),
            poll_interval: Duration::from_millis(default_poll_interval_ms()),
            abandon_delay: Duration::from_secs(default_abandon_delay_secs()),
            idle_exit: None,
            infra_retry: RetryPolicy::default(),
        }
    }
}

/// Settings for the pool controller loop.
#[derive(Debug, Clone)]
pub struct ScalerSettings {
    pub interval: Duration,
    pub max_replicas: u32,
    pub jobs_per_replica: u32,
    pub idle_grace: Duration,
    pub retention: Duration,
    pub janitor_every: u32,
}

impl Default for ScalerSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(default_scaler_interval_secs()),
            max_replicas: default_max_replicas(),
            jobs_per_replica: default_jobs_per_replica(),
            idle_grace: Duration::from_secs(default_idle_grace_secs()),
            retention: Duration::from_secs(default_retention_secs()),
            janitor_every: default_janitor_every(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct GatewaySettings {
    pub enqueue_retry: RetryPolicy,
}

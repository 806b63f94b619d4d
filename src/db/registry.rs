use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use std::collections::HashMap;

use crate::models::job::{
    Disposition, Job, JobId, JobKind, JobPayload, JobState, NewJob, ReleaseOutcome, ResultRecord,
};

/// Job ID -> lifecycle state. Every mutation is a compare-and-swap on the
/// current state, so duplicate queue deliveries cannot double-apply.
#[async_trait]
pub trait JobRegistry: Send + Sync {
    /// Insert a job in QUEUED with `attempt_count = 0`.
    async fn create(&self, job: &NewJob) -> Result<Job, RegistryError>;

    async fn read(&self, job_id: JobId) -> Result<Job, RegistryError>;

    /// Move `job_id` from `expected` to `new`. Fails with `Conflict` if the
    /// job is not in `expected`, and with `InvalidTransition` for edges outside
    /// the lifecycle.
    async fn transition(
        &self,
        job_id: JobId,
        expected: JobState,
        new: JobState,
    ) -> Result<Job, RegistryError>;

    /// QUEUED -> PROCESSING, bumping `attempt_count` and recording the lease.
    async fn claim(
        &self,
        job_id: JobId,
        worker_id: &str,
        deadline: DateTime<Utc>,
    ) -> Result<Job, RegistryError>;

    async fn extend_lease(
        &self,
        job_id: JobId,
        attempt: i32,
        deadline: DateTime<Utc>,
    ) -> Result<(), RegistryError>;

    /// PROCESSING -> COMPLETED for the holder of `attempt`, publishing `result`.
    async fn complete(
        &self,
        job_id: JobId,
        attempt: i32,
        result: &ResultRecord,
    ) -> Result<Job, RegistryError>;

    /// PROCESSING -> QUEUED or FAILED for the holder of `attempt`.
    async fn release(
        &self,
        job_id: JobId,
        attempt: i32,
        reason: &str,
        disposition: Disposition,
    ) -> Result<ReleaseOutcome, RegistryError>;

    /// Return a PROCESSING job whose lease deadline passed to QUEUED (or FAILED
    /// once attempts are exhausted). `None` if the lease is still live or the
    /// job is not PROCESSING.
    async fn reclaim_expired(
        &self,
        job_id: JobId,
        now: DateTime<Utc>,
        max_attempts: i32,
    ) -> Result<Option<ReleaseOutcome>, RegistryError>;

    /// Drop a QUEUED job that was never attempted.
    async fn discard(&self, job_id: JobId) -> Result<(), RegistryError>;

    /// Delete terminal jobs last updated before `before`, returning them.
    async fn purge_terminal(&self, before: DateTime<Utc>) -> Result<Vec<Job>, RegistryError>;

    /// Number of jobs in each state. States with no jobs are omitted.
    async fn count_by_state(&self) -> Result<HashMap<JobState, u64>, RegistryError>;

    async fn health_check(&self) -> Result<(), RegistryError>;
}

/// Decide where a failed attempt goes.
pub fn release_target(attempt: i32, disposition: Disposition) -> JobState {
    match disposition {
        Disposition::Fail => JobState::Failed,
        Disposition::Retry { max_attempts } if attempt >= max_attempts => JobState::Failed,
        Disposition::Retry { .. } => JobState::Queued,
    }
}

pub(crate) fn outcome_for(state: JobState) -> ReleaseOutcome {
    if state == JobState::Failed {
        ReleaseOutcome::Failed
    } else {
        ReleaseOutcome::Requeued
    }
}

/// Error for a guarded update on `job` that did not apply.
pub(crate) fn guard_error(job: &Job, expected: JobState, attempt: Option<i32>) -> RegistryError {
    if job.state != expected {
        return RegistryError::Conflict {
            job_id: job.id,
            expected,
            actual: job.state,
        };
    }
    match attempt {
        Some(attempt) if attempt != job.attempt_count => RegistryError::LeaseLost {
            job_id: job.id,
            attempt,
        },
        _ => RegistryError::Conflict {
            job_id: job.id,
            expected,
            actual: job.state,
        },
    }
}

const JOB_COLUMNS: &str = r#"
    id, kind, payload, state, attempt_count, failure_reason, lease_owner, lease_deadline,
    result_key, result_content_type, processing_time, produced_at, submitted_at, updated_at
"#;

/// PostgreSQL-backed registry.
#[derive(Clone)]
pub struct PgRegistry {
    pool: PgPool,
}

impl PgRegistry {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Explain why a guarded UPDATE touched no row.
    async fn miss(
        &self,
        job_id: JobId,
        expected: JobState,
        attempt: Option<i32>,
    ) -> RegistryError {
        match self.read(job_id).await {
            Ok(job) => guard_error(&job, expected, attempt),
            Err(e) => e,
        }
    }
}

fn parse_enum<T: std::str::FromStr>(column: &str, value: String) -> Result<T, RegistryError> {
    value
        .parse()
        .map_err(|_| RegistryError::Corrupt(format!("{} '{}'", column, value)))
}

fn job_from_row(row: &PgRow) -> Result<Job, RegistryError> {
    let state: JobState = parse_enum("state", row.try_get("state")?)?;
    let kind: JobKind = parse_enum("kind", row.try_get("kind")?)?;
    let Json(payload): Json<JobPayload> = row.try_get("payload")?;

    let result_key: Option<String> = row.try_get("result_key")?;
    let result = match result_key {
        Some(output_key) => Some(ResultRecord {
            output_key,
            content_type: row
                .try_get::<Option<String>, _>("result_content_type")?
                .unwrap_or_else(|| "application/octet-stream".to_string()),
            processing_time: row.try_get::<Option<f64>, _>("processing_time")?.unwrap_or(0.0),
            produced_at: row
                .try_get::<Option<DateTime<Utc>>, _>("produced_at")?
                .unwrap_or_else(Utc::now),
        }),
        None => None,
    };

    Ok(Job {
        id: JobId(row.try_get("id")?),
        kind,
        payload,
        state,
        attempt_count: row.try_get("attempt_count")?,
        failure_reason: row.try_get("failure_reason")?,
        lease_owner: row.try_get("lease_owner")?,
        lease_deadline: row.try_get("lease_deadline")?,
        result,
        submitted_at: row.try_get("submitted_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

#[async_trait]
impl JobRegistry for PgRegistry {
    async fn create(&self, job: &NewJob) -> Result<Job, RegistryError> {
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO jobs (id, kind, payload, state, attempt_count)
            VALUES ($1, $2, $3, 'queued', 0)
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(job.id.0)
        .bind(job.payload.kind().to_string())
        .bind(Json(&job.payload))
        .fetch_one(&self.pool)
        .await?;

        job_from_row(&row)
    }

    async fn read(&self, job_id: JobId) -> Result<Job, RegistryError> {
        let row = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1"))
            .bind(job_id.0)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(r) => job_from_row(&r),
            None => Err(RegistryError::NotFound(job_id)),
        }
    }

    async fn transition(
        &self,
        job_id: JobId,
        expected: JobState,
        new: JobState,
    ) -> Result<Job, RegistryError> {
        if !expected.can_transition_to(new) {
            return Err(RegistryError::InvalidTransition { from: expected, to: new });
        }

        let row = sqlx::query(&format!(
            r#"
            UPDATE jobs
            SET state = $3,
                lease_owner = CASE WHEN $3 = 'processing' THEN lease_owner ELSE NULL END,
                lease_deadline = CASE WHEN $3 = 'processing' THEN lease_deadline ELSE NULL END,
                updated_at = NOW()
            WHERE id = $1 AND state = $2
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(job_id.0)
        .bind(expected.to_string())
        .bind(new.to_string())
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(r) => job_from_row(&r),
            None => Err(self.miss(job_id, expected, None).await),
        }
    }

    async fn claim(
        &self,
        job_id: JobId,
        worker_id: &str,
        deadline: DateTime<Utc>,
    ) -> Result<Job, RegistryError> {
        let row = sqlx::query(&format!(
            r#"
            UPDATE jobs
            SET state = 'processing',
                attempt_count = attempt_count + 1,
                lease_owner = $2,
                lease_deadline = $3,
                updated_at = NOW()
            WHERE id = $1 AND state = 'queued'
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(job_id.0)
        .bind(worker_id)
        .bind(deadline)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(r) => job_from_row(&r),
            None => Err(self.miss(job_id, JobState::Queued, None).await),
        }
    }

    async fn extend_lease(
        &self,
        job_id: JobId,
        attempt: i32,
        deadline: DateTime<Utc>,
    ) -> Result<(), RegistryError> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET lease_deadline = $3, updated_at = NOW()
            WHERE id = $1 AND state = 'processing' AND attempt_count = $2
            "#,
        )
        .bind(job_id.0)
        .bind(attempt)
        .bind(deadline)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(self.miss(job_id, JobState::Processing, Some(attempt)).await);
        }
        Ok(())
    }

    async fn complete(
        &self,
        job_id: JobId,
        attempt: i32,
        result: &ResultRecord,
    ) -> Result<Job, RegistryError> {
        let row = sqlx::query(&format!(
            r#"
            UPDATE jobs
            SET state = 'completed',
                result_key = $3,
                result_content_type = $4,
                processing_time = $5,
                produced_at = $6,
                lease_owner = NULL,
                lease_deadline = NULL,
                updated_at = NOW()
            WHERE id = $1 AND state = 'processing' AND attempt_count = $2
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(job_id.0)
        .bind(attempt)
        .bind(&result.output_key)
        .bind(&result.content_type)
        .bind(result.processing_time)
        .bind(result.produced_at)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(r) => job_from_row(&r),
            None => Err(self.miss(job_id, JobState::Processing, Some(attempt)).await),
        }
    }

    async fn release(
        &self,
        job_id: JobId,
        attempt: i32,
        reason: &str,
        disposition: Disposition,
    ) -> Result<ReleaseOutcome, RegistryError> {
        let target = release_target(attempt, disposition);

        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET state = $3,
                failure_reason = $4,
                lease_owner = NULL,
                lease_deadline = NULL,
                updated_at = NOW()
            WHERE id = $1 AND state = 'processing' AND attempt_count = $2
            "#,
        )
        .bind(job_id.0)
        .bind(attempt)
        .bind(target.to_string())
        .bind(reason)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(self.miss(job_id, JobState::Processing, Some(attempt)).await);
        }
        Ok(outcome_for(target))
    }

    async fn reclaim_expired(
        &self,
        job_id: JobId,
        now: DateTime<Utc>,
        max_attempts: i32,
    ) -> Result<Option<ReleaseOutcome>, RegistryError> {
        let row = sqlx::query(
            r#"
            UPDATE jobs
            SET state = CASE WHEN attempt_count >= $3 THEN 'failed' ELSE 'queued' END,
                failure_reason = 'worker lease expired on attempt ' || attempt_count,
                lease_owner = NULL,
                lease_deadline = NULL,
                updated_at = NOW()
            WHERE id = $1
              AND state = 'processing'
              AND (lease_deadline IS NULL OR lease_deadline <= $2)
            RETURNING state
            "#,
        )
        .bind(job_id.0)
        .bind(now)
        .bind(max_attempts)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(r) => {
                let state: JobState = parse_enum("state", r.try_get("state")?)?;
                Ok(Some(outcome_for(state)))
            }
            None => Ok(None),
        }
    }

    async fn discard(&self, job_id: JobId) -> Result<(), RegistryError> {
        sqlx::query("DELETE FROM jobs WHERE id = $1 AND state = 'queued' AND attempt_count = 0")
            .bind(job_id.0)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn purge_terminal(&self, before: DateTime<Utc>) -> Result<Vec<Job>, RegistryError> {
        let rows = sqlx::query(&format!(
            r#"
            DELETE FROM jobs
            WHERE state IN ('completed', 'failed') AND updated_at < $1
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(before)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(job_from_row).collect()
    }

    async fn count_by_state(&self) -> Result<HashMap<JobState, u64>, RegistryError> {
        let rows = sqlx::query("SELECT state, COUNT(*) AS n FROM jobs GROUP BY state")
            .fetch_all(&self.pool)
            .await?;

        let mut counts = HashMap::new();
        for row in rows {
            let state: JobState = parse_enum("state", row.try_get("state")?)?;
            let n: i64 = row.try_get("n")?;
            counts.insert(state, n.max(0) as u64);
        }
        Ok(counts)
    }

    async fn health_check(&self) -> Result<(), RegistryError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("Job {0} not found")]
    NotFound(JobId),

    #[error("Job {job_id} is {actual}, expected {expected}")]
    Conflict {
        job_id: JobId,
        expected: JobState,
        actual: JobState,
    },

    #[error("Lease for attempt {attempt} of job {job_id} is no longer held")]
    LeaseLost { job_id: JobId, attempt: i32 },

    #[error("Invalid transition {from} -> {to}")]
    InvalidTransition { from: JobState, to: JobState },

    #[error("Corrupt registry row: {0}")]
    Corrupt(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl RegistryError {
    /// Conflicts and lost leases are expected under duplicate delivery.
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            RegistryError::Conflict { .. } | RegistryError::LeaseLost { .. }
        )
    }
}

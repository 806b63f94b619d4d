use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use super::registry::{guard_error, outcome_for, release_target, JobRegistry, RegistryError};
use crate::models::job::{
    Disposition, Job, JobId, JobState, NewJob, ReleaseOutcome, ResultRecord,
};

#[derive(Default)]
struct Inner {
    jobs: HashMap<JobId, Job>,
    history: HashMap<JobId, Vec<JobState>>,
}

impl Inner {
    fn get(&self, job_id: JobId) -> Result<&Job, RegistryError> {
        self.jobs.get(&job_id).ok_or(RegistryError::NotFound(job_id))
    }

    /// Apply `update` if the job is in `expected` (and holds `attempt`, when given).
    fn guarded<F>(
        &mut self,
        job_id: JobId,
        expected: JobState,
        attempt: Option<i32>,
        update: F,
    ) -> Result<Job, RegistryError>
    where
        F: FnOnce(&mut Job),
    {
        let job = self
            .jobs
            .get_mut(&job_id)
            .ok_or(RegistryError::NotFound(job_id))?;
        let holds = job.state == expected && attempt.map_or(true, |a| a == job.attempt_count);
        if !holds {
            return Err(guard_error(job, expected, attempt));
        }

        let before = job.state;
        update(job);
        job.updated_at = Utc::now();
        if job.state != JobState::Processing {
            job.lease_owner = None;
            job.lease_deadline = None;
        }
        let updated = job.clone();
        if updated.state != before {
            self.history.entry(job_id).or_default().push(updated.state);
        }
        Ok(updated)
    }
}

/// In-process registry with the same CAS semantics as [`super::registry::PgRegistry`].
#[derive(Default)]
pub struct MemoryRegistry {
    inner: Mutex<Inner>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every state a job has been in, in order, starting with QUEUED.
    pub fn history(&self, job_id: JobId) -> Vec<JobState> {
        self.inner
            .lock()
            .map(|i| i.history.get(&job_id).cloned().unwrap_or_default())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map(|i| i.jobs.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Overwrite a job's `updated_at`, for retention tests.
    pub fn backdate(&self, job_id: JobId, updated_at: DateTime<Utc>) {
        if let Ok(mut inner) = self.inner.lock() {
            if let Some(job) = inner.jobs.get_mut(&job_id) {
                job.updated_at = updated_at;
            }
        }
    }

    /// Push a PROCESSING job's lease deadline into the past, as if its holder died.
    pub fn expire_lease(&self, job_id: JobId) {
        if let Ok(mut inner) = self.inner.lock() {
            if let Some(job) = inner.jobs.get_mut(&job_id) {
                if job.state == JobState::Processing {
                    job.lease_deadline = Some(Utc::now() - chrono::Duration::seconds(1));
                }
            }
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>, RegistryError> {
        self.inner
            .lock()
            .map_err(|_| RegistryError::Corrupt("registry lock poisoned".to_string()))
    }
}

#[async_trait]
impl JobRegistry for MemoryRegistry {
    async fn create(&self, job: &NewJob) -> Result<Job, RegistryError> {
        let mut inner = self.lock()?;
        if inner.jobs.contains_key(&job.id) {
            return Err(RegistryError::Corrupt(format!("duplicate job id {}", job.id)));
        }
        let now = Utc::now();
        let created = Job {
            id: job.id,
            kind: job.payload.kind(),
            payload: job.payload.clone(),
            state: JobState::Queued,
            attempt_count: 0,
            failure_reason: None,
            lease_owner: None,
            lease_deadline: None,
            result: None,
            submitted_at: now,
            updated_at: now,
        };
        inner.jobs.insert(job.id, created.clone());
        inner.history.insert(job.id, vec![JobState::Queued]);
        Ok(created)
    }

    async fn read(&self, job_id: JobId) -> Result<Job, RegistryError> {
        self.lock()?.get(job_id).cloned()
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
        self.lock()?
            .guarded(job_id, expected, None, |job| job.state = new)
    }

    async fn claim(
        &self,
        job_id: JobId,
        worker_id: &str,
        deadline: DateTime<Utc>,
    ) -> Result<Job, RegistryError> {
        self.lock()?.guarded(job_id, JobState::Queued, None, |job| {
            job.state = JobState::Processing;
            job.attempt_count += 1;
            job.lease_owner = Some(worker_id.to_string());
            job.lease_deadline = Some(deadline);
        })
    }

    async fn extend_lease(
        &self,
        job_id: JobId,
        attempt: i32,
        deadline: DateTime<Utc>,
    ) -> Result<(), RegistryError> {
        self.lock()?
            .guarded(job_id, JobState::Processing, Some(attempt), |job| {
                job.lease_deadline = Some(deadline);
            })
            .map(|_| ())
    }

    async fn complete(
        &self,
        job_id: JobId,
        attempt: i32,
        result: &ResultRecord,
    ) -> Result<Job, RegistryError> {
        self.lock()?
            .guarded(job_id, JobState::Processing, Some(attempt), |job| {
                job.state = JobState::Completed;
                job.result = Some(result.clone());
            })
    }

    async fn release(
        &self,
        job_id: JobId,
        attempt: i32,
        reason: &str,
        disposition: Disposition,
    ) -> Result<ReleaseOutcome, RegistryError> {
        let target = release_target(attempt, disposition);
        self.lock()?
            .guarded(job_id, JobState::Processing, Some(attempt), |job| {
                job.state = target;
                job.failure_reason = Some(reason.to_string());
            })?;
        Ok(outcome_for(target))
    }

    async fn reclaim_expired(
        &self,
        job_id: JobId,
        now: DateTime<Utc>,
        max_attempts: i32,
    ) -> Result<Option<ReleaseOutcome>, RegistryError> {
        let mut inner = self.lock()?;
        let job = inner.get(job_id)?;
        if !job.lease_expired(now) {
            return Ok(None);
        }
        let attempt = job.attempt_count;
        let target = release_target(attempt, Disposition::Retry { max_attempts });
        inner.guarded(job_id, JobState::Processing, Some(attempt), |job| {
            job.state = target;
            job.failure_reason = Some(format!("worker lease expired on attempt {}", attempt));
        })?;
        Ok(Some(outcome_for(target)))
    }

    async fn discard(&self, job_id: JobId) -> Result<(), RegistryError> {
        let mut inner = self.lock()?;
        let removable = inner
            .jobs
            .get(&job_id)
            .map(|job| job.state == JobState::Queued && job.attempt_count == 0)
            .unwrap_or(false);
        if removable {
            inner.jobs.remove(&job_id);
            inner.history.remove(&job_id);
        }
        Ok(())
    }

    async fn purge_terminal(&self, before: DateTime<Utc>) -> Result<Vec<Job>, RegistryError> {
        let mut inner = self.lock()?;
        let expired: Vec<JobId> = inner
            .jobs
            .values()
            .filter(|job| job.state.is_terminal() && job.updated_at < before)
            .map(|job| job.id)
            .collect();
        Ok(expired
            .into_iter()
            .filter_map(|id| {
                inner.history.remove(&id);
                inner.jobs.remove(&id)
            })
            .collect())
    }

    async fn count_by_state(&self) -> Result<HashMap<JobState, u64>, RegistryError> {
        let inner = self.lock()?;
        let mut counts = HashMap::new();
        for job in inner.jobs.values() {
            *counts.entry(job.state).or_insert(0) += 1;
        }
        Ok(counts)
    }

    async fn health_check(&self) -> Result<(), RegistryError> {
        self.lock().map(|_| ())
    }
}

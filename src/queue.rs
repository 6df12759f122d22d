//! Durable job storage contract and retry scheduling.
//!
//! A [`JobStore`] hands out jobs with at-least-once semantics: a claimed job
//! stays in `PROCESSING` until the worker signals completion or failure, and
//! a job whose worker went silent past the visibility timeout is claimed again.

use crate::{Job, JobRequest, Status};
use anyhow::{anyhow, Error};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use uuid::Uuid;

#[async_trait]
pub trait JobStore: Send + Sync {
    /// Durably enqueues a job and returns its id before any processing starts.
    async fn submit_job_request(&self, request: &JobRequest) -> Result<Uuid, Error>;

    /// Moves up to `limit` ready jobs of the given queues to `PROCESSING`,
    /// counting the delivery as an attempt.
    async fn claim_jobs(&self, queues: &[String], limit: i64) -> Result<Vec<Job>, Error>;

    /// Transitions out of `PROCESSING` name the delivery by its `attempt`
    /// number. Signals from a delivery that was reclaimed and claimed again
    /// are ignored.
    async fn complete_job(&self, id: Uuid, attempt: i32) -> Result<(), Error>;

    /// Puts a failed job back in the queue, not to be delivered before `run_at`.
    async fn retry_job(
        &self,
        id: Uuid,
        attempt: i32,
        error: &str,
        run_at: DateTime<Utc>,
    ) -> Result<(), Error>;

    /// Moves a job to the dead-letter state.
    async fn fail_job(&self, id: Uuid, attempt: i32, error: &str) -> Result<(), Error>;

    /// Hands back a claimed job that never started, refunding its attempt.
    async fn release_job(&self, id: Uuid, attempt: i32) -> Result<(), Error>;

    /// Redelivers jobs stuck in `PROCESSING` for longer than `timeout`.
    /// Jobs without attempts left are dead-lettered instead.
    async fn reclaim_stale_jobs(&self, timeout: Duration) -> Result<u64, Error>;

    async fn failed_jobs(&self, limit: i64) -> Result<Vec<Job>, Error>;

    /// Re-drives a dead-lettered job with a fresh attempt budget.
    async fn requeue_job(&self, id: Uuid) -> Result<bool, Error>;

    async fn job(&self, id: Uuid) -> Result<Option<Job>, Error>;
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: i32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureAction {
    Retry(DateTime<Utc>),
    DeadLetter,
}

impl RetryPolicy {
    /// Delay before the next delivery after `attempts` failed deliveries.
    pub fn backoff(&self, attempts: i32) -> Duration {
        let exponent = attempts.saturating_sub(1).clamp(0, 30) as u32;
        self.base_delay
            .saturating_mul(2u32.saturating_pow(exponent))
            .min(self.max_delay)
    }

    pub fn decide(&self, job: &Job, retryable: bool, now: DateTime<Utc>) -> FailureAction {
        if !retryable || job.attempts >= job.max_attempts {
            return FailureAction::DeadLetter;
        }
        let delay = chrono::Duration::from_std(self.backoff(job.attempts))
            .unwrap_or_else(|_| chrono::Duration::seconds(0));
        FailureAction::Retry(now + delay)
    }
}

/// Queue backend kept in process memory. Same transitions as the Postgres
/// backend; used by tests and local runs. Finished jobs are never pruned, so
/// memory grows with every job submitted.
pub struct MemoryStore {
    jobs: Mutex<HashMap<Uuid, Job>>,
    max_attempts: i32,
}

impl MemoryStore {
    pub fn new(max_attempts: i32) -> Self {
        MemoryStore {
            jobs: Mutex::new(HashMap::new()),
            max_attempts,
        }
    }

    fn with_jobs<T>(&self, f: impl FnOnce(&mut HashMap<Uuid, Job>) -> T) -> Result<T, Error> {
        let mut jobs = self
            .jobs
            .lock()
            .map_err(|_| anyhow!("memory store lock poisoned"))?;
        Ok(f(&mut jobs))
    }

    /// Applies `f` only while the job is still being processed by delivery `attempt`.
    fn transition(&self, id: Uuid, attempt: i32, f: impl FnOnce(&mut Job)) -> Result<(), Error> {
        self.with_jobs(|jobs| {
            if let Some(job) = jobs.get_mut(&id) {
                if job.status == Status::Processing && job.attempts == attempt {
                    f(job);
                }
            }
        })
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(RetryPolicy::default().max_attempts)
    }
}

#[async_trait]
impl JobStore for MemoryStore {
    async fn submit_job_request(&self, request: &JobRequest) -> Result<Uuid, Error> {
        let now = Utc::now();
        let job = Job {
            id: Uuid::new_v4(),
            queue: request.queue.clone(),
            payload: request.payload.clone(),
            status: Status::Queued,
            attempts: 0,
            max_attempts: self.max_attempts,
            last_error: None,
            created_at: now,
            run_at: now,
            started_at: None,
        };
        let id = job.id;
        self.with_jobs(|jobs| jobs.insert(id, job))?;
        Ok(id)
    }

    async fn claim_jobs(&self, queues: &[String], limit: i64) -> Result<Vec<Job>, Error> {
        let now = Utc::now();
        self.with_jobs(|jobs| {
            let mut ready: Vec<&mut Job> = jobs
                .values_mut()
                .filter(|job| {
                    job.status == Status::Queued && job.run_at <= now && queues.contains(&job.queue)
                })
                .collect();
            ready.sort_by_key(|job| (job.run_at, job.created_at));
            ready
                .into_iter()
                .take(limit.max(0) as usize)
                .map(|job| {
                    job.status = Status::Processing;
                    job.attempts += 1;
                    job.started_at = Some(now);
                    job.clone()
                })
                .collect()
        })
    }

    async fn complete_job(&self, id: Uuid, attempt: i32) -> Result<(), Error> {
        self.transition(id, attempt, |job| job.status = Status::Completed)
    }

    async fn retry_job(
        &self,
        id: Uuid,
        attempt: i32,
        error: &str,
        run_at: DateTime<Utc>,
    ) -> Result<(), Error> {
        self.transition(id, attempt, |job| {
            job.status = Status::Queued;
            job.last_error = Some(error.to_owned());
            job.run_at = run_at;
        })
    }

    async fn fail_job(&self, id: Uuid, attempt: i32, error: &str) -> Result<(), Error> {
        self.transition(id, attempt, |job| {
            job.status = Status::Failed;
            job.last_error = Some(error.to_owned());
        })
    }

    async fn release_job(&self, id: Uuid, attempt: i32) -> Result<(), Error> {
        self.transition(id, attempt, |job| {
            job.status = Status::Queued;
            job.attempts -= 1;
            job.started_at = None;
            job.run_at = Utc::now();
        })
    }

    async fn reclaim_stale_jobs(&self, timeout: Duration) -> Result<u64, Error> {
        let now = Utc::now();
        let cutoff = now - chrono::Duration::from_std(timeout)?;
        self.with_jobs(|jobs| {
            let mut reclaimed = 0;
            for job in jobs.values_mut() {
                let stale = job.status == Status::Processing
                    && job.started_at.map_or(true, |started| started <= cutoff);
                if !stale {
                    continue;
                }
                job.last_error = Some("job timed out".to_owned());
                if job.attempts >= job.max_attempts {
                    job.status = Status::Failed;
                } else {
                    job.status = Status::Queued;
                    job.run_at = now;
                }
                reclaimed += 1;
            }
            reclaimed
        })
    }

    async fn failed_jobs(&self, limit: i64) -> Result<Vec<Job>, Error> {
        self.with_jobs(|jobs| {
            let mut failed: Vec<Job> = jobs
                .values()
                .filter(|job| job.status == Status::Failed)
                .cloned()
                .collect();
            failed.sort_by_key(|job| job.created_at);
            failed.truncate(limit.max(0) as usize);
            failed
        })
    }

    async fn requeue_job(&self, id: Uuid) -> Result<bool, Error> {
        self.with_jobs(|jobs| match jobs.get_mut(&id) {
            Some(job) if job.status == Status::Failed => {
                job.status = Status::Queued;
                job.attempts = 0;
                job.run_at = Utc::now();
                true
            }
            _ => false,
        })
    }

    async fn job(&self, id: Uuid) -> Result<Option<Job>, Error> {
        self.with_jobs(|jobs| jobs.get(&id).cloned())
    }
}

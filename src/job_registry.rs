//! Authoritative store of job state across every backend adapter.
//!
//! Adapters report into the registry (queued, processing, progress, outcome) and answer their
//! own `job_status` / `active_jobs` queries from it. Updates to a job are serialized behind a
//! write lock; reads run concurrently. The lock is never held across an `.await`.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::TimeDelta;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::backend::BackendKind;
use crate::clock::{Clock, SystemClock};
use crate::error::{Error, Result};
use crate::job::{Job, JobId, JobState};
use crate::transcript::TranscriptionResult;

struct Entry {
    job: Job,
    cancel: CancellationToken,
}

/// What an adapter holds while it works on a job.
#[derive(Debug, Clone)]
pub struct JobHandle {
    id: JobId,
    cancel: CancellationToken,
}

impl JobHandle {
    pub fn id(&self) -> JobId {
        self.id
    }

    /// Fires when the job is cancelled through the registry.
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

pub struct JobRegistry {
    jobs: RwLock<HashMap<JobId, Entry>>,
    clock: Arc<dyn Clock>,
}

impl Default for JobRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            jobs: RwLock::new(HashMap::new()),
            clock,
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<JobId, Entry>> {
        self.jobs.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<JobId, Entry>> {
        self.jobs.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a new job in `queued` state.
    pub fn submit(&self, backend: BackendKind, file_name: Option<String>) -> JobHandle {
        let job = Job::queued(backend, file_name, self.clock.now());
        let handle = JobHandle {
            id: job.id,
            cancel: CancellationToken::new(),
        };
        debug!(job_id = %job.id, backend = %backend, "job queued");
        self.write().insert(
            job.id,
            Entry {
                job,
                cancel: handle.cancel.clone(),
            },
        );
        handle
    }

    fn transition(&self, id: JobId, next: JobState) -> bool {
        let now = self.clock.now();
        let mut jobs = self.write();
        match jobs.get_mut(&id) {
            Some(entry) => entry.job.transition(next, now),
            None => false,
        }
    }

    /// The adapter confirmed that work has started.
    pub fn mark_processing(&self, id: JobId) -> bool {
        self.transition(id, JobState::Processing)
    }

    /// Record progress for an active job. Values are clamped to `0.0..=1.0`.
    pub fn set_progress(&self, id: JobId, progress: f32) -> bool {
        let now = self.clock.now();
        let mut jobs = self.write();
        let Some(entry) = jobs.get_mut(&id) else {
            return false;
        };
        if entry.job.state.is_terminal() {
            return false;
        }
        entry.job.progress = progress.clamp(0.0, 1.0);
        entry.job.updated_at = now;
        true
    }

    /// Store the result. Returns `false` when the job already reached a terminal state
    /// (e.g. it was cancelled while the backend was still working).
    pub fn complete(&self, id: JobId, result: TranscriptionResult) -> bool {
        let now = self.clock.now();
        let mut jobs = self.write();
        let Some(entry) = jobs.get_mut(&id) else {
            return false;
        };
        if !entry.job.transition(JobState::Completed, now) {
            return false;
        }
        entry.job.result = Some(result);
        true
    }

    pub fn fail(&self, id: JobId, message: impl Into<String>) -> bool {
        let now = self.clock.now();
        let mut jobs = self.write();
        let Some(entry) = jobs.get_mut(&id) else {
            return false;
        };
        if !entry.job.transition(JobState::Failed, now) {
            return false;
        }
        entry.job.error = Some(message.into());
        true
    }

    /// Cancel a queued or processing job and fire its cancellation token.
    ///
    /// Returns `false` for unknown ids and for jobs already in a terminal state; a terminal
    /// job is left untouched.
    pub fn cancel(&self, id: JobId) -> bool {
        let now = self.clock.now();
        let mut jobs = self.write();
        let Some(entry) = jobs.get_mut(&id) else {
            return false;
        };
        if !entry.job.transition(JobState::Cancelled, now) {
            return false;
        }
        entry.cancel.cancel();
        info!(job_id = %id, backend = %entry.job.backend, "job cancelled");
        true
    }

    /// Cancel only if `backend` owns the job.
    pub fn cancel_for(&self, backend: BackendKind, id: JobId) -> bool {
        match self.get(id) {
            Some(job) if job.backend == backend => self.cancel(id),
            _ => false,
        }
    }

    pub fn get(&self, id: JobId) -> Option<Job> {
        self.read().get(&id).map(|entry| entry.job.clone())
    }

    pub fn get_for(&self, backend: BackendKind, id: JobId) -> Option<Job> {
        self.get(id).filter(|job| job.backend == backend)
    }

    /// Every queued or processing job, newest first.
    pub fn active_jobs(&self) -> Vec<Job> {
        self.collect_active(|_| true)
    }

    pub fn active_jobs_for(&self, backend: BackendKind) -> Vec<Job> {
        self.collect_active(|job| job.backend == backend)
    }

    fn collect_active(&self, keep: impl Fn(&Job) -> bool) -> Vec<Job> {
        let mut jobs: Vec<Job> = self
            .read()
            .values()
            .map(|entry| &entry.job)
            .filter(|job| job.is_active() && keep(job))
            .cloned()
            .collect();
        jobs.sort_by(|a, b| b.submitted_at.cmp(&a.submitted_at));
        jobs
    }

    /// Drop terminal jobs whose last update is older than `older_than`.
    pub fn prune_finished(&self, older_than: TimeDelta) -> usize {
        let cutoff = self.clock.now() - older_than;
        let mut jobs = self.write();
        let before = jobs.len();
        jobs.retain(|_, entry| entry.job.is_active() || entry.job.updated_at >= cutoff);
        let pruned = before - jobs.len();
        if pruned > 0 {
            debug!(pruned, "pruned finished jobs");
        }
        pruned
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Run `work` as a tracked job owned by `backend`.
    ///
    /// The job is queued before `work` starts; `work` is expected to call
    /// [`JobRegistry::mark_processing`] once the backend has picked it up. The outcome is
    /// recorded exactly once. If the job was cancelled while `work` ran, the outcome is
    /// discarded and [`Error::JobCancelled`] is returned. Dropping the returned future before
    /// it resolves (e.g. on a caller timeout) fails the job and fires its token.
    pub async fn run<F, Fut>(
        &self,
        backend: BackendKind,
        file_name: Option<String>,
        work: F,
    ) -> Result<TranscriptionResult>
    where
        F: FnOnce(JobHandle) -> Fut,
        Fut: Future<Output = Result<TranscriptionResult>>,
    {
        let handle = self.submit(backend, file_name);
        let id = handle.id;
        let token = handle.cancel.clone();

        let mut pending = Unsettled {
            registry: self,
            id,
            token: token.clone(),
            armed: true,
        };
        let outcome = work(handle).await;
        pending.armed = false;

        match outcome {
            Ok(mut result) => {
                result.job_id = id;
                if self.complete(id, result.clone()) {
                    Ok(result)
                } else {
                    Err(Error::JobCancelled {
                        method: backend,
                        job_id: id,
                    })
                }
            }
            Err(_) if token.is_cancelled() => Err(Error::JobCancelled {
                method: backend,
                job_id: id,
            }),
            Err(err) => {
                self.fail(id, err.to_string());
                Err(err)
            }
        }
    }
}

struct Unsettled<'a> {
    registry: &'a JobRegistry,
    id: JobId,
    token: CancellationToken,
    armed: bool,
}

impl Drop for Unsettled<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.token.cancel();
            self.registry.fail(self.id, "abandoned before completion");
        }
    }
}

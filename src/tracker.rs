use std::collections::HashMap;
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use tokio::sync::{watch, RwLock};
use uuid::Uuid;

use crate::error::{OrchestratorError, Result};
use crate::job::{Job, JobStatus};

/// Result of a non-blocking result lookup.
#[derive(Debug, Clone)]
pub enum JobOutcome {
    /// The job reached a terminal state; the full record is returned.
    Finished(Job),
    /// The job exists but is still pending or running.
    Pending,
    NotFound,
}

/// Result of a bounded wait. A timeout is a defined outcome, not an error:
/// it only means the job is still running.
#[derive(Debug, Clone)]
pub enum WaitOutcome {
    Finished(Job),
    TimedOut,
    NotFound,
}

/// Canonical owner of every job record and its status transitions.
///
/// Transitions are one-directional (`Pending → Running → terminal`); a
/// terminal state, once set, is never overwritten — later reports against a
/// finished or cancelled job are discarded. Each job carries a watch channel
/// broadcasting its status so `wait` never busy-polls and never misses a
/// completion that happened before the call.
#[derive(Debug)]
pub struct JobTracker {
    jobs: RwLock<HashMap<Uuid, Job>>,
    watchers: RwLock<HashMap<Uuid, watch::Sender<JobStatus>>>,
}

impl Default for JobTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl JobTracker {
    pub fn new() -> Self {
        Self {
            jobs: RwLock::new(HashMap::new()),
            watchers: RwLock::new(HashMap::new()),
        }
    }

    /// Register a new job. Job ids are globally unique and never reused;
    /// re-registering an id is rejected.
    pub async fn register(&self, job: Job) -> Result<Uuid> {
        let id = job.id;
        let status = job.status;
        {
            let mut jobs = self.jobs.write().await;
            if jobs.contains_key(&id) {
                return Err(OrchestratorError::Validation(format!(
                    "job id {id} already registered"
                )));
            }
            jobs.insert(id, job);
        }
        let (tx, _rx) = watch::channel(status);
        self.watchers.write().await.insert(id, tx);
        Ok(id)
    }

    pub async fn get(&self, id: Uuid) -> Option<Job> {
        self.jobs.read().await.get(&id).cloned()
    }

    /// Apply a status transition reported by the component owning execution.
    /// Updates to terminal jobs are ignored (first terminal writer wins);
    /// unknown jobs are an error.
    pub async fn update_status(
        &self,
        id: Uuid,
        status: JobStatus,
        result: Option<Value>,
        error: Option<String>,
    ) -> Result<()> {
        {
            let mut jobs = self.jobs.write().await;
            let job = jobs.get_mut(&id).ok_or(OrchestratorError::JobNotFound(id))?;
            if job.status.is_terminal() {
                tracing::debug!(
                    job_id = %id,
                    current = %job.status,
                    reported = %status,
                    "Ignoring update to terminal job"
                );
                return Ok(());
            }
            job.status = status;
            match status {
                JobStatus::Running => {
                    if job.started_at.is_none() {
                        job.started_at = Some(Utc::now());
                    }
                }
                s if s.is_terminal() => {
                    job.completed_at = Some(Utc::now());
                    job.result = result;
                    job.error = error;
                }
                _ => {}
            }
        }
        self.notify(id, status).await;
        Ok(())
    }

    /// Hand a pending job to a node: records the assignment and moves it to
    /// `Running`.
    pub async fn mark_running(&self, id: Uuid, node_id: Uuid) -> Result<()> {
        {
            let mut jobs = self.jobs.write().await;
            let job = jobs.get_mut(&id).ok_or(OrchestratorError::JobNotFound(id))?;
            if job.status != JobStatus::Pending {
                return Err(OrchestratorError::Validation(format!(
                    "job {id} is {} and cannot be dispatched",
                    job.status
                )));
            }
            job.status = JobStatus::Running;
            job.assigned_node = Some(node_id);
            if job.started_at.is_none() {
                job.started_at = Some(Utc::now());
            }
        }
        self.notify(id, JobStatus::Running).await;
        Ok(())
    }

    /// Return an orphaned job to the pending queue. `Some(retries)` tells the
    /// caller how many requeues the job has absorbed; `None` means the job
    /// was already terminal and there is nothing to requeue.
    pub async fn requeue(&self, id: Uuid) -> Result<Option<u32>> {
        let retries = {
            let mut jobs = self.jobs.write().await;
            let job = jobs.get_mut(&id).ok_or(OrchestratorError::JobNotFound(id))?;
            if job.status.is_terminal() {
                return Ok(None);
            }
            job.status = JobStatus::Pending;
            job.assigned_node = None;
            job.retries += 1;
            job.retries
        };
        self.notify(id, JobStatus::Pending).await;
        Ok(Some(retries))
    }

    /// Count a dispatch tick where no eligible node existed for this job.
    pub async fn note_dispatch_attempt(&self, id: Uuid) -> Result<u32> {
        let mut jobs = self.jobs.write().await;
        let job = jobs.get_mut(&id).ok_or(OrchestratorError::JobNotFound(id))?;
        job.dispatch_attempts += 1;
        Ok(job.dispatch_attempts)
    }

    pub async fn get_result(&self, id: Uuid) -> JobOutcome {
        match self.jobs.read().await.get(&id) {
            Some(job) if job.status.is_terminal() => JobOutcome::Finished(job.clone()),
            Some(_) => JobOutcome::Pending,
            None => JobOutcome::NotFound,
        }
    }

    /// Block until the job reaches a terminal state or `timeout` elapses,
    /// whichever comes first. Checks the current status before subscribing so
    /// a completion that preceded the call is returned immediately.
    pub async fn wait(&self, id: Uuid, timeout: Duration) -> WaitOutcome {
        let mut rx = {
            let watchers = self.watchers.read().await;
            match watchers.get(&id) {
                Some(tx) => tx.subscribe(),
                None => return WaitOutcome::NotFound,
            }
        };

        if !rx.borrow_and_update().is_terminal() {
            let finished = tokio::time::timeout(timeout, async {
                while rx.changed().await.is_ok() {
                    if rx.borrow_and_update().is_terminal() {
                        return true;
                    }
                }
                false
            })
            .await;

            match finished {
                Ok(true) => {}
                // Channel closed (job swept mid-wait) or deadline reached.
                Ok(false) | Err(_) => {
                    return match self.get_result(id).await {
                        JobOutcome::Finished(job) => WaitOutcome::Finished(job),
                        JobOutcome::Pending => WaitOutcome::TimedOut,
                        JobOutcome::NotFound => WaitOutcome::NotFound,
                    };
                }
            }
        }

        match self.get_result(id).await {
            JobOutcome::Finished(job) => WaitOutcome::Finished(job),
            JobOutcome::Pending => WaitOutcome::TimedOut,
            JobOutcome::NotFound => WaitOutcome::NotFound,
        }
    }

    /// Cancel a job and, for parents, every non-terminal child. A worker
    /// already executing a cancelled job may finish, but its report is
    /// discarded by the terminal-wins rule. Returns the ids actually
    /// cancelled.
    pub async fn cancel(&self, id: Uuid) -> Result<Vec<Uuid>> {
        let cancelled: Vec<Uuid> = {
            let mut jobs = self.jobs.write().await;
            if !jobs.contains_key(&id) {
                return Err(OrchestratorError::JobNotFound(id));
            }
            let children: Vec<Uuid> = jobs
                .values()
                .filter(|j| j.parent_id == Some(id))
                .map(|j| j.id)
                .collect();

            let mut cancelled = Vec::new();
            for target in std::iter::once(id).chain(children) {
                if let Some(job) = jobs.get_mut(&target) {
                    if !job.status.is_terminal() {
                        job.status = JobStatus::Cancelled;
                        job.completed_at = Some(Utc::now());
                        cancelled.push(target);
                    }
                }
            }
            cancelled
        };

        for target in &cancelled {
            self.notify(*target, JobStatus::Cancelled).await;
        }
        if !cancelled.is_empty() {
            tracing::info!(job_id = %id, cancelled = cancelled.len(), "Job cancelled");
        }
        Ok(cancelled)
    }

    pub async fn children_of(&self, parent_id: Uuid) -> Vec<Job> {
        let jobs = self.jobs.read().await;
        let mut children: Vec<Job> = jobs
            .values()
            .filter(|j| j.parent_id == Some(parent_id))
            .cloned()
            .collect();
        children.sort_by_key(|j| j.partition_index);
        children
    }

    /// `(completed, total)` over a parent's children, or over the job itself
    /// for a leaf.
    pub async fn progress(&self, id: Uuid) -> Option<(u32, u32)> {
        let jobs = self.jobs.read().await;
        let job = jobs.get(&id)?;
        if job.is_parent() {
            let children: Vec<&Job> = jobs.values().filter(|j| j.parent_id == Some(id)).collect();
            let completed = children
                .iter()
                .filter(|j| j.status == JobStatus::Completed)
                .count() as u32;
            Some((completed, children.len() as u32))
        } else {
            Some((u32::from(job.status == JobStatus::Completed), 1))
        }
    }

    /// Pending leaf jobs in dispatch order: priority first, then submission
    /// time.
    pub async fn pending_jobs(&self) -> Vec<Job> {
        let jobs = self.jobs.read().await;
        let mut pending: Vec<Job> = jobs
            .values()
            .filter(|j| j.status == JobStatus::Pending && !j.is_parent())
            .cloned()
            .collect();
        pending.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(a.submitted_at.cmp(&b.submitted_at))
        });
        pending
    }

    /// Non-terminal jobs currently assigned to a node.
    pub async fn jobs_for_node(&self, node_id: Uuid) -> Vec<Job> {
        let jobs = self.jobs.read().await;
        jobs.values()
            .filter(|j| j.assigned_node == Some(node_id) && !j.status.is_terminal())
            .cloned()
            .collect()
    }

    pub async fn all_jobs(&self) -> Vec<Job> {
        let mut jobs: Vec<Job> = self.jobs.read().await.values().cloned().collect();
        jobs.sort_by_key(|j| j.submitted_at);
        jobs
    }

    /// Delete jobs whose terminal timestamp is older than `retention`. A
    /// parent is only deleted once all of its children are gone too (they
    /// share the terminal window, so in practice they age out together).
    /// Returns the data references released by the deleted jobs.
    pub async fn cleanup(&self, retention: Duration) -> Vec<Uuid> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(retention).unwrap_or(chrono::Duration::zero());
        let mut released = Vec::new();
        let removed: Vec<Uuid> = {
            let mut jobs = self.jobs.write().await;
            let expired: Vec<Uuid> = jobs
                .values()
                .filter(|j| j.status.is_terminal())
                .filter(|j| j.completed_at.is_some_and(|t| t < cutoff))
                .map(|j| j.id)
                .collect();
            for id in &expired {
                if let Some(job) = jobs.remove(id) {
                    if let Some(data_ref) = job.data_ref {
                        released.push(data_ref);
                    }
                }
            }
            expired
        };

        if !removed.is_empty() {
            let mut watchers = self.watchers.write().await;
            for id in &removed {
                watchers.remove(id);
            }
            tracing::debug!(removed = removed.len(), "Cleanup sweep deleted jobs");
        }
        released
    }

    pub async fn len(&self) -> usize {
        self.jobs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.jobs.read().await.is_empty()
    }

    async fn notify(&self, id: Uuid, status: JobStatus) {
        if let Some(tx) = self.watchers.read().await.get(&id) {
            tx.send_replace(status);
        }
    }
}

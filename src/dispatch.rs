use std::sync::Arc;

use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::OrchestratorError;
use crate::registry::NodeRegistry;
use crate::tracker::JobTracker;

/// Outcome of one dispatch pass. `failed` carries jobs that reached a
/// terminal state during the pass so the orchestrator can finalize their
/// parents.
#[derive(Debug, Default)]
pub struct DispatchOutcome {
    pub assigned: usize,
    pub failed: Vec<Uuid>,
}

/// Assigns pending jobs to nodes chosen by the registry and absorbs node
/// loss by requeueing orphaned work within a bounded retry budget.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    tracker: Arc<JobTracker>,
    registry: Arc<RwLock<NodeRegistry>>,
    max_retries: u32,
    max_dispatch_attempts: u32,
}

impl Dispatcher {
    pub fn new(
        tracker: Arc<JobTracker>,
        registry: Arc<RwLock<NodeRegistry>>,
        max_retries: u32,
        max_dispatch_attempts: u32,
    ) -> Self {
        Self {
            tracker,
            registry,
            max_retries,
            max_dispatch_attempts,
        }
    }

    /// One dispatch tick: walk pending jobs in priority order and assign
    /// each to the least-loaded eligible node. Jobs with no eligible node
    /// stay pending and are retried next tick, up to the attempt budget,
    /// after which they fail with a no-capacity error.
    pub async fn dispatch_pending(&self) -> DispatchOutcome {
        let mut outcome = DispatchOutcome::default();

        for job in self.tracker.pending_jobs().await {
            let selected = {
                let registry = self.registry.read().await;
                registry.select_node(job.job_type, job.needs_gpu)
            };

            match selected {
                Ok(node_id) => {
                    if self.tracker.mark_running(job.id, node_id).await.is_ok() {
                        let mut registry = self.registry.write().await;
                        if let Err(e) = registry.record_assignment(node_id, job.id) {
                            tracing::warn!(job_id = %job.id, error = %e, "Assignment lost its node");
                            let _ = self.tracker.requeue(job.id).await;
                            continue;
                        }
                        tracing::info!(
                            job_id = %job.id,
                            node_id = %node_id,
                            job_type = %job.job_type,
                            "Job dispatched"
                        );
                        outcome.assigned += 1;
                    }
                }
                Err(OrchestratorError::NoEligibleNode(_)) => {
                    let attempts = self
                        .tracker
                        .note_dispatch_attempt(job.id)
                        .await
                        .unwrap_or(0);
                    if attempts >= self.max_dispatch_attempts {
                        tracing::warn!(
                            job_id = %job.id,
                            attempts,
                            "No capacity for job, marking failed"
                        );
                        let failed = self
                            .tracker
                            .update_status(
                                job.id,
                                crate::job::JobStatus::Failed,
                                None,
                                Some(format!(
                                    "no capacity: no eligible node after {attempts} dispatch attempts"
                                )),
                            )
                            .await;
                        if failed.is_ok() {
                            outcome.failed.push(job.id);
                        }
                    }
                }
                Err(e) => {
                    tracing::error!(job_id = %job.id, error = %e, "Node selection failed");
                }
            }
        }
        outcome
    }

    /// Requeue jobs orphaned by a dead node. Each job absorbs at most
    /// `max_retries` requeues; past that it fails with a node-failure error
    /// and counts against its parent's aggregation.
    pub async fn requeue_orphans(&self, orphans: Vec<Uuid>) -> Vec<Uuid> {
        let mut failed = Vec::new();
        for job_id in orphans {
            match self.tracker.requeue(job_id).await {
                Ok(Some(retries)) if retries > self.max_retries => {
                    tracing::warn!(job_id = %job_id, retries, "Retry budget exhausted");
                    let marked = self
                        .tracker
                        .update_status(
                            job_id,
                            crate::job::JobStatus::Failed,
                            None,
                            Some(format!("node failure: job lost {retries} assigned nodes")),
                        )
                        .await;
                    if marked.is_ok() {
                        failed.push(job_id);
                    }
                }
                Ok(Some(retries)) => {
                    tracing::info!(job_id = %job_id, retries, "Job requeued after node loss");
                }
                Ok(None) => {} // already terminal, nothing to requeue
                Err(e) => {
                    tracing::warn!(job_id = %job_id, error = %e, "Orphan requeue failed");
                }
            }
        }
        failed
    }
}

use std::sync::Arc;

use serde::Deserialize;
use serde_json::Value;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::aggregate::{self, AggregationStrategy};
use crate::config::OrchestratorConfig;
use crate::dataref::DataReferenceStore;
use crate::dispatch::Dispatcher;
use crate::error::{OrchestratorError, Result};
use crate::job::{Job, JobStatus, JobType};
use crate::partition::{self, DataShape, PartitionStrategy};
use crate::registry::{NodeHeartbeat, NodeRegistry};
use crate::tracker::JobTracker;

/// Partitioning request attached to a submission.
#[derive(Debug, Clone, Deserialize)]
pub struct PartitionSpec {
    #[serde(flatten)]
    pub strategy: PartitionStrategy,
    pub count: u32,
}

/// A logical job submission. Validation failures are rejected synchronously;
/// everything past validation is asynchronous and observable through job
/// status.
#[derive(Debug, Clone, Deserialize)]
pub struct SubmitRequest {
    pub job_type: JobType,
    #[serde(default)]
    pub parameters: Value,
    #[serde(default)]
    pub priority: u8,
    #[serde(default)]
    pub needs_gpu: bool,
    #[serde(default)]
    pub data_reference_id: Option<Uuid>,
    /// Explicit shape for submissions without a data reference.
    #[serde(default)]
    pub shape: Option<DataShape>,
    #[serde(default)]
    pub partition: Option<PartitionSpec>,
    #[serde(default)]
    pub aggregation_strategy: Option<AggregationStrategy>,
}

/// Terminal state a worker may report for a job it executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportedStatus {
    Completed,
    Failed,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WorkerReport {
    pub job_id: Uuid,
    pub status: ReportedStatus,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
}

/// Explicitly constructed owner of the orchestration state. Collaborators
/// receive it by reference; there is no process-wide instance.
pub struct Orchestrator {
    pub config: OrchestratorConfig,
    pub tracker: Arc<JobTracker>,
    pub registry: Arc<RwLock<NodeRegistry>>,
    pub data_store: Arc<DataReferenceStore>,
    dispatcher: Dispatcher,
}

impl Orchestrator {
    pub fn new(config: OrchestratorConfig) -> Self {
        let tracker = Arc::new(JobTracker::new());
        let registry = Arc::new(RwLock::new(NodeRegistry::new(
            config.heartbeat_interval,
            config.dead_threshold,
            config.oversubscription,
        )));
        let data_store = Arc::new(DataReferenceStore::new(
            config.shared_storage_dir.clone(),
            config.data_ref_ttl,
        ));
        let dispatcher = Dispatcher::new(
            tracker.clone(),
            registry.clone(),
            config.max_retries,
            config.max_dispatch_attempts,
        );
        Self {
            config,
            tracker,
            registry,
            data_store,
            dispatcher,
        }
    }

    /// Submit a logical job. Partitioned submissions produce a parent job
    /// plus one child per partition; the returned id is the parent's (or the
    /// single leaf's). Never blocks on execution.
    pub async fn submit(&self, request: SubmitRequest) -> Result<Uuid> {
        let data_ref = match request.data_reference_id {
            Some(id) => Some(
                self.data_store
                    .get(id)
                    .await
                    .ok_or(OrchestratorError::DataRefNotFound(id))?,
            ),
            None => None,
        };

        let mut job = Job::new(request.job_type, request.parameters)
            .with_priority(request.priority)
            .with_needs_gpu(request.needs_gpu);
        if let Some(reference) = &data_ref {
            job = job.with_data_ref(reference.id);
        }

        let Some(spec) = request.partition else {
            if let Some(reference) = &data_ref {
                self.data_store.retain(reference.id).await?;
            }
            let id = self.tracker.register(job).await?;
            tracing::info!(job_id = %id, job_type = %request.job_type, "Job submitted");
            return Ok(id);
        };

        let shape = request
            .shape
            .or(data_ref.as_ref().map(|r| r.dims))
            .ok_or_else(|| {
                OrchestratorError::Validation(
                    "partitioned submission needs a data reference or an explicit shape"
                        .to_string(),
                )
            })?;

        let plan = partition::plan(
            spec.strategy,
            spec.count,
            shape,
            self.config.max_partitions,
        )?;
        let children: Vec<Job> = plan
            .bounds
            .iter()
            .enumerate()
            .map(|(i, bounds)| job.child(i as u32, bounds))
            .collect();

        job.plan = Some(plan);
        job.aggregation = Some(
            request
                .aggregation_strategy
                .unwrap_or(AggregationStrategy::Custom),
        );
        // A parent is never dispatched; it runs for as long as its children.
        job.status = JobStatus::Running;
        job.started_at = Some(chrono::Utc::now());

        let parent_id = job.id;
        let child_count = children.len();
        if let Some(reference) = &data_ref {
            for _ in 0..=child_count {
                self.data_store.retain(reference.id).await?;
            }
        }
        self.tracker.register(job).await?;
        for child in children {
            self.tracker.register(child).await?;
        }

        tracing::info!(
            job_id = %parent_id,
            job_type = %request.job_type,
            partitions = child_count,
            "Partitioned job submitted"
        );
        Ok(parent_id)
    }

    /// Record a node heartbeat.
    pub async fn heartbeat(&self, hb: &NodeHeartbeat) {
        self.registry.write().await.heartbeat(hb);
    }

    /// Non-terminal jobs currently assigned to a node (the worker pull path).
    pub async fn assignments_for(&self, node_id: Uuid) -> Vec<Job> {
        self.tracker.jobs_for_node(node_id).await
    }

    /// Apply a worker's terminal report for a job it executed. Stale reports
    /// (job requeued to another node, or already terminal) are discarded.
    pub async fn report(&self, node_id: Uuid, report: WorkerReport) -> Result<()> {
        let job = self
            .tracker
            .get(report.job_id)
            .await
            .ok_or(OrchestratorError::JobNotFound(report.job_id))?;

        self.registry
            .write()
            .await
            .record_completion(node_id, report.job_id);

        if job.assigned_node != Some(node_id) {
            tracing::debug!(
                job_id = %report.job_id,
                node_id = %node_id,
                "Discarding report from non-assigned node"
            );
            return Ok(());
        }

        let status = match report.status {
            ReportedStatus::Completed => JobStatus::Completed,
            ReportedStatus::Failed => JobStatus::Failed,
        };
        self.tracker
            .update_status(report.job_id, status, report.result, report.error)
            .await?;

        if let Some(parent_id) = job.parent_id {
            self.finalize_parent_if_done(parent_id).await;
        }
        Ok(())
    }

    /// Cancel a job and transitively its not-yet-terminal children. Node
    /// slots held by the cancelled jobs are freed immediately (the assigned
    /// worker never reports a job that vanished from its pull), and any
    /// parent whose last open child was cancelled here is finalized.
    pub async fn cancel(&self, id: Uuid) -> Result<Vec<Uuid>> {
        let cancelled = self.tracker.cancel(id).await?;

        let mut parents = std::collections::HashSet::new();
        for job_id in &cancelled {
            let Some(job) = self.tracker.get(*job_id).await else {
                continue;
            };
            if let Some(node_id) = job.assigned_node {
                self.registry
                    .write()
                    .await
                    .record_completion(node_id, job.id);
            }
            if let Some(parent_id) = job.parent_id {
                parents.insert(parent_id);
            }
        }
        for parent_id in parents {
            self.finalize_parent_if_done(parent_id).await;
        }
        Ok(cancelled)
    }

    /// Once every child of a parent is terminal, derive the parent's outcome:
    /// any failed child fails the parent (no partial success), cancellation
    /// propagates, and otherwise the aggregation strategy produces the
    /// parent's result. Safe to call repeatedly; the terminal-wins rule in
    /// the tracker makes finalization effectively once-only.
    pub async fn finalize_parent_if_done(&self, parent_id: Uuid) {
        let Some(parent) = self.tracker.get(parent_id).await else {
            return;
        };
        if parent.status.is_terminal() {
            return;
        }
        let Some(plan) = &parent.plan else {
            return;
        };

        let children = self.tracker.children_of(parent_id).await;
        if (children.len() as u32) < plan.partition_count()
            || children.iter().any(|c| !c.status.is_terminal())
        {
            return;
        }

        let failed: Vec<u32> = children
            .iter()
            .filter(|c| c.status == JobStatus::Failed)
            .filter_map(|c| c.partition_index)
            .collect();
        let cancelled = children
            .iter()
            .any(|c| c.status == JobStatus::Cancelled);

        let transition = if !failed.is_empty() {
            let detail: Vec<String> = children
                .iter()
                .filter(|c| c.status == JobStatus::Failed)
                .map(|c| {
                    format!(
                        "partition {}: {}",
                        c.partition_index.unwrap_or_default(),
                        c.error.as_deref().unwrap_or("unknown error")
                    )
                })
                .collect();
            (
                JobStatus::Failed,
                None,
                Some(format!(
                    "{} of {} partitions failed: {}",
                    failed.len(),
                    children.len(),
                    detail.join("; ")
                )),
            )
        } else if cancelled {
            (JobStatus::Cancelled, None, None)
        } else {
            let strategy = parent.aggregation.unwrap_or(AggregationStrategy::Custom);
            let parts: Vec<(u32, Value)> = children
                .iter()
                .map(|c| {
                    (
                        c.partition_index.unwrap_or_default(),
                        c.result.clone().unwrap_or(Value::Null),
                    )
                })
                .collect();
            match aggregate::aggregate(strategy, parts) {
                Ok(result) => (JobStatus::Completed, Some(result), None),
                Err(e) => (JobStatus::Failed, None, Some(e.to_string())),
            }
        };

        let (status, result, error) = transition;
        if let Err(e) = self
            .tracker
            .update_status(parent_id, status, result, error)
            .await
        {
            tracing::warn!(job_id = %parent_id, error = %e, "Parent finalization lost its job");
        } else {
            tracing::info!(job_id = %parent_id, status = %status, "Parent job finalized");
        }
    }

    /// Spawn the periodic background loops: dispatch tick, node liveness
    /// sweep, and the retention sweeps for jobs and data references. All
    /// loops stop when `token` is cancelled.
    pub fn spawn_background(self: &Arc<Self>, token: CancellationToken) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();

        let orch = self.clone();
        let dispatch_token = token.clone();
        handles.push(tokio::spawn(async move {
            let mut tick = tokio::time::interval(orch.config.dispatch_tick);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = dispatch_token.cancelled() => break,
                    _ = tick.tick() => {
                        let outcome = orch.dispatcher.dispatch_pending().await;
                        for job_id in outcome.failed {
                            if let Some(parent_id) = orch.tracker.get(job_id).await.and_then(|j| j.parent_id) {
                                orch.finalize_parent_if_done(parent_id).await;
                            }
                        }
                    }
                }
            }
        }));

        let orch = self.clone();
        let liveness_token = token.clone();
        handles.push(tokio::spawn(async move {
            let mut tick = tokio::time::interval(orch.config.heartbeat_interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = liveness_token.cancelled() => break,
                    _ = tick.tick() => {
                        let orphans = orch.registry.write().await.liveness_sweep();
                        if !orphans.is_empty() {
                            let failed = orch.dispatcher.requeue_orphans(orphans).await;
                            for job_id in failed {
                                if let Some(parent_id) = orch.tracker.get(job_id).await.and_then(|j| j.parent_id) {
                                    orch.finalize_parent_if_done(parent_id).await;
                                }
                            }
                        }
                    }
                }
            }
        }));

        let orch = self.clone();
        let retention_token = token;
        handles.push(tokio::spawn(async move {
            let mut tick = tokio::time::interval(orch.config.sweep_interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = retention_token.cancelled() => break,
                    _ = tick.tick() => {
                        let released = orch.tracker.cleanup(orch.config.job_retention).await;
                        for data_ref in released {
                            orch.data_store.release(data_ref).await;
                        }
                        orch.data_store.sweep().await;
                    }
                }
            }
        }));

        handles
    }
}

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::aggregate::AggregationStrategy;
use crate::partition::{PartitionBounds, PartitionPlan};

/// Kinds of compute jobs the fleet knows how to run. The numerical kernels
/// behind these are opaque to the orchestrator; the variant only drives
/// capability matching during dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    CtFilter,
    Geomechanics,
    AcousticSim,
    MultiphaseSim,
    MonteCarlo,
}

impl std::fmt::Display for JobType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobType::CtFilter => write!(f, "ct_filter"),
            JobType::Geomechanics => write!(f, "geomechanics"),
            JobType::AcousticSim => write!(f, "acoustic_sim"),
            JobType::MultiphaseSim => write!(f, "multiphase_sim"),
            JobType::MonteCarlo => write!(f, "monte_carlo"),
        }
    }
}

impl std::str::FromStr for JobType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "ct_filter" => Ok(JobType::CtFilter),
            "geomechanics" => Ok(JobType::Geomechanics),
            "acoustic_sim" => Ok(JobType::AcousticSim),
            "multiphase_sim" => Ok(JobType::MultiphaseSim),
            "monte_carlo" => Ok(JobType::MonteCarlo),
            other => Err(format!("unknown job type: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    /// Terminal states are never overwritten; the first terminal writer wins.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Pending => write!(f, "pending"),
            JobStatus::Running => write!(f, "running"),
            JobStatus::Completed => write!(f, "completed"),
            JobStatus::Failed => write!(f, "failed"),
            JobStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// A unit of tracked work: either a leaf job executed by one node, or a
/// parent job whose status is derived from its partitioned children.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub job_type: JobType,
    pub params: Value,
    pub priority: u8,
    pub needs_gpu: bool,
    pub parent_id: Option<Uuid>,
    pub partition_index: Option<u32>,
    pub data_ref: Option<Uuid>,
    pub status: JobStatus,
    pub assigned_node: Option<Uuid>,
    pub retries: u32,
    pub dispatch_attempts: u32,
    pub submitted_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub result: Option<Value>,
    pub error: Option<String>,
    /// Set on parent jobs only; immutable once stored.
    pub plan: Option<PartitionPlan>,
    /// Set on parent jobs only.
    pub aggregation: Option<AggregationStrategy>,
}

impl Job {
    pub fn new(job_type: JobType, params: Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            job_type,
            params,
            priority: 0,
            needs_gpu: false,
            parent_id: None,
            partition_index: None,
            data_ref: None,
            status: JobStatus::Pending,
            assigned_node: None,
            retries: 0,
            dispatch_attempts: 0,
            submitted_at: Utc::now(),
            started_at: None,
            completed_at: None,
            result: None,
            error: None,
            plan: None,
            aggregation: None,
        }
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_data_ref(mut self, data_ref: Uuid) -> Self {
        self.data_ref = Some(data_ref);
        self
    }

    pub fn with_needs_gpu(mut self, needs_gpu: bool) -> Self {
        self.needs_gpu = needs_gpu;
        self
    }

    /// Derive a child job covering one partition of this parent. The child
    /// inherits type, priority, and data reference; its bounds are merged
    /// into the parameter bag under `"partition"`.
    pub fn child(&self, index: u32, bounds: &PartitionBounds) -> Job {
        let mut params = match &self.params {
            Value::Object(map) => Value::Object(map.clone()),
            Value::Null => Value::Object(serde_json::Map::new()),
            other => {
                let mut map = serde_json::Map::new();
                map.insert("args".to_string(), other.clone());
                Value::Object(map)
            }
        };
        if let Value::Object(map) = &mut params {
            map.insert(
                "partition".to_string(),
                serde_json::to_value(bounds).unwrap_or(Value::Null),
            );
        }

        let mut child = Job::new(self.job_type, params);
        child.priority = self.priority;
        child.needs_gpu = self.needs_gpu;
        child.parent_id = Some(self.id);
        child.partition_index = Some(index);
        child.data_ref = self.data_ref;
        child
    }

    pub fn is_parent(&self) -> bool {
        self.plan.is_some()
    }
}

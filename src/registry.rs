use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{OrchestratorError, Result};
use crate::job::JobType;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Availability {
    Available,
    Unavailable,
}

/// Periodic liveness and resource report from a worker node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeHeartbeat {
    pub node_id: Uuid,
    pub name: String,
    pub supported_job_types: Vec<JobType>,
    #[serde(default)]
    pub has_gpu: bool,
    pub cpu_cores: u32,
    pub cpu_util: f64,
    pub mem_util: f64,
    pub queue_depth: u32,
    /// Nominal parallel job slots this node offers.
    pub slots: u32,
}

/// Registry-owned state for one worker node. Other components only ever see
/// snapshots of this.
#[derive(Debug, Clone)]
pub struct NodeState {
    pub id: Uuid,
    pub name: String,
    pub supported_job_types: Vec<JobType>,
    pub has_gpu: bool,
    pub cpu_cores: u32,
    pub cpu_util: f64,
    pub mem_util: f64,
    pub queue_depth: u32,
    pub slots: u32,
    pub last_heartbeat: Instant,
    pub missed_heartbeats: u32,
    pub availability: Availability,
    pub assigned: HashSet<Uuid>,
    pub load_score: f64,
}

impl NodeState {
    fn from_heartbeat(hb: &NodeHeartbeat) -> Self {
        let mut node = Self {
            id: hb.node_id,
            name: hb.name.clone(),
            supported_job_types: hb.supported_job_types.clone(),
            has_gpu: hb.has_gpu,
            cpu_cores: hb.cpu_cores,
            cpu_util: hb.cpu_util,
            mem_util: hb.mem_util,
            queue_depth: hb.queue_depth,
            slots: hb.slots.max(1),
            last_heartbeat: Instant::now(),
            missed_heartbeats: 0,
            availability: Availability::Available,
            assigned: HashSet::new(),
            load_score: 0.0,
        };
        node.load_score = node.compute_load_score();
        node
    }

    /// Lower is preferred for dispatch. Queue depth is normalized by slot
    /// count so large nodes are not penalized for holding more work; GPU
    /// nodes get a small preference.
    fn compute_load_score(&self) -> f64 {
        let gpu_bonus = if self.has_gpu { 0.25 } else { 0.0 };
        self.cpu_util + self.mem_util + self.queue_depth as f64 / self.slots as f64 - gpu_bonus
    }

    fn supports(&self, job_type: JobType, needs_gpu: bool) -> bool {
        self.supported_job_types.contains(&job_type) && (!needs_gpu || self.has_gpu)
    }
}

/// Tracks connected worker nodes, their capabilities, and liveness. The
/// registry is the only mutator of node state; heartbeats touch only their
/// own node, and the liveness sweep runs as a periodic task.
#[derive(Debug)]
pub struct NodeRegistry {
    nodes: HashMap<Uuid, NodeState>,
    heartbeat_interval: Duration,
    dead_threshold: u32,
    oversubscription: f64,
}

impl NodeRegistry {
    pub fn new(heartbeat_interval: Duration, dead_threshold: u32, oversubscription: f64) -> Self {
        Self {
            nodes: HashMap::new(),
            heartbeat_interval,
            dead_threshold: dead_threshold.max(1),
            oversubscription: oversubscription.max(1.0),
        }
    }

    /// Upsert node state from a heartbeat: resets the missed counter, marks
    /// the node available again, and recomputes its load score.
    pub fn heartbeat(&mut self, hb: &NodeHeartbeat) {
        match self.nodes.get_mut(&hb.node_id) {
            Some(node) => {
                node.name = hb.name.clone();
                node.supported_job_types = hb.supported_job_types.clone();
                node.has_gpu = hb.has_gpu;
                node.cpu_cores = hb.cpu_cores;
                node.cpu_util = hb.cpu_util;
                node.mem_util = hb.mem_util;
                node.queue_depth = hb.queue_depth;
                node.slots = hb.slots.max(1);
                node.last_heartbeat = Instant::now();
                node.missed_heartbeats = 0;
                if node.availability == Availability::Unavailable {
                    tracing::info!(node_id = %hb.node_id, "Node available again");
                }
                node.availability = Availability::Available;
                node.load_score = node.compute_load_score();
            }
            None => {
                tracing::info!(
                    node_id = %hb.node_id,
                    name = %hb.name,
                    job_types = ?hb.supported_job_types,
                    has_gpu = hb.has_gpu,
                    "Node registered"
                );
                self.nodes
                    .insert(hb.node_id, NodeState::from_heartbeat(hb));
            }
        }
    }

    fn slot_limit(&self, node: &NodeState) -> usize {
        (node.slots as f64 * self.oversubscription) as usize
    }

    /// Pick the eligible node with the lowest load score. Eligibility is a
    /// capability superset match plus room under the oversubscription bound.
    pub fn select_node(&self, job_type: JobType, needs_gpu: bool) -> Result<Uuid> {
        self.nodes
            .values()
            .filter(|n| n.availability == Availability::Available)
            .filter(|n| n.supports(job_type, needs_gpu))
            .filter(|n| n.assigned.len() < self.slot_limit(n))
            .min_by(|a, b| a.load_score.total_cmp(&b.load_score))
            .map(|n| n.id)
            .ok_or_else(|| OrchestratorError::NoEligibleNode(job_type.to_string()))
    }

    pub fn record_assignment(&mut self, node_id: Uuid, job_id: Uuid) -> Result<()> {
        let node = self
            .nodes
            .get_mut(&node_id)
            .ok_or(OrchestratorError::NodeNotFound(node_id))?;
        node.assigned.insert(job_id);
        node.load_score = node.compute_load_score();
        Ok(())
    }

    pub fn record_completion(&mut self, node_id: Uuid, job_id: Uuid) {
        if let Some(node) = self.nodes.get_mut(&node_id) {
            node.assigned.remove(&job_id);
        }
    }

    /// Transition a node to unavailable and return the in-flight jobs it was
    /// holding so the dispatcher can requeue them.
    pub fn mark_dead(&mut self, node_id: Uuid) -> Vec<Uuid> {
        match self.nodes.get_mut(&node_id) {
            Some(node) => {
                node.availability = Availability::Unavailable;
                let orphans: Vec<Uuid> = node.assigned.drain().collect();
                tracing::warn!(
                    node_id = %node_id,
                    orphaned_jobs = orphans.len(),
                    "Node marked dead"
                );
                orphans
            }
            None => Vec::new(),
        }
    }

    /// Periodic liveness check: updates missed-heartbeat counters from the
    /// elapsed time and marks nodes past the threshold dead. Returns every
    /// orphaned in-flight job.
    pub fn liveness_sweep(&mut self) -> Vec<Uuid> {
        let interval_ms = self.heartbeat_interval.as_millis().max(1);
        let stale: Vec<Uuid> = self
            .nodes
            .values_mut()
            .filter(|n| n.availability == Availability::Available)
            .filter_map(|n| {
                n.missed_heartbeats = (n.last_heartbeat.elapsed().as_millis() / interval_ms) as u32;
                (n.missed_heartbeats >= self.dead_threshold).then_some(n.id)
            })
            .collect();

        let mut orphans = Vec::new();
        for node_id in stale {
            orphans.extend(self.mark_dead(node_id));
        }
        orphans
    }

    pub fn get(&self, node_id: Uuid) -> Option<&NodeState> {
        self.nodes.get(&node_id)
    }

    pub fn snapshot(&self) -> Vec<NodeState> {
        self.nodes.values().cloned().collect()
    }

    pub fn available_count(&self) -> usize {
        self.nodes
            .values()
            .filter(|n| n.availability == Availability::Available)
            .count()
    }
}

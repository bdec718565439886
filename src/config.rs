use std::path::PathBuf;
use std::time::Duration;

/// Tunables for the orchestrator and its background sweeps.
///
/// Defaults match the production deployment: workers heartbeat every 30
/// seconds, a node is declared dead after 3 missed heartbeats (~90s
/// detection latency), and terminal jobs are retained for one hour.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Expected interval between worker heartbeats.
    pub heartbeat_interval: Duration,
    /// Consecutive missed heartbeats before a node is marked dead.
    pub dead_threshold: u32,
    /// How long terminal jobs are kept before the cleanup sweep deletes them.
    pub job_retention: Duration,
    /// Time-to-live for registered data references.
    pub data_ref_ttl: Duration,
    /// Interval of the retention sweeps (jobs and data references).
    pub sweep_interval: Duration,
    /// Interval of the dispatch tick that assigns pending jobs.
    pub dispatch_tick: Duration,
    /// Redispatch budget for jobs orphaned by a dead node.
    pub max_retries: u32,
    /// Dispatch ticks a job may sit without an eligible node before it is
    /// failed with a no-capacity error.
    pub max_dispatch_attempts: u32,
    /// A node may hold up to `slots * oversubscription` assigned jobs.
    pub oversubscription: f64,
    /// Upper bound on the partition count of a single submission.
    pub max_partitions: u32,
    /// Directory reachable by all nodes for shared data-reference copies.
    pub shared_storage_dir: PathBuf,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(30),
            dead_threshold: 3,
            job_retention: Duration::from_secs(3600),
            data_ref_ttl: Duration::from_secs(24 * 3600),
            sweep_interval: Duration::from_secs(60),
            dispatch_tick: Duration::from_millis(500),
            max_retries: 3,
            max_dispatch_attempts: 10,
            oversubscription: 2.0,
            max_partitions: 64,
            shared_storage_dir: std::env::temp_dir().join("coregrid-shared"),
        }
    }
}

impl OrchestratorConfig {
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_dead_threshold(mut self, threshold: u32) -> Self {
        self.dead_threshold = threshold;
        self
    }

    pub fn with_job_retention(mut self, retention: Duration) -> Self {
        self.job_retention = retention;
        self
    }

    pub fn with_data_ref_ttl(mut self, ttl: Duration) -> Self {
        self.data_ref_ttl = ttl;
        self
    }

    pub fn with_dispatch_tick(mut self, tick: Duration) -> Self {
        self.dispatch_tick = tick;
        self
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    pub fn with_max_dispatch_attempts(mut self, attempts: u32) -> Self {
        self.max_dispatch_attempts = attempts;
        self
    }

    pub fn with_max_partitions(mut self, max: u32) -> Self {
        self.max_partitions = max;
        self
    }

    pub fn with_shared_storage_dir(mut self, dir: PathBuf) -> Self {
        self.shared_storage_dir = dir;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults() {
        let cfg = OrchestratorConfig::default();
        assert_eq!(cfg.heartbeat_interval, Duration::from_secs(30));
        assert_eq!(cfg.dead_threshold, 3);
        assert_eq!(cfg.job_retention, Duration::from_secs(3600));
        assert_eq!(cfg.max_retries, 3);
        assert_eq!(cfg.max_partitions, 64);
        assert!(cfg.oversubscription > 1.0);
    }

    #[test]
    fn config_builders() {
        let cfg = OrchestratorConfig::default()
            .with_heartbeat_interval(Duration::from_millis(50))
            .with_dead_threshold(2)
            .with_max_partitions(8);
        assert_eq!(cfg.heartbeat_interval, Duration::from_millis(50));
        assert_eq!(cfg.dead_threshold, 2);
        assert_eq!(cfg.max_partitions, 8);
    }
}

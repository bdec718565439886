
use std::time::Duration;

use coregrid::error::OrchestratorError;
use coregrid::job::JobType;
use coregrid::registry::NodeRegistry;
use test_harness::heartbeat;
use uuid::Uuid;

fn registry() -> NodeRegistry {
    NodeRegistry::new(Duration::from_millis(30), 2, 2.0)
}

#[test]
fn heartbeat_registers_and_updates_node() {
    let mut registry = registry();
    let mut hb = heartbeat("rig-01", vec![JobType::CtFilter]);
    registry.heartbeat(&hb);
    assert_eq!(registry.available_count(), 1);

    hb.cpu_util = 0.9;
    registry.heartbeat(&hb);
    let node = registry.get(hb.node_id).unwrap();
    assert_eq!(node.cpu_util, 0.9);
    assert_eq!(node.missed_heartbeats, 0);
}

#[test]
fn select_node_prefers_lowest_load_score() {
    let mut registry = registry();
    let mut idle = heartbeat("idle", vec![JobType::CtFilter]);
    idle.cpu_util = 0.1;
    let mut busy = heartbeat("busy", vec![JobType::CtFilter]);
    busy.cpu_util = 0.9;
    registry.heartbeat(&busy);
    registry.heartbeat(&idle);

    let selected = registry.select_node(JobType::CtFilter, false).unwrap();
    assert_eq!(selected, idle.node_id);
}

#[test]
fn select_node_matches_capabilities() {
    let mut registry = registry();
    let ct_only = heartbeat("ct-only", vec![JobType::CtFilter]);
    registry.heartbeat(&ct_only);

    assert!(registry.select_node(JobType::CtFilter, false).is_ok());
    let err = registry
        .select_node(JobType::AcousticSim, false)
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::NoEligibleNode(_)));
}

#[test]
fn select_node_respects_gpu_requirement() {
    let mut registry = registry();
    let cpu_node = heartbeat("cpu", vec![JobType::AcousticSim]);
    let mut gpu_node = heartbeat("gpu", vec![JobType::AcousticSim]);
    gpu_node.has_gpu = true;
    // GPU node is busier, but the requirement excludes the idle CPU node.
    gpu_node.cpu_util = 0.8;
    registry.heartbeat(&cpu_node);
    registry.heartbeat(&gpu_node);

    let selected = registry.select_node(JobType::AcousticSim, true).unwrap();
    assert_eq!(selected, gpu_node.node_id);
}

#[test]
fn oversubscription_bounds_assignments() {
    let mut registry = registry();
    let mut hb = heartbeat("small", vec![JobType::MonteCarlo]);
    hb.slots = 1; // oversubscription 2.0 allows two assigned jobs
    registry.heartbeat(&hb);

    for _ in 0..2 {
        let node = registry.select_node(JobType::MonteCarlo, false).unwrap();
        registry.record_assignment(node, Uuid::new_v4()).unwrap();
    }
    let err = registry.select_node(JobType::MonteCarlo, false).unwrap_err();
    assert!(matches!(err, OrchestratorError::NoEligibleNode(_)));
}

#[test]
fn completion_frees_a_slot() {
    let mut registry = registry();
    let mut hb = heartbeat("small", vec![JobType::MonteCarlo]);
    hb.slots = 1;
    registry.heartbeat(&hb);

    let job_a = Uuid::new_v4();
    let job_b = Uuid::new_v4();
    registry.record_assignment(hb.node_id, job_a).unwrap();
    registry.record_assignment(hb.node_id, job_b).unwrap();
    assert!(registry.select_node(JobType::MonteCarlo, false).is_err());

    registry.record_completion(hb.node_id, job_a);
    assert!(registry.select_node(JobType::MonteCarlo, false).is_ok());
}

#[test]
fn liveness_sweep_marks_silent_nodes_dead_and_returns_orphans() {
    let mut registry = registry();
    let hb = heartbeat("flaky", vec![JobType::Geomechanics]);
    registry.heartbeat(&hb);

    let job = Uuid::new_v4();
    registry.record_assignment(hb.node_id, job).unwrap();

    // Silent for more than 2 intervals (30ms each).
    std::thread::sleep(Duration::from_millis(100));
    let orphans = registry.liveness_sweep();
    assert_eq!(orphans, vec![job]);
    assert_eq!(registry.available_count(), 0);
    assert!(registry.select_node(JobType::Geomechanics, false).is_err());
}

#[test]
fn heartbeat_revives_a_dead_node() {
    let mut registry = registry();
    let hb = heartbeat("flaky", vec![JobType::Geomechanics]);
    registry.heartbeat(&hb);

    std::thread::sleep(Duration::from_millis(100));
    registry.liveness_sweep();
    assert_eq!(registry.available_count(), 0);

    registry.heartbeat(&hb);
    assert_eq!(registry.available_count(), 1);
    assert_eq!(registry.get(hb.node_id).unwrap().missed_heartbeats, 0);
}

#[test]
fn mark_dead_drains_assigned_jobs() {
    let mut registry = registry();
    let hb = heartbeat("doomed", vec![JobType::CtFilter]);
    registry.heartbeat(&hb);

    let jobs = [Uuid::new_v4(), Uuid::new_v4()];
    for job in jobs {
        registry.record_assignment(hb.node_id, job).unwrap();
    }
    let mut orphans = registry.mark_dead(hb.node_id);
    orphans.sort();
    let mut expected = jobs.to_vec();
    expected.sort();
    assert_eq!(orphans, expected);
}

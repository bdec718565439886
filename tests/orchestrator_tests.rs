
use std::time::Duration;

use serde_json::json;
use tempfile::TempDir;
use uuid::Uuid;

use coregrid::aggregate::AggregationStrategy;
use coregrid::job::{JobStatus, JobType};
use coregrid::orchestrator::{PartitionSpec, SubmitRequest};
use coregrid::partition::{DataShape, PartitionStrategy};
use coregrid::tracker::WaitOutcome;
use test_harness::{assert_eventually, heartbeat, test_config, TestRig};

/// Test config with the liveness sweep effectively disabled, for scenarios
/// where nodes heartbeat once and must stay alive for the whole test.
fn steady_config() -> coregrid::config::OrchestratorConfig {
    test_config().with_heartbeat_interval(Duration::from_secs(60))
}

fn submit_request(job_type: JobType) -> SubmitRequest {
    SubmitRequest {
        job_type,
        parameters: json!({}),
        priority: 0,
        needs_gpu: false,
        data_reference_id: None,
        shape: None,
        partition: None,
        aggregation_strategy: None,
    }
}

#[tokio::test]
async fn leaf_job_runs_to_completion() {
    let rig = TestRig::new(steady_config());
    rig.orch
        .heartbeat(&heartbeat("rig-01", vec![JobType::Geomechanics]))
        .await;

    let job_id = rig
        .orch
        .submit(submit_request(JobType::Geomechanics))
        .await
        .unwrap();

    assert_eventually(
        || async {
            rig.orch
                .tracker
                .get(job_id)
                .await
                .is_some_and(|j| j.status == JobStatus::Running)
        },
        Duration::from_secs(2),
        "job never dispatched",
    )
    .await;

    rig.report_completed(job_id, json!({"stress_peak": 18.4})).await;

    let outcome = rig.orch.tracker.wait(job_id, Duration::from_secs(2)).await;
    let WaitOutcome::Finished(job) = outcome else {
        panic!("expected finished job");
    };
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.result, Some(json!({"stress_peak": 18.4})));
    assert_eq!(rig.orch.tracker.progress(job_id).await, Some((1, 1)));
}

#[tokio::test]
async fn partitioned_volume_runs_all_slabs_and_concatenates() {
    let rig = TestRig::new(steady_config());
    for name in ["rig-01", "rig-02"] {
        rig.orch
            .heartbeat(&heartbeat(name, vec![JobType::CtFilter]))
            .await;
    }

    // Register the CT volume and split it into eight depth slabs.
    let data_dir = TempDir::new().unwrap();
    let volume = data_dir.path().join("core-2048.raw");
    tokio::fs::write(&volume, b"synthetic volume").await.unwrap();
    let reference = rig
        .orch
        .data_store
        .register(&volume, "ct_volume", DataShape::volume(2048, 2048, 2048), false)
        .await
        .unwrap();

    let mut request = submit_request(JobType::CtFilter);
    request.data_reference_id = Some(reference.id);
    request.partition = Some(PartitionSpec {
        strategy: PartitionStrategy::SpatialZ { overlap: 2 },
        count: 8,
    });
    request.aggregation_strategy = Some(AggregationStrategy::Concatenate);
    let parent_id = rig.orch.submit(request).await.unwrap();

    let children = rig.orch.tracker.children_of(parent_id).await;
    assert_eq!(children.len(), 8);
    for child in &children {
        assert_eq!(child.data_ref, Some(reference.id));
        assert!(child.params.get("partition").is_some());
    }

    assert_eventually(
        || async {
            let children = rig.orch.tracker.children_of(parent_id).await;
            children.iter().all(|c| c.status == JobStatus::Running)
        },
        Duration::from_secs(2),
        "not all slabs were dispatched",
    )
    .await;

    for child in rig.orch.tracker.children_of(parent_id).await {
        let index = child.partition_index.unwrap();
        rig.report_completed(child.id, json!([index])).await;
    }

    let outcome = rig.orch.tracker.wait(parent_id, Duration::from_secs(2)).await;
    let WaitOutcome::Finished(parent) = outcome else {
        panic!("expected finished parent");
    };
    assert_eq!(parent.status, JobStatus::Completed);
    assert_eq!(parent.result, Some(json!([0, 1, 2, 3, 4, 5, 6, 7])));
    assert_eq!(rig.orch.tracker.progress(parent_id).await, Some((8, 8)));
}

#[tokio::test]
async fn failed_slab_fails_the_parent_with_partition_detail() {
    let rig = TestRig::new(steady_config());
    rig.orch
        .heartbeat(&heartbeat("rig-01", vec![JobType::AcousticSim]))
        .await;

    let mut request = submit_request(JobType::AcousticSim);
    request.shape = Some(DataShape::volume(64, 64, 64));
    request.partition = Some(PartitionSpec {
        strategy: PartitionStrategy::SpatialZ { overlap: 0 },
        count: 4,
    });
    request.aggregation_strategy = Some(AggregationStrategy::Merge);
    let parent_id = rig.orch.submit(request).await.unwrap();

    assert_eventually(
        || async {
            let children = rig.orch.tracker.children_of(parent_id).await;
            children.iter().all(|c| c.status == JobStatus::Running)
        },
        Duration::from_secs(2),
        "not all slabs were dispatched",
    )
    .await;

    for child in rig.orch.tracker.children_of(parent_id).await {
        match child.partition_index.unwrap() {
            2 => rig.report_failed(child.id, "solver diverged").await,
            _ => rig.report_completed(child.id, json!({"ok": true})).await,
        }
    }

    let WaitOutcome::Finished(parent) =
        rig.orch.tracker.wait(parent_id, Duration::from_secs(2)).await
    else {
        panic!("expected finished parent");
    };
    assert_eq!(parent.status, JobStatus::Failed);
    let error = parent.error.unwrap();
    assert!(error.contains("1 of 4 partitions failed"), "{error}");
    assert!(error.contains("partition 2: solver diverged"), "{error}");
}

#[tokio::test]
async fn cancelling_a_parent_cancels_children_and_discards_late_reports() {
    let rig = TestRig::new(steady_config());
    rig.orch
        .heartbeat(&heartbeat("rig-01", vec![JobType::MonteCarlo]))
        .await;

    let mut request = submit_request(JobType::MonteCarlo);
    request.shape = Some(DataShape::volume(1, 1, 1));
    request.partition = Some(PartitionSpec {
        strategy: PartitionStrategy::Random { seed: 99 },
        count: 4,
    });
    let parent_id = rig.orch.submit(request).await.unwrap();

    assert_eventually(
        || async {
            let children = rig.orch.tracker.children_of(parent_id).await;
            children.iter().all(|c| c.status == JobStatus::Running)
        },
        Duration::from_secs(2),
        "not all buckets were dispatched",
    )
    .await;

    let cancelled = rig.orch.cancel(parent_id).await.unwrap();
    assert_eq!(cancelled.len(), 5); // parent + four children

    // A worker finishing after the cancellation changes nothing.
    let child = rig.orch.tracker.children_of(parent_id).await.remove(0);
    let node = child.assigned_node.unwrap();
    rig.orch
        .report(
            node,
            coregrid::orchestrator::WorkerReport {
                job_id: child.id,
                status: coregrid::orchestrator::ReportedStatus::Completed,
                result: Some(json!(1)),
                error: None,
            },
        )
        .await
        .unwrap();

    let child = rig.orch.tracker.get(child.id).await.unwrap();
    assert_eq!(child.status, JobStatus::Cancelled);
    assert!(child.result.is_none());
    assert_eq!(
        rig.orch.tracker.get(parent_id).await.unwrap().status,
        JobStatus::Cancelled
    );
}

#[tokio::test]
async fn cancelling_the_last_open_child_finalizes_the_parent() {
    let rig = TestRig::new(steady_config());
    rig.orch
        .heartbeat(&heartbeat("rig-01", vec![JobType::CtFilter]))
        .await;

    let mut request = submit_request(JobType::CtFilter);
    request.shape = Some(DataShape::volume(64, 64, 64));
    request.partition = Some(PartitionSpec {
        strategy: PartitionStrategy::SpatialZ { overlap: 0 },
        count: 2,
    });
    request.aggregation_strategy = Some(AggregationStrategy::Concatenate);
    let parent_id = rig.orch.submit(request).await.unwrap();

    assert_eventually(
        || async {
            let children = rig.orch.tracker.children_of(parent_id).await;
            children.iter().all(|c| c.status == JobStatus::Running)
        },
        Duration::from_secs(2),
        "not all slabs were dispatched",
    )
    .await;

    let children = rig.orch.tracker.children_of(parent_id).await;
    rig.report_completed(children[0].id, json!([0])).await;
    rig.orch.cancel(children[1].id).await.unwrap();

    // The cancelled child was the last open one; the parent must settle as
    // cancelled rather than staying running forever.
    let WaitOutcome::Finished(parent) =
        rig.orch.tracker.wait(parent_id, Duration::from_secs(2)).await
    else {
        panic!("parent never reached a terminal state");
    };
    assert_eq!(parent.status, JobStatus::Cancelled);
    assert!(parent.result.is_none());
}

#[tokio::test]
async fn cancellation_frees_the_node_slot() {
    let rig = TestRig::new(steady_config());
    let mut hb = heartbeat("small", vec![JobType::MonteCarlo]);
    hb.slots = 1; // oversubscription 2.0 allows two assigned jobs
    rig.orch.heartbeat(&hb).await;

    let mut job_ids = Vec::new();
    for _ in 0..2 {
        job_ids.push(
            rig.orch
                .submit(submit_request(JobType::MonteCarlo))
                .await
                .unwrap(),
        );
    }
    assert_eventually(
        || async {
            let mut running = 0;
            for id in &job_ids {
                if rig
                    .orch
                    .tracker
                    .get(*id)
                    .await
                    .is_some_and(|j| j.status == JobStatus::Running)
                {
                    running += 1;
                }
            }
            running == 2
        },
        Duration::from_secs(2),
        "jobs never filled the node",
    )
    .await;

    for id in &job_ids {
        rig.orch.cancel(*id).await.unwrap();
    }
    let held = rig
        .orch
        .registry
        .read()
        .await
        .get(hb.node_id)
        .map(|n| n.assigned.len())
        .unwrap_or_default();
    assert_eq!(held, 0, "cancelled jobs must release their slots");

    // A fresh job can use the freed capacity.
    let next = rig
        .orch
        .submit(submit_request(JobType::MonteCarlo))
        .await
        .unwrap();
    assert_eventually(
        || async {
            rig.orch
                .tracker
                .get(next)
                .await
                .is_some_and(|j| j.status == JobStatus::Running)
        },
        Duration::from_secs(2),
        "freed slot was never reused",
    )
    .await;
}

#[tokio::test]
async fn job_with_no_eligible_node_eventually_fails_for_capacity() {
    let rig = TestRig::new(steady_config());
    // The only node speaks a different job type.
    rig.orch
        .heartbeat(&heartbeat("rig-01", vec![JobType::CtFilter]))
        .await;

    let job_id = rig
        .orch
        .submit(submit_request(JobType::MultiphaseSim))
        .await
        .unwrap();

    // max_dispatch_attempts ticks at 20ms each, plus slack.
    assert_eventually(
        || async {
            rig.orch
                .tracker
                .get(job_id)
                .await
                .is_some_and(|j| j.status == JobStatus::Failed)
        },
        Duration::from_secs(3),
        "undispatchable job never failed",
    )
    .await;

    let job = rig.orch.tracker.get(job_id).await.unwrap();
    assert!(job.error.unwrap().contains("no capacity"));
}

#[tokio::test]
async fn dead_node_orphans_are_requeued_to_a_live_node() {
    let rig = TestRig::new(test_config());
    let silent = heartbeat("silent", vec![JobType::CtFilter]);
    rig.orch.heartbeat(&silent).await;

    let job_id = rig
        .orch
        .submit(submit_request(JobType::CtFilter))
        .await
        .unwrap();

    assert_eventually(
        || async {
            rig.orch
                .tracker
                .get(job_id)
                .await
                .is_some_and(|j| j.assigned_node == Some(silent.node_id))
        },
        Duration::from_secs(2),
        "job never assigned to the first node",
    )
    .await;

    // The first node goes silent; a second one keeps heartbeating. After two
    // missed intervals the liveness sweep reassigns the orphan.
    let live = heartbeat("live", vec![JobType::CtFilter]);
    assert_eventually(
        || async {
            rig.orch.heartbeat(&live).await;
            rig.orch
                .tracker
                .get(job_id)
                .await
                .is_some_and(|j| {
                    j.assigned_node == Some(live.node_id) && j.status == JobStatus::Running
                })
        },
        Duration::from_secs(3),
        "orphan never requeued to the live node",
    )
    .await;

    let job = rig.orch.tracker.get(job_id).await.unwrap();
    assert_eq!(job.retries, 1);

    rig.report_completed(job_id, json!({"ok": true})).await;
    let WaitOutcome::Finished(job) = rig.orch.tracker.wait(job_id, Duration::from_secs(2)).await
    else {
        panic!("expected finished job");
    };
    assert_eq!(job.status, JobStatus::Completed);
}

#[tokio::test]
async fn submission_against_unknown_data_reference_is_rejected() {
    let rig = TestRig::new(steady_config());
    let mut request = submit_request(JobType::CtFilter);
    request.data_reference_id = Some(Uuid::new_v4());

    let err = rig.orch.submit(request).await.unwrap_err();
    assert!(matches!(
        err,
        coregrid::error::OrchestratorError::DataRefNotFound(_)
    ));
}

#[tokio::test]
async fn partitioned_submission_without_shape_is_rejected() {
    let rig = TestRig::new(steady_config());
    let mut request = submit_request(JobType::CtFilter);
    request.partition = Some(PartitionSpec {
        strategy: PartitionStrategy::SpatialZ { overlap: 0 },
        count: 4,
    });

    let err = rig.orch.submit(request).await.unwrap_err();
    assert!(matches!(
        err,
        coregrid::error::OrchestratorError::Validation(_)
    ));
}

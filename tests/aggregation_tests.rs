use serde_json::json;

use coregrid::aggregate::{aggregate, AggregationStrategy};
use coregrid::error::OrchestratorError;
use coregrid::partition::{plan, DataShape, PartitionBounds, PartitionStrategy};

#[test]
fn concatenate_orders_by_partition_index() {
    let parts = vec![
        (2, json!([5, 6])),
        (0, json!([1, 2])),
        (1, json!([3, 4])),
    ];
    let result = aggregate(AggregationStrategy::Concatenate, parts).unwrap();
    assert_eq!(result, json!([1, 2, 3, 4, 5, 6]));
}

#[test]
fn concatenate_joins_strings() {
    let parts = vec![(1, json!("world")), (0, json!("hello "))];
    let result = aggregate(AggregationStrategy::Concatenate, parts).unwrap();
    assert_eq!(result, json!("hello world"));
}

#[test]
fn concatenate_rejects_mixed_result_types() {
    let parts = vec![(0, json!([1])), (1, json!("nope"))];
    let err = aggregate(AggregationStrategy::Concatenate, parts).unwrap_err();
    assert!(matches!(err, OrchestratorError::Aggregation(_)));
}

/// Concatenating the per-slab outputs of an identity-like operation over a
/// SpatialZ plan must reproduce the unpartitioned output byte for byte.
#[test]
fn concatenate_of_spatial_z_slices_reproduces_whole_input() {
    let depth = 40u32;
    let input: Vec<u64> = (0..depth as u64).collect();
    let whole = json!(input);

    let shape = DataShape::volume(8, 8, depth);
    let p = plan(PartitionStrategy::SpatialZ { overlap: 0 }, 7, shape, 64).unwrap();

    // Each child runs the identity operation over its core slab.
    let parts: Vec<(u32, serde_json::Value)> = p
        .bounds
        .iter()
        .enumerate()
        .map(|(i, bounds)| {
            let PartitionBounds::DepthRange { z0, z1, .. } = bounds else {
                panic!("expected depth range");
            };
            let slice: Vec<u64> = (*z0 as u64..*z1 as u64).collect();
            (i as u32, json!(slice))
        })
        .collect();

    let combined = aggregate(AggregationStrategy::Concatenate, parts).unwrap();
    assert_eq!(combined, whole);
}

#[test]
fn merge_sums_colliding_counters_and_keeps_disjoint_fields() {
    let parts = vec![
        (0, json!({"pores": 120, "stats": {"mean": 1.5}, "slab_0": true})),
        (1, json!({"pores": 80, "stats": {"max": 9.0}, "slab_1": true})),
    ];
    let result = aggregate(AggregationStrategy::Merge, parts).unwrap();
    assert_eq!(result["pores"], json!(200.0));
    assert_eq!(result["stats"]["mean"], json!(1.5));
    assert_eq!(result["stats"]["max"], json!(9.0));
    assert_eq!(result["slab_0"], json!(true));
    assert_eq!(result["slab_1"], json!(true));
}

#[test]
fn merge_concatenates_colliding_arrays() {
    let parts = vec![
        (0, json!({"anomalies": [1, 2]})),
        (1, json!({"anomalies": [3]})),
    ];
    let result = aggregate(AggregationStrategy::Merge, parts).unwrap();
    assert_eq!(result["anomalies"], json!([1, 2, 3]));
}

#[test]
fn merge_rejects_non_object_results() {
    let parts = vec![(0, json!({"a": 1})), (1, json!(3))];
    let err = aggregate(AggregationStrategy::Merge, parts).unwrap_err();
    assert!(matches!(err, OrchestratorError::Aggregation(_)));
}

#[test]
fn sum_reduces_scalars() {
    let parts = vec![(0, json!(1.5)), (1, json!(2.0)), (2, json!(3.5))];
    let result = aggregate(AggregationStrategy::Sum, parts).unwrap();
    assert_eq!(result, json!(7.0));
}

#[test]
fn sum_rejects_non_numeric_children() {
    let parts = vec![(0, json!(1.0)), (1, json!("two"))];
    let err = aggregate(AggregationStrategy::Sum, parts).unwrap_err();
    assert!(matches!(err, OrchestratorError::Aggregation(_)));
}

/// Average divides by the number of successful children, not the nominal
/// partition count: with three results the divisor is three.
#[test]
fn average_divides_by_successful_count() {
    let parts = vec![(0, json!(3.0)), (1, json!(6.0)), (2, json!(9.0))];
    let result = aggregate(AggregationStrategy::Average, parts).unwrap();
    assert_eq!(result, json!(6.0));
}

#[test]
fn average_of_nothing_is_an_error() {
    let err = aggregate(AggregationStrategy::Average, vec![]).unwrap_err();
    assert!(matches!(err, OrchestratorError::Aggregation(_)));
}

#[test]
fn custom_collects_results_in_partition_order() {
    let parts = vec![
        (1, json!({"b": 2})),
        (0, json!({"a": 1})),
        (2, json!({"c": 3})),
    ];
    let result = aggregate(AggregationStrategy::Custom, parts).unwrap();
    assert_eq!(result, json!([{"a": 1}, {"b": 2}, {"c": 3}]));
}

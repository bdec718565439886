use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{OrchestratorError, Result};

/// How terminal partition results are combined into a parent result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregationStrategy {
    /// Append child results in partition order. Arrays are flattened into
    /// one array, strings into one string.
    Concatenate,
    /// Deep-merge structured child results keyed by field name; numbers
    /// colliding on the same key are summed.
    Merge,
    /// Numeric sum over scalar child results.
    Sum,
    /// Numeric mean over scalar child results, divided by the count of
    /// successful children.
    Average,
    /// No reduction: the parent result is the ordered list of child results.
    Custom,
}

impl std::fmt::Display for AggregationStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AggregationStrategy::Concatenate => write!(f, "concatenate"),
            AggregationStrategy::Merge => write!(f, "merge"),
            AggregationStrategy::Sum => write!(f, "sum"),
            AggregationStrategy::Average => write!(f, "average"),
            AggregationStrategy::Custom => write!(f, "custom"),
        }
    }
}

/// Combine the results of all successful children. `parts` pairs each
/// partition index with that child's result; ordering of the input does not
/// matter, the reduction always runs in partition order.
pub fn aggregate(strategy: AggregationStrategy, mut parts: Vec<(u32, Value)>) -> Result<Value> {
    parts.sort_by_key(|(index, _)| *index);
    match strategy {
        AggregationStrategy::Concatenate => concatenate(parts),
        AggregationStrategy::Merge => merge_all(parts),
        AggregationStrategy::Sum => number(sum(&parts)?),
        AggregationStrategy::Average => {
            if parts.is_empty() {
                return Err(OrchestratorError::Aggregation(
                    "cannot average zero results".to_string(),
                ));
            }
            let count = parts.len() as f64;
            number(sum(&parts)? / count)
        }
        AggregationStrategy::Custom => {
            Ok(Value::Array(parts.into_iter().map(|(_, v)| v).collect()))
        }
    }
}

fn concatenate(parts: Vec<(u32, Value)>) -> Result<Value> {
    let all_arrays = parts.iter().all(|(_, v)| v.is_array());
    let all_strings = parts.iter().all(|(_, v)| v.is_string());

    if all_arrays {
        let mut out = Vec::new();
        for (_, value) in parts {
            if let Value::Array(items) = value {
                out.extend(items);
            }
        }
        Ok(Value::Array(out))
    } else if all_strings {
        let mut out = String::new();
        for (_, value) in &parts {
            if let Some(s) = value.as_str() {
                out.push_str(s);
            }
        }
        Ok(Value::String(out))
    } else {
        Err(OrchestratorError::Aggregation(
            "concatenate requires all child results to be arrays or all strings".to_string(),
        ))
    }
}

fn merge_all(parts: Vec<(u32, Value)>) -> Result<Value> {
    let mut out = Map::new();
    for (index, value) in parts {
        match value {
            Value::Object(map) => merge_into(&mut out, map),
            other => {
                return Err(OrchestratorError::Aggregation(format!(
                    "merge requires object results, partition {index} produced {other}"
                )))
            }
        }
    }
    Ok(Value::Object(out))
}

fn merge_into(out: &mut Map<String, Value>, incoming: Map<String, Value>) {
    for (key, value) in incoming {
        if !out.contains_key(&key) {
            out.insert(key, value);
            continue;
        }
        if let Some(existing) = out.get_mut(&key) {
            match (existing, value) {
                (Value::Object(existing), Value::Object(map)) => merge_into(existing, map),
                (Value::Array(existing), Value::Array(items)) => existing.extend(items),
                (existing, value) => {
                    // Numeric collisions sum (disjoint-support counters);
                    // anything else is replaced by the later partition.
                    if let (Some(a), Some(b)) = (existing.as_f64(), value.as_f64()) {
                        if let Ok(n) = number(a + b) {
                            *existing = n;
                            continue;
                        }
                    }
                    *existing = value;
                }
            }
        }
    }
}

fn sum(parts: &[(u32, Value)]) -> Result<f64> {
    let mut total = 0.0;
    for (index, value) in parts {
        let n = value.as_f64().ok_or_else(|| {
            OrchestratorError::Aggregation(format!(
                "partition {index} produced a non-numeric result"
            ))
        })?;
        total += n;
    }
    Ok(total)
}

fn number(n: f64) -> Result<Value> {
    serde_json::Number::from_f64(n)
        .map(Value::Number)
        .ok_or_else(|| OrchestratorError::Aggregation(format!("non-finite numeric result: {n}")))
}

use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::error::{OrchestratorError, Result};

/// Declared extent of a dataset. Dimensions are voxel counts for spatial
/// strategies; `steps` is the simulation step count for temporal windows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataShape {
    pub width: u32,
    pub height: u32,
    pub depth: u32,
    #[serde(default)]
    pub steps: u32,
}

impl DataShape {
    pub fn volume(width: u32, height: u32, depth: u32) -> Self {
        Self {
            width,
            height,
            depth,
            steps: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum PartitionStrategy {
    /// Contiguous depth ranges, each widened by `overlap` slices on both
    /// sides for filters needing neighbor context. Core ranges stay disjoint.
    SpatialZ {
        #[serde(default)]
        overlap: u32,
    },
    /// Near-square grid of non-overlapping tiles over the XY extent.
    SpatialXy,
    /// Recursive subdivision of the bounding volume, always splitting the
    /// largest remaining leaf, until the leaf count reaches the request or
    /// leaves hit the minimum edge.
    SpatialOctree {
        #[serde(default = "default_min_edge")]
        min_edge: u32,
    },
    /// Contiguous step windows of equal width; the remainder lands on the
    /// last window.
    Temporal,
    /// Deterministic per-bucket seeds for independent-sample work.
    Random {
        #[serde(default)]
        seed: u64,
    },
}

fn default_min_edge() -> u32 {
    32
}

impl std::fmt::Display for PartitionStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PartitionStrategy::SpatialZ { .. } => write!(f, "spatial_z"),
            PartitionStrategy::SpatialXy => write!(f, "spatial_xy"),
            PartitionStrategy::SpatialOctree { .. } => write!(f, "spatial_octree"),
            PartitionStrategy::Temporal => write!(f, "temporal"),
            PartitionStrategy::Random { .. } => write!(f, "random"),
        }
    }
}

/// Boundary descriptor carried by one child job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PartitionBounds {
    /// Half-open depth range. `z0..z1` is the slab this child owns;
    /// `read_z0..read_z1` includes the overlap slices it may read.
    DepthRange {
        z0: u32,
        z1: u32,
        read_z0: u32,
        read_z1: u32,
    },
    /// Half-open tile over the XY extent.
    Tile { x0: u32, y0: u32, x1: u32, y1: u32 },
    /// Axis-aligned sub-volume, min inclusive, max exclusive.
    Volume { min: [u32; 3], max: [u32; 3] },
    /// Half-open window of simulation steps.
    StepWindow { t0: u32, t1: u32 },
    /// Independent sample bucket with a reproducible seed.
    SampleBucket { index: u32, seed: u64 },
}

/// Immutable partitioning decision stored alongside a parent job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartitionPlan {
    pub strategy: PartitionStrategy,
    pub requested: u32,
    pub bounds: Vec<PartitionBounds>,
}

impl PartitionPlan {
    pub fn partition_count(&self) -> u32 {
        self.bounds.len() as u32
    }
}

/// Build a partition plan for `shape`, or reject the request. Counts that
/// would produce empty partitions fail validation instead.
pub fn plan(
    strategy: PartitionStrategy,
    count: u32,
    shape: DataShape,
    max_partitions: u32,
) -> Result<PartitionPlan> {
    if count == 0 {
        return Err(OrchestratorError::Validation(
            "partition count must be at least 1".to_string(),
        ));
    }
    if count > max_partitions {
        return Err(OrchestratorError::Validation(format!(
            "partition count {count} exceeds maximum {max_partitions}"
        )));
    }

    let bounds = match strategy {
        PartitionStrategy::SpatialZ { overlap } => plan_spatial_z(count, shape.depth, overlap)?,
        PartitionStrategy::SpatialXy => plan_spatial_xy(count, shape.width, shape.height)?,
        PartitionStrategy::SpatialOctree { min_edge } => {
            plan_octree(count, shape, min_edge.max(1), max_partitions)?
        }
        PartitionStrategy::Temporal => plan_temporal(count, shape.steps)?,
        PartitionStrategy::Random { seed } => plan_random(count, seed),
    };

    Ok(PartitionPlan {
        strategy,
        requested: count,
        bounds,
    })
}

fn plan_spatial_z(count: u32, depth: u32, overlap: u32) -> Result<Vec<PartitionBounds>> {
    if count > depth {
        return Err(OrchestratorError::Validation(format!(
            "cannot split depth {depth} into {count} partitions"
        )));
    }
    let size = depth.div_ceil(count);
    if count > 1 && (count - 1) * size >= depth {
        // Ceil-sized slabs would leave trailing partitions empty.
        return Err(OrchestratorError::Validation(format!(
            "partition count {count} produces empty depth ranges for depth {depth}"
        )));
    }

    let mut bounds = Vec::with_capacity(count as usize);
    for i in 0..count {
        let z0 = i * size;
        let z1 = ((i + 1) * size).min(depth);
        bounds.push(PartitionBounds::DepthRange {
            z0,
            z1,
            read_z0: z0.saturating_sub(overlap),
            read_z1: (z1 + overlap).min(depth),
        });
    }
    Ok(bounds)
}

fn plan_spatial_xy(count: u32, width: u32, height: u32) -> Result<Vec<PartitionBounds>> {
    let cols = (count as f64).sqrt().ceil() as u32;
    let rows = count.div_ceil(cols);
    if cols > width || rows > height {
        return Err(OrchestratorError::Validation(format!(
            "cannot tile {width}x{height} extent into a {cols}x{rows} grid"
        )));
    }
    let tile_w = width.div_ceil(cols);
    let tile_h = height.div_ceil(rows);

    let mut bounds = Vec::new();
    for row in 0..rows {
        for col in 0..cols {
            let x0 = col * tile_w;
            let y0 = row * tile_h;
            if x0 >= width || y0 >= height {
                continue;
            }
            bounds.push(PartitionBounds::Tile {
                x0,
                y0,
                x1: ((col + 1) * tile_w).min(width),
                y1: ((row + 1) * tile_h).min(height),
            });
        }
    }
    Ok(bounds)
}

fn box_volume(min: [u32; 3], max: [u32; 3]) -> u64 {
    (0..3).map(|a| (max[a] - min[a]) as u64).product()
}

fn plan_octree(
    count: u32,
    shape: DataShape,
    min_edge: u32,
    max_partitions: u32,
) -> Result<Vec<PartitionBounds>> {
    if shape.width == 0 || shape.height == 0 || shape.depth == 0 {
        return Err(OrchestratorError::Validation(
            "octree partitioning requires a non-empty volume".to_string(),
        ));
    }

    let mut leaves = vec![([0u32; 3], [shape.width, shape.height, shape.depth])];
    while (leaves.len() as u32) < count {
        // Split the largest leaf to keep leaf volumes balanced.
        let idx = match leaves
            .iter()
            .enumerate()
            .filter(|(_, (min, max))| (0..3).any(|a| max[a] - min[a] >= min_edge * 2))
            .max_by_key(|(_, (min, max))| box_volume(*min, *max))
        {
            Some((idx, _)) => idx,
            None => break, // every leaf is at the minimum size
        };

        let (min, max) = leaves[idx];
        let mut splits = [[0u32; 2]; 3];
        let mut axes_split = [false; 3];
        for a in 0..3 {
            let extent = max[a] - min[a];
            if extent >= min_edge * 2 {
                splits[a] = [min[a], min[a] + extent / 2];
                axes_split[a] = true;
            } else {
                splits[a] = [min[a], min[a]];
            }
        }

        // One split replaces a leaf with up to eight; never let the plan
        // grow past the partition cap.
        let pieces: usize = axes_split.iter().map(|&s| if s { 2 } else { 1 }).product();
        if leaves.len() - 1 + pieces > max_partitions as usize {
            break;
        }
        leaves.swap_remove(idx);

        for zi in 0..if axes_split[2] { 2 } else { 1 } {
            for yi in 0..if axes_split[1] { 2 } else { 1 } {
                for xi in 0..if axes_split[0] { 2 } else { 1 } {
                    let pick = |a: usize, i: usize| {
                        let lo = if i == 0 { min[a] } else { splits[a][1] };
                        let hi = if i == 0 && axes_split[a] {
                            splits[a][1]
                        } else {
                            max[a]
                        };
                        (lo, hi)
                    };
                    let (x0, x1) = pick(0, xi);
                    let (y0, y1) = pick(1, yi);
                    let (z0, z1) = pick(2, zi);
                    leaves.push(([x0, y0, z0], [x1, y1, z1]));
                }
            }
        }
    }

    Ok(leaves
        .into_iter()
        .map(|(min, max)| PartitionBounds::Volume { min, max })
        .collect())
}

fn plan_temporal(count: u32, steps: u32) -> Result<Vec<PartitionBounds>> {
    if count > steps {
        return Err(OrchestratorError::Validation(format!(
            "cannot split {steps} steps into {count} windows"
        )));
    }
    let width = steps / count;
    let mut bounds = Vec::with_capacity(count as usize);
    for i in 0..count {
        let t0 = i * width;
        let t1 = if i == count - 1 { steps } else { (i + 1) * width };
        bounds.push(PartitionBounds::StepWindow { t0, t1 });
    }
    Ok(bounds)
}

fn plan_random(count: u32, seed: u64) -> Vec<PartitionBounds> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..count)
        .map(|index| PartitionBounds::SampleBucket {
            index,
            seed: rng.next_u64(),
        })
        .collect()
}

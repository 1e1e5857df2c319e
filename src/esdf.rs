//! Euclidean signed-distance field generation from a sealed TSDF grid
//!
//! Fast-marching propagation: every observed TSDF voxel seeds the
//! wavefront with its (truncated) distance, then distances spread to
//! the remaining voxels of the allocated blocks through 6-connected
//! axial steps, processed in order of increasing magnitude. The sign
//! travels with the wavefront, so free space stays positive and
//! enclosed space stays negative.

use crate::grid::VoxelGrid;
use crate::voxel::{EsdfVoxel, GlobalIndex, TsdfVoxel};
use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::collections::BinaryHeap;

/// ESDF propagation parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EsdfConfig {
    /// Distances are clamped to this magnitude and stop propagating
    pub max_distance: f32,
}

impl Default for EsdfConfig {
    fn default() -> Self {
        Self { max_distance: 2.0 }
    }
}

const NEIGHBORS_6: [(i64, i64, i64); 6] = [
    (1, 0, 0),
    (-1, 0, 0),
    (0, 1, 0),
    (0, -1, 0),
    (0, 0, 1),
    (0, 0, -1),
];

/// Compute the ESDF of a sealed TSDF grid over the same block partition
pub fn generate_esdf(tsdf: &VoxelGrid<TsdfVoxel>, config: &EsdfConfig) -> VoxelGrid<EsdfVoxel> {
    let vps = tsdf.voxels_per_side();
    let voxel_size = tsdf.voxel_size();
    let mut esdf: VoxelGrid<EsdfVoxel> = VoxelGrid::new(voxel_size, vps);

    // Mirror the TSDF block partition
    for block_index in tsdf.block_indices() {
        esdf.allocate_block(*block_index);
    }

    // Seed the wavefront from every observed TSDF voxel
    let mut open: BinaryHeap<Reverse<(OrderedFloat<f32>, GlobalIndex)>> = BinaryHeap::new();
    for (block_index, block) in tsdf.blocks() {
        for (linear, voxel) in block.as_slice().iter().enumerate() {
            if voxel.weight <= 0.0 || voxel.distance.is_nan() {
                continue;
            }
            let local = crate::voxel::LocalIndex::from_linear(linear, vps);
            let global = GlobalIndex::from_parts(*block_index, local, vps);
            *esdf.voxel_mut_at(global) = EsdfVoxel {
                distance: voxel.distance,
                fixed: true,
                observed: true,
            };
            open.push(Reverse((OrderedFloat(voxel.distance.abs()), global)));
        }
    }

    // Propagate in order of increasing distance magnitude
    while let Some(Reverse((OrderedFloat(magnitude), global))) = open.pop() {
        let current = match esdf.voxel_at(global) {
            Some(v) if v.observed => *v,
            _ => continue,
        };
        // Stale queue entry from a later relaxation
        if current.distance.abs() + 1e-6 < magnitude {
            continue;
        }
        if current.distance.abs() >= config.max_distance {
            continue;
        }

        let step = voxel_size.copysign(current.distance);
        for (dx, dy, dz) in NEIGHBORS_6 {
            let neighbor_index = GlobalIndex::new(global.x + dx, global.y + dy, global.z + dz);
            let Some(neighbor) = esdf.voxel_at(neighbor_index) else {
                continue; // outside the allocated blocks
            };
            if neighbor.fixed {
                continue;
            }
            let candidate =
                (current.distance + step).clamp(-config.max_distance, config.max_distance);
            if !neighbor.observed || candidate.abs() + 1e-6 < neighbor.distance.abs() {
                *esdf.voxel_mut_at(neighbor_index) = EsdfVoxel {
                    distance: candidate,
                    fixed: false,
                    observed: true,
                };
                open.push(Reverse((OrderedFloat(candidate.abs()), neighbor_index)));
            }
        }
    }

    esdf
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::voxel::SignedDistanceVoxel;
    use approx::assert_relative_eq;

    /// TSDF of the plane z = 0, observed only inside |z| ≤ band, with
    /// blocks allocated out to |z| ≤ reach
    fn slab_tsdf(voxel_size: f32, band: f32, reach: f32) -> VoxelGrid<TsdfVoxel> {
        let mut grid = VoxelGrid::new(voxel_size, 8);
        let n = (reach / voxel_size).round() as i64;
        for x in -4..4 {
            for y in -4..4 {
                for z in -n..n {
                    let g = GlobalIndex::new(x, y, z);
                    let d = g.center(voxel_size).z as f32;
                    *grid.voxel_mut_at(g) = if d.abs() <= band {
                        TsdfVoxel {
                            distance: d,
                            weight: 1.0,
                        }
                    } else {
                        TsdfVoxel::default()
                    };
                }
            }
        }
        grid
    }

    #[test]
    fn test_seeds_keep_tsdf_values() {
        let tsdf = slab_tsdf(0.1, 0.25, 0.8);
        let esdf = generate_esdf(&tsdf, &EsdfConfig::default());
        let g = GlobalIndex::new(0, 0, 1);
        let voxel = esdf.voxel_at(g).unwrap();
        assert!(voxel.fixed);
        assert_relative_eq!(voxel.distance, 0.15, epsilon = 1e-6);
    }

    #[test]
    fn test_propagation_extends_beyond_band() {
        let tsdf = slab_tsdf(0.1, 0.25, 0.8);
        let esdf = generate_esdf(&tsdf, &EsdfConfig::default());

        // z = 0.55 is outside the observed band; the propagated distance
        // walks up the column in axial steps
        let above = esdf.voxel_at(GlobalIndex::new(0, 0, 5)).unwrap();
        assert!(above.observed);
        assert!(!above.fixed);
        assert_relative_eq!(above.distance, 0.55, epsilon = 1e-4);

        let below = esdf.voxel_at(GlobalIndex::new(0, 0, -6)).unwrap();
        assert!(below.observed);
        assert_relative_eq!(below.distance, -0.55, epsilon = 1e-4);
    }

    #[test]
    fn test_max_distance_clamps() {
        let tsdf = slab_tsdf(0.1, 0.25, 0.8);
        let config = EsdfConfig { max_distance: 0.4 };
        let esdf = generate_esdf(&tsdf, &config);
        let far = esdf.voxel_at(GlobalIndex::new(0, 0, 7)).unwrap();
        assert!(far.observed);
        assert!(far.distance <= 0.4 + 1e-6);
    }

    #[test]
    fn test_unreachable_voxels_stay_unobserved() {
        // No seeds at all: everything stays unobserved
        let mut tsdf: VoxelGrid<TsdfVoxel> = VoxelGrid::new(0.1, 8);
        tsdf.voxel_mut_at(GlobalIndex::new(0, 0, 0)).weight = 0.0;
        let esdf = generate_esdf(&tsdf, &EsdfConfig::default());
        assert!(!esdf.voxel_at(GlobalIndex::new(0, 0, 0)).unwrap().is_observed());
    }
}

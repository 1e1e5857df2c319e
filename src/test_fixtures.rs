//! Synthetic sub-maps shared by the unit tests

use crate::submap::{Submap, SubmapConfig};
use crate::voxel::{GlobalIndex, TsdfVoxel};
use nalgebra::{Isometry3, Point3};

pub fn fixture_config(voxel_size: f32, voxels_per_side: u32) -> SubmapConfig {
    SubmapConfig {
        voxel_size,
        voxels_per_side,
        max_voxel_distance: 0.6,
        min_voxel_weight: 1e-6,
        generate_esdf_on_seal: true,
        ..SubmapConfig::default()
    }
}

/// Sealed sub-map holding the planar slab `d(x, y, z) = z` for |z| ≲ 0.35,
/// spanning roughly ±0.85 in x and y
pub fn planar_slab_submap(id: u32, voxel_size: f32, voxels_per_side: u32) -> Submap {
    planar_slab_submap_with_extent(id, voxel_size, voxels_per_side, 0.85)
}

/// [`planar_slab_submap`] with a configurable xy half-extent, so a
/// narrow reference can stay strictly interior to a wider reading grid
pub fn planar_slab_submap_with_extent(
    id: u32,
    voxel_size: f32,
    voxels_per_side: u32,
    half_extent_xy: f64,
) -> Submap {
    let config = fixture_config(voxel_size, voxels_per_side);
    let mut submap = Submap::new(id, Isometry3::identity(), 0, config);
    let n_xy = (half_extent_xy / voxel_size as f64).round() as i64;
    let n_z = (0.35 / voxel_size).round() as i64;
    for x in -n_xy..n_xy {
        for y in -n_xy..n_xy {
            for z in -n_z..n_z {
                let g = GlobalIndex::new(x, y, z);
                let d = g.center(voxel_size).z as f32;
                *submap.tsdf_grid_mut().voxel_mut_at(g) = TsdfVoxel {
                    distance: d,
                    weight: 1.0,
                };
            }
        }
    }
    submap.seal();
    submap
}

fn sphere_pair_distance(p: &Point3<f64>) -> f64 {
    let c1 = Point3::new(0.4, 0.1, 0.0);
    let c2 = Point3::new(-0.3, -0.2, 0.1);
    let d1 = (p - c1).norm() - 0.25;
    let d2 = (p - c2).norm() - 0.3;
    d1.min(d2)
}

/// Sealed sub-map of two offset spheres; the field constrains all four
/// optimized pose components, including yaw
pub fn sphere_pair_submap(id: u32) -> Submap {
    let voxel_size = 0.1;
    let config = fixture_config(voxel_size, 8);
    let mut submap = Submap::new(id, Isometry3::identity(), 0, config);
    for x in -12..12 {
        for y in -12..12 {
            for z in -8..8 {
                let g = GlobalIndex::new(x, y, z);
                let d = sphere_pair_distance(&g.center(voxel_size));
                if d.abs() <= 0.55 {
                    *submap.tsdf_grid_mut().voxel_mut_at(g) = TsdfVoxel {
                        distance: d as f32,
                        weight: 1.0,
                    };
                }
            }
        }
    }
    submap.seal();
    submap
}

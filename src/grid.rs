//! Block-partitioned sparse voxel grid with a trilinear sampler
//!
//! Storage is a hash map from block index to a dense cubic array of
//! `S³` voxels, following the usual sparse-volume layout. The sampler
//! interpolates the stored distance field at arbitrary points of the
//! grid's local frame; its weight vector is produced by the `q·B`
//! matrix form rather than nested 1D lerps, so the same eight corner
//! fetches also yield the analytic derivatives with respect to the
//! sampling point.

use crate::error::{Error, Result};
use crate::voxel::{BlockIndex, GlobalIndex, LocalIndex, SignedDistanceVoxel};
use nalgebra::{Point3, Vector3};
use rustc_hash::FxHashMap;

/// Trilinear interpolation table, mapping the monomial vector
/// `q = [1, u₀, u₁, u₂, u₀u₁, u₁u₂, u₂u₀, u₀u₁u₂]` to per-corner weights.
/// Corner `j` sits at offset `((j>>2)&1, (j>>1)&1, j&1)` from the base voxel.
#[rustfmt::skip]
const INTERP_TABLE: [[f64; 8]; 8] = [
    [ 1.0,  0.0,  0.0,  0.0,  0.0,  0.0,  0.0,  0.0],
    [-1.0,  0.0,  0.0,  0.0,  1.0,  0.0,  0.0,  0.0],
    [-1.0,  0.0,  1.0,  0.0,  0.0,  0.0,  0.0,  0.0],
    [-1.0,  1.0,  0.0,  0.0,  0.0,  0.0,  0.0,  0.0],
    [ 1.0,  0.0, -1.0,  0.0, -1.0,  0.0,  1.0,  0.0],
    [ 1.0, -1.0, -1.0,  1.0,  0.0,  0.0,  0.0,  0.0],
    [ 1.0, -1.0,  0.0,  0.0, -1.0,  1.0,  0.0,  0.0],
    [-1.0,  1.0,  1.0, -1.0,  1.0, -1.0, -1.0,  1.0],
];

/// Multiply a monomial-style row vector by the interpolation table
fn table_weights(q: &[f64; 8]) -> [f64; 8] {
    let mut w = [0.0; 8];
    for (qi, row) in q.iter().zip(INTERP_TABLE.iter()) {
        for (wj, bij) in w.iter_mut().zip(row.iter()) {
            *wj += qi * bij;
        }
    }
    w
}

/// A cubic array of `S³` voxels
#[derive(Debug, Clone)]
pub struct Block<V> {
    voxels: Vec<V>,
}

impl<V: SignedDistanceVoxel> Block<V> {
    fn new(voxels_per_side: u32) -> Self {
        let n = (voxels_per_side * voxels_per_side * voxels_per_side) as usize;
        Self {
            voxels: vec![V::default(); n],
        }
    }

    /// Voxel at a local index
    pub fn voxel(&self, local: LocalIndex, voxels_per_side: u32) -> &V {
        &self.voxels[local.linear(voxels_per_side)]
    }

    /// Mutable voxel at a local index
    pub fn voxel_mut(&mut self, local: LocalIndex, voxels_per_side: u32) -> &mut V {
        &mut self.voxels[local.linear(voxels_per_side)]
    }

    /// Dense voxel slice in row-major local order
    pub fn as_slice(&self) -> &[V] {
        &self.voxels
    }

    /// Mutable dense voxel slice
    pub fn as_mut_slice(&mut self) -> &mut [V] {
        &mut self.voxels
    }
}

/// Sparse block-partitioned voxel grid in a sub-map's local frame
#[derive(Debug, Clone)]
pub struct VoxelGrid<V> {
    voxel_size: f32,
    voxels_per_side: u32,
    blocks: FxHashMap<BlockIndex, Block<V>>,
}

impl<V: SignedDistanceVoxel> VoxelGrid<V> {
    /// Create an empty grid
    pub fn new(voxel_size: f32, voxels_per_side: u32) -> Self {
        assert!(voxel_size > 0.0, "voxel size must be positive");
        assert!(voxels_per_side > 0, "blocks must hold at least one voxel");
        Self {
            voxel_size,
            voxels_per_side,
            blocks: FxHashMap::default(),
        }
    }

    /// Voxel edge length
    pub fn voxel_size(&self) -> f32 {
        self.voxel_size
    }

    /// Voxels along one block edge
    pub fn voxels_per_side(&self) -> u32 {
        self.voxels_per_side
    }

    /// Block side length `S·v`
    pub fn block_size(&self) -> f32 {
        self.voxel_size * self.voxels_per_side as f32
    }

    /// Number of allocated blocks
    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    /// Total voxels across allocated blocks
    pub fn voxel_count(&self) -> usize {
        let per_block = (self.voxels_per_side as usize).pow(3);
        self.blocks.len() * per_block
    }

    /// Whether no blocks are allocated
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// O(1) hashed block lookup
    pub fn block_by_index(&self, index: BlockIndex) -> Option<&Block<V>> {
        self.blocks.get(&index)
    }

    /// Allocate (or fetch) the block at `index`
    pub fn allocate_block(&mut self, index: BlockIndex) -> &mut Block<V> {
        let vps = self.voxels_per_side;
        self.blocks.entry(index).or_insert_with(|| Block::new(vps))
    }

    /// Iterate over allocated blocks
    pub fn blocks(&self) -> impl Iterator<Item = (&BlockIndex, &Block<V>)> {
        self.blocks.iter()
    }

    /// Iterate over allocated block indices
    pub fn block_indices(&self) -> impl Iterator<Item = &BlockIndex> {
        self.blocks.keys()
    }

    /// Voxel lookup by global index; `None` when the block is absent
    pub fn voxel_at(&self, global: GlobalIndex) -> Option<&V> {
        let (block_index, local) = global.split(self.voxels_per_side);
        self.blocks
            .get(&block_index)
            .map(|block| block.voxel(local, self.voxels_per_side))
    }

    /// Mutable voxel access by global index, allocating the block on demand
    pub fn voxel_mut_at(&mut self, global: GlobalIndex) -> &mut V {
        let (block_index, local) = global.split(self.voxels_per_side);
        let vps = self.voxels_per_side;
        self.allocate_block(block_index).voxel_mut(local, vps)
    }

    /// Observed voxel lookup as a `Result`, per the recovery policy of the
    /// registration cost
    pub fn observed_voxel_at(&self, global: GlobalIndex) -> Result<&V> {
        match self.voxel_at(global) {
            None => Err(Error::OutOfBounds(
                global.x as f64,
                global.y as f64,
                global.z as f64,
            )),
            Some(voxel) if !voxel.is_observed() => {
                Err(Error::NotObserved(global.x, global.y, global.z))
            }
            Some(voxel) => Ok(voxel),
        }
    }

    /// Global index of the cell base for the interpolation around `p`,
    /// with ties on cell faces broken toward negative indices
    fn interp_base(&self, p: &Point3<f64>) -> GlobalIndex {
        let v = self.voxel_size as f64;
        GlobalIndex::new(
            (p.x / v - 0.5).floor() as i64,
            (p.y / v - 0.5).floor() as i64,
            (p.z / v - 0.5).floor() as i64,
        )
    }

    /// Fetch the 8 cell corners around `p`; `None` when any corner is
    /// missing or unobserved
    fn interp_corners(&self, base: GlobalIndex) -> Option<[V; 8]> {
        let mut corners = [V::default(); 8];
        for (j, corner) in corners.iter_mut().enumerate() {
            let offset = GlobalIndex::new(
                base.x + ((j >> 2) & 1) as i64,
                base.y + ((j >> 1) & 1) as i64,
                base.z + (j & 1) as i64,
            );
            let voxel = self.voxel_at(offset)?;
            if !voxel.is_observed() {
                return None;
            }
            *corner = *voxel;
        }
        Some(corners)
    }

    /// Fractional offset of `p` within its interpolation cell, in `[0,1)³`
    fn interp_offset(&self, p: &Point3<f64>, base: GlobalIndex) -> Vector3<f64> {
        let center = base.center(self.voxel_size);
        (p - center) / self.voxel_size as f64
    }

    /// Trilinear sample of (distance, weight) at a point in the local frame
    ///
    /// Returns `None` when any of the 8 surrounding voxels is missing or
    /// unobserved.
    pub fn sample(&self, p: &Point3<f64>) -> Option<(f64, f64)> {
        let base = self.interp_base(p);
        let corners = self.interp_corners(base)?;
        let u = self.interp_offset(p, base);

        let q = [
            1.0,
            u.x,
            u.y,
            u.z,
            u.x * u.y,
            u.y * u.z,
            u.z * u.x,
            u.x * u.y * u.z,
        ];
        let w = table_weights(&q);

        let mut distance = 0.0;
        let mut weight = 0.0;
        for (wj, corner) in w.iter().zip(corners.iter()) {
            distance += wj * corner.sd_distance() as f64;
            weight += wj * corner.sd_weight() as f64;
        }
        Some((distance, weight))
    }

    /// Trilinear sample plus the distance gradient w.r.t. the sample point
    ///
    /// The gradient reuses the corner fetch of [`VoxelGrid::sample`]: the
    /// monomial vector `q` is replaced by its partials in `u`, scaled by
    /// `1/v` to account for the cell normalization.
    pub fn sample_with_gradient(&self, p: &Point3<f64>) -> Option<(f64, f64, Vector3<f64>)> {
        let base = self.interp_base(p);
        let corners = self.interp_corners(base)?;
        let u = self.interp_offset(p, base);

        let q = [
            1.0,
            u.x,
            u.y,
            u.z,
            u.x * u.y,
            u.y * u.z,
            u.z * u.x,
            u.x * u.y * u.z,
        ];
        let dq = [
            [0.0, 1.0, 0.0, 0.0, u.y, 0.0, u.z, u.y * u.z],
            [0.0, 0.0, 1.0, 0.0, u.x, u.z, 0.0, u.x * u.z],
            [0.0, 0.0, 0.0, 1.0, 0.0, u.y, u.x, u.x * u.y],
        ];

        let w = table_weights(&q);
        let mut distance = 0.0;
        let mut weight = 0.0;
        for (wj, corner) in w.iter().zip(corners.iter()) {
            distance += wj * corner.sd_distance() as f64;
            weight += wj * corner.sd_weight() as f64;
        }

        let inv_v = 1.0 / self.voxel_size as f64;
        let mut gradient = Vector3::zeros();
        for axis in 0..3 {
            let dw = table_weights(&dq[axis]);
            let mut g = 0.0;
            for (dwj, corner) in dw.iter().zip(corners.iter()) {
                g += dwj * corner.sd_distance() as f64;
            }
            gradient[axis] = g * inv_v;
        }

        Some((distance, weight, gradient))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::voxel::TsdfVoxel;
    use approx::assert_relative_eq;
    use proptest::prelude::*;

    /// Fill a grid with `d(x,y,z) = a·x + b·y + c·z + d` over the blocks
    /// covering `[-range, range]³`
    fn linear_field(
        voxel_size: f32,
        vps: u32,
        coeffs: (f64, f64, f64, f64),
        range: i64,
    ) -> VoxelGrid<TsdfVoxel> {
        let mut grid = VoxelGrid::new(voxel_size, vps);
        let (a, b, c, d) = coeffs;
        for x in -range..=range {
            for y in -range..=range {
                for z in -range..=range {
                    let g = GlobalIndex::new(x, y, z);
                    let p = g.center(voxel_size);
                    *grid.voxel_mut_at(g) = TsdfVoxel {
                        distance: (a * p.x + b * p.y + c * p.z + d) as f32,
                        weight: 1.0,
                    };
                }
            }
        }
        grid
    }

    #[test]
    fn test_block_allocation_and_lookup() {
        let mut grid: VoxelGrid<TsdfVoxel> = VoxelGrid::new(0.1, 8);
        assert!(grid.is_empty());
        assert!(grid.block_by_index(BlockIndex::new(0, 0, 0)).is_none());

        grid.voxel_mut_at(GlobalIndex::new(0, 0, 0)).weight = 1.0;
        assert_eq!(grid.block_count(), 1);
        assert!(grid.block_by_index(BlockIndex::new(0, 0, 0)).is_some());

        // Negative indices allocate their own block
        grid.voxel_mut_at(GlobalIndex::new(-1, 0, 0)).weight = 1.0;
        assert!(grid.block_by_index(BlockIndex::new(-1, 0, 0)).is_some());
        assert_eq!(grid.block_count(), 2);
    }

    #[test]
    fn test_observed_voxel_errors() {
        let mut grid: VoxelGrid<TsdfVoxel> = VoxelGrid::new(0.1, 8);
        grid.voxel_mut_at(GlobalIndex::new(0, 0, 0)).weight = 0.0;

        assert!(matches!(
            grid.observed_voxel_at(GlobalIndex::new(100, 0, 0)),
            Err(Error::OutOfBounds(..))
        ));
        assert!(matches!(
            grid.observed_voxel_at(GlobalIndex::new(0, 0, 0)),
            Err(Error::NotObserved(..))
        ));
    }

    #[test]
    fn test_sample_missing_corner_is_none() {
        let mut grid: VoxelGrid<TsdfVoxel> = VoxelGrid::new(0.1, 8);
        // A single observed voxel cannot provide all 8 corners
        *grid.voxel_mut_at(GlobalIndex::new(0, 0, 0)) = TsdfVoxel {
            distance: 0.5,
            weight: 1.0,
        };
        assert!(grid.sample(&Point3::new(0.05, 0.05, 0.05)).is_none());
    }

    #[test]
    fn test_sample_unobserved_corner_is_none() {
        let mut grid = linear_field(0.1, 8, (1.0, 0.0, 0.0, 0.0), 2);
        grid.voxel_mut_at(GlobalIndex::new(1, 1, 1)).weight = 0.0;
        // The cell spanning voxels (0..1)³ now has an unobserved corner
        assert!(grid.sample(&Point3::new(0.1, 0.1, 0.1)).is_none());
    }

    #[test]
    fn test_sample_exact_at_voxel_centers() {
        let grid = linear_field(0.1, 8, (1.0, -2.0, 0.5, 0.3), 3);
        let g = GlobalIndex::new(1, -1, 2);
        let p = g.center(0.1);
        let (d, w) = grid.sample(&p).unwrap();
        let expected = 1.0 * p.x - 2.0 * p.y + 0.5 * p.z + 0.3;
        assert_relative_eq!(d, expected, epsilon = 1e-6);
        assert_relative_eq!(w, 1.0, epsilon = 1e-9);
    }

    #[test]
    fn test_sample_crosses_block_boundary() {
        // vps = 4 so the cell around x = 0.4 spans two blocks
        let grid = linear_field(0.1, 4, (2.0, 0.0, 0.0, 0.0), 6);
        let p = Point3::new(0.4, 0.15, 0.15);
        let (d, _) = grid.sample(&p).unwrap();
        assert_relative_eq!(d, 0.8, epsilon = 1e-6);
    }

    #[test]
    fn test_gradient_of_linear_field() {
        let grid = linear_field(0.1, 8, (1.5, -0.7, 2.2, 0.1), 3);
        let p = Point3::new(0.07, -0.12, 0.19);
        let (d, _, grad) = grid.sample_with_gradient(&p).unwrap();
        let expected = 1.5 * p.x - 0.7 * p.y + 2.2 * p.z + 0.1;
        assert_relative_eq!(d, expected, epsilon = 1e-6);
        assert_relative_eq!(grad.x, 1.5, epsilon = 1e-5);
        assert_relative_eq!(grad.y, -0.7, epsilon = 1e-5);
        assert_relative_eq!(grad.z, 2.2, epsilon = 1e-5);
    }

    #[test]
    fn test_face_ties_break_toward_negative() {
        let grid = linear_field(0.1, 8, (1.0, 0.0, 0.0, 0.0), 3);
        // x = 0.15 sits exactly on the face between voxels 0 and 1
        let base = grid.interp_base(&Point3::new(0.15, 0.15, 0.15));
        assert_eq!(base, GlobalIndex::new(1, 1, 1));
        let u = grid.interp_offset(&Point3::new(0.15, 0.15, 0.15), base);
        assert_relative_eq!(u.x, 0.0, epsilon = 1e-12);
    }

    proptest! {
        /// Interpolation of a linear field is exact at interior points
        #[test]
        fn prop_linear_field_exactness(
            px in -0.25f64..0.25,
            py in -0.25f64..0.25,
            pz in -0.25f64..0.25,
            a in -3.0f64..3.0,
            b in -3.0f64..3.0,
            c in -3.0f64..3.0,
        ) {
            let grid = linear_field(0.1, 8, (a, b, c, 0.2), 4);
            let p = Point3::new(px, py, pz);
            let (d, _) = grid.sample(&p).unwrap();
            let expected = a * px + b * py + c * pz + 0.2;
            prop_assert!((d - expected).abs() < 1e-5);
        }
    }
}

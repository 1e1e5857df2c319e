//! Rigid local sub-maps: pose, voxel grids, relevant-voxel index and
//! bounding geometry
//!
//! A sub-map accumulates TSDF updates while active, then is sealed when
//! the next time window starts. Sealing freezes the TSDF grid, builds
//! the relevant-voxel index and the bounding geometry, and (optionally)
//! generates the ESDF. Finished sub-maps are immutable apart from their
//! pose, which the pose graph rewrites after each optimization.

use crate::bounding::{Aabb, Obb};
use crate::error::{Error, Result};
use crate::esdf::{self, EsdfConfig};
use crate::grid::VoxelGrid;
use crate::transform::Pose;
use crate::voxel::{BlockIndex, EsdfVoxel, GlobalIndex, LocalIndex, TsdfVoxel};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

/// Stable sub-map identifier, unique within a collection and never reused
pub type SubmapId = u32;

/// Construction parameters shared by all sub-maps of one run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmapConfig {
    /// Voxel edge length in meters
    pub voxel_size: f32,
    /// Voxels along one block edge
    pub voxels_per_side: u32,
    /// Truncation band; relevant voxels satisfy `|distance| ≤` this
    pub max_voxel_distance: f32,
    /// Minimum fusion weight for a voxel to count as relevant
    pub min_voxel_weight: f32,
    /// Whether sealing a sub-map also generates its ESDF
    pub generate_esdf_on_seal: bool,
    /// ESDF propagation parameters
    pub esdf: EsdfConfig,
}

impl Default for SubmapConfig {
    fn default() -> Self {
        Self {
            voxel_size: 0.2,
            voxels_per_side: 16,
            max_voxel_distance: 0.6,
            min_voxel_weight: 1e-6,
            generate_esdf_on_seal: true,
            esdf: EsdfConfig::default(),
        }
    }
}

/// Lifecycle state of a sub-map
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmapState {
    /// Accepting voxel updates
    Active,
    /// Sealed; grids frozen, eligible as a pose-graph node
    Finished,
}

/// A short-window volumetric sub-map with its own world pose
#[derive(Debug, Clone)]
pub struct Submap {
    id: SubmapId,
    pose: Pose,
    state: SubmapState,
    config: SubmapConfig,
    tsdf_grid: VoxelGrid<TsdfVoxel>,
    esdf_grid: Option<VoxelGrid<EsdfVoxel>>,
    /// Relevant voxels grouped by block, built once at seal time
    relevant_voxel_index: FxHashMap<BlockIndex, Vec<LocalIndex>>,
    num_relevant_voxels: usize,
    /// Local-frame bounds of the relevant voxel centers, fixed at seal time
    local_surface_aabb: Option<Aabb>,
    /// Local-frame bounds of the allocated grid volume, fixed at seal time
    local_grid_aabb: Option<Aabb>,
    /// World-frame caches, refreshed on every pose update
    surface_obb: Option<Obb>,
    submap_aabb: Option<Aabb>,
    creation_timestamp: u64,
    is_constant: bool,
}

impl Submap {
    /// Create an empty active sub-map at `pose`
    pub fn new(id: SubmapId, pose: Pose, creation_timestamp: u64, config: SubmapConfig) -> Self {
        let tsdf_grid = VoxelGrid::new(config.voxel_size, config.voxels_per_side);
        Self {
            id,
            pose,
            state: SubmapState::Active,
            config,
            tsdf_grid,
            esdf_grid: None,
            relevant_voxel_index: FxHashMap::default(),
            num_relevant_voxels: 0,
            local_surface_aabb: None,
            local_grid_aabb: None,
            surface_obb: None,
            submap_aabb: None,
            creation_timestamp,
            is_constant: false,
        }
    }

    pub fn id(&self) -> SubmapId {
        self.id
    }

    pub fn pose(&self) -> &Pose {
        &self.pose
    }

    pub fn state(&self) -> SubmapState {
        self.state
    }

    pub fn config(&self) -> &SubmapConfig {
        &self.config
    }

    pub fn creation_timestamp(&self) -> u64 {
        self.creation_timestamp
    }

    pub fn is_constant(&self) -> bool {
        self.is_constant
    }

    pub fn set_constant(&mut self, constant: bool) {
        self.is_constant = constant;
    }

    pub fn tsdf_grid(&self) -> &VoxelGrid<TsdfVoxel> {
        &self.tsdf_grid
    }

    /// Mutable TSDF access; only the active sub-map accepts updates
    pub fn tsdf_grid_mut(&mut self) -> &mut VoxelGrid<TsdfVoxel> {
        debug_assert_eq!(self.state, SubmapState::Active, "finished grids are frozen");
        &mut self.tsdf_grid
    }

    /// The ESDF grid, present only after [`Submap::generate_esdf`]
    pub fn esdf_grid(&self) -> Result<&VoxelGrid<EsdfVoxel>> {
        self.esdf_grid.as_ref().ok_or(Error::EsdfNotGenerated(self.id))
    }

    pub fn has_esdf(&self) -> bool {
        self.esdf_grid.is_some()
    }

    /// Seal the sub-map: freeze the TSDF, build the relevant-voxel index
    /// and bounding geometry, optionally generate the ESDF
    pub fn seal(&mut self) {
        if self.state == SubmapState::Finished {
            return;
        }
        self.state = SubmapState::Finished;
        self.build_relevant_voxel_index();
        self.build_local_bounds();
        self.refresh_world_bounds();
        if self.config.generate_esdf_on_seal {
            self.generate_esdf();
        }
    }

    /// Generate the ESDF from the sealed TSDF grid
    pub fn generate_esdf(&mut self) {
        self.esdf_grid = Some(esdf::generate_esdf(&self.tsdf_grid, &self.config.esdf));
    }

    /// Update the world pose and refresh the cached world-frame bounds
    pub fn set_pose(&mut self, pose: Pose) {
        self.pose = pose;
        self.refresh_world_bounds();
    }

    /// Number of relevant voxels; one registration residual each
    pub fn num_relevant_voxels(&self) -> usize {
        self.num_relevant_voxels
    }

    /// Relevant voxels grouped by block index
    pub fn relevant_voxel_index(&self) -> &FxHashMap<BlockIndex, Vec<LocalIndex>> {
        &self.relevant_voxel_index
    }

    /// Iterate over the global indices of all relevant voxels
    pub fn relevant_voxels(&self) -> impl Iterator<Item = GlobalIndex> + '_ {
        let vps = self.config.voxels_per_side;
        self.relevant_voxel_index.iter().flat_map(move |(block, locals)| {
            locals
                .iter()
                .map(move |local| GlobalIndex::from_parts(*block, *local, vps))
        })
    }

    /// World-frame OBB of the surface (relevant) voxels; `None` while active
    pub fn surface_obb(&self) -> Option<&Obb> {
        self.surface_obb.as_ref()
    }

    /// World-frame AABB of the whole grid volume; `None` while active
    pub fn submap_aabb(&self) -> Option<&Aabb> {
        self.submap_aabb.as_ref()
    }

    /// Permissive overlap predicate between two finished sub-maps
    ///
    /// Conjunction of an AABB-vs-AABB test with an OBB test of this
    /// sub-map's surface box against the other's grid volume. When this
    /// returns false, no relevant voxel of `self` can fall inside
    /// `other`'s AABB; true may still be a false positive, which only
    /// costs extra residual evaluations.
    pub fn overlaps_with(&self, other: &Submap) -> bool {
        let (Some(self_aabb), Some(other_aabb)) = (self.submap_aabb, other.submap_aabb) else {
            return false;
        };
        if !self_aabb.intersects(&other_aabb) {
            return false;
        }
        let Some(surface_obb) = self.surface_obb else {
            return false;
        };
        surface_obb.overlaps(&Obb::from_aabb(&other_aabb))
    }

    /// Deep copy under a new id, independently mutable in pose
    pub fn duplicate(&self, new_id: SubmapId) -> Submap {
        let mut copy = self.clone();
        copy.id = new_id;
        copy.is_constant = false;
        copy
    }

    /// Enumerate the TSDF grid and keep voxels that are observed, heavy
    /// enough and within the truncation band
    fn build_relevant_voxel_index(&mut self) {
        self.relevant_voxel_index.clear();
        self.num_relevant_voxels = 0;
        let vps = self.config.voxels_per_side;
        let min_weight = self.config.min_voxel_weight;
        let max_distance = self.config.max_voxel_distance;

        for (block_index, block) in self.tsdf_grid.blocks() {
            let mut locals = Vec::new();
            for (linear, voxel) in block.as_slice().iter().enumerate() {
                if voxel.weight >= min_weight
                    && !voxel.distance.is_nan()
                    && voxel.distance.abs() <= max_distance
                {
                    locals.push(LocalIndex::from_linear(linear, vps));
                }
            }
            if !locals.is_empty() {
                self.num_relevant_voxels += locals.len();
                self.relevant_voxel_index.insert(*block_index, locals);
            }
        }
    }

    fn build_local_bounds(&mut self) {
        let voxel_size = self.config.voxel_size;
        self.local_surface_aabb =
            Aabb::from_points(self.relevant_voxels().map(|g| g.center(voxel_size)));

        let block_size = self.tsdf_grid.block_size() as f64;
        self.local_grid_aabb = Aabb::from_points(
            self.tsdf_grid
                .block_indices()
                .flat_map(|b| {
                    let lo = nalgebra::Point3::new(
                        b.x as f64 * block_size,
                        b.y as f64 * block_size,
                        b.z as f64 * block_size,
                    );
                    let hi = lo + nalgebra::Vector3::repeat(block_size);
                    [lo, hi]
                }),
        );
    }

    fn refresh_world_bounds(&mut self) {
        self.surface_obb = self
            .local_surface_aabb
            .as_ref()
            .map(|local| Obb::from_local_aabb(local, &self.pose));
        self.submap_aabb = self
            .local_grid_aabb
            .as_ref()
            .map(|local| Obb::from_local_aabb(local, &self.pose).aabb());
    }
}

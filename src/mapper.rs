//! Transport-free mapping loop
//!
//! Ties the timeline, the sub-map collection and the pose graph
//! together: observations are fused into the active sub-map, a new
//! window seals the previous sub-map, adds it to the graph, discovers
//! registration constraints among overlapping pairs and re-optimizes.
//! After each optimization the odometry origin is shifted by the active
//! sub-map's pose correction, so the next incoming observation stays
//! continuous with the optimized world.
//!
//! The depth sensor, message transport and per-frame fusion stay
//! outside: point clouds arrive through [`Mapper::process_observation`]
//! and fusion happens behind the [`TsdfIntegrator`] seam.

use crate::collection::SubmapCollection;
use crate::error::Result;
use crate::grid::VoxelGrid;
use crate::pose_graph::{InformationMatrix, PoseGraph, SolverOptions};
use crate::registration::RegistrationCostOptions;
use crate::submap::SubmapConfig;
use crate::transform::Pose;
use crate::voxel::TsdfVoxel;
use log::{debug, info, warn};
use nalgebra::{Isometry3, Point3};
use std::collections::BTreeMap;

/// Per-frame fusion seam (§ external collaborators)
///
/// The grid lives in the active sub-map's local frame; the sensor pose
/// is given in that same frame.
pub trait TsdfIntegrator {
    fn integrate(
        &mut self,
        points: &[Point3<f64>],
        t_submap_sensor: &Pose,
        tsdf: &mut VoxelGrid<TsdfVoxel>,
    );
}

/// Timestamped odometry samples with interpolated lookup
///
/// Lookups interpolate between the bracketing samples; a query ahead of
/// the newest sample fails once it is more than the lookup timeout in
/// the future.
#[derive(Debug, Clone)]
pub struct OdometryBuffer {
    samples: BTreeMap<u64, Pose>,
    /// Nanoseconds a query may run ahead of the newest sample
    lookup_timeout: u64,
}

impl OdometryBuffer {
    pub fn new(lookup_timeout: u64) -> Self {
        Self {
            samples: BTreeMap::new(),
            lookup_timeout,
        }
    }

    /// Record `T_odom_robot` at `timestamp`
    pub fn add_pose(&mut self, timestamp: u64, t_odom_robot: Pose) {
        self.samples.insert(timestamp, t_odom_robot);
    }

    /// Interpolated `T_odom_robot` at `timestamp`
    pub fn lookup(&self, timestamp: u64) -> Option<Pose> {
        let before = self.samples.range(..=timestamp).next_back();
        let after = self.samples.range(timestamp + 1..).next();
        match (before, after) {
            (Some((&t0, p0)), Some((&t1, p1))) => {
                let alpha = (timestamp - t0) as f64 / (t1 - t0) as f64;
                Some(p0.lerp_slerp(p1, alpha))
            }
            (Some((&t0, p0)), None) => {
                // Extrapolating a stale buffer is worse than skipping
                (timestamp - t0 <= self.lookup_timeout).then_some(*p0)
            }
            _ => None,
        }
    }
}

/// Mapper configuration
#[derive(Debug, Clone)]
pub struct MapperConfig {
    pub submap_config: SubmapConfig,
    /// Time-window length in nanoseconds
    pub submap_creation_interval: u64,
    /// How far an observation may run ahead of the odometry, ns
    pub pose_lookup_timeout: u64,
    /// Static sensor mounting transform
    pub t_robot_sensor: Pose,
    /// Information placeholder stamped on discovered constraints
    pub constraint_information: InformationMatrix,
    pub solver: SolverOptions,
    pub cost: RegistrationCostOptions,
}

impl Default for MapperConfig {
    fn default() -> Self {
        Self {
            submap_config: SubmapConfig::default(),
            submap_creation_interval: crate::collection::DEFAULT_CREATION_INTERVAL_NS,
            pose_lookup_timeout: 80_000_000,
            t_robot_sensor: Isometry3::identity(),
            constraint_information: InformationMatrix::identity(),
            solver: SolverOptions::default(),
            cost: RegistrationCostOptions::default(),
        }
    }
}

/// Single-owner driver of the core data flow
pub struct Mapper<I: TsdfIntegrator> {
    config: MapperConfig,
    collection: SubmapCollection,
    pose_graph: PoseGraph,
    odometry: OdometryBuffer,
    integrator: I,
    /// Drift-corrected odometry origin `T_world_odom`
    t_world_odom: Pose,
}

impl<I: TsdfIntegrator> Mapper<I> {
    pub fn new(config: MapperConfig, integrator: I) -> Self {
        let collection = SubmapCollection::new(
            config.submap_config.clone(),
            config.submap_creation_interval,
        );
        let pose_graph = PoseGraph::new(config.cost.clone());
        let odometry = OdometryBuffer::new(config.pose_lookup_timeout);
        Self {
            config,
            collection,
            pose_graph,
            odometry,
            integrator,
            t_world_odom: Isometry3::identity(),
        }
    }

    pub fn collection(&self) -> &SubmapCollection {
        &self.collection
    }

    pub fn pose_graph(&self) -> &PoseGraph {
        &self.pose_graph
    }

    /// Current drift-corrected odometry origin
    pub fn t_world_odom(&self) -> &Pose {
        &self.t_world_odom
    }

    /// Feed an odometry sample
    pub fn add_odometry(&mut self, timestamp: u64, t_odom_robot: Pose) {
        self.odometry.add_pose(timestamp, t_odom_robot);
    }

    /// Process one depth observation; returns false when it was skipped
    /// because no robot pose could be found for its timestamp
    pub fn process_observation(
        &mut self,
        timestamp: u64,
        points: &[Point3<f64>],
    ) -> Result<bool> {
        let Some(t_odom_robot) = self.odometry.lookup(timestamp) else {
            warn!("skipping observation: robot pose at t={timestamp} is unknown");
            return Ok(false);
        };
        let mut t_world_robot = self.t_world_odom * t_odom_robot;

        if self.collection.should_create_new_submap(timestamp) {
            if !self.collection.is_empty() {
                t_world_robot = self.finish_active_submap(t_world_robot)?;
            }
            self.collection.create_new_submap(t_world_robot, timestamp);
        }

        let t_world_sensor = t_world_robot * self.config.t_robot_sensor;
        let active = self.collection.active_submap_mut()?;
        let t_submap_sensor = active.pose().inverse() * t_world_sensor;
        self.integrator
            .integrate(points, &t_submap_sensor, active.tsdf_grid_mut());
        Ok(true)
    }

    /// Seal the active sub-map, grow the pose graph and re-optimize;
    /// returns the drift-corrected robot pose
    fn finish_active_submap(&mut self, t_world_robot: Pose) -> Result<Pose> {
        let finished_id = self.collection.active_submap_id()?;
        self.collection.submap_mut(finished_id)?.seal();
        if self.config.cost.use_esdf_distance
            && !self.collection.submap(finished_id)?.has_esdf()
        {
            self.collection.generate_esdf_by_id(finished_id)?;
        }

        let pose = self.collection.get_submap_pose(finished_id)?;
        let constant = self.collection.submap(finished_id)?.is_constant();
        self.pose_graph.add_node(finished_id, pose, constant);

        // One registration constraint per overlapping finished pair
        for (first, second) in self.collection.overlapping_pairs() {
            match self.pose_graph.add_constraint(
                first,
                second,
                self.config.constraint_information,
            ) {
                Ok(()) => debug!("added registration constraint ({first}, {second})"),
                Err(crate::error::Error::DuplicateConstraint(..)) => {}
                Err(e) => return Err(e),
            }
        }

        info!("optimizing the pose graph");
        let t_old_active = self.collection.get_submap_pose(finished_id)?;
        let summary = self
            .pose_graph
            .optimize(&self.collection, &self.config.solver)?;
        if !summary.is_solution_usable() {
            warn!("pose graph solution not usable, keeping previous poses");
            return Ok(t_world_robot);
        }
        self.pose_graph.update_collection_poses(&mut self.collection)?;

        // Fold the active sub-map's correction into the odometry origin
        let t_new_active = self.collection.get_submap_pose(finished_id)?;
        let delta = t_new_active * t_old_active.inverse();
        self.t_world_odom = delta * self.t_world_odom;
        Ok(delta * t_world_robot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::voxel::GlobalIndex;
    use approx::assert_relative_eq;

    const MS: u64 = 1_000_000;
    const SECOND: u64 = 1_000_000_000;

    /// Stamps a fixed spherical shell into the active grid, ignoring the
    /// points; enough structure for sealing and registration to engage
    struct ShellIntegrator;

    impl TsdfIntegrator for ShellIntegrator {
        fn integrate(
            &mut self,
            _points: &[Point3<f64>],
            _t_submap_sensor: &Pose,
            tsdf: &mut VoxelGrid<TsdfVoxel>,
        ) {
            let voxel_size = tsdf.voxel_size();
            for x in -8i64..8 {
                for y in -8i64..8 {
                    for z in -8i64..8 {
                        let g = GlobalIndex::new(x, y, z);
                        let d = g.center(voxel_size).coords.norm() - 0.4;
                        if d.abs() <= 0.5 {
                            *tsdf.voxel_mut_at(g) = TsdfVoxel {
                                distance: d as f32,
                                weight: 1.0,
                            };
                        }
                    }
                }
            }
        }
    }

    fn test_mapper() -> Mapper<ShellIntegrator> {
        let config = MapperConfig {
            submap_config: SubmapConfig {
                voxel_size: 0.1,
                voxels_per_side: 8,
                ..SubmapConfig::default()
            },
            submap_creation_interval: SECOND,
            ..MapperConfig::default()
        };
        Mapper::new(config, ShellIntegrator)
    }

    #[test]
    fn test_observation_without_pose_is_skipped() {
        let mut mapper = test_mapper();
        assert!(!mapper.process_observation(0, &[]).unwrap());
        assert!(mapper.collection().is_empty());

        // 50 ms ahead of the newest sample is within the lookup timeout
        mapper.add_odometry(0, Isometry3::identity());
        assert!(mapper.process_observation(50 * MS, &[]).unwrap());

        // 200 ms ahead is not
        assert!(!mapper.process_observation(250 * MS, &[]).unwrap());
    }

    #[test]
    fn test_window_lifecycle_feeds_pose_graph() {
        let mut mapper = test_mapper();
        for t in 0..4u64 {
            mapper.add_odometry(t * SECOND, Isometry3::identity());
            assert!(mapper.process_observation(t * SECOND, &[]).unwrap());
        }

        // Three windows sealed, a fourth active
        assert_eq!(mapper.collection().len(), 4);
        assert_eq!(mapper.collection().finished_ids(), vec![0, 1, 2]);
        assert_eq!(mapper.pose_graph().num_nodes(), 3);
        // Identical shells at identical poses all overlap pairwise
        assert_eq!(mapper.pose_graph().num_constraints(), 3);
    }

    #[test]
    fn test_drift_compensation_keeps_origin_consistent() {
        let mut mapper = test_mapper();
        for t in 0..3u64 {
            mapper.add_odometry(t * SECOND, Isometry3::identity());
            mapper.process_observation(t * SECOND, &[]).unwrap();
        }
        // Perfectly consistent observations: no correction accumulates
        assert_relative_eq!(
            mapper.t_world_odom().translation.vector.norm(),
            0.0,
            epsilon = 1e-6
        );
    }

    #[test]
    fn test_odometry_buffer_interpolates() {
        let mut buffer = OdometryBuffer::new(80 * MS);
        buffer.add_pose(0, Isometry3::translation(0.0, 0.0, 0.0));
        buffer.add_pose(SECOND, Isometry3::translation(1.0, 0.0, 0.0));

        let mid = buffer.lookup(SECOND / 2).unwrap();
        assert_relative_eq!(mid.translation.x, 0.5, epsilon = 1e-9);
        assert!(buffer.lookup(SECOND + 79 * MS).is_some());
        assert!(buffer.lookup(SECOND + 81 * MS).is_none());
    }
}

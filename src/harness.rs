//! Perturb-and-solve registration probe
//!
//! Takes a reference/reading sub-map pair, disturbs the reading pose
//! over a grid of offsets, solves each registration through a two-node
//! pose graph and reports the remaining pose error per disturbance.
//! When reference and reading ids coincide the reference is deep-copied
//! first, so the probe aligns a sub-map against itself.

use crate::collection::SubmapCollection;
use crate::error::Result;
use crate::pose_graph::{InformationMatrix, PoseGraph, SolverOptions};
use crate::registration::RegistrationCostOptions;
use crate::submap::SubmapId;
use crate::transform::{wrap_angle, Pose, XyzYaw};
use log::{info, warn};
use nalgebra::{UnitQuaternion, Vector3};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// One pose offset of the disturbance sweep
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Disturbance {
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub yaw: f64,
    pub pitch: f64,
    pub roll: f64,
}

/// Value lists swept per axis (`test_range/{x,y,z,yaw,pitch,roll}`)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DisturbanceRanges {
    #[serde(default = "zero_range")]
    pub x: Vec<f64>,
    #[serde(default = "zero_range")]
    pub y: Vec<f64>,
    #[serde(default = "zero_range")]
    pub z: Vec<f64>,
    #[serde(default = "zero_range")]
    pub yaw: Vec<f64>,
    #[serde(default = "zero_range")]
    pub pitch: Vec<f64>,
    #[serde(default = "zero_range")]
    pub roll: Vec<f64>,
}

fn zero_range() -> Vec<f64> {
    vec![0.0]
}

impl Default for DisturbanceRanges {
    fn default() -> Self {
        Self {
            x: zero_range(),
            y: zero_range(),
            z: zero_range(),
            yaw: zero_range(),
            pitch: zero_range(),
            roll: zero_range(),
        }
    }
}

impl DisturbanceRanges {
    /// Cartesian product in x, y, z, yaw, pitch, roll nesting order
    pub fn grid(&self) -> Vec<Disturbance> {
        let mut grid = Vec::new();
        for &x in &self.x {
            for &y in &self.y {
                for &z in &self.z {
                    for &yaw in &self.yaw {
                        for &pitch in &self.pitch {
                            for &roll in &self.roll {
                                grid.push(Disturbance {
                                    x,
                                    y,
                                    z,
                                    yaw,
                                    pitch,
                                    roll,
                                });
                            }
                        }
                    }
                }
            }
        }
        grid
    }
}

/// Apply a disturbance: translation added in world frame, yaw composed
/// about the body z-axis
///
/// Pitch and roll offsets are accepted in the type but not applied;
/// the optimization parameterization has no way to correct them.
pub fn perturb(pose: &Pose, disturbance: &Disturbance) -> Pose {
    let mut perturbed = *pose;
    perturbed.translation.vector +=
        Vector3::new(disturbance.x, disturbance.y, disturbance.z);
    perturbed.rotation *= UnitQuaternion::from_euler_angles(0.0, 0.0, disturbance.yaw);
    perturbed
}

/// Sweep configuration: solver, cost and parameterization options
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegistrationHarnessOptions {
    #[serde(default)]
    pub solver: SolverOptions,
    #[serde(default)]
    pub cost: RegistrationCostOptions,
}

/// Outcome of one perturb-and-solve run
#[derive(Debug, Clone)]
pub struct SweepRecord {
    pub disturbance: Disturbance,
    /// Remaining translation error after the solve
    pub position_error: Vector3<f64>,
    /// Remaining yaw error after the solve, wrapped
    pub yaw_error: f64,
    pub usable: bool,
    pub solve_time: Duration,
    pub iterations: usize,
}

/// All records of a sweep
#[derive(Debug, Clone, Default)]
pub struct SweepReport {
    pub reference_submap_id: SubmapId,
    pub reading_submap_id: SubmapId,
    pub records: Vec<SweepRecord>,
}

impl SweepReport {
    /// True when every disturbance produced a usable solution
    pub fn all_usable(&self) -> bool {
        self.records.iter().all(|r| r.usable)
    }
}

/// Run the full disturbance sweep for one sub-map pair
///
/// Duplicates the reference when `reference_submap_id ==
/// reading_submap_id`, generates missing ESDFs when the cost consumes
/// them, and restores the reading sub-map's pose between runs so every
/// disturbance starts from the same ground truth.
pub fn register_submap_pair(
    collection: &mut SubmapCollection,
    reference_submap_id: SubmapId,
    reading_submap_id: SubmapId,
    ranges: &DisturbanceRanges,
    options: &RegistrationHarnessOptions,
) -> Result<SweepReport> {
    let reading_submap_id = if reference_submap_id == reading_submap_id {
        let copy_id = collection.unused_id();
        info!(
            "reference and reading ids are the same, duplicating {reference_submap_id} as {copy_id}"
        );
        collection.duplicate_submap(reference_submap_id, copy_id)?;
        copy_id
    } else {
        reading_submap_id
    };

    if options.cost.use_esdf_distance {
        for id in [reference_submap_id, reading_submap_id] {
            if !collection.submap(id)?.has_esdf() {
                collection.generate_esdf_by_id(id)?;
            }
        }
    }

    let t_world_reference = collection.get_submap_pose(reference_submap_id)?;
    let t_world_reading_true = collection.get_submap_pose(reading_submap_id)?;
    let true_yaw = XyzYaw::from_pose(&t_world_reading_true).yaw;

    let mut report = SweepReport {
        reference_submap_id,
        reading_submap_id,
        records: Vec::new(),
    };

    for disturbance in ranges.grid() {
        if disturbance.pitch != 0.0 || disturbance.roll != 0.0 {
            warn!("pitch/roll disturbances are not applied");
        }
        let perturbed = perturb(&t_world_reading_true, &disturbance);
        collection.set_submap_pose(reading_submap_id, perturbed)?;

        let mut graph = PoseGraph::new(options.cost.clone());
        graph.add_node(reference_submap_id, t_world_reference, true);
        graph.add_node(reading_submap_id, perturbed, false);
        graph.add_constraint(
            reference_submap_id,
            reading_submap_id,
            InformationMatrix::identity(),
        )?;

        let summary = graph.optimize(collection, &options.solver)?;

        let optimized = graph.submap_poses()[&reading_submap_id];
        let position_error =
            optimized.translation.vector - t_world_reading_true.translation.vector;
        let yaw_error = wrap_angle(XyzYaw::from_pose(&optimized).yaw - true_yaw);

        info!(
            "disturbance ({:.3} {:.3} {:.3} | {:.3}) -> error ({:.6} {:.6} {:.6} | {:.6}), {} steps, usable: {}",
            disturbance.x,
            disturbance.y,
            disturbance.z,
            disturbance.yaw,
            position_error.x,
            position_error.y,
            position_error.z,
            yaw_error,
            summary.num_iterations(),
            summary.is_solution_usable()
        );

        report.records.push(SweepRecord {
            disturbance,
            position_error,
            yaw_error,
            usable: summary.is_solution_usable(),
            solve_time: summary.total_time,
            iterations: summary.num_iterations(),
        });

        // Restore ground truth for the next disturbance
        collection.set_submap_pose(reading_submap_id, t_world_reading_true)?;
    }

    Ok(report)
}

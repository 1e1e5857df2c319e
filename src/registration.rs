//! Direct sub-map-to-sub-map registration cost
//!
//! For an ordered pair (reference, reading), every relevant voxel of the
//! reference contributes one residual: the difference between the
//! voxel's own signed distance and the reading sub-map's distance field
//! interpolated at the voxel's image in the reading frame. Jacobians
//! are expressed in the (x, y, z, yaw) parameterization; pitch and roll
//! are locked, so the yaw derivative is the planar rotation derivative
//! `R'(ψ) = R(ψ + π/2)` acting on the xy components.

use crate::error::{Error, Result};
use crate::submap::Submap;
use crate::transform::{Pose, XyzYaw};
use nalgebra::{Point3, Rotation3, Vector3};
use serde::{Deserialize, Serialize};

/// Jacobian evaluation strategy
///
/// The numeric variant wraps the analytic residual evaluation in
/// central differences and exists for verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CostFunctionType {
    Analytic,
    Numeric,
}

/// Registration cost parameters (`submap_registration/cost`)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistrationCostOptions {
    /// Reading samples lighter than this count as unobserved
    pub min_voxel_weight: f64,
    /// Truncation applied to TSDF distances on the reading side
    pub max_voxel_distance: f64,
    /// Residual assigned when the reading sample is invalid
    pub no_correspondence_cost: f64,
    /// Sample the reading ESDF instead of its truncated TSDF
    pub use_esdf_distance: bool,
    pub cost_function_type: CostFunctionType,
}

impl Default for RegistrationCostOptions {
    fn default() -> Self {
        Self {
            min_voxel_weight: 1e-6,
            max_voxel_distance: 0.6,
            no_correspondence_cost: 0.0,
            use_esdf_distance: true,
            cost_function_type: CostFunctionType::Analytic,
        }
    }
}

/// Central-difference step for the numeric variant
const NUMERIC_DIFF_STEP: f64 = 1e-6;

/// One sampled point of the reference surface
struct ReferencePoint {
    /// Voxel center in the reference local frame
    p_ref: Point3<f64>,
    /// Reference TSDF distance at the voxel
    distance: f64,
    /// Reference fusion weight at the voxel
    weight: f64,
}

/// Mutable views the solver hands in for the two Jacobian blocks
pub struct JacobianBlocks<'j> {
    pub reference: &'j mut [[f64; 4]],
    pub reading: &'j mut [[f64; 4]],
}

/// Residual and Jacobian producer for one ordered sub-map pair
///
/// Borrows both sub-maps read-only for the duration of a single solve;
/// safe to evaluate concurrently from multiple solver workers.
pub struct RegistrationCost<'a> {
    reading: &'a Submap,
    options: RegistrationCostOptions,
    reference_points: Vec<ReferencePoint>,
    /// Scalar factor from the constraint's information matrix
    gain: f64,
}

impl<'a> RegistrationCost<'a> {
    /// Build the cost for `(reference, reading)`
    ///
    /// Fails when ESDF distances are requested but the reading sub-map's
    /// ESDF has not been generated yet.
    pub fn new(
        reference: &'a Submap,
        reading: &'a Submap,
        options: RegistrationCostOptions,
    ) -> Result<Self> {
        if options.use_esdf_distance && !reading.has_esdf() {
            return Err(Error::EsdfNotGenerated(reading.id()));
        }

        let voxel_size = reference.config().voxel_size;
        let mut reference_points = Vec::with_capacity(reference.num_relevant_voxels());
        for global in reference.relevant_voxels() {
            let voxel = reference
                .tsdf_grid()
                .voxel_at(global)
                .expect("relevant voxels exist in the TSDF grid");
            reference_points.push(ReferencePoint {
                p_ref: global.center(voxel_size),
                distance: voxel.distance as f64,
                weight: voxel.weight as f64,
            });
        }

        Ok(Self {
            reading,
            options,
            reference_points,
            gain: 1.0,
        })
    }

    /// Scale all residuals (and Jacobians) by the square-root information
    /// gain of the owning constraint
    pub fn set_gain(&mut self, gain: f64) {
        self.gain = gain;
    }

    pub fn options(&self) -> &RegistrationCostOptions {
        &self.options
    }

    /// One residual per relevant reference voxel
    pub fn residual_count(&self) -> usize {
        self.reference_points.len()
    }

    /// Sample the reading distance field; `None` on any invalid corner
    fn sample_reading(&self, p: &Point3<f64>) -> Option<(f64, f64, Vector3<f64>)> {
        if self.options.use_esdf_distance {
            let grid = self.reading.esdf_grid().expect("checked at construction");
            grid.sample_with_gradient(p)
        } else {
            let (d, w, g) = self.reading.tsdf_grid().sample_with_gradient(p)?;
            let t = self.options.max_voxel_distance;
            Some((d.clamp(-t, t), w, g))
        }
    }

    /// Evaluate residuals at the given world poses, dispatching Jacobians
    /// per the configured type
    pub fn evaluate(
        &self,
        t_world_reference: &Pose,
        t_world_reading: &Pose,
        residuals: &mut [f64],
        jacobians: Option<JacobianBlocks<'_>>,
    ) {
        match (self.options.cost_function_type, jacobians) {
            (_, None) => {
                self.evaluate_analytic(t_world_reference, t_world_reading, residuals, None)
            }
            (CostFunctionType::Analytic, jacobians) => {
                self.evaluate_analytic(t_world_reference, t_world_reading, residuals, jacobians)
            }
            (CostFunctionType::Numeric, Some(jacobians)) => {
                self.evaluate_numeric(t_world_reference, t_world_reading, residuals, jacobians)
            }
        }
    }

    /// Residuals plus analytic Jacobians
    fn evaluate_analytic(
        &self,
        t_world_reference: &Pose,
        t_world_reading: &Pose,
        residuals: &mut [f64],
        mut jacobians: Option<JacobianBlocks<'_>>,
    ) {
        assert_eq!(residuals.len(), self.reference_points.len());

        let rot_w_ref: Rotation3<f64> = t_world_reference.rotation.into();
        let rot_w_reading: Rotation3<f64> = t_world_reading.rotation.into();
        let rot_reading_w = rot_w_reading.inverse();
        let t_ref = t_world_reference.translation.vector;
        let t_reading = t_world_reading.translation.vector;

        for (i, point) in self.reference_points.iter().enumerate() {
            let rotated_ref = rot_w_ref * point.p_ref.coords;
            let p_world = rotated_ref + t_ref;
            let p_reading = Point3::from(rot_reading_w * (p_world - t_reading));

            let sample = self
                .sample_reading(&p_reading)
                .filter(|(_, weight, _)| *weight >= self.options.min_voxel_weight);

            let Some((d_reading, w_reading, gradient)) = sample else {
                residuals[i] = self.gain * self.options.no_correspondence_cost;
                if let Some(blocks) = jacobians.as_mut() {
                    blocks.reference[i] = [0.0; 4];
                    blocks.reading[i] = [0.0; 4];
                }
                continue;
            };

            let weight = (point.weight * w_reading).sqrt().min(1.0);
            let scale = self.gain * weight;
            residuals[i] = scale * (point.distance - d_reading);

            let Some(blocks) = jacobians.as_mut() else {
                continue;
            };

            // World-frame gradient of the reading field at the sample
            let g_world = rot_w_reading * gradient;
            // ∂(R(ψ)·v)/∂ψ restricted to the xy components
            let spin = |v: Vector3<f64>| Vector3::new(-v.y, v.x, 0.0);

            // Reference block: the residual moves through p_world only
            let d_yaw_ref = g_world.dot(&spin(rotated_ref));
            blocks.reference[i] = [
                -scale * g_world.x,
                -scale * g_world.y,
                -scale * g_world.z,
                -scale * d_yaw_ref,
            ];

            // Reading block: translation enters negated through p_reading,
            // yaw through the inverse rotation
            let d_yaw_reading = -g_world.dot(&spin(p_world - t_reading));
            blocks.reading[i] = [
                scale * g_world.x,
                scale * g_world.y,
                scale * g_world.z,
                -scale * d_yaw_reading,
            ];
        }
    }

    /// Residuals plus central-difference Jacobians; verification only
    fn evaluate_numeric(
        &self,
        t_world_reference: &Pose,
        t_world_reading: &Pose,
        residuals: &mut [f64],
        blocks: JacobianBlocks<'_>,
    ) {
        self.evaluate_analytic(t_world_reference, t_world_reading, residuals, None);

        // Perturb one (x, y, z, yaw) component at a time, substituting
        // into the pose's own log-map
        let nudge = |pose: &Pose, k: usize, h: f64| -> Pose {
            let mut delta = [0.0; 4];
            delta[k] = h;
            XyzYaw::from_pose(pose).plus(&delta).reconstruct(pose)
        };

        let n = residuals.len();
        let mut plus = vec![0.0; n];
        let mut minus = vec![0.0; n];
        for k in 0..4 {
            let pose_plus = nudge(t_world_reference, k, NUMERIC_DIFF_STEP);
            let pose_minus = nudge(t_world_reference, k, -NUMERIC_DIFF_STEP);
            self.evaluate_analytic(&pose_plus, t_world_reading, &mut plus, None);
            self.evaluate_analytic(&pose_minus, t_world_reading, &mut minus, None);
            for i in 0..n {
                blocks.reference[i][k] = (plus[i] - minus[i]) / (2.0 * NUMERIC_DIFF_STEP);
            }

            let pose_plus = nudge(t_world_reading, k, NUMERIC_DIFF_STEP);
            let pose_minus = nudge(t_world_reading, k, -NUMERIC_DIFF_STEP);
            self.evaluate_analytic(t_world_reference, &pose_plus, &mut plus, None);
            self.evaluate_analytic(t_world_reference, &pose_minus, &mut minus, None);
            for i in 0..n {
                blocks.reading[i][k] = (plus[i] - minus[i]) / (2.0 * NUMERIC_DIFF_STEP);
            }
        }
    }
}

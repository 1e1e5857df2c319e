//! Rigid transforms and the (x, y, z, yaw) optimization parameterization
//!
//! Poses are parameterized for optimization by a 6-vector whose first
//! three components are the world translation and whose last three are
//! the scaled rotation axis. The pose graph optimizes only components
//! 0, 1, 2 and 5; pitch and roll (components 3 and 4) stay locked to
//! their initial values and the full pose is reconstructed by
//! substituting the optimized components back and re-exponentiating.

use nalgebra::{Isometry3, Translation3, UnitQuaternion, Vector3, Vector6};
use std::f64::consts::PI;

/// A rigid transform in world coordinates
pub type Pose = Isometry3<f64>;

/// 6-vector parameterization `[t_x, t_y, t_z, ω_x, ω_y, ω_z]` of a pose
pub fn log_map(pose: &Pose) -> Vector6<f64> {
    let t = pose.translation.vector;
    let w = pose.rotation.scaled_axis();
    Vector6::new(t.x, t.y, t.z, w.x, w.y, w.z)
}

/// Inverse of [`log_map`]
pub fn exp_map(vec: &Vector6<f64>) -> Pose {
    let translation = Translation3::new(vec[0], vec[1], vec[2]);
    let rotation = UnitQuaternion::from_scaled_axis(Vector3::new(vec[3], vec[4], vec[5]));
    Isometry3::from_parts(translation, rotation)
}

/// Wrap an angle into `(−π, π]`
pub fn wrap_angle(angle: f64) -> f64 {
    let wrapped = angle.rem_euclid(2.0 * PI);
    if wrapped > PI {
        wrapped - 2.0 * PI
    } else {
        wrapped
    }
}

/// The four optimized pose components `(x, y, z, yaw)`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct XyzYaw {
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub yaw: f64,
}

impl XyzYaw {
    pub fn new(x: f64, y: f64, z: f64, yaw: f64) -> Self {
        Self { x, y, z, yaw }
    }

    /// Extract components 0, 1, 2 and 5 of the pose's log-map
    pub fn from_pose(pose: &Pose) -> Self {
        let vec = log_map(pose);
        Self {
            x: vec[0],
            y: vec[1],
            z: vec[2],
            yaw: vec[5],
        }
    }

    /// Reconstruct the full pose by substituting these components into
    /// `initial`'s log-map and re-exponentiating; pitch and roll come
    /// from `initial` unchanged
    pub fn reconstruct(&self, initial: &Pose) -> Pose {
        let mut vec = log_map(initial);
        vec[0] = self.x;
        vec[1] = self.y;
        vec[2] = self.z;
        vec[5] = self.yaw;
        exp_map(&vec)
    }

    /// The local parameterization plus-operator: translation components
    /// add, yaw adds and wraps into `(−π, π]`
    pub fn plus(&self, delta: &[f64; 4]) -> Self {
        Self {
            x: self.x + delta[0],
            y: self.y + delta[1],
            z: self.z + delta[2],
            yaw: wrap_angle(self.yaw + delta[3]),
        }
    }

    pub fn as_array(&self) -> [f64; 4] {
        [self.x, self.y, self.z, self.yaw]
    }
}

impl From<[f64; 4]> for XyzYaw {
    fn from(p: [f64; 4]) -> Self {
        Self::new(p[0], p[1], p[2], p[3])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn example_pose(yaw: f64, pitch: f64, roll: f64, t: (f64, f64, f64)) -> Pose {
        let rotation = UnitQuaternion::from_euler_angles(roll, pitch, yaw);
        Isometry3::from_parts(Translation3::new(t.0, t.1, t.2), rotation)
    }

    #[test]
    fn test_log_exp_roundtrip() {
        let pose = example_pose(0.7, 0.02, -0.01, (1.0, -2.0, 0.5));
        let vec = log_map(&pose);
        let back = exp_map(&vec);
        assert_relative_eq!(
            pose.translation.vector,
            back.translation.vector,
            epsilon = 1e-14
        );
        assert_relative_eq!(
            pose.rotation.angle(),
            back.rotation.angle(),
            epsilon = 1e-12
        );
    }

    #[test]
    fn test_substitution_roundtrip_is_stable() {
        // Substituting a pose's own components must reproduce the pose
        let pose = example_pose(1.2, 0.05, -0.03, (3.0, 0.0, -1.5));
        let params = XyzYaw::from_pose(&pose);
        let back = params.reconstruct(&pose);
        assert_relative_eq!(
            pose.to_homogeneous(),
            back.to_homogeneous(),
            epsilon = 1e-12
        );
    }

    #[test]
    fn test_substitution_moves_only_xyz_yaw() {
        let initial = example_pose(0.3, 0.04, 0.02, (1.0, 1.0, 1.0));
        let initial_vec = log_map(&initial);

        let updated = XyzYaw::new(5.0, -1.0, 2.0, 0.9).reconstruct(&initial);
        let updated_vec = log_map(&updated);

        assert_relative_eq!(updated_vec[0], 5.0, epsilon = 1e-12);
        assert_relative_eq!(updated_vec[1], -1.0, epsilon = 1e-12);
        assert_relative_eq!(updated_vec[2], 2.0, epsilon = 1e-12);
        assert_relative_eq!(updated_vec[5], 0.9, epsilon = 1e-9);
        // Pitch and roll components stay locked
        assert_relative_eq!(updated_vec[3], initial_vec[3], epsilon = 1e-9);
        assert_relative_eq!(updated_vec[4], initial_vec[4], epsilon = 1e-9);
    }

    #[test]
    fn test_wrap_angle() {
        assert_relative_eq!(wrap_angle(0.0), 0.0);
        assert_relative_eq!(wrap_angle(PI), PI);
        assert_relative_eq!(wrap_angle(-PI), PI, epsilon = 1e-12);
        assert_relative_eq!(wrap_angle(3.0 * PI), PI, epsilon = 1e-12);
        assert_relative_eq!(wrap_angle(PI + 0.1), -PI + 0.1, epsilon = 1e-12);
        assert_relative_eq!(wrap_angle(-0.3), -0.3);
    }

    #[test]
    fn test_plus_operator_wraps_yaw() {
        let p = XyzYaw::new(0.0, 0.0, 0.0, 3.0);
        let q = p.plus(&[1.0, 2.0, 3.0, 0.5]);
        assert_relative_eq!(q.x, 1.0);
        assert_relative_eq!(q.y, 2.0);
        assert_relative_eq!(q.z, 3.0);
        assert_relative_eq!(q.yaw, 3.5 - 2.0 * PI, epsilon = 1e-12);
    }
}

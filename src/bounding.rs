//! Axis-aligned and oriented bounding boxes in world coordinates

use crate::transform::Pose;
use nalgebra::{Point3, UnitQuaternion, Vector3};

/// Axis-aligned bounding box
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Aabb {
    pub min: Point3<f64>,
    pub max: Point3<f64>,
}

impl Aabb {
    /// Box spanning two corner points in any order
    pub fn new(a: Point3<f64>, b: Point3<f64>) -> Self {
        Self {
            min: Point3::new(a.x.min(b.x), a.y.min(b.y), a.z.min(b.z)),
            max: Point3::new(a.x.max(b.x), a.y.max(b.y), a.z.max(b.z)),
        }
    }

    /// Smallest box containing all points; `None` for an empty iterator
    pub fn from_points<I: IntoIterator<Item = Point3<f64>>>(points: I) -> Option<Self> {
        let mut iter = points.into_iter();
        let first = iter.next()?;
        let mut aabb = Self {
            min: first,
            max: first,
        };
        for p in iter {
            aabb.grow(p);
        }
        Some(aabb)
    }

    /// Extend the box to contain `p`
    pub fn grow(&mut self, p: Point3<f64>) {
        self.min = Point3::new(self.min.x.min(p.x), self.min.y.min(p.y), self.min.z.min(p.z));
        self.max = Point3::new(self.max.x.max(p.x), self.max.y.max(p.y), self.max.z.max(p.z));
    }

    pub fn center(&self) -> Point3<f64> {
        nalgebra::center(&self.min, &self.max)
    }

    pub fn half_extents(&self) -> Vector3<f64> {
        (self.max - self.min) * 0.5
    }

    /// Closed-interval overlap test
    pub fn intersects(&self, other: &Aabb) -> bool {
        self.min.x <= other.max.x
            && self.max.x >= other.min.x
            && self.min.y <= other.max.y
            && self.max.y >= other.min.y
            && self.min.z <= other.max.z
            && self.max.z >= other.min.z
    }

    pub fn contains_point(&self, p: &Point3<f64>) -> bool {
        self.min.x <= p.x
            && p.x <= self.max.x
            && self.min.y <= p.y
            && p.y <= self.max.y
            && self.min.z <= p.z
            && p.z <= self.max.z
    }

    /// The 8 corner points
    pub fn corners(&self) -> [Point3<f64>; 8] {
        let (lo, hi) = (self.min, self.max);
        [
            Point3::new(lo.x, lo.y, lo.z),
            Point3::new(lo.x, lo.y, hi.z),
            Point3::new(lo.x, hi.y, lo.z),
            Point3::new(lo.x, hi.y, hi.z),
            Point3::new(hi.x, lo.y, lo.z),
            Point3::new(hi.x, lo.y, hi.z),
            Point3::new(hi.x, hi.y, lo.z),
            Point3::new(hi.x, hi.y, hi.z),
        ]
    }
}

/// Oriented bounding box
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Obb {
    pub center: Point3<f64>,
    pub half_extents: Vector3<f64>,
    pub rotation: UnitQuaternion<f64>,
}

impl Obb {
    /// Rigidly transform a box given in a local frame into world coordinates
    pub fn from_local_aabb(local: &Aabb, pose: &Pose) -> Self {
        Self {
            center: pose * local.center(),
            half_extents: local.half_extents(),
            rotation: pose.rotation,
        }
    }

    /// An axis-aligned box viewed as a degenerate OBB
    pub fn from_aabb(aabb: &Aabb) -> Self {
        Self {
            center: aabb.center(),
            half_extents: aabb.half_extents(),
            rotation: UnitQuaternion::identity(),
        }
    }

    /// The 8 corner points in world coordinates
    pub fn corners(&self) -> [Point3<f64>; 8] {
        let mut corners = [self.center; 8];
        let h = self.half_extents;
        for (j, corner) in corners.iter_mut().enumerate() {
            let sign = |bit: usize| if (j >> bit) & 1 == 1 { 1.0 } else { -1.0 };
            let local = Vector3::new(sign(2) * h.x, sign(1) * h.y, sign(0) * h.z);
            *corner += self.rotation * local;
        }
        corners
    }

    /// World AABB of the corner points
    pub fn aabb(&self) -> Aabb {
        Aabb::from_points(self.corners()).expect("an OBB always has corners")
    }

    fn axes(&self) -> [Vector3<f64>; 3] {
        let m = self.rotation.to_rotation_matrix();
        [
            m * Vector3::x(),
            m * Vector3::y(),
            m * Vector3::z(),
        ]
    }

    /// Projected radius of the box onto a unit-ish axis
    fn projected_radius(&self, axes: &[Vector3<f64>; 3], axis: &Vector3<f64>) -> f64 {
        self.half_extents.x * axes[0].dot(axis).abs()
            + self.half_extents.y * axes[1].dot(axis).abs()
            + self.half_extents.z * axes[2].dot(axis).abs()
    }

    /// Separating-axis test over the 15 candidate axes
    ///
    /// Returns true when a separating axis exists, i.e. the boxes are
    /// provably disjoint.
    pub fn separated_from(&self, other: &Obb) -> bool {
        let a_axes = self.axes();
        let b_axes = other.axes();
        let t = other.center - self.center;

        let mut candidates = Vec::with_capacity(15);
        candidates.extend_from_slice(&a_axes);
        candidates.extend_from_slice(&b_axes);
        for a in &a_axes {
            for b in &b_axes {
                candidates.push(a.cross(b));
            }
        }

        for axis in candidates {
            // Near-parallel edge pairs produce degenerate cross products
            if axis.norm_squared() < 1e-12 {
                continue;
            }
            let distance = t.dot(&axis).abs();
            let radius = self.projected_radius(&a_axes, &axis)
                + other.projected_radius(&b_axes, &axis);
            if distance > radius {
                return true;
            }
        }
        false
    }

    /// Permissive overlap test: SAT says "not separated", or the centroid
    /// distance is below the sum of the half-extent norms. False positives
    /// only cost extra cost evaluations downstream.
    pub fn overlaps(&self, other: &Obb) -> bool {
        if !self.separated_from(other) {
            return true;
        }
        let centroid_distance = (other.center - self.center).norm();
        centroid_distance < self.half_extents.norm() + other.half_extents.norm()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::{Isometry3, Translation3};

    fn unit_aabb_at(x: f64) -> Aabb {
        Aabb::new(Point3::new(x, 0.0, 0.0), Point3::new(x + 1.0, 1.0, 1.0))
    }

    #[test]
    fn test_aabb_intersects() {
        let a = unit_aabb_at(0.0);
        assert!(a.intersects(&unit_aabb_at(0.5)));
        assert!(a.intersects(&unit_aabb_at(1.0))); // touching counts
        assert!(!a.intersects(&unit_aabb_at(1.01)));
    }

    #[test]
    fn test_aabb_from_points() {
        let aabb = Aabb::from_points([
            Point3::new(1.0, -1.0, 0.0),
            Point3::new(-2.0, 3.0, 0.5),
            Point3::new(0.0, 0.0, -4.0),
        ])
        .unwrap();
        assert_eq!(aabb.min, Point3::new(-2.0, -1.0, -4.0));
        assert_eq!(aabb.max, Point3::new(1.0, 3.0, 0.5));
        assert!(Aabb::from_points([]).is_none());
    }

    #[test]
    fn test_obb_corners_under_rotation() {
        let local = Aabb::new(Point3::new(-1.0, -1.0, -1.0), Point3::new(1.0, 1.0, 1.0));
        let pose = Isometry3::from_parts(
            Translation3::new(10.0, 0.0, 0.0),
            UnitQuaternion::from_euler_angles(0.0, 0.0, std::f64::consts::FRAC_PI_4),
        );
        let obb = Obb::from_local_aabb(&local, &pose);
        let aabb = obb.aabb();
        // A 45° yaw stretches the xy footprint to ±√2
        assert_relative_eq!(aabb.min.x, 10.0 - 2f64.sqrt(), epsilon = 1e-12);
        assert_relative_eq!(aabb.max.y, 2f64.sqrt(), epsilon = 1e-12);
        assert_relative_eq!(aabb.max.z, 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_sat_detects_separation() {
        let local = Aabb::new(Point3::new(-1.0, -1.0, -1.0), Point3::new(1.0, 1.0, 1.0));
        let a = Obb::from_local_aabb(&local, &Isometry3::identity());
        let b = Obb::from_local_aabb(
            &local,
            &Isometry3::translation(5.0, 0.0, 0.0),
        );
        assert!(a.separated_from(&b));

        let c = Obb::from_local_aabb(&local, &Isometry3::translation(1.5, 0.0, 0.0));
        assert!(!a.separated_from(&c));
    }

    #[test]
    fn test_sat_rotated_near_miss() {
        // Diagonal placement needs the cross-product axes to prove separation
        let local = Aabb::new(Point3::new(-0.5, -0.5, -0.5), Point3::new(0.5, 0.5, 0.5));
        let a = Obb::from_local_aabb(&local, &Isometry3::identity());
        let rotated = Isometry3::from_parts(
            Translation3::new(1.2, 1.2, 0.0),
            UnitQuaternion::from_euler_angles(0.0, 0.0, std::f64::consts::FRAC_PI_4),
        );
        let b = Obb::from_local_aabb(&local, &rotated);
        assert!(a.separated_from(&b));
    }

    #[test]
    fn test_overlaps_is_permissive() {
        let local = Aabb::new(Point3::new(-1.0, -1.0, -1.0), Point3::new(1.0, 1.0, 1.0));
        let a = Obb::from_local_aabb(&local, &Isometry3::identity());
        // Separated by SAT but centroids closer than the half-extent norms
        let b = Obb::from_local_aabb(&local, &Isometry3::translation(2.5, 0.0, 0.0));
        assert!(a.separated_from(&b));
        assert!(a.overlaps(&b));
        // Far apart fails both branches
        let c = Obb::from_local_aabb(&local, &Isometry3::translation(50.0, 0.0, 0.0));
        assert!(!a.overlaps(&c));
    }
}

//! # submap3d
//!
//! Globally consistent 3D mapping from a stream of depth observations
//! with drifting odometry. The trajectory is partitioned into short
//! time windows, each fused into a rigid TSDF sub-map; the collection
//! of sub-maps is periodically re-aligned by a pose-graph optimization
//! whose key factor is direct sub-map-to-sub-map registration against
//! the implicit surfaces stored in the voxel grids.
//!
//! ## Key pieces
//!
//! - **Block-sparse voxel grids** with a trilinear sampler whose `q·B`
//!   formulation also yields analytic derivatives
//! - **Sub-maps** carrying TSDF + ESDF grids, a relevant-voxel index and
//!   cached bounding geometry for overlap queries
//! - **Registration costs** sampling one sub-map's surface against
//!   another's distance field, with analytic or numeric Jacobians
//! - **A pose graph** jointly refining all sub-map poses in an
//!   (x, y, z, yaw) parameterization with pitch and roll locked
//!
//! ## Example
//!
//! ```rust
//! use nalgebra::Isometry3;
//! use submap3d::{SubmapCollection, SubmapConfig};
//!
//! let mut collection = SubmapCollection::new(SubmapConfig::default(), 20_000_000_000);
//! let id = collection.create_new_submap(Isometry3::identity(), 0);
//! assert_eq!(id, 0);
//! assert!(collection.submap(0).unwrap().is_constant());
//! ```

pub mod bounding;
pub mod collection;
pub mod container;
pub mod error;
pub mod esdf;
pub mod grid;
pub mod harness;
pub mod mapper;
pub mod pose_graph;
pub mod registration;
pub mod submap;
pub mod timeline;
pub mod transform;
pub mod voxel;

#[cfg(test)]
pub(crate) mod test_fixtures;

// Re-export commonly used types
pub use crate::collection::SubmapCollection;
pub use crate::error::{Error, Result};
pub use crate::pose_graph::{InformationMatrix, PoseGraph, SolverOptions};
pub use crate::registration::{RegistrationCost, RegistrationCostOptions};
pub use crate::submap::{Submap, SubmapConfig, SubmapId};
pub use crate::transform::Pose;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

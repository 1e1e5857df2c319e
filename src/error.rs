//! Error types for submap3d

use thiserror::Error;

/// Result type alias for submap3d operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for submap3d
#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    /// Sub-map id not present in the collection or pose graph
    #[error("Unknown sub-map: {0}")]
    UnknownSubmap(u32),

    /// A constraint between these two sub-maps already exists
    #[error("Duplicate constraint between sub-maps {0} and {1}")]
    DuplicateConstraint(u32, u32),

    /// Constraints must connect two distinct sub-maps
    #[error("Self-constraint on sub-map {0}")]
    SelfConstraint(u32),

    /// Voxel exists but has never been observed
    #[error("Voxel at global index ({0}, {1}, {2}) is unobserved")]
    NotObserved(i64, i64, i64),

    /// Point falls outside every allocated block
    #[error("Point ({0}, {1}, {2}) is outside the allocated grid")]
    OutOfBounds(f64, f64, f64),

    /// Solver stopped without satisfying its convergence criteria
    #[error("Solver did not converge: {0}")]
    NotConverged(String),

    /// Required configuration parameter is missing
    #[error("Required parameter missing: {0}")]
    ParameterMissing(String),

    /// Constraint information matrix is not positive definite
    #[error("Information matrix of constraint ({0}, {1}) is not positive definite")]
    InvalidInformationMatrix(u32, u32),

    /// Operation requires an active sub-map but none exists
    #[error("No active sub-map")]
    NoActiveSubmap,

    /// Registration against an ESDF that has not been generated yet
    #[error("ESDF of sub-map {0} has not been generated")]
    EsdfNotGenerated(u32),

    /// I/O error
    #[error("I/O error: {0}")]
    IoError(String),

    /// Container file is truncated, over-long or has an unknown version
    #[error("Corrupt container: {0}")]
    CorruptContainer(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::IoError(err.to_string())
    }
}

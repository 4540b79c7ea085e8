//! Geometric estimators used while growing a reconstruction.
//!
//! ## Triangulation
//!
//! We know the poses of two or more cameras and the bearing of the same feature in each of
//! them, and want the point where the rays meet. See [`triangulation::LinearEigenTriangulator`].
//!
//! ## Two-view geometry
//!
//! An [`EssentialMatrix`] is estimated from bearing matches with [`EightPoint`] and decomposed
//! into the relative pose of the second camera with [`EssentialMatrix::solve_pose`].
//!
//! ## Absolute pose
//!
//! [`LambdaTwist`] estimates a [`sfm_core::WorldToCamera`] from three bearing-to-world matches.
//! It is an [`Estimator`](sfm_core::sample_consensus::Estimator), so it is normally run inside
//! a consensus algorithm like ARRSAC.
//!
//! ## Similarity
//!
//! [`SimilarityEstimator`] aligns two point sets that differ by rotation, translation and scale.
//! This is how the frames of two reconstructions get related through their shared cameras.

mod eight_point;
mod essential;
mod p3p;
mod similarity;
pub mod triangulation;

pub use eight_point::*;
pub use essential::*;
pub use p3p::*;
pub use similarity::*;

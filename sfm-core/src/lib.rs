//! # SfM Core
//!
//! Common geometric types shared by every crate in the incremental reconstruction workspace.
//! This includes camera models, bearings, poses, keypoints, matches and the triangulation trait.
//!
//! ## Coordinate frames
//!
//! * An image point ([`KeyPoint`]) lives in pixel coordinates with `x` right and `y` down.
//! * A bearing is a [`nalgebra::UnitVector3`] pointing out of the optical center towards the
//!   light source of a keypoint. It is obtained from a keypoint with [`CameraModel::calibrate`].
//! * A [`CameraPoint`] is relative to the optical center of one camera with `z` forwards.
//! * A [`WorldPoint`] is in the frame of one reconstruction. Its scale is arbitrary.
//!
//! Poses map between these frames. A [`WorldToCamera`] is what a registered image stores.
//! A [`WorldToWorld`] is a similarity (rotation, translation and uniform scale) between the
//! frames of two reconstructions and is what model merging estimates.
//!
//! ## Triangulation
//!
//! Given two or more [`WorldToCamera`] poses and a bearing from each camera, a
//! [`TriangulatorObservations`] finds the world point where the rays (approximately) meet.
//!
//! ```text
//!                        @
//!                        @
//!               p--------b--------O
//!              /         @
//!             /          @
//!            /           @
//!           /            @
//!   @@@@@@@a@@@@@
//!         /
//!        /
//!       /
//!      O
//! ```

mod camera;
mod keypoint;
mod matches;
mod point;
mod pose;
mod triangulation;

pub use camera::*;
pub use keypoint::*;
pub use matches::*;
pub use nalgebra;
pub use point::*;
pub use pose::*;
pub use sample_consensus;
pub use triangulation::*;

//! Bundle adjustment for incremental reconstruction.
//!
//! A [`BundleProblem`] is an owned snapshot of cameras, poses, points and the observations that
//! tie them together. Any block can be held constant, and a single translation component of a
//! pose can be held constant to fix the scale of a problem. A [`BundleAdjuster`] refines the
//! problem and returns a [`BundleSolution`], or a [`BundleError`] if it could not improve it.

mod adjuster;
mod problem;

pub use adjuster::*;
pub use problem::*;

use nalgebra::Point3;
use sfm_core::{CameraIntrinsics, KeyPoint, WorldToCamera};

/// Refine the pose of a single image against fixed world points and a fixed camera.
///
/// This is used after absolute pose estimation, where only the inliers of the consensus
/// are passed in.
pub fn refine_pose<A>(
    adjuster: &A,
    camera: CameraBlock,
    pose: WorldToCamera,
    correspondences: impl IntoIterator<Item = (KeyPoint, Point3<f64>)>,
) -> Result<(WorldToCamera, CameraIntrinsics, BundleReport), BundleError>
where
    A: BundleAdjuster + ?Sized,
{
    let mut problem = BundleProblem::new();
    let camera = problem.add_camera(camera);
    let pose = problem.add_pose(PoseBlock {
        pose,
        camera,
        constant: false,
        constant_translation: None,
    });
    for (keypoint, point) in correspondences {
        let point = problem.add_point(PointBlock {
            point,
            constant: true,
        });
        problem.add_observation(ObservationBlock {
            pose,
            point,
            keypoint,
        });
    }
    let mut solution = adjuster.adjust(&problem)?;
    let camera = solution.cameras.swap_remove(camera);
    Ok((solution.poses[pose], camera, solution.report))
}

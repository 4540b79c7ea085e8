use nalgebra::{Point3, Vector2};
use sfm_core::{CameraIntrinsics, CameraPoint, KeyPoint, Pose, Projective, WorldPoint, WorldToCamera};
use thiserror::Error;

#[cfg(feature = "serde-serialize")]
use serde::{Deserialize, Serialize};

#[derive(Debug, Error, Clone, PartialEq)]
pub enum BundleError {
    #[error("bundle adjustment problem has no observations")]
    EmptyProblem,
    #[error("{kind} index {index} is out of range")]
    IndexOutOfRange { kind: &'static str, index: usize },
    #[error("optimizer did not converge: {0}")]
    NonConvergence(String),
    #[error("cost became non-finite")]
    NonFiniteCost,
}

/// A camera whose parameters take part in the problem.
#[derive(Debug, Clone, PartialEq)]
pub struct CameraBlock {
    pub intrinsics: CameraIntrinsics,
    /// Indices into the camera parameters that are free to change.
    /// An empty list holds the camera constant.
    pub free_params: Vec<usize>,
}

impl CameraBlock {
    pub fn constant(intrinsics: CameraIntrinsics) -> Self {
        Self {
            intrinsics,
            free_params: vec![],
        }
    }
}

/// The pose of one image.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PoseBlock {
    pub pose: WorldToCamera,
    /// Index into [`BundleProblem::cameras`].
    pub camera: usize,
    /// Hold the entire pose constant.
    pub constant: bool,
    /// Hold one component (`0..3`) of the translation constant.
    ///
    /// Fixing a translation component of a second camera removes the scale freedom of a problem
    /// in which one camera is already constant.
    pub constant_translation: Option<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PointBlock {
    pub point: Point3<f64>,
    pub constant: bool,
}

/// One keypoint of an image observing a point.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ObservationBlock {
    pub pose: usize,
    pub point: usize,
    pub keypoint: KeyPoint,
}

/// An owned snapshot of everything a bundle adjustment needs.
///
/// The mapper builds one of these from a subset of a reconstruction, hands it to a
/// [`BundleAdjuster`](crate::BundleAdjuster) and writes the [`BundleSolution`] back.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BundleProblem {
    pub cameras: Vec<CameraBlock>,
    pub poses: Vec<PoseBlock>,
    pub points: Vec<PointBlock>,
    pub observations: Vec<ObservationBlock>,
}

impl BundleProblem {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_camera(&mut self, block: CameraBlock) -> usize {
        self.cameras.push(block);
        self.cameras.len() - 1
    }

    pub fn add_pose(&mut self, block: PoseBlock) -> usize {
        self.poses.push(block);
        self.poses.len() - 1
    }

    pub fn add_point(&mut self, block: PointBlock) -> usize {
        self.points.push(block);
        self.points.len() - 1
    }

    pub fn add_observation(&mut self, block: ObservationBlock) {
        self.observations.push(block);
    }

    /// Check that every index refers to an existing block.
    pub fn validate(&self) -> Result<(), BundleError> {
        if self.observations.is_empty() {
            return Err(BundleError::EmptyProblem);
        }
        for camera in &self.cameras {
            if let Some(&index) = camera
                .free_params
                .iter()
                .find(|&&ix| ix >= camera.intrinsics.params().len())
            {
                return Err(BundleError::IndexOutOfRange {
                    kind: "camera parameter",
                    index,
                });
            }
        }
        for pose in &self.poses {
            if pose.camera >= self.cameras.len() {
                return Err(BundleError::IndexOutOfRange {
                    kind: "camera",
                    index: pose.camera,
                });
            }
            if let Some(index) = pose.constant_translation.filter(|&ix| ix >= 3) {
                return Err(BundleError::IndexOutOfRange {
                    kind: "translation component",
                    index,
                });
            }
        }
        for observation in &self.observations {
            if observation.pose >= self.poses.len() {
                return Err(BundleError::IndexOutOfRange {
                    kind: "pose",
                    index: observation.pose,
                });
            }
            if observation.point >= self.points.len() {
                return Err(BundleError::IndexOutOfRange {
                    kind: "point",
                    index: observation.point,
                });
            }
        }
        Ok(())
    }

    /// Half the sum of squared pixel residuals, as the optimizer reports it.
    pub fn cost(&self) -> f64 {
        0.5 * self
            .observations
            .iter()
            .map(|o| {
                let pose = self.poses[o.pose];
                let camera = &self.cameras[pose.camera].intrinsics;
                reprojection_residual(camera, pose.pose, self.points[o.point].point, o.keypoint)
                    .norm_squared()
            })
            .sum::<f64>()
    }
}

/// Points closer than this to the image plane are projected as if they were at this depth.
const MIN_DEPTH: f64 = 1e-6;
/// Residual in pixels reported for projections that are not finite.
const INVALID_RESIDUAL: f64 = 1e6;

/// Pixel residual of an observation, always finite.
///
/// Points behind the camera are clamped to the image plane so that the optimizer sees a large
/// but smooth residual instead of a hole in the cost function.
pub fn reprojection_residual(
    camera: &CameraIntrinsics,
    pose: WorldToCamera,
    point: Point3<f64>,
    keypoint: KeyPoint,
) -> Vector2<f64> {
    let p = pose.transform(WorldPoint::from_point(point));
    let p = p.point().unwrap_or_else(Point3::origin);
    let clamped = CameraPoint::from_point(Point3::new(p.x, p.y, p.z.max(MIN_DEPTH)));
    match camera.project(clamped) {
        Some(projected) => {
            let r = projected.0 - keypoint.0;
            if r.iter().all(|n| n.is_finite()) {
                r
            } else {
                Vector2::repeat(INVALID_RESIDUAL)
            }
        }
        None => Vector2::repeat(INVALID_RESIDUAL),
    }
}

/// Refined values, in the same order as the blocks of the [`BundleProblem`].
#[derive(Debug, Clone, PartialEq)]
pub struct BundleSolution {
    pub cameras: Vec<CameraIntrinsics>,
    pub poses: Vec<WorldToCamera>,
    pub points: Vec<Point3<f64>>,
    pub report: BundleReport,
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
pub struct BundleReport {
    pub initial_cost: f64,
    pub final_cost: f64,
    pub evaluations: usize,
    /// Whether the solver reported convergence rather than running out of patience.
    pub converged: bool,
    pub termination: String,
}

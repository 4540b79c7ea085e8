use crate::{CameraPoint, CameraToCamera, Pose, WorldPoint, WorldToCamera};
use nalgebra::UnitVector3;

/// This trait is for algorithms which allow you to triangulate a point from two or more observances.
/// Each observance is a [`WorldToCamera`] and a bearing out of that camera.
pub trait TriangulatorObservations {
    fn triangulate_observations(
        &self,
        pairs: impl Iterator<Item = (WorldToCamera, UnitVector3<f64>)> + Clone,
    ) -> Option<WorldPoint>;
}

/// This trait allows you to take one relative pose from camera `A` to camera `B` and two bearings `a` and `b` from
/// their respective cameras to triangulate a point from the perspective of camera `A`.
pub trait TriangulatorRelative {
    fn triangulate_relative(
        &self,
        relative_pose: CameraToCamera,
        a: UnitVector3<f64>,
        b: UnitVector3<f64>,
    ) -> Option<CameraPoint>;
}

impl<T> TriangulatorRelative for T
where
    T: TriangulatorObservations,
{
    fn triangulate_relative(
        &self,
        CameraToCamera(pose): CameraToCamera,
        a: UnitVector3<f64>,
        b: UnitVector3<f64>,
    ) -> Option<CameraPoint> {
        use core::iter::once;

        // Camera `A` is the world, so the relative pose is the world pose of camera `B`.
        self.triangulate_observations(
            once((WorldToCamera::identity(), a)).chain(once((WorldToCamera(pose), b))),
        )
        .map(|p| CameraPoint(p.0))
    }
}

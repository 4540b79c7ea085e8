use crate::{CameraPoint, FeatureWorldMatch, Projective, WorldPoint};
use derive_more::{AsMut, AsRef, From, Into};
use nalgebra::{
    IsometryMatrix3, Matrix4, Point3, Rotation3, SimilarityMatrix3, Translation3, Vector3,
    Vector6,
};
use sample_consensus::Model;

#[cfg(feature = "serde-serialize")]
use serde::{Deserialize, Serialize};

/// This trait is implemented by all the rigid poses in this library:
///
/// * [`CameraToWorld`] - Transforms [`CameraPoint`] into [`WorldPoint`]
/// * [`WorldToCamera`] - Transforms [`WorldPoint`] into [`CameraPoint`]
/// * [`CameraToCamera`] - Transforms [`CameraPoint`] from one camera into [`CameraPoint`] for another camera
pub trait Pose: From<IsometryMatrix3<f64>> + Clone + Copy {
    type InputPoint: Projective;
    type OutputPoint: Projective;
    type Inverse: Pose;

    /// Retrieve the isometry.
    fn isometry(self) -> IsometryMatrix3<f64>;

    /// Creates a pose with no change in position or orientation.
    fn identity() -> Self {
        IsometryMatrix3::identity().into()
    }

    /// Takes the inverse of the pose.
    fn inverse(self) -> Self::Inverse {
        self.isometry().inverse().into()
    }

    /// Applies a scale factor to the pose (scales the translation component)
    #[must_use]
    fn scale(self, scale: f64) -> Self {
        let mut isometry = self.isometry();
        isometry.translation.vector *= scale;
        isometry.into()
    }

    /// Create the pose from rotation and translation.
    fn from_parts(translation: Vector3<f64>, rotation: Rotation3<f64>) -> Self {
        IsometryMatrix3::from_parts(translation.into(), rotation).into()
    }

    /// Retrieve the homogeneous matrix.
    fn homogeneous(self) -> Matrix4<f64> {
        self.isometry().to_homogeneous()
    }

    /// Retrieve the se(3) representation of the pose.
    ///
    /// The translation comes before the scaled rotation axis.
    fn se3(self) -> Vector6<f64> {
        let isometry = self.isometry();
        let t = isometry.translation.vector;
        let r = isometry.rotation.scaled_axis();
        Vector6::new(t.x, t.y, t.z, r.x, r.y, r.z)
    }

    /// Create the pose from its se(3) representation. See [`Pose::se3`].
    fn from_se3(se3: Vector6<f64>) -> Self {
        let translation = se3.xyz();
        let rotation = Rotation3::new(Vector3::new(se3[3], se3[4], se3[5]));
        Self::from_parts(translation, rotation)
    }

    /// Transform the given point to an output point.
    fn transform(self, input: Self::InputPoint) -> Self::OutputPoint {
        (self.isometry().to_homogeneous() * input.homogeneous()).into()
    }
}

/// The pose of the world relative to the camera.
/// This maps [`WorldPoint`] into [`CameraPoint`], changing an absolute position into
/// a vector relative to the camera.
#[derive(Debug, Clone, Copy, PartialEq, AsMut, AsRef, From, Into)]
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
pub struct WorldToCamera(pub IsometryMatrix3<f64>);

impl Pose for WorldToCamera {
    type InputPoint = WorldPoint;
    type OutputPoint = CameraPoint;
    type Inverse = CameraToWorld;

    #[inline(always)]
    fn isometry(self) -> IsometryMatrix3<f64> {
        self.into()
    }
}

impl WorldToCamera {
    /// The optical center of the camera in world coordinates.
    pub fn center(self) -> Point3<f64> {
        self.inverse().isometry() * Point3::origin()
    }

    /// The direction the camera is looking in world coordinates.
    pub fn viewing_direction(self) -> Vector3<f64> {
        self.0.rotation.inverse() * Vector3::z()
    }
}

impl Model<FeatureWorldMatch> for WorldToCamera {
    #[inline(always)]
    fn residual(&self, data: &FeatureWorldMatch) -> f64 {
        let &FeatureWorldMatch(keypoint_bearing, world) = data;

        let observation_bearing = self.transform(world).bearing();
        1.0 - keypoint_bearing.dot(&observation_bearing)
    }
}

/// The pose of the camera relative to the world.
/// This transforms camera points (with depth as `z`) into world coordinates.
#[derive(Debug, Clone, Copy, PartialEq, AsMut, AsRef, From, Into)]
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
pub struct CameraToWorld(pub IsometryMatrix3<f64>);

impl Pose for CameraToWorld {
    type InputPoint = CameraPoint;
    type OutputPoint = WorldPoint;
    type Inverse = WorldToCamera;

    #[inline(always)]
    fn isometry(self) -> IsometryMatrix3<f64> {
        self.into()
    }
}

/// A relative pose that transforms the [`CameraPoint`] of camera `A` into the corresponding
/// [`CameraPoint`] of camera `B`.
///
/// Camera space for a given camera is defined as thus:
///
/// * Origin is the optical center
/// * Positive z axis is forwards
/// * Positive y axis is down
/// * Positive x axis is right
#[derive(Debug, Clone, Copy, PartialEq, AsMut, AsRef, From, Into)]
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
pub struct CameraToCamera(pub IsometryMatrix3<f64>);

impl Pose for CameraToCamera {
    type InputPoint = CameraPoint;
    type OutputPoint = CameraPoint;
    type Inverse = CameraToCamera;

    #[inline(always)]
    fn isometry(self) -> IsometryMatrix3<f64> {
        self.into()
    }
}

impl CameraToCamera {
    /// The relative pose from camera `a` to camera `b` given their absolute poses.
    pub fn from_world_poses(a: WorldToCamera, b: WorldToCamera) -> Self {
        (b.isometry() * a.isometry().inverse()).into()
    }
}

/// A similarity that maps the [`WorldPoint`] of one reconstruction into the world frame of
/// another reconstruction: `p' = s * R * p + t`.
///
/// Unlike the rigid poses, this has a scale, because independently grown reconstructions
/// do not share a unit of distance.
#[derive(Debug, Clone, Copy, PartialEq, AsMut, AsRef, From, Into)]
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
pub struct WorldToWorld(pub SimilarityMatrix3<f64>);

impl WorldToWorld {
    pub fn identity() -> Self {
        Self(SimilarityMatrix3::identity())
    }

    /// Build from rotation, translation and scale.
    pub fn from_parts(translation: Vector3<f64>, rotation: Rotation3<f64>, scale: f64) -> Self {
        Self(SimilarityMatrix3::from_parts(
            Translation3::from(translation),
            rotation,
            scale,
        ))
    }

    pub fn scale(self) -> f64 {
        self.0.scaling()
    }

    pub fn rotation(self) -> Rotation3<f64> {
        self.0.isometry.rotation
    }

    pub fn translation(self) -> Vector3<f64> {
        self.0.isometry.translation.vector
    }

    #[must_use]
    pub fn inverse(self) -> Self {
        Self(self.0.inverse())
    }

    /// Transform a euclidean point.
    pub fn transform_point(self, point: &Point3<f64>) -> Point3<f64> {
        self.0 * point
    }

    /// Transform a world point. Points at infinity only get rotated.
    pub fn transform(self, point: WorldPoint) -> WorldPoint {
        WorldPoint(self.0.to_homogeneous() * point.homogeneous())
    }

    /// Re-express the pose of a camera in the source frame as a pose in the destination frame.
    ///
    /// Camera coordinates get multiplied by the scale, which keeps every projection unchanged.
    pub fn transform_pose(self, pose: WorldToCamera) -> WorldToCamera {
        let rotation = pose.0.rotation * self.rotation().inverse();
        let translation =
            pose.0.translation.vector * self.scale() - rotation * self.translation();
        WorldToCamera::from_parts(translation, rotation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn center_is_mapped_to_origin() {
        let pose = WorldToCamera::from_parts(
            Vector3::new(0.3, -0.2, 1.5),
            Rotation3::from_euler_angles(0.1, -0.4, 0.2),
        );
        let center = WorldPoint::from_point(pose.center());
        let in_camera = pose.transform(center).point().unwrap();
        assert_relative_eq!(in_camera.coords, Vector3::zeros(), epsilon = 1e-12);
    }

    #[test]
    fn se3_round_trip_preserves_pose() {
        let pose = WorldToCamera::from_parts(
            Vector3::new(-1.0, 2.0, 0.5),
            Rotation3::from_euler_angles(0.7, 0.1, -0.3),
        );
        let back = WorldToCamera::from_se3(pose.se3());
        assert_relative_eq!(back.0, pose.0, epsilon = 1e-12);
    }

    #[test]
    fn similarity_keeps_projections() {
        let pose = WorldToCamera::from_parts(
            Vector3::new(0.2, 0.1, 3.0),
            Rotation3::from_euler_angles(0.05, 0.2, -0.1),
        );
        let sim = WorldToWorld::from_parts(
            Vector3::new(4.0, -1.0, 2.0),
            Rotation3::from_euler_angles(-0.3, 0.6, 1.1),
            2.5,
        );
        let point = WorldPoint::from_point(Point3::new(0.4, -0.3, 1.0));
        let before = pose.transform(point).bearing();
        let after = sim.transform_pose(pose).transform(sim.transform(point)).bearing();
        assert_relative_eq!(before.into_inner(), after.into_inner(), epsilon = 1e-10);
        assert_relative_eq!(
            sim.transform_pose(pose).center(),
            sim.transform_point(&pose.center()),
            epsilon = 1e-10
        );
    }
}

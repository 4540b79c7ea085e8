use sfm_core::{
    nalgebra::{zero, Matrix3x4, Matrix4, Point3, UnitVector3},
    Pose, Projective, TriangulatorObservations, WorldPoint, WorldToCamera,
};

/// Multi-view triangulation by the Linear-Eigen method of Hartley and Sturm, from the paper
/// ["Triangulation"](https://users.cecs.anu.edu.au/~hartley/Papers/triangulation/triangulation.pdf).
///
/// Every observation contributes the rows of `(I - b * b^T) * P`, where `P` is the 3x4 pose
/// matrix and `b` the bearing. The point is the eigenvector of the accumulated 4x4 normal matrix
/// with the smallest eigenvalue. This is fast and linear, so it is used both to create tracks
/// and to re-estimate them after observations change. The result is rejected if it lies behind
/// any of the observing cameras.
///
/// ```
/// use sfm_core::nalgebra::{Vector3, Point3, Rotation3};
/// use sfm_core::{TriangulatorRelative, CameraToCamera, CameraPoint, Pose, Projective};
/// use sfm_geom::triangulation::LinearEigenTriangulator;
///
/// let point = CameraPoint::from_point(Point3::new(0.3, 0.1, 2.0));
/// let pose = CameraToCamera::from_parts(Vector3::new(0.1, 0.1, 0.1), Rotation3::new(Vector3::new(0.1, 0.1, 0.1)));
/// let bearing_a = point.bearing();
/// let bearing_b = pose.transform(point).bearing();
/// let triangulated = LinearEigenTriangulator::new().triangulate_relative(pose, bearing_a, bearing_b).unwrap();
/// let distance = (point.point().unwrap().coords - triangulated.point().unwrap().coords).norm();
/// assert!(distance < 1e-6);
/// ```
#[derive(Copy, Clone, Debug, PartialEq, PartialOrd)]
pub struct LinearEigenTriangulator {
    epsilon: f64,
    max_iterations: usize,
}

impl LinearEigenTriangulator {
    /// Same as calling [`Default::default`].
    pub fn new() -> Self {
        Default::default()
    }

    /// Set the epsilon used in the symmetric eigen solver.
    ///
    /// Default is `1e-12`.
    #[must_use]
    pub fn epsilon(self, epsilon: f64) -> Self {
        Self { epsilon, ..self }
    }

    /// Set the maximum number of iterations for the symmetric eigen solver.
    ///
    /// Default is `1000`.
    #[must_use]
    pub fn max_iterations(self, max_iterations: usize) -> Self {
        Self {
            max_iterations,
            ..self
        }
    }
}

impl Default for LinearEigenTriangulator {
    fn default() -> Self {
        Self {
            epsilon: 1e-12,
            max_iterations: 1000,
        }
    }
}

impl TriangulatorObservations for LinearEigenTriangulator {
    fn triangulate_observations(
        &self,
        pairs: impl Iterator<Item = (WorldToCamera, UnitVector3<f64>)> + Clone,
    ) -> Option<WorldPoint> {
        if pairs.clone().count() < 2 {
            return None;
        }

        let mut normal: Matrix4<f64> = zero();
        for (pose, bearing) in pairs.clone() {
            let bearing = bearing.into_inner();
            let rot = pose.0.rotation.matrix();
            let projection = Matrix3x4::<f64>::from_columns(&[
                rot.column(0),
                rot.column(1),
                rot.column(2),
                pose.0.translation.vector.column(0),
            ]);
            let rejected = projection - bearing * (bearing.transpose() * projection);
            normal += rejected.transpose() * rejected;
        }

        let se = normal.try_symmetric_eigen(self.epsilon, self.max_iterations)?;

        se.eigenvalues
            .iter()
            .enumerate()
            .min_by_key(|&(_, &n)| float_ord::FloatOrd(n))
            .map(|(ix, _)| WorldPoint(se.eigenvectors.column(ix).into_owned()))
            .filter(|point| point.homogeneous().iter().all(|n| n.is_finite()))
            // The eigenvector has an arbitrary sign. A positive `w` makes the bearings meaningful.
            .map(|point| {
                if point.0.w < 0.0 {
                    WorldPoint(-point.0)
                } else {
                    point
                }
            })
            .filter(|&point| {
                pairs
                    .clone()
                    .all(|(pose, bearing)| pose.transform(point).bearing().dot(&bearing) > 0.0)
            })
    }
}

/// The angle in radians at `point` between the rays towards two optical centers.
pub fn triangulation_angle(center_a: &Point3<f64>, center_b: &Point3<f64>, point: &Point3<f64>) -> f64 {
    let ray_a = center_a - point;
    let ray_b = center_b - point;
    let denominator = ray_a.norm() * ray_b.norm();
    if denominator <= f64::EPSILON {
        return 0.0;
    }
    (ray_a.dot(&ray_b) / denominator).clamp(-1.0, 1.0).acos()
}

/// The largest pairwise [`triangulation_angle`] among a set of optical centers.
pub fn max_triangulation_angle<'a>(
    centers: impl Iterator<Item = &'a Point3<f64>> + Clone,
    point: &Point3<f64>,
) -> f64 {
    centers
        .clone()
        .enumerate()
        .flat_map(|(ix, a)| {
            centers
                .clone()
                .skip(ix + 1)
                .map(move |b| triangulation_angle(a, b, point))
        })
        .fold(0.0, f64::max)
}

/// Whether the point is strictly in front of the camera.
pub fn has_positive_depth(pose: WorldToCamera, point: WorldPoint) -> bool {
    pose.transform(point)
        .depth()
        .map_or(false, |depth| depth > f64::EPSILON)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use sfm_core::nalgebra::{Rotation3, Vector3};

    #[test]
    fn three_views_recover_point() {
        let point = WorldPoint::from_point(Point3::new(0.2, -0.4, 5.0));
        let poses = [
            WorldToCamera::identity(),
            WorldToCamera::from_parts(Vector3::new(-1.0, 0.0, 0.0), Rotation3::identity()),
            WorldToCamera::from_parts(
                Vector3::new(0.5, 0.3, 0.2),
                Rotation3::from_euler_angles(0.0, 0.1, 0.0),
            ),
        ];
        let observations = poses
            .iter()
            .map(|&pose| (pose, pose.transform(point).bearing()))
            .collect::<Vec<_>>();
        let triangulated = LinearEigenTriangulator::new()
            .triangulate_observations(observations.iter().copied())
            .unwrap();
        assert_relative_eq!(
            triangulated.point().unwrap(),
            point.point().unwrap(),
            epsilon = 1e-8
        );
    }

    #[test]
    fn single_observation_is_rejected() {
        let bearing = UnitVector3::new_normalize(Vector3::new(0.0, 0.0, 1.0));
        assert!(LinearEigenTriangulator::new()
            .triangulate_observations(core::iter::once((WorldToCamera::identity(), bearing)))
            .is_none());
    }

    #[test]
    fn angle_of_symmetric_rays() {
        let a = Point3::new(-1.0, 0.0, 0.0);
        let b = Point3::new(1.0, 0.0, 0.0);
        let p = Point3::new(0.0, 0.0, 1.0);
        assert_relative_eq!(
            triangulation_angle(&a, &b, &p),
            core::f64::consts::FRAC_PI_2,
            epsilon = 1e-12
        );
        assert_relative_eq!(
            max_triangulation_angle([a, b, p].iter(), &Point3::new(0.0, 0.0, 1e6)),
            triangulation_angle(&a, &b, &Point3::new(0.0, 0.0, 1e6)),
            epsilon = 1e-12
        );
    }
}

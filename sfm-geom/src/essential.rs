use derive_more::{AsMut, AsRef, Deref, DerefMut, From, Into};
use float_ord::FloatOrd;
use sfm_core::{
    nalgebra::{Matrix3, Rotation3, UnitVector3, Vector3, SVD},
    sample_consensus::Model,
    CameraToCamera, FeatureMatch, Pose, TriangulatorRelative,
};

/// An essential matrix `E` satisfying the epipolar constraint
///
/// ```text
/// transpose(x') * E * x = 0
/// ```
///
/// where `x` and `x'` are the homogeneous normalized image coordinates of the same feature in
/// the first and second camera. `E = [t]x * R` for the relative pose `(R, t)` from the first
/// camera to the second, so it only determines the translation up to scale.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, AsMut, AsRef, Deref, DerefMut, From, Into)]
pub struct EssentialMatrix(pub Matrix3<f64>);

impl EssentialMatrix {
    /// Project onto the closest essential matrix in Frobenius norm.
    ///
    /// The two largest singular values are averaged and the smallest is forced to zero.
    pub fn recondition(self, epsilon: f64, max_iterations: usize) -> Option<Self> {
        let mut svd = self.try_svd(true, true, epsilon, max_iterations)?;
        let mean = (svd.singular_values[0] + svd.singular_values[1]) / 2.0;
        svd.singular_values[0] = mean;
        svd.singular_values[1] = mean;
        svd.singular_values[2] = 0.0;
        svd.recompose().ok().map(Self)
    }

    /// The four relative poses that produce this essential matrix.
    ///
    /// Translations are unit length. Only one of the poses puts the observed points in front of
    /// both cameras, see [`EssentialMatrix::solve_pose`].
    ///
    /// ```
    /// use sfm_core::{CameraToCamera, nalgebra::{IsometryMatrix3, Rotation3, Vector3}};
    /// use sfm_geom::EssentialMatrix;
    /// let pose = CameraToCamera(IsometryMatrix3::from_parts(
    ///     Vector3::new(-0.8, 0.4, 0.5).into(),
    ///     Rotation3::from_euler_angles(0.2, 0.3, 0.4),
    /// ));
    /// let poses = EssentialMatrix::from(pose).possible_unscaled_poses(1e-9, 100).unwrap();
    /// assert!(poses.iter().any(|candidate| {
    ///     let angle = candidate.0.rotation.rotation_to(&pose.0.rotation).angle();
    ///     let direction = candidate.0.translation.vector.normalize()
    ///         .dot(&pose.0.translation.vector.normalize());
    ///     angle < 1e-6 && 1.0 - direction < 1e-6
    /// }));
    /// ```
    pub fn possible_unscaled_poses(
        &self,
        epsilon: f64,
        max_iterations: usize,
    ) -> Option<[CameraToCamera; 4]> {
        let (rot_a, rot_b, t) = self.possible_rotations_unscaled_translation(epsilon, max_iterations)?;
        Some([
            CameraToCamera::from_parts(t, rot_a),
            CameraToCamera::from_parts(t, rot_b),
            CameraToCamera::from_parts(-t, rot_a),
            CameraToCamera::from_parts(-t, rot_b),
        ])
    }

    fn possible_rotations_unscaled_translation(
        &self,
        epsilon: f64,
        max_iterations: usize,
    ) -> Option<(Rotation3<f64>, Rotation3<f64>, Vector3<f64>)> {
        #[rustfmt::skip]
        let w = Matrix3::new(
            0.0, -1.0, 0.0,
            1.0,  0.0, 0.0,
            0.0,  0.0, 1.0,
        );

        let svd = SVD::try_new(self.0, true, true, epsilon, max_iterations)?;
        let mut u = svd.u?;
        let mut v_t = svd.v_t?;
        // The singular vectors of the null singular value have an arbitrary sign.
        if u.determinant() < 0.0 {
            u.column_mut(2).neg_mut();
        }
        if v_t.determinant() < 0.0 {
            v_t.row_mut(2).neg_mut();
        }

        Some((
            Rotation3::from_matrix_unchecked(u * w * v_t),
            Rotation3::from_matrix_unchecked(u * w.transpose() * v_t),
            u.column(2).into_owned(),
        ))
    }

    /// Pick the pose among [`EssentialMatrix::possible_unscaled_poses`] which puts the most
    /// matches in front of both cameras.
    ///
    /// Returns the pose and the number of matches that passed the chirality test.
    pub fn solve_pose<T>(
        &self,
        triangulator: &T,
        matches: impl Iterator<Item = FeatureMatch> + Clone,
        epsilon: f64,
        max_iterations: usize,
    ) -> Option<(CameraToCamera, usize)>
    where
        T: TriangulatorRelative,
    {
        let poses = self.possible_unscaled_poses(epsilon, max_iterations)?;
        poses
            .iter()
            .map(|&pose| (pose, chirality_pass_count(triangulator, pose, matches.clone())))
            .max_by_key(|&(_, count)| count)
            .filter(|&(_, count)| count > 0)
    }
}

/// Count the matches which triangulate in front of both cameras.
pub fn chirality_pass_count<T>(
    triangulator: &T,
    pose: CameraToCamera,
    matches: impl Iterator<Item = FeatureMatch>,
) -> usize
where
    T: TriangulatorRelative,
{
    matches
        .filter(|&FeatureMatch(a, b)| {
            triangulator
                .triangulate_relative(pose, a, b)
                .and_then(|point_a| {
                    let depth_a = point_a.depth()?;
                    let depth_b = pose.transform(point_a).depth()?;
                    Some(depth_a > 0.0 && depth_b > 0.0)
                })
                .unwrap_or(false)
        })
        .count()
}

impl From<CameraToCamera> for EssentialMatrix {
    fn from(pose: CameraToCamera) -> Self {
        Self(pose.0.translation.vector.cross_matrix() * *pose.0.rotation.matrix())
    }
}

/// The residual is the Sampson distance on the normalized image plane.
///
/// Matches with a bearing pointing sideways or backwards get an infinite residual.
impl Model<FeatureMatch> for EssentialMatrix {
    fn residual(&self, data: &FeatureMatch) -> f64 {
        let &FeatureMatch(a, b) = data;
        let (a, b) = match (normalized(a), normalized(b)) {
            (Some(a), Some(b)) => (a, b),
            _ => return f64::INFINITY,
        };
        let ea = self.0 * a;
        let etb = self.0.transpose() * b;
        let numerator = b.dot(&ea);
        let denominator = ea.x * ea.x + ea.y * ea.y + etb.x * etb.x + etb.y * etb.y;
        if denominator <= f64::EPSILON {
            return f64::INFINITY;
        }
        (numerator * numerator / denominator).sqrt()
    }
}

fn normalized(bearing: UnitVector3<f64>) -> Option<Vector3<f64>> {
    (bearing.z > f64::EPSILON).then(|| bearing.into_inner() / bearing.z)
}

/// The largest residual among the matches, useful for debug logging.
pub fn max_residual(
    essential: &EssentialMatrix,
    matches: impl Iterator<Item = FeatureMatch>,
) -> Option<f64> {
    matches
        .map(|m| FloatOrd(essential.residual(&m)))
        .max()
        .map(|FloatOrd(r)| r)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::triangulation::LinearEigenTriangulator;
    use approx::assert_relative_eq;
    use sfm_core::{nalgebra::Point3, CameraPoint, Projective};

    fn scene() -> (CameraToCamera, Vec<FeatureMatch>) {
        let pose = CameraToCamera::from_parts(
            Vector3::new(-1.0, 0.1, 0.05),
            Rotation3::from_euler_angles(0.02, -0.1, 0.03),
        );
        let matches = (0..20)
            .map(|i| {
                let i = f64::from(i);
                let point = CameraPoint::from_point(Point3::new(
                    (i * 0.37).sin() * 2.0,
                    (i * 0.61).cos(),
                    4.0 + (i * 0.23).sin(),
                ));
                FeatureMatch(point.bearing(), pose.transform(point).bearing())
            })
            .collect();
        (pose, matches)
    }

    #[test]
    fn true_pose_has_zero_residual() {
        let (pose, matches) = scene();
        let essential = EssentialMatrix::from(pose);
        for m in &matches {
            assert!(essential.residual(m) < 1e-12);
        }
    }

    #[test]
    fn solve_pose_picks_true_pose() {
        let (pose, matches) = scene();
        let essential = EssentialMatrix::from(pose);
        let (solved, count) = essential
            .solve_pose(
                &LinearEigenTriangulator::new(),
                matches.iter().copied(),
                1e-12,
                1000,
            )
            .unwrap();
        assert_eq!(count, matches.len());
        assert!(solved.0.rotation.rotation_to(&pose.0.rotation).angle() < 1e-6);
        assert_relative_eq!(
            solved.0.translation.vector,
            pose.0.translation.vector.normalize(),
            epsilon = 1e-6
        );
    }

    #[test]
    fn recondition_zeros_smallest_singular_value() {
        let noisy = EssentialMatrix(Matrix3::new(0.1, 0.5, -0.2, 0.4, 0.05, 0.9, -0.3, 0.7, 0.2));
        let fixed = noisy.recondition(1e-12, 1000).unwrap();
        let sv = fixed.0.singular_values();
        let mut sorted = [sv[0], sv[1], sv[2]];
        sorted.sort_by_key(|&s| FloatOrd(s));
        assert!(sorted[0].abs() < 1e-9);
        assert_relative_eq!(sorted[1], sorted[2], epsilon = 1e-9);
    }
}

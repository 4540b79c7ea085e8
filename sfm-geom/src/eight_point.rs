use crate::EssentialMatrix;
use float_ord::FloatOrd;
use sfm_core::{
    nalgebra::{Matrix3, SMatrix, SVector},
    sample_consensus::Estimator,
    FeatureMatch,
};

/// Performs the
/// [eight-point algorithm](https://en.wikipedia.org/wiki/Eight-point_algorithm)
/// on bearing matches.
///
/// Any number of matches from eight upwards is accepted. Each match contributes one row of the
/// linear system `kron(x', x) . vec(E) = 0`, and the solution is the eigenvector of the normal
/// matrix with the smallest eigenvalue, reconditioned into a proper essential matrix.
#[derive(Copy, Clone, Debug)]
pub struct EightPoint {
    pub epsilon: f64,
    pub iterations: usize,
}

impl EightPoint {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn from_matches<I>(&self, data: I) -> Option<EssentialMatrix>
    where
        I: Iterator<Item = FeatureMatch>,
    {
        let mut normal = SMatrix::<f64, 9, 9>::zeros();
        let mut count = 0;
        for FeatureMatch(a, b) in data {
            if a.z <= f64::EPSILON || b.z <= f64::EPSILON {
                continue;
            }
            let a = a.into_inner() / a.z;
            let b = b.into_inner() / b.z;
            let row = SVector::<f64, 9>::from_fn(|ix, _| b[ix / 3] * a[ix % 3]);
            normal += row * row.transpose();
            count += 1;
        }
        if count < 8 {
            return None;
        }

        let eigens = normal.try_symmetric_eigen(self.epsilon, self.iterations)?;
        let eigenvector = eigens
            .eigenvalues
            .iter()
            .enumerate()
            .min_by_key(|&(_, &n)| FloatOrd(n))
            .map(|(ix, _)| eigens.eigenvectors.column(ix).into_owned())?;
        EssentialMatrix(Matrix3::from_row_slice(eigenvector.as_slice()))
            .recondition(self.epsilon, self.iterations)
    }
}

impl Default for EightPoint {
    fn default() -> Self {
        Self {
            epsilon: 1e-12,
            iterations: 1000,
        }
    }
}

impl Estimator<FeatureMatch> for EightPoint {
    type Model = EssentialMatrix;
    type ModelIter = Option<EssentialMatrix>;
    const MIN_SAMPLES: usize = 8;

    fn estimate<I>(&self, data: I) -> Self::ModelIter
    where
        I: Iterator<Item = FeatureMatch> + Clone,
    {
        self.from_matches(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sfm_core::{
        nalgebra::{Point3, Rotation3, Vector3},
        sample_consensus::Model,
        CameraPoint, CameraToCamera, Pose, Projective,
    };

    #[test]
    fn recovers_essential_from_exact_matches() {
        let pose = CameraToCamera::from_parts(
            Vector3::new(0.3, -0.2, 0.1),
            Rotation3::from_euler_angles(0.1, 0.05, -0.2),
        );
        let matches = (0..12)
            .map(|i| {
                let i = f64::from(i);
                let point = CameraPoint::from_point(Point3::new(
                    (i * 1.3).sin(),
                    (i * 0.7).cos(),
                    3.0 + (i * 0.9).sin(),
                ));
                FeatureMatch(point.bearing(), pose.transform(point).bearing())
            })
            .collect::<Vec<_>>();
        let essential = EightPoint::new()
            .from_matches(matches.iter().copied())
            .unwrap();
        for m in &matches {
            assert!(essential.residual(m) < 1e-8);
        }
    }

    #[test]
    fn too_few_matches() {
        let bearing = CameraPoint::from_point(Point3::new(0.0, 0.0, 1.0)).bearing();
        let matches = vec![FeatureMatch(bearing, bearing); 7];
        assert!(EightPoint::new()
            .from_matches(matches.into_iter())
            .is_none());
    }
}

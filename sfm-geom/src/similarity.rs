use float_ord::FloatOrd;
use log::debug;
use sfm_core::{
    nalgebra::{Matrix3, Point3, Rotation3, Vector3},
    WorldToWorld,
};

/// Least-squares alignment of two point sets related by rotation, translation and uniform scale,
/// following Umeyama's closed form.
///
/// [`SimilarityEstimator::estimate_robust`] wraps the closed form in iterative outlier rejection:
/// after each fit, correspondences whose residual exceeds `outlier_factor` times the median
/// residual are dropped and the fit is repeated on the rest.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct SimilarityEstimator {
    outlier_factor: f64,
    max_iterations: usize,
    min_inlier_ratio: f64,
    collinear_ratio: f64,
}

impl SimilarityEstimator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Residuals above this multiple of the median residual are outliers.
    ///
    /// Default is `3.0`.
    #[must_use]
    pub fn outlier_factor(self, outlier_factor: f64) -> Self {
        Self {
            outlier_factor,
            ..self
        }
    }

    /// Default is `10`.
    #[must_use]
    pub fn max_iterations(self, max_iterations: usize) -> Self {
        Self {
            max_iterations,
            ..self
        }
    }

    /// The fraction of correspondences that must survive outlier rejection.
    ///
    /// Default is `0.5`.
    #[must_use]
    pub fn min_inlier_ratio(self, min_inlier_ratio: f64) -> Self {
        Self {
            min_inlier_ratio,
            ..self
        }
    }

    /// Point sets whose second principal extent is below this fraction of the first are
    /// treated as collinear.
    ///
    /// Default is `1e-3`.
    #[must_use]
    pub fn collinear_ratio(self, collinear_ratio: f64) -> Self {
        Self {
            collinear_ratio,
            ..self
        }
    }

    /// Check whether the points are (nearly) on one line, which leaves the rotation about
    /// that line unconstrained.
    pub fn is_degenerate(&self, points: &[Point3<f64>]) -> bool {
        if points.len() < 3 {
            return true;
        }
        let centroid = centroid(points);
        let scatter = points
            .iter()
            .map(|p| {
                let d = p - centroid;
                d * d.transpose()
            })
            .fold(Matrix3::zeros(), |acc, m| acc + m);
        let mut sv = scatter.singular_values();
        sv.as_mut_slice()
            .sort_unstable_by_key(|&s| FloatOrd(-s));
        // Singular values of the scatter are squared extents.
        sv[0] <= f64::EPSILON || (sv[1] / sv[0]).sqrt() < self.collinear_ratio
    }

    /// Closed-form fit of `dst = s * R * src + t`.
    pub fn estimate(&self, src: &[Point3<f64>], dst: &[Point3<f64>]) -> Option<WorldToWorld> {
        if src.len() != dst.len() || src.len() < 3 {
            return None;
        }
        let n = src.len() as f64;
        let src_centroid = centroid(src);
        let dst_centroid = centroid(dst);

        let mut covariance = Matrix3::zeros();
        let mut src_variance = 0.0;
        for (s, d) in src.iter().zip(dst) {
            let s = s - src_centroid;
            let d = d - dst_centroid;
            covariance += d * s.transpose();
            src_variance += s.norm_squared();
        }
        covariance /= n;
        src_variance /= n;
        if src_variance <= f64::EPSILON {
            return None;
        }

        let svd = covariance.svd(true, true);
        let u = svd.u?;
        let v_t = svd.v_t?;
        let mut sign = Vector3::new(1.0, 1.0, 1.0);
        if u.determinant() * v_t.determinant() < 0.0 {
            sign.z = -1.0;
        }
        let rotation = u * Matrix3::from_diagonal(&sign) * v_t;
        let scale = svd.singular_values.dot(&sign) / src_variance;
        if !scale.is_finite() || scale <= 0.0 {
            return None;
        }
        // The product of the SVD factors drifts off SO(3) by rounding.
        let rotation = Rotation3::from_matrix(&rotation);
        let translation = dst_centroid.coords - scale * (rotation * src_centroid.coords);
        Some(WorldToWorld::from_parts(translation, rotation, scale))
    }

    /// Fit with iterative outlier rejection.
    ///
    /// Returns the similarity and the indices of the inlier correspondences, or `None` if the
    /// inliers are degenerate or fewer than `min_inlier_ratio` of the input.
    pub fn estimate_robust(
        &self,
        src: &[Point3<f64>],
        dst: &[Point3<f64>],
    ) -> Option<(WorldToWorld, Vec<usize>)> {
        if src.len() != dst.len() {
            return None;
        }
        let mut inliers: Vec<usize> = (0..src.len()).collect();
        let mut similarity = None;
        for iteration in 0..self.max_iterations.max(1) {
            let inlier_src: Vec<_> = inliers.iter().map(|&ix| src[ix]).collect();
            let inlier_dst: Vec<_> = inliers.iter().map(|&ix| dst[ix]).collect();
            if self.is_degenerate(&inlier_src) || self.is_degenerate(&inlier_dst) {
                debug!("similarity inliers became degenerate at iteration {}", iteration);
                return None;
            }
            let current = self.estimate(&inlier_src, &inlier_dst)?;
            similarity = Some(current);

            let residuals: Vec<f64> = src
                .iter()
                .zip(dst)
                .map(|(s, d)| (current.transform_point(s) - d).norm())
                .collect();
            let mut sorted: Vec<f64> = inliers.iter().map(|&ix| residuals[ix]).collect();
            sorted.sort_unstable_by_key(|&r| FloatOrd(r));
            let median = sorted[sorted.len() / 2];
            // An exact fit has a zero median, so use a floor relative to the scene extent.
            let extent = inlier_dst
                .iter()
                .map(|p| (p - centroid(&inlier_dst)).norm())
                .fold(0.0, f64::max);
            let cutoff = self.outlier_factor * median.max(extent * 1e-9);
            let next: Vec<usize> = (0..src.len())
                .filter(|&ix| residuals[ix] <= cutoff)
                .collect();
            debug!(
                "similarity iteration {}: median residual {}, {} of {} inliers",
                iteration,
                median,
                next.len(),
                src.len()
            );
            if next == inliers {
                break;
            }
            if next.len() < 3 {
                return None;
            }
            inliers = next;
        }

        let similarity = similarity?;
        if (inliers.len() as f64) < self.min_inlier_ratio * src.len() as f64 {
            debug!(
                "similarity kept only {} of {} correspondences",
                inliers.len(),
                src.len()
            );
            return None;
        }
        Some((similarity, inliers))
    }
}

impl Default for SimilarityEstimator {
    fn default() -> Self {
        Self {
            outlier_factor: 3.0,
            max_iterations: 10,
            min_inlier_ratio: 0.5,
            collinear_ratio: 1e-3,
        }
    }
}

fn centroid(points: &[Point3<f64>]) -> Point3<f64> {
    let sum: Vector3<f64> = points.iter().map(|p| p.coords).sum();
    Point3::from(sum / points.len().max(1) as f64)
}

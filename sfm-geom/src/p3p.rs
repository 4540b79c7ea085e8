//! Absolute pose from three bearing-to-world matches.
//!
//! Based on "Lambda Twist: An Accurate Fast Robust Perspective Three Point (P3P) Solver",
//! Persson, M. and Nordberg, K. ECCV 2018.

use arrayvec::ArrayVec;
use sfm_core::{
    nalgebra::{Matrix3, Rotation3, Vector3},
    sample_consensus::Estimator,
    FeatureWorldMatch, Pose, Projective, WorldToCamera,
};

/// Estimates up to four [`WorldToCamera`] poses satisfying `lambda_i * y_i = R * x_i + t`
/// for three world points `x_i`, their bearings `y_i` and positive depths `lambda_i`.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct LambdaTwist {
    /// Gauss-Newton iterations spent refining the depths of each solution.
    pub refine_iterations: usize,
    /// Iterations spent projecting the recovered matrix onto a rotation.
    pub rotation_iterations: usize,
    pub rotation_epsilon: f64,
}

impl LambdaTwist {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn refine_iterations(self, refine_iterations: usize) -> Self {
        Self {
            refine_iterations,
            ..self
        }
    }

    /// Solve the P3P problem for exactly three matches.
    pub fn solve(&self, samples: [FeatureWorldMatch; 3]) -> ArrayVec<WorldToCamera, 4> {
        let mut solutions = ArrayVec::new();
        let mut points = [Vector3::zeros(); 3];
        for (point, FeatureWorldMatch(_, world)) in points.iter_mut().zip(&samples) {
            match world.point() {
                Some(p) => *point = p.coords,
                None => return solutions,
            }
        }
        let bearings = samples.map(|FeatureWorldMatch(bearing, _)| bearing.into_inner());

        let d12 = points[0] - points[1];
        let d13 = points[0] - points[2];
        let d23 = points[1] - points[2];
        // Squared distances between the world points.
        let a12 = d12.norm_squared();
        let a13 = d13.norm_squared();
        let a23 = d23.norm_squared();
        // Cosines between the bearings.
        let c12 = bearings[0].dot(&bearings[1]);
        let c23 = bearings[1].dot(&bearings[2]);
        let c31 = bearings[2].dot(&bearings[0]);
        let s12 = 1.0 - c12 * c12;
        let s23 = 1.0 - c23 * c23;
        let s31 = 1.0 - c31 * c31;
        let blob = c12 * c23 * c31 - 1.0;
        let b12 = -2.0 * c12;
        let b13 = -2.0 * c31;
        let b23 = -2.0 * c23;

        // Cubic in gamma whose root makes the pencil D1 + gamma * D2 degenerate.
        let k3 = a13 * (a23 * s31 - a13 * s23);
        if k3.abs() <= f64::EPSILON {
            return solutions;
        }
        let k2 = 2.0 * blob * a23 * a13 + a13 * (2.0 * a12 + a13) * s23 + a23 * (a23 - a12) * s31;
        let k1 = a23 * (a13 - a23) * s12 - a12 * a12 * s23 - 2.0 * a12 * (blob * a23 + a13 * s23);
        let k0 = a12 * (a12 * s23 - a23 * s12);
        let gamma = sharpest_cubic_root(k2 / k3, k1 / k3, k0 / k3);

        #[rustfmt::skip]
        let d0 = Matrix3::new(
            a23 * (1.0 - gamma),  -(a23 * c12),                a23 * c31 * gamma,
            -(a23 * c12),         a23 - a12 + a13 * gamma,     -c23 * (a13 * gamma - a12),
            a23 * c31 * gamma,    -c23 * (a13 * gamma - a12),  gamma * (a13 - a23) - a12,
        );
        let (vectors, values) = singular_eigen(d0);
        let ratio = (-values[1] / values[0]).max(0.0).sqrt();

        let mut depths: ArrayVec<Vector3<f64>, 4> = ArrayVec::new();
        for s in [ratio, -ratio] {
            let w2 = 1.0 / (s * vectors.m12 - vectors.m11);
            let w0 = w2 * (vectors.m21 - s * vectors.m22);
            let w1 = w2 * (vectors.m31 - s * vectors.m32);
            let a = 1.0 / ((a13 - a12) * w1 * w1 - a12 * b13 * w1 - a12);
            let b = a * (a13 * b12 * w1 - a12 * b13 * w0 - 2.0 * w0 * w1 * (a12 - a13));
            let c = a * ((a13 - a12) * w0 * w0 + a13 * b12 * w0 + a13);
            let Some((tau1, tau2)) = real_quadratic_roots(b, c) else {
                continue;
            };
            for tau in [tau1, tau2] {
                if tau <= 0.0 {
                    continue;
                }
                let d = a23 / (tau * (b23 + tau) + 1.0);
                if d <= 0.0 {
                    continue;
                }
                let l2 = d.sqrt();
                let l3 = tau * l2;
                let l1 = w0 * l2 + w1 * l3;
                if l1 >= 0.0 {
                    depths.push(Vector3::new(l1, l2, l3));
                }
            }
        }

        let d12xd13 = d12.cross(&d13);
        let world_frame = match Matrix3::from_columns(&[d12, d13, d12xd13]).try_inverse() {
            Some(m) => m,
            None => return solutions,
        };

        for depth in depths {
            let depth = refine_depths(depth, self.refine_iterations, [a12, a13, a23], [b12, b13, b23]);
            let y1 = depth.x * bearings[0];
            let y2 = depth.y * bearings[1];
            let y3 = depth.z * bearings[2];
            let e12 = y1 - y2;
            let e13 = y1 - y3;
            let camera_frame = Matrix3::from_columns(&[e12, e13, e12.cross(&e13)]);
            let rotation = Rotation3::from_matrix_eps(
                &(camera_frame * world_frame),
                self.rotation_epsilon,
                self.rotation_iterations,
                Rotation3::identity(),
            );
            let translation = y1 - rotation * points[0];
            if translation.iter().all(|n| n.is_finite()) {
                solutions.push(WorldToCamera::from_parts(translation, rotation));
            }
        }
        solutions
    }
}

impl Default for LambdaTwist {
    fn default() -> Self {
        Self {
            refine_iterations: 5,
            rotation_iterations: 100,
            rotation_epsilon: 1e-12,
        }
    }
}

impl Estimator<FeatureWorldMatch> for LambdaTwist {
    type Model = WorldToCamera;
    type ModelIter = ArrayVec<WorldToCamera, 4>;
    const MIN_SAMPLES: usize = 3;

    fn estimate<I>(&self, mut data: I) -> Self::ModelIter
    where
        I: Iterator<Item = FeatureWorldMatch> + Clone,
    {
        match (data.next(), data.next(), data.next()) {
            (Some(a), Some(b), Some(c)) => self.solve([a, b, c]),
            _ => ArrayVec::new(),
        }
    }
}

/// Gauss-Newton on the three law-of-cosines equations
/// `l_i^2 + l_j^2 + b_ij * l_i * l_j = a_ij`, stopping when the residual grows.
fn refine_depths(lambda: Vector3<f64>, iterations: usize, a: [f64; 3], b: [f64; 3]) -> Vector3<f64> {
    let [a12, a13, a23] = a;
    let [b12, b13, b23] = b;
    let residual = |l: &Vector3<f64>| {
        Vector3::new(
            l.x * l.x + l.y * l.y + b12 * l.x * l.y - a12,
            l.x * l.x + l.z * l.z + b13 * l.x * l.z - a13,
            l.y * l.y + l.z * l.z + b23 * l.y * l.z - a23,
        )
    };
    let mut lambda = lambda;
    let mut r = residual(&lambda);
    for _ in 0..iterations {
        if r.lp_norm(1) < 1e-10 {
            break;
        }
        #[rustfmt::skip]
        let jacobian = Matrix3::new(
            2.0 * lambda.x + b12 * lambda.y, 2.0 * lambda.y + b12 * lambda.x, 0.0,
            2.0 * lambda.x + b13 * lambda.z, 0.0, 2.0 * lambda.z + b13 * lambda.x,
            0.0, 2.0 * lambda.y + b23 * lambda.z, 2.0 * lambda.z + b23 * lambda.y,
        );
        let Some(inverse) = jacobian.try_inverse() else {
            break;
        };
        let next = lambda - inverse * r;
        let next_r = residual(&next);
        if next_r.lp_norm(1) > r.lp_norm(1) {
            break;
        }
        lambda = next;
        r = next_r;
    }
    lambda
}

/// Real roots of `r^2 + b*r + c`, computed without cancellation.
fn real_quadratic_roots(b: f64, c: f64) -> Option<(f64, f64)> {
    let discriminant = b * b - 4.0 * c;
    if discriminant < 0.0 {
        return None;
    }
    let y = discriminant.sqrt();
    if b < 0.0 {
        Some((0.5 * (-b + y), 0.5 * (-b - y)))
    } else {
        Some((2.0 * c / (-b + y), 2.0 * c / (-b - y)))
    }
}

/// A root of `r^3 + b*r^2 + c*r + d` where the derivative is as large as possible.
///
/// The starting point of Newton-Raphson is placed outside the stationary points of the cubic,
/// so the iteration does not wander between roots.
fn sharpest_cubic_root(b: f64, c: f64, d: f64) -> f64 {
    let h = |r: f64| ((r + b) * r + c) * r + d;
    let dh = |r: f64| (3.0 * r + 2.0 * b) * r + c;

    let mut r = if b * b >= 3.0 * c {
        let v = (b * b - 3.0 * c).sqrt();
        let t1 = (-b - v) / 3.0;
        let k1 = h(t1);
        if k1 > 0.0 {
            t1 - (-k1 / (3.0 * t1 + b)).sqrt()
        } else {
            let t2 = (-b + v) / 3.0;
            t2 + (-h(t2) / (3.0 * t2 + b)).sqrt()
        }
    } else {
        let r = -b / 3.0;
        if dh(r).abs() < 1e-4 {
            r + 1.0
        } else {
            r
        }
    };

    for iteration in 0..50 {
        let fx = h(r);
        if iteration >= 7 && fx.abs() <= 1e-13 {
            break;
        }
        r -= fx / dh(r);
    }
    r
}

/// Eigen decomposition of a symmetric 3x3 matrix known to have a zero eigenvalue.
///
/// The eigenvalues come back with the largest magnitude first and the null value last.
fn singular_eigen(x: Matrix3<f64>) -> (Matrix3<f64>, Vector3<f64>) {
    let null = x
        .column(0)
        .into_owned()
        .cross(&x.column(1).into_owned())
        .normalize();

    let b = -x.m11 - x.m22 - x.m33;
    let c = -x.m12 * x.m12 - x.m13 * x.m13 - x.m23 * x.m23
        + x.m11 * (x.m22 + x.m33)
        + x.m22 * x.m33;
    let (mut e1, mut e2) = real_quadratic_roots(b, c).unwrap_or((-0.5 * b, -0.5 * b));
    if e1.abs() < e2.abs() {
        core::mem::swap(&mut e1, &mut e2);
    }

    let vector = |e: f64| {
        let scale = 1.0 / (e * (x.m11 + x.m22) - x.m11 * x.m22 - e * e + x.m12 * x.m12);
        let v1 = -(e * x.m13 + x.m12 * x.m23 - x.m13 * x.m22) * scale;
        let v2 = -(e * x.m23 + x.m12 * x.m13 - x.m11 * x.m23) * scale;
        Vector3::new(v1, v2, 1.0).normalize()
    };

    (
        Matrix3::from_columns(&[vector(e1), vector(e2), null]),
        Vector3::new(e1, e2, 0.0),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use sfm_core::{nalgebra::Point3, WorldPoint};

    #[test]
    fn cubic_root_is_a_root() {
        // (r - 1)(r - 2)(r + 3)
        let r = sharpest_cubic_root(0.0, -7.0, 6.0);
        assert!(((r - 1.0) * (r - 2.0) * (r + 3.0)).abs() < 1e-9);
    }

    #[test]
    fn one_solution_matches_the_true_pose() {
        let pose = WorldToCamera::from_parts(
            Vector3::new(0.1, -0.3, 2.0),
            Rotation3::from_euler_angles(0.2, -0.1, 0.3),
        );
        let samples = [
            Point3::new(0.5, 0.2, 1.0),
            Point3::new(-0.4, 0.6, 2.0),
            Point3::new(0.1, -0.7, 1.5),
        ]
        .map(|p| {
            let world = WorldPoint::from_point(p);
            FeatureWorldMatch(pose.transform(world).bearing(), world)
        });
        let solutions = LambdaTwist::new().solve(samples);
        assert!(!solutions.is_empty());
        let best = solutions
            .iter()
            .min_by(|a, b| {
                let da = (a.0.translation.vector - pose.0.translation.vector).norm();
                let db = (b.0.translation.vector - pose.0.translation.vector).norm();
                da.total_cmp(&db)
            })
            .unwrap();
        assert_relative_eq!(best.0, pose.0, epsilon = 1e-6);
    }
}

use crate::problem::{reprojection_residual, BundleError, BundleProblem, BundleReport, BundleSolution};
use levenberg_marquardt::{LeastSquaresProblem, LevenbergMarquardt};
use log::{debug, info, warn};
use nalgebra::{
    dimension::{Dynamic, U1},
    DMatrix, DVector, Point3, VecStorage, Vector2, Vector6,
};
use sfm_core::{CameraIntrinsics, Pose, WorldToCamera};

/// Anything that can refine a [`BundleProblem`].
///
/// Implementations must hold constant blocks exactly constant and either return refined values
/// for every block or an error, never a partial update.
pub trait BundleAdjuster: Send + Sync {
    fn adjust(&self, problem: &BundleProblem) -> Result<BundleSolution, BundleError>;
}

/// Robust loss applied to the pixel residual of each observation.
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum Loss {
    Trivial,
    /// Quadratic below the given pixel distance, linear above it.
    Huber(f64),
}

impl Loss {
    /// The factor applied to a residual so that its square follows the loss.
    fn scale(self, residual_norm: f64) -> f64 {
        match self {
            Loss::Trivial => 1.0,
            Loss::Huber(delta) => {
                if residual_norm <= delta {
                    1.0
                } else {
                    (delta * (2.0 * residual_norm - delta)).sqrt() / residual_norm
                }
            }
        }
    }
}

/// A dense Levenberg-Marquardt bundle adjuster with a central-difference Jacobian.
///
/// Poses are parameterized by their se(3) vector. Cameras expose only the parameters listed as
/// free in their block.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct LevenbergMarquardtAdjuster {
    patience: usize,
    loss: Loss,
}

impl LevenbergMarquardtAdjuster {
    pub fn new() -> Self {
        Self::default()
    }

    /// The patience handed to the solver. It bounds the number of evaluations.
    ///
    /// Default is `50`.
    #[must_use]
    pub fn patience(self, patience: usize) -> Self {
        Self { patience, ..self }
    }

    /// Default is [`Loss::Trivial`].
    #[must_use]
    pub fn loss(self, loss: Loss) -> Self {
        Self { loss, ..self }
    }
}

impl Default for LevenbergMarquardtAdjuster {
    fn default() -> Self {
        Self {
            patience: 50,
            loss: Loss::Trivial,
        }
    }
}

impl BundleAdjuster for LevenbergMarquardtAdjuster {
    fn adjust(&self, problem: &BundleProblem) -> Result<BundleSolution, BundleError> {
        problem.validate()?;
        let initial_cost = problem.cost();
        if !initial_cost.is_finite() {
            return Err(BundleError::NonFiniteCost);
        }

        let mut least_squares = BundleLeastSquares::new(problem, self.loss);
        if least_squares.num_params() == 0 {
            debug!("bundle adjustment has no free parameters");
            return Ok(least_squares.solution(BundleReport {
                initial_cost,
                final_cost: initial_cost,
                evaluations: 0,
                converged: true,
                termination: "no free parameters".to_owned(),
            }));
        }

        info!(
            "bundle adjusting {} poses, {} points and {} observations with {} parameters",
            problem.poses.len(),
            problem.points.len(),
            problem.observations.len(),
            least_squares.num_params()
        );

        let initial_params = least_squares.params.clone();
        let (solved, report) = LevenbergMarquardt::new()
            .with_patience(self.patience)
            .minimize(least_squares);
        least_squares = solved;
        let termination = format!("{:?}", report.termination);

        let mut final_cost = least_squares.unweighted_cost();
        if !final_cost.is_finite() {
            return Err(BundleError::NonFiniteCost);
        }
        let converged = report.termination.was_successful();
        if !converged {
            if final_cost < initial_cost {
                warn!(
                    "bundle adjustment stopped early ({}), keeping the improved cost {} (was {})",
                    termination, final_cost, initial_cost
                );
            } else {
                return Err(BundleError::NonConvergence(termination));
            }
        }
        if final_cost > initial_cost {
            // A robust loss can trade squared error for fewer outliers. Never hand back a
            // solution that is worse in plain squared error.
            least_squares.set_params(&initial_params);
            final_cost = initial_cost;
        }

        info!(
            "bundle adjustment cost {} -> {} after {} evaluations",
            initial_cost, final_cost, report.number_of_evaluations
        );
        Ok(least_squares.solution(BundleReport {
            initial_cost,
            final_cost,
            evaluations: report.number_of_evaluations,
            converged,
            termination,
        }))
    }
}

/// Where the free parameters of one block live in the parameter vector.
#[derive(Clone, Debug)]
struct BlockLayout {
    offset: usize,
    /// Component of the block each parameter refers to.
    components: Vec<usize>,
}

impl BlockLayout {
    fn len(&self) -> usize {
        self.components.len()
    }
}

#[derive(Clone)]
struct BundleLeastSquares<'a> {
    problem: &'a BundleProblem,
    loss: Loss,
    cameras: Vec<BlockLayout>,
    poses: Vec<BlockLayout>,
    points: Vec<BlockLayout>,
    params: DVector<f64>,
    camera_values: Vec<CameraIntrinsics>,
    pose_values: Vec<WorldToCamera>,
    point_values: Vec<Point3<f64>>,
}

impl<'a> BundleLeastSquares<'a> {
    fn new(problem: &'a BundleProblem, loss: Loss) -> Self {
        let mut offset = 0;
        let mut layout = |components: Vec<usize>| {
            let block = BlockLayout { offset, components };
            offset += block.len();
            block
        };
        let cameras: Vec<_> = problem
            .cameras
            .iter()
            .map(|c| layout(c.free_params.clone()))
            .collect();
        let poses: Vec<_> = problem
            .poses
            .iter()
            .map(|p| {
                if p.constant {
                    layout(vec![])
                } else {
                    layout(
                        (0..6)
                            .filter(|&ix| p.constant_translation != Some(ix))
                            .collect(),
                    )
                }
            })
            .collect();
        let points: Vec<_> = problem
            .points
            .iter()
            .map(|p| layout(if p.constant { vec![] } else { vec![0, 1, 2] }))
            .collect();

        let mut params = DVector::zeros(offset);
        for (block, layout) in problem.cameras.iter().zip(&cameras) {
            for (i, &component) in layout.components.iter().enumerate() {
                params[layout.offset + i] = block.intrinsics.params()[component];
            }
        }
        for (block, layout) in problem.poses.iter().zip(&poses) {
            let se3 = block.pose.se3();
            for (i, &component) in layout.components.iter().enumerate() {
                params[layout.offset + i] = se3[component];
            }
        }
        for (block, layout) in problem.points.iter().zip(&points) {
            for (i, &component) in layout.components.iter().enumerate() {
                params[layout.offset + i] = block.point[component];
            }
        }

        let mut least_squares = Self {
            problem,
            loss,
            cameras,
            poses,
            points,
            params: params.clone(),
            camera_values: problem.cameras.iter().map(|c| c.intrinsics.clone()).collect(),
            pose_values: problem.poses.iter().map(|p| p.pose).collect(),
            point_values: problem.points.iter().map(|p| p.point).collect(),
        };
        least_squares.set_params(&params);
        least_squares
    }

    fn num_params(&self) -> usize {
        self.params.len()
    }

    fn camera_from(&self, ix: usize, params: &DVector<f64>) -> CameraIntrinsics {
        let mut camera = self.problem.cameras[ix].intrinsics.clone();
        let layout = &self.cameras[ix];
        if layout.len() > 0 {
            let mut values = camera.params().to_vec();
            for (i, &component) in layout.components.iter().enumerate() {
                values[component] = params[layout.offset + i];
            }
            // The length is unchanged, so this cannot fail.
            let _ = camera.set_params(&values);
        }
        camera
    }

    fn pose_from(&self, ix: usize, params: &DVector<f64>) -> WorldToCamera {
        let block = &self.problem.poses[ix];
        let layout = &self.poses[ix];
        if layout.len() == 0 {
            return block.pose;
        }
        let mut se3: Vector6<f64> = block.pose.se3();
        for (i, &component) in layout.components.iter().enumerate() {
            se3[component] = params[layout.offset + i];
        }
        WorldToCamera::from_se3(se3)
    }

    fn point_from(&self, ix: usize, params: &DVector<f64>) -> Point3<f64> {
        let layout = &self.points[ix];
        let mut point = self.problem.points[ix].point;
        for (i, &component) in layout.components.iter().enumerate() {
            point[component] = params[layout.offset + i];
        }
        point
    }

    fn residual_of(&self, observation: usize) -> Vector2<f64> {
        let o = &self.problem.observations[observation];
        let camera = self.problem.poses[o.pose].camera;
        reprojection_residual(
            &self.camera_values[camera],
            self.pose_values[o.pose],
            self.point_values[o.point],
            o.keypoint,
        )
    }

    fn unweighted_cost(&self) -> f64 {
        0.5 * (0..self.problem.observations.len())
            .map(|ix| self.residual_of(ix).norm_squared())
            .sum::<f64>()
    }

    fn solution(&self, report: BundleReport) -> BundleSolution {
        BundleSolution {
            cameras: self.camera_values.clone(),
            poses: self.pose_values.clone(),
            points: self.point_values.clone(),
            report,
        }
    }
}

impl<'a> LeastSquaresProblem<f64, Dynamic, Dynamic> for BundleLeastSquares<'a> {
    type ResidualStorage = VecStorage<f64, Dynamic, U1>;
    type JacobianStorage = VecStorage<f64, Dynamic, Dynamic>;
    type ParameterStorage = VecStorage<f64, Dynamic, U1>;

    fn set_params(&mut self, params: &DVector<f64>) {
        self.params.copy_from(params);
        self.camera_values = (0..self.cameras.len())
            .map(|ix| self.camera_from(ix, params))
            .collect();
        self.pose_values = (0..self.poses.len())
            .map(|ix| self.pose_from(ix, params))
            .collect();
        self.point_values = (0..self.points.len())
            .map(|ix| self.point_from(ix, params))
            .collect();
    }

    fn params(&self) -> DVector<f64> {
        self.params.clone()
    }

    fn residuals(&self) -> Option<DVector<f64>> {
        let mut residuals = DVector::zeros(2 * self.problem.observations.len());
        for ix in 0..self.problem.observations.len() {
            let r = self.residual_of(ix);
            let r = r * self.loss.scale(r.norm());
            residuals.fixed_rows_mut::<2>(2 * ix).copy_from(&r);
        }
        Some(residuals)
    }

    fn jacobian(&self) -> Option<DMatrix<f64>> {
        let mut jacobian = DMatrix::zeros(2 * self.problem.observations.len(), self.num_params());
        for (ix, o) in self.problem.observations.iter().enumerate() {
            let camera_ix = self.problem.poses[o.pose].camera;
            let weight = self.loss.scale(self.residual_of(ix).norm());
            let evaluate = |params: &DVector<f64>| {
                reprojection_residual(
                    &self.camera_from(camera_ix, params),
                    self.pose_from(o.pose, params),
                    self.point_from(o.point, params),
                    o.keypoint,
                )
            };
            let layouts = [
                &self.cameras[camera_ix],
                &self.poses[o.pose],
                &self.points[o.point],
            ];
            let mut perturbed = self.params.clone();
            for layout in layouts {
                for column in layout.offset..layout.offset + layout.len() {
                    let original = perturbed[column];
                    let step = 1e-6 * original.abs().max(1.0);
                    perturbed[column] = original + step;
                    let forward = evaluate(&perturbed);
                    perturbed[column] = original - step;
                    let backward = evaluate(&perturbed);
                    perturbed[column] = original;
                    let derivative = (forward - backward) * (weight / (2.0 * step));
                    jacobian
                        .fixed_slice_mut::<2, 1>(2 * ix, column)
                        .copy_from(&derivative);
                }
            }
        }
        Some(jacobian)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn huber_matches_quadratic_below_delta() {
        let loss = Loss::Huber(2.0);
        assert_eq!(loss.scale(1.0), 1.0);
        // Above delta the squared scaled residual equals 2 * delta * |r| - delta^2.
        let r: f64 = 5.0;
        let scaled = r * loss.scale(r);
        assert!((scaled * scaled - (2.0 * 2.0 * r - 4.0)).abs() < 1e-12);
    }
}

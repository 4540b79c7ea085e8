use approx::assert_relative_eq;
use nalgebra::{Point3, Rotation3, Vector3};
use rand::{rngs::SmallRng, Rng, SeedableRng};
use sfm_core::{CameraIntrinsics, CameraModelId, Pose, Projective, WorldPoint, WorldToCamera};
use sfm_optimize::{
    refine_pose, BundleAdjuster, BundleError, BundleProblem, CameraBlock, LevenbergMarquardtAdjuster,
    ObservationBlock, PointBlock, PoseBlock,
};

fn camera() -> CameraIntrinsics {
    CameraIntrinsics::from_focal_length(CameraModelId::SimpleRadial, 500.0, 640, 480).unwrap()
}

fn poses() -> Vec<WorldToCamera> {
    (0..3)
        .map(|i| {
            let i = f64::from(i);
            WorldToCamera::from_parts(
                Vector3::new(-0.4 * i, 0.05 * i, 0.0),
                Rotation3::from_euler_angles(0.0, 0.03 * i, 0.0),
            )
        })
        .collect()
}

fn points(rng: &mut SmallRng) -> Vec<Point3<f64>> {
    (0..30)
        .map(|_| {
            Point3::new(
                rng.gen_range(-1.5..1.5),
                rng.gen_range(-1.0..1.0),
                rng.gen_range(4.0..7.0),
            )
        })
        .collect()
}

fn problem(rng: &mut SmallRng, noise: f64) -> (BundleProblem, Vec<WorldToCamera>, Vec<Point3<f64>>) {
    let truth_poses = poses();
    let truth_points = points(rng);
    let mut problem = BundleProblem::new();
    let camera = problem.add_camera(CameraBlock::constant(camera()));
    for (ix, &pose) in truth_poses.iter().enumerate() {
        let perturbed = if ix == 0 {
            pose
        } else {
            WorldToCamera::from_se3(
                pose.se3() + nalgebra::Vector6::from_fn(|_, _| noise * rng.gen_range(-1.0..1.0)),
            )
        };
        problem.add_pose(PoseBlock {
            pose: perturbed,
            camera,
            constant: ix == 0,
            constant_translation: (ix == 1).then(|| 0),
        });
    }
    for &point in &truth_points {
        let index = problem.add_point(PointBlock {
            point: point + Vector3::from_fn(|_, _| noise * rng.gen_range(-1.0..1.0)),
            constant: false,
        });
        for (pose_ix, pose) in truth_poses.iter().enumerate() {
            let keypoint = self::camera()
                .project(pose.transform(WorldPoint::from_point(point)))
                .unwrap();
            problem.add_observation(ObservationBlock {
                pose: pose_ix,
                point: index,
                keypoint,
            });
        }
    }
    // Restore the gauge-fixing component to its true value.
    let fixed = truth_poses[1].0.translation.vector.x;
    let mut se3 = problem.poses[1].pose.se3();
    se3[0] = fixed;
    problem.poses[1].pose = WorldToCamera::from_se3(se3);
    (problem, truth_poses, truth_points)
}

#[test]
fn noisy_problem_converges() {
    let _ = pretty_env_logger::try_init_timed();
    let mut rng = SmallRng::seed_from_u64(7);
    let (problem, truth_poses, truth_points) = problem(&mut rng, 0.01);
    let solution = LevenbergMarquardtAdjuster::new()
        .patience(200)
        .adjust(&problem)
        .unwrap();

    assert!(solution.report.final_cost < solution.report.initial_cost);
    assert!(solution.report.final_cost < 1e-6);
    // Constant blocks are untouched.
    assert_eq!(solution.poses[0], problem.poses[0].pose);
    assert_eq!(solution.cameras[0], problem.cameras[0].intrinsics);
    assert_relative_eq!(
        solution.poses[1].se3()[0],
        problem.poses[1].pose.se3()[0],
        epsilon = 1e-12
    );
    for (solved, truth) in solution.points.iter().zip(&truth_points) {
        assert_relative_eq!(solved, truth, epsilon = 1e-4);
    }
    for (solved, truth) in solution.poses.iter().zip(&truth_poses) {
        assert_relative_eq!(solved.0, truth.0, epsilon = 1e-4);
    }
}

#[test]
fn single_pose_refinement() {
    let mut rng = SmallRng::seed_from_u64(11);
    let truth = poses()[2];
    let correspondences: Vec<_> = points(&mut rng)
        .into_iter()
        .map(|p| {
            let kp = camera()
                .project(truth.transform(WorldPoint::from_point(p)))
                .unwrap();
            (kp, p)
        })
        .collect();
    let start = WorldToCamera::from_se3(truth.se3() + nalgebra::Vector6::repeat(0.01));
    let (refined, _, report) = refine_pose(
        &LevenbergMarquardtAdjuster::new(),
        CameraBlock::constant(camera()),
        start,
        correspondences,
    )
    .unwrap();
    assert!(report.final_cost < 1e-8);
    assert_relative_eq!(refined.0, truth.0, epsilon = 1e-6);
}

#[test]
fn focal_length_is_refined_when_free() {
    let mut rng = SmallRng::seed_from_u64(5);
    let (mut problem, _, _) = problem(&mut rng, 0.0);
    let mut wrong = camera();
    wrong.set_params(&[520.0, 320.0, 240.0, 0.0]).unwrap();
    problem.cameras[0] = CameraBlock {
        intrinsics: wrong,
        free_params: vec![0],
    };
    for pose in &mut problem.poses {
        pose.constant = true;
    }
    for point in &mut problem.points {
        point.constant = true;
    }
    let solution = LevenbergMarquardtAdjuster::new().adjust(&problem).unwrap();
    assert_relative_eq!(solution.cameras[0].params()[0], 500.0, epsilon = 1e-4);
}

#[test]
fn malformed_problems_are_rejected() {
    let adjuster = LevenbergMarquardtAdjuster::new();
    assert_eq!(
        adjuster.adjust(&BundleProblem::new()).unwrap_err(),
        BundleError::EmptyProblem
    );

    let mut rng = SmallRng::seed_from_u64(1);
    let (mut problem, _, _) = problem(&mut rng, 0.0);
    problem.observations[0].point = 1000;
    assert_eq!(
        adjuster.adjust(&problem).unwrap_err(),
        BundleError::IndexOutOfRange {
            kind: "point",
            index: 1000
        }
    );
}

use approx::assert_relative_eq;
use arrsac::Arrsac;
use itertools::Itertools;
use rand::{rngs::SmallRng, Rng, SeedableRng};
use sfm_core::nalgebra::{IsometryMatrix3, Point3, Rotation3, Translation, Vector3};
use sfm_core::sample_consensus::Consensus;
use sfm_core::{CameraToCamera, FeatureMatch, FeatureWorldMatch, Pose, Projective, WorldPoint};
use sfm_geom::{triangulation::LinearEigenTriangulator, EightPoint, LambdaTwist};

const EPSILON_APPROX: f64 = 1e-6;

#[test]
fn arrsac_lambda_twist() {
    let mut arrsac = Arrsac::new(0.01, SmallRng::seed_from_u64(0));

    let camera_depth_points = [
        [-0.228_125, -0.061_458_334, 1.0],
        [0.418_75, -0.581_25, 2.0],
        [1.128_125, 0.878_125, 3.0],
        [-0.528_125, 0.178_125, 2.5],
        [-0.923_424, -0.235_125, 2.8],
    ]
    .map(Point3::from);

    let rot = Rotation3::from_euler_angles(0.1, 0.2, 0.3);
    let trans = Translation::from(Vector3::new(0.1, 0.2, 0.3));
    let pose = IsometryMatrix3::from_parts(trans, rot);

    let samples = camera_depth_points
        .iter()
        .map(|&p| {
            let world = WorldPoint::from_point(pose.inverse() * p);
            FeatureWorldMatch(sfm_core::nalgebra::Unit::new_normalize(p.coords), world)
        })
        .collect_vec();

    // The fourth and fifth points disambiguate the up to four P3P solutions.
    let estimated = arrsac
        .model(&LambdaTwist::new(), samples.iter().copied())
        .unwrap();

    assert_relative_eq!(rot, estimated.0.rotation, epsilon = EPSILON_APPROX);
    assert_relative_eq!(trans, estimated.0.translation, epsilon = EPSILON_APPROX);
}

#[test]
fn arrsac_eight_point_with_outliers() {
    let mut rng = SmallRng::seed_from_u64(3);
    let pose = CameraToCamera::from_parts(
        Vector3::new(-0.9, 0.05, 0.1),
        Rotation3::from_euler_angles(0.01, -0.15, 0.02),
    );
    let mut matches = (0..80)
        .map(|_| {
            let point = sfm_core::CameraPoint::from_point(Point3::new(
                rng.gen_range(-2.0..2.0),
                rng.gen_range(-1.5..1.5),
                rng.gen_range(3.0..8.0),
            ));
            FeatureMatch(point.bearing(), pose.transform(point).bearing())
        })
        .collect_vec();
    // Replace every fifth match by a random pairing.
    for ix in (0..matches.len()).step_by(5) {
        let other = (ix + 37) % matches.len();
        matches[ix].1 = matches[other].1;
    }

    let mut arrsac = Arrsac::new(1e-4, SmallRng::seed_from_u64(0));
    let (essential, inliers) = arrsac
        .model_inliers(&EightPoint::new(), matches.iter().copied())
        .unwrap();
    assert!(inliers.len() >= 60);

    let (solved, _) = essential
        .solve_pose(
            &LinearEigenTriangulator::new(),
            inliers.iter().map(|&ix| matches[ix]),
            1e-12,
            1000,
        )
        .unwrap();
    assert!(solved.0.rotation.rotation_to(&pose.0.rotation).angle() < 1e-4);
    assert!(
        solved
            .0
            .translation
            .vector
            .dot(&pose.0.translation.vector.normalize())
            > 1.0 - 1e-4
    );
}

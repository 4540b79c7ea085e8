mod common;

use common::Scene;
use sfm_core::nalgebra::{Point3, Vector3};
use sfm_core::WorldToWorld;
use sfm_mapper::{ImageId, Observation, SceneError, TrackKey};

fn scene() -> Scene {
    Scene::ring(4, 10.0, 60, 11)
}

#[test]
fn exact_reconstruction_is_consistent() {
    common::init_logger();
    let scene = scene();
    let model = scene.reconstruction(&[0, 1, 2], WorldToWorld::identity());
    model.sanity_check().unwrap();
    let stats = model.statistics();
    assert_eq!(stats.num_registered_images, 3);
    assert_eq!(stats.num_tracks, model.num_tracks());
    assert!(stats.mean_track_length >= 2.0);
    assert!(stats.mean_reprojection_error < 1e-6);
}

#[test]
fn deregistration_cascades_to_tracks() {
    let scene = scene();
    let mut model = scene.reconstruction(&[0, 1, 2], WorldToWorld::identity());
    let tracks_before = model.num_tracks();
    let pairs_with_first = model
        .tracks()
        .filter(|(_, track)| track.len() == 2 && track.observes(ImageId(0)))
        .count();

    let deleted = model.deregister_image(ImageId(0)).unwrap();

    assert_eq!(deleted, pairs_with_first);
    assert_eq!(model.num_tracks(), tracks_before - pairs_with_first);
    assert!(!model.is_registered(ImageId(0)));
    assert_eq!(model.image(ImageId(0)).unwrap().num_observations(), 0);
    assert!(model
        .tracks()
        .all(|(_, track)| !track.observes(ImageId(0)) && track.len() == 2));
    model.sanity_check().unwrap();
}

#[test]
fn filtering_keeps_tracks_within_thresholds() {
    let scene = scene();
    let mut model = scene.reconstruction(&[0, 1, 2], WorldToWorld::identity());
    let keys = model.track_keys();
    // Push a few points far off their rays.
    for &key in keys.iter().step_by(7) {
        model.track_mut(key).unwrap().point += Vector3::new(0.3, -0.2, 0.1);
    }
    let max_error = 4.0;
    let min_angle = 2f64.to_radians();
    let within: Vec<TrackKey> = keys
        .iter()
        .copied()
        .filter(|&key| {
            let errors = model.track_errors(key).unwrap();
            errors.iter().all(|&(_, error)| error <= max_error)
                && model.track_angle(key).unwrap() >= min_angle
        })
        .collect();
    assert!(within.len() < keys.len());

    let stats = model.filter_all_tracks(max_error, min_angle).unwrap();

    assert!(stats.observations > 0);
    for key in within {
        assert!(model.track(key).is_some());
    }
    for (key, _) in model.tracks() {
        let errors = model.track_errors(key).unwrap();
        assert!(errors.iter().all(|&(_, error)| error <= max_error));
    }
    model.sanity_check().unwrap();
}

#[test]
fn narrow_tracks_are_filtered() {
    let scene = scene();
    let mut model = scene.reconstruction(&[0, 1], WorldToWorld::identity());
    let num_tracks = model.num_tracks();
    // Cameras 10 degrees apart cannot reach a 30 degree angle.
    let stats = model
        .filter_all_tracks(f64::INFINITY, 30f64.to_radians())
        .unwrap();
    assert_eq!(stats.tracks, num_tracks);
    assert_eq!(model.num_tracks(), 0);
    assert_eq!(model.num_observations(), 0);
}

#[test]
fn merging_tracks_moves_observations() {
    let scene = scene();
    let mut model = scene.reconstruction(&[0, 1, 2, 3], WorldToWorld::identity());
    let key = model
        .tracks()
        .find(|(_, track)| track.len() == 4)
        .map(|(key, _)| key)
        .unwrap();
    let observations: Vec<Observation> = model.track(key).unwrap().observations().collect();
    let point = model.track(key).unwrap().point;
    model.delete_track(key).unwrap();

    let a = model
        .add_track(point, observations[..2].iter().copied(), [10, 10, 10])
        .unwrap();
    let b = model
        .add_track(point, observations[2..].iter().copied(), [30, 30, 30])
        .unwrap();
    let merged = model.merge_tracks(a, b).unwrap();

    assert_eq!(merged, a);
    assert!(model.track(b).is_none());
    let track = model.track(a).unwrap();
    assert_eq!(track.len(), 4);
    assert_eq!(track.color, [20, 20, 20]);
    for observation in observations {
        assert_eq!(
            model.image_track(observation.image, observation.keypoint),
            Some(a)
        );
    }
    model.sanity_check().unwrap();
}

#[test]
fn similarity_keeps_projections() {
    let scene = scene();
    let mut model = scene.reconstruction(&[0, 1, 2], WorldToWorld::identity());
    model.transform(WorldToWorld::from_parts(
        Vector3::new(3.0, -1.0, 2.0),
        sfm_core::nalgebra::Rotation3::from_euler_angles(0.3, -0.2, 0.1),
        2.5,
    ));
    assert!(model.mean_reprojection_error() < 1e-6);
}

#[test]
fn invalid_tracks_are_checked_without_side_effects() {
    let scene = scene();
    let mut model = scene.reconstruction(&[0, 1], WorldToWorld::identity());
    model
        .add_image(
            ImageId(9),
            sfm_mapper::Image::new("unregistered", sfm_mapper::CameraId(0), vec![]),
        )
        .unwrap();
    for key in model.track_keys() {
        model.delete_track(key).unwrap();
    }
    let point = Point3::origin();
    assert_eq!(
        model.check_track(&point, &[Observation::new(ImageId(0), 0)]),
        Err(SceneError::TooFewObservations(1))
    );
    assert_eq!(
        model.check_track(
            &point,
            &[Observation::new(ImageId(0), 0), Observation::new(ImageId(0), 1)]
        ),
        Err(SceneError::DuplicateObservation(ImageId(0)))
    );
    assert_eq!(
        model.check_track(
            &point,
            &[Observation::new(ImageId(0), 0), Observation::new(ImageId(9), 0)]
        ),
        Err(SceneError::ImageNotRegistered(ImageId(9)))
    );
    model.sanity_check().unwrap();
}

#[test]
#[cfg_attr(debug_assertions, should_panic(expected = "scene invariant violated"))]
fn adding_a_track_on_a_linked_keypoint_is_rejected() {
    let scene = scene();
    let mut model = scene.reconstruction(&[0, 1, 2], WorldToWorld::identity());
    let (_, track) = model.tracks().next().unwrap();
    let observations: Vec<Observation> = track.observations().collect();
    let point = track.point;
    let result = model.add_track(point, observations, [0; 3]);
    assert!(matches!(
        result,
        Err(SceneError::KeypointAlreadyLinked { .. })
    ));
    model.sanity_check().unwrap();
}

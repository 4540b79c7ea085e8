mod common;

use common::Scene;
use parking_lot::RwLock;
use sfm_core::WorldToWorld;
use sfm_mapper::{
    CorrespondenceGraph, EventKind, ImageId, IncrementalMapper, MapperController, MapperError,
    MapperEvent, MapperSettings, Reconstruction, ReconstructionManager, RefinementKind,
    RefinementScheduler,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

fn controller(
    graph: CorrespondenceGraph,
    settings: MapperSettings,
) -> MapperController<CorrespondenceGraph> {
    MapperController::new(
        Arc::new(graph),
        Arc::new(RwLock::new(ReconstructionManager::new())),
        settings,
    )
}

fn models(controller: &MapperController<CorrespondenceGraph>) -> Vec<Reconstruction> {
    controller
        .manager()
        .read()
        .iter()
        .map(|model| model.read().clone())
        .collect()
}

#[test]
fn ring_is_reconstructed_into_one_model() {
    common::init_logger();
    let scene = Scene::ring(8, 12.0, 150, 3);
    let controller = controller(scene.graph(), common::settings());

    let summary = controller.run().unwrap();

    assert_eq!(summary.models, 1);
    assert_eq!(summary.registered_images, 8);
    assert_eq!(summary.discarded_models, 0);
    assert!(!summary.cancelled);
    let model = &models(&controller)[0];
    model.sanity_check().unwrap();
    assert!(model.num_tracks() > 100);
    assert!(model.mean_reprojection_error() < 1.0);
}

#[test]
fn stepwise_mapping_grows_a_consistent_model() {
    common::init_logger();
    let scene = Scene::ring(6, 12.0, 150, 4);
    let graph = scene.graph();
    let settings = common::settings();
    let mut mapper = IncrementalMapper::new(&graph, settings, 7);
    let mut scheduler = RefinementScheduler::new(settings);
    let mut model = Reconstruction::new();

    let pair = mapper.seed_pairs(|_| true)[0];
    let seed = mapper.estimate_seed(pair.a, pair.b).unwrap();
    assert!(seed.points.len() >= settings.init_min_num_inliers);
    let created = mapper.initialize(&mut model, &seed).unwrap();
    assert!(created > 0);
    assert_eq!(model.num_registered_images(), 2);

    let mut tracks_after_local = 0;
    for _ in 0..3 {
        let candidates = mapper.candidates(&model, |_| true);
        assert!(!candidates.is_empty());
        let image = candidates[0].image;
        assert!(!model.is_registered(image));
        assert!(mapper.register_image(&mut model, image).unwrap());
        mapper.triangulate_image(&mut model, image).unwrap();
        mapper.filter_image_tracks(&mut model, image).unwrap();
        let report = scheduler.local_refine(&mut model, &mut mapper).unwrap();
        assert_eq!(report.kind, RefinementKind::Local);
        tracks_after_local = model.num_tracks();
        model.sanity_check().unwrap();
    }
    assert_eq!(model.num_registered_images(), 5);

    let report = scheduler.global_refine(&mut model, &mut mapper).unwrap();
    assert_eq!(report.kind, RefinementKind::Global);
    assert_eq!(report.num_images, 5);
    assert!(report.deregistered.is_empty());
    // Retriangulation never loses tracks the local pass kept.
    assert!(model.num_tracks() >= tracks_after_local);
    assert!(!scheduler.should_run_global(&model));
    model.sanity_check().unwrap();
    assert!(model.mean_reprojection_error() < 1.0);
}

#[test]
fn single_threaded_runs_are_deterministic() {
    let scene = Scene::ring(7, 12.0, 120, 9);
    let run = || {
        let controller = controller(scene.graph(), common::settings());
        controller.run().unwrap();
        let model = models(&controller).remove(0);
        (model.registered_images().to_vec(), model.num_tracks())
    };
    assert_eq!(run(), run());
}

#[test]
fn small_models_are_discarded() {
    common::init_logger();
    let scene = Scene::ring(10, 12.0, 150, 5);
    // The last two images only match each other.
    let graph = scene.graph_with(|a, b| (a < 8) == (b < 8));
    let controller = controller(graph, common::settings());
    let discarded = Arc::new(AtomicUsize::new(0));
    let counter = discarded.clone();
    controller.subscribe(EventKind::ModelDiscarded, move |event| {
        if let MapperEvent::ModelDiscarded {
            num_registered_images,
            ..
        } = event
        {
            assert!(*num_registered_images < 3);
            counter.fetch_add(1, Ordering::SeqCst);
        }
    });

    let summary = controller.run().unwrap();

    assert_eq!(summary.models, 1);
    assert_eq!(summary.registered_images, 8);
    assert!(summary.discarded_models >= 1);
    assert_eq!(discarded.load(Ordering::SeqCst), summary.discarded_models);
    let model = &models(&controller)[0];
    assert!(!model.is_registered(ImageId(8)));
    assert!(!model.is_registered(ImageId(9)));
}

#[test]
fn cancelled_runs_keep_consistent_models() {
    common::init_logger();
    let scene = Scene::ring(8, 12.0, 150, 6);
    let controller = Arc::new(controller(scene.graph(), common::settings()));
    let weak = Arc::downgrade(&controller);
    controller.subscribe(EventKind::ImageRegistered, move |_| {
        if let Some(controller) = weak.upgrade() {
            controller.cancel();
        }
    });

    controller.start().unwrap();
    assert_eq!(controller.start(), Err(MapperError::AlreadyRunning));
    let summary = controller.wait().unwrap();

    assert!(summary.cancelled);
    assert!(controller.is_cancelled());
    assert!(summary.registered_images < 8);
    for model in models(&controller) {
        model.sanity_check().unwrap();
    }
    assert_eq!(controller.wait(), Err(MapperError::NotStarted));
}

#[test]
fn existing_models_are_resumed() {
    let scene = Scene::ring(8, 12.0, 150, 8);
    let manager = Arc::new(RwLock::new(ReconstructionManager::new()));
    manager
        .write()
        .insert(scene.reconstruction(&[0, 1, 2], WorldToWorld::identity()));
    let controller = MapperController::new(Arc::new(scene.graph()), manager.clone(), common::settings());

    let summary = controller.run().unwrap();

    assert_eq!(summary.models, 1);
    assert_eq!(summary.registered_images, 8);
    let model = manager.read().get(0).unwrap();
    let model = model.read();
    assert_eq!(
        &model.registered_images()[..3],
        &[ImageId(0), ImageId(1), ImageId(2)]
    );
    model.sanity_check().unwrap();
}

#[test]
fn only_named_images_are_reconstructed() {
    let scene = Scene::ring(8, 12.0, 150, 10);
    let controller =
        controller(scene.graph(), common::settings()).image_names((0..5).map(Scene::name));

    let summary = controller.run().unwrap();

    assert_eq!(summary.registered_images, 5);
    for model in models(&controller) {
        assert!(model.registered_images().iter().all(|image| image.0 < 5));
    }
}

#[test]
fn graphs_without_pairs_are_rejected() {
    let scene = Scene::ring(4, 12.0, 50, 1);
    let controller = controller(scene.graph_with(|_, _| false), common::settings());
    assert_eq!(controller.run(), Err(MapperError::EmptyGraph));
    let controller = controller_without_images();
    assert_eq!(controller.run(), Err(MapperError::EmptyGraph));
}

fn controller_without_images() -> MapperController<CorrespondenceGraph> {
    controller(CorrespondenceGraph::new(), MapperSettings::default())
}

#[test]
fn too_few_matches_leave_no_seed_pair() {
    let scene = Scene::ring(4, 12.0, 10, 2);
    let controller = controller(scene.graph(), common::settings());
    assert_eq!(controller.run(), Err(MapperError::NoSeedPair));
    assert!(controller.manager().read().is_empty());
}

#[test]
fn waiting_requires_a_started_run() {
    let scene = Scene::ring(3, 12.0, 50, 1);
    let controller = controller(scene.graph(), common::settings());
    assert_eq!(controller.wait(), Err(MapperError::NotStarted));
}

#[test]
fn noisy_keypoints_and_outlier_matches_still_form_one_model() {
    common::init_logger();
    let mut scene = Scene::ring(8, 12.0, 150, 11);
    scene.perturb(0.7, 11);
    let graph = scene.graph_with_outliers(0.1, 11, |_, _| true);
    let controller = controller(graph, common::settings());

    let summary = controller.run().unwrap();

    assert_eq!(summary.models, 1);
    assert_eq!(summary.registered_images, 8);
    let model = &models(&controller)[0];
    model.sanity_check().unwrap();
    assert!(model.num_tracks() > 50);
    assert!(model.mean_reprojection_error() < 2.0);
}

fn candidate_ids(
    mapper: &IncrementalMapper<'_, CorrespondenceGraph>,
    model: &Reconstruction,
) -> Vec<ImageId> {
    mapper
        .candidates(model, |_| true)
        .iter()
        .map(|candidate| candidate.image)
        .collect()
}

#[test]
fn unregistrable_images_wait_for_growth_and_are_abandoned() {
    common::init_logger();
    let scene = Scene::ring(6, 12.0, 150, 12);
    let bad = ImageId(5);
    // Every match of the last image points at the wrong keypoint.
    let graph = scene.graph_with_outliers(1.0, 12, |a, b| a == 5 || b == 5);
    let settings = MapperSettings {
        max_reg_trials: 2,
        ..common::settings()
    };
    let mut mapper = IncrementalMapper::new(&graph, settings, 3);
    let mut model = Reconstruction::new();
    let pair = mapper.seed_pairs(|image| image != bad)[0];
    let seed = mapper.estimate_seed(pair.a, pair.b).unwrap();
    mapper.initialize(&mut model, &seed).unwrap();

    for trial in 1..=2 {
        assert!(candidate_ids(&mapper, &model).contains(&bad));
        assert!(!mapper.register_image(&mut model, bad).unwrap());
        assert_eq!(mapper.num_reg_trials(bad), trial);
        assert!(!model.is_registered(bad));

        // Skipped until the model grows.
        let candidates = candidate_ids(&mapper, &model);
        assert!(!candidates.contains(&bad));
        let good = candidates[0];
        assert!(mapper.register_image(&mut model, good).unwrap());
        mapper.triangulate_image(&mut model, good).unwrap();
    }

    // Abandoned after the second failure even though the model grew.
    let candidates = candidate_ids(&mapper, &model);
    assert!(!candidates.contains(&bad));
    assert!(!candidates.is_empty());
    assert_eq!(model.num_registered_images(), 4);
    model.sanity_check().unwrap();
}

#[test]
fn parallel_workers_keep_connected_images_in_one_model() {
    common::init_logger();
    let scene = Scene::ring(12, 10.0, 200, 21);
    // Two groups of six images without matches between them.
    let graph = scene.graph_with(|a, b| (a < 6) == (b < 6));
    let settings = MapperSettings {
        num_threads: 2,
        ..common::settings()
    };
    let controller = controller(graph, settings);

    let summary = controller.run().unwrap();

    assert_eq!(summary.models, 2);
    assert_eq!(summary.registered_images, 12);
    assert_eq!(summary.discarded_models, 0);
    for model in models(&controller) {
        model.sanity_check().unwrap();
        let first = model.registered_images().iter().filter(|image| image.0 < 6).count();
        assert!(first == 0 || first == model.num_registered_images());
        assert_eq!(model.num_registered_images(), 6);
    }
}

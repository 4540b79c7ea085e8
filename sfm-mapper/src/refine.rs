use crate::{
    CameraId, Correspondences, FilterStats, ImageId, IncrementalMapper, MapperSettings,
    Reconstruction, SceneError, TrackKey, TriangulationStats,
};
use log::*;
use sfm_core::Pose;
use sfm_optimize::{
    BundleAdjuster, BundleError, BundleProblem, CameraBlock, LevenbergMarquardtAdjuster,
    ObservationBlock, PointBlock, PoseBlock,
};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefinementKind {
    /// The most recently registered images and the tracks they observe.
    Local,
    /// Every registered image and every track.
    Global,
}

/// What one refinement pass did.
#[derive(Debug, Clone, PartialEq)]
pub struct RefinementReport {
    pub kind: RefinementKind,
    /// Images whose pose was free.
    pub num_images: usize,
    pub num_tracks: usize,
    pub initial_cost: f64,
    pub final_cost: f64,
    /// The optimizer failed and nothing was written back.
    pub skipped: bool,
    pub filtered: FilterStats,
    /// Images deregistered because their camera became implausible.
    pub deregistered: Vec<ImageId>,
    pub retriangulated: TriangulationStats,
}

impl RefinementReport {
    fn new(kind: RefinementKind) -> Self {
        Self {
            kind,
            num_images: 0,
            num_tracks: 0,
            initial_cost: 0.0,
            final_cost: 0.0,
            skipped: false,
            filtered: FilterStats::default(),
            deregistered: vec![],
            retriangulated: TriangulationStats::default(),
        }
    }
}

/// Decides when to bundle adjust a growing model and over which part of it.
///
/// Local passes refine the last `local_ba_num_images` registered images with every other pose
/// held constant. A global pass refines everything and runs whenever the number of registered
/// images or tracks grew by the configured ratio since the previous global pass.
///
/// The first two registered images fix the gauge: the first is held constant and the largest
/// translation component of the second is held constant.
pub struct RefinementScheduler {
    settings: MapperSettings,
    local_adjuster: Arc<dyn BundleAdjuster>,
    global_adjuster: Arc<dyn BundleAdjuster>,
    last_global_images: usize,
    last_global_tracks: usize,
}

impl RefinementScheduler {
    pub fn new(settings: MapperSettings) -> Self {
        Self {
            settings,
            local_adjuster: Arc::new(
                LevenbergMarquardtAdjuster::new().patience(settings.local_ba_patience),
            ),
            global_adjuster: Arc::new(
                LevenbergMarquardtAdjuster::new().patience(settings.global_ba_patience),
            ),
            last_global_images: 0,
            last_global_tracks: 0,
        }
    }

    /// Use the same optimizer for local and global passes.
    #[must_use]
    pub fn adjuster(self, adjuster: Arc<dyn BundleAdjuster>) -> Self {
        Self {
            local_adjuster: adjuster.clone(),
            global_adjuster: adjuster,
            ..self
        }
    }

    /// Whether the model grew enough since the last global pass.
    pub fn should_run_global(&self, reconstruction: &Reconstruction) -> bool {
        let images = reconstruction.num_registered_images() as f64;
        let tracks = reconstruction.num_tracks() as f64;
        images >= self.settings.global_ba_images_ratio * self.last_global_images as f64
            || tracks >= self.settings.global_ba_points_ratio * self.last_global_tracks as f64
    }

    /// Refine after an image was registered and triangulated.
    ///
    /// Runs a local pass once three images are registered, followed by a global pass if the
    /// model grew enough.
    pub fn refine_after_registration<G>(
        &mut self,
        reconstruction: &mut Reconstruction,
        mapper: &mut IncrementalMapper<'_, G>,
    ) -> Result<Vec<RefinementReport>, SceneError>
    where
        G: Correspondences + ?Sized,
    {
        let mut reports = vec![];
        if reconstruction.num_registered_images() >= 3 {
            reports.push(self.local_refine(reconstruction, mapper)?);
        }
        if self.should_run_global(reconstruction) {
            reports.push(self.global_refine(reconstruction, mapper)?);
        }
        Ok(reports)
    }

    /// Refine the most recently registered images and the tracks they observe.
    pub fn local_refine<G>(
        &mut self,
        reconstruction: &mut Reconstruction,
        mapper: &mut IncrementalMapper<'_, G>,
    ) -> Result<RefinementReport, SceneError>
    where
        G: Correspondences + ?Sized,
    {
        let registered = reconstruction.registered_images();
        let first = registered
            .len()
            .saturating_sub(self.settings.local_ba_num_images);
        let images: BTreeSet<ImageId> = registered[first..].iter().copied().collect();
        let tracks: Vec<TrackKey> = images
            .iter()
            .filter_map(|&image| reconstruction.image(image))
            .flat_map(|image| image.observations().map(|(_, track)| track))
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        let mut report = RefinementReport::new(RefinementKind::Local);
        report.num_images = images.len();
        report.num_tracks = tracks.len();
        adjust(
            reconstruction,
            &*self.local_adjuster,
            &self.settings,
            &images,
            &tracks,
            false,
            &mut report,
        )?;

        // Refined poses may connect the tracks to further correspondences.
        let completed = mapper.complete_and_merge_tracks(reconstruction, tracks.iter().copied())?;
        report.retriangulated = completed;
        report.filtered = mapper.filter_tracks(reconstruction, tracks)?;
        info!(
            "local refinement of {} images and {} tracks: cost {} -> {}, filtered {} observations and {} tracks",
            report.num_images,
            report.num_tracks,
            report.initial_cost,
            report.final_cost,
            report.filtered.observations,
            report.filtered.tracks
        );
        Ok(report)
    }

    /// Refine the whole model, then filter, drop implausible cameras, and retriangulate.
    pub fn global_refine<G>(
        &mut self,
        reconstruction: &mut Reconstruction,
        mapper: &mut IncrementalMapper<'_, G>,
    ) -> Result<RefinementReport, SceneError>
    where
        G: Correspondences + ?Sized,
    {
        let mut report = global_adjust(reconstruction, &*self.global_adjuster, &self.settings)?;
        report.deregistered = mapper.filter_images(reconstruction)?;
        report.retriangulated = mapper.retriangulate(reconstruction)?;
        let tracks = reconstruction.track_keys();
        report.filtered += mapper.filter_tracks(reconstruction, tracks)?;

        self.last_global_images = reconstruction.num_registered_images();
        self.last_global_tracks = reconstruction.num_tracks();
        info!(
            "global refinement of {} images and {} tracks: cost {} -> {}, retriangulated {} tracks, now {} tracks",
            report.num_images,
            report.num_tracks,
            report.initial_cost,
            report.final_cost,
            report.retriangulated.created,
            self.last_global_tracks
        );
        Ok(report)
    }
}

/// Globally bundle adjust a reconstruction outside of the mapper, then deregister images with
/// implausible cameras and filter the tracks.
///
/// Unlike [`RefinementScheduler::global_refine`] this needs no correspondences, so nothing is
/// retriangulated.
pub fn refine_reconstruction(
    reconstruction: &mut Reconstruction,
    adjuster: &dyn BundleAdjuster,
    settings: &MapperSettings,
) -> Result<RefinementReport, SceneError> {
    let mut report = global_adjust(reconstruction, adjuster, settings)?;
    report.deregistered = reconstruction.filter_bogus_images(
        settings.min_focal_length_ratio,
        settings.max_focal_length_ratio,
        settings.max_extra_param,
    )?;
    Ok(report)
}

fn global_adjust(
    reconstruction: &mut Reconstruction,
    adjuster: &dyn BundleAdjuster,
    settings: &MapperSettings,
) -> Result<RefinementReport, SceneError> {
    let images: BTreeSet<ImageId> = reconstruction.registered_images().iter().copied().collect();
    let tracks = reconstruction.track_keys();
    let mut report = RefinementReport::new(RefinementKind::Global);
    report.num_images = images.len();
    report.num_tracks = tracks.len();
    adjust(
        reconstruction,
        adjuster,
        settings,
        &images,
        &tracks,
        true,
        &mut report,
    )?;
    report.filtered = reconstruction.filter_all_tracks(
        settings.max_reproj_error,
        settings.min_tri_angle.to_radians(),
    )?;
    Ok(report)
}

/// Where each block of a problem came from.
#[derive(Default)]
struct ProblemLayout {
    cameras: Vec<CameraId>,
    poses: Vec<ImageId>,
    points: Vec<TrackKey>,
}

/// Build the problem over `tracks` with the poses of `images` free, solve it and write back.
///
/// If the optimizer fails the report is marked as skipped and the reconstruction is unchanged.
fn adjust(
    reconstruction: &mut Reconstruction,
    adjuster: &dyn BundleAdjuster,
    settings: &MapperSettings,
    images: &BTreeSet<ImageId>,
    tracks: &[TrackKey],
    refine_cameras: bool,
    report: &mut RefinementReport,
) -> Result<(), SceneError> {
    let (problem, layout) = build_problem(reconstruction, settings, images, tracks, refine_cameras)?;
    let solution = match adjuster.adjust(&problem) {
        Ok(solution) => solution,
        Err(BundleError::EmptyProblem) => {
            debug!("nothing to refine");
            return Ok(());
        }
        Err(err) => {
            warn!("bundle adjustment failed, keeping the previous poses and points: {}", err);
            report.skipped = true;
            return Ok(());
        }
    };
    report.initial_cost = solution.report.initial_cost;
    report.final_cost = solution.report.final_cost;

    for ((&image, block), pose) in layout.poses.iter().zip(&problem.poses).zip(solution.poses) {
        if !block.constant {
            reconstruction.set_pose(image, pose)?;
        }
    }
    for ((&camera, block), intrinsics) in layout
        .cameras
        .iter()
        .zip(&problem.cameras)
        .zip(solution.cameras)
    {
        if block.free_params.is_empty() {
            continue;
        }
        if let Some(current) = reconstruction.camera_mut(camera) {
            *current = intrinsics;
        }
    }
    for (&key, point) in layout.points.iter().zip(solution.points) {
        if let Some(track) = reconstruction.track_mut(key) {
            track.point = point;
        }
        reconstruction.update_track_error(key);
    }
    Ok(())
}

fn build_problem(
    reconstruction: &Reconstruction,
    settings: &MapperSettings,
    images: &BTreeSet<ImageId>,
    tracks: &[TrackKey],
    refine_cameras: bool,
) -> Result<(BundleProblem, ProblemLayout), SceneError> {
    let registered = reconstruction.registered_images();
    let gauge_origin = registered.first().copied();
    let gauge_scale = registered.get(1).copied();

    let mut problem = BundleProblem::new();
    let mut layout = ProblemLayout::default();
    let mut camera_indices: BTreeMap<CameraId, usize> = BTreeMap::new();
    let mut pose_indices: BTreeMap<ImageId, usize> = BTreeMap::new();

    for &key in tracks {
        let track = reconstruction
            .track(key)
            .ok_or(SceneError::UnknownTrack(key))?;
        let point = problem.add_point(PointBlock {
            point: track.point,
            constant: false,
        });
        layout.points.push(key);

        for observation in track.observations() {
            let image = reconstruction
                .image(observation.image)
                .ok_or(SceneError::UnknownImage(observation.image))?;
            let pose = match pose_indices.get(&observation.image) {
                Some(&pose) => pose,
                None => {
                    let camera = match camera_indices.get(&image.camera()) {
                        Some(&camera) => camera,
                        None => {
                            let intrinsics = reconstruction
                                .camera(image.camera())
                                .ok_or(SceneError::UnknownCamera(image.camera()))?;
                            let free_params = if refine_cameras {
                                free_camera_params(settings, intrinsics.model())
                            } else {
                                vec![]
                            };
                            let camera = problem.add_camera(CameraBlock {
                                intrinsics: intrinsics.clone(),
                                free_params,
                            });
                            layout.cameras.push(image.camera());
                            camera_indices.insert(image.camera(), camera);
                            camera
                        }
                    };
                    let pose = image
                        .pose()
                        .ok_or(SceneError::ImageNotRegistered(observation.image))?;
                    let constant = !images.contains(&observation.image)
                        || Some(observation.image) == gauge_origin;
                    let constant_translation = if Some(observation.image) == gauge_scale {
                        Some(largest_component(pose))
                    } else {
                        None
                    };
                    let index = problem.add_pose(PoseBlock {
                        pose,
                        camera,
                        constant,
                        constant_translation,
                    });
                    layout.poses.push(observation.image);
                    pose_indices.insert(observation.image, index);
                    index
                }
            };
            let keypoint = image
                .keypoint(observation.keypoint)
                .ok_or(SceneError::KeypointOutOfRange {
                    image: observation.image,
                    keypoint: observation.keypoint,
                    num_keypoints: image.num_keypoints(),
                })?;
            problem.add_observation(ObservationBlock {
                pose,
                point,
                keypoint,
            });
        }
    }
    Ok((problem, layout))
}

fn free_camera_params(settings: &MapperSettings, model: sfm_core::CameraModelId) -> Vec<usize> {
    let mut free = vec![];
    if settings.ba_refine_focal_length {
        free.extend_from_slice(model.focal_length_indices());
    }
    if settings.ba_refine_principal_point {
        free.extend_from_slice(model.principal_point_indices());
    }
    if settings.ba_refine_extra_params {
        free.extend_from_slice(model.extra_params_indices());
    }
    free
}

/// The translation component with the largest magnitude, which fixes the scale best.
fn largest_component(pose: sfm_core::WorldToCamera) -> usize {
    let translation = pose.isometry().translation.vector;
    translation.iamax()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{CameraId, Image, Observation};
    use sfm_core::nalgebra::{Point3, Rotation3, Vector3};
    use sfm_core::{
        CameraIntrinsics, CameraModelId, KeyPoint, Projective, WorldPoint, WorldToCamera,
    };

    fn two_view_model() -> Reconstruction {
        let camera =
            CameraIntrinsics::from_focal_length(CameraModelId::SimplePinhole, 500.0, 640, 480)
                .unwrap();
        let poses = [
            WorldToCamera::identity(),
            WorldToCamera::from_parts(Vector3::new(-1.0, 0.0, 0.0), Rotation3::identity()),
        ];
        let points: Vec<Point3<f64>> = (0..12)
            .map(|i| Point3::new(f64::from(i % 4) * 0.5 - 0.5, f64::from(i / 4) * 0.5 - 0.5, 6.0))
            .collect();
        let mut model = Reconstruction::new();
        model.add_camera(CameraId(0), camera.clone()).unwrap();
        for (id, pose) in poses.iter().enumerate() {
            let keypoints: Vec<KeyPoint> = points
                .iter()
                .map(|&p| camera.project(pose.transform(WorldPoint::from_point(p))).unwrap())
                .collect();
            let id = ImageId(id as u32);
            model.add_image(id, Image::new("", CameraId(0), keypoints)).unwrap();
            model.register_image(id, *pose).unwrap();
        }
        for (keypoint, &point) in points.iter().enumerate() {
            model
                .add_track(
                    point,
                    [
                        Observation::new(ImageId(0), keypoint),
                        Observation::new(ImageId(1), keypoint),
                    ],
                    [0; 3],
                )
                .unwrap();
        }
        model
    }

    #[test]
    fn gauge_fixes_first_pose_and_one_translation() {
        let model = two_view_model();
        let images = model.registered_images().iter().copied().collect();
        let (problem, layout) = build_problem(
            &model,
            &MapperSettings::default(),
            &images,
            &model.track_keys(),
            true,
        )
        .unwrap();
        assert_eq!(layout.poses, vec![ImageId(0), ImageId(1)]);
        assert!(problem.poses[0].constant);
        assert!(!problem.poses[1].constant);
        assert_eq!(problem.poses[1].constant_translation, Some(0));
        assert_eq!(problem.cameras[0].free_params, vec![0]);
        assert_eq!(problem.observations.len(), 24);
    }

    struct FailingAdjuster;

    impl BundleAdjuster for FailingAdjuster {
        fn adjust(
            &self,
            _: &BundleProblem,
        ) -> Result<sfm_optimize::BundleSolution, BundleError> {
            Err(BundleError::NonConvergence("test".to_owned()))
        }
    }

    #[test]
    fn failed_refinement_keeps_the_model() {
        let mut model = two_view_model();
        let before = model.clone();
        let report =
            refine_reconstruction(&mut model, &FailingAdjuster, &MapperSettings::default()).unwrap();
        assert!(report.skipped);
        assert_eq!(report.filtered, FilterStats::default());
        assert_eq!(model.image(ImageId(1)).unwrap().pose(), before.image(ImageId(1)).unwrap().pose());
        assert_eq!(model.num_tracks(), before.num_tracks());
    }

    #[test]
    fn standalone_refinement_drops_images_with_bogus_cameras() {
        let mut model = two_view_model();
        model.add_camera(CameraId(1), bogus_camera()).unwrap();
        let keypoints = model.image(ImageId(1)).unwrap().keypoints().to_vec();
        model
            .add_image(ImageId(2), Image::new("bogus", CameraId(1), keypoints))
            .unwrap();
        model
            .register_image(ImageId(2), model.image(ImageId(1)).unwrap().pose().unwrap())
            .unwrap();

        let report =
            refine_reconstruction(&mut model, &FailingAdjuster, &MapperSettings::default()).unwrap();

        assert_eq!(report.deregistered, vec![ImageId(2)]);
        assert!(!model.is_registered(ImageId(2)));
        assert!(model.is_registered(ImageId(1)));
        model.sanity_check().unwrap();
    }

    /// A camera whose focal length is far below the image size.
    fn bogus_camera() -> CameraIntrinsics {
        CameraIntrinsics::from_focal_length(CameraModelId::SimplePinhole, 10.0, 640, 480).unwrap()
    }

    #[test]
    fn refinement_restores_a_perturbed_point() {
        let _ = pretty_env_logger::try_init_timed();
        let mut model = two_view_model();
        let key = model.track_keys()[5];
        model.track_mut(key).unwrap().point += Vector3::new(0.01, -0.02, 0.05);
        let report = refine_reconstruction(
            &mut model,
            &LevenbergMarquardtAdjuster::new(),
            &MapperSettings::default(),
        )
        .unwrap();
        assert!(!report.skipped);
        assert_eq!(model.num_tracks(), 12);
        assert!(model.mean_reprojection_error() < 1e-3);
        model.sanity_check().unwrap();
    }
}

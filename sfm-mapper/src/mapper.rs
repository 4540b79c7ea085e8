use crate::{
    reprojection_error, Correspondence, Correspondences, FilterStats, Image, ImageId,
    MapperSettings, Observation, Reconstruction, SceneError, TrackKey,
};
use arrsac::Arrsac;
use float_ord::FloatOrd;
use itertools::Itertools;
use log::*;
use rand::SeedableRng;
use rand_xoshiro::Xoshiro256PlusPlus;
use sfm_core::nalgebra::{Point3, UnitVector3};
use sfm_core::sample_consensus::Consensus;
use sfm_core::{
    CameraIntrinsics, CameraModel, CameraToCamera, FeatureMatch, FeatureWorldMatch, KeyPoint,
    Pose, Projective, TriangulatorObservations, WorldPoint, WorldToCamera,
};
use sfm_geom::triangulation::{max_triangulation_angle, LinearEigenTriangulator};
use sfm_geom::{EightPoint, LambdaTwist};
use sfm_optimize::{refine_pose, BundleAdjuster, CameraBlock, LevenbergMarquardtAdjuster};
use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

#[cfg(feature = "rayon")]
use rayon::prelude::*;

/// A pair of images a model could be started from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SeedPair {
    pub a: ImageId,
    pub b: ImageId,
    pub num_matches: usize,
}

/// A match of a seed pair that triangulated within the seeding thresholds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SeedPoint {
    pub a_keypoint: usize,
    pub b_keypoint: usize,
    pub point: Point3<f64>,
    /// Triangulation angle in degrees.
    pub angle: f64,
}

/// The two-view reconstruction a model is seeded with.
///
/// Image `a` is at the origin and image `b` is at `relative_pose`.
#[derive(Debug, Clone, PartialEq)]
pub struct SeedGeometry {
    pub a: ImageId,
    pub b: ImageId,
    pub relative_pose: CameraToCamera,
    pub points: Vec<SeedPoint>,
    /// Median triangulation angle of the points in degrees.
    pub median_angle: f64,
}

/// An unregistered image scored by how well it connects to the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Candidate {
    pub image: ImageId,
    /// Keypoints with a correspondence to a keypoint that belongs to a track.
    pub num_visible_points: usize,
    pub num_correspondences: usize,
}

/// Counts of what triangulation did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TriangulationStats {
    /// New tracks.
    pub created: usize,
    /// Keypoints added to the track a correspondence already belonged to.
    pub continued: usize,
    /// Tracks united with another track.
    pub merged: usize,
    /// Observations added to a track from correspondences of its observations.
    pub completed: usize,
}

/// Grows one model: seeding, next image selection, registration and triangulation.
///
/// The mapper keeps the per-model bookkeeping of failed registrations, while the scene itself
/// lives in the [`Reconstruction`] passed to each operation.
pub struct IncrementalMapper<'a, G: ?Sized> {
    graph: &'a G,
    settings: MapperSettings,
    adjuster: Arc<dyn BundleAdjuster>,
    triangulator: LinearEigenTriangulator,
    pose_estimator: LambdaTwist,
    essential_estimator: EightPoint,
    rng: Xoshiro256PlusPlus,
    /// Failed registrations of each image in this model.
    num_reg_trials: BTreeMap<ImageId, usize>,
    /// Images that failed registration since the model last grew.
    failed_since_growth: BTreeSet<ImageId>,
}

impl<'a, G> IncrementalMapper<'a, G>
where
    G: Correspondences + ?Sized,
{
    pub fn new(graph: &'a G, settings: MapperSettings, seed: u64) -> Self {
        Self {
            graph,
            settings,
            adjuster: Arc::new(LevenbergMarquardtAdjuster::new().patience(settings.local_ba_patience)),
            triangulator: LinearEigenTriangulator::new(),
            pose_estimator: LambdaTwist::new(),
            essential_estimator: EightPoint::new(),
            rng: Xoshiro256PlusPlus::seed_from_u64(seed),
            num_reg_trials: BTreeMap::new(),
            failed_since_growth: BTreeSet::new(),
        }
    }

    /// The optimizer used to refine registered poses.
    #[must_use]
    pub fn adjuster(self, adjuster: Arc<dyn BundleAdjuster>) -> Self {
        Self { adjuster, ..self }
    }

    pub fn settings(&self) -> &MapperSettings {
        &self.settings
    }

    /// Image pairs with enough matches to seed from, best first.
    ///
    /// Pairs are ordered by match count and then by pair id.
    pub fn seed_pairs(&self, available: impl Fn(ImageId) -> bool) -> Vec<SeedPair> {
        self.graph
            .image_pairs()
            .into_iter()
            .filter(|pair| available(pair.a) && available(pair.b))
            .filter(|pair| pair.matches.len() >= self.settings.init_min_num_inliers)
            .map(|pair| SeedPair {
                a: pair.a,
                b: pair.b,
                num_matches: pair.matches.len(),
            })
            .sorted_by_key(|pair| (Reverse(pair.num_matches), crate::pair_id(pair.a, pair.b)))
            .collect()
    }

    /// Estimate and verify the two-view geometry of a seed pair.
    ///
    /// The relative pose comes from the correspondence graph if it has one, and otherwise from
    /// the essential matrix. The pair is rejected unless enough matches triangulate within
    /// `init_max_error` with a wide enough median angle and the motion is not purely forward.
    pub fn estimate_seed(&mut self, a: ImageId, b: ImageId) -> Option<SeedGeometry> {
        let graph = self.graph;
        let image_a = graph.image(a)?;
        let image_b = graph.image(b)?;
        let camera_a = graph.camera(image_a.camera)?;
        let camera_b = graph.camera(image_b.camera)?;

        // Calibrate every match into a pair of bearings.
        let (keypoints, bearings): (Vec<(usize, usize)>, Vec<FeatureMatch>) = graph
            .matches(a, b)
            .into_iter()
            .filter_map(|(ka, kb)| {
                let bearing_a = camera_a.calibrate(*image_a.keypoints.get(ka)?);
                let bearing_b = camera_b.calibrate(*image_b.keypoints.get(kb)?);
                Some(((ka, kb), FeatureMatch(bearing_a, bearing_b)))
            })
            .unzip();

        let relative_pose = match graph.relative_pose(a, b) {
            Some(pose) => pose,
            None => {
                let focal = 0.5 * (camera_a.focal_length() + camera_b.focal_length());
                let mut arrsac = Arrsac::new(self.settings.init_max_error / focal, &mut self.rng);
                let (essential, inliers) =
                    arrsac.model_inliers(&self.essential_estimator, bearings.iter().copied())?;
                debug!(
                    "seed pair {} {}: essential matrix has {} of {} inliers",
                    a,
                    b,
                    inliers.len(),
                    bearings.len()
                );
                let (pose, _) = essential.solve_pose(
                    &self.triangulator,
                    inliers.iter().map(|&ix| bearings[ix]),
                    1e-12,
                    1000,
                )?;
                pose
            }
        };

        let pose_a = WorldToCamera::identity();
        let pose_b = WorldToCamera(relative_pose.0);
        let center_a = pose_a.center();
        let center_b = pose_b.center();

        // Reject forward motion, which triangulates poorly.
        let baseline = center_b - center_a;
        if baseline.norm() <= f64::EPSILON {
            debug!("seed pair {} {} has no baseline", a, b);
            return None;
        }
        let forward_motion = baseline.normalize().dot(&pose_a.viewing_direction()).abs();
        if forward_motion > self.settings.init_max_forward_motion {
            debug!(
                "seed pair {} {} moves forward by {}, rejecting",
                a, b, forward_motion
            );
            return None;
        }

        // Triangulate every match and keep the ones within the seeding error.
        let mut points = vec![];
        for (&(ka, kb), &FeatureMatch(bearing_a, bearing_b)) in keypoints.iter().zip(&bearings) {
            let pairs = [(pose_a, bearing_a), (pose_b, bearing_b)];
            let point = match self
                .triangulator
                .triangulate_observations(pairs.iter().copied())
                .and_then(WorldPoint::point)
            {
                Some(point) => point,
                None => continue,
            };
            let within = |camera: &CameraIntrinsics, pose: WorldToCamera, keypoint: KeyPoint| {
                reprojection_error(camera, pose, &point, keypoint)
                    .map_or(false, |error| error <= self.settings.init_max_error)
            };
            if !within(camera_a, pose_a, image_a.keypoints[ka])
                || !within(camera_b, pose_b, image_b.keypoints[kb])
            {
                continue;
            }
            let angle = sfm_geom::triangulation::triangulation_angle(&center_a, &center_b, &point)
                .to_degrees();
            points.push(SeedPoint {
                a_keypoint: ka,
                b_keypoint: kb,
                point,
                angle,
            });
        }

        if points.len() < self.settings.init_min_num_inliers {
            debug!(
                "seed pair {} {} triangulated {} points, {} required",
                a,
                b,
                points.len(),
                self.settings.init_min_num_inliers
            );
            return None;
        }
        let median_angle = median(points.iter().map(|p| p.angle));
        if median_angle < self.settings.init_min_tri_angle {
            debug!(
                "seed pair {} {} has a median triangulation angle of {} degrees, rejecting",
                a, b, median_angle
            );
            return None;
        }

        info!(
            "seed pair {} {} triangulated {} points with median angle {} degrees",
            a,
            b,
            points.len(),
            median_angle
        );
        Some(SeedGeometry {
            a,
            b,
            relative_pose,
            points,
            median_angle,
        })
    }

    /// Register both images of a seed pair and create its tracks.
    ///
    /// Returns the number of tracks created. If none could be created, both images are
    /// deregistered again and the model stays empty.
    pub fn initialize(
        &mut self,
        reconstruction: &mut Reconstruction,
        seed: &SeedGeometry,
    ) -> Result<usize, SceneError> {
        if !self.ensure_image(reconstruction, seed.a)? || !self.ensure_image(reconstruction, seed.b)? {
            return Ok(0);
        }
        reconstruction.register_image(seed.a, WorldToCamera::identity())?;
        reconstruction.register_image(seed.b, WorldToCamera(seed.relative_pose.0))?;

        let min_tri_angle = self.settings.min_tri_angle;
        let mut created = 0;
        for point in seed.points.iter().filter(|p| p.angle >= min_tri_angle) {
            let observations = [
                Observation::new(seed.a, point.a_keypoint),
                Observation::new(seed.b, point.b_keypoint),
            ];
            // Keypoints matched more than once only seed their first track.
            if reconstruction.check_track(&point.point, &observations).is_err() {
                continue;
            }
            let color = self.color(&observations);
            reconstruction.add_track(point.point, observations, color)?;
            created += 1;
        }

        if created == 0 {
            warn!("seed pair {} {} produced no tracks", seed.a, seed.b);
            reconstruction.deregister_image(seed.a)?;
            reconstruction.deregister_image(seed.b)?;
        } else {
            info!(
                "initialized model from images {} and {} with {} tracks",
                seed.a, seed.b, created
            );
        }
        Ok(created)
    }

    /// Unregistered images connected to the model, best first.
    ///
    /// Candidates are ordered by visible points, then total correspondences, then image id.
    /// Images that failed since the model last grew, or failed `max_reg_trials` times, are left
    /// out.
    pub fn candidates(
        &self,
        reconstruction: &Reconstruction,
        available: impl Fn(ImageId) -> bool,
    ) -> Vec<Candidate> {
        let ids: Vec<ImageId> = self
            .graph
            .image_ids()
            .into_iter()
            .filter(|&image| !reconstruction.is_registered(image) && available(image))
            .filter(|image| !self.failed_since_growth.contains(image))
            .filter(|image| {
                self.num_reg_trials
                    .get(image)
                    .map_or(true, |&trials| trials < self.settings.max_reg_trials)
            })
            .collect();

        #[cfg(feature = "rayon")]
        let candidates = ids.par_iter();
        #[cfg(not(feature = "rayon"))]
        let candidates = ids.iter();

        let mut candidates: Vec<Candidate> = candidates
            .map(|&image| self.score(reconstruction, image))
            .filter(|candidate| candidate.num_visible_points > 0)
            .collect();
        candidates.sort_by_key(|c| {
            (
                Reverse(c.num_visible_points),
                Reverse(c.num_correspondences),
                c.image,
            )
        });
        candidates
    }

    fn score(&self, reconstruction: &Reconstruction, image: ImageId) -> Candidate {
        let num_keypoints = self.graph.image(image).map_or(0, |i| i.keypoints.len());
        let num_visible_points = (0..num_keypoints)
            .filter(|&keypoint| {
                self.graph
                    .correspondences(image, keypoint)
                    .iter()
                    .any(|c| reconstruction.image_track(c.image, c.keypoint).is_some())
            })
            .count();
        Candidate {
            image,
            num_visible_points,
            num_correspondences: self.graph.num_correspondences(image),
        }
    }

    /// Estimate the pose of an image from its correspondences to tracks and register it.
    ///
    /// Returns `false` if the image could not be registered. The failure is recorded so that
    /// the image is skipped until the model grows, and abandoned after `max_reg_trials`.
    pub fn register_image(
        &mut self,
        reconstruction: &mut Reconstruction,
        image: ImageId,
    ) -> Result<bool, SceneError> {
        if !self.ensure_image(reconstruction, image)? {
            self.record_failure(image);
            return Ok(false);
        }
        let (camera, keypoints) = match reconstruction.image(image) {
            Some(i) => match reconstruction.camera(i.camera()) {
                Some(camera) => (camera.clone(), i.keypoints().to_vec()),
                None => return Err(SceneError::UnknownCamera(i.camera())),
            },
            None => return Err(SceneError::UnknownImage(image)),
        };

        // Find every keypoint with a correspondence to a track.
        let graph = self.graph;
        let scene: &Reconstruction = reconstruction;
        let correspondences: Vec<(usize, TrackKey)> = (0..keypoints.len())
            .flat_map(|keypoint| {
                graph
                    .correspondences(image, keypoint)
                    .iter()
                    .filter_map(move |c| {
                        scene
                            .image_track(c.image, c.keypoint)
                            .map(|track| (keypoint, track))
                    })
            })
            .sorted()
            .dedup()
            .collect();
        let min_inliers = self.settings.abs_pose_min_num_inliers;
        if correspondences.len() < min_inliers {
            debug!(
                "image {} has {} correspondences to tracks, {} required",
                image,
                correspondences.len(),
                min_inliers
            );
            self.record_failure(image);
            return Ok(false);
        }

        let points: Vec<Point3<f64>> = correspondences
            .iter()
            .filter_map(|&(_, track)| reconstruction.track(track).map(|t| t.point))
            .collect();
        let matches: Vec<FeatureWorldMatch> = correspondences
            .iter()
            .zip(&points)
            .map(|(&(keypoint, _), &point)| {
                FeatureWorldMatch(
                    camera.calibrate(keypoints[keypoint]),
                    WorldPoint::from_point(point),
                )
            })
            .collect();

        // The pose residual is one minus the cosine of the angle between bearings.
        let max_angle = self.settings.abs_pose_max_error / camera.focal_length();
        let consensus = {
            let mut arrsac = Arrsac::new(1.0 - max_angle.cos(), &mut self.rng);
            arrsac.model_inliers(&self.pose_estimator, matches.iter().copied())
        };
        let (pose, inliers) = match consensus {
            Some(found) => found,
            None => {
                debug!("image {}: absolute pose consensus failed", image);
                self.record_failure(image);
                return Ok(false);
            }
        };
        debug!(
            "image {}: absolute pose consensus found {} of {} inliers",
            image,
            inliers.len(),
            matches.len()
        );

        let mut pose = pose;
        if self.settings.abs_pose_refine && inliers.len() >= min_inliers {
            let inlier_correspondences = inliers
                .iter()
                .map(|&ix| (keypoints[correspondences[ix].0], points[ix]));
            match refine_pose(
                &*self.adjuster,
                CameraBlock::constant(camera.clone()),
                pose,
                inlier_correspondences,
            ) {
                Ok((refined, _, report)) => {
                    debug!(
                        "image {}: pose refinement reduced cost from {} to {}",
                        image, report.initial_cost, report.final_cost
                    );
                    pose = refined;
                }
                Err(err) => warn!("image {}: pose refinement failed: {}", image, err),
            }
        }

        // Count the inliers in pixels against the final pose.
        let inliers: Vec<(usize, TrackKey)> = correspondences
            .iter()
            .zip(&points)
            .filter(|&(&(keypoint, _), point)| {
                reprojection_error(&camera, pose, point, keypoints[keypoint])
                    .map_or(false, |error| error <= self.settings.abs_pose_max_error)
            })
            .map(|(&correspondence, _)| correspondence)
            .collect();
        let inlier_ratio = inliers.len() as f64 / correspondences.len() as f64;
        if inliers.len() < min_inliers || inlier_ratio < self.settings.abs_pose_min_inlier_ratio {
            debug!(
                "image {}: {} inliers with ratio {} are not enough",
                image,
                inliers.len(),
                inlier_ratio
            );
            self.record_failure(image);
            return Ok(false);
        }

        reconstruction.register_image(image, pose)?;

        // Continue the tracks of the inliers through this image.
        for (keypoint, track) in inliers.iter().copied() {
            let free = reconstruction.image_track(image, keypoint).is_none();
            let new_image = reconstruction
                .track(track)
                .map_or(false, |t| !t.observes(image));
            if free && new_image {
                reconstruction.add_observation(track, Observation::new(image, keypoint))?;
            }
        }

        self.failed_since_growth.clear();
        info!(
            "registered image {} with {} of {} correspondences as inliers",
            image,
            inliers.len(),
            correspondences.len()
        );
        Ok(true)
    }

    /// Number of failed registrations of an image in this model.
    pub fn num_reg_trials(&self, image: ImageId) -> usize {
        self.num_reg_trials.get(&image).copied().unwrap_or(0)
    }

    fn record_failure(&mut self, image: ImageId) {
        let trials = self.num_reg_trials.entry(image).or_insert(0);
        *trials += 1;
        self.failed_since_growth.insert(image);
        if *trials >= self.settings.max_reg_trials {
            warn!(
                "image {} failed to register {} times, abandoning it for this model",
                image, trials
            );
        }
    }

    /// Triangulate the keypoints of a registered image.
    ///
    /// Keypoints continue the tracks of their correspondences when they agree with them, and
    /// otherwise form new tracks with corresponding keypoints that belong to no track. Every
    /// track of the image is then completed with further correspondences and merged with
    /// tracks it connects to.
    pub fn triangulate_image(
        &mut self,
        reconstruction: &mut Reconstruction,
        image: ImageId,
    ) -> Result<TriangulationStats, SceneError> {
        let mut stats = TriangulationStats::default();
        let num_keypoints = match reconstruction.image(image) {
            Some(i) if i.is_registered() => i.num_keypoints(),
            _ => return Ok(stats),
        };
        for keypoint in 0..num_keypoints {
            let track = match reconstruction.image_track(image, keypoint) {
                Some(track) => Some(track),
                None => self.triangulate_keypoint(reconstruction, image, keypoint, &mut stats)?,
            };
            if let Some(track) = track {
                self.complete_track(reconstruction, track, true, &mut stats)?;
            }
        }
        info!(
            "image {}: created {}, continued {}, merged {} and completed {} tracks",
            image, stats.created, stats.continued, stats.merged, stats.completed
        );
        Ok(stats)
    }

    /// Try again to triangulate every free keypoint of every registered image.
    ///
    /// After refinement moved the poses, correspondences that were rejected for their angle or
    /// error may now form tracks. Tracks are completed but never merged here, so the number of
    /// tracks does not go down.
    pub fn retriangulate(
        &mut self,
        reconstruction: &mut Reconstruction,
    ) -> Result<TriangulationStats, SceneError> {
        let mut stats = TriangulationStats::default();
        for image in reconstruction.registered_images().to_vec() {
            let num_keypoints = reconstruction.image(image).map_or(0, Image::num_keypoints);
            for keypoint in 0..num_keypoints {
                if reconstruction.image_track(image, keypoint).is_some() {
                    continue;
                }
                if let Some(track) =
                    self.triangulate_keypoint(reconstruction, image, keypoint, &mut stats)?
                {
                    self.complete_track(reconstruction, track, false, &mut stats)?;
                }
            }
        }
        info!(
            "retriangulation created {}, continued {} and completed {} tracks",
            stats.created, stats.continued, stats.completed
        );
        Ok(stats)
    }

    /// Complete and merge the given tracks through the correspondences of their observations.
    pub fn complete_and_merge_tracks(
        &mut self,
        reconstruction: &mut Reconstruction,
        tracks: impl IntoIterator<Item = TrackKey>,
    ) -> Result<TriangulationStats, SceneError> {
        let mut stats = TriangulationStats::default();
        for track in tracks {
            self.complete_track(reconstruction, track, true, &mut stats)?;
        }
        Ok(stats)
    }

    fn triangulate_keypoint(
        &mut self,
        reconstruction: &mut Reconstruction,
        image: ImageId,
        keypoint: usize,
        stats: &mut TriangulationStats,
    ) -> Result<Option<TrackKey>, SceneError> {
        let correspondences: Vec<Correspondence> = self
            .graph
            .correspondences(image, keypoint)
            .iter()
            .copied()
            .filter(|c| c.image != image && reconstruction.is_registered(c.image))
            .collect();
        if correspondences.is_empty() {
            return Ok(None);
        }
        let observation = Observation::new(image, keypoint);

        // Continue an existing track if this keypoint agrees with it.
        let tracks: Vec<TrackKey> = correspondences
            .iter()
            .filter_map(|c| reconstruction.image_track(c.image, c.keypoint))
            .unique()
            .collect();
        for track in tracks {
            let agrees = reconstruction
                .track(track)
                .filter(|t| !t.observes(image))
                .and_then(|t| reconstruction.observation_error(observation, &t.point))
                .map_or(false, |error| error <= self.settings.max_reproj_error);
            if agrees {
                reconstruction.add_observation(track, observation)?;
                stats.continued += 1;
                return Ok(Some(track));
            }
        }

        // Otherwise create a new track from the corresponding keypoints without a track.
        let mut observations = vec![observation];
        for c in correspondences {
            let free = reconstruction.image_track(c.image, c.keypoint).is_none();
            if free && observations.iter().all(|o| o.image != c.image) {
                observations.push(Observation::new(c.image, c.keypoint));
            }
        }
        let track = self.create_track(reconstruction, observations)?;
        if track.is_some() {
            stats.created += 1;
        }
        Ok(track)
    }

    /// Triangulate the observations, drop the ones that disagree, and add the track if it still
    /// contains the first observation and has a wide enough angle.
    fn create_track(
        &self,
        reconstruction: &mut Reconstruction,
        mut observations: Vec<Observation>,
    ) -> Result<Option<TrackKey>, SceneError> {
        let required = observations[0];
        let max_error = self.settings.max_reproj_error;
        for _ in 0..2 {
            if observations.len() < 2 {
                return Ok(None);
            }
            let point = match self.triangulate(reconstruction, &observations) {
                Some(point) => point,
                None => return Ok(None),
            };
            let before = observations.len();
            observations.retain(|&o| {
                reconstruction
                    .observation_error(o, &point)
                    .map_or(false, |error| error <= max_error)
            });
            if observations.len() == before {
                if self.observations_angle(reconstruction, &observations, &point)
                    < self.settings.min_tri_angle.to_radians()
                    || reconstruction.check_track(&point, &observations).is_err()
                {
                    return Ok(None);
                }
                let color = self.color(&observations);
                return reconstruction
                    .add_track(point, observations, color)
                    .map(Some);
            }
            if !observations.contains(&required) {
                return Ok(None);
            }
        }
        Ok(None)
    }

    fn complete_track(
        &mut self,
        reconstruction: &mut Reconstruction,
        track: TrackKey,
        merge: bool,
        stats: &mut TriangulationStats,
    ) -> Result<(), SceneError> {
        let graph = self.graph;
        let observations: Vec<Observation> = match reconstruction.track(track) {
            Some(t) => t.observations().collect(),
            None => return Ok(()),
        };
        for observation in observations {
            for c in graph.correspondences(observation.image, observation.keypoint) {
                if !reconstruction.is_registered(c.image) {
                    continue;
                }
                let current = match reconstruction.track(track) {
                    Some(current) => current,
                    None => return Ok(()),
                };
                if current.observes(c.image) {
                    continue;
                }
                match reconstruction.image_track(c.image, c.keypoint) {
                    None => {
                        let other = Observation::new(c.image, c.keypoint);
                        let within = reconstruction
                            .observation_error(other, &current.point)
                            .map_or(false, |e| e <= self.settings.complete_max_reproj_error);
                        if within {
                            reconstruction.add_observation(track, other)?;
                            stats.completed += 1;
                        }
                    }
                    Some(other) if merge && other != track => {
                        if self.try_merge_tracks(reconstruction, track, other)? {
                            stats.merged += 1;
                        }
                    }
                    Some(_) => {}
                }
            }
        }
        Ok(())
    }

    /// Merge track `b` into track `a` if their union triangulates within
    /// `merge_max_reproj_error` in every observation.
    fn try_merge_tracks(
        &self,
        reconstruction: &mut Reconstruction,
        a: TrackKey,
        b: TrackKey,
    ) -> Result<bool, SceneError> {
        let observations: Vec<Observation> = match (reconstruction.track(a), reconstruction.track(b)) {
            (Some(ta), Some(tb)) => {
                if tb.images().any(|image| ta.observes(image)) {
                    return Ok(false);
                }
                ta.observations().chain(tb.observations()).collect()
            }
            _ => return Ok(false),
        };
        let point = match self.triangulate(reconstruction, &observations) {
            Some(point) => point,
            None => return Ok(false),
        };
        let max_error = self.settings.merge_max_reproj_error;
        let consistent = observations.iter().all(|&o| {
            reconstruction
                .observation_error(o, &point)
                .map_or(false, |error| error <= max_error)
        });
        if !consistent {
            return Ok(false);
        }
        reconstruction.merge_tracks(a, b)?;
        if let Some(track) = reconstruction.track_mut(a) {
            track.point = point;
        }
        reconstruction.update_track_error(a);
        Ok(true)
    }

    /// Triangulate the point seen by the observations of registered images.
    pub fn triangulate(
        &self,
        reconstruction: &Reconstruction,
        observations: &[Observation],
    ) -> Option<Point3<f64>> {
        let pairs: Vec<(WorldToCamera, UnitVector3<f64>)> = observations
            .iter()
            .filter_map(|o| {
                let (camera, pose) = reconstruction.image_camera_pose(o.image)?;
                let keypoint = reconstruction.image(o.image)?.keypoint(o.keypoint)?;
                Some((pose, camera.calibrate(keypoint)))
            })
            .collect();
        if pairs.len() < 2 || pairs.len() != observations.len() {
            return None;
        }
        self.triangulator
            .triangulate_observations(pairs.iter().copied())?
            .point()
    }

    fn observations_angle(
        &self,
        reconstruction: &Reconstruction,
        observations: &[Observation],
        point: &Point3<f64>,
    ) -> f64 {
        let centers: Vec<Point3<f64>> = observations
            .iter()
            .filter_map(|o| reconstruction.image(o.image)?.center())
            .collect();
        max_triangulation_angle(centers.iter(), point)
    }

    /// Remove bad observations and narrow tracks among the tracks of an image.
    pub fn filter_image_tracks(
        &self,
        reconstruction: &mut Reconstruction,
        image: ImageId,
    ) -> Result<FilterStats, SceneError> {
        let tracks: Vec<TrackKey> = reconstruction
            .image(image)
            .map(|i| i.observations().map(|(_, track)| track).collect())
            .unwrap_or_default();
        self.filter_tracks(reconstruction, tracks)
    }

    /// Remove observations above `max_reproj_error` and tracks below `min_tri_angle`.
    pub fn filter_tracks(
        &self,
        reconstruction: &mut Reconstruction,
        tracks: impl IntoIterator<Item = TrackKey>,
    ) -> Result<FilterStats, SceneError> {
        reconstruction.filter_tracks(
            tracks,
            self.settings.max_reproj_error,
            self.settings.min_tri_angle.to_radians(),
        )
    }

    /// Deregister images whose camera parameters became implausible.
    pub fn filter_images(
        &self,
        reconstruction: &mut Reconstruction,
    ) -> Result<Vec<ImageId>, SceneError> {
        reconstruction.filter_bogus_images(
            self.settings.min_focal_length_ratio,
            self.settings.max_focal_length_ratio,
            self.settings.max_extra_param,
        )
    }

    /// Add the image and its camera to the model if they are missing.
    ///
    /// Returns `false` if the correspondence graph does not know the image or its camera.
    fn ensure_image(
        &self,
        reconstruction: &mut Reconstruction,
        image: ImageId,
    ) -> Result<bool, SceneError> {
        if reconstruction.has_image(image) {
            return Ok(true);
        }
        let graph_image = match self.graph.image(image) {
            Some(graph_image) => graph_image,
            None => return Ok(false),
        };
        if !reconstruction.has_camera(graph_image.camera) {
            match self.graph.camera(graph_image.camera) {
                Some(camera) => reconstruction.add_camera(graph_image.camera, camera.clone())?,
                None => return Ok(false),
            }
        }
        reconstruction.add_image(
            image,
            Image::new(
                graph_image.name.clone(),
                graph_image.camera,
                graph_image.keypoints.clone(),
            ),
        )?;
        Ok(true)
    }

    /// The mean keypoint color of the observations, if the graph knows colors.
    fn color(&self, observations: &[Observation]) -> [u8; 3] {
        let colors: Vec<[u8; 3]> = observations
            .iter()
            .filter_map(|o| self.graph.image(o.image)?.color(o.keypoint))
            .collect();
        let mut mean = [0; 3];
        if colors.is_empty() {
            return mean;
        }
        for (channel, value) in mean.iter_mut().enumerate() {
            let sum: f64 = colors.iter().map(|c| f64::from(c[channel])).sum();
            *value = (sum / colors.len() as f64).round() as u8;
        }
        mean
    }
}

fn median(values: impl Iterator<Item = f64>) -> f64 {
    let sorted: Vec<f64> = values.map(FloatOrd).sorted().map(|FloatOrd(v)| v).collect();
    if sorted.is_empty() {
        0.0
    } else {
        sorted[sorted.len() / 2]
    }
}

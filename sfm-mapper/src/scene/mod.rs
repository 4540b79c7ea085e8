//! The scene model of one reconstruction.
//!
//! Images, cameras and tracks refer to each other only through ids. Every mutation goes
//! through [`Reconstruction`] so that the links between images and tracks stay symmetric:
//! a keypoint of an image is linked to a track exactly when the track has that keypoint
//! as the observation of that image.

mod image;
mod track;

pub use image::*;
pub use track::*;

use crate::error::{invariant, violation, SceneError};
use crate::{CameraId, ImageId, TrackKey};
use log::*;
use sfm_core::nalgebra::Point3;
use sfm_core::{
    CameraIntrinsics, KeyPoint, Pose, Projective, WorldPoint, WorldToCamera, WorldToWorld,
};
use sfm_geom::triangulation::max_triangulation_angle;
use slotmap::DenseSlotMap;
use std::collections::{BTreeMap, BTreeSet};

#[cfg(feature = "serde-serialize")]
use serde::{Deserialize, Serialize};

/// Triangulation angles in radians at or below this count as zero.
const MIN_POSITIVE_ANGLE: f64 = 1e-9;

/// The distance in pixels between a keypoint and the projection of a point.
///
/// Returns `None` if the point is not in front of the camera.
pub fn reprojection_error(
    camera: &CameraIntrinsics,
    pose: WorldToCamera,
    point: &Point3<f64>,
    keypoint: KeyPoint,
) -> Option<f64> {
    let projected = camera.project(pose.transform(WorldPoint::from_point(*point)))?;
    Some((projected.0 - keypoint.0).norm())
}

/// What a filtering pass removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FilterStats {
    pub observations: usize,
    pub tracks: usize,
}

impl core::ops::AddAssign for FilterStats {
    fn add_assign(&mut self, other: Self) {
        self.observations += other.observations;
        self.tracks += other.tracks;
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
pub struct ReconstructionStats {
    pub num_cameras: usize,
    pub num_images: usize,
    pub num_registered_images: usize,
    pub num_tracks: usize,
    pub num_observations: usize,
    pub mean_track_length: f64,
    pub mean_observations_per_image: f64,
    /// Mean reprojection error in pixels over all observations.
    pub mean_reprojection_error: f64,
}

/// One model: cameras, images and the tracks triangulated from them.
#[derive(Debug, Clone, Default)]
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
pub struct Reconstruction {
    cameras: BTreeMap<CameraId, CameraIntrinsics>,
    images: BTreeMap<ImageId, Image>,
    tracks: DenseSlotMap<TrackKey, Track>,
    /// Registered images in the order they were registered.
    registration_order: Vec<ImageId>,
}

impl Reconstruction {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_camera(&mut self, id: CameraId, camera: CameraIntrinsics) -> Result<(), SceneError> {
        invariant!(
            !self.cameras.contains_key(&id),
            SceneError::DuplicateCamera(id)
        );
        self.cameras.insert(id, camera);
        Ok(())
    }

    pub fn camera(&self, id: CameraId) -> Option<&CameraIntrinsics> {
        self.cameras.get(&id)
    }

    /// Cameras can be changed freely, since their parameter count is fixed by their model.
    pub fn camera_mut(&mut self, id: CameraId) -> Option<&mut CameraIntrinsics> {
        self.cameras.get_mut(&id)
    }

    pub fn cameras(&self) -> impl Iterator<Item = (CameraId, &CameraIntrinsics)> + '_ {
        self.cameras.iter().map(|(&id, camera)| (id, camera))
    }

    pub fn has_camera(&self, id: CameraId) -> bool {
        self.cameras.contains_key(&id)
    }

    /// Add an unregistered image. Its camera must already exist.
    pub fn add_image(&mut self, id: ImageId, image: Image) -> Result<(), SceneError> {
        invariant!(
            !self.images.contains_key(&id),
            SceneError::DuplicateImage(id)
        );
        invariant!(
            self.cameras.contains_key(&image.camera()),
            SceneError::UnknownCamera(image.camera())
        );
        invariant!(
            !image.is_registered(),
            SceneError::ImageAlreadyRegistered(id)
        );
        self.images.insert(id, image);
        Ok(())
    }

    pub fn image(&self, id: ImageId) -> Option<&Image> {
        self.images.get(&id)
    }

    pub fn images(&self) -> impl Iterator<Item = (ImageId, &Image)> + '_ {
        self.images.iter().map(|(&id, image)| (id, image))
    }

    pub fn has_image(&self, id: ImageId) -> bool {
        self.images.contains_key(&id)
    }

    pub fn num_images(&self) -> usize {
        self.images.len()
    }

    pub fn is_registered(&self, id: ImageId) -> bool {
        self.images.get(&id).map_or(false, Image::is_registered)
    }

    /// Registered images in the order they were registered.
    pub fn registered_images(&self) -> &[ImageId] {
        &self.registration_order
    }

    pub fn num_registered_images(&self) -> usize {
        self.registration_order.len()
    }

    /// The camera and pose of a registered image.
    pub fn image_camera_pose(&self, id: ImageId) -> Option<(&CameraIntrinsics, WorldToCamera)> {
        let image = self.images.get(&id)?;
        Some((self.cameras.get(&image.camera())?, image.pose()?))
    }

    pub fn register_image(&mut self, id: ImageId, pose: WorldToCamera) -> Result<(), SceneError> {
        let image = self.checked_image_mut(id)?;
        invariant!(
            !image.is_registered(),
            SceneError::ImageAlreadyRegistered(id)
        );
        image.set_pose(Some(pose));
        self.registration_order.push(id);
        Ok(())
    }

    /// Move a registered image.
    pub fn set_pose(&mut self, id: ImageId, pose: WorldToCamera) -> Result<(), SceneError> {
        let image = self.checked_image_mut(id)?;
        invariant!(image.is_registered(), SceneError::ImageNotRegistered(id));
        image.set_pose(Some(pose));
        Ok(())
    }

    /// Remove the pose of an image and every observation it made.
    ///
    /// Tracks that no longer have enough observations are deleted.
    /// Returns the number of deleted tracks.
    pub fn deregister_image(&mut self, id: ImageId) -> Result<usize, SceneError> {
        let image = self.checked_image(id)?;
        invariant!(image.is_registered(), SceneError::ImageNotRegistered(id));
        let keypoints: Vec<usize> = image.observations().map(|(keypoint, _)| keypoint).collect();
        let mut deleted = 0;
        for keypoint in keypoints {
            if self.delete_observation(id, keypoint)? {
                deleted += 1;
            }
        }
        if let Some(image) = self.images.get_mut(&id) {
            image.set_pose(None);
        }
        self.registration_order.retain(|&other| other != id);
        debug!("deregistered image {}, deleting {} tracks", id, deleted);
        Ok(deleted)
    }

    pub fn track(&self, key: TrackKey) -> Option<&Track> {
        self.tracks.get(key)
    }

    /// The point, color and error of a track can be changed freely. Its observations cannot.
    pub fn track_mut(&mut self, key: TrackKey) -> Option<&mut Track> {
        self.tracks.get_mut(key)
    }

    pub fn tracks(&self) -> impl Iterator<Item = (TrackKey, &Track)> + '_ {
        self.tracks.iter()
    }

    pub fn track_keys(&self) -> Vec<TrackKey> {
        self.tracks.keys().collect()
    }

    pub fn num_tracks(&self) -> usize {
        self.tracks.len()
    }

    /// The track a keypoint belongs to.
    pub fn image_track(&self, image: ImageId, keypoint: usize) -> Option<TrackKey> {
        self.images.get(&image)?.track(keypoint)
    }

    /// Check whether a track with these observations could be added, without adding it.
    ///
    /// Every image must be registered and distinct, every keypoint must be free and the
    /// rays must meet at the point with a positive angle.
    pub fn check_track(
        &self,
        point: &Point3<f64>,
        observations: &[Observation],
    ) -> Result<(), SceneError> {
        if observations.len() < 2 {
            return Err(SceneError::TooFewObservations(observations.len()));
        }
        let mut seen = BTreeSet::new();
        for &observation in observations {
            if !seen.insert(observation.image) {
                return Err(SceneError::DuplicateObservation(observation.image));
            }
            self.check_free_keypoint(observation)?;
        }
        let centers: Vec<Point3<f64>> = observations
            .iter()
            .filter_map(|o| self.images.get(&o.image).and_then(Image::center))
            .collect();
        if max_triangulation_angle(centers.iter(), point) <= MIN_POSITIVE_ANGLE {
            return Err(SceneError::DegenerateTrack);
        }
        Ok(())
    }

    /// Create a track, linking every observation to it.
    pub fn add_track(
        &mut self,
        point: Point3<f64>,
        observations: impl IntoIterator<Item = Observation>,
        color: [u8; 3],
    ) -> Result<TrackKey, SceneError> {
        let observations: Vec<Observation> = observations.into_iter().collect();
        if let Err(err) = self.check_track(&point, &observations) {
            violation!(err);
        }
        let mut track = Track::new(point, color);
        for &observation in &observations {
            track.insert(observation);
        }
        let key = self.tracks.insert(track);
        for observation in observations {
            if let Some(image) = self.images.get_mut(&observation.image) {
                image.link(observation.keypoint, key);
            }
        }
        self.update_track_error(key);
        Ok(key)
    }

    /// Extend a track by the keypoint of an image it does not observe yet.
    pub fn add_observation(
        &mut self,
        key: TrackKey,
        observation: Observation,
    ) -> Result<(), SceneError> {
        invariant!(
            self.tracks.contains_key(key),
            SceneError::UnknownTrack(key)
        );
        if let Err(err) = self.check_free_keypoint(observation) {
            violation!(err);
        }
        let track = self.checked_track_mut(key)?;
        invariant!(
            !track.observes(observation.image),
            SceneError::DuplicateObservation(observation.image)
        );
        track.insert(observation);
        if let Some(image) = self.images.get_mut(&observation.image) {
            image.link(observation.keypoint, key);
        }
        Ok(())
    }

    /// Unlink a keypoint from its track.
    ///
    /// Returns whether the track was deleted because it fell below two observations or
    /// lost its triangulation angle.
    pub fn delete_observation(&mut self, image: ImageId, keypoint: usize) -> Result<bool, SceneError> {
        let image_ref = self.checked_image_mut(image)?;
        let num_keypoints = image_ref.num_keypoints();
        invariant!(
            keypoint < num_keypoints,
            SceneError::KeypointOutOfRange {
                image,
                keypoint,
                num_keypoints
            }
        );
        let key = match image_ref.unlink(keypoint) {
            Some(key) => key,
            None => violation!(SceneError::KeypointNotLinked { image, keypoint }),
        };
        if let Some(track) = self.tracks.get_mut(key) {
            track.remove(image);
        }
        if self.is_track_viable(key) {
            Ok(false)
        } else {
            self.remove_track(key);
            Ok(true)
        }
    }

    pub fn delete_track(&mut self, key: TrackKey) -> Result<Track, SceneError> {
        match self.remove_track(key) {
            Some(track) => Ok(track),
            None => violation!(SceneError::UnknownTrack(key)),
        }
    }

    /// Move every observation of track `b` into track `a` and delete `b`.
    ///
    /// The point and color become the average of both, weighted by observation count.
    /// The tracks must not share an image.
    pub fn merge_tracks(&mut self, a: TrackKey, b: TrackKey) -> Result<TrackKey, SceneError> {
        invariant!(a != b, SceneError::ConflictingTracks(a, b));
        let (track_a, track_b) = match (self.tracks.get(a), self.tracks.get(b)) {
            (Some(track_a), Some(track_b)) => (track_a, track_b),
            (None, _) => violation!(SceneError::UnknownTrack(a)),
            (_, None) => violation!(SceneError::UnknownTrack(b)),
        };
        invariant!(
            !track_b.images().any(|image| track_a.observes(image)),
            SceneError::ConflictingTracks(a, b)
        );
        let track_b = match self.remove_track(b) {
            Some(track_b) => track_b,
            None => violation!(SceneError::UnknownTrack(b)),
        };
        let track_a = self.checked_track_mut(a)?;
        let weight_a = track_a.len() as f64;
        let weight_b = track_b.len() as f64;
        let total = weight_a + weight_b;
        track_a.point = Point3::from(
            (track_a.point.coords * weight_a + track_b.point.coords * weight_b) / total,
        );
        let color_a = track_a.color;
        for channel in 0..3 {
            let mixed = f64::from(color_a[channel]) * weight_a
                + f64::from(track_b.color[channel]) * weight_b;
            track_a.color[channel] = (mixed / total).round() as u8;
        }
        for observation in track_b.observations() {
            track_a.insert(observation);
        }
        for observation in track_b.observations() {
            if let Some(image) = self.images.get_mut(&observation.image) {
                image.link(observation.keypoint, a);
            }
        }
        self.update_track_error(a);
        Ok(a)
    }

    /// Apply a similarity to every point and pose.
    ///
    /// Projections into every image stay the same.
    pub fn transform(&mut self, similarity: WorldToWorld) {
        for (_, track) in self.tracks.iter_mut() {
            track.point = similarity.transform_point(&track.point);
        }
        for image in self.images.values_mut() {
            if let Some(pose) = image.pose() {
                image.set_pose(Some(similarity.transform_pose(pose)));
            }
        }
    }

    /// The reprojection error of a point in the keypoint of a registered image.
    pub fn observation_error(
        &self,
        observation: Observation,
        point: &Point3<f64>,
    ) -> Option<f64> {
        let image = self.images.get(&observation.image)?;
        let camera = self.cameras.get(&image.camera())?;
        reprojection_error(
            camera,
            image.pose()?,
            point,
            image.keypoint(observation.keypoint)?,
        )
    }

    /// The reprojection error of every observation of a track.
    ///
    /// Observations the point is behind get an infinite error.
    pub fn track_errors(&self, key: TrackKey) -> Option<Vec<(Observation, f64)>> {
        let track = self.tracks.get(key)?;
        Some(
            track
                .observations()
                .map(|o| {
                    (
                        o,
                        self.observation_error(o, &track.point)
                            .unwrap_or(f64::INFINITY),
                    )
                })
                .collect(),
        )
    }

    /// Recompute the mean reprojection error of a track.
    pub fn update_track_error(&mut self, key: TrackKey) -> Option<f64> {
        let errors = self.track_errors(key)?;
        let error = errors.iter().map(|&(_, e)| e).sum::<f64>() / errors.len().max(1) as f64;
        if let Some(track) = self.tracks.get_mut(key) {
            track.error = error;
        }
        Some(error)
    }

    /// The largest angle in radians between the rays of the track.
    pub fn track_angle(&self, key: TrackKey) -> Option<f64> {
        let track = self.tracks.get(key)?;
        let centers: Vec<Point3<f64>> = track
            .images()
            .filter_map(|image| self.images.get(&image).and_then(Image::center))
            .collect();
        Some(max_triangulation_angle(centers.iter(), &track.point))
    }

    /// Remove observations with a reprojection error above `max_reproj_error` pixels, then
    /// tracks with a triangulation angle below `min_tri_angle` radians.
    ///
    /// Tracks that satisfy both thresholds are left alone.
    pub fn filter_tracks(
        &mut self,
        keys: impl IntoIterator<Item = TrackKey>,
        max_reproj_error: f64,
        min_tri_angle: f64,
    ) -> Result<FilterStats, SceneError> {
        let mut stats = FilterStats::default();
        for key in keys {
            let errors = match self.track_errors(key) {
                Some(errors) => errors,
                None => continue,
            };
            let mut deleted = false;
            for (observation, error) in errors {
                if error > max_reproj_error {
                    stats.observations += 1;
                    if self.delete_observation(observation.image, observation.keypoint)? {
                        stats.tracks += 1;
                        deleted = true;
                        break;
                    }
                }
            }
            if deleted {
                continue;
            }
            if self.track_angle(key).map_or(false, |angle| angle < min_tri_angle) {
                let track = self.delete_track(key)?;
                stats.observations += track.len();
                stats.tracks += 1;
            } else {
                self.update_track_error(key);
            }
        }
        Ok(stats)
    }

    /// [`Reconstruction::filter_tracks`] over every track.
    pub fn filter_all_tracks(
        &mut self,
        max_reproj_error: f64,
        min_tri_angle: f64,
    ) -> Result<FilterStats, SceneError> {
        let keys = self.track_keys();
        self.filter_tracks(keys, max_reproj_error, min_tri_angle)
    }

    /// Deregister every image whose camera parameters became implausible.
    pub fn filter_bogus_images(
        &mut self,
        min_focal_length_ratio: f64,
        max_focal_length_ratio: f64,
        max_extra_param: f64,
    ) -> Result<Vec<ImageId>, SceneError> {
        let bogus: Vec<ImageId> = self
            .registered_images()
            .iter()
            .copied()
            .filter(|&image| {
                self.image(image)
                    .and_then(|i| self.camera(i.camera()))
                    .map_or(false, |camera| {
                        camera.has_bogus_params(
                            min_focal_length_ratio,
                            max_focal_length_ratio,
                            max_extra_param,
                        )
                    })
            })
            .collect();
        for &image in &bogus {
            warn!("image {} has implausible camera parameters, deregistering it", image);
            self.deregister_image(image)?;
        }
        Ok(bogus)
    }

    pub fn num_observations(&self) -> usize {
        self.tracks.values().map(Track::len).sum()
    }

    /// Mean reprojection error in pixels over every observation.
    pub fn mean_reprojection_error(&self) -> f64 {
        let (sum, count) = self
            .tracks
            .keys()
            .filter_map(|key| self.track_errors(key))
            .flatten()
            .fold((0.0, 0usize), |(sum, count), (_, error)| (sum + error, count + 1));
        if count == 0 {
            0.0
        } else {
            sum / count as f64
        }
    }

    pub fn statistics(&self) -> ReconstructionStats {
        let num_registered_images = self.num_registered_images();
        let num_tracks = self.num_tracks();
        let num_observations = self.num_observations();
        ReconstructionStats {
            num_cameras: self.cameras.len(),
            num_images: self.images.len(),
            num_registered_images,
            num_tracks,
            num_observations,
            mean_track_length: ratio(num_observations, num_tracks),
            mean_observations_per_image: ratio(num_observations, num_registered_images),
            mean_reprojection_error: self.mean_reprojection_error(),
        }
    }

    /// Verify every invariant of the scene model.
    ///
    /// Every failure is logged, and the first one is returned.
    pub fn sanity_check(&self) -> Result<(), SceneError> {
        debug!("SANITY CHECK: verifying {} images and {} tracks", self.images.len(), self.tracks.len());
        let mut failures = vec![];

        for (&id, image) in &self.images {
            if !self.cameras.contains_key(&image.camera()) {
                failures.push(SceneError::UnknownCamera(image.camera()));
            }
            if !image.is_registered() && image.num_observations() != 0 {
                failures.push(SceneError::ImageNotRegistered(id));
            }
            if image.observations().count() != image.num_observations() {
                failures.push(SceneError::ObservationCount(id));
            }
            for (keypoint, key) in image.observations() {
                match self.tracks.get(key) {
                    None => failures.push(SceneError::UnknownTrack(key)),
                    Some(track) if track.observation(id) != Some(keypoint) => {
                        failures.push(SceneError::KeypointNotLinked { image: id, keypoint })
                    }
                    Some(_) => {}
                }
            }
            let in_order = self.registration_order.iter().filter(|&&other| other == id).count();
            if in_order != usize::from(image.is_registered()) {
                failures.push(SceneError::RegistrationOrder(id));
            }
        }
        for &id in &self.registration_order {
            if !self.images.contains_key(&id) {
                failures.push(SceneError::UnknownImage(id));
            }
        }

        for (key, track) in &self.tracks {
            if track.len() < 2 {
                failures.push(SceneError::TooFewObservations(track.len()));
            }
            for observation in track.observations() {
                match self.images.get(&observation.image) {
                    None => failures.push(SceneError::UnknownImage(observation.image)),
                    Some(image) if !image.is_registered() => {
                        failures.push(SceneError::ImageNotRegistered(observation.image))
                    }
                    Some(image) if observation.keypoint >= image.num_keypoints() => {
                        failures.push(SceneError::KeypointOutOfRange {
                            image: observation.image,
                            keypoint: observation.keypoint,
                            num_keypoints: image.num_keypoints(),
                        })
                    }
                    Some(image) if image.track(observation.keypoint) != Some(key) => {
                        failures.push(SceneError::KeypointNotLinked {
                            image: observation.image,
                            keypoint: observation.keypoint,
                        })
                    }
                    Some(_) => {}
                }
            }
            if self.track_angle(key).map_or(true, |angle| angle <= MIN_POSITIVE_ANGLE) {
                failures.push(SceneError::DegenerateTrack);
            }
        }

        for failure in &failures {
            error!("SANITY CHECK FAILURE: {}", failure);
        }
        match failures.into_iter().next() {
            Some(failure) => Err(failure),
            None => Ok(()),
        }
    }

    fn checked_image(&self, id: ImageId) -> Result<&Image, SceneError> {
        match self.images.get(&id) {
            Some(image) => Ok(image),
            None => violation!(SceneError::UnknownImage(id)),
        }
    }

    fn checked_image_mut(&mut self, id: ImageId) -> Result<&mut Image, SceneError> {
        match self.images.get_mut(&id) {
            Some(image) => Ok(image),
            None => violation!(SceneError::UnknownImage(id)),
        }
    }

    fn checked_track_mut(&mut self, key: TrackKey) -> Result<&mut Track, SceneError> {
        match self.tracks.get_mut(key) {
            Some(track) => Ok(track),
            None => violation!(SceneError::UnknownTrack(key)),
        }
    }

    /// The keypoint exists on a registered image and belongs to no track.
    fn check_free_keypoint(&self, observation: Observation) -> Result<(), SceneError> {
        let Observation { image, keypoint } = observation;
        let image_ref = self
            .images
            .get(&image)
            .ok_or(SceneError::UnknownImage(image))?;
        if !image_ref.is_registered() {
            return Err(SceneError::ImageNotRegistered(image));
        }
        if keypoint >= image_ref.num_keypoints() {
            return Err(SceneError::KeypointOutOfRange {
                image,
                keypoint,
                num_keypoints: image_ref.num_keypoints(),
            });
        }
        if let Some(track) = image_ref.track(keypoint) {
            return Err(SceneError::KeypointAlreadyLinked {
                image,
                keypoint,
                track,
            });
        }
        Ok(())
    }

    fn is_track_viable(&self, key: TrackKey) -> bool {
        self.tracks.get(key).map_or(false, |track| track.len() >= 2)
            && self
                .track_angle(key)
                .map_or(false, |angle| angle > MIN_POSITIVE_ANGLE)
    }

    /// Delete a track and unlink its keypoints.
    fn remove_track(&mut self, key: TrackKey) -> Option<Track> {
        let track = self.tracks.remove(key)?;
        for observation in track.observations() {
            if let Some(image) = self.images.get_mut(&observation.image) {
                image.unlink(observation.keypoint);
            }
        }
        Some(track)
    }
}

fn ratio(numerator: usize, denominator: usize) -> f64 {
    if denominator == 0 {
        0.0
    } else {
        numerator as f64 / denominator as f64
    }
}

use crate::{CameraId, TrackKey};
use sfm_core::nalgebra::Point3;
use sfm_core::{KeyPoint, WorldToCamera};

#[cfg(feature = "serde-serialize")]
use serde::{Deserialize, Serialize};

/// An image in a reconstruction.
///
/// Each keypoint may be linked to one track. Only a registered image has a pose, and only a
/// registered image may have keypoints linked to tracks.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
pub struct Image {
    name: String,
    camera: CameraId,
    keypoints: Vec<KeyPoint>,
    /// A [`Reconstruction::tracks`](crate::Reconstruction::tracks) key for each keypoint.
    tracks: Vec<Option<TrackKey>>,
    pose: Option<WorldToCamera>,
    num_observations: usize,
}

impl Image {
    pub fn new(name: impl Into<String>, camera: CameraId, keypoints: Vec<KeyPoint>) -> Self {
        let tracks = vec![None; keypoints.len()];
        Self {
            name: name.into(),
            camera,
            keypoints,
            tracks,
            pose: None,
            num_observations: 0,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn camera(&self) -> CameraId {
        self.camera
    }

    pub fn keypoints(&self) -> &[KeyPoint] {
        &self.keypoints
    }

    pub fn keypoint(&self, keypoint: usize) -> Option<KeyPoint> {
        self.keypoints.get(keypoint).copied()
    }

    pub fn num_keypoints(&self) -> usize {
        self.keypoints.len()
    }

    /// The track the keypoint belongs to, if any.
    pub fn track(&self, keypoint: usize) -> Option<TrackKey> {
        self.tracks.get(keypoint).copied().flatten()
    }

    /// All keypoints that belong to a track along with the track.
    pub fn observations(&self) -> impl Iterator<Item = (usize, TrackKey)> + '_ {
        self.tracks
            .iter()
            .enumerate()
            .filter_map(|(keypoint, track)| track.map(|track| (keypoint, track)))
    }

    pub fn num_observations(&self) -> usize {
        self.num_observations
    }

    pub fn pose(&self) -> Option<WorldToCamera> {
        self.pose
    }

    pub fn is_registered(&self) -> bool {
        self.pose.is_some()
    }

    /// The optical center in world coordinates of a registered image.
    pub fn center(&self) -> Option<Point3<f64>> {
        self.pose.map(WorldToCamera::center)
    }

    pub(crate) fn set_pose(&mut self, pose: Option<WorldToCamera>) {
        self.pose = pose;
    }

    pub(crate) fn link(&mut self, keypoint: usize, track: TrackKey) {
        if self.tracks[keypoint].replace(track).is_none() {
            self.num_observations += 1;
        }
    }

    pub(crate) fn unlink(&mut self, keypoint: usize) -> Option<TrackKey> {
        let track = self.tracks.get_mut(keypoint)?.take();
        if track.is_some() {
            self.num_observations -= 1;
        }
        track
    }
}

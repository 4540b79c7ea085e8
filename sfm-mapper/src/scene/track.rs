use crate::ImageId;
use sfm_core::nalgebra::Point3;
use std::collections::BTreeMap;

#[cfg(feature = "serde-serialize")]
use serde::{Deserialize, Serialize};

/// One keypoint of one image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
pub struct Observation {
    pub image: ImageId,
    pub keypoint: usize,
}

impl Observation {
    pub fn new(image: ImageId, keypoint: usize) -> Self {
        Self { image, keypoint }
    }
}

/// A 3d point in space that has been observed in two or more registered images.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
pub struct Track {
    pub point: Point3<f64>,
    pub color: [u8; 3],
    /// Mean reprojection error in pixels as of the last time it was computed.
    pub error: f64,
    /// Contains a map from image to keypoint. A track sees each image at most once.
    observations: BTreeMap<ImageId, usize>,
}

impl Track {
    pub(crate) fn new(point: Point3<f64>, color: [u8; 3]) -> Self {
        Self {
            point,
            color,
            error: 0.0,
            observations: BTreeMap::new(),
        }
    }

    /// Observations in increasing image order.
    pub fn observations(&self) -> impl Iterator<Item = Observation> + Clone + '_ {
        self.observations
            .iter()
            .map(|(&image, &keypoint)| Observation { image, keypoint })
    }

    /// The keypoint through which this track is seen in the image.
    pub fn observation(&self, image: ImageId) -> Option<usize> {
        self.observations.get(&image).copied()
    }

    pub fn observes(&self, image: ImageId) -> bool {
        self.observations.contains_key(&image)
    }

    pub fn images(&self) -> impl Iterator<Item = ImageId> + Clone + '_ {
        self.observations.keys().copied()
    }

    pub fn len(&self) -> usize {
        self.observations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observations.is_empty()
    }

    pub(crate) fn insert(&mut self, observation: Observation) {
        self.observations
            .insert(observation.image, observation.keypoint);
    }

    pub(crate) fn remove(&mut self, image: ImageId) -> Option<usize> {
        self.observations.remove(&image)
    }
}

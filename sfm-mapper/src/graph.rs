use crate::{CameraId, GraphError, ImageId};
use sfm_core::{CameraIntrinsics, CameraToCamera, KeyPoint};
use std::collections::{BTreeMap, BTreeSet};

#[cfg(feature = "serde-serialize")]
use serde::{Deserialize, Serialize};

/// A keypoint in another image that was verified to show the same point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
pub struct Correspondence {
    pub image: ImageId,
    pub keypoint: usize,
}

/// An image as the correspondence graph knows it.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
pub struct GraphImage {
    pub name: String,
    pub camera: CameraId,
    pub keypoints: Vec<KeyPoint>,
    /// The color of each keypoint, or empty if unknown.
    pub colors: Vec<[u8; 3]>,
}

impl GraphImage {
    pub fn new(name: impl Into<String>, camera: CameraId, keypoints: Vec<KeyPoint>) -> Self {
        Self {
            name: name.into(),
            camera,
            keypoints,
            colors: vec![],
        }
    }

    #[must_use]
    pub fn colors(self, colors: Vec<[u8; 3]>) -> Self {
        Self { colors, ..self }
    }

    pub fn color(&self, keypoint: usize) -> Option<[u8; 3]> {
        self.colors.get(keypoint).copied()
    }
}

/// The verified matches between two images.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
pub struct ImagePair {
    /// The image with the smaller id.
    pub a: ImageId,
    pub b: ImageId,
    /// Keypoint of `a` and keypoint of `b`.
    pub matches: Vec<(usize, usize)>,
    /// The pose of `b` relative to `a`, if two-view geometry verification produced one.
    pub relative_pose: Option<CameraToCamera>,
}

/// The canonical id of an unordered image pair: `min * (2^31 - 1) + max`.
pub fn pair_id(a: ImageId, b: ImageId) -> u64 {
    const MAX_IMAGE_ID: u64 = (1 << 31) - 1;
    let (min, max) = if a <= b { (a, b) } else { (b, a) };
    u64::from(min.0) * MAX_IMAGE_ID + u64::from(max.0)
}

/// Read-only access to verified correspondences between images.
///
/// The mapper never mutates this during a run, so several models may be grown from the same
/// provider on several threads.
pub trait Correspondences: Send + Sync {
    /// Every image id in increasing order.
    fn image_ids(&self) -> Vec<ImageId>;

    fn image(&self, image: ImageId) -> Option<&GraphImage>;

    fn camera(&self, camera: CameraId) -> Option<&CameraIntrinsics>;

    /// The keypoints of other images that correspond to a keypoint.
    fn correspondences(&self, image: ImageId, keypoint: usize) -> &[Correspondence];

    /// The total number of correspondences of all keypoints of an image.
    fn num_correspondences(&self, image: ImageId) -> usize;

    /// Every image pair with at least one match, in increasing pair id order.
    fn image_pairs(&self) -> Vec<&ImagePair>;

    /// The matches between two images as `(keypoint in a, keypoint in b)`.
    fn matches(&self, a: ImageId, b: ImageId) -> Vec<(usize, usize)>;

    /// The pose of `b` relative to `a`, if one was supplied.
    fn relative_pose(&self, a: ImageId, b: ImageId) -> Option<CameraToCamera>;
}

/// An in-memory [`Correspondences`] built up from cameras, images and pairwise matches.
#[derive(Debug, Clone, Default)]
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
pub struct CorrespondenceGraph {
    cameras: BTreeMap<CameraId, CameraIntrinsics>,
    images: BTreeMap<ImageId, GraphImage>,
    /// For every image, the correspondences of each keypoint.
    correspondences: BTreeMap<ImageId, Vec<Vec<Correspondence>>>,
    pairs: BTreeMap<u64, ImagePair>,
}

impl CorrespondenceGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a camera, replacing any previous camera with the same id.
    pub fn add_camera(&mut self, id: CameraId, camera: CameraIntrinsics) {
        self.cameras.insert(id, camera);
    }

    pub fn add_image(&mut self, id: ImageId, image: GraphImage) -> Result<(), GraphError> {
        if self.images.contains_key(&id) {
            return Err(GraphError::DuplicateImage(id));
        }
        if !self.cameras.contains_key(&image.camera) {
            return Err(GraphError::UnknownCamera(image.camera));
        }
        if !image.colors.is_empty() && image.colors.len() != image.keypoints.len() {
            return Err(GraphError::ColorCount {
                image: id,
                num_keypoints: image.keypoints.len(),
                num_colors: image.colors.len(),
            });
        }
        self.correspondences
            .insert(id, vec![vec![]; image.keypoints.len()]);
        self.images.insert(id, image);
        Ok(())
    }

    /// Adds the verified matches between two images.
    ///
    /// `relative_pose` is the pose of `b` relative to `a`. Matches are stored in the order of the
    /// canonical pair, so the pose is inverted if `b` has the smaller id.
    pub fn add_matches(
        &mut self,
        a: ImageId,
        b: ImageId,
        matches: Vec<(usize, usize)>,
        relative_pose: Option<CameraToCamera>,
    ) -> Result<(), GraphError> {
        if a == b {
            return Err(GraphError::SelfMatch(a));
        }
        let id = pair_id(a, b);
        if self.pairs.contains_key(&id) {
            return Err(GraphError::DuplicatePair(a, b));
        }
        for (image, keypoint) in matches
            .iter()
            .flat_map(|&(ka, kb)| [(a, ka), (b, kb)])
        {
            let num_keypoints = self
                .images
                .get(&image)
                .ok_or(GraphError::UnknownImage(image))?
                .keypoints
                .len();
            if keypoint >= num_keypoints {
                return Err(GraphError::KeypointOutOfRange {
                    image,
                    keypoint,
                    num_keypoints,
                });
            }
        }

        for &(ka, kb) in &matches {
            self.link(a, ka, b, kb);
            self.link(b, kb, a, ka);
        }

        let pair = if a < b {
            ImagePair {
                a,
                b,
                matches,
                relative_pose,
            }
        } else {
            ImagePair {
                a: b,
                b: a,
                matches: matches.into_iter().map(|(ka, kb)| (kb, ka)).collect(),
                relative_pose: relative_pose.map(|pose| CameraToCamera(pose.0.inverse())),
            }
        };
        self.pairs.insert(id, pair);
        Ok(())
    }

    pub fn num_images(&self) -> usize {
        self.images.len()
    }

    pub fn num_pairs(&self) -> usize {
        self.pairs.len()
    }

    fn link(&mut self, image: ImageId, keypoint: usize, other: ImageId, other_keypoint: usize) {
        if let Some(keypoints) = self.correspondences.get_mut(&image) {
            keypoints[keypoint].push(Correspondence {
                image: other,
                keypoint: other_keypoint,
            });
        }
    }
}

impl Correspondences for CorrespondenceGraph {
    fn image_ids(&self) -> Vec<ImageId> {
        self.images.keys().copied().collect()
    }

    fn image(&self, image: ImageId) -> Option<&GraphImage> {
        self.images.get(&image)
    }

    fn camera(&self, camera: CameraId) -> Option<&CameraIntrinsics> {
        self.cameras.get(&camera)
    }

    fn correspondences(&self, image: ImageId, keypoint: usize) -> &[Correspondence] {
        self.correspondences
            .get(&image)
            .and_then(|keypoints| keypoints.get(keypoint))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    fn num_correspondences(&self, image: ImageId) -> usize {
        self.correspondences
            .get(&image)
            .map_or(0, |keypoints| keypoints.iter().map(Vec::len).sum())
    }

    fn image_pairs(&self) -> Vec<&ImagePair> {
        self.pairs.values().collect()
    }

    fn matches(&self, a: ImageId, b: ImageId) -> Vec<(usize, usize)> {
        match self.pairs.get(&pair_id(a, b)) {
            Some(pair) if pair.a == a => pair.matches.clone(),
            Some(pair) => pair.matches.iter().map(|&(ka, kb)| (kb, ka)).collect(),
            None => vec![],
        }
    }

    fn relative_pose(&self, a: ImageId, b: ImageId) -> Option<CameraToCamera> {
        let pair = self.pairs.get(&pair_id(a, b))?;
        let pose = pair.relative_pose?;
        Some(if pair.a == a {
            pose
        } else {
            CameraToCamera(pose.0.inverse())
        })
    }
}

/// Label the images by the connected component of the image pairs they belong to.
///
/// Only pairs between two of `images` connect them. Components are numbered in the order of
/// their smallest image id.
pub fn connected_components<G>(graph: &G, images: &BTreeSet<ImageId>) -> BTreeMap<ImageId, usize>
where
    G: Correspondences + ?Sized,
{
    let mut neighbors: BTreeMap<ImageId, Vec<ImageId>> = BTreeMap::new();
    for pair in graph.image_pairs() {
        if images.contains(&pair.a) && images.contains(&pair.b) {
            neighbors.entry(pair.a).or_default().push(pair.b);
            neighbors.entry(pair.b).or_default().push(pair.a);
        }
    }

    let mut components = BTreeMap::new();
    let mut next = 0;
    for &start in images {
        if components.contains_key(&start) {
            continue;
        }
        let mut stack = vec![start];
        components.insert(start, next);
        while let Some(image) = stack.pop() {
            for &neighbor in neighbors.get(&image).into_iter().flatten() {
                if !components.contains_key(&neighbor) {
                    components.insert(neighbor, next);
                    stack.push(neighbor);
                }
            }
        }
        next += 1;
    }
    components
}

#[cfg(test)]
mod tests {
    use super::*;
    use sfm_core::CameraModelId;

    fn graph() -> CorrespondenceGraph {
        let mut graph = CorrespondenceGraph::new();
        graph.add_camera(
            CameraId(0),
            CameraIntrinsics::from_focal_length(CameraModelId::SimplePinhole, 500.0, 640, 480)
                .unwrap(),
        );
        for id in 0..3 {
            let keypoints = (0..4).map(|i| KeyPoint::new(f64::from(i), 0.0)).collect();
            graph
                .add_image(ImageId(id), GraphImage::new(format!("{}.png", id), CameraId(0), keypoints))
                .unwrap();
        }
        graph
    }

    #[test]
    fn pair_id_is_symmetric() {
        assert_eq!(pair_id(ImageId(3), ImageId(7)), pair_id(ImageId(7), ImageId(3)));
        assert_eq!(pair_id(ImageId(1), ImageId(2)), (1 << 31) - 1 + 2);
    }

    #[test]
    fn matches_are_stored_in_canonical_order() {
        let mut graph = graph();
        graph
            .add_matches(ImageId(2), ImageId(0), vec![(1, 3), (2, 0)], None)
            .unwrap();
        assert_eq!(graph.matches(ImageId(0), ImageId(2)), vec![(3, 1), (0, 2)]);
        assert_eq!(graph.matches(ImageId(2), ImageId(0)), vec![(1, 3), (2, 0)]);
        assert_eq!(
            graph.correspondences(ImageId(0), 3),
            &[Correspondence {
                image: ImageId(2),
                keypoint: 1
            }]
        );
        assert_eq!(graph.num_correspondences(ImageId(2)), 2);
        assert_eq!(graph.image_pairs()[0].a, ImageId(0));
    }

    #[test]
    fn components_follow_the_pairs_between_selected_images() {
        let mut graph = graph();
        graph
            .add_image(
                ImageId(3),
                GraphImage::new("3.png", CameraId(0), vec![KeyPoint::new(0.0, 0.0)]),
            )
            .unwrap();
        graph.add_matches(ImageId(2), ImageId(0), vec![(0, 0)], None).unwrap();
        graph.add_matches(ImageId(1), ImageId(3), vec![(1, 0)], None).unwrap();

        let all: BTreeSet<ImageId> = graph.image_ids().into_iter().collect();
        let components = connected_components(&graph, &all);
        assert_eq!(components[&ImageId(0)], 0);
        assert_eq!(components[&ImageId(2)], 0);
        assert_eq!(components[&ImageId(1)], 1);
        assert_eq!(components[&ImageId(3)], 1);

        // Without image 0 the pair to it no longer connects anything.
        let subset: BTreeSet<ImageId> = [ImageId(1), ImageId(2)].into_iter().collect();
        let components = connected_components(&graph, &subset);
        assert_eq!(components.len(), 2);
        assert_ne!(components[&ImageId(1)], components[&ImageId(2)]);
    }

    #[test]
    fn invalid_matches_are_rejected() {
        let mut graph = graph();
        assert_eq!(
            graph.add_matches(ImageId(0), ImageId(0), vec![], None),
            Err(GraphError::SelfMatch(ImageId(0)))
        );
        assert_eq!(
            graph.add_matches(ImageId(0), ImageId(1), vec![(9, 0)], None),
            Err(GraphError::KeypointOutOfRange {
                image: ImageId(0),
                keypoint: 9,
                num_keypoints: 4
            })
        );
        graph.add_matches(ImageId(0), ImageId(1), vec![(0, 0)], None).unwrap();
        assert_eq!(
            graph.add_matches(ImageId(1), ImageId(0), vec![], None),
            Err(GraphError::DuplicatePair(ImageId(1), ImageId(0)))
        );
    }
}

#![allow(dead_code)]

use rand::{rngs::SmallRng, Rng, SeedableRng};
use sfm_core::nalgebra::{IsometryMatrix3, Point3, Vector3};
use sfm_core::{
    CameraIntrinsics, CameraModelId, KeyPoint, Pose, Projective, WorldPoint, WorldToCamera,
    WorldToWorld,
};
use sfm_mapper::{
    CameraId, CorrespondenceGraph, GraphImage, Image, ImageId, MapperSettings, Observation,
    Reconstruction,
};
use std::collections::BTreeMap;

pub const WIDTH: u32 = 640;
pub const HEIGHT: u32 = 480;
pub const FOCAL_LENGTH: f64 = 500.0;

pub fn init_logger() {
    let _ = pretty_env_logger::try_init_timed();
}

pub fn camera() -> CameraIntrinsics {
    CameraIntrinsics::from_focal_length(CameraModelId::SimplePinhole, FOCAL_LENGTH, WIDTH, HEIGHT)
        .unwrap()
}

/// Settings scaled down to the synthetic scenes.
pub fn settings() -> MapperSettings {
    MapperSettings {
        min_model_size: 3,
        init_min_num_inliers: 30,
        init_min_tri_angle: 4.0,
        abs_pose_min_num_inliers: 10,
        verify_invariants: true,
        ..MapperSettings::default()
    }
}

/// Points in a cube around the origin seen by cameras on an arc around it.
pub struct Scene {
    pub points: Vec<Point3<f64>>,
    pub poses: Vec<WorldToCamera>,
    /// For every image, the keypoint of each visible point.
    pub keypoints: Vec<BTreeMap<usize, usize>>,
    pub projections: Vec<Vec<KeyPoint>>,
}

impl Scene {
    /// `num_images` cameras `step` degrees apart on a circle of radius 6, looking at the origin.
    pub fn ring(num_images: usize, step: f64, num_points: usize, seed: u64) -> Self {
        let mut rng = SmallRng::seed_from_u64(seed);
        let points: Vec<Point3<f64>> = (0..num_points)
            .map(|_| {
                Point3::new(
                    rng.gen_range(-1.5..1.5),
                    rng.gen_range(-1.5..1.5),
                    rng.gen_range(-1.5..1.5),
                )
            })
            .collect();
        let poses: Vec<WorldToCamera> = (0..num_images)
            .map(|ix| {
                let angle = (ix as f64 * step).to_radians();
                let eye = Point3::new(
                    6.0 * angle.sin(),
                    0.2 * (ix % 2) as f64,
                    -6.0 * angle.cos(),
                );
                let camera_to_world =
                    IsometryMatrix3::face_towards(&eye, &Point3::origin(), &Vector3::y());
                WorldToCamera(camera_to_world.inverse())
            })
            .collect();

        let camera = camera();
        let mut keypoints = vec![];
        let mut projections = vec![];
        for pose in &poses {
            let mut visible = BTreeMap::new();
            let mut projected = vec![];
            for (ix, point) in points.iter().enumerate() {
                let keypoint = match camera.project(pose.transform(WorldPoint::from_point(*point)))
                {
                    Some(keypoint) => keypoint,
                    None => continue,
                };
                let inside = (0.0..f64::from(WIDTH)).contains(&keypoint.0.x)
                    && (0.0..f64::from(HEIGHT)).contains(&keypoint.0.y);
                if inside {
                    visible.insert(ix, projected.len());
                    projected.push(keypoint);
                }
            }
            keypoints.push(visible);
            projections.push(projected);
        }
        Self {
            points,
            poses,
            keypoints,
            projections,
        }
    }

    pub fn num_images(&self) -> usize {
        self.poses.len()
    }

    pub fn name(image: usize) -> String {
        format!("image_{:03}.png", image)
    }

    /// Matches between every pair of images for which `connected` holds.
    pub fn graph_with(&self, connected: impl Fn(usize, usize) -> bool) -> CorrespondenceGraph {
        let mut graph = CorrespondenceGraph::new();
        graph.add_camera(CameraId(0), camera());
        for (ix, projections) in self.projections.iter().enumerate() {
            let colors = self.keypoints[ix]
                .keys()
                .map(|&point| [(point % 256) as u8, 128, 64])
                .collect();
            graph
                .add_image(
                    ImageId(ix as u32),
                    GraphImage::new(Self::name(ix), CameraId(0), projections.clone()).colors(colors),
                )
                .unwrap();
        }
        for a in 0..self.num_images() {
            for b in a + 1..self.num_images() {
                if !connected(a, b) {
                    continue;
                }
                let matches: Vec<(usize, usize)> = self.keypoints[a]
                    .iter()
                    .filter_map(|(point, &ka)| Some((ka, *self.keypoints[b].get(point)?)))
                    .collect();
                if !matches.is_empty() {
                    graph
                        .add_matches(ImageId(a as u32), ImageId(b as u32), matches, None)
                        .unwrap();
                }
            }
        }
        graph
    }

    pub fn graph(&self) -> CorrespondenceGraph {
        self.graph_with(|_, _| true)
    }

    /// Moves every keypoint by up to `noise` pixels along each axis.
    pub fn perturb(&mut self, noise: f64, seed: u64) {
        let mut rng = SmallRng::seed_from_u64(seed);
        for keypoint in self.projections.iter_mut().flatten() {
            keypoint.0.x += rng.gen_range(-noise..noise);
            keypoint.0.y += rng.gen_range(-noise..noise);
        }
    }

    /// Like `graph_with`, but the second keypoints of roughly `fraction` of the matches of
    /// every pair accepted by `corrupt` are shuffled among themselves. The matches stay
    /// one-to-one.
    pub fn graph_with_outliers(
        &self,
        fraction: f64,
        seed: u64,
        corrupt: impl Fn(usize, usize) -> bool,
    ) -> CorrespondenceGraph {
        let mut rng = SmallRng::seed_from_u64(seed);
        let mut graph = self.graph_with(|_, _| false);
        for a in 0..self.num_images() {
            for b in a + 1..self.num_images() {
                let mut matches: Vec<(usize, usize)> = self.keypoints[a]
                    .iter()
                    .filter_map(|(point, &ka)| Some((ka, *self.keypoints[b].get(point)?)))
                    .collect();
                if matches.is_empty() {
                    continue;
                }
                if corrupt(a, b) {
                    let chosen: Vec<usize> = (0..matches.len())
                        .filter(|_| rng.gen_bool(fraction))
                        .collect();
                    if chosen.len() >= 2 {
                        let targets: Vec<usize> = chosen.iter().map(|&ix| matches[ix].1).collect();
                        for (n, &ix) in chosen.iter().enumerate() {
                            matches[ix].1 = targets[(n + 1) % targets.len()];
                        }
                    }
                }
                graph
                    .add_matches(ImageId(a as u32), ImageId(b as u32), matches, None)
                    .unwrap();
            }
        }
        graph
    }

    /// The exact reconstruction of some of the images, expressed in the frame that
    /// `frame` maps the scene into.
    pub fn reconstruction(&self, images: &[usize], frame: WorldToWorld) -> Reconstruction {
        let mut model = Reconstruction::new();
        model.add_camera(CameraId(0), camera()).unwrap();
        for &ix in images {
            let id = ImageId(ix as u32);
            model
                .add_image(
                    id,
                    Image::new(Self::name(ix), CameraId(0), self.projections[ix].clone()),
                )
                .unwrap();
            model
                .register_image(id, frame.transform_pose(self.poses[ix]))
                .unwrap();
        }
        for (point_ix, point) in self.points.iter().enumerate() {
            let observations: Vec<Observation> = images
                .iter()
                .filter_map(|&ix| {
                    let keypoint = *self.keypoints[ix].get(&point_ix)?;
                    Some(Observation::new(ImageId(ix as u32), keypoint))
                })
                .collect();
            if observations.len() >= 2 {
                model
                    .add_track(frame.transform_point(point), observations, [0; 3])
                    .unwrap();
            }
        }
        model
    }

    /// The center of an image in the scene frame.
    pub fn center(&self, image: usize) -> Point3<f64> {
        self.poses[image].center()
    }
}

use crate::{
    Image, ImageId, MergeError, MergeSettings, Observation, Reconstruction, SceneError, TrackKey,
};
use itertools::Itertools;
use log::*;
use sfm_core::nalgebra::{Point3, UnitVector3};
use sfm_core::{CameraModel, Projective, TriangulatorObservations, WorldToCamera, WorldToWorld};
use sfm_geom::triangulation::LinearEigenTriangulator;
use sfm_geom::SimilarityEstimator;

/// What a merge did to the first model.
#[derive(Debug, Clone, PartialEq)]
pub struct MergeReport {
    /// Maps the frame of the second model onto the frame of the first.
    pub similarity: WorldToWorld,
    /// Images registered in both models.
    pub shared_images: usize,
    /// Shared images whose centers agreed with the similarity.
    pub inlier_images: usize,
    /// Images of the second model that were registered into the first.
    pub added_images: usize,
    /// Tracks of the second model united with a track of the first.
    pub merged_tracks: usize,
    /// Tracks of the second model added as new tracks.
    pub inserted_tracks: usize,
    /// Tracks of the second model with too few free observations left to be added.
    pub dropped_tracks: usize,
}

/// Unites two models that were grown independently but share registered images.
///
/// The second model is aligned to the first through a similarity fitted to the centers of the
/// shared images. A failed alignment leaves both models untouched.
#[derive(Debug, Clone)]
pub struct ModelMerger {
    settings: MergeSettings,
    triangulator: LinearEigenTriangulator,
}

impl ModelMerger {
    pub fn new(settings: MergeSettings) -> Self {
        Self {
            settings,
            triangulator: LinearEigenTriangulator::new(),
        }
    }

    /// Merge `b` into `a`.
    ///
    /// Images registered in both keep their pose in `a`. Every other image of `b` is added with
    /// its aligned pose. A track of `b` that sees a keypoint of a track of `a` is united with it
    /// if the union reprojects within `max_reproj_error`, and added as a new track otherwise.
    pub fn merge(
        &self,
        a: &mut Reconstruction,
        b: &Reconstruction,
    ) -> Result<MergeReport, MergeError> {
        let mut report = MergeReport {
            similarity: WorldToWorld::identity(),
            shared_images: 0,
            inlier_images: 0,
            added_images: 0,
            merged_tracks: 0,
            inserted_tracks: 0,
            dropped_tracks: 0,
        };
        if b.num_registered_images() == 0 {
            debug!("second model is empty, nothing to merge");
            return Ok(report);
        }

        // Align the shared camera centers.
        let shared: Vec<ImageId> = b
            .registered_images()
            .iter()
            .copied()
            .filter(|&image| a.is_registered(image))
            .sorted()
            .collect();
        report.shared_images = shared.len();
        if shared.len() < self.settings.min_common_images {
            return Err(MergeError::TooFewSharedImages {
                found: shared.len(),
                required: self.settings.min_common_images,
            });
        }
        let centers = |model: &Reconstruction| -> Vec<Point3<f64>> {
            shared
                .iter()
                .filter_map(|&image| model.image(image).and_then(Image::center))
                .collect()
        };
        let centers_a = centers(a);
        let centers_b = centers(b);
        let estimator = SimilarityEstimator::new()
            .outlier_factor(self.settings.outlier_factor)
            .max_iterations(self.settings.max_alignment_iterations)
            .min_inlier_ratio(self.settings.min_inlier_ratio);
        if estimator.is_degenerate(&centers_a) || estimator.is_degenerate(&centers_b) {
            return Err(MergeError::CollinearCenters);
        }
        let (similarity, inliers) = estimator
            .estimate_robust(&centers_b, &centers_a)
            .ok_or(MergeError::NoConsistentSimilarity)?;
        report.similarity = similarity;
        report.inlier_images = inliers.len();
        info!(
            "aligned models through {} of {} shared images with scale {}",
            inliers.len(),
            shared.len(),
            similarity.scale()
        );

        let mut aligned = b.clone();
        aligned.transform(similarity);
        let mut merged = a.clone();
        self.add_images(&mut merged, &aligned, &mut report)?;
        self.add_tracks(&mut merged, &aligned, &mut report)?;

        info!(
            "merged {} images: united {} tracks, inserted {} tracks, dropped {} tracks",
            report.added_images, report.merged_tracks, report.inserted_tracks, report.dropped_tracks
        );
        *a = merged;
        Ok(report)
    }

    fn add_images(
        &self,
        merged: &mut Reconstruction,
        aligned: &Reconstruction,
        report: &mut MergeReport,
    ) -> Result<(), SceneError> {
        for (id, camera) in aligned.cameras() {
            if !merged.has_camera(id) {
                merged.add_camera(id, camera.clone())?;
            }
        }
        for (id, image) in aligned.images() {
            if !merged.has_image(id) {
                merged.add_image(
                    id,
                    Image::new(image.name(), image.camera(), image.keypoints().to_vec()),
                )?;
            }
        }
        // Register in the order of the second model so that its gauge images come first.
        for &id in aligned.registered_images() {
            if merged.is_registered(id) {
                continue;
            }
            if let Some(pose) = aligned.image(id).and_then(Image::pose) {
                merged.register_image(id, pose)?;
                report.added_images += 1;
            }
        }
        Ok(())
    }

    fn add_tracks(
        &self,
        merged: &mut Reconstruction,
        aligned: &Reconstruction,
        report: &mut MergeReport,
    ) -> Result<(), SceneError> {
        for (_, track) in aligned.tracks() {
            let observations: Vec<Observation> = track.observations().collect();
            let targets: Vec<TrackKey> = observations
                .iter()
                .filter_map(|o| merged.image_track(o.image, o.keypoint))
                .unique()
                .collect();
            let mut united = false;
            for target in targets {
                if self.try_union(merged, target, &observations)? {
                    united = true;
                    break;
                }
            }
            if united {
                report.merged_tracks += 1;
                continue;
            }

            let free: Vec<Observation> = observations
                .iter()
                .copied()
                .filter(|&o| is_free(merged, o))
                .collect();
            if merged.check_track(&track.point, &free).is_ok() {
                merged.add_track(track.point, free, track.color)?;
                report.inserted_tracks += 1;
            } else {
                report.dropped_tracks += 1;
            }
        }
        Ok(())
    }

    /// Extend `target` by the observations it does not have yet.
    ///
    /// The union is retriangulated and every observation has to reproject within
    /// `max_reproj_error`. Observations of images the target already sees are skipped.
    fn try_union(
        &self,
        merged: &mut Reconstruction,
        target: TrackKey,
        observations: &[Observation],
    ) -> Result<bool, SceneError> {
        let existing: Vec<Observation> = match merged.track(target) {
            Some(track) => track.observations().collect(),
            None => return Ok(false),
        };
        let additions: Vec<Observation> = observations
            .iter()
            .copied()
            .filter(|o| existing.iter().all(|e| e.image != o.image))
            .filter(|&o| is_free(merged, o))
            .collect();
        let union: Vec<Observation> = existing.iter().chain(&additions).copied().collect();
        let point = match self.triangulate(merged, &union) {
            Some(point) => point,
            None => return Ok(false),
        };
        let consistent = union.iter().all(|&o| {
            merged
                .observation_error(o, &point)
                .map_or(false, |error| error <= self.settings.max_reproj_error)
        });
        if !consistent {
            return Ok(false);
        }
        for observation in additions {
            merged.add_observation(target, observation)?;
        }
        if let Some(track) = merged.track_mut(target) {
            track.point = point;
        }
        merged.update_track_error(target);
        Ok(true)
    }

    fn triangulate(
        &self,
        model: &Reconstruction,
        observations: &[Observation],
    ) -> Option<Point3<f64>> {
        let pairs: Vec<(WorldToCamera, UnitVector3<f64>)> = observations
            .iter()
            .filter_map(|o| {
                let (camera, pose) = model.image_camera_pose(o.image)?;
                let keypoint = model.image(o.image)?.keypoint(o.keypoint)?;
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
}

/// Merge `b` into `a` with default settings and the given reprojection tolerance.
///
/// Returns `false` and leaves `a` untouched if the models could not be aligned.
pub fn merge_reconstructions(
    a: &mut Reconstruction,
    b: &Reconstruction,
    max_reproj_error: f64,
) -> bool {
    let settings = MergeSettings {
        max_reproj_error,
        ..MergeSettings::default()
    };
    match ModelMerger::new(settings).merge(a, b) {
        Ok(_) => true,
        Err(err) => {
            info!("models were not merged: {}", err);
            false
        }
    }
}

/// Whether a keypoint exists in a registered image and belongs to no track.
fn is_free(model: &Reconstruction, observation: Observation) -> bool {
    model.image(observation.image).map_or(false, |image| {
        image.is_registered()
            && observation.keypoint < image.num_keypoints()
            && image.track(observation.keypoint).is_none()
    })
}

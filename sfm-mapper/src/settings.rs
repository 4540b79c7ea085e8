#[cfg(feature = "serde-serialize")]
use serde::{Deserialize, Serialize};

/// The settings of the incremental mapper and the engine that drives it.
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct MapperSettings {
    /// Models that end with fewer registered images than this are discarded.
    #[cfg_attr(
        feature = "serde-serialize",
        serde(default = "default_min_model_size")
    )]
    pub min_model_size: usize,
    /// Seed a new model when the current one stalls and unregistered images remain.
    #[cfg_attr(
        feature = "serde-serialize",
        serde(default = "default_multiple_models")
    )]
    pub multiple_models: bool,
    /// The maximum number of models kept by one run.
    #[cfg_attr(
        feature = "serde-serialize",
        serde(default = "default_max_num_models")
    )]
    pub max_num_models: usize,
    /// Worker threads growing models concurrently. Each model is grown by exactly one worker.
    #[cfg_attr(
        feature = "serde-serialize",
        serde(default = "default_num_threads")
    )]
    pub num_threads: usize,
    /// Seed for the consensus random number generators. Each model derives its own stream from it.
    #[cfg_attr(
        feature = "serde-serialize",
        serde(default = "default_random_seed")
    )]
    pub random_seed: u64,
    /// Run the full reconstruction sanity check after every engine iteration.
    #[cfg_attr(
        feature = "serde-serialize",
        serde(default = "default_verify_invariants")
    )]
    pub verify_invariants: bool,
    /// The minimum number of two-view inliers for a seed pair.
    #[cfg_attr(
        feature = "serde-serialize",
        serde(default = "default_init_min_num_inliers")
    )]
    pub init_min_num_inliers: usize,
    /// The maximum epipolar error in pixels of a seed pair inlier.
    #[cfg_attr(
        feature = "serde-serialize",
        serde(default = "default_init_max_error")
    )]
    pub init_max_error: f64,
    /// The maximum component of the seed baseline along the viewing direction of the first image.
    /// Pure forward motion triangulates poorly.
    #[cfg_attr(
        feature = "serde-serialize",
        serde(default = "default_init_max_forward_motion")
    )]
    pub init_max_forward_motion: f64,
    /// The median triangulation angle in degrees a seed pair must reach.
    #[cfg_attr(
        feature = "serde-serialize",
        serde(default = "default_init_min_tri_angle")
    )]
    pub init_min_tri_angle: f64,
    /// How many times an image may take part in a failed seed pair before it is no longer tried as a seed.
    #[cfg_attr(
        feature = "serde-serialize",
        serde(default = "default_init_max_reg_trials")
    )]
    pub init_max_reg_trials: usize,
    /// The maximum reprojection error in pixels of an absolute pose inlier.
    #[cfg_attr(
        feature = "serde-serialize",
        serde(default = "default_abs_pose_max_error")
    )]
    pub abs_pose_max_error: f64,
    /// The minimum number of absolute pose inliers to register an image.
    #[cfg_attr(
        feature = "serde-serialize",
        serde(default = "default_abs_pose_min_num_inliers")
    )]
    pub abs_pose_min_num_inliers: usize,
    /// The minimum ratio of absolute pose inliers to 2D-3D correspondences to register an image.
    #[cfg_attr(
        feature = "serde-serialize",
        serde(default = "default_abs_pose_min_inlier_ratio")
    )]
    pub abs_pose_min_inlier_ratio: f64,
    /// Refine the absolute pose on its inliers after consensus.
    #[cfg_attr(
        feature = "serde-serialize",
        serde(default = "default_abs_pose_refine")
    )]
    pub abs_pose_refine: bool,
    /// How many failed registrations an image may accumulate in one model before it is abandoned for that model.
    #[cfg_attr(
        feature = "serde-serialize",
        serde(default = "default_max_reg_trials")
    )]
    pub max_reg_trials: usize,
    /// The minimum triangulation angle in degrees of a track.
    #[cfg_attr(
        feature = "serde-serialize",
        serde(default = "default_min_tri_angle")
    )]
    pub min_tri_angle: f64,
    /// The maximum reprojection error in pixels of an observation.
    #[cfg_attr(
        feature = "serde-serialize",
        serde(default = "default_max_reproj_error")
    )]
    pub max_reproj_error: f64,
    /// The maximum reprojection error in pixels for merging two tracks.
    #[cfg_attr(
        feature = "serde-serialize",
        serde(default = "default_merge_max_reproj_error")
    )]
    pub merge_max_reproj_error: f64,
    /// The maximum reprojection error in pixels for completing a track with a further observation.
    #[cfg_attr(
        feature = "serde-serialize",
        serde(default = "default_complete_max_reproj_error")
    )]
    pub complete_max_reproj_error: f64,
    /// The number of most recently registered images refined by local bundle adjustment.
    #[cfg_attr(
        feature = "serde-serialize",
        serde(default = "default_local_ba_num_images")
    )]
    pub local_ba_num_images: usize,
    /// Run global bundle adjustment when the registered images grew by this ratio since the last global pass.
    #[cfg_attr(
        feature = "serde-serialize",
        serde(default = "default_global_ba_images_ratio")
    )]
    pub global_ba_images_ratio: f64,
    /// Run global bundle adjustment when the tracks grew by this ratio since the last global pass.
    #[cfg_attr(
        feature = "serde-serialize",
        serde(default = "default_global_ba_points_ratio")
    )]
    pub global_ba_points_ratio: f64,
    /// Let bundle adjustment refine focal lengths.
    #[cfg_attr(
        feature = "serde-serialize",
        serde(default = "default_ba_refine_focal_length")
    )]
    pub ba_refine_focal_length: bool,
    /// Let bundle adjustment refine principal points.
    #[cfg_attr(
        feature = "serde-serialize",
        serde(default = "default_ba_refine_principal_point")
    )]
    pub ba_refine_principal_point: bool,
    /// Let bundle adjustment refine distortion parameters.
    #[cfg_attr(
        feature = "serde-serialize",
        serde(default = "default_ba_refine_extra_params")
    )]
    pub ba_refine_extra_params: bool,
    /// Solver patience of local bundle adjustment.
    #[cfg_attr(
        feature = "serde-serialize",
        serde(default = "default_local_ba_patience")
    )]
    pub local_ba_patience: usize,
    /// Solver patience of global bundle adjustment.
    #[cfg_attr(
        feature = "serde-serialize",
        serde(default = "default_global_ba_patience")
    )]
    pub global_ba_patience: usize,
    /// Images whose focal length divided by the larger image dimension falls below this are deregistered.
    #[cfg_attr(
        feature = "serde-serialize",
        serde(default = "default_min_focal_length_ratio")
    )]
    pub min_focal_length_ratio: f64,
    /// Images whose focal length divided by the larger image dimension exceeds this are deregistered.
    #[cfg_attr(
        feature = "serde-serialize",
        serde(default = "default_max_focal_length_ratio")
    )]
    pub max_focal_length_ratio: f64,
    /// Images whose camera has a distortion parameter larger than this in magnitude are deregistered.
    #[cfg_attr(
        feature = "serde-serialize",
        serde(default = "default_max_extra_param")
    )]
    pub max_extra_param: f64,
}

impl Default for MapperSettings {
    fn default() -> Self {
        Self {
            min_model_size: default_min_model_size(),
            multiple_models: default_multiple_models(),
            max_num_models: default_max_num_models(),
            num_threads: default_num_threads(),
            random_seed: default_random_seed(),
            verify_invariants: default_verify_invariants(),
            init_min_num_inliers: default_init_min_num_inliers(),
            init_max_error: default_init_max_error(),
            init_max_forward_motion: default_init_max_forward_motion(),
            init_min_tri_angle: default_init_min_tri_angle(),
            init_max_reg_trials: default_init_max_reg_trials(),
            abs_pose_max_error: default_abs_pose_max_error(),
            abs_pose_min_num_inliers: default_abs_pose_min_num_inliers(),
            abs_pose_min_inlier_ratio: default_abs_pose_min_inlier_ratio(),
            abs_pose_refine: default_abs_pose_refine(),
            max_reg_trials: default_max_reg_trials(),
            min_tri_angle: default_min_tri_angle(),
            max_reproj_error: default_max_reproj_error(),
            merge_max_reproj_error: default_merge_max_reproj_error(),
            complete_max_reproj_error: default_complete_max_reproj_error(),
            local_ba_num_images: default_local_ba_num_images(),
            global_ba_images_ratio: default_global_ba_images_ratio(),
            global_ba_points_ratio: default_global_ba_points_ratio(),
            ba_refine_focal_length: default_ba_refine_focal_length(),
            ba_refine_principal_point: default_ba_refine_principal_point(),
            ba_refine_extra_params: default_ba_refine_extra_params(),
            local_ba_patience: default_local_ba_patience(),
            global_ba_patience: default_global_ba_patience(),
            min_focal_length_ratio: default_min_focal_length_ratio(),
            max_focal_length_ratio: default_max_focal_length_ratio(),
            max_extra_param: default_max_extra_param(),
        }
    }
}

impl MapperSettings {
    /// The settings used to seed a model after every seed pair failed with the defaults.
    ///
    /// Each relaxation halves the inlier requirement and the angle requirement.
    #[must_use]
    pub fn relaxed_seed(self) -> Self {
        Self {
            init_min_num_inliers: (self.init_min_num_inliers / 2).max(8),
            init_min_tri_angle: self.init_min_tri_angle / 2.0,
            ..self
        }
    }
}

/// The settings of the model merger.
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct MergeSettings {
    /// The maximum reprojection error in pixels of a track of one model in the other model for the two tracks to be united.
    #[cfg_attr(
        feature = "serde-serialize",
        serde(default = "default_model_merge_max_reproj_error")
    )]
    pub max_reproj_error: f64,
    /// The minimum number of images registered in both models.
    #[cfg_attr(
        feature = "serde-serialize",
        serde(default = "default_merge_min_common_images")
    )]
    pub min_common_images: usize,
    /// Shared camera centers farther than this multiple of the median distance from their aligned position are outliers.
    #[cfg_attr(
        feature = "serde-serialize",
        serde(default = "default_merge_outlier_factor")
    )]
    pub outlier_factor: f64,
    /// Rounds of outlier rejection while aligning the models.
    #[cfg_attr(
        feature = "serde-serialize",
        serde(default = "default_merge_max_alignment_iterations")
    )]
    pub max_alignment_iterations: usize,
    /// The minimum fraction of shared images that must agree with the alignment.
    #[cfg_attr(
        feature = "serde-serialize",
        serde(default = "default_merge_min_inlier_ratio")
    )]
    pub min_inlier_ratio: f64,
}

impl Default for MergeSettings {
    fn default() -> Self {
        Self {
            max_reproj_error: default_model_merge_max_reproj_error(),
            min_common_images: default_merge_min_common_images(),
            outlier_factor: default_merge_outlier_factor(),
            max_alignment_iterations: default_merge_max_alignment_iterations(),
            min_inlier_ratio: default_merge_min_inlier_ratio(),
        }
    }
}

fn default_min_model_size() -> usize {
    10
}

fn default_multiple_models() -> bool {
    true
}

fn default_max_num_models() -> usize {
    50
}

fn default_num_threads() -> usize {
    1
}

fn default_random_seed() -> u64 {
    0
}

fn default_verify_invariants() -> bool {
    cfg!(debug_assertions)
}

fn default_init_min_num_inliers() -> usize {
    100
}

fn default_init_max_error() -> f64 {
    4.0
}

fn default_init_max_forward_motion() -> f64 {
    0.95
}

fn default_init_min_tri_angle() -> f64 {
    16.0
}

fn default_init_max_reg_trials() -> usize {
    2
}

fn default_abs_pose_max_error() -> f64 {
    12.0
}

fn default_abs_pose_min_num_inliers() -> usize {
    30
}

fn default_abs_pose_min_inlier_ratio() -> f64 {
    0.25
}

fn default_abs_pose_refine() -> bool {
    true
}

fn default_max_reg_trials() -> usize {
    3
}

fn default_min_tri_angle() -> f64 {
    1.5
}

fn default_max_reproj_error() -> f64 {
    4.0
}

fn default_merge_max_reproj_error() -> f64 {
    4.0
}

fn default_complete_max_reproj_error() -> f64 {
    4.0
}

fn default_local_ba_num_images() -> usize {
    6
}

fn default_global_ba_images_ratio() -> f64 {
    1.1
}

fn default_global_ba_points_ratio() -> f64 {
    1.1
}

fn default_ba_refine_focal_length() -> bool {
    true
}

fn default_ba_refine_principal_point() -> bool {
    false
}

fn default_ba_refine_extra_params() -> bool {
    true
}

fn default_local_ba_patience() -> usize {
    25
}

fn default_global_ba_patience() -> usize {
    50
}

fn default_min_focal_length_ratio() -> f64 {
    0.1
}

fn default_max_focal_length_ratio() -> f64 {
    10.0
}

fn default_max_extra_param() -> f64 {
    1.0
}

fn default_model_merge_max_reproj_error() -> f64 {
    64.0
}

fn default_merge_min_common_images() -> usize {
    3
}

fn default_merge_outlier_factor() -> f64 {
    3.0
}

fn default_merge_max_alignment_iterations() -> usize {
    10
}

fn default_merge_min_inlier_ratio() -> f64 {
    0.5
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_tolerances_differ_between_mapper_and_merger() {
        assert_eq!(MapperSettings::default().merge_max_reproj_error, 4.0);
        assert_eq!(MergeSettings::default().max_reproj_error, 64.0);
    }

    #[cfg(feature = "serde-serialize")]
    #[test]
    fn missing_fields_take_defaults() {
        let settings: MapperSettings =
            serde_json::from_str(r#"{ "min_model_size": 3, "max_reproj_error": 2.0 }"#).unwrap();
        assert_eq!(settings.min_model_size, 3);
        assert_eq!(settings.max_reproj_error, 2.0);
        assert_eq!(settings.abs_pose_min_num_inliers, 30);
        assert_eq!(settings.merge_max_reproj_error, 4.0);
        let merge: MergeSettings = serde_json::from_str("{}").unwrap();
        assert_eq!(merge, MergeSettings::default());
        assert_eq!(merge.max_reproj_error, 64.0);
    }
}

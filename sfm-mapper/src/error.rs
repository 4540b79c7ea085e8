use crate::{CameraId, ImageId, TrackKey};
use thiserror::Error;

/// Violations of the scene model invariants.
///
/// These indicate a defect in whoever drives the [`Reconstruction`](crate::Reconstruction).
/// Operations reject them with an error, and builds with debug assertions panic instead.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum SceneError {
    #[error("image {0} does not exist")]
    UnknownImage(ImageId),
    #[error("camera {0} does not exist")]
    UnknownCamera(CameraId),
    #[error("track {0:?} does not exist")]
    UnknownTrack(TrackKey),
    #[error("image {0} already exists")]
    DuplicateImage(ImageId),
    #[error("camera {0} already exists")]
    DuplicateCamera(CameraId),
    #[error("image {0} is not registered")]
    ImageNotRegistered(ImageId),
    #[error("image {0} is already registered")]
    ImageAlreadyRegistered(ImageId),
    #[error("image {image} has {num_keypoints} keypoints, but keypoint {keypoint} was referenced")]
    KeypointOutOfRange {
        image: ImageId,
        keypoint: usize,
        num_keypoints: usize,
    },
    #[error("keypoint {keypoint} of image {image} already belongs to track {track:?}")]
    KeypointAlreadyLinked {
        image: ImageId,
        keypoint: usize,
        track: TrackKey,
    },
    #[error("keypoint {keypoint} of image {image} does not belong to a track")]
    KeypointNotLinked { image: ImageId, keypoint: usize },
    #[error("image {0} observes the same track twice")]
    DuplicateObservation(ImageId),
    #[error("a track needs observations from two images, but {0} were given")]
    TooFewObservations(usize),
    #[error("the observations of a track have no triangulation angle")]
    DegenerateTrack,
    #[error("tracks {0:?} and {1:?} share an image")]
    ConflictingTracks(TrackKey, TrackKey),
    #[error("image {0} has an inconsistent observation count")]
    ObservationCount(ImageId),
    #[error("registration order is inconsistent for image {0}")]
    RegistrationOrder(ImageId),
}

/// Expected reasons a merge of two models does not happen.
///
/// Neither input is changed when a merge fails.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum MergeError {
    #[error("models share {found} registered images, at least {required} are required")]
    TooFewSharedImages { found: usize, required: usize },
    #[error("camera centers of the shared images are collinear")]
    CollinearCenters,
    #[error("no similarity is consistent with enough of the shared images")]
    NoConsistentSimilarity,
    #[error("merging produced an inconsistent scene: {0}")]
    Scene(#[from] SceneError),
}

/// Errors in building a [`CorrespondenceGraph`](crate::CorrespondenceGraph).
#[derive(Debug, Error, Clone, PartialEq)]
pub enum GraphError {
    #[error("image {0} does not exist")]
    UnknownImage(ImageId),
    #[error("camera {0} does not exist")]
    UnknownCamera(CameraId),
    #[error("image {0} already exists")]
    DuplicateImage(ImageId),
    #[error("matches between {0} and {1} were already added")]
    DuplicatePair(ImageId, ImageId),
    #[error("image {0} cannot be matched with itself")]
    SelfMatch(ImageId),
    #[error("image {image} has {num_keypoints} keypoints, but keypoint {keypoint} was matched")]
    KeypointOutOfRange {
        image: ImageId,
        keypoint: usize,
        num_keypoints: usize,
    },
    #[error("image {image} has {num_keypoints} keypoints but {num_colors} colors")]
    ColorCount {
        image: ImageId,
        num_keypoints: usize,
        num_colors: usize,
    },
}

/// Failures of a mapping run that are reported to the caller.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum MapperError {
    #[error("the correspondence graph has no image pairs to reconstruct from")]
    EmptyGraph,
    #[error("no image pair satisfies the seeding requirements")]
    NoSeedPair,
    #[error("the mapper is already running")]
    AlreadyRunning,
    #[error("the mapper was never started")]
    NotStarted,
    #[error("a mapper worker panicked")]
    WorkerPanicked,
    #[error(transparent)]
    Scene(#[from] SceneError),
}

/// Reject a violated invariant.
///
/// The error is returned from the enclosing function, which must return a `Result` whose error
/// type is convertible from the given error. With debug assertions the violation panics instead.
macro_rules! violation {
    ($err:expr) => {{
        let err = $err;
        if cfg!(debug_assertions) {
            panic!("scene invariant violated: {}", err);
        }
        log::error!("scene invariant violated: {}", err);
        return Err(err.into());
    }};
}

/// Reject the error with [`violation`] unless the condition holds.
macro_rules! invariant {
    ($cond:expr, $err:expr) => {
        if !$cond {
            $crate::error::violation!($err)
        }
    };
}

pub(crate) use invariant;
pub(crate) use violation;

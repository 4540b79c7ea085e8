//! # SfM Mapper
//!
//! Incremental reconstruction of camera poses and a sparse point cloud from images whose
//! pairwise correspondences have already been verified.
//!
//! * [`Reconstruction`] is the scene model of one model: cameras, images and tracks.
//! * [`ReconstructionManager`] holds every model of a run.
//! * [`Correspondences`] is the read-only input, with [`CorrespondenceGraph`] as an in-memory
//!   implementation.
//! * [`IncrementalMapper`] grows one model: seeding, selecting the next image, registering it,
//!   and triangulating tracks.
//! * [`RefinementScheduler`] decides when to run local and global bundle adjustment.
//! * [`ModelMerger`] aligns two models with a similarity and unites them.
//! * [`MapperController`] runs the whole state machine on worker threads, emitting
//!   [`MapperEvent`]s and honoring cancellation.

mod claims;
mod engine;
mod error;
mod events;
mod graph;
mod manager;
mod mapper;
mod merge;
mod refine;
mod scene;
mod settings;

pub use claims::*;
pub use engine::*;
pub use error::{GraphError, MapperError, MergeError, SceneError};
pub use events::*;
pub use graph::*;
pub use manager::*;
pub use mapper::*;
pub use merge::*;
pub use refine::*;
pub use scene::*;
pub use settings::*;

use derive_more::{Display, From, Into};
use slotmap::new_key_type;

#[cfg(feature = "serde-serialize")]
use serde::{Deserialize, Serialize};

new_key_type! {
    pub struct TrackKey;
}

/// The stable external id of an image, shared by every model built from the same images.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, From, Into)]
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
pub struct ImageId(pub u32);

/// The external id of a camera, which several images may share.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, From, Into)]
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
pub struct CameraId(pub u32);

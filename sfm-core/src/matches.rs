use crate::WorldPoint;
use nalgebra::UnitVector3;

/// A bearing in one camera matched to a bearing in another camera.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FeatureMatch(pub UnitVector3<f64>, pub UnitVector3<f64>);

/// A bearing in a camera matched to a point in the world.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FeatureWorldMatch(pub UnitVector3<f64>, pub WorldPoint);

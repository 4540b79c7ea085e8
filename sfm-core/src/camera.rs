use crate::{CameraPoint, ImagePoint, KeyPoint, Projective};
use core::fmt;
use nalgebra::{Matrix2, Point2, UnitVector3, Vector2};
use thiserror::Error;

#[cfg(feature = "serde-serialize")]
use serde::{Deserialize, Serialize};

/// Allows conversion between the point on an image and the internal projection
/// which can describe the bearing of the projection out of the camera.
pub trait CameraModel {
    /// Extracts a bearing from a pixel location in an image.
    ///
    /// The bearings X axis points right, Y axis points down, and Z axis points forwards.
    /// The image point uses the same coordiate frame. Its Y is down and its X is right.
    fn calibrate<P>(&self, point: P) -> UnitVector3<f64>
    where
        P: ImagePoint;

    /// Extracts the pixel location in the image from the bearing.
    ///
    /// Since this might not be possible (if bearing is behind camera for pinhole camera),
    /// this operation is fallible.
    fn uncalibrate(&self, bearing: UnitVector3<f64>) -> Option<KeyPoint>;
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum CameraError {
    #[error("camera model {model} takes {expected} parameters, but {found} were given")]
    ParameterCount {
        model: CameraModelId,
        expected: usize,
        found: usize,
    },
    #[error("unknown camera model id {0}")]
    UnknownModel(u32),
    #[error("camera dimensions must be non-zero, got {width}x{height}")]
    EmptyImage { width: u32, height: u32 },
}

/// Identifies the parameter layout of a [`CameraIntrinsics`].
///
/// | model            | id | params                                 |
/// |------------------|----|----------------------------------------|
/// | `SIMPLE_PINHOLE` | 0  | `f, cx, cy`                            |
/// | `PINHOLE`        | 1  | `fx, fy, cx, cy`                       |
/// | `SIMPLE_RADIAL`  | 2  | `f, cx, cy, k`                         |
/// | `RADIAL`         | 3  | `f, cx, cy, k1, k2`                    |
/// | `OPENCV`         | 4  | `fx, fy, cx, cy, k1, k2, p1, p2`       |
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
pub enum CameraModelId {
    SimplePinhole,
    Pinhole,
    SimpleRadial,
    Radial,
    OpenCv,
}

impl CameraModelId {
    pub fn from_id(id: u32) -> Result<Self, CameraError> {
        Ok(match id {
            0 => Self::SimplePinhole,
            1 => Self::Pinhole,
            2 => Self::SimpleRadial,
            3 => Self::Radial,
            4 => Self::OpenCv,
            _ => return Err(CameraError::UnknownModel(id)),
        })
    }

    pub fn id(self) -> u32 {
        match self {
            Self::SimplePinhole => 0,
            Self::Pinhole => 1,
            Self::SimpleRadial => 2,
            Self::Radial => 3,
            Self::OpenCv => 4,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::SimplePinhole => "SIMPLE_PINHOLE",
            Self::Pinhole => "PINHOLE",
            Self::SimpleRadial => "SIMPLE_RADIAL",
            Self::Radial => "RADIAL",
            Self::OpenCv => "OPENCV",
        }
    }

    pub fn num_params(self) -> usize {
        match self {
            Self::SimplePinhole => 3,
            Self::Pinhole => 4,
            Self::SimpleRadial => 4,
            Self::Radial => 5,
            Self::OpenCv => 8,
        }
    }

    /// Indices of the focal length parameters.
    pub fn focal_length_indices(self) -> &'static [usize] {
        match self {
            Self::SimplePinhole | Self::SimpleRadial | Self::Radial => &[0],
            Self::Pinhole | Self::OpenCv => &[0, 1],
        }
    }

    /// Indices of the principal point parameters.
    pub fn principal_point_indices(self) -> &'static [usize] {
        match self {
            Self::SimplePinhole | Self::SimpleRadial | Self::Radial => &[1, 2],
            Self::Pinhole | Self::OpenCv => &[2, 3],
        }
    }

    /// Indices of the distortion parameters.
    pub fn extra_params_indices(self) -> &'static [usize] {
        match self {
            Self::SimplePinhole | Self::Pinhole => &[],
            Self::SimpleRadial => &[3],
            Self::Radial => &[3, 4],
            Self::OpenCv => &[4, 5, 6, 7],
        }
    }
}

impl fmt::Display for CameraModelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// The intrinsics of a physical camera, which may be shared by several images.
///
/// The meaning of `params` is fixed by `model`, see [`CameraModelId`].
/// Parameters are mutable so that refinement can update them, but their count never changes.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
pub struct CameraIntrinsics {
    model: CameraModelId,
    width: u32,
    height: u32,
    params: Vec<f64>,
    /// Whether the focal length came from a trusted source (such as EXIF) rather than a guess.
    pub has_prior_focal_length: bool,
}

const UNDISTORT_ITERATIONS: usize = 100;
const UNDISTORT_MAX_STEP: f64 = 1e-10;
const UNDISTORT_REL_STEP: f64 = 1e-6;

impl CameraIntrinsics {
    pub fn new(
        model: CameraModelId,
        width: u32,
        height: u32,
        params: Vec<f64>,
    ) -> Result<Self, CameraError> {
        if width == 0 || height == 0 {
            return Err(CameraError::EmptyImage { width, height });
        }
        if params.len() != model.num_params() {
            return Err(CameraError::ParameterCount {
                model,
                expected: model.num_params(),
                found: params.len(),
            });
        }
        Ok(Self {
            model,
            width,
            height,
            params,
            has_prior_focal_length: false,
        })
    }

    /// A camera with the principal point at the image center and zero distortion.
    pub fn from_focal_length(
        model: CameraModelId,
        focal_length: f64,
        width: u32,
        height: u32,
    ) -> Result<Self, CameraError> {
        if width == 0 || height == 0 {
            return Err(CameraError::EmptyImage { width, height });
        }
        let mut params = vec![0.0; model.num_params()];
        for &ix in model.focal_length_indices() {
            params[ix] = focal_length;
        }
        let pp = model.principal_point_indices();
        params[pp[0]] = f64::from(width) / 2.0;
        params[pp[1]] = f64::from(height) / 2.0;
        Self::new(model, width, height, params)
    }

    #[must_use]
    pub fn with_prior_focal_length(self, has_prior_focal_length: bool) -> Self {
        Self {
            has_prior_focal_length,
            ..self
        }
    }

    pub fn model(&self) -> CameraModelId {
        self.model
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn params(&self) -> &[f64] {
        &self.params
    }

    /// Replace the parameters, keeping the layout.
    pub fn set_params(&mut self, params: &[f64]) -> Result<(), CameraError> {
        if params.len() != self.params.len() {
            return Err(CameraError::ParameterCount {
                model: self.model,
                expected: self.params.len(),
                found: params.len(),
            });
        }
        self.params.copy_from_slice(params);
        Ok(())
    }

    /// The mean focal length in pixels.
    pub fn focal_length(&self) -> f64 {
        let ixs = self.model.focal_length_indices();
        ixs.iter().map(|&ix| self.params[ix]).sum::<f64>() / ixs.len() as f64
    }

    /// The focal length in `x` and `y`.
    pub fn focal_lengths(&self) -> Vector2<f64> {
        let ixs = self.model.focal_length_indices();
        Vector2::new(self.params[ixs[0]], self.params[ixs[ixs.len() - 1]])
    }

    pub fn principal_point(&self) -> Point2<f64> {
        let pp = self.model.principal_point_indices();
        Point2::new(self.params[pp[0]], self.params[pp[1]])
    }

    pub fn extra_params(&self) -> impl Iterator<Item = f64> + '_ {
        self.model
            .extra_params_indices()
            .iter()
            .map(move |&ix| self.params[ix])
    }

    /// Convert a threshold in pixels into a threshold on the normalized image plane.
    pub fn pixel_to_normalized_threshold(&self, threshold: f64) -> f64 {
        threshold / self.focal_length()
    }

    /// Check whether the parameters are implausible for the image size.
    ///
    /// This is the case when a focal length divided by the larger image dimension leaves
    /// `[min_focal_length_ratio, max_focal_length_ratio]`, or when any distortion parameter
    /// exceeds `max_extra_param` in magnitude.
    pub fn has_bogus_params(
        &self,
        min_focal_length_ratio: f64,
        max_focal_length_ratio: f64,
        max_extra_param: f64,
    ) -> bool {
        let max_dim = f64::from(self.width.max(self.height));
        let bad_focal = self.model.focal_length_indices().iter().any(|&ix| {
            let ratio = self.params[ix] / max_dim;
            !(min_focal_length_ratio..=max_focal_length_ratio).contains(&ratio)
        });
        let bad_extra = self
            .extra_params()
            .any(|p| !p.is_finite() || p.abs() > max_extra_param);
        bad_focal || bad_extra || self.params.iter().any(|p| !p.is_finite())
    }

    /// Offset caused by lens distortion at an undistorted normalized image position.
    fn distortion(&self, u: Vector2<f64>) -> Vector2<f64> {
        let p = &self.params;
        let r2 = u.norm_squared();
        match self.model {
            CameraModelId::SimplePinhole | CameraModelId::Pinhole => Vector2::zeros(),
            CameraModelId::SimpleRadial => u * (p[3] * r2),
            CameraModelId::Radial => u * (p[3] * r2 + p[4] * r2 * r2),
            CameraModelId::OpenCv => {
                let (k1, k2, p1, p2) = (p[4], p[5], p[6], p[7]);
                let radial = k1 * r2 + k2 * r2 * r2;
                let uv = u.x * u.y;
                Vector2::new(
                    u.x * radial + 2.0 * p1 * uv + p2 * (r2 + 2.0 * u.x * u.x),
                    u.y * radial + 2.0 * p2 * uv + p1 * (r2 + 2.0 * u.y * u.y),
                )
            }
        }
    }

    /// Apply lens distortion to an undistorted normalized image position.
    pub fn distort(&self, u: Vector2<f64>) -> Vector2<f64> {
        u + self.distortion(u)
    }

    /// Remove lens distortion from a distorted normalized image position.
    ///
    /// The distortion functions have no closed-form inverse, so this runs Newton's method with a
    /// numeric Jacobian starting from the distorted position itself.
    pub fn undistort(&self, distorted: Vector2<f64>) -> Vector2<f64> {
        if self.model.extra_params_indices().is_empty() {
            return distorted;
        }
        let mut x = distorted;
        for _ in 0..UNDISTORT_ITERATIONS {
            let step_x = f64::EPSILON.max((x.x * UNDISTORT_REL_STEP).abs());
            let step_y = f64::EPSILON.max((x.y * UNDISTORT_REL_STEP).abs());
            let residual = self.distort(x) - distorted;
            let dx = (self.distort(x + Vector2::new(step_x, 0.0))
                - self.distort(x - Vector2::new(step_x, 0.0)))
                / (2.0 * step_x);
            let dy = (self.distort(x + Vector2::new(0.0, step_y))
                - self.distort(x - Vector2::new(0.0, step_y)))
                / (2.0 * step_y);
            let jacobian = Matrix2::from_columns(&[dx, dy]);
            let step = match jacobian.try_inverse() {
                Some(inv) => inv * residual,
                None => break,
            };
            x -= step;
            if step.norm_squared() < UNDISTORT_MAX_STEP * UNDISTORT_MAX_STEP {
                break;
            }
        }
        x
    }

    /// Project a point in front of the camera into pixel coordinates.
    ///
    /// Returns `None` for points on or behind the image plane.
    pub fn project(&self, point: CameraPoint) -> Option<KeyPoint> {
        let p = point.point()?;
        if p.z <= f64::EPSILON {
            return None;
        }
        let normalized = Vector2::new(p.x / p.z, p.y / p.z);
        self.normalized_to_pixel(self.distort(normalized))
    }

    fn normalized_to_pixel(&self, distorted: Vector2<f64>) -> Option<KeyPoint> {
        let f = self.focal_lengths();
        let c = self.principal_point();
        let pixel = Point2::new(distorted.x * f.x + c.x, distorted.y * f.y + c.y);
        pixel.coords.iter().all(|n| n.is_finite()).then(|| KeyPoint(pixel))
    }

    /// Pixel coordinates to the undistorted normalized image plane.
    pub fn pixel_to_normalized(&self, point: impl ImagePoint) -> Vector2<f64> {
        let f = self.focal_lengths();
        let centered = point.image_point() - self.principal_point();
        self.undistort(Vector2::new(centered.x / f.x, centered.y / f.y))
    }
}

impl CameraModel for CameraIntrinsics {
    /// Takes in a point from an image in pixel coordinates and converts it to a bearing.
    ///
    /// ```
    /// use sfm_core::{CameraIntrinsics, CameraModel, CameraModelId, KeyPoint};
    /// let camera = CameraIntrinsics::new(
    ///     CameraModelId::SimpleRadial,
    ///     1000,
    ///     800,
    ///     vec![900.0, 500.0, 400.0, 0.05],
    /// )
    /// .unwrap();
    /// let kp = KeyPoint::new(471.0, 322.0);
    /// let back = camera.uncalibrate(camera.calibrate(kp)).unwrap();
    /// assert!((kp.0 - back.0).norm() < 1e-6);
    /// ```
    fn calibrate<P>(&self, point: P) -> UnitVector3<f64>
    where
        P: ImagePoint,
    {
        UnitVector3::new_normalize(self.pixel_to_normalized(point).push(1.0))
    }

    fn uncalibrate(&self, bearing: UnitVector3<f64>) -> Option<KeyPoint> {
        self.project(CameraPoint(bearing.into_inner().push(1.0)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::Vector4;

    #[test]
    fn parameter_count_is_checked() {
        let err = CameraIntrinsics::new(CameraModelId::Pinhole, 640, 480, vec![500.0, 320.0, 240.0])
            .unwrap_err();
        assert_eq!(
            err,
            CameraError::ParameterCount {
                model: CameraModelId::Pinhole,
                expected: 4,
                found: 3
            }
        );
        assert_eq!(
            CameraModelId::from_id(9).unwrap_err(),
            CameraError::UnknownModel(9)
        );
    }

    #[test]
    fn model_ids_round_trip() {
        for id in 0..5 {
            assert_eq!(CameraModelId::from_id(id).unwrap().id(), id);
        }
        assert_eq!(CameraModelId::OpenCv.to_string(), "OPENCV");
    }

    #[test]
    fn opencv_undistort_inverts_distort() {
        let camera = CameraIntrinsics::new(
            CameraModelId::OpenCv,
            640,
            480,
            vec![510.0, 490.0, 321.0, 239.0, -0.1, 0.02, 0.001, -0.002],
        )
        .unwrap();
        let u = Vector2::new(0.31, -0.22);
        assert_relative_eq!(camera.undistort(camera.distort(u)), u, epsilon = 1e-9);
    }

    #[test]
    fn projection_matches_calibration() {
        let camera =
            CameraIntrinsics::from_focal_length(CameraModelId::SimplePinhole, 500.0, 640, 480)
                .unwrap();
        let point = CameraPoint(Vector4::new(0.5, -0.25, 2.0, 1.0));
        let kp = camera.project(point).unwrap();
        assert_relative_eq!(kp.0, Point2::new(445.0, 177.5), epsilon = 1e-9);
        let bearing = camera.calibrate(kp);
        assert_relative_eq!(
            bearing.into_inner(),
            point.bearing().into_inner(),
            epsilon = 1e-9
        );
        assert!(camera
            .project(CameraPoint(Vector4::new(0.0, 0.0, -1.0, 1.0)))
            .is_none());
    }

    #[test]
    fn bogus_focal_lengths_are_detected() {
        let mut camera =
            CameraIntrinsics::from_focal_length(CameraModelId::SimpleRadial, 500.0, 640, 480)
                .unwrap();
        assert!(!camera.has_bogus_params(0.1, 10.0, 1.0));
        camera.set_params(&[20.0, 320.0, 240.0, 0.0]).unwrap();
        assert!(camera.has_bogus_params(0.1, 10.0, 1.0));
        camera.set_params(&[500.0, 320.0, 240.0, 1.5]).unwrap();
        assert!(camera.has_bogus_params(0.1, 10.0, 1.0));
    }
}

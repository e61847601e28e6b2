//! Image description shared by all engine entry points.
//!
//! An [`Image`] bundles the data array with its optional noise model, mask
//! and gain. It borrows the caller's arrays for the duration of a call; the
//! engine never copies a full frame.

use crate::convert::InputArray;
use crate::error::SepError;

/// Sentinel value marking a bad pixel in internal working buffers.
///
/// Masked pixels get their noise set to this value so that any threshold or
/// weighting test naturally rejects them, and pixel values below `-BIG` are
/// treated as flagged by the data source.
pub(crate) const BIG: f32 = 1e30;

/// Interpretation of noise values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoiseKind {
    /// Values are standard deviations.
    Stddev,
    /// Values are variances.
    Variance,
}

/// Noise model attached to an image.
#[derive(Debug, Clone, Copy)]
pub enum Noise<'a> {
    /// No noise information available.
    None,
    /// A single noise value for the whole frame.
    Scalar(NoiseKind, f64),
    /// Per-pixel noise array with the same shape as the data.
    Array(NoiseKind, InputArray<'a>),
}

impl<'a> Noise<'a> {
    /// Whether any noise information is present.
    pub fn is_some(&self) -> bool {
        !matches!(self, Noise::None)
    }
}

/// An astronomical image with its noise model, mask and gain.
///
/// The mask flags pixels whose mask value exceeds `mask_thresh`; flagged
/// pixels are excluded from background statistics, zeroed for detection and
/// reported through aperture flags. `gain` converts data units to electrons
/// for Poisson error terms; a non-positive gain disables them.
#[derive(Debug, Clone, Copy)]
pub struct Image<'a> {
    /// Pixel data.
    pub data: InputArray<'a>,
    /// Noise model.
    pub noise: Noise<'a>,
    /// Optional mask array, same shape as `data`.
    pub mask: Option<InputArray<'a>>,
    /// Mask values strictly greater than this flag the pixel.
    pub mask_thresh: f64,
    /// Conversion factor from data units to electrons (e-/ADU).
    pub gain: f64,
}

impl<'a> Image<'a> {
    /// Create an image with no noise, mask or gain.
    pub fn new(data: InputArray<'a>) -> Self {
        Image {
            data,
            noise: Noise::None,
            mask: None,
            mask_thresh: 0.0,
            gain: 0.0,
        }
    }

    /// Image width in pixels.
    pub fn width(&self) -> usize {
        self.data.dim().0
    }

    /// Image height in pixels.
    pub fn height(&self) -> usize {
        self.data.dim().1
    }

    /// Check that noise and mask shapes match the data shape.
    pub fn validate(&self) -> Result<(), SepError> {
        let (dw, dh) = self.data.dim();
        if let Noise::Array(_, arr) = &self.noise {
            let (w, h) = arr.dim();
            if (w, h) != (dw, dh) {
                return Err(SepError::DimensionMismatch {
                    name: "noise",
                    dw,
                    dh,
                    w,
                    h,
                });
            }
        }
        if let Some(mask) = &self.mask {
            let (w, h) = mask.dim();
            if (w, h) != (dw, dh) {
                return Err(SepError::DimensionMismatch {
                    name: "mask",
                    dw,
                    dh,
                    w,
                    h,
                });
            }
        }
        Ok(())
    }

    /// Whether the pixel at `(x, y)` is masked out.
    pub fn is_masked(&self, x: usize, y: usize) -> bool {
        match &self.mask {
            Some(mask) => mask.get(x, y) as f64 > self.mask_thresh,
            None => false,
        }
    }

    /// Per-pixel variance at `(x, y)`, or `None` when no noise model is set.
    pub fn variance_at(&self, x: usize, y: usize) -> Option<f64> {
        match &self.noise {
            Noise::None => None,
            Noise::Scalar(kind, v) => Some(match kind {
                NoiseKind::Stddev => v * v,
                NoiseKind::Variance => *v,
            }),
            Noise::Array(kind, arr) => {
                let v = arr.get(x, y) as f64;
                Some(match kind {
                    NoiseKind::Stddev => v * v,
                    NoiseKind::Variance => v,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;

    #[test]
    fn validate_rejects_mismatched_noise_shape() {
        let data = Array2::<f32>::zeros((4, 4));
        let noise = Array2::<f32>::zeros((4, 5));
        let mut img = Image::new(InputArray::Float(data.view()));
        img.noise = Noise::Array(NoiseKind::Stddev, InputArray::Float(noise.view()));
        assert!(matches!(
            img.validate(),
            Err(SepError::DimensionMismatch { name: "noise", .. })
        ));
    }

    #[test]
    fn scalar_stddev_squares_to_variance() {
        let data = Array2::<f32>::zeros((2, 2));
        let mut img = Image::new(InputArray::Float(data.view()));
        img.noise = Noise::Scalar(NoiseKind::Stddev, 3.0);
        assert_eq!(img.variance_at(0, 0), Some(9.0));
    }

    #[test]
    fn mask_threshold_is_strict() {
        let data = Array2::<f32>::zeros((1, 2));
        let mask = ndarray::array![[0.0f32, 1.0]];
        let mut img = Image::new(InputArray::Float(data.view()));
        img.mask = Some(InputArray::Float(mask.view()));
        img.mask_thresh = 0.0;
        assert!(!img.is_masked(0, 0));
        assert!(img.is_masked(1, 0));
    }
}

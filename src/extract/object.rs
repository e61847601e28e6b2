//! Detection records and extraction configuration.

use serde::{Deserialize, Serialize};

use crate::convolve::Kernel;
use crate::extract::pixlist::PixelRecord;

/// Object and aperture flag bits, shared with the output catalog.
pub mod flags {
    /// Object is the result of deblending.
    pub const MERGED: u32 = 0x0001;
    /// Object is truncated at the image boundary.
    pub const TRUNCATED: u32 = 0x0002;
    /// Deblending overflowed on this object.
    pub const DEBLEND_OVERFLOW: u32 = 0x0004;
    /// Second moments were singular and had to be regularized.
    pub const SINGULAR: u32 = 0x0008;
    /// Aperture extended past the image boundary.
    pub const APER_TRUNCATED: u32 = 0x0010;
    /// Aperture contained masked pixels.
    pub const APER_HAS_MASKED: u32 = 0x0020;
    /// Aperture consisted entirely of masked pixels.
    pub const APER_ALL_MASKED: u32 = 0x0040;
    /// A derived aperture parameter was non-positive.
    pub const APER_NONPOSITIVE: u32 = 0x0080;
}

/// How the detection threshold is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ThreshKind {
    /// Threshold is a multiple of the per-pixel (or global) noise sigma.
    Relative,
    /// Threshold is in data units.
    Absolute,
}

/// Which detection filter drives the thresholding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FilterKind {
    /// Plain convolution of the data.
    Convolution,
    /// Noise-weighted matched filter; needs a kernel and a noise array,
    /// and silently falls back to convolution otherwise.
    Matched,
}

/// Source extraction parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractConfig {
    /// Detection threshold, interpreted per `thresh_kind`.
    pub thresh: f64,
    /// Threshold interpretation.
    pub thresh_kind: ThreshKind,
    /// Minimum number of pixels for a detection.
    pub minarea: usize,
    /// Detection filter kernel; `None` disables filtering.
    pub kernel: Option<Kernel>,
    /// Detection filter flavor.
    pub filter_kind: FilterKind,
    /// Number of deblending threshold levels.
    pub deblend_nthresh: usize,
    /// Minimum flux contrast for a branch to split off.
    pub deblend_cont: f64,
    /// Whether to run the cleaning pass.
    pub clean: bool,
    /// Cleaning profile slope (Moffat beta).
    pub clean_param: f64,
    /// Pixel record arena capacity.
    pub pixstack: usize,
    /// Seed for the deblending pixel-assignment draw.
    pub seed: u64,
}

impl Default for ExtractConfig {
    fn default() -> Self {
        ExtractConfig {
            thresh: 1.5,
            thresh_kind: ThreshKind::Relative,
            minarea: 5,
            kernel: Some(Kernel::default_3x3()),
            filter_kind: FilterKind::Convolution,
            deblend_nthresh: 32,
            deblend_cont: 0.005,
            clean: true,
            clean_param: 1.0,
            pixstack: 1_000_000,
            seed: 1,
        }
    }
}

/// A detected object with its member pixels, progressively filled in by
/// the analysis passes.
#[derive(Debug, Clone, Default)]
pub struct RawObject {
    /// Detection threshold that applied to this object.
    pub thresh: f64,
    /// Flag bits (see [`flags`]).
    pub flag: u32,

    /// Member pixel count in the detection image.
    pub fdnpix: usize,
    /// Member pixels above the analysis threshold in the measurement image.
    pub dnpix: usize,
    /// Bounding box, inclusive.
    pub xmin: i32,
    /// Bounding box, inclusive.
    pub xmax: i32,
    /// Bounding box, inclusive.
    pub ymin: i32,
    /// Bounding box, inclusive.
    pub ymax: i32,

    /// Total flux in the detection (filtered) image.
    pub fdflux: f64,
    /// Total flux in the measurement image.
    pub dflux: f64,
    /// Peak value in the detection image.
    pub fdpeak: f64,
    /// Peak value in the measurement image.
    pub dpeak: f64,
    /// Measurement-image peak position.
    pub xpeak: i32,
    /// Measurement-image peak position.
    pub ypeak: i32,
    /// Detection-image peak position.
    pub xcpeak: i32,
    /// Detection-image peak position.
    pub ycpeak: i32,

    /// Barycenter (detection-image weighted).
    pub mx: f64,
    /// Barycenter (detection-image weighted).
    pub my: f64,
    /// Central second moment.
    pub mx2: f64,
    /// Central second moment.
    pub my2: f64,
    /// Central second moment.
    pub mxy: f64,
    /// Barycenter variance.
    pub errx2: f64,
    /// Barycenter variance.
    pub erry2: f64,
    /// Barycenter covariance.
    pub errxy: f64,

    /// Ellipse semi-major axis.
    pub a: f32,
    /// Ellipse semi-minor axis.
    pub b: f32,
    /// Ellipse position angle, radians CCW from +x.
    pub theta: f32,
    /// Quadratic-form coefficient.
    pub cxx: f32,
    /// Quadratic-form coefficient.
    pub cyy: f32,
    /// Quadratic-form coefficient.
    pub cxy: f32,
    /// Area correction factor from the isophotal growth estimate.
    pub abcor: f32,
    /// Threshold above which only `minarea` pixels of this object remain;
    /// used by the cleaning test.
    pub mthresh: f64,

    /// Member pixels.
    pub pixels: Vec<PixelRecord>,
}

impl RawObject {
    /// New object owning `pixels`, detected at `thresh` with initial flags.
    pub fn from_pixels(pixels: Vec<PixelRecord>, thresh: f64, flag: u32) -> RawObject {
        RawObject {
            thresh,
            flag,
            abcor: 1.0,
            pixels,
            ..Default::default()
        }
    }
}

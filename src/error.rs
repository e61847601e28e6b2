use thiserror::Error;

/// Errors produced by the extraction and photometry engine.
///
/// Detection-level anomalies (truncation, singular moments, masked aperture
/// pixels) are reported as per-object flag bits, never as errors; an `Err`
/// from any entry point means no usable result was produced.
#[derive(Error, Debug, PartialEq)]
pub enum SepError {
    /// The pixel record arena filled up during extraction.
    #[error("pixel stack overflow: capacity {capacity} exhausted, raise ExtractConfig::pixstack")]
    PixelStackFull {
        /// Configured arena capacity in pixel records.
        capacity: usize,
    },

    /// More sub-objects at one deblending level than the tree can hold.
    #[error("deblend overflow: more than {limit} sub-objects at one threshold level")]
    DeblendOverflow {
        /// Maximum sub-objects per deblending pass.
        limit: usize,
    },

    /// A relative detection threshold was requested without any noise model.
    #[error("relative threshold requires a noise array or scalar noise value")]
    RelativeThresholdWithoutNoise,

    /// A row outside the sliding buffer window was requested.
    #[error("image row {y} is not buffered")]
    LineNotBuffered {
        /// Requested row index.
        y: usize,
    },

    /// Noise or mask array shape differs from the data array shape.
    #[error("array dimensions mismatch: data is {dw}x{dh}, {name} is {w}x{h}")]
    DimensionMismatch {
        /// Name of the offending array.
        name: &'static str,
        /// Data width.
        dw: usize,
        /// Data height.
        dh: usize,
        /// Offending array width.
        w: usize,
        /// Offending array height.
        h: usize,
    },

    /// Aperture subpixel sampling factor is out of range.
    #[error("illegal subpix value {0}")]
    InvalidSubpix(i32),

    /// Aperture geometry parameters are out of range.
    #[error("illegal aperture parameters: {0}")]
    IllegalAperture(String),

    /// Quadratic-form coefficients do not describe an ellipse.
    #[error("parameters do not describe an ellipse")]
    NonEllipseParams,

    /// Configuration validation failure.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

//! Source extraction and photometry for astronomical images.
//!
//! The pipeline mirrors the classic detection chain: estimate and subtract
//! a tiled background model, scan the frame once for connected components
//! above threshold, split blends with a multi-threshold tree, measure
//! shapes and fluxes, optionally clean spurious neighbors, and follow up
//! with exact-overlap aperture photometry on the results.
//!
//! ```no_run
//! use ndarray::Array2;
//! use starsep::{
//!     extract, sum_circle, Background, BackgroundConfig, ExtractConfig, Image, InputArray,
//!     MaskPolicy, Noise, NoiseKind,
//! };
//!
//! # fn main() -> Result<(), starsep::SepError> {
//! let mut frame = Array2::<f32>::zeros((512, 512));
//! let bkg = Background::new(
//!     &Image::new(InputArray::Float(frame.view())),
//!     &BackgroundConfig::default(),
//! )?;
//! let rms = bkg.global_rms();
//! bkg.subtract_from(&mut starsep::OutputArray::Float(frame.view_mut()))?;
//!
//! let image = Image {
//!     noise: Noise::Scalar(NoiseKind::Stddev, rms as f64),
//!     ..Image::new(InputArray::Float(frame.view()))
//! };
//! let catalog = extract(&image, &ExtractConfig::default())?;
//! for i in 0..catalog.len() {
//!     let phot = sum_circle(&image, catalog.x[i], catalog.y[i], 5.0, 0, MaskPolicy::Correct)?;
//!     println!("{:.1} {:.1} {:.3}", catalog.x[i], catalog.y[i], phot.sum);
//! }
//! # Ok(())
//! # }
//! ```

pub mod aperture;
pub mod background;
mod buffer;
pub mod catalog;
pub mod convert;
pub mod convolve;
mod error;
pub mod extract;
pub mod image;

pub use crate::aperture::{
    ellipse_axes, ellipse_coeffs, flux_radius, kron_radius, set_ellipse, sum_circann,
    sum_circann_multi, sum_circle, sum_ellipann, sum_ellipse, winpos, AnnulusSums, ApertureSum,
    MaskPolicy, WinCentroid,
};
pub use crate::background::{Background, BackgroundConfig};
pub use crate::catalog::Catalog;
pub use crate::convert::{InputArray, OutputArray};
pub use crate::convolve::Kernel;
pub use crate::error::SepError;
pub use crate::extract::extract;
pub use crate::extract::object::{flags, ExtractConfig, FilterKind, RawObject, ThreshKind};
pub use crate::image::{Image, Noise, NoiseKind};

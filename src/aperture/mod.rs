//! Aperture photometry with exact pixel overlap.
//!
//! Each summation walks the bounding box of the aperture and weighs every
//! pixel by its overlap area. Pixels comfortably inside count fully,
//! pixels comfortably outside are skipped, and only the thin boundary zone
//! pays for either the exact geometric overlap or subpixel sampling. The
//! same skeleton serves circles, ellipses and both annulus variants, which
//! differ only in their distance form and overlap primitive.

pub mod overlap;

use std::f64::consts::PI;

use ndarray::ArrayViewMut2;

use crate::error::SepError;
use crate::extract::object::flags;
use crate::image::{Image, BIG};
use overlap::{circoverlap, ellipoverlap};

const FLUX_RADIUS_BINS: usize = 64;

const WINPOS_NITERMAX: usize = 16;
const WINPOS_NSIG: f64 = 4.0;
const WINPOS_STEPMIN: f64 = 0.0001;
/// Centroid offset factor (2 for a Gaussian profile).
const WINPOS_FAC: f64 = 2.0;

/// Oversampling margin around an aperture boundary, in pixels. Half a
/// pixel diagonal, so every partially covered pixel falls inside it.
const OVERSAMP_MARGIN: f64 = 0.7072;

/// How masked pixels inside an aperture affect the result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MaskPolicy {
    /// Scale the sum up as if masked pixels held the mean unmasked value.
    #[default]
    Correct,
    /// Drop masked pixels and shrink the reported area.
    Ignore,
}

/// Result of a single aperture sum.
#[derive(Debug, Clone, Copy, Default)]
pub struct ApertureSum {
    /// Total flux inside the aperture.
    pub sum: f64,
    /// 1-sigma flux uncertainty.
    pub err: f64,
    /// Effective aperture area in pixels.
    pub area: f64,
    /// Aperture flag bits.
    pub flag: u32,
}

/// Result of a windowed centroid fit.
#[derive(Debug, Clone, Copy)]
pub struct WinCentroid {
    /// Fitted position.
    pub x: f64,
    /// Fitted position.
    pub y: f64,
    /// Iterations used.
    pub niter: usize,
    /// Aperture flag bits.
    pub flag: u32,
}

/// Clip a box around `(x, y)` with half-extents `(rx, ry)` to the frame.
/// `xmin`/`ymin` are inclusive, `xmax`/`ymax` exclusive.
fn boxextent(
    x: f64,
    y: f64,
    rx: f64,
    ry: f64,
    w: usize,
    h: usize,
    flag: &mut u32,
) -> (usize, usize, usize, usize) {
    let mut xmin = (x - rx + 0.5) as i64;
    let mut xmax = (x + rx + 1.4999999) as i64;
    let mut ymin = (y - ry + 0.5) as i64;
    let mut ymax = (y + ry + 1.4999999) as i64;
    if xmin < 0 {
        xmin = 0;
        *flag |= flags::APER_TRUNCATED;
    }
    if xmax > w as i64 {
        xmax = w as i64;
        *flag |= flags::APER_TRUNCATED;
    }
    if ymin < 0 {
        ymin = 0;
        *flag |= flags::APER_TRUNCATED;
    }
    if ymax > h as i64 {
        ymax = h as i64;
        *flag |= flags::APER_TRUNCATED;
    }
    let xmin = xmin.max(0) as usize;
    let ymin = ymin.max(0) as usize;
    let xmax = xmax.max(xmin as i64) as usize;
    let ymax = ymax.max(ymin as i64) as usize;
    (xmin, xmax, ymin, ymax)
}

/// Squared inner/outer radii of the oversampling zone around radius `r`.
fn oversamp_ann_circle(r: f64) -> (f64, f64) {
    let rin = r - OVERSAMP_MARGIN;
    let rin2 = if rin > 0.0 { rin * rin } else { 0.0 };
    let rout = r + OVERSAMP_MARGIN;
    (rin2, rout * rout)
}

/// Same, in elliptical-radius units; the margin widens by the minor axis.
fn oversamp_ann_ellipse(r: f64, b: f64) -> (f64, f64) {
    let rin = r - OVERSAMP_MARGIN / b;
    let rin2 = if rin > 0.0 { rin * rin } else { 0.0 };
    let rout = r + OVERSAMP_MARGIN / b;
    (rin2, rout * rout)
}

/// Shape plugged into the shared summation skeleton.
trait Aperture {
    /// Box half-extents enclosing the aperture.
    fn extent(&self) -> (f64, f64);
    /// Squared (possibly elliptical) radius of an offset from the center.
    fn rpix2(&self, dx: f64, dy: f64) -> f64;
    /// Pixel may intersect the aperture at all.
    fn in_outer(&self, rpix2: f64) -> bool;
    /// Pixel is close enough to a boundary to need its overlap resolved.
    fn near_boundary(&self, rpix2: f64) -> bool;
    /// A sample point falls inside the aperture.
    fn contains(&self, rpix2: f64) -> bool;
    /// Exact pixel-aperture overlap area for the unit pixel at the offset.
    fn exact_overlap(&self, dx: f64, dy: f64) -> f64;
}

struct Circle {
    r: f64,
    r2: f64,
    r_in2: f64,
    r_out2: f64,
}

impl Circle {
    fn new(r: f64) -> Result<Circle, SepError> {
        if r < 0.0 {
            return Err(SepError::IllegalAperture(format!("negative radius {r}")));
        }
        let (r_in2, r_out2) = oversamp_ann_circle(r);
        Ok(Circle {
            r,
            r2: r * r,
            r_in2,
            r_out2,
        })
    }
}

impl Aperture for Circle {
    fn extent(&self) -> (f64, f64) {
        (self.r, self.r)
    }
    fn rpix2(&self, dx: f64, dy: f64) -> f64 {
        dx * dx + dy * dy
    }
    fn in_outer(&self, rpix2: f64) -> bool {
        rpix2 < self.r_out2
    }
    fn near_boundary(&self, rpix2: f64) -> bool {
        rpix2 > self.r_in2
    }
    fn contains(&self, rpix2: f64) -> bool {
        rpix2 < self.r2
    }
    fn exact_overlap(&self, dx: f64, dy: f64) -> f64 {
        circoverlap(dx - 0.5, dy - 0.5, dx + 0.5, dy + 0.5, self.r)
    }
}

struct Ellipse {
    /// Semi-axes scaled by the aperture radius.
    sa: f64,
    sb: f64,
    theta: f64,
    cxx: f64,
    cyy: f64,
    cxy: f64,
    r2: f64,
    r_in2: f64,
    r_out2: f64,
    dxlim: f64,
    dylim: f64,
}

impl Ellipse {
    fn new(a: f64, b: f64, theta: f64, r: f64) -> Result<Ellipse, SepError> {
        if !(r >= 0.0 && b >= 0.0 && a >= b && (-PI / 2.0..=PI / 2.0).contains(&theta)) {
            return Err(SepError::IllegalAperture(format!(
                "bad ellipse a={a} b={b} theta={theta} r={r}"
            )));
        }
        let (cxx, cyy, cxy) = ellipse_coeffs(a, b, theta);
        let (r_in2, r_out2) = oversamp_ann_ellipse(r, b);
        let (dxlim, dylim) = ellipse_extent(cxx, cyy, cxy, r);
        Ok(Ellipse {
            sa: a * r,
            sb: b * r,
            theta,
            cxx,
            cyy,
            cxy,
            r2: r * r,
            r_in2,
            r_out2,
            dxlim,
            dylim,
        })
    }
}

impl Aperture for Ellipse {
    fn extent(&self) -> (f64, f64) {
        (self.dxlim, self.dylim)
    }
    fn rpix2(&self, dx: f64, dy: f64) -> f64 {
        self.cxx * dx * dx + self.cyy * dy * dy + self.cxy * dx * dy
    }
    fn in_outer(&self, rpix2: f64) -> bool {
        rpix2 < self.r_out2
    }
    fn near_boundary(&self, rpix2: f64) -> bool {
        rpix2 > self.r_in2
    }
    fn contains(&self, rpix2: f64) -> bool {
        rpix2 < self.r2
    }
    fn exact_overlap(&self, dx: f64, dy: f64) -> f64 {
        ellipoverlap(dx - 0.5, dy - 0.5, dx + 0.5, dy + 0.5, self.sa, self.sb, self.theta)
    }
}

struct CircAnnulus {
    rin: f64,
    rout: f64,
    rin2: f64,
    rout2: f64,
    rin_in2: f64,
    rin_out2: f64,
    rout_in2: f64,
    rout_out2: f64,
}

impl CircAnnulus {
    fn new(rin: f64, rout: f64) -> Result<CircAnnulus, SepError> {
        if !(rin >= 0.0 && rout >= rin) {
            return Err(SepError::IllegalAperture(format!(
                "bad annulus rin={rin} rout={rout}"
            )));
        }
        let (rin_in2, rin_out2) = oversamp_ann_circle(rin);
        let (rout_in2, rout_out2) = oversamp_ann_circle(rout);
        Ok(CircAnnulus {
            rin,
            rout,
            rin2: rin * rin,
            rout2: rout * rout,
            rin_in2,
            rin_out2,
            rout_in2,
            rout_out2,
        })
    }
}

impl Aperture for CircAnnulus {
    fn extent(&self) -> (f64, f64) {
        (self.rout, self.rout)
    }
    fn rpix2(&self, dx: f64, dy: f64) -> f64 {
        dx * dx + dy * dy
    }
    fn in_outer(&self, rpix2: f64) -> bool {
        rpix2 < self.rout_out2 && rpix2 > self.rin_in2
    }
    fn near_boundary(&self, rpix2: f64) -> bool {
        rpix2 > self.rout_in2 || rpix2 < self.rin_out2
    }
    fn contains(&self, rpix2: f64) -> bool {
        rpix2 < self.rout2 && rpix2 > self.rin2
    }
    fn exact_overlap(&self, dx: f64, dy: f64) -> f64 {
        circoverlap(dx - 0.5, dy - 0.5, dx + 0.5, dy + 0.5, self.rout)
            - circoverlap(dx - 0.5, dy - 0.5, dx + 0.5, dy + 0.5, self.rin)
    }
}

struct EllipAnnulus {
    a: f64,
    b: f64,
    theta: f64,
    rin: f64,
    rout: f64,
    cxx: f64,
    cyy: f64,
    cxy: f64,
    rin2: f64,
    rout2: f64,
    rin_in2: f64,
    rin_out2: f64,
    rout_in2: f64,
    rout_out2: f64,
    dxlim: f64,
    dylim: f64,
}

impl EllipAnnulus {
    fn new(a: f64, b: f64, theta: f64, rin: f64, rout: f64) -> Result<EllipAnnulus, SepError> {
        if !(rin >= 0.0
            && rout >= rin
            && b >= 0.0
            && a >= b
            && (-PI / 2.0..=PI / 2.0).contains(&theta))
        {
            return Err(SepError::IllegalAperture(format!(
                "bad elliptical annulus a={a} b={b} theta={theta} rin={rin} rout={rout}"
            )));
        }
        let (cxx, cyy, cxy) = ellipse_coeffs(a, b, theta);
        let (rin_in2, rin_out2) = oversamp_ann_ellipse(rin, b);
        let (rout_in2, rout_out2) = oversamp_ann_ellipse(rout, b);
        let (dxlim, dylim) = ellipse_extent(cxx, cyy, cxy, rout);
        Ok(EllipAnnulus {
            a,
            b,
            theta,
            rin,
            rout,
            cxx,
            cyy,
            cxy,
            rin2: rin * rin,
            rout2: rout * rout,
            rin_in2,
            rin_out2,
            rout_in2,
            rout_out2,
            dxlim,
            dylim,
        })
    }
}

impl Aperture for EllipAnnulus {
    fn extent(&self) -> (f64, f64) {
        (self.dxlim, self.dylim)
    }
    fn rpix2(&self, dx: f64, dy: f64) -> f64 {
        self.cxx * dx * dx + self.cyy * dy * dy + self.cxy * dx * dy
    }
    fn in_outer(&self, rpix2: f64) -> bool {
        rpix2 < self.rout_out2 && rpix2 > self.rin_in2
    }
    fn near_boundary(&self, rpix2: f64) -> bool {
        rpix2 > self.rout_in2 || rpix2 < self.rin_out2
    }
    fn contains(&self, rpix2: f64) -> bool {
        rpix2 < self.rout2 && rpix2 > self.rin2
    }
    fn exact_overlap(&self, dx: f64, dy: f64) -> f64 {
        let (x0, y0, x1, y1) = (dx - 0.5, dy - 0.5, dx + 0.5, dy + 0.5);
        ellipoverlap(x0, y0, x1, y1, self.a * self.rout, self.b * self.rout, self.theta)
            - ellipoverlap(x0, y0, x1, y1, self.a * self.rin, self.b * self.rin, self.theta)
    }
}

/// Box half-extents of the level-`r` contour of an ellipse quadratic form.
fn ellipse_extent(cxx: f64, cyy: f64, cxy: f64, r: f64) -> (f64, f64) {
    let dx = cxx - cxy * cxy / (4.0 * cyy);
    let dx = if dx > 0.0 { r / dx.sqrt() } else { 0.0 };
    let dy = cyy - cxy * cxy / (4.0 * cxx);
    let dy = if dy > 0.0 { r / dy.sqrt() } else { 0.0 };
    (dx, dy)
}

/// The shared summation skeleton.
fn sum_aperture<A: Aperture>(
    image: &Image<'_>,
    x: f64,
    y: f64,
    ap: &A,
    subpix: u32,
    policy: MaskPolicy,
) -> Result<ApertureSum, SepError> {
    image.validate()?;
    let (w, h) = image.data.dim();
    let mut flag = 0u32;
    let (rx, ry) = ap.extent();
    let (xmin, xmax, ymin, ymax) = boxextent(x, y, rx, ry, w, h, &mut flag);

    let scale = if subpix > 0 { 1.0 / subpix as f64 } else { 0.0 };
    let scale2 = scale * scale;
    let offset = 0.5 * (scale - 1.0);

    let mut tv = 0.0f64;
    let mut sigtv = 0.0f64;
    let mut totarea = 0.0f64;
    let mut maskarea = 0.0f64;

    for iy in ymin..ymax {
        for ix in xmin..xmax {
            let dx = ix as f64 - x;
            let dy = iy as f64 - y;
            let rpix2 = ap.rpix2(dx, dy);
            if !ap.in_outer(rpix2) {
                continue;
            }
            let pixoverlap = if ap.near_boundary(rpix2) {
                if subpix == 0 {
                    ap.exact_overlap(dx, dy)
                } else {
                    let mut ov = 0.0;
                    let mut sdy = dy + offset;
                    for _ in 0..subpix {
                        let mut sdx = dx + offset;
                        for _ in 0..subpix {
                            if ap.contains(ap.rpix2(sdx, sdy)) {
                                ov += scale2;
                            }
                            sdx += scale;
                        }
                        sdy += scale;
                    }
                    ov
                }
            } else {
                1.0
            };

            let pix = image.data.get(ix, iy) as f64;
            let varpix = image.variance_at(ix, iy).unwrap_or(0.0);

            if pix < -(BIG as f64) || image.is_masked(ix, iy) {
                flag |= flags::APER_HAS_MASKED;
                maskarea += pixoverlap;
            } else {
                tv += pix * pixoverlap;
                sigtv += varpix * pixoverlap;
            }
            totarea += pixoverlap;
        }
    }

    if totarea > 0.0 && maskarea >= totarea {
        flag |= flags::APER_ALL_MASKED;
    }
    match policy {
        MaskPolicy::Ignore => totarea -= maskarea,
        MaskPolicy::Correct => {
            if maskarea > 0.0 {
                let tmp = if totarea == maskarea {
                    0.0
                } else {
                    totarea / (totarea - maskarea)
                };
                tv *= tmp;
                sigtv *= tmp;
            }
        }
    }

    if image.gain > 0.0 && tv > 0.0 {
        sigtv += tv / image.gain;
    }

    Ok(ApertureSum {
        sum: tv,
        err: sigtv.sqrt(),
        area: totarea,
        flag,
    })
}

/// Sum the flux in a circular aperture of radius `r` centered at `(x, y)`.
///
/// `subpix = 0` uses exact pixel overlap, otherwise each boundary pixel is
/// sampled on a `subpix` x `subpix` grid.
pub fn sum_circle(
    image: &Image<'_>,
    x: f64,
    y: f64,
    r: f64,
    subpix: u32,
    policy: MaskPolicy,
) -> Result<ApertureSum, SepError> {
    let ap = Circle::new(r)?;
    sum_aperture(image, x, y, &ap, subpix, policy)
}

/// Sum the flux in an elliptical aperture with semi-axes `a*r` and `b*r`
/// at position angle `theta`.
#[allow(clippy::too_many_arguments)]
pub fn sum_ellipse(
    image: &Image<'_>,
    x: f64,
    y: f64,
    a: f64,
    b: f64,
    theta: f64,
    r: f64,
    subpix: u32,
    policy: MaskPolicy,
) -> Result<ApertureSum, SepError> {
    let ap = Ellipse::new(a, b, theta, r)?;
    sum_aperture(image, x, y, &ap, subpix, policy)
}

/// Sum the flux in a circular annulus between radii `rin` and `rout`.
pub fn sum_circann(
    image: &Image<'_>,
    x: f64,
    y: f64,
    rin: f64,
    rout: f64,
    subpix: u32,
    policy: MaskPolicy,
) -> Result<ApertureSum, SepError> {
    let ap = CircAnnulus::new(rin, rout)?;
    sum_aperture(image, x, y, &ap, subpix, policy)
}

/// Sum the flux in an elliptical annulus between scale factors `rin` and
/// `rout` of the ellipse `(a, b, theta)`.
#[allow(clippy::too_many_arguments)]
pub fn sum_ellipann(
    image: &Image<'_>,
    x: f64,
    y: f64,
    a: f64,
    b: f64,
    theta: f64,
    rin: f64,
    rout: f64,
    subpix: u32,
    policy: MaskPolicy,
) -> Result<ApertureSum, SepError> {
    let ap = EllipAnnulus::new(a, b, theta, rin, rout)?;
    sum_aperture(image, x, y, &ap, subpix, policy)
}

/// Per-annulus sums from [`sum_circann_multi`].
#[derive(Debug, Clone, Default)]
pub struct AnnulusSums {
    /// Flux per annulus.
    pub sum: Vec<f64>,
    /// Variance per annulus.
    pub sumvar: Vec<f64>,
    /// Area per annulus.
    pub area: Vec<f64>,
    /// Masked area per annulus.
    pub maskarea: Vec<f64>,
    /// Aperture flag bits.
    pub flag: u32,
}

/// Sum the flux in `n` concentric circular annuli of equal width out to
/// `rmax`.
///
/// Pixels near a bin boundary are distributed by subpixel sampling, the
/// rest are assigned whole. `subpix` must be at least 1.
pub fn sum_circann_multi(
    image: &Image<'_>,
    x: f64,
    y: f64,
    rmax: f64,
    n: usize,
    subpix: u32,
    policy: MaskPolicy,
) -> Result<AnnulusSums, SepError> {
    if rmax < 0.0 || n < 1 {
        return Err(SepError::IllegalAperture(format!(
            "bad multi-annulus rmax={rmax} n={n}"
        )));
    }
    if subpix < 1 {
        return Err(SepError::InvalidSubpix(subpix as i32));
    }
    image.validate()?;
    let (w, h) = image.data.dim();

    let mut out = AnnulusSums {
        sum: vec![0.0; n],
        sumvar: vec![0.0; n],
        area: vec![0.0; n],
        maskarea: vec![0.0; n],
        flag: 0,
    };

    let scale = 1.0 / subpix as f64;
    let scale2 = scale * scale;
    let offset = 0.5 * (scale - 1.0);

    // Margin for interpolation past the outermost bin.
    let r_out = rmax + 1.5;
    let r_out2 = r_out * r_out;
    let step = rmax / n as f64;
    let stepdens = 1.0 / step;
    let prevbinmargin = OVERSAMP_MARGIN;
    let nextbinmargin = step - OVERSAMP_MARGIN;

    let (xmin, xmax, ymin, ymax) = boxextent(x, y, r_out, r_out, w, h, &mut out.flag);

    for iy in ymin..ymax {
        for ix in xmin..xmax {
            let dx = ix as f64 - x;
            let dy = iy as f64 - y;
            let rpix2 = dx * dx + dy * dy;
            if rpix2 >= r_out2 {
                continue;
            }
            let pix = image.data.get(ix, iy) as f64;
            let varpix = image.variance_at(ix, iy).unwrap_or(0.0);
            let ismasked = pix < -(BIG as f64) || image.is_masked(ix, iy);
            if ismasked {
                out.flag |= flags::APER_HAS_MASKED;
            }

            let rpix = rpix2.sqrt();
            let d = rpix % step;
            if d < prevbinmargin || d > nextbinmargin {
                // Close to a bin boundary; split the pixel across bins.
                let mut sdy = dy + offset;
                for _ in 0..subpix {
                    let mut sdx = dx + offset;
                    let dy2 = sdy * sdy;
                    for _ in 0..subpix {
                        let j = ((sdx * sdx + dy2).sqrt() * stepdens) as usize;
                        if j < n {
                            if ismasked {
                                out.maskarea[j] += scale2;
                            } else {
                                out.sum[j] += scale2 * pix;
                                out.sumvar[j] += scale2 * varpix;
                            }
                            out.area[j] += scale2;
                        }
                        sdx += scale;
                    }
                    sdy += scale;
                }
            } else {
                let j = (rpix * stepdens) as usize;
                if j < n {
                    if ismasked {
                        out.maskarea[j] += 1.0;
                    } else {
                        out.sum[j] += pix;
                        out.sumvar[j] += varpix;
                    }
                    out.area[j] += 1.0;
                }
            }
        }
    }

    if image.mask.is_some() {
        match policy {
            MaskPolicy::Ignore => {
                for j in 0..n {
                    out.area[j] -= out.maskarea[j];
                }
            }
            MaskPolicy::Correct => {
                for j in 0..n {
                    let tmp = if out.area[j] == out.maskarea[j] {
                        0.0
                    } else {
                        out.area[j] / (out.area[j] - out.maskarea[j])
                    };
                    out.sum[j] *= tmp;
                    out.sumvar[j] *= tmp;
                }
            }
        }
    }

    if image.gain > 0.0 {
        for j in 0..n {
            if out.sum[j] > 0.0 {
                out.sumvar[j] += out.sum[j] / image.gain;
            }
        }
    }

    Ok(out)
}

/// Invert the cumulative profile `y` (tabulated at `step`, `2*step`, ...)
/// at `ytarg`, interpolating linearly.
fn inverse(xmax: f64, y: &[f64], ytarg: f64) -> f64 {
    let n = y.len();
    let step = xmax / n as f64;
    let mut i = 0;
    while i < n && y[i] < ytarg {
        i += 1;
    }
    if i == 0 {
        if ytarg <= 0.0 || y[0] == 0.0 {
            return 0.0;
        }
        return step * ytarg / y[0];
    }
    if i == n {
        return xmax;
    }
    step * (i as f64 + (ytarg - y[i - 1]) / (y[i] - y[i - 1]))
}

/// Radii enclosing the given fractions of an object's flux.
///
/// The growth curve is measured in 64 circular annuli out to `rmax` and
/// inverted at each requested fraction. `fluxtot` overrides the normalizing
/// flux; by default the flux within `rmax` is used.
#[allow(clippy::too_many_arguments)]
pub fn flux_radius(
    image: &Image<'_>,
    x: f64,
    y: f64,
    rmax: f64,
    subpix: u32,
    policy: MaskPolicy,
    fluxtot: Option<f64>,
    fluxfrac: &[f64],
) -> Result<(Vec<f64>, u32), SepError> {
    let sums = sum_circann_multi(image, x, y, rmax, FLUX_RADIUS_BINS, subpix, policy)?;

    let mut cumul = sums.sum;
    for i in 1..FLUX_RADIUS_BINS {
        cumul[i] += cumul[i - 1];
    }
    let f = fluxtot.unwrap_or(cumul[FLUX_RADIUS_BINS - 1]);

    let radii = fluxfrac
        .iter()
        .map(|frac| inverse(rmax, &cumul, frac * f))
        .collect();
    Ok((radii, sums.flag))
}

/// First radial moment of the flux within the ellipse `(cxx, cyy, cxy)` at
/// scale `r`, in elliptical-radius units. The basis of the Kron aperture.
pub fn kron_radius(
    image: &Image<'_>,
    x: f64,
    y: f64,
    cxx: f64,
    cyy: f64,
    cxy: f64,
    r: f64,
) -> Result<(f64, u32), SepError> {
    image.validate()?;
    let (w, h) = image.data.dim();
    let r2 = r * r;
    let mut r1 = 0.0f64;
    let mut v1 = 0.0f64;
    let mut area = 0.0f64;
    let mut flag = 0u32;

    let (dxlim, dylim) = ellipse_extent(cxx, cyy, cxy, r);
    let (xmin, xmax, ymin, ymax) = boxextent(x, y, dxlim, dylim, w, h, &mut flag);

    for iy in ymin..ymax {
        for ix in xmin..xmax {
            let dx = ix as f64 - x;
            let dy = iy as f64 - y;
            let rpix2 = cxx * dx * dx + cyy * dy * dy + cxy * dx * dy;
            if rpix2 <= r2 {
                let pix = image.data.get(ix, iy) as f64;
                if pix < -(BIG as f64) || image.is_masked(ix, iy) {
                    flag |= flags::APER_HAS_MASKED;
                } else {
                    r1 += rpix2.sqrt() * pix;
                    v1 += pix;
                    area += 1.0;
                }
            }
        }
    }

    if area == 0.0 {
        flag |= flags::APER_ALL_MASKED;
        Ok((0.0, flag))
    } else if r1 <= 0.0 || v1 <= 0.0 {
        flag |= flags::APER_NONPOSITIVE;
        Ok((0.0, flag))
    } else {
        Ok((r1 / v1, flag))
    }
}

/// Gaussian-weighted iterative centroid within `4*sig` of the start
/// position.
///
/// To reproduce the classic windowed position, pass `sig` as the
/// half-light radius times `2/2.35` and start from the barycenter.
pub fn winpos(
    image: &Image<'_>,
    mut x: f64,
    mut y: f64,
    sig: f64,
    subpix: u32,
    policy: MaskPolicy,
) -> Result<WinCentroid, SepError> {
    if sig < 0.0 {
        return Err(SepError::IllegalAperture(format!("negative sigma {sig}")));
    }
    image.validate()?;
    let (w, h) = image.data.dim();

    let scale = if subpix > 0 { 1.0 / subpix as f64 } else { 0.0 };
    let scale2 = scale * scale;
    let offset = 0.5 * (scale - 1.0);
    let invtwosig2 = 1.0 / (2.0 * sig * sig);

    let r = WINPOS_NSIG * sig;
    let r2 = r * r;
    let (r_in2, r_out2) = oversamp_ann_circle(r);

    let mut flag = 0u32;
    let mut niter = 0;

    for i in 0..WINPOS_NITERMAX {
        niter = i + 1;
        let (xmin, xmax, ymin, ymax) = boxextent(x, y, r, r, w, h, &mut flag);

        let mut tv = 0.0f64;
        let mut twv = 0.0f64;
        let mut dxpos = 0.0f64;
        let mut dypos = 0.0f64;
        let mut totarea = 0.0f64;
        let mut maskarea = 0.0f64;
        let mut maskweight = 0.0f64;
        let mut maskdxpos = 0.0f64;
        let mut maskdypos = 0.0f64;

        for iy in ymin..ymax {
            for ix in xmin..xmax {
                let dx = ix as f64 - x;
                let dy = iy as f64 - y;
                let rpix2 = dx * dx + dy * dy;
                if rpix2 >= r_out2 {
                    continue;
                }
                let pixoverlap = if rpix2 > r_in2 {
                    if subpix == 0 {
                        circoverlap(dx - 0.5, dy - 0.5, dx + 0.5, dy + 0.5, r)
                    } else {
                        let mut ov = 0.0;
                        let mut sdy = dy + offset;
                        for _ in 0..subpix {
                            let mut sdx = dx + offset;
                            let dy2 = sdy * sdy;
                            for _ in 0..subpix {
                                if sdx * sdx + dy2 < r2 {
                                    ov += scale2;
                                }
                                sdx += scale;
                            }
                            sdy += scale;
                        }
                        ov
                    }
                } else {
                    1.0
                };

                let pix = image.data.get(ix, iy) as f64;
                let weight = (-rpix2 * invtwosig2).exp();

                if pix < -(BIG as f64) || image.is_masked(ix, iy) {
                    flag |= flags::APER_HAS_MASKED;
                    maskarea += pixoverlap;
                    maskweight += pixoverlap * weight;
                    maskdxpos += pixoverlap * weight * dx;
                    maskdypos += pixoverlap * weight * dy;
                } else {
                    tv += pix * pixoverlap;
                    let wpix = pix * pixoverlap * weight;
                    twv += wpix;
                    dxpos += wpix * dx;
                    dypos += wpix * dy;
                }
                totarea += pixoverlap;
            }
        }

        // Treat masked pixels as if they held the mean unmasked value.
        if maskarea > 0.0 {
            match policy {
                MaskPolicy::Ignore => totarea -= maskarea,
                MaskPolicy::Correct => {
                    if totarea > maskarea {
                        let tmp = tv / (totarea - maskarea);
                        twv += tmp * maskweight;
                        dxpos += tmp * maskdxpos;
                        dypos += tmp * maskdypos;
                    }
                }
            }
        }

        if twv > 0.0 {
            dxpos /= twv;
            dypos /= twv;
            x += dxpos * WINPOS_FAC;
            y += dypos * WINPOS_FAC;
        } else {
            break;
        }

        if dxpos * dxpos + dypos * dypos < WINPOS_STEPMIN * WINPOS_STEPMIN {
            break;
        }
    }

    Ok(WinCentroid { x, y, niter, flag })
}

/// Semi-axes and position angle of the ellipse `cxx*x^2 + cyy*y^2 +
/// cxy*x*y = 1`.
pub fn ellipse_axes(cxx: f64, cyy: f64, cxy: f64) -> Result<(f64, f64, f64), SepError> {
    let p = cxx + cyy;
    let q = cxx - cyy;
    let t = (q * q + cxy * cxy).sqrt();

    if cxx * cyy - cxy * cxy / 4.0 <= 0.0 || p <= 0.0 {
        return Err(SepError::NonEllipseParams);
    }

    let a = (2.0 / (p - t)).sqrt();
    let b = (2.0 / (p + t)).sqrt();

    let mut theta = if cxy == 0.0 || q == 0.0 {
        0.0
    } else {
        (cxy / q).atan() / 2.0
    };
    if cxx > cyy {
        theta += PI / 2.0;
    }
    if theta > PI / 2.0 {
        theta -= PI;
    }

    Ok((a, b, theta))
}

/// Quadratic-form coefficients of the ellipse with semi-axes `a`, `b` at
/// position angle `theta`.
pub fn ellipse_coeffs(a: f64, b: f64, theta: f64) -> (f64, f64, f64) {
    let (sin, cos) = theta.sin_cos();
    let cxx = cos * cos / (a * a) + sin * sin / (b * b);
    let cyy = sin * sin / (a * a) + cos * cos / (b * b);
    let cxy = 2.0 * cos * sin * (1.0 / (a * a) - 1.0 / (b * b));
    (cxx, cyy, cxy)
}

/// Paint `val` into every element of `arr` whose center falls inside the
/// level-`r` contour of the ellipse `(cxx, cyy, cxy)` around `(x, y)`.
#[allow(clippy::too_many_arguments)]
pub fn set_ellipse(
    arr: &mut ArrayViewMut2<'_, u8>,
    x: f64,
    y: f64,
    cxx: f64,
    cyy: f64,
    cxy: f64,
    r: f64,
    val: u8,
) {
    let (h, w) = arr.dim();
    let r2 = r * r;
    let mut flag = 0u32;
    let (dxlim, dylim) = ellipse_extent(cxx, cyy, cxy, r);
    let (xmin, xmax, ymin, ymax) = boxextent(x, y, dxlim, dylim, w, h, &mut flag);

    for iy in ymin..ymax {
        let dy = iy as f64 - y;
        let dy2 = dy * dy;
        for ix in xmin..xmax {
            let dx = ix as f64 - x;
            if cxx * dx * dx + cyy * dy2 + cxy * dx * dy <= r2 {
                arr[[iy, ix]] = val;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::convert::InputArray;
    use crate::image::{Noise, NoiseKind};
    use approx::assert_relative_eq;
    use ndarray::Array2;

    fn flat_image(w: usize, h: usize, value: f32) -> Array2<f32> {
        Array2::from_elem((h, w), value)
    }

    #[test]
    fn circle_on_flat_field_recovers_pi_r_squared() {
        let data = flat_image(64, 64, 1.0);
        let img = Image::new(InputArray::Float(data.view()));
        let r = 5.0;
        let res = sum_circle(&img, 32.0, 32.0, r, 0, MaskPolicy::Correct).unwrap();
        assert_relative_eq!(res.sum, PI * r * r, epsilon = 1e-6);
        assert_relative_eq!(res.area, PI * r * r, epsilon = 1e-6);
        assert_eq!(res.flag, 0);
    }

    #[test]
    fn subpixel_sampling_approaches_the_exact_answer() {
        let data = flat_image(64, 64, 1.0);
        let img = Image::new(InputArray::Float(data.view()));
        let exact = sum_circle(&img, 31.3, 32.7, 4.0, 0, MaskPolicy::Correct).unwrap();
        let sampled = sum_circle(&img, 31.3, 32.7, 4.0, 11, MaskPolicy::Correct).unwrap();
        assert_relative_eq!(sampled.sum, exact.sum, epsilon = 0.2);
    }

    #[test]
    fn ellipse_matches_circle_when_round() {
        let data = flat_image(64, 64, 2.0);
        let img = Image::new(InputArray::Float(data.view()));
        let c = sum_circle(&img, 30.0, 30.0, 6.0, 0, MaskPolicy::Correct).unwrap();
        let e = sum_ellipse(&img, 30.0, 30.0, 1.0, 1.0, 0.0, 6.0, 0, MaskPolicy::Correct).unwrap();
        assert_relative_eq!(c.sum, e.sum, epsilon = 1e-6);
    }

    #[test]
    fn annulus_is_outer_minus_inner() {
        let data = flat_image(64, 64, 1.0);
        let img = Image::new(InputArray::Float(data.view()));
        let inner = sum_circle(&img, 32.0, 32.0, 3.0, 0, MaskPolicy::Correct).unwrap();
        let outer = sum_circle(&img, 32.0, 32.0, 7.0, 0, MaskPolicy::Correct).unwrap();
        let ann = sum_circann(&img, 32.0, 32.0, 3.0, 7.0, 0, MaskPolicy::Correct).unwrap();
        assert_relative_eq!(ann.sum, outer.sum - inner.sum, epsilon = 1e-6);
    }

    #[test]
    fn truncated_aperture_is_flagged() {
        let data = flat_image(16, 16, 1.0);
        let img = Image::new(InputArray::Float(data.view()));
        let res = sum_circle(&img, 1.0, 8.0, 5.0, 0, MaskPolicy::Correct).unwrap();
        assert!(res.flag & flags::APER_TRUNCATED != 0);
    }

    #[test]
    fn mask_correct_rescales_and_ignore_shrinks() {
        let data = flat_image(64, 64, 1.0);
        let mut mask = Array2::<u8>::zeros((64, 64));
        // Mask a quarter-plane through the aperture center.
        for y in 32..64 {
            for x in 32..64 {
                mask[[y, x]] = 1;
            }
        }
        let img = Image {
            mask: Some(InputArray::Byte(mask.view())),
            ..Image::new(InputArray::Float(data.view()))
        };
        let corrected = sum_circle(&img, 32.0, 32.0, 5.0, 0, MaskPolicy::Correct).unwrap();
        let ignored = sum_circle(&img, 32.0, 32.0, 5.0, 0, MaskPolicy::Ignore).unwrap();
        assert!(corrected.flag & flags::APER_HAS_MASKED != 0);
        // Correction restores the full-field estimate on a flat image.
        assert_relative_eq!(corrected.sum, PI * 25.0, epsilon = 1e-6);
        // Ignoring drops about a quarter of the area.
        assert_relative_eq!(ignored.area, 0.75 * PI * 25.0, epsilon = 0.5);
    }

    #[test]
    fn gain_adds_poisson_variance() {
        let data = flat_image(32, 32, 4.0);
        let img = Image {
            noise: Noise::Scalar(NoiseKind::Stddev, 0.0),
            gain: 2.0,
            ..Image::new(InputArray::Float(data.view()))
        };
        let res = sum_circle(&img, 16.0, 16.0, 3.0, 0, MaskPolicy::Correct).unwrap();
        assert_relative_eq!(res.err, (res.sum / 2.0).sqrt(), epsilon = 1e-9);
    }

    #[test]
    fn negative_radius_is_rejected() {
        let data = flat_image(8, 8, 1.0);
        let img = Image::new(InputArray::Float(data.view()));
        let err = sum_circle(&img, 4.0, 4.0, -1.0, 0, MaskPolicy::Correct).unwrap_err();
        assert!(matches!(err, SepError::IllegalAperture(_)));
    }

    #[test]
    fn multi_annuli_tile_the_disk() {
        let data = flat_image(64, 64, 1.0);
        let img = Image::new(InputArray::Float(data.view()));
        let rmax = 8.0;
        let sums = sum_circann_multi(&img, 32.0, 32.0, rmax, 8, 5, MaskPolicy::Correct).unwrap();
        let total: f64 = sums.sum.iter().sum();
        assert_relative_eq!(total, PI * rmax * rmax, epsilon = 0.3);
    }

    #[test]
    fn flux_radius_on_flat_disk() {
        // Cumulative flux of a flat disk grows as r^2, so the half-flux
        // radius is rmax/sqrt(2).
        let data = flat_image(128, 128, 1.0);
        let img = Image::new(InputArray::Float(data.view()));
        let (radii, _) =
            flux_radius(&img, 64.0, 64.0, 20.0, 5, MaskPolicy::Correct, None, &[0.5]).unwrap();
        assert_relative_eq!(radii[0], 20.0 / 2.0f64.sqrt(), epsilon = 0.2);
    }

    #[test]
    fn kron_radius_of_flat_disk() {
        // First moment of r over a flat disk of radius R is 2R/3.
        let data = flat_image(64, 64, 1.0);
        let img = Image::new(InputArray::Float(data.view()));
        let (kr, flag) = kron_radius(&img, 32.0, 32.0, 1.0, 1.0, 0.0, 9.0).unwrap();
        assert!(flag == 0);
        assert_relative_eq!(kr, 6.0, epsilon = 0.1);
    }

    #[test]
    fn kron_radius_flags_nonpositive_flux() {
        let data = flat_image(32, 32, -1.0);
        let img = Image::new(InputArray::Float(data.view()));
        let (kr, flag) = kron_radius(&img, 16.0, 16.0, 1.0, 1.0, 0.0, 5.0).unwrap();
        assert_eq!(kr, 0.0);
        assert!(flag & flags::APER_NONPOSITIVE != 0);
    }

    #[test]
    fn winpos_walks_to_the_peak() {
        let mut data = Array2::<f32>::zeros((64, 64));
        let (x0, y0, sigma) = (30.4, 33.6, 2.0);
        for y in 0..64 {
            for x in 0..64 {
                let dx = x as f64 - x0;
                let dy = y as f64 - y0;
                data[[y, x]] =
                    (100.0 * (-(dx * dx + dy * dy) / (2.0 * sigma * sigma)).exp()) as f32;
            }
        }
        let img = Image::new(InputArray::Float(data.view()));
        // Start a pixel and a half off.
        let res = winpos(&img, 29.0, 35.0, sigma, 0, MaskPolicy::Correct).unwrap();
        assert_relative_eq!(res.x, x0, epsilon = 0.05);
        assert_relative_eq!(res.y, y0, epsilon = 0.05);
        assert!(res.niter <= WINPOS_NITERMAX);
    }

    #[test]
    fn ellipse_axes_and_coeffs_are_inverses() {
        let (a, b, theta) = (3.0, 1.5, 0.4);
        let (cxx, cyy, cxy) = ellipse_coeffs(a, b, theta);
        let (a2, b2, theta2) = ellipse_axes(cxx, cyy, cxy).unwrap();
        assert_relative_eq!(a, a2, epsilon = 1e-9);
        assert_relative_eq!(b, b2, epsilon = 1e-9);
        assert_relative_eq!(theta, theta2, epsilon = 1e-9);
    }

    #[test]
    fn ellipse_axes_rejects_degenerate_forms() {
        let err = ellipse_axes(1.0, 1.0, 2.5).unwrap_err();
        assert!(matches!(err, SepError::NonEllipseParams));
    }

    #[test]
    fn set_ellipse_paints_a_disk() {
        let mut arr = Array2::<u8>::zeros((32, 32));
        set_ellipse(&mut arr.view_mut(), 16.0, 16.0, 1.0, 1.0, 0.0, 4.0, 7);
        assert_eq!(arr[[16, 16]], 7);
        assert_eq!(arr[[16, 19]], 7);
        assert_eq!(arr[[16, 25]], 0);
        let painted = arr.iter().filter(|&&v| v == 7).count() as f64;
        // Pixel-center count tracks the ellipse area loosely.
        assert!((painted - PI * 16.0).abs() < 10.0);
    }
}

//! Per-object shape and flux analysis.
//!
//! `preanalyse` derives the cheap integrals needed while the deblending
//! tree is being built; `analyse` computes the full catalog quantities
//! (barycenter, central second moments and their uncertainties, ellipse
//! parameters, area correction) once an object's pixel membership is
//! final.

use crate::extract::object::{flags, RawObject};

/// Covariance determinant below which the moments are declared singular.
const SINGULARITY_THRESH: f64 = 0.00694;
/// Regularization added to both second moments in the singular case,
/// the variance of a uniform distribution over one pixel.
const SINGULARITY_STEP: f64 = 0.0833333;

/// Fill in the integrals the deblender needs: pixel count, detection-image
/// flux and peak, and the bounding box.
pub fn preanalyse(obj: &mut RawObject) {
    let mut fdflux = 0.0f64;
    let mut fdpeak = f64::MIN;
    let mut xmin = i32::MAX;
    let mut xmax = i32::MIN;
    let mut ymin = i32::MAX;
    let mut ymax = i32::MIN;

    for p in &obj.pixels {
        fdflux += p.cdvalue as f64;
        if (p.cdvalue as f64) > fdpeak {
            fdpeak = p.cdvalue as f64;
        }
        xmin = xmin.min(p.x);
        xmax = xmax.max(p.x);
        ymin = ymin.min(p.y);
        ymax = ymax.max(p.y);
    }

    obj.fdnpix = obj.pixels.len();
    obj.fdflux = fdflux;
    obj.fdpeak = if obj.pixels.is_empty() { 0.0 } else { fdpeak };
    obj.xmin = xmin;
    obj.xmax = xmax;
    obj.ymin = ymin;
    obj.ymax = ymax;
}

/// Full analysis of a finalized object.
///
/// Positions and second moments are weighted by the detection (filtered)
/// image; fluxes and peaks are reported for both images. When `robust` is
/// set and the object came out of deblending, second moments are taken
/// about the barycenter established before the faint-pixel reassignment,
/// which is more stable for blended profiles. `gain` adds a Poisson term
/// to the positional uncertainties when positive.
pub fn analyse(obj: &mut RawObject, robust: bool, gain: f64) {
    preanalyse(obj);
    if obj.pixels.is_empty() {
        return;
    }

    let xmin = obj.xmin as f64;
    let ymin = obj.ymin as f64;

    let mut rv = 0.0f64; // total detection flux
    let mut tv = 0.0f64; // total measurement flux
    let mut mx = 0.0f64;
    let mut my = 0.0f64;
    let mut mx2 = 0.0f64;
    let mut my2 = 0.0f64;
    let mut mxy = 0.0f64;
    let mut dnpix = 0usize;
    let mut peak = f64::MIN;
    let mut cpeak = f64::MIN;

    // Raw sums for the variance-weighted position errors.
    let mut esum = 0.0f64;
    let mut ex = 0.0f64;
    let mut ey = 0.0f64;
    let mut exx = 0.0f64;
    let mut eyy = 0.0f64;
    let mut exy = 0.0f64;

    for p in &obj.pixels {
        let x = p.x as f64 - xmin;
        let y = p.y as f64 - ymin;
        let val = p.value as f64;
        let cval = p.cdvalue as f64;

        rv += cval;
        tv += val;
        if val > p.thresh as f64 {
            dnpix += 1;
        }
        if val > peak {
            peak = val;
            obj.xpeak = p.x;
            obj.ypeak = p.y;
        }
        if cval > cpeak {
            cpeak = cval;
            obj.xcpeak = p.x;
            obj.ycpeak = p.y;
        }

        mx += cval * x;
        my += cval * y;
        mx2 += cval * x * x;
        my2 += cval * y * y;
        mxy += cval * x * y;

        let mut cvar = p.var as f64;
        if gain > 0.0 && cval > 0.0 {
            cvar += cval / gain;
        }
        esum += cvar;
        ex += cvar * x;
        ey += cvar * y;
        exx += cvar * x * x;
        eyy += cvar * y * y;
        exy += cvar * x * y;
    }

    obj.dnpix = dnpix;
    obj.dflux = tv;
    obj.dpeak = peak;
    obj.fdpeak = cpeak;

    if rv <= 0.0 {
        // Degenerate detection flux: report the peak position and leave the
        // moments at a point-like default.
        obj.mx = obj.xcpeak as f64;
        obj.my = obj.ycpeak as f64;
        obj.flag |= flags::SINGULAR;
        obj.mx2 = SINGULARITY_STEP;
        obj.my2 = SINGULARITY_STEP;
        obj.mxy = 0.0;
        finish_ellipse(obj);
        return;
    }

    let xm = mx / rv;
    let ym = my / rv;

    let (xm2, ym2, xym, xc, yc) = if robust && (obj.flag & flags::MERGED) != 0 {
        // Second moments about the pre-reassignment barycenter.
        let xn = obj.mx - xmin;
        let yn = obj.my - ymin;
        (
            mx2 / rv + xn * xn - 2.0 * xm * xn,
            my2 / rv + yn * yn - 2.0 * ym * yn,
            mxy / rv + xn * yn - xm * yn - xn * ym,
            xn,
            yn,
        )
    } else {
        (
            mx2 / rv - xm * xm,
            my2 / rv - ym * ym,
            mxy / rv - xm * ym,
            xm,
            ym,
        )
    };

    obj.mx = xc + xmin;
    obj.my = yc + ymin;

    // Positional uncertainties about the barycenter.
    let rv2 = rv * rv;
    obj.errx2 = (exx - 2.0 * xc * ex + xc * xc * esum) / rv2;
    obj.erry2 = (eyy - 2.0 * yc * ey + yc * yc * esum) / rv2;
    obj.errxy = (exy - xc * ey - yc * ex + xc * yc * esum) / rv2;

    let (mut xm2, mut ym2, xym) = (xm2, ym2, xym);
    if xm2 * ym2 - xym * xym < SINGULARITY_THRESH {
        xm2 += SINGULARITY_STEP;
        ym2 += SINGULARITY_STEP;
        obj.flag |= flags::SINGULAR;
    }
    obj.mx2 = xm2;
    obj.my2 = ym2;
    obj.mxy = xym;

    finish_ellipse(obj);

    // Area correction: compare the isophotal area at the detection
    // threshold against the area at a threshold halfway to the peak,
    // assuming an exponential light profile.
    let thresh = obj.thresh;
    let thresh2 = 0.5 * (thresh + obj.dpeak);
    let area2 = obj
        .pixels
        .iter()
        .filter(|p| p.value as f64 > thresh2)
        .count();
    let darea = area2 as f64 - dnpix as f64;
    let t1t2 = if thresh2 != 0.0 { thresh / thresh2 } else { 0.0 };
    obj.abcor = if t1t2 > 0.0 && obj.a > 0.0 && obj.b > 0.0 {
        let num = if darea < 0.0 { darea } else { -1.0 };
        let cor = num
            / (2.0
                * std::f64::consts::PI
                * t1t2.min(0.99).ln()
                * obj.a as f64
                * obj.b as f64);
        cor.min(1.0) as f32
    } else {
        1.0
    };
}

/// Ellipse parameters from the (already regularized) central moments.
fn finish_ellipse(obj: &mut RawObject) {
    let xm2 = obj.mx2;
    let ym2 = obj.my2;
    let xym = obj.mxy;

    obj.theta = if xm2 == ym2 && xym == 0.0 {
        std::f64::consts::FRAC_PI_4 as f32
    } else {
        (0.5 * (2.0 * xym).atan2(xm2 - ym2)) as f32
    };

    let temp = (0.25 * (xm2 - ym2) * (xm2 - ym2) + xym * xym).sqrt();
    let pmx2 = 0.5 * (xm2 + ym2) + temp;
    let pmy2 = 0.5 * (xm2 + ym2) - temp;
    obj.a = pmx2.max(0.0).sqrt() as f32;
    obj.b = pmy2.max(0.0).sqrt() as f32;

    let det = xm2 * ym2 - xym * xym;
    if det > 0.0 {
        obj.cxx = (ym2 / det) as f32;
        obj.cyy = (xm2 / det) as f32;
        obj.cxy = (-2.0 * xym / det) as f32;
    } else {
        obj.cxx = 1.0;
        obj.cyy = 1.0;
        obj.cxy = 0.0;
    }
}

/// Threshold above which only `minarea` member pixels would remain, in
/// detection-image units; feeds the cleaning decision. For a variable
/// threshold the per-pixel margin is referenced to the object threshold.
pub fn analyse_mthresh(obj: &mut RawObject, minarea: usize) {
    if obj.pixels.len() < minarea || minarea == 0 {
        obj.mthresh = 0.0;
        return;
    }
    let mut margins: Vec<f64> = obj
        .pixels
        .iter()
        .map(|p| p.cdvalue as f64 - (p.thresh as f64 - obj.thresh))
        .collect();
    margins.sort_by(|a, b| b.partial_cmp(a).unwrap_or(std::cmp::Ordering::Equal));
    obj.mthresh = margins[minarea - 1];
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extract::pixlist::PixelRecord;
    use approx::assert_relative_eq;

    fn pix(x: i32, y: i32, v: f32) -> PixelRecord {
        PixelRecord {
            x,
            y,
            value: v,
            cdvalue: v,
            var: 0.0,
            thresh: 0.5,
            next: -1,
        }
    }

    fn gaussian_blob(cx: f64, cy: f64, sigma: f64, amp: f32) -> Vec<PixelRecord> {
        let mut pixels = Vec::new();
        for y in 0..32 {
            for x in 0..32 {
                let dx = x as f64 - cx;
                let dy = y as f64 - cy;
                let v = amp as f64 * (-(dx * dx + dy * dy) / (2.0 * sigma * sigma)).exp();
                if v > 0.5 {
                    pixels.push(pix(x, y, v as f32));
                }
            }
        }
        pixels
    }

    #[test]
    fn preanalyse_integrals_and_bbox() {
        let mut obj = RawObject::from_pixels(
            vec![pix(3, 4, 1.0), pix(4, 4, 3.0), pix(5, 6, 2.0)],
            0.5,
            0,
        );
        preanalyse(&mut obj);
        assert_eq!(obj.fdnpix, 3);
        assert_relative_eq!(obj.fdflux, 6.0);
        assert_relative_eq!(obj.fdpeak, 3.0);
        assert_eq!((obj.xmin, obj.xmax, obj.ymin, obj.ymax), (3, 5, 4, 6));
    }

    #[test]
    fn symmetric_gaussian_centroid_and_roundness() {
        let mut obj = RawObject::from_pixels(gaussian_blob(15.0, 17.0, 2.0, 100.0), 0.5, 0);
        analyse(&mut obj, true, 0.0);
        assert_relative_eq!(obj.mx, 15.0, epsilon = 0.01);
        assert_relative_eq!(obj.my, 17.0, epsilon = 0.01);
        // Circular source: both axes equal within truncation effects.
        assert_relative_eq!(obj.a, obj.b, epsilon = 0.02);
        assert_relative_eq!(obj.mx2, obj.my2, epsilon = 0.02);
        assert_eq!(obj.xpeak, 15);
        assert_eq!(obj.ypeak, 17);
    }

    #[test]
    fn single_pixel_object_is_flagged_singular() {
        let mut obj = RawObject::from_pixels(vec![pix(7, 9, 5.0)], 0.5, 0);
        analyse(&mut obj, true, 0.0);
        assert!(obj.flag & flags::SINGULAR != 0);
        assert!(obj.mx2 > 0.0);
        assert!(obj.a > 0.0);
    }

    #[test]
    fn elongated_source_orientation() {
        // Horizontal bar: theta ~ 0, a > b.
        let pixels: Vec<_> = (0..9).map(|x| pix(x, 5, 10.0)).collect();
        let mut obj = RawObject::from_pixels(pixels, 0.5, 0);
        analyse(&mut obj, true, 0.0);
        assert!(obj.a > obj.b);
        assert_relative_eq!(obj.theta, 0.0, epsilon = 1e-6);
    }

    #[test]
    fn mthresh_is_the_minarea_th_brightest() {
        let pixels: Vec<_> = (0..6).map(|i| pix(i, 0, (i + 1) as f32)).collect();
        let mut obj = RawObject::from_pixels(pixels, 0.5, 0);
        preanalyse(&mut obj);
        analyse_mthresh(&mut obj, 3);
        // Values 1..6 descending: 6, 5, 4 -> third brightest is 4.
        assert_relative_eq!(obj.mthresh, 4.0);
    }

    #[test]
    fn mthresh_zero_when_below_minarea() {
        let mut obj = RawObject::from_pixels(vec![pix(0, 0, 1.0)], 0.5, 0);
        analyse_mthresh(&mut obj, 5);
        assert_relative_eq!(obj.mthresh, 0.0);
    }

    #[test]
    fn gain_contributes_to_position_errors() {
        let mut low = RawObject::from_pixels(gaussian_blob(15.0, 15.0, 2.0, 100.0), 0.5, 0);
        let mut high = low.clone();
        analyse(&mut low, true, 0.0);
        analyse(&mut high, true, 2.0);
        assert!(high.errx2 > low.errx2);
    }
}

//! Cleaning: removal of detections that are artifacts of a brighter
//! neighbor's profile wings.
//!
//! Each object is modeled as a Moffat-like profile from its flux, area and
//! ellipse. A fainter object is removed when the brighter one's profile,
//! evaluated at the faint object's position, still exceeds the threshold at
//! which the faint object would have shrunk below the minimum area.

use crate::extract::object::RawObject;

/// Neighborhood radius for the pairwise test, in units of the summed
/// semi-major axes.
const CLEAN_ZONE: f64 = 10.0;

/// Decide which objects survive cleaning.
///
/// Assumes `mthresh` is already computed for every object. Returns one
/// bool per object, in order.
pub fn clean(objects: &[RawObject], clean_param: f64) -> Vec<bool> {
    let beta = clean_param;
    let mut survives = vec![true; objects.len()];

    for i in 0..objects.len() {
        if !survives[i] {
            continue;
        }
        let o1 = &objects[i];
        let unitarea_in = std::f64::consts::PI * o1.a as f64 * o1.b as f64;
        let (amp_in, alpha_in) = profile_params(o1, unitarea_in, beta);

        for j in i + 1..objects.len() {
            if !survives[j] {
                continue;
            }
            let o2 = &objects[j];
            let dx = o1.mx - o2.mx;
            let dy = o1.my - o2.my;
            let rlim = (o1.a + o2.a) as f64;
            if dx * dx + dy * dy > rlim * rlim * CLEAN_ZONE * CLEAN_ZONE {
                continue;
            }

            if o2.fdflux < o1.fdflux {
                if eats(o1, amp_in, alpha_in, beta, dx, dy, o2.mthresh) {
                    survives[j] = false;
                }
            } else {
                let unitarea = std::f64::consts::PI * o2.a as f64 * o2.b as f64;
                let (amp, alpha) = profile_params(o2, unitarea, beta);
                if eats(o2, amp, alpha, beta, dx, dy, o1.mthresh) {
                    survives[i] = false;
                }
            }
        }
    }
    survives
}

/// Amplitude and radial scale of the object's profile model.
fn profile_params(obj: &RawObject, unitarea: f64, beta: f64) -> (f64, f64) {
    if unitarea <= 0.0 || obj.abcor as f64 <= 0.0 || obj.fdnpix == 0 || obj.thresh <= 0.0 {
        return (0.0, 0.0);
    }
    let amp = obj.fdflux / (2.0 * unitarea * obj.abcor as f64);
    let alpha = if amp > 0.0 {
        ((amp / obj.thresh).powf(1.0 / beta) - 1.0) * unitarea / obj.fdnpix as f64
    } else {
        0.0
    };
    (amp, alpha)
}

/// Whether `big`'s profile at offset `(dx, dy)` exceeds the victim's
/// minimum-area threshold.
fn eats(big: &RawObject, amp: f64, alpha: f64, beta: f64, dx: f64, dy: f64, mthresh: f64) -> bool {
    let val = 1.0
        + alpha
            * (big.cxx as f64 * dx * dx + big.cyy as f64 * dy * dy + big.cxy as f64 * dx * dy);
    if val <= 1.0 {
        return false;
    }
    let profile = if val < 1e10 { amp * val.powf(-beta) } else { 0.0 };
    profile > mthresh
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extract::analyse::{analyse, analyse_mthresh};
    use crate::extract::pixlist::PixelRecord;

    fn blob(cx: f64, cy: f64, sigma: f64, amp: f64, thresh: f64) -> RawObject {
        let mut pixels = Vec::new();
        let r = (4.0 * sigma).ceil() as i32;
        for y in (cy as i32 - r)..=(cy as i32 + r) {
            for x in (cx as i32 - r)..=(cx as i32 + r) {
                let dx = x as f64 - cx;
                let dy = y as f64 - cy;
                let v = amp * (-(dx * dx + dy * dy) / (2.0 * sigma * sigma)).exp();
                if v > thresh {
                    pixels.push(PixelRecord {
                        x,
                        y,
                        value: v as f32,
                        cdvalue: v as f32,
                        var: 0.0,
                        thresh: thresh as f32,
                        next: -1,
                    });
                }
            }
        }
        let mut obj = RawObject::from_pixels(pixels, thresh, 0);
        analyse(&mut obj, true, 0.0);
        analyse_mthresh(&mut obj, 5);
        obj
    }

    #[test]
    fn faint_satellite_in_bright_wings_is_removed() {
        let bright = blob(20.0, 20.0, 4.0, 1000.0, 1.0);
        // A tiny faint clump just outside the bright isophote.
        let mut faint = blob(29.0, 20.0, 0.8, 3.0, 1.0);
        faint.mthresh = 0.5;
        let survives = clean(&[bright, faint], 1.0);
        assert_eq!(survives, vec![true, false]);
    }

    #[test]
    fn distant_neighbor_survives() {
        let bright = blob(20.0, 20.0, 2.0, 1000.0, 1.0);
        let faint = blob(500.0, 500.0, 1.0, 10.0, 1.0);
        let survives = clean(&[bright, faint], 1.0);
        assert_eq!(survives, vec![true, true]);
    }

    #[test]
    fn comparable_pair_both_survive() {
        let a = blob(10.0, 10.0, 1.5, 100.0, 1.0);
        let b = blob(22.0, 10.0, 1.5, 100.0, 1.0);
        let survives = clean(&[a, b], 1.0);
        assert_eq!(survives, vec![true, true]);
    }
}

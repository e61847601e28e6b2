//! Shared synthetic-frame builders for the integration tests.

use ndarray::Array2;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// A synthetic Gaussian star.
#[derive(Debug, Clone, Copy)]
pub struct Star {
    pub x: f64,
    pub y: f64,
    pub amp: f64,
    pub sigma: f64,
}

impl Star {
    pub fn new(x: f64, y: f64, amp: f64, sigma: f64) -> Star {
        Star { x, y, amp, sigma }
    }

    /// Total flux of the profile integrated over the plane.
    pub fn total_flux(&self) -> f64 {
        2.0 * std::f64::consts::PI * self.amp * self.sigma * self.sigma
    }
}

/// Render stars onto a frame, nearest 6-sigma neighborhood only.
pub fn add_stars(frame: &mut Array2<f32>, stars: &[Star]) {
    let (h, w) = frame.dim();
    for star in stars {
        let r = (6.0 * star.sigma).ceil() as i64;
        let x0 = star.x.round() as i64;
        let y0 = star.y.round() as i64;
        for y in (y0 - r).max(0)..(y0 + r + 1).min(h as i64) {
            for x in (x0 - r).max(0)..(x0 + r + 1).min(w as i64) {
                let dx = x as f64 - star.x;
                let dy = y as f64 - star.y;
                let v = star.amp
                    * (-(dx * dx + dy * dy) / (2.0 * star.sigma * star.sigma)).exp();
                frame[[y as usize, x as usize]] += v as f32;
            }
        }
    }
}

/// Flat sky level plus a mild horizontal gradient.
pub fn add_sky(frame: &mut Array2<f32>, level: f64, slope: f64) {
    let (h, w) = frame.dim();
    for y in 0..h {
        for x in 0..w {
            frame[[y, x]] += (level + slope * x as f64) as f32;
        }
    }
}

/// Seeded Gaussian read noise via the central limit of uniform draws.
pub fn add_noise(frame: &mut Array2<f32>, sigma: f64, seed: u64) {
    let mut rng = StdRng::seed_from_u64(seed);
    for v in frame.iter_mut() {
        let mut s = 0.0f64;
        for _ in 0..12 {
            s += rng.gen::<f64>();
        }
        *v += (sigma * (s - 6.0)) as f32;
    }
}

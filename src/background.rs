//! Tiled robust background estimation.
//!
//! The image is divided into a grid of tiles (default 64x64 pixels). Each
//! tile gets a robust background level and noise estimate from an iteratively
//! clipped histogram of its pixels; unusable tiles are repaired from their
//! neighbors, the grid is median filtered to suppress bright sources, and
//! natural cubic splines over the tile nodes turn the coarse grid into a
//! smooth full-resolution model that can be queried per pixel, per row, or
//! rendered and subtracted wholesale.

use ndarray::Array2;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::convert::OutputArray;
use crate::error::SepError;
use crate::image::{Image, BIG};

/// Fraction of a tile that must hold valid pixels for the tile to be used.
const MIN_GOOD_FRAC: f64 = 0.5;
/// Half-width of the histogram in sigma units.
const QUANT_NSIGMA: f64 = 5.0;
/// Hard cap on histogram resolution.
const QUANT_MAX_LEVELS: usize = 4096;
/// Minimum pixels per histogram bin, on average.
const QUANT_AMIN: f64 = 4.0;
/// Relative sigma change below which the histogram clipping has converged.
const GUESS_EPS: f64 = 1e-4;

/// Background estimation parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackgroundConfig {
    /// Tile width in pixels.
    pub bw: usize,
    /// Tile height in pixels.
    pub bh: usize,
    /// Median filter width, in tiles.
    pub fw: usize,
    /// Median filter height, in tiles.
    pub fh: usize,
    /// Filter replacement threshold: the median only replaces a tile value
    /// when they differ by at least this much.
    pub fthresh: f64,
}

impl Default for BackgroundConfig {
    fn default() -> Self {
        BackgroundConfig {
            bw: 64,
            bh: 64,
            fw: 3,
            fh: 3,
            fthresh: 0.0,
        }
    }
}

/// Per-tile working state while building the grid.
struct TileStat {
    mean: f64,
    sigma: f64,
    nlevels: usize,
    qscale: f64,
    qzero: f64,
    lcut: f32,
    hcut: f32,
    histo: Vec<u32>,
}

impl TileStat {
    fn bad() -> Self {
        TileStat {
            mean: -(BIG as f64),
            sigma: -(BIG as f64),
            nlevels: 0,
            qscale: 1.0,
            qzero: 0.0,
            lcut: 0.0,
            hcut: 0.0,
            histo: Vec::new(),
        }
    }

    fn is_bad(&self) -> bool {
        self.mean <= -(BIG as f64)
    }
}

/// A fitted background model.
///
/// Holds the filtered tile grids for the background level and its RMS, plus
/// the spline second derivatives needed for smooth evaluation. All queries
/// are read-only; the model is independent of the image it was built from.
pub struct Background {
    w: usize,
    h: usize,
    bw: usize,
    bh: usize,
    nx: usize,
    ny: usize,
    back: Vec<f32>,
    dback: Vec<f32>,
    sigma: Vec<f32>,
    dsigma: Vec<f32>,
    global: f32,
    global_rms: f32,
}

impl Background {
    /// Estimate the background of `image`.
    ///
    /// # Arguments
    /// * `image` - Input frame; its mask (if any) excludes pixels from all
    ///   tile statistics.
    /// * `cfg` - Tile and filter geometry.
    pub fn new(image: &Image<'_>, cfg: &BackgroundConfig) -> Result<Background, SepError> {
        image.validate()?;
        if cfg.bw == 0 || cfg.bh == 0 {
            return Err(SepError::InvalidConfig(
                "background tile size must be positive".into(),
            ));
        }
        if cfg.fw == 0 || cfg.fh == 0 {
            return Err(SepError::InvalidConfig(
                "background filter size must be positive".into(),
            ));
        }

        let (w, h) = image.data.dim();
        let nx = ((w.saturating_sub(1)) / cfg.bw + 1).max(1);
        let ny = ((h.saturating_sub(1)) / cfg.bh + 1).max(1);
        let nb = nx * ny;

        let mut back = vec![0.0f32; nb];
        let mut sigma = vec![0.0f32; nb];

        // Working buffers for one row of tiles.
        let mut buf = vec![0.0f32; w * cfg.bh];
        let mut good = vec![true; w * cfg.bh];

        for j in 0..ny {
            let y0 = j * cfg.bh;
            let hc = cfg.bh.min(h - y0);
            for r in 0..hc {
                image.data.read_row(y0 + r, &mut buf[r * w..(r + 1) * w]);
            }
            if image.mask.is_some() {
                for r in 0..hc {
                    for x in 0..w {
                        good[r * w + x] = !image.is_masked(x, y0 + r);
                    }
                }
            }

            for m in 0..nx {
                let x0 = m * cfg.bw;
                let tw = cfg.bw.min(w - x0);
                let mut stat = tile_stats(&buf, &good, w, hc, x0, tw);
                if !stat.is_bad() {
                    tile_histogram(&mut stat, &buf, &good, w, hc, x0, tw);
                }
                let (b, s) = histogram_guess(&stat);
                back[j * nx + m] = b;
                sigma[j * nx + m] = s;
            }
        }

        let (global, global_rms) = filter_grid(&mut back, &mut sigma, nx, ny, cfg);

        let dback = make_spline(&back, nx, ny);
        let dsigma = make_spline(&sigma, nx, ny);

        debug!(
            nx,
            ny, global, global_rms, "background grid fitted and filtered"
        );

        Ok(Background {
            w,
            h,
            bw: cfg.bw,
            bh: cfg.bh,
            nx,
            ny,
            back,
            dback,
            sigma,
            dsigma,
            global,
            global_rms,
        })
    }

    /// Image width this model was built for.
    pub fn width(&self) -> usize {
        self.w
    }

    /// Image height this model was built for.
    pub fn height(&self) -> usize {
        self.h
    }

    /// Median of the filtered tile background levels.
    pub fn global(&self) -> f32 {
        self.global
    }

    /// Median of the filtered tile noise estimates.
    pub fn global_rms(&self) -> f32 {
        self.global_rms
    }

    /// Background level at a single pixel, by bilinear interpolation between
    /// the four surrounding tile nodes. Cheaper but slightly less smooth
    /// than the spline evaluation used by [`Background::line_into`].
    pub fn pix(&self, x: usize, y: usize) -> f32 {
        let nx = self.nx;
        let ny = self.ny;

        let mut dx = x as f64 / self.bw as f64 - 0.5;
        let mut dy = y as f64 / self.bh as f64 - 0.5;
        let mut xl = dx as isize;
        let mut yl = dy as isize;
        dx -= xl as f64;
        dy -= yl as f64;

        if xl < 0 {
            xl = 0;
            dx -= 1.0;
        } else if xl >= nx as isize - 1 {
            xl = if nx < 2 { 0 } else { nx as isize - 2 };
            dx += 1.0;
        }
        if yl < 0 {
            yl = 0;
            dy -= 1.0;
        } else if yl >= ny as isize - 1 {
            yl = if ny < 2 { 0 } else { ny as isize - 2 };
            dy += 1.0;
        }

        let pos = yl as usize * nx + xl as usize;
        let b0 = self.back[pos] as f64;
        let b1 = if nx < 2 { b0 } else { self.back[pos + 1] as f64 };
        let (b2, b3) = if ny < 2 {
            (b1, b0)
        } else if nx < 2 {
            (self.back[pos + nx] as f64, self.back[pos + nx] as f64)
        } else {
            (
                self.back[pos + nx + 1] as f64,
                self.back[pos + nx] as f64,
            )
        };

        let cdx = 1.0 - dx;
        ((1.0 - dy) * (cdx * b0 + dx * b1) + dy * (dx * b2 + cdx * b3)) as f32
    }

    /// Evaluate the background model along image row `y` into `line`.
    pub fn line_into(&self, y: usize, line: &mut [f32]) {
        self.spline_line(&self.back, &self.dback, y, line);
    }

    /// Evaluate the noise model along image row `y` into `line`.
    pub fn rms_line_into(&self, y: usize, line: &mut [f32]) {
        self.spline_line(&self.sigma, &self.dsigma, y, line);
    }

    /// Render the full background model.
    pub fn array(&self) -> Array2<f32> {
        self.render(&self.back, &self.dback)
    }

    /// Render the full noise model.
    pub fn rms_array(&self) -> Array2<f32> {
        self.render(&self.sigma, &self.dsigma)
    }

    /// Subtract the model from one row of `out`.
    pub fn subtract_line(&self, y: usize, out: &mut OutputArray<'_>) -> Result<(), SepError> {
        let (w, h) = out.dim();
        if (w, h) != (self.w, self.h) {
            return Err(SepError::DimensionMismatch {
                name: "output",
                dw: self.w,
                dh: self.h,
                w,
                h,
            });
        }
        let mut line = vec![0.0f32; self.w];
        self.line_into(y, &mut line);
        out.subtract_row(y, &line);
        Ok(())
    }

    /// Subtract the model from every row of `out`.
    pub fn subtract_from(&self, out: &mut OutputArray<'_>) -> Result<(), SepError> {
        let (w, h) = out.dim();
        if (w, h) != (self.w, self.h) {
            return Err(SepError::DimensionMismatch {
                name: "output",
                dw: self.w,
                dh: self.h,
                w,
                h,
            });
        }
        let mut line = vec![0.0f32; self.w];
        for y in 0..self.h {
            self.line_into(y, &mut line);
            out.subtract_row(y, &line);
        }
        Ok(())
    }

    fn render(&self, values: &[f32], dvalues: &[f32]) -> Array2<f32> {
        let mut out = Array2::<f32>::zeros((self.h, self.w));
        let mut line = vec![0.0f32; self.w];
        for y in 0..self.h {
            self.spline_line(values, dvalues, y, &mut line);
            for (dst, &v) in out.row_mut(y).iter_mut().zip(&line) {
                *dst = v;
            }
        }
        out
    }

    /// Bicubic spline evaluation of the tile grid along one image row:
    /// a y-spline interpolates each tile column to this row, then a fresh
    /// x-spline over those nodes fills the pixels.
    fn spline_line(&self, values: &[f32], dvalues: &[f32], y: usize, line: &mut [f32]) {
        let nbx = self.nx;
        let nby = self.ny;

        let (node, dnode): (Vec<f32>, Vec<f32>) = if nby > 1 {
            let mut dy = y as f64 / self.bh as f64 - 0.5;
            let mut yl = dy as isize;
            dy -= yl as f64;
            if yl < 0 {
                yl = 0;
                dy -= 1.0;
            } else if yl >= nby as isize - 1 {
                yl = nby as isize - 2;
                dy += 1.0;
            }
            let cdy = 1.0 - dy;
            let dy3 = dy * dy * dy - dy;
            let cdy3 = cdy * cdy * cdy - cdy;
            let lo = yl as usize * nbx;
            let hi = lo + nbx;

            let mut node = vec![0.0f32; nbx];
            for x in 0..nbx {
                node[x] = (cdy * values[lo + x] as f64
                    + dy * values[hi + x] as f64
                    + cdy3 * dvalues[lo + x] as f64
                    + dy3 * dvalues[hi + x] as f64) as f32;
            }
            let dnode = make_spline(&node, nbx, 1);
            (node, dnode)
        } else {
            (values.to_vec(), dvalues.to_vec())
        };

        if nbx > 1 {
            // Nodes sit at tile centers; pixels left of the first node and
            // right of the last extrapolate the edge segment.
            let bw = self.bw as f64;
            for (px, out) in line.iter_mut().take(self.w).enumerate() {
                let t = (px as f64 + 0.5) / bw - 0.5;
                let p = (t.floor() as isize).clamp(0, nbx as isize - 2) as usize;
                let dx = t - p as f64;
                let cdx = 1.0 - dx;
                *out = (cdx * (node[p] as f64 + (cdx * cdx - 1.0) * dnode[p] as f64)
                    + dx * (node[p + 1] as f64 + (dx * dx - 1.0) * dnode[p + 1] as f64))
                    as f32;
            }
        } else {
            for out in line.iter_mut().take(self.w) {
                *out = node[0];
            }
        }
    }
}

/// Two-pass clipped mean and sigma for one tile.
///
/// First pass over all valid pixels; if fewer than half the tile is valid
/// the tile is discarded. Second pass restricted to mean +/- 2 sigma.
fn tile_stats(buf: &[f32], good: &[bool], w: usize, rows: usize, x0: usize, tw: usize) -> TileStat {
    let mut sum = 0.0f64;
    let mut sqsum = 0.0f64;
    let mut npix = 0usize;
    for r in 0..rows {
        for x in x0..x0 + tw {
            let pix = buf[r * w + x] as f64;
            if good[r * w + x] && pix > -(BIG as f64) {
                sum += pix;
                sqsum += pix * pix;
                npix += 1;
            }
        }
    }
    if (npix as f64) < tw as f64 * rows as f64 * MIN_GOOD_FRAC {
        return TileStat::bad();
    }

    let mean = sum / npix as f64;
    let var = sqsum / npix as f64 - mean * mean;
    let sigma = if var > 0.0 { var.sqrt() } else { 0.0 };
    let lcut = (mean - 2.0 * sigma) as f32;
    let hcut = (mean + 2.0 * sigma) as f32;

    sum = 0.0;
    sqsum = 0.0;
    npix = 0;
    for r in 0..rows {
        for x in x0..x0 + tw {
            let pix = buf[r * w + x];
            if good[r * w + x] && pix >= lcut && pix <= hcut {
                sum += pix as f64;
                sqsum += pix as f64 * pix as f64;
                npix += 1;
            }
        }
    }
    if npix == 0 {
        return TileStat::bad();
    }

    let mean = sum / npix as f64;
    let var = sqsum / npix as f64 - mean * mean;
    let sigma = if var > 0.0 { var.sqrt() } else { 0.0 };

    let step = (2.0 / std::f64::consts::PI).sqrt() * QUANT_NSIGMA / QUANT_AMIN;
    let nlevels = ((step * npix as f64 + 1.0) as usize).min(QUANT_MAX_LEVELS);
    let qscale = if sigma > 0.0 {
        2.0 * QUANT_NSIGMA * sigma / nlevels as f64
    } else {
        1.0
    };
    let qzero = mean - QUANT_NSIGMA * sigma;

    TileStat {
        mean,
        sigma,
        nlevels,
        qscale,
        qzero,
        lcut,
        hcut,
        histo: Vec::new(),
    }
}

/// Fill the tile histogram from the clipped pixel values.
fn tile_histogram(
    stat: &mut TileStat,
    buf: &[f32],
    good: &[bool],
    w: usize,
    rows: usize,
    x0: usize,
    tw: usize,
) {
    stat.histo = vec![0u32; stat.nlevels];
    let cste = 0.499999 - stat.qzero / stat.qscale;
    for r in 0..rows {
        for x in x0..x0 + tw {
            if !good[r * w + x] {
                continue;
            }
            let bin = (buf[r * w + x] as f64 / stat.qscale + cste) as isize;
            if bin >= 0 && (bin as usize) < stat.nlevels {
                stat.histo[bin as usize] += 1;
            }
        }
    }
}

/// Estimate the background level and sigma from a tile histogram by
/// iterative 3-sigma window shrinking around the running median, with the
/// mode estimated as `2.5 * median - 1.5 * mean` unless the histogram is
/// strongly skewed.
fn histogram_guess(stat: &TileStat) -> (f32, f32) {
    if stat.is_bad() {
        return (-BIG, -BIG);
    }
    if stat.nlevels <= 1 {
        return (stat.mean as f32, stat.sigma as f32);
    }

    let histo = &stat.histo;
    let nlevelsm1 = stat.nlevels - 1;
    let mut lcut = 0usize;
    let mut hcut = nlevelsm1;

    let mut sig = 10.0 * nlevelsm1 as f64;
    let mut sig1 = 1.0f64;
    let mut mea = stat.mean;
    let mut med = stat.mean;

    let mut iters = 100;
    while iters > 0 && sig >= 0.1 && (sig / sig1 - 1.0).abs() > GUESS_EPS {
        iters -= 1;
        sig1 = sig;
        let mut sum = 0u64;
        let mut mean_acc = 0.0f64;
        let mut sq_acc = 0.0f64;
        let mut lowsum = 0u64;
        let mut highsum = 0u64;
        let mut lo = lcut as isize;
        let mut hi = hcut as isize;

        for i in lcut..=hcut {
            if lowsum < highsum {
                lowsum += histo[lo as usize] as u64;
                lo += 1;
            } else {
                highsum += histo[hi as usize] as u64;
                hi -= 1;
            }
            let pix = histo[i] as f64;
            sum += histo[i] as u64;
            mean_acc += pix * i as f64;
            sq_acc += pix * i as f64 * i as f64;
        }

        med = if hi >= 0 {
            let lo_val = histo.get(lo as usize).copied().unwrap_or(0);
            let hi_val = histo[hi as usize];
            let denom = 2.0 * lo_val.max(hi_val) as f64;
            if denom > 0.0 {
                hi as f64 + 0.5 + (highsum as f64 - lowsum as f64) / denom
            } else {
                hi as f64 + 0.5
            }
        } else {
            0.0
        };

        if sum > 0 {
            mea = mean_acc / sum as f64;
            sig = sq_acc / sum as f64 - mea * mea;
        } else {
            mea = mean_acc;
            sig = sq_acc;
        }
        sig = if sig > 0.0 { sig.sqrt() } else { 0.0 };

        let lo_edge = med - 3.0 * sig;
        lcut = if lo_edge > 0.0 {
            (lo_edge + 0.5) as usize
        } else {
            0
        };
        let hi_edge = med + 3.0 * sig;
        hcut = if hi_edge < nlevelsm1 as f64 {
            if hi_edge > 0.0 {
                (hi_edge + 0.5) as usize
            } else {
                0
            }
        } else {
            nlevelsm1
        };
    }

    let mode = if sig.abs() > 0.0 {
        if ((mea - med) / sig).abs() < 0.3 {
            2.5 * med - 1.5 * mea
        } else {
            med
        }
    } else {
        mea
    };

    (
        (stat.qzero + mode * stat.qscale) as f32,
        (sig * stat.qscale) as f32,
    )
}

/// Repair bad tiles from their nearest valid neighbors, median filter both
/// grids, and derive the global level and RMS.
fn filter_grid(
    back: &mut [f32],
    sigma: &mut [f32],
    nx: usize,
    ny: usize,
    cfg: &BackgroundConfig,
) -> (f32, f32) {
    let np = nx * ny;
    let npx = cfg.fw / 2;
    let npy = cfg.fh / 2;

    // Bad-tile repair: average all nearest valid tiles (ties included).
    let mut repaired = back.to_vec();
    for py in 0..ny {
        for px in 0..nx {
            let i = py * nx + px;
            if back[i] > -BIG {
                continue;
            }
            let mut d2min = f64::MAX;
            let mut nmin = 0usize;
            let mut val = 0.0f64;
            let mut sval = 0.0f64;
            for y in 0..ny {
                for x in 0..nx {
                    let j = y * nx + x;
                    if back[j] <= -BIG {
                        continue;
                    }
                    let ddx = x as f64 - px as f64;
                    let ddy = y as f64 - py as f64;
                    let d2 = ddx * ddx + ddy * ddy;
                    if d2 < d2min {
                        d2min = d2;
                        val = back[j] as f64;
                        sval = sigma[j] as f64;
                        nmin = 1;
                    } else if d2 == d2min {
                        val += back[j] as f64;
                        sval += sigma[j] as f64;
                        nmin += 1;
                    }
                }
            }
            repaired[i] = if nmin > 0 { (val / nmin as f64) as f32 } else { 0.0 };
            sigma[i] = if nmin > 0 { (sval / nmin as f64) as f32 } else { 1.0 };
        }
    }
    back.copy_from_slice(&repaired);

    // Median filter, window shrunk symmetrically at the grid edges.
    let mut back2 = vec![0.0f32; np];
    let mut sigma2 = vec![0.0f32; np];
    let mut bwin = Vec::with_capacity((2 * npx + 1) * (2 * npy + 1));
    let mut swin = Vec::with_capacity((2 * npx + 1) * (2 * npy + 1));
    for py in 0..ny {
        let npy2 = npy.min(py).min(ny - py - 1);
        for px in 0..nx {
            let npx2 = npx.min(px).min(nx - px - 1);
            bwin.clear();
            swin.clear();
            for dy in -(npy2 as isize)..=(npy2 as isize) {
                let y = (py as isize + dy) as usize;
                for dx in -(npx2 as isize)..=(npx2 as isize) {
                    let x = (px as isize + dx) as usize;
                    bwin.push(back[y * nx + x]);
                    swin.push(sigma[y * nx + x]);
                }
            }
            let i = py * nx + px;
            let med = median(&mut bwin);
            if (med - back[i]).abs() >= cfg.fthresh as f32 {
                back2[i] = med;
                sigma2[i] = median(&mut swin);
            } else {
                back2[i] = back[i];
                sigma2[i] = sigma[i];
            }
        }
    }
    back.copy_from_slice(&back2);
    sigma.copy_from_slice(&sigma2);

    let global = median(&mut back2);
    let mut global_rms = median(&mut sigma2);
    if global_rms <= 0.0 {
        // sigma2 is sorted after the median call; positives sit at the tail.
        let first_pos = sigma2.partition_point(|&v| v <= 0.0);
        global_rms = if first_pos < sigma2.len() {
            median(&mut sigma2[first_pos..])
        } else {
            1.0
        };
    }

    (global, global_rms)
}

/// Median of a slice; sorts in place. Even lengths average the middle pair.
fn median(values: &mut [f32]) -> f32 {
    if values.is_empty() {
        return 0.0;
    }
    values.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let n = values.len();
    if n % 2 == 1 {
        values[n / 2]
    } else {
        0.5 * (values[n / 2 - 1] + values[n / 2])
    }
}

/// Natural cubic spline second-derivative table along y, one spline per
/// tile column, scaled for the evaluation form used in `spline_line`.
fn make_spline(map: &[f32], nx: usize, ny: usize) -> Vec<f32> {
    let mut dmap = vec![0.0f32; nx * ny];
    if ny <= 1 {
        return dmap;
    }
    let mut u = vec![0.0f32; ny - 1];
    for x in 0..nx {
        dmap[x] = 0.0;
        u[0] = 0.0;
        for y in 1..ny - 1 {
            let temp = -1.0 / (dmap[(y - 1) * nx + x] + 4.0);
            dmap[y * nx + x] = temp;
            u[y] = temp
                * (u[y - 1]
                    - 6.0
                        * (map[(y + 1) * nx + x] + map[(y - 1) * nx + x]
                            - 2.0 * map[y * nx + x]));
        }
        dmap[(ny - 1) * nx + x] = 0.0;
        for y in (1..ny - 1).rev() {
            let above = dmap[(y + 1) * nx + x];
            dmap[y * nx + x] = (dmap[y * nx + x] * above + u[y]) / 6.0;
        }
    }
    dmap
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::convert::InputArray;
    use approx::assert_relative_eq;
    use ndarray::Array2;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn image_of(data: &Array2<f32>) -> Image<'_> {
        Image::new(InputArray::Float(data.view()))
    }

    #[test]
    fn constant_frame_recovers_level_exactly() {
        let data = Array2::from_elem((128, 128), 10.0f32);
        let bkg = Background::new(&image_of(&data), &BackgroundConfig::default())
            .expect("background fit");
        assert_relative_eq!(bkg.global(), 10.0, epsilon = 1e-4);
        // All tile sigmas are zero, so the RMS falls back to unity.
        assert_relative_eq!(bkg.global_rms(), 1.0);
        assert_relative_eq!(bkg.pix(50, 70), 10.0, epsilon = 1e-4);
        let mut line = vec![0.0f32; 128];
        bkg.line_into(64, &mut line);
        for &v in &line {
            assert_relative_eq!(v, 10.0, epsilon = 1e-4);
        }
    }

    #[test]
    fn noisy_frame_recovers_level_and_rms() {
        let mut rng = StdRng::seed_from_u64(7);
        let data = Array2::from_shape_fn((256, 256), |_| {
            // Sum of 12 uniforms: approximately normal, sigma ~1.
            let s: f32 = (0..12).map(|_| rng.gen::<f32>()).sum();
            100.0 + (s - 6.0) * 2.0
        });
        let bkg = Background::new(&image_of(&data), &BackgroundConfig::default())
            .expect("background fit");
        assert_relative_eq!(bkg.global(), 100.0, epsilon = 0.5);
        assert_relative_eq!(bkg.global_rms(), 2.0, epsilon = 0.5);
    }

    #[test]
    fn masked_tile_inherits_neighbor_values() {
        let data = Array2::from_elem((128, 128), 50.0f32);
        let mut mask = Array2::<f32>::zeros((128, 128));
        // Blank out the top-left 64x64 tile entirely.
        for y in 0..64 {
            for x in 0..64 {
                mask[[y, x]] = 1.0;
            }
        }
        let mut img = image_of(&data);
        img.mask = Some(InputArray::Float(mask.view()));
        img.mask_thresh = 0.5;
        let bkg = Background::new(&img, &BackgroundConfig::default()).expect("background fit");
        assert_relative_eq!(bkg.pix(10, 10), 50.0, epsilon = 1e-3);
        assert_relative_eq!(bkg.global(), 50.0, epsilon = 1e-3);
    }

    #[test]
    fn gradient_frame_is_tracked_smoothly() {
        let data = Array2::from_shape_fn((256, 256), |(y, _)| y as f32 * 0.1);
        let cfg = BackgroundConfig {
            bw: 32,
            bh: 32,
            ..Default::default()
        };
        let bkg = Background::new(&image_of(&data), &cfg).expect("background fit");
        let mut line = vec![0.0f32; 256];
        bkg.line_into(128, &mut line);
        for &v in &line {
            assert_relative_eq!(v, 12.8, epsilon = 0.3);
        }
    }

    #[test]
    fn subtract_from_zeroes_a_constant_frame() {
        let base = Array2::from_elem((96, 96), 25.0f32);
        let bkg = Background::new(&image_of(&base), &BackgroundConfig::default())
            .expect("background fit");
        let mut work = base.clone();
        let mut out = OutputArray::Float(work.view_mut());
        bkg.subtract_from(&mut out).expect("subtract");
        drop(out);
        for &v in work.iter() {
            assert!(v.abs() < 1e-3, "residual {v} too large");
        }
    }

    #[test]
    fn rejects_zero_tile_size() {
        let data = Array2::<f32>::zeros((8, 8));
        let cfg = BackgroundConfig {
            bw: 0,
            ..Default::default()
        };
        assert!(matches!(
            Background::new(&image_of(&data), &cfg),
            Err(SepError::InvalidConfig(_))
        ));
    }
}

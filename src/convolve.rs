//! Detection-filter kernels: plain convolution and noise-weighted matching.
//!
//! Both filters run row by row over the sliding window kept by the
//! extraction driver. The kernel footprint is clipped at the image edges;
//! pixels outside the frame simply contribute nothing.

use serde::{Deserialize, Serialize};

use crate::error::SepError;

/// A small detection filter kernel, normalized at construction so that the
/// absolute values of its coefficients sum to one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Kernel {
    w: usize,
    h: usize,
    data: Vec<f32>,
}

impl Kernel {
    /// Build a kernel from row-major coefficients.
    pub fn new(w: usize, h: usize, values: &[f32]) -> Result<Kernel, SepError> {
        if w == 0 || h == 0 || values.len() != w * h {
            return Err(SepError::InvalidConfig(format!(
                "kernel shape {w}x{h} does not match {} coefficients",
                values.len()
            )));
        }
        let norm: f32 = values.iter().map(|v| v.abs()).sum();
        if norm <= 0.0 {
            return Err(SepError::InvalidConfig("kernel sums to zero".into()));
        }
        Ok(Kernel {
            w,
            h,
            data: values.iter().map(|v| v / norm).collect(),
        })
    }

    /// The standard 3x3 pyramidal smoothing kernel.
    pub fn default_3x3() -> Kernel {
        Kernel {
            w: 3,
            h: 3,
            data: [1.0f32, 2.0, 1.0, 2.0, 4.0, 2.0, 1.0, 2.0, 1.0]
                .iter()
                .map(|v| v / 16.0)
                .collect(),
        }
    }

    /// Kernel height in rows.
    pub fn height(&self) -> usize {
        self.h
    }

    /// Convolve (correlate) one output row.
    ///
    /// `rows` holds the image rows `y0..y0 + rows.len()`; rows of the kernel
    /// footprint falling outside that span or outside `0..image_h` are
    /// skipped, as are columns outside the row width.
    pub fn convolve_line(
        &self,
        rows: &[&[f32]],
        y0: usize,
        y: usize,
        image_h: usize,
        out: &mut [f32],
    ) {
        let w = out.len();
        out.fill(0.0);
        let ky0 = y as isize - (self.h / 2) as isize;
        for j in 0..self.h {
            let yy = ky0 + j as isize;
            if yy < 0 || yy >= image_h as isize {
                continue;
            }
            let idx = yy - y0 as isize;
            if idx < 0 || idx as usize >= rows.len() {
                continue;
            }
            let src = rows[idx as usize];
            let krow = &self.data[j * self.w..(j + 1) * self.w];
            for x in 0..w {
                let kx0 = x as isize - (self.w / 2) as isize;
                let mut acc = 0.0f32;
                for (i, &k) in krow.iter().enumerate() {
                    let xx = kx0 + i as isize;
                    if xx >= 0 && (xx as usize) < w {
                        acc += k * src[xx as usize];
                    }
                }
                out[x] += acc;
            }
        }
    }

    /// Noise-weighted matched filter for one output row.
    ///
    /// Accumulates `k*v/var` and `k^2/var` over the clipped footprint,
    /// skipping pixels with non-positive variance, and emits
    /// `num / sqrt(den)` so the output is directly in sigma units. Pixels
    /// with no usable neighborhood get zero significance.
    #[allow(clippy::too_many_arguments)]
    pub fn matched_filter_line(
        &self,
        rows: &[&[f32]],
        var_rows: &[&[f32]],
        y0: usize,
        y: usize,
        image_h: usize,
        out: &mut [f32],
    ) {
        let w = out.len();
        let mut num = vec![0.0f64; w];
        let mut den = vec![0.0f64; w];
        let ky0 = y as isize - (self.h / 2) as isize;
        for j in 0..self.h {
            let yy = ky0 + j as isize;
            if yy < 0 || yy >= image_h as isize {
                continue;
            }
            let idx = yy - y0 as isize;
            if idx < 0 || idx as usize >= rows.len() {
                continue;
            }
            let src = rows[idx as usize];
            let var = var_rows[idx as usize];
            let krow = &self.data[j * self.w..(j + 1) * self.w];
            for x in 0..w {
                let kx0 = x as isize - (self.w / 2) as isize;
                for (i, &k) in krow.iter().enumerate() {
                    let xx = kx0 + i as isize;
                    if xx < 0 || (xx as usize) >= w {
                        continue;
                    }
                    let v = var[xx as usize] as f64;
                    if v <= 0.0 {
                        continue;
                    }
                    num[x] += k as f64 * src[xx as usize] as f64 / v;
                    den[x] += (k as f64) * (k as f64) / v;
                }
            }
        }
        for x in 0..w {
            out[x] = if den[x] > 0.0 {
                (num[x] / den[x].sqrt()) as f32
            } else {
                0.0
            };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn kernel_is_normalized_by_absolute_sum() {
        let k = Kernel::new(3, 1, &[1.0, -2.0, 1.0]).unwrap();
        let total: f32 = k.data.iter().map(|v| v.abs()).sum();
        assert_relative_eq!(total, 1.0);
    }

    #[test]
    fn convolving_a_constant_row_preserves_it_away_from_edges() {
        let k = Kernel::default_3x3();
        let row = [2.0f32; 8];
        let rows: Vec<&[f32]> = vec![&row, &row, &row];
        let mut out = [0.0f32; 8];
        k.convolve_line(&rows, 0, 1, 3, &mut out);
        // Interior pixels see the full kernel, edges a clipped one.
        for &v in &out[1..7] {
            assert_relative_eq!(v, 2.0, epsilon = 1e-6);
        }
        assert!(out[0] < 2.0);
        assert!(out[7] < 2.0);
    }

    #[test]
    fn footprint_clips_at_top_edge() {
        let k = Kernel::default_3x3();
        let r0 = [1.0f32; 4];
        let r1 = [1.0f32; 4];
        let rows: Vec<&[f32]> = vec![&r0, &r1];
        let mut out = [0.0f32; 4];
        k.convolve_line(&rows, 0, 0, 2, &mut out);
        // Row above the frame is missing: interior columns sum 12/16.
        assert_relative_eq!(out[1], 0.75, epsilon = 1e-6);
    }

    #[test]
    fn matched_filter_matches_convolution_in_uniform_noise() {
        let k = Kernel::default_3x3();
        let data = [
            [0.0f32, 1.0, 2.0, 1.0, 0.0],
            [0.0, 2.0, 4.0, 2.0, 0.0],
            [0.0, 1.0, 2.0, 1.0, 0.0],
        ];
        let var = [4.0f32; 5];
        let rows: Vec<&[f32]> = data.iter().map(|r| r.as_slice()).collect();
        let var_rows: Vec<&[f32]> = vec![&var, &var, &var];

        let mut conv = [0.0f32; 5];
        k.convolve_line(&rows, 0, 1, 3, &mut conv);
        let mut mf = [0.0f32; 5];
        k.matched_filter_line(&rows, &var_rows, 0, 1, 3, &mut mf);

        // With constant variance the matched filter is the convolution
        // rescaled into sigma units: conv / (sigma * sqrt(sum k^2)).
        let ksq: f32 = k.data.iter().map(|v| v * v).sum();
        for x in 1..4 {
            assert_relative_eq!(mf[x], conv[x] / (2.0 * ksq.sqrt()), epsilon = 1e-5);
        }
    }

    #[test]
    fn zero_variance_pixels_are_skipped() {
        let k = Kernel::new(1, 1, &[1.0]).unwrap();
        let row = [3.0f32];
        let var = [0.0f32];
        let rows: Vec<&[f32]> = vec![&row];
        let var_rows: Vec<&[f32]> = vec![&var];
        let mut out = [9.0f32];
        k.matched_filter_line(&rows, &var_rows, 0, 0, 1, &mut out);
        assert_eq!(out[0], 0.0);
    }
}

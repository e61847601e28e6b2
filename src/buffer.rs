//! Sliding row window over an input array.
//!
//! Detection streams the image top to bottom and only ever needs as many
//! rows in memory as the convolution kernel is tall. The buffer converts
//! rows to the working pixel type on the way in and scrubs masked pixels:
//! data buffers get 0 there (the best guess for a background-subtracted
//! frame) and noise buffers get an effectively infinite value, so
//! thresholds and weights reject them.

use crate::convert::InputArray;
use crate::error::SepError;
use crate::image::Image;

/// Fixed-height window of converted rows.
pub struct RowBuffer {
    width: usize,
    bufh: usize,
    mask_fill: f32,
    rows: Vec<Vec<f32>>,
    /// Image row currently held in `rows[0]`.
    top: isize,
    filled: usize,
}

impl RowBuffer {
    /// Create a window of `bufh` rows (at least 1). `mask_fill` replaces
    /// masked pixels as rows are loaded.
    pub fn new(data: &InputArray<'_>, bufh: usize, mask_fill: f32) -> RowBuffer {
        let (width, _) = data.dim();
        let bufh = bufh.max(1);
        RowBuffer {
            width,
            bufh,
            mask_fill,
            rows: (0..bufh).map(|_| vec![0.0f32; width]).collect(),
            top: 0,
            filled: 0,
        }
    }

    /// Shift the window down one row, converting row `y` of `data` into
    /// the bottom slot. Rows must be fed strictly in order.
    pub fn advance(&mut self, data: &InputArray<'_>, image: &Image<'_>, y: usize) {
        if self.filled == self.bufh {
            self.rows.rotate_left(1);
            self.top += 1;
        }
        let slot = if self.filled < self.bufh {
            let s = self.filled;
            self.filled += 1;
            s
        } else {
            self.bufh - 1
        };
        data.read_row(y, &mut self.rows[slot]);
        if image.mask.is_some() {
            for x in 0..self.width {
                if image.is_masked(x, y) {
                    self.rows[slot][x] = self.mask_fill;
                }
            }
        }
        if self.filled == 1 {
            self.top = y as isize;
        }
    }

    /// Borrow the converted row `y`, which must be inside the window.
    pub fn row(&self, y: usize) -> Result<&[f32], SepError> {
        let idx = y as isize - self.top;
        if self.filled == 0 || idx < 0 || idx as usize >= self.filled {
            return Err(SepError::LineNotBuffered { y });
        }
        Ok(&self.rows[idx as usize])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;

    #[test]
    fn window_slides_and_drops_old_rows() {
        let data = Array2::from_shape_fn((6, 4), |(y, _)| y as f32);
        let img = Image::new(InputArray::Float(data.view()));
        let mut buf = RowBuffer::new(&img.data, 3, 0.0);
        for y in 0..4 {
            buf.advance(&img.data, &img, y);
        }
        assert!(buf.row(0).is_err());
        assert_eq!(buf.row(1).map(|r| r[0]), Ok(1.0));
        assert_eq!(buf.row(3).map(|r| r[0]), Ok(3.0));
        assert!(buf.row(4).is_err());
    }

    #[test]
    fn masked_pixels_take_the_fill_value() {
        let data = Array2::from_elem((2, 3), 5.0f32);
        let mask = ndarray::array![[0.0f32, 1.0, 0.0], [0.0, 0.0, 0.0]];
        let mut img = Image::new(InputArray::Float(data.view()));
        img.mask = Some(InputArray::Float(mask.view()));
        img.mask_thresh = 0.5;
        let mut buf = RowBuffer::new(&img.data, 1, -1.0);
        buf.advance(&img.data, &img, 0);
        let row = buf.row(0).unwrap();
        assert_eq!(row, &[5.0, -1.0, 5.0]);
    }
}

//! Pixel element-type adapters.
//!
//! The engine works internally in `f32` regardless of the element type of the
//! caller's arrays. Input arrays are materialized one row at a time into a
//! working `f32` buffer; output operations (background rendering and
//! subtraction) write back in the destination's own element type. Supporting
//! a new element type means adding a variant here, so an unsupported type is
//! unrepresentable rather than a runtime error.

use ndarray::{ArrayView2, ArrayViewMut2};
use num_traits::cast::AsPrimitive;

/// Read-only 2D input array over one of the supported element types.
///
/// Dimensions follow ndarray matrix convention: `[y, x]` with shape
/// `(height, width)`.
#[derive(Debug, Clone, Copy)]
pub enum InputArray<'a> {
    /// 8-bit unsigned integer pixels.
    Byte(ArrayView2<'a, u8>),
    /// 32-bit signed integer pixels.
    Int(ArrayView2<'a, i32>),
    /// 32-bit floating point pixels.
    Float(ArrayView2<'a, f32>),
    /// 64-bit floating point pixels.
    Double(ArrayView2<'a, f64>),
}

impl<'a> InputArray<'a> {
    /// Array shape as `(width, height)`.
    pub fn dim(&self) -> (usize, usize) {
        let (h, w) = match self {
            InputArray::Byte(a) => a.dim(),
            InputArray::Int(a) => a.dim(),
            InputArray::Float(a) => a.dim(),
            InputArray::Double(a) => a.dim(),
        };
        (w, h)
    }

    /// Convert row `y` into the working buffer.
    ///
    /// `out` must have exactly the image width. Row indices outside the image
    /// are a programming error and panic in debug builds via ndarray's own
    /// bounds checks.
    pub fn read_row(&self, y: usize, out: &mut [f32]) {
        match self {
            InputArray::Byte(a) => copy_row(a, y, out),
            InputArray::Int(a) => copy_row(a, y, out),
            InputArray::Float(a) => copy_row(a, y, out),
            InputArray::Double(a) => copy_row(a, y, out),
        }
    }

    /// Single pixel converted to `f32`.
    pub fn get(&self, x: usize, y: usize) -> f32 {
        match self {
            InputArray::Byte(a) => a[[y, x]] as f32,
            InputArray::Int(a) => a[[y, x]] as f32,
            InputArray::Float(a) => a[[y, x]],
            InputArray::Double(a) => a[[y, x]] as f32,
        }
    }
}

fn copy_row<T: Copy + AsPrimitive<f32>>(a: &ArrayView2<'_, T>, y: usize, out: &mut [f32]) {
    for (dst, src) in out.iter_mut().zip(a.row(y).iter()) {
        *dst = src.as_();
    }
}

/// Mutable 2D output array over one of the supported element types.
pub enum OutputArray<'a> {
    /// 8-bit unsigned integer pixels.
    Byte(ArrayViewMut2<'a, u8>),
    /// 32-bit signed integer pixels.
    Int(ArrayViewMut2<'a, i32>),
    /// 32-bit floating point pixels.
    Float(ArrayViewMut2<'a, f32>),
    /// 64-bit floating point pixels.
    Double(ArrayViewMut2<'a, f64>),
}

impl<'a> OutputArray<'a> {
    /// Array shape as `(width, height)`.
    pub fn dim(&self) -> (usize, usize) {
        let (h, w) = match self {
            OutputArray::Byte(a) => a.dim(),
            OutputArray::Int(a) => a.dim(),
            OutputArray::Float(a) => a.dim(),
            OutputArray::Double(a) => a.dim(),
        };
        (w, h)
    }

    /// Overwrite row `y` with `line`, converting to the element type.
    ///
    /// Integer destinations round to nearest and saturate at the type bounds.
    pub fn write_row(&mut self, y: usize, line: &[f32]) {
        match self {
            OutputArray::Byte(a) => {
                for (dst, &v) in a.row_mut(y).iter_mut().zip(line) {
                    *dst = clamp_round(v, u8::MIN as f32, u8::MAX as f32) as u8;
                }
            }
            OutputArray::Int(a) => {
                for (dst, &v) in a.row_mut(y).iter_mut().zip(line) {
                    *dst = clamp_round(v, i32::MIN as f32, i32::MAX as f32) as i32;
                }
            }
            OutputArray::Float(a) => {
                for (dst, &v) in a.row_mut(y).iter_mut().zip(line) {
                    *dst = v;
                }
            }
            OutputArray::Double(a) => {
                for (dst, &v) in a.row_mut(y).iter_mut().zip(line) {
                    *dst = v as f64;
                }
            }
        }
    }

    /// Subtract `line` from row `y` in place, converting through `f32`.
    pub fn subtract_row(&mut self, y: usize, line: &[f32]) {
        match self {
            OutputArray::Byte(a) => {
                for (dst, &v) in a.row_mut(y).iter_mut().zip(line) {
                    *dst = clamp_round(*dst as f32 - v, u8::MIN as f32, u8::MAX as f32) as u8;
                }
            }
            OutputArray::Int(a) => {
                for (dst, &v) in a.row_mut(y).iter_mut().zip(line) {
                    *dst = clamp_round(*dst as f32 - v, i32::MIN as f32, i32::MAX as f32) as i32;
                }
            }
            OutputArray::Float(a) => {
                for (dst, &v) in a.row_mut(y).iter_mut().zip(line) {
                    *dst -= v;
                }
            }
            OutputArray::Double(a) => {
                for (dst, &v) in a.row_mut(y).iter_mut().zip(line) {
                    *dst -= v as f64;
                }
            }
        }
    }
}

fn clamp_round(v: f32, lo: f32, hi: f32) -> f32 {
    v.round().max(lo).min(hi)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{array, Array2};

    #[test]
    fn read_row_converts_integer_pixels_exactly() {
        let data = array![[1u8, 2, 3], [4, 5, 6]];
        let input = InputArray::Byte(data.view());
        let mut row = [0.0f32; 3];
        input.read_row(1, &mut row);
        assert_eq!(row, [4.0, 5.0, 6.0]);
    }

    #[test]
    fn dim_reports_width_then_height() {
        let data = Array2::<f64>::zeros((3, 5));
        let input = InputArray::Double(data.view());
        assert_eq!(input.dim(), (5, 3));
    }

    #[test]
    fn write_row_saturates_byte_output() {
        let mut data = Array2::<u8>::zeros((1, 3));
        let mut out = OutputArray::Byte(data.view_mut());
        out.write_row(0, &[-5.0, 127.4, 300.0]);
        drop(out);
        assert_eq!(data[[0, 0]], 0);
        assert_eq!(data[[0, 1]], 127);
        assert_eq!(data[[0, 2]], 255);
    }

    #[test]
    fn subtract_row_operates_in_place() {
        let mut data = array![[10.0f32, 20.0, 30.0]];
        let mut out = OutputArray::Float(data.view_mut());
        out.subtract_row(0, &[1.0, 2.0, 3.0]);
        drop(out);
        assert_eq!(data[[0, 2]], 27.0);
    }

    #[test]
    fn integer_subtraction_rounds_to_nearest() {
        let mut data = array![[10i32, 10, 10]];
        let mut out = OutputArray::Int(data.view_mut());
        out.subtract_row(0, &[0.4, 0.6, -0.6]);
        drop(out);
        assert_eq!(data[[0, 0]], 10);
        assert_eq!(data[[0, 1]], 9);
        assert_eq!(data[[0, 2]], 11);
    }
}

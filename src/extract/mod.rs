//! Streaming source extraction.
//!
//! The image is scanned top to bottom, one row at a time, with the Lutz
//! single-pass connected-component algorithm tracking open segments across
//! rows. Only a kernel-height window of rows is ever resident; member
//! pixels live in a fixed-capacity arena of linked records so that segment
//! merges and releases are O(1). A detection that reaches completion is
//! measured, deblended and appended to the output list, and its records
//! return to the arena.

pub mod analyse;
pub mod clean;
pub mod deblend;
pub mod object;
pub mod pixlist;
pub mod submap;

use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::{debug, warn};

use crate::buffer::RowBuffer;
use crate::catalog::Catalog;
use crate::error::SepError;
use crate::image::{Image, Noise, NoiseKind, BIG};
use analyse::{analyse, analyse_mthresh, preanalyse};
use deblend::deblend;
use object::{flags, ExtractConfig, FilterKind, RawObject, ThreshKind};
use pixlist::{PixelArena, PixelRecord, NONE};

/// Segment start column not yet known.
const UNKNOWN: i32 = -1;

/// Scan state at a column, for the current row and the row above.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PixStatus {
    /// Prior-row object fully closed.
    Complete,
    /// Prior-row object still open further right.
    Incomplete,
    /// Not inside an object.
    NonObject,
    /// Inside an object on the current row.
    Object,
}

/// Per-segment bookkeeping while an object is open.
#[derive(Debug, Clone, Copy)]
struct SegInfo {
    pixnb: usize,
    flag: u32,
    firstpix: i32,
    lastpix: i32,
}

impl SegInfo {
    fn new() -> SegInfo {
        SegInfo {
            pixnb: 0,
            flag: 0,
            firstpix: NONE,
            lastpix: NONE,
        }
    }
}

/// Merge segment `src` into `dst`, splicing the pixel chains.
fn merge_info(arena: &mut PixelArena, dst: &mut SegInfo, src: &SegInfo) {
    dst.pixnb += src.pixnb;
    dst.flag |= src.flag;
    if dst.firstpix == NONE {
        dst.firstpix = src.firstpix;
        dst.lastpix = src.lastpix;
    } else if src.firstpix != NONE {
        arena.link(dst.lastpix, src.firstpix);
        dst.lastpix = src.lastpix;
    }
}

/// Detect, deblend, measure and optionally clean sources in `image`.
///
/// # Arguments
///
/// * `image` - data with its noise model, mask and gain.
/// * `cfg` - thresholds, filter, deblending and cleaning parameters.
///
/// # Returns
///
/// A column-oriented [`Catalog`] of the surviving objects, or an error if
/// the configuration is inconsistent or the pixel arena fills up.
pub fn extract(image: &Image<'_>, cfg: &ExtractConfig) -> Result<Catalog, SepError> {
    image.validate()?;
    if cfg.minarea < 1 {
        return Err(SepError::InvalidConfig("minarea must be at least 1".into()));
    }
    if cfg.deblend_nthresh < 1 {
        return Err(SepError::InvalidConfig(
            "deblend_nthresh must be at least 1".into(),
        ));
    }
    if !(0.0..=1.0).contains(&cfg.deblend_cont) {
        return Err(SepError::InvalidConfig(
            "deblend_cont must be in [0, 1]".into(),
        ));
    }

    let (w, h) = image.data.dim();

    // Noise layout: a scalar collapses to one sigma/variance pair up front,
    // an array is streamed alongside the data.
    let noise_arr = match image.noise {
        Noise::Array(_, arr) => Some(arr),
        _ => None,
    };
    let noise_kind = match image.noise {
        Noise::Scalar(kind, _) | Noise::Array(kind, _) => Some(kind),
        Noise::None => None,
    };
    let (scalar_sig, scalar_var) = match image.noise {
        Noise::Scalar(NoiseKind::Stddev, v) => (v, v * v),
        Noise::Scalar(NoiseKind::Variance, v) => (v.max(0.0).sqrt(), v),
        _ => (0.0, 0.0),
    };

    // A relative threshold against array noise varies per pixel; against a
    // scalar it collapses to an absolute value now.
    let relthresh = cfg.thresh;
    let isvarthresh;
    let mut thresh = cfg.thresh;
    match cfg.thresh_kind {
        ThreshKind::Relative => {
            if !image.noise.is_some() {
                return Err(SepError::RelativeThresholdWithoutNoise);
            }
            isvarthresh = noise_arr.is_some();
            if !isvarthresh {
                thresh = relthresh * scalar_sig;
            }
        }
        ThreshKind::Absolute => isvarthresh = false,
    }

    // The matched filter needs both a kernel and per-pixel noise; its
    // output is in sigma units so the threshold must be relative too.
    let kernel = cfg.kernel.as_ref();
    let mut filter_kind = cfg.filter_kind;
    if filter_kind == FilterKind::Matched {
        if kernel.is_none() || noise_arr.is_none() {
            filter_kind = FilterKind::Convolution;
        } else if cfg.thresh_kind != ThreshKind::Relative {
            return Err(SepError::InvalidConfig(
                "matched filtering requires a relative threshold".into(),
            ));
        }
    }

    let kh = kernel.map(|k| k.height()).unwrap_or(1);
    let r = kh / 2;

    let mut dbuf = RowBuffer::new(&image.data, kh, 0.0);
    let mut nbuf = noise_arr.map(|arr| (RowBuffer::new(&arr, kh, BIG), arr));
    let mut next_load = 0usize;

    // Lutz state, one slot per column plus a closing sentinel column.
    let stack = w + 1;
    let mut marker = vec![0u8; stack];
    let mut psstack = vec![PixStatus::Complete; stack + 1];
    let mut start = vec![UNKNOWN; stack];
    let mut end = vec![0i32; stack];
    let mut info = vec![SegInfo::new(); stack];
    let mut store = vec![SegInfo::new(); stack];
    let mut co = 0usize;
    let mut pstop = 0usize;

    let mut scan_row = vec![0.0f32; w];
    let mut cdscan = vec![0.0f32; stack];
    let mut sigscan = vec![0.0f32; stack];
    let mut sig_line = vec![scalar_sig as f32; w];
    let mut var_line = vec![scalar_var as f32; w];
    let mut var_scratch: Vec<Vec<f32>> = Vec::new();

    let mut arena = PixelArena::new(cfg.pixstack);
    let mut rng = StdRng::seed_from_u64(cfg.seed);
    let mut objects: Vec<RawObject> = Vec::new();

    for yl in 0..=h {
        if yl < h {
            // Pull rows in until the kernel footprint for this row is
            // resident.
            let need = (yl + r).min(h.saturating_sub(1));
            while next_load <= need {
                dbuf.advance(&image.data, image, next_load);
                if let Some((nb, arr)) = nbuf.as_mut() {
                    nb.advance(arr, image, next_load);
                }
                next_load += 1;
            }

            scan_row.copy_from_slice(dbuf.row(yl)?);
            if let Some((nb, _)) = nbuf.as_ref() {
                let nrow = nb.row(yl)?;
                for x in 0..w {
                    let v = nrow[x];
                    let (sig, var) = match noise_kind {
                        Some(NoiseKind::Variance) => (v.max(0.0).sqrt(), v),
                        _ => (v, v * v),
                    };
                    sig_line[x] = sig;
                    var_line[x] = var;
                }
            }

            match kernel {
                Some(k) => {
                    let y0 = yl.saturating_sub(r);
                    let y1 = (yl + r).min(h - 1);
                    let mut rows: Vec<&[f32]> = Vec::with_capacity(kh);
                    for yy in y0..=y1 {
                        rows.push(dbuf.row(yy)?);
                    }
                    k.convolve_line(&rows, y0, yl, h, &mut cdscan[..w]);
                    if filter_kind == FilterKind::Matched {
                        if let Some((nb, _)) = nbuf.as_ref() {
                            var_scratch.clear();
                            for yy in y0..=y1 {
                                let nrow = nb.row(yy)?;
                                let vars: Vec<f32> = match noise_kind {
                                    Some(NoiseKind::Variance) => nrow.to_vec(),
                                    _ => nrow.iter().map(|&v| v * v).collect(),
                                };
                                var_scratch.push(vars);
                            }
                            let var_refs: Vec<&[f32]> =
                                var_scratch.iter().map(|v| v.as_slice()).collect();
                            k.matched_filter_line(&rows, &var_refs, y0, yl, h, &mut sigscan[..w]);
                        }
                    }
                }
                None => cdscan[..w].copy_from_slice(&scan_row),
            }
            cdscan[w] = -BIG;
            sigscan[w] = -BIG;
        } else {
            // A sentinel row below the frame closes every open segment.
            cdscan.fill(-BIG);
            sigscan.fill(-BIG);
        }

        let mut cs = PixStatus::NonObject;
        let mut ps = PixStatus::Complete;
        let trunflag = if yl == 0 || yl + 1 >= h {
            flags::TRUNCATED
        } else {
            0
        };

        for xl in 0..=w {
            let cdnew = cdscan[xl];
            let newmarker = marker[xl];
            marker[xl] = 0;

            let (pixsig, pixvar) = if xl < w && yl < h {
                (sig_line[xl] as f64, var_line[xl] as f64)
            } else {
                (0.0, 0.0)
            };
            if isvarthresh {
                thresh = relthresh * pixsig;
            }

            let luflag = match filter_kind {
                FilterKind::Matched => xl < w && yl < h && sigscan[xl] as f64 > relthresh,
                FilterKind::Convolution => cdnew as f64 > thresh,
            };

            let mut cur = SegInfo::new();
            if luflag {
                cur.pixnb = 1;
                cur.flag = trunflag;
                if xl == 0 || xl + 1 == w {
                    cur.flag |= flags::TRUNCATED;
                }
                let idx = arena.alloc(PixelRecord {
                    x: xl as i32,
                    y: yl as i32,
                    value: scan_row.get(xl).copied().unwrap_or(0.0),
                    cdvalue: cdnew,
                    var: pixvar as f32,
                    thresh: thresh as f32,
                    next: NONE,
                })?;
                cur.firstpix = idx;
                cur.lastpix = idx;

                if cs != PixStatus::Object {
                    // Segment opens at this column.
                    cs = PixStatus::Object;
                    if ps == PixStatus::Object {
                        if start[co] == UNKNOWN {
                            marker[xl] = b'S';
                            start[co] = xl as i32;
                        } else {
                            marker[xl] = b's';
                        }
                    } else {
                        psstack[pstop] = ps;
                        pstop += 1;
                        marker[xl] = b'S';
                        co += 1;
                        start[co] = xl as i32;
                        ps = PixStatus::Complete;
                        info[co] = SegInfo::new();
                    }
                }
            }

            if newmarker != 0 {
                match newmarker {
                    b'S' => {
                        // Prior-row object starts here.
                        psstack[pstop] = ps;
                        pstop += 1;
                        if cs == PixStatus::NonObject {
                            psstack[pstop] = PixStatus::Complete;
                            pstop += 1;
                            co += 1;
                            info[co] = store[xl];
                            start[co] = UNKNOWN;
                        } else {
                            let stored = store[xl];
                            merge_info(&mut arena, &mut info[co], &stored);
                        }
                        ps = PixStatus::Object;
                    }
                    b's' => {
                        // Prior-row object continues; fold the two open
                        // branches together.
                        if cs == PixStatus::Object && ps == PixStatus::Complete {
                            pstop -= 1;
                            let xl2 = start[co];
                            let inner = info[co];
                            merge_info(&mut arena, &mut info[co - 1], &inner);
                            co -= 1;
                            if start[co] == UNKNOWN {
                                start[co] = xl2;
                            } else {
                                marker[xl2 as usize] = b's';
                            }
                        }
                        ps = PixStatus::Object;
                    }
                    b'f' => ps = PixStatus::Incomplete,
                    b'F' => {
                        pstop -= 1;
                        ps = psstack[pstop];
                        if cs == PixStatus::NonObject && ps == PixStatus::Complete {
                            if start[co] == UNKNOWN {
                                // Object is complete; measure it or release
                                // its pixels.
                                let seg = info[co];
                                if seg.pixnb >= cfg.minarea {
                                    finish_object(
                                        &arena, &seg, thresh, cfg, image.gain, &mut rng,
                                        &mut objects,
                                    )?;
                                }
                                arena.free_chain(seg.firstpix, seg.lastpix);
                            } else {
                                // Still open further left on this row.
                                marker[end[co] as usize] = b'F';
                                store[start[co] as usize] = info[co];
                            }
                            co -= 1;
                            pstop -= 1;
                            ps = psstack[pstop];
                        }
                    }
                    _ => {}
                }
            }

            if luflag {
                merge_info(&mut arena, &mut info[co], &cur);
            } else if cs == PixStatus::Object {
                // Segment closes at this column.
                cs = PixStatus::NonObject;
                if ps != PixStatus::Complete {
                    marker[xl] = b'f';
                    end[co] = xl as i32;
                } else {
                    pstop -= 1;
                    ps = psstack[pstop];
                    marker[xl] = b'F';
                    store[start[co] as usize] = info[co];
                    co -= 1;
                }
            }
        }
    }
    debug!(objects = objects.len(), "scan complete");

    let survives = if cfg.clean && !objects.is_empty() {
        for obj in objects.iter_mut() {
            analyse_mthresh(obj, cfg.minarea);
        }
        let keep = clean::clean(&objects, cfg.clean_param);
        let removed = keep.iter().filter(|&&k| !k).count();
        if removed > 0 {
            debug!(removed, "cleaning dropped objects");
        }
        keep
    } else {
        vec![true; objects.len()]
    };

    Ok(Catalog::from_objects(&objects, &survives, w))
}

/// Turn a completed pixel chain into measured objects.
///
/// The chain is copied out of the arena, measured, deblended, and each
/// component is fully analysed and appended to `objects`. A deblending
/// overflow keeps the undeblended detection with a flag rather than
/// failing the whole extraction.
fn finish_object(
    arena: &PixelArena,
    seg: &SegInfo,
    thresh: f64,
    cfg: &ExtractConfig,
    gain: f64,
    rng: &mut StdRng,
    objects: &mut Vec<RawObject>,
) -> Result<(), SepError> {
    let pixels = arena.collect_chain(seg.firstpix);
    // An object closing at the sentinel column sees a zero variable
    // threshold; fall back to the smallest per-pixel one it was found at.
    let thresh = if thresh > 0.0 {
        thresh
    } else {
        pixels
            .iter()
            .map(|p| p.thresh as f64)
            .fold(f64::INFINITY, f64::min)
            .max(0.0)
    };
    let mut obj = RawObject::from_pixels(pixels, thresh, seg.flag);
    preanalyse(&mut obj);

    let will_split = cfg.deblend_nthresh > 1 && obj.fdpeak > obj.thresh;
    let fallback = if will_split { Some(obj.clone()) } else { None };

    match deblend(obj, cfg.deblend_nthresh, cfg.deblend_cont, cfg.minarea, rng) {
        Ok(children) => {
            for mut child in children {
                analyse(&mut child, true, gain);
                objects.push(child);
            }
        }
        Err(SepError::DeblendOverflow { limit }) => {
            warn!(limit, "deblending overflowed, keeping merged detection");
            // fallback is always present here: an object that skips
            // deblending cannot overflow.
            if let Some(mut parent) = fallback {
                parent.flag |= flags::DEBLEND_OVERFLOW;
                analyse(&mut parent, true, gain);
                objects.push(parent);
            }
        }
        Err(e) => return Err(e),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::convert::InputArray;
    use ndarray::Array2;

    fn add_gaussian(img: &mut Array2<f32>, x0: f64, y0: f64, amp: f64, sigma: f64) {
        let (h, w) = img.dim();
        for y in 0..h {
            for x in 0..w {
                let dx = x as f64 - x0;
                let dy = y as f64 - y0;
                let v = amp * (-(dx * dx + dy * dy) / (2.0 * sigma * sigma)).exp();
                img[[y, x]] += v as f32;
            }
        }
    }

    fn default_image_cfg() -> ExtractConfig {
        ExtractConfig {
            thresh: 3.0,
            ..ExtractConfig::default()
        }
    }

    #[test]
    fn detects_single_gaussian() {
        let mut data = Array2::<f32>::zeros((64, 64));
        add_gaussian(&mut data, 30.0, 25.0, 100.0, 2.0);
        let img = Image {
            noise: Noise::Scalar(NoiseKind::Stddev, 1.0),
            ..Image::new(InputArray::Float(data.view()))
        };
        let cat = extract(&img, &default_image_cfg()).unwrap();
        assert_eq!(cat.len(), 1);
        assert!((cat.x[0] - 30.0).abs() < 0.1);
        assert!((cat.y[0] - 25.0).abs() < 0.1);
        assert!(cat.peak[0] > 90.0);
        assert_eq!(cat.flag[0], 0);
    }

    #[test]
    fn relative_threshold_without_noise_is_an_error() {
        let data = Array2::<f32>::zeros((8, 8));
        let img = Image::new(InputArray::Float(data.view()));
        let err = extract(&img, &ExtractConfig::default()).unwrap_err();
        assert!(matches!(err, SepError::RelativeThresholdWithoutNoise));
    }

    #[test]
    fn absolute_threshold_needs_no_noise() {
        let mut data = Array2::<f32>::zeros((32, 32));
        add_gaussian(&mut data, 16.0, 16.0, 50.0, 1.5);
        let img = Image::new(InputArray::Float(data.view()));
        let cfg = ExtractConfig {
            thresh: 5.0,
            thresh_kind: ThreshKind::Absolute,
            ..ExtractConfig::default()
        };
        let cat = extract(&img, &cfg).unwrap();
        assert_eq!(cat.len(), 1);
    }

    #[test]
    fn empty_frame_yields_empty_catalog() {
        let data = Array2::<f32>::zeros((16, 16));
        let img = Image {
            noise: Noise::Scalar(NoiseKind::Stddev, 1.0),
            ..Image::new(InputArray::Float(data.view()))
        };
        let cat = extract(&img, &default_image_cfg()).unwrap();
        assert!(cat.is_empty());
    }

    #[test]
    fn source_on_the_edge_is_flagged_truncated() {
        let mut data = Array2::<f32>::zeros((32, 32));
        add_gaussian(&mut data, 0.5, 15.0, 80.0, 2.0);
        let img = Image {
            noise: Noise::Scalar(NoiseKind::Stddev, 1.0),
            ..Image::new(InputArray::Float(data.view()))
        };
        let cat = extract(&img, &default_image_cfg()).unwrap();
        assert_eq!(cat.len(), 1);
        assert!(cat.flag[0] & flags::TRUNCATED != 0);
    }

    #[test]
    fn minarea_suppresses_small_detections() {
        let mut data = Array2::<f32>::zeros((16, 16));
        data[[8, 8]] = 100.0;
        let img = Image {
            noise: Noise::Scalar(NoiseKind::Stddev, 1.0),
            ..Image::new(InputArray::Float(data.view()))
        };
        let cfg = ExtractConfig {
            thresh: 3.0,
            kernel: None,
            minarea: 5,
            ..ExtractConfig::default()
        };
        let cat = extract(&img, &cfg).unwrap();
        assert!(cat.is_empty());
    }

    #[test]
    fn pixel_arena_overflow_is_reported() {
        let mut data = Array2::<f32>::zeros((32, 32));
        add_gaussian(&mut data, 16.0, 16.0, 100.0, 4.0);
        let img = Image {
            noise: Noise::Scalar(NoiseKind::Stddev, 1.0),
            ..Image::new(InputArray::Float(data.view()))
        };
        let cfg = ExtractConfig {
            thresh: 1.5,
            pixstack: 8,
            ..ExtractConfig::default()
        };
        let err = extract(&img, &cfg).unwrap_err();
        assert!(matches!(err, SepError::PixelStackFull { .. }));
    }

    #[test]
    fn masked_region_is_not_detected() {
        let mut data = Array2::<f32>::zeros((32, 32));
        add_gaussian(&mut data, 10.0, 10.0, 100.0, 2.0);
        add_gaussian(&mut data, 24.0, 24.0, 100.0, 2.0);
        let mut mask = Array2::<u8>::zeros((32, 32));
        for y in 16..32 {
            for x in 16..32 {
                mask[[y, x]] = 1;
            }
        }
        let img = Image {
            noise: Noise::Scalar(NoiseKind::Stddev, 1.0),
            mask: Some(InputArray::Byte(mask.view())),
            ..Image::new(InputArray::Float(data.view()))
        };
        let cat = extract(&img, &default_image_cfg()).unwrap();
        assert_eq!(cat.len(), 1);
        assert!((cat.x[0] - 10.0).abs() < 0.2);
    }

    #[test]
    fn blended_pair_is_split() {
        let mut data = Array2::<f32>::zeros((48, 48));
        add_gaussian(&mut data, 21.0, 24.0, 300.0, 2.0);
        add_gaussian(&mut data, 28.0, 24.0, 300.0, 2.0);
        let img = Image {
            noise: Noise::Scalar(NoiseKind::Stddev, 1.0),
            ..Image::new(InputArray::Float(data.view()))
        };
        let cfg = ExtractConfig {
            thresh: 3.0,
            clean: false,
            ..ExtractConfig::default()
        };
        let cat = extract(&img, &cfg).unwrap();
        assert_eq!(cat.len(), 2);
        for i in 0..2 {
            assert!(cat.flag[i] & flags::MERGED != 0);
        }
        let mut xs = vec![cat.x[0], cat.x[1]];
        xs.sort_by(|a, b| a.partial_cmp(b).unwrap());
        assert!((xs[0] - 21.0).abs() < 0.5);
        assert!((xs[1] - 28.0).abs() < 0.5);
    }

    #[test]
    fn extraction_is_deterministic() {
        let mut data = Array2::<f32>::zeros((48, 48));
        add_gaussian(&mut data, 18.0, 24.0, 120.0, 1.8);
        add_gaussian(&mut data, 29.0, 24.0, 40.0, 1.8);
        let img = Image {
            noise: Noise::Scalar(NoiseKind::Stddev, 1.0),
            ..Image::new(InputArray::Float(data.view()))
        };
        let cfg = default_image_cfg();
        let a = extract(&img, &cfg).unwrap();
        let b = extract(&img, &cfg).unwrap();
        assert_eq!(a.len(), b.len());
        assert_eq!(a.x, b.x);
        assert_eq!(a.flux, b.flux);
    }
}

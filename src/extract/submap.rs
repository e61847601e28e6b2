//! Re-extraction of sub-objects inside a parent detection.
//!
//! Deblending repeatedly re-segments the pixels of one parent object at a
//! sequence of rising thresholds. The parent's bounding box is small and
//! its pixels are fully materialized, so this uses two-pass connected
//! component labeling with union-find (8-connectivity) over an index map
//! of the parent pixels rather than the streaming scan used for the full
//! frame.

use crate::extract::analyse::preanalyse;
use crate::extract::object::RawObject;
use crate::extract::pixlist::{PixelRecord, NONE};

/// Index map of a parent object's pixels over its bounding box.
pub struct Submap {
    pub xmin: i32,
    pub ymin: i32,
    pub w: usize,
    pub h: usize,
    /// Linear map, `NONE` where the parent has no pixel.
    pub idx: Vec<i32>,
}

impl Submap {
    /// Build the index map for `parent`. Call after `preanalyse` so the
    /// bounding box is valid.
    pub fn new(parent: &RawObject) -> Submap {
        let w = (parent.xmax - parent.xmin + 1) as usize;
        let h = (parent.ymax - parent.ymin + 1) as usize;
        let mut idx = vec![NONE; w * h];
        for (i, p) in parent.pixels.iter().enumerate() {
            let lx = (p.x - parent.xmin) as usize;
            let ly = (p.y - parent.ymin) as usize;
            idx[ly * w + lx] = i as i32;
        }
        Submap {
            xmin: parent.xmin,
            ymin: parent.ymin,
            w,
            h,
            idx,
        }
    }
}

fn find_root(parents: &mut [usize], label: usize) -> usize {
    let mut current = label;
    while current != parents[current] {
        parents[current] = parents[parents[current]];
        current = parents[current];
    }
    current
}

fn union(parents: &mut [usize], a: usize, b: usize) {
    let ra = find_root(parents, a);
    let rb = find_root(parents, b);
    if ra != rb {
        parents[rb.max(ra)] = rb.min(ra);
    }
}

/// Extract the connected components of `parent_pixels` above `thresh`
/// (in detection-image units), restricted to the bounding box of `within`,
/// keeping components of at least `minarea` pixels.
///
/// Components are 8-connected, matching the full-frame scan. Each output
/// object gets copies of the qualifying pixel records and a completed
/// `preanalyse` pass; its threshold is set to `thresh`.
pub fn extract_at_threshold(
    parent_pixels: &[PixelRecord],
    map: &Submap,
    within: &RawObject,
    thresh: f64,
    minarea: usize,
) -> Vec<RawObject> {
    let x0 = (within.xmin - map.xmin).max(0) as usize;
    let x1 = ((within.xmax - map.xmin) as usize).min(map.w - 1);
    let y0 = (within.ymin - map.ymin).max(0) as usize;
    let y1 = ((within.ymax - map.ymin) as usize).min(map.h - 1);
    let rw = x1 - x0 + 1;
    let rh = y1 - y0 + 1;

    // First pass: provisional labels with union-find merging. Label 0 is
    // background; the label grid is local to the scan rectangle.
    let mut labels = vec![0usize; rw * rh];
    let mut parents: Vec<usize> = vec![0];

    let lit = |lx: usize, ly: usize| -> bool {
        let i = map.idx[(y0 + ly) * map.w + (x0 + lx)];
        i != NONE && parent_pixels[i as usize].cdvalue as f64 > thresh
    };

    for ly in 0..rh {
        for lx in 0..rw {
            if !lit(lx, ly) {
                continue;
            }
            // 8-connected neighbors already visited in raster order.
            let mut neighbor = 0usize;
            let mut consider = |l: usize, parents: &mut Vec<usize>| {
                if l != 0 {
                    if neighbor == 0 {
                        neighbor = l;
                    } else if l != neighbor {
                        union(parents, neighbor, l);
                    }
                }
            };
            if lx > 0 {
                consider(labels[ly * rw + lx - 1], &mut parents);
            }
            if ly > 0 {
                consider(labels[(ly - 1) * rw + lx], &mut parents);
                if lx > 0 {
                    consider(labels[(ly - 1) * rw + lx - 1], &mut parents);
                }
                if lx + 1 < rw {
                    consider(labels[(ly - 1) * rw + lx + 1], &mut parents);
                }
            }
            labels[ly * rw + lx] = if neighbor != 0 {
                neighbor
            } else {
                parents.push(parents.len());
                parents.len() - 1
            };
        }
    }

    // Second pass: gather pixels per root label.
    let mut groups: Vec<Vec<PixelRecord>> = Vec::new();
    let mut root_to_group = vec![usize::MAX; parents.len()];
    for ly in 0..rh {
        for lx in 0..rw {
            let l = labels[ly * rw + lx];
            if l == 0 {
                continue;
            }
            let root = find_root(&mut parents, l);
            if root_to_group[root] == usize::MAX {
                root_to_group[root] = groups.len();
                groups.push(Vec::new());
            }
            let pi = map.idx[(y0 + ly) * map.w + (x0 + lx)] as usize;
            groups[root_to_group[root]].push(parent_pixels[pi]);
        }
    }

    groups
        .into_iter()
        .filter(|g| g.len() >= minarea)
        .map(|pixels| {
            let mut obj = RawObject::from_pixels(pixels, thresh, 0);
            preanalyse(&mut obj);
            obj
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pix(x: i32, y: i32, v: f32) -> PixelRecord {
        PixelRecord {
            x,
            y,
            value: v,
            cdvalue: v,
            var: 0.0,
            thresh: 1.0,
            next: NONE,
        }
    }

    fn parent_of(pixels: Vec<PixelRecord>) -> RawObject {
        let mut obj = RawObject::from_pixels(pixels, 1.0, 0);
        preanalyse(&mut obj);
        obj
    }

    #[test]
    fn rising_threshold_splits_two_peaks() {
        // Two bright clumps joined by a faint bridge.
        let mut pixels = Vec::new();
        for x in 0..3 {
            for y in 0..2 {
                pixels.push(pix(x, y, 10.0));
                pixels.push(pix(x + 6, y, 10.0));
            }
        }
        for x in 3..6 {
            pixels.push(pix(x, 0, 2.0));
        }
        let parent = parent_of(pixels);
        let map = Submap::new(&parent);

        let low = extract_at_threshold(&parent.pixels, &map, &parent, 1.0, 1);
        assert_eq!(low.len(), 1, "bridge connects everything at low threshold");

        let high = extract_at_threshold(&parent.pixels, &map, &parent, 5.0, 1);
        assert_eq!(high.len(), 2, "bridge drops out above its brightness");
        assert_eq!(high[0].fdnpix, 6);
        assert_eq!(high[1].fdnpix, 6);
    }

    #[test]
    fn diagonal_pixels_are_connected() {
        let parent = parent_of(vec![pix(0, 0, 5.0), pix(1, 1, 5.0), pix(2, 2, 5.0)]);
        let map = Submap::new(&parent);
        let objs = extract_at_threshold(&parent.pixels, &map, &parent, 1.0, 1);
        assert_eq!(objs.len(), 1);
        assert_eq!(objs[0].fdnpix, 3);
    }

    #[test]
    fn minarea_filters_small_fragments() {
        let parent = parent_of(vec![pix(0, 0, 5.0), pix(5, 5, 5.0)]);
        let map = Submap::new(&parent);
        let objs = extract_at_threshold(&parent.pixels, &map, &parent, 1.0, 2);
        assert!(objs.is_empty());
    }
}

//! Column-oriented output catalog.

use serde::{Deserialize, Serialize};

use crate::extract::object::RawObject;

/// Extraction results, one entry per object across all columns.
///
/// Positions are in pixel coordinates with the origin at the center of the
/// first pixel; `theta` is in radians, counterclockwise from +x.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Catalog {
    /// Detection threshold that applied to the object.
    pub thresh: Vec<f64>,
    /// Member pixel count.
    pub npix: Vec<usize>,
    /// Member pixels above the analysis threshold.
    pub tnpix: Vec<usize>,
    /// Bounding box, inclusive.
    pub xmin: Vec<i32>,
    /// Bounding box, inclusive.
    pub xmax: Vec<i32>,
    /// Bounding box, inclusive.
    pub ymin: Vec<i32>,
    /// Bounding box, inclusive.
    pub ymax: Vec<i32>,
    /// Barycenter.
    pub x: Vec<f64>,
    /// Barycenter.
    pub y: Vec<f64>,
    /// Central second moment.
    pub x2: Vec<f64>,
    /// Central second moment.
    pub y2: Vec<f64>,
    /// Central second moment.
    pub xy: Vec<f64>,
    /// Barycenter variance.
    pub errx2: Vec<f64>,
    /// Barycenter variance.
    pub erry2: Vec<f64>,
    /// Barycenter covariance.
    pub errxy: Vec<f64>,
    /// Ellipse semi-major axis.
    pub a: Vec<f32>,
    /// Ellipse semi-minor axis.
    pub b: Vec<f32>,
    /// Ellipse position angle.
    pub theta: Vec<f32>,
    /// Quadratic-form coefficient.
    pub cxx: Vec<f32>,
    /// Quadratic-form coefficient.
    pub cyy: Vec<f32>,
    /// Quadratic-form coefficient.
    pub cxy: Vec<f32>,
    /// Total flux in the filtered detection image.
    pub cflux: Vec<f64>,
    /// Total flux in the measurement image.
    pub flux: Vec<f64>,
    /// Peak value in the filtered detection image.
    pub cpeak: Vec<f64>,
    /// Peak value in the measurement image.
    pub peak: Vec<f64>,
    /// Detection-image peak position.
    pub xcpeak: Vec<i32>,
    /// Detection-image peak position.
    pub ycpeak: Vec<i32>,
    /// Measurement-image peak position.
    pub xpeak: Vec<i32>,
    /// Measurement-image peak position.
    pub ypeak: Vec<i32>,
    /// Flag bits.
    pub flag: Vec<u32>,
    /// Linear pixel indices (`x + w*y`) of each object's members.
    pub pixels: Vec<Vec<usize>>,
}

impl Catalog {
    /// Number of objects.
    pub fn len(&self) -> usize {
        self.x.len()
    }

    /// Whether the catalog is empty.
    pub fn is_empty(&self) -> bool {
        self.x.is_empty()
    }

    /// Flatten the surviving objects into columns.
    pub(crate) fn from_objects(objects: &[RawObject], survives: &[bool], w: usize) -> Catalog {
        let mut cat = Catalog::default();
        for (obj, &keep) in objects.iter().zip(survives) {
            if !keep {
                continue;
            }
            cat.thresh.push(obj.thresh);
            cat.npix.push(obj.fdnpix);
            cat.tnpix.push(obj.dnpix);
            cat.xmin.push(obj.xmin);
            cat.xmax.push(obj.xmax);
            cat.ymin.push(obj.ymin);
            cat.ymax.push(obj.ymax);
            cat.x.push(obj.mx);
            cat.y.push(obj.my);
            cat.x2.push(obj.mx2);
            cat.y2.push(obj.my2);
            cat.xy.push(obj.mxy);
            cat.errx2.push(obj.errx2);
            cat.erry2.push(obj.erry2);
            cat.errxy.push(obj.errxy);
            cat.a.push(obj.a);
            cat.b.push(obj.b);
            cat.theta.push(obj.theta);
            cat.cxx.push(obj.cxx);
            cat.cyy.push(obj.cyy);
            cat.cxy.push(obj.cxy);
            cat.cflux.push(obj.fdflux);
            cat.flux.push(obj.dflux);
            cat.cpeak.push(obj.fdpeak);
            cat.peak.push(obj.dpeak);
            cat.xcpeak.push(obj.xcpeak);
            cat.ycpeak.push(obj.ycpeak);
            cat.xpeak.push(obj.xpeak);
            cat.ypeak.push(obj.ypeak);
            cat.flag.push(obj.flag);
            cat.pixels.push(
                obj.pixels
                    .iter()
                    .map(|p| p.x as usize + w * p.y as usize)
                    .collect(),
            );
        }
        cat
    }
}

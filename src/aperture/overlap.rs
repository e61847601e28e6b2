//! Exact area of overlap between pixels and circles or ellipses.
//!
//! Circle-pixel overlap decomposes the pixel against the circle into
//! rectangle, triangle and circular-segment pieces. Ellipse-pixel overlap
//! reprojects the pixel into a frame where the ellipse is the unit circle
//! and clips the resulting quadrilateral's triangles against it.

use std::f64::consts::PI;

/// Sentinel coordinate meaning "no intersection"; real unit-circle
/// intersections always lie within [-1, 1].
const MISS: Point = Point { x: 2.0, y: 2.0 };

#[derive(Debug, Clone, Copy)]
struct Point {
    x: f64,
    y: f64,
}

/// Area of the circular segment cut off by the chord from `(x1, y1)` to
/// `(x2, y2)` on a circle of radius `r`.
fn area_arc(x1: f64, y1: f64, x2: f64, y2: f64, r: f64) -> f64 {
    let a = ((x2 - x1) * (x2 - x1) + (y2 - y1) * (y2 - y1)).sqrt();
    let theta = 2.0 * (0.5 * a / r).asin();
    0.5 * r * r * (theta - theta.sin())
}

/// Area of the triangle with the given vertices.
fn area_triangle(x1: f64, y1: f64, x2: f64, y2: f64, x3: f64, y3: f64) -> f64 {
    0.5 * (x1 * (y2 - y3) + x2 * (y3 - y1) + x3 * (y1 - y2)).abs()
}

/// Overlap of an axis-aligned rectangle in the first quadrant
/// (`0 <= xmin <= xmax`, `0 <= ymin <= ymax`) with a circle of radius `r`
/// centered on the origin.
fn circoverlap_core(xmin: f64, ymin: f64, xmax: f64, ymax: f64, r: f64) -> f64 {
    let xmin2 = xmin * xmin;
    let ymin2 = ymin * ymin;
    let r2 = r * r;
    if xmin2 + ymin2 > r2 {
        return 0.0;
    }

    let xmax2 = xmax * xmax;
    let ymax2 = ymax * ymax;
    if xmax2 + ymax2 < r2 {
        return (xmax - xmin) * (ymax - ymin);
    }

    // Squared distances of the other two corners.
    let a = xmax2 + ymin2;
    let b = xmin2 + ymax2;

    if a < r2 && b < r2 {
        let x1 = (r2 - ymax2).sqrt();
        let y1 = ymax;
        let x2 = xmax;
        let y2 = (r2 - xmax2).sqrt();
        return (xmax - xmin) * (ymax - ymin) - area_triangle(x1, y1, x2, y2, xmax, ymax)
            + area_arc(x1, y1, x2, y2, r);
    }

    if a < r2 {
        let x1 = xmin;
        let y1 = (r2 - xmin2).sqrt();
        let x2 = xmax;
        let y2 = (r2 - xmax2).sqrt();
        return area_arc(x1, y1, x2, y2, r)
            + area_triangle(x1, y1, x1, ymin, xmax, ymin)
            + area_triangle(x1, y1, x2, ymin, x2, y2);
    }

    if b < r2 {
        let x1 = (r2 - ymin2).sqrt();
        let y1 = ymin;
        let x2 = (r2 - ymax2).sqrt();
        let y2 = ymax;
        return area_arc(x1, y1, x2, y2, r)
            + area_triangle(x1, y1, xmin, y1, xmin, ymax)
            + area_triangle(x1, y1, xmin, y2, x2, y2);
    }

    let x1 = (r2 - ymin2).sqrt();
    let y1 = ymin;
    let x2 = xmin;
    let y2 = (r2 - xmin2).sqrt();
    area_arc(x1, y1, x2, y2, r) + area_triangle(x1, y1, x2, y2, xmin, ymin)
}

/// Overlap of an axis-aligned rectangle with a circle of radius `r`
/// centered on the origin. Splits the rectangle at the axes and folds each
/// piece into the first quadrant.
pub fn circoverlap(xmin: f64, ymin: f64, xmax: f64, ymax: f64, r: f64) -> f64 {
    if r <= 0.0 {
        return 0.0;
    }

    if 0.0 <= xmin {
        if 0.0 <= ymin {
            circoverlap_core(xmin, ymin, xmax, ymax, r)
        } else if 0.0 >= ymax {
            circoverlap_core(-ymax, xmin, -ymin, xmax, r)
        } else {
            circoverlap(xmin, ymin, xmax, 0.0, r) + circoverlap(xmin, 0.0, xmax, ymax, r)
        }
    } else if 0.0 >= xmax {
        if 0.0 <= ymin {
            circoverlap_core(-xmax, ymin, -xmin, ymax, r)
        } else if 0.0 >= ymax {
            circoverlap_core(-xmax, -ymax, -xmin, -ymin, r)
        } else {
            circoverlap(xmin, ymin, xmax, 0.0, r) + circoverlap(xmin, 0.0, xmax, ymax, r)
        }
    } else if 0.0 <= ymin || 0.0 >= ymax {
        circoverlap(xmin, ymin, 0.0, ymax, r) + circoverlap(0.0, ymin, xmax, ymax, r)
    } else {
        circoverlap(xmin, ymin, 0.0, 0.0, r)
            + circoverlap(0.0, ymin, xmax, 0.0, r)
            + circoverlap(xmin, 0.0, 0.0, ymax, r)
            + circoverlap(0.0, 0.0, xmax, ymax, r)
    }
}

/// Whether `(x, y)` falls inside the triangle, by ray crossing parity.
fn in_triangle(x: f64, y: f64, x1: f64, y1: f64, x2: f64, y2: f64, x3: f64, y3: f64) -> bool {
    let mut c = 0;
    if (y1 > y) != (y2 > y) && x < (x2 - x1) * (y - y1) / (y2 - y1) + x1 {
        c += 1;
    }
    if (y2 > y) != (y3 > y) && x < (x3 - x2) * (y - y2) / (y3 - y2) + x2 {
        c += 1;
    }
    if (y3 > y) != (y1 > y) && x < (x1 - x3) * (y - y3) / (y1 - y3) + x3 {
        c += 1;
    }
    c % 2 == 1
}

/// Intersections of the infinite line through two points with the unit
/// circle, parameterized along the better-conditioned axis.
fn circle_line(x1: f64, y1: f64, x2: f64, y2: f64) -> (Point, Point) {
    let tol = 1.0e-10;
    let dx = x2 - x1;
    let dy = y2 - y1;

    if dx.abs() < tol && dy.abs() < tol {
        (MISS, MISS)
    } else if dx.abs() > dy.abs() {
        let a = dy / dx;
        let b = y1 - a * x1;
        let delta = 1.0 + a * a - b * b;
        if delta > 0.0 {
            let delta = delta.sqrt();
            let p1x = (-a * b - delta) / (1.0 + a * a);
            let p2x = (-a * b + delta) / (1.0 + a * a);
            (
                Point { x: p1x, y: a * p1x + b },
                Point { x: p2x, y: a * p2x + b },
            )
        } else {
            (MISS, MISS)
        }
    } else {
        let a = dx / dy;
        let b = x1 - a * y1;
        let delta = 1.0 + a * a - b * b;
        if delta > 0.0 {
            let delta = delta.sqrt();
            let p1y = (-a * b - delta) / (1.0 + a * a);
            let p2y = (-a * b + delta) / (1.0 + a * a);
            (
                Point { x: a * p1y + b, y: p1y },
                Point { x: a * p2y + b, y: p2y },
            )
        } else {
            (MISS, MISS)
        }
    }
}

/// Line-circle intersection closest to `(x2, y2)`.
fn circle_segment_single2(x1: f64, y1: f64, x2: f64, y2: f64) -> Point {
    let (pt1, pt2) = circle_line(x1, y1, x2, y2);
    let dx1 = (pt1.x - x2).abs();
    let dy1 = (pt1.y - y2).abs();
    let dx2 = (pt2.x - x2).abs();
    let dy2 = (pt2.y - y2).abs();

    if dx1 > dy1 {
        if dx1 > dx2 {
            pt2
        } else {
            pt1
        }
    } else if dy1 > dy2 {
        pt2
    } else {
        pt1
    }
}

/// Segment-circle intersections, discarding solutions off the segment.
fn circle_segment(x1: f64, y1: f64, x2: f64, y2: f64) -> (Point, Point) {
    let (p1, p2) = circle_line(x1, y1, x2, y2);
    let off_segment = |p: &Point| {
        (p.x > x1 && p.x > x2)
            || (p.x < x1 && p.x < x2)
            || (p.y > y1 && p.y > y2)
            || (p.y < y1 && p.y < y2)
    };
    let pt1 = if off_segment(&p1) { MISS } else { p1 };
    let pt2 = if off_segment(&p2) { MISS } else { p2 };

    if pt1.x > 1.0 && pt2.x < 2.0 {
        (pt1, pt2)
    } else {
        (pt2, pt1)
    }
}

/// Area of overlap of a triangle with the unit circle.
///
/// Vertices are first ordered by distance from the origin so that the case
/// analysis (zero, one, two or three vertices inside) only has to look at
/// one configuration each.
fn triangle_unitcircle_overlap(
    mut x1: f64,
    mut y1: f64,
    mut x2: f64,
    mut y2: f64,
    mut x3: f64,
    mut y3: f64,
) -> f64 {
    let mut d1 = x1 * x1 + y1 * y1;
    let mut d2 = x2 * x2 + y2 * y2;
    let mut d3 = x3 * x3 + y3 * y3;

    if d1 < d2 {
        if d2 < d3 {
            // already ordered
        } else if d1 < d3 {
            std::mem::swap(&mut x2, &mut x3);
            std::mem::swap(&mut y2, &mut y3);
            std::mem::swap(&mut d2, &mut d3);
        } else {
            // rotate 1 <- 3 <- 2 <- 1
            let (tx, ty, td) = (x1, y1, d1);
            x1 = x3;
            y1 = y3;
            d1 = d3;
            x3 = x2;
            y3 = y2;
            d3 = d2;
            x2 = tx;
            y2 = ty;
            d2 = td;
        }
    } else if d1 < d3 {
        std::mem::swap(&mut x1, &mut x2);
        std::mem::swap(&mut y1, &mut y2);
        std::mem::swap(&mut d1, &mut d2);
    } else if d2 < d3 {
        // rotate 1 <- 2 <- 3 <- 1
        let (tx, ty, td) = (x1, y1, d1);
        x1 = x2;
        y1 = y2;
        d1 = d2;
        x2 = x3;
        y2 = y3;
        d2 = d3;
        x3 = tx;
        y3 = ty;
        d3 = td;
    } else {
        std::mem::swap(&mut x1, &mut x3);
        std::mem::swap(&mut y1, &mut y3);
        std::mem::swap(&mut d1, &mut d3);
    }

    let in1 = d1 < 1.0;
    let in2 = d2 < 1.0;
    let on1 = (d1 - 1.0).abs() < 1.0e-10;
    let on2 = (d2 - 1.0).abs() < 1.0e-10;
    let on3 = (d3 - 1.0).abs() < 1.0e-10;
    let in3 = d3 < 1.0;

    if on3 || in3 {
        // Triangle completely inside the circle.
        area_triangle(x1, y1, x2, y2, x3, y3)
    } else if in2 || on2 {
        // Vertices 1 and 2 inside, 3 outside. A vertex exactly on the
        // circle only produces an intersection if the far vertex lies
        // outward of it.
        let intersect13 = !on1 || (x1 * (x3 - x1) + y1 * (y3 - y1) < 0.0);
        let intersect23 = !on2 || (x2 * (x3 - x2) + y2 * (y3 - y2) < 0.0);
        if intersect13 && intersect23 {
            let pt1 = circle_segment_single2(x1, y1, x3, y3);
            let pt2 = circle_segment_single2(x2, y2, x3, y3);
            area_triangle(x1, y1, x2, y2, pt1.x, pt1.y)
                + area_triangle(x2, y2, pt1.x, pt1.y, pt2.x, pt2.y)
                + area_arc(pt1.x, pt1.y, pt2.x, pt2.y, 1.0)
        } else if intersect13 {
            let pt1 = circle_segment_single2(x1, y1, x3, y3);
            area_triangle(x1, y1, x2, y2, pt1.x, pt1.y) + area_arc(x2, y2, pt1.x, pt1.y, 1.0)
        } else if intersect23 {
            let pt2 = circle_segment_single2(x2, y2, x3, y3);
            area_triangle(x1, y1, x2, y2, pt2.x, pt2.y) + area_arc(x1, y1, pt2.x, pt2.y, 1.0)
        } else {
            area_arc(x1, y1, x2, y2, 1.0)
        }
    } else if in1 {
        // Only vertex 1 inside; the far side may or may not cross.
        let (mut pt1, mut pt2) = circle_segment(x2, y2, x3, y3);
        let pt3 = circle_segment_single2(x1, y1, x2, y2);
        let pt4 = circle_segment_single2(x1, y1, x3, y3);

        if pt1.x > 1.0 {
            // Far side misses: one segment. Check whether the chord from
            // pt3 to pt4 leaves the origin and vertex 1 on different
            // sides, in which case the arc spans more than pi.
            if ((0.0 - pt3.y) * (pt4.x - pt3.x) > (pt4.y - pt3.y) * (0.0 - pt3.x))
                != ((y1 - pt3.y) * (pt4.x - pt3.x) > (pt4.y - pt3.y) * (x1 - pt3.x))
            {
                area_triangle(x1, y1, pt3.x, pt3.y, pt4.x, pt4.y) + PI
                    - area_arc(pt3.x, pt3.y, pt4.x, pt4.y, 1.0)
            } else {
                area_triangle(x1, y1, pt3.x, pt3.y, pt4.x, pt4.y)
                    + area_arc(pt3.x, pt3.y, pt4.x, pt4.y, 1.0)
            }
        } else {
            // Keep pt1 as the crossing closest to vertex 2.
            if (pt2.x - x2) * (pt2.x - x2) + (pt2.y - y2) * (pt2.y - y2)
                < (pt1.x - x2) * (pt1.x - x2) + (pt1.y - y2) * (pt1.y - y2)
            {
                std::mem::swap(&mut pt1, &mut pt2);
            }
            area_triangle(x1, y1, pt3.x, pt3.y, pt1.x, pt1.y)
                + area_triangle(x1, y1, pt1.x, pt1.y, pt2.x, pt2.y)
                + area_triangle(x1, y1, pt2.x, pt2.y, pt4.x, pt4.y)
                + area_arc(pt1.x, pt1.y, pt3.x, pt3.y, 1.0)
                + area_arc(pt2.x, pt2.y, pt4.x, pt4.y, 1.0)
        }
    } else {
        // All vertices outside; split at a crossed edge and recurse, or
        // settle containment by point-in-triangle.
        let (pt1, pt2) = circle_segment(x1, y1, x2, y2);
        let (pt3, pt4) = circle_segment(x2, y2, x3, y3);
        let (pt5, pt6) = circle_segment(x3, y3, x1, y1);
        if pt1.x <= 1.0 {
            let xp = 0.5 * (pt1.x + pt2.x);
            let yp = 0.5 * (pt1.y + pt2.y);
            triangle_unitcircle_overlap(x1, y1, x3, y3, xp, yp)
                + triangle_unitcircle_overlap(x2, y2, x3, y3, xp, yp)
        } else if pt3.x <= 1.0 {
            let xp = 0.5 * (pt3.x + pt4.x);
            let yp = 0.5 * (pt3.y + pt4.y);
            triangle_unitcircle_overlap(x3, y3, x1, y1, xp, yp)
                + triangle_unitcircle_overlap(x2, y2, x1, y1, xp, yp)
        } else if pt5.x <= 1.0 {
            let xp = 0.5 * (pt5.x + pt6.x);
            let yp = 0.5 * (pt5.y + pt6.y);
            triangle_unitcircle_overlap(x1, y1, x2, y2, xp, yp)
                + triangle_unitcircle_overlap(x3, y3, x2, y2, xp, yp)
        } else if in_triangle(0.0, 0.0, x1, y1, x2, y2, x3, y3) {
            PI
        } else {
            0.0
        }
    }
}

/// Overlap of an axis-aligned rectangle with an ellipse of semi-axes `a`
/// and `b` and position angle `theta`, centered on the origin.
pub fn ellipoverlap(xmin: f64, ymin: f64, xmax: f64, ymax: f64, a: f64, b: f64, theta: f64) -> f64 {
    let cos_m = (-theta).cos();
    let sin_m = (-theta).sin();
    let scale = a * b;

    // Reproject the rectangle to a frame where the ellipse is the unit
    // circle.
    let x1 = (xmin * cos_m - ymin * sin_m) / a;
    let y1 = (xmin * sin_m + ymin * cos_m) / b;
    let x2 = (xmax * cos_m - ymin * sin_m) / a;
    let y2 = (xmax * sin_m + ymin * cos_m) / b;
    let x3 = (xmax * cos_m - ymax * sin_m) / a;
    let y3 = (xmax * sin_m + ymax * cos_m) / b;
    let x4 = (xmin * cos_m - ymax * sin_m) / a;
    let y4 = (xmin * sin_m + ymax * cos_m) / b;

    scale
        * (triangle_unitcircle_overlap(x1, y1, x2, y2, x3, y3)
            + triangle_unitcircle_overlap(x1, y1, x4, y4, x3, y3))
}

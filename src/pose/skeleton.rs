//! Skeleton overlay drawn onto RGB24 buffers.

use super::result::PersonDetection;

/// COCO limb pairs connecting shoulders, arms, hips and legs.
pub const LIMBS: [(usize, usize); 12] = [
    (5, 7),
    (7, 9),
    (6, 8),
    (8, 10),
    (5, 6),
    (5, 11),
    (6, 12),
    (11, 12),
    (11, 13),
    (13, 15),
    (12, 14),
    (14, 16),
];

pub const KEYPOINT_COLOR: [u8; 3] = [0, 255, 0];
pub const LIMB_COLOR: [u8; 3] = [0, 0, 255];
const KEYPOINT_RADIUS: i64 = 3;
const LIMB_THICKNESS: i64 = 2;

/// Draw every person's keypoints and limbs into `canvas`.
///
/// Non-finite keypoints are skipped. Limbs are clipped to the canvas first, so
/// far off-frame coordinates cost no more than on-frame ones.
pub fn draw_people(canvas: &mut [u8], width: u32, height: u32, people: &[PersonDetection]) {
    let mut painter = Painter {
        canvas,
        width: i64::from(width),
        height: i64::from(height),
    };
    for person in people {
        for &point in &person.pose {
            if let Some((x, y)) = painter.pixel_near_canvas(point, KEYPOINT_RADIUS) {
                painter.disc(x, y, KEYPOINT_RADIUS, KEYPOINT_COLOR);
            }
        }
        for (i, j) in LIMBS {
            if let (Some(&a), Some(&b)) = (person.pose.get(i), person.pose.get(j)) {
                if let Some((from, to)) = painter.clip(a, b) {
                    painter.line(from, to, LIMB_COLOR);
                }
            }
        }
    }
}

struct Painter<'a> {
    canvas: &'a mut [u8],
    width: i64,
    height: i64,
}

impl Painter<'_> {
    /// `point` as a pixel, if it is finite and within `margin` of the canvas.
    fn pixel_near_canvas(&self, point: [f32; 2], margin: i64) -> Option<(i64, i64)> {
        let [x, y] = point.map(f64::from);
        let m = margin as f64;
        let inside = x.is_finite()
            && y.is_finite()
            && (-m..self.width as f64 + m).contains(&x)
            && (-m..self.height as f64 + m).contains(&y);
        inside.then(|| (x as i64, y as i64))
    }

    /// Liang-Barsky clip of segment `a`-`b` to the canvas plus the brush
    /// width. `None` when the segment misses it or an end is not finite.
    fn clip(&self, a: [f32; 2], b: [f32; 2]) -> Option<((i64, i64), (i64, i64))> {
        let [x0, y0] = a.map(f64::from);
        let [x1, y1] = b.map(f64::from);
        if ![x0, y0, x1, y1].iter().all(|v| v.is_finite()) {
            return None;
        }
        let pad = LIMB_THICKNESS as f64;
        let (min_x, max_x) = (-pad, (self.width - 1) as f64 + pad);
        let (min_y, max_y) = (-pad, (self.height - 1) as f64 + pad);
        let (dx, dy) = (x1 - x0, y1 - y0);
        let (mut t0, mut t1) = (0.0_f64, 1.0_f64);
        for (p, q) in [
            (-dx, x0 - min_x),
            (dx, max_x - x0),
            (-dy, y0 - min_y),
            (dy, max_y - y0),
        ] {
            if p == 0.0 {
                if q < 0.0 {
                    return None;
                }
                continue;
            }
            let t = q / p;
            if p < 0.0 {
                t0 = t0.max(t);
            } else {
                t1 = t1.min(t);
            }
            if t0 > t1 {
                return None;
            }
        }
        let at = |t: f64| ((x0 + t * dx).round() as i64, (y0 + t * dy).round() as i64);
        Some((at(t0), at(t1)))
    }

    fn put(&mut self, x: i64, y: i64, color: [u8; 3]) {
        if x < 0 || y < 0 || x >= self.width || y >= self.height {
            return;
        }
        let idx = ((y * self.width + x) * 3) as usize;
        if let Some(px) = self.canvas.get_mut(idx..idx + 3) {
            px.copy_from_slice(&color);
        }
    }

    fn disc(&mut self, cx: i64, cy: i64, radius: i64, color: [u8; 3]) {
        for dy in -radius..=radius {
            for dx in -radius..=radius {
                if dx * dx + dy * dy <= radius * radius {
                    self.put(cx + dx, cy + dy, color);
                }
            }
        }
    }

    /// Bresenham line with a square brush of `LIMB_THICKNESS` pixels. Both
    /// ends must already be clipped.
    fn line(&mut self, from: (i64, i64), to: (i64, i64), color: [u8; 3]) {
        let (mut x, mut y) = from;
        let dx = (to.0 - x).abs();
        let dy = -(to.1 - y).abs();
        let sx = if x < to.0 { 1 } else { -1 };
        let sy = if y < to.1 { 1 } else { -1 };
        let mut err = dx + dy;
        loop {
            for oy in 0..LIMB_THICKNESS {
                for ox in 0..LIMB_THICKNESS {
                    self.put(x + ox, y + oy, color);
                }
            }
            if x == to.0 && y == to.1 {
                break;
            }
            let e2 = 2 * err;
            if e2 >= dy {
                err += dy;
                x += sx;
            }
            if e2 <= dx {
                err += dx;
                y += sy;
            }
        }
    }
}

//! Scanline run-length encoding of region footprints.
//!
//! A [`Rasterization`] is the footprint of one region in one frame: scan intervals ordered by
//! `(y, left_x)` with inclusive bounds. A [`Rasterization3D`] stacks those slices over frames.

use crate::arrays::IdImage;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ScanInterval {
    pub y: i32,
    pub left_x: i32,
    pub right_x: i32,
}

impl ScanInterval {
    pub fn new(y: i32, left_x: i32, right_x: i32) -> Self {
        debug_assert!(left_x <= right_x);
        Self { y, left_x, right_x }
    }

    #[inline]
    pub fn len(&self) -> usize {
        (self.right_x - self.left_x + 1) as usize
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.right_x < self.left_x
    }

    fn order(&self, other: &Self) -> Ordering {
        self.y.cmp(&other.y).then(self.left_x.cmp(&other.left_x))
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rasterization {
    pub scan_inter: Vec<ScanInterval>,
}

impl Rasterization {
    pub fn area(&self) -> usize {
        self.scan_inter.iter().map(ScanInterval::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.scan_inter.is_empty()
    }

    /// Appends an interval, extending the last one when it continues it on the same row.
    pub fn push(&mut self, interval: ScanInterval) {
        if let Some(last) = self.scan_inter.last_mut() {
            debug_assert!(last.order(&interval) == Ordering::Less);
            if last.y == interval.y && last.right_x + 1 == interval.left_x {
                last.right_x = interval.right_x;
                return;
            }
        }
        self.scan_inter.push(interval);
    }

    /// Union of two footprints that do not overlap.
    pub fn merge(lhs: &Rasterization, rhs: &Rasterization) -> Rasterization {
        let mut merged = Rasterization {
            scan_inter: Vec::with_capacity(lhs.scan_inter.len() + rhs.scan_inter.len()),
        };
        let mut l = lhs.scan_inter.iter().peekable();
        let mut r = rhs.scan_inter.iter().peekable();
        loop {
            let next = match (l.peek(), r.peek()) {
                (Some(a), Some(b)) => {
                    if a.order(b) != Ordering::Greater {
                        l.next()
                    } else {
                        r.next()
                    }
                }
                (Some(_), None) => l.next(),
                (None, Some(_)) => r.next(),
                (None, None) => break,
            };
            if let Some(interval) = next {
                merged.push(*interval);
            }
        }
        merged
    }

    /// Encodes a row-major boolean mask.
    pub fn from_mask(mask: &[bool], width: usize) -> Rasterization {
        let mut raster = Rasterization::default();
        for (y, row) in mask.chunks(width.max(1)).enumerate() {
            let mut start: Option<usize> = None;
            for (x, &set) in row.iter().enumerate() {
                match (set, start) {
                    (true, None) => start = Some(x),
                    (false, Some(s)) => {
                        raster.push(ScanInterval::new(y as i32, s as i32, x as i32 - 1));
                        start = None;
                    }
                    _ => {}
                }
            }
            if let Some(s) = start {
                raster.push(ScanInterval::new(y as i32, s as i32, row.len() as i32 - 1));
            }
        }
        raster
    }

    pub fn to_mask(&self, width: usize, height: usize) -> Vec<bool> {
        let mut mask = vec![false; width * height];
        for s in &self.scan_inter {
            let row = s.y as usize * width;
            mask[row + s.left_x as usize..=row + s.right_x as usize].fill(true);
        }
        mask
    }

    pub fn shape_moments(&self) -> ShapeMoments {
        ShapeMoments::from_rasterization(self)
    }
}

/// Area, centroid and second central moments of a frame slice.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ShapeMoments {
    pub size: usize,
    pub mean_x: f32,
    pub mean_y: f32,
    pub moment_xx: f32,
    pub moment_xy: f32,
    pub moment_yy: f32,
}

impl ShapeMoments {
    pub fn from_rasterization(raster: &Rasterization) -> Self {
        let mut n = 0f64;
        let (mut sx, mut sy, mut sxx, mut sxy, mut syy) = (0f64, 0f64, 0f64, 0f64, 0f64);
        for s in &raster.scan_inter {
            let len = s.len() as f64;
            let (a, b) = (s.left_x as f64, s.right_x as f64);
            let y = s.y as f64;
            // Sums of x and x^2 over [a, b].
            let sum_x = (a + b) * len * 0.5;
            let sum_xx = (b * (b + 1.0) * (2.0 * b + 1.0) - (a - 1.0) * a * (2.0 * a - 1.0)) / 6.0;
            n += len;
            sx += sum_x;
            sy += y * len;
            sxx += sum_xx;
            sxy += y * sum_x;
            syy += y * y * len;
        }
        if n == 0.0 {
            return Self::default();
        }
        let mean_x = sx / n;
        let mean_y = sy / n;
        Self {
            size: n as usize,
            mean_x: mean_x as f32,
            mean_y: mean_y as f32,
            moment_xx: (sxx / n - mean_x * mean_x) as f32,
            moment_xy: (sxy / n - mean_x * mean_y) as f32,
            moment_yy: (syy / n - mean_y * mean_y) as f32,
        }
    }
}

/// Frame slices of a region, ordered by frame index.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rasterization3D {
    pub slices: Vec<(usize, Rasterization)>,
}

impl Rasterization3D {
    pub fn area(&self) -> usize {
        self.slices.iter().map(|(_, r)| r.area()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.slices.iter().all(|(_, r)| r.is_empty())
    }

    /// Adds the slice for `frame`, merging with an existing one.
    pub fn add_slice(&mut self, frame: usize, raster: Rasterization) {
        match self.slices.binary_search_by_key(&frame, |(f, _)| *f) {
            Ok(pos) => {
                let merged = Rasterization::merge(&self.slices[pos].1, &raster);
                self.slices[pos].1 = merged;
            }
            Err(pos) => self.slices.insert(pos, (frame, raster)),
        }
    }

    pub fn slice(&self, frame: usize) -> Option<&Rasterization> {
        self.slices
            .binary_search_by_key(&frame, |(f, _)| *f)
            .ok()
            .map(|pos| &self.slices[pos].1)
    }

    /// First and last frame the region occupies.
    pub fn frame_bounds(&self) -> Option<(usize, usize)> {
        Some((self.slices.first()?.0, self.slices.last()?.0))
    }

    pub fn merge(lhs: &Rasterization3D, rhs: &Rasterization3D) -> Rasterization3D {
        let mut slices = Vec::with_capacity(lhs.slices.len() + rhs.slices.len());
        let (mut i, mut j) = (0, 0);
        while i < lhs.slices.len() && j < rhs.slices.len() {
            let (lf, lr) = &lhs.slices[i];
            let (rf, rr) = &rhs.slices[j];
            match lf.cmp(rf) {
                Ordering::Less => {
                    slices.push((*lf, lr.clone()));
                    i += 1;
                }
                Ordering::Greater => {
                    slices.push((*rf, rr.clone()));
                    j += 1;
                }
                Ordering::Equal => {
                    slices.push((*lf, Rasterization::merge(lr, rr)));
                    i += 1;
                    j += 1;
                }
            }
        }
        slices.extend_from_slice(&lhs.slices[i..]);
        slices.extend_from_slice(&rhs.slices[j..]);
        Rasterization3D { slices }
    }

    /// Area of all slices outside of `[lhs, rhs]`.
    pub fn area_outside(&self, lhs: usize, rhs: usize) -> usize {
        self.slices
            .iter()
            .filter(|(f, _)| *f < lhs || *f > rhs)
            .map(|(_, r)| r.area())
            .sum()
    }

    /// True if no slice with any area lies inside `[lhs, rhs]`.
    pub fn outside_interval(&self, lhs: usize, rhs: usize) -> bool {
        !self
            .slices
            .iter()
            .any(|(f, r)| *f >= lhs && *f <= rhs && !r.is_empty())
    }
}

/// Scans an id image row by row and reports maximal runs of equal, non-negative ids.
pub fn scan_id_image<F>(ids: &IdImage, mut visit: F)
where
    F: FnMut(i32, ScanInterval),
{
    for y in 0..ids.height {
        let row = ids.get_row(y);
        let mut start = 0usize;
        for x in 1..=row.len() {
            if x == row.len() || row[x] != row[start] {
                if row[start] >= 0 {
                    visit(
                        row[start],
                        ScanInterval::new(y as i32, start as i32, x as i32 - 1),
                    );
                }
                start = x;
            }
        }
    }
}

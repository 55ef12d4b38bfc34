//! Color and flow histograms backing the region descriptors.

use hashbrown::HashMap;
use serde::{Deserialize, Serialize};
use std::f32::consts::PI;

#[derive(Clone, Debug, Serialize, Deserialize)]
enum Bins {
    Dense(Vec<f32>),
    Sparse(HashMap<u32, f32>),
}

/// Three dimensional Lab histogram with `lum_bins * color_bins * color_bins` bins.
///
/// Values are added with trilinear interpolation into a dense bin vector. Once a region is
/// complete the histogram is converted to a sparse representation and normalized, which is
/// the form every distance is computed on.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ColorHistogram {
    lum_bins: usize,
    color_bins: usize,
    weight_sum: f32,
    bins: Bins,
}

impl ColorHistogram {
    pub fn new(lum_bins: usize, color_bins: usize) -> Self {
        Self {
            lum_bins,
            color_bins,
            weight_sum: 0.0,
            bins: Bins::Dense(vec![0f32; lum_bins * color_bins * color_bins]),
        }
    }

    fn new_sparse(lum_bins: usize, color_bins: usize) -> Self {
        Self {
            lum_bins,
            color_bins,
            weight_sum: 0.0,
            bins: Bins::Sparse(HashMap::new()),
        }
    }

    pub fn lum_bins(&self) -> usize {
        self.lum_bins
    }

    pub fn color_bins(&self) -> usize {
        self.color_bins
    }

    pub fn total_bins(&self) -> usize {
        self.lum_bins * self.color_bins * self.color_bins
    }

    pub fn weight_sum(&self) -> f32 {
        self.weight_sum
    }

    pub fn is_sparse(&self) -> bool {
        matches!(self.bins, Bins::Sparse(_))
    }

    #[inline]
    fn add_to_bin(&mut self, bin: usize, value: f32) {
        match &mut self.bins {
            Bins::Dense(bins) => bins[bin] += value,
            Bins::Sparse(bins) => *bins.entry(bin as u32).or_insert(0.0) += value,
        }
    }

    /// Adds `weight` at fractional bin position `(x, y, z)`. A neighboring bin only receives
    /// a share if the fractional part is at least `1e-6`.
    pub fn add_value_interpolated(&mut self, x_bin: f32, y_bin: f32, z_bin: f32, weight: f32) {
        let (ix, iy, iz) = (x_bin as usize, y_bin as usize, z_bin as usize);
        let (dx, dy, dz) = (x_bin - ix as f32, y_bin - iy as f32, z_bin - iz as f32);
        let x_bins = [ix, ix + (dx >= 1e-6) as usize];
        let y_bins = [iy, iy + (dy >= 1e-6) as usize];
        let z_bins = [iz, iz + (dz >= 1e-6) as usize];
        let dx_vals = [1.0 - dx, dx];
        let dy_vals = [1.0 - dy, dy];
        let dz_vals = [1.0 - dz, dz];
        let cb = self.color_bins;
        for x in 0..2 {
            let slice_bin = x_bins[x] * cb * cb;
            for y in 0..2 {
                let row_bin = slice_bin + y_bins[y] * cb;
                for z in 0..2 {
                    let value = dx_vals[x] * dy_vals[y] * dz_vals[z] * weight;
                    self.add_to_bin(row_bin + z_bins[z], value);
                }
            }
        }
        self.weight_sum += weight;
    }

    /// Adds an 8-bit Lab pixel.
    #[inline]
    pub fn add_pixel_interpolated(&mut self, pixel: &[u8]) {
        self.add_pixel_values_interpolated(pixel[0] as f32, pixel[1] as f32, pixel[2] as f32);
    }

    /// Adds Lab values in `[0, 255]`.
    pub fn add_pixel_values_interpolated(&mut self, lum: f32, color_1: f32, color_2: f32) {
        let lum_scale = (self.lum_bins - 1) as f32 / 255.0;
        let color_scale = (self.color_bins - 1) as f32 / 255.0;
        self.add_value_interpolated(
            lum * lum_scale,
            color_1 * color_scale,
            color_2 * color_scale,
            1.0,
        );
    }

    pub fn convert_to_sparse(&mut self) {
        if let Bins::Dense(bins) = &self.bins {
            let sparse: HashMap<u32, f32> = bins
                .iter()
                .enumerate()
                .filter(|(_, v)| **v != 0.0)
                .map(|(i, v)| (i as u32, *v))
                .collect();
            self.bins = Bins::Sparse(sparse);
        }
    }

    /// Rescales all bins to sum to one. Empty histograms stay untouched.
    pub fn normalize_to_one(&mut self) {
        if self.weight_sum == 0.0 {
            return;
        }
        let sum: f64 = match &self.bins {
            Bins::Dense(bins) => bins.iter().map(|v| *v as f64).sum(),
            Bins::Sparse(bins) => bins.values().map(|v| *v as f64).sum(),
        };
        if sum <= 0.0 {
            return;
        }
        self.weight_sum = sum as f32;
        let denom = (1.0 / sum) as f32;
        match &mut self.bins {
            Bins::Dense(bins) => bins.iter_mut().for_each(|v| *v *= denom),
            Bins::Sparse(bins) => bins.values_mut().for_each(|v| *v *= denom),
        }
    }

    fn value(&self, bin: u32) -> f32 {
        match &self.bins {
            Bins::Dense(bins) => bins[bin as usize],
            Bins::Sparse(bins) => bins.get(&bin).copied().unwrap_or(0.0),
        }
    }

    fn entries(&self) -> Vec<(u32, f32)> {
        match &self.bins {
            Bins::Dense(bins) => bins
                .iter()
                .enumerate()
                .filter(|(_, v)| **v != 0.0)
                .map(|(i, v)| (i as u32, *v))
                .collect(),
            Bins::Sparse(bins) => bins.iter().map(|(k, v)| (*k, *v)).collect(),
        }
    }

    /// Weighted average of both histograms by their weight sums, renormalized to one.
    pub fn merge_with(&mut self, rhs: &ColorHistogram) {
        let n = self.weight_sum + rhs.weight_sum;
        if n == 0.0 {
            return;
        }
        let n_l = self.weight_sum / n;
        let n_r = rhs.weight_sum / n;
        self.weight_sum = n;
        if let (Bins::Dense(lhs), Bins::Dense(rhs_bins)) = (&mut self.bins, &rhs.bins) {
            let mut sum = 0f32;
            for (l, r) in lhs.iter_mut().zip(rhs_bins) {
                *l = *l * n_l + *r * n_r;
                sum += *l;
            }
            if sum > 0.0 {
                let denom = 1.0 / sum;
                lhs.iter_mut().for_each(|v| *v *= denom);
            }
            return;
        }
        self.convert_to_sparse();
        if let Bins::Sparse(bins) = &mut self.bins {
            bins.values_mut().for_each(|v| *v *= n_l);
            for (k, v) in rhs.entries() {
                *bins.entry(k).or_insert(0.0) += v * n_r;
            }
            let sum: f32 = bins.values().sum();
            if sum > 0.0 {
                let denom = 1.0 / sum;
                bins.values_mut().for_each(|v| *v *= denom);
            }
        }
    }

    /// Returns a sparse copy with every bin coordinate multiplied by the per-channel `gain`.
    pub fn scale_histogram(&self, gain: [f32; 3]) -> ColorHistogram {
        let mut result = ColorHistogram::new_sparse(self.lum_bins, self.color_bins);
        let cb = self.color_bins;
        let max_lum = (self.lum_bins - 1) as f32;
        let max_col = (self.color_bins - 1) as f32;
        for (bin, value) in self.entries() {
            let bin = bin as usize;
            let x = (bin / (cb * cb)) as f32;
            let y = ((bin / cb) % cb) as f32;
            let z = (bin % cb) as f32;
            result.add_value_interpolated(
                max_lum.min(x * gain[0]),
                max_col.min(y * gain[1]),
                max_col.min(z * gain[2]),
                value,
            );
        }
        result
    }

    /// `0.5 * sum((a - b)^2 / (a + b))`, in `[0, 1]` for normalized histograms.
    pub fn chi_square_dist(&self, rhs: &ColorHistogram) -> f32 {
        let mut sum = 0f64;
        if let (Bins::Dense(lhs), Bins::Dense(rhs_bins)) = (&self.bins, &rhs.bins) {
            for (l, r) in lhs.iter().zip(rhs_bins) {
                let add = (*l + *r) as f64;
                if add != 0.0 {
                    let sub = (*l - *r) as f64;
                    sum += sub * sub / add;
                }
            }
            return (0.5 * sum) as f32;
        }
        for (bin, l) in self.entries() {
            let r = rhs.value(bin);
            let add = (l + r) as f64;
            if add != 0.0 {
                let sub = (l - r) as f64;
                sum += sub * sub / add;
            }
        }
        for (bin, r) in rhs.entries() {
            if self.value(bin) == 0.0 {
                sum += r as f64;
            }
        }
        (0.5 * sum) as f32
    }
}

/// Angle histogram of 2D vectors weighted by their magnitude.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VectorHistogram {
    bins: Vec<f32>,
    num_vectors: u32,
}

impl VectorHistogram {
    pub fn new(angle_bins: usize) -> Self {
        Self {
            bins: vec![0f32; angle_bins],
            num_vectors: 0,
        }
    }

    pub fn num_bins(&self) -> usize {
        self.bins.len()
    }

    pub fn num_vectors(&self) -> u32 {
        self.num_vectors
    }

    pub fn bins(&self) -> &[f32] {
        &self.bins
    }

    pub fn add_vector(&mut self, x: f32, y: f32) {
        let magn = x.hypot(y);
        let angle = y.atan2(x) / (2.0 * PI + 1e-4) + 0.5;
        let bin = ((angle * self.bins.len() as f32) as usize).min(self.bins.len() - 1);
        self.bins[bin] += magn;
        self.num_vectors += 1;
    }

    pub fn merge_with(&mut self, rhs: &VectorHistogram) {
        let n_l = self.num_vectors as f32;
        let n_r = rhs.num_vectors as f32;
        if n_l + n_r > 0.0 {
            let n = 1.0 / (n_l + n_r);
            for (l, r) in self.bins.iter_mut().zip(&rhs.bins) {
                *l = (*l * n_l + *r * n_r) * n;
            }
            self.num_vectors += rhs.num_vectors;
            self.normalize_to_one();
        }
    }

    pub fn normalize_to_one(&mut self) {
        let sum: f32 = self.bins.iter().sum();
        if sum > 0.0 {
            let denom = 1.0 / sum;
            self.bins.iter_mut().for_each(|v| *v *= denom);
        }
    }

    pub fn chi_square_dist(&self, rhs: &VectorHistogram) -> f32 {
        let sum: f32 = self
            .bins
            .iter()
            .zip(&rhs.bins)
            .filter(|(l, r)| **l + **r != 0.0)
            .map(|(l, r)| (l - r) * (l - r) / (l + r))
            .sum();
        0.5 * sum
    }
}

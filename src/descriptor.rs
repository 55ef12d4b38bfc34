//! Region descriptors and the policies reducing their distances to one edge weight.
//!
//! Every descriptor kind supports the same four operations: accumulate features over a
//! scanline footprint, measure a distance in `[0, 1]` to a descriptor of the same kind, finish
//! population (idempotent) and merge with another descriptor. Dispatch is a closed enum, a
//! kind mismatch is reported as [`Error::DescriptorKindMismatch`].

use crate::arrays::{FlowField, LabFrame};
use crate::error::{Error, Result};
use crate::histograms::{ColorHistogram, VectorHistogram};
use crate::rasterization::Rasterization;
use serde::{Deserialize, Serialize};

/// Per-frame source a descriptor reads its features from.
#[derive(Debug, Clone)]
pub enum DescriptorExtractor {
    Appearance(AppearanceExtractor),
    Flow(FlowExtractor),
}

#[derive(Debug, Clone)]
pub struct AppearanceExtractor {
    pub lab: LabFrame,
    pub luminance_bins: usize,
    pub color_bins: usize,
    /// Switches to per-window histograms with gain compensation.
    pub window_size: Option<usize>,
}

/// Flow extractor. `flow` is `None` for frames without a predecessor.
#[derive(Debug, Clone)]
pub struct FlowExtractor {
    pub flow_bins: usize,
    pub flow: Option<FlowField>,
}

impl DescriptorExtractor {
    pub fn create_descriptor(&self) -> RegionDescriptor {
        match self {
            DescriptorExtractor::Appearance(ext) => match ext.window_size {
                Some(window_size) => RegionDescriptor::WindowedAppearance(
                    WindowedAppearanceDescriptor::new(
                        window_size,
                        ext.luminance_bins,
                        ext.color_bins,
                    ),
                ),
                None => RegionDescriptor::Appearance(AppearanceDescriptor::new(
                    ext.luminance_bins,
                    ext.color_bins,
                )),
            },
            DescriptorExtractor::Flow(ext) => {
                RegionDescriptor::Flow(FlowDescriptor::new(ext.flow_bins))
            }
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            DescriptorExtractor::Appearance(_) => "appearance",
            DescriptorExtractor::Flow(_) => "flow",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RegionDescriptor {
    Appearance(AppearanceDescriptor),
    WindowedAppearance(WindowedAppearanceDescriptor),
    Flow(FlowDescriptor),
}

impl RegionDescriptor {
    pub fn kind(&self) -> &'static str {
        match self {
            RegionDescriptor::Appearance(_) => "appearance",
            RegionDescriptor::WindowedAppearance(_) => "windowed appearance",
            RegionDescriptor::Flow(_) => "flow",
        }
    }

    fn mismatch(&self, rhs: &'static str) -> Error {
        Error::DescriptorKindMismatch {
            lhs: self.kind(),
            rhs,
        }
    }

    pub fn add_features(
        &mut self,
        raster: &Rasterization,
        extractor: &DescriptorExtractor,
        frame: usize,
    ) -> Result<()> {
        match (self, extractor) {
            (RegionDescriptor::Appearance(desc), DescriptorExtractor::Appearance(ext)) => {
                desc.add_features(raster, &ext.lab)
            }
            (RegionDescriptor::WindowedAppearance(desc), DescriptorExtractor::Appearance(ext)) => {
                desc.add_features(raster, &ext.lab, frame)
            }
            (RegionDescriptor::Flow(desc), DescriptorExtractor::Flow(ext)) => {
                if let Some(flow) = &ext.flow {
                    desc.add_features(raster, flow, frame)
                }
            }
            (desc, ext) => return Err(desc.mismatch(ext.kind())),
        }
        Ok(())
    }

    /// Distance in `[0, 1]` to a descriptor of the same kind.
    pub fn region_distance(&self, rhs: &RegionDescriptor) -> Result<f32> {
        match (self, rhs) {
            (RegionDescriptor::Appearance(l), RegionDescriptor::Appearance(r)) => {
                Ok(l.histogram.chi_square_dist(&r.histogram))
            }
            (RegionDescriptor::WindowedAppearance(l), RegionDescriptor::WindowedAppearance(r)) => {
                l.region_distance(r)
            }
            (RegionDescriptor::Flow(l), RegionDescriptor::Flow(r)) => Ok(l.region_distance(r)),
            (l, r) => Err(l.mismatch(r.kind())),
        }
    }

    pub fn populating_finished(&mut self) {
        match self {
            RegionDescriptor::Appearance(desc) => desc.populating_finished(),
            RegionDescriptor::WindowedAppearance(desc) => desc.populating_finished(),
            RegionDescriptor::Flow(desc) => desc.populating_finished(),
        }
    }

    pub fn merge_with(&mut self, rhs: &RegionDescriptor) -> Result<()> {
        match (self, rhs) {
            (RegionDescriptor::Appearance(l), RegionDescriptor::Appearance(r)) => {
                l.histogram.merge_with(&r.histogram)
            }
            (RegionDescriptor::WindowedAppearance(l), RegionDescriptor::WindowedAppearance(r)) => {
                l.merge_with(r)
            }
            (RegionDescriptor::Flow(l), RegionDescriptor::Flow(r)) => l.merge_with(r),
            (l, r) => return Err(l.mismatch(r.kind())),
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppearanceDescriptor {
    histogram: ColorHistogram,
    is_populated: bool,
}

impl AppearanceDescriptor {
    pub fn new(luminance_bins: usize, color_bins: usize) -> Self {
        Self {
            histogram: ColorHistogram::new(luminance_bins, color_bins),
            is_populated: false,
        }
    }

    fn add_features(&mut self, raster: &Rasterization, lab: &LabFrame) {
        for s in &raster.scan_inter {
            let row = lab.get_row_part(s.y as usize, s.left_x as usize, s.right_x as usize);
            for pixel in row.chunks_exact(3) {
                self.histogram.add_pixel_interpolated(pixel);
            }
        }
    }

    fn populating_finished(&mut self) {
        if !self.is_populated {
            self.histogram.convert_to_sparse();
            self.histogram.normalize_to_one();
            self.is_populated = true;
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CalibratedHistogram {
    histogram: ColorHistogram,
    log_average: [f64; 3],
}

/// Gain turning values observed under `frame_log` into values under `anchor_log`.
fn gain_change(anchor_log: &[f64; 3], frame_log: &[f64; 3]) -> [f32; 3] {
    std::array::from_fn(|c| (anchor_log[c] - frame_log[c]).exp() as f32)
}

fn finish_histogram(histogram: &mut ColorHistogram) {
    if !histogram.is_sparse() {
        histogram.convert_to_sparse();
        histogram.normalize_to_one();
    }
}

/// Appearance histogram per window of `window_size` frames. Each window is calibrated to the
/// log-average Lab values of the first frame that populated it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WindowedAppearanceDescriptor {
    window_size: usize,
    compare_radius: usize,
    luminance_bins: usize,
    color_bins: usize,
    windows: Vec<Option<CalibratedHistogram>>,
    is_populated: bool,
}

impl WindowedAppearanceDescriptor {
    pub fn new(window_size: usize, luminance_bins: usize, color_bins: usize) -> Self {
        Self {
            window_size: window_size.max(1),
            compare_radius: 2,
            luminance_bins,
            color_bins,
            windows: Vec::new(),
            is_populated: false,
        }
    }

    fn add_features(&mut self, raster: &Rasterization, lab: &LabFrame, frame: usize) {
        let window_idx = frame / self.window_size;
        if window_idx >= self.windows.len() {
            // A new window starts, earlier ones are complete.
            for win in self.windows.iter_mut().flatten() {
                finish_histogram(&mut win.histogram);
            }
            self.windows.resize(window_idx + 1, None);
        }
        let (lum_bins, color_bins) = (self.luminance_bins, self.color_bins);
        let window = self.windows[window_idx].get_or_insert_with(|| CalibratedHistogram {
            histogram: ColorHistogram::new(lum_bins, color_bins),
            log_average: lab.log_average,
        });
        let gain = gain_change(&window.log_average, &lab.log_average);
        for s in &raster.scan_inter {
            let row = lab.get_row_part(s.y as usize, s.left_x as usize, s.right_x as usize);
            for pixel in row.chunks_exact(3) {
                window.histogram.add_pixel_values_interpolated(
                    (pixel[0] as f32 * gain[0]).min(255.0),
                    (pixel[1] as f32 * gain[1]).min(255.0),
                    (pixel[2] as f32 * gain[2]).min(255.0),
                );
            }
        }
    }

    fn region_distance(&self, rhs: &WindowedAppearanceDescriptor) -> Result<f32> {
        let common = self.windows.len().min(rhs.windows.len());
        if common == 0 {
            // No observed frames, no evidence against merging.
            return Ok(0.0);
        }
        let max_idx = common - 1;
        let mut min_idx = 0;
        while min_idx < max_idx && (self.windows[min_idx].is_none() || rhs.windows[min_idx].is_none())
        {
            min_idx += 1;
        }
        let radius = self.compare_radius;
        let lhs_key = min_idx.saturating_sub(radius);
        let rhs_key = max_idx + radius;

        let mut dist_sum = 0f64;
        let mut weight_sum = 0f64;
        for key in lhs_key..=rhs_key {
            let Some(Some(current)) = self.windows.get(key) else {
                continue;
            };
            let first = key.saturating_sub(radius).max(lhs_key);
            let last = (key + radius).min(rhs_key);
            for match_key in first..=last {
                let Some(Some(matched)) = rhs.windows.get(match_key) else {
                    continue;
                };
                let weight = current
                    .histogram
                    .weight_sum()
                    .min(matched.histogram.weight_sum()) as f64;
                // Rounding after gain scaling can overshoot the unit range slightly.
                let dist = (current.histogram.chi_square_dist(&matched.histogram) as f64)
                    .clamp(0.0, 1.0);
                dist_sum += weight * dist;
                weight_sum += weight;
            }
        }
        if weight_sum > 0.0 {
            Ok((dist_sum / weight_sum) as f32)
        } else {
            Ok(0.0)
        }
    }

    fn populating_finished(&mut self) {
        if !self.is_populated {
            for win in self.windows.iter_mut().flatten() {
                finish_histogram(&mut win.histogram);
            }
            self.is_populated = true;
        }
    }

    fn merge_with(&mut self, rhs: &WindowedAppearanceDescriptor) {
        if rhs.windows.len() > self.windows.len() {
            self.windows.resize(rhs.windows.len(), None);
        }
        for (lhs, rhs) in self.windows.iter_mut().zip(&rhs.windows) {
            let Some(rhs) = rhs else { continue };
            match lhs {
                Some(lhs) => {
                    let gain = gain_change(&lhs.log_average, &rhs.log_average);
                    lhs.histogram
                        .merge_with(&rhs.histogram.scale_histogram(gain));
                }
                None => *lhs = Some(rhs.clone()),
            }
        }
    }
}

/// Per-frame flow direction histograms.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowDescriptor {
    flow_bins: usize,
    histograms: Vec<Option<VectorHistogram>>,
    is_populated: bool,
}

impl FlowDescriptor {
    pub fn new(flow_bins: usize) -> Self {
        Self {
            flow_bins,
            histograms: Vec::new(),
            is_populated: false,
        }
    }

    fn add_features(&mut self, raster: &Rasterization, flow: &FlowField, frame: usize) {
        if frame >= self.histograms.len() {
            self.histograms.resize(frame + 1, None);
        }
        let bins = self.flow_bins;
        let hist = self.histograms[frame].get_or_insert_with(|| VectorHistogram::new(bins));
        for s in &raster.scan_inter {
            let y = s.y as usize;
            let (l, r) = (s.left_x as usize, s.right_x as usize + 1);
            let row_x = &flow.flow_x.get_row(y)[l..r];
            let row_y = &flow.flow_y.get_row(y)[l..r];
            for (fx, fy) in row_x.iter().zip(row_y) {
                hist.add_vector(*fx, *fy);
            }
        }
    }

    fn region_distance(&self, rhs: &FlowDescriptor) -> f32 {
        let mut sum = 0f32;
        let mut sum_weight = 0f32;
        for (l, r) in self.histograms.iter().zip(&rhs.histograms) {
            if let (Some(l), Some(r)) = (l, r) {
                let weight = l.num_vectors().min(r.num_vectors()) as f32;
                sum += l.chi_square_dist(r) * weight;
                sum_weight += weight;
            }
        }
        if sum_weight > 0.0 {
            sum / sum_weight
        } else {
            0.0
        }
    }

    fn populating_finished(&mut self) {
        if !self.is_populated {
            self.histograms
                .iter_mut()
                .flatten()
                .for_each(VectorHistogram::normalize_to_one);
            self.is_populated = true;
        }
    }

    fn merge_with(&mut self, rhs: &FlowDescriptor) {
        if rhs.histograms.len() > self.histograms.len() {
            self.histograms.resize(rhs.histograms.len(), None);
        }
        for (lhs, rhs) in self.histograms.iter_mut().zip(&rhs.histograms) {
            let Some(rhs) = rhs else { continue };
            match lhs {
                Some(lhs) => lhs.merge_with(rhs),
                None => *lhs = Some(rhs.clone()),
            }
        }
    }
}

/// Reduces the per-descriptor distances of a region pair to one edge weight.
pub trait RegionDistance {
    fn num_descriptors(&self) -> usize;
    fn evaluate(&self, distances: &[f32]) -> f32;
}

/// `(1 - prod(1 - d_i))^2`: close to zero only if every descriptor agrees.
#[derive(Debug, Clone, Copy)]
pub struct SquaredOrDistance {
    pub num_descriptors: usize,
}

impl RegionDistance for SquaredOrDistance {
    fn num_descriptors(&self) -> usize {
        self.num_descriptors
    }

    fn evaluate(&self, distances: &[f32]) -> f32 {
        let keep: f32 = distances.iter().map(|d| 1.0 - d).product();
        let result = 1.0 - keep;
        result * result
    }
}

#[derive(Debug, Clone)]
pub struct LinearDistance {
    pub weights: Vec<f32>,
}

impl RegionDistance for LinearDistance {
    fn num_descriptors(&self) -> usize {
        self.weights.len()
    }

    fn evaluate(&self, distances: &[f32]) -> f32 {
        distances.iter().zip(&self.weights).map(|(d, w)| d * w).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arrays::Array2D;
    use crate::rasterization::ScanInterval;

    fn uniform_lab(width: usize, height: usize, value: u8) -> LabFrame {
        LabFrame::from_rgb8(&vec![value; width * height * 3], width, height).unwrap()
    }

    fn full_row(width: usize) -> Rasterization {
        Rasterization {
            scan_inter: vec![ScanInterval::new(0, 0, width as i32 - 1)],
        }
    }

    fn appearance(lab: LabFrame, window_size: Option<usize>) -> DescriptorExtractor {
        DescriptorExtractor::Appearance(AppearanceExtractor {
            lab,
            luminance_bins: 6,
            color_bins: 8,
            window_size,
        })
    }

    #[test]
    fn appearance_distance_separates_colors() {
        let dark = appearance(uniform_lab(4, 1, 10), None);
        let bright = appearance(uniform_lab(4, 1, 240), None);
        let mut a = dark.create_descriptor();
        let mut b = bright.create_descriptor();
        let mut c = dark.create_descriptor();
        a.add_features(&full_row(4), &dark, 0).unwrap();
        b.add_features(&full_row(4), &bright, 0).unwrap();
        c.add_features(&full_row(2), &dark, 0).unwrap();
        for d in [&mut a, &mut b, &mut c] {
            d.populating_finished();
            d.populating_finished();
        }
        assert!(a.region_distance(&c).unwrap() < 1e-5);
        assert!(a.region_distance(&b).unwrap() > 0.9);
        a.merge_with(&b).unwrap();
        let d = a.region_distance(&b).unwrap();
        assert!(d > 0.1 && d < 0.9);
    }

    #[test]
    fn windowed_appearance_matches_nearby_windows() {
        let ext = appearance(uniform_lab(3, 1, 128), Some(2));
        let mut a = ext.create_descriptor();
        let mut b = ext.create_descriptor();
        for frame in 0..4 {
            a.add_features(&full_row(3), &ext, frame).unwrap();
        }
        b.add_features(&full_row(3), &ext, 5).unwrap();
        a.populating_finished();
        b.populating_finished();
        assert!(a.region_distance(&b).unwrap() < 1e-4);
        a.merge_with(&b).unwrap();
        let RegionDescriptor::WindowedAppearance(merged) = &a else {
            panic!("kind changed on merge");
        };
        assert_eq!(merged.windows.len(), 3);
        assert!(merged.windows.iter().all(Option::is_some));
    }

    #[test]
    fn windowed_distance_stays_in_unit_range() {
        let dark = appearance(uniform_lab(3, 1, 20), Some(2));
        let bright = appearance(uniform_lab(3, 1, 230), Some(2));
        let mut a = dark.create_descriptor();
        let mut b = bright.create_descriptor();
        for frame in 0..4 {
            a.add_features(&full_row(3), &dark, frame).unwrap();
            b.add_features(&full_row(3), &bright, frame).unwrap();
            b.add_features(&full_row(2), &dark, frame).unwrap();
        }
        a.populating_finished();
        b.populating_finished();
        let mut merged = a.clone();
        merged.merge_with(&b).unwrap();
        for (lhs, rhs) in [(&a, &b), (&merged, &a), (&merged, &b), (&b, &merged)] {
            let d = lhs.region_distance(rhs).unwrap();
            assert!((0.0..=1.0).contains(&d), "distance {d}");
        }
    }

    #[test]
    fn flow_descriptor_skips_invalid_flow() {
        let flow = FlowField::new(
            Array2D::from_fill(1f32, 2, 1),
            Array2D::from_fill(0f32, 2, 1),
        )
        .unwrap();
        let valid = DescriptorExtractor::Flow(FlowExtractor {
            flow_bins: 8,
            flow: Some(flow),
        });
        let invalid = DescriptorExtractor::Flow(FlowExtractor {
            flow_bins: 8,
            flow: None,
        });
        let mut a = valid.create_descriptor();
        a.add_features(&full_row(2), &invalid, 0).unwrap();
        a.add_features(&full_row(2), &valid, 1).unwrap();
        let mut b = a.clone();
        a.populating_finished();
        b.populating_finished();
        assert_eq!(a.region_distance(&b).unwrap(), 0.0);
        let RegionDescriptor::Flow(flow_desc) = &a else {
            panic!("expected flow descriptor");
        };
        assert!(flow_desc.histograms[0].is_none());
        assert_eq!(flow_desc.histograms[1].as_ref().map(|h| h.num_vectors()), Some(2));
    }

    #[test]
    fn kind_mismatch_is_reported() {
        let ext = appearance(uniform_lab(2, 1, 0), None);
        let flow = DescriptorExtractor::Flow(FlowExtractor {
            flow_bins: 4,
            flow: None,
        });
        let mut a = ext.create_descriptor();
        let b = flow.create_descriptor();
        assert!(matches!(
            a.region_distance(&b),
            Err(Error::DescriptorKindMismatch { lhs: "appearance", rhs: "flow" })
        ));
        assert!(a.add_features(&full_row(2), &flow, 0).is_err());
        assert!(a.merge_with(&b).is_err());
    }

    #[test]
    fn distance_policies() {
        let or = SquaredOrDistance { num_descriptors: 2 };
        assert_eq!(or.evaluate(&[0.0, 0.0]), 0.0);
        assert!((or.evaluate(&[0.5, 0.0]) - 0.25).abs() < 1e-6);
        assert!((or.evaluate(&[0.5, 0.5]) - 0.5625).abs() < 1e-6);
        let linear = LinearDistance {
            weights: vec![0.25, 0.75],
        };
        assert_eq!(linear.num_descriptors(), 2);
        assert!((linear.evaluate(&[1.0, 0.2]) - 0.4).abs() < 1e-6);
    }
}

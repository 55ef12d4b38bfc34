use crate::cielab::rgb_to_lab_pixel;
use crate::common::{split_length_to_ranges, Smoothing};
use crate::error::{Error, Result};
use aligned_vec::{AVec, ConstAlign};
use rayon::current_num_threads;
use rayon::prelude::*;
use std::ops::{Index, IndexMut};

const ALIGN: usize = 64;

#[derive(Debug, Clone)]
pub struct Array2D<T> {
    pub data: AVec<T, ConstAlign<ALIGN>>,
    pub width: usize,
    pub height: usize,
}

/// Per-pixel region ids of one frame. Negative values mark "no region".
pub type IdImage = Array2D<i32>;

impl<T> Array2D<T> {
    pub fn from_slice(data: &[T], width: usize, height: usize) -> Result<Self>
    where
        T: Clone,
    {
        if data.len() != width * height {
            return Err(Error::DimensionMismatch {
                expected: width * height,
                actual: data.len(),
            });
        }
        Ok(Self {
            width,
            height,
            data: AVec::from_slice(ALIGN, data),
        })
    }

    pub fn from_fill(value: T, width: usize, height: usize) -> Self
    where
        T: Clone + Copy,
    {
        let data: AVec<T, ConstAlign<ALIGN>> =
            AVec::from_iter(ALIGN, (0..width * height).map(|_| value));
        Self {
            width,
            height,
            data,
        }
    }

    pub fn fill(&mut self, value: T)
    where
        T: Clone,
    {
        self.data.fill(value)
    }
    pub fn get_row(&self, row: usize) -> &[T] {
        debug_assert!(row < self.height);
        &self.data[(self.width * row)..(self.width * row + self.width)]
    }
    pub fn get_row_mut(&mut self, row: usize) -> &mut [T] {
        debug_assert!(row < self.height);
        &mut self.data[(self.width * row)..(self.width * row + self.width)]
    }
    #[inline(always)]
    pub fn get_index(&self, x: usize, y: usize) -> usize {
        debug_assert!(self.width > x);
        debug_assert!(self.height > y);
        self.width * y + x
    }
    pub fn get(&self, x: usize, y: usize) -> Result<&T> {
        if x >= self.width || y >= self.height {
            return Err(Error::IndicesOutOfBounds(x, y));
        }
        Ok(&self.data[self.width * y + x])
    }
}
impl<T> Index<(usize, usize)> for Array2D<T> {
    type Output = T;
    fn index(&self, (x, y): (usize, usize)) -> &Self::Output {
        &self.data[self.get_index(x, y)]
    }
}
impl<T> IndexMut<(usize, usize)> for Array2D<T> {
    fn index_mut(&mut self, (x, y): (usize, usize)) -> &mut Self::Output {
        let idx = self.get_index(x, y);
        &mut self.data[idx]
    }
}

/// Packed three channel float image with values in `[0, 1]`, the input of the pixel graph.
#[derive(Debug, Clone)]
pub struct FeatureFrame {
    pub data: AVec<f32, ConstAlign<ALIGN>>,
    pub width: usize,
    pub height: usize,
}

impl FeatureFrame {
    /// Scales a packed 8-bit three channel frame to `[0, 1]` and applies `smoothing`.
    pub fn from_rgb8(rgb: &[u8], width: usize, height: usize, smoothing: Smoothing) -> Result<Self> {
        if width == 0 || height == 0 || rgb.len() != width * height * 3 {
            return Err(Error::DimensionMismatch {
                expected: width * height * 3,
                actual: rgb.len(),
            });
        }
        let mut data: AVec<f32, ConstAlign<ALIGN>> =
            AVec::from_iter(ALIGN, (0..rgb.len()).map(|_| 0f32));
        data.par_chunks_mut(width * 3)
            .zip(rgb.par_chunks(width * 3))
            .for_each(|(out, row)| {
                out.iter_mut()
                    .zip(row)
                    .for_each(|(o, v)| *o = *v as f32 * (1.0 / 255.0))
            });
        let mut frame = Self {
            data,
            width,
            height,
        };
        if smoothing == Smoothing::Binomial3 {
            frame.smooth_binomial();
        }
        Ok(frame)
    }

    pub fn from_fn<F>(width: usize, height: usize, f: F) -> Self
    where
        F: Fn(usize, usize) -> [f32; 3],
    {
        Self {
            data: AVec::from_iter(
                ALIGN,
                (0..width * height).flat_map(|i| f(i % width, i / width)),
            ),
            width,
            height,
        }
    }

    #[inline(always)]
    pub fn pixel(&self, x: usize, y: usize) -> &[f32] {
        debug_assert!(x < self.width && y < self.height);
        let idx = (y * self.width + x) * 3;
        &self.data[idx..idx + 3]
    }

    fn smooth_binomial(&mut self) {
        let width = self.width;
        let height = self.height;
        let mut horizontal: Vec<f32> = vec![0f32; self.data.len()];
        horizontal
            .par_chunks_mut(width * 3)
            .zip(self.data.par_chunks(width * 3))
            .for_each(|(out, row)| {
                for x in 0..width {
                    let l = x.saturating_sub(1);
                    let r = (x + 1).min(width - 1);
                    for c in 0..3 {
                        out[x * 3 + c] =
                            0.25 * row[l * 3 + c] + 0.5 * row[x * 3 + c] + 0.25 * row[r * 3 + c];
                    }
                }
            });
        let row_len = width * 3;
        self.data
            .par_chunks_mut(row_len)
            .enumerate()
            .for_each(|(y, out)| {
                let t = y.saturating_sub(1) * row_len;
                let m = y * row_len;
                let b = (y + 1).min(height - 1) * row_len;
                for i in 0..row_len {
                    out[i] = 0.25 * horizontal[t + i] + 0.5 * horizontal[m + i] + 0.25 * horizontal[b + i];
                }
            });
    }
}

/// Lab frame in 8-bit OpenCV scaling (`L * 255 / 100`, `a + 128`, `b + 128`) used for
/// appearance histograms, along with the per-channel mean of the log values.
#[derive(Debug, Clone)]
pub struct LabFrame {
    pub lab_data: AVec<u8, ConstAlign<ALIGN>>,
    pub width: usize,
    pub height: usize,
    pub log_average: [f64; 3],
}

impl LabFrame {
    pub fn from_rgb8(rgb: &[u8], width: usize, height: usize) -> Result<Self> {
        if width == 0 || height == 0 || rgb.len() != width * height * 3 {
            return Err(Error::DimensionMismatch {
                expected: width * height * 3,
                actual: rgb.len(),
            });
        }
        let mut lab_data: AVec<u8, ConstAlign<ALIGN>> =
            AVec::from_iter(ALIGN, (0..rgb.len()).map(|_| 0u8));
        let ranges = split_length_to_ranges(width * height, current_num_threads());
        let mut log_sums = vec![[0f64; 3]; ranges.len()];
        rayon::scope(|s| {
            let mut rgb_input: &[u8] = rgb;
            let mut data_output: &mut [u8] = &mut lab_data;
            for (range, log_sum) in ranges.iter().zip(log_sums.iter_mut()) {
                let (chunk_in, rest_in) = rgb_input.split_at(range.len() * 3);
                rgb_input = rest_in;
                let (chunk_out, rest_out) = data_output.split_at_mut(range.len() * 3);
                data_output = rest_out;
                s.spawn(move |_| {
                    for (out, pix) in chunk_out.chunks_exact_mut(3).zip(chunk_in.chunks_exact(3)) {
                        let lab = rgb_to_lab_pixel(pix);
                        out.copy_from_slice(&lab);
                        for c in 0..3 {
                            log_sum[c] += (lab[c].max(1) as f64).ln();
                        }
                    }
                });
            }
        });
        let num_pixels = (width * height) as f64;
        let mut log_average = [0f64; 3];
        for sum in &log_sums {
            for c in 0..3 {
                log_average[c] += sum[c] / num_pixels;
            }
        }
        Ok(Self {
            lab_data,
            width,
            height,
            log_average,
        })
    }

    #[inline(always)]
    pub fn get_row_part(&self, row: usize, left: usize, right: usize) -> &[u8] {
        debug_assert!(row < self.height);
        debug_assert!(left <= right && right < self.width);
        &self.lab_data[(3 * self.width * row + 3 * left)..(3 * self.width * row + 3 * right) + 3]
    }
}

/// Dense optical flow between a frame and its predecessor. Flow vectors point from the
/// current frame into the previous one.
#[derive(Debug, Clone)]
pub struct FlowField {
    pub flow_x: Array2D<f32>,
    pub flow_y: Array2D<f32>,
}

impl FlowField {
    pub fn new(flow_x: Array2D<f32>, flow_y: Array2D<f32>) -> Result<Self> {
        if flow_x.width != flow_y.width || flow_x.height != flow_y.height {
            return Err(Error::DimensionMismatch {
                expected: flow_x.width * flow_x.height,
                actual: flow_y.width * flow_y.height,
            });
        }
        Ok(Self { flow_x, flow_y })
    }

    pub fn zero(width: usize, height: usize) -> Self {
        Self {
            flow_x: Array2D::from_fill(0f32, width, height),
            flow_y: Array2D::from_fill(0f32, width, height),
        }
    }

    pub fn width(&self) -> usize {
        self.flow_x.width
    }

    pub fn height(&self) -> usize {
        self.flow_x.height
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn feature_frame_scaling() {
        let rgb = [0u8, 255, 51, 255, 0, 102];
        let frame = FeatureFrame::from_rgb8(&rgb, 2, 1, Smoothing::None).unwrap();
        assert_eq!(frame.pixel(0, 0), &[0.0, 1.0, 0.2]);
        assert!((frame.pixel(1, 0)[2] - 0.4).abs() < 1e-6);
    }

    #[test]
    fn smoothing_keeps_constant_frames() {
        let rgb = vec![128u8; 5 * 4 * 3];
        let frame = FeatureFrame::from_rgb8(&rgb, 5, 4, Smoothing::Binomial3).unwrap();
        for v in frame.data.iter() {
            assert!((v - 128.0 / 255.0).abs() < 1e-6);
        }
    }

    #[test]
    fn rejects_wrong_dimensions() {
        assert!(matches!(
            FeatureFrame::from_rgb8(&[0u8; 10], 2, 2, Smoothing::None),
            Err(Error::DimensionMismatch { expected: 12, .. })
        ));
        assert!(Array2D::from_slice(&[1, 2, 3], 2, 2).is_err());
    }

    #[test]
    fn lab_frame_rows() {
        let rgb: Vec<u8> = (0..16 * 9 * 3).map(|i| (i % 251) as u8).collect();
        let lab = LabFrame::from_rgb8(&rgb, 16, 9).unwrap();
        assert_eq!(lab.lab_data.len(), rgb.len());
        assert_eq!(lab.get_row_part(2, 3, 5).len(), 9);
        assert!(lab.log_average.iter().all(|v| *v >= 0.0));
    }

    #[test]
    fn array_access() {
        let mut arr = Array2D::from_fill(-1i32, 3, 2);
        arr[(2, 1)] = 7;
        assert_eq!(arr.get_row(1), &[-1, -1, 7]);
        assert!(arr.get(3, 0).is_err());
    }
}

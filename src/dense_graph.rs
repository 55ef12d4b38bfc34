//! Pixel graph of a chunk of frames, segmented into the oversegmentation.
//!
//! Each pixel of each frame is one node. Spatial 8-neighborhood edges of frame `f` go into
//! bucket list `2f`, temporal edges between frame `f` and `f - 1` go into list `2f - 1`.

use crate::arrays::{Array2D, FeatureFrame, FlowField, IdImage};
use crate::common::ColorDistance;
use crate::components::label_components;
use crate::error::{Error, Result};
use crate::io::SegmentationRecord;
use crate::rasterization::{scan_id_image, Rasterization};
use crate::region::RegionInformation;
use crate::union_find::{SegmentationGraph, VIRTUAL_EDGE_WEIGHT};
use hashbrown::HashMap;
use log::{debug, info};
use multiversion::multiversion;
use rayon::prelude::*;

const NUM_BUCKETS: usize = 2048;
const SKIP_BUCKETS: usize = 5;

#[inline(always)]
fn color_diff(a: &[f32], b: &[f32], kind: ColorDistance) -> f32 {
    let d0 = a[0] - b[0];
    let d1 = a[1] - b[1];
    let d2 = a[2] - b[2];
    match kind {
        ColorDistance::L1 => (d0.abs() + d1.abs() + d2.abs()) * (1.0 / 3.0),
        ColorDistance::L2 => (d0 * d0 + d1 * d1 + d2 * d2).sqrt() * (1.0 / 3f32.sqrt()),
    }
}

/// Distances between consecutive pixels of two packed rows.
#[multiversion(targets = "simd")]
fn row_distances(anchor: &[f32], test: &[f32], kind: ColorDistance, out: &mut [f32]) {
    debug_assert_eq!(anchor.len(), test.len());
    for ((a, t), o) in anchor
        .chunks_exact(3)
        .zip(test.chunks_exact(3))
        .zip(out.iter_mut())
    {
        *o = color_diff(a, t, kind);
    }
}

fn frame_row(frame: &FeatureFrame, y: usize) -> &[f32] {
    &frame.data[3 * frame.width * y..3 * frame.width * (y + 1)]
}

/// Weights of the right, bottom, bottom-left and bottom-right edges of row `y`, indexed by
/// the pixel the edge starts at.
struct SpatialRowWeights {
    right: Vec<f32>,
    bottom: Vec<f32>,
    bottom_left: Vec<f32>,
    bottom_right: Vec<f32>,
}

fn spatial_row_weights(frame: &FeatureFrame, y: usize, kind: ColorDistance) -> SpatialRowWeights {
    let w = frame.width;
    let row = frame_row(frame, y);
    let mut weights = SpatialRowWeights {
        right: vec![0.0; w],
        bottom: vec![0.0; w],
        bottom_left: vec![0.0; w],
        bottom_right: vec![0.0; w],
    };
    if w > 1 {
        row_distances(&row[..3 * (w - 1)], &row[3..], kind, &mut weights.right[..w - 1]);
    }
    if y + 1 < frame.height {
        let below = frame_row(frame, y + 1);
        row_distances(row, below, kind, &mut weights.bottom);
        if w > 1 {
            row_distances(&row[3..], &below[..3 * (w - 1)], kind, &mut weights.bottom_left[1..]);
            row_distances(&row[..3 * (w - 1)], &below[3..], kind, &mut weights.bottom_right[..w - 1]);
        }
    }
    weights
}

/// Edges from pixel `(x, y)` of the current frame to the 3x3 window around `(px, py)` in the
/// previous frame, in scan order.
#[inline]
#[allow(clippy::too_many_arguments)]
fn local_temporal_edges(
    current: &FeatureFrame,
    previous: &FeatureFrame,
    (x, y): (usize, usize),
    (px, py): (usize, usize),
    curr_idx: u32,
    prev_base: u32,
    kind: ColorDistance,
    edges: &mut Vec<(u32, u32, f32)>,
) {
    let (w, h) = (previous.width, previous.height);
    let anchor = current.pixel(x, y);
    let y_range = py.saturating_sub(1)..(py + 2).min(h);
    for ny in y_range {
        for nx in px.saturating_sub(1)..(px + 2).min(w) {
            let weight = color_diff(anchor, previous.pixel(nx, ny), kind);
            edges.push((curr_idx, prev_base + (ny * w + nx) as u32, weight));
        }
    }
}

/// Same-id neighbor offsets in a padded id image.
fn neighbor_offsets(stride: isize) -> ([isize; 8], [isize; 4]) {
    (
        [-stride - 1, -stride, -stride + 1, -1, 1, stride - 1, stride, stride + 1],
        [-stride, -1, 1, stride],
    )
}

pub struct DenseSegmentationGraph {
    graph: SegmentationGraph,
    frame_width: usize,
    frame_height: usize,
    max_frames: usize,
    num_frames: usize,
    color_distance: ColorDistance,
    /// Frames whose nodes carry constraints, ascending.
    constrained_slices: Vec<usize>,
    /// Constraint id to the last skeleton node and its frame.
    skeleton_temporal_map: HashMap<i32, (u32, usize)>,
}

impl DenseSegmentationGraph {
    pub fn new(
        param_k: f32,
        frame_width: usize,
        frame_height: usize,
        max_frames: usize,
        color_distance: ColorDistance,
    ) -> Result<Self> {
        if frame_width == 0 || frame_height == 0 || max_frames == 0 {
            return Err(Error::InvalidConfig(format!(
                "empty pixel graph {frame_width}x{frame_height}x{max_frames}"
            )));
        }
        if (frame_width * frame_height * (max_frames + 1)) as u64 >= u32::MAX as u64 {
            return Err(Error::InvalidConfig(format!(
                "{max_frames} frames of {frame_width}x{frame_height} exceed the node capacity"
            )));
        }
        let mut graph =
            SegmentationGraph::new(param_k, 1.0, NUM_BUCKETS, SKIP_BUCKETS, 2 * max_frames - 1)?;
        graph.reserve_nodes(frame_width * frame_height * max_frames);
        Ok(Self {
            graph,
            frame_width,
            frame_height,
            max_frames,
            num_frames: 0,
            color_distance,
            constrained_slices: Vec::new(),
            skeleton_temporal_map: HashMap::new(),
        })
    }

    pub fn num_frames(&self) -> usize {
        self.num_frames
    }

    pub fn max_frames(&self) -> usize {
        self.max_frames
    }

    pub fn graph(&self) -> &SegmentationGraph {
        &self.graph
    }

    pub fn all_bucket_lists(&self) -> Vec<usize> {
        (0..self.graph.num_bucket_lists()).collect()
    }

    fn frame_size(&self) -> usize {
        self.frame_width * self.frame_height
    }

    fn check_frame(&self, width: usize, height: usize) -> Result<()> {
        if width != self.frame_width || height != self.frame_height {
            return Err(Error::DimensionMismatch {
                expected: self.frame_size(),
                actual: width * height,
            });
        }
        if self.num_frames >= self.max_frames {
            return Err(Error::InvalidState("pixel graph frame capacity exceeded"));
        }
        Ok(())
    }

    /// Adds the nodes and spatial edges of the next frame.
    pub fn add_frame(&mut self, frame: &FeatureFrame) -> Result<()> {
        self.check_frame(frame.width, frame.height)?;
        for _ in 0..self.frame_size() {
            self.graph.add_region(1, -1);
        }
        self.add_spatial_edges(frame);
        self.num_frames += 1;
        Ok(())
    }

    /// Adds the next frame with every pixel constrained to the region covering it in
    /// `constraint`, plus skeleton edges forcing each constrained region to merge.
    pub fn add_frame_constrained(
        &mut self,
        frame: &FeatureFrame,
        constraint: &SegmentationRecord,
    ) -> Result<()> {
        self.check_frame(frame.width, frame.height)?;
        let ids = constraint.render_id_image()?;
        if ids.width != self.frame_width || ids.height != self.frame_height {
            return Err(Error::DimensionMismatch {
                expected: self.frame_size(),
                actual: ids.width * ids.height,
            });
        }
        self.constrained_slices.push(self.num_frames);
        for id in ids.data.iter() {
            self.graph.add_region(1, *id);
        }
        self.add_spatial_edges(frame);
        self.add_skeleton_edges(constraint);
        self.num_frames += 1;
        Ok(())
    }

    fn add_spatial_edges(&mut self, frame: &FeatureFrame) {
        let (w, h) = (self.frame_width, self.frame_height);
        let base = (self.num_frames * w * h) as u32;
        let list = 2 * self.num_frames;
        let kind = self.color_distance;
        let rows: Vec<SpatialRowWeights> = (0..h)
            .into_par_iter()
            .map(|y| spatial_row_weights(frame, y, kind))
            .collect();

        let w32 = w as u32;
        for (y, weights) in rows.iter().enumerate() {
            let row_idx = base + (y * w) as u32;
            for x in 0..w {
                let cur = row_idx + x as u32;
                if x + 1 < w {
                    self.graph.add_edge(cur, cur + 1, weights.right[x], list);
                }
                if y + 1 < h {
                    self.graph.add_edge(cur, cur + w32, weights.bottom[x], list);
                    if x > 0 {
                        self.graph.add_edge(cur, cur + w32 - 1, weights.bottom_left[x], list);
                    }
                    if x + 1 < w {
                        self.graph.add_edge(cur, cur + w32 + 1, weights.bottom_right[x], list);
                    }
                }
            }
        }
    }

    fn add_skeleton_edges(&mut self, constraint: &SegmentationRecord) {
        let w = self.frame_width as u32;
        let base = (self.frame_size() * self.num_frames) as u32;
        let list = 2 * self.num_frames;
        for region in &constraint.regions {
            let mut prev: Option<u32> = None;
            for s in &region.raster.scan_inter {
                let curr = base + s.y as u32 * w + s.left_x as u32;
                if let Some(prev) = prev {
                    self.graph.add_edge(prev, curr, VIRTUAL_EDGE_WEIGHT, list);
                }
                prev = Some(curr);
            }
            let Some(last) = prev else {
                continue;
            };
            let constraint_id = self.graph.node(last).constraint_id;
            if let Some(&(node, frame)) = self.skeleton_temporal_map.get(&constraint_id) {
                if frame < self.num_frames {
                    self.graph.add_edge(node, last, VIRTUAL_EDGE_WEIGHT, list - 1);
                }
            }
            self.skeleton_temporal_map
                .insert(constraint_id, (last, self.num_frames));
        }
    }

    /// Connects the most recent frame to its predecessor through a 3x3 window, displaced along
    /// `flow` if given.
    pub fn connect_temporally(
        &mut self,
        current: &FeatureFrame,
        previous: &FeatureFrame,
        flow: Option<&FlowField>,
    ) -> Result<()> {
        if self.num_frames < 2 {
            return Err(Error::InvalidState(
                "temporal edges require at least two frames",
            ));
        }
        let (w, h) = (self.frame_width, self.frame_height);
        for (fw, fh) in [
            (current.width, current.height),
            (previous.width, previous.height),
        ]
        .into_iter()
        .chain(flow.map(|f| (f.width(), f.height())))
        {
            if fw != w || fh != h {
                return Err(Error::DimensionMismatch {
                    expected: w * h,
                    actual: fw * fh,
                });
            }
        }
        let frame = self.num_frames - 1;
        let curr_base = (frame * w * h) as u32;
        let prev_base = curr_base - (w * h) as u32;
        let list = 2 * frame - 1;
        let kind = self.color_distance;

        let rows: Vec<Vec<(u32, u32, f32)>> = (0..h)
            .into_par_iter()
            .map(|y| {
                let mut edges = Vec::with_capacity(9 * w);
                for x in 0..w {
                    let prev = match flow {
                        Some(flow) => {
                            let px = (x as f32 + flow.flow_x[(x, y)]) as i64;
                            let py = (y as f32 + flow.flow_y[(x, y)]) as i64;
                            (
                                px.clamp(0, w as i64 - 1) as usize,
                                py.clamp(0, h as i64 - 1) as usize,
                            )
                        }
                        None => (x, y),
                    };
                    let curr_idx = curr_base + (y * w + x) as u32;
                    local_temporal_edges(
                        current, previous, (x, y), prev, curr_idx, prev_base, kind, &mut edges,
                    );
                }
                edges
            })
            .collect();

        for (r1, r2, weight) in rows.into_iter().flatten() {
            self.graph.add_edge(r1, r2, weight, list);
        }
        Ok(())
    }

    pub fn segment_graph(&mut self, use_skip_buckets: bool, force_constraints: bool) -> Result<()> {
        let lists = self.all_bucket_lists();
        self.graph
            .segment_graph(&lists, use_skip_buckets, force_constraints)
    }

    /// Segments every frame on its spatial edges only.
    pub fn segment_graph_spatially(&mut self) -> Result<()> {
        let lists: Vec<usize> = (0..self.num_frames).map(|f| 2 * f).collect();
        self.graph.segment_graph(&lists, false, false)
    }

    pub fn merge_small_regions(&mut self, min_region_size: usize, discard_redundant_edges: bool) {
        let lists = self.all_bucket_lists();
        self.graph.merge_small_regions(
            min_region_size.min(u32::MAX as usize) as u32,
            &lists,
            discard_redundant_edges,
            None,
        );
    }

    pub fn assign_region_ids(&mut self) -> (Vec<RegionInformation>, HashMap<u32, usize>) {
        self.graph.assign_region_ids(None)
    }

    /// Redirects spatial fragments smaller than `min_region_size` to the space-time region
    /// of their smallest sufficiently large spatial neighbor.
    pub fn spatial_cleanup_step(&mut self, min_region_size: u32) -> Result<()> {
        self.graph.flatten(true);
        let mut redirected = 0usize;
        for frame in 0..self.num_frames {
            redirected += self.spatial_cleanup_frame(min_region_size, frame)?;
        }
        debug!("Spatial cleanup redirected {redirected} pixels");
        Ok(())
    }

    fn spatial_cleanup_frame(&mut self, min_region_size: u32, frame: usize) -> Result<usize> {
        let (w, h) = (self.frame_width, self.frame_height);
        let offset = frame * w * h;

        // Frame view: spatial components of equal space-time representatives.
        let mut reps = Array2D::from_fill(-1i32, w, h);
        for (i, rep) in reps.data.iter_mut().enumerate() {
            *rep = self.graph.node((offset + i) as u32).parent as i32;
        }
        let components = label_components(&reps)?;
        let corresponding: Vec<u32> = components
            .component_leaders
            .iter()
            .map(|leader| reps.data[*leader as usize] as u32)
            .collect();
        let sizes = &components.num_component_members;
        let assignment = &components.component_assignment;

        // Spatial component to the representative it is redirected to.
        let mut merge_map: HashMap<u32, u32> = HashMap::new();
        let list = 2 * frame;
        let buckets = std::mem::take(&mut self.graph.bucket_lists[list]);
        for bucket in &buckets[..buckets.len() - 1] {
            for e in bucket {
                let mut c1 = assignment[e.region_1 as usize - offset];
                let mut c2 = assignment[e.region_2 as usize - offset];
                if c1 == c2 {
                    continue;
                }
                if sizes[c1 as usize] > sizes[c2 as usize] {
                    std::mem::swap(&mut c1, &mut c2);
                }
                let (sz1, sz2) = (sizes[c1 as usize], sizes[c2 as usize]);
                if sz1 >= min_region_size || sz2 < min_region_size || merge_map.contains_key(&c1) {
                    continue;
                }
                let own = corresponding[c1 as usize];
                let parent = self.graph.get_region(corresponding[c2 as usize]);
                let own_constraint = self.graph.node(own).constraint_id;
                let parent_constraint = self.graph.node(parent).constraint_id;
                if own_constraint < 0 || parent_constraint < 0 || own_constraint == parent_constraint {
                    merge_map.insert(c1, parent);
                    self.graph.nodes[parent as usize].size += sz1;
                    let old = self.graph.get_region(own);
                    let old_node = &mut self.graph.nodes[old as usize];
                    old_node.size = old_node.size.saturating_sub(sz1);
                }
            }
        }
        self.graph.bucket_lists[list] = buckets;

        let mut redirected = 0;
        for (i, component) in assignment.iter().enumerate() {
            if sizes[*component as usize] >= min_region_size {
                continue;
            }
            if let Some(parent) = merge_map.get(component) {
                self.graph.nodes[offset + i].parent = *parent;
                redirected += 1;
            }
        }
        Ok(redirected)
    }

    /// Rasterizes the result into `regions`, indexed through `map` from representative.
    ///
    /// Unconstrained frames are optionally cleaned from thin structures and diagonal-only
    /// connections first, the resulting size changes are applied to the regions.
    pub fn obtain_scanline_rep(
        &mut self,
        regions: &mut [RegionInformation],
        map: &HashMap<u32, usize>,
        thin_structure_suppression: bool,
        enforce_n4_connectivity: bool,
    ) -> Result<()> {
        let (w, h) = (self.frame_width, self.frame_height);
        let stride = w + 2;
        for region in regions.iter_mut() {
            region.raster.slices.clear();
        }
        let mut padded = Array2D::from_fill(-1i32, stride, h + 2);
        let mut frame_ids: IdImage = Array2D::from_fill(-1i32, w, h);
        let mut size_adjust: HashMap<i32, i64> = HashMap::new();

        for t in 0..self.num_frames {
            let base = t * w * h;
            for y in 0..h {
                for x in 0..w {
                    let rep = self.graph.get_region((base + y * w + x) as u32);
                    padded[(x + 1, y + 1)] = rep as i32;
                }
            }

            if self.constrained_slices.binary_search(&t).is_err() {
                if thin_structure_suppression {
                    thin_structure_suppression_pass(&mut padded, w, h, &mut size_adjust);
                }
                if enforce_n4_connectivity {
                    enforce_n4_connectivity_pass(&mut padded, w, h, &mut size_adjust);
                }
            }

            for y in 0..h {
                let src = &padded.get_row(y + 1)[1..=w];
                frame_ids.get_row_mut(y).copy_from_slice(src);
            }
            let mut missing = false;
            scan_id_image(&frame_ids, |id, interval| {
                let Some(&idx) = map.get(&(id as u32)) else {
                    missing = true;
                    return;
                };
                let raster = &mut regions[idx].raster;
                match raster.slices.last_mut() {
                    Some((frame, slice)) if *frame == t => slice.push(interval),
                    _ => {
                        let mut slice = Rasterization::default();
                        slice.push(interval);
                        raster.slices.push((t, slice));
                    }
                }
            });
            if missing {
                return Err(Error::InvalidState("representative without region"));
            }
        }

        for (id, delta) in size_adjust {
            let idx = *map
                .get(&(id as u32))
                .ok_or(Error::InvalidState("size adjustment for unknown region"))?;
            let size = regions[idx].size as i64 + delta;
            regions[idx].size = size.max(0) as usize;
        }
        info!(
            "Rasterized {} regions over {} frames",
            regions.len(),
            self.num_frames
        );
        Ok(())
    }
}

/// Swaps pixels with at most two same-id 8-neighbors to an id seen twice in their
/// 4-neighborhood, then revisits the former same-id neighbors.
fn thin_structure_suppression_pass(
    padded: &mut IdImage,
    w: usize,
    h: usize,
    size_adjust: &mut HashMap<i32, i64>,
) {
    let stride = padded.width as isize;
    let (n8, n4) = neighbor_offsets(stride);
    let mut stack: Vec<usize> = Vec::new();
    for y in 0..h.saturating_sub(1) {
        for x in 0..w {
            stack.push(padded.get_index(x + 1, y + 1));
            while let Some(pos) = stack.pop() {
                let ids = &mut padded.data;
                let region_id = ids[pos];
                let at = |k: isize| ids[(pos as isize + k) as usize];
                let num_neighbors = n8.iter().filter(|k| at(**k) == region_id).count();
                if num_neighbors > 2 {
                    continue;
                }
                let mut votes: Vec<i32> = Vec::with_capacity(4);
                let mut swap_to = -1;
                for k in n4 {
                    let n_id = at(k);
                    if n_id != -1 && n_id != region_id {
                        match votes.binary_search(&n_id) {
                            Ok(_) => swap_to = n_id,
                            Err(p) => votes.insert(p, n_id),
                        }
                    }
                }
                if swap_to < 0 {
                    continue;
                }
                *size_adjust.entry(region_id).or_default() -= 1;
                *size_adjust.entry(swap_to).or_default() += 1;
                ids[pos] = swap_to;
                // Depth first, first neighbor on top.
                for k in n8.iter().rev() {
                    let n = (pos as isize + k) as usize;
                    if ids[n] == region_id {
                        stack.push(n);
                    }
                }
            }
        }
    }
}

/// Fills the bottom pixel where a region is only connected diagonally downwards.
fn enforce_n4_connectivity_pass(
    padded: &mut IdImage,
    w: usize,
    h: usize,
    size_adjust: &mut HashMap<i32, i64>,
) {
    let stride = padded.width;
    let ids = &mut padded.data;
    for y in 0..h.saturating_sub(1) {
        for x in 0..w {
            let pos = (y + 1) * stride + x + 1;
            let below = pos + stride;
            let region_id = ids[pos];
            for (diagonal, side) in [(below - 1, pos - 1), (below + 1, pos + 1)] {
                if ids[diagonal] == region_id && ids[side] != region_id && ids[below] != region_id {
                    *size_adjust.entry(ids[below]).or_default() -= 1;
                    *size_adjust.entry(region_id).or_default() += 1;
                    ids[below] = region_id;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rasterization::ScanInterval;

    fn init() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    fn frame_from_gray(values: &[u8], w: usize, h: usize) -> FeatureFrame {
        FeatureFrame::from_fn(w, h, |x, y| {
            let v = values[y * w + x] as f32 / 255.0;
            [v, v, v]
        })
    }

    fn segment(graph: &mut DenseSegmentationGraph, min_size: usize) -> Vec<RegionInformation> {
        graph.segment_graph(true, true).unwrap();
        graph.merge_small_regions(min_size, true);
        let (mut regions, map) = graph.assign_region_ids();
        graph
            .obtain_scanline_rep(&mut regions, &map, false, false)
            .unwrap();
        regions
    }

    fn block_frame() -> FeatureFrame {
        let mut gray = vec![255u8; 16];
        for (x, y) in [(0, 0), (1, 0), (0, 1), (1, 1)] {
            gray[y * 4 + x] = 0;
        }
        frame_from_gray(&gray, 4, 4)
    }

    #[test]
    fn black_block_on_white() {
        init();
        let mut graph = DenseSegmentationGraph::new(0.02, 4, 4, 1, ColorDistance::L2).unwrap();
        graph.add_frame(&block_frame()).unwrap();
        let regions = segment(&mut graph, 1);
        assert_eq!(regions.len(), 2);
        let black = regions.iter().find(|r| r.size == 4).unwrap();
        let white = regions.iter().find(|r| r.size == 12).unwrap();
        assert_eq!(black.neighbor_idx, vec![white.index]);
        assert_eq!(white.neighbor_idx, vec![black.index]);
        assert_eq!(
            black.raster.slice(0).unwrap().scan_inter,
            vec![ScanInterval::new(0, 0, 1), ScanInterval::new(1, 0, 1)]
        );
        assert_eq!(
            white.raster.slice(0).unwrap().scan_inter,
            vec![
                ScanInterval::new(0, 2, 3),
                ScanInterval::new(1, 2, 3),
                ScanInterval::new(2, 0, 3),
                ScanInterval::new(3, 0, 3)
            ]
        );
    }

    #[test]
    fn temporal_edges_join_frames() {
        init();
        let mut graph = DenseSegmentationGraph::new(0.02, 4, 4, 2, ColorDistance::L1).unwrap();
        let frame = block_frame();
        graph.add_frame(&frame).unwrap();
        assert!(graph.connect_temporally(&frame, &frame, None).is_err());
        graph.add_frame(&frame).unwrap();
        let flow = FlowField::zero(4, 4);
        graph.connect_temporally(&frame, &frame, Some(&flow)).unwrap();
        assert!(graph.add_frame(&frame).is_err());
        let regions = segment(&mut graph, 1);
        assert_eq!(regions.len(), 2);
        let mut sizes: Vec<usize> = regions.iter().map(|r| r.size).collect();
        sizes.sort_unstable();
        assert_eq!(sizes, vec![8, 24]);
        for r in &regions {
            assert_eq!(r.raster.frame_bounds(), Some((0, 1)));
            assert_eq!(r.raster.area(), r.size);
        }
    }

    #[test]
    fn constrained_frame_reproduces_prior_regions() {
        init();
        let mut graph = DenseSegmentationGraph::new(0.02, 4, 4, 1, ColorDistance::L2).unwrap();
        // Uniform frame, constraint splits it into left and right halves.
        let frame = frame_from_gray(&[128u8; 16], 4, 4);
        let left: Vec<bool> = (0..16).map(|i| i % 4 < 2).collect();
        let right: Vec<bool> = left.iter().map(|v| !v).collect();
        let record = SegmentationRecord::from_masks(4, 4, &[(7, &left), (9, &right)]);
        graph.add_frame_constrained(&frame, &record).unwrap();
        let regions = segment(&mut graph, 1);
        assert_eq!(regions.len(), 2);
        for r in &regions {
            assert_eq!(r.size, 8);
            assert!(r.constrained_id == 7 || r.constrained_id == 9);
        }
    }

    #[test]
    fn thin_structure_is_absorbed() {
        // Single-pixel diagonal line through a uniform region.
        let (w, h) = (5, 5);
        let mut padded = Array2D::from_fill(-1i32, w + 2, h + 2);
        for y in 0..h {
            for x in 0..w {
                padded[(x + 1, y + 1)] = if x == y { 2 } else { 1 };
            }
        }
        let mut adjust = HashMap::new();
        thin_structure_suppression_pass(&mut padded, w, h, &mut adjust);
        let remaining = padded.data.iter().filter(|v| **v == 2).count();
        assert!(remaining < 5);
        assert_eq!(adjust[&2], remaining as i64 - 5);
        assert_eq!(adjust[&1], 5 - remaining as i64);
    }

    #[test]
    fn diagonal_connection_gets_filled() {
        let (w, h) = (3, 2);
        let mut padded = Array2D::from_fill(-1i32, w + 2, h + 2);
        let ids = [[1, 2, 2], [2, 1, 2]];
        for y in 0..h {
            for x in 0..w {
                padded[(x + 1, y + 1)] = ids[y][x];
            }
        }
        let mut adjust = HashMap::new();
        enforce_n4_connectivity_pass(&mut padded, w, h, &mut adjust);
        assert_eq!(padded[(1, 2)], 1);
        assert_eq!(adjust[&1], 1);
        assert_eq!(adjust[&2], -1);
    }

    #[test]
    fn spatial_cleanup_keeps_sizes_consistent() {
        init();
        let (w, h) = (12, 8);
        let gray: Vec<u8> = (0..w * h)
            .map(|i| (if (i % w) < 6 { 40 } else { 200 }) + ((i * 37) % 11) as u8)
            .collect();
        let frame = frame_from_gray(&gray, w, h);
        let mut graph = DenseSegmentationGraph::new(0.05, w, h, 2, ColorDistance::L2).unwrap();
        graph.add_frame(&frame).unwrap();
        graph.add_frame(&frame).unwrap();
        graph.connect_temporally(&frame, &frame, None).unwrap();
        graph.segment_graph(true, true).unwrap();
        graph.merge_small_regions(4, false);
        graph.spatial_cleanup_step(30).unwrap();
        graph.merge_small_regions(4, true);
        let (mut regions, map) = graph.assign_region_ids();
        graph
            .obtain_scanline_rep(&mut regions, &map, true, true)
            .unwrap();
        let total: usize = regions.iter().map(|r| r.raster.area()).sum();
        assert_eq!(total, 2 * w * h);
        for r in &regions {
            assert_eq!(r.raster.area(), r.size);
        }
    }
}

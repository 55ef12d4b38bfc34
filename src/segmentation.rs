//! Segmentation of one chunk of frames.
//!
//! A [`Segmentation`] either owns a pixel graph that is turned into the oversegmentation, or
//! is fed an existing oversegmentation frame by frame. Either way the result is a hierarchy of
//! region levels that is trimmed to the emitted frame interval, given stable ids and written
//! out as per-frame records. Region identity crosses chunk boundaries through a
//! [`CounterpartSnapshot`] of the previous chunk.

use crate::agglomeration::{EdgeWeightMap, RegionAgglomerationGraph, Skeleton};
use crate::arrays::{FeatureFrame, FlowField};
use crate::common::{ColorDistance, SegmentationConfig};
use crate::dense_graph::DenseSegmentationGraph;
use crate::descriptor::{DescriptorExtractor, RegionDistance};
use crate::error::{Error, Result};
use crate::io::{
    DescriptorRecord, HierarchyLevelRecord, HierarchyRegionRecord, RegionRecord, SegmentationRecord,
};
use crate::rasterization::Rasterization3D;
use crate::region::{insert_sorted_uniquely, RegionInformation, RegionStatus};
use hashbrown::{HashMap, HashSet};
use log::{debug, error, info, warn};

const AGGLOMERATION_BUCKETS: usize = 2048;
/// Spatial fragments below this many pixels are redirected by the cleanup step.
const SPATIAL_CLEANUP_SIZE: u32 = 30;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SegmentationState {
    /// Frames or oversegmentation slices are being added.
    OverSegmenting,
    /// A hierarchy exists and may be trimmed.
    HierarchicalMerging,
    /// Ids are final, counterparts can be exported.
    ConstrainedForNextChunk,
    /// At least one frame was retrieved.
    Emitted,
}

/// Region ids of a finished chunk, keyed by oversegmentation id. Each chain starts with the
/// id of the base region followed by the ids of its ancestors.
#[derive(Clone, Debug, Default)]
pub struct CounterpartSnapshot {
    chains: HashMap<i32, Vec<i32>>,
}

impl CounterpartSnapshot {
    pub fn get(&self, oversegmentation_id: i32) -> Option<&[i32]> {
        self.chains.get(&oversegmentation_id).map(Vec::as_slice)
    }

    pub fn len(&self) -> usize {
        self.chains.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chains.is_empty()
    }
}

pub struct Segmentation {
    param_k: f32,
    frame_width: usize,
    frame_height: usize,
    chunk_id: usize,
    frame_number: usize,
    num_base_hierarchies: usize,
    state: SegmentationState,
    dense_graph: Option<DenseSegmentationGraph>,
    levels: Vec<Vec<RegionInformation>>,
    /// Oversegmentation id to base level index.
    region_index: HashMap<i32, usize>,
    /// Oversegmentation ids of the most recent base hierarchy level.
    regions_added_to_chunk: HashSet<i32>,
    is_constrained: bool,
    assigned_constrained_ids: bool,
    assigned_unique_ids: bool,
}

impl Segmentation {
    pub fn new(param_k: f32, frame_width: usize, frame_height: usize, chunk_id: usize) -> Self {
        Self {
            param_k,
            frame_width,
            frame_height,
            chunk_id,
            frame_number: 0,
            num_base_hierarchies: 0,
            state: SegmentationState::OverSegmenting,
            dense_graph: None,
            levels: Vec::new(),
            region_index: HashMap::new(),
            regions_added_to_chunk: HashSet::new(),
            is_constrained: false,
            assigned_constrained_ids: false,
            assigned_unique_ids: false,
        }
    }

    pub fn chunk_id(&self) -> usize {
        self.chunk_id
    }

    pub fn state(&self) -> SegmentationState {
        self.state
    }

    pub fn num_frames_added(&self) -> usize {
        self.frame_number
    }

    pub fn num_base_hierarchies_added(&self) -> usize {
        self.num_base_hierarchies
    }

    pub fn computed_hierarchy_levels(&self) -> usize {
        self.levels.len()
    }

    pub fn levels(&self) -> &[Vec<RegionInformation>] {
        &self.levels
    }

    fn expect_state(&self, state: SegmentationState, msg: &'static str) -> Result<()> {
        if self.state != state {
            return Err(Error::InvalidState(msg));
        }
        Ok(())
    }

    /// Allocates the pixel graph for up to `max_frames` frames.
    pub fn over_segmentation_size_hint(
        &mut self,
        max_frames: usize,
        color_distance: ColorDistance,
    ) -> Result<()> {
        if self.dense_graph.is_none() {
            self.dense_graph = Some(DenseSegmentationGraph::new(
                self.param_k,
                self.frame_width,
                self.frame_height,
                max_frames,
                color_distance,
            )?);
        }
        Ok(())
    }

    fn dense_graph_mut(&mut self) -> Result<&mut DenseSegmentationGraph> {
        self.dense_graph
            .as_mut()
            .ok_or(Error::InvalidState("pixel graph not allocated"))
    }

    /// Adds a frame to the pixel graph, constrained to `constraint` if given.
    pub fn add_frame(
        &mut self,
        frame: &FeatureFrame,
        constraint: Option<&SegmentationRecord>,
    ) -> Result<()> {
        self.expect_state(SegmentationState::OverSegmenting, "frames added after segmenting")?;
        let graph = self.dense_graph_mut()?;
        match constraint {
            Some(constraint) => graph.add_frame_constrained(frame, constraint)?,
            None => graph.add_frame(frame)?,
        }
        self.frame_number += 1;
        Ok(())
    }

    /// Connects the most recently added frame to the one before.
    pub fn connect_temporally(
        &mut self,
        current: &FeatureFrame,
        previous: &FeatureFrame,
        flow: Option<&FlowField>,
    ) -> Result<()> {
        self.dense_graph_mut()?
            .connect_temporally(current, previous, flow)
    }

    /// Segments the pixel graph into the base level and releases the graph.
    pub fn run_over_segmentation(
        &mut self,
        min_region_size: usize,
        config: &SegmentationConfig,
    ) -> Result<()> {
        let mut graph = self
            .dense_graph
            .take()
            .ok_or(Error::InvalidState("pixel graph not allocated"))?;
        if config.two_stage_oversegment {
            graph.segment_graph_spatially()?;
        }
        graph.segment_graph(true, true)?;

        if config.spatial_cleanup_step {
            graph.merge_small_regions(min_region_size, false);
            graph.spatial_cleanup_step(SPATIAL_CLEANUP_SIZE)?;
        }
        graph.merge_small_regions(min_region_size, true);
        let (mut regions, map) = graph.assign_region_ids();
        graph.obtain_scanline_rep(
            &mut regions,
            &map,
            config.thin_structure_suppression,
            config.enforce_n4_connectivity,
        )?;
        info!(
            "Chunk {}: oversegmentation of {} frames has {} regions",
            self.chunk_id,
            graph.num_frames(),
            regions.len()
        );
        self.levels = vec![regions];
        self.state = SegmentationState::HierarchicalMerging;
        // Spatial cleanup can leave regions without pixels.
        self.constrain_segmentation_to_frame_interval(0, self.frame_number);
        Ok(())
    }

    /// Adds the regions of an oversegmentation chunk to the base level. Regions seen before
    /// grow, regions of the previous chunk that are gone get their descriptors finalized.
    ///
    /// Regions listed in `counterparts` remember their oversegmentation id so constraints can
    /// be pulled later. Returns the ids of all regions of `level`.
    pub fn initialize_base_hierarchy_level(
        &mut self,
        level: &HierarchyLevelRecord,
        extractors: &[DescriptorExtractor],
        counterparts: Option<&HashSet<i32>>,
    ) -> Result<HashSet<i32>> {
        self.expect_state(
            SegmentationState::OverSegmenting,
            "oversegmentation added after segmenting",
        )?;
        if self.levels.is_empty() {
            self.levels.push(Vec::new());
        }
        let present: HashSet<i32> = level.regions.iter().map(|r| r.id).collect();
        let base = &mut self.levels[0];

        let mut num_compacted = 0;
        for id in self.regions_added_to_chunk.difference(&present) {
            if let Some(&idx) = self.region_index.get(id) {
                base[idx].populating_descriptors_finished();
                num_compacted += 1;
            }
        }
        debug!("Compacted {num_compacted} regions");

        for region in &level.regions {
            match self.region_index.get(&region.id) {
                Some(&idx) => base[idx].size += region.size,
                None => {
                    let mut info = RegionInformation::new(base.len(), region.size);
                    info.add_descriptors(extractors);
                    info.counterpart = counterparts
                        .filter(|c| c.contains(&region.id))
                        .map(|_| region.id);
                    self.region_index.insert(region.id, base.len());
                    base.push(info);
                }
            }
        }

        for region in &level.regions {
            let idx = self.region_index[&region.id];
            for n in &region.neighbor_ids {
                let n_idx = *self.region_index.get(n).ok_or_else(|| {
                    Error::Format(format!(
                        "neighbor {n} of region {} is not part of the hierarchy",
                        region.id
                    ))
                })?;
                if n_idx != idx {
                    insert_sorted_uniquely(&mut base[idx].neighbor_idx, n_idx);
                    insert_sorted_uniquely(&mut base[n_idx].neighbor_idx, idx);
                }
            }
        }
        self.regions_added_to_chunk = present.clone();
        self.num_base_hierarchies += 1;
        Ok(present)
    }

    /// Adds one frame of oversegmentation, feeding every region slice to its descriptors.
    pub fn add_over_segmentation(
        &mut self,
        record: &SegmentationRecord,
        extractors: &[DescriptorExtractor],
    ) -> Result<()> {
        self.expect_state(
            SegmentationState::OverSegmenting,
            "oversegmentation added after segmenting",
        )?;
        let frame = self.frame_number;
        let base = self.levels.first_mut().ok_or(Error::MissingLevel(0))?;
        for region in &record.regions {
            let idx = *self.region_index.get(&region.id).ok_or_else(|| {
                Error::Format(format!(
                    "region {} has no hierarchy entry in chunk {}",
                    region.id, self.chunk_id
                ))
            })?;
            let info = &mut base[idx];
            if matches!(info.raster.slices.last(), Some((last, _)) if *last >= frame) {
                return Err(Error::InvalidState("rasterization slice inconsistency"));
            }
            info.add_slice(frame, region.raster.clone(), extractors)?;
        }
        self.frame_number += 1;
        Ok(())
    }

    /// Connects two base regions that do not share a boundary.
    pub fn add_over_segmentation_connection(&mut self, id_1: i32, id_2: i32) -> Result<()> {
        let lookup = |id: i32| {
            self.region_index
                .get(&id)
                .copied()
                .ok_or_else(|| Error::Format(format!("unknown region {id}")))
        };
        let (idx_1, idx_2) = (lookup(id_1)?, lookup(id_2)?);
        let base = self.levels.first_mut().ok_or(Error::MissingLevel(0))?;
        if idx_1 == idx_2 || !insert_sorted_uniquely(&mut base[idx_1].neighbor_idx, idx_2) {
            return Err(Error::InvalidState("regions are already connected"));
        }
        insert_sorted_uniquely(&mut base[idx_2].neighbor_idx, idx_1);
        Ok(())
    }

    /// Builds levels on top of the base level until at most `min_region_num` regions remain
    /// or no merge is possible.
    ///
    /// With `reduction` the first level merges down to `max_region_num` regions and keeps
    /// merged rasterizations.
    pub fn run_hierarchical_segmentation(
        &mut self,
        distance: &dyn RegionDistance,
        level_cutoff_fraction: f32,
        min_region_num: usize,
        max_region_num: usize,
        reduction: bool,
    ) -> Result<()> {
        if self.levels.is_empty() {
            return Err(Error::MissingLevel(0));
        }
        if self.levels.len() > 1 {
            return Err(Error::InvalidState("hierarchy already computed"));
        }
        info!(
            "Running hierarchical segmentation of chunk {} with {} frames",
            self.chunk_id, self.frame_number
        );
        self.levels[0]
            .iter_mut()
            .for_each(RegionInformation::populating_descriptors_finished);

        let mut edge_weights: Option<EdgeWeightMap> = None;
        let mut current = self.levels[0].len();
        while current > min_region_num {
            let level = self.levels.len() - 1;
            let mut graph =
                RegionAgglomerationGraph::new(1.0, AGGLOMERATION_BUCKETS, distance);
            if self.is_constrained {
                let (constraint_ids, skeleton) = self.setup_region_constraints(level);
                graph.add_region_edges_constrained(
                    &self.levels[level],
                    edge_weights.as_ref(),
                    &constraint_ids,
                    &skeleton,
                )?;
            } else {
                graph.add_region_edges(&self.levels[level], edge_weights.as_ref())?;
            }

            if level == 0 && reduction {
                let cutoff = (max_region_num.max(1) as f32 / current as f32).min(1.0);
                graph.segment_graph(&self.levels[level], true, cutoff)?;
            } else if graph.segment_graph(&self.levels[level], false, level_cutoff_fraction)? == 0 {
                error!("No merge possible for the current cutoff fraction, stopping at level {level}");
                break;
            }

            let (next, weights) = graph.obtain_segmentation_result(&mut self.levels[level])?;
            if next.len() <= 1 {
                warn!("Merging resulted in a single region");
            }
            current = next.len();
            edge_weights = Some(weights);
            self.levels.push(next);
            info!("Level {}: {current} regions", self.levels.len() - 1);
        }
        self.state = SegmentationState::HierarchicalMerging;
        Ok(())
    }

    /// Constraint id of every region of `level` and the regions sharing each constraint.
    ///
    /// A region is constrained if one of its base descendants reached through constrained
    /// children carries a counterpart chain at least `level + 1` entries deep.
    pub fn setup_region_constraints(&self, level: usize) -> (Vec<i32>, Skeleton) {
        let mut constraint_ids = Vec::with_capacity(self.levels[level].len());
        let mut skeleton = Skeleton::new();
        for region in &self.levels[level] {
            let constraint = self
                .constrained_base_descendant(level, region.index)
                .and_then(|b| self.levels[0][b].counterpart_region_ids.get(level).copied())
                .unwrap_or(-1);
            if constraint >= 0 {
                skeleton.entry(constraint).or_default().push(region.index);
            }
            constraint_ids.push(constraint);
        }
        (constraint_ids, skeleton)
    }

    fn constrained_base_descendant(&self, level: usize, index: usize) -> Option<usize> {
        let mut idx = index;
        for l in (1..=level).rev() {
            let lower = &self.levels[l - 1];
            idx = *self.levels[l][idx]
                .child_idx
                .iter()
                .find(|c| lower[**c].constrained_id >= 0)?;
        }
        (self.levels[0][idx].constrained_id >= 0).then_some(idx)
    }

    /// Snapshot of the assigned ids, consumed by the next chunk through
    /// [`Segmentation::pull_counterpart_segmentation_result`].
    pub fn counterpart_snapshot(&self) -> Result<CounterpartSnapshot> {
        if !self.assigned_unique_ids {
            return Err(Error::InvalidState("region ids not assigned"));
        }
        let base = self.levels.first().ok_or(Error::MissingLevel(0))?;
        let mut chains = HashMap::with_capacity(self.region_index.len());
        for (&id, &idx) in &self.region_index {
            let mut chain = Vec::with_capacity(self.levels.len());
            chain.push(base[idx].region_id);
            let mut parent = base[idx].parent_idx;
            for level in &self.levels[1..] {
                let Some(p) = parent else {
                    break;
                };
                chain.push(level[p].region_id);
                parent = level[p].parent_idx;
            }
            chains.insert(id, chain);
        }
        Ok(CounterpartSnapshot { chains })
    }

    /// Constrains every base region with a counterpart to the ids of the previous chunk.
    pub fn pull_counterpart_segmentation_result(
        &mut self,
        snapshot: &CounterpartSnapshot,
    ) -> Result<()> {
        let base = self.levels.first_mut().ok_or(Error::MissingLevel(0))?;
        let mut pulled = 0;
        for region in base.iter_mut() {
            let Some(chain) = region.counterpart.and_then(|id| snapshot.get(id)) else {
                continue;
            };
            let Some((&own, ancestors)) = chain.split_first() else {
                continue;
            };
            region.constrained_id = own;
            region.counterpart_region_ids = ancestors.to_vec();
            pulled += 1;
        }
        debug!("Pulled {pulled} counterparts into chunk {}", self.chunk_id);
        self.is_constrained = true;
        Ok(())
    }

    /// Flags regions without frames in `[lhs, rhs]`. They stay in memory but are not emitted.
    pub fn constrain_segmentation_to_frame_interval(&mut self, lhs: usize, rhs: usize) {
        let Some(base) = self.levels.first_mut() else {
            return;
        };
        let mut num_removed = 0;
        for region in base.iter_mut() {
            if region.raster.outside_interval(lhs, rhs) {
                region.region_status = RegionStatus::FlaggedForRemoval;
                num_removed += 1;
            }
        }
        for l in 1..self.levels.len() {
            let (lower, upper) = self.levels.split_at_mut(l);
            let lower = &lower[l - 1];
            for region in upper[0].iter_mut() {
                region.region_status = if region.child_idx.iter().any(|c| !lower[*c].is_flagged()) {
                    RegionStatus::Normal
                } else {
                    RegionStatus::FlaggedForRemoval
                };
            }
        }
        debug!("Flagged {num_removed} base regions outside of [{lhs}, {rhs}]");
    }

    /// Removes the area outside of `[lhs, rhs]` from all region sizes.
    pub fn adjust_region_area_to_frame_interval(&mut self, lhs: usize, rhs: usize) {
        let Some(base) = self.levels.first_mut() else {
            return;
        };
        let mut adjust: Vec<i64> = base
            .iter_mut()
            .map(|region| {
                let outside = region.raster.area_outside(lhs, rhs);
                region.size = region.size.saturating_sub(outside);
                -(outside as i64)
            })
            .collect();
        for level in self.levels.iter_mut().skip(1) {
            adjust = level
                .iter_mut()
                .map(|region| {
                    let delta: i64 = region.child_idx.iter().map(|c| adjust[*c]).sum();
                    region.size = (region.size as i64 + delta).max(0) as usize;
                    delta
                })
                .collect();
        }
    }

    /// Assigns output ids: the constraint id if `use_constrained_ids` and present, otherwise
    /// index plus the level's offset. Returns the next free id per level.
    pub fn assign_unique_region_ids(
        &mut self,
        use_constrained_ids: bool,
        region_id_offsets: &[i32],
    ) -> Result<Vec<i32>> {
        if region_id_offsets.len() < self.levels.len() {
            return Err(Error::DimensionMismatch {
                expected: self.levels.len(),
                actual: region_id_offsets.len(),
            });
        }
        let mut max_ids = Vec::with_capacity(region_id_offsets.len());
        for (level, offset) in self.levels.iter_mut().zip(region_id_offsets) {
            let mut max_id = -1;
            for region in level.iter_mut() {
                region.region_id = if use_constrained_ids && region.constrained_id >= 0 {
                    region.constrained_id
                } else {
                    region.index as i32 + offset
                };
                max_id = max_id.max(region.region_id);
            }
            max_ids.push((*offset).max(max_id + 1));
        }
        max_ids.extend_from_slice(&region_id_offsets[self.levels.len()..]);
        self.assigned_constrained_ids = use_constrained_ids;
        self.assigned_unique_ids = true;
        self.state = SegmentationState::ConstrainedForNextChunk;
        Ok(max_ids)
    }

    /// Drops the base level. The children of the next level are cleared.
    pub fn discard_bottom_level(&mut self) {
        if self.levels.len() <= 1 {
            warn!("Only one hierarchy level present, keeping it");
            return;
        }
        for region in self.levels[1].iter_mut() {
            region.child_idx.clear();
        }
        self.levels.remove(0);
        self.region_index.clear();
    }

    /// Merges base rasterizations into the next level and drops the base level, `num_levels`
    /// times.
    pub fn force_merge_levels(&mut self, num_levels: usize) -> Result<()> {
        for l in 0..num_levels {
            if self.levels.len() <= 1 {
                break;
            }
            info!("Force merge level {l} of {num_levels}");
            let (base, upper) = self.levels.split_at_mut(1);
            for region in upper[0].iter_mut() {
                let mut rasters: Vec<Rasterization3D> = region
                    .child_idx
                    .iter()
                    .map(|c| std::mem::take(&mut base[0][*c].raster))
                    .collect();
                if rasters.is_empty() {
                    return Err(Error::InvalidState("region without children"));
                }
                // Pairwise rounds keep the merged slices short.
                while rasters.len() > 1 {
                    rasters = rasters
                        .chunks(2)
                        .map(|pair| match pair {
                            [a, b] => Rasterization3D::merge(a, b),
                            [a] => a.clone(),
                            _ => unreachable!(),
                        })
                        .collect();
                }
                region.raster = rasters.pop().unwrap_or_default();
                region.child_idx.clear();
            }
            self.levels.remove(0);
            self.region_index.clear();
        }
        Ok(())
    }

    /// Builds the record of `frame`. The first frame also carries the hierarchy and, with
    /// `save_descriptors`, the descriptors of the base regions.
    pub fn retrieve_segmentation_3d(
        &mut self,
        frame: usize,
        save_descriptors: bool,
    ) -> Result<SegmentationRecord> {
        if self.levels.is_empty() {
            return Err(Error::MissingLevel(0));
        }
        if !self.assigned_unique_ids {
            let offsets = vec![0; self.levels.len()];
            self.assign_unique_region_ids(false, &offsets)?;
        }
        let mut record = SegmentationRecord::new(self.frame_width, self.frame_height, self.chunk_id);
        let base = &self.levels[0];
        for region in base.iter().filter(|r| !r.is_flagged()) {
            if let Some(slice) = region.raster.slice(frame) {
                if slice.is_empty() {
                    return Err(Error::InvalidState("empty rasterization slice"));
                }
                record
                    .regions
                    .push(RegionRecord::new(region.region_id, slice.clone()));
            }
        }
        if self.assigned_constrained_ids {
            record.regions.sort_by_key(|r| r.id);
        }
        if frame == 0 {
            if save_descriptors {
                record.descriptors = base
                    .iter()
                    .filter(|r| !r.is_flagged())
                    .map(|r| DescriptorRecord {
                        id: r.region_id,
                        descriptors: r.descriptors.clone(),
                    })
                    .collect();
            }
            record.hierarchy = self.hierarchy_records()?;
        }
        self.state = SegmentationState::Emitted;
        Ok(record)
    }

    fn hierarchy_records(&self) -> Result<Vec<HierarchyLevelRecord>> {
        let mut prev_bounds: HashMap<usize, (usize, usize)> = HashMap::new();
        let mut records = Vec::with_capacity(self.levels.len());
        for (l, level) in self.levels.iter().enumerate() {
            let mut bounds = HashMap::with_capacity(level.len());
            let mut regions = Vec::new();
            for region in level.iter().filter(|r| !r.is_flagged()) {
                let mut neighbor_ids: Vec<i32> = region
                    .neighbor_idx
                    .iter()
                    .map(|n| &level[*n])
                    .filter(|n| !n.is_flagged())
                    .map(|n| n.region_id)
                    .collect();
                let parent_id = match (self.levels.get(l + 1), region.parent_idx) {
                    (Some(upper), Some(parent)) => upper[parent].region_id,
                    _ => -1,
                };

                let mut child_ids = Vec::with_capacity(region.child_idx.len());
                let frame_bounds = if l > 0 && !region.child_idx.is_empty() {
                    let lower = &self.levels[l - 1];
                    let mut frame_bounds: Option<(usize, usize)> = None;
                    for c in &region.child_idx {
                        if lower[*c].is_flagged() {
                            continue;
                        }
                        child_ids.push(lower[*c].region_id);
                        let (start, end) = *prev_bounds
                            .get(c)
                            .ok_or(Error::InvalidState("child without frame bounds"))?;
                        frame_bounds = Some(frame_bounds.map_or((start, end), |(s, e)| {
                            (s.min(start), e.max(end))
                        }));
                    }
                    frame_bounds
                } else {
                    region.raster.frame_bounds()
                };
                let (start_frame, end_frame) =
                    frame_bounds.ok_or(Error::InvalidState("region without frames"))?;

                if self.assigned_constrained_ids {
                    neighbor_ids.sort_unstable();
                    child_ids.sort_unstable();
                }
                bounds.insert(region.index, (start_frame, end_frame));
                regions.push(HierarchyRegionRecord {
                    id: region.region_id,
                    size: region.size,
                    parent_id,
                    neighbor_ids,
                    child_ids,
                    start_frame,
                    end_frame,
                });
            }
            if self.assigned_constrained_ids {
                regions.sort_by_key(|r| r.id);
            }
            records.push(HierarchyLevelRecord { regions });
            prev_bounds = bounds;
        }
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arrays::LabFrame;
    use crate::descriptor::{AppearanceExtractor, SquaredOrDistance};
    use crate::rasterization::{Rasterization, ScanInterval};

    const HEIGHT: usize = 2;
    const DARK_BRIGHT: [bool; 8] = [false, false, false, false, true, true, true, true];

    fn init() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    /// One pixel wide vertical stripes, stripe `i` has oversegmentation id `i`.
    fn stripe_extractors(bright: &[bool]) -> Vec<DescriptorExtractor> {
        let w = bright.len();
        let mut rgb = Vec::with_capacity(w * HEIGHT * 3);
        for _ in 0..HEIGHT {
            for b in bright {
                rgb.extend_from_slice(if *b { &[220, 200, 60] } else { &[30, 20, 90] });
            }
        }
        vec![DescriptorExtractor::Appearance(AppearanceExtractor {
            lab: LabFrame::from_rgb8(&rgb, w, HEIGHT).unwrap(),
            luminance_bins: 6,
            color_bins: 8,
            window_size: None,
        })]
    }

    fn stripe_level(n: usize, frames: usize) -> HierarchyLevelRecord {
        let n = n as i32;
        HierarchyLevelRecord {
            regions: (0..n)
                .map(|i| HierarchyRegionRecord {
                    id: i,
                    size: HEIGHT * frames,
                    parent_id: -1,
                    neighbor_ids: [i - 1, i + 1]
                        .into_iter()
                        .filter(|neighbor| (0..n).contains(neighbor))
                        .collect(),
                    child_ids: vec![],
                    start_frame: 0,
                    end_frame: frames - 1,
                })
                .collect(),
        }
    }

    fn stripe_record(ids: &[i32]) -> SegmentationRecord {
        let mut record = SegmentationRecord::new(DARK_BRIGHT.len(), HEIGHT, 0);
        record.regions = ids
            .iter()
            .map(|id| {
                let raster = Rasterization {
                    scan_inter: (0..HEIGHT as i32)
                        .map(|y| ScanInterval::new(y, *id, *id))
                        .collect(),
                };
                RegionRecord::new(*id, raster)
            })
            .collect();
        record
    }

    fn all_ids() -> Vec<i32> {
        (0..DARK_BRIGHT.len() as i32).collect()
    }

    /// Stripe world of `frames` frames, segmented hierarchically.
    fn stripe_segmentation(frames: usize) -> Segmentation {
        let mut seg = Segmentation::new(0.0, DARK_BRIGHT.len(), HEIGHT, 0);
        let extractors = stripe_extractors(&DARK_BRIGHT);
        seg.initialize_base_hierarchy_level(&stripe_level(DARK_BRIGHT.len(), frames), &extractors, None)
            .unwrap();
        for _ in 0..frames {
            seg.add_over_segmentation(&stripe_record(&all_ids()), &extractors)
                .unwrap();
        }
        let distance = SquaredOrDistance { num_descriptors: 1 };
        seg.run_hierarchical_segmentation(&distance, 0.5, 2, 2000, true)
            .unwrap();
        seg
    }

    fn base_descendants(seg: &Segmentation, level: usize, idx: usize) -> Vec<usize> {
        if level == 0 {
            return vec![idx];
        }
        seg.levels()[level][idx]
            .child_idx
            .iter()
            .flat_map(|c| base_descendants(seg, level - 1, *c))
            .collect()
    }

    #[test]
    fn dense_oversegmentation_emits_records() {
        init();
        let frame = FeatureFrame::from_fn(4, 4, |x, y| {
            if x < 2 && y < 2 {
                [0.0; 3]
            } else {
                [1.0; 3]
            }
        });
        let mut seg = Segmentation::new(0.02, 4, 4, 3);
        seg.over_segmentation_size_hint(1, ColorDistance::L2).unwrap();
        seg.add_frame(&frame, None).unwrap();
        let config = SegmentationConfig {
            two_stage_oversegment: true,
            spatial_cleanup_step: false,
            ..Default::default()
        };
        seg.run_over_segmentation(1, &config).unwrap();
        assert_eq!(seg.state(), SegmentationState::HierarchicalMerging);
        assert!(seg.add_frame(&frame, None).is_err());

        let record = seg.retrieve_segmentation_3d(0, false).unwrap();
        assert_eq!(record.chunk_id, 3);
        assert_eq!(record.regions.len(), 2);
        let mut sizes: Vec<usize> = record.regions.iter().map(|r| r.moments.size).collect();
        sizes.sort_unstable();
        assert_eq!(sizes, vec![4, 12]);
        assert_eq!(record.hierarchy.len(), 1);
        for region in &record.hierarchy[0].regions {
            assert_eq!((region.start_frame, region.end_frame), (0, 0));
            assert_eq!(region.neighbor_ids.len(), 1);
            assert_eq!(region.parent_id, -1);
        }
        assert!(seg.retrieve_segmentation_3d(1, false).unwrap().regions.is_empty());
        assert_eq!(seg.state(), SegmentationState::Emitted);
    }

    #[test]
    fn unique_ids_use_offsets() {
        let mut seg = stripe_segmentation(1);
        let levels = seg.computed_hierarchy_levels();
        assert!(seg.assign_unique_region_ids(false, &[0]).is_err());
        let offsets: Vec<i32> = (0..levels as i32 + 1).map(|l| 100 * l).collect();
        let max_ids = seg.assign_unique_region_ids(false, &offsets).unwrap();
        assert_eq!(max_ids.len(), offsets.len());
        for (l, level) in seg.levels().iter().enumerate() {
            let ids: Vec<i32> = level.iter().map(|r| r.region_id).collect();
            assert_eq!(ids[0], offsets[l]);
            assert_eq!(max_ids[l], offsets[l] + level.len() as i32);
        }
        assert_eq!(max_ids[levels], offsets[levels]);
    }

    #[test]
    fn hierarchy_levels_aggregate_children() {
        init();
        let mut seg = stripe_segmentation(2);
        let levels = seg.levels();
        assert_eq!(
            levels.iter().map(Vec::len).collect::<Vec<_>>(),
            vec![8, 8, 4, 2]
        );
        for l in 1..levels.len() {
            for region in &levels[l] {
                let child_size: usize = region.child_idx.iter().map(|c| levels[l - 1][*c].size).sum();
                assert_eq!(region.size, child_size);
                for c in &region.child_idx {
                    assert_eq!(levels[l - 1][*c].parent_idx, Some(region.index));
                }
                for n in &region.neighbor_idx {
                    assert!(levels[l][*n].neighbor_idx.contains(&region.index));
                }
            }
        }
        // Reduction keeps rasterizations.
        for region in &levels[1] {
            assert_eq!(region.raster.area(), region.size);
        }
        for (idx, _) in levels[3].iter().enumerate() {
            let colors: Vec<bool> = base_descendants(&seg, 3, idx)
                .into_iter()
                .map(|b| DARK_BRIGHT[b])
                .collect();
            assert!(colors.iter().all(|c| *c == colors[0]));
        }

        seg.constrain_segmentation_to_frame_interval(0, 1);
        let record = seg.retrieve_segmentation_3d(0, true).unwrap();
        assert_eq!(record.regions.len(), 8);
        assert_eq!(record.descriptors.len(), 8);
        assert_eq!(record.hierarchy.len(), 4);
        for (l, level) in record.hierarchy.iter().enumerate() {
            for region in &level.regions {
                assert_eq!((region.start_frame, region.end_frame), (0, 1));
                assert_eq!(region.parent_id == -1, l == 3);
                assert_eq!(region.child_ids.is_empty(), l == 0);
            }
        }
        assert!(seg.retrieve_segmentation_3d(1, false).unwrap().hierarchy.is_empty());
    }

    #[test]
    fn frame_interval_trims_output() {
        init();
        let mut seg = Segmentation::new(0.0, DARK_BRIGHT.len(), HEIGHT, 0);
        let extractors = stripe_extractors(&DARK_BRIGHT);
        let mut level = stripe_level(DARK_BRIGHT.len(), 2);
        level.regions[7].size = HEIGHT;
        seg.initialize_base_hierarchy_level(&level, &extractors, None)
            .unwrap();
        seg.add_over_segmentation(&stripe_record(&all_ids()), &extractors)
            .unwrap();
        seg.add_over_segmentation(&stripe_record(&all_ids()[..7]), &extractors)
            .unwrap();
        let distance = SquaredOrDistance { num_descriptors: 1 };
        seg.run_hierarchical_segmentation(&distance, 0.5, 2, 2000, true)
            .unwrap();

        seg.constrain_segmentation_to_frame_interval(1, 1);
        seg.adjust_region_area_to_frame_interval(1, 1);
        let levels = seg.levels();
        assert!(levels[0][7].is_flagged());
        assert_eq!(levels[0][7].size, 0);
        assert!(levels[0][..7].iter().all(|r| !r.is_flagged() && r.size == HEIGHT));
        for l in 1..levels.len() {
            for region in &levels[l] {
                let children = &region.child_idx;
                let child_size: usize = children.iter().map(|c| levels[l - 1][*c].size).sum();
                assert_eq!(region.size, child_size);
                let all_flagged = children.iter().all(|c| levels[l - 1][*c].is_flagged());
                assert_eq!(region.is_flagged(), all_flagged);
            }
        }
        let record = seg.retrieve_segmentation_3d(0, false).unwrap();
        assert_eq!(record.regions.len(), 7);
        assert!(record.hierarchy[0].regions.iter().all(|r| r.id != 7));
    }

    #[test]
    fn counterparts_reproduce_previous_hierarchy() {
        init();
        let extractors = stripe_extractors(&DARK_BRIGHT);
        let level = stripe_level(DARK_BRIGHT.len(), 1);
        let distance = SquaredOrDistance { num_descriptors: 1 };

        let mut first = Segmentation::new(0.0, DARK_BRIGHT.len(), HEIGHT, 0);
        let mut second = Segmentation::new(0.0, DARK_BRIGHT.len(), HEIGHT, 1);
        let mapping = first
            .initialize_base_hierarchy_level(&level, &extractors, None)
            .unwrap();
        second
            .initialize_base_hierarchy_level(&level, &extractors, Some(&mapping))
            .unwrap();
        first
            .add_over_segmentation(&stripe_record(&all_ids()), &extractors)
            .unwrap();
        second
            .add_over_segmentation(&stripe_record(&all_ids()), &extractors)
            .unwrap();

        first
            .run_hierarchical_segmentation(&distance, 0.5, 2, 2000, true)
            .unwrap();
        first.constrain_segmentation_to_frame_interval(0, 0);
        let max_ids = first.assign_unique_region_ids(false, &[0; 4]).unwrap();
        let snapshot = first.counterpart_snapshot().unwrap();
        assert_eq!(snapshot.len(), 8);
        assert!(second.counterpart_snapshot().is_err());

        second.pull_counterpart_segmentation_result(&snapshot).unwrap();
        let (ids, skeleton) = second.setup_region_constraints(0);
        assert!(ids.iter().all(|id| *id >= 0));
        assert_eq!(skeleton.len(), 8);

        second
            .run_hierarchical_segmentation(&distance, 0.5, 2, 2000, true)
            .unwrap();
        assert_eq!(second.computed_hierarchy_levels(), 4);
        second.assign_unique_region_ids(true, &max_ids).unwrap();
        let reproduced = second.counterpart_snapshot().unwrap();
        for id in all_ids() {
            assert_eq!(reproduced.get(id), snapshot.get(id), "chain of region {id}");
        }
    }

    #[test]
    fn discarding_and_force_merging_levels() {
        let mut seg = stripe_segmentation(1);
        seg.discard_bottom_level();
        assert_eq!(seg.computed_hierarchy_levels(), 3);
        assert!(seg.levels()[0].iter().all(|r| r.child_idx.is_empty()));
        assert!(seg.levels()[0].iter().all(|r| r.raster.area() == r.size));

        seg.force_merge_levels(5).unwrap();
        assert_eq!(seg.computed_hierarchy_levels(), 1);
        let top = &seg.levels()[0];
        assert_eq!(top.len(), 2);
        for region in top {
            assert_eq!(region.raster.area(), region.size);
        }
        seg.discard_bottom_level();
        assert_eq!(seg.computed_hierarchy_levels(), 1);
        let record = seg.retrieve_segmentation_3d(0, false).unwrap();
        assert_eq!(record.regions.len(), 2);
        let area: usize = record.regions.iter().map(|r| r.raster.area()).sum();
        assert_eq!(area, DARK_BRIGHT.len() * HEIGHT);
    }

    #[test]
    fn oversegmentation_input_is_validated() {
        let mut seg = Segmentation::new(0.0, DARK_BRIGHT.len(), HEIGHT, 0);
        let extractors = stripe_extractors(&DARK_BRIGHT);
        assert!(matches!(
            seg.add_over_segmentation(&stripe_record(&[0]), &extractors),
            Err(Error::MissingLevel(0))
        ));
        let mut level = stripe_level(3, 1);
        seg.initialize_base_hierarchy_level(&level, &extractors, None)
            .unwrap();
        assert!(matches!(
            seg.add_over_segmentation(&stripe_record(&[5]), &extractors),
            Err(Error::Format(_))
        ));
        assert!(seg
            .add_over_segmentation(&stripe_record(&[0]), &[])
            .is_err());

        seg.add_over_segmentation_connection(0, 2).unwrap();
        assert_eq!(seg.levels()[0][0].neighbor_idx, vec![1, 2]);
        assert!(seg.add_over_segmentation_connection(2, 0).is_err());

        // Region 0 is gone in the next chunk and gets compacted, region 1 grows.
        level.regions.remove(0);
        level.regions[0].neighbor_ids = vec![2];
        seg.initialize_base_hierarchy_level(&level, &extractors, None)
            .unwrap();
        assert_eq!(seg.num_base_hierarchies_added(), 2);
        assert_eq!(seg.levels()[0][1].size, 2 * HEIGHT);
        level.regions[0].neighbor_ids = vec![42];
        assert!(seg
            .initialize_base_hierarchy_level(&level, &extractors, None)
            .is_err());
    }
}

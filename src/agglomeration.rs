//! Greedy agglomeration of a region adjacency graph into the next hierarchy level.
//!
//! Edges are descriptor distances discretized into buckets. The lowest edge is merged first,
//! all edges incident to the merged region are re-evaluated and the scan rewinds if a cheaper
//! edge appeared. Buckets use lazy deletion: removed edges leave a tombstone in the slot arena
//! that is skipped once it reaches the front of its bucket.

use crate::descriptor::RegionDistance;
use crate::error::{Error, Result};
use crate::rasterization::Rasterization3D;
use crate::region::{insert_sorted_uniquely, RegionInformation};
use crate::union_find::VIRTUAL_EDGE_WEIGHT;
use hashbrown::HashMap;
use log::{debug, info};
use std::collections::{BTreeMap, VecDeque};

/// Weights of the edges of a level, keyed by the ordered index pair.
pub type EdgeWeightMap = HashMap<(usize, usize), f32>;

/// Constraint id to the regions that have to end up in one region.
pub type Skeleton = BTreeMap<i32, Vec<usize>>;

#[inline]
fn edge_key(a: usize, b: usize) -> (usize, usize) {
    if a < b {
        (a, b)
    } else {
        (b, a)
    }
}

#[derive(Clone, Copy, Debug)]
struct EdgePosition {
    bucket: usize,
    /// `None` once the edge was dropped from its bucket as unmergeable.
    slot: Option<usize>,
}

#[derive(Debug)]
enum NodeInfo {
    /// Region of the previous level, by index.
    Base(usize),
    Merged(Box<RegionInformation>),
}

#[derive(Debug)]
struct Node {
    parent: usize,
    constraint_id: i32,
    /// Number of merged base regions.
    sz: u32,
    info: NodeInfo,
}

pub struct RegionAgglomerationGraph<'d, D: RegionDistance + ?Sized> {
    distance: &'d D,
    num_buckets: usize,
    edge_scale: f32,
    nodes: Vec<Node>,
    buckets: Vec<VecDeque<usize>>,
    live: Vec<usize>,
    slots: Vec<Option<(usize, usize)>>,
    edge_positions: HashMap<(usize, usize), EdgePosition>,
    merge_rasterization: bool,
    scratch: Vec<f32>,
}

impl<'d, D: RegionDistance + ?Sized> RegionAgglomerationGraph<'d, D> {
    pub fn new(max_weight: f32, num_buckets: usize, distance: &'d D) -> Self {
        let max_weight = max_weight * 1.01;
        Self {
            distance,
            num_buckets,
            edge_scale: num_buckets as f32 / max_weight,
            nodes: Vec::new(),
            // Last bucket holds virtual edges.
            buckets: vec![VecDeque::new(); num_buckets + 1],
            live: vec![0; num_buckets + 1],
            slots: Vec::new(),
            edge_positions: HashMap::new(),
            merge_rasterization: false,
            scratch: Vec::with_capacity(distance.num_descriptors()),
        }
    }

    pub fn num_regions(&self) -> usize {
        self.nodes.len()
    }

    pub fn add_region_edges(
        &mut self,
        prev: &[RegionInformation],
        weight_map: Option<&EdgeWeightMap>,
    ) -> Result<()> {
        self.add_region_edges_impl(prev, None, weight_map)
    }

    /// Same as [`Self::add_region_edges`], but every region carries a constraint id and the
    /// regions of each skeleton entry are chained by virtual edges.
    pub fn add_region_edges_constrained(
        &mut self,
        prev: &[RegionInformation],
        weight_map: Option<&EdgeWeightMap>,
        constraint_ids: &[i32],
        skeleton: &Skeleton,
    ) -> Result<()> {
        if constraint_ids.len() != prev.len() {
            return Err(Error::DimensionMismatch {
                expected: prev.len(),
                actual: constraint_ids.len(),
            });
        }
        self.add_region_edges_impl(prev, Some(constraint_ids), weight_map)?;
        for members in skeleton.values() {
            for pair in members.windows(2) {
                self.add_edge(pair[0], pair[1], VIRTUAL_EDGE_WEIGHT)?;
            }
        }
        Ok(())
    }

    fn add_region_edges_impl(
        &mut self,
        prev: &[RegionInformation],
        constraint_ids: Option<&[i32]>,
        weight_map: Option<&EdgeWeightMap>,
    ) -> Result<()> {
        let num_descriptors = self.distance.num_descriptors();
        if let Some(r) = prev.iter().find(|r| r.descriptors.len() != num_descriptors) {
            return Err(Error::DescriptorCountMismatch {
                expected: num_descriptors,
                actual: r.descriptors.len(),
            });
        }
        let num_neighbors: usize = prev.iter().map(|r| r.neighbor_idx.len()).sum();
        debug!(
            "Average neighbors per region: {}",
            num_neighbors.checked_div(prev.len()).unwrap_or(0)
        );
        self.edge_positions.reserve(num_neighbors / 2);

        // All nodes first, edge insertion checks the constraints of both ends.
        self.nodes.reserve(prev.len());
        for (i, region) in prev.iter().enumerate() {
            if region.index != i {
                return Err(Error::InvalidState("region index does not match its position"));
            }
            self.nodes.push(Node {
                parent: i,
                constraint_id: constraint_ids.map_or(-1, |c| c[i]),
                sz: 1,
                info: NodeInfo::Base(i),
            });
        }

        for (i, region) in prev.iter().enumerate() {
            for &n in &region.neighbor_idx {
                let key = edge_key(i, n);
                if self.edge_positions.contains_key(&key) {
                    continue;
                }
                let weight = match weight_map.and_then(|m| m.get(&key)) {
                    Some(weight) => *weight,
                    None => {
                        let neighbor = prev.get(n).ok_or(Error::InvalidState("neighbor out of range"))?;
                        region.descriptor_distances(neighbor, &mut self.scratch)?;
                        self.distance.evaluate(&self.scratch)
                    }
                };
                self.add_edge(i, n, weight)?;
            }
        }
        Ok(())
    }

    #[inline]
    fn are_mergeable(&self, r1: usize, r2: usize) -> bool {
        let c1 = self.nodes[r1].constraint_id;
        let c2 = self.nodes[r2].constraint_id;
        c1 < 0 || c2 < 0 || c1 == c2
    }

    /// Inserts an edge, returns whether its ends are mergeable. Unmergeable edges are only
    /// recorded in the position index.
    fn add_edge(&mut self, r1: usize, r2: usize, weight: f32) -> Result<bool> {
        if weight > 1.01 && weight <= 10.0 {
            return Err(Error::InvalidState("edge weight outside of [0, 1]"));
        }
        let bucket = ((weight * self.edge_scale) as usize).min(self.num_buckets);
        let key = edge_key(r1, r2);
        let mergeable = self.are_mergeable(r1, r2);
        let slot = mergeable.then(|| {
            let slot = self.slots.len();
            self.slots.push(Some(key));
            self.buckets[bucket].push_back(slot);
            self.live[bucket] += 1;
            slot
        });

        if bucket != self.num_buckets {
            if self
                .edge_positions
                .insert(key, EdgePosition { bucket, slot })
                .is_some()
            {
                return Err(Error::InvalidState("edge inserted twice"));
            }
        } else if !mergeable {
            return Err(Error::IncompatibleConstraints(r1, r2));
        }
        Ok(mergeable)
    }

    fn remove_slot(&mut self, bucket: usize, slot: usize) {
        if self.slots[slot].take().is_some() {
            self.live[bucket] -= 1;
        }
    }

    /// First live slot of `bucket`, dropping tombstones on the way.
    fn front(&mut self, bucket: usize) -> Option<usize> {
        while let Some(&slot) = self.buckets[bucket].front() {
            if self.slots[slot].is_some() {
                return Some(slot);
            }
            self.buckets[bucket].pop_front();
        }
        None
    }

    fn get_region(&mut self, id: usize) -> usize {
        let mut root = id;
        while self.nodes[root].parent != root {
            root = self.nodes[root].parent;
        }
        let mut current = id;
        while current != root {
            let next = self.nodes[current].parent;
            self.nodes[current].parent = root;
            current = next;
        }
        root
    }

    fn info<'a>(&'a self, prev: &'a [RegionInformation], id: usize) -> &'a RegionInformation {
        match &self.nodes[id].info {
            NodeInfo::Base(idx) => &prev[*idx],
            NodeInfo::Merged(info) => info,
        }
    }

    /// Merges the cheapest edges until the region count drops to `cutoff_fraction` of its
    /// original value, minus the merges forced by virtual edges. Returns the number of merges.
    pub fn segment_graph(
        &mut self,
        prev: &[RegionInformation],
        merge_rasterization: bool,
        cutoff_fraction: f32,
    ) -> Result<usize> {
        if !(cutoff_fraction > 0.0 && cutoff_fraction <= 1.0) {
            return Err(Error::InvalidConfig(format!(
                "cutoff fraction must be in (0, 1], got {cutoff_fraction}"
            )));
        }
        self.merge_rasterization = merge_rasterization;
        let n = self.nodes.len() as i64;
        let requested = (n as f32 * (1.0 - cutoff_fraction)) as i64;
        let constraint_merges = (self.live[self.num_buckets] as f32 * cutoff_fraction) as i64;
        let num_merges = (requested - constraint_merges).min(n - 1);
        info!("Performing {num_merges} of {requested} requested merges");

        let mut lowest = (0..self.num_buckets)
            .find(|b| self.live[*b] > 0)
            .unwrap_or(self.num_buckets);
        let mut actual_merges = 0usize;
        for _ in 0..num_merges.max(0) {
            if lowest >= self.num_buckets {
                break;
            }
            loop {
                let slot = self
                    .front(lowest)
                    .ok_or(Error::InvalidState("lowest bucket is empty"))?;
                let Some((r1, r2)) = self.slots[slot] else {
                    return Err(Error::InvalidState("dead slot at bucket front"));
                };
                if self.get_region(r1) != r1 || self.get_region(r2) != r2 || r1 == r2 {
                    return Err(Error::InvalidState("edge between non-representatives"));
                }
                let mut merged = false;
                if !self.are_mergeable(r1, r2) {
                    self.buckets[lowest].pop_front();
                    self.remove_slot(lowest, slot);
                    if let Some(position) = self.edge_positions.get_mut(&(r1, r2)) {
                        position.slot = None;
                    }
                } else {
                    let min_weight = self.merge_regions(prev, r1, r2)?;
                    actual_merges += 1;
                    let min_bucket = (min_weight * self.edge_scale) as usize;
                    if min_bucket < lowest {
                        lowest = min_bucket;
                        break;
                    }
                    merged = true;
                }
                if self.live[lowest] == 0 {
                    while lowest < self.num_buckets && self.live[lowest] == 0 {
                        lowest += 1;
                    }
                    if lowest >= self.num_buckets {
                        break;
                    }
                }
                if merged {
                    break;
                }
            }
        }

        // Forced merges along the skeleton.
        let virtual_edges: Vec<(usize, usize)> = self.buckets[self.num_buckets]
            .iter()
            .filter_map(|slot| self.slots[*slot])
            .collect();
        let mut forced = 0;
        for (e1, e2) in virtual_edges {
            let r1 = self.get_region(e1);
            let r2 = self.get_region(e2);
            if r1 == r2 {
                continue;
            }
            let (c1, c2) = (self.nodes[r1].constraint_id, self.nodes[r2].constraint_id);
            if c1 != c2 || c1 < 0 {
                return Err(Error::IncompatibleConstraints(r1, r2));
            }
            self.merge_regions(prev, r1, r2)?;
            forced += 1;
        }
        actual_merges += forced;
        info!(
            "Requested merges: {requested}, performed merges: {actual_merges} ({forced} forced)"
        );
        Ok(actual_merges)
    }

    /// Removes the edges of `rep` to its current neighbors and returns the neighbor
    /// representatives except `other`.
    fn detach_neighbors(
        &mut self,
        rep: usize,
        other: usize,
        neighbors: &[usize],
        merged_neighbors: &mut Vec<usize>,
    ) {
        for &n in neighbors {
            let neighbor = self.get_region(n);
            let Some(position) = self.edge_positions.remove(&edge_key(rep, neighbor)) else {
                // Removed while detaching an earlier duplicate.
                continue;
            };
            if let Some(slot) = position.slot {
                self.remove_slot(position.bucket, slot);
            }
            if neighbor != other {
                insert_sorted_uniquely(merged_neighbors, neighbor);
            }
        }
    }

    /// Merges two representatives and re-evaluates all incident edges. Returns the lowest
    /// weight among the new mergeable edges.
    fn merge_regions(&mut self, prev: &[RegionInformation], rep_1: usize, rep_2: usize) -> Result<f32> {
        let neighbors_1 = self.info(prev, rep_1).neighbor_idx.clone();
        let neighbors_2 = self.info(prev, rep_2).neighbor_idx.clone();
        let mut merged_neighbors = Vec::with_capacity(neighbors_1.len() + neighbors_2.len());
        self.detach_neighbors(rep_1, rep_2, &neighbors_1, &mut merged_neighbors);
        self.detach_neighbors(rep_2, rep_1, &neighbors_2, &mut merged_neighbors);

        let (merged, absorbed) = if self.nodes[rep_1].sz > self.nodes[rep_2].sz {
            (rep_1, rep_2)
        } else {
            (rep_2, rep_1)
        };
        let sz = self.nodes[rep_1].sz + self.nodes[rep_2].sz;
        let constraint_id = self.nodes[rep_1].constraint_id.max(self.nodes[rep_2].constraint_id);
        self.nodes[rep_1].parent = merged;
        self.nodes[rep_2].parent = merged;
        self.nodes[merged].sz = sz;
        self.nodes[merged].constraint_id = constraint_id;

        let mut new_info = {
            let info_1 = self.info(prev, rep_1);
            let info_2 = self.info(prev, rep_2);
            let mut info = RegionInformation::new(0, info_1.size + info_2.size);
            info.merge_descriptors_from(info_1)?;
            info.merge_descriptors_from(info_2)?;
            if self.merge_rasterization {
                info.raster = Rasterization3D::merge(&info_1.raster, &info_2.raster);
            }
            info
        };
        new_info.neighbor_idx = merged_neighbors;

        let mut weights = Vec::with_capacity(new_info.neighbor_idx.len());
        let mut scratch = std::mem::take(&mut self.scratch);
        for &n in &new_info.neighbor_idx {
            new_info.descriptor_distances(self.info(prev, n), &mut scratch)?;
            weights.push((n, self.distance.evaluate(&scratch)));
        }
        self.scratch = scratch;
        let mut min_weight = 1e6f32;
        for (n, weight) in weights {
            if self.add_edge(merged, n, weight)? {
                min_weight = min_weight.min(weight);
            }
        }
        self.nodes[absorbed].info = NodeInfo::Base(absorbed);
        self.nodes[merged].info = NodeInfo::Merged(Box::new(new_info));
        Ok(min_weight)
    }

    /// Builds the next level from the merge result. Links `prev` to its parents, remaps
    /// neighbors to the new indices and exports the weights of the remaining edges.
    pub fn obtain_segmentation_result(
        mut self,
        prev: &mut [RegionInformation],
    ) -> Result<(Vec<RegionInformation>, EdgeWeightMap)> {
        let mut new_index = vec![usize::MAX; self.nodes.len()];
        let mut representatives: Vec<usize> = Vec::new();
        let mut level: Vec<RegionInformation> = Vec::new();

        for child in 0..prev.len() {
            let rep = self.get_region(child);
            if new_index[rep] == usize::MAX {
                let mut info = match std::mem::replace(&mut self.nodes[rep].info, NodeInfo::Base(rep)) {
                    NodeInfo::Base(idx) => {
                        let old = &prev[idx];
                        let mut info = RegionInformation::new(0, old.size);
                        info.neighbor_idx = old.neighbor_idx.clone();
                        info.merge_descriptors_from(old)?;
                        if self.merge_rasterization {
                            info.raster = old.raster.clone();
                        }
                        info
                    }
                    NodeInfo::Merged(info) => *info,
                };
                info.index = level.len();
                info.constrained_id = self.nodes[rep].constraint_id;
                info.child_idx.clear();
                new_index[rep] = level.len();
                representatives.push(rep);
                level.push(info);
            }
            let idx = new_index[rep];
            level[idx].child_idx.push(child);
            prev[child].parent_idx = Some(idx);
        }

        let inv_edge_scale = 1.0 / self.edge_scale;
        let mut weight_map = EdgeWeightMap::with_capacity(level.len() * 4);
        for (idx, rep) in representatives.into_iter().enumerate() {
            let neighbors = std::mem::take(&mut level[idx].neighbor_idx);
            let mut mapped = Vec::with_capacity(neighbors.len());
            for n in neighbors {
                let neighbor_rep = self.get_region(n);
                let neighbor_idx = new_index[neighbor_rep];
                if neighbor_idx == usize::MAX {
                    return Err(Error::InvalidState("neighbor without region on the new level"));
                }
                if neighbor_idx == idx {
                    continue;
                }
                // Edges only dropped by virtual merges are missing, they weigh nothing.
                let bucket = self
                    .edge_positions
                    .get(&edge_key(rep, neighbor_rep))
                    .map_or(0, |p| p.bucket);
                weight_map.insert(edge_key(idx, neighbor_idx), bucket as f32 * inv_edge_scale);
                insert_sorted_uniquely(&mut mapped, neighbor_idx);
            }
            level[idx].neighbor_idx = mapped;
        }
        info!("Obtained level with {} regions", level.len());
        Ok((level, weight_map))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arrays::LabFrame;
    use crate::descriptor::{AppearanceExtractor, DescriptorExtractor, SquaredOrDistance};
    use crate::rasterization::{Rasterization, ScanInterval};

    fn init() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    /// Chain of vertical stripes, each two pixels wide. `bright` selects the stripe color.
    fn stripes(bright: &[bool]) -> Vec<RegionInformation> {
        let (w, h) = (bright.len() * 2, 4);
        let mut rgb = vec![0u8; w * h * 3];
        for y in 0..h {
            for x in 0..w {
                let v = if bright[x / 2] { 230 } else { 20 };
                rgb[(y * w + x) * 3..(y * w + x) * 3 + 3].copy_from_slice(&[v, v / 2, v]);
            }
        }
        let extractors = vec![DescriptorExtractor::Appearance(AppearanceExtractor {
            lab: LabFrame::from_rgb8(&rgb, w, h).unwrap(),
            luminance_bins: 6,
            color_bins: 8,
            window_size: None,
        })];
        (0..bright.len())
            .map(|i| {
                let mut region = RegionInformation::new(i, 2 * h);
                region.add_descriptors(&extractors);
                let x = 2 * i as i32;
                let raster = Rasterization {
                    scan_inter: (0..h as i32).map(|y| ScanInterval::new(y, x, x + 1)).collect(),
                };
                region.add_slice(0, raster, &extractors).unwrap();
                region.populating_descriptors_finished();
                region.neighbor_idx = [i.checked_sub(1), (i + 1 < bright.len()).then_some(i + 1)]
                    .into_iter()
                    .flatten()
                    .collect();
                region
            })
            .collect()
    }

    #[test]
    fn similar_regions_merge_first() {
        init();
        let bright = [false, false, false, true, true, true];
        let mut prev = stripes(&bright);
        let distance = SquaredOrDistance { num_descriptors: 1 };
        let mut graph = RegionAgglomerationGraph::new(1.0, 2048, &distance);
        graph.add_region_edges(&prev, None).unwrap();
        let merges = graph.segment_graph(&prev, true, 0.5).unwrap();
        assert_eq!(merges, 3);
        let (level, weights) = graph.obtain_segmentation_result(&mut prev).unwrap();
        assert_eq!(level.len(), 3);
        for region in &level {
            let kinds: Vec<bool> = region.child_idx.iter().map(|c| bright[*c]).collect();
            assert!(kinds.iter().all(|k| *k == kinds[0]));
            let child_size: usize = region.child_idx.iter().map(|c| prev[*c].size).sum();
            assert_eq!(region.size, child_size);
            assert_eq!(region.raster.area(), region.size);
            for n in &region.neighbor_idx {
                assert!(level[*n].neighbor_idx.contains(&region.index));
                assert!(weights.contains_key(&edge_key(region.index, *n)));
            }
        }
        for (i, child) in prev.iter().enumerate() {
            let parent = child.parent_idx.unwrap();
            assert!(level[parent].child_idx.contains(&i));
        }
        // The dark/bright boundary is the only expensive edge left.
        assert!(weights.values().any(|w| *w > 0.1));
    }

    #[test]
    fn skeleton_forces_distant_regions_together() {
        init();
        let bright = [false, true, false, true, false, true];
        let mut prev = stripes(&bright);
        let distance = SquaredOrDistance { num_descriptors: 1 };
        let mut graph = RegionAgglomerationGraph::new(1.0, 2048, &distance);
        let constraints = [5, -1, -1, -1, -1, 5];
        let skeleton = Skeleton::from([(5, vec![0, 5])]);
        graph
            .add_region_edges_constrained(&prev, None, &constraints, &skeleton)
            .unwrap();
        let merges = graph.segment_graph(&prev, false, 0.9).unwrap();
        assert_eq!(merges, 1);
        let (level, _) = graph.obtain_segmentation_result(&mut prev).unwrap();
        assert_eq!(level.len(), 5);
        let joined = &level[prev[0].parent_idx.unwrap()];
        assert_eq!(joined.child_idx, vec![0, 5]);
        assert_eq!(joined.constrained_id, 5);
        assert_eq!(joined.neighbor_idx.len(), 2);
    }

    #[test]
    fn distinct_constraints_stay_apart() {
        init();
        let bright = [false; 6];
        let mut prev = stripes(&bright);
        let distance = SquaredOrDistance { num_descriptors: 1 };
        let mut graph = RegionAgglomerationGraph::new(1.0, 2048, &distance);
        let constraints = [1, -1, 2, -1, -1, -1];
        graph
            .add_region_edges_constrained(&prev, None, &constraints, &Skeleton::new())
            .unwrap();
        graph.segment_graph(&prev, false, 1.0 / 6.0).unwrap();
        let (level, _) = graph.obtain_segmentation_result(&mut prev).unwrap();
        assert!(level.len() >= 2);
        assert_ne!(prev[0].parent_idx, prev[2].parent_idx);
    }

    #[test]
    fn rejects_invalid_input() {
        let prev = stripes(&[false, true]);
        let distance = SquaredOrDistance { num_descriptors: 2 };
        let mut graph = RegionAgglomerationGraph::new(1.0, 2048, &distance);
        assert!(matches!(
            graph.add_region_edges(&prev, None),
            Err(Error::DescriptorCountMismatch { expected: 2, actual: 1 })
        ));
        let distance = SquaredOrDistance { num_descriptors: 1 };
        let mut graph = RegionAgglomerationGraph::new(1.0, 2048, &distance);
        graph.add_region_edges(&prev, None).unwrap();
        assert!(graph.segment_graph(&prev, false, 0.0).is_err());
    }

    #[test]
    fn weight_map_is_reused() {
        let mut prev = stripes(&[false, true, false]);
        let distance = SquaredOrDistance { num_descriptors: 1 };
        let weights = EdgeWeightMap::from([((0, 1), 0.5), ((1, 2), 0.0)]);
        let mut graph = RegionAgglomerationGraph::new(1.0, 2048, &distance);
        graph.add_region_edges(&prev, Some(&weights)).unwrap();
        graph.segment_graph(&prev, false, 0.5).unwrap();
        let (level, _) = graph.obtain_segmentation_result(&mut prev).unwrap();
        assert_eq!(level.len(), 2);
        assert_eq!(prev[1].parent_idx, prev[2].parent_idx);
    }
}

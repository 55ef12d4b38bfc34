//! Bucketed Kruskal-style clustering with adaptive thresholds and hard constraints.
//!
//! Edges are discretized into `num_buckets` weight buckets per bucket list and processed in
//! increasing weight. Two regions merge if the edge weight does not exceed the relaxed internal
//! variation `rint = weight_at_merge + k / size` of both. The extra bucket at index
//! `num_buckets` holds virtual skeleton edges that only merge regions sharing a constraint.

use crate::error::{Error, Result};
use crate::region::{insert_sorted_uniquely, RegionInformation};
use assume::assume;
use hashbrown::HashMap;
use log::{debug, warn};

/// Weight of virtual edges, always lands in the reserved bucket.
pub const VIRTUAL_EDGE_WEIGHT: f32 = 1e6;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Node {
    /// Representative in the union-find forest.
    pub parent: u32,
    pub rint: f32,
    pub size: u32,
    /// Sticky constraint, `-1` if unconstrained.
    pub constraint_id: i32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Edge {
    pub region_1: u32,
    pub region_2: u32,
}

pub type EdgeList = Vec<Edge>;

pub struct SegmentationGraph {
    param_k: f32,
    num_buckets: usize,
    skip_buckets: usize,
    scale: f32,
    pub(crate) nodes: Vec<Node>,
    /// `bucket_lists[list][bucket]`, each list holds `num_buckets + 1` buckets.
    pub(crate) bucket_lists: Vec<Vec<EdgeList>>,
    num_forced_merges: usize,
    num_regular_merges: usize,
    num_small_region_merges: usize,
}

impl SegmentationGraph {
    pub fn new(
        param_k: f32,
        max_weight: f32,
        num_buckets: usize,
        skip_buckets: usize,
        num_bucket_lists: usize,
    ) -> Result<Self> {
        if num_buckets <= skip_buckets {
            return Err(Error::InvalidConfig(format!(
                "{num_buckets} buckets can not skip {skip_buckets}"
            )));
        }
        Ok(Self {
            param_k,
            num_buckets,
            skip_buckets,
            scale: num_buckets as f32 / (max_weight + 1e-6),
            nodes: Vec::new(),
            bucket_lists: (0..num_bucket_lists.max(1))
                .map(|_| vec![EdgeList::new(); num_buckets + 1])
                .collect(),
            num_forced_merges: 0,
            num_regular_merges: 0,
            num_small_region_merges: 0,
        })
    }

    pub fn param_k(&self) -> f32 {
        self.param_k
    }

    pub fn num_nodes(&self) -> usize {
        self.nodes.len()
    }

    pub fn num_bucket_lists(&self) -> usize {
        self.bucket_lists.len()
    }

    pub fn node(&self, id: u32) -> &Node {
        &self.nodes[id as usize]
    }

    pub fn reserve_nodes(&mut self, additional: usize) {
        self.nodes.reserve(additional);
    }

    /// Adds a singleton region and returns its id.
    pub fn add_region(&mut self, size: u32, constraint_id: i32) -> u32 {
        let id = self.nodes.len() as u32;
        self.nodes.push(Node {
            parent: id,
            rint: self.param_k / size.max(1) as f32,
            size,
            constraint_id,
        });
        id
    }

    #[inline]
    pub fn bucket_index(&self, weight: f32) -> usize {
        ((weight * self.scale) as usize).min(self.num_buckets)
    }

    #[inline]
    pub fn add_edge(&mut self, region_1: u32, region_2: u32, weight: f32, bucket_list: usize) {
        let bucket = self.bucket_index(weight);
        self.bucket_lists[bucket_list][bucket].push(Edge { region_1, region_2 });
    }

    /// Resolves the representative of `id`, compressing the path on the way.
    pub fn get_region(&mut self, id: u32) -> u32 {
        let len = self.nodes.len();
        let mut root = id as usize;
        loop {
            assume!(unsafe: root < len, "root: {root} > {len}");
            let parent = self.nodes[root].parent as usize;
            if parent == root {
                break;
            }
            root = parent;
        }
        let mut current = id as usize;
        while current != root {
            assume!(unsafe: current < len, "node: {current} > {len}");
            let next = self.nodes[current].parent as usize;
            self.nodes[current].parent = root as u32;
            current = next;
        }
        root as u32
    }

    #[inline]
    pub fn are_mergeable(&self, rep_1: u32, rep_2: u32) -> bool {
        let c1 = self.nodes[rep_1 as usize].constraint_id;
        let c2 = self.nodes[rep_2 as usize].constraint_id;
        c1 < 0 || c2 < 0 || c1 == c2
    }

    /// Union by size. Returns the new representative.
    pub fn merge_regions(&mut self, rep_1: u32, rep_2: u32, weight: f32) -> u32 {
        let (a, b) = (rep_1 as usize, rep_2 as usize);
        let (merged, absorbed) = if self.nodes[a].size > self.nodes[b].size {
            (a, b)
        } else {
            (b, a)
        };
        let size = self.nodes[a].size + self.nodes[b].size;
        let constraint_id = self.nodes[a].constraint_id.max(self.nodes[b].constraint_id);
        self.nodes[absorbed].parent = merged as u32;
        let node = &mut self.nodes[merged];
        node.size = size;
        node.constraint_id = constraint_id;
        node.rint = weight + self.param_k / size as f32;
        merged as u32
    }

    /// Runs the segmentation over `bucket_lists`.
    ///
    /// With `use_skip_buckets` the lowest buckets merge every compatible pair regardless of
    /// `rint`. With `force_constraints` the reserved bucket is processed last and merges all
    /// pairs sharing a constraint.
    pub fn segment_graph(
        &mut self,
        bucket_lists: &[usize],
        use_skip_buckets: bool,
        force_constraints: bool,
    ) -> Result<()> {
        let inv_scale = 1.0 / self.scale;
        self.num_forced_merges = 0;
        self.num_regular_merges = 0;
        self.num_small_region_merges = 0;

        if use_skip_buckets {
            for bucket_idx in 0..self.skip_buckets {
                let weight = bucket_idx as f32 * inv_scale;
                for &list in bucket_lists {
                    let edges = std::mem::take(&mut self.bucket_lists[list][bucket_idx]);
                    let mut remaining = EdgeList::new();
                    for e in edges {
                        let rep_1 = self.get_region(e.region_1);
                        let rep_2 = self.get_region(e.region_2);
                        if rep_1 == rep_2 {
                            continue;
                        }
                        if self.are_mergeable(rep_1, rep_2) {
                            self.merge_regions(rep_1, rep_2, weight);
                            self.num_forced_merges += 1;
                        } else {
                            remaining.push(e);
                        }
                    }
                    self.bucket_lists[list][bucket_idx] = remaining;
                }
            }
        }

        let start_bucket = if use_skip_buckets { self.skip_buckets } else { 0 };
        for bucket_idx in start_bucket..self.num_buckets {
            let weight = bucket_idx as f32 * inv_scale;
            for &list in bucket_lists {
                let edges = std::mem::take(&mut self.bucket_lists[list][bucket_idx]);
                for e in &edges {
                    let rep_1 = self.get_region(e.region_1);
                    let rep_2 = self.get_region(e.region_2);
                    if rep_1 == rep_2 {
                        continue;
                    }
                    let n1 = self.nodes[rep_1 as usize];
                    let n2 = self.nodes[rep_2 as usize];
                    if n1.constraint_id < 0 || n2.constraint_id < 0 {
                        if weight <= n1.rint && weight <= n2.rint {
                            self.merge_regions(rep_1, rep_2, weight);
                            self.num_regular_merges += 1;
                        }
                    } else if n1.constraint_id == n2.constraint_id {
                        self.merge_regions(rep_1, rep_2, weight);
                        self.num_forced_merges += 1;
                    }
                }
                self.bucket_lists[list][bucket_idx] = edges;
            }
        }
        debug!(
            "Forced merges {} | Regular merges {}",
            self.num_forced_merges, self.num_regular_merges
        );

        if force_constraints {
            let last = self.num_buckets;
            for &list in bucket_lists {
                let edges = std::mem::take(&mut self.bucket_lists[list][last]);
                let mut result = Ok(());
                for e in &edges {
                    let rep_1 = self.get_region(e.region_1);
                    let rep_2 = self.get_region(e.region_2);
                    if rep_1 == rep_2 {
                        continue;
                    }
                    let c1 = self.nodes[rep_1 as usize].constraint_id;
                    let c2 = self.nodes[rep_2 as usize].constraint_id;
                    if c1 < 0 || c2 < 0 {
                        result = Err(Error::IncompatibleConstraints(
                            rep_1 as usize,
                            rep_2 as usize,
                        ));
                        break;
                    }
                    if c1 == c2 {
                        self.merge_regions(rep_1, rep_2, 0.0);
                        self.num_forced_merges += 1;
                    }
                }
                self.bucket_lists[list][last] = edges;
                result?;
            }
        }
        Ok(())
    }

    /// Merges every region smaller than `min_region_size` into a compatible neighbor,
    /// regardless of `rint`.
    ///
    /// With `discard_redundant_edges` only the lowest edge between two regions survives.
    /// Pairs are only recorded for lists in `discard_bucket_lists` (all lists if `None`), so
    /// edges of other lists stay even if redundant.
    pub fn merge_small_regions(
        &mut self,
        min_region_size: u32,
        bucket_lists: &[usize],
        discard_redundant_edges: bool,
        discard_bucket_lists: Option<&[usize]>,
    ) {
        let inv_scale = 1.0 / self.scale;
        let mut is_discard_list = vec![discard_bucket_lists.is_none(); self.bucket_lists.len()];
        for &list in discard_bucket_lists.unwrap_or_default() {
            match is_discard_list.get_mut(list) {
                Some(flag) => *flag = true,
                None => warn!("Discard bucket list {list} is out of bounds"),
            }
        }
        let mut neighbors: Vec<Vec<u32>> = if discard_redundant_edges {
            vec![Vec::new(); self.nodes.len()]
        } else {
            Vec::new()
        };

        for bucket_idx in 0..self.num_buckets {
            let weight = bucket_idx as f32 * inv_scale;
            for &list in bucket_lists {
                let edges = std::mem::take(&mut self.bucket_lists[list][bucket_idx]);
                let mut remaining = EdgeList::new();
                for e in &edges {
                    let rep_1 = self.get_region(e.region_1);
                    let rep_2 = self.get_region(e.region_2);
                    if rep_1 == rep_2 {
                        continue;
                    }
                    let small = self.nodes[rep_1 as usize].size < min_region_size
                        || self.nodes[rep_2 as usize].size < min_region_size;
                    if small && self.are_mergeable(rep_1, rep_2) {
                        self.merge_regions(rep_1, rep_2, weight);
                        self.num_small_region_merges += 1;
                    } else if discard_redundant_edges {
                        let (r1, r2) = (rep_1.min(rep_2), rep_1.max(rep_2));
                        let known = &mut neighbors[r1 as usize];
                        if known.binary_search(&r2).is_err() {
                            if is_discard_list[list] {
                                insert_sorted_uniquely(known, r2);
                            }
                            remaining.push(*e);
                        }
                    }
                }
                self.bucket_lists[list][bucket_idx] = if discard_redundant_edges {
                    remaining
                } else {
                    edges
                };
            }
        }

        let total = self.num_forced_merges + self.num_regular_merges + self.num_small_region_merges;
        if total != 0 {
            let pct = |n: usize| n as f32 / total as f32 * 100.0;
            debug!(
                "Total merges: {total}, forced {} ({:.1}%), regular {} ({:.1}%), small region {} ({:.1}%)",
                self.num_forced_merges,
                pct(self.num_forced_merges),
                self.num_regular_merges,
                pct(self.num_regular_merges),
                self.num_small_region_merges,
                pct(self.num_small_region_merges)
            );
        }
    }

    /// Assigns compact indices to all regions incident to a remaining edge and records
    /// symmetric neighbor sets for edges of `neighbor_lists` (all lists if `None`).
    ///
    /// Returns the regions and the map from representative to index. Virtual edges are
    /// ignored. If no boundary edge is left a single region is synthesized.
    pub fn assign_region_ids(
        &mut self,
        neighbor_lists: Option<&[usize]>,
    ) -> (Vec<RegionInformation>, HashMap<u32, usize>) {
        let mut consider = vec![neighbor_lists.is_none(); self.bucket_lists.len()];
        for &list in neighbor_lists.unwrap_or_default() {
            match consider.get_mut(list) {
                Some(flag) => *flag = true,
                None => warn!("Neighbor bucket list {list} is out of bounds"),
            }
        }
        let mut regions: Vec<RegionInformation> = Vec::new();
        let mut map: HashMap<u32, usize> = HashMap::new();

        for bucket_idx in 0..self.num_buckets {
            for list in 0..self.bucket_lists.len() {
                let edges = std::mem::take(&mut self.bucket_lists[list][bucket_idx]);
                for e in &edges {
                    let rep_1 = self.get_region(e.region_1);
                    let rep_2 = self.get_region(e.region_2);
                    if rep_1 == rep_2 {
                        continue;
                    }
                    let idx_1 = self.region_index(rep_1, &mut regions, &mut map);
                    let idx_2 = self.region_index(rep_2, &mut regions, &mut map);
                    if consider[list] {
                        insert_sorted_uniquely(&mut regions[idx_1].neighbor_idx, idx_2);
                        insert_sorted_uniquely(&mut regions[idx_2].neighbor_idx, idx_1);
                    }
                }
                self.bucket_lists[list][bucket_idx] = edges;
            }
        }

        if regions.is_empty() && !self.nodes.is_empty() {
            warn!(
                "No boundary edges found, result is a single region. \
                 Decrease k or increase the minimum number of regions."
            );
            let rep = self.get_region(0);
            self.region_index(rep, &mut regions, &mut map);
        }
        (regions, map)
    }

    fn region_index(
        &self,
        rep: u32,
        regions: &mut Vec<RegionInformation>,
        map: &mut HashMap<u32, usize>,
    ) -> usize {
        *map.entry(rep).or_insert_with(|| {
            let node = &self.nodes[rep as usize];
            let mut info = RegionInformation::new(regions.len(), node.size as usize);
            info.constrained_id = node.constraint_id;
            regions.push(info);
            regions.len() - 1
        })
    }

    /// Points every node directly at its representative.
    ///
    /// With `separate_representatives` every representative is first copied to a fresh node
    /// past the current end, so all original nodes become leaves.
    pub fn flatten(&mut self, separate_representatives: bool) {
        let offset = self.nodes.len() as u32;
        if separate_representatives {
            for i in 0..offset {
                let rep = self.get_region(i);
                let flat = if rep < offset {
                    let node = self.nodes[rep as usize];
                    let new_id = self.nodes.len() as u32;
                    self.nodes.push(Node {
                        parent: new_id,
                        ..node
                    });
                    self.nodes[rep as usize].parent = new_id;
                    new_id
                } else {
                    rep
                };
                self.nodes[i as usize].parent = flat;
            }
            debug!("Inserted {} new representatives", self.nodes.len() as u32 - offset);
        } else {
            for i in 0..offset {
                let rep = self.get_region(i);
                self.nodes[i as usize].parent = rep;
            }
        }
    }
}

//! Connected component labeling of id images.
//!
//! Rows are split into bands processed in parallel, the band seams are merged afterwards.
//! The disjoint set links towards the lower index, so every parent is smaller or equal to
//! its child and labels can be resolved in a single forward pass.

use crate::arrays::IdImage;
use crate::common::split_length_to_ranges;
use crate::error::{Error, Result};
use assume::assume;
use multiversion::multiversion;
use rayon::current_num_threads;
use rayon::prelude::*;
use std::ops::Range;
use std::sync::atomic::{AtomicU32, Ordering};

/// Labeled components of one image. Components are numbered by their leader, the first
/// pixel in scan order.
#[derive(Debug)]
pub struct ComponentSet {
    pub num_components: u32,
    pub component_assignment: Vec<u32>,
    pub num_component_members: Vec<u32>,
    pub component_leaders: Vec<u32>,
}

pub struct DisjointSet {
    parents: Vec<AtomicU32>,
}

impl DisjointSet {
    pub fn new(size: usize) -> Result<Self> {
        if size == 0 || size >= u32::MAX as usize {
            return Err(Error::InvalidConfig(format!(
                "disjoint set size must be in [1, {}), got {size}",
                u32::MAX
            )));
        }
        Ok(DisjointSet {
            parents: (0..size as u32).map(AtomicU32::new).collect(),
        })
    }

    pub fn len(&self) -> usize {
        self.parents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parents.is_empty()
    }

    /// Rem's union with splicing.
    #[inline]
    pub fn merge(&self, node_i: u32, node_j: u32) {
        // NOTE: Concurrent merges are only safe when threads touch disjoint node ranges, which
        //  holds for the row bands used below. Seams are merged after the bands finished.
        let len = self.parents.len();
        let mut root_x = node_i as usize;
        let mut root_y = node_j as usize;
        let mut parent_x = self.parents[root_x].load(Ordering::Relaxed);
        let mut parent_y = self.parents[root_y].load(Ordering::Relaxed);
        while parent_x != parent_y {
            if parent_x > parent_y {
                assume!(unsafe: root_x < len, "root: {root_x} > {len}");
                if root_x as u32 == parent_x {
                    self.parents[root_x].store(parent_y, Ordering::Relaxed);
                    break;
                }
                let z = parent_x as usize;
                parent_x = self.parents[z].load(Ordering::Relaxed);
                assume!(unsafe: (parent_x as usize) < len, "root: {parent_x} > {len}");
                self.parents[root_x].store(parent_y, Ordering::Relaxed);
                root_x = z;
            } else {
                assume!(unsafe: root_y < len, "root: {root_y} > {len}");
                if root_y as u32 == parent_y {
                    self.parents[root_y].store(parent_x, Ordering::Relaxed);
                    break;
                }
                let z = parent_y as usize;
                parent_y = self.parents[z].load(Ordering::Relaxed);
                assume!(unsafe: (parent_y as usize) < len, "root: {parent_y} > {len}");
                self.parents[root_y].store(parent_x, Ordering::Relaxed);
                root_y = z;
            }
        }
    }

    /// Resolves components and their sizes.
    pub fn flatten(&self) -> ComponentSet {
        let len = self.parents.len();
        let ranges = split_length_to_ranges(len, current_num_threads());

        let local_roots: Vec<Vec<u32>> = ranges
            .par_iter()
            .map(|range| {
                (range.start as u32..range.end as u32)
                    .filter(|i| self.parents[*i as usize].load(Ordering::Relaxed) == *i)
                    .collect()
            })
            .collect();
        let component_leaders: Vec<u32> = local_roots.into_iter().flatten().collect();
        let num_components = component_leaders.len() as u32;

        let mut component_assignment = vec![u32::MAX; len];
        for (component_no, leader) in (0u32..).zip(&component_leaders) {
            component_assignment[*leader as usize] = component_no;
        }

        // Parents always precede children, a forward pass sees resolved parents.
        for i in 0..len {
            let parent = self.parents[i].load(Ordering::Relaxed) as usize;
            assume!(unsafe: parent <= i, "parent: {parent} > {i}");
            if parent < i {
                component_assignment[i] = component_assignment[parent];
            }
        }

        let num_component_members = ranges
            .par_iter()
            .map(|range| {
                let mut local = vec![0u32; num_components as usize];
                for component_no in &component_assignment[range.clone()] {
                    local[*component_no as usize] += 1;
                }
                local
            })
            .reduce(
                || vec![0u32; num_components as usize],
                |mut acc, local| {
                    acc.iter_mut().zip(local).for_each(|(a, l)| *a += l);
                    acc
                },
            );

        ComponentSet {
            num_components,
            component_assignment,
            num_component_members,
            component_leaders,
        }
    }
}

/// Builds the disjoint set of 8-connected pixels sharing the same id.
pub fn assign_disjoint_set(ids: &IdImage) -> Result<DisjointSet> {
    let cc_set = DisjointSet::new(ids.data.len())?;
    let vsplit_ranges = split_length_to_ranges(ids.height, current_num_threads());
    let mut seam_ys: Vec<usize> = vsplit_ranges.iter().map(|r| r.end).collect();
    seam_ys.pop(); // bottom line of the image

    fn assign_band(ids: &IdImage, cc_set: &DisjointSet, range: Range<usize>) {
        let width = ids.width;
        let first_row = ids.get_row(range.start);
        let base = (width * range.start) as u32;
        for x in 1..width {
            if first_row[x] == first_row[x - 1] {
                cc_set.merge(base + x as u32 - 1, base + x as u32);
            }
        }
        for y in range.start + 1..range.end {
            link_row(ids, cc_set, y, true);
        }
    }

    vsplit_ranges
        .into_par_iter()
        .for_each(|r| assign_band(ids, &cc_set, r));

    for y in seam_ys {
        link_row(ids, &cc_set, y, false);
    }
    Ok(cc_set)
}

/// Links row `y` to the row above. Horizontal links only with `with_left`.
#[multiversion(targets = "simd")]
fn link_row(ids: &IdImage, cc_set: &DisjointSet, y: usize, with_left: bool) {
    let width = ids.width;
    let row = ids.get_row(y);
    let up = ids.get_row(y - 1);
    let index = (width * y) as u32;
    let index_up = (width * (y - 1)) as u32;
    for x in 0..width {
        let id = row[x];
        let current = index + x as u32;
        if with_left && x > 0 && row[x - 1] == id {
            cc_set.merge(current - 1, current);
        }
        if x > 0 && up[x - 1] == id {
            cc_set.merge(index_up + x as u32 - 1, current);
        }
        if up[x] == id {
            cc_set.merge(index_up + x as u32, current);
        }
        if x + 1 < width && up[x + 1] == id {
            cc_set.merge(index_up + x as u32 + 1, current);
        }
    }
}

/// Labels 8-connected components of equal ids.
pub fn label_components(ids: &IdImage) -> Result<ComponentSet> {
    Ok(assign_disjoint_set(ids)?.flatten())
}

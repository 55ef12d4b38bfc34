use crate::descriptor::{DescriptorExtractor, RegionDescriptor};
use crate::error::{Error, Result};
use crate::rasterization::{Rasterization, Rasterization3D};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum RegionStatus {
    #[default]
    Normal,
    /// Kept in memory to seed the next chunk, but not emitted.
    FlaggedForRemoval,
}

/// One region of a hierarchy level.
///
/// Base level regions carry a rasterization and no children. Regions of higher levels carry
/// children and only have a rasterization if it was merged during agglomeration.
#[derive(Clone, Debug, Default)]
pub struct RegionInformation {
    /// Position within the level.
    pub index: usize,
    /// Size in voxels.
    pub size: usize,
    pub parent_idx: Option<usize>,
    pub region_status: RegionStatus,
    /// Sorted, unique indices of neighboring regions on the same level.
    pub neighbor_idx: Vec<usize>,
    /// Sorted indices into the level below.
    pub child_idx: Vec<usize>,
    pub raster: Rasterization3D,
    /// Oversegmentation id of the matching region in the previous chunk set.
    pub counterpart: Option<i32>,
    /// Id of the region this one has to end up in, `-1` if unconstrained.
    pub constrained_id: i32,
    /// Output id, equals `constrained_id` for constrained regions once ids are assigned.
    pub region_id: i32,
    /// Region ids of the counterpart's ancestors, from level 1 upwards.
    pub counterpart_region_ids: Vec<i32>,
    pub descriptors: Vec<RegionDescriptor>,
}

impl RegionInformation {
    pub fn new(index: usize, size: usize) -> Self {
        Self {
            index,
            size,
            constrained_id: -1,
            region_id: -1,
            ..Default::default()
        }
    }

    pub fn is_flagged(&self) -> bool {
        self.region_status == RegionStatus::FlaggedForRemoval
    }

    pub fn add_descriptors(&mut self, extractors: &[DescriptorExtractor]) {
        self.descriptors
            .extend(extractors.iter().map(DescriptorExtractor::create_descriptor));
    }

    /// Adds a frame slice and feeds it to every descriptor.
    pub fn add_slice(
        &mut self,
        frame: usize,
        raster: Rasterization,
        extractors: &[DescriptorExtractor],
    ) -> Result<()> {
        if self.descriptors.len() != extractors.len() {
            return Err(Error::DescriptorCountMismatch {
                expected: extractors.len(),
                actual: self.descriptors.len(),
            });
        }
        for (descriptor, extractor) in self.descriptors.iter_mut().zip(extractors) {
            descriptor.add_features(&raster, extractor, frame)?;
        }
        self.raster.add_slice(frame, raster);
        Ok(())
    }

    /// Per-descriptor distances to `rhs`, written into `distances`.
    pub fn descriptor_distances(
        &self,
        rhs: &RegionInformation,
        distances: &mut Vec<f32>,
    ) -> Result<()> {
        if self.descriptors.len() != rhs.descriptors.len() {
            return Err(Error::DescriptorCountMismatch {
                expected: self.descriptors.len(),
                actual: rhs.descriptors.len(),
            });
        }
        distances.clear();
        for (l, r) in self.descriptors.iter().zip(&rhs.descriptors) {
            distances.push(l.region_distance(r)?);
        }
        Ok(())
    }

    /// Merges descriptors of `rhs` into this region. An empty region takes a copy.
    pub fn merge_descriptors_from(&mut self, rhs: &RegionInformation) -> Result<()> {
        if self.descriptors.is_empty() {
            self.descriptors = rhs.descriptors.clone();
            return Ok(());
        }
        if self.descriptors.len() != rhs.descriptors.len() {
            return Err(Error::DescriptorCountMismatch {
                expected: self.descriptors.len(),
                actual: rhs.descriptors.len(),
            });
        }
        for (l, r) in self.descriptors.iter_mut().zip(&rhs.descriptors) {
            l.merge_with(r)?;
        }
        Ok(())
    }

    pub fn populating_descriptors_finished(&mut self) {
        self.descriptors
            .iter_mut()
            .for_each(RegionDescriptor::populating_finished);
    }
}

/// Inserts `value` into the sorted `list`. Returns false if it was already present.
pub fn insert_sorted_uniquely<T: Ord>(list: &mut Vec<T>, value: T) -> bool {
    match list.binary_search(&value) {
        Ok(_) => false,
        Err(pos) => {
            list.insert(pos, value);
            true
        }
    }
}

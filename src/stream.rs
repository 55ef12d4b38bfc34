//! Streaming front ends.
//!
//! [`DenseStream`] turns raw frames into an oversegmentation, chunk by chunk. Consecutive
//! chunks overlap, the first frames of the overlap are segmented twice and the earlier result
//! constrains the later one so region ids persist.
//!
//! [`HierarchyStream`] consumes that oversegmentation, groups chunks into chunk sets and builds
//! a region hierarchy per set. Sets overlap by whole chunks, the hierarchy of one set is pulled
//! into the next through counterparts.
//!
//! Both return the records that became final with each pushed frame, in frame order.

use crate::arrays::{FeatureFrame, FlowField, LabFrame};
use crate::common::{HierarchyConfig, SegmentationConfig};
use crate::descriptor::{AppearanceExtractor, DescriptorExtractor, FlowExtractor, SquaredOrDistance};
use crate::error::{Error, Result};
use crate::io::{HierarchyLevelRecord, SegmentationRecord};
use crate::segmentation::Segmentation;
use crate::union_find::{Edge, Node};
use log::{debug, info};
use std::collections::VecDeque;
use std::mem::size_of;

const MAX_OVERLAP_FRAMES: usize = 10;

pub struct DenseStream {
    config: SegmentationConfig,
    frame_width: usize,
    frame_height: usize,
    chunk_size: usize,
    overlap_frames: usize,
    constraint_frames: usize,
    min_region_size: usize,
    seg: Segmentation,
    processed_chunks: usize,
    input_frames: usize,
    max_region_id: i32,
    /// Newest frame first.
    feature_buffer: VecDeque<FeatureFrame>,
    overlap_records: Vec<SegmentationRecord>,
    overlap_flows: Vec<Option<FlowField>>,
    finished: bool,
}

impl DenseStream {
    pub fn new(config: SegmentationConfig, frame_width: usize, frame_height: usize) -> Result<Self> {
        config.validate()?;
        let mut chunk_size = config.chunk_size;
        if let Some(memory_mb) = config.max_chunk_memory_mb {
            let total_kb = memory_mb * 1024;
            let kilo_nodes =
                ((frame_width * frame_height) as f32 * (1.0 + config.chunk_overlap_ratio) / 1024.0) as usize;
            // About half of the 26 neighbor edges per voxel are buffered while small regions merge.
            let node_bytes = (13.0 * 1.5 * size_of::<Edge>() as f32) as usize + size_of::<Node>();
            if kilo_nodes > 0 {
                chunk_size = chunk_size.min(total_kb / (kilo_nodes * node_bytes));
            }
        }
        let chunk_size = chunk_size.max(2);
        let overlap_frames = ((config.chunk_overlap_ratio * chunk_size as f32) as usize)
            .clamp(1, MAX_OVERLAP_FRAMES)
            .min(chunk_size - 1);
        let constraint_frames = config.num_constraint_frames.min(overlap_frames);
        let frac = config.frac_min_region_size;
        let min_region_size = config.min_region_size.unwrap_or(
            (frac * frame_width as f32 * frac * frame_height as f32 * chunk_size as f32) as usize,
        );
        info!(
            "Oversegmenting in chunks of {chunk_size} frames with {overlap_frames} frames overlap, \
             min region size {min_region_size}"
        );

        let mut seg = Segmentation::new(config.parameter_k, frame_width, frame_height, 0);
        seg.over_segmentation_size_hint(chunk_size, config.color_distance)?;
        Ok(Self {
            config,
            frame_width,
            frame_height,
            chunk_size,
            overlap_frames,
            constraint_frames,
            min_region_size,
            seg,
            processed_chunks: 0,
            input_frames: 0,
            max_region_id: 0,
            feature_buffer: VecDeque::with_capacity(overlap_frames.max(2) + 1),
            overlap_records: Vec::new(),
            overlap_flows: Vec::new(),
            finished: false,
        })
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn overlap_frames(&self) -> usize {
        self.overlap_frames
    }

    pub fn min_region_size(&self) -> usize {
        self.min_region_size
    }

    /// Adds a packed RGB frame. `flow` maps it into the previous frame.
    pub fn push_frame(
        &mut self,
        rgb: &[u8],
        flow: Option<FlowField>,
    ) -> Result<Vec<SegmentationRecord>> {
        if self.finished {
            return Err(Error::InvalidState("stream already finished"));
        }
        let mut output = Vec::new();
        if self.input_frames > 0 && self.input_frames % self.chunk_size == 0 {
            let (size, overlap_start) = if self.processed_chunks == 0 {
                (self.chunk_size, self.chunk_size - self.overlap_frames)
            } else {
                (self.chunk_size + self.overlap_frames, self.chunk_size)
            };
            output = self.segment_and_output_chunk(size, overlap_start)?;
            self.start_next_chunk()?;
        }

        let in_overlap =
            self.input_frames % self.chunk_size >= self.chunk_size - self.overlap_frames;
        let buffer_length = if in_overlap {
            self.overlap_frames.max(2)
        } else {
            2
        };
        let frame = FeatureFrame::from_rgb8(
            rgb,
            self.frame_width,
            self.frame_height,
            self.config.smoothing,
        )?;
        self.feature_buffer.push_front(frame);
        self.feature_buffer.truncate(buffer_length);

        self.seg.add_frame(&self.feature_buffer[0], None)?;
        if self.input_frames > 0 {
            self.seg
                .connect_temporally(&self.feature_buffer[0], &self.feature_buffer[1], flow.as_ref())?;
        }
        if in_overlap {
            self.overlap_flows.push(flow);
        }
        self.input_frames += 1;
        Ok(output)
    }

    /// Segments the frames of the last chunk.
    pub fn finish(&mut self) -> Result<Vec<SegmentationRecord>> {
        if self.finished || self.input_frames == 0 {
            self.finished = true;
            return Ok(Vec::new());
        }
        let mut remaining = self.input_frames % self.chunk_size;
        if remaining == 0 {
            remaining = self.chunk_size;
        }
        let size = if self.processed_chunks == 0 {
            remaining
        } else {
            remaining + self.overlap_frames
        };
        let output = self.segment_and_output_chunk(size, size)?;
        self.finished = true;
        Ok(output)
    }

    fn segment_and_output_chunk(
        &mut self,
        size: usize,
        overlap_start: usize,
    ) -> Result<Vec<SegmentationRecord>> {
        info!("Segmenting chunk of size {size}, overlap starts at {overlap_start}");
        self.seg
            .run_over_segmentation(self.min_region_size, &self.config)?;

        let num_frames = self.seg.num_frames_added();
        let overlap_start = overlap_start.min(num_frames);
        let last_frame = (overlap_start + self.constraint_frames).min(num_frames);
        if last_frame == 0 {
            return Err(Error::InvalidState("chunk without frames"));
        }
        self.seg
            .constrain_segmentation_to_frame_interval(0, last_frame - 1);
        if overlap_start > 0 {
            self.seg
                .adjust_region_area_to_frame_interval(0, overlap_start - 1);
        }
        let max_ids = self
            .seg
            .assign_unique_region_ids(self.processed_chunks > 0, &[self.max_region_id])?;
        self.max_region_id = max_ids[0];

        let mut output = Vec::with_capacity(overlap_start);
        for frame in 0..last_frame {
            let mut record = self.seg.retrieve_segmentation_3d(frame, false)?;
            record.chunk_size = last_frame;
            record.overlap_start = overlap_start;
            if frame < overlap_start {
                output.push(record);
            } else {
                self.overlap_records.push(record);
            }
        }
        self.processed_chunks += 1;
        Ok(output)
    }

    /// Starts a new chunk with the overlap frames, the first ones constrained to the result
    /// of the previous chunk.
    fn start_next_chunk(&mut self) -> Result<()> {
        info!("Creating new segmentation at frame {}", self.input_frames);
        let mut seg = Segmentation::new(
            self.config.parameter_k,
            self.frame_width,
            self.frame_height,
            self.processed_chunks,
        );
        seg.over_segmentation_size_hint(
            self.chunk_size + self.overlap_frames,
            self.config.color_distance,
        )?;
        if self.overlap_records.len() != self.constraint_frames {
            return Err(Error::DimensionMismatch {
                expected: self.constraint_frames,
                actual: self.overlap_records.len(),
            });
        }

        for i in 0..self.overlap_frames {
            let buffer_idx = self.overlap_frames - 1 - i;
            let frame = self
                .feature_buffer
                .get(buffer_idx)
                .ok_or(Error::MissingFrame(buffer_idx))?;
            seg.add_frame(frame, self.overlap_records.get(i))?;
            if i > 0 {
                let flow = self.overlap_flows.get(i).and_then(Option::as_ref);
                seg.connect_temporally(frame, &self.feature_buffer[buffer_idx + 1], flow)?;
            }
        }
        self.overlap_records.clear();
        self.overlap_flows.clear();
        self.seg = seg;
        Ok(())
    }
}

pub struct HierarchyStream {
    config: HierarchyConfig,
    frame_width: usize,
    frame_height: usize,
    with_flow: bool,
    seg: Segmentation,
    /// Segmentation of the next chunk set, fed during the overlap.
    new_seg: Option<Segmentation>,
    /// Index of the current oversegmentation chunk.
    read_chunks: Option<usize>,
    processed_chunk_sets: usize,
    input_frames: usize,
    num_output_frames: usize,
    last_overlap_start: Option<usize>,
    last_lookahead_start: Option<usize>,
    max_region_ids: Vec<i32>,
    finished: bool,
}

impl HierarchyStream {
    /// With `with_flow` every pushed frame needs a flow field, except the first one.
    pub fn new(
        config: HierarchyConfig,
        frame_width: usize,
        frame_height: usize,
        with_flow: bool,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            frame_width,
            frame_height,
            with_flow,
            seg: Segmentation::new(0.0, frame_width, frame_height, 0),
            new_seg: None,
            read_chunks: None,
            processed_chunk_sets: 0,
            input_frames: 0,
            num_output_frames: 0,
            last_overlap_start: None,
            last_lookahead_start: None,
            max_region_ids: Vec::new(),
            finished: false,
        })
    }

    pub fn num_output_frames(&self) -> usize {
        self.num_output_frames
    }

    fn extractors(&self, rgb: &[u8], flow: Option<FlowField>) -> Result<Vec<DescriptorExtractor>> {
        let mut extractors = vec![DescriptorExtractor::Appearance(AppearanceExtractor {
            lab: LabFrame::from_rgb8(rgb, self.frame_width, self.frame_height)?,
            luminance_bins: self.config.luminance_bins,
            color_bins: self.config.color_bins,
            window_size: (self.config.window_size > 0).then_some(self.config.window_size),
        })];
        if self.with_flow {
            extractors.push(DescriptorExtractor::Flow(FlowExtractor {
                flow_bins: self.config.flow_bins,
                flow: flow.filter(|_| self.input_frames > 0),
            }));
        }
        Ok(extractors)
    }

    /// Adds one oversegmented frame together with its RGB frame and flow.
    pub fn push_record(
        &mut self,
        record: &SegmentationRecord,
        rgb: &[u8],
        flow: Option<FlowField>,
    ) -> Result<Vec<SegmentationRecord>> {
        if self.finished {
            return Err(Error::InvalidState("stream already finished"));
        }
        if record.frame_width != self.frame_width || record.frame_height != self.frame_height {
            return Err(Error::DimensionMismatch {
                expected: self.frame_width * self.frame_height,
                actual: record.frame_width * record.frame_height,
            });
        }
        let starts_chunk = record.has_hierarchy();
        if starts_chunk {
            self.read_chunks = Some(self.read_chunks.map_or(0, |c| c + 1));
        }
        let read_chunks = self
            .read_chunks
            .ok_or_else(|| Error::Format("first record carries no hierarchy".into()))?;
        let extractors = self.extractors(rgb, flow)?;
        let set_size = self.config.chunk_set_size;
        let overlap = self.config.chunk_set_overlap;
        let constraint = self.config.constraint_chunks;

        let mut output = Vec::new();
        if read_chunks > 0 && read_chunks % set_size == 0 && starts_chunk {
            let num_frames = self.seg.num_frames_added();
            let overlap_start = self.last_overlap_start.unwrap_or(num_frames);
            let lookahead_start = self.last_lookahead_start.unwrap_or(num_frames);
            output = self.segment_and_output_chunk(overlap_start, lookahead_start)?;
            self.last_overlap_start = None;
            self.last_lookahead_start = None;
            self.seg = self
                .new_seg
                .take()
                .ok_or(Error::InvalidState("no segmentation for the next chunk set"))?;
        }

        let position = read_chunks % set_size;
        if position >= set_size - overlap {
            let new_seg = self.new_seg.get_or_insert_with(|| {
                Segmentation::new(
                    0.0,
                    self.frame_width,
                    self.frame_height,
                    self.processed_chunk_sets + 1,
                )
            });
            if self.last_overlap_start.is_none() {
                self.last_overlap_start = Some(self.seg.num_frames_added());
            }
            if starts_chunk {
                let level = &record.hierarchy[0];
                let use_mapping = position < set_size - overlap + constraint;
                // Regions only present in constraint frames are never emitted.
                let last_chunk_in_set = (read_chunks + 1) % set_size == 0;
                let seg_level = match (last_chunk_in_set, record.overlap_start.checked_sub(1)) {
                    (false, _) => level.clone(),
                    (true, Some(rhs)) => level.constrained_to_frame_interval(0, rhs),
                    (true, None) => HierarchyLevelRecord::default(),
                };
                let mapping = self
                    .seg
                    .initialize_base_hierarchy_level(&seg_level, &extractors, None)?;
                new_seg.initialize_base_hierarchy_level(
                    level,
                    &extractors,
                    use_mapping.then_some(&mapping),
                )?;
            }
            self.seg.add_over_segmentation(record, &extractors)?;
            new_seg.add_over_segmentation(record, &extractors)?;
        } else {
            if starts_chunk {
                self.seg
                    .initialize_base_hierarchy_level(&record.hierarchy[0], &extractors, None)?;
            }
            self.seg.add_over_segmentation(record, &extractors)?;
        }

        if position >= set_size - overlap + constraint && self.last_lookahead_start.is_none() {
            self.last_lookahead_start = Some(self.seg.num_frames_added() - 1);
        }
        self.input_frames += 1;
        Ok(output)
    }

    /// Segments the remaining frames.
    pub fn finish(&mut self) -> Result<Vec<SegmentationRecord>> {
        if self.finished || self.input_frames == 0 {
            self.finished = true;
            return Ok(Vec::new());
        }
        let num_frames = self.seg.num_frames_added();
        let output = self.segment_and_output_chunk(num_frames, num_frames)?;
        self.finished = true;
        Ok(output)
    }

    fn segment_and_output_chunk(
        &mut self,
        overlap_start: usize,
        lookahead_start: usize,
    ) -> Result<Vec<SegmentationRecord>> {
        let num_descriptors = 1 + usize::from(self.with_flow);
        let distance = SquaredOrDistance { num_descriptors };
        self.seg.run_hierarchical_segmentation(
            &distance,
            self.config.level_cutoff_fraction,
            self.config.min_region_num,
            self.config.max_region_num,
            true,
        )?;
        let computed_levels = self.seg.computed_hierarchy_levels();
        if computed_levels > self.max_region_ids.len() {
            self.max_region_ids.resize(computed_levels, 0);
        }

        if lookahead_start > 0 {
            self.seg
                .constrain_segmentation_to_frame_interval(0, lookahead_start - 1);
        }
        if overlap_start > 0 {
            self.seg
                .adjust_region_area_to_frame_interval(0, overlap_start - 1);
        }
        self.max_region_ids = self
            .seg
            .assign_unique_region_ids(self.processed_chunk_sets > 0, &self.max_region_ids)?;

        if let Some(new_seg) = self.new_seg.as_mut() {
            let snapshot = self.seg.counterpart_snapshot()?;
            debug!("Passing {} counterparts to the next chunk set", snapshot.len());
            new_seg.pull_counterpart_segmentation_result(&snapshot)?;
        }
        self.seg.discard_bottom_level();

        info!("Outputting hierarchical segmentation of {overlap_start} frames");
        let hierarchy_frame_idx = self.num_output_frames;
        let mut output = Vec::with_capacity(overlap_start);
        for frame in 0..overlap_start {
            let mut record = self
                .seg
                .retrieve_segmentation_3d(frame, self.config.save_descriptors)?;
            record.hierarchy_frame_idx = hierarchy_frame_idx;
            output.push(record);
            self.num_output_frames += 1;
        }
        self.processed_chunk_sets += 1;
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::Smoothing;

    const WIDTH: usize = 8;
    const HEIGHT: usize = 4;

    fn init() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    /// Dark left half, bright right half.
    fn two_halves() -> Vec<u8> {
        (0..WIDTH * HEIGHT)
            .flat_map(|i| {
                if i % WIDTH < WIDTH / 2 {
                    [30, 40, 90]
                } else {
                    [230, 210, 80]
                }
            })
            .collect()
    }

    fn dense_config() -> SegmentationConfig {
        SegmentationConfig {
            chunk_size: 3,
            chunk_overlap_ratio: 0.34,
            num_constraint_frames: 1,
            min_region_size: Some(1),
            smoothing: Smoothing::None,
            spatial_cleanup_step: false,
            ..Default::default()
        }
    }

    fn oversegment(num_frames: usize) -> Vec<SegmentationRecord> {
        let mut stream = DenseStream::new(dense_config(), WIDTH, HEIGHT).unwrap();
        let rgb = two_halves();
        let mut records = Vec::new();
        for _ in 0..num_frames {
            records.extend(stream.push_frame(&rgb, None).unwrap());
        }
        records.extend(stream.finish().unwrap());
        records
    }

    fn corner_ids(record: &SegmentationRecord) -> (i32, i32) {
        let ids = record.render_id_image().unwrap();
        (*ids.get(0, 0).unwrap(), *ids.get(WIDTH - 1, HEIGHT - 1).unwrap())
    }

    #[test]
    fn chunk_geometry() {
        let stream = DenseStream::new(dense_config(), WIDTH, HEIGHT).unwrap();
        assert_eq!(stream.chunk_size(), 3);
        assert_eq!(stream.overlap_frames(), 1);
        assert_eq!(stream.min_region_size(), 1);

        let config = SegmentationConfig {
            chunk_size: 1,
            chunk_overlap_ratio: 0.9,
            frac_min_region_size: 0.1,
            ..Default::default()
        };
        let stream = DenseStream::new(config, 100, 100).unwrap();
        assert_eq!(stream.chunk_size(), 2);
        assert_eq!(stream.overlap_frames(), 1);
        // 0.1^2 * 100 * 100 * 2
        assert_eq!(stream.min_region_size(), 200);

        let config = SegmentationConfig {
            chunk_size: 50,
            max_chunk_memory_mb: Some(1),
            ..Default::default()
        };
        let stream = DenseStream::new(config, 640, 480).unwrap();
        assert!(stream.chunk_size() < 50);
    }

    #[test]
    fn dense_ids_persist_across_chunks() {
        init();
        let records = oversegment(8);
        assert_eq!(records.len(), 8);
        let expected = corner_ids(&records[0]);
        assert_ne!(expected.0, expected.1);
        for (frame, record) in records.iter().enumerate() {
            assert_eq!(record.regions.len(), 2, "frame {frame}");
            assert_eq!(corner_ids(record), expected, "frame {frame}");
            let area: usize = record.regions.iter().map(|r| r.moments.size).sum();
            assert_eq!(area, WIDTH * HEIGHT);
        }
        // Every chunk starts with its hierarchy.
        let chunk_starts: Vec<usize> = records
            .iter()
            .enumerate()
            .filter(|(_, r)| r.has_hierarchy())
            .map(|(i, _)| i)
            .collect();
        assert_eq!(chunk_starts, vec![0, 2, 5]);
        assert_eq!(records[0].overlap_start, 2);
        assert_eq!(records[0].chunk_size, 3);
        assert_eq!(records[2].hierarchy[0].regions.len(), 2);
    }

    #[test]
    fn finished_streams_reject_frames() {
        let mut stream = DenseStream::new(dense_config(), WIDTH, HEIGHT).unwrap();
        assert!(stream.finish().unwrap().is_empty());
        assert!(stream.push_frame(&two_halves(), None).is_err());
        let mut stream = DenseStream::new(dense_config(), WIDTH, HEIGHT).unwrap();
        assert!(stream.push_frame(&two_halves()[3..], None).is_err());
    }

    #[test]
    fn hierarchy_ids_persist_across_chunk_sets() {
        init();
        let records = oversegment(12);
        assert_eq!(records.len(), 12);

        let config = HierarchyConfig {
            min_region_num: 1,
            chunk_set_size: 2,
            chunk_set_overlap: 1,
            constraint_chunks: 1,
            ..Default::default()
        };
        let mut stream = HierarchyStream::new(config, WIDTH, HEIGHT, false).unwrap();
        let rgb = two_halves();
        let mut output = Vec::new();
        for record in &records {
            output.extend(stream.push_record(record, &rgb, None).unwrap());
        }
        output.extend(stream.finish().unwrap());
        assert!(stream.push_record(&records[0], &rgb, None).is_err());

        assert_eq!(output.len(), records.len());
        assert_eq!(stream.num_output_frames(), records.len());
        let expected = corner_ids(&output[0]);
        assert_ne!(expected.0, expected.1);
        for (frame, record) in output.iter().enumerate() {
            assert_eq!(corner_ids(record), expected, "frame {frame}");
        }
        let set_starts: Vec<usize> = output
            .iter()
            .enumerate()
            .filter(|(_, r)| r.has_hierarchy())
            .map(|(i, _)| i)
            .collect();
        assert_eq!(set_starts, vec![0, 2]);
        assert_eq!(output[1].hierarchy_frame_idx, 0);
        assert_eq!(output[5].hierarchy_frame_idx, 2);
        assert_eq!(output[5].chunk_id, 1);
    }

    #[test]
    fn hierarchy_stream_needs_a_leading_hierarchy() {
        let records = oversegment(3);
        let mut stream =
            HierarchyStream::new(HierarchyConfig::default(), WIDTH, HEIGHT, false).unwrap();
        assert!(matches!(
            stream.push_record(&records[1], &two_halves(), None),
            Err(Error::Format(_))
        ));
        let mut wrong = records[0].clone();
        wrong.frame_width = 4;
        assert!(stream.push_record(&wrong, &two_halves(), None).is_err());
    }
}

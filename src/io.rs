//! Per-frame segmentation records and the chunked container they are stored in.
//!
//! A container is a sequence of chunks. Each chunk starts with a header
//!
//! ```text
//! "CHNK" | chunk_id: i32 | num_frames: i32 | offsets: [i64; n] | timestamps: [i64; n] | next: i64
//! ```
//!
//! followed by `n` records `"SEGD" | size: i32 | payload`. The file ends with
//! `"TERM" | num_chunks: i32`. Offsets are absolute file positions of the `SEGD` tags, all
//! integers are little-endian. Payloads are JSON encoded [`SegmentationRecord`]s.

use crate::arrays::{Array2D, IdImage};
use crate::descriptor::RegionDescriptor;
use crate::error::{Error, Result};
use crate::rasterization::{Rasterization, ShapeMoments};
use bytes::{Buf, BufMut, BytesMut};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

const CHUNK_TAG: &[u8; 4] = b"CHNK";
const RECORD_TAG: &[u8; 4] = b"SEGD";
const TERM_TAG: &[u8; 4] = b"TERM";

/// One region within one frame.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RegionRecord {
    pub id: i32,
    pub raster: Rasterization,
    pub moments: ShapeMoments,
}

impl RegionRecord {
    pub fn new(id: i32, raster: Rasterization) -> Self {
        let moments = raster.shape_moments();
        Self {
            id,
            raster,
            moments,
        }
    }
}

/// One region of a hierarchy level, ids instead of indices.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HierarchyRegionRecord {
    pub id: i32,
    pub size: usize,
    /// `-1` on the top level.
    pub parent_id: i32,
    pub neighbor_ids: Vec<i32>,
    pub child_ids: Vec<i32>,
    pub start_frame: usize,
    pub end_frame: usize,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HierarchyLevelRecord {
    pub regions: Vec<HierarchyRegionRecord>,
}

impl HierarchyLevelRecord {
    /// Regions present in `[lhs, rhs]`, neighbors outside of it are dropped.
    pub fn constrained_to_frame_interval(&self, lhs: usize, rhs: usize) -> Self {
        let regions: Vec<HierarchyRegionRecord> = self
            .regions
            .iter()
            .filter(|r| r.start_frame <= rhs && r.end_frame >= lhs)
            .cloned()
            .collect();
        let kept: hashbrown::HashSet<i32> = regions.iter().map(|r| r.id).collect();
        let regions = regions
            .into_iter()
            .map(|mut r| {
                r.neighbor_ids.retain(|n| kept.contains(n));
                r
            })
            .collect();
        Self { regions }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DescriptorRecord {
    pub id: i32,
    pub descriptors: Vec<RegionDescriptor>,
}

/// Segmentation of a single frame.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SegmentationRecord {
    pub frame_width: usize,
    pub frame_height: usize,
    pub chunk_id: usize,
    /// Index of the frame within its hierarchy chunk set.
    #[serde(default)]
    pub hierarchy_frame_idx: usize,
    /// Frames of the chunk that are emitted, later frames only seed constraints.
    #[serde(default)]
    pub overlap_start: usize,
    /// Emitted plus constraint frames of the chunk.
    #[serde(default)]
    pub chunk_size: usize,
    pub regions: Vec<RegionRecord>,
    /// Only present on the first frame of a chunk.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub hierarchy: Vec<HierarchyLevelRecord>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub descriptors: Vec<DescriptorRecord>,
}

impl SegmentationRecord {
    pub fn new(frame_width: usize, frame_height: usize, chunk_id: usize) -> Self {
        Self {
            frame_width,
            frame_height,
            chunk_id,
            ..Default::default()
        }
    }

    /// Builds a record from per-region masks of `width * height` pixels.
    pub fn from_masks<M: AsRef<[bool]>>(width: usize, height: usize, masks: &[(i32, M)]) -> Self {
        let mut record = Self::new(width, height, 0);
        record.regions = masks
            .iter()
            .map(|(id, mask)| RegionRecord::new(*id, Rasterization::from_mask(mask.as_ref(), width)))
            .collect();
        record
    }

    pub fn has_hierarchy(&self) -> bool {
        !self.hierarchy.is_empty()
    }

    /// Paints every region into an id image, uncovered pixels are `-1`.
    pub fn render_id_image(&self) -> Result<IdImage> {
        let mut ids = Array2D::from_fill(-1i32, self.frame_width, self.frame_height);
        for region in &self.regions {
            for s in &region.raster.scan_inter {
                if s.y < 0
                    || s.left_x < 0
                    || s.left_x > s.right_x
                    || s.y as usize >= self.frame_height
                    || s.right_x as usize >= self.frame_width
                {
                    return Err(Error::Format(format!(
                        "scan interval {s:?} of region {} outside of {}x{} frame",
                        region.id, self.frame_width, self.frame_height
                    )));
                }
                ids.get_row_mut(s.y as usize)[s.left_x as usize..=s.right_x as usize].fill(region.id);
            }
        }
        Ok(ids)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(data)?)
    }
}

/// Writes records chunk by chunk. Records are buffered until [`ContainerWriter::write_chunk`].
pub struct ContainerWriter {
    path: PathBuf,
    out: BufWriter<File>,
    /// File position of the next chunk header.
    position: u64,
    num_chunks: i32,
    buffered: Vec<(Vec<u8>, i64)>,
}

impl ContainerWriter {
    pub fn create(path: &Path) -> Result<Self> {
        info!("Writing segmentation to {}", path.display());
        let file = File::create(path).map_err(|source| Error::Open {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(Self {
            path: path.to_path_buf(),
            out: BufWriter::new(file),
            position: 0,
            num_chunks: 0,
            buffered: Vec::new(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn add_record(&mut self, record: &SegmentationRecord, pts: i64) -> Result<()> {
        let payload = record.to_bytes()?;
        self.add_raw_record(payload, pts);
        Ok(())
    }

    pub fn add_raw_record(&mut self, payload: Vec<u8>, pts: i64) {
        self.buffered.push((payload, pts));
    }

    pub fn num_buffered(&self) -> usize {
        self.buffered.len()
    }

    /// Writes buffered records as one chunk. No-op if nothing is buffered.
    pub fn write_chunk(&mut self) -> Result<()> {
        if self.buffered.is_empty() {
            return Ok(());
        }
        let num_frames = self.buffered.len();
        let header_size = 4 + 2 * 4 + num_frames * 2 * 8 + 8;
        let records_size: usize = self.buffered.iter().map(|(p, _)| 8 + p.len()).sum();

        let mut header = BytesMut::with_capacity(header_size);
        header.put_slice(CHUNK_TAG);
        header.put_i32_le(self.num_chunks);
        header.put_i32_le(num_frames as i32);
        let mut offset = self.position + header_size as u64;
        for (payload, _) in &self.buffered {
            header.put_i64_le(offset as i64);
            offset += 8 + payload.len() as u64;
        }
        for (_, pts) in &self.buffered {
            header.put_i64_le(*pts);
        }
        let next = self.position + (header_size + records_size) as u64;
        header.put_i64_le(next as i64);
        self.out.write_all(&header)?;

        for (payload, _) in self.buffered.drain(..) {
            let mut tag = BytesMut::with_capacity(8);
            tag.put_slice(RECORD_TAG);
            tag.put_i32_le(payload.len() as i32);
            self.out.write_all(&tag)?;
            self.out.write_all(&payload)?;
        }
        debug!("Wrote chunk {} with {num_frames} frames", self.num_chunks);
        self.position = next;
        self.num_chunks += 1;
        Ok(())
    }

    fn write_terminator(&mut self) -> Result<()> {
        self.write_chunk()?;
        let mut term = BytesMut::with_capacity(8);
        term.put_slice(TERM_TAG);
        term.put_i32_le(self.num_chunks);
        self.out.write_all(&term)?;
        self.out.flush()?;
        Ok(())
    }

    /// Flushes pending records and terminates the file.
    pub fn finish(mut self) -> Result<()> {
        self.write_terminator()?;
        info!(
            "Finished {} with {} chunks",
            self.path.display(),
            self.num_chunks
        );
        Ok(())
    }

    /// Terminates the current file and continues writing into `path`.
    pub fn flush_and_reopen(&mut self, path: &Path) -> Result<()> {
        self.write_terminator()?;
        *self = Self::create(path)?;
        Ok(())
    }
}

/// Random access reader over a container written by [`ContainerWriter`].
pub struct ContainerReader {
    file: File,
    offsets: Vec<u64>,
    timestamps: Vec<i64>,
    num_chunks: usize,
    current_frame: usize,
}

/// Reads `len` bytes, refusing lengths beyond the end of the file before allocating.
fn read_exact_buf(file: &mut File, len: usize) -> Result<BytesMut> {
    let remaining = file
        .metadata()?
        .len()
        .saturating_sub(file.stream_position()?);
    if len as u64 > remaining {
        return Err(Error::Format(format!(
            "truncated container: {len} bytes requested, {remaining} left"
        )));
    }
    let mut buf = BytesMut::zeroed(len);
    file.read_exact(&mut buf).map_err(|e| match e.kind() {
        std::io::ErrorKind::UnexpectedEof => Error::Format("truncated container".to_string()),
        _ => Error::Io(e),
    })?;
    Ok(buf)
}

impl ContainerReader {
    /// Opens a container and walks its chunk headers.
    pub fn open(path: &Path) -> Result<Self> {
        info!("Reading segmentation from {}", path.display());
        let mut file = File::open(path).map_err(|source| Error::Open {
            path: path.to_path_buf(),
            source,
        })?;
        let mut offsets = Vec::new();
        let mut timestamps = Vec::new();
        let mut expected_chunk = 0i32;
        loop {
            let mut head = read_exact_buf(&mut file, 8)?;
            let mut tag = [0u8; 4];
            head.copy_to_slice(&mut tag);
            let value = head.get_i32_le();
            if &tag == TERM_TAG {
                if value != expected_chunk {
                    return Err(Error::Format(format!(
                        "terminator announces {value} chunks, found {expected_chunk}"
                    )));
                }
                break;
            }
            if &tag != CHUNK_TAG {
                return Err(Error::Format(format!(
                    "expected chunk header, found {:?}",
                    String::from_utf8_lossy(&tag)
                )));
            }
            if value != expected_chunk {
                return Err(Error::Format(format!(
                    "chunk {value} out of order, expected {expected_chunk}"
                )));
            }
            let num_frames = read_exact_buf(&mut file, 4)?.get_i32_le();
            if num_frames < 0 {
                return Err(Error::Format(format!("negative frame count {num_frames}")));
            }
            let num_frames = num_frames as usize;
            let table_len = num_frames
                .checked_mul(16)
                .and_then(|n| n.checked_add(8))
                .ok_or_else(|| Error::Format(format!("frame count {num_frames} too large")))?;
            let mut table = read_exact_buf(&mut file, table_len)?;
            for _ in 0..num_frames {
                offsets.push(table.get_i64_le() as u64);
            }
            for _ in 0..num_frames {
                timestamps.push(table.get_i64_le());
            }
            let next = table.get_i64_le() as u64;
            file.seek(SeekFrom::Start(next))?;
            expected_chunk += 1;
        }
        debug!("Container holds {} frames in {expected_chunk} chunks", offsets.len());
        Ok(Self {
            file,
            offsets,
            timestamps,
            num_chunks: expected_chunk as usize,
            current_frame: 0,
        })
    }

    pub fn num_frames(&self) -> usize {
        self.offsets.len()
    }

    pub fn num_chunks(&self) -> usize {
        self.num_chunks
    }

    pub fn timestamps(&self) -> &[i64] {
        &self.timestamps
    }

    pub fn seek_to_frame(&mut self, frame: usize) -> Result<()> {
        if frame >= self.offsets.len() {
            return Err(Error::MissingFrame(frame));
        }
        self.current_frame = frame;
        Ok(())
    }

    /// Reads the payload of the current frame and advances.
    pub fn read_next_frame_raw(&mut self) -> Result<Vec<u8>> {
        let offset = *self
            .offsets
            .get(self.current_frame)
            .ok_or(Error::MissingFrame(self.current_frame))?;
        self.file.seek(SeekFrom::Start(offset))?;
        let mut head = read_exact_buf(&mut self.file, 8)?;
        let mut tag = [0u8; 4];
        head.copy_to_slice(&mut tag);
        if &tag != RECORD_TAG {
            return Err(Error::Format(format!(
                "expected record header at {offset}, found {:?}",
                String::from_utf8_lossy(&tag)
            )));
        }
        let size = head.get_i32_le();
        if size < 0 {
            return Err(Error::Format(format!("negative record size {size}")));
        }
        let payload = read_exact_buf(&mut self.file, size as usize)?;
        self.current_frame += 1;
        Ok(payload.to_vec())
    }

    pub fn read_next_frame(&mut self) -> Result<SegmentationRecord> {
        SegmentationRecord::from_bytes(&self.read_next_frame_raw()?)
    }

    /// Frame dimensions, taken from the first record. Keeps the read position.
    pub fn resolution(&mut self) -> Result<(usize, usize)> {
        let current = self.current_frame;
        self.seek_to_frame(0)?;
        let record = self.read_next_frame()?;
        self.current_frame = current;
        Ok((record.frame_width, record.frame_height))
    }
}

/// Dumps an id image with pseudo random region colors.
#[cfg(test)]
pub(crate) fn save_id_image_as_png(ids: &IdImage, path: &Path, seed: u64) {
    use image::{save_buffer, ColorType};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    let mut rng = StdRng::seed_from_u64(seed);
    let mut colors = hashbrown::HashMap::new();
    let buf: Vec<u8> = ids
        .data
        .iter()
        .flat_map(|id| {
            if *id < 0 {
                [0, 0, 0]
            } else {
                *colors
                    .entry(*id)
                    .or_insert_with(|| [rng.random(), rng.random(), rng.random()])
            }
        })
        .collect();
    save_buffer(
        path,
        &buf,
        ids.width as u32,
        ids.height as u32,
        ColorType::Rgb8,
    )
    .unwrap()
}

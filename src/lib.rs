//! Streaming hierarchical video segmentation in Rust.
//!
//! The pipeline works in two passes over a video stream:
//!
//! 1. A dense pass builds a space-time pixel graph per chunk of frames and oversegments it with
//!    a Felzenszwalb-Huttenlocher style union-find merge. Chunks overlap so region ids stay
//!    consistent over time, the overlap of the previous chunk is pulled forward as hard
//!    constraints.
//! 2. A region pass reads the oversegmentation back, computes appearance (and optionally flow)
//!    descriptors per region and agglomerates regions level by level into a hierarchy. Chunk
//!    sets overlap as well and the previous result is pulled forward as counterparts.
//!
//! Both passes emit [`io::SegmentationRecord`]s, one per frame, which can be written to and read
//! from the chunked container in [`io`].
//!
//! Dense oversegmentation of packed RGB24 frames:
//!
//! ```rust
//! use video_segment::common::SegmentationConfig;
//! use video_segment::stream::DenseStream;
//!
//! fn main() -> video_segment::error::Result<()> {
//!     let (width, height) = (16, 8);
//!     let mut config = SegmentationConfig::default();
//!     config.chunk_size = 4;
//!     let mut stream = DenseStream::new(config, width, height)?;
//!     let mut records = Vec::new();
//!     for t in 0..6u8 {
//!         let frame: Vec<u8> = (0..width * height)
//!             .flat_map(|i| if i % width < width / 2 { [10 + t, 20, 30] } else { [200, 180, 40] })
//!             .collect();
//!         records.extend(stream.push_frame(&frame, None)?);
//!     }
//!     records.extend(stream.finish()?);
//!     assert_eq!(records.len(), 6);
//!     Ok(())
//! }
//! ```
//!
//! The records are then fed together with the same RGB frames into a
//! [`stream::HierarchyStream`], which attaches the region hierarchy.
//!
//! Large streams can page finished chunks to disk through the [`swap`] service.
//!
//! It's strongly recommended to use this in release build. The hot loops of the pixel graph use
//! `assume!` to avoid boundary checks and are compiled for several SIMD targets.
//!
//! Note: There may be problems in builds for non-x86 platforms.
//!

pub mod agglomeration;
pub mod arrays;
pub mod cielab;
pub mod common;
pub mod components;
pub mod dense_graph;
pub mod descriptor;
pub mod error;
pub mod histograms;
pub mod io;
pub mod rasterization;
pub mod region;
pub mod segmentation;
pub mod stream;
pub mod swap;
pub mod union_find;

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Pixel distance used for the edge weights of the dense pixel graph.
///
/// Both variants operate on RGB values scaled to `[0, 1]` and are normalized so the maximal
/// distance is 1.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ColorDistance {
    /// Mean absolute channel difference.
    L1,
    /// Euclidean channel difference divided by `sqrt(3)`.
    L2,
}

/// Pre-filter applied to every frame before edge weights are computed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Smoothing {
    None,
    /// Separable `[1 2 1] / 4` kernel.
    Binomial3,
}

/// Configuration of the dense oversegmentation and its chunking.
///
/// Defaults follow the values the algorithm is tuned for. `parameter_k` in particular is
/// calibrated against `rint = weight + k / size`.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SegmentationConfig {
    /// Felzenszwalb-Huttenlocher style scale parameter. Higher means larger regions.
    pub parameter_k: f32,
    /// Minimal region size as fraction of the frame dimensions. The final value is
    /// `frac^2 * width * height * chunk_size` voxels.
    pub frac_min_region_size: f32,
    /// Overrides the computed minimal region size when set.
    pub min_region_size: Option<usize>,
    /// Number of frames per chunk, clamped to at least 2.
    pub chunk_size: usize,
    /// Overlap between chunks as a fraction of `chunk_size`, clamped to `[1, 10]` frames.
    pub chunk_overlap_ratio: f32,
    /// Number of overlap frames whose result is pulled forward as hard constraints.
    pub num_constraint_frames: usize,
    /// Caps the chunk size so the pixel graph of one chunk stays below this many MiB.
    pub max_chunk_memory_mb: Option<usize>,
    /// Segment every frame spatially before the space-time pass.
    pub two_stage_oversegment: bool,
    pub thin_structure_suppression: bool,
    pub enforce_n4_connectivity: bool,
    /// Redirect tiny spatial fragments to their largest spatial neighbor.
    pub spatial_cleanup_step: bool,
    pub color_distance: ColorDistance,
    pub smoothing: Smoothing,
}

impl Default for SegmentationConfig {
    fn default() -> Self {
        Self {
            parameter_k: 0.02,
            frac_min_region_size: 0.01,
            min_region_size: None,
            chunk_size: 20,
            chunk_overlap_ratio: 0.2,
            num_constraint_frames: 1,
            max_chunk_memory_mb: None,
            two_stage_oversegment: false,
            thin_structure_suppression: true,
            enforce_n4_connectivity: true,
            spatial_cleanup_step: true,
            color_distance: ColorDistance::L2,
            smoothing: Smoothing::Binomial3,
        }
    }
}

impl SegmentationConfig {
    pub fn validate(&self) -> Result<()> {
        if self.parameter_k.is_nan() || self.parameter_k <= 0.0 {
            return Err(Error::InvalidConfig(format!(
                "parameter_k must be positive, got {}",
                self.parameter_k
            )));
        }
        if self.chunk_size == 0 {
            return Err(Error::InvalidConfig("chunk_size must be positive".into()));
        }
        if !(0.0..1.0).contains(&self.chunk_overlap_ratio) {
            return Err(Error::InvalidConfig(format!(
                "chunk_overlap_ratio must be in [0, 1), got {}",
                self.chunk_overlap_ratio
            )));
        }
        Ok(())
    }
}

/// Configuration of the region agglomeration and the chunk sets it runs over.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct HierarchyConfig {
    /// Hierarchy construction stops once a level has at most this many regions.
    pub min_region_num: usize,
    /// The first level is reduced to at most this many regions.
    pub max_region_num: usize,
    /// Fraction of regions that survive each level.
    pub level_cutoff_fraction: f32,
    pub frac_min_region_size: f32,
    pub luminance_bins: usize,
    pub color_bins: usize,
    pub flow_bins: usize,
    /// Frames per appearance window.
    pub window_size: usize,
    /// Number of oversegmentation chunks merged into one hierarchy.
    pub chunk_set_size: usize,
    /// Number of trailing chunks shared with the next chunk set.
    pub chunk_set_overlap: usize,
    /// Number of overlap chunks used as constraints in the next chunk set.
    pub constraint_chunks: usize,
    /// Attach serialized descriptors to every emitted region.
    pub save_descriptors: bool,
}

impl Default for HierarchyConfig {
    fn default() -> Self {
        Self {
            min_region_num: 10,
            max_region_num: 2000,
            level_cutoff_fraction: 0.8,
            frac_min_region_size: 0.01,
            luminance_bins: 10,
            color_bins: 20,
            flow_bins: 16,
            window_size: 20,
            chunk_set_size: 6,
            chunk_set_overlap: 2,
            constraint_chunks: 1,
            save_descriptors: false,
        }
    }
}

impl HierarchyConfig {
    pub fn validate(&self) -> Result<()> {
        if self.chunk_set_size < 2 {
            return Err(Error::InvalidConfig(
                "at least two chunks per chunk set required".into(),
            ));
        }
        if self.chunk_set_overlap == 0 || self.chunk_set_overlap >= self.chunk_set_size {
            return Err(Error::InvalidConfig(format!(
                "chunk_set_overlap must be in [1, {}), got {}",
                self.chunk_set_size, self.chunk_set_overlap
            )));
        }
        if self.constraint_chunks > self.chunk_set_overlap {
            return Err(Error::InvalidConfig(
                "constraint_chunks must not exceed chunk_set_overlap".into(),
            ));
        }
        if !(self.level_cutoff_fraction > 0.0 && self.level_cutoff_fraction < 1.0) {
            return Err(Error::InvalidConfig(format!(
                "level_cutoff_fraction must be in (0, 1), got {}",
                self.level_cutoff_fraction
            )));
        }
        if self.luminance_bins < 2 || self.color_bins < 2 || self.flow_bins < 2 {
            return Err(Error::InvalidConfig("histograms need at least 2 bins".into()));
        }
        Ok(())
    }
}

/// Configuration of the out-of-core swap service.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SwapConfig {
    pub work_dir: PathBuf,
    pub read_threads: usize,
    pub write_threads: usize,
    /// Depth at which `write_item` and `issue_read_notice` start blocking.
    pub queue_bound: usize,
    #[serde(with = "duration_ms")]
    pub warn_after: Duration,
    #[serde(with = "duration_ms")]
    pub fail_after: Duration,
}

impl Default for SwapConfig {
    fn default() -> Self {
        Self {
            work_dir: std::env::temp_dir(),
            read_threads: 1,
            write_threads: 1,
            queue_bound: 20,
            warn_after: Duration::from_secs(5),
            fail_after: Duration::from_secs(60),
        }
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

/// Top level configuration file layout.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub segmentation: SegmentationConfig,
    pub hierarchy: HierarchyConfig,
    pub swap: SwapConfig,
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        self.segmentation.validate()?;
        self.hierarchy.validate()
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let data = fs::read_to_string(path).map_err(|source| Error::Open {
        path: path.to_path_buf(),
        source,
    })?;
    let config: Config = serde_json::from_str(&data)?;
    config.validate()?;
    Ok(config)
}

pub(crate) fn split_length_to_ranges(length: usize, splits: usize) -> Vec<Range<usize>> {
    let splits = splits.max(1);
    let chunk_size = length / splits;
    let rem = length % splits;
    (0..splits)
        .scan((rem, 0usize), |(r, acc), _split| {
            let mut size = chunk_size;
            if *r > 0 {
                *r -= 1;
                size += 1;
            }
            let out = (*acc, *acc + size);
            *acc += size;
            Some(out.0..out.1)
        })
        .filter(|range| !range.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_covers_whole_length() {
        let ranges = split_length_to_ranges(10, 3);
        assert_eq!(ranges, vec![0..4, 4..7, 7..10]);
        assert!(split_length_to_ranges(2, 8).iter().all(|r| r.len() == 1));
    }

    #[test]
    fn partial_config_uses_defaults() {
        let config: Config =
            serde_json::from_str(r#"{"segmentation": {"chunk_size": 8}, "swap": {"warn_after": 250}}"#)
                .unwrap();
        assert_eq!(config.segmentation.chunk_size, 8);
        assert_eq!(config.segmentation.num_constraint_frames, 1);
        assert_eq!(config.hierarchy.chunk_set_size, 6);
        assert_eq!(config.swap.warn_after, Duration::from_millis(250));
        assert_eq!(config.swap.queue_bound, 20);
        config.validate().unwrap();
    }

    fn temp_config(name: &str, contents: &str) -> PathBuf {
        let path = std::env::temp_dir()
            .join(format!("video-segment-config-{}-{name}.json", std::process::id()));
        fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn loads_partial_config_file() {
        let path = temp_config(
            "partial",
            r#"{"hierarchy": {"chunk_set_size": 4, "chunk_set_overlap": 1}}"#,
        );
        let config = load_config(&path).unwrap();
        assert_eq!(config.hierarchy.chunk_set_size, 4);
        assert_eq!(config.hierarchy.chunk_set_overlap, 1);
        assert_eq!(config.segmentation.chunk_size, 20);
        assert_eq!(config.swap.fail_after, Duration::from_secs(60));
        let _ = fs::remove_file(path);
    }

    #[test]
    fn load_config_reports_errors() {
        let missing = std::env::temp_dir().join("video-segment-config-does-not-exist.json");
        assert!(matches!(load_config(&missing), Err(Error::Open { .. })));

        let broken = temp_config("broken", r#"{"segmentation": {"chunk_size": }"#);
        assert!(matches!(load_config(&broken), Err(Error::Json(_))));
        let _ = fs::remove_file(broken);

        let invalid = temp_config("invalid", r#"{"segmentation": {"chunk_overlap_ratio": 1.5}}"#);
        assert!(matches!(load_config(&invalid), Err(Error::InvalidConfig(_))));
        let _ = fs::remove_file(invalid);
    }

    #[test]
    fn rejects_inconsistent_chunk_sets() {
        let config = HierarchyConfig {
            chunk_set_overlap: 6,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));
    }
}

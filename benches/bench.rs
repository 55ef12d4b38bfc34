use criterion::*;
use image::imageops::FilterType;
use image::{Rgb, RgbImage};
use std::time::Duration;
use video_segment::arrays::{FeatureFrame, IdImage, LabFrame};
use video_segment::common::{HierarchyConfig, SegmentationConfig, Smoothing};
use video_segment::components::{assign_disjoint_set, label_components};
use video_segment::io::SegmentationRecord;
use video_segment::stream::{DenseStream, HierarchyStream};

/// Moving blobs over a gradient, enough structure to get a few hundred regions.
fn synthetic_frame(width: u32, height: u32, t: u32) -> RgbImage {
    RgbImage::from_fn(width, height, |x, y| {
        let cx = (width / 4 + 2 * t) % width;
        let cy = height / 2;
        let dx = x.abs_diff(cx);
        let dy = y.abs_diff(cy);
        if dx * dx + dy * dy < (height / 4) * (height / 4) {
            Rgb([220, 40, 30])
        } else if (x / 32 + y / 32) % 2 == 0 {
            Rgb([(x % 256) as u8, 120, (y % 256) as u8])
        } else {
            Rgb([30, (x % 256) as u8, 200])
        }
    })
}

fn synthetic_video(width: u32, height: u32, frames: u32) -> Vec<Vec<u8>> {
    (0..frames)
        .map(|t| synthetic_frame(width, height, t).into_raw())
        .collect()
}

fn oversegment(frames: &[Vec<u8>], width: usize, height: usize) -> Vec<SegmentationRecord> {
    let config = SegmentationConfig {
        chunk_size: 8,
        ..Default::default()
    };
    let mut stream = DenseStream::new(config, width, height).unwrap();
    let mut records = Vec::new();
    for frame in frames {
        records.extend(stream.push_frame(frame, None).unwrap());
    }
    records.extend(stream.finish().unwrap());
    records
}

fn bench_frame_conversion(c: &mut Criterion) {
    sas::init();
    let img = synthetic_frame(640, 480, 0).into_raw();
    let mut group = c.benchmark_group("frame conversion");
    group.bench_function("rgb_to_lab", |b| {
        b.iter(|| {
            let _ = black_box(LabFrame::from_rgb8(&img, 640, 480).unwrap());
        });
    });
    for smoothing in [Smoothing::None, Smoothing::Binomial3] {
        group.bench_with_input(
            BenchmarkId::new("rgb_to_features", format!("{:?}", smoothing)),
            &smoothing,
            |b, smoothing| {
                b.iter(|| {
                    let _ = black_box(FeatureFrame::from_rgb8(&img, 640, 480, *smoothing).unwrap());
                });
            },
        );
    }
    group.finish();
}

fn bench_components(c: &mut Criterion) {
    sas::init();
    let records = oversegment(&synthetic_video(320, 240, 4), 320, 240);
    let ids: IdImage = records[0].render_id_image().unwrap();
    c.bench_function("assign_disjoint_set", |b| {
        b.iter(|| {
            let _ = black_box(assign_disjoint_set(&ids).unwrap());
        });
    });
    c.bench_function("label_components", |b| {
        b.iter(|| {
            let _ = black_box(label_components(&ids).unwrap());
        });
    });
}

fn bench_dense_stream(c: &mut Criterion) {
    sas::init();
    let mut group = c.benchmark_group("dense stream");
    group.sample_size(10);
    for (width, height) in [(160u32, 120u32), (320, 240), (640, 480)] {
        let frames: Vec<Vec<u8>> = (0..16)
            .map(|t| {
                let img = synthetic_frame(1280, 960, t);
                image::imageops::resize(&img, width, height, FilterType::Triangle).into_raw()
            })
            .collect();
        group.bench_with_input(
            BenchmarkId::new("oversegment", format!("{}x{}", width, height)),
            &frames,
            |b, frames| {
                b.iter(|| black_box(oversegment(frames, width as usize, height as usize)));
            },
        );
    }
    group.finish();
}

fn bench_hierarchy_stream(c: &mut Criterion) {
    sas::init();
    let (width, height) = (320usize, 240usize);
    let frames = synthetic_video(width as u32, height as u32, 16);
    let records = oversegment(&frames, width, height);
    let mut group = c.benchmark_group("hierarchy stream");
    group.sample_size(10);
    group.bench_function("agglomerate", |b| {
        b.iter(|| {
            let config = HierarchyConfig {
                chunk_set_size: 2,
                chunk_set_overlap: 1,
                ..Default::default()
            };
            let mut stream = HierarchyStream::new(config, width, height, false).unwrap();
            let mut output = Vec::new();
            for (record, frame) in records.iter().zip(&frames) {
                output.extend(stream.push_record(record, frame, None).unwrap());
            }
            output.extend(stream.finish().unwrap());
            black_box(output)
        });
    });
    group.finish();
}

criterion_group!(name = benches;
config = Criterion::default().measurement_time(Duration::from_secs(10)).warm_up_time(Duration::from_secs(3));
targets = bench_frame_conversion, bench_components);
criterion_group!(name = benches1;
config = Criterion::default().measurement_time(Duration::from_secs(30)).warm_up_time(Duration::from_secs(5));
targets = bench_dense_stream, bench_hierarchy_stream);
criterion_main!(benches, benches1);

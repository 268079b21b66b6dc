use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

use bytes::Bytes;
use mjpeg_httpd::encode::{CpuEncoder, Encoder};
use mjpeg_httpd::video::{EncodedFrame, Frame, PixelFormat};

fn yuyv_frame(width: u32, height: u32) -> Frame {
    let mut frame = Frame::new();
    frame.width = width;
    frame.height = height;
    frame.format = PixelFormat::Yuyv;
    frame.stride = width * 2;
    let data: Vec<u8> = (0..(width * height * 2) as usize)
        .map(|i| (i % 251) as u8)
        .collect();
    frame.write_from(&data);
    frame
}

fn benchmark_cpu_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("cpu_encode");

    for (width, height) in [(320u32, 240u32), (640, 480), (1280, 720)] {
        let frame = yuyv_frame(width, height);
        let mut encoder = CpuEncoder::new(80);
        let mut out = Vec::new();

        group.bench_with_input(
            BenchmarkId::new("yuyv", format!("{}x{}", width, height)),
            &frame,
            |b, frame| {
                b.iter(|| {
                    encoder.encode(black_box(frame), &mut out).unwrap();
                    black_box(out.len())
                });
            },
        );
    }

    group.finish();
}

fn benchmark_payload_hash(c: &mut Criterion) {
    let mut group = c.benchmark_group("payload_hash");

    // Typical encoded-frame sizes.
    for size in [20_000usize, 100_000, 400_000] {
        let payload: Vec<u8> = (0..size).map(|i| (i % 253) as u8).collect();
        let raw = yuyv_frame(16, 16);

        group.bench_with_input(BenchmarkId::new("jpeg_size", size), &payload, |b, payload| {
            b.iter(|| {
                let frame = EncodedFrame::from_jpeg(
                    Bytes::copy_from_slice(black_box(payload)),
                    &raw,
                    0,
                    1,
                    0.0,
                    0.0,
                );
                black_box(frame.hash)
            });
        });
    }

    group.finish();
}

criterion_group!(benches, benchmark_cpu_encode, benchmark_payload_hash);
criterion_main!(benches);

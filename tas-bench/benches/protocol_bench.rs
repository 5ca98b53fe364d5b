//! Protocol encoding/decoding benchmarks.

use bytes::Bytes;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use tas_protocol::frame::Frame;
use tas_protocol::message::{Operation, Request, Response, RwItem, RwItemResult, RwParams, RwResult};
use tas_protocol::{device_id_hash, hash_to_str, Decoder, Encoder};

/// RW request carrying `items` 8-byte writes.
fn create_rw_request(items: usize) -> Request {
    let items = (0..items)
        .map(|i| RwItem::write(0x7000_0000 + (i as u64) * 8, vec![0xA5; 8]))
        .collect();
    Request::new("bench-1", Operation::Rw)
        .with_params(serde_json::to_value(RwParams { items }).unwrap())
}

/// RW response carrying one block read of `size` bytes.
fn create_rw_response(size: usize) -> Response {
    let result = RwResult {
        results: vec![RwItemResult::ok(size as u32, vec![0x5A; size])],
    };
    Response::ok("bench-1", serde_json::to_value(result).unwrap())
}

fn bench_frame_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("frame_encode");

    for size in [100, 1000, 10000] {
        let frame = Frame::new(Bytes::from("x".repeat(size)));

        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &frame, |b, frame| {
            b.iter(|| black_box(frame.encode().unwrap()));
        });
    }

    group.finish();
}

fn bench_frame_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("frame_decode");

    for size in [100, 1000, 10000] {
        let encoded = Frame::new(Bytes::from("x".repeat(size))).encode().unwrap();

        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &encoded, |b, encoded| {
            b.iter(|| {
                let mut buf = encoded.clone();
                black_box(Frame::decode(&mut buf).unwrap())
            });
        });
    }

    group.finish();
}

fn bench_rw_request(c: &mut Criterion) {
    let mut group = c.benchmark_group("rw_request");

    for items in [1, 16, 256] {
        let request = create_rw_request(items);
        let encoded = Encoder::encode_request(&request).unwrap();

        group.throughput(Throughput::Elements(items as u64));
        group.bench_with_input(BenchmarkId::new("encode", items), &request, |b, request| {
            b.iter(|| black_box(Encoder::encode_request(request).unwrap()));
        });
        group.bench_with_input(BenchmarkId::new("decode", items), &encoded, |b, encoded| {
            b.iter(|| {
                let mut decoder = Decoder::new();
                decoder.extend(encoded);
                black_box(decoder.decode_request().unwrap())
            });
        });
    }

    group.finish();
}

fn bench_rw_response(c: &mut Criterion) {
    let mut group = c.benchmark_group("rw_response");

    for size in [8, 1024, 16384] {
        let response = create_rw_response(size);
        let encoded = Encoder::encode_response(&response).unwrap();

        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::new("encode", size), &response, |b, response| {
            b.iter(|| black_box(Encoder::encode_response(response).unwrap()));
        });
        group.bench_with_input(BenchmarkId::new("decode", size), &encoded, |b, encoded| {
            b.iter(|| {
                let mut decoder = Decoder::new();
                decoder.extend(encoded);
                black_box(decoder.decode_response().unwrap())
            });
        });
    }

    group.finish();
}

fn bench_crc32c(c: &mut Criterion) {
    let mut group = c.benchmark_group("crc32c");

    for size in [100, 1000, 10000, 100000] {
        let data = vec![0x42u8; size];

        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &data, |b, data| {
            b.iter(|| black_box(crc32c::crc32c(data)));
        });
    }

    group.finish();
}

fn bench_device_id_hash(c: &mut Criterion) {
    let device_id = [0x1234_5678, 0x9abc_def0, 0x0fed_cba9, 0x8765_4321];

    c.bench_function("device_id_hash_str", |b| {
        b.iter(|| black_box(hash_to_str(device_id_hash(black_box(&device_id)))));
    });
}

criterion_group!(
    benches,
    bench_frame_encode,
    bench_frame_decode,
    bench_rw_request,
    bench_rw_response,
    bench_crc32c,
    bench_device_id_hash,
);

criterion_main!(benches);

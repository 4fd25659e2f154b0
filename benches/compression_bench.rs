use criterion::{black_box, criterion_group, criterion_main, Criterion};
use std::io::Cursor;
use wimrs::archive::WriteOptions;
use wimrs::chunked::compress_resource;
use wimrs::codec::pool::CodecPool;
use wimrs::codec::CodecRegistry;
use wimrs::header::CompressionKind;

fn bench_chunked_compress(c: &mut Criterion) {
    let data = vec![0u8; 1024 * 1024];
    let registry = CodecRegistry::with_defaults();
    let pool = CodecPool::new(2);

    c.bench_function("xpress_compress_1mb", |b| {
        b.iter(|| {
            let mut input = Cursor::new(black_box(data.clone()));
            let mut output = Cursor::new(Vec::new());
            compress_resource(&mut input, data.len() as u64, &mut output, CompressionKind::Xpress, &registry, &pool, None, false).unwrap();
        })
    });

    c.bench_function("lzx_compress_1mb", |b| {
        b.iter(|| {
            let mut input = Cursor::new(black_box(data.clone()));
            let mut output = Cursor::new(Vec::new());
            compress_resource(&mut input, data.len() as u64, &mut output, CompressionKind::Lzx, &registry, &pool, None, false).unwrap();
        })
    });

    c.bench_function("copy_1mb", |b| {
        b.iter(|| {
            let mut input = Cursor::new(black_box(data.clone()));
            let mut output = Cursor::new(Vec::new());
            compress_resource(&mut input, data.len() as u64, &mut output, CompressionKind::Copy, &registry, &pool, None, false).unwrap();
        })
    });
}

fn bench_capture(c: &mut Criterion) {
    let dir = tempfile::tempdir().unwrap();
    for i in 0..64 {
        std::fs::write(dir.path().join(format!("f{i}.bin")), vec![(i % 251) as u8; 16 * 1024]).unwrap();
    }
    let opts = WriteOptions { compression: CompressionKind::Xpress, threshold: None, threads: 2, integrity: false };

    c.bench_function("capture_64_files_16kib", |b| {
        b.iter(|| {
            let out = tempfile::NamedTempFile::new().unwrap();
            wimrs::archive::capture(out.path(), dir.path(), &Default::default(), &opts).unwrap();
        })
    });
}

criterion_group!(benches, bench_chunked_compress, bench_capture);
criterion_main!(benches);

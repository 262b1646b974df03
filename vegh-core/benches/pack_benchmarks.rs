/*!
Performance benchmarks for the Vegh snapshot engine.
These measure pack, check, restore and LOC throughput over generated trees.
*/

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::fs;
use std::path::Path;
use tempfile::TempDir;
use vegh_core::{
    create_default_engine, GzipCompressor, NoCompression, PackOptions, SnapshotEngine, VeghConfig,
};

// Build a source tree of `files` files with roughly `file_kb` KiB of code each
fn generate_tree(root: &Path, files: usize, file_kb: usize) -> u64 {
    let mut total = 0;
    for i in 0..files {
        let dir = root.join(format!("module_{}", i % 8));
        fs::create_dir_all(&dir).unwrap();

        let mut content = String::with_capacity(file_kb * 1024);
        let mut line = 0;
        while content.len() < file_kb * 1024 {
            if line % 10 == 0 {
                content.push_str(&format!("// section {line} of file {i}\n"));
            } else {
                content.push_str(&format!("let value_{line} = compute({line}, {i});\n"));
            }
            line += 1;
        }
        total += content.len() as u64;
        fs::write(dir.join(format!("file_{i}.rs")), content).unwrap();
    }
    total
}

fn benchmark_pack(c: &mut Criterion) {
    let mut group = c.benchmark_group("pack");
    group.sample_size(10);

    for (files, file_kb) in [(100, 4), (500, 4), (20, 512)].iter() {
        let temp_dir = TempDir::new().unwrap();
        let source = temp_dir.path().join("src");
        let bytes = generate_tree(&source, *files, *file_kb);
        let output = temp_dir.path().join("bench.snap");
        let engine = create_default_engine();

        group.throughput(Throughput::Bytes(bytes));
        group.bench_with_input(
            BenchmarkId::new("gzip", format!("{files}x{file_kb}KB")),
            &source,
            |b, source| {
                b.iter(|| {
                    black_box(engine.pack(source, &output, &PackOptions::default()).unwrap());
                });
            },
        );
    }

    group.finish();
}

fn benchmark_compression_levels(c: &mut Criterion) {
    let mut group = c.benchmark_group("compression_comparison");
    group.sample_size(10);

    let temp_dir = TempDir::new().unwrap();
    let source = temp_dir.path().join("src");
    let bytes = generate_tree(&source, 200, 16);
    let output = temp_dir.path().join("bench.snap");
    group.throughput(Throughput::Bytes(bytes));

    let fast = SnapshotEngine::new(VeghConfig::default(), GzipCompressor::fast());
    group.bench_function("gzip_fast", |b| {
        b.iter(|| black_box(fast.pack(&source, &output, &PackOptions::default()).unwrap()));
    });

    let default = create_default_engine();
    group.bench_function("gzip_default", |b| {
        b.iter(|| black_box(default.pack(&source, &output, &PackOptions::default()).unwrap()));
    });

    let max = SnapshotEngine::new(VeghConfig::default(), GzipCompressor::max());
    group.bench_function("gzip_max", |b| {
        b.iter(|| black_box(max.pack(&source, &output, &PackOptions::default()).unwrap()));
    });

    let none = SnapshotEngine::new(VeghConfig::default(), NoCompression::new());
    group.bench_function("no_compression", |b| {
        b.iter(|| black_box(none.pack(&source, &output, &PackOptions::default()).unwrap()));
    });

    group.finish();
}

fn benchmark_read_operations(c: &mut Criterion) {
    let mut group = c.benchmark_group("read_operations");
    group.sample_size(10);

    let temp_dir = TempDir::new().unwrap();
    let source = temp_dir.path().join("src");
    let bytes = generate_tree(&source, 300, 8);
    let snapshot = temp_dir.path().join("bench.snap");
    let engine = create_default_engine();
    engine.pack(&source, &snapshot, &PackOptions::default()).unwrap();
    group.throughput(Throughput::Bytes(bytes));

    group.bench_function("list", |b| {
        b.iter(|| black_box(engine.list(&snapshot).unwrap()));
    });

    group.bench_function("check", |b| {
        b.iter(|| black_box(engine.check(&snapshot).unwrap()));
    });

    group.bench_function("loc", |b| {
        b.iter(|| black_box(engine.loc(&snapshot).unwrap()));
    });

    let dest = temp_dir.path().join("restored");
    group.bench_function("restore", |b| {
        b.iter(|| black_box(engine.restore(&snapshot, &dest).unwrap()));
    });

    group.finish();
}

criterion_group!(
    benches,
    benchmark_pack,
    benchmark_compression_levels,
    benchmark_read_operations
);
criterion_main!(benches);

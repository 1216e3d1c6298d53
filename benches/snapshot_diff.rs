//! Benchmarks for snapshot diffing

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use filesync::snapshot::{diff, DirectorySnapshot, FileSnapshot};
use filesync::types::*;

fn rule() -> FileTriggerRouter {
    FileTriggerRouter::new(
        FileTrigger::new("docs", "/srv/docs"),
        FileRouter {
            router_id: "corp_to_store".to_string(),
            source_node_group_id: "corp".to_string(),
            target_node_group_id: "store".to_string(),
        },
    )
}

/// `count` files spread over 10 directories
fn snapshot(
    rule: &FileTriggerRouter,
    count: usize,
    mtime: impl Fn(usize) -> i64,
) -> DirectorySnapshot {
    let mut snapshot = DirectorySnapshot::for_rule(rule);
    for i in 0..count {
        let mut file =
            FileSnapshot::new(rule, format!("dir{}", i % 10), format!("file{}.dat", i));
        file.file_size = 1024 + i as u64;
        file.file_modified_time = mtime(i);
        file.crc32_checksum = i as u32;
        snapshot.insert(file).unwrap();
    }
    snapshot
}

fn bench_diff(c: &mut Criterion) {
    let rule = rule();
    let mut group = c.benchmark_group("snapshot_diff");

    for count in [100, 1_000, 10_000] {
        let previous = snapshot(&rule, count, |_| 1_700_000_000_000);
        // every tenth file touched
        let current = snapshot(&rule, count, |i| {
            if i % 10 == 0 {
                1_700_000_001_000
            } else {
                1_700_000_000_000
            }
        });

        group.throughput(Throughput::Elements(count as u64));
        group.bench_with_input(BenchmarkId::new("unchanged", count), &count, |b, _| {
            b.iter(|| diff(black_box(&previous), black_box(&previous), false).unwrap())
        });
        group.bench_with_input(BenchmarkId::new("ten_percent_modified", count), &count, |b, _| {
            b.iter(|| diff(black_box(&previous), black_box(&current), false).unwrap())
        });
    }

    group.finish();
}

criterion_group!(benches, bench_diff);
criterion_main!(benches);

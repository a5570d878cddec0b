use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use clickhouse_backup::archive::{archive_dirs, extract};
use clickhouse_backup::backup::{select_for_freeze, Table};
use std::fs;
use std::io;
use std::path::Path;

// Builds `increments` freezes of `parts` parts each; later increments hard-link the first
fn create_shadow(root: &Path, increments: u32, parts: u32) {
    for part in 0..parts {
        let first = root.join(format!("1/data/sales/orders/all_{part}_{part}_0"));
        fs::create_dir_all(&first).unwrap();
        fs::write(first.join("data.bin"), vec![part as u8; 64 * 1024]).unwrap();
        fs::write(first.join("checksums.txt"), format!("part {part}")).unwrap();

        for increment in 2..=increments {
            let linked = root.join(format!("{increment}/data/sales/orders/all_{part}_{part}_0"));
            fs::create_dir_all(&linked).unwrap();
            for file in ["data.bin", "checksums.txt"] {
                fs::hard_link(first.join(file), linked.join(file)).unwrap();
            }
        }
    }
}

fn benchmark_archive(c: &mut Criterion) {
    let mut group = c.benchmark_group("archive");

    for increments in [1, 4] {
        let dir = tempfile::tempdir().unwrap();
        let shadow = dir.path().join("shadow");
        create_shadow(&shadow, increments, 32);

        group.bench_with_input(
            BenchmarkId::new("archive_to_sink", increments),
            &shadow,
            |b, shadow| b.iter(|| archive_dirs(io::sink(), &[black_box(shadow)]).unwrap()),
        );
    }

    group.finish();
}

fn benchmark_extract(c: &mut Criterion) {
    let dir = tempfile::tempdir().unwrap();
    let shadow = dir.path().join("shadow");
    create_shadow(&shadow, 4, 32);
    let mut tarball = Vec::new();
    archive_dirs(&mut tarball, &[&shadow]).unwrap();

    c.bench_function("extract_with_links", |b| {
        b.iter(|| {
            let out = tempfile::tempdir().unwrap();
            extract(black_box(tarball.as_slice()), out.path()).unwrap()
        })
    });
}

fn benchmark_selection(c: &mut Criterion) {
    let tables: Vec<Table> = (0..1000)
        .map(|i| Table::new(format!("db{}", i % 10), format!("table_{i}")))
        .collect();
    let patterns = vec!["db[1-3].*".to_string(), "*.table_9?".to_string()];

    c.bench_function("select_for_freeze_1000", |b| {
        b.iter(|| select_for_freeze(black_box(&tables), black_box(&patterns)).unwrap())
    });
}

criterion_group!(
    benches,
    benchmark_archive,
    benchmark_extract,
    benchmark_selection
);

criterion_main!(benches);

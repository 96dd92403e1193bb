use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use dirstore::backend::local_backend::Backend;
use dirstore::core::config::{BackendConfig, ImportConfig, IndexConfig, IndexType, RebuildConfig};
use dirstore::core::dn::Dn;
use dirstore::core::entry::Entry;
use dirstore::import::source::VecEntryReader;
use rand::Rng;

const BASE: &str = "dc=example,dc=com";

/// Directory with `count` people spread over ten organizational units
fn create_directory(count: usize) -> Vec<Entry> {
    let mut rng = rand::thread_rng();
    let mut entries = vec![Entry::new(Dn::parse(BASE).unwrap()).with("objectClass", &["domain"])];
    for unit in 0..10 {
        entries.push(
            Entry::new(Dn::parse(&format!("ou=unit{},{}", unit, BASE)).unwrap())
                .with("objectClass", &["organizationalUnit"]),
        );
    }
    for id in 0..count {
        let sn = format!("sn{}", rng.gen_range(0..count / 4 + 1));
        entries.push(
            Entry::new(Dn::parse(&format!("uid=user{},ou=unit{},{}", id, id % 10, BASE)).unwrap())
                .with("objectClass", &["person"])
                .with("cn", &[&format!("user {}", id)])
                .with("sn", &[&sn]),
        );
    }
    entries
}

fn open_backend(dir: &std::path::Path) -> Backend {
    let config = BackendConfig {
        storage_path: dir.join("db"),
        base_dns: vec![BASE.to_string()],
        indexes: vec![
            IndexConfig::new("objectClass", &[IndexType::Equality]),
            IndexConfig::new("cn", &[IndexType::Equality, IndexType::Substring]),
            IndexConfig::new("sn", &[IndexType::Equality, IndexType::Ordering]),
        ],
        entry_cache_size: 0,
        ..BackendConfig::default()
    };
    Backend::open(config).unwrap()
}

/// Benchmark full two-phase imports by thread count
fn bench_import(c: &mut Criterion) {
    let mut group = c.benchmark_group("import");
    group.sample_size(10);
    let entries = create_directory(10_000);

    for threads in [1usize, 2, 4].iter() {
        group.bench_with_input(BenchmarkId::from_parameter(threads), threads, |b, &threads| {
            let dir = tempfile::tempdir().unwrap();
            let backend = open_backend(dir.path());
            let config = ImportConfig { thread_count: threads, ..ImportConfig::default() };
            b.iter(|| {
                let mut reader = VecEntryReader::new(entries.clone());
                backend.import(&config, &mut reader).unwrap();
            });
        });
    }
    group.finish();
}

/// Benchmark rebuilding every index of an imported container
fn bench_rebuild(c: &mut Criterion) {
    let mut group = c.benchmark_group("rebuild");
    group.sample_size(10);
    let dir = tempfile::tempdir().unwrap();
    let backend = open_backend(dir.path());
    backend
        .import(&ImportConfig::default(), &mut VecEntryReader::new(create_directory(10_000)))
        .unwrap();

    group.bench_function("all", |b| {
        let config = RebuildConfig { base_dn: BASE.to_string(), ..RebuildConfig::default() };
        b.iter(|| backend.rebuild(&config).unwrap());
    });
    group.finish();
}

criterion_group!(benches, bench_import, bench_rebuild);
criterion_main!(benches);

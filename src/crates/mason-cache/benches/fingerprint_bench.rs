use criterion::{criterion_group, criterion_main, Criterion};
use mason_cache::{Fingerprint, FingerprintBuilder};
use mason_graph::{Target, TargetKind};

fn bench_fingerprint(c: &mut Criterion) {
    let target = Target::new("//services/api:server", TargetKind::Executable, "rust")
        .with_opt("edition", "2021")
        .with_opt("opt-level", "3");
    let sources: Vec<(String, Vec<u8>)> = (0..16)
        .map(|i| (format!("src/file_{i}.rs"), vec![b'x'; 4096]))
        .collect();
    let deps: Vec<(String, Fingerprint)> = (0..8)
        .map(|i| {
            (
                format!("//lib:dep{i}"),
                Fingerprint::of_bytes(format!("dep{i}").as_bytes()),
            )
        })
        .collect();

    c.bench_function("fingerprint_16_sources_8_deps", |b| {
        b.iter(|| {
            std::hint::black_box(FingerprintBuilder::for_target(&target, &sources, &deps))
        });
    });
}

criterion_group!(benches, bench_fingerprint);
criterion_main!(benches);

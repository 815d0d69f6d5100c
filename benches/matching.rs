use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use tripwire::filter::PatternIndex;
use tripwire::metric::parse_line;
use tripwire::GlobPattern;

fn patterns(n: usize) -> Vec<String> {
    (0..n)
        .map(|i| match i % 4 {
            0 => format!("servers.web{i}.cpu.user"),
            1 => format!("servers.*.disk{i}.used"),
            2 => format!("apps.svc{i}.{{p50,p99}}.latency"),
            _ => format!("dc{i}.rack?.*.temp"),
        })
        .collect()
}

fn bench_glob(c: &mut Criterion) {
    let glob = GlobPattern::parse("servers.*.api.{p50,p99}").unwrap();
    c.bench_function("glob/matches", |b| {
        b.iter(|| glob.matches(black_box("servers.web12.api.p99")));
    });
}

fn bench_index(c: &mut Criterion) {
    let mut group = c.benchmark_group("index");
    for n in [100usize, 1_000, 10_000] {
        let (index, errors) = PatternIndex::build(patterns(n));
        assert!(errors.is_empty());
        group.throughput(Throughput::Elements(1));
        group.bench_with_input(BenchmarkId::new("match_name", n), &index, |b, index| {
            b.iter(|| index.match_name(black_box("servers.web7.disk5.used")));
        });
        group.bench_with_input(BenchmarkId::new("build", n), &n, |b, &n| {
            let raw = patterns(n);
            b.iter(|| PatternIndex::build(raw.iter().map(String::as_str)));
        });
    }
    group.finish();
}

fn bench_parse(c: &mut Criterion) {
    c.bench_function("parse_line", |b| {
        b.iter(|| parse_line(black_box("servers.web1.cpu.user 42.5 1700000000\n")));
    });
}

criterion_group!(benches, bench_glob, bench_index, bench_parse);
criterion_main!(benches);

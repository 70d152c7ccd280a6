use criterion::{black_box, criterion_group, criterion_main, Criterion};
use relm_core::metrics::{align_to_source, csc_compute};

fn chars(s: &str) -> Vec<char> {
    s.chars().collect()
}

fn bench_alignment(c: &mut Criterion) {
    let source = chars("他们在学校读书的时候我今天很高心是不是一个好人");
    let longer = chars("他们在学校里读书的时候我今天真的很高兴是不是一个好人啊");
    let shorter = chars("他们学校读书时候我今天很高兴是一个好人");

    c.bench_function("align_equal_length", |b| {
        b.iter(|| align_to_source(black_box(&source), black_box(&source)));
    });

    c.bench_function("align_insertions", |b| {
        b.iter(|| align_to_source(black_box(&source), black_box(&longer)));
    });

    c.bench_function("align_deletions", |b| {
        b.iter(|| align_to_source(black_box(&source), black_box(&shorter)));
    });
}

fn bench_csc_compute(c: &mut Criterion) {
    let rows = [
        ("我今天很高心", "我今天很高兴", "我今天很高兴"),
        ("他们在学校", "他们在学校", "他门在学校"),
        ("的地得了", "得地的了", "得地得了"),
        ("一个好人", "一个好人", "一个好人"),
    ];
    let mut sources = Vec::new();
    let mut targets = Vec::new();
    let mut predictions = Vec::new();
    for _ in 0..250 {
        for (s, t, p) in rows {
            sources.push(chars(s));
            targets.push(chars(t));
            predictions.push(chars(p));
        }
    }

    c.bench_function("csc_compute_1000", |b| {
        b.iter(|| csc_compute(black_box(&sources), black_box(&targets), black_box(&predictions)).unwrap());
    });
}

criterion_group!(benches, bench_alignment, bench_csc_compute);
criterion_main!(benches);

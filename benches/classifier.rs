use criterion::{black_box, criterion_group, criterion_main, Criterion};

use redprobe::refusal::RefusalClassifier;

fn bench_classifier(c: &mut Criterion) {
    let classifier = RefusalClassifier::builtin();

    let refusal = "I'm sorry, but I can't help with that request.";
    let benign_short = "Sure, here is the summary you asked for.";
    let benign_long = "The quarterly numbers show steady growth across all regions. "
        .repeat(200);
    let late_refusal = format!("{benign_long} Unfortunately I must decline to continue.");

    c.bench_function("classify_refusal_short", |b| {
        b.iter(|| classifier.classify(black_box(refusal)))
    });
    c.bench_function("classify_benign_short", |b| {
        b.iter(|| classifier.classify(black_box(benign_short)))
    });
    c.bench_function("classify_benign_long", |b| {
        b.iter(|| classifier.classify(black_box(&benign_long)))
    });
    c.bench_function("classify_refusal_late", |b| {
        b.iter(|| classifier.classify(black_box(&late_refusal)))
    });
}

criterion_group!(benches, bench_classifier);
criterion_main!(benches);

//! Benchmarks for Stormweaver's consistency checker and recorder
//!
//! Run with: cargo bench -p stormweaver-core
//!
//! These benchmarks establish performance baselines for:
//! - Invariant evaluation over growing outcome streams
//! - Outcome serialization (the JSONL record format)
//! - Seeded value generation

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use stormweaver_core::{
    evaluate, Action, ActionRequest, Invariant, InvariantRule, Measure, Outcome, Rows, WorkloadRng,
};

fn outcomes(workers: u32, per_worker: u64) -> Vec<Outcome> {
    let mut outcomes = Vec::new();
    for worker in 1..=workers {
        for sequence in 1..=per_worker {
            let tag = if sequence % 2 == 0 { "select" } else { "insert" };
            let action = Action {
                worker,
                sequence,
                backend: "main".into(),
                request: ActionRequest::new("SELECT ?")
                    .with_params(vec![(sequence as i64).into()])
                    .with_tag(tag),
            };
            outcomes.push(
                Outcome::for_action("bench", &action, String::new()).with_rows(&Rows::affected(1)),
            );
        }
    }
    outcomes
}

fn invariants() -> Vec<Invariant> {
    vec![
        Invariant::sequence_integrity(),
        Invariant::balance("inserted == selected", "insert", "select", Measure::Count)
            .expect("valid invariant"),
        Invariant::new("no errors", InvariantRule::NoErrors { tag: None })
            .expect("valid invariant"),
    ]
}

// ============================================================================
// Evaluation Benchmarks
// ============================================================================

fn bench_evaluate(c: &mut Criterion) {
    let mut group = c.benchmark_group("evaluate");
    let invariants = invariants();

    for total in [100u64, 1_000, 10_000] {
        let stream = outcomes(10, total / 10);
        group.throughput(Throughput::Elements(total));
        group.bench_with_input(BenchmarkId::from_parameter(total), &stream, |b, stream| {
            b.iter(|| black_box(evaluate(&invariants, stream)))
        });
    }

    group.finish();
}

fn bench_evaluate_reversed(c: &mut Criterion) {
    let invariants = invariants();
    let mut stream = outcomes(10, 100);
    stream.reverse();

    c.bench_function("evaluate_reversed_1000", |b| {
        b.iter(|| black_box(evaluate(&invariants, &stream)))
    });
}

// ============================================================================
// Record Format Benchmarks
// ============================================================================

fn bench_outcome_serialization(c: &mut Criterion) {
    let mut group = c.benchmark_group("outcome_record");
    let outcome = outcomes(1, 1).remove(0);
    let line = serde_json::to_string(&outcome).expect("serializable");

    group.bench_function("to_json_line", |b| {
        b.iter(|| black_box(serde_json::to_string(&outcome).expect("serializable")))
    });
    group.bench_function("from_json_line", |b| {
        b.iter(|| black_box(serde_json::from_str::<Outcome>(&line).expect("parseable")))
    });

    group.finish();
}

// ============================================================================
// Randomness Benchmarks
// ============================================================================

fn bench_rng(c: &mut Criterion) {
    let mut group = c.benchmark_group("workload_rng");

    group.bench_function("int_range", |b| {
        let mut rng = WorkloadRng::new(42);
        b.iter(|| black_box(rng.int_range(0, 1_000_000)))
    });
    group.bench_function("alphanumeric_8_32", |b| {
        let mut rng = WorkloadRng::new(42);
        b.iter(|| black_box(rng.alphanumeric(8, 32)))
    });
    group.bench_function("weighted_index_10", |b| {
        let mut rng = WorkloadRng::new(42);
        let weights: Vec<u64> = (1..=10).collect();
        b.iter(|| black_box(rng.weighted_index(&weights)))
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_evaluate,
    bench_evaluate_reversed,
    bench_outcome_serialization,
    bench_rng,
);

criterion_main!(benches);

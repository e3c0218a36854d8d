//! Compiler pipeline benchmarks using criterion.
//!
//! Measures effect analysis, full compilation and execution on both backends
//! for a program whose loop performs one operation per iteration.
//!
//! Run with: cargo bench --bench pipeline_bench

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use rill_runtime::{HandlerCall, HandlerError, ResumeKind, RunnerConfig, WireValue};
use rillc::config::{Backend, CompilerConfig};
use rillc::driver;
use rillc::effects;
use rillc::hir::{FnBuilder, OpRef, Program, ProgramBuilder, Type};

/// `count(n)` sums `perform Tick.tick(i)` for `i` in `0..n`.
fn count_program() -> Program {
    let mut b = ProgramBuilder::new();
    let tick = b.effect(
        "Tick",
        vec![ProgramBuilder::op("tick", vec![Type::I32], Type::I32, ResumeKind::Tail)],
    );
    let op = OpRef::new(tick, 0);
    let count = b.function("count", &[("n", Type::I32)], Type::I32, |f| {
        let i = f.local("i", Type::I32);
        let acc = f.local("acc", Type::I32);
        let zero = f.i32(0);
        let zero2 = f.i32(0);
        let read_i = f.var(i);
        let read_n = f.var(f.param(0));
        let cond = f.lt(read_i, read_n);
        let arg = f.var(i);
        let ticked = f.perform(op, vec![arg]);
        let read_acc = f.var(acc);
        let sum = f.add(read_acc, ticked);
        let bump_acc = f.assign(acc, sum);
        let read_i2 = f.var(i);
        let one = f.i32(1);
        let next = f.add(read_i2, one);
        let bump_i = f.assign(i, next);
        let body = f.block(vec![FnBuilder::stmt(bump_acc), FnBuilder::stmt(bump_i)], None);
        let looped = f.while_(cond, body);
        let result = f.var(acc);
        f.block(
            vec![FnBuilder::let_(i, zero), FnBuilder::let_(acc, zero2), FnBuilder::stmt(looped)],
            Some(result),
        )
    });
    b.export(count);
    b.finish()
}

fn echo(call: &HandlerCall) -> Result<WireValue, HandlerError> {
    call.args.first().copied().ok_or_else(|| HandlerError("no argument".into()))
}

/// Benchmark the static passes
fn bench_compile(c: &mut Criterion) {
    let mut group = c.benchmark_group("compile");
    let program = count_program();
    let config = CompilerConfig::default();

    group.bench_function("analyze", |b| {
        b.iter(|| black_box(effects::analyze(&program, &config)));
    });
    group.bench_function("compile", |b| {
        b.iter(|| black_box(driver::compile(&program, &config).unwrap()));
    });

    group.finish();
}

/// Benchmark one host round trip per loop iteration on each backend
fn bench_execute(c: &mut Criterion) {
    let mut group = c.benchmark_group("execute");
    let program = count_program();
    let runner = RunnerConfig::default();

    for backend in [Backend::Interp, Backend::Structural] {
        let config = CompilerConfig::builder().backend(backend).build().unwrap();
        for n in [1i32, 64] {
            group.bench_with_input(BenchmarkId::new(backend.to_string(), n), &n, |b, &n| {
                b.iter(|| {
                    black_box(
                        driver::execute(&program, &config, &runner, "count", &[WireValue::I32(n)], echo).unwrap(),
                    )
                });
            });
        }
    }

    group.finish();
}

criterion_group!(benches, bench_compile, bench_execute);
criterion_main!(benches);
